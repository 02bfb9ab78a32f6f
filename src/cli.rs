// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use skald_config::MemoryMode;

/// skald — a provider-agnostic LLM agent runtime with virtual memory for
/// conversation history.
///
/// With a PROMPT argument skald runs one turn and exits (non-zero on
/// failure).  Without one it reads turns from stdin.  `--supervised` wraps
/// the run in the warm-restart supervisor: a crashed or rebooting worker is
/// restarted with its conversation and runtime state intact.
#[derive(Parser, Debug)]
#[command(name = "skald", version, about)]
pub struct Cli {
    /// One-shot prompt; omit for interactive stdin mode.
    pub prompt: Option<String>,

    /// Explicit config file (merged over the discovered layers).
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Model id or catalog alias; sets the tier-ladder floor.
    #[arg(long, short = 'm')]
    pub model: Option<String>,

    /// Tier-ladder cap: low | mid | high.
    #[arg(long)]
    pub max_tier: Option<String>,

    /// Memory implementation override.
    #[arg(long, value_enum)]
    pub memory: Option<MemoryMode>,

    /// Keep nudging the model to act through tools instead of ending the
    /// turn after a text-only response.
    #[arg(long)]
    pub persistent: bool,

    /// Run under the warm-restart supervisor.
    #[arg(long)]
    pub supervised: bool,

    /// Verbose logging to stderr (also honoured via SKALD_VERBOSE=1).
    #[arg(long, short = 'v')]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the effective merged configuration and exit.
    ShowConfig,
    /// List stored sessions, newest first.
    Sessions,
    /// List the model catalog with tiers.
    ListModels,
}

impl Cli {
    /// The argv used to re-spawn this invocation as a supervised worker:
    /// everything except the `--supervised` flag itself.
    pub fn worker_argv() -> Vec<String> {
        std::env::args().filter(|a| a != "--supervised").collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
