// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use skald_config::{Config, MemoryMode};
use skald_core::{AgentEvent, JsonSessionStore, SessionStore, ToolRegistry, TurnLoop};
use skald_memory::{
    AgentMemory, DriverSummarizer, PageStore, PlainMemory, SensoryMemory, StatusBoard, Summarizer,
    VirtualMemory,
};
use skald_model::{ChatDriver, MockDriver};
use skald_supervisor::{Supervisor, WarmLink, EXIT_RELOAD, EXIT_ROLLBACK};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    std::process::exit(real_main(cli).await);
}

fn init_logging(verbose: bool) {
    let verbose = verbose || std::env::var("SKALD_VERBOSE").map(|v| v == "1").unwrap_or(false);
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn real_main(cli: Cli) -> i32 {
    let config = match load_config(&cli) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            // config_error: aborts startup only.
            eprintln!("\x1b[31merror:\x1b[0m {e:#}");
            return 1;
        }
    };

    if let Some(cmd) = &cli.command {
        return match cmd {
            Commands::ShowConfig => {
                println!("{}", serde_yaml::to_string(config.as_ref()).unwrap_or_default());
                0
            }
            Commands::Sessions => {
                let store = JsonSessionStore::new(session_dir(&config));
                for meta in store.list() {
                    println!("{}  {}  {} messages", meta.updated_at, meta.id, meta.message_count);
                }
                0
            }
            Commands::ListModels => {
                for entry in skald_model::catalog::static_catalog() {
                    println!("{:<12} {:<6} {}", entry.provider, entry.tier, entry.id);
                }
                0
            }
        };
    }

    if cli.supervised {
        let exe = match std::env::current_exe() {
            Ok(p) => p.to_string_lossy().into_owned(),
            Err(e) => {
                eprintln!("\x1b[31merror:\x1b[0m cannot locate own binary: {e}");
                return 1;
            }
        };
        let mut command = Cli::worker_argv();
        command[0] = exe;
        return Supervisor::new(config.supervisor.clone(), command).run().await;
    }

    run_worker(cli, config).await
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = skald_config::load(cli.config.as_deref())?;
    if let Some(model) = &cli.model {
        config.model.name = Some(model.clone());
    }
    if let Some(cap) = &cli.max_tier {
        config.model.max_tier = Some(cap.clone());
    }
    if let Some(mode) = cli.memory {
        config.memory.mode = mode;
    }
    if cli.persistent {
        config.agent.persistent = true;
    }
    Ok(config)
}

fn session_dir(config: &Config) -> PathBuf {
    config
        .session
        .dir
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("skald/sessions")
        })
}

/// Pick the initial driver: first preferred provider with a bundled driver,
/// falling back to the mock.  The tier ladder may replace it per round.
fn initial_driver(config: &Config) -> Arc<dyn ChatDriver> {
    for provider in &config.model.providers {
        if let Ok(d) = skald_model::from_provider(provider, "") {
            return d;
        }
    }
    warn!("no driver available for any preferred provider; using mock");
    Arc::new(MockDriver)
}

async fn run_worker(cli: Cli, config: Arc<Config>) -> i32 {
    let board = StatusBoard::default();
    let driver = initial_driver(&config);
    let summarizer: Arc<dyn Summarizer> = Arc::new(DriverSummarizer::new(driver.clone()));

    let memory_factory = {
        let config = config.clone();
        let summarizer = summarizer.clone();
        Box::new(move |mode: MemoryMode| -> Box<dyn AgentMemory> {
            match mode {
                MemoryMode::Plain => {
                    Box::new(PlainMemory::new(config.memory.working_memory_tokens))
                }
                MemoryMode::Virtual => {
                    let store = match &config.memory.page_dir {
                        Some(dir) => PageStore::with_dir(PathBuf::from(dir)),
                        None => PageStore::new(),
                    };
                    Box::new(VirtualMemory::new(
                        config.memory.clone(),
                        store,
                        summarizer.clone(),
                    ))
                }
            }
        })
    };

    let inner = memory_factory(config.memory.mode);
    let memory = SensoryMemory::new(inner, &config.sensory, board.clone());
    let session_store: Arc<dyn SessionStore> = Arc::new(JsonSessionStore::new(session_dir(&config)));
    let tools = Arc::new(ToolRegistry::new());

    let mut agent = TurnLoop::new(
        config.clone(),
        memory,
        driver,
        skald_model::default_factory(),
        tools,
        session_store,
        board,
    )
    .with_memory_factory(memory_factory);

    // Supervised processes connect back for the warm-state handshake.
    let handshake = Duration::from_millis(config.supervisor.handshake_timeout_ms);
    let mut shutdown = None;
    let mut link_arc = None;
    if let Some((link, warm)) = WarmLink::connect_from_env(handshake).await {
        shutdown = Some(link.shutdown_signal());
        let link = Arc::new(link);
        agent = agent.with_snapshot_sink(link.clone());
        link_arc = Some(link);
        if let Some(state) = warm {
            if let Err(e) = agent.restore_warm_state(state) {
                // Rolling back makes the supervisor discard the snapshot so
                // the next start is a genuine cold start.
                eprintln!("\x1b[31merror:\x1b[0m warm restore failed: {e:#}");
                return EXIT_ROLLBACK;
            }
        }
    }

    if let Some(prompt) = cli.prompt.clone() {
        return run_turn(&mut agent, &prompt, link_arc.as_deref()).await;
    }

    // Interactive: one turn per stdin line; errors print and return to the
    // prompt, a reload request ends the process with code 75.
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    loop {
        print!("> ");
        let _ = std::io::stdout().flush();
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = wait_shutdown(&mut shutdown) => {
                return 0;
            }
        };
        match line {
            Ok(Some(line)) if !line.trim().is_empty() => {
                let code = run_turn(&mut agent, line.trim(), link_arc.as_deref()).await;
                if code == EXIT_RELOAD {
                    return code;
                }
            }
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return 0,
        }
    }
}

async fn wait_shutdown(shutdown: &mut Option<tokio::sync::watch::Receiver<bool>>) {
    match shutdown {
        Some(rx) => {
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
        None => std::future::pending().await,
    }
}

async fn run_turn(agent: &mut TurnLoop, prompt: &str, link: Option<&WarmLink>) -> i32 {
    let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                AgentEvent::TextDelta(t) => {
                    print!("{t}");
                    let _ = std::io::stdout().flush();
                }
                AgentEvent::TurnComplete => println!(),
                AgentEvent::Error(e) => eprintln!("\x1b[31merror:\x1b[0m {e}"),
                _ => {}
            }
        }
    });

    let result = agent.submit(prompt, tx).await;
    let _ = printer.await;

    if agent.take_reboot_request() {
        if let Some(link) = link {
            use skald_core::SnapshotSink;
            if let Err(e) = link.request_reload(&agent.warm_state()).await {
                warn!(error = %e, "reload request failed");
            }
        }
        return EXIT_RELOAD;
    }

    match result {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("\x1b[31merror:\x1b[0m {e:#}");
            1
        }
    }
}
