// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

use skald_model::ToolSchema;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier from the model (forwarded verbatim)
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments
    pub args: Value,
}

/// The result of executing a tool.  Always a string: failures are captured
/// into `content` with `is_error` set, never thrown into the turn loop.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    pub content: String,
    pub is_error: bool,
    pub duration: Duration,
}

impl ToolOutput {
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: false,
            duration: Duration::ZERO,
        }
    }

    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: msg.into(),
            is_error: true,
            duration: Duration::ZERO,
        }
    }
}

/// A callable tool.  Implementations live outside the core; the loop only
/// routes calls through this contract.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema of the parameters object
    fn parameters_schema(&self) -> Value;
    /// Listen-only tools (inbox polls, clock checks) do not count as
    /// activity for idle-violation purposes and do not wake a sleeping agent.
    fn listen_only(&self) -> bool {
        false
    }
    async fn call(&self, args: Value) -> anyhow::Result<String>;
}

/// Central registry holding all available tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn is_listen_only(&self, name: &str) -> bool {
        self.tools.get(name).map(|t| t.listen_only()).unwrap_or(false)
    }

    /// Function-call schemas for every registered tool, name-sorted so the
    /// serialized request is stable across runs.
    pub fn definitions(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Execute one call, timing it and capturing any failure as text.
    pub async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let started = Instant::now();
        let mut output = match self.tools.get(&call.name) {
            Some(tool) => match tool.call(call.args.clone()).await {
                Ok(content) => ToolOutput::ok(&call.id, content),
                Err(e) => ToolOutput::err(&call.id, format!("tool '{}' failed: {e}", call.name)),
            },
            None => ToolOutput::err(&call.id, format!("unknown tool: {}", call.name)),
        };
        output.duration = started.elapsed();
        output
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
