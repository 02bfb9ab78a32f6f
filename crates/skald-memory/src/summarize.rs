// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;

use skald_model::{ChatDriver, ChatRequest, Message, MessageContent, ResponseEvent, Role};

const SUMMARIZE_PROMPT: &str =
    "You are a context compaction assistant. Summarise the following conversation span \
     in a concise, information-dense way. Preserve all technical details, decisions, file \
     names, code snippets, and tool outputs that may be relevant to future work. \
     The summary will replace the original span to free up context space.";

/// Summarization capability injected into virtual memory at construction.
///
/// Memory never owns a driver: the capability object does, which breaks the
/// memory↔driver cycle and lets tests substitute deterministic summaries.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, transcript: &str, label: &str) -> anyhow::Result<String>;
}

/// Production summarizer: one tool-less driver call per victim span.
pub struct DriverSummarizer {
    driver: Arc<dyn ChatDriver>,
}

impl DriverSummarizer {
    pub fn new(driver: Arc<dyn ChatDriver>) -> Self {
        Self { driver }
    }
}

#[async_trait]
impl Summarizer for DriverSummarizer {
    async fn summarize(&self, transcript: &str, label: &str) -> anyhow::Result<String> {
        let req = ChatRequest {
            messages: vec![
                Message::system(SUMMARIZE_PROMPT),
                Message::user(format!("[span lane: {label}]\n\n{transcript}")),
            ],
            ..Default::default()
        };
        let mut stream = self.driver.chat(req).await?;
        let mut summary = String::new();
        while let Some(event) = stream.next().await {
            match event? {
                ResponseEvent::TextDelta(t) => summary.push_str(&t),
                ResponseEvent::Done => break,
                _ => {}
            }
        }
        if summary.trim().is_empty() {
            anyhow::bail!("summarizer returned empty text");
        }
        Ok(summary)
    }
}

/// Fixed-output summarizer for tests.
pub struct StaticSummarizer(pub String);

#[async_trait]
impl Summarizer for StaticSummarizer {
    async fn summarize(&self, _transcript: &str, _label: &str) -> anyhow::Result<String> {
        Ok(self.0.clone())
    }
}

/// A summarizer that always fails; exercises the abort-and-retry and forced
/// fallback paths.
pub struct UnavailableSummarizer;

#[async_trait]
impl Summarizer for UnavailableSummarizer {
    async fn summarize(&self, _transcript: &str, _label: &str) -> anyhow::Result<String> {
        anyhow::bail!("summarizer unavailable")
    }
}

/// Serialise a message span into plain text for the compaction prompt.
pub fn serialize_span(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::Tool => "Tool",
                Role::System => "System",
            };
            let text = match &m.content {
                MessageContent::Text(t) => t.clone(),
                MessageContent::ToolCall { function, .. } => {
                    format!("[tool_call: {}({})]", function.name, function.arguments)
                }
                MessageContent::ToolResult { content, .. } => {
                    format!("[tool_result: {content}]")
                }
            };
            format!("{role}: {text}")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use skald_model::ScriptedMockDriver;

    #[test]
    fn serialize_span_includes_roles_and_content() {
        let text = serialize_span(&[
            Message::user("what is rust?"),
            Message::assistant("a systems language"),
        ]);
        assert!(text.contains("User: what is rust?"));
        assert!(text.contains("Assistant: a systems language"));
    }

    #[test]
    fn serialize_span_renders_tool_plumbing() {
        let text = serialize_span(&[
            Message::tool_call("id1", "shell", r#"{"command":"ls"}"#),
            Message::tool_result("id1", "file1.txt"),
        ]);
        assert!(text.contains("shell"));
        assert!(text.contains("file1.txt"));
    }

    #[tokio::test]
    async fn driver_summarizer_collects_streamed_text() {
        let driver = Arc::new(ScriptedMockDriver::always_text("a dense summary"));
        let s = DriverSummarizer::new(driver);
        let out = s.summarize("User: hello", "user").await.unwrap();
        assert_eq!(out, "a dense summary");
    }

    #[tokio::test]
    async fn driver_summarizer_sends_span_to_driver() {
        let driver = Arc::new(ScriptedMockDriver::always_text("ok"));
        let s = DriverSummarizer::new(driver.clone());
        s.summarize("User: remember the port is 8443", "user")
            .await
            .unwrap();
        let req = driver.last_request.lock().unwrap().clone().unwrap();
        let joined: String = req
            .messages
            .iter()
            .filter_map(|m| m.as_text().map(str::to_string))
            .collect();
        assert!(joined.contains("8443"));
    }

    #[tokio::test]
    async fn empty_summary_is_an_error() {
        let driver = Arc::new(ScriptedMockDriver::always_text("   "));
        let s = DriverSummarizer::new(driver);
        assert!(s.summarize("User: x", "user").await.is_err());
    }

    #[tokio::test]
    async fn unavailable_summarizer_errors() {
        assert!(UnavailableSummarizer.summarize("x", "user").await.is_err());
    }
}
