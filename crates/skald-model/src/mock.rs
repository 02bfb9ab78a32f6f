// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{driver::ResponseStream, ChatDriver, ChatRequest, ResponseEvent};

/// Deterministic mock driver for tests.  Echoes the last user message back
/// as the assistant response.
#[derive(Default)]
pub struct MockDriver;

#[async_trait]
impl ChatDriver for MockDriver {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-mid"
    }

    async fn chat(&self, req: ChatRequest) -> anyhow::Result<ResponseStream> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, crate::Role::User))
            .and_then(|m| m.as_text())
            .unwrap_or("[no input]")
            .to_string();

        let events: Vec<anyhow::Result<ResponseEvent>> = vec![
            Ok(ResponseEvent::TextDelta(format!("MOCK: {reply}"))),
            Ok(ResponseEvent::Usage {
                input_tokens: 10,
                output_tokens: 10,
                cache_read_tokens: 0,
                cache_write_tokens: 0,
            }),
            Ok(ResponseEvent::Done),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// A pre-scripted mock driver.  Each call to `chat` pops the next response
/// script from the front of the queue.  This lets tests specify exact event
/// sequences – including tool calls and deliberately split text chunks for
/// the marker parser – without network access.
pub struct ScriptedMockDriver {
    scripts: Arc<Mutex<Vec<Vec<ResponseEvent>>>>,
    name: String,
    /// The last `ChatRequest` seen by this driver.  Written on each `chat()`
    /// call so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<ChatRequest>>>,
    /// Every `ChatRequest` seen, in order.
    pub requests: Arc<Mutex<Vec<ChatRequest>>>,
}

impl ScriptedMockDriver {
    /// Build a driver from a list of response scripts.  The outer `Vec` is
    /// the ordered list of calls; the inner `Vec` is the event sequence
    /// emitted for that call.
    pub fn new(scripts: Vec<Vec<ResponseEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            name: "mock".into(),
            last_request: Arc::new(Mutex::new(None)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Convenience: driver that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let r = reply.into();
        Self::new(vec![Self::text_script(r)])
    }

    /// One call's worth of events for a plain text reply.
    pub fn text_script(reply: impl Into<String>) -> Vec<ResponseEvent> {
        vec![
            ResponseEvent::TextDelta(reply.into()),
            ResponseEvent::Usage {
                input_tokens: 5,
                output_tokens: 5,
                cache_read_tokens: 0,
                cache_write_tokens: 0,
            },
            ResponseEvent::Done,
        ]
    }

    /// One call's worth of events streaming `chunks` as separate text deltas.
    /// Used to exercise marker extraction across chunk boundaries.
    pub fn chunked_script(chunks: &[&str]) -> Vec<ResponseEvent> {
        let mut events: Vec<ResponseEvent> = chunks
            .iter()
            .map(|c| ResponseEvent::TextDelta((*c).to_string()))
            .collect();
        events.push(ResponseEvent::Done);
        events
    }

    /// One call's worth of events for a single tool call.
    pub fn tool_call_script(
        id: impl Into<String>,
        name: impl Into<String>,
        args_json: impl Into<String>,
    ) -> Vec<ResponseEvent> {
        vec![
            ResponseEvent::ToolCall {
                index: 0,
                id: id.into(),
                name: name.into(),
                arguments: args_json.into(),
            },
            ResponseEvent::Done,
        ]
    }

    /// Convenience: driver that returns a tool call followed by a text reply.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            Self::tool_call_script(tool_id, tool_name, args_json),
            Self::text_script(final_text),
        ])
    }
}

#[async_trait]
impl ChatDriver for ScriptedMockDriver {
    fn name(&self) -> &str {
        &self.name
    }
    fn model_name(&self) -> &str {
        "mock-mid"
    }

    async fn chat(&self, req: ChatRequest) -> anyhow::Result<ResponseStream> {
        *self.last_request.lock().unwrap() = Some(req.clone());
        self.requests.lock().unwrap().push(req);
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed
                vec![
                    ResponseEvent::TextDelta("[no more scripts]".into()),
                    ResponseEvent::Done,
                ]
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<anyhow::Result<ResponseEvent>> = events.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

/// A driver whose every call fails.  Exercises summarizer-failure and
/// provider-error paths.
pub struct FailingMockDriver;

#[async_trait]
impl ChatDriver for FailingMockDriver {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-mid"
    }

    async fn chat(&self, _req: ChatRequest) -> anyhow::Result<ResponseStream> {
        anyhow::bail!("mock driver failure")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
