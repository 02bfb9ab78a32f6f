// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::{ChatRequest, ResponseEvent};

pub type ResponseStream = Pin<Box<dyn Stream<Item = anyhow::Result<ResponseEvent>> + Send>>;

/// A chat transport.  The core consumes this contract and never talks HTTP
/// itself; concrete network drivers live outside this workspace and plug in
/// here.  The in-tree implementations are the deterministic mocks.
///
/// Drivers MUST stream: text arrives as incremental [`ResponseEvent::TextDelta`]
/// events so the marker parser can extract control markers that split across
/// chunk boundaries.  Retry of transient provider failures (429/5xx) happens
/// inside the driver; errors surface here only once retries are exhausted.
#[async_trait]
pub trait ChatDriver: Send + Sync {
    /// Provider identifier for status display and tier resolution.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Send a completion request and return a streaming response.
    async fn chat(&self, req: ChatRequest) -> anyhow::Result<ResponseStream>;

    /// Context window size for this driver/model combination, when known.
    fn context_window(&self) -> Option<u32> {
        crate::catalog::lookup(self.name(), self.model_name()).map(|e| e.context_window)
    }
}
