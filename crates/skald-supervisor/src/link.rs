// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Worker side of the warm-state handshake.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use skald_core::{SnapshotSink, WarmState};

use crate::protocol::{read_frame, write_frame, SupervisorMessage, WorkerMessage, SOCKET_ENV};

/// The worker's connection to its supervisor.
///
/// Sends `ready` on connect; the supervisor replies with `warm_state` within
/// the handshake window when it holds a usable snapshot, otherwise the
/// worker cold-starts.  Afterwards the link carries best-effort snapshots
/// outward and watches for `shutdown` inward.
pub struct WarmLink {
    writer: Mutex<OwnedWriteHalf>,
    shutdown: watch::Receiver<bool>,
}

impl WarmLink {
    /// Connect using `SKALD_SUPERVISOR_SOCK`.  Returns `None` when the
    /// process is unsupervised (no env var, or the socket is unreachable).
    /// The second tuple element is the warm snapshot, when one was offered
    /// and its version matches.
    pub async fn connect_from_env(
        handshake_timeout: Duration,
    ) -> Option<(WarmLink, Option<WarmState>)> {
        let path = std::env::var(SOCKET_ENV).ok()?;
        let stream = match UnixStream::connect(&path).await {
            Ok(s) => s,
            Err(e) => {
                warn!(%path, error = %e, "supervisor socket unreachable; running unsupervised");
                return None;
            }
        };
        let (mut reader, mut writer) = stream.into_split();

        if let Err(e) = write_frame(&mut writer, &WorkerMessage::Ready).await {
            warn!(error = %e, "handshake send failed; running unsupervised");
            return None;
        }

        let warm = match tokio::time::timeout(
            handshake_timeout,
            read_frame::<_, SupervisorMessage>(&mut reader),
        )
        .await
        {
            Ok(Ok(SupervisorMessage::WarmState { payload })) => {
                if payload.version_matches() {
                    info!(session = %payload.session_id, "warm state received");
                    Some(payload)
                } else {
                    warn!(version = payload.version, "warm state version mismatch; cold start");
                    None
                }
            }
            Ok(Ok(SupervisorMessage::Shutdown)) => {
                info!("supervisor requested shutdown during handshake");
                std::process::exit(0);
            }
            Ok(Err(e)) => {
                debug!(error = %e, "handshake read failed; cold start");
                None
            }
            Err(_) => {
                debug!("no warm state within handshake window; cold start");
                None
            }
        };

        // Watch the inbound half for shutdown requests.
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            loop {
                match read_frame::<_, SupervisorMessage>(&mut reader).await {
                    Ok(SupervisorMessage::Shutdown) => {
                        let _ = shutdown_tx.send(true);
                        break;
                    }
                    Ok(SupervisorMessage::WarmState { .. }) => {
                        debug!("unexpected warm_state outside handshake; ignored");
                    }
                    Err(_) => break,
                }
            }
        });

        Some((
            WarmLink {
                writer: Mutex::new(writer),
                shutdown: shutdown_rx,
            },
            warm,
        ))
    }

    /// A receiver that flips to `true` when the supervisor asks us to stop.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.clone()
    }
}

#[async_trait]
impl SnapshotSink for WarmLink {
    async fn send_snapshot(&self, state: &WarmState) -> anyhow::Result<()> {
        let mut writer = self.writer.lock().await;
        write_frame(
            &mut *writer,
            &WorkerMessage::StateSnapshot {
                payload: state.clone(),
            },
        )
        .await
    }

    async fn request_reload(&self, state: &WarmState) -> anyhow::Result<()> {
        let mut writer = self.writer.lock().await;
        write_frame(
            &mut *writer,
            &WorkerMessage::ReloadRequest {
                payload: state.clone(),
            },
        )
        .await
    }
}
