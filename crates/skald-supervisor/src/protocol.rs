// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Wire protocol between supervisor and worker: length-prefixed JSON frames
//! over a unix socket.  The socket path reaches the worker through the
//! `SKALD_SUPERVISOR_SOCK` environment variable.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use skald_core::WarmState;

pub const SOCKET_ENV: &str = "SKALD_SUPERVISOR_SOCK";

/// Upper bound on one frame.  Warm states are bounded by the working budget
/// plus page store, so anything larger is a protocol error, not data.
pub const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// Worker → supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// First message after connect.
    Ready,
    /// Best-effort periodic snapshot (turn boundaries).
    StateSnapshot { payload: WarmState },
    /// Deliberate reboot: store this snapshot, worker exits with code 75.
    ReloadRequest { payload: WarmState },
}

/// Supervisor → worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorMessage {
    /// Handshake reply when a snapshot is held; absent within the handshake
    /// window means cold start.
    WarmState { payload: WarmState },
    /// Graceful stop; SIGKILL follows after the grace period.
    Shutdown,
}

/// Write one message as a 4-byte big-endian length prefix plus JSON body.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    let len = u32::try_from(body.len())?;
    anyhow::ensure!(len <= MAX_FRAME_BYTES, "frame too large: {len} bytes");
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON message.
pub async fn read_frame<R, T>(reader: &mut R) -> anyhow::Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    anyhow::ensure!(len <= MAX_FRAME_BYTES, "frame too large: {len} bytes");
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
