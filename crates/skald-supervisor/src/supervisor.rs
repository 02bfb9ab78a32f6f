// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The supervisor: forks the worker, holds the latest warm snapshot, and
//! restarts on crash or deliberate reload without losing conversation state.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::net::{UnixListener, UnixStream};
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use skald_config::SupervisorConfig;
use skald_core::WarmState;

use crate::protocol::{read_frame, write_frame, SupervisorMessage, WorkerMessage, SOCKET_ENV};

/// Worker exit codes with supervisor-visible meaning.
pub const EXIT_CLEAN: i32 = 0;
pub const EXIT_RELOAD: i32 = 75;
pub const EXIT_ROLLBACK: i32 = 96;

enum ChildOutcome {
    /// Worker finished cleanly; supervisor exits too.
    Clean,
    /// Restart with the held snapshot.
    Restart,
    /// Discard the snapshot, restart cold.
    RestartCold,
    /// External signal: worker already stopped, propagate this code.
    ShuttingDown(i32),
}

pub struct Supervisor {
    config: SupervisorConfig,
    /// Worker program and arguments.
    command: Vec<String>,
    snapshot: Option<WarmState>,
    restarts: u32,
    recent_exits: VecDeque<Instant>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, command: Vec<String>) -> Self {
        Self {
            config,
            command,
            snapshot: None,
            restarts: 0,
            recent_exits: VecDeque::new(),
        }
    }

    /// Run until the worker exits cleanly, the crash-loop guard trips, or
    /// the restart cap is hit.  Returns the supervisor's exit code.
    pub async fn run(mut self) -> i32 {
        let sock_dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "cannot create socket dir");
                return 1;
            }
        };
        let sock_path = sock_dir.path().join("warm.sock");
        let listener = match UnixListener::bind(&sock_path) {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "cannot bind supervisor socket");
                return 1;
            }
        };

        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cannot install signal handler");
                return 1;
            }
        };
        let mut sigterm = signal(SignalKind::terminate()).expect("signal registration");
        let mut sighup = signal(SignalKind::hangup()).expect("signal registration");

        loop {
            match self
                .run_one_child(&sock_path, &listener, &mut sigint, &mut sigterm, &mut sighup)
                .await
            {
                Ok(ChildOutcome::Clean) => return EXIT_CLEAN,
                Ok(ChildOutcome::ShuttingDown(code)) => return code,
                Ok(ChildOutcome::Restart) => {}
                Ok(ChildOutcome::RestartCold) => {
                    self.snapshot = None;
                }
                Err(e) => {
                    warn!(error = %e, "supervisor failure");
                    return 1;
                }
            }

            // Crash-loop guard: too many exits within the window means the
            // worker will not stabilise — give up rather than spin.
            let now = Instant::now();
            self.recent_exits.push_back(now);
            while let Some(front) = self.recent_exits.front() {
                if now.duration_since(*front) > Duration::from_millis(self.config.crash_window_ms) {
                    self.recent_exits.pop_front();
                } else {
                    break;
                }
            }
            if self.recent_exits.len() >= self.config.crash_exits as usize {
                warn!(
                    exits = self.recent_exits.len(),
                    window_ms = self.config.crash_window_ms,
                    "crash loop detected; giving up"
                );
                return 1;
            }

            self.restarts += 1;
            if self.restarts > self.config.max_restarts {
                warn!(restarts = self.restarts, "restart cap reached; giving up");
                return 1;
            }
            info!(
                restart = self.restarts,
                warm = self.snapshot.is_some(),
                "restarting worker"
            );
        }
    }

    async fn run_one_child(
        &mut self,
        sock_path: &PathBuf,
        listener: &UnixListener,
        sigint: &mut Signal,
        sigterm: &mut Signal,
        sighup: &mut Signal,
    ) -> anyhow::Result<ChildOutcome> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("empty worker command"))?;
        let mut child = Command::new(program)
            .args(args)
            .env(SOCKET_ENV, sock_path)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()?;
        debug!(pid = child.id(), "worker spawned");

        // Frames from the connected worker arrive through this channel; the
        // reader task owns the receive half of the socket.
        let (frame_tx, mut frame_rx) = mpsc::channel::<WorkerMessage>(16);
        let mut conn_writer: Option<tokio::net::unix::OwnedWriteHalf> = None;

        loop {
            tokio::select! {
                status = child.wait() => {
                    let code = status?.code().unwrap_or(1);
                    return Ok(self.outcome_for_exit(code));
                }

                accepted = listener.accept(), if conn_writer.is_none() => {
                    let (stream, _) = accepted?;
                    match self.handshake(stream).await {
                        Ok((writer, reader)) => {
                            conn_writer = Some(writer);
                            let tx = frame_tx.clone();
                            tokio::spawn(pump_frames(reader, tx));
                        }
                        Err(e) => warn!(error = %e, "worker handshake failed"),
                    }
                }

                Some(message) = frame_rx.recv() => {
                    match message {
                        WorkerMessage::StateSnapshot { payload } => {
                            debug!(session = %payload.session_id, "snapshot updated");
                            self.snapshot = Some(payload);
                        }
                        WorkerMessage::ReloadRequest { payload } => {
                            info!(session = %payload.session_id, "reload requested");
                            self.snapshot = Some(payload);
                        }
                        WorkerMessage::Ready => {
                            debug!("unexpected ready outside handshake; ignored");
                        }
                    }
                }

                _ = sigint.recv() => {
                    return Ok(self.shutdown_child(&mut child, conn_writer.as_mut()).await);
                }
                _ = sigterm.recv() => {
                    return Ok(self.shutdown_child(&mut child, conn_writer.as_mut()).await);
                }
                _ = sighup.recv() => {
                    return Ok(self.shutdown_child(&mut child, conn_writer.as_mut()).await);
                }
            }
        }
    }

    /// Expect `ready`; reply with the held snapshot when its version is
    /// current.  A stale snapshot is discarded here so the worker
    /// cold-starts.
    async fn handshake(
        &mut self,
        stream: UnixStream,
    ) -> anyhow::Result<(
        tokio::net::unix::OwnedWriteHalf,
        tokio::net::unix::OwnedReadHalf,
    )> {
        let (mut reader, mut writer) = stream.into_split();
        let first: WorkerMessage = tokio::time::timeout(
            Duration::from_millis(self.config.handshake_timeout_ms),
            read_frame(&mut reader),
        )
        .await
        .map_err(|_| anyhow::anyhow!("worker did not send ready in time"))??;
        anyhow::ensure!(
            matches!(first, WorkerMessage::Ready),
            "expected ready, got {first:?}"
        );

        if let Some(snapshot) = &self.snapshot {
            if snapshot.version_matches() {
                write_frame(
                    &mut writer,
                    &SupervisorMessage::WarmState {
                        payload: snapshot.clone(),
                    },
                )
                .await?;
            } else {
                warn!(version = snapshot.version, "discarding stale snapshot");
                self.snapshot = None;
            }
        }
        Ok((writer, reader))
    }

    fn outcome_for_exit(&self, code: i32) -> ChildOutcome {
        match code {
            EXIT_CLEAN => {
                info!("worker exited cleanly");
                ChildOutcome::Clean
            }
            EXIT_RELOAD => {
                info!("worker requested reload");
                ChildOutcome::Restart
            }
            EXIT_ROLLBACK => {
                info!("worker requested rollback; snapshot discarded");
                ChildOutcome::RestartCold
            }
            other => {
                warn!(code = other, "worker crashed");
                ChildOutcome::Restart
            }
        }
    }

    /// Graceful stop: `shutdown` frame, bounded wait, then SIGKILL.
    async fn shutdown_child(
        &self,
        child: &mut Child,
        conn: Option<&mut tokio::net::unix::OwnedWriteHalf>,
    ) -> ChildOutcome {
        info!("signal received; shutting down worker");
        if let Some(writer) = conn {
            if let Err(e) = write_frame(writer, &SupervisorMessage::Shutdown).await {
                debug!(error = %e, "shutdown frame not delivered");
            }
        }
        let grace = Duration::from_millis(self.config.shutdown_grace_ms);
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => ChildOutcome::ShuttingDown(status.code().unwrap_or(0)),
            _ => {
                warn!("worker did not stop within grace period; killing");
                let _ = child.kill().await;
                ChildOutcome::ShuttingDown(1)
            }
        }
    }
}

async fn pump_frames(
    mut reader: tokio::net::unix::OwnedReadHalf,
    tx: mpsc::Sender<WorkerMessage>,
) {
    loop {
        match read_frame::<_, WorkerMessage>(&mut reader).await {
            Ok(message) => {
                if tx.send(message).await.is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig {
            handshake_timeout_ms: 200,
            shutdown_grace_ms: 200,
            max_restarts: 50,
            crash_exits: 3,
            crash_window_ms: 5_000,
        }
    }

    #[tokio::test]
    async fn clean_exit_propagates_zero() {
        let s = Supervisor::new(fast_config(), vec!["/bin/sh".into(), "-c".into(), "exit 0".into()]);
        assert_eq!(s.run().await, 0);
    }

    #[tokio::test]
    async fn crash_loop_guard_gives_up_with_one() {
        // A worker that always reloads immediately trips the 3-in-window guard.
        let s = Supervisor::new(
            fast_config(),
            vec!["/bin/sh".into(), "-c".into(), "exit 75".into()],
        );
        assert_eq!(s.run().await, 1);
    }

    #[tokio::test]
    async fn crashing_worker_also_trips_the_guard() {
        let s = Supervisor::new(
            fast_config(),
            vec!["/bin/sh".into(), "-c".into(), "exit 7".into()],
        );
        assert_eq!(s.run().await, 1);
    }

    #[tokio::test]
    async fn missing_worker_binary_fails() {
        let s = Supervisor::new(fast_config(), vec!["/no/such/worker".into()]);
        assert_eq!(s.run().await, 1);
    }

    #[tokio::test]
    async fn empty_command_fails() {
        let s = Supervisor::new(fast_config(), vec![]);
        assert_eq!(s.run().await, 1);
    }
}
