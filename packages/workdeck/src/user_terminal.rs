//! Interactive shell supervision, one shell per workspace.
//!
//! Same lifecycle as agent sessions but keyed by workspace: the
//! workspace-to-terminal index is checked before anything is spawned and
//! a live entry wins, so a second start is "already exists" rather than a
//! replacement. Shell output is passthrough only; nothing here is
//! sanitized or persisted.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use portable_pty::{MasterPty, PtySize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use workdeck_error::WorkdeckError;

use crate::gateway::Gateway;
use crate::protocol::ServerEvent;
use crate::pty::{self, PtyEvent, PtyHandle};
use crate::supervisor::SHUTDOWN_GRACE;

static TERMINAL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

const FALLBACK_SHELL: &str = "/bin/bash";

struct UserTerminal {
    workspace_id: String,
    pid: Option<u32>,
    master: Box<dyn MasterPty + Send>,
    input_tx: mpsc::Sender<Vec<u8>>,
    created_at: DateTime<Utc>,
    shutdown_timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct TerminalRegistry {
    by_id: HashMap<String, UserTerminal>,
    by_workspace: HashMap<String, String>,
}

pub struct UserTerminalSupervisor {
    gateway: Arc<Gateway>,
    grace: Duration,
    terminals: Mutex<TerminalRegistry>,
}

impl UserTerminalSupervisor {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self::with_grace(gateway, SHUTDOWN_GRACE)
    }

    pub fn with_grace(gateway: Arc<Gateway>, grace: Duration) -> Self {
        Self {
            gateway,
            grace,
            terminals: Mutex::new(TerminalRegistry::default()),
        }
    }

    /// Open an interactive shell for the workspace at the client's
    /// terminal size. Fails with "already exists" if the workspace has a
    /// live shell; callers treat that as "reconnect to the existing one".
    pub async fn start(
        self: &Arc<Self>,
        workspace_id: &str,
        working_dir: &Path,
        cols: u16,
        rows: u16,
    ) -> Result<String, WorkdeckError> {
        {
            let terminals = self.terminals.lock().await;
            if terminals.by_workspace.contains_key(workspace_id) {
                return Err(WorkdeckError::TerminalAlreadyExists {
                    workspace_id: workspace_id.to_string(),
                });
            }
        }

        let shell = resolve_shell();
        let handle = pty::spawn_pty(
            &shell,
            &[],
            working_dir,
            PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            },
            &[("TERM", "xterm-256color")],
        )?;
        let PtyHandle {
            master,
            pid,
            input_tx,
            events,
        } = handle;

        let terminal_id = next_terminal_id();
        {
            let mut terminals = self.terminals.lock().await;
            if terminals.by_workspace.contains_key(workspace_id) {
                // Lost a concurrent start; the existing shell wins.
                if let Some(pid) = pid {
                    pty::terminate_process(pid);
                }
                return Err(WorkdeckError::TerminalAlreadyExists {
                    workspace_id: workspace_id.to_string(),
                });
            }
            terminals.by_id.insert(
                terminal_id.clone(),
                UserTerminal {
                    workspace_id: workspace_id.to_string(),
                    pid,
                    master,
                    input_tx,
                    created_at: Utc::now(),
                    shutdown_timer: None,
                },
            );
            terminals
                .by_workspace
                .insert(workspace_id.to_string(), terminal_id.clone());
        }
        tracing::info!(terminal_id = %terminal_id, workspace_id, shell = %shell, "user terminal started");

        self.gateway
            .broadcast_to_workspace(
                workspace_id,
                ServerEvent::UserTerminalStarted {
                    terminal_id: terminal_id.clone(),
                    workspace_id: workspace_id.to_string(),
                },
            )
            .await;

        let supervisor = Arc::clone(self);
        let pump_terminal_id = terminal_id.clone();
        let pump_workspace_id = workspace_id.to_string();
        tokio::spawn(async move {
            supervisor
                .pump_events(pump_terminal_id, pump_workspace_id, events)
                .await;
        });

        Ok(terminal_id)
    }

    pub async fn send_input(&self, terminal_id: &str, text: &str) -> Result<(), WorkdeckError> {
        let input_tx = {
            let terminals = self.terminals.lock().await;
            terminals
                .by_id
                .get(terminal_id)
                .ok_or_else(|| WorkdeckError::TerminalNotFound {
                    terminal_id: terminal_id.to_string(),
                })?
                .input_tx
                .clone()
        };
        input_tx
            .send(text.as_bytes().to_vec())
            .await
            .map_err(|_| WorkdeckError::WriteFailed {
                message: "input channel closed".to_string(),
            })
    }

    pub async fn resize(
        &self,
        terminal_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), WorkdeckError> {
        let terminals = self.terminals.lock().await;
        let entry = terminals
            .by_id
            .get(terminal_id)
            .ok_or_else(|| WorkdeckError::TerminalNotFound {
                terminal_id: terminal_id.to_string(),
            })?;
        entry
            .master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| WorkdeckError::ResizeFailed {
                message: err.to_string(),
            })
    }

    pub async fn stop(self: &Arc<Self>, terminal_id: &str) -> Result<(), WorkdeckError> {
        let mut terminals = self.terminals.lock().await;
        let entry =
            terminals
                .by_id
                .get_mut(terminal_id)
                .ok_or_else(|| WorkdeckError::TerminalNotFound {
                    terminal_id: terminal_id.to_string(),
                })?;
        if let Some(pid) = entry.pid {
            pty::terminate_process(pid);
        }
        if entry.shutdown_timer.is_none() {
            entry.shutdown_timer = Some(self.spawn_force_kill_timer(terminal_id.to_string()));
        }
        tracing::info!(terminal_id, "user terminal stop requested");
        Ok(())
    }

    /// Graceful sweep, shared grace window, forced sweep, then clear the
    /// workspace index. Entries are reaped by their exit events.
    pub async fn stop_all(&self) {
        let pids: Vec<u32> = {
            let terminals = self.terminals.lock().await;
            terminals
                .by_id
                .values()
                .filter_map(|entry| entry.pid)
                .collect()
        };
        if pids.is_empty() {
            return;
        }
        tracing::info!(count = pids.len(), "stopping all user terminals");
        for pid in &pids {
            pty::terminate_process(*pid);
        }
        tokio::time::sleep(self.grace).await;
        let mut terminals = self.terminals.lock().await;
        for entry in terminals.by_id.values() {
            if let Some(pid) = entry.pid {
                pty::force_kill_process(pid);
            }
        }
        terminals.by_workspace.clear();
    }

    pub async fn lookup_terminal_for_workspace(&self, workspace_id: &str) -> Option<String> {
        self.terminals
            .lock()
            .await
            .by_workspace
            .get(workspace_id)
            .cloned()
    }

    pub async fn list_active(&self) -> Vec<String> {
        self.terminals.lock().await.by_id.keys().cloned().collect()
    }

    pub async fn is_active(&self, terminal_id: &str) -> bool {
        self.terminals.lock().await.by_id.contains_key(terminal_id)
    }

    async fn pump_events(
        self: Arc<Self>,
        terminal_id: String,
        workspace_id: String,
        mut events: mpsc::Receiver<PtyEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                PtyEvent::Output(chunk) => {
                    self.gateway
                        .broadcast_to_workspace(
                            &workspace_id,
                            ServerEvent::UserTerminalData {
                                terminal_id: terminal_id.clone(),
                                workspace_id: workspace_id.clone(),
                                data: String::from_utf8_lossy(&chunk).into_owned(),
                            },
                        )
                        .await;
                }
                PtyEvent::Exit { code } => {
                    self.handle_exit(&terminal_id, code).await;
                    break;
                }
            }
        }
    }

    /// Removes the terminal entry and the workspace index entry under one
    /// lock; the `by_id` remove is the idempotence gate.
    async fn handle_exit(&self, terminal_id: &str, exit_code: i32) {
        let entry = {
            let mut terminals = self.terminals.lock().await;
            let Some(mut entry) = terminals.by_id.remove(terminal_id) else {
                return;
            };
            if terminals.by_workspace.get(&entry.workspace_id).map(String::as_str)
                == Some(terminal_id)
            {
                terminals.by_workspace.remove(&entry.workspace_id);
            }
            if let Some(timer) = entry.shutdown_timer.take() {
                timer.abort();
            }
            entry
        };

        self.gateway
            .broadcast_to_workspace(
                &entry.workspace_id,
                ServerEvent::UserTerminalExited {
                    terminal_id: terminal_id.to_string(),
                    workspace_id: entry.workspace_id.clone(),
                },
            )
            .await;
        tracing::info!(
            terminal_id,
            workspace_id = %entry.workspace_id,
            exit_code,
            uptime_ms = (Utc::now() - entry.created_at).num_milliseconds(),
            "user terminal exited"
        );
    }

    fn spawn_force_kill_timer(self: &Arc<Self>, terminal_id: String) -> JoinHandle<()> {
        let supervisor = Arc::downgrade(self);
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(supervisor) = supervisor.upgrade() else {
                return;
            };
            let pid = {
                let terminals = supervisor.terminals.lock().await;
                terminals
                    .by_id
                    .get(&terminal_id)
                    .and_then(|entry| entry.pid)
            };
            if let Some(pid) = pid {
                tracing::warn!(terminal_id = %terminal_id, "grace window expired, force killing");
                pty::force_kill_process(pid);
            }
        })
    }
}

fn next_terminal_id() -> String {
    format!("term-{}", TERMINAL_ID_COUNTER.fetch_add(1, Ordering::SeqCst))
}

fn resolve_shell() -> String {
    std::env::var("WORKDECK_SHELL")
        .or_else(|_| std::env::var("SHELL"))
        .unwrap_or_else(|_| FALLBACK_SHELL.to_string())
}
