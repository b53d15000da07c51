//! Agent session supervision.
//!
//! One [`AgentSupervisor`] owns every running coding-agent process. Each
//! session gets a PTY child plus a pump task that sequences output chunks
//! and the exit signal off a single channel, so the cleanup path runs at
//! most once no matter how an explicit stop races a natural exit: the
//! registry remove is the gate, and whoever wins it does the teardown.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use portable_pty::{MasterPty, PtySize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use workdeck_error::WorkdeckError;

use crate::gateway::Gateway;
use crate::protocol::ServerEvent;
use crate::pty::{self, PtyEvent, PtyHandle};
use crate::sanitize::sanitize_line;
use crate::store::{LogLevel, SessionStatus, WorkspaceStatus, WorkspaceStore};

/// Cap on buffered, not-yet-terminated output per session.
pub const OUTPUT_BUFFER_CAP: usize = 1024 * 1024;

/// Delay between a graceful termination request and the forced kill.
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(5000);

const OUTPUT_BUFFER_FULL_MESSAGE: &str = "output buffer full";

struct ManagedSession {
    workspace_id: String,
    agent_kind: String,
    pid: Option<u32>,
    master: Box<dyn MasterPty + Send>,
    input_tx: mpsc::Sender<Vec<u8>>,
    shutdown_timer: Option<JoinHandle<()>>,
}

pub struct AgentSupervisor {
    store: Arc<dyn WorkspaceStore>,
    gateway: Arc<Gateway>,
    grace: Duration,
    sessions: Mutex<HashMap<String, ManagedSession>>,
}

impl AgentSupervisor {
    pub fn new(store: Arc<dyn WorkspaceStore>, gateway: Arc<Gateway>) -> Self {
        Self::with_grace(store, gateway, SHUTDOWN_GRACE)
    }

    pub fn with_grace(
        store: Arc<dyn WorkspaceStore>,
        gateway: Arc<Gateway>,
        grace: Duration,
    ) -> Self {
        Self {
            store,
            gateway,
            grace,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn an agent process for `session_id`. The command must be on the
    /// allow-list by base name; allow-list and spawn failures are reported
    /// to the store as a failed session and no registry entry is created.
    pub async fn start(
        self: &Arc<Self>,
        session_id: &str,
        workspace_id: &str,
        agent_kind: &str,
        working_dir: &Path,
        command: &str,
        args: &[String],
    ) -> Result<(), WorkdeckError> {
        if self.sessions.lock().await.contains_key(session_id) {
            return Err(WorkdeckError::SessionAlreadyExists {
                session_id: session_id.to_string(),
            });
        }

        let base = base_command_name(command);
        if !self.store.is_allowed_agent_command(&base) {
            tracing::warn!(session_id, command, "agent command not on allow-list");
            self.report_start_failure(session_id, workspace_id).await;
            return Err(WorkdeckError::DisallowedCommand {
                command: command.to_string(),
            });
        }

        let handle = match pty::spawn_pty(
            command,
            args,
            working_dir,
            pty::default_size(),
            &[("TERM", "xterm-256color")],
        ) {
            Ok(handle) => handle,
            Err(err) => {
                tracing::warn!(session_id, command, error = %err, "agent spawn failed");
                self.report_start_failure(session_id, workspace_id).await;
                return Err(err);
            }
        };

        let PtyHandle {
            master,
            pid,
            input_tx,
            events,
        } = handle;

        {
            let mut sessions = self.sessions.lock().await;
            if sessions.contains_key(session_id) {
                // Lost a concurrent start; the registered session wins.
                if let Some(pid) = pid {
                    pty::terminate_process(pid);
                }
                return Err(WorkdeckError::SessionAlreadyExists {
                    session_id: session_id.to_string(),
                });
            }
            sessions.insert(
                session_id.to_string(),
                ManagedSession {
                    workspace_id: workspace_id.to_string(),
                    agent_kind: agent_kind.to_string(),
                    pid,
                    master,
                    input_tx,
                    shutdown_timer: None,
                },
            );
        }

        self.store
            .mark_session_running(session_id, pid.unwrap_or(0))
            .await;
        tracing::info!(session_id, workspace_id, agent_kind, "agent session started");

        let supervisor = Arc::clone(self);
        let session_id = session_id.to_string();
        let workspace_id = workspace_id.to_string();
        tokio::spawn(async move {
            supervisor
                .pump_events(session_id, workspace_id, events)
                .await;
        });

        Ok(())
    }

    /// Write keystrokes to the session's PTY. Not retried or re-queued on
    /// failure; a dead writer means the process is going away.
    pub async fn send_input(&self, session_id: &str, text: &str) -> Result<(), WorkdeckError> {
        let input_tx = {
            let sessions = self.sessions.lock().await;
            sessions
                .get(session_id)
                .ok_or_else(|| WorkdeckError::SessionNotFound {
                    session_id: session_id.to_string(),
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
        session_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), WorkdeckError> {
        let sessions = self.sessions.lock().await;
        let entry = sessions
            .get(session_id)
            .ok_or_else(|| WorkdeckError::SessionNotFound {
                session_id: session_id.to_string(),
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

    /// Request graceful termination and arm the forced-kill timer. A
    /// second stop before the deadline re-arms nothing; the original
    /// timer keeps its deadline.
    pub async fn stop(self: &Arc<Self>, session_id: &str) -> Result<(), WorkdeckError> {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| WorkdeckError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        if let Some(pid) = entry.pid {
            pty::terminate_process(pid);
        }
        if entry.shutdown_timer.is_none() {
            entry.shutdown_timer = Some(self.spawn_force_kill_timer(session_id.to_string()));
        }
        tracing::info!(session_id, "agent session stop requested");
        Ok(())
    }

    /// Graceful signal to every session, one shared grace window, then a
    /// forced sweep of whatever is still registered. Process shutdown only.
    pub async fn stop_all(&self) {
        let pids: Vec<u32> = {
            let sessions = self.sessions.lock().await;
            sessions.values().filter_map(|entry| entry.pid).collect()
        };
        if pids.is_empty() {
            return;
        }
        tracing::info!(count = pids.len(), "stopping all agent sessions");
        for pid in &pids {
            pty::terminate_process(*pid);
        }
        tokio::time::sleep(self.grace).await;
        let survivors: Vec<u32> = {
            let sessions = self.sessions.lock().await;
            sessions.values().filter_map(|entry| entry.pid).collect()
        };
        for pid in survivors {
            pty::force_kill_process(pid);
        }
    }

    pub async fn list_active(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    pub async fn is_active(&self, session_id: &str) -> bool {
        self.sessions.lock().await.contains_key(session_id)
    }

    async fn pump_events(
        self: Arc<Self>,
        session_id: String,
        workspace_id: String,
        mut events: mpsc::Receiver<PtyEvent>,
    ) {
        let mut buffer = LineBuffer::new();
        while let Some(event) = events.recv().await {
            match event {
                PtyEvent::Output(chunk) => {
                    self.gateway
                        .broadcast_to_workspace(
                            &workspace_id,
                            ServerEvent::TerminalData {
                                session_id: session_id.clone(),
                                workspace_id: workspace_id.clone(),
                                data: String::from_utf8_lossy(&chunk).into_owned(),
                            },
                        )
                        .await;
                    let outcome = buffer.push(&chunk);
                    if outcome.overflowed {
                        tracing::warn!(session_id = %session_id, "output buffer full");
                        self.emit_log(
                            &session_id,
                            &workspace_id,
                            LogLevel::Warning,
                            OUTPUT_BUFFER_FULL_MESSAGE,
                        )
                        .await;
                    }
                    for line in outcome.lines {
                        self.emit_log(&session_id, &workspace_id, LogLevel::Info, &line)
                            .await;
                    }
                }
                PtyEvent::Exit { code } => {
                    self.handle_exit(&session_id, code, &mut buffer).await;
                    break;
                }
            }
        }
    }

    /// Single cleanup entry point. The registry remove is the idempotence
    /// gate: whoever gets the entry out does the teardown, every later
    /// caller returns immediately.
    async fn handle_exit(&self, session_id: &str, exit_code: i32, buffer: &mut LineBuffer) {
        let entry = self.sessions.lock().await.remove(session_id);
        let Some(mut entry) = entry else {
            return;
        };
        if let Some(timer) = entry.shutdown_timer.take() {
            timer.abort();
        }

        if let Some(line) = buffer.flush() {
            self.emit_log(session_id, &entry.workspace_id, LogLevel::Info, &line)
                .await;
        }

        let success = exit_code == 0;
        self.store
            .mark_session_terminal(
                session_id,
                if success {
                    SessionStatus::Completed
                } else {
                    SessionStatus::Failed
                },
                Utc::now(),
            )
            .await;
        self.store
            .mark_workspace_status(
                &entry.workspace_id,
                if success {
                    WorkspaceStatus::Completed
                } else {
                    WorkspaceStatus::Error
                },
            )
            .await;
        self.gateway
            .broadcast_to_workspace(
                &entry.workspace_id,
                ServerEvent::SessionCompleted {
                    session_id: session_id.to_string(),
                    workspace_id: entry.workspace_id.clone(),
                    exit_code,
                    success,
                },
            )
            .await;
        tracing::info!(
            session_id,
            workspace_id = %entry.workspace_id,
            agent_kind = %entry.agent_kind,
            exit_code,
            "agent session exited"
        );
    }

    async fn emit_log(&self, session_id: &str, workspace_id: &str, level: LogLevel, message: &str) {
        let timestamp = Utc::now();
        self.store
            .persist_log_entry(session_id, timestamp, level, message)
            .await;
        self.gateway
            .broadcast_to_workspace(
                workspace_id,
                ServerEvent::AgentLog {
                    session_id: session_id.to_string(),
                    workspace_id: workspace_id.to_string(),
                    level,
                    message: message.to_string(),
                    timestamp,
                },
            )
            .await;
    }

    async fn report_start_failure(&self, session_id: &str, workspace_id: &str) {
        self.store
            .mark_session_terminal(session_id, SessionStatus::Failed, Utc::now())
            .await;
        self.store
            .mark_workspace_status(workspace_id, WorkspaceStatus::Error)
            .await;
    }

    fn spawn_force_kill_timer(self: &Arc<Self>, session_id: String) -> JoinHandle<()> {
        let supervisor = Arc::downgrade(self);
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(supervisor) = supervisor.upgrade() else {
                return;
            };
            let pid = {
                let sessions = supervisor.sessions.lock().await;
                sessions.get(&session_id).and_then(|entry| entry.pid)
            };
            if let Some(pid) = pid {
                tracing::warn!(session_id = %session_id, "grace window expired, force killing");
                pty::force_kill_process(pid);
            }
        })
    }
}

fn base_command_name(command: &str) -> String {
    Path::new(command)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| command.to_string())
}

/// Accumulates raw output and hands back complete, sanitized lines.
///
/// Once the unterminated tail would grow past [`OUTPUT_BUFFER_CAP`], whole
/// chunks are dropped; the first dropped chunk is reported so exactly one
/// overflow warning is emitted per session.
pub(crate) struct LineBuffer {
    tail: Vec<u8>,
    overflow_warned: bool,
}

pub(crate) struct PushOutcome {
    pub lines: Vec<String>,
    pub overflowed: bool,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self {
            tail: Vec::new(),
            overflow_warned: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> PushOutcome {
        if self.tail.len() + chunk.len() > OUTPUT_BUFFER_CAP {
            let overflowed = !self.overflow_warned;
            self.overflow_warned = true;
            return PushOutcome {
                lines: Vec::new(),
                overflowed,
            };
        }
        self.tail.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.tail.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.tail.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(sanitize_line(&String::from_utf8_lossy(&line)));
        }
        PushOutcome {
            lines,
            overflowed: false,
        }
    }

    /// Drain the tail as one final line, if it holds anything visible.
    pub fn flush(&mut self) -> Option<String> {
        if self.tail.is_empty() {
            return None;
        }
        let text = sanitize_line(&String::from_utf8_lossy(&self.tail));
        self.tail.clear();
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }
}
