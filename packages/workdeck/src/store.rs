//! The narrow seam to the external HTTP/DB layer.
//!
//! Session rows, log entries, and workspace status live outside this
//! subsystem; the supervisors only ever talk to them through
//! [`WorkspaceStore`]. The trait is injected at construction so the
//! supervisors can be exercised against a recording double in tests.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Agent binaries the default allow-list accepts, by base name.
pub const KNOWN_AGENT_COMMANDS: &[&str] =
    &["claude", "codex", "opencode", "amp", "cursor-agent", "pi"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
}

/// External collaborator interface: persistence and the agent allow-list.
///
/// Status and log writes are fire-and-forget from the supervisors'
/// perspective; implementations report their own failures and must not
/// block on client-facing I/O.
#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    async fn mark_session_running(&self, session_id: &str, os_pid: u32);

    async fn mark_session_terminal(
        &self,
        session_id: &str,
        status: SessionStatus,
        completed_at: DateTime<Utc>,
    );

    async fn mark_workspace_status(&self, workspace_id: &str, status: WorkspaceStatus);

    async fn persist_log_entry(
        &self,
        session_id: &str,
        timestamp: DateTime<Utc>,
        level: LogLevel,
        message: &str,
    );

    fn is_allowed_agent_command(&self, command: &str) -> bool;
}

/// Default store used when the server runs without the external
/// persistence layer: everything goes to the process log.
#[derive(Debug)]
pub struct LoggingStore {
    allowed: HashSet<String>,
}

impl LoggingStore {
    pub fn new() -> Self {
        Self::with_allowed(KNOWN_AGENT_COMMANDS.iter().map(|s| s.to_string()))
    }

    pub fn with_allowed(allowed: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }
}

impl Default for LoggingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkspaceStore for LoggingStore {
    async fn mark_session_running(&self, session_id: &str, os_pid: u32) {
        tracing::info!(session_id, os_pid, "session running");
    }

    async fn mark_session_terminal(
        &self,
        session_id: &str,
        status: SessionStatus,
        completed_at: DateTime<Utc>,
    ) {
        tracing::info!(session_id, ?status, %completed_at, "session terminal");
    }

    async fn mark_workspace_status(&self, workspace_id: &str, status: WorkspaceStatus) {
        tracing::info!(workspace_id, ?status, "workspace status");
    }

    async fn persist_log_entry(
        &self,
        session_id: &str,
        timestamp: DateTime<Utc>,
        level: LogLevel,
        message: &str,
    ) {
        tracing::info!(session_id, %timestamp, ?level, message, "session log");
    }

    fn is_allowed_agent_command(&self, command: &str) -> bool {
        self.allowed.contains(command)
    }
}
