//! Wire protocol for the real-time channel.
//!
//! Both directions are closed sets, tagged by `type` so unknown or
//! malformed payloads fail to deserialize instead of falling through a
//! default case.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use workdeck_error::WireError;

use crate::store::LogLevel;

pub const MIN_TERMINAL_COLS: u16 = 1;
pub const MAX_TERMINAL_COLS: u16 = 500;
pub const MIN_TERMINAL_ROWS: u16 = 1;
pub const MAX_TERMINAL_ROWS: u16 = 200;

/// Client → server messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    SubscribeWorkspace { workspace_id: String },
    #[serde(rename_all = "camelCase")]
    UnsubscribeWorkspace { workspace_id: String },
    #[serde(rename_all = "camelCase")]
    FocusWorkspace { workspace_id: String },
    #[serde(rename_all = "camelCase")]
    TerminalInput { session_id: String, data: String },
    #[serde(rename_all = "camelCase")]
    TerminalResize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    #[serde(rename_all = "camelCase")]
    UserTerminalInput { terminal_id: String, data: String },
    #[serde(rename_all = "camelCase")]
    UserTerminalResize {
        terminal_id: String,
        cols: u16,
        rows: u16,
    },
}

/// Server → client events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    WorkspaceStatusChanged {
        workspace_id: String,
        status: String,
    },
    #[serde(rename_all = "camelCase")]
    AgentLog {
        session_id: String,
        workspace_id: String,
        level: LogLevel,
        message: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    AgentMessage {
        session_id: String,
        workspace_id: String,
        message: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    FileChanged { workspace_id: String, path: String },
    #[serde(rename_all = "camelCase")]
    SessionCompleted {
        session_id: String,
        workspace_id: String,
        exit_code: i32,
        success: bool,
    },
    /// Raw agent PTY output, ANSI preserved.
    #[serde(rename_all = "camelCase")]
    TerminalData {
        session_id: String,
        workspace_id: String,
        data: String,
    },
    /// Raw shell PTY output, ANSI preserved.
    #[serde(rename_all = "camelCase")]
    UserTerminalData {
        terminal_id: String,
        workspace_id: String,
        data: String,
    },
    #[serde(rename_all = "camelCase")]
    UserTerminalStarted {
        terminal_id: String,
        workspace_id: String,
    },
    #[serde(rename_all = "camelCase")]
    UserTerminalExited {
        terminal_id: String,
        workspace_id: String,
    },
    Error { error: WireError },
}

/// Terminal geometry accepted over the wire; anything outside is malformed.
pub fn resize_in_bounds(cols: u16, rows: u16) -> bool {
    (MIN_TERMINAL_COLS..=MAX_TERMINAL_COLS).contains(&cols)
        && (MIN_TERMINAL_ROWS..=MAX_TERMINAL_ROWS).contains(&rows)
}
