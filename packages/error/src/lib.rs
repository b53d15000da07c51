use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DisallowedCommand,
    SpawnFailed,
    SessionNotFound,
    SessionAlreadyExists,
    TerminalNotFound,
    TerminalAlreadyExists,
    WriteFailed,
    ResizeFailed,
    ResizeOutOfBounds,
    SubscriptionLimitExceeded,
    MalformedMessage,
    Unauthorized,
}

impl ErrorKind {
    pub fn as_code(&self) -> &'static str {
        match self {
            Self::DisallowedCommand => "disallowed-command",
            Self::SpawnFailed => "spawn-failed",
            Self::SessionNotFound => "session-not-found",
            Self::SessionAlreadyExists => "session-already-exists",
            Self::TerminalNotFound => "terminal-not-found",
            Self::TerminalAlreadyExists => "terminal-already-exists",
            Self::WriteFailed => "write-failed",
            Self::ResizeFailed => "resize-failed",
            Self::ResizeOutOfBounds => "resize-out-of-bounds",
            Self::SubscriptionLimitExceeded => "subscription-limit-exceeded",
            Self::MalformedMessage => "malformed-message",
            Self::Unauthorized => "unauthorized",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::DisallowedCommand => "Disallowed Command",
            Self::SpawnFailed => "Spawn Failed",
            Self::SessionNotFound => "Session Not Found",
            Self::SessionAlreadyExists => "Session Already Exists",
            Self::TerminalNotFound => "Terminal Not Found",
            Self::TerminalAlreadyExists => "Terminal Already Exists",
            Self::WriteFailed => "Write Failed",
            Self::ResizeFailed => "Resize Failed",
            Self::ResizeOutOfBounds => "Resize Out Of Bounds",
            Self::SubscriptionLimitExceeded => "Subscription Limit Exceeded",
            Self::MalformedMessage => "Malformed Message",
            Self::Unauthorized => "Unauthorized",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::DisallowedCommand => 400,
            Self::SpawnFailed => 500,
            Self::SessionNotFound => 404,
            Self::SessionAlreadyExists => 409,
            Self::TerminalNotFound => 404,
            Self::TerminalAlreadyExists => 409,
            Self::WriteFailed => 502,
            Self::ResizeFailed => 502,
            Self::ResizeOutOfBounds => 400,
            Self::SubscriptionLimitExceeded => 400,
            Self::MalformedMessage => 400,
            Self::Unauthorized => 401,
        }
    }
}

/// Structured error payload sent to clients over the real-time channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WireError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum WorkdeckError {
    #[error("command not allowed: {command}")]
    DisallowedCommand { command: String },
    #[error("failed to spawn process: {message}")]
    SpawnFailed { message: String },
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },
    #[error("session already exists: {session_id}")]
    SessionAlreadyExists { session_id: String },
    #[error("terminal not found: {terminal_id}")]
    TerminalNotFound { terminal_id: String },
    #[error("workspace already has a terminal: {workspace_id}")]
    TerminalAlreadyExists { workspace_id: String },
    #[error("write failed: {message}")]
    WriteFailed { message: String },
    #[error("resize failed: {message}")]
    ResizeFailed { message: String },
    #[error("resize out of bounds: {cols}x{rows}")]
    ResizeOutOfBounds { cols: u16, rows: u16 },
    #[error("subscription limit exceeded ({limit})")]
    SubscriptionLimitExceeded { limit: usize },
    #[error("malformed message: {message}")]
    MalformedMessage { message: String },
    #[error("missing or invalid token")]
    Unauthorized,
}

impl WorkdeckError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DisallowedCommand { .. } => ErrorKind::DisallowedCommand,
            Self::SpawnFailed { .. } => ErrorKind::SpawnFailed,
            Self::SessionNotFound { .. } => ErrorKind::SessionNotFound,
            Self::SessionAlreadyExists { .. } => ErrorKind::SessionAlreadyExists,
            Self::TerminalNotFound { .. } => ErrorKind::TerminalNotFound,
            Self::TerminalAlreadyExists { .. } => ErrorKind::TerminalAlreadyExists,
            Self::WriteFailed { .. } => ErrorKind::WriteFailed,
            Self::ResizeFailed { .. } => ErrorKind::ResizeFailed,
            Self::ResizeOutOfBounds { .. } => ErrorKind::ResizeOutOfBounds,
            Self::SubscriptionLimitExceeded { .. } => ErrorKind::SubscriptionLimitExceeded,
            Self::MalformedMessage { .. } => ErrorKind::MalformedMessage,
            Self::Unauthorized => ErrorKind::Unauthorized,
        }
    }

    pub fn to_wire_error(&self) -> WireError {
        let (session_id, terminal_id, workspace_id) = match self {
            Self::SessionNotFound { session_id } | Self::SessionAlreadyExists { session_id } => {
                (Some(session_id.clone()), None, None)
            }
            Self::TerminalNotFound { terminal_id } => (None, Some(terminal_id.clone()), None),
            Self::TerminalAlreadyExists { workspace_id } => {
                (None, None, Some(workspace_id.clone()))
            }
            _ => (None, None, None),
        };

        WireError {
            code: self.kind().as_code().to_string(),
            message: self.to_string(),
            session_id,
            terminal_id,
            workspace_id,
        }
    }
}

impl From<&WorkdeckError> for WireError {
    fn from(value: &WorkdeckError) -> Self {
        value.to_wire_error()
    }
}

impl From<WorkdeckError> for WireError {
    fn from(value: WorkdeckError) -> Self {
        value.to_wire_error()
    }
}
