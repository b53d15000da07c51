//! Workdeck core: PTY process supervision and the real-time gateway.

pub mod cli;
pub mod gateway;
pub mod protocol;
pub(crate) mod pty;
pub mod router;
pub mod sanitize;
pub mod store;
pub mod supervisor;
pub mod user_terminal;
