//! PTY plumbing shared by both supervisors.
//!
//! A spawned child gets one blocking reader task and one blocking writer
//! task. The reader drains the master until EOF, then waits the child and
//! pushes a single `Exit` event onto the same channel as the output
//! chunks, so output is always fully delivered before the exit signal.

use std::io::{Read, Write};
use std::path::Path;

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;

use workdeck_error::WorkdeckError;

pub(crate) const DEFAULT_PTY_COLS: u16 = 80;
pub(crate) const DEFAULT_PTY_ROWS: u16 = 24;

const READ_BUFFER_BYTES: usize = 8192;
const EVENT_CHANNEL_CAPACITY: usize = 256;
const INPUT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
pub(crate) enum PtyEvent {
    Output(Vec<u8>),
    Exit { code: i32 },
}

pub(crate) struct PtyHandle {
    pub master: Box<dyn MasterPty + Send>,
    pub pid: Option<u32>,
    pub input_tx: mpsc::Sender<Vec<u8>>,
    pub events: mpsc::Receiver<PtyEvent>,
}

pub(crate) fn default_size() -> PtySize {
    PtySize {
        rows: DEFAULT_PTY_ROWS,
        cols: DEFAULT_PTY_COLS,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Spawn `command` behind a fresh PTY with the parent environment plus the
/// given overrides. The returned handle owns the master side; the registry
/// holding it is the sole owner of the OS handle.
pub(crate) fn spawn_pty(
    command: &str,
    args: &[String],
    working_dir: &Path,
    size: PtySize,
    envs: &[(&str, &str)],
) -> Result<PtyHandle, WorkdeckError> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(size)
        .map_err(|err| WorkdeckError::SpawnFailed {
            message: format!("failed to open PTY: {err}"),
        })?;

    let mut cmd = CommandBuilder::new(command);
    cmd.args(args);
    cmd.cwd(working_dir.as_os_str());
    for (key, value) in envs {
        cmd.env(key, value);
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|err| WorkdeckError::SpawnFailed {
            message: format!("failed to spawn PTY command: {err}"),
        })?;
    drop(pair.slave);

    let pid = child.process_id();

    let mut reader =
        pair.master
            .try_clone_reader()
            .map_err(|err| WorkdeckError::SpawnFailed {
                message: format!("failed to clone PTY reader: {err}"),
            })?;
    let mut writer = pair
        .master
        .take_writer()
        .map_err(|err| WorkdeckError::SpawnFailed {
            message: format!("failed to take PTY writer: {err}"),
        })?;

    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(INPUT_CHANNEL_CAPACITY);

    tokio::task::spawn_blocking(move || {
        let mut child = child;
        let mut buffer = [0u8; READ_BUFFER_BYTES];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) | Err(_) => break,
                Ok(count) => {
                    if event_tx
                        .blocking_send(PtyEvent::Output(buffer[..count].to_vec()))
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
        let code = child
            .wait()
            .map(|status| status.exit_code() as i32)
            .unwrap_or(-1);
        let _ = event_tx.blocking_send(PtyEvent::Exit { code });
    });

    tokio::task::spawn_blocking(move || {
        while let Some(payload) = input_rx.blocking_recv() {
            if writer.write_all(&payload).is_err() {
                break;
            }
            if writer.flush().is_err() {
                break;
            }
        }
    });

    Ok(PtyHandle {
        master: pair.master,
        pid,
        input_tx,
        events: event_rx,
    })
}

#[cfg(unix)]
pub(crate) fn terminate_process(pid: u32) {
    if pid == 0 {
        return;
    }
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
pub(crate) fn terminate_process(_pid: u32) {}

#[cfg(unix)]
pub(crate) fn force_kill_process(pid: u32) {
    if pid == 0 {
        return;
    }
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
pub(crate) fn force_kill_process(_pid: u32) {}
