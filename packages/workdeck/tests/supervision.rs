//! End-to-end supervision flows against real PTY children.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use workdeck::gateway::{AuthConfig, Gateway, OutboundFrame};
use workdeck::protocol::ServerEvent;
use workdeck::store::{LogLevel, SessionStatus, WorkspaceStatus, WorkspaceStore};
use workdeck::supervisor::AgentSupervisor;
use workdeck::user_terminal::UserTerminalSupervisor;

const TEST_GRACE: Duration = Duration::from_millis(200);
const WAIT_LIMIT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, PartialEq)]
enum Recorded {
    Running { session_id: String, os_pid: u32 },
    Terminal { session_id: String, status: SessionStatus },
    Workspace { workspace_id: String, status: WorkspaceStatus },
    Log { session_id: String, level: LogLevel, message: String },
}

#[derive(Debug, Default)]
struct MockStore {
    calls: Mutex<Vec<Recorded>>,
    allowed: HashSet<String>,
}

impl MockStore {
    fn allowing(commands: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            allowed: commands.iter().map(|s| s.to_string()).collect(),
        })
    }

    fn calls(&self) -> Vec<Recorded> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn terminal_statuses(&self, session_id: &str) -> Vec<SessionStatus> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Recorded::Terminal {
                    session_id: id,
                    status,
                } if id == session_id => Some(status),
                _ => None,
            })
            .collect()
    }

    fn log_lines(&self, session_id: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Recorded::Log {
                    session_id: id,
                    level: LogLevel::Info,
                    message,
                } if id == session_id => Some(message),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl WorkspaceStore for MockStore {
    async fn mark_session_running(&self, session_id: &str, os_pid: u32) {
        self.calls.lock().expect("calls lock").push(Recorded::Running {
            session_id: session_id.to_string(),
            os_pid,
        });
    }

    async fn mark_session_terminal(
        &self,
        session_id: &str,
        status: SessionStatus,
        _completed_at: DateTime<Utc>,
    ) {
        self.calls
            .lock()
            .expect("calls lock")
            .push(Recorded::Terminal {
                session_id: session_id.to_string(),
                status,
            });
    }

    async fn mark_workspace_status(&self, workspace_id: &str, status: WorkspaceStatus) {
        self.calls
            .lock()
            .expect("calls lock")
            .push(Recorded::Workspace {
                workspace_id: workspace_id.to_string(),
                status,
            });
    }

    async fn persist_log_entry(
        &self,
        session_id: &str,
        _timestamp: DateTime<Utc>,
        level: LogLevel,
        message: &str,
    ) {
        self.calls.lock().expect("calls lock").push(Recorded::Log {
            session_id: session_id.to_string(),
            level,
            message: message.to_string(),
        });
    }

    fn is_allowed_agent_command(&self, command: &str) -> bool {
        self.allowed.contains(command)
    }
}

struct Harness {
    store: Arc<MockStore>,
    gateway: Arc<Gateway>,
    agents: Arc<AgentSupervisor>,
    terminals: Arc<UserTerminalSupervisor>,
}

fn harness(allowed: &[&str]) -> Harness {
    let store = MockStore::allowing(allowed);
    let gateway = Arc::new(Gateway::new(AuthConfig::disabled()));
    let agents = Arc::new(AgentSupervisor::with_grace(
        store.clone(),
        gateway.clone(),
        TEST_GRACE,
    ));
    let terminals = Arc::new(UserTerminalSupervisor::with_grace(
        gateway.clone(),
        TEST_GRACE,
    ));
    gateway.attach_supervisors(&agents, &terminals);
    Harness {
        store,
        gateway,
        agents,
        terminals,
    }
}

async fn subscribe(
    gateway: &Gateway,
    workspace_id: &str,
) -> mpsc::Receiver<OutboundFrame> {
    let (tx, rx) = mpsc::channel(1024);
    let conn = gateway.register(tx).await;
    gateway
        .handle_message(
            &conn,
            &format!(r#"{{"type":"subscribe-workspace","workspaceId":"{workspace_id}"}}"#),
        )
        .await;
    rx
}

async fn wait_for_agent_exit(agents: &AgentSupervisor, session_id: &str) {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while agents.is_active(session_id).await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "session {session_id} did not exit in time"
        );
        tokio::time::sleep(POLL).await;
    }
}

async fn wait_for_terminal_exit(terminals: &UserTerminalSupervisor, terminal_id: &str) {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while terminals.is_active(terminal_id).await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "terminal {terminal_id} did not exit in time"
        );
        tokio::time::sleep(POLL).await;
    }
}

fn drain(rx: &mut mpsc::Receiver<OutboundFrame>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        if let OutboundFrame::Event(event) = frame {
            events.push(event);
        }
    }
    events
}

#[tokio::test]
async fn agent_session_runs_to_completion() {
    let h = harness(&["sh"]);
    let mut rx = subscribe(&h.gateway, "w1").await;
    let dir = tempfile::tempdir().expect("tempdir");

    h.agents
        .start(
            "s1",
            "w1",
            "claude",
            dir.path(),
            "sh",
            &["-c".to_string(), "printf 'abc\\ndef\\nghi'".to_string()],
        )
        .await
        .expect("start");
    assert!(h.agents.is_active("s1").await);
    assert_eq!(h.agents.list_active().await, vec!["s1".to_string()]);

    wait_for_agent_exit(&h.agents, "s1").await;

    let calls = h.store.calls();
    assert!(calls
        .iter()
        .any(|call| matches!(call, Recorded::Running { session_id, os_pid } if session_id == "s1" && *os_pid > 0)));
    assert_eq!(h.store.terminal_statuses("s1"), vec![SessionStatus::Completed]);
    assert!(calls.contains(&Recorded::Workspace {
        workspace_id: "w1".to_string(),
        status: WorkspaceStatus::Completed,
    }));
    assert_eq!(
        h.store.log_lines("s1"),
        vec!["abc".to_string(), "def".to_string(), "ghi".to_string()]
    );

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|event| matches!(event, ServerEvent::TerminalData { data, .. } if data.contains("abc"))));
    let completed: Vec<_> = events
        .iter()
        .filter(|event| matches!(event, ServerEvent::SessionCompleted { .. }))
        .collect();
    assert_eq!(completed.len(), 1);
    match completed[0] {
        ServerEvent::SessionCompleted {
            exit_code, success, ..
        } => {
            assert_eq!(*exit_code, 0);
            assert!(success);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn nonzero_exit_marks_session_and_workspace_failed() {
    let h = harness(&["sh"]);
    let mut rx = subscribe(&h.gateway, "w2").await;
    let dir = tempfile::tempdir().expect("tempdir");

    h.agents
        .start(
            "s2",
            "w2",
            "codex",
            dir.path(),
            "sh",
            &["-c".to_string(), "exit 3".to_string()],
        )
        .await
        .expect("start");
    wait_for_agent_exit(&h.agents, "s2").await;

    assert_eq!(h.store.terminal_statuses("s2"), vec![SessionStatus::Failed]);
    assert!(h.store.calls().contains(&Recorded::Workspace {
        workspace_id: "w2".to_string(),
        status: WorkspaceStatus::Error,
    }));

    let events = drain(&mut rx);
    assert!(events.iter().any(|event| matches!(
        event,
        ServerEvent::SessionCompleted {
            exit_code: 3,
            success: false,
            ..
        }
    )));
}

#[tokio::test]
async fn stop_escalates_to_force_kill_after_grace() {
    let h = harness(&["sh"]);
    let dir = tempfile::tempdir().expect("tempdir");

    // Ignores SIGTERM so only the forced kill can end it.
    h.agents
        .start(
            "s3",
            "w3",
            "claude",
            dir.path(),
            "sh",
            &["-c".to_string(), "trap '' TERM; while :; do :; done".to_string()],
        )
        .await
        .expect("start");

    // Give the shell a beat to install its trap.
    tokio::time::sleep(Duration::from_millis(100)).await;

    h.agents.stop("s3").await.expect("stop");
    assert!(h.agents.is_active("s3").await);
    // Second stop before the deadline is accepted and re-arms nothing.
    h.agents.stop("s3").await.expect("second stop");

    wait_for_agent_exit(&h.agents, "s3").await;
    assert_eq!(h.store.terminal_statuses("s3"), vec![SessionStatus::Failed]);
}

#[tokio::test]
async fn agent_input_round_trips_through_the_pty() {
    let h = harness(&["cat"]);
    let dir = tempfile::tempdir().expect("tempdir");

    h.agents
        .start("s4", "w4", "claude", dir.path(), "cat", &[])
        .await
        .expect("start");

    h.agents.send_input("s4", "hello\n").await.expect("input");

    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    loop {
        let lines = h.store.log_lines("s4");
        if lines.iter().any(|line| line.contains("hello")) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "echoed input never showed up in the logs: {lines:?}"
        );
        tokio::time::sleep(POLL).await;
    }

    h.agents.stop("s4").await.expect("stop");
    wait_for_agent_exit(&h.agents, "s4").await;

    assert!(matches!(
        h.agents.send_input("s4", "too late\n").await,
        Err(workdeck_error::WorkdeckError::SessionNotFound { .. })
    ));
}

#[tokio::test]
async fn stop_all_sweeps_every_session() {
    let h = harness(&["sh"]);
    let dir = tempfile::tempdir().expect("tempdir");

    for id in ["sa", "sb"] {
        h.agents
            .start(
                id,
                "w5",
                "claude",
                dir.path(),
                "sh",
                &["-c".to_string(), "sleep 30".to_string()],
            )
            .await
            .expect("start");
    }
    assert_eq!(h.agents.list_active().await.len(), 2);

    // A second start for a live session id is rejected outright.
    let duplicate = h
        .agents
        .start(
            "sa",
            "w5",
            "claude",
            dir.path(),
            "sh",
            &["-c".to_string(), "sleep 30".to_string()],
        )
        .await;
    assert!(matches!(
        duplicate,
        Err(workdeck_error::WorkdeckError::SessionAlreadyExists { .. })
    ));

    h.agents.stop_all().await;
    wait_for_agent_exit(&h.agents, "sa").await;
    wait_for_agent_exit(&h.agents, "sb").await;
    assert!(h.agents.list_active().await.is_empty());
}

#[tokio::test]
async fn one_user_terminal_per_workspace() {
    std::env::set_var("WORKDECK_SHELL", "/bin/sh");
    let h = harness(&[]);
    let mut rx = subscribe(&h.gateway, "w6").await;
    let dir = tempfile::tempdir().expect("tempdir");

    let terminal_id = h.terminals.start("w6", dir.path(), 80, 24).await.expect("start");
    assert!(h.terminals.is_active(&terminal_id).await);
    assert_eq!(
        h.terminals.lookup_terminal_for_workspace("w6").await,
        Some(terminal_id.clone())
    );

    let second = h.terminals.start("w6", dir.path(), 80, 24).await;
    assert!(matches!(
        second,
        Err(workdeck_error::WorkdeckError::TerminalAlreadyExists { .. })
    ));
    assert!(h.terminals.is_active(&terminal_id).await);

    h.terminals.stop(&terminal_id).await.expect("stop");
    wait_for_terminal_exit(&h.terminals, &terminal_id).await;
    assert_eq!(h.terminals.lookup_terminal_for_workspace("w6").await, None);

    let events = drain(&mut rx);
    assert!(events.iter().any(|event| matches!(
        event,
        ServerEvent::UserTerminalStarted { workspace_id, .. } if workspace_id == "w6"
    )));
    assert!(events.iter().any(|event| matches!(
        event,
        ServerEvent::UserTerminalExited { workspace_id, .. } if workspace_id == "w6"
    )));

    // The workspace slot is free again.
    let replacement = h.terminals.start("w6", dir.path(), 80, 24).await.expect("restart");
    assert_ne!(replacement, terminal_id);
    h.terminals.stop(&replacement).await.expect("stop");
    wait_for_terminal_exit(&h.terminals, &replacement).await;
}

#[tokio::test]
async fn user_terminal_streams_raw_output() {
    std::env::set_var("WORKDECK_SHELL", "/bin/sh");
    let h = harness(&[]);
    let mut rx = subscribe(&h.gateway, "w7").await;
    let dir = tempfile::tempdir().expect("tempdir");

    let terminal_id = h.terminals.start("w7", dir.path(), 80, 24).await.expect("start");
    h.terminals
        .send_input(&terminal_id, "echo marker-123\n")
        .await
        .expect("input");

    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    let mut seen = false;
    while !seen {
        for event in drain(&mut rx) {
            if let ServerEvent::UserTerminalData { data, .. } = event {
                if data.contains("marker-123") {
                    seen = true;
                }
            }
        }
        if !seen {
            assert!(
                tokio::time::Instant::now() < deadline,
                "shell output never arrived"
            );
            tokio::time::sleep(POLL).await;
        }
    }

    h.terminals.stop(&terminal_id).await.expect("stop");
    wait_for_terminal_exit(&h.terminals, &terminal_id).await;
}
