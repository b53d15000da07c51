//! Real-time gateway: connection registry, subscriptions, and fan-out.
//!
//! The gateway owns every admitted client connection. Admission happens in
//! the HTTP layer before a connection is registered here, so everything in
//! the registry is authenticated by construction. Inbound messages are
//! validated against the closed [`ClientMessage`](crate::protocol::ClientMessage)
//! set and routed to the supervisors; outbound events fan out through
//! per-connection channels so one slow client never blocks the rest.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use workdeck_error::WorkdeckError;

use crate::protocol::{resize_in_bounds, ClientMessage, ServerEvent};
use crate::supervisor::AgentSupervisor;
use crate::user_terminal::UserTerminalSupervisor;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const MAX_WORKSPACE_SUBSCRIPTIONS: usize = 50;

/// Shared-secret check applied before a connection is admitted.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub token: Option<String>,
}

impl AuthConfig {
    pub fn disabled() -> Self {
        Self { token: None }
    }

    pub fn with_token(token: String) -> Self {
        Self { token: Some(token) }
    }
}

/// Frames queued for a connection's socket writer.
#[derive(Debug, PartialEq)]
pub enum OutboundFrame {
    Event(ServerEvent),
    Ping,
    Close,
}

/// One admitted client connection.
///
/// Holds only back-references: subscriptions are workspace ids, never
/// workspace state, and everything is discarded when the socket closes.
#[derive(Debug)]
pub struct ClientConnection {
    id: u64,
    alive: AtomicBool,
    subscriptions: StdMutex<HashSet<String>>,
    outbound: mpsc::Sender<OutboundFrame>,
}

impl ClientConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Called when the client answers a liveness probe.
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }

    fn subscribed_to(&self, workspace_id: &str) -> bool {
        self.subscriptions
            .lock()
            .expect("subscriptions lock")
            .contains(workspace_id)
    }

    fn send_frame(&self, frame: OutboundFrame) {
        if self.outbound.try_send(frame).is_err() {
            tracing::debug!(connection_id = self.id, "dropping outbound frame");
        }
    }

    fn send_error(&self, err: &WorkdeckError) {
        self.send_frame(OutboundFrame::Event(ServerEvent::Error {
            error: err.to_wire_error(),
        }));
    }
}

struct SupervisorLinks {
    agents: Weak<AgentSupervisor>,
    terminals: Weak<UserTerminalSupervisor>,
}

pub struct Gateway {
    auth: AuthConfig,
    heartbeat_interval: Duration,
    connections: Mutex<HashMap<u64, Arc<ClientConnection>>>,
    next_connection_id: AtomicU64,
    heartbeat: StdMutex<Option<JoinHandle<()>>>,
    links: OnceLock<SupervisorLinks>,
}

impl Gateway {
    pub fn new(auth: AuthConfig) -> Self {
        Self::with_heartbeat_interval(auth, HEARTBEAT_INTERVAL)
    }

    pub fn with_heartbeat_interval(auth: AuthConfig, heartbeat_interval: Duration) -> Self {
        Self {
            auth,
            heartbeat_interval,
            connections: Mutex::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
            heartbeat: StdMutex::new(None),
            links: OnceLock::new(),
        }
    }

    /// Wire up the message-routing targets. Links are weak so the gateway
    /// does not keep the supervisors alive.
    pub fn attach_supervisors(
        &self,
        agents: &Arc<AgentSupervisor>,
        terminals: &Arc<UserTerminalSupervisor>,
    ) {
        let _ = self.links.set(SupervisorLinks {
            agents: Arc::downgrade(agents),
            terminals: Arc::downgrade(terminals),
        });
    }

    /// Validate the shared secret carried on the connection request.
    pub fn authorize(&self, token: Option<&str>) -> Result<(), WorkdeckError> {
        match &self.auth.token {
            None => Ok(()),
            Some(expected) if token == Some(expected.as_str()) => Ok(()),
            Some(_) => Err(WorkdeckError::Unauthorized),
        }
    }

    /// Admit an authenticated connection into the broadcast registry.
    pub async fn register(&self, outbound: mpsc::Sender<OutboundFrame>) -> Arc<ClientConnection> {
        let id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
        let connection = Arc::new(ClientConnection {
            id,
            alive: AtomicBool::new(true),
            subscriptions: StdMutex::new(HashSet::new()),
            outbound,
        });
        self.connections
            .lock()
            .await
            .insert(id, connection.clone());
        tracing::debug!(connection_id = id, "connection registered");
        connection
    }

    /// Drop a connection and its subscription set.
    pub async fn unregister(&self, connection_id: u64) {
        if self.connections.lock().await.remove(&connection_id).is_some() {
            tracing::debug!(connection_id, "connection unregistered");
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Start the liveness sweep. Connections that fail to answer a probe
    /// are closed on the following tick.
    pub fn spawn_heartbeat(self: &Arc<Self>) {
        let gateway = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(gateway.heartbeat_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                gateway.heartbeat_tick().await;
            }
        });
        let mut slot = self.heartbeat.lock().expect("heartbeat lock");
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    async fn heartbeat_tick(&self) {
        let (dead, live) = {
            let mut connections = self.connections.lock().await;
            let dead: Vec<Arc<ClientConnection>> = connections
                .values()
                .filter(|conn| !conn.alive.swap(false, Ordering::SeqCst))
                .cloned()
                .collect();
            for conn in &dead {
                connections.remove(&conn.id);
            }
            let live: Vec<Arc<ClientConnection>> = connections.values().cloned().collect();
            (dead, live)
        };

        for conn in dead {
            tracing::info!(connection_id = conn.id, "closing unresponsive connection");
            conn.send_frame(OutboundFrame::Close);
        }
        for conn in live {
            conn.send_frame(OutboundFrame::Ping);
        }
    }

    /// Send an event to every open connection.
    pub async fn broadcast_all(&self, event: ServerEvent) {
        let connections = self.connections.lock().await;
        for conn in connections.values() {
            conn.send_frame(OutboundFrame::Event(event.clone()));
        }
    }

    /// Send an event to the connections subscribed to `workspace_id`.
    /// This is the scoping mechanism: a connection never receives events
    /// for a workspace it has not subscribed to.
    pub async fn broadcast_to_workspace(&self, workspace_id: &str, event: ServerEvent) {
        let connections = self.connections.lock().await;
        for conn in connections.values() {
            if conn.subscribed_to(workspace_id) {
                conn.send_frame(OutboundFrame::Event(event.clone()));
            }
        }
    }

    /// Handle one inbound text frame. Invalid payloads get a typed error
    /// reply; the connection always stays open.
    pub async fn handle_message(&self, conn: &Arc<ClientConnection>, text: &str) {
        let message: ClientMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(err) => {
                conn.send_error(&WorkdeckError::MalformedMessage {
                    message: err.to_string(),
                });
                return;
            }
        };

        match message {
            ClientMessage::SubscribeWorkspace { workspace_id } => {
                let mut subs = conn.subscriptions.lock().expect("subscriptions lock");
                if !subs.contains(&workspace_id) && subs.len() >= MAX_WORKSPACE_SUBSCRIPTIONS {
                    drop(subs);
                    conn.send_error(&WorkdeckError::SubscriptionLimitExceeded {
                        limit: MAX_WORKSPACE_SUBSCRIPTIONS,
                    });
                } else {
                    subs.insert(workspace_id);
                }
            }
            ClientMessage::UnsubscribeWorkspace { workspace_id } => {
                conn.subscriptions
                    .lock()
                    .expect("subscriptions lock")
                    .remove(&workspace_id);
            }
            ClientMessage::FocusWorkspace { workspace_id } => {
                tracing::debug!(connection_id = conn.id, workspace_id = %workspace_id, "workspace focused");
            }
            ClientMessage::TerminalInput { session_id, data } => {
                let Some(agents) = self.agents() else {
                    return;
                };
                if let Err(err) = agents.send_input(&session_id, &data).await {
                    conn.send_error(&err);
                }
            }
            ClientMessage::TerminalResize {
                session_id,
                cols,
                rows,
            } => {
                if !resize_in_bounds(cols, rows) {
                    conn.send_error(&WorkdeckError::ResizeOutOfBounds { cols, rows });
                    return;
                }
                let Some(agents) = self.agents() else {
                    return;
                };
                if let Err(err) = agents.resize(&session_id, cols, rows).await {
                    tracing::warn!(session_id = %session_id, error = %err, "agent resize failed");
                }
            }
            ClientMessage::UserTerminalInput { terminal_id, data } => {
                let Some(terminals) = self.terminals() else {
                    return;
                };
                if let Err(err) = terminals.send_input(&terminal_id, &data).await {
                    conn.send_error(&err);
                }
            }
            ClientMessage::UserTerminalResize {
                terminal_id,
                cols,
                rows,
            } => {
                if !resize_in_bounds(cols, rows) {
                    conn.send_error(&WorkdeckError::ResizeOutOfBounds { cols, rows });
                    return;
                }
                let Some(terminals) = self.terminals() else {
                    return;
                };
                if let Err(err) = terminals.resize(&terminal_id, cols, rows).await {
                    tracing::warn!(terminal_id = %terminal_id, error = %err, "user terminal resize failed");
                }
            }
        }
    }

    /// Tear the gateway down: stop probing first, then close every
    /// connection with a normal closure, then release the registry.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.heartbeat.lock().expect("heartbeat lock").take() {
            handle.abort();
        }
        let mut connections = self.connections.lock().await;
        for conn in connections.values() {
            conn.send_frame(OutboundFrame::Close);
        }
        connections.clear();
    }

    fn agents(&self) -> Option<Arc<AgentSupervisor>> {
        self.links.get().and_then(|links| links.agents.upgrade())
    }

    fn terminals(&self) -> Option<Arc<UserTerminalSupervisor>> {
        self.links.get().and_then(|links| links.terminals.upgrade())
    }
}
