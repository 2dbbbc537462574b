//! Persistent real-time channel with reconnect and heartbeat
//!
//! The broadcaster is an explicit connection object constructed and owned by
//! the caller; there is no process-global client. One broadcaster maintains
//! one logical connection, scoped to an organization.
//!
//! ## Session lifecycle
//!
//! ```text
//! Disconnected ──► Connecting{attempt} ──► Connected ──► (drop/half-open)
//!                        │                                   │
//!                        │ 5 failed attempts                 └► Connecting
//!                        ▼   (backoff 1s, 2s, 4s, 8s)
//!                      Lost  ── caller calls start() again to recover
//! ```
//!
//! A heartbeat ping goes out every 30s; if the previous ping's pong has not
//! arrived by the next tick the connection is treated as half-open and torn
//! down. Inbound messages are filtered to the subscribed organization — the
//! authoritative filter lives on the server side of the transport contract,
//! and a message that arrives for another organization is dropped and logged
//! as a violation of that contract.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{
    decode_server_frame, encode_client_frame, encode_message, Category, ClientFrame, ControlFrame,
    RealtimeMessage, ServerFrame,
};
use crate::error::RealtimeError;
use crate::sync::SyncEvent;
use crate::types::FieldEvent;

/// Default capacity for the inbound message broadcast channel
const INBOUND_CHANNEL_CAPACITY: usize = 256;

/// One attempt at a transport connection
#[async_trait]
pub trait RealtimeConnection: Send {
    /// Send one text frame
    async fn send(&mut self, text: &str) -> Result<(), RealtimeError>;
    /// Receive the next text frame; `None` means the peer closed cleanly
    async fn recv(&mut self) -> Result<Option<String>, RealtimeError>;
}

/// Factory for transport connections; called again on every reconnect
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    type Conn: RealtimeConnection + 'static;

    async fn connect(&self) -> Result<Self::Conn, RealtimeError>;
}

/// State of the logical connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started, or shut down cleanly
    Disconnected,
    /// Establishing a connection
    Connecting { attempt: u32 },
    /// Subscribed and exchanging frames
    Connected,
    /// Reconnect attempts exhausted; persistent disconnect
    Lost,
}

/// Broadcaster configuration
#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    pub organization_id: String,
    pub user_id: String,
    pub subscriptions: Vec<Category>,
    /// Heartbeat ping cadence; also the pong deadline
    pub heartbeat_interval: Duration,
    /// First reconnect delay; doubles each attempt
    pub reconnect_base: Duration,
    pub reconnect_factor: u32,
    /// Attempts per disconnect before surfacing `Lost`
    pub max_reconnect_attempts: u32,
}

impl BroadcasterConfig {
    pub fn new(organization_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            organization_id: organization_id.into(),
            user_id: user_id.into(),
            subscriptions: Category::all(),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_base: Duration::from_secs(1),
            reconnect_factor: 2,
            max_reconnect_attempts: 5,
        }
    }
}

/// Client side of the real-time channel
pub struct RealtimeBroadcaster<T: RealtimeTransport> {
    transport: Arc<T>,
    config: BroadcasterConfig,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    inbound_tx: broadcast::Sender<RealtimeMessage>,
    outbound_tx: mpsc::UnboundedSender<RealtimeMessage>,
    outbound_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<RealtimeMessage>>>,
    cancel: CancellationToken,
}

impl<T: RealtimeTransport> Clone for RealtimeBroadcaster<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            config: self.config.clone(),
            state_tx: self.state_tx.clone(),
            inbound_tx: self.inbound_tx.clone(),
            outbound_tx: self.outbound_tx.clone(),
            outbound_rx: self.outbound_rx.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<T: RealtimeTransport + 'static> RealtimeBroadcaster<T> {
    pub fn new(transport: Arc<T>, config: BroadcasterConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (inbound_tx, _) = broadcast::channel(INBOUND_CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        Self {
            transport,
            config,
            state_tx: Arc::new(state_tx),
            inbound_tx,
            outbound_tx,
            outbound_rx: Arc::new(tokio::sync::Mutex::new(outbound_rx)),
            cancel: CancellationToken::new(),
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Watch connection state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Subscribe to inbound messages for this organization
    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeMessage> {
        self.inbound_tx.subscribe()
    }

    /// Queue a server-confirmed event for republication.
    ///
    /// Fails with `Unconfirmed` for events that have no `server_id` yet —
    /// unsynced local state is never fanned out. Messages queued while the
    /// connection is down are sent once it is re-established.
    pub fn publish_synced(&self, event: &FieldEvent) -> Result<(), RealtimeError> {
        let message = RealtimeMessage::from_confirmed(event, &self.config.organization_id)?;
        self.outbound_tx
            .send(message)
            .map_err(|_| RealtimeError::ConnectionClosed)
    }

    /// Forward sync confirmations onto the channel.
    ///
    /// Spawns a task consuming `EntrySynced` events from the sync engine and
    /// republishing each confirmed event.
    pub fn mirror_sync_events(&self, mut rx: broadcast::Receiver<SyncEvent>) -> JoinHandle<()> {
        let broadcaster = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(SyncEvent::EntrySynced { event, .. }) => {
                        if let Err(e) = broadcaster.publish_synced(&event) {
                            warn!(error = %e, "Could not republish confirmed event");
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Mirror task lagged behind sync events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Run the connection loop until shutdown or a persistent disconnect.
    ///
    /// After `Lost` the task ends; calling `start()` again begins a fresh
    /// round of reconnect attempts.
    pub fn start(&self) -> JoinHandle<()> {
        let broadcaster = self.clone();
        tokio::spawn(async move { broadcaster.run().await })
    }

    /// Stop the connection loop
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn set_state(&self, state: ConnectionState) {
        debug!(?state, "Realtime state");
        self.state_tx.send_replace(state);
    }

    async fn run(&self) {
        let mut outbound = self.outbound_rx.clone().lock_owned().await;

        'session: loop {
            let mut conn = match self.connect_with_backoff().await {
                Some(conn) => conn,
                None => {
                    if self.cancel.is_cancelled() {
                        self.set_state(ConnectionState::Disconnected);
                    } else {
                        warn!(
                            attempts = self.config.max_reconnect_attempts,
                            "Reconnect attempts exhausted; surfacing persistent disconnect"
                        );
                        self.set_state(ConnectionState::Lost);
                    }
                    return;
                }
            };

            let subscribe = ClientFrame::Subscribe {
                subscriptions: self.config.subscriptions.clone(),
                organization_id: self.config.organization_id.clone(),
                user_id: self.config.user_id.clone(),
            };
            let text = match encode_client_frame(&subscribe) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Could not encode subscribe frame");
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
            };
            if conn.send(&text).await.is_err() {
                continue 'session;
            }

            info!(
                organization = %self.config.organization_id,
                "Realtime channel connected"
            );
            self.set_state(ConnectionState::Connected);

            let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
            heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            heartbeat.tick().await; // consume the immediate first tick
            let mut awaiting_pong = false;

            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        self.set_state(ConnectionState::Disconnected);
                        return;
                    }
                    _ = heartbeat.tick() => {
                        if awaiting_pong {
                            warn!("No pong since last heartbeat; connection is half-open");
                            continue 'session;
                        }
                        let ping = encode_client_frame(&ClientFrame::Ping)
                            .unwrap_or_else(|_| r#"{"type":"ping"}"#.to_string());
                        if conn.send(&ping).await.is_err() {
                            continue 'session;
                        }
                        awaiting_pong = true;
                    }
                    Some(message) = outbound.recv() => {
                        match encode_message(&message) {
                            Ok(text) => {
                                if conn.send(&text).await.is_err() {
                                    warn!("Send failed; reconnecting");
                                    continue 'session;
                                }
                            }
                            Err(e) => warn!(error = %e, "Could not encode outbound message"),
                        }
                    }
                    received = conn.recv() => {
                        match received {
                            Ok(Some(text)) => {
                                if self.handle_inbound(&text, &mut conn, &mut awaiting_pong).await.is_err() {
                                    continue 'session;
                                }
                            }
                            Ok(None) => {
                                info!("Server closed the connection");
                                continue 'session;
                            }
                            Err(e) => {
                                warn!(error = %e, "Receive failed; reconnecting");
                                continue 'session;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Handle one inbound frame. An error means the connection should be
    /// torn down and re-established.
    async fn handle_inbound(
        &self,
        text: &str,
        conn: &mut T::Conn,
        awaiting_pong: &mut bool,
    ) -> Result<(), RealtimeError> {
        match decode_server_frame(text) {
            Ok(ServerFrame::Control(ControlFrame::Pong)) => {
                *awaiting_pong = false;
                Ok(())
            }
            Ok(ServerFrame::Control(ControlFrame::Ping)) => {
                let pong = encode_client_frame(&ClientFrame::Pong)?;
                conn.send(&pong).await
            }
            Ok(ServerFrame::Message(message)) => {
                if message.organization_id != self.config.organization_id {
                    // The transport contract requires server-side scoping;
                    // seeing another tenant's message here means that
                    // boundary failed. Drop it and say so.
                    warn!(
                        received_org = %message.organization_id,
                        subscribed_org = %self.config.organization_id,
                        "Dropping cross-organization message; server-side filter violated"
                    );
                    return Ok(());
                }
                let _ = self.inbound_tx.send(message);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Undecodable frame; ignoring");
                Ok(())
            }
        }
    }

    async fn connect_with_backoff(&self) -> Option<T::Conn> {
        let mut delay = self.config.reconnect_base;

        for attempt in 1..=self.config.max_reconnect_attempts {
            if self.cancel.is_cancelled() {
                return None;
            }
            self.set_state(ConnectionState::Connecting { attempt });

            match self.transport.connect().await {
                Ok(conn) => return Some(conn),
                Err(e) => warn!(attempt, error = %e, "Connect failed"),
            }

            if attempt == self.config.max_reconnect_attempts {
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            delay *= self.config.reconnect_factor;
        }
        None
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// In-memory transport
// ═══════════════════════════════════════════════════════════════════════════

/// In-memory transport over unbounded channels.
///
/// Each `connect()` produces a fresh connection pair and hands the server
/// side to the acceptor returned by [`channel_transport`]. Used by tests and
/// the CLI demo; a production deployment implements [`RealtimeTransport`]
/// over its websocket stack instead.
pub struct ChannelTransport {
    accept_tx: mpsc::UnboundedSender<ServerEndpoint>,
    refuse: Arc<AtomicBool>,
}

/// Server side of one in-memory connection
pub struct ServerEndpoint {
    pub to_client: mpsc::UnboundedSender<String>,
    pub from_client: mpsc::UnboundedReceiver<String>,
}

/// Create an in-memory transport and the acceptor for its server sides
pub fn channel_transport() -> (ChannelTransport, mpsc::UnboundedReceiver<ServerEndpoint>) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    (
        ChannelTransport {
            accept_tx,
            refuse: Arc::new(AtomicBool::new(false)),
        },
        accept_rx,
    )
}

impl ChannelTransport {
    /// Make subsequent `connect()` calls fail (simulated outage)
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

/// Client side of one in-memory connection
pub struct ChannelConnection {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl RealtimeConnection for ChannelConnection {
    async fn send(&mut self, text: &str) -> Result<(), RealtimeError> {
        self.tx
            .send(text.to_string())
            .map_err(|_| RealtimeError::ConnectionClosed)
    }

    async fn recv(&mut self) -> Result<Option<String>, RealtimeError> {
        Ok(self.rx.recv().await)
    }
}

#[async_trait]
impl RealtimeTransport for ChannelTransport {
    type Conn = ChannelConnection;

    async fn connect(&self) -> Result<Self::Conn, RealtimeError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(RealtimeError::Connect("connection refused".into()));
        }

        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();

        self.accept_tx
            .send(ServerEndpoint {
                to_client: server_tx,
                from_client: server_rx,
            })
            .map_err(|_| RealtimeError::Connect("acceptor dropped".into()))?;

        Ok(ChannelConnection {
            tx: client_tx,
            rx: client_rx,
        })
    }
}
