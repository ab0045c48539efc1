//! Realtime Gateway
//!
//! One actor task owns the connection registry, the chat history and the
//! presence debouncer. Socket tasks talk to it through a cloneable
//! [`GatewayHandle`]; timers are deadlines polled in the actor's loop.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::history::ChatHistory;
use super::presence::{Debouncer, PresenceSnapshot};
use super::protocol::{ClientMessage, ServerMessage};
use super::registry::{ConnectionId, Outbound, Registry, SendOutcome};
use crate::metrics::ServerMetrics;
use crate::models::ChatMessage;
use crate::repository::ChatRepository;

/// Gateway timing and sizing.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Maintenance tick: sweep timed-out connections, ping the rest
    pub ping_interval: Duration,
    /// Silence after which a connection is dropped
    pub pong_timeout: Duration,
    pub presence_debounce: Duration,
    pub history_retention: Duration,
    pub max_history_messages: usize,
    /// Outbound queue length per connection
    pub send_queue: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(30),
            presence_debounce: Duration::from_millis(100),
            history_retention: Duration::from_secs(3600),
            max_history_messages: 500,
            send_queue: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("realtime gateway is gone")]
pub struct GatewayGone;

enum GatewayCommand {
    Connect {
        id: ConnectionId,
        sender: mpsc::Sender<Outbound>,
    },
    Inbound {
        id: ConnectionId,
        message: ClientMessage,
    },
    Pong {
        id: ConnectionId,
    },
    Disconnect {
        id: ConnectionId,
    },
    Snapshot {
        respond_to: oneshot::Sender<PresenceSnapshot>,
    },
    History {
        respond_to: oneshot::Sender<Vec<ChatMessage>>,
    },
}

/// Cloneable handle to the gateway actor.
#[derive(Clone)]
pub struct GatewayHandle {
    sender: mpsc::Sender<GatewayCommand>,
    send_queue: usize,
}

impl GatewayHandle {
    async fn send(&self, cmd: GatewayCommand) -> Result<(), GatewayGone> {
        self.sender.send(cmd).await.map_err(|_| GatewayGone)
    }

    /// Register a new connection. Returns its id and the queue its socket
    /// writer drains; history replay is already queued when this returns.
    pub async fn connect(&self) -> Result<(ConnectionId, mpsc::Receiver<Outbound>), GatewayGone> {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.send_queue);
        self.send(GatewayCommand::Connect {
            id: id.clone(),
            sender: tx,
        })
        .await?;
        Ok((id, rx))
    }

    pub async fn inbound(&self, id: &str, message: ClientMessage) -> Result<(), GatewayGone> {
        self.send(GatewayCommand::Inbound {
            id: id.to_string(),
            message,
        })
        .await
    }

    pub async fn pong(&self, id: &str) -> Result<(), GatewayGone> {
        self.send(GatewayCommand::Pong { id: id.to_string() }).await
    }

    /// Remove a connection. A no-op if maintenance already removed it.
    pub async fn disconnect(&self, id: &str) -> Result<(), GatewayGone> {
        self.send(GatewayCommand::Disconnect { id: id.to_string() })
            .await
    }

    /// Presence as it would be broadcast right now.
    pub async fn snapshot(&self) -> Result<PresenceSnapshot, GatewayGone> {
        let (tx, rx) = oneshot::channel();
        self.send(GatewayCommand::Snapshot { respond_to: tx }).await?;
        rx.await.map_err(|_| GatewayGone)
    }

    pub async fn history(&self) -> Result<Vec<ChatMessage>, GatewayGone> {
        let (tx, rx) = oneshot::channel();
        self.send(GatewayCommand::History { respond_to: tx }).await?;
        rx.await.map_err(|_| GatewayGone)
    }
}

/// Spawn the gateway actor. `seed` warms the chat history (oldest first);
/// with a `store`, accepted chat messages are also written there.
pub fn spawn_gateway(
    settings: GatewaySettings,
    metrics: Arc<ServerMetrics>,
    store: Option<ChatRepository>,
    seed: Vec<ChatMessage>,
) -> GatewayHandle {
    let (tx, rx) = mpsc::channel(1024);

    let mut history = ChatHistory::new(settings.history_retention, settings.max_history_messages);
    history.seed(seed, Utc::now());
    if !history.is_empty() {
        info!("Chat history warmed with {} messages", history.len());
    }

    let send_queue = settings.send_queue;
    let actor = GatewayActor {
        registry: Registry::new(),
        history,
        presence: Debouncer::new(settings.presence_debounce),
        next_maintenance: Instant::now() + settings.ping_interval,
        settings,
        metrics,
        store,
    };
    tokio::spawn(actor.run(rx));

    GatewayHandle {
        sender: tx,
        send_queue,
    }
}

struct GatewayActor {
    settings: GatewaySettings,
    metrics: Arc<ServerMetrics>,
    store: Option<ChatRepository>,
    registry: Registry,
    history: ChatHistory,
    presence: Debouncer,
    next_maintenance: Instant,
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl GatewayActor {
    async fn run(mut self, mut commands: mpsc::Receiver<GatewayCommand>) {
        info!("Realtime gateway started");

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                _ = tokio::time::sleep_until(self.next_maintenance) => {
                    self.maintain(Instant::now());
                }
                _ = wait_until(self.presence.deadline()) => {
                    self.flush_presence(Instant::now());
                }
            }
        }

        for conn in self.registry.all() {
            let _ = conn.sender.try_send(Outbound::Close);
        }
        info!("Realtime gateway stopped");
    }

    fn handle_command(&mut self, cmd: GatewayCommand) {
        match cmd {
            GatewayCommand::Connect { id, sender } => self.handle_connect(id, sender),
            GatewayCommand::Inbound { id, message } => self.handle_inbound(&id, message),
            GatewayCommand::Pong { id } => {
                self.registry.touch_pong(&id, Instant::now());
            }
            GatewayCommand::Disconnect { id } => {
                if self.registry.remove(&id).is_some() {
                    self.metrics.connection_closed();
                    self.presence.trigger(Instant::now());
                    info!(
                        conn_id = %id,
                        listeners = self.registry.count(),
                        "Listener disconnected"
                    );
                }
            }
            GatewayCommand::Snapshot { respond_to } => {
                let _ = respond_to.send(PresenceSnapshot::build(&self.registry.all(), Utc::now()));
            }
            GatewayCommand::History { respond_to } => {
                let _ = respond_to.send(self.history.history(Utc::now()));
            }
        }
    }

    fn handle_connect(&mut self, id: ConnectionId, sender: mpsc::Sender<Outbound>) {
        let now = Instant::now();
        let wall = Utc::now();
        if !self.registry.add(id.clone(), sender, now, wall) {
            warn!(conn_id = %id, "Duplicate connection id ignored");
            return;
        }
        self.metrics.connection_opened();

        let replay = self.history.history(wall);
        let replayed = replay.len();
        for msg in &replay {
            self.send_to(&id, &ServerMessage::from(msg));
        }

        self.presence.trigger(now);
        info!(
            conn_id = %id,
            listeners = self.registry.count(),
            replayed,
            "Listener connected"
        );
    }

    fn handle_inbound(&mut self, id: &str, message: ClientMessage) {
        if self.registry.get(id).is_none() {
            debug!(conn_id = %id, "Message from unregistered connection dropped");
            return;
        }
        let now = Instant::now();
        let wall = Utc::now();

        match message {
            ClientMessage::Join { nickname } => {
                self.registry.touch_activity(id, wall);
                if self.registry.set_nickname(id, &nickname) {
                    info!(conn_id = %id, %nickname, "Listener joined");
                    self.presence.trigger(now);
                }
            }
            ClientMessage::Chat { nickname, text } => {
                self.registry.touch_activity(id, wall);
                if self.registry.set_nickname(id, &nickname) {
                    self.presence.trigger(now);
                }
                let msg = ChatMessage::new(nickname, text, wall);
                self.history.append(msg.clone(), wall);
                self.metrics.chat_message();
                self.persist(&msg);
                self.broadcast(&ServerMessage::from(&msg));
            }
            ClientMessage::ColorUpdate { color, .. } => {
                self.registry.touch_activity(id, wall);
                if self.registry.set_color(id, color) {
                    self.presence.trigger(now);
                }
            }
            ClientMessage::Unknown => {
                self.metrics.message_rejected();
                debug!(conn_id = %id, "Unrecognised message dropped");
            }
        }
    }

    /// Sweep connections that stopped answering pings, then ping the rest.
    fn maintain(&mut self, now: Instant) {
        self.next_maintenance = now + self.settings.ping_interval;

        let expired = self.registry.sweep(now, self.settings.pong_timeout);
        for conn in &expired {
            let _ = conn.sender.try_send(Outbound::Close);
            self.metrics.connection_timed_out();
            info!(conn_id = %conn.id, nickname = ?conn.nickname, "Listener timed out");
        }
        if !expired.is_empty() {
            self.presence.trigger(now);
        }

        for id in self.registry.ids() {
            self.deliver(&id, Outbound::Ping);
        }
    }

    fn flush_presence(&mut self, now: Instant) {
        if !self.presence.fire(now) {
            return;
        }
        let snapshot = PresenceSnapshot::build(&self.registry.all(), Utc::now());
        debug!(listeners = snapshot.listeners, "Broadcasting presence");
        self.metrics.presence_broadcast();
        self.broadcast(&snapshot.to_message());
    }

    fn persist(&self, msg: &ChatMessage) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let msg = msg.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = store.insert_chat_message(&msg).await {
                metrics.persistence_error();
                warn!("Failed to persist chat message: {:#}", e);
            }
        });
    }

    fn broadcast(&mut self, msg: &ServerMessage) {
        let Some(json) = encode(msg) else {
            return;
        };
        for id in self.registry.ids() {
            self.send_text(&id, json.clone());
        }
    }

    fn send_to(&mut self, id: &str, msg: &ServerMessage) {
        if let Some(json) = encode(msg) {
            self.send_text(id, json);
        }
    }

    fn send_text(&mut self, id: &str, json: String) {
        match self.deliver(id, Outbound::Text(json)) {
            SendOutcome::Queued => self.metrics.message_sent(),
            SendOutcome::Dropped => {
                self.metrics.message_dropped();
                debug!(conn_id = %id, "Send queue full, message dropped");
            }
            SendOutcome::Closed | SendOutcome::Missing => {}
        }
    }

    /// Non-blocking send; a closed queue removes the connection.
    fn deliver(&mut self, id: &str, frame: Outbound) -> SendOutcome {
        let outcome = self.registry.try_send(id, frame);
        if outcome == SendOutcome::Closed {
            self.metrics.connection_closed();
            self.presence.trigger(Instant::now());
            debug!(conn_id = %id, "Send queue closed, connection removed");
        }
        outcome
    }
}

fn encode(msg: &ServerMessage) -> Option<String> {
    match serde_json::to_string(msg) {
        Ok(json) => Some(json),
        Err(e) => {
            error!("Failed to serialize message: {}", e);
            None
        }
    }
}
