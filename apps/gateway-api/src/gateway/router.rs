//! The orchestrator: connection lifecycle, inbound event dispatch, and the
//! bridge between the fanout bus and local sockets.
//!
//! All collaborators are injected at construction — no ambient globals — so
//! tests swap in in-memory doubles for the bus, directory, persistence and
//! auth seams.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use huddle_common::id::{prefix, prefixed_ulid};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time;

use crate::collab::{AuthProvider, DirectoryService, PersistenceService};
use crate::config::Config;
use crate::error::GatewayError;

use super::events::{presence_topic, EventScope, InboundEvent, OutboundEvent};
use super::fanout::{BusMessage, FanoutBus};
use super::presence::{PresenceChange, PresenceReport, PresenceTracker};
use super::registry::{ConnectionRegistry, DeliveryResult};
use super::rooms::RoomDirectory;

/// What a successful handshake produces; feeds the `ready` event.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub connection_id: String,
    pub user_id: String,
    pub rooms: Vec<String>,
}

pub struct EventRouter {
    config: Arc<Config>,
    registry: ConnectionRegistry,
    rooms: RoomDirectory,
    presence: PresenceTracker,
    bus: Arc<dyn FanoutBus>,
    auth: Arc<dyn AuthProvider>,
    directory: Arc<dyn DirectoryService>,
    persistence: Arc<dyn PersistenceService>,
}

impl EventRouter {
    pub fn new(
        config: Arc<Config>,
        bus: Arc<dyn FanoutBus>,
        auth: Arc<dyn AuthProvider>,
        directory: Arc<dyn DirectoryService>,
        persistence: Arc<dyn PersistenceService>,
    ) -> Self {
        let presence = PresenceTracker::new(&config.process_id);
        Self {
            config,
            registry: ConnectionRegistry::new(),
            rooms: RoomDirectory::new(),
            presence,
            bus,
            auth,
            directory,
            persistence,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn rooms(&self) -> &RoomDirectory {
        &self.rooms
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Authenticate a credential and bring the connection fully online:
    /// register, auto-join every authorized room, mark presence.
    pub async fn connect(
        &self,
        token: &str,
        sender: mpsc::UnboundedSender<Arc<OutboundEvent>>,
    ) -> Result<SessionInfo, GatewayError> {
        let identity = self.auth.verify_credential(token).await?;
        let connection_id = prefixed_ulid(prefix::CONNECTION);

        self.registry
            .register(&connection_id, &identity.user_id, sender)?;

        // Resolve authorized rooms through the directory collaborator. On
        // failure the half-open connection is rolled back.
        let rooms = match self.directory.channels_for_user(&identity.user_id).await {
            Ok(rooms) => rooms,
            Err(e) => {
                self.registry.unregister(&connection_id);
                return Err(e);
            }
        };
        for room_id in &rooms {
            self.rooms.join(room_id, &connection_id);
        }

        if let Some(change) = self.presence.connection_opened(&identity.user_id) {
            self.publish_presence_change(change).await;
        }
        self.publish_local_report().await;

        tracing::info!(
            %connection_id,
            user_id = %identity.user_id,
            rooms = rooms.len(),
            "connection established"
        );

        Ok(SessionInfo {
            connection_id,
            user_id: identity.user_id,
            rooms,
        })
    }

    /// Tear a connection down. Idempotent. Order matters: room cleanup runs
    /// before the presence decrement so membership can still be resolved
    /// while the connection winds down.
    pub async fn disconnect(&self, connection_id: &str) {
        let left_rooms = self.rooms.leave_all(connection_id);
        let Some(entry) = self.registry.unregister(connection_id) else {
            return;
        };

        if let Some(change) = self.presence.connection_closed(&entry.user_id) {
            self.publish_presence_change(change).await;
        }
        self.publish_local_report().await;

        tracing::info!(
            %connection_id,
            user_id = %entry.user_id,
            rooms_left = left_rooms.len(),
            "connection closed"
        );
    }

    // -----------------------------------------------------------------------
    // Inbound events
    // -----------------------------------------------------------------------

    /// Handle one inbound event from an active connection. Recoverable
    /// errors bubble to the caller, which reports them to the origin
    /// connection only; fatal ones close the connection.
    pub async fn handle_event(
        &self,
        connection_id: &str,
        user_id: &str,
        event: InboundEvent,
    ) -> Result<(), GatewayError> {
        match event {
            InboundEvent::Auth { .. } => Err(GatewayError::Protocol(
                "already authenticated".to_string(),
            )),

            InboundEvent::MessageSend {
                channel_id,
                content,
                kind,
            } => {
                self.require_membership(connection_id, &channel_id)?;
                let record = self
                    .persistence
                    .store_message(&channel_id, user_id, &content, &kind)
                    .await?;
                self.publish_event(
                    EventScope::Room(channel_id),
                    OutboundEvent::MessageNew { message: record },
                )
                .await;
                Ok(())
            }

            InboundEvent::MessageTyping {
                channel_id,
                is_typing,
            } => {
                self.require_membership(connection_id, &channel_id)?;
                self.publish_event(
                    EventScope::Room(channel_id.clone()),
                    OutboundEvent::UserTyping {
                        channel_id,
                        user_id: user_id.to_string(),
                        is_typing,
                    },
                )
                .await;
                Ok(())
            }

            InboundEvent::MessageRead {
                message_id,
                channel_id,
            } => {
                self.require_membership(connection_id, &channel_id)?;
                self.persistence
                    .record_activity(
                        user_id,
                        "message:read",
                        serde_json::json!({ "messageId": message_id, "channelId": channel_id }),
                    )
                    .await;
                self.publish_event(
                    EventScope::Room(channel_id.clone()),
                    OutboundEvent::MessageRead {
                        message_id,
                        channel_id,
                        user_id: user_id.to_string(),
                    },
                )
                .await;
                Ok(())
            }

            InboundEvent::ChannelJoin { channel_id } => {
                if !self.directory.can_join(&channel_id, user_id).await? {
                    return Err(GatewayError::Authorization(format!(
                        "cannot join {channel_id}"
                    )));
                }
                self.rooms.join(&channel_id, connection_id);
                // Requesting connection only — not a broadcast.
                self.registry.deliver(
                    connection_id,
                    Arc::new(OutboundEvent::ChannelJoined { channel_id }),
                );
                Ok(())
            }

            InboundEvent::ChannelLeave { channel_id } => {
                self.rooms.leave(&channel_id, connection_id);
                self.registry.deliver(
                    connection_id,
                    Arc::new(OutboundEvent::ChannelLeft { channel_id }),
                );
                Ok(())
            }

            InboundEvent::PresenceUpdate { status } => {
                if let Some(displayed) = self.presence.set_status(user_id, status) {
                    self.publish_event(
                        EventScope::Broadcast,
                        OutboundEvent::UserPresence {
                            user_id: user_id.to_string(),
                            status: displayed,
                            timestamp: Utc::now(),
                        },
                    )
                    .await;
                }
                Ok(())
            }

            InboundEvent::Heartbeat => {
                // Liveness is tracked by the socket loop; just acknowledge.
                self.registry
                    .deliver(connection_id, Arc::new(OutboundEvent::HeartbeatAck));
                Ok(())
            }
        }
    }

    fn require_membership(
        &self,
        connection_id: &str,
        channel_id: &str,
    ) -> Result<(), GatewayError> {
        if self.rooms.rooms_of(connection_id).contains(channel_id) {
            Ok(())
        } else {
            Err(GatewayError::Authorization(format!(
                "not a member of {channel_id}"
            )))
        }
    }

    // -----------------------------------------------------------------------
    // Outbound fanout
    // -----------------------------------------------------------------------

    /// Publish an event for cluster-wide delivery. If the broker is down the
    /// event is dropped cross-process but still delivered to connections on
    /// this process, which don't need the bus.
    pub async fn publish_event(&self, scope: EventScope, event: OutboundEvent) {
        let payload = match serde_json::to_value(&event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(?e, "unserializable outbound event");
                return;
            }
        };
        if let Err(e) = self.bus.publish(&scope.topic(), payload).await {
            tracing::warn!(%e, topic = %scope.topic(), "fanout publish failed, local delivery only");
            self.deliver_local(&scope, Arc::new(event));
        }
    }

    /// Deliver straight to local sockets, bypassing the bus.
    fn deliver_local(&self, scope: &EventScope, event: Arc<OutboundEvent>) {
        let targets = match scope {
            EventScope::Room(room_id) => self.rooms.members_of(room_id),
            EventScope::User(user_id) => self.registry.connections_for_user(user_id),
            EventScope::Broadcast => self.registry.connection_ids(),
        };
        for connection_id in targets {
            self.registry.deliver(&connection_id, event.clone());
        }
    }

    async fn publish_presence_change(&self, change: PresenceChange) {
        let event = if change.online {
            OutboundEvent::UserOnline {
                user_id: change.user_id.clone(),
            }
        } else {
            OutboundEvent::UserOffline {
                user_id: change.user_id.clone(),
            }
        };
        // Both the user's own connections and the wider audience hear about
        // presence flips.
        self.publish_event(EventScope::User(change.user_id.clone()), event.clone())
            .await;
        self.publish_event(EventScope::Broadcast, event).await;
    }

    /// Publish this process's counts so peers can reconcile.
    async fn publish_local_report(&self) {
        let report = self.presence.local_report();
        let topic = presence_topic(self.presence.process_id());
        match serde_json::to_value(&report) {
            Ok(payload) => {
                if let Err(e) = self.bus.publish(&topic, payload).await {
                    tracing::warn!(%e, "presence report publish failed");
                }
            }
            Err(e) => tracing::error!(?e, "unserializable presence report"),
        }
    }

    // -----------------------------------------------------------------------
    // Bus -> local sockets
    // -----------------------------------------------------------------------

    /// Route one bus message to the local connections it concerns.
    pub fn dispatch_bus_message(self: &Arc<Self>, message: BusMessage) {
        if message.topic.strip_prefix("presence.").is_some() {
            self.apply_presence_payload(&message.payload);
            return;
        }

        let event: OutboundEvent = match serde_json::from_value(message.payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(?e, topic = %message.topic, "undecodable bus event dropped");
                return;
            }
        };
        let event = Arc::new(event);

        let targets = if let Some(room_id) = message.topic.strip_prefix("room.") {
            self.rooms.members_of(room_id)
        } else if let Some(user_id) = message.topic.strip_prefix("user.") {
            self.registry.connections_for_user(user_id)
        } else if message.topic == "broadcast" {
            self.registry.connection_ids()
        } else {
            tracing::warn!(topic = %message.topic, "bus message on unknown topic");
            return;
        };

        for connection_id in targets {
            if self.registry.deliver(&connection_id, event.clone()) == DeliveryResult::ConnectionGone
            {
                // Socket died under us; clean up off this path.
                let router = self.clone();
                tokio::spawn(async move { router.disconnect(&connection_id).await });
            }
        }
    }

    fn apply_presence_payload(self: &Arc<Self>, payload: &Value) {
        let report: PresenceReport = match serde_json::from_value(payload.clone()) {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(?e, "undecodable presence report dropped");
                return;
            }
        };
        let changes = self.presence.apply_report(&report);
        self.deliver_presence_changes(changes);
    }

    /// Flips derived from peer state are local knowledge repair: deliver to
    /// this process's connections, never re-published (peers run the same
    /// reconciliation themselves).
    fn deliver_presence_changes(self: &Arc<Self>, changes: Vec<PresenceChange>) {
        for change in changes {
            let event = if change.online {
                OutboundEvent::UserOnline {
                    user_id: change.user_id,
                }
            } else {
                OutboundEvent::UserOffline {
                    user_id: change.user_id,
                }
            };
            self.deliver_local(&EventScope::Broadcast, Arc::new(event));
        }
    }

    /// Expire silent peers now. Exposed for the reporter task and tests.
    pub fn expire_presence_peers(self: &Arc<Self>, ttl: Duration) {
        let changes = self.presence.expire_stale_peers(ttl);
        self.deliver_presence_changes(changes);
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Forward bus traffic to local sockets. One instance per process; runs until
/// the bus closes.
pub async fn run_fanout_dispatcher(router: Arc<EventRouter>) -> Result<(), GatewayError> {
    let bus = router.bus.clone();
    let mut room_sub = bus.subscribe("room.*").await?;
    let mut user_sub = bus.subscribe("user.*").await?;
    let mut broadcast_sub = bus.subscribe("broadcast").await?;
    let mut presence_sub = bus.subscribe("presence.*").await?;

    loop {
        let message = tokio::select! {
            msg = room_sub.recv() => msg,
            msg = user_sub.recv() => msg,
            msg = broadcast_sub.recv() => msg,
            msg = presence_sub.recv() => msg,
        };
        match message {
            Some(message) => router.dispatch_bus_message(message),
            None => {
                tracing::warn!("fanout subscription closed, dispatcher exiting");
                return Ok(());
            }
        }
    }
}

/// Periodically publish this process's presence counts, expire silent peers,
/// and re-broadcast after every bus reconnect (broadcasts lost during an
/// outage are not replayed, so this is the repair path).
pub async fn run_presence_reporter(router: Arc<EventRouter>) {
    let report_interval = Duration::from_secs(router.config.presence_report_interval_secs);
    let peer_ttl = Duration::from_secs(router.config.presence_peer_ttl_secs);

    let mut reconnects = router.bus.reconnects();
    let mut ticker = time::interval(report_interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                router.publish_local_report().await;
                router.expire_presence_peers(peer_ttl);
            }
            changed = reconnects.changed() => {
                if changed.is_err() {
                    return;
                }
                tracing::info!("fanout reconnected, re-broadcasting presence counts");
                router.publish_local_report().await;
            }
        }
    }
}
