//! Local connection bookkeeping.
//!
//! The registry is the only component that pushes bytes toward a socket:
//! each connection's event loop owns the receiving half of an unbounded mpsc
//! queue, and the registry holds the sending half. Everything else refers to
//! connections by id only.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::error::GatewayError;

use super::events::OutboundEvent;

/// Outcome of a delivery attempt. Never an error: a vanished connection is a
/// normal race, not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryResult {
    Delivered,
    ConnectionGone,
}

/// A live, authenticated connection.
pub struct ConnectionEntry {
    pub user_id: String,
    pub opened_at: DateTime<Utc>,
    sender: mpsc::UnboundedSender<Arc<OutboundEvent>>,
}

/// Registry of all live connections on this process.
///
/// Uses `DashMap` for shard-level concurrency; the per-user index is kept
/// best-effort consistent and read as a snapshot.
pub struct ConnectionRegistry {
    connections: DashMap<String, ConnectionEntry>,
    by_user: DashMap<String, HashSet<String>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            by_user: DashMap::new(),
        }
    }

    /// Register an authenticated connection. Unauthenticated sockets never
    /// reach this point.
    ///
    /// A duplicate id means the caller broke the one-registration-per-socket
    /// invariant; the connection is rejected and the defect logged.
    pub fn register(
        &self,
        connection_id: &str,
        user_id: &str,
        sender: mpsc::UnboundedSender<Arc<OutboundEvent>>,
    ) -> Result<(), GatewayError> {
        match self.connections.entry(connection_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                tracing::error!(%connection_id, "duplicate connection registration");
                Err(GatewayError::DuplicateConnection(connection_id.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(ConnectionEntry {
                    user_id: user_id.to_string(),
                    opened_at: Utc::now(),
                    sender,
                });
                self.by_user
                    .entry(user_id.to_string())
                    .or_default()
                    .insert(connection_id.to_string());
                Ok(())
            }
        }
    }

    /// Remove a connection. Idempotent: a second call returns `None`.
    pub fn unregister(&self, connection_id: &str) -> Option<ConnectionEntry> {
        let (_, entry) = self.connections.remove(connection_id)?;
        if let Some(mut set) = self.by_user.get_mut(&entry.user_id) {
            set.remove(connection_id);
        }
        self.by_user
            .remove_if(&entry.user_id, |_, set| set.is_empty());
        Some(entry)
    }

    /// Queue an event for delivery to one connection.
    pub fn deliver(&self, connection_id: &str, event: Arc<OutboundEvent>) -> DeliveryResult {
        match self.connections.get(connection_id) {
            Some(entry) if entry.sender.send(event).is_ok() => DeliveryResult::Delivered,
            _ => DeliveryResult::ConnectionGone,
        }
    }

    /// Snapshot of the user's live connection ids. May be stale by the time
    /// the caller uses it; deliveries to vanished ids report `ConnectionGone`.
    pub fn connections_for_user(&self, user_id: &str) -> Vec<String> {
        self.by_user
            .get(user_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of every live connection id (broadcast scope).
    pub fn connection_ids(&self) -> Vec<String> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    pub fn user_of(&self, connection_id: &str) -> Option<String> {
        self.connections
            .get(connection_id)
            .map(|e| e.user_id.clone())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
