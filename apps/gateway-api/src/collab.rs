//! Collaborator contracts consumed by the event-distribution core.
//!
//! Persistence, directory lookups and credential verification are external
//! concerns. The core talks to them through these narrow traits; production
//! wires real services in, tests and single-process deployments use the
//! in-memory implementations below.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use huddle_common::id::{prefix, prefixed_ulid};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;

/// The identity bound to a connection after a successful handshake.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub roles: Vec<String>,
}

/// A durably stored message, as returned by the persistence collaborator.
/// Fans out to room members as the `message:new` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: String,
    pub channel_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub created_at: DateTime<Utc>,
}

/// Verifies the credential presented during the connection handshake.
/// Called once per connection.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn verify_credential(&self, token: &str) -> Result<Identity, GatewayError>;
}

/// Resolves user -> channel memberships and join permissions.
#[async_trait]
pub trait DirectoryService: Send + Sync {
    async fn channels_for_user(&self, user_id: &str) -> Result<Vec<String>, GatewayError>;
    async fn is_member(&self, room_id: &str, user_id: &str) -> Result<bool, GatewayError>;
    async fn can_join(&self, room_id: &str, user_id: &str) -> Result<bool, GatewayError>;
}

/// Durable side effects: message storage and fire-and-forget activity records.
#[async_trait]
pub trait PersistenceService: Send + Sync {
    async fn store_message(
        &self,
        room_id: &str,
        sender_id: &str,
        content: &str,
        kind: &str,
    ) -> Result<MessageRecord, GatewayError>;

    /// Best-effort; failures are logged by the implementation, never surfaced.
    async fn record_activity(&self, user_id: &str, action: &str, detail: Value);
}

// ---------------------------------------------------------------------------
// In-memory implementations (single-process deployments / tests)
// ---------------------------------------------------------------------------

/// Token -> identity map.
pub struct MemoryAuth {
    tokens: Mutex<HashMap<String, Identity>>,
}

impl MemoryAuth {
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn issue(&self, token: &str, user_id: &str) {
        self.tokens.lock().unwrap().insert(
            token.to_string(),
            Identity {
                user_id: user_id.to_string(),
                roles: Vec::new(),
            },
        );
    }
}

impl Default for MemoryAuth {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthProvider for MemoryAuth {
    async fn verify_credential(&self, token: &str) -> Result<Identity, GatewayError> {
        self.tokens
            .lock()
            .unwrap()
            .get(token)
            .cloned()
            .ok_or_else(|| GatewayError::Auth("invalid or expired credential".to_string()))
    }
}

/// User -> room membership map plus a set of rooms anyone may join.
pub struct MemoryDirectory {
    memberships: Mutex<HashMap<String, HashSet<String>>>,
    open_rooms: Mutex<HashSet<String>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self {
            memberships: Mutex::new(HashMap::new()),
            open_rooms: Mutex::new(HashSet::new()),
        }
    }

    /// Make `user_id` a member of `room_id`.
    pub fn grant(&self, user_id: &str, room_id: &str) {
        self.memberships
            .lock()
            .unwrap()
            .entry(user_id.to_string())
            .or_default()
            .insert(room_id.to_string());
    }

    /// Mark a room as joinable by any authenticated user.
    pub fn open_room(&self, room_id: &str) {
        self.open_rooms.lock().unwrap().insert(room_id.to_string());
    }
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DirectoryService for MemoryDirectory {
    async fn channels_for_user(&self, user_id: &str) -> Result<Vec<String>, GatewayError> {
        let memberships = self.memberships.lock().unwrap();
        let mut rooms: Vec<String> = memberships
            .get(user_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        Ok(rooms)
    }

    async fn is_member(&self, room_id: &str, user_id: &str) -> Result<bool, GatewayError> {
        let memberships = self.memberships.lock().unwrap();
        Ok(memberships
            .get(user_id)
            .map(|set| set.contains(room_id))
            .unwrap_or(false))
    }

    async fn can_join(&self, room_id: &str, user_id: &str) -> Result<bool, GatewayError> {
        if self.is_member(room_id, user_id).await? {
            return Ok(true);
        }
        Ok(self.open_rooms.lock().unwrap().contains(room_id))
    }
}

/// Appends messages and activity records to in-memory logs.
pub struct MemoryPersistence {
    messages: Mutex<Vec<MessageRecord>>,
    activity: Mutex<Vec<(String, String, Value)>>,
    fail_writes: std::sync::atomic::AtomicBool,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            activity: Mutex::new(Vec::new()),
            fail_writes: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Snapshot of everything stored so far.
    pub fn messages(&self) -> Vec<MessageRecord> {
        self.messages.lock().unwrap().clone()
    }

    pub fn activity(&self) -> Vec<(String, String, Value)> {
        self.activity.lock().unwrap().clone()
    }

    /// Make subsequent `store_message` calls fail (simulates a dead store).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistenceService for MemoryPersistence {
    async fn store_message(
        &self,
        room_id: &str,
        sender_id: &str,
        content: &str,
        kind: &str,
    ) -> Result<MessageRecord, GatewayError> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(GatewayError::Persistence("write rejected".to_string()));
        }
        let record = MessageRecord {
            id: prefixed_ulid(prefix::MESSAGE),
            channel_id: room_id.to_string(),
            sender_id: sender_id.to_string(),
            content: content.to_string(),
            kind: kind.to_string(),
            created_at: Utc::now(),
        };
        self.messages.lock().unwrap().push(record.clone());
        Ok(record)
    }

    async fn record_activity(&self, user_id: &str, action: &str, detail: Value) {
        self.activity
            .lock()
            .unwrap()
            .push((user_id.to_string(), action.to_string(), detail));
    }
}
