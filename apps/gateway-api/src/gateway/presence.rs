//! Replicated per-user presence, converged across processes without a shared
//! store.
//!
//! Each process tracks the connection counts it owns (`local`) and the counts
//! last reported by every peer process (`remote`, replaced per process, never
//! accumulated — duplicate reports are harmless). A user is online iff the
//! effective total is above zero anywhere in the cluster. Peers that stop
//! reporting are expired after a TTL so a crashed process cannot pin a user
//! online forever.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::events::PresenceStatus;

/// Offline entries older than this are dropped entirely (memory cleanup).
const OFFLINE_RETENTION: Duration = Duration::from_secs(5 * 60);

/// One process's counts, published on `presence.<processId>` and replayed on
/// bus reconnect to repair divergence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceReport {
    pub process_id: String,
    /// user id -> live connection count on that process. Users at zero are
    /// simply absent.
    pub counts: HashMap<String, u32>,
}

/// An effective online/offline flip observed by this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceChange {
    pub user_id: String,
    pub online: bool,
}

struct UserPresence {
    local: u32,
    remote: HashMap<String, u32>,
    /// Client-set away/busy override; cleared when the user fully disconnects.
    explicit: Option<PresenceStatus>,
    last_seen: DateTime<Utc>,
    /// Wall position of the last mutation, for offline-entry cleanup.
    touched: Instant,
}

impl UserPresence {
    fn effective(&self) -> u32 {
        self.local + self.remote.values().sum::<u32>()
    }
}

pub struct PresenceTracker {
    process_id: String,
    users: DashMap<String, UserPresence>,
    /// Peer process id -> when it last reported.
    peers: DashMap<String, Instant>,
}

impl PresenceTracker {
    pub fn new(process_id: &str) -> Self {
        Self {
            process_id: process_id.to_string(),
            users: DashMap::new(),
            peers: DashMap::new(),
        }
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// A local connection registered for `user_id`. The increment and the
    /// threshold check happen under the entry's shard lock, so two
    /// near-simultaneous connects cannot both observe the 0->1 edge.
    pub fn connection_opened(&self, user_id: &str) -> Option<PresenceChange> {
        let mut entry = self
            .users
            .entry(user_id.to_string())
            .or_insert_with(new_user);
        let before = entry.effective();
        entry.local += 1;
        entry.last_seen = Utc::now();
        entry.touched = Instant::now();
        (before == 0).then(|| PresenceChange {
            user_id: user_id.to_string(),
            online: true,
        })
    }

    /// A local connection for `user_id` went away. Emits the offline flip
    /// only when no connection remains anywhere — the user may still be
    /// online through another process.
    pub fn connection_closed(&self, user_id: &str) -> Option<PresenceChange> {
        let mut entry = self.users.get_mut(user_id)?;
        if entry.local == 0 {
            return None;
        }
        entry.local -= 1;
        entry.last_seen = Utc::now();
        entry.touched = Instant::now();
        if entry.effective() == 0 {
            // A fully disconnected user cannot stay "away".
            entry.explicit = None;
            Some(PresenceChange {
                user_id: user_id.to_string(),
                online: false,
            })
        } else {
            None
        }
    }

    /// Client-requested status. `offline` (and `online`) clear the override;
    /// `away`/`busy` set it. Returns the newly displayed status when it
    /// changed. Ignored for users with no live connection.
    pub fn set_status(&self, user_id: &str, status: PresenceStatus) -> Option<PresenceStatus> {
        let mut entry = self.users.get_mut(user_id)?;
        if entry.effective() == 0 {
            return None;
        }
        let before = displayed(&entry);
        entry.explicit = match status {
            PresenceStatus::Away | PresenceStatus::Busy => Some(status),
            PresenceStatus::Online | PresenceStatus::Offline => None,
        };
        entry.touched = Instant::now();
        let after = displayed(&entry);
        (after != before).then_some(after)
    }

    /// The status the rest of the system should display for this user.
    pub fn status_of(&self, user_id: &str) -> PresenceStatus {
        match self.users.get(user_id) {
            Some(entry) if entry.effective() > 0 => displayed(&entry),
            _ => PresenceStatus::Offline,
        }
    }

    pub fn last_seen(&self, user_id: &str) -> Option<DateTime<Utc>> {
        self.users.get(user_id).map(|entry| entry.last_seen)
    }

    /// Apply a peer's report, replacing that process's contribution for every
    /// user. Users the peer stopped mentioning drop to zero. Returns the
    /// effective flips, which the caller delivers to local connections.
    pub fn apply_report(&self, report: &PresenceReport) -> Vec<PresenceChange> {
        if report.process_id == self.process_id {
            return Vec::new();
        }
        self.peers.insert(report.process_id.clone(), Instant::now());

        let mut changes = Vec::new();

        for (user_id, &count) in &report.counts {
            let mut entry = self
                .users
                .entry(user_id.clone())
                .or_insert_with(new_user);
            let before = entry.effective();
            if count == 0 {
                entry.remote.remove(&report.process_id);
            } else {
                entry.remote.insert(report.process_id.clone(), count);
            }
            push_flip(&mut changes, user_id, before, entry.effective());
            if entry.effective() == 0 {
                entry.explicit = None;
            }
        }

        // Users this peer previously reported but no longer mentions.
        for mut entry in self.users.iter_mut() {
            if report.counts.contains_key(entry.key()) {
                continue;
            }
            if entry.remote.contains_key(&report.process_id) {
                let user_id = entry.key().clone();
                let before = entry.effective();
                entry.remote.remove(&report.process_id);
                push_flip(&mut changes, &user_id, before, entry.effective());
                if entry.effective() == 0 {
                    entry.explicit = None;
                }
            }
        }

        changes
    }

    /// Zero the contributions of peers silent for longer than `ttl`, and drop
    /// long-offline user entries. Returns the effective flips.
    pub fn expire_stale_peers(&self, ttl: Duration) -> Vec<PresenceChange> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .peers
            .iter()
            .filter(|entry| now.duration_since(*entry.value()) > ttl)
            .map(|entry| entry.key().clone())
            .collect();
        for process_id in &expired {
            self.peers.remove(process_id);
            tracing::warn!(%process_id, "presence peer expired, zeroing its counts");
        }

        let mut changes = Vec::new();
        if !expired.is_empty() {
            for mut entry in self.users.iter_mut() {
                let user_id = entry.key().clone();
                let before = entry.effective();
                entry.remote.retain(|process_id, _| !expired.contains(process_id));
                push_flip(&mut changes, &user_id, before, entry.effective());
                if entry.effective() == 0 {
                    entry.explicit = None;
                }
            }
        }

        // Memory cleanup: forget users that have been offline for a while.
        self.users
            .retain(|_, entry| entry.effective() > 0 || now.duration_since(entry.touched) < OFFLINE_RETENTION);

        changes
    }

    /// Snapshot of this process's own counts, for the presence topic.
    pub fn local_report(&self) -> PresenceReport {
        let counts = self
            .users
            .iter()
            .filter(|entry| entry.local > 0)
            .map(|entry| (entry.key().clone(), entry.local))
            .collect();
        PresenceReport {
            process_id: self.process_id.clone(),
            counts,
        }
    }
}

fn new_user() -> UserPresence {
    UserPresence {
        local: 0,
        remote: HashMap::new(),
        explicit: None,
        last_seen: Utc::now(),
        touched: Instant::now(),
    }
}

fn displayed(entry: &UserPresence) -> PresenceStatus {
    entry.explicit.unwrap_or(PresenceStatus::Online)
}

fn push_flip(changes: &mut Vec<PresenceChange>, user_id: &str, before: u32, after: u32) {
    if before == 0 && after > 0 {
        changes.push(PresenceChange {
            user_id: user_id.to_string(),
            online: true,
        });
    } else if before > 0 && after == 0 {
        changes.push(PresenceChange {
            user_id: user_id.to_string(),
            online: false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(process_id: &str, counts: &[(&str, u32)]) -> PresenceReport {
        PresenceReport {
            process_id: process_id.to_string(),
            counts: counts
                .iter()
                .map(|(u, n)| (u.to_string(), *n))
                .collect(),
        }
    }

    #[test]
    fn first_connection_flips_online() {
        let tracker = PresenceTracker::new("proc_1");

        let change = tracker.connection_opened("usr_a").unwrap();
        assert!(change.online);
        assert_eq!(tracker.status_of("usr_a"), PresenceStatus::Online);

        // Second connection: no flip.
        assert!(tracker.connection_opened("usr_a").is_none());
    }

    #[test]
    fn offline_only_when_all_connections_gone() {
        let tracker = PresenceTracker::new("proc_1");
        tracker.connection_opened("usr_a");
        tracker.connection_opened("usr_a");

        assert!(tracker.connection_closed("usr_a").is_none());
        assert_eq!(tracker.status_of("usr_a"), PresenceStatus::Online);

        let change = tracker.connection_closed("usr_a").unwrap();
        assert!(!change.online);
        assert_eq!(tracker.status_of("usr_a"), PresenceStatus::Offline);
    }

    #[test]
    fn close_for_unknown_or_drained_user_is_a_no_op() {
        let tracker = PresenceTracker::new("proc_1");
        assert!(tracker.connection_closed("usr_ghost").is_none());

        tracker.connection_opened("usr_a");
        tracker.connection_closed("usr_a");
        // No double offline.
        assert!(tracker.connection_closed("usr_a").is_none());
    }

    #[test]
    fn remote_connections_keep_user_online() {
        let tracker = PresenceTracker::new("proc_1");
        tracker.connection_opened("usr_a");
        tracker.apply_report(&report("proc_2", &[("usr_a", 1)]));

        // Last local connection drops, but proc_2 still has one.
        assert!(tracker.connection_closed("usr_a").is_none());
        assert_eq!(tracker.status_of("usr_a"), PresenceStatus::Online);

        // Peer report goes to zero: now the flip happens.
        let changes = tracker.apply_report(&report("proc_2", &[]));
        assert_eq!(
            changes,
            vec![PresenceChange {
                user_id: "usr_a".to_string(),
                online: false
            }]
        );
        assert_eq!(tracker.status_of("usr_a"), PresenceStatus::Offline);
    }

    #[test]
    fn reports_replace_not_accumulate() {
        let tracker = PresenceTracker::new("proc_1");

        let changes = tracker.apply_report(&report("proc_2", &[("usr_a", 2)]));
        assert_eq!(changes.len(), 1);
        assert!(changes[0].online);

        // Duplicate delivery of the same report: no flip, no double count.
        assert!(tracker.apply_report(&report("proc_2", &[("usr_a", 2)])).is_empty());

        // Replaced with 1, still online.
        assert!(tracker.apply_report(&report("proc_2", &[("usr_a", 1)])).is_empty());
        assert_eq!(tracker.status_of("usr_a"), PresenceStatus::Online);
    }

    #[test]
    fn own_reports_are_ignored() {
        let tracker = PresenceTracker::new("proc_1");
        assert!(tracker.apply_report(&report("proc_1", &[("usr_a", 3)])).is_empty());
        assert_eq!(tracker.status_of("usr_a"), PresenceStatus::Offline);
    }

    #[test]
    fn crashed_peer_expires_after_ttl() {
        let tracker = PresenceTracker::new("proc_2");
        tracker.apply_report(&report("proc_1", &[("usr_a", 1)]));
        assert_eq!(tracker.status_of("usr_a"), PresenceStatus::Online);

        // Within the TTL nothing changes.
        assert!(tracker.expire_stale_peers(Duration::from_secs(60)).is_empty());
        assert_eq!(tracker.status_of("usr_a"), PresenceStatus::Online);

        // proc_1 crashed without unregistering; zero-TTL sweep expires it.
        let changes = tracker.expire_stale_peers(Duration::ZERO);
        assert_eq!(
            changes,
            vec![PresenceChange {
                user_id: "usr_a".to_string(),
                online: false
            }]
        );
        assert_eq!(tracker.status_of("usr_a"), PresenceStatus::Offline);

        // A second sweep finds nothing.
        assert!(tracker.expire_stale_peers(Duration::ZERO).is_empty());
    }

    #[test]
    fn explicit_status_overrides_while_connected() {
        let tracker = PresenceTracker::new("proc_1");
        tracker.connection_opened("usr_a");

        assert_eq!(
            tracker.set_status("usr_a", PresenceStatus::Away),
            Some(PresenceStatus::Away)
        );
        assert_eq!(tracker.status_of("usr_a"), PresenceStatus::Away);

        // Same status twice: no change to report.
        assert!(tracker.set_status("usr_a", PresenceStatus::Away).is_none());

        // Back to online clears the override.
        assert_eq!(
            tracker.set_status("usr_a", PresenceStatus::Online),
            Some(PresenceStatus::Online)
        );
    }

    #[test]
    fn disconnected_user_cannot_be_away() {
        let tracker = PresenceTracker::new("proc_1");
        assert!(tracker.set_status("usr_a", PresenceStatus::Away).is_none());

        tracker.connection_opened("usr_a");
        tracker.set_status("usr_a", PresenceStatus::Busy);
        tracker.connection_closed("usr_a");

        // Override was cleared with the last connection.
        assert_eq!(tracker.status_of("usr_a"), PresenceStatus::Offline);
        tracker.connection_opened("usr_a");
        assert_eq!(tracker.status_of("usr_a"), PresenceStatus::Online);
    }

    #[test]
    fn local_report_lists_only_locally_connected_users() {
        let tracker = PresenceTracker::new("proc_1");
        tracker.connection_opened("usr_a");
        tracker.connection_opened("usr_a");
        tracker.connection_opened("usr_b");
        tracker.connection_closed("usr_b");
        tracker.apply_report(&report("proc_2", &[("usr_c", 1)]));

        let report = tracker.local_report();
        assert_eq!(report.process_id, "proc_1");
        assert_eq!(report.counts.get("usr_a"), Some(&2));
        assert!(!report.counts.contains_key("usr_b"));
        assert!(!report.counts.contains_key("usr_c"));
    }

    #[test]
    fn concurrent_opens_fire_online_exactly_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let tracker = Arc::new(PresenceTracker::new("proc_1"));
        let flips = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let tracker = tracker.clone();
            let flips = flips.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    if tracker.connection_opened("usr_a").is_some() {
                        flips.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(flips.load(Ordering::SeqCst), 1);
    }
}
