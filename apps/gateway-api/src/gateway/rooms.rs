//! Process-local room <-> connection index.
//!
//! A bidirectional multimap: both directions are mutated under one mutex so
//! they can never diverge, and `leave_all` is atomic with respect to
//! concurrent `members_of` readers. This is a pure index — authorization
//! happens in the router before anything reaches here.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

#[derive(Default)]
struct Index {
    rooms: HashMap<String, HashSet<String>>,
    connections: HashMap<String, HashSet<String>>,
}

pub struct RoomDirectory {
    index: Mutex<Index>,
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self {
            index: Mutex::new(Index::default()),
        }
    }

    /// Add a membership edge. Idempotent.
    pub fn join(&self, room_id: &str, connection_id: &str) {
        let mut index = self.index.lock();
        index
            .rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
        index
            .connections
            .entry(connection_id.to_string())
            .or_default()
            .insert(room_id.to_string());
    }

    /// Remove a membership edge. Idempotent.
    pub fn leave(&self, room_id: &str, connection_id: &str) {
        let mut index = self.index.lock();
        remove_edge(&mut index.rooms, room_id, connection_id);
        remove_edge(&mut index.connections, connection_id, room_id);
    }

    /// Remove every membership for a dying connection in one atomic step.
    /// Returns the set of rooms it was in.
    pub fn leave_all(&self, connection_id: &str) -> HashSet<String> {
        let mut index = self.index.lock();
        let rooms = index.connections.remove(connection_id).unwrap_or_default();
        for room_id in &rooms {
            remove_edge(&mut index.rooms, room_id, connection_id);
        }
        rooms
    }

    /// Snapshot of the connections currently in a room.
    pub fn members_of(&self, room_id: &str) -> Vec<String> {
        let index = self.index.lock();
        index
            .rooms
            .get(room_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of the rooms a connection is in.
    pub fn rooms_of(&self, connection_id: &str) -> HashSet<String> {
        let index = self.index.lock();
        index
            .connections
            .get(connection_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.index.lock().rooms.len()
    }
}

/// Drop `value` from the set at `key`, removing the set when it empties.
fn remove_edge(map: &mut HashMap<String, HashSet<String>>, key: &str, value: &str) {
    if let Some(set) = map.get_mut(key) {
        set.remove(value);
        if set.is_empty() {
            map.remove(key);
        }
    }
}

impl Default for RoomDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The two index directions must agree at every quiescent point.
    fn assert_consistent(directory: &RoomDirectory) {
        let index = directory.index.lock();
        for (room, members) in &index.rooms {
            for conn in members {
                assert!(
                    index.connections.get(conn).is_some_and(|r| r.contains(room)),
                    "room {room} lists {conn}, but {conn} does not list {room}"
                );
            }
        }
        for (conn, rooms) in &index.connections {
            for room in rooms {
                assert!(
                    index.rooms.get(room).is_some_and(|m| m.contains(conn)),
                    "{conn} lists {room}, but {room} does not list {conn}"
                );
            }
        }
    }

    #[test]
    fn join_is_idempotent() {
        let directory = RoomDirectory::new();
        directory.join("room_1", "conn_a");
        directory.join("room_1", "conn_a");

        assert_eq!(directory.members_of("room_1"), vec!["conn_a"]);
        assert_eq!(directory.rooms_of("conn_a").len(), 1);
        assert_consistent(&directory);
    }

    #[test]
    fn leave_is_idempotent() {
        let directory = RoomDirectory::new();
        directory.join("room_1", "conn_a");

        directory.leave("room_1", "conn_a");
        directory.leave("room_1", "conn_a");
        directory.leave("room_never", "conn_a");

        assert!(directory.members_of("room_1").is_empty());
        assert!(directory.rooms_of("conn_a").is_empty());
        assert_consistent(&directory);
    }

    #[test]
    fn leave_all_returns_rooms_and_clears_both_sides() {
        let directory = RoomDirectory::new();
        directory.join("room_1", "conn_a");
        directory.join("room_2", "conn_a");
        directory.join("room_1", "conn_b");

        let mut left: Vec<String> = directory.leave_all("conn_a").into_iter().collect();
        left.sort();
        assert_eq!(left, vec!["room_1", "room_2"]);

        assert_eq!(directory.members_of("room_1"), vec!["conn_b"]);
        assert!(directory.members_of("room_2").is_empty());
        assert!(directory.rooms_of("conn_a").is_empty());
        assert_consistent(&directory);

        // Second leave_all is a no-op with an empty result.
        assert!(directory.leave_all("conn_a").is_empty());
    }

    #[test]
    fn membership_is_connection_scoped() {
        let directory = RoomDirectory::new();
        // Same user on two connections: two independent edges.
        directory.join("room_1", "conn_a");
        directory.join("room_1", "conn_b");

        directory.leave_all("conn_a");
        assert_eq!(directory.members_of("room_1"), vec!["conn_b"]);
        assert_consistent(&directory);
    }

    #[test]
    fn empty_rooms_are_dropped_from_the_index() {
        let directory = RoomDirectory::new();
        directory.join("room_1", "conn_a");
        directory.leave("room_1", "conn_a");
        assert_eq!(directory.room_count(), 0);
    }

    #[test]
    fn concurrent_churn_keeps_directions_in_sync() {
        use std::sync::Arc;

        let directory = Arc::new(RoomDirectory::new());
        let mut handles = Vec::new();

        for t in 0..8 {
            let directory = directory.clone();
            handles.push(std::thread::spawn(move || {
                let conn = format!("conn_{t}");
                for i in 0..200 {
                    let room = format!("room_{}", i % 5);
                    directory.join(&room, &conn);
                    if i % 3 == 0 {
                        directory.leave(&room, &conn);
                    }
                    if i % 50 == 49 {
                        directory.leave_all(&conn);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_consistent(&directory);
    }
}
