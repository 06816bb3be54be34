//! Namespace/room membership index (C6).
//!
//! Two maps kept in lock-step: forward `ns -> room -> {client}` (plus a
//! no-room bucket) and reverse `client -> (ns, {room})`. Every operation here is
//! O(1) amortized; `iterate` snapshots before yielding so a broadcast's fan-out
//! tolerates handlers that join/leave mid-delivery.

use std::collections::{HashMap, HashSet};

use crate::client::ClientId;

pub const DEFAULT_NAMESPACE: &str = "/";
/// Sentinel room key for "clients in the namespace but in no room".
const NO_ROOM: &str = "";

#[derive(Debug, Clone)]
struct ReverseEntry {
    namespace: String,
    rooms: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct NamespaceIndex {
    forward: HashMap<String, HashMap<String, HashSet<ClientId>>>,
    reverse: HashMap<ClientId, ReverseEntry>,
}

impl NamespaceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join `ns`, leaving whatever namespace/rooms the client previously held.
    /// Every client starts in the no-room bucket of its namespace.
    pub fn join_namespace(&mut self, id: ClientId, ns: &str) {
        if let Some(entry) = self.reverse.get(&id) {
            if entry.namespace == ns {
                return;
            }
        }
        self.remove(id);
        self.forward
            .entry(ns.to_string())
            .or_default()
            .entry(NO_ROOM.to_string())
            .or_default()
            .insert(id);
        self.reverse.insert(
            id,
            ReverseEntry {
                namespace: ns.to_string(),
                rooms: HashSet::new(),
            },
        );
    }

    pub fn join_room(&mut self, id: ClientId, room: &str, ns: &str) {
        match self.reverse.get(&id) {
            Some(entry) if entry.namespace == ns => {}
            _ => self.join_namespace(id, ns),
        }
        self.forward
            .entry(ns.to_string())
            .or_default()
            .entry(NO_ROOM.to_string())
            .or_default()
            .remove(&id);
        self.forward
            .entry(ns.to_string())
            .or_default()
            .entry(room.to_string())
            .or_default()
            .insert(id);
        if let Some(entry) = self.reverse.get_mut(&id) {
            entry.rooms.insert(room.to_string());
        }
    }

    pub fn leave_room(&mut self, id: ClientId, room: &str) {
        let Some(entry) = self.reverse.get_mut(&id) else {
            return;
        };
        if !entry.rooms.remove(room) {
            return;
        }
        let ns = entry.namespace.clone();
        if let Some(rooms) = self.forward.get_mut(&ns) {
            if let Some(set) = rooms.get_mut(room) {
                set.remove(&id);
                if set.is_empty() {
                    rooms.remove(room);
                }
            }
        }
        if self.reverse.get(&id).map(|e| e.rooms.is_empty()) == Some(true) {
            self.forward
                .entry(ns)
                .or_default()
                .entry(NO_ROOM.to_string())
                .or_default()
                .insert(id);
        }
    }

    pub fn leave_all_rooms(&mut self, id: ClientId) {
        let Some(entry) = self.reverse.get(&id) else {
            return;
        };
        let ns = entry.namespace.clone();
        let rooms: Vec<String> = entry.rooms.iter().cloned().collect();
        for room in rooms {
            if let Some(set) = self.forward.get_mut(&ns).and_then(|r| r.get_mut(&room)) {
                set.remove(&id);
                if set.is_empty() {
                    self.forward.get_mut(&ns).unwrap().remove(&room);
                }
            }
        }
        if let Some(entry) = self.reverse.get_mut(&id) {
            entry.rooms.clear();
        }
        self.forward
            .entry(ns)
            .or_default()
            .entry(NO_ROOM.to_string())
            .or_default()
            .insert(id);
    }

    /// Remove a disconnected client from every namespace/room it held.
    pub fn remove(&mut self, id: ClientId) {
        let Some(entry) = self.reverse.remove(&id) else {
            return;
        };
        if let Some(rooms) = self.forward.get_mut(&entry.namespace) {
            if let Some(set) = rooms.get_mut(NO_ROOM) {
                set.remove(&id);
            }
            for room in &entry.rooms {
                if let Some(set) = rooms.get_mut(room) {
                    set.remove(&id);
                }
            }
            rooms.retain(|_, set| !set.is_empty());
        }
    }

    pub fn namespace_of(&self, id: ClientId) -> Option<&str> {
        self.reverse.get(&id).map(|e| e.namespace.as_str())
    }

    pub fn rooms_of(&self, id: ClientId) -> Vec<String> {
        self.reverse
            .get(&id)
            .map(|e| e.rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clients_in_namespace(&self, ns: &str) -> Vec<ClientId> {
        self.forward
            .get(ns)
            .map(|rooms| {
                let mut all: HashSet<ClientId> = HashSet::new();
                for set in rooms.values() {
                    all.extend(set.iter().copied());
                }
                all.into_iter().collect()
            })
            .unwrap_or_default()
    }

    pub fn clients_in_room(&self, ns: &str, room: &str) -> Vec<ClientId> {
        self.forward
            .get(ns)
            .and_then(|rooms| rooms.get(room))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Snapshot the target set for a broadcast: taken up front so that a
    /// handler joining or leaving mid-delivery cannot perturb this fan-out.
    pub fn iterate(&self, ns: &str, room: Option<&str>) -> Vec<ClientId> {
        match room {
            Some(room) => self.clients_in_room(ns, room),
            None => self.clients_in_namespace(ns),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_room_is_visible_both_directions() {
        let mut idx = NamespaceIndex::new();
        let c = ClientId(1);
        idx.join_room(c, "r1", "/chat");
        assert!(idx.clients_in_room("/chat", "r1").contains(&c));
        assert!(idx.rooms_of(c).contains(&"r1".to_string()));
    }

    #[test]
    fn disconnect_clears_both_directions() {
        let mut idx = NamespaceIndex::new();
        let c = ClientId(1);
        idx.join_room(c, "r1", "/chat");
        idx.remove(c);
        assert!(!idx.clients_in_room("/chat", "r1").contains(&c));
        assert!(idx.rooms_of(c).is_empty());
        assert!(idx.namespace_of(c).is_none());
    }

    #[test]
    fn joining_new_namespace_leaves_previous_rooms() {
        let mut idx = NamespaceIndex::new();
        let c = ClientId(1);
        idx.join_room(c, "r1", "/chat");
        idx.join_namespace(c, "/lobby");
        assert!(!idx.clients_in_room("/chat", "r1").contains(&c));
        assert!(idx.clients_in_namespace("/lobby").contains(&c));
        assert!(idx.rooms_of(c).is_empty());
    }

    #[test]
    fn get_client_rooms_never_fails_for_unknown_client() {
        let idx = NamespaceIndex::new();
        assert!(idx.rooms_of(ClientId(99)).is_empty());
    }

    #[test]
    fn namespace_clients_is_union_of_rooms_and_no_room_bucket() {
        let mut idx = NamespaceIndex::new();
        let a = ClientId(1);
        let b = ClientId(2);
        idx.join_namespace(a, "/chat");
        idx.join_room(b, "r1", "/chat");
        let all = idx.clients_in_namespace("/chat");
        assert!(all.contains(&a));
        assert!(all.contains(&b));
    }

    #[test]
    fn leave_all_rooms_moves_client_back_to_no_room_bucket() {
        let mut idx = NamespaceIndex::new();
        let c = ClientId(1);
        idx.join_room(c, "r1", "/chat");
        idx.join_room(c, "r2", "/chat");
        idx.leave_all_rooms(c);
        assert!(idx.rooms_of(c).is_empty());
        assert!(idx.clients_in_namespace("/chat").contains(&c));
    }
}
