//! Per-user rooms: the fan-out core of the push fabric.
//!
//! Grounded on the backend's single global `broadcast::Sender<WsServerEvent>`
//! in `main.rs`, generalized to one channel per user — this system's "one
//! room per user" requirement the backend's single global room doesn't need
//! (it has no multi-tenant push surface).

use crate::push::events::ServerEvent;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::debug;

/// A connected push-fabric session's stable identifier, scoped to one
/// socket's lifetime.
pub type ClientId = String;

/// Capacity matching `BinancePriceFeed::update_tx`'s bounded broadcast
/// channel — generous enough that `alert-triggered` only drops when every
/// receiver for that user is actually gone.
const ROOM_CAPACITY: usize = 1024;

struct Room {
    tx: broadcast::Sender<ServerEvent>,
    /// Sessions currently joined to this room; used only to know when the
    /// room is empty and can be torn down, not for addressing (every event
    /// for a user's room reaches every session of that user, matching the
    /// "one room per user" glossary entry).
    members: usize,
}

#[derive(Default)]
pub struct Hub {
    rooms: Mutex<HashMap<String, Room>>,
    sessions: Mutex<HashMap<ClientId, String>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join `client_id` to `user_id`'s room, creating the room if this is
    /// its first member. Returns a receiver the session's write task polls.
    pub fn join(&self, client_id: ClientId, user_id: String) -> broadcast::Receiver<ServerEvent> {
        let mut rooms = self.rooms.lock();
        let room = rooms.entry(user_id.clone()).or_insert_with(|| Room {
            tx: broadcast::channel(ROOM_CAPACITY).0,
            members: 0,
        });
        room.members += 1;
        let rx = room.tx.subscribe();
        self.sessions.lock().insert(client_id, user_id);
        rx
    }

    /// Leave the room this client joined. Drops the room's sender once the
    /// last member leaves.
    pub fn leave(&self, client_id: &ClientId) {
        let Some(user_id) = self.sessions.lock().remove(client_id) else {
            return;
        };
        let mut rooms = self.rooms.lock();
        if let Some(room) = rooms.get_mut(&user_id) {
            room.members = room.members.saturating_sub(1);
            if room.members == 0 {
                rooms.remove(&user_id);
                debug!(user_id, "push room torn down, last session left");
            }
        }
    }

    pub fn user_of(&self, client_id: &ClientId) -> Option<String> {
        self.sessions.lock().get(client_id).cloned()
    }

    /// Broadcast to every session in `user_id`'s room. A `SendError` means
    /// no receivers remain (nothing to deliver to) — not a failure the
    /// caller needs to act on; `kline-update` and `alert-triggered` are both
    /// fire-and-forget past this point per the at-most-once-per-live-socket
    /// delivery guarantee.
    pub fn send_to_user(&self, user_id: &str, event: ServerEvent) {
        let rooms = self.rooms.lock();
        if let Some(room) = rooms.get(user_id) {
            let _ = room.tx.send(event);
        }
    }

    /// Resolve `client_id`'s room and broadcast to it. Used by the kline
    /// subscription manager, which only knows client ids, not user ids.
    pub fn send_to_client(&self, client_id: &ClientId, event: ServerEvent) {
        if let Some(user_id) = self.user_of(client_id) {
            self.send_to_user(&user_id, event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_sessions_of_a_user_receive_a_broadcast() {
        let hub = Hub::new();
        let mut rx1 = hub.join("client-1".to_string(), "user-1".to_string());
        let mut rx2 = hub.join("client-2".to_string(), "user-1".to_string());
        hub.send_to_user("user-1", ServerEvent::KlineError { error: "x".into() });
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn send_to_client_resolves_through_the_session_map() {
        let hub = Hub::new();
        let mut rx = hub.join("client-1".to_string(), "user-1".to_string());
        hub.send_to_client(&"client-1".to_string(), ServerEvent::KlineError { error: "y".into() });
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn other_users_rooms_are_unaffected() {
        let hub = Hub::new();
        let mut rx_a = hub.join("client-a".to_string(), "user-a".to_string());
        let _rx_b = hub.join("client-b".to_string(), "user-b".to_string());
        hub.send_to_user("user-b", ServerEvent::KlineError { error: "z".into() });
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn leaving_the_last_session_tears_down_the_room() {
        let hub = Hub::new();
        hub.join("client-1".to_string(), "user-1".to_string());
        hub.leave(&"client-1".to_string());
        assert!(hub.user_of(&"client-1".to_string()).is_none());
        // Sending to a torn-down room is a silent no-op, not a panic.
        hub.send_to_user("user-1", ServerEvent::KlineError { error: "gone".into() });
    }

    #[test]
    fn leaving_an_unknown_client_is_a_no_op() {
        let hub = Hub::new();
        hub.leave(&"never-joined".to_string());
    }
}
