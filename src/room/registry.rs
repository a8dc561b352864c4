//! Process-wide room map and per-room socket fan-out.

use super::RoomState;
use crate::metrics::metrics;
use chrono::Utc;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

pub type RoomHandle = Arc<Mutex<RoomState>>;

const ROOM_ID_LEN: usize = 6;
const ROOM_ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// One attached websocket. Outbound frames go through an unbounded channel;
/// the writer task owns the actual sink.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    pub id: String,
    pub member_id: String,
    pub tx: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
pub struct Rooms {
    rooms: Mutex<HashMap<String, RoomHandle>>,
    sockets: Mutex<HashMap<String, Vec<SocketHandle>>>,
}

impl Rooms {
    pub fn new() -> Self {
        Self::default()
    }

    fn generate_id(existing: &HashMap<String, RoomHandle>) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let id: String = (0..ROOM_ID_LEN)
                .map(|_| ROOM_ID_ALPHABET[rng.gen_range(0..ROOM_ID_ALPHABET.len())] as char)
                .collect();
            if !existing.contains_key(&id) {
                return id;
            }
        }
    }

    pub async fn create(&self) -> (String, RoomHandle) {
        let mut rooms = self.rooms.lock().await;
        let id = Self::generate_id(&rooms);
        let handle: RoomHandle = Arc::new(Mutex::new(RoomState::new(id.clone(), Utc::now())));
        rooms.insert(id.clone(), handle.clone());
        metrics().rooms_active.set(rooms.len() as i64);
        (id, handle)
    }

    /// Rooms are created on first reference; ids are canonically uppercase.
    pub async fn get_or_create(&self, raw_id: &str) -> RoomHandle {
        let id = raw_id.trim().to_uppercase();
        let mut rooms = self.rooms.lock().await;
        let handle = rooms
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(RoomState::new(id.clone(), Utc::now()))))
            .clone();
        metrics().rooms_active.set(rooms.len() as i64);
        handle
    }

    pub async fn get(&self, raw_id: &str) -> Option<RoomHandle> {
        let id = raw_id.trim().to_uppercase();
        self.rooms.lock().await.get(&id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.rooms.lock().await.len()
    }

    pub async fn attach_socket(&self, room_id: &str, socket: SocketHandle) {
        let id = room_id.trim().to_uppercase();
        self.sockets.lock().await.entry(id).or_default().push(socket);
    }

    pub async fn detach_socket(&self, room_id: &str, socket_id: &str) {
        let id = room_id.trim().to_uppercase();
        let mut sockets = self.sockets.lock().await;
        if let Some(list) = sockets.get_mut(&id) {
            list.retain(|s| s.id != socket_id);
            if list.is_empty() {
                sockets.remove(&id);
            }
        }
    }

    /// Send a pre-serialized frame to every socket in the room. A dead
    /// receiver never aborts the fan-out; it is pruned instead.
    pub async fn broadcast_frame(&self, room_id: &str, frame: &str) {
        let id = room_id.trim().to_uppercase();
        let mut sockets = self.sockets.lock().await;
        if let Some(list) = sockets.get_mut(&id) {
            list.retain(|socket| socket.tx.send(frame.to_string()).is_ok());
            if list.is_empty() {
                sockets.remove(&id);
            }
        }
    }

    /// Serialize the room and broadcast it as a `room:snapshot` frame.
    pub async fn broadcast_snapshot(&self, room_id: &str) {
        let Some(handle) = self.get(room_id).await else {
            return;
        };
        let frame = {
            let room = handle.lock().await;
            serde_json::json!({ "type": "room:snapshot", "room": &*room }).to_string()
        };
        self.broadcast_frame(room_id, &frame).await;
    }
}
