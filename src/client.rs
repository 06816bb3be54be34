//! Per-connection client state.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::Instant;

use serde_json::Value;

use crate::frame::Reassembler;

/// Opaque, monotonic, never-reused-within-a-run client identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

#[derive(Debug, Default)]
pub struct ClientIdAllocator {
    next: u64,
}

impl ClientIdAllocator {
    pub fn next(&mut self) -> ClientId {
        let id = ClientId(self.next);
        self.next += 1;
        id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Unknown,
    Http,
    Ws,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmState {
    ReadingHttp,
    Upgrading,
    HttpResponding,
    WsOpen,
    WsClosing,
    Closed,
}

/// Arbitrary per-client attribute bag, keyed by [`ClientId`] and owned by
/// [`crate::server::ServerHandle`] rather than the connection itself: handler
/// code needs to read/write another client's data without holding a borrow of
/// that client's socket state.
#[derive(Debug, Default, Clone)]
pub struct AttributeBag {
    values: HashMap<String, Value>,
}

impl AttributeBag {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }
}

/// One accepted socket and all the state the reactor/FSM need to drive it.
pub struct Client {
    pub id: ClientId,
    pub kind: ConnectionKind,
    pub state: FsmState,

    pub read_buf: Vec<u8>,
    pub write_queue: VecDeque<Vec<u8>>,
    pub write_bytes_queued: usize,
    /// Set once the write buffer has crossed `write_buffer_bytes`; reads are
    /// paused until it drains below the configured low-water mark.
    pub read_paused: bool,

    pub reassembler: Reassembler,
    pub last_activity: Instant,
    pub awaiting_pong_since: Option<Instant>,

    /// Set when a close frame has been sent/received so the FSM knows a second
    /// close round-trip should not be attempted.
    pub close_initiated: bool,
}

impl Client {
    pub fn new(id: ClientId, now: Instant) -> Self {
        Self {
            id,
            kind: ConnectionKind::Unknown,
            state: FsmState::ReadingHttp,
            read_buf: Vec::new(),
            write_queue: VecDeque::new(),
            write_bytes_queued: 0,
            read_paused: false,
            reassembler: Reassembler::default(),
            last_activity: now,
            awaiting_pong_since: None,
            close_initiated: false,
        }
    }

    pub fn queue_write(&mut self, bytes: Vec<u8>) {
        self.write_bytes_queued += bytes.len();
        self.write_queue.push_back(bytes);
    }
}
