//! The facade handlers and middleware see through `HttpContext`/`WsContext`
//! (C9): send/broadcast, room membership, per-client data, and connection
//! queries. Everything here runs on the reactor thread, so state is kept in
//! a plain `Rc<RefCell<..>>` rather than behind atomics or a mutex.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use serde_json::Value;

use crate::client::{AttributeBag, ClientId, ConnectionKind};
use crate::error::Error;
use crate::frame::{encode, Opcode};
use crate::namespace::{NamespaceIndex, DEFAULT_NAMESPACE};
use crate::router::Envelope;

/// A side effect requested by handler code during dispatch. The reactor
/// drains these after running the current tick's handlers and applies them
/// to the live connection table, so handlers never touch sockets directly.
pub enum OutboundCommand {
    Send { to: ClientId, bytes: Vec<u8> },
    Disconnect { id: ClientId, code: u16, reason: String },
}

struct Shared {
    namespaces: NamespaceIndex,
    attributes: HashMap<ClientId, AttributeBag>,
    kinds: HashMap<ClientId, ConnectionKind>,
    connected: HashSet<ClientId>,
    outbound: VecDeque<OutboundCommand>,
    shutdown_requested: bool,
    /// Bytes enqueued via `send`/`broadcast` for each client that the reactor
    /// has not yet drained with `drain_outbound`. Compared against
    /// `write_buffer_bytes` so `send` can reject a client whose queue is
    /// already full instead of silently dropping it a tick later.
    pending_bytes: HashMap<ClientId, usize>,
    write_buffer_bytes: usize,
}

impl Default for Shared {
    fn default() -> Self {
        Self {
            namespaces: NamespaceIndex::default(),
            attributes: HashMap::new(),
            kinds: HashMap::new(),
            connected: HashSet::new(),
            outbound: VecDeque::new(),
            shutdown_requested: false,
            pending_bytes: HashMap::new(),
            write_buffer_bytes: usize::MAX,
        }
    }
}

/// Cheaply cloneable single-thread handle shared by the reactor and every
/// handler invocation.
#[derive(Clone)]
pub struct ServerHandle(Rc<RefCell<Shared>>);

impl Default for ServerHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerHandle {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(Shared::default())))
    }

    /// Called by the reactor when a socket is accepted, before any bytes
    /// have been read from it.
    pub(crate) fn register_client(&self, id: ClientId) {
        let mut shared = self.0.borrow_mut();
        shared.connected.insert(id);
        shared.kinds.insert(id, ConnectionKind::Unknown);
        shared.attributes.insert(id, AttributeBag::default());
        shared.namespaces.join_namespace(id, DEFAULT_NAMESPACE);
    }

    pub(crate) fn set_client_kind(&self, id: ClientId, kind: ConnectionKind) {
        self.0.borrow_mut().kinds.insert(id, kind);
    }

    /// Called once by the reactor after binding, so `send` can enforce the
    /// same per-client write limit the reactor enforces on the socket side.
    pub(crate) fn set_write_buffer_limit(&self, bytes: usize) {
        self.0.borrow_mut().write_buffer_bytes = bytes;
    }

    /// Called by the reactor once a socket has been torn down.
    pub(crate) fn remove_client(&self, id: ClientId) {
        let mut shared = self.0.borrow_mut();
        shared.connected.remove(&id);
        shared.kinds.remove(&id);
        shared.attributes.remove(&id);
        shared.namespaces.remove(id);
        shared.pending_bytes.remove(&id);
    }

    pub(crate) fn drain_outbound(&self) -> Vec<OutboundCommand> {
        let mut shared = self.0.borrow_mut();
        let commands: Vec<_> = shared.outbound.drain(..).collect();
        for command in &commands {
            if let OutboundCommand::Send { to, bytes } = command {
                if let Some(pending) = shared.pending_bytes.get_mut(to) {
                    *pending = pending.saturating_sub(bytes.len());
                }
            }
        }
        commands
    }

    /// Queue an envelope for delivery to `to` on the next tick. Rejects with
    /// `Backpressured` rather than queuing if doing so would push that
    /// client's outstanding queue past `write_buffer_bytes`, so a handler
    /// that floods an unresponsive client finds out immediately instead of
    /// having the send silently dropped a tick later.
    pub fn send(&self, to: ClientId, event: &str, data: Value) -> Result<(), Error> {
        if !self.is_client_connected(to) {
            return Err(Error::UnknownClient(to));
        }
        let bytes = encode_envelope(event, data);
        let mut shared = self.0.borrow_mut();
        let pending = shared.pending_bytes.entry(to).or_insert(0);
        if *pending + bytes.len() > shared.write_buffer_bytes {
            return Err(Error::Backpressured(to));
        }
        *pending += bytes.len();
        shared.outbound.push_back(OutboundCommand::Send { to, bytes });
        Ok(())
    }

    /// Snapshot the target set before encoding once and fanning the same
    /// encoded bytes out to every member, so a handler run mid-broadcast
    /// joining or leaving can't change who receives this message. Unlike
    /// `send`, a member whose queue is already full has its copy dropped
    /// (logged by the reactor) rather than failing the whole broadcast.
    pub fn broadcast(&self, event: &str, data: Value, namespace: Option<&str>, room: Option<&str>) {
        let ns = namespace.unwrap_or(DEFAULT_NAMESPACE);
        let targets = self.0.borrow().namespaces.iterate(ns, room);
        let bytes = encode_envelope(event, data);
        let mut shared = self.0.borrow_mut();
        let limit = shared.write_buffer_bytes;
        for id in targets {
            let pending = shared.pending_bytes.entry(id).or_insert(0);
            if *pending + bytes.len() > limit {
                continue;
            }
            *pending += bytes.len();
            shared.outbound.push_back(OutboundCommand::Send {
                to: id,
                bytes: bytes.clone(),
            });
        }
    }

    /// Queue a graceful close for `id`. Idempotent: the first call on a
    /// connected client succeeds, every call after that (once the reactor has
    /// torn the connection down) returns `UnknownClient` rather than queuing
    /// a second close against a client that no longer exists.
    pub fn disconnect(&self, id: ClientId) -> Result<(), Error> {
        if !self.is_client_connected(id) {
            return Err(Error::UnknownClient(id));
        }
        self.0.borrow_mut().outbound.push_back(OutboundCommand::Disconnect {
            id,
            code: 1000,
            reason: String::new(),
        });
        Ok(())
    }

    pub fn join_room(&self, id: ClientId, room: &str, namespace: Option<&str>) {
        let ns = namespace.unwrap_or(DEFAULT_NAMESPACE);
        self.0.borrow_mut().namespaces.join_room(id, room, ns);
    }

    pub fn leave_room(&self, id: ClientId, room: &str) {
        self.0.borrow_mut().namespaces.leave_room(id, room);
    }

    pub fn get_client_data(&self, id: ClientId, key: &str) -> Option<Value> {
        self.0
            .borrow()
            .attributes
            .get(&id)
            .and_then(|bag| bag.get(key))
            .cloned()
    }

    pub fn set_client_data(&self, id: ClientId, key: &str, value: Value) {
        self.0
            .borrow_mut()
            .attributes
            .entry(id)
            .or_default()
            .set(key, value);
    }

    pub fn namespace_of(&self, id: ClientId) -> String {
        self.0
            .borrow()
            .namespaces
            .namespace_of(id)
            .unwrap_or(DEFAULT_NAMESPACE)
            .to_string()
    }

    pub fn get_clients_in_namespace(&self, namespace: &str) -> Vec<ClientId> {
        self.0.borrow().namespaces.clients_in_namespace(namespace)
    }

    pub fn get_clients_in_room(&self, namespace: &str, room: &str) -> Vec<ClientId> {
        self.0.borrow().namespaces.clients_in_room(namespace, room)
    }

    pub fn is_client_connected(&self, id: ClientId) -> bool {
        self.0.borrow().connected.contains(&id)
    }

    pub fn get_client_type(&self, id: ClientId) -> Option<ConnectionKind> {
        self.0.borrow().kinds.get(&id).copied()
    }

    pub fn get_client_count(&self) -> usize {
        self.0.borrow().connected.len()
    }

    /// Ask `run` to stop accepting new work and begin draining. Safe to call
    /// from inside a handler; has no effect once shutdown is already underway.
    pub fn request_shutdown(&self) {
        self.0.borrow_mut().shutdown_requested = true;
    }

    pub(crate) fn shutdown_requested(&self) -> bool {
        self.0.borrow().shutdown_requested
    }
}

fn encode_envelope(event: &str, data: Value) -> Vec<u8> {
    let envelope = Envelope {
        event: event.to_string(),
        data,
    };
    let json = serde_json::to_vec(&envelope).unwrap_or_default();
    encode(Opcode::Text, true, &json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_to_unknown_client_is_an_error() {
        let server = ServerHandle::new();
        let err = server.send(ClientId(7), "ping", Value::Null).unwrap_err();
        assert!(matches!(err, Error::UnknownClient(_)));
    }

    #[test]
    fn broadcast_reaches_every_room_member() {
        let server = ServerHandle::new();
        server.register_client(ClientId(1));
        server.register_client(ClientId(2));
        server.join_room(ClientId(1), "lobby", None);
        server.join_room(ClientId(2), "lobby", None);
        server.broadcast("tick", serde_json::json!({"n": 1}), None, Some("lobby"));
        let outbound = server.drain_outbound();
        assert_eq!(outbound.len(), 2);
    }

    #[test]
    fn send_past_the_write_buffer_limit_is_backpressured_not_dropped() {
        let server = ServerHandle::new();
        server.register_client(ClientId(1));
        server.set_write_buffer_limit(40);
        server.send(ClientId(1), "a", Value::Null).unwrap();
        let err = server.send(ClientId(1), "b", Value::Null).unwrap_err();
        assert!(matches!(err, Error::Backpressured(_)));
        assert_eq!(server.drain_outbound().len(), 1);
    }

    #[test]
    fn disconnect_on_a_gone_client_is_unknown_client() {
        let server = ServerHandle::new();
        server.register_client(ClientId(1));
        server.disconnect(ClientId(1)).unwrap();
        server.remove_client(ClientId(1));
        let err = server.disconnect(ClientId(1)).unwrap_err();
        assert!(matches!(err, Error::UnknownClient(_)));
    }

    #[test]
    fn client_data_round_trips() {
        let server = ServerHandle::new();
        server.register_client(ClientId(1));
        server.set_client_data(ClientId(1), "auth.userId", Value::String("u1".into()));
        assert_eq!(
            server.get_client_data(ClientId(1), "auth.userId"),
            Some(Value::String("u1".into()))
        );
    }
}
