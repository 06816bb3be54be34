//! Single-threaded non-blocking reactor (C4).
//!
//! One `mio::Poll` instance multiplexes the listener and every accepted
//! socket. Each tick: accept a bounded batch, drain read-ready sockets into
//! the connection FSM, drain write-ready sockets from their queued bytes,
//! poll the broadcast queue file, then sweep for idle/ping timeouts.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use tracing::{debug, info, warn};

use crate::client::{Client, ClientId, ClientIdAllocator, FsmState};
use crate::config::ServerConfig;
use crate::connection::{self, InboundEvent};
use crate::dispatch;
use crate::error::{Error, Result};
use crate::queue::QueueReader;
use crate::router::Router;
use crate::server::{OutboundCommand, ServerHandle};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const TICK_TIMEOUT: Duration = Duration::from_millis(100);

struct Slot {
    client: Client,
    socket: TcpStream,
}

/// Drives the accept/read/write/timeout loop until shutdown completes.
pub struct Reactor {
    config: ServerConfig,
    router: Router,
    server: ServerHandle,
    poll: Poll,
    listener: TcpListener,
    connections: Slab<Slot>,
    tokens: HashMap<ClientId, Token>,
    ids: ClientIdAllocator,
    queue_reader: QueueReader,
}

impl Reactor {
    pub fn bind(config: ServerConfig, router: Router, server: ServerHandle) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|_| Error::Configuration(format!("invalid bind address {}:{}", config.host, config.port)))?;
        let mut listener = TcpListener::bind(addr)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        server.set_write_buffer_limit(config.write_buffer_bytes);

        Ok(Self {
            config,
            router,
            server,
            poll,
            listener,
            connections: Slab::new(),
            tokens: HashMap::new(),
            ids: ClientIdAllocator::default(),
            queue_reader: QueueReader::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Run until `ServerHandle::request_shutdown` is called, then drain
    /// write buffers (closing WS clients with 1001) up to the configured
    /// deadline before returning.
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(1024);
        loop {
            self.poll.poll(&mut events, Some(TICK_TIMEOUT))?;

            for event in events.iter() {
                if event.token() == LISTENER_TOKEN {
                    self.accept_batch();
                } else {
                    self.service_socket(event.token(), event.is_readable(), event.is_writable());
                }
            }

            self.poll_queue();
            self.apply_outbound_commands();
            self.sweep_timeouts();

            if self.server.shutdown_requested() {
                break;
            }
        }

        self.drain_for_shutdown();
        Ok(())
    }

    fn accept_batch(&mut self) {
        for _ in 0..self.config.accept_batch {
            let (mut socket, addr) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    warn!(?err, "accept failed");
                    return;
                }
            };

            let id = self.ids.next();
            let entry = self.connections.vacant_entry();
            let token = Token(entry.key());
            if let Err(err) = self
                .poll
                .registry()
                .register(&mut socket, token, Interest::READABLE)
            {
                warn!(?err, "failed to register accepted socket");
                continue;
            }

            debug!(client = id.0, %addr, "accepted connection");
            self.server.register_client(id);
            entry.insert(Slot {
                client: Client::new(id, Instant::now()),
                socket,
            });
            self.tokens.insert(id, token);
        }
    }

    fn service_socket(&mut self, token: Token, readable: bool, writable: bool) {
        let mut io_failed = false;
        let events: Vec<InboundEvent> = {
            let Some(slot) = self.connections.get_mut(token.0) else {
                return;
            };

            if readable && !slot.client.read_paused {
                if let Err(err) = read_available(slot, self.config.io_quantum_bytes) {
                    debug!(client = slot.client.id.0, ?err, "connection read error");
                    io_failed = true;
                }
            }

            if io_failed {
                Vec::new()
            } else {
                let now = Instant::now();
                match connection::advance(&mut slot.client, &self.config, &self.router, &self.server, now) {
                    Ok(events) => events,
                    Err(err) => {
                        debug!(client = slot.client.id.0, %err, "protocol error on connection");
                        Vec::new()
                    }
                }
            }
        };

        if io_failed {
            self.teardown(token);
            return;
        }

        self.handle_inbound_events(token, events);

        let Some(slot) = self.connections.get_mut(token.0) else {
            return;
        };
        update_read_pause(slot, &self.config);

        if writable || !slot.client.write_queue.is_empty() {
            flush_writes(slot, self.config.io_quantum_bytes);
        }

        self.reregister(token);

        let should_teardown = self
            .connections
            .get(token.0)
            .map(|s| s.client.state == FsmState::Closed && s.client.write_queue.is_empty())
            .unwrap_or(false);
        if should_teardown {
            self.teardown(token);
        }
    }

    fn handle_inbound_events(&mut self, token: Token, events: Vec<InboundEvent>) {
        let Some(client_id) = self.connections.get(token.0).map(|s| s.client.id) else {
            return;
        };

        for event in events {
            match event {
                InboundEvent::Message { opcode, payload } => {
                    match dispatch::dispatch_message(client_id, opcode, payload, &self.router, &self.server) {
                        Ok(Some(reply)) => {
                            if let Some(slot) = self.connections.get_mut(token.0) {
                                slot.client.queue_write(reply);
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            warn!(client = client_id.0, %err, "malformed application envelope");
                            if let Some(slot) = self.connections.get_mut(token.0) {
                                slot.client.queue_write(crate::frame::encode_close(err.close_code(), ""));
                                slot.client.state = FsmState::WsClosing;
                                slot.client.close_initiated = true;
                            }
                        }
                    }
                }
                InboundEvent::Closed { .. } => {
                    dispatch::dispatch_disconnect(client_id, &self.router, &self.server);
                }
            }
        }
    }

    fn apply_outbound_commands(&mut self) {
        for command in self.server.drain_outbound() {
            match command {
                OutboundCommand::Send { to, bytes } => {
                    if let Some(&token) = self.tokens.get(&to) {
                        if let Some(slot) = self.connections.get_mut(token.0) {
                            if slot.client.write_bytes_queued + bytes.len() > self.config.write_buffer_bytes {
                                warn!(client = to.0, "dropping send: write buffer would overflow");
                                continue;
                            }
                            slot.client.queue_write(bytes);
                            flush_writes(slot, self.config.io_quantum_bytes);
                        }
                    }
                }
                OutboundCommand::Disconnect { id, code, reason } => {
                    if let Some(&token) = self.tokens.get(&id) {
                        if let Some(slot) = self.connections.get_mut(token.0) {
                            if slot.client.state == FsmState::WsOpen && !slot.client.close_initiated {
                                slot.client.queue_write(crate::frame::encode_close(code, &reason));
                                slot.client.close_initiated = true;
                            }
                            slot.client.state = FsmState::WsClosing;
                            flush_writes(slot, self.config.io_quantum_bytes);
                        }
                    }
                }
            }
        }
    }

    fn sweep_timeouts(&mut self) {
        let now = Instant::now();
        let tokens: Vec<Token> = self.tokens.values().copied().collect();
        for token in tokens {
            if let Some(slot) = self.connections.get_mut(token.0) {
                if connection::check_timeouts(&mut slot.client, &self.config, now).is_some() {
                    flush_writes(slot, self.config.io_quantum_bytes);
                }
            }
        }
    }

    fn poll_queue(&mut self) {
        if !self.config.queue.enabled {
            return;
        }
        let path = self.config.queue.file.clone();
        self.queue_reader.poll(&path, &self.server);
    }

    fn reregister(&mut self, token: Token) {
        let Some(slot) = self.connections.get_mut(token.0) else {
            return;
        };
        let mut interest = Interest::READABLE;
        if !slot.client.write_queue.is_empty() {
            interest |= Interest::WRITABLE;
        }
        if slot.client.read_paused {
            interest = Interest::WRITABLE;
        }
        let _ = self.poll.registry().reregister(&mut slot.socket, token, interest);
    }

    fn teardown(&mut self, token: Token) {
        if let Some(mut slot) = self.connections.try_remove(token.0) {
            let _ = self.poll.registry().deregister(&mut slot.socket);
            self.tokens.remove(&slot.client.id);
            self.server.remove_client(slot.client.id);
            debug!(client = slot.client.id.0, "connection closed");
        }
    }

    /// Send a close(1001) to every open WS client and give write buffers up
    /// to `shutdown_drain_deadline` to flush before returning.
    fn drain_for_shutdown(&mut self) {
        info!("shutdown requested, draining connections");
        let tokens: Vec<Token> = self.tokens.values().copied().collect();
        for token in &tokens {
            if let Some(slot) = self.connections.get_mut(token.0) {
                if slot.client.state == FsmState::WsOpen && !slot.client.close_initiated {
                    slot.client.queue_write(crate::frame::encode_close(1001, "server shutting down"));
                    slot.client.close_initiated = true;
                    slot.client.state = FsmState::WsClosing;
                }
                flush_writes(slot, usize::MAX);
            }
        }

        let deadline = Instant::now() + self.config.shutdown_drain_deadline;
        let mut events = Events::with_capacity(256);
        while Instant::now() < deadline {
            let pending = self
                .connections
                .iter()
                .any(|(_, slot)| !slot.client.write_queue.is_empty());
            if !pending {
                break;
            }
            if self.poll.poll(&mut events, Some(Duration::from_millis(50))).is_err() {
                break;
            }
            for event in events.iter() {
                if event.token() != LISTENER_TOKEN && event.is_writable() {
                    if let Some(slot) = self.connections.get_mut(event.token().0) {
                        flush_writes(slot, usize::MAX);
                    }
                }
            }
        }
    }
}

/// Read at most `quantum` bytes total in this call, even if the socket has
/// more ready, so one noisy connection can't monopolize a tick; anything left
/// unread stays buffered by the kernel for the next readable event.
fn read_available(slot: &mut Slot, quantum: usize) -> io::Result<()> {
    let mut buf = vec![0u8; quantum.min(64 * 1024).max(1)];
    let mut total = 0usize;
    loop {
        if total >= quantum {
            return Ok(());
        }
        match slot.socket.read(&mut buf) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed connection")),
            Ok(n) => {
                slot.client.read_buf.extend_from_slice(&buf[..n]);
                total += n;
                if n < buf.len() {
                    return Ok(());
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
}

/// Write at most `quantum` bytes total in this call; a socket with more
/// queued than that gets the rest on its next writable event instead of
/// starving every other connection's turn this tick.
fn flush_writes(slot: &mut Slot, quantum: usize) {
    let mut total = 0usize;
    while total < quantum {
        let Some(front) = slot.client.write_queue.front_mut() else {
            break;
        };
        let remaining = quantum - total;
        let end = remaining.min(front.len());
        match slot.socket.write(&front[..end]) {
            Ok(0) => break,
            Ok(n) => {
                slot.client.write_bytes_queued -= n;
                total += n;
                if n == front.len() {
                    slot.client.write_queue.pop_front();
                } else {
                    front.drain(..n);
                    break;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

fn update_read_pause(slot: &mut Slot, config: &ServerConfig) {
    let high_water = config.write_buffer_bytes;
    let low_water = (config.write_buffer_bytes as f32 * config.write_buffer_low_water) as usize;
    if slot.client.read_paused {
        if slot.client.write_bytes_queued <= low_water {
            slot.client.read_paused = false;
        }
    } else if slot.client.write_bytes_queued > high_water {
        slot.client.read_paused = true;
    }
}
