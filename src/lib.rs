//! A single-port, single-threaded HTTP + WebSocket event server.
//!
//! One `mio` reactor multiplexes plain HTTP requests and upgraded WebSocket
//! connections on the same listener, demuxing each accepted socket by
//! sniffing its first request. Application code registers HTTP routes and
//! WebSocket event handlers against a [`Router`], organizes connections into
//! namespaces and rooms via [`ServerHandle`], and starts the reactor with
//! [`Server::run`].
//!
//! ```no_run
//! use sockeon::{CorsConfig, Method, Router, Server, ServerConfig};
//! use std::rc::Rc;
//!
//! let mut router = Router::new();
//! router.route(
//!     Method::Get,
//!     "/health",
//!     Vec::new(),
//!     Rc::new(|_ctx: &mut sockeon::HttpContext| {
//!         sockeon::HttpReply::Json(serde_json::json!({ "status": "ok" }))
//!     }),
//! );
//!
//! let config = ServerConfig::default()
//!     .with_bind("127.0.0.1", 8080)
//!     .with_cors(CorsConfig::permissive());
//! let server = Server::new(config, router).expect("bind");
//! // server.run().expect("reactor loop");
//! ```

mod client;
mod config;
mod connection;
mod dispatch;
mod error;
mod frame;
mod http;
mod namespace;
mod queue;
mod reactor;
mod router;
mod server;

pub use client::{ClientId, ConnectionKind};
pub use config::{CorsConfig, QueueConfig, ServerConfig};
pub use error::{Error, ProtocolError, Result, TimeoutKind};
pub use frame::{decode_unmasked, encode, encode_close, parse_close_payload, Decoded, Frame, Opcode};
pub use namespace::DEFAULT_NAMESPACE;
pub use router::{
    build_chain, Envelope, Handler, HandshakeContext, HandshakeResult, HttpContext, HttpReply,
    Method, Middleware, Router, WsContext, WsReply,
};
pub use server::ServerHandle;

use std::net::SocketAddr;

/// Owns the reactor and exposes the application-facing entry point: bind,
/// then run until [`ServerHandle::request_shutdown`] is called.
pub struct Server {
    reactor: reactor::Reactor,
    handle: ServerHandle,
}

impl Server {
    /// Bind the listener described by `config` and wire up `router`. Returns
    /// as soon as the socket is bound and registered with the reactor; no
    /// connections are accepted until [`Server::run`] is called.
    pub fn new(config: ServerConfig, router: Router) -> Result<Self> {
        let handle = ServerHandle::new();
        let reactor = reactor::Reactor::bind(config, router, handle.clone())?;
        Ok(Self { reactor, handle })
    }

    /// The address actually bound, useful when `port: 0` was requested.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.reactor.local_addr()
    }

    /// A cheaply cloneable handle to the same server. Since `ServerHandle`
    /// is `Rc`-backed it never leaves this thread, but application code
    /// running on the reactor thread (a handler, or code run just before
    /// `run`) can clone it to call `request_shutdown` independently of the
    /// `Server` value itself.
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Drive the reactor until shutdown is requested, then drain in-flight
    /// writes up to `shutdown_drain_deadline` before returning.
    pub fn run(&mut self) -> Result<()> {
        self.reactor.run()
    }
}
