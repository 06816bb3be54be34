//! Per-connection finite state machine (C3).
//!
//! Drives one client's buffers through `ReadingHttp -> (Upgrading | HttpResponding)
//! -> WsOpen -> WsClosing -> Closed`. Pure with respect to I/O: it only ever reads
//! from `client.read_buf` and appends to `client.write_queue`; the reactor owns the
//! actual socket.

use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};

use crate::client::{Client, ConnectionKind, FsmState};
use crate::config::{CorsConfig, ServerConfig};
use crate::error::{Error, ProtocolError, TimeoutKind};
use crate::frame::{self, Decoded, Opcode, Reassembled};
use crate::http;
use crate::router::{HandshakeContext, HandshakeResult, Router};
use crate::server::ServerHandle;

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `Sec-WebSocket-Accept = base64(sha1(key + magic GUID))`.
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// One fully reassembled WebSocket message, or the close handshake completing.
pub enum InboundEvent {
    Message { opcode: Opcode, payload: Vec<u8> },
    Closed { code: u16, reason: String },
}

/// Drain everything currently parseable out of `client.read_buf`, advancing the
/// FSM and queuing any protocol-level replies (handshake response, pong,
/// close ack) directly onto the client's write queue. Returns the application
/// messages (`Text`/`Binary`) the dispatcher still needs to act on.
pub fn advance(
    client: &mut Client,
    config: &ServerConfig,
    router: &Router,
    server: &ServerHandle,
    now: Instant,
) -> Result<Vec<InboundEvent>, Error> {
    client.last_activity = now;
    let mut events = Vec::new();

    loop {
        match client.state {
            FsmState::ReadingHttp => {
                if !drain_one_http_request(client, config, router, server)? {
                    break;
                }
            }
            FsmState::WsOpen | FsmState::WsClosing => {
                if !drain_one_ws_frame(client, config, &mut events)? {
                    break;
                }
            }
            FsmState::Upgrading | FsmState::HttpResponding | FsmState::Closed => break,
        }
    }

    Ok(events)
}

/// Parse and respond to a single HTTP request at the front of the buffer.
/// Returns `Ok(true)` if a request was consumed (so the caller should loop
/// again in case the buffer holds a pipelined second request).
fn drain_one_http_request(
    client: &mut Client,
    config: &ServerConfig,
    router: &Router,
    server: &ServerHandle,
) -> Result<bool, Error> {
    let outcome = http::parse(&client.read_buf)?;
    let (request, consumed) = match outcome {
        http::ParseOutcome::Complete { request, consumed } => (request, consumed),
        http::ParseOutcome::NeedMore => return Ok(false),
    };
    client.read_buf.drain(..consumed);

    if request.is_websocket_upgrade() {
        handle_handshake(client, &request, router, &config.cors, server)?;
    } else {
        handle_plain_http(client, &request, router, &config.cors, server);
    }
    Ok(true)
}

fn reject_handshake(client: &mut Client, status: u16, body: &'static str, cors: &CorsConfig, request: &http::Request) -> Error {
    let response = apply_cors(
        http::Response::new(status).with_body("text/plain", body.as_bytes().to_vec()),
        request,
        cors,
    );
    client.queue_write(response.serialize());
    client.state = FsmState::Closed;
    Error::HandshakeRejected(body.to_string())
}

fn handle_handshake(
    client: &mut Client,
    request: &http::Request,
    router: &Router,
    cors: &CorsConfig,
    server: &ServerHandle,
) -> Result<(), Error> {
    let mut ctx = HandshakeContext {
        request: std::sync::Arc::new(request.clone()),
    };
    match router.run_handshake(&mut ctx) {
        HandshakeResult::Reject => {
            let response = apply_cors(http::Response::new(403), request, cors);
            client.queue_write(response.serialize());
            client.state = FsmState::Closed;
            return Err(Error::HandshakeRejected("rejected by handshake chain".to_string()));
        }
        HandshakeResult::CustomResponse(response) => {
            client.queue_write(apply_cors(response, request, cors).serialize());
            client.state = FsmState::Closed;
            return Ok(());
        }
        HandshakeResult::Continue => {}
    }

    if request.header("sec-websocket-version") != Some("13") {
        return Err(reject_handshake(client, 400, "unsupported Sec-WebSocket-Version", cors, request));
    }

    let Some(client_key) = request.header("sec-websocket-key") else {
        return Err(reject_handshake(client, 400, "missing Sec-WebSocket-Key", cors, request));
    };
    let key_len = BASE64
        .decode(client_key)
        .map(|bytes| bytes.len())
        .unwrap_or(0);
    if key_len != 16 {
        return Err(reject_handshake(client, 400, "invalid Sec-WebSocket-Key", cors, request));
    }

    let accept = compute_accept_key(client_key);
    let response = http::Response::new(101)
        .with_header("Upgrade", "websocket")
        .with_header("Connection", "Upgrade")
        .with_header("Sec-WebSocket-Accept", accept);
    client.queue_write(response.serialize());
    client.kind = ConnectionKind::Ws;
    client.state = FsmState::WsOpen;
    server.set_client_kind(client.id, ConnectionKind::Ws);
    crate::dispatch::dispatch_connect(client.id, router, server);
    Ok(())
}

fn handle_plain_http(
    client: &mut Client,
    request: &http::Request,
    router: &Router,
    cors: &CorsConfig,
    server: &ServerHandle,
) {
    client.kind = ConnectionKind::Http;

    if request.method.eq_ignore_ascii_case("OPTIONS") && request.header("origin").is_some() {
        let response = apply_cors(http::Response::new(204), request, cors);
        client.queue_write(response.serialize());
        client.state = FsmState::ReadingHttp;
        return;
    }

    let Some(method) = crate::router::Method::parse(&request.method) else {
        let response = apply_cors(
            http::Response::new(405).with_body("text/plain", b"method not allowed".to_vec()),
            request,
            cors,
        );
        client.queue_write(response.serialize());
        client.state = FsmState::ReadingHttp;
        return;
    };

    let response = match router.match_http(method, &request.path) {
        Some((params, chain)) => {
            let mut ctx = crate::router::HttpContext {
                request: std::sync::Arc::new(request.clone()),
                params,
                server: server.clone(),
            };
            chain(&mut ctx).into_response()
        }
        None => http::Response::new(404).with_body("text/plain", b"not found".to_vec()),
    };

    client.queue_write(apply_cors(response, request, cors).serialize());
    client.state = FsmState::ReadingHttp;
}

fn apply_cors(mut response: http::Response, request: &http::Request, cors: &CorsConfig) -> http::Response {
    let Some(origin) = request.header("origin") else {
        return response;
    };
    if !cors.allows_origin(origin) {
        return response;
    }
    response = response.with_header("Access-Control-Allow-Origin", origin.to_string());
    if cors.allow_credentials {
        response = response.with_header("Access-Control-Allow-Credentials", "true");
    }
    if !cors.allowed_methods.is_empty() {
        response = response.with_header("Access-Control-Allow-Methods", cors.allowed_methods.join(", "));
    }
    if !cors.allowed_headers.is_empty() {
        response = response.with_header("Access-Control-Allow-Headers", cors.allowed_headers.join(", "));
    }
    if let Some(max_age) = cors.max_age {
        response = response.with_header("Access-Control-Max-Age", max_age.to_string());
    }
    response
}

/// Decode and act on one WebSocket frame at the front of the buffer. Control
/// frames (ping/pong/close) are handled here and never surface to the caller.
/// Returns `Ok(true)` if a frame was consumed.
fn drain_one_ws_frame(
    client: &mut Client,
    config: &ServerConfig,
    events: &mut Vec<InboundEvent>,
) -> Result<bool, Error> {
    let decoded = match frame::decode(&client.read_buf, config.max_frame_bytes) {
        Ok(d) => d,
        Err(err) => {
            let code = err.close_code();
            close_with(client, code, "");
            return Err(Error::Protocol(err));
        }
    };
    let (frame, consumed) = match decoded {
        Decoded::Frame { frame, consumed } => (frame, consumed),
        Decoded::NeedMore => return Ok(false),
    };
    client.read_buf.drain(..consumed);

    match frame.opcode {
        Opcode::Ping => {
            client.queue_write(frame::encode(Opcode::Pong, true, &frame.payload));
        }
        Opcode::Pong => {
            client.awaiting_pong_since = None;
        }
        Opcode::Close => {
            let (code, reason) = frame::parse_close_payload(&frame.payload);
            // 1005 is a local sentinel for "no status present"; RFC 6455
            // forbids ever putting it on the wire, so echo 1000 instead.
            let echoed = if code == 1005 { 1000 } else { code };
            if !client.close_initiated {
                client.queue_write(frame::encode_close(echoed, ""));
                client.close_initiated = true;
            }
            client.state = FsmState::Closed;
            events.push(InboundEvent::Closed { code, reason });
        }
        Opcode::Text | Opcode::Binary | Opcode::Continuation => {
            match client.reassembler.push(frame) {
                Ok(Reassembled::Pending) => {}
                Ok(Reassembled::Message { opcode, payload }) => {
                    let total = payload.len();
                    if total > config.max_message_bytes {
                        close_with(client, 1009, "");
                        return Err(Error::MessageTooBig {
                            size: total,
                            limit: config.max_message_bytes,
                        });
                    }
                    events.push(InboundEvent::Message { opcode, payload });
                }
                Err(err) => {
                    let code = err.close_code();
                    close_with(client, code, "");
                    return Err(Error::Protocol(err));
                }
            }
        }
    }
    Ok(true)
}

fn close_with(client: &mut Client, code: u16, reason: &str) {
    if !client.close_initiated {
        client.queue_write(frame::encode_close(code, reason));
        client.close_initiated = true;
    }
    client.state = FsmState::WsClosing;
}

/// Called once per reactor tick per open connection. Sends an idle ping if
/// `ping_interval` has elapsed, and reports a timeout if a previously sent
/// ping has gone unanswered for longer than `ping_timeout`, or if the
/// connection has been silent for longer than `idle_timeout`.
pub fn check_timeouts(client: &mut Client, config: &ServerConfig, now: Instant) -> Option<TimeoutKind> {
    if client.state != FsmState::WsOpen {
        return None;
    }

    if let Some(since) = client.awaiting_pong_since {
        if now.duration_since(since) >= config.ping_timeout {
            close_with(client, TimeoutKind::Ping.close_code(), "");
            return Some(TimeoutKind::Ping);
        }
        return None;
    }

    let idle = now.duration_since(client.last_activity);
    if idle >= config.idle_timeout {
        close_with(client, TimeoutKind::Idle.close_code(), "");
        return Some(TimeoutKind::Idle);
    }
    if idle >= config.ping_interval {
        client.queue_write(frame::encode(Opcode::Ping, true, b""));
        client.awaiting_pong_since = Some(now);
    }
    None
}
