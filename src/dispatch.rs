//! Delivers decoded WebSocket events to registered handlers (C7).
//!
//! Envelope decode, route lookup with the `onUnknownEvent` fallback,
//! middleware execution (already folded into the router's chains), and
//! reply-envelope serialization all happen here. Synthetic `connect`/
//! `disconnect` lifecycle events are run through the exact same table a
//! user-registered event uses.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;
use tracing::{debug, warn};

use crate::client::ClientId;
use crate::error::ProtocolError;
use crate::frame::{encode, Opcode};
use crate::router::{Envelope, Router};
use crate::server::ServerHandle;

pub const CONNECT_EVENT: &str = "connect";
pub const DISCONNECT_EVENT: &str = "disconnect";
/// Pseudo-event binary frames are dispatched under, since they carry no event
/// name of their own and must reach handlers without a JSON decode attempt.
pub const BINARY_EVENT: &str = "binary";
const ERROR_EVENT: &str = "error";

/// Decode one WS text/binary payload and run it through the router. Returns
/// bytes to write back to the originating client if a handler produced (or
/// opted to report) a reply.
pub fn dispatch_message(
    client_id: ClientId,
    opcode: Opcode,
    payload: Vec<u8>,
    router: &Router,
    server: &ServerHandle,
) -> Result<Option<Vec<u8>>, ProtocolError> {
    let (event, data) = match opcode {
        Opcode::Text => {
            let envelope: Envelope =
                serde_json::from_slice(&payload).map_err(ProtocolError::MalformedEnvelope)?;
            (envelope.event, envelope.data)
        }
        Opcode::Binary => (
            BINARY_EVENT.to_string(),
            serde_json::json!({ "bytes": BASE64.encode(&payload) }),
        ),
        other => unreachable!("control/continuation frame {other:?} never reaches the dispatcher"),
    };

    Ok(run_event(client_id, event, data, router, server))
}

pub fn dispatch_connect(client_id: ClientId, router: &Router, server: &ServerHandle) {
    run_event(client_id, CONNECT_EVENT.to_string(), Value::Null, router, server);
}

pub fn dispatch_disconnect(client_id: ClientId, router: &Router, server: &ServerHandle) {
    run_event(client_id, DISCONNECT_EVENT.to_string(), Value::Null, router, server);
}

fn run_event(
    client_id: ClientId,
    event: String,
    data: Value,
    router: &Router,
    server: &ServerHandle,
) -> Option<Vec<u8>> {
    let namespace = server.namespace_of(client_id);

    let (chain, namespace_filter, report_errors) = match router.ws_route(&event) {
        Some((chain, filter, report_errors)) => (Some(chain), filter.map(str::to_string), report_errors),
        None => (router.unknown_event_handler(), None, false),
    };
    let Some(chain) = chain else {
        debug!(%event, "no handler registered for event, dropping");
        return None;
    };
    if let Some(filter) = &namespace_filter {
        if filter != &namespace {
            debug!(%event, %namespace, filter, "event ignored: namespace filter mismatch");
            return None;
        }
    }

    let mut ctx = crate::router::WsContext {
        client_id,
        namespace,
        event: event.clone(),
        data,
        server: server.clone(),
    };

    match chain(&mut ctx) {
        Ok(Some(reply)) => serde_json::to_vec(&reply)
            .ok()
            .map(|json| encode(Opcode::Text, true, &json)),
        Ok(None) => None,
        Err(err) => {
            warn!(%event, client = client_id.0, error = %err, "handler returned an error");
            if report_errors {
                let error_envelope = Envelope {
                    event: ERROR_EVENT.to_string(),
                    data: serde_json::json!({ "message": err.to_string() }),
                };
                serde_json::to_vec(&error_envelope)
                    .ok()
                    .map(|json| encode(Opcode::Text, true, &json))
            } else {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::WsContext;
    use std::rc::Rc;

    #[test]
    fn ping_handler_replies_with_pong() {
        let mut router = Router::new();
        router.on_event(
            "ping",
            None,
            false,
            Vec::new(),
            Rc::new(|_: &mut WsContext| {
                Ok(Some(Envelope {
                    event: "pong".to_string(),
                    data: Value::Null,
                }))
            }),
        );
        let server = ServerHandle::new();
        server.register_client(ClientId(1));
        let reply = dispatch_message(
            ClientId(1),
            Opcode::Text,
            br#"{"event":"ping","data":{}}"#.to_vec(),
            &router,
            &server,
        )
        .unwrap();
        assert!(reply.is_some());
    }

    #[test]
    fn unknown_event_falls_back_to_registered_handler() {
        let mut router = Router::new();
        router.on_unknown_event(Rc::new(|ctx: &mut WsContext| {
            assert_eq!(ctx.event, "mystery");
            Ok(None)
        }));
        let server = ServerHandle::new();
        server.register_client(ClientId(1));
        let reply = dispatch_message(
            ClientId(1),
            Opcode::Text,
            br#"{"event":"mystery","data":null}"#.to_vec(),
            &router,
            &server,
        )
        .unwrap();
        assert!(reply.is_none());
    }

    #[test]
    fn malformed_envelope_is_a_protocol_error() {
        let router = Router::new();
        let server = ServerHandle::new();
        server.register_client(ClientId(1));
        let err = dispatch_message(ClientId(1), Opcode::Text, b"not json".to_vec(), &router, &server)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedEnvelope(_)));
    }

    #[test]
    fn handler_error_reported_when_opted_in() {
        let mut router = Router::new();
        router.on_event(
            "boom",
            None,
            true,
            Vec::new(),
            Rc::new(|_: &mut WsContext| {
                Err(crate::error::Error::Configuration("nope".to_string()))
            }),
        );
        let server = ServerHandle::new();
        server.register_client(ClientId(1));
        let reply = dispatch_message(
            ClientId(1),
            Opcode::Text,
            br#"{"event":"boom","data":null}"#.to_vec(),
            &router,
            &server,
        )
        .unwrap();
        assert!(reply.is_some());
    }
}
