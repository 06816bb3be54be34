//! End-to-end WebSocket scenarios driven over a real loopback socket.

mod support;

use std::rc::Rc;
use std::time::Duration;

use serde_json::json;
use sockeon::{CorsConfig, Envelope, Router, ServerConfig, WsContext};

use support::{TestServer, WsTestClient};

#[test]
fn ping_is_answered_with_pong_on_the_same_connection() {
    let server = TestServer::start(|| {
        let mut router = Router::new();
        router.on_event(
            "ping",
            None,
            false,
            Vec::new(),
            Rc::new(|_: &mut WsContext| {
                Ok(Some(Envelope {
                    event: "pong".to_string(),
                    data: json!({}),
                }))
            }),
        );
        router
    });

    let mut client = WsTestClient::connect(server.addr, "/");
    client.send_json("ping", json!({}));
    let reply = client.recv_json();
    assert_eq!(reply["event"], "pong");
}

#[test]
fn room_broadcast_includes_the_sender() {
    let server = TestServer::start(|| {
        let mut router = Router::new();
        router.on_event(
            "join",
            None,
            false,
            Vec::new(),
            Rc::new(|ctx: &mut WsContext| {
                ctx.server.join_room(ctx.client_id, "r1", Some("/chat"));
                Ok(None)
            }),
        );
        router.on_event(
            "chat.msg",
            None,
            false,
            Vec::new(),
            Rc::new(|ctx: &mut WsContext| {
                ctx.server
                    .broadcast("chat.msg", ctx.data.clone(), Some("/chat"), Some("r1"));
                Ok(None)
            }),
        );
        router
    });

    let mut a = WsTestClient::connect(server.addr, "/");
    let mut b = WsTestClient::connect(server.addr, "/");
    a.send_json("join", json!({}));
    b.send_json("join", json!({}));
    // Let both joins land before the broadcast fires.
    std::thread::sleep(Duration::from_millis(50));

    a.send_json("chat.msg", json!({"text": "hi"}));

    let received_a = a.recv_json();
    let received_b = b.recv_json();
    assert_eq!(received_a["event"], "chat.msg");
    assert_eq!(received_a["data"]["text"], "hi");
    assert_eq!(received_b["event"], "chat.msg");
    assert_eq!(received_b["data"]["text"], "hi");
}

#[test]
fn reserved_bits_close_only_the_offending_connection() {
    let server = TestServer::start(|| {
        let mut router = Router::new();
        router.on_event(
            "ping",
            None,
            false,
            Vec::new(),
            Rc::new(|_: &mut WsContext| {
                Ok(Some(Envelope {
                    event: "pong".to_string(),
                    data: json!({}),
                }))
            }),
        );
        router
    });

    let mut bad = WsTestClient::connect(server.addr, "/");
    let mut good = WsTestClient::connect(server.addr, "/");

    bad.send_reserved_bit_garbage();
    bad.expect_close(1002);

    good.send_json("ping", json!({}));
    let reply = good.recv_json();
    assert_eq!(reply["event"], "pong");
}

#[test]
fn cors_preflight_echoes_allowed_origin() {
    let cors = CorsConfig {
        allowed_origins: vec!["https://app.example".to_string()],
        ..CorsConfig::permissive()
    };
    let server = TestServer::start_with_config(ServerConfig::default().with_cors(cors), Router::new);

    let (status, head, _) = support::http_options(server.addr, "/", "https://app.example");
    assert_eq!(status, 204);
    assert!(head.contains("Access-Control-Allow-Origin: https://app.example"));
    assert!(head.contains("Access-Control-Allow-Methods"));
    assert!(head.contains("Access-Control-Max-Age"));
}
