//! Shared end-to-end test harness: bind an ephemeral port, spawn the server,
//! and drive it from a plain `TcpStream`. The reactor is single-threaded and
//! its `Router`/`ServerHandle` are `Rc`-based, so the router has to be *built
//! inside* the spawned thread rather than constructed on the test thread and
//! handed over — only the `FnOnce` that builds it needs to cross the thread
//! boundary, not the `Rc`s it produces. Each test binds port 0 and leaks its
//! server thread; there are no graceful-shutdown races to worry about since
//! the process exits when the test does.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use sockeon::{decode_unmasked, Decoded, Opcode, Router, Server, ServerConfig};

pub struct TestServer {
    pub addr: SocketAddr,
}

impl TestServer {
    pub fn start<F>(build_router: F) -> Self
    where
        F: FnOnce() -> Router + Send + 'static,
    {
        Self::start_with_config(ServerConfig::default(), build_router)
    }

    pub fn start_with_config<F>(config: ServerConfig, build_router: F) -> Self
    where
        F: FnOnce() -> Router + Send + 'static,
    {
        let config = config.with_bind("127.0.0.1", 0);
        let (addr_tx, addr_rx) = mpsc::channel();
        thread::spawn(move || {
            let router = build_router();
            let mut server = Server::new(config, router).expect("bind test server");
            addr_tx
                .send(server.local_addr().expect("local addr"))
                .expect("report bound address");
            server.run().expect("reactor loop");
        });
        let addr = addr_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("server reported its bound address");
        Self { addr }
    }
}

/// Minimal WebSocket client speaking this crate's own wire format: masked
/// frames out (server requires it), `decode_unmasked` in (servers never mask).
pub struct WsTestClient {
    stream: TcpStream,
}

impl WsTestClient {
    pub fn connect(addr: SocketAddr, path: &str) -> Self {
        let mut stream = TcpStream::connect(addr).expect("tcp connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("set read timeout");

        let request = format!(
            "GET {path} HTTP/1.1\r\n\
             Host: localhost\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).expect("write handshake");

        let mut response = Vec::new();
        let mut buf = [0u8; 512];
        loop {
            let n = stream.read(&mut buf).expect("read handshake response");
            response.extend_from_slice(&buf[..n]);
            if response.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        assert!(
            response.starts_with(b"HTTP/1.1 101"),
            "handshake did not switch protocols: {}",
            String::from_utf8_lossy(&response)
        );

        Self { stream }
    }

    pub fn send_json(&mut self, event: &str, data: serde_json::Value) {
        let envelope = serde_json::json!({ "event": event, "data": data });
        let payload = serde_json::to_vec(&envelope).expect("serialize envelope");
        self.stream
            .write_all(&mask_frame(Opcode::Text, &payload))
            .expect("write frame");
    }

    pub fn recv_json(&mut self) -> serde_json::Value {
        let (opcode, payload) = self.read_frame();
        assert_eq!(opcode as u8, Opcode::Text as u8, "expected a text frame");
        serde_json::from_slice(&payload).expect("reply is valid JSON")
    }

    pub fn send_reserved_bit_garbage(&mut self) {
        // Same layout as a masked text frame but with an RSV bit set, which
        // every server implementation of this protocol must reject.
        let mut frame = mask_frame(Opcode::Text, b"x");
        frame[0] |= 0b0100_0000;
        self.stream.write_all(&frame).expect("write garbage frame");
    }

    pub fn expect_close(&mut self, expected_code: u16) {
        let (opcode, payload) = self.read_frame();
        assert_eq!(opcode as u8, Opcode::Close as u8, "expected a close frame");
        let code = u16::from_be_bytes([payload[0], payload[1]]);
        assert_eq!(code, expected_code);
    }

    fn read_exact_n(&mut self, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        self.stream.read_exact(&mut buf).expect("read frame bytes");
        buf
    }

    fn read_frame(&mut self) -> (Opcode, Vec<u8>) {
        loop {
            let head = self.read_exact_n(2);
            let len7 = head[1] & 0x7f;
            let len = match len7 {
                126 => {
                    let ext = self.read_exact_n(2);
                    u16::from_be_bytes([ext[0], ext[1]]) as usize
                }
                127 => {
                    let ext = self.read_exact_n(8);
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(&ext);
                    u64::from_be_bytes(bytes) as usize
                }
                n => n as usize,
            };
            let payload = if len > 0 { self.read_exact_n(len) } else { Vec::new() };

            let mut raw = head;
            raw.extend_from_slice(&payload);
            match decode_unmasked(&raw, usize::MAX) {
                Ok(Decoded::Frame { frame, .. }) => return (frame.opcode, frame.payload),
                Ok(Decoded::NeedMore) => continue,
                Err(err) => panic!("server sent an invalid frame: {err}"),
            }
        }
    }
}

fn mask_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let key = [0x37, 0xfa, 0x21, 0x3d];
    let mut out = vec![0x80 | opcode_byte(opcode)];
    let len = payload.len();
    if len < 126 {
        out.push(0x80 | len as u8);
    } else if len <= u16::MAX as usize {
        out.push(0x80 | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(0x80 | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
    out.extend_from_slice(&key);
    for (i, byte) in payload.iter().enumerate() {
        out.push(byte ^ key[i % 4]);
    }
    out
}

fn opcode_byte(opcode: Opcode) -> u8 {
    match opcode {
        Opcode::Continuation => 0x0,
        Opcode::Text => 0x1,
        Opcode::Binary => 0x2,
        Opcode::Close => 0x8,
        Opcode::Ping => 0x9,
        Opcode::Pong => 0xA,
    }
}

pub fn http_get(addr: SocketAddr, path: &str) -> (u16, String, Vec<u8>) {
    http_request(addr, "GET", path, &[])
}

pub fn http_options(addr: SocketAddr, path: &str, origin: &str) -> (u16, String, Vec<u8>) {
    http_request(addr, "OPTIONS", path, &[("Origin", origin)])
}

fn http_request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    extra_headers: &[(&str, &str)],
) -> (u16, String, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).expect("tcp connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("set read timeout");

    let mut request = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n");
    for (name, value) in extra_headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).expect("write request");

    let mut raw = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => raw.extend_from_slice(&buf[..n]),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => panic!("read response: {e}"),
        }
        if raw.windows(4).any(|w| w == b"\r\n\r\n") {
            // Headers are in; for this harness's purposes the body (if any)
            // arrives in the same read on loopback, so one more non-blocking
            // attempt is enough to pick up the rest.
            let _ = stream.read(&mut buf).map(|n| raw.extend_from_slice(&buf[..n]));
            break;
        }
    }

    let header_end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response headers terminated");
    let head = String::from_utf8_lossy(&raw[..header_end]).into_owned();
    let status = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .expect("status line");
    let body = raw[header_end + 4..].to_vec();
    (status, head, body)
}
