//! Minimal HTTP/1.1 request/response codec (C2).
//!
//! Request lines and headers are tokenized with `httparse`; everything built on
//! top of that (path/query decomposition, JSON body decoding, response framing,
//! CORS headers) is this crate's own.

use std::collections::HashMap;

use percent_encoding::percent_decode_str;

use crate::error::ProtocolError;

const MAX_HEADERS: usize = 64;

/// A parsed HTTP/1.1 request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub version_minor: u8,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    /// Decoded JSON body, present only when `Content-Type: application/json` and
    /// the body parsed successfully. On decode failure the raw body is
    /// kept and this stays `None`.
    pub json: Option<serde_json::Value>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        let upgrade = self.header("upgrade").unwrap_or_default();
        let connection = self.header("connection").unwrap_or_default();
        upgrade.eq_ignore_ascii_case("websocket")
            && connection
                .split(',')
                .any(|tok| tok.trim().eq_ignore_ascii_case("upgrade"))
    }
}

/// Case-insensitive header storage that preserves original value casing for echo.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Outcome of attempting to parse one request from the front of a connection's
/// read buffer.
pub enum ParseOutcome {
    Complete { request: Request, consumed: usize },
    NeedMore,
}

/// Parse a request line + headers + (if `Content-Length` is present) body from
/// `buf`. Returns `NeedMore` until the whole request (including body) has
/// arrived.
pub fn parse(buf: &[u8]) -> Result<ParseOutcome, ProtocolError> {
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut header_storage);

    let header_len = match req
        .parse(buf)
        .map_err(|e| ProtocolError::MalformedHttp(e.to_string()))?
    {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Ok(ParseOutcome::NeedMore),
    };

    let method = req
        .method
        .ok_or_else(|| ProtocolError::MalformedHttp("missing method".to_string()))?
        .to_string();
    let target = req
        .path
        .ok_or_else(|| ProtocolError::MalformedHttp("missing request target".to_string()))?;
    let version_minor = req.version.unwrap_or(1);

    let (path, raw_query) = split_target(target);

    let mut headers = HeaderMap::default();
    let mut content_length = 0usize;
    for h in req.headers.iter() {
        let value = std::str::from_utf8(h.value)
            .map_err(|_| ProtocolError::MalformedHttp("non-UTF8 header value".to_string()))?;
        if h.name.eq_ignore_ascii_case("content-length") {
            content_length = value
                .trim()
                .parse()
                .map_err(|_| ProtocolError::MalformedHttp("bad content-length".to_string()))?;
        }
        headers.insert(h.name, value);
    }

    let body_available = buf.len() - header_len;
    if body_available < content_length {
        return Ok(ParseOutcome::NeedMore);
    }

    let body = buf[header_len..header_len + content_length].to_vec();
    let consumed = header_len + content_length;

    let json = if !body.is_empty()
        && headers
            .get("content-type")
            .is_some_and(|ct| ct.starts_with("application/json"))
    {
        serde_json::from_slice(&body).ok()
    } else {
        None
    };

    Ok(ParseOutcome::Complete {
        request: Request {
            method,
            path,
            query: parse_query(raw_query),
            version_minor,
            headers,
            body,
            json,
        },
        consumed,
    })
}

fn split_target(target: &str) -> (String, &str) {
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p, q),
        None => (target, ""),
    };
    let normalized = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    (normalized, query)
}

fn parse_query(raw: &str) -> HashMap<String, String> {
    if raw.is_empty() {
        return HashMap::new();
    }
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (decode_component(k), decode_component(v)),
            None => (decode_component(pair), String::new()),
        })
        .collect()
}

fn decode_component(s: &str) -> String {
    percent_decode_str(s)
        .decode_utf8_lossy()
        .replace('+', " ")
}

/// An HTTP response to serialize back to the wire.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub keep_alive: bool,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            keep_alive: false,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, content_type: &str, body: Vec<u8>) -> Self {
        self.headers
            .push(("Content-Type".to_string(), content_type.to_string()));
        self.body = body;
        self
    }

    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        let body = serde_json::to_vec(value).unwrap_or_default();
        Self::new(status).with_body("application/json", body)
    }

    /// Serialize to `status line + headers + CRLFCRLF + body`. Sets
    /// `Content-Length` and `Connection: close`/`keep-alive` unless the caller
    /// already pushed a header of that name (e.g. a WS handshake response
    /// setting `Connection: Upgrade` itself) — never emits the same header
    /// twice.
    pub fn serialize(&self) -> Vec<u8> {
        let has_header = |name: &str| self.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name));

        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status,
                reason_phrase(self.status)
            )
            .as_bytes(),
        );
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        if !has_header("Content-Length") {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        if !has_header("Connection") {
            let connection = if self.keep_alive { "keep-alive" } else { "close" };
            out.extend_from_slice(format!("Connection: {connection}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_line_headers_and_query() {
        let raw = b"GET /widgets?name=foo%20bar&x=1 HTTP/1.1\r\nHost: a\r\nContent-Length: 0\r\n\r\n";
        let ParseOutcome::Complete { request, consumed } = parse(raw).unwrap() else {
            panic!("expected complete parse");
        };
        assert_eq!(consumed, raw.len());
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/widgets");
        assert_eq!(request.query.get("name").unwrap(), "foo bar");
        assert_eq!(request.query.get("x").unwrap(), "1");
    }

    #[test]
    fn need_more_until_body_arrives() {
        let raw = b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhel";
        assert!(matches!(parse(raw).unwrap(), ParseOutcome::NeedMore));
    }

    #[test]
    fn decodes_json_body() {
        let raw = b"POST /x HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: 13\r\n\r\n{\"a\":1,\"b\":2}";
        let ParseOutcome::Complete { request, .. } = parse(raw).unwrap() else {
            panic!("expected complete parse");
        };
        assert_eq!(request.json.unwrap()["a"], 1);
    }

    #[test]
    fn detects_websocket_upgrade_headers() {
        let raw = b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let ParseOutcome::Complete { request, .. } = parse(raw).unwrap() else {
            panic!("expected complete parse");
        };
        assert!(request.is_websocket_upgrade());
    }

    #[test]
    fn response_serializes_with_content_length_and_close() {
        let resp = Response::json(200, &serde_json::json!({"ok": true}));
        let bytes = resp.serialize();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 13\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("{\"ok\":true}"));
    }
}
