//! Router (C5): HTTP path/method table, WebSocket event table, and the
//! middleware chain type shared by both plus the handshake.
//!
//! The server is single-threaded and fully synchronous, so middleware is
//! modeled as plain closures rather than an async `Service`/`tower` stack: a
//! route boils down to one capability, call it with a context and get a
//! reply. Everything here is reactor-thread-only (`Rc`, not `Arc`); handlers
//! are never invoked from another thread.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use serde_json::Value;

use crate::client::ClientId;
use crate::error::Error;
use crate::http;
use crate::server::ServerHandle;

/// The JSON `{event, data}` envelope carried inside WebSocket text frames.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Envelope {
    pub event: String,
    pub data: Value,
}

/// A handler: the one capability every route boils down to.
pub trait Handler<Ctx, Res> {
    fn call(&self, ctx: &mut Ctx) -> Res;
}

impl<F, Ctx, Res> Handler<Ctx, Res> for F
where
    F: Fn(&mut Ctx) -> Res,
{
    fn call(&self, ctx: &mut Ctx) -> Res {
        self(ctx)
    }
}

/// A middleware: may call `next` zero or one time; if it doesn't, its own
/// result short-circuits the chain.
pub trait Middleware<Ctx, Res> {
    fn call(&self, ctx: &mut Ctx, next: &dyn Fn(&mut Ctx) -> Res) -> Res;
}

impl<F, Ctx, Res> Middleware<Ctx, Res> for F
where
    F: Fn(&mut Ctx, &dyn Fn(&mut Ctx) -> Res) -> Res,
{
    fn call(&self, ctx: &mut Ctx, next: &dyn Fn(&mut Ctx) -> Res) -> Res {
        self(ctx, next)
    }
}

/// Collapse a handler plus its middleware stack into a single callable chain,
/// built once at registration time since the tables are immutable after `run`.
pub fn build_chain<Ctx, Res>(
    middlewares: Vec<Rc<dyn Middleware<Ctx, Res>>>,
    handler: Rc<dyn Handler<Ctx, Res>>,
) -> Box<dyn Fn(&mut Ctx) -> Res>
where
    Ctx: 'static,
    Res: 'static,
{
    let mut chain: Box<dyn Fn(&mut Ctx) -> Res> = Box::new(move |ctx| handler.call(ctx));
    for mw in middlewares.into_iter().rev() {
        let inner = chain;
        chain = Box::new(move |ctx| mw.call(ctx, &*inner));
    }
    chain
}

/// Context passed through the HTTP middleware chain and into the handler.
pub struct HttpContext {
    pub request: Arc<http::Request>,
    pub params: HashMap<String, String>,
    pub server: ServerHandle,
}

/// What an HTTP handler is allowed to return. The encoding is pinned by the
/// variant chosen, so there's no "other" case to reject at dispatch time.
pub enum HttpReply {
    Json(Value),
    Text(String),
    NoContent,
    NotFound,
    Response(http::Response),
}

impl HttpReply {
    pub fn into_response(self) -> http::Response {
        match self {
            HttpReply::Json(v) => http::Response::json(200, &v),
            HttpReply::Text(s) => {
                http::Response::new(200).with_body("text/plain", s.into_bytes())
            }
            HttpReply::NoContent => http::Response::new(204),
            HttpReply::NotFound => {
                http::Response::new(404).with_body("text/plain", b"not found".to_vec())
            }
            HttpReply::Response(r) => r,
        }
    }
}

/// What a WebSocket event handler returns: `Ok(Some(envelope))` is sent back
/// to the originating client as a text frame, `Ok(None)` sends nothing, and
/// `Err` is caught by the dispatcher, logged, and optionally translated into
/// an `"error"` event for routes that opt in.
pub type WsReply = Result<Option<Envelope>, Error>;

/// Context for a WebSocket event handler.
pub struct WsContext {
    pub client_id: ClientId,
    pub namespace: String,
    pub event: String,
    pub data: Value,
    pub server: ServerHandle,
}

/// Handshake middleware result set.
pub enum HandshakeResult {
    Continue,
    Reject,
    CustomResponse(http::Response),
}

pub struct HandshakeContext {
    pub request: Arc<http::Request>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Options,
    Head,
}

impl Method {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "PATCH" => Some(Method::Patch),
            "DELETE" => Some(Method::Delete),
            "OPTIONS" => Some(Method::Options),
            "HEAD" => Some(Method::Head),
            _ => None,
        }
    }
}

enum Segment {
    Literal(String),
    Param(String),
}

struct HttpRoute {
    method: Method,
    segments: Vec<Segment>,
    chain: Box<dyn Fn(&mut HttpContext) -> HttpReply>,
}

struct WsRoute {
    chain: Box<dyn Fn(&mut WsContext) -> WsReply>,
    #[allow(dead_code)] // consulted by the dispatcher, not the router itself
    namespace_filter: Option<String>,
    /// Whether a handler error here should be translated into an `"error"`
    /// event sent back to the client, rather than just logged and swallowed.
    report_errors: bool,
}

/// Static routing tables. Built via `route`/`on_event`, then frozen before `run`.
pub struct Router {
    http_routes: Vec<HttpRoute>,
    ws_routes: HashMap<String, WsRoute>,
    on_unknown_event: Option<Box<dyn Fn(&mut WsContext) -> WsReply>>,
    handshake_chain: Option<Box<dyn Fn(&mut HandshakeContext) -> HandshakeResult>>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            http_routes: Vec::new(),
            ws_routes: HashMap::new(),
            on_unknown_event: None,
            handshake_chain: None,
        }
    }

    pub fn route(
        &mut self,
        method: Method,
        pattern: &str,
        middlewares: Vec<Rc<dyn Middleware<HttpContext, HttpReply>>>,
        handler: Rc<dyn Handler<HttpContext, HttpReply>>,
    ) {
        let chain = build_chain(middlewares, handler);
        self.http_routes.push(HttpRoute {
            method,
            segments: parse_pattern(pattern),
            chain,
        });
    }

    pub fn on_event(
        &mut self,
        event: &str,
        namespace_filter: Option<String>,
        report_errors: bool,
        middlewares: Vec<Rc<dyn Middleware<WsContext, WsReply>>>,
        handler: Rc<dyn Handler<WsContext, WsReply>>,
    ) {
        let chain = build_chain(middlewares, handler);
        self.ws_routes.insert(
            event.to_string(),
            WsRoute {
                chain,
                namespace_filter,
                report_errors,
            },
        );
    }

    pub fn on_unknown_event(&mut self, handler: Rc<dyn Handler<WsContext, WsReply>>) {
        self.on_unknown_event = Some(build_chain(Vec::new(), handler));
    }

    pub fn set_handshake_chain(
        &mut self,
        middlewares: Vec<Rc<dyn Middleware<HandshakeContext, HandshakeResult>>>,
    ) {
        let always_continue: Rc<dyn Handler<HandshakeContext, HandshakeResult>> =
            Rc::new(|_: &mut HandshakeContext| HandshakeResult::Continue);
        self.handshake_chain = Some(build_chain(middlewares, always_continue));
    }

    pub fn run_handshake(&self, ctx: &mut HandshakeContext) -> HandshakeResult {
        match &self.handshake_chain {
            Some(chain) => chain(ctx),
            None => HandshakeResult::Continue,
        }
    }

    /// Find the best HTTP route match: literal segments must equal, `:name`
    /// segments capture. Specificity order: more literal segments wins, then
    /// longer pattern, then earlier registration.
    pub fn match_http(
        &self,
        method: Method,
        path: &str,
    ) -> Option<(HashMap<String, String>, &(dyn Fn(&mut HttpContext) -> HttpReply))> {
        let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        let mut best: Option<(usize, usize, usize, HashMap<String, String>, &HttpRoute)> = None;
        for (idx, route) in self.http_routes.iter().enumerate() {
            if route.method != method {
                continue;
            }
            let Some(params) = match_segments(&route.segments, &path_segments) else {
                continue;
            };
            let literal_count = route
                .segments
                .iter()
                .filter(|s| matches!(s, Segment::Literal(_)))
                .count();
            let candidate = (literal_count, route.segments.len(), idx, params, route);
            best = Some(match best {
                None => candidate,
                Some(current) => pick_more_specific(current, candidate),
            });
        }

        best.map(|(_, _, _, params, route)| (params, route.chain.as_ref()))
    }

    pub fn ws_route(
        &self,
        event: &str,
    ) -> Option<(&(dyn Fn(&mut WsContext) -> WsReply), Option<&str>, bool)> {
        self.ws_routes
            .get(event)
            .map(|r| (r.chain.as_ref(), r.namespace_filter.as_deref(), r.report_errors))
    }

    pub fn unknown_event_handler(&self) -> Option<&(dyn Fn(&mut WsContext) -> WsReply)> {
        self.on_unknown_event.as_deref()
    }
}

fn pick_more_specific<'a>(
    a: (usize, usize, usize, HashMap<String, String>, &'a HttpRoute),
    b: (usize, usize, usize, HashMap<String, String>, &'a HttpRoute),
) -> (usize, usize, usize, HashMap<String, String>, &'a HttpRoute) {
    // more literal segments wins; then longer pattern; then earlier registration.
    if b.0 != a.0 {
        return if b.0 > a.0 { b } else { a };
    }
    if b.1 != a.1 {
        return if b.1 > a.1 { b } else { a };
    }
    if b.2 < a.2 {
        b
    } else {
        a
    }
}

fn parse_pattern(pattern: &str) -> Vec<Segment> {
    pattern
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|seg| {
            if let Some(name) = seg.strip_prefix(':') {
                Segment::Param(name.to_string())
            } else {
                Segment::Literal(seg.to_string())
            }
        })
        .collect()
}

fn match_segments(pattern: &[Segment], path: &[&str]) -> Option<HashMap<String, String>> {
    if pattern.len() != path.len() {
        return None;
    }
    let mut params = HashMap::new();
    for (seg, actual) in pattern.iter().zip(path.iter()) {
        match seg {
            Segment::Literal(lit) => {
                if lit != actual {
                    return None;
                }
            }
            Segment::Param(name) => {
                params.insert(name.clone(), actual.to_string());
            }
        }
    }
    Some(params)
}
