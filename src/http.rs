//! HTTP server and client on top of the buffered socket layer.
//!
//! The server parses HTTP/1.1 requests incrementally (request line,
//! case-preserving ordered headers, `Content-Length` body), hands each
//! complete request to the application as an [`HttpRequest`] record, and
//! emits the response when the application calls [`http_response`]. A
//! request that is never responded to keeps its record alive and the
//! loop running. Connections are close-on-response; there is no
//! keep-alive.
//!
//! The client issues one-shot requests: `Connection: close` is always
//! forced onto the wire, a `Host` header is injected when the caller did
//! not supply one, and the response body is framed by `Content-Length`,
//! chunked encoding, or end-of-stream.

use std::cell::RefCell;
use std::fmt;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::str;
use std::time::Duration;

use mio::Interest;

use crate::condition::Condition;
use crate::config::{HTTP_DEFAULT_PORT, MAX_HTTP_HEAD_BYTES};
use crate::error::LoopError;
use crate::event_loop::{deliver_condition, exiting, invoke_user, route_condition, with_loop};
use crate::registry::{
    share_event_cb, share_read_cb, Bundle, EventCb, HandleId, HandleKind, HandleState, ReadCb,
    RequestCb,
};
use crate::tcp::{bind_listener, Socket, TcpOptions, WriteOptions};

/// HTTP request method. The set is closed; a request line naming any
/// other token is answered `501` without reaching the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub enum Method {
    GET,
    POST,
    HEAD,
    PUT,
    DELETE,
    OPTIONS,
    TRACE,
    CONNECT,
    PATCH,
}

impl Method {
    /// Parse a request-line token. Methods are case-sensitive.
    pub fn parse(token: &str) -> Option<Method> {
        match token {
            "GET" => Some(Method::GET),
            "POST" => Some(Method::POST),
            "HEAD" => Some(Method::HEAD),
            "PUT" => Some(Method::PUT),
            "DELETE" => Some(Method::DELETE),
            "OPTIONS" => Some(Method::OPTIONS),
            "TRACE" => Some(Method::TRACE),
            "CONNECT" => Some(Method::CONNECT),
            "PATCH" => Some(Method::PATCH),
            _ => None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::HEAD => "HEAD",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::OPTIONS => "OPTIONS",
            Method::TRACE => "TRACE",
            Method::CONNECT => "CONNECT",
            Method::PATCH => "PATCH",
        };
        write!(f, "{name}")
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// A parsed server-side request, handed to the request callback.
///
/// The record behind it stays alive until [`http_response`] is called or
/// the peer aborts; headers preserve the case and order the peer sent.
#[derive(Debug)]
pub struct HttpRequest {
    pub(crate) id: HandleId,
    method: Method,
    uri: String,
    resource: String,
    querystring: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl HttpRequest {
    pub fn method(&self) -> Method {
        self.method
    }

    /// The full request-target as sent by the peer.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The path component of the request-target.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// The substring after `?`, empty when there is none.
    pub fn querystring(&self) -> &str {
        &self.querystring
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Case-insensitive single-header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The raw body bytes; never decoded for form or multipart content.
    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// Kind-specific state for an HTTP server record.
pub struct HttpServerState {
    pub(crate) listener: Option<mio::net::TcpListener>,
}

/// Kind-specific state for an in-flight server request record.
pub struct HttpRequestState {
    pub(crate) socket: HandleId,
}

/// Kind-specific state for an HTTP client record.
pub struct HttpClientState {
    pub(crate) socket: Option<HandleId>,
}

/// An opaque reference to a listening HTTP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpServerHandle {
    pub(crate) id: HandleId,
}

impl HttpServerHandle {
    /// The address the server is bound to. Useful with port 0 binds.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, LoopError> {
        with_loop(|s| {
            let record = s.registry.lookup(self.id).ok_or(LoopError::StaleHandle)?;
            let HandleState::HttpServer(srv) = &record.state else {
                return Err(LoopError::StaleHandle);
            };
            let listener = srv.listener.as_ref().ok_or(LoopError::StaleHandle)?;
            listener.local_addr().map_err(LoopError::Io)
        })?
    }
}

/// Response fields accepted by [`http_response`].
pub struct ResponseOptions {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Default for ResponseOptions {
    fn default() -> Self {
        Self { status: 200, headers: Vec::new(), body: Vec::new() }
    }
}

/// Options accepted by [`http_client`].
pub struct ClientOptions {
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self { method: Method::GET, headers: Vec::new(), body: None, timeout: None }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

fn parse_header_lines<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> Result<Vec<(String, String)>, String> {
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some(colon) = line.find(':') else {
            return Err(format!("malformed header line: {line}"));
        };
        let name = line[..colon].trim().to_string();
        let value = line[colon + 1..].trim().to_string();
        headers.push((name, value));
    }
    Ok(headers)
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn split_target(target: &str) -> (String, String) {
    match target.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (target.to_string(), String::new()),
    }
}

enum RequestParse {
    Incomplete,
    Bad(String),
    UnknownMethod,
    Complete {
        head_len: usize,
        body_len: usize,
        method: Method,
        target: String,
        headers: Vec<(String, String)>,
    },
}

fn parse_request(buf: &[u8]) -> RequestParse {
    let Some(head_len) = find_head_end(buf) else {
        if buf.len() > MAX_HTTP_HEAD_BYTES {
            return RequestParse::Bad("request head too large".into());
        }
        return RequestParse::Incomplete;
    };
    let Ok(head) = str::from_utf8(&buf[..head_len]) else {
        return RequestParse::Bad("request head is not valid UTF-8".into());
    };
    let mut lines = head.split("\r\n");
    let Some(request_line) = lines.next() else {
        return RequestParse::Bad("empty request".into());
    };
    let mut parts = request_line.split_whitespace();
    let (Some(method_token), Some(target), Some(version)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return RequestParse::Bad(format!("malformed request line: {request_line}"));
    };
    if !version.starts_with("HTTP/") {
        return RequestParse::Bad(format!("unsupported protocol: {version}"));
    }
    let Some(method) = Method::parse(method_token) else {
        return RequestParse::UnknownMethod;
    };
    let headers = match parse_header_lines(lines) {
        Ok(headers) => headers,
        Err(msg) => return RequestParse::Bad(msg),
    };
    let body_len = match header_value(&headers, "content-length") {
        Some(v) => match v.parse::<usize>() {
            Ok(n) => n,
            Err(_) => return RequestParse::Bad(format!("bad content-length: {v}")),
        },
        None => 0,
    };
    if buf.len() < head_len + body_len {
        return RequestParse::Incomplete;
    }
    RequestParse::Complete { head_len, body_len, method, target: target.to_string(), headers }
}

fn serialize_response(status: u16, headers: &[(String, String)], body: &[u8]) -> Vec<u8> {
    let mut head = format!("HTTP/1.1 {} {}\r\n", status, reason_phrase(status));
    let mut has_server = false;
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("connection") || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        if name.eq_ignore_ascii_case("server") {
            has_server = true;
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    if !has_server {
        head.push_str("Server: eddy/0.1\r\n");
    }
    head.push_str(&format!("Content-Length: {}\r\n", body.len()));
    head.push_str("Connection: close\r\n\r\n");
    let mut bytes = head.into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

/// Per-connection server parse state, owned by the connection's socket
/// callbacks.
struct ServerConn {
    buf: Vec<u8>,
    /// The in-flight request record awaiting `http_response`.
    current: Option<HandleId>,
}

fn respond_simple(sock: Socket, status: u16) {
    let bytes = serialize_response(status, &[], &[]);
    if crate::tcp::write_socket_data(sock, bytes, WriteOptions::default()).is_ok() {
        let _ = crate::tcp::close_socket(sock);
    }
}

fn server_conn_data(
    sock: Socket,
    bytes: Vec<u8>,
    conn: &Rc<RefCell<ServerConn>>,
    request_cb: &RequestCb,
    server_event: Option<EventCb>,
) {
    {
        let mut state = conn.borrow_mut();
        if state.current.is_some() {
            // Close-on-response connection: anything past the current
            // request is ignored.
            return;
        }
        state.buf.extend_from_slice(&bytes);
    }
    let parsed = parse_request(&conn.borrow().buf);
    match parsed {
        RequestParse::Incomplete => {}
        RequestParse::Bad(msg) => {
            tracing::debug!(msg, "rejecting malformed request");
            respond_simple(sock, 400);
        }
        RequestParse::UnknownMethod => respond_simple(sock, 501),
        RequestParse::Complete { head_len, body_len, method, target, headers } => {
            let body = {
                let mut state = conn.borrow_mut();
                let body = state.buf[head_len..head_len + body_len].to_vec();
                state.buf.clear();
                body
            };
            let request_id = with_loop(|s| {
                let id = s.registry.allocate(HandleKind::HttpRequest);
                s.registry.attach(
                    id,
                    HandleKind::HttpRequest,
                    Bundle::HttpRequest { event: server_event.clone() },
                    HandleState::HttpRequest(HttpRequestState { socket: sock.id }),
                );
                id
            });
            let Ok(request_id) = request_id else { return };
            conn.borrow_mut().current = Some(request_id);
            let (resource, querystring) = split_target(&target);
            let request = HttpRequest {
                id: request_id,
                method,
                uri: target,
                resource,
                querystring,
                headers,
                body,
            };
            let request_cb = request_cb.clone();
            invoke_user(server_event, move || (request_cb.borrow_mut())(request));
        }
    }
}

fn server_conn_event(
    cond: &Condition,
    conn: &Rc<RefCell<ServerConn>>,
    server_event: Option<EventCb>,
) {
    // The socket layer has already closed the connection for terminal
    // conditions; all that is left is cancelling the in-flight request.
    let pending = conn.borrow_mut().current.take();
    if let Some(request_id) = pending {
        let cancelled = with_loop(|s| s.destroy_handle(request_id).is_some()).unwrap_or(false);
        if cancelled {
            deliver_condition(
                server_event,
                &Condition::HttpError {
                    code: -1,
                    msg: format!("peer went away before the response: {cond}"),
                },
            );
        }
    }
}

/// Start an HTTP server on `bind_addr:port` (`None` binds 0.0.0.0).
///
/// Every complete request is delivered to `request_cb` as an
/// [`HttpRequest`]; the application must eventually answer it with
/// [`http_response`]. Peer aborts before the response surface on
/// `event_cb` as [`Condition::HttpError`].
pub fn http_server(
    bind_addr: Option<Ipv4Addr>,
    port: u16,
    request_cb: impl FnMut(HttpRequest) + 'static,
    event_cb: impl FnMut(&Condition) + 'static,
) -> Result<HttpServerHandle, LoopError> {
    let ip = bind_addr.unwrap_or(Ipv4Addr::UNSPECIFIED);
    let mut listener = bind_listener(ip, port, -1)?;
    with_loop(move |s| {
        let id = s.registry.allocate(HandleKind::HttpServer);
        s.reactor.register(&mut listener, id.index(), Interest::READABLE)?;
        s.registry.attach(
            id,
            HandleKind::HttpServer,
            Bundle::HttpServer {
                request: Rc::new(RefCell::new(request_cb)),
                event: Some(share_event_cb(event_cb)),
            },
            HandleState::HttpServer(HttpServerState { listener: Some(listener) }),
        );
        tracing::debug!(%ip, port, "http server listening");
        Ok(HttpServerHandle { id })
    })?
}

/// Stop accepting HTTP connections. In-flight requests stay alive, and
/// closing again is a no-op.
pub fn close_http_server(server: HttpServerHandle) -> Result<(), LoopError> {
    with_loop(|s| {
        let _ = s.destroy_handle(server.id);
    })
}

/// Answer a server request.
///
/// The response always carries `Connection: close` and a computed
/// `Content-Length`; the connection closes once it is flushed. Answering
/// a request that was already answered or cancelled is a silent no-op.
pub fn http_response(request: &HttpRequest, options: ResponseOptions) -> Result<(), LoopError> {
    let socket_id = with_loop(|s| {
        s.destroy_handle(request.id).and_then(|record| match record.state {
            HandleState::HttpRequest(st) => Some(st.socket),
            _ => None,
        })
    })?;
    let Some(socket_id) = socket_id else {
        return Ok(());
    };
    let bytes = serialize_response(options.status, &options.headers, &options.body);
    let sock = Socket { id: socket_id };
    if crate::tcp::write_socket_data(sock, bytes, WriteOptions::default()).is_ok() {
        let _ = crate::tcp::close_socket(sock);
    }
    Ok(())
}

/// Trampoline target for HTTP listener readiness.
pub(crate) fn handle_accept(id: HandleId) {
    loop {
        let next = with_loop(|s| {
            let record = s.registry.lookup(id)?;
            let HandleState::HttpServer(srv) = &mut record.state else { return None };
            let listener = srv.listener.as_ref()?;
            let callbacks = match &record.bundle {
                Bundle::HttpServer { request, event } => (request.clone(), event.clone()),
                _ => return None,
            };
            Some((listener.accept(), callbacks))
        })
        .ok()
        .flatten();
        let Some((result, (request_cb, server_event))) = next else { return };
        match result {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "http connection accepted");
                let conn = Rc::new(RefCell::new(ServerConn { buf: Vec::new(), current: None }));

                let read_conn = conn.clone();
                let read_request_cb = request_cb;
                let read_server_event = server_event.clone();
                let read_cb: ReadCb = share_read_cb(move |sock, bytes| {
                    server_conn_data(
                        sock,
                        bytes,
                        &read_conn,
                        &read_request_cb,
                        read_server_event.clone(),
                    );
                });

                let event_cb: EventCb = share_event_cb(move |cond| {
                    server_conn_event(cond, &conn, server_event.clone());
                });

                let _ = crate::tcp::adopt_incoming(stream, Some(read_cb), None, Some(event_cb));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                deliver_condition(
                    server_event,
                    &Condition::HttpError {
                        code: e.raw_os_error().unwrap_or(-1),
                        msg: e.to_string(),
                    },
                );
                return;
            }
        }
        if exiting() {
            return;
        }
    }
}

fn parse_uri(uri: &str) -> Result<(String, u16, String), LoopError> {
    let rest = uri
        .strip_prefix("http://")
        .ok_or_else(|| LoopError::BadUri(uri.to_string()))?;
    let (authority, resource) = match rest.find('/') {
        Some(slash) => (&rest[..slash], rest[slash..].to_string()),
        None => (rest, "/".to_string()),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (
            host,
            port.parse::<u16>().map_err(|_| LoopError::BadUri(uri.to_string()))?,
        ),
        None => (authority, HTTP_DEFAULT_PORT),
    };
    if host.is_empty() {
        return Err(LoopError::BadUri(uri.to_string()));
    }
    Ok((host.to_string(), port, resource))
}

fn serialize_request(
    options: &ClientOptions,
    host: &str,
    port: u16,
    resource: &str,
) -> Vec<u8> {
    let mut head = format!("{} {} HTTP/1.1\r\n", options.method, resource);
    let mut has_host = false;
    for (name, value) in &options.headers {
        // Connection is forced to close-on-reply and the runtime owns
        // Content-Length.
        if name.eq_ignore_ascii_case("connection") || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        if name.eq_ignore_ascii_case("host") {
            has_host = true;
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    if !has_host {
        if port == HTTP_DEFAULT_PORT {
            head.push_str(&format!("Host: {host}\r\n"));
        } else {
            head.push_str(&format!("Host: {host}:{port}\r\n"));
        }
    }
    if let Some(body) = &options.body {
        head.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    head.push_str("Connection: close\r\n\r\n");
    let mut bytes = head.into_bytes();
    if let Some(body) = &options.body {
        bytes.extend_from_slice(body);
    }
    bytes
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Length(usize),
    Chunked,
    UntilEof,
}

struct ResponseHead {
    status: u16,
    headers: Vec<(String, String)>,
    framing: Framing,
}

/// Incremental client-side response parser, owned by the request
/// socket's callbacks.
struct ClientParse {
    raw: Vec<u8>,
    head: Option<ResponseHead>,
    body: Vec<u8>,
    done: bool,
    /// HEAD responses carry no body regardless of framing headers.
    head_request: bool,
}

impl ClientParse {
    fn new(head_request: bool) -> Self {
        Self { raw: Vec::new(), head: None, body: Vec::new(), done: false, head_request }
    }

    /// Consume whatever can be parsed from `raw`; `Ok(true)` once the
    /// response is complete.
    fn advance(&mut self) -> Result<bool, String> {
        if self.head.is_none() {
            let Some(head_len) = find_head_end(&self.raw) else {
                if self.raw.len() > MAX_HTTP_HEAD_BYTES {
                    return Err("response head too large".into());
                }
                return Ok(false);
            };
            let head_text = str::from_utf8(&self.raw[..head_len])
                .map_err(|_| "response head is not valid UTF-8".to_string())?;
            let mut lines = head_text.split("\r\n");
            let status_line = lines.next().unwrap_or_default();
            let mut parts = status_line.splitn(3, ' ');
            let version = parts.next().unwrap_or_default();
            if !version.starts_with("HTTP/") {
                return Err(format!("malformed status line: {status_line}"));
            }
            let status = parts
                .next()
                .and_then(|code| code.parse::<u16>().ok())
                .ok_or_else(|| format!("malformed status line: {status_line}"))?;
            let headers = parse_header_lines(lines)?;
            let framing = if header_value(&headers, "transfer-encoding")
                .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
            {
                Framing::Chunked
            } else if let Some(v) = header_value(&headers, "content-length") {
                Framing::Length(v.parse().map_err(|_| format!("bad content-length: {v}"))?)
            } else {
                Framing::UntilEof
            };
            self.raw.drain(..head_len);
            self.head = Some(ResponseHead { status, headers, framing });
        }

        if self.head_request {
            return Ok(true);
        }
        match self.head.as_ref().map(|h| h.framing) {
            Some(Framing::Length(total)) => {
                let take = total.saturating_sub(self.body.len()).min(self.raw.len());
                let tail: Vec<u8> = self.raw.drain(..take).collect();
                self.body.extend_from_slice(&tail);
                Ok(self.body.len() >= total)
            }
            Some(Framing::Chunked) => decode_chunks(&mut self.raw, &mut self.body),
            Some(Framing::UntilEof) => {
                self.body.append(&mut self.raw);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Whether end-of-stream completes the response.
    fn eof_completes(&self) -> bool {
        matches!(self.head.as_ref().map(|h| &h.framing), Some(Framing::UntilEof))
    }
}

/// Decode as many complete chunks as `raw` holds into `body`.
/// `Ok(true)` once the terminating zero-size chunk is seen.
fn decode_chunks(raw: &mut Vec<u8>, body: &mut Vec<u8>) -> Result<bool, String> {
    loop {
        let Some(line_end) = raw.windows(2).position(|w| w == b"\r\n") else {
            return Ok(false);
        };
        let size_line = str::from_utf8(&raw[..line_end])
            .map_err(|_| "chunk size line is not valid UTF-8".to_string())?;
        let size_token = size_line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_token, 16)
            .map_err(|_| format!("bad chunk size: {size_token}"))?;
        if size == 0 {
            // Trailers, if any, are ignored.
            return Ok(true);
        }
        let needed = line_end + 2 + size + 2;
        if raw.len() < needed {
            return Ok(false);
        }
        body.extend_from_slice(&raw[line_end + 2..line_end + 2 + size]);
        raw.drain(..needed);
    }
}

fn finish_client(client_id: HandleId, parse: &Rc<RefCell<ClientParse>>) {
    let (status, headers, body) = {
        let mut p = parse.borrow_mut();
        let Some(head) = p.head.take() else { return };
        (head.status, head.headers, std::mem::take(&mut p.body))
    };
    let callbacks = with_loop(|s| {
        s.registry.lookup(client_id).and_then(|record| match &mut record.bundle {
            Bundle::HttpClient { response, event } => Some((response.take(), event.clone())),
            _ => None,
        })
    })
    .ok()
    .flatten();
    let Some((response, event)) = callbacks else { return };
    if let Some(response) = response {
        invoke_user(event, move || response(status, headers, body));
    }
    let record = with_loop(|s| s.destroy_handle(client_id)).ok().flatten();
    if let Some(record) = record {
        if let HandleState::HttpClient(st) = record.state {
            if let Some(socket_id) = st.socket {
                let _ = crate::tcp::close_socket(Socket { id: socket_id });
            }
        }
    }
}

fn fail_client(client_id: HandleId, cond: Condition, close_socket_too: bool) {
    // Error class: the record is destroyed before delivery.
    let record = with_loop(|s| s.destroy_handle(client_id)).ok().flatten();
    let Some(record) = record else { return };
    if close_socket_too {
        if let HandleState::HttpClient(st) = &record.state {
            if let Some(socket_id) = st.socket {
                let _ = crate::tcp::close_socket(Socket { id: socket_id });
            }
        }
    }
    tracing::debug!(%cond, "http request failed");
    route_condition(record.bundle.event_cb(), &cond);
}

fn client_data(client_id: HandleId, parse: &Rc<RefCell<ClientParse>>, bytes: Vec<u8>) {
    let complete = {
        let mut p = parse.borrow_mut();
        if p.done {
            return;
        }
        p.raw.extend_from_slice(&bytes);
        match p.advance() {
            Ok(done) => done,
            Err(msg) => {
                p.done = true;
                drop(p);
                fail_client(client_id, Condition::HttpError { code: -1, msg }, true);
                return;
            }
        }
    };
    if complete {
        parse.borrow_mut().done = true;
        finish_client(client_id, parse);
    }
}

fn client_socket_event(client_id: HandleId, parse: &Rc<RefCell<ClientParse>>, cond: &Condition) {
    if parse.borrow().done {
        return;
    }
    match cond {
        Condition::TcpEof => {
            if parse.borrow().eof_completes() {
                parse.borrow_mut().done = true;
                finish_client(client_id, parse);
            } else {
                parse.borrow_mut().done = true;
                fail_client(
                    client_id,
                    Condition::HttpError {
                        code: -1,
                        msg: "connection closed before the full response".into(),
                    },
                    false,
                );
            }
        }
        Condition::TcpTimeout => fail_client(client_id, Condition::HttpTimeout, false),
        Condition::TcpRefused => fail_client(client_id, Condition::HttpRefused, false),
        cond if cond.is_error() => fail_client(
            client_id,
            Condition::HttpError { code: cond.errcode(), msg: cond.errmsg() },
            false,
        ),
        _ => {}
    }
}

/// Issue a one-shot HTTP request.
///
/// `request_cb(status, headers, body)` is delivered once the response is
/// complete; failures surface on `event_cb` as
/// [`Condition::HttpRefused`], [`Condition::HttpTimeout`], or
/// [`Condition::HttpError`]. The request record is destroyed after the
/// terminal callback either way.
pub fn http_client(
    uri: &str,
    request_cb: impl FnOnce(u16, Vec<(String, String)>, Vec<u8>) + 'static,
    event_cb: impl FnMut(&Condition) + 'static,
    options: ClientOptions,
) -> Result<(), LoopError> {
    let (host, port, resource) = parse_uri(uri)?;
    let event: EventCb = share_event_cb(event_cb);

    let client_id = with_loop(|s| {
        let id = s.registry.allocate(HandleKind::HttpClient);
        s.registry.attach(
            id,
            HandleKind::HttpClient,
            Bundle::HttpClient { response: Some(Box::new(request_cb)), event: Some(event) },
            HandleState::HttpClient(HttpClientState { socket: None }),
        );
        id
    })?;

    let request_bytes = serialize_request(&options, &host, port, &resource);
    let parse = Rc::new(RefCell::new(ClientParse::new(options.method == Method::HEAD)));

    let read_parse = parse.clone();
    let read_cb: ReadCb = share_read_cb(move |_sock, bytes| {
        client_data(client_id, &read_parse, bytes);
    });
    let sock_event_cb: EventCb = share_event_cb(move |cond| {
        client_socket_event(client_id, &parse, cond);
    });

    let socket = crate::tcp::tcp_send_shared(
        &host,
        port,
        request_bytes,
        Some(read_cb),
        None,
        Some(sock_event_cb),
        TcpOptions { read_timeout: options.timeout, write_timeout: options.timeout },
    )?;
    with_loop(|s| {
        if let Some(record) = s.registry.lookup(client_id) {
            if let HandleState::HttpClient(st) = &mut record.state {
                st.socket = Some(socket.id);
            }
        }
    })?;
    tracing::debug!(host = %host, port, "http request dispatched");
    Ok(())
}
