//! Proxy session state machine.
//!
//! One session per client request. The engine feeds it decoded packets,
//! RPC results, and timer events; the session drives both ZHTTP
//! transactions and decides whether the response streams back or is
//! handed off to the handler.
//!
//! # State Machine
//! ```text
//! Receiving → Routing → [Inspecting] → Dispatching → StreamingResponse → Finished
//!                 │                         │               │
//!                 │ (no route, loop,        │ (upstream     └──▶ Handoff ──▶ Finished
//!                 │  preflight, deny)       │  error: retry        (accept RPC,
//!                 └──▶ Finished             │  or 502)              detach)
//!                                           └──▶ Errored
//! ```
//!
//! # Design Decisions
//! - The session buffers the request body only until dispatch; after
//!   that both directions are credit-coupled (upstream gets credits as
//!   the client drains, and vice versa)
//! - Retries happen only before the first response byte reaches the
//!   client; the failing target cools down in the picker
//! - Handoff detaches both transactions without terminal frames;
//!   ownership moves to the handler

pub mod headers;

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::engine::{EngineIo, SessionTimer};
use crate::routing::{Route, Target};
use crate::rpc::RpcError;
use crate::session::headers as hdr;
use crate::zhttp::packet::get_header;
use crate::zhttp::tnetstring::Value;
use crate::zhttp::{
    ClientEvent, ClientTransaction, Header, RequestData, ResponseData, ServerEvent,
    ServerTransaction, TransactionError, TransactionState, ZhttpPacket,
};

/// Request-body credits granted to the connection manager; also the
/// request buffer cap before dispatch.
pub const REQUEST_CREDITS: u32 = 200_000;

/// Response-body credits granted to the upstream.
pub const RESPONSE_CREDITS: u32 = 200_000;

/// Response bytes buffered for a held response. At exactly this size the
/// handoff still succeeds; one byte more is a `BodyTooLarge` failure.
pub const MAX_RESPONSE_SIZE: usize = 100_000;

/// Forwarding buffers below this refill the sender's credit window.
const BUFFER_LOW_WATER: usize = 16_384;

/// Housekeeping cadence: keep-alives out, expiry checks in.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Receiving,
    Routing,
    Inspecting,
    Dispatching,
    StreamingResponse,
    Handoff,
    Finished,
    Errored,
}

/// Per-request aggregate. Owned by the engine's session arena; all
/// references to collaborators go through slot indices, never pointers.
pub struct Session {
    slot: usize,
    seq: u64,
    state: SessionState,

    server: Option<ServerTransaction>,
    client: Option<ClientTransaction>,

    route: Option<Arc<Route>>,
    target: Option<Target>,
    via_int: bool,

    request: RequestData,
    request_buffer: Vec<u8>,
    request_buffered_more: bool,
    request_sent_to_upstream: bool,
    request_streamed: bool,

    response: Option<ResponseData>,
    response_buffer: Vec<u8>,
    out_buffer: Vec<u8>,
    out_buffer_more: bool,
    response_started_to_client: bool,
    response_done: bool,

    accept_needed: bool,
    detached: bool,

    retries: u32,
    pending_upstream: Vec<ZhttpPacket>,
    closed_client_id: Option<Vec<u8>>,

    housekeeping_timer: Option<crate::event_loop::TimerId>,
    retry_timer: Option<crate::event_loop::TimerId>,
    deadline_timer: Option<crate::event_loop::TimerId>,

    started_at: Instant,
    bytes_to_client: u64,
    log_code: Option<u16>,
}

impl Session {
    pub fn new(
        slot: usize,
        seq: u64,
        server: ServerTransaction,
        request: RequestData,
        via_int: bool,
    ) -> Session {
        Session {
            slot,
            seq,
            state: SessionState::Receiving,
            server: Some(server),
            client: None,
            route: None,
            target: None,
            via_int,
            request_buffer: request.body.clone(),
            request_buffered_more: request.more,
            request_sent_to_upstream: false,
            request_streamed: false,
            request,
            response: None,
            response_buffer: Vec::new(),
            out_buffer: Vec::new(),
            out_buffer_more: true,
            response_started_to_client: false,
            response_done: false,
            accept_needed: false,
            detached: false,
            retries: 0,
            pending_upstream: Vec::new(),
            closed_client_id: None,
            housekeeping_timer: None,
            retry_timer: None,
            deadline_timer: None,
            started_at: Instant::now(),
            bytes_to_client: 0,
            log_code: None,
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, SessionState::Finished | SessionState::Errored)
    }

    pub fn server_key(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        self.server
            .as_ref()
            .map(|s| (s.peer().to_vec(), s.id().to_vec()))
    }

    pub fn client_id(&self) -> Option<Vec<u8>> {
        self.client.as_ref().map(|c| c.id().to_vec())
    }

    /// An upstream transaction id closed by retry; the engine drops its
    /// index entry.
    pub fn take_closed_client(&mut self) -> Option<Vec<u8>> {
        self.closed_client_id.take()
    }

    /// Kick off processing after the engine indexed the session.
    pub fn begin(&mut self, io: &mut EngineIo) {
        self.housekeeping_timer =
            io.start_session_timer(self.slot, self.seq, SessionTimer::Housekeeping, HOUSEKEEPING_INTERVAL);

        let stat = {
            let server = self.server.as_mut().expect("server transaction");
            let packet = server.grant_credits(REQUEST_CREDITS);
            let peer = server.peer().to_vec();
            io.send_server(self.via_int, &peer, &packet);

            io.stats.on_session_begin(server.id(), "")
        };
        if let Some(stat) = stat {
            io.publish_stat(stat);
        }

        self.state = SessionState::Routing;
        self.route_request(io);
    }

    /// A packet arrived on the client-facing transaction.
    pub fn on_server_packet(&mut self, io: &mut EngineIo, packet: &ZhttpPacket) {
        let Some(server) = self.server.as_mut() else {
            return;
        };

        let event = match server.handle_packet(packet) {
            Ok(event) => event,
            Err(TransactionError::Peer(condition)) => {
                tracing::debug!(condition = %condition, "client connection errored");
                self.state = SessionState::Errored;
                self.finish_client(io, "client-gone");
                return;
            }
            Err(e) => {
                tracing::debug!(error = %e, "bad packet on server transaction");
                self.terminate(io, "bad-request");
                return;
            }
        };

        match event {
            ServerEvent::Body { body, more } => self.on_request_body(io, body, more),
            ServerEvent::Credits(_) => self.flush_out_buffer(io),
            ServerEvent::KeepAlive => {}
            ServerEvent::Ping(pong) | ServerEvent::HandoffStart(pong) => {
                let peer = self.server.as_ref().unwrap().peer().to_vec();
                io.send_server(self.via_int, &peer, &pong);
            }
            ServerEvent::Cancelled => {
                self.state = SessionState::Errored;
                self.finish_client(io, "cancelled");
            }
        }
    }

    /// A packet arrived on the upstream transaction.
    pub fn on_client_packet(&mut self, io: &mut EngineIo, packet: &ZhttpPacket) {
        let Some(client) = self.client.as_mut() else {
            return;
        };

        let event = match client.handle_packet(packet) {
            Ok(event) => event,
            Err(TransactionError::Peer(condition)) => {
                self.on_upstream_error(io, condition);
                return;
            }
            Err(e) => {
                self.on_upstream_error(io, e.to_string());
                return;
            }
        };

        // the first reply tells us which peer owns the upstream side;
        // flush sends parked until then
        if !self.pending_upstream.is_empty() {
            let peer = self.client.as_ref().unwrap().peer().to_vec();
            if !peer.is_empty() {
                for parked in self.pending_upstream.drain(..) {
                    io.send_upstream(&peer, &parked);
                }
            }
        }

        match event {
            ClientEvent::ResponseStart(response) => self.on_response_start(io, response),
            ClientEvent::Body { body, more } => self.on_response_body(io, body, more),
            ClientEvent::Credits(_) => self.pump_request_body(io),
            ClientEvent::KeepAlive => {}
            ClientEvent::Ping(pong) | ClientEvent::HandoffStart(pong) => {
                let peer = self.client.as_ref().unwrap().peer().to_vec();
                io.send_upstream(&peer, &pong);
            }
        }
    }

    /// Inspect RPC completed (or failed, or timed out).
    pub fn on_inspect_result(&mut self, io: &mut EngineIo, result: Result<Value, RpcError>) {
        if self.state != SessionState::Inspecting {
            return;
        }

        match result {
            Ok(value) => {
                if value.get("no-proxy").and_then(Value::as_bool).unwrap_or(false) {
                    // denied: a short response may ride along
                    let (code, reason, body) = match value.get("response") {
                        Some(response) => (
                            response.get("code").and_then(Value::as_int).unwrap_or(403) as u16,
                            response
                                .get("reason")
                                .and_then(Value::as_str)
                                .unwrap_or("Forbidden")
                                .to_string(),
                            response
                                .get("body")
                                .and_then(Value::as_bytes)
                                .unwrap_or_default()
                                .to_vec(),
                        ),
                        None => (403, "Forbidden".to_string(), Vec::new()),
                    };
                    self.respond_synthetic(io, code, &reason, &body);
                    return;
                }

                self.accept_needed = value.get("accept").and_then(Value::as_bool).unwrap_or(false);
            }
            Err(RpcError::Timeout) if io.config.inspect_timeout_permits => {
                tracing::debug!("inspect timed out; treating as permit");
            }
            Err(RpcError::Timeout) => {
                self.respond_synthetic(io, 502, "Bad Gateway", b"inspect timeout\n");
                return;
            }
            Err(e) => {
                // degrade to plain proxying
                tracing::debug!(error = %e, "inspect failed; proxying without hold");
            }
        }

        self.state = SessionState::Dispatching;
        self.dispatch(io);
    }

    /// Accept RPC completed (or failed, or timed out).
    pub fn on_accept_result(&mut self, io: &mut EngineIo, result: Result<Value, RpcError>) {
        if self.state != SessionState::Handoff {
            return;
        }

        match result {
            Ok(value) => {
                let accepted = value
                    .get("accepted")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                if accepted {
                    // ownership of both transactions moves to the handler:
                    // no terminal frames, just forget them
                    self.detached = true;
                    self.log_code = self.response.as_ref().map(|r| r.code);
                    self.finish();
                    return;
                }

                tracing::debug!("handler refused accept");
                self.respond_synthetic(io, 502, "Bad Gateway", b"accept refused\n");
            }
            Err(e) => {
                tracing::debug!(error = %e, "accept failed");
                self.respond_synthetic(io, 502, "Bad Gateway", b"accept failed\n");
            }
        }
    }

    /// One of the session's timers fired.
    pub fn on_timer(&mut self, io: &mut EngineIo, kind: SessionTimer) {
        match kind {
            SessionTimer::Housekeeping => {
                self.housekeeping_timer = None;
                let now = Instant::now();

                let server_expired = self.server.as_ref().map(|s| s.expired(now)).unwrap_or(false);
                let client_expired = self.client.as_ref().map(|c| c.expired(now)).unwrap_or(false);

                if server_expired || client_expired {
                    tracing::debug!(
                        server_expired,
                        client_expired,
                        "keep-alive timeout; terminating session"
                    );
                    self.terminate(io, "connection-timeout");
                    return;
                }

                if let Some(server) = self.server.as_mut() {
                    let packet = server.keep_alive();
                    let peer = server.peer().to_vec();
                    io.send_server(self.via_int, &peer, &packet);
                }
                if let Some(client) = self.client.as_mut() {
                    let peer = client.peer().to_vec();
                    if !peer.is_empty() {
                        let packet = client.keep_alive();
                        io.send_upstream(&peer, &packet);
                    }
                }

                self.housekeeping_timer = io.start_session_timer(
                    self.slot,
                    self.seq,
                    SessionTimer::Housekeeping,
                    HOUSEKEEPING_INTERVAL,
                );
            }
            SessionTimer::Retry => {
                self.retry_timer = None;
                if self.state == SessionState::Dispatching {
                    self.dispatch(io);
                }
            }
            SessionTimer::Deadline => {
                self.deadline_timer = None;
                tracing::debug!("per-route timeout hit");
                if !self.response_started_to_client {
                    self.respond_synthetic(io, 504, "Gateway Timeout", b"upstream timeout\n");
                } else {
                    self.terminate(io, "response-timeout");
                }
            }
        }
    }

    /// Hard-stop the session, sending terminal frames both ways.
    pub fn terminate(&mut self, io: &mut EngineIo, condition: &str) {
        if self.is_terminal() {
            return;
        }

        if let Some(client) = self.client.as_mut() {
            let peer = client.peer().to_vec();
            if !peer.is_empty() {
                let packet = client.cancel();
                io.send_upstream(&peer, &packet);
            }
        }

        self.state = SessionState::Errored;
        self.finish_client(io, condition);
    }

    /// Cancel timers and abandon RPC calls. The engine calls this right
    /// before dropping the session from the arena.
    pub fn cleanup(&mut self, io: &mut EngineIo) {
        for timer in [
            self.housekeeping_timer.take(),
            self.retry_timer.take(),
            self.deadline_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            io.cancel_timer(timer);
        }

        io.abandon_rpc(self.slot);

        let stat = self
            .server
            .as_ref()
            .and_then(|s| io.stats.on_session_end(s.id()));
        if let Some(stat) = stat {
            io.publish_stat(stat);
        }

        self.log_finished(io);
    }

    // ---- internal transitions ----

    fn route_request(&mut self, io: &mut EngineIo) {
        debug_assert_eq!(self.state, SessionState::Routing);

        let host = self.routing_host(io);
        let path = self
            .request
            .uri
            .split_once("://")
            .and_then(|(_, rest)| rest.find('/').map(|i| &rest[i..]))
            .unwrap_or("/")
            .split('?')
            .next()
            .unwrap_or("/")
            .to_string();

        let Some(route) = io.domain_map.lookup(&host, &path) else {
            tracing::debug!(host = %host, path = %path, "no route");
            self.respond_synthetic(io, 502, "Bad Gateway", b"no route\n");
            return;
        };

        tracing::debug!(host = %host, path = %path, route = %route.id(), "routed");

        // loop detection fails closed before anything else sees the request
        let cdn_token = io.config.cdn_loop.clone();
        if let Some(token) = cdn_token {
            if hdr::cdn_loop_detected(&self.request.headers, &token) {
                tracing::warn!(route = %route.id(), "proxy loop detected");
                self.respond_synthetic(io, 502, "Bad Gateway", b"loop detected\n");
                return;
            }
        }

        if (io.config.auto_cross_origin || route.auto_cross_origin)
            && hdr::is_cors_preflight(&self.request.method, &self.request.headers)
        {
            let response_headers = hdr::cors_preflight_headers(&self.request.headers);
            self.respond_synthetic_with_headers(io, 200, "OK", response_headers, b"");
            return;
        }

        self.sanitize_request(io, &route);
        self.route = Some(route.clone());

        if route.session && io.has_inspect() {
            self.state = SessionState::Inspecting;

            let body_prefix =
                &self.request_buffer[..self.request_buffer.len().min(io.config.inspect_prefetch)];
            let args = Value::Map(vec![
                (b"method".to_vec(), Value::bytes(&self.request.method)),
                (b"uri".to_vec(), Value::bytes(&self.request.uri)),
                (b"headers".to_vec(), headers_value(&self.request.headers)),
                (b"body".to_vec(), Value::Bytes(body_prefix.to_vec())),
            ]);

            if !io.call_inspect(self.slot, args) {
                // unavailable counts as permit-plain
                self.state = SessionState::Dispatching;
                self.dispatch(io);
            }
            return;
        }

        self.state = SessionState::Dispatching;
        self.dispatch(io);
    }

    fn routing_host(&self, io: &EngineIo) -> String {
        if io.config.accept_pushpin_route {
            if let Some(value) = get_header(&self.request.headers, "pushpin-route") {
                if let Ok(s) = std::str::from_utf8(value) {
                    return s.trim().to_ascii_lowercase();
                }
            }
        }

        if let Some(value) = get_header(&self.request.headers, "host") {
            if let Ok(s) = std::str::from_utf8(value) {
                // strip port
                let host = s.rsplit_once(':').map(|(h, _)| h).unwrap_or(s);
                return host.to_ascii_lowercase();
            }
        }

        self.request
            .uri
            .split_once("://")
            .map(|(_, rest)| rest.split(['/', ':', '?']).next().unwrap_or(""))
            .unwrap_or("")
            .to_ascii_lowercase()
    }

    fn sanitize_request(&mut self, io: &EngineIo, route: &Route) {
        let config = &io.config;
        let headers = &mut self.request.headers;

        hdr::strip_hop_by_hop(headers);

        if !config.accept_pushpin_route {
            hdr::remove_header(headers, "pushpin-route");
        }

        let trusted = self.via_int
            || route.trusted
            || hdr::verify_grip_sig(headers, &config.upstream_key);

        // untrusted rule always applies; trusted peers get the trusted
        // rule on top
        hdr::apply_xff(
            headers,
            config.xff_untrusted_rule,
            self.request.peer_address.as_deref(),
        );
        if trusted {
            hdr::apply_xff(
                headers,
                config.xff_trusted_rule,
                self.request.peer_address.as_deref(),
            );
        }

        if !config.accept_x_forwarded_protocol && !trusted {
            hdr::remove_header(headers, "x-forwarded-protocol");
        }

        let scheme = if self.request.uri.starts_with("https:") {
            "https"
        } else {
            "http"
        };
        hdr::set_forwarded_proto(headers, scheme, config.set_xf_proto, config.set_xf_protocol);

        hdr::mark_orig_headers(headers, &config.orig_headers_need_mark);

        if let Some(token) = config.cdn_loop.as_deref() {
            hdr::append_cdn_loop(headers, token);
        }

        for name in &route.headers_to_remove {
            hdr::remove_header(headers, name);
        }
        for (name, value) in &route.headers_to_add {
            headers.push(Header::new(name.clone(), value.as_bytes()));
        }

        if route.session && !route.no_grip_sig {
            let iss = route.sig_iss.as_deref().unwrap_or(&config.sig_iss);
            let key = route.sig_key.as_deref().unwrap_or(&config.sig_key);
            if let Some(sig) = hdr::grip_sig(iss, key) {
                hdr::remove_header(headers, "grip-sig");
                headers.push(sig);
            }
        }

        if route.insert_id_headers {
            if let Some(server) = self.server.as_ref() {
                headers.push(Header::new(
                    "X-Request-Id",
                    String::from_utf8_lossy(server.id()).as_bytes(),
                ));
            }
        }
    }

    fn dispatch(&mut self, io: &mut EngineIo) {
        debug_assert_eq!(self.state, SessionState::Dispatching);
        let route = self.route.as_ref().expect("route set before dispatch").clone();

        let Some(target) = io.pick_target(&route).cloned() else {
            self.respond_synthetic(io, 502, "Bad Gateway", b"no usable upstream\n");
            return;
        };

        if target.test {
            // loopback target: answer directly
            self.respond_synthetic(io, 200, "OK", b"");
            return;
        }

        let scheme = if target.ssl { "https" } else { "http" };
        let path_and_query = self
            .request
            .uri
            .split_once("://")
            .and_then(|(_, rest)| rest.find('/').map(|i| &rest[i..]))
            .unwrap_or("/");
        let uri = format!("{}://{}{}", scheme, target.authority(), path_and_query);

        // a fully buffered body is replayable on retry; a streamed one is
        // consumed as it goes and forecloses retries
        let streaming = self.request_buffered_more;
        let body = if streaming {
            self.request_streamed = true;
            std::mem::take(&mut self.request_buffer)
        } else {
            self.request_buffer.clear();
            self.request.body.clone()
        };

        let upstream_request = RequestData {
            method: self.request.method.clone(),
            uri,
            headers: self.request.headers.clone(),
            body,
            more: streaming,
            peer_address: None,
        };

        let id = io.alloc_client_id();
        let (client, first_packet) = ClientTransaction::new(
            id,
            io.instance_id(),
            &upstream_request,
            RESPONSE_CREDITS,
            crate::zhttp::DEFAULT_TIMEOUT,
        );

        tracing::debug!(
            route = %route.id(),
            target = %target.authority(),
            retries = self.retries,
            "dispatching"
        );

        self.request_sent_to_upstream = true;
        self.client = Some(client);
        self.target = Some(target);
        io.send_upstream_first(&first_packet);

        if self.deadline_timer.is_none() {
            if let Some(secs) = route.timeout_secs {
                self.deadline_timer = io.start_session_timer(
                    self.slot,
                    self.seq,
                    SessionTimer::Deadline,
                    Duration::from_secs(secs),
                );
            }
        }

        self.state = SessionState::StreamingResponse;
    }

    fn on_request_body(&mut self, io: &mut EngineIo, body: Vec<u8>, more: bool) {
        if let Some(server) = self.server.as_ref() {
            io.stats.on_activity(server.id(), body.len() as u64, 0);
        }

        self.request_buffered_more = more;

        if !self.request_sent_to_upstream {
            // still buffering toward dispatch; the cap equals the credits
            // we granted, so overflow is a protocol violation
            if self.request_buffer.len() + body.len() > REQUEST_CREDITS as usize {
                self.terminate(io, "request-too-large");
                return;
            }
            self.request_buffer.extend_from_slice(&body);
            if !more {
                self.request.body = self.request_buffer.clone();
            }
            return;
        }

        self.request_buffer.extend_from_slice(&body);
        self.pump_request_body(io);
    }

    /// Move buffered request body to the upstream as its credits allow,
    /// refilling the connection manager's window as the buffer drains.
    fn pump_request_body(&mut self, io: &mut EngineIo) {
        let Some(client) = self.client.as_mut() else {
            return;
        };

        let mut sent_total = 0usize;
        while !self.request_buffer.is_empty() {
            let window = client.send_window();
            if window == 0 {
                break;
            }

            let n = window.min(self.request_buffer.len());
            let chunk: Vec<u8> = self.request_buffer.drain(..n).collect();
            let more = self.request_buffered_more || !self.request_buffer.is_empty();

            match client.send_body(&chunk, more) {
                Ok(packet) => {
                    let peer = client.peer().to_vec();
                    if peer.is_empty() {
                        self.pending_upstream.push(packet);
                    } else {
                        io.send_upstream(&peer, &packet);
                    }
                    sent_total += n;
                }
                Err(_) => break,
            }
        }

        if sent_total > 0 && self.request_buffer.len() < BUFFER_LOW_WATER {
            if let Some(server) = self.server.as_mut() {
                if !server.request_finished() {
                    let packet = server.grant_credits(sent_total as u32);
                    let peer = server.peer().to_vec();
                    io.send_server(self.via_int, &peer, &packet);
                }
            }
        }
    }

    fn on_response_start(&mut self, io: &mut EngineIo, response: ResponseData) {
        if self.state != SessionState::StreamingResponse {
            return;
        }

        if self.accept_needed && hdr::has_hold_directive(&response.headers) {
            self.state = SessionState::Handoff;
            self.response_buffer = response.body.clone();
            self.response_done = !response.more;
            self.response = Some(response);

            if self.response_buffer.len() > MAX_RESPONSE_SIZE {
                self.respond_synthetic(io, 502, "Bad Gateway", b"response too large to hold\n");
                return;
            }

            if self.response_done {
                self.send_accept(io);
            }
            return;
        }

        let mut headers = response.headers.clone();
        hdr::strip_hop_by_hop(&mut headers);
        if self.route.as_ref().map(|r| r.session).unwrap_or(false) {
            headers.retain(|h| !h.name.to_ascii_lowercase().starts_with("grip-"));
        }

        self.log_code = Some(response.code);
        self.forward_response_head(io, response.code, &response.reason.clone(), headers, response);
    }

    fn forward_response_head(
        &mut self,
        io: &mut EngineIo,
        code: u16,
        reason: &str,
        headers: Vec<Header>,
        response: ResponseData,
    ) {
        let Some(server) = self.server.as_mut() else {
            return;
        };

        let window = server.send_window();
        let (now, later) = if response.body.len() <= window {
            (response.body.as_slice(), &[][..])
        } else {
            response.body.split_at(window)
        };

        let more = response.more || !later.is_empty();
        match server.respond(code, reason, headers, now, more) {
            Ok(packet) => {
                let peer = server.peer().to_vec();
                self.bytes_to_client += now.len() as u64;
                io.stats.on_activity(server.id(), 0, now.len() as u64);
                io.send_server(self.via_int, &peer, &packet);
                self.response_started_to_client = true;

                self.out_buffer = later.to_vec();
                self.out_buffer_more = response.more;
                self.maybe_finish_streaming();
            }
            Err(e) => {
                tracing::debug!(error = %e, "failed to start response");
                self.terminate(io, "credit-underflow");
            }
        }
    }

    fn on_response_body(&mut self, io: &mut EngineIo, body: Vec<u8>, more: bool) {
        match self.state {
            SessionState::Handoff => {
                if self.response_buffer.len() + body.len() > MAX_RESPONSE_SIZE {
                    self.respond_synthetic(io, 502, "Bad Gateway", b"response too large to hold\n");
                    return;
                }
                self.response_buffer.extend_from_slice(&body);
                if let Some(response) = self.response.as_mut() {
                    response.body = self.response_buffer.clone();
                }
                if !more {
                    self.response_done = true;
                    self.send_accept(io);
                }
            }
            SessionState::StreamingResponse => {
                self.out_buffer.extend_from_slice(&body);
                self.out_buffer_more = more;
                self.flush_out_buffer(io);
            }
            _ => {}
        }
    }

    /// Move buffered response body to the client as its credits allow,
    /// refilling the upstream's window as the buffer drains.
    fn flush_out_buffer(&mut self, io: &mut EngineIo) {
        if self.state != SessionState::StreamingResponse || !self.response_started_to_client {
            return;
        }

        let Some(server) = self.server.as_mut() else {
            return;
        };

        let mut sent_total = 0usize;
        while !self.out_buffer.is_empty() {
            let window = server.send_window();
            if window == 0 {
                break;
            }

            let n = window.min(self.out_buffer.len());
            let chunk: Vec<u8> = self.out_buffer.drain(..n).collect();
            let more = self.out_buffer_more || !self.out_buffer.is_empty();

            match server.send_body(&chunk, more) {
                Ok(packet) => {
                    let peer = server.peer().to_vec();
                    io.send_server(self.via_int, &peer, &packet);
                    sent_total += n;
                }
                Err(_) => break,
            }
        }

        if sent_total > 0 {
            self.bytes_to_client += sent_total as u64;
            let id = self.server.as_ref().unwrap().id().to_vec();
            io.stats.on_activity(&id, 0, sent_total as u64);
        }

        // refill the upstream's window once we have drained enough
        if sent_total > 0 && self.out_buffer.len() < BUFFER_LOW_WATER {
            if let Some(client) = self.client.as_mut() {
                if !client.response_finished() {
                    let packet = client.grant_credits(sent_total as u32);
                    let peer = client.peer().to_vec();
                    if !peer.is_empty() {
                        io.send_upstream(&peer, &packet);
                    }
                }
            }
        }

        self.maybe_finish_streaming();
    }

    fn maybe_finish_streaming(&mut self) {
        let client_done = self
            .client
            .as_ref()
            .map(|c| c.response_finished())
            .unwrap_or(true);

        if client_done && self.out_buffer.is_empty() && !self.out_buffer_more {
            self.finish();
        }
    }

    fn on_upstream_error(&mut self, io: &mut EngineIo, condition: String) {
        tracing::debug!(condition = %condition, "upstream error");

        if let (Some(client), Some(target)) = (self.client.take(), self.target.as_ref()) {
            self.closed_client_id = Some(client.id().to_vec());
            io.mark_target_failure(target, io.config.retry.cooldown);
        }

        if self.state == SessionState::Handoff {
            // the held response evaporated before accept completed
            self.respond_synthetic(io, 502, "Bad Gateway", b"upstream lost\n");
            return;
        }

        if !self.request_streamed
            && io
                .config
                .retry
                .can_retry(self.retries, self.response_started_to_client)
        {
            self.retries += 1;
            let delay = io.config.retry.delay(self.retries - 1);
            tracing::debug!(retries = self.retries, delay_ms = delay.as_millis() as u64, "retrying");

            self.state = SessionState::Dispatching;
            self.retry_timer =
                io.start_session_timer(self.slot, self.seq, SessionTimer::Retry, delay);
            if self.retry_timer.is_none() {
                // no timer headroom; retry immediately rather than hang
                self.dispatch(io);
            }
            return;
        }

        if self.response_started_to_client {
            self.terminate(io, "upstream-error");
        } else if io.config.debug {
            let body = format!("upstream error: {}\n", condition);
            self.respond_synthetic(io, 502, "Bad Gateway", body.as_bytes());
        } else {
            self.respond_synthetic(io, 502, "Bad Gateway", b"upstream error\n");
        }
    }

    fn send_accept(&mut self, io: &mut EngineIo) {
        let route_id = self.route.as_ref().map(|r| r.id()).unwrap_or_default();
        let response = self.response.as_ref().expect("buffered response");

        let server = self.server.as_ref().expect("server transaction");
        let client = self.client.as_ref().expect("client transaction");

        let args = Value::Map(vec![
            (b"route".to_vec(), Value::bytes(&route_id)),
            (
                b"request".to_vec(),
                Value::Map(vec![
                    (b"method".to_vec(), Value::bytes(&self.request.method)),
                    (b"uri".to_vec(), Value::bytes(&self.request.uri)),
                    (b"headers".to_vec(), headers_value(&self.request.headers)),
                    (b"body".to_vec(), Value::Bytes(self.request.body.clone())),
                ]),
            ),
            (
                b"response".to_vec(),
                Value::Map(vec![
                    (b"code".to_vec(), Value::Int(response.code as i64)),
                    (b"reason".to_vec(), Value::bytes(&response.reason)),
                    (b"headers".to_vec(), headers_value(&response.headers)),
                    (b"body".to_vec(), Value::Bytes(self.response_buffer.clone())),
                ]),
            ),
            (
                b"conn".to_vec(),
                Value::Map(vec![
                    (b"sender".to_vec(), Value::Bytes(server.peer().to_vec())),
                    (b"id".to_vec(), Value::Bytes(server.id().to_vec())),
                    (
                        b"credits".to_vec(),
                        Value::Int(server.send_window() as i64),
                    ),
                ]),
            ),
            (
                b"upstream".to_vec(),
                Value::Map(vec![
                    (b"sender".to_vec(), Value::Bytes(client.peer().to_vec())),
                    (b"id".to_vec(), Value::Bytes(client.id().to_vec())),
                ]),
            ),
            (
                b"response-sent".to_vec(),
                Value::Bool(self.response_started_to_client),
            ),
        ]);

        if !io.call_accept(self.slot, args) {
            self.respond_synthetic(io, 502, "Bad Gateway", b"accept unavailable\n");
        }
    }

    fn respond_synthetic(&mut self, io: &mut EngineIo, code: u16, reason: &str, body: &[u8]) {
        self.respond_synthetic_with_headers(
            io,
            code,
            reason,
            vec![Header::new("Content-Type", "text/plain")],
            body,
        );
    }

    fn respond_synthetic_with_headers(
        &mut self,
        io: &mut EngineIo,
        code: u16,
        reason: &str,
        headers: Vec<Header>,
        body: &[u8],
    ) {
        // drop the upstream side if it is still open
        if let Some(mut client) = self.client.take() {
            self.closed_client_id = Some(client.id().to_vec());
            let peer = client.peer().to_vec();
            if !peer.is_empty() {
                let packet = client.cancel();
                io.send_upstream(&peer, &packet);
            }
        }

        self.log_code = Some(code);

        if let Some(server) = self.server.as_mut() {
            // synthesized bodies are small; a peer that granted less than
            // this is not a functioning connection manager
            let body: &[u8] = if body.len() <= server.send_window() {
                body
            } else {
                b""
            };
            match server.respond(code, reason, headers, body, false) {
                Ok(packet) => {
                    let peer = server.peer().to_vec();
                    self.bytes_to_client += body.len() as u64;
                    self.response_started_to_client = true;
                    io.send_server(self.via_int, &peer, &packet);
                }
                Err(e) => {
                    tracing::debug!(error = %e, "failed to synthesize response");
                }
            }
        }

        self.finish();
    }

    /// Finish without touching the client-facing transaction (it is
    /// already gone or errored).
    fn finish_client(&mut self, io: &mut EngineIo, condition: &str) {
        if let Some(mut client) = self.client.take() {
            self.closed_client_id = Some(client.id().to_vec());
            let peer = client.peer().to_vec();
            if !peer.is_empty() {
                let packet = client.cancel();
                io.send_upstream(&peer, &packet);
            }
        }

        if let Some(server) = self.server.as_mut() {
            if !matches!(
                server.state(),
                TransactionState::Finished | TransactionState::Errored
            ) {
                let packet = server.error(condition);
                let peer = server.peer().to_vec();
                io.send_server(self.via_int, &peer, &packet);
            }
        }

        if self.state != SessionState::Errored {
            self.state = SessionState::Errored;
        }
    }

    fn finish(&mut self) {
        if !self.is_terminal() {
            self.state = SessionState::Finished;
        }
    }

    fn log_finished(&self, io: &EngineIo) {
        let duration_ms = self.started_at.elapsed().as_millis() as u64;
        let route = self.route.as_ref().map(|r| r.id()).unwrap_or_default();
        let target = self
            .target
            .as_ref()
            .map(|t| t.authority())
            .unwrap_or_default();

        let from = if io.config.log_from {
            get_header(&self.request.headers, "from")
                .map(|v| String::from_utf8_lossy(v).into_owned())
        } else {
            None
        };
        let user_agent = if io.config.log_user_agent {
            get_header(&self.request.headers, "user-agent")
                .map(|v| String::from_utf8_lossy(v).into_owned())
        } else {
            None
        };

        tracing::info!(
            route = %route,
            method = %self.request.method,
            uri = %self.request.uri,
            code = self.log_code.unwrap_or(0),
            bytes = self.bytes_to_client,
            duration_ms,
            upstream = %target,
            detached = self.detached,
            from = from.as_deref().unwrap_or(""),
            user_agent = user_agent.as_deref().unwrap_or(""),
            "request finished"
        );
    }
}

fn headers_value(headers: &[Header]) -> Value {
    Value::List(
        headers
            .iter()
            .map(|h| {
                Value::List(vec![
                    Value::bytes(&h.name),
                    Value::Bytes(h.value.clone()),
                ])
            })
            .collect(),
    )
}
