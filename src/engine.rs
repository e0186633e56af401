//! Per-worker proxy engine.
//!
//! Owns one worker's sockets, session arena, RPC clients, and stats.
//! Sessions are slab entries addressed by slot; the engine routes every
//! bus frame, RPC result, and timer event to the owning session, then
//! reaps sessions that reached a terminal state.
//!
//! # Design Decisions
//! - All socket callbacks funnel into one `pump` that drains every
//!   socket: bus readability is only a hint, so draining everything is
//!   both simplest and correct
//! - The engine refuses new requests when the session budget or the
//!   event-loop registration budget would be exceeded (503)
//! - Sessions never hold references to each other or to the engine;
//!   timers and RPC replies re-find them by (slot, seq)

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::{Duration, Instant};

use slab::Slab;

use crate::bus::{suffix_spec, suffix_specs, BusError, BusSocket, SpecInfo};
use crate::config::{Config, XffRule};
use crate::event_loop::{
    EventLoopError, Interest, LoopHandle, TimerId, TIMERS_PER_SESSION,
};
use crate::load_balancer::TargetPicker;
use crate::resilience::RetryPolicy;
use crate::routing::{DomainMap, Route, Target};
use crate::rpc::{CommandServer, RpcClient, RpcError};
use crate::session::Session;
use crate::stats::StatsManager;
use crate::zhttp::tnetstring::{self, Value};
use crate::zhttp::{PacketType, PayloadFormat, ServerTransaction, ZhttpPacket};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("event loop error: {0}")]
    Loop(#[from] EventLoopError),
}

/// Timer kinds a session may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTimer {
    Housekeeping,
    Retry,
    Deadline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RpcKind {
    Inspect,
    Accept,
}

/// One worker's engine configuration, derived from the process config.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub id: usize,
    pub client_id: String,

    pub server_in_specs: Vec<String>,
    pub server_in_stream_specs: Vec<String>,
    pub server_out_specs: Vec<String>,
    pub client_out_specs: Vec<String>,
    pub client_out_stream_specs: Vec<String>,
    pub client_in_specs: Vec<String>,
    pub int_server_in_specs: Vec<String>,
    pub int_server_in_stream_specs: Vec<String>,
    pub int_server_out_specs: Vec<String>,
    pub inspect_spec: Option<String>,
    pub accept_spec: Option<String>,
    pub retry_in_spec: Option<String>,
    pub stats_spec: Option<String>,
    pub command_spec: Option<String>,
    pub ipc_file_mode: Option<u32>,

    pub sessions_max: usize,
    pub inspect_timeout: Duration,
    pub inspect_prefetch: usize,
    pub inspect_timeout_permits: bool,
    pub debug: bool,
    pub auto_cross_origin: bool,
    pub accept_x_forwarded_protocol: bool,
    pub set_xf_proto: bool,
    pub set_xf_protocol: bool,
    pub xff_untrusted_rule: XffRule,
    pub xff_trusted_rule: XffRule,
    pub orig_headers_need_mark: Vec<String>,
    pub accept_pushpin_route: bool,
    pub cdn_loop: Option<String>,
    pub log_from: bool,
    pub log_user_agent: bool,
    pub sig_iss: String,
    pub sig_key: String,
    pub upstream_key: String,
    pub retry: RetryPolicy,

    pub stats_connection_send: bool,
    pub stats_connection_ttl: Duration,
    pub stats_connections_max_ttl: Duration,
    pub stats_report_interval: Duration,

    pub payload_format: PayloadFormat,
}

impl EngineConfig {
    /// Build the base (whole-process) engine config. `sessions_max` here
    /// is the process-wide budget; [`for_worker`](Self::for_worker)
    /// divides it.
    pub fn from_config(config: &Config) -> EngineConfig {
        let proxy = &config.proxy;

        let sessions_total = if proxy.max_open_requests >= 0 {
            (proxy.max_open_requests as usize).min(config.runner.client_maxconn)
        } else {
            config.runner.client_maxconn
        };

        let optional = |s: &str| {
            if s.is_empty() {
                None
            } else {
                Some(s.to_string())
            }
        };

        EngineConfig {
            id: 0,
            client_id: format!("proxy-{}", std::process::id()),
            server_in_specs: proxy.connmgr_in_specs.clone(),
            server_in_stream_specs: proxy.connmgr_in_stream_specs.clone(),
            server_out_specs: proxy.connmgr_out_specs.clone(),
            client_out_specs: proxy.connmgr_client_out_specs.clone(),
            client_out_stream_specs: proxy.connmgr_client_out_stream_specs.clone(),
            client_in_specs: proxy.connmgr_client_in_specs.clone(),
            int_server_in_specs: proxy.intreq_in_specs.clone(),
            int_server_in_stream_specs: proxy.intreq_in_stream_specs.clone(),
            int_server_out_specs: proxy.intreq_out_specs.clone(),
            inspect_spec: optional(&proxy.handler_inspect_spec),
            accept_spec: optional(&proxy.handler_accept_spec),
            retry_in_spec: optional(&proxy.handler_retry_in_spec),
            stats_spec: optional(&proxy.stats_spec),
            command_spec: optional(&proxy.command_spec),
            ipc_file_mode: proxy.ipc_file_mode_bits(),
            sessions_max: sessions_total,
            inspect_timeout: Duration::from_millis(proxy.inspect_timeout),
            inspect_prefetch: proxy.inspect_prefetch,
            inspect_timeout_permits: proxy.inspect_timeout_permits,
            debug: proxy.debug,
            auto_cross_origin: proxy.auto_cross_origin,
            accept_x_forwarded_protocol: proxy.accept_x_forwarded_protocol,
            set_xf_proto: proxy.set_xf_proto(),
            set_xf_protocol: proxy.set_xf_protocol(),
            xff_untrusted_rule: proxy.xff_untrusted_rule(),
            xff_trusted_rule: proxy.xff_trusted_rule(),
            orig_headers_need_mark: proxy.orig_headers_need_mark.clone(),
            accept_pushpin_route: proxy.accept_pushpin_route,
            cdn_loop: optional(&proxy.cdn_loop),
            log_from: proxy.log_from,
            log_user_agent: proxy.log_user_agent,
            sig_iss: proxy.sig_iss.clone(),
            sig_key: proxy.sig_key.clone(),
            upstream_key: proxy.upstream_key.clone(),
            retry: RetryPolicy {
                max_retries: proxy.retry_max,
                base_delay_ms: proxy.retry_base_delay_ms,
                max_delay_ms: proxy.retry_max_delay_ms,
                cooldown: Duration::from_secs(10),
            },
            stats_connection_send: config.global.stats_connection_send,
            stats_connection_ttl: Duration::from_secs(config.global.stats_connection_ttl),
            stats_connections_max_ttl: Duration::from_secs(proxy.stats_connections_max_ttl),
            stats_report_interval: Duration::from_secs(proxy.stats_report_interval),
            payload_format: PayloadFormat::Tnetstring,
        }
    }

    /// Specialize for worker `n` of `workers`: unique client id, ipc
    /// endpoints suffixed `-n`, and a fair share of the session budget.
    pub fn for_worker(&self, n: usize, workers: usize) -> EngineConfig {
        let mut config = self.clone();
        config.id = n;
        config.sessions_max = self.sessions_max / workers.max(1);

        if workers > 1 {
            config.client_id = format!("{}-{}", self.client_id, n);

            let suffix_opt =
                |spec: &Option<String>| spec.as_ref().map(|s| suffix_spec(s, n));

            config.inspect_spec = suffix_opt(&self.inspect_spec);
            config.accept_spec = suffix_opt(&self.accept_spec);
            config.retry_in_spec = suffix_opt(&self.retry_in_spec);
            config.stats_spec = suffix_opt(&self.stats_spec);
            config.command_spec = suffix_opt(&self.command_spec);
            config.int_server_in_specs = suffix_specs(&self.int_server_in_specs, n);
            config.int_server_in_stream_specs =
                suffix_specs(&self.int_server_in_stream_specs, n);
            config.int_server_out_specs = suffix_specs(&self.int_server_out_specs, n);
        }

        config
    }
}

/// The engine's side-effect surface handed to sessions: sockets out,
/// stats, timers, RPC, upstream selection.
pub struct EngineIo {
    pub config: EngineConfig,
    pub handle: LoopHandle,
    pub stats: StatsManager,
    pub domain_map: Arc<DomainMap>,

    server_out: BusSocket,
    client_out: BusSocket,
    client_out_stream: BusSocket,
    int_server_out: Option<BusSocket>,
    stats_sock: Option<BusSocket>,

    inspect: Option<RpcClient>,
    accept: Option<RpcClient>,

    pickers: HashMap<String, TargetPicker>,
    weak: Weak<RefCell<Engine>>,
    next_client_id: u64,
}

impl EngineIo {
    pub fn instance_id(&self) -> &[u8] {
        self.config.client_id.as_bytes()
    }

    pub fn has_inspect(&self) -> bool {
        self.inspect.is_some()
    }

    pub fn alloc_client_id(&mut self) -> Vec<u8> {
        let id = format!("{}-{}", self.config.client_id, self.next_client_id);
        self.next_client_id += 1;
        id.into_bytes()
    }

    /// Send on the response path of the socket set the request arrived
    /// through.
    pub fn send_server(&mut self, via_int: bool, peer: &[u8], packet: &ZhttpPacket) {
        let frame = packet.encode(self.config.payload_format);
        let parts = vec![peer.to_vec(), Vec::new(), frame];

        let sock = if via_int {
            match self.int_server_out.as_mut() {
                Some(sock) => sock,
                None => return,
            }
        } else {
            &mut self.server_out
        };

        if let Err(e) = sock.send(parts) {
            tracing::error!(error = %e, "failed to send to connection manager");
        }
    }

    /// First packet of an upstream transaction (load-balanced).
    pub fn send_upstream_first(&mut self, packet: &ZhttpPacket) {
        let frame = packet.encode(self.config.payload_format);
        if let Err(e) = self.client_out.send(vec![frame]) {
            tracing::error!(error = %e, "failed to send upstream request");
        }
    }

    /// Subsequent upstream packets, addressed to the answering peer.
    pub fn send_upstream(&mut self, peer: &[u8], packet: &ZhttpPacket) {
        let frame = packet.encode(self.config.payload_format);
        if let Err(e) = self
            .client_out_stream
            .send(vec![peer.to_vec(), Vec::new(), frame])
        {
            tracing::error!(error = %e, "failed to send upstream frame");
        }
    }

    /// Publish a per-connection stats packet.
    pub fn publish_stat(&mut self, packet: Value) {
        let Some(sock) = self.stats_sock.as_mut() else {
            return;
        };
        let frame = encode_value(&packet, self.config.payload_format);
        if let Err(e) = sock.send(vec![b"conn".to_vec(), frame]) {
            tracing::error!(error = %e, "failed to publish stats");
        }
    }

    /// Register a session timer. `None` means the registration budget is
    /// spent; callers degrade rather than fail the worker.
    pub fn start_session_timer(
        &self,
        slot: usize,
        seq: u64,
        kind: SessionTimer,
        delay: Duration,
    ) -> Option<TimerId> {
        let weak = self.weak.clone();
        match self.handle.register_timer(delay, move || {
            if let Some(engine) = weak.upgrade() {
                Engine::on_session_timer(&engine, slot, seq, kind);
            }
        }) {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(error = %e, "session timer unavailable");
                None
            }
        }
    }

    pub fn cancel_timer(&self, id: TimerId) {
        let _ = self.handle.cancel_timer(id);
    }

    /// Issue an inspect call for a session. Returns false when inspect
    /// is unavailable or saturated (caller treats as permit-plain).
    pub fn call_inspect(&mut self, slot: usize, args: Value) -> bool {
        self.call_rpc(RpcKind::Inspect, slot, args)
    }

    /// Issue an accept call. Returns false when accept is unavailable
    /// (caller answers 502).
    pub fn call_accept(&mut self, slot: usize, args: Value) -> bool {
        self.call_rpc(RpcKind::Accept, slot, args)
    }

    fn call_rpc(&mut self, kind: RpcKind, slot: usize, args: Value) -> bool {
        let timeout = self.config.inspect_timeout;
        let weak = self.weak.clone();

        let (client, method) = match kind {
            RpcKind::Inspect => (self.inspect.as_mut(), "inspect"),
            RpcKind::Accept => (self.accept.as_mut(), "accept"),
        };
        let Some(client) = client else {
            return false;
        };

        let call_id = match client.call(method, args, slot) {
            Ok(id) => id,
            Err(e) => {
                tracing::debug!(method, error = %e, "rpc call refused");
                return false;
            }
        };

        let timer_call_id = call_id.clone();
        match self.handle.register_timer(timeout, move || {
            if let Some(engine) = weak.upgrade() {
                Engine::on_rpc_timeout(&engine, kind, timer_call_id.clone());
            }
        }) {
            Ok(timer) => client.set_timer(&call_id, timer),
            Err(e) => {
                tracing::warn!(method, error = %e, "rpc deadline timer unavailable");
            }
        }

        true
    }

    /// Drop all outstanding RPC calls for a session, cancelling their
    /// deadline timers.
    pub fn abandon_rpc(&mut self, slot: usize) {
        let mut timers = Vec::new();
        if let Some(client) = self.inspect.as_mut() {
            timers.extend(client.abandon_slot(slot));
        }
        if let Some(client) = self.accept.as_mut() {
            timers.extend(client.abandon_slot(slot));
        }
        for timer in timers {
            let _ = self.handle.cancel_timer(timer);
        }
    }

    /// Pick the next upstream for a route.
    pub fn pick_target<'a>(&mut self, route: &'a Route) -> Option<&'a Target> {
        let picker = self.pickers.entry(route.id()).or_default();
        picker.pick(&route.targets, Instant::now())
    }

    /// Put a target into failure cooldown across all routes that share
    /// its picker.
    pub fn mark_target_failure(&mut self, target: &Target, cooldown: Duration) {
        let now = Instant::now();
        for picker in self.pickers.values_mut() {
            picker.mark_failure(target, now, cooldown);
        }
    }
}

type ServerKey = (Vec<u8>, Vec<u8>);

/// The engine proper. Lives in an `Rc<RefCell>` on the worker thread;
/// socket and timer callbacks hold weak references.
pub struct Engine {
    pub io: EngineIo,
    sessions: Slab<Session>,
    server_index: HashMap<ServerKey, usize>,
    client_index: HashMap<Vec<u8>, usize>,
    next_session_seq: u64,

    server_in: BusSocket,
    server_in_stream: BusSocket,
    client_in: BusSocket,
    int_server_in: Option<BusSocket>,
    int_server_in_stream: Option<BusSocket>,
    retry_in: Option<BusSocket>,
    command: Option<CommandServer>,
}

impl Engine {
    /// Create the engine, connect or bind every socket, and wire
    /// callbacks into the event loop.
    pub fn start(
        config: EngineConfig,
        domain_map: Arc<DomainMap>,
        ctx: &zmq::Context,
        handle: LoopHandle,
    ) -> Result<Rc<RefCell<Engine>>, EngineError> {
        let connect_all =
            |specs: &[String]| specs.iter().map(SpecInfo::connect).collect::<Vec<_>>();
        let bind_all = |specs: &[String]| {
            specs
                .iter()
                .map(|s| SpecInfo::bind(s, config.ipc_file_mode))
                .collect::<Vec<_>>()
        };

        let server_in = BusSocket::new(ctx, zmq::PULL, "server-in")?;
        server_in.apply_specs(&connect_all(&config.server_in_specs))?;

        let server_in_stream = BusSocket::new(ctx, zmq::ROUTER, "server-in-stream")?;
        server_in_stream.set_identity(config.client_id.as_bytes())?;
        server_in_stream.apply_specs(&connect_all(&config.server_in_stream_specs))?;

        let server_out = BusSocket::new(ctx, zmq::PUB, "server-out")?;
        server_out.apply_specs(&connect_all(&config.server_out_specs))?;

        let client_out = BusSocket::new(ctx, zmq::PUSH, "client-out")?;
        client_out.apply_specs(&connect_all(&config.client_out_specs))?;

        let client_out_stream = BusSocket::new(ctx, zmq::ROUTER, "client-out-stream")?;
        client_out_stream.set_identity(config.client_id.as_bytes())?;
        client_out_stream.apply_specs(&connect_all(&config.client_out_stream_specs))?;

        let client_in = BusSocket::new(ctx, zmq::SUB, "client-in")?;
        client_in.subscribe(config.client_id.as_bytes())?;
        client_in.apply_specs(&connect_all(&config.client_in_specs))?;

        let int_server_in = if config.int_server_in_specs.is_empty() {
            None
        } else {
            let sock = BusSocket::new(ctx, zmq::PULL, "int-server-in")?;
            sock.apply_specs(&bind_all(&config.int_server_in_specs))?;
            Some(sock)
        };
        let int_server_in_stream = if config.int_server_in_stream_specs.is_empty() {
            None
        } else {
            let sock = BusSocket::new(ctx, zmq::ROUTER, "int-server-in-stream")?;
            sock.set_identity(config.client_id.as_bytes())?;
            sock.apply_specs(&bind_all(&config.int_server_in_stream_specs))?;
            Some(sock)
        };
        let int_server_out = if config.int_server_out_specs.is_empty() {
            None
        } else {
            let sock = BusSocket::new(ctx, zmq::PUB, "int-server-out")?;
            sock.apply_specs(&bind_all(&config.int_server_out_specs))?;
            Some(sock)
        };

        // replayed requests from the handler look exactly like fresh
        // requests from the connection manager
        let retry_in = match config.retry_in_spec.as_deref() {
            Some(spec) => {
                let sock = BusSocket::new(ctx, zmq::PULL, "retry-in")?;
                sock.apply_specs(&[SpecInfo::connect(spec)])?;
                Some(sock)
            }
            None => None,
        };

        let stats_sock = match config.stats_spec.as_deref() {
            Some(spec) => {
                let sock = BusSocket::new(ctx, zmq::PUB, "stats")?;
                sock.apply_specs(&[SpecInfo::bind(spec, config.ipc_file_mode)])?;
                Some(sock)
            }
            None => None,
        };

        let command = match config.command_spec.as_deref() {
            Some(spec) => Some(CommandServer::new(
                ctx,
                spec,
                config.ipc_file_mode,
                config.payload_format,
            )?),
            None => None,
        };

        let inspect = match config.inspect_spec.as_deref() {
            Some(spec) => Some(RpcClient::new(
                ctx,
                spec,
                config.client_id.as_bytes(),
                config.payload_format,
                "inspect",
            )?),
            None => None,
        };
        let accept = match config.accept_spec.as_deref() {
            Some(spec) => Some(RpcClient::new(
                ctx,
                spec,
                config.client_id.as_bytes(),
                config.payload_format,
                "accept",
            )?),
            None => None,
        };

        let stats = StatsManager::new(
            config.client_id.clone().into_bytes(),
            config.stats_connection_ttl,
            config.stats_connections_max_ttl,
            config.stats_report_interval,
            config.stats_connection_send,
        );

        let engine = Rc::new(RefCell::new(Engine {
            io: EngineIo {
                config,
                handle: handle.clone(),
                stats,
                domain_map,
                server_out,
                client_out,
                client_out_stream,
                int_server_out,
                stats_sock,
                inspect,
                accept,
                pickers: HashMap::new(),
                weak: Weak::new(),
                next_client_id: 0,
            },
            sessions: Slab::new(),
            server_index: HashMap::new(),
            client_index: HashMap::new(),
            next_session_seq: 0,
            server_in,
            server_in_stream,
            client_in,
            int_server_in,
            int_server_in_stream,
            retry_in,
            command,
        }));

        engine.borrow_mut().io.weak = Rc::downgrade(&engine);

        // every input socket wakes the same pump
        {
            let e = engine.borrow();
            let mut fds = vec![
                e.server_in.raw_fd()?,
                e.server_in_stream.raw_fd()?,
                e.client_in.raw_fd()?,
            ];
            if let Some(sock) = &e.int_server_in {
                fds.push(sock.raw_fd()?);
            }
            if let Some(sock) = &e.int_server_in_stream {
                fds.push(sock.raw_fd()?);
            }
            if let Some(sock) = &e.retry_in {
                fds.push(sock.raw_fd()?);
            }
            if let Some(client) = &e.io.inspect {
                fds.push(client.raw_fd()?);
            }
            if let Some(client) = &e.io.accept {
                fds.push(client.raw_fd()?);
            }
            if let Some(command) = &e.command {
                fds.push(command.raw_fd()?);
            }
            drop(e);

            for fd in fds {
                let weak = Rc::downgrade(&engine);
                handle.register_fd(fd, Interest::READABLE, move |_| {
                    if let Some(engine) = weak.upgrade() {
                        engine.borrow_mut().pump();
                    }
                })?;
            }
        }

        Engine::arm_report_timer(&engine)?;

        // the transport may have delivered messages before callbacks
        // were in place
        engine.borrow_mut().pump();

        tracing::debug!(
            client_id = %engine.borrow().io.config.client_id,
            sessions_max = engine.borrow().io.config.sessions_max,
            "engine started"
        );

        Ok(engine)
    }

    /// The routes snapshot changed. Sessions keep their captured routes;
    /// new sessions pick up the new snapshot on lookup.
    pub fn routes_changed(&mut self) {
        tracing::debug!(worker = self.io.config.id, "routes changed");
        self.io.pickers.clear();
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Terminate every session, notifying both sides.
    pub fn shutdown(&mut self) {
        let slots: Vec<usize> = self.sessions.iter().map(|(slot, _)| slot).collect();
        for slot in slots {
            let Engine { io, sessions, .. } = self;
            if let Some(session) = sessions.get_mut(slot) {
                session.terminate(io, "shutting-down");
            }
            self.reap_if_terminal(slot);
        }

        tracing::debug!(worker = self.io.config.id, "engine stopped");
    }

    /// Drain every socket. Called on any readability hint.
    fn pump(&mut self) {
        self.io.server_out.flush();
        self.io.client_out.flush();
        self.io.client_out_stream.flush();
        if let Some(sock) = self.io.int_server_out.as_mut() {
            sock.flush();
        }
        if let Some(sock) = self.io.stats_sock.as_mut() {
            sock.flush();
        }

        loop {
            match self.server_in.recv() {
                Ok(Some(parts)) => self.handle_server_frame(parts, false),
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "server-in recv failed");
                    break;
                }
            }
        }

        loop {
            match self.server_in_stream.recv() {
                Ok(Some(parts)) => self.handle_server_frame(parts, false),
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "server-in-stream recv failed");
                    break;
                }
            }
        }

        loop {
            let result = match self.int_server_in.as_mut() {
                Some(sock) => sock.recv(),
                None => Ok(None),
            };
            match result {
                Ok(Some(parts)) => self.handle_server_frame(parts, true),
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "int-server-in recv failed");
                    break;
                }
            }
        }

        loop {
            let result = match self.int_server_in_stream.as_mut() {
                Some(sock) => sock.recv(),
                None => Ok(None),
            };
            match result {
                Ok(Some(parts)) => self.handle_server_frame(parts, true),
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "int-server-in-stream recv failed");
                    break;
                }
            }
        }

        loop {
            let result = match self.retry_in.as_mut() {
                Some(sock) => sock.recv(),
                None => Ok(None),
            };
            match result {
                Ok(Some(parts)) => self.handle_server_frame(parts, false),
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "retry-in recv failed");
                    break;
                }
            }
        }

        loop {
            match self.client_in.recv() {
                Ok(Some(parts)) => self.handle_client_frame(parts),
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "client-in recv failed");
                    break;
                }
            }
        }

        self.pump_rpc(RpcKind::Inspect);
        self.pump_rpc(RpcKind::Accept);
        self.pump_command();
    }

    fn handle_server_frame(&mut self, parts: Vec<Vec<u8>>, via_int: bool) {
        let Some(frame) = parts.last().filter(|f| !f.is_empty()) else {
            return;
        };

        let packet = match ZhttpPacket::decode(frame) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable frame");
                return;
            }
        };

        let key: ServerKey = (packet.from.clone(), packet.id.clone());
        if let Some(&slot) = self.server_index.get(&key) {
            let Engine { io, sessions, .. } = self;
            if let Some(session) = sessions.get_mut(slot) {
                session.on_server_packet(io, &packet);
            }
            self.post_dispatch(slot);
            return;
        }

        // unknown transaction: only a request-opening data packet may
        // start a session
        if packet.ptype != PacketType::Data || packet.method.is_none() {
            tracing::debug!("dropping frame for unknown transaction");
            return;
        }

        self.accept_new_session(packet, via_int);
    }

    fn accept_new_session(&mut self, packet: ZhttpPacket, via_int: bool) {
        let io = &self.io;

        if self.sessions.len() >= io.config.sessions_max {
            tracing::warn!("session budget exhausted; refusing request");
            self.refuse(&packet, via_int, 503, "Service Unavailable");
            return;
        }

        // a session needs timer headroom; refuse rather than run one
        // that cannot keep itself alive
        if io.handle.registrations_available() < TIMERS_PER_SESSION {
            tracing::warn!("registration budget exhausted; refusing request");
            self.refuse(&packet, via_int, 503, "Service Unavailable");
            return;
        }

        let (server, request) = match ServerTransaction::new(
            &packet,
            io.config.client_id.as_bytes(),
            crate::zhttp::DEFAULT_TIMEOUT,
        ) {
            Ok(pair) => pair,
            Err(e) => {
                tracing::debug!(error = %e, "rejecting malformed request packet");
                return;
            }
        };

        let seq = self.next_session_seq;
        self.next_session_seq += 1;

        let key: ServerKey = (packet.from.clone(), packet.id.clone());
        let entry = self.sessions.vacant_entry();
        let slot = entry.key();
        entry.insert(Session::new(slot, seq, server, request, via_int));
        self.server_index.insert(key, slot);

        tracing::debug!(slot, "session opened");

        let Engine { io, sessions, .. } = self;
        sessions
            .get_mut(slot)
            .expect("just inserted")
            .begin(io);
        self.post_dispatch(slot);
    }

    /// Answer a request we will not create a session for.
    fn refuse(&mut self, packet: &ZhttpPacket, via_int: bool, code: u16, reason: &str) {
        let reply = ZhttpPacket {
            ptype: PacketType::Data,
            id: packet.id.clone(),
            seq: Some(0),
            from: self.io.config.client_id.as_bytes().to_vec(),
            code: Some(code),
            reason: Some(reason.to_string()),
            ..Default::default()
        };
        self.io.send_server(via_int, &packet.from, &reply);
    }

    fn handle_client_frame(&mut self, parts: Vec<Vec<u8>>) {
        let Some(frame) = parts.last().filter(|f| !f.is_empty()) else {
            return;
        };

        let packet = match ZhttpPacket::decode(frame) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable upstream frame");
                return;
            }
        };

        let Some(&slot) = self.client_index.get(&packet.id) else {
            tracing::debug!("dropping upstream frame for unknown transaction");
            return;
        };

        let Engine { io, sessions, .. } = self;
        if let Some(session) = sessions.get_mut(slot) {
            session.on_client_packet(io, &packet);
        }
        self.post_dispatch(slot);
    }

    fn pump_rpc(&mut self, kind: RpcKind) {
        let results = {
            let client = match kind {
                RpcKind::Inspect => self.io.inspect.as_mut(),
                RpcKind::Accept => self.io.accept.as_mut(),
            };
            match client {
                Some(client) => client.receive(),
                None => return,
            }
        };

        for (_, pending, result) in results {
            if let Some(timer) = pending.timer {
                let _ = self.io.handle.cancel_timer(timer);
            }
            self.dispatch_rpc_result(kind, pending.slot, result);
        }
    }

    fn dispatch_rpc_result(
        &mut self,
        kind: RpcKind,
        slot: usize,
        result: Result<Value, RpcError>,
    ) {
        let Engine { io, sessions, .. } = self;
        if let Some(session) = sessions.get_mut(slot) {
            match kind {
                RpcKind::Inspect => session.on_inspect_result(io, result),
                RpcKind::Accept => session.on_accept_result(io, result),
            }
        }
        self.post_dispatch(slot);
    }

    fn pump_command(&mut self) {
        let requests = match self.command.as_mut() {
            Some(command) => command.receive(),
            None => return,
        };

        for request in requests {
            let result = match request.method.as_str() {
                "conncheck" => {
                    let ids: Vec<Vec<u8>> = request
                        .args
                        .get("ids")
                        .and_then(Value::as_list)
                        .map(|list| {
                            list.iter()
                                .filter_map(|v| v.as_bytes().map(<[u8]>::to_vec))
                                .collect()
                        })
                        .unwrap_or_default();
                    let known = self.io.stats.conncheck(&ids);
                    Ok(Value::List(known.into_iter().map(Value::Bytes).collect()))
                }
                "refresh" => {
                    let refreshed = request
                        .args
                        .get("id")
                        .and_then(Value::as_bytes)
                        .map(|id| self.io.stats.refresh(id))
                        .unwrap_or(false);
                    Ok(Value::Bool(refreshed))
                }
                "report" => {
                    self.emit_report();
                    Ok(Value::Bool(true))
                }
                other => {
                    tracing::debug!(method = %other, "unknown command method");
                    Err("method-not-found")
                }
            };

            if let Some(command) = self.command.as_mut() {
                if let Err(e) = command.respond(&request, result) {
                    tracing::error!(error = %e, "failed to send command reply");
                }
            }
        }
    }

    fn post_dispatch(&mut self, slot: usize) {
        let (terminal, closed_client, client_id) = match self.sessions.get_mut(slot) {
            Some(session) => (
                session.is_terminal(),
                session.take_closed_client(),
                session.client_id(),
            ),
            None => return,
        };

        if let Some(old) = closed_client {
            self.client_index.remove(&old);
        }
        if let Some(id) = client_id {
            self.client_index.entry(id).or_insert(slot);
        }

        if terminal {
            self.reap_if_terminal(slot);
        }
    }

    fn reap_if_terminal(&mut self, slot: usize) {
        let terminal = self
            .sessions
            .get(slot)
            .map(Session::is_terminal)
            .unwrap_or(false);
        if !terminal {
            return;
        }

        let Engine { io, sessions, .. } = self;
        let session = sessions.get_mut(slot).expect("checked above");
        session.cleanup(io);

        let key = session.server_key();
        let client_id = session.client_id();
        sessions.remove(slot);

        if let Some(key) = key {
            self.server_index.remove(&key);
        }
        if let Some(id) = client_id {
            self.client_index.remove(&id);
        }

        tracing::debug!(slot, "session closed");
    }

    fn arm_report_timer(engine: &Rc<RefCell<Engine>>) -> Result<(), EventLoopError> {
        let interval = engine.borrow().io.config.stats_report_interval;
        if interval.is_zero() {
            return Ok(());
        }

        let weak = Rc::downgrade(engine);
        let handle = engine.borrow().io.handle.clone();
        handle.register_timer(interval, move || {
            if let Some(engine) = weak.upgrade() {
                {
                    let mut e = engine.borrow_mut();
                    e.emit_report();
                    e.reap_expired_connections();
                }
                let _ = Engine::arm_report_timer(&engine);
            }
        })?;

        Ok(())
    }

    fn emit_report(&mut self) {
        let packet = self.io.stats.report_packet();
        let frame = encode_value(&packet, self.io.config.payload_format);
        if let Some(sock) = self.io.stats_sock.as_mut() {
            if let Err(e) = sock.send(vec![b"report".to_vec(), frame]) {
                tracing::error!(error = %e, "failed to publish report");
            }
        }
    }

    /// Force-end sessions whose connection records exceeded the max TTL.
    fn reap_expired_connections(&mut self) {
        let expired = self.io.stats.reap(Instant::now());
        if expired.is_empty() {
            return;
        }

        let slots: Vec<usize> = self
            .sessions
            .iter()
            .filter(|(_, session)| {
                session
                    .server_key()
                    .map(|(_, id)| expired.contains(&id))
                    .unwrap_or(false)
            })
            .map(|(slot, _)| slot)
            .collect();

        for slot in slots {
            tracing::debug!(slot, "connection ttl exceeded; terminating");
            let Engine { io, sessions, .. } = self;
            if let Some(session) = sessions.get_mut(slot) {
                session.terminate(io, "connection-ttl-exceeded");
            }
            self.reap_if_terminal(slot);
        }
    }

    // timer entry points (called from loop callbacks)

    fn on_session_timer(engine: &Rc<RefCell<Engine>>, slot: usize, seq: u64, kind: SessionTimer) {
        let mut e = engine.borrow_mut();

        let live = e
            .sessions
            .get(slot)
            .map(|s| s.seq() == seq)
            .unwrap_or(false);
        if !live {
            return;
        }

        let Engine { io, sessions, .. } = &mut *e;
        if let Some(session) = sessions.get_mut(slot) {
            session.on_timer(io, kind);
        }
        e.post_dispatch(slot);
    }

    fn on_rpc_timeout(engine: &Rc<RefCell<Engine>>, kind: RpcKind, call_id: Vec<u8>) {
        let mut e = engine.borrow_mut();

        let pending = {
            let client = match kind {
                RpcKind::Inspect => e.io.inspect.as_mut(),
                RpcKind::Accept => e.io.accept.as_mut(),
            };
            client.and_then(|c| c.take(&call_id))
        };

        if let Some(pending) = pending {
            e.dispatch_rpc_result(kind, pending.slot, Err(RpcError::Timeout));
        }
    }
}

fn encode_value(value: &Value, format: PayloadFormat) -> Vec<u8> {
    match format {
        PayloadFormat::Tnetstring => {
            let mut out = vec![b'T'];
            tnetstring::encode(value, &mut out);
            out
        }
        PayloadFormat::Json => {
            let mut out = vec![b'J'];
            out.extend_from_slice(
                crate::zhttp::packet::value_to_json(value).to_string().as_bytes(),
            );
            out
        }
    }
}
