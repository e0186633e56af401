//! Test harness: plays the connection manager, origin-side connection
//! manager, and handler against a real proxy worker over ipc endpoints.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use pushpin_proxy::engine::EngineConfig;
use pushpin_proxy::routing::DomainMap;
use pushpin_proxy::worker::Supervisor;
use pushpin_proxy::zhttp::tnetstring::{self, Value};
use pushpin_proxy::zhttp::{Header, PacketType, PayloadFormat, ZhttpPacket};

pub const CONNMGR_ID: &[u8] = b"test-connmgr";
pub const UPSTREAM_ID: &[u8] = b"test-upstream";
pub const PROXY_ID: &str = "test-proxy";

pub const RECV_DEADLINE: Duration = Duration::from_secs(5);

/// Sockets for every role the proxy talks to.
pub struct TestBus {
    pub ctx: zmq::Context,
    dir: TempDir,

    // connection-manager side (client-facing)
    to_proxy: zmq::Socket,
    from_proxy: zmq::Socket,
    in_stream: zmq::Socket,

    // origin-facing connection manager
    upstream_requests: zmq::Socket,
    upstream_stream: zmq::Socket,
    upstream_out: zmq::Socket,

    // handler RPC
    pub inspect: Option<zmq::Socket>,
    pub accept: Option<zmq::Socket>,
}

impl TestBus {
    pub fn new(with_handler: bool) -> TestBus {
        let ctx = zmq::Context::new();
        let dir = TempDir::new().unwrap();
        let base = dir.path().display().to_string();

        let to_proxy = ctx.socket(zmq::PUSH).unwrap();
        to_proxy.bind(&format!("ipc://{}/server-in", base)).unwrap();

        let from_proxy = ctx.socket(zmq::SUB).unwrap();
        from_proxy.set_subscribe(CONNMGR_ID).unwrap();
        from_proxy
            .bind(&format!("ipc://{}/server-out", base))
            .unwrap();

        // the proxy's ROUTER stream socket also connects here; nothing
        // client-facing flows on it in these tests
        let in_stream = ctx.socket(zmq::ROUTER).unwrap();
        in_stream.set_identity(CONNMGR_ID).unwrap();
        in_stream
            .bind(&format!("ipc://{}/server-in-stream", base))
            .unwrap();

        let upstream_requests = ctx.socket(zmq::PULL).unwrap();
        upstream_requests
            .bind(&format!("ipc://{}/client-out", base))
            .unwrap();

        let upstream_stream = ctx.socket(zmq::ROUTER).unwrap();
        upstream_stream.set_identity(UPSTREAM_ID).unwrap();
        upstream_stream
            .bind(&format!("ipc://{}/client-out-stream", base))
            .unwrap();

        let upstream_out = ctx.socket(zmq::PUB).unwrap();
        upstream_out
            .bind(&format!("ipc://{}/client-in", base))
            .unwrap();

        let (inspect, accept) = if with_handler {
            let inspect = ctx.socket(zmq::ROUTER).unwrap();
            inspect.bind(&format!("ipc://{}/inspect", base)).unwrap();
            let accept = ctx.socket(zmq::ROUTER).unwrap();
            accept.bind(&format!("ipc://{}/accept", base)).unwrap();
            (Some(inspect), Some(accept))
        } else {
            (None, None)
        };

        TestBus {
            ctx,
            dir,
            to_proxy,
            from_proxy,
            in_stream,
            upstream_requests,
            upstream_stream,
            upstream_out,
            inspect,
            accept,
        }
    }

    /// An engine config pointing at this bus.
    pub fn engine_config(&self) -> EngineConfig {
        let base = self.dir.path().display().to_string();
        let with_handler = self.inspect.is_some();

        EngineConfig {
            id: 0,
            client_id: PROXY_ID.to_string(),
            server_in_specs: vec![format!("ipc://{}/server-in", base)],
            server_in_stream_specs: vec![format!("ipc://{}/server-in-stream", base)],
            server_out_specs: vec![format!("ipc://{}/server-out", base)],
            client_out_specs: vec![format!("ipc://{}/client-out", base)],
            client_out_stream_specs: vec![format!("ipc://{}/client-out-stream", base)],
            client_in_specs: vec![format!("ipc://{}/client-in", base)],
            int_server_in_specs: Vec::new(),
            int_server_in_stream_specs: Vec::new(),
            int_server_out_specs: Vec::new(),
            inspect_spec: with_handler.then(|| format!("ipc://{}/inspect", base)),
            accept_spec: with_handler.then(|| format!("ipc://{}/accept", base)),
            retry_in_spec: None,
            stats_spec: Some(format!("ipc://{}/stats", base)),
            command_spec: Some(format!("ipc://{}/command", base)),
            ipc_file_mode: None,
            sessions_max: 64,
            inspect_timeout: Duration::from_millis(2_000),
            inspect_prefetch: 10_000,
            inspect_timeout_permits: true,
            debug: false,
            auto_cross_origin: false,
            accept_x_forwarded_protocol: false,
            set_xf_proto: false,
            set_xf_protocol: false,
            xff_untrusted_rule: Default::default(),
            xff_trusted_rule: Default::default(),
            orig_headers_need_mark: Vec::new(),
            accept_pushpin_route: false,
            cdn_loop: None,
            log_from: false,
            log_user_agent: false,
            sig_iss: "pushpin".to_string(),
            sig_key: String::new(),
            upstream_key: String::new(),
            retry: Default::default(),
            stats_connection_send: false,
            stats_connection_ttl: Duration::from_secs(120),
            stats_connections_max_ttl: Duration::from_secs(60),
            stats_report_interval: Duration::from_secs(1),
            payload_format: PayloadFormat::Tnetstring,
        }
    }

    pub fn stats_spec(&self) -> String {
        format!("ipc://{}/stats", self.dir.path().display())
    }

    pub fn command_spec(&self) -> String {
        format!("ipc://{}/command", self.dir.path().display())
    }

    /// Send a complete GET-style request into the proxy.
    pub fn send_request(&self, id: &[u8], method: &str, uri: &str, headers: Vec<Header>) {
        self.send_request_packet(ZhttpPacket {
            ptype: PacketType::Data,
            id: id.to_vec(),
            seq: Some(0),
            from: CONNMGR_ID.to_vec(),
            method: Some(method.to_string()),
            uri: Some(uri.to_string()),
            headers,
            credits: 100_000,
            stream: true,
            ..Default::default()
        });
    }

    pub fn send_request_packet(&self, packet: ZhttpPacket) {
        let frame = packet.encode(PayloadFormat::Tnetstring);
        self.to_proxy.send(frame, 0).unwrap();
    }

    /// Next packet from the proxy to the connection manager.
    pub fn recv_from_proxy(&self) -> ZhttpPacket {
        recv_packet(&self.from_proxy).expect("no packet from proxy before deadline")
    }

    /// Next data (response) packet, skipping credit/keep-alive control
    /// frames.
    pub fn recv_response(&self) -> ZhttpPacket {
        let deadline = Instant::now() + RECV_DEADLINE;
        loop {
            assert!(Instant::now() < deadline, "no response before deadline");
            if let Some(packet) = try_recv_packet(&self.from_proxy) {
                if packet.ptype == PacketType::Data {
                    return packet;
                }
                continue;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Whether any data packet arrives before the (short) deadline.
    pub fn expect_no_response(&self, wait: Duration) {
        let deadline = Instant::now() + wait;
        while Instant::now() < deadline {
            if let Some(packet) = try_recv_packet(&self.from_proxy) {
                assert_ne!(
                    packet.ptype,
                    PacketType::Data,
                    "unexpected data packet: {:?}",
                    packet
                );
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Next request the proxy dispatched upstream.
    pub fn upstream_recv(&self) -> ZhttpPacket {
        recv_packet(&self.upstream_requests).expect("no upstream request before deadline")
    }

    /// Assert the proxy contacted no upstream within the window.
    pub fn upstream_expect_silence(&self, wait: Duration) {
        let deadline = Instant::now() + wait;
        while Instant::now() < deadline {
            assert!(
                try_recv_packet(&self.upstream_requests).is_none(),
                "upstream was contacted"
            );
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Reply to an upstream request.
    pub fn upstream_reply(
        &self,
        request: &ZhttpPacket,
        code: u16,
        headers: Vec<Header>,
        body: &[u8],
        more: bool,
    ) {
        self.upstream_send(ZhttpPacket {
            ptype: PacketType::Data,
            id: request.id.clone(),
            seq: Some(0),
            from: UPSTREAM_ID.to_vec(),
            code: Some(code),
            reason: Some("OK".to_string()),
            headers,
            body: body.to_vec(),
            more,
            ..Default::default()
        });
    }

    /// Publish an upstream-side packet to the proxy.
    pub fn upstream_send(&self, packet: ZhttpPacket) {
        let frame = packet.encode(PayloadFormat::Tnetstring);
        self.upstream_out
            .send_multipart([PROXY_ID.as_bytes(), b"".as_slice(), frame.as_slice()], 0)
            .unwrap();
    }

    /// Fail an upstream request with a transport-level error condition.
    pub fn upstream_fail(&self, request: &ZhttpPacket, condition: &str) {
        self.upstream_send(ZhttpPacket {
            ptype: PacketType::Error,
            id: request.id.clone(),
            seq: Some(0),
            from: UPSTREAM_ID.to_vec(),
            condition: Some(condition.to_string()),
            ..Default::default()
        });
    }

    /// Serve one RPC request on the given handler socket.
    pub fn rpc_serve_one(sock: &zmq::Socket, value: Value) -> Value {
        let deadline = Instant::now() + RECV_DEADLINE;
        let parts = loop {
            assert!(Instant::now() < deadline, "no rpc request before deadline");
            match sock.recv_multipart(zmq::DONTWAIT) {
                Ok(parts) => break parts,
                Err(zmq::Error::EAGAIN) => std::thread::sleep(Duration::from_millis(5)),
                Err(e) => panic!("rpc recv failed: {}", e),
            }
        };

        let frame = parts.last().unwrap();
        let request = decode_frame(frame);
        let call_id = request.get("id").unwrap().as_bytes().unwrap().to_vec();

        let reply = Value::Map(vec![
            (b"id".to_vec(), Value::Bytes(call_id)),
            (b"success".to_vec(), Value::Bool(true)),
            (b"value".to_vec(), value),
        ]);
        let mut frame = vec![b'T'];
        tnetstring::encode(&reply, &mut frame);

        sock.send_multipart([parts[0].as_slice(), b"".as_slice(), frame.as_slice()], 0)
            .unwrap();

        request.get("args").cloned().unwrap_or(Value::Map(Vec::new()))
    }
}

/// Start a single proxy worker against the bus with the given routes.
pub fn start_proxy(
    bus: &TestBus,
    config: EngineConfig,
    routes: &[&str],
) -> (Supervisor, Arc<DomainMap>) {
    let lines: Vec<String> = routes.iter().map(|s| s.to_string()).collect();
    let domain_map = Arc::new(DomainMap::from_lines(&lines));

    let supervisor = Supervisor::start(&config, 1, Arc::clone(&domain_map)).unwrap();
    domain_map.on_changed(supervisor.change_broadcaster());

    // let subscriptions propagate before traffic flows
    std::thread::sleep(Duration::from_millis(300));

    (supervisor, domain_map)
}

pub fn recv_packet(sock: &zmq::Socket) -> Option<ZhttpPacket> {
    let deadline = Instant::now() + RECV_DEADLINE;
    while Instant::now() < deadline {
        if let Some(packet) = try_recv_packet(sock) {
            return Some(packet);
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    None
}

pub fn try_recv_packet(sock: &zmq::Socket) -> Option<ZhttpPacket> {
    match sock.recv_multipart(zmq::DONTWAIT) {
        Ok(parts) => {
            let frame = parts.iter().rev().find(|p| !p.is_empty())?;
            Some(ZhttpPacket::decode(frame).expect("undecodable packet"))
        }
        Err(zmq::Error::EAGAIN) => None,
        Err(e) => panic!("recv failed: {}", e),
    }
}

pub fn decode_frame(frame: &[u8]) -> Value {
    assert_eq!(frame[0], b'T');
    tnetstring::decode(&frame[1..]).unwrap().0
}

pub fn header_value<'a>(headers: &'a [Header], name: &str) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_slice())
}
