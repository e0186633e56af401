//! ZHTTP transaction state machines.
//!
//! A transaction is one logical HTTP exchange over the bus. The server
//! side faces the connection manager (we receive a request, we send the
//! response); the client side faces an upstream (we send the request, we
//! receive the response). Both enforce the credit contract: bytes sent
//! never exceed credits granted, and grants only ever increase.
//!
//! These types are pure state machines: they consume decoded packets and
//! produce packets to send. The engine owns sockets, timers, and
//! addressing.
//!
//! ```text
//! Idle → Starting → Connected → Streaming → Finishing → Finished
//!                                        ↘ Errored
//! ```

use std::time::{Duration, Instant};

use crate::zhttp::packet::{Header, PacketType, ZhttpPacket};

/// Transaction keep-alive interval when the peer does not negotiate one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Starting,
    Connected,
    Streaming,
    Finishing,
    Finished,
    Errored,
}

/// Terminal transaction errors.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum TransactionError {
    #[error("transport error")]
    Transport,

    #[error("peer error: {0}")]
    Peer(String),

    #[error("keep-alive timeout")]
    Timeout,

    #[error("policy rejected")]
    PolicyRejected,

    #[error("body too large")]
    BodyTooLarge,

    #[error("credit exhausted")]
    CreditExhausted,
}

/// Request content surfaced when a server transaction starts.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RequestData {
    pub method: String,
    pub uri: String,
    pub headers: Vec<Header>,
    pub body: Vec<u8>,
    pub more: bool,
    pub peer_address: Option<String>,
}

/// Response content surfaced when a client transaction connects.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResponseData {
    pub code: u16,
    pub reason: String,
    pub headers: Vec<Header>,
    pub body: Vec<u8>,
    pub more: bool,
}

/// Events produced by feeding peer packets to a server transaction.
#[derive(Debug, PartialEq)]
pub enum ServerEvent {
    /// More request body arrived.
    Body { body: Vec<u8>, more: bool },
    /// The peer granted response credits.
    Credits(u32),
    /// Peer liveness only.
    KeepAlive,
    /// The peer pinged; reply with the packet.
    Ping(ZhttpPacket),
    /// The peer asked to pause for ownership transfer; reply with the
    /// packet.
    HandoffStart(ZhttpPacket),
    /// The peer cancelled the transaction.
    Cancelled,
}

/// Events produced by feeding peer packets to a client transaction.
#[derive(Debug, PartialEq)]
pub enum ClientEvent {
    /// Response header (and possibly first body bytes) arrived.
    ResponseStart(ResponseData),
    /// More response body arrived.
    Body { body: Vec<u8>, more: bool },
    /// The peer granted request-body credits.
    Credits(u32),
    KeepAlive,
    Ping(ZhttpPacket),
    HandoffStart(ZhttpPacket),
}

/// Frozen transaction state passed to the handler on handoff.
#[derive(Debug, Clone)]
pub struct HandoffState {
    pub id: Vec<u8>,
    pub peer: Vec<u8>,
    pub out_seq: u32,
    pub in_seq: Option<u32>,
    pub send_credits: u32,
}

fn expect_seq(expected: &mut Option<u32>, packet: &ZhttpPacket) -> Result<(), TransactionError> {
    let Some(seq) = packet.seq else {
        return Ok(());
    };

    match *expected {
        Some(want) if seq != want => Err(TransactionError::Transport),
        _ => {
            *expected = Some(seq.wrapping_add(1));
            Ok(())
        }
    }
}

/// Server-side transaction: request in, response out.
pub struct ServerTransaction {
    id: Vec<u8>,
    peer: Vec<u8>,
    instance_id: Vec<u8>,
    state: TransactionState,
    out_seq: u32,
    in_seq: Option<u32>,
    send_credits: u32,
    bytes_sent: u64,
    request_finished: bool,
    response_started: bool,
    timeout: Duration,
    last_peer_activity: Instant,
}

impl ServerTransaction {
    /// Start from the first request packet. The packet must be `data`
    /// carrying at least a method and uri.
    pub fn new(
        packet: &ZhttpPacket,
        instance_id: &[u8],
        timeout: Duration,
    ) -> Result<(ServerTransaction, RequestData), TransactionError> {
        if packet.ptype != PacketType::Data || packet.method.is_none() || packet.uri.is_none() {
            return Err(TransactionError::Transport);
        }

        let mut in_seq = None;
        expect_seq(&mut in_seq, packet)?;

        let transaction = ServerTransaction {
            id: packet.id.clone(),
            peer: packet.from.clone(),
            instance_id: instance_id.to_vec(),
            state: TransactionState::Starting,
            out_seq: 0,
            in_seq,
            send_credits: packet.credits,
            bytes_sent: 0,
            request_finished: !packet.more,
            response_started: false,
            timeout,
            last_peer_activity: Instant::now(),
        };

        let request = RequestData {
            method: packet.method.clone().unwrap_or_default(),
            uri: packet.uri.clone().unwrap_or_default(),
            headers: packet.headers.clone(),
            body: packet.body.clone(),
            more: packet.more,
            peer_address: packet.peer_address.clone(),
        };

        Ok((transaction, request))
    }

    pub fn id(&self) -> &[u8] {
        &self.id
    }

    /// The connection-manager instance that owns the client connection.
    pub fn peer(&self) -> &[u8] {
        &self.peer
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Bytes of response body the peer will currently accept.
    pub fn send_window(&self) -> usize {
        self.send_credits as usize
    }

    pub fn request_finished(&self) -> bool {
        self.request_finished
    }

    /// Feed a peer packet.
    pub fn handle_packet(
        &mut self,
        packet: &ZhttpPacket,
    ) -> Result<ServerEvent, TransactionError> {
        expect_seq(&mut self.in_seq, packet)?;
        self.last_peer_activity = Instant::now();

        // any packet may carry additional credits
        if packet.credits > 0 && packet.ptype != PacketType::Credit {
            self.send_credits = self.send_credits.saturating_add(packet.credits);
        }

        match packet.ptype {
            PacketType::Data => {
                if !packet.more {
                    self.request_finished = true;
                }
                Ok(ServerEvent::Body {
                    body: packet.body.clone(),
                    more: packet.more,
                })
            }
            PacketType::Credit => {
                self.send_credits = self.send_credits.saturating_add(packet.credits);
                Ok(ServerEvent::Credits(packet.credits))
            }
            PacketType::KeepAlive => Ok(ServerEvent::KeepAlive),
            PacketType::Ping => Ok(ServerEvent::Ping(self.control_packet(PacketType::Pong))),
            PacketType::HandoffStart => Ok(ServerEvent::HandoffStart(
                self.control_packet(PacketType::HandoffProceed),
            )),
            PacketType::Cancel | PacketType::Close => {
                self.state = TransactionState::Errored;
                Ok(ServerEvent::Cancelled)
            }
            PacketType::Error => {
                self.state = TransactionState::Errored;
                Err(TransactionError::Peer(
                    packet.condition.clone().unwrap_or_default(),
                ))
            }
            PacketType::Pong | PacketType::HandoffProceed => Ok(ServerEvent::KeepAlive),
        }
    }

    /// Grant the peer request-body credits. The first grant moves the
    /// transaction into its streaming phase.
    pub fn grant_credits(&mut self, credits: u32) -> ZhttpPacket {
        if self.state == TransactionState::Starting {
            self.state = TransactionState::Streaming;
        }

        let mut packet = self.control_packet(PacketType::Credit);
        packet.credits = credits;
        packet
    }

    /// Send the response header, with optional first body bytes.
    pub fn respond(
        &mut self,
        code: u16,
        reason: &str,
        headers: Vec<Header>,
        body: &[u8],
        more: bool,
    ) -> Result<ZhttpPacket, TransactionError> {
        if body.len() > self.send_credits as usize {
            return Err(TransactionError::CreditExhausted);
        }

        self.send_credits -= body.len() as u32;
        self.bytes_sent += body.len() as u64;
        self.response_started = true;
        self.state = if more {
            TransactionState::Streaming
        } else {
            self.finish_state()
        };

        let mut packet = self.control_packet(PacketType::Data);
        packet.code = Some(code);
        packet.reason = Some(reason.to_string());
        packet.headers = headers;
        packet.body = body.to_vec();
        packet.more = more;
        Ok(packet)
    }

    /// Send a response body chunk. Credits must cover it.
    pub fn send_body(&mut self, body: &[u8], more: bool) -> Result<ZhttpPacket, TransactionError> {
        if !self.response_started {
            return Err(TransactionError::Transport);
        }
        if body.len() > self.send_credits as usize {
            return Err(TransactionError::CreditExhausted);
        }

        self.send_credits -= body.len() as u32;
        self.bytes_sent += body.len() as u64;
        if !more {
            self.state = self.finish_state();
        }

        let mut packet = self.control_packet(PacketType::Data);
        packet.body = body.to_vec();
        packet.more = more;
        Ok(packet)
    }

    pub fn keep_alive(&mut self) -> ZhttpPacket {
        self.control_packet(PacketType::KeepAlive)
    }

    /// Terminate with an error condition.
    pub fn error(&mut self, condition: &str) -> ZhttpPacket {
        self.state = TransactionState::Errored;
        let mut packet = self.control_packet(PacketType::Error);
        packet.condition = Some(condition.to_string());
        packet
    }

    /// Terminate silently (peer going away).
    pub fn cancel(&mut self) -> ZhttpPacket {
        self.state = TransactionState::Errored;
        self.control_packet(PacketType::Cancel)
    }

    /// Whether the peer has been silent past the timeout.
    pub fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_peer_activity) > self.timeout
    }

    /// Interval at which keep-alives should be emitted.
    pub fn keep_alive_interval(&self) -> Duration {
        self.timeout / 2
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Freeze for handoff. No terminal packet is sent; ownership of the
    /// wire transaction passes to the handler.
    pub fn detach(self) -> HandoffState {
        HandoffState {
            id: self.id,
            peer: self.peer,
            out_seq: self.out_seq,
            in_seq: self.in_seq,
            send_credits: self.send_credits,
        }
    }

    fn finish_state(&self) -> TransactionState {
        if self.request_finished {
            TransactionState::Finished
        } else {
            TransactionState::Finishing
        }
    }

    fn control_packet(&mut self, ptype: PacketType) -> ZhttpPacket {
        let seq = self.out_seq;
        self.out_seq += 1;

        ZhttpPacket {
            ptype,
            id: self.id.clone(),
            seq: Some(seq),
            from: self.instance_id.clone(),
            ..Default::default()
        }
    }
}

/// Client-side transaction: request out, response in.
pub struct ClientTransaction {
    id: Vec<u8>,
    peer: Vec<u8>,
    instance_id: Vec<u8>,
    state: TransactionState,
    out_seq: u32,
    in_seq: Option<u32>,
    send_credits: u32,
    bytes_received: u64,
    response_started: bool,
    response_finished: bool,
    timeout: Duration,
    last_peer_activity: Instant,
}

impl ClientTransaction {
    /// Open a transaction and produce the initial request packet.
    /// `response_credits` is the grant we extend for response body.
    pub fn new(
        id: Vec<u8>,
        instance_id: &[u8],
        request: &RequestData,
        response_credits: u32,
        timeout: Duration,
    ) -> (ClientTransaction, ZhttpPacket) {
        let mut transaction = ClientTransaction {
            id: id.clone(),
            peer: Vec::new(),
            instance_id: instance_id.to_vec(),
            state: TransactionState::Starting,
            out_seq: 0,
            in_seq: None,
            send_credits: 0,
            bytes_received: 0,
            response_started: false,
            response_finished: false,
            timeout,
            last_peer_activity: Instant::now(),
        };

        let mut packet = transaction.control_packet(PacketType::Data);
        packet.method = Some(request.method.clone());
        packet.uri = Some(request.uri.clone());
        packet.headers = request.headers.clone();
        packet.body = request.body.clone();
        packet.more = request.more;
        packet.stream = true;
        packet.credits = response_credits;

        (transaction, packet)
    }

    pub fn id(&self) -> &[u8] {
        &self.id
    }

    /// The peer instance that answered, once known. Subsequent packets
    /// are addressed to it.
    pub fn peer(&self) -> &[u8] {
        &self.peer
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn send_window(&self) -> usize {
        self.send_credits as usize
    }

    pub fn response_finished(&self) -> bool {
        self.response_finished
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Feed a peer packet.
    pub fn handle_packet(
        &mut self,
        packet: &ZhttpPacket,
    ) -> Result<ClientEvent, TransactionError> {
        expect_seq(&mut self.in_seq, packet)?;
        self.last_peer_activity = Instant::now();

        if self.peer.is_empty() && !packet.from.is_empty() {
            self.peer = packet.from.clone();
        }

        if packet.credits > 0 && packet.ptype != PacketType::Credit {
            self.send_credits = self.send_credits.saturating_add(packet.credits);
        }

        match packet.ptype {
            PacketType::Data => {
                self.bytes_received += packet.body.len() as u64;
                if !packet.more {
                    self.response_finished = true;
                    self.state = TransactionState::Finished;
                }

                if !self.response_started {
                    let Some(code) = packet.code else {
                        self.state = TransactionState::Errored;
                        return Err(TransactionError::Transport);
                    };
                    self.response_started = true;
                    if self.state != TransactionState::Finished {
                        self.state = TransactionState::Streaming;
                    }

                    return Ok(ClientEvent::ResponseStart(ResponseData {
                        code,
                        reason: packet.reason.clone().unwrap_or_default(),
                        headers: packet.headers.clone(),
                        body: packet.body.clone(),
                        more: packet.more,
                    }));
                }

                Ok(ClientEvent::Body {
                    body: packet.body.clone(),
                    more: packet.more,
                })
            }
            PacketType::Credit => {
                if self.state == TransactionState::Starting {
                    self.state = TransactionState::Connected;
                }
                self.send_credits = self.send_credits.saturating_add(packet.credits);
                Ok(ClientEvent::Credits(packet.credits))
            }
            PacketType::KeepAlive => Ok(ClientEvent::KeepAlive),
            PacketType::Ping => Ok(ClientEvent::Ping(self.control_packet(PacketType::Pong))),
            PacketType::HandoffStart => Ok(ClientEvent::HandoffStart(
                self.control_packet(PacketType::HandoffProceed),
            )),
            PacketType::Cancel | PacketType::Close => {
                self.state = TransactionState::Errored;
                Err(TransactionError::Peer("cancelled".to_string()))
            }
            PacketType::Error => {
                self.state = TransactionState::Errored;
                Err(TransactionError::Peer(
                    packet.condition.clone().unwrap_or_default(),
                ))
            }
            PacketType::Pong | PacketType::HandoffProceed => Ok(ClientEvent::KeepAlive),
        }
    }

    /// Send a request body chunk. Credits must cover it.
    pub fn send_body(&mut self, body: &[u8], more: bool) -> Result<ZhttpPacket, TransactionError> {
        if body.len() > self.send_credits as usize {
            return Err(TransactionError::CreditExhausted);
        }
        self.send_credits -= body.len() as u32;

        let mut packet = self.control_packet(PacketType::Data);
        packet.body = body.to_vec();
        packet.more = more;
        Ok(packet)
    }

    /// Grant the peer response-body credits.
    pub fn grant_credits(&mut self, credits: u32) -> ZhttpPacket {
        let mut packet = self.control_packet(PacketType::Credit);
        packet.credits = credits;
        packet
    }

    pub fn keep_alive(&mut self) -> ZhttpPacket {
        self.control_packet(PacketType::KeepAlive)
    }

    pub fn cancel(&mut self) -> ZhttpPacket {
        self.state = TransactionState::Errored;
        self.control_packet(PacketType::Cancel)
    }

    pub fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_peer_activity) > self.timeout
    }

    pub fn keep_alive_interval(&self) -> Duration {
        self.timeout / 2
    }

    /// Freeze for handoff; see [`ServerTransaction::detach`].
    pub fn detach(self) -> HandoffState {
        HandoffState {
            id: self.id,
            peer: self.peer,
            out_seq: self.out_seq,
            in_seq: self.in_seq,
            send_credits: self.send_credits,
        }
    }

    fn control_packet(&mut self, ptype: PacketType) -> ZhttpPacket {
        let seq = self.out_seq;
        self.out_seq += 1;

        ZhttpPacket {
            ptype,
            id: self.id.clone(),
            seq: Some(seq),
            from: self.instance_id.clone(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_packet(credits: u32, more: bool) -> ZhttpPacket {
        ZhttpPacket {
            ptype: PacketType::Data,
            id: b"req-1".to_vec(),
            seq: Some(0),
            from: b"connmgr-1".to_vec(),
            method: Some("GET".to_string()),
            uri: Some("http://example.com/foo".to_string()),
            headers: vec![Header::new("Host", "example.com")],
            credits,
            more,
            stream: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_server_lifecycle_simple() {
        let (mut st, request) =
            ServerTransaction::new(&request_packet(1024, false), b"proxy-1", DEFAULT_TIMEOUT)
                .unwrap();

        assert_eq!(request.method, "GET");
        assert!(st.request_finished());
        assert_eq!(st.state(), TransactionState::Starting);

        let credit = st.grant_credits(65_536);
        assert_eq!(credit.ptype, PacketType::Credit);
        assert_eq!(credit.credits, 65_536);
        assert_eq!(st.state(), TransactionState::Streaming);

        let response = st
            .respond(200, "OK", vec![Header::new("Content-Length", "5")], b"hello", false)
            .unwrap();
        assert_eq!(response.code, Some(200));
        assert_eq!(response.body, b"hello");
        assert!(!response.more);
        assert_eq!(st.state(), TransactionState::Finished);
        assert_eq!(st.bytes_sent(), 5);
    }

    #[test]
    fn test_server_credit_enforcement() {
        let (mut st, _) =
            ServerTransaction::new(&request_packet(3, false), b"proxy-1", DEFAULT_TIMEOUT).unwrap();

        // 3 credits cannot carry a 5-byte body
        let err = st.respond(200, "OK", Vec::new(), b"hello", true).unwrap_err();
        assert_eq!(err, TransactionError::CreditExhausted);

        // a credit packet raises the window
        let mut credit = ZhttpPacket {
            ptype: PacketType::Credit,
            id: b"req-1".to_vec(),
            seq: Some(1),
            credits: 100,
            ..Default::default()
        };
        assert_eq!(
            st.handle_packet(&credit).unwrap(),
            ServerEvent::Credits(100)
        );

        assert!(st.respond(200, "OK", Vec::new(), b"hello", true).is_ok());
        assert_eq!(st.send_window(), 3 + 100 - 5);

        // grants are monotonic: the window only moves up between sends
        credit.seq = Some(2);
        st.handle_packet(&credit).unwrap();
        assert_eq!(st.send_window(), 3 + 200 - 5);
    }

    #[test]
    fn test_server_seq_gap_is_transport_error() {
        let (mut st, _) =
            ServerTransaction::new(&request_packet(0, true), b"proxy-1", DEFAULT_TIMEOUT).unwrap();

        let packet = ZhttpPacket {
            ptype: PacketType::Data,
            id: b"req-1".to_vec(),
            seq: Some(5),
            body: b"x".to_vec(),
            more: true,
            ..Default::default()
        };
        assert_eq!(
            st.handle_packet(&packet).unwrap_err(),
            TransactionError::Transport
        );
    }

    #[test]
    fn test_server_cancel() {
        let (mut st, _) =
            ServerTransaction::new(&request_packet(0, false), b"proxy-1", DEFAULT_TIMEOUT).unwrap();

        let cancel = ZhttpPacket {
            ptype: PacketType::Cancel,
            id: b"req-1".to_vec(),
            seq: Some(1),
            ..Default::default()
        };
        assert_eq!(st.handle_packet(&cancel).unwrap(), ServerEvent::Cancelled);
        assert_eq!(st.state(), TransactionState::Errored);
    }

    #[test]
    fn test_server_detach_preserves_state() {
        let (mut st, _) =
            ServerTransaction::new(&request_packet(500, false), b"proxy-1", DEFAULT_TIMEOUT)
                .unwrap();
        st.grant_credits(10);
        let _ = st.respond(200, "OK", Vec::new(), b"wait", true).unwrap();

        let frozen = st.detach();
        assert_eq!(frozen.id, b"req-1");
        assert_eq!(frozen.peer, b"connmgr-1");
        assert_eq!(frozen.out_seq, 2);
        assert_eq!(frozen.send_credits, 500 - 4);
    }

    #[test]
    fn test_client_lifecycle() {
        let request = RequestData {
            method: "GET".to_string(),
            uri: "http://backend:8080/foo".to_string(),
            headers: vec![Header::new("Host", "example.com")],
            ..Default::default()
        };

        let (mut ct, first) =
            ClientTransaction::new(b"c-1".to_vec(), b"proxy-1", &request, 100_000, DEFAULT_TIMEOUT);
        assert_eq!(first.ptype, PacketType::Data);
        assert_eq!(first.method.as_deref(), Some("GET"));
        assert_eq!(first.credits, 100_000);
        assert_eq!(ct.state(), TransactionState::Starting);

        let reply = ZhttpPacket {
            ptype: PacketType::Data,
            id: b"c-1".to_vec(),
            seq: Some(0),
            from: b"connmgr-h1".to_vec(),
            code: Some(200),
            reason: Some("OK".to_string()),
            headers: vec![Header::new("Content-Type", "text/plain")],
            body: b"hel".to_vec(),
            more: true,
            ..Default::default()
        };

        match ct.handle_packet(&reply).unwrap() {
            ClientEvent::ResponseStart(response) => {
                assert_eq!(response.code, 200);
                assert_eq!(response.body, b"hel");
                assert!(response.more);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(ct.peer(), b"connmgr-h1");
        assert_eq!(ct.state(), TransactionState::Streaming);

        let tail = ZhttpPacket {
            ptype: PacketType::Data,
            id: b"c-1".to_vec(),
            seq: Some(1),
            body: b"lo".to_vec(),
            ..Default::default()
        };
        assert_eq!(
            ct.handle_packet(&tail).unwrap(),
            ClientEvent::Body {
                body: b"lo".to_vec(),
                more: false
            }
        );
        assert!(ct.response_finished());
        assert_eq!(ct.bytes_received(), 5);
        assert_eq!(ct.state(), TransactionState::Finished);
    }

    #[test]
    fn test_client_error_condition() {
        let request = RequestData {
            method: "GET".to_string(),
            uri: "http://backend:8080/".to_string(),
            ..Default::default()
        };
        let (mut ct, _) =
            ClientTransaction::new(b"c-2".to_vec(), b"proxy-1", &request, 1000, DEFAULT_TIMEOUT);

        let error = ZhttpPacket {
            ptype: PacketType::Error,
            id: b"c-2".to_vec(),
            seq: Some(0),
            condition: Some("remote-connection-failed".to_string()),
            ..Default::default()
        };
        assert_eq!(
            ct.handle_packet(&error).unwrap_err(),
            TransactionError::Peer("remote-connection-failed".to_string())
        );
        assert_eq!(ct.state(), TransactionState::Errored);
    }

    #[test]
    fn test_client_request_body_credits() {
        let request = RequestData {
            method: "POST".to_string(),
            uri: "http://backend:8080/upload".to_string(),
            body: Vec::new(),
            more: true,
            ..Default::default()
        };
        let (mut ct, _) =
            ClientTransaction::new(b"c-3".to_vec(), b"proxy-1", &request, 1000, DEFAULT_TIMEOUT);

        assert_eq!(
            ct.send_body(b"data", true).unwrap_err(),
            TransactionError::CreditExhausted
        );

        let credit = ZhttpPacket {
            ptype: PacketType::Credit,
            id: b"c-3".to_vec(),
            seq: Some(0),
            from: b"connmgr-h1".to_vec(),
            credits: 10,
            ..Default::default()
        };
        ct.handle_packet(&credit).unwrap();
        assert_eq!(ct.state(), TransactionState::Connected);

        let packet = ct.send_body(b"data", true).unwrap();
        assert_eq!(packet.body, b"data");
        assert_eq!(ct.send_window(), 6);
    }

    #[test]
    fn test_expiry() {
        let (st, _) = ServerTransaction::new(
            &request_packet(0, false),
            b"proxy-1",
            Duration::from_millis(10),
        )
        .unwrap();

        assert!(!st.expired(Instant::now()));
        assert!(st.expired(Instant::now() + Duration::from_millis(11)));
        assert_eq!(st.keep_alive_interval(), Duration::from_millis(5));
    }

    #[test]
    fn test_ping_pong() {
        let (mut st, _) =
            ServerTransaction::new(&request_packet(0, false), b"proxy-1", DEFAULT_TIMEOUT).unwrap();

        let ping = ZhttpPacket {
            ptype: PacketType::Ping,
            id: b"req-1".to_vec(),
            seq: Some(1),
            ..Default::default()
        };
        match st.handle_packet(&ping).unwrap() {
            ServerEvent::Ping(pong) => assert_eq!(pong.ptype, PacketType::Pong),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
