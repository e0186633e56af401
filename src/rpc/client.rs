//! Request/reply RPC client.

use std::collections::HashMap;
use std::os::fd::RawFd;

use crate::bus::{BusError, BusSocket, SpecInfo};
use crate::event_loop::TimerId;
use crate::zhttp::packet::{value_to_json, json_to_value};
use crate::zhttp::tnetstring::{self, Value};
use crate::zhttp::PayloadFormat;

/// Outstanding calls beyond this are refused; the caller applies its
/// degradation policy.
const OUTSTANDING_MAX: usize = 512;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum RpcError {
    #[error("call timed out")]
    Timeout,

    #[error("transport error")]
    Transport,

    #[error("remote error: {condition}")]
    Remote { condition: String },

    #[error("malformed reply")]
    MalformedReply,

    #[error("too many outstanding calls")]
    TooManyOutstanding,
}

/// Bookkeeping for one in-flight call.
#[derive(Debug)]
pub struct PendingCall {
    /// The session slot awaiting this reply.
    pub slot: usize,

    /// Deadline timer, owned by the engine.
    pub timer: Option<TimerId>,
}

/// A DEALER-based RPC client with a bounded outstanding set.
pub struct RpcClient {
    sock: BusSocket,
    format: PayloadFormat,
    outstanding: HashMap<Vec<u8>, PendingCall>,
    next_id: u64,
    id_prefix: Vec<u8>,
}

impl RpcClient {
    pub fn new(
        ctx: &zmq::Context,
        spec: &str,
        instance_id: &[u8],
        format: PayloadFormat,
        name: &'static str,
    ) -> Result<RpcClient, BusError> {
        let sock = BusSocket::new(ctx, zmq::DEALER, name)?;
        sock.set_identity(instance_id)?;
        sock.apply_specs(&[SpecInfo::connect(spec)])?;

        Ok(RpcClient {
            sock,
            format,
            outstanding: HashMap::new(),
            next_id: 0,
            id_prefix: instance_id.to_vec(),
        })
    }

    pub fn raw_fd(&self) -> Result<RawFd, BusError> {
        self.sock.raw_fd()
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    /// Issue a call. Returns the call id; the engine attaches a deadline
    /// timer to it with [`set_timer`](Self::set_timer).
    pub fn call(&mut self, method: &str, args: Value, slot: usize) -> Result<Vec<u8>, RpcError> {
        if self.outstanding.len() >= OUTSTANDING_MAX {
            return Err(RpcError::TooManyOutstanding);
        }

        let mut id = self.id_prefix.clone();
        id.extend_from_slice(format!("-{}", self.next_id).as_bytes());
        self.next_id += 1;

        let packet = Value::Map(vec![
            (b"id".to_vec(), Value::Bytes(id.clone())),
            (b"method".to_vec(), Value::bytes(method)),
            (b"args".to_vec(), args),
        ]);

        self.sock
            .send(vec![Vec::new(), encode_frame(&packet, self.format)])
            .map_err(|_| RpcError::Transport)?;

        self.outstanding
            .insert(id.clone(), PendingCall { slot, timer: None });

        Ok(id)
    }

    /// Attach the deadline timer to an outstanding call.
    pub fn set_timer(&mut self, call_id: &[u8], timer: TimerId) {
        if let Some(pending) = self.outstanding.get_mut(call_id) {
            pending.timer = Some(timer);
        }
    }

    /// Remove a call (deadline fired or session cancelled).
    pub fn take(&mut self, call_id: &[u8]) -> Option<PendingCall> {
        self.outstanding.remove(call_id)
    }

    /// Abandon all calls belonging to a session slot. Returns their
    /// timers for the engine to cancel. A reply arriving later finds no
    /// entry and is discarded.
    pub fn abandon_slot(&mut self, slot: usize) -> Vec<TimerId> {
        let ids: Vec<Vec<u8>> = self
            .outstanding
            .iter()
            .filter(|(_, p)| p.slot == slot)
            .map(|(id, _)| id.clone())
            .collect();

        ids.iter()
            .filter_map(|id| self.outstanding.remove(id).and_then(|p| p.timer))
            .collect()
    }

    /// Drain replies from the socket. Unknown ids (abandoned or timed
    /// out calls) are dropped silently.
    pub fn receive(&mut self) -> Vec<(Vec<u8>, PendingCall, Result<Value, RpcError>)> {
        let mut results = Vec::new();

        loop {
            let parts = match self.sock.recv() {
                Ok(Some(parts)) => parts,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "rpc recv failed");
                    break;
                }
            };

            let Some(frame) = parts.last().filter(|f| !f.is_empty()) else {
                continue;
            };

            let (id, result) = match parse_reply(frame) {
                Some(parsed) => parsed,
                None => {
                    tracing::warn!("discarding malformed rpc reply");
                    continue;
                }
            };

            match self.outstanding.remove(&id) {
                Some(pending) => results.push((id, pending, result)),
                None => {
                    tracing::debug!("discarding reply for unknown call id");
                }
            }
        }

        results
    }
}

fn encode_frame(value: &Value, format: PayloadFormat) -> Vec<u8> {
    match format {
        PayloadFormat::Tnetstring => {
            let mut out = vec![b'T'];
            tnetstring::encode(value, &mut out);
            out
        }
        PayloadFormat::Json => {
            let mut out = vec![b'J'];
            out.extend_from_slice(value_to_json(value).to_string().as_bytes());
            out
        }
    }
}

fn decode_frame(frame: &[u8]) -> Option<Value> {
    let (&format, payload) = frame.split_first()?;
    match format {
        b'T' => tnetstring::decode(payload).ok().map(|(v, _)| v),
        b'J' => {
            let json: serde_json::Value = serde_json::from_slice(payload).ok()?;
            json_to_value(&json)
        }
        _ => None,
    }
}

fn parse_reply(frame: &[u8]) -> Option<(Vec<u8>, Result<Value, RpcError>)> {
    let map = decode_frame(frame)?;
    let id = map.get("id")?.as_bytes()?.to_vec();

    let result = match map.get("success").and_then(Value::as_bool) {
        Some(true) => Ok(map.get("value").cloned().unwrap_or(Value::Null)),
        Some(false) => Err(RpcError::Remote {
            condition: map
                .get("condition")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
        }),
        None => Err(RpcError::MalformedReply),
    };

    Some((id, result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_success_reply() {
        let reply = Value::Map(vec![
            (b"id".to_vec(), Value::bytes("proxy-1-0")),
            (b"success".to_vec(), Value::Bool(true)),
            (
                b"value".to_vec(),
                Value::Map(vec![(b"accept".to_vec(), Value::Bool(true))]),
            ),
        ]);
        let frame = encode_frame(&reply, PayloadFormat::Tnetstring);

        let (id, result) = parse_reply(&frame).unwrap();
        assert_eq!(id, b"proxy-1-0");
        let value = result.unwrap();
        assert_eq!(value.get("accept").and_then(Value::as_bool), Some(true));
    }

    #[test]
    fn test_parse_error_reply() {
        let reply = Value::Map(vec![
            (b"id".to_vec(), Value::bytes("proxy-1-1")),
            (b"success".to_vec(), Value::Bool(false)),
            (b"condition".to_vec(), Value::bytes("method-not-found")),
        ]);
        let frame = encode_frame(&reply, PayloadFormat::Json);

        let (_, result) = parse_reply(&frame).unwrap();
        assert_eq!(
            result.unwrap_err(),
            RpcError::Remote {
                condition: "method-not-found".to_string()
            }
        );
    }

    #[test]
    fn test_parse_reply_without_success_flag() {
        let reply = Value::Map(vec![(b"id".to_vec(), Value::bytes("x"))]);
        let frame = encode_frame(&reply, PayloadFormat::Tnetstring);

        let (_, result) = parse_reply(&frame).unwrap();
        assert_eq!(result.unwrap_err(), RpcError::MalformedReply);
    }

    #[test]
    fn test_roundtrip_over_bus() {
        let ctx = zmq::Context::new();
        let dir = tempfile::tempdir().unwrap();
        let spec = format!("ipc://{}/rpc-test", dir.path().display());

        // handler side
        let mut server = BusSocket::new(&ctx, zmq::ROUTER, "handler").unwrap();
        server.apply_specs(&[SpecInfo::bind(&spec, None)]).unwrap();

        let mut client =
            RpcClient::new(&ctx, &spec, b"proxy-1", PayloadFormat::Tnetstring, "inspect").unwrap();

        let args = Value::Map(vec![(b"method".to_vec(), Value::bytes("GET"))]);
        let call_id = client.call("inspect", args, 7).unwrap();
        assert_eq!(client.outstanding_len(), 1);

        // wait for the request on the handler side
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        let parts = loop {
            if let Some(parts) = server.recv().unwrap() {
                break parts;
            }
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(std::time::Duration::from_millis(5));
        };

        // ROUTER sees [peer][empty][frame]
        assert_eq!(parts.len(), 3);
        let request = decode_frame(&parts[2]).unwrap();
        assert_eq!(request.get("method").and_then(Value::as_str), Some("inspect"));
        assert_eq!(request.get("id").and_then(Value::as_bytes), Some(call_id.as_slice()));

        // reply
        let reply = Value::Map(vec![
            (b"id".to_vec(), Value::Bytes(call_id.clone())),
            (b"success".to_vec(), Value::Bool(true)),
            (b"value".to_vec(), Value::Map(Vec::new())),
        ]);
        server
            .send(vec![
                parts[0].clone(),
                Vec::new(),
                encode_frame(&reply, PayloadFormat::Tnetstring),
            ])
            .unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        let results = loop {
            let results = client.receive();
            if !results.is_empty() {
                break results;
            }
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(std::time::Duration::from_millis(5));
        };

        assert_eq!(results.len(), 1);
        let (id, pending, result) = &results[0];
        assert_eq!(id, &call_id);
        assert_eq!(pending.slot, 7);
        assert!(result.is_ok());
        assert_eq!(client.outstanding_len(), 0);
    }

    #[test]
    fn test_abandon_slot() {
        let ctx = zmq::Context::new();
        let dir = tempfile::tempdir().unwrap();
        let spec = format!("ipc://{}/rpc-abandon", dir.path().display());

        let server = BusSocket::new(&ctx, zmq::ROUTER, "handler").unwrap();
        server.apply_specs(&[SpecInfo::bind(&spec, None)]).unwrap();

        let mut client =
            RpcClient::new(&ctx, &spec, b"proxy-1", PayloadFormat::Tnetstring, "accept").unwrap();

        client.call("accept", Value::Map(Vec::new()), 3).unwrap();
        client.call("accept", Value::Map(Vec::new()), 4).unwrap();

        client.abandon_slot(3);
        assert_eq!(client.outstanding_len(), 1);
    }
}
