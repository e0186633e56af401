//! Command server: the RPC surface other components call on us.
//!
//! Serves `conncheck`, `refresh`, and `report` on the command endpoint.
//! The engine interprets methods; this type owns framing only.

use std::os::fd::RawFd;

use crate::bus::{BusError, BusSocket, SpecInfo};
use crate::zhttp::packet::{json_to_value, value_to_json};
use crate::zhttp::tnetstring::{self, Value};
use crate::zhttp::PayloadFormat;

/// A decoded inbound command.
#[derive(Debug)]
pub struct CommandRequest {
    pub peer: Vec<u8>,
    pub call_id: Vec<u8>,
    pub method: String,
    pub args: Value,
}

/// ROUTER-based request server.
pub struct CommandServer {
    sock: BusSocket,
    format: PayloadFormat,
}

impl CommandServer {
    pub fn new(
        ctx: &zmq::Context,
        spec: &str,
        ipc_file_mode: Option<u32>,
        format: PayloadFormat,
    ) -> Result<CommandServer, BusError> {
        let sock = BusSocket::new(ctx, zmq::ROUTER, "command")?;
        sock.apply_specs(&[SpecInfo::bind(spec, ipc_file_mode)])?;

        Ok(CommandServer { sock, format })
    }

    pub fn raw_fd(&self) -> Result<RawFd, BusError> {
        self.sock.raw_fd()
    }

    /// Drain pending requests. Malformed envelopes are dropped with a
    /// warning.
    pub fn receive(&mut self) -> Vec<CommandRequest> {
        let mut requests = Vec::new();

        loop {
            let parts = match self.sock.recv() {
                Ok(Some(parts)) => parts,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "command recv failed");
                    break;
                }
            };

            if parts.len() < 3 {
                tracing::warn!("discarding short command envelope");
                continue;
            }

            let peer = parts[0].clone();
            let Some(map) = decode_frame(&parts[2]) else {
                tracing::warn!("discarding malformed command payload");
                continue;
            };

            let (Some(call_id), Some(method)) = (
                map.get("id").and_then(Value::as_bytes).map(<[u8]>::to_vec),
                map.get("method").and_then(Value::as_str).map(String::from),
            ) else {
                tracing::warn!("discarding command without id/method");
                continue;
            };

            requests.push(CommandRequest {
                peer,
                call_id,
                method,
                args: map.get("args").cloned().unwrap_or(Value::Map(Vec::new())),
            });
        }

        requests
    }

    /// Send a reply for a received request.
    pub fn respond(
        &mut self,
        request: &CommandRequest,
        result: Result<Value, &str>,
    ) -> Result<(), BusError> {
        let mut entries = vec![(
            b"id".to_vec(),
            Value::Bytes(request.call_id.clone()),
        )];

        match result {
            Ok(value) => {
                entries.push((b"success".to_vec(), Value::Bool(true)));
                entries.push((b"value".to_vec(), value));
            }
            Err(condition) => {
                entries.push((b"success".to_vec(), Value::Bool(false)));
                entries.push((b"condition".to_vec(), Value::bytes(condition)));
            }
        }

        let frame = encode_frame(&Value::Map(entries), self.format);
        self.sock
            .send(vec![request.peer.clone(), Vec::new(), frame])
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_roundtrip() {
        let ctx = zmq::Context::new();
        let dir = tempfile::tempdir().unwrap();
        let spec = format!("ipc://{}/command-test", dir.path().display());

        let mut server =
            CommandServer::new(&ctx, &spec, None, PayloadFormat::Tnetstring).unwrap();

        // caller side
        let mut caller = BusSocket::new(&ctx, zmq::DEALER, "caller").unwrap();
        caller.set_identity(b"handler-1").unwrap();
        caller.apply_specs(&[SpecInfo::connect(&spec)]).unwrap();

        let request = Value::Map(vec![
            (b"id".to_vec(), Value::bytes("call-1")),
            (b"method".to_vec(), Value::bytes("conncheck")),
            (
                b"args".to_vec(),
                Value::Map(vec![(
                    b"ids".to_vec(),
                    Value::List(vec![Value::bytes("c1")]),
                )]),
            ),
        ]);
        caller
            .send(vec![
                Vec::new(),
                encode_frame(&request, PayloadFormat::Tnetstring),
            ])
            .unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        let requests = loop {
            let requests = server.receive();
            if !requests.is_empty() {
                break requests;
            }
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(std::time::Duration::from_millis(5));
        };

        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, "conncheck");
        assert_eq!(requests[0].call_id, b"call-1");

        server
            .respond(&requests[0], Ok(Value::List(vec![Value::bytes("c1")])))
            .unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        let parts = loop {
            if let Some(parts) = caller.recv().unwrap() {
                break parts;
            }
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(std::time::Duration::from_millis(5));
        };

        // DEALER sees [empty][frame]
        let reply = decode_frame(parts.last().unwrap()).unwrap();
        assert_eq!(reply.get("success").and_then(Value::as_bool), Some(true));
    }

    #[test]
    fn test_error_reply() {
        let ctx = zmq::Context::new();
        let dir = tempfile::tempdir().unwrap();
        let spec = format!("ipc://{}/command-err", dir.path().display());

        let mut server =
            CommandServer::new(&ctx, &spec, None, PayloadFormat::Tnetstring).unwrap();

        let request = CommandRequest {
            peer: b"peer".to_vec(),
            call_id: b"c".to_vec(),
            method: "bogus".to_string(),
            args: Value::Map(Vec::new()),
        };
        // respond queues even with no connected peer; it must not error
        server.respond(&request, Err("method-not-found")).unwrap();
    }
}
