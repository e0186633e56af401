//! ZHTTP packet model and payload codecs.
//!
//! A packet is one bus frame: a format byte (`T` tnetstring, `J` JSON)
//! followed by an encoded map. Field names are fixed by the wire
//! protocol; absent fields take protocol defaults.

use crate::zhttp::tnetstring::{self, Value};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PacketError {
    #[error("empty payload")]
    Empty,

    #[error("unknown format byte '{0}'")]
    UnknownFormat(char),

    #[error("payload is not a map")]
    NotAMap,

    #[error("bad tnetstring: {0}")]
    Tnet(#[from] tnetstring::TnetError),

    #[error("bad json payload")]
    Json,

    #[error("missing id")]
    MissingId,

    #[error("unknown packet type '{0}'")]
    UnknownType(String),
}

/// Wire encoding for packets we originate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadFormat {
    #[default]
    Tnetstring,
    Json,
}

/// Packet kinds. `Data` carries request/response content; the rest are
/// control frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Data,
    Error,
    Credit,
    KeepAlive,
    Cancel,
    Close,
    Ping,
    Pong,
    HandoffStart,
    HandoffProceed,
}

impl PacketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketType::Data => "data",
            PacketType::Error => "error",
            PacketType::Credit => "credit",
            PacketType::KeepAlive => "keep-alive",
            PacketType::Cancel => "cancel",
            PacketType::Close => "close",
            PacketType::Ping => "ping",
            PacketType::Pong => "pong",
            PacketType::HandoffStart => "handoff-start",
            PacketType::HandoffProceed => "handoff-proceed",
        }
    }

    pub fn from_str(s: &str) -> Option<PacketType> {
        Some(match s {
            "data" => PacketType::Data,
            "error" => PacketType::Error,
            "credit" => PacketType::Credit,
            "keep-alive" => PacketType::KeepAlive,
            "cancel" => PacketType::Cancel,
            "close" => PacketType::Close,
            "ping" => PacketType::Ping,
            "pong" => PacketType::Pong,
            "handoff-start" => PacketType::HandoffStart,
            "handoff-proceed" => PacketType::HandoffProceed,
            _ => return None,
        })
    }
}

/// One HTTP header pair as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: Vec<u8>,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl AsRef<[u8]>) -> Header {
        Header {
            name: name.into(),
            value: value.as_ref().to_vec(),
        }
    }

    /// Case-insensitive name comparison, per HTTP.
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Find a header value by case-insensitive name.
pub fn get_header<'a>(headers: &'a [Header], name: &str) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|h| h.is(name))
        .map(|h| h.value.as_slice())
}

/// A decoded ZHTTP packet.
#[derive(Debug, Clone, PartialEq)]
pub struct ZhttpPacket {
    pub ptype: PacketType,
    pub id: Vec<u8>,
    pub seq: Option<u32>,
    pub from: Vec<u8>,

    pub method: Option<String>,
    pub uri: Option<String>,
    pub code: Option<u16>,
    pub reason: Option<String>,
    pub headers: Vec<Header>,
    pub body: Vec<u8>,

    pub credits: u32,
    pub more: bool,
    pub stream: bool,
    pub condition: Option<String>,
    pub peer_address: Option<String>,
}

impl Default for ZhttpPacket {
    fn default() -> Self {
        Self {
            ptype: PacketType::Data,
            id: Vec::new(),
            seq: None,
            from: Vec::new(),
            method: None,
            uri: None,
            code: None,
            reason: None,
            headers: Vec::new(),
            body: Vec::new(),
            credits: 0,
            more: false,
            stream: false,
            condition: None,
            peer_address: None,
        }
    }
}

impl ZhttpPacket {
    /// Encode to a bus frame with the given format byte.
    pub fn encode(&self, format: PayloadFormat) -> Vec<u8> {
        let map = self.to_value();

        match format {
            PayloadFormat::Tnetstring => {
                let mut out = vec![b'T'];
                tnetstring::encode(&map, &mut out);
                out
            }
            PayloadFormat::Json => {
                let mut out = vec![b'J'];
                let json = value_to_json(&map);
                out.extend_from_slice(json.to_string().as_bytes());
                out
            }
        }
    }

    /// Decode from a bus frame.
    pub fn decode(frame: &[u8]) -> Result<ZhttpPacket, PacketError> {
        let (&format, payload) = frame.split_first().ok_or(PacketError::Empty)?;

        let map = match format {
            b'T' => tnetstring::decode(payload)?.0,
            b'J' => {
                let json: serde_json::Value =
                    serde_json::from_slice(payload).map_err(|_| PacketError::Json)?;
                json_to_value(&json).ok_or(PacketError::Json)?
            }
            other => return Err(PacketError::UnknownFormat(other as char)),
        };

        Self::from_value(&map)
    }

    fn to_value(&self) -> Value {
        let mut entries: Vec<(Vec<u8>, Value)> = Vec::new();

        entries.push((b"id".to_vec(), Value::Bytes(self.id.clone())));
        entries.push((
            b"type".to_vec(),
            Value::bytes(self.ptype.as_str()),
        ));
        if let Some(seq) = self.seq {
            entries.push((b"seq".to_vec(), Value::Int(seq as i64)));
        }
        if !self.from.is_empty() {
            entries.push((b"from".to_vec(), Value::Bytes(self.from.clone())));
        }
        if let Some(method) = &self.method {
            entries.push((b"method".to_vec(), Value::bytes(method)));
        }
        if let Some(uri) = &self.uri {
            entries.push((b"uri".to_vec(), Value::bytes(uri)));
        }
        if let Some(code) = self.code {
            entries.push((b"code".to_vec(), Value::Int(code as i64)));
        }
        if let Some(reason) = &self.reason {
            entries.push((b"reason".to_vec(), Value::bytes(reason)));
        }
        if !self.headers.is_empty() {
            let headers = self
                .headers
                .iter()
                .map(|h| {
                    Value::List(vec![
                        Value::bytes(&h.name),
                        Value::Bytes(h.value.clone()),
                    ])
                })
                .collect();
            entries.push((b"headers".to_vec(), Value::List(headers)));
        }
        if !self.body.is_empty() {
            entries.push((b"body".to_vec(), Value::Bytes(self.body.clone())));
        }
        if self.credits > 0 {
            entries.push((b"credits".to_vec(), Value::Int(self.credits as i64)));
        }
        if self.more {
            entries.push((b"more".to_vec(), Value::Bool(true)));
        }
        if self.stream {
            entries.push((b"stream".to_vec(), Value::Bool(true)));
        }
        if let Some(condition) = &self.condition {
            entries.push((b"condition".to_vec(), Value::bytes(condition)));
        }
        if let Some(peer_address) = &self.peer_address {
            entries.push((b"peer-address".to_vec(), Value::bytes(peer_address)));
        }

        Value::Map(entries)
    }

    fn from_value(map: &Value) -> Result<ZhttpPacket, PacketError> {
        if map.as_map().is_none() {
            return Err(PacketError::NotAMap);
        }

        let id = map
            .get("id")
            .and_then(Value::as_bytes)
            .ok_or(PacketError::MissingId)?
            .to_vec();

        let ptype = match map.get("type").and_then(Value::as_str) {
            // absent type means data, per the wire protocol
            None => PacketType::Data,
            Some(s) => {
                PacketType::from_str(s).ok_or_else(|| PacketError::UnknownType(s.to_string()))?
            }
        };

        let mut headers = Vec::new();
        if let Some(list) = map.get("headers").and_then(Value::as_list) {
            for pair in list {
                let pair = pair.as_list().unwrap_or(&[]);
                if pair.len() != 2 {
                    continue;
                }
                if let (Some(name), Some(value)) = (pair[0].as_str(), pair[1].as_bytes()) {
                    headers.push(Header::new(name, value));
                }
            }
        }

        Ok(ZhttpPacket {
            ptype,
            id,
            seq: map.get("seq").and_then(Value::as_int).map(|i| i as u32),
            from: map
                .get("from")
                .and_then(Value::as_bytes)
                .unwrap_or_default()
                .to_vec(),
            method: map.get("method").and_then(Value::as_str).map(String::from),
            uri: map.get("uri").and_then(Value::as_str).map(String::from),
            code: map.get("code").and_then(Value::as_int).map(|i| i as u16),
            reason: map.get("reason").and_then(Value::as_str).map(String::from),
            headers,
            body: map
                .get("body")
                .and_then(Value::as_bytes)
                .unwrap_or_default()
                .to_vec(),
            credits: map
                .get("credits")
                .and_then(Value::as_int)
                .unwrap_or(0)
                .max(0) as u32,
            more: map.get("more").and_then(Value::as_bool).unwrap_or(false),
            stream: map.get("stream").and_then(Value::as_bool).unwrap_or(false),
            condition: map
                .get("condition")
                .and_then(Value::as_str)
                .map(String::from),
            peer_address: map
                .get("peer-address")
                .and_then(Value::as_str)
                .map(String::from),
        })
    }
}

/// Convert a bus value to JSON. Bytes become UTF-8 text; the tnetstring
/// format is the one to use for binary-safe payloads.
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Bytes(b) => serde_json::Value::String(String::from_utf8_lossy(b).into_owned()),
        Value::List(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
        Value::Map(entries) => {
            let mut map = serde_json::Map::new();
            for (k, v) in entries {
                map.insert(String::from_utf8_lossy(k).into_owned(), value_to_json(v));
            }
            serde_json::Value::Object(map)
        }
    }
}

/// Convert JSON to a bus value. Floats are rejected; the protocol has no
/// use for them.
pub fn json_to_value(json: &serde_json::Value) -> Option<Value> {
    Some(match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => Value::Int(n.as_i64()?),
        serde_json::Value::String(s) => Value::bytes(s),
        serde_json::Value::Array(items) => Value::List(
            items
                .iter()
                .map(json_to_value)
                .collect::<Option<Vec<_>>>()?,
        ),
        serde_json::Value::Object(map) => Value::Map(
            map.iter()
                .map(|(k, v)| Some((k.as_bytes().to_vec(), json_to_value(v)?)))
                .collect::<Option<Vec<_>>>()?,
        ),
    })
}
