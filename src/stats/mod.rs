//! Stats and connection accounting.
//!
//! # Responsibilities
//! - Track one record per active client connection (route, first-seen,
//!   last-activity, bytes, ops)
//! - Emit a `report` packet on the stats socket every report interval
//! - Reap records idle past their TTL; force-end past the max TTL
//! - Answer `conncheck` with the intersection of known ids
//!
//! # Design Decisions
//! - Per-worker: each worker reports its own deltas; aggregation is the
//!   consumer's job
//! - Counters reset at every report (delta semantics)
//! - The metrics facade mirrors the headline counters so Prometheus
//!   exposition needs no extra bookkeeping

use std::collections::HashMap;
use std::time::{Duration, Instant};

use metrics::counter;

use crate::observability::metrics::prefixed;

use crate::zhttp::tnetstring::Value;

/// Accounting for one active client connection.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub route_id: String,
    pub first_seen: Instant,
    pub last_activity: Instant,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub ops: u64,
}

#[derive(Debug, Default)]
struct Deltas {
    requests_received: u64,
    connections_opened: u64,
    connections_closed: u64,
    bytes_in: u64,
    bytes_out: u64,
    ops: u64,
}

/// Per-worker stats state.
pub struct StatsManager {
    instance_id: Vec<u8>,
    connection_ttl: Duration,
    connections_max_ttl: Duration,
    report_interval: Duration,
    connection_send: bool,
    records: HashMap<Vec<u8>, ConnectionRecord>,
    deltas: Deltas,
}

impl StatsManager {
    pub fn new(
        instance_id: Vec<u8>,
        connection_ttl: Duration,
        connections_max_ttl: Duration,
        report_interval: Duration,
        connection_send: bool,
    ) -> StatsManager {
        StatsManager {
            instance_id,
            connection_ttl,
            connections_max_ttl,
            report_interval,
            connection_send,
            records: HashMap::new(),
            deltas: Deltas::default(),
        }
    }

    pub fn report_interval(&self) -> Duration {
        self.report_interval
    }

    pub fn active_connections(&self) -> usize {
        self.records.len()
    }

    /// A session began. Returns the `conn` packet to publish when
    /// per-connection sending is on.
    pub fn on_session_begin(&mut self, id: &[u8], route_id: &str) -> Option<Value> {
        let now = Instant::now();
        self.records.insert(
            id.to_vec(),
            ConnectionRecord {
                route_id: route_id.to_string(),
                first_seen: now,
                last_activity: now,
                bytes_in: 0,
                bytes_out: 0,
                ops: 0,
            },
        );

        self.deltas.connections_opened += 1;
        self.deltas.requests_received += 1;
        counter!(prefixed("requests_total"), "route" => route_id.to_string()).increment(1);

        if !self.connection_send {
            return None;
        }

        Some(Value::Map(vec![
            (b"from".to_vec(), Value::Bytes(self.instance_id.clone())),
            (b"id".to_vec(), Value::Bytes(id.to_vec())),
            (b"route".to_vec(), Value::bytes(route_id)),
            (b"state".to_vec(), Value::bytes("open")),
            (
                b"ttl".to_vec(),
                Value::Int(self.connection_ttl.as_secs() as i64),
            ),
        ]))
    }

    /// Byte counters moved for a connection.
    pub fn on_activity(&mut self, id: &[u8], bytes_in: u64, bytes_out: u64) {
        if let Some(record) = self.records.get_mut(id) {
            record.last_activity = Instant::now();
            record.bytes_in += bytes_in;
            record.bytes_out += bytes_out;
            record.ops += 1;
        }

        self.deltas.bytes_in += bytes_in;
        self.deltas.bytes_out += bytes_out;
        self.deltas.ops += 1;
    }

    /// A session ended. Returns the closing `conn` packet when
    /// per-connection sending is on.
    pub fn on_session_end(&mut self, id: &[u8]) -> Option<Value> {
        let record = self.records.remove(id)?;
        self.deltas.connections_closed += 1;
        counter!(prefixed("requests_finished_total"), "route" => record.route_id.clone()).increment(1);

        if !self.connection_send {
            return None;
        }

        Some(Value::Map(vec![
            (b"from".to_vec(), Value::Bytes(self.instance_id.clone())),
            (b"id".to_vec(), Value::Bytes(id.to_vec())),
            (b"route".to_vec(), Value::bytes(&record.route_id)),
            (b"state".to_vec(), Value::bytes("closed")),
        ]))
    }

    /// Refresh a connection's TTL (the `refresh` command).
    pub fn refresh(&mut self, id: &[u8]) -> bool {
        match self.records.get_mut(id) {
            Some(record) => {
                record.last_activity = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Drop records idle past the max TTL. Returns the force-ended ids so
    /// the engine can terminate their sessions.
    pub fn reap(&mut self, now: Instant) -> Vec<Vec<u8>> {
        let max_ttl = self.connections_max_ttl;
        let expired: Vec<Vec<u8>> = self
            .records
            .iter()
            .filter(|(_, r)| now.duration_since(r.last_activity) > max_ttl)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            self.records.remove(id);
            self.deltas.connections_closed += 1;
        }

        expired
    }

    /// The periodic `report` packet. Resets delta counters.
    pub fn report_packet(&mut self) -> Value {
        let deltas = std::mem::take(&mut self.deltas);

        Value::Map(vec![
            (b"from".to_vec(), Value::Bytes(self.instance_id.clone())),
            (
                b"connections".to_vec(),
                Value::Int(self.records.len() as i64),
            ),
            (
                b"connections-opened".to_vec(),
                Value::Int(deltas.connections_opened as i64),
            ),
            (
                b"connections-closed".to_vec(),
                Value::Int(deltas.connections_closed as i64),
            ),
            (
                b"requests-received".to_vec(),
                Value::Int(deltas.requests_received as i64),
            ),
            (b"bytes-in".to_vec(), Value::Int(deltas.bytes_in as i64)),
            (b"bytes-out".to_vec(), Value::Int(deltas.bytes_out as i64)),
            (b"ops".to_vec(), Value::Int(deltas.ops as i64)),
        ])
    }

    /// Intersect the given ids with the known set (the `conncheck`
    /// command).
    pub fn conncheck(&self, ids: &[Vec<u8>]) -> Vec<Vec<u8>> {
        ids.iter()
            .filter(|id| self.records.contains_key(*id))
            .cloned()
            .collect()
    }
}
