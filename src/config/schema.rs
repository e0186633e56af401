//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.
//! Keys live under `[proxy]`, `[runner]`, and `[global]` sections.

use serde::{Deserialize, Serialize};

/// Root configuration for the proxy process.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    /// Proxy worker settings.
    pub proxy: ProxySection,

    /// Settings shared with the runner process.
    pub runner: RunnerConfig,

    /// Settings shared across all components.
    pub global: GlobalConfig,
}

/// The `[proxy]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxySection {
    /// Number of worker threads.
    pub workers: usize,

    /// Connection-manager request sockets (we PULL).
    pub connmgr_in_specs: Vec<String>,

    /// Connection-manager request stream sockets (we ROUTER).
    pub connmgr_in_stream_specs: Vec<String>,

    /// Connection-manager response sockets (we PUB).
    pub connmgr_out_specs: Vec<String>,

    /// Outgoing-client request sockets (we PUSH).
    pub connmgr_client_out_specs: Vec<String>,

    /// Outgoing-client stream sockets (we DEALER).
    pub connmgr_client_out_stream_specs: Vec<String>,

    /// Outgoing-client response sockets (we SUB).
    pub connmgr_client_in_specs: Vec<String>,

    /// Handler inspect RPC endpoint.
    pub handler_inspect_spec: String,

    /// Handler accept RPC endpoint.
    pub handler_accept_spec: String,

    /// Handler retry-in endpoint (replayed requests arrive here).
    pub handler_retry_in_spec: String,

    /// Handler WebSocket control init endpoints (carried, not consumed).
    pub handler_ws_control_init_specs: Vec<String>,

    /// Handler WebSocket control stream endpoints (carried, not consumed).
    pub handler_ws_control_stream_specs: Vec<String>,

    /// Stats publish endpoint.
    pub stats_spec: String,

    /// Command (conncheck/refresh/report) endpoint.
    pub command_spec: String,

    /// Internal request sockets; sessions arriving here are trusted.
    pub intreq_in_specs: Vec<String>,
    pub intreq_in_stream_specs: Vec<String>,
    pub intreq_out_specs: Vec<String>,

    /// Octal permission mode applied to ipc files we bind (e.g. "0660").
    pub ipc_file_mode: String,

    /// Total open request budget across all workers. -1 means use
    /// `runner.client_maxconn`.
    pub max_open_requests: i64,

    /// Routes file path, relative to the config file directory.
    pub routesfile: String,

    /// Return backend error details to clients.
    pub debug: bool,

    /// Answer CORS preflights on behalf of all routes.
    pub auto_cross_origin: bool,

    /// Trust X-Forwarded-Protocol from peers.
    pub accept_x_forwarded_protocol: bool,

    /// One of "false", "true", "proto-only".
    pub set_x_forwarded_protocol: String,

    /// XFF rewrite rule for untrusted peers ("truncate:N", "append").
    pub x_forwarded_for: Vec<String>,

    /// XFF rewrite rule for trusted peers.
    pub x_forwarded_for_trusted: Vec<String>,

    /// Headers renamed to their marked form when relayed by a prior hop.
    pub orig_headers_need_mark: Vec<String>,

    /// Honor Pushpin-Route headers from clients.
    pub accept_pushpin_route: bool,

    /// CDN-Loop token; loop detection fails closed with 502.
    pub cdn_loop: String,

    /// Include the From header in finished-session log lines.
    pub log_from: bool,

    /// Include the User-Agent header in finished-session log lines.
    pub log_user_agent: bool,

    /// JWT issuer for Grip-Sig.
    pub sig_iss: String,

    /// JWT signing secret for Grip-Sig. Empty disables signing.
    pub sig_key: String,

    /// Key for verifying signatures from upstream proxies.
    pub upstream_key: String,

    /// Inspect RPC deadline in milliseconds.
    pub inspect_timeout: u64,

    /// Body prefix size included in inspect RPC calls.
    pub inspect_prefetch: usize,

    /// Treat inspect RPC timeout as permit (matches historical behavior).
    pub inspect_timeout_permits: bool,

    /// Maximum upstream retry attempts per session.
    pub retry_max: u32,

    /// Base delay for retry backoff in milliseconds.
    pub retry_base_delay_ms: u64,

    /// Maximum delay for retry backoff in milliseconds.
    pub retry_max_delay_ms: u64,

    /// Force-end connection records idle longer than this (seconds).
    pub stats_connections_max_ttl: u64,

    /// Stats report cadence in seconds.
    pub stats_report_interval: u64,

    /// Prometheus exposition port. Empty disables exposition.
    pub prometheus_port: String,

    /// Prefix applied to exposed metric names.
    pub prometheus_prefix: String,

    /// Use the native event loop. The embedded-host loop is gone; this key
    /// is accepted for config compatibility and ignored.
    pub new_event_loop: bool,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            workers: 1,
            connmgr_in_specs: Vec::new(),
            connmgr_in_stream_specs: Vec::new(),
            connmgr_out_specs: Vec::new(),
            connmgr_client_out_specs: Vec::new(),
            connmgr_client_out_stream_specs: Vec::new(),
            connmgr_client_in_specs: Vec::new(),
            handler_inspect_spec: String::new(),
            handler_accept_spec: String::new(),
            handler_retry_in_spec: String::new(),
            handler_ws_control_init_specs: Vec::new(),
            handler_ws_control_stream_specs: Vec::new(),
            stats_spec: String::new(),
            command_spec: String::new(),
            intreq_in_specs: Vec::new(),
            intreq_in_stream_specs: Vec::new(),
            intreq_out_specs: Vec::new(),
            ipc_file_mode: String::new(),
            max_open_requests: -1,
            routesfile: "routes".to_string(),
            debug: false,
            auto_cross_origin: false,
            accept_x_forwarded_protocol: false,
            set_x_forwarded_protocol: "false".to_string(),
            x_forwarded_for: Vec::new(),
            x_forwarded_for_trusted: Vec::new(),
            orig_headers_need_mark: Vec::new(),
            accept_pushpin_route: false,
            cdn_loop: String::new(),
            log_from: false,
            log_user_agent: false,
            sig_iss: "pushpin".to_string(),
            sig_key: String::new(),
            upstream_key: String::new(),
            inspect_timeout: 8_000,
            inspect_prefetch: 10_000,
            inspect_timeout_permits: true,
            retry_max: 2,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 2_000,
            stats_connections_max_ttl: 60,
            stats_report_interval: 10,
            prometheus_port: String::new(),
            prometheus_prefix: String::new(),
            new_event_loop: true,
        }
    }
}

/// The `[runner]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Services managed by the runner. Affects which socket sets apply.
    pub services: Vec<String>,

    /// Global client connection budget; caps `max_open_requests`.
    pub client_maxconn: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            client_maxconn: 50_000,
        }
    }
}

/// The `[global]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Emit per-connection stats packets.
    pub stats_connection_send: bool,

    /// TTL for per-connection stats records in seconds.
    pub stats_connection_ttl: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            stats_connection_send: true,
            stats_connection_ttl: 120,
        }
    }
}

/// An X-Forwarded-For rewrite rule: truncate the existing list to N
/// entries, then optionally append the peer address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XffRule {
    pub truncate: Option<usize>,
    pub append: bool,
}

impl XffRule {
    /// Parse from config list form, e.g. `["truncate:0", "append"]`.
    /// Unrecognized entries are ignored, matching the original parser.
    pub fn from_parts(parts: &[String]) -> Self {
        let mut rule = XffRule::default();
        for part in parts {
            if let Some(n) = part.strip_prefix("truncate:") {
                match n.parse::<usize>() {
                    Ok(n) => rule.truncate = Some(n),
                    Err(_) => return XffRule::default(),
                }
            } else if part == "append" {
                rule.append = true;
            }
        }
        rule
    }
}

impl ProxySection {
    /// The untrusted-peer XFF rule, applied to every request.
    pub fn xff_untrusted_rule(&self) -> XffRule {
        XffRule::from_parts(&self.x_forwarded_for)
    }

    /// The trusted-peer XFF rule, applied when the peer is trusted.
    pub fn xff_trusted_rule(&self) -> XffRule {
        XffRule::from_parts(&self.x_forwarded_for_trusted)
    }

    /// Parsed `ipc_file_mode`, if set. The value is octal text.
    pub fn ipc_file_mode_bits(&self) -> Option<u32> {
        if self.ipc_file_mode.is_empty() {
            return None;
        }
        u32::from_str_radix(self.ipc_file_mode.trim_start_matches("0o"), 8).ok()
    }

    /// Whether X-Forwarded-Proto should be set on dispatched requests.
    pub fn set_xf_proto(&self) -> bool {
        self.set_x_forwarded_protocol == "true" || self.set_x_forwarded_protocol == "proto-only"
    }

    /// Whether X-Forwarded-Protocol should also be set.
    pub fn set_xf_protocol(&self) -> bool {
        self.set_x_forwarded_protocol == "true"
    }

    /// Substitute `{ipc_prefix}` in every endpoint spec.
    pub fn apply_ipc_prefix(&mut self, prefix: &str) {
        let substitute = |specs: &mut Vec<String>| {
            for spec in specs {
                *spec = spec.replace("{ipc_prefix}", prefix);
            }
        };
        let substitute_one = |spec: &mut String| {
            *spec = spec.replace("{ipc_prefix}", prefix);
        };

        substitute(&mut self.connmgr_in_specs);
        substitute(&mut self.connmgr_in_stream_specs);
        substitute(&mut self.connmgr_out_specs);
        substitute(&mut self.connmgr_client_out_specs);
        substitute(&mut self.connmgr_client_out_stream_specs);
        substitute(&mut self.connmgr_client_in_specs);
        substitute(&mut self.handler_ws_control_init_specs);
        substitute(&mut self.handler_ws_control_stream_specs);
        substitute(&mut self.intreq_in_specs);
        substitute(&mut self.intreq_in_stream_specs);
        substitute(&mut self.intreq_out_specs);
        substitute_one(&mut self.handler_inspect_spec);
        substitute_one(&mut self.handler_accept_spec);
        substitute_one(&mut self.handler_retry_in_spec);
        substitute_one(&mut self.stats_spec);
        substitute_one(&mut self.command_spec);
    }
}
