//! Route line parsing.
//!
//! One route per line, `#` comments:
//!
//! ```text
//! host[/path] target[,target…] [option=value …]
//! ```
//!
//! Targets are `[scheme://]host:port[;weight=N]` or the literal `test`.
//! Option flags without a value mean `true`.
//!
//! # Design Decisions
//! - Host matching is case-insensitive (per HTTP); paths are
//!   case-sensitive
//! - `*` is the wildcard host; exact hosts always win over it
//! - No regex, prefix matching only, so lookup stays O(routes)

use url::Url;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RouteParseError {
    #[error("empty route line")]
    Empty,

    #[error("missing target")]
    MissingTarget,

    #[error("bad target '{0}'")]
    BadTarget(String),

    #[error("bad option '{0}'")]
    BadOption(String),
}

/// One upstream target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub ssl: bool,
    pub weight: u32,
    /// Loopback target: synthesize a 200 without contacting an upstream.
    pub test: bool,
}

impl Target {
    pub fn parse(s: &str) -> Result<Target, RouteParseError> {
        if s == "test" {
            return Ok(Target {
                host: String::new(),
                port: 0,
                ssl: false,
                weight: 1,
                test: true,
            });
        }

        let (spec, weight) = match s.split_once(";weight=") {
            Some((spec, w)) => (
                spec,
                w.parse::<u32>()
                    .ok()
                    .filter(|w| *w > 0)
                    .ok_or_else(|| RouteParseError::BadTarget(s.to_string()))?,
            ),
            None => (s, 1),
        };

        let with_scheme = if spec.contains("://") {
            spec.to_string()
        } else {
            format!("http://{}", spec)
        };

        let url = Url::parse(&with_scheme).map_err(|_| RouteParseError::BadTarget(s.to_string()))?;

        let ssl = match url.scheme() {
            "http" => false,
            "https" => true,
            _ => return Err(RouteParseError::BadTarget(s.to_string())),
        };

        let host = url
            .host_str()
            .ok_or_else(|| RouteParseError::BadTarget(s.to_string()))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| RouteParseError::BadTarget(s.to_string()))?;

        Ok(Target {
            host,
            port,
            ssl,
            weight,
            test: false,
        })
    }

    /// `host:port` form for logs and Host headers.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A compiled route. Immutable after parse; sessions hold it by `Arc`
/// through completion even across reloads.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    /// Matched host, lowercased. `*` matches any host.
    pub host: String,

    /// Path prefix. Defaults to `/`.
    pub path_prefix: String,

    /// Upstream targets, in file order.
    pub targets: Vec<Target>,

    /// Realtime-capable: inspect/accept may hold requests on this route.
    pub session: bool,

    /// Answer CORS preflights without dispatching.
    pub auto_cross_origin: bool,

    /// Apply the trusted X-Forwarded-* rule on this route.
    pub trusted: bool,

    /// Tunnel the request over WebSocket-over-HTTP framing.
    pub over_http: bool,

    /// Sign Grip-Sig with these instead of the global issuer/key.
    pub sig_iss: Option<String>,
    pub sig_key: Option<String>,

    /// Suppress Grip-Sig on this route.
    pub no_grip_sig: bool,

    /// Headers added to dispatched requests.
    pub headers_to_add: Vec<(String, String)>,

    /// Headers stripped from dispatched requests.
    pub headers_to_remove: Vec<String>,

    /// Add request-id headers to dispatched requests.
    pub insert_id_headers: bool,

    /// Per-route upstream timeout in seconds, if set.
    pub timeout_secs: Option<u64>,
}

impl Route {
    /// Parse one route line. Returns `None` for blank and comment lines.
    pub fn parse_line(line: &str) -> Result<Option<Route>, RouteParseError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let mut parts = line.split_whitespace();
        let matcher = parts.next().ok_or(RouteParseError::Empty)?;
        let targets_part = parts.next().ok_or(RouteParseError::MissingTarget)?;

        let (host, path_prefix) = match matcher.split_once('/') {
            Some((host, path)) => (host.to_ascii_lowercase(), format!("/{}", path)),
            None => (matcher.to_ascii_lowercase(), "/".to_string()),
        };

        let targets = targets_part
            .split(',')
            .map(Target::parse)
            .collect::<Result<Vec<_>, _>>()?;
        if targets.is_empty() {
            return Err(RouteParseError::MissingTarget);
        }

        let mut route = Route {
            host,
            path_prefix,
            targets,
            session: false,
            auto_cross_origin: false,
            trusted: false,
            over_http: false,
            sig_iss: None,
            sig_key: None,
            no_grip_sig: false,
            headers_to_add: Vec::new(),
            headers_to_remove: Vec::new(),
            insert_id_headers: false,
            timeout_secs: None,
        };

        for option in parts {
            let (key, value) = match option.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (option, None),
            };

            match (key, value) {
                ("session", _) => route.session = flag(value, option)?,
                ("auto_cross_origin", _) => route.auto_cross_origin = flag(value, option)?,
                ("trusted", _) => route.trusted = flag(value, option)?,
                ("over_http", _) => route.over_http = flag(value, option)?,
                ("no_grip_sig", _) => route.no_grip_sig = flag(value, option)?,
                ("insert_id_headers", _) => route.insert_id_headers = flag(value, option)?,
                ("sig_iss", Some(v)) => route.sig_iss = Some(v.to_string()),
                ("sig_key", Some(v)) => route.sig_key = Some(v.to_string()),
                ("timeout", Some(v)) => {
                    route.timeout_secs = Some(
                        v.parse()
                            .map_err(|_| RouteParseError::BadOption(option.to_string()))?,
                    )
                }
                ("header", Some(v)) => match v.split_once(':') {
                    Some((name, value)) => route
                        .headers_to_add
                        .push((name.to_string(), value.to_string())),
                    None => return Err(RouteParseError::BadOption(option.to_string())),
                },
                ("strip_header", Some(v)) => route.headers_to_remove.push(v.to_string()),
                _ => return Err(RouteParseError::BadOption(option.to_string())),
            }
        }

        Ok(Some(route))
    }

    /// Whether this route matches the host. Returns match specificity:
    /// exact host beats wildcard.
    pub fn matches_host(&self, host: &str) -> bool {
        self.host == "*" || self.host.eq_ignore_ascii_case(host)
    }

    /// Whether this route's prefix covers the path.
    pub fn matches_path(&self, path: &str) -> bool {
        path.starts_with(&self.path_prefix)
    }

    /// A stable identifier for logs and stats.
    pub fn id(&self) -> String {
        if self.path_prefix == "/" {
            self.host.clone()
        } else {
            format!("{}{}", self.host, self.path_prefix)
        }
    }
}

fn flag(value: Option<&str>, option: &str) -> Result<bool, RouteParseError> {
    match value {
        None | Some("true") => Ok(true),
        Some("false") => Ok(false),
        Some(_) => Err(RouteParseError::BadOption(option.to_string())),
    }
}
