//! Endpoint spec handling.
//!
//! Specs are strings of the form `tcp://host:port` or `ipc:///abs/path`.
//! In multi-worker mode each worker gets its own ipc endpoints by
//! suffixing `-n`; tcp endpoints are shared as-is.

/// A parsed endpoint with its attachment policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecInfo {
    /// The endpoint string, e.g. `ipc:///run/pushpin/inspect-0`.
    pub spec: String,

    /// Bind instead of connect.
    pub bind: bool,

    /// Permission bits applied to the ipc file after a bind.
    pub ipc_file_mode: Option<u32>,
}

impl SpecInfo {
    pub fn connect(spec: impl Into<String>) -> Self {
        Self {
            spec: spec.into(),
            bind: false,
            ipc_file_mode: None,
        }
    }

    pub fn bind(spec: impl Into<String>, ipc_file_mode: Option<u32>) -> Self {
        Self {
            spec: spec.into(),
            bind: true,
            ipc_file_mode,
        }
    }
}

/// Suffix an ipc spec with the worker index. Non-ipc specs pass through.
pub fn suffix_spec(spec: &str, n: usize) -> String {
    if spec.starts_with("ipc:") {
        format!("{}-{}", spec, n)
    } else {
        spec.to_string()
    }
}

/// Suffix a spec list for a worker. Only a single-element ipc list is
/// suffixed; multi-element lists already name per-peer endpoints.
pub fn suffix_specs(specs: &[String], n: usize) -> Vec<String> {
    if specs.len() == 1 && specs[0].starts_with("ipc:") {
        return vec![suffix_spec(&specs[0], n)];
    }

    specs.to_vec()
}

/// The filesystem path of an ipc spec, if it is one.
pub fn ipc_path(spec: &str) -> Option<&str> {
    spec.strip_prefix("ipc://")
}
