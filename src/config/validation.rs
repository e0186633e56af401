//! Configuration validation logic.

use crate::config::schema::Config;

/// Error type for configuration validation failures.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError(pub String);

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation error: {}", self.0)
    }
}

/// Validate a Config for semantic correctness.
pub fn validate_config(config: &Config) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let proxy = &config.proxy;

    // 1. The server-side socket set must be complete
    if proxy.connmgr_in_specs.is_empty()
        || proxy.connmgr_in_stream_specs.is_empty()
        || proxy.connmgr_out_specs.is_empty()
    {
        errors.push(ValidationError(
            "must set connmgr_in_specs, connmgr_in_stream_specs, and connmgr_out_specs"
                .to_string(),
        ));
    }

    // 2. The client-side socket set must be complete
    if proxy.connmgr_client_out_specs.is_empty()
        || proxy.connmgr_client_out_stream_specs.is_empty()
        || proxy.connmgr_client_in_specs.is_empty()
    {
        errors.push(ValidationError(
            "must set connmgr_client_out_specs, connmgr_client_out_stream_specs, \
             and connmgr_client_in_specs"
                .to_string(),
        ));
    }

    // 3. Internal request sockets are all-or-nothing
    let intreq_set = [
        !proxy.intreq_in_specs.is_empty(),
        !proxy.intreq_in_stream_specs.is_empty(),
        !proxy.intreq_out_specs.is_empty(),
    ];
    if intreq_set.iter().any(|s| *s) && !intreq_set.iter().all(|s| *s) {
        errors.push(ValidationError(
            "intreq_in_specs, intreq_in_stream_specs, and intreq_out_specs must be set together"
                .to_string(),
        ));
    }

    // 4. Endpoint specs must parse
    for spec in proxy
        .connmgr_in_specs
        .iter()
        .chain(&proxy.connmgr_in_stream_specs)
        .chain(&proxy.connmgr_out_specs)
        .chain(&proxy.connmgr_client_out_specs)
        .chain(&proxy.connmgr_client_out_stream_specs)
        .chain(&proxy.connmgr_client_in_specs)
        .chain(&proxy.intreq_in_specs)
        .chain(&proxy.intreq_in_stream_specs)
        .chain(&proxy.intreq_out_specs)
    {
        if !spec.starts_with("tcp://") && !spec.starts_with("ipc://") {
            errors.push(ValidationError(format!(
                "endpoint spec '{}' must be tcp:// or ipc://",
                spec
            )));
        }
    }

    // 5. Workers must be at least 1
    if proxy.workers == 0 {
        errors.push(ValidationError("workers must be > 0".to_string()));
    }

    // 6. set_x_forwarded_protocol is an enum in string clothing
    match proxy.set_x_forwarded_protocol.as_str() {
        "true" | "false" | "proto-only" => {}
        other => errors.push(ValidationError(format!(
            "set_x_forwarded_protocol must be one of true/false/proto-only, got '{}'",
            other
        ))),
    }

    // 7. ipc_file_mode must be octal if present
    if !proxy.ipc_file_mode.is_empty() && proxy.ipc_file_mode_bits().is_none() {
        errors.push(ValidationError(format!(
            "ipc_file_mode '{}' is not valid octal",
            proxy.ipc_file_mode
        )));
    }

    if proxy.stats_report_interval == 0 {
        tracing::warn!("stats_report_interval is 0; stats reporting is disabled");
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
