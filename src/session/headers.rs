//! Header manipulation for dispatched requests and relayed responses.
//!
//! # Responsibilities
//! - Strip hop-by-hop headers in both directions
//! - Rewrite X-Forwarded-For / -Proto / -Protocol
//! - CDN-Loop detection and append
//! - Pushpin-Route acceptance, orig-header marking
//! - Grip-Sig JWT signing for session-capable routes
//!
//! # Design Decisions
//! - Never trust existing X-Forwarded-* beyond what the matching XFF
//!   rule keeps; trusted peers get the trusted rule
//! - Loop detection fails closed: a request carrying our own CDN-Loop
//!   token is answered 502 without contacting an upstream

use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header as JwtHeader};
use serde::Serialize;

use crate::config::XffRule;
use crate::zhttp::packet::Header;

/// Prefix applied to headers listed in `orig_headers_need_mark`.
const ORIG_MARK_PREFIX: &str = "Eb9bf0f5-Orig-";

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove all headers with the given name. Returns whether any were
/// removed.
pub fn remove_header(headers: &mut Vec<Header>, name: &str) -> bool {
    let before = headers.len();
    headers.retain(|h| !h.is(name));
    headers.len() != before
}

/// Strip hop-by-hop headers, including any named by Connection.
pub fn strip_hop_by_hop(headers: &mut Vec<Header>) {
    let mut connection_named: Vec<String> = Vec::new();
    for header in headers.iter() {
        if header.is("connection") {
            if let Ok(value) = std::str::from_utf8(&header.value) {
                connection_named.extend(
                    value
                        .split(',')
                        .map(|t| t.trim().to_ascii_lowercase())
                        .filter(|t| !t.is_empty()),
                );
            }
        }
    }

    headers.retain(|h| {
        let name = h.name.to_ascii_lowercase();
        !HOP_BY_HOP.contains(&name.as_str()) && !connection_named.contains(&name)
    });
}

/// Apply an XFF rule: truncate the existing list to N entries, then
/// append the peer address if the rule says so.
pub fn apply_xff(headers: &mut Vec<Header>, rule: XffRule, peer_address: Option<&str>) {
    if rule.truncate.is_none() && !rule.append {
        return;
    }

    let mut entries: Vec<String> = Vec::new();
    for header in headers.iter() {
        if header.is("x-forwarded-for") {
            if let Ok(value) = std::str::from_utf8(&header.value) {
                entries.extend(
                    value
                        .split(',')
                        .map(|e| e.trim().to_string())
                        .filter(|e| !e.is_empty()),
                );
            }
        }
    }

    if let Some(n) = rule.truncate {
        // keep the last n entries: the nearest hops are the trustworthy ones
        if entries.len() > n {
            entries.drain(..entries.len() - n);
        }
    }

    if rule.append {
        if let Some(peer) = peer_address {
            entries.push(peer.to_string());
        }
    }

    remove_header(headers, "x-forwarded-for");
    if !entries.is_empty() {
        headers.push(Header::new("X-Forwarded-For", entries.join(", ")));
    }
}

/// Set the X-Forwarded-Proto (and optionally -Protocol) headers.
pub fn set_forwarded_proto(
    headers: &mut Vec<Header>,
    scheme: &str,
    set_proto: bool,
    set_protocol: bool,
) {
    if set_proto {
        remove_header(headers, "x-forwarded-proto");
        headers.push(Header::new("X-Forwarded-Proto", scheme));
    }
    if set_protocol {
        remove_header(headers, "x-forwarded-protocol");
        headers.push(Header::new("X-Forwarded-Protocol", scheme));
    }
}

/// Whether the incoming CDN-Loop list already carries our token.
pub fn cdn_loop_detected(headers: &[Header], token: &str) -> bool {
    headers.iter().filter(|h| h.is("cdn-loop")).any(|h| {
        std::str::from_utf8(&h.value)
            .map(|value| value.split(',').any(|t| t.trim() == token))
            .unwrap_or(false)
    })
}

/// Append our CDN-Loop token for the upstream to see.
pub fn append_cdn_loop(headers: &mut Vec<Header>, token: &str) {
    headers.push(Header::new("CDN-Loop", token));
}

/// Rename headers that must survive this hop unmodified; the upstream
/// reads them back under the marked name.
pub fn mark_orig_headers(headers: &mut [Header], need_mark: &[String]) {
    for header in headers.iter_mut() {
        if need_mark.iter().any(|n| header.is(n)) {
            header.name = format!("{}{}", ORIG_MARK_PREFIX, header.name);
        }
    }
}

#[derive(Serialize)]
struct GripClaims<'a> {
    iss: &'a str,
    exp: u64,
}

/// Sign a Grip-Sig token proving the request passed through this proxy.
pub fn grip_sig(iss: &str, key: &str) -> Option<Header> {
    if key.is_empty() {
        return None;
    }

    let exp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()?
        .as_secs()
        + 3600;

    let token = encode(
        &JwtHeader::new(Algorithm::HS256),
        &GripClaims { iss, exp },
        &EncodingKey::from_secret(key.as_bytes()),
    )
    .ok()?;

    Some(Header::new("Grip-Sig", token))
}

#[derive(serde::Deserialize)]
struct GripClaimsIn {
    #[allow(dead_code)]
    iss: String,
}

/// Verify an incoming Grip-Sig against the upstream key. A valid
/// signature marks the sending proxy as trusted.
pub fn verify_grip_sig(headers: &[Header], key: &str) -> bool {
    if key.is_empty() {
        return false;
    }

    let Some(header) = headers.iter().find(|h| h.is("grip-sig")) else {
        return false;
    };
    let Ok(token) = std::str::from_utf8(&header.value) else {
        return false;
    };

    let mut validation = jsonwebtoken::Validation::new(Algorithm::HS256);
    validation.set_required_spec_claims(&["exp"]);

    jsonwebtoken::decode::<GripClaimsIn>(
        token,
        &jsonwebtoken::DecodingKey::from_secret(key.as_bytes()),
        &validation,
    )
    .is_ok()
}

/// Whether a request is a CORS preflight.
pub fn is_cors_preflight(method: &str, headers: &[Header]) -> bool {
    method.eq_ignore_ascii_case("OPTIONS")
        && headers.iter().any(|h| h.is("access-control-request-method"))
}

/// Response headers for a synthesized preflight answer.
pub fn cors_preflight_headers(request_headers: &[Header]) -> Vec<Header> {
    let mut out = Vec::new();

    let origin = request_headers
        .iter()
        .find(|h| h.is("origin"))
        .map(|h| h.value.clone())
        .unwrap_or_else(|| b"*".to_vec());
    out.push(Header::new("Access-Control-Allow-Origin", origin));

    if let Some(method) = request_headers
        .iter()
        .find(|h| h.is("access-control-request-method"))
    {
        out.push(Header::new("Access-Control-Allow-Methods", method.value.clone()));
    }
    if let Some(hdrs) = request_headers
        .iter()
        .find(|h| h.is("access-control-request-headers"))
    {
        out.push(Header::new("Access-Control-Allow-Headers", hdrs.value.clone()));
    }
    out.push(Header::new("Access-Control-Max-Age", "3600"));

    out
}

/// Whether a response instructs us to hold the connection.
pub fn has_hold_directive(headers: &[Header]) -> bool {
    headers
        .iter()
        .any(|h| h.is("grip-hold") || h.is("grip-channel"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Vec<Header> {
        pairs.iter().map(|(n, v)| Header::new(*n, *v)).collect()
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut hdrs = headers(&[
            ("Connection", "close, X-Custom-Hop"),
            ("Keep-Alive", "timeout=5"),
            ("X-Custom-Hop", "1"),
            ("Content-Type", "text/plain"),
        ]);
        strip_hop_by_hop(&mut hdrs);

        assert_eq!(hdrs.len(), 1);
        assert_eq!(hdrs[0].name, "Content-Type");
    }

    #[test]
    fn test_xff_truncate_and_append() {
        // the literal case from the test plan: truncate:1 + append with
        // peer p over "a, b, c" yields "c, p"
        let mut hdrs = headers(&[("X-Forwarded-For", "a, b, c")]);
        let rule = XffRule {
            truncate: Some(1),
            append: true,
        };
        apply_xff(&mut hdrs, rule, Some("p"));

        assert_eq!(hdrs.len(), 1);
        assert_eq!(hdrs[0].value, b"c, p");
    }

    #[test]
    fn test_xff_truncate_zero_drops_all() {
        let mut hdrs = headers(&[("X-Forwarded-For", "a, b")]);
        let rule = XffRule {
            truncate: Some(0),
            append: true,
        };
        apply_xff(&mut hdrs, rule, Some("p"));

        assert_eq!(hdrs[0].value, b"p");
    }

    #[test]
    fn test_xff_empty_rule_is_noop() {
        let mut hdrs = headers(&[("X-Forwarded-For", "a")]);
        apply_xff(&mut hdrs, XffRule::default(), Some("p"));
        assert_eq!(hdrs[0].value, b"a");
    }

    #[test]
    fn test_cdn_loop_detection() {
        let hdrs = headers(&[("CDN-Loop", "other, pushpin-edge")]);
        assert!(cdn_loop_detected(&hdrs, "pushpin-edge"));
        assert!(!cdn_loop_detected(&hdrs, "pushpin-other"));
        assert!(!cdn_loop_detected(&[], "pushpin-edge"));
    }

    #[test]
    fn test_mark_orig_headers() {
        let mut hdrs = headers(&[("Authorization", "Bearer x"), ("Host", "example.com")]);
        mark_orig_headers(&mut hdrs, &["Authorization".to_string()]);

        assert_eq!(hdrs[0].name, "Eb9bf0f5-Orig-Authorization");
        assert_eq!(hdrs[1].name, "Host");
    }

    #[test]
    fn test_grip_sig() {
        let header = grip_sig("pushpin", "secret").unwrap();
        assert_eq!(header.name, "Grip-Sig");
        // three dot-separated JWT segments
        let token = std::str::from_utf8(&header.value).unwrap();
        assert_eq!(token.split('.').count(), 3);

        assert!(grip_sig("pushpin", "").is_none());
    }

    #[test]
    fn test_verify_grip_sig() {
        let header = grip_sig("edge", "shared-secret").unwrap();
        let hdrs = vec![header];

        assert!(verify_grip_sig(&hdrs, "shared-secret"));
        assert!(!verify_grip_sig(&hdrs, "wrong-secret"));
        assert!(!verify_grip_sig(&hdrs, ""));
        assert!(!verify_grip_sig(&[], "shared-secret"));
    }

    #[test]
    fn test_cors_preflight() {
        let hdrs = headers(&[
            ("Origin", "https://app.example"),
            ("Access-Control-Request-Method", "PUT"),
        ]);
        assert!(is_cors_preflight("OPTIONS", &hdrs));
        assert!(!is_cors_preflight("GET", &hdrs));
        assert!(!is_cors_preflight("OPTIONS", &headers(&[("Origin", "x")])));

        let response = cors_preflight_headers(&hdrs);
        assert_eq!(
            response
                .iter()
                .find(|h| h.is("access-control-allow-origin"))
                .unwrap()
                .value,
            b"https://app.example"
        );
        assert_eq!(
            response
                .iter()
                .find(|h| h.is("access-control-allow-methods"))
                .unwrap()
                .value,
            b"PUT"
        );
    }

    #[test]
    fn test_hold_directive() {
        assert!(has_hold_directive(&headers(&[("Grip-Hold", "response")])));
        assert!(has_hold_directive(&headers(&[("Grip-Channel", "updates")])));
        assert!(!has_hold_directive(&headers(&[("Content-Type", "x")])));
    }
}
