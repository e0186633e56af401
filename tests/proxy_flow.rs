//! End-to-end proxy scenarios over real bus endpoints.

mod common;

use std::time::Duration;

use common::*;
use pushpin_proxy::zhttp::{Header, PacketType, ZhttpPacket};

#[test]
fn test_plain_pass_through() {
    let bus = TestBus::new(false);
    let (mut supervisor, _map) = start_proxy(
        &bus,
        bus.engine_config(),
        &["example.com backend:8080"],
    );

    bus.send_request(
        b"req-1",
        "GET",
        "http://example.com/foo",
        vec![Header::new("Host", "example.com")],
    );

    // upstream sees the rewritten request
    let upstream_request = bus.upstream_recv();
    assert_eq!(upstream_request.method.as_deref(), Some("GET"));
    assert_eq!(
        upstream_request.uri.as_deref(),
        Some("http://backend:8080/foo")
    );
    assert_eq!(
        header_value(&upstream_request.headers, "host"),
        Some(b"example.com".as_slice())
    );

    bus.upstream_reply(&upstream_request, 200, Vec::new(), b"hello", false);

    // client sees identical status and body
    let response = bus.recv_response();
    assert_eq!(response.code, Some(200));
    assert_eq!(response.body, b"hello");
    assert!(!response.more);

    supervisor.stop();
}

#[test]
fn test_route_miss_returns_502() {
    let bus = TestBus::new(false);
    let (mut supervisor, _map) = start_proxy(
        &bus,
        bus.engine_config(),
        &["example.com backend:8080"],
    );

    bus.send_request(
        b"req-miss",
        "GET",
        "http://unknown.test/",
        vec![Header::new("Host", "unknown.test")],
    );

    let response = bus.recv_response();
    assert_eq!(response.code, Some(502));

    bus.upstream_expect_silence(Duration::from_millis(300));

    supervisor.stop();
}

#[test]
fn test_xff_truncate_append() {
    let bus = TestBus::new(false);
    let mut config = bus.engine_config();
    config.xff_untrusted_rule = pushpin_proxy::config::XffRule {
        truncate: Some(1),
        append: true,
    };

    let (mut supervisor, _map) = start_proxy(&bus, config, &["example.com backend:8080"]);

    bus.send_request_packet(ZhttpPacket {
        ptype: PacketType::Data,
        id: b"req-xff".to_vec(),
        seq: Some(0),
        from: CONNMGR_ID.to_vec(),
        method: Some("GET".to_string()),
        uri: Some("http://example.com/".to_string()),
        headers: vec![
            Header::new("Host", "example.com"),
            Header::new("X-Forwarded-For", "a, b, c"),
        ],
        credits: 100_000,
        stream: true,
        peer_address: Some("p".to_string()),
        ..Default::default()
    });

    let upstream_request = bus.upstream_recv();
    assert_eq!(
        header_value(&upstream_request.headers, "x-forwarded-for"),
        Some(b"c, p".as_slice())
    );

    bus.upstream_reply(&upstream_request, 200, Vec::new(), b"", false);
    supervisor.stop();
}

#[test]
fn test_cdn_loop_detected() {
    let bus = TestBus::new(false);
    let mut config = bus.engine_config();
    config.cdn_loop = Some("pushpin-edge".to_string());

    let (mut supervisor, _map) = start_proxy(&bus, config, &["example.com backend:8080"]);

    bus.send_request(
        b"req-loop",
        "GET",
        "http://example.com/",
        vec![
            Header::new("Host", "example.com"),
            Header::new("CDN-Loop", "pushpin-edge"),
        ],
    );

    let response = bus.recv_response();
    assert_eq!(response.code, Some(502));
    bus.upstream_expect_silence(Duration::from_millis(300));

    supervisor.stop();
}

#[test]
fn test_cdn_loop_token_appended() {
    let bus = TestBus::new(false);
    let mut config = bus.engine_config();
    config.cdn_loop = Some("pushpin-edge".to_string());

    let (mut supervisor, _map) = start_proxy(&bus, config, &["example.com backend:8080"]);

    bus.send_request(
        b"req-ok",
        "GET",
        "http://example.com/",
        vec![Header::new("Host", "example.com")],
    );

    let upstream_request = bus.upstream_recv();
    assert_eq!(
        header_value(&upstream_request.headers, "cdn-loop"),
        Some(b"pushpin-edge".as_slice())
    );

    bus.upstream_reply(&upstream_request, 200, Vec::new(), b"", false);
    supervisor.stop();
}

#[test]
fn test_sessions_max_zero_refuses_everything() {
    let bus = TestBus::new(false);
    let mut config = bus.engine_config();
    config.sessions_max = 0;

    let (mut supervisor, _map) = start_proxy(&bus, config, &["example.com backend:8080"]);

    bus.send_request(
        b"req-refused",
        "GET",
        "http://example.com/",
        vec![Header::new("Host", "example.com")],
    );

    let response = bus.recv_response();
    assert_eq!(response.code, Some(503));
    bus.upstream_expect_silence(Duration::from_millis(300));

    supervisor.stop();
}

#[test]
fn test_upstream_error_retries_then_succeeds() {
    let bus = TestBus::new(false);
    let mut config = bus.engine_config();
    config.retry.base_delay_ms = 10;
    config.retry.max_delay_ms = 50;

    let (mut supervisor, _map) = start_proxy(&bus, config, &["example.com backend:8080"]);

    bus.send_request(
        b"req-retry",
        "GET",
        "http://example.com/",
        vec![Header::new("Host", "example.com")],
    );

    // first attempt fails before any response bytes
    let first = bus.upstream_recv();
    bus.upstream_fail(&first, "remote-connection-failed");

    // the retry arrives as a fresh transaction
    let second = bus.upstream_recv();
    assert_ne!(first.id, second.id);
    assert_eq!(second.uri.as_deref(), Some("http://backend:8080/"));

    bus.upstream_reply(&second, 200, Vec::new(), b"recovered", false);

    let response = bus.recv_response();
    assert_eq!(response.code, Some(200));
    assert_eq!(response.body, b"recovered");

    supervisor.stop();
}

#[test]
fn test_upstream_error_exhausts_retries() {
    let bus = TestBus::new(false);
    let mut config = bus.engine_config();
    config.retry.max_retries = 1;
    config.retry.base_delay_ms = 10;
    config.retry.max_delay_ms = 20;

    let (mut supervisor, _map) = start_proxy(&bus, config, &["example.com backend:8080"]);

    bus.send_request(
        b"req-fail",
        "GET",
        "http://example.com/",
        vec![Header::new("Host", "example.com")],
    );

    let first = bus.upstream_recv();
    bus.upstream_fail(&first, "remote-connection-failed");
    let second = bus.upstream_recv();
    bus.upstream_fail(&second, "remote-connection-failed");

    let response = bus.recv_response();
    assert_eq!(response.code, Some(502));

    supervisor.stop();
}

#[test]
fn test_test_target_answers_locally() {
    let bus = TestBus::new(false);
    let (mut supervisor, _map) = start_proxy(&bus, bus.engine_config(), &["example.com test"]);

    bus.send_request(
        b"req-test",
        "GET",
        "http://example.com/",
        vec![Header::new("Host", "example.com")],
    );

    let response = bus.recv_response();
    assert_eq!(response.code, Some(200));
    bus.upstream_expect_silence(Duration::from_millis(200));

    supervisor.stop();
}

#[test]
fn test_cors_preflight_short_circuit() {
    let bus = TestBus::new(false);
    let mut config = bus.engine_config();
    config.auto_cross_origin = true;

    let (mut supervisor, _map) = start_proxy(&bus, config, &["example.com backend:8080"]);

    bus.send_request(
        b"req-preflight",
        "OPTIONS",
        "http://example.com/api",
        vec![
            Header::new("Host", "example.com"),
            Header::new("Origin", "https://app.example"),
            Header::new("Access-Control-Request-Method", "PUT"),
        ],
    );

    let response = bus.recv_response();
    assert_eq!(response.code, Some(200));
    assert_eq!(
        header_value(&response.headers, "access-control-allow-origin"),
        Some(b"https://app.example".as_slice())
    );
    bus.upstream_expect_silence(Duration::from_millis(200));

    supervisor.stop();
}
