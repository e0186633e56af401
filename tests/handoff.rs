//! Inspect, hold, and handoff scenarios.

mod common;

use std::time::Duration;

use common::*;
use pushpin_proxy::zhttp::tnetstring::Value;
use pushpin_proxy::zhttp::Header;

#[test]
fn test_hold_and_handoff() {
    let bus = TestBus::new(true);
    let (mut supervisor, _map) = start_proxy(
        &bus,
        bus.engine_config(),
        &["example.com backend:8080 session"],
    );

    bus.send_request(
        b"req-hold",
        "GET",
        "http://example.com/stream",
        vec![Header::new("Host", "example.com")],
    );

    // inspect marks the session as accept-needed
    let inspect_args = TestBus::rpc_serve_one(
        bus.inspect.as_ref().unwrap(),
        Value::Map(vec![(b"accept".to_vec(), Value::Bool(true))]),
    );
    assert_eq!(
        inspect_args.get("method").and_then(Value::as_str),
        Some("GET")
    );
    assert_eq!(
        inspect_args.get("uri").and_then(Value::as_str),
        Some("http://example.com/stream")
    );

    // upstream responds with a hold directive
    let upstream_request = bus.upstream_recv();
    bus.upstream_reply(
        &upstream_request,
        200,
        vec![Header::new("Grip-Hold", "response")],
        b"waiting...",
        false,
    );

    // the accept rpc carries the full request and response
    let accept_args = TestBus::rpc_serve_one(
        bus.accept.as_ref().unwrap(),
        Value::Map(vec![(b"accepted".to_vec(), Value::Bool(true))]),
    );

    let request = accept_args.get("request").expect("request in accept args");
    assert_eq!(request.get("method").and_then(Value::as_str), Some("GET"));

    let response = accept_args.get("response").expect("response in accept args");
    assert_eq!(response.get("code").and_then(Value::as_int), Some(200));
    assert_eq!(
        response.get("body").and_then(Value::as_bytes),
        Some(b"waiting...".as_slice())
    );

    let conn = accept_args.get("conn").expect("conn ids in accept args");
    assert_eq!(
        conn.get("id").and_then(Value::as_bytes),
        Some(b"req-hold".as_slice())
    );
    assert_eq!(
        accept_args.get("response-sent").and_then(Value::as_bool),
        Some(false)
    );

    // detached: the proxy writes nothing further to the client
    bus.expect_no_response(Duration::from_millis(500));

    supervisor.stop();
}

#[test]
fn test_accept_refused_synthesizes_502() {
    let bus = TestBus::new(true);
    let (mut supervisor, _map) = start_proxy(
        &bus,
        bus.engine_config(),
        &["example.com backend:8080 session"],
    );

    bus.send_request(
        b"req-nak",
        "GET",
        "http://example.com/stream",
        vec![Header::new("Host", "example.com")],
    );

    TestBus::rpc_serve_one(
        bus.inspect.as_ref().unwrap(),
        Value::Map(vec![(b"accept".to_vec(), Value::Bool(true))]),
    );

    let upstream_request = bus.upstream_recv();
    bus.upstream_reply(
        &upstream_request,
        200,
        vec![Header::new("Grip-Hold", "response")],
        b"",
        false,
    );

    TestBus::rpc_serve_one(
        bus.accept.as_ref().unwrap(),
        Value::Map(vec![(b"accepted".to_vec(), Value::Bool(false))]),
    );

    let response = bus.recv_response();
    assert_eq!(response.code, Some(502));

    supervisor.stop();
}

#[test]
fn test_inspect_deny_short_response() {
    let bus = TestBus::new(true);
    let (mut supervisor, _map) = start_proxy(
        &bus,
        bus.engine_config(),
        &["example.com backend:8080 session"],
    );

    bus.send_request(
        b"req-deny",
        "GET",
        "http://example.com/blocked",
        vec![Header::new("Host", "example.com")],
    );

    TestBus::rpc_serve_one(
        bus.inspect.as_ref().unwrap(),
        Value::Map(vec![
            (b"no-proxy".to_vec(), Value::Bool(true)),
            (
                b"response".to_vec(),
                Value::Map(vec![
                    (b"code".to_vec(), Value::Int(451)),
                    (b"reason".to_vec(), Value::bytes("Unavailable")),
                    (b"body".to_vec(), Value::bytes("blocked\n")),
                ]),
            ),
        ]),
    );

    let response = bus.recv_response();
    assert_eq!(response.code, Some(451));
    assert_eq!(response.body, b"blocked\n");
    bus.upstream_expect_silence(Duration::from_millis(200));

    supervisor.stop();
}

#[test]
fn test_inspect_timeout_permits_plain_proxying() {
    let bus = TestBus::new(true);
    let mut config = bus.engine_config();
    config.inspect_timeout = Duration::from_millis(200);

    let (mut supervisor, _map) = start_proxy(
        &bus,
        config,
        &["example.com backend:8080 session"],
    );

    bus.send_request(
        b"req-timeout",
        "GET",
        "http://example.com/",
        vec![Header::new("Host", "example.com")],
    );

    // never answer the inspect call; the request must still dispatch
    let upstream_request = bus.upstream_recv();
    bus.upstream_reply(&upstream_request, 200, Vec::new(), b"made it", false);

    let response = bus.recv_response();
    assert_eq!(response.code, Some(200));
    assert_eq!(response.body, b"made it");

    supervisor.stop();
}

#[test]
fn test_plain_response_on_session_route_streams_through() {
    let bus = TestBus::new(true);
    let (mut supervisor, _map) = start_proxy(
        &bus,
        bus.engine_config(),
        &["example.com backend:8080 session"],
    );

    bus.send_request(
        b"req-plain",
        "GET",
        "http://example.com/data",
        vec![Header::new("Host", "example.com")],
    );

    TestBus::rpc_serve_one(
        bus.inspect.as_ref().unwrap(),
        Value::Map(vec![(b"accept".to_vec(), Value::Bool(true))]),
    );

    // no hold directive: body streams through even though inspect said
    // accept-needed
    let upstream_request = bus.upstream_recv();
    bus.upstream_reply(
        &upstream_request,
        200,
        vec![Header::new("Content-Type", "text/plain")],
        b"plain body",
        false,
    );

    let response = bus.recv_response();
    assert_eq!(response.code, Some(200));
    assert_eq!(response.body, b"plain body");

    supervisor.stop();
}
