//! Relay forwarding tests: client → relay → server.

mod common;

use std::sync::Arc;
use std::time::Duration;

use shunt::core::{
    CallFlags, Frame, FrameHeader, FramePool, InitBody, MessageType, SystemErrCode, ID_PROTOCOL,
};
use shunt::relay::RelayStartError;
use shunt::{
    stat_keys, CallError, CallHandler, CallOptions, Channel, ChannelConfig, HandlerFn, InboundCall,
};

use common::{thrift_arg2, FuncHost, HostDecision, MockStats, RawClient};

fn echo_handler() -> Arc<dyn CallHandler> {
    Arc::new(HandlerFn(|mut call: InboundCall| async move {
        let arg2 = call.arg2().to_vec();
        let arg3 = call.arg3().to_vec();
        let _ = call.response().send_ok(&arg2, &arg3);
    }))
}

async fn start_echo_server(service: &str) -> (Channel, String) {
    let server = Channel::new(ChannelConfig::new(service)).expect("server channel");
    server.register("echo", echo_handler());
    let addr = server.listen("127.0.0.1:0").await.expect("listen");
    (server, addr.to_string())
}

/// Start a relay whose host forwards every call to `dest`.
async fn start_relay(stats: Arc<MockStats>, dest: &str, config: ChannelConfig) -> (Channel, String) {
    let relay = Channel::new(
        config
            .with_relay_host(FuncHost::fixed(stats.clone(), dest))
            .with_stats(stats),
    )
    .expect("relay channel");
    let addr = relay.listen("127.0.0.1:0").await.expect("relay listen");
    (relay, addr.to_string())
}

#[tokio::test]
async fn relay_echo_round_trip_with_sent_bytes() {
    let stats = MockStats::new();
    let (server, server_addr) = start_echo_server("s1").await;
    let (relay, relay_addr) =
        start_relay(stats.clone(), &server_addr, ChannelConfig::new("relay")).await;

    let client = Channel::new(ChannelConfig::new("c1")).expect("client channel");
    let arg2: Vec<u8> = (0..128 * 1024).map(|i| (i % 241) as u8).collect();
    let arg3: Vec<u8> = (0..128 * 1024).map(|i| (i % 49) as u8).collect();

    let response = client
        .call(
            &relay_addr,
            &CallOptions::new("s1", "echo").with_ttl(Duration::from_secs(10)),
            &arg2,
            &arg3,
        )
        .await
        .expect("relayed call");
    assert!(response.ok);
    assert_eq!(response.arg2, arg2, "relay must preserve bytes");
    assert_eq!(response.arg3, arg3, "relay must preserve bytes");

    // sent-bytes tracks the request's wire size within one frame of slack.
    let sent = stats.get("c1->s1::echo.sent-bytes");
    let payload = (arg2.len() + arg3.len()) as u64;
    assert!(
        sent >= payload && sent <= payload + 1024,
        "sent-bytes {sent} out of range for {payload} payload bytes"
    );
    assert_eq!(stats.get("c1->s1::echo.success"), 1);
    assert_eq!(stats.get("c1->s1::echo.end"), 1);

    // Both relay items finished.
    tokio::time::sleep(Duration::from_millis(50)).await;
    for conn in relay.connections() {
        assert_eq!(conn.relay_item_count(), 0);
        assert_eq!(conn.relay_tomb_count(), 0);
    }

    client.close().await;
    relay.close().await;
    server.close().await;
}

#[tokio::test]
async fn relay_clamps_ttl_and_times_out() {
    let stats = MockStats::new();

    // Server records the TTL it observes and then stalls past it.
    let observed: Arc<parking_lot::Mutex<Option<Duration>>> =
        Arc::new(parking_lot::Mutex::new(None));
    let server = Channel::new(ChannelConfig::new("s1")).expect("server channel");
    let sink = observed.clone();
    server.register(
        "echo",
        Arc::new(HandlerFn(move |mut call: InboundCall| {
            let sink = sink.clone();
            async move {
                *sink.lock() = Some(call.ttl());
                tokio::time::sleep(Duration::from_millis(500)).await;
                let _ = call.response().send_ok(b"", b"too late");
            }
        })),
    );
    let server_addr = server.listen("127.0.0.1:0").await.expect("listen").to_string();

    let (relay, relay_addr) = start_relay(
        stats.clone(),
        &server_addr,
        ChannelConfig::new("relay").with_relay_max_timeout(Duration::from_millis(100)),
    )
    .await;

    let client = Channel::new(ChannelConfig::new("c1")).expect("client channel");
    let started = tokio::time::Instant::now();
    let err = client
        .call(
            &relay_addr,
            &CallOptions::new("s1", "echo").with_ttl(Duration::from_secs(60)),
            b"",
            b"x",
        )
        .await
        .expect_err("clamped call should time out");
    let elapsed = started.elapsed();

    match err {
        CallError::Remote { code, .. } => assert_eq!(code, SystemErrCode::Timeout),
        other => panic!("expected relay timeout error, got {other}"),
    }
    assert!(
        elapsed < Duration::from_secs(5),
        "timeout took {elapsed:?}, clamp did not apply"
    );
    let observed = observed.lock().expect("handler should run");
    assert!(
        observed <= Duration::from_millis(100),
        "backend observed unclamped ttl {observed:?}"
    );
    assert_eq!(stats.get("c1->s1::echo.failed-timeout"), 1);

    // The late response is absorbed by a tombstone, not an unknown id.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(stats.get(stat_keys::RELAY_DROPPED) >= 1);

    client.close().await;
    relay.close().await;
    server.close().await;
}

#[tokio::test]
async fn relay_host_refusals_map_to_error_frames() {
    let stats = MockStats::new();
    let host = FuncHost::new(stats.clone(), |_conn, _caller, service, _method| {
        match service {
            "busy-svc" => HostDecision::Fail(RelayStartError::System(
                SystemErrCode::Busy,
                "try again".into(),
            )),
            "unknown-svc" => HostDecision::Fail(RelayStartError::Other("no idea".into())),
            "lost-svc" => HostDecision::NoDestination,
            _ => HostDecision::Drop,
        }
    });
    let relay = Channel::new(
        ChannelConfig::new("relay")
            .with_relay_host(host)
            .with_stats(stats.clone()),
    )
    .expect("relay channel");
    let relay_addr = relay.listen("127.0.0.1:0").await.expect("listen").to_string();

    let client = Channel::new(ChannelConfig::new("c1")).expect("client channel");

    let err = client
        .call(&relay_addr, &CallOptions::new("busy-svc", "m"), b"", b"")
        .await
        .expect_err("busy");
    assert!(matches!(
        err,
        CallError::Remote { code: SystemErrCode::Busy, .. }
    ));
    assert_eq!(stats.get("relay-busy"), 1);

    let err = client
        .call(&relay_addr, &CallOptions::new("unknown-svc", "m"), b"", b"")
        .await
        .expect_err("declined");
    assert!(matches!(
        err,
        CallError::Remote { code: SystemErrCode::Declined, .. }
    ));
    assert_eq!(stats.get(stat_keys::RELAY_DECLINED), 1);

    let err = client
        .call(&relay_addr, &CallOptions::new("lost-svc", "m"), b"", b"")
        .await
        .expect_err("no destination");
    assert!(matches!(
        err,
        CallError::Remote { code: SystemErrCode::Declined, .. }
    ));
    assert_eq!(stats.get(stat_keys::RELAY_BAD_RELAY_HOST), 1);

    // Rate-limit drop: no reply at all, the caller times out locally.
    let err = client
        .call(
            &relay_addr,
            &CallOptions::new("dropped-svc", "m").with_ttl(Duration::from_millis(100)),
            b"",
            b"",
        )
        .await
        .expect_err("dropped");
    assert!(matches!(err, CallError::Timeout));
    assert!(stats.get(stat_keys::RELAY_DROPPED) >= 1);

    client.close().await;
    relay.close().await;
}

#[tokio::test]
async fn relay_local_handlers_dispatch_locally() {
    let stats = MockStats::new();
    let relay = Channel::new(
        ChannelConfig::new("relay")
            .with_relay_host(FuncHost::fixed(stats.clone(), "127.0.0.1:1"))
            .with_relay_local_handler("relay")
            .with_stats(stats.clone()),
    )
    .expect("relay channel");
    relay.register("echo", echo_handler());
    let relay_addr = relay.listen("127.0.0.1:0").await.expect("listen").to_string();

    let client = Channel::new(ChannelConfig::new("c1")).expect("client channel");
    let response = client
        .call(&relay_addr, &CallOptions::new("relay", "echo"), b"h", b"local body")
        .await
        .expect("locally handled call");
    assert_eq!(response.arg3, b"local body");
    // Nothing was forwarded.
    assert_eq!(stats.sum_matching("sent-bytes"), 0);

    client.close().await;
    relay.close().await;
}

#[tokio::test]
async fn tombstones_are_bounded() {
    let stats = MockStats::new();

    // The backend blackholes everything, so every relayed call times out and
    // leaves tombstones behind.
    let server = Channel::new(ChannelConfig::new("s1")).expect("server channel");
    server.register(
        "void",
        Arc::new(HandlerFn(|mut call: InboundCall| async move {
            call.response().blackhole();
        })),
    );
    let server_addr = server.listen("127.0.0.1:0").await.expect("listen").to_string();

    let max_tombs = 2usize;
    let (relay, relay_addr) = start_relay(
        stats.clone(),
        &server_addr,
        ChannelConfig::new("relay")
            .with_relay_max_timeout(Duration::from_millis(50))
            .with_relay_max_tombs(max_tombs),
    )
    .await;

    let client = Channel::new(ChannelConfig::new("c1")).expect("client channel");
    let mut calls = Vec::new();
    for _ in 0..6 {
        let client = client.clone();
        let relay_addr = relay_addr.clone();
        calls.push(tokio::spawn(async move {
            client
                .call(
                    &relay_addr,
                    &CallOptions::new("s1", "void").with_ttl(Duration::from_secs(10)),
                    b"",
                    b"x",
                )
                .await
        }));
    }
    for call in calls {
        let err = call.await.expect("join").expect_err("all calls time out");
        assert!(matches!(
            err,
            CallError::Remote { code: SystemErrCode::Timeout, .. }
        ));
    }

    // Tombstones on every relay connection stay within the bound.
    tokio::time::sleep(Duration::from_millis(100)).await;
    for conn in relay.connections() {
        assert!(
            conn.relay_tomb_count() <= max_tombs,
            "tomb count {} exceeds bound {max_tombs}",
            conn.relay_tomb_count()
        );
    }

    client.close().await;
    relay.close().await;
    server.close().await;
}

#[tokio::test]
async fn frames_for_evicted_items_log_no_relay_item() {
    let (_guard, logs) = common::capture_logs();
    let stats = MockStats::new();

    // The backend blackholes, so every call times out and leaves tombstones.
    let server = Channel::new(ChannelConfig::new("s1")).expect("server channel");
    server.register(
        "void",
        Arc::new(HandlerFn(|mut call: InboundCall| async move {
            call.response().blackhole();
        })),
    );
    let server_addr = server.listen("127.0.0.1:0").await.expect("listen").to_string();

    // With a bound of one, two of the three tombstones are evicted outright.
    let (relay, relay_addr) = start_relay(
        stats.clone(),
        &server_addr,
        ChannelConfig::new("relay")
            .with_relay_max_timeout(Duration::from_millis(50))
            .with_relay_max_tombs(1),
    )
    .await;

    let mut raw = RawClient::connect(&relay_addr, "probe-client").await;
    for id in [1u32, 3, 5] {
        raw.send_call_req(id, "s1", "void", 10_000, b"", b"x").await;
    }
    for _ in 0..3 {
        let frame = raw.recv().await.expect("timeout error frame");
        assert_eq!(frame.header.message_type, MessageType::Error);
    }
    assert!(
        logs.count("Too many tombstones, deleting relay item immediately.") >= 1,
        "expected tombstone eviction"
    );

    // Late traffic: the surviving tombstone absorbs its frame with a counter;
    // the evicted ids have no relay item at all and must say so at warn.
    for id in [1u32, 3, 5] {
        let frame = common::build_call_req_continue(&raw.pool, id, b"late");
        frame.write_to(&mut raw.stream).await.expect("send late frame");
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(
        logs.count("no relay item") >= 2,
        "expected no-relay-item warnings for evicted ids"
    );
    assert!(stats.get(stat_keys::RELAY_NO_ITEM) >= 2);
    assert!(stats.get(stat_keys::RELAY_DROPPED) >= 1);

    relay.close().await;
    server.close().await;
}

#[tokio::test]
async fn relay_appends_arg2_headers() {
    let stats = MockStats::new();

    // Backend parses arg2 as Thrift-style headers and echoes them in arg3.
    let server = Channel::new(ChannelConfig::new("s1")).expect("server channel");
    server.register(
        "headers",
        Arc::new(HandlerFn(|mut call: InboundCall| async move {
            let pairs = common::parse_thrift_arg2(call.arg2());
            let rendered: Vec<String> = pairs
                .iter()
                .map(|(k, v)| {
                    format!(
                        "{}={}",
                        String::from_utf8_lossy(k),
                        String::from_utf8_lossy(v)
                    )
                })
                .collect();
            let body = rendered.join(",");
            let _ = call.response().send_ok(b"", body.as_bytes());
        })),
    );
    let server_addr = server.listen("127.0.0.1:0").await.expect("listen").to_string();

    let relay = Channel::new(
        ChannelConfig::new("relay")
            .with_relay_host(FuncHost::fixed(stats.clone(), &server_addr))
            .with_relay_frame_fn(Arc::new(|req, _conn| {
                req.append_arg2(&[(b"relay-key".as_slice(), b"relay-value".as_slice())])
            }))
            .with_stats(stats.clone()),
    )
    .expect("relay channel");
    let relay_addr = relay.listen("127.0.0.1:0").await.expect("listen").to_string();

    // Thrift-formatted call carrying one original header pair.
    let mut raw = RawClient::connect(&relay_addr, "thrift-client").await;
    let arg2 = thrift_arg2(&[(b"orig".as_slice(), b"1".as_slice())]);
    let frame = common::build_call_req_scheme(
        &raw.pool,
        1,
        "s1",
        "headers",
        5_000,
        "thrift",
        &arg2,
        b"body",
    );
    frame.write_to(&mut raw.stream).await.expect("send");

    let response = raw.recv().await.expect("response frame");
    assert_eq!(response.header.message_type, MessageType::CallRes);
    let text = String::from_utf8_lossy(response.payload()).into_owned();
    assert!(text.contains("orig=1"), "original header lost: {text}");
    assert!(
        text.contains("relay-key=relay-value"),
        "appended header missing: {text}"
    );

    relay.close().await;
    server.close().await;
}

#[tokio::test]
async fn arg2_append_fails_for_non_thrift_calls() {
    let stats = MockStats::new();
    let (server, server_addr) = start_echo_server("s1").await;

    let relay = Channel::new(
        ChannelConfig::new("relay")
            .with_relay_host(FuncHost::fixed(stats.clone(), &server_addr))
            .with_relay_frame_fn(Arc::new(|req, _conn| {
                req.append_arg2(&[(b"k".as_slice(), b"v".as_slice())])
            }))
            .with_stats(stats.clone()),
    )
    .expect("relay channel");
    let relay_addr = relay.listen("127.0.0.1:0").await.expect("listen").to_string();

    let client = Channel::new(ChannelConfig::new("c1")).expect("client channel");
    let err = client
        .call(&relay_addr, &CallOptions::new("s1", "echo"), b"h", b"b")
        .await
        .expect_err("non-thrift arg2 mutation must fail the call");
    match err {
        CallError::Remote { code, message } => {
            assert_eq!(code, SystemErrCode::UnexpectedError);
            assert!(
                message.contains("relay-arg2-modify-failed"),
                "message: {message}"
            );
            assert!(
                message.contains("cannot inspect or modify arg2 for non-Thrift calls"),
                "message: {message}"
            );
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(stats.get(stat_keys::RELAY_ARG2_MODIFY_FAILED), 1);

    client.close().await;
    relay.close().await;
    server.close().await;
}

#[tokio::test]
async fn malformed_call_res_is_logged_once_and_fails_the_call() {
    let (_guard, logs) = common::capture_logs();
    let stats = MockStats::new();

    // A raw backend that answers every call with a truncated call-res.
    let backend = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let backend_addr = backend.local_addr().expect("addr").to_string();
    tokio::spawn(async move {
        let (mut stream, _) = backend.accept().await.expect("accept");
        let pool = FramePool::new();

        // Handshake: read init-req, answer init-res.
        let init = Frame::read_from(&mut stream, &pool)
            .await
            .expect("read")
            .expect("init-req");
        assert_eq!(init.header.message_type, MessageType::InitReq);
        let mut buf = pool.get();
        InitBody::new("127.0.0.1:9", "bad-backend")
            .encode(&mut buf)
            .expect("encode");
        Frame::from_parts(FrameHeader::new(MessageType::InitRes, ID_PROTOCOL), buf)
            .write_to(&mut stream)
            .await
            .expect("write init-res");

        loop {
            let Some(frame) = Frame::read_from(&mut stream, &pool).await.expect("read") else {
                return;
            };
            if frame.header.message_type != MessageType::CallReq {
                continue;
            }
            // A call-res whose payload stops after the flags byte.
            let mut buf = pool.get();
            buf.push(CallFlags::empty().bits());
            let res = Frame::from_parts(
                FrameHeader::new(MessageType::CallRes, frame.header.id),
                buf,
            );
            res.write_to(&mut stream).await.expect("write bad res");
        }
    });

    let (relay, relay_addr) = start_relay(
        stats.clone(),
        &backend_addr,
        ChannelConfig::new("relay"),
    )
    .await;

    let client = Channel::new(ChannelConfig::new("c1")).expect("client channel");
    let err = client
        .call(
            &relay_addr,
            &CallOptions::new("s1", "echo").with_ttl(Duration::from_secs(2)),
            b"",
            b"x",
        )
        .await
        .expect_err("malformed response should fail the call");
    match err {
        CallError::Remote { code, .. } => assert_eq!(code, SystemErrCode::UnexpectedError),
        other => panic!("unexpected error {other}"),
    }

    assert_eq!(logs.count("Malformed callRes frame."), 1);
    assert_eq!(stats.get("c1->s1::echo.failed-relay-malformed-response"), 1);

    client.close().await;
    relay.close().await;
}

#[tokio::test]
async fn slow_caller_connection_records_source_conn_slow() {
    let stats = MockStats::new();

    // Echo backend with large responses.
    let (server, server_addr) = start_echo_server("s1").await;

    // Tiny send queue toward the (deliberately unread) caller socket.
    let (relay, relay_addr) = start_relay(
        stats.clone(),
        &server_addr,
        ChannelConfig::new("relay").with_send_buffer_size_override("stalled-", 1),
    )
    .await;

    // The raw client handshakes, fires off many calls with 60 KiB
    // responses, and never reads its socket.
    let mut raw = RawClient::connect(&relay_addr, "stalled-client").await;
    let body = vec![0x5A_u8; 60 * 1024];
    for i in 0..100u32 {
        raw.send_call_req(1 + 2 * i, "s1", "echo", 10_000, b"", &body).await;
    }

    // The relay must neither deadlock nor stall: the overflow shows up as a
    // source-conn-slow event well before the calls' TTL.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if stats.get(stat_keys::RELAY_SOURCE_CONN_SLOW) >= 1 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no relay-source-conn-slow event recorded"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Dropping the stalled caller lets the relay clean everything up.
    drop(raw);
    tokio::time::sleep(Duration::from_millis(200)).await;
    for conn in relay.connections() {
        assert_eq!(conn.exchange_count(), 0);
    }

    relay.close().await;
    server.close().await;
}

#[tokio::test]
async fn relay_survives_caller_cancellation() {
    let stats = MockStats::new();
    let server = Channel::new(ChannelConfig::new("s1")).expect("server channel");
    server.register(
        "slow-echo",
        Arc::new(HandlerFn(|mut call: InboundCall| async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let arg3 = call.arg3().to_vec();
            let _ = call.response().send_ok(b"", &arg3);
        })),
    );
    let server_addr = server.listen("127.0.0.1:0").await.expect("listen").to_string();

    let (relay, relay_addr) =
        start_relay(stats.clone(), &server_addr, ChannelConfig::new("relay")).await;

    // The client's TTL elapses before the backend answers; the client sends
    // a cancel, and the late response must die against a tombstone.
    let client = Channel::new(ChannelConfig::new("c1")).expect("client channel");
    let err = client
        .call(
            &relay_addr,
            &CallOptions::new("s1", "slow-echo").with_ttl(Duration::from_millis(50)),
            b"",
            b"x",
        )
        .await
        .expect_err("short ttl");
    assert!(matches!(err, CallError::Timeout));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(stats.get(stat_keys::RELAY_DROPPED) >= 1, "late response not absorbed");

    // A fresh call on the same connections still works.
    let response = client
        .call(
            &relay_addr,
            &CallOptions::new("s1", "slow-echo").with_ttl(Duration::from_secs(2)),
            b"",
            b"again",
        )
        .await
        .expect("relay still works");
    assert_eq!(response.arg3, b"again");

    client.close().await;
    relay.close().await;
    server.close().await;
}
