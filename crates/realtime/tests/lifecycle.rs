//! End-to-end lifecycle of the connection manager over an in-memory
//! transport, driven on a paused clock.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serverwatch_protocol::{ServerMessage, ServerStatus};
use serverwatch_realtime::{
    Callbacks, ConnectionError, ConnectionPhase, DisableReason, EndpointError, Subscription,
};

use support::{
    Event, Recorder, Step, advance, close_frame, config, is_ping, manager, settle,
};

const METRICS: &str = r#"{"type":"metrics_update","data":{"server_id":"srv-1","cpu_usage":41.5}}"#;
const REJECTED: &str = r#"{"type":"error","status":"error","message":"Token无效"}"#;

#[tokio::test(start_paused = true)]
async fn abnormal_closes_back_off_linearly_until_disabled() {
    let (manager, connector, mut accepted) = manager(config(5), [Step::Accept]);
    let recorder = Recorder::default();
    let _sub = manager.register_callbacks("recorder", recorder.callbacks());

    manager.connect("t");
    settle().await;
    let mut server = accepted.recv().await.unwrap();
    assert!(manager.is_connected());
    assert_eq!(manager.attempts(), 0);

    server.drop_connection();
    settle().await;
    assert_eq!(manager.attempts(), 1);

    // Every further attempt is refused; check each delay to the millisecond.
    for (expected_delay, attempts_after) in [(3000, 2), (6000, 3), (9000, 4), (9000, 5)] {
        let before = connector.attempts();
        advance(expected_delay - 1).await;
        assert_eq!(connector.attempts(), before, "fired early for {expected_delay}ms");
        advance(1).await;
        assert_eq!(connector.attempts(), before + 1, "did not fire at {expected_delay}ms");
        assert_eq!(manager.attempts(), attempts_after);
    }

    assert_eq!(
        manager.phase(),
        ConnectionPhase::Disabled {
            reason: DisableReason::RetriesExhausted
        }
    );
    let events = recorder.events();
    assert_eq!(
        events.last(),
        Some(&Event::Error(ConnectionError::RetriesExhausted { attempts: 5 }))
    );

    // No further attempts, and connect is a no-op.
    advance(120_000).await;
    manager.connect("t");
    settle().await;
    assert_eq!(connector.attempts(), 5);
    assert!(!manager.is_connected());
}

#[tokio::test(start_paused = true)]
async fn normal_close_does_not_reconnect() {
    let (manager, connector, mut accepted) = manager(config(3), [Step::Accept]);
    let recorder = Recorder::default();
    let _sub = manager.register_callbacks("recorder", recorder.callbacks());

    manager.connect("t");
    settle().await;
    let server = accepted.recv().await.unwrap();

    server.close(1000, "maintenance");
    settle().await;
    assert_eq!(manager.phase(), ConnectionPhase::Idle);
    assert_eq!(manager.attempts(), 0);
    assert!(!manager.is_connected());
    assert_eq!(recorder.take(), vec![Event::Open, Event::Close(1000)]);

    advance(60_000).await;
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn server_close_with_other_code_retries() {
    let (manager, connector, mut accepted) = manager(config(3), [Step::Accept, Step::Accept]);
    manager.connect("t");
    settle().await;
    let server = accepted.recv().await.unwrap();

    server.close(1001, "going away");
    settle().await;
    assert_eq!(manager.attempts(), 1);

    advance(3000).await;
    assert_eq!(connector.attempts(), 2);
    assert!(manager.is_connected());
    assert_eq!(manager.attempts(), 0, "open resets the counter");
}

#[tokio::test(start_paused = true)]
async fn disconnect_while_open_closes_normally_without_reconnect() {
    let (manager, connector, mut accepted) = manager(config(3), [Step::Accept]);
    let recorder = Recorder::default();
    let _sub = manager.register_callbacks("recorder", recorder.callbacks());

    manager.connect("t");
    settle().await;
    let mut server = accepted.recv().await.unwrap();

    manager.disconnect();
    assert!(!manager.is_connected());
    settle().await;

    let frames = server.received();
    assert_eq!(
        close_frame(&frames),
        Some((1000, "Manual disconnect".to_owned()))
    );
    assert_eq!(manager.phase(), ConnectionPhase::Idle);
    assert_eq!(recorder.events(), vec![Event::Open, Event::Close(1000)]);

    advance(60_000).await;
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_pending_reconnect() {
    let (manager, connector, mut accepted) = manager(config(3), [Step::Accept]);
    manager.connect("t");
    settle().await;
    let mut server = accepted.recv().await.unwrap();

    server.drop_connection();
    settle().await;
    assert!(matches!(
        manager.phase(),
        ConnectionPhase::BackingOff { attempt: 1, .. }
    ));

    manager.disconnect();
    assert_eq!(manager.phase(), ConnectionPhase::Idle);
    assert_eq!(manager.attempts(), 0);
    assert!(!manager.is_connected());

    advance(60_000).await;
    assert_eq!(connector.attempts(), 1);

    // The manager is usable again afterwards.
    connector.push(Step::Accept);
    manager.connect("t");
    settle().await;
    assert!(manager.is_connected());
}

#[tokio::test(start_paused = true)]
async fn late_subscriber_sees_open_exactly_once() {
    let (manager, _connector, mut accepted) = manager(config(3), [Step::Accept]);
    let early = Recorder::default();
    let _early = manager.register_callbacks("early", early.callbacks());

    manager.connect("t");
    settle().await;
    let _server = accepted.recv().await.unwrap();

    let late = Recorder::default();
    let _late = manager.register_callbacks("late", late.callbacks());
    assert_eq!(late.opens(), 1, "on_open runs during registration");

    settle().await;
    assert_eq!(late.opens(), 1);
    assert_eq!(early.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn subscriber_registered_while_closed_waits_for_open() {
    let (manager, _connector, mut accepted) = manager(config(3), [Step::Hang]);
    manager.connect("t");
    settle().await;

    let recorder = Recorder::default();
    let _sub = manager.register_callbacks("waiting", recorder.callbacks());
    assert_eq!(recorder.opens(), 0);
    assert!(accepted.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn credential_rejection_closes_normally_and_disables() {
    let (manager, connector, mut accepted) = manager(config(3), [Step::Accept, Step::Accept]);
    let recorder = Recorder::default();
    let _sub = manager.register_callbacks("recorder", recorder.callbacks());
    let forwarded = Arc::new(AtomicUsize::new(0));
    let f = forwarded.clone();
    let _handler = manager.register_message_handler(move |_| {
        f.fetch_add(1, Ordering::SeqCst);
    });

    manager.connect("expired");
    settle().await;
    let mut server = accepted.recv().await.unwrap();
    server.received();

    server.send_json(REJECTED);
    settle().await;

    let frames = server.received();
    assert_eq!(close_frame(&frames), Some((1000, "Token invalid".to_owned())));
    assert!(!frames.iter().any(is_ping));
    assert_eq!(
        manager.phase(),
        ConnectionPhase::Disabled {
            reason: DisableReason::CredentialRejected
        }
    );
    assert!(!manager.is_connected());
    assert_eq!(forwarded.load(Ordering::SeqCst), 0, "rejection is not forwarded");
    assert_eq!(
        recorder.take(),
        vec![
            Event::Open,
            Event::Error(ConnectionError::CredentialRejected("Token无效".into())),
            Event::Close(1000),
        ]
    );

    // Nothing is scheduled and connect is refused.
    advance(60_000).await;
    manager.connect("expired");
    settle().await;
    assert_eq!(connector.attempts(), 1);

    manager.reset_credential_rejection();
    manager.connect("fresh");
    settle().await;
    assert_eq!(connector.attempts(), 2);
    assert!(manager.is_connected());
    assert!(connector.urls()[1].as_str().ends_with("token=fresh"));
}

#[tokio::test(start_paused = true)]
async fn error_without_credential_marker_is_forwarded() {
    let (manager, _connector, mut accepted) = manager(config(3), [Step::Accept]);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    let _handler = manager.register_message_handler(move |msg| {
        s.lock().unwrap().push(msg.clone());
    });

    manager.connect("t");
    settle().await;
    let server = accepted.recv().await.unwrap();

    server.send_json(r#"{"type":"error","status":"error","message":"rate limited"}"#);
    settle().await;

    assert!(manager.is_connected());
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(matches!(&seen[0], ServerMessage::Error(n) if n.message.as_deref() == Some("rate limited")));
}

#[tokio::test(start_paused = true)]
async fn heartbeat_sends_one_ping_per_interval_while_open() {
    let (manager, _connector, mut accepted) = manager(config(3), [Step::Accept]);
    manager.connect("t");
    settle().await;
    let mut server = accepted.recv().await.unwrap();
    assert!(server.received().is_empty());

    advance(29_999).await;
    assert!(server.received().is_empty());
    advance(1).await;
    let frames = server.received();
    assert_eq!(frames.len(), 1);
    assert!(is_ping(&frames[0]));

    advance(30_000).await;
    assert_eq!(server.received().iter().filter(|f| is_ping(f)).count(), 1);

    manager.disconnect();
    advance(30_000).await;
    let frames = server.received();
    assert_eq!(frames.iter().filter(|f| is_ping(f)).count(), 0);
    assert!(close_frame(&frames).is_some());
}

#[tokio::test(start_paused = true)]
async fn heartbeat_stops_when_server_drops() {
    let (manager, _connector, mut accepted) = manager(config(3), [Step::Accept, Step::Hang]);
    manager.connect("t");
    settle().await;
    let mut server = accepted.recv().await.unwrap();

    advance(20_000).await;
    server.drop_connection();
    advance(10_000).await;
    assert!(server.received().iter().all(|f| !is_ping(f)));
}

#[tokio::test(start_paused = true)]
async fn handler_unregistered_mid_broadcast_is_skipped() {
    let (manager, _connector, mut accepted) = manager(config(3), [Step::Accept]);
    let first_calls = Arc::new(AtomicUsize::new(0));
    let second_calls = Arc::new(AtomicUsize::new(0));
    let second_sub: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

    let (calls, slot) = (first_calls.clone(), second_sub.clone());
    let _first = manager.register_message_handler(move |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        if let Some(sub) = slot.lock().unwrap().as_ref() {
            sub.cancel();
        }
    });
    let calls = second_calls.clone();
    let second = manager.register_message_handler(move |_| {
        calls.fetch_add(1, Ordering::SeqCst);
    });
    *second_sub.lock().unwrap() = Some(second);

    manager.connect("t");
    settle().await;
    let server = accepted.recv().await.unwrap();

    server.send_json(METRICS);
    server.send_json(METRICS);
    settle().await;

    assert_eq!(first_calls.load(Ordering::SeqCst), 2);
    assert_eq!(second_calls.load(Ordering::SeqCst), 0);
    assert!(manager.is_connected());
}

#[tokio::test(start_paused = true)]
async fn panicking_handler_does_not_stop_delivery() {
    let (manager, _connector, mut accepted) = manager(config(3), [Step::Accept]);
    let _bad = manager.register_message_handler(|_| panic!("handler bug"));
    let delivered = Arc::new(AtomicUsize::new(0));
    let d = delivered.clone();
    let _good = manager.register_message_handler(move |_| {
        d.fetch_add(1, Ordering::SeqCst);
    });
    let recorder = Recorder::default();
    let _sub = manager.register_callbacks(
        "recorder",
        recorder
            .callbacks()
            .on_open(|| panic!("subscriber bug")),
    );

    manager.connect("t");
    settle().await;
    let server = accepted.recv().await.unwrap();
    server.send_json(METRICS);
    settle().await;

    assert_eq!(delivered.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.events(), vec![Event::Metrics("srv-1".into())]);
    assert!(manager.is_connected());
}

#[tokio::test(start_paused = true)]
async fn typed_callbacks_and_raw_handlers_receive_messages() {
    let (manager, _connector, mut accepted) = manager(config(3), [Step::Accept]);
    let recorder = Recorder::default();
    let _sub = manager.register_callbacks("recorder", recorder.callbacks());
    let kinds = Arc::new(Mutex::new(Vec::new()));
    let k = kinds.clone();
    let _handler = manager.register_message_handler(move |msg| {
        k.lock().unwrap().push(msg.type_name().to_owned());
    });

    manager.connect("t");
    settle().await;
    let server = accepted.recv().await.unwrap();
    recorder.take();

    for json in [
        r#"{"type":"pong"}"#,
        r#"{"type":"ping"}"#,
        r#"{"type":"auth_success","message":"ok"}"#,
        METRICS,
        r#"{"type":"metrics_realtime","data":{"server_id":"srv-2","timestamp":1700000000000}}"#,
        r#"{"type":"system_info_update","data":{"server_id":"srv-3","data":{"os":"linux"}}}"#,
        r#"{"type":"server_status_update","data":{"server_id":"srv-4","status":"offline"}}"#,
        "not json at all",
        r#"{"type":"metrics_update","data":{"cpu_usage":"high"}}"#,
        r#"{"type":"alert_fired","data":{"rule":"cpu"}}"#,
    ] {
        server.send_json(json);
    }
    settle().await;

    assert_eq!(
        *kinds.lock().unwrap(),
        vec![
            "auth_success",
            "metrics_update",
            "metrics_realtime",
            "system_info_update",
            "server_status_update",
            "alert_fired",
        ]
    );
    assert_eq!(
        recorder.take(),
        vec![
            Event::Metrics("srv-1".into()),
            Event::Realtime("srv-2".into(), 1_700_000_000_000),
            Event::SystemInfo("srv-3".into()),
            Event::Status("srv-4".into(), ServerStatus::Offline),
        ]
    );
    assert!(manager.is_connected(), "malformed frames never disconnect");
}

#[tokio::test(start_paused = true)]
async fn connect_timeout_aborts_attempt() {
    let (manager, connector, _accepted) = manager(config(3), [Step::Hang]);
    let recorder = Recorder::default();
    let _sub = manager.register_callbacks("recorder", recorder.callbacks());

    manager.connect("t");
    advance(9_999).await;
    assert_eq!(manager.phase(), ConnectionPhase::Connecting { attempt: 1 });

    advance(1).await;
    assert_eq!(
        recorder.take(),
        vec![
            Event::Error(ConnectionError::ConnectTimeout(Duration::from_secs(10))),
            Event::Close(1006),
        ]
    );
    assert!(matches!(
        manager.phase(),
        ConnectionPhase::BackingOff { attempt: 1, .. }
    ));
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn refused_connection_reports_error_then_close() {
    let (manager, _connector, _accepted) = manager(config(3), [Step::Refuse]);
    let recorder = Recorder::default();
    let _sub = manager.register_callbacks("recorder", recorder.callbacks());

    manager.connect("t");
    settle().await;

    let events = recorder.take();
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], Event::Error(ConnectionError::Transport(_))));
    assert_eq!(events[1], Event::Close(1006));
    assert_eq!(manager.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn endpoint_failure_retries_then_disables() {
    let mut config = config(3);
    config.endpoint.origin = "https://dash.example.com".into();
    config.endpoint.override_url = Some("ws://dash.example.com/ws".into());
    let (manager, connector, _accepted) = manager(config, std::iter::empty::<Step>());
    let recorder = Recorder::default();
    let _sub = manager.register_callbacks("recorder", recorder.callbacks());

    manager.connect("t");
    advance(3000).await;
    advance(6000).await;

    let insecure = Event::Error(ConnectionError::Endpoint(EndpointError::InsecureOverride));
    assert_eq!(
        recorder.events(),
        vec![
            insecure.clone(),
            insecure.clone(),
            insecure,
            Event::Error(ConnectionError::RetriesExhausted { attempts: 3 }),
        ]
    );
    assert_eq!(connector.attempts(), 0);
    assert_eq!(
        manager.phase(),
        ConnectionPhase::Disabled {
            reason: DisableReason::RetriesExhausted
        }
    );
}

#[tokio::test(start_paused = true)]
async fn connect_is_idempotent_while_open() {
    let (manager, connector, mut accepted) = manager(config(3), [Step::Accept, Step::Accept]);
    manager.connect("t");
    settle().await;
    let _server = accepted.recv().await.unwrap();

    manager.connect("t");
    manager.connect("other");
    settle().await;
    assert_eq!(connector.attempts(), 1);
    assert!(connector.urls()[0].as_str().ends_with("/api/ws/frontend?token=t"));
}

#[tokio::test(start_paused = true)]
async fn watch_connected_tracks_transport() {
    let (manager, _connector, mut accepted) = manager(config(3), [Step::Accept]);
    let mut connected = manager.watch_connected();
    assert!(!*connected.borrow_and_update());

    manager.connect("t");
    settle().await;
    assert!(connected.has_changed().unwrap());
    assert!(*connected.borrow_and_update());
    let mut server = accepted.recv().await.unwrap();

    server.drop_connection();
    settle().await;
    assert!(connected.has_changed().unwrap());
    assert!(!*connected.borrow_and_update());
}

#[tokio::test(start_paused = true)]
async fn shutdown_drops_registrations() {
    let (manager, connector, mut accepted) = manager(config(3), [Step::Accept]);
    let recorder = Recorder::default();
    let sub = manager.register_callbacks("recorder", recorder.callbacks());

    manager.connect("t");
    settle().await;
    let _server = accepted.recv().await.unwrap();
    recorder.take();

    manager.shutdown();
    settle().await;
    assert!(!sub.is_active());
    assert!(recorder.events().is_empty(), "no callbacks after shutdown");
    assert_eq!(manager.phase(), ConnectionPhase::Idle);

    advance(60_000).await;
    assert_eq!(connector.attempts(), 1);
    sub.cancel();
}

#[tokio::test(start_paused = true)]
async fn replaced_subscriber_no_longer_receives() {
    let (manager, _connector, mut accepted) = manager(config(3), [Step::Accept]);
    let old = Recorder::default();
    let new = Recorder::default();
    let _old = manager.register_callbacks("dashboard", old.callbacks());
    let _new = manager.register_callbacks("dashboard", new.callbacks());

    manager.connect("t");
    settle().await;
    let server = accepted.recv().await.unwrap();
    server.send_json(METRICS);
    settle().await;

    assert!(old.events().is_empty());
    assert_eq!(new.events(), vec![Event::Open, Event::Metrics("srv-1".into())]);
}

#[tokio::test(start_paused = true)]
async fn unregistering_last_subscriber_keeps_connection() {
    let (manager, _connector, mut accepted) = manager(config(3), [Step::Accept]);
    let sub = manager.register_callbacks("only", Callbacks::new());
    manager.connect("t");
    settle().await;
    let _server = accepted.recv().await.unwrap();

    sub.cancel();
    settle().await;
    assert!(manager.is_connected());
}

#[tokio::test(start_paused = true)]
async fn reset_from_rejection_error_callback_reenables_connect() {
    let (manager, connector, mut accepted) = manager(config(3), [Step::Accept, Step::Accept]);
    let recorder = Recorder::default();
    let _sub = manager.register_callbacks("recorder", recorder.callbacks());

    // A credential owner that re-authenticates as soon as it hears about
    // the rejection, before the close has been processed.
    let owner = manager.clone();
    let _auth = manager.register_callbacks(
        "auth",
        Callbacks::new().on_error(move |e| {
            if matches!(e, ConnectionError::CredentialRejected(_)) {
                owner.reset_credential_rejection();
            }
        }),
    );

    manager.connect("expired");
    settle().await;
    let mut server = accepted.recv().await.unwrap();
    server.received();

    server.send_json(REJECTED);
    settle().await;

    let frames = server.received();
    assert_eq!(close_frame(&frames), Some((1000, "Token invalid".to_owned())));
    assert_eq!(manager.phase(), ConnectionPhase::Idle);
    assert_eq!(manager.attempts(), 0);

    // Nothing reconnects on its own.
    advance(60_000).await;
    assert_eq!(connector.attempts(), 1);

    manager.connect("fresh");
    settle().await;
    assert_eq!(connector.attempts(), 2);
    assert!(manager.is_connected());
    assert!(connector.urls()[1].as_str().ends_with("token=fresh"));
}

#[tokio::test(start_paused = true)]
async fn connect_right_after_disconnect_is_ignored_until_closed() {
    let (manager, connector, mut accepted) = manager(config(3), [Step::Accept, Step::Accept]);
    manager.connect("t");
    settle().await;
    let _server = accepted.recv().await.unwrap();

    manager.disconnect();
    manager.connect("t2");
    assert!(matches!(manager.phase(), ConnectionPhase::Closing { .. }));
    settle().await;
    assert_eq!(manager.phase(), ConnectionPhase::Idle);
    assert_eq!(connector.attempts(), 1);

    // Once the close has landed, connect works again.
    manager.connect("t2");
    settle().await;
    assert_eq!(connector.attempts(), 2);
    assert!(manager.is_connected());
}
