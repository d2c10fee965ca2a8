//! End-to-end protocol tests against scripted fake transports.

use magrig::{
    Coil, DeviceArbiter, HandlerStatus, MockTransport, MoveOutcome, RigConfig, RigError,
    Transport, UnmatchedPolicy,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn test_config() -> RigConfig {
    let mut config = RigConfig::example();
    config.global.command_timeout_ms = 200;
    config.global.move_timeout_ms = 500;
    config.degausser.delay_s = 1;
    config.degausser.ramp_timeout_ms = 2000;
    config
}

struct Rig {
    arbiter: DeviceArbiter,
    handler: Arc<MockTransport>,
    degausser: Arc<MockTransport>,
    magnetometer: Arc<MockTransport>,
}

fn open_rig(config: &RigConfig) -> Rig {
    let (handler, handler_rx) = MockTransport::new("/dev/handler");
    let (degausser, degausser_rx) = MockTransport::new("/dev/degausser");
    let (magnetometer, magnetometer_rx) = MockTransport::new("/dev/squid");

    let arbiter = DeviceArbiter::with_transports(
        config,
        (Arc::clone(&handler) as Arc<dyn Transport>, handler_rx),
        (Arc::clone(&degausser) as Arc<dyn Transport>, degausser_rx),
        (Arc::clone(&magnetometer) as Arc<dyn Transport>, magnetometer_rx),
    );
    Rig {
        arbiter,
        handler,
        degausser,
        magnetometer,
    }
}

#[tokio::test]
async fn move_then_join_reports_complete_with_target_position() {
    let rig = open_rig(&test_config());
    rig.handler
        .set_responder(|cmd| if cmd == "F" { vec!["5".to_string()] } else { vec![] });

    let handler = rig.arbiter.handler();
    handler.move_to_pos(4000).await.unwrap();
    assert_eq!(handler.join().await.unwrap(), MoveOutcome::Complete);
    assert_eq!(handler.get_position(), Some(4000));
}

#[tokio::test]
async fn hard_limit_stop_is_distinct_from_complete() {
    let rig = open_rig(&test_config());
    rig.handler
        .set_responder(|cmd| if cmd == "F" { vec!["7".to_string()] } else { vec![] });

    let handler = rig.arbiter.handler();
    handler.move_to_pos(4000).await.unwrap();
    let outcome = handler.join().await.unwrap();
    assert_eq!(outcome, MoveOutcome::HardLimit);
    assert_ne!(outcome, MoveOutcome::Complete);
    assert_eq!(handler.get_position(), None);
}

#[tokio::test]
async fn unsolicited_completion_frame_satisfies_join() {
    // The controller reports "5" before join gets around to asking.
    let rig = open_rig(&test_config());
    let handler = rig.arbiter.handler();
    handler.move_to_pos(123).await.unwrap();
    rig.handler.inject("5");
    assert_eq!(handler.join().await.unwrap(), MoveOutcome::Complete);
    assert_eq!(handler.get_position(), Some(123));
}

#[tokio::test]
async fn rotation_of_370_matches_rotation_of_10() {
    let config = test_config();
    let rig_a = open_rig(&config);
    let rig_b = open_rig(&config);

    rig_a.arbiter.handler().rotate_to(370.0).await.unwrap();
    rig_b.arbiter.handler().rotate_to(10.0).await.unwrap();
    assert_eq!(rig_a.handler.written_lines(), rig_b.handler.written_lines());
}

#[tokio::test]
async fn out_of_range_positions_never_reach_the_wire() {
    let rig = open_rig(&test_config());
    let handler = rig.arbiter.handler();

    assert!(matches!(
        handler.move_to_pos(0).await,
        Err(RigError::InvalidParameter { .. })
    ));
    assert!(matches!(
        handler.move_to_pos(16_777_216).await,
        Err(RigError::InvalidParameter { .. })
    ));
    assert!(rig.handler.written_lines().is_empty());

    // Boundary values are accepted.
    handler.move_to_pos(16_777_215).await.unwrap();
    assert_eq!(
        rig.handler.written_lines(),
        vec!["P16777215".to_string(), "G".to_string()]
    );
}

#[tokio::test]
async fn query_timeout_is_bounded_and_leaves_client_usable() {
    let rig = open_rig(&test_config());
    let handler = rig.arbiter.handler();

    let start = Instant::now();
    let err = handler.read_register('P').await.unwrap_err();
    let elapsed = start.elapsed();
    assert!(matches!(err, RigError::Timeout { .. }));
    // 200ms deadline with scheduling slack.
    assert!(elapsed < Duration::from_millis(600), "took {:?}", elapsed);

    // The client still answers the next query.
    rig.handler
        .set_responder(|cmd| if cmd == "VP" { vec!["42".to_string()] } else { vec![] });
    assert_eq!(handler.read_register('P').await.unwrap(), 42);
}

#[tokio::test]
async fn queries_on_one_client_serialize_under_load() {
    let rig = open_rig(&test_config());
    // Firmware echoes a numbered response for each numbered register poll.
    let counter = Arc::new(AtomicUsize::new(0));
    rig.handler.set_responder(move |cmd| {
        if cmd == "VP" {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            vec![format!("{}", n)]
        } else {
            vec![]
        }
    });

    let handler = Arc::clone(rig.arbiter.handler());
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let handler = Arc::clone(&handler);
        tasks.push(tokio::spawn(async move { handler.read_register('P').await }));
    }

    let mut values = Vec::new();
    for task in tasks {
        values.push(task.await.unwrap().unwrap());
    }
    values.sort_unstable();
    // Every query got its own response exactly once: strict ordering, no
    // interleaving, no lost or duplicated matches.
    assert_eq!(values, (0..8).collect::<Vec<i64>>());
}

#[tokio::test]
async fn degausser_full_cycle_and_validation() {
    let rig = open_rig(&test_config());
    let phase = Arc::new(AtomicUsize::new(0));
    rig.degausser.set_responder(move |cmd| match cmd {
        c if c.starts_with("DC") => vec!["DONE".to_string()],
        "DERU" => {
            phase.store(1, Ordering::SeqCst);
            vec![]
        }
        "DERD" => {
            phase.store(0, Ordering::SeqCst);
            vec![]
        }
        "DSS" => {
            if phase.load(Ordering::SeqCst) == 1 {
                vec!["T".to_string()]
            } else {
                vec!["Z".to_string()]
            }
        }
        _ => vec![],
    });

    let degausser = rig.arbiter.degausser();
    degausser.demagnetize(Coil::X, 1000).await.unwrap();
    let written = rig.degausser.written_lines();
    assert_eq!(written[0], "DCCX");
    assert_eq!(written[1], "DCA1000");

    // Out-of-range amplitude writes nothing further.
    rig.degausser.clear_written();
    assert!(degausser.demagnetize_z(3001).await.is_err());
    assert!(rig.degausser.written_lines().is_empty());
}

#[tokio::test]
async fn magnetometer_read_data_is_calibrated() {
    let mut config = test_config();
    config.magnetometer.calibration.x = 0.5;
    config.magnetometer.calibration.y = 1.0;
    config.magnetometer.calibration.z = 2.0;
    config.magnetometer.volts_per_flux_quantum = 4.0;
    let rig = open_rig(&config);

    rig.magnetometer.set_responder(|cmd| match cmd {
        "XDC" | "YDC" | "ZDC" => vec!["100".to_string()],
        "XDD" | "YDD" | "ZDD" => vec!["2.0".to_string()],
        _ => vec![],
    });

    let reading = rig.arbiter.magnetometer().read_data().await.unwrap();
    assert_eq!(reading.x, (100.0 + 0.5) * 0.5);
    assert_eq!(reading.y, (100.0 + 0.5) * 1.0);
    assert_eq!(reading.z, (100.0 + 0.5) * 2.0);
}

#[tokio::test]
async fn magnetometer_settings_queries_cover_all_axes() {
    let rig = open_rig(&test_config());
    rig.magnetometer.set_responder(|cmd| match cmd {
        "XDS" | "YDS" | "ZDS" => vec!["F2R3SELC".to_string()],
        _ => vec![],
    });

    let magnetometer = rig.arbiter.magnetometer();
    assert_eq!(magnetometer.get_filters().await.unwrap(), [2, 2, 2]);
    assert_eq!(magnetometer.get_range().await.unwrap(), [3, 3, 3]);
    let written = rig.magnetometer.written_lines();
    assert!(written.contains(&"XDS".to_string()));
    assert!(written.contains(&"YDS".to_string()));
    assert!(written.contains(&"ZDS".to_string()));
}

#[tokio::test]
async fn devices_proceed_in_parallel() {
    // A handler waiting on a move does not block a magnetometer readout.
    let rig = open_rig(&test_config());
    rig.magnetometer.set_responder(|cmd| match cmd {
        "XDC" | "YDC" | "ZDC" => vec!["1".to_string()],
        "XDD" | "YDD" | "ZDD" => vec!["0.0".to_string()],
        _ => vec![],
    });

    let handler = Arc::clone(rig.arbiter.handler());
    handler.move_to_pos(500).await.unwrap();
    let join_task = tokio::spawn(async move { handler.join().await });

    // Readout completes while the move is still pending.
    let reading = rig.arbiter.magnetometer().read_data().await.unwrap();
    assert_eq!(reading.x, 1.0);
    assert_eq!(rig.arbiter.handler().get_status(), HandlerStatus::Indexing);

    rig.handler.inject("5");
    assert_eq!(join_task.await.unwrap().unwrap(), MoveOutcome::Complete);
}

#[tokio::test]
async fn failed_transport_fails_health_check() {
    let rig = open_rig(&test_config());
    rig.magnetometer.set_responder(|cmd| match cmd {
        "XDS" => vec!["F1R1SELC".to_string()],
        _ => vec![],
    });
    assert!(rig.arbiter.magnetometer().is_ok().await);

    rig.magnetometer.set_connected(false);
    assert!(!rig.arbiter.magnetometer().is_ok().await);
}

#[tokio::test]
async fn raw_query_respects_unmatched_policy() {
    let (mock, rx) = MockTransport::new("/dev/raw");
    let client = magrig::ProtocolClient::new("raw", Arc::clone(&mock) as Arc<dyn Transport>, rx);

    // Noise before the real response is discarded under Discard policy.
    mock.set_responder(|cmd| {
        if cmd == "DSS" {
            vec!["junk".to_string(), "Z".to_string()]
        } else {
            vec![]
        }
    });
    let frame = client
        .query("DSS", |r| r == "Z", Duration::from_millis(200), UnmatchedPolicy::Discard)
        .await
        .unwrap();
    assert_eq!(frame.text, "Z");
}
