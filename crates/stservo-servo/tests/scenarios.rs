use std::time::Duration;

use stservo_bus::sim::SimulatedBus;
use stservo_proto::{Instruction, Register, ServoPhase};
use stservo_bus::RegistryError;
use stservo_servo::{CommandError, HostConfig, HostError, ServoError, ServoHost};

const CONFIG: &str = r#"
[servo.gripper]
serial = "/dev/ttyUSB0"
servo_id = 1
position_min = 500
position_max = 3500

[servo.pan]
serial = "/dev/ttyUSB0"
servo_id = 2
"#;

async fn host(sim: &SimulatedBus) -> ServoHost {
    sim.add_servo(1, 2048);
    sim.add_servo(2, 1000);
    let cfg = HostConfig::from_toml_str(CONFIG).unwrap();
    let host =
        ServoHost::from_config_with(&cfg, |port, baud, s| sim.spawn_bus(port, baud, s.clone()))
            .unwrap();
    host.connect().await.unwrap();
    host
}

#[tokio::test(start_paused = true)]
async fn servos_on_one_port_share_a_bus() {
    let sim = SimulatedBus::new();
    let host = host(&sim).await;
    assert_eq!(host.buses().iter().count(), 1);
    assert_eq!(host.status("pan").unwrap().position, Some(1000));
}

#[tokio::test]
async fn serial_host_opens_one_bus_per_port() {
    let cfg = HostConfig::from_toml_str(&CONFIG.replace("/dev/ttyUSB0", "/dev/stservo-absent"))
        .unwrap();
    let host = ServoHost::from_config(&cfg).unwrap();
    let ports: Vec<&str> = host.buses().iter().map(|(port, _)| port).collect();
    assert_eq!(ports, vec!["/dev/stservo-absent"]);

    let mismatched = format!("{CONFIG}baudrate = 115200\n");
    let cfg = HostConfig::from_toml_str(&mismatched).unwrap();
    match ServoHost::from_config(&cfg) {
        Err(HostError::Bus(RegistryError::BaudMismatch { requested: 115_200, .. })) => {}
        other => panic!("expected baud mismatch, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn move_and_wait_reports_arrival() {
    let sim = SimulatedBus::new();
    let host = host(&sim).await;
    host.ready().await;
    host.dispatch("STSERVO_ENABLE SERVO=gripper").await.unwrap();

    let resp = host.dispatch("STSERVO_MOVE SERVO=gripper POSITION=3000 WAIT=2").await.unwrap();
    assert_eq!(resp.lines[0], "Moving gripper to position 3000 (speed=3400, accel=254)");
    assert_eq!(resp.lines[1], "gripper reached position 3000");
    let status = resp.status.unwrap();
    assert_eq!(status.position, Some(3000));
    assert!(!status.is_moving);
    assert_eq!(status.state, ServoPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn move_and_wait_times_out_without_cancelling_motion() {
    let sim = SimulatedBus::new();
    let host = host(&sim).await;
    host.ready().await;
    host.dispatch("STSERVO_ENABLE SERVO=gripper").await.unwrap();
    sim.hold_motion(1, true);

    let err = host
        .dispatch("STSERVO_MOVE SERVO=gripper POSITION=3000 WAIT=2")
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::Servo(ServoError::Timeout { target: 3000, .. })), "{err}");
    assert_eq!(err.kind(), "TimeoutError");

    let st = host.status("gripper").unwrap();
    assert!(st.is_moving);
    assert_eq!(st.target_position, Some(3000));

    sim.hold_motion(1, false);
    tokio::time::sleep(Duration::from_secs(2)).await;
    let st = host.status("gripper").unwrap();
    assert!(!st.is_moving);
    assert_eq!(st.position, Some(3000));
}

/// Register addresses of every write frame the simulator has seen.
fn written_registers(sim: &SimulatedBus) -> Vec<u8> {
    sim.frames()
        .iter()
        .map(|raw| stservo_proto::decode(raw).unwrap())
        .filter(|p| p.code == Instruction::Write as u8)
        .map(|p| p.params[0])
        .collect()
}

#[tokio::test(start_paused = true)]
async fn dropping_a_wait_leaves_the_move_running() {
    let sim = SimulatedBus::new();
    let host = host(&sim).await;
    host.ready().await;
    host.dispatch("STSERVO_ENABLE SERVO=gripper").await.unwrap();
    sim.hold_motion(1, true);
    sim.clear_frames();

    let abandoned = tokio::time::timeout(
        Duration::from_millis(500),
        host.dispatch("STSERVO_MOVE SERVO=gripper POSITION=3000 WAIT=5"),
    )
    .await;
    assert!(abandoned.is_err());
    tokio::time::sleep(Duration::from_secs(2)).await;

    let st = host.status("gripper").unwrap();
    assert!(st.is_moving);
    assert_eq!(st.state, ServoPhase::Moving);
    assert_eq!(st.target_position, Some(3000));
    assert_eq!(written_registers(&sim), vec![Register::Acceleration as u8]);
    assert_eq!(sim.torque_enabled(1), Some(true));

    let resp = host.dispatch("STSERVO_STATUS SERVO=pan").await.unwrap();
    assert_eq!(resp.status.unwrap().position, Some(1000));
    let resp = host.dispatch("STSERVO_STOP SERVO=gripper").await.unwrap();
    assert!(resp.lines[0].starts_with("Stopped gripper at position"), "{:?}", resp.lines);
}

#[tokio::test(start_paused = true)]
async fn oversized_wait_is_rejected_without_bus_traffic() {
    let sim = SimulatedBus::new();
    let host = host(&sim).await;
    host.dispatch("STSERVO_ENABLE SERVO=gripper").await.unwrap();
    sim.clear_frames();

    for wait in ["1e300", "1e19"] {
        let line = format!("STSERVO_MOVE SERVO=gripper POSITION=3000 WAIT={wait}");
        let err = host.dispatch(&line).await.unwrap_err();
        assert_eq!(err.kind(), "RangeError");
        assert!(matches!(err, CommandError::Range { key: "WAIT", .. }), "{err}");
    }
    assert!(sim.frames().is_empty());
    assert!(!host.status("gripper").unwrap().is_moving);
}

#[tokio::test(start_paused = true)]
async fn out_of_bounds_move_is_rejected_without_bus_traffic() {
    let sim = SimulatedBus::new();
    let host = host(&sim).await;
    host.dispatch("STSERVO_ENABLE SERVO=gripper").await.unwrap();
    let before = host.servo("gripper").unwrap().snapshot();
    sim.clear_frames();

    let err = host.dispatch("STSERVO_MOVE SERVO=gripper POSITION=4000").await.unwrap_err();
    assert_eq!(err.kind(), "RangeError");
    assert!(sim.frames().is_empty());

    let after = host.servo("gripper").unwrap().snapshot();
    assert_eq!(after.lifecycle, before.lifecycle);
    assert_eq!(after.target_position, before.target_position);
    assert!(!after.is_moving);
}

#[tokio::test(start_paused = true)]
async fn valid_move_sets_moving_and_target() {
    let sim = SimulatedBus::new();
    let host = host(&sim).await;
    host.dispatch("ST3215_ENABLE SERVO=pan").await.unwrap();

    for (pos, speed, accel) in [(0, 0, 0), (4095, 3400, 254), (1234, 100, 10)] {
        let line = format!("STSERVO_MOVE SERVO=pan POSITION={pos} SPEED={speed} ACCEL={accel}");
        host.dispatch(&line).await.unwrap();
        let st = host.status("pan").unwrap();
        assert_eq!(st.state, ServoPhase::Moving);
        assert_eq!(st.target_position, Some(pos));
        assert!(st.is_moving);
    }
}

#[tokio::test(start_paused = true)]
async fn disable_twice_is_idempotent() {
    let sim = SimulatedBus::new();
    let host = host(&sim).await;
    host.dispatch("STSERVO_ENABLE SERVO=gripper").await.unwrap();

    for _ in 0..2 {
        let resp = host.dispatch("STSERVO_DISABLE SERVO=gripper").await.unwrap();
        assert_eq!(resp.lines, vec!["Disabled gripper".to_string()]);
        assert_eq!(host.status("gripper").unwrap().state, ServoPhase::Disabled);
    }
    assert_eq!(sim.torque_enabled(1), Some(false));
}

#[tokio::test(start_paused = true)]
async fn critical_temperature_blocks_moves_until_reenabled() {
    let sim = SimulatedBus::new();
    let host = host(&sim).await;
    host.ready().await;
    host.dispatch("STSERVO_ENABLE SERVO=gripper").await.unwrap();

    sim.set_temperature(1, 85);
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let st = host.status("gripper").unwrap();
    assert_eq!(st.state, ServoPhase::Faulted);
    assert!(!st.enabled);

    let err = host.dispatch("STSERVO_MOVE SERVO=gripper POSITION=1000").await.unwrap_err();
    assert_eq!(err.kind(), "SafetyShutdown");

    sim.set_temperature(1, 40);
    host.dispatch("STSERVO_ENABLE SERVO=gripper").await.unwrap();
    host.dispatch("STSERVO_MOVE SERVO=gripper POSITION=1000").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn status_and_set_position_commands() {
    let sim = SimulatedBus::new();
    let host = host(&sim).await;

    let resp = host.dispatch("STSERVO_SET_POSITION SERVO=gripper POSITION=2000").await.unwrap();
    assert_eq!(resp.lines, vec!["Set gripper position to 2000".to_string()]);

    let resp = host.dispatch("STSERVO_STATUS SERVO=gripper").await.unwrap();
    assert_eq!(resp.lines[0], "gripper Status:");
    assert!(resp.lines.contains(&"  Position: 2000".to_string()));
    assert_eq!(resp.status.unwrap().position, Some(2000));

    let err = host.dispatch("STSERVO_STATUS SERVO=wrist").await.unwrap_err();
    assert!(matches!(err, CommandError::UnknownServo(_)));
}

#[tokio::test(start_paused = true)]
async fn shutdown_disables_every_servo() {
    let sim = SimulatedBus::new();
    let host = host(&sim).await;
    host.dispatch("STSERVO_ENABLE SERVO=gripper").await.unwrap();
    host.dispatch("STSERVO_ENABLE SERVO=pan").await.unwrap();

    host.shutdown().await;
    assert_eq!(sim.torque_enabled(1), Some(false));
    assert_eq!(sim.torque_enabled(2), Some(false));
    assert!(host.status_all().values().all(|s| s.state == ServoPhase::Disabled));
}
