use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use microscan::arbiter::ArbiterState;
use microscan::config_loader::{CaptureMode, HostSettings, ScanConfig};
use microscan::control::ControlSurface;
use microscan::controller::{BusyReason, ScanRunState, StartOutcome, StopOutcome, MANIFEST_FILE};
use microscan::mock::{Event, EventLog, MemorySink, SimCameraFactory, SimStage};
use microscan::motion::AxisTarget;
use microscan::offload::DiskSink;
use microscan::preview::PreviewOutcome;

fn host(data_dir: &Path) -> HostSettings {
    HostSettings {
        data_dir: data_dir.to_path_buf(),
        settle_ms: 0,
        flush_timeout_secs: 5,
        ..Default::default()
    }
}

fn scan_config(out: &Path) -> ScanConfig {
    ScanConfig {
        start_x: 0.0,
        start_y: 0.0,
        end_x: 10.0,
        end_y: 10.0,
        step_size_x: 5.0,
        step_size_y: 5.0,
        stack_start_z: 5.0,
        stack_end_z: 0.0,
        stack_frames: 150,
        framerate: 10.0,
        output_folder: out.to_path_buf(),
        sample_name: "e2e".into(),
        ..Default::default()
    }
}

fn surface_with_stage(data_dir: &Path, log: &EventLog, stage: SimStage) -> ControlSurface {
    ControlSurface::new(
        host(data_dir),
        Arc::new(stage),
        Arc::new(SimCameraFactory::new(log.clone())),
        Arc::new(MemorySink::new(log.clone())),
    )
}

fn xy_moves(log: &EventLog) -> Vec<(f64, f64)> {
    log.moves()
        .into_iter()
        .filter_map(|t| match (t.x, t.y) {
            (Some(x), Some(y)) => Some((x, y)),
            _ => None,
        })
        .collect()
}

fn move_speeds_to(log: &EventLog, target: AxisTarget) -> Vec<f64> {
    log.snapshot()
        .into_iter()
        .filter_map(|e| match e {
            Event::MoveStart { target: t, speed } if t == target => Some(speed),
            _ => None,
        })
        .collect()
}

#[test]
fn two_by_two_scan_visits_zig_zag_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let log = EventLog::new();
    let control = surface_with_stage(dir.path(), &log, SimStage::new(log.clone()));

    let outcome = control.start_scan(scan_config(dir.path())).unwrap();
    assert!(matches!(outcome, StartOutcome::Started { points: 4, .. }), "{:?}", outcome);
    control.wait_for_scan();

    assert_eq!(xy_moves(&log), vec![(0.0, 0.0), (5.0, 0.0), (5.0, 5.0), (0.0, 5.0)]);

    let sweeps = move_speeds_to(&log, AxisTarget::z(0.0));
    assert_eq!(sweeps.len(), 4);
    assert!(sweeps.iter().all(|s| (s - 20.0).abs() < 1e-9));

    let moves = log.moves();
    assert_eq!(moves.first(), Some(&AxisTarget::z(7.0)));
    assert_eq!(moves.last(), Some(&AxisTarget::z(10.0)));

    assert_eq!(log.labels_written(), vec!["point_00_00", "point_00_01", "point_01_01", "point_01_00"]);

    let status = control.scan_status();
    assert_eq!(status.state, ScanRunState::Idle);
    assert_eq!((status.points_done, status.points_total), (4, 4));
    assert!(status.last_error.is_none());
    assert_eq!(control.arbiter_state(), ArbiterState::Free);
    assert!(dir.path().join("e2e").join(MANIFEST_FILE).is_file());
}

#[test]
fn start_while_preview_holds_camera_is_busy() {
    let dir = tempfile::tempdir().unwrap();
    let log = EventLog::new();
    let control = surface_with_stage(dir.path(), &log, SimStage::new(log.clone()));

    assert_eq!(control.toggle_preview(true).unwrap(), PreviewOutcome::Started);
    let outcome = control.start_scan(scan_config(dir.path())).unwrap();
    assert_eq!(outcome, StartOutcome::Busy(BusyReason::CameraHeld(ArbiterState::HeldByStream)));
    assert_eq!(control.scan_status().state, ScanRunState::Idle);
    assert!(log.moves().is_empty());

    control.toggle_preview(false).unwrap();
    assert!(matches!(control.start_scan(scan_config(dir.path())).unwrap(), StartOutcome::Started { .. }));
    control.wait_for_scan();
}

#[test]
fn stop_during_run_ends_within_one_point() {
    let dir = tempfile::tempdir().unwrap();
    let log = EventLog::new();
    let stage = SimStage::new(log.clone()).with_move_delay(Duration::from_millis(50));
    let control = surface_with_stage(dir.path(), &log, stage);

    control.start_scan(scan_config(dir.path())).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while control.scan_status().points_done < 1 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }

    let stopped_at = Instant::now();
    assert_eq!(control.stop_scan(), StopOutcome::Stopping);
    assert_eq!(control.scan_status().state, ScanRunState::Stopping);
    control.wait_for_scan();
    // one point is four 50 ms moves; cleanup adds a lift
    assert!(stopped_at.elapsed() < Duration::from_millis(800), "{:?}", stopped_at.elapsed());

    let status = control.scan_status();
    assert_eq!(status.state, ScanRunState::Idle);
    assert!(!status.worker_alive);
    assert!(status.points_done < 4);
    assert!(status.last_error.is_none());
    assert_eq!(control.arbiter_state(), ArbiterState::Free);
    assert_eq!(log.moves().last(), Some(&AxisTarget::z(10.0)));
}

#[test]
fn stop_and_force_release_when_idle_are_noops() {
    let dir = tempfile::tempdir().unwrap();
    let log = EventLog::new();
    let control = surface_with_stage(dir.path(), &log, SimStage::new(log.clone()));

    assert_eq!(control.stop_scan(), StopOutcome::NotRunning);
    assert_eq!(control.force_release(), ArbiterState::Free);
    assert_eq!(control.arbiter_state(), ArbiterState::Free);
    assert_eq!(control.scan_status().state, ScanRunState::Idle);
    assert!(log.snapshot().is_empty());
}

#[test]
fn failed_move_aborts_run_through_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let log = EventLog::new();
    // lift, then point 0: xy, z, sweep, return; move 6 is point 1's XY move
    let stage = SimStage::new(log.clone()).failing_on_move(6);
    let control = surface_with_stage(dir.path(), &log, stage);

    control.start_scan(scan_config(dir.path())).unwrap();
    control.wait_for_scan();

    let status = control.scan_status();
    assert_eq!(status.state, ScanRunState::Idle);
    assert_eq!(status.points_done, 1);
    let err = status.last_error.expect("failure should be reported");
    assert!(err.contains("Point (0, 1)"), "{}", err);
    assert_eq!(control.arbiter_state(), ArbiterState::Free);

    let camera_stop = log.position(|e| *e == Event::CameraStop).unwrap();
    let lift = log.position(|e| matches!(e, Event::MoveStart { target, .. } if *target == AxisTarget::z(10.0))).unwrap();
    assert!(camera_stop < lift);
    assert_eq!(log.labels_written(), vec!["point_00_00"]);
}

#[test]
fn burst_scan_writes_jpeg_frames() {
    let dir = tempfile::tempdir().unwrap();
    let log = EventLog::new();
    let control = ControlSurface::new(
        host(dir.path()),
        Arc::new(SimStage::new(log.clone()).with_move_delay(Duration::from_millis(30))),
        Arc::new(SimCameraFactory::new(log.clone())),
        Arc::new(DiskSink::default()),
    );
    let config = ScanConfig {
        end_x: 5.0,
        end_y: 5.0,
        capture_mode: Some(CaptureMode::Burst),
        ..scan_config(dir.path())
    };

    control.start_scan(config).unwrap();
    control.wait_for_scan();

    assert!(control.scan_status().last_error.is_none());
    let frame = dir.path().join("e2e").join("point_00_00").join("frame_00000.jpg");
    let bytes = std::fs::read(&frame).unwrap();
    assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
}
