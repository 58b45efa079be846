//! Buffer lifecycle and camera sharing against the simulated device

use assert_matches::assert_matches;
use facecam::device::{FaultPlan, Pattern, SimConfig, SimHandle, SimulatedDevice};
use facecam::encoder::EncoderContext;
use facecam::format::negotiate;
use facecam::session::{CaptureSession, Flow};
use facecam::{Camera, CameraGate, CameraSettings, CaptureError, FormatRequest, PixelFormat, StreamFormat};
use rstest::rstest;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

fn sim(initial: PixelFormat, frame_interval: Duration) -> SimulatedDevice {
    SimulatedDevice::new(SimConfig {
        initial_format: StreamFormat::new(640, 480, initial),
        pattern: Pattern::Solid([30, 60, 200]),
        frame_interval,
        ..SimConfig::default()
    })
}

fn camera(device: SimulatedDevice, lock_timeout: Duration) -> (Arc<Camera>, SimHandle) {
    let handle = device.handle();
    let settings = CameraSettings {
        lock_timeout,
        ..CameraSettings::default()
    };
    let camera = Camera::new(CameraGate::new(Box::new(device)), settings);
    (Arc::new(camera), handle)
}

#[test]
fn map_failure_at_third_buffer_unwinds_everything() {
    let device = sim(PixelFormat::Rgb565, Duration::ZERO);
    let handle = device.handle();
    handle.inject(|f| f.fail_map_at = Some(2));
    let gate = CameraGate::new(Box::new(device));

    {
        let mut token = gate.acquire(Duration::from_millis(10)).unwrap();
        let state = token.state().unwrap();
        let format = state.ensure_format(&FormatRequest::streaming(None)).unwrap();
        let err = CaptureSession::start(state.device(), format, 3, "stream").err().unwrap();
        assert_matches!(err, CaptureError::Resources { .. });
    }

    let counters = handle.counters();
    assert_eq!(counters.maps, 2);
    assert_eq!(counters.map_failures, 1);
    assert_eq!(counters.unmaps, 2);
    assert_eq!(counters.mapped_now, 0);
    assert_eq!(counters.allocated_now, 0);
    assert_eq!(counters.releases, 1);
    assert!(!gate.is_held());
}

#[rstest]
#[case::query(FaultPlan { fail_query_at: Some(1), ..FaultPlan::default() })]
#[case::map_first(FaultPlan { fail_map_at: Some(0), ..FaultPlan::default() })]
#[case::map_last(FaultPlan { fail_map_at: Some(2), ..FaultPlan::default() })]
#[case::stream_on(FaultPlan { fail_stream_on: true, ..FaultPlan::default() })]
#[case::dequeue(FaultPlan { fail_dequeue_after: Some(4), ..FaultPlan::default() })]
#[case::stream_off(FaultPlan { fail_dequeue_after: Some(1), fail_stream_off: true, ..FaultPlan::default() })]
#[case::clean(FaultPlan::default())]
fn every_successful_map_is_unmapped(#[case] plan: FaultPlan) {
    let mut device = sim(PixelFormat::Rgb565, Duration::ZERO);
    let handle = device.handle();
    handle.inject(|f| *f = plan);

    let format = StreamFormat::new(640, 480, PixelFormat::Rgb565);
    if let Ok(mut session) = CaptureSession::start(&mut device, format, 3, "stream") {
        let mut frames = 0;
        let _ = session.run(|_| {
            frames += 1;
            if frames < 6 {
                Flow::Continue
            } else {
                Flow::Stop
            }
        });
        let counts = session.pool_counts();
        assert!(counts.hardware + counts.consumer <= 3);
    }

    let counters = handle.counters();
    assert_eq!(counters.unmaps, counters.maps);
}

#[test]
fn capture_reports_busy_while_stream_runs() {
    let (camera, handle) = camera(
        sim(PixelFormat::Raw10, Duration::from_millis(5)),
        Duration::from_millis(200),
    );
    let stop = Arc::new(AtomicBool::new(false));
    let (started_tx, started_rx) = mpsc::channel();

    let streamer = {
        let camera = Arc::clone(&camera);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            camera.stream_jpeg(
                |_| {
                    let _ = started_tx.send(());
                },
                |_| {
                    if stop.load(Ordering::Acquire) {
                        Flow::Stop
                    } else {
                        Flow::Continue
                    }
                },
            )
        })
    };
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let attempt = Instant::now();
    assert_matches!(camera.capture_jpeg(), Err(CaptureError::Busy));
    let waited = attempt.elapsed();
    assert!(waited >= Duration::from_millis(150), "gave up after {waited:?}");
    assert!(waited < Duration::from_secs(2), "waited {waited:?}");

    let during = handle.counters();
    assert!(during.streaming);
    assert_eq!(during.maps, 3);
    assert_eq!(during.unmaps, 0);
    assert_eq!(during.mapped_now, 3);

    stop.store(true, Ordering::Release);
    let stats = streamer.join().unwrap().unwrap();
    assert!(stats.frames_sent > 0);
    assert_eq!(stats.frames_dropped, 0);

    let after = handle.counters();
    assert_eq!(after.unmaps, 3);
    assert_eq!(after.allocated_now, 0);

    // camera is free again
    let jpeg = camera.capture_jpeg().unwrap();
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
}

#[test]
fn solid_vga_rgb565_capture_compresses() {
    let (camera, _handle) = camera(sim(PixelFormat::Rgb565, Duration::ZERO), Duration::from_secs(1));
    let jpeg = camera.capture_jpeg().unwrap();
    assert!(!jpeg.is_empty());
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    assert!(jpeg.len() < 640 * 480 * 2);
}

#[rstest]
#[case(PixelFormat::Rgb565)]
#[case(PixelFormat::Rgb24)]
#[case(PixelFormat::Yuv422p)]
#[case(PixelFormat::Grey)]
fn negotiated_format_always_configures(#[case] pixel_format: PixelFormat) {
    let mut device = sim(PixelFormat::Raw10, Duration::ZERO);
    let request = FormatRequest {
        resolution: Some((320, 240)),
        preferences: vec![pixel_format],
        strict: true,
    };
    let format = negotiate(&mut device, &request).unwrap();
    assert_eq!(format, StreamFormat::new(320, 240, pixel_format));

    let mut encoder = EncoderContext::configure(format, 75, Duration::from_secs(1)).unwrap();
    let frame = vec![0x40; format.frame_len().unwrap()];
    assert_eq!(&encoder.encode(&frame).unwrap()[..2], &[0xFF, 0xD8]);
}

#[test]
fn release_and_teardown_are_repeatable() {
    let mut device = sim(PixelFormat::Rgb565, Duration::ZERO);
    let handle = device.handle();
    let format = StreamFormat::new(640, 480, PixelFormat::Rgb565);

    let mut session = CaptureSession::start(&mut device, format, 3, "stream").unwrap();
    session.next_frame(|_| ()).unwrap();
    assert!(session.teardown().is_clean());
    assert_eq!(session.teardown().unmapped, 0);
    drop(session);
    assert_eq!(handle.counters().stream_offs, 1);

    let gate = CameraGate::new(Box::new(device));
    let mut token = gate.acquire(Duration::ZERO).unwrap();
    token.release();
    token.release();
    assert!(!gate.is_held());
}
