use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use facegate_lib::config::PreviewConfig;
use facegate_lib::device::stub::{synthetic_frame, SimulatedDevice, DEFAULT_PORT};
use facegate_lib::device::{
    new_device_lock, DeviceDriver, DeviceType, PreviewMode, PreviewSettings, RawFrame,
};
use facegate_lib::preview::{FrameEncoder, PreviewHub, PreviewState};
use facegate_lib::{Error, Result};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct CountingEncoder {
    calls: AtomicUsize,
    fail_first: usize,
}

impl FrameEncoder for CountingEncoder {
    fn encode(&self, frame: &RawFrame) -> Result<Vec<u8>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        // keep the encode slot busy long enough for viewers to pile up
        std::thread::sleep(Duration::from_millis(10));
        if call < self.fail_first {
            return Err(Error::Encoding("scripted failure".into()));
        }
        Ok(frame.pixels[..4].to_vec())
    }

    fn content_type(&self) -> &'static str {
        "application/octet-stream"
    }
}

fn settings() -> PreviewSettings {
    PreviewSettings {
        camera_number: -1,
        mode: PreviewMode::Mjpeg1080p,
        device_type: DeviceType::F45x,
    }
}

fn hub_with(sim: &SimulatedDevice, encoder: Arc<CountingEncoder>) -> PreviewHub {
    PreviewHub::with_encoder(
        sim.preview_source(DEFAULT_PORT),
        new_device_lock(),
        settings(),
        Duration::ZERO,
        encoder,
    )
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn test_stream_follows_audience() {
    let sim = SimulatedDevice::new();
    let hub = hub_with(&sim, Arc::default());
    assert_eq!(hub.state(), PreviewState::Idle);

    let first = hub.subscribe().await.unwrap();
    let second = hub.subscribe().await.unwrap();
    assert_eq!(hub.state(), PreviewState::Active);
    assert_eq!(hub.audience(), 2);
    assert_eq!(sim.streams_started(), 1);

    assert!(hub.unsubscribe(first.ticket()).await);
    assert!(!hub.unsubscribe(first.ticket()).await);
    assert_eq!(hub.state(), PreviewState::Active);
    assert_eq!(sim.streams_stopped(), 0);

    second.close().await;
    assert_eq!(hub.state(), PreviewState::Idle);
    assert_eq!(hub.audience(), 0);
    assert_eq!(sim.streams_stopped(), 1);
    assert!(!sim.push_frame(synthetic_frame(0)));

    drop(first);
    let _again = hub.subscribe().await.unwrap();
    assert_eq!(sim.streams_started(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_frame_is_encoded_once_for_all_viewers() {
    let sim = SimulatedDevice::new();
    let encoder = Arc::new(CountingEncoder::default());
    let hub = hub_with(&sim, Arc::clone(&encoder));

    let mut viewers = Vec::new();
    for _ in 0..5 {
        let mut subscription = hub.subscribe().await.unwrap();
        viewers.push(tokio::spawn(async move {
            let frame = tokio::time::timeout(WAIT, subscription.next_frame()).await;
            (frame, subscription)
        }));
    }

    assert!(sim.push_frame(synthetic_frame(3)));

    let mut payloads = Vec::new();
    for viewer in viewers {
        let (frame, _subscription) = viewer.await.unwrap();
        let frame = frame.expect("viewer timed out").unwrap();
        assert_eq!(frame.seq, 1);
        payloads.push(frame.bytes);
    }

    assert_eq!(encoder.calls.load(Ordering::SeqCst), 1);
    assert!(payloads.iter().all(|p| Arc::ptr_eq(p, &payloads[0])));
    assert_eq!(hub.stats().frames_encoded, 1);
}

#[tokio::test]
async fn test_revoked_viewer_gets_nothing_while_others_continue() {
    let sim = SimulatedDevice::new();
    let hub = hub_with(&sim, Arc::default());

    let mut revoked = hub.subscribe().await.unwrap();
    let mut kept = hub.subscribe().await.unwrap();
    assert!(hub.unsubscribe(revoked.ticket()).await);
    assert_eq!(hub.state(), PreviewState::Active);

    assert!(sim.push_frame(synthetic_frame(0)));
    let frame = tokio::time::timeout(WAIT, kept.next_frame())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame.seq, 1);

    let starved = tokio::time::timeout(Duration::from_millis(100), revoked.next_frame()).await;
    assert!(starved.is_err());
    assert!(!hub.is_subscribed(revoked.ticket()));
}

#[tokio::test]
async fn test_failed_encode_skips_the_frame() {
    let sim = SimulatedDevice::new();
    let encoder = Arc::new(CountingEncoder {
        fail_first: 1,
        ..Default::default()
    });
    let hub = hub_with(&sim, encoder);

    let mut subscription = hub.subscribe().await.unwrap();
    let viewer = tokio::spawn(async move {
        let frame = tokio::time::timeout(WAIT, subscription.next_frame()).await;
        (frame, subscription)
    });

    assert!(sim.push_frame(synthetic_frame(0)));
    wait_until(|| hub.stats().encode_failures == 1).await;
    assert!(sim.push_frame(synthetic_frame(1)));

    let (frame, _subscription) = viewer.await.unwrap();
    let frame = frame.unwrap().unwrap();
    assert_eq!(frame.seq, 2);
    assert_eq!(hub.stats().frames_received, 2);
}

#[tokio::test]
async fn test_dropped_subscription_revokes_its_ticket() {
    let sim = SimulatedDevice::new();
    let hub = hub_with(&sim, Arc::default());

    let subscription = hub.subscribe().await.unwrap();
    let ticket = subscription.ticket();
    drop(subscription);

    wait_until(|| hub.state() == PreviewState::Idle).await;
    assert!(!hub.is_subscribed(ticket));
    assert_eq!(sim.streams_stopped(), 1);
}

#[tokio::test]
async fn test_subscribe_waits_for_the_device_lock() {
    let sim = SimulatedDevice::new();
    let lock = new_device_lock();
    let hub = PreviewHub::with_encoder(
        sim.preview_source(DEFAULT_PORT),
        Arc::clone(&lock),
        settings(),
        Duration::ZERO,
        Arc::new(CountingEncoder::default()),
    );

    let busy = Arc::clone(&lock).lock_owned().await;
    let pending = {
        let hub = hub.clone();
        tokio::spawn(async move { hub.subscribe().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sim.streams_started(), 0);

    drop(busy);
    let _subscription = pending.await.unwrap().unwrap();
    assert_eq!(sim.streams_started(), 1);
}

#[tokio::test]
async fn test_start_failure_leaves_hub_idle() {
    let sim = SimulatedDevice::new();
    let hub = hub_with(&sim, Arc::default());
    sim.set_available(false);

    assert!(matches!(
        hub.subscribe().await,
        Err(Error::DeviceUnavailable { .. })
    ));
    assert_eq!(hub.state(), PreviewState::Idle);
    assert_eq!(hub.audience(), 0);
}

#[tokio::test]
async fn test_jpeg_chunks_from_running_stream() {
    let sim = SimulatedDevice::new();
    sim.set_frame_interval(Some(Duration::from_millis(5)));
    let hub = PreviewHub::new(
        sim.preview_source(DEFAULT_PORT),
        new_device_lock(),
        settings(),
        &PreviewConfig::default(),
    );

    let mut subscription = hub.subscribe().await.unwrap();
    for _ in 0..3 {
        let chunk = tokio::time::timeout(WAIT, subscription.next_chunk())
            .await
            .unwrap()
            .unwrap();
        let header = b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: ";
        assert!(chunk.starts_with(header));
        let body_start = chunk
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .unwrap()
            + 4;
        assert_eq!(&chunk[body_start..body_start + 2], &[0xFF, 0xD8]);
        assert!(chunk.ends_with(b"\r\n"));
    }
    subscription.close().await;
    assert_eq!(sim.streams_stopped(), 1);
}
