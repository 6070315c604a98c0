//! Live preview fan-out
//!
//! One device stream feeds any number of viewers. The stream starts with
//! the first ticket and stops when the last ticket is revoked. The driver
//! thread only drops the newest raw frame into a watch channel; each frame
//! is encoded at most once, by whichever viewer gets to it first, and the
//! bytes are shared with the others.

use rand_core::{OsRng, RngCore};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

use crate::config::{PreviewConfig, StreamEncoding};
use crate::device::{DeviceLock, FrameSink, PreviewSettings, PreviewSource, PreviewStream, RawFrame};
use crate::error::{Error, Result};
use crate::imaging;

/// Opaque claim of one viewer on the live stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PreviewTicket(u128);

impl PreviewTicket {
    fn new() -> Self {
        let hi = OsRng.next_u64() as u128;
        let lo = OsRng.next_u64() as u128;
        Self((hi << 64) | lo)
    }
}

impl fmt::Display for PreviewTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PreviewState {
    Idle,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PreviewStats {
    pub state: PreviewState,
    pub audience: usize,
    pub frames_received: u64,
    pub frames_encoded: u64,
    pub encode_failures: u64,
}

/// Converts raw frames into the bytes sent to viewers
pub trait FrameEncoder: Send + Sync {
    fn encode(&self, frame: &RawFrame) -> Result<Vec<u8>>;
    fn content_type(&self) -> &'static str;
}

/// JPEG/WebP encoder backed by the `image` crate
pub struct ImageFrameEncoder {
    encoding: StreamEncoding,
    jpeg_quality: u8,
}

impl ImageFrameEncoder {
    pub fn from_config(config: &PreviewConfig) -> Self {
        Self {
            encoding: config.stream_type,
            jpeg_quality: config.jpeg_quality,
        }
    }
}

impl FrameEncoder for ImageFrameEncoder {
    fn encode(&self, frame: &RawFrame) -> Result<Vec<u8>> {
        imaging::encode_frame(frame, self.encoding, self.jpeg_quality)
    }

    fn content_type(&self) -> &'static str {
        self.encoding.content_type()
    }
}

/// One encoded frame shared by every viewer
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub seq: u64,
    pub content_type: &'static str,
    pub bytes: Arc<Vec<u8>>,
}

impl EncodedFrame {
    /// Frame as one part of a `multipart/x-mixed-replace; boundary=frame` body
    pub fn multipart_chunk(&self) -> Vec<u8> {
        multipart_chunk(self.content_type, &self.bytes)
    }
}

pub fn multipart_chunk(content_type: &str, bytes: &[u8]) -> Vec<u8> {
    let header = format!(
        "--frame\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
        content_type,
        bytes.len()
    );
    let mut chunk = Vec::with_capacity(header.len() + bytes.len() + 2);
    chunk.extend_from_slice(header.as_bytes());
    chunk.extend_from_slice(bytes);
    chunk.extend_from_slice(b"\r\n");
    chunk
}

#[derive(Clone)]
struct SharedFrame {
    seq: u64,
    frame: Arc<RawFrame>,
}

/// Receiving end of the driver's frame callback
struct FrameIntake {
    frames: watch::Sender<Option<SharedFrame>>,
    seq: AtomicU64,
}

impl FrameIntake {
    /// Runs on the driver thread: store the newest frame and wake viewers
    fn push(&self, frame: RawFrame) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.frames.send_replace(Some(SharedFrame {
            seq,
            frame: Arc::new(frame),
        }));
    }
}

struct EncodeSlot {
    /// Highest frame an encode was attempted for
    attempted_seq: u64,
    latest: Option<EncodedFrame>,
}

struct HubState {
    stream: Option<Box<dyn PreviewStream>>,
    tickets: BTreeSet<PreviewTicket>,
}

struct HubInner {
    source: Arc<dyn PreviewSource>,
    device_lock: DeviceLock,
    settings: PreviewSettings,
    frame_pause: Duration,
    encoder: Arc<dyn FrameEncoder>,
    state: Mutex<HubState>,
    intake: Arc<FrameIntake>,
    encode: tokio::sync::Mutex<EncodeSlot>,
    frames_encoded: AtomicU64,
    encode_failures: AtomicU64,
}

impl HubInner {
    fn state(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Remove `ticket`; stops the stream when it was the last one
    fn revoke(&self, ticket: PreviewTicket) -> bool {
        let mut state = self.state();
        if !state.tickets.remove(&ticket) {
            return false;
        }
        log::info!(
            "Viewer with ticket {} disconnected. Audience count: {}",
            ticket,
            state.tickets.len()
        );
        if state.tickets.is_empty() {
            if let Some(stream) = state.stream.take() {
                log::info!("No more audience. Stopping preview");
                stream.stop();
                self.intake.frames.send_replace(None);
            }
        }
        true
    }
}

impl Drop for HubInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(stream) = state.stream.take() {
            stream.stop();
        }
    }
}

/// Reference-counted owner of the device preview stream
#[derive(Clone)]
pub struct PreviewHub {
    inner: Arc<HubInner>,
}

impl PreviewHub {
    pub fn new(
        source: Arc<dyn PreviewSource>,
        device_lock: DeviceLock,
        settings: PreviewSettings,
        config: &PreviewConfig,
    ) -> Self {
        Self::with_encoder(
            source,
            device_lock,
            settings,
            Duration::from_micros(config.frame_pause_us),
            Arc::new(ImageFrameEncoder::from_config(config)),
        )
    }

    pub fn with_encoder(
        source: Arc<dyn PreviewSource>,
        device_lock: DeviceLock,
        settings: PreviewSettings,
        frame_pause: Duration,
        encoder: Arc<dyn FrameEncoder>,
    ) -> Self {
        let (frames, _) = watch::channel(None);
        Self {
            inner: Arc::new(HubInner {
                source,
                device_lock,
                settings,
                frame_pause,
                encoder,
                state: Mutex::new(HubState {
                    stream: None,
                    tickets: BTreeSet::new(),
                }),
                intake: Arc::new(FrameIntake {
                    frames,
                    seq: AtomicU64::new(0),
                }),
                encode: tokio::sync::Mutex::new(EncodeSlot {
                    attempted_seq: 0,
                    latest: None,
                }),
                frames_encoded: AtomicU64::new(0),
                encode_failures: AtomicU64::new(0),
            }),
        }
    }

    /// Attach a viewer, starting the device stream if none is running
    pub async fn subscribe(&self) -> Result<PreviewSubscription> {
        let _device = self.inner.device_lock.lock().await;

        // only frames that arrive after this point are delivered
        let frames = self.inner.intake.frames.subscribe();
        let ticket = PreviewTicket::new();
        {
            let mut state = self.inner.state();
            if state.stream.is_none() {
                let intake = Arc::clone(&self.inner.intake);
                let sink: FrameSink = Arc::new(move |frame| intake.push(frame));
                let stream = self.inner.source.start(self.inner.settings, sink)?;
                state.stream = Some(stream);
                log::info!("Preview stream started");
            }
            state.tickets.insert(ticket);
            log::info!(
                "Starting stream for viewer with ticket {}. Audience count: {}",
                ticket,
                state.tickets.len()
            );
        }

        Ok(PreviewSubscription {
            hub: self.clone(),
            ticket,
            frames,
            last_seq: 0,
            closed: false,
        })
    }

    /// Revoke a ticket. Returns false if it was not active.
    pub async fn unsubscribe(&self, ticket: PreviewTicket) -> bool {
        let _device = self.inner.device_lock.lock().await;
        self.inner.revoke(ticket)
    }

    pub fn state(&self) -> PreviewState {
        if self.inner.state().stream.is_some() {
            PreviewState::Active
        } else {
            PreviewState::Idle
        }
    }

    pub fn audience(&self) -> usize {
        self.inner.state().tickets.len()
    }

    pub fn is_subscribed(&self, ticket: PreviewTicket) -> bool {
        self.inner.state().tickets.contains(&ticket)
    }

    pub fn stats(&self) -> PreviewStats {
        let (state, audience) = {
            let s = self.inner.state();
            let state = if s.stream.is_some() {
                PreviewState::Active
            } else {
                PreviewState::Idle
            };
            (state, s.tickets.len())
        };
        PreviewStats {
            state,
            audience,
            frames_received: self.inner.intake.seq.load(Ordering::SeqCst),
            frames_encoded: self.inner.frames_encoded.load(Ordering::SeqCst),
            encode_failures: self.inner.encode_failures.load(Ordering::SeqCst),
        }
    }

    /// Encoded bytes for `shared`, encoding it if nobody has yet.
    /// `None` when encoding this frame failed.
    async fn encoded(&self, shared: SharedFrame) -> Option<EncodedFrame> {
        let mut slot = self.inner.encode.lock().await;
        if let Some(latest) = &slot.latest {
            if latest.seq >= shared.seq {
                return Some(latest.clone());
            }
        }
        if slot.attempted_seq >= shared.seq {
            return None;
        }
        slot.attempted_seq = shared.seq;

        let encoder = Arc::clone(&self.inner.encoder);
        let frame = Arc::clone(&shared.frame);
        let outcome = tokio::task::spawn_blocking(move || encoder.encode(&frame))
            .await
            .map_err(|e| Error::Encoding(e.to_string()))
            .and_then(|r| r);

        match outcome {
            Ok(bytes) => {
                self.inner.frames_encoded.fetch_add(1, Ordering::SeqCst);
                let encoded = EncodedFrame {
                    seq: shared.seq,
                    content_type: self.inner.encoder.content_type(),
                    bytes: Arc::new(bytes),
                };
                slot.latest = Some(encoded.clone());
                Some(encoded)
            }
            Err(e) => {
                self.inner.encode_failures.fetch_add(1, Ordering::SeqCst);
                log::error!("Skipping preview frame {}: {}", shared.seq, e);
                None
            }
        }
    }
}

/// One viewer's frame sequence
///
/// Dropping the subscription revokes its ticket.
pub struct PreviewSubscription {
    hub: PreviewHub,
    ticket: PreviewTicket,
    frames: watch::Receiver<Option<SharedFrame>>,
    /// Sequence number of the last frame handed out, 0 before the first
    last_seq: u64,
    closed: bool,
}

impl PreviewSubscription {
    pub fn ticket(&self) -> PreviewTicket {
        self.ticket
    }

    /// Wait for the next frame and return it encoded
    ///
    /// A revoked ticket does not end the sequence: the call keeps waiting
    /// until the caller drops it.
    ///
    /// Frames are handed out in increasing sequence order and never twice,
    /// even when another viewer already encoded a newer one.
    pub async fn next_frame(&mut self) -> Result<EncodedFrame> {
        if self.last_seq > 0 {
            tokio::time::sleep(self.hub.inner.frame_pause).await;
        }
        loop {
            self.frames
                .changed()
                .await
                .map_err(|_| Error::Driver("preview source closed".into()))?;

            if !self.hub.is_subscribed(self.ticket) {
                continue;
            }
            let Some(shared) = self.frames.borrow_and_update().clone() else {
                continue;
            };
            if shared.seq <= self.last_seq {
                continue;
            }
            match self.hub.encoded(shared).await {
                Some(encoded) if encoded.seq > self.last_seq => {
                    self.last_seq = encoded.seq;
                    return Ok(encoded);
                }
                _ => continue,
            }
        }
    }

    /// Next frame as a multipart body part
    pub async fn next_chunk(&mut self) -> Result<Vec<u8>> {
        Ok(self.next_frame().await?.multipart_chunk())
    }

    /// Revoke the ticket now instead of on drop
    pub async fn close(mut self) {
        self.closed = true;
        self.hub.unsubscribe(self.ticket).await;
    }
}

impl Drop for PreviewSubscription {
    fn drop(&mut self) {
        if self.closed || !self.hub.is_subscribed(self.ticket) {
            return;
        }
        let hub = self.hub.clone();
        let ticket = self.ticket;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    hub.unsubscribe(ticket).await;
                });
            }
            Err(_) => {
                let _device = hub.inner.device_lock.blocking_lock();
                hub.inner.revoke(ticket);
            }
        }
    }
}
