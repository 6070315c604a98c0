//! Simulated camera for development without hardware
//!
//! Behaves like the real driver where it matters to the coordinator:
//! callbacks fire on a separate driver thread, sessions are counted so
//! overlapping access is observable, preview frames arrive on a worker
//! thread, and failures can be injected.
//!
//! Faceprints are derived from a "subject" seed (or from image pixels)
//! through SHA-256, so the same subject always yields the same features and
//! different subjects are close to orthogonal.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use super::*;
use crate::biometrics::cosine_similarity;
use crate::error::{Error, Result};
use crate::imaging::BgrImage;

pub const DEFAULT_PORT: &str = "/dev/ttyACM0";

const SIM_VERSION: i32 = 1;
const SIM_SERIAL: &str = "SIM-0001";
const SIM_FIRMWARE: &str = "7.9.0.1";
const SIM_RECOGNITION: &str = "7.9.0.1";
const SIM_HOST_SOFTWARE: &str = "0.40.0";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

struct SimInner {
    ports: Vec<String>,
    available: AtomicBool,
    device_type: DeviceType,
    subject: Mutex<Option<Vec<i16>>>,
    users: Mutex<Vec<(String, Vec<i16>)>>,
    config: Mutex<DeviceConfig>,
    operation_delay: Mutex<Duration>,
    result_lag: Mutex<Duration>,
    fail_next: AtomicBool,
    drop_next_result: AtomicBool,
    forced_auth: Mutex<Option<AuthenticateStatus>>,
    forced_enroll: Mutex<Option<EnrollStatus>>,
    open_sessions: AtomicUsize,
    max_concurrent: AtomicUsize,
    sessions_opened: AtomicUsize,
    streams_started: AtomicUsize,
    streams_stopped: AtomicUsize,
    frame_interval: Mutex<Option<Duration>>,
    remote_release: Mutex<Option<ReleaseInfo>>,
    active_sink: Mutex<Option<FrameSink>>,
}

/// Simulated driver; clones share one device
#[derive(Clone)]
pub struct SimulatedDevice {
    inner: Arc<SimInner>,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self::with_ports(vec![DEFAULT_PORT.to_string()])
    }

    pub fn with_ports(ports: Vec<String>) -> Self {
        Self {
            inner: Arc::new(SimInner {
                ports,
                available: AtomicBool::new(true),
                device_type: DeviceType::F45x,
                subject: Mutex::new(None),
                users: Mutex::new(Vec::new()),
                config: Mutex::new(DeviceConfig::default()),
                operation_delay: Mutex::new(Duration::ZERO),
                result_lag: Mutex::new(Duration::ZERO),
                fail_next: AtomicBool::new(false),
                drop_next_result: AtomicBool::new(false),
                forced_auth: Mutex::new(None),
                forced_enroll: Mutex::new(None),
                open_sessions: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
                sessions_opened: AtomicUsize::new(0),
                streams_started: AtomicUsize::new(0),
                streams_stopped: AtomicUsize::new(0),
                frame_interval: Mutex::new(None),
                remote_release: Mutex::new(None),
                active_sink: Mutex::new(None),
            }),
        }
    }

    /// Deterministic features for a subject seed
    pub fn subject_features(seed: u64) -> Vec<i16> {
        features_from_bytes(&seed.to_le_bytes())
    }

    /// Put a face in front of the camera
    pub fn present_subject(&self, seed: u64) {
        *lock(&self.inner.subject) = Some(Self::subject_features(seed));
    }

    pub fn present_features(&self, features: Vec<i16>) {
        *lock(&self.inner.subject) = Some(features);
    }

    pub fn clear_subject(&self) {
        *lock(&self.inner.subject) = None;
    }

    /// Unplug (false) or replug (true) the device
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Time each callback-driven operation spends on the driver thread
    pub fn set_operation_delay(&self, delay: Duration) {
        *lock(&self.inner.operation_delay) = delay;
    }

    /// Deliver terminal statuses this long after the driver call returned
    pub fn set_result_lag(&self, lag: Duration) {
        *lock(&self.inner.result_lag) = lag;
    }

    /// The next callback-driven operation fails during setup
    pub fn fail_next_operation(&self) {
        self.inner.fail_next.store(true, Ordering::SeqCst);
    }

    /// The next callback-driven operation returns without a terminal status
    pub fn drop_next_result(&self) {
        self.inner.drop_next_result.store(true, Ordering::SeqCst);
    }

    /// One-shot terminal status for the next authentication flow
    pub fn force_auth_status(&self, status: AuthenticateStatus) {
        *lock(&self.inner.forced_auth) = Some(status);
    }

    /// One-shot terminal status for the next enrollment flow
    pub fn force_enroll_status(&self, status: EnrollStatus) {
        *lock(&self.inner.forced_enroll) = Some(status);
    }

    pub fn open_sessions(&self) -> usize {
        self.inner.open_sessions.load(Ordering::SeqCst)
    }

    /// Highest number of sessions that were open at the same time
    pub fn max_concurrent_sessions(&self) -> usize {
        self.inner.max_concurrent.load(Ordering::SeqCst)
    }

    pub fn sessions_opened(&self) -> usize {
        self.inner.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn device_users(&self) -> Vec<String> {
        lock(&self.inner.users).iter().map(|(u, _)| u.clone()).collect()
    }

    pub fn streams_started(&self) -> usize {
        self.inner.streams_started.load(Ordering::SeqCst)
    }

    pub fn streams_stopped(&self) -> usize {
        self.inner.streams_stopped.load(Ordering::SeqCst)
    }

    /// Publish a newer release for update checks; `None` publishes the
    /// installed one
    pub fn set_remote_release(&self, release: Option<ReleaseInfo>) {
        *lock(&self.inner.remote_release) = release;
    }

    /// Release installed on the simulated device
    pub fn local_release() -> ReleaseInfo {
        release(SIM_HOST_SOFTWARE, SIM_FIRMWARE)
    }

    /// Emit synthetic frames at this interval while a preview runs
    pub fn set_frame_interval(&self, interval: Option<Duration>) {
        *lock(&self.inner.frame_interval) = interval;
    }

    /// Deliver one frame to the running preview, as the driver thread would.
    /// Returns false when no preview is running.
    pub fn push_frame(&self, frame: RawFrame) -> bool {
        let sink = lock(&self.inner.active_sink).clone();
        match sink {
            Some(sink) => {
                sink(frame);
                true
            }
            None => false,
        }
    }
}

fn features_from_bytes(bytes: &[u8]) -> Vec<i16> {
    let mut features = Vec::with_capacity(FEATURES_ALLOC_SIZE);
    let mut counter = 0u32;
    while features.len() < FEATURES_ALLOC_SIZE {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hasher.update(counter.to_le_bytes());
        for b in hasher.finalize() {
            if features.len() == FEATURES_ALLOC_SIZE {
                break;
            }
            features.push(b as i8 as i16);
        }
        counter += 1;
    }
    features
}

fn extracted(features: Vec<i16>) -> ExtractedFaceprints {
    ExtractedFaceprints {
        version: SIM_VERSION,
        features_type: 0,
        flags: 0,
        features,
    }
}

fn similarity(a: &[i16], b: &[i16]) -> f32 {
    let a: Vec<f32> = a.iter().take(NUM_RECOGNITION_FEATURES).map(|&v| v as f32).collect();
    let b: Vec<f32> = b.iter().take(NUM_RECOGNITION_FEATURES).map(|&v| v as f32).collect();
    cosine_similarity(&a, &b)
}

fn face_rect() -> FaceRect {
    FaceRect {
        x: 412,
        y: 220,
        w: 310,
        h: 360,
    }
}

impl DeviceDriver for SimulatedDevice {
    fn discover_ports(&self) -> Vec<String> {
        if self.inner.available.load(Ordering::SeqCst) {
            self.inner.ports.clone()
        } else {
            Vec::new()
        }
    }

    fn open(&self, port: &str) -> Result<Box<dyn DeviceSession>> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(Error::DeviceUnavailable {
                port: port.to_string(),
                reason: "device not connected".into(),
            });
        }
        if !self.inner.ports.iter().any(|p| p == port) {
            return Err(Error::DeviceUnavailable {
                port: port.to_string(),
                reason: "no such port".into(),
            });
        }

        let open = self.inner.open_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_concurrent.fetch_max(open, Ordering::SeqCst);
        self.inner.sessions_opened.fetch_add(1, Ordering::SeqCst);
        log::debug!("[SIM] Session opened on {} ({} open)", port, open);

        Ok(Box::new(SimSession {
            inner: Arc::clone(&self.inner),
            connected: true,
            driver_threads: Vec::new(),
        }))
    }

    fn discover_device_type(&self, _port: &str) -> DeviceType {
        self.inner.device_type
    }

    fn matcher(&self) -> Arc<dyn FaceprintMatcher> {
        Arc::new(SimMatcher)
    }

    fn preview_source(&self, _port: &str) -> Arc<dyn PreviewSource> {
        Arc::new(SimPreviewSource {
            inner: Arc::clone(&self.inner),
        })
    }
}

struct SimSession {
    inner: Arc<SimInner>,
    connected: bool,
    driver_threads: Vec<thread::JoinHandle<()>>,
}

impl SimSession {
    fn check_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(Error::Driver("session already disconnected".into()))
        }
    }

    /// Setup-time checks shared by the callback-driven flows
    fn begin(&self, operation: &str) -> Result<()> {
        self.check_connected()?;
        if self.inner.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::Driver(format!("{}: injected setup failure", operation)));
        }
        Ok(())
    }

    /// Run `flow` on a driver thread
    ///
    /// Normally the call waits for the flow. With a result lag set, the call
    /// returns right away and the flow finishes on its own; `disconnect`
    /// joins it.
    fn on_driver_thread<F>(&mut self, flow: F) -> Result<()>
    where
        F: FnOnce(&SimInner, bool) + Send + 'static,
    {
        let deliver = !self.inner.drop_next_result.swap(false, Ordering::SeqCst);
        let delay = *lock(&self.inner.operation_delay);
        let lag = *lock(&self.inner.result_lag);
        let inner = Arc::clone(&self.inner);
        let handle = thread::spawn(move || {
            let pause = delay + lag;
            if !pause.is_zero() {
                thread::sleep(pause);
            }
            flow(&inner, deliver);
        });

        if lag.is_zero() {
            handle
                .join()
                .map_err(|_| Error::Driver("driver thread panicked".into()))
        } else {
            self.driver_threads.push(handle);
            Ok(())
        }
    }

    fn subject(&self) -> Option<Vec<i16>> {
        lock(&self.inner.subject).clone()
    }
}

impl Drop for SimSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl DeviceSession for SimSession {
    fn authenticate(&mut self, listener: Arc<dyn AuthenticationListener>) -> Result<()> {
        self.begin("authenticate")?;
        let subject = self.subject();
        self.on_driver_thread(move |inner, deliver| {
            listener.on_hint(AuthenticateStatus::CameraStarted);
            let forced = lock(&inner.forced_auth).take();
            let (status, user_id) = match (forced, subject) {
                (Some(status), _) => (status, None),
                (None, None) => (AuthenticateStatus::NoFaceDetected, None),
                (None, Some(features)) => {
                    listener.on_faces(&[face_rect()]);
                    let min_score = lock(&inner.config).matcher_confidence_level.min_score();
                    let users = lock(&inner.users);
                    let best = users
                        .iter()
                        .map(|(user, stored)| (user, similarity(&features, stored)))
                        .filter(|(_, score)| *score >= min_score)
                        .fold(None::<(&String, f32)>, |best, (user, score)| match best {
                            Some((_, s)) if s >= score => best,
                            _ => Some((user, score)),
                        });
                    match best {
                        Some((user, _)) => (AuthenticateStatus::Success, Some(user.clone())),
                        None => (AuthenticateStatus::Forbidden, None),
                    }
                }
            };
            listener.on_hint(AuthenticateStatus::CameraStopped);
            if deliver {
                listener.on_result(status, user_id);
            }
        })
    }

    fn extract_faceprints_for_auth(
        &mut self,
        listener: Arc<dyn ExtractionListener<AuthenticateStatus>>,
    ) -> Result<()> {
        self.begin("extract_faceprints_for_auth")?;
        let subject = self.subject();
        self.on_driver_thread(move |inner, deliver| {
            let forced = lock(&inner.forced_auth).take();
            let (status, prints) = match (forced, subject) {
                (Some(status), subject) => (status, subject.map(extracted)),
                (None, None) => (AuthenticateStatus::NoFaceDetected, None),
                (None, Some(features)) => {
                    listener.on_faces(&[face_rect()]);
                    (AuthenticateStatus::Success, Some(extracted(features)))
                }
            };
            if deliver {
                listener.on_result(status, prints);
            }
        })
    }

    fn enroll(&mut self, user_id: &str, listener: Arc<dyn EnrollmentListener>) -> Result<()> {
        self.begin("enroll")?;
        let subject = self.subject();
        let user_id = user_id.to_string();
        self.on_driver_thread(move |inner, deliver| {
            let forced = lock(&inner.forced_enroll).take();
            let status = match (forced, subject) {
                (Some(status), _) => status,
                (None, None) => EnrollStatus::NoFaceDetected,
                (None, Some(features)) => {
                    let mut users = lock(&inner.users);
                    if users.iter().any(|(u, _)| *u == user_id) {
                        EnrollStatus::DuplicateUserId
                    } else {
                        listener.on_faces(&[face_rect()]);
                        for pose in FacePose::ALL {
                            listener.on_progress(*pose);
                        }
                        users.push((user_id, features));
                        EnrollStatus::Success
                    }
                }
            };
            if deliver {
                listener.on_result(status);
            }
        })
    }

    fn extract_faceprints_for_enroll(
        &mut self,
        listener: Arc<dyn ExtractionListener<EnrollStatus>>,
    ) -> Result<()> {
        self.begin("extract_faceprints_for_enroll")?;
        let subject = self.subject();
        self.on_driver_thread(move |inner, deliver| {
            let forced = lock(&inner.forced_enroll).take();
            let (status, prints) = match (forced, subject) {
                (Some(status), subject) => (status, subject.map(extracted)),
                (None, None) => (EnrollStatus::NoFaceDetected, None),
                (None, Some(features)) => {
                    listener.on_faces(&[face_rect()]);
                    for pose in FacePose::ALL {
                        listener.on_progress(*pose);
                    }
                    (EnrollStatus::Success, Some(extracted(features)))
                }
            };
            if deliver {
                listener.on_result(status, prints);
            }
        })
    }

    fn enroll_image(&mut self, user_id: &str, image: &BgrImage) -> Result<EnrollStatus> {
        self.check_connected()?;
        if image.byte_len() != image.width as usize * image.height as usize * 3 {
            return Ok(EnrollStatus::Failure);
        }
        let mut users = lock(&self.inner.users);
        if users.iter().any(|(u, _)| u == user_id) {
            return Ok(EnrollStatus::DuplicateUserId);
        }
        users.push((user_id.to_string(), features_from_bytes(&image.pixels)));
        Ok(EnrollStatus::Success)
    }

    fn extract_image_faceprints_for_enroll(
        &mut self,
        image: &BgrImage,
    ) -> Result<(EnrollStatus, Option<ExtractedFaceprints>)> {
        self.check_connected()?;
        if image.byte_len() != image.width as usize * image.height as usize * 3 {
            return Ok((EnrollStatus::Failure, None));
        }
        Ok((
            EnrollStatus::Success,
            Some(extracted(features_from_bytes(&image.pixels))),
        ))
    }

    fn query_user_ids(&mut self) -> Result<Vec<String>> {
        self.check_connected()?;
        Ok(lock(&self.inner.users).iter().map(|(u, _)| u.clone()).collect())
    }

    fn remove_user(&mut self, user_id: &str) -> Result<Status> {
        self.check_connected()?;
        let mut users = lock(&self.inner.users);
        let before = users.len();
        users.retain(|(u, _)| u != user_id);
        Ok(if users.len() < before {
            Status::Ok
        } else {
            Status::Error
        })
    }

    fn remove_all_users(&mut self) -> Result<Status> {
        self.check_connected()?;
        lock(&self.inner.users).clear();
        Ok(Status::Ok)
    }

    fn query_device_config(&mut self) -> Result<DeviceConfig> {
        self.check_connected()?;
        Ok(*lock(&self.inner.config))
    }

    fn set_device_config(&mut self, config: &DeviceConfig) -> Result<Status> {
        self.check_connected()?;
        // round-trip through the register block like the real device
        match DeviceConfig::from_sdk(config.to_sdk()) {
            Some(applied) => {
                *lock(&self.inner.config) = applied;
                Ok(Status::Ok)
            }
            None => Ok(Status::Error),
        }
    }

    fn query_serial_number(&mut self) -> Result<String> {
        self.check_connected()?;
        Ok(SIM_SERIAL.to_string())
    }

    fn query_firmware_version(&mut self) -> Result<String> {
        self.check_connected()?;
        Ok(format!("OPFW:{}", SIM_FIRMWARE))
    }

    fn check_for_update(&mut self) -> Result<UpdateCheck> {
        self.check_connected()?;
        let local = SimulatedDevice::local_release();
        let remote = lock(&self.inner.remote_release)
            .clone()
            .unwrap_or_else(|| local.clone());
        Ok(UpdateCheck {
            update_available: remote.firmware_version > local.firmware_version
                || remote.software_version > local.software_version,
            local_release: local,
            remote_release: remote,
        })
    }

    fn open_firmware(&mut self, image: &Path) -> Result<Box<dyn FirmwareInspector>> {
        self.check_connected()?;
        let content = fs::read_to_string(image)
            .map_err(|e| Error::Firmware(format!("{}: {}", image.display(), e)))?;
        let image: SimFirmwareImage =
            toml::from_str(&content).map_err(|e| Error::Firmware(e.to_string()))?;
        for version in [&image.firmware_version, &image.recognition_version, &image.min_host_version] {
            if version_number(version).is_none() {
                return Err(Error::Firmware(format!("bad version string {:?}", version)));
            }
        }
        Ok(Box::new(SimFirmwareInspector {
            image,
            device_type: self.inner.device_type,
        }))
    }

    fn disconnect(&mut self) {
        for handle in self.driver_threads.drain(..) {
            if handle.join().is_err() {
                log::error!("[SIM] Driver thread panicked");
            }
        }
        if self.connected {
            self.connected = false;
            let open = self.inner.open_sessions.fetch_sub(1, Ordering::SeqCst) - 1;
            log::debug!("[SIM] Session closed ({} open)", open);
        }
    }
}

fn release(software: &str, firmware: &str) -> ReleaseInfo {
    ReleaseInfo {
        software_version_string: software.to_string(),
        firmware_version_string: firmware.to_string(),
        software_version: version_number(software).unwrap_or(0),
        firmware_version: version_number(firmware).unwrap_or(0),
        release_notes_url: None,
        release_url: None,
    }
}

fn major(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

/// Firmware image manifest understood by the simulated device (TOML)
#[derive(Debug, Deserialize)]
struct SimFirmwareImage {
    firmware_version: String,
    recognition_version: String,
    module_names: Vec<String>,
    /// `DeviceType` the image is built for
    sku: String,
    min_host_version: String,
}

struct SimFirmwareInspector {
    image: SimFirmwareImage,
    device_type: DeviceType,
}

impl FirmwareInspector for SimFirmwareInspector {
    fn firmware_bin_info(&mut self) -> Result<FirmwareBinInfo> {
        Ok(FirmwareBinInfo {
            firmware_version: self.image.firmware_version.clone(),
            recognition_version: self.image.recognition_version.clone(),
            module_names: self.image.module_names.clone(),
        })
    }

    fn device_firmware_info(&mut self) -> Result<DeviceFirmwareInfo> {
        Ok(DeviceFirmwareInfo {
            firmware_version: SIM_FIRMWARE.to_string(),
            recognition_version: SIM_RECOGNITION.to_string(),
            serial_number: SIM_SERIAL.to_string(),
        })
    }

    fn sku_compatibility(&self) -> Compatibility {
        match DeviceType::from_str(&self.image.sku) {
            Ok(sku) if sku == self.device_type => Compatibility::new(true, "SKU matches the device"),
            Ok(sku) => Compatibility::new(
                false,
                format!("Firmware is built for {}, device is {}", sku, self.device_type),
            ),
            Err(e) => Compatibility::new(false, e),
        }
    }

    fn host_compatibility(&self) -> Compatibility {
        if version_number(SIM_HOST_SOFTWARE) >= version_number(&self.image.min_host_version) {
            Compatibility::new(true, "Host software is recent enough")
        } else {
            Compatibility::new(
                false,
                format!(
                    "Host software {} is older than the required {}",
                    SIM_HOST_SOFTWARE, self.image.min_host_version
                ),
            )
        }
    }

    fn db_compatibility(&self) -> Compatibility {
        if major(&self.image.recognition_version) == major(SIM_RECOGNITION) {
            Compatibility::new(true, "Enrolled users are kept")
        } else {
            Compatibility::new(
                false,
                format!(
                    "Recognition changes from {} to {}; enrolled users must be enrolled again",
                    SIM_RECOGNITION, self.image.recognition_version
                ),
            )
        }
    }

    fn policy_compatibility(&self) -> Compatibility {
        if version_number(&self.image.firmware_version) >= version_number(SIM_FIRMWARE) {
            Compatibility::new(true, "Update allowed")
        } else {
            Compatibility::new(
                false,
                format!(
                    "Downgrade from {} to {} is not allowed",
                    SIM_FIRMWARE, self.image.firmware_version
                ),
            )
        }
    }
}

/// Cosine matcher with template adaptation
struct SimMatcher;

impl FaceprintMatcher for SimMatcher {
    fn match_faceprints(
        &self,
        probe: &ExtractedFaceprints,
        template: &Faceprints,
        level: MatcherConfidenceLevel,
    ) -> Result<MatchOutput> {
        if probe.features.len() < NUM_RECOGNITION_FEATURES {
            return Err(Error::Driver("probe faceprints are truncated".into()));
        }
        let score = similarity(&probe.features, &template.enroll_descriptor)
            .max(similarity(&probe.features, &template.adaptive_descriptor_nomask));
        let success = score >= level.min_score();
        // adapt while the live capture still drifts from the stored template
        let should_update = success && score < 0.999;

        let mut updated = template.clone();
        if should_update {
            updated.adaptive_descriptor_nomask = template
                .adaptive_descriptor_nomask
                .iter()
                .zip(probe.features.iter())
                .map(|(&a, &p)| ((a as i32 + p as i32) / 2) as i16)
                .collect();
        }

        Ok(MatchOutput {
            result: MatchResult {
                success,
                should_update,
                score,
            },
            updated,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct StopPreview;

struct SimPreviewSource {
    inner: Arc<SimInner>,
}

impl PreviewSource for SimPreviewSource {
    fn start(&self, settings: PreviewSettings, sink: FrameSink) -> Result<Box<dyn PreviewStream>> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(Error::DeviceUnavailable {
                port: DEFAULT_PORT.to_string(),
                reason: "device not connected".into(),
            });
        }

        log::info!(
            "[SIM] Preview started (camera {}, {}, {})",
            settings.camera_number,
            settings.mode,
            settings.device_type
        );
        self.inner.streams_started.fetch_add(1, Ordering::SeqCst);
        *lock(&self.inner.active_sink) = Some(Arc::clone(&sink));

        let (stop_tx, stop_rx) = bounded::<StopPreview>(1);
        let interval = *lock(&self.inner.frame_interval);
        let handle = thread::spawn(move || run_preview_worker(sink, interval, stop_rx));

        Ok(Box::new(SimPreviewStream {
            inner: Arc::clone(&self.inner),
            stop_tx,
            thread_handle: Some(handle),
        }))
    }
}

/// Preview worker that runs in a dedicated thread
fn run_preview_worker(sink: FrameSink, interval: Option<Duration>, stop_rx: Receiver<StopPreview>) {
    let Some(interval) = interval else {
        // frames only arrive through push_frame
        let _ = stop_rx.recv();
        return;
    };

    let mut frame_count = 0u32;
    loop {
        match stop_rx.recv_timeout(interval) {
            Ok(StopPreview) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                sink(synthetic_frame(frame_count));
                frame_count = frame_count.wrapping_add(1);
            }
        }
    }
    log::trace!("[SIM] Preview worker emitted {} frames", frame_count);
}

/// Moving gradient, 64x48 RGB
pub fn synthetic_frame(index: u32) -> RawFrame {
    let (width, height) = (64u32, 48u32);
    let mut pixels = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            pixels.push(((x + index) % 256) as u8);
            pixels.push(((y * 4) % 256) as u8);
            pixels.push((index % 256) as u8);
        }
    }
    RawFrame {
        width,
        height,
        pixels,
    }
}

struct SimPreviewStream {
    inner: Arc<SimInner>,
    stop_tx: Sender<StopPreview>,
    thread_handle: Option<thread::JoinHandle<()>>,
}

impl PreviewStream for SimPreviewStream {
    fn stop(mut self: Box<Self>) {
        let _ = self.stop_tx.send(StopPreview);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        *lock(&self.inner.active_sink) = None;
        self.inner.streams_stopped.fetch_add(1, Ordering::SeqCst);
        log::info!("[SIM] Preview stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        gate: ResultGate<(EnrollStatus, Option<ExtractedFaceprints>)>,
        poses: Mutex<Vec<FacePose>>,
    }

    impl ExtractionListener<EnrollStatus> for Recorder {
        fn on_progress(&self, pose: FacePose) {
            self.poses.lock().unwrap().push(pose);
        }

        fn on_result(&self, status: EnrollStatus, faceprints: Option<ExtractedFaceprints>) {
            self.gate.publish((status, faceprints));
        }
    }

    #[test]
    fn test_subject_features_are_stable_and_distinct() {
        let a = SimulatedDevice::subject_features(1);
        assert_eq!(a, SimulatedDevice::subject_features(1));
        assert_eq!(a.len(), FEATURES_ALLOC_SIZE);
        let b = SimulatedDevice::subject_features(2);
        assert!(similarity(&a, &b) < 0.5);
        assert!((similarity(&a, &a) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_session_counting() {
        let sim = SimulatedDevice::new();
        let mut first = sim.open(DEFAULT_PORT).unwrap();
        let second = sim.open(DEFAULT_PORT).unwrap();
        assert_eq!(sim.open_sessions(), 2);
        assert_eq!(sim.max_concurrent_sessions(), 2);

        first.disconnect();
        first.disconnect();
        assert_eq!(sim.open_sessions(), 1);
        drop(second);
        assert_eq!(sim.open_sessions(), 0);
    }

    #[test]
    fn test_unavailable_device() {
        let sim = SimulatedDevice::new();
        sim.set_available(false);
        assert!(sim.discover_ports().is_empty());
        assert!(matches!(
            sim.open(DEFAULT_PORT),
            Err(Error::DeviceUnavailable { .. })
        ));
        sim.set_available(true);
        assert!(matches!(
            sim.open("/dev/ttyS9"),
            Err(Error::DeviceUnavailable { .. })
        ));
    }

    #[test]
    fn test_extraction_delivers_on_driver_thread() {
        let sim = SimulatedDevice::new();
        sim.present_subject(42);
        let recorder = Arc::new(Recorder {
            gate: ResultGate::new(),
            poses: Mutex::new(Vec::new()),
        });

        let mut session = sim.open(DEFAULT_PORT).unwrap();
        session.extract_faceprints_for_enroll(recorder.clone()).unwrap();
        session.disconnect();

        let (status, prints) = recorder.gate.wait_blocking().unwrap();
        assert_eq!(status, EnrollStatus::Success);
        assert_eq!(prints.unwrap().features, SimulatedDevice::subject_features(42));
        assert_eq!(recorder.poses.lock().unwrap().len(), FacePose::ALL.len());
    }

    #[test]
    fn test_lagged_result_lands_before_disconnect_returns() {
        let sim = SimulatedDevice::new();
        sim.present_subject(43);
        sim.set_result_lag(Duration::from_millis(50));
        let recorder = Arc::new(Recorder {
            gate: ResultGate::new(),
            poses: Mutex::new(Vec::new()),
        });

        let mut session = sim.open(DEFAULT_PORT).unwrap();
        session.extract_faceprints_for_enroll(recorder.clone()).unwrap();
        assert!(!recorder.gate.is_settled());
        session.disconnect();

        assert!(recorder.gate.is_settled());
        let (status, _) = recorder.gate.wait_blocking().unwrap();
        assert_eq!(status, EnrollStatus::Success);
        assert_eq!(sim.open_sessions(), 0);
    }

    #[test]
    fn test_matcher_accepts_same_subject_only() {
        let features = SimulatedDevice::subject_features(7);
        let template = Faceprints::from_extracted(&extracted(features.clone()));

        let same = SimMatcher
            .match_faceprints(&extracted(features), &template, MatcherConfidenceLevel::High)
            .unwrap();
        assert!(same.result.success);

        let other = SimMatcher
            .match_faceprints(
                &extracted(SimulatedDevice::subject_features(8)),
                &template,
                MatcherConfidenceLevel::High,
            )
            .unwrap();
        assert!(!other.result.success);
        assert!(!other.result.should_update);
    }

    #[test]
    fn test_preview_push_and_stop() {
        let sim = SimulatedDevice::new();
        let received = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&received);
        let sink: FrameSink = Arc::new(move |_frame| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let settings = PreviewSettings {
            camera_number: -1,
            mode: PreviewMode::Mjpeg1080p,
            device_type: DeviceType::F45x,
        };
        let stream = sim.preview_source(DEFAULT_PORT).start(settings, sink).unwrap();
        assert!(sim.push_frame(synthetic_frame(0)));
        stream.stop();

        assert!(!sim.push_frame(synthetic_frame(1)));
        assert_eq!(received.load(Ordering::SeqCst), 1);
        assert_eq!(sim.streams_started(), 1);
        assert_eq!(sim.streams_stopped(), 1);
    }
}
