//! Device driver capability
//!
//! The camera SDK is consumed through these traits. A session is opened per
//! operation and is never shared; operations deliver their outcome through
//! listener callbacks invoked from the driver's own thread.
//!
//! Thread Safety:
//! Listeners must only record the outcome and return. They run while the
//! coordinator holds the device lock, so they must never try to take it.

use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::imaging::BgrImage;

pub mod gate;
pub mod stub;
pub mod types;

pub use gate::ResultGate;
pub use types::*;

/// Process-wide exclusive access to the one physical device (FIFO)
pub type DeviceLock = Arc<tokio::sync::Mutex<()>>;

pub fn new_device_lock() -> DeviceLock {
    Arc::new(tokio::sync::Mutex::new(()))
}

/// Callbacks for on-device authentication
pub trait AuthenticationListener: Send + Sync {
    fn on_hint(&self, _hint: AuthenticateStatus) {}
    fn on_faces(&self, _faces: &[FaceRect]) {}
    fn on_result(&self, status: AuthenticateStatus, user_id: Option<String>);
}

/// Callbacks for on-device enrollment
pub trait EnrollmentListener: Send + Sync {
    fn on_hint(&self, _hint: EnrollStatus) {}
    fn on_progress(&self, _pose: FacePose) {}
    fn on_faces(&self, _faces: &[FaceRect]) {}
    fn on_result(&self, status: EnrollStatus);
}

/// Callbacks for faceprint extraction; `S` is the status family of the flow
pub trait ExtractionListener<S>: Send + Sync {
    fn on_hint(&self, _hint: S) {}
    fn on_progress(&self, _pose: FacePose) {}
    fn on_faces(&self, _faces: &[FaceRect]) {}
    fn on_result(&self, status: S, faceprints: Option<ExtractedFaceprints>);
}

/// One exclusive open connection to the device
///
/// Callback-driven calls may return before the flow finishes; the terminal
/// status arrives through `on_result`, possibly from a driver thread, at the
/// latest before `disconnect` returns. A call that returns `Err` failed
/// during setup.
pub trait DeviceSession: Send {
    fn authenticate(&mut self, listener: Arc<dyn AuthenticationListener>) -> Result<()>;

    fn extract_faceprints_for_auth(
        &mut self,
        listener: Arc<dyn ExtractionListener<AuthenticateStatus>>,
    ) -> Result<()>;

    fn enroll(&mut self, user_id: &str, listener: Arc<dyn EnrollmentListener>) -> Result<()>;

    fn extract_faceprints_for_enroll(
        &mut self,
        listener: Arc<dyn ExtractionListener<EnrollStatus>>,
    ) -> Result<()>;

    fn enroll_image(&mut self, user_id: &str, image: &BgrImage) -> Result<EnrollStatus>;

    fn extract_image_faceprints_for_enroll(
        &mut self,
        image: &BgrImage,
    ) -> Result<(EnrollStatus, Option<ExtractedFaceprints>)>;

    fn query_user_ids(&mut self) -> Result<Vec<String>>;

    fn remove_user(&mut self, user_id: &str) -> Result<Status>;

    fn remove_all_users(&mut self) -> Result<Status>;

    fn query_device_config(&mut self) -> Result<DeviceConfig>;

    fn set_device_config(&mut self, config: &DeviceConfig) -> Result<Status>;

    fn query_serial_number(&mut self) -> Result<String>;

    fn query_firmware_version(&mut self) -> Result<String>;

    /// Compare the installed release with the newest published one
    fn check_for_update(&mut self) -> Result<UpdateCheck>;

    /// Load a firmware image for compatibility checks. Fails with
    /// `Error::Firmware` when the file cannot be read or parsed.
    fn open_firmware(&mut self, image: &Path) -> Result<Box<dyn FirmwareInspector>>;

    /// Idempotent
    fn disconnect(&mut self);
}

/// A firmware image checked against the connected device
pub trait FirmwareInspector: Send {
    fn firmware_bin_info(&mut self) -> Result<FirmwareBinInfo>;
    fn device_firmware_info(&mut self) -> Result<DeviceFirmwareInfo>;
    fn sku_compatibility(&self) -> Compatibility;
    fn host_compatibility(&self) -> Compatibility;
    fn db_compatibility(&self) -> Compatibility;
    fn policy_compatibility(&self) -> Compatibility;
}

/// Host-side faceprint comparison (opaque SDK algorithm)
pub trait FaceprintMatcher: Send + Sync {
    fn match_faceprints(
        &self,
        probe: &ExtractedFaceprints,
        template: &Faceprints,
        level: MatcherConfidenceLevel,
    ) -> Result<MatchOutput>;
}

/// Receives raw frames on the driver's preview thread
pub type FrameSink = Arc<dyn Fn(RawFrame) + Send + Sync>;

pub trait PreviewSource: Send + Sync {
    fn start(&self, settings: PreviewSettings, sink: FrameSink) -> Result<Box<dyn PreviewStream>>;
}

/// A running preview; frames stop arriving once `stop` returns
pub trait PreviewStream: Send {
    fn stop(self: Box<Self>);
}

pub trait DeviceDriver: Send + Sync {
    /// Candidate serial ports with a device attached
    fn discover_ports(&self) -> Vec<String>;

    /// Fails with `Error::DeviceUnavailable` when the port cannot be opened
    fn open(&self, port: &str) -> Result<Box<dyn DeviceSession>>;

    fn discover_device_type(&self, port: &str) -> DeviceType;

    fn matcher(&self) -> Arc<dyn FaceprintMatcher>;

    fn preview_source(&self, port: &str) -> Arc<dyn PreviewSource>;
}
