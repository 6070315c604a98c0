//! Closed device enumerations and the records exchanged with the driver
//!
//! Every enumeration is mapped to and from the SDK's raw integer codes by a
//! pair of pure functions generated by `sdk_enum!`. `to_sdk` is an exhaustive
//! match, so adding a variant without a code fails to compile.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Descriptor buffer size used by the SDK for every faceprint descriptor
pub const FEATURES_ALLOC_SIZE: usize = 515;

/// Leading descriptor entries that form the recognition vector
pub const NUM_RECOGNITION_FEATURES: usize = 512;

macro_rules! sdk_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $variant:ident = $code:expr ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $( $variant ),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[ $( $name::$variant ),+ ];

            /// Raw code understood by the device SDK
            pub const fn to_sdk(self) -> i32 {
                match self {
                    $( $name::$variant => $code ),+
                }
            }

            /// Map a raw SDK code back; `None` for codes this build does not know
            pub fn from_sdk(code: i32) -> Option<Self> {
                match code {
                    $( c if c == $code => Some($name::$variant), )+
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $( $name::$variant => stringify!($variant) ),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}.{}", stringify!($name), self.name())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let wanted = s.rsplit('.').next().unwrap_or(s);
                $name::ALL
                    .iter()
                    .copied()
                    .find(|v| v.name().eq_ignore_ascii_case(wanted))
                    .ok_or_else(|| format!("Unknown {} value '{}'", stringify!($name), s))
            }
        }
    };
}

/// How a terminal status should be treated by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatusKind {
    Success,
    /// User can retry (positioning, occlusion, no face yet)
    Transient,
    /// Definitive failure (spoof, device error, forbidden)
    Fatal,
}

sdk_enum! {
    /// Generic device status
    pub enum Status {
        Ok = 100,
        Error = 101,
        SerialError = 102,
        SecurityError = 103,
        VersionMismatch = 104,
        CrcError = 105,
        TooManySpoofs = 106,
        NotSupported = 107,
    }
}

sdk_enum! {
    /// Authentication hints and terminal statuses
    pub enum AuthenticateStatus {
        Success = 0,
        NoFaceDetected = 1,
        FaceDetected = 2,
        LedFlowSuccess = 3,
        FaceIsTooFarToTheTop = 4,
        FaceIsTooFarToTheBottom = 5,
        FaceIsTooFarToTheRight = 6,
        FaceIsTooFarToTheLeft = 7,
        FaceTiltIsTooUp = 8,
        FaceTiltIsTooDown = 9,
        FaceTiltIsTooRight = 10,
        FaceTiltIsTooLeft = 11,
        FaceIsNotFrontal = 12,
        CameraStarted = 13,
        CameraStopped = 14,
        Sunglasses = 15,
        MedicalMask = 16,
        Spoof = 20,
        Forbidden = 21,
        DeviceError = 22,
        Failure = 23,
        TooManySpoofs = 24,
        InvalidFeatures = 25,
        Ok = 100,
        Error = 101,
        SerialError = 102,
        SecurityError = 103,
        VersionMismatch = 104,
        CrcError = 105,
        Spoof2D = 120,
        Spoof3D = 121,
        SpoofLR = 122,
        SpoofSurface = 123,
        SpoofDisparity = 124,
        SpoofVision = 125,
        Spoof2DRight = 126,
        SpoofPlaneDisparity = 127,
    }
}

impl AuthenticateStatus {
    pub fn kind(self) -> StatusKind {
        use AuthenticateStatus::*;
        match self {
            Success | Ok => StatusKind::Success,
            NoFaceDetected | FaceDetected | LedFlowSuccess | FaceIsTooFarToTheTop
            | FaceIsTooFarToTheBottom | FaceIsTooFarToTheRight | FaceIsTooFarToTheLeft
            | FaceTiltIsTooUp | FaceTiltIsTooDown | FaceTiltIsTooRight | FaceTiltIsTooLeft
            | FaceIsNotFrontal | CameraStarted | CameraStopped | Sunglasses | MedicalMask => {
                StatusKind::Transient
            }
            _ => StatusKind::Fatal,
        }
    }

    pub fn is_success(self) -> bool {
        self.kind() == StatusKind::Success
    }
}

sdk_enum! {
    /// Enrollment hints and terminal statuses
    pub enum EnrollStatus {
        Success = 0,
        NoFaceDetected = 1,
        FaceDetected = 2,
        LedFlowSuccess = 3,
        FaceIsTooFarToTheTop = 4,
        FaceIsTooFarToTheBottom = 5,
        FaceIsTooFarToTheRight = 6,
        FaceIsTooFarToTheLeft = 7,
        FaceTiltIsTooUp = 8,
        FaceTiltIsTooDown = 9,
        FaceTiltIsTooRight = 10,
        FaceTiltIsTooLeft = 11,
        FaceIsNotFrontal = 12,
        CameraStarted = 13,
        CameraStopped = 14,
        Sunglasses = 15,
        MedicalMask = 16,
        MultipleFacesDetected = 17,
        Failure = 20,
        DeviceError = 21,
        Spoof = 22,
        InvalidFeatures = 23,
        Ok = 100,
        Error = 101,
        SerialError = 102,
        SecurityError = 103,
        VersionMismatch = 104,
        CrcError = 105,
        TooManySpoofs = 106,
        NotSupported = 107,
        DatabaseFull = 108,
        DuplicateUserId = 109,
        Spoof2D = 120,
        Spoof3D = 121,
        SpoofLR = 122,
        SpoofSurface = 123,
        SpoofDisparity = 124,
        SpoofVision = 125,
        Spoof2DRight = 126,
        SpoofPlaneDisparity = 127,
    }
}

impl EnrollStatus {
    pub fn kind(self) -> StatusKind {
        use EnrollStatus::*;
        match self {
            Success | Ok => StatusKind::Success,
            NoFaceDetected | FaceDetected | LedFlowSuccess | FaceIsTooFarToTheTop
            | FaceIsTooFarToTheBottom | FaceIsTooFarToTheRight | FaceIsTooFarToTheLeft
            | FaceTiltIsTooUp | FaceTiltIsTooDown | FaceTiltIsTooRight | FaceTiltIsTooLeft
            | FaceIsNotFrontal | CameraStarted | CameraStopped | Sunglasses | MedicalMask
            | MultipleFacesDetected => StatusKind::Transient,
            _ => StatusKind::Fatal,
        }
    }

    pub fn is_success(self) -> bool {
        self.kind() == StatusKind::Success
    }
}

sdk_enum! {
    /// Head pose requested during enrollment
    pub enum FacePose {
        Center = 0,
        Up = 1,
        Down = 2,
        Left = 3,
        Right = 4,
    }
}

sdk_enum! {
    pub enum AlgoFlow {
        All = 0,
        FaceDetectionOnly = 1,
        SpoofOnly = 2,
        RecognitionOnly = 3,
        PersonDetectionOnly = 4,
        PoseEstimationOnly = 5,
        BarcodeDecodingOnly = 6,
        BodyPartDetectionOnly = 7,
    }
}

sdk_enum! {
    pub enum CameraRotation {
        Rotation0Deg = 0,
        Rotation180Deg = 1,
        Rotation90Deg = 2,
        Rotation270Deg = 3,
    }
}

sdk_enum! {
    pub enum SecurityLevel {
        High = 0,
        Medium = 1,
        Low = 2,
    }
}

sdk_enum! {
    pub enum MatcherConfidenceLevel {
        High = 0,
        Medium = 1,
        Low = 2,
    }
}

impl MatcherConfidenceLevel {
    /// Minimum similarity the matcher accepts at this level
    pub fn min_score(self) -> f32 {
        match self {
            MatcherConfidenceLevel::High => 0.75,
            MatcherConfidenceLevel::Medium => 0.65,
            MatcherConfidenceLevel::Low => 0.55,
        }
    }
}

sdk_enum! {
    /// Camera family, decides the preview pipeline
    pub enum DeviceType {
        Unknown = -1,
        F45x = 0,
        F46x = 1,
    }
}

sdk_enum! {
    pub enum PreviewMode {
        Mjpeg1080p = 0,
        Mjpeg720p = 1,
        RawUnrectified = 2,
    }
}

/// Face bounding box reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// Faceprints extracted on-device for a single capture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedFaceprints {
    pub version: i32,
    pub features_type: i32,
    pub flags: i32,
    pub features: Vec<i16>,
}

/// Faceprints as persisted on the host
///
/// Immutable once built; updates replace the whole record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Faceprints {
    pub version: i32,
    pub features_type: i32,
    pub flags: i32,
    pub adaptive_descriptor_nomask: Vec<i16>,
    pub adaptive_descriptor_withmask: Vec<i16>,
    pub enroll_descriptor: Vec<i16>,
}

impl Faceprints {
    /// Template for a fresh enrollment: both the enroll and the adaptive
    /// descriptor start from the extracted features
    pub fn from_extracted(extracted: &ExtractedFaceprints) -> Self {
        Self {
            version: extracted.version,
            features_type: extracted.features_type,
            flags: extracted.flags,
            adaptive_descriptor_nomask: extracted.features.clone(),
            adaptive_descriptor_withmask: vec![0; FEATURES_ALLOC_SIZE],
            enroll_descriptor: extracted.features.clone(),
        }
    }

    /// Whether the descriptors are long enough to be compared
    pub fn is_well_formed(&self) -> bool {
        self.enroll_descriptor.len() >= NUM_RECOGNITION_FEATURES
            && self.adaptive_descriptor_nomask.len() >= NUM_RECOGNITION_FEATURES
    }
}

/// Result of comparing one extracted faceprint with one stored template
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MatchResult {
    pub success: bool,
    pub should_update: bool,
    pub score: f32,
}

/// Matcher output: the verdict plus the adapted template to persist when
/// `should_update` is set
#[derive(Debug, Clone)]
pub struct MatchOutput {
    pub result: MatchResult,
    pub updated: Faceprints,
}

/// Device-side configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub algo_flow: AlgoFlow,
    pub camera_rotation: CameraRotation,
    pub security_level: SecurityLevel,
    pub matcher_confidence_level: MatcherConfidenceLevel,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            algo_flow: AlgoFlow::All,
            camera_rotation: CameraRotation::Rotation0Deg,
            security_level: SecurityLevel::Medium,
            matcher_confidence_level: MatcherConfidenceLevel::High,
        }
    }
}

impl DeviceConfig {
    /// Pack into the register block the SDK exchanges with the device
    pub fn to_sdk(&self) -> [i32; 4] {
        [
            self.algo_flow.to_sdk(),
            self.camera_rotation.to_sdk(),
            self.security_level.to_sdk(),
            self.matcher_confidence_level.to_sdk(),
        ]
    }

    pub fn from_sdk(codes: [i32; 4]) -> Option<Self> {
        Some(Self {
            algo_flow: AlgoFlow::from_sdk(codes[0])?,
            camera_rotation: CameraRotation::from_sdk(codes[1])?,
            security_level: SecurityLevel::from_sdk(codes[2])?,
            matcher_confidence_level: MatcherConfidenceLevel::from_sdk(codes[3])?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub serial_number: String,
    pub firmware_version: String,
}

/// Host software plus device firmware release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub software_version_string: String,
    pub firmware_version_string: String,
    pub software_version: u64,
    pub firmware_version: u64,
    pub release_notes_url: Option<String>,
    pub release_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateCheck {
    pub update_available: bool,
    pub local_release: ReleaseInfo,
    pub remote_release: ReleaseInfo,
}

/// Contents of a firmware image file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareBinInfo {
    pub firmware_version: String,
    pub recognition_version: String,
    pub module_names: Vec<String>,
}

/// Firmware currently running on the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFirmwareInfo {
    pub firmware_version: String,
    pub recognition_version: String,
    pub serial_number: String,
}

/// Outcome of one firmware compatibility check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Compatibility {
    pub compatible: bool,
    pub message: String,
}

impl Compatibility {
    pub fn new(compatible: bool, message: impl Into<String>) -> Self {
        Self {
            compatible,
            message: message.into(),
        }
    }
}

/// What flashing a firmware image onto the device would do
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FirmwareUpdateReport {
    pub firmware_bin_info: FirmwareBinInfo,
    pub device_firmware_info: DeviceFirmwareInfo,
    pub sku: Compatibility,
    pub host: Compatibility,
    /// False when enrolled users would not survive the update
    pub db: Compatibility,
    pub update_policy: Compatibility,
}

impl FirmwareUpdateReport {
    pub fn is_compatible(&self) -> bool {
        [&self.sku, &self.host, &self.db, &self.update_policy]
            .iter()
            .all(|c| c.compatible)
    }
}

/// Pack a dotted version (`7.9.0.1`, at most four parts below 65536) into
/// one comparable number
pub fn version_number(version: &str) -> Option<u64> {
    let parts: Vec<u64> = version
        .trim()
        .split('.')
        .map(|p| p.parse::<u64>().ok().filter(|v| *v <= 0xFFFF))
        .collect::<Option<_>>()?;
    if parts.is_empty() || parts.len() > 4 {
        return None;
    }
    Some(
        parts
            .iter()
            .chain(std::iter::repeat(&0))
            .take(4)
            .fold(0u64, |acc, p| (acc << 16) | p),
    )
}

/// Preview pipeline parameters handed to the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviewSettings {
    /// -1 selects the camera automatically
    pub camera_number: i32,
    pub mode: PreviewMode,
    pub device_type: DeviceType,
}

/// One raw preview frame as delivered by the driver (packed RGB24)
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}
