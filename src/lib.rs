//! Facegate library
//!
//! Serializes access to a single face-authentication camera, bridges the
//! driver's callback API into awaitable operations, multiplexes the live
//! preview to many viewers, and matches extracted faceprints against a
//! host-side vector store.

pub mod biometrics;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod imaging;
pub mod paths;
pub mod preview;
pub mod validation;

pub use coordinator::{AuthenticationResponse, DeviceCoordinator, EnrollResponse};
pub use error::{Error, Result};
