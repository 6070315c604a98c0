//! Listener probes that feed a `ResultGate`
//!
//! Probes run in the driver's context. They only log hints, record the last
//! face rectangles, and publish the terminal status; everything else
//! happens after the waiter resumes.

use std::sync::Mutex;

use crate::device::{
    AuthenticateStatus, AuthenticationListener, EnrollStatus, EnrollmentListener,
    ExtractedFaceprints, ExtractionListener, FacePose, FaceRect, ResultGate,
};

/// Terminal outcome of on-device authentication
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub status: AuthenticateStatus,
    pub user_id: Option<String>,
}

/// Terminal outcome of a faceprint extraction flow
#[derive(Debug, Clone)]
pub struct ExtractionOutcome<S> {
    pub status: S,
    pub faceprints: Option<ExtractedFaceprints>,
}

pub struct CallbackProbe<O> {
    gate: ResultGate<O>,
    faces: Mutex<Vec<FaceRect>>,
}

impl<O> CallbackProbe<O> {
    pub fn new(gate: ResultGate<O>) -> Self {
        Self {
            gate,
            faces: Mutex::new(Vec::new()),
        }
    }

    /// Face rectangles from the most recent `on_faces` callback
    pub fn faces(&self) -> Vec<FaceRect> {
        self.faces.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record_faces(&self, faces: &[FaceRect]) {
        log::debug!("Detected {} face(s)", faces.len());
        *self.faces.lock().unwrap_or_else(|e| e.into_inner()) = faces.to_vec();
    }
}

impl AuthenticationListener for CallbackProbe<AuthOutcome> {
    fn on_hint(&self, hint: AuthenticateStatus) {
        log::debug!("on_hint {}", hint);
    }

    fn on_faces(&self, faces: &[FaceRect]) {
        self.record_faces(faces);
    }

    fn on_result(&self, status: AuthenticateStatus, user_id: Option<String>) {
        log::debug!("on_result {}", status);
        self.gate.publish(AuthOutcome { status, user_id });
    }
}

impl EnrollmentListener for CallbackProbe<EnrollStatus> {
    fn on_hint(&self, hint: EnrollStatus) {
        log::debug!("on_hint {}", hint);
    }

    fn on_progress(&self, pose: FacePose) {
        log::debug!("on_progress {}", pose);
    }

    fn on_faces(&self, faces: &[FaceRect]) {
        self.record_faces(faces);
    }

    fn on_result(&self, status: EnrollStatus) {
        log::debug!("on_result {}", status);
        self.gate.publish(status);
    }
}

impl<S> ExtractionListener<S> for CallbackProbe<ExtractionOutcome<S>>
where
    S: std::fmt::Display + Send + Sync,
{
    fn on_hint(&self, hint: S) {
        log::debug!("on_hint {}", hint);
    }

    fn on_progress(&self, pose: FacePose) {
        log::debug!("on_progress {}", pose);
    }

    fn on_faces(&self, faces: &[FaceRect]) {
        self.record_faces(faces);
    }

    fn on_result(&self, status: S, faceprints: Option<ExtractedFaceprints>) {
        log::debug!(
            "on_result {} (faceprints: {})",
            status,
            faceprints.is_some()
        );
        self.gate.publish(ExtractionOutcome { status, faceprints });
    }
}
