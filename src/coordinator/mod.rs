//! Device coordinator
//!
//! Single entry point for everything that touches the camera. Each
//! operation takes the device lock, opens a session on a blocking worker,
//! runs the driver call, disconnects, and only then releases the lock.
//! Callback-driven flows publish their terminal status into a
//! `ResultGate`; host-side matching and store writes run after the lock
//! is released.

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use crate::biometrics::{MatchDecision, MatchPolicy, MatchSelector, StoreError, VectorStore};
use crate::config::{AppConfig, DbMode, DeviceSettings};
use crate::device::{
    new_device_lock, AuthenticateStatus, DeviceConfig, DeviceDriver, DeviceInfo, DeviceLock,
    DeviceSession, EnrollStatus, Faceprints, FaceRect, FirmwareUpdateReport, PreviewMode,
    PreviewSettings, ResultGate, Status, UpdateCheck,
};
use crate::error::{Error, Result};
use crate::imaging::{self, BgrImage};
use crate::preview::{PreviewHub, PreviewSubscription};
use crate::validation::{validate_port, validate_user_id};

mod probe;

pub use probe::{AuthOutcome, CallbackProbe, ExtractionOutcome};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthenticationResponse {
    pub status: AuthenticateStatus,
    pub user_id: Option<String>,
    pub faces: Vec<FaceRect>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrollResponse {
    pub status: EnrollStatus,
    pub user_id: String,
}

/// Pick the port to talk to: the last port the driver reports when
/// auto-detecting, the configured one otherwise
pub fn resolve_port(driver: &dyn DeviceDriver, settings: &DeviceSettings) -> Result<String> {
    if settings.auto_detect {
        let ports = driver.discover_ports();
        log::debug!("Discovered ports: {:?}", ports);
        return ports.last().cloned().ok_or_else(|| Error::DeviceUnavailable {
            port: "auto".into(),
            reason: "no device found".into(),
        });
    }

    match settings.port.as_deref() {
        Some(port) => Ok(validate_port(port)?),
        None => Err(Error::DeviceUnavailable {
            port: "<unset>".into(),
            reason: "auto-detect is off and no port is configured".into(),
        }),
    }
}

fn expect_ok(operation: &'static str, status: Status) -> Result<()> {
    if status == Status::Ok {
        Ok(())
    } else {
        Err(Error::OperationFailed {
            operation,
            status: status.to_string(),
        })
    }
}

pub struct DeviceCoordinator {
    driver: Arc<dyn DeviceDriver>,
    port: String,
    device_lock: DeviceLock,
    store: Arc<dyn VectorStore>,
    selector: Arc<MatchSelector>,
    db_mode: DbMode,
    max_image_bytes: usize,
    preview: PreviewHub,
}

impl DeviceCoordinator {
    pub fn new(
        driver: Arc<dyn DeviceDriver>,
        store: Arc<dyn VectorStore>,
        config: &AppConfig,
    ) -> Result<Self> {
        let port = resolve_port(driver.as_ref(), &config.device)?;
        let device_lock = new_device_lock();

        let settings = PreviewSettings {
            camera_number: config.preview.camera_number,
            mode: PreviewMode::Mjpeg1080p,
            device_type: driver.discover_device_type(&port),
        };
        let preview = PreviewHub::new(
            driver.preview_source(&port),
            Arc::clone(&device_lock),
            settings,
            &config.preview,
        );
        let selector = Arc::new(MatchSelector::new(
            Arc::clone(&store),
            driver.matcher(),
            MatchPolicy::from_config(&config.host_mode),
        ));

        log::info!(
            "Device coordinator ready on {} ({}, db mode {:?})",
            port,
            settings.device_type,
            config.device.db_mode
        );

        Ok(Self {
            driver,
            port,
            device_lock,
            store,
            selector,
            db_mode: config.device.db_mode,
            max_image_bytes: config.enroll.max_image_bytes,
            preview,
        })
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn db_mode(&self) -> DbMode {
        self.db_mode
    }

    pub fn preview(&self) -> &PreviewHub {
        &self.preview
    }

    pub async fn subscribe_preview(&self) -> Result<PreviewSubscription> {
        self.preview.subscribe().await
    }

    /// Run `f` on an exclusive session
    ///
    /// The device lock travels into the blocking worker, so it is held until
    /// the session is disconnected even if the caller stops waiting.
    async fn with_session<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn DeviceSession) -> Result<T> + Send + 'static,
    {
        let device = Arc::clone(&self.device_lock).lock_owned().await;
        let driver = Arc::clone(&self.driver);
        let port = self.port.clone();
        log::info!("{} on {}", operation, port);

        tokio::task::spawn_blocking(move || {
            let _device = device;
            let mut session = driver.open(&port)?;
            let outcome = f(session.as_mut());
            session.disconnect();
            if let Err(e) = &outcome {
                log::error!("{} failed: {}", operation, e);
            }
            outcome
        })
        .await
        .map_err(|e| Error::Driver(format!("{} worker failed: {}", operation, e)))?
    }

    /// Run a callback-driven flow and wait for its terminal status
    ///
    /// The driver may deliver the result from its own thread at any point
    /// until `disconnect` returns, so the gate is only judged afterwards. A
    /// setup failure settles it unless a result already arrived; a session
    /// that closed without either settles it with `MissingResult`.
    async fn with_callback_session<O, F>(
        &self,
        operation: &'static str,
        gate: ResultGate<O>,
        f: F,
    ) -> Result<O>
    where
        O: Send + 'static,
        F: FnOnce(&mut dyn DeviceSession) -> Result<()> + Send + 'static,
    {
        if let Err(e) = self.with_session(operation, f).await {
            gate.fail(e);
        }
        gate.close(operation);

        gate.wait().await
    }

    async fn with_store<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn VectorStore) -> std::result::Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| Error::Driver(format!("store worker failed: {}", e)))?
            .map_err(Error::from)
    }

    async fn decode_image(&self, bytes: Vec<u8>) -> Result<BgrImage> {
        let max = self.max_image_bytes;
        tokio::task::spawn_blocking(move || imaging::decode_enroll_image(&bytes, max))
            .await
            .map_err(|e| Error::Image(e.to_string()))?
    }

    async fn host_has_user(&self, user_id: &str) -> Result<bool> {
        let user_id = user_id.to_string();
        self.with_store(move |store| Ok(store.list_user_ids()?.contains(&user_id)))
            .await
    }

    /// Persist a freshly extracted template; an existing identity maps to
    /// `DuplicateUserId` and nothing is written
    async fn store_new_template(&self, user_id: &str, faceprints: Faceprints) -> Result<EnrollStatus> {
        let owner = user_id.to_string();
        match self
            .with_store(move |store| store.insert(&owner, &faceprints))
            .await
        {
            Ok(template) => {
                log::info!("Stored template {} for {}", template.id, user_id);
                Ok(EnrollStatus::Success)
            }
            Err(Error::Duplicate(_)) => Ok(EnrollStatus::DuplicateUserId),
            Err(e) => Err(e),
        }
    }

    /// On-device authentication against the device's own user table
    pub async fn authenticate(&self) -> Result<AuthenticationResponse> {
        let gate = ResultGate::new();
        let probe = Arc::new(CallbackProbe::<AuthOutcome>::new(gate.clone()));
        let listener = Arc::clone(&probe);

        let outcome = self
            .with_callback_session("authenticate", gate, move |session| {
                session.authenticate(listener)
            })
            .await?;

        Ok(AuthenticationResponse {
            status: outcome.status,
            user_id: outcome.user_id,
            faces: probe.faces(),
        })
    }

    /// Extract on device, match against the host vector store
    pub async fn authenticate_host(&self) -> Result<AuthenticationResponse> {
        let gate = ResultGate::new();
        let probe = Arc::new(CallbackProbe::<ExtractionOutcome<AuthenticateStatus>>::new(
            gate.clone(),
        ));
        let listener = Arc::clone(&probe);

        let outcome = self
            .with_callback_session("extract_faceprints_for_auth", gate, move |session| {
                session.extract_faceprints_for_auth(listener)
            })
            .await?;
        let faces = probe.faces();

        if !outcome.status.is_success() {
            return Ok(AuthenticationResponse {
                status: outcome.status,
                user_id: None,
                faces,
            });
        }
        let extracted = outcome.faceprints.ok_or_else(|| {
            Error::Driver("extraction succeeded without faceprints".into())
        })?;

        let selector = Arc::clone(&self.selector);
        let decision = tokio::task::spawn_blocking(move || selector.identify(&extracted))
            .await
            .map_err(|e| Error::Driver(format!("match worker failed: {}", e)))??;

        Ok(match decision {
            MatchDecision::Matched { user_id, score, .. } => {
                log::info!("Authenticated {} (score {:.3})", user_id, score);
                AuthenticationResponse {
                    status: outcome.status,
                    user_id: Some(user_id),
                    faces,
                }
            }
            MatchDecision::Forbidden => AuthenticationResponse {
                status: AuthenticateStatus::Forbidden,
                user_id: None,
                faces,
            },
        })
    }

    /// Enroll into the device's own user table
    pub async fn enroll(&self, user_id: &str) -> Result<EnrollResponse> {
        let user_id = validate_user_id(user_id)?;
        log::info!("Enrolling user: {}", user_id);

        let gate = ResultGate::new();
        let listener = Arc::new(CallbackProbe::<EnrollStatus>::new(gate.clone()));
        let uid = user_id.clone();

        let status = self
            .with_callback_session("enroll", gate, move |session| {
                session.enroll(&uid, listener)
            })
            .await?;

        Ok(EnrollResponse { status, user_id })
    }

    /// Extract on device and store the template on the host
    pub async fn enroll_host(&self, user_id: &str) -> Result<EnrollResponse> {
        let user_id = validate_user_id(user_id)?;
        if self.host_has_user(&user_id).await? {
            log::warn!("{} is already enrolled on the host", user_id);
            return Ok(EnrollResponse {
                status: EnrollStatus::DuplicateUserId,
                user_id,
            });
        }

        let gate = ResultGate::new();
        let listener = Arc::new(CallbackProbe::<ExtractionOutcome<EnrollStatus>>::new(
            gate.clone(),
        ));

        let outcome = self
            .with_callback_session("extract_faceprints_for_enroll", gate, move |session| {
                session.extract_faceprints_for_enroll(listener)
            })
            .await?;

        let status = match (outcome.status, outcome.faceprints) {
            (status, Some(extracted)) if status.is_success() => {
                self.store_new_template(&user_id, Faceprints::from_extracted(&extracted))
                    .await?
            }
            (status, None) if status.is_success() => {
                return Err(Error::Driver("extraction succeeded without faceprints".into()))
            }
            (status, _) => status,
        };

        Ok(EnrollResponse { status, user_id })
    }

    /// Enroll a still image into the device's user table
    pub async fn enroll_image(&self, user_id: &str, image_bytes: Vec<u8>) -> Result<EnrollResponse> {
        let user_id = validate_user_id(user_id)?;
        let image = self.decode_image(image_bytes).await?;
        log::info!(
            "Enrolling {} from a {}x{} image",
            user_id,
            image.width,
            image.height
        );

        let uid = user_id.clone();
        let status = self
            .with_session("enroll_image", move |session| {
                session.enroll_image(&uid, &image)
            })
            .await?;

        Ok(EnrollResponse { status, user_id })
    }

    /// Extract a still image's faceprints on device and store them on the host
    pub async fn enroll_host_image(
        &self,
        user_id: &str,
        image_bytes: Vec<u8>,
    ) -> Result<EnrollResponse> {
        let user_id = validate_user_id(user_id)?;
        if self.host_has_user(&user_id).await? {
            return Ok(EnrollResponse {
                status: EnrollStatus::DuplicateUserId,
                user_id,
            });
        }
        let image = self.decode_image(image_bytes).await?;

        let (status, extracted) = self
            .with_session("extract_image_faceprints_for_enroll", move |session| {
                session.extract_image_faceprints_for_enroll(&image)
            })
            .await?;

        let status = match (status, extracted) {
            (status, Some(extracted)) if status.is_success() => {
                self.store_new_template(&user_id, Faceprints::from_extracted(&extracted))
                    .await?
            }
            (status, None) if status.is_success() => {
                return Err(Error::Driver("extraction succeeded without faceprints".into()))
            }
            (status, _) => status,
        };

        Ok(EnrollResponse { status, user_id })
    }

    pub async fn query_device_users(&self) -> Result<Vec<String>> {
        self.with_session("query_user_ids", |session| session.query_user_ids())
            .await
    }

    /// Remove one user from the device table; `NotFound` if absent
    pub async fn remove_device_user(&self, user_id: &str) -> Result<()> {
        let user_id = validate_user_id(user_id)?;
        self.with_session("remove_user", move |session| {
            if !session.query_user_ids()?.contains(&user_id) {
                return Err(Error::NotFound(user_id));
            }
            expect_ok("remove_user", session.remove_user(&user_id)?)
        })
        .await
    }

    pub async fn remove_all_device_users(&self) -> Result<()> {
        self.with_session("remove_all_users", |session| {
            expect_ok("remove_all_users", session.remove_all_users()?)
        })
        .await
    }

    pub async fn query_host_users(&self) -> Result<Vec<String>> {
        self.with_store(|store| store.list_user_ids()).await
    }

    /// `NotFound` when absent, `Integrity` when the store holds duplicates
    pub async fn remove_host_user(&self, user_id: &str) -> Result<()> {
        let user_id = validate_user_id(user_id)?;
        self.with_store(move |store| store.delete_user(&user_id))
            .await
    }

    /// Returns the number of removed templates
    pub async fn remove_all_host_users(&self) -> Result<usize> {
        self.with_store(|store| store.delete_all()).await
    }

    /// Users of the configured database (device table or host store)
    pub async fn list_users(&self) -> Result<Vec<String>> {
        match self.db_mode {
            DbMode::Device => self.query_device_users().await,
            DbMode::Host => self.query_host_users().await,
        }
    }

    pub async fn remove_user(&self, user_id: &str) -> Result<()> {
        match self.db_mode {
            DbMode::Device => self.remove_device_user(user_id).await,
            DbMode::Host => self.remove_host_user(user_id).await,
        }
    }

    pub async fn remove_all_users(&self) -> Result<()> {
        match self.db_mode {
            DbMode::Device => self.remove_all_device_users().await,
            DbMode::Host => self.remove_all_host_users().await.map(|_| ()),
        }
    }

    pub async fn query_device_info(&self) -> Result<DeviceInfo> {
        self.with_session("query_device_info", |session| {
            Ok(DeviceInfo {
                serial_number: session.query_serial_number()?,
                firmware_version: session.query_firmware_version()?,
            })
        })
        .await
    }

    /// Ask whether a newer host/firmware release is published
    pub async fn query_update_status(&self) -> Result<UpdateCheck> {
        let check = self
            .with_session("check_for_update", |session| session.check_for_update())
            .await?;
        log::info!(
            "Installed firmware {}, newest {} (update available: {})",
            check.local_release.firmware_version_string,
            check.remote_release.firmware_version_string,
            check.update_available
        );
        Ok(check)
    }

    /// Check a firmware image against the connected device without flashing it
    pub async fn query_fw_update_status(&self, firmware: &Path) -> Result<FirmwareUpdateReport> {
        let firmware = firmware.to_path_buf();
        self.with_session("inspect_firmware", move |session| {
            let mut inspector = session.open_firmware(&firmware)?;
            let report = FirmwareUpdateReport {
                firmware_bin_info: inspector.firmware_bin_info()?,
                device_firmware_info: inspector.device_firmware_info()?,
                sku: inspector.sku_compatibility(),
                host: inspector.host_compatibility(),
                db: inspector.db_compatibility(),
                update_policy: inspector.policy_compatibility(),
            };
            log::info!(
                "Firmware {} -> {}: compatible={}",
                report.device_firmware_info.firmware_version,
                report.firmware_bin_info.firmware_version,
                report.is_compatible()
            );
            Ok(report)
        })
        .await
    }

    pub async fn query_device_config(&self) -> Result<DeviceConfig> {
        self.with_session("query_device_config", |session| {
            session.query_device_config()
        })
        .await
    }

    /// Write the config, then return what the device reports back
    pub async fn update_device_config(&self, config: DeviceConfig) -> Result<DeviceConfig> {
        self.with_session("set_device_config", move |session| {
            expect_ok("set_device_config", session.set_device_config(&config)?)?;
            session.query_device_config()
        })
        .await
    }
}
