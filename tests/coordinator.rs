use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use facegate_lib::biometrics::{LocalFileStore, VectorStore};
use facegate_lib::config::{AppConfig, DbMode};
use facegate_lib::device::stub::SimulatedDevice;
use facegate_lib::device::{
    version_number, AuthenticateStatus, EnrollStatus, ReleaseInfo, SecurityLevel,
};
use facegate_lib::{DeviceCoordinator, Error};
use image::{ImageFormat, Rgb, RgbImage};
use tempfile::TempDir;

struct Rig {
    sim: SimulatedDevice,
    store: Arc<LocalFileStore>,
    coordinator: Arc<DeviceCoordinator>,
    _dir: TempDir,
}

fn rig(db_mode: DbMode) -> Rig {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(LocalFileStore::open(&dir.path().join("vectors.db")).unwrap());
    let sim = SimulatedDevice::new();
    let mut config = AppConfig::default();
    config.device.db_mode = db_mode;
    let coordinator =
        DeviceCoordinator::new(Arc::new(sim.clone()), store.clone(), &config).unwrap();
    Rig {
        sim,
        store,
        coordinator: Arc::new(coordinator),
        _dir: dir,
    }
}

fn png(seed: u8) -> Vec<u8> {
    let img = RgbImage::from_fn(32, 24, |x, y| {
        Rgb([x as u8 ^ seed, y as u8 ^ seed, seed.wrapping_mul(7)])
    });
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_operations_never_overlap() {
    let rig = rig(DbMode::Device);
    rig.sim.present_subject(11);
    rig.sim.set_operation_delay(Duration::from_millis(20));

    let mut tasks = Vec::new();
    for _ in 0..6 {
        let coordinator = Arc::clone(&rig.coordinator);
        tasks.push(tokio::spawn(async move { coordinator.authenticate().await }));
    }
    for task in tasks {
        let response = task.await.unwrap().unwrap();
        assert_eq!(response.status, AuthenticateStatus::Forbidden);
    }

    assert_eq!(rig.sim.sessions_opened(), 6);
    assert_eq!(rig.sim.max_concurrent_sessions(), 1);
    assert_eq!(rig.sim.open_sessions(), 0);
}

#[tokio::test]
async fn test_device_enroll_then_authenticate() {
    let rig = rig(DbMode::Device);
    rig.sim.present_subject(7);

    let enrolled = rig.coordinator.enroll("alice").await.unwrap();
    assert_eq!(enrolled.status, EnrollStatus::Success);
    assert_eq!(enrolled.user_id, "alice");
    assert_eq!(rig.sim.device_users(), vec!["alice".to_string()]);

    let auth = rig.coordinator.authenticate().await.unwrap();
    assert_eq!(auth.status, AuthenticateStatus::Success);
    assert_eq!(auth.user_id.as_deref(), Some("alice"));
    assert_eq!(auth.faces.len(), 1);

    let again = rig.coordinator.enroll("alice").await.unwrap();
    assert_eq!(again.status, EnrollStatus::DuplicateUserId);
}

#[tokio::test]
async fn test_no_face_is_a_status_not_an_error() {
    let rig = rig(DbMode::Device);
    let auth = rig.coordinator.authenticate().await.unwrap();
    assert_eq!(auth.status, AuthenticateStatus::NoFaceDetected);
    assert!(auth.user_id.is_none());
    assert!(auth.faces.is_empty());
}

#[tokio::test]
async fn test_host_enroll_and_authenticate() {
    let rig = rig(DbMode::Host);
    rig.sim.present_subject(3);

    let enrolled = rig.coordinator.enroll_host("carol").await.unwrap();
    assert_eq!(enrolled.status, EnrollStatus::Success);
    assert_eq!(rig.store.list_user_ids().unwrap(), vec!["carol".to_string()]);
    assert!(rig.sim.device_users().is_empty());

    let auth = rig.coordinator.authenticate_host().await.unwrap();
    assert_eq!(auth.status, AuthenticateStatus::Success);
    assert_eq!(auth.user_id.as_deref(), Some("carol"));

    rig.sim.present_subject(4);
    let stranger = rig.coordinator.authenticate_host().await.unwrap();
    assert_eq!(stranger.status, AuthenticateStatus::Forbidden);
    assert!(stranger.user_id.is_none());
}

#[tokio::test]
async fn test_host_duplicate_skips_the_device() {
    let rig = rig(DbMode::Host);
    rig.sim.present_subject(3);
    rig.coordinator.enroll_host("carol").await.unwrap();
    let opened = rig.sim.sessions_opened();

    let again = rig.coordinator.enroll_host("carol").await.unwrap();
    assert_eq!(again.status, EnrollStatus::DuplicateUserId);
    assert_eq!(rig.sim.sessions_opened(), opened);
    assert_eq!(rig.store.list_all().unwrap().len(), 1);
}

#[tokio::test]
async fn test_failed_extraction_writes_nothing() {
    let rig = rig(DbMode::Host);
    rig.sim.present_subject(1);
    rig.sim.force_enroll_status(EnrollStatus::DuplicateUserId);

    let response = rig.coordinator.enroll_host("bob").await.unwrap();
    assert_eq!(response.status, EnrollStatus::DuplicateUserId);
    assert!(rig.coordinator.query_host_users().await.unwrap().is_empty());

    rig.sim.force_enroll_status(EnrollStatus::Spoof);
    let response = rig.coordinator.enroll_host("bob").await.unwrap();
    assert_eq!(response.status, EnrollStatus::Spoof);
    assert!(rig.store.list_all().unwrap().is_empty());
}

#[tokio::test]
async fn test_host_auth_failure_status_is_returned() {
    let rig = rig(DbMode::Host);
    rig.sim.present_subject(5);
    rig.sim.force_auth_status(AuthenticateStatus::Spoof);

    let auth = rig.coordinator.authenticate_host().await.unwrap();
    assert_eq!(auth.status, AuthenticateStatus::Spoof);
    assert!(auth.user_id.is_none());
}

#[tokio::test]
async fn test_unavailable_device_releases_the_lock() {
    let rig = rig(DbMode::Device);
    rig.sim.set_available(false);
    assert!(matches!(
        rig.coordinator.authenticate().await,
        Err(Error::DeviceUnavailable { .. })
    ));

    rig.sim.set_available(true);
    let auth = tokio::time::timeout(Duration::from_secs(5), rig.coordinator.authenticate())
        .await
        .expect("device lock was not released")
        .unwrap();
    assert_eq!(auth.status, AuthenticateStatus::NoFaceDetected);
}

#[tokio::test]
async fn test_setup_failure_disconnects() {
    let rig = rig(DbMode::Device);
    rig.sim.fail_next_operation();

    assert!(matches!(
        rig.coordinator.enroll("dave").await,
        Err(Error::Driver(_))
    ));
    assert_eq!(rig.sim.open_sessions(), 0);
    assert_eq!(rig.sim.sessions_opened(), 1);

    rig.sim.present_subject(9);
    let retry = rig.coordinator.enroll("dave").await.unwrap();
    assert_eq!(retry.status, EnrollStatus::Success);
}

#[tokio::test]
async fn test_missing_terminal_status() {
    let rig = rig(DbMode::Device);
    rig.sim.drop_next_result();

    assert!(matches!(
        rig.coordinator.authenticate().await,
        Err(Error::MissingResult("authenticate"))
    ));
    assert_eq!(rig.sim.open_sessions(), 0);
}

#[tokio::test]
async fn test_invalid_user_id_never_reaches_the_device() {
    let rig = rig(DbMode::Device);
    assert!(matches!(
        rig.coordinator.enroll("bad\nuser").await,
        Err(Error::Validation(_))
    ));
    assert!(matches!(
        rig.coordinator.enroll_host("").await,
        Err(Error::Validation(_))
    ));
    assert_eq!(rig.sim.sessions_opened(), 0);
}

#[tokio::test]
async fn test_remove_device_users() {
    let rig = rig(DbMode::Device);
    assert!(matches!(
        rig.coordinator.remove_device_user("ghost").await,
        Err(Error::NotFound(_))
    ));

    rig.sim.present_subject(1);
    rig.coordinator.enroll("erin").await.unwrap();
    rig.sim.present_subject(2);
    rig.coordinator.enroll("frank").await.unwrap();

    rig.coordinator.remove_device_user("erin").await.unwrap();
    assert_eq!(
        rig.coordinator.query_device_users().await.unwrap(),
        vec!["frank".to_string()]
    );

    rig.coordinator.remove_all_device_users().await.unwrap();
    assert!(rig.sim.device_users().is_empty());
}

#[tokio::test]
async fn test_remove_host_users() {
    let rig = rig(DbMode::Host);
    assert!(matches!(
        rig.coordinator.remove_host_user("ghost").await,
        Err(Error::NotFound(_))
    ));

    rig.sim.present_subject(1);
    rig.coordinator.enroll_host("erin").await.unwrap();
    rig.sim.present_subject(2);
    rig.coordinator.enroll_host("frank").await.unwrap();

    rig.coordinator.remove_host_user("erin").await.unwrap();
    assert_eq!(
        rig.coordinator.query_host_users().await.unwrap(),
        vec!["frank".to_string()]
    );
    assert_eq!(rig.coordinator.remove_all_host_users().await.unwrap(), 1);
    assert!(rig.store.list_all().unwrap().is_empty());
}

#[tokio::test]
async fn test_user_listing_follows_db_mode() {
    let device = rig(DbMode::Device);
    device.sim.present_subject(1);
    device.coordinator.enroll("on-device").await.unwrap();
    assert_eq!(
        device.coordinator.list_users().await.unwrap(),
        vec!["on-device".to_string()]
    );
    device.coordinator.remove_user("on-device").await.unwrap();
    assert!(device.coordinator.list_users().await.unwrap().is_empty());

    let host = rig(DbMode::Host);
    host.sim.present_subject(1);
    host.coordinator.enroll_host("on-host").await.unwrap();
    host.coordinator.enroll("device-only").await.unwrap();
    assert_eq!(
        host.coordinator.list_users().await.unwrap(),
        vec!["on-host".to_string()]
    );
    host.coordinator.remove_all_users().await.unwrap();
    assert!(host.coordinator.list_users().await.unwrap().is_empty());
    assert_eq!(host.sim.device_users(), vec!["device-only".to_string()]);
}

#[tokio::test]
async fn test_device_config_round_trip() {
    let rig = rig(DbMode::Device);
    let mut config = rig.coordinator.query_device_config().await.unwrap();
    config.security_level = SecurityLevel::Low;

    let applied = rig.coordinator.update_device_config(config).await.unwrap();
    assert_eq!(applied, config);
    assert_eq!(rig.coordinator.query_device_config().await.unwrap(), config);
}

#[tokio::test]
async fn test_device_info() {
    let rig = rig(DbMode::Device);
    let info = rig.coordinator.query_device_info().await.unwrap();
    assert!(!info.serial_number.is_empty());
    assert!(!info.firmware_version.is_empty());
    assert_eq!(rig.sim.sessions_opened(), 1);
}

#[tokio::test]
async fn test_image_enrollment() {
    let rig = rig(DbMode::Host);

    let host = rig
        .coordinator
        .enroll_host_image("gina", png(1))
        .await
        .unwrap();
    assert_eq!(host.status, EnrollStatus::Success);
    assert_eq!(rig.store.list_user_ids().unwrap(), vec!["gina".to_string()]);

    let device = rig.coordinator.enroll_image("hank", png(2)).await.unwrap();
    assert_eq!(device.status, EnrollStatus::Success);
    assert_eq!(rig.sim.device_users(), vec!["hank".to_string()]);

    assert!(matches!(
        rig.coordinator
            .enroll_host_image("ivan", b"not an image".to_vec())
            .await,
        Err(Error::Image(_))
    ));
}

#[tokio::test]
async fn test_results_delivered_after_the_driver_call_returns() {
    let rig = rig(DbMode::Device);
    rig.sim.present_subject(21);
    rig.sim.set_result_lag(Duration::from_millis(20));

    let enrolled = rig.coordinator.enroll("late-alice").await.unwrap();
    assert_eq!(enrolled.status, EnrollStatus::Success);

    let auth = rig.coordinator.authenticate().await.unwrap();
    assert_eq!(auth.status, AuthenticateStatus::Success);
    assert_eq!(auth.user_id.as_deref(), Some("late-alice"));
    assert_eq!(rig.sim.open_sessions(), 0);
}

#[tokio::test]
async fn test_late_host_extraction_is_stored() {
    let rig = rig(DbMode::Host);
    rig.sim.present_subject(22);
    rig.sim.set_result_lag(Duration::from_millis(20));

    let enrolled = rig.coordinator.enroll_host("late-bob").await.unwrap();
    assert_eq!(enrolled.status, EnrollStatus::Success);
    let auth = rig.coordinator.authenticate_host().await.unwrap();
    assert_eq!(auth.user_id.as_deref(), Some("late-bob"));

    rig.sim.drop_next_result();
    assert!(matches!(
        rig.coordinator.authenticate_host().await,
        Err(Error::MissingResult("extract_faceprints_for_auth"))
    ));
}

#[tokio::test]
async fn test_ok_extraction_counts_as_success() {
    let rig = rig(DbMode::Host);
    rig.sim.present_subject(23);
    rig.sim.force_enroll_status(EnrollStatus::Ok);

    let response = rig.coordinator.enroll_host("olga").await.unwrap();
    assert_eq!(response.status, EnrollStatus::Success);
    assert_eq!(rig.store.list_user_ids().unwrap(), vec!["olga".to_string()]);
}

#[tokio::test]
async fn test_user_ids_with_spaces() {
    let rig = rig(DbMode::Host);
    rig.sim.present_subject(24);

    let response = rig.coordinator.enroll_host("John Smith").await.unwrap();
    assert_eq!(response.status, EnrollStatus::Success);
    rig.coordinator.remove_host_user("John Smith").await.unwrap();
    assert!(rig.store.list_all().unwrap().is_empty());
}

#[tokio::test]
async fn test_update_check() {
    let rig = rig(DbMode::Device);
    let check = rig.coordinator.query_update_status().await.unwrap();
    assert!(!check.update_available);
    assert_eq!(check.local_release, check.remote_release);

    let newer = ReleaseInfo {
        firmware_version_string: "7.10.0.3".into(),
        firmware_version: version_number("7.10.0.3").unwrap(),
        release_url: Some("https://example.invalid/fw".into()),
        ..SimulatedDevice::local_release()
    };
    rig.sim.set_remote_release(Some(newer.clone()));
    let check = rig.coordinator.query_update_status().await.unwrap();
    assert!(check.update_available);
    assert_eq!(check.remote_release, newer);
    assert_eq!(rig.sim.max_concurrent_sessions(), 1);
}

fn firmware_file(dir: &TempDir, name: &str, body: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, body).unwrap();
    path
}

#[tokio::test]
async fn test_firmware_compatibility_report() {
    let rig = rig(DbMode::Device);
    let dir = TempDir::new().unwrap();

    let good = firmware_file(
        &dir,
        "good.bin",
        r#"
firmware_version = "7.10.0.2"
recognition_version = "7.10.0.2"
module_names = ["OPFW", "NNLED", "RECOG"]
sku = "F45x"
min_host_version = "0.39.0"
"#,
    );
    let report = rig.coordinator.query_fw_update_status(&good).await.unwrap();
    assert!(report.is_compatible());
    assert_eq!(report.firmware_bin_info.module_names.len(), 3);
    assert_eq!(report.device_firmware_info.serial_number, "SIM-0001");

    let bad = firmware_file(
        &dir,
        "bad.bin",
        r#"
firmware_version = "7.8.0.0"
recognition_version = "8.0.0.0"
module_names = ["OPFW"]
sku = "F46x"
min_host_version = "9.0.0"
"#,
    );
    let report = rig.coordinator.query_fw_update_status(&bad).await.unwrap();
    assert!(!report.is_compatible());
    assert!(!report.sku.compatible);
    assert!(!report.host.compatible);
    assert!(!report.db.compatible);
    assert!(!report.update_policy.compatible);
    assert!(report.update_policy.message.contains("Downgrade"));

    let garbage = firmware_file(&dir, "garbage.bin", "\u{0}not a manifest");
    assert!(matches!(
        rig.coordinator.query_fw_update_status(&garbage).await,
        Err(Error::Firmware(_))
    ));
    assert!(matches!(
        rig.coordinator
            .query_fw_update_status(&dir.path().join("missing.bin"))
            .await,
        Err(Error::Firmware(_))
    ));
    assert_eq!(rig.sim.open_sessions(), 0);
}
