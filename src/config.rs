use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::validation::{
    validate_camera_number, validate_image_budget, validate_max_results, validate_port,
    validate_quality, validate_score_threshold,
};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub host_mode: HostModeConfig,
    #[serde(default)]
    pub preview: PreviewConfig,
    #[serde(default)]
    pub enroll: EnrollConfig,
}

/// Where the list of enrolled users lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DbMode {
    Device,
    #[default]
    Host,
}

/// How host-mode authentication is carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HostAuthMode {
    /// Extract on device, match on host
    #[default]
    Hybrid,
    /// Device matches against its own table
    Device,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamEncoding {
    #[default]
    Jpeg,
    Webp,
}

impl StreamEncoding {
    pub fn content_type(self) -> &'static str {
        match self {
            StreamEncoding::Jpeg => "image/jpeg",
            StreamEncoding::Webp => "image/webp",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSettings {
    /// Pick the port reported by the driver
    pub auto_detect: bool,
    /// Required when `auto_detect` is off
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default)]
    pub db_mode: DbMode,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            auto_detect: true,
            port: None,
            db_mode: DbMode::Host,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostModeConfig {
    #[serde(default)]
    pub auth_type: HostAuthMode,
    /// Relative paths resolve against the data directory
    pub db_file: PathBuf,
    pub hybrid_max_results: usize,
    pub hybrid_score_threshold: f32,
}

impl Default for HostModeConfig {
    fn default() -> Self {
        Self {
            auth_type: HostAuthMode::Hybrid,
            db_file: PathBuf::from("vectors.db"),
            hybrid_max_results: 10,
            hybrid_score_threshold: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreviewConfig {
    /// -1 = auto
    pub camera_number: i32,
    #[serde(default)]
    pub stream_type: StreamEncoding,
    pub jpeg_quality: u8,
    /// Accepted for compatibility; WebP frames are encoded lossless
    pub webp_quality: u8,
    /// Pause before each delivered frame, in microseconds
    pub frame_pause_us: u64,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            camera_number: -1,
            stream_type: StreamEncoding::Jpeg,
            jpeg_quality: 85,
            webp_quality: 85,
            frame_pause_us: 1500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnrollConfig {
    /// Decoded BGR buffers above this size are downscaled before enrollment
    pub max_image_bytes: usize,
}

impl Default for EnrollConfig {
    fn default() -> Self {
        Self {
            max_image_bytes: 890 * 1024,
        }
    }
}

impl AppConfig {
    /// Load config from file or create default
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let config: AppConfig = toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            log::info!("Config loaded from: {}", path.display());
            Ok(config)
        } else {
            let config = Self::default();
            config.save(path)?;
            log::info!("Default config created at: {}", path.display());
            Ok(config)
        }
    }

    /// Write the config as TOML (0600 on unix)
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let toml_str = toml::to_string_pretty(self)?;
        fs::write(path, toml_str)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }

        log::debug!("Config saved to: {}", path.display());
        Ok(())
    }

    /// Apply `FACEGATE_PORT` / `FACEGATE_DB_FILE` overrides
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(
            std::env::var("FACEGATE_PORT").ok(),
            std::env::var("FACEGATE_DB_FILE").ok(),
        );
    }

    fn apply_overrides(&mut self, port: Option<String>, db_file: Option<String>) {
        if let Some(port) = port.filter(|p| !p.is_empty()) {
            log::info!("Port forced from environment: {}", port);
            self.device.port = Some(port);
            self.device.auto_detect = false;
        }
        if let Some(db_file) = db_file.filter(|p| !p.is_empty()) {
            log::info!("Vector store forced from environment: {}", db_file);
            self.host_mode.db_file = PathBuf::from(db_file);
        }
    }

    /// Range-check every section
    pub fn validate(&self) -> Result<()> {
        if !self.device.auto_detect {
            match self.device.port.as_deref() {
                Some(port) => {
                    validate_port(port)?;
                }
                None => bail!("device.port is required when device.auto_detect is false"),
            }
        }
        if self.host_mode.db_file.as_os_str().is_empty() {
            bail!("host_mode.db_file cannot be empty");
        }
        validate_max_results(self.host_mode.hybrid_max_results)?;
        validate_score_threshold(self.host_mode.hybrid_score_threshold)?;
        validate_camera_number(self.preview.camera_number)?;
        validate_quality(self.preview.jpeg_quality)?;
        validate_quality(self.preview.webp_quality)?;
        validate_image_budget(self.enroll.max_image_bytes)?;
        Ok(())
    }
}
