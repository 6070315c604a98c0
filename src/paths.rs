use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};

/// Application paths following OS conventions
#[derive(Clone, Debug)]
pub struct AppPaths {
    /// Configuration directory (config.toml)
    pub config: PathBuf,
    /// Data directory (vector store, store key)
    pub data: PathBuf,
    /// Cache directory (preview captures, logs)
    pub cache: PathBuf,
}

impl AppPaths {
    /// Resolve OS-specific paths for Facegate
    ///
    /// # Platform Paths
    ///
    /// ## Linux
    /// - Config: `~/.config/Facegate/`
    /// - Data: `~/.local/share/Facegate/` → vectors.db, vectors.db.key
    /// - Cache: `~/.cache/Facegate/` → preview/, logs/
    ///
    /// ## macOS
    /// - Config: `~/Library/Preferences/Facegate/`
    /// - Data: `~/Library/Application Support/Facegate/`
    /// - Cache: `~/Library/Caches/Facegate/`
    ///
    /// ## Windows
    /// - Config: `%APPDATA%\Facegate\config\`
    /// - Data: `%LOCALAPPDATA%\Facegate\`
    /// - Cache: `%LOCALAPPDATA%\Facegate\Cache\`
    pub fn new() -> Result<Self> {
        let proj_dirs = ProjectDirs::from("com", "LotusEmberLabs", "Facegate")
            .context("Failed to determine project directories")?;

        Ok(Self {
            config: proj_dirs.config_dir().to_path_buf(),
            data: proj_dirs.data_dir().to_path_buf(),
            cache: proj_dirs.cache_dir().to_path_buf(),
        })
    }

    /// Paths rooted under a single directory (tests, portable installs)
    pub fn rooted(root: &Path) -> Self {
        Self {
            config: root.join("config"),
            data: root.join("data"),
            cache: root.join("cache"),
        }
    }

    /// Create all necessary directories
    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.config).context("Failed to create config directory")?;
        fs::create_dir_all(&self.data).context("Failed to create data directory")?;
        fs::create_dir_all(self.cache.join("preview"))
            .context("Failed to create preview directory")?;
        fs::create_dir_all(self.cache.join("logs")).context("Failed to create logs directory")?;

        log::info!("Application directories initialized");
        log::debug!("  Config: {}", self.config.display());
        log::debug!("  Data:   {}", self.data.display());
        log::debug!("  Cache:  {}", self.cache.display());

        Ok(())
    }

    /// Get path to config file
    pub fn config_file(&self) -> PathBuf {
        self.config.join("config.toml")
    }

    /// Resolve the vector store file; relative paths land in the data directory
    pub fn vector_db_file(&self, configured: &Path) -> PathBuf {
        if configured.is_absolute() {
            configured.to_path_buf()
        } else {
            self.data.join(configured)
        }
    }
}
