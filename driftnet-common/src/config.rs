//! Configuration loading and root folder resolution

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// TOML configuration file contents.
///
/// Every field has a default so a missing or partial file is never an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Library root folder override
    pub root_folder: Option<String>,

    /// External tool binary locations
    #[serde(default)]
    pub tools: ToolPaths,

    /// Reconciliation settings
    #[serde(default)]
    pub scan: ScanSettings,
}

/// Paths (or bare names resolved via PATH) of the external extractor tools
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolPaths {
    pub gallery_dl: String,
    pub ytdlp: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            gallery_dl: "gallery-dl".to_string(),
            ytdlp: "yt-dlp".to_string(),
        }
    }
}

/// Library reconciliation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSettings {
    /// Tasks per reconciliation batch (one transaction per batch)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Rate-limited queue tick interval in milliseconds
    #[serde(default = "default_queue_interval_ms")]
    pub queue_interval_ms: u64,

    /// Sidecar change-detection mode
    #[serde(default)]
    pub fingerprint: FingerprintMode,
}

fn default_batch_size() -> usize {
    250
}

fn default_queue_interval_ms() -> u64 {
    200
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            queue_interval_ms: default_queue_interval_ms(),
            fingerprint: FingerprintMode::default(),
        }
    }
}

/// How sidecar metadata changes are detected between scans.
///
/// `Digest` compares a content hash of the sidecar payload. `LengthOnly`
/// compares only the payload length, kept for byte-compatibility with
/// libraries indexed by older versions; it can miss equal-length edits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintMode {
    #[default]
    Digest,
    LengthOnly,
}

/// Resolve the library root folder, in priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. TOML config file
/// 4. OS-dependent compiled default (fallback)
pub fn resolve_root_folder(cli_arg: Option<&str>, env_var_name: &str) -> PathBuf {
    if let Some(path) = cli_arg {
        return PathBuf::from(path);
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Ok(config) = load_toml_config(&default_config_path()) {
        if let Some(root) = config.root_folder {
            return PathBuf::from(root);
        }
    }

    default_root_folder()
}

/// Default configuration file path for the platform
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("driftnet").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("driftnet.toml"))
}

/// OS-dependent default library root
pub fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("driftnet"))
        .unwrap_or_else(|| PathBuf::from("./driftnet_data"))
}

/// Load and parse a TOML config file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read TOML failed: {}", e)))?;
    toml::from_str(&content).map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))
}

/// Write a TOML config file, creating parent directories as needed.
///
/// Callers treat failures as non-fatal (settings persistence is best-effort).
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

/// Filesystem layout derived from the library root
#[derive(Debug, Clone)]
pub struct LibraryPaths {
    pub root: PathBuf,
    pub download_root: PathBuf,
    pub avatar_root: PathBuf,
    pub database: PathBuf,
}

impl LibraryPaths {
    pub fn new(root: PathBuf) -> Self {
        Self {
            download_root: root.join("downloads"),
            avatar_root: root.join("avatars"),
            database: root.join("driftnet.db"),
            root,
        }
    }

    /// Create the on-disk layout if missing
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(&self.download_root)?;
        std::fs::create_dir_all(&self.avatar_root)?;
        Ok(())
    }
}
