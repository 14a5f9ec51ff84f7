//! Engine configuration, persisted as TOML.

use crate::errors::{EngineError, Result};
use crate::model::GraphOptions;
use crate::storage::SELF_TEST_PATTERN;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Which progress-recovery scheme output tensors use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryMode {
    /// Progress bit embedded in every value, polarity map kept as turning points
    #[default]
    TurningPoints,
    /// Explicit marker elements interleaved after every output tile
    Footprints,
}

impl RecoveryMode {
    /// Tag stored in the NVM image header.
    pub fn tag(self) -> u8 {
        match self {
            RecoveryMode::TurningPoints => 0,
            RecoveryMode::Footprints => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(RecoveryMode::TurningPoints),
            1 => Some(RecoveryMode::Footprints),
            _ => None,
        }
    }
}

impl fmt::Display for RecoveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryMode::TurningPoints => write!(f, "turning-points"),
            RecoveryMode::Footprints => write!(f, "footprints"),
        }
    }
}

impl FromStr for RecoveryMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "turning-points" | "turning_points" | "indirect" => Ok(RecoveryMode::TurningPoints),
            "footprints" | "footprint" | "japari" => Ok(RecoveryMode::Footprints),
            other => Err(EngineError::Config(format!(
                "Unknown recovery mode '{}' (expected turning-points or footprints)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// File backing the NVM arena on the reference platform
    pub nvm_path: PathBuf,
    /// Size of the NVM arena in bytes
    pub nvm_size: u32,
    /// Largest single read/write the storage accepts
    pub max_transfer: u32,
    /// Self-test attempts before giving up
    pub self_test_retries: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            nvm_path: PathBuf::from("nvm.bin"),
            nvm_size: 256 * 1024,
            max_transfer: 1024,
            self_test_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of reusable intermediate buffers
    pub num_slots: u8,
    /// Target channel-tiling factor for operator outputs
    pub tile_c: u16,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            num_slots: 3,
            tile_c: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecoveryConfig {
    pub mode: RecoveryMode,
    /// Marker elements appended to every output tile in footprint mode
    pub footprints_per_tile: u16,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            mode: RecoveryMode::TurningPoints,
            footprints_per_tile: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Enables rotating file logs when set
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
        }
    }
}

/// Complete engine configuration.
///
/// Saved at `~/.intermittent/config.toml` by default. Every section falls back
/// to its defaults when missing from the file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub storage: StorageConfig,
    pub runtime: RuntimeConfig,
    pub recovery: RecoveryConfig,
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Get default configuration file path: `~/.intermittent/config.toml`
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".intermittent").join("config.toml"))
    }

    /// Load configuration from file, falling back to defaults when it is missing.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Load configuration from file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            tracing::error!(
                path = %path.display(),
                error = %e,
                "Failed to read config file"
            );
            e
        })?;

        let config: Self = toml::from_str(&content)?;
        config.validate()?;

        tracing::info!(
            path = %path.display(),
            recovery = %config.recovery.mode,
            num_slots = config.runtime.num_slots,
            "Engine configuration loaded"
        );

        Ok(config)
    }

    /// Save configuration to file.
    ///
    /// Uses atomic write (temp file + rename) to prevent corruption.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let toml_string = toml::to_string_pretty(self)?;

        let temp_path = path.with_extension("toml.tmp");
        fs::write(&temp_path, &toml_string).map_err(|e| {
            tracing::error!(
                path = %temp_path.display(),
                error = %e,
                "Failed to write temp config file"
            );
            e
        })?;

        fs::rename(&temp_path, path)?;

        tracing::info!(path = %path.display(), "Engine configuration saved");
        Ok(())
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.runtime.num_slots < 2 {
            return Err(EngineError::Config(format!(
                "num_slots must be at least 2, got {}",
                self.runtime.num_slots
            )));
        }
        if self.runtime.num_slots as usize >= crate::layout::SLOT_PARAMETERS as usize {
            return Err(EngineError::Config(format!(
                "num_slots {} collides with reserved slot identifiers",
                self.runtime.num_slots
            )));
        }
        if self.runtime.tile_c == 0 {
            return Err(EngineError::Config("tile_c must be positive".to_string()));
        }
        if self.storage.max_transfer == 0 || self.storage.max_transfer % 2 != 0 {
            return Err(EngineError::Config(format!(
                "max_transfer must be a positive even number of bytes, got {}",
                self.storage.max_transfer
            )));
        }
        if (self.storage.max_transfer as usize) < SELF_TEST_PATTERN.len() {
            return Err(EngineError::Config(format!(
                "max_transfer must be at least {} bytes, got {}",
                SELF_TEST_PATTERN.len(),
                self.storage.max_transfer
            )));
        }
        if self.storage.self_test_retries == 0 {
            return Err(EngineError::Config(
                "self_test_retries must be at least 1".to_string(),
            ));
        }
        if self.recovery.mode == RecoveryMode::Footprints && self.recovery.footprints_per_tile == 0
        {
            return Err(EngineError::Config(
                "footprint mode needs at least one footprint per tile".to_string(),
            ));
        }
        if self.recovery.footprints_per_tile > 15 {
            return Err(EngineError::Config(format!(
                "footprints_per_tile is at most 15, got {}",
                self.recovery.footprints_per_tile
            )));
        }
        Ok(())
    }

    /// Footprints appended to each output tile under the configured mode.
    pub fn footprints_per_tile(&self) -> u16 {
        match self.recovery.mode {
            RecoveryMode::TurningPoints => 0,
            RecoveryMode::Footprints => self.recovery.footprints_per_tile,
        }
    }

    pub fn graph_options(&self) -> GraphOptions {
        GraphOptions {
            num_slots: self.runtime.num_slots,
            tile_c: self.runtime.tile_c,
            footprints_per_tile: self.footprints_per_tile(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.storage.nvm_size, 256 * 1024);
        assert_eq!(config.storage.max_transfer, 1024);
        assert_eq!(config.runtime.num_slots, 3);
        assert_eq!(config.recovery.mode, RecoveryMode::TurningPoints);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");

        let mut config = EngineConfig::default();
        config.runtime.num_slots = 2;
        config.recovery.mode = RecoveryMode::Footprints;
        config.recovery.footprints_per_tile = 1;
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "[recovery]\nmode = \"footprints\"\n").unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.recovery.mode, RecoveryMode::Footprints);
        assert_eq!(loaded.recovery.footprints_per_tile, 1);
        assert_eq!(loaded.storage, StorageConfig::default());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let loaded = EngineConfig::load_or_default(&temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(loaded, EngineConfig::default());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.runtime.num_slots = 1;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.storage.max_transfer = 1023;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.storage.max_transfer = 8;
        assert!(config.validate().is_err());
        config.storage.max_transfer = 16;
        assert!(config.validate().is_ok());

        let mut config = EngineConfig::default();
        config.runtime.tile_c = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.recovery.mode = RecoveryMode::Footprints;
        config.recovery.footprints_per_tile = 16;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_recovery_mode_parse() {
        assert_eq!(
            "footprints".parse::<RecoveryMode>().unwrap(),
            RecoveryMode::Footprints
        );
        assert_eq!(
            "Turning-Points".parse::<RecoveryMode>().unwrap(),
            RecoveryMode::TurningPoints
        );
        assert!("checkpoints".parse::<RecoveryMode>().is_err());
        assert_eq!(
            RecoveryMode::from_tag(RecoveryMode::Footprints.tag()),
            Some(RecoveryMode::Footprints)
        );
    }

    #[test]
    fn test_graph_options_follow_mode() {
        let mut config = EngineConfig::default();
        config.recovery.footprints_per_tile = 2;
        assert_eq!(config.graph_options().footprints_per_tile, 0);

        config.recovery.mode = RecoveryMode::Footprints;
        let options = config.graph_options();
        assert_eq!(options.footprints_per_tile, 2);
        assert_eq!(options.num_slots, 3);
        assert_eq!(options.tile_c, 4);
    }
}
