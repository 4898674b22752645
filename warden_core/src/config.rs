//! Runtime configuration.
//!
//! Every field has a default so a partial (or absent) JSON file yields a
//! working configuration. Reload replaces the whole struct; nothing caches
//! individual fields.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Longest protection, cooldown or location lifetime accepted (100 years)
pub const MAX_DURATION_SECONDS: i64 = 100 * 365 * 24 * 60 * 60;

/// `now_ms` plus `secs` clamped to `1..=MAX_DURATION_SECONDS`.
pub fn deadline_ms(now_ms: i64, secs: i64) -> i64 {
    now_ms.saturating_add(secs.clamp(1, MAX_DURATION_SECONDS) * 1000)
}

// ============================================================================
// TOP LEVEL
// ============================================================================

/// Complete Warden configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    /// Verbose diagnostics (resolution failures, announcement traces)
    pub debug: bool,

    pub protection: ProtectionConfig,

    pub relocation: RelocationConfig,

    pub store: StoreConfig,

    pub messages: MessageConfig,
}

impl WardenConfig {
    /// Parse a configuration from JSON text.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: WardenConfig = serde_json::from_str(text)?;
        Ok(cfg.sanitized())
    }

    /// Load a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// Load a configuration file, falling back to defaults on first run.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Clamp values that would break invariants downstream.
    ///
    /// A protection must expire strictly in the future without overflowing
    /// the epoch-millisecond clock, and the location table needs room for
    /// at least one entry.
    pub fn sanitized(mut self) -> Self {
        self.protection.duration_seconds = self.protection.duration_seconds.clamp(1, MAX_DURATION_SECONDS);
        self.protection.resolve_attempts = self.protection.resolve_attempts.max(1);
        self.protection.sweep_interval_ms = self.protection.sweep_interval_ms.max(1);
        self.relocation.cooldown_seconds = self.relocation.cooldown_seconds.clamp(0, MAX_DURATION_SECONDS);
        self.relocation.location_cap = self.relocation.location_cap.max(1);
        self.relocation.economy.cost = self.relocation.economy.cost.max(0.0);
        self
    }

    /// Builder: override the protection duration.
    pub fn with_protection_duration(mut self, secs: i64) -> Self {
        self.protection.duration_seconds = secs.clamp(1, MAX_DURATION_SECONDS);
        self
    }

    /// Builder: override the durable store location.
    pub fn with_store_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.store.path = path.into();
        self
    }
}

// ============================================================================
// SECTIONS
// ============================================================================

/// Which event kinds a protection blocks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DenyConfig {
    pub attack: bool,
    pub interact: bool,
    pub fish: bool,
}

impl Default for DenyConfig {
    fn default() -> Self {
        Self {
            attack: true,
            interact: true,
            fish: true,
        }
    }
}

/// Configuration for the tracking cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectionConfig {
    /// Master switch (default: true)
    pub enabled: bool,

    /// Grace period after spawn (default: 600s)
    pub duration_seconds: i64,

    pub deny: DenyConfig,

    /// Minimum gap between two denial messages to one actor (default: 1200ms)
    pub message_cooldown_ms: i64,

    /// Period of the background expiry sweep (default: 2000ms)
    pub sweep_interval_ms: u64,

    /// Entity resolution retries after a spawn (default: 20)
    pub resolve_attempts: u32,

    /// Gap between resolution retries (default: 250ms = 5 ticks)
    pub resolve_interval_ms: u64,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            duration_seconds: 600,
            deny: DenyConfig::default(),
            message_cooldown_ms: 1200,
            sweep_interval_ms: 2000,
            resolve_attempts: 20,
            resolve_interval_ms: 250,
        }
    }
}

/// Fee charged per relocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EconomyConfig {
    pub enabled: bool,
    pub cost: f64,
}

impl Default for EconomyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cost: 100.0,
        }
    }
}

/// Configuration for the relocation gate and location cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelocationConfig {
    pub enabled: bool,

    /// Minimum interval between two charged relocations (default: 3s)
    pub cooldown_seconds: i64,

    /// Only allow destinations previously announced (default: true)
    pub tracked_only: bool,

    pub economy: EconomyConfig,

    /// Live entry cap of the location cache (default: 4096)
    pub location_cap: usize,
}

impl Default for RelocationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown_seconds: 3,
            tracked_only: true,
            economy: EconomyConfig::default(),
            location_cap: 4096,
        }
    }
}

/// Durable store backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackendKind {
    /// Flat JSON file rewritten atomically
    JsonFile,
    /// Embedded sled database
    Sled,
}

/// Configuration for the durable store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackendKind,

    /// File (json_file) or directory (sled)
    pub path: PathBuf,

    /// Debounce window of the coalesced flush (default: 50ms)
    pub flush_delay_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackendKind::JsonFile,
            path: PathBuf::from("protection-cache.json"),
            flush_delay_ms: 50,
        }
    }
}

/// Actor-facing message templates.
///
/// `{label}` is replaced with the spawn's display label.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageConfig {
    pub denied_attack: String,
    pub denied_interact: String,
    pub denied_fish: String,
    pub protection_expired: String,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            denied_attack: "This creature is protected and cannot be attacked.".to_string(),
            denied_interact: "This creature is protected and cannot be interacted with.".to_string(),
            denied_fish: "This creature is protected and cannot be reeled in.".to_string(),
            protection_expired: "Protection of {label} has ended.".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = WardenConfig::default();
        assert!(cfg.protection.enabled);
        assert_eq!(cfg.protection.duration_seconds, 600);
        assert_eq!(cfg.protection.message_cooldown_ms, 1200);
        assert_eq!(cfg.relocation.cooldown_seconds, 3);
        assert_eq!(cfg.relocation.location_cap, 4096);
        assert_eq!(cfg.store.flush_delay_ms, 50);
        assert_eq!(cfg.store.backend, StoreBackendKind::JsonFile);
    }

    #[test]
    fn test_partial_json_keeps_other_defaults() {
        let cfg = WardenConfig::from_json_str(
            r#"{ "protection": { "duration_seconds": 30, "deny": { "fish": false } },
                 "store": { "backend": "sled", "path": "data/protection" } }"#,
        )
        .unwrap();

        assert_eq!(cfg.protection.duration_seconds, 30);
        assert!(!cfg.protection.deny.fish);
        assert!(cfg.protection.deny.attack);
        assert_eq!(cfg.store.backend, StoreBackendKind::Sled);
        assert_eq!(cfg.relocation.economy.cost, 100.0);
    }

    #[test]
    fn test_sanitize_clamps_non_positive_duration() {
        let cfg = WardenConfig::from_json_str(r#"{ "protection": { "duration_seconds": 0 } }"#).unwrap();
        assert_eq!(cfg.protection.duration_seconds, 1);
    }

    #[test]
    fn test_sanitize_clamps_huge_durations() {
        let cfg = WardenConfig::from_json_str(
            r#"{ "protection": { "duration_seconds": 9223372036854775807 },
                 "relocation": { "cooldown_seconds": -5 } }"#,
        )
        .unwrap();
        assert_eq!(cfg.protection.duration_seconds, MAX_DURATION_SECONDS);
        assert_eq!(cfg.relocation.cooldown_seconds, 0);
        assert_eq!(
            WardenConfig::default().with_protection_duration(i64::MAX).protection.duration_seconds,
            MAX_DURATION_SECONDS
        );
    }

    #[test]
    fn test_deadline_saturates() {
        assert_eq!(deadline_ms(1_000, 0), 2_000);
        assert_eq!(deadline_ms(1_000, i64::MAX), 1_000 + MAX_DURATION_SECONDS * 1000);
        assert_eq!(deadline_ms(i64::MAX - 10, 60), i64::MAX);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = WardenConfig::load_or_default(dir.path().join("absent.json")).unwrap();
        assert_eq!(cfg.protection.duration_seconds, 600);
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        assert!(matches!(
            WardenConfig::from_json_str("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
