//! Configuration constants and types for the NV store.

use crate::error::{Error, Result};
use crate::store::NvIndex;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Lowest index of the user-writable NV band.
pub const USER_NV_LOW: u32 = 0x0180_0000;

/// Highest index of the user-writable NV band.
pub const USER_NV_HIGH: u32 = 0x01BF_FFFF;

/// Minimum password length accepted for a slot credential.
pub const MIN_PASSWORD_LENGTH: usize = 5;

/// NV capacity in bytes every TPM 2.0 device must provide.
///
/// The actual free space cannot be queried reliably, so this is only
/// reported, never enforced.
pub const MIN_GUARANTEED_NV_CAPACITY: u32 = 6962;

/// Number of random bytes requested by the sanity probe.
pub const SANITY_PROBE_BYTES: usize = 8;

/// Attributes applied to every slot this store defines.
pub const SLOT_ATTRIBUTES: [&str; 4] = ["authread", "authwrite", "no_da", "orderly"];

/// Hierarchy under which slots are defined and undefined.
pub const OWNER_HIERARCHY: &str = "o";

/// Store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Lowest index this store may allocate.
    #[serde(default = "default_low")]
    pub low: NvIndex,

    /// Highest index this store may allocate.
    #[serde(default = "default_high")]
    pub high: NvIndex,

    /// Minimum accepted password length.
    #[serde(default = "default_min_password_length")]
    pub min_password_length: usize,
}

fn default_low() -> NvIndex {
    NvIndex(USER_NV_LOW)
}

fn default_high() -> NvIndex {
    NvIndex(USER_NV_HIGH)
}

fn default_min_password_length() -> usize {
    MIN_PASSWORD_LENGTH
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            low: default_low(),
            high: default_high(),
            min_password_length: default_min_password_length(),
        }
    }
}

impl StoreConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.low > self.high {
            return Err(Error::InvalidConfig(format!(
                "low index {} is above high index {}",
                self.low, self.high
            )));
        }
        if self.low < NvIndex(USER_NV_LOW) || self.high > NvIndex(USER_NV_HIGH) {
            return Err(Error::InvalidConfig(format!(
                "band [{}, {}] reaches outside the user-writable range [{}, {}]",
                self.low,
                self.high,
                NvIndex(USER_NV_LOW),
                NvIndex(USER_NV_HIGH)
            )));
        }
        if self.min_password_length == 0 {
            return Err(Error::InvalidConfig(
                "min_password_length must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether `index` lies inside the configured band.
    pub fn contains(&self, index: NvIndex) -> bool {
        self.low <= index && index <= self.high
    }

    /// Load and validate a configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: StoreConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save the configuration to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_band() {
        let config = StoreConfig::default();
        assert!(config.contains(NvIndex(USER_NV_LOW)));
        assert!(config.contains(NvIndex(USER_NV_HIGH)));
        assert!(!config.contains(NvIndex(USER_NV_HIGH + 1)));
        assert!(!config.contains(NvIndex(USER_NV_LOW - 1)));
        config.validate().unwrap();
    }

    #[test]
    fn test_inverted_band_rejected() {
        let config = StoreConfig {
            low: NvIndex(USER_NV_HIGH),
            high: NvIndex(USER_NV_LOW),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_band_cannot_be_widened() {
        let below = StoreConfig {
            low: NvIndex(0x0100_0000),
            ..Default::default()
        };
        assert!(matches!(below.validate(), Err(Error::InvalidConfig(_))));

        let above = StoreConfig {
            high: NvIndex(USER_NV_HIGH + 1),
            ..Default::default()
        };
        assert!(matches!(above.validate(), Err(Error::InvalidConfig(_))));

        let narrowed = StoreConfig {
            low: NvIndex(USER_NV_LOW + 0x100),
            high: NvIndex(USER_NV_LOW + 0x1FF),
            ..Default::default()
        };
        narrowed.validate().unwrap();
    }

    #[test]
    fn test_widened_band_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, r#"{ "low": "0x1000000", "high": "0x1ffffff" }"#).unwrap();

        assert!(matches!(StoreConfig::load(&path), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        let config = StoreConfig {
            low: NvIndex(0x0180_0100),
            high: NvIndex(0x0180_01FF),
            min_password_length: 8,
        };

        config.save(&path).unwrap();
        let loaded = StoreConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, r#"{ "min_password_length": 12 }"#).unwrap();

        let loaded = StoreConfig::load(&path).unwrap();
        assert_eq!(loaded.low, NvIndex(USER_NV_LOW));
        assert_eq!(loaded.high, NvIndex(USER_NV_HIGH));
        assert_eq!(loaded.min_password_length, 12);
    }
}
