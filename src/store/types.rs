//! Store types: NV indices and capacity reports.

use crate::device::DeviceLimits;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Address of an NV index slot.
///
/// Displayed and serialized in hex (`0x1800000`), the form TPM tooling uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NvIndex(pub u32);

impl NvIndex {
    /// Raw handle value.
    pub fn value(self) -> u32 {
        self.0
    }
}

impl From<u32> for NvIndex {
    fn from(raw: u32) -> Self {
        NvIndex(raw)
    }
}

impl fmt::Display for NvIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Error returned when parsing an [`NvIndex`] fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIndexError(String);

impl fmt::Display for ParseIndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid NV index `{}`: expected hex (0x...) or decimal", self.0)
    }
}

impl std::error::Error for ParseIndexError {}

impl FromStr for NvIndex {
    type Err = ParseIndexError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parsed = match trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        {
            Some(hex) => u32::from_str_radix(&hex.replace('_', ""), 16),
            None => trimmed.replace('_', "").parse::<u32>(),
        };
        parsed
            .map(NvIndex)
            .map_err(|_| ParseIndexError(s.to_string()))
    }
}

impl Serialize for NvIndex {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NvIndex {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(u32),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(NvIndex(n)),
            Repr::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Summary of the device's NV capabilities and the store's usage of it.
#[derive(Debug, Clone, Serialize)]
pub struct StoreInfo {
    /// Fixed limits reported by the device.
    pub limits: DeviceLimits,
    /// Largest value a single slot of this store can hold.
    pub max_value_size: u32,
    /// Lowest allocatable index.
    pub low: NvIndex,
    /// Highest allocatable index.
    pub high: NvIndex,
    /// Number of indices defined on the device, all bands.
    pub total_slots: usize,
    /// Number of indices defined inside the user band.
    pub user_slots: usize,
    /// Sum of the declared sizes of the user-band indices.
    pub user_bytes: u64,
    /// Capacity every compliant device guarantees; free space is not queryable.
    pub guaranteed_capacity: u32,
}
