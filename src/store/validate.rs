//! Pre-allocation checks.
//!
//! [`validate_allocation`] runs every check in a fixed order and issues no
//! mutating device command. A passing result is only advisory: another
//! process can define the same index before the store does, in which case
//! the device rejects the define.

use crate::config::StoreConfig;
use crate::device::{DeviceLimits, NvDevice};
use crate::error::{Error, Result};
use crate::store::{credential, probe, NvIndex};
use std::collections::BTreeSet;

/// Index must lie inside the configured band.
pub fn check_range(config: &StoreConfig, index: NvIndex) -> Result<()> {
    if config.contains(index) {
        Ok(())
    } else {
        Err(Error::OutOfRange {
            index,
            low: config.low,
            high: config.high,
        })
    }
}

/// Value must be non-empty and fit both one index and one transfer.
pub fn check_size(limits: &DeviceLimits, len: usize) -> Result<()> {
    if len == 0 {
        return Err(Error::EmptyValue);
    }
    if len > limits.max_transfer_size as usize {
        return Err(Error::ValueTooLarge {
            len,
            limit: limits.max_transfer_size,
            which: "max transfer size",
        });
    }
    if len > limits.max_value_size as usize {
        return Err(Error::ValueTooLarge {
            len,
            limit: limits.max_value_size,
            which: "max index size",
        });
    }
    Ok(())
}

/// Index must not be defined yet.
pub fn check_collision(existing: &BTreeSet<NvIndex>, index: NvIndex) -> Result<()> {
    if existing.contains(&index) {
        Err(Error::DuplicateAddress(index))
    } else {
        Ok(())
    }
}

/// Run range, size, collision and credential checks, in that order.
pub fn validate_allocation<D: NvDevice + ?Sized>(
    device: &mut D,
    config: &StoreConfig,
    index: NvIndex,
    value: &[u8],
    password: Option<&str>,
) -> Result<()> {
    check_range(config, index)?;

    let limits = probe::device_limits(device)?;
    check_size(&limits, value.len())?;

    let existing = probe::list_slots(device)?;
    check_collision(&existing, index)?;

    credential::check_policy(password, config.min_password_length)
}
