//! Read-only capability queries.
//!
//! Nothing here is cached: limits and the index enumeration are fetched on
//! every call, since other processes may define or undefine indices at any
//! time.

use crate::device::{DeviceLimits, NvDevice, SlotMetadata};
use crate::error::{Error, Result};
use crate::store::NvIndex;
use std::collections::BTreeSet;

/// Every index currently defined on the device.
pub fn list_slots<D: NvDevice + ?Sized>(device: &mut D) -> Result<BTreeSet<NvIndex>> {
    device.list_indices()
}

/// Public metadata of a defined index.
///
/// Fails with [`Error::NotFound`] when the index is not in the enumeration.
pub fn slot_metadata<D: NvDevice + ?Sized>(device: &mut D, index: NvIndex) -> Result<SlotMetadata> {
    if !list_slots(device)?.contains(&index) {
        return Err(Error::NotFound(index));
    }
    device.read_public(index)
}

/// Fixed size limits of the device.
pub fn device_limits<D: NvDevice + ?Sized>(device: &mut D) -> Result<DeviceLimits> {
    let limits = device.fixed_properties()?;
    if limits.max_value_size == 0 || limits.max_transfer_size == 0 {
        return Err(Error::report(
            "fixed properties",
            format!("zero NV limit reported: {:?}", limits),
        ));
    }
    Ok(limits)
}
