//! Device command abstraction for TPM NV storage.
//!
//! [`NvDevice`] is the only way the store talks to the secure storage
//! device. Every call is one synchronous request/response exchange.

mod memory;
mod tools;

pub use memory::{Fault, MemoryDevice, UndefinePolicy};
pub use tools::Tpm2ToolsDevice;

use crate::error::Result;
use crate::store::NvIndex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Fixed NV limits reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLimits {
    /// Largest size any single NV index may be defined with (`TPM2_PT_NV_INDEX_MAX`).
    pub max_value_size: u32,
    /// Largest payload accepted by one NV read or write (`TPM2_PT_NV_BUFFER_MAX`).
    pub max_transfer_size: u32,
}

impl DeviceLimits {
    /// Largest value that fits one slot and one transfer.
    pub fn effective_max(&self) -> u32 {
        self.max_value_size.min(self.max_transfer_size)
    }
}

/// Public area of a defined NV index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotMetadata {
    /// Index the metadata describes.
    pub index: NvIndex,
    /// Declared data size in bytes.
    pub size: u32,
    /// Attribute names, e.g. `authread`, `no_da`.
    pub attributes: BTreeSet<String>,
    /// Name hash algorithm, when the device reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_alg: Option<String>,
}

/// Parameters of an NV define command.
#[derive(Debug, Clone, Copy)]
pub struct DefineRequest<'a> {
    /// Index to allocate.
    pub index: NvIndex,
    /// Data size in bytes.
    pub size: u32,
    /// Attribute names applied to the index.
    pub attributes: &'a [&'a str],
    /// Hierarchy the index is created under.
    pub hierarchy: &'a str,
    /// Authorization value required for later access.
    pub auth: Option<&'a str>,
}

/// Synchronous command interface to an NV-capable secure storage device.
///
/// Implementations report authorization failures as
/// [`Error::Authentication`](crate::Error::Authentication), missing indices as
/// [`Error::NotFound`](crate::Error::NotFound), and every other device failure
/// as [`Error::DeviceCommand`](crate::Error::DeviceCommand) carrying the raw
/// diagnostic.
pub trait NvDevice {
    /// Request `n` random bytes.
    fn get_random(&mut self, n: usize) -> Result<Vec<u8>>;

    /// Enumerate every defined NV index.
    fn list_indices(&mut self) -> Result<BTreeSet<NvIndex>>;

    /// Read the public area of an index.
    fn read_public(&mut self, index: NvIndex) -> Result<SlotMetadata>;

    /// Read `size` bytes from the start of an index.
    fn read(&mut self, index: NvIndex, size: u32, auth: Option<&str>) -> Result<Vec<u8>>;

    /// Define an index; returns the index the device reports as created.
    fn define(&mut self, request: &DefineRequest<'_>) -> Result<NvIndex>;

    /// Write `data` at offset 0 of an index in one transfer.
    fn write(&mut self, index: NvIndex, data: &[u8], auth: Option<&str>) -> Result<()>;

    /// Remove an index under `hierarchy`.
    fn undefine(&mut self, index: NvIndex, hierarchy: &str, auth: Option<&str>) -> Result<()>;

    /// Query the fixed NV limits.
    fn fixed_properties(&mut self) -> Result<DeviceLimits>;

    /// Name of this device backend (for logging).
    fn name(&self) -> &'static str;
}

impl<D: NvDevice + ?Sized> NvDevice for Box<D> {
    fn get_random(&mut self, n: usize) -> Result<Vec<u8>> {
        (**self).get_random(n)
    }

    fn list_indices(&mut self) -> Result<BTreeSet<NvIndex>> {
        (**self).list_indices()
    }

    fn read_public(&mut self, index: NvIndex) -> Result<SlotMetadata> {
        (**self).read_public(index)
    }

    fn read(&mut self, index: NvIndex, size: u32, auth: Option<&str>) -> Result<Vec<u8>> {
        (**self).read(index, size, auth)
    }

    fn define(&mut self, request: &DefineRequest<'_>) -> Result<NvIndex> {
        (**self).define(request)
    }

    fn write(&mut self, index: NvIndex, data: &[u8], auth: Option<&str>) -> Result<()> {
        (**self).write(index, data, auth)
    }

    fn undefine(&mut self, index: NvIndex, hierarchy: &str, auth: Option<&str>) -> Result<()> {
        (**self).undefine(index, hierarchy, auth)
    }

    fn fixed_properties(&mut self) -> Result<DeviceLimits> {
        (**self).fixed_properties()
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}
