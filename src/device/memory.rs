//! In-memory NV device emulator.
//!
//! Enforces the rules a TPM applies to NV indices: no redefinition, size
//! limits per index and per write, per-index authorization values and
//! an optional total capacity. State can be persisted to a JSON file so the
//! CLI can run against a simulated device.

use super::{DefineRequest, DeviceLimits, NvDevice, SlotMetadata};
use crate::error::{Error, Result};
use crate::store::NvIndex;
use log::debug;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Default limits, matching a common discrete TPM.
const DEFAULT_LIMITS: DeviceLimits = DeviceLimits {
    max_value_size: 2048,
    max_transfer_size: 2048,
};

/// Who may remove an index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UndefinePolicy {
    /// Owner hierarchy with empty auth; supplied passwords are ignored.
    #[default]
    OwnerOnly,
    /// The index's own authorization value is required.
    IndexAuth,
}

/// Misbehaviour injected into the emulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Writes store the data with the first byte flipped.
    CorruptWrites,
    /// Define succeeds but reports the given index instead of the real one.
    MisreportDefine(NvIndex),
    /// Writes fail after the index was defined.
    FailWrites,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MemorySlot {
    size: u32,
    attributes: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auth: Option<String>,
    #[serde(with = "hex")]
    data: Vec<u8>,
    written: bool,
}

/// In-memory [`NvDevice`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryDevice {
    limits: DeviceLimits,
    /// Total bytes of NV data the emulated device can hold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    capacity: Option<u64>,
    #[serde(default)]
    undefine_policy: UndefinePolicy,
    #[serde(default)]
    slots: BTreeMap<NvIndex, MemorySlot>,
    #[serde(skip)]
    fault: Option<Fault>,
}

impl Default for MemoryDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDevice {
    /// Create an empty device with default limits.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_LIMITS)
    }

    /// Create an empty device with custom limits.
    pub fn with_limits(limits: DeviceLimits) -> Self {
        Self {
            limits,
            capacity: None,
            undefine_policy: UndefinePolicy::default(),
            slots: BTreeMap::new(),
            fault: None,
        }
    }

    /// Limit the total bytes of NV data the device accepts.
    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Set who may undefine an index.
    pub fn with_undefine_policy(mut self, policy: UndefinePolicy) -> Self {
        self.undefine_policy = policy;
        self
    }

    /// Make subsequent commands misbehave.
    pub fn inject_fault(&mut self, fault: Fault) {
        self.fault = Some(fault);
    }

    /// Restore normal behaviour.
    pub fn clear_fault(&mut self) {
        self.fault = None;
    }

    /// Define an index outside the store's control, as another process would.
    pub fn insert_foreign(&mut self, index: NvIndex, data: &[u8]) {
        self.slots.insert(
            index,
            MemorySlot {
                size: data.len() as u32,
                attributes: ["ownerread", "ownerwrite"]
                    .iter()
                    .map(|a| a.to_string())
                    .collect(),
                auth: None,
                data: data.to_vec(),
                written: true,
            },
        );
    }

    /// Bytes used by all defined indices.
    pub fn used_bytes(&self) -> u64 {
        self.slots.values().map(|s| s.size as u64).sum()
    }

    /// Load device state from a JSON file, or start empty if it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let content = std::fs::read_to_string(path)?;
        let device: MemoryDevice = serde_json::from_str(&content)?;
        device.check_consistency()?;
        Ok(device)
    }

    /// Reject state whose slots could not have been produced by the device.
    fn check_consistency(&self) -> Result<()> {
        for (index, slot) in &self.slots {
            if slot.data.len() != slot.size as usize {
                return Err(Error::Serialization(format!(
                    "slot {} declares {} bytes but holds {}",
                    index,
                    slot.size,
                    slot.data.len()
                )));
            }
            if slot.size > self.limits.max_value_size {
                return Err(Error::Serialization(format!(
                    "slot {} size {} exceeds index max {}",
                    index, slot.size, self.limits.max_value_size
                )));
            }
        }
        Ok(())
    }

    /// Save device state to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn slot(&self, index: NvIndex) -> Result<&MemorySlot> {
        self.slots.get(&index).ok_or(Error::NotFound(index))
    }

    fn authorize(slot: &MemorySlot, index: NvIndex, auth: Option<&str>) -> Result<()> {
        if slot.auth.as_deref().unwrap_or("") == auth.unwrap_or("") {
            Ok(())
        } else {
            Err(Error::Authentication {
                index,
                diagnostic: "authorization failure without DA implications".to_string(),
            })
        }
    }
}

impl NvDevice for MemoryDevice {
    fn get_random(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; n];
        rand::thread_rng().fill_bytes(&mut bytes);
        Ok(bytes)
    }

    fn list_indices(&mut self) -> Result<BTreeSet<NvIndex>> {
        Ok(self.slots.keys().copied().collect())
    }

    fn read_public(&mut self, index: NvIndex) -> Result<SlotMetadata> {
        let slot = self.slot(index)?;
        Ok(SlotMetadata {
            index,
            size: slot.size,
            attributes: slot.attributes.clone(),
            name_alg: Some("sha256".to_string()),
        })
    }

    fn read(&mut self, index: NvIndex, size: u32, auth: Option<&str>) -> Result<Vec<u8>> {
        let slot = self.slot(index)?;
        Self::authorize(slot, index, auth)?;

        if size > slot.size {
            return Err(Error::device(
                "nv read",
                format!("read of {} bytes exceeds index size {}", size, slot.size),
            ));
        }
        if !slot.written {
            return Err(Error::device("nv read", "NV index has not been written"));
        }

        Ok(slot.data[..size as usize].to_vec())
    }

    fn define(&mut self, request: &DefineRequest<'_>) -> Result<NvIndex> {
        let index = request.index;
        debug!("memory device: define {} ({} bytes)", index, request.size);

        if self.slots.contains_key(&index) {
            return Err(Error::device("nv define", "NV index is already defined"));
        }
        if request.size == 0 || request.size > self.limits.max_value_size {
            return Err(Error::device(
                "nv define",
                format!("size {} outside 1..={}", request.size, self.limits.max_value_size),
            ));
        }
        if let Some(capacity) = self.capacity {
            if self.used_bytes() + request.size as u64 > capacity {
                return Err(Error::device("nv define", "out of NV memory"));
            }
        }

        self.slots.insert(
            index,
            MemorySlot {
                size: request.size,
                attributes: request.attributes.iter().map(|a| a.to_string()).collect(),
                auth: request.auth.map(str::to_string),
                data: vec![0u8; request.size as usize],
                written: false,
            },
        );

        match self.fault {
            Some(Fault::MisreportDefine(reported)) => Ok(reported),
            _ => Ok(index),
        }
    }

    fn write(&mut self, index: NvIndex, data: &[u8], auth: Option<&str>) -> Result<()> {
        let max_transfer = self.limits.max_transfer_size as usize;
        let fault = self.fault;
        let slot = self.slots.get_mut(&index).ok_or(Error::NotFound(index))?;
        Self::authorize(slot, index, auth)?;

        if fault == Some(Fault::FailWrites) {
            return Err(Error::device("nv write", "injected write failure"));
        }
        if data.len() > max_transfer {
            return Err(Error::device(
                "nv write",
                format!("write of {} bytes exceeds buffer max {}", data.len(), max_transfer),
            ));
        }
        if data.len() > slot.size as usize {
            return Err(Error::device(
                "nv write",
                format!("write of {} bytes exceeds index size {}", data.len(), slot.size),
            ));
        }

        slot.data[..data.len()].copy_from_slice(data);
        if fault == Some(Fault::CorruptWrites) {
            if let Some(first) = slot.data.first_mut() {
                *first ^= 0xFF;
            }
        }
        slot.written = true;
        Ok(())
    }

    fn undefine(&mut self, index: NvIndex, _hierarchy: &str, auth: Option<&str>) -> Result<()> {
        let slot = self.slot(index)?;
        if self.undefine_policy == UndefinePolicy::IndexAuth {
            Self::authorize(slot, index, auth)?;
        }
        self.slots.remove(&index);
        Ok(())
    }

    fn fixed_properties(&mut self) -> Result<DeviceLimits> {
        Ok(self.limits)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
