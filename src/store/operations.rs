//! Store operations - the main interface.

use crate::config::{
    StoreConfig, MIN_GUARANTEED_NV_CAPACITY, OWNER_HIERARCHY, SANITY_PROBE_BYTES, SLOT_ATTRIBUTES,
};
use crate::device::{DefineRequest, DeviceLimits, NvDevice, SlotMetadata};
use crate::error::{Error, Result};
use crate::store::types::{NvIndex, StoreInfo};
use crate::store::{probe, validate};
use log::{debug, info, warn};
use std::collections::BTreeSet;

/// Key-value store over the NV indices of a device.
///
/// Keys are [`NvIndex`] values inside the configured band, values are opaque
/// byte strings written once per slot.
pub struct NvStore<D: NvDevice> {
    /// Device every command goes to.
    device: D,
    /// Allocation band and password policy.
    config: StoreConfig,
}

impl<D: NvDevice> NvStore<D> {
    /// Create a store with the default band and password policy.
    pub fn new(device: D) -> Self {
        Self {
            device,
            config: StoreConfig::default(),
        }
    }

    /// Create a store with a custom configuration.
    pub fn with_config(device: D, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { device, config })
    }

    /// Store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Underlying device.
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Mutable access to the underlying device.
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Give the device back.
    pub fn into_device(self) -> D {
        self.device
    }

    /// Check that the device answers commands at all.
    pub fn sanity_check(&mut self) -> Result<()> {
        let bytes = self.device.get_random(SANITY_PROBE_BYTES)?;
        if bytes.len() != SANITY_PROBE_BYTES {
            return Err(Error::device(
                "get random",
                format!("requested {} bytes, got {}", SANITY_PROBE_BYTES, bytes.len()),
            ));
        }
        debug!("{} device answered sanity probe", self.device.name());
        Ok(())
    }

    /// Every index defined on the device, in any band.
    pub fn list(&mut self) -> Result<BTreeSet<NvIndex>> {
        probe::list_slots(&mut self.device)
    }

    /// Defined indices inside the configured band.
    pub fn list_user(&mut self) -> Result<BTreeSet<NvIndex>> {
        let config = &self.config;
        Ok(probe::list_slots(&mut self.device)?
            .into_iter()
            .filter(|index| config.contains(*index))
            .collect())
    }

    /// Public metadata of a defined index.
    pub fn metadata(&mut self, index: NvIndex) -> Result<SlotMetadata> {
        probe::slot_metadata(&mut self.device, index)
    }

    /// Fixed size limits of the device.
    pub fn limits(&mut self) -> Result<DeviceLimits> {
        probe::device_limits(&mut self.device)
    }

    /// Capability and usage summary.
    ///
    /// `user_bytes` is the sum of declared slot sizes; the device's real
    /// free space is not available.
    pub fn info(&mut self) -> Result<StoreInfo> {
        let limits = self.limits()?;
        let all = self.list()?;

        let config = &self.config;
        let mut user_slots = 0;
        let mut user_bytes = 0u64;
        for index in all.iter().filter(|index| config.contains(**index)) {
            let public = self.device.read_public(*index)?;
            user_slots += 1;
            user_bytes += public.size as u64;
        }

        Ok(StoreInfo {
            limits,
            max_value_size: limits.effective_max(),
            low: config.low,
            high: config.high,
            total_slots: all.len(),
            user_slots,
            user_bytes,
            guaranteed_capacity: MIN_GUARANTEED_NV_CAPACITY,
        })
    }

    /// Allocate `index`, write `value` into it and verify by reading it back.
    ///
    /// All validation happens before the first mutating command. Once the
    /// index is defined nothing is rolled back: a failed write leaves it
    /// defined and unwritten, a failed verification returns
    /// [`Error::WriteVerification`] naming the index.
    pub fn allocate_and_write(
        &mut self,
        index: NvIndex,
        value: &[u8],
        password: Option<&str>,
    ) -> Result<()> {
        validate::validate_allocation(&mut self.device, &self.config, index, value, password)?;

        let request = DefineRequest {
            index,
            size: value.len() as u32,
            attributes: &SLOT_ATTRIBUTES,
            hierarchy: OWNER_HIERARCHY,
            auth: password,
        };
        let reported = self.device.define(&request)?;
        if reported != index {
            warn!(
                "define of {} reported {}; index may be left defined",
                index, reported
            );
            return Err(Error::AllocationMismatch {
                requested: index,
                reported,
            });
        }
        debug!("defined {} with {} bytes", index, value.len());

        if let Err(e) = self.device.write(index, value, password) {
            warn!("write to {} failed; index is left defined and unwritten", index);
            return Err(e);
        }

        self.verify(index, value, password)?;
        info!("committed {} ({} bytes)", index, value.len());
        Ok(())
    }

    /// Read back a freshly written index and compare byte for byte.
    fn verify(&mut self, index: NvIndex, expected: &[u8], password: Option<&str>) -> Result<()> {
        let reason = match self.read(index, password) {
            Ok(actual) if actual == expected => return Ok(()),
            Ok(actual) => format!(
                "read back {} bytes that differ from the {} bytes written",
                actual.len(),
                expected.len()
            ),
            Err(e) => format!("read-back failed: {}", e),
        };

        warn!("verification of {} failed: {}", index, reason);
        Err(Error::WriteVerification { index, reason })
    }

    /// Read the full value of an index.
    pub fn read(&mut self, index: NvIndex, password: Option<&str>) -> Result<Vec<u8>> {
        let public = probe::slot_metadata(&mut self.device, index)?;
        debug!("reading {} ({} bytes)", index, public.size);
        self.device.read(index, public.size, password)
    }

    /// Remove an index. The password is passed to the device untouched.
    pub fn delete(&mut self, index: NvIndex, password: Option<&str>) -> Result<()> {
        if !probe::list_slots(&mut self.device)?.contains(&index) {
            return Err(Error::NotFound(index));
        }

        self.device.undefine(index, OWNER_HIERARCHY, password)?;
        info!("deleted {}", index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::USER_NV_LOW;
    use crate::device::{Fault, MemoryDevice};

    fn store() -> NvStore<MemoryDevice> {
        NvStore::new(MemoryDevice::new())
    }

    #[test]
    fn test_write_and_read() {
        let mut store = store();
        let index = NvIndex(USER_NV_LOW);
        store.allocate_and_write(index, b"hello world", None).unwrap();

        assert_eq!(store.read(index, None).unwrap(), b"hello world");
        let meta = store.metadata(index).unwrap();
        assert_eq!(meta.size, 11);
        for attribute in SLOT_ATTRIBUTES {
            assert!(meta.attributes.contains(attribute));
        }
    }

    #[test]
    fn test_failed_validation_leaves_device_untouched() {
        let mut store = store();
        store.allocate_and_write(NvIndex(USER_NV_LOW), b"a", None).unwrap();
        let before = store.list().unwrap();

        let result = store.allocate_and_write(NvIndex(USER_NV_LOW + 1), b"b", Some("abc"));
        assert!(matches!(result, Err(Error::WeakCredential { .. })));
        assert_eq!(store.list().unwrap(), before);
    }

    #[test]
    fn test_verification_failure_names_index() {
        let mut store = store();
        store.device_mut().inject_fault(Fault::CorruptWrites);

        let index = NvIndex(USER_NV_LOW + 7);
        let err = store.allocate_and_write(index, b"payload", None).unwrap_err();
        assert!(matches!(err, Error::WriteVerification { .. }));
        assert_eq!(err.orphaned_index(), Some(index));
        // Left in place for the caller to remove.
        assert!(store.list().unwrap().contains(&index));
    }

    #[test]
    fn test_define_mismatch() {
        let mut store = store();
        store
            .device_mut()
            .inject_fault(Fault::MisreportDefine(NvIndex(USER_NV_LOW + 99)));

        let err = store
            .allocate_and_write(NvIndex(USER_NV_LOW), b"x", None)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::AllocationMismatch {
                requested: NvIndex(USER_NV_LOW),
                ..
            }
        ));
    }

    #[test]
    fn test_failed_write_leaves_index_defined() {
        let mut store = store();
        store.device_mut().inject_fault(Fault::FailWrites);

        let index = NvIndex(USER_NV_LOW);
        let err = store.allocate_and_write(index, b"x", None).unwrap_err();
        assert!(matches!(err, Error::DeviceCommand { .. }));
        assert!(store.list().unwrap().contains(&index));

        store.device_mut().clear_fault();
        store.delete(index, None).unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_delete_missing() {
        let mut store = store();
        assert!(matches!(
            store.delete(NvIndex(USER_NV_LOW), None),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_sanity_check() {
        store().sanity_check().unwrap();
    }

    #[test]
    fn test_list_user_filters_band() {
        let mut store = store();
        store.device_mut().insert_foreign(NvIndex(0x0140_0001), b"vendor");
        store.allocate_and_write(NvIndex(USER_NV_LOW), b"mine", None).unwrap();

        assert_eq!(store.list().unwrap().len(), 2);
        let user: Vec<_> = store.list_user().unwrap().into_iter().collect();
        assert_eq!(user, vec![NvIndex(USER_NV_LOW)]);
    }

    #[test]
    fn test_info() {
        let mut store = store();
        store.device_mut().insert_foreign(NvIndex(0x0140_0001), b"vendor");
        store.allocate_and_write(NvIndex(USER_NV_LOW), b"abc", None).unwrap();
        store.allocate_and_write(NvIndex(USER_NV_LOW + 1), b"defgh", None).unwrap();

        let info = store.info().unwrap();
        assert_eq!(info.total_slots, 3);
        assert_eq!(info.user_slots, 2);
        assert_eq!(info.user_bytes, 8);
        assert_eq!(info.max_value_size, 2048);
        assert_eq!(info.guaranteed_capacity, MIN_GUARANTEED_NV_CAPACITY);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = StoreConfig {
            min_password_length: 0,
            ..Default::default()
        };
        assert!(NvStore::with_config(MemoryDevice::new(), config).is_err());
    }
}
