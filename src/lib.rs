//! TPM NV Store
//!
//! A minimal persistent key-value store on top of the non-volatile index
//! slots of a TPM 2.0 device.
//!
//! # Features
//!
//! - **Write once**: a slot is defined, written and verified by read-back in
//!   one call; existing slots are never overwritten
//! - **Front-loaded checks**: index band, size limits, collisions and password
//!   policy are checked before the first mutating device command
//! - **Per-slot passwords**: optional, enforced by the device
//! - **Pluggable devices**: `tpm2-tools` for real hardware, an in-memory
//!   emulator for tests and dry runs
//!
//! # Lifecycle
//!
//! ```text
//! validate → define → write → read back → compare
//! ```
//!
//! # Example
//!
//! ```rust
//! use tpm_nvstore::device::MemoryDevice;
//! use tpm_nvstore::{NvIndex, NvStore};
//!
//! let mut store = NvStore::new(MemoryDevice::new());
//! let key = NvIndex(0x0180_0000);
//!
//! store.allocate_and_write(key, b"hello world", Some("abcde")).unwrap();
//! assert_eq!(store.read(key, Some("abcde")).unwrap(), b"hello world");
//!
//! store.delete(key, None).unwrap();
//! assert!(store.read(key, None).is_err());
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod store;

pub use config::StoreConfig;
pub use error::{Error, Result};
pub use store::{NvIndex, NvStore};
