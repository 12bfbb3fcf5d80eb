//! NV key-value store.
//!
//! Slots are created by [`NvStore::allocate_and_write`], read by
//! [`NvStore::read`] and destroyed by [`NvStore::delete`]. There is no
//! update: changing a value means delete, then allocate again.

pub mod credential;
mod operations;
pub mod probe;
mod types;
pub mod validate;

pub use operations::NvStore;
pub use types::{NvIndex, ParseIndexError, StoreInfo};
