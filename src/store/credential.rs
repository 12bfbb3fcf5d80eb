//! Password policy for slot credentials.
//!
//! Passwords are handed to the device as-is; the device enforces them.

use crate::error::{Error, Result};

/// Reject passwords shorter than `min_length` characters.
///
/// `None` is always accepted and means the slot is openly accessible.
pub fn check_policy(password: Option<&str>, min_length: usize) -> Result<()> {
    match password {
        Some(password) => {
            let len = password.chars().count();
            if len < min_length {
                Err(Error::WeakCredential {
                    len,
                    min: min_length,
                })
            } else {
                Ok(())
            }
        }
        None => Ok(()),
    }
}
