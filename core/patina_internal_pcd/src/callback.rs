//! Callback Registry
//!
//! One row of callbacks per token. Rows keep registration order and may hold the same callback more than once;
//! every entry fires. A registry built with a capacity refuses to grow a row past it, which models the fixed-size
//! PEI callback table.
//!
//! Registration hands back a [`CallbackHandle`] that identifies exactly one entry. Callbacks registered through the
//! function-pointer interface also carry a key so they can be cancelled by the same function pointer.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
extern crate alloc;

use alloc::{sync::Arc, vec::Vec};
use core::ffi::c_void;
use r_efi::efi;

use crate::error::{PcdError, Result};
use crate::token::{TokenNumber, PCD_INVALID_TOKEN_NUMBER};

/// A Set observer. Receives the namespace GUID (Ex sets only), the token number the caller used, and the value about
/// to be written.
pub type PcdCallback = Arc<dyn Fn(Option<&efi::Guid>, TokenNumber, &[u8]) + Send + Sync>;

/// The firmware ABI form of a Set observer.
pub type PcdCallbackFn =
    extern "efiapi" fn(guid: *const efi::Guid, token_number: usize, token_data: *mut c_void, token_data_size: usize);

/// Identifies one registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackHandle {
    token: TokenNumber,
    id: u64,
}

impl CallbackHandle {
    /// The token the callback is registered on.
    pub fn token(&self) -> TokenNumber {
        self.token
    }
}

struct Entry {
    id: u64,
    key: Option<usize>,
    callback: PcdCallback,
}

/// Per-token callback rows.
pub struct CallbackRegistry {
    rows: Vec<Vec<Entry>>,
    capacity: Option<usize>,
    next_id: u64,
}

impl CallbackRegistry {
    /// Creates rows for tokens `[0, token_count)`. Token 0 never accepts callbacks.
    pub fn new(token_count: usize, capacity: Option<usize>) -> Self {
        let mut rows = Vec::with_capacity(token_count);
        rows.resize_with(token_count, Vec::new);
        Self { rows, capacity, next_id: 1 }
    }

    pub fn token_count(&self) -> usize {
        self.rows.len()
    }

    fn row(&self, token: TokenNumber) -> Result<&Vec<Entry>> {
        match self.rows.get(token) {
            Some(row) if token != PCD_INVALID_TOKEN_NUMBER => Ok(row),
            _ => Err(PcdError::TokenNotFound(token)),
        }
    }

    fn row_mut(&mut self, token: TokenNumber) -> Result<&mut Vec<Entry>> {
        match self.rows.get_mut(token) {
            Some(row) if token != PCD_INVALID_TOKEN_NUMBER => Ok(row),
            _ => Err(PcdError::TokenNotFound(token)),
        }
    }

    /// Appends `callback` to the row of `token`.
    ///
    /// `key` is an optional identity used by [`Self::unregister_key`].
    pub fn register(
        &mut self,
        token: TokenNumber,
        callback: PcdCallback,
        key: Option<usize>,
    ) -> Result<CallbackHandle> {
        let capacity = self.capacity;
        let id = self.next_id;
        let row = self.row_mut(token)?;
        if capacity.is_some_and(|capacity| row.len() >= capacity) {
            log::warn!(target: "pcd", "Callback row for token {} is full", token);
            return Err(PcdError::OutOfResources);
        }
        row.push(Entry { id, key, callback });
        self.next_id += 1;
        log::debug!(target: "pcd", "Registered callback {} on token {}", id, token);
        Ok(CallbackHandle { token, id })
    }

    /// Removes the entry identified by `handle`.
    pub fn unregister(&mut self, handle: CallbackHandle) -> Result<()> {
        let row = self.row_mut(handle.token)?;
        let index = row.iter().position(|entry| entry.id == handle.id).ok_or(PcdError::NotFound)?;
        row.remove(index);
        log::debug!(target: "pcd", "Unregistered callback {} from token {}", handle.id, handle.token);
        Ok(())
    }

    /// Removes the first entry of the row of `token` registered with `key`.
    pub fn unregister_key(&mut self, token: TokenNumber, key: usize) -> Result<()> {
        let row = self.row_mut(token)?;
        let index = row.iter().position(|entry| entry.key == Some(key)).ok_or(PcdError::NotFound)?;
        let entry = row.remove(index);
        log::debug!(target: "pcd", "Unregistered callback {} from token {}", entry.id, token);
        Ok(())
    }

    /// Returns the callbacks of `token` in registration order.
    pub fn callbacks(&self, token: TokenNumber) -> Result<Vec<PcdCallback>> {
        Ok(self.row(token)?.iter().map(|entry| entry.callback.clone()).collect())
    }
}

impl core::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("tokens", &self.rows.len())
            .field("registered", &self.rows.iter().map(Vec::len).sum::<usize>())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<u32>>>, tag: u32) -> PcdCallback {
        let log = log.clone();
        Arc::new(move |_: Option<&efi::Guid>, _: TokenNumber, _: &[u8]| log.lock().unwrap().push(tag))
    }

    fn fire(registry: &CallbackRegistry, token: TokenNumber) {
        for callback in registry.callbacks(token).unwrap() {
            callback(None, token, &[]);
        }
    }

    #[test]
    fn test_callbacks_fire_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = CallbackRegistry::new(4, None);
        registry.register(2, recorder(&log, 1), None).unwrap();
        registry.register(2, recorder(&log, 2), None).unwrap();
        registry.register(3, recorder(&log, 3), None).unwrap();

        fire(&registry, 2);
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_duplicate_registrations_both_fire() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = CallbackRegistry::new(2, None);
        let callback = recorder(&log, 7);
        registry.register(1, callback.clone(), Some(0x1000)).unwrap();
        registry.register(1, callback, Some(0x1000)).unwrap();

        fire(&registry, 1);
        assert_eq!(*log.lock().unwrap(), vec![7, 7]);

        registry.unregister_key(1, 0x1000).unwrap();
        fire(&registry, 1);
        assert_eq!(*log.lock().unwrap(), vec![7, 7, 7]);
    }

    #[test]
    fn test_unregister_by_handle() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = CallbackRegistry::new(2, None);
        let first = registry.register(1, recorder(&log, 1), None).unwrap();
        registry.register(1, recorder(&log, 2), None).unwrap();

        registry.unregister(first).unwrap();
        fire(&registry, 1);
        assert_eq!(*log.lock().unwrap(), vec![2]);
        assert_eq!(registry.unregister(first), Err(PcdError::NotFound));
    }

    #[test]
    fn test_unregister_missing_key() {
        let mut registry = CallbackRegistry::new(2, None);
        assert_eq!(registry.unregister_key(1, 0xDEAD), Err(PcdError::NotFound));
    }

    #[test]
    fn test_capacity_limits_row() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = CallbackRegistry::new(2, Some(2));
        let first = registry.register(1, recorder(&log, 1), None).unwrap();
        registry.register(1, recorder(&log, 2), None).unwrap();
        assert_eq!(registry.register(1, recorder(&log, 3), None).unwrap_err(), PcdError::OutOfResources);

        registry.unregister(first).unwrap();
        assert!(registry.register(1, recorder(&log, 3), None).is_ok());
    }

    #[test]
    fn test_reserved_and_out_of_range_tokens_are_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = CallbackRegistry::new(2, None);
        assert_eq!(registry.register(0, recorder(&log, 1), None).unwrap_err(), PcdError::TokenNotFound(0));
        assert_eq!(registry.register(2, recorder(&log, 1), None).unwrap_err(), PcdError::TokenNotFound(2));
        assert!(registry.callbacks(5).is_err());
    }
}
