//! UEFI Task Priority Level (TPL) Locking support
//!
//! The PCD services guard their databases and callback rows with a [`TplMutex`]. Until boot services are registered
//! with [`init_boot_services`] the lock is a plain lock with no TPL interaction, which is what the PEI service runs
//! with. Once boot services are registered every lock raises to its TPL for as long as the guard lives.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::{
    cell::UnsafeCell,
    fmt,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, AtomicPtr, Ordering},
};

use r_efi::efi;

static BOOT_SERVICES_PTR: AtomicPtr<efi::BootServices> = AtomicPtr::new(core::ptr::null_mut());

/// Registers boot services for TPL locking. Passing null collapses every lock back to a plain lock.
///
// A global pointer keeps `TplMutex::new` const so locks can back statics and exist before boot services do.
pub fn init_boot_services(boot_services: *mut efi::BootServices) {
    BOOT_SERVICES_PTR.store(boot_services, Ordering::SeqCst);
}

fn boot_services() -> Option<&'static efi::BootServices> {
    let boot_services_ptr = BOOT_SERVICES_PTR.load(Ordering::SeqCst);
    // SAFETY: the pointer is either null or was registered by the platform and lives for the rest of boot.
    unsafe { boot_services_ptr.as_ref() }
}

/// A spin lock that holds the TPL at `tpl_lock_level` while locked.
pub struct TplMutex<T: ?Sized> {
    tpl_lock_level: efi::Tpl,
    lock: AtomicBool,
    name: &'static str,
    data: UnsafeCell<T>,
}

/// Access to the data of a locked [`TplMutex`]. The lock and the TPL are released on drop.
pub struct TplGuard<'a, T: ?Sized + 'a> {
    release_tpl: Option<efi::Tpl>,
    lock: &'a AtomicBool,
    name: &'static str,
    data: *mut T,
}

unsafe impl<T: ?Sized + Send> Sync for TplMutex<T> {}
unsafe impl<T: ?Sized + Send> Send for TplMutex<T> {}

unsafe impl<T: ?Sized + Sync> Sync for TplGuard<'_, T> {}
unsafe impl<T: ?Sized + Send> Send for TplGuard<'_, T> {}

impl<T> TplMutex<T> {
    /// `name` identifies the lock in panics and debug output.
    pub const fn new(tpl_lock_level: efi::Tpl, data: T, name: &'static str) -> Self {
        Self { tpl_lock_level, lock: AtomicBool::new(false), data: UnsafeCell::new(data), name }
    }
}

impl<T: ?Sized> TplMutex<T> {
    /// Locks the mutex, raising the TPL to the level given at creation.
    ///
    /// Re-entrance is not supported; locking a mutex that is already held panics.
    pub fn lock(&self) -> TplGuard<'_, T> {
        self.try_lock().unwrap_or_else(|| panic!("{} is already locked", self.name))
    }

    /// Attempts to lock the mutex, returning `None` if it is already held.
    pub fn try_lock(&self) -> Option<TplGuard<'_, T>> {
        let boot_services = boot_services();
        let release_tpl = boot_services.map(|bs| (bs.raise_tpl)(self.tpl_lock_level));
        if self.lock.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed).is_ok() {
            Some(TplGuard { release_tpl, lock: &self.lock, name: self.name, data: self.data.get() })
        } else {
            if let (Some(release_tpl), Some(bs)) = (release_tpl, boot_services) {
                (bs.restore_tpl)(release_tpl);
            }
            None
        }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for TplMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => {
                write!(f, "TplMutex {{ data: ").and_then(|()| (*guard).fmt(f)).and_then(|()| write!(f, "}}"))
            }
            None => write!(f, "TplMutex {{ <locked> }}"),
        }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for TplGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<'a, T: ?Sized> Deref for TplGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &'a T {
        // SAFETY: data is only reachable through the lock.
        unsafe { &*self.data }
    }
}

impl<'a, T: ?Sized> DerefMut for TplGuard<'a, T> {
    fn deref_mut(&mut self) -> &'a mut T {
        // SAFETY: data is only reachable through the lock.
        unsafe { &mut *self.data }
    }
}

impl<T: ?Sized> Drop for TplGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.store(false, Ordering::Release);
        if let Some(tpl) = self.release_tpl {
            let bs = boot_services()
                .unwrap_or_else(|| panic!("{} raised the TPL but boot services are gone", self.name));
            (bs.restore_tpl)(tpl);
        }
    }
}
