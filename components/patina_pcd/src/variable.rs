//! UEFI Variable Services adapter
//!
//! HII tokens read their value out of a UEFI variable. [`RuntimeVariableServices`] implements the engine's
//! [`VariableServices`] collaborator over the `GetVariable` entry of an `efi::RuntimeServices` table.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
extern crate alloc;

use alloc::vec::Vec;
use core::{
    ffi::c_void,
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};

use patina_internal_pcd::VariableServices;
use r_efi::efi;

/// Reads UEFI variables through the runtime services table.
#[derive(Debug)]
pub struct RuntimeVariableServices {
    runtime_services: AtomicPtr<efi::RuntimeServices>,
}

impl RuntimeVariableServices {
    /// Wraps the runtime services table at `runtime_services`.
    ///
    /// ## Safety
    ///
    /// `runtime_services` must point to a runtime services table that stays valid for the life of this object.
    pub const unsafe fn new(runtime_services: *mut efi::RuntimeServices) -> Self {
        Self { runtime_services: AtomicPtr::new(runtime_services) }
    }

    fn efi_runtime_services(&self) -> Option<&efi::RuntimeServices> {
        // SAFETY: the pointer was provided to `new` with the guarantee that it outlives self.
        unsafe { self.runtime_services.load(Ordering::SeqCst).as_ref() }
    }

    // Returns the status of the call and the size GetVariable reported.
    fn call_get_variable(&self, name: &mut [u16], guid: &efi::Guid, data: &mut [u8]) -> (efi::Status, usize) {
        let Some(runtime_services) = self.efi_runtime_services() else {
            log::error!(target: "pcd_service", "GetVariable called without a runtime services table");
            return (efi::Status::NOT_FOUND, 0);
        };
        let get_variable = runtime_services.get_variable;
        if get_variable as usize == 0 {
            debug_assert!(false, "GetVariable has not initialized in the Runtime Services Table.");
            return (efi::Status::NOT_FOUND, 0);
        }

        let mut data_size = data.len();
        let mut attributes = 0u32;
        let status = get_variable(
            name.as_mut_ptr(),
            guid as *const _ as *mut _,
            ptr::addr_of_mut!(attributes),
            ptr::addr_of_mut!(data_size),
            if data.is_empty() { ptr::null_mut() } else { data.as_mut_ptr() as *mut c_void },
        );
        (status, data_size)
    }
}

impl VariableServices for RuntimeVariableServices {
    fn get_variable(&self, name: &[u16], guid: &efi::Guid) -> Result<Vec<u8>, efi::Status> {
        if !name.contains(&0) {
            debug_assert!(false, "Name passed into get_variable is not null-terminated.");
            return Err(efi::Status::INVALID_PARAMETER);
        }
        let mut name = name.to_vec();
        let mut data = Vec::new();

        // The first call sizes the buffer; a second BUFFER_TOO_SMALL means the variable grew in between.
        let mut first_attempt = true;
        loop {
            match self.call_get_variable(&mut name, guid, &mut data) {
                (status, size) if status == efi::Status::BUFFER_TOO_SMALL && first_attempt => {
                    first_attempt = false;
                    data.resize(size, 0);
                }
                (status, size) if !status.is_error() => {
                    data.truncate(size);
                    return Ok(data);
                }
                (status, _) => {
                    log::warn!(target: "pcd_service", "GetVariable({:?}) failed: {:?}", guid, status);
                    return Err(status);
                }
            }
        }
    }
}
