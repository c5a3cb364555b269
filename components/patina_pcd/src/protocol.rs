//! PCD Protocol
//!
//! The firmware ABI of the PCD services: a `#[repr(C)]` table of `efiapi` functions published under
//! [`PCD_PROTOCOL_GUID`] in DXE and [`PCD_PPI_GUID`] in PEI. Every entry forwards to the [`PcdService`] registered
//! with [`install`].
//!
//! The table follows the PCD protocol contract:
//!
//! - Getters have no status. A failed Get is logged and returns zero (or null for `GetPtr`).
//! - `GetPtr` returns a buffer owned by the protocol, one per token, refreshed on every call for that token.
//! - `SetPtr` takes the buffer size in/out. A size above the token maximum is clamped and `INVALID_PARAMETER` is
//!   returned without writing.
//! - `GetNextToken` uses token 0 both to start and to end a walk. `GetNextTokenSpace` does the same with a null GUID.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
extern crate alloc;

use alloc::{collections::BTreeMap, vec::Vec};
use core::{ffi::c_void, ptr};

use patina_internal_pcd::{PcdCallbackFn, PcdError, Result, SkuId, TokenNumber};
use r_efi::efi;

use crate::service::{Pcd, PcdService};
use crate::tpl_lock::TplMutex;

/// GUID of the DXE PCD protocol.
pub const PCD_PROTOCOL_GUID: efi::Guid =
    efi::Guid::from_fields(0x11b34006, 0xd85b, 0x4d0a, 0xa2, 0x90, &[0xd5, 0xa5, 0x71, 0x31, 0x0e, 0xf7]);

/// GUID of the PEI PCD PPI.
pub const PCD_PPI_GUID: efi::Guid =
    efi::Guid::from_fields(0x06e81c58, 0x4ad7, 0x44bc, 0x83, 0x90, &[0xf1, 0x02, 0x65, 0xf7, 0x24, 0x80]);

/// The PCD protocol (DXE) and PPI (PEI) function table.
#[repr(C)]
pub struct PcdProtocol {
    pub set_sku: extern "efiapi" fn(sku_id: usize),

    pub get8: extern "efiapi" fn(token_number: usize) -> u8,
    pub get16: extern "efiapi" fn(token_number: usize) -> u16,
    pub get32: extern "efiapi" fn(token_number: usize) -> u32,
    pub get64: extern "efiapi" fn(token_number: usize) -> u64,
    pub get_ptr: extern "efiapi" fn(token_number: usize) -> *mut c_void,
    pub get_bool: extern "efiapi" fn(token_number: usize) -> efi::Boolean,
    pub get_size: extern "efiapi" fn(token_number: usize) -> usize,

    pub get8_ex: extern "efiapi" fn(guid: *const efi::Guid, token_number: usize) -> u8,
    pub get16_ex: extern "efiapi" fn(guid: *const efi::Guid, token_number: usize) -> u16,
    pub get32_ex: extern "efiapi" fn(guid: *const efi::Guid, token_number: usize) -> u32,
    pub get64_ex: extern "efiapi" fn(guid: *const efi::Guid, token_number: usize) -> u64,
    pub get_ptr_ex: extern "efiapi" fn(guid: *const efi::Guid, token_number: usize) -> *mut c_void,
    pub get_bool_ex: extern "efiapi" fn(guid: *const efi::Guid, token_number: usize) -> efi::Boolean,
    pub get_size_ex: extern "efiapi" fn(guid: *const efi::Guid, token_number: usize) -> usize,

    pub set8: extern "efiapi" fn(token_number: usize, value: u8) -> efi::Status,
    pub set16: extern "efiapi" fn(token_number: usize, value: u16) -> efi::Status,
    pub set32: extern "efiapi" fn(token_number: usize, value: u32) -> efi::Status,
    pub set64: extern "efiapi" fn(token_number: usize, value: u64) -> efi::Status,
    pub set_ptr:
        extern "efiapi" fn(token_number: usize, size_of_buffer: *mut usize, buffer: *mut c_void) -> efi::Status,
    pub set_bool: extern "efiapi" fn(token_number: usize, value: efi::Boolean) -> efi::Status,

    pub set8_ex: extern "efiapi" fn(guid: *const efi::Guid, token_number: usize, value: u8) -> efi::Status,
    pub set16_ex: extern "efiapi" fn(guid: *const efi::Guid, token_number: usize, value: u16) -> efi::Status,
    pub set32_ex: extern "efiapi" fn(guid: *const efi::Guid, token_number: usize, value: u32) -> efi::Status,
    pub set64_ex: extern "efiapi" fn(guid: *const efi::Guid, token_number: usize, value: u64) -> efi::Status,
    pub set_ptr_ex: extern "efiapi" fn(
        guid: *const efi::Guid,
        token_number: usize,
        size_of_buffer: *mut usize,
        buffer: *mut c_void,
    ) -> efi::Status,
    pub set_bool_ex:
        extern "efiapi" fn(guid: *const efi::Guid, token_number: usize, value: efi::Boolean) -> efi::Status,

    pub callback_on_set:
        extern "efiapi" fn(guid: *const efi::Guid, token_number: usize, callback: Option<PcdCallbackFn>) -> efi::Status,
    pub cancel_callback:
        extern "efiapi" fn(guid: *const efi::Guid, token_number: usize, callback: Option<PcdCallbackFn>) -> efi::Status,
    pub get_next_token: extern "efiapi" fn(guid: *const efi::Guid, token_number: *mut usize) -> efi::Status,
    pub get_next_token_space: extern "efiapi" fn(guid: *mut *const efi::Guid) -> efi::Status,
}

static SERVICE: spin::Once<&'static PcdService> = spin::Once::new();

// Ex token spaces never change once a service is installed; GetNextTokenSpace hands out pointers into this list.
static TOKEN_SPACES: spin::Once<Vec<efi::Guid>> = spin::Once::new();

// GetPtr buffers keyed by (namespace, token number).
static PTR_BUFFERS: TplMutex<BTreeMap<(Option<[u8; 16]>, TokenNumber), Vec<u8>>> =
    TplMutex::new(efi::TPL_NOTIFY, BTreeMap::new(), "PcdPtrBuffers");

static PCD_PROTOCOL: PcdProtocol = PcdProtocol {
    set_sku,
    get8,
    get16,
    get32,
    get64,
    get_ptr,
    get_bool,
    get_size,
    get8_ex,
    get16_ex,
    get32_ex,
    get64_ex,
    get_ptr_ex,
    get_bool_ex,
    get_size_ex,
    set8,
    set16,
    set32,
    set64,
    set_ptr,
    set_bool,
    set8_ex,
    set16_ex,
    set32_ex,
    set64_ex,
    set_ptr_ex,
    set_bool_ex,
    callback_on_set,
    cancel_callback,
    get_next_token,
    get_next_token_space,
};

/// Registers `service` as the backend of the protocol table and returns the table.
///
/// Only one service can back the table. Installing a different service after the first fails with
/// `ALREADY_STARTED`; installing the same service again is a no-op.
pub fn install(service: &'static PcdService) -> core::result::Result<&'static PcdProtocol, efi::Status> {
    let installed = *SERVICE.call_once(|| service);
    if !ptr::eq(installed, service) {
        log::error!(target: "pcd_service", "A PCD service is already installed");
        return Err(efi::Status::ALREADY_STARTED);
    }
    TOKEN_SPACES.call_once(|| {
        let mut spaces = Vec::new();
        let mut space = None;
        while let Ok(Some(guid)) = service.get_next_token_space(space) {
            spaces.push(guid);
            space = Some(guid);
        }
        spaces
    });
    log::info!(target: "pcd_service", "PCD protocol bound to the {:?} service", service.phase());
    Ok(&PCD_PROTOCOL)
}

/// Installs the protocol table on `handle` (a new handle if `*handle` is null).
pub fn install_protocol(
    boot_services: &efi::BootServices,
    handle: &mut efi::Handle,
    service: &'static PcdService,
) -> core::result::Result<(), efi::Status> {
    let protocol = install(service)?;
    let status = (boot_services.install_protocol_interface)(
        handle as *mut efi::Handle,
        &PCD_PROTOCOL_GUID as *const efi::Guid as *mut efi::Guid,
        efi::NATIVE_INTERFACE,
        protocol as *const PcdProtocol as *mut c_void,
    );
    if status.is_error() {
        log::error!(target: "pcd_service", "Failed to install the PCD protocol: {:?}", status);
        return Err(status);
    }
    Ok(())
}

fn service() -> Result<&'static PcdService> {
    SERVICE.get().copied().ok_or_else(|| {
        log::error!(target: "pcd_service", "PCD protocol called before a service was installed");
        PcdError::NotFound
    })
}

// Getters have no status to report through; failures read as zero.
fn value_or_default<T: Default>(result: Result<T>) -> T {
    result.unwrap_or_else(|e| {
        log::error!(target: "pcd_service", "PCD Get failed: {:?}", e);
        T::default()
    })
}

fn status_of(result: Result<()>) -> efi::Status {
    match result {
        Ok(()) => efi::Status::SUCCESS,
        Err(e) => e.into(),
    }
}

fn guid_arg(guid: *const efi::Guid) -> Option<efi::Guid> {
    // SAFETY: callers pass either null or a valid GUID.
    unsafe { guid.as_ref() }.copied()
}

fn required_guid(guid: *const efi::Guid) -> Result<efi::Guid> {
    guid_arg(guid).ok_or(PcdError::GuidNotRegistered)
}

fn ptr_worker(guid: Option<efi::Guid>, token: TokenNumber, value: Result<Vec<u8>>) -> *mut c_void {
    let value = match value {
        Ok(value) => value,
        Err(e) => {
            log::error!(target: "pcd_service", "PCD GetPtr failed: {:?}", e);
            return ptr::null_mut();
        }
    };
    let mut buffers = PTR_BUFFERS.lock();
    let buffer = buffers.entry((guid.map(|guid| *guid.as_bytes()), token)).or_default();
    // A token keeps its size, so after the first call the buffer is updated in place and earlier pointers stay valid.
    if buffer.len() == value.len() {
        buffer.copy_from_slice(&value);
    } else {
        *buffer = value;
    }
    buffer.as_mut_ptr() as *mut c_void
}

// Shared by SetPtr and SetPtrEx: clamps `*size_of_buffer` to `max` or writes the buffer through `set`.
fn set_ptr_worker(
    max: Result<usize>,
    size_of_buffer: *mut usize,
    buffer: *mut c_void,
    set: impl FnOnce(&[u8]) -> Result<()>,
) -> efi::Status {
    // SAFETY: the caller passes a valid in/out size.
    let Some(size) = (unsafe { size_of_buffer.as_mut() }) else {
        return efi::Status::INVALID_PARAMETER;
    };
    let max = match max {
        Ok(max) => max,
        Err(e) => return e.into(),
    };
    if *size > max {
        *size = max;
        return efi::Status::INVALID_PARAMETER;
    }
    if *size > 0 && buffer.is_null() {
        return efi::Status::INVALID_PARAMETER;
    }
    let data = if *size == 0 {
        &[][..]
    } else {
        // SAFETY: the caller passes a buffer of at least `*size` bytes.
        unsafe { core::slice::from_raw_parts(buffer as *const u8, *size) }
    };
    status_of(set(data))
}

extern "efiapi" fn set_sku(sku_id: usize) {
    match (service(), SkuId::try_from(sku_id)) {
        (Ok(service), Ok(sku_id)) => service.set_sku(sku_id),
        (_, Err(_)) => log::error!(target: "pcd_service", "SetSku({:#X}) is not a valid SKU id", sku_id),
        (Err(_), _) => (),
    }
}

extern "efiapi" fn get8(token_number: usize) -> u8 {
    value_or_default(service().and_then(|s| s.get8(token_number)))
}

extern "efiapi" fn get16(token_number: usize) -> u16 {
    value_or_default(service().and_then(|s| s.get16(token_number)))
}

extern "efiapi" fn get32(token_number: usize) -> u32 {
    value_or_default(service().and_then(|s| s.get32(token_number)))
}

extern "efiapi" fn get64(token_number: usize) -> u64 {
    value_or_default(service().and_then(|s| s.get64(token_number)))
}

extern "efiapi" fn get_ptr(token_number: usize) -> *mut c_void {
    ptr_worker(None, token_number, service().and_then(|s| s.get_ptr(token_number)))
}

extern "efiapi" fn get_bool(token_number: usize) -> efi::Boolean {
    value_or_default(service().and_then(|s| s.get_bool(token_number))).into()
}

extern "efiapi" fn get_size(token_number: usize) -> usize {
    value_or_default(service().and_then(|s| s.get_size(token_number)))
}

extern "efiapi" fn get8_ex(guid: *const efi::Guid, token_number: usize) -> u8 {
    value_or_default(service().and_then(|s| s.get8_ex(&required_guid(guid)?, token_number)))
}

extern "efiapi" fn get16_ex(guid: *const efi::Guid, token_number: usize) -> u16 {
    value_or_default(service().and_then(|s| s.get16_ex(&required_guid(guid)?, token_number)))
}

extern "efiapi" fn get32_ex(guid: *const efi::Guid, token_number: usize) -> u32 {
    value_or_default(service().and_then(|s| s.get32_ex(&required_guid(guid)?, token_number)))
}

extern "efiapi" fn get64_ex(guid: *const efi::Guid, token_number: usize) -> u64 {
    value_or_default(service().and_then(|s| s.get64_ex(&required_guid(guid)?, token_number)))
}

extern "efiapi" fn get_ptr_ex(guid: *const efi::Guid, token_number: usize) -> *mut c_void {
    let value = service().and_then(|s| s.get_ptr_ex(&required_guid(guid)?, token_number));
    ptr_worker(guid_arg(guid), token_number, value)
}

extern "efiapi" fn get_bool_ex(guid: *const efi::Guid, token_number: usize) -> efi::Boolean {
    value_or_default(service().and_then(|s| s.get_bool_ex(&required_guid(guid)?, token_number))).into()
}

extern "efiapi" fn get_size_ex(guid: *const efi::Guid, token_number: usize) -> usize {
    value_or_default(service().and_then(|s| s.get_size_ex(&required_guid(guid)?, token_number)))
}

extern "efiapi" fn set8(token_number: usize, value: u8) -> efi::Status {
    status_of(service().and_then(|s| s.set8(token_number, value)))
}

extern "efiapi" fn set16(token_number: usize, value: u16) -> efi::Status {
    status_of(service().and_then(|s| s.set16(token_number, value)))
}

extern "efiapi" fn set32(token_number: usize, value: u32) -> efi::Status {
    status_of(service().and_then(|s| s.set32(token_number, value)))
}

extern "efiapi" fn set64(token_number: usize, value: u64) -> efi::Status {
    status_of(service().and_then(|s| s.set64(token_number, value)))
}

extern "efiapi" fn set_ptr(token_number: usize, size_of_buffer: *mut usize, buffer: *mut c_void) -> efi::Status {
    let service = match service() {
        Ok(service) => service,
        Err(e) => return e.into(),
    };
    set_ptr_worker(service.get_size(token_number), size_of_buffer, buffer, |data| service.set_ptr(token_number, data))
}

extern "efiapi" fn set_bool(token_number: usize, value: efi::Boolean) -> efi::Status {
    status_of(service().and_then(|s| s.set_bool(token_number, value.into())))
}

extern "efiapi" fn set8_ex(guid: *const efi::Guid, token_number: usize, value: u8) -> efi::Status {
    status_of(service().and_then(|s| s.set8_ex(&required_guid(guid)?, token_number, value)))
}

extern "efiapi" fn set16_ex(guid: *const efi::Guid, token_number: usize, value: u16) -> efi::Status {
    status_of(service().and_then(|s| s.set16_ex(&required_guid(guid)?, token_number, value)))
}

extern "efiapi" fn set32_ex(guid: *const efi::Guid, token_number: usize, value: u32) -> efi::Status {
    status_of(service().and_then(|s| s.set32_ex(&required_guid(guid)?, token_number, value)))
}

extern "efiapi" fn set64_ex(guid: *const efi::Guid, token_number: usize, value: u64) -> efi::Status {
    status_of(service().and_then(|s| s.set64_ex(&required_guid(guid)?, token_number, value)))
}

extern "efiapi" fn set_ptr_ex(
    guid: *const efi::Guid,
    token_number: usize,
    size_of_buffer: *mut usize,
    buffer: *mut c_void,
) -> efi::Status {
    let (service, guid) = match service().and_then(|s| Ok((s, required_guid(guid)?))) {
        Ok(args) => args,
        Err(e) => return e.into(),
    };
    set_ptr_worker(service.get_size_ex(&guid, token_number), size_of_buffer, buffer, |data| {
        service.set_ptr_ex(&guid, token_number, data)
    })
}

extern "efiapi" fn set_bool_ex(guid: *const efi::Guid, token_number: usize, value: efi::Boolean) -> efi::Status {
    status_of(service().and_then(|s| s.set_bool_ex(&required_guid(guid)?, token_number, value.into())))
}

extern "efiapi" fn callback_on_set(
    guid: *const efi::Guid,
    token_number: usize,
    callback: Option<PcdCallbackFn>,
) -> efi::Status {
    let Some(callback) = callback else {
        return efi::Status::INVALID_PARAMETER;
    };
    status_of(service().and_then(|s| s.callback_on_set_fn(guid_arg(guid), token_number, callback).map(|_| ())))
}

extern "efiapi" fn cancel_callback(
    guid: *const efi::Guid,
    token_number: usize,
    callback: Option<PcdCallbackFn>,
) -> efi::Status {
    let Some(callback) = callback else {
        return efi::Status::INVALID_PARAMETER;
    };
    status_of(service().and_then(|s| s.cancel_callback_fn(guid_arg(guid), token_number, callback)))
}

extern "efiapi" fn get_next_token(guid: *const efi::Guid, token_number: *mut usize) -> efi::Status {
    // SAFETY: the caller passes a valid in/out token number.
    let Some(token_number) = (unsafe { token_number.as_mut() }) else {
        return efi::Status::INVALID_PARAMETER;
    };
    match service().and_then(|s| s.get_next_token(guid_arg(guid), *token_number)) {
        Ok(next) => {
            *token_number = next.unwrap_or(patina_internal_pcd::PCD_INVALID_TOKEN_NUMBER);
            efi::Status::SUCCESS
        }
        Err(e) => e.into(),
    }
}

extern "efiapi" fn get_next_token_space(guid: *mut *const efi::Guid) -> efi::Status {
    // SAFETY: the caller passes a valid in/out GUID pointer.
    let Some(guid) = (unsafe { guid.as_mut() }) else {
        return efi::Status::INVALID_PARAMETER;
    };
    let Some(spaces) = TOKEN_SPACES.get() else {
        return efi::Status::NOT_FOUND;
    };
    let next = match guid_arg(*guid) {
        None => spaces.first(),
        Some(current) => match spaces.iter().position(|space| *space == current) {
            Some(index) => spaces.get(index + 1),
            None => return efi::Status::NOT_FOUND,
        },
    };
    *guid = next.map_or(ptr::null(), |space| space as *const efi::Guid);
    efi::Status::SUCCESS
}
