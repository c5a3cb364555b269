//! Storage Backends
//!
//! After token resolution and SKU selection every token names exactly one [`StorageLocation`]. Reads and writes are
//! dispatched on it:
//!
//! - [`StorageLocation::Data`] and [`StorageLocation::String`] live in the database image and are writable.
//! - [`StorageLocation::Vpd`] is read through a [`VpdRegion`].
//! - [`StorageLocation::Hii`] is read through [`VariableServices`]. A failing GetVariable is returned unchanged as
//!   [`PcdError::Variable`].
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
extern crate alloc;

use alloc::vec::Vec;
use r_efi::efi;

#[cfg(any(test, feature = "mockall"))]
use mockall::automock;

use crate::error::{PcdError, Result};
use crate::image::DatabaseImage;
use crate::token::{LocalToken, StorageKind, TokenNumber};

/// Read access to UEFI variables, consumed by HII-backed tokens.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait VariableServices {
    /// Returns the full payload of the variable `name` (NUL-terminated UTF-16) owned by `guid`.
    fn get_variable(&self, name: &[u16], guid: &efi::Guid) -> core::result::Result<Vec<u8>, efi::Status>;
}

/// Read access to the Vital Product Data region.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait VpdRegion {
    /// Fills `buffer` from `offset` bytes past the start of the region.
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()>;
}

/// A VPD region mapped at a fixed physical address.
#[derive(Debug, Clone, Copy)]
pub struct FlashVpd {
    base_address: u64,
}

impl FlashVpd {
    /// Creates a region rooted at `base_address`.
    ///
    /// ## Safety
    ///
    /// `base_address` must be readable memory large enough for every VPD offset in the database, and must stay
    /// mapped for the lifetime of the region.
    pub const unsafe fn new(base_address: u64) -> Self {
        Self { base_address }
    }

    pub fn base_address(&self) -> u64 {
        self.base_address
    }
}

impl VpdRegion for FlashVpd {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        let address = self.base_address.checked_add(offset).ok_or(PcdError::CorruptDatabase)?;
        if self.base_address == 0 {
            log::error!(target: "pcd", "VPD read at offset {:#X} with no VPD base address", offset);
            return Err(PcdError::CorruptDatabase);
        }
        // SAFETY: the constructor contract guarantees the region is mapped and readable.
        unsafe { core::ptr::copy_nonoverlapping(address as usize as *const u8, buffer.as_mut_ptr(), buffer.len()) };
        Ok(())
    }
}

/// The external collaborators needed to read tokens that live outside the database image.
#[derive(Clone, Copy)]
pub struct StorageContext<'a> {
    pub variables: &'a dyn VariableServices,
    pub vpd: &'a dyn VpdRegion,
}

impl<'a> StorageContext<'a> {
    pub fn new(variables: &'a dyn VariableServices, vpd: &'a dyn VpdRegion) -> Self {
        Self { variables, vpd }
    }
}

/// The resolved storage of a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageLocation {
    /// `size` bytes at `offset` in the database image.
    Data { offset: usize, size: usize },
    /// String table slot `index`, which starts at `offset` in the database image.
    String { index: u16, offset: usize, size: usize },
    /// `size` bytes at `offset` in the VPD region.
    Vpd { offset: u32, size: usize },
    /// `size` bytes at `offset` inside the variable `name` of vendor `guid`.
    Hii { guid: efi::Guid, name: Vec<u16>, offset: usize, size: usize },
}

impl StorageLocation {
    /// Builds the location of an already SKU-resolved token.
    pub fn locate(image: &DatabaseImage, token: LocalToken, size: usize) -> Result<Self> {
        debug_assert!(!token.sku_enabled);
        let location = match token.kind {
            StorageKind::Data => StorageLocation::Data { offset: token.offset, size },
            StorageKind::String => {
                let index = image.string_index(token.offset)?;
                StorageLocation::String { index, offset: image.string_offset(index, size)?, size }
            }
            StorageKind::Vpd => StorageLocation::Vpd { offset: image.vpd_head(token.offset)?.offset, size },
            StorageKind::Hii => {
                let head = image.variable_head(token.offset)?;
                StorageLocation::Hii {
                    guid: image.guid(head.guid_table_index as usize)?,
                    name: image.string_at(head.string_index)?,
                    offset: head.offset as usize,
                    size,
                }
            }
        };
        log::trace!(target: "pcd", "Token at {:#X} located in {:?}", token.offset, location);
        Ok(location)
    }

    pub fn kind(&self) -> StorageKind {
        match self {
            StorageLocation::Data { .. } => StorageKind::Data,
            StorageLocation::String { .. } => StorageKind::String,
            StorageLocation::Vpd { .. } => StorageKind::Vpd,
            StorageLocation::Hii { .. } => StorageKind::Hii,
        }
    }

    pub fn size(&self) -> usize {
        match self {
            StorageLocation::Data { size, .. }
            | StorageLocation::String { size, .. }
            | StorageLocation::Vpd { size, .. }
            | StorageLocation::Hii { size, .. } => *size,
        }
    }

    /// Reads the full declared size of the value.
    pub fn read(&self, image: &DatabaseImage, context: &StorageContext) -> Result<Vec<u8>> {
        match self {
            StorageLocation::Data { offset, size } | StorageLocation::String { offset, size, .. } => {
                Ok(image.read(*offset, *size)?.to_vec())
            }
            StorageLocation::Vpd { offset, size } => {
                let mut value = alloc::vec![0u8; *size];
                context.vpd.read(*offset as u64, &mut value)?;
                Ok(value)
            }
            StorageLocation::Hii { guid, name, offset, size } => {
                let variable = context.variables.get_variable(name, guid).map_err(|status| {
                    log::warn!(target: "pcd", "GetVariable for HII token failed: {:?}", status);
                    PcdError::Variable(status)
                })?;
                let value = offset.checked_add(*size).and_then(|end| variable.get(*offset..end)).ok_or_else(|| {
                    log::error!(
                        target: "pcd",
                        "HII variable of {:#X} bytes cannot hold {:#X} bytes at offset {:#X}",
                        variable.len(),
                        size,
                        offset
                    );
                    PcdError::VariableTooSmall
                })?;
                Ok(value.to_vec())
            }
        }
    }

    /// Writes `data` at the start of the value of `token`. The caller has checked `data` against the declared size.
    pub fn write(&self, token: TokenNumber, image: &mut DatabaseImage, data: &[u8]) -> Result<()> {
        match self {
            StorageLocation::Data { offset, .. } | StorageLocation::String { offset, .. } => image.write(*offset, data),
            StorageLocation::Vpd { .. } | StorageLocation::Hii { .. } => {
                log::error!(target: "pcd", "Write to token {} in read-only {:?} storage", token, self.kind());
                Err(PcdError::ReadOnlyStorage(token))
            }
        }
    }
}
