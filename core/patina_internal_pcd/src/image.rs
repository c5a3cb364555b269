//! PCD Database Image
//!
//! The database image is the contract between the build-time database generator and the runtime services. It is a
//! single little-endian blob made of a fixed header followed by a set of tables and a data area:
//!
//! ```text
//! +---------------------------+  0
//! | DatabaseHeader (56 bytes) |
//! +---------------------------+  local_token_table_offset
//! | u32 x local_token_count   |  packed LocalTokenNumbers
//! +---------------------------+  size_table_offset
//! | u16 x local_token_count   |  declared (maximum) sizes
//! +---------------------------+  guid_table_offset
//! | Guid x guid_count         |
//! +---------------------------+  string_table_offset
//! | u16 x string_table_size/2 |  UTF-16 string table
//! +---------------------------+  ex_map_offset
//! | ExMapEntry x ex_map_count |
//! +---------------------------+
//! | data area                 |  values, SKU heads, SKU id tables, VPD heads, variable heads
//! +---------------------------+  length
//! ```
//!
//! Index 0 of the local token table is reserved. Tokens `[1, nex_token_count)` form the default token space and
//! tokens `[nex_token_count, local_token_count)` are only reachable through the Ex map.
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
use scroll::{Pread, Pwrite, SizeWith, LE};

use crate::error::{PcdError, Result};
use crate::token::{LocalToken, SkuId, TokenNumber};

pub mod builder;

/// "PCDB"
pub const PCD_DATABASE_SIGNATURE: u32 = u32::from_le_bytes(*b"PCDB");
/// The only image version understood by this crate.
pub const PCD_DATABASE_VERSION: u16 = 1;
/// Size of [`DatabaseHeader`] in the image.
pub const HEADER_SIZE: usize = 56;

// Offset of `system_sku_id` inside the header.
const SYSTEM_SKU_ID_OFFSET: usize = 12;
const GUID_SIZE: usize = 16;

/// Size of [`SkuHead`] in the image.
pub const SKU_HEAD_SIZE: usize = 8;
/// Size of [`VpdHead`] in the image.
pub const VPD_HEAD_SIZE: usize = 4;
/// Size of [`VariableHead`] in the image.
pub const VARIABLE_HEAD_SIZE: usize = 8;
/// Size of [`ExMapEntry`] in the image.
pub const EX_MAP_ENTRY_SIZE: usize = 8;
/// Size of the string table index cell held by a STRING token.
pub const STRING_INDEX_SIZE: usize = 2;

/// The boot phase an image was generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Phase {
    Pei = 0,
    Dxe = 1,
}

impl TryFrom<u16> for Phase {
    type Error = PcdError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            0 => Ok(Phase::Pei),
            1 => Ok(Phase::Dxe),
            _ => Err(PcdError::CorruptDatabase),
        }
    }
}

/// Database image header.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct DatabaseHeader {
    pub signature: u32,
    pub version: u16,
    pub phase: u16,
    pub length: u32,
    pub system_sku_id: u8,
    pub reserved: [u8; 3],
    pub local_token_count: u32,
    pub nex_token_count: u32,
    pub local_token_table_offset: u32,
    pub size_table_offset: u32,
    pub guid_table_offset: u32,
    pub guid_count: u32,
    pub string_table_offset: u32,
    pub string_table_size: u32,
    pub ex_map_offset: u32,
    pub ex_map_count: u32,
}

/// Found at the offset of a SKU-enabled token.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct SkuHead {
    /// Start of the per-SKU value array.
    pub sku_data_start_offset: u32,
    /// Start of the SKU id table (`count: u8` followed by `count` ids).
    pub sku_id_table_offset: u32,
}

/// Found at the offset of a VPD token.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct VpdHead {
    /// Offset of the value from the VPD base address.
    pub offset: u32,
}

/// Found at the offset of a HII token.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct VariableHead {
    /// Index of the variable GUID in the GUID table.
    pub guid_table_index: u16,
    /// UTF-16 unit index of the NUL-terminated variable name in the string table.
    pub string_index: u16,
    /// Byte offset of the value inside the variable payload.
    pub offset: u16,
    pub reserved: u16,
}

/// One entry of the Ex map.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct ExMapEntry {
    /// The token number inside the GUID namespace.
    pub ex_token_number: u32,
    /// The local token number it maps to.
    pub token_number: u16,
    /// Index of the namespace GUID in the GUID table.
    pub guid_index: u16,
}

/// A validated, owned database image.
///
/// All accessors are bounds checked; an out of range table access is reported as [`PcdError::CorruptDatabase`]
/// rather than a panic.
#[derive(Debug, Clone)]
pub struct DatabaseImage {
    header: DatabaseHeader,
    bytes: Vec<u8>,
}

impl DatabaseImage {
    /// Copies and validates an image produced by the database generator.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let header: DatabaseHeader = bytes.pread_with(0, LE)?;

        if header.signature != PCD_DATABASE_SIGNATURE {
            log::error!(target: "pcd", "Bad PCD database signature: {:#010X}", header.signature);
            return Err(PcdError::CorruptDatabase);
        }
        if header.version != PCD_DATABASE_VERSION {
            log::error!(target: "pcd", "Unsupported PCD database version: {}", header.version);
            return Err(PcdError::CorruptDatabase);
        }
        Phase::try_from(header.phase)?;
        if header.length as usize != bytes.len() {
            log::error!(
                target: "pcd",
                "PCD database length {:#X} does not match image size {:#X}",
                header.length,
                bytes.len()
            );
            return Err(PcdError::CorruptDatabase);
        }
        if header.local_token_count == 0
            || header.nex_token_count == 0
            || header.nex_token_count > header.local_token_count
        {
            log::error!(
                target: "pcd",
                "Invalid PCD token counts: local={} nex={}",
                header.local_token_count,
                header.nex_token_count
            );
            return Err(PcdError::CorruptDatabase);
        }

        let image = Self { header, bytes: bytes.to_vec() };
        image.check_table(header.local_token_table_offset, header.local_token_count as usize * 4)?;
        image.check_table(header.size_table_offset, header.local_token_count as usize * 2)?;
        image.check_table(header.guid_table_offset, header.guid_count as usize * GUID_SIZE)?;
        image.check_table(header.string_table_offset, header.string_table_size as usize)?;
        image.check_table(header.ex_map_offset, header.ex_map_count as usize * EX_MAP_ENTRY_SIZE)?;

        for token in 1..image.local_token_count() {
            let local = LocalToken::decode(image.local_token(token)?)?;
            image.check_table(local.offset as u32, 1)?;
        }
        for index in 0..header.ex_map_count as usize {
            let entry = image.ex_map_entry(index)?;
            if entry.guid_index as u32 >= header.guid_count
                || entry.token_number == 0
                || entry.token_number as u32 >= header.local_token_count
            {
                log::error!(target: "pcd", "Invalid Ex map entry {}: {:?}", index, entry);
                return Err(PcdError::CorruptDatabase);
            }
        }

        Ok(image)
    }

    fn check_table(&self, offset: u32, len: usize) -> Result<()> {
        let end = (offset as usize).checked_add(len).ok_or(PcdError::CorruptDatabase)?;
        if (offset as usize) < HEADER_SIZE || end > self.bytes.len() {
            log::error!(target: "pcd", "PCD database table {:#X}..{:#X} is out of bounds", offset, end);
            return Err(PcdError::CorruptDatabase);
        }
        Ok(())
    }

    /// The image header, including the current system SKU.
    pub fn header(&self) -> &DatabaseHeader {
        &self.header
    }

    /// The raw image bytes, including every value written so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn phase(&self) -> Phase {
        // Validated in parse.
        Phase::try_from(self.header.phase).unwrap_or(Phase::Pei)
    }

    pub fn local_token_count(&self) -> usize {
        self.header.local_token_count as usize
    }

    pub fn nex_token_count(&self) -> usize {
        self.header.nex_token_count as usize
    }

    pub fn system_sku_id(&self) -> SkuId {
        self.header.system_sku_id
    }

    /// Updates the system SKU both in the cached header and in the image bytes so that a published image carries it.
    pub fn set_system_sku_id(&mut self, sku_id: SkuId) {
        self.header.system_sku_id = sku_id;
        self.bytes[SYSTEM_SKU_ID_OFFSET] = sku_id;
    }

    /// Returns the raw LocalTokenNumber of `token`.
    pub fn local_token(&self, token: TokenNumber) -> Result<u32> {
        if token >= self.local_token_count() {
            return Err(PcdError::TokenNotFound(token));
        }
        Ok(self.bytes.pread_with(self.header.local_token_table_offset as usize + token * 4, LE)?)
    }

    /// Returns the declared size of `token`.
    pub fn token_size(&self, token: TokenNumber) -> Result<usize> {
        if token >= self.local_token_count() {
            return Err(PcdError::TokenNotFound(token));
        }
        let size: u16 = self.bytes.pread_with(self.header.size_table_offset as usize + token * 2, LE)?;
        Ok(size as usize)
    }

    pub fn guid_count(&self) -> usize {
        self.header.guid_count as usize
    }

    pub fn guid(&self, index: usize) -> Result<efi::Guid> {
        if index >= self.guid_count() {
            return Err(PcdError::CorruptDatabase);
        }
        let start = self.header.guid_table_offset as usize + index * GUID_SIZE;
        let mut bytes = [0u8; GUID_SIZE];
        bytes.copy_from_slice(self.read(start, GUID_SIZE)?);
        Ok(efi::Guid::from_bytes(&bytes))
    }

    /// Scans the GUID table for `guid`.
    pub fn find_guid(&self, guid: &efi::Guid) -> Option<usize> {
        (0..self.guid_count()).find(|&index| self.guid(index).is_ok_and(|candidate| candidate == *guid))
    }

    pub fn ex_map_count(&self) -> usize {
        self.header.ex_map_count as usize
    }

    pub fn ex_map_entry(&self, index: usize) -> Result<ExMapEntry> {
        if index >= self.ex_map_count() {
            return Err(PcdError::CorruptDatabase);
        }
        Ok(self.bytes.pread_with(self.header.ex_map_offset as usize + index * EX_MAP_ENTRY_SIZE, LE)?)
    }

    /// Iterates the Ex map in table order.
    pub fn ex_map(&self) -> impl Iterator<Item = ExMapEntry> + '_ {
        (0..self.ex_map_count()).filter_map(|index| self.ex_map_entry(index).ok())
    }

    pub fn sku_head(&self, offset: usize) -> Result<SkuHead> {
        Ok(self.bytes.pread_with(offset, LE)?)
    }

    /// Reads the SKU id table at `offset`.
    pub fn sku_ids(&self, offset: usize) -> Result<&[SkuId]> {
        let count: u8 = self.bytes.pread_with(offset, LE)?;
        self.read(offset + 1, count as usize)
    }

    pub fn vpd_head(&self, offset: usize) -> Result<VpdHead> {
        Ok(self.bytes.pread_with(offset, LE)?)
    }

    pub fn variable_head(&self, offset: usize) -> Result<VariableHead> {
        Ok(self.bytes.pread_with(offset, LE)?)
    }

    /// Reads the string table index cell at `offset`.
    pub fn string_index(&self, offset: usize) -> Result<u16> {
        Ok(self.bytes.pread_with(offset, LE)?)
    }

    /// Returns the byte offset of string table unit `index`, checking that `len` bytes fit in the table.
    pub fn string_offset(&self, index: u16, len: usize) -> Result<usize> {
        let start = index as usize * 2;
        let end = start.checked_add(len).ok_or(PcdError::CorruptDatabase)?;
        if end > self.header.string_table_size as usize {
            log::error!(
                target: "pcd",
                "String table access {:#X}..{:#X} exceeds table size {:#X}",
                start,
                end,
                self.header.string_table_size
            );
            return Err(PcdError::CorruptDatabase);
        }
        Ok(self.header.string_table_offset as usize + start)
    }

    /// Reads the NUL-terminated UTF-16 string starting at unit `index`, including the terminator.
    pub fn string_at(&self, index: u16) -> Result<Vec<u16>> {
        let mut name = Vec::new();
        let mut offset = self.string_offset(index, 0)?;
        let end = self.header.string_table_offset as usize + self.header.string_table_size as usize;
        while offset + 2 <= end {
            let unit: u16 = self.bytes.pread_with(offset, LE)?;
            name.push(unit);
            if unit == 0 {
                return Ok(name);
            }
            offset += 2;
        }
        log::error!(target: "pcd", "String at index {} is not NUL-terminated", index);
        Err(PcdError::CorruptDatabase)
    }

    /// Reads `len` bytes at `offset`.
    pub fn read(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = offset.checked_add(len).ok_or(PcdError::CorruptDatabase)?;
        self.bytes.get(offset..end).ok_or_else(|| {
            log::error!(target: "pcd", "PCD database read {:#X}..{:#X} is out of bounds", offset, end);
            PcdError::CorruptDatabase
        })
    }

    /// Writes `data` at `offset`.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let end = offset.checked_add(data.len()).ok_or(PcdError::CorruptDatabase)?;
        let target = self.bytes.get_mut(offset..end).ok_or_else(|| {
            log::error!(target: "pcd", "PCD database write {:#X}..{:#X} is out of bounds", offset, end);
            PcdError::CorruptDatabase
        })?;
        target.copy_from_slice(data);
        Ok(())
    }
}
