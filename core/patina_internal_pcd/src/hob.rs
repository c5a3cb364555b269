//! GUID HOB hand-off
//!
//! The PEI database outlives PEI by being copied into a GUID extension HOB. DXE finds it again by walking the HOB
//! list for the first HOB with [`PCD_DATABASE_HOB_GUID`].
//!
//! Only the parts of the HOB format needed for that hand-off are modeled: the generic header, GUID extension HOBs and
//! the end-of-list marker. Other HOB types are skipped by length.
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

/// Names the GUID HOB carrying the PEI database.
pub const PCD_DATABASE_HOB_GUID: efi::Guid =
    efi::Guid::from_fields(0xEA296D92, 0x0B69, 0x423C, 0x8C, 0x28, &[0x33, 0xB4, 0xE0, 0xA9, 0x12, 0x68]);

pub const HOB_TYPE_GUID_EXTENSION: u16 = 0x0004;
pub const HOB_TYPE_END_OF_HOB_LIST: u16 = 0xFFFF;

const HOB_HEADER_SIZE: usize = 8;
const GUID_HOB_HEADER_SIZE: usize = HOB_HEADER_SIZE + 16;
const HOB_ALIGNMENT: usize = 8;

/// The header common to every HOB.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct HobHeader {
    pub hob_type: u16,
    pub length: u16,
    pub reserved: u32,
}

/// Appends HOBs to a list under construction.
#[derive(Debug, Default)]
pub struct HobBuilder {
    bytes: Vec<u8>,
}

impl HobBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a GUID extension HOB holding a copy of `data`. The HOB is padded to 8-byte alignment.
    pub fn build_guid_hob(&mut self, name: &efi::Guid, data: &[u8]) -> Result<()> {
        let length = (GUID_HOB_HEADER_SIZE + data.len()).next_multiple_of(HOB_ALIGNMENT);
        let length = u16::try_from(length).map_err(|_| {
            log::error!(target: "pcd", "GUID HOB data of {:#X} bytes does not fit in a HOB", data.len());
            PcdError::OutOfResources
        })?;

        let start = self.bytes.len();
        self.bytes.resize(start + length as usize, 0);
        let header = HobHeader { hob_type: HOB_TYPE_GUID_EXTENSION, length, reserved: 0 };
        self.bytes.pwrite_with(header, start, LE)?;
        self.bytes[start + HOB_HEADER_SIZE..start + GUID_HOB_HEADER_SIZE].copy_from_slice(name.as_bytes());
        self.bytes[start + GUID_HOB_HEADER_SIZE..start + GUID_HOB_HEADER_SIZE + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Terminates the list and returns its bytes.
    pub fn finish(mut self) -> Vec<u8> {
        let start = self.bytes.len();
        self.bytes.resize(start + HOB_HEADER_SIZE, 0);
        let header = HobHeader { hob_type: HOB_TYPE_END_OF_HOB_LIST, length: HOB_HEADER_SIZE as u16, reserved: 0 };
        // The buffer was just sized for the header.
        let _ = self.bytes.pwrite_with(header, start, LE);
        self.bytes
    }
}

/// A read-only view of a HOB list.
#[derive(Debug, Clone, Copy)]
pub struct HobList<'a> {
    bytes: &'a [u8],
}

impl<'a> HobList<'a> {
    /// Wraps a HOB list held in memory. The list must end with an end-of-list HOB.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// Wraps the HOB list starting at `ptr`, measuring it up to and including the end-of-list HOB.
    ///
    /// ## Safety
    ///
    /// `ptr` must point to a well-formed HOB list that stays valid for `'a`.
    pub unsafe fn from_raw(ptr: *const u8) -> Result<Self> {
        if ptr.is_null() {
            return Err(PcdError::NotFound);
        }
        let mut length = 0usize;
        loop {
            // SAFETY: every HOB in a well-formed list starts with a complete generic header.
            let header_bytes = unsafe { core::slice::from_raw_parts(ptr.add(length), HOB_HEADER_SIZE) };
            let header: HobHeader = header_bytes.pread_with(0, LE)?;
            if header.length < HOB_HEADER_SIZE as u16 {
                log::error!(target: "pcd", "HOB at {:#X} has invalid length {:#X}", length, header.length);
                return Err(PcdError::CorruptDatabase);
            }
            length += header.length as usize;
            if header.hob_type == HOB_TYPE_END_OF_HOB_LIST {
                break;
            }
        }
        // SAFETY: the walk above stayed within the list.
        Ok(Self { bytes: unsafe { core::slice::from_raw_parts(ptr, length) } })
    }

    /// Iterates `(name, data)` of every GUID extension HOB in list order.
    pub fn guid_hobs(&self) -> GuidHobs<'a> {
        GuidHobs { bytes: self.bytes, offset: 0 }
    }

    /// Returns the data of the first GUID extension HOB named `guid`.
    pub fn first_guid_hob(&self, guid: &efi::Guid) -> Option<&'a [u8]> {
        self.guid_hobs().find(|(name, _)| name == guid).map(|(_, data)| data)
    }
}

/// Iterator over the GUID extension HOBs of a [`HobList`].
#[derive(Debug, Clone)]
pub struct GuidHobs<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for GuidHobs<'a> {
    type Item = (efi::Guid, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let header: HobHeader = self.bytes.pread_with(self.offset, LE).ok()?;
            let length = header.length as usize;
            if header.hob_type == HOB_TYPE_END_OF_HOB_LIST || length < HOB_HEADER_SIZE {
                return None;
            }
            let hob = self.bytes.get(self.offset..self.offset + length)?;
            self.offset += length;

            if header.hob_type == HOB_TYPE_GUID_EXTENSION && length >= GUID_HOB_HEADER_SIZE {
                let mut name = [0u8; 16];
                name.copy_from_slice(&hob[HOB_HEADER_SIZE..GUID_HOB_HEADER_SIZE]);
                return Some((efi::Guid::from_bytes(&name), &hob[GUID_HOB_HEADER_SIZE..]));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OTHER_GUID: efi::Guid =
        efi::Guid::from_fields(0x4b2d6f5c, 0x91a0, 0x4e0d, 0xb2, 0x37, &[0x58, 0x0a, 0x13, 0xc4, 0x7e, 0x21]);

    #[test]
    fn test_guid_hob_is_aligned_and_terminated() {
        let mut builder = HobBuilder::new();
        builder.build_guid_hob(&PCD_DATABASE_HOB_GUID, &[1, 2, 3]).unwrap();
        let bytes = builder.finish();

        assert_eq!(bytes.len(), 32 + 8);
        let header: HobHeader = bytes.pread_with(0, LE).unwrap();
        assert_eq!(header, HobHeader { hob_type: HOB_TYPE_GUID_EXTENSION, length: 32, reserved: 0 });
        let end: HobHeader = bytes.pread_with(32, LE).unwrap();
        assert_eq!(end.hob_type, HOB_TYPE_END_OF_HOB_LIST);
    }

    #[test]
    fn test_first_guid_hob_skips_other_hobs() {
        let mut builder = HobBuilder::new();
        builder.build_guid_hob(&OTHER_GUID, &[0xAA; 5]).unwrap();
        builder.build_guid_hob(&PCD_DATABASE_HOB_GUID, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        builder.build_guid_hob(&PCD_DATABASE_HOB_GUID, &[9]).unwrap();
        let bytes = builder.finish();

        let list = HobList::new(&bytes);
        assert_eq!(list.first_guid_hob(&PCD_DATABASE_HOB_GUID), Some(&[1, 2, 3, 4, 5, 6, 7, 8][..]));
        assert_eq!(list.guid_hobs().count(), 3);
    }

    #[test]
    fn test_first_guid_hob_missing() {
        let bytes = HobBuilder::new().finish();
        assert_eq!(HobList::new(&bytes).first_guid_hob(&PCD_DATABASE_HOB_GUID), None);
    }

    #[test]
    fn test_oversized_hob_is_rejected() {
        let mut builder = HobBuilder::new();
        assert_eq!(builder.build_guid_hob(&OTHER_GUID, &vec![0; 0x10000]), Err(PcdError::OutOfResources));
    }

    #[test]
    fn test_from_raw_measures_list() {
        let mut builder = HobBuilder::new();
        builder.build_guid_hob(&OTHER_GUID, &[1]).unwrap();
        let bytes = builder.finish();

        // SAFETY: bytes holds a complete list and outlives the view.
        let list = unsafe { HobList::from_raw(bytes.as_ptr()) }.unwrap();
        assert_eq!(list.first_guid_hob(&OTHER_GUID).map(<[u8]>::len), Some(8));
    }
}
