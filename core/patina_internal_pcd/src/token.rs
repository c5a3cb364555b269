//! Token numbers and LocalTokenNumber decoding.
//!
//! Every entry of the local token table is a packed 32-bit value: the low 28 bits are an offset into the database
//! image and the high nibble carries the storage kind and the SKU-enabled flag. [`LocalToken::decode`] unpacks it
//! into a typed value so the rest of the engine never handles the raw bits.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use crate::error::{PcdError, Result};

/// An opaque token number, unique within a token space.
pub type TokenNumber = usize;

/// A platform SKU identifier.
pub type SkuId = u8;

/// The reserved token number. Every database image reserves index 0.
pub const PCD_INVALID_TOKEN_NUMBER: TokenNumber = 0;

/// The default SKU.
pub const DEFAULT_SKU_ID: SkuId = 0;

pub const PCD_TYPE_SHIFT: u32 = 28;
pub const PCD_TYPE_DATA: u32 = 0x0 << PCD_TYPE_SHIFT;
pub const PCD_TYPE_STRING: u32 = 0x1 << PCD_TYPE_SHIFT;
pub const PCD_TYPE_SKU_ENABLED: u32 = 0x2 << PCD_TYPE_SHIFT;
pub const PCD_TYPE_VPD: u32 = 0x4 << PCD_TYPE_SHIFT;
pub const PCD_TYPE_HII: u32 = 0x8 << PCD_TYPE_SHIFT;
pub const PCD_TYPE_ALL_SET: u32 = PCD_TYPE_STRING | PCD_TYPE_SKU_ENABLED | PCD_TYPE_VPD | PCD_TYPE_HII;
pub const PCD_DATABASE_OFFSET_MASK: u32 = !PCD_TYPE_ALL_SET;

/// Where the value of a token is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    /// Inline in the database image.
    Data,
    /// Indirect through the string table.
    String,
    /// In the read-only VPD flash region.
    Vpd,
    /// In a UEFI variable.
    Hii,
}

impl StorageKind {
    /// Returns true for kinds that cannot be written through the database.
    pub fn is_read_only(&self) -> bool {
        matches!(self, StorageKind::Vpd | StorageKind::Hii)
    }

    /// The kind bits of a LocalTokenNumber.
    pub fn bits(&self) -> u32 {
        match self {
            StorageKind::Data => PCD_TYPE_DATA,
            StorageKind::String => PCD_TYPE_STRING,
            StorageKind::Vpd => PCD_TYPE_VPD,
            StorageKind::Hii => PCD_TYPE_HII,
        }
    }
}

/// A decoded LocalTokenNumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalToken {
    /// The storage kind.
    pub kind: StorageKind,
    /// True if `offset` points at a SKU head rather than the value itself.
    pub sku_enabled: bool,
    /// Offset into the database image.
    pub offset: usize,
}

impl LocalToken {
    /// Unpacks a raw LocalTokenNumber.
    ///
    /// More than one kind bit set is rejected as a corrupt database.
    pub fn decode(raw: u32) -> Result<Self> {
        let kind = match raw & (PCD_TYPE_STRING | PCD_TYPE_VPD | PCD_TYPE_HII) {
            PCD_TYPE_DATA => StorageKind::Data,
            PCD_TYPE_STRING => StorageKind::String,
            PCD_TYPE_VPD => StorageKind::Vpd,
            PCD_TYPE_HII => StorageKind::Hii,
            bits => {
                log::error!(target: "pcd", "LocalTokenNumber {:#010X} has conflicting kind bits {:#010X}", raw, bits);
                return Err(PcdError::CorruptDatabase);
            }
        };

        Ok(Self {
            kind,
            sku_enabled: raw & PCD_TYPE_SKU_ENABLED == PCD_TYPE_SKU_ENABLED,
            offset: (raw & PCD_DATABASE_OFFSET_MASK) as usize,
        })
    }

    /// Packs the token back into its raw form.
    pub fn encode(&self) -> u32 {
        let sku = if self.sku_enabled { PCD_TYPE_SKU_ENABLED } else { 0 };
        (self.offset as u32 & PCD_DATABASE_OFFSET_MASK) | self.kind.bits() | sku
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_each_kind() {
        assert_eq!(
            LocalToken::decode(0x0000_0040).unwrap(),
            LocalToken { kind: StorageKind::Data, sku_enabled: false, offset: 0x40 }
        );
        assert_eq!(LocalToken::decode(PCD_TYPE_STRING | 0x10).unwrap().kind, StorageKind::String);
        assert_eq!(LocalToken::decode(PCD_TYPE_VPD | 0x10).unwrap().kind, StorageKind::Vpd);
        assert_eq!(LocalToken::decode(PCD_TYPE_HII | 0x10).unwrap().kind, StorageKind::Hii);
    }

    #[test]
    fn test_sku_flag_is_orthogonal_to_kind() {
        let token = LocalToken::decode(PCD_TYPE_HII | PCD_TYPE_SKU_ENABLED | 0x1234).unwrap();
        assert_eq!(token.kind, StorageKind::Hii);
        assert!(token.sku_enabled);
        assert_eq!(token.offset, 0x1234);
    }

    #[test]
    fn test_conflicting_kind_bits_are_rejected() {
        assert_eq!(LocalToken::decode(PCD_TYPE_VPD | PCD_TYPE_HII), Err(PcdError::CorruptDatabase));
        assert_eq!(LocalToken::decode(PCD_TYPE_STRING | PCD_TYPE_VPD), Err(PcdError::CorruptDatabase));
    }

    #[test]
    fn test_encode_inverts_decode() {
        for raw in [0x0000_0010, PCD_TYPE_STRING | 0x20, PCD_TYPE_SKU_ENABLED | PCD_TYPE_VPD | 0x0FFF_FFFF] {
            assert_eq!(LocalToken::decode(raw).unwrap().encode(), raw);
        }
    }
}
