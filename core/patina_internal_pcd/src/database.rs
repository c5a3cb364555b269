//! PCD Database
//!
//! [`PcdDatabase`] is the context object for one phase. It owns a validated copy of the phase's database image and
//! implements token resolution, Ex resolution and the Get/Set worker over it. It holds no lock and no callbacks; the
//! phase services serialize access and run callbacks around [`PcdDatabase::validate_set`] and [`PcdDatabase::set`].
//!
//! ## Example
//!
//! ```
//! use patina_internal_pcd::{
//!     image::{builder::{ImageBuilder, TokenValue}, Phase},
//!     PcdDatabase,
//! };
//!
//! let mut builder = ImageBuilder::new(Phase::Pei);
//! let token = builder.add(TokenValue::data(&0u32.to_le_bytes()));
//! let mut database = PcdDatabase::new(&builder.build().unwrap()).unwrap();
//!
//! database.set(token, &0x1234u32.to_le_bytes(), false).unwrap();
//! ```
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
use scroll::{Pread, LE};

use crate::error::{PcdError, Result};
use crate::hob::{HobBuilder, HobList, PCD_DATABASE_HOB_GUID};
use crate::image::{DatabaseHeader, DatabaseImage, Phase};
use crate::sku;
use crate::storage::{StorageContext, StorageLocation};
use crate::token::{LocalToken, SkuId, StorageKind, TokenNumber, PCD_INVALID_TOKEN_NUMBER};

/// The database of one boot phase.
#[derive(Debug, Clone)]
pub struct PcdDatabase {
    image: DatabaseImage,
}

impl PcdDatabase {
    /// Builds the database from a generated init image.
    pub fn new(image: &[u8]) -> Result<Self> {
        let image = DatabaseImage::parse(image)?;
        log::info!(
            target: "pcd",
            "Built {:?} PCD database: {} tokens ({} default space), {} Ex mappings, SKU {}",
            image.phase(),
            image.local_token_count(),
            image.nex_token_count(),
            image.ex_map_count(),
            image.system_sku_id()
        );
        Ok(Self { image })
    }

    /// Rebuilds the database published by the previous phase.
    ///
    /// Returns [`PcdError::NotFound`] if the HOB list carries no PCD database.
    pub fn from_hob_list(hobs: &HobList) -> Result<Self> {
        let data = hobs.first_guid_hob(&PCD_DATABASE_HOB_GUID).ok_or_else(|| {
            log::warn!(target: "pcd", "No PCD database HOB in the HOB list");
            PcdError::NotFound
        })?;
        // HOB data is padded; the image length lives in its header.
        let header: DatabaseHeader = data.pread_with(0, LE)?;
        let image = data.get(..header.length as usize).ok_or(PcdError::CorruptDatabase)?;
        Self::new(image)
    }

    /// Copies the database, with all values written so far and the active SKU, into a GUID HOB.
    pub fn publish(&self, hobs: &mut HobBuilder) -> Result<()> {
        hobs.build_guid_hob(&PCD_DATABASE_HOB_GUID, self.image.as_bytes())?;
        let size = self.image.as_bytes().len();
        log::info!(target: "pcd", "Published {:?} PCD database ({:#X} bytes)", self.phase(), size);
        Ok(())
    }

    pub fn phase(&self) -> Phase {
        self.image.phase()
    }

    /// The number of local tokens, including the reserved token 0.
    pub fn token_count(&self) -> usize {
        self.image.local_token_count()
    }

    /// Tokens below this number form the default token space.
    pub fn nex_token_count(&self) -> usize {
        self.image.nex_token_count()
    }

    pub fn system_sku_id(&self) -> SkuId {
        self.image.system_sku_id()
    }

    pub fn set_system_sku_id(&mut self, sku_id: SkuId) {
        log::debug!(target: "pcd", "System SKU {} -> {}", self.image.system_sku_id(), sku_id);
        self.image.set_system_sku_id(sku_id);
    }

    /// The raw database image.
    pub fn image(&self) -> &DatabaseImage {
        &self.image
    }

    fn check_token(&self, token: TokenNumber) -> Result<()> {
        if token == PCD_INVALID_TOKEN_NUMBER || token >= self.token_count() {
            log::error!(target: "pcd", "Token {} is outside of [1, {})", token, self.token_count());
            return Err(PcdError::TokenNotFound(token));
        }
        Ok(())
    }

    /// Decodes the LocalTokenNumber of `token`.
    pub fn local_token(&self, token: TokenNumber) -> Result<LocalToken> {
        self.check_token(token)?;
        let local = LocalToken::decode(self.image.local_token(token)?)?;
        log::trace!(target: "pcd", "Token {} -> {:?}", token, local);
        Ok(local)
    }

    /// Declared (maximum) size of `token` in bytes.
    pub fn token_size(&self, token: TokenNumber) -> Result<usize> {
        self.check_token(token)?;
        self.image.token_size(token)
    }

    /// Returns true if `token` is only reachable through the Ex map.
    pub fn is_ex_token(&self, token: TokenNumber) -> bool {
        token >= self.nex_token_count()
    }

    /// Maps `(guid, ex_token_number)` to a local token number.
    pub fn resolve_ex(&self, guid: &efi::Guid, ex_token_number: TokenNumber) -> Result<TokenNumber> {
        let guid_index = self.image.find_guid(guid).ok_or(PcdError::GuidNotRegistered)?;
        self.image
            .ex_map()
            .find(|entry| entry.guid_index as usize == guid_index && entry.ex_token_number as usize == ex_token_number)
            .map(|entry| entry.token_number as TokenNumber)
            .ok_or(PcdError::ExTokenNotFound(ex_token_number))
    }

    /// The Ex token numbers of the namespace `guid`, in map order.
    pub fn ex_tokens(&self, guid: &efi::Guid) -> Vec<TokenNumber> {
        let Some(guid_index) = self.image.find_guid(guid) else {
            return Vec::new();
        };
        self.image
            .ex_map()
            .filter(|entry| entry.guid_index as usize == guid_index)
            .map(|entry| entry.ex_token_number as TokenNumber)
            .collect()
    }

    /// The distinct namespaces that own Ex tokens, in map order.
    pub fn ex_token_spaces(&self) -> Vec<efi::Guid> {
        let mut spaces: Vec<efi::Guid> = Vec::new();
        for entry in self.image.ex_map() {
            if let Ok(guid) = self.image.guid(entry.guid_index as usize) {
                if !spaces.contains(&guid) {
                    spaces.push(guid);
                }
            }
        }
        spaces
    }

    /// Resolves `token` through the SKU resolver to its storage.
    pub fn location(&self, token: TokenNumber) -> Result<StorageLocation> {
        let local = self.local_token(token)?;
        let size = self.image.token_size(token)?;
        let resolved = sku::resolve(&self.image, local, size, self.system_sku_id())?;
        StorageLocation::locate(&self.image, resolved, size)
    }

    /// Reads `token`.
    ///
    /// `expected_size` of 0 skips the width check; any other value must equal the declared size.
    pub fn get(&self, token: TokenNumber, expected_size: usize, context: &StorageContext) -> Result<Vec<u8>> {
        let size = self.token_size(token)?;
        if expected_size != 0 && expected_size != size {
            log::error!(target: "pcd", "Get of token {}: {} byte access to {} byte token", token, expected_size, size);
            return Err(PcdError::SizeMismatch { declared: size, requested: expected_size });
        }
        self.location(token)?.read(&self.image, context)
    }

    /// Checks that `size` bytes may be written to `token` without writing anything.
    ///
    /// Pointer writes may be shorter than the declared size; fixed-width writes must match it.
    pub fn validate_set(&self, token: TokenNumber, size: usize, is_ptr: bool) -> Result<()> {
        let local = self.local_token(token)?;
        let declared = self.image.token_size(token)?;
        let fits = if is_ptr { size <= declared } else { size == declared };
        if !fits {
            log::error!(target: "pcd", "Set of token {}: {} bytes into a {} byte token", token, size, declared);
            return Err(PcdError::SizeMismatch { declared, requested: size });
        }
        if local.kind.is_read_only() {
            log::error!(target: "pcd", "Set of token {} in read-only {:?} storage", token, local.kind);
            return Err(PcdError::ReadOnlyStorage(token));
        }
        Ok(())
    }

    /// Writes `data` to `token`.
    pub fn set(&mut self, token: TokenNumber, data: &[u8], is_ptr: bool) -> Result<()> {
        self.validate_set(token, data.len(), is_ptr)?;
        let location = self.location(token)?;
        location.write(token, &mut self.image, data)?;
        log::debug!(target: "pcd", "Token {} set ({} bytes)", token, data.len());
        Ok(())
    }

    /// Returns the storage kind of `token`.
    pub fn storage_kind(&self, token: TokenNumber) -> Result<StorageKind> {
        Ok(self.local_token(token)?.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::builder::{ImageBuilder, TokenValue};
    use crate::storage::{MockVariableServices, MockVpdRegion};

    const SPACE_A: efi::Guid =
        efi::Guid::from_fields(0xa1f3c2d4, 0x5e6f, 0x4071, 0x82, 0x93, &[0xa4, 0xb5, 0xc6, 0xd7, 0xe8, 0xf9]);
    const SPACE_B: efi::Guid =
        efi::Guid::from_fields(0xb2e4d3c5, 0x6f70, 0x4182, 0x93, 0xa4, &[0xb5, 0xc6, 0xd7, 0xe8, 0xf9, 0x0a]);

    struct Fixture {
        database: PcdDatabase,
        variables: MockVariableServices,
        vpd: MockVpdRegion,
    }

    impl Fixture {
        fn get(&self, token: TokenNumber, size: usize) -> Result<Vec<u8>> {
            self.database.get(token, size, &StorageContext::new(&self.variables, &self.vpd))
        }
    }

    // 1: u8, 2: u32, 3: buffer[8], 4: string[8], 5: vpd u16, 6: sku u16 {0, 5, 9}, 7: Ex (A, 3) u16,
    // 8: Ex (B, 1) u8, 9: Ex (A, 4) u8
    fn fixture() -> Fixture {
        let mut builder = ImageBuilder::new(Phase::Pei);
        builder.add(TokenValue::data(&[0x11]));
        builder.add(TokenValue::data(&0x2222_2222u32.to_le_bytes()));
        builder.add(TokenValue::buffer(8, &[1, 2, 3]));
        builder.add(TokenValue::string(8, "hi"));
        builder.add(TokenValue::vpd(2, 0x10));
        builder.add(TokenValue::sku(vec![
            (0, TokenValue::data(&0x0000u16.to_le_bytes())),
            (5, TokenValue::data(&0x0005u16.to_le_bytes())),
            (9, TokenValue::data(&0x0009u16.to_le_bytes())),
        ]));
        builder.add_ex(SPACE_A, 3, TokenValue::data(&0x7777u16.to_le_bytes()));
        builder.add_ex(SPACE_B, 1, TokenValue::data(&[0x88]));
        builder.add_ex(SPACE_A, 4, TokenValue::data(&[0x99]));

        Fixture {
            database: PcdDatabase::new(&builder.build().unwrap()).unwrap(),
            variables: MockVariableServices::new(),
            vpd: MockVpdRegion::new(),
        }
    }

    #[test]
    fn test_get_checks_width() {
        let fixture = fixture();
        assert_eq!(fixture.get(1, 1).unwrap(), vec![0x11]);
        assert_eq!(fixture.get(2, 0).unwrap(), 0x2222_2222u32.to_le_bytes().to_vec());
        assert_eq!(fixture.get(2, 2), Err(PcdError::SizeMismatch { declared: 4, requested: 2 }));
    }

    #[test]
    fn test_bounds_are_checked() {
        let mut fixture = fixture();
        let count = fixture.database.token_count();
        assert_eq!(fixture.get(count, 0), Err(PcdError::TokenNotFound(count)));
        assert_eq!(fixture.get(0, 0), Err(PcdError::TokenNotFound(0)));
        assert_eq!(fixture.database.set(count, &[0], false), Err(PcdError::TokenNotFound(count)));
    }

    #[test]
    fn test_set_fixed_width_must_match() {
        let mut fixture = fixture();
        assert_eq!(fixture.database.set(2, &[1, 2], false), Err(PcdError::SizeMismatch { declared: 4, requested: 2 }));
        fixture.database.set(2, &0xABCD_EF01u32.to_le_bytes(), false).unwrap();
        assert_eq!(fixture.get(2, 4).unwrap(), 0xABCD_EF01u32.to_le_bytes().to_vec());
    }

    #[test]
    fn test_set_ptr_may_be_shorter() {
        let mut fixture = fixture();
        fixture.database.set(3, &[9, 9], true).unwrap();
        assert_eq!(fixture.get(3, 0).unwrap(), vec![9, 9, 3, 0, 0, 0, 0, 0]);
        assert_eq!(fixture.database.set(3, &[0; 9], true), Err(PcdError::SizeMismatch { declared: 8, requested: 9 }));
    }

    #[test]
    fn test_set_string_writes_table() {
        let mut fixture = fixture();
        let value: Vec<u8> = "ok!\0".encode_utf16().flat_map(u16::to_le_bytes).collect();
        fixture.database.set(4, &value, true).unwrap();
        assert_eq!(fixture.get(4, 0).unwrap(), value);
    }

    #[test]
    fn test_set_vpd_is_rejected_before_any_write() {
        let mut fixture = fixture();
        let before = fixture.database.image().as_bytes().to_vec();
        assert_eq!(fixture.database.set(5, &[0, 0], false), Err(PcdError::ReadOnlyStorage(5)));
        assert_eq!(fixture.database.image().as_bytes(), before.as_slice());
    }

    #[test]
    fn test_sku_selection() {
        let mut fixture = fixture();
        fixture.database.set_system_sku_id(5);
        assert_eq!(fixture.get(6, 2).unwrap(), vec![5, 0]);
        fixture.database.set(6, &[0x55, 0], false).unwrap();

        fixture.database.set_system_sku_id(9);
        fixture.database.set(6, &[0x99, 0], false).unwrap();

        fixture.database.set_system_sku_id(5);
        assert_eq!(fixture.get(6, 2).unwrap(), vec![0x55, 0]);

        fixture.database.set_system_sku_id(42);
        assert_eq!(fixture.get(6, 2).unwrap(), vec![0, 0]);
    }

    #[test]
    fn test_resolve_ex() {
        let fixture = fixture();
        let database = &fixture.database;
        assert_eq!(database.resolve_ex(&SPACE_A, 3), Ok(7));
        assert_eq!(database.resolve_ex(&SPACE_B, 1), Ok(8));
        assert_eq!(database.resolve_ex(&SPACE_A, 1), Err(PcdError::ExTokenNotFound(1)));
        let unknown = efi::Guid::from_bytes(&[0xFF; 16]);
        assert_eq!(database.resolve_ex(&unknown, 3), Err(PcdError::GuidNotRegistered));
        assert!(database.is_ex_token(7));
        assert!(!database.is_ex_token(6));
    }

    #[test]
    fn test_ex_enumeration() {
        let fixture = fixture();
        assert_eq!(fixture.database.ex_tokens(&SPACE_A), vec![3, 4]);
        assert_eq!(fixture.database.ex_tokens(&SPACE_B), vec![1]);
        assert_eq!(fixture.database.ex_token_spaces(), vec![SPACE_A, SPACE_B]);
    }

    #[test]
    fn test_publish_round_trips_values_and_sku() {
        let mut fixture = fixture();
        fixture.database.set(1, &[0x42], false).unwrap();
        fixture.database.set_system_sku_id(9);

        let mut hobs = HobBuilder::new();
        fixture.database.publish(&mut hobs).unwrap();
        let bytes = hobs.finish();

        let restored = PcdDatabase::from_hob_list(&HobList::new(&bytes)).unwrap();
        assert_eq!(restored.system_sku_id(), 9);
        assert_eq!(restored.image().as_bytes(), fixture.database.image().as_bytes());
    }

    #[test]
    fn test_from_hob_list_without_database() {
        let bytes = HobBuilder::new().finish();
        assert_eq!(PcdDatabase::from_hob_list(&HobList::new(&bytes)).unwrap_err(), PcdError::NotFound);
    }
}
