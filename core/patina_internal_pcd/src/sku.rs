//! SKU Resolver
//!
//! A SKU-enabled token stores one value slot per SKU. The token's offset points at a [`SkuHead`](crate::image::SkuHead)
//! naming the per-SKU value array and the table of SKU ids that own each slot. Resolution picks the slot of the
//! active system SKU. If the system SKU has no slot the first slot is used, which is the default SKU by construction.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use crate::error::Result;
use crate::image::{DatabaseImage, STRING_INDEX_SIZE, VARIABLE_HEAD_SIZE, VPD_HEAD_SIZE};
use crate::token::{LocalToken, SkuId, StorageKind};

/// Size of one per-SKU slot for a token of `kind` whose declared size is `size`.
pub fn element_size(kind: StorageKind, size: usize) -> usize {
    match kind {
        StorageKind::Data => size,
        StorageKind::String => STRING_INDEX_SIZE,
        StorageKind::Vpd => VPD_HEAD_SIZE,
        StorageKind::Hii => VARIABLE_HEAD_SIZE,
    }
}

/// Narrows `token` to the slot of `sku_id`.
///
/// Tokens that are not SKU-enabled are returned unchanged. The returned token never has the SKU flag set and keeps
/// the storage kind of the input.
pub fn resolve(image: &DatabaseImage, token: LocalToken, size: usize, sku_id: SkuId) -> Result<LocalToken> {
    if !token.sku_enabled {
        return Ok(token);
    }

    let head = image.sku_head(token.offset)?;
    let ids = image.sku_ids(head.sku_id_table_offset as usize)?;
    let index = match ids.iter().position(|&id| id == sku_id) {
        Some(index) => index,
        None => {
            log::trace!(target: "pcd", "SKU {} not configured at {:#X}, using slot 0", sku_id, token.offset);
            0
        }
    };

    let offset = head.sku_data_start_offset as usize + index * element_size(token.kind, size);
    log::trace!(target: "pcd", "SKU {} resolved {:#X} to slot {} at {:#X}", sku_id, token.offset, index, offset);
    Ok(LocalToken { kind: token.kind, sku_enabled: false, offset })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::builder::{ImageBuilder, TokenValue};
    use crate::image::Phase;

    fn sku_image() -> DatabaseImage {
        let mut builder = ImageBuilder::new(Phase::Pei);
        builder.add(TokenValue::sku(vec![
            (0, TokenValue::data(&0x1000u16.to_le_bytes())),
            (5, TokenValue::data(&0x5000u16.to_le_bytes())),
            (9, TokenValue::data(&0x9000u16.to_le_bytes())),
        ]));
        builder.add(TokenValue::data(&[0xEE]));
        DatabaseImage::parse(&builder.build().unwrap()).unwrap()
    }

    fn value(image: &DatabaseImage, token: LocalToken) -> u16 {
        let bytes = image.read(token.offset, 2).unwrap();
        u16::from_le_bytes([bytes[0], bytes[1]])
    }

    #[test]
    fn test_resolve_selects_matching_slot() {
        let image = sku_image();
        let token = LocalToken::decode(image.local_token(1).unwrap()).unwrap();
        assert_eq!(value(&image, resolve(&image, token, 2, 0).unwrap()), 0x1000);
        assert_eq!(value(&image, resolve(&image, token, 2, 5).unwrap()), 0x5000);
        assert_eq!(value(&image, resolve(&image, token, 2, 9).unwrap()), 0x9000);
    }

    #[test]
    fn test_resolve_falls_back_to_first_slot() {
        let image = sku_image();
        let token = LocalToken::decode(image.local_token(1).unwrap()).unwrap();
        let resolved = resolve(&image, token, 2, 42).unwrap();
        assert_eq!(resolved, resolve(&image, token, 2, 0).unwrap());
        assert!(!resolved.sku_enabled);
        assert_eq!(resolved.kind, StorageKind::Data);
    }

    #[test]
    fn test_resolve_passes_through_plain_tokens() {
        let image = sku_image();
        let token = LocalToken::decode(image.local_token(2).unwrap()).unwrap();
        assert_eq!(resolve(&image, token, 1, 5).unwrap(), token);
    }

    #[test]
    fn test_element_size_by_kind() {
        assert_eq!(element_size(StorageKind::Data, 8), 8);
        assert_eq!(element_size(StorageKind::String, 64), STRING_INDEX_SIZE);
        assert_eq!(element_size(StorageKind::Vpd, 4), VPD_HEAD_SIZE);
        assert_eq!(element_size(StorageKind::Hii, 1), VARIABLE_HEAD_SIZE);
    }
}
