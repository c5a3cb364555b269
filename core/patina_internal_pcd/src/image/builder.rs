//! Database Image Builder
//!
//! Produces database images in the layout described in [`crate::image`]. This is the runtime half of the build-time
//! generator: platform tooling and tests use it to describe tokens declaratively and get back the exact bytes the
//! services consume.
//!
//! Token numbers are handed out in insertion order starting at 1. Tokens added through [`ImageBuilder::add`] form the
//! default token space and must all be added before the first [`ImageBuilder::add_ex`] token.
//!
//! ## Example
//!
//! ```
//! use patina_internal_pcd::image::{builder::{ImageBuilder, TokenValue}, DatabaseImage, Phase};
//!
//! let mut builder = ImageBuilder::new(Phase::Pei);
//! let token = builder.add(TokenValue::data(&0x5Au8.to_le_bytes()));
//! let image = DatabaseImage::parse(&builder.build().unwrap()).unwrap();
//! assert_eq!(image.token_size(token).unwrap(), 1);
//! ```
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
extern crate alloc;

use alloc::{vec, vec::Vec};
use r_efi::efi;
use scroll::{ctx::TryIntoCtx, Endian, Pwrite, LE};

use super::{
    DatabaseHeader, ExMapEntry, Phase, SkuHead, VariableHead, VpdHead, EX_MAP_ENTRY_SIZE, HEADER_SIZE,
    PCD_DATABASE_SIGNATURE, PCD_DATABASE_VERSION, SKU_HEAD_SIZE, STRING_INDEX_SIZE, VARIABLE_HEAD_SIZE,
    VPD_HEAD_SIZE,
};
use crate::error::{PcdError, Result};
use crate::sku;
use crate::token::{LocalToken, SkuId, StorageKind, TokenNumber, DEFAULT_SKU_ID, PCD_DATABASE_OFFSET_MASK};

/// The declared storage of a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenValue {
    /// Inline value. `bytes` is zero padded up to `size`.
    Data { size: usize, bytes: Vec<u8> },
    /// String table slot of `size` bytes holding `initial`.
    String { size: usize, initial: Vec<u16> },
    /// Value at `offset` in the VPD region.
    Vpd { size: usize, offset: u32 },
    /// Value at `offset` inside the variable `name` of vendor `guid`.
    Hii { size: usize, guid: efi::Guid, name: Vec<u16>, offset: u16 },
    /// Per-SKU variants. The first variant is the fallback used when the system SKU has no entry.
    Sku(Vec<(SkuId, TokenValue)>),
}

impl TokenValue {
    /// A fixed-width value whose declared size is `bytes.len()`.
    pub fn data(bytes: &[u8]) -> Self {
        TokenValue::Data { size: bytes.len(), bytes: bytes.to_vec() }
    }

    /// A pointer value with a maximum size of `size` bytes.
    pub fn buffer(size: usize, initial: &[u8]) -> Self {
        TokenValue::Data { size, bytes: initial.to_vec() }
    }

    /// A UTF-16 string value with a maximum size of `size` bytes.
    pub fn string(size: usize, initial: &str) -> Self {
        TokenValue::String { size, initial: initial.encode_utf16().collect() }
    }

    pub fn vpd(size: usize, offset: u32) -> Self {
        TokenValue::Vpd { size, offset }
    }

    pub fn hii(size: usize, guid: efi::Guid, name: &str, offset: u16) -> Self {
        TokenValue::Hii { size, guid, name: name.encode_utf16().collect(), offset }
    }

    pub fn sku(variants: Vec<(SkuId, TokenValue)>) -> Self {
        TokenValue::Sku(variants)
    }

    fn kind(&self) -> Option<StorageKind> {
        match self {
            TokenValue::Data { .. } => Some(StorageKind::Data),
            TokenValue::String { .. } => Some(StorageKind::String),
            TokenValue::Vpd { .. } => Some(StorageKind::Vpd),
            TokenValue::Hii { .. } => Some(StorageKind::Hii),
            TokenValue::Sku(variants) => variants.first().and_then(|(_, value)| value.kind()),
        }
    }

    fn size(&self) -> Option<usize> {
        match self {
            TokenValue::Data { size, .. }
            | TokenValue::String { size, .. }
            | TokenValue::Vpd { size, .. }
            | TokenValue::Hii { size, .. } => Some(*size),
            TokenValue::Sku(variants) => variants.first().and_then(|(_, value)| value.size()),
        }
    }
}

// A token after its strings and GUIDs have been interned.
#[derive(Debug, Clone)]
enum Element {
    Data(Vec<u8>),
    String(u16),
    Vpd(u32),
    Hii { guid_index: u16, string_index: u16, offset: u16 },
}

#[derive(Debug, Clone)]
struct Token {
    kind: StorageKind,
    size: usize,
    elements: Vec<(SkuId, Element)>,
    sku_enabled: bool,
    ex: Option<(u16, u32)>,
}

/// Incrementally describes a database image.
#[derive(Debug)]
pub struct ImageBuilder {
    phase: Phase,
    system_sku_id: SkuId,
    tokens: Vec<Token>,
    guids: Vec<efi::Guid>,
    strings: Vec<u16>,
    invalid: bool,
}

impl ImageBuilder {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            system_sku_id: DEFAULT_SKU_ID,
            tokens: Vec::new(),
            guids: Vec::new(),
            strings: Vec::new(),
            invalid: false,
        }
    }

    /// Sets the system SKU recorded in the header.
    pub fn system_sku(&mut self, sku_id: SkuId) -> &mut Self {
        self.system_sku_id = sku_id;
        self
    }

    /// Adds a token to the default token space and returns its token number.
    pub fn add(&mut self, value: TokenValue) -> TokenNumber {
        if self.tokens.iter().any(|token| token.ex.is_some()) {
            log::error!(target: "pcd", "Default space token added after an Ex token");
            self.invalid = true;
        }
        self.push(value, None)
    }

    /// Adds an Ex-only token reachable as `(guid, ex_token_number)` and returns its local token number.
    pub fn add_ex(&mut self, guid: efi::Guid, ex_token_number: u32, value: TokenValue) -> TokenNumber {
        let guid_index = self.intern_guid(guid);
        self.push(value, Some((guid_index, ex_token_number)))
    }

    fn push(&mut self, value: TokenValue, ex: Option<(u16, u32)>) -> TokenNumber {
        let (Some(kind), Some(size)) = (value.kind(), value.size()) else {
            log::error!(target: "pcd", "Empty SKU token");
            self.invalid = true;
            return self.tokens.len();
        };

        let (sku_enabled, variants) = match value {
            TokenValue::Sku(variants) => (true, variants),
            value => (false, vec![(DEFAULT_SKU_ID, value)]),
        };

        let mut elements = Vec::with_capacity(variants.len());
        for (sku_id, variant) in variants {
            if variant.kind() != Some(kind) || variant.size() != Some(size) {
                log::error!(target: "pcd", "SKU variants of a token must share kind and size");
                self.invalid = true;
            }
            match self.intern(variant) {
                Some(element) => elements.push((sku_id, element)),
                None => self.invalid = true,
            }
        }

        self.tokens.push(Token { kind, size, elements, sku_enabled, ex });
        self.tokens.len()
    }

    fn intern(&mut self, value: TokenValue) -> Option<Element> {
        match value {
            TokenValue::Data { size, mut bytes } => {
                if bytes.len() > size {
                    return None;
                }
                bytes.resize(size, 0);
                Some(Element::Data(bytes))
            }
            TokenValue::String { size, initial } => {
                if initial.len() * 2 > size {
                    return None;
                }
                let index = self.strings.len();
                self.strings.extend_from_slice(&initial);
                self.strings.resize(index + size.div_ceil(2), 0);
                Some(Element::String(u16::try_from(index).ok()?))
            }
            TokenValue::Vpd { offset, .. } => Some(Element::Vpd(offset)),
            TokenValue::Hii { guid, name, offset, .. } => {
                let guid_index = self.intern_guid(guid);
                let string_index = u16::try_from(self.strings.len()).ok()?;
                self.strings.extend_from_slice(&name);
                self.strings.push(0);
                Some(Element::Hii { guid_index, string_index, offset })
            }
            TokenValue::Sku(_) => None,
        }
    }

    fn intern_guid(&mut self, guid: efi::Guid) -> u16 {
        let index = match self.guids.iter().position(|candidate| *candidate == guid) {
            Some(index) => index,
            None => {
                self.guids.push(guid);
                self.guids.len() - 1
            }
        };
        index as u16
    }

    /// Lays out and serializes the image.
    pub fn build(&self) -> Result<Vec<u8>> {
        if self.invalid {
            return Err(PcdError::CorruptDatabase);
        }

        let count = self.tokens.len() + 1;
        let nex_count = 1 + self.tokens.iter().take_while(|token| token.ex.is_none()).count();

        let local_token_table_offset = HEADER_SIZE;
        let size_table_offset = local_token_table_offset + count * 4;
        let guid_table_offset = size_table_offset + count * 2;
        let string_table_offset = guid_table_offset + self.guids.len() * 16;
        let string_table_size = self.strings.len() * 2;
        let ex_map_offset = string_table_offset + string_table_size;
        let ex_map: Vec<ExMapEntry> = self
            .tokens
            .iter()
            .enumerate()
            .filter_map(|(index, token)| {
                token.ex.map(|(guid_index, ex_token_number)| ExMapEntry {
                    ex_token_number,
                    token_number: (index + 1) as u16,
                    guid_index,
                })
            })
            .collect();
        let data_start = ex_map_offset + ex_map.len() * EX_MAP_ENTRY_SIZE;

        let mut data = Vec::new();
        let mut local_tokens = vec![0u32];
        let mut sizes = vec![0u16];
        for token in &self.tokens {
            let offset = data_start + data.len();
            if offset as u32 & !PCD_DATABASE_OFFSET_MASK != 0 {
                return Err(PcdError::CorruptDatabase);
            }
            local_tokens.push(LocalToken { kind: token.kind, sku_enabled: token.sku_enabled, offset }.encode());
            sizes.push(u16::try_from(token.size).map_err(|_| PcdError::CorruptDatabase)?);

            if token.sku_enabled {
                let elements_offset = offset + SKU_HEAD_SIZE;
                let element_size = sku::element_size(token.kind, token.size);
                let id_table_offset = elements_offset + element_size * token.elements.len();
                let head = SkuHead {
                    sku_data_start_offset: elements_offset as u32,
                    sku_id_table_offset: id_table_offset as u32,
                };
                push(&mut data, head, SKU_HEAD_SIZE)?;
                for (_, element) in &token.elements {
                    self.push_element(&mut data, element)?;
                }
                data.push(u8::try_from(token.elements.len()).map_err(|_| PcdError::CorruptDatabase)?);
                data.extend(token.elements.iter().map(|(sku_id, _)| *sku_id));
            } else if let Some((_, element)) = token.elements.first() {
                self.push_element(&mut data, element)?;
            }
        }

        let length = data_start + data.len();
        let header = DatabaseHeader {
            signature: PCD_DATABASE_SIGNATURE,
            version: PCD_DATABASE_VERSION,
            phase: self.phase as u16,
            length: length as u32,
            system_sku_id: self.system_sku_id,
            reserved: [0; 3],
            local_token_count: count as u32,
            nex_token_count: nex_count as u32,
            local_token_table_offset: local_token_table_offset as u32,
            size_table_offset: size_table_offset as u32,
            guid_table_offset: guid_table_offset as u32,
            guid_count: self.guids.len() as u32,
            string_table_offset: string_table_offset as u32,
            string_table_size: string_table_size as u32,
            ex_map_offset: ex_map_offset as u32,
            ex_map_count: ex_map.len() as u32,
        };

        let mut bytes = vec![0u8; length];
        bytes.pwrite_with(header, 0, LE)?;
        for (index, raw) in local_tokens.iter().enumerate() {
            bytes.pwrite_with(*raw, local_token_table_offset + index * 4, LE)?;
        }
        for (index, size) in sizes.iter().enumerate() {
            bytes.pwrite_with(*size, size_table_offset + index * 2, LE)?;
        }
        for (index, guid) in self.guids.iter().enumerate() {
            let start = guid_table_offset + index * 16;
            bytes[start..start + 16].copy_from_slice(guid.as_bytes());
        }
        for (index, unit) in self.strings.iter().enumerate() {
            bytes.pwrite_with(*unit, string_table_offset + index * 2, LE)?;
        }
        for (index, entry) in ex_map.iter().enumerate() {
            bytes.pwrite_with(*entry, ex_map_offset + index * EX_MAP_ENTRY_SIZE, LE)?;
        }
        bytes[data_start..].copy_from_slice(&data);

        Ok(bytes)
    }

    fn push_element(&self, data: &mut Vec<u8>, element: &Element) -> Result<()> {
        match element {
            Element::Data(bytes) => {
                data.extend_from_slice(bytes);
                Ok(())
            }
            Element::String(index) => push(data, *index, STRING_INDEX_SIZE),
            Element::Vpd(offset) => push(data, VpdHead { offset: *offset }, VPD_HEAD_SIZE),
            Element::Hii { guid_index, string_index, offset } => push(
                data,
                VariableHead {
                    guid_table_index: *guid_index,
                    string_index: *string_index,
                    offset: *offset,
                    reserved: 0,
                },
                VARIABLE_HEAD_SIZE,
            ),
        }
    }
}

fn push<T>(data: &mut Vec<u8>, value: T, size: usize) -> Result<()>
where
    T: TryIntoCtx<Endian, Error = scroll::Error>,
{
    let start = data.len();
    data.resize(start + size, 0);
    data.pwrite_with(value, start, LE)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::DatabaseImage;

    const VENDOR: efi::Guid =
        efi::Guid::from_fields(0x7a1c2f40, 0x0d3e, 0x4f51, 0x8b, 0x22, &[0x4c, 0x19, 0xa7, 0x53, 0x60, 0x0e]);

    #[test]
    fn test_token_numbers_start_at_one() {
        let mut builder = ImageBuilder::new(Phase::Pei);
        assert_eq!(builder.add(TokenValue::data(&[1])), 1);
        assert_eq!(builder.add(TokenValue::data(&[2])), 2);
        assert_eq!(builder.add_ex(VENDOR, 0x40, TokenValue::data(&[3])), 3);

        let image = DatabaseImage::parse(&builder.build().unwrap()).unwrap();
        assert_eq!(image.local_token(0).unwrap(), 0);
        assert_eq!(image.token_size(0).unwrap(), 0);
        assert_eq!(image.nex_token_count(), 3);
    }

    #[test]
    fn test_default_token_after_ex_token_is_rejected() {
        let mut builder = ImageBuilder::new(Phase::Pei);
        builder.add_ex(VENDOR, 0x40, TokenValue::data(&[3]));
        builder.add(TokenValue::data(&[1]));
        assert_eq!(builder.build(), Err(PcdError::CorruptDatabase));
    }

    #[test]
    fn test_oversized_initial_value_is_rejected() {
        let mut builder = ImageBuilder::new(Phase::Pei);
        builder.add(TokenValue::buffer(2, &[1, 2, 3]));
        assert_eq!(builder.build(), Err(PcdError::CorruptDatabase));

        let mut builder = ImageBuilder::new(Phase::Pei);
        builder.add(TokenValue::string(4, "abc"));
        assert_eq!(builder.build(), Err(PcdError::CorruptDatabase));
    }

    #[test]
    fn test_mismatched_sku_variants_are_rejected() {
        let mut builder = ImageBuilder::new(Phase::Pei);
        builder.add(TokenValue::sku(vec![(0, TokenValue::data(&[1])), (1, TokenValue::data(&[1, 2]))]));
        assert_eq!(builder.build(), Err(PcdError::CorruptDatabase));

        let mut builder = ImageBuilder::new(Phase::Pei);
        builder.add(TokenValue::sku(Vec::new()));
        assert_eq!(builder.build(), Err(PcdError::CorruptDatabase));
    }

    #[test]
    fn test_sku_layout() {
        let mut builder = ImageBuilder::new(Phase::Pei);
        let token = builder.add(TokenValue::sku(vec![
            (0, TokenValue::data(&[0xA0, 0xA1])),
            (3, TokenValue::data(&[0xB0, 0xB1])),
        ]));
        let image = DatabaseImage::parse(&builder.build().unwrap()).unwrap();

        let local = LocalToken::decode(image.local_token(token).unwrap()).unwrap();
        assert!(local.sku_enabled);
        let head = image.sku_head(local.offset).unwrap();
        assert_eq!(image.sku_ids(head.sku_id_table_offset as usize).unwrap(), &[0, 3]);
        assert_eq!(image.read(head.sku_data_start_offset as usize + 2, 2).unwrap(), &[0xB0, 0xB1]);
    }

    #[test]
    fn test_guids_are_shared() {
        let mut builder = ImageBuilder::new(Phase::Dxe);
        builder.add(TokenValue::hii(4, VENDOR, "A", 0));
        builder.add_ex(VENDOR, 1, TokenValue::hii(4, VENDOR, "B", 4));
        let image = DatabaseImage::parse(&builder.build().unwrap()).unwrap();
        assert_eq!(image.guid_count(), 1);
        assert_eq!(image.guid(0).unwrap(), VENDOR);
    }
}
