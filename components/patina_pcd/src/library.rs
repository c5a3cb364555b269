//! PcdLib wrappers
//!
//! [`PcdLib`] is the interface modules normally consume. It layers the library contract over any [`Pcd`]
//! implementation:
//!
//! - `set_sku` rejects SKU ids at or above [`PcdConfig::max_sku_id`] and returns the id that was set.
//! - `setN` returns the value written so calls can be chained into expressions.
//! - `set_ptr` takes the buffer size in/out: a size above the token maximum is clamped to that maximum and nothing is
//!   written.
//!
//! Patchable-in-module values live in the module image rather than in a database. [`PatchableInModule`] holds one
//! such value and [`patch_set_ptr`] implements the `set_ptr` contract for a patchable buffer. Fixed-at-build values
//! are plain `const` items and need no support here.
//!
//! ## Example
//!
//! ```rust,ignore
//! let pcd = PcdLib::new(&service, service.config());
//! let mut size = 16;
//! if pcd.set_ptr(PCD_PLATFORM_NAME, &mut size, name)?.is_none() {
//!     log::warn!("Platform name truncated to {} bytes", size);
//! }
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

use patina_internal_pcd::{
    CallbackHandle, PcdCallback, PcdCallbackFn, PcdError, Result, SkuId, TokenNumber, PCD_INVALID_TOKEN_NUMBER,
};
use r_efi::efi;

use crate::config::PcdConfig;
use crate::service::Pcd;
use crate::tpl_lock::TplMutex;

/// The PcdLib interface over a [`Pcd`] implementation.
pub struct PcdLib<'a> {
    pcd: &'a dyn Pcd,
    max_sku_id: SkuId,
}

impl<'a> PcdLib<'a> {
    pub fn new(pcd: &'a dyn Pcd, config: &PcdConfig) -> Self {
        Self { pcd, max_sku_id: config.max_sku_id }
    }

    /// Selects the active SKU.
    pub fn set_sku(&self, sku_id: SkuId) -> Result<SkuId> {
        if sku_id >= self.max_sku_id {
            log::error!(target: "pcd_service", "SKU {} is not below the maximum {}", sku_id, self.max_sku_id);
            return Err(PcdError::InvalidSkuId(sku_id));
        }
        self.pcd.set_sku(sku_id);
        Ok(sku_id)
    }

    pub fn get8(&self, token: TokenNumber) -> Result<u8> {
        self.pcd.get8(token)
    }

    pub fn get16(&self, token: TokenNumber) -> Result<u16> {
        self.pcd.get16(token)
    }

    pub fn get32(&self, token: TokenNumber) -> Result<u32> {
        self.pcd.get32(token)
    }

    pub fn get64(&self, token: TokenNumber) -> Result<u64> {
        self.pcd.get64(token)
    }

    pub fn get_bool(&self, token: TokenNumber) -> Result<bool> {
        self.pcd.get_bool(token)
    }

    pub fn get_ptr(&self, token: TokenNumber) -> Result<Vec<u8>> {
        self.pcd.get_ptr(token)
    }

    pub fn get_size(&self, token: TokenNumber) -> Result<usize> {
        self.pcd.get_size(token)
    }

    pub fn get8_ex(&self, guid: &efi::Guid, token: TokenNumber) -> Result<u8> {
        self.pcd.get8_ex(guid, token)
    }

    pub fn get16_ex(&self, guid: &efi::Guid, token: TokenNumber) -> Result<u16> {
        self.pcd.get16_ex(guid, token)
    }

    pub fn get32_ex(&self, guid: &efi::Guid, token: TokenNumber) -> Result<u32> {
        self.pcd.get32_ex(guid, token)
    }

    pub fn get64_ex(&self, guid: &efi::Guid, token: TokenNumber) -> Result<u64> {
        self.pcd.get64_ex(guid, token)
    }

    pub fn get_bool_ex(&self, guid: &efi::Guid, token: TokenNumber) -> Result<bool> {
        self.pcd.get_bool_ex(guid, token)
    }

    pub fn get_ptr_ex(&self, guid: &efi::Guid, token: TokenNumber) -> Result<Vec<u8>> {
        self.pcd.get_ptr_ex(guid, token)
    }

    pub fn get_size_ex(&self, guid: &efi::Guid, token: TokenNumber) -> Result<usize> {
        self.pcd.get_size_ex(guid, token)
    }

    pub fn set8(&self, token: TokenNumber, value: u8) -> Result<u8> {
        self.pcd.set8(token, value).map(|()| value)
    }

    pub fn set16(&self, token: TokenNumber, value: u16) -> Result<u16> {
        self.pcd.set16(token, value).map(|()| value)
    }

    pub fn set32(&self, token: TokenNumber, value: u32) -> Result<u32> {
        self.pcd.set32(token, value).map(|()| value)
    }

    pub fn set64(&self, token: TokenNumber, value: u64) -> Result<u64> {
        self.pcd.set64(token, value).map(|()| value)
    }

    pub fn set_bool(&self, token: TokenNumber, value: bool) -> Result<bool> {
        self.pcd.set_bool(token, value).map(|()| value)
    }

    /// Writes the first `*size` bytes of `buffer` to a pointer token.
    ///
    /// If `*size` exceeds the maximum size of the token, `*size` is set to that maximum, nothing is written and
    /// `Ok(None)` is returned. Otherwise the written `buffer` is returned.
    pub fn set_ptr<'b>(&self, token: TokenNumber, size: &mut usize, buffer: &'b [u8]) -> Result<Option<&'b [u8]>> {
        let max = self.pcd.get_size(token)?;
        Self::set_ptr_worker(max, size, buffer, |data| self.pcd.set_ptr(token, data))
    }

    pub fn set8_ex(&self, guid: &efi::Guid, token: TokenNumber, value: u8) -> Result<u8> {
        self.pcd.set8_ex(guid, token, value).map(|()| value)
    }

    pub fn set16_ex(&self, guid: &efi::Guid, token: TokenNumber, value: u16) -> Result<u16> {
        self.pcd.set16_ex(guid, token, value).map(|()| value)
    }

    pub fn set32_ex(&self, guid: &efi::Guid, token: TokenNumber, value: u32) -> Result<u32> {
        self.pcd.set32_ex(guid, token, value).map(|()| value)
    }

    pub fn set64_ex(&self, guid: &efi::Guid, token: TokenNumber, value: u64) -> Result<u64> {
        self.pcd.set64_ex(guid, token, value).map(|()| value)
    }

    pub fn set_bool_ex(&self, guid: &efi::Guid, token: TokenNumber, value: bool) -> Result<bool> {
        self.pcd.set_bool_ex(guid, token, value).map(|()| value)
    }

    /// The Ex form of [`Self::set_ptr`].
    pub fn set_ptr_ex<'b>(
        &self,
        guid: &efi::Guid,
        token: TokenNumber,
        size: &mut usize,
        buffer: &'b [u8],
    ) -> Result<Option<&'b [u8]>> {
        let max = self.pcd.get_size_ex(guid, token)?;
        Self::set_ptr_worker(max, size, buffer, |data| self.pcd.set_ptr_ex(guid, token, data))
    }

    fn set_ptr_worker<'b>(
        max: usize,
        size: &mut usize,
        buffer: &'b [u8],
        set: impl FnOnce(&[u8]) -> Result<()>,
    ) -> Result<Option<&'b [u8]>> {
        if *size > max {
            log::warn!(target: "pcd_service", "SetPtr of {} bytes clamped to {}", *size, max);
            *size = max;
            return Ok(None);
        }
        let data = buffer.get(..*size).ok_or(PcdError::SizeMismatch { declared: buffer.len(), requested: *size })?;
        set(data)?;
        Ok(Some(buffer))
    }

    pub fn callback_on_set(
        &self,
        guid: Option<efi::Guid>,
        token: TokenNumber,
        callback: PcdCallback,
    ) -> Result<CallbackHandle> {
        self.pcd.callback_on_set(guid, token, callback)
    }

    pub fn cancel_callback(&self, handle: CallbackHandle) -> Result<()> {
        self.pcd.cancel_callback(handle)
    }

    pub fn callback_on_set_fn(
        &self,
        guid: Option<efi::Guid>,
        token: TokenNumber,
        callback: PcdCallbackFn,
    ) -> Result<CallbackHandle> {
        self.pcd.callback_on_set_fn(guid, token, callback)
    }

    pub fn cancel_callback_fn(
        &self,
        guid: Option<efi::Guid>,
        token: TokenNumber,
        callback: PcdCallbackFn,
    ) -> Result<()> {
        self.pcd.cancel_callback_fn(guid, token, callback)
    }

    /// Returns the token after `token` in a token space. [`PCD_INVALID_TOKEN_NUMBER`] both starts and ends the walk.
    pub fn get_next_token(&self, guid: Option<efi::Guid>, token: TokenNumber) -> Result<TokenNumber> {
        Ok(self.pcd.get_next_token(guid, token)?.unwrap_or(PCD_INVALID_TOKEN_NUMBER))
    }

    /// Returns the Ex token space after `guid`, `None` starting and ending the walk.
    pub fn get_next_token_space(&self, guid: Option<efi::Guid>) -> Result<Option<efi::Guid>> {
        self.pcd.get_next_token_space(guid)
    }

    /// Collects every token of a token space.
    pub fn tokens(&self, guid: Option<efi::Guid>) -> Result<Vec<TokenNumber>> {
        let mut tokens = Vec::new();
        let mut token = PCD_INVALID_TOKEN_NUMBER;
        loop {
            token = self.get_next_token(guid, token)?;
            if token == PCD_INVALID_TOKEN_NUMBER {
                return Ok(tokens);
            }
            tokens.push(token);
        }
    }

    /// Collects every Ex token space.
    pub fn token_spaces(&self) -> Result<Vec<efi::Guid>> {
        let mut spaces = Vec::new();
        let mut space = None;
        while let Some(guid) = self.get_next_token_space(space)? {
            spaces.push(guid);
            space = Some(guid);
        }
        Ok(spaces)
    }
}

impl core::fmt::Debug for PcdLib<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PcdLib").field("max_sku_id", &self.max_sku_id).finish()
    }
}

/// A patchable-in-module value.
///
/// Suitable for a `static`: the value is patched in the module image after build and may be updated at runtime.
pub struct PatchableInModule<T: Copy> {
    value: TplMutex<T>,
}

impl<T: Copy> PatchableInModule<T> {
    pub const fn new(value: T, name: &'static str) -> Self {
        Self { value: TplMutex::new(efi::TPL_NOTIFY, value, name) }
    }

    pub fn get(&self) -> T {
        *self.value.lock()
    }

    /// Replaces the value and returns it.
    pub fn set(&self, value: T) -> T {
        *self.value.lock() = value;
        value
    }
}

impl<const N: usize> PatchableInModule<[u8; N]> {
    /// Copies the first `*size` bytes of `buffer` into the patchable buffer. See [`patch_set_ptr`].
    pub fn set_ptr<'b>(&self, size: &mut usize, buffer: &'b [u8]) -> Option<&'b [u8]> {
        patch_set_ptr(&mut self.value.lock()[..], size, buffer)
    }
}

impl<T: Copy + core::fmt::Debug> core::fmt::Debug for PatchableInModule<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PatchableInModule").field("value", &self.value).finish()
    }
}

/// Copies the first `*size` bytes of `buffer` into the patchable buffer `target`.
///
/// If `*size` exceeds `target.len()`, `*size` is set to `target.len()`, nothing is copied and `None` is returned.
/// `None` is also returned if `buffer` holds fewer than `*size` bytes.
pub fn patch_set_ptr<'b>(target: &mut [u8], size: &mut usize, buffer: &'b [u8]) -> Option<&'b [u8]> {
    if *size > target.len() {
        *size = target.len();
        return None;
    }
    target[..*size].copy_from_slice(buffer.get(..*size)?);
    Some(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::MockPcd;
    use crate::test_support::with_global_lock;
    use mockall::predicate::eq;

    const SPACE: efi::Guid =
        efi::Guid::from_fields(0x0f4e7b6a, 0x2c31, 0x4d58, 0x9e, 0x60, &[0x1a, 0x2b, 0x3c, 0x4d, 0x5e, 0x6f]);

    #[test]
    fn test_set_sku_checks_bound() {
        let mut pcd = MockPcd::new();
        pcd.expect_set_sku().with(eq(3)).times(1).return_const(());
        let config = PcdConfig { max_sku_id: 4, ..PcdConfig::default() };
        let lib = PcdLib::new(&pcd, &config);

        assert_eq!(lib.set_sku(3), Ok(3));
        assert_eq!(lib.set_sku(4), Err(PcdError::InvalidSkuId(4)));
    }

    #[test]
    fn test_setters_return_value() {
        let mut pcd = MockPcd::new();
        pcd.expect_set32().with(eq(2), eq(0xCAFE)).times(1).returning(|_, _| Ok(()));
        pcd.expect_set_bool_ex().with(eq(SPACE), eq(9), eq(true)).times(1).returning(|_, _, _| Ok(()));
        pcd.expect_set8().returning(|token, _| Err(PcdError::TokenNotFound(token)));
        let lib = PcdLib::new(&pcd, &PcdConfig::default());

        assert_eq!(lib.set32(2, 0xCAFE), Ok(0xCAFE));
        assert_eq!(lib.set_bool_ex(&SPACE, 9, true), Ok(true));
        assert_eq!(lib.set8(5, 1), Err(PcdError::TokenNotFound(5)));
    }

    #[test]
    fn test_set_ptr_clamps_oversized_buffer() {
        let mut pcd = MockPcd::new();
        pcd.expect_get_size().with(eq(7)).returning(|_| Ok(4));
        pcd.expect_set_ptr().never();
        let lib = PcdLib::new(&pcd, &PcdConfig::default());

        let mut size = 6;
        assert_eq!(lib.set_ptr(7, &mut size, &[1, 2, 3, 4, 5, 6]), Ok(None));
        assert_eq!(size, 4);
    }

    #[test]
    fn test_set_ptr_writes_prefix() {
        let mut pcd = MockPcd::new();
        pcd.expect_get_size().with(eq(7)).returning(|_| Ok(4));
        pcd.expect_set_ptr().withf(|token, value| *token == 7 && value == [1, 2]).times(1).returning(|_, _| Ok(()));
        let lib = PcdLib::new(&pcd, &PcdConfig::default());

        let buffer = [1, 2, 3];
        let mut size = 2;
        assert_eq!(lib.set_ptr(7, &mut size, &buffer), Ok(Some(&buffer[..])));
        assert_eq!(size, 2);
    }

    #[test]
    fn test_set_ptr_ex_uses_ex_size() {
        let mut pcd = MockPcd::new();
        pcd.expect_get_size_ex().with(eq(SPACE), eq(3)).returning(|_, _| Ok(2));
        pcd.expect_set_ptr_ex().never();
        let lib = PcdLib::new(&pcd, &PcdConfig::default());

        let mut size = 3;
        assert_eq!(lib.set_ptr_ex(&SPACE, 3, &mut size, &[0; 3]), Ok(None));
        assert_eq!(size, 2);
    }

    #[test]
    fn test_token_walks() {
        let mut pcd = MockPcd::new();
        pcd.expect_get_next_token().returning(|guid, token| match (guid, token) {
            (None, 0) => Ok(Some(1)),
            (None, 1) => Ok(Some(4)),
            (None, 4) => Ok(None),
            (Some(_), 0) => Ok(Some(0x100)),
            (Some(_), 0x100) => Ok(None),
            _ => Err(PcdError::NotFound),
        });
        pcd.expect_get_next_token_space().returning(|guid| Ok(if guid.is_none() { Some(SPACE) } else { None }));
        let lib = PcdLib::new(&pcd, &PcdConfig::default());

        assert_eq!(lib.tokens(None), Ok(vec![1, 4]));
        assert_eq!(lib.tokens(Some(SPACE)), Ok(vec![0x100]));
        assert_eq!(lib.get_next_token(None, 4), Ok(PCD_INVALID_TOKEN_NUMBER));
        assert_eq!(lib.get_next_token(None, 2), Err(PcdError::NotFound));
        assert_eq!(lib.token_spaces(), Ok(vec![SPACE]));
    }

    #[test]
    fn test_patch_set_ptr() {
        let mut target = [0u8; 4];

        let mut size = 5;
        assert_eq!(patch_set_ptr(&mut target, &mut size, &[9; 5]), None);
        assert_eq!((size, target), (4, [0; 4]));

        let mut size = 2;
        assert_eq!(patch_set_ptr(&mut target, &mut size, &[7, 8, 9]), Some(&[7, 8, 9][..]));
        assert_eq!(target, [7, 8, 0, 0]);
    }

    #[test]
    fn test_patchable_in_module() {
        with_global_lock(|| {
            static PATCHABLE: PatchableInModule<u32> = PatchableInModule::new(0x10, "PcdPatchableValue");
            static PATCHABLE_BUFFER: PatchableInModule<[u8; 3]> = PatchableInModule::new([0; 3], "PcdPatchableBuffer");

            assert_eq!(PATCHABLE.get(), 0x10);
            assert_eq!(PATCHABLE.set(0x20), 0x20);
            assert_eq!(PATCHABLE.get(), 0x20);

            let mut size = 2;
            assert!(PATCHABLE_BUFFER.set_ptr(&mut size, &[1, 2]).is_some());
            assert_eq!(PATCHABLE_BUFFER.get(), [1, 2, 0]);
        })
        .unwrap();
    }
}
