//! PCD Services
//!
//! [`Pcd`] is the typed PCD interface consumed by firmware modules: Get/Set at every width, Ex variants keyed by a
//! namespace GUID, SKU selection, Set callbacks and token enumeration. [`PcdService`] implements it for both phases.
//!
//! ## Phases
//!
//! - A PEI service owns the PEI database. Callback rows are limited to
//!   [`PcdConfig::pei_callbacks_per_token`](crate::config::PcdConfig) entries. [`PcdService::publish`] hands the
//!   database, including values set during PEI, to DXE in a GUID HOB.
//! - A DXE service owns the DXE database and, when the HOB list carries one, the published PEI database. Token numbers
//!   `[0, pei_count)` address PEI tokens and `pei_count + n` addresses DXE token `n`. Callback rows are unbounded.
//!
//! ## Set and callbacks
//!
//! A Set is validated first (token, width, writable storage). Only a valid Set notifies callbacks, in registration
//! order, with the value about to be written. The lock is not held while callbacks run, so a callback that reads the
//! token sees the old value. A default space Set notifies the callbacks of non-Ex tokens with the token number; an Ex
//! Set notifies with the namespace GUID and the Ex token number.
//!
//! ## Logging
//!
//! Detailed logging is available for this component using the `pcd_service` log target.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
extern crate alloc;

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::ffi::c_void;

#[cfg(any(test, feature = "mockall"))]
use mockall::automock;

use patina_internal_pcd::{
    hob::{HobBuilder, HobList},
    image::Phase,
    CallbackHandle, CallbackRegistry, FlashVpd, PcdCallback, PcdCallbackFn, PcdDatabase, PcdError, Result, SkuId,
    StorageContext, StorageKind, TokenNumber, VariableServices, VpdRegion, PCD_INVALID_TOKEN_NUMBER,
};
use r_efi::efi;

use crate::config::PcdConfig;
use crate::tpl_lock::TplMutex;

/// The typed PCD interface.
///
/// Every operation reports failures as a [`PcdError`]. Contract violations (bad token, wrong width, write to read-only
/// storage) are never expected with a correctly generated database.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait Pcd {
    /// Selects the SKU used to resolve SKU-enabled tokens.
    fn set_sku(&self, sku_id: SkuId);

    /// The active SKU.
    fn sku(&self) -> SkuId;

    fn get8(&self, token: TokenNumber) -> Result<u8>;
    fn get16(&self, token: TokenNumber) -> Result<u16>;
    fn get32(&self, token: TokenNumber) -> Result<u32>;
    fn get64(&self, token: TokenNumber) -> Result<u64>;
    fn get_bool(&self, token: TokenNumber) -> Result<bool>;
    /// Returns the whole buffer of a pointer token, at its declared size.
    fn get_ptr(&self, token: TokenNumber) -> Result<Vec<u8>>;
    /// Returns the declared size of a token.
    fn get_size(&self, token: TokenNumber) -> Result<usize>;

    fn get8_ex(&self, guid: &efi::Guid, token: TokenNumber) -> Result<u8>;
    fn get16_ex(&self, guid: &efi::Guid, token: TokenNumber) -> Result<u16>;
    fn get32_ex(&self, guid: &efi::Guid, token: TokenNumber) -> Result<u32>;
    fn get64_ex(&self, guid: &efi::Guid, token: TokenNumber) -> Result<u64>;
    fn get_bool_ex(&self, guid: &efi::Guid, token: TokenNumber) -> Result<bool>;
    fn get_ptr_ex(&self, guid: &efi::Guid, token: TokenNumber) -> Result<Vec<u8>>;
    fn get_size_ex(&self, guid: &efi::Guid, token: TokenNumber) -> Result<usize>;

    fn set8(&self, token: TokenNumber, value: u8) -> Result<()>;
    fn set16(&self, token: TokenNumber, value: u16) -> Result<()>;
    fn set32(&self, token: TokenNumber, value: u32) -> Result<()>;
    fn set64(&self, token: TokenNumber, value: u64) -> Result<()>;
    fn set_bool(&self, token: TokenNumber, value: bool) -> Result<()>;
    /// Writes `value` at the start of a pointer token. `value` may be shorter than the declared size.
    fn set_ptr(&self, token: TokenNumber, value: &[u8]) -> Result<()>;

    fn set8_ex(&self, guid: &efi::Guid, token: TokenNumber, value: u8) -> Result<()>;
    fn set16_ex(&self, guid: &efi::Guid, token: TokenNumber, value: u16) -> Result<()>;
    fn set32_ex(&self, guid: &efi::Guid, token: TokenNumber, value: u32) -> Result<()>;
    fn set64_ex(&self, guid: &efi::Guid, token: TokenNumber, value: u64) -> Result<()>;
    fn set_bool_ex(&self, guid: &efi::Guid, token: TokenNumber, value: bool) -> Result<()>;
    fn set_ptr_ex(&self, guid: &efi::Guid, token: TokenNumber, value: &[u8]) -> Result<()>;

    /// Registers `callback` for Sets of `token` (an Ex token when `guid` is given).
    fn callback_on_set(&self, guid: Option<efi::Guid>, token: TokenNumber, callback: PcdCallback)
        -> Result<CallbackHandle>;

    /// Removes the callback registered under `handle`.
    fn cancel_callback(&self, handle: CallbackHandle) -> Result<()>;

    /// Registers a firmware ABI callback. It receives a copy of the value about to be written.
    fn callback_on_set_fn(&self, guid: Option<efi::Guid>, token: TokenNumber, callback: PcdCallbackFn)
        -> Result<CallbackHandle>;

    /// Removes the first registration of `callback` on `token`.
    fn cancel_callback_fn(&self, guid: Option<efi::Guid>, token: TokenNumber, callback: PcdCallbackFn) -> Result<()>;

    /// Returns the token after `token` in the default space (`guid` of `None`) or in the Ex space `guid`.
    ///
    /// [`PCD_INVALID_TOKEN_NUMBER`] returns the first token. `Ok(None)` marks the end of the space. A token that is not
    /// a member of the space, or an unknown space, is [`PcdError::NotFound`].
    fn get_next_token(&self, guid: Option<efi::Guid>, token: TokenNumber) -> Result<Option<TokenNumber>>;

    /// Returns the Ex token space after `guid`, or the first one for `None`. `Ok(None)` marks the last space.
    fn get_next_token_space(&self, guid: Option<efi::Guid>) -> Result<Option<efi::Guid>>;
}

// Databases and callback rows of one service, addressed by service-wide token numbers.
struct PcdState {
    pei: Option<PcdDatabase>,
    dxe: Option<PcdDatabase>,
    callbacks: CallbackRegistry,
}

impl PcdState {
    fn pei_count(&self) -> usize {
        self.pei.as_ref().map_or(0, PcdDatabase::token_count)
    }

    fn databases(&self) -> impl Iterator<Item = (usize, &PcdDatabase)> {
        let base = self.pei_count();
        self.pei.iter().map(|db| (0, db)).chain(self.dxe.iter().map(move |db| (base, db)))
    }

    fn databases_mut(&mut self) -> impl Iterator<Item = &mut PcdDatabase> {
        self.pei.iter_mut().chain(self.dxe.iter_mut())
    }

    // Splits a service-wide token number into a database and its local token number. The reserved token 0 of the
    // DXE database has no service-wide number.
    fn route(&self, token: TokenNumber) -> Result<(&PcdDatabase, TokenNumber)> {
        let pei_count = self.pei_count();
        match (&self.pei, &self.dxe) {
            (Some(pei), _) if token < pei_count => Ok((pei, token)),
            (_, Some(dxe)) if token > pei_count && token - pei_count < dxe.token_count() => {
                Ok((dxe, token - pei_count))
            }
            _ => Err(PcdError::TokenNotFound(token)),
        }
    }

    fn route_mut(&mut self, token: TokenNumber) -> Result<(&mut PcdDatabase, TokenNumber)> {
        let pei_count = self.pei_count();
        match (&mut self.pei, &mut self.dxe) {
            (Some(pei), _) if token < pei_count => Ok((pei, token)),
            (_, Some(dxe)) if token > pei_count && token - pei_count < dxe.token_count() => {
                Ok((dxe, token - pei_count))
            }
            _ => Err(PcdError::TokenNotFound(token)),
        }
    }

    fn resolve_ex(&self, guid: &efi::Guid, ex_token: TokenNumber) -> Result<TokenNumber> {
        let mut known_guid = false;
        for (base, db) in self.databases() {
            match db.resolve_ex(guid, ex_token) {
                Ok(token) => {
                    log::trace!(target: "pcd_service", "Ex token ({:?}, {}) -> {}", guid, ex_token, base + token);
                    return Ok(base + token);
                }
                Err(PcdError::ExTokenNotFound(_)) => known_guid = true,
                Err(PcdError::GuidNotRegistered) => (),
                Err(e) => return Err(e),
            }
        }
        log::error!(target: "pcd_service", "Ex token ({:?}, {}) is not mapped", guid, ex_token);
        Err(if known_guid { PcdError::ExTokenNotFound(ex_token) } else { PcdError::GuidNotRegistered })
    }

    // Service-wide numbers of the default space tokens.
    fn default_space(&self) -> Vec<TokenNumber> {
        self.databases().flat_map(|(base, db)| (1..db.nex_token_count()).map(move |token| base + token)).collect()
    }

    fn ex_space(&self, guid: &efi::Guid) -> Option<Vec<TokenNumber>> {
        if !self.ex_token_spaces().contains(guid) {
            return None;
        }
        Some(self.databases().flat_map(|(_, db)| db.ex_tokens(guid)).collect())
    }

    fn ex_token_spaces(&self) -> Vec<efi::Guid> {
        let mut spaces: Vec<efi::Guid> = Vec::new();
        for guid in self.databases().flat_map(|(_, db)| db.ex_token_spaces()) {
            if !spaces.contains(&guid) {
                spaces.push(guid);
            }
        }
        spaces
    }
}

/// Returns the member after `current` in `members`, or the first member when `current` is `None`.
fn next_member<T: PartialEq + Copy>(members: &[T], current: Option<T>) -> Result<Option<T>> {
    match current {
        None => Ok(members.first().copied()),
        Some(current) => match members.iter().position(|member| *member == current) {
            Some(index) => Ok(members.get(index + 1).copied()),
            None => Err(PcdError::NotFound),
        },
    }
}

// Errors of a database carry its local token number; report the service-wide one.
fn rebase(error: PcdError, token: TokenNumber) -> PcdError {
    match error {
        PcdError::TokenNotFound(_) => PcdError::TokenNotFound(token),
        PcdError::ReadOnlyStorage(_) => PcdError::ReadOnlyStorage(token),
        e => e,
    }
}

fn to_array<const N: usize>(bytes: Vec<u8>) -> Result<[u8; N]> {
    bytes.try_into().map_err(|_| PcdError::CorruptDatabase)
}

/// The PCD service of one boot phase.
pub struct PcdService {
    phase: Phase,
    config: PcdConfig,
    state: TplMutex<PcdState>,
    variables: Box<dyn VariableServices + Send + Sync>,
    vpd: Box<dyn VpdRegion + Send + Sync>,
}

impl PcdService {
    /// Creates the PEI service from the PEI init image.
    pub fn new_pei(
        image: &[u8],
        config: PcdConfig,
        variables: Box<dyn VariableServices + Send + Sync>,
    ) -> Result<Self> {
        let pei = PcdDatabase::new(image)?;
        if pei.phase() != Phase::Pei {
            log::error!(target: "pcd_service", "PEI service given a {:?} database", pei.phase());
            return Err(PcdError::CorruptDatabase);
        }
        let callbacks = CallbackRegistry::new(pei.token_count(), Some(config.pei_callbacks_per_token));
        let state = PcdState { pei: Some(pei), dxe: None, callbacks };
        Ok(Self::with_state(Phase::Pei, config, state, variables))
    }

    /// Creates the DXE service from the DXE init image and, if present in `hob_list`, the published PEI database.
    pub fn new_dxe(
        image: &[u8],
        hob_list: Option<&HobList>,
        config: PcdConfig,
        variables: Box<dyn VariableServices + Send + Sync>,
    ) -> Result<Self> {
        let mut dxe = PcdDatabase::new(image)?;
        if dxe.phase() != Phase::Dxe {
            log::error!(target: "pcd_service", "DXE service given a {:?} database", dxe.phase());
            return Err(PcdError::CorruptDatabase);
        }
        let pei = match hob_list.map(PcdDatabase::from_hob_list) {
            Some(Ok(pei)) => Some(pei),
            Some(Err(PcdError::NotFound)) | None => {
                log::info!(target: "pcd_service", "No PEI PCD database; DXE tokens only");
                None
            }
            Some(Err(e)) => return Err(e),
        };

        if let Some(pei) = &pei {
            // The SKU chosen in PEI stays active in DXE.
            dxe.set_system_sku_id(pei.system_sku_id());
        }
        let token_count = pei.as_ref().map_or(0, PcdDatabase::token_count) + dxe.token_count();
        let state = PcdState { pei, dxe: Some(dxe), callbacks: CallbackRegistry::new(token_count, None) };
        Ok(Self::with_state(Phase::Dxe, config, state, variables))
    }

    fn with_state(
        phase: Phase,
        config: PcdConfig,
        state: PcdState,
        variables: Box<dyn VariableServices + Send + Sync>,
    ) -> Self {
        // SAFETY: `vpd_base_address` is documented to name the mapped VPD region; zero is rejected on read.
        let vpd = Box::new(unsafe { FlashVpd::new(config.vpd_base_address) });
        let state = TplMutex::new(config.lock_tpl, state, "PcdLock");
        Self { phase, config, state, variables, vpd }
    }

    /// Replaces the VPD region derived from the configuration.
    pub fn with_vpd_region(mut self, vpd: Box<dyn VpdRegion + Send + Sync>) -> Self {
        self.vpd = vpd;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn config(&self) -> &PcdConfig {
        &self.config
    }

    /// Publishes the PEI database for the DXE phase.
    pub fn publish(&self, hobs: &mut HobBuilder) -> Result<()> {
        let state = self.state.lock();
        match &state.pei {
            Some(pei) if self.phase == Phase::Pei => pei.publish(hobs),
            _ => {
                log::error!(target: "pcd_service", "Only the PEI service publishes its database");
                Err(PcdError::NotFound)
            }
        }
    }

    fn get_worker(&self, token: TokenNumber, size: usize) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let (db, local) = state.route(token)?;
        db.get(local, size, &StorageContext::new(self.variables.as_ref(), self.vpd.as_ref()))
            .map_err(|e| rebase(e, token))
    }

    fn size_worker(&self, token: TokenNumber) -> Result<usize> {
        let state = self.state.lock();
        let (db, local) = state.route(token)?;
        db.token_size(local).map_err(|e| rebase(e, token))
    }

    fn resolve_ex(&self, guid: &efi::Guid, ex_token: TokenNumber) -> Result<TokenNumber> {
        self.state.lock().resolve_ex(guid, ex_token)
    }

    // `ex` names the (namespace, Ex token number) the caller used, if any.
    fn set_worker(
        &self,
        ex: Option<(&efi::Guid, TokenNumber)>,
        token: TokenNumber,
        data: &[u8],
        is_ptr: bool,
    ) -> Result<()> {
        let callbacks = {
            let state = self.state.lock();
            let (db, local) = state.route(token)?;
            db.validate_set(local, data.len(), is_ptr).map_err(|e| rebase(e, token))?;
            if ex.is_some() || !db.is_ex_token(local) {
                state.callbacks.callbacks(token)?
            } else {
                Vec::new()
            }
        };

        if !callbacks.is_empty() {
            log::debug!(target: "pcd_service", "Token {} set: notifying {} callback(s)", token, callbacks.len());
        }
        for callback in &callbacks {
            match ex {
                Some((guid, ex_token)) => callback(Some(guid), ex_token, data),
                None => callback(None, token, data),
            }
        }

        let mut state = self.state.lock();
        let (db, local) = state.route_mut(token)?;
        db.set(local, data, is_ptr).map_err(|e| rebase(e, token))
    }

    fn set_ex_worker(&self, guid: &efi::Guid, ex_token: TokenNumber, data: &[u8], is_ptr: bool) -> Result<()> {
        let token = self.resolve_ex(guid, ex_token)?;
        self.set_worker(Some((guid, ex_token)), token, data, is_ptr)
    }

    // Maps the (namespace, token) a callback is registered under to its registry row.
    fn callback_row(&self, guid: Option<efi::Guid>, token: TokenNumber) -> Result<TokenNumber> {
        let state = self.state.lock();
        match guid {
            Some(guid) => state.resolve_ex(&guid, token),
            None => {
                let (db, local) = state.route(token)?;
                if db.is_ex_token(local) {
                    log::error!(target: "pcd_service", "Token {} is only reachable through its token space", token);
                    return Err(PcdError::TokenNotFound(token));
                }
                Ok(token)
            }
        }
    }

    fn callback_token(&self, guid: Option<efi::Guid>, token: TokenNumber) -> Result<TokenNumber> {
        let token = self.callback_row(guid, token)?;
        let state = self.state.lock();
        let (db, local) = state.route(token)?;
        let kind = db.storage_kind(local).map_err(|e| rebase(e, token))?;
        if matches!(kind, StorageKind::Vpd | StorageKind::Hii) {
            log::error!(target: "pcd_service", "Callback on read-only {:?} token {}", kind, token);
            return Err(PcdError::ReadOnlyStorage(token));
        }
        Ok(token)
    }
}

impl Pcd for PcdService {
    fn set_sku(&self, sku_id: SkuId) {
        log::debug!(target: "pcd_service", "SetSku({})", sku_id);
        let mut state = self.state.lock();
        for db in state.databases_mut() {
            db.set_system_sku_id(sku_id);
        }
    }

    fn sku(&self) -> SkuId {
        let state = self.state.lock();
        let sku_id = state.databases().next().map_or(0, |(_, db)| db.system_sku_id());
        sku_id
    }

    fn get8(&self, token: TokenNumber) -> Result<u8> {
        Ok(u8::from_le_bytes(to_array(self.get_worker(token, 1)?)?))
    }

    fn get16(&self, token: TokenNumber) -> Result<u16> {
        Ok(u16::from_le_bytes(to_array(self.get_worker(token, 2)?)?))
    }

    fn get32(&self, token: TokenNumber) -> Result<u32> {
        Ok(u32::from_le_bytes(to_array(self.get_worker(token, 4)?)?))
    }

    fn get64(&self, token: TokenNumber) -> Result<u64> {
        Ok(u64::from_le_bytes(to_array(self.get_worker(token, 8)?)?))
    }

    fn get_bool(&self, token: TokenNumber) -> Result<bool> {
        Ok(self.get8(token)? != 0)
    }

    fn get_ptr(&self, token: TokenNumber) -> Result<Vec<u8>> {
        self.get_worker(token, 0)
    }

    fn get_size(&self, token: TokenNumber) -> Result<usize> {
        self.size_worker(token)
    }

    fn get8_ex(&self, guid: &efi::Guid, token: TokenNumber) -> Result<u8> {
        self.get8(self.resolve_ex(guid, token)?)
    }

    fn get16_ex(&self, guid: &efi::Guid, token: TokenNumber) -> Result<u16> {
        self.get16(self.resolve_ex(guid, token)?)
    }

    fn get32_ex(&self, guid: &efi::Guid, token: TokenNumber) -> Result<u32> {
        self.get32(self.resolve_ex(guid, token)?)
    }

    fn get64_ex(&self, guid: &efi::Guid, token: TokenNumber) -> Result<u64> {
        self.get64(self.resolve_ex(guid, token)?)
    }

    fn get_bool_ex(&self, guid: &efi::Guid, token: TokenNumber) -> Result<bool> {
        self.get_bool(self.resolve_ex(guid, token)?)
    }

    fn get_ptr_ex(&self, guid: &efi::Guid, token: TokenNumber) -> Result<Vec<u8>> {
        self.get_ptr(self.resolve_ex(guid, token)?)
    }

    fn get_size_ex(&self, guid: &efi::Guid, token: TokenNumber) -> Result<usize> {
        self.get_size(self.resolve_ex(guid, token)?)
    }

    fn set8(&self, token: TokenNumber, value: u8) -> Result<()> {
        self.set_worker(None, token, &value.to_le_bytes(), false)
    }

    fn set16(&self, token: TokenNumber, value: u16) -> Result<()> {
        self.set_worker(None, token, &value.to_le_bytes(), false)
    }

    fn set32(&self, token: TokenNumber, value: u32) -> Result<()> {
        self.set_worker(None, token, &value.to_le_bytes(), false)
    }

    fn set64(&self, token: TokenNumber, value: u64) -> Result<()> {
        self.set_worker(None, token, &value.to_le_bytes(), false)
    }

    fn set_bool(&self, token: TokenNumber, value: bool) -> Result<()> {
        self.set_worker(None, token, &[value as u8], false)
    }

    fn set_ptr(&self, token: TokenNumber, value: &[u8]) -> Result<()> {
        self.set_worker(None, token, value, true)
    }

    fn set8_ex(&self, guid: &efi::Guid, token: TokenNumber, value: u8) -> Result<()> {
        self.set_ex_worker(guid, token, &value.to_le_bytes(), false)
    }

    fn set16_ex(&self, guid: &efi::Guid, token: TokenNumber, value: u16) -> Result<()> {
        self.set_ex_worker(guid, token, &value.to_le_bytes(), false)
    }

    fn set32_ex(&self, guid: &efi::Guid, token: TokenNumber, value: u32) -> Result<()> {
        self.set_ex_worker(guid, token, &value.to_le_bytes(), false)
    }

    fn set64_ex(&self, guid: &efi::Guid, token: TokenNumber, value: u64) -> Result<()> {
        self.set_ex_worker(guid, token, &value.to_le_bytes(), false)
    }

    fn set_bool_ex(&self, guid: &efi::Guid, token: TokenNumber, value: bool) -> Result<()> {
        self.set_ex_worker(guid, token, &[value as u8], false)
    }

    fn set_ptr_ex(&self, guid: &efi::Guid, token: TokenNumber, value: &[u8]) -> Result<()> {
        self.set_ex_worker(guid, token, value, true)
    }

    fn callback_on_set(
        &self,
        guid: Option<efi::Guid>,
        token: TokenNumber,
        callback: PcdCallback,
    ) -> Result<CallbackHandle> {
        let token = self.callback_token(guid, token)?;
        self.state.lock().callbacks.register(token, callback, None)
    }

    fn cancel_callback(&self, handle: CallbackHandle) -> Result<()> {
        self.state.lock().callbacks.unregister(handle)
    }

    fn callback_on_set_fn(
        &self,
        guid: Option<efi::Guid>,
        token: TokenNumber,
        callback: PcdCallbackFn,
    ) -> Result<CallbackHandle> {
        let token = self.callback_token(guid, token)?;
        let wrapper: PcdCallback = Arc::new(move |guid: Option<&efi::Guid>, token: TokenNumber, data: &[u8]| {
            let mut value = data.to_vec();
            let guid = guid.map_or(core::ptr::null(), |guid| guid as *const efi::Guid);
            callback(guid, token, value.as_mut_ptr() as *mut c_void, value.len());
        });
        self.state.lock().callbacks.register(token, wrapper, Some(callback as usize))
    }

    fn cancel_callback_fn(&self, guid: Option<efi::Guid>, token: TokenNumber, callback: PcdCallbackFn) -> Result<()> {
        let token = self.callback_row(guid, token)?;
        self.state.lock().callbacks.unregister_key(token, callback as usize)
    }

    fn get_next_token(&self, guid: Option<efi::Guid>, token: TokenNumber) -> Result<Option<TokenNumber>> {
        let state = self.state.lock();
        let members = match guid {
            None => state.default_space(),
            Some(guid) => state.ex_space(&guid).ok_or(PcdError::NotFound)?,
        };
        let current = if token == PCD_INVALID_TOKEN_NUMBER { None } else { Some(token) };
        next_member(&members, current)
    }

    fn get_next_token_space(&self, guid: Option<efi::Guid>) -> Result<Option<efi::Guid>> {
        let spaces = self.state.lock().ex_token_spaces();
        next_member(&spaces, guid)
    }
}

impl core::fmt::Debug for PcdService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PcdService").field("phase", &self.phase).field("config", &self.config).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::with_global_lock;
    use patina_internal_pcd::image::builder::{ImageBuilder, TokenValue};
    use patina_internal_pcd::storage::MockVariableServices;
    use std::sync::Mutex;

    const SPACE: efi::Guid =
        efi::Guid::from_fields(0x5c7e9a31, 0x2b4d, 0x4f6e, 0x8a, 0x1b, &[0x3c, 0x5d, 0x7e, 0x9f, 0xa0, 0xb1]);

    fn noop() -> PcdCallback {
        Arc::new(|_: Option<&efi::Guid>, _: TokenNumber, _: &[u8]| ())
    }

    fn pei_image() -> Vec<u8> {
        let mut builder = ImageBuilder::new(Phase::Pei);
        builder.add(TokenValue::data(&[1]));
        builder.add(TokenValue::data(&0x0202u16.to_le_bytes()));
        builder.add_ex(SPACE, 0x10, TokenValue::data(&0x0303_0303u32.to_le_bytes()));
        builder.build().unwrap()
    }

    fn dxe_image() -> Vec<u8> {
        let mut builder = ImageBuilder::new(Phase::Dxe);
        builder.add(TokenValue::data(&0x0404_0404_0404_0404u64.to_le_bytes()));
        builder.add_ex(SPACE, 0x20, TokenValue::data(&[5]));
        builder.build().unwrap()
    }

    fn pei_service() -> PcdService {
        PcdService::new_pei(&pei_image(), PcdConfig::default(), Box::new(MockVariableServices::new())).unwrap()
    }

    fn dxe_service(pei: &PcdService) -> PcdService {
        let mut hobs = HobBuilder::new();
        pei.publish(&mut hobs).unwrap();
        let hobs = hobs.finish();
        PcdService::new_dxe(
            &dxe_image(),
            Some(&HobList::new(&hobs)),
            PcdConfig::default(),
            Box::new(MockVariableServices::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_phase_mismatch_is_rejected() {
        with_global_lock(|| {
            let variables = || Box::new(MockVariableServices::new());
            assert!(PcdService::new_pei(&dxe_image(), PcdConfig::default(), variables()).is_err());
            assert!(PcdService::new_dxe(&pei_image(), None, PcdConfig::default(), variables()).is_err());
        })
        .unwrap();
    }

    #[test]
    fn test_dxe_numbering_spans_both_databases() {
        with_global_lock(|| {
            let pei = pei_service();
            pei.set8(1, 0x11).unwrap();
            let dxe = dxe_service(&pei);

            // PEI has 4 local tokens (0..=3); DXE token 1 is service token 5.
            assert_eq!(dxe.get8(1).unwrap(), 0x11);
            assert_eq!(dxe.get16(2).unwrap(), 0x0202);
            assert_eq!(dxe.get64(5).unwrap(), 0x0404_0404_0404_0404);
            assert_eq!(dxe.get8(4), Err(PcdError::TokenNotFound(4)));
            assert_eq!(dxe.get8(7), Err(PcdError::TokenNotFound(7)));
        })
        .unwrap();
    }

    #[test]
    fn test_ex_lookup_checks_pei_then_dxe() {
        with_global_lock(|| {
            let pei = pei_service();
            let dxe = dxe_service(&pei);
            assert_eq!(dxe.get32_ex(&SPACE, 0x10).unwrap(), 0x0303_0303);
            assert_eq!(dxe.get8_ex(&SPACE, 0x20).unwrap(), 5);
            assert_eq!(dxe.get8_ex(&SPACE, 0x30), Err(PcdError::ExTokenNotFound(0x30)));
            let unknown = efi::Guid::from_bytes(&[0x11; 16]);
            assert_eq!(dxe.get8_ex(&unknown, 0x10), Err(PcdError::GuidNotRegistered));
        })
        .unwrap();
    }

    #[test]
    fn test_default_space_enumeration() {
        with_global_lock(|| {
            let pei = pei_service();
            let dxe = dxe_service(&pei);
            assert_eq!(dxe.get_next_token(None, 0), Ok(Some(1)));
            assert_eq!(dxe.get_next_token(None, 1), Ok(Some(2)));
            assert_eq!(dxe.get_next_token(None, 2), Ok(Some(5)));
            assert_eq!(dxe.get_next_token(None, 5), Ok(None));
            assert_eq!(dxe.get_next_token(None, 3), Err(PcdError::NotFound));
        })
        .unwrap();
    }

    #[test]
    fn test_ex_space_enumeration() {
        with_global_lock(|| {
            let pei = pei_service();
            let dxe = dxe_service(&pei);
            assert_eq!(dxe.get_next_token(Some(SPACE), 0), Ok(Some(0x10)));
            assert_eq!(dxe.get_next_token(Some(SPACE), 0x10), Ok(Some(0x20)));
            assert_eq!(dxe.get_next_token(Some(SPACE), 0x20), Ok(None));
            assert_eq!(dxe.get_next_token(Some(SPACE), 0x15), Err(PcdError::NotFound));
            assert_eq!(dxe.get_next_token(Some(efi::Guid::from_bytes(&[0x22; 16])), 0), Err(PcdError::NotFound));

            assert_eq!(dxe.get_next_token_space(None), Ok(Some(SPACE)));
            assert_eq!(dxe.get_next_token_space(Some(SPACE)), Ok(None));
            assert_eq!(dxe.get_next_token_space(Some(efi::Guid::from_bytes(&[0x22; 16]))), Err(PcdError::NotFound));
        })
        .unwrap();
    }

    #[test]
    fn test_set_sku_carries_into_dxe() {
        with_global_lock(|| {
            let pei = pei_service();
            pei.set_sku(3);
            let dxe = dxe_service(&pei);
            assert_eq!(dxe.sku(), 3);
            dxe.set_sku(4);
            assert_eq!(dxe.sku(), 4);
        })
        .unwrap();
    }

    #[test]
    fn test_ex_set_notifies_with_ex_number() {
        with_global_lock(|| {
            let pei = pei_service();
            let seen = Arc::new(Mutex::new(Vec::new()));
            let recorder = seen.clone();
            pei.callback_on_set(
                Some(SPACE),
                0x10,
                Arc::new(move |guid: Option<&efi::Guid>, token: TokenNumber, data: &[u8]| {
                    recorder.lock().unwrap().push((guid.copied(), token, data.to_vec()))
                }),
            )
            .unwrap();

            pei.set32_ex(&SPACE, 0x10, 7).unwrap();
            // A direct Set of an Ex-only token does not notify.
            pei.set32(3, 8).unwrap();

            assert_eq!(*seen.lock().unwrap(), vec![(Some(SPACE), 0x10, 7u32.to_le_bytes().to_vec())]);
            assert_eq!(pei.get32(3).unwrap(), 8);
        })
        .unwrap();
    }

    extern "efiapi" fn unused_callback(_: *const efi::Guid, _: usize, _: *mut c_void, _: usize) {}

    #[test]
    fn test_default_space_callback_on_ex_only_token_is_rejected() {
        with_global_lock(|| {
            let pei = pei_service();
            let hits = Arc::new(Mutex::new(0));
            let counter = hits.clone();
            let callback: PcdCallback =
                Arc::new(move |_: Option<&efi::Guid>, _: TokenNumber, _: &[u8]| *counter.lock().unwrap() += 1);

            assert_eq!(pei.callback_on_set(None, 3, callback).unwrap_err(), PcdError::TokenNotFound(3));
            assert_eq!(pei.callback_on_set_fn(None, 3, unused_callback).unwrap_err(), PcdError::TokenNotFound(3));
            assert_eq!(pei.cancel_callback_fn(None, 3, unused_callback), Err(PcdError::TokenNotFound(3)));

            pei.set32_ex(&SPACE, 0x10, 9).unwrap();
            assert_eq!(*hits.lock().unwrap(), 0);

            // The same token registered through its token space is accepted.
            pei.callback_on_set_fn(Some(SPACE), 0x10, unused_callback).unwrap();
            assert_eq!(pei.cancel_callback_fn(Some(SPACE), 0x10, unused_callback), Ok(()));
        })
        .unwrap();
    }

    #[test]
    fn test_pei_callback_rows_are_bounded() {
        with_global_lock(|| {
            let config = PcdConfig { pei_callbacks_per_token: 1, ..PcdConfig::default() };
            let pei = PcdService::new_pei(&pei_image(), config, Box::new(MockVariableServices::new())).unwrap();
            pei.callback_on_set(None, 1, noop()).unwrap();
            assert_eq!(pei.callback_on_set(None, 1, noop()).unwrap_err(), PcdError::OutOfResources);
        })
        .unwrap();
    }

    #[test]
    fn test_only_pei_publishes() {
        with_global_lock(|| {
            let pei = pei_service();
            let dxe = dxe_service(&pei);
            assert_eq!(dxe.publish(&mut HobBuilder::new()), Err(PcdError::NotFound));
        })
        .unwrap();
    }
}
