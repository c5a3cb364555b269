//! PCD Configuration
//!
//! Platform-fixed settings consumed by the PCD services and the PcdLib wrappers.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use patina_internal_pcd::SkuId;
use r_efi::efi;

/// PCD service configuration.
#[derive(Debug, Clone)]
pub struct PcdConfig {
    /// Callbacks each PEI token can hold. Registering one more fails with `OutOfResources`.
    pub pei_callbacks_per_token: usize,
    /// SKU ids passed to the PcdLib `set_sku` wrapper must be below this value.
    pub max_sku_id: SkuId,
    /// Physical address of the VPD region. Must be mapped and readable whenever a VPD token is read; zero means the
    /// platform has no VPD region.
    pub vpd_base_address: u64,
    /// TPL at which database and callback access is serialized in DXE.
    pub lock_tpl: efi::Tpl,
}

impl Default for PcdConfig {
    fn default() -> Self {
        PcdConfig { pei_callbacks_per_token: 8, max_sku_id: 0xFF, vpd_base_address: 0, lock_tpl: efi::TPL_NOTIFY }
    }
}
