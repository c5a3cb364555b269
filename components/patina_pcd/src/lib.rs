//! Platform Configuration Database (PCD) Services
//!
//! This crate provides the PCD services of both boot phases on top of the `patina_internal_pcd` engine:
//!
//! - [`PcdService`]: the PEI or DXE service, implementing the typed [`Pcd`] interface.
//! - [`PcdLib`](library::PcdLib): the library wrappers most modules consume.
//! - [`protocol`]: the PCD protocol/PPI function table for code that calls through the firmware ABI.
//! - [`RuntimeVariableServices`](variable::RuntimeVariableServices): HII token storage over UEFI variables.
//!
//! ## Examples and Usage
//!
//! The PEI phase builds its service from the PEI database image and, before handing off, publishes its database in
//! the HOB list. The DXE phase builds its service from the DXE image and the HOB list, then installs the protocol.
//!
//! ```rust,ignore
//! use patina_pcd::{PcdConfig, PcdService, Pcd};
//!
//! let pei = PcdService::new_pei(PEI_PCD_DB_INIT, PcdConfig::default(), variables)?;
//! pei.set_sku(board_sku);
//! pei.publish(&mut hob_builder)?;
//!
//! let dxe = PcdService::new_dxe(DXE_PCD_DB_INIT, Some(&hob_list), PcdConfig::default(), variables)?;
//! patina_pcd::tpl_lock::init_boot_services(boot_services);
//! patina_pcd::protocol::install_protocol(boot_services, &mut handle, Box::leak(Box::new(dxe)))?;
//! ```
//!
//! ## Logging
//!
//! Detailed logging is available for this crate using the `pcd_service` log target. The engine logs under `pcd`.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]

extern crate alloc;

pub mod config;
pub mod library;
pub mod protocol;
pub mod service;
pub mod tpl_lock;
pub mod variable;

#[cfg(test)]
mod test_support;

pub use config::PcdConfig;
pub use library::{patch_set_ptr, PatchableInModule, PcdLib};
#[cfg(any(test, feature = "mockall"))]
pub use service::MockPcd;
pub use service::{Pcd, PcdService};

pub use patina_internal_pcd::{
    hob::{HobBuilder, HobList},
    CallbackHandle, PcdCallback, PcdCallbackFn, PcdError, Result, SkuId, TokenNumber, PCD_INVALID_TOKEN_NUMBER,
};
