//! Platform Configuration Database (PCD) Engine
//!
//! This crate implements the storage engine behind the PCD services: a small database of named configuration
//! values ("tokens") whose initial contents are produced at build time as a binary image.
//!
//! A token number is resolved to a [`LocalToken`](token::LocalToken), which names a storage kind and an offset into
//! the database image. SKU-enabled tokens are first narrowed to the slot of the active SKU. The resulting
//! [`StorageLocation`](storage::StorageLocation) is then read or written through one of four backends:
//!
//! - **Data**: the value lives inline in the database image.
//! - **String**: the image holds an index into the shared UTF-16 string table.
//! - **VPD**: the value lives in read-only flash outside of the database.
//! - **HII**: the value lives inside a UEFI variable.
//!
//! The phase services (PEI and DXE) in `patina_pcd` own one [`PcdDatabase`] per phase together with a
//! [`CallbackRegistry`], and layer locking and the typed facades on top.
//!
//! ## Logging
//!
//! Detailed logging is available for this crate using the `pcd` log target.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]

extern crate alloc;

pub mod callback;
pub mod database;
pub mod error;
pub mod hob;
pub mod image;
pub mod sku;
pub mod storage;
pub mod token;

pub use callback::{CallbackHandle, CallbackRegistry, PcdCallback, PcdCallbackFn};
pub use database::PcdDatabase;
pub use error::{ErrorCategory, PcdError, Result};
pub use storage::{FlashVpd, StorageContext, StorageLocation, VariableServices, VpdRegion};
pub use token::{LocalToken, SkuId, StorageKind, TokenNumber, PCD_INVALID_TOKEN_NUMBER};
