//! PCD error types.
//!
//! Errors are split into two categories. A [`ErrorCategory::ContractViolation`] can only happen when the caller or
//! the generated database is wrong (bad token number, width mismatch, write to read-only storage). A
//! [`ErrorCategory::Runtime`] error is a legitimate condition that a well-behaved caller is expected to handle.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::fmt::Display;

use r_efi::efi;

use crate::token::{SkuId, TokenNumber};

/// A specialized [`Result`](core::result::Result) type for PCD operations.
pub type Result<T> = core::result::Result<T, PcdError>;

/// The category of a [`PcdError`].
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorCategory {
    /// The database or the caller broke an invariant. Never expected with a correctly generated database.
    ContractViolation,
    /// A normal runtime condition such as end of enumeration or a full callback row.
    Runtime,
}

/// PCD errors.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PcdError {
    /// The token number is outside of the token space, or is the reserved invalid token.
    TokenNotFound(TokenNumber),
    /// The namespace GUID is not present in any GUID table.
    GuidNotRegistered,
    /// The GUID is known but no Ex mapping exists for the token number.
    ExTokenNotFound(TokenNumber),
    /// The access width does not match the declared size of the token.
    SizeMismatch {
        /// The declared (maximum) size of the token.
        declared: usize,
        /// The size supplied by the caller.
        requested: usize,
    },
    /// The token is backed by VPD or HII storage and cannot be written.
    ReadOnlyStorage(TokenNumber),
    /// The SKU ID is not below the platform maximum.
    InvalidSkuId(SkuId),
    /// The database image is malformed.
    CorruptDatabase,
    /// The HII variable is too small to hold the value at the recorded offset.
    VariableTooSmall,
    /// An enumeration ended or the requested item is not present.
    NotFound,
    /// The callback row for the token is full.
    OutOfResources,
    /// GetVariable failed; the status is returned unchanged.
    Variable(efi::Status),
}

impl PcdError {
    /// Returns the category of the error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            PcdError::NotFound | PcdError::OutOfResources | PcdError::Variable(_) => ErrorCategory::Runtime,
            _ => ErrorCategory::ContractViolation,
        }
    }

    /// Returns true if the error indicates a broken database or a broken caller.
    pub fn is_contract_violation(&self) -> bool {
        self.category() == ErrorCategory::ContractViolation
    }
}

impl From<PcdError> for efi::Status {
    fn from(e: PcdError) -> efi::Status {
        match e {
            PcdError::TokenNotFound(_) => efi::Status::NOT_FOUND,
            PcdError::GuidNotRegistered => efi::Status::NOT_FOUND,
            PcdError::ExTokenNotFound(_) => efi::Status::NOT_FOUND,
            PcdError::SizeMismatch { .. } => efi::Status::INVALID_PARAMETER,
            PcdError::ReadOnlyStorage(_) => efi::Status::WRITE_PROTECTED,
            PcdError::InvalidSkuId(_) => efi::Status::INVALID_PARAMETER,
            PcdError::CorruptDatabase => efi::Status::VOLUME_CORRUPTED,
            PcdError::VariableTooSmall => efi::Status::BUFFER_TOO_SMALL,
            PcdError::NotFound => efi::Status::NOT_FOUND,
            PcdError::OutOfResources => efi::Status::OUT_OF_RESOURCES,
            PcdError::Variable(status) => status,
        }
    }
}

impl Display for PcdError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PcdError::TokenNotFound(token) => write!(f, "PCD token {token} does not exist"),
            PcdError::GuidNotRegistered => write!(f, "Token space GUID is not registered"),
            PcdError::ExTokenNotFound(token) => write!(f, "No Ex mapping for token {token}"),
            PcdError::SizeMismatch { declared, requested } => {
                write!(f, "Access of {requested} bytes to a {declared} byte token")
            }
            PcdError::ReadOnlyStorage(token) => write!(f, "PCD token {token} is read-only"),
            PcdError::InvalidSkuId(sku_id) => write!(f, "SKU id {sku_id} is out of range"),
            PcdError::CorruptDatabase => write!(f, "PCD database is corrupt"),
            PcdError::VariableTooSmall => write!(f, "HII variable is too small for the token value"),
            PcdError::NotFound => write!(f, "Not found"),
            PcdError::OutOfResources => write!(f, "Callback table full, can't register more callbacks."),
            PcdError::Variable(status) => write!(f, "GetVariable failed: {status:?}"),
        }
    }
}

impl core::error::Error for PcdError {}

impl From<scroll::Error> for PcdError {
    fn from(e: scroll::Error) -> PcdError {
        log::error!(target: "pcd", "Malformed PCD database image: {:?}", e);
        PcdError::CorruptDatabase
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_errors_are_not_contract_violations() {
        assert!(!PcdError::NotFound.is_contract_violation());
        assert!(!PcdError::OutOfResources.is_contract_violation());
        assert!(!PcdError::Variable(efi::Status::NOT_FOUND).is_contract_violation());
    }

    #[test]
    fn test_contract_errors_are_contract_violations() {
        assert!(PcdError::TokenNotFound(7).is_contract_violation());
        assert!(PcdError::GuidNotRegistered.is_contract_violation());
        assert!(PcdError::SizeMismatch { declared: 4, requested: 2 }.is_contract_violation());
        assert!(PcdError::ReadOnlyStorage(3).is_contract_violation());
        assert_eq!(PcdError::CorruptDatabase.category(), ErrorCategory::ContractViolation);
    }

    #[test]
    fn test_display() {
        assert_eq!(PcdError::TokenNotFound(7).to_string(), "PCD token 7 does not exist");
        assert_eq!(
            PcdError::SizeMismatch { declared: 4, requested: 2 }.to_string(),
            "Access of 2 bytes to a 4 byte token"
        );
        let error: &dyn core::error::Error = &PcdError::ReadOnlyStorage(3);
        assert_eq!(error.to_string(), "PCD token 3 is read-only");
    }

    #[test]
    fn test_status_conversion() {
        assert_eq!(efi::Status::from(PcdError::OutOfResources), efi::Status::OUT_OF_RESOURCES);
        assert_eq!(efi::Status::from(PcdError::NotFound), efi::Status::NOT_FOUND);
        assert_eq!(efi::Status::from(PcdError::ReadOnlyStorage(1)), efi::Status::WRITE_PROTECTED);
        assert_eq!(efi::Status::from(PcdError::Variable(efi::Status::DEVICE_ERROR)), efi::Status::DEVICE_ERROR);
    }
}
