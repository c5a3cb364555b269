//! PCD Test Support
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use std::any::Any;

/// Serializes tests that touch global state (registered boot services, the installed protocol service).
static GLOBAL_STATE_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Runs `f` while holding the global test lock.
pub(crate) fn with_global_lock<F: Fn() + std::panic::RefUnwindSafe>(f: F) -> Result<(), Box<dyn Any + Send>> {
    let _guard = GLOBAL_STATE_TEST_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    std::panic::catch_unwind(|| {
        f();
    })
}
