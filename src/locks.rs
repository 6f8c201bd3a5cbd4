// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Poison-tolerant lock helpers for the download registry.
//!
//! The registry is touched from progress callbacks that run inside source
//! downloaders we do not control. If one of them panics while holding the
//! registry lock, the lock becomes poisoned. Every record in the registry is
//! still a complete value (mutations are single field assignments), so we log
//! the event and keep going with the recovered guard instead of taking the
//! whole orchestrator down.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering from poisoning.
#[inline]
pub fn read_or_recover<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "modelpull::locks",
                event = "LOCK_POISONED_READ",
                "registry lock was poisoned by a panicking writer; continuing with recovered state"
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering from poisoning.
#[inline]
pub fn write_or_recover<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "modelpull::locks",
                event = "LOCK_POISONED_WRITE",
                "registry lock was poisoned by a panicking writer; continuing with recovered state"
            );
            poisoned.into_inner()
        }
    }
}

/// Lock a mutex, recovering from poisoning.
#[inline]
pub fn lock_or_recover<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "modelpull::locks",
                event = "LOCK_POISONED_MUTEX",
                "mutex was poisoned by a panicking holder; continuing with recovered state"
            );
            poisoned.into_inner()
        }
    }
}
