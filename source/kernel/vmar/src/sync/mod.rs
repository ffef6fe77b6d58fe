// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Locking for the VMAR tree
//! OWNERS: @kernel-sync-team
//! PUBLIC API: AspaceLock
//! DEPENDS_ON: spin
//! INVARIANTS: One lock per address space; never held across a yield

mod aspace_lock;

pub use aspace_lock::{AspaceLock, AspaceLockGuard, LockStats};
