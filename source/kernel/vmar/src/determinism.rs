// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Deterministic ASLR seed shared across address spaces
//! OWNERS: @kernel-mm-team
//! PUBLIC API: seed(), set_seed(), seeded_prng()
//! DEPENDS_ON: core::sync::atomic, rand_chacha
//! INVARIANTS: Relaxed atomics sufficient; default value stable across boots
//!
//! Bring-up and host tests want reproducible placement. Address spaces built
//! with [`crate::AddressSpace::with_seeded_aslr`] draw their ChaCha20 stream
//! from this seed; production spaces inject a PRNG fed from real entropy.

use core::sync::atomic::{AtomicU64, Ordering};

use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha20Rng;

const DEFAULT_SEED: u64 = 0x766d_6172; // ASCII "vmar"

static SEED: AtomicU64 = AtomicU64::new(DEFAULT_SEED);

/// Returns the deterministic seed for ASLR pseudo random number generators.
#[inline]
pub fn seed() -> u64 {
    SEED.load(Ordering::Relaxed)
}

/// Overrides the deterministic seed.
#[inline]
pub fn set_seed(value: u64) {
    SEED.store(value, Ordering::Relaxed);
}

/// Builds a ChaCha20 stream from the current seed.
pub fn seeded_prng() -> ChaCha20Rng {
    ChaCha20Rng::seed_from_u64(seed())
}
