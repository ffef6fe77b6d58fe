// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: NEURON virtual address region (VMAR) tree
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit (mm/tests.rs), property (mm/tests_prop.rs), scenarios (tests/)
//! PUBLIC API: AddressSpace, VmarHandle, MappingHandle, VmObject, ArchAspace
//! DEPENDS_ON: bitflags, spin, rand_core, rand_chacha
//! INVARIANTS: Children never overlap; lifecycle NotReady -> Alive -> Dead; one lock per space
//!
//! The crate builds `no_std` for the kernel and links `std` only for host tests.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

extern crate alloc;

#[macro_use]
pub mod diag;

pub mod determinism;
pub mod mm;
pub mod sync;

pub use mm::{
    AddressSpace, AnonymousObject, ArchAspace, ArchError, ArchMmuFlags, ArchOp, AslrConfig,
    AspaceConfig, Backing, CachePolicy, MappingHandle, MappingInfo, NodeHandle, NodeId, NodeState,
    PageFaultFlags, PrivilegedImage, RangeOp, RegionInfo, SoftPageTable, VmEnumerator, VmError,
    VmObject, VmarFlags, VmarHandle, PAGE_SIZE, PAGE_SIZE_SHIFT,
};
