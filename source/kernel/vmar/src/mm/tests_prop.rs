// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for VMAR placement and range operations
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic. Random operation sequences must keep the tree well-formed.
//!
//! TEST_SCOPE:
//!   - Dynamic placement: alignment, containment, no overlap
//!   - Unmap: nothing intersecting the range survives, the rest is untouched
//!   - Create/destroy leaves the parent as it was
//!
//! TEST_SCENARIOS:
//!   - placements_are_aligned_and_disjoint(): random sizes/alignments under seeded ASLR
//!   - random_ops_keep_tree_well_formed(): mixed create/unmap/protect sequences
//!   - unmap_clears_exactly_the_range(): pages outside the range keep their mapping
//!   - create_destroy_is_identity(): child creation followed by destroy

use std::vec::Vec;

use proptest::prelude::*;

use super::tests::{fixture_with, map_at, region_r, R, RW};
use super::{AnonymousObject, Backing, VmError, VmarFlags, VmarHandle, PAGE_SIZE};

/// Checks containment, ordering and alignment of every child, recursively.
fn assert_well_formed(vmar: &VmarHandle) -> Result<(), TestCaseError> {
    let base = vmar.base().map_err(|e| TestCaseError::fail(format!("{e}")))?;
    let end = base + vmar.size().map_err(|e| TestCaseError::fail(format!("{e}")))?;
    let mut cursor = base;
    for child in vmar.children() {
        let cbase = child.base().map_err(|e| TestCaseError::fail(format!("{e}")))?;
        let csize = child.size().map_err(|e| TestCaseError::fail(format!("{e}")))?;
        prop_assert!(csize > 0);
        prop_assert_eq!(cbase % PAGE_SIZE, 0);
        prop_assert_eq!(csize % PAGE_SIZE, 0);
        prop_assert!(cbase >= cursor, "child {:#x} overlaps previous end {:#x}", cbase, cursor);
        prop_assert!(cbase + csize <= end, "child {:#x}+{:#x} escapes {:#x}", cbase, csize, end);
        cursor = cbase + csize;
        if let Some(region) = child.as_region() {
            assert_well_formed(region)?;
        }
    }
    Ok(())
}

#[derive(Clone, Debug)]
enum Op {
    Dynamic { pages: usize, align_pow2: u8, region: bool },
    Specific { page: usize, pages: usize },
    Unmap { page: usize, pages: usize, partial: bool },
    Protect { page: usize, pages: usize },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1usize..6, 12u8..15, any::<bool>())
            .prop_map(|(pages, align_pow2, region)| Op::Dynamic { pages, align_pow2, region }),
        (0usize..16, 1usize..4).prop_map(|(page, pages)| Op::Specific { page, pages }),
        (0usize..16, 1usize..8, any::<bool>())
            .prop_map(|(page, pages, partial)| Op::Unmap { page, pages, partial }),
        (0usize..16, 1usize..4).prop_map(|(page, pages)| Op::Protect { page, pages }),
    ]
}

proptest! {
    #[test]
    fn placements_are_aligned_and_disjoint(
        seed in any::<u64>(),
        requests in prop::collection::vec((1usize..5, 12u8..15), 1..12),
    ) {
        let f = fixture_with(Some(seed));
        let r = region_r(&f);
        for (pages, align_pow2) in requests {
            let size = pages * PAGE_SIZE;
            match r.create_mapping(0, size, align_pow2, VmarFlags::empty(), Backing::new(AnonymousObject::new(size), 0, RW), "p") {
                Ok(m) => {
                    let base = m.base().map_err(|e| TestCaseError::fail(format!("{e}")))?;
                    prop_assert_eq!(base % (1usize << align_pow2), 0);
                }
                Err(err) => {
                    prop_assert_eq!(err, VmError::OutOfSpace);
                }
            }
        }
        assert_well_formed(&r)?;
    }

    #[test]
    fn random_ops_keep_tree_well_formed(
        seed in any::<u64>(),
        ops in prop::collection::vec(arb_op(), 1..24),
    ) {
        let f = fixture_with(Some(seed));
        let r = region_r(&f);
        let rbase = r.base().map_err(|e| TestCaseError::fail(format!("{e}")))?;
        for op in ops {
            let result = match op {
                Op::Dynamic { pages, align_pow2, region: true } => r
                    .create_subregion(0, pages * PAGE_SIZE, align_pow2, VmarFlags::CAN_RWX | VmarFlags::CAN_MAP_SPECIFIC, "sub")
                    .map(drop),
                Op::Dynamic { pages, align_pow2, region: false } => {
                    let size = pages * PAGE_SIZE;
                    r.create_mapping(0, size, align_pow2, VmarFlags::empty(), Backing::new(AnonymousObject::new(size), 0, RW), "dyn")
                        .map(drop)
                }
                Op::Specific { page, pages } => {
                    let size = pages * PAGE_SIZE;
                    r.create_mapping(page * PAGE_SIZE, size, 0, VmarFlags::SPECIFIC, Backing::new(AnonymousObject::new(size), 0, RW), "fix")
                        .map(drop)
                }
                Op::Unmap { page, pages, partial } => {
                    r.unmap(rbase + page * PAGE_SIZE, pages * PAGE_SIZE, partial)
                }
                Op::Protect { page, pages } => {
                    r.protect(rbase + page * PAGE_SIZE, pages * PAGE_SIZE, R)
                }
            };
            // Errors are fine; a failed operation must still leave a valid tree.
            let _ = result;
            assert_well_formed(&r)?;
        }
    }

    #[test]
    fn unmap_clears_exactly_the_range(first in 0usize..8, count in 1usize..8) {
        let f = fixture_with(None);
        let r = region_r(&f);
        let m = map_at(&r, 0, 8 * PAGE_SIZE, RW);
        m.map_range(0, 8 * PAGE_SIZE, true).map_err(|e| TestCaseError::fail(format!("{e}")))?;
        let count = count.min(8 - first);
        let base = 0x1000 + first * PAGE_SIZE;
        r.unmap(base, count * PAGE_SIZE, false).map_err(|e| TestCaseError::fail(format!("{e}")))?;
        for page in 0..8 {
            let addr = 0x1000 + page * PAGE_SIZE;
            let removed = page >= first && page < first + count;
            prop_assert_eq!(f.table.lookup(addr).is_none(), removed);
            prop_assert_eq!(r.find_region(addr).is_none(), removed);
        }
        assert_well_formed(&r)?;
    }

    #[test]
    fn create_destroy_is_identity(offsets in prop::collection::vec(0usize..16, 0..6), pages in 1usize..4) {
        let f = fixture_with(None);
        let r = region_r(&f);
        for offset in offsets {
            let _ = r.create_mapping(offset * PAGE_SIZE, PAGE_SIZE, 0, VmarFlags::SPECIFIC, Backing::new(AnonymousObject::new(PAGE_SIZE), 0, RW), "pre");
        }
        let snapshot = |vmar: &VmarHandle| -> Vec<(usize, usize)> {
            vmar.children().iter().filter_map(|c| Some((c.base().ok()?, c.size().ok()?))).collect()
        };
        let before = snapshot(&r);
        let nodes = f.aspace.node_count();
        if let Ok(child) = r.create_subregion(0, pages * PAGE_SIZE, 0, VmarFlags::empty(), "tmp") {
            child.destroy().map_err(|e| TestCaseError::fail(format!("{e}")))?;
        }
        prop_assert_eq!(snapshot(&r), before);
        prop_assert_eq!(f.aspace.node_count(), nodes);
    }
}
