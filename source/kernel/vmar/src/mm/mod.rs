// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Virtual address region tree: regions, mappings, placement and ASLR.

use static_assertions::const_assert;

mod arch;
mod aspace;
mod config;
mod enumerate;
mod error;
mod flags;
mod mapping;
mod node;
mod object;
mod soft_table;
mod subregion;
mod vmar;

pub use arch::ArchAspace;
pub use aspace::{AddressSpace, PrivilegedImage};
pub use config::{AslrConfig, AspaceConfig, MAX_ASLR_ENTROPY_BITS};
pub use enumerate::{MappingInfo, RegionInfo, VmEnumerator};
pub use error::{ArchError, VmError};
pub use flags::{ArchMmuFlags, CachePolicy, PageFaultFlags, VmarFlags};
pub use mapping::MappingHandle;
pub use node::{NodeId, NodeState, MAX_NAME_LEN};
pub use object::{AnonymousObject, VmObject};
pub use soft_table::{ArchOp, SoftPageTable};
pub use vmar::{Backing, NodeHandle, RangeOp, VmarHandle};

/// Log2 of the page size.
pub const PAGE_SIZE_SHIFT: u8 = 12;
/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_SHIFT;

const_assert!(PAGE_SIZE.is_power_of_two());
const_assert!(PAGE_SIZE == 4096);

#[inline]
pub const fn is_page_aligned(value: usize) -> bool {
    value & (PAGE_SIZE - 1) == 0
}

#[inline]
pub const fn page_align_down(value: usize) -> usize {
    value & !(PAGE_SIZE - 1)
}

/// Rounds `value` up to the page size; `None` if that overflows.
#[inline]
pub fn page_align_up(value: usize) -> Option<usize> {
    align_up(value, PAGE_SIZE)
}

/// Rounds `value` up to `align`, which must be a power of two.
#[inline]
pub fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}

/// Intersection of `[a, a + a_len)` and `[b, b + b_len)` as `(base, len)`.
pub(crate) fn intersect(a: usize, a_len: usize, b: usize, b_len: usize) -> Option<(usize, usize)> {
    let start = a.max(b);
    let end = a.saturating_add(a_len).min(b.saturating_add(b_len));
    (start < end).then(|| (start, end - start))
}


#[cfg(test)]
mod tests_prop;
