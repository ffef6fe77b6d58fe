// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Seam between the VMAR tree and the hardware translation layer
//! OWNERS: @kernel-mm-team
//! PUBLIC API: ArchAspace (map, protect, unmap, pick_spot)
//! DEPENDS_ON: mm::flags, mm::error
//! INVARIANTS: Calls are synchronous and never yield; all ranges are page aligned

use alloc::sync::Arc;

use super::error::ArchError;
use super::flags::ArchMmuFlags;

/// Hardware page-table operations consumed by the region tree.
///
/// Every call happens with the address-space lock held. Implementations
/// provide their own interior mutability.
pub trait ArchAspace: Send + Sync {
    /// Installs translations for `[vaddr, vaddr + size)`. `pages` holds one
    /// physical address per page of the range.
    fn map(
        &self,
        vaddr: usize,
        size: usize,
        pages: &[usize],
        flags: ArchMmuFlags,
    ) -> Result<(), ArchError>;

    /// Rewrites the flags of every present translation in the range.
    fn protect(&self, vaddr: usize, size: usize, flags: ArchMmuFlags) -> Result<(), ArchError>;

    /// Removes every present translation in the range.
    fn unmap(&self, vaddr: usize, size: usize) -> Result<(), ArchError>;

    /// Chooses an address inside the gap `[gap_start, gap_end)`.
    ///
    /// `prev_flags`/`next_flags` are the hardware flags of the neighbouring
    /// mappings, if any, so that architectures can keep a guard distance
    /// between incompatible translations. The caller rejects the answer if
    /// `spot + size` does not fit the gap.
    #[allow(clippy::too_many_arguments)]
    fn pick_spot(
        &self,
        gap_start: usize,
        _prev_flags: Option<ArchMmuFlags>,
        gap_end: usize,
        _next_flags: Option<ArchMmuFlags>,
        align: usize,
        _size: usize,
        _flags: ArchMmuFlags,
    ) -> usize {
        super::align_up(gap_start, align).unwrap_or(gap_end)
    }
}

impl<T: ArchAspace + ?Sized> ArchAspace for Arc<T> {
    fn map(
        &self,
        vaddr: usize,
        size: usize,
        pages: &[usize],
        flags: ArchMmuFlags,
    ) -> Result<(), ArchError> {
        (**self).map(vaddr, size, pages, flags)
    }

    fn protect(&self, vaddr: usize, size: usize, flags: ArchMmuFlags) -> Result<(), ArchError> {
        (**self).protect(vaddr, size, flags)
    }

    fn unmap(&self, vaddr: usize, size: usize) -> Result<(), ArchError> {
        (**self).unmap(vaddr, size)
    }

    fn pick_spot(
        &self,
        gap_start: usize,
        prev_flags: Option<ArchMmuFlags>,
        gap_end: usize,
        next_flags: Option<ArchMmuFlags>,
        align: usize,
        size: usize,
        flags: ArchMmuFlags,
    ) -> usize {
        (**self).pick_spot(gap_start, prev_flags, gap_end, next_flags, align, size, flags)
    }
}
