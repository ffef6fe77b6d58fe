// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Software page table backing host tests and early bring-up
//! OWNERS: @kernel-mm-team
//! PUBLIC API: SoftPageTable::new(), with_wx_enforced(), lookup(), mapped_pages(), ops()
//! DEPENDS_ON: spin::Mutex, mm::arch::ArchAspace
//! INVARIANTS: One entry per 4 KiB page; a failed call leaves the table untouched
//!
//! Mirrors the contract of the Sv39 table without touching real memory:
//! entries live in an ordered map keyed by virtual page number, and every
//! successful operation is appended to an operation log so callers can
//! observe ordering (for example bottom-up destruction).

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

#[cfg(feature = "failpoints")]
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use super::arch::ArchAspace;
use super::error::ArchError;
use super::flags::ArchMmuFlags;
use super::{is_page_aligned, PAGE_SIZE_SHIFT};

/// One successful call into the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchOp {
    Map { vaddr: usize, size: usize, flags: ArchMmuFlags },
    Protect { vaddr: usize, size: usize, flags: ArchMmuFlags },
    Unmap { vaddr: usize, size: usize },
}

#[derive(Clone, Copy, Debug)]
struct Entry {
    paddr: usize,
    flags: ArchMmuFlags,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<usize, Entry>,
    ops: Vec<ArchOp>,
}

/// Page table kept entirely in kernel heap memory.
pub struct SoftPageTable {
    inner: Mutex<Inner>,
    enforce_wx: bool,
    #[cfg(feature = "failpoints")]
    fail_map: AtomicBool,
    #[cfg(feature = "failpoints")]
    fail_protect: AtomicBool,
    #[cfg(feature = "failpoints")]
    fail_unmap: AtomicBool,
}

impl Default for SoftPageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftPageTable {
    /// Creates an empty table that accepts any permission combination.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            enforce_wx: false,
            #[cfg(feature = "failpoints")]
            fail_map: AtomicBool::new(false),
            #[cfg(feature = "failpoints")]
            fail_protect: AtomicBool::new(false),
            #[cfg(feature = "failpoints")]
            fail_unmap: AtomicBool::new(false),
        }
    }

    /// Creates an empty table rejecting writable and executable translations.
    pub fn with_wx_enforced() -> Self {
        Self { enforce_wx: true, ..Self::new() }
    }

    /// Returns the physical address and flags mapped at `vaddr`.
    pub fn lookup(&self, vaddr: usize) -> Option<(usize, ArchMmuFlags)> {
        let inner = self.inner.lock();
        inner.entries.get(&(vaddr >> PAGE_SIZE_SHIFT)).map(|e| (e.paddr, e.flags))
    }

    /// Number of pages currently translated.
    pub fn mapped_pages(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Number of translated pages inside `[vaddr, vaddr + size)`.
    pub fn mapped_in(&self, vaddr: usize, size: usize) -> usize {
        let first = vaddr >> PAGE_SIZE_SHIFT;
        let last = first + (size >> PAGE_SIZE_SHIFT);
        self.inner.lock().entries.range(first..last).count()
    }

    /// Snapshot of the operation log.
    pub fn ops(&self) -> Vec<ArchOp> {
        self.inner.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.inner.lock().ops.clear();
    }

    /// Forces the next `map` call to fail with [`ArchError::Injected`].
    #[cfg(feature = "failpoints")]
    pub fn fail_next_map(&self) {
        self.fail_map.store(true, Ordering::SeqCst);
    }

    /// Forces the next `protect` call to fail with [`ArchError::Injected`].
    #[cfg(feature = "failpoints")]
    pub fn fail_next_protect(&self) {
        self.fail_protect.store(true, Ordering::SeqCst);
    }

    /// Forces the next `unmap` call to fail with [`ArchError::Injected`].
    #[cfg(feature = "failpoints")]
    pub fn fail_next_unmap(&self) {
        self.fail_unmap.store(true, Ordering::SeqCst);
    }

    fn check_range(vaddr: usize, size: usize) -> Result<(usize, usize), ArchError> {
        if !is_page_aligned(vaddr) || !is_page_aligned(size) || size == 0 {
            return Err(ArchError::Unaligned);
        }
        vaddr.checked_add(size).ok_or(ArchError::OutOfRange)?;
        let first = vaddr >> PAGE_SIZE_SHIFT;
        Ok((first, first + (size >> PAGE_SIZE_SHIFT)))
    }

    fn check_flags(&self, flags: ArchMmuFlags) -> Result<(), ArchError> {
        if self.enforce_wx
            && flags.contains(ArchMmuFlags::PERM_WRITE)
            && flags.contains(ArchMmuFlags::PERM_EXECUTE)
        {
            return Err(ArchError::PermissionDenied);
        }
        Ok(())
    }
}

impl ArchAspace for SoftPageTable {
    fn map(
        &self,
        vaddr: usize,
        size: usize,
        pages: &[usize],
        flags: ArchMmuFlags,
    ) -> Result<(), ArchError> {
        let (first, last) = Self::check_range(vaddr, size)?;
        if pages.len() != last - first {
            return Err(ArchError::OutOfRange);
        }
        if pages.iter().any(|pa| !is_page_aligned(*pa)) {
            return Err(ArchError::Unaligned);
        }
        self.check_flags(flags)?;
        let mut inner = self.inner.lock();
        if inner.entries.range(first..last).next().is_some() {
            return Err(ArchError::Overlap);
        }
        #[cfg(feature = "failpoints")]
        if self.fail_map.swap(false, Ordering::SeqCst) {
            return Err(ArchError::Injected);
        }
        for (vpn, paddr) in (first..last).zip(pages.iter().copied()) {
            inner.entries.insert(vpn, Entry { paddr, flags });
        }
        inner.ops.push(ArchOp::Map { vaddr, size, flags });
        Ok(())
    }

    fn protect(&self, vaddr: usize, size: usize, flags: ArchMmuFlags) -> Result<(), ArchError> {
        let (first, last) = Self::check_range(vaddr, size)?;
        self.check_flags(flags)?;
        #[cfg(feature = "failpoints")]
        if self.fail_protect.swap(false, Ordering::SeqCst) {
            return Err(ArchError::Injected);
        }
        let mut inner = self.inner.lock();
        for (_, entry) in inner.entries.range_mut(first..last) {
            entry.flags = flags;
        }
        inner.ops.push(ArchOp::Protect { vaddr, size, flags });
        Ok(())
    }

    fn unmap(&self, vaddr: usize, size: usize) -> Result<(), ArchError> {
        let (first, last) = Self::check_range(vaddr, size)?;
        #[cfg(feature = "failpoints")]
        if self.fail_unmap.swap(false, Ordering::SeqCst) {
            return Err(ArchError::Injected);
        }
        let mut inner = self.inner.lock();
        let doomed: Vec<usize> = inner.entries.range(first..last).map(|(vpn, _)| *vpn).collect();
        for vpn in doomed {
            inner.entries.remove(&vpn);
        }
        inner.ops.push(ArchOp::Unmap { vaddr, size });
        Ok(())
    }
}
