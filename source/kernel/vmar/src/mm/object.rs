// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Backing memory objects referenced by mappings
//! OWNERS: @kernel-mm-team
//! PUBLIC API: VmObject trait, AnonymousObject
//! DEPENDS_ON: spin::Mutex, alloc::sync::Arc
//! INVARIANTS: Objects serialize their own page state; offsets are byte offsets into the object

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use super::error::VmError;
use super::flags::CachePolicy;
use super::node::truncate_name;
use super::{page_align_down, PAGE_SIZE, PAGE_SIZE_SHIFT};

/// Page provider behind a mapping. Shared by every mapping of the object,
/// possibly across address spaces.
pub trait VmObject: Send + Sync {
    /// Size of the object in bytes.
    fn size(&self) -> usize;

    /// Memory type every mapping of this object must use.
    fn cache_policy(&self) -> CachePolicy {
        CachePolicy::Cached
    }

    /// Ensures the page containing `offset` is present and returns its
    /// physical address.
    fn commit_page(&self, offset: usize) -> Result<usize, VmError>;

    /// Physical address of the page containing `offset`, if committed.
    fn lookup_page(&self, offset: usize) -> Option<usize>;

    /// Releases committed pages in `[offset, offset + len)`.
    fn decommit_range(&self, _offset: usize, _len: usize) -> Result<(), VmError> {
        Err(VmError::NotSupported)
    }

    /// Number of committed pages inside `[offset, offset + len)`.
    fn committed_pages(&self, offset: usize, len: usize) -> usize;

    fn name(&self) -> &str {
        ""
    }
}

/// First fake frame handed out by anonymous objects.
const FRAME_BASE: usize = 0x8000_0000;

static NEXT_FRAME: AtomicUsize = AtomicUsize::new(FRAME_BASE);

fn alloc_frame() -> usize {
    NEXT_FRAME.fetch_add(PAGE_SIZE, Ordering::Relaxed)
}

/// Zero-fill-on-demand object with simulated physical frames.
///
/// Frame numbers are unique per boot but do not refer to real memory; the
/// object exists so the region tree can be driven end to end without a
/// physical allocator.
pub struct AnonymousObject {
    size: usize,
    policy: CachePolicy,
    name: String,
    pages: Mutex<BTreeMap<usize, usize>>,
}

impl AnonymousObject {
    /// Creates a cached object of `size` bytes (rounded up to whole pages).
    pub fn new(size: usize) -> Arc<Self> {
        Self::build(size, CachePolicy::Cached, "")
    }

    pub fn with_cache_policy(size: usize, policy: CachePolicy) -> Arc<Self> {
        Self::build(size, policy, "")
    }

    pub fn named(size: usize, name: &str) -> Arc<Self> {
        Self::build(size, CachePolicy::Cached, name)
    }

    fn build(size: usize, policy: CachePolicy, name: &str) -> Arc<Self> {
        let size = super::page_align_up(size).unwrap_or_else(|| page_align_down(usize::MAX));
        Arc::new(Self {
            size,
            policy,
            name: truncate_name(name),
            pages: Mutex::new(BTreeMap::new()),
        })
    }

    fn page_range(&self, offset: usize, len: usize) -> Result<(usize, usize), VmError> {
        let end = offset.checked_add(len).ok_or(VmError::OutOfRange)?;
        if end > self.size {
            return Err(VmError::OutOfRange);
        }
        let end = super::page_align_up(end).ok_or(VmError::OutOfRange)?;
        Ok((offset >> PAGE_SIZE_SHIFT, end >> PAGE_SIZE_SHIFT))
    }
}

impl VmObject for AnonymousObject {
    fn size(&self) -> usize {
        self.size
    }

    fn cache_policy(&self) -> CachePolicy {
        self.policy
    }

    fn commit_page(&self, offset: usize) -> Result<usize, VmError> {
        if offset >= self.size {
            return Err(VmError::OutOfRange);
        }
        let index = offset >> PAGE_SIZE_SHIFT;
        let mut pages = self.pages.lock();
        Ok(*pages.entry(index).or_insert_with(alloc_frame))
    }

    fn lookup_page(&self, offset: usize) -> Option<usize> {
        self.pages.lock().get(&(offset >> PAGE_SIZE_SHIFT)).copied()
    }

    fn decommit_range(&self, offset: usize, len: usize) -> Result<(), VmError> {
        let (first, last) = self.page_range(offset, len)?;
        let mut pages = self.pages.lock();
        let doomed: alloc::vec::Vec<usize> = pages.range(first..last).map(|(k, _)| *k).collect();
        for index in doomed {
            pages.remove(&index);
        }
        Ok(())
    }

    fn committed_pages(&self, offset: usize, len: usize) -> usize {
        let first = offset >> PAGE_SIZE_SHIFT;
        let last = offset.saturating_add(len).saturating_add(PAGE_SIZE - 1) >> PAGE_SIZE_SHIFT;
        self.pages.lock().range(first..last).count()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_is_idempotent_per_page() {
        let obj = AnonymousObject::new(4 * PAGE_SIZE);
        let first = obj.commit_page(PAGE_SIZE + 8).expect("commit");
        assert_eq!(obj.commit_page(PAGE_SIZE).expect("again"), first);
        assert_eq!(obj.lookup_page(PAGE_SIZE), Some(first));
        assert_eq!(obj.committed_pages(0, obj.size()), 1);
    }

    #[test]
    fn commit_past_end_is_out_of_range() {
        let obj = AnonymousObject::new(PAGE_SIZE);
        assert_eq!(obj.commit_page(PAGE_SIZE), Err(VmError::OutOfRange));
        let empty = AnonymousObject::new(0);
        assert_eq!(empty.commit_page(0), Err(VmError::OutOfRange));
    }

    #[test]
    fn decommit_drops_only_the_range() {
        let obj = AnonymousObject::new(4 * PAGE_SIZE);
        for page in 0..4 {
            obj.commit_page(page * PAGE_SIZE).expect("commit");
        }
        obj.decommit_range(PAGE_SIZE, 2 * PAGE_SIZE).expect("decommit");
        assert_eq!(obj.committed_pages(0, 4 * PAGE_SIZE), 2);
        assert!(obj.lookup_page(2 * PAGE_SIZE).is_none());
        assert_eq!(obj.decommit_range(0, 8 * PAGE_SIZE), Err(VmError::OutOfRange));
    }
}
