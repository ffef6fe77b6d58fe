// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Region nodes: child creation, placement, unmap, protect, range operations
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: mm/tests.rs, mm/tests_prop.rs, tests/vmar_scenarios.rs
//! PUBLIC API: VmarHandle, NodeHandle, Backing, RangeOp
//! DEPENDS_ON: mm::aspace::AspaceState, mm::subregion::SubregionSet
//! INVARIANTS: Validation precedes mutation; a child is activated only after it is fully placed
//!
//! Multi-node operations (unmap, protect, range ops) walk the subregion
//! containers with explicit cursors and never recurse. A hardware failure in
//! the middle of such a walk is returned as is; nodes already changed stay
//! changed.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use rand_core::RngCore;

use super::aspace::{AddressSpace, AspaceState};
use super::enumerate::{MappingInfo, RegionInfo, VmEnumerator};
use super::error::VmError;
use super::flags::{ArchMmuFlags, PageFaultFlags, VmarFlags};
use super::mapping::MappingHandle;
use super::node::{MappingData, Node, NodeId, NodeKind, NodeState};
use super::object::{AnonymousObject, VmObject};
use super::subregion::Child;
use super::{intersect, is_page_aligned, page_align_up, PAGE_SIZE_SHIFT};

/// Backing of a new mapping.
#[derive(Clone)]
pub struct Backing {
    pub object: Arc<dyn VmObject>,
    /// Byte offset into `object` of the first mapped page.
    pub object_offset: usize,
    pub arch_flags: ArchMmuFlags,
}

impl Backing {
    pub fn new(object: Arc<dyn VmObject>, object_offset: usize, arch_flags: ArchMmuFlags) -> Self {
        Self { object, object_offset, arch_flags }
    }
}

/// Operation applied by [`VmarHandle::range_op`] to every mapping in a range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeOp {
    /// Release committed pages and their translations.
    Decommit,
    /// Install translations for pages the object already has.
    MapRange,
}

/// Either kind of child.
#[derive(Clone)]
pub enum NodeHandle {
    Region(VmarHandle),
    Mapping(MappingHandle),
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        match self {
            NodeHandle::Region(vmar) => vmar.id(),
            NodeHandle::Mapping(mapping) => mapping.id(),
        }
    }

    pub fn as_region(&self) -> Option<&VmarHandle> {
        match self {
            NodeHandle::Region(vmar) => Some(vmar),
            NodeHandle::Mapping(_) => None,
        }
    }

    pub fn as_mapping(&self) -> Option<&MappingHandle> {
        match self {
            NodeHandle::Mapping(mapping) => Some(mapping),
            NodeHandle::Region(_) => None,
        }
    }

    pub fn base(&self) -> Result<usize, VmError> {
        match self {
            NodeHandle::Region(vmar) => vmar.base(),
            NodeHandle::Mapping(mapping) => mapping.base(),
        }
    }

    pub fn size(&self) -> Result<usize, VmError> {
        match self {
            NodeHandle::Region(vmar) => vmar.size(),
            NodeHandle::Mapping(mapping) => mapping.size(),
        }
    }

    pub fn state(&self) -> NodeState {
        match self {
            NodeHandle::Region(vmar) => vmar.state(),
            NodeHandle::Mapping(mapping) => mapping.state(),
        }
    }
}

/// Handle to a region node.
#[derive(Clone)]
pub struct VmarHandle {
    aspace: Arc<AddressSpace>,
    id: NodeId,
}

const SUBREGION_FLAGS: VmarFlags = VmarFlags::SPECIFIC
    .union(VmarFlags::CAN_MAP_SPECIFIC)
    .union(VmarFlags::COMPACT)
    .union(VmarFlags::CAN_RWX)
    .union(VmarFlags::OFFSET_IS_UPPER_LIMIT);

const MAPPING_FLAGS: VmarFlags = VmarFlags::SPECIFIC
    .union(VmarFlags::SPECIFIC_OVERWRITE)
    .union(VmarFlags::CAN_RWX)
    .union(VmarFlags::OFFSET_IS_UPPER_LIMIT);

impl VmarHandle {
    pub(crate) fn new(aspace: Arc<AddressSpace>, id: NodeId) -> Self {
        Self { aspace, id }
    }

    fn wrap(&self, id: NodeId, is_mapping: bool) -> NodeHandle {
        let aspace = Arc::clone(&self.aspace);
        if is_mapping {
            NodeHandle::Mapping(MappingHandle::new(aspace, id))
        } else {
            NodeHandle::Region(VmarHandle::new(aspace, id))
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn aspace(&self) -> &Arc<AddressSpace> {
        &self.aspace
    }

    pub fn state(&self) -> NodeState {
        self.aspace.lock().nodes.state(self.id)
    }

    pub fn base(&self) -> Result<usize, VmError> {
        Ok(self.aspace.lock().alive(self.id)?.base)
    }

    pub fn size(&self) -> Result<usize, VmError> {
        Ok(self.aspace.lock().alive(self.id)?.size)
    }

    pub fn flags(&self) -> Result<VmarFlags, VmError> {
        Ok(self.aspace.lock().alive(self.id)?.flags)
    }

    pub fn name(&self) -> Result<String, VmError> {
        let state = self.aspace.lock();
        let node = state.alive(self.id)?;
        Ok(node.as_region().map(|r| r.name.clone()).unwrap_or_default())
    }

    pub fn has_parent(&self) -> Result<bool, VmError> {
        Ok(self.aspace.lock().alive(self.id)?.parent.is_some())
    }

    /// Direct children in address order.
    pub fn children(&self) -> Vec<NodeHandle> {
        let state = self.aspace.lock();
        if state.alive(self.id).is_err() {
            return Vec::new();
        }
        state
            .subregions(self.id)
            .iter()
            .map(|child| self.wrap(child.id, state.get(child.id).is_mapping()))
            .collect()
    }

    /// Creates a child region.
    pub fn create_subregion(
        &self,
        offset: usize,
        size: usize,
        align_pow2: u8,
        flags: VmarFlags,
        name: &str,
    ) -> Result<VmarHandle, VmError> {
        if !SUBREGION_FLAGS.contains(flags) {
            return Err(VmError::InvalidArgument);
        }
        let mut state = self.aspace.lock();
        let id = state.create_child(self.id, offset, size, align_pow2, flags, None, name)?;
        Ok(VmarHandle::new(Arc::clone(&self.aspace), id))
    }

    /// Maps `backing` into this region.
    ///
    /// `size` is rounded up to whole pages. The mapping receives the
    /// `CAN_MAP_*` capabilities matching `backing.arch_flags`.
    pub fn create_mapping(
        &self,
        offset: usize,
        size: usize,
        align_pow2: u8,
        flags: VmarFlags,
        backing: Backing,
        name: &str,
    ) -> Result<MappingHandle, VmError> {
        if !MAPPING_FLAGS.contains(flags) {
            return Err(VmError::InvalidArgument);
        }
        let mut state = self.aspace.lock();
        let id = state.create_child(self.id, offset, size, align_pow2, flags, Some(backing), name)?;
        Ok(MappingHandle::new(Arc::clone(&self.aspace), id))
    }

    /// Creates a region (`backing` is `None`) or mapping without the
    /// per-kind flag filtering of `create_subregion`/`create_mapping`.
    /// Size, permission and capability handling match those calls.
    pub fn create_child(
        &self,
        offset: usize,
        size: usize,
        align_pow2: u8,
        flags: VmarFlags,
        backing: Option<Backing>,
        name: &str,
    ) -> Result<NodeHandle, VmError> {
        let is_mapping = backing.is_some();
        let mut state = self.aspace.lock();
        let id = state.create_child(self.id, offset, size, align_pow2, flags, backing, name)?;
        Ok(self.wrap(id, is_mapping))
    }

    /// Destroys this region and every descendant.
    pub fn destroy(&self) -> Result<(), VmError> {
        let mut state = self.aspace.lock();
        state.alive(self.id)?;
        state.destroy_region(self.id)
    }

    /// Removes everything in `[base, base + size)`.
    ///
    /// Mappings straddling the range are trimmed. Regions fully inside the
    /// range are destroyed. A region straddling the range is an error
    /// unless `allow_partial_regions` is set, in which case the unmap
    /// continues inside it.
    pub fn unmap(&self, base: usize, size: usize, allow_partial_regions: bool) -> Result<(), VmError> {
        let size = round_range(base, size)?;
        let mut state = self.aspace.lock();
        state.alive(self.id)?;
        state.unmap_range(self.id, base, size, true, allow_partial_regions)
    }

    /// Changes the hardware flags of the mappings covering `[base, base + size)`.
    pub fn protect(&self, base: usize, size: usize, arch_flags: ArchMmuFlags) -> Result<(), VmError> {
        let size = round_range(base, size)?;
        let mut state = self.aspace.lock();
        state.alive(self.id)?;
        state.protect_range(self.id, base, size, arch_flags)
    }

    pub fn page_fault(&self, addr: usize, flags: PageFaultFlags) -> Result<(), VmError> {
        self.aspace.lock().page_fault(self.id, addr, flags)
    }

    /// Visits every descendant in address order, depth first. Direct children
    /// are reported at `starting_depth`. Returns `false` if the visitor
    /// stopped the walk.
    ///
    /// The visitor runs under the space lock and must not call back into
    /// this address space.
    pub fn for_each<V: VmEnumerator + ?Sized>(&self, visitor: &mut V, starting_depth: usize) -> bool {
        let state = self.aspace.lock();
        if state.alive(self.id).is_err() {
            return true;
        }
        state.walk(self.id, starting_depth, |id, node, depth| match &node.kind {
            NodeKind::Region(region) => visitor.on_region(
                &RegionInfo {
                    id,
                    base: node.base,
                    size: node.size,
                    flags: node.flags,
                    name: &region.name,
                },
                depth,
            ),
            NodeKind::Mapping(mapping) => visitor.on_mapping(
                &MappingInfo {
                    id,
                    base: node.base,
                    size: node.size,
                    flags: node.flags,
                    arch_flags: mapping.arch_flags,
                    object_offset: mapping.object_offset,
                    object: mapping.object.as_ref(),
                },
                depth,
            ),
        })
    }

    /// Applies `op` to the mappings covering `[base, base + size)`.
    pub fn range_op(&self, op: RangeOp, base: usize, size: usize) -> Result<(), VmError> {
        let size = round_range(base, size)?;
        let mut state = self.aspace.lock();
        state.alive(self.id)?;
        state.range_op(self.id, op, base, size)
    }

    /// Direct child containing `addr`.
    pub fn find_region(&self, addr: usize) -> Option<NodeHandle> {
        let state = self.aspace.lock();
        state.alive(self.id).ok()?;
        let child = state.subregions(self.id).find(addr)?;
        Some(self.wrap(child.id, state.get(child.id).is_mapping()))
    }

    /// Committed pages visible through mappings in this subtree.
    pub fn allocated_pages(&self) -> usize {
        let state = self.aspace.lock();
        if state.alive(self.id).is_err() {
            return 0;
        }
        let mut pages = 0;
        state.walk(self.id, 0, |_, node, _| {
            if let Some(mapping) = node.as_mapping() {
                pages += mapping.object.committed_pages(mapping.object_offset, node.size);
            }
            true
        });
        pages
    }

    /// Logs this region and its subtree, one line per node.
    pub fn dump(&self) {
        let state = self.aspace.lock();
        let Ok(node) = state.alive(self.id) else {
            return;
        };
        log_info!(target: "vm", "{}", DumpLine { node, depth: 0 });
        state.walk(self.id, 1, |_, node, depth| {
            log_info!(target: "vm", "{}", DumpLine { node, depth });
            true
        });
    }

    /// Records an already-populated range (for example one set up by early
    /// boot) as a mapping, then applies `arch_flags` to it.
    pub fn reserve_space(
        &self,
        name: &str,
        base: usize,
        size: usize,
        arch_flags: ArchMmuFlags,
    ) -> Result<MappingHandle, VmError> {
        let offset = {
            let state = self.aspace.lock();
            let node = state.alive(self.id)?;
            if !node.in_range(base, size) {
                return Err(VmError::InvalidArgument);
            }
            base - node.base
        };
        let object: Arc<dyn VmObject> = AnonymousObject::named(0, name);
        let mapping = self.create_mapping(
            offset,
            size,
            0,
            VmarFlags::SPECIFIC | VmarFlags::CAN_RWX,
            Backing::new(object, 0, ArchMmuFlags::PERM_RWX),
            name,
        )?;
        let (base, size) = (mapping.base()?, mapping.size()?);
        mapping.protect(base, size, arch_flags)?;
        Ok(mapping)
    }
}

/// Page-rounds `size` and checks `base`; returns the rounded size.
pub(crate) fn round_range(base: usize, size: usize) -> Result<usize, VmError> {
    let size = page_align_up(size).ok_or(VmError::InvalidArgument)?;
    if size == 0 || !is_page_aligned(base) {
        return Err(VmError::InvalidArgument);
    }
    Ok(size)
}

struct DumpLine<'a> {
    node: &'a Node,
    depth: usize,
}

impl core::fmt::Display for DumpLine<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let indent = self.depth * 2;
        let node = self.node;
        match &node.kind {
            NodeKind::Region(region) => write!(
                f,
                "{:indent$}region '{}' [{:#x}, {:#x}) {:?}",
                "",
                region.name,
                node.base,
                node.end(),
                node.flags
            ),
            NodeKind::Mapping(mapping) => write!(
                f,
                "{:indent$}mapping [{:#x}, {:#x}) {:?} object '{}' +{:#x} committed {}",
                "",
                node.base,
                node.end(),
                mapping.arch_flags,
                mapping.object.name(),
                mapping.object_offset,
                mapping.object.committed_pages(mapping.object_offset, node.size)
            ),
        }
    }
}

/// Result of verifying one gap.
enum GapCheck {
    Found(usize),
    /// Neighbours are contiguous.
    NextGap,
    NotFound,
}

impl AspaceState {
    /// Validates, places and activates a new child of `parent`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create_child(
        &mut self,
        parent: NodeId,
        offset: usize,
        size: usize,
        align_pow2: u8,
        flags: VmarFlags,
        backing: Option<Backing>,
        name: &str,
    ) -> Result<NodeId, VmError> {
        let node = self.alive(parent)?;
        if node.as_region().is_none() {
            return Err(VmError::BadState);
        }
        let (parent_base, parent_size, parent_flags) = (node.base, node.size, node.flags);

        let (size, flags) = match &backing {
            None => {
                if !is_page_aligned(size) {
                    return Err(VmError::InvalidArgument);
                }
                (size, flags)
            }
            Some(backing) => {
                if !parent_flags.allows(backing.arch_flags) {
                    return Err(VmError::AccessDenied);
                }
                // Overflow rounds to zero, rejected below.
                let size = page_align_up(size).unwrap_or(0);
                if !is_page_aligned(backing.object_offset)
                    || backing.object_offset.checked_add(size).is_none()
                {
                    return Err(VmError::InvalidArgument);
                }
                (size, flags | VmarFlags::capabilities_for(backing.arch_flags))
            }
        };

        if size == 0 {
            return Err(VmError::InvalidArgument);
        }
        if !parent_flags.contains(flags.intersection(VmarFlags::CAN_RWX)) {
            return Err(VmError::AccessDenied);
        }

        let is_overwrite = flags.contains(VmarFlags::SPECIFIC_OVERWRITE);
        let is_specific = flags.contains(VmarFlags::SPECIFIC) || is_overwrite;
        let is_upper_bound = flags.contains(VmarFlags::OFFSET_IS_UPPER_LIMIT);
        if is_specific && is_upper_bound {
            return Err(VmError::InvalidArgument);
        }
        if !is_specific && !is_upper_bound && offset != 0 {
            return Err(VmError::InvalidArgument);
        }
        if !is_page_aligned(offset) || u32::from(align_pow2) >= usize::BITS {
            return Err(VmError::InvalidArgument);
        }

        let mut arch_flags = ArchMmuFlags::empty();
        if let Some(backing) = &backing {
            let policy = backing.object.cache_policy();
            let requested = backing.arch_flags.intersection(ArchMmuFlags::CACHE_MASK);
            if !requested.is_empty() && requested != policy.bits() {
                log_warn!(
                    target: "vm",
                    "mapping '{}' has conflicting cache policies: object {:?} flags {:?}",
                    name,
                    policy,
                    requested.cache_policy()
                );
            }
            arch_flags = backing.arch_flags.with_cache_policy(policy);
        }

        if (is_specific || is_upper_bound) && !parent_flags.contains(VmarFlags::CAN_MAP_SPECIFIC) {
            return Err(VmError::AccessDenied);
        }

        if !is_upper_bound && (offset >= parent_size || size > parent_size - offset) {
            return Err(VmError::InvalidArgument);
        }
        if is_upper_bound && (offset > parent_size || size > offset) {
            return Err(VmError::InvalidArgument);
        }

        let is_privileged = match (&backing, &self.privileged_image) {
            (Some(backing), Some(image)) => {
                arch_flags.contains(ArchMmuFlags::PERM_EXECUTE) && image.is_image(&backing.object)
            }
            _ => false,
        };
        if is_privileged {
            let valid = self.privileged_mapping.is_none()
                && !arch_flags.contains(ArchMmuFlags::PERM_WRITE)
                && backing
                    .as_ref()
                    .zip(self.privileged_image.as_ref())
                    .is_some_and(|(b, image)| image.is_code_range(b.object_offset, size));
            if !valid {
                log_warn!(target: "vm", "rejected privileged mapping '{}'", name);
                return Err(VmError::AccessDenied);
            }
        }

        let mut overwrite = false;
        let base = if is_specific {
            let base = parent_base + offset;
            if align_pow2 > 0 && base & ((1usize << align_pow2) - 1) != 0 {
                return Err(VmError::InvalidArgument);
            }
            if !self.subregions(parent).is_range_available(base, size) {
                if !(is_overwrite && backing.is_some()) {
                    return Err(VmError::OutOfSpace);
                }
                overwrite = true;
            }
            base
        } else {
            let upper_limit = if is_upper_bound { parent_base + offset } else { usize::MAX };
            self.alloc_spot(parent, size, align_pow2, arch_flags, upper_limit)?
        };

        let kind = if backing.is_some() { "mapping" } else { "region" };
        let child = match backing {
            Some(backing) => Node::mapping(
                base,
                size,
                flags,
                parent,
                MappingData { object: backing.object, object_offset: backing.object_offset, arch_flags },
            ),
            None => Node::region(base, size, flags, Some(parent), name),
        };
        let id = self.nodes.insert(child)?;

        if overwrite {
            if let Err(err) = self.unmap_range(parent, base, size, false, false) {
                drop(self.nodes.release(id));
                return Err(err);
            }
        }
        if is_privileged {
            self.privileged_mapping = Some(id);
        }
        self.activate(id);
        log_debug!(
            target: "vm",
            "{} '{}' at [{:#x}, {:#x}){}",
            kind,
            name,
            base,
            base + size,
            if overwrite { " (overwrite)" } else { "" }
        );
        Ok(id)
    }

    /// Finds a base for `size` bytes inside region `id`, below `upper_limit`.
    fn alloc_spot(
        &mut self,
        id: NodeId,
        size: usize,
        align_pow2: u8,
        arch_flags: ArchMmuFlags,
        upper_limit: usize,
    ) -> Result<usize, VmError> {
        let align_pow2 = align_pow2.max(PAGE_SIZE_SHIFT);
        let align = 1usize << align_pow2;
        let node = self.nodes.get(id).ok_or(VmError::BadState)?;
        let Some(region) = node.as_region() else {
            return Err(VmError::BadState);
        };
        let entropy = self.aslr.entropy_for(node.flags);
        let rng: Option<&mut (dyn RngCore + Send)> = match self.prng.as_mut() {
            Some(rng) if self.aslr.enabled => Some(&mut **rng),
            _ => None,
        };
        let candidate = region.subregions.get_alloc_spot(
            align_pow2,
            entropy,
            size,
            node.base,
            node.size,
            rng,
            upper_limit,
        )?;

        let last = match candidate.checked_add(size - 1) {
            Some(last) => last,
            None => panic!("allocation candidate {candidate:#x} overflows"),
        };
        let next = region.subregions.upper_bound(last);
        let prev = region.subregions.at_or_below(last);
        match self.check_gap(id, prev, next, candidate, upper_limit, align, size, arch_flags) {
            GapCheck::Found(spot) => Ok(spot),
            GapCheck::NextGap | GapCheck::NotFound => {
                log_error!(
                    target: "vm",
                    "candidate {:#x}+{:#x} rejected by gap check",
                    candidate,
                    size
                );
                panic!("allocation candidate {candidate:#x} rejected by gap check")
            }
        }
    }

    /// Verifies the gap between `prev` and `next` inside region `id` and asks
    /// the hardware layer for an exact spot in `[search_base, upper_limit)`.
    #[allow(clippy::too_many_arguments)]
    fn check_gap(
        &self,
        id: NodeId,
        prev: Option<Child>,
        next: Option<Child>,
        search_base: usize,
        upper_limit: usize,
        align: usize,
        size: usize,
        arch_flags: ArchMmuFlags,
    ) -> GapCheck {
        let region = self.get(id);
        let gap_start = prev.map_or(region.base, |p| p.end());
        let gap_end = match next {
            Some(next) if next.base == gap_start => return GapCheck::NextGap,
            Some(next) => next.base,
            None if gap_start == region.end() => return GapCheck::NotFound,
            None => region.end(),
        };
        let gap_end = gap_end.min(upper_limit);
        if gap_end <= search_base {
            return GapCheck::NotFound;
        }
        let gap_start = gap_start.max(search_base);

        let neighbour_flags = |child: Option<Child>| {
            child
                .and_then(|c| self.nodes.get(c.id))
                .and_then(|n| n.as_mapping())
                .map(|m| m.arch_flags)
        };
        let spot = self.arch.pick_spot(
            gap_start,
            neighbour_flags(prev),
            gap_end,
            neighbour_flags(next),
            align,
            size,
            arch_flags,
        );
        match spot.checked_add(size) {
            Some(end) if spot >= gap_start && end <= gap_end => GapCheck::Found(spot),
            _ => GapCheck::NotFound,
        }
    }

    /// Unmaps `[base, base + size)` below region `id`.
    ///
    /// `can_destroy_regions` is false on the overwrite path, where any
    /// region in the range is an error.
    pub(crate) fn unmap_range(
        &mut self,
        id: NodeId,
        base: usize,
        size: usize,
        can_destroy_regions: bool,
        allow_partial_regions: bool,
    ) -> Result<(), VmError> {
        if !self.get(id).in_range(base, size) {
            return Err(VmError::InvalidArgument);
        }
        if self.subregions(id).is_empty() {
            return Ok(());
        }
        if self.intersects_privileged(base, size) {
            return Err(VmError::AccessDenied);
        }
        let end = base + size;
        let last = end - 1;

        if !allow_partial_regions {
            let mut cursor = self.subregions(id).include_or_higher(base);
            while let Some(child) = cursor.filter(|c| c.base <= last) {
                let straddles = child.base < base || child.end() > end;
                if !self.get(child.id).is_mapping() && (!can_destroy_regions || straddles) {
                    return Err(VmError::InvalidArgument);
                }
                cursor = self.subregions(id).upper_bound(child.base);
            }
        }

        let mut level = id;
        let mut cursor = self.subregions(id).include_or_higher(base);
        loop {
            let Some(child) = cursor.filter(|c| c.base <= last) else {
                if level == id {
                    break;
                }
                let node = self.get(level);
                let (level_base, parent) = (node.base, node.parent);
                level = match parent {
                    Some(parent) => parent,
                    None => panic!("unmap walked above the root"),
                };
                cursor = self.subregions(level).upper_bound(level_base);
                continue;
            };
            let following = self.subregions(level).upper_bound(child.base);
            let fully_covered = child.base >= base && child.end() <= end;

            if self.get(child.id).is_mapping() {
                if fully_covered {
                    self.destroy_mapping(child.id)?;
                } else if let Some((ubase, ulen)) = intersect(base, size, child.base, child.size) {
                    self.unmap_mapping_range(child.id, ubase, ulen)?;
                }
                cursor = following;
            } else if fully_covered && can_destroy_regions {
                self.destroy_region(child.id)?;
                cursor = following;
            } else if allow_partial_regions && !self.subregions(child.id).is_empty() {
                level = child.id;
                cursor = self.subregions(level).include_or_higher(base);
            } else {
                cursor = following;
            }
        }
        assert_eq!(level, id, "unmap ended below its starting region");
        Ok(())
    }

    /// Protects the mappings covering `[base, base + size)` below region `id`.
    pub(crate) fn protect_range(
        &mut self,
        id: NodeId,
        base: usize,
        size: usize,
        arch_flags: ArchMmuFlags,
    ) -> Result<(), VmError> {
        if !self.get(id).in_range(base, size) {
            return Err(VmError::InvalidArgument);
        }
        if self.subregions(id).is_empty() {
            return Err(VmError::NotFound);
        }
        let end = base + size;

        let mut covered = base;
        let mut cursor = self.subregions(id).include_or_higher(base);
        while let Some(child) = cursor.filter(|c| c.base < end) {
            if child.base > covered {
                return Err(VmError::NotFound);
            }
            let node = self.get(child.id);
            if !node.is_mapping() {
                return Err(VmError::InvalidArgument);
            }
            if !node.flags.allows(arch_flags) || self.privileged_mapping == Some(child.id) {
                return Err(VmError::AccessDenied);
            }
            covered = child.end();
            cursor = self.subregions(id).upper_bound(child.base);
        }
        if covered < end {
            return Err(VmError::NotFound);
        }

        let mut cursor = self.subregions(id).include_or_higher(base);
        while let Some(child) = cursor.filter(|c| c.base < end) {
            if let Some((pbase, psize)) = intersect(base, size, child.base, child.size) {
                self.protect_mapping_range(child.id, pbase, psize, arch_flags)?;
            }
            // Split pieces stay below the old end of the child.
            cursor = self.subregions(id).include_or_higher(child.end());
        }
        Ok(())
    }

    /// Runs `op` over the mappings covering `[base, base + size)` below region `id`.
    pub(crate) fn range_op(
        &mut self,
        id: NodeId,
        op: RangeOp,
        base: usize,
        size: usize,
    ) -> Result<(), VmError> {
        if !self.get(id).in_range(base, size) {
            return Err(VmError::OutOfRange);
        }
        if self.subregions(id).is_empty() {
            return Err(VmError::BadState);
        }
        if self.intersects_privileged(base, size) {
            return Err(VmError::AccessDenied);
        }
        let end = base + size;

        let mut targets: Vec<(NodeId, usize, usize)> = Vec::new();
        let mut covered = base;
        let mut cursor = self.subregions(id).include_or_higher(base);
        while let Some(child) = cursor.filter(|c| c.base < end) {
            let node = self.get(child.id);
            if !node.is_mapping() {
                return Err(VmError::BadState);
            }
            if child.base > covered {
                return Err(VmError::NotFound);
            }
            if op == RangeOp::Decommit && !node.flags.contains(VmarFlags::CAN_MAP_WRITE) {
                return Err(VmError::AccessDenied);
            }
            if let Some((obase, osize)) = intersect(base, size, child.base, child.size) {
                targets.try_reserve(1).map_err(|_| VmError::OutOfMemory)?;
                targets.push((child.id, obase, osize));
            }
            covered = child.end();
            cursor = self.subregions(id).upper_bound(child.base);
        }
        if covered < end {
            return Err(VmError::NotFound);
        }

        for (mapping, obase, osize) in targets {
            match op {
                RangeOp::Decommit => {
                    let node = self.get(mapping);
                    let Some(data) = node.as_mapping() else {
                        return Err(VmError::BadState);
                    };
                    let offset = data.object_offset + (obase - node.base);
                    data.object.decommit_range(offset, osize)?;
                    self.arch.unmap(obase, osize)?;
                }
                RangeOp::MapRange => {
                    let mapping_base = self.get(mapping).base;
                    self.map_mapping_range(mapping, obase - mapping_base, osize, false)?;
                }
            }
        }
        log_trace!(target: "vm", "{:?} [{:#x}, {:#x})", op, base, end);
        Ok(())
    }

    /// Pre-order walk of the subtree below region `id`. Direct children are
    /// reported at `starting_depth`; `f` returns `false` to stop.
    pub(crate) fn walk(
        &self,
        id: NodeId,
        starting_depth: usize,
        mut f: impl FnMut(NodeId, &Node, usize) -> bool,
    ) -> bool {
        let mut depth = starting_depth;
        let mut level = id;
        let mut cursor = self.subregions(id).first();
        loop {
            let Some(child) = cursor else {
                if level == id {
                    return true;
                }
                let node = self.get(level);
                let level_base = node.base;
                level = match node.parent {
                    Some(parent) => parent,
                    None => panic!("walk climbed above the root"),
                };
                depth -= 1;
                cursor = self.subregions(level).upper_bound(level_base);
                continue;
            };
            let node = self.get(child.id);
            if !f(child.id, node, depth) {
                return false;
            }
            match node.as_region() {
                Some(region) if !region.subregions.is_empty() => {
                    level = child.id;
                    depth += 1;
                    cursor = region.subregions.first();
                }
                _ => cursor = self.subregions(level).upper_bound(child.base),
            }
        }
    }
}
