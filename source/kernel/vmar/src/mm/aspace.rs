// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address space owning one VMAR tree
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: mm/tests.rs, tests/vmar_scenarios.rs
//! PUBLIC API: AddressSpace::new(), with_seeded_aslr(), root_vmar(), page_fault(), destroy()
//! DEPENDS_ON: sync::AspaceLock, mm::node::NodeArena, mm::arch::ArchAspace, rand_core
//! INVARIANTS: Every tree operation runs under the single space lock; the root has no parent
//!
//! The address space owns the node arena, the hardware layer, the ASLR
//! source and the privileged-image record. Handles ([`VmarHandle`],
//! [`MappingHandle`]) keep the space alive through an `Arc` and resolve
//! their node through the arena on every call.

use alloc::boxed::Box;
use alloc::sync::Arc;

use rand_core::RngCore;

use crate::determinism;
use crate::sync::{AspaceLock, AspaceLockGuard, LockStats};

use super::arch::ArchAspace;
use super::config::{AslrConfig, AspaceConfig};
use super::error::{ArchError, VmError};
use super::flags::{ArchMmuFlags, PageFaultFlags, VmarFlags};
use super::mapping::MappingHandle;
use super::node::{Node, NodeArena, NodeId, NodeState};
use super::object::VmObject;
use super::subregion::SubregionSet;
use super::vmar::VmarHandle;
use super::{intersect, page_align_down, PAGE_SIZE};

/// Image whose executable mapping is special: at most one per space,
/// covering exactly the code range, and immune to unmap and protect once
/// established.
#[derive(Clone)]
pub struct PrivilegedImage {
    object: Arc<dyn VmObject>,
    code_offset: usize,
    code_size: usize,
}

impl PrivilegedImage {
    pub fn new(object: Arc<dyn VmObject>, code_offset: usize, code_size: usize) -> Self {
        Self { object, code_offset, code_size }
    }

    pub(crate) fn is_image(&self, object: &Arc<dyn VmObject>) -> bool {
        Arc::as_ptr(&self.object) as *const u8 == Arc::as_ptr(object) as *const u8
    }

    pub(crate) fn is_code_range(&self, object_offset: usize, size: usize) -> bool {
        object_offset == self.code_offset && size == self.code_size
    }
}

pub(crate) struct AspaceState {
    pub nodes: NodeArena,
    pub root: NodeId,
    pub arch: Box<dyn ArchAspace>,
    pub aslr: AslrConfig,
    pub prng: Option<Box<dyn RngCore + Send>>,
    pub privileged_image: Option<PrivilegedImage>,
    pub privileged_mapping: Option<NodeId>,
}

/// One virtual address space.
pub struct AddressSpace {
    name: &'static str,
    state: AspaceLock<AspaceState>,
}

impl AddressSpace {
    /// Creates a space whose root region covers `config.base..config.base + config.size`.
    ///
    /// `prng` feeds randomized placement; without one placement is first fit
    /// even when ASLR is enabled.
    pub fn new(
        config: AspaceConfig,
        arch: Box<dyn ArchAspace>,
        prng: Option<Box<dyn RngCore + Send>>,
    ) -> Result<Arc<Self>, VmError> {
        config.validate()?;
        let mut nodes = NodeArena::new();
        let mut root = Node::region(
            config.base,
            config.size,
            config.root_flags | VmarFlags::CAN_RWX,
            None,
            config.name,
        );
        root.state = NodeState::Alive;
        let root = nodes.insert(root)?;
        log_info!(
            target: "vm-aspace",
            "aspace {}: root [{:#x}, {:#x}) aslr={} entropy={}/{}",
            config.name,
            config.base,
            config.base + config.size,
            config.aslr.enabled && prng.is_some(),
            config.aslr.entropy_bits,
            config.aslr.compact_entropy_bits
        );
        Ok(Arc::new(Self {
            name: config.name,
            state: AspaceLock::new(AspaceState {
                nodes,
                root,
                arch,
                aslr: config.aslr,
                prng,
                privileged_image: None,
                privileged_mapping: None,
            }),
        }))
    }

    /// Creates a space drawing placement entropy from the deterministic seed.
    pub fn with_seeded_aslr(
        config: AspaceConfig,
        arch: Box<dyn ArchAspace>,
    ) -> Result<Arc<Self>, VmError> {
        Self::new(config, arch, Some(Box::new(determinism::seeded_prng())))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Handle to the root region.
    pub fn root_vmar(self: &Arc<Self>) -> VmarHandle {
        let root = self.lock().root;
        VmarHandle::new(Arc::clone(self), root)
    }

    /// Registers the image whose executable mapping becomes privileged.
    /// Fails with `BadState` once a privileged mapping exists.
    pub fn set_privileged_image(&self, image: PrivilegedImage) -> Result<(), VmError> {
        let mut state = self.lock();
        if state.privileged_mapping.is_some() {
            return Err(VmError::BadState);
        }
        state.privileged_image = Some(image);
        Ok(())
    }

    /// Handle to the privileged mapping, if one has been established.
    pub fn privileged_mapping(self: &Arc<Self>) -> Option<MappingHandle> {
        let id = self.lock().privileged_mapping?;
        Some(MappingHandle::new(Arc::clone(self), id))
    }

    /// Resolves a fault at `addr` starting from the root region.
    pub fn page_fault(&self, addr: usize, flags: PageFaultFlags) -> Result<(), VmError> {
        let mut state = self.lock();
        let root = state.root;
        state.page_fault(root, addr, flags)
    }

    /// Destroys the whole tree, root included.
    pub fn destroy(&self) -> Result<(), VmError> {
        let mut state = self.lock();
        let root = state.root;
        state.alive(root)?;
        state.destroy_region(root)?;
        log_info!(target: "vm-aspace", "aspace {} destroyed", self.name);
        Ok(())
    }

    pub fn is_aslr_enabled(&self) -> bool {
        let state = self.lock();
        state.aslr.enabled && state.prng.is_some()
    }

    /// Number of live nodes, root included.
    pub fn node_count(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn lock_stats(&self) -> LockStats {
        self.state.stats()
    }

    pub(crate) fn lock(&self) -> AspaceLockGuard<'_, AspaceState> {
        self.state.lock()
    }
}

impl AspaceState {
    /// Node behind `id`; stale ids are an invariant violation here.
    pub(crate) fn get(&self, id: NodeId) -> &Node {
        match self.nodes.get(id) {
            Some(node) => node,
            None => panic!("stale node {id:?} reachable from the tree"),
        }
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> &mut Node {
        match self.nodes.get_mut(id) {
            Some(node) => node,
            None => panic!("stale node {id:?} reachable from the tree"),
        }
    }

    /// Node behind `id` if it is alive.
    pub(crate) fn alive(&self, id: NodeId) -> Result<&Node, VmError> {
        self.nodes.get(id).filter(|node| node.is_alive()).ok_or(VmError::BadState)
    }

    /// Children of the region `id`.
    pub(crate) fn subregions(&self, id: NodeId) -> &SubregionSet {
        match self.get(id).as_region() {
            Some(region) => &region.subregions,
            None => panic!("node {id:?} is not a region"),
        }
    }

    pub(crate) fn subregions_mut(&mut self, id: NodeId) -> &mut SubregionSet {
        match self.get_mut(id).as_region_mut() {
            Some(region) => &mut region.subregions,
            None => panic!("node {id:?} is not a region"),
        }
    }

    /// Makes a `NotReady` node reachable from its parent.
    pub(crate) fn activate(&mut self, id: NodeId) {
        let node = self.get_mut(id);
        assert_eq!(node.state, NodeState::NotReady, "activating {id:?} twice");
        node.state = NodeState::Alive;
        let (base, size, parent) = (node.base, node.size, node.parent);
        if let Some(parent) = parent {
            self.subregions_mut(parent).insert(base, size, id);
        }
    }

    /// Unlinks `id` from its parent, marks it dead and frees its slot.
    pub(crate) fn detach(&mut self, id: NodeId) {
        let node = self.get_mut(id);
        node.state = NodeState::Dead;
        let (base, parent) = (node.base, node.parent);
        if let Some(parent) = parent {
            self.subregions_mut(parent).remove(base, id);
        }
        if self.privileged_mapping == Some(id) {
            self.privileged_mapping = None;
        }
        // Dropping the node releases its object reference.
        drop(self.nodes.release(id));
    }

    /// True if `[base, base + size)` touches the privileged mapping.
    pub(crate) fn intersects_privileged(&self, base: usize, size: usize) -> bool {
        self.privileged_mapping
            .and_then(|id| self.nodes.get(id))
            .is_some_and(|node| intersect(base, size, node.base, node.size).is_some())
    }

    /// Removes the translations of mapping `id` and detaches it.
    pub(crate) fn destroy_mapping(&mut self, id: NodeId) -> Result<(), VmError> {
        let (base, size) = {
            let node = self.alive(id)?;
            debug_assert!(node.is_mapping());
            (node.base, node.size)
        };
        self.arch.unmap(base, size)?;
        self.detach(id);
        log_trace!(target: "vm", "mapping [{:#x}, {:#x}) destroyed", base, base + size);
        Ok(())
    }

    /// Destroys region `target` and everything below it, bottom-up.
    ///
    /// A failing mapping teardown stops the walk; nodes destroyed so far
    /// stay destroyed.
    pub(crate) fn destroy_region(&mut self, target: NodeId) -> Result<(), VmError> {
        let mut cur = target;
        loop {
            let mut child_region = None;
            while let Some(first) = self.subregions(cur).first() {
                if self.get(first.id).is_mapping() {
                    self.destroy_mapping(first.id)?;
                } else {
                    child_region = Some(first.id);
                    break;
                }
            }
            if let Some(child) = child_region {
                cur = child;
                continue;
            }

            let node = self.get(cur);
            let parent = node.parent;
            log_debug!(
                target: "vm",
                "region '{}' [{:#x}, {:#x}) destroyed",
                node.as_region().map_or("", |r| r.name.as_str()),
                node.base,
                node.end()
            );
            self.detach(cur);
            if cur == target {
                return Ok(());
            }
            cur = match parent {
                Some(parent) => parent,
                None => panic!("descendant {cur:?} of {target:?} has no parent"),
            };
        }
    }

    /// Walks down from region `id` to the mapping containing `addr`.
    pub(crate) fn page_fault(
        &mut self,
        id: NodeId,
        addr: usize,
        flags: PageFaultFlags,
    ) -> Result<(), VmError> {
        self.alive(id)?;
        let mut cur = id;
        loop {
            let Some(child) = self.subregions(cur).find(addr) else {
                log_debug!(target: "vm-fault", "no mapping at {:#x}", addr);
                return Err(VmError::NotFound);
            };
            if self.get(child.id).is_mapping() {
                return self.mapping_page_fault(child.id, addr, flags);
            }
            cur = child.id;
        }
    }

    fn mapping_page_fault(
        &mut self,
        id: NodeId,
        addr: usize,
        flags: PageFaultFlags,
    ) -> Result<(), VmError> {
        let node = self.get(id);
        let Some(mapping) = node.as_mapping() else {
            return Err(VmError::BadState);
        };
        let perms = mapping.arch_flags;
        let denied = (flags.contains(PageFaultFlags::WRITE) && !perms.contains(ArchMmuFlags::PERM_WRITE))
            || (flags.contains(PageFaultFlags::INSTRUCTION)
                && !perms.contains(ArchMmuFlags::PERM_EXECUTE))
            || (!flags.intersects(PageFaultFlags::WRITE | PageFaultFlags::INSTRUCTION)
                && !perms.contains(ArchMmuFlags::PERM_READ))
            || (flags.contains(PageFaultFlags::USER) && !perms.contains(ArchMmuFlags::PERM_USER));
        if denied {
            log_debug!(
                target: "vm-fault",
                "fault {:?} at {:#x} denied by {:?}",
                flags,
                addr,
                perms
            );
            return Err(VmError::AccessDenied);
        }

        let page = page_align_down(addr);
        let offset = mapping.object_offset + (page - node.base);
        let paddr = mapping.object.commit_page(offset)?;
        match self.arch.map(page, PAGE_SIZE, &[paddr], perms) {
            Ok(()) => Ok(()),
            Err(ArchError::Overlap) => {
                log_trace!(target: "vm-fault", "spurious fault at {:#x}", addr);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}
