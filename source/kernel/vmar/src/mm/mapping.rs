// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Mapping nodes: trimming, splitting, protection and eager population
//! OWNERS: @kernel-mm-team
//! PUBLIC API: MappingHandle
//! DEPENDS_ON: mm::aspace::AspaceState, mm::arch::ArchAspace, mm::object::VmObject
//! INVARIANTS: Split pieces stay inside the original range; the hardware call precedes tree updates

use alloc::sync::Arc;

use super::aspace::{AddressSpace, AspaceState};
use super::error::{ArchError, VmError};
use super::flags::{ArchMmuFlags, PageFaultFlags, VmarFlags};
use super::node::{MappingData, Node, NodeId, NodeState};
use super::object::VmObject;
use super::vmar::round_range;
use super::{is_page_aligned, page_align_up, PAGE_SIZE};

/// Handle to a mapping node.
#[derive(Clone)]
pub struct MappingHandle {
    aspace: Arc<AddressSpace>,
    id: NodeId,
}

impl MappingHandle {
    pub(crate) fn new(aspace: Arc<AddressSpace>, id: NodeId) -> Self {
        Self { aspace, id }
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

    pub fn object_offset(&self) -> Result<usize, VmError> {
        let state = self.aspace.lock();
        Ok(mapping_of(state.alive(self.id)?)?.object_offset)
    }

    pub fn arch_flags(&self) -> Result<ArchMmuFlags, VmError> {
        let state = self.aspace.lock();
        Ok(mapping_of(state.alive(self.id)?)?.arch_flags)
    }

    pub fn object(&self) -> Result<Arc<dyn VmObject>, VmError> {
        let state = self.aspace.lock();
        Ok(Arc::clone(&mapping_of(state.alive(self.id)?)?.object))
    }

    /// Removes the translations and detaches the mapping from its region.
    pub fn destroy(&self) -> Result<(), VmError> {
        let mut state = self.aspace.lock();
        state.alive(self.id)?;
        state.destroy_mapping(self.id)
    }

    /// Unmaps `[base, base + size)` from this mapping only. The range must
    /// lie inside the mapping.
    pub fn unmap(&self, base: usize, size: usize) -> Result<(), VmError> {
        let size = round_range(base, size)?;
        let mut state = self.aspace.lock();
        state.alive(self.id)?;
        state.unmap_mapping_range(self.id, base, size)
    }

    /// Changes the hardware flags of `[base, base + size)` inside this mapping.
    pub fn protect(&self, base: usize, size: usize, arch_flags: ArchMmuFlags) -> Result<(), VmError> {
        let size = round_range(base, size)?;
        let mut state = self.aspace.lock();
        state.alive(self.id)?;
        state.protect_mapping_range(self.id, base, size, arch_flags)
    }

    /// Installs translations for `[offset, offset + len)` of the mapping.
    /// With `commit` unset only pages the object already holds are mapped.
    pub fn map_range(&self, offset: usize, len: usize, commit: bool) -> Result<(), VmError> {
        let len = page_align_up(len).ok_or(VmError::InvalidArgument)?;
        if !is_page_aligned(offset) {
            return Err(VmError::InvalidArgument);
        }
        let mut state = self.aspace.lock();
        state.alive(self.id)?;
        state.map_mapping_range(self.id, offset, len, commit)
    }

    /// Resolves a fault inside this mapping.
    pub fn page_fault(&self, addr: usize, flags: PageFaultFlags) -> Result<(), VmError> {
        let mut state = self.aspace.lock();
        let node = state.alive(self.id)?;
        if !node.contains(addr) {
            return Err(VmError::OutOfRange);
        }
        let parent = match node.parent {
            Some(parent) => parent,
            None => return Err(VmError::BadState),
        };
        state.page_fault(parent, addr, flags)
    }
}

fn mapping_of(node: &Node) -> Result<&MappingData, VmError> {
    node.as_mapping().ok_or(VmError::BadState)
}

impl AspaceState {
    /// Removes `[base, base + size)` from mapping `id`, trimming or
    /// splitting it. Unmapping the whole range destroys the mapping.
    pub(crate) fn unmap_mapping_range(
        &mut self,
        id: NodeId,
        base: usize,
        size: usize,
    ) -> Result<(), VmError> {
        let node = self.alive(id)?;
        let Some(mapping) = node.as_mapping() else {
            return Err(VmError::BadState);
        };
        if size == 0 || !node.in_range(base, size) {
            return Err(VmError::InvalidArgument);
        }
        if self.privileged_mapping == Some(id) {
            return Err(VmError::AccessDenied);
        }
        let (node_base, node_end, parent) = (node.base, node.end(), node.parent);
        let parent = match parent {
            Some(parent) => parent,
            None => panic!("mapping {id:?} without parent"),
        };
        let end = base + size;

        if base == node_base && end == node_end {
            return self.destroy_mapping(id);
        }

        if base == node_base {
            self.arch.unmap(base, size)?;
            self.subregions_mut(parent).rebase(node_base, end, node_end - end);
            let node = self.get_mut(id);
            node.base = end;
            node.size = node_end - end;
            if let Some(mapping) = node.as_mapping_mut() {
                mapping.object_offset += size;
            }
        } else if end == node_end {
            self.arch.unmap(base, size)?;
            self.subregions_mut(parent).resize(node_base, base - node_base);
            self.get_mut(id).size = base - node_base;
        } else {
            let tail = Node::mapping(
                end,
                node_end - end,
                node.flags,
                parent,
                MappingData {
                    object: Arc::clone(&mapping.object),
                    object_offset: mapping.object_offset + (end - node_base),
                    arch_flags: mapping.arch_flags,
                },
            );
            let tail = self.nodes.insert(tail)?;
            if let Err(err) = self.arch.unmap(base, size) {
                drop(self.nodes.release(tail));
                return Err(err.into());
            }
            self.subregions_mut(parent).resize(node_base, base - node_base);
            self.get_mut(id).size = base - node_base;
            self.activate(tail);
        }
        log_trace!(target: "vm", "mapping unmap [{:#x}, {:#x})", base, end);
        Ok(())
    }

    /// Applies `arch_flags` to `[base, base + size)` of mapping `id`,
    /// splitting it into up to three mappings. The mapping keeps its cache
    /// policy.
    pub(crate) fn protect_mapping_range(
        &mut self,
        id: NodeId,
        base: usize,
        size: usize,
        arch_flags: ArchMmuFlags,
    ) -> Result<(), VmError> {
        let node = self.alive(id)?;
        let Some(mapping) = node.as_mapping() else {
            return Err(VmError::BadState);
        };
        if size == 0 || !node.in_range(base, size) {
            return Err(VmError::InvalidArgument);
        }
        if !node.flags.allows(arch_flags) || self.privileged_mapping == Some(id) {
            return Err(VmError::AccessDenied);
        }
        let old_flags = mapping.arch_flags;
        let new_flags = arch_flags.with_cache_policy(old_flags.cache_policy());
        let (node_base, node_end, node_flags) = (node.base, node.end(), node.flags);
        let parent = match node.parent {
            Some(parent) => parent,
            None => panic!("mapping {id:?} without parent"),
        };
        let object = Arc::clone(&mapping.object);
        let object_offset = mapping.object_offset;
        let end = base + size;
        let head = base - node_base;
        let tail = node_end - end;

        // New pieces are created before the hardware call so an allocation
        // failure leaves everything untouched.
        let mut pieces: [Option<NodeId>; 2] = [None, None];
        if head > 0 {
            let center = Node::mapping(
                base,
                size,
                node_flags,
                parent,
                MappingData {
                    object: Arc::clone(&object),
                    object_offset: object_offset + head,
                    arch_flags: new_flags,
                },
            );
            pieces[0] = Some(self.nodes.insert(center)?);
        }
        if tail > 0 {
            let rest = Node::mapping(
                end,
                tail,
                node_flags,
                parent,
                MappingData { object, object_offset: object_offset + head + size, arch_flags: old_flags },
            );
            match self.nodes.insert(rest) {
                Ok(rest) => pieces[1] = Some(rest),
                Err(err) => {
                    self.discard(&pieces);
                    return Err(err);
                }
            }
        }

        if let Err(err) = self.arch.protect(base, size, new_flags) {
            self.discard(&pieces);
            return Err(err.into());
        }

        let kept = if head > 0 { head } else { size };
        if kept != node_end - node_base {
            self.subregions_mut(parent).resize(node_base, kept);
        }
        let node = self.get_mut(id);
        node.size = kept;
        if head == 0 {
            if let Some(mapping) = node.as_mapping_mut() {
                mapping.arch_flags = new_flags;
            }
        }
        for piece in pieces.into_iter().flatten() {
            self.activate(piece);
        }
        log_trace!(
            target: "vm",
            "mapping protect [{:#x}, {:#x}) {:?}",
            base,
            end,
            new_flags
        );
        Ok(())
    }

    /// Maps `[offset, offset + len)` of mapping `id` page by page.
    pub(crate) fn map_mapping_range(
        &mut self,
        id: NodeId,
        offset: usize,
        len: usize,
        commit: bool,
    ) -> Result<(), VmError> {
        let node = self.alive(id)?;
        let Some(mapping) = node.as_mapping() else {
            return Err(VmError::BadState);
        };
        let Some(vaddr) = node.base.checked_add(offset) else {
            return Err(VmError::InvalidArgument);
        };
        if len == 0 || !node.in_range(vaddr, len) {
            return Err(VmError::InvalidArgument);
        }
        for page in (0..len).step_by(PAGE_SIZE) {
            let object_offset = mapping.object_offset + offset + page;
            let paddr = if commit {
                mapping.object.commit_page(object_offset)?
            } else {
                match mapping.object.lookup_page(object_offset) {
                    Some(paddr) => paddr,
                    None => continue,
                }
            };
            match self.arch.map(vaddr + page, PAGE_SIZE, &[paddr], mapping.arch_flags) {
                Ok(()) | Err(ArchError::Overlap) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Frees pieces that were never activated.
    fn discard(&mut self, pieces: &[Option<NodeId>]) {
        for piece in pieces.iter().flatten() {
            drop(self.nodes.release(*piece));
        }
    }
}
