// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Node storage for one address space
//! OWNERS: @kernel-mm-team
//! PUBLIC API: NodeId, NodeState, MAX_NAME_LEN
//! DEPENDS_ON: alloc::vec::Vec, mm::subregion
//! INVARIANTS: A slot's generation changes on every release; stale ids never resolve
//!
//! Every region and mapping of an address space lives in a [`NodeArena`]
//! slot. Parents refer to children by [`NodeId`] through their subregion
//! container and children keep a plain parent id, so the tree has no
//! reference cycles and lookups can still walk upward.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::num::NonZeroU32;

use super::error::VmError;
use super::flags::{ArchMmuFlags, VmarFlags};
use super::object::VmObject;
use super::subregion::SubregionSet;

/// Longest region or object name kept, in bytes.
pub const MAX_NAME_LEN: usize = 32;

/// Generational reference to a node slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: u32,
    generation: NonZeroU32,
}

impl NodeId {
    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation.get()
    }
}

/// Lifecycle of a node. Transitions are `NotReady -> Alive -> Dead`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// Allocated but not yet reachable from its parent.
    NotReady,
    Alive,
    Dead,
}

pub(crate) struct RegionData {
    pub name: String,
    pub subregions: SubregionSet,
}

pub(crate) struct MappingData {
    pub object: Arc<dyn VmObject>,
    pub object_offset: usize,
    pub arch_flags: ArchMmuFlags,
}

pub(crate) enum NodeKind {
    Region(RegionData),
    Mapping(MappingData),
}

pub(crate) struct Node {
    pub base: usize,
    pub size: usize,
    pub flags: VmarFlags,
    pub state: NodeState,
    pub parent: Option<NodeId>,
    pub kind: NodeKind,
}

impl Node {
    pub fn region(
        base: usize,
        size: usize,
        flags: VmarFlags,
        parent: Option<NodeId>,
        name: &str,
    ) -> Self {
        Self {
            base,
            size,
            flags,
            state: NodeState::NotReady,
            parent,
            kind: NodeKind::Region(RegionData {
                name: truncate_name(name),
                subregions: SubregionSet::new(),
            }),
        }
    }

    pub fn mapping(
        base: usize,
        size: usize,
        flags: VmarFlags,
        parent: NodeId,
        data: MappingData,
    ) -> Self {
        Self {
            base,
            size,
            flags,
            state: NodeState::NotReady,
            parent: Some(parent),
            kind: NodeKind::Mapping(data),
        }
    }

    /// Exclusive end. Never overflows for a constructed node.
    #[inline]
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.state == NodeState::Alive
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr - self.base < self.size
    }

    /// True if `[base, base + size)` lies inside this node.
    pub fn in_range(&self, base: usize, size: usize) -> bool {
        base >= self.base && base - self.base <= self.size && size <= self.size - (base - self.base)
    }

    pub fn as_region(&self) -> Option<&RegionData> {
        match &self.kind {
            NodeKind::Region(region) => Some(region),
            NodeKind::Mapping(_) => None,
        }
    }

    pub fn as_region_mut(&mut self) -> Option<&mut RegionData> {
        match &mut self.kind {
            NodeKind::Region(region) => Some(region),
            NodeKind::Mapping(_) => None,
        }
    }

    pub fn as_mapping(&self) -> Option<&MappingData> {
        match &self.kind {
            NodeKind::Mapping(mapping) => Some(mapping),
            NodeKind::Region(_) => None,
        }
    }

    pub fn as_mapping_mut(&mut self) -> Option<&mut MappingData> {
        match &mut self.kind {
            NodeKind::Mapping(mapping) => Some(mapping),
            NodeKind::Region(_) => None,
        }
    }

    pub fn is_mapping(&self) -> bool {
        matches!(self.kind, NodeKind::Mapping(_))
    }
}

struct Slot {
    generation: NonZeroU32,
    node: Option<Node>,
}

/// Slot storage for every node of one address space.
pub(crate) struct NodeArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl NodeArena {
    pub const fn new() -> Self {
        Self { slots: Vec::new(), free: Vec::new(), live: 0 }
    }

    /// Stores `node` and returns its id. Fails instead of aborting when the
    /// arena cannot grow.
    pub fn insert(&mut self, node: Node) -> Result<NodeId, VmError> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.node.is_none());
            slot.node = Some(node);
            self.live += 1;
            return Ok(NodeId { index, generation: slot.generation });
        }
        let index = u32::try_from(self.slots.len()).map_err(|_| VmError::OutOfMemory)?;
        self.slots.try_reserve(1).map_err(|_| VmError::OutOfMemory)?;
        // The free list must be able to take this slot back without allocating.
        self.free.try_reserve(self.slots.len() + 1).map_err(|_| VmError::OutOfMemory)?;
        self.slots.push(Slot { generation: NonZeroU32::MIN, node: Some(node) });
        self.live += 1;
        Ok(NodeId { index, generation: NonZeroU32::MIN })
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_ref()
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_mut()
    }

    /// Lifecycle state of `id`; stale ids report `Dead`.
    pub fn state(&self, id: NodeId) -> NodeState {
        self.get(id).map_or(NodeState::Dead, |node| node.state)
    }

    /// Frees the slot and returns the node, invalidating every copy of `id`.
    pub fn release(&mut self, id: NodeId) -> Option<Node> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let node = slot.node.take()?;
        slot.generation = slot.generation.checked_add(1).unwrap_or(NonZeroU32::MIN);
        self.free.push(id.index);
        self.live -= 1;
        Some(node)
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.live
    }
}

/// Copies at most [`MAX_NAME_LEN`] bytes of `name`, cutting on a char boundary.
pub(crate) fn truncate_name(name: &str) -> String {
    let mut end = name.len().min(MAX_NAME_LEN);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    String::from(&name[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(base: usize) -> Node {
        Node::region(base, 0x1000, VmarFlags::empty(), None, "r")
    }

    #[test]
    fn released_ids_go_stale() {
        let mut arena = NodeArena::new();
        let a = arena.insert(region(0)).expect("insert");
        assert_eq!(arena.state(a), NodeState::NotReady);
        assert!(arena.release(a).is_some());
        assert_eq!(arena.state(a), NodeState::Dead);
        let b = arena.insert(region(0x1000)).expect("reuse");
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        assert!(arena.get(a).is_none());
        assert!(arena.release(a).is_none());
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn names_are_truncated_on_char_boundary() {
        let long = "é".repeat(MAX_NAME_LEN);
        let cut = truncate_name(&long);
        assert!(cut.len() <= MAX_NAME_LEN);
        assert!(cut.chars().all(|c| c == 'é'));
        assert_eq!(truncate_name("heap"), "heap");
    }

    #[test]
    fn in_range_handles_edges() {
        let node = Node::region(0x1000, 0x2000, VmarFlags::empty(), None, "r");
        assert!(node.in_range(0x1000, 0x2000));
        assert!(node.in_range(0x3000, 0));
        assert!(!node.in_range(0x2000, 0x2000));
        assert!(!node.in_range(0, 0x1000));
        assert!(node.contains(0x2fff));
        assert!(!node.contains(0x3000));
    }
}
