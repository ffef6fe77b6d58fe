// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Visitor interface for walking a region subtree.

use super::flags::{ArchMmuFlags, VmarFlags};
use super::node::NodeId;
use super::object::VmObject;

/// Region as reported to a [`VmEnumerator`].
#[derive(Clone, Copy)]
pub struct RegionInfo<'a> {
    pub id: NodeId,
    pub base: usize,
    pub size: usize,
    pub flags: VmarFlags,
    pub name: &'a str,
}

/// Mapping as reported to a [`VmEnumerator`].
#[derive(Clone, Copy)]
pub struct MappingInfo<'a> {
    pub id: NodeId,
    pub base: usize,
    pub size: usize,
    pub flags: VmarFlags,
    pub arch_flags: ArchMmuFlags,
    pub object_offset: usize,
    pub object: &'a dyn VmObject,
}

/// Receives every node of a walk in pre-order. Returning `false` stops the
/// walk.
pub trait VmEnumerator {
    fn on_region(&mut self, info: &RegionInfo<'_>, depth: usize) -> bool;
    fn on_mapping(&mut self, info: &MappingInfo<'_>, depth: usize) -> bool;
}
