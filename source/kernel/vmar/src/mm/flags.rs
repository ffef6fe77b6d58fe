// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Region capability flags, hardware permission flags and fault flags.

use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
    /// Capability and placement flags carried by every node.
    pub struct VmarFlags: u32 {
        /// Use the compact entropy budget when placing children.
        const COMPACT = 1 << 0;
        /// Place the child exactly at the requested offset.
        const SPECIFIC = 1 << 1;
        /// Like `SPECIFIC`, replacing any mappings already in the range.
        const SPECIFIC_OVERWRITE = 1 << 2;
        /// Children may request `SPECIFIC` or `OFFSET_IS_UPPER_LIMIT` placement.
        const CAN_MAP_SPECIFIC = 1 << 3;
        const CAN_MAP_READ = 1 << 4;
        const CAN_MAP_WRITE = 1 << 5;
        const CAN_MAP_EXECUTE = 1 << 6;
        /// The offset is a ceiling for dynamic placement rather than a position.
        const OFFSET_IS_UPPER_LIMIT = 1 << 7;

        const CAN_RWX = Self::CAN_MAP_READ.bits()
            | Self::CAN_MAP_WRITE.bits()
            | Self::CAN_MAP_EXECUTE.bits();
    }
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
    /// Hardware translation flags. The low two bits hold the cache policy.
    pub struct ArchMmuFlags: u32 {
        const UNCACHED = 1 << 0;
        const UNCACHED_DEVICE = 1 << 1;
        const WRITE_COMBINING = Self::UNCACHED.bits() | Self::UNCACHED_DEVICE.bits();
        const CACHE_MASK = Self::WRITE_COMBINING.bits();
        const PERM_USER = 1 << 2;
        const PERM_READ = 1 << 3;
        const PERM_WRITE = 1 << 4;
        const PERM_EXECUTE = 1 << 5;
        const NS = 1 << 6;

        const PERM_RWX = Self::PERM_READ.bits()
            | Self::PERM_WRITE.bits()
            | Self::PERM_EXECUTE.bits();
    }
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    /// Describes the access that faulted. A fault without `WRITE` or
    /// `INSTRUCTION` is a read.
    pub struct PageFaultFlags: u32 {
        const WRITE = 1 << 0;
        const USER = 1 << 1;
        const INSTRUCTION = 1 << 2;
        const NOT_PRESENT = 1 << 3;
    }
}

/// Memory type of a translation, stored in [`ArchMmuFlags::CACHE_MASK`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CachePolicy {
    Cached,
    Uncached,
    UncachedDevice,
    WriteCombining,
}

impl CachePolicy {
    pub const fn bits(self) -> ArchMmuFlags {
        match self {
            CachePolicy::Cached => ArchMmuFlags::empty(),
            CachePolicy::Uncached => ArchMmuFlags::UNCACHED,
            CachePolicy::UncachedDevice => ArchMmuFlags::UNCACHED_DEVICE,
            CachePolicy::WriteCombining => ArchMmuFlags::WRITE_COMBINING,
        }
    }
}

impl ArchMmuFlags {
    pub fn cache_policy(self) -> CachePolicy {
        let cache = self.intersection(Self::CACHE_MASK);
        if cache == Self::WRITE_COMBINING {
            CachePolicy::WriteCombining
        } else if cache == Self::UNCACHED_DEVICE {
            CachePolicy::UncachedDevice
        } else if cache == Self::UNCACHED {
            CachePolicy::Uncached
        } else {
            CachePolicy::Cached
        }
    }

    /// Replaces the cache field with `policy`.
    pub fn with_cache_policy(self, policy: CachePolicy) -> Self {
        self.difference(Self::CACHE_MASK).union(policy.bits())
    }

    pub fn permissions(self) -> Self {
        self.intersection(Self::PERM_RWX)
    }
}

impl VmarFlags {
    /// Returns true if every permission in `arch` has its `CAN_MAP_*` counterpart.
    pub fn allows(self, arch: ArchMmuFlags) -> bool {
        (!arch.contains(ArchMmuFlags::PERM_READ) || self.contains(Self::CAN_MAP_READ))
            && (!arch.contains(ArchMmuFlags::PERM_WRITE) || self.contains(Self::CAN_MAP_WRITE))
            && (!arch.contains(ArchMmuFlags::PERM_EXECUTE)
                || self.contains(Self::CAN_MAP_EXECUTE))
    }

    /// `CAN_MAP_*` capabilities implied by the permissions in `arch`.
    pub fn capabilities_for(arch: ArchMmuFlags) -> Self {
        let mut caps = Self::empty();
        caps.set(Self::CAN_MAP_READ, arch.contains(ArchMmuFlags::PERM_READ));
        caps.set(Self::CAN_MAP_WRITE, arch.contains(ArchMmuFlags::PERM_WRITE));
        caps.set(Self::CAN_MAP_EXECUTE, arch.contains(ArchMmuFlags::PERM_EXECUTE));
        caps
    }
}
