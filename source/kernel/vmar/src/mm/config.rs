// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Construction-time configuration of an address space.

use super::error::VmError;
use super::flags::VmarFlags;
use super::is_page_aligned;

/// Widest entropy budget accepted for randomized placement.
pub const MAX_ASLR_ENTROPY_BITS: u8 = 36;

/// Randomized placement parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AslrConfig {
    pub enabled: bool,
    /// Entropy used by regular regions.
    pub entropy_bits: u8,
    /// Entropy used by regions created with [`VmarFlags::COMPACT`].
    pub compact_entropy_bits: u8,
}

impl Default for AslrConfig {
    fn default() -> Self {
        Self { enabled: true, entropy_bits: 30, compact_entropy_bits: 8 }
    }
}

impl AslrConfig {
    /// First-fit placement.
    pub const fn disabled() -> Self {
        Self { enabled: false, entropy_bits: 0, compact_entropy_bits: 0 }
    }

    pub fn validate(&self) -> Result<(), VmError> {
        if self.entropy_bits > MAX_ASLR_ENTROPY_BITS
            || self.compact_entropy_bits > MAX_ASLR_ENTROPY_BITS
        {
            return Err(VmError::InvalidArgument);
        }
        Ok(())
    }

    /// Entropy for a region with `flags`.
    pub(crate) fn entropy_for(&self, flags: VmarFlags) -> u8 {
        if !self.enabled {
            0
        } else if flags.contains(VmarFlags::COMPACT) {
            self.compact_entropy_bits
        } else {
            self.entropy_bits
        }
    }
}

/// Shape of a new address space and its root region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AspaceConfig {
    pub base: usize,
    pub size: usize,
    /// Flags of the root region. Read, write and execute capability is
    /// always added.
    pub root_flags: VmarFlags,
    pub aslr: AslrConfig,
    pub name: &'static str,
}

impl Default for AspaceConfig {
    fn default() -> Self {
        Self {
            base: 0x0100_0000,
            size: 0x3f_ff00_0000,
            root_flags: VmarFlags::CAN_MAP_SPECIFIC,
            aslr: AslrConfig::default(),
            name: "root",
        }
    }
}

impl AspaceConfig {
    /// Checks the root range and ASLR parameters.
    pub fn validate(&self) -> Result<(), VmError> {
        if self.size == 0 || !is_page_aligned(self.base) || !is_page_aligned(self.size) {
            return Err(VmError::InvalidArgument);
        }
        if self.base.checked_add(self.size).is_none() {
            return Err(VmError::InvalidArgument);
        }
        let placement =
            VmarFlags::SPECIFIC | VmarFlags::SPECIFIC_OVERWRITE | VmarFlags::OFFSET_IS_UPPER_LIMIT;
        if self.root_flags.intersects(placement) {
            return Err(VmError::InvalidArgument);
        }
        self.aslr.validate()
    }
}
