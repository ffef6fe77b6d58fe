// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error kinds returned by region, mapping and hardware-layer operations.

use core::fmt;

/// Error returned by the hardware translation layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchError {
    /// Virtual address or length was not page aligned.
    Unaligned,
    /// Range extends beyond what the translation layer can describe.
    OutOfRange,
    /// Mapping violates a hardware permission policy (for example W^X).
    PermissionDenied,
    /// A translation already exists for the page.
    Overlap,
    /// Flags do not describe a valid leaf entry.
    InvalidFlags,
    /// Failure forced through a failpoint.
    Injected,
}

/// Errors reported by the VMAR tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmError {
    /// Malformed range, misaligned address or offset, conflicting placement flags.
    InvalidArgument,
    /// Capability escalation, privileged mapping, or missing placement capability.
    AccessDenied,
    /// Node storage could not grow.
    OutOfMemory,
    /// No placement satisfies the request.
    OutOfSpace,
    /// Target range is not covered where full coverage is required.
    NotFound,
    /// Node is not alive, or the operation does not apply to its contents.
    BadState,
    /// Range lies outside the region.
    OutOfRange,
    /// Operation is not supported by the backing object.
    NotSupported,
    /// Hardware translation layer failed.
    Arch(ArchError),
}

impl From<ArchError> for VmError {
    fn from(value: ArchError) -> Self {
        Self::Arch(value)
    }
}

impl fmt::Display for ArchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ArchError::Unaligned => "unaligned address",
            ArchError::OutOfRange => "address out of range",
            ArchError::PermissionDenied => "permission policy violated",
            ArchError::Overlap => "translation already present",
            ArchError::InvalidFlags => "invalid translation flags",
            ArchError::Injected => "injected failure",
        };
        f.write_str(text)
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::InvalidArgument => f.write_str("invalid argument"),
            VmError::AccessDenied => f.write_str("access denied"),
            VmError::OutOfMemory => f.write_str("out of memory"),
            VmError::OutOfSpace => f.write_str("no space for allocation"),
            VmError::NotFound => f.write_str("not found"),
            VmError::BadState => f.write_str("bad state"),
            VmError::OutOfRange => f.write_str("out of range"),
            VmError::NotSupported => f.write_str("not supported"),
            VmError::Arch(err) => write!(f, "arch: {err}"),
        }
    }
}
