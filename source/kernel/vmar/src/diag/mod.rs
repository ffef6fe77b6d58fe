// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Diagnostics for the VMAR tree
//! OWNERS: @kernel-mm-team
//! PUBLIC API: log (log_* macros, set_sink, set_max_level)

#[macro_use]
pub mod log;
