// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Minimal structured logging with severity levels
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 2 unit tests (level gating, sink routing)
//! PUBLIC API: log_* macros, emit(level,target,args), set_sink(), set_max_level()
//! DEPENDS_ON: spin::Mutex
//! INVARIANTS: Debug/Trace only in debug builds; single-line emission; no sink means no output
//!
//! The VMAR crate has no UART of its own. The embedding kernel installs a sink
//! (the boot UART on the OS path, stderr in host tests) and every record is
//! routed through it as one `[LEVEL target] message` line.

use core::fmt::Arguments;
use core::sync::atomic::{AtomicU8, Ordering};

use spin::Mutex;

/// Logging severity used by the VMAR tree.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    pub const fn tag(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    const fn compiled_in(self) -> bool {
        match self {
            Level::Debug | Level::Trace => cfg!(debug_assertions),
            _ => true,
        }
    }
}

/// One log line handed to the installed sink.
pub struct Record<'a> {
    pub level: Level,
    pub target: &'static str,
    pub args: Arguments<'a>,
}

/// Receives every enabled record.
pub type Sink = fn(&Record<'_>);

static SINK: Mutex<Option<Sink>> = Mutex::new(None);
static MAX_LEVEL: AtomicU8 = AtomicU8::new(Level::Debug as u8);

/// Installs the sink records are written to, returning the previous one.
pub fn set_sink(sink: Option<Sink>) -> Option<Sink> {
    core::mem::replace(&mut *SINK.lock(), sink)
}

/// Sets the most verbose level that is still emitted.
pub fn set_max_level(level: Level) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn enabled(level: Level) -> bool {
    level.compiled_in() && level as u8 <= MAX_LEVEL.load(Ordering::Relaxed)
}

/// Emits a structured log line if the level is enabled for the current build.
pub fn emit(level: Level, target: &'static str, args: Arguments<'_>) {
    if !enabled(level) {
        return;
    }
    // Copy the sink out so a sink that logs does not self-deadlock.
    let sink = *SINK.lock();
    if let Some(sink) = sink {
        sink(&Record { level, target, args });
    }
}

#[macro_export]
macro_rules! log_error {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Error, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Error, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_warn {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Warn, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Warn, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_info {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Info, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Info, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_debug {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Debug, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Debug, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_trace {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Trace, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Trace, module_path!(), format_args!($($arg)+));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::{String, ToString};
    use std::sync::Mutex as StdMutex;
    use std::vec::Vec;

    static LINES: StdMutex<Vec<String>> = StdMutex::new(Vec::new());

    fn capture(record: &Record<'_>) {
        if record.target == "log-test" {
            let line = std::format!("[{} {}] {}", record.level.tag(), record.target, record.args);
            LINES.lock().unwrap().push(line);
        }
    }

    #[test]
    fn routes_records_through_sink_and_gates_levels() {
        let previous = set_sink(Some(capture));
        log_warn!(target: "log-test", "conflict {:#x}", 0x1000);
        set_max_level(Level::Error);
        log_warn!(target: "log-test", "suppressed");
        set_max_level(Level::Debug);
        set_sink(previous);

        let lines = LINES.lock().unwrap();
        assert!(lines.contains(&"[WARN log-test] conflict 0x1000".to_string()));
        assert!(!lines.iter().any(|l| l.contains("suppressed")));
    }

    #[test]
    fn levels_order_by_verbosity() {
        assert!(Level::Error < Level::Trace);
        assert_eq!(Level::Info.tag(), "INFO");
    }
}
