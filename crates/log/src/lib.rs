//! Minimal leveled logging used across the node.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub const LEVEL_ERROR: u8 = 0;
pub const LEVEL_WARN: u8 = 1;
pub const LEVEL_INFO: u8 = 2;
pub const LEVEL_DEBUG: u8 = 3;

static MAX_LEVEL: AtomicU8 = AtomicU8::new(LEVEL_INFO);

pub fn set_max_level(level: u8) {
    MAX_LEVEL.store(level.min(LEVEL_DEBUG), Ordering::Relaxed);
}

pub fn level_enabled(level: u8) -> bool {
    level <= MAX_LEVEL.load(Ordering::Relaxed)
}

pub fn parse_level(value: &str) -> Option<u8> {
    match value {
        "error" => Some(LEVEL_ERROR),
        "warn" => Some(LEVEL_WARN),
        "info" => Some(LEVEL_INFO),
        "debug" => Some(LEVEL_DEBUG),
        _ => None,
    }
}

pub fn write_line(level: &str, args: std::fmt::Arguments<'_>) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0);
    eprintln!("{now} [{level}] {args}");
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if $crate::level_enabled($crate::LEVEL_ERROR) {
            $crate::write_line("error", format_args!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if $crate::level_enabled($crate::LEVEL_WARN) {
            $crate::write_line("warn", format_args!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if $crate::level_enabled($crate::LEVEL_INFO) {
            $crate::write_line("info", format_args!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        if $crate::level_enabled($crate::LEVEL_DEBUG) {
            $crate::write_line("debug", format_args!($($arg)*));
        }
    };
}
