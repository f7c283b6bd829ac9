//! Structured logging utilities for vshare components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use vshare_config::log_lock_debug;
//!
//! log_lock_debug!("Reclaimed stale lock", path = lock_path.display().to_string());
//! ```

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const CACHE: &'static str = "CACHE";
    pub const LOCK: &'static str = "LOCK";
    pub const INDEX: &'static str = "INDEX";
    pub const MIGRATE: &'static str = "MIGRATE";
    pub const MOUNT: &'static str = "MOUNT";
    pub const REPAIR: &'static str = "REPAIR";
    pub const CLI: &'static str = "CLI";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

// === CACHE logging macros ===

#[macro_export]
macro_rules! log_cache_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "CACHE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_cache_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "CACHE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_cache_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "CACHE", $($key = $value,)* $msg)
    };
}

// === LOCK logging macros ===

#[macro_export]
macro_rules! log_lock_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "LOCK", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_lock_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "LOCK", $($key = $value,)* $msg)
    };
}

// === INDEX logging macros ===

#[macro_export]
macro_rules! log_index_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "INDEX", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_index_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "INDEX", $($key = $value,)* $msg)
    };
}

// === MIGRATE logging macros ===

#[macro_export]
macro_rules! log_migrate_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "MIGRATE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_migrate_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "MIGRATE", $($key = $value,)* $msg)
    };
}

// === MOUNT logging macros ===

#[macro_export]
macro_rules! log_mount_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "MOUNT", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_mount_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "MOUNT", $($key = $value,)* $msg)
    };
}

// === REPAIR logging macros ===

#[macro_export]
macro_rules! log_repair_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "REPAIR", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_repair_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "REPAIR", $($key = $value,)* $msg)
    };
}

// === CLI logging macros ===

#[macro_export]
macro_rules! log_cli_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "CLI", $($key = $value,)* $msg)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup.
///
/// `VSHARE_LOG` takes precedence over `RUST_LOG`; both override `level`.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let filter = match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    };

    let env_filter = EnvFilter::try_from_env("VSHARE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
