// quarry-core/src/logging.rs
// Leveled logging with per-component verbosity

use std::sync::atomic::{AtomicU8, Ordering};

/// Log levels (ordered by severity)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// Errors - failures that stop an operation
    Error = 0,
    /// Warnings - recoverable anomalies (torn journal tail, retries exhausted)
    Warn = 1,
    /// Info - lifecycle events (open, checkpoint, index build commit)
    Info = 2,
    /// Debug - planner decisions, spills, conflicts
    Debug = 3,
    /// Trace - per-record detail
    Trace = 4,
}

impl LogLevel {
    /// Parse log level from string (case-insensitive)
    pub fn parse(s: &str) -> Option<LogLevel> {
        match s.to_uppercase().as_str() {
            "ERROR" => Some(LogLevel::Error),
            "WARN" | "WARNING" => Some(LogLevel::Warn),
            "INFO" => Some(LogLevel::Info),
            "DEBUG" => Some(LogLevel::Debug),
            "TRACE" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(level: u8) -> Option<LogLevel> {
        match level {
            0 => Some(LogLevel::Error),
            1 => Some(LogLevel::Warn),
            2 => Some(LogLevel::Info),
            3 => Some(LogLevel::Debug),
            4 => Some(LogLevel::Trace),
            _ => None,
        }
    }
}

/// Engine subsystem a message belongs to.
///
/// Each component may override the global level, so e.g. planner decisions
/// can be traced without drowning in storage noise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum LogComponent {
    Default = 0,
    Storage = 1,
    Index = 2,
    Query = 3,
    Txn = 4,
    Command = 5,
    Recovery = 6,
}

const COMPONENT_COUNT: usize = 7;
const NO_OVERRIDE: u8 = u8::MAX;

impl LogComponent {
    pub fn parse(s: &str) -> Option<LogComponent> {
        match s.to_lowercase().as_str() {
            "default" => Some(LogComponent::Default),
            "storage" => Some(LogComponent::Storage),
            "index" => Some(LogComponent::Index),
            "query" => Some(LogComponent::Query),
            "txn" | "transaction" => Some(LogComponent::Txn),
            "command" => Some(LogComponent::Command),
            "recovery" => Some(LogComponent::Recovery),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogComponent::Default => "-",
            LogComponent::Storage => "STORAGE",
            LogComponent::Index => "INDEX",
            LogComponent::Query => "QUERY",
            LogComponent::Txn => "TXN",
            LogComponent::Command => "COMMAND",
            LogComponent::Recovery => "RECOVERY",
        }
    }

    /// Map a module path (`quarry_core::index::build`) to its component.
    pub fn for_module(module: &str) -> LogComponent {
        let mut parts = module.split("::");
        parts.next();
        match parts.next().unwrap_or("") {
            "storage" | "mvcc" | "catalog" | "oplog" => LogComponent::Storage,
            "index" => LogComponent::Index,
            "query" | "pipeline" | "cursor" => LogComponent::Query,
            "txn" | "collection" => LogComponent::Txn,
            "command" | "engine" => LogComponent::Command,
            "recovery" => LogComponent::Recovery,
            _ => LogComponent::Default,
        }
    }
}

// Global log level (default: WARN)
static GLOBAL_LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);

#[allow(clippy::declare_interior_mutable_const)]
const UNSET: AtomicU8 = AtomicU8::new(NO_OVERRIDE);
static COMPONENT_LEVELS: [AtomicU8; COMPONENT_COUNT] = [UNSET; COMPONENT_COUNT];

pub fn set_log_level(level: LogLevel) {
    GLOBAL_LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn get_log_level() -> LogLevel {
    LogLevel::from_u8(GLOBAL_LOG_LEVEL.load(Ordering::Relaxed)).unwrap_or(LogLevel::Warn)
}

/// Override verbosity for one component; `None` falls back to the global level.
pub fn set_component_level(component: LogComponent, level: Option<LogLevel>) {
    let raw = level.map(|l| l as u8).unwrap_or(NO_OVERRIDE);
    COMPONENT_LEVELS[component as usize].store(raw, Ordering::Relaxed);
}

pub fn component_level(component: LogComponent) -> LogLevel {
    let raw = COMPONENT_LEVELS[component as usize].load(Ordering::Relaxed);
    LogLevel::from_u8(raw).unwrap_or_else(get_log_level)
}

/// Apply `QUARRY_LOG_LEVEL` (e.g. `debug` or `warn,query=trace,index=debug`).
pub fn init_from_env() {
    if let Ok(spec) = std::env::var("QUARRY_LOG_LEVEL") {
        apply_spec(&spec);
    }
}

/// Parse a comma separated level spec. Unknown entries are ignored.
pub fn apply_spec(spec: &str) {
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('=') {
            Some((component, level)) => {
                if let (Some(c), Some(l)) = (LogComponent::parse(component), LogLevel::parse(level)) {
                    set_component_level(c, Some(l));
                }
            }
            None => {
                if let Some(l) = LogLevel::parse(part) {
                    set_log_level(l);
                }
            }
        }
    }
}

#[inline]
pub fn should_log(level: LogLevel, module: &str) -> bool {
    level <= component_level(LogComponent::for_module(module))
}

#[doc(hidden)]
pub fn log_message(level: LogLevel, module: &str, message: &str) {
    if should_log(level, module) {
        let component = LogComponent::for_module(module);
        eprintln!(
            "{} {:<5} {:<8} [{}] {}",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            level.as_str(),
            component.as_str(),
            module,
            message
        );
    }
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logging::log_message(
            $crate::logging::LogLevel::Error,
            module_path!(),
            &format!($($arg)*)
        )
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logging::log_message(
            $crate::logging::LogLevel::Warn,
            module_path!(),
            &format!($($arg)*)
        )
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logging::log_message(
            $crate::logging::LogLevel::Info,
            module_path!(),
            &format!($($arg)*)
        )
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logging::log_message(
            $crate::logging::LogLevel::Debug,
            module_path!(),
            &format!($($arg)*)
        )
    };
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {
        $crate::logging::log_message(
            $crate::logging::LogLevel::Trace,
            module_path!(),
            &format!($($arg)*)
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Info < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(LogLevel::parse("ERROR"), Some(LogLevel::Error));
        assert_eq!(LogLevel::parse("warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("DeBuG"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("loud"), None);
    }

    #[test]
    fn test_module_to_component() {
        assert_eq!(LogComponent::for_module("quarry_core::index::build"), LogComponent::Index);
        assert_eq!(LogComponent::for_module("quarry_core::pipeline::group"), LogComponent::Query);
        assert_eq!(LogComponent::for_module("quarry_core::txn::coordinator"), LogComponent::Txn);
        assert_eq!(LogComponent::for_module("quarry_core"), LogComponent::Default);
    }

    #[test]
    fn test_component_override() {
        set_log_level(LogLevel::Warn);
        set_component_level(LogComponent::Recovery, Some(LogLevel::Trace));
        assert!(should_log(LogLevel::Trace, "quarry_core::recovery"));
        assert!(!should_log(LogLevel::Debug, "quarry_core::storage::journal"));
        set_component_level(LogComponent::Recovery, None);
        assert!(!should_log(LogLevel::Trace, "quarry_core::recovery"));
    }
}
