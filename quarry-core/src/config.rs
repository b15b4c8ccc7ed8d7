// quarry-core/src/config.rs
//! Engine configuration and runtime-tunable server parameters.
//!
//! [`EngineConfig`] is read once when an engine opens. [`ServerParameters`]
//! hold the knobs that may change while the engine runs (spill threshold,
//! retry limits, planner trial sizes); they live in atomics so readers on hot
//! paths never take a lock.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::error::{QuarryError, Result};

/// Journal flush policy.
///
/// - **Always**: fsync after every commit record
/// - **Batch**: fsync every `commits` commit records (bounded loss on crash)
/// - **Never**: leave flushing to the OS; call `checkpoint()` for durability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum SyncMode {
    Always,
    Batch { commits: usize },
    Never,
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::Always
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Directory holding `journal.bin` and `checkpoint.bin`. `None` = in-memory.
    pub data_dir: Option<PathBuf>,
    pub sync_mode: SyncMode,
    /// Where spill runs are created. Defaults to the system temp dir.
    pub spill_dir: Option<PathBuf>,
    pub plan_cache_capacity: usize,
    pub oplog_max_entries: usize,
    /// Level spec, e.g. `"info,query=debug"`.
    pub log_level: Option<String>,
    /// Initial server parameter values, by name.
    pub parameters: serde_json::Map<String, JsonValue>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            data_dir: None,
            sync_mode: SyncMode::default(),
            spill_dir: None,
            plan_cache_capacity: 5000,
            oplog_max_entries: 100_000,
            log_level: None,
            parameters: serde_json::Map::new(),
        }
    }
}

impl EngineConfig {
    pub fn in_memory() -> Self {
        EngineConfig::default()
    }

    pub fn with_data_dir(dir: impl AsRef<Path>) -> Self {
        EngineConfig {
            data_dir: Some(dir.as_ref().to_path_buf()),
            ..EngineConfig::default()
        }
    }

    /// Load from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: EngineConfig = serde_json::from_str(&raw)
            .map_err(|e| QuarryError::InvalidOptions(format!("invalid engine config: {}", e)))?;
        Ok(config)
    }

    pub fn spill_dir(&self) -> PathBuf {
        self.spill_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

// ========== SERVER PARAMETERS ==========

const MIB: u64 = 1024 * 1024;

macro_rules! server_parameters {
    ($( $field:ident : $name:literal = $default:expr ),* $(,)?) => {
        /// Runtime-tunable knobs, settable by name.
        #[derive(Debug)]
        pub struct ServerParameters {
            $( $field: AtomicU64, )*
        }

        impl Default for ServerParameters {
            fn default() -> Self {
                ServerParameters {
                    $( $field: AtomicU64::new($default), )*
                }
            }
        }

        impl ServerParameters {
            $(
                pub fn $field(&self) -> u64 {
                    self.$field.load(Ordering::Relaxed)
                }
            )*

            fn slot(&self, name: &str) -> Option<&AtomicU64> {
                match name {
                    $( $name => Some(&self.$field), )*
                    _ => None,
                }
            }

            /// All parameter names with their current values.
            pub fn snapshot(&self) -> JsonValue {
                let mut out = serde_json::Map::new();
                $( out.insert($name.to_string(), json!(self.$field())); )*
                JsonValue::Object(out)
            }
        }
    };
}

server_parameters! {
    max_blocking_memory_bytes: "internalQueryMaxBlockingMemoryBytes" = 100 * MIB,
    write_conflict_retry_limit: "writeConflictRetryLimit" = 100,
    plan_trial_results: "internalQueryPlanTrialResults" = 101,
    plan_trial_max_works: "internalQueryPlanTrialMaxWorks" = 10_000,
    plan_cache_activation_confirmations: "planCacheActivationConfirmations" = 2,
    max_document_bytes: "maxDocumentBytes" = 16 * MIB,
    max_batch_bytes: "maxBatchBytes" = 16 * MIB,
    default_batch_size: "defaultBatchSize" = 101,
    interrupt_check_interval: "interruptCheckInterval" = 128,
    lock_timeout_millis: "lockTimeoutMillis" = 5,
    prepared_wait_slice_millis: "preparedWaitSliceMillis" = 10,
    cursor_timeout_millis: "cursorTimeoutMillis" = 600_000,
}

impl ServerParameters {
    /// Build parameters, applying overrides from config.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let params = ServerParameters::default();
        for (name, value) in &config.parameters {
            params.set(name, value)?;
        }
        Ok(params)
    }

    pub fn get(&self, name: &str) -> Result<u64> {
        self.slot(name)
            .map(|slot| slot.load(Ordering::Relaxed))
            .ok_or_else(|| QuarryError::InvalidOptions(format!("unknown server parameter '{}'", name)))
    }

    /// Set a parameter by name, returning the previous value.
    pub fn set(&self, name: &str, value: &JsonValue) -> Result<u64> {
        let slot = self
            .slot(name)
            .ok_or_else(|| QuarryError::InvalidOptions(format!("unknown server parameter '{}'", name)))?;
        let new_value = match value {
            JsonValue::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64)),
            _ => None,
        }
        .ok_or_else(|| {
            QuarryError::TypeMismatch(format!(
                "server parameter '{}' requires a non-negative integer, got {}",
                name, value
            ))
        })?;
        if new_value == 0 && name != "internalQueryMaxBlockingMemoryBytes" {
            return Err(QuarryError::BadValue(format!(
                "server parameter '{}' must be positive",
                name
            )));
        }
        Ok(slot.swap(new_value, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let params = ServerParameters::default();
        assert_eq!(params.plan_cache_activation_confirmations(), 2);
        assert_eq!(params.max_document_bytes(), 16 * MIB);
        assert_eq!(params.get("internalQueryPlanTrialResults").unwrap(), 101);
    }

    #[test]
    fn test_set_by_name() {
        let params = ServerParameters::default();
        let old = params.set("internalQueryMaxBlockingMemoryBytes", &json!(1024)).unwrap();
        assert_eq!(old, 100 * MIB);
        assert_eq!(params.max_blocking_memory_bytes(), 1024);
    }

    #[test]
    fn test_set_rejects_unknown_and_mistyped() {
        let params = ServerParameters::default();
        let err = params.set("noSuchKnob", &json!(1)).unwrap_err();
        assert!(err.to_string().contains("unknown server parameter"));
        let err = params.set("writeConflictRetryLimit", &json!("ten")).unwrap_err();
        assert!(matches!(err, QuarryError::TypeMismatch(_)));
    }

    #[test]
    fn test_config_from_json() {
        let config: EngineConfig = serde_json::from_value(json!({
            "syncMode": {"mode": "batch", "commits": 10},
            "planCacheCapacity": 42,
            "parameters": {"defaultBatchSize": 7}
        }))
        .unwrap();
        assert_eq!(config.sync_mode, SyncMode::Batch { commits: 10 });
        assert_eq!(config.plan_cache_capacity, 42);
        let params = ServerParameters::from_config(&config).unwrap();
        assert_eq!(params.default_batch_size(), 7);
    }
}
