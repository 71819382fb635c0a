use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// MySQL `ER_ABORTING_CONNECTION`. The only code the backend family uses
/// today to announce that it is tearing the connection down itself.
const ER_ABORTING_CONNECTION: u64 = 1152;

const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// Runtime knobs of the batch coordination core.
///
/// The abort set classifies backend error codes into "connection-abort"
/// class (backend is terminating the whole leg) versus ordinary SQL
/// errors. Backend error vocabularies evolve, so the set is data: loaded
/// from config (serde) or overridden via `BATCH_ABORT_CODES`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub abort_codes: HashSet<u64>,
    /// Capacity of the bounded work queue backing the queued scheduler.
    pub queue_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            abort_codes: HashSet::from([ER_ABORTING_CONNECTION]),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl BatchConfig {
    pub fn is_abort_code(&self, code: u64) -> bool {
        self.abort_codes.contains(&code)
    }

    /// Default configuration with environment overrides applied.
    /// `BATCH_ABORT_CODES` is a comma-separated code list,
    /// `BATCH_QUEUE_CAPACITY` a positive integer.
    pub fn from_env() -> BatchConfig {
        let mut config = BatchConfig::default();
        if let Ok(raw) = std::env::var("BATCH_ABORT_CODES") {
            let codes: HashSet<u64> = raw
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            if !codes.is_empty() {
                config.abort_codes = codes;
            }
        }
        if let Ok(raw) = std::env::var("BATCH_QUEUE_CAPACITY") {
            if let Ok(capacity) = raw.parse::<usize>() {
                if capacity > 0 {
                    config.queue_capacity = capacity;
                }
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_set_classifies_aborting_connection() {
        let config = BatchConfig::default();
        assert!(config.is_abort_code(1152));
        assert!(!config.is_abort_code(1064));
    }

    #[test]
    fn config_survives_serde_round_trip() {
        let mut config = BatchConfig::default();
        config.abort_codes.insert(2013);
        config.queue_capacity = 64;

        let json = serde_json::to_string(&config).unwrap();
        let parsed: BatchConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let parsed: BatchConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed, BatchConfig::default());
    }

    #[test]
    fn env_override_replaces_abort_set() {
        std::env::set_var("BATCH_ABORT_CODES", "1152, 2013,9000");
        std::env::set_var("BATCH_QUEUE_CAPACITY", "32");
        let config = BatchConfig::from_env();
        std::env::remove_var("BATCH_ABORT_CODES");
        std::env::remove_var("BATCH_QUEUE_CAPACITY");

        assert_eq!(config.abort_codes, HashSet::from([1152, 2013, 9000]));
        assert_eq!(config.queue_capacity, 32);
        assert!(config.is_abort_code(9000));
    }
}
