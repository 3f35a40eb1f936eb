use serde::Deserialize;
use crate::core::error::Result;

pub const DEFAULT_MAX_KEY_BYTES: usize = 1978;
pub const DEFAULT_SCAN_BATCH_SIZE: usize = 256;
pub const DEFAULT_ADAPTIVE_MIN_INCOMING: f64 = 3.0;
pub const DEFAULT_ADAPTIVE_THRESHOLD_SHIFT: u32 = 4;
pub const DEFAULT_STARTS_WITH_FRACTION: f64 = 0.05;
pub const DEFAULT_BETWEEN_FRACTION: f64 = 0.10;
pub const DEFAULT_OPEN_RANGE_FRACTION: f64 = 0.30;
pub const DEFAULT_STATS_TTL_MS: u64 = 1000;
pub const DEFAULT_STATS_CACHE_CAPACITY: usize = 1024;
pub const DEFAULT_RESOURCE_CACHE_LINEAR_LIMIT: usize = 10;
pub const DEFAULT_MAX_COMMIT_RETRIES: usize = 10;

/// Engine tunables. The adaptive and estimator constants were tuned
/// empirically and have no derivation; benchmark before changing them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    // Index keys
    pub max_key_bytes: usize,                   // longer keys are truncated + overflow marker
    pub scan_batch_size: usize,                 // entries fetched per store lock acquisition
    pub allow_full_scan: bool,                  // default policy for requests that don't say

    // Adaptive filter
    pub adaptive_min_incoming: f64,             // outer estimate must exceed this
    pub adaptive_threshold_shift: u32,          // threshold = condition estimate >> shift

    // Cost estimator heuristics, as fractions of collection size
    pub starts_with_fraction: f64,
    pub between_fraction: f64,
    pub open_range_fraction: f64,

    // Statistics handle
    pub stats_ttl_ms: u64,
    pub stats_cache_capacity: usize,

    // Transactions
    pub resource_cache_linear_limit: usize,
    pub max_commit_retries: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_key_bytes: DEFAULT_MAX_KEY_BYTES,
            scan_batch_size: DEFAULT_SCAN_BATCH_SIZE,
            allow_full_scan: true,

            adaptive_min_incoming: DEFAULT_ADAPTIVE_MIN_INCOMING,
            adaptive_threshold_shift: DEFAULT_ADAPTIVE_THRESHOLD_SHIFT,

            starts_with_fraction: DEFAULT_STARTS_WITH_FRACTION,
            between_fraction: DEFAULT_BETWEEN_FRACTION,
            open_range_fraction: DEFAULT_OPEN_RANGE_FRACTION,

            stats_ttl_ms: DEFAULT_STATS_TTL_MS,
            stats_cache_capacity: DEFAULT_STATS_CACHE_CAPACITY,

            resource_cache_linear_limit: DEFAULT_RESOURCE_CACHE_LINEAR_LIMIT,
            max_commit_retries: DEFAULT_MAX_COMMIT_RETRIES,
        }
    }
}

impl Config {
    /// Parse a (possibly partial) JSON document; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = Config::from_json(r#"{ "scan_batch_size": 8, "allow_full_scan": false }"#).unwrap();
        assert_eq!(config.scan_batch_size, 8);
        assert!(!config.allow_full_scan);
        assert_eq!(config.max_key_bytes, DEFAULT_MAX_KEY_BYTES);
        assert_eq!(config.adaptive_threshold_shift, 4);
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = Config::from_json("{ nope").unwrap_err();
        assert_eq!(err.kind, crate::core::error::ErrorKind::Parse);
    }
}
