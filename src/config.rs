//! Environment-variable-driven configuration registry (§6).
//!
//! The registry mechanism itself is an out-of-scope collaborator; this module
//! is the concrete `Config` it produces, read once at startup.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(v) => v.parse().unwrap_or_else(|_| {
            tracing::warn!(var = name, value = %v, "malformed env var, using default");
            default
        }),
        Err(_) => default,
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub hierarchy_initial_vector_len: usize,
    pub hierarchy_expected_resp_len: usize,
    pub hierarchy_compression_level: u32,
    pub hierarchy_auto_compress_period: Option<Duration>,
    pub hierarchy_auto_compress_old_age_lim: u64,
    pub find_indices_max: usize,
    pub find_indexing_threshold: usize,
    pub debug_modify_replication_delay: Duration,
    pub log_filter: String,
    /// Ring buffer capacity (§4.9, §9 Open Questions): the documented
    /// default of 5 is too small for a real deployment; raised here while
    /// preserving the overwrite-on-zero-bitmap algorithm.
    pub ring_buffer_size: usize,
    /// Directory holding `.sdb` snapshots (§4.10): `load`/`save`/`purge`
    /// resolve relative filenames against this, and startup/shutdown use it
    /// directly for the last-good snapshot.
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 3000,
            hierarchy_initial_vector_len: 4,
            hierarchy_expected_resp_len: 64,
            hierarchy_compression_level: 6,
            hierarchy_auto_compress_period: None,
            hierarchy_auto_compress_old_age_lim: 0,
            find_indices_max: 0,
            find_indexing_threshold: 10,
            debug_modify_replication_delay: Duration::from_nanos(0),
            log_filter: "info".to_string(),
            ring_buffer_size: 1024,
            data_dir: PathBuf::from("."),
        }
    }
}

impl Config {
    /// Load configuration from the process environment, falling back to
    /// documented defaults (§6) for anything unset or malformed.
    pub fn from_env() -> Self {
        let default = Config::default();

        let period_ms: u64 = parse_env("HIERARCHY_AUTO_COMPRESS_PERIOD_MS", 0);
        let hierarchy_auto_compress_period = if period_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(period_ms))
        };

        Config {
            port: parse_env("SELVA_PORT", default.port),
            hierarchy_initial_vector_len: parse_env(
                "HIERARCHY_INITIAL_VECTOR_LEN",
                default.hierarchy_initial_vector_len,
            ),
            hierarchy_expected_resp_len: parse_env(
                "HIERARCHY_EXPECTED_RESP_LEN",
                default.hierarchy_expected_resp_len,
            ),
            hierarchy_compression_level: parse_env(
                "HIERARCHY_COMPRESSION_LEVEL",
                default.hierarchy_compression_level,
            )
            .clamp(1, 12),
            hierarchy_auto_compress_period,
            hierarchy_auto_compress_old_age_lim: parse_env(
                "HIERARCHY_AUTO_COMPRESS_OLD_AGE_LIM",
                default.hierarchy_auto_compress_old_age_lim,
            ),
            find_indices_max: parse_env("FIND_INDICES_MAX", default.find_indices_max),
            find_indexing_threshold: parse_env(
                "FIND_INDEXING_THRESHOLD",
                default.find_indexing_threshold,
            ),
            debug_modify_replication_delay: Duration::from_nanos(parse_env(
                "DEBUG_MODIFY_REPLICATION_DELAY_NS",
                0u64,
            )),
            log_filter: env::var("SELVA_LOG").unwrap_or(default.log_filter),
            ring_buffer_size: parse_env("RING_BUFFER_SIZE", default.ring_buffer_size),
            data_dir: env::var("SELVA_DATA_DIR").map(PathBuf::from).unwrap_or(default.data_dir),
        }
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = Config::default();
        assert_eq!(c.port, 3000);
        assert_eq!(c.hierarchy_compression_level, 6);
        assert!(c.hierarchy_auto_compress_period.is_none());
    }

    #[test]
    fn compression_level_clamped() {
        std::env::set_var("HIERARCHY_COMPRESSION_LEVEL", "99");
        let c = Config::from_env();
        assert_eq!(c.hierarchy_compression_level, 12);
        std::env::remove_var("HIERARCHY_COMPRESSION_LEVEL");
    }
}
