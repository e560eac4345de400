//! Environment-style configuration.
//!
//! Every setting is optional except the delete-artifact suffix. Values are
//! read through a lookup function so tests never touch the process
//! environment.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::resolver::{DEFAULT_CATALOG, DEFAULT_STORAGE_SCHEME, ResolverConfig, TableMapping};

/// Default maximum number of compaction passes.
pub const DEFAULT_MAX_PASSES: u32 = 5;

/// Default lock hold time (15 minutes).
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(900);

/// Default retry delay (5 minutes).
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Default extra life of the retry-pending marker beyond the retry delay.
pub const DEFAULT_RETRY_MARKER_BUFFER: Duration = Duration::from_secs(60);

/// Default rewrite target file size (512 MiB).
pub const DEFAULT_TARGET_FILE_SIZE_BYTES: u64 = 512 * 1024 * 1024;

/// Default number of snapshots kept by history pruning.
pub const DEFAULT_RETAIN_LAST_SNAPSHOTS: u32 = 1;

/// Default wall-clock bound on a single compaction job.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(3600);

/// Coordinator and driver settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Filename suffix identifying delete artifacts.
    pub delete_suffix: String,
    /// Upper bound on compaction passes per run.
    pub max_passes: u32,
    /// How long a table lock is held before it expires.
    pub lock_ttl: Duration,
    /// Delay before a retry ticket becomes visible.
    pub retry_delay: Duration,
    /// Added to `retry_delay` to form the retry-pending marker TTL.
    pub retry_marker_buffer: Duration,
    /// Table resolution settings.
    pub resolver: ResolverConfig,
    /// Target output file size for data rewrites.
    pub target_file_size_bytes: u64,
    /// Snapshots retained by history pruning.
    pub retain_last_snapshots: u32,
    /// Wall-clock bound on one compaction job.
    pub job_timeout: Duration,
}

impl CoordinatorConfig {
    /// Creates a configuration with defaults for everything but the suffix.
    #[must_use]
    pub fn new(delete_suffix: impl Into<String>) -> Self {
        Self {
            delete_suffix: delete_suffix.into(),
            max_passes: DEFAULT_MAX_PASSES,
            lock_ttl: DEFAULT_LOCK_TTL,
            retry_delay: DEFAULT_RETRY_DELAY,
            retry_marker_buffer: DEFAULT_RETRY_MARKER_BUFFER,
            resolver: ResolverConfig::default(),
            target_file_size_bytes: DEFAULT_TARGET_FILE_SIZE_BYTES,
            retain_last_snapshots: DEFAULT_RETAIN_LAST_SNAPSHOTS,
            job_timeout: DEFAULT_JOB_TIMEOUT,
        }
    }

    /// TTL of the retry-pending marker.
    #[must_use]
    pub fn retry_marker_ttl(&self) -> Duration {
        self.retry_delay.saturating_add(self.retry_marker_buffer)
    }

    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a required value is missing or a
    /// value is malformed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a required value is missing or a
    /// value is malformed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Lookup(lookup);

        let delete_suffix = env
            .string("SLUICE_DELETE_SUFFIX")
            .ok_or_else(|| Error::Configuration("SLUICE_DELETE_SUFFIX is required".into()))?;
        let mut config = Self::new(delete_suffix);

        if let Some(passes) = env.u64("SLUICE_MAX_COMPACTION_PASSES")? {
            config.max_passes = u32::try_from(passes)
                .ok()
                .filter(|p| *p > 0)
                .ok_or_else(|| {
                    Error::Configuration(
                        "SLUICE_MAX_COMPACTION_PASSES must be between 1 and u32::MAX".into(),
                    )
                })?;
        }
        if let Some(ttl) = env.secs("SLUICE_LOCK_TTL_SECS")? {
            if ttl.is_zero() {
                return Err(Error::Configuration(
                    "SLUICE_LOCK_TTL_SECS must be greater than 0".into(),
                ));
            }
            config.lock_ttl = ttl;
        }
        if let Some(delay) = env.secs("SLUICE_RETRY_DELAY_SECS")? {
            config.retry_delay = delay;
        }
        if let Some(buffer) = env.secs("SLUICE_RETRY_MARKER_BUFFER_SECS")? {
            config.retry_marker_buffer = buffer;
        }
        if let Some(size) = env.u64("SLUICE_TARGET_FILE_SIZE_BYTES")? {
            if size == 0 {
                return Err(Error::Configuration(
                    "SLUICE_TARGET_FILE_SIZE_BYTES must be greater than 0".into(),
                ));
            }
            config.target_file_size_bytes = size;
        }
        if let Some(retain) = env.u64("SLUICE_RETAIN_LAST_SNAPSHOTS")? {
            config.retain_last_snapshots = u32::try_from(retain)
                .ok()
                .filter(|r| *r > 0)
                .ok_or_else(|| {
                    Error::Configuration("SLUICE_RETAIN_LAST_SNAPSHOTS must be at least 1".into())
                })?;
        }
        if let Some(timeout) = env.secs("SLUICE_JOB_TIMEOUT_SECS")? {
            config.job_timeout = timeout;
        }

        config.resolver = ResolverConfig {
            default_catalog: env
                .string("SLUICE_DEFAULT_CATALOG")
                .unwrap_or_else(|| DEFAULT_CATALOG.to_string()),
            storage_scheme: env
                .string("SLUICE_STORAGE_SCHEME")
                .unwrap_or_else(|| DEFAULT_STORAGE_SCHEME.to_string()),
            mappings: env
                .list("SLUICE_TABLE_MAPPINGS")
                .iter()
                .map(|entry| entry.parse::<TableMapping>())
                .collect::<Result<_>>()?,
            allowlist: env.list("SLUICE_TABLE_ALLOWLIST"),
        };

        Ok(config)
    }
}

struct Lookup<F>(F);

impl<F: Fn(&str) -> Option<String>> Lookup<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn u64(&self, name: &str) -> Result<Option<u64>> {
        self.string(name)
            .map(|v| {
                v.parse::<u64>()
                    .map_err(|e| Error::Configuration(format!("{name} must be an integer: {e}")))
            })
            .transpose()
    }

    fn secs(&self, name: &str) -> Result<Option<Duration>> {
        Ok(self.u64(name)?.map(Duration::from_secs))
    }

    fn list(&self, name: &str) -> Vec<String> {
        self.string(name)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<CoordinatorConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        CoordinatorConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn suffix_is_required() {
        assert!(matches!(load(&[]), Err(Error::Configuration(_))));
        assert!(matches!(
            load(&[("SLUICE_DELETE_SUFFIX", "   ")]),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn defaults_apply() {
        let config = load(&[("SLUICE_DELETE_SUFFIX", "-deletes.parquet")]).expect("config");
        assert_eq!(config.delete_suffix, "-deletes.parquet");
        assert_eq!(config.max_passes, DEFAULT_MAX_PASSES);
        assert_eq!(config.lock_ttl, DEFAULT_LOCK_TTL);
        assert_eq!(config.retry_delay, DEFAULT_RETRY_DELAY);
        assert_eq!(config.retry_marker_ttl(), Duration::from_secs(360));
        assert!(config.resolver.allowlist.is_empty());
        assert!(config.resolver.mappings.is_empty());
    }

    #[test]
    fn parses_lists_and_numbers() {
        let config = load(&[
            ("SLUICE_DELETE_SUFFIX", "-deletes.parquet"),
            ("SLUICE_MAX_COMPACTION_PASSES", "3"),
            ("SLUICE_LOCK_TTL_SECS", "60"),
            ("SLUICE_RETRY_DELAY_SECS", "10"),
            ("SLUICE_TABLE_ALLOWLIST", " db1/tableA , ,db2/tableB"),
            ("SLUICE_TABLE_MAPPINGS", "raw/ord=prod.sales.orders"),
            ("SLUICE_DEFAULT_CATALOG", "lake"),
        ])
        .expect("config");
        assert_eq!(config.max_passes, 3);
        assert_eq!(config.lock_ttl, Duration::from_secs(60));
        assert_eq!(config.retry_delay, Duration::from_secs(10));
        assert_eq!(config.resolver.allowlist, vec!["db1/tableA", "db2/tableB"]);
        assert_eq!(config.resolver.mappings.len(), 1);
        assert_eq!(config.resolver.default_catalog, "lake");
    }

    #[test]
    fn rejects_malformed_values() {
        for (name, value) in [
            ("SLUICE_MAX_COMPACTION_PASSES", "0"),
            ("SLUICE_MAX_COMPACTION_PASSES", "many"),
            ("SLUICE_LOCK_TTL_SECS", "0"),
            ("SLUICE_RETAIN_LAST_SNAPSHOTS", "0"),
            ("SLUICE_TABLE_MAPPINGS", "broken"),
        ] {
            let result = load(&[("SLUICE_DELETE_SUFFIX", "-deletes.parquet"), (name, value)]);
            assert!(result.is_err(), "{name}={value} should be rejected");
        }
    }
}
