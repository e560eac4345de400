//! Table resolution from raw storage locations.
//!
//! [`TableResolver::resolve`] maps the bucket and key of a newly created
//! delete artifact to the table that owns it. Resolution is a pure function
//! of its inputs and the resolver configuration: the dispatcher may see the
//! same event twice and both deliveries must contend for the same lock key.
//!
//! # Rules
//!
//! 1. The storage prefix is the key up to the first `/data/` or `/metadata/`
//!    segment, or the key minus its filename when neither marker is present.
//! 2. Explicit mappings win. The longest mapping prefix that equals the
//!    storage prefix, or is a `/`-bounded prefix of it, supplies the table.
//! 3. Otherwise path segments are transliterated: `db/table` becomes
//!    `{default_catalog}.db.table`; three or more segments use the last three
//!    as `catalog/db/table` and fold the leading ones into the warehouse root.
//!    A trailing `.db` on the database segment is dropped.
//! 4. With a non-empty allowlist the candidate must match an entry exactly or
//!    by `/`-bounded (path form) or `.`-bounded (identifier form) prefix.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::table::{TableIdentifier, WarehouseRoot};

/// Default catalog used when a path carries only database and table.
pub const DEFAULT_CATALOG: &str = "catalog";

/// Default scheme for warehouse roots.
pub const DEFAULT_STORAGE_SCHEME: &str = "s3";

/// Table-root segments in priority order.
const TABLE_MARKERS: [&str; 2] = ["/data/", "/metadata/"];

/// Explicit `prefix → table` override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMapping {
    /// Storage prefix, without leading or trailing `/`.
    pub prefix: String,
    /// Table the prefix belongs to.
    pub table_id: TableIdentifier,
}

impl FromStr for TableMapping {
    type Err = Error;

    /// Parses `prefix=catalog.database.table`.
    fn from_str(s: &str) -> Result<Self> {
        let (prefix, table) = s.split_once('=').ok_or_else(|| {
            Error::Configuration(format!(
                "table mapping '{s}' must be 'prefix=catalog.database.table'"
            ))
        })?;
        let prefix = prefix.trim().trim_matches('/');
        if prefix.is_empty() {
            return Err(Error::Configuration(format!(
                "table mapping '{s}' has an empty prefix"
            )));
        }
        let table_id = table
            .trim()
            .parse::<TableIdentifier>()
            .map_err(|e| Error::Configuration(format!("table mapping '{s}': {e}")))?;
        Ok(Self {
            prefix: prefix.to_string(),
            table_id,
        })
    }
}

/// Resolver settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Catalog used for two-segment paths.
    pub default_catalog: String,
    /// Scheme of produced warehouse roots (`s3`, `gs`, ...).
    pub storage_scheme: String,
    /// Explicit overrides, consulted before transliteration.
    pub mappings: Vec<TableMapping>,
    /// Allowed tables; empty means no filtering.
    pub allowlist: Vec<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            default_catalog: DEFAULT_CATALOG.to_string(),
            storage_scheme: DEFAULT_STORAGE_SCHEME.to_string(),
            mappings: Vec::new(),
            allowlist: Vec::new(),
        }
    }
}

/// Successful resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedTable {
    /// Table that owns the artifact.
    pub table_id: TableIdentifier,
    /// Warehouse the table lives in.
    pub warehouse_root: WarehouseRoot,
    /// Storage prefix the decision was derived from.
    pub storage_prefix: String,
}

/// Why a location did not resolve to a dispatchable table.
///
/// Rejections are intentional filters; the event is dropped, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Rejection {
    /// The key has no directory component to derive a table from.
    NoTablePrefix {
        /// Offending key.
        key: String,
    },
    /// The prefix does not transliterate to a valid identifier.
    Unresolvable {
        /// Storage prefix that was tried.
        prefix: String,
    },
    /// The table is not on the configured allowlist.
    NotAllowlisted {
        /// Table that was filtered.
        table_id: TableIdentifier,
    },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoTablePrefix { key } => write!(f, "key '{key}' has no table prefix"),
            Self::Unresolvable { prefix } => {
                write!(f, "prefix '{prefix}' does not name a table")
            }
            Self::NotAllowlisted { table_id } => write!(f, "table {table_id} is not allowlisted"),
        }
    }
}

/// Maps storage locations to tables.
#[derive(Debug, Clone, Default)]
pub struct TableResolver {
    config: ResolverConfig,
}

impl TableResolver {
    /// Creates a resolver.
    #[must_use]
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    /// Returns the resolver configuration.
    #[must_use]
    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Resolves a delete artifact location to its table.
    ///
    /// # Errors
    ///
    /// Returns a [`Rejection`] when the location is filtered out. This is not
    /// a failure; callers drop the event.
    pub fn resolve(
        &self,
        bucket: &str,
        object_key: &str,
    ) -> std::result::Result<ResolvedTable, Rejection> {
        let prefix = storage_prefix(object_key).ok_or_else(|| Rejection::NoTablePrefix {
            key: object_key.to_string(),
        })?;

        let resolved = match self.mapping_for(prefix) {
            Some(mapping) => ResolvedTable {
                table_id: mapping.table_id.clone(),
                warehouse_root: WarehouseRoot::new(&self.config.storage_scheme, bucket, ""),
                storage_prefix: prefix.to_string(),
            },
            None => self.transliterate(bucket, prefix)?,
        };

        if !self.is_allowed(&resolved) {
            return Err(Rejection::NotAllowlisted {
                table_id: resolved.table_id,
            });
        }
        Ok(resolved)
    }

    fn mapping_for(&self, prefix: &str) -> Option<&TableMapping> {
        self.config
            .mappings
            .iter()
            .filter(|m| bounded_prefix(prefix, &m.prefix, '/'))
            .max_by_key(|m| m.prefix.len())
    }

    fn transliterate(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> std::result::Result<ResolvedTable, Rejection> {
        let unresolvable = || Rejection::Unresolvable {
            prefix: prefix.to_string(),
        };
        let segments: Vec<&str> = prefix.split('/').collect();
        let (root, catalog, database, table) = match segments.as_slice() {
            [database, table] => ("", self.config.default_catalog.as_str(), *database, *table),
            [.., catalog, database, table] => {
                let root_len = segments.len() - 3;
                let root_end = segments[..root_len]
                    .iter()
                    .map(|s| s.len() + 1)
                    .sum::<usize>()
                    .saturating_sub(1);
                (&prefix[..root_end], *catalog, *database, *table)
            }
            _ => return Err(unresolvable()),
        };
        let database = database.strip_suffix(".db").unwrap_or(database);
        let table_id = TableIdentifier::new(catalog, database, table).map_err(|_| unresolvable())?;
        Ok(ResolvedTable {
            table_id,
            warehouse_root: WarehouseRoot::new(&self.config.storage_scheme, bucket, root),
            storage_prefix: prefix.to_string(),
        })
    }

    fn is_allowed(&self, resolved: &ResolvedTable) -> bool {
        if self.config.allowlist.is_empty() {
            return true;
        }
        let table_id = resolved.table_id.to_string();
        self.config.allowlist.iter().any(|entry| {
            let entry = entry.trim().trim_matches('/');
            !entry.is_empty()
                && (bounded_prefix(&resolved.storage_prefix, entry, '/')
                    || bounded_prefix(&table_id, entry, '.'))
        })
    }
}

/// Derives the table's storage prefix from an object key.
///
/// The first `/data/` segment marks the table root. `/metadata/` is only
/// consulted when the key has no `/data/` segment, and keys with neither
/// fall back to the parent directory.
fn storage_prefix(object_key: &str) -> Option<&str> {
    let key = object_key.trim_start_matches('/');
    let prefix = TABLE_MARKERS
        .iter()
        .find_map(|marker| key.find(marker))
        .map_or_else(|| key.rsplit_once('/').map(|(dir, _)| dir), |at| Some(&key[..at]))?;
    let prefix = prefix.trim_matches('/');
    (!prefix.is_empty()).then_some(prefix)
}

/// `candidate == entry`, or `candidate` starts with `entry` followed by `sep`.
fn bounded_prefix(candidate: &str, entry: &str, sep: char) -> bool {
    candidate
        .strip_prefix(entry)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with(sep))
}
