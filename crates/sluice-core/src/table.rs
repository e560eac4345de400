//! Table identity.
//!
//! A [`TableIdentifier`] is the lock key for coordination and the parameter
//! handed to compaction jobs. It renders as `catalog.database.table`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Fully-qualified table identifier: catalog namespace, database, table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableIdentifier {
    catalog: String,
    database: String,
    table: String,
}

impl TableIdentifier {
    /// Creates a table identifier from its three components.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidId`] if any component is empty or contains a
    /// `.` or `/`, which would make the rendered form ambiguous.
    pub fn new(
        catalog: impl Into<String>,
        database: impl Into<String>,
        table: impl Into<String>,
    ) -> Result<Self> {
        let id = Self {
            catalog: catalog.into(),
            database: database.into(),
            table: table.into(),
        };
        for (what, part) in [
            ("catalog", &id.catalog),
            ("database", &id.database),
            ("table", &id.table),
        ] {
            if part.is_empty() {
                return Err(Error::InvalidId {
                    message: format!("{what} component is empty"),
                });
            }
            if part.contains(['.', '/']) {
                return Err(Error::InvalidId {
                    message: format!("{what} component '{part}' contains '.' or '/'"),
                });
            }
        }
        Ok(id)
    }

    /// Catalog namespace.
    #[must_use]
    pub fn catalog(&self) -> &str {
        &self.catalog
    }

    /// Database name.
    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Table name.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Key used for the table's lock record and retry marker.
    #[must_use]
    pub fn lock_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TableIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.catalog, self.database, self.table)
    }
}

impl FromStr for TableIdentifier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('.');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(catalog), Some(database), Some(table), None) => {
                Self::new(catalog, database, table)
            }
            _ => Err(Error::InvalidId {
                message: format!("table identifier '{s}' must be 'catalog.database.table'"),
            }),
        }
    }
}

/// Root URI of the warehouse a table lives in, e.g. `s3://warehouse`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WarehouseRoot(String);

impl WarehouseRoot {
    /// Builds a warehouse root from a scheme, bucket and optional key prefix.
    #[must_use]
    pub fn new(scheme: &str, bucket: &str, prefix: &str) -> Self {
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            Self(format!("{scheme}://{bucket}"))
        } else {
            Self(format!("{scheme}://{bucket}/{prefix}"))
        }
    }

    /// Returns the URI.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WarehouseRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_dotted_form() {
        let id = TableIdentifier::new("catalog", "sales", "orders").expect("valid");
        assert_eq!(id.to_string(), "catalog.sales.orders");
        assert_eq!(id.lock_key(), "catalog.sales.orders");
    }

    #[test]
    fn parses_dotted_form() {
        let id: TableIdentifier = "prod.sales.orders".parse().expect("parse");
        assert_eq!(id.catalog(), "prod");
        assert_eq!(id.database(), "sales");
        assert_eq!(id.table(), "orders");
    }

    #[test]
    fn rejects_wrong_arity_and_empty_parts() {
        assert!("sales.orders".parse::<TableIdentifier>().is_err());
        assert!("a.b.c.d".parse::<TableIdentifier>().is_err());
        assert!("a..c".parse::<TableIdentifier>().is_err());
        assert!(TableIdentifier::new("a", "b/c", "d").is_err());
    }

    #[test]
    fn warehouse_root_trims_prefix() {
        assert_eq!(WarehouseRoot::new("s3", "wh", "").as_str(), "s3://wh");
        assert_eq!(
            WarehouseRoot::new("s3", "wh", "/lake/").as_str(),
            "s3://wh/lake"
        );
    }
}
