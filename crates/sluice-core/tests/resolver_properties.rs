//! Property-based tests for table resolution.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use proptest::prelude::*;

use sluice_core::{Rejection, ResolverConfig, TableMapping, TableResolver};

fn arb_segment() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,8}"
}

fn arb_key() -> impl Strategy<Value = String> {
    (
        prop::collection::vec(arb_segment(), 0..5),
        prop::sample::select(vec!["data/", "metadata/", "data/dt=2024-01-01/", ""]),
        "[a-z0-9]{1,8}",
        prop::sample::select(vec!["-deletes.parquet", ".parquet", ".avro"]),
    )
        .prop_map(|(segments, marker, stem, suffix)| {
            let mut key = segments.join("/");
            if !key.is_empty() {
                key.push('/');
            }
            format!("{key}{marker}{stem}{suffix}")
        })
}

fn arb_config() -> impl Strategy<Value = ResolverConfig> {
    (
        prop::option::of((arb_segment(), arb_segment())),
        prop::collection::vec(arb_segment(), 0..3),
    )
        .prop_map(|(mapping, allowlist)| ResolverConfig {
            mappings: mapping
                .map(|(db, table)| {
                    format!("{db}/{table}=mapped.{db}.{table}")
                        .parse::<TableMapping>()
                        .expect("valid mapping")
                })
                .into_iter()
                .collect(),
            allowlist,
            ..ResolverConfig::default()
        })
}

proptest! {
    #[test]
    fn resolution_is_deterministic(
        config in arb_config(),
        bucket in "[a-z][a-z0-9-]{2,12}",
        key in arb_key(),
    ) {
        let first = TableResolver::new(config.clone()).resolve(&bucket, &key);
        let second = TableResolver::new(config).resolve(&bucket, &key);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn resolved_tables_render_three_components(
        bucket in "[a-z][a-z0-9-]{2,12}",
        key in arb_key(),
    ) {
        if let Ok(resolved) = TableResolver::default().resolve(&bucket, &key) {
            let rendered = resolved.table_id.to_string();
            prop_assert_eq!(rendered.split('.').count(), 3);
            let expected_root = format!("s3://{bucket}");
            prop_assert!(resolved.warehouse_root.as_str().starts_with(&expected_root));
        }
    }

    #[test]
    fn allowlist_only_ever_narrows(
        config in arb_config(),
        bucket in "[a-z][a-z0-9-]{2,12}",
        key in arb_key(),
    ) {
        let open = ResolverConfig { allowlist: Vec::new(), ..config.clone() };
        let filtered = TableResolver::new(config).resolve(&bucket, &key);
        let unfiltered = TableResolver::new(open).resolve(&bucket, &key);
        match filtered {
            Ok(resolved) => prop_assert_eq!(Ok(resolved), unfiltered),
            Err(Rejection::NotAllowlisted { table_id }) => {
                prop_assert_eq!(unfiltered.map(|r| r.table_id), Ok(table_id));
            }
            Err(other) => prop_assert_eq!(Err(other), unfiltered),
        }
    }
}
