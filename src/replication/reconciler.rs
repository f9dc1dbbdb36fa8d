// ABOUTME: Reconciler - removes target rows whose primary key is gone from the source
// ABOUTME: Full key scan of both sides, set difference in memory, keyed batch deletes

use std::collections::HashSet;
use tokio_postgres::Transaction;

use super::reader::{build_key_scan_query, ChangeFeed};
use super::record::{key_of, Value};
use super::writer::Upserter;
use crate::config::ResolvedTable;
use crate::error::{Error, Result};

/// Deletes orphaned target rows.
///
/// This is a full reconciliation, independent of the change window: every
/// key of the source is compared against every key of the target.
#[derive(Clone)]
pub struct Reconciler {
    feed: ChangeFeed,
    upserter: Upserter,
}

impl Reconciler {
    pub fn new(feed: ChangeFeed, upserter: Upserter) -> Self {
        Self { feed, upserter }
    }

    /// Remove target rows of `table` whose key tuple is absent from the source.
    ///
    /// Source keys come from a pooled source connection; target keys are read
    /// and deleted on `txn`. Returns the number of deleted rows.
    pub async fn remove_orphans(&self, txn: &Transaction<'_>, table: &ResolvedTable) -> Result<u64> {
        let source_keys = self.feed.scan_primary_keys(table).await?;

        let rows = txn
            .query(
                &build_key_scan_query(&table.target_sql_name(), &table.primary_key),
                &[],
            )
            .await
            .map_err(|e| {
                Error::database(
                    format!("Failed to scan primary keys of {}", table.target_qualified()),
                    e,
                )
            })?;
        let target_keys = rows
            .iter()
            .map(|row| {
                (0..row.len())
                    .map(|idx| Value::from_row(row, idx))
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        let orphans = find_orphans(&source_keys, target_keys);
        if orphans.is_empty() {
            tracing::debug!(
                "No orphaned rows in {} ({} source keys)",
                table.target_qualified(),
                source_keys.len()
            );
            return Ok(0);
        }

        tracing::info!(
            "Removing {} orphaned rows from {}",
            orphans.len(),
            table.target_qualified()
        );
        self.upserter
            .delete_rows(txn, table, &table.primary_key, &orphans)
            .await
    }
}

/// Target key tuples that have no counterpart in `source_keys`.
///
/// Tuples are compared in canonical form so that equal values of different
/// widths or scales on the two sides still match.
pub fn find_orphans(source_keys: &[Vec<Value>], target_keys: Vec<Vec<Value>>) -> Vec<Vec<Value>> {
    let present: HashSet<Vec<String>> = source_keys.iter().map(|key| key_of(key)).collect();
    target_keys
        .into_iter()
        .filter(|key| !present.contains(&key_of(key)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn ids(values: &[i32]) -> Vec<Vec<Value>> {
        values.iter().map(|v| vec![Value::Int32(*v)]).collect()
    }

    #[test]
    fn test_find_orphans_single_key() {
        let orphans = find_orphans(&ids(&[1, 3]), ids(&[1, 2, 3, 4]));
        assert_eq!(orphans, ids(&[2, 4]));
    }

    #[test]
    fn test_find_orphans_keeps_present_rows() {
        assert!(find_orphans(&ids(&[1, 2, 3]), ids(&[1, 2, 3])).is_empty());
        assert!(find_orphans(&ids(&[1, 2, 3]), Vec::new()).is_empty());
    }

    #[test]
    fn test_find_orphans_empty_source_removes_everything() {
        let orphans = find_orphans(&[], ids(&[7, 8]));
        assert_eq!(orphans, ids(&[7, 8]));
    }

    #[test]
    fn test_find_orphans_composite_key() {
        let key = |doc: &str, share: i64| vec![Value::Text(doc.to_string()), Value::Int64(share)];
        let source = vec![key("DOC-1", 1), key("DOC-2", 1)];
        let target = vec![key("DOC-1", 1), key("DOC-1", 2), key("DOC-2", 1)];

        assert_eq!(find_orphans(&source, target), vec![key("DOC-1", 2)]);
    }

    #[test]
    fn test_find_orphans_matches_across_numeric_scale() {
        // source numeric, target mirrored as numeric(19,2)
        let source = vec![vec![Value::Numeric(Decimal::from_str("10.5").unwrap())]];
        let target = vec![
            vec![Value::Numeric(Decimal::from_str("10.50").unwrap())],
            vec![Value::Numeric(Decimal::from_str("11.00").unwrap())],
        ];

        let orphans = find_orphans(&source, target);
        assert_eq!(
            orphans,
            vec![vec![Value::Numeric(Decimal::from_str("11.00").unwrap())]]
        );
    }

    #[test]
    fn test_find_orphans_quotes_are_just_values() {
        let source = vec![vec![Value::Text("O'Brien".to_string())]];
        let target = vec![
            vec![Value::Text("O'Brien".to_string())],
            vec![Value::Text("x') OR 1=1 --".to_string())],
        ];
        assert_eq!(
            find_orphans(&source, target),
            vec![vec![Value::Text("x') OR 1=1 --".to_string())]]
        );
    }
}
