use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde_json::Value;
use sha2::{Digest as _, Sha256};

use crate::snapshot::{DbState, ModifiedRow, Row, TableDiff};

/// Computes the per-table diff between two database states.
///
/// When every row on both sides carries an `id` column, rows are matched by
/// id and value changes surface as `modified` pairs. Otherwise rows are
/// matched by a structural hash, which can only classify rows as added or
/// removed.
pub fn compute_diff(before: &DbState, after: &DbState) -> BTreeMap<String, TableDiff> {
    let mut tables: BTreeSet<&String> = before.keys().collect();
    tables.extend(after.keys());

    let mut diffs = BTreeMap::new();
    for table in tables {
        let before_rows = before.get(table).map(Vec::as_slice).unwrap_or_default();
        let after_rows = after.get(table).map(Vec::as_slice).unwrap_or_default();
        diffs.insert(table.clone(), diff_table(before_rows, after_rows));
    }
    diffs
}

fn diff_table(before: &[Row], after: &[Row]) -> TableDiff {
    let mut diff = TableDiff::default();

    if let (Some(before_by_id), Some(after_by_id)) = (index_by_id(before), index_by_id(after)) {
        for row in before {
            let id = scalar_key(&row["id"]);
            match after_by_id.get(&id) {
                Some(after_row) => {
                    if !rows_equal(row, after_row) {
                        diff.modified.push(ModifiedRow {
                            before: row.clone(),
                            after: (*after_row).clone(),
                        });
                    }
                }
                None => diff.removed.push(row.clone()),
            }
        }
        for row in after {
            if !before_by_id.contains_key(&scalar_key(&row["id"])) {
                diff.added.push(row.clone());
            }
        }
    } else {
        let before_hashes: HashSet<String> = before.iter().map(hash_row).collect();
        let after_hashes: HashSet<String> = after.iter().map(hash_row).collect();

        for row in before {
            if !after_hashes.contains(&hash_row(row)) {
                diff.removed.push(row.clone());
            }
        }
        for row in after {
            if !before_hashes.contains(&hash_row(row)) {
                diff.added.push(row.clone());
            }
        }
    }

    diff
}

/// Index rows by their `id` column; `None` when any row lacks one.
fn index_by_id(rows: &[Row]) -> Option<HashMap<String, &Row>> {
    let mut index = HashMap::with_capacity(rows.len());
    for row in rows {
        let id = row.get("id")?;
        index.insert(scalar_key(id), row);
    }
    Some(index)
}

/// Stringified form of a scalar, so a numeric id and its textual rendering
/// agree on identity.
pub(crate) fn scalar_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn rows_equal(a: &Row, b: &Row) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().all(|(column, value)| {
        b.get(column)
            .is_some_and(|other| scalar_key(value) == scalar_key(other))
    })
}

/// SHA-256 over the stable JSON serialization of a row (key-sorted maps).
fn hash_row(row: &Row) -> String {
    use std::fmt::Write as _;

    let serialized = serde_json::to_vec(row).unwrap_or_default();
    let digest = Sha256::digest(&serialized);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
