use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::diff::scalar_key;
use crate::snapshot::{DbState, HttpResponse, Row};

/// A single difference between expected and actual values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diff {
    pub path: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub expected: Value,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub actual: Value,
    pub message: String,
}

impl Diff {
    fn new(path: impl Into<String>, expected: Value, actual: Value, message: &str) -> Self {
        Self {
            path: path.into(),
            expected,
            actual,
            message: message.to_owned(),
        }
    }
}

/// Assertion behavior knobs: field paths excluded from comparison and tables
/// whose row order does not matter.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub ignore_fields: Vec<String>,
    pub order_insensitive: HashSet<String>,
}

static UUID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .expect("uuid pattern is valid")
});
static ISO_DATE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}(T\d{2}:\d{2}:\d{2})?").expect("iso date pattern is valid")
});

/// Compares an expected and actual HTTP response: status plus body.
pub fn assert_response(expected: &HttpResponse, actual: &HttpResponse, opts: &Options) -> Vec<Diff> {
    let mut diffs = Vec::new();

    if expected.status != actual.status {
        diffs.push(Diff::new(
            "response.status",
            Value::from(expected.status),
            Value::from(actual.status),
            "Status code mismatch",
        ));
    }

    diffs.extend(compare_values(
        "response.body",
        &expected.body,
        &actual.body,
        opts,
    ));
    diffs
}

/// Compares expected and actual database states table by table.
pub fn assert_db_state(expected: &DbState, actual: &DbState, opts: &Options) -> Vec<Diff> {
    let mut diffs = Vec::new();

    let mut tables: BTreeSet<&String> = expected.keys().collect();
    tables.extend(actual.keys());

    for table in tables {
        let path = format!("db.{table}");
        let (Some(expected_rows), Some(actual_rows)) = (expected.get(table), actual.get(table))
        else {
            if let Some(actual_rows) = actual.get(table) {
                diffs.push(Diff::new(
                    path,
                    Value::Null,
                    rows_value(actual_rows),
                    "Unexpected table in actual DB state",
                ));
            } else if let Some(expected_rows) = expected.get(table) {
                diffs.push(Diff::new(
                    path,
                    rows_value(expected_rows),
                    Value::Null,
                    "Table missing from actual DB state",
                ));
            }
            continue;
        };

        if expected_rows.len() != actual_rows.len() {
            diffs.push(Diff::new(
                format!("{path}.length"),
                Value::from(expected_rows.len()),
                Value::from(actual_rows.len()),
                &format!("Row count mismatch in table {table}"),
            ));
        }

        let order_insensitive = opts.order_insensitive.contains(table);
        diffs.extend(compare_row_sets(
            &path,
            expected_rows,
            actual_rows,
            order_insensitive,
            opts,
        ));
    }

    diffs
}

fn compare_row_sets(
    base_path: &str,
    expected: &[Row],
    actual: &[Row],
    order_insensitive: bool,
    opts: &Options,
) -> Vec<Diff> {
    let mut diffs = Vec::new();

    if order_insensitive {
        if let (Some(expected_by_id), Some(actual_by_id)) = (index_rows(expected), index_rows(actual))
        {
            for row in expected {
                let id = scalar_key(&row["id"]);
                let path = format!("{base_path}[id={id}]");
                match actual_by_id.get(&id) {
                    Some(actual_row) => {
                        diffs.extend(compare_maps(&path, row, actual_row, opts));
                    }
                    None => diffs.push(Diff::new(
                        path,
                        Value::Object(row.clone()),
                        Value::Null,
                        "Missing row in actual",
                    )),
                }
            }
            for row in actual {
                let id = scalar_key(&row["id"]);
                if !expected_by_id.contains_key(&id) {
                    diffs.push(Diff::new(
                        format!("{base_path}[id={id}]"),
                        Value::Null,
                        Value::Object(row.clone()),
                        "Extra row in actual",
                    ));
                }
            }
            return diffs;
        }
    }

    // Positional comparison.
    let max_len = expected.len().max(actual.len());
    for index in 0..max_len {
        let path = format!("{base_path}[{index}]");
        match (expected.get(index), actual.get(index)) {
            (Some(expected_row), Some(actual_row)) => {
                diffs.extend(compare_maps(&path, expected_row, actual_row, opts));
            }
            (Some(expected_row), None) => diffs.push(Diff::new(
                path,
                Value::Object(expected_row.clone()),
                Value::Null,
                "Missing row in actual",
            )),
            (None, Some(actual_row)) => diffs.push(Diff::new(
                path,
                Value::Null,
                Value::Object(actual_row.clone()),
                "Extra row in actual",
            )),
            (None, None) => {}
        }
    }
    diffs
}

fn compare_maps(
    base_path: &str,
    expected: &serde_json::Map<String, Value>,
    actual: &serde_json::Map<String, Value>,
    opts: &Options,
) -> Vec<Diff> {
    let mut diffs = Vec::new();

    let mut keys: BTreeSet<&String> = expected.keys().collect();
    keys.extend(actual.keys());

    for key in keys {
        let path = format!("{base_path}.{key}");
        if is_ignored(&path, &opts.ignore_fields) {
            continue;
        }

        match (expected.get(key), actual.get(key)) {
            (Some(expected_value), Some(actual_value)) => {
                diffs.extend(compare_values(&path, expected_value, actual_value, opts));
            }
            (Some(expected_value), None) => diffs.push(Diff::new(
                path,
                expected_value.clone(),
                Value::Null,
                "Missing field",
            )),
            (None, Some(actual_value)) => diffs.push(Diff::new(
                path,
                Value::Null,
                actual_value.clone(),
                "Unexpected field",
            )),
            (None, None) => {}
        }
    }
    diffs
}

fn compare_values(path: &str, expected: &Value, actual: &Value, opts: &Options) -> Vec<Diff> {
    if is_ignored(path, &opts.ignore_fields) {
        return Vec::new();
    }

    if let Value::String(pattern) = expected {
        if matches_dynamic(pattern, actual) {
            return Vec::new();
        }
    }

    match (expected, actual) {
        (Value::Object(expected_map), Value::Object(actual_map)) => {
            compare_maps(path, expected_map, actual_map, opts)
        }
        (Value::Array(expected_items), Value::Array(actual_items)) => {
            compare_sequences(path, expected_items, actual_items, opts)
        }
        (Value::Object(_), _)
        | (_, Value::Object(_))
        | (Value::Array(_), _)
        | (_, Value::Array(_)) => type_mismatch(path, expected, actual),
        _ => {
            if scalars_equal(expected, actual) {
                Vec::new()
            } else {
                vec![Diff::new(
                    path,
                    expected.clone(),
                    actual.clone(),
                    "Value mismatch",
                )]
            }
        }
    }
}

fn compare_sequences(
    path: &str,
    expected: &[Value],
    actual: &[Value],
    opts: &Options,
) -> Vec<Diff> {
    let mut diffs = Vec::new();

    if expected.len() != actual.len() {
        diffs.push(Diff::new(
            format!("{path}.length"),
            Value::from(expected.len()),
            Value::from(actual.len()),
            "Array length mismatch",
        ));
    }

    let max_len = expected.len().max(actual.len());
    for index in 0..max_len {
        let elem_path = format!("{path}[{index}]");
        match (expected.get(index), actual.get(index)) {
            (Some(expected_item), Some(actual_item)) => {
                diffs.extend(compare_values(&elem_path, expected_item, actual_item, opts));
            }
            (Some(expected_item), None) => diffs.push(Diff::new(
                elem_path,
                expected_item.clone(),
                Value::Null,
                "Missing element",
            )),
            (None, Some(actual_item)) => diffs.push(Diff::new(
                elem_path,
                Value::Null,
                actual_item.clone(),
                "Extra element",
            )),
            (None, None) => {}
        }
    }
    diffs
}

fn type_mismatch(path: &str, expected: &Value, actual: &Value) -> Vec<Diff> {
    vec![Diff::new(
        path,
        expected.clone(),
        actual.clone(),
        "Type mismatch",
    )]
}

/// Scalar equality after numeric normalization: `1` and `1.0` compare equal,
/// and a number compares equal to its textual rendering.
fn scalars_equal(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        _ => scalar_text(expected) == scalar_text(actual),
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => number_text(n),
        other => other.to_string(),
    }
}

fn number_text(number: &serde_json::Number) -> String {
    if let Some(int) = number.as_i64() {
        return int.to_string();
    }
    if let Some(int) = number.as_u64() {
        return int.to_string();
    }
    let float = number.as_f64().unwrap_or_default();
    if float.fract() == 0.0 && float.abs() < 9.0e15 {
        return format!("{}", float as i64);
    }
    float.to_string()
}

fn matches_dynamic(pattern: &str, actual: &Value) -> bool {
    match pattern {
        "__ANY__" => true,
        "__UUID__" => actual
            .as_str()
            .is_some_and(|s| UUID_PATTERN.is_match(s)),
        "__ISO_DATE__" => actual
            .as_str()
            .is_some_and(|s| ISO_DATE_PATTERN.is_match(s)),
        _ => false,
    }
}

/// A field path is skipped when it matches an ignore pattern: exact match,
/// `*.<suffix>` suffix match, or a `*` wildcard anywhere in the pattern.
fn is_ignored(path: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| match_glob(pattern, path))
}

fn match_glob(pattern: &str, path: &str) -> bool {
    if pattern == path {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        if suffix.starts_with('.') && path.ends_with(suffix) {
            return true;
        }
    }
    if pattern.contains('*') {
        let regex_str = format!("^{}$", regex::escape(pattern).replace(r"\*", ".*"));
        if let Ok(regex) = Regex::new(&regex_str) {
            return regex.is_match(path);
        }
    }
    false
}

fn index_rows(rows: &[Row]) -> Option<HashMap<String, &Row>> {
    let mut index = HashMap::with_capacity(rows.len());
    for row in rows {
        let id = row.get("id")?;
        index.insert(scalar_key(id), row);
    }
    Some(index)
}

fn rows_value(rows: &[Row]) -> Value {
    Value::Array(rows.iter().cloned().map(Value::Object).collect())
}

/// Renders a human-readable diff report.
pub fn format_diffs(diffs: &[Diff]) -> String {
    if diffs.is_empty() {
        return "No differences found.".to_owned();
    }

    let mut out = String::new();
    let _ = writeln!(out, "Found {} difference(s):\n", diffs.len());
    for (index, diff) in diffs.iter().enumerate() {
        let _ = writeln!(out, "  {}) {}", index + 1, diff.path);
        let _ = writeln!(out, "     {}", diff.message);
        if !diff.expected.is_null() {
            let _ = writeln!(out, "     expected: {}", diff.expected);
        }
        if !diff.actual.is_null() {
            let _ = writeln!(out, "     actual:   {}", diff.actual);
        }
        out.push('\n');
    }
    out
}
