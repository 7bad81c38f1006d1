//! Schema-less custom query engine.
//!
//! Runs user-declared SQL against a target's live connection with no
//! compile-time knowledge of the result shape. Declared metric and label
//! column hints are joined against the actual result-set columns through
//! name normalization, cell values are decoded into a tagged variant, and
//! one gauge series is emitted per (row, resolvable metric column) pair.
//!
//! Nothing in here propagates an error to the orchestrator: a failed query,
//! an unresolvable column or a non-numeric metric cell only costs its own
//! contribution to the cycle.

use prometheus::GaugeVec;
use sqlx::postgres::PgRow;
use sqlx::types::BigDecimal;
use sqlx::{Column, PgConnection, Row};
use std::collections::HashMap;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::collectors::connection::DB_OP_TIMEOUT;
use crate::config::{CustomQuery, Target};

/// Normalize a declared or result-set column name: ASCII-lowercase, with
/// every non-alphanumeric character dropped. This is the join key between
/// declared intent and actual column names, so "Cache Hit Ratio" and
/// "cachehitratio" resolve as equal. Idempotent.
#[must_use]
pub fn normalize_name(raw: &str) -> String {
    raw.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// A fetched cell value, reduced to the three shapes the engine cares about.
#[derive(Clone, Debug, PartialEq)]
pub enum CellValue {
    Text(String),
    Number(f64),
    Null,
}

impl CellValue {
    /// Metric columns accept numbers only; anything else yields no sample.
    fn as_metric(&self) -> Option<f64> {
        match self {
            Self::Number(v) => Some(*v),
            Self::Text(_) | Self::Null => None,
        }
    }

    /// Labels accept string-or-number: text verbatim, integral floats as
    /// decimal integer strings, fractional floats in scientific notation.
    /// Null yields no value.
    fn as_label(&self) -> Option<String> {
        match self {
            Self::Text(s) => Some(s.clone()),
            #[allow(clippy::cast_possible_truncation)]
            Self::Number(v) => {
                if v.is_finite() && v.trunc() == *v && v.abs() < 9_007_199_254_740_992.0 {
                    Some(format!("{}", *v as i64))
                } else {
                    Some(format!("{v:e}"))
                }
            }
            Self::Null => None,
        }
    }
}

/// Decode one cell without knowing its SQL type up front. The driver rejects
/// mismatched decodes, so each candidate type is tried in turn; a cell no
/// candidate accepts is treated as null.
fn decode_cell(row: &PgRow, idx: usize) -> CellValue {
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map_or(CellValue::Null, CellValue::Number);
    }
    if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
        return v.map_or(CellValue::Null, |f| CellValue::Number(f64::from(f)));
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        #[allow(clippy::cast_precision_loss)]
        return v.map_or(CellValue::Null, |i| CellValue::Number(i as f64));
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
        return v.map_or(CellValue::Null, |i| CellValue::Number(f64::from(i)));
    }
    if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
        return v.map_or(CellValue::Null, |i| CellValue::Number(f64::from(i)));
    }
    // NUMERIC/DECIMAL, the type of sum(), avg() and round(); the typed float
    // decodes above reject it.
    if let Ok(v) = row.try_get::<Option<BigDecimal>, _>(idx) {
        return decimal_to_cell(v);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.map_or(CellValue::Null, CellValue::Text);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return v.map_or(CellValue::Null, |b| CellValue::Text(b.to_string()));
    }
    CellValue::Null
}

/// An arbitrary-precision decimal reduced to f64; a value outside f64 range
/// is treated like null rather than emitting a distorted sample.
fn decimal_to_cell(v: Option<BigDecimal>) -> CellValue {
    v.and_then(|d| d.to_string().parse::<f64>().ok())
        .filter(|f| f.is_finite())
        .map_or(CellValue::Null, CellValue::Number)
}

/// Declared columns resolved against one result set.
struct ResolvedColumns {
    /// (declared metric name, column index) for every hint that matched.
    metrics: Vec<(String, usize)>,
    /// (normalized label name, column index) for every declared label; a
    /// `None` index means the hint did not match and the label stays empty.
    labels: Vec<(String, Option<usize>)>,
}

fn resolve_columns(query: &CustomQuery, columns: &[String]) -> ResolvedColumns {
    let mut index: HashMap<String, usize> = HashMap::with_capacity(columns.len());
    for (i, col) in columns.iter().enumerate() {
        // First occurrence wins when two columns normalize to the same name.
        index.entry(normalize_name(col)).or_insert(i);
    }

    let metrics = query
        .metrics
        .iter()
        .filter_map(|metric| {
            index.get(&normalize_name(metric)).map_or_else(
                || {
                    warn!(query = %query.name, column = %metric, "metric column not found in result set");
                    None
                },
                |&i| Some((metric.clone(), i)),
            )
        })
        .collect();

    let labels = query
        .labels
        .iter()
        .map(|label| {
            let resolved = index.get(&normalize_name(label)).copied();
            if resolved.is_none() {
                warn!(query = %query.name, column = %label, "label column not found in result set");
            }
            (normalize_name(label), resolved)
        })
        .collect();

    ResolvedColumns { metrics, labels }
}

/// One emitted series: the assembled label map plus the numeric value.
struct Sample {
    labels: HashMap<String, String>,
    value: f64,
}

fn samples_for_rows(
    resolved: &ResolvedColumns,
    rows: &[Vec<CellValue>],
    target: &Target,
    with_rownum: bool,
) -> Vec<Sample> {
    let mut samples = Vec::new();

    for (offset, row) in rows.iter().enumerate() {
        let rownum = offset + 1;

        for (metric_name, metric_idx) in &resolved.metrics {
            let Some(value) = row.get(*metric_idx).and_then(CellValue::as_metric) else {
                // Non-numeric metric cell: no sample for this column on this
                // row, siblings still emit.
                continue;
            };

            let mut labels = HashMap::new();
            labels.insert("database".to_string(), target.name.clone());
            labels.insert("dbinstance".to_string(), target.instance.clone());
            labels.insert("metric".to_string(), metric_name.clone());
            if with_rownum {
                labels.insert("rownum".to_string(), rownum.to_string());
            }

            for (label_name, label_idx) in &resolved.labels {
                let value = label_idx
                    .and_then(|i| row.get(i))
                    .and_then(CellValue::as_label)
                    .unwrap_or_default();
                labels.insert(label_name.clone(), value);
            }

            samples.push(Sample { labels, value });
        }
    }

    samples
}

/// The label names a custom query's metric family is registered with:
/// normalized declared labels plus the fixed identity labels, with the row
/// counter appended unless disabled process-wide.
#[must_use]
pub fn family_label_names(query: &CustomQuery, with_rownum: bool) -> Vec<String> {
    let mut names: Vec<String> = query.labels.iter().map(|l| normalize_name(l)).collect();
    names.push("metric".to_string());
    names.push("database".to_string());
    names.push("dbinstance".to_string());
    if with_rownum {
        names.push("rownum".to_string());
    }
    names
}

/// Executes the declared queries of a target against its live connection.
#[derive(Clone, Copy)]
pub struct CustomQueryEngine {
    with_rownum: bool,
}

impl CustomQueryEngine {
    #[must_use]
    pub const fn new(with_rownum: bool) -> Self {
        Self { with_rownum }
    }

    /// Run one custom query and set the emitted series on its gauge family.
    /// Failures are logged and absorbed; the caller moves on to the next
    /// query regardless.
    pub async fn run(
        &self,
        conn: &mut PgConnection,
        target: &Target,
        query: &CustomQuery,
        family: &GaugeVec,
    ) {
        let rows = match timeout(DB_OP_TIMEOUT, sqlx::query(&query.sql).fetch_all(&mut *conn)).await
        {
            Ok(Ok(rows)) => rows,
            Ok(Err(e)) => {
                warn!(query = %query.name, target = %target.name, error = %e, "custom query failed");
                return;
            }
            Err(_) => {
                warn!(query = %query.name, target = %target.name, "custom query timed out");
                return;
            }
        };

        let Some(first) = rows.first() else {
            debug!(query = %query.name, target = %target.name, "custom query returned no rows");
            return;
        };

        let columns: Vec<String> = first
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();

        let resolved = resolve_columns(query, &columns);

        let grid: Vec<Vec<CellValue>> = rows
            .iter()
            .map(|row| (0..columns.len()).map(|i| decode_cell(row, i)).collect())
            .collect();

        for sample in samples_for_rows(&resolved, &grid, target, self.with_rownum) {
            let labels: HashMap<&str, &str> = sample
                .labels
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();

            match family.get_metric_with(&labels) {
                Ok(gauge) => gauge.set(sample.value),
                Err(e) => {
                    warn!(query = %query.name, error = %e, "label set rejected by metric family");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn test_target() -> Target {
        Target {
            name: "orders".to_string(),
            instance: "primary".to_string(),
            dsn: SecretString::from("postgres://localhost/orders"),
            queries: vec![],
        }
    }

    fn test_query(metrics: &[&str], labels: &[&str]) -> CustomQuery {
        CustomQuery {
            name: "test".to_string(),
            help: String::new(),
            sql: "SELECT 1".to_string(),
            metrics: metrics.iter().map(ToString::to_string).collect(),
            labels: labels.iter().map(ToString::to_string).collect(),
        }
    }

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_normalize_drops_case_and_punctuation() {
        assert_eq!(normalize_name("Cache Hit Ratio"), "cachehitratio");
        assert_eq!(normalize_name("cachehitratio"), "cachehitratio");
        assert_eq!(normalize_name("queue_name"), "queuename");
        assert_eq!(normalize_name("N/A!"), "na");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for raw in ["Cache Hit Ratio", "UPPER", "already-clean", "a b c 1 2 3"] {
            let once = normalize_name(raw);
            assert_eq!(normalize_name(&once), once);
        }
    }

    #[test]
    fn test_label_coercion_integral_float() {
        assert_eq!(
            CellValue::Number(1024.0).as_label(),
            Some("1024".to_string())
        );
        assert_eq!(CellValue::Number(-3.0).as_label(), Some("-3".to_string()));
    }

    #[test]
    fn test_label_coercion_fractional_float_is_scientific() {
        let rendered = CellValue::Number(1024.5).as_label().unwrap();
        assert!(rendered.contains('e'), "expected scientific notation, got {rendered}");
        assert_eq!(rendered, format!("{:e}", 1024.5));
    }

    #[test]
    fn test_label_coercion_text_verbatim() {
        assert_eq!(
            CellValue::Text("PRIMARY".to_string()).as_label(),
            Some("PRIMARY".to_string())
        );
    }

    #[test]
    fn test_label_coercion_null() {
        assert_eq!(CellValue::Null.as_label(), None);
    }

    #[test]
    fn test_decimal_cells_become_numbers() {
        use std::str::FromStr;

        let avg = BigDecimal::from_str("1024.5").unwrap();
        assert_eq!(decimal_to_cell(Some(avg)), CellValue::Number(1024.5));

        let sum = BigDecimal::from_str("123456789").unwrap();
        assert_eq!(decimal_to_cell(Some(sum)), CellValue::Number(123_456_789.0));

        assert_eq!(decimal_to_cell(None), CellValue::Null);
    }

    #[test]
    fn test_decimal_beyond_f64_range_is_null() {
        use std::str::FromStr;

        let huge = BigDecimal::from_str(&format!("1{}", "0".repeat(400))).unwrap();
        assert_eq!(decimal_to_cell(Some(huge)), CellValue::Null);
    }

    #[test]
    fn test_metric_rejects_non_numeric() {
        assert_eq!(CellValue::Text("N/A".to_string()).as_metric(), None);
        assert_eq!(CellValue::Null.as_metric(), None);
        assert_eq!(CellValue::Number(2.5).as_metric(), Some(2.5));
    }

    #[test]
    fn test_resolve_columns_case_insensitive() {
        let query = test_query(&["Cache Hit Ratio"], &["queue_name"]);
        let resolved = resolve_columns(&query, &columns(&["CACHEHITRATIO", "Queue Name"]));

        assert_eq!(resolved.metrics, vec![("Cache Hit Ratio".to_string(), 0)]);
        assert_eq!(resolved.labels, vec![("queuename".to_string(), Some(1))]);
    }

    #[test]
    fn test_resolve_columns_unmatched_hints() {
        let query = test_query(&["value", "missing"], &["name", "ghost"]);
        let resolved = resolve_columns(&query, &columns(&["name", "value"]));

        assert_eq!(resolved.metrics, vec![("value".to_string(), 1)]);
        assert_eq!(
            resolved.labels,
            vec![("name".to_string(), Some(0)), ("ghost".to_string(), None)]
        );
    }

    #[test]
    fn test_samples_end_to_end_two_rows() {
        // Full pipeline: metric column VALUE, label column
        // NAME, two rows, row counter on.
        let query = test_query(&["VALUE"], &["NAME"]);
        let resolved = resolve_columns(&query, &columns(&["NAME", "VALUE"]));

        let rows = vec![
            vec![CellValue::Text("A".into()), CellValue::Number(10.0)],
            vec![CellValue::Text("B".into()), CellValue::Number(20.0)],
        ];

        let samples = samples_for_rows(&resolved, &rows, &test_target(), true);
        assert_eq!(samples.len(), 2);

        assert_eq!(samples[0].labels["metric"], "VALUE");
        assert_eq!(samples[0].labels["name"], "A");
        assert_eq!(samples[0].labels["rownum"], "1");
        assert_eq!(samples[0].labels["database"], "orders");
        assert_eq!(samples[0].labels["dbinstance"], "primary");
        assert!((samples[0].value - 10.0).abs() < f64::EPSILON);

        assert_eq!(samples[1].labels["name"], "B");
        assert_eq!(samples[1].labels["rownum"], "2");
        assert!((samples[1].value - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_samples_rownum_distinguishes_identical_rows() {
        let query = test_query(&["value"], &[]);
        let resolved = resolve_columns(&query, &columns(&["value"]));

        let rows = vec![
            vec![CellValue::Number(1.0)],
            vec![CellValue::Number(1.0)],
            vec![CellValue::Number(1.0)],
        ];

        let samples = samples_for_rows(&resolved, &rows, &test_target(), true);
        let rownums: Vec<&str> = samples
            .iter()
            .map(|s| s.labels["rownum"].as_str())
            .collect();
        assert_eq!(rownums, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_samples_without_rownum_label() {
        let query = test_query(&["value"], &[]);
        let resolved = resolve_columns(&query, &columns(&["value"]));
        let rows = vec![vec![CellValue::Number(7.0)]];

        let samples = samples_for_rows(&resolved, &rows, &test_target(), false);
        assert_eq!(samples.len(), 1);
        assert!(!samples[0].labels.contains_key("rownum"));
    }

    #[test]
    fn test_samples_non_numeric_metric_dropped_sibling_emits() {
        let query = test_query(&["broken", "ok"], &[]);
        let resolved = resolve_columns(&query, &columns(&["broken", "ok"]));

        let rows = vec![vec![
            CellValue::Text("N/A".into()),
            CellValue::Number(42.0),
        ]];

        let samples = samples_for_rows(&resolved, &rows, &test_target(), true);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].labels["metric"], "ok");
        assert!((samples[0].value - 42.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_samples_multiple_metric_columns_share_row_labels() {
        let query = test_query(&["reads", "writes"], &["table"]);
        let resolved = resolve_columns(&query, &columns(&["table", "reads", "writes"]));

        let rows = vec![vec![
            CellValue::Text("jobs".into()),
            CellValue::Number(5.0),
            CellValue::Number(9.0),
        ]];

        let samples = samples_for_rows(&resolved, &rows, &test_target(), true);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].labels["metric"], "reads");
        assert_eq!(samples[1].labels["metric"], "writes");
        assert_eq!(samples[0].labels["table"], "jobs");
        assert_eq!(samples[1].labels["table"], "jobs");
        assert_eq!(samples[0].labels["rownum"], samples[1].labels["rownum"]);
    }

    #[test]
    fn test_samples_unresolved_label_is_empty_not_fatal() {
        let query = test_query(&["value"], &["present", "absent"]);
        let resolved = resolve_columns(&query, &columns(&["value", "present"]));

        let rows = vec![vec![CellValue::Number(1.5), CellValue::Text("x".into())]];

        let samples = samples_for_rows(&resolved, &rows, &test_target(), true);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].labels["present"], "x");
        assert_eq!(samples[0].labels["absent"], "");
    }

    #[test]
    fn test_samples_null_label_value_is_empty() {
        let query = test_query(&["value"], &["name"]);
        let resolved = resolve_columns(&query, &columns(&["value", "name"]));

        let rows = vec![vec![CellValue::Number(1.0), CellValue::Null]];

        let samples = samples_for_rows(&resolved, &rows, &test_target(), true);
        assert_eq!(samples[0].labels["name"], "");
    }

    #[test]
    fn test_samples_numeric_label_coerced() {
        let query = test_query(&["value"], &["shard"]);
        let resolved = resolve_columns(&query, &columns(&["value", "shard"]));

        let rows = vec![vec![CellValue::Number(1.0), CellValue::Number(1024.0)]];

        let samples = samples_for_rows(&resolved, &rows, &test_target(), true);
        assert_eq!(samples[0].labels["shard"], "1024");
    }

    #[test]
    fn test_family_label_names_order_and_rownum() {
        let query = test_query(&["value"], &["Queue Name", "STATE"]);

        let with = family_label_names(&query, true);
        assert_eq!(
            with,
            vec!["queuename", "state", "metric", "database", "dbinstance", "rownum"]
        );

        let without = family_label_names(&query, false);
        assert_eq!(
            without,
            vec!["queuename", "state", "metric", "database", "dbinstance"]
        );
    }
}
