//! Date-sharded tables named `<base>_YYYYMMDD`.

use crate::warehouse::TableRef;
use chrono::NaiveDate;
use regex::Regex;
use std::sync::LazyLock;

static SHARD_SUFFIX: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(.+)_(\d{8}|\d{6})$").ok());

/// `YYYYMMDD` suffix for a partition date.
pub fn partition_suffix(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

/// Table name of the partition of `base` for `date`.
pub fn partition_name(base: &str, date: NaiveDate) -> String {
    format!("{}_{}", base, partition_suffix(date))
}

/// Split a sharded table name into base name and date. Monthly shards
/// (`YYYYMM`) map to the first of the month.
pub fn parse_partition(table: &str) -> Option<(&str, NaiveDate)> {
    let caps = SHARD_SUFFIX.as_ref()?.captures(table)?;
    let base = caps.get(1)?.as_str();
    let digits = caps.get(2)?.as_str();
    let date = if digits.len() == 8 {
        NaiveDate::parse_from_str(digits, "%Y%m%d").ok()?
    } else {
        NaiveDate::parse_from_str(&format!("{}01", digits), "%Y%m%d").ok()?
    };
    Some((base, date))
}

/// Partitions of `base` among `tables`, oldest first.
pub fn table_partitions(tables: &[TableRef], base: &str) -> Vec<(TableRef, NaiveDate)> {
    let mut partitions: Vec<(TableRef, NaiveDate)> = tables
        .iter()
        .filter_map(|t| match parse_partition(&t.table) {
            Some((b, date)) if b == base => Some((t.clone(), date)),
            _ => None,
        })
        .collect();
    partitions.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    partitions
}

/// Which tables of a dataset a command applies to.
///
/// Without a date range or `all_partitions` only the table named exactly
/// `base` is selected. `start`/`end` are inclusive and either may be open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSelection {
    pub dataset: String,
    pub base: String,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub all_partitions: bool,
}

impl PartitionSelection {
    pub fn table(dataset: impl Into<String>, base: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            base: base.into(),
            start: None,
            end: None,
            all_partitions: false,
        }
    }

    pub fn is_range(&self) -> bool {
        self.all_partitions || self.start.is_some() || self.end.is_some()
    }

    pub fn matches(&self, table: &TableRef) -> bool {
        if table.dataset != self.dataset {
            return false;
        }
        if !self.is_range() {
            return table.table == self.base;
        }
        match parse_partition(&table.table) {
            Some((base, date)) if base == self.base => {
                self.all_partitions
                    || (self.start.map_or(true, |s| date >= s) && self.end.map_or(true, |e| date <= e))
            }
            _ => false,
        }
    }

    /// Selected tables among `tables`, oldest partition first.
    pub fn select(&self, tables: &[TableRef]) -> Vec<TableRef> {
        let mut selected: Vec<TableRef> = tables.iter().filter(|t| self.matches(t)).cloned().collect();
        selected.sort_by_key(|t| parse_partition(&t.table).map(|(_, d)| d));
        selected
    }
}
