use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A single cell. Timestamps travel as ISO-8601 text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Integer(i64),
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => write!(f, "null"),
            Scalar::Integer(value) => write!(f, "{value}"),
            Scalar::Text(value) => write!(f, "{value:?}"),
        }
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Integer(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Text(value)
    }
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
    fn from(value: Option<T>) -> Self {
        value.map_or(Scalar::Null, Into::into)
    }
}

/// Column name to value, in column order.
pub type Row = IndexMap<String, Scalar>;

/// Tracked tables at a point in time: table name to rows in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableSnapshot {
    tables: IndexMap<String, Vec<Row>>,
}

impl TableSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a table. Replacing keeps the table's original position.
    pub fn insert_table(&mut self, name: impl Into<String>, rows: Vec<Row>) {
        self.tables.insert(name.into(), rows);
    }

    pub fn with_table(mut self, name: impl Into<String>, rows: Vec<Row>) -> Self {
        self.insert_table(name, rows);
        self
    }

    pub fn table(&self, name: &str) -> Option<&[Row]> {
        self.tables.get(name).map(Vec::as_slice)
    }

    pub fn tables(&self) -> impl Iterator<Item = (&str, &[Row])> {
        self.tables
            .iter()
            .map(|(name, rows)| (name.as_str(), rows.as_slice()))
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.keys().map(String::as_str).collect()
    }

    pub fn row_count(&self, name: &str) -> usize {
        self.tables.get(name).map_or(0, Vec::len)
    }

    pub fn total_rows(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }
}

/// Build a [`Row`] from `(column, value)` pairs.
pub fn row<I, K, V>(cells: I) -> Row
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Scalar>,
{
    cells
        .into_iter()
        .map(|(column, value)| (column.into(), value.into()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_builder_keeps_column_order() {
        let built = row([("b", Scalar::from(1_i64)), ("a", Scalar::from("x"))]);
        let columns: Vec<_> = built.keys().map(String::as_str).collect();
        assert_eq!(columns, vec!["b", "a"]);
    }

    #[test]
    fn snapshot_counts_rows_per_table() {
        let snapshot = TableSnapshot::new()
            .with_table("sessions", vec![row([("id", 1_i64)]), row([("id", 2_i64)])])
            .with_table("events", vec![]);

        assert_eq!(snapshot.table_names(), vec!["sessions", "events"]);
        assert_eq!(snapshot.row_count("sessions"), 2);
        assert_eq!(snapshot.row_count("missing"), 0);
        assert_eq!(snapshot.total_rows(), 2);
    }

    #[test]
    fn optional_values_become_null() {
        assert_eq!(Scalar::from(None::<String>), Scalar::Null);
        assert_eq!(Scalar::from(Some(3_i64)), Scalar::Integer(3));
    }
}
