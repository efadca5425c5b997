//! Statically declared layout of the tracked tables.
//!
//! Every SELECT, INSERT and DELETE the job issues is generated from these
//! declarations, and downloaded artifacts are validated against them before a
//! single row is written.

use chrono::{DateTime, NaiveDateTime};

use crate::error::SchemaError;
use crate::snapshot::{Row, Scalar};

/// DDL for the tracked tables.
pub const SCHEMA_SQL: &str = include_str!("../sql/schema.sql");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Text,
    /// ISO-8601 text, e.g. `2024-01-15T02:00:00.000000`.
    Timestamp,
}

impl ColumnType {
    pub fn describe(self) -> &'static str {
        match self {
            ColumnType::Integer => "an integer",
            ColumnType::Text => "a string",
            ColumnType::Timestamp => "an ISO-8601 timestamp",
        }
    }
}

#[derive(Debug)]
pub struct ColumnDef {
    pub name: &'static str,
    pub column_type: ColumnType,
    pub nullable: bool,
}

#[derive(Debug)]
pub struct TableDef {
    pub name: &'static str,
    pub columns: &'static [ColumnDef],
}

const fn column(name: &'static str, column_type: ColumnType, nullable: bool) -> ColumnDef {
    ColumnDef {
        name,
        column_type,
        nullable,
    }
}

/// Tracked tables in dependency order: parents before children.
pub static TRACKED_TABLES: &[TableDef] = &[
    TableDef {
        name: "sessions",
        columns: &[
            column("session_id", ColumnType::Text, false),
            column("created_at", ColumnType::Timestamp, false),
            column("metadata", ColumnType::Text, true),
        ],
    },
    TableDef {
        name: "events",
        columns: &[
            column("event_id", ColumnType::Text, false),
            column("created_at", ColumnType::Timestamp, false),
            column("session_id", ColumnType::Text, false),
            column("turn", ColumnType::Integer, false),
            column("event_type", ColumnType::Text, false),
            column("actor", ColumnType::Text, false),
            column("payload", ColumnType::Text, true),
            column("content", ColumnType::Text, true),
            column("params", ColumnType::Text, true),
        ],
    },
    TableDef {
        name: "event_parents",
        columns: &[
            column("event_id", ColumnType::Text, false),
            column("parent_event_id", ColumnType::Text, false),
        ],
    },
];

pub fn tracked_table_names() -> Vec<&'static str> {
    TRACKED_TABLES.iter().map(|table| table.name).collect()
}

pub fn table(name: &str) -> Result<&'static TableDef, SchemaError> {
    TRACKED_TABLES
        .iter()
        .find(|table| table.name == name)
        .ok_or_else(|| SchemaError::UnexpectedTable(name.to_string()))
}

/// Position in [`TRACKED_TABLES`]; deletes run in descending position.
pub fn position(name: &str) -> Option<usize> {
    TRACKED_TABLES.iter().position(|table| table.name == name)
}

/// Statements that drop every tracked table, children first.
pub fn drop_sql() -> String {
    TRACKED_TABLES
        .iter()
        .rev()
        .map(|table| format!("DROP TABLE IF EXISTS {};\n", table.name))
        .collect()
}

pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(value).ok().map(|dt| dt.naive_utc()))
}

impl TableDef {
    pub fn column_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns.iter().map(|column| column.name)
    }

    pub fn select_sql(&self) -> String {
        format!(
            "SELECT {} FROM {} ORDER BY rowid",
            self.column_names().collect::<Vec<_>>().join(", "),
            self.name
        )
    }

    pub fn insert_sql(&self) -> String {
        let placeholders = vec!["?"; self.columns.len()].join(", ");
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.name,
            self.column_names().collect::<Vec<_>>().join(", "),
            placeholders
        )
    }

    pub fn delete_sql(&self) -> String {
        format!("DELETE FROM {}", self.name)
    }

    /// Check that `row` has exactly the declared columns with values of the
    /// declared types. `index` is only used for error messages.
    pub fn check_row(&self, index: usize, row: &Row) -> Result<(), SchemaError> {
        for column in self.columns {
            let value = row.get(column.name).ok_or_else(|| SchemaError::MissingColumn {
                table: self.name.to_string(),
                row: index,
                column: column.name.to_string(),
            })?;
            column.check(self.name, index, value)?;
        }

        if let Some(extra) = row
            .keys()
            .find(|key| !self.columns.iter().any(|column| column.name == key.as_str()))
        {
            return Err(SchemaError::UnexpectedColumn {
                table: self.name.to_string(),
                row: index,
                column: extra.clone(),
            });
        }

        Ok(())
    }
}

impl ColumnDef {
    fn check(&self, table: &str, row: usize, value: &Scalar) -> Result<(), SchemaError> {
        let ok = match (value, self.column_type) {
            (Scalar::Null, _) => self.nullable,
            (Scalar::Integer(_), ColumnType::Integer) => true,
            (Scalar::Text(_), ColumnType::Text) => true,
            (Scalar::Text(text), ColumnType::Timestamp) => parse_timestamp(text).is_some(),
            _ => false,
        };

        if ok {
            Ok(())
        } else {
            Err(SchemaError::InvalidValue {
                table: table.to_string(),
                row,
                column: self.name.to_string(),
                expected: self.column_type.describe(),
                found: value.to_string(),
            })
        }
    }
}
