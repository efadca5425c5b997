//! JSON artifacts: encoding/decoding of table snapshots and the timestamped
//! names they are stored under.
//!
//! Document shape: `{ "<table>": [ { "<column>": value, ... }, ... ], ... }`
//! with exactly the tracked tables and, per row, exactly the declared columns.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{ConfigError, JobError, SchemaError};
use crate::schema::{ColumnType, TableDef, TRACKED_TABLES};
use crate::snapshot::{Row, Scalar, TableSnapshot};

pub const CONTENT_TYPE: &str = "application/json";

/// Fixed-width, zero-padded UTC stamp; lexicographic order is chronological.
const STAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";
const STAMP_LEN: usize = 19;
const EXTENSION: &str = ".json";

/// Serialise a snapshot, preserving table order and row order.
pub fn encode(snapshot: &TableSnapshot) -> Result<Vec<u8>, SchemaError> {
    Ok(serde_json::to_vec_pretty(snapshot)?)
}

/// Parse and validate a document. Nothing is returned unless every table and
/// every row matches the declared schema.
pub fn decode(bytes: &[u8]) -> Result<TableSnapshot, SchemaError> {
    let document: Value = serde_json::from_slice(bytes)?;
    let Value::Object(mut tables) = document else {
        return Err(SchemaError::NotAnObject);
    };

    if let Some(extra) = tables
        .keys()
        .find(|name| !TRACKED_TABLES.iter().any(|table| table.name == name.as_str()))
    {
        return Err(SchemaError::UnexpectedTable(extra.clone()));
    }

    let mut snapshot = TableSnapshot::new();
    for table in TRACKED_TABLES {
        let value = tables
            .remove(table.name)
            .ok_or_else(|| SchemaError::MissingTable(table.name.to_string()))?;
        let Value::Array(items) = value else {
            return Err(SchemaError::NotAnArray(table.name.to_string()));
        };

        let rows = items
            .into_iter()
            .enumerate()
            .map(|(index, item)| decode_row(table, index, item))
            .collect::<Result<Vec<_>, _>>()?;
        snapshot.insert_table(table.name, rows);
    }

    Ok(snapshot)
}

fn decode_row(table: &TableDef, index: usize, item: Value) -> Result<Row, SchemaError> {
    let Value::Object(mut cells) = item else {
        return Err(SchemaError::RowNotObject {
            table: table.name.to_string(),
            row: index,
        });
    };

    let mut row = Row::with_capacity(table.columns.len());
    for column in table.columns {
        let value = cells
            .remove(column.name)
            .ok_or_else(|| SchemaError::MissingColumn {
                table: table.name.to_string(),
                row: index,
                column: column.name.to_string(),
            })?;
        let scalar = match (value, column.column_type) {
            (Value::Null, _) => Scalar::Null,
            (Value::Number(number), ColumnType::Integer) if number.is_i64() => {
                number.as_i64().map_or(Scalar::Null, Scalar::Integer)
            }
            (Value::String(text), ColumnType::Text | ColumnType::Timestamp) => Scalar::Text(text),
            (other, expected) => {
                return Err(SchemaError::InvalidValue {
                    table: table.name.to_string(),
                    row: index,
                    column: column.name.to_string(),
                    expected: expected.describe(),
                    found: describe_json(&other),
                })
            }
        };
        row.insert(column.name.to_string(), scalar);
    }

    if let Some(extra) = first_key(&cells) {
        return Err(SchemaError::UnexpectedColumn {
            table: table.name.to_string(),
            row: index,
            column: extra,
        });
    }

    table.check_row(index, &row)?;
    Ok(row)
}

fn first_key(map: &Map<String, Value>) -> Option<String> {
    map.keys().next().cloned()
}

fn describe_json(value: &Value) -> String {
    match value {
        Value::Null => "null".into(),
        Value::Bool(flag) => format!("boolean {flag}"),
        Value::Number(number) => format!("number {number}"),
        Value::String(text) => format!("string {text:?}"),
        Value::Array(_) => "an array".into(),
        Value::Object(_) => "an object".into(),
    }
}

/// Storage name of an artifact: `<prefix><YYYY-MM-DDTHH-MM-SS>.json`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ArtifactName {
    created_at: NaiveDateTime,
    name: String,
}

impl ArtifactName {
    /// Name for an artifact created at `created_at`, truncated to the second.
    pub fn new(prefix: &str, created_at: DateTime<Utc>) -> Self {
        let stamp = created_at.format(STAMP_FORMAT).to_string();
        let created_at = NaiveDateTime::parse_from_str(&stamp, STAMP_FORMAT)
            .unwrap_or_else(|_| created_at.naive_utc());
        Self {
            created_at,
            name: format!("{prefix}{stamp}{EXTENSION}"),
        }
    }

    /// Recognise a listed blob name. Anything that is not exactly
    /// prefix + fixed-width stamp + `.json` yields `None`.
    pub fn parse(prefix: &str, name: &str) -> Option<Self> {
        let stamp = name.strip_prefix(prefix)?.strip_suffix(EXTENSION)?;
        if stamp.len() != STAMP_LEN {
            return None;
        }
        let created_at = NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).ok()?;
        if created_at.format(STAMP_FORMAT).to_string() != stamp {
            return None;
        }
        Some(Self {
            created_at,
            name: name.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> NaiveDateTime {
        self.created_at
    }
}

impl fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    /// No blob under the prefix looks like an artifact.
    Empty { prefix: String },
    /// The newest stamp is listed more than once; which blob is "latest" is
    /// undefined.
    Collision { name: String },
}

impl fmt::Display for SelectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionError::Empty { prefix } => {
                write!(f, "no artifacts with prefix '{prefix}' in the container")
            }
            SelectionError::Collision { name } => {
                write!(f, "artifact name '{name}' is listed more than once")
            }
        }
    }
}

impl std::error::Error for SelectionError {}

impl From<SelectionError> for JobError {
    fn from(err: SelectionError) -> Self {
        match err {
            SelectionError::Empty { .. } => {
                JobError::Storage(blobsync_bucket::BucketError::NotFound(err.to_string()))
            }
            SelectionError::Collision { name } => {
                JobError::Configuration(ConfigError::ArtifactCollision(name))
            }
        }
    }
}

/// Pick the most recently created artifact from a listing, in any order.
///
/// Relies on every writer using the same fixed-width UTC stamp; clock skew
/// between writers and two uploads within one second are not defended against.
pub fn select_latest<S: AsRef<str>>(
    prefix: &str,
    names: &[S],
) -> Result<ArtifactName, SelectionError> {
    let mut latest: Option<ArtifactName> = None;
    let mut duplicated = false;

    for raw in names {
        let raw = raw.as_ref();
        let Some(candidate) = ArtifactName::parse(prefix, raw) else {
            warn!(blob = raw, "Skipping blob that is not a recognised artifact name");
            continue;
        };

        match &latest {
            Some(current) if candidate.created_at == current.created_at => duplicated = true,
            Some(current) if candidate.created_at < current.created_at => {}
            _ => {
                latest = Some(candidate);
                duplicated = false;
            }
        }
    }

    match latest {
        None => Err(SelectionError::Empty {
            prefix: prefix.to_string(),
        }),
        Some(name) if duplicated => Err(SelectionError::Collision {
            name: name.name,
        }),
        Some(name) => Ok(name),
    }
}
