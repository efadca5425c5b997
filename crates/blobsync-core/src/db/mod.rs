use std::path::{Path, PathBuf};

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row as _, Sqlite, SqliteConnection};
use tracing::{debug, info};

use crate::error::{Result, SchemaError};
use crate::schema::{self, ColumnType, TableDef, SCHEMA_SQL};
use crate::snapshot::{Row, Scalar, TableSnapshot};

pub type DbPool = Pool<Sqlite>;

/// Default database file, relative to the working directory.
pub const DEFAULT_DATABASE_PATH: &str = "local.db";

/// The local store for one run. A single connection; writes for each call
/// happen inside one transaction.
#[derive(Debug)]
pub struct Database {
    pool: DbPool,
    path: PathBuf,
}

impl Database {
    /// Open (creating if missing) the SQLite file at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        debug!(path = %path.display(), "Opened database");
        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub async fn close(self) {
        self.pool.close().await;
        debug!(path = %self.path.display(), "Closed database");
    }

    /// Drop and recreate the tracked tables, then insert `seed`.
    pub async fn reset_and_seed(&self, seed: &TableSnapshot) -> Result<()> {
        for (name, _) in seed.tables() {
            schema::table(name)?;
        }

        let mut tx = self.pool.begin().await?;
        sqlx::raw_sql(&schema::drop_sql()).execute(&mut *tx).await?;
        sqlx::raw_sql(SCHEMA_SQL).execute(&mut *tx).await?;

        for table in schema::TRACKED_TABLES {
            let rows = seed.table(table.name).unwrap_or_default();
            insert_into(&mut tx, table, rows).await?;
        }
        tx.commit().await?;

        info!(
            rows = seed.total_rows(),
            tables = schema::TRACKED_TABLES.len(),
            "Database reset and seeded"
        );
        Ok(())
    }

    /// All rows of `name` in insertion order, columns in declared order.
    pub async fn read_table(&self, name: &str) -> Result<Vec<Row>> {
        let table = schema::table(name)?;
        let rows = sqlx::query(&table.select_sql())
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| decode_row(table, row))
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()
            .map_err(Into::into)
    }

    /// Read every tracked table.
    pub async fn snapshot(&self) -> Result<TableSnapshot> {
        let mut snapshot = TableSnapshot::new();
        for table in schema::TRACKED_TABLES {
            let rows = self.read_table(table.name).await?;
            snapshot.insert_table(table.name, rows);
        }
        Ok(snapshot)
    }

    /// Delete all rows from the named tables, keeping the schema. Children are
    /// cleared before their parents regardless of the order given.
    pub async fn truncate(&self, table_names: &[&str]) -> Result<()> {
        let mut tables = table_names
            .iter()
            .map(|name| schema::table(name))
            .collect::<std::result::Result<Vec<_>, SchemaError>>()?;
        tables.sort_by_key(|table| std::cmp::Reverse(schema::position(table.name)));

        let mut tx = self.pool.begin().await?;
        for table in &tables {
            let result = sqlx::query(&table.delete_sql()).execute(&mut *tx).await?;
            debug!(table = table.name, rows = result.rows_affected(), "Truncated table");
        }
        tx.commit().await?;
        Ok(())
    }

    /// Append `rows` to `name` in the given order, all or nothing.
    pub async fn insert_rows(&self, name: &str, rows: &[Row]) -> Result<u64> {
        let table = schema::table(name)?;
        for (index, row) in rows.iter().enumerate() {
            table.check_row(index, row)?;
        }

        let mut tx = self.pool.begin().await?;
        let inserted = insert_into(&mut tx, table, rows).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn row_count(&self, name: &str) -> Result<i64> {
        let table = schema::table(name)?;
        let count = sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {}", table.name))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

async fn insert_into(
    conn: &mut SqliteConnection,
    table: &TableDef,
    rows: &[Row],
) -> Result<u64> {
    let sql = table.insert_sql();
    let mut inserted = 0;

    for (index, row) in rows.iter().enumerate() {
        let mut query = sqlx::query(&sql);
        for column in table.columns {
            let value = row.get(column.name).ok_or_else(|| SchemaError::MissingColumn {
                table: table.name.to_string(),
                row: index,
                column: column.name.to_string(),
            })?;
            query = match value {
                Scalar::Null => query.bind(None::<String>),
                Scalar::Integer(value) => query.bind(*value),
                Scalar::Text(value) => query.bind(value.as_str()),
            };
        }
        inserted += query.execute(&mut *conn).await?.rows_affected();
    }

    Ok(inserted)
}

fn decode_row(table: &TableDef, row: &SqliteRow) -> std::result::Result<Row, sqlx::Error> {
    let mut decoded = Row::with_capacity(table.columns.len());
    for (index, column) in table.columns.iter().enumerate() {
        let value = match column.column_type {
            ColumnType::Integer => Scalar::from(row.try_get::<Option<i64>, _>(index)?),
            ColumnType::Text | ColumnType::Timestamp => {
                Scalar::from(row.try_get::<Option<String>, _>(index)?)
            }
        };
        decoded.insert(column.name.to_string(), value);
    }
    Ok(decoded)
}
