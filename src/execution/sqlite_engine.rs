//! SQLite Execution Engine
//!
//! Embedded engine over a single database file. Queries run on a dedicated
//! read-only connection inside a blocking task; an interrupt handle aborts the
//! statement when the deadline passes or the caller goes away.
//!
//! Geometry is stored as GeoJSON text in columns declared `GEOMETRY`, so it is
//! already text on the way out.

use crate::dataset::geojson::geometry_envelope;
use crate::dataset::{MaterializationMode, TableData, BBOX_COLUMNS};
use crate::error::{GeoSqlError, Result};
use crate::execution::engine::{quote_ident, ExecutionEngine, RELATION_CATALOG};
use crate::execution::result::{
    clip_sample_value, float_to_json, ColumnInfo, ExecuteOptions, ExecutionError, ExecutionResult,
    RelationSchema,
};
use crate::spatial::Srid;
use crate::validator::SqlDialect;
use async_trait::async_trait;
use itertools::Itertools;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, InterruptHandle, OpenFlags, OptionalExtension, Transaction, TransactionBehavior};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const ATTACHED_SCHEMA: &str = "geosql_src";

#[derive(Debug, Clone)]
pub struct SqliteEngine {
    path: PathBuf,
}

/// Where rows for a materialized relation come from.
#[derive(Debug, Clone)]
pub enum SqliteSource {
    /// Rows decoded from a file
    Rows(TableData),
    /// A table or view inside another SQLite file, attached read-only
    Attached { path: PathBuf, table: Option<String> },
}

#[derive(Debug, Clone)]
pub struct SqliteLoad {
    pub relation: String,
    pub mode: MaterializationMode,
    /// Add bbox columns; envelopes are read from GeoJSON coordinates as-is
    pub add_bbox: bool,
    /// Reference system of the stored coordinates, if known
    pub srid: Option<Srid>,
    pub source: SqliteSource,
}

/// Backing table of a view-mode relation. `$` never appears in a loadable
/// relation name, so this cannot collide with another relation.
pub fn backing_table(relation: &str) -> String {
    format!("{}$base", relation)
}

/// Interrupts the statement unless disarmed after a normal finish.
struct InterruptOnDrop {
    handle: InterruptHandle,
    armed: bool,
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.handle.interrupt();
        }
    }
}

impl SqliteEngine {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_read_only(&self) -> std::result::Result<Connection, ExecutionError> {
        if !self.path.exists() {
            return Err(ExecutionError::connection(format!(
                "database file {} does not exist",
                self.path.display()
            )));
        }
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| ExecutionError::connection(format!("cannot open {}: {}", self.path.display(), e)))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| ExecutionError::connection(e.to_string()))?;
        Ok(conn)
    }

    fn open_read_write(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("Opened {} for writing (journal_mode={})", self.path.display(), mode);
        Ok(conn)
    }

    /// Create or replace a relation in one IMMEDIATE transaction and return its row count.
    ///
    /// Blocking; call from `spawn_blocking`.
    pub fn materialize(&self, load: &SqliteLoad) -> Result<u64> {
        let mut conn = self.open_read_write()?;

        if let SqliteSource::Attached { path, .. } = &load.source {
            let uri = format!("file:{}?mode=ro", escape_uri_path(path));
            conn.execute(&format!("ATTACH DATABASE ?1 AS {}", ATTACHED_SCHEMA), [uri])
                .map_err(|e| GeoSqlError::Load(format!("cannot attach {}: {}", path.display(), e)))?;
        }

        let outcome = Self::replace_relation(&mut conn, load);

        if matches!(load.source, SqliteSource::Attached { .. }) {
            if let Err(e) = conn.execute(&format!("DETACH DATABASE {}", ATTACHED_SCHEMA), []) {
                warn!("Failed to detach source database: {}", e);
            }
        }
        outcome?;

        let rows: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(&load.relation)),
            [],
            |row| row.get(0),
        )?;
        info!(
            "Materialized {} as {:?} with {} rows in {}",
            load.relation,
            load.mode,
            rows,
            self.path.display()
        );
        Ok(rows.max(0) as u64)
    }

    fn replace_relation(conn: &mut Connection, load: &SqliteLoad) -> Result<()> {
        let base = backing_table(&load.relation);
        let target = match load.mode {
            MaterializationMode::View => base.as_str(),
            MaterializationMode::Table => load.relation.as_str(),
        };

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        drop_relation(&tx, &load.relation)?;
        drop_relation(&tx, &base)?;

        match &load.source {
            SqliteSource::Rows(data) => create_from_rows(&tx, target, data)?,
            SqliteSource::Attached { table, .. } => {
                let source = resolve_attached_table(&tx, table.as_deref(), &load.relation)?;
                debug!("Copying {}.{} into {}", ATTACHED_SCHEMA, source, target);
                tx.execute(
                    &format!(
                        "CREATE TABLE {} AS SELECT * FROM {}.{}",
                        quote_ident(target),
                        ATTACHED_SCHEMA,
                        quote_ident(&source)
                    ),
                    [],
                )?;
            }
        }

        if load.add_bbox {
            let geometry = geometry_column(&tx, target)?.ok_or_else(|| {
                GeoSqlError::Schema(format!(
                    "bbox columns requested but {} has no geometry column",
                    load.relation
                ))
            })?;
            add_bbox_columns(&tx, target, &geometry)?;
        }

        if load.mode == MaterializationMode::View {
            tx.execute(
                &format!(
                    "CREATE VIEW {} AS SELECT * FROM {}",
                    quote_ident(&load.relation),
                    quote_ident(&base)
                ),
                [],
            )?;
        }
        record_srid(&tx, &load.relation, load.srid)?;
        tx.commit()?;
        Ok(())
    }

    fn describe_blocking(&self, relation: &str) -> Result<RelationSchema> {
        let conn = self
            .open_read_only()
            .map_err(|e| GeoSqlError::Schema(e.message))?;

        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(relation)))?;
        let columns: Vec<ColumnInfo> = stmt
            .query_map([], |row| {
                let name: String = row.get(1)?;
                let data_type: Option<String> = row.get(2)?;
                Ok(ColumnInfo::new(name, data_type.unwrap_or_default()))
            })?
            .collect::<rusqlite::Result<_>>()?;
        if columns.is_empty() {
            return Err(GeoSqlError::Schema(format!(
                "relation {} not found in {}",
                relation,
                self.path.display()
            )));
        }

        let (_, sample_rows) = read_rows(&conn, &format!("SELECT * FROM {} LIMIT 3", quote_ident(relation)), 3)
            .map_err(|e| GeoSqlError::Schema(e.message))?;
        let sample_rows = sample_rows
            .into_iter()
            .map(|row| row.into_iter().map(clip_sample_value).collect())
            .collect();

        Ok(RelationSchema {
            relation: relation.to_string(),
            columns,
            sample_rows,
            srid: recorded_srid(&conn, relation)?,
        })
    }
}

#[async_trait]
impl ExecutionEngine for SqliteEngine {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::Sqlite
    }

    async fn describe_relation(&self, relation: &str) -> Result<RelationSchema> {
        let engine = self.clone();
        let relation = relation.to_string();
        tokio::task::spawn_blocking(move || engine.describe_blocking(&relation))
            .await
            .map_err(|e| GeoSqlError::Schema(format!("describe task failed: {}", e)))?
    }

    async fn run_query(
        &self,
        sql: &str,
        options: &ExecuteOptions,
    ) -> std::result::Result<ExecutionResult, ExecutionError> {
        let conn = self.open_read_only()?;
        let mut guard = InterruptOnDrop {
            handle: conn.get_interrupt_handle(),
            armed: true,
        };

        let sql = sql.to_string();
        let max_rows = options.max_rows;
        let mut task = tokio::task::spawn_blocking(move || read_rows(&conn, &sql, max_rows));

        let outcome = match tokio::time::timeout(options.timeout, &mut task).await {
            Ok(joined) => joined.map_err(|e| ExecutionError::engine(format!("query task failed: {}", e)))?,
            Err(_) => {
                warn!("Statement exceeded {:?}, interrupting", options.timeout);
                guard.handle.interrupt();
                let _ = task.await;
                guard.armed = false;
                return Err(ExecutionError::timeout(options.timeout));
            }
        };
        guard.armed = false;

        let (columns, rows) = outcome?;
        Ok(ExecutionResult::new(columns, rows))
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.open_read_only().is_ok())
    }
}

/// Read at most `max_rows` rows of `sql`.
fn read_rows(
    conn: &Connection,
    sql: &str,
    max_rows: usize,
) -> std::result::Result<(Vec<String>, Vec<Vec<Value>>), ExecutionError> {
    let engine_error = |e: rusqlite::Error| ExecutionError::engine(e.to_string());

    let mut stmt = conn.prepare(sql).map_err(engine_error)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();

    let mut rows = stmt.query([]).map_err(engine_error)?;
    let mut out = Vec::new();
    while out.len() < max_rows {
        let Some(row) = rows.next().map_err(engine_error)? else {
            break;
        };
        let mut values = Vec::with_capacity(width);
        for idx in 0..width {
            values.push(value_ref_to_json(row.get_ref(idx).map_err(engine_error)?));
        }
        out.push(values);
    }
    Ok((columns, out))
}

fn value_ref_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => float_to_json(f),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(format!("<BLOB {} bytes>", bytes.len())),
    }
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn drop_relation(tx: &Transaction<'_>, name: &str) -> Result<()> {
    let kind: Option<String> = tx
        .query_row(
            "SELECT type FROM main.sqlite_master WHERE name = ?1 AND type IN ('table', 'view')",
            [name],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    match kind.as_deref() {
        Some("view") => {
            tx.execute(&format!("DROP VIEW {}", quote_ident(name)), [])?;
        }
        Some(_) => {
            tx.execute(&format!("DROP TABLE {}", quote_ident(name)), [])?;
        }
        None => {}
    }
    Ok(())
}

fn record_srid(tx: &Transaction<'_>, relation: &str, srid: Option<Srid>) -> Result<()> {
    tx.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {} (relation TEXT PRIMARY KEY, srid INTEGER, loaded_at TEXT NOT NULL)",
            RELATION_CATALOG
        ),
        [],
    )?;
    tx.execute(
        &format!(
            "INSERT OR REPLACE INTO {} (relation, srid, loaded_at) VALUES (?1, ?2, ?3)",
            RELATION_CATALOG
        ),
        rusqlite::params![relation, srid.map(|s| s.0), chrono::Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn recorded_srid(conn: &Connection, relation: &str) -> Result<Option<Srid>> {
    let catalog: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [RELATION_CATALOG],
            |row| row.get(0),
        )
        .optional()?;
    if catalog.is_none() {
        return Ok(None);
    }
    let srid: Option<Option<u32>> = conn
        .query_row(
            &format!("SELECT srid FROM {} WHERE relation = ?1", RELATION_CATALOG),
            [relation],
            |row| row.get(0),
        )
        .optional()?;
    Ok(srid.flatten().map(Srid))
}

fn create_from_rows(tx: &Transaction<'_>, target: &str, data: &TableData) -> Result<()> {
    let definitions = data
        .columns
        .iter()
        .zip(data.column_types())
        .map(|(name, ty)| format!("{} {}", quote_ident(name), ty))
        .join(", ");
    tx.execute(&format!("CREATE TABLE {} ({})", quote_ident(target), definitions), [])?;

    let placeholders = (1..=data.columns.len()).map(|i| format!("?{}", i)).join(", ");
    let mut insert = tx.prepare(&format!("INSERT INTO {} VALUES ({})", quote_ident(target), placeholders))?;
    for row in &data.rows {
        insert.execute(rusqlite::params_from_iter(row.iter().map(json_to_sql)))?;
    }
    Ok(())
}

fn resolve_attached_table(tx: &Transaction<'_>, requested: Option<&str>, relation: &str) -> Result<String> {
    let mut stmt = tx.prepare(&format!(
        "SELECT name FROM {}.sqlite_master WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' ORDER BY name",
        ATTACHED_SCHEMA
    ))?;
    let tables: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;

    if let Some(name) = requested {
        return tables
            .iter()
            .find(|t| t.as_str() == name)
            .cloned()
            .ok_or_else(|| GeoSqlError::Load(format!("source database has no table {}", name)));
    }
    if let Some(same) = tables.iter().find(|t| t.as_str() == relation) {
        return Ok(same.clone());
    }
    tables
        .into_iter()
        .next()
        .ok_or_else(|| GeoSqlError::Load("source database contains no tables".to_string()))
}

fn geometry_column(tx: &Transaction<'_>, table: &str) -> Result<Option<String>> {
    let mut stmt = tx.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let columns: Vec<ColumnInfo> = stmt
        .query_map([], |row| {
            let name: String = row.get(1)?;
            let data_type: Option<String> = row.get(2)?;
            Ok(ColumnInfo::new(name, data_type.unwrap_or_default()))
        })?
        .collect::<rusqlite::Result<_>>()?;
    Ok(columns.into_iter().find(|c| c.is_geometry()).map(|c| c.name))
}

fn add_bbox_columns(tx: &Transaction<'_>, table: &str, geometry: &str) -> Result<()> {
    let existing: Vec<String> = {
        let mut stmt = tx.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        names
    };
    for column in BBOX_COLUMNS {
        if !existing.iter().any(|e| e.eq_ignore_ascii_case(column)) {
            tx.execute(&format!("ALTER TABLE {} ADD COLUMN {} REAL", quote_ident(table), column), [])?;
        }
    }

    let envelopes: Vec<(i64, Option<String>)> = {
        let mut stmt = tx.prepare(&format!(
            "SELECT rowid, {} FROM {}",
            quote_ident(geometry),
            quote_ident(table)
        ))?;
        let rows = stmt
            .query_map([], |row| {
                let text = match row.get_ref(1)? {
                    ValueRef::Text(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
                    _ => None,
                };
                Ok((row.get::<_, i64>(0)?, text))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };

    let mut update = tx.prepare(&format!(
        "UPDATE {} SET min_lon = ?1, min_lat = ?2, max_lon = ?3, max_lat = ?4 WHERE rowid = ?5",
        quote_ident(table)
    ))?;
    let mut missing = 0usize;
    for (rowid, text) in envelopes {
        let envelope = text
            .and_then(|t| serde_json::from_str::<Value>(&t).ok())
            .and_then(|geometry| geometry_envelope(&geometry));
        match envelope {
            Some(env) => {
                update.execute(rusqlite::params![env.min_x, env.min_y, env.max_x, env.max_y, rowid])?;
            }
            None => missing += 1,
        }
    }
    if missing > 0 {
        warn!("{} rows of {} have no readable geometry; bbox left null", missing, table);
    }
    Ok(())
}

fn escape_uri_path(path: &Path) -> String {
    path.to_string_lossy()
        .replace('%', "%25")
        .replace('?', "%3f")
        .replace('#', "%23")
}
