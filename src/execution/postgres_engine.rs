//! PostgreSQL / PostGIS Execution Engine
//!
//! Statements run in a `READ ONLY` transaction with a local
//! `statement_timeout`. The output columns are discovered with a prepare
//! round-trip and re-selected through typed casts, so every value comes back
//! as one of bigint, double, boolean or text.

use crate::config::PostgresConfig;
use crate::dataset::{MaterializationMode, BBOX_COLUMNS};
use crate::error::{GeoSqlError, Result};
use crate::execution::engine::{quote_ident, ExecutionEngine, RELATION_CATALOG};
use crate::execution::result::{
    clip_sample_value, float_to_json, ColumnInfo, ExecuteOptions, ExecutionError, ExecutionErrorKind,
    ExecutionResult, RelationSchema,
};
use crate::spatial::Srid;
use crate::validator::SqlDialect;
use async_trait::async_trait;
use itertools::Itertools;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Executor, Row, Statement, TypeInfo};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// SQLSTATE for `query_canceled`.
const QUERY_CANCELED: &str = "57014";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cast {
    Integer,
    Float,
    Boolean,
    Geometry,
    Text,
}

impl Cast {
    fn for_type(type_name: &str) -> Self {
        match type_name.to_lowercase().as_str() {
            "int2" | "int4" | "int8" | "smallint" | "integer" | "bigint" | "oid" => Cast::Integer,
            "float4" | "float8" | "real" | "double precision" | "numeric" => Cast::Float,
            "bool" | "boolean" => Cast::Boolean,
            "geometry" | "geography" => Cast::Geometry,
            _ => Cast::Text,
        }
    }

    fn select_expr(&self, column: &str, geometry_as_text: bool) -> String {
        let col = format!("q.{}", quote_ident(column));
        let expr = match self {
            Cast::Integer => format!("{}::int8", col),
            Cast::Float => format!("{}::float8", col),
            Cast::Boolean => format!("{}::bool", col),
            Cast::Geometry if geometry_as_text => format!("ST_AsGeoJSON({})", col),
            Cast::Geometry | Cast::Text => format!("{}::text", col),
        };
        format!("{} AS {}", expr, quote_ident(column))
    }

    fn read(&self, row: &PgRow, idx: usize) -> std::result::Result<Value, sqlx::Error> {
        Ok(match self {
            Cast::Integer => row.try_get::<Option<i64>, _>(idx)?.map(Value::from).unwrap_or(Value::Null),
            Cast::Float => row.try_get::<Option<f64>, _>(idx)?.map(float_to_json).unwrap_or(Value::Null),
            Cast::Boolean => row.try_get::<Option<bool>, _>(idx)?.map(Value::Bool).unwrap_or(Value::Null),
            Cast::Geometry | Cast::Text => {
                row.try_get::<Option<String>, _>(idx)?.map(Value::String).unwrap_or(Value::Null)
            }
        })
    }
}

/// Source and target of a relational materialization.
#[derive(Debug, Clone)]
pub struct PostgresLoad {
    pub relation: String,
    /// `[schema.]table` already present in the database
    pub source: String,
    pub mode: MaterializationMode,
    /// Add bbox columns transformed into this SRID
    pub bbox_srid: Option<Srid>,
    /// Reference system recorded for the relation
    pub srid: Option<Srid>,
}

pub struct PostgresEngine {
    pool: PgPool,
}

impl PostgresEngine {
    pub async fn connect(url: &str, config: &PostgresConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(url)
            .await?;
        info!("Connected to PostgreSQL (max {} connections)", config.max_connections);
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn cancel_backend(&self, pid: i32) {
        match sqlx::query("SELECT pg_cancel_backend($1)").bind(pid).execute(&self.pool).await {
            Ok(_) => debug!("Cancelled backend {}", pid),
            Err(e) => warn!("Failed to cancel backend {}: {}", pid, e),
        }
    }

    async fn fetch_columns(&self, relation: &str) -> Result<Vec<ColumnInfo>> {
        let rows = sqlx::query(
            "SELECT a.attname::text, format_type(a.atttypid, a.atttypmod) \
             FROM pg_attribute a \
             WHERE a.attrelid = to_regclass($1) AND a.attnum > 0 AND NOT a.attisdropped \
             ORDER BY a.attnum",
        )
        .bind(quote_ident(relation))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<ColumnInfo> {
                Ok(ColumnInfo::new(row.try_get::<String, _>(0)?, row.try_get::<String, _>(1)?))
            })
            .collect()
    }

    /// Create or replace `relation` over an existing table and return its row count.
    pub async fn materialize(&self, load: &PostgresLoad) -> Result<u64> {
        let exists: Option<String> = sqlx::query_scalar("SELECT to_regclass($1)::text")
            .bind(&load.source)
            .fetch_one(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(GeoSqlError::Load(format!("relation {} does not exist", load.source)));
        }

        let (schema, table) = match load.source.split_once('.') {
            Some((schema, table)) => (schema.to_string(), table.to_string()),
            None => ("public".to_string(), load.source.clone()),
        };
        let source = format!("{}.{}", quote_ident(&schema), quote_ident(&table));

        let mut select = format!("SELECT s.* FROM {} AS s", source);
        if let Some(srid) = load.bbox_srid {
            let geometry: Option<String> = sqlx::query_scalar(
                "SELECT f_geometry_column::text FROM geometry_columns \
                 WHERE f_table_schema = $1 AND f_table_name = $2 LIMIT 1",
            )
            .bind(&schema)
            .bind(&table)
            .fetch_optional(&self.pool)
            .await?;
            let geometry = geometry.ok_or_else(|| {
                GeoSqlError::Schema(format!(
                    "bbox columns requested but {} has no geometry column",
                    load.source
                ))
            })?;
            let transformed = format!("ST_Transform(s.{}, {})", quote_ident(&geometry), srid.0);
            let bbox = ["ST_XMin", "ST_YMin", "ST_XMax", "ST_YMax"]
                .iter()
                .zip(BBOX_COLUMNS)
                .map(|(func, column)| format!("{}({}) AS {}", func, transformed, column))
                .join(", ");
            select = format!("SELECT s.*, {} FROM {} AS s", bbox, source);
        }

        let target = quote_ident(&load.relation);
        let mut tx = self.pool.begin().await?;
        match load.mode {
            MaterializationMode::View => {
                drop_existing(&mut tx, &load.relation).await?;
                sqlx::query(&format!("CREATE VIEW {} AS {}", target, select))
                    .execute(&mut *tx)
                    .await?;
            }
            MaterializationMode::Table => {
                let staging = quote_ident(&format!("{}$staging", load.relation));
                sqlx::query(&format!("DROP TABLE IF EXISTS {}", staging))
                    .execute(&mut *tx)
                    .await?;
                sqlx::query(&format!("CREATE TABLE {} AS {}", staging, select))
                    .execute(&mut *tx)
                    .await?;
                drop_existing(&mut tx, &load.relation).await?;
                sqlx::query(&format!("ALTER TABLE {} RENAME TO {}", staging, target))
                    .execute(&mut *tx)
                    .await?;
            }
        }
        record_srid(&mut tx, &load.relation, load.srid).await?;
        tx.commit().await?;

        if load.mode == MaterializationMode::Table {
            sqlx::query(&format!("ANALYZE {}", target)).execute(&self.pool).await?;
        }

        let rows: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", target))
            .fetch_one(&self.pool)
            .await?;
        info!("Materialized {} as {:?} with {} rows", load.relation, load.mode, rows);
        Ok(rows.max(0) as u64)
    }
}

async fn record_srid(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    relation: &str,
    srid: Option<Srid>,
) -> Result<()> {
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {} (relation text PRIMARY KEY, srid integer, loaded_at timestamptz NOT NULL DEFAULT now())",
        RELATION_CATALOG
    ))
    .execute(&mut **tx)
    .await?;
    sqlx::query(&format!(
        "INSERT INTO {} (relation, srid) VALUES ($1, $2) \
         ON CONFLICT (relation) DO UPDATE SET srid = EXCLUDED.srid, loaded_at = now()",
        RELATION_CATALOG
    ))
    .bind(relation)
    .bind(srid.map(|s| s.0 as i32))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Re-select the statement's columns through typed casts.
///
/// PostgreSQL does not promise that a plain scan over an ordered subquery
/// keeps that order, but it does so whenever the outer query adds no joins,
/// grouping or sorting of its own. Keep this wrapper a bare projection.
fn typed_projection(projection: &str, sql: &str, max_rows: usize) -> String {
    format!("SELECT {} FROM ({}) AS q LIMIT {}", projection, sql, max_rows)
}

async fn drop_existing(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>, relation: &str) -> Result<()> {
    let kind: Option<String> = sqlx::query_scalar(
        "SELECT c.relkind::text FROM pg_class c WHERE c.oid = to_regclass($1)",
    )
    .bind(quote_ident(relation))
    .fetch_optional(&mut **tx)
    .await?;
    let statement = match kind.as_deref() {
        Some("v") => "DROP VIEW",
        Some("m") => "DROP MATERIALIZED VIEW",
        Some("r") | Some("p") => "DROP TABLE",
        Some(other) => {
            return Err(GeoSqlError::Load(format!(
                "cannot replace {} (relation kind {})",
                relation, other
            )))
        }
        None => return Ok(()),
    };
    sqlx::query(&format!("{} {}", statement, quote_ident(relation)))
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn classify_sqlx(error: sqlx::Error) -> ExecutionError {
    match &error {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(QUERY_CANCELED) => {
            ExecutionError {
                kind: ExecutionErrorKind::Timeout,
                message: db.message().to_string(),
            }
        }
        sqlx::Error::Database(db) => ExecutionError::engine(db.message().to_string()),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
            ExecutionError::connection(error.to_string())
        }
        _ => ExecutionError::engine(error.to_string()),
    }
}

#[async_trait]
impl ExecutionEngine for PostgresEngine {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::Postgres
    }

    async fn describe_relation(&self, relation: &str) -> Result<RelationSchema> {
        let columns = self.fetch_columns(relation).await?;
        if columns.is_empty() {
            return Err(GeoSqlError::Schema(format!("relation {} not found", relation)));
        }
        let options = ExecuteOptions {
            max_rows: 3,
            geometry_as_text: true,
            ..ExecuteOptions::default()
        };
        let sample = self
            .run_query(&format!("SELECT * FROM {} LIMIT 3", quote_ident(relation)), &options)
            .await
            .map_err(|e| GeoSqlError::Schema(e.message))?;

        let catalog: Option<String> = sqlx::query_scalar("SELECT to_regclass($1)::text")
            .bind(RELATION_CATALOG)
            .fetch_one(&self.pool)
            .await?;
        let srid = match catalog {
            Some(_) => sqlx::query_scalar::<_, Option<i32>>(&format!(
                "SELECT srid FROM {} WHERE relation = $1",
                RELATION_CATALOG
            ))
            .bind(relation)
            .fetch_optional(&self.pool)
            .await?
            .flatten()
            .map(|s| Srid(s as u32)),
            None => None,
        };
        Ok(RelationSchema {
            srid,
            relation: relation.to_string(),
            columns,
            sample_rows: sample
                .rows
                .into_iter()
                .map(|row| row.into_iter().map(clip_sample_value).collect())
                .collect(),
        })
    }

    async fn run_query(
        &self,
        sql: &str,
        options: &ExecuteOptions,
    ) -> std::result::Result<ExecutionResult, ExecutionError> {
        let mut tx = self.pool.begin().await.map_err(|e| ExecutionError::connection(e.to_string()))?;
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(classify_sqlx)?;
        sqlx::query(&format!("SET LOCAL statement_timeout = {}", options.timeout.as_millis().max(1)))
            .execute(&mut *tx)
            .await
            .map_err(classify_sqlx)?;
        let pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
            .fetch_one(&mut *tx)
            .await
            .map_err(classify_sqlx)?;

        let sql = sql.trim().trim_end_matches(';').to_string();
        let max_rows = options.max_rows;
        let geometry_as_text = options.geometry_as_text;
        let work = async move {
            let statement = (&mut *tx).prepare(sql.as_str()).await.map_err(classify_sqlx)?;
            let columns: Vec<(String, Cast)> = statement
                .columns()
                .iter()
                .map(|c| (c.name().to_string(), Cast::for_type(c.type_info().name())))
                .collect();

            let mut seen = HashSet::new();
            if let Some((dup, _)) = columns.iter().find(|(name, _)| !seen.insert(name.as_str())) {
                return Err(ExecutionError::result_shape(format!(
                    "duplicate output column name {}; alias each column uniquely",
                    dup
                )));
            }
            if columns.is_empty() {
                return Err(ExecutionError::result_shape("statement returns no columns"));
            }

            let projection = columns
                .iter()
                .map(|(name, cast)| cast.select_expr(name, geometry_as_text))
                .join(", ");
            let wrapped = typed_projection(&projection, &sql, max_rows);
            let rows = sqlx::query(&wrapped).fetch_all(&mut *tx).await.map_err(classify_sqlx)?;

            let mut out = Vec::with_capacity(rows.len());
            for row in &rows {
                let mut values = Vec::with_capacity(columns.len());
                for (idx, (_, cast)) in columns.iter().enumerate() {
                    values.push(cast.read(row, idx).map_err(classify_sqlx)?);
                }
                out.push(values);
            }
            let names = columns.into_iter().map(|(name, _)| name).collect();
            Ok(ExecutionResult::new(names, out))
        };

        match tokio::time::timeout(options.timeout, work).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Statement exceeded {:?}, cancelling backend {}", options.timeout, pid);
                self.cancel_backend(pid).await;
                Err(ExecutionError::timeout(options.timeout))
            }
        }
    }

    async fn health_check(&self) -> Result<bool> {
        let one: i32 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(one == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cast_selection() {
        assert_eq!(Cast::for_type("INT4"), Cast::Integer);
        assert_eq!(Cast::for_type("NUMERIC"), Cast::Float);
        assert_eq!(Cast::for_type("geometry"), Cast::Geometry);
        assert_eq!(Cast::for_type("TIMESTAMPTZ"), Cast::Text);
    }

    #[test]
    fn test_geometry_projection_depends_on_text_flag() {
        assert_eq!(
            Cast::Geometry.select_expr("geom", true),
            "ST_AsGeoJSON(q.\"geom\") AS \"geom\""
        );
        assert_eq!(Cast::Geometry.select_expr("geom", false), "q.\"geom\"::text AS \"geom\"");
        assert_eq!(Cast::Float.select_expr("h", false), "q.\"h\"::float8 AS \"h\"");
    }

    #[test]
    fn test_typed_projection_keeps_inner_order_clause_untouched() {
        let inner = "SELECT name, height FROM buildings ORDER BY height DESC LIMIT 5";
        let wrapped = typed_projection("q.\"name\"::text AS \"name\"", inner, 5);
        assert_eq!(
            wrapped,
            "SELECT q.\"name\"::text AS \"name\" FROM (SELECT name, height FROM buildings ORDER BY height DESC LIMIT 5) AS q LIMIT 5"
        );
        let outer = wrapped.replace(inner, "");
        for clause in ["ORDER BY", "GROUP BY", "JOIN", "DISTINCT"] {
            assert!(!outer.contains(clause), "{}", outer);
        }
    }
}
