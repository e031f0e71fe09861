//! Query Synthesizer
//!
//! Turns a natural-language request plus a relation description into one
//! candidate SQL statement. Retries add the previous SQL, its error and a
//! class-specific hint.

use crate::execution::RelationSchema;
use crate::execution_loop::error_classifier::{ErrorClassifier, SqlErrorClass};
use crate::error::{GeoSqlError, Result};
use crate::glossary::AttributeGlossary;
use crate::llm::CompletionProvider;
use crate::spatial::SpatialFilter;
use crate::validator::SqlDialect;
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

lazy_static! {
    static ref FENCED_SQL: Regex = Regex::new(r"(?is)```(?:sql)?\s*(.+?)\s*```").unwrap();
    static ref FIRST_QUERY: Regex =
        Regex::new(r"(?i)\bSELECT\b|\bWITH\s+(?:RECURSIVE\s+)?\w+\s*(?:\([^)]*\)\s*)?AS\s*\(").unwrap();
}

/// What went wrong with the previous attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorError {
    pub sql: String,
    pub message: String,
    pub class: SqlErrorClass,
}

pub struct SynthesisRequest<'a> {
    pub prompt: &'a str,
    pub schema: &'a RelationSchema,
    pub dialect: SqlDialect,
    pub max_rows: usize,
    pub prior_error: Option<&'a PriorError>,
    pub spatial_filter: Option<&'a SpatialFilter>,
}

pub struct QuerySynthesizer {
    completion: Arc<dyn CompletionProvider>,
    glossary: Option<Arc<AttributeGlossary>>,
    classifier: ErrorClassifier,
}

impl QuerySynthesizer {
    pub fn new(completion: Arc<dyn CompletionProvider>) -> Self {
        Self {
            completion,
            glossary: None,
            classifier: ErrorClassifier::new(),
        }
    }

    pub fn with_glossary(mut self, glossary: Arc<AttributeGlossary>) -> Self {
        self.glossary = Some(glossary);
        self
    }

    pub async fn synthesize(&self, request: &SynthesisRequest<'_>) -> Result<String> {
        let system = self.build_system_context(request);
        let prompt = self.build_prompt(request);
        debug!("Synthesis prompt:\n{}", prompt);

        let completion = self.completion.complete(&prompt, &system).await?;
        extract_sql(&completion)
            .ok_or_else(|| GeoSqlError::Llm("completion did not contain a SQL statement".to_string()))
    }

    fn build_system_context(&self, request: &SynthesisRequest<'_>) -> String {
        let mut parts = Vec::new();
        parts.push(format!(
            "You are a SQL assistant for {} over geospatial data.",
            request.dialect
        ));
        parts.push("Produce exactly one read-only SELECT (or WITH ... SELECT) statement. DDL and DML are forbidden.".to_string());
        parts.push(format!("Always keep the result at LIMIT {} rows or fewer.", request.max_rows));
        parts.push("Use only column names from the provided list, spelled exactly; never invent columns.".to_string());
        parts.push("Give every output column a unique name; alias aggregates.".to_string());
        parts.push("When the user asks for a breakdown \"by X\", GROUP BY the X column.".to_string());
        parts.push("Do not add filter conditions the user did not ask for.".to_string());

        if let Some(geometry) = request.schema.geometry_column() {
            parts.push(format!(
                "The spatial column is named {}; do not use any other name for it.",
                geometry.name
            ));
        }
        match request.dialect {
            SqlDialect::Postgres => {
                parts.push("PostGIS functions (ST_*) are available.".to_string());
                if request.schema.has_bbox_columns() {
                    parts.push("Filter on min_lon/min_lat/max_lon/max_lat first as a coarse rectangle, then refine with ST_Intersects.".to_string());
                }
            }
            _ => {
                parts.push("Geometry is stored as GeoJSON text and no spatial functions are available.".to_string());
                if request.schema.has_bbox_columns() {
                    parts.push("Use the min_lon/min_lat/max_lon/max_lat columns for any spatial filtering.".to_string());
                }
            }
        }
        parts.push("Answer with the SQL in a ```sql fenced block followed by a one-line reason.".to_string());
        parts.join("\n")
    }

    fn build_prompt(&self, request: &SynthesisRequest<'_>) -> String {
        let schema = request.schema;
        let mut parts = Vec::new();

        if let Some(prior) = request.prior_error {
            parts.push("PREVIOUS ATTEMPT FAILED - fix it:".to_string());
            parts.push(format!("SQL: {}", prior.sql));
            parts.push(format!("Error ({}): {}", prior.class, prior.message));
            if let Some(hint) = self.hint_for(prior, schema) {
                parts.push(format!("Hint: {}", hint));
            }
            parts.push(String::new());
        }

        parts.push(format!("The only available relation is {}.", schema.relation));
        if let Some(srid) = schema.srid {
            parts.push(format!("Coordinates are stored in {}.", srid));
        }
        parts.push("Columns:".to_string());
        let mut columns = schema.columns.clone();
        if let Some(glossary) = &self.glossary {
            glossary.annotate(&mut columns);
        }
        for column in &columns {
            match &column.description {
                Some(description) => parts.push(format!("- {} ({}): {}", column.name, column.data_type, description)),
                None => parts.push(format!("- {} ({})", column.name, column.data_type)),
            }
        }

        if !schema.sample_rows.is_empty() {
            parts.push("Sample rows:".to_string());
            for row in &schema.sample_rows {
                parts.push(serde_json::Value::Array(row.clone()).to_string());
            }
        }

        if let Some(filter) = request.spatial_filter {
            parts.push(format!(
                "Spatial restriction ({}): {}",
                filter.srid,
                self.spatial_hint(filter, request)
            ));
        }

        parts.push(String::new());
        parts.push(format!("REQUEST: {}", request.prompt));
        parts.join("\n")
    }

    fn spatial_hint(&self, filter: &SpatialFilter, request: &SynthesisRequest<'_>) -> String {
        let schema = request.schema;
        match (request.dialect, schema.geometry_column()) {
            (SqlDialect::Postgres, Some(geometry)) => {
                let exact = filter.postgis_predicate(&geometry.name);
                if schema.has_bbox_columns() {
                    format!("WHERE {} AND {}", filter.bbox_column_predicate(), exact)
                } else {
                    format!("WHERE {}", exact)
                }
            }
            _ if schema.has_bbox_columns() => format!("WHERE {}", filter.bbox_column_predicate()),
            _ => "the relation has no bbox columns; state that the restriction cannot be applied and query without it".to_string(),
        }
    }

    fn hint_for(&self, prior: &PriorError, schema: &RelationSchema) -> Option<String> {
        match prior.class {
            SqlErrorClass::UnknownColumn => {
                let missing = self.classifier.missing_column(&prior.message)?;
                let suggestions = nearest_columns(&missing, &schema.column_names(), 3);
                if suggestions.is_empty() {
                    Some(format!("{} does not exist; pick a column from the list", missing))
                } else {
                    Some(format!("{} does not exist; did you mean {}?", missing, suggestions.join(", ")))
                }
            }
            SqlErrorClass::UnknownTable => Some(format!("query only the relation {}", schema.relation)),
            SqlErrorClass::AmbiguousColumn => Some("qualify or alias the ambiguous column".to_string()),
            SqlErrorClass::DuplicateColumn => Some("give every output column a distinct alias".to_string()),
            SqlErrorClass::InvalidAggregation => {
                Some("every non-aggregated output column must appear in GROUP BY".to_string())
            }
            SqlErrorClass::MultipleStatements | SqlErrorClass::Forbidden => {
                Some("return a single SELECT statement with no semicolons and no write or session commands".to_string())
            }
            SqlErrorClass::UnknownFunction => Some("use standard SQL functions only".to_string()),
            SqlErrorClass::Timeout => Some("simplify the query or filter earlier so it finishes faster".to_string()),
            SqlErrorClass::TypeMismatch => Some("cast values explicitly to matching types".to_string()),
            SqlErrorClass::SyntaxError | SqlErrorClass::Other => None,
        }
    }
}

/// Columns most similar to `name`, best first.
pub fn nearest_columns(name: &str, columns: &[&str], limit: usize) -> Vec<String> {
    let normalize = |s: &str| s.to_lowercase().replace('_', "");
    let wanted = normalize(name);
    let mut scored: Vec<(f64, &str)> = columns
        .iter()
        .map(|c| {
            let candidate = normalize(c);
            let mut score = strsim::jaro_winkler(&wanted, &candidate);
            if !wanted.is_empty() && (candidate.contains(&wanted) || wanted.contains(&candidate)) {
                score = score.max(0.9);
            }
            (score, *c)
        })
        .filter(|(score, _)| *score >= 0.75)
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.into_iter().take(limit).map(|(_, c)| c.to_string()).collect()
}

/// Pull the statement out of a completion: a fenced block if present, otherwise
/// everything from the first SELECT/WITH up to the first blank line.
pub fn extract_sql(completion: &str) -> Option<String> {
    if let Some(caps) = FENCED_SQL.captures(completion) {
        let sql = caps.get(1)?.as_str().trim();
        return (!sql.is_empty()).then(|| sql.to_string());
    }
    let start = FIRST_QUERY.find(completion)?.start();
    let rest = &completion[start..];
    let end = rest.find("\n\n").unwrap_or(rest.len());
    let sql = rest[..end].trim();
    (!sql.is_empty()).then(|| sql.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ColumnInfo;
    use crate::spatial::{FilterShape, Srid};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct RecordingProvider {
        reply: String,
        prompts: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl CompletionProvider for RecordingProvider {
        async fn complete(&self, prompt: &str, context: &str) -> Result<String> {
            self.prompts
                .lock()
                .map_err(|_| GeoSqlError::Llm("poisoned".to_string()))?
                .push((prompt.to_string(), context.to_string()));
            Ok(self.reply.clone())
        }
    }

    fn schema() -> RelationSchema {
        RelationSchema {
            relation: "buildings".to_string(),
            columns: vec![
                ColumnInfo::new("detailedUsage", "TEXT"),
                ColumnInfo::new("measuredHeight", "REAL"),
                ColumnInfo::new("geometry", "GEOMETRY"),
                ColumnInfo::new("min_lon", "REAL"),
                ColumnInfo::new("min_lat", "REAL"),
                ColumnInfo::new("max_lon", "REAL"),
                ColumnInfo::new("max_lat", "REAL"),
            ],
            sample_rows: vec![vec![serde_json::json!("401"), serde_json::json!(12.5)]],
            srid: Some(Srid::WGS84),
        }
    }

    #[test]
    fn test_extract_sql_variants() {
        assert_eq!(
            extract_sql("Here you go:\n```sql\nSELECT 1;\n```\nBecause.").as_deref(),
            Some("SELECT 1;")
        );
        assert_eq!(
            extract_sql("Sure. SELECT a FROM t\nWHERE b = 1\n\nThis counts rows.").as_deref(),
            Some("SELECT a FROM t\nWHERE b = 1")
        );
        assert_eq!(extract_sql("I cannot help with that."), None);
    }

    #[test]
    fn test_nearest_columns() {
        let columns = ["detailedUsage", "measuredHeight", "geometry"];
        assert_eq!(nearest_columns("detailed_usage", &columns, 3), vec!["detailedUsage"]);
        assert!(nearest_columns("zzz", &columns, 3).is_empty());
    }

    #[tokio::test]
    async fn test_retry_prompt_carries_error_and_suggestion() {
        let provider = Arc::new(RecordingProvider {
            reply: "```sql\nSELECT detailedUsage FROM buildings\n```".to_string(),
            prompts: Mutex::new(Vec::new()),
        });
        let synthesizer = QuerySynthesizer::new(provider.clone());
        let schema = schema();
        let prior = PriorError {
            sql: "SELECT usage FROM buildings".to_string(),
            message: "no such column: usage".to_string(),
            class: SqlErrorClass::UnknownColumn,
        };
        let filter = SpatialFilter {
            shape: FilterShape::Bbox { min_lon: 135.4, min_lat: 34.6, max_lon: 135.6, max_lat: 34.8 },
            srid: Srid::WGS84,
        };
        let request = SynthesisRequest {
            prompt: "count buildings by usage",
            schema: &schema,
            dialect: SqlDialect::Sqlite,
            max_rows: 10,
            prior_error: Some(&prior),
            spatial_filter: Some(&filter),
        };

        let sql = synthesizer.synthesize(&request).await.unwrap();
        assert_eq!(sql, "SELECT detailedUsage FROM buildings");

        let prompts = provider.prompts.lock().unwrap();
        let (prompt, context) = &prompts[0];
        assert!(prompt.contains("SQL: SELECT usage FROM buildings"));
        assert!(prompt.contains("did you mean detailedUsage"));
        assert!(prompt.contains("max_lon >= 135.4"));
        assert!(prompt.contains("REQUEST: count buildings by usage"));
        assert!(context.contains("LIMIT 10"));
    }

    #[tokio::test]
    async fn test_glossary_descriptions_reach_prompt() {
        let provider = Arc::new(RecordingProvider {
            reply: "SELECT 1".to_string(),
            prompts: Mutex::new(Vec::new()),
        });
        let glossary: AttributeGlossary =
            serde_json::from_str(r#"{"columns": {"detailedUsage": "detailed building usage"}}"#).unwrap();
        let synthesizer = QuerySynthesizer::new(provider.clone()).with_glossary(Arc::new(glossary));
        let schema = schema();
        let request = SynthesisRequest {
            prompt: "anything",
            schema: &schema,
            dialect: SqlDialect::Sqlite,
            max_rows: 5,
            prior_error: None,
            spatial_filter: None,
        };
        synthesizer.synthesize(&request).await.unwrap();
        let prompts = provider.prompts.lock().unwrap();
        assert!(prompts[0].0.contains("- detailedUsage (TEXT): detailed building usage"));
    }
}
