//! Tool envelopes and the service that runs them.
//!
//! Requests are explicit records with the optional fields enumerated; they are
//! checked and filled from [`AppConfig`] before anything reaches the loader or
//! the retry loop.

use crate::config::{AppConfig, QueryLimits};
use crate::dataset::{
    is_plain_identifier, DatasetDescriptor, DatasetLoader, MaterializationMode, SourceType,
};
use crate::error::{GeoSqlError, Result};
use crate::execution::{
    open_engine, DatabaseHandle, ExecuteOptions, ExecutionEngine, ExecutionResult, QueryExecutor, RelationSchema,
};
use crate::execution_loop::{
    AttemptErrorKind, AttemptStatus, LoopOutcome, LoopRequest, QueryAttempt, RetryController, RetryPolicy,
};
use crate::glossary::AttributeGlossary;
use crate::llm::{CompletionProvider, LlmClient};
use crate::spatial::{SpatialFilter, Srid};
use crate::synthesizer::{QuerySynthesizer, SynthesisRequest};
use crate::validator::{FunctionPolicy, QueryValidator};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "tool")]
pub enum ToolRequest {
    #[serde(rename = "load_spatial_dataset")]
    LoadSpatialDataset(LoadSpatialDatasetRequest),
    #[serde(rename = "propose_sql")]
    ProposeSql(ProposeSqlRequest),
    #[serde(rename = "run_sql")]
    RunSql(RunSqlRequest),
    #[serde(rename = "run_sql_smart")]
    RunSqlSmart(RunSqlSmartRequest),
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ToolResponse {
    LoadSpatialDataset(LoadSpatialDatasetResponse),
    ProposeSql(ProposeSqlResponse),
    RunSql(RunSqlResponse),
    RunSqlSmart(RunSqlSmartResponse),
}

fn check_relation_name(relation: &str) -> Result<()> {
    if is_plain_identifier(relation) {
        Ok(())
    } else {
        Err(GeoSqlError::InvalidRequest(format!(
            "relation name {:?} must match [A-Za-z_][A-Za-z0-9_]*",
            relation
        )))
    }
}

fn resolve_max_rows(requested: Option<usize>, limits: &QueryLimits) -> Result<usize> {
    match requested {
        Some(0) => Err(GeoSqlError::InvalidRequest("max_rows must be at least 1".to_string())),
        Some(n) if n > limits.hard_max_rows => {
            warn!("max_rows {} above ceiling, using {}", n, limits.hard_max_rows);
            Ok(limits.hard_max_rows)
        }
        Some(n) => Ok(n),
        None => Ok(limits.default_max_rows),
    }
}

fn resolve_timeout(requested: Option<u64>, limits: &QueryLimits) -> Result<Duration> {
    match requested {
        Some(0) => Err(GeoSqlError::InvalidRequest("timeout_ms must be positive".to_string())),
        Some(ms) => Ok(Duration::from_millis(ms).min(limits.statement_timeout)),
        None => Ok(limits.statement_timeout),
    }
}

/// A filter can only be compared with bbox columns stored in its own SRID.
fn check_filter(filter: Option<&SpatialFilter>, schema: &RelationSchema) -> Result<()> {
    match filter {
        Some(filter) if schema.has_bbox_columns() => filter.check_reference(schema.srid),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoadSpatialDatasetRequest {
    pub source_type: SourceType,
    pub path: String,
    #[serde(default)]
    pub db_path: Option<String>,
    #[serde(default)]
    pub relation: Option<String>,
    #[serde(default)]
    pub mode: Option<MaterializationMode>,
    #[serde(default)]
    pub srid: Option<Srid>,
    #[serde(default)]
    pub add_bbox_columns: bool,
    #[serde(default)]
    pub source_relation: Option<String>,
}

impl LoadSpatialDatasetRequest {
    pub fn into_descriptor(self, config: &AppConfig) -> Result<DatasetDescriptor> {
        let db = match self.db_path.as_deref() {
            Some(raw) => DatabaseHandle::parse(raw)?,
            None => DatabaseHandle::Sqlite(config.default_db_path.clone()),
        };
        let descriptor = DatasetDescriptor {
            source_type: self.source_type,
            path: self.path,
            db,
            relation: self.relation.unwrap_or_else(|| config.default_relation.clone()),
            mode: self.mode.unwrap_or_default(),
            srid: self.srid,
            add_bbox_columns: self.add_bbox_columns,
            source_relation: self.source_relation,
        };
        descriptor.check()?;
        Ok(descriptor)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum LoadSpatialDatasetResponse {
    Loaded {
        db_path: String,
        relation: String,
        kind: MaterializationMode,
        rows: u64,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunSqlSmartRequest {
    #[serde(default)]
    pub db_path: Option<String>,
    pub relation: String,
    pub user_prompt: String,
    #[serde(default)]
    pub max_rows: Option<usize>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub as_geojson: bool,
    #[serde(default)]
    pub spatial_filter: Option<SpatialFilter>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub abort_on_repeat_error: bool,
}

impl RunSqlSmartRequest {
    /// Check the request and derive the loop policy, clamped to the configured ceilings.
    pub fn policy(&self, config: &AppConfig) -> Result<RetryPolicy> {
        check_relation_name(&self.relation)?;
        if self.user_prompt.trim().is_empty() {
            return Err(GeoSqlError::InvalidRequest("user_prompt must not be empty".to_string()));
        }
        if let Some(filter) = &self.spatial_filter {
            filter.validate()?;
        }

        let limits = &config.limits;
        let max_rows = resolve_max_rows(self.max_rows, limits)?;
        let retries = match self.retries {
            Some(n) if n > limits.max_retries => {
                warn!("retries {} above ceiling, using {}", n, limits.max_retries);
                limits.max_retries
            }
            Some(n) => n,
            None => limits.default_retries,
        };
        let timeout = resolve_timeout(self.timeout_ms, limits)?;

        Ok(RetryPolicy {
            retries,
            max_rows,
            timeout,
            geometry_as_text: self.as_geojson,
            abort_on_repeat_error: self.abort_on_repeat_error,
        })
    }
}

/// Single synthesis without execution.
#[derive(Debug, Clone, Deserialize)]
pub struct ProposeSqlRequest {
    #[serde(default)]
    pub db_path: Option<String>,
    pub relation: String,
    pub user_prompt: String,
    #[serde(default)]
    pub max_rows: Option<usize>,
    #[serde(default)]
    pub spatial_filter: Option<SpatialFilter>,
}

impl ProposeSqlRequest {
    /// Row cap the proposal is limited to.
    pub fn max_rows(&self, config: &AppConfig) -> Result<usize> {
        check_relation_name(&self.relation)?;
        if self.user_prompt.trim().is_empty() {
            return Err(GeoSqlError::InvalidRequest("user_prompt must not be empty".to_string()));
        }
        if let Some(filter) = &self.spatial_filter {
            filter.validate()?;
        }
        resolve_max_rows(self.max_rows, &config.limits)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ProposeSqlResponse {
    Proposed {
        sql: String,
        notes: String,
    },
    Failed {
        error: String,
        /// The candidate that was refused, if synthesis got that far
        #[serde(skip_serializing_if = "Option::is_none")]
        sql: Option<String>,
    },
}

impl ProposeSqlResponse {
    fn failed(error: GeoSqlError, sql: Option<String>) -> Self {
        ProposeSqlResponse::Failed { error: error.to_string(), sql }
    }
}

/// Caller-supplied SQL, run once through the same gate as synthesized SQL.
#[derive(Debug, Clone, Deserialize)]
pub struct RunSqlRequest {
    #[serde(default)]
    pub db_path: Option<String>,
    pub sql: String,
    #[serde(default)]
    pub max_rows: Option<usize>,
    #[serde(default)]
    pub as_geojson: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl RunSqlRequest {
    pub fn options(&self, config: &AppConfig) -> Result<ExecuteOptions> {
        Ok(ExecuteOptions {
            timeout: resolve_timeout(self.timeout_ms, &config.limits)?,
            max_rows: resolve_max_rows(self.max_rows, &config.limits)?,
            geometry_as_text: self.as_geojson,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RunSqlResponse {
    Answered {
        /// Statement as executed, with the row cap applied
        sql: String,
        result: ResultPayload,
    },
    Failed {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        sql: Option<String>,
    },
}

impl RunSqlResponse {
    fn failed(error: GeoSqlError, sql: Option<String>) -> Self {
        RunSqlResponse::Failed { error: error.to_string(), sql }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunSqlResponse::Answered { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultPayload {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub truncated: bool,
}

impl From<ExecutionResult> for ResultPayload {
    fn from(result: ExecutionResult) -> Self {
        Self {
            columns: result.columns,
            rows: result.rows,
            truncated: result.truncated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub seq: usize,
    pub sql: String,
    pub status: AttemptStatus,
    pub error: Option<String>,
    pub error_kind: Option<AttemptErrorKind>,
}

impl From<&QueryAttempt> for HistoryEntry {
    fn from(attempt: &QueryAttempt) -> Self {
        Self {
            seq: attempt.seq,
            sql: attempt.sql.clone(),
            status: attempt.status,
            error: attempt.error.as_ref().map(|e| e.message.clone()),
            error_kind: attempt.error.as_ref().map(|e| e.kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RunSqlSmartResponse {
    Answered {
        result: ResultPayload,
        sql_history: Vec<HistoryEntry>,
        notes: String,
    },
    Failed {
        error: String,
        sql_history: Vec<HistoryEntry>,
    },
}

impl RunSqlSmartResponse {
    fn failed(error: GeoSqlError) -> Self {
        RunSqlSmartResponse::Failed {
            error: error.to_string(),
            sql_history: Vec::new(),
        }
    }

    fn from_outcome(outcome: LoopOutcome) -> Self {
        let notes = outcome.notes();
        match outcome {
            LoopOutcome::Succeeded { result, history } => RunSqlSmartResponse::Answered {
                result: ResultPayload::from(result),
                sql_history: history.iter().map(HistoryEntry::from).collect(),
                notes,
            },
            LoopOutcome::Failed { history } => {
                let exhausted = GeoSqlError::RetryExhausted { attempts: history.len() };
                let error = match history.last().and_then(|a| a.error.as_ref()) {
                    Some(last) => format!("{}; last error: {}", exhausted, last.message),
                    None => exhausted.to_string(),
                };
                RunSqlSmartResponse::Failed {
                    error,
                    sql_history: history.iter().map(HistoryEntry::from).collect(),
                }
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunSqlSmartResponse::Answered { .. })
    }
}

/// Session-scoped service: shared read-only across requests.
pub struct GeoSqlService {
    config: Arc<AppConfig>,
    completion: Arc<dyn CompletionProvider>,
    glossary: Option<Arc<AttributeGlossary>>,
    function_policy: FunctionPolicy,
}

impl GeoSqlService {
    pub fn new(config: Arc<AppConfig>, completion: Arc<dyn CompletionProvider>) -> Self {
        let function_policy =
            FunctionPolicy::new(&config.extra_denied_functions, &config.extra_allowed_functions);
        Self {
            config,
            completion,
            glossary: None,
            function_policy,
        }
    }

    /// Service backed by the chat-completions client and the configured glossary.
    pub fn from_config(config: Arc<AppConfig>) -> Result<Self> {
        let client = LlmClient::new(&config.llm)?;
        info!("Using completion model {}", client.model());
        let glossary = match &config.glossary_path {
            Some(path) => Some(Arc::new(AttributeGlossary::load(path)?)),
            None => None,
        };
        let mut service = Self::new(config, Arc::new(client));
        service.glossary = glossary;
        Ok(service)
    }

    pub fn with_glossary(mut self, glossary: Arc<AttributeGlossary>) -> Self {
        self.glossary = Some(glossary);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub async fn dispatch(&self, request: ToolRequest) -> ToolResponse {
        match request {
            ToolRequest::LoadSpatialDataset(req) => ToolResponse::LoadSpatialDataset(self.load_spatial_dataset(req).await),
            ToolRequest::ProposeSql(req) => ToolResponse::ProposeSql(self.propose_sql(req).await),
            ToolRequest::RunSql(req) => ToolResponse::RunSql(self.run_sql(req).await),
            ToolRequest::RunSqlSmart(req) => ToolResponse::RunSqlSmart(self.run_sql_smart(req).await),
        }
    }

    pub async fn load_spatial_dataset(&self, request: LoadSpatialDatasetRequest) -> LoadSpatialDatasetResponse {
        let loaded = async {
            let descriptor = request.into_descriptor(&self.config)?;
            DatasetLoader::new(&self.config).load(&descriptor).await
        }
        .await;

        match loaded {
            Ok(context) => {
                info!("Loaded {} with {} rows ({:?})", context.relation, context.row_count, context.kind);
                LoadSpatialDatasetResponse::Loaded {
                    db_path: context.db.to_string(),
                    relation: context.relation,
                    kind: context.kind,
                    rows: context.row_count,
                }
            }
            Err(e) => {
                warn!("Load failed: {}", e);
                LoadSpatialDatasetResponse::Failed { error: e.to_string() }
            }
        }
    }

    pub async fn run_sql_smart(&self, request: RunSqlSmartRequest) -> RunSqlSmartResponse {
        let request_id = Uuid::new_v4();
        info!("[{}] RunSQLSmart on {}: {}", request_id, request.relation, request.user_prompt);

        let policy = match request.policy(&self.config) {
            Ok(policy) => policy,
            Err(e) => return RunSqlSmartResponse::failed(e),
        };
        // Load-class failures are surfaced before the loop starts.
        let engine = match self.engine_for(request.db_path.as_deref()).await {
            Ok(engine) => engine,
            Err(e) => return RunSqlSmartResponse::failed(e),
        };
        let schema = match engine.describe_relation(&request.relation).await {
            Ok(schema) => schema,
            Err(e) => return RunSqlSmartResponse::failed(e),
        };
        if let Err(e) = check_filter(request.spatial_filter.as_ref(), &schema) {
            return RunSqlSmartResponse::failed(e);
        }

        let synthesizer = self.synthesizer();
        let validator = QueryValidator::new(engine.dialect(), self.function_policy.clone());
        let executor = QueryExecutor::new(engine);
        let controller = RetryController::new(&synthesizer, &validator, &executor, policy);

        let outcome = controller
            .run(&LoopRequest {
                prompt: &request.user_prompt,
                schema: &schema,
                spatial_filter: request.spatial_filter.as_ref(),
            })
            .await;
        info!("[{}] {}", request_id, outcome.notes());
        RunSqlSmartResponse::from_outcome(outcome)
    }

    /// One synthesis, validated but never executed.
    pub async fn propose_sql(&self, request: ProposeSqlRequest) -> ProposeSqlResponse {
        info!("ProposeSQL on {}: {}", request.relation, request.user_prompt);
        let max_rows = match request.max_rows(&self.config) {
            Ok(max_rows) => max_rows,
            Err(e) => return ProposeSqlResponse::failed(e, None),
        };
        let engine = match self.engine_for(request.db_path.as_deref()).await {
            Ok(engine) => engine,
            Err(e) => return ProposeSqlResponse::failed(e, None),
        };
        let schema = match engine.describe_relation(&request.relation).await {
            Ok(schema) => schema,
            Err(e) => return ProposeSqlResponse::failed(e, None),
        };
        if let Err(e) = check_filter(request.spatial_filter.as_ref(), &schema) {
            return ProposeSqlResponse::failed(e, None);
        }

        let synthesis = SynthesisRequest {
            prompt: &request.user_prompt,
            schema: &schema,
            dialect: engine.dialect(),
            max_rows,
            prior_error: None,
            spatial_filter: request.spatial_filter.as_ref(),
        };
        let candidate = match self.synthesizer().synthesize(&synthesis).await {
            Ok(candidate) => candidate,
            Err(e) => return ProposeSqlResponse::failed(e, None),
        };
        let validator = QueryValidator::new(engine.dialect(), self.function_policy.clone());
        match validator.validate(&candidate, max_rows) {
            Ok(sql) => ProposeSqlResponse::Proposed {
                sql,
                notes: format!("validated read-only SQL, LIMIT {} or less", max_rows),
            },
            Err(rejection) => {
                warn!("Proposal rejected: {}", rejection);
                ProposeSqlResponse::failed(rejection.into(), Some(candidate))
            }
        }
    }

    /// Validate and execute caller SQL once; no synthesis, no retries.
    pub async fn run_sql(&self, request: RunSqlRequest) -> RunSqlResponse {
        info!("RunSQL: {}", request.sql);
        let options = match request.options(&self.config) {
            Ok(options) => options,
            Err(e) => return RunSqlResponse::failed(e, None),
        };
        let engine = match self.engine_for(request.db_path.as_deref()).await {
            Ok(engine) => engine,
            Err(e) => return RunSqlResponse::failed(e, None),
        };
        let validator = QueryValidator::new(engine.dialect(), self.function_policy.clone());
        let sql = match validator.validate(&request.sql, options.max_rows) {
            Ok(sql) => sql,
            Err(rejection) => {
                warn!("Caller SQL rejected: {}", rejection);
                return RunSqlResponse::failed(rejection.into(), Some(request.sql));
            }
        };
        match QueryExecutor::new(engine).execute(&sql, &options).await {
            Ok(result) => RunSqlResponse::Answered {
                sql,
                result: ResultPayload::from(result),
            },
            Err(failure) => RunSqlResponse::failed(failure.into(), Some(sql)),
        }
    }

    async fn engine_for(&self, db_path: Option<&str>) -> Result<Arc<dyn ExecutionEngine>> {
        let handle = match db_path {
            Some(raw) => DatabaseHandle::parse(raw)?,
            None => DatabaseHandle::Sqlite(self.config.default_db_path.clone()),
        };
        open_engine(&handle, &self.config)
            .await
            .map_err(|e| GeoSqlError::Load(e.to_string()))
    }

    fn synthesizer(&self) -> QuerySynthesizer {
        let synthesizer = QuerySynthesizer::new(Arc::clone(&self.completion));
        match &self.glossary {
            Some(glossary) => synthesizer.with_glossary(Arc::clone(glossary)),
            None => synthesizer,
        }
    }
}
