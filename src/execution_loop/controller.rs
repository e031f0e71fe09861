//! Retry Controller
//!
//! Bounded synthesize -> validate -> execute loop. Every attempt, failed or
//! not, is appended to the history and the last failure is fed back into the
//! next synthesis. The loop runs at most `retries + 1` attempts.

use crate::execution::{ExecuteOptions, ExecutionResult, QueryExecutor, RelationSchema};
use crate::execution_loop::error_classifier::{ErrorClassifier, SqlErrorClass};
use crate::spatial::SpatialFilter;
use crate::synthesizer::{PriorError, QuerySynthesizer, SynthesisRequest};
use crate::validator::QueryValidator;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub retries: u32,
    pub max_rows: usize,
    pub timeout: Duration,
    pub geometry_as_text: bool,
    /// Stop early when the same SQL fails with the same error twice in a row
    pub abort_on_repeat_error: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            max_rows: 500,
            timeout: Duration::from_secs(30),
            geometry_as_text: false,
            abort_on_repeat_error: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptErrorKind {
    Synthesis,
    Validation,
    Execution,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptError {
    pub kind: AttemptErrorKind,
    pub class: SqlErrorClass,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryAttempt {
    /// 1-based
    pub seq: usize,
    pub sql: String,
    pub status: AttemptStatus,
    pub error: Option<AttemptError>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum LoopOutcome {
    Succeeded {
        result: ExecutionResult,
        history: Vec<QueryAttempt>,
    },
    Failed {
        history: Vec<QueryAttempt>,
    },
}

impl LoopOutcome {
    pub fn history(&self) -> &[QueryAttempt] {
        match self {
            LoopOutcome::Succeeded { history, .. } | LoopOutcome::Failed { history } => history,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, LoopOutcome::Succeeded { .. })
    }

    pub fn notes(&self) -> String {
        match self {
            LoopOutcome::Succeeded { history, .. } if history.len() == 1 => {
                "succeeded on first attempt".to_string()
            }
            LoopOutcome::Succeeded { history, .. } => format!("self-corrected on attempt {}", history.len()),
            LoopOutcome::Failed { history } => format!("failed after {} attempts", history.len()),
        }
    }
}

/// One natural-language request against one relation.
pub struct LoopRequest<'a> {
    pub prompt: &'a str,
    pub schema: &'a RelationSchema,
    pub spatial_filter: Option<&'a SpatialFilter>,
}

enum LoopState {
    Synthesizing { prior: Option<PriorError> },
    Validating { candidate: String },
    Executing { sql: String },
    Succeeded(ExecutionResult),
    Failed,
}

pub struct RetryController<'a> {
    synthesizer: &'a QuerySynthesizer,
    validator: &'a QueryValidator,
    executor: &'a QueryExecutor,
    policy: RetryPolicy,
    error_classifier: ErrorClassifier,
}

impl<'a> RetryController<'a> {
    pub fn new(
        synthesizer: &'a QuerySynthesizer,
        validator: &'a QueryValidator,
        executor: &'a QueryExecutor,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            synthesizer,
            validator,
            executor,
            policy,
            error_classifier: ErrorClassifier::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn run(&self, request: &LoopRequest<'_>) -> LoopOutcome {
        let budget = self.policy.retries as usize + 1;
        let options = ExecuteOptions {
            timeout: self.policy.timeout,
            max_rows: self.policy.max_rows,
            geometry_as_text: self.policy.geometry_as_text,
        };
        let mut history: Vec<QueryAttempt> = Vec::with_capacity(budget);
        let mut state = LoopState::Synthesizing { prior: None };

        loop {
            state = match state {
                LoopState::Synthesizing { prior } => {
                    info!("Execution attempt {} of {}", history.len() + 1, budget);
                    let synthesis = SynthesisRequest {
                        prompt: request.prompt,
                        schema: request.schema,
                        dialect: self.validator.dialect(),
                        max_rows: self.policy.max_rows,
                        prior_error: prior.as_ref(),
                        spatial_filter: request.spatial_filter,
                    };
                    match self.synthesizer.synthesize(&synthesis).await {
                        Ok(candidate) => LoopState::Validating { candidate },
                        Err(e) => {
                            warn!("Synthesis failed: {}", e);
                            let error = AttemptError {
                                kind: AttemptErrorKind::Synthesis,
                                class: SqlErrorClass::Other,
                                message: e.to_string(),
                            };
                            record(&mut history, String::new(), Some(error));
                            // no SQL to correct; keep the earlier context
                            self.after_failure(&history, budget, prior)
                        }
                    }
                }
                LoopState::Validating { candidate } => {
                    match self.validator.validate(&candidate, self.policy.max_rows) {
                        Ok(sql) => LoopState::Executing { sql },
                        Err(rejection) => {
                            warn!("Candidate rejected: {}", rejection);
                            let error = AttemptError {
                                kind: AttemptErrorKind::Validation,
                                class: self.error_classifier.classify_rejection(&rejection),
                                message: rejection.to_string(),
                            };
                            let prior = prior_from(&candidate, &error);
                            record(&mut history, candidate, Some(error));
                            self.after_failure(&history, budget, Some(prior))
                        }
                    }
                }
                LoopState::Executing { sql } => match self.executor.execute(&sql, &options).await {
                    Ok(result) => {
                        record(&mut history, sql, None);
                        LoopState::Succeeded(result)
                    }
                    Err(failure) => {
                        warn!("Execution failed: {}", failure);
                        let error = AttemptError {
                            kind: AttemptErrorKind::Execution,
                            class: self.error_classifier.classify_execution(&failure),
                            message: failure.to_string(),
                        };
                        let prior = prior_from(&sql, &error);
                        record(&mut history, sql, Some(error));
                        self.after_failure(&history, budget, Some(prior))
                    }
                },
                LoopState::Succeeded(result) => {
                    info!("✅ Query succeeded on attempt {}", history.len());
                    return LoopOutcome::Succeeded { result, history };
                }
                LoopState::Failed => {
                    warn!("Giving up after {} attempts", history.len());
                    return LoopOutcome::Failed { history };
                }
            };
        }
    }

    fn after_failure(
        &self,
        history: &[QueryAttempt],
        budget: usize,
        prior: Option<PriorError>,
    ) -> LoopState {
        if history.len() >= budget {
            return LoopState::Failed;
        }
        if self.policy.abort_on_repeat_error && self.repeated(history) {
            warn!("Same SQL failed with the same error twice, aborting");
            return LoopState::Failed;
        }
        LoopState::Synthesizing { prior }
    }

    fn repeated(&self, history: &[QueryAttempt]) -> bool {
        match history {
            [.., previous, last] => {
                previous.sql == last.sql
                    && previous.error.as_ref().map(|e| &e.message) == last.error.as_ref().map(|e| &e.message)
            }
            _ => false,
        }
    }
}

fn prior_from(sql: &str, error: &AttemptError) -> PriorError {
    PriorError {
        sql: sql.to_string(),
        message: error.message.clone(),
        class: error.class.clone(),
    }
}

fn record(history: &mut Vec<QueryAttempt>, sql: String, error: Option<AttemptError>) {
    let status = if error.is_none() { AttemptStatus::Ok } else { AttemptStatus::Error };
    history.push(QueryAttempt {
        seq: history.len() + 1,
        sql,
        status,
        error,
        recorded_at: Utc::now(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GeoSqlError, Result};
    use crate::execution::{ExecutionEngine, ExecutionError};
    use crate::llm::CompletionProvider;
    use crate::validator::{FunctionPolicy, SqlDialect};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Replies from a script; the last entry repeats.
    struct ScriptedProvider {
        replies: Vec<std::result::Result<String, String>>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(replies: Vec<std::result::Result<&str, &str>>) -> Self {
            Self {
                replies: replies
                    .into_iter()
                    .map(|r| r.map(String::from).map_err(String::from))
                    .collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CompletionProvider for ScriptedProvider {
        async fn complete(&self, _prompt: &str, _context: &str) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let idx = n.min(self.replies.len() - 1);
            self.replies[idx].clone().map_err(GeoSqlError::Llm)
        }
    }

    /// Fails any statement mentioning `bad_column`.
    struct PickyEngine;

    #[async_trait]
    impl ExecutionEngine for PickyEngine {
        fn name(&self) -> &'static str {
            "picky"
        }

        fn dialect(&self) -> SqlDialect {
            SqlDialect::Sqlite
        }

        async fn describe_relation(&self, relation: &str) -> Result<RelationSchema> {
            Ok(RelationSchema {
                relation: relation.to_string(),
                columns: Vec::new(),
                sample_rows: Vec::new(),
                srid: None,
            })
        }

        async fn run_query(
            &self,
            sql: &str,
            _options: &ExecuteOptions,
        ) -> std::result::Result<ExecutionResult, ExecutionError> {
            if sql.contains("bad_column") {
                Err(ExecutionError::engine("no such column: bad_column"))
            } else {
                Ok(ExecutionResult::new(vec!["n".to_string()], vec![vec![json!(1)]]))
            }
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }
    }

    fn schema() -> RelationSchema {
        RelationSchema {
            relation: "places".to_string(),
            columns: Vec::new(),
            sample_rows: Vec::new(),
            srid: None,
        }
    }

    async fn run(provider: ScriptedProvider, policy: RetryPolicy) -> LoopOutcome {
        let synthesizer = QuerySynthesizer::new(Arc::new(provider));
        let validator = QueryValidator::new(SqlDialect::Sqlite, FunctionPolicy::default());
        let executor = QueryExecutor::new(Arc::new(PickyEngine));
        let controller = RetryController::new(&synthesizer, &validator, &executor, policy);
        let schema = schema();
        controller
            .run(&LoopRequest { prompt: "count places", schema: &schema, spatial_filter: None })
            .await
    }

    const BAD: std::result::Result<&str, &str> = Ok("SELECT bad_column FROM places");
    const GOOD: std::result::Result<&str, &str> = Ok("SELECT n FROM places");

    #[tokio::test]
    async fn test_history_length_follows_failures_and_budget() {
        for retries in 0..=3u32 {
            for failures in 0..=4usize {
                let mut script = vec![BAD; failures];
                script.push(GOOD);
                let policy = RetryPolicy { retries, ..RetryPolicy::default() };
                let outcome = run(ScriptedProvider::new(script), policy).await;

                let expected_len = failures.min(retries as usize) + 1;
                assert_eq!(outcome.history().len(), expected_len, "retries={} failures={}", retries, failures);
                assert_eq!(outcome.is_success(), failures <= retries as usize);
                for (i, attempt) in outcome.history().iter().enumerate() {
                    assert_eq!(attempt.seq, i + 1);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_rejection_then_fix() {
        let script = vec![
            Ok("SELECT * FROM places; DROP TABLE places;"),
            Ok("SELECT n FROM places LIMIT 10"),
        ];
        let outcome = run(ScriptedProvider::new(script), RetryPolicy::default()).await;
        let history = outcome.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, AttemptStatus::Error);
        assert_eq!(history[0].sql, "SELECT * FROM places; DROP TABLE places;");
        assert_eq!(history[0].error.as_ref().map(|e| e.kind), Some(AttemptErrorKind::Validation));
        assert_eq!(history[1].status, AttemptStatus::Ok);
        assert_eq!(history[1].sql, "SELECT n FROM places LIMIT 10");
        assert_eq!(outcome.notes(), "self-corrected on attempt 2");
    }

    #[tokio::test]
    async fn test_completion_failure_consumes_budget() {
        let script = vec![Err("rate limited"), GOOD];
        let outcome = run(ScriptedProvider::new(script), RetryPolicy::default()).await;
        let history = outcome.history();
        assert!(outcome.is_success());
        assert_eq!(history[0].sql, "");
        assert_eq!(history[0].error.as_ref().map(|e| e.kind), Some(AttemptErrorKind::Synthesis));
    }

    #[tokio::test]
    async fn test_abort_on_repeat_error() {
        let policy = RetryPolicy { retries: 5, abort_on_repeat_error: true, ..RetryPolicy::default() };
        let outcome = run(ScriptedProvider::new(vec![BAD]), policy).await;
        assert!(!outcome.is_success());
        assert_eq!(outcome.history().len(), 2);
        assert_eq!(outcome.notes(), "failed after 2 attempts");
    }

    #[tokio::test]
    async fn test_first_attempt_success_note() {
        let outcome = run(ScriptedProvider::new(vec![GOOD]), RetryPolicy::default()).await;
        assert_eq!(outcome.notes(), "succeeded on first attempt");
        match outcome {
            LoopOutcome::Succeeded { result, history } => {
                assert_eq!(result.rows, vec![vec![json!(1)]]);
                assert!(history[0].sql.ends_with("LIMIT 500"));
            }
            LoopOutcome::Failed { .. } => panic!("expected success"),
        }
    }
}
