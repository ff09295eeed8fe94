//! Thin axum handlers (A4): one per tool in the external surface (§6), plus
//! `/healthz`/`/readyz`. Handlers only extract/validate the HTTP-shaped
//! request and format the response; all policy lives in `analysis`,
//! `execution`, and `rewrite`. `env` defaults to `"Int"` when omitted, since
//! the tool surface treats it as optional but every downstream call needs a
//! concrete environment name.

use crate::AppState;
use crate::error::GatewayError;
use crate::model::ReviewResult;
use crate::pool::providers::{self, PoolMetadataSource, PoolPlanProvider};
use axum::extract::State;
use axum::response::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

/// Every inbound tool call gets its own span carrying `env`, `user`, and a
/// fresh request id, so the rest of the call's log lines (pool acquisition,
/// breaker transitions, gate rejections, …) are automatically correlated.
fn tool_call_span(tool: &'static str, env: &str, user: &str) -> tracing::Span {
    tracing::info_span!("tool_call", tool, env = %env, user = %user, request_id = %Uuid::new_v4())
}

fn default_env() -> String {
    "Int".to_string()
}

fn default_caller() -> String {
    "anonymous".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ReviewSqlScriptRequest {
    pub script: String,
    #[serde(default = "default_env")]
    pub env: String,
    #[serde(default = "default_caller")]
    pub caller: String,
}

pub async fn review_sql_script(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReviewSqlScriptRequest>,
) -> Json<ReviewResult> {
    let span = tool_call_span("review_sql_script", &req.env, &req.caller);
    async move {
        let cost_threshold = state.config.safety.query_cost_threshold(&req.env);
        let plan_provider = PoolPlanProvider::new(&state.pool);
        let metadata_source = PoolMetadataSource::new(&state.pool);

        let result = state
            .orchestrator
            .review(&req.script, &req.env, &req.caller, cost_threshold, Some(&plan_provider), Some(&metadata_source))
            .await;

        Json(result)
    }
    .instrument(span)
    .await
}

#[derive(Debug, Deserialize)]
pub struct QueryReadonlyRequest {
    pub query: String,
    #[serde(default = "default_env")]
    pub env: String,
    pub database: Option<String>,
    #[serde(default = "default_caller")]
    pub caller: String,
    pub page_size: Option<usize>,
    pub page: Option<usize>,
}

#[derive(Debug, Serialize, Default)]
pub struct PaginationResponse {
    pub page: usize,
    pub page_size: usize,
    pub offset: usize,
    pub rows_returned: usize,
}

#[derive(Debug, Serialize, Default)]
pub struct LimitsApplied {
    pub max_rows: usize,
    pub max_payload_mb: u64,
}

#[derive(Debug, Serialize, Default)]
pub struct QueryReadonlyResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits_applied: Option<LimitsApplied>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_practice_warnings: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<PaginationResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocking_violations: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

pub async fn query_readonly(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QueryReadonlyRequest>,
) -> Json<QueryReadonlyResponse> {
    let span = tool_call_span("query_readonly", &req.env, &req.caller);
    async move { query_readonly_inner(state, req).await }.instrument(span).await
}

async fn query_readonly_inner(state: Arc<AppState>, req: QueryReadonlyRequest) -> Json<QueryReadonlyResponse> {
    let plan_provider = PoolPlanProvider::new(&state.pool);
    let result = state
        .executor
        .execute_readonly(
            &req.query,
            &req.env,
            req.database.as_deref(),
            &req.caller,
            req.page_size,
            req.page,
            Some(&plan_provider),
        )
        .await;

    match result {
        Ok(outcome) => {
            let warning = outcome
                .truncated
                .then(|| "result set truncated at the environment's row cap".to_string());
            Json(QueryReadonlyResponse {
                success: true,
                data: Some(outcome.rows),
                row_count: Some(outcome.row_count),
                execution_time_ms: Some(outcome.execution_time_ms),
                environment: Some(req.env.clone()),
                limits_applied: Some(LimitsApplied {
                    max_rows: state.config.safety.max_rows(&req.env),
                    max_payload_mb: state.config.safety.max_payload_size_mb(&req.env),
                }),
                review_summary: Some(outcome.review.summary.verdict.clone()),
                best_practice_warnings: Some(
                    outcome.review.best_practice_warnings().into_iter().map(|f| f.description.clone()).collect(),
                ),
                pagination: outcome.pagination.map(|p| PaginationResponse {
                    page: p.page,
                    page_size: p.page_size,
                    offset: p.offset,
                    rows_returned: p.rows_returned,
                }),
                error: warning,
                blocking_violations: None,
                retry_after_seconds: None,
            })
        },
        Err(GatewayError::SecViolation(reasons)) => Json(QueryReadonlyResponse {
            success: false,
            error: Some(reasons.clone()),
            blocking_violations: Some(reasons.split("; ").map(str::to_string).collect()),
            ..Default::default()
        }),
        Err(error) => Json(QueryReadonlyResponse {
            success: false,
            error: Some(error.to_string()),
            retry_after_seconds: error.retry_after_seconds(),
            ..Default::default()
        }),
    }
}

#[derive(Debug, Deserialize)]
pub struct SchemaSummaryRequest {
    #[serde(default = "default_env")]
    pub env: String,
    #[serde(default = "default_caller")]
    pub caller: String,
    pub search_term: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SchemaSummaryResponse {
    pub success: bool,
    pub summary: Vec<String>,
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub async fn schema_summary(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SchemaSummaryRequest>,
) -> Json<SchemaSummaryResponse> {
    let span = tool_call_span("schema_summary", &req.env, &req.caller);
    async move {
        match providers::schema_summary(&state.pool, &req.env, &req.caller, req.search_term.as_deref()).await {
            Ok(summary) => {
                let count = summary.len();
                Json(SchemaSummaryResponse { success: true, summary, count, error: None })
            },
            Err(error) => {
                Json(SchemaSummaryResponse { success: false, summary: Vec::new(), count: 0, error: Some(error.to_string()) })
            },
        }
    }
    .instrument(span)
    .await
}

#[derive(Debug, Deserialize)]
pub struct ExplainRequest {
    pub query: String,
    #[serde(default = "default_env")]
    pub env: String,
    pub database: Option<String>,
    #[serde(default = "default_caller")]
    pub caller: String,
}

#[derive(Debug, Serialize)]
pub struct ExplainResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_xml: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub async fn explain(State(state): State<Arc<AppState>>, Json(req): Json<ExplainRequest>) -> Json<ExplainResponse> {
    let span = tool_call_span("explain", &req.env, &req.caller);
    async move {
        if let Some(requested_db) = &req.database {
            let configured = state.config.database.connection_components.get(&req.env).map(|c| c.database.as_str());
            if configured.is_some_and(|db| !db.eq_ignore_ascii_case(requested_db)) {
                return Json(ExplainResponse {
                    success: false,
                    plan_xml: None,
                    environment: Some(req.env),
                    error: Some(GatewayError::DbNotAllowed(requested_db.clone()).to_string()),
                });
            }
        }

        match state.executor.get_execution_plan(&req.query, &req.env, &req.caller).await {
            Ok(xml) => Json(ExplainResponse { success: true, plan_xml: Some(xml), environment: Some(req.env), error: None }),
            Err(error) => {
                Json(ExplainResponse { success: false, plan_xml: None, environment: Some(req.env), error: Some(error.to_string()) })
            },
        }
    }
    .instrument(span)
    .await
}

pub async fn healthz() -> &'static str {
    "OK"
}

pub async fn readyz(State(state): State<Arc<AppState>>) -> &'static str {
    if state.config.database.connection_components.is_empty() { "DEGRADED" } else { "READY" }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_env_and_caller_are_stable() {
        assert_eq!(default_env(), "Int");
        assert_eq!(default_caller(), "anonymous");
    }
}
