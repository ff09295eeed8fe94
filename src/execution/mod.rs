//! Safe Execution Engine (C7): the gate chain a `query_readonly` call must
//! pass before a single row reaches the caller. Each gate either rejects
//! outright or transforms the SQL/state handed to the next gate; gates 8 and
//! 9 are deliberately asymmetric (fail-closed vs. fail-open, see each gate's
//! doc comment) and gate 10 sums each returned cell's serialized size exactly
//! once, not once during execution and again during a later "measure" pass.

use crate::analysis::AstAnalyzer;
use crate::analysis::orchestrator::ReviewOrchestrator;
use crate::analysis::plan::PlanProvider;
use crate::config::Config;
use crate::error::{GatewayError, GatewayResult};
use crate::model::ReviewResult;
use crate::pool::{ConnectionPool, DbClient};
use crate::rewrite::{inject_pagination, inject_resource_hints, inject_row_cap, inject_shared_read_hint};
use futures_util::TryStreamExt;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tiberius::{ColumnData, QueryItem};

pub struct PaginationInfo {
    pub page: usize,
    pub page_size: usize,
    pub offset: usize,
    pub rows_returned: usize,
}

pub struct ExecutionOutcome {
    pub columns: Vec<String>,
    pub rows: Vec<Value>,
    pub row_count: usize,
    pub truncated: bool,
    pub payload_bytes: u64,
    pub review: ReviewResult,
    pub pagination: Option<PaginationInfo>,
    pub execution_time_ms: u64,
}

const MAX_STRING_CELL_CHARS: usize = 1000;

pub struct SafeExecutionEngine {
    config: Config,
    pool: Arc<ConnectionPool>,
    ast_analyzer: AstAnalyzer,
    orchestrator: ReviewOrchestrator,
}

impl SafeExecutionEngine {
    pub fn new(config: Config, pool: Arc<ConnectionPool>) -> Self {
        let ast_analyzer = AstAnalyzer::new(config.risk_weights.clone(), config.safety.allow_linked_servers);
        let orchestrator = ReviewOrchestrator::new(config.risk_weights.clone(), config.safety.allow_linked_servers);
        Self { config, pool, ast_analyzer, orchestrator }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn execute_readonly(
        &self,
        sql: &str,
        env: &str,
        database: Option<&str>,
        caller: &str,
        page_size: Option<usize>,
        page: Option<usize>,
        plan_provider: Option<&dyn PlanProvider>,
    ) -> GatewayResult<ExecutionOutcome> {
        let started = Instant::now();

        // Gate 1: pagination shape validation. Both or neither of page_size/page.
        let pagination_request = match (page_size, page) {
            (Some(size), Some(page)) => {
                if !(1..=1000).contains(&size) {
                    return Err(GatewayError::SyntaxError("page_size must be between 1 and 1000".to_string()));
                }
                if page < 1 {
                    return Err(GatewayError::SyntaxError("page must be >= 1".to_string()));
                }
                Some((page, size))
            },
            (None, None) => None,
            _ => {
                return Err(GatewayError::SyntaxError(
                    "page_size and page must be supplied together or not at all".to_string(),
                ));
            },
        };

        // Gate 2: throttle acquire, scoped to this call; released on every exit path.
        let _throttle_guard = self
            .pool
            .try_throttle(env, caller)
            .await
            .ok_or(GatewayError::TooManyConcurrent { retry_after_seconds: 5 })?;

        // Gate 3: read-only syntactic validator.
        self.ast_analyzer.validate_readonly(sql).map_err(GatewayError::SyntaxError)?;

        // Gate 4: pagination rewrite, only when the caller asked for a page.
        let mut rewritten = sql.to_string();
        let mut pagination_info = None;
        if let Some((page, page_size)) = pagination_request {
            let result = inject_pagination(&rewritten, page, page_size);
            rewritten = result.sql;
            pagination_info = Some(PaginationInfo { page, page_size, offset: result.offset, rows_returned: 0 });
        }

        // Gate 5: target database allow-list.
        let components = self
            .config
            .database
            .connection_components
            .get(env)
            .ok_or_else(|| GatewayError::DbNotAllowed(format!("unknown environment '{env}'")))?;
        if let Some(requested_db) = database
            && !requested_db.eq_ignore_ascii_case(&components.database)
        {
            return Err(GatewayError::DbNotAllowed(format!(
                "environment '{env}' is bound to database '{}', not '{requested_db}'",
                components.database
            )));
        }
        if !self.config.database.allowed_databases.is_empty() {
            let allowed = self
                .config
                .database
                .allowed_databases
                .iter()
                .any(|d| d.eq_ignore_ascii_case(&components.database));
            if !allowed {
                return Err(GatewayError::DbNotAllowed(components.database.clone()));
            }
        }

        let cost_threshold = self.config.safety.query_cost_threshold(env);

        // Gate 6: full review; reject on blocking findings. A reviewer-internal
        // failure (as opposed to a produced finding) is fail-open by construction,
        // since `review` itself never returns an error.
        let review = self.orchestrator.review(&rewritten, env, caller, cost_threshold, plan_provider, None).await;
        let blockers = review.blocking_findings();
        if !blockers.is_empty() {
            let reasons: Vec<String> = blockers.iter().map(|f| f.description.clone()).collect();
            return Err(GatewayError::SecViolation(reasons.join("; ")));
        }

        // Gate 7: cost gate, fail-open on plan-acquisition failure (already
        // reflected by `execution_plan_available` inside `review`).
        if self.config.safety.enable_cost_check
            && let Some(cost) = review.performance_insights.estimated_cost
            && cost > cost_threshold
        {
            return Err(GatewayError::QueryTooExpensive { cost, threshold: cost_threshold });
        }

        // Gate 8: shared-read hint, fail CLOSED. If the operator has opted into
        // NOLOCK semantics for this environment, a query we cannot safely hint
        // must not silently run with different (blocking) semantics instead.
        if self.config.safety.enable_nolock_hint(env) {
            rewritten = inject_shared_read_hint(&rewritten)?;
        }

        // Gate 9: resource-control hints, fail OPEN. This is an optimizer nudge;
        // if the OPTION clause can't be merged cleanly we still run the query.
        if self.config.safety.enable_resource_hints(env) {
            let maxdop = self.config.safety.maxdop(env);
            let max_grant_percent = self.config.safety.max_grant_percent(env);
            rewritten = inject_resource_hints(&rewritten, maxdop, max_grant_percent);
        }

        let max_rows = self.config.safety.max_rows(env);
        if pagination_info.is_none() {
            rewritten = inject_row_cap(&rewritten, max_rows);
        }
        let max_payload_bytes = self.config.safety.max_payload_size_mb(env) * 1024 * 1024;

        // Gate 10: execute & stream via a checked-out, breaker-gated connection.
        // Gate 11 (release) happens automatically: the throttle guard and the
        // connection are both released via Drop/checkin on every return path.
        let row_cap = pagination_info.as_ref().map(|p| p.page_size).unwrap_or(max_rows);
        let outcome = self
            .pool
            .run_checked_out(env, |client| {
                let sql = rewritten.clone();
                Box::pin(async move { run_query(client, &sql, row_cap, max_payload_bytes).await })
            })
            .await?;

        if let Some(info) = pagination_info.as_mut() {
            info.rows_returned = outcome.row_count;
        }

        Ok(ExecutionOutcome {
            columns: outcome.columns,
            rows: outcome.rows,
            row_count: outcome.row_count,
            truncated: outcome.truncated,
            payload_bytes: outcome.payload_bytes,
            review,
            pagination: pagination_info,
            execution_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Used by the `explain` tool: wraps `sql` in `SET SHOWPLAN_XML ON ... OFF`
    /// without executing it, returning the raw plan document.
    pub async fn get_execution_plan(&self, sql: &str, env: &str, caller: &str) -> GatewayResult<String> {
        self.pool
            .with_connection(env, caller, |client| {
                let sql = sql.to_string();
                Box::pin(fetch_showplan_xml(client, sql))
            })
            .await
    }
}

async fn fetch_showplan_xml(client: &mut DbClient, sql: String) -> GatewayResult<String> {
    client
        .simple_query("SET SHOWPLAN_XML ON")
        .await
        .map_err(|e| GatewayError::DbError(e.to_string()))?
        .into_results()
        .await
        .map_err(|e| GatewayError::DbError(e.to_string()))?;

    let mut stream = client.simple_query(sql).await.map_err(|e| GatewayError::DbError(e.to_string()))?;
    let mut xml = String::new();
    while let Some(item) = stream.try_next().await.map_err(|e| GatewayError::DbError(e.to_string()))? {
        if let QueryItem::Row(row) = item
            && let Some(ColumnData::String(Some(fragment))) = row.into_iter().next()
        {
            xml.push_str(&fragment);
        }
    }

    client
        .simple_query("SET SHOWPLAN_XML OFF")
        .await
        .map_err(|e| GatewayError::DbError(e.to_string()))?
        .into_results()
        .await
        .map_err(|e| GatewayError::DbError(e.to_string()))?;

    Ok(xml)
}

struct RawOutcome {
    columns: Vec<String>,
    rows: Vec<Value>,
    row_count: usize,
    truncated: bool,
    payload_bytes: u64,
}

async fn run_query(
    client: &mut DbClient,
    sql: &str,
    max_rows: usize,
    max_payload_bytes: u64,
) -> GatewayResult<RawOutcome> {
    let stream = client.query(sql, &[]).await.map_err(|e| GatewayError::DbError(e.to_string()))?;
    let mut columns: Vec<String> = Vec::new();
    let mut rows = Vec::new();
    let mut payload_bytes: u64 = 0;

    let mut rows_stream = stream.into_row_stream();
    while let Some(row) = rows_stream.try_next().await.map_err(|e| GatewayError::DbError(e.to_string()))? {
        if columns.is_empty() {
            columns = row.columns().iter().map(|c| c.name().to_string()).collect();
        }

        let mut obj = Map::with_capacity(columns.len());
        for (idx, name) in columns.iter().enumerate() {
            let value = column_to_json(&row, idx);
            // Each cell's size is accounted for exactly once, right here, as
            // it is converted — not re-measured in a later pass over `rows`.
            payload_bytes += estimate_json_size(&value) + name.len() as u64;
            obj.insert(name.clone(), value);
        }

        if payload_bytes > max_payload_bytes {
            return Err(GatewayError::PayloadTooLarge(max_payload_bytes / (1024 * 1024)));
        }

        rows.push(Value::Object(obj));
        if rows.len() >= max_rows {
            break;
        }
    }

    let row_count = rows.len();
    let truncated = row_count >= max_rows;

    Ok(RawOutcome { columns, rows, row_count, truncated, payload_bytes })
}

fn column_to_json(row: &tiberius::Row, idx: usize) -> Value {
    if let Some(v) = row.get::<&str, _>(idx) {
        let truncated: String = v.chars().take(MAX_STRING_CELL_CHARS).collect();
        return Value::String(truncated);
    }
    if let Some(v) = row.get::<i64, _>(idx) {
        return Value::from(v);
    }
    if let Some(v) = row.get::<i32, _>(idx) {
        return Value::from(v);
    }
    if let Some(v) = row.get::<f64, _>(idx) {
        return serde_json::Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null);
    }
    if let Some(v) = row.get::<bool, _>(idx) {
        return Value::Bool(v);
    }
    if let Some(v) = row.get::<chrono::NaiveDateTime, _>(idx) {
        return Value::String(v.to_string());
    }
    Value::Null
}

fn estimate_json_size(value: &Value) -> u64 {
    match value {
        Value::Null => 4,
        Value::Bool(_) => 5,
        Value::Number(n) => n.to_string().len() as u64,
        Value::String(s) => s.len() as u64,
        Value::Array(items) => items.iter().map(estimate_json_size).sum(),
        Value::Object(map) => map.values().map(estimate_json_size).sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_size_sums_each_value_once() {
        let mut obj = Map::new();
        obj.insert("id".to_string(), Value::from(12345));
        obj.insert("name".to_string(), Value::String("hello".to_string()));
        let value = Value::Object(obj);
        // "12345" (5) + "hello" (5) == 10, not double-counted via a second pass.
        assert_eq!(estimate_json_size(&value), 10);
    }
}
