//! Review Orchestrator (C6): runs the AST analyzer, then fans out to the
//! plan and metadata analyzers (both optional, both behind trait-object
//! indirection), merges and re-scores the combined findings.

use crate::analysis::ast::AstAnalyzer;
use crate::analysis::metadata::{MetadataAnalyzer, MetadataSource};
use crate::analysis::plan::{PlanAnalyzer, PlanProvider};
use crate::config::RiskWeights;
use crate::model::{ReviewResult, ReviewSummary, Severity, derive_status, top_severity, verdict_for};

const PLAN_OR_METADATA_HIGH_PENALTY: u32 = 15;
const PLAN_OR_METADATA_MEDIUM_PENALTY: u32 = 5;

pub struct ReviewOrchestrator {
    ast_analyzer: AstAnalyzer,
    plan_analyzer: PlanAnalyzer,
    metadata_analyzer: MetadataAnalyzer,
}

impl ReviewOrchestrator {
    pub fn new(risk_weights: RiskWeights, allow_linked_servers: bool) -> Self {
        Self {
            ast_analyzer: AstAnalyzer::new(risk_weights, allow_linked_servers),
            plan_analyzer: PlanAnalyzer::new(),
            metadata_analyzer: MetadataAnalyzer::new(),
        }
    }

    /// Full review pipeline. `plan_provider`/`metadata_source` are `None`
    /// when the caller only wants the static (C3-only) review, e.g. before a
    /// connection to the target database is available.
    pub async fn review(
        &self,
        sql: &str,
        env: &str,
        caller: &str,
        cost_threshold: f64,
        plan_provider: Option<&dyn PlanProvider>,
        metadata_source: Option<&dyn MetadataSource>,
    ) -> ReviewResult {
        let mut result = self.ast_analyzer.analyze(sql);

        // Open question (a): a syntactically-blocked script never gets a plan
        // or metadata pass; `execution_plan_available` stays false unconditionally.
        if result.issues.iter().any(|f| f.code == "SYN001") {
            return result;
        }

        let mut extra_risk: u32 = 0;

        if let Some(provider) = plan_provider {
            match self.plan_analyzer.analyze(provider, env, caller, sql, cost_threshold).await {
                Ok(analysis) => {
                    result.performance_insights.execution_plan_available = true;
                    result.performance_insights.estimated_cost = Some(analysis.estimated_cost);
                    for f in analysis.findings {
                        extra_risk = extra_risk.saturating_add(penalty_for(f.severity));
                        result.issues.push(f);
                    }
                },
                Err(error) => {
                    tracing::warn!(%error, "plan acquisition failed; continuing without plan-based findings");
                },
            }
        }

        if let Some(source) = metadata_source {
            let tables: Vec<String> = result.schema_context.referenced_objects.iter().cloned().collect();
            match self.metadata_analyzer.analyze(source, env, caller, &tables).await {
                Ok(findings) => {
                    for f in findings {
                        extra_risk = extra_risk.saturating_add(penalty_for(f.severity));
                        result.issues.push(f);
                    }
                },
                Err(error) => {
                    tracing::warn!(%error, "metadata lookup failed; continuing without catalog findings");
                },
            }
        }

        result.dedup_issues();
        let risk_score = result.summary.risk_score.saturating_add(extra_risk).min(100);
        let top = top_severity(&result.issues);
        let status = derive_status(risk_score, top);
        result.summary = ReviewSummary { status, risk_score, verdict: verdict_for(status).to_string(), top_severity: top };
        result
    }
}

fn penalty_for(severity: Severity) -> u32 {
    match severity {
        Severity::Critical | Severity::High => PLAN_OR_METADATA_HIGH_PENALTY,
        Severity::Medium => PLAN_OR_METADATA_MEDIUM_PENALTY,
        Severity::Low => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayResult;
    use async_trait::async_trait;

    struct NoPlan;
    #[async_trait]
    impl PlanProvider for NoPlan {
        async fn get_showplan_xml(&self, _env: &str, _caller: &str, _sql: &str) -> GatewayResult<String> {
            Ok("<ShowPlanXML><BatchSequence><Batch><Statements><StmtSimple StatementSubTreeCost=\"5.0\" /></Statements></Batch></BatchSequence></ShowPlanXML>".to_string())
        }
    }

    struct PlanWithTableScan;
    #[async_trait]
    impl PlanProvider for PlanWithTableScan {
        async fn get_showplan_xml(&self, _env: &str, _caller: &str, _sql: &str) -> GatewayResult<String> {
            Ok("<ShowPlanXML><BatchSequence><Batch><Statements><StmtSimple StatementSubTreeCost=\"5.0\"><QueryPlan><RelOp PhysicalOp=\"Table Scan\" /></QueryPlan></StmtSimple></Statements></Batch></BatchSequence></ShowPlanXML>".to_string())
        }
    }

    #[tokio::test]
    async fn syntax_error_skips_plan_and_metadata() {
        let orchestrator = ReviewOrchestrator::new(RiskWeights::default(), false);
        let provider = NoPlan;
        let result = orchestrator.review("SELEKT * FROM", "Int", "alice", 50.0, Some(&provider), None).await;
        assert!(!result.performance_insights.execution_plan_available);
        assert_eq!(result.issues[0].code, "SYN001");
    }

    #[tokio::test]
    async fn plan_findings_bump_risk_score() {
        let orchestrator = ReviewOrchestrator::new(RiskWeights::default(), false);
        let provider = PlanWithTableScan;
        let result = orchestrator.review("SELECT id FROM dbo.Users", "Int", "alice", 1.0, Some(&provider), None).await;
        assert!(result.performance_insights.execution_plan_available);
        assert!(result.issues.iter().any(|f| f.code == "BP024"));
        assert!(result.summary.risk_score > 0);
    }

    #[tokio::test]
    async fn plan_without_shape_issues_still_records_estimated_cost() {
        let orchestrator = ReviewOrchestrator::new(RiskWeights::default(), false);
        let provider = NoPlan;
        let result = orchestrator.review("SELECT id FROM dbo.Users", "Int", "alice", 1.0, Some(&provider), None).await;
        assert!(result.performance_insights.execution_plan_available);
        assert_eq!(result.performance_insights.estimated_cost, Some(5.0));
    }
}
