//! AST Analyzer (C3): parse, classify, extract referenced objects, and run the
//! security + best-practice rule registries.

use crate::config::RiskWeights;
use crate::model::{
    Category, Finding, PerformanceInsights, ReviewResult, ReviewSummary, SafetyChecks,
    SchemaContext, Severity, StatementTag, derive_status, top_severity, verdict_for,
};
use sqlparser::ast::{ObjectName, Statement};
use sqlparser::dialect::MsSqlDialect;
use sqlparser::parser::Parser;
use std::collections::BTreeSet;

pub struct AstAnalyzer {
    risk_weights: RiskWeights,
    allow_linked_servers: bool,
}

impl AstAnalyzer {
    pub fn new(risk_weights: RiskWeights, allow_linked_servers: bool) -> Self {
        Self { risk_weights, allow_linked_servers }
    }

    /// Deep static analysis of a (possibly multi-statement) script, producing a
    /// full [`ReviewResult`] minus the plan/metadata findings C6 adds later.
    pub fn analyze(&self, sql: &str) -> ReviewResult {
        let statements = match Parser::parse_sql(&MsSqlDialect {}, sql) {
            Ok(stmts) => stmts,
            Err(e) => return syntax_error_result(&e.to_string()),
        };

        let mut risk_score: u32 = 0;
        let mut findings: Vec<Finding> = Vec::new();
        let mut referenced: BTreeSet<String> = BTreeSet::new();
        let mut has_write_ops = false;
        let mut has_ddl = false;

        for stmt in &statements {
            let tag = classify(stmt);
            for name in referenced_objects(stmt) {
                referenced.insert(name);
            }

            if tag.is_write() {
                has_write_ops = true;
                risk_score = risk_score.saturating_add(100);
                findings.push(Finding {
                    code: "SEC001".into(),
                    severity: Severity::Critical,
                    category: Category::Security,
                    title: "Write Operation Detected".into(),
                    description: format!(
                        "The script contains a {tag:?} statement which modifies data."
                    ),
                    recommendation:
                        "Ensure this write operation is intended and authorized for the target environment.".into(),
                    snippet: Some(snippet_of(stmt)),
                    line_number: None,
                });

                if !has_where_clause(stmt) {
                    risk_score = risk_score.saturating_add(self.risk_weights.no_where_clause);
                    findings.push(Finding {
                        code: "SEC002".into(),
                        severity: Severity::Critical,
                        category: Category::Security,
                        title: format!("Missing WHERE Clause in {tag:?}"),
                        description: format!(
                            "Executing {tag:?} without a WHERE clause will affect ALL rows in the table."
                        ),
                        recommendation: "Add a WHERE clause to restrict the scope of the operation.".into(),
                        snippet: Some(snippet_of(stmt)),
                        line_number: None,
                    });
                }
            }

            if tag.is_ddl() {
                has_ddl = true;
                risk_score = risk_score.saturating_add(self.risk_weights.ddl_statement);
                findings.push(Finding {
                    code: "SEC003".into(),
                    severity: Severity::High,
                    category: Category::Security,
                    title: "DDL Statement Detected".into(),
                    description: format!(
                        "The script contains a {tag:?} statement which modifies the schema."
                    ),
                    recommendation: "DDL changes should be managed via migration tools, not ad-hoc scripts.".into(),
                    snippet: Some(snippet_of(stmt)),
                    line_number: None,
                });
            }

            if matches!(tag, StatementTag::Exec) || is_command_like(stmt) {
                risk_score = risk_score.saturating_add(self.risk_weights.dynamic_sql);
                findings.push(Finding {
                    code: "SEC004".into(),
                    severity: Severity::High,
                    category: Category::Security,
                    title: "Dynamic SQL Execution".into(),
                    description: "Dynamic SQL (EXEC/EXECUTE) allows arbitrary code execution and is hard to analyze.".into(),
                    recommendation: "Replace dynamic SQL with static SQL or parameterized queries where possible.".into(),
                    snippet: Some(snippet_of(stmt)),
                    line_number: None,
                });
            }

            if !self.allow_linked_servers && has_linked_server_access(stmt) {
                risk_score = risk_score.saturating_add(100);
                findings.push(Finding {
                    code: "SEC005".into(),
                    severity: Severity::Critical,
                    category: Category::Security,
                    title: "Linked Server Access Detected".into(),
                    description: "Query attempts to access linked servers, which is disabled for security reasons.".into(),
                    recommendation: "Linked server access is not allowed. Use direct database connections instead.".into(),
                    snippet: Some(snippet_of(stmt)),
                    line_number: None,
                });
            }

            if has_cross_join(stmt) {
                risk_score = risk_score.saturating_add(self.risk_weights.cross_join);
                findings.push(Finding {
                    code: "PERF001".into(),
                    severity: Severity::Medium,
                    category: Category::Performance,
                    title: "Cross Join Detected".into(),
                    description: "Cross joins generate a Cartesian product of rows, which can be performance-intensive.".into(),
                    recommendation: "Use an INNER JOIN with a specific ON condition instead.".into(),
                    snippet: Some(snippet_of(stmt)),
                    line_number: None,
                });
            }

            for bp in super::best_practices::check_rules(stmt) {
                risk_score = risk_score.saturating_add(self.risk_weights.best_practice);
                findings.push(Finding {
                    code: bp.code.to_string(),
                    severity: Severity::Low,
                    category: Category::BestPractice,
                    title: "Best Practice Violation".into(),
                    description: bp.message,
                    recommendation: "Review the SQL best practices guide.".into(),
                    snippet: Some(snippet_of(stmt)),
                    line_number: None,
                });
            }
        }

        risk_score = risk_score.min(100);
        let top = top_severity(&findings);
        let status = derive_status(risk_score, top);

        ReviewResult {
            summary: ReviewSummary {
                status,
                risk_score,
                verdict: verdict_for(status).to_string(),
                top_severity: top,
            },
            safety_checks: SafetyChecks {
                is_readonly: !(has_write_ops || has_ddl),
                has_write_ops,
                has_ddl,
            },
            issues: dedup(findings),
            performance_insights: PerformanceInsights {
                execution_plan_available: false,
                estimated_cost: None,
            },
            schema_context: SchemaContext { referenced_objects: referenced },
        }
    }

    /// Strict read-only validator used by the executor (C7 gate 3). Purely
    /// syntactic: exactly one statement, must be a bare SELECT, no `SELECT INTO`.
    pub fn validate_readonly(&self, sql: &str) -> Result<(), String> {
        let statements = Parser::parse_sql(&MsSqlDialect {}, sql)
            .map_err(|e| format!("Parsing error: {e}"))?;

        if statements.is_empty() {
            return Err("Empty query.".to_string());
        }
        if statements.len() > 1 {
            return Err("Multi-statement batches are not allowed in read-only mode.".to_string());
        }

        match &statements[0] {
            Statement::Query(query) => {
                if query_has_into(query) {
                    return Err("SELECT INTO is not allowed (write operation).".to_string());
                }
                Ok(())
            },
            other => Err(format!("Only SELECT statements are allowed. Found: {}", statement_kind(other))),
        }
    }
}

fn dedup(findings: Vec<Finding>) -> Vec<Finding> {
    let mut seen = std::collections::HashSet::new();
    findings.into_iter().filter(|f| seen.insert(f.dedup_key())).collect()
}

fn syntax_error_result(error_msg: &str) -> ReviewResult {
    ReviewResult {
        summary: ReviewSummary {
            status: crate::model::Status::Rejected,
            risk_score: 100,
            verdict: "Syntax Error prevented analysis.".to_string(),
            top_severity: Severity::Critical,
        },
        safety_checks: SafetyChecks { is_readonly: false, has_write_ops: false, has_ddl: false },
        issues: vec![Finding {
            code: "SYN001".into(),
            severity: Severity::Critical,
            category: Category::Maintainability,
            title: "SQL Syntax Error".into(),
            description: error_msg.to_string(),
            recommendation: "Fix the syntax error to allow further analysis.".into(),
            snippet: None,
            line_number: None,
        }],
        performance_insights: PerformanceInsights { execution_plan_available: false, estimated_cost: None },
        schema_context: SchemaContext::default(),
    }
}

fn statement_kind(stmt: &Statement) -> &'static str {
    match stmt {
        Statement::Query(_) => "SELECT",
        Statement::Insert(_) => "INSERT",
        Statement::Update { .. } => "UPDATE",
        Statement::Delete(_) => "DELETE",
        Statement::Merge { .. } => "MERGE",
        Statement::CreateTable(_)
        | Statement::CreateView { .. }
        | Statement::CreateIndex(_)
        | Statement::CreateSchema { .. } => "CREATE",
        Statement::AlterTable { .. } => "ALTER",
        Statement::Drop { .. } => "DROP",
        Statement::Execute { .. } => "EXEC",
        _ => "OTHER",
    }
}

pub fn classify(stmt: &Statement) -> StatementTag {
    match stmt {
        Statement::Query(_) => StatementTag::Select,
        Statement::Insert(_) => StatementTag::Insert,
        Statement::Update { .. } => StatementTag::Update,
        Statement::Delete(_) => StatementTag::Delete,
        Statement::Merge { .. } => StatementTag::Merge,
        Statement::CreateTable(_)
        | Statement::CreateView { .. }
        | Statement::CreateIndex(_)
        | Statement::CreateSchema { .. } => StatementTag::Create,
        Statement::AlterTable { .. } => StatementTag::Alter,
        Statement::Drop { .. } => StatementTag::Drop,
        Statement::Execute { .. } => StatementTag::Exec,
        _ => StatementTag::Other,
    }
}

fn is_command_like(stmt: &Statement) -> bool {
    matches!(stmt, Statement::Execute { .. })
}

fn snippet_of(stmt: &Statement) -> String {
    let s = stmt.to_string();
    if s.len() > 100 { format!("{}...", &s[..100]) } else { s }
}

fn has_where_clause(stmt: &Statement) -> bool {
    match stmt {
        Statement::Delete(delete) => delete.selection.is_some(),
        Statement::Update { selection, .. } => selection.is_some(),
        _ => true,
    }
}

fn query_has_into(query: &sqlparser::ast::Query) -> bool {
    // `SELECT ... INTO new_table ...` surfaces as an `into` target on the body's select.
    if let sqlparser::ast::SetExpr::Select(select) = query.body.as_ref() {
        select.into.is_some()
    } else {
        false
    }
}

/// Collects dotted object names referenced anywhere in the statement, via the
/// sqlparser `Visit` trait (feature `visitor`).
fn referenced_objects(stmt: &Statement) -> Vec<String> {
    use sqlparser::ast::{Visit, Visitor};
    use std::ops::ControlFlow;

    struct Collector(Vec<String>);
    impl Visitor for Collector {
        type Break = ();
        fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
            self.0.push(qualified_name(relation));
            ControlFlow::Continue(())
        }
    }

    let mut collector = Collector(Vec::new());
    let _ = stmt.visit(&mut collector);
    collector.0
}

fn qualified_name(name: &ObjectName) -> String {
    name.0.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(".")
}

/// A four-part reference (`catalog.schema.db.object`) is treated as linked-server
/// access per the spec's "do not guess" open question. We also retain the
/// original string-pattern checks for the constructs sqlparser does not model
/// as first-class nodes in every dialect build (OPENQUERY/OPENDATASOURCE/OPENROWSET).
fn has_linked_server_access(stmt: &Statement) -> bool {
    use sqlparser::ast::{Visit, Visitor};
    use std::ops::ControlFlow;

    struct FourPartFinder(bool);
    impl Visitor for FourPartFinder {
        type Break = ();
        fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
            if relation.0.len() >= 4 {
                self.0 = true;
            }
            ControlFlow::Continue(())
        }
    }
    let mut finder = FourPartFinder(false);
    let _ = stmt.visit(&mut finder);
    if finder.0 {
        return true;
    }

    let upper = stmt.to_string().to_uppercase();
    ["OPENQUERY", "OPENDATASOURCE", "OPENROWSET"].iter().any(|p| upper.contains(p))
}

fn has_cross_join(stmt: &Statement) -> bool {
    let Statement::Query(query) = stmt else { return false };
    let sqlparser::ast::SetExpr::Select(select) = query.body.as_ref() else { return false };
    select.from.iter().any(|table_with_joins| {
        table_with_joins
            .joins
            .iter()
            .any(|j| matches!(j.join_operator, sqlparser::ast::JoinOperator::CrossJoin))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weights() -> RiskWeights {
        RiskWeights::default()
    }

    #[test]
    fn delete_without_where_is_rejected() {
        let analyzer = AstAnalyzer::new(weights(), false);
        let result = analyzer.analyze("DELETE FROM dbo.Users");
        assert_eq!(result.summary.status, crate::model::Status::Rejected);
        assert_eq!(result.summary.risk_score, 100);
        assert!(result.safety_checks.has_write_ops);
        assert!(result.issues.iter().any(|f| f.code == "SEC001"));
        assert!(result.issues.iter().any(|f| f.code == "SEC002"));
    }

    #[test]
    fn plain_select_is_readonly() {
        let analyzer = AstAnalyzer::new(weights(), false);
        let result = analyzer.analyze("SELECT id FROM dbo.Users WHERE id = 1");
        assert!(result.safety_checks.is_readonly);
        assert!(!result.safety_checks.has_write_ops);
    }

    #[test]
    fn syntax_error_short_circuits() {
        let analyzer = AstAnalyzer::new(weights(), false);
        let result = analyzer.analyze("SELEKT * FROM");
        assert_eq!(result.summary.risk_score, 100);
        assert_eq!(result.issues[0].code, "SYN001");
        assert!(!result.performance_insights.execution_plan_available);
    }

    #[test]
    fn readonly_validator_rejects_multi_statement() {
        let analyzer = AstAnalyzer::new(weights(), false);
        assert!(analyzer.validate_readonly("SELECT 1; SELECT 2").is_err());
    }

    #[test]
    fn readonly_validator_accepts_plain_select() {
        let analyzer = AstAnalyzer::new(weights(), false);
        assert!(analyzer.validate_readonly("SELECT id FROM dbo.T").is_ok());
    }
}
