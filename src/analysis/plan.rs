//! Execution Plan Analyzer (C4): acquires the SQL Server showplan XML for a
//! statement and scans it for cost and shape problems (BP023-BP031):
//! missing indexes (BP023), table scans (BP024), index scans preferring
//! seeks (BP025), implicit conversions (BP026), excessive parallelism
//! (BP027), expensive sorts (BP028), hash matches (BP029), key/RID lookups
//! (BP030), and cardinality mis-estimation (BP031). Cost extraction prefers
//! the top-level statement's `StatementSubTreeCost`, falling back to the max
//! `EstimatedTotalSubtreeCost` across all operators when it's absent.
//! Acquisition is delegated to a [`PlanProvider`] trait object rather than a
//! concrete connection pool type, which is what lets the review orchestrator
//! (C6) depend on this module without depending on the execution engine (C7)
//! that actually owns a live connection — breaking what would otherwise be a
//! C6-C7 circular dependency.

use crate::error::GatewayResult;
use crate::model::{Category, Finding, Severity};
use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::reader::Reader;

#[async_trait]
pub trait PlanProvider: Send + Sync {
    /// Returns the raw showplan XML for `sql` without executing it, by
    /// wrapping it in `SET SHOWPLAN_XML ON ... OFF`.
    async fn get_showplan_xml(&self, env: &str, caller: &str, sql: &str) -> GatewayResult<String>;
}

#[derive(Debug, Clone)]
pub struct PlanAnalysis {
    pub estimated_cost: f64,
    pub findings: Vec<Finding>,
}

pub struct PlanAnalyzer;

impl PlanAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub async fn analyze(
        &self,
        provider: &dyn PlanProvider,
        env: &str,
        caller: &str,
        sql: &str,
        cost_threshold: f64,
    ) -> GatewayResult<PlanAnalysis> {
        let xml = provider.get_showplan_xml(env, caller, sql).await?;
        Ok(self.analyze_xml(&xml, cost_threshold))
    }

    /// Pure, synchronous XML-scanning half of the analysis, split out so it
    /// can be unit tested against fixed showplan fragments.
    fn analyze_xml(&self, xml: &str, _cost_threshold: f64) -> PlanAnalysis {
        let shape = scan_showplan(xml);
        let mut findings = Vec::new();

        if shape.missing_index_count > 0 {
            findings.push(Finding {
                code: "BP023".into(),
                severity: Severity::Medium,
                category: Category::Performance,
                title: "Missing Index Suggested".into(),
                description: format!(
                    "The optimizer recorded {} missing index recommendation(s), max impact {:.0}%.",
                    shape.missing_index_count, shape.missing_index_max_impact
                ),
                recommendation: "Evaluate the suggested index(es) before adding them in production.".into(),
                snippet: None,
                line_number: None,
            });
        }

        if shape.table_scan_count > 0 {
            findings.push(Finding {
                code: "BP024".into(),
                severity: Severity::Medium,
                category: Category::Performance,
                title: "Table Scan in Execution Plan".into(),
                description: format!("{} table scan operator(s) found in the plan.", shape.table_scan_count),
                recommendation: "Add a supporting index or rewrite predicates to enable a seek.".into(),
                snippet: None,
                line_number: None,
            });
        }

        if shape.index_scan_count > 0 {
            findings.push(Finding {
                code: "BP025".into(),
                severity: Severity::Low,
                category: Category::Performance,
                title: "Index Scan Preferring Seeks".into(),
                description: format!("{} index scan operator(s) found; an index seek is more efficient.", shape.index_scan_count),
                recommendation: "Review the WHERE clause and indexing to enable a seek instead of a scan.".into(),
                snippet: None,
                line_number: None,
            });
        }

        if shape.implicit_conversion_warning {
            findings.push(Finding {
                code: "BP026".into(),
                severity: Severity::Medium,
                category: Category::Performance,
                title: "Implicit Conversion in Plan".into(),
                description: "The plan's scalar operators show an implicit conversion, which prevents index usage.".into(),
                recommendation: "Match column and literal/parameter data types explicitly.".into(),
                snippet: None,
                line_number: None,
            });
        }

        if shape.parallelism_count > 3 {
            findings.push(Finding {
                code: "BP027".into(),
                severity: Severity::Low,
                category: Category::Performance,
                title: "Excessive Parallelism".into(),
                description: format!("{} parallelism operator(s) found in the plan.", shape.parallelism_count),
                recommendation: "Confirm the configured MAXDOP cap matches the environment's resource policy.".into(),
                snippet: None,
                line_number: None,
            });
        }

        if shape.expensive_sort_count > 0 {
            findings.push(Finding {
                code: "BP028".into(),
                severity: Severity::Low,
                category: Category::Performance,
                title: "Expensive Sort Operation".into(),
                description: format!("{} sort operator(s) with subtree cost >= 1.", shape.expensive_sort_count),
                recommendation: "An index matching the ORDER BY/GROUP BY can remove the sort entirely.".into(),
                snippet: None,
                line_number: None,
            });
        }

        if shape.hash_match_count > 0 {
            findings.push(Finding {
                code: "BP029".into(),
                severity: Severity::Low,
                category: Category::Performance,
                title: "Hash Match Operation".into(),
                description: format!("{} hash match operator(s) found.", shape.hash_match_count),
                recommendation: "Indexes supporting a merge or nested loop join may be cheaper than a hash match.".into(),
                snippet: None,
                line_number: None,
            });
        }

        if shape.key_lookup_count > 0 {
            findings.push(Finding {
                code: "BP030".into(),
                severity: Severity::Low,
                category: Category::Performance,
                title: "Key Lookup in Plan".into(),
                description: format!("{} key lookup operator(s) found; a covering index would avoid them.", shape.key_lookup_count),
                recommendation: "Add the looked-up columns to the seeking index as INCLUDE columns.".into(),
                snippet: None,
                line_number: None,
            });
        }

        if shape.cardinality_issue {
            findings.push(Finding {
                code: "BP031".into(),
                severity: Severity::Medium,
                category: Category::Performance,
                title: "Cardinality Mis-Estimation".into(),
                description: "The plan shows an operator where estimated and actual row counts differ by more than 10x.".into(),
                recommendation: "Update statistics on the underlying tables.".into(),
                snippet: None,
                line_number: None,
            });
        }

        PlanAnalysis { estimated_cost: shape.subtree_cost, findings }
    }
}

impl Default for PlanAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct PlanShape {
    subtree_cost: f64,
    table_scan_count: u32,
    index_scan_count: u32,
    missing_index_count: u32,
    missing_index_max_impact: f64,
    implicit_conversion_warning: bool,
    expensive_sort_count: u32,
    hash_match_count: u32,
    key_lookup_count: u32,
    parallelism_count: u32,
    cardinality_issue: bool,
}

fn attr_value(e: &quick_xml::events::BytesStart, name: &str) -> Option<String> {
    e.attributes().flatten().find(|a| a.key.as_ref() == name.as_bytes()).map(|a| {
        String::from_utf8_lossy(a.value.as_ref()).into_owned()
    })
}

/// Scans the showplan XML with a single forward pass (`quick_xml`'s
/// pull-parser), rather than building a DOM, since we only need a handful of
/// attribute/tag occurrences out of a potentially large document. Preferred
/// cost source is the top-level `StmtSimple`/`StmtCursor` node's
/// `StatementSubTreeCost`; when that attribute is absent, falls back to the
/// max `EstimatedTotalSubtreeCost` seen across all `RelOp` operators.
fn scan_showplan(xml: &str) -> PlanShape {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut shape = PlanShape::default();
    let mut seen_subtree_cost = false;
    let mut max_reloperator_cost: f64 = 0.0;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Eof) => break,
            Ok(Event::Empty(e)) | Ok(Event::Start(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                match tag.as_str() {
                    "StmtSimple" | "StmtCursor" if !seen_subtree_cost => {
                        if let Some(cost) = attr_value(&e, "StatementSubTreeCost").and_then(|v| v.parse().ok()) {
                            shape.subtree_cost = cost;
                            seen_subtree_cost = true;
                        }
                    },
                    "RelOp" => {
                        if let Some(cost) = attr_value(&e, "EstimatedTotalSubtreeCost").and_then(|v| v.parse::<f64>().ok()) {
                            max_reloperator_cost = max_reloperator_cost.max(cost);
                            if attr_value(&e, "PhysicalOp").as_deref() == Some("Sort") && cost >= 1.0 {
                                shape.expensive_sort_count += 1;
                            }
                        }
                        if let Some(op) = attr_value(&e, "PhysicalOp") {
                            match op.as_str() {
                                "Table Scan" => shape.table_scan_count += 1,
                                "Index Scan" => shape.index_scan_count += 1,
                                "Key Lookup" | "RID Lookup" => shape.key_lookup_count += 1,
                                "Parallelism" => shape.parallelism_count += 1,
                                _ if op.contains("Hash Match") => shape.hash_match_count += 1,
                                _ => {},
                            }
                        }
                        if let (Some(est), Some(actual)) = (
                            attr_value(&e, "EstimateRows").and_then(|v| v.parse::<f64>().ok()),
                            attr_value(&e, "ActualRows").and_then(|v| v.parse::<f64>().ok()),
                        ) && est > 0.0
                            && actual > 0.0
                            && (est.max(actual) / est.min(actual)) > 10.0
                        {
                            shape.cardinality_issue = true;
                        }
                    },
                    "MissingIndexGroup" => {
                        shape.missing_index_count += 1;
                        if let Some(impact) = attr_value(&e, "Impact").and_then(|v| v.parse::<f64>().ok()) {
                            shape.missing_index_max_impact = shape.missing_index_max_impact.max(impact);
                        }
                    },
                    "ScalarOperator" => {
                        if attr_value(&e, "ScalarString").is_some_and(|s| s.contains("CONVERT_IMPLICIT")) {
                            shape.implicit_conversion_warning = true;
                        }
                    },
                    _ => {},
                }
            },
            Err(_) => break,
            _ => {},
        }
        buf.clear();
    }

    if !seen_subtree_cost {
        shape.subtree_cost = max_reloperator_cost;
    }
    shape
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_PLAN: &str = r#"
        <ShowPlanXML>
          <BatchSequence><Batch><Statements>
            <StmtSimple StatementSubTreeCost="87.5">
              <QueryPlan>
                <MissingIndexes><MissingIndexGroup Impact="62.5" /></MissingIndexes>
                <RelOp PhysicalOp="Table Scan" LogicalOp="Table Scan" />
                <RelOp PhysicalOp="Key Lookup" LogicalOp="Key Lookup" />
              </QueryPlan>
            </StmtSimple>
          </Statements></Batch></BatchSequence>
        </ShowPlanXML>
    "#;

    const PLAN_WITH_NO_TOP_LEVEL_COST: &str = r#"
        <ShowPlanXML>
          <BatchSequence><Batch><Statements>
            <StmtSimple>
              <QueryPlan>
                <RelOp PhysicalOp="Hash Match" EstimatedTotalSubtreeCost="12.0" />
                <RelOp PhysicalOp="Sort" EstimatedTotalSubtreeCost="3.5" />
              </QueryPlan>
            </StmtSimple>
          </Statements></Batch></BatchSequence>
        </ShowPlanXML>
    "#;

    #[test]
    fn extracts_subtree_cost() {
        let shape = scan_showplan(SAMPLE_PLAN);
        assert_eq!(shape.subtree_cost, 87.5);
    }

    #[test]
    fn falls_back_to_max_reloperator_cost_when_top_level_cost_absent() {
        let shape = scan_showplan(PLAN_WITH_NO_TOP_LEVEL_COST);
        assert_eq!(shape.subtree_cost, 12.0);
    }

    #[test]
    fn counts_table_scans_and_key_lookups() {
        let shape = scan_showplan(SAMPLE_PLAN);
        assert_eq!(shape.table_scan_count, 1);
        assert_eq!(shape.key_lookup_count, 1);
        assert_eq!(shape.missing_index_count, 1);
        assert_eq!(shape.missing_index_max_impact, 62.5);
    }

    #[test]
    fn detects_hash_match_and_expensive_sort() {
        let shape = scan_showplan(PLAN_WITH_NO_TOP_LEVEL_COST);
        assert_eq!(shape.hash_match_count, 1);
        assert_eq!(shape.expensive_sort_count, 1);
    }

    #[test]
    fn plan_findings_use_the_spec_mandated_codes() {
        let analyzer = PlanAnalyzer::new();
        let analysis = analyzer.analyze_xml(SAMPLE_PLAN, 50.0);
        assert!(analysis.findings.iter().any(|f| f.code == "BP023"));
        assert!(analysis.findings.iter().any(|f| f.code == "BP024"));
        assert!(analysis.findings.iter().any(|f| f.code == "BP030"));
        assert!(!analysis.findings.iter().any(|f| f.code == "BP025"));
    }

    #[test]
    fn cheap_plan_has_no_missing_index_finding() {
        let analyzer = PlanAnalyzer::new();
        let analysis = analyzer.analyze_xml("<ShowPlanXML></ShowPlanXML>", 1000.0);
        assert!(!analysis.findings.iter().any(|f| f.code == "BP023"));
    }
}
