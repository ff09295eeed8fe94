use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "CRITICAL",
            Severity::High => "HIGH",
            Severity::Medium => "MEDIUM",
            Severity::Low => "LOW",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Category {
    Security,
    Performance,
    Reliability,
    Maintainability,
    BestPractice,
}

/// An immutable, single-use finding produced by one of the analyzers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub code: String,
    pub severity: Severity,
    pub category: Category,
    pub title: String,
    pub description: String,
    pub recommendation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,
}

impl Finding {
    /// Findings are "blocking" (spec §4.6) iff high-severity security/reliability
    /// grade, not a best-practice note.
    pub fn is_blocking(&self) -> bool {
        matches!(self.severity, Severity::Critical | Severity::High)
            && self.category != Category::BestPractice
    }

    /// Dedup key per the data model: code + description.
    pub fn dedup_key(&self) -> (String, String) {
        (self.code.clone(), self.description.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Approved,
    Warning,
    Rejected,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewSummary {
    pub status: Status,
    pub risk_score: u32,
    pub verdict: String,
    pub top_severity: Severity,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SafetyChecks {
    pub is_readonly: bool,
    pub has_write_ops: bool,
    pub has_ddl: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceInsights {
    pub execution_plan_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_cost: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchemaContext {
    pub referenced_objects: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewResult {
    pub summary: ReviewSummary,
    pub safety_checks: SafetyChecks,
    pub issues: Vec<Finding>,
    pub performance_insights: PerformanceInsights,
    pub schema_context: SchemaContext,
}

impl ReviewResult {
    /// Deduplicates `issues` by (code, description), preserving first-seen order.
    pub fn dedup_issues(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.issues.retain(|f| seen.insert(f.dedup_key()));
    }

    pub fn blocking_findings(&self) -> Vec<&Finding> {
        self.issues.iter().filter(|f| f.is_blocking()).collect()
    }

    pub fn best_practice_warnings(&self) -> Vec<&Finding> {
        self.issues.iter().filter(|f| f.category == Category::BestPractice).collect()
    }
}

/// Derives `status` from `risk_score`/`top_severity` per spec §3 thresholds.
pub fn derive_status(risk_score: u32, top_severity: Severity) -> Status {
    if risk_score >= 80 || top_severity == Severity::Critical {
        Status::Rejected
    } else if risk_score >= 30 {
        Status::Warning
    } else {
        Status::Approved
    }
}

pub fn verdict_for(status: Status) -> &'static str {
    match status {
        Status::Rejected => "Script poses critical risks and should NOT be executed.",
        Status::Warning => "Script contains potential issues. Review findings before critical execution.",
        Status::Approved => "Script is safe to execute.",
    }
}

pub fn top_severity(findings: &[Finding]) -> Severity {
    findings.iter().map(|f| f.severity).max().unwrap_or(Severity::Low)
}

/// Statement-level classification tag (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementTag {
    Select,
    Insert,
    Update,
    Delete,
    Merge,
    Create,
    Alter,
    Drop,
    Exec,
    Other,
}

impl StatementTag {
    pub fn is_write(self) -> bool {
        matches!(self, StatementTag::Insert | StatementTag::Update | StatementTag::Delete | StatementTag::Merge)
    }

    pub fn is_ddl(self) -> bool {
        matches!(self, StatementTag::Create | StatementTag::Alter | StatementTag::Drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_thresholds_match_spec() {
        assert_eq!(derive_status(0, Severity::Low), Status::Approved);
        assert_eq!(derive_status(29, Severity::Medium), Status::Approved);
        assert_eq!(derive_status(30, Severity::Medium), Status::Warning);
        assert_eq!(derive_status(79, Severity::High), Status::Warning);
        assert_eq!(derive_status(80, Severity::High), Status::Rejected);
        assert_eq!(derive_status(0, Severity::Critical), Status::Rejected);
    }

    #[test]
    fn blocking_excludes_best_practice() {
        let f = Finding {
            code: "BP001".into(),
            severity: Severity::High,
            category: Category::BestPractice,
            title: "x".into(),
            description: "x".into(),
            recommendation: "x".into(),
            snippet: None,
            line_number: None,
        };
        assert!(!f.is_blocking());
    }

    #[test]
    fn dedup_issues_keeps_first_occurrence() {
        let mk = |code: &str, desc: &str| Finding {
            code: code.into(),
            severity: Severity::Low,
            category: Category::BestPractice,
            title: "t".into(),
            description: desc.into(),
            recommendation: "r".into(),
            snippet: None,
            line_number: None,
        };
        let mut review = ReviewResult {
            summary: ReviewSummary {
                status: Status::Approved,
                risk_score: 0,
                verdict: "".into(),
                top_severity: Severity::Low,
            },
            safety_checks: SafetyChecks::default(),
            issues: vec![mk("BP001", "a"), mk("BP001", "a"), mk("BP002", "b")],
            performance_insights: PerformanceInsights::default(),
            schema_context: SchemaContext::default(),
        };
        review.dedup_issues();
        assert_eq!(review.issues.len(), 2);
    }
}
