//! Catalog / DMV Analyzer (C5): looks up physical metadata for the tables a
//! script references (`sys.stats`, `sys.dm_db_index_physical_stats`,
//! `sys.dm_db_index_usage_stats`, `sys.index_columns`, `sys.columns`,
//! `sys.foreign_keys`) and flags structural issues (BP032-BP042).
//! Metadata acquisition goes through a [`MetadataSource`] trait object for
//! the same reason the plan analyzer uses [`crate::analysis::plan::PlanProvider`]:
//! it lets C6 depend on "a thing that can answer catalog questions" without
//! depending on the concrete connection pool. Every rule below runs
//! independently against one row of facts per table; a missing fact (`None`)
//! simply skips that rule rather than failing the whole analysis.

use crate::error::GatewayResult;
use crate::model::{Category, Finding, Severity};
use async_trait::async_trait;
use serde::Serialize;

#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn table_metadata(
        &self,
        env: &str,
        caller: &str,
        tables: &[String],
    ) -> GatewayResult<Vec<TableMetadata>>;
}

#[derive(Debug, Clone, Serialize)]
pub struct TableMetadata {
    pub name: String,
    pub exists: bool,
    pub row_count: i64,
    pub column_count: u32,
    pub stats_age_days: Option<i64>,
    pub max_fragmentation_percent: Option<f64>,
    pub missing_stats_count: u32,
    pub unused_index_count: u32,
    pub duplicate_index_count: u32,
    pub is_heap: bool,
    pub is_partitioned: bool,
    pub has_columnstore_index: bool,
    pub has_max_length_column: bool,
    pub has_fk_without_leading_index: bool,
}

const STALE_STATS_DAYS: i64 = 7;
const FRAGMENTATION_THRESHOLD_PERCENT: f64 = 30.0;
const PARTITION_CANDIDATE_ROWS: i64 = 10_000_000;
const COLUMNSTORE_CANDIDATE_ROWS: i64 = 5_000_000;
const TOO_MANY_COLUMNS: u32 = 50;

pub struct MetadataAnalyzer;

impl MetadataAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub async fn analyze(
        &self,
        source: &dyn MetadataSource,
        env: &str,
        caller: &str,
        referenced_tables: &[String],
    ) -> GatewayResult<Vec<Finding>> {
        if referenced_tables.is_empty() {
            return Ok(Vec::new());
        }
        let metadata = source.table_metadata(env, caller, referenced_tables).await?;
        Ok(metadata.iter().flat_map(|m| self.check_table(m)).collect())
    }

    fn check_table(&self, m: &TableMetadata) -> Vec<Finding> {
        if !m.exists {
            return vec![finding(
                "META001",
                Severity::High,
                "Referenced Object Not Found",
                format!("'{}' was not found in the target database's catalog.", m.name),
                "Verify the object name and schema, and that it exists in the target environment.",
            )];
        }

        let mut findings = Vec::new();

        if let Some(age) = m.stats_age_days
            && age > STALE_STATS_DAYS
        {
            findings.push(finding(
                "BP032",
                Severity::Medium,
                "Stale Statistics",
                format!("Statistics on '{}' are {} days old (threshold {} days).", m.name, age, STALE_STATS_DAYS),
                "Run UPDATE STATISTICS or enable auto-update statistics for this table.",
            ));
        }

        if let Some(frag) = m.max_fragmentation_percent
            && frag > FRAGMENTATION_THRESHOLD_PERCENT
        {
            findings.push(finding(
                "BP033",
                Severity::Medium,
                "Fragmented Index",
                format!("'{}' has an index at {:.1}% fragmentation (threshold {:.0}%).", m.name, frag, FRAGMENTATION_THRESHOLD_PERCENT),
                "Rebuild or reorganize the index depending on fragmentation level.",
            ));
        }

        if m.missing_stats_count > 0 {
            findings.push(finding(
                "BP034",
                Severity::Low,
                "Missing Column Statistics",
                format!("{} column(s) on '{}' have no statistics object.", m.missing_stats_count, m.name),
                "Enable auto-create statistics or create them explicitly for frequently-filtered columns.",
            ));
        }

        if m.unused_index_count > 0 {
            findings.push(finding(
                "BP035",
                Severity::Low,
                "Unused Index",
                format!("{} index(es) on '{}' have recorded no seeks, scans, or lookups.", m.unused_index_count, m.name),
                "Confirm the index is genuinely unused before dropping it; each unused index adds write overhead.",
            ));
        }

        if m.duplicate_index_count > 0 {
            findings.push(finding(
                "BP036",
                Severity::Medium,
                "Probable Duplicate Index",
                format!("'{}' has {} index(es) sharing a leading-key prefix.", m.name, m.duplicate_index_count),
                "Consolidate overlapping indexes; duplicate leading keys rarely help the optimizer choose differently.",
            ));
        }

        if m.row_count > PARTITION_CANDIDATE_ROWS && !m.is_partitioned {
            findings.push(finding(
                "BP037",
                Severity::Medium,
                "Large Unpartitioned Table",
                format!("'{}' has {} rows and is not partitioned.", m.name, m.row_count),
                "Consider partitioning to bound maintenance and query scan cost.",
            ));
        }

        if m.row_count > COLUMNSTORE_CANDIDATE_ROWS && !m.has_columnstore_index {
            findings.push(finding(
                "BP038",
                Severity::Medium,
                "Large Table Without Columnstore Index",
                format!("'{}' has {} rows and no columnstore index.", m.name, m.row_count),
                "Evaluate a clustered or nonclustered columnstore index for analytical workloads on this table.",
            ));
        }

        if m.has_max_length_column {
            findings.push(finding(
                "BP039",
                Severity::Low,
                "Oversized MAX-Typed Column",
                format!("'{}' has a column declared with an unbounded MAX length.", m.name),
                "Prefer a bounded length unless the column genuinely stores large-object data.",
            ));
        }

        if m.is_heap {
            findings.push(finding(
                "BP040",
                Severity::Medium,
                "Heap Table",
                format!("'{}' has no clustered index.", m.name),
                "Add a clustered index; heaps accumulate forwarded-record overhead under updates/deletes.",
            ));
        }

        if m.column_count > TOO_MANY_COLUMNS {
            findings.push(finding(
                "BP041",
                Severity::Low,
                "Wide Table",
                format!("'{}' has {} columns (threshold {}).", m.name, m.column_count, TOO_MANY_COLUMNS),
                "Consider vertical partitioning if most queries touch only a subset of columns.",
            ));
        }

        if m.has_fk_without_leading_index {
            findings.push(finding(
                "BP042",
                Severity::Medium,
                "Foreign Key Without Leading Index",
                format!("'{}' has a foreign key whose referencing column(s) have no leading index.", m.name),
                "Add an index leading with the foreign key column(s) to avoid scans on join/delete cascades.",
            ));
        }

        findings
    }
}

impl Default for MetadataAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

fn finding(
    code: &str,
    severity: Severity,
    title: &str,
    description: String,
    recommendation: &str,
) -> Finding {
    Finding {
        code: code.to_string(),
        severity,
        category: Category::Performance,
        title: title.to_string(),
        description,
        recommendation: recommendation.to_string(),
        snippet: None,
        line_number: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(name: &str) -> TableMetadata {
        TableMetadata {
            name: name.to_string(),
            exists: true,
            row_count: 100,
            column_count: 10,
            stats_age_days: Some(1),
            max_fragmentation_percent: None,
            missing_stats_count: 0,
            unused_index_count: 0,
            duplicate_index_count: 0,
            is_heap: false,
            is_partitioned: true,
            has_columnstore_index: true,
            has_max_length_column: false,
            has_fk_without_leading_index: false,
        }
    }

    #[test]
    fn missing_table_short_circuits_other_checks() {
        let analyzer = MetadataAnalyzer::new();
        let m = TableMetadata { exists: false, ..base("dbo.Ghost") };
        let findings = analyzer.check_table(&m);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].code, "META001");
    }

    #[test]
    fn stale_stats_flagged() {
        let analyzer = MetadataAnalyzer::new();
        let m = TableMetadata { stats_age_days: Some(45), ..base("dbo.Orders") };
        assert!(analyzer.check_table(&m).iter().any(|f| f.code == "BP032"));
    }

    #[test]
    fn heap_table_flagged() {
        let analyzer = MetadataAnalyzer::new();
        let m = TableMetadata { is_heap: true, ..base("dbo.Log") };
        assert!(analyzer.check_table(&m).iter().any(|f| f.code == "BP040"));
    }

    #[test]
    fn large_table_without_partitioning_flagged() {
        let analyzer = MetadataAnalyzer::new();
        let m = TableMetadata { row_count: 20_000_000, is_partitioned: false, ..base("dbo.Events") };
        assert!(analyzer.check_table(&m).iter().any(|f| f.code == "BP037"));
    }

    #[test]
    fn healthy_table_yields_no_findings() {
        let analyzer = MetadataAnalyzer::new();
        let m = base("dbo.Orders");
        assert!(analyzer.check_table(&m).is_empty());
    }
}
