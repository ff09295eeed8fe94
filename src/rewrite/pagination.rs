//! Pagination injector: appends `ORDER BY ... OFFSET ... FETCH NEXT ...` to a
//! SELECT that has neither a `TOP` nor an existing `OFFSET/FETCH` clause.
//! T-SQL requires an `ORDER BY` for `OFFSET/FETCH`, so a deterministic dummy
//! one (`ORDER BY (SELECT NULL)`) is added when the statement has none.

use once_cell::sync::Lazy;
use regex::Regex;

static HAS_TOP: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*SELECT\s+TOP\s*\(").expect("static regex is valid"));
static HAS_OFFSET: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bOFFSET\s+\d+\s+ROWS\b").expect("static regex is valid"));
static HAS_ORDER_BY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bORDER\s+BY\b").expect("static regex is valid"));

#[derive(Debug, Clone)]
pub struct PaginationRewrite {
    pub sql: String,
    pub applied: bool,
    pub offset: usize,
}

/// Rewrites `sql` to the page `page` (1-based) of `page_size` rows, unless it
/// already limits its result set (`TOP` or an existing `OFFSET/FETCH`), in
/// which case the rewrite is skipped and `applied` is `false`.
pub fn inject_pagination(sql: &str, page: usize, page_size: usize) -> PaginationRewrite {
    let offset = (page.saturating_sub(1)) * page_size;

    if HAS_TOP.is_match(sql) || HAS_OFFSET.is_match(sql) {
        return PaginationRewrite { sql: sql.to_string(), applied: false, offset };
    }

    let trimmed = sql.trim_end().trim_end_matches(';').to_string();
    let with_order_by =
        if HAS_ORDER_BY.is_match(&trimmed) { trimmed } else { format!("{trimmed} ORDER BY (SELECT NULL)") };

    let rewritten = format!("{with_order_by} OFFSET {offset} ROWS FETCH NEXT {page_size} ROWS ONLY");
    PaginationRewrite { sql: rewritten, applied: true, offset }
}

/// Bounds an un-paginated statement to at most `max_rows` when it carries no
/// limiting clause of its own; used on the non-paginated `query_readonly`
/// path as the hard row cap, independent of caller-requested pagination.
pub fn inject_row_cap(sql: &str, max_rows: usize) -> String {
    if HAS_TOP.is_match(sql) || HAS_OFFSET.is_match(sql) {
        return sql.to_string();
    }
    let trimmed = sql.trim_end().trim_end_matches(';').to_string();
    let with_order_by =
        if HAS_ORDER_BY.is_match(&trimmed) { trimmed } else { format!("{trimmed} ORDER BY (SELECT NULL)") };
    format!("{with_order_by} OFFSET 0 ROWS FETCH NEXT {max_rows} ROWS ONLY")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adds_dummy_order_by_when_missing() {
        let out = inject_pagination("SELECT id FROM dbo.Users", 1, 100);
        assert!(out.applied);
        assert!(out.sql.contains("ORDER BY (SELECT NULL)"));
        assert!(out.sql.contains("OFFSET 0 ROWS FETCH NEXT 100 ROWS ONLY"));
    }

    #[test]
    fn computes_offset_from_page_and_size() {
        let out = inject_pagination("SELECT id FROM dbo.Users ORDER BY id", 3, 10);
        assert_eq!(out.offset, 20);
        assert!(out.sql.contains("OFFSET 20 ROWS FETCH NEXT 10 ROWS ONLY"));
    }

    #[test]
    fn reuses_existing_order_by() {
        let out = inject_pagination("SELECT id FROM dbo.Users ORDER BY id", 1, 50);
        assert!(out.sql.contains("ORDER BY id OFFSET"));
        assert!(!out.sql.contains("SELECT NULL"));
    }

    #[test]
    fn skips_when_top_already_present() {
        let sql = "SELECT TOP (10) id FROM dbo.Users";
        let out = inject_pagination(sql, 1, 100);
        assert!(!out.applied);
        assert_eq!(out.sql, sql);
    }

    #[test]
    fn skips_when_offset_already_present() {
        let sql = "SELECT id FROM dbo.Users ORDER BY id OFFSET 0 ROWS FETCH NEXT 10 ROWS ONLY";
        let out = inject_pagination(sql, 1, 100);
        assert!(!out.applied);
        assert_eq!(out.sql, sql);
    }

    #[test]
    fn row_cap_applies_when_no_limiting_clause() {
        let out = inject_row_cap("SELECT id FROM dbo.Users", 500);
        assert!(out.contains("FETCH NEXT 500 ROWS ONLY"));
    }
}
