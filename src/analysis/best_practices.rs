//! Best-practice rule registry (BP001-BP022): independent, named checks run
//! against a single parsed statement. Each rule is a free function so new
//! rules can be added without touching the dispatch table's shape, only the
//! `RULES` list.

use sqlparser::ast::{Expr, JoinOperator, SelectItem, SetExpr, SetOperator, SetQuantifier, Statement};

pub struct BestPracticeHit {
    pub code: &'static str,
    pub message: String,
}

fn hit(code: &'static str, message: impl Into<String>) -> BestPracticeHit {
    BestPracticeHit { code, message: message.into() }
}

type Rule = fn(&Statement, &str) -> Option<BestPracticeHit>;

const RULES: &[Rule] = &[
    bp001_wildcard_select,
    bp002_missing_schema_prefix,
    bp003_old_style_comma_join,
    bp004_function_wrapped_where_column,
    bp005_or_in_where,
    bp006_distinct_used,
    bp007_in_with_subquery,
    bp008_cursor_declared,
    bp009_scalar_function_in_select_list,
    bp010_large_in_list,
    bp011_union_without_all,
    bp012_heuristic_implicit_conversion,
    bp013_missing_set_nocount_on,
    bp014_missing_set_xact_abort_on,
    bp015_missing_try_catch,
    bp016_left_join_candidate,
    bp017_table_variable_for_large_set,
    bp018_dynamic_sql_concat,
    bp019_unclosed_transaction,
    bp020_excessive_nested_subqueries,
    bp021_select_without_top,
    bp022_sp_prefixed_call,
];

/// Runs every registered rule against `stmt`, returning the hits.
pub fn check_rules(stmt: &Statement) -> Vec<BestPracticeHit> {
    let rendered = stmt.to_string();
    RULES.iter().filter_map(|rule| rule(stmt, &rendered)).collect()
}

fn select_of(stmt: &Statement) -> Option<&sqlparser::ast::Select> {
    let Statement::Query(query) = stmt else { return None };
    match query.body.as_ref() {
        SetExpr::Select(select) => Some(select),
        _ => None,
    }
}

fn bp001_wildcard_select(stmt: &Statement, _: &str) -> Option<BestPracticeHit> {
    let select = select_of(stmt)?;
    select
        .projection
        .iter()
        .any(|item| matches!(item, SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..)))
        .then(|| hit("BP001", "SELECT * retrieves all columns; name the columns you need."))
}

fn bp002_missing_schema_prefix(stmt: &Statement, _: &str) -> Option<BestPracticeHit> {
    let select = select_of(stmt)?;
    let unqualified = select.from.iter().any(|twj| {
        matches!(&twj.relation, sqlparser::ast::TableFactor::Table { name, .. } if name.0.len() == 1)
    });
    unqualified.then(|| {
        hit("BP002", "Table referenced without a schema prefix (e.g. dbo.Table); qualify object names.")
    })
}

fn bp003_old_style_comma_join(stmt: &Statement, _: &str) -> Option<BestPracticeHit> {
    let select = select_of(stmt)?;
    (select.from.len() > 1)
        .then(|| hit("BP003", "Old-style comma join detected; use explicit ANSI JOIN ... ON syntax."))
}

fn bp004_function_wrapped_where_column(_: &Statement, rendered: &str) -> Option<BestPracticeHit> {
    let upper = rendered.to_uppercase();
    let where_clause = upper.split("WHERE").nth(1)?;
    ["ISNULL(", "CONVERT(", "CAST(", "SUBSTRING(", "UPPER(", "LOWER("]
        .iter()
        .any(|f| where_clause.contains(f))
        .then(|| {
            hit(
                "BP004",
                "A function wraps a column in the WHERE clause, which can prevent index usage (non-sargable predicate).",
            )
        })
}

fn bp005_or_in_where(stmt: &Statement, _: &str) -> Option<BestPracticeHit> {
    fn contains_or(expr: &Expr) -> bool {
        match expr {
            Expr::BinaryOp { op: sqlparser::ast::BinaryOperator::Or, .. } => true,
            Expr::BinaryOp { left, right, .. } => contains_or(left) || contains_or(right),
            Expr::Nested(inner) => contains_or(inner),
            _ => false,
        }
    }
    let select = select_of(stmt)?;
    select
        .selection
        .as_ref()
        .is_some_and(contains_or)
        .then(|| hit("BP005", "OR conditions in WHERE can defeat index seeks; consider UNION or IN instead."))
}

fn bp006_distinct_used(stmt: &Statement, _: &str) -> Option<BestPracticeHit> {
    let select = select_of(stmt)?;
    matches!(select.distinct, Some(sqlparser::ast::Distinct::Distinct))
        .then(|| hit("BP006", "DISTINCT often masks a join fan-out; verify the join predicates instead."))
}

fn bp007_in_with_subquery(stmt: &Statement, _: &str) -> Option<BestPracticeHit> {
    fn contains_in_subquery(expr: &Expr) -> bool {
        match expr {
            Expr::InSubquery { .. } => true,
            Expr::BinaryOp { left, right, .. } => contains_in_subquery(left) || contains_in_subquery(right),
            Expr::Nested(inner) => contains_in_subquery(inner),
            _ => false,
        }
    }
    let select = select_of(stmt)?;
    select
        .selection
        .as_ref()
        .is_some_and(contains_in_subquery)
        .then(|| hit("BP007", "IN (subquery) can often be rewritten as a JOIN or EXISTS for better plans."))
}

fn bp008_cursor_declared(_: &Statement, rendered: &str) -> Option<BestPracticeHit> {
    let upper = rendered.to_uppercase();
    (upper.contains("DECLARE") && upper.contains("CURSOR"))
        .then(|| hit("BP008", "Cursor declared; prefer set-based operations over row-by-row processing."))
}

fn bp009_scalar_function_in_select_list(stmt: &Statement, _: &str) -> Option<BestPracticeHit> {
    let select = select_of(stmt)?;
    select
        .projection
        .iter()
        .any(|item| matches!(item, SelectItem::UnnamedExpr(Expr::Function(_)) | SelectItem::ExprWithAlias { expr: Expr::Function(_), .. }))
        .then(|| hit("BP009", "Scalar function call in the SELECT list may be evaluated once per row; consider precomputing."))
}

fn bp010_large_in_list(stmt: &Statement, _: &str) -> Option<BestPracticeHit> {
    fn find_large_list(expr: &Expr) -> Option<usize> {
        match expr {
            Expr::InList { list, .. } if list.len() > 100 => Some(list.len()),
            Expr::BinaryOp { left, right, .. } => find_large_list(left).or_else(|| find_large_list(right)),
            Expr::Nested(inner) => find_large_list(inner),
            _ => None,
        }
    }
    let select = select_of(stmt)?;
    let len = find_large_list(select.selection.as_ref()?)?;
    Some(hit("BP010", format!("IN list has {len} literals; consider a temp table or table-valued parameter instead.")))
}

fn bp011_union_without_all(stmt: &Statement, _: &str) -> Option<BestPracticeHit> {
    let Statement::Query(query) = stmt else { return None };
    let SetExpr::SetOperation { op: SetOperator::Union, set_quantifier, .. } = query.body.as_ref() else {
        return None;
    };
    (!matches!(set_quantifier, SetQuantifier::All))
        .then(|| hit("BP011", "UNION without ALL performs an implicit DISTINCT sort; use UNION ALL if duplicates are acceptable."))
}

fn bp012_heuristic_implicit_conversion(stmt: &Statement, _: &str) -> Option<BestPracticeHit> {
    fn compares_string_literal_to_identifier(expr: &Expr) -> bool {
        match expr {
            Expr::BinaryOp { left, op: sqlparser::ast::BinaryOperator::Eq, right } => {
                let lhs_ident = matches!(left.as_ref(), Expr::Identifier(_) | Expr::CompoundIdentifier(_));
                let rhs_is_unquoted_numeric_like_string =
                    matches!(right.as_ref(), Expr::Value(sqlparser::ast::Value::Number(n, _)) if n.contains('.'));
                lhs_ident && rhs_is_unquoted_numeric_like_string
            },
            Expr::BinaryOp { left, right, .. } => {
                compares_string_literal_to_identifier(left) || compares_string_literal_to_identifier(right)
            },
            Expr::Nested(inner) => compares_string_literal_to_identifier(inner),
            _ => false,
        }
    }
    let select = select_of(stmt)?;
    select
        .selection
        .as_ref()
        .is_some_and(compares_string_literal_to_identifier)
        .then(|| hit("BP012", "Comparison may trigger an implicit data type conversion; verify column and literal types match."))
}

fn bp013_missing_set_nocount_on(_: &Statement, rendered: &str) -> Option<BestPracticeHit> {
    let upper = rendered.to_uppercase();
    let has_proc = upper.contains("CREATE PROC");
    (has_proc && !upper.contains("SET NOCOUNT ON"))
        .then(|| hit("BP013", "Procedure body has no SET NOCOUNT ON; enable it to avoid extra done-in-proc messages."))
}

fn bp014_missing_set_xact_abort_on(_: &Statement, rendered: &str) -> Option<BestPracticeHit> {
    let upper = rendered.to_uppercase();
    let has_tran = upper.contains("BEGIN TRAN");
    (has_tran && !upper.contains("SET XACT_ABORT ON"))
        .then(|| hit("BP014", "Transaction has no SET XACT_ABORT ON; enable it so a runtime error fully rolls back the transaction."))
}

fn bp015_missing_try_catch(stmt: &Statement, rendered: &str) -> Option<BestPracticeHit> {
    let is_write = matches!(stmt, Statement::Insert(_) | Statement::Update { .. } | Statement::Delete(_) | Statement::Merge { .. });
    (is_write && !rendered.to_uppercase().contains("TRY"))
        .then(|| hit("BP015", "Write statement is not wrapped in TRY/CATCH; add structured error handling."))
}

fn bp016_left_join_candidate(stmt: &Statement, _: &str) -> Option<BestPracticeHit> {
    let select = select_of(stmt)?;
    let has_right_join = select.from.iter().any(|twj| {
        twj.joins.iter().any(|j| matches!(j.join_operator, JoinOperator::RightOuter(_)))
    });
    has_right_join.then(|| hit("BP016", "RIGHT JOIN found; rewriting as a LEFT JOIN usually reads more naturally."))
}

fn bp017_table_variable_for_large_set(_: &Statement, rendered: &str) -> Option<BestPracticeHit> {
    rendered
        .to_uppercase()
        .contains("TABLE (")
        .then(|| hit("BP017", "Table variable declared; table variables carry no statistics and can misguide the optimizer for large sets."))
}

fn bp018_dynamic_sql_concat(_: &Statement, rendered: &str) -> Option<BestPracticeHit> {
    let upper = rendered.to_uppercase();
    (upper.contains("EXEC(") || upper.contains("EXEC (") || upper.contains("SP_EXECUTESQL"))
        .then(|| hit("BP018", "Dynamic SQL built via string concatenation; use sp_executesql with parameters to avoid injection and enable plan reuse."))
}

fn bp019_unclosed_transaction(_: &Statement, rendered: &str) -> Option<BestPracticeHit> {
    let upper = rendered.to_uppercase();
    let begins = upper.matches("BEGIN TRAN").count() + upper.matches("BEGIN TRANSACTION").count();
    let ends = upper.matches("COMMIT").count() + upper.matches("ROLLBACK").count();
    (begins > ends).then(|| hit("BP019", "A BEGIN TRANSACTION appears with no matching COMMIT/ROLLBACK in the script."))
}

fn bp020_excessive_nested_subqueries(stmt: &Statement, _: &str) -> Option<BestPracticeHit> {
    fn depth(query: &sqlparser::ast::Query) -> usize {
        let SetExpr::Select(select) = query.body.as_ref() else { return 0 };
        let mut max_inner = 0;
        for twj in &select.from {
            if let sqlparser::ast::TableFactor::Derived { subquery, .. } = &twj.relation {
                max_inner = max_inner.max(1 + depth(subquery));
            }
        }
        max_inner
    }
    let Statement::Query(query) = stmt else { return None };
    (depth(query) >= 3).then(|| hit("BP020", "Query nests three or more levels of derived tables; consider CTEs for readability and plan quality."))
}

fn bp021_select_without_top(stmt: &Statement, _: &str) -> Option<BestPracticeHit> {
    let Statement::Query(query) = stmt else { return None };
    let SetExpr::Select(select) = query.body.as_ref() else { return None };
    (select.top.is_none() && query.limit.is_none() && query.fetch.is_none())
        .then(|| hit("BP021", "SELECT has no TOP/OFFSET-FETCH limit; unbounded result sets risk large payloads."))
}

fn bp022_sp_prefixed_call(_: &Statement, rendered: &str) -> Option<BestPracticeHit> {
    let upper = rendered.to_uppercase();
    (upper.contains("EXEC SP_") || upper.contains("EXECUTE SP_"))
        .then(|| hit("BP022", "Calling an sp_-prefixed procedure; this prefix is reserved for system procedures and adds lookup overhead."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlparser::dialect::MsSqlDialect;
    use sqlparser::parser::Parser;

    fn parse(sql: &str) -> Statement {
        Parser::parse_sql(&MsSqlDialect {}, sql).unwrap().remove(0)
    }

    #[test]
    fn wildcard_select_flagged() {
        let stmt = parse("SELECT * FROM dbo.Users");
        assert!(check_rules(&stmt).iter().any(|h| h.code == "BP001"));
    }

    #[test]
    fn missing_schema_prefix_flagged() {
        let stmt = parse("SELECT id FROM Users");
        assert!(check_rules(&stmt).iter().any(|h| h.code == "BP002"));
    }

    #[test]
    fn comma_join_flagged() {
        let stmt = parse("SELECT a.id FROM dbo.A a, dbo.B b WHERE a.id = b.id");
        assert!(check_rules(&stmt).iter().any(|h| h.code == "BP003"));
    }

    #[test]
    fn select_top_suppresses_unbounded_warning() {
        let stmt = parse("SELECT TOP 10 id FROM dbo.Users");
        assert!(!check_rules(&stmt).iter().any(|h| h.code == "BP021"));
    }

    #[test]
    fn union_without_all_flagged() {
        let stmt = parse("SELECT id FROM dbo.A UNION SELECT id FROM dbo.B");
        assert!(check_rules(&stmt).iter().any(|h| h.code == "BP011"));
    }

    #[test]
    fn union_all_not_flagged() {
        let stmt = parse("SELECT id FROM dbo.A UNION ALL SELECT id FROM dbo.B");
        assert!(!check_rules(&stmt).iter().any(|h| h.code == "BP011"));
    }

    #[test]
    fn bare_update_does_not_trigger_nocount_or_xact_abort() {
        let stmt = parse("UPDATE dbo.T SET x = 1 WHERE id = 1");
        let hits = check_rules(&stmt);
        assert!(!hits.iter().any(|h| h.code == "BP013"));
        assert!(!hits.iter().any(|h| h.code == "BP014"));
    }

    #[test]
    fn procedure_body_without_nocount_flagged() {
        let stmt = parse("SELECT id FROM dbo.Users");
        let rendered = "CREATE PROC dbo.DoThing AS BEGIN SELECT 1 END";
        let hits: Vec<_> = RULES.iter().filter_map(|rule| rule(&stmt, rendered)).collect();
        assert!(hits.iter().any(|h| h.code == "BP013"));
    }

    #[test]
    fn procedure_body_with_nocount_not_flagged() {
        let stmt = parse("SELECT id FROM dbo.Users");
        let rendered = "CREATE PROC dbo.DoThing AS SET NOCOUNT ON BEGIN SELECT 1 END";
        let hits: Vec<_> = RULES.iter().filter_map(|rule| rule(&stmt, rendered)).collect();
        assert!(!hits.iter().any(|h| h.code == "BP013"));
    }

    #[test]
    fn transaction_without_xact_abort_flagged() {
        let stmt = parse("SELECT id FROM dbo.Users");
        let rendered = "BEGIN TRAN UPDATE dbo.T SET x = 1 COMMIT";
        let hits: Vec<_> = RULES.iter().filter_map(|rule| rule(&stmt, rendered)).collect();
        assert!(hits.iter().any(|h| h.code == "BP014"));
    }

    #[test]
    fn transaction_with_xact_abort_not_flagged() {
        let stmt = parse("SELECT id FROM dbo.Users");
        let rendered = "SET XACT_ABORT ON BEGIN TRAN UPDATE dbo.T SET x = 1 COMMIT";
        let hits: Vec<_> = RULES.iter().filter_map(|rule| rule(&stmt, rendered)).collect();
        assert!(!hits.iter().any(|h| h.code == "BP014"));
    }
}
