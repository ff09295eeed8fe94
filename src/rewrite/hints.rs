//! Two hint injectors with deliberately opposite failure modes (§4.8):
//! the shared-read hint is correctness-adjacent (skipping it could let a
//! blocking reader contend with a writer) so it fails closed; the resource
//! hint is a pure optimizer nudge so it fails open.

use crate::error::GatewayError;
use once_cell::sync::Lazy;
use regex::Regex;

static FROM_TABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(FROM|JOIN)\s+(\[?[\w\.]+\]?(?:\s+(?:AS\s+)?\w+)?)(\s*\(\s*NOLOCK\s*\))?")
        .expect("static regex is valid")
});

static OPTION_CLAUSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bOPTION\s*\(([^)]*)\)\s*;?\s*$").expect("static regex is valid"));

/// Appends `WITH (NOLOCK)` to every `FROM`/`JOIN` table reference that does
/// not already carry it. Idempotent: a reference already hinted is left
/// untouched. Returns an error (fail-closed) if the statement contains no
/// recognizable table reference to hint, since the caller asked for
/// shared-read semantics and silently executing without them would be a
/// correctness regression, not a no-op.
pub fn inject_shared_read_hint(sql: &str) -> Result<String, GatewayError> {
    let mut any_matched = false;
    let rewritten = FROM_TABLE.replace_all(sql, |caps: &regex::Captures| {
        any_matched = true;
        let keyword = &caps[1];
        let table = &caps[2];
        if caps.get(3).is_some() {
            format!("{keyword} {table} (NOLOCK)")
        } else {
            format!("{keyword} {table} WITH (NOLOCK)")
        }
    });

    if !any_matched {
        return Err(GatewayError::HintInjectionFailed(
            "no FROM/JOIN table reference found to attach a shared-read hint to".to_string(),
        ));
    }
    Ok(rewritten.into_owned())
}

/// Merges `MAXDOP`/`MAX_GRANT_PERCENT` resource governors into an existing
/// `OPTION (...)` clause, or appends a new one. Idempotent: re-running with
/// the same `maxdop`/`max_grant_percent` leaves the clause unchanged. On any
/// parse surprise this fails open: it returns the original SQL unmodified
/// rather than blocking execution over an optimizer hint.
pub fn inject_resource_hints(sql: &str, maxdop: i32, max_grant_percent: i32) -> String {
    let new_options = [format!("MAXDOP {maxdop}"), format!("MAX_GRANT_PERCENT = {max_grant_percent}")];

    if let Some(caps) = OPTION_CLAUSE.captures(sql) {
        let existing = &caps[0];
        let existing_inner = &caps[1];
        let mut parts: Vec<String> = existing_inner
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .filter(|p| {
                let upper = p.to_uppercase();
                !upper.starts_with("MAXDOP") && !upper.starts_with("MAX_GRANT_PERCENT")
            })
            .collect();
        parts.extend(new_options);
        let merged = format!("OPTION ({})", parts.join(", "));
        sql.replacen(existing, &merged, 1)
    } else {
        let trimmed = sql.trim_end().trim_end_matches(';');
        format!("{trimmed} OPTION ({})", new_options.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_read_hint_added_to_plain_from() {
        let out = inject_shared_read_hint("SELECT id FROM dbo.Users WHERE id = 1").unwrap();
        assert!(out.contains("dbo.Users WITH (NOLOCK)"));
    }

    #[test]
    fn shared_read_hint_is_idempotent() {
        let once = inject_shared_read_hint("SELECT id FROM dbo.Users").unwrap();
        let twice = inject_shared_read_hint(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn shared_read_hint_errors_with_no_table_ref() {
        assert!(inject_shared_read_hint("SELECT 1").is_err());
    }

    #[test]
    fn resource_hint_appends_when_absent() {
        let out = inject_resource_hints("SELECT id FROM dbo.Users", 4, 25);
        assert!(out.contains("OPTION (MAXDOP 4, MAX_GRANT_PERCENT = 25)"));
    }

    #[test]
    fn resource_hint_merges_existing_option_clause() {
        let out = inject_resource_hints("SELECT id FROM dbo.Users OPTION (RECOMPILE)", 2, 10);
        assert!(out.contains("RECOMPILE"));
        assert!(out.contains("MAXDOP 2"));
    }
}
