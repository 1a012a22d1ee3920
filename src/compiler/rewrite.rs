//! Rewrite rules applied by the safety compiler, in order.
//!
//! Each rule is total: it either returns rewritten text or the compiler turns
//! its precondition failure into a named fault.

use crate::compiler::lexer::{first_top_level_after, mask_literals, top_level_matches};
use regex::Regex;

lazy_static::lazy_static! {
    static ref WHERE: Regex = Regex::new(r"\bwhere\b").unwrap();
    static ref FROM: Regex = Regex::new(r"\bfrom\b").unwrap();
    static ref AFTER_WHERE_CLAUSE: Regex =
        Regex::new(r"\b(group\s+by|having|order\s+by|limit|offset|fetch|window|for)\b").unwrap();
    static ref TRAILING_CLAUSE: Regex = Regex::new(r"\b(limit|offset|fetch|for)\b").unwrap();
    static ref LIMIT: Regex = Regex::new(r"\blimit\b").unwrap();
    static ref LIMIT_END: Regex = Regex::new(r"\b(offset|fetch|for)\b").unwrap();
    static ref FETCH_FIRST: Regex = Regex::new(r"\bfetch\s+(?:first|next)\b").unwrap();
    static ref FETCH_ROWS: Regex = Regex::new(r"\brows?\b").unwrap();
    static ref LOCKING_CLAUSE: Regex = Regex::new(r"\bfor\s+(?:update|share|no\s+key|key)\b").unwrap();
    static ref PLACEHOLDER: Regex = Regex::new(r"\$\d+").unwrap();
}

/// Patterns that recognize predicates on the tenant column.
///
/// Matching always runs on literal-masked text, so a tenant pattern quoted
/// inside a string value is never rewritten or refused.
pub struct TenantPatterns {
    column: String,
    literal_equality: Regex,
    reversed_literal: Regex,
    other_literal_operator: Regex,
    bound_filter: Regex,
}

impl TenantPatterns {
    pub fn new(column: &str) -> Self {
        let col = regex::escape(column);
        let qualified = format!(r#"((?:"?[A-Za-z_][A-Za-z0-9_]*"?\s*\.\s*)?"?\b{}\b"?)"#, col);
        Self {
            column: column.to_string(),
            literal_equality: Regex::new(&format!(r"(?i){}\s*=\s*'((?:[^']|'')*)'", qualified))
                .expect("tenant equality pattern"),
            reversed_literal: Regex::new(&format!(r#"(?i)'(?:[^']|'')*'\s*=\s*{}"#, qualified))
                .expect("reversed tenant pattern"),
            other_literal_operator: Regex::new(&format!(
                r"(?i){}\s*(?:<>|!=|~|\bnot\s+in\b|\bin\s*\(|\bnot\s+like\b|\blike\b|\bilike\b|\bsimilar\b)",
                qualified
            ))
            .expect("tenant operator pattern"),
            bound_filter: Regex::new(&format!(
                r#"(?i)^\(*\s*(?:"?([a-z_][a-z0-9_]*)"?\s*\.\s*)?"?{}"?\s*=\s*\$\d+\s*\)*$"#,
                col
            ))
            .expect("bound tenant filter pattern"),
        }
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    /// Replace `tenant = '<literal>'` comparisons with placeholders bound to
    /// the caller's tenant id. Returns the new text and the literal values
    /// that were replaced.
    pub fn bind_literals(&self, sql: &str, tenant_id: &str, params: &mut Vec<String>) -> (String, Vec<String>) {
        let masked = mask_literals(sql);
        let mut replaced = Vec::new();
        let mut rewritten = String::with_capacity(sql.len());
        let mut copied = 0;
        for caps in self.literal_equality.captures_iter(&masked) {
            let (Some(whole), Some(column), Some(value)) = (caps.get(0), caps.get(1), caps.get(2)) else {
                continue;
            };
            params.push(tenant_id.to_string());
            replaced.push(sql[value.range()].replace("''", "'"));
            rewritten.push_str(&sql[copied..whole.start()]);
            rewritten.push_str(&format!("{} = ${}", &sql[column.range()], params.len()));
            copied = whole.end();
        }
        rewritten.push_str(&sql[copied..]);
        (rewritten, replaced)
    }

    /// A literal compared to the tenant column in any form other than `=`.
    pub fn find_unsafe_predicate(&self, sql: &str) -> Option<String> {
        let masked = mask_literals(sql);
        self.reversed_literal
            .find(&masked)
            .or_else(|| self.other_literal_operator.find(&masked))
            .map(|m| sql[m.range()].to_string())
    }

    /// For a conjunct of the form `[qualifier.]<column> = $n`, the lower-cased
    /// qualifier (`None` when unqualified).
    pub fn filter_qualifier(&self, conjunct: &str) -> Option<Option<String>> {
        self.bound_filter
            .captures(conjunct)
            .map(|caps| caps.get(1).map(|m| m.as_str().to_lowercase()))
    }
}

/// Add `<column> = $n` to a single-table statement.
///
/// An existing WHERE condition is parenthesized so the filter cannot be
/// bypassed by a top-level OR.
pub fn inject_scope(sql: &str, column: &str, placeholder: usize) -> String {
    let masked = mask_literals(sql).to_ascii_lowercase();
    let filter = format!("{} = ${}", column, placeholder);
    let from_end = first_top_level_after(&masked, &FROM, 0)
        .map(|(_, end)| end)
        .unwrap_or(0);

    match first_top_level_after(&masked, &WHERE, from_end) {
        Some((where_start, where_end)) => {
            let cond_end = first_top_level_after(&masked, &AFTER_WHERE_CLAUSE, where_end)
                .map(|(start, _)| start)
                .unwrap_or(sql.len());
            let condition = sql[where_end..cond_end].trim();
            join_parts(&[
                sql[..where_start].trim_end(),
                &format!("WHERE ({}) AND {}", condition, filter),
                sql[cond_end..].trim_start(),
            ])
        }
        None => {
            let clause_start = first_top_level_after(&masked, &AFTER_WHERE_CLAUSE, from_end)
                .map(|(start, _)| start)
                .unwrap_or(sql.len());
            join_parts(&[
                sql[..clause_start].trim_end(),
                &format!("WHERE {}", filter),
                sql[clause_start..].trim_start(),
            ])
        }
    }
}

/// Insert `ORDER BY <column> DESC` ahead of any trailing row-limiting clause.
pub fn apply_default_order(sql: &str, column: &str) -> String {
    let masked = mask_literals(sql).to_ascii_lowercase();
    let insert_at = top_level_matches(&masked, &TRAILING_CLAUSE)
        .first()
        .map(|&(start, _)| start)
        .unwrap_or(sql.len());
    join_parts(&[
        sql[..insert_at].trim_end(),
        &format!("ORDER BY {} DESC", column),
        sql[insert_at..].trim_start(),
    ])
}

/// Ensure a row limit no larger than `max`. Returns the text and the
/// effective limit.
///
/// An existing top-level LIMIT or FETCH FIRST count is rewritten to a plain
/// number: `ALL` and expressions become `default`, anything above `max` is
/// clamped. Without one, `LIMIT default` goes before any locking clause.
pub fn apply_row_limit(sql: &str, default: u32, max: u32) -> (String, u32) {
    let masked = mask_literals(sql).to_ascii_lowercase();

    if let Some((_, start)) = first_top_level_after(&masked, &LIMIT, 0) {
        let end = first_top_level_after(&masked, &LIMIT_END, start)
            .map(|(s, _)| s)
            .unwrap_or(sql.len());
        return replace_row_count(sql, start, end, row_count(&sql[start..end], default, max, default));
    }
    if let Some((_, start)) = first_top_level_after(&masked, &FETCH_FIRST, 0) {
        let end = first_top_level_after(&masked, &FETCH_ROWS, start)
            .map(|(s, _)| s)
            .unwrap_or(sql.len());
        return replace_row_count(sql, start, end, row_count(&sql[start..end], default, max, 1));
    }

    let insert_at = first_top_level_after(&masked, &LOCKING_CLAUSE, 0)
        .map(|(s, _)| s)
        .unwrap_or(sql.len());
    let limited = join_parts(&[
        sql[..insert_at].trim_end(),
        &format!("LIMIT {}", default),
        sql[insert_at..].trim_start(),
    ]);
    (limited, default)
}

fn row_count(expr: &str, default: u32, max: u32, when_omitted: u32) -> u32 {
    let count = expr.trim().trim_start_matches('(').trim_end_matches(')').trim();
    if count.is_empty() {
        when_omitted.min(max)
    } else if count.bytes().all(|b| b.is_ascii_digit()) {
        count
            .parse::<u64>()
            .map(|n| n.min(u64::from(max)) as u32)
            .unwrap_or(max)
    } else {
        default
    }
}

fn replace_row_count(sql: &str, start: usize, end: usize, limit: u32) -> (String, u32) {
    let rewritten = join_parts(&[sql[..start].trim_end(), &limit.to_string(), sql[end..].trim_start()]);
    (rewritten, limit)
}

/// Number the placeholders `$1..$n` in order of appearance. Every parameter
/// the compiler binds is the caller's tenant id, so positions are
/// interchangeable.
pub fn renumber_placeholders(sql: &str) -> String {
    let masked = mask_literals(sql);
    let mut renumbered = String::with_capacity(sql.len());
    let mut copied = 0;
    for (i, m) in PLACEHOLDER.find_iter(&masked).enumerate() {
        renumbered.push_str(&sql[copied..m.start()]);
        renumbered.push_str(&format!("${}", i + 1));
        copied = m.end();
    }
    renumbered.push_str(&sql[copied..]);
    renumbered
}

fn join_parts(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
}
