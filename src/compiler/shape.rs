//! Structural shape of a statement
//!
//! A conservative, keyword-level approximation. It decides whether a tenant
//! filter may be injected automatically, so it errs towards "complex".

use crate::compiler::lexer::{first_top_level_after, mask_literals, paren_depths, top_level_matches};
use regex::Regex;

lazy_static::lazy_static! {
    static ref JOIN: Regex = Regex::new(r"\bjoin\b").unwrap();
    static ref SELECT: Regex = Regex::new(r"\bselect\b").unwrap();
    static ref SET_OPERATION: Regex = Regex::new(r"\b(union|intersect|except)\b").unwrap();
    static ref FROM: Regex = Regex::new(r"\bfrom\b").unwrap();
    static ref FROM_LIST_END: Regex = Regex::new(
        r"\b(where|group\s+by|order\s+by|having|limit|offset|fetch|window|for|join|inner|left|right|full|cross|natural|on|using|union|intersect|except)\b"
    ).unwrap();
    static ref AGGREGATE: Regex = Regex::new(
        r"\b(sum|count|avg|min|max|array_agg|string_agg|json_agg|bool_and|bool_or|every|stddev|variance)\s*\("
    ).unwrap();
    static ref GROUP_BY: Regex = Regex::new(r"\bgroup\s+by\b").unwrap();
    static ref ORDER_BY: Regex = Regex::new(r"\border\s+by\b").unwrap();
    static ref DISTINCT: Regex = Regex::new(r"^\s*select\s+distinct\b").unwrap();
    static ref IDENTIFIER: Regex =
        Regex::new(r#"^"?([A-Za-z_][A-Za-z0-9_$]*)"?(?:\s*\.\s*"?([A-Za-z_][A-Za-z0-9_$]*)"?)?"#).unwrap();
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatementShape {
    pub joins: usize,
    pub has_cte: bool,
    pub subqueries: usize,
    pub set_operations: usize,
    /// Table names of the top-level FROM list, schema prefix removed.
    pub from_tables: Vec<String>,
    /// Top-level FROM items that are not plain table names: derived
    /// tables, `TABLE`/`VALUES` forms and set-returning functions.
    pub opaque_items: usize,
    pub aggregated: bool,
    pub distinct: bool,
    pub has_order_by: bool,
    /// Lower-cased select list of the outer query.
    pub projection: String,
}

impl StatementShape {
    pub fn analyze(sql: &str) -> Self {
        let masked = mask_literals(sql).to_ascii_lowercase();
        let depths = paren_depths(&masked);

        let joins = JOIN.find_iter(&masked).count();
        let selects = SELECT.find_iter(&masked).count();
        let set_operations = SET_OPERATION.find_iter(&masked).count();
        let has_cte = masked.trim_start().starts_with("with");

        let mut from_tables = Vec::new();
        let mut opaque_items = 0;
        let mut projection = String::new();
        if let Some((from_start, from_end)) = first_top_level_after(&masked, &FROM, 0) {
            if let Some(select) = SELECT.find(&masked) {
                if select.end() <= from_start {
                    projection = masked[select.end()..from_start].trim().to_string();
                }
            }
            let list_end = first_top_level_after(&masked, &FROM_LIST_END, from_end)
                .map(|(start, _)| start)
                .unwrap_or(masked.len());
            let list = &sql[from_end..list_end];
            let mut item_start = 0;
            for (offset, b) in masked[from_end..list_end].bytes().enumerate() {
                if b == b',' && depths[from_end + offset] == 0 {
                    if !push_table(&list[item_start..offset], &mut from_tables) {
                        opaque_items += 1;
                    }
                    item_start = offset + 1;
                }
            }
            if !push_table(&list[item_start..], &mut from_tables) {
                opaque_items += 1;
            }
        }

        Self {
            joins,
            has_cte,
            subqueries: selects.saturating_sub(1),
            set_operations,
            from_tables,
            opaque_items,
            aggregated: AGGREGATE.is_match(&masked)
                || !top_level_matches(&masked, &GROUP_BY).is_empty(),
            distinct: DISTINCT.is_match(&masked),
            has_order_by: !top_level_matches(&masked, &ORDER_BY).is_empty(),
            projection,
        }
    }

    /// Whether the statement may reference more than one table.
    pub fn is_complex(&self, max_simple_tables: usize) -> bool {
        self.joins > 0
            || self.has_cte
            || self.subqueries > 0
            || self.set_operations > 0
            || self.opaque_items > 0
            || self.from_tables.len() > max_simple_tables
    }

    /// The single table of a simple statement.
    pub fn primary_table(&self) -> Option<&str> {
        match self.from_tables.as_slice() {
            [only] => Some(only.as_str()),
            _ => None,
        }
    }

    /// Plain row projection of one table: safe to order by a table column.
    pub fn is_plain_projection(&self) -> bool {
        !self.aggregated && !self.distinct && !self.has_order_by && self.primary_table().is_some()
    }

    pub fn projects_column(&self, column: &str) -> bool {
        let column = column.to_lowercase();
        self.projection == "*"
            || self
                .projection
                .split(',')
                .map(|item| item.trim())
                .any(|item| {
                    item == column
                        || item.ends_with(&format!(".{}", column))
                        || item.ends_with(".*")
                })
    }
}

/// Record a FROM item that names a table. Returns false for anything else.
fn push_table(item: &str, tables: &mut Vec<String>) -> bool {
    let item = item.trim();
    if item.starts_with('(') {
        return false;
    }
    let Some(caps) = IDENTIFIER.captures(item) else {
        return false;
    };
    let rest = item[caps.get(0).map(|m| m.end()).unwrap_or(0)..].trim_start();
    let first = caps.get(1).map(|m| m.as_str().to_lowercase()).unwrap_or_default();
    if rest.starts_with('(') || matches!(first.as_str(), "table" | "values" | "lateral" | "only" | "rows") {
        return false;
    }
    let name = caps.get(2).map(|m| m.as_str().to_lowercase()).unwrap_or(first);
    tables.push(name);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_select() {
        let shape = StatementShape::analyze("SELECT name, balance FROM public.accounts a WHERE x = 1");
        assert_eq!(shape.from_tables, vec!["accounts".to_string()]);
        assert!(!shape.is_complex(1));
        assert_eq!(shape.primary_table(), Some("accounts"));
        assert!(shape.projects_column("balance"));
    }

    #[test]
    fn test_join_is_complex() {
        let shape = StatementShape::analyze(
            "SELECT a.name, SUM(t.amount) FROM accounts a JOIN transactions t ON a.id=t.account_id GROUP BY a.name",
        );
        assert_eq!(shape.joins, 1);
        assert!(shape.aggregated);
        assert!(shape.is_complex(1));
        assert_eq!(shape.from_tables, vec!["accounts".to_string()]);
    }

    #[test]
    fn test_comma_join_and_subquery_are_complex() {
        assert!(StatementShape::analyze("SELECT * FROM accounts, transactions").is_complex(1));
        assert!(StatementShape::analyze(
            "SELECT * FROM transactions WHERE account_id IN (SELECT id FROM accounts)"
        )
        .is_complex(1));
        assert!(StatementShape::analyze("WITH x AS (SELECT 1) SELECT * FROM x").is_complex(1));
    }

    #[test]
    fn test_function_from_is_not_a_table_list() {
        let shape = StatementShape::analyze(
            "SELECT EXTRACT(YEAR FROM date) AS y, amount FROM transactions ORDER BY date",
        );
        assert_eq!(shape.from_tables, vec!["transactions".to_string()]);
        assert!(shape.has_order_by);
        assert!(!shape.is_plain_projection());
    }

    #[test]
    fn test_non_table_from_items_are_complex() {
        for sql in [
            "SELECT * FROM (TABLE transactions) t",
            "SELECT * FROM (SELECT * FROM transactions) s",
            "SELECT * FROM generate_series(1, 10) g",
            "SELECT * FROM TABLE transactions",
        ] {
            let shape = StatementShape::analyze(sql);
            assert!(shape.opaque_items > 0, "{}", sql);
            assert!(shape.is_complex(1), "{}", sql);
            assert_eq!(shape.primary_table(), None, "{}", sql);
        }
    }

    #[test]
    fn test_keywords_inside_literals_ignored() {
        let shape = StatementShape::analyze("SELECT * FROM transactions WHERE name = 'join the club'");
        assert_eq!(shape.joins, 0);
        assert!(shape.is_plain_projection());
        assert!(shape.projects_column("date"));
    }
}
