//! Tenant coverage
//!
//! Every query block (each SELECT, including CTE bodies, derived tables,
//! subqueries and set-operation arms) is checked on its own: each
//! tenant-filtered or unknown table in its FROM list needs a top-level
//! `<column> = $n` conjunct in that block's WHERE. A filter sitting under a
//! top-level OR does not count.

use crate::compiler::lexer::{mask_literals, paren_depths};
use crate::compiler::rewrite::TenantPatterns;
use crate::schema::CatalogSnapshot;
use regex::Regex;
use std::collections::HashSet;

lazy_static::lazy_static! {
    static ref SELECT: Regex = Regex::new(r"\bselect\b").unwrap();
    static ref FROM: Regex = Regex::new(r"\bfrom\b").unwrap();
    static ref WHERE: Regex = Regex::new(r"\bwhere\b").unwrap();
    static ref OR: Regex = Regex::new(r"\bor\b").unwrap();
    static ref AND: Regex = Regex::new(r"\band\b").unwrap();
    static ref SET_OPERATION: Regex =
        Regex::new(r"\b(?:union|intersect|except)\b(?:\s+(?:all|distinct)\b)?").unwrap();
    static ref FROM_LIST_END: Regex =
        Regex::new(r"\b(?:where|group\s+by|having|order\s+by|limit|offset|fetch|window|for)\b").unwrap();
    static ref CONDITION_END: Regex =
        Regex::new(r"\b(?:group\s+by|having|order\s+by|limit|offset|fetch|window|for)\b").unwrap();
    static ref ITEM_SEPARATOR: Regex = Regex::new(
        r",|\b(?:natural\s+)?(?:(?:inner|cross|(?:left|right|full)(?:\s+outer)?)\s+)?join\b"
    ).unwrap();
    static ref JOIN_CONDITION: Regex = Regex::new(r"\b(?:on|using)\b").unwrap();
    static ref CTE_NAME: Regex = Regex::new(
        r#"(?:\bwith\s+(?:recursive\s+)?|\)\s*,\s*)"?([a-z_][a-z0-9_]*)"?\s*(?:\([^)]*\)\s*)?as\s*(?:not\s+)?(?:materialized\s+)?\("#
    ).unwrap();
    static ref TABLE_REF: Regex = Regex::new(
        r#"^"?([a-z_][a-z0-9_$]*)"?(?:\s*\.\s*"?([a-z_][a-z0-9_$]*)"?)?(?:\s+(?:as\s+)?"?([a-z_][a-z0-9_]*)"?(?:\s*\([^()]*\))?)?\s*$"#
    ).unwrap();
    static ref ITEM_PREFIX: Regex = Regex::new(r"^(?:lateral|only)\s+").unwrap();
}

/// Words that can open a FROM item without naming a table.
const NON_TABLE_WORDS: &[&str] = &["table", "values", "select", "with", "lateral", "only", "rows"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum FromItem {
    Table { name: String, alias: Option<String> },
    Derived,
}

impl FromItem {
    fn answers_to(&self, qualifier: &str) -> bool {
        match self {
            FromItem::Table { alias: Some(alias), .. } => alias == qualifier,
            FromItem::Table { name, alias: None } => name == qualifier,
            FromItem::Derived => false,
        }
    }
}

/// Result of the coverage check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantCoverage {
    /// Number of query blocks in the statement.
    pub blocks: usize,
    /// Tenant tables read by some block without a tenant filter.
    pub uncovered: Vec<String>,
}

impl TenantCoverage {
    /// Check every query block of `sql`.
    ///
    /// Fails with a description when a FROM item, CTE body or set-operation
    /// arm is something other than a table or a SELECT.
    pub fn analyze(sql: &str, patterns: &TenantPatterns, snapshot: &CatalogSnapshot) -> Result<Self, String> {
        let masked = mask_literals(sql).to_ascii_lowercase();
        let depths = paren_depths(&masked);

        for m in SET_OPERATION.find_iter(&masked) {
            if !opens_select(&masked[m.end()..]) {
                return Err(format!("'{}' is not followed by a SELECT", m.as_str().trim()));
            }
        }
        let mut cte_names = HashSet::new();
        for caps in CTE_NAME.captures_iter(&masked) {
            let (Some(name), Some(whole)) = (caps.get(1), caps.get(0)) else {
                continue;
            };
            if !opens_select(&masked[whole.end()..]) {
                return Err(format!("common table expression '{}' is not a SELECT", name.as_str()));
            }
            cte_names.insert(name.as_str().to_string());
        }

        let set_operations: Vec<usize> = SET_OPERATION.find_iter(&masked).map(|m| m.start()).collect();
        let mut coverage = TenantCoverage::default();
        for select in SELECT.find_iter(&masked) {
            coverage.blocks += 1;
            let block = Block::locate(&depths, &set_operations, select.end());
            let items = block.from_items(&masked, &depths)?;
            let filtered = block.filtered_qualifiers(&masked, &depths, patterns);

            for item in &items {
                let FromItem::Table { name, .. } = item else {
                    continue;
                };
                let tenant_table =
                    !cte_names.contains(name) && (snapshot.is_tenant_filtered(name) || !snapshot.table_exists(name));
                if !tenant_table {
                    continue;
                }
                let covered = filtered.iter().any(|qualifier| match qualifier {
                    Some(q) => item.answers_to(q),
                    None => items.len() == 1,
                });
                if !covered && !coverage.uncovered.contains(name) {
                    coverage.uncovered.push(name.clone());
                }
            }
        }
        Ok(coverage)
    }

    pub fn is_complete(&self) -> bool {
        self.uncovered.is_empty()
    }
}

/// One SELECT: from just after the keyword to the end of its parentheses or
/// the next set operation at the same depth.
struct Block {
    start: usize,
    end: usize,
    depth: u32,
}

impl Block {
    fn locate(depths: &[u32], set_operations: &[usize], start: usize) -> Self {
        let depth = depths.get(start.saturating_sub(1)).copied().unwrap_or(0);
        let closed = (start..depths.len())
            .find(|&i| depths[i] < depth)
            .unwrap_or(depths.len());
        let end = set_operations
            .iter()
            .copied()
            .filter(|&s| s > start && s < closed && depths[s] == depth)
            .min()
            .unwrap_or(closed);
        Self { start, end, depth }
    }

    /// Matches of `pattern` inside this block at its own depth.
    fn matches(&self, masked: &str, depths: &[u32], pattern: &Regex, from: usize, to: usize) -> Vec<(usize, usize)> {
        pattern
            .find_iter(masked)
            .filter(|m| m.start() >= from && m.end() <= to && depths[m.start()] == self.depth)
            .map(|m| (m.start(), m.end()))
            .collect()
    }

    fn first(&self, masked: &str, depths: &[u32], pattern: &Regex, from: usize) -> Option<(usize, usize)> {
        self.matches(masked, depths, pattern, from, self.end).into_iter().next()
    }

    fn from_items(&self, masked: &str, depths: &[u32]) -> Result<Vec<FromItem>, String> {
        let Some((_, list_start)) = self.first(masked, depths, &FROM, self.start) else {
            return Ok(Vec::new());
        };
        let list_end = self
            .first(masked, depths, &FROM_LIST_END, list_start)
            .map(|(start, _)| start)
            .unwrap_or(self.end);

        let mut items = Vec::new();
        let mut item_start = list_start;
        let separators = self.matches(masked, depths, &ITEM_SEPARATOR, list_start, list_end);
        for (sep_start, sep_end) in separators.into_iter().chain(std::iter::once((list_end, list_end))) {
            let item_end = self
                .matches(masked, depths, &JOIN_CONDITION, item_start, sep_start)
                .first()
                .map(|&(start, _)| start)
                .unwrap_or(sep_start);
            items.push(classify(masked[item_start..item_end].trim())?);
            item_start = sep_end;
        }
        Ok(items)
    }

    /// Qualifiers of tenant filters that hold for every row of the block.
    /// `None` marks an unqualified filter.
    fn filtered_qualifiers(&self, masked: &str, depths: &[u32], patterns: &TenantPatterns) -> Vec<Option<String>> {
        let Some((_, cond_start)) = self.first(masked, depths, &WHERE, self.start) else {
            return Vec::new();
        };
        let cond_end = self
            .first(masked, depths, &CONDITION_END, cond_start)
            .map(|(start, _)| start)
            .unwrap_or(self.end);
        if !self.matches(masked, depths, &OR, cond_start, cond_end).is_empty() {
            return Vec::new();
        }

        let mut qualifiers = Vec::new();
        let mut conjunct_start = cond_start;
        let ands = self.matches(masked, depths, &AND, cond_start, cond_end);
        for (and_start, and_end) in ands.into_iter().chain(std::iter::once((cond_end, cond_end))) {
            if let Some(qualifier) = patterns.filter_qualifier(masked[conjunct_start..and_start].trim()) {
                qualifiers.push(qualifier);
            }
            conjunct_start = and_end;
        }
        qualifiers
    }
}

fn opens_select(rest: &str) -> bool {
    let rest = rest.trim_start_matches(|c: char| c == '(' || c.is_whitespace());
    rest.starts_with("select") || rest.starts_with("with")
}

fn classify(item: &str) -> Result<FromItem, String> {
    let item = ITEM_PREFIX.replace(item, "");
    if item.starts_with('(') {
        return if opens_select(&item) {
            Ok(FromItem::Derived)
        } else {
            Err(format!("unsupported FROM item '{}'", item))
        };
    }
    let caps = TABLE_REF
        .captures(&item)
        .ok_or_else(|| format!("unsupported FROM item '{}'", item))?;
    let first = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
    if NON_TABLE_WORDS.contains(&first) {
        return Err(format!("unsupported FROM item '{}'", item));
    }
    let name = caps.get(2).map(|m| m.as_str()).unwrap_or(first);
    Ok(FromItem::Table {
        name: name.to_string(),
        alias: caps.get(3).map(|m| m.as_str().to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CatalogConfig;
    use crate::schema::fallback::minimal_schema;
    use crate::schema::SnapshotOrigin;

    fn coverage(sql: &str) -> Result<TenantCoverage, String> {
        let snapshot =
            CatalogSnapshot::build(minimal_schema("tenant_id"), &CatalogConfig::default(), "tenant_id", SnapshotOrigin::Live)
                .unwrap();
        TenantCoverage::analyze(sql, &TenantPatterns::new("tenant_id"), &snapshot)
    }

    #[test]
    fn test_single_filtered_table() {
        let c = coverage("SELECT name FROM accounts WHERE tenant_id = $1 AND balance > 0").unwrap();
        assert_eq!(c.blocks, 1);
        assert!(c.is_complete());
    }

    #[test]
    fn test_filter_under_or_does_not_count() {
        let c = coverage("SELECT name FROM transactions WHERE amount > 0 OR tenant_id = $1").unwrap();
        assert_eq!(c.uncovered, vec!["transactions".to_string()]);
    }

    #[test]
    fn test_parenthesized_or_with_separate_filter_counts() {
        let c = coverage("SELECT name FROM transactions WHERE (amount > 0 OR pending) AND tenant_id = $1").unwrap();
        assert!(c.is_complete());
    }

    #[test]
    fn test_join_needs_each_alias_filtered() {
        let c = coverage(
            "SELECT a.name FROM accounts a JOIN transactions t ON a.id = t.account_id WHERE a.tenant_id = $1",
        )
        .unwrap();
        assert_eq!(c.uncovered, vec!["transactions".to_string()]);

        let c = coverage(
            "SELECT a.name FROM accounts a JOIN transactions t ON a.id = t.account_id \
             WHERE a.tenant_id = $1 AND t.tenant_id = $2",
        )
        .unwrap();
        assert!(c.is_complete());
    }

    #[test]
    fn test_unqualified_filter_is_ambiguous_with_two_items() {
        let c = coverage("SELECT * FROM accounts, transactions WHERE tenant_id = $1").unwrap();
        assert_eq!(c.uncovered.len(), 2);
    }

    #[test]
    fn test_each_set_operation_arm_is_a_block() {
        let c = coverage("SELECT name FROM accounts WHERE tenant_id = $1 UNION SELECT name FROM transactions").unwrap();
        assert_eq!(c.blocks, 2);
        assert_eq!(c.uncovered, vec!["transactions".to_string()]);
    }

    #[test]
    fn test_cte_name_is_not_a_table() {
        let c = coverage(
            "WITH spend AS (SELECT amount FROM transactions WHERE tenant_id = $1) SELECT SUM(amount) FROM spend",
        )
        .unwrap();
        assert_eq!(c.blocks, 2);
        assert!(c.is_complete());
    }

    #[test]
    fn test_reference_tables_need_no_filter() {
        assert!(coverage("SELECT name FROM categories").unwrap().is_complete());
        assert!(coverage("SELECT 1").unwrap().is_complete());
    }

    #[test]
    fn test_unknown_table_needs_a_filter() {
        let c = coverage("SELECT * FROM budgets").unwrap();
        assert_eq!(c.uncovered, vec!["budgets".to_string()]);
    }

    #[test]
    fn test_non_table_items_are_refused() {
        for sql in [
            "SELECT * FROM (TABLE transactions) t",
            "SELECT * FROM generate_series(1, 3) g",
            "SELECT * FROM (VALUES (1), (2)) v(x)",
            "SELECT name FROM accounts WHERE tenant_id = $1 UNION TABLE transactions",
            "WITH x AS (TABLE transactions) SELECT * FROM x",
            "SELECT * FROM accounts a, LATERAL jsonb_each(a.meta) j",
        ] {
            assert!(coverage(sql).is_err(), "{}", sql);
        }
    }

    #[test]
    fn test_derived_table_is_checked_on_its_own() {
        let c = coverage("SELECT * FROM (SELECT * FROM transactions) s").unwrap();
        assert_eq!(c.uncovered, vec!["transactions".to_string()]);
        let c = coverage("SELECT * FROM (SELECT * FROM transactions WHERE tenant_id = $1) s").unwrap();
        assert!(c.is_complete());
    }
}
