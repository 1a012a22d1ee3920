//! Safety compiler tests against the built-in schema.

mod common;

use finquery::compiler::verify_placeholders;
use finquery::config::CompilerConfig;
use finquery::{Attempt, CompileFault, DraftQuery, SafetyCompiler, TenantScope};

fn compiler() -> SafetyCompiler {
    SafetyCompiler::new(common::catalog(), CompilerConfig::default())
}

fn compile(text: &str, tenant: &str) -> Result<finquery::CompiledQuery, CompileFault> {
    compiler().compile(&DraftQuery::new(text, "question", tenant, Attempt::first()))
}

#[test]
fn test_trailing_drop_is_rejected_as_multiple_statements() {
    let err = compile("SELECT * FROM accounts; DROP TABLE accounts;", "u1").unwrap_err();
    assert!(matches!(err, CompileFault::MultipleStatements(_)), "got {:?}", err);
}

#[test]
fn test_unscoped_join_is_rejected() {
    let err = compile(
        "SELECT a.name, SUM(t.amount) FROM accounts a JOIN transactions t ON a.id=t.account_id GROUP BY a.name",
        "u1",
    )
    .unwrap_err();
    assert!(matches!(err, CompileFault::MissingTenantScope(_)), "got {:?}", err);
}

#[test]
fn test_tenant_literal_becomes_single_parameter() {
    let compiled = compile("SELECT name, balance FROM accounts WHERE tenant_id = 'u1'", "u1").unwrap();
    assert_eq!(compiled.placeholder_count(), 1);
    assert_eq!(compiled.params, vec!["u1".to_string()]);
    assert!(compiled.sql.contains("tenant_id = $1"));
    assert!(!compiled.sql.contains("'u1'"));
    assert_eq!(compiled.scope, TenantScope::Bound);
}

#[test]
fn test_simple_unfiltered_select_gets_scope_injected() {
    let compiled = compile("SELECT name, current_balance FROM accounts", "u2").unwrap();
    assert_eq!(compiled.params, vec!["u2".to_string()]);
    assert!(compiled.sql.contains("WHERE tenant_id = $1"), "sql: {}", compiled.sql);
    assert_eq!(compiled.row_limit, 100);
}

#[test]
fn test_injected_scope_preserves_existing_filter() {
    let compiled = compile(
        "SELECT name, amount FROM transactions WHERE amount < 0 OR pending = true",
        "u1",
    )
    .unwrap();
    assert!(
        compiled.sql.contains("WHERE (amount < 0 OR pending = true) AND tenant_id = $1"),
        "sql: {}",
        compiled.sql
    );
}

#[test]
fn test_placeholders_always_match_parameters() {
    let drafts = [
        "SELECT name FROM accounts",
        "SELECT SUM(-amount) AS total FROM transactions WHERE amount < 0",
        "SELECT t.name FROM transactions t WHERE t.tenant_id = 'u1' AND t.amount > 10",
        "SELECT name FROM categories",
        "SELECT 1",
        "SELECT a.name, t.amount FROM accounts a JOIN transactions t ON a.id = t.account_id \
         WHERE a.tenant_id = 'u1' AND t.tenant_id = 'u1'",
    ];
    for draft in drafts {
        let compiled = compile(draft, "u1").unwrap_or_else(|e| panic!("{}: {:?}", draft, e));
        assert_eq!(compiled.placeholder_count(), compiled.params.len(), "{}", compiled.sql);
        assert!(verify_placeholders(&compiled.sql, compiled.params.len()).is_ok());
        assert!(compiled.params.iter().all(|p| p == "u1"));
    }
}

#[test]
fn test_comma_join_and_cte_without_scope_are_rejected() {
    for draft in [
        "SELECT * FROM accounts, transactions",
        "WITH spend AS (SELECT amount FROM transactions) SELECT SUM(amount) FROM spend",
        "SELECT name FROM transactions WHERE account_id IN (SELECT id FROM accounts)",
    ] {
        let err = compile(draft, "u1").unwrap_err();
        assert!(matches!(err, CompileFault::MissingTenantScope(_)), "{}: {:?}", draft, err);
    }
}

#[test]
fn test_other_tenant_literal_is_rebound_to_caller() {
    let compiled = compile("SELECT name FROM accounts WHERE tenant_id = 'someone_else'", "u1").unwrap();
    assert_eq!(compiled.params, vec!["u1".to_string()]);
    assert!(!compiled.sql.contains("someone_else"));
}

#[test]
fn test_tenant_inequality_is_unsafe() {
    let err = compile("SELECT name FROM accounts WHERE tenant_id <> 'u1'", "u1").unwrap_err();
    assert!(matches!(err, CompileFault::UnsafeTenantPredicate(_)), "got {:?}", err);
}

#[test]
fn test_prose_and_fences_are_stripped() {
    let compiled = compile(
        "Sure! Here you go:\n```sql\nSELECT name FROM accounts WHERE tenant_id = 'u1';\n```\nLet me know.",
        "u1",
    )
    .unwrap();
    assert!(compiled.sql.starts_with("SELECT name FROM accounts"));
    assert!(!compiled.sql.contains(';'));
}

#[test]
fn test_write_statements_are_refused() {
    for draft in [
        "DELETE FROM transactions WHERE tenant_id = 'u1'",
        "UPDATE accounts SET name = 'x'",
        "INSERT INTO accounts (name) VALUES ('x')",
    ] {
        let err = compile(draft, "u1").unwrap_err();
        assert!(matches!(err, CompileFault::UnsupportedVerb(_)), "{}: {:?}", draft, err);
    }
}

#[test]
fn test_oversized_limit_is_clamped() {
    let compiled = compile("SELECT name FROM accounts LIMIT 50000", "u1").unwrap();
    assert_eq!(compiled.row_limit, 1000);
    assert!(compiled.sql.ends_with("LIMIT 1000"), "sql: {}", compiled.sql);
}

#[test]
fn test_empty_draft_is_rejected() {
    assert_eq!(compile("```sql\n```", "u1").unwrap_err(), CompileFault::EmptyDraft);
}

#[test]
fn test_non_table_from_items_are_rejected() {
    for draft in [
        "SELECT * FROM (TABLE transactions) t",
        "SELECT * FROM generate_series(1, 3) g",
        "SELECT * FROM (VALUES ('u2')) v(tenant)",
        "WITH x AS (TABLE transactions) SELECT * FROM x",
    ] {
        let err = compile(draft, "u1").unwrap_err();
        assert!(matches!(err, CompileFault::MissingTenantScope(_)), "{}: {:?}", draft, err);
    }
}

#[test]
fn test_tenant_filter_under_top_level_or_is_not_trusted() {
    let compiled = compile("SELECT name FROM transactions WHERE amount > 0 OR tenant_id = 'u1'", "u1").unwrap();
    assert!(
        compiled
            .sql
            .contains("WHERE (amount > 0 OR tenant_id = $1) AND tenant_id = $2"),
        "sql: {}",
        compiled.sql
    );
    assert_eq!(compiled.params, vec!["u1".to_string(), "u1".to_string()]);
    assert_eq!(compiled.scope, TenantScope::Bound);
}

#[test]
fn test_or_inside_a_join_is_rejected() {
    let err = compile(
        "SELECT a.name FROM accounts a JOIN transactions t ON a.id = t.account_id \
         WHERE a.tenant_id = 'u1' AND t.tenant_id = 'u1' OR t.amount > 0",
        "u1",
    )
    .unwrap_err();
    assert!(matches!(err, CompileFault::MissingTenantScope(_)), "got {:?}", err);
}

#[test]
fn test_every_set_operation_arm_needs_its_own_filter() {
    for draft in [
        "SELECT name FROM accounts WHERE tenant_id = 'u1' UNION SELECT name FROM transactions",
        "SELECT name FROM accounts WHERE tenant_id = 'u1' UNION ALL SELECT name FROM accounts",
        "SELECT name FROM accounts WHERE tenant_id = 'u1' EXCEPT TABLE accounts",
    ] {
        let err = compile(draft, "u1").unwrap_err();
        assert!(matches!(err, CompileFault::MissingTenantScope(_)), "{}: {:?}", draft, err);
    }

    let compiled = compile(
        "SELECT name FROM accounts WHERE tenant_id = 'u1' UNION SELECT name FROM transactions WHERE tenant_id = 'u1'",
        "u1",
    )
    .unwrap();
    assert_eq!(compiled.params.len(), 2);
    assert_eq!(compiled.scope, TenantScope::Bound);
}

#[test]
fn test_join_with_one_table_filtered_is_rejected() {
    let err = compile(
        "SELECT a.name, t.amount FROM accounts a JOIN transactions t ON a.id = t.account_id WHERE a.tenant_id = 'u1'",
        "u1",
    )
    .unwrap_err();
    assert!(matches!(err, CompileFault::MissingTenantScope(ref m) if m.contains("transactions")), "got {:?}", err);
}

#[test]
fn test_unfiltered_scalar_subquery_is_rejected() {
    let err = compile(
        "SELECT name, (SELECT COUNT(*) FROM transactions) AS n FROM accounts WHERE tenant_id = 'u1'",
        "u1",
    )
    .unwrap_err();
    assert!(matches!(err, CompileFault::MissingTenantScope(_)), "got {:?}", err);
}

#[test]
fn test_filtered_cte_and_derived_table_compile() {
    for draft in [
        "WITH spend AS (SELECT amount FROM transactions WHERE tenant_id = 'u1') SELECT SUM(amount) FROM spend",
        "SELECT s.total FROM (SELECT SUM(amount) AS total FROM transactions WHERE tenant_id = 'u1') s",
    ] {
        let compiled = compile(draft, "u1").unwrap_or_else(|e| panic!("{}: {:?}", draft, e));
        assert_eq!(compiled.params, vec!["u1".to_string()], "{}", draft);
        assert_eq!(compiled.scope, TenantScope::Bound);
    }
}

#[test]
fn test_tenant_text_inside_a_literal_is_plain_data() {
    let compiled = compile("SELECT name FROM transactions WHERE name = 'tenant_id = ''x'''", "u1").unwrap();
    assert!(compiled.sql.contains("'tenant_id = ''x'''"), "sql: {}", compiled.sql);
    assert!(compiled.sql.contains("AND tenant_id = $1"), "sql: {}", compiled.sql);
    assert_eq!(compiled.params, vec!["u1".to_string()]);

    let compiled = compile("SELECT name FROM transactions WHERE name = 'tenant_id like me'", "u1").unwrap();
    assert_eq!(compiled.scope, TenantScope::Bound);
    assert!(compiled.sql.contains("'tenant_id like me'"));
}

#[test]
fn test_limit_variants_are_not_duplicated() {
    let compiled = compile("SELECT name FROM accounts LIMIT (5)", "u1").unwrap();
    assert_eq!(compiled.row_limit, 5);
    assert_eq!(compiled.sql.matches("LIMIT").count(), 1, "sql: {}", compiled.sql);

    let compiled = compile("SELECT name FROM accounts FETCH FIRST ROW ONLY", "u1").unwrap();
    assert_eq!(compiled.row_limit, 1);
    assert!(!compiled.sql.contains("LIMIT"), "sql: {}", compiled.sql);

    let compiled = compile("SELECT name FROM accounts LIMIT 99999999999", "u1").unwrap();
    assert_eq!(compiled.row_limit, 1000);
}
