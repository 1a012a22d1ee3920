//! Storage tests against a live database. Skipped unless DATABASE_URL is set.

use finquery::execution::{PgStorage, StatementLimits, StorageEngine};
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

async fn storage() -> Option<PgStorage> {
    let url = match std::env::var("DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("DATABASE_URL not set; skipping");
            return None;
        }
    };
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&url)
        .await
        .expect("connect to DATABASE_URL");
    Some(PgStorage::new(pool))
}

fn limits() -> StatementLimits {
    StatementLimits {
        statement_timeout: Duration::from_secs(5),
        idle_transaction_timeout: Duration::from_secs(5),
    }
}

#[tokio::test]
async fn test_empty_result_keeps_column_names() {
    let Some(storage) = storage().await else {
        return;
    };
    let fetched = storage
        .fetch_read_only("SELECT 1 AS one, 'x'::text AS label WHERE false", &[], &limits())
        .await
        .unwrap();
    assert!(fetched.rows.is_empty());
    assert_eq!(fetched.columns, vec!["one".to_string(), "label".to_string()]);
}

#[tokio::test]
async fn test_bound_parameter_rows_are_normalized() {
    let Some(storage) = storage().await else {
        return;
    };
    let fetched = storage
        .fetch_read_only("SELECT $1::text AS tenant, 2.5::numeric AS amount", &["u1".to_string()], &limits())
        .await
        .unwrap();
    assert_eq!(fetched.columns, vec!["tenant".to_string(), "amount".to_string()]);
    assert_eq!(fetched.rows.len(), 1);
    assert_eq!(fetched.rows[0].get("tenant"), Some(&serde_json::json!("u1")));
    assert_eq!(fetched.rows[0].get("amount"), Some(&serde_json::json!(2.5)));
}
