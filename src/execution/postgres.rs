//! PostgreSQL storage engine (sqlx)

use crate::execution::error_classifier::{FaultClass, FaultClassifier, StorageError};
use crate::execution::executor::{FetchedRows, StatementLimits, StorageEngine};
use crate::execution::result::{float_value, Row};
use async_trait::async_trait;
use bigdecimal::{BigDecimal, ToPrimitive};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgConnection, PgPool, PgRow};
use sqlx::{Column, Connection, Executor as _, Row as _, Statement as _, TypeInfo};
use tracing::{debug, warn};

pub struct PgStorage {
    pool: PgPool,
    classifier: FaultClassifier,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            classifier: FaultClassifier::new(),
        }
    }
}

#[async_trait]
impl StorageEngine for PgStorage {
    async fn fetch_read_only(
        &self,
        sql: &str,
        params: &[String],
        limits: &StatementLimits,
    ) -> Result<FetchedRows, StorageError> {
        let mut conn = self.pool.acquire().await?;

        match run_in_read_only_transaction(&mut conn, sql, params, limits).await {
            Ok(fetched) => Ok(fetched),
            Err(err) => {
                if self.classifier.classify(&err) == FaultClass::Transient {
                    // Never hand a possibly broken connection back to the pool.
                    let raw = conn.detach();
                    if let Err(e) = raw.close().await {
                        debug!("Closing broken connection failed: {}", e);
                    }
                }
                Err(err)
            }
        }
    }
}

async fn run_in_read_only_transaction(
    conn: &mut PgConnection,
    sql: &str,
    params: &[String],
    limits: &StatementLimits,
) -> Result<FetchedRows, StorageError> {
    let mut tx = conn.begin().await?;

    sqlx::query("SET TRANSACTION READ ONLY").execute(&mut *tx).await?;
    sqlx::query(&format!(
        "SET LOCAL statement_timeout = {}",
        limits.statement_timeout.as_millis()
    ))
    .execute(&mut *tx)
    .await?;
    sqlx::query(&format!(
        "SET LOCAL idle_in_transaction_session_timeout = {}",
        limits.idle_transaction_timeout.as_millis()
    ))
    .execute(&mut *tx)
    .await?;

    let mut query = sqlx::query(sql);
    for param in params {
        query = query.bind(param.as_str());
    }
    let pg_rows = query.fetch_all(&mut *tx).await?;

    // An empty result still has a shape; take it from the prepared statement.
    let columns: Vec<String> = match pg_rows.first() {
        Some(row) => row.columns().iter().map(|c| c.name().to_string()).collect(),
        None => (&mut *tx)
            .prepare(sql)
            .await?
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect(),
    };

    // Read-only work is never committed.
    tx.rollback().await?;

    let rows = pg_rows.iter().map(normalize_row).collect();
    Ok(FetchedRows { columns, rows })
}

fn normalize_row(row: &PgRow) -> Row {
    let mut out = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = normalize_value(row, idx, column.type_info().name());
        out.insert(column.name().to_string(), value);
    }
    out
}

/// Convert one column to a JSON value: numerics become floats, temporal
/// types ISO-8601 strings, NULL stays null.
fn normalize_value(row: &PgRow, idx: usize, type_name: &str) -> Value {
    let decoded = match type_name {
        "BOOL" => row.try_get::<Option<bool>, _>(idx).map(|v| v.map(Value::Bool)),
        "INT2" => row.try_get::<Option<i16>, _>(idx).map(|v| v.map(Value::from)),
        "INT4" => row.try_get::<Option<i32>, _>(idx).map(|v| v.map(Value::from)),
        "INT8" => row.try_get::<Option<i64>, _>(idx).map(|v| v.map(Value::from)),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(idx)
            .map(|v| v.map(|f| float_value(f as f64))),
        "FLOAT8" => row.try_get::<Option<f64>, _>(idx).map(|v| v.map(float_value)),
        "NUMERIC" => row.try_get::<Option<BigDecimal>, _>(idx).map(|v| {
            v.map(|d| d.to_f64().map(float_value).unwrap_or_else(|| Value::String(d.to_string())))
        }),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(idx)
            .map(|v| v.map(|d| Value::String(d.format("%Y-%m-%d").to_string()))),
        "TIME" => row
            .try_get::<Option<NaiveTime>, _>(idx)
            .map(|v| v.map(|t| Value::String(t.format("%H:%M:%S%.f").to_string()))),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(idx)
            .map(|v| v.map(|t| Value::String(t.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(idx)
            .map(|v| v.map(|t| Value::String(t.to_rfc3339()))),
        "UUID" => row
            .try_get::<Option<uuid::Uuid>, _>(idx)
            .map(|v| v.map(|u| Value::String(u.to_string()))),
        "JSON" | "JSONB" => row
            .try_get::<Option<Value>, _>(idx)
            .map(|v| v.map(|j| Value::String(j.to_string()))),
        _ => row.try_get::<Option<String>, _>(idx).map(|v| v.map(Value::String)),
    };

    match decoded {
        Ok(value) => value.unwrap_or(Value::Null),
        Err(e) => {
            warn!("Could not decode column {} of type {}: {}", idx, type_name, e);
            Value::Null
        }
    }
}
