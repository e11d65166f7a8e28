//! `db_poll` handler.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};

use testmesh_core::handler::{ActionHandler, CallEnvelope, ConfigView, Output};
use testmesh_core::{Error, Result};

use crate::sql::{PgPoolCache, row_to_json};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Polls a SQL query until a condition holds.
///
/// Config: `{ connection, query, params?, row_count? | column + equals,
/// timeout?, interval?, max_attempts? }`. With `row_count`, the condition
/// is the result having exactly that many rows; with `column` + `equals`,
/// the first row's column must equal the expected value. Cadence and cap
/// semantics match `wait_for`. Output:
/// `{ success, attempts, duration_ms, last_result }`.
pub struct DbPollHandler {
    pools: Arc<PgPoolCache>,
}

impl DbPollHandler {
    pub fn with_pools(pools: Arc<PgPoolCache>) -> Self {
        Self { pools }
    }
}

enum Condition {
    RowCount(u64),
    ColumnEquals { column: String, expected: Value },
}

#[async_trait]
impl ActionHandler for DbPollHandler {
    fn name(&self) -> &str {
        "db_poll"
    }

    async fn execute(&self, envelope: &CallEnvelope, config: &Value) -> Result<Output> {
        let view = ConfigView::new(config);
        let dsn = view.require_str("connection")?;
        let query = view.require_str("query")?;

        let condition = match (view.u64_opt("row_count")?, view.str_opt("column")?) {
            (Some(count), None) => Condition::RowCount(count),
            (None, Some(column)) => Condition::ColumnEquals {
                column: column.to_string(),
                expected: view.require_value("equals")?.clone(),
            },
            (Some(_), Some(_)) => {
                return Err(Error::InvalidConfig(
                    "db_poll takes `row_count` or `column`, not both".into(),
                ));
            }
            (None, None) => {
                return Err(Error::InvalidConfig(
                    "db_poll needs a condition: `row_count` or `column` + `equals`".into(),
                ));
            }
        };

        let timeout = parse_duration_opt(&view, "timeout")?.unwrap_or(DEFAULT_TIMEOUT);
        let interval = parse_duration_opt(&view, "interval")?.unwrap_or(DEFAULT_INTERVAL);
        let max_attempts = view.u64_opt("max_attempts")?.unwrap_or(u64::MAX).max(1);

        let pool = self.pools.get(dsn).await?;

        let started = Instant::now();
        let deadline = started + timeout;
        let mut attempts: u64 = 0;
        let mut success = false;
        let mut last_result = Value::Null;

        loop {
            attempts += 1;

            let fetch = sqlx::query(query).fetch_all(&pool);
            let rows = tokio::select! {
                _ = envelope.cancel.cancelled() => return Err(Error::Cancelled),
                rows = fetch => rows.map_err(|e| Error::Handler(format!("poll query failed: {e}")))?,
            };

            let (met, observed) = match &condition {
                Condition::RowCount(expected) => {
                    let count = rows.len() as u64;
                    (count == *expected, json!({ "row_count": count }))
                }
                Condition::ColumnEquals { column, expected } => {
                    let observed = rows
                        .first()
                        .map(row_to_json)
                        .and_then(|mut row| row.remove(column))
                        .unwrap_or(Value::Null);
                    (
                        loose_equals(&observed, expected),
                        json!({ "column": column, "value": observed }),
                    )
                }
            };

            last_result = observed;
            if met {
                success = true;
                break;
            }
            if attempts >= max_attempts || Instant::now() + interval > deadline {
                break;
            }
            tokio::select! {
                _ = envelope.cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }
        }

        let mut output = Output::new();
        output.insert("success".into(), json!(success));
        output.insert("attempts".into(), json!(attempts));
        output.insert(
            "duration_ms".into(),
            json!(started.elapsed().as_millis() as u64),
        );
        output.insert("last_result".into(), last_result);
        Ok(output)
    }
}

fn parse_duration_opt(view: &ConfigView<'_>, key: &str) -> Result<Option<Duration>> {
    match view.str_opt(key)? {
        None => Ok(None),
        Some(text) => humantime::parse_duration(text)
            .map(Some)
            .map_err(|e| Error::InvalidConfig(format!("invalid {key} `{text}`: {e}"))),
    }
}

/// Numeric-coercing equality, matching the assertion evaluator's `==`.
fn loose_equals(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}
