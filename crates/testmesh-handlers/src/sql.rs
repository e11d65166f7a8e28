//! `database_query` handler and shared Postgres pooling.

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Row, TypeInfo};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use testmesh_core::handler::{ActionHandler, CallEnvelope, ConfigView, Output};
use testmesh_core::{Error, Result};

/// DSN-keyed pool cache shared between `database_query` and `db_poll`.
pub struct PgPoolCache {
    pools: Mutex<HashMap<String, PgPool>>,
}

impl PgPoolCache {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self {
            pools: Mutex::new(HashMap::new()),
        })
    }

    /// Get or lazily create the pool for a DSN. Only Postgres DSNs are
    /// accepted; other schemes are a config error.
    pub async fn get(&self, dsn: &str) -> Result<PgPool> {
        if !dsn.starts_with("postgres://") && !dsn.starts_with("postgresql://") {
            return Err(Error::InvalidConfig(format!(
                "unsupported connection scheme in `{dsn}`; only postgres:// DSNs are supported"
            )));
        }

        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(dsn) {
            return Ok(pool.clone());
        }

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(dsn)
            .await
            .map_err(|e| Error::Handler(format!("failed to connect to database: {e}")))?;
        pools.insert(dsn.to_string(), pool.clone());
        Ok(pool)
    }
}

/// How a query is classified by its leading keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    Select,
    Insert,
    Update,
    Delete,
    Other,
}

impl QueryType {
    pub fn classify(query: &str) -> Self {
        match query
            .trim_start()
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_uppercase()
            .as_str()
        {
            "SELECT" | "WITH" => QueryType::Select,
            "INSERT" => QueryType::Insert,
            "UPDATE" => QueryType::Update,
            "DELETE" => QueryType::Delete,
            _ => QueryType::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::Select => "SELECT",
            QueryType::Insert => "INSERT",
            QueryType::Update => "UPDATE",
            QueryType::Delete => "DELETE",
            QueryType::Other => "OTHER",
        }
    }
}

/// Runs one SQL statement against a Postgres DSN.
///
/// Config: `{ connection, query, params? }`. SELECTs return
/// `{ rows, row_count, first_row?, query_type }`; writes return
/// `{ rows_affected, query_type }`.
pub struct DatabaseQueryHandler {
    pools: Arc<PgPoolCache>,
}

impl DatabaseQueryHandler {
    pub fn with_pools(pools: Arc<PgPoolCache>) -> Self {
        Self { pools }
    }
}

#[async_trait]
impl ActionHandler for DatabaseQueryHandler {
    fn name(&self) -> &str {
        "database_query"
    }

    async fn execute(&self, envelope: &CallEnvelope, config: &Value) -> Result<Output> {
        let view = ConfigView::new(config);
        let dsn = view.require_str("connection")?;
        let query = view.require_str("query")?;
        let params = view.array_opt("params")?.cloned().unwrap_or_default();

        let pool = self.pools.get(dsn).await?;
        let query_type = QueryType::classify(query);

        let run = run_query(&pool, query, &params, query_type);
        tokio::select! {
            _ = envelope.cancel.cancelled() => Err(Error::Cancelled),
            output = run => output,
        }
    }
}

async fn run_query(
    pool: &PgPool,
    query: &str,
    params: &[Value],
    query_type: QueryType,
) -> Result<Output> {
    let mut output = Output::new();
    output.insert("query_type".into(), json!(query_type.as_str()));

    match query_type {
        QueryType::Select => {
            let rows = bind_params(sqlx::query(query), params)?
                .fetch_all(pool)
                .await
                .map_err(|e| Error::Handler(format!("query failed: {e}")))?;

            let decoded: Vec<Value> = rows
                .iter()
                .map(|row| Value::Object(row_to_json(row)))
                .collect();

            output.insert("row_count".into(), json!(decoded.len()));
            if let Some(first) = decoded.first() {
                output.insert("first_row".into(), first.clone());
            }
            output.insert("rows".into(), Value::Array(decoded));
        }
        _ => {
            let result = bind_params(sqlx::query(query), params)?
                .execute(pool)
                .await
                .map_err(|e| Error::Handler(format!("query failed: {e}")))?;
            output.insert("rows_affected".into(), json!(result.rows_affected()));
        }
    }

    Ok(output)
}

type PgQuery<'a> = sqlx::query::Query<'a, sqlx::Postgres, sqlx::postgres::PgArguments>;

fn bind_params<'a>(mut query: PgQuery<'a>, params: &'a [Value]) -> Result<PgQuery<'a>> {
    for param in params {
        query = match param {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    query.bind(i)
                } else if let Some(f) = n.as_f64() {
                    query.bind(f)
                } else {
                    return Err(Error::InvalidConfig(format!("unbindable number {n}")));
                }
            }
            Value::String(s) => query.bind(s.as_str()),
            // Arrays and objects bind as JSONB.
            other => query.bind(other.clone()),
        };
    }
    Ok(query)
}

/// Decode a Postgres row into a JSON object by column type. Byte-array
/// columns become strings; unknown types fall back to their text form.
pub(crate) fn row_to_json(row: &PgRow) -> Map<String, Value> {
    let mut map = Map::new();
    for column in row.columns() {
        let index = column.ordinal();
        let value = match column.type_info().name() {
            "BOOL" => get(row, index, Value::Bool),
            "INT2" => get(row, index, |v: i16| json!(v)),
            "INT4" => get(row, index, |v: i32| json!(v)),
            "INT8" => get(row, index, |v: i64| json!(v)),
            "FLOAT4" => get(row, index, |v: f32| json!(v)),
            "FLOAT8" => get(row, index, |v: f64| json!(v)),
            "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" => {
                get(row, index, Value::String)
            }
            "UUID" => get(row, index, |v: uuid::Uuid| json!(v.to_string())),
            "JSON" | "JSONB" => get(row, index, |v: Value| v),
            "TIMESTAMPTZ" => get(row, index, |v: chrono::DateTime<chrono::Utc>| {
                json!(v.to_rfc3339())
            }),
            "TIMESTAMP" => get(row, index, |v: chrono::NaiveDateTime| json!(v.to_string())),
            "DATE" => get(row, index, |v: chrono::NaiveDate| json!(v.to_string())),
            "BYTEA" => get(row, index, |v: Vec<u8>| {
                Value::String(String::from_utf8_lossy(&v).into_owned())
            }),
            _ => row
                .try_get::<Option<String>, _>(index)
                .ok()
                .flatten()
                .map(Value::String)
                .unwrap_or(Value::Null),
        };
        map.insert(column.name().to_string(), value);
    }
    map
}

fn get<'r, T>(row: &'r PgRow, index: usize, wrap: impl Fn(T) -> Value) -> Value
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get::<Option<T>, _>(index)
        .ok()
        .flatten()
        .map(wrap)
        .unwrap_or(Value::Null)
}
