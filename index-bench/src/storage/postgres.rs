//! PostgreSQL storage over a single `sqlx` connection.

use super::{Row, SchemaSnapshot, Storage};
use crate::config::SessionConfig;
use crate::error::StorageError;
use async_trait::async_trait;
use bench_core::types::SqlValue;
use log::{debug, info};
use sqlx::postgres::{PgArguments, PgConnection, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Connection, Executor, Postgres, Row as _, TypeInfo};
use std::future::Future;
use std::time::Duration;

pub struct PgStorage {
    conn: PgConnection,
    call_timeout: Duration,
    ddl_timeout: Option<Duration>,
    statement_timeout_ms: u64,
}

/// Run `fut`, failing with [`StorageError::Timeout`] once `limit` elapses.
async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, StorageError>
where
    F: Future<Output = Result<T, StorageError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::Timeout(limit)),
    }
}

/// [`bounded`] when a limit is set, otherwise wait for `fut` to finish.
async fn bounded_or_unlimited<T, F>(limit: Option<Duration>, fut: F) -> Result<T, StorageError>
where
    F: Future<Output = Result<T, StorageError>>,
{
    match limit {
        Some(limit) => bounded(limit, fut).await,
        None => fut.await,
    }
}

/// First statement of every load and DDL transaction.
const LIFT_STATEMENT_TIMEOUT: &str = "SET LOCAL statement_timeout = 0";

fn session_sql(session: &SessionConfig) -> String {
    let mut sql = format!(
        "SET TIME ZONE '{}'; SET statement_timeout = {};",
        session.timezone.replace('\'', "''"),
        session.statement_timeout_ms
    );
    match session.jit {
        Some(true) => sql.push_str(" SET jit = on;"),
        Some(false) => sql.push_str(" SET jit = off;"),
        None => {}
    }
    sql
}

impl PgStorage {
    pub async fn connect(url: &str, session: &SessionConfig) -> Result<Self, StorageError> {
        let call_timeout = session.call_timeout();
        let conn = bounded(call_timeout, async {
            Ok(PgConnection::connect(url).await?)
        })
        .await?;
        Ok(Self {
            conn,
            call_timeout,
            ddl_timeout: session.ddl_timeout(),
            statement_timeout_ms: session.statement_timeout_ms,
        })
    }

    /// Apply time zone, `statement_timeout` and `jit` to the session.
    pub async fn configure_session(&mut self, session: &SessionConfig) -> Result<(), StorageError> {
        let sql = session_sql(session);
        debug!("Session setup: {sql}");
        self.execute_script(&sql).await?;
        self.statement_timeout_ms = session.statement_timeout_ms;
        Ok(())
    }

    pub async fn close(self) -> Result<(), StorageError> {
        bounded(self.call_timeout, async move { Ok(self.conn.close().await?) }).await
    }
}

fn bind_all<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [SqlValue],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Bool(b) => query.bind(*b),
            SqlValue::Int(i) => query.bind(*i),
            SqlValue::Float(x) => query.bind(*x),
            SqlValue::Text(s) => query.bind(s.as_str()),
        };
    }
    query
}

/// Decode the column types the battery can return; anything else is `Null`.
fn decode_row(row: &PgRow) -> Row {
    row.columns()
        .iter()
        .map(|column| {
            let i = column.ordinal();
            let value = match column.type_info().name() {
                "INT2" => row
                    .try_get::<Option<i16>, _>(i)
                    .ok()
                    .flatten()
                    .map(|v| SqlValue::Int(v.into())),
                "INT4" => row
                    .try_get::<Option<i32>, _>(i)
                    .ok()
                    .flatten()
                    .map(|v| SqlValue::Int(v.into())),
                "INT8" => row.try_get::<Option<i64>, _>(i).ok().flatten().map(SqlValue::Int),
                "FLOAT4" => row
                    .try_get::<Option<f32>, _>(i)
                    .ok()
                    .flatten()
                    .map(|v| SqlValue::Float(v.into())),
                "FLOAT8" => row
                    .try_get::<Option<f64>, _>(i)
                    .ok()
                    .flatten()
                    .map(SqlValue::Float),
                "BOOL" => row.try_get::<Option<bool>, _>(i).ok().flatten().map(SqlValue::Bool),
                "TEXT" | "VARCHAR" | "NAME" | "BPCHAR" => row
                    .try_get::<Option<String>, _>(i)
                    .ok()
                    .flatten()
                    .map(SqlValue::Text),
                "UUID" => row
                    .try_get::<Option<sqlx::types::Uuid>, _>(i)
                    .ok()
                    .flatten()
                    .map(|v| SqlValue::Text(v.to_string())),
                "TIMESTAMPTZ" => row
                    .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(i)
                    .ok()
                    .flatten()
                    .map(|v| SqlValue::Text(v.to_rfc3339())),
                _ => None,
            };
            (column.name().to_string(), value.unwrap_or(SqlValue::Null))
        })
        .collect()
}

#[async_trait]
impl Storage for PgStorage {
    async fn execute_script(&mut self, sql: &str) -> Result<(), StorageError> {
        let conn = &mut self.conn;
        bounded(self.call_timeout, async move {
            conn.execute(sqlx::raw_sql(sql)).await?;
            Ok(())
        })
        .await
    }

    async fn execute_transaction(&mut self, sql: &str) -> Result<(), StorageError> {
        let conn = &mut self.conn;
        bounded_or_unlimited(self.ddl_timeout, async move {
            // Dropping `tx` before commit rolls it back.
            let mut tx = conn.begin().await?;
            (&mut *tx).execute(sqlx::raw_sql(LIFT_STATEMENT_TIMEOUT)).await?;
            (&mut *tx).execute(sqlx::raw_sql(sql)).await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn bulk_load(
        &mut self,
        reset_sql: &str,
        copy_sql: &str,
        chunks: &mut (dyn Iterator<Item = Vec<u8>> + Send),
        expected_rows: u64,
    ) -> Result<u64, StorageError> {
        let conn = &mut self.conn;
        bounded_or_unlimited(self.ddl_timeout, async move {
            let mut tx = conn.begin().await?;
            (&mut *tx).execute(sqlx::raw_sql(LIFT_STATEMENT_TIMEOUT)).await?;
            (&mut *tx).execute(sqlx::raw_sql(reset_sql)).await?;

            let mut copy = tx.copy_in_raw(copy_sql).await?;
            let mut sent = 0usize;
            for chunk in chunks {
                sent += chunk.len();
                let sent_chunk = copy.send(chunk).await.map(|_| ());
                if let Err(err) = sent_chunk {
                    copy.abort("bulk transfer failed").await.ok();
                    return Err(err.into());
                }
            }
            let copied = copy.finish().await?;
            debug!("COPY sent {sent} bytes, server reported {copied} rows");

            if copied != expected_rows {
                tx.rollback().await?;
                return Err(StorageError::RowCountMismatch {
                    expected: expected_rows,
                    actual: copied,
                });
            }
            tx.commit().await?;
            Ok(copied)
        })
        .await
    }

    async fn refresh_statistics(&mut self, table: &str) -> Result<(), StorageError> {
        self.execute_transaction(&format!("ANALYZE {table}")).await
    }

    async fn vacuum_analyze(&mut self, table: &str) -> Result<(), StorageError> {
        // VACUUM refuses to run in a transaction block, so SET LOCAL is out.
        let vacuum = format!("VACUUM (ANALYZE) {table}");
        let restore = format!("SET statement_timeout = {}", self.statement_timeout_ms);
        let conn = &mut self.conn;
        bounded_or_unlimited(self.ddl_timeout, async move {
            (&mut *conn).execute(sqlx::raw_sql("SET statement_timeout = 0")).await?;
            let vacuumed = (&mut *conn).execute(sqlx::raw_sql(&vacuum)).await;
            (&mut *conn).execute(sqlx::raw_sql(&restore)).await?;
            vacuumed?;
            Ok(())
        })
        .await
    }

    async fn explain_analyze(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<serde_json::Value, StorageError> {
        let statement = format!("EXPLAIN (ANALYZE, BUFFERS, FORMAT JSON) {sql}");
        let conn = &mut self.conn;
        bounded(self.call_timeout, async move {
            let row = bind_all(sqlx::query(&statement), params)
                .fetch_one(conn)
                .await?;
            Ok(row.try_get::<serde_json::Value, _>(0)?)
        })
        .await
    }

    async fn fetch_rows(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<Row>, StorageError> {
        let conn = &mut self.conn;
        bounded(self.call_timeout, async move {
            let rows = bind_all(sqlx::query(sql), params).fetch_all(conn).await?;
            Ok(rows.iter().map(decode_row).collect())
        })
        .await
    }

    async fn schema_snapshot(&mut self, table: &str) -> Result<SchemaSnapshot, StorageError> {
        let conn = &mut self.conn;
        bounded(self.call_timeout, async move {
            let indexes: Vec<(String, String)> = sqlx::query_as(
                "SELECT indexname::text, indexdef::text FROM pg_indexes \
                 WHERE schemaname = current_schema() AND tablename = $1",
            )
            .bind(table)
            .fetch_all(&mut *conn)
            .await?;
            let columns: Vec<String> = sqlx::query_scalar(
                "SELECT column_name::text FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND table_name = $1",
            )
            .bind(table)
            .fetch_all(&mut *conn)
            .await?;
            Ok(SchemaSnapshot {
                indexes: indexes.into_iter().collect(),
                columns: columns.into_iter().collect(),
            })
        })
        .await
    }

    async fn count_rows(&mut self, table: &str) -> Result<u64, StorageError> {
        let statement = format!("SELECT count(*) FROM {table}");
        let conn = &mut self.conn;
        bounded(self.call_timeout, async move {
            let count: i64 = sqlx::query_scalar(&statement).fetch_one(conn).await?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    async fn server_version(&mut self) -> Result<String, StorageError> {
        let conn = &mut self.conn;
        let version = bounded(self.call_timeout, async move {
            Ok(sqlx::query_scalar::<_, String>("SHOW server_version")
                .fetch_one(conn)
                .await?)
        })
        .await?;
        info!("Connected to PostgreSQL {version}");
        Ok(version)
    }
}
