//! Storage boundary and the common `Storage` trait.
//!
//! The experiment drives storage through one transactional SQL connection.
//! [`postgres::PgStorage`] is the real implementation; tests script their own.
//! Every call is expected to give up after the implementation's call timeout
//! and report [`StorageError::Timeout`] instead of hanging.

pub mod postgres;

use async_trait::async_trait;
use bench_core::types::SqlValue;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

pub use crate::error::StorageError;

/// One result row, keyed by column name.
pub type Row = BTreeMap<String, SqlValue>;

/// Indexes and columns of one table at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaSnapshot {
    /// Index name → definition.
    pub indexes: BTreeMap<String, String>,
    pub columns: BTreeSet<String>,
}

impl SchemaSnapshot {
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.contains(column)
    }

    /// Human-readable difference from `before`, or `None` when identical.
    pub fn diff(&self, before: &SchemaSnapshot) -> Option<String> {
        let mut changes = Vec::new();
        for (name, def) in &self.indexes {
            match before.indexes.get(name) {
                None => changes.push(format!("+index {name}")),
                Some(old) if old != def => changes.push(format!("~index {name}")),
                Some(_) => {}
            }
        }
        for name in before.indexes.keys() {
            if !self.indexes.contains_key(name) {
                changes.push(format!("-index {name}"));
            }
        }
        for column in self.columns.difference(&before.columns) {
            changes.push(format!("+column {column}"));
        }
        for column in before.columns.difference(&self.columns) {
            changes.push(format!("-column {column}"));
        }
        (!changes.is_empty()).then(|| changes.join(", "))
    }
}

/// Transactional SQL connection used by every stage of an experiment.
///
/// Calls are strictly sequential: the experiment holds `&mut` for the whole
/// run, so DDL and measured reads can never overlap.
#[async_trait]
pub trait Storage: Send {
    /// Run a (possibly multi-statement) script outside any explicit transaction.
    async fn execute_script(&mut self, sql: &str) -> Result<(), StorageError>;

    /// Run a script inside one transaction; on any error nothing is committed.
    async fn execute_transaction(&mut self, sql: &str) -> Result<(), StorageError>;

    /// In one transaction: run `reset_sql`, then stream `chunks` through the
    /// `COPY ... FROM STDIN` statement `copy_sql`. Commits only when the copied
    /// row count equals `expected_rows`, otherwise rolls back and reports
    /// [`StorageError::RowCountMismatch`].
    async fn bulk_load(
        &mut self,
        reset_sql: &str,
        copy_sql: &str,
        chunks: &mut (dyn Iterator<Item = Vec<u8>> + Send),
        expected_rows: u64,
    ) -> Result<u64, StorageError>;

    /// Recompute planner statistics for `table`.
    async fn refresh_statistics(&mut self, table: &str) -> Result<(), StorageError>;

    /// `VACUUM (ANALYZE)` on `table`, outside any transaction.
    async fn vacuum_analyze(&mut self, table: &str) -> Result<(), StorageError>;

    /// Execute `sql` (with `$n` placeholders) under
    /// `EXPLAIN (ANALYZE, BUFFERS, FORMAT JSON)` and return the JSON document.
    async fn explain_analyze(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<serde_json::Value, StorageError>;

    /// Execute `sql` plainly and return every row.
    async fn fetch_rows(&mut self, sql: &str, params: &[SqlValue])
        -> Result<Vec<Row>, StorageError>;

    async fn schema_snapshot(&mut self, table: &str) -> Result<SchemaSnapshot, StorageError>;

    async fn count_rows(&mut self, table: &str) -> Result<u64, StorageError>;

    async fn server_version(&mut self) -> Result<String, StorageError>;
}
