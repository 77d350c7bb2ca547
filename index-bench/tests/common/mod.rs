//! Scripted in-memory storage for driving the experiment without a server.
//!
//! Understands just enough DDL to track indexes and columns of `products`
//! (CREATE/DROP INDEX, ADD/DROP COLUMN), applies each transaction to a copy
//! and commits only if every statement succeeded. Plans are synthesized from
//! the SQL text and the indexes currently present.

#![allow(dead_code)]

use async_trait::async_trait;
use bench_core::types::SqlValue;
use index_bench::config::{ExperimentConfig, GenerationConfig};
use index_bench::experiment::Cancellation;
use index_bench::storage::{Row, SchemaSnapshot, Storage, StorageError};
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub const BASE_COLUMNS: [&str; 7] = [
    "id",
    "name",
    "brand",
    "category",
    "description",
    "created_at",
    "updated_at",
];

pub fn base_schema() -> SchemaSnapshot {
    SchemaSnapshot {
        indexes: BTreeMap::from([(
            "products_pkey".to_string(),
            "CREATE UNIQUE INDEX products_pkey ON products USING btree (id)".to_string(),
        )]),
        columns: BASE_COLUMNS.iter().map(|c| c.to_string()).collect(),
    }
}

/// Which index the fake planner picks when it is present, keyed by a marker
/// in the SQL text.
const INDEX_RULES: &[(&str, &str)] = &[
    ("search_vector", "idx_products_search_vector"),
    ("search_text", "idx_products_search_text_trgm"),
    ("ILIKE", "idx_products_name_trgm"),
    ("ORDER BY name, id", "idx_products_name_id"),
];

pub struct FakeStorage {
    pub schema: SchemaSnapshot,
    pub rows: u64,
    /// Every call, in order, as `kind: detail`.
    pub calls: Vec<String>,
    /// Statements or queries containing any of these fail.
    pub fail_sql: Vec<String>,
    /// Statistics refresh fails while this index exists.
    pub fail_refresh_with_index: Option<String>,
    /// Rows the fake COPY silently loses.
    pub lose_rows: u64,
    /// 1-based positions of EXPLAIN calls that fail.
    pub fail_explains: Vec<usize>,
    /// Cancel once this many EXPLAINs have run.
    pub cancel_after_explains: Option<(usize, Cancellation)>,
    /// Parameters of every plain fetch, in order.
    pub fetched_params: Vec<Vec<SqlValue>>,
    explains: usize,
    fetches: usize,
}

impl FakeStorage {
    pub fn new() -> Self {
        Self {
            schema: base_schema(),
            rows: 0,
            calls: Vec::new(),
            fail_sql: Vec::new(),
            fail_refresh_with_index: None,
            lose_rows: 0,
            fail_explains: Vec::new(),
            cancel_after_explains: None,
            fetched_params: Vec::new(),
            explains: 0,
            fetches: 0,
        }
    }

    pub fn loaded(rows: u64) -> Self {
        Self {
            rows,
            ..Self::new()
        }
    }

    pub fn failing_on(marker: &str) -> Self {
        Self {
            fail_sql: vec![marker.to_string()],
            ..Self::new()
        }
    }

    pub fn explain_count(&self) -> usize {
        self.explains
    }

    pub fn calls_of(&self, kind: &str) -> Vec<&str> {
        self.calls
            .iter()
            .filter_map(|c| c.strip_prefix(kind)?.strip_prefix(": "))
            .collect()
    }

    fn check_fail(&self, sql: &str) -> Result<(), StorageError> {
        match self.fail_sql.iter().find(|marker| sql.contains(marker.as_str())) {
            Some(marker) => Err(StorageError::Rejected(format!(
                "scripted failure ({marker})"
            ))),
            None => Ok(()),
        }
    }

    fn apply_statement(&self, schema: &mut SchemaSnapshot, stmt: &str) -> Result<(), StorageError> {
        self.check_fail(stmt)?;
        let words: Vec<&str> = stmt.split_whitespace().collect();
        let upper: Vec<String> = words.iter().map(|w| w.to_uppercase()).collect();
        let keyword = |kw: &str| upper.iter().position(|w| w == kw);
        let name_after = |pos: usize| {
            words[pos + 1..]
                .iter()
                .find(|w| !matches!(w.to_uppercase().as_str(), "IF" | "NOT" | "EXISTS"))
                .map(|w| w.trim_matches(|c| c == '"' || c == ';').to_string())
                .ok_or_else(|| StorageError::Rejected(format!("syntax error: {stmt}")))
        };

        match upper.first().map(String::as_str) {
            Some("CREATE") => {
                let pos = keyword("INDEX")
                    .ok_or_else(|| StorageError::Rejected(format!("unsupported: {stmt}")))?;
                let name = name_after(pos)?;
                schema.indexes.insert(name, stmt.to_string());
            }
            Some("DROP") => {
                let pos = keyword("INDEX")
                    .ok_or_else(|| StorageError::Rejected(format!("unsupported: {stmt}")))?;
                let name = name_after(pos)?;
                if schema.indexes.remove(&name).is_none() && !upper.contains(&"EXISTS".to_string()) {
                    return Err(StorageError::Rejected(format!(
                        "index \"{name}\" does not exist"
                    )));
                }
            }
            Some("ALTER") => {
                let pos = keyword("COLUMN")
                    .ok_or_else(|| StorageError::Rejected(format!("unsupported: {stmt}")))?;
                let column = name_after(pos)?;
                if upper.contains(&"ADD".to_string()) {
                    schema.columns.insert(column);
                } else {
                    schema.columns.remove(&column);
                    schema
                        .indexes
                        .retain(|_, def| !def.contains(&format!("({column}")));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn plan_for(&self, sql: &str) -> Value {
        let index = INDEX_RULES
            .iter()
            .find(|(marker, index)| sql.contains(marker) && self.schema.indexes.contains_key(*index))
            .map(|(_, index)| *index);
        let scan = match index {
            Some(index) if index == "idx_products_name_id" => json!({
                "Node Type": "Index Scan", "Index Name": index, "Relation Name": "products",
                "Plan Rows": 25, "Actual Rows": 25, "Shared Hit Blocks": 6
            }),
            Some(index) => json!({
                "Node Type": "Bitmap Heap Scan", "Relation Name": "products",
                "Plan Rows": 40, "Actual Rows": 31, "Shared Hit Blocks": 20, "Shared Read Blocks": 1,
                "Plans": [{"Node Type": "Bitmap Index Scan", "Index Name": index,
                           "Plan Rows": 40, "Actual Rows": 31, "Shared Hit Blocks": 3}]
            }),
            None => json!({
                "Node Type": "Seq Scan", "Relation Name": "products",
                "Plan Rows": 5, "Actual Rows": 2, "Shared Hit Blocks": 120, "Shared Read Blocks": 8
            }),
        };
        let root = if sql.contains("LIMIT") {
            json!({"Node Type": "Limit", "Plan Rows": 25, "Actual Rows": 25, "Plans": [scan]})
        } else {
            scan
        };
        json!([{
            "Plan": root,
            "Planning Time": 0.08,
            "Execution Time": 1.0 + self.explains as f64 * 0.25
        }])
    }
}

#[async_trait]
impl Storage for FakeStorage {
    async fn execute_script(&mut self, sql: &str) -> Result<(), StorageError> {
        self.calls.push(format!("script: {sql}"));
        self.check_fail(sql)
    }

    async fn execute_transaction(&mut self, sql: &str) -> Result<(), StorageError> {
        self.calls.push(format!("transaction: {sql}"));
        let mut staged = self.schema.clone();
        for stmt in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            self.apply_statement(&mut staged, stmt)?;
        }
        self.schema = staged;
        Ok(())
    }

    async fn bulk_load(
        &mut self,
        reset_sql: &str,
        copy_sql: &str,
        chunks: &mut (dyn Iterator<Item = Vec<u8>> + Send),
        expected_rows: u64,
    ) -> Result<u64, StorageError> {
        self.calls.push(format!("bulk_load: {copy_sql}"));
        self.check_fail(reset_sql)?;
        let lines: u64 = chunks
            .map(|chunk| chunk.iter().filter(|&&b| b == b'\n').count() as u64)
            .sum();
        let actual = lines.saturating_sub(self.lose_rows);
        if actual != expected_rows {
            return Err(StorageError::RowCountMismatch {
                expected: expected_rows,
                actual,
            });
        }
        self.schema = base_schema();
        self.rows = actual;
        Ok(actual)
    }

    async fn refresh_statistics(&mut self, table: &str) -> Result<(), StorageError> {
        self.calls.push(format!("analyze: {table}"));
        match &self.fail_refresh_with_index {
            Some(index) if self.schema.indexes.contains_key(index) => Err(
                StorageError::Rejected("could not refresh statistics".to_string()),
            ),
            _ => Ok(()),
        }
    }

    async fn vacuum_analyze(&mut self, table: &str) -> Result<(), StorageError> {
        self.calls.push(format!("vacuum: {table}"));
        Ok(())
    }

    async fn explain_analyze(
        &mut self,
        sql: &str,
        _params: &[SqlValue],
    ) -> Result<Value, StorageError> {
        self.calls.push(format!("explain: {sql}"));
        self.explains += 1;
        if let Some((after, cancel)) = &self.cancel_after_explains {
            if self.explains >= *after {
                cancel.cancel();
            }
        }
        if self.fail_explains.contains(&self.explains) {
            return Err(StorageError::Rejected(format!(
                "scripted failure (explain #{})",
                self.explains
            )));
        }
        self.check_fail(sql)?;
        Ok(self.plan_for(sql))
    }

    async fn fetch_rows(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StorageError> {
        self.calls.push(format!("fetch: {sql}"));
        self.fetched_params.push(params.to_vec());
        self.check_fail(sql)?;
        self.fetches += 1;
        let row = Row::from([
            (
                "id".to_string(),
                SqlValue::Text(format!("00000000-0000-0000-0000-{:012}", self.fetches)),
            ),
            ("name".to_string(), SqlValue::Text(format!("page-{:04}", self.fetches))),
        ]);
        Ok(vec![row])
    }

    async fn schema_snapshot(&mut self, table: &str) -> Result<SchemaSnapshot, StorageError> {
        self.calls.push(format!("snapshot: {table}"));
        Ok(self.schema.clone())
    }

    async fn count_rows(&mut self, table: &str) -> Result<u64, StorageError> {
        self.calls.push(format!("count: {table}"));
        Ok(self.rows)
    }

    async fn server_version(&mut self) -> Result<String, StorageError> {
        Ok("16.4 (scripted)".to_string())
    }
}

/// Small dataset, short runs.
pub fn small_configs(rows: u64) -> (GenerationConfig, ExperimentConfig) {
    let generation = GenerationConfig {
        seed: 12345,
        row_count: rows,
        ..GenerationConfig::default()
    };
    let settings = ExperimentConfig {
        warmup_runs: 2,
        measured_runs: 5,
        ..ExperimentConfig::default()
    };
    (generation, settings)
}
