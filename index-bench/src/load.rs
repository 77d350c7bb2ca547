//! Bulk loader: reset the `products` table and stream the dataset in via COPY.

use crate::error::LoadError;
use crate::generate::{CsvChunks, Records, COLUMNS};
use crate::storage::Storage;
use log::info;
use serde::Serialize;
use std::time::{Duration, Instant};

/// The one table every variant and query works against.
pub const TABLE: &str = "products";

/// Bytes of CSV buffered per COPY message.
const CHUNK_BYTES: usize = 1 << 20;

/// Destructive: drops `products` with everything hanging off it.
pub const RESET_SQL: &str = "\
CREATE EXTENSION IF NOT EXISTS pg_trgm;
DROP TABLE IF EXISTS products CASCADE;
CREATE TABLE products (
    id          uuid PRIMARY KEY,
    name        text NOT NULL,
    brand       text NOT NULL,
    category    text NOT NULL,
    description text NOT NULL,
    created_at  timestamptz NOT NULL,
    updated_at  timestamptz NOT NULL
);";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoadStats {
    pub rows: u64,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64() * 1000.0)
}

impl LoadStats {
    pub fn rows_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.rows as f64 / secs
    }
}

pub fn copy_sql() -> String {
    format!(
        "COPY {TABLE} ({}) FROM STDIN WITH (FORMAT csv)",
        COLUMNS.join(", ")
    )
}

/// Reset the schema and load `records`, all in one transaction.
///
/// Nothing is committed unless COPY reports exactly `records.len()` rows.
/// `elapsed` covers the reset and the transfer, not the trailing
/// `VACUUM (ANALYZE)`.
pub async fn load(storage: &mut dyn Storage, records: Records<'_>) -> Result<LoadStats, LoadError> {
    let expected = records.len() as u64;
    info!("Loading {expected} rows into {TABLE}...");

    let start = Instant::now();
    let mut chunks = CsvChunks::new(records, CHUNK_BYTES);
    let rows = storage
        .bulk_load(RESET_SQL, &copy_sql(), &mut chunks, expected)
        .await?;
    let elapsed = start.elapsed();

    storage.vacuum_analyze(TABLE).await?;

    let stats = LoadStats { rows, elapsed };
    info!(
        "Loaded {} rows in {:.2}s ({:.0} rows/sec)",
        stats.rows,
        elapsed.as_secs_f64(),
        stats.rows_per_sec()
    );
    Ok(stats)
}

/// Check that an already-loaded dataset has the configured size.
pub async fn verify_existing(storage: &mut dyn Storage, expected: u64) -> Result<u64, LoadError> {
    let actual = storage.count_rows(TABLE).await?;
    if actual != expected {
        return Err(LoadError::DatasetMismatch { expected, actual });
    }
    info!("Reusing existing dataset: {actual} rows in {TABLE}");
    Ok(actual)
}
