//! PostgreSQL Secondary-Index Experiment Harness
//!
//! Measures how different secondary-index strategies change query latency and
//! planner behavior on one `products` table, under reproducible conditions.
//!
//! One experiment is:
//! - **generate + load**: a seeded synthetic dataset streamed in through `COPY`
//! - per variant: **apply** the index strategy, **measure** every query
//!   (warmup, then `EXPLAIN (ANALYZE, BUFFERS, FORMAT JSON)` runs),
//!   **aggregate** percentiles and buffer counters, **revert**
//!
//! All variants see the identical dataset; exactly one variant is applied at a
//! time; a failing variant is flagged in the report, never silently dropped.
//!
//! Run the experiment: `DATABASE_URL=postgres://... cargo run --release`
//! Run tests: `cargo test`

pub mod config;
pub mod error;
pub mod experiment;
pub mod generate;
pub mod load;
pub mod measure;
pub mod query;
pub mod report;
pub mod stats;
pub mod storage;
pub mod variant;
