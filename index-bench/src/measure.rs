//! Measurement engine: warmup, then analyzed runs, for one (variant, query) pair.
//!
//! Runs execute strictly one after another on the experiment's single
//! connection, so each run's buffer counters describe that run's I/O alone.

use crate::error::{ExperimentError, QueryError};
use crate::experiment::Cancellation;
use crate::query::{BoundQuery, QuerySpec};
use crate::storage::Storage;
use crate::variant::ActiveVariant;
use bench_core::types::{CompletedRun, ExplainDocument, RunMeasurement, RunOutcome};
use log::{debug, info, warn};
use serde::Serialize;
use std::time::Instant;

/// Consecutive failed executions after which a pair is abandoned.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PairStatus {
    /// Every requested run was attempted. Individual runs may still have failed.
    Completed,
    /// Stopped early after [`MAX_CONSECUTIVE_FAILURES`] failures in a row.
    Aborted { cause: String },
    /// The active schema lacks a column the query needs; nothing was executed.
    NotApplicable { reason: String },
}

impl PairStatus {
    pub fn label(&self) -> &'static str {
        match self {
            PairStatus::Completed => "completed",
            PairStatus::Aborted { .. } => "aborted",
            PairStatus::NotApplicable { .. } => "not_applicable",
        }
    }

    pub fn cause(&self) -> Option<&str> {
        match self {
            PairStatus::Completed => None,
            PairStatus::Aborted { cause } => Some(cause),
            PairStatus::NotApplicable { reason } => Some(reason),
        }
    }
}

/// Everything measured for one pair.
#[derive(Debug, Clone, Serialize)]
pub struct PairMeasurement {
    pub query: String,
    #[serde(flatten)]
    pub status: PairStatus,
    pub runs: Vec<RunMeasurement>,
    /// Raw EXPLAIN output of the first successful run.
    #[serde(skip)]
    pub plan_document: Option<serde_json::Value>,
}

impl PairMeasurement {
    fn new(query: &QuerySpec, status: PairStatus) -> Self {
        Self {
            query: query.name.clone(),
            status,
            runs: Vec::new(),
            plan_document: None,
        }
    }
}

/// One analyzed execution. Returns the parsed run and the raw document.
async fn run_once(
    storage: &mut dyn Storage,
    bound: &BoundQuery<'_>,
) -> Result<(CompletedRun, serde_json::Value), QueryError> {
    let params = bound.params()?;
    let start = Instant::now();
    let raw = storage.explain_analyze(bound.sql(), &params).await?;
    let wall = start.elapsed();
    let doc = ExplainDocument::from_json(&raw)?;
    Ok((CompletedRun::from_explain(doc, wall), raw))
}

/// Plain execution; returns rows so cursors can advance.
async fn run_plain(
    storage: &mut dyn Storage,
    bound: &BoundQuery<'_>,
) -> Result<Vec<crate::storage::Row>, QueryError> {
    let params = bound.params()?;
    Ok(storage.fetch_rows(bound.sql(), &params).await?)
}

/// Measure `query` under the applied variant `active`.
///
/// `warmup` plain executions are discarded, then exactly `measured`
/// analyzed runs are recorded unless the pair aborts. Failed executions
/// (warmup included) count toward [`MAX_CONSECUTIVE_FAILURES`]. Only
/// cancellation is returned as an error; everything else is recorded.
pub async fn measure(
    storage: &mut dyn Storage,
    active: &ActiveVariant,
    query: &QuerySpec,
    warmup: u32,
    measured: u32,
    cancel: &Cancellation,
) -> Result<PairMeasurement, ExperimentError> {
    let missing: Vec<&str> = query
        .requires_columns
        .iter()
        .map(String::as_str)
        .filter(|c| !active.schema().has_column(c))
        .collect();
    if !missing.is_empty() {
        let reason = format!("missing column(s): {}", missing.join(", "));
        info!("  {}: not applicable under {} ({reason})", query.name, active.name());
        return Ok(PairMeasurement::new(query, PairStatus::NotApplicable { reason }));
    }

    let mut consecutive = 0u32;

    let mut bound = BoundQuery::new(query);
    for i in 0..warmup {
        cancel.check()?;
        match run_plain(storage, &bound).await {
            Ok(rows) => {
                consecutive = 0;
                bound.advance(&rows);
            }
            Err(err) => {
                consecutive += 1;
                warn!("  {}: warmup {i} failed: {err}", query.name);
                if consecutive >= MAX_CONSECUTIVE_FAILURES {
                    return Ok(PairMeasurement::new(
                        query,
                        PairStatus::Aborted {
                            cause: format!("warmup: {err}"),
                        },
                    ));
                }
            }
        }
    }

    // Measured runs page from the start again.
    let mut bound = BoundQuery::new(query);
    let mut pair = PairMeasurement::new(query, PairStatus::Completed);
    for run_index in 0..measured {
        cancel.check()?;
        let outcome = match run_once(storage, &bound).await {
            Ok((run, raw)) => {
                consecutive = 0;
                if pair.plan_document.is_none() {
                    pair.plan_document = Some(raw);
                }
                debug!(
                    "  {} run {run_index}: {:.3}ms, {}",
                    query.name,
                    run.latency_ms,
                    run.plan.scan_path_label()
                );
                RunOutcome::Completed(run)
            }
            Err(err) => {
                consecutive += 1;
                warn!("  {} run {run_index} failed: {err}", query.name);
                RunOutcome::Failed {
                    cause: err.to_string(),
                }
            }
        };
        let succeeded = matches!(outcome, RunOutcome::Completed(_));
        pair.runs.push(RunMeasurement {
            variant: active.name().to_string(),
            query: query.name.clone(),
            run_index,
            outcome,
        });

        if consecutive >= MAX_CONSECUTIVE_FAILURES {
            let cause = pair
                .runs
                .last()
                .and_then(RunMeasurement::failure)
                .unwrap_or("repeated failures")
                .to_string();
            warn!(
                "  {}: aborted after {consecutive} consecutive failures",
                query.name
            );
            pair.status = PairStatus::Aborted { cause };
            break;
        }

        // Cursor advancement is untimed and outside EXPLAIN.
        if succeeded && bound.has_cursors() {
            match run_plain(storage, &bound).await {
                Ok(rows) => bound.advance(&rows),
                Err(err) => {
                    warn!("  {}: cursor advance failed, restarting: {err}", query.name);
                    bound.advance(&[]);
                }
            }
        }
    }

    let failed = pair.runs.iter().filter(|r| r.failure().is_some()).count();
    info!(
        "  {}: {} runs, {failed} failed",
        query.name,
        pair.runs.len()
    );
    Ok(pair)
}
