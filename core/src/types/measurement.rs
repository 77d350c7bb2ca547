use super::plan::{ExplainDocument, PlanNode};
use serde::Serialize;
use std::time::Duration;

/// One measured execution of a query under a variant.
///
/// Created once by the measurement engine and only read afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunMeasurement {
    pub variant: String,
    pub query: String,
    pub run_index: u32,
    #[serde(flatten)]
    pub outcome: RunOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed(CompletedRun),
    /// The execution failed; no latency or plan exists for this run.
    Failed { cause: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletedRun {
    /// Server-side execution time reported by EXPLAIN ANALYZE.
    pub latency_ms: f64,
    pub planning_ms: f64,
    /// Client-observed round trip, including EXPLAIN overhead.
    pub wall_ms: f64,
    pub planner_estimated_rows: u64,
    pub actual_rows: u64,
    pub plan: PlanNode,
}

impl CompletedRun {
    pub fn from_explain(doc: ExplainDocument, wall: Duration) -> Self {
        Self {
            latency_ms: doc.execution_time_ms,
            planning_ms: doc.planning_time_ms,
            wall_ms: wall.as_secs_f64() * 1000.0,
            planner_estimated_rows: doc.plan.plan_rows.max(0.0).round() as u64,
            actual_rows: doc.plan.actual_rows.max(0.0).round() as u64,
            plan: doc.plan,
        }
    }
}

impl RunMeasurement {
    pub fn completed(&self) -> Option<&CompletedRun> {
        match &self.outcome {
            RunOutcome::Completed(run) => Some(run),
            RunOutcome::Failed { .. } => None,
        }
    }

    pub fn latency_ms(&self) -> Option<f64> {
        self.completed().map(|run| run.latency_ms)
    }

    pub fn failure(&self) -> Option<&str> {
        match &self.outcome {
            RunOutcome::Failed { cause } => Some(cause),
            RunOutcome::Completed(_) => None,
        }
    }
}
