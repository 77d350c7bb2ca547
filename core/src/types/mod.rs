//! Data model shared between the measurement engine and its consumers.

mod measurement;
mod plan;
mod value;

pub use measurement::{CompletedRun, RunMeasurement, RunOutcome};
pub use plan::{BufferCounters, ExplainDocument, PlanError, PlanNode, PlanNodes, WRAPPER_NODES};
pub use value::SqlValue;
