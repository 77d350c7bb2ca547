//! Structured EXPLAIN plans.
//!
//! PostgreSQL's `EXPLAIN (ANALYZE, BUFFERS, FORMAT JSON)` returns a one-element
//! array whose object carries the root `Plan` plus planning/execution timings.
//! Every node names its type and nests children under `Plans`. The tree is
//! decoded into [`PlanNode`] once; all later questions (buffer totals, which
//! index was used, what the real scan under a `Limit` is) are walks over that
//! typed tree rather than lookups in raw JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

/// Node types that only wrap the node doing the actual row access.
pub const WRAPPER_NODES: &[&str] = &[
    "Limit",
    "Gather",
    "Gather Merge",
    "Sort",
    "Incremental Sort",
    "Materialize",
    "Memoize",
    "Append",
    "Merge Append",
];

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("EXPLAIN output is empty")]
    Empty,
    #[error("EXPLAIN output has unexpected shape: {0}")]
    Shape(String),
    #[error("EXPLAIN JSON could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Page-level I/O reported for one node (or summed over many).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferCounters {
    pub shared_hit: u64,
    pub shared_read: u64,
    pub shared_dirtied: u64,
    pub shared_written: u64,
    pub temp_read: u64,
    pub temp_written: u64,
}

impl AddAssign for BufferCounters {
    fn add_assign(&mut self, rhs: Self) {
        self.shared_hit += rhs.shared_hit;
        self.shared_read += rhs.shared_read;
        self.shared_dirtied += rhs.shared_dirtied;
        self.shared_written += rhs.shared_written;
        self.temp_read += rhs.temp_read;
        self.temp_written += rhs.temp_written;
    }
}

impl Add for BufferCounters {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self {
        self += rhs;
        self
    }
}

impl Sum for BufferCounters {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

/// One node of an analyzed plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    #[serde(rename(deserialize = "Node Type"))]
    pub node_type: String,
    #[serde(rename(deserialize = "Relation Name"), default)]
    pub relation_name: Option<String>,
    #[serde(rename(deserialize = "Index Name"), default)]
    pub index_name: Option<String>,
    #[serde(rename(deserialize = "Plan Rows"), default)]
    pub plan_rows: f64,
    #[serde(rename(deserialize = "Actual Rows"), default)]
    pub actual_rows: f64,
    #[serde(rename(deserialize = "Actual Loops"), default)]
    pub actual_loops: f64,
    #[serde(rename(deserialize = "Actual Total Time"), default)]
    pub actual_total_time_ms: f64,
    #[serde(rename(deserialize = "Shared Hit Blocks"), default)]
    pub shared_hit_blocks: u64,
    #[serde(rename(deserialize = "Shared Read Blocks"), default)]
    pub shared_read_blocks: u64,
    #[serde(rename(deserialize = "Shared Dirtied Blocks"), default)]
    pub shared_dirtied_blocks: u64,
    #[serde(rename(deserialize = "Shared Written Blocks"), default)]
    pub shared_written_blocks: u64,
    #[serde(rename(deserialize = "Temp Read Blocks"), default)]
    pub temp_read_blocks: u64,
    #[serde(rename(deserialize = "Temp Written Blocks"), default)]
    pub temp_written_blocks: u64,
    #[serde(rename(deserialize = "Plans"), default)]
    pub children: Vec<PlanNode>,
}

impl PlanNode {
    /// Counters reported on this node alone.
    pub fn buffers(&self) -> BufferCounters {
        BufferCounters {
            shared_hit: self.shared_hit_blocks,
            shared_read: self.shared_read_blocks,
            shared_dirtied: self.shared_dirtied_blocks,
            shared_written: self.shared_written_blocks,
            temp_read: self.temp_read_blocks,
            temp_written: self.temp_written_blocks,
        }
    }

    /// Pre-order traversal of this node and all descendants.
    pub fn iter(&self) -> PlanNodes<'_> {
        PlanNodes { stack: vec![self] }
    }

    /// Counters summed over this node and every descendant.
    pub fn total_buffers(&self) -> BufferCounters {
        self.iter().map(PlanNode::buffers).sum()
    }

    /// First index named anywhere in the tree (pre-order).
    pub fn first_index_name(&self) -> Option<&str> {
        self.iter().find_map(|node| node.index_name.as_deref())
    }

    /// Node types from the root down to the first node that is not a
    /// wrapper, following the first child at each step.
    pub fn scan_path(&self) -> Vec<&str> {
        let mut path = Vec::new();
        let mut node = self;
        loop {
            path.push(node.node_type.as_str());
            if !WRAPPER_NODES.contains(&node.node_type.as_str()) {
                break;
            }
            match node.children.first() {
                Some(child) => node = child,
                None => break,
            }
        }
        path
    }

    /// [`scan_path`](Self::scan_path) rendered as `Limit > Index Scan`.
    pub fn scan_path_label(&self) -> String {
        self.scan_path().join(" > ")
    }
}

/// Iterator returned by [`PlanNode::iter`].
pub struct PlanNodes<'a> {
    stack: Vec<&'a PlanNode>,
}

impl<'a> Iterator for PlanNodes<'a> {
    type Item = &'a PlanNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.children.iter().rev());
        Some(node)
    }
}

/// A decoded `EXPLAIN (ANALYZE, FORMAT JSON)` result.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExplainDocument {
    #[serde(rename = "Plan")]
    pub plan: PlanNode,
    #[serde(rename = "Planning Time", default)]
    pub planning_time_ms: f64,
    #[serde(rename = "Execution Time", default)]
    pub execution_time_ms: f64,
}

impl ExplainDocument {
    /// Decode the value of the `QUERY PLAN` column.
    ///
    /// Accepts the usual one-element array as well as a bare object.
    pub fn from_json(value: &Value) -> Result<Self, PlanError> {
        let object = match value {
            Value::Array(items) => items.first().ok_or(PlanError::Empty)?,
            Value::Object(_) => value,
            Value::String(text) => {
                let parsed: Value = serde_json::from_str(text)?;
                return Self::from_json(&parsed);
            }
            other => {
                return Err(PlanError::Shape(format!(
                    "expected array or object, got {}",
                    json_kind(other)
                )));
            }
        };
        if object.get("Plan").is_none() {
            return Err(PlanError::Shape("missing \"Plan\" key".to_string()));
        }
        Ok(Self::deserialize(object)?)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
