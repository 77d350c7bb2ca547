//! Statistics aggregator: reduces the runs of one (variant, query) pair.
//!
//! Always recomputed from the full measurement slice; nothing is updated
//! incrementally.

use bench_core::types::{BufferCounters, CompletedRun, RunMeasurement};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencySummary {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl LatencySummary {
    /// `None` for an empty slice. `sorted` must be ascending.
    pub fn from_sorted(sorted: &[f64]) -> Option<Self> {
        Some(Self {
            p50: percentile_nearest_rank(sorted, 50.0)?,
            p95: percentile_nearest_rank(sorted, 95.0)?,
            p99: percentile_nearest_rank(sorted, 99.0)?,
            min: *sorted.first()?,
            max: *sorted.last()?,
            mean: sorted.iter().sum::<f64>() / sorted.len() as f64,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariantQueryStats {
    /// Measured runs, successful or not.
    pub runs: usize,
    pub failures: usize,
    /// `None` when no run succeeded.
    pub latency: Option<LatencySummary>,
    pub root_node_type: Option<String>,
    /// Root down to the first non-wrapper node, e.g. `Limit > Index Scan`.
    pub scan_path: Option<String>,
    pub index_name: Option<String>,
    pub planner_estimated_rows: Option<u64>,
    pub actual_rows: Option<u64>,
    /// Summed over every node of every successful run.
    pub buffers: BufferCounters,
    /// Every successful run had the first run's scan path, so a change of
    /// root node type or of the scan under a `Limit` both count.
    pub plan_shape_stable: bool,
}

/// Nearest-rank percentile of an ascending slice: index
/// `ceil(p/100 * n) - 1`, clamped to the slice.
pub fn percentile_nearest_rank(sorted: &[f64], p: f64) -> Option<f64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    let rank = (p * n as f64 / 100.0).ceil() as i64 - 1;
    let idx = rank.clamp(0, n as i64 - 1) as usize;
    Some(sorted[idx])
}

/// Reduce the runs of one pair.
///
/// Plan-derived fields come from the first successful run; failed runs are
/// counted but contribute nothing else.
pub fn aggregate(measurements: &[RunMeasurement]) -> VariantQueryStats {
    let completed: Vec<&CompletedRun> = measurements
        .iter()
        .filter_map(RunMeasurement::completed)
        .collect();

    let mut latencies: Vec<f64> = measurements
        .iter()
        .filter_map(RunMeasurement::latency_ms)
        .collect();
    latencies.sort_by(f64::total_cmp);

    let first = completed.first();
    let plan_shape_stable = match first {
        Some(first) => {
            let path = first.plan.scan_path();
            completed.iter().all(|r| r.plan.scan_path() == path)
        }
        None => true,
    };

    VariantQueryStats {
        runs: measurements.len(),
        failures: measurements.len() - completed.len(),
        latency: LatencySummary::from_sorted(&latencies),
        root_node_type: first.map(|r| r.plan.node_type.clone()),
        scan_path: first.map(|r| r.plan.scan_path_label()),
        index_name: first
            .and_then(|r| r.plan.first_index_name())
            .map(str::to_string),
        planner_estimated_rows: first.map(|r| r.planner_estimated_rows),
        actual_rows: first.map(|r| r.actual_rows),
        buffers: completed.iter().map(|r| r.plan.total_buffers()).sum(),
        plan_shape_stable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_core::types::{ExplainDocument, RunOutcome};
    use proptest::prelude::*;
    use serde_json::json;
    use std::time::Duration;

    fn run(index: u32, latency: f64, plan: serde_json::Value) -> RunMeasurement {
        let doc = ExplainDocument::from_json(&json!([{
            "Plan": plan,
            "Planning Time": 0.1,
            "Execution Time": latency
        }]))
        .unwrap();
        RunMeasurement {
            variant: "V".into(),
            query: "Q".into(),
            run_index: index,
            outcome: RunOutcome::Completed(CompletedRun::from_explain(doc, Duration::ZERO)),
        }
    }

    fn seq_scan(hit: u64, read: u64) -> serde_json::Value {
        json!({"Node Type": "Seq Scan", "Relation Name": "products", "Plan Rows": 100,
               "Actual Rows": 7, "Shared Hit Blocks": hit, "Shared Read Blocks": read})
    }

    fn failed(index: u32) -> RunMeasurement {
        RunMeasurement {
            variant: "V".into(),
            query: "Q".into(),
            run_index: index,
            outcome: RunOutcome::Failed {
                cause: "canceling statement due to statement timeout".into(),
            },
        }
    }

    #[test]
    fn five_sample_percentiles() {
        let sorted = [10.0, 20.0, 30.0, 40.0, 50.0];
        assert_eq!(percentile_nearest_rank(&sorted, 50.0), Some(30.0));
        assert_eq!(percentile_nearest_rank(&sorted, 95.0), Some(50.0));
        assert_eq!(percentile_nearest_rank(&sorted, 99.0), Some(50.0));
        assert_eq!(percentile_nearest_rank(&sorted, 0.0), Some(10.0));
        assert_eq!(percentile_nearest_rank(&[], 50.0), None);
    }

    #[test]
    fn twenty_samples_hit_exact_ranks() {
        let sorted: Vec<f64> = (1..=20).map(f64::from).collect();
        assert_eq!(percentile_nearest_rank(&sorted, 95.0), Some(19.0));
        assert_eq!(percentile_nearest_rank(&sorted, 50.0), Some(10.0));
    }

    #[test]
    fn single_sample_fills_every_percentile() {
        let stats = aggregate(&[run(0, 4.2, seq_scan(1, 0))]);
        let latency = stats.latency.unwrap();
        assert_eq!((latency.p50, latency.p95, latency.p99), (4.2, 4.2, 4.2));
        assert_eq!((latency.min, latency.max, latency.mean), (4.2, 4.2, 4.2));
    }

    #[test]
    fn latencies_are_sorted_before_ranking() {
        let runs: Vec<_> = [50.0, 10.0, 40.0, 20.0, 30.0]
            .into_iter()
            .enumerate()
            .map(|(i, l)| run(i as u32, l, seq_scan(1, 0)))
            .collect();
        let latency = aggregate(&runs).latency.unwrap();
        assert_eq!((latency.p50, latency.p95, latency.p99), (30.0, 50.0, 50.0));
        assert_eq!((latency.min, latency.max, latency.mean), (10.0, 50.0, 30.0));
    }

    #[test]
    fn failures_are_counted_but_not_summed() {
        let runs = vec![
            run(0, 1.0, seq_scan(10, 2)),
            failed(1),
            run(2, 3.0, seq_scan(5, 1)),
            failed(3),
        ];
        let stats = aggregate(&runs);
        assert_eq!(stats.runs, 4);
        assert_eq!(stats.failures, 2);
        assert_eq!(stats.buffers.shared_hit, 15);
        assert_eq!(stats.buffers.shared_read, 3);
        assert_eq!(stats.latency.unwrap().mean, 2.0);
    }

    #[test]
    fn all_failed_has_no_latency_or_plan() {
        let stats = aggregate(&[failed(0), failed(1)]);
        assert_eq!(stats.failures, 2);
        assert!(stats.latency.is_none());
        assert!(stats.root_node_type.is_none());
        assert_eq!(stats.buffers, BufferCounters::default());
    }

    #[test]
    fn plan_fields_come_from_first_successful_run() {
        let bitmap = json!({
            "Node Type": "Bitmap Heap Scan", "Plan Rows": 40, "Actual Rows": 12,
            "Shared Hit Blocks": 3,
            "Plans": [{"Node Type": "Bitmap Index Scan", "Index Name": "idx_products_name_trgm",
                       "Shared Hit Blocks": 2}]
        });
        let runs = vec![failed(0), run(1, 2.0, bitmap), run(2, 9.0, seq_scan(100, 0))];
        let stats = aggregate(&runs);
        assert_eq!(stats.root_node_type.as_deref(), Some("Bitmap Heap Scan"));
        assert_eq!(stats.index_name.as_deref(), Some("idx_products_name_trgm"));
        assert_eq!(stats.planner_estimated_rows, Some(40));
        assert_eq!(stats.actual_rows, Some(12));
        assert!(!stats.plan_shape_stable);
        assert_eq!(stats.buffers.shared_hit, 105);
    }

    #[test]
    fn shape_changes_below_a_wrapper_are_unstable() {
        let limited = |scan: serde_json::Value| {
            json!({"Node Type": "Limit", "Plan Rows": 25, "Actual Rows": 25, "Plans": [scan]})
        };
        let index_scan = json!({"Node Type": "Index Scan", "Index Name": "idx_products_name_id",
                                "Plan Rows": 25, "Actual Rows": 25});

        let same_root = aggregate(&[
            run(0, 4.0, limited(seq_scan(50, 0))),
            run(1, 0.5, limited(index_scan.clone())),
        ]);
        assert_eq!(same_root.root_node_type.as_deref(), Some("Limit"));
        assert_eq!(same_root.scan_path.as_deref(), Some("Limit > Seq Scan"));
        assert!(!same_root.plan_shape_stable);

        let steady = aggregate(&[
            run(0, 0.6, limited(index_scan.clone())),
            failed(1),
            run(2, 0.5, limited(index_scan)),
        ]);
        assert!(steady.plan_shape_stable);
    }

    #[test]
    fn sequential_scan_reports_no_index() {
        let stats = aggregate(&[run(0, 1.0, seq_scan(1, 1)), run(1, 1.5, seq_scan(1, 0))]);
        assert_eq!(stats.index_name, None);
        assert_eq!(stats.scan_path.as_deref(), Some("Seq Scan"));
        assert!(stats.plan_shape_stable);
    }

    proptest! {
        #[test]
        fn percentiles_are_ordered_members(mut xs in prop::collection::vec(0.0f64..1e6, 1..200)) {
            xs.sort_by(f64::total_cmp);
            let s = LatencySummary::from_sorted(&xs).unwrap();
            prop_assert!(s.min <= s.p50 && s.p50 <= s.p95 && s.p95 <= s.p99 && s.p99 <= s.max);
            for p in [s.p50, s.p95, s.p99] {
                prop_assert!(xs.contains(&p));
            }
            prop_assert!(s.min <= s.mean && s.mean <= s.max);
        }
    }
}
