//! Results emitter: artifacts on disk and the human-readable report.
//!
//! Each experiment gets its own timestamped directory:
//!
//!   metadata.json                  conditions the numbers were taken under
//!   summary.csv                    one row per (variant, query)
//!   raw_results.json               every run, with per-pair statistics
//!   plans/<variant>/<query>.json   EXPLAIN output of the first good run

use crate::error::ReportError;
use crate::experiment::{ExperimentReport, PairReport, VariantReport};
use crate::measure::PairStatus;
use crate::stats::LatencySummary;
use bench_core::types::RunMeasurement;
use log::info;
use serde::Serialize;
use std::borrow::Cow;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const SUMMARY_COLUMNS: &[&str] = &[
    "variant",
    "variant_status",
    "query",
    "status",
    "runs",
    "failures",
    "p50_ms",
    "p95_ms",
    "p99_ms",
    "min_ms",
    "max_ms",
    "mean_ms",
    "root_node_type",
    "scan_path",
    "index_name",
    "planner_estimated_rows",
    "actual_rows",
    "shared_hit_blocks",
    "shared_read_blocks",
    "shared_dirtied_blocks",
    "shared_written_blocks",
    "temp_read_blocks",
    "temp_written_blocks",
    "plan_shape_stable",
    "cause",
];

fn io_error(path: &Path, source: std::io::Error) -> ReportError {
    ReportError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn write_json<T: Serialize + ?Sized>(
    path: &Path,
    what: &'static str,
    value: &T,
) -> Result<(), ReportError> {
    let body =
        serde_json::to_vec_pretty(value).map_err(|source| ReportError::Serialize { what, source })?;
    fs::write(path, body).map_err(|e| io_error(path, e))
}

/// `<root>/<stamp>`, or `<stamp>-N` if an earlier run claimed that second.
fn create_run_dir(root: &Path, stamp: &str) -> Result<PathBuf, ReportError> {
    fs::create_dir_all(root).map_err(|e| io_error(root, e))?;
    let mut attempt = 0u32;
    loop {
        let name = match attempt {
            0 => stamp.to_string(),
            n => format!("{stamp}-{n}"),
        };
        let dir = root.join(name);
        match fs::create_dir(&dir) {
            Ok(()) => return Ok(dir),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => attempt += 1,
            Err(e) => return Err(io_error(&dir, e)),
        }
    }
}

/// Write every artifact for `report` under a fresh directory in `root`.
/// Returns that directory.
pub fn write_results(root: &Path, report: &ExperimentReport) -> Result<PathBuf, ReportError> {
    let stamp = report
        .metadata
        .started_at
        .format("%Y%m%dT%H%M%SZ")
        .to_string();
    let dir = create_run_dir(root, &stamp)?;

    write_json(&dir.join("metadata.json"), "metadata", &report.metadata)?;

    let summary = dir.join("summary.csv");
    fs::write(&summary, summary_csv(report)).map_err(|e| io_error(&summary, e))?;

    write_json(&dir.join("raw_results.json"), "raw results", &report.variants)?;

    for variant in &report.variants {
        for pair in &variant.pairs {
            let Some(plan) = &pair.measurement.plan_document else {
                continue;
            };
            let plan_dir = dir.join("plans").join(&variant.variant);
            fs::create_dir_all(&plan_dir).map_err(|e| io_error(&plan_dir, e))?;
            let path = plan_dir.join(format!("{}.json", pair.measurement.query));
            write_json(&path, "plan", plan)?;
        }
    }

    info!("Results written to {}", dir.display());
    Ok(dir)
}

fn csv_field(value: &str) -> Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

fn csv_line(fields: &[String]) -> String {
    let mut line = fields
        .iter()
        .map(|f| csv_field(f))
        .collect::<Vec<_>>()
        .join(",");
    line.push('\n');
    line
}

fn pair_row(variant: &VariantReport, pair: &PairReport) -> Vec<String> {
    let s = &pair.stats;
    let ms = |pick: fn(&LatencySummary) -> f64| {
        s.latency
            .as_ref()
            .map(|l| format!("{:.3}", pick(l)))
            .unwrap_or_default()
    };
    let count = |v: Option<u64>| v.map(|v| v.to_string()).unwrap_or_default();
    let status = &pair.measurement.status;
    let cause = status
        .cause()
        .or_else(|| variant.status.cause())
        .or_else(|| {
            pair.measurement
                .runs
                .iter()
                .rev()
                .find_map(RunMeasurement::failure)
        })
        .unwrap_or_default();
    let stable = match s.latency {
        Some(_) => s.plan_shape_stable.to_string(),
        None => String::new(),
    };

    vec![
        variant.variant.clone(),
        variant.status.label().to_string(),
        pair.measurement.query.clone(),
        status.label().to_string(),
        s.runs.to_string(),
        s.failures.to_string(),
        ms(|l| l.p50),
        ms(|l| l.p95),
        ms(|l| l.p99),
        ms(|l| l.min),
        ms(|l| l.max),
        ms(|l| l.mean),
        s.root_node_type.clone().unwrap_or_default(),
        s.scan_path.clone().unwrap_or_default(),
        s.index_name.clone().unwrap_or_default(),
        count(s.planner_estimated_rows),
        count(s.actual_rows),
        s.buffers.shared_hit.to_string(),
        s.buffers.shared_read.to_string(),
        s.buffers.shared_dirtied.to_string(),
        s.buffers.shared_written.to_string(),
        s.buffers.temp_read.to_string(),
        s.buffers.temp_written.to_string(),
        stable,
        cause.to_string(),
    ]
}

/// Row for a query that never ran because its variant was not measured.
fn unmeasured_row(variant: &VariantReport, query: &str) -> Vec<String> {
    let mut row = vec![String::new(); SUMMARY_COLUMNS.len()];
    row[0] = variant.variant.clone();
    row[1] = variant.status.label().to_string();
    row[2] = query.to_string();
    row[3] = variant.status.label().to_string();
    row[4] = "0".to_string();
    row[5] = "0".to_string();
    row[SUMMARY_COLUMNS.len() - 1] = variant.status.cause().unwrap_or_default().to_string();
    row
}

/// One CSV row per (variant, query). Variants that were never measured still
/// get a row per configured query, carrying the variant's status and cause.
pub fn summary_csv(report: &ExperimentReport) -> String {
    let header: Vec<String> = SUMMARY_COLUMNS.iter().map(|c| c.to_string()).collect();
    let mut out = csv_line(&header);
    for variant in &report.variants {
        if variant.pairs.is_empty() {
            for query in &report.metadata.queries {
                out.push_str(&csv_line(&unmeasured_row(variant, &query.name)));
            }
        } else {
            for pair in &variant.pairs {
                out.push_str(&csv_line(&pair_row(variant, pair)));
            }
        }
    }
    out
}

/// Print a formatted report comparing variants.
pub fn print_report(report: &ExperimentReport) {
    let meta = &report.metadata;
    println!("\n{}", "=".repeat(80));
    println!("  PostgreSQL Index Experiment Report");
    println!(
        "  Server: {} | Rows: {} | Seed: {}",
        meta.server_version, meta.dataset_rows, meta.generation.seed
    );
    println!(
        "  Warmup runs: {} | Measured runs: {}",
        meta.experiment.warmup_runs, meta.experiment.measured_runs
    );
    match &meta.load {
        Some(load) => println!(
            "  Load: {} rows in {:.2}s ({:.0} rows/sec)",
            load.rows,
            load.elapsed.as_secs_f64(),
            load.rows_per_sec()
        ),
        None => println!("  Load: reused existing dataset"),
    }
    println!("{}", "=".repeat(80));

    for variant in &report.variants {
        println!(
            "\n  Variant: {} | Status: {}",
            variant.variant,
            variant.status.label()
        );
        if let Some(cause) = variant.status.cause() {
            println!("  Cause: {cause}");
        }
        if variant.pairs.is_empty() {
            continue;
        }
        println!("  {}", "-".repeat(76));
        println!(
            "  {:26} {:>9} {:>9} {:>9} {:>5}  {}",
            "Query", "p50 (ms)", "p95 (ms)", "p99 (ms)", "Fail", "Plan"
        );
        for pair in &variant.pairs {
            let s = &pair.stats;
            match (&pair.measurement.status, &s.latency) {
                (PairStatus::NotApplicable { reason }, _) => println!(
                    "  {:26} {:>9}   ({reason})",
                    pair.measurement.query, "n/a"
                ),
                (status, Some(l)) => {
                    let mut plan = s.scan_path.clone().unwrap_or_default();
                    if let Some(index) = &s.index_name {
                        plan.push_str(&format!(" [{index}]"));
                    }
                    if !s.plan_shape_stable {
                        plan.push_str(" (unstable)");
                    }
                    if let Some(cause) = status.cause() {
                        plan.push_str(&format!(" ABORTED: {cause}"));
                    }
                    println!(
                        "  {:26} {:>9.3} {:>9.3} {:>9.3} {:>5}  {}",
                        pair.measurement.query, l.p50, l.p95, l.p99, s.failures, plan
                    );
                }
                (status, None) => println!(
                    "  {:26} {:>9} {:>9} {:>9} {:>5}  FAILED: {}",
                    pair.measurement.query,
                    "-",
                    "-",
                    "-",
                    s.failures,
                    status.cause().unwrap_or("no successful runs")
                ),
            }
        }
    }

    println!("\n{}", "=".repeat(80));

    // Comparison against the first variant (normally the baseline)
    let Some(first) = report.variants.first() else {
        println!();
        return;
    };
    if report.variants.len() >= 2 {
        println!("\n  Comparison Summary (p50 relative to {}):", first.variant);
        println!(
            "  {:48} {:>12} {:>10}",
            "Variant / Query", "p50 (ms)", "Speedup"
        );
        println!("  {}", "-".repeat(72));
        for variant in report.variants.iter().skip(1) {
            for pair in &variant.pairs {
                let Some(l) = &pair.stats.latency else {
                    continue;
                };
                let base = first
                    .pair(&pair.measurement.query)
                    .and_then(|p| p.stats.latency.as_ref())
                    .map(|b| b.p50);
                let speedup = match base {
                    Some(b) if l.p50 > 0.0 => format!("{:.2}x", b / l.p50),
                    _ => "-".to_string(),
                };
                let label = format!("{}/{}", variant.variant, pair.measurement.query);
                println!("  {:48} {:>12.3} {:>10}", label, l.p50, speedup);
            }
        }
    }

    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_are_quoted_only_when_needed() {
        assert_eq!(csv_field("Seq Scan"), "Seq Scan");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("two\nlines"), "\"two\nlines\"");
    }

    #[test]
    fn csv_line_joins_and_terminates() {
        let line = csv_line(&["V0".into(), "x,y".into(), String::new()]);
        assert_eq!(line, "V0,\"x,y\",\n");
    }

    #[test]
    fn run_directories_never_collide() {
        let root = tempfile::tempdir().unwrap();
        let first = create_run_dir(root.path(), "20250101T000000Z").unwrap();
        let second = create_run_dir(root.path(), "20250101T000000Z").unwrap();
        assert_ne!(first, second);
        assert!(second.ends_with("20250101T000000Z-1"));
    }
}
