//! Experiment runner: dataset once, then every variant in order.
//!
//! A variant's own failures (apply, revert, individual runs) are flagged in
//! its report and the run moves on. Configuration and load errors, lifecycle
//! misuse and cancellation end the experiment.

use crate::config::{ExperimentConfig, GenerationConfig};
use crate::error::{ConfigError, ExperimentError, VariantError};
use crate::generate::generate;
use crate::load::{self, LoadStats};
use crate::measure::{measure, PairMeasurement};
use crate::query::{builtin_queries, select_queries, QuerySpec};
use crate::stats::{aggregate, VariantQueryStats};
use crate::storage::Storage;
use crate::variant::{select_variants, ActiveVariant, VariantController, VariantSpec};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared stop flag, checked between runs.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), ExperimentError> {
        if self.is_cancelled() {
            return Err(ExperimentError::Cancelled);
        }
        Ok(())
    }

    /// Cancel on Ctrl-C. The current run finishes, the active variant is
    /// reverted, then the experiment stops.
    pub fn install_ctrlc_handler(&self) -> Result<(), ctrlc::Error> {
        let flag = self.0.clone();
        ctrlc::set_handler(move || {
            if !flag.load(Ordering::SeqCst) {
                warn!("Interrupted. Finishing the current run and reverting...");
            } else {
                warn!("Already stopping, waiting for the revert to finish");
            }
            flag.store(true, Ordering::SeqCst);
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VariantStatus {
    Measured,
    /// Nothing was measured.
    ApplyFailed { cause: String },
    /// Measurements are kept; later variants may not be isolated from this one.
    RevertFailed { cause: String },
    /// Never applied because an earlier variant could not be cleaned up.
    Skipped { reason: String },
}

impl VariantStatus {
    pub fn label(&self) -> &'static str {
        match self {
            VariantStatus::Measured => "measured",
            VariantStatus::ApplyFailed { .. } => "apply_failed",
            VariantStatus::RevertFailed { .. } => "revert_failed",
            VariantStatus::Skipped { .. } => "skipped",
        }
    }

    pub fn cause(&self) -> Option<&str> {
        match self {
            VariantStatus::Measured => None,
            VariantStatus::ApplyFailed { cause } | VariantStatus::RevertFailed { cause } => {
                Some(cause)
            }
            VariantStatus::Skipped { reason } => Some(reason),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PairReport {
    #[serde(flatten)]
    pub measurement: PairMeasurement,
    pub stats: VariantQueryStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct VariantReport {
    pub variant: String,
    #[serde(flatten)]
    pub status: VariantStatus,
    pub pairs: Vec<PairReport>,
}

impl VariantReport {
    fn new(variant: &str, status: VariantStatus) -> Self {
        Self {
            variant: variant.to_string(),
            status,
            pairs: Vec::new(),
        }
    }

    pub fn pair(&self, query: &str) -> Option<&PairReport> {
        self.pairs.iter().find(|p| p.measurement.query == query)
    }
}

/// Conditions the numbers were taken under.
#[derive(Debug, Clone, Serialize)]
pub struct RunMetadata {
    pub harness_version: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub server_version: String,
    pub dataset_rows: u64,
    /// `None` when an existing dataset was reused.
    pub load: Option<LoadStats>,
    pub generation: GenerationConfig,
    pub experiment: ExperimentConfig,
    pub variants: Vec<VariantSpec>,
    pub queries: Vec<QuerySpec>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentReport {
    pub metadata: RunMetadata,
    pub variants: Vec<VariantReport>,
}

impl ExperimentReport {
    pub fn variant(&self, name: &str) -> Option<&VariantReport> {
        self.variants.iter().find(|v| v.variant == name)
    }
}

pub struct Experiment {
    generation: GenerationConfig,
    settings: ExperimentConfig,
    variants: Vec<VariantSpec>,
    queries: Vec<QuerySpec>,
    reuse_dataset: bool,
}

impl Experiment {
    /// Validate both configurations and resolve the variant and query
    /// selections against their catalogs, with the built-in query battery.
    /// Never touches storage.
    pub fn new(
        generation: GenerationConfig,
        settings: ExperimentConfig,
        variant_catalog: &[VariantSpec],
    ) -> Result<Self, ConfigError> {
        let query_catalog = builtin_queries(&generation, &settings.pagination);
        Self::with_catalogs(generation, settings, variant_catalog, &query_catalog)
    }

    /// Like [`Experiment::new`], selecting queries from `query_catalog`
    /// instead of the built-in battery.
    pub fn with_catalogs(
        generation: GenerationConfig,
        settings: ExperimentConfig,
        variant_catalog: &[VariantSpec],
        query_catalog: &[QuerySpec],
    ) -> Result<Self, ConfigError> {
        generation.validate()?;
        settings.validate()?;
        let variants = select_variants(variant_catalog, &settings.variants)?;
        let queries = select_queries(query_catalog, &settings.queries)?;
        for query in &queries {
            query.validate()?;
        }
        Ok(Self {
            generation,
            settings,
            variants,
            queries,
            reuse_dataset: false,
        })
    }

    /// Skip generation and load; the table must already hold `row_count` rows.
    pub fn reuse_dataset(mut self, reuse: bool) -> Self {
        self.reuse_dataset = reuse;
        self
    }

    pub fn variants(&self) -> &[VariantSpec] {
        &self.variants
    }

    pub fn queries(&self) -> &[QuerySpec] {
        &self.queries
    }

    pub async fn run(
        &self,
        storage: &mut dyn Storage,
        cancel: &Cancellation,
    ) -> Result<ExperimentReport, ExperimentError> {
        let started_at = Utc::now();
        let server_version = storage
            .server_version()
            .await
            .map_err(ExperimentError::Session)?;
        cancel.check()?;

        let (dataset_rows, load_stats) = if self.reuse_dataset {
            let rows = load::verify_existing(storage, self.generation.row_count).await?;
            (rows, None)
        } else {
            let stats = load::load(storage, generate(&self.generation)?).await?;
            (stats.rows, Some(stats))
        };

        let mut controller = VariantController::new(self.settings.verify_isolation);
        let mut reports = Vec::with_capacity(self.variants.len());
        let mut halted: Option<String> = None;

        for spec in &self.variants {
            if let Some(reason) = &halted {
                warn!("Skipping variant {}: {reason}", spec.name);
                reports.push(VariantReport::new(
                    &spec.name,
                    VariantStatus::Skipped {
                        reason: reason.clone(),
                    },
                ));
                continue;
            }
            cancel.check()?;

            let active = match controller.apply(storage, spec).await {
                Ok(active) => active,
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) => {
                    error!("{err}");
                    reports.push(VariantReport::new(
                        &spec.name,
                        VariantStatus::ApplyFailed {
                            cause: err.to_string(),
                        },
                    ));
                    if controller.active_name().is_some() {
                        halted = Self::recover(storage, &mut controller).await;
                    }
                    continue;
                }
            };

            let pairs = match self.measure_variant(storage, &active, cancel).await {
                Ok(pairs) => pairs,
                Err(err) => {
                    let _ = Self::recover(storage, &mut controller).await;
                    return Err(err);
                }
            };

            let status = match controller.revert(storage, active).await {
                Ok(()) => VariantStatus::Measured,
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) => {
                    error!("{err}");
                    if controller.active_name().is_some() {
                        halted = Self::recover(storage, &mut controller).await;
                    } else if matches!(err, VariantError::NotIsolated { .. }) {
                        halted = Some(format!("schema was not restored after {}", spec.name));
                    }
                    VariantStatus::RevertFailed {
                        cause: err.to_string(),
                    }
                }
            };
            reports.push(VariantReport {
                variant: spec.name.clone(),
                status,
                pairs,
            });
        }

        Ok(ExperimentReport {
            metadata: RunMetadata {
                harness_version: env!("CARGO_PKG_VERSION").to_string(),
                started_at,
                finished_at: Utc::now(),
                server_version,
                dataset_rows,
                load: load_stats,
                generation: self.generation.clone(),
                experiment: self.settings.clone(),
                variants: self.variants.clone(),
                queries: self.queries.clone(),
            },
            variants: reports,
        })
    }

    async fn measure_variant(
        &self,
        storage: &mut dyn Storage,
        active: &ActiveVariant,
        cancel: &Cancellation,
    ) -> Result<Vec<PairReport>, ExperimentError> {
        info!("Measuring {} queries under {}", self.queries.len(), active.name());
        let mut pairs = Vec::with_capacity(self.queries.len());
        for query in &self.queries {
            let measurement = measure(
                storage,
                active,
                query,
                self.settings.warmup_runs,
                self.settings.measured_runs,
                cancel,
            )
            .await?;
            let stats = aggregate(&measurement.runs);
            pairs.push(PairReport { measurement, stats });
        }
        Ok(pairs)
    }

    /// One attempt to revert whatever is still applied. Returns why later
    /// variants must be skipped, if they must.
    async fn recover(storage: &mut dyn Storage, controller: &mut VariantController) -> Option<String> {
        match controller.recover(storage).await {
            Ok(_) => None,
            Err(err) => {
                error!("Recovery failed: {err}");
                match controller.active_name() {
                    Some(name) => Some(format!(
                        "variant {name} is still applied after a failed revert"
                    )),
                    None => matches!(err, VariantError::NotIsolated { .. })
                        .then(|| format!("schema was not restored: {err}")),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::builtin_variants;

    #[test]
    fn cancellation_is_shared_between_clones() {
        let cancel = Cancellation::new();
        let handle = cancel.clone();
        assert!(cancel.check().is_ok());
        handle.cancel();
        assert!(cancel.is_cancelled());
        assert!(matches!(cancel.check(), Err(ExperimentError::Cancelled)));
    }

    #[test]
    fn default_experiment_selects_every_builtin() {
        let experiment = Experiment::new(
            GenerationConfig::default(),
            ExperimentConfig::default(),
            &builtin_variants(),
        )
        .unwrap();
        assert_eq!(experiment.variants().len(), builtin_variants().len());
        assert_eq!(experiment.queries().len(), 8);
    }

    #[test]
    fn unknown_selection_is_a_configuration_error() {
        let settings = ExperimentConfig {
            queries: vec!["Q99_missing".into()],
            ..ExperimentConfig::default()
        };
        let result = Experiment::new(GenerationConfig::default(), settings, &builtin_variants());
        assert!(result.is_err());
    }

    #[test]
    fn status_labels_and_causes() {
        assert_eq!(VariantStatus::Measured.label(), "measured");
        assert_eq!(VariantStatus::Measured.cause(), None);
        let skipped = VariantStatus::Skipped {
            reason: "earlier revert failed".into(),
        };
        assert_eq!(skipped.label(), "skipped");
        assert_eq!(skipped.cause(), Some("earlier revert failed"));
    }
}
