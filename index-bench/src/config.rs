//! Typed configuration for dataset generation and experiment runs.
//!
//! Both configs deserialize from JSON (every field optional, falling back to
//! [`Default`]) and must pass `validate()` before storage is touched.

use crate::error::ConfigError;
use chrono::{DateTime, TimeDelta, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Ordered `(value, weight)` pairs. Position, not value, keys the sampling
/// table, so the order here is part of the dataset definition.
pub type WeightTable = Vec<(String, f64)>;

/// Placeholders a name pattern may use.
pub const NAME_PLACEHOLDERS: [&str; 4] = ["{adj}", "{noun}", "{qualifier}", "{brandish}"];

// ── Generation ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub seed: u64,
    pub row_count: u64,
    pub distributions: Distributions,
    pub token_injection: TokenInjection,
    pub description_tokens: TokenRange,
    pub near_duplicate_rate: f64,
    pub timestamps: Timestamps,
    pub name_patterns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Distributions {
    pub brand: WeightTable,
    pub category: WeightTable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenInjection {
    /// Probability that a row receives a common marker token.
    pub common_rate: f64,
    /// Probability that a row receives a rare marker token. Independent of
    /// `common_rate`.
    pub rare_rate: f64,
    /// Where injected tokens land.
    pub field_weights: Vec<(InjectionField, f64)>,
    pub common_tokens: Vec<String>,
    pub rare_tokens: RareTokens,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionField {
    Name,
    Description,
    Brand,
    Category,
}

/// Rare markers are `prefix` followed by a zero-padded number in
/// `start..=end`, e.g. `rare-000042`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RareTokens {
    pub prefix: String,
    pub start: u32,
    pub end: u32,
    pub width: usize,
}

impl RareTokens {
    pub fn token(&self, n: u32) -> String {
        format!("{}{:0width$}", self.prefix, n, width = self.width)
    }
}

/// Inclusive bounds on the number of filler tokens in a description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRange {
    pub min: u32,
    pub max: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamps {
    pub base_utc: DateTime<Utc>,
    pub step_seconds: i64,
}

impl Timestamps {
    /// `created_at` of `row`, or `None` when it cannot be represented.
    pub fn at(&self, row: u64) -> Option<DateTime<Utc>> {
        let offset = i64::try_from(row).ok()?.checked_mul(self.step_seconds)?;
        self.base_utc.checked_add_signed(TimeDelta::try_seconds(offset)?)
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            row_count: 1_000_000,
            distributions: Distributions {
                brand: weights(&[
                    ("acme", 0.30),
                    ("northwind", 0.25),
                    ("globex", 0.20),
                    ("initech", 0.15),
                    ("umbrella", 0.10),
                ]),
                category: weights(&[
                    ("snacks", 0.35),
                    ("beverages", 0.25),
                    ("pantry", 0.20),
                    ("frozen", 0.12),
                    ("household", 0.08),
                ]),
            },
            token_injection: TokenInjection::default(),
            description_tokens: TokenRange { min: 20, max: 60 },
            near_duplicate_rate: 0.05,
            timestamps: Timestamps {
                // 2025-01-01T00:00:00Z
                base_utc: DateTime::from_timestamp(1_735_689_600, 0).unwrap_or_default(),
                step_seconds: 60,
            },
            name_patterns: vec![
                "{adj} {noun}".to_string(),
                "{adj} {noun} {qualifier}".to_string(),
                "{brandish} {noun} {qualifier}".to_string(),
                "{brandish} {adj} {noun}".to_string(),
            ],
        }
    }
}

impl Default for TokenInjection {
    fn default() -> Self {
        Self {
            common_rate: 0.30,
            rare_rate: 0.002,
            field_weights: vec![
                (InjectionField::Name, 0.25),
                (InjectionField::Description, 0.75),
            ],
            common_tokens: [
                "organic", "chicken", "gluten", "natural", "spicy", "classic", "premium",
                "fresh", "healthy", "seasoned",
            ]
            .iter()
            .map(|t| t.to_string())
            .collect(),
            rare_tokens: RareTokens {
                prefix: "rare-".to_string(),
                start: 1,
                end: 20_000,
                width: 6,
            },
        }
    }
}

fn weights(pairs: &[(&str, f64)]) -> WeightTable {
    pairs.iter().map(|(v, w)| (v.to_string(), *w)).collect()
}

impl GenerationConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = from_json_file(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_weights("distributions.brand", &self.distributions.brand)?;
        validate_weights("distributions.category", &self.distributions.category)?;

        let inj = &self.token_injection;
        validate_rate("token_injection.common_rate", inj.common_rate)?;
        validate_rate("token_injection.rare_rate", inj.rare_rate)?;
        validate_rate("near_duplicate_rate", self.near_duplicate_rate)?;

        let fields: Vec<(String, f64)> = inj
            .field_weights
            .iter()
            .map(|(f, w)| (format!("{f:?}").to_lowercase(), *w))
            .collect();
        validate_weights("token_injection.field_weights", &fields)?;

        if inj.common_tokens.is_empty() {
            return Err(ConfigError::invalid(
                "token_injection.common_tokens",
                "at least one common token is required",
            ));
        }
        if let Some(bad) = inj
            .common_tokens
            .iter()
            .find(|t| t.is_empty() || t.contains(char::is_whitespace))
        {
            return Err(ConfigError::invalid(
                "token_injection.common_tokens",
                format!("{bad:?} must be a single non-empty word"),
            ));
        }

        let rare = &inj.rare_tokens;
        if rare.start > rare.end {
            return Err(ConfigError::invalid(
                "token_injection.rare_tokens",
                format!("start ({}) must be <= end ({})", rare.start, rare.end),
            ));
        }
        if rare.width == 0 {
            return Err(ConfigError::invalid(
                "token_injection.rare_tokens.width",
                "must be > 0",
            ));
        }

        if self.description_tokens.min > self.description_tokens.max {
            return Err(ConfigError::invalid(
                "description_tokens",
                format!(
                    "min ({}) must be <= max ({})",
                    self.description_tokens.min, self.description_tokens.max
                ),
            ));
        }

        if self.timestamps.step_seconds <= 0 {
            return Err(ConfigError::invalid(
                "timestamps.step_seconds",
                "must be > 0",
            ));
        }
        let last_row = self.row_count.saturating_sub(1);
        if self.timestamps.at(last_row).is_none() {
            return Err(ConfigError::invalid(
                "timestamps",
                format!(
                    "base_utc + {last_row} * {}s is outside the representable range",
                    self.timestamps.step_seconds
                ),
            ));
        }

        if self.name_patterns.is_empty() {
            return Err(ConfigError::invalid(
                "name_patterns",
                "at least one pattern is required",
            ));
        }
        for pattern in &self.name_patterns {
            let stripped = NAME_PLACEHOLDERS
                .iter()
                .fold(pattern.clone(), |acc, p| acc.replace(p, ""));
            if stripped.contains('{') || stripped.contains('}') {
                return Err(ConfigError::invalid(
                    "name_patterns",
                    format!("{pattern:?} uses an unknown placeholder"),
                ));
            }
        }
        Ok(())
    }

    /// The category with the largest weight; the earliest entry wins ties.
    pub fn dominant_category(&self) -> Option<&str> {
        let mut best: Option<&(String, f64)> = None;
        for entry in &self.distributions.category {
            if best.map_or(true, |b| entry.1 > b.1) {
                best = Some(entry);
            }
        }
        best.map(|(value, _)| value.as_str())
    }
}

fn validate_rate(field: &str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::InvalidRate {
            field: field.to_string(),
            value,
        });
    }
    Ok(())
}

fn validate_weights(field: &str, table: &[(String, f64)]) -> Result<(), ConfigError> {
    if table.is_empty() {
        return Err(ConfigError::EmptyWeights {
            field: field.to_string(),
        });
    }
    for (entry, weight) in table {
        if !weight.is_finite() || *weight < 0.0 {
            return Err(ConfigError::InvalidWeight {
                field: field.to_string(),
                entry: entry.clone(),
                weight: *weight,
            });
        }
    }
    if table.iter().map(|(_, w)| w).sum::<f64>() <= 0.0 {
        return Err(ConfigError::ZeroWeights {
            field: field.to_string(),
        });
    }
    Ok(())
}

// ── Experiment ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub warmup_runs: u32,
    pub measured_runs: u32,
    /// Variant names to run, in order. Empty runs the whole catalog.
    pub variants: Vec<String>,
    /// Query names to run, in order. Empty runs the whole battery.
    pub queries: Vec<String>,
    pub session: SessionConfig,
    pub pagination: PaginationConfig,
    /// Compare index/column snapshots before apply and after revert.
    pub verify_isolation: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub timezone: String,
    /// Server-side `statement_timeout` for measured queries; 0 disables it.
    /// Load, vacuum, variant DDL and statistics refresh always run without it.
    pub statement_timeout_ms: u64,
    /// `SET jit`; `None` leaves the server default.
    pub jit: Option<bool>,
    /// Client-side bound on queries, snapshots and session setup.
    pub call_timeout_ms: u64,
    /// Client-side bound on load, vacuum, variant DDL and statistics
    /// refresh; 0 waits indefinitely.
    pub ddl_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaginationConfig {
    pub offset: u64,
    pub limit: u64,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            warmup_runs: 5,
            measured_runs: 30,
            variants: Vec::new(),
            queries: Vec::new(),
            session: SessionConfig::default(),
            pagination: PaginationConfig::default(),
            verify_isolation: true,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            statement_timeout_ms: 0,
            jit: Some(false),
            call_timeout_ms: 120_000,
            ddl_timeout_ms: 0,
        }
    }
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            offset: 100,
            limit: 25,
        }
    }
}

impl SessionConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn ddl_timeout(&self) -> Option<Duration> {
        (self.ddl_timeout_ms > 0).then(|| Duration::from_millis(self.ddl_timeout_ms))
    }
}

impl ExperimentConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = from_json_file(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_names("variants", &self.variants)?;
        validate_names("queries", &self.queries)?;

        let tz = &self.session.timezone;
        if tz.is_empty()
            || !tz
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "_/+-:".contains(c))
        {
            return Err(ConfigError::invalid(
                "session.timezone",
                format!("{tz:?} is not a valid time zone name"),
            ));
        }
        if self.session.call_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "session.call_timeout_ms",
                "must be > 0",
            ));
        }
        if self.pagination.limit == 0 {
            return Err(ConfigError::invalid("pagination.limit", "must be > 0"));
        }
        Ok(())
    }
}

/// Variant and query names double as file names in the results directory.
pub fn validate_name(field: &str, name: &str) -> Result<(), ConfigError> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ConfigError::invalid(
            field,
            format!("{name:?} must be non-empty and use only [A-Za-z0-9_-]"),
        ));
    }
    Ok(())
}

fn validate_names(field: &str, names: &[String]) -> Result<(), ConfigError> {
    for (i, name) in names.iter().enumerate() {
        validate_name(field, name)?;
        if names[..i].contains(name) {
            return Err(ConfigError::invalid(
                field,
                format!("{name:?} is listed twice"),
            ));
        }
    }
    Ok(())
}

pub fn from_json_file<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(text.trim_start_matches('\u{feff}')).map_err(|source| {
        ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        }
    })
}
