//! Deterministic synthetic `products` dataset.
//!
//! Every record is a pure function of `(config, row_index)`: each row seeds its
//! own ChaCha8 stream from a SHA-256 digest of the seed and the row index, so
//! row *i* is identical whether it is produced first, last, or on its own.
//! Categorical draws go through position-indexed cumulative tables; nothing in
//! the sampling path iterates a hashed container.

use crate::config::{GenerationConfig, InjectionField};
use crate::error::ConfigError;
use chrono::{DateTime, SecondsFormat, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Column order of the `COPY` target; [`encode_csv_row`] writes fields in
/// exactly this order.
pub const COLUMNS: [&str; 7] = [
    "id",
    "name",
    "brand",
    "category",
    "description",
    "created_at",
    "updated_at",
];

// Vocabulary is part of the dataset definition: changing it changes every row.

const ADJECTIVES: &[&str] = &[
    "smoky", "crispy", "zesty", "hearty", "sweet", "savory", "tangy", "bright", "roasted",
    "toasted", "herbed", "sliced", "chunky", "creamy", "bold",
];

const NOUNS: &[&str] = &[
    "chips", "soup", "sauce", "tea", "coffee", "broth", "granola", "mix", "bites", "snacks",
    "spread", "berries", "greens", "protein", "vitamins",
];

const QUALIFIERS: &[&str] = &[
    "family size",
    "single serve",
    "value pack",
    "low sodium",
    "no sugar",
    "extra hot",
    "limited batch",
    "stone ground",
    "farm style",
];

const FILLER: &[&str] = &[
    "crafted", "selected", "quality", "ingredients", "from", "trusted", "sources", "packed",
    "for", "everyday", "meals", "quick", "snacking", "great", "taste", "balanced", "flavor",
    "kitchen", "pantry", "ready", "to", "enjoy",
];

/// One generated row. Field order matches [`COLUMNS`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyntheticRecord {
    pub id: Uuid,
    pub name: String,
    pub brand: String,
    pub category: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyntheticRecord {
    /// Whitespace-separated words across every text field.
    pub fn words(&self) -> impl Iterator<Item = &str> {
        [&self.name, &self.brand, &self.category, &self.description]
            .into_iter()
            .flat_map(|field| field.split_whitespace())
    }
}

// ── Weighted sampling ───────────────────────────────────────────────

/// Samples from an ordered weight table.
///
/// Weights are normalised by their sum. An entry with weight zero occupies an
/// empty interval of the cumulative table and can never be returned.
#[derive(Debug, Clone)]
pub struct WeightedPicker<T> {
    items: Vec<T>,
    cumulative: Vec<f64>,
    total: f64,
    last_positive: usize,
}

impl<T> WeightedPicker<T> {
    /// `None` when the table is empty or carries no positive weight.
    pub fn new(table: impl IntoIterator<Item = (T, f64)>) -> Option<Self> {
        let mut items = Vec::new();
        let mut cumulative = Vec::new();
        let mut total = 0.0;
        let mut last_positive = None;
        for (i, (item, weight)) in table.into_iter().enumerate() {
            let weight = if weight.is_finite() { weight.max(0.0) } else { 0.0 };
            if weight > 0.0 {
                last_positive = Some(i);
            }
            total += weight;
            items.push(item);
            cumulative.push(total);
        }
        Some(Self {
            items,
            cumulative,
            total,
            last_positive: last_positive?,
        })
    }

    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> &T {
        let x = rng.gen::<f64>() * self.total;
        // First entry whose cumulative bound lies strictly above x.
        let idx = self.cumulative.partition_point(|&c| c <= x);
        &self.items[idx.min(self.last_positive)]
    }
}

// ── Generator ───────────────────────────────────────────────────────

/// Validated config plus the samplers derived from it.
pub struct Generator<'a> {
    config: &'a GenerationConfig,
    brands: WeightedPicker<&'a str>,
    categories: WeightedPicker<&'a str>,
    fields: WeightedPicker<InjectionField>,
}

impl<'a> Generator<'a> {
    pub fn new(config: &'a GenerationConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let picker = |field: &str, table: &'a [(String, f64)]| {
            WeightedPicker::new(table.iter().map(|(v, w)| (v.as_str(), *w))).ok_or_else(|| {
                ConfigError::ZeroWeights {
                    field: field.to_string(),
                }
            })
        };
        Ok(Self {
            config,
            brands: picker("distributions.brand", &config.distributions.brand)?,
            categories: picker("distributions.category", &config.distributions.category)?,
            fields: WeightedPicker::new(config.token_injection.field_weights.iter().copied())
                .ok_or_else(|| ConfigError::ZeroWeights {
                    field: "token_injection.field_weights".to_string(),
                })?,
        })
    }

    /// Record `row` of the dataset, computed without touching other rows
    /// (a near duplicate recomputes its source's base name).
    pub fn record(&self, row: u64) -> SyntheticRecord {
        let cfg = self.config;
        let mut rng = stream(cfg.seed, row, "row");

        let id = row_uuid(cfg.seed, row);
        let created_at = cfg.timestamps.at(row).unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut brand = self.brands.pick(&mut rng).to_string();
        let mut category = self.categories.pick(&mut rng).to_string();

        let mut name = self.base_name(row);
        if row > 0 && rng.gen::<f64>() < cfg.near_duplicate_rate {
            let source = self.base_name(rng.gen_range(0..row));
            name = match rng.gen_range(0..3) {
                0 => format!("{source} {}", choose(&mut rng, QUALIFIERS)),
                1 => format!("{} {source}", choose(&mut rng, ADJECTIVES)),
                _ => format!("{source} - limited"),
            };
        }

        let mut description = self.description(&mut rng);

        let inj = &cfg.token_injection;
        if rng.gen::<f64>() < inj.common_rate {
            let token = inj.common_tokens[rng.gen_range(0..inj.common_tokens.len())].clone();
            let field = *self.fields.pick(&mut rng);
            inject(field, &token, &mut rng, &mut name, &mut description, &mut brand, &mut category);
        }
        if rng.gen::<f64>() < inj.rare_rate {
            let rare = &inj.rare_tokens;
            let token = rare.token(rng.gen_range(rare.start..=rare.end));
            let field = *self.fields.pick(&mut rng);
            inject(field, &token, &mut rng, &mut name, &mut description, &mut brand, &mut category);
        }

        SyntheticRecord {
            id,
            name,
            brand,
            category,
            description,
            created_at,
            updated_at: created_at,
        }
    }

    /// The templated name of `row` before near-duplication or injection.
    fn base_name(&self, row: u64) -> String {
        let mut rng = stream(self.config.seed, row, "name");
        let patterns = &self.config.name_patterns;
        let pattern = &patterns[rng.gen_range(0..patterns.len())];
        let adj = choose(&mut rng, ADJECTIVES);
        let noun = choose(&mut rng, NOUNS);
        let qualifier = choose(&mut rng, QUALIFIERS);
        let brandish = choose(&mut rng, ADJECTIVES);
        pattern
            .replace("{adj}", adj)
            .replace("{noun}", noun)
            .replace("{qualifier}", qualifier)
            .replace("{brandish}", brandish)
    }

    fn description(&self, rng: &mut ChaCha8Rng) -> String {
        let range = self.config.description_tokens;
        let target = rng.gen_range(range.min..=range.max) as usize;
        let mut tokens = Vec::with_capacity(target + 2);
        while tokens.len() < target {
            let word = match tokens.len() % 5 {
                0 => choose(rng, ADJECTIVES),
                1 => choose(rng, NOUNS),
                _ => choose(rng, FILLER),
            };
            tokens.push(word);
        }
        tokens.join(" ")
    }
}

fn choose<'v, R: Rng + ?Sized>(rng: &mut R, words: &[&'v str]) -> &'v str {
    words[rng.gen_range(0..words.len())]
}

fn stream(seed: u64, row: u64, domain: &str) -> ChaCha8Rng {
    let digest = Sha256::digest(format!("{domain}:{seed}:{row}").as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    ChaCha8Rng::from_seed(key)
}

fn row_uuid(seed: u64, row: u64) -> Uuid {
    let digest = Sha256::digest(format!("id:{seed}:{row}").as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    uuid::Builder::from_random_bytes(bytes).into_uuid()
}

fn inject(
    field: InjectionField,
    token: &str,
    rng: &mut ChaCha8Rng,
    name: &mut String,
    description: &mut String,
    brand: &mut String,
    category: &mut String,
) {
    match field {
        InjectionField::Name => *name = insert_word(name, token, rng),
        InjectionField::Description => *description = insert_word(description, token, rng),
        InjectionField::Brand => {
            brand.push(' ');
            brand.push_str(token);
        }
        InjectionField::Category => {
            category.push(' ');
            category.push_str(token);
        }
    }
}

/// Insert `token` at a word boundary chosen by `rng`.
fn insert_word(text: &str, token: &str, rng: &mut ChaCha8Rng) -> String {
    let mut words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return token.to_string();
    }
    let pos = rng.gen_range(0..=words.len());
    words.insert(pos, token);
    words.join(" ")
}

/// Lazy, exact-length record sequence returned by [`generate`].
pub struct Records<'a> {
    generator: Generator<'a>,
    next: u64,
    end: u64,
}

impl Iterator for Records<'_> {
    type Item = SyntheticRecord;

    fn next(&mut self) -> Option<SyntheticRecord> {
        if self.next >= self.end {
            return None;
        }
        let record = self.generator.record(self.next);
        self.next += 1;
        Some(record)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = usize::try_from(self.end - self.next).unwrap_or(usize::MAX);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Records<'_> {}

/// All `row_count` records of the dataset, in row order.
pub fn generate(config: &GenerationConfig) -> Result<Records<'_>, ConfigError> {
    Ok(Records {
        generator: Generator::new(config)?,
        next: 0,
        end: config.row_count,
    })
}

// ── CSV encoding ────────────────────────────────────────────────────

/// Append one `COPY ... (FORMAT csv)` line for `record` to `buf`.
///
/// Every field is quoted, so an empty string never reads back as NULL.
pub fn encode_csv_row(record: &SyntheticRecord, buf: &mut Vec<u8>) {
    let id = record.id.hyphenated().to_string();
    let created = record.created_at.to_rfc3339_opts(SecondsFormat::Secs, true);
    let updated = record.updated_at.to_rfc3339_opts(SecondsFormat::Secs, true);
    let fields: [&str; 7] = [
        &id,
        &record.name,
        &record.brand,
        &record.category,
        &record.description,
        &created,
        &updated,
    ];
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            buf.push(b',');
        }
        buf.push(b'"');
        for &b in field.as_bytes() {
            if b == b'"' {
                buf.push(b'"');
            }
            buf.push(b);
        }
        buf.push(b'"');
    }
    buf.push(b'\n');
}

/// Groups encoded rows into chunks of roughly `chunk_bytes`.
pub struct CsvChunks<I> {
    records: I,
    chunk_bytes: usize,
}

impl<I: Iterator<Item = SyntheticRecord>> CsvChunks<I> {
    pub fn new(records: I, chunk_bytes: usize) -> Self {
        Self {
            records,
            chunk_bytes: chunk_bytes.max(1),
        }
    }
}

impl<I: Iterator<Item = SyntheticRecord>> Iterator for CsvChunks<I> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.chunk_bytes + 512);
        for record in self.records.by_ref() {
            encode_csv_row(&record, &mut buf);
            if buf.len() >= self.chunk_bytes {
                break;
            }
        }
        (!buf.is_empty()).then_some(buf)
    }
}
