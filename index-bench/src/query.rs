//! Query templates, parameter binding and the built-in query battery.
//!
//! Templates use `:name` placeholders, compiled once to PostgreSQL's `$n`
//! form. `::type` casts and quoted text are left alone. A parameter is either a
//! literal or a cursor fed from the last row of the previous run of the same
//! (variant, query) pair, which is how keyset pagination walks forward.

use crate::config::{from_json_file, validate_name, GenerationConfig, PaginationConfig};
use crate::error::{ConfigError, QueryError};
use crate::storage::Row;
use bench_core::types::SqlValue;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamSource {
    Literal(SqlValue),
    /// Take `column` from the last row of the previous run; `initial` before
    /// the first run and whenever a run returns no rows.
    Cursor { column: String, initial: SqlValue },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub name: String,
    pub statement: String,
    /// Placeholder name → value source, in declaration order.
    #[serde(default)]
    pub bindings: Vec<(String, ParamSource)>,
    /// Columns the active schema must have for the query to be meaningful.
    #[serde(default)]
    pub requires_columns: Vec<String>,
}

impl QuerySpec {
    pub fn new(name: &str, statement: &str) -> Self {
        Self {
            name: name.to_string(),
            statement: statement.to_string(),
            bindings: Vec::new(),
            requires_columns: Vec::new(),
        }
    }

    pub fn literal(mut self, param: &str, value: impl Into<SqlValue>) -> Self {
        self.bindings
            .push((param.to_string(), ParamSource::Literal(value.into())));
        self
    }

    pub fn cursor(mut self, param: &str, column: &str, initial: impl Into<SqlValue>) -> Self {
        self.bindings.push((
            param.to_string(),
            ParamSource::Cursor {
                column: column.to_string(),
                initial: initial.into(),
            },
        ));
        self
    }

    pub fn requires(mut self, column: &str) -> Self {
        self.requires_columns.push(column.to_string());
        self
    }

    fn binding(&self, param: &str) -> Option<&ParamSource> {
        self.bindings
            .iter()
            .find(|(name, _)| name == param)
            .map(|(_, source)| source)
    }

    /// Every placeholder is bound and every binding is used.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_name("queries", &self.name)?;
        let err = |detail: String| ConfigError::Query {
            query: self.name.clone(),
            detail,
        };
        let compiled = compile(&self.statement);
        for param in &compiled.params {
            if self.binding(param).is_none() {
                return Err(err(format!("placeholder :{param} has no binding")));
            }
        }
        for (name, _) in &self.bindings {
            if !compiled.params.contains(name) {
                return Err(err(format!("binding {name:?} is not used by the statement")));
            }
        }
        Ok(())
    }
}

/// A template rewritten to positional form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledQuery {
    pub sql: String,
    /// Placeholder names; `params[i]` is bound to `$i+1`.
    pub params: Vec<String>,
}

/// Rewrite `:name` placeholders to `$n`. Repeated names share one position.
pub fn compile(statement: &str) -> CompiledQuery {
    let chars: Vec<char> = statement.chars().collect();
    let mut sql = String::with_capacity(statement.len() + 8);
    let mut params: Vec<String> = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' => {
                // Quoted run; a doubled quote is an escaped quote.
                sql.push(c);
                i += 1;
                while i < chars.len() {
                    sql.push(chars[i]);
                    if chars[i] == c {
                        if chars.get(i + 1) == Some(&c) {
                            sql.push(c);
                            i += 2;
                            continue;
                        }
                        i += 1;
                        break;
                    }
                    i += 1;
                }
            }
            ':' if chars.get(i + 1) == Some(&':') => {
                sql.push_str("::");
                i += 2;
            }
            ':' if chars
                .get(i + 1)
                .is_some_and(|n| n.is_ascii_alphabetic() || *n == '_') =>
            {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_')
                {
                    end += 1;
                }
                let name: String = chars[start..end].iter().collect();
                let position = match params.iter().position(|p| *p == name) {
                    Some(pos) => pos,
                    None => {
                        params.push(name);
                        params.len() - 1
                    }
                };
                sql.push_str(&format!("${}", position + 1));
                i = end;
            }
            _ => {
                sql.push(c);
                i += 1;
            }
        }
    }
    CompiledQuery { sql, params }
}

/// Per-pair execution state: the compiled statement plus current cursor values.
#[derive(Debug, Clone)]
pub struct BoundQuery<'q> {
    spec: &'q QuerySpec,
    compiled: CompiledQuery,
    cursors: BTreeMap<String, SqlValue>,
}

impl<'q> BoundQuery<'q> {
    pub fn new(spec: &'q QuerySpec) -> Self {
        let mut bound = Self {
            spec,
            compiled: compile(&spec.statement),
            cursors: BTreeMap::new(),
        };
        bound.reset();
        bound
    }

    pub fn sql(&self) -> &str {
        &self.compiled.sql
    }

    pub fn has_cursors(&self) -> bool {
        !self.cursors.is_empty()
    }

    /// Parameter values for the next run, in `$n` order.
    pub fn params(&self) -> Result<Vec<SqlValue>, QueryError> {
        self.compiled
            .params
            .iter()
            .map(|name| match self.spec.binding(name) {
                Some(ParamSource::Literal(value)) => Ok(value.clone()),
                Some(ParamSource::Cursor { .. }) => self
                    .cursors
                    .get(name)
                    .cloned()
                    .ok_or_else(|| QueryError::MissingParameter(name.clone())),
                None => Err(QueryError::MissingParameter(name.clone())),
            })
            .collect()
    }

    /// Feed the rows of the run just finished into the cursors.
    pub fn advance(&mut self, rows: &[Row]) {
        let Some(last) = rows.last() else {
            debug!("{}: empty page, cursors reset", self.spec.name);
            self.reset();
            return;
        };
        for (param, source) in &self.spec.bindings {
            if let ParamSource::Cursor { column, initial } = source {
                let value = last.get(column).cloned().unwrap_or_else(|| initial.clone());
                self.cursors.insert(param.clone(), value);
            }
        }
    }

    fn reset(&mut self) {
        for (param, source) in &self.spec.bindings {
            if let ParamSource::Cursor { initial, .. } = source {
                self.cursors.insert(param.clone(), initial.clone());
            }
        }
    }
}

/// Read a JSON array of [`QuerySpec`]s to use in place of the built-in
/// battery. Names must be unique and every spec must validate.
pub fn load_queries(path: &Path) -> Result<Vec<QuerySpec>, ConfigError> {
    let queries: Vec<QuerySpec> = from_json_file(path)?;
    if queries.is_empty() {
        return Err(ConfigError::invalid(
            "queries",
            format!("{} defines no queries", path.display()),
        ));
    }
    let mut seen = BTreeSet::new();
    for query in &queries {
        query.validate()?;
        if !seen.insert(query.name.as_str()) {
            return Err(ConfigError::invalid(
                "queries",
                format!("duplicate query {:?}", query.name),
            ));
        }
    }
    Ok(queries)
}

/// Pick `names` out of `catalog` in the requested order. Empty selects all.
pub fn select_queries(catalog: &[QuerySpec], names: &[String]) -> Result<Vec<QuerySpec>, ConfigError> {
    if names.is_empty() {
        return Ok(catalog.to_vec());
    }
    names
        .iter()
        .map(|name| {
            catalog
                .iter()
                .find(|q| &q.name == name)
                .cloned()
                .ok_or_else(|| {
                    let available: Vec<&str> = catalog.iter().map(|q| q.name.as_str()).collect();
                    ConfigError::invalid(
                        "queries",
                        format!("unknown query {name:?}; available: {}", available.join(", ")),
                    )
                })
        })
        .collect()
}

/// The fixed battery, with parameters derived from the dataset definition so
/// that every token searched for is one the generator actually injects.
pub fn builtin_queries(data: &GenerationConfig, page: &PaginationConfig) -> Vec<QuerySpec> {
    let inj = &data.token_injection;
    let common = inj
        .common_tokens
        .first()
        .cloned()
        .unwrap_or_default();
    let rare_prefix = inj.rare_tokens.prefix.clone();
    let rare_token = inj.rare_tokens.token(inj.rare_tokens.start);
    let category = data.dominant_category().unwrap_or_default().to_string();
    let limit = page.limit as i64;
    let offset = page.offset as i64;

    vec![
        QuerySpec::new(
            "Q1_name_substring",
            "SELECT id, name, brand, category FROM products WHERE name ILIKE :pattern",
        )
        .literal("pattern", format!("%{rare_prefix}%")),
        QuerySpec::new(
            "Q2_name_common",
            "SELECT id, name, brand, category FROM products WHERE name ILIKE :pattern",
        )
        .literal("pattern", format!("%{common}%")),
        QuerySpec::new(
            "Q3_search_text_substring",
            "SELECT id, name, brand, category FROM products WHERE search_text LIKE :pattern",
        )
        .literal("pattern", format!("%{}%", common.to_lowercase()))
        .requires("search_text"),
        QuerySpec::new(
            "Q4_search_plus_filter",
            "SELECT id, name, brand, category FROM products \
             WHERE search_text LIKE :pattern AND category = :category",
        )
        .literal("pattern", format!("%{}%", common.to_lowercase()))
        .literal("category", category)
        .requires("search_text"),
        QuerySpec::new(
            "Q5_offset_pagination",
            "SELECT id, name FROM products ORDER BY name, id OFFSET :offset LIMIT :limit",
        )
        .literal("offset", offset)
        .literal("limit", limit),
        QuerySpec::new(
            "Q6_keyset_pagination",
            "SELECT id, name FROM products \
             WHERE (name, id) > (:last_name, :last_id::uuid) \
             ORDER BY name, id LIMIT :limit",
        )
        .cursor("last_name", "name", "")
        .cursor("last_id", "id", uuid::Uuid::nil().to_string())
        .literal("limit", limit),
        QuerySpec::new(
            "Q7_fts_search",
            "SELECT id, name FROM products \
             WHERE search_vector @@ plainto_tsquery('simple', :query)",
        )
        .literal("query", common)
        .requires("search_vector"),
        QuerySpec::new(
            "Q8_fts_rare",
            "SELECT id, name FROM products \
             WHERE search_vector @@ plainto_tsquery('simple', :query)",
        )
        .literal("query", rare_token)
        .requires("search_vector"),
    ]
}
