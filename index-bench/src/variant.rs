//! Index variants and the controller that applies them one at a time.
//!
//! A variant is a pair of scripts: `apply_sql` creates its indexes (and any
//! generated columns they need), `revert_sql` removes them again. The
//! controller owns the "currently applied variant" as a value; applying while
//! another variant is applied is refused.

use crate::config::validate_name;
use crate::error::{ConfigError, VariantError};
use crate::load::TABLE;
use crate::storage::{SchemaSnapshot, Storage};
use log::{debug, info, warn};
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariantSpec {
    pub name: String,
    pub apply_sql: String,
    pub revert_sql: String,
}

impl VariantSpec {
    pub fn new(name: &str, apply_sql: &str, revert_sql: &str) -> Self {
        Self {
            name: name.to_string(),
            apply_sql: apply_sql.to_string(),
            revert_sql: revert_sql.to_string(),
        }
    }

    /// DDL statements that fail when re-run against a schema that already
    /// has (or already lacks) their object, as `apply: <stmt>` or
    /// `revert: <stmt>`. [`VariantController::recover`] re-runs `revert_sql`
    /// after a failed revert.
    pub fn unguarded_statements(&self) -> Vec<String> {
        let mut found = Vec::new();
        for (script, sql) in [("apply", &self.apply_sql), ("revert", &self.revert_sql)] {
            for stmt in sql.split(';') {
                let text = stmt.split_whitespace().collect::<Vec<_>>().join(" ");
                let upper = text.to_uppercase();
                let alters = upper.starts_with("ALTER TABLE ");
                let creates = upper.starts_with("CREATE INDEX ")
                    || upper.starts_with("CREATE UNIQUE INDEX ")
                    || (alters && upper.contains(" ADD COLUMN "));
                let drops = upper.starts_with("DROP INDEX ")
                    || (alters && upper.contains(" DROP COLUMN "));
                let unguarded = (creates && !upper.contains(" IF NOT EXISTS "))
                    || (drops && !upper.contains(" IF EXISTS "));
                if unguarded {
                    found.push(format!("{script}: {text}"));
                }
            }
        }
        found
    }
}

/// The built-in strategies, baseline first.
pub fn builtin_variants() -> Vec<VariantSpec> {
    vec![
        VariantSpec::new("V0_baseline", "", ""),
        VariantSpec::new(
            "V1_btree_name",
            "CREATE INDEX IF NOT EXISTS idx_products_name_btree ON products (name);",
            "DROP INDEX IF EXISTS idx_products_name_btree;",
        ),
        VariantSpec::new(
            "V2_trgm_name",
            "CREATE INDEX IF NOT EXISTS idx_products_name_trgm \
             ON products USING gin (name gin_trgm_ops);",
            "DROP INDEX IF EXISTS idx_products_name_trgm;",
        ),
        VariantSpec::new(
            "V3_search_text_trgm",
            "ALTER TABLE products ADD COLUMN IF NOT EXISTS search_text text \
             GENERATED ALWAYS AS (lower(name || ' ' || brand || ' ' || category || ' ' || description)) STORED;\n\
             CREATE INDEX IF NOT EXISTS idx_products_search_text_trgm \
             ON products USING gin (search_text gin_trgm_ops);",
            "DROP INDEX IF EXISTS idx_products_search_text_trgm;\n\
             ALTER TABLE products DROP COLUMN IF EXISTS search_text;",
        ),
        VariantSpec::new(
            "V4_fts",
            "ALTER TABLE products ADD COLUMN IF NOT EXISTS search_vector tsvector \
             GENERATED ALWAYS AS (to_tsvector('simple', name || ' ' || description)) STORED;\n\
             CREATE INDEX IF NOT EXISTS idx_products_search_vector \
             ON products USING gin (search_vector);",
            "DROP INDEX IF EXISTS idx_products_search_vector;\n\
             ALTER TABLE products DROP COLUMN IF EXISTS search_vector;",
        ),
        VariantSpec::new(
            "V5_keyset_btree",
            "CREATE INDEX IF NOT EXISTS idx_products_name_id ON products (name, id);",
            "DROP INDEX IF EXISTS idx_products_name_id;",
        ),
    ]
}

/// Discover `<dir>/<name>/{up.sql,down.sql}` pairs, sorted by name.
///
/// Subdirectories missing either script are ignored.
pub fn load_variants_from_dir(dir: &Path) -> Result<Vec<VariantSpec>, ConfigError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| ConfigError::Io { path, source }
    };
    let mut variants = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err(dir))? {
        let entry = entry.map_err(io_err(dir))?;
        let path = entry.path();
        let (up, down) = (path.join("up.sql"), path.join("down.sql"));
        if !path.is_dir() || !up.is_file() || !down.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        validate_name("variants", &name)?;
        let read = |p: &Path| {
            std::fs::read_to_string(p)
                .map(|s| s.trim_start_matches('\u{feff}').to_string())
                .map_err(io_err(p))
        };
        let variant = VariantSpec {
            name,
            apply_sql: read(&up)?,
            revert_sql: read(&down)?,
        };
        for stmt in variant.unguarded_statements() {
            warn!(
                "Variant {}: not re-runnable without IF [NOT] EXISTS: {stmt}",
                variant.name
            );
        }
        variants.push(variant);
    }
    variants.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(variants)
}

/// Pick `names` out of `catalog` in the requested order. Empty selects all.
pub fn select_variants(
    catalog: &[VariantSpec],
    names: &[String],
) -> Result<Vec<VariantSpec>, ConfigError> {
    if names.is_empty() {
        return Ok(catalog.to_vec());
    }
    names
        .iter()
        .map(|name| {
            catalog
                .iter()
                .find(|v| &v.name == name)
                .cloned()
                .ok_or_else(|| {
                    let available: Vec<&str> = catalog.iter().map(|v| v.name.as_str()).collect();
                    ConfigError::invalid(
                        "variants",
                        format!("unknown variant {name:?}; available: {}", available.join(", ")),
                    )
                })
        })
        .collect()
}

// ── Controller ──────────────────────────────────────────────────────

/// Proof that a variant is applied. Handed out by
/// [`VariantController::apply`], required to measure, consumed by
/// [`VariantController::revert`].
#[derive(Debug)]
pub struct ActiveVariant {
    name: String,
    schema: SchemaSnapshot,
}

impl ActiveVariant {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Table schema as it stood right after apply.
    pub fn schema(&self) -> &SchemaSnapshot {
        &self.schema
    }
}

struct Applied {
    spec: VariantSpec,
    before: Option<SchemaSnapshot>,
}

pub struct VariantController {
    verify_isolation: bool,
    active: Option<Applied>,
}

impl VariantController {
    pub fn new(verify_isolation: bool) -> Self {
        Self {
            verify_isolation,
            active: None,
        }
    }

    pub fn active_name(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.spec.name.as_str())
    }

    /// Apply `spec` in one transaction and refresh statistics.
    ///
    /// A failed script leaves nothing behind. A failed statistics refresh
    /// reverts the variant before the error is returned; if that revert also
    /// fails the variant stays recorded as applied for [`recover`](Self::recover).
    pub async fn apply(
        &mut self,
        storage: &mut dyn Storage,
        spec: &VariantSpec,
    ) -> Result<ActiveVariant, VariantError> {
        if let Some(active) = self.active_name() {
            return Err(VariantError::AlreadyActive {
                active: active.to_string(),
                requested: spec.name.clone(),
            });
        }
        let apply_err = |source| VariantError::Apply {
            variant: spec.name.clone(),
            source,
        };

        let before = if self.verify_isolation {
            Some(storage.schema_snapshot(TABLE).await.map_err(apply_err)?)
        } else {
            None
        };

        info!("Applying variant {}...", spec.name);
        if !spec.apply_sql.trim().is_empty() {
            storage
                .execute_transaction(&spec.apply_sql)
                .await
                .map_err(apply_err)?;
        }
        self.active = Some(Applied {
            spec: spec.clone(),
            before,
        });

        if let Err(source) = storage.refresh_statistics(TABLE).await {
            warn!("Statistics refresh after applying {} failed: {source}", spec.name);
            self.revert_on_failed_apply(storage).await;
            return Err(VariantError::StatisticsRefresh {
                variant: spec.name.clone(),
                source,
            });
        }

        match storage.schema_snapshot(TABLE).await {
            Ok(schema) => {
                debug!(
                    "Variant {} active with indexes [{}]",
                    spec.name,
                    schema.indexes.keys().cloned().collect::<Vec<_>>().join(", ")
                );
                Ok(ActiveVariant {
                    name: spec.name.clone(),
                    schema,
                })
            }
            Err(source) => {
                self.revert_on_failed_apply(storage).await;
                Err(apply_err(source))
            }
        }
    }

    async fn revert_on_failed_apply(&mut self, storage: &mut dyn Storage) {
        if let Err(err) = self.revert_active(storage).await {
            warn!("Immediate revert failed: {err}");
        }
    }

    /// Revert the variant `token` stands for, in one transaction, then
    /// refresh statistics and (if enabled) verify the schema matches its
    /// pre-apply snapshot.
    pub async fn revert(
        &mut self,
        storage: &mut dyn Storage,
        token: ActiveVariant,
    ) -> Result<(), VariantError> {
        if self.active_name() != Some(token.name()) {
            return Err(VariantError::NotActive {
                variant: token.name,
            });
        }
        self.revert_active(storage).await
    }

    /// Revert whatever is still applied. Returns the reverted variant's name.
    pub async fn recover(
        &mut self,
        storage: &mut dyn Storage,
    ) -> Result<Option<String>, VariantError> {
        let Some(name) = self.active_name().map(str::to_string) else {
            return Ok(None);
        };
        warn!("Recovering: reverting variant {name}");
        self.revert_active(storage).await?;
        Ok(Some(name))
    }

    async fn revert_active(&mut self, storage: &mut dyn Storage) -> Result<(), VariantError> {
        let Some(applied) = self.active.as_ref() else {
            return Ok(());
        };
        let name = applied.spec.name.clone();
        let revert_err = |source| VariantError::Revert {
            variant: name.clone(),
            source,
        };

        info!("Reverting variant {name}...");
        if !applied.spec.revert_sql.trim().is_empty() {
            // Still applied if this fails.
            storage
                .execute_transaction(&applied.spec.revert_sql)
                .await
                .map_err(revert_err)?;
        }
        let before = self.active.take().and_then(|a| a.before);

        storage
            .refresh_statistics(TABLE)
            .await
            .map_err(revert_err)?;

        if let Some(before) = before {
            let after = storage.schema_snapshot(TABLE).await.map_err(revert_err)?;
            if let Some(diff) = after.diff(&before) {
                return Err(VariantError::NotIsolated {
                    variant: name.clone(),
                    diff,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn builtin_catalog_starts_with_empty_baseline() {
        let catalog = builtin_variants();
        assert_eq!(catalog[0].name, "V0_baseline");
        assert!(catalog[0].apply_sql.is_empty());
        for variant in &catalog {
            validate_name("variants", &variant.name).unwrap();
        }
    }

    #[test]
    fn every_created_index_is_dropped_on_revert() {
        for variant in builtin_variants() {
            for word in variant.apply_sql.split_whitespace() {
                if word.starts_with("idx_") {
                    assert!(
                        variant.revert_sql.contains(word),
                        "{} does not drop {word}",
                        variant.name
                    );
                }
            }
        }
    }

    #[test]
    fn selection_keeps_requested_order_and_rejects_unknown_names() {
        let catalog = builtin_variants();
        let picked =
            select_variants(&catalog, &["V2_trgm_name".into(), "V0_baseline".into()]).unwrap();
        let names: Vec<&str> = picked.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, ["V2_trgm_name", "V0_baseline"]);

        assert_eq!(select_variants(&catalog, &[]).unwrap().len(), catalog.len());
        assert!(select_variants(&catalog, &["V9_missing".into()]).is_err());
    }

    #[test]
    fn directory_variants_are_sorted_and_need_both_scripts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["V2_b", "V1_a"] {
            let vdir = dir.path().join(name);
            fs::create_dir(&vdir).unwrap();
            fs::write(vdir.join("up.sql"), format!("\u{feff}-- up {name}")).unwrap();
            fs::write(vdir.join("down.sql"), format!("-- down {name}")).unwrap();
        }
        let incomplete = dir.path().join("V3_up_only");
        fs::create_dir(&incomplete).unwrap();
        fs::write(incomplete.join("up.sql"), "SELECT 1;").unwrap();
        fs::write(dir.path().join("README"), "not a variant").unwrap();

        let variants = load_variants_from_dir(dir.path()).unwrap();
        let names: Vec<&str> = variants.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, ["V1_a", "V2_b"]);
        assert_eq!(variants[0].apply_sql, "-- up V1_a");
        assert_eq!(variants[1].revert_sql, "-- down V2_b");
    }

    #[test]
    fn builtin_scripts_are_all_guarded() {
        for variant in builtin_variants() {
            let unguarded = variant.unguarded_statements();
            assert!(unguarded.is_empty(), "{}: {unguarded:?}", variant.name);
        }
    }

    #[test]
    fn unguarded_ddl_is_reported_but_still_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let v = dir.path().join("V7_brand");
        fs::create_dir(&v).unwrap();
        fs::write(
            v.join("up.sql"),
            "create index idx_products_brand\n  on products (brand);\n\
             ALTER TABLE products ADD COLUMN IF NOT EXISTS brand_lower text;",
        )
        .unwrap();
        fs::write(
            v.join("down.sql"),
            "DROP INDEX idx_products_brand;\nALTER TABLE products DROP COLUMN brand_lower;",
        )
        .unwrap();

        let variants = load_variants_from_dir(dir.path()).unwrap();
        assert_eq!(variants.len(), 1);
        assert_eq!(
            variants[0].unguarded_statements(),
            [
                "apply: create index idx_products_brand on products (brand)",
                "revert: DROP INDEX idx_products_brand",
                "revert: ALTER TABLE products DROP COLUMN brand_lower",
            ]
        );
    }
}
