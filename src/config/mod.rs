//! Target and custom-query configuration.
//!
//! The exporter scrapes one or more PostgreSQL instances declared in a YAML
//! file. Each target carries its own DSN and an ordered list of custom
//! queries; declaration order is preserved through the whole scrape cycle.

use anyhow::{Context, Result, bail};
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::collectors::custom::normalize_name;

/// Labels attached to every custom query series by the engine itself; a
/// declared label hint must not shadow them.
const RESERVED_LABELS: &[&str] = &["metric", "database", "dbinstance", "rownum"];

/// One monitored database instance. Identity is `(name, instance)`.
#[derive(Clone, Debug, Deserialize)]
pub struct Target {
    /// Display name, matched exactly against the `target` query parameter.
    pub name: String,

    /// Instance name, exposed as the `dbinstance` label.
    pub instance: String,

    /// Connection string, never logged.
    pub dsn: SecretString,

    /// Declared ad-hoc queries, run in order after the fixed collectors.
    #[serde(default)]
    pub queries: Vec<CustomQuery>,
}

/// A user-declared SQL statement plus naming hints for which result columns
/// are metrics vs. labels. The hints are matched against the actual result-set
/// column names after normalization, so case and punctuation may differ.
#[derive(Clone, Debug, Deserialize)]
pub struct CustomQuery {
    pub name: String,

    #[serde(default)]
    pub help: String,

    pub sql: String,

    /// Column names holding numeric values; one series is emitted per
    /// (row, metric column) pair.
    #[serde(default)]
    pub metrics: Vec<String>,

    /// Column names copied into the label set of every emitted series.
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    targets: Vec<Target>,
}

/// Load and validate the target configuration from a YAML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, is not valid YAML, or fails
/// validation (duplicate target identity, queries without SQL or metric
/// columns, label hints that collapse to the same normalized name).
pub fn load(path: &Path) -> Result<Vec<Target>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;

    validate(&config.targets)?;

    Ok(config.targets)
}

fn validate(targets: &[Target]) -> Result<()> {
    if targets.is_empty() {
        bail!("config declares no targets");
    }

    let mut seen = HashSet::new();

    // Family names are derived from normalized query names, so two distinct
    // declared names collapsing to one family would fail registration on
    // every scrape of the instance. Same declared name on several targets is
    // fine, that is a shared family.
    let mut family_names: HashMap<String, String> = HashMap::new();

    for target in targets {
        if target.name.trim().is_empty() || target.instance.trim().is_empty() {
            bail!("targets must declare a non-empty name and instance");
        }

        if !seen.insert((target.name.clone(), target.instance.clone())) {
            bail!(
                "duplicate target identity {}/{}",
                target.name,
                target.instance
            );
        }

        for query in &target.queries {
            validate_query(target, query)?;

            let normalized = normalize_name(&query.name);
            match family_names.get(&normalized) {
                Some(existing) if existing != &query.name => {
                    bail!(
                        "queries '{existing}' and '{}' collapse to the same metric family name '{normalized}'",
                        query.name
                    );
                }
                Some(_) => {}
                None => {
                    family_names.insert(normalized, query.name.clone());
                }
            }
        }
    }

    Ok(())
}

fn validate_query(target: &Target, query: &CustomQuery) -> Result<()> {
    let where_ = format!("query '{}' of target {}", query.name, target.name);

    if normalize_name(&query.name).is_empty() {
        bail!("{where_}: name must contain at least one alphanumeric character");
    }

    if query.sql.trim().is_empty() {
        bail!("{where_}: sql must not be empty");
    }

    if query.metrics.is_empty() {
        bail!("{where_}: at least one metric column must be declared");
    }

    // Normalized label names become Prometheus label names on one family, so
    // two hints must not collapse to the same name.
    let mut label_names = HashSet::new();
    for label in &query.labels {
        let normalized = normalize_name(label);
        if normalized.is_empty() {
            bail!("{where_}: label '{label}' normalizes to an empty name");
        }
        if RESERVED_LABELS.contains(&normalized.as_str()) {
            bail!("{where_}: label '{label}' collides with the reserved label '{normalized}'");
        }
        if !label_names.insert(normalized) {
            bail!("{where_}: label '{label}' duplicates another label after normalization");
        }
    }

    Ok(())
}
