//! Entities (clubs) and the entity store
//!
//! The entity list is the unit of refresh: each run replaces it wholesale with
//! the list produced by the source spreadsheet export. The previous list is
//! kept on disk so the next run can diff against it.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::core::error::{Error, Result};
use crate::core::store::{read_json, StagedWrite};

/// Separator used in persisted matrix keys; forbidden inside names
pub const KEY_SEPARATOR: char = '|';

/// A named location with a postal address. Identity is `name`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub postal_code: String,
    #[serde(default)]
    pub city: String,
}

impl Entity {
    pub fn new(name: &str, address: &str, postal_code: &str, city: &str) -> Self {
        Self {
            name: name.to_string(),
            address: address.to_string(),
            postal_code: postal_code.to_string(),
            city: city.to_string(),
        }
    }

    /// Trimmed copy, with spreadsheet float postal codes ("5000.0") made integral
    pub fn normalized(&self) -> Self {
        Self {
            name: self.name.trim().to_string(),
            address: self.address.trim().to_string(),
            postal_code: normalize_postal_code(&self.postal_code),
            city: self.city.trim().to_string(),
        }
    }

    /// Whether the address fields differ from `other`
    pub fn address_differs(&self, other: &Entity) -> bool {
        self.address != other.address
            || self.postal_code != other.postal_code
            || self.city != other.city
    }
}

fn normalize_postal_code(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.parse::<f64>() {
        Ok(value) if value.fract() == 0.0 && value >= 0.0 && trimmed.contains('.') => {
            format!("{}", value as u64)
        }
        _ => trimmed.to_string(),
    }
}

/// Normalise a raw list and enforce the ingestion rules.
///
/// Blank-named rows are dropped. Names containing the key separator and
/// duplicated names are rejected, listing every offender.
pub fn normalize_entities(raw: Vec<Entity>) -> Result<Vec<Entity>> {
    let mut entities = Vec::with_capacity(raw.len());
    let mut seen = BTreeSet::new();
    let mut duplicates = BTreeSet::new();
    let mut with_separator = BTreeSet::new();

    for entity in raw {
        let entity = entity.normalized();
        if entity.name.is_empty() {
            debug!("Skipping row without a name");
            continue;
        }
        if entity.name.contains(KEY_SEPARATOR) {
            with_separator.insert(entity.name.clone());
        }
        if !seen.insert(entity.name.clone()) {
            duplicates.insert(entity.name.clone());
        }
        entities.push(entity);
    }

    if !with_separator.is_empty() {
        return Err(Error::InvalidInput(format!(
            "entity names must not contain '{KEY_SEPARATOR}': {}",
            join_names(&with_separator)
        )));
    }
    if !duplicates.is_empty() {
        return Err(Error::InvalidInput(format!(
            "duplicate entity names: {}",
            join_names(&duplicates)
        )));
    }

    Ok(entities)
}

fn join_names(names: &BTreeSet<String>) -> String {
    names
        .iter()
        .map(|n| format!("'{n}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Reader for the freshly exported entity list (`.json` or `.csv`)
#[derive(Debug, Clone)]
pub struct EntitySource {
    path: PathBuf,
}

/// CSV row as exported from the spreadsheet; every column optional
#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    postal_code: Option<String>,
    #[serde(default)]
    city: Option<String>,
}

/// JSON record as exported; fields may be missing, `null` or numeric
#[derive(Debug, Deserialize)]
struct JsonRow {
    #[serde(default)]
    name: Option<serde_json::Value>,
    #[serde(default)]
    address: Option<serde_json::Value>,
    #[serde(default)]
    postal_code: Option<serde_json::Value>,
    #[serde(default)]
    city: Option<serde_json::Value>,
}

fn field_text(value: Option<serde_json::Value>) -> String {
    match value {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(serde_json::Value::String(text)) => text,
        Some(other) => other.to_string(),
    }
}

impl EntitySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load and normalise the new entity list
    pub fn load(&self) -> Result<Vec<Entity>> {
        let is_csv = self
            .path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));

        let raw = if is_csv {
            self.load_csv()?
        } else {
            self.load_json()?
        };

        let entities = normalize_entities(raw)?;
        info!("📋 {} entities in {}", entities.len(), self.path.display());
        Ok(entities)
    }

    fn load_json(&self) -> Result<Vec<Entity>> {
        let rows = read_json::<Vec<JsonRow>>(&self.path)?.ok_or_else(|| {
            Error::InvalidInput(format!("entity source not found: {}", self.path.display()))
        })?;

        Ok(rows
            .into_iter()
            .map(|row| Entity {
                name: field_text(row.name),
                address: field_text(row.address),
                postal_code: field_text(row.postal_code),
                city: field_text(row.city),
            })
            .collect())
    }

    fn load_csv(&self) -> Result<Vec<Entity>> {
        let text = std::fs::read_to_string(&self.path)?;
        let text = text.trim_start_matches('\u{feff}');
        let header = text.lines().next().unwrap_or_default();
        let delimiter = if header.matches(';').count() > header.matches(',').count() {
            b';'
        } else {
            b','
        };

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(text.as_bytes());

        let mut entities = Vec::new();
        for row in reader.deserialize::<CsvRow>() {
            let row = row?;
            entities.push(Entity {
                name: row.name.unwrap_or_default(),
                address: row.address.unwrap_or_default(),
                postal_code: row.postal_code.unwrap_or_default(),
                city: row.city.unwrap_or_default(),
            });
        }
        Ok(entities)
    }
}

/// Persisted snapshot of the entity list from the previous run
#[derive(Debug, Clone)]
pub struct EntityStore {
    path: PathBuf,
}

impl EntityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Previous snapshot; empty on the first run
    pub fn load_previous(&self) -> Result<Vec<Entity>> {
        let entities = read_json::<Vec<Entity>>(&self.path)?.unwrap_or_default();
        Ok(entities.into_iter().map(|e| e.normalized()).collect())
    }

    /// Stage the new snapshot for the end-of-run commit
    pub fn stage(&self, entities: &[Entity]) -> Result<StagedWrite> {
        StagedWrite::json(&self.path, entities)
    }

    /// Write the snapshot immediately
    pub fn save(&self, entities: &[Entity]) -> Result<()> {
        self.stage(entities)?.commit()
    }
}
