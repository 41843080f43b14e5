//! Brand table storage and loading
//!
//! The brand table is a JSON array of brand records. Array order is the
//! canonical brand order used to break confidence ties.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Stable brand identifier (e.g. `"maggi"`, `"cocacola"`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BrandId(String);

impl BrandId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BrandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BrandId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A known brand
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrandRecord {
    /// Stable identifier
    pub id: BrandId,
    /// Human readable name
    #[serde(rename = "name")]
    pub display_name: String,
    /// Textual spellings matched case-insensitively against OCR text
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Extra reference logo images for the visual detector
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<PathBuf>,
}

impl BrandRecord {
    pub fn new(id: &str, display_name: &str, aliases: &[&str]) -> Self {
        Self {
            id: BrandId::new(id),
            display_name: display_name.to_string(),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
            references: Vec::new(),
        }
    }

    /// Display name followed by aliases, without case-insensitive duplicates
    pub fn match_names(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        std::iter::once(self.display_name.as_str())
            .chain(self.aliases.iter().map(String::as_str))
            .filter(|name| !name.trim().is_empty())
            .filter(|name| seen.insert(name.to_lowercase()))
            .collect()
    }
}

/// Immutable, ordered set of brand records
#[derive(Debug, Clone)]
pub struct BrandTable {
    brands: Vec<BrandRecord>,
}

impl BrandTable {
    /// Build a table, validating ids
    pub fn new(brands: Vec<BrandRecord>) -> Result<Self> {
        let mut ids = HashSet::new();
        let mut brands = brands;

        for brand in &mut brands {
            if brand.id.as_str().trim().is_empty() {
                bail!("Brand '{}' has an empty id", brand.display_name);
            }
            if !ids.insert(brand.id.clone()) {
                bail!("Duplicate brand id '{}'", brand.id);
            }
            if brand.aliases.is_empty() {
                warn!("Brand '{}' has no aliases, using name only", brand.id);
                brand.aliases.push(brand.display_name.clone());
            }
        }

        Ok(Self { brands })
    }

    /// Built-in default brand table
    pub fn builtin() -> Self {
        let brands = vec![
            BrandRecord::new("amul", "Amul", &["Amul"]),
            BrandRecord::new("parle", "Parle", &["Parle", "Parle-G", "Parle G"]),
            BrandRecord::new("britannia", "Britannia", &["Britannia"]),
            BrandRecord::new("nestle", "Nestlé", &["Nestle", "Nestlé"]),
            BrandRecord::new("maggi", "Maggi", &["Maggi", "MAGGI"]),
            BrandRecord::new("aashirvaad", "Aashirvaad", &["Aashirvaad", "ITC"]),
            BrandRecord::new("hul", "Hindustan Unilever", &["HUL", "Hindustan Unilever", "Unilever"]),
            BrandRecord::new("dabur", "Dabur", &["Dabur"]),
            BrandRecord::new("patanjali", "Patanjali", &["Patanjali"]),
            BrandRecord::new("godrej", "Godrej", &["Godrej"]),
            BrandRecord::new("marico", "Marico", &["Marico"]),
            BrandRecord::new("colgate", "Colgate", &["Colgate"]),
            BrandRecord::new("himalaya", "Himalaya", &["Himalaya"]),
            BrandRecord::new("cocacola", "Coca-Cola", &["Coca Cola", "Coca-Cola", "Coke"]),
            BrandRecord::new("pepsi", "PepsiCo", &["Pepsi", "PepsiCo"]),
        ];
        Self { brands }
    }

    pub fn iter(&self) -> impl Iterator<Item = &BrandRecord> {
        self.brands.iter()
    }

    pub fn get(&self, id: &BrandId) -> Option<&BrandRecord> {
        self.brands.iter().find(|b| &b.id == id)
    }

    /// Position of a brand in canonical order
    pub fn position(&self, id: &BrandId) -> Option<usize> {
        self.brands.iter().position(|b| &b.id == id)
    }

    pub fn len(&self) -> usize {
        self.brands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.brands.is_empty()
    }

    pub fn records(&self) -> &[BrandRecord] {
        &self.brands
    }
}

/// Load a brand table from a JSON file
pub fn load_brands(path: &Path) -> Result<BrandTable> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read brand table {:?}", path))?;
    let brands: Vec<BrandRecord> = serde_json::from_str(&content)
        .with_context(|| format!("Invalid brand table JSON in {:?}", path))?;
    BrandTable::new(brands)
}

/// Save a brand table to a JSON file
pub fn save_brands(table: &BrandTable, path: &Path) -> Result<()> {
    let content = serde_json::to_string_pretty(table.records())?;
    super::write_atomic(path, content.as_bytes())?;
    Ok(())
}

/// Load the brand table, writing the built-in table first if the file is missing
pub fn load_or_create_brands(path: &Path) -> Result<BrandTable> {
    if path.exists() {
        let table = load_brands(path)?;
        info!("Loaded {} brands from {:?}", table.len(), path);
        return Ok(table);
    }

    warn!("Brand table not found at {:?}, creating default", path);
    let table = BrandTable::builtin();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if let Err(e) = save_brands(&table, path) {
        warn!("Failed to write default brand table: {}", e);
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_builtin_table_is_valid() {
        let builtin = BrandTable::builtin();
        let revalidated = BrandTable::new(builtin.records().to_vec()).unwrap();
        assert_eq!(builtin.len(), revalidated.len());
        assert!(builtin.get(&BrandId::from("maggi")).is_some());
        assert!(builtin.get(&BrandId::from("cocacola")).is_some());
    }

    #[test]
    fn test_canonical_order_follows_file_order() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"id":"zeta","name":"Zeta","aliases":["Zeta"]}},
               {{"id":"alpha","name":"Alpha","aliases":["Alpha"]}}]"#
        )
        .unwrap();

        let table = load_brands(file.path()).unwrap();
        assert_eq!(table.position(&BrandId::from("zeta")), Some(0));
        assert_eq!(table.position(&BrandId::from("alpha")), Some(1));
    }

    #[test]
    fn test_missing_aliases_fall_back_to_name() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"[{{"id":"dabur","name":"Dabur"}}]"#).unwrap();

        let table = load_brands(file.path()).unwrap();
        let dabur = table.get(&BrandId::from("dabur")).unwrap();
        assert_eq!(dabur.aliases, vec!["Dabur".to_string()]);
    }

    #[test]
    fn test_missing_name_is_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"[{{"id":"dabur","aliases":["Dabur"]}}]"#).unwrap();
        assert!(load_brands(file.path()).is_err());
    }

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let result = BrandTable::new(vec![
            BrandRecord::new("amul", "Amul", &["Amul"]),
            BrandRecord::new("amul", "Amul Again", &["Amul"]),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_load_or_create_writes_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("brands.json");

        let created = load_or_create_brands(&path).unwrap();
        assert!(path.exists());

        let reloaded = load_brands(&path).unwrap();
        assert_eq!(created.len(), reloaded.len());
        let ids: Vec<_> = reloaded.iter().map(|b| b.id.as_str().to_string()).collect();
        let builtin_ids: Vec<_> = BrandTable::builtin()
            .iter()
            .map(|b| b.id.as_str().to_string())
            .collect();
        assert_eq!(ids, builtin_ids);
    }

    #[test]
    fn test_match_names_dedupes_case_insensitively() {
        let maggi = BrandRecord::new("maggi", "Maggi", &["Maggi", "MAGGI", "Maggi Noodles"]);
        assert_eq!(maggi.match_names(), vec!["Maggi", "Maggi Noodles"]);
    }
}
