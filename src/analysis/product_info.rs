//! Product label information from OCR text
//!
//! Pulls the product name, manufacturing date and expiry date out of
//! OCR lines. Fields that cannot be found are reported as `N/A`.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::storage::BrandTable;

/// Placeholder for fields not found in the text
pub const NOT_AVAILABLE: &str = "N/A";

/// `MMM-YYYY`, `MM-YYYY` or `MM/YYYY`
const DATE_PATTERN: &str = r"(\b[A-Za-z]{3}-\d{4}\b|\b\d{2}-\d{4}\b|\b\d{2}/\d{4}\b)";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductInfo {
    pub product_name: String,
    pub mfg_date: String,
    pub exp_date: String,
    pub product_type: String,
}

impl Default for ProductInfo {
    fn default() -> Self {
        Self {
            product_name: NOT_AVAILABLE.to_string(),
            mfg_date: NOT_AVAILABLE.to_string(),
            exp_date: NOT_AVAILABLE.to_string(),
            product_type: NOT_AVAILABLE.to_string(),
        }
    }
}

pub struct ProductInfoExtractor {
    mfg: Regex,
    exp: Regex,
    /// Lowercase keywords that identify the product name line
    keywords: Vec<String>,
}

impl ProductInfoExtractor {
    pub fn new(keywords: impl IntoIterator<Item = String>) -> Result<Self> {
        let mfg = Regex::new(&format!(r"(?i)\b(?:Mfg|Manufactured|Manufacture|Mfd|Prep)\b.*?{}", DATE_PATTERN))
            .context("Invalid manufacturing date pattern")?;
        let exp = Regex::new(&format!(r"(?i)\b(?:Exp|Expiry|Best Before|Use By)\b.*?{}", DATE_PATTERN))
            .context("Invalid expiry date pattern")?;

        let keywords = keywords
            .into_iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();

        Ok(Self { mfg, exp, keywords })
    }

    /// Extractor keyed on every brand name and alias
    pub fn for_brands(brands: &BrandTable) -> Result<Self> {
        Self::new(
            brands
                .iter()
                .flat_map(|b| b.match_names().into_iter().map(str::to_string).collect::<Vec<_>>()),
        )
    }

    pub fn extract(&self, text: &str) -> ProductInfo {
        let mut info = ProductInfo::default();
        let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();

        if let Some(line) = lines.iter().find(|line| self.has_keyword(line)) {
            info.product_name = line.to_string();
        }

        // Later lines override earlier ones, matching a top-to-bottom read of the label
        for line in &lines {
            if let Some(date) = capture_date(&self.mfg, line) {
                info.mfg_date = date;
            }
            if let Some(date) = capture_date(&self.exp, line) {
                info.exp_date = date;
            }
        }

        info
    }

    fn has_keyword(&self, line: &str) -> bool {
        let lower = line.to_lowercase();
        self.keywords.iter().any(|k| lower.contains(k.as_str()))
    }
}

fn capture_date(pattern: &Regex, line: &str) -> Option<String> {
    pattern
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}
