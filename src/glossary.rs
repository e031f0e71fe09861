//! Attribute Glossary
//!
//! Optional human descriptions for columns and their coded values, loaded from
//! a JSON file:
//!
//! ```json
//! {
//!   "columns": { "detailedUsage": "detailed building usage" },
//!   "codes": { "detailedUsage": { "401": "office", "402": "shop" } }
//! }
//! ```
//!
//! Flattened attribute paths such as `riskAttribute|LandSlideRisk|areaType`
//! fall back to their last segment.

use crate::error::{GeoSqlError, Result};
use crate::execution::ColumnInfo;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::info;

/// Most code values listed per column in a description.
const MAX_CODES_LISTED: usize = 12;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttributeGlossary {
    #[serde(default)]
    columns: HashMap<String, String>,
    #[serde(default)]
    codes: HashMap<String, BTreeMap<String, String>>,
}

impl AttributeGlossary {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            GeoSqlError::Config(format!("cannot read glossary {}: {}", path.display(), e))
        })?;
        let glossary: Self = serde_json::from_str(&text)?;
        info!(
            "Loaded glossary from {} ({} columns, {} code lists)",
            path.display(),
            glossary.columns.len(),
            glossary.codes.len()
        );
        Ok(glossary)
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty() && self.codes.is_empty()
    }

    fn lookup<'a, T>(map: &'a HashMap<String, T>, column: &str) -> Option<&'a T> {
        map.get(column).or_else(|| {
            let last = column.rsplit('|').next()?;
            if last == column {
                None
            } else {
                map.get(last)
            }
        })
    }

    /// Description for `column`, including a short code list when one exists.
    pub fn describe(&self, column: &str) -> Option<String> {
        let text = Self::lookup(&self.columns, column).cloned();
        let codes = Self::lookup(&self.codes, column).map(|codes| {
            let mut listed: Vec<String> = codes
                .iter()
                .take(MAX_CODES_LISTED)
                .map(|(code, meaning)| format!("{}={}", code, meaning))
                .collect();
            if codes.len() > MAX_CODES_LISTED {
                listed.push("...".to_string());
            }
            format!("codes: {}", listed.join(", "))
        });
        match (text, codes) {
            (Some(t), Some(c)) => Some(format!("{} ({})", t, c)),
            (Some(t), None) => Some(t),
            (None, Some(c)) => Some(c),
            (None, None) => None,
        }
    }

    /// Fill in descriptions for columns that have none yet.
    pub fn annotate(&self, columns: &mut [ColumnInfo]) {
        for column in columns.iter_mut().filter(|c| c.description.is_none()) {
            column.description = self.describe(&column.name);
        }
    }

    /// Meaning of a coded value, if listed.
    pub fn decode(&self, column: &str, code: &str) -> Option<&str> {
        Self::lookup(&self.codes, column)
            .and_then(|codes| codes.get(code))
            .map(|s| s.as_str())
    }
}
