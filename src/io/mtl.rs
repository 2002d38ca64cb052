use crate::types::{ForestError, ForestResult};
use std::path::Path;

/// A single `KEY = VALUE` line of a Landsat MTL file
#[derive(Debug, Clone, PartialEq)]
pub struct MtlEntry {
    pub key: String,
    pub value: String,
    /// 1-based line number in the source text
    pub line: usize,
}

/// Landsat Collection-2 MTL metadata (line-oriented `KEY = VALUE` text)
///
/// Only key lookup is supported; GROUP / END_GROUP nesting is ignored and
/// entries are kept in document order, since several keys repeat across
/// the Level-1 and Level-2 groups.
#[derive(Debug, Clone, Default)]
pub struct MtlDocument {
    entries: Vec<MtlEntry>,
}

impl MtlDocument {
    pub fn parse(text: &str) -> Self {
        let entries = text
            .lines()
            .enumerate()
            .filter_map(|(idx, raw)| {
                let (key, value) = raw.split_once('=')?;
                let key = key.trim();
                if key.is_empty() || key.contains(char::is_whitespace) {
                    return None;
                }
                Some(MtlEntry {
                    key: key.to_string(),
                    value: value.trim().trim_matches('"').to_string(),
                    line: idx + 1,
                })
            })
            .collect::<Vec<_>>();

        log::debug!("Parsed {} MTL entries", entries.len());
        Self { entries }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> ForestResult<Self> {
        log::info!("Reading scene metadata: {}", path.as_ref().display());
        let text = std::fs::read_to_string(path.as_ref())?;
        Ok(Self::parse(&text))
    }

    pub fn entries(&self) -> &[MtlEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries whose key equals `key` exactly, in document order.
    ///
    /// `RADIANCE_MULT_BAND_1` never matches `RADIANCE_MULT_BAND_10`.
    pub fn find_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a MtlEntry> + 'a {
        self.entries.iter().filter(move |e| e.key == key)
    }

    /// Raw value of the last entry named `key`
    pub fn last_value(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.key == key)
            .map(|e| e.value.as_str())
    }

    /// Numeric value of the last entry named `key`
    pub fn last_f64(&self, key: &str) -> ForestResult<f64> {
        let raw = self
            .last_value(key)
            .ok_or_else(|| ForestError::MissingMetadataKey(key.to_string()))?;
        parse_number(key, raw)
    }
}

pub(crate) fn parse_number(key: &str, raw: &str) -> ForestResult<f64> {
    raw.parse::<f64>().map_err(|e| {
        ForestError::InvalidFormat(format!("metadata value for {} is not numeric ({}): {}", key, raw, e))
    })
}
