use crate::types::{ForestError, ForestResult, SQUARE_METRES_PER_HECTARE};
use chrono::NaiveDate;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

/// pixel_count * x_res * y_res / 10 000
pub fn to_hectares(pixel_count: usize, x_res: f64, y_res: f64) -> f64 {
    pixel_count as f64 * x_res.abs() * y_res.abs() / SQUARE_METRES_PER_HECTARE
}

/// Write JSON next to the destination and rename it into place
pub fn write_json_atomic<T: Serialize, P: AsRef<Path>>(path: P, value: &T) -> ForestResult<()> {
    let path = path.as_ref();
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| ForestError::Io(e.error))?;

    log::debug!("Wrote {}", path.display());
    Ok(())
}

pub fn read_json<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> ForestResult<T> {
    let file = std::fs::File::open(path.as_ref())?;
    Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
}

/// One detection: forest area on a given acquisition date
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub date: NaiveDate,
    pub hectares: f64,
}

/// Append-only, date-ordered forest area record for one region
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForestCoverHistory {
    region_name: String,
    entries: Vec<HistoryEntry>,
}

impl ForestCoverHistory {
    pub fn new(region_name: impl Into<String>) -> Self {
        Self {
            region_name: region_name.into(),
            entries: Vec::new(),
        }
    }

    pub fn region_name(&self) -> &str {
        &self.region_name
    }

    /// Append a measurement; dates must strictly increase
    pub fn append(&mut self, date: NaiveDate, hectares: f64) -> ForestResult<()> {
        if let Some(last) = self.last_date() {
            if date <= last {
                return Err(ForestError::OutOfOrderScene { date, last });
            }
        }
        if !hectares.is_finite() || hectares < 0.0 {
            return Err(ForestError::Processing(format!(
                "invalid forest area {} for {}",
                hectares, date
            )));
        }
        self.entries.push(HistoryEntry { date, hectares });
        Ok(())
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.last()
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.entries.last().map(|e| e.date)
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        self.entries.iter().map(|e| e.date).collect()
    }

    pub fn hectares(&self) -> Vec<f64> {
        self.entries.iter().map(|e| e.hectares).collect()
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.entries.iter().any(|e| e.date == date)
    }

    /// Load a persisted history, re-checking the ordering
    pub fn load<P: AsRef<Path>>(path: P) -> ForestResult<Self> {
        let raw: ForestCoverHistory = read_json(path.as_ref())?;
        let mut history = Self::new(raw.region_name);
        for entry in raw.entries {
            history.append(entry.date, entry.hectares)?;
        }
        log::info!(
            "Loaded forest cover history for '{}': {} entries",
            history.region_name,
            history.len()
        );
        Ok(history)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> ForestResult<()> {
        write_json_atomic(path, self)
    }
}

/// Region-level summary consumed by the reporting API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestCoverReport {
    pub protected_area_name: String,
    pub description: String,
    /// Region polygon as WKT, when known
    pub footprint: Option<String>,
    /// Region area in hectares
    pub total_extension_protected_area: f64,
    pub last_detection_date: Option<NaiveDate>,
    pub detection_date_list: Vec<NaiveDate>,
    pub total_extension_forest_cover_list: Vec<f64>,
}

impl ForestCoverReport {
    pub fn from_history(
        history: &ForestCoverHistory,
        region_hectares: f64,
        description: impl Into<String>,
    ) -> Self {
        Self {
            protected_area_name: history.region_name().to_string(),
            description: description.into(),
            footprint: None,
            total_extension_protected_area: region_hectares,
            last_detection_date: history.last_date(),
            detection_date_list: history.dates(),
            total_extension_forest_cover_list: history.hectares(),
        }
    }

    pub fn with_footprint(mut self, wkt: impl Into<String>) -> Self {
        self.footprint = Some(wkt.into());
        self
    }

    /// Share of the region covered by forest at the last detection
    pub fn latest_cover_fraction(&self) -> Option<f64> {
        let last = *self.total_extension_forest_cover_list.last()?;
        if self.total_extension_protected_area > 0.0 {
            Some(last / self.total_extension_protected_area)
        } else {
            None
        }
    }

    pub fn to_json(&self) -> ForestResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> ForestResult<()> {
        write_json_atomic(path, self)
    }
}
