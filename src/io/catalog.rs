use crate::core::align::BandNamePattern;
use crate::core::pipeline::SceneInput;
use crate::types::{ForestError, ForestResult};
use chrono::NaiveDate;
use std::path::{Path, PathBuf};

/// Date folder format under a region directory
pub const SCENE_FOLDER_FORMAT: &str = "%Y-%m-%d";

/// `2021-01-15`
pub fn scene_folder_name(date: NaiveDate) -> String {
    date.format(SCENE_FOLDER_FORMAT).to_string()
}

/// Acquisition date of a Landsat product id (`LC08_L2SP_PPPRRR_YYYYMMDD_...`)
pub fn parse_product_date(product_id: &str) -> ForestResult<NaiveDate> {
    let field = product_id.split('_').nth(3).ok_or_else(|| {
        ForestError::InvalidFormat(format!("product id '{}' has no acquisition date field", product_id))
    })?;
    NaiveDate::parse_from_str(field, "%Y%m%d").map_err(|e| {
        ForestError::InvalidFormat(format!("bad acquisition date '{}' in '{}': {}", field, product_id, e))
    })
}

/// A folder the catalog could not turn into a scene
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub path: PathBuf,
    pub reason: String,
}

/// Scenes found under a region directory
#[derive(Debug, Clone, Default)]
pub struct CatalogScan {
    /// Sorted by acquisition date
    pub inputs: Vec<SceneInput>,
    pub rejected: Vec<Rejection>,
}

/// Discovers `<region>/<YYYY-MM-DD>/<bands_folder>/` scene folders
#[derive(Debug, Clone)]
pub struct SceneCatalog {
    bands_folder: String,
    pattern: BandNamePattern,
}

impl SceneCatalog {
    pub fn new(bands_folder: impl Into<String>) -> ForestResult<Self> {
        Ok(Self {
            bands_folder: bands_folder.into(),
            pattern: BandNamePattern::new()?,
        })
    }

    pub fn bands_folder(&self) -> &str {
        &self.bands_folder
    }

    pub fn scene_dir(&self, region_dir: &Path, date: NaiveDate) -> PathBuf {
        region_dir.join(scene_folder_name(date))
    }

    pub fn scan<P: AsRef<Path>>(&self, region_dir: P) -> ForestResult<CatalogScan> {
        let region_dir = region_dir.as_ref();
        log::info!("Scanning scenes in {}", region_dir.display());

        let mut scan = CatalogScan::default();
        let mut dirs: Vec<PathBuf> = std::fs::read_dir(region_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();

        for dir in dirs {
            let name = dir.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            let Ok(date) = NaiveDate::parse_from_str(name, SCENE_FOLDER_FORMAT) else {
                log::debug!("Skipping non-date folder {}", dir.display());
                continue;
            };

            match self.scan_scene(&dir, date) {
                Ok(input) => scan.inputs.push(input),
                Err(e) => {
                    log::warn!("Rejected scene folder {}: {}", dir.display(), e);
                    scan.rejected.push(Rejection {
                        path: dir.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        scan.inputs.sort_by_key(|i| i.date);
        log::info!(
            "Found {} scene(s), rejected {}",
            scan.inputs.len(),
            scan.rejected.len()
        );
        Ok(scan)
    }

    /// Build the input for one date folder
    pub fn scan_scene(&self, dir: &Path, date: NaiveDate) -> ForestResult<SceneInput> {
        let band_dir = dir.join(&self.bands_folder);
        if !band_dir.is_dir() {
            return Err(ForestError::InvalidFormat(format!(
                "missing band folder '{}'",
                self.bands_folder
            )));
        }

        let mut files = list_files(&band_dir)?;
        files.extend(list_files(dir)?);
        files.sort();

        let mut input = SceneInput::new(date, scene_folder_name(date));
        for path in files {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            let upper = name.to_ascii_uppercase();
            if upper.ends_with("_MTL.TXT") {
                input.product_id = name[..name.len() - "_MTL.txt".len()].to_string();
                input.metadata_path = Some(path);
            } else if upper.contains("_QA_PIXEL.") {
                input.qa_path = Some(path);
            } else if path.parent() == Some(band_dir.as_path()) {
                input.band_files.push(path);
            }
        }

        let bands = input
            .band_files
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .filter(|n| self.pattern.parse(n).is_some())
            .count();
        if bands == 0 {
            return Err(ForestError::InvalidFormat("no band rasters found".to_string()));
        }

        if input.metadata_path.is_some() {
            match parse_product_date(&input.product_id) {
                Ok(product_date) if product_date != date => log::warn!(
                    "Product {} is dated {} but stored under {}",
                    input.product_id,
                    product_date,
                    scene_folder_name(date)
                ),
                Ok(_) => {}
                Err(e) => log::debug!("{}", e),
            }
        }
        Ok(input)
    }
}

fn list_files(dir: &Path) -> ForestResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    Ok(files)
}
