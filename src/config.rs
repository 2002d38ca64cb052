use crate::core::align::{AlignmentParams, SourcePolicy};
use crate::core::calibrate::CalibrationMode;
use crate::core::cloud_mask::{default_flags, QaFlag, QaPixelMask};
use crate::core::report::{read_json, write_json_atomic};
use crate::core::vegetation::{IndexVariant, VegetationParams};
use crate::io::acquisition::DownloadParams;
use crate::types::{BandId, ForestError, ForestResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// QA_PIXEL masking settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudMaskConfig {
    pub enabled: bool,
    pub flags: Vec<QaFlag>,
}

impl Default for CloudMaskConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            flags: default_flags(),
        }
    }
}

/// Every setting of a forest-cover run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Protected area name, used in the history and report
    pub region_name: String,
    pub description: String,
    /// Projected CRS of the region geometry and all rasters
    pub region_epsg: u32,
    /// Sub-folder of each date folder that holds the band files
    pub bands_folder: String,
    /// Root for per-date outputs, history, ledger and report
    pub output_root: PathBuf,
    pub forest_threshold: f64,
    pub index_variant: IndexVariant,
    pub calibration: CalibrationMode,
    pub cloud_mask: CloudMaskConfig,
    pub source_policy: SourcePolicy,
    pub write_aligned: bool,
    pub write_stack: bool,
    pub download: DownloadParams,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            region_name: "region".to_string(),
            description: String::new(),
            region_epsg: 32618,
            bands_folder: "band".to_string(),
            output_root: PathBuf::from("output"),
            forest_threshold: 0.3,
            index_variant: IndexVariant::Standard,
            calibration: CalibrationMode::Reflectance,
            cloud_mask: CloudMaskConfig::default(),
            source_policy: SourcePolicy::Keep,
            write_aligned: false,
            write_stack: false,
            download: DownloadParams::default(),
        }
    }
}

impl PipelineConfig {
    /// Load and validate a JSON configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ForestResult<Self> {
        log::info!("Loading configuration: {}", path.as_ref().display());
        let config: PipelineConfig = read_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> ForestResult<()> {
        write_json_atomic(path, self)
    }

    pub fn validate(&self) -> ForestResult<()> {
        if self.region_name.trim().is_empty() {
            return Err(ForestError::Config("region_name must not be empty".to_string()));
        }
        if self.region_epsg == 0 {
            return Err(ForestError::Config("region_epsg must be non-zero".to_string()));
        }
        if self.bands_folder.trim().is_empty() {
            return Err(ForestError::Config("bands_folder must not be empty".to_string()));
        }
        if !(-1.0..=1.0).contains(&self.forest_threshold) {
            return Err(ForestError::Config(format!(
                "forest_threshold {} outside [-1, 1]",
                self.forest_threshold
            )));
        }
        if let IndexVariant::AtmosphereResistant { epsilon } = self.index_variant {
            if !epsilon.is_finite() {
                return Err(ForestError::Config(format!("invalid index epsilon {}", epsilon)));
            }
        }
        self.download.validate()
    }

    pub fn vegetation_params(&self) -> VegetationParams {
        VegetationParams {
            variant: self.index_variant,
            forest_threshold: self.forest_threshold,
        }
    }

    pub fn alignment_params(&self) -> AlignmentParams {
        AlignmentParams {
            reference: BandId::Red,
            source_policy: self.source_policy,
            write_aligned: self.write_aligned,
        }
    }

    /// The QA mask to apply, if masking is enabled
    pub fn qa_mask(&self) -> Option<QaPixelMask> {
        if self.cloud_mask.enabled && !self.cloud_mask.flags.is_empty() {
            Some(QaPixelMask::new(&self.cloud_mask.flags))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.region_epsg, 32618);
        assert_eq!(config.qa_mask().unwrap().bits(), 0b1_1000);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "region_name": "Parque Tayrona",
                "forest_threshold": 0.45,
                "index_variant": {"kind": "atmosphere_resistant", "epsilon": 0.05},
                "calibration": "none",
                "cloud_mask": {"flags": ["cloud", "cirrus"]}
            }"#,
        )
        .unwrap();

        let config = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(config.region_name, "Parque Tayrona");
        assert_eq!(config.bands_folder, "band");
        assert_eq!(config.calibration, CalibrationMode::None);
        assert_eq!(config.index_variant.red_offset(), 0.05);
        assert!(config.cloud_mask.enabled);
        assert_eq!(config.vegetation_params().forest_threshold, 0.45);
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let config = PipelineConfig {
            forest_threshold: 1.5,
            ..PipelineConfig::default()
        };
        assert!(matches!(config.validate(), Err(ForestError::Config(_))));
    }
}
