//! forestwatch: forest-cover change tracking from Landsat 8/9 imagery
//!
//! Per-date band sets are aligned onto a common grid, radiometrically
//! calibrated from their MTL metadata, turned into NDVI and a
//! forest / non-forest mask, and merged date by date into a gap-filled
//! forest-cover history for a protected area.

pub mod config;
pub mod core;
pub mod io;
pub mod types;

// Re-export main types and functions for easier access
pub use config::PipelineConfig;
pub use types::{
    BandId, CoverClass, ForestError, ForestMask, ForestResult, GeoTransform, IndexRaster, Pixel, Raster, Scene,
    SceneStatus, Stage,
};

pub use crate::core::{ForestCoverHistory, ForestCoverReport, ForestPipeline, TemporalAccumulator};
pub use io::{MemoryRasterIo, RasterIo, RegionGeometry, SceneCatalog};
#[cfg(feature = "gdal")]
pub use io::GdalRasterIo;
