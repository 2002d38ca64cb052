use chrono::NaiveDate;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::io::mtl::MtlDocument;

/// Absolute tolerance used when comparing geotransform coefficients
pub const TRANSFORM_TOLERANCE: f64 = 1e-6;

/// Square metres per hectare
pub const SQUARE_METRES_PER_HECTARE: f64 = 10_000.0;

/// A pixel type that carries its own nodata convention
pub trait Pixel: Copy + Send + Sync + fmt::Debug + 'static {
    /// Value written into cells that carry no valid observation
    fn nodata() -> Self;

    fn is_nodata(&self) -> bool;

    fn is_valid(&self) -> bool {
        !self.is_nodata()
    }
}

impl Pixel for f64 {
    fn nodata() -> Self {
        f64::NAN
    }

    fn is_nodata(&self) -> bool {
        self.is_nan()
    }
}

impl Pixel for f32 {
    fn nodata() -> Self {
        f32::NAN
    }

    fn is_nodata(&self) -> bool {
        self.is_nan()
    }
}

/// Forest classification of a single pixel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoverClass {
    Forest,
    NonForest,
    /// Cloud, shadow, fill or outside the region
    NoData,
}

impl CoverClass {
    /// Byte encoding used for persisted masks (1 forest, 0 non-forest, 255 nodata)
    pub const NODATA_CODE: u8 = 255;

    pub fn to_code(self) -> u8 {
        match self {
            CoverClass::Forest => 1,
            CoverClass::NonForest => 0,
            CoverClass::NoData => Self::NODATA_CODE,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            1 => CoverClass::Forest,
            0 => CoverClass::NonForest,
            _ => CoverClass::NoData,
        }
    }

    pub fn is_forest(self) -> bool {
        self == CoverClass::Forest
    }
}

impl Pixel for CoverClass {
    fn nodata() -> Self {
        CoverClass::NoData
    }

    fn is_nodata(&self) -> bool {
        *self == CoverClass::NoData
    }
}

/// Affine geotransform (GDAL coefficient order)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform with square or rectangular pixels
    pub fn north_up(top_left_x: f64, top_left_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            top_left_x,
            pixel_width,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height: -pixel_height.abs(),
        }
    }

    pub fn from_gdal(coefficients: [f64; 6]) -> Self {
        Self {
            top_left_x: coefficients[0],
            pixel_width: coefficients[1],
            rotation_x: coefficients[2],
            top_left_y: coefficients[3],
            rotation_y: coefficients[4],
            pixel_height: coefficients[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    pub fn is_rotated(&self) -> bool {
        self.rotation_x != 0.0 || self.rotation_y != 0.0
    }

    /// (x, y) resolution magnitudes
    pub fn resolution(&self) -> (f64, f64) {
        (self.pixel_width.abs(), self.pixel_height.abs())
    }

    /// Area of one pixel in map units squared. Rotated grids are rejected.
    pub fn pixel_area(&self) -> ForestResult<f64> {
        if self.is_rotated() {
            return Err(ForestError::InvalidFormat(format!(
                "rotated geotransform not supported: {:?}",
                self.to_gdal()
            )));
        }
        let (x_res, y_res) = self.resolution();
        Ok(x_res * y_res)
    }

    /// Map coordinates of the centre of pixel (row, col)
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        let c = col as f64 + 0.5;
        let r = row as f64 + 0.5;
        (
            self.top_left_x + c * self.pixel_width + r * self.rotation_x,
            self.top_left_y + c * self.rotation_y + r * self.pixel_height,
        )
    }

    /// Fractional (row, col) of a map coordinate; only valid for unrotated grids
    pub fn map_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (y - self.top_left_y) / self.pixel_height,
            (x - self.top_left_x) / self.pixel_width,
        )
    }

    /// Transform of a window starting at (row_off, col_off)
    pub fn offset(&self, row_off: usize, col_off: usize) -> Self {
        let (x, y) = (
            self.top_left_x + col_off as f64 * self.pixel_width + row_off as f64 * self.rotation_x,
            self.top_left_y + col_off as f64 * self.rotation_y + row_off as f64 * self.pixel_height,
        );
        Self {
            top_left_x: x,
            top_left_y: y,
            ..*self
        }
    }

    pub fn approx_eq(&self, other: &GeoTransform) -> bool {
        self.to_gdal()
            .iter()
            .zip(other.to_gdal().iter())
            .all(|(a, b)| (a - b).abs() <= TRANSFORM_TOLERANCE)
    }
}

impl Default for GeoTransform {
    fn default() -> Self {
        Self::north_up(0.0, 0.0, 1.0, 1.0)
    }
}

/// A georeferenced single-band grid
#[derive(Debug, Clone)]
pub struct Raster<T: Pixel> {
    data: Array2<T>,
    transform: GeoTransform,
    epsg: u32,
}

/// Normalized-difference vegetation index values (NaN = nodata)
pub type IndexRaster = Raster<f64>;

/// Per-pixel forest / non-forest / nodata classification
pub type ForestMask = Raster<CoverClass>;

impl<T: Pixel> Raster<T> {
    pub fn new(data: Array2<T>, transform: GeoTransform, epsg: u32) -> Self {
        Self {
            data,
            transform,
            epsg,
        }
    }

    pub fn filled(rows: usize, cols: usize, value: T, transform: GeoTransform, epsg: u32) -> Self {
        Self::new(Array2::from_elem((rows, cols), value), transform, epsg)
    }

    pub fn data(&self) -> &Array2<T> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Array2<T> {
        &mut self.data
    }

    pub fn into_data(self) -> Array2<T> {
        self.data
    }

    pub fn transform(&self) -> &GeoTransform {
        &self.transform
    }

    pub fn epsg(&self) -> u32 {
        self.epsg
    }

    /// (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn rows(&self) -> usize {
        self.data.nrows()
    }

    pub fn cols(&self) -> usize {
        self.data.ncols()
    }

    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|v| v.is_valid()).count()
    }

    pub fn is_all_invalid(&self) -> bool {
        self.data.iter().all(|v| v.is_nodata())
    }

    /// Same EPSG, shape and transform
    pub fn same_grid<U: Pixel>(&self, other: &Raster<U>) -> bool {
        self.epsg == other.epsg
            && self.shape() == other.shape()
            && self.transform.approx_eq(&other.transform)
    }

    pub fn ensure_same_grid<U: Pixel>(&self, other: &Raster<U>) -> ForestResult<()> {
        if self.epsg != other.epsg {
            return Err(ForestError::CrsMismatch {
                expected: self.epsg,
                found: other.epsg,
            });
        }
        if !self.same_grid(other) {
            return Err(ForestError::RasterShapeMismatch {
                expected: self.grid_description(),
                found: other.grid_description(),
            });
        }
        Ok(())
    }

    pub fn grid_description(&self) -> String {
        let (rows, cols) = self.shape();
        format!("{}x{} @ {:?}", rows, cols, self.transform.to_gdal())
    }

    /// Replace the pixel grid keeping georeferencing; the shape must not change
    pub fn with_data<U: Pixel>(&self, data: Array2<U>) -> ForestResult<Raster<U>> {
        if data.dim() != self.shape() {
            return Err(ForestError::RasterShapeMismatch {
                expected: format!("{:?}", self.shape()),
                found: format!("{:?}", data.dim()),
            });
        }
        Ok(Raster::new(data, self.transform, self.epsg))
    }

    pub fn map<U: Pixel, F: Fn(T) -> U>(&self, f: F) -> Raster<U> {
        Raster::new(self.data.mapv(f), self.transform, self.epsg)
    }

    pub fn pixel_area(&self) -> ForestResult<f64> {
        self.transform.pixel_area()
    }
}

impl ForestMask {
    pub fn forest_count(&self) -> usize {
        self.data.iter().filter(|c| c.is_forest()).count()
    }
}

/// The five Landsat 8 OLI bands the pipeline works with
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BandId {
    Blue,
    Green,
    Red,
    Nir,
    Panchromatic,
}

impl BandId {
    pub const ALL: [BandId; 5] = [
        BandId::Blue,
        BandId::Green,
        BandId::Red,
        BandId::Nir,
        BandId::Panchromatic,
    ];

    /// OLI band number as used in file names and metadata keys
    pub fn number(self) -> u8 {
        match self {
            BandId::Blue => 2,
            BandId::Green => 3,
            BandId::Red => 4,
            BandId::Nir => 5,
            BandId::Panchromatic => 8,
        }
    }

    pub fn from_number(number: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|b| b.number() == number)
    }
}

impl fmt::Display for BandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.number())
    }
}

/// One Landsat acquisition with pixel-aligned bands
#[derive(Debug, Clone)]
pub struct Scene {
    date: NaiveDate,
    product_id: String,
    bands: BTreeMap<BandId, Raster<f64>>,
    metadata: MtlDocument,
    qa: Option<Raster<f64>>,
}

impl Scene {
    /// Build a scene, checking that red and NIR exist and every band shares one grid
    pub fn new(
        date: NaiveDate,
        product_id: impl Into<String>,
        bands: BTreeMap<BandId, Raster<f64>>,
        metadata: MtlDocument,
    ) -> ForestResult<Self> {
        let reference = bands.get(&BandId::Red).ok_or_else(|| {
            ForestError::InvalidFormat(format!("scene {} has no red band", date))
        })?;
        if !bands.contains_key(&BandId::Nir) {
            return Err(ForestError::InvalidFormat(format!(
                "scene {} has no near-infrared band",
                date
            )));
        }
        for (band, raster) in &bands {
            reference.ensure_same_grid(raster).map_err(|e| {
                log::warn!("Band {} of scene {} is not aligned: {}", band, date, e);
                e
            })?;
        }

        Ok(Self {
            date,
            product_id: product_id.into(),
            bands,
            metadata,
            qa: None,
        })
    }

    /// Attach a QA_PIXEL band; it must share the band grid
    pub fn with_qa(mut self, qa: Raster<f64>) -> ForestResult<Self> {
        self.red().ensure_same_grid(&qa)?;
        self.qa = Some(qa);
        Ok(self)
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    pub fn metadata(&self) -> &MtlDocument {
        &self.metadata
    }

    pub fn bands(&self) -> &BTreeMap<BandId, Raster<f64>> {
        &self.bands
    }

    pub fn band(&self, band: BandId) -> Option<&Raster<f64>> {
        self.bands.get(&band)
    }

    pub fn qa(&self) -> Option<&Raster<f64>> {
        self.qa.as_ref()
    }

    pub fn red(&self) -> &Raster<f64> {
        &self.bands[&BandId::Red]
    }

    pub fn nir(&self) -> &Raster<f64> {
        &self.bands[&BandId::Nir]
    }

    pub fn into_bands(self) -> BTreeMap<BandId, Raster<f64>> {
        self.bands
    }
}

/// Processing stage a scene failure is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Discover,
    Align,
    Calibrate,
    Index,
    Accumulate,
    Persist,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Discover => "discover",
            Stage::Align => "align",
            Stage::Calibrate => "calibrate",
            Stage::Index => "index",
            Stage::Accumulate => "accumulate",
            Stage::Persist => "persist",
        };
        f.write_str(name)
    }
}

/// Per-scene processing status kept in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SceneStatus {
    Pending,
    Aligned,
    Calibrated,
    Indexed,
    Accumulated,
    Failed,
}

/// Error types for forest-cover processing
#[derive(Debug, thiserror::Error)]
pub enum ForestError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Raster I/O error: {0}")]
    RasterIo(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing metadata key: {0}")]
    MissingMetadataKey(String),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Raster shape mismatch: expected {expected}, found {found}")]
    RasterShapeMismatch { expected: String, found: String },

    #[error("CRS mismatch: expected EPSG:{expected}, found EPSG:{found}")]
    CrsMismatch { expected: u32, found: u32 },

    #[error("Scene {date} is not after the last accumulated date {last}")]
    OutOfOrderScene { date: NaiveDate, last: NaiveDate },

    #[error("Scene {0} contains no valid pixels")]
    AllInvalidScene(NaiveDate),

    #[error("Region error: {0}")]
    Region(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Scene {date} failed during {stage}: {source}")]
    Scene {
        date: NaiveDate,
        stage: Stage,
        source: Box<ForestError>,
    },
}

impl ForestError {
    /// Attach the scene date and stage, unless already attached
    pub fn in_scene(self, date: NaiveDate, stage: Stage) -> Self {
        match self {
            e @ ForestError::Scene { .. } => e,
            e => ForestError::Scene {
                date,
                stage,
                source: Box::new(e),
            },
        }
    }

    /// Errors after which the history of the run is no longer well-defined
    pub fn is_fatal_for_run(&self) -> bool {
        match self {
            ForestError::OutOfOrderScene { .. } | ForestError::Cancelled => true,
            ForestError::Scene { source, .. } => source.is_fatal_for_run(),
            _ => false,
        }
    }

    /// Stage the failure happened in, when known
    pub fn stage(&self) -> Option<Stage> {
        match self {
            ForestError::Scene { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Result type for forest-cover operations
pub type ForestResult<T> = Result<T, ForestError>;
