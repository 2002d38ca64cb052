use crate::core::report::to_hectares;
use crate::io::region::RegionGeometry;
use crate::types::{CoverClass, ForestMask, ForestResult, IndexRaster, Raster};
use ndarray::Zip;
use serde::{Deserialize, Serialize};

/// Red offset of the atmosphere-resistant variant when none is configured
pub const DEFAULT_RED_EPSILON: f64 = 0.05;

/// Vegetation index formula
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndexVariant {
    /// (nir - red) / (nir + red)
    #[default]
    Standard,
    /// Same formula with a constant added to red before differencing
    AtmosphereResistant { epsilon: f64 },
}

impl IndexVariant {
    pub fn atmosphere_resistant() -> Self {
        IndexVariant::AtmosphereResistant {
            epsilon: DEFAULT_RED_EPSILON,
        }
    }

    pub fn red_offset(&self) -> f64 {
        match self {
            IndexVariant::Standard => 0.0,
            IndexVariant::AtmosphereResistant { epsilon } => *epsilon,
        }
    }
}

/// Parameters for index computation and forest classification
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VegetationParams {
    pub variant: IndexVariant,
    /// Index values at or above this are forest
    pub forest_threshold: f64,
}

impl Default for VegetationParams {
    fn default() -> Self {
        Self {
            variant: IndexVariant::Standard,
            forest_threshold: 0.3,
        }
    }
}

/// Per-pixel normalized difference; NaN when an input is NaN or the sum is zero
#[inline]
pub fn normalized_difference(red: f64, nir: f64, red_offset: f64) -> f64 {
    if red.is_nan() || nir.is_nan() {
        return f64::NAN;
    }
    let red = red + red_offset;
    let sum = nir + red;
    if sum == 0.0 {
        f64::NAN
    } else {
        (nir - red) / sum
    }
}

/// Standard NDVI of two aligned bands
pub fn compute_index(red: &Raster<f64>, nir: &Raster<f64>) -> ForestResult<IndexRaster> {
    compute_index_with(red, nir, IndexVariant::Standard)
}

pub fn compute_index_with(
    red: &Raster<f64>,
    nir: &Raster<f64>,
    variant: IndexVariant,
) -> ForestResult<IndexRaster> {
    red.ensure_same_grid(nir)?;
    let offset = variant.red_offset();

    #[cfg(feature = "parallel")]
    let index = Zip::from(red.data())
        .and(nir.data())
        .par_map_collect(|&r, &n| normalized_difference(r, n, offset));

    #[cfg(not(feature = "parallel"))]
    let index = Zip::from(red.data())
        .and(nir.data())
        .map_collect(|&r, &n| normalized_difference(r, n, offset));

    red.with_data(index)
}

/// Threshold an index raster. NaN and exact zero are nodata.
pub fn classify(index: &IndexRaster, threshold: f64) -> ForestMask {
    index.map(|v| {
        if v.is_nan() || v == 0.0 {
            CoverClass::NoData
        } else if v >= threshold {
            CoverClass::Forest
        } else {
            CoverClass::NonForest
        }
    })
}

/// Clip a mask to the region and return it with its forest area in hectares
pub fn clip_and_measure(mask: &ForestMask, region: &RegionGeometry) -> ForestResult<(ForestMask, f64)> {
    let clipped = region.clip(mask)?;
    // rejects rotated grids
    clipped.pixel_area()?;
    let (x_res, y_res) = clipped.transform().resolution();
    let hectares = to_hectares(clipped.forest_count(), x_res, y_res);
    Ok((clipped, hectares))
}

/// Summary of one classified mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MaskSummary {
    pub forest: usize,
    pub non_forest: usize,
    pub nodata: usize,
}

impl MaskSummary {
    pub fn of(mask: &ForestMask) -> Self {
        mask.data().iter().fold(Self::default(), |mut s, class| {
            match class {
                CoverClass::Forest => s.forest += 1,
                CoverClass::NonForest => s.non_forest += 1,
                CoverClass::NoData => s.nodata += 1,
            }
            s
        })
    }
}

/// Index computation, classification and region measurement with fixed parameters
#[derive(Debug, Clone)]
pub struct VegetationIndexEngine {
    params: VegetationParams,
}

impl VegetationIndexEngine {
    pub fn new(params: VegetationParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &VegetationParams {
        &self.params
    }

    pub fn compute_index(&self, red: &Raster<f64>, nir: &Raster<f64>) -> ForestResult<IndexRaster> {
        let index = compute_index_with(red, nir, self.params.variant)?;

        let valid: Vec<f64> = index.data().iter().copied().filter(|v| !v.is_nan()).collect();
        if valid.is_empty() {
            log::warn!("Vegetation index has no valid pixels");
        } else {
            let mean = valid.iter().sum::<f64>() / valid.len() as f64;
            log::debug!(
                "{:?} index: {} valid pixels of {}, mean {:.4}",
                self.params.variant,
                valid.len(),
                index.data().len(),
                mean
            );
        }
        Ok(index)
    }

    pub fn classify(&self, index: &IndexRaster) -> ForestMask {
        let mask = classify(index, self.params.forest_threshold);
        let summary = MaskSummary::of(&mask);
        log::debug!(
            "Classified at threshold {}: {} forest, {} non-forest, {} nodata",
            self.params.forest_threshold,
            summary.forest,
            summary.non_forest,
            summary.nodata
        );
        mask
    }

    pub fn clip_and_measure(
        &self,
        mask: &ForestMask,
        region: &RegionGeometry,
    ) -> ForestResult<(ForestMask, f64)> {
        let (clipped, hectares) = clip_and_measure(mask, region)?;
        log::info!("Forest area inside '{}': {:.2} ha", region.name(), hectares);
        Ok((clipped, hectares))
    }
}
