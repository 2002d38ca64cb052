use crate::io::mtl::{parse_number, MtlDocument};
use crate::types::{BandId, ForestError, ForestResult, Raster, Scene};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Which MTL rescaling group to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoefficientKind {
    Radiance,
    Reflectance,
}

impl CoefficientKind {
    pub fn multiplicative_key(self, band: u8) -> String {
        match self {
            CoefficientKind::Radiance => format!("RADIANCE_MULT_BAND_{}", band),
            CoefficientKind::Reflectance => format!("REFLECTANCE_MULT_BAND_{}", band),
        }
    }

    pub fn additive_key(self, band: u8) -> String {
        match self {
            CoefficientKind::Radiance => format!("RADIANCE_ADD_BAND_{}", band),
            CoefficientKind::Reflectance => format!("REFLECTANCE_ADD_BAND_{}", band),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Term {
    Multiplicative,
    Additive,
}

/// Gain and bias for one band
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RescalingCoefficients {
    pub multiplicative: f64,
    pub additive: f64,
}

impl RescalingCoefficients {
    /// `[multiplicative, additive]`
    pub fn as_array(&self) -> [f64; 2] {
        [self.multiplicative, self.additive]
    }
}

/// How raw digital numbers are converted before the vegetation index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationMode {
    /// Sun-angle corrected top-of-atmosphere reflectance
    #[default]
    Reflectance,
    /// At-sensor spectral radiance
    Radiance,
    /// Bands are already calibrated (e.g. surface reflectance products)
    None,
}

/// The product-code rule for reflectance coefficients: names whose last
/// `-` separated segment contains `LC08` keep the leading pair of matches,
/// everything else keeps the trailing pair.
pub fn drops_trailing_pair(product_name: &str) -> bool {
    let base = Path::new(product_name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(product_name);
    base.rsplit('-').next().map_or(false, |seg| seg.contains("LC08"))
}

fn matched_terms(
    mtl: &MtlDocument,
    kind: CoefficientKind,
    band: u8,
) -> ForestResult<Vec<(Term, f64)>> {
    let mult_key = kind.multiplicative_key(band);
    let add_key = kind.additive_key(band);

    let mut terms = Vec::new();
    for entry in mtl.entries() {
        let term = if entry.key == mult_key {
            Term::Multiplicative
        } else if entry.key == add_key {
            Term::Additive
        } else {
            continue;
        };
        log::debug!("MTL line {}: {} = {}", entry.line, entry.key, entry.value);
        terms.push((term, parse_number(&entry.key, &entry.value)?));
    }
    Ok(terms)
}

fn apply_product_rule(terms: Vec<(Term, f64)>, product_name: &str) -> Vec<(Term, f64)> {
    if drops_trailing_pair(product_name) {
        let keep = terms.len().saturating_sub(2);
        terms.into_iter().take(keep).collect()
    } else {
        terms.into_iter().skip(2).collect()
    }
}

/// Matched coefficient values in document order, after the product-code
/// slicing for reflectance. May be shorter than two.
pub fn matched_coefficients(
    mtl: &MtlDocument,
    kind: CoefficientKind,
    band: u8,
    product_name: &str,
) -> ForestResult<Vec<f64>> {
    let mut terms = matched_terms(mtl, kind, band)?;
    if kind == CoefficientKind::Reflectance {
        terms = apply_product_rule(terms, product_name);
    }
    Ok(terms.into_iter().map(|(_, v)| v).collect())
}

/// Extract `[multiplicative, additive]` for a band; a missing term is fatal
pub fn rescaling_coefficients(
    mtl: &MtlDocument,
    kind: CoefficientKind,
    band: u8,
    product_name: &str,
) -> ForestResult<RescalingCoefficients> {
    let mut terms = matched_terms(mtl, kind, band)?;
    if kind == CoefficientKind::Reflectance {
        terms = apply_product_rule(terms, product_name);
    }

    let pick = |wanted: Term, key: String| {
        terms
            .iter()
            .find(|(t, _)| *t == wanted)
            .map(|(_, v)| *v)
            .ok_or(ForestError::MissingMetadataKey(key))
    };

    Ok(RescalingCoefficients {
        multiplicative: pick(Term::Multiplicative, kind.multiplicative_key(band))?,
        additive: pick(Term::Additive, kind.additive_key(band))?,
    })
}

/// Scene-centre sun elevation in degrees (last `SUN_ELEVATION` entry)
pub fn sun_elevation(mtl: &MtlDocument) -> ForestResult<f64> {
    mtl.last_f64("SUN_ELEVATION")
}

/// L = M * DN + A, nodata stays nodata
pub fn dn_to_radiance(dn: &Array2<f64>, coefficients: RescalingCoefficients) -> Array2<f64> {
    rescale(dn, coefficients)
}

/// ρ' = M * DN + A (no sun-angle correction), nodata stays nodata
pub fn dn_to_reflectance(dn: &Array2<f64>, coefficients: RescalingCoefficients) -> Array2<f64> {
    rescale(dn, coefficients)
}

fn rescale(dn: &Array2<f64>, c: RescalingCoefficients) -> Array2<f64> {
    dn.mapv(|v| {
        if v.is_nan() {
            v
        } else {
            c.multiplicative * v + c.additive
        }
    })
}

/// ρ = ρ' / cos(90° - sun_elevation), i.e. ρ' / sin(sun_elevation)
pub fn sun_corrected_reflectance(
    reflectance: &Array2<f64>,
    sun_elevation_deg: f64,
) -> ForestResult<Array2<f64>> {
    if !(sun_elevation_deg > 0.0 && sun_elevation_deg <= 90.0) {
        return Err(ForestError::InvalidFormat(format!(
            "sun elevation {} degrees outside (0, 90]",
            sun_elevation_deg
        )));
    }
    let zenith = (90.0 - sun_elevation_deg).to_radians();
    let cos_zenith = zenith.cos();
    Ok(reflectance.mapv(|v| v / cos_zenith))
}

/// Radiometric calibrator for one scene
#[derive(Debug, Clone)]
pub struct RadiometricCalibrator {
    mode: CalibrationMode,
    sun_elevation: Option<f64>,
    coefficients: BTreeMap<BandId, RescalingCoefficients>,
}

impl RadiometricCalibrator {
    /// Read the coefficients for `bands` from scene metadata
    pub fn from_metadata(
        mtl: &MtlDocument,
        product_name: &str,
        mode: CalibrationMode,
        bands: &[BandId],
    ) -> ForestResult<Self> {
        let kind = match mode {
            CalibrationMode::Reflectance => CoefficientKind::Reflectance,
            CalibrationMode::Radiance => CoefficientKind::Radiance,
            CalibrationMode::None => {
                return Ok(Self {
                    mode,
                    sun_elevation: None,
                    coefficients: BTreeMap::new(),
                })
            }
        };

        let mut coefficients = BTreeMap::new();
        for &band in bands {
            let c = rescaling_coefficients(mtl, kind, band.number(), product_name)?;
            log::debug!(
                "{:?} coefficients for {}: M={:e} A={:e}",
                kind,
                band,
                c.multiplicative,
                c.additive
            );
            coefficients.insert(band, c);
        }

        let sun_elevation = match mode {
            CalibrationMode::Reflectance => Some(sun_elevation(mtl)?),
            _ => None,
        };

        Ok(Self {
            mode,
            sun_elevation,
            coefficients,
        })
    }

    pub fn mode(&self) -> CalibrationMode {
        self.mode
    }

    pub fn sun_elevation(&self) -> Option<f64> {
        self.sun_elevation
    }

    pub fn coefficients(&self, band: BandId) -> Option<RescalingCoefficients> {
        self.coefficients.get(&band).copied()
    }

    /// Calibrate one band raster
    pub fn calibrate_band(&self, band: BandId, raster: &Raster<f64>) -> ForestResult<Raster<f64>> {
        let data = match self.mode {
            CalibrationMode::None => return Ok(raster.clone()),
            CalibrationMode::Radiance => {
                let c = self.require(band)?;
                dn_to_radiance(raster.data(), c)
            }
            CalibrationMode::Reflectance => {
                let c = self.require(band)?;
                let elevation = self
                    .sun_elevation
                    .ok_or_else(|| ForestError::MissingMetadataKey("SUN_ELEVATION".to_string()))?;
                sun_corrected_reflectance(&dn_to_reflectance(raster.data(), c), elevation)?
            }
        };

        let (min, max) = data
            .iter()
            .filter(|v| !v.is_nan())
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        log::debug!("{} calibrated ({:?}): range {:.4} to {:.4}", band, self.mode, min, max);

        raster.with_data(data)
    }

    /// Calibrate every band of a scene
    pub fn calibrate_scene(&self, scene: &Scene) -> ForestResult<BTreeMap<BandId, Raster<f64>>> {
        log::info!("Applying {:?} calibration to scene {}", self.mode, scene.date());
        scene
            .bands()
            .iter()
            .map(|(&band, raster)| Ok((band, self.calibrate_band(band, raster)?)))
            .collect()
    }

    fn require(&self, band: BandId) -> ForestResult<RescalingCoefficients> {
        self.coefficients.get(&band).copied().ok_or_else(|| {
            ForestError::MissingMetadataKey(format!("rescaling coefficients for {}", band))
        })
    }
}
