use crate::io::raster_io::RasterIo;
use crate::io::region::RegionGeometry;
use crate::types::{BandId, ForestError, ForestResult, GeoTransform, Pixel, Raster};
use ndarray::{Array2, Array3, ArrayView2, Axis};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Suffix appended to the file stem of an aligned band
pub const ALIGNED_SUFFIX: &str = "_aligned";

/// What happens to consumed or rejected source files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourcePolicy {
    /// Leave every source file in place
    #[default]
    Keep,
    /// Delete rejected files and raw bands once their aligned copy is written
    Remove,
}

/// Band alignment parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlignmentParams {
    /// Band whose grid every other band is resampled onto
    pub reference: BandId,
    pub source_policy: SourcePolicy,
    /// Write `<stem>_aligned.<ext>` next to each raw band
    pub write_aligned: bool,
}

impl Default for AlignmentParams {
    fn default() -> Self {
        Self {
            reference: BandId::Red,
            source_policy: SourcePolicy::Keep,
            write_aligned: false,
        }
    }
}

/// A band file name recognised by [`BandNamePattern`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandFile {
    pub number: u8,
    pub aligned: bool,
}

/// Matches `..._B<n>.TIF` and `..._B<n>_aligned.TIF` (case-insensitive)
#[derive(Debug, Clone)]
pub struct BandNamePattern {
    regex: Regex,
}

impl BandNamePattern {
    pub fn new() -> ForestResult<Self> {
        let regex = Regex::new(r"(?i)_B(\d{1,2})(_aligned)?\.tiff?$")
            .map_err(|e| ForestError::Processing(format!("Regex error: {}", e)))?;
        Ok(Self { regex })
    }

    pub fn parse(&self, file_name: &str) -> Option<BandFile> {
        let captures = self.regex.captures(file_name)?;
        let number = captures.get(1)?.as_str().parse::<u8>().ok()?;
        Some(BandFile {
            number,
            aligned: captures.get(2).is_some(),
        })
    }
}

/// Path of the aligned copy of a raw band file
pub fn aligned_path(raw: &Path) -> PathBuf {
    let stem = raw.file_stem().and_then(|s| s.to_str()).unwrap_or("band");
    let name = match raw.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}{}.{}", stem, ALIGNED_SUFFIX, ext),
        None => format!("{}{}", stem, ALIGNED_SUFFIX),
    };
    raw.with_file_name(name)
}

/// Per-file result of an alignment pass
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    /// Resampled onto the reference grid, optionally written out
    Aligned { band: BandId, output: Option<PathBuf> },
    /// Already on the reference grid, nothing to do
    AlreadyAligned { band: BandId },
    /// Band number outside the pipeline's band set
    Discarded { band_number: u8 },
    /// Not a band raster (metadata, QA, other files)
    Ignored,
    /// Raw band for which an aligned copy exists
    Superseded { by: PathBuf },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentItem {
    pub path: PathBuf,
    pub outcome: ItemOutcome,
}

/// Outcome of aligning one scene's files
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlignmentReport {
    pub items: Vec<AlignmentItem>,
    /// Files deleted under [`SourcePolicy::Remove`]
    pub removed: Vec<PathBuf>,
}

impl AlignmentReport {
    fn record(&mut self, path: &Path, outcome: ItemOutcome) {
        self.items.push(AlignmentItem {
            path: path.to_path_buf(),
            outcome,
        });
    }

    pub fn failures(&self) -> impl Iterator<Item = &AlignmentItem> {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, ItemOutcome::Failed { .. }))
    }

    pub fn aligned_count(&self) -> usize {
        self.items
            .iter()
            .filter(|i| {
                matches!(
                    i.outcome,
                    ItemOutcome::Aligned { .. } | ItemOutcome::AlreadyAligned { .. }
                )
            })
            .count()
    }

    /// True when every band was already on the reference grid
    pub fn is_noop(&self) -> bool {
        self.removed.is_empty()
            && self
                .items
                .iter()
                .all(|i| !matches!(i.outcome, ItemOutcome::Aligned { .. } | ItemOutcome::Failed { .. }))
    }
}

/// Nearest-neighbour resampling of `src` onto a target grid in the same CRS
pub fn resample_to_grid<T: Pixel>(
    src: &Raster<T>,
    transform: &GeoTransform,
    shape: (usize, usize),
    epsg: u32,
) -> ForestResult<Raster<T>> {
    if src.epsg() != epsg {
        return Err(ForestError::CrsMismatch {
            expected: epsg,
            found: src.epsg(),
        });
    }
    if src.shape() == shape && src.transform().approx_eq(transform) {
        return Ok(src.clone());
    }
    if src.transform().is_rotated() || transform.is_rotated() {
        return Err(ForestError::InvalidFormat(
            "nearest-neighbour resampling needs unrotated grids".to_string(),
        ));
    }

    let (rows, cols) = shape;
    let (src_rows, src_cols) = src.shape();
    let src_gt = *src.transform();
    let src_data = src.data();
    log::debug!(
        "Resampling {}x{} onto {}x{} grid {:?}",
        src_rows,
        src_cols,
        rows,
        cols,
        transform.to_gdal()
    );

    let sample = |idx: usize| -> T {
        let (row, col) = (idx / cols, idx % cols);
        let (x, y) = transform.pixel_center(row, col);
        let (src_row, src_col) = src_gt.map_to_pixel(x, y);
        let (src_row, src_col) = (src_row.floor(), src_col.floor());
        if src_row < 0.0 || src_col < 0.0 {
            return T::nodata();
        }
        let (r, c) = (src_row as usize, src_col as usize);
        if r < src_rows && c < src_cols {
            src_data[[r, c]]
        } else {
            T::nodata()
        }
    };

    #[cfg(feature = "parallel")]
    let values: Vec<T> = {
        use rayon::prelude::*;
        (0..rows * cols).into_par_iter().map(sample).collect()
    };
    #[cfg(not(feature = "parallel"))]
    let values: Vec<T> = (0..rows * cols).map(sample).collect();

    let data = Array2::from_shape_vec((rows, cols), values)
        .map_err(|e| ForestError::Processing(format!("Failed to reshape resampled band: {}", e)))?;
    Ok(Raster::new(data, *transform, epsg))
}

/// Aligned bands stacked along the first axis, in band order
#[derive(Debug, Clone)]
pub struct BandStack {
    bands: Vec<BandId>,
    data: Array3<f64>,
    transform: GeoTransform,
    epsg: u32,
}

impl BandStack {
    pub fn bands(&self) -> &[BandId] {
        &self.bands
    }

    /// (band, row, col)
    pub fn data(&self) -> &Array3<f64> {
        &self.data
    }

    pub fn transform(&self) -> &GeoTransform {
        &self.transform
    }

    pub fn epsg(&self) -> u32 {
        self.epsg
    }

    pub fn band(&self, band: BandId) -> Option<ArrayView2<'_, f64>> {
        let idx = self.bands.iter().position(|b| *b == band)?;
        Some(self.data.index_axis(Axis(0), idx))
    }
}

/// Stack pixel-aligned bands into one 3-D array
pub fn stack_bands(bands: &BTreeMap<BandId, Raster<f64>>) -> ForestResult<BandStack> {
    let (_, first) = bands
        .iter()
        .next()
        .ok_or_else(|| ForestError::Processing("cannot stack zero bands".to_string()))?;
    for raster in bands.values() {
        first.ensure_same_grid(raster)?;
    }

    let views: Vec<ArrayView2<'_, f64>> = bands.values().map(|r| r.data().view()).collect();
    let data = ndarray::stack(Axis(0), &views)
        .map_err(|e| ForestError::Processing(format!("Failed to stack bands: {}", e)))?;

    Ok(BandStack {
        bands: bands.keys().copied().collect(),
        data,
        transform: *first.transform(),
        epsg: first.epsg(),
    })
}

/// Selected source file for one band
#[derive(Debug, Clone)]
struct BandSource {
    path: PathBuf,
    aligned: bool,
}

/// Filters a scene's band files, clips them to the region and resamples
/// them onto the reference band grid
#[derive(Debug, Clone)]
pub struct BandAligner {
    params: AlignmentParams,
    pattern: BandNamePattern,
}

impl BandAligner {
    pub fn new(params: AlignmentParams) -> ForestResult<Self> {
        Ok(Self {
            params,
            pattern: BandNamePattern::new()?,
        })
    }

    pub fn params(&self) -> &AlignmentParams {
        &self.params
    }

    pub fn pattern(&self) -> &BandNamePattern {
        &self.pattern
    }

    /// Align the given files. A missing or unreadable reference band fails
    /// the scene; any other per-file problem is recorded in the report.
    pub fn align(
        &self,
        io: &dyn RasterIo,
        files: &[PathBuf],
        region: Option<&RegionGeometry>,
    ) -> ForestResult<(BTreeMap<BandId, Raster<f64>>, AlignmentReport)> {
        let mut report = AlignmentReport::default();
        let mut discarded = Vec::new();
        let mut sources: BTreeMap<BandId, BandSource> = BTreeMap::new();

        for path in files {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            let Some(parsed) = self.pattern.parse(name) else {
                report.record(path, ItemOutcome::Ignored);
                continue;
            };
            let Some(band) = BandId::from_number(parsed.number) else {
                log::warn!("Discarding {}: band {} is not used", name, parsed.number);
                report.record(path, ItemOutcome::Discarded { band_number: parsed.number });
                discarded.push(path.clone());
                continue;
            };

            let candidate = BandSource {
                path: path.clone(),
                aligned: parsed.aligned,
            };
            match sources.get(&band).cloned() {
                Some(existing) if existing.aligned && !candidate.aligned => {
                    report.record(path, ItemOutcome::Superseded { by: existing.path.clone() });
                }
                Some(existing) if candidate.aligned && !existing.aligned => {
                    report.record(&existing.path, ItemOutcome::Superseded { by: path.clone() });
                    sources.insert(band, candidate);
                }
                Some(existing) => {
                    report.record(path, ItemOutcome::Failed {
                        error: format!("duplicate file for {} (already using {})", band, existing.path.display()),
                    });
                }
                None => {
                    sources.insert(band, candidate);
                }
            }
        }

        let reference_band = self.params.reference;
        let reference_source = sources.remove(&reference_band).ok_or_else(|| {
            ForestError::InvalidFormat(format!("no {} reference band among {} files", reference_band, files.len()))
        })?;

        let reference = io.read_band(&reference_source.path)?;
        let reference = match region {
            Some(region) => region.clip(&reference)?,
            None => reference,
        };
        log::info!(
            "Reference grid from {}: {}",
            reference_source.path.display(),
            reference.grid_description()
        );

        let mut aligned = BTreeMap::new();
        let mut written: Vec<PathBuf> = Vec::new();

        let reference_outcome = self.finish_band(io, reference_band, &reference_source, &reference, &mut written)?;
        report.record(&reference_source.path, reference_outcome);
        aligned.insert(reference_band, reference.clone());

        for (band, source) in sources {
            let result = io
                .read_band(&source.path)
                .and_then(|raw| resample_to_grid(&raw, reference.transform(), reference.shape(), reference.epsg()))
                .and_then(|resampled| match region {
                    Some(region) => region.clip(&resampled),
                    None => Ok(resampled),
                })
                .and_then(|raster| {
                    let outcome = self.finish_band(io, band, &source, &raster, &mut written)?;
                    Ok((raster, outcome))
                });

            match result {
                Ok((raster, outcome)) => {
                    report.record(&source.path, outcome);
                    aligned.insert(band, raster);
                }
                Err(e) => {
                    log::warn!("Failed to align {}: {}", source.path.display(), e);
                    report.record(&source.path, ItemOutcome::Failed { error: e.to_string() });
                }
            }
        }

        if self.params.source_policy == SourcePolicy::Remove {
            let mut to_remove = discarded;
            to_remove.extend(written);
            to_remove.extend(report.items.iter().filter_map(|i| match &i.outcome {
                ItemOutcome::Superseded { .. } => Some(i.path.clone()),
                _ => None,
            }));
            for path in to_remove {
                match io.remove(&path) {
                    Ok(()) => report.removed.push(path),
                    Err(e) => log::warn!("Could not remove {}: {}", path.display(), e),
                }
            }
        }

        log::info!(
            "Aligned {} band(s), {} failure(s), {} file(s) removed",
            report.aligned_count(),
            report.failures().count(),
            report.removed.len()
        );
        Ok((aligned, report))
    }

    /// Write the aligned copy of a raw band when configured. `written`
    /// collects raw sources whose aligned copy now exists.
    fn finish_band(
        &self,
        io: &dyn RasterIo,
        band: BandId,
        source: &BandSource,
        raster: &Raster<f64>,
        written: &mut Vec<PathBuf>,
    ) -> ForestResult<ItemOutcome> {
        if source.aligned {
            return Ok(ItemOutcome::AlreadyAligned { band });
        }
        if !self.params.write_aligned {
            return Ok(ItemOutcome::Aligned { band, output: None });
        }

        let output = aligned_path(&source.path);
        io.write_band(&output, raster)?;
        written.push(source.path.clone());
        Ok(ItemOutcome::Aligned {
            band,
            output: Some(output),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::memory::MemoryRasterIo;
    use ndarray::array;

    fn gt30() -> GeoTransform {
        GeoTransform::north_up(0.0, 120.0, 30.0, 30.0)
    }

    #[test]
    fn test_band_name_pattern() {
        let pattern = BandNamePattern::new().unwrap();
        assert_eq!(
            pattern.parse("LC08_L2SP_008057_20210115_20210307_02_T1_SR_B4.TIF"),
            Some(BandFile { number: 4, aligned: false })
        );
        assert_eq!(
            pattern.parse("LC08_L2SP_008057_20210115_SR_B10_aligned.tif"),
            Some(BandFile { number: 10, aligned: true })
        );
        assert_eq!(pattern.parse("LC08_L2SP_008057_20210115_QA_PIXEL.TIF"), None);
        assert_eq!(pattern.parse("LC08_MTL.txt"), None);
    }

    #[test]
    fn test_aligned_path() {
        assert_eq!(
            aligned_path(Path::new("/a/scene_B5.TIF")),
            PathBuf::from("/a/scene_B5_aligned.TIF")
        );
    }

    #[test]
    fn test_resample_nearest() {
        // 2x2 grid of 60 m pixels onto 4x4 of 30 m
        let coarse = Raster::new(
            array![[1.0f64, 2.0], [3.0, 4.0]],
            GeoTransform::north_up(0.0, 120.0, 60.0, 60.0),
            32618,
        );
        let fine = resample_to_grid(&coarse, &gt30(), (4, 4), 32618).unwrap();
        assert_eq!(fine.data()[[0, 0]], 1.0);
        assert_eq!(fine.data()[[1, 1]], 1.0);
        assert_eq!(fine.data()[[0, 3]], 2.0);
        assert_eq!(fine.data()[[3, 0]], 3.0);
        assert_eq!(fine.data()[[3, 3]], 4.0);

        // shifted target partially outside the source
        let shifted = GeoTransform::north_up(60.0, 120.0, 30.0, 30.0);
        let out = resample_to_grid(&coarse, &shifted, (1, 4), 32618).unwrap();
        assert_eq!(out.data()[[0, 0]], 2.0);
        assert!(out.data()[[0, 2]].is_nan());

        assert!(matches!(
            resample_to_grid(&coarse, &gt30(), (4, 4), 4326),
            Err(ForestError::CrsMismatch { .. })
        ));
    }

    #[test]
    fn test_stack_bands_order() {
        let mut bands = BTreeMap::new();
        bands.insert(BandId::Nir, Raster::filled(2, 2, 5.0, gt30(), 32618));
        bands.insert(BandId::Blue, Raster::filled(2, 2, 2.0, gt30(), 32618));
        let stack = stack_bands(&bands).unwrap();

        assert_eq!(stack.bands(), &[BandId::Blue, BandId::Nir]);
        assert_eq!(stack.data().dim(), (2, 2, 2));
        assert_eq!(stack.band(BandId::Nir).unwrap()[[1, 1]], 5.0);
        assert!(stack.band(BandId::Red).is_none());
    }

    #[test]
    fn test_align_filters_and_is_idempotent() {
        let io = MemoryRasterIo::new();
        let dir = PathBuf::from("/scene/band");
        let files = vec![
            dir.join("S_B4.TIF"),
            dir.join("S_B5.TIF"),
            dir.join("S_B7.TIF"),
            dir.join("S_QA_PIXEL.TIF"),
        ];
        io.insert_band(&files[0], Raster::filled(4, 4, 0.1, gt30(), 32618));
        io.insert_band(
            &files[1],
            Raster::filled(2, 2, 0.5, GeoTransform::north_up(0.0, 120.0, 60.0, 60.0), 32618),
        );
        io.insert_band(&files[2], Raster::filled(4, 4, 0.3, gt30(), 32618));

        let aligner = BandAligner::new(AlignmentParams {
            source_policy: SourcePolicy::Remove,
            write_aligned: true,
            ..AlignmentParams::default()
        })
        .unwrap();

        let (bands, report) = aligner.align(&io, &files, None).unwrap();
        assert_eq!(bands.len(), 2);
        assert_eq!(bands[&BandId::Nir].shape(), (4, 4));
        assert_eq!(report.aligned_count(), 2);
        assert!(report.removed.contains(&files[2]));
        assert!(!io.exists(&files[0]));
        assert!(io.exists(&dir.join("S_B5_aligned.TIF")));

        let second: Vec<PathBuf> = io.paths();
        let (again, report) = aligner.align(&io, &second, None).unwrap();
        assert_eq!(again.len(), 2);
        assert!(report.is_noop());
        assert!(again[&BandId::Nir].same_grid(&bands[&BandId::Nir]));
    }

    #[test]
    fn test_missing_reference_fails() {
        let io = MemoryRasterIo::new();
        let aligner = BandAligner::new(AlignmentParams::default()).unwrap();
        let files = vec![PathBuf::from("/x/S_B5.TIF")];
        assert!(matches!(
            aligner.align(&io, &files, None),
            Err(ForestError::InvalidFormat(_))
        ));
    }
}
