//! Sequential forest-cover pipeline for one region
//!
//! Each scene is fully processed (align, calibrate, index, classify,
//! accumulate, persist) before the next one starts. Per-scene failures are
//! recorded and the run continues; ordering violations and cancellation
//! stop the run.

use crate::config::PipelineConfig;
use crate::core::accumulator::{AccumulationStep, StagedAccumulation, TemporalAccumulator};
use crate::core::align::{resample_to_grid, stack_bands, BandAligner};
use crate::core::calibrate::{CalibrationMode, RadiometricCalibrator};
use crate::core::cloud_mask::QaPixelMask;
use crate::core::report::{read_json, write_json_atomic, ForestCoverHistory, ForestCoverReport};
use crate::core::vegetation::VegetationIndexEngine;
use crate::io::catalog::scene_folder_name;
use crate::io::mtl::MtlDocument;
use crate::io::raster_io::RasterIo;
use crate::io::region::RegionGeometry;
use crate::types::{
    BandId, ForestError, ForestMask, ForestResult, IndexRaster, Raster, Scene, SceneStatus, Stage,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Files that make up one acquisition
#[derive(Debug, Clone, PartialEq)]
pub struct SceneInput {
    pub date: NaiveDate,
    pub product_id: String,
    pub band_files: Vec<PathBuf>,
    pub metadata_path: Option<PathBuf>,
    pub qa_path: Option<PathBuf>,
}

impl SceneInput {
    pub fn new(date: NaiveDate, product_id: impl Into<String>) -> Self {
        Self {
            date,
            product_id: product_id.into(),
            band_files: Vec::new(),
            metadata_path: None,
            qa_path: None,
        }
    }
}

/// Where a run writes its products
#[derive(Debug, Clone, PartialEq)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scene_dir(&self, date: NaiveDate) -> PathBuf {
        self.root.join(scene_folder_name(date))
    }

    pub fn ndvi_path(&self, date: NaiveDate) -> PathBuf {
        self.scene_dir(date).join("ndvi.tif")
    }

    pub fn mask_path(&self, date: NaiveDate) -> PathBuf {
        self.scene_dir(date).join("forest_mask.tif")
    }

    pub fn merged_path(&self, date: NaiveDate) -> PathBuf {
        self.scene_dir(date).join("forest_merged.tif")
    }

    pub fn stack_path(&self, date: NaiveDate) -> PathBuf {
        self.scene_dir(date).join("stack.tif")
    }

    pub fn history_path(&self) -> PathBuf {
        self.root.join("forest_cover_history.json")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.root.join("ledger.json")
    }

    pub fn report_path(&self) -> PathBuf {
        self.root.join("forest_cover_report.json")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub product_id: String,
    pub status: SceneStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-date processing status, persisted next to the history
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingLedger {
    scenes: BTreeMap<NaiveDate, LedgerEntry>,
}

impl ProcessingLedger {
    pub fn load<P: AsRef<Path>>(path: P) -> ForestResult<Self> {
        read_json(path)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> ForestResult<()> {
        write_json_atomic(path, self)
    }

    pub fn mark(&mut self, date: NaiveDate, product_id: &str, status: SceneStatus) {
        self.scenes.insert(
            date,
            LedgerEntry {
                product_id: product_id.to_string(),
                status,
                stage: None,
                error: None,
            },
        );
    }

    pub fn fail(&mut self, date: NaiveDate, product_id: &str, error: &ForestError) {
        self.scenes.insert(
            date,
            LedgerEntry {
                product_id: product_id.to_string(),
                status: SceneStatus::Failed,
                stage: error.stage(),
                error: Some(error.to_string()),
            },
        );
    }

    pub fn get(&self, date: NaiveDate) -> Option<&LedgerEntry> {
        self.scenes.get(&date)
    }

    pub fn status(&self, date: NaiveDate) -> Option<SceneStatus> {
        self.scenes.get(&date).map(|e| e.status)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&NaiveDate, &LedgerEntry)> {
        self.scenes.iter()
    }

    pub fn len(&self) -> usize {
        self.scenes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty()
    }
}

/// A scene that made it into the history
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessedScene {
    pub step: AccumulationStep,
    /// Forest area detected in this scene alone, before gap filling
    pub detected_hectares: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SceneOutcome {
    Accumulated(ProcessedScene),
    Skipped { date: NaiveDate, reason: String },
    Failed { date: NaiveDate, stage: Option<Stage>, error: String },
}

impl SceneOutcome {
    pub fn date(&self) -> NaiveDate {
        match self {
            SceneOutcome::Accumulated(p) => p.step.date,
            SceneOutcome::Skipped { date, .. } | SceneOutcome::Failed { date, .. } => *date,
        }
    }
}

/// Per-run summary: one outcome per input, plus the history afterwards
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub outcomes: Vec<SceneOutcome>,
    pub history: ForestCoverHistory,
}

impl BatchReport {
    pub fn accumulated_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, SceneOutcome::Accumulated(_)))
            .count()
    }

    pub fn skipped_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, SceneOutcome::Skipped { .. }))
            .count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &SceneOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, SceneOutcome::Failed { .. }))
    }
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> ForestResult<()> {
    if cancel.is_cancelled() {
        Err(ForestError::Cancelled)
    } else {
        Ok(())
    }
}

pub struct ForestPipeline {
    config: PipelineConfig,
    region: RegionGeometry,
    io: Box<dyn RasterIo>,
    layout: OutputLayout,
    aligner: BandAligner,
    engine: VegetationIndexEngine,
    qa_mask: Option<QaPixelMask>,
    accumulator: TemporalAccumulator,
    ledger: ProcessingLedger,
}

impl ForestPipeline {
    /// Start a fresh run, ignoring anything already in the output root
    pub fn new(config: PipelineConfig, region: RegionGeometry, io: Box<dyn RasterIo>) -> ForestResult<Self> {
        config.validate()?;
        if region.epsg() != config.region_epsg {
            return Err(ForestError::Config(format!(
                "region '{}' is in EPSG:{} but the run is configured for EPSG:{}",
                region.name(),
                region.epsg(),
                config.region_epsg
            )));
        }

        log::info!(
            "Forest pipeline for '{}': threshold {}, {:?} index, {:?} calibration",
            config.region_name,
            config.forest_threshold,
            config.index_variant,
            config.calibration
        );

        Ok(Self {
            layout: OutputLayout::new(&config.output_root),
            aligner: BandAligner::new(config.alignment_params())?,
            engine: VegetationIndexEngine::new(config.vegetation_params()),
            qa_mask: config.qa_mask(),
            accumulator: TemporalAccumulator::new(config.region_name.clone()),
            ledger: ProcessingLedger::default(),
            config,
            region,
            io,
        })
    }

    /// Resume from the history, last merged mask and ledger in the output root
    pub fn open(config: PipelineConfig, region: RegionGeometry, io: Box<dyn RasterIo>) -> ForestResult<Self> {
        let mut pipeline = Self::new(config, region, io)?;

        let history_path = pipeline.layout.history_path();
        if history_path.exists() {
            let history = ForestCoverHistory::load(&history_path)?;
            if history.region_name() != pipeline.config.region_name {
                log::warn!(
                    "History belongs to '{}', configured region is '{}'",
                    history.region_name(),
                    pipeline.config.region_name
                );
            }
            let merged = match history.last_date() {
                Some(date) => Some(pipeline.io.read_mask(&pipeline.layout.merged_path(date))?),
                None => None,
            };
            pipeline.accumulator = TemporalAccumulator::restore(history, merged)?;
        }

        let ledger_path = pipeline.layout.ledger_path();
        if ledger_path.exists() {
            pipeline.ledger = ProcessingLedger::load(&ledger_path)?;
        }
        Ok(pipeline)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn region(&self) -> &RegionGeometry {
        &self.region
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    pub fn accumulator(&self) -> &TemporalAccumulator {
        &self.accumulator
    }

    pub fn history(&self) -> &ForestCoverHistory {
        self.accumulator.history()
    }

    pub fn ledger(&self) -> &ProcessingLedger {
        &self.ledger
    }

    /// Date already in the history and marked accumulated
    pub fn is_done(&self, date: NaiveDate) -> bool {
        self.ledger.status(date) == Some(SceneStatus::Accumulated) && self.history().contains(date)
    }

    /// Date that failed in an earlier run and now lies at or before the last accumulated date
    pub fn is_superseded(&self, date: NaiveDate) -> bool {
        self.ledger.status(date) == Some(SceneStatus::Failed)
            && self.accumulator.last_date().map_or(false, |last| date <= last)
    }

    pub fn report(&self) -> ForestCoverReport {
        ForestCoverReport::from_history(
            self.history(),
            self.region.area_hectares(),
            self.config.description.clone(),
        )
    }

    pub fn write_report(&self) -> ForestResult<ForestCoverReport> {
        let report = self.report();
        report.save(self.layout.report_path())?;
        Ok(report)
    }

    /// Process scenes in the given order
    pub fn run(&mut self, inputs: &[SceneInput], cancel: &CancellationToken) -> ForestResult<BatchReport> {
        log::info!("Processing {} scene(s) for '{}'", inputs.len(), self.config.region_name);
        let mut batch = BatchReport::default();

        for input in inputs {
            ensure_not_cancelled(cancel)?;

            if self.is_done(input.date) {
                log::info!("Skipping {}: already accumulated", input.date);
                batch.outcomes.push(SceneOutcome::Skipped {
                    date: input.date,
                    reason: "already accumulated".to_string(),
                });
                continue;
            }
            if self.is_superseded(input.date) {
                log::warn!(
                    "Skipping {}: failed earlier and a later date is already accumulated",
                    input.date
                );
                batch.outcomes.push(SceneOutcome::Skipped {
                    date: input.date,
                    reason: "superseded by later accumulated date".to_string(),
                });
                continue;
            }

            match self.process_input(input, cancel) {
                Ok(processed) => batch.outcomes.push(SceneOutcome::Accumulated(processed)),
                Err(ForestError::Cancelled) => {
                    log::warn!("Run cancelled at scene {}", input.date);
                    self.save_ledger()?;
                    return Err(ForestError::Cancelled);
                }
                Err(e) => {
                    self.ledger.fail(input.date, &input.product_id, &e);
                    self.save_ledger()?;
                    if e.is_fatal_for_run() {
                        log::error!("Aborting run: {}", e);
                        return Err(e);
                    }
                    log::warn!("{}", e);
                    batch.outcomes.push(SceneOutcome::Failed {
                        date: input.date,
                        stage: e.stage(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if !self.history().is_empty() {
            self.write_report()?;
        }
        batch.history = self.history().clone();
        log::info!(
            "Run finished: {} accumulated, {} skipped, {} failed",
            batch.accumulated_count(),
            batch.skipped_count(),
            batch.failures().count()
        );
        Ok(batch)
    }

    /// Load, align and process one scene from its files
    pub fn process_input(&mut self, input: &SceneInput, cancel: &CancellationToken) -> ForestResult<ProcessedScene> {
        self.accumulator
            .check_order(input.date)
            .map_err(|e| e.in_scene(input.date, Stage::Accumulate))?;
        let scene = self.load_scene(input, cancel)?;
        self.process_scene(scene, cancel)
    }

    /// Read the metadata, align the bands onto the red grid and attach the QA band
    pub fn load_scene(&mut self, input: &SceneInput, cancel: &CancellationToken) -> ForestResult<Scene> {
        let date = input.date;
        ensure_not_cancelled(cancel)?;

        let metadata = match &input.metadata_path {
            Some(path) => MtlDocument::from_file(path).map_err(|e| e.in_scene(date, Stage::Discover))?,
            None if self.config.calibration == CalibrationMode::None => MtlDocument::default(),
            None => {
                return Err(ForestError::MissingMetadataKey("MTL metadata file".to_string())
                    .in_scene(date, Stage::Discover))
            }
        };

        let (bands, alignment) = self
            .aligner
            .align(self.io.as_ref(), &input.band_files, Some(&self.region))
            .map_err(|e| e.in_scene(date, Stage::Align))?;
        for item in alignment.failures() {
            log::warn!("Scene {}: {} not aligned: {:?}", date, item.path.display(), item.outcome);
        }

        let mut scene = Scene::new(date, input.product_id.clone(), bands, metadata)
            .map_err(|e| e.in_scene(date, Stage::Align))?;

        if let (Some(_), Some(qa_path)) = (&self.qa_mask, &input.qa_path) {
            ensure_not_cancelled(cancel)?;
            let qa = self.load_qa(qa_path, scene.red()).map_err(|e| e.in_scene(date, Stage::Align))?;
            scene = scene.with_qa(qa).map_err(|e| e.in_scene(date, Stage::Align))?;
        }

        if self.config.write_stack {
            ensure_not_cancelled(cancel)?;
            stack_bands(scene.bands())
                .and_then(|stack| self.io.write_stack(&self.layout.stack_path(date), &stack))
                .map_err(|e| e.in_scene(date, Stage::Persist))?;
        }

        self.ledger.mark(date, &input.product_id, SceneStatus::Aligned);
        Ok(scene)
    }

    fn load_qa(&self, path: &Path, reference: &Raster<f64>) -> ForestResult<Raster<f64>> {
        let qa = self.io.read_band(path)?;
        resample_to_grid(&qa, reference.transform(), reference.shape(), reference.epsg())
    }

    /// Calibrate, classify and accumulate an already aligned scene
    pub fn process_scene(&mut self, scene: Scene, cancel: &CancellationToken) -> ForestResult<ProcessedScene> {
        let date = scene.date();
        let product_id = scene.product_id().to_string();
        ensure_not_cancelled(cancel)?;
        self.accumulator
            .check_order(date)
            .map_err(|e| e.in_scene(date, Stage::Accumulate))?;

        let calibrated = self.calibrate(&scene).map_err(|e| e.in_scene(date, Stage::Calibrate))?;
        self.ledger.mark(date, &product_id, SceneStatus::Calibrated);

        let (index, mask, detected_hectares) = self
            .classify(&scene, &calibrated)
            .map_err(|e| e.in_scene(date, Stage::Index))?;
        self.ledger.mark(date, &product_id, SceneStatus::Indexed);

        ensure_not_cancelled(cancel)?;
        self.io
            .write_band(&self.layout.ndvi_path(date), &index)
            .and_then(|_| self.io.write_mask(&self.layout.mask_path(date), &mask))
            .map_err(|e| e.in_scene(date, Stage::Persist))?;

        let staged = self
            .accumulator
            .stage(date, mask)
            .map_err(|e| e.in_scene(date, Stage::Accumulate))?;

        self.persist_accumulation(date, &staged)
            .map_err(|e| e.in_scene(date, Stage::Persist))?;
        let step = self.accumulator.commit(staged);
        self.ledger.mark(date, &product_id, SceneStatus::Accumulated);
        self.save_ledger().map_err(|e| e.in_scene(date, Stage::Persist))?;

        Ok(ProcessedScene {
            step,
            detected_hectares,
        })
    }

    fn calibrate(&self, scene: &Scene) -> ForestResult<BTreeMap<BandId, Raster<f64>>> {
        let bands: Vec<BandId> = scene.bands().keys().copied().collect();
        let calibrator = RadiometricCalibrator::from_metadata(
            scene.metadata(),
            scene.product_id(),
            self.config.calibration,
            &bands,
        )?;
        calibrator.calibrate_scene(scene)
    }

    fn classify(
        &self,
        scene: &Scene,
        calibrated: &BTreeMap<BandId, Raster<f64>>,
    ) -> ForestResult<(IndexRaster, ForestMask, f64)> {
        let band = |id: BandId| {
            calibrated
                .get(&id)
                .ok_or_else(|| ForestError::InvalidFormat(format!("calibrated scene has no {}", id)))
        };

        let mut index = self.engine.compute_index(band(BandId::Red)?, band(BandId::Nir)?)?;
        if let (Some(qa_mask), Some(qa)) = (&self.qa_mask, scene.qa()) {
            index = qa_mask.apply(&index, qa)?;
        }
        let index = self.region.clip(&index)?;

        let mask = self.engine.classify(&index);
        let (mask, hectares) = self.engine.clip_and_measure(&mask, &self.region)?;
        Ok((index, mask, hectares))
    }

    fn persist_accumulation(&self, date: NaiveDate, staged: &StagedAccumulation) -> ForestResult<()> {
        self.io.write_mask(&self.layout.merged_path(date), staged.merged())?;
        staged.history().save(self.layout.history_path())
    }

    fn save_ledger(&self) -> ForestResult<()> {
        self.ledger.save(self.layout.ledger_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::memory::MemoryRasterIo;
    use crate::types::GeoTransform;
    use geo::polygon;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 1, day).unwrap()
    }

    fn setup(root: &Path) -> ForestPipeline {
        let config = PipelineConfig {
            region_name: "park".to_string(),
            output_root: root.to_path_buf(),
            calibration: CalibrationMode::None,
            ..PipelineConfig::default()
        };
        let region = RegionGeometry::from_polygon(
            "park",
            polygon![(x: 0.0, y: 0.0), (x: 120.0, y: 0.0), (x: 120.0, y: 120.0), (x: 0.0, y: 120.0)],
            32618,
        )
        .unwrap();
        ForestPipeline::new(config, region, Box::new(MemoryRasterIo::new())).unwrap()
    }

    fn scene(date: NaiveDate, red: f64, nir: f64) -> Scene {
        let gt = GeoTransform::north_up(0.0, 120.0, 30.0, 30.0);
        let mut bands = BTreeMap::new();
        bands.insert(BandId::Red, Raster::filled(4, 4, red, gt, 32618));
        bands.insert(BandId::Nir, Raster::filled(4, 4, nir, gt, 32618));
        Scene::new(date, "LC08_L2SP_008057_20210101", bands, MtlDocument::default()).unwrap()
    }

    #[test]
    fn test_layout_paths() {
        let layout = OutputLayout::new("/out");
        assert_eq!(layout.mask_path(d(8)), PathBuf::from("/out/2021-01-08/forest_mask.tif"));
        assert_eq!(layout.history_path(), PathBuf::from("/out/forest_cover_history.json"));
    }

    #[test]
    fn test_process_scene_updates_history_and_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = setup(dir.path());
        let cancel = CancellationToken::new();

        let processed = pipeline.process_scene(scene(d(1), 0.05, 0.45), &cancel).unwrap();
        assert!((processed.step.hectares - 1.44).abs() < 1e-9);
        assert_eq!(pipeline.ledger().status(d(1)), Some(SceneStatus::Accumulated));
        assert!(pipeline.layout().history_path().exists());

        let err = pipeline.process_scene(scene(d(1), 0.05, 0.45), &cancel).unwrap_err();
        assert!(err.is_fatal_for_run());
        assert_eq!(err.stage(), Some(Stage::Accumulate));
    }

    #[test]
    fn test_cancelled_before_work() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = setup(dir.path());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = pipeline.process_scene(scene(d(1), 0.05, 0.45), &cancel);
        assert!(matches!(result, Err(ForestError::Cancelled)));
        assert!(pipeline.history().is_empty());
    }

    #[test]
    fn test_region_crs_must_match_config() {
        let config = PipelineConfig {
            region_epsg: 32619,
            ..PipelineConfig::default()
        };
        let region = RegionGeometry::from_polygon(
            "park",
            polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0)],
            32618,
        )
        .unwrap();
        let result = ForestPipeline::new(config, region, Box::new(MemoryRasterIo::new()));
        assert!(matches!(result, Err(ForestError::Config(_))));
    }
}
