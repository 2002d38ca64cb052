use chrono::NaiveDate;
use forestwatch::config::PipelineConfig;
use forestwatch::core::calibrate::CalibrationMode;
use forestwatch::core::pipeline::{ForestPipeline, SceneInput, SceneOutcome};
use forestwatch::core::report::ForestCoverHistory;
use forestwatch::io::catalog::{scene_folder_name, SceneCatalog};
use forestwatch::io::memory::MemoryRasterIo;
use forestwatch::core::align::BandStack;
use forestwatch::io::raster_io::RasterIo;
use forestwatch::io::region::RegionGeometry;
use forestwatch::types::{CoverClass, ForestError, ForestMask, ForestResult, GeoTransform, Raster, SceneStatus, Stage};
use geo::polygon;
use ndarray::{s, Array2};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const EPSG: u32 = 32618;
const PRODUCT: &str = "LC08_L2SP_008057";

fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2021, 1, day).expect("valid date")
}

fn grid() -> GeoTransform {
    GeoTransform::north_up(500_000.0, 1_000_300.0, 30.0, 30.0)
}

fn region() -> RegionGeometry {
    RegionGeometry::from_polygon(
        "test park",
        polygon![
            (x: 500_000.0, y: 1_000_000.0),
            (x: 500_300.0, y: 1_000_000.0),
            (x: 500_300.0, y: 1_000_300.0),
            (x: 500_000.0, y: 1_000_300.0),
        ],
        EPSG,
    )
    .expect("region")
}

fn config(output: &Path) -> PipelineConfig {
    PipelineConfig {
        region_name: "test park".to_string(),
        description: "synthetic scenes".to_string(),
        output_root: output.to_path_buf(),
        calibration: CalibrationMode::None,
        ..PipelineConfig::default()
    }
}

/// Place a band on disk (for the catalog) and in the memory store (for reading)
fn put_band(io: &MemoryRasterIo, band_dir: &Path, name: &str, data: Array2<f64>) {
    let path = band_dir.join(name);
    std::fs::write(&path, b"").expect("placeholder");
    io.insert_band(&path, Raster::new(data, grid(), EPSG));
}

fn put_scene(io: &MemoryRasterIo, root: &Path, day: u32, red: Array2<f64>, nir: Array2<f64>, qa: Option<Array2<f64>>) {
    let band_dir = root.join(scene_folder_name(date(day))).join("band");
    std::fs::create_dir_all(&band_dir).expect("band dir");
    let stem = format!("{}_202101{:02}_02_T1", PRODUCT, day);
    put_band(io, &band_dir, &format!("{}_SR_B4.TIF", stem), red);
    put_band(io, &band_dir, &format!("{}_SR_B5.TIF", stem), nir);
    put_band(io, &band_dir, &format!("{}_SR_B7.TIF", stem), Array2::from_elem((10, 10), 0.2));
    if let Some(qa) = qa {
        put_band(io, &band_dir, &format!("{}_QA_PIXEL.TIF", stem), qa);
    }
}

/// A: all forest. B: top half forest, bottom half cloud. C: no forest.
fn build_region_dir(io: &MemoryRasterIo, root: &Path) {
    put_scene(
        io,
        root,
        1,
        Array2::from_elem((10, 10), 0.05),
        Array2::from_elem((10, 10), 0.45),
        None,
    );

    let mut qa = Array2::from_elem((10, 10), 21824.0);
    qa.slice_mut(s![5.., ..]).fill(22280.0);
    put_scene(
        io,
        root,
        8,
        Array2::from_elem((10, 10), 0.05),
        Array2::from_elem((10, 10), 0.45),
        Some(qa),
    );

    put_scene(
        io,
        root,
        15,
        Array2::from_elem((10, 10), 0.30),
        Array2::from_elem((10, 10), 0.35),
        None,
    );
}

#[test]
fn test_catalog_to_history() {
    let _ = env_logger::builder().is_test(true).try_init();
    let region_dir = tempfile::tempdir().expect("region dir");
    let output_dir = tempfile::tempdir().expect("output dir");
    let io = Arc::new(MemoryRasterIo::new());
    build_region_dir(&io, region_dir.path());

    let scan = SceneCatalog::new("band")
        .expect("catalog")
        .scan(region_dir.path())
        .expect("scan");
    assert_eq!(scan.inputs.len(), 3);
    assert!(scan.inputs[1].qa_path.is_some());

    let mut pipeline =
        ForestPipeline::new(config(output_dir.path()), region(), Box::new(io.clone())).expect("pipeline");
    let batch = pipeline
        .run(&scan.inputs, &CancellationToken::new())
        .expect("run");

    assert_eq!(batch.accumulated_count(), 3);
    assert_eq!(batch.history.hectares(), vec![9.0, 9.0, 0.0]);
    assert_eq!(batch.history.dates(), vec![date(1), date(8), date(15)]);

    match &batch.outcomes[1] {
        SceneOutcome::Accumulated(processed) => {
            assert_eq!(processed.detected_hectares, 4.5);
            assert_eq!(processed.step.backfilled, 50);
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    let layout = pipeline.layout();
    let merged_b = io.read_mask(&layout.merged_path(date(8))).expect("merged B");
    assert_eq!(merged_b.forest_count(), 100);
    let mask_b = io.read_mask(&layout.mask_path(date(8))).expect("mask B");
    assert_eq!(mask_b.data()[[9, 0]], CoverClass::NoData);
    assert!(io.exists(&layout.ndvi_path(date(15))));

    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(layout.report_path()).expect("report file"))
            .expect("report json");
    assert_eq!(report["protected_area_name"], "test park");
    assert_eq!(report["last_detection_date"], "2021-01-15");
    let extension = report["total_extension_protected_area"].as_f64().expect("extension");
    assert!((extension - 9.0).abs() < 1e-6);
    assert_eq!(report["total_extension_forest_cover_list"][2], 0.0);
}

#[test]
fn test_resume_skips_accumulated_scenes() {
    let region_dir = tempfile::tempdir().expect("region dir");
    let output_dir = tempfile::tempdir().expect("output dir");
    let io = Arc::new(MemoryRasterIo::new());
    build_region_dir(&io, region_dir.path());
    let scan = SceneCatalog::new("band")
        .expect("catalog")
        .scan(region_dir.path())
        .expect("scan");

    let cancel = CancellationToken::new();
    let mut first = ForestPipeline::new(config(output_dir.path()), region(), Box::new(io.clone()))
        .expect("pipeline");
    first.run(&scan.inputs[..2], &cancel).expect("first run");

    let mut resumed = ForestPipeline::open(config(output_dir.path()), region(), Box::new(io.clone()))
        .expect("reopen");
    assert_eq!(resumed.history().len(), 2);
    assert_eq!(resumed.ledger().status(date(8)), Some(SceneStatus::Accumulated));

    let batch = resumed.run(&scan.inputs, &cancel).expect("resumed run");
    assert_eq!(batch.skipped_count(), 2);
    assert_eq!(batch.accumulated_count(), 1);
    assert_eq!(batch.history.hectares(), vec![9.0, 9.0, 0.0]);
}

#[test]
fn test_out_of_order_input_aborts_run() {
    let region_dir = tempfile::tempdir().expect("region dir");
    let output_dir = tempfile::tempdir().expect("output dir");
    let io = Arc::new(MemoryRasterIo::new());
    build_region_dir(&io, region_dir.path());
    let mut scan = SceneCatalog::new("band")
        .expect("catalog")
        .scan(region_dir.path())
        .expect("scan");
    scan.inputs.swap(0, 2);

    let mut pipeline =
        ForestPipeline::new(config(output_dir.path()), region(), Box::new(io.clone())).expect("pipeline");
    let err = pipeline
        .run(&scan.inputs, &CancellationToken::new())
        .unwrap_err();

    assert!(err.is_fatal_for_run());
    assert_eq!(err.stage(), Some(Stage::Accumulate));
    assert_eq!(pipeline.history().dates(), vec![date(15)]);
    assert_eq!(pipeline.ledger().status(date(8)), Some(SceneStatus::Failed));
}

#[test]
fn test_broken_scene_is_reported_and_run_continues() {
    let region_dir = tempfile::tempdir().expect("region dir");
    let output_dir = tempfile::tempdir().expect("output dir");
    let io = Arc::new(MemoryRasterIo::new());
    build_region_dir(&io, region_dir.path());
    let scan = SceneCatalog::new("band")
        .expect("catalog")
        .scan(region_dir.path())
        .expect("scan");

    // scene B loses its NIR band after discovery
    let mut inputs: Vec<SceneInput> = scan.inputs.clone();
    inputs[1].band_files.retain(|p| !p.to_string_lossy().ends_with("_B5.TIF"));

    let mut pipeline =
        ForestPipeline::new(config(output_dir.path()), region(), Box::new(io.clone())).expect("pipeline");
    let batch = pipeline.run(&inputs, &CancellationToken::new()).expect("run");

    assert_eq!(batch.accumulated_count(), 2);
    let failures: Vec<&SceneOutcome> = batch.failures().collect();
    assert_eq!(failures.len(), 1);
    match failures[0] {
        SceneOutcome::Failed { date: d, stage, .. } => {
            assert_eq!(*d, date(8));
            assert_eq!(*stage, Some(Stage::Align));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(batch.history.dates(), vec![date(1), date(15)]);
}

#[test]
fn test_cancelled_run_stops() {
    let output_dir = tempfile::tempdir().expect("output dir");
    let mut pipeline = ForestPipeline::new(
        config(output_dir.path()),
        region(),
        Box::new(MemoryRasterIo::new()),
    )
    .expect("pipeline");

    let cancel = CancellationToken::new();
    cancel.cancel();
    let inputs = vec![SceneInput::new(date(1), PRODUCT)];
    assert!(matches!(pipeline.run(&inputs, &cancel), Err(ForestError::Cancelled)));
}

/// Memory store whose first merged-mask write fails
struct FailFirstMergedWrite {
    inner: Arc<MemoryRasterIo>,
    failed: AtomicBool,
}

impl RasterIo for FailFirstMergedWrite {
    fn read_band(&self, path: &Path) -> ForestResult<Raster<f64>> {
        self.inner.read_band(path)
    }

    fn write_band(&self, path: &Path, raster: &Raster<f64>) -> ForestResult<()> {
        self.inner.write_band(path, raster)
    }

    fn read_mask(&self, path: &Path) -> ForestResult<ForestMask> {
        self.inner.read_mask(path)
    }

    fn write_mask(&self, path: &Path, mask: &ForestMask) -> ForestResult<()> {
        let merged = path.to_string_lossy().ends_with("forest_merged.tif");
        if merged && !self.failed.swap(true, Ordering::SeqCst) {
            return Err(ForestError::RasterIo(format!("disk full writing {}", path.display())));
        }
        self.inner.write_mask(path, mask)
    }

    fn write_stack(&self, path: &Path, stack: &BandStack) -> ForestResult<()> {
        self.inner.write_stack(path, stack)
    }

    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }

    fn remove(&self, path: &Path) -> ForestResult<()> {
        self.inner.remove(path)
    }
}

#[test]
fn test_failed_persist_keeps_scene_out_of_history() {
    let region_dir = tempfile::tempdir().expect("region dir");
    let output_dir = tempfile::tempdir().expect("output dir");
    let io = Arc::new(MemoryRasterIo::new());
    build_region_dir(&io, region_dir.path());
    let scan = SceneCatalog::new("band")
        .expect("catalog")
        .scan(region_dir.path())
        .expect("scan");

    let flaky = FailFirstMergedWrite {
        inner: io.clone(),
        failed: AtomicBool::new(false),
    };
    let mut pipeline =
        ForestPipeline::new(config(output_dir.path()), region(), Box::new(flaky)).expect("pipeline");
    let batch = pipeline
        .run(&scan.inputs[..2], &CancellationToken::new())
        .expect("run");

    match &batch.outcomes[0] {
        SceneOutcome::Failed { date: d, stage, .. } => {
            assert_eq!(*d, date(1));
            assert_eq!(*stage, Some(Stage::Persist));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(pipeline.ledger().status(date(1)), Some(SceneStatus::Failed));
    assert_eq!(pipeline.history().dates(), vec![date(8)]);
    assert_eq!(batch.history.hectares(), vec![4.5]);

    let saved = ForestCoverHistory::load(pipeline.layout().history_path()).expect("saved history");
    assert_eq!(saved.dates(), vec![date(8)]);
    assert!(!io.exists(&pipeline.layout().merged_path(date(1))));
}

#[test]
fn test_resume_after_failed_scene_continues() {
    let region_dir = tempfile::tempdir().expect("region dir");
    let output_dir = tempfile::tempdir().expect("output dir");
    let io = Arc::new(MemoryRasterIo::new());
    build_region_dir(&io, region_dir.path());
    let catalog = SceneCatalog::new("band").expect("catalog");
    let scan = catalog.scan(region_dir.path()).expect("scan");

    let mut inputs: Vec<SceneInput> = scan.inputs.clone();
    inputs[1].band_files.retain(|p| !p.to_string_lossy().ends_with("_B5.TIF"));
    let cancel = CancellationToken::new();
    let mut first = ForestPipeline::new(config(output_dir.path()), region(), Box::new(io.clone()))
        .expect("pipeline");
    let batch = first.run(&inputs, &cancel).expect("first run");
    assert_eq!(batch.accumulated_count(), 2);
    assert_eq!(batch.failures().count(), 1);

    // a newer scene arrives after the first run
    put_scene(
        &io,
        region_dir.path(),
        22,
        Array2::from_elem((10, 10), 0.05),
        Array2::from_elem((10, 10), 0.45),
        None,
    );
    let rescan = catalog.scan(region_dir.path()).expect("rescan");
    assert_eq!(rescan.inputs.len(), 4);

    let mut resumed = ForestPipeline::open(config(output_dir.path()), region(), Box::new(io.clone()))
        .expect("reopen");
    assert!(resumed.is_superseded(date(8)));
    let batch = resumed.run(&rescan.inputs, &cancel).expect("resumed run");

    assert_eq!(batch.skipped_count(), 3);
    assert_eq!(batch.accumulated_count(), 1);
    match &batch.outcomes[1] {
        SceneOutcome::Skipped { date: d, reason } => {
            assert_eq!(*d, date(8));
            assert!(reason.contains("superseded"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(batch.history.dates(), vec![date(1), date(15), date(22)]);
    assert_eq!(batch.history.hectares(), vec![9.0, 0.0, 9.0]);
}
