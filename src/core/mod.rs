//! Forest-cover processing stages

pub mod accumulator;
pub mod align;
pub mod calibrate;
pub mod cloud_mask;
pub mod pipeline;
pub mod report;
pub mod vegetation;

// Re-export main types
pub use accumulator::{merge_gap_fill, AccumulationStep, AccumulatorState, StagedAccumulation, TemporalAccumulator};
pub use align::{
    resample_to_grid, stack_bands, AlignmentParams, AlignmentReport, BandAligner, BandStack, ItemOutcome,
    SourcePolicy,
};
pub use calibrate::{CalibrationMode, CoefficientKind, RadiometricCalibrator, RescalingCoefficients};
pub use cloud_mask::{QaFlag, QaPixelMask};
pub use pipeline::{BatchReport, ForestPipeline, ProcessingLedger, SceneInput, SceneOutcome};
pub use report::{to_hectares, ForestCoverHistory, ForestCoverReport, HistoryEntry};
pub use vegetation::{classify, clip_and_measure, compute_index, IndexVariant, VegetationIndexEngine, VegetationParams};
