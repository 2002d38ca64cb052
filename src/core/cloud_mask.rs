//! Landsat 8/9 Collection-2 QA_PIXEL cloud masking
//!
//! The QA band is a 16-bit bitfield. Only the single-bit flags used for
//! gap detection are modelled; confidence pairs (bits 8-15) are ignored.

use crate::types::{ForestResult, IndexRaster, Raster};
use ndarray::Zip;
use serde::{Deserialize, Serialize};

/// Single-bit QA_PIXEL flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaFlag {
    Fill,
    DilatedCloud,
    Cirrus,
    Cloud,
    CloudShadow,
}

impl QaFlag {
    pub fn bit(self) -> u8 {
        match self {
            QaFlag::Fill => 0,
            QaFlag::DilatedCloud => 1,
            QaFlag::Cirrus => 2,
            QaFlag::Cloud => 3,
            QaFlag::CloudShadow => 4,
        }
    }

    pub fn mask(self) -> u16 {
        1 << self.bit()
    }
}

/// Default flags that invalidate a pixel
pub fn default_flags() -> Vec<QaFlag> {
    vec![QaFlag::Cloud, QaFlag::CloudShadow]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QaPixelMask {
    flags: Vec<QaFlag>,
    bits: u16,
}

impl Default for QaPixelMask {
    fn default() -> Self {
        Self::new(&default_flags())
    }
}

impl QaPixelMask {
    pub fn new(flags: &[QaFlag]) -> Self {
        let mut flags = flags.to_vec();
        flags.sort();
        flags.dedup();
        let bits = flags.iter().fold(0u16, |acc, f| acc | f.mask());
        Self { flags, bits }
    }

    pub fn flags(&self) -> &[QaFlag] {
        &self.flags
    }

    pub fn bits(&self) -> u16 {
        self.bits
    }

    /// True if the QA value carries any configured flag. Missing or
    /// out-of-range QA values count as flagged.
    pub fn is_flagged(&self, qa_value: f64) -> bool {
        if !qa_value.is_finite() || qa_value < 0.0 || qa_value > u16::MAX as f64 {
            return true;
        }
        (qa_value as u16) & self.bits != 0
    }

    /// Set index pixels to NaN wherever the QA band is flagged
    pub fn apply(&self, index: &IndexRaster, qa: &Raster<f64>) -> ForestResult<IndexRaster> {
        index.ensure_same_grid(qa)?;

        let masked = Zip::from(index.data())
            .and(qa.data())
            .map_collect(|&v, &q| if self.is_flagged(q) { f64::NAN } else { v });

        let flagged = qa.data().iter().filter(|&&q| self.is_flagged(q)).count();
        log::info!(
            "QA mask {:?}: {} of {} pixels flagged",
            self.flags,
            flagged,
            qa.data().len()
        );
        index.with_data(masked)
    }
}
