//! Multi-date forest mask accumulation
//!
//! The accumulator owns the running merged mask and the area history of
//! one region. Each new date's mask is merged onto the previous result:
//! pixels that are nodata in the new mask (cloud, shadow, fill) take the
//! last valid class, every valid new pixel wins. Dates must strictly
//! increase, otherwise "previous" would not mean chronologically previous.

use crate::core::report::{to_hectares, ForestCoverHistory};
use crate::types::{ForestError, ForestMask, ForestResult, Pixel};
use chrono::NaiveDate;
use ndarray::Zip;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccumulatorState {
    /// No scene processed
    Empty,
    /// One scene stored as the baseline
    Seeded,
    /// Two or more scenes merged
    Accumulating,
}

/// Last-valid-value-wins-on-gap merge of `new` onto `prev`
pub fn merge_gap_fill(prev: &ForestMask, new: &ForestMask) -> ForestResult<ForestMask> {
    prev.ensure_same_grid(new)?;
    let merged = Zip::from(prev.data())
        .and(new.data())
        .map_collect(|&p, &n| if n.is_nodata() && p.is_valid() { p } else { n });
    new.with_data(merged)
}

fn backfilled_count(prev: &ForestMask, new: &ForestMask) -> usize {
    prev.data()
        .iter()
        .zip(new.data().iter())
        .filter(|(p, n)| n.is_nodata() && p.is_valid())
        .count()
}

/// Result of accumulating one date
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccumulationStep {
    pub date: NaiveDate,
    pub hectares: f64,
    /// State after the step
    pub state: AccumulatorState,
    /// The incoming mask had no valid pixel
    pub all_invalid: bool,
    /// Pixels filled from the previous merged mask
    pub backfilled: usize,
}

#[derive(Debug, Clone)]
pub struct TemporalAccumulator {
    state: AccumulatorState,
    merged: Option<ForestMask>,
    history: ForestCoverHistory,
}

impl TemporalAccumulator {
    pub fn new(region_name: impl Into<String>) -> Self {
        Self {
            state: AccumulatorState::Empty,
            merged: None,
            history: ForestCoverHistory::new(region_name),
        }
    }

    /// Resume from a persisted history and its last merged mask
    pub fn restore(history: ForestCoverHistory, merged: Option<ForestMask>) -> ForestResult<Self> {
        let state = match (history.len(), merged.is_some()) {
            (0, false) => AccumulatorState::Empty,
            (1, true) => AccumulatorState::Seeded,
            (_, true) if history.len() > 1 => AccumulatorState::Accumulating,
            (n, _) => {
                return Err(ForestError::Processing(format!(
                    "cannot restore accumulator: {} history entries but merged mask {}",
                    n,
                    if merged.is_some() { "present" } else { "missing" }
                )))
            }
        };
        log::info!(
            "Restored accumulator for '{}' in state {:?} ({} entries)",
            history.region_name(),
            state,
            history.len()
        );
        Ok(Self {
            state,
            merged,
            history,
        })
    }

    pub fn state(&self) -> AccumulatorState {
        self.state
    }

    pub fn merged(&self) -> Option<&ForestMask> {
        self.merged.as_ref()
    }

    pub fn history(&self) -> &ForestCoverHistory {
        &self.history
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.history.last_date()
    }

    pub fn into_parts(self) -> (ForestCoverHistory, Option<ForestMask>) {
        (self.history, self.merged)
    }

    /// Fails with `OutOfOrderScene` unless `date` is after the last accumulated date
    pub fn check_order(&self, date: NaiveDate) -> ForestResult<()> {
        match self.last_date() {
            Some(last) if date <= last => Err(ForestError::OutOfOrderScene { date, last }),
            _ => Ok(()),
        }
    }

    /// Merge the mask of a new date and append its forest area
    pub fn push(&mut self, date: NaiveDate, mask: ForestMask) -> ForestResult<AccumulationStep> {
        let staged = self.stage(date, mask)?;
        Ok(self.commit(staged))
    }

    /// Compute the next merged mask and history without changing the accumulator.
    ///
    /// Nothing is recorded until the result is passed to [`TemporalAccumulator::commit`],
    /// so a caller can persist the staged state first and drop it on failure.
    pub fn stage(&self, date: NaiveDate, mask: ForestMask) -> ForestResult<StagedAccumulation> {
        self.check_order(date)?;

        let all_invalid = mask.is_all_invalid();
        if all_invalid {
            log::warn!("{}", ForestError::AllInvalidScene(date));
        }

        let (merged, backfilled) = match &self.merged {
            None => (mask, 0),
            Some(prev) => {
                let merged = merge_gap_fill(prev, &mask)?;
                (merged, backfilled_count(prev, &mask))
            }
        };

        merged.pixel_area()?;
        let (x_res, y_res) = merged.transform().resolution();
        let hectares = to_hectares(merged.forest_count(), x_res, y_res);
        let mut history = self.history.clone();
        history.append(date, hectares)?;

        let state = match self.state {
            AccumulatorState::Empty => AccumulatorState::Seeded,
            _ => AccumulatorState::Accumulating,
        };

        Ok(StagedAccumulation {
            step: AccumulationStep {
                date,
                hectares,
                state,
                all_invalid,
                backfilled,
            },
            merged,
            history,
        })
    }

    /// Make a staged date part of the accumulated state
    pub fn commit(&mut self, staged: StagedAccumulation) -> AccumulationStep {
        let StagedAccumulation {
            step,
            merged,
            history,
        } = staged;
        self.state = step.state;
        self.merged = Some(merged);
        self.history = history;

        log::info!(
            "Accumulated {}: {:.2} ha forest ({} pixels backfilled, state {:?})",
            step.date,
            step.hectares,
            step.backfilled,
            step.state
        );
        step
    }
}

/// Accumulation of one date that has been computed but not yet committed
#[derive(Debug, Clone)]
pub struct StagedAccumulation {
    step: AccumulationStep,
    merged: ForestMask,
    history: ForestCoverHistory,
}

impl StagedAccumulation {
    pub fn step(&self) -> &AccumulationStep {
        &self.step
    }

    /// Merged mask including this date
    pub fn merged(&self) -> &ForestMask {
        &self.merged
    }

    /// History including this date
    pub fn history(&self) -> &ForestCoverHistory {
        &self.history
    }
}
