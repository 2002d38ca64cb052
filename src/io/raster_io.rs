use crate::core::align::BandStack;
use crate::types::{ForestMask, ForestResult, Raster};
use std::path::Path;

/// Storage backend for georeferenced rasters
///
/// Band rasters carry NaN for nodata; masks use the `CoverClass` byte
/// encoding on disk. Implementations must leave the destination untouched
/// when a write fails.
pub trait RasterIo: Send + Sync {
    /// Read band 1 as f64, nodata mapped to NaN
    fn read_band(&self, path: &Path) -> ForestResult<Raster<f64>>;

    fn write_band(&self, path: &Path, raster: &Raster<f64>) -> ForestResult<()>;

    fn read_mask(&self, path: &Path) -> ForestResult<ForestMask>;

    fn write_mask(&self, path: &Path, mask: &ForestMask) -> ForestResult<()>;

    /// Write every band of the stack, in stack order, to one file
    fn write_stack(&self, path: &Path, stack: &BandStack) -> ForestResult<()>;

    fn exists(&self, path: &Path) -> bool;

    fn remove(&self, path: &Path) -> ForestResult<()>;
}

impl<T: RasterIo + ?Sized> RasterIo for std::sync::Arc<T> {
    fn read_band(&self, path: &Path) -> ForestResult<Raster<f64>> {
        (**self).read_band(path)
    }

    fn write_band(&self, path: &Path, raster: &Raster<f64>) -> ForestResult<()> {
        (**self).write_band(path, raster)
    }

    fn read_mask(&self, path: &Path) -> ForestResult<ForestMask> {
        (**self).read_mask(path)
    }

    fn write_mask(&self, path: &Path, mask: &ForestMask) -> ForestResult<()> {
        (**self).write_mask(path, mask)
    }

    fn write_stack(&self, path: &Path, stack: &BandStack) -> ForestResult<()> {
        (**self).write_stack(path, stack)
    }

    fn exists(&self, path: &Path) -> bool {
        (**self).exists(path)
    }

    fn remove(&self, path: &Path) -> ForestResult<()> {
        (**self).remove(path)
    }
}
