use crate::core::align::BandStack;
use crate::io::raster_io::RasterIo;
use crate::types::{ForestError, ForestMask, ForestResult, Raster};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone)]
enum Stored {
    Band(Raster<f64>),
    Mask(ForestMask),
    Stack(BandStack),
}

impl Stored {
    fn kind(&self) -> &'static str {
        match self {
            Stored::Band(_) => "band",
            Stored::Mask(_) => "mask",
            Stored::Stack(_) => "stack",
        }
    }
}

/// In-memory raster store keyed by path, for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryRasterIo {
    files: Mutex<HashMap<PathBuf, Stored>>,
}

impl MemoryRasterIo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_band<P: AsRef<Path>>(&self, path: P, raster: Raster<f64>) {
        self.put(path.as_ref(), Stored::Band(raster));
    }

    pub fn insert_mask<P: AsRef<Path>>(&self, path: P, mask: ForestMask) {
        self.put(path.as_ref(), Stored::Mask(mask));
    }

    /// Sorted list of stored paths
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.lock().keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn read_stack(&self, path: &Path) -> ForestResult<BandStack> {
        match self.get(path)? {
            Stored::Stack(s) => Ok(s),
            other => Err(wrong_kind(path, "stack", &other)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Stored>> {
        // a poisoned map is still consistent: every operation is a single insert/remove
        self.files.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn put(&self, path: &Path, value: Stored) {
        log::debug!("memory store: write {} {}", value.kind(), path.display());
        self.lock().insert(path.to_path_buf(), value);
    }

    fn get(&self, path: &Path) -> ForestResult<Stored> {
        self.lock().get(path).cloned().ok_or_else(|| {
            ForestError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no raster stored at {}", path.display()),
            ))
        })
    }
}

fn wrong_kind(path: &Path, wanted: &str, found: &Stored) -> ForestError {
    ForestError::RasterIo(format!(
        "{} holds a {}, not a {}",
        path.display(),
        found.kind(),
        wanted
    ))
}

impl RasterIo for MemoryRasterIo {
    fn read_band(&self, path: &Path) -> ForestResult<Raster<f64>> {
        match self.get(path)? {
            Stored::Band(r) => Ok(r),
            other => Err(wrong_kind(path, "band", &other)),
        }
    }

    fn write_band(&self, path: &Path, raster: &Raster<f64>) -> ForestResult<()> {
        self.put(path, Stored::Band(raster.clone()));
        Ok(())
    }

    fn read_mask(&self, path: &Path) -> ForestResult<ForestMask> {
        match self.get(path)? {
            Stored::Mask(m) => Ok(m),
            other => Err(wrong_kind(path, "mask", &other)),
        }
    }

    fn write_mask(&self, path: &Path, mask: &ForestMask) -> ForestResult<()> {
        self.put(path, Stored::Mask(mask.clone()));
        Ok(())
    }

    fn write_stack(&self, path: &Path, stack: &BandStack) -> ForestResult<()> {
        self.put(path, Stored::Stack(stack.clone()));
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.lock().contains_key(path)
    }

    fn remove(&self, path: &Path) -> ForestResult<()> {
        match self.lock().remove(path) {
            Some(_) => Ok(()),
            None => Err(ForestError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no raster stored at {}", path.display()),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CoverClass, GeoTransform};

    #[test]
    fn test_store_and_kinds() {
        let io = MemoryRasterIo::new();
        let gt = GeoTransform::north_up(0.0, 0.0, 30.0, 30.0);
        let path = Path::new("/scene/B4.TIF");

        io.write_band(path, &Raster::filled(2, 2, 0.5, gt, 32618)).unwrap();
        assert!(io.exists(path));
        assert_eq!(io.read_band(path).unwrap().valid_count(), 4);
        assert!(matches!(io.read_mask(path), Err(ForestError::RasterIo(_))));

        io.write_mask(
            Path::new("/scene/mask.tif"),
            &Raster::filled(2, 2, CoverClass::Forest, gt, 32618),
        )
        .unwrap();
        assert_eq!(io.paths().len(), 2);

        io.remove(path).unwrap();
        assert!(!io.exists(path));
        assert!(io.remove(path).is_err());
    }
}
