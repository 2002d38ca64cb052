use crate::core::align::BandStack;
use crate::io::raster_io::RasterIo;
use crate::types::{CoverClass, ForestError, ForestMask, ForestResult, GeoTransform, Raster};
use gdal::raster::Buffer;
use gdal::spatial_ref::SpatialRef;
use gdal::{Dataset, DriverManager, Metadata};
use ndarray::Array2;
use std::path::Path;

impl From<gdal::errors::GdalError> for ForestError {
    fn from(e: gdal::errors::GdalError) -> Self {
        ForestError::RasterIo(e.to_string())
    }
}

/// GeoTIFF reader/writer backed by GDAL
#[derive(Debug, Clone, Copy, Default)]
pub struct GdalRasterIo;

impl GdalRasterIo {
    pub fn new() -> Self {
        Self
    }

    fn open(path: &Path) -> ForestResult<(Dataset, GeoTransform, u32)> {
        let dataset = Dataset::open(path)?;
        let transform = GeoTransform::from_gdal(dataset.geo_transform()?);
        let epsg = dataset
            .spatial_ref()
            .and_then(|srs| srs.auth_code())
            .map_err(|e| {
                ForestError::RasterIo(format!("{} has no EPSG code: {}", path.display(), e))
            })?;
        let epsg = u32::try_from(epsg)
            .map_err(|_| ForestError::RasterIo(format!("invalid EPSG code {} in {}", epsg, path.display())))?;
        Ok((dataset, transform, epsg))
    }

    fn read_first_band<T: gdal::raster::GdalType + Copy>(
        dataset: &Dataset,
    ) -> ForestResult<(Array2<T>, Option<f64>)> {
        let (width, height) = dataset.raster_size();
        let rasterband = dataset.rasterband(1)?;
        let nodata = rasterband.no_data_value();
        let buffer = rasterband.read_as::<T>((0, 0), (width, height), (width, height), None)?;
        let data = Array2::from_shape_vec((height, width), buffer.data)
            .map_err(|e| ForestError::Processing(format!("Failed to reshape raster data: {}", e)))?;
        Ok((data, nodata))
    }

    fn create<T: gdal::raster::GdalType>(
        path: &Path,
        width: usize,
        height: usize,
        bands: usize,
        transform: &GeoTransform,
        epsg: u32,
    ) -> ForestResult<Dataset> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let driver = DriverManager::get_driver_by_name("GTiff")?;
        let mut dataset = driver.create_with_band_type::<T, _>(
            path,
            width as isize,
            height as isize,
            bands as isize,
        )?;
        dataset.set_geo_transform(&transform.to_gdal())?;
        dataset.set_spatial_ref(&SpatialRef::from_epsg(epsg)?)?;
        Ok(dataset)
    }
}

impl RasterIo for GdalRasterIo {
    fn read_band(&self, path: &Path) -> ForestResult<Raster<f64>> {
        log::debug!("Reading band: {}", path.display());
        let (dataset, transform, epsg) = Self::open(path)?;
        let (mut data, nodata) = Self::read_first_band::<f64>(&dataset)?;
        if let Some(nodata) = nodata.filter(|v| !v.is_nan()) {
            data.mapv_inplace(|v| if v == nodata { f64::NAN } else { v });
        }
        Ok(Raster::new(data, transform, epsg))
    }

    fn write_band(&self, path: &Path, raster: &Raster<f64>) -> ForestResult<()> {
        log::info!("Writing band: {}", path.display());
        let (height, width) = raster.shape();
        let dataset = Self::create::<f32>(path, width, height, 1, raster.transform(), raster.epsg())?;

        let mut rasterband = dataset.rasterband(1)?;
        let flat: Vec<f32> = raster.data().iter().map(|&v| v as f32).collect();
        rasterband.write((0, 0), (width, height), &Buffer::new((width, height), flat))?;
        rasterband.set_no_data_value(Some(f64::NAN))?;
        Ok(())
    }

    fn read_mask(&self, path: &Path) -> ForestResult<ForestMask> {
        log::debug!("Reading mask: {}", path.display());
        let (dataset, transform, epsg) = Self::open(path)?;
        let (codes, _) = Self::read_first_band::<u8>(&dataset)?;
        Ok(Raster::new(codes.mapv(CoverClass::from_code), transform, epsg))
    }

    fn write_mask(&self, path: &Path, mask: &ForestMask) -> ForestResult<()> {
        log::info!("Writing mask: {}", path.display());
        let (height, width) = mask.shape();
        let dataset = Self::create::<u8>(path, width, height, 1, mask.transform(), mask.epsg())?;

        let mut rasterband = dataset.rasterband(1)?;
        let flat: Vec<u8> = mask.data().iter().map(|c| c.to_code()).collect();
        rasterband.write((0, 0), (width, height), &Buffer::new((width, height), flat))?;
        rasterband.set_no_data_value(Some(CoverClass::NODATA_CODE as f64))?;
        Ok(())
    }

    fn write_stack(&self, path: &Path, stack: &BandStack) -> ForestResult<()> {
        log::info!("Writing {}-band stack: {}", stack.bands().len(), path.display());
        let (count, height, width) = stack.data().dim();
        let dataset = Self::create::<f32>(path, width, height, count, stack.transform(), stack.epsg())?;

        for (idx, band) in stack.bands().iter().enumerate() {
            let view = stack
                .band(*band)
                .ok_or_else(|| ForestError::Processing(format!("stack is missing {}", band)))?;
            let mut rasterband = dataset.rasterband(idx as isize + 1)?;
            let flat: Vec<f32> = view.iter().map(|&v| v as f32).collect();
            rasterband.write((0, 0), (width, height), &Buffer::new((width, height), flat))?;
            rasterband.set_no_data_value(Some(f64::NAN))?;
            rasterband.set_description(&band.to_string())?;
        }
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn remove(&self, path: &Path) -> ForestResult<()> {
        log::debug!("Removing {}", path.display());
        std::fs::remove_file(path)?;
        Ok(())
    }
}
