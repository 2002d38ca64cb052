use crate::types::{ForestError, ForestResult, Pixel, Raster, SQUARE_METRES_PER_HECTARE};
use geo::{Area, BoundingRect, Intersects, MultiPolygon, Point, Polygon, Rect};
use geojson::GeoJson;
use ndarray::Array2;
use std::path::Path;

/// Area of interest used to clip every derived raster
///
/// Coordinates are expected in the projected CRS given by `epsg`
/// (metres); re-projection from geographic coordinates happens upstream.
#[derive(Debug, Clone)]
pub struct RegionGeometry {
    name: String,
    geometry: MultiPolygon<f64>,
    epsg: u32,
    bounds: Rect<f64>,
}

impl RegionGeometry {
    pub fn new(name: impl Into<String>, geometry: MultiPolygon<f64>, epsg: u32) -> ForestResult<Self> {
        let name = name.into();
        let bounds = geometry
            .bounding_rect()
            .ok_or_else(|| ForestError::Region(format!("region '{}' has no polygons", name)))?;
        if epsg == 0 {
            return Err(ForestError::Region("EPSG code must be non-zero".to_string()));
        }

        log::debug!(
            "Region '{}' (EPSG:{}): {} polygon(s), bounds {:?}",
            name,
            epsg,
            geometry.0.len(),
            bounds
        );
        Ok(Self {
            name,
            geometry,
            epsg,
            bounds,
        })
    }

    pub fn from_polygon(name: impl Into<String>, polygon: Polygon<f64>, epsg: u32) -> ForestResult<Self> {
        Self::new(name, MultiPolygon::new(vec![polygon]), epsg)
    }

    /// Collect every Polygon / MultiPolygon of a GeoJSON document
    pub fn from_geojson_str(name: impl Into<String>, text: &str, epsg: u32) -> ForestResult<Self> {
        let geojson: GeoJson = text
            .parse()
            .map_err(|e| ForestError::Region(format!("invalid GeoJSON: {}", e)))?;
        let collection = geo::GeometryCollection::<f64>::try_from(&geojson)
            .map_err(|e| ForestError::Region(format!("unsupported GeoJSON geometry: {}", e)))?;

        let mut polygons = Vec::new();
        for geometry in collection {
            match geometry {
                geo::Geometry::Polygon(p) => polygons.push(p),
                geo::Geometry::MultiPolygon(mp) => polygons.extend(mp.0),
                other => log::warn!("Ignoring non-polygon region geometry: {:?}", other),
            }
        }
        Self::new(name, MultiPolygon::new(polygons), epsg)
    }

    pub fn from_geojson_file<P: AsRef<Path>>(
        name: impl Into<String>,
        path: P,
        epsg: u32,
    ) -> ForestResult<Self> {
        log::info!("Loading region geometry: {}", path.as_ref().display());
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_geojson_str(name, &text, epsg)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn epsg(&self) -> u32 {
        self.epsg
    }

    pub fn geometry(&self) -> &MultiPolygon<f64> {
        &self.geometry
    }

    pub fn bounds(&self) -> Rect<f64> {
        self.bounds
    }

    /// Planar area of the region in hectares
    pub fn area_hectares(&self) -> f64 {
        self.geometry.unsigned_area() / SQUARE_METRES_PER_HECTARE
    }

    /// True if the point lies inside or on the boundary
    pub fn covers(&self, x: f64, y: f64) -> bool {
        self.geometry.intersects(&Point::new(x, y))
    }

    /// Pixel window `(row_start, row_end, col_start, col_end)` of the region bounds
    pub fn pixel_window<T: Pixel>(&self, raster: &Raster<T>) -> ForestResult<(usize, usize, usize, usize)> {
        let gt = raster.transform();
        if gt.is_rotated() {
            return Err(ForestError::InvalidFormat(
                "cannot clip a rotated raster".to_string(),
            ));
        }
        let (rows, cols) = raster.shape();

        let (min, max) = (self.bounds.min(), self.bounds.max());
        let (r_a, c_a) = gt.map_to_pixel(min.x, max.y);
        let (r_b, c_b) = gt.map_to_pixel(max.x, min.y);

        let clamp = |v: f64, hi: usize| v.max(0.0).min(hi as f64) as usize;
        let row_start = clamp(r_a.min(r_b).floor(), rows);
        let row_end = clamp(r_a.max(r_b).ceil(), rows);
        let col_start = clamp(c_a.min(c_b).floor(), cols);
        let col_end = clamp(c_a.max(c_b).ceil(), cols);

        if row_start >= row_end || col_start >= col_end {
            return Err(ForestError::Region(format!(
                "region '{}' does not overlap raster {}",
                self.name,
                raster.grid_description()
            )));
        }
        Ok((row_start, row_end, col_start, col_end))
    }

    /// Crop to the region bounds and set pixels whose centre lies outside
    /// the polygon to nodata. Clipping an already clipped raster is a no-op.
    pub fn clip<T: Pixel>(&self, raster: &Raster<T>) -> ForestResult<Raster<T>> {
        if raster.epsg() != self.epsg {
            return Err(ForestError::CrsMismatch {
                expected: self.epsg,
                found: raster.epsg(),
            });
        }

        let (row_start, row_end, col_start, col_end) = self.pixel_window(raster)?;
        let gt = raster.transform();
        let source = raster.data();

        let clipped = Array2::from_shape_fn((row_end - row_start, col_end - col_start), |(i, j)| {
            let (row, col) = (row_start + i, col_start + j);
            let (x, y) = gt.pixel_center(row, col);
            if self.covers(x, y) {
                source[[row, col]]
            } else {
                T::nodata()
            }
        });

        log::debug!(
            "Clipped {}x{} raster to window rows {}..{} cols {}..{}",
            raster.rows(),
            raster.cols(),
            row_start,
            row_end,
            col_start,
            col_end
        );
        Ok(Raster::new(clipped, gt.offset(row_start, col_start), raster.epsg()))
    }
}
