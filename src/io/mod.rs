//! File formats, discovery and acquisition

pub mod acquisition;
pub mod catalog;
#[cfg(feature = "gdal")]
pub mod geotiff;
pub mod memory;
pub mod mtl;
pub mod raster_io;
pub mod region;

pub use acquisition::{DownloadMonitor, DownloadParams};
pub use catalog::{parse_product_date, scene_folder_name, CatalogScan, SceneCatalog};
#[cfg(feature = "gdal")]
pub use geotiff::GdalRasterIo;
pub use memory::MemoryRasterIo;
pub use mtl::MtlDocument;
pub use raster_io::RasterIo;
pub use region::RegionGeometry;
