//! GDAL-backed I/O: raster blocks and the shapefile tile index

pub mod raster;
pub mod tile_index;

pub use raster::{read_raster, write_geotiff, PixelWindow};
pub use tile_index::{TileIndex, TileIndexEntry};
