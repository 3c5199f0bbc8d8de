//! eomosaic: Rectified Stitched Mosaic engine
//!
//! Rebuilds a single seamless raster coverage from many georeferenced,
//! time-stamped datasets sharing one reference grid. Newer datasets win where
//! footprints overlap; the result is a directory of GeoTIFF tiles plus a
//! shapefile tile index that a raster server can read as one virtual mosaic.

pub mod types;
pub mod io;
pub mod core;

#[cfg(feature = "python")]
mod python;

// Re-export main types and functions for easier access
pub use types::{
    BandInfo, DataType, Dataset, Extent, GeoTransform, Mosaic, MosaicConfig, MosaicError, MosaicResult,
    Pixel, RasterBlock, RasterSource, Tile, TileSource,
};

pub use crate::core::{
    make_mosaic, resolve_contributions, Contribution, Footprint, GenerationReport,
    GenerationState, MosaicGenerator, MosaicStore, TileGrid,
};

pub use io::{TileIndex, TileIndexEntry};
