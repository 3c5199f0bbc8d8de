//! Core mosaic processing modules

pub mod footprint;
pub mod contribution;
pub mod tile_grid;
pub mod layout;
pub mod materialize;
pub mod merge;
pub mod generator;

// Re-export main types
pub use footprint::Footprint;
pub use contribution::{resolve_contributions, Contribution};
pub use tile_grid::{round_pixel, TileGrid, TileIter};
pub use layout::RunLayout;
pub use materialize::TileMaterializer;
pub use merge::{composite, composite_blocks, is_nodata, TileMerger};
pub use generator::{make_mosaic, GenerationReport, GenerationState, MosaicGenerator, MosaicStore};
