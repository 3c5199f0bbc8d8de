use crate::core::layout::RunLayout;
use crate::core::tile_grid::{round_pixel, TileGrid};
use crate::io::raster::{read_raster, write_geotiff};
use crate::types::{DataType, GeoTransform, MosaicError, MosaicResult, Pixel, RasterBlock, Tile, TileSource};
use ndarray::{s, Array3, ArrayView2, ArrayViewMut2, Axis, Zip};

/// Nodata test that also works for NaN markers
pub fn is_nodata(value: Pixel, nodata: Pixel) -> bool {
    if nodata.is_nan() {
        value.is_nan()
    } else {
        value == nodata
    }
}

/// Write `src` over `dest` except where `src` is nodata
pub fn composite(mut dest: ArrayViewMut2<'_, Pixel>, src: ArrayView2<'_, Pixel>, nodata: Pixel) {
    Zip::from(&mut dest).and(&src).for_each(|d, &s| {
        if !is_nodata(s, nodata) {
            *d = s;
        }
    });
}

/// Composite blocks into a fresh `(width, height)` buffer initialised with nodata.
///
/// Parts are applied in order, each at its `(x, y)` pixel offset; anything
/// reaching past the buffer is cut off.
pub fn composite_blocks(
    parts: &[(RasterBlock, (usize, usize))],
    size: (usize, usize),
    nodata: &[Pixel],
) -> RasterBlock {
    let (width, height) = size;
    let mut merged = Array3::<Pixel>::zeros((nodata.len(), height, width));
    for (band_no, mut plane) in merged.axis_iter_mut(Axis(0)).enumerate() {
        plane.fill(nodata[band_no]);
    }

    for (block, (x_offset, y_offset)) in parts {
        let (_, rows, cols) = block.dim();
        if *x_offset >= width || *y_offset >= height {
            continue;
        }
        let cols = cols.min(width - x_offset);
        let rows = rows.min(height - y_offset);

        for (band_no, &band_nodata) in nodata.iter().enumerate() {
            let dest = merged.slice_mut(s![band_no, *y_offset..y_offset + rows, *x_offset..x_offset + cols]);
            let src = block.slice(s![band_no, ..rows, ..cols]);
            composite(dest, src, band_nodata);
        }
    }

    merged
}

/// Merges the per-dataset tiles of one grid cell
pub struct TileMerger<'a> {
    grid: &'a TileGrid,
    layout: &'a RunLayout,
    nodata: &'a [Pixel],
    data_type: DataType,
}

impl<'a> TileMerger<'a> {
    pub fn new(grid: &'a TileGrid, layout: &'a RunLayout, nodata: &'a [Pixel]) -> Self {
        Self { grid, layout, nodata, data_type: DataType::default() }
    }

    /// Band type of the tiles written
    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }

    /// Merge tiles of a single cell in the given order: later tiles overwrite
    /// earlier ones unless their pixel is nodata. A single tile is returned as is.
    pub fn merge(&self, mut tiles: Vec<Tile>) -> MosaicResult<Tile> {
        if tiles.len() == 1 {
            return Ok(tiles.remove(0));
        }

        let (x_index, y_index) = match tiles.first() {
            Some(tile) => tile.key(),
            None => return Err(MosaicError::RasterIo("nothing to merge".to_string())),
        };
        if let Some(stray) = tiles.iter().find(|t| t.key() != (x_index, y_index)) {
            return Err(MosaicError::RasterIo(format!(
                "tile ({}, {}) cannot merge into cell ({}, {})",
                stray.x_index, stray.y_index, x_index, y_index
            )));
        }

        log::debug!("Merging {} tiles at index ({}, {})", tiles.len(), x_index, y_index);

        let extent = tiles
            .iter()
            .skip(1)
            .fold(tiles[0].extent, |acc, tile| acc.union(&tile.extent));
        let size = (
            round_pixel(extent.width() / self.grid.xres),
            round_pixel(extent.height() / self.grid.yres),
        );

        let mut parts = Vec::with_capacity(tiles.len());
        for tile in &tiles {
            let offset = (
                round_pixel((tile.extent.min_x - extent.min_x) / self.grid.xres),
                round_pixel((extent.max_y - tile.extent.max_y) / self.grid.yres),
            );
            log::debug!("Offsets: {}, {}", offset.0, offset.1);
            parts.push((read_raster(&tile.path, self.nodata.len())?, offset));
        }

        let merged = composite_blocks(&parts, size, self.nodata);

        let path = self.layout.tile_path(&TileSource::Merged, x_index, y_index)?;
        let transform = GeoTransform::north_up(&extent, self.grid.xres, self.grid.yres);
        write_geotiff(&path, &merged, &transform, self.grid.srid, self.nodata, self.data_type)?;

        Ok(Tile {
            path,
            x_index,
            y_index,
            extent,
            x_size: size.0,
            y_size: size.1,
            source: TileSource::Merged,
        })
    }
}
