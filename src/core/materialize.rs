use crate::core::layout::RunLayout;
use crate::core::merge::is_nodata;
use crate::core::tile_grid::{round_pixel, TileGrid};
use crate::io::raster::{write_geotiff, PixelWindow};
use crate::types::{
    DataType, Dataset, Extent, GeoTransform, MosaicError, MosaicResult, Pixel, RasterBlock, Tile, TileSource,
};
use ndarray::Axis;

/// Cuts per-dataset tiles out of source rasters
pub struct TileMaterializer<'a> {
    grid: &'a TileGrid,
    layout: &'a RunLayout,
    nodata: &'a [Pixel],
    data_type: DataType,
}

impl<'a> TileMaterializer<'a> {
    /// `nodata` holds one value per mosaic band
    pub fn new(grid: &'a TileGrid, layout: &'a RunLayout, nodata: &'a [Pixel]) -> Self {
        Self { grid, layout, nodata, data_type: DataType::default() }
    }

    /// Band type of the tiles written
    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }

    /// Extract the part of `dataset` falling into tile `(x_index, y_index)`.
    ///
    /// Returns `None` when the dataset and the tile cell share no pixel.
    pub fn materialize(&self, dataset: &Dataset, x_index: usize, y_index: usize) -> MosaicResult<Option<Tile>> {
        if dataset.srid != self.grid.srid {
            return Err(MosaicError::Geometry(format!(
                "Dataset '{}' is in EPSG:{}, mosaic grid in EPSG:{}",
                dataset.id, dataset.srid, self.grid.srid
            )));
        }

        let cell = self.grid.tile_extent(x_index, y_index);
        let (extent, out_size) = match cell
            .intersection(&dataset.extent)
            .and_then(|overlap| self.snap(&overlap))
        {
            Some(snapped) => snapped,
            None => return Ok(None),
        };

        let window = match source_window(dataset, &extent) {
            Some(window) => window,
            None => return Ok(None),
        };

        log::debug!("Tile ({}, {}) from '{}'", x_index, y_index, dataset.id);
        log::debug!("Tile Extent: {}", cell);
        log::debug!("Dataset Extent: {}", dataset.extent);
        log::debug!("Final Extent: {}", extent);
        log::debug!(
            "Offsets: {}, {}; Size: {}, {}",
            window.x_offset, window.y_offset, window.x_size, window.y_size
        );

        let (mut block, source_nodata) = dataset
            .source
            .read_window(&window, out_size, self.nodata.len())
            .map_err(|e| match e {
                MosaicError::RasterIo(msg) => {
                    MosaicError::RasterIo(format!("dataset '{}': {}", dataset.id, msg))
                }
                other => other,
            })?;
        remap_nodata(&mut block, &source_nodata, self.nodata);

        let source = TileSource::Dataset(dataset.id.clone());
        let path = self.layout.tile_path(&source, x_index, y_index)?;
        let transform = GeoTransform::north_up(&extent, self.grid.xres, self.grid.yres);
        write_geotiff(&path, &block, &transform, self.grid.srid, self.nodata, self.data_type)?;

        Ok(Some(Tile {
            path,
            x_index,
            y_index,
            extent,
            x_size: out_size.0,
            y_size: out_size.1,
            source,
        }))
    }

    /// Snap an extent onto the mosaic's pixel grid; `None` if no whole pixel remains
    fn snap(&self, extent: &Extent) -> Option<(Extent, (usize, usize))> {
        let grid = self.grid;
        let px0 = round_pixel((extent.min_x - grid.extent.min_x) / grid.xres);
        let px1 = round_pixel((extent.max_x - grid.extent.min_x) / grid.xres);
        let py0 = round_pixel((grid.extent.max_y - extent.max_y) / grid.yres);
        let py1 = round_pixel((grid.extent.max_y - extent.min_y) / grid.yres);

        if px1 <= px0 || py1 <= py0 {
            return None;
        }

        let snapped = Extent::new(
            grid.extent.min_x + px0 as f64 * grid.xres,
            grid.extent.max_y - py1 as f64 * grid.yres,
            grid.extent.min_x + px1 as f64 * grid.xres,
            grid.extent.max_y - py0 as f64 * grid.yres,
        );
        Some((snapped, (px1 - px0, py1 - py0)))
    }
}

/// Window of `extent` in the dataset's own pixel grid, clipped to the raster
fn source_window(dataset: &Dataset, extent: &Extent) -> Option<PixelWindow> {
    let (xres, yres) = dataset.resolution();
    let (width, height) = dataset.size;

    let x_offset = round_pixel((extent.min_x - dataset.extent.min_x) / xres).min(width);
    let y_offset = round_pixel((dataset.extent.max_y - extent.max_y) / yres).min(height);
    let x_size = round_pixel(extent.width() / xres).min(width - x_offset);
    let y_size = round_pixel(extent.height() / yres).min(height - y_offset);

    let window = PixelWindow::new(x_offset, y_offset, x_size, y_size);
    if window.is_empty() {
        None
    } else {
        Some(window)
    }
}

/// Rewrite pixels carrying the source band's nodata to the mosaic band's nodata
fn remap_nodata(block: &mut RasterBlock, source: &[Option<f64>], target: &[Pixel]) {
    for (band_no, mut plane) in block.axis_iter_mut(Axis(0)).enumerate() {
        let (Some(Some(src)), Some(&dst)) = (source.get(band_no), target.get(band_no)) else {
            continue;
        };
        let src = *src as Pixel;
        if is_nodata(src, dst) {
            continue;
        }
        plane.mapv_inplace(|v| if is_nodata(v, src) { dst } else { v });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::footprint::Footprint;
    use crate::io::raster::read_raster;
    use crate::types::RasterSource;
    use chrono::{NaiveDate, Utc};
    use ndarray::Array3;
    use tempfile::TempDir;

    fn grid_512() -> TileGrid {
        TileGrid::new(4326, Extent::new(0.0, 0.0, 512.0, 512.0), (512, 512), 256).unwrap()
    }

    fn layout(dir: &TempDir) -> RunLayout {
        let time = NaiveDate::from_ymd_opt(2012, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        RunLayout::allocate(dir.path(), time).unwrap()
    }

    fn filled(id: &str, extent: Extent, value: Pixel) -> Dataset {
        let size = (extent.width() as usize, extent.height() as usize);
        Dataset {
            id: id.to_string(),
            footprint: Footprint::from_extent(&extent, 4326),
            begin_time: Utc::now(),
            source: RasterSource::in_memory(Array3::from_elem((1, size.1, size.0), value), None),
            extent,
            size,
            srid: 4326,
        }
    }

    #[test]
    fn test_tile_cut_from_dataset_corner() {
        let dir = TempDir::new().unwrap();
        let grid = grid_512();
        let layout = layout(&dir);
        let nodata = [0.0];
        let materializer = TileMaterializer::new(&grid, &layout, &nodata);

        let dataset = filled("D1", Extent::new(0.0, 0.0, 300.0, 300.0), 7.0);

        // Upper-left cell: y 256..512 overlaps the dataset in 0..256 x 256..300
        let tile = materializer.materialize(&dataset, 0, 0).unwrap().unwrap();
        assert_eq!(tile.extent, Extent::new(0.0, 256.0, 256.0, 300.0));
        assert_eq!((tile.x_size, tile.y_size), (256, 44));
        assert_eq!(tile.source, TileSource::Dataset("D1".into()));
        assert!(tile.path.ends_with("000/000/tile_ds-D1_000000_000000.tiff"));

        let pixels = read_raster(&tile.path, 1).unwrap();
        assert_eq!(pixels.dim(), (1, 44, 256));
        assert!(pixels.iter().all(|&v| v == 7.0));

        let lower_right = materializer.materialize(&dataset, 1, 1).unwrap().unwrap();
        assert_eq!(lower_right.extent, Extent::new(256.0, 0.0, 300.0, 256.0));
    }

    #[test]
    fn test_no_overlap_yields_none() {
        let dir = TempDir::new().unwrap();
        let grid = grid_512();
        let layout = layout(&dir);
        let nodata = [0.0];
        let materializer = TileMaterializer::new(&grid, &layout, &nodata);

        let dataset = filled("D1", Extent::new(0.0, 0.0, 100.0, 100.0), 1.0);
        assert!(materializer.materialize(&dataset, 1, 0).unwrap().is_none());

        // Sub-pixel sliver along the cell edge rounds away
        let sliver = filled("S", Extent::new(255.8, 0.0, 300.0, 10.0), 1.0);
        assert!(materializer.materialize(&sliver, 0, 1).unwrap().is_none());
    }

    #[test]
    fn test_source_window_uses_dataset_resolution() {
        // Dataset at half the mosaic resolution: 2 mosaic units per pixel
        let mut dataset = filled("coarse", Extent::new(0.0, 0.0, 512.0, 512.0), 1.0);
        dataset.size = (256, 256);

        let window = source_window(&dataset, &Extent::new(256.0, 0.0, 512.0, 256.0)).unwrap();
        assert_eq!(window, PixelWindow::new(128, 128, 128, 128));
    }

    #[test]
    fn test_missing_source_is_fatal() {
        let dir = TempDir::new().unwrap();
        let grid = grid_512();
        let layout = layout(&dir);
        let nodata = [0.0];
        let materializer = TileMaterializer::new(&grid, &layout, &nodata);

        let mut dataset = filled("gone", Extent::new(0.0, 0.0, 512.0, 512.0), 1.0);
        dataset.source = RasterSource::gdal(dir.path().join("missing.tiff"));

        let result = materializer.materialize(&dataset, 0, 0);
        assert!(matches!(result, Err(MosaicError::RasterIo(msg)) if msg.contains("gone")));
    }

    #[test]
    fn test_foreign_srid_rejected() {
        let dir = TempDir::new().unwrap();
        let grid = grid_512();
        let layout = layout(&dir);
        let nodata = [0.0];
        let materializer = TileMaterializer::new(&grid, &layout, &nodata);

        let mut dataset = filled("utm", Extent::new(0.0, 0.0, 512.0, 512.0), 1.0);
        dataset.srid = 32633;
        assert!(matches!(materializer.materialize(&dataset, 0, 0), Err(MosaicError::Geometry(_))));
    }

    #[test]
    fn test_source_nodata_remapped() {
        let mut block = Array3::from_shape_vec((1, 1, 3), vec![-9999.0, 5.0, -9999.0]).unwrap();
        remap_nodata(&mut block, &[Some(-9999.0)], &[0.0]);
        assert_eq!(block.into_raw_vec(), vec![0.0, 5.0, 0.0]);

        let mut nan_block = Array3::from_shape_vec((1, 1, 2), vec![f32::NAN, 2.0]).unwrap();
        remap_nodata(&mut nan_block, &[Some(f64::NAN)], &[0.0]);
        assert_eq!(nan_block.into_raw_vec(), vec![0.0, 2.0]);
    }
}
