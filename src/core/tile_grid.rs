use crate::core::footprint::Footprint;
use crate::types::{Extent, Mosaic, MosaicError, MosaicResult};
use geo::Polygon;

/// Round a pixel coordinate, half away from zero. Negative values clamp to 0.
///
/// Every geographic-to-pixel conversion goes through here so adjacent tiles
/// agree on their shared edge.
pub fn round_pixel(value: f64) -> usize {
    let rounded = value.round();
    if rounded <= 0.0 {
        0
    } else {
        rounded as usize
    }
}

/// Regular tile grid of a mosaic, origin at the upper-left corner
#[derive(Debug, Clone)]
pub struct TileGrid {
    pub srid: u32,
    pub extent: Extent,
    pub size_x: usize,
    pub size_y: usize,
    pub xres: f64,
    pub yres: f64,
    pub tile_edge: usize,
}

impl TileGrid {
    /// Validate the mosaic geometry and derive resolutions
    pub fn new(srid: u32, extent: Extent, size: (usize, usize), tile_edge: usize) -> MosaicResult<Self> {
        let (size_x, size_y) = size;

        if tile_edge == 0 {
            return Err(MosaicError::InvalidConfig("tile edge must be at least 1 pixel".to_string()));
        }
        if size_x == 0 || size_y == 0 {
            return Err(MosaicError::InvalidConfig(format!(
                "mosaic size {}x{} has no pixels",
                size_x, size_y
            )));
        }

        let xres = ((extent.max_x - extent.min_x) / size_x as f64).abs();
        let yres = ((extent.max_y - extent.min_y) / size_y as f64).abs();

        if !(xres.is_finite() && yres.is_finite()) || xres == 0.0 || yres == 0.0 {
            return Err(MosaicError::InvalidConfig(format!(
                "degenerate resolution {} x {} for extent ({})",
                xres, yres, extent
            )));
        }
        if extent.max_x <= extent.min_x || extent.max_y <= extent.min_y {
            return Err(MosaicError::InvalidConfig(format!("inverted mosaic extent ({})", extent)));
        }

        Ok(Self { srid, extent, size_x, size_y, xres, yres, tile_edge })
    }

    pub fn for_mosaic(mosaic: &Mosaic, tile_edge: usize) -> MosaicResult<Self> {
        Self::new(mosaic.srid, mosaic.extent, mosaic.size, tile_edge)
    }

    /// Number of tiles along x and y
    pub fn tile_count(&self) -> (usize, usize) {
        (
            (self.size_x + self.tile_edge - 1) / self.tile_edge,
            (self.size_y + self.tile_edge - 1) / self.tile_edge,
        )
    }

    fn tile_span_x(&self) -> f64 {
        self.xres * self.tile_edge as f64
    }

    fn tile_span_y(&self) -> f64 {
        self.yres * self.tile_edge as f64
    }

    /// Geographic extent of a tile cell, clipped at the mosaic boundary
    pub fn tile_extent(&self, x_index: usize, y_index: usize) -> Extent {
        let min_x = self.extent.min_x + x_index as f64 * self.tile_span_x();
        let max_x = (min_x + self.tile_span_x()).min(self.extent.max_x);
        let max_y = self.extent.max_y - y_index as f64 * self.tile_span_y();
        let min_y = (max_y - self.tile_span_y()).max(self.extent.min_y);

        Extent::new(min_x, min_y, max_x, max_y)
    }

    pub fn tile_polygon(&self, x_index: usize, y_index: usize) -> Polygon<f64> {
        self.tile_extent(x_index, y_index).to_polygon()
    }

    /// Pixel size of a tile cell, smaller than the tile edge at the mosaic's right and bottom
    pub fn tile_pixel_size(&self, x_index: usize, y_index: usize) -> (usize, usize) {
        let extent = self.tile_extent(x_index, y_index);
        (
            round_pixel(extent.width() / self.xres),
            round_pixel(extent.height() / self.yres),
        )
    }

    /// Lazily enumerate the tiles whose cell overlaps `region`.
    ///
    /// The region is reprojected into the grid's reference system up front, so
    /// failures surface here rather than during iteration.
    pub fn tiles_for_region(&self, region: &Footprint) -> MosaicResult<TileIter<'_>> {
        let region = region.reproject(self.srid)?;

        let bounds = match region.extent() {
            Some(extent) if !region.is_empty() => extent,
            _ => return Ok(TileIter::exhausted(self, region)),
        };

        let span_x = self.tile_span_x();
        let span_y = self.tile_span_y();
        let x_min = ((bounds.min_x - self.extent.min_x) / span_x).floor() as i64;
        let x_max = ((bounds.max_x - self.extent.min_x) / span_x).ceil() as i64;
        let y_min = ((self.extent.max_y - bounds.max_y) / span_y).floor() as i64;
        let y_max = ((self.extent.max_y - bounds.min_y) / span_y).ceil() as i64;

        log::debug!("Mosaic Extent: {}", self.extent);
        log::debug!("Ref. Area Extent: {}", bounds);
        log::debug!("Tile Index Extent: {}, {}, {}, {}", x_min, y_min, x_max, y_max);

        let (tiles_x, tiles_y) = self.tile_count();
        let clamp = |v: i64, count: usize| v.clamp(0, count as i64 - 1) as usize;

        if x_max < 0 || y_max < 0 || x_min >= tiles_x as i64 || y_min >= tiles_y as i64 {
            return Ok(TileIter::exhausted(self, region));
        }

        Ok(TileIter {
            grid: self,
            region,
            x_range: (clamp(x_min, tiles_x), clamp(x_max, tiles_x)),
            y_range: (clamp(y_min, tiles_y), clamp(y_max, tiles_y)),
            next: Some((clamp(x_min, tiles_x), clamp(y_min, tiles_y))),
        })
    }
}

/// Single-pass enumeration of `(x_index, y_index)` pairs, x-major
pub struct TileIter<'a> {
    grid: &'a TileGrid,
    region: Footprint,
    x_range: (usize, usize),
    y_range: (usize, usize),
    next: Option<(usize, usize)>,
}

impl<'a> TileIter<'a> {
    fn exhausted(grid: &'a TileGrid, region: Footprint) -> Self {
        Self { grid, region, x_range: (0, 0), y_range: (0, 0), next: None }
    }

    fn advance(&mut self, (x, y): (usize, usize)) -> Option<(usize, usize)> {
        if y < self.y_range.1 {
            Some((x, y + 1))
        } else if x < self.x_range.1 {
            Some((x + 1, self.y_range.0))
        } else {
            None
        }
    }
}

impl Iterator for TileIter<'_> {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(candidate) = self.next {
            self.next = self.advance(candidate);
            let cell = self.grid.tile_polygon(candidate.0, candidate.1);
            if self.region.overlaps_interior(&cell) {
                return Some(candidate);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;
    use std::collections::BTreeSet;

    fn grid_512() -> TileGrid {
        TileGrid::new(4326, Extent::new(0.0, 0.0, 512.0, 512.0), (512, 512), 256).unwrap()
    }

    fn region(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Footprint {
        Footprint::from_extent(&Extent::new(min_x, min_y, max_x, max_y), 4326)
    }

    fn tiles(grid: &TileGrid, fp: &Footprint) -> BTreeSet<(usize, usize)> {
        grid.tiles_for_region(fp).unwrap().collect()
    }

    #[test]
    fn test_round_pixel() {
        assert_eq!(round_pixel(2.5), 3);
        assert_eq!(round_pixel(2.4999), 2);
        assert_eq!(round_pixel(-0.4), 0);
        assert_eq!(round_pixel(-3.0), 0);
        assert_eq!(round_pixel(255.9999999), 256);
    }

    #[test]
    fn test_degenerate_configs_rejected() {
        let extent = Extent::new(0.0, 0.0, 512.0, 512.0);
        assert!(matches!(TileGrid::new(4326, extent, (0, 512), 256), Err(MosaicError::InvalidConfig(_))));
        assert!(matches!(TileGrid::new(4326, extent, (512, 512), 0), Err(MosaicError::InvalidConfig(_))));
        let flat = Extent::new(0.0, 0.0, 512.0, 0.0);
        assert!(matches!(TileGrid::new(4326, flat, (512, 512), 256), Err(MosaicError::InvalidConfig(_))));
        let inverted = Extent::new(512.0, 0.0, 0.0, 512.0);
        assert!(matches!(TileGrid::new(4326, inverted, (512, 512), 256), Err(MosaicError::InvalidConfig(_))));
    }

    #[test]
    fn test_tile_extents_top_left_origin() {
        let grid = grid_512();
        assert_eq!(grid.tile_count(), (2, 2));
        assert_eq!(grid.tile_extent(0, 0), Extent::new(0.0, 256.0, 256.0, 512.0));
        assert_eq!(grid.tile_extent(1, 0), Extent::new(256.0, 256.0, 512.0, 512.0));
        assert_eq!(grid.tile_extent(0, 1), Extent::new(0.0, 0.0, 256.0, 256.0));
        assert_eq!(grid.tile_pixel_size(1, 1), (256, 256));
    }

    #[test]
    fn test_edge_tiles_are_clipped() {
        let grid = TileGrid::new(4326, Extent::new(0.0, 0.0, 600.0, 300.0), (600, 300), 256).unwrap();
        assert_eq!(grid.tile_count(), (3, 2));
        assert_eq!(grid.tile_extent(2, 1), Extent::new(512.0, 0.0, 600.0, 44.0));
        assert_eq!(grid.tile_pixel_size(2, 1), (88, 44));
        assert_eq!(grid.tile_pixel_size(0, 0), (256, 256));
    }

    #[test]
    fn test_full_region_covers_grid() {
        let grid = grid_512();
        let all = tiles(&grid, &region(0.0, 0.0, 512.0, 512.0));
        assert_eq!(all, [(0, 0), (0, 1), (1, 0), (1, 1)].into_iter().collect());
    }

    #[test]
    fn test_single_pixel_roundtrip_at_corners() {
        let grid = grid_512();

        // Pixel (0, 0) is the upper-left pixel of the mosaic
        let first = tiles(&grid, &region(0.0, 511.0, 1.0, 512.0));
        assert_eq!(first, [(0, 0)].into_iter().collect());

        // Last pixel of the grid, lower-right
        let last = tiles(&grid, &region(511.0, 0.0, 512.0, 1.0));
        assert_eq!(last, [(1, 1)].into_iter().collect());

        // Strictly inside tile (1, 0)
        let inner = tiles(&grid, &region(300.0, 400.0, 301.0, 401.0));
        assert_eq!(inner, [(1, 0)].into_iter().collect());
    }

    #[test]
    fn test_pixel_on_tile_boundary_stays_in_one_tile() {
        let grid = grid_512();
        // Right edge of the pixel lies on the x = 256 tile boundary
        let edge = tiles(&grid, &region(255.0, 300.0, 256.0, 301.0));
        assert_eq!(edge, [(0, 0)].into_iter().collect());
    }

    #[test]
    fn test_diagonal_footprint_skips_untouched_tiles() {
        let grid = grid_512();
        // Triangle hugging the lower-left corner: its bounding box spans all
        // four tiles but it never reaches the upper-right one
        let triangle = Footprint::from_polygon(
            geo::polygon![(x: 0.0, y: 0.0), (x: 500.0, y: 0.0), (x: 0.0, y: 500.0), (x: 0.0, y: 0.0)],
            4326,
        );
        let hit = tiles(&grid, &triangle);
        assert_eq!(hit, [(0, 0), (0, 1), (1, 1)].into_iter().collect());
    }

    #[test]
    fn test_empty_and_outside_regions() {
        let grid = grid_512();
        assert_eq!(grid.tiles_for_region(&Footprint::empty(4326)).unwrap().count(), 0);
        assert_eq!(tiles(&grid, &region(600.0, 600.0, 700.0, 700.0)).len(), 0);
        assert_eq!(tiles(&grid, &region(-100.0, 0.0, 0.0, 512.0)).len(), 0);
    }

    #[test]
    fn test_iteration_is_single_pass() {
        let grid = grid_512();
        let mut iter = grid.tiles_for_region(&region(0.0, 0.0, 512.0, 512.0)).unwrap();
        assert_eq!(iter.by_ref().count(), 4);
        assert_eq!(iter.next(), None);
    }
}
