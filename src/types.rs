use crate::core::footprint::Footprint;
use chrono::{DateTime, Utc};
use geo::{polygon, Polygon};
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// Pixel values are carried as `f32` for every band
pub type Pixel = f32;

/// Multi-band raster block (band x row x col)
pub type RasterBlock = Array3<Pixel>;

/// Axis-aligned geographic extent
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Extent {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self { min_x, min_y, max_x, max_y }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// Overlap of two extents, `None` unless it has positive width and height
    pub fn intersection(&self, other: &Extent) -> Option<Extent> {
        let overlap = Extent::new(
            self.min_x.max(other.min_x),
            self.min_y.max(other.min_y),
            self.max_x.min(other.max_x),
            self.max_y.min(other.max_y),
        );

        if overlap.width() > 0.0 && overlap.height() > 0.0 {
            Some(overlap)
        } else {
            None
        }
    }

    /// Smallest extent covering both
    pub fn union(&self, other: &Extent) -> Extent {
        Extent::new(
            self.min_x.min(other.min_x),
            self.min_y.min(other.min_y),
            self.max_x.max(other.max_x),
            self.max_y.max(other.max_y),
        )
    }

    /// Closed ring polygon: lower-left, lower-right, upper-right, upper-left
    pub fn to_polygon(&self) -> Polygon<f64> {
        polygon![
            (x: self.min_x, y: self.min_y),
            (x: self.max_x, y: self.min_y),
            (x: self.max_x, y: self.max_y),
            (x: self.min_x, y: self.max_y),
            (x: self.min_x, y: self.min_y),
        ]
    }

    pub fn to_wkt(&self) -> String {
        format!(
            "POLYGON (({} {}, {} {}, {} {}, {} {}, {} {}))",
            self.min_x, self.min_y,
            self.max_x, self.min_y,
            self.max_x, self.max_y,
            self.min_x, self.max_y,
            self.min_x, self.min_y,
        )
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}, {:.6}, {:.6}, {:.6}", self.min_x, self.min_y, self.max_x, self.max_y)
    }
}

/// Geospatial transformation parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform anchored at the extent's upper-left corner
    pub fn north_up(extent: &Extent, xres: f64, yres: f64) -> Self {
        Self {
            top_left_x: extent.min_x,
            pixel_width: xres,
            rotation_x: 0.0,
            top_left_y: extent.max_y,
            rotation_y: 0.0,
            pixel_height: -yres,
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    pub fn from_gdal(gt: &[f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }
}

/// Band description of a mosaic's range type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandInfo {
    pub name: String,
    /// First nil value of the band, if any
    pub nodata: Option<f64>,
}

impl BandInfo {
    pub fn new(name: impl Into<String>, nodata: Option<f64>) -> Self {
        Self { name: name.into(), nodata }
    }
}

/// Storage type of the mosaic's bands in the written tiles.
///
/// Pixels are processed as [`Pixel`] and converted when a tile is written;
/// integer types round and saturate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DataType {
    Byte,
    UInt16,
    Int16,
    UInt32,
    Int32,
    #[default]
    Float32,
    Float64,
}

impl DataType {
    /// GDAL's name for the type
    pub fn gdal_name(&self) -> &'static str {
        match self {
            DataType::Byte => "Byte",
            DataType::UInt16 => "UInt16",
            DataType::Int16 => "Int16",
            DataType::UInt32 => "UInt32",
            DataType::Int32 => "Int32",
            DataType::Float32 => "Float32",
            DataType::Float64 => "Float64",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.gdal_name())
    }
}

impl FromStr for DataType {
    type Err = MosaicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "byte" | "uint8" => Ok(DataType::Byte),
            "uint16" => Ok(DataType::UInt16),
            "int16" => Ok(DataType::Int16),
            "uint32" => Ok(DataType::UInt32),
            "int32" => Ok(DataType::Int32),
            "float32" => Ok(DataType::Float32),
            "float64" => Ok(DataType::Float64),
            _ => Err(MosaicError::InvalidConfig(format!("Unsupported data type: {}", s))),
        }
    }
}

/// Where a dataset's pixels come from
#[derive(Debug, Clone)]
pub enum RasterSource {
    /// Any raster GDAL can open
    Gdal(PathBuf),
    /// Pixels already held in memory, e.g. produced by an upstream processor
    InMemory {
        data: Arc<RasterBlock>,
        nodata: Option<f64>,
    },
}

impl RasterSource {
    pub fn gdal<P: AsRef<Path>>(path: P) -> Self {
        RasterSource::Gdal(path.as_ref().to_path_buf())
    }

    pub fn in_memory(data: RasterBlock, nodata: Option<f64>) -> Self {
        RasterSource::InMemory { data: Arc::new(data), nodata }
    }

    pub fn describe(&self) -> String {
        match self {
            RasterSource::Gdal(path) => path.display().to_string(),
            RasterSource::InMemory { data, .. } => {
                let (bands, rows, cols) = data.dim();
                format!("<memory {}x{}x{}>", bands, cols, rows)
            }
        }
    }
}

/// A georeferenced dataset linked to a mosaic. Owned by the metadata layer.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub id: String,
    pub footprint: Footprint,
    pub begin_time: DateTime<Utc>,
    pub source: RasterSource,
    pub extent: Extent,
    /// Raster size in pixels (width, height)
    pub size: (usize, usize),
    pub srid: u32,
}

impl Dataset {
    /// Pixel resolution (x, y) derived from extent and size
    pub fn resolution(&self) -> (f64, f64) {
        (
            (self.extent.width() / self.size.0 as f64).abs(),
            (self.extent.height() / self.size.1 as f64).abs(),
        )
    }
}

/// A rectified stitched mosaic as seen by the generator
#[derive(Debug, Clone)]
pub struct Mosaic {
    pub id: String,
    pub srid: u32,
    pub extent: Extent,
    /// Mosaic size in pixels (size_x, size_y)
    pub size: (usize, usize),
    pub bands: Vec<BandInfo>,
    /// Band type of the written tiles
    pub data_type: DataType,
    /// Directory holding the mosaic's tile trees and index stores
    pub storage_dir: PathBuf,
    pub datasets: Vec<Dataset>,
    tile_index_path: Option<PathBuf>,
}

impl Mosaic {
    pub fn new(
        id: impl Into<String>,
        srid: u32,
        extent: Extent,
        size: (usize, usize),
        bands: Vec<BandInfo>,
        storage_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            srid,
            extent,
            size,
            bands,
            data_type: DataType::default(),
            storage_dir: storage_dir.into(),
            datasets: Vec::new(),
            tile_index_path: None,
        }
    }

    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }

    pub fn with_tile_index_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.tile_index_path = Some(path.into());
        self
    }

    pub fn tile_index_path(&self) -> Option<&Path> {
        self.tile_index_path.as_deref()
    }

    pub fn set_tile_index_path(&mut self, path: PathBuf) {
        self.tile_index_path = Some(path);
    }

    /// Nodata value per band, falling back to `default` for bands without one
    pub fn nodata_values(&self, default: Pixel) -> Vec<Pixel> {
        self.bands
            .iter()
            .map(|band| band.nodata.map(|v| v as Pixel).unwrap_or(default))
            .collect()
    }
}

/// Origin of a tile file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TileSource {
    Dataset(String),
    Merged,
}

impl fmt::Display for TileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TileSource::Dataset(id) => write!(f, "{}", id),
            TileSource::Merged => write!(f, "merged"),
        }
    }
}

/// A rendered tile file in the mosaic grid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tile {
    pub path: PathBuf,
    pub x_index: usize,
    pub y_index: usize,
    /// Geographic extent actually covered by the file
    pub extent: Extent,
    pub x_size: usize,
    pub y_size: usize,
    pub source: TileSource,
}

impl Tile {
    pub fn key(&self) -> (usize, usize) {
        (self.x_index, self.y_index)
    }
}

/// Configuration passed explicitly into every mosaic run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MosaicConfig {
    /// Tile edge length in pixels
    pub tile_edge: usize,
    /// Nodata for bands that define none
    pub nodata_value: Pixel,
    /// Reference system all dataset footprints are compared in
    pub footprint_srid: u32,
    /// Root for the per-run tile tree and index; the mosaic storage dir if unset
    pub temp_root: Option<PathBuf>,
    /// Width of the tile index `location` field
    pub location_width: usize,
    /// Remove the new run's files when the run aborts
    pub cleanup_on_abort: bool,
    /// Remove the previous run's index and tiles after a successful save
    pub prune_superseded: bool,
    /// Hold an advisory lock file in the storage dir for the whole run
    pub use_lock_file: bool,
    /// Age in seconds after which a leftover lock file is broken; never if unset
    pub stale_lock_secs: Option<u64>,
}

impl Default for MosaicConfig {
    fn default() -> Self {
        Self {
            tile_edge: 256,
            nodata_value: 0.0,
            footprint_srid: 4326,
            temp_root: None,
            location_width: 254,
            cleanup_on_abort: true,
            prune_superseded: true,
            use_lock_file: true,
            stale_lock_secs: None,
        }
    }
}

/// Error types for mosaic generation
#[derive(Debug, thiserror::Error)]
pub enum MosaicError {
    #[error("Geometry error: {0}")]
    Geometry(String),

    #[error("Raster I/O error: {0}")]
    RasterIo(String),

    #[error("Tile index error: {0}")]
    Index(String),

    #[error("Invalid mosaic configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metadata store error: {0}")]
    Store(String),

    #[error("Mosaic is busy: {0}")]
    Busy(String),
}

/// Result type for mosaic operations
pub type MosaicResult<T> = Result<T, MosaicError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extent_intersection_requires_area() {
        let a = Extent::new(0.0, 0.0, 10.0, 10.0);
        let b = Extent::new(5.0, 5.0, 20.0, 20.0);
        assert_eq!(a.intersection(&b), Some(Extent::new(5.0, 5.0, 10.0, 10.0)));

        // Shared edge only
        let c = Extent::new(10.0, 0.0, 20.0, 10.0);
        assert_eq!(a.intersection(&c), None);
        assert_eq!(a.union(&c), Extent::new(0.0, 0.0, 20.0, 10.0));
    }

    #[test]
    fn test_extent_polygon_ring_is_closed() {
        let poly = Extent::new(1.0, 2.0, 3.0, 4.0).to_polygon();
        let ring = poly.exterior();
        assert_eq!(ring.0.len(), 5);
        assert_eq!(ring.0.first(), ring.0.last());
    }

    #[test]
    fn test_north_up_transform() {
        let gt = GeoTransform::north_up(&Extent::new(10.0, 20.0, 30.0, 40.0), 0.5, 0.25);
        assert_eq!(gt.to_gdal(), [10.0, 0.5, 0.0, 40.0, 0.0, -0.25]);
        assert_eq!(GeoTransform::from_gdal(&gt.to_gdal()), gt);
    }

    #[test]
    fn test_band_nodata_fallback() {
        let mosaic = Mosaic::new(
            "m",
            4326,
            Extent::new(0.0, 0.0, 1.0, 1.0),
            (1, 1),
            vec![BandInfo::new("red", Some(255.0)), BandInfo::new("green", None)],
            "/tmp",
        );
        assert_eq!(mosaic.nodata_values(0.0), vec![255.0, 0.0]);
        assert_eq!(mosaic.data_type, DataType::Float32);
    }

    #[test]
    fn test_data_type_names() {
        assert_eq!("Byte".parse::<DataType>().unwrap(), DataType::Byte);
        assert_eq!("uint16".parse::<DataType>().unwrap(), DataType::UInt16);
        assert_eq!(DataType::Int16.to_string(), "Int16");
        assert!(matches!("CFloat32".parse::<DataType>(), Err(MosaicError::InvalidConfig(_))));
    }
}
