use crate::types::{Extent, MosaicError, MosaicResult, Tile};
use gdal::spatial_ref::SpatialRef;
use gdal::vector::{FieldDefn, FieldValue, Geometry, LayerAccess, OGRFieldType, OGRwkbGeometryType};
use gdal::{Dataset, DatasetOptions, DriverManager, GdalOpenFlags, LayerOptions};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

const LAYER_NAME: &str = "file_locations";
const SIDECARS: [&str; 6] = ["shp", "shx", "dbf", "prj", "cpg", "qix"];

/// One feature of a tile index
#[derive(Debug, Clone, PartialEq)]
pub struct TileIndexEntry {
    /// Tile file, relative to the index's directory when it lives below it
    pub location: String,
    pub x_index: usize,
    pub y_index: usize,
    pub extent: Extent,
}

/// Shapefile tile index: one polygon per tile with its file location.
///
/// Single writer. Features are only guaranteed on disk after [`TileIndex::close`].
pub struct TileIndex {
    path: PathBuf,
    dataset: Dataset,
    keys: HashSet<(usize, usize)>,
    location_width: usize,
}

impl TileIndex {
    /// Open the store at `path` for appending, or create it with the
    /// `location`/`x_index`/`y_index` schema in `srid`.
    pub fn open_or_create<P: AsRef<Path>>(path: P, srid: u32, location_width: usize) -> MosaicResult<Self> {
        let path = path.as_ref().to_path_buf();

        let (dataset, keys) = if path.exists() {
            log::info!("Opening tile index '{}'", path.display());
            Self::open_existing(&path)?
        } else {
            log::info!("Creating tile index '{}'", path.display());
            (Self::create(&path, srid, location_width)?, HashSet::new())
        };

        Ok(Self { path, dataset, keys, location_width })
    }

    fn create(path: &Path, srid: u32, location_width: usize) -> MosaicResult<Dataset> {
        let fail = |what: &str, e: gdal::errors::GdalError| {
            MosaicError::Index(format!("{} for '{}': {}", what, path.display(), e))
        };

        let driver = DriverManager::get_driver_by_name("ESRI Shapefile")
            .map_err(|e| fail("Cannot start GDAL Shapefile driver", e))?;
        let mut dataset = driver
            .create_vector_only(path)
            .map_err(|e| fail("Cannot create shapefile", e))?;
        let srs = SpatialRef::from_epsg(srid).map_err(|e| fail("Unknown reference system", e))?;

        let layer = dataset
            .create_layer(LayerOptions {
                name: LAYER_NAME,
                srs: Some(&srs),
                ty: OGRwkbGeometryType::wkbPolygon,
                options: None,
            })
            .map_err(|e| fail("Cannot create layer 'file_locations'", e))?;

        let location = FieldDefn::new("location", OGRFieldType::OFTString)
            .map_err(|e| fail("Cannot create field 'location'", e))?;
        location.set_width(location_width as i32);
        location
            .add_to_layer(&layer)
            .map_err(|e| fail("Cannot create field 'location'", e))?;

        layer
            .create_defn_fields(&[
                ("x_index", OGRFieldType::OFTInteger),
                ("y_index", OGRFieldType::OFTInteger),
            ])
            .map_err(|e| fail("Cannot create index fields", e))?;

        drop(layer);
        Ok(dataset)
    }

    fn open_existing(path: &Path) -> MosaicResult<(Dataset, HashSet<(usize, usize)>)> {
        let dataset = Dataset::open_ex(
            path,
            DatasetOptions {
                open_flags: GdalOpenFlags::GDAL_OF_UPDATE | GdalOpenFlags::GDAL_OF_VECTOR,
                ..Default::default()
            },
        )
        .map_err(|e| MosaicError::Index(format!("Cannot open shapefile '{}': {}", path.display(), e)))?;

        let keys = read_features(&dataset, path)?
            .into_iter()
            .map(|entry| (entry.x_index, entry.y_index))
            .collect();
        Ok((dataset, keys))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Append one feature for `tile`. A cell already present is rejected.
    pub fn add_tile(&mut self, tile: &Tile) -> MosaicResult<()> {
        log::debug!("Creating index entry for tile ({:06}, {:06})", tile.x_index, tile.y_index);

        if self.keys.contains(&tile.key()) {
            return Err(MosaicError::Index(format!(
                "tile ({}, {}) is already in '{}'",
                tile.x_index,
                tile.y_index,
                self.path.display()
            )));
        }

        let location = self.location_of(&tile.path);
        if location.len() > self.location_width {
            return Err(MosaicError::Index(format!(
                "location '{}' exceeds {} characters",
                location, self.location_width
            )));
        }

        let fail = |e: gdal::errors::GdalError| {
            MosaicError::Index(format!("Could not create entry in '{}': {}", self.path.display(), e))
        };

        let geometry = Geometry::from_wkt(&tile.extent.to_wkt()).map_err(fail)?;
        let mut layer = self.dataset.layer(0).map_err(fail)?;
        layer
            .create_feature_fields(
                geometry,
                &["location", "x_index", "y_index"],
                &[
                    FieldValue::StringValue(location),
                    FieldValue::IntegerValue(tile.x_index as i32),
                    FieldValue::IntegerValue(tile.y_index as i32),
                ],
            )
            .map_err(fail)?;
        drop(layer);

        self.keys.insert(tile.key());
        Ok(())
    }

    /// Flush every feature and release the store
    pub fn close(self) -> MosaicResult<PathBuf> {
        let TileIndex { path, dataset, keys, .. } = self;
        // GDALClose writes the .shp/.shx/.dbf trio
        drop(dataset);
        log::info!("Tile index '{}' closed with {} tiles", path.display(), keys.len());
        Ok(path)
    }

    fn location_of(&self, tile_path: &Path) -> String {
        let base = self.path.parent().unwrap_or_else(|| Path::new(""));
        tile_path
            .strip_prefix(base)
            .unwrap_or(tile_path)
            .to_string_lossy()
            .into_owned()
    }

    /// Read every feature of the store at `path`
    pub fn read_entries<P: AsRef<Path>>(path: P) -> MosaicResult<Vec<TileIndexEntry>> {
        let path = path.as_ref();
        let dataset = Dataset::open_ex(
            path,
            DatasetOptions {
                open_flags: GdalOpenFlags::GDAL_OF_VECTOR,
                ..Default::default()
            },
        )
        .map_err(|e| MosaicError::Index(format!("Cannot open shapefile '{}': {}", path.display(), e)))?;

        read_features(&dataset, path)
    }

    /// Absolute path of an entry's tile file
    pub fn resolve_location<P: AsRef<Path>>(index_path: P, location: &str) -> PathBuf {
        let location = Path::new(location);
        if location.is_absolute() {
            return location.to_path_buf();
        }
        index_path
            .as_ref()
            .parent()
            .map(|dir| dir.join(location))
            .unwrap_or_else(|| location.to_path_buf())
    }

    /// Delete the store at `path` together with its sidecar files
    pub fn remove<P: AsRef<Path>>(path: P) -> MosaicResult<()> {
        let path = path.as_ref();
        for ext in SIDECARS {
            let sidecar = path.with_extension(ext);
            if sidecar.exists() {
                fs::remove_file(&sidecar)?;
            }
        }
        Ok(())
    }
}

fn read_features(dataset: &Dataset, path: &Path) -> MosaicResult<Vec<TileIndexEntry>> {
    let corrupt = |what: String| {
        MosaicError::Index(format!("Shapefile '{}' has wrong format: {}", path.display(), what))
    };

    let mut layer = dataset.layer(0).map_err(|e| corrupt(e.to_string()))?;
    let mut entries = Vec::new();

    for feature in layer.features() {
        let int_field = |name: &str| -> MosaicResult<usize> {
            feature
                .field(name)
                .map_err(|e| corrupt(e.to_string()))?
                .and_then(|v| v.into_int())
                .filter(|v| *v >= 0)
                .map(|v| v as usize)
                .ok_or_else(|| corrupt(format!("missing '{}'", name)))
        };

        let location = feature
            .field("location")
            .map_err(|e| corrupt(e.to_string()))?
            .and_then(|v| v.into_string())
            .ok_or_else(|| corrupt("missing 'location'".to_string()))?;

        let envelope = feature
            .geometry_by_index(0)
            .map_err(|e| corrupt(e.to_string()))?
            .envelope();

        entries.push(TileIndexEntry {
            location,
            x_index: int_field("x_index")?,
            y_index: int_field("y_index")?,
            extent: Extent::new(envelope.MinX, envelope.MinY, envelope.MaxX, envelope.MaxY),
        });
    }

    Ok(entries)
}
