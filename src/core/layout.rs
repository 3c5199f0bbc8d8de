use crate::io::tile_index::TileIndex;
use crate::types::{MosaicResult, TileSource};
use chrono::{Duration, NaiveDateTime};
use std::fs;
use std::path::{Path, PathBuf};

/// Format of the per-run timestamp
pub const STAMP_FORMAT: &str = "%Y%m%dT%H%M%S";

/// Prefix of per-dataset tile names; merged tiles are `tile_merged_*`
const DATASET_PREFIX: &str = "ds-";

/// Files belonging to one generation run below the mosaic's storage root:
/// `tiles_<stamp>/xxx/yyy/tile_*.tiff` and `tindex_<stamp>.shp`
#[derive(Debug, Clone, PartialEq)]
pub struct RunLayout {
    pub stamp: String,
    pub root: PathBuf,
    pub tiles_dir: PathBuf,
    pub index_path: PathBuf,
}

impl RunLayout {
    pub fn new<P: AsRef<Path>>(root: P, time: NaiveDateTime) -> Self {
        let root = root.as_ref().to_path_buf();
        let stamp = time.format(STAMP_FORMAT).to_string();
        Self {
            tiles_dir: root.join(format!("tiles_{}", stamp)),
            index_path: root.join(format!("tindex_{}.shp", stamp)),
            stamp,
            root,
        }
    }

    /// Claim a fresh layout at or after `start` and create its tile directory.
    ///
    /// Runs started within the same second move on to the next free stamp.
    pub fn allocate<P: AsRef<Path>>(root: P, start: NaiveDateTime) -> MosaicResult<Self> {
        fs::create_dir_all(root.as_ref())?;

        let mut time = start;
        loop {
            let layout = Self::new(root.as_ref(), time);
            if !layout.tiles_dir.exists() && !layout.index_path.exists() {
                match fs::create_dir(&layout.tiles_dir) {
                    Ok(()) => return Ok(layout),
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                    Err(e) => return Err(e.into()),
                }
            }
            time += Duration::seconds(1);
        }
    }

    /// Rebuild the layout an index path was written by, from its `tindex_<stamp>` name
    pub fn from_index_path(index_path: &Path) -> Option<Self> {
        let stem = index_path.file_stem()?.to_str()?;
        let stamp = stem.strip_prefix("tindex_")?;
        let time = NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).ok()?;
        let root = index_path.parent()?;
        Some(Self::new(root, time))
    }

    /// Path for a tile file, creating its shard directory.
    ///
    /// Distinct sources always get distinct names: dataset ids are escaped and
    /// prefixed so they never meet each other or the merged tile.
    pub fn tile_path(&self, source: &TileSource, x_index: usize, y_index: usize) -> MosaicResult<PathBuf> {
        let dir = self
            .tiles_dir
            .join(format!("{:03}", x_index / 1000))
            .join(format!("{:03}", y_index / 1000));
        fs::create_dir_all(&dir)?;

        let name = match source {
            TileSource::Dataset(id) => format!("{}{}", DATASET_PREFIX, escape(id)),
            TileSource::Merged => "merged".to_string(),
        };
        Ok(dir.join(format!("tile_{}_{:06}_{:06}.tiff", name, x_index, y_index)))
    }

    /// Delete the tile tree and the index store of this run
    pub fn remove(&self) -> MosaicResult<()> {
        if self.tiles_dir.exists() {
            fs::remove_dir_all(&self.tiles_dir)?;
        }
        TileIndex::remove(&self.index_path)
    }
}

/// Percent-escape every byte outside `[A-Za-z0-9._-]`, `%` included, so the
/// mapping stays reversible
fn escape(id: &str) -> String {
    let mut escaped = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.') {
            escaped.push(byte as char);
        } else {
            escaped.push_str(&format!("%{:02X}", byte));
        }
    }
    escaped
}
