//! Mosaic rebuild orchestration.
//!
//! A run moves through
//! `Init → ContributionsResolved → TilesEnumerated → TilesMaterialized →
//! TilesMerged → IndexWritten → Saved → Done`, or to `Aborted` on the first
//! error. Each call to [`MosaicGenerator::step`] performs exactly one
//! transition, so callers may stop between steps and [`MosaicGenerator::abandon`]
//! the run. The mosaic's tile index reference changes only in the `Saved` step.

use crate::core::contribution::resolve_contributions;
use crate::core::footprint::Footprint;
use crate::core::layout::RunLayout;
use crate::core::materialize::TileMaterializer;
use crate::core::merge::TileMerger;
use crate::core::tile_grid::TileGrid;
use crate::io::tile_index::TileIndex;
use crate::types::{Mosaic, MosaicConfig, MosaicError, MosaicResult, Pixel, Tile};
use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

type TileKey = (usize, usize);

/// Persists the mosaic's tile index reference in the metadata layer
pub trait MosaicStore {
    fn save_tile_index_path(&mut self, mosaic: &Mosaic, path: &Path) -> MosaicResult<()>;
}

/// No external persistence; the in-memory [`Mosaic`] is the only record
impl MosaicStore for () {
    fn save_tile_index_path(&mut self, _mosaic: &Mosaic, _path: &Path) -> MosaicResult<()> {
        Ok(())
    }
}

/// Generation state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenerationState {
    Init,
    ContributionsResolved,
    TilesEnumerated,
    TilesMaterialized,
    TilesMerged,
    IndexWritten,
    Saved,
    Done,
    Aborted,
}

impl GenerationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, GenerationState::Done | GenerationState::Aborted)
    }
}

impl fmt::Display for GenerationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GenerationState::Init => "INIT",
            GenerationState::ContributionsResolved => "CONTRIBUTIONS_RESOLVED",
            GenerationState::TilesEnumerated => "TILES_ENUMERATED",
            GenerationState::TilesMaterialized => "TILES_MATERIALIZED",
            GenerationState::TilesMerged => "TILES_MERGED",
            GenerationState::IndexWritten => "INDEX_WRITTEN",
            GenerationState::Saved => "SAVED",
            GenerationState::Done => "DONE",
            GenerationState::Aborted => "ABORTED",
        };
        write!(f, "{}", name)
    }
}

/// Summary of a finished run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationReport {
    pub stamp: String,
    pub tile_index_path: PathBuf,
    pub contributions: usize,
    pub tiles: usize,
    pub merged_tiles: usize,
    pub removed_intermediate: usize,
}

/// Advisory lock file held for the duration of a run.
///
/// The file records the holder's pid and start time. A lock left behind by a
/// crashed run blocks later runs until it is deleted by hand, or until it is
/// older than `stale_after`, after which it is broken.
struct RunLock {
    path: PathBuf,
}

impl RunLock {
    const FILE_NAME: &'static str = ".mosaic.lock";

    fn acquire(dir: &Path, stale_after: Option<Duration>) -> MosaicResult<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(Self::FILE_NAME);

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    writeln!(file, "pid={} started={}", std::process::id(), Utc::now().to_rfc3339())?;
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = fs::read_to_string(&path).unwrap_or_default();
                    let age = fs::metadata(&path)
                        .and_then(|m| m.modified())
                        .ok()
                        .and_then(|modified| SystemTime::now().duration_since(modified).ok());

                    match (stale_after, age) {
                        (Some(limit), Some(age)) if age >= limit => {
                            log::warn!(
                                "Breaking stale lock '{}' ({}), held for {}s",
                                path.display(),
                                holder.trim(),
                                age.as_secs()
                            );
                            fs::remove_file(&path)?;
                        }
                        _ => {
                            return Err(MosaicError::Busy(format!(
                                "'{}' is held ({}); delete it if no run is active",
                                path.display(),
                                holder.trim()
                            )))
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(MosaicError::Busy(format!("lost the race for '{}'", path.display())))
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::warn!("Could not release lock '{}': {}", self.path.display(), e);
        }
    }
}

/// Rebuilds a rectified stitched mosaic from its linked datasets
pub struct MosaicGenerator<'m, S: MosaicStore> {
    mosaic: &'m mut Mosaic,
    store: &'m mut S,
    config: MosaicConfig,
    grid: TileGrid,
    nodata: Vec<Pixel>,
    layout: RunLayout,
    state: GenerationState,
    previous_index: Option<PathBuf>,

    /// Dataset position and contributing footprint, in ascending time order
    contributions: Vec<(usize, Footprint)>,
    /// Per cell, the indices of the datasets to cut, in ascending time order
    obligations: BTreeMap<TileKey, Vec<usize>>,
    materialized: BTreeMap<TileKey, Vec<Tile>>,
    merged: BTreeMap<TileKey, Tile>,
    removed_intermediate: usize,

    _lock: Option<RunLock>,
}

impl<'m, S: MosaicStore> MosaicGenerator<'m, S> {
    /// Validate the grid, take the run lock and claim a fresh run directory
    pub fn new(mosaic: &'m mut Mosaic, store: &'m mut S, config: MosaicConfig) -> MosaicResult<Self> {
        let grid = TileGrid::for_mosaic(mosaic, config.tile_edge)?;
        if mosaic.bands.is_empty() {
            return Err(MosaicError::InvalidConfig(format!("mosaic '{}' has no bands", mosaic.id)));
        }
        let mut ids = HashSet::new();
        if let Some(dup) = mosaic.datasets.iter().find(|d| !ids.insert(d.id.as_str())) {
            return Err(MosaicError::InvalidConfig(format!(
                "dataset '{}' is linked to mosaic '{}' twice",
                dup.id, mosaic.id
            )));
        }

        log::info!("🧩 Initializing mosaic generation for '{}'", mosaic.id);
        log::debug!(
            "Grid: {}x{} pixels, resolution {} x {}, {} tiles",
            grid.size_x,
            grid.size_y,
            grid.xres,
            grid.yres,
            grid.tile_count().0 * grid.tile_count().1
        );

        let root = config
            .temp_root
            .clone()
            .unwrap_or_else(|| mosaic.storage_dir.clone());

        let lock = if config.use_lock_file {
            Some(RunLock::acquire(&root, config.stale_lock_secs.map(Duration::from_secs))?)
        } else {
            None
        };

        let layout = RunLayout::allocate(&root, Local::now().naive_local())?;
        let nodata = mosaic.nodata_values(config.nodata_value);
        let previous_index = mosaic.tile_index_path().map(Path::to_path_buf);

        Ok(Self {
            mosaic,
            store,
            config,
            grid,
            nodata,
            layout,
            state: GenerationState::Init,
            previous_index,
            contributions: Vec::new(),
            obligations: BTreeMap::new(),
            materialized: BTreeMap::new(),
            merged: BTreeMap::new(),
            removed_intermediate: 0,
            _lock: lock,
        })
    }

    pub fn state(&self) -> GenerationState {
        self.state
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    /// Perform the next transition. Any error moves the run to `Aborted`.
    pub fn step(&mut self) -> MosaicResult<GenerationState> {
        let next = match self.state {
            GenerationState::Init => self.resolve(),
            GenerationState::ContributionsResolved => self.enumerate_tiles(),
            GenerationState::TilesEnumerated => self.materialize_tiles(),
            GenerationState::TilesMaterialized => self.merge_tiles(),
            GenerationState::TilesMerged => self.write_index(),
            GenerationState::IndexWritten => self.save(),
            GenerationState::Saved => Ok(self.finish()),
            GenerationState::Done | GenerationState::Aborted => {
                return Err(MosaicError::InvalidConfig(format!("run is already {}", self.state)))
            }
        };

        match next {
            Ok(state) => {
                log::info!("Mosaic '{}': {} → {}", self.mosaic.id, self.state, state);
                self.state = state;
                Ok(state)
            }
            Err(e) => {
                log::error!("Mosaic '{}' aborted in {}: {}", self.mosaic.id, self.state, e);
                self.state = GenerationState::Aborted;
                self.discard_run();
                Err(e)
            }
        }
    }

    /// Run every remaining step
    pub fn generate(mut self) -> MosaicResult<GenerationReport> {
        while !self.state.is_terminal() {
            self.step()?;
        }

        let report = GenerationReport {
            stamp: self.layout.stamp.clone(),
            tile_index_path: self.layout.index_path.clone(),
            contributions: self.contributions.len(),
            tiles: self.merged.len(),
            merged_tiles: self
                .merged
                .values()
                .filter(|t| t.source == crate::types::TileSource::Merged)
                .count(),
            removed_intermediate: self.removed_intermediate,
        };

        log::info!(
            "✅ Mosaic '{}' generated: {} tiles in '{}'",
            self.mosaic.id,
            report.tiles,
            report.tile_index_path.display()
        );
        Ok(report)
    }

    /// Stop an unfinished run and discard its files. The mosaic keeps its index.
    pub fn abandon(mut self) {
        if matches!(self.state, GenerationState::Saved | GenerationState::Done) {
            return;
        }
        log::info!("Abandoning mosaic run {} in {}", self.layout.stamp, self.state);
        self.state = GenerationState::Aborted;
        if let Err(e) = self.layout.remove() {
            log::warn!("Could not remove run '{}': {}", self.layout.stamp, e);
        }
    }

    /// INIT → CONTRIBUTIONS_RESOLVED
    fn resolve(&mut self) -> MosaicResult<GenerationState> {
        let datasets = &self.mosaic.datasets;
        let contributions = resolve_contributions(datasets, None, self.config.footprint_srid)?;
        log::info!("{} of {} datasets contribute", contributions.len(), datasets.len());

        self.contributions = contributions
            .into_iter()
            .map(|contribution| {
                // Contributions borrow from the mosaic's own dataset list
                datasets
                    .iter()
                    .position(|d| std::ptr::eq(d, contribution.dataset))
                    .map(|position| (position, contribution.contributing_footprint))
                    .ok_or_else(|| MosaicError::Geometry("contribution without dataset".to_string()))
            })
            .collect::<MosaicResult<_>>()?;
        Ok(GenerationState::ContributionsResolved)
    }

    /// CONTRIBUTIONS_RESOLVED → TILES_ENUMERATED: per cell, the datasets that
    /// have to be cut for it
    fn enumerate_tiles(&mut self) -> MosaicResult<GenerationState> {
        let mut obligations: BTreeMap<TileKey, Vec<usize>> = BTreeMap::new();

        for (position, footprint) in &self.contributions {
            log::debug!("Processing Dataset '{}' ...", self.mosaic.datasets[*position].id);
            for key in self.grid.tiles_for_region(footprint)? {
                obligations.entry(key).or_default().push(*position);
            }
        }

        log::debug!("{} tiles touched", obligations.len());
        self.obligations = obligations;
        Ok(GenerationState::TilesEnumerated)
    }

    /// TILES_ENUMERATED → TILES_MATERIALIZED
    fn materialize_tiles(&mut self) -> MosaicResult<GenerationState> {
        let materializer = TileMaterializer::new(&self.grid, &self.layout, &self.nodata)
            .with_data_type(self.mosaic.data_type);
        let datasets = &self.mosaic.datasets;

        let work: Vec<(TileKey, usize)> = self
            .obligations
            .iter()
            .flat_map(|(key, positions)| positions.iter().map(move |p| (*key, *p)))
            .collect();

        let cut = |&(key, position): &(TileKey, usize)| {
            materializer.materialize(&datasets[position], key.0, key.1)
        };

        #[cfg(feature = "parallel")]
        let results: Vec<MosaicResult<Option<Tile>>> = work.par_iter().map(cut).collect();
        #[cfg(not(feature = "parallel"))]
        let results: Vec<MosaicResult<Option<Tile>>> = work.iter().map(cut).collect();

        let mut materialized: BTreeMap<TileKey, Vec<Tile>> = BTreeMap::new();
        for result in results {
            if let Some(tile) = result? {
                materialized.entry(tile.key()).or_default().push(tile);
            }
        }

        log::info!("Materialized {} tiles for {} cells", work.len(), materialized.len());
        self.materialized = materialized;
        Ok(GenerationState::TilesMaterialized)
    }

    /// TILES_MATERIALIZED → TILES_MERGED
    fn merge_tiles(&mut self) -> MosaicResult<GenerationState> {
        let merger = TileMerger::new(&self.grid, &self.layout, &self.nodata).with_data_type(self.mosaic.data_type);
        let groups: Vec<(&TileKey, &Vec<Tile>)> = self.materialized.iter().collect();

        let merge = |(key, tiles): &(&TileKey, &Vec<Tile>)| -> MosaicResult<(TileKey, Tile)> {
            Ok((**key, merger.merge((*tiles).clone())?))
        };

        #[cfg(feature = "parallel")]
        let merged: MosaicResult<BTreeMap<TileKey, Tile>> = groups.par_iter().map(merge).collect();
        #[cfg(not(feature = "parallel"))]
        let merged: MosaicResult<BTreeMap<TileKey, Tile>> = groups.iter().map(merge).collect();

        self.merged = merged?;
        Ok(GenerationState::TilesMerged)
    }

    /// TILES_MERGED → INDEX_WRITTEN
    fn write_index(&mut self) -> MosaicResult<GenerationState> {
        let mut index = TileIndex::open_or_create(
            &self.layout.index_path,
            self.grid.srid,
            self.config.location_width,
        )?;
        for tile in self.merged.values() {
            index.add_tile(tile)?;
        }
        index.close()?;
        Ok(GenerationState::IndexWritten)
    }

    /// INDEX_WRITTEN → SAVED: the store accepts the new reference before the
    /// mosaic itself is repointed
    fn save(&mut self) -> MosaicResult<GenerationState> {
        let new_path = self.layout.index_path.clone();
        self.store.save_tile_index_path(self.mosaic, &new_path)?;
        self.mosaic.set_tile_index_path(new_path);
        Ok(GenerationState::Saved)
    }

    /// SAVED → DONE: drop merged-away intermediates and superseded runs.
    /// The mosaic is already published, so failures here only warn.
    fn finish(&mut self) -> GenerationState {
        for (key, tiles) in self.materialized.iter().filter(|(_, tiles)| tiles.len() > 1) {
            let kept = self.merged.get(key).map(|tile| tile.path.as_path());
            for tile in tiles.iter().filter(|tile| Some(tile.path.as_path()) != kept) {
                match fs::remove_file(&tile.path) {
                    Ok(()) => self.removed_intermediate += 1,
                    Err(e) => log::warn!("Could not remove '{}': {}", tile.path.display(), e),
                }
            }
        }

        if self.config.prune_superseded {
            if let Some(previous) = &self.previous_index {
                self.prune(previous);
            }
        }

        GenerationState::Done
    }

    fn prune(&self, previous: &Path) {
        if previous == self.layout.index_path {
            return;
        }
        if let Err(e) = TileIndex::remove(previous) {
            log::warn!("Could not remove superseded index '{}': {}", previous.display(), e);
        }
        if let Some(old) = RunLayout::from_index_path(previous) {
            if old.tiles_dir.exists() {
                log::info!("Removing superseded tiles '{}'", old.tiles_dir.display());
                if let Err(e) = fs::remove_dir_all(&old.tiles_dir) {
                    log::warn!("Could not remove '{}': {}", old.tiles_dir.display(), e);
                }
            }
        }
    }

    fn discard_run(&self) {
        if !self.config.cleanup_on_abort {
            log::warn!("Leaving files of aborted run {} in place", self.layout.stamp);
            return;
        }
        if let Err(e) = self.layout.remove() {
            log::warn!("Could not clean up aborted run {}: {}", self.layout.stamp, e);
        }
    }
}

/// Rebuild `mosaic` with `config`, persisting the new index through `store`
pub fn make_mosaic<S: MosaicStore>(
    mosaic: &mut Mosaic,
    store: &mut S,
    config: MosaicConfig,
) -> MosaicResult<GenerationReport> {
    MosaicGenerator::new(mosaic, store, config)?.generate()
}
