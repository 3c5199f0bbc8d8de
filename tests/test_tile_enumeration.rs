use eomosaic::core::resolve_contributions;
use eomosaic::{Extent, Footprint, TileGrid};

/// 2x2 grid of 1000 km tiles in web mercator
fn mercator_grid() -> TileGrid {
    TileGrid::new(3857, Extent::new(0.0, 0.0, 2_000_000.0, 2_000_000.0), (2000, 2000), 1000)
        .expect("Failed to build grid")
}

fn lonlat_box(min: f64, max: f64) -> Footprint {
    Footprint::from_extent(&Extent::new(min, min, max, max), 4326)
}

#[test]
fn test_lonlat_footprint_on_mercator_grid() {
    let grid = mercator_grid();

    // ~557 km square at the origin only reaches the lower-left tile
    let small: Vec<_> = grid.tiles_for_region(&lonlat_box(0.0, 5.0)).expect("Enumeration failed").collect();
    assert_eq!(small, vec![(0, 1)]);

    // ~1113 km square crosses both tile boundaries
    let large: Vec<_> = grid.tiles_for_region(&lonlat_box(0.0, 10.0)).expect("Enumeration failed").collect();
    assert_eq!(large, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
}

#[test]
fn test_region_west_of_grid_touches_nothing() {
    let grid = mercator_grid();
    let tiles: Vec<_> = grid
        .tiles_for_region(&lonlat_box(-20.0, -10.0))
        .expect("Enumeration failed")
        .collect();
    assert!(tiles.is_empty());
}

#[test]
fn test_newer_contribution_shrinks_older_tiles() {
    use chrono::{TimeZone, Utc};
    use eomosaic::{Dataset, RasterSource};
    use ndarray::Array3;

    let grid = mercator_grid();
    let dataset = |id: &str, footprint: Footprint, year: i32| Dataset {
        id: id.to_string(),
        footprint,
        begin_time: Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).unwrap(),
        source: RasterSource::in_memory(Array3::zeros((1, 1, 1)), None),
        extent: Extent::new(0.0, 0.0, 1.0, 1.0),
        size: (1, 1),
        srid: 3857,
    };

    // Older wide scene, newer scene covering everything above 5°N
    let datasets = vec![
        dataset("old", lonlat_box(0.0, 10.0), 2010),
        dataset("new", Footprint::from_extent(&Extent::new(0.0, 5.0, 10.0, 10.0), 4326), 2011),
    ];
    let contributions = resolve_contributions(&datasets, None, 4326).expect("Resolution failed");
    assert_eq!(contributions.len(), 2);

    let old: Vec<_> = grid
        .tiles_for_region(&contributions[0].contributing_footprint)
        .expect("Enumeration failed")
        .collect();
    // 0..5°N stays below the 1000 km line but still spans both columns
    assert_eq!(old, vec![(0, 1), (1, 1)]);
}
