//! Footprint geometry: planar polygon operations backed by `geo`, WKT parsing
//! and reprojection backed by GDAL/OGR.

use crate::types::{Extent, MosaicError, MosaicResult};
use gdal::spatial_ref::{CoordTransform, SpatialRef};
use geo::{Area, BooleanOps, BoundingRect, Intersects, LineString, MultiPolygon, Polygon, Relate};

/// A (multi)polygon tagged with the EPSG code of its reference system
#[derive(Debug, Clone, PartialEq)]
pub struct Footprint {
    srid: u32,
    geometry: MultiPolygon<f64>,
}

impl Footprint {
    pub fn new(geometry: MultiPolygon<f64>, srid: u32) -> Self {
        Self { srid, geometry }
    }

    pub fn from_polygon(polygon: Polygon<f64>, srid: u32) -> Self {
        Self::new(MultiPolygon::new(vec![polygon]), srid)
    }

    pub fn from_extent(extent: &Extent, srid: u32) -> Self {
        Self::from_polygon(extent.to_polygon(), srid)
    }

    pub fn empty(srid: u32) -> Self {
        Self::new(MultiPolygon::new(Vec::new()), srid)
    }

    /// Parse a POLYGON / MULTIPOLYGON (or a collection of them) from WKT
    pub fn from_wkt(wkt: &str, srid: u32) -> MosaicResult<Self> {
        let geometry = gdal::vector::Geometry::from_wkt(wkt)
            .and_then(|g| g.to_geo())
            .map_err(|e| MosaicError::Geometry(format!("Cannot parse footprint WKT: {}", e)))?;

        let mut polygons = Vec::new();
        collect_polygons(geometry, &mut polygons)?;
        Ok(Self::new(MultiPolygon::new(polygons), srid))
    }

    pub fn srid(&self) -> u32 {
        self.srid
    }

    pub fn geometry(&self) -> &MultiPolygon<f64> {
        &self.geometry
    }

    pub fn area(&self) -> f64 {
        self.geometry.unsigned_area()
    }

    /// No polygons at all, or nothing but zero-area rings
    pub fn is_empty(&self) -> bool {
        self.geometry.0.is_empty() || self.area() == 0.0
    }

    /// Bounding extent; `None` for an empty footprint
    pub fn extent(&self) -> Option<Extent> {
        if self.geometry.0.is_empty() {
            return None;
        }
        self.geometry
            .bounding_rect()
            .map(|r| Extent::new(r.min().x, r.min().y, r.max().x, r.max().y))
    }

    pub fn intersects(&self, other: &Footprint) -> MosaicResult<bool> {
        self.check_srid(other)?;
        Ok(self.geometry.intersects(&other.geometry))
    }

    /// True when the interiors overlap; shared edges or corners do not count
    pub fn overlaps_interior(&self, other: &Polygon<f64>) -> bool {
        if self.geometry.0.is_empty() {
            return false;
        }
        let matrix = self.geometry.relate(other);
        matrix.is_intersects() && !matrix.is_touches()
    }

    pub fn difference(&self, other: &Footprint) -> MosaicResult<Footprint> {
        self.check_srid(other)?;
        Ok(Self::new(self.geometry.difference(&other.geometry), self.srid))
    }

    pub fn intersection(&self, other: &Footprint) -> MosaicResult<Footprint> {
        self.check_srid(other)?;
        Ok(Self::new(self.geometry.intersection(&other.geometry), self.srid))
    }

    pub fn union(&self, other: &Footprint) -> MosaicResult<Footprint> {
        self.check_srid(other)?;
        Ok(Self::new(self.geometry.union(&other.geometry), self.srid))
    }

    /// Transform every vertex into `target_srid`
    pub fn reproject(&self, target_srid: u32) -> MosaicResult<Footprint> {
        if target_srid == self.srid {
            return Ok(self.clone());
        }

        log::debug!("Reprojecting footprint from EPSG:{} to EPSG:{}", self.srid, target_srid);

        let transform = coord_transform(self.srid, target_srid)?;
        let polygons = self
            .geometry
            .iter()
            .map(|polygon| {
                let exterior = transform_ring(&transform, polygon.exterior())?;
                let interiors = polygon
                    .interiors()
                    .iter()
                    .map(|ring| transform_ring(&transform, ring))
                    .collect::<MosaicResult<Vec<_>>>()?;
                Ok(Polygon::new(exterior, interiors))
            })
            .collect::<MosaicResult<Vec<_>>>()?;

        Ok(Self::new(MultiPolygon::new(polygons), target_srid))
    }

    fn check_srid(&self, other: &Footprint) -> MosaicResult<()> {
        if self.srid != other.srid {
            return Err(MosaicError::Geometry(format!(
                "Footprints in different reference systems: EPSG:{} vs EPSG:{}",
                self.srid, other.srid
            )));
        }
        Ok(())
    }
}

fn collect_polygons(geometry: geo::Geometry<f64>, out: &mut Vec<Polygon<f64>>) -> MosaicResult<()> {
    match geometry {
        geo::Geometry::Polygon(p) => out.push(p),
        geo::Geometry::MultiPolygon(mp) => out.extend(mp.0),
        geo::Geometry::Rect(r) => out.push(r.to_polygon()),
        geo::Geometry::GeometryCollection(gc) => {
            for g in gc.0 {
                collect_polygons(g, out)?;
            }
        }
        other => {
            return Err(MosaicError::Geometry(format!(
                "Footprint must be polygonal, got {:?}",
                other
            )))
        }
    }
    Ok(())
}

fn coord_transform(source_srid: u32, target_srid: u32) -> MosaicResult<CoordTransform> {
    let srs = |srid: u32| -> MosaicResult<SpatialRef> {
        let srs = SpatialRef::from_epsg(srid)
            .map_err(|e| MosaicError::Geometry(format!("Unsupported reference system EPSG:{}: {}", srid, e)))?;
        // x = easting/longitude regardless of the authority's axis order
        srs.set_axis_mapping_strategy(gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);
        Ok(srs)
    };

    CoordTransform::new(&srs(source_srid)?, &srs(target_srid)?).map_err(|e| {
        MosaicError::Geometry(format!(
            "Cannot transform EPSG:{} to EPSG:{}: {}",
            source_srid, target_srid, e
        ))
    })
}

fn transform_ring(transform: &CoordTransform, ring: &LineString<f64>) -> MosaicResult<LineString<f64>> {
    let mut xs: Vec<f64> = ring.coords().map(|c| c.x).collect();
    let mut ys: Vec<f64> = ring.coords().map(|c| c.y).collect();
    let mut zs = vec![0.0; xs.len()];

    transform
        .transform_coords(&mut xs, &mut ys, &mut zs)
        .map_err(|e| MosaicError::Geometry(format!("Coordinate transformation failed: {}", e)))?;

    Ok(xs.into_iter().zip(ys).collect::<Vec<(f64, f64)>>().into())
}
