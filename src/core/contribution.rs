use crate::core::footprint::Footprint;
use crate::types::{Dataset, MosaicResult};

/// A dataset together with the part of its footprint that survives in the mosaic
#[derive(Debug, Clone)]
pub struct Contribution<'a> {
    pub dataset: &'a Dataset,
    pub contributing_footprint: Footprint,
}

impl<'a> Contribution<'a> {
    fn subtract(&mut self, other: &Footprint) -> MosaicResult<()> {
        self.contributing_footprint = self.contributing_footprint.difference(other)?;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.contributing_footprint.is_empty()
    }
}

/// Resolve which area of each dataset ends up in the mosaic.
///
/// Datasets are ordered by begin time (stable, so equal times keep their input
/// order) and every later dataset claims its footprint from all earlier ones.
/// Footprints are compared in `footprint_srid`. With a `clip` polygon only
/// intersecting datasets are considered and contributions are limited to it.
///
/// The result is time-ascending, pairwise interior-disjoint and free of empty
/// contributions.
pub fn resolve_contributions<'a>(
    datasets: &'a [Dataset],
    clip: Option<&Footprint>,
    footprint_srid: u32,
) -> MosaicResult<Vec<Contribution<'a>>> {
    let clip = clip.map(|poly| poly.reproject(footprint_srid)).transpose()?;

    let mut candidates = Vec::with_capacity(datasets.len());
    for dataset in datasets {
        let footprint = dataset.footprint.reproject(footprint_srid)?;
        if let Some(clip) = &clip {
            if !footprint.intersects(clip)? {
                continue;
            }
        }
        candidates.push((dataset, footprint));
    }

    // Vec::sort_by_key is stable
    candidates.sort_by_key(|(dataset, _)| dataset.begin_time);

    let mut contributions: Vec<Contribution<'a>> = Vec::with_capacity(candidates.len());

    for (dataset, footprint) in candidates {
        for contribution in contributions.iter_mut() {
            contribution.subtract(&footprint)?;
        }

        let contributing_footprint = match &clip {
            Some(clip) => footprint.intersection(clip)?,
            None => footprint,
        };

        contributions.push(Contribution { dataset, contributing_footprint });
    }

    let resolved: Vec<_> = contributions.into_iter().filter(|c| !c.is_empty()).collect();

    for contribution in &resolved {
        log::debug!(
            "Dataset '{}' contributes area {:.3}",
            contribution.dataset.id,
            contribution.contributing_footprint.area()
        );
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Extent, RasterSource};
    use approx::assert_relative_eq;
    use chrono::{TimeZone, Utc};
    use ndarray::Array3;

    fn dataset(id: &str, hour: u32, extent: Extent) -> Dataset {
        Dataset {
            id: id.to_string(),
            footprint: Footprint::from_extent(&extent, 4326),
            begin_time: Utc.with_ymd_and_hms(2011, 5, 1, hour, 0, 0).unwrap(),
            source: RasterSource::in_memory(Array3::zeros((1, 1, 1)), None),
            extent,
            size: (1, 1),
            srid: 4326,
        }
    }

    fn total_overlap(contributions: &[Contribution<'_>]) -> f64 {
        let mut overlap = 0.0;
        for (i, a) in contributions.iter().enumerate() {
            for b in &contributions[i + 1..] {
                overlap += a
                    .contributing_footprint
                    .intersection(&b.contributing_footprint)
                    .unwrap()
                    .area();
            }
        }
        overlap
    }

    #[test]
    fn test_later_dataset_claims_overlap() {
        let datasets = vec![
            dataset("D2", 12, Extent::new(200.0, 200.0, 512.0, 512.0)),
            dataset("D1", 6, Extent::new(0.0, 0.0, 300.0, 300.0)),
        ];

        let contributions = resolve_contributions(&datasets, None, 4326).unwrap();
        let ids: Vec<_> = contributions.iter().map(|c| c.dataset.id.as_str()).collect();
        assert_eq!(ids, vec!["D1", "D2"]);

        assert_relative_eq!(contributions[0].contributing_footprint.area(), 80_000.0, epsilon = 1e-6);
        assert_relative_eq!(contributions[1].contributing_footprint.area(), 312.0 * 312.0, epsilon = 1e-6);
    }

    #[test]
    fn test_contributions_are_disjoint_and_conserve_coverage() {
        let datasets = vec![
            dataset("a", 1, Extent::new(0.0, 0.0, 10.0, 10.0)),
            dataset("b", 2, Extent::new(5.0, 5.0, 15.0, 15.0)),
            dataset("c", 3, Extent::new(8.0, 0.0, 12.0, 20.0)),
            dataset("d", 4, Extent::new(-3.0, 4.0, 6.0, 6.0)),
        ];

        let contributions = resolve_contributions(&datasets, None, 4326).unwrap();
        assert_relative_eq!(total_overlap(&contributions), 0.0, epsilon = 1e-9);

        let mut input_union = Footprint::empty(4326);
        for d in &datasets {
            input_union = input_union.union(&d.footprint).unwrap();
        }
        let contributed: f64 = contributions.iter().map(|c| c.contributing_footprint.area()).sum();
        assert_relative_eq!(contributed, input_union.area(), epsilon = 1e-6);
    }

    #[test]
    fn test_fully_covered_dataset_is_dropped() {
        let datasets = vec![
            dataset("small", 1, Extent::new(2.0, 2.0, 4.0, 4.0)),
            dataset("big", 2, Extent::new(0.0, 0.0, 10.0, 10.0)),
        ];

        let contributions = resolve_contributions(&datasets, None, 4326).unwrap();
        assert_eq!(contributions.len(), 1);
        assert_eq!(contributions[0].dataset.id, "big");
    }

    #[test]
    fn test_equal_times_keep_input_order() {
        let first = dataset("first", 5, Extent::new(0.0, 0.0, 10.0, 10.0));
        let second = dataset("second", 5, Extent::new(5.0, 0.0, 15.0, 10.0));

        let forward = vec![first.clone(), second.clone()];
        let a = resolve_contributions(&forward, None, 4326).unwrap();
        let b = resolve_contributions(&forward, None, 4326).unwrap();
        assert_eq!(a[0].contributing_footprint, b[0].contributing_footprint);
        assert_eq!(a[0].dataset.id, "first");
        assert_relative_eq!(a[0].contributing_footprint.area(), 50.0, epsilon = 1e-9);
        assert_relative_eq!(a[1].contributing_footprint.area(), 100.0, epsilon = 1e-9);

        // Swapping equal-time inputs swaps the winner
        let reversed = vec![second, first];
        let c = resolve_contributions(&reversed, None, 4326).unwrap();
        assert_eq!(c[0].dataset.id, "second");
        assert_relative_eq!(c[0].contributing_footprint.area(), 50.0, epsilon = 1e-9);
        assert_relative_eq!(c[1].contributing_footprint.area(), 100.0, epsilon = 1e-9);
    }

    #[test]
    fn test_clip_polygon_filters_and_limits() {
        let datasets = vec![
            dataset("west", 1, Extent::new(0.0, 0.0, 10.0, 10.0)),
            dataset("east", 2, Extent::new(20.0, 0.0, 30.0, 10.0)),
        ];
        let clip = Footprint::from_extent(&Extent::new(5.0, 0.0, 15.0, 10.0), 4326);

        let contributions = resolve_contributions(&datasets, Some(&clip), 4326).unwrap();
        assert_eq!(contributions.len(), 1);
        assert_eq!(contributions[0].dataset.id, "west");
        assert_eq!(
            contributions[0].contributing_footprint.extent(),
            Some(Extent::new(5.0, 0.0, 10.0, 10.0))
        );
    }

    #[test]
    fn test_empty_input() {
        let contributions = resolve_contributions(&[], None, 4326).unwrap();
        assert!(contributions.is_empty());
    }
}
