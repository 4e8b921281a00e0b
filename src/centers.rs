//! Weighted cluster centroids: one tree center per cluster.

use std::collections::BTreeMap;

use serde::ser::SerializeTuple;
use serde::{Serialize, Serializer};

use crate::clustering::ClusterSet;
use crate::matching::Point2D;
use crate::raster::CoverageGrid;

/// Estimated tree position in level pixels (`x` = column, `y` = row).
///
/// Serialized as an `[x, y]` pair. Ordering is by `x`, then `y`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TreeCenter {
    pub x: i64,
    pub y: i64,
}

impl TreeCenter {
    pub fn to_point(self) -> Point2D {
        [self.x as f64, self.y as f64]
    }
}

impl Serialize for TreeCenter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut t = serializer.serialize_tuple(2)?;
        t.serialize_element(&self.x)?;
        t.serialize_element(&self.y)?;
        t.end()
    }
}

#[derive(Default)]
struct WeightedSum {
    weight: u64,
    x: u64,
    y: u64,
}

/// Grid-value-weighted centroid of every cluster, truncated to whole pixels.
///
/// `center_x = Σ(col·v) / Σv`, `center_y = Σ(row·v) / Σv`. The result is sorted
/// by (x, y) so output does not depend on label numbering.
pub fn cluster_centers(grid: &CoverageGrid, clusters: &ClusterSet) -> Vec<TreeCenter> {
    let mut sums: BTreeMap<usize, WeightedSum> = BTreeMap::new();
    for (&(row, col), &label) in clusters.coords.iter().zip(&clusters.labels) {
        let v = grid.get(row, col) as u64;
        let s = sums.entry(label).or_default();
        s.weight += v;
        s.x += col as u64 * v;
        s.y += row as u64 * v;
    }

    let mut centers: Vec<TreeCenter> = sums
        .into_iter()
        .filter_map(|(label, s)| {
            if s.weight == 0 {
                log::warn!("cluster {label} has zero total weight, skipped");
                return None;
            }
            Some(TreeCenter {
                x: (s.x / s.weight) as i64,
                y: (s.y / s.weight) as i64,
            })
        })
        .collect();
    centers.sort_unstable();
    centers
}
