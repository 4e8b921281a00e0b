//! DBSCAN over the non-zero cells of a filtered heatmap.
//!
//! Cells are integer lattice points, so the eps-neighborhood of a cell is a
//! fixed set of row spans: for every row offset `dr` in `[-eps, eps]` the
//! columns within `sqrt(eps² - dr²)`. Points are bucketed by row with sorted
//! columns and each span is found by binary search, which keeps region
//! queries exact without building a full distance matrix.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrunkmapError};
use crate::raster::CoverageGrid;

/// DBSCAN parameters. A point is a core point when at least `min_samples`
/// points (itself included) lie within Euclidean distance `eps`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DbscanParams {
    pub eps: f64,
    pub min_samples: usize,
}

impl Default for DbscanParams {
    fn default() -> Self {
        Self {
            eps: 50.0,
            min_samples: 200,
        }
    }
}

impl DbscanParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.eps.is_finite() && self.eps > 0.0) {
            return Err(TrunkmapError::invalid(
                "eps",
                format!("{} must be a positive distance", self.eps),
            ));
        }
        if self.min_samples == 0 {
            return Err(TrunkmapError::invalid("min_samples", "must be at least 1"));
        }
        Ok(())
    }
}

/// Clustered cells with noise removed. `coords[i]` is `(row, col)` and
/// `labels[i]` its cluster. Labels are dense from 0 in order of discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterSet {
    pub coords: Vec<(usize, usize)>,
    pub labels: Vec<usize>,
}

impl ClusterSet {
    pub fn len(&self) -> usize {
        self.coords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    pub fn cluster_count(&self) -> usize {
        self.labels.iter().max().map_or(0, |&m| m + 1)
    }

    /// Member cells per label.
    pub fn members(&self) -> BTreeMap<usize, Vec<(usize, usize)>> {
        let mut out: BTreeMap<usize, Vec<(usize, usize)>> = BTreeMap::new();
        for (&c, &l) in self.coords.iter().zip(&self.labels) {
            out.entry(l).or_default().push(c);
        }
        out
    }
}

/// Row-bucketed lookup of lattice points.
struct LatticeIndex {
    rows: HashMap<i64, Vec<(i64, usize)>>,
    /// (row offset, max column offset) pairs covering the eps disc.
    spans: Vec<(i64, i64)>,
}

impl LatticeIndex {
    fn new(points: &[(i64, i64)], eps: f64) -> Self {
        let mut rows: HashMap<i64, Vec<(i64, usize)>> = HashMap::new();
        for (i, &(r, c)) in points.iter().enumerate() {
            rows.entry(r).or_default().push((c, i));
        }
        for cols in rows.values_mut() {
            cols.sort_unstable();
        }
        Self {
            rows,
            spans: disc_spans(eps),
        }
    }

    /// Indices of all points within eps of `p`, `p` included.
    fn region(&self, p: (i64, i64), out: &mut Vec<usize>) {
        out.clear();
        for &(dr, dc) in &self.spans {
            let Some(cols) = self.rows.get(&(p.0 + dr)) else {
                continue;
            };
            let lo = p.1 - dc;
            let hi = p.1 + dc;
            let start = cols.partition_point(|&(c, _)| c < lo);
            out.extend(
                cols[start..]
                    .iter()
                    .take_while(|&&(c, _)| c <= hi)
                    .map(|&(_, i)| i),
            );
        }
    }

    fn region_size(&self, p: (i64, i64)) -> usize {
        let mut n = 0;
        for &(dr, dc) in &self.spans {
            if let Some(cols) = self.rows.get(&(p.0 + dr)) {
                let start = cols.partition_point(|&(c, _)| c < p.1 - dc);
                let end = cols.partition_point(|&(c, _)| c <= p.1 + dc);
                n += end - start;
            }
        }
        n
    }
}

/// Integer row spans of the closed disc of radius `eps`.
fn disc_spans(eps: f64) -> Vec<(i64, i64)> {
    let eps2 = eps * eps;
    let within = |dr: i64, dc: i64| ((dr * dr + dc * dc) as f64) <= eps2;
    let rmax = eps.floor() as i64;
    let mut spans = Vec::with_capacity((2 * rmax + 1) as usize);
    for dr in -rmax..=rmax {
        let mut dc = (eps2 - (dr * dr) as f64).max(0.0).sqrt().floor() as i64;
        while within(dr, dc + 1) {
            dc += 1;
        }
        while dc > 0 && !within(dr, dc) {
            dc -= 1;
        }
        if within(dr, dc) {
            spans.push((dr, dc));
        }
    }
    spans
}

/// DBSCAN labels for `points` (`None` = noise).
///
/// Points are visited in input order; a border point reachable from several
/// clusters joins the first one that reaches it.
pub fn dbscan(points: &[(i64, i64)], params: &DbscanParams) -> Vec<Option<usize>> {
    let n = points.len();
    let mut labels: Vec<Option<usize>> = vec![None; n];
    if n == 0 {
        return labels;
    }

    let index = LatticeIndex::new(points, params.eps);
    let is_core: Vec<bool> = points
        .iter()
        .map(|&p| index.region_size(p) >= params.min_samples)
        .collect();

    let mut next_label = 0usize;
    let mut stack = Vec::new();
    let mut region = Vec::new();

    for i in 0..n {
        if labels[i].is_some() || !is_core[i] {
            continue;
        }
        let label = next_label;
        next_label += 1;
        labels[i] = Some(label);
        stack.push(i);

        while let Some(p) = stack.pop() {
            index.region(points[p], &mut region);
            for &q in &region {
                if labels[q].is_none() {
                    labels[q] = Some(label);
                    if is_core[q] {
                        stack.push(q);
                    }
                }
            }
        }
    }

    labels
}

/// Cluster the non-zero cells of `grid`, dropping noise.
///
/// An all-zero grid yields an empty set without running DBSCAN.
pub fn extract_clusters(grid: &CoverageGrid, params: &DbscanParams) -> ClusterSet {
    let cells = grid.nonzero_cells();
    if cells.is_empty() {
        log::info!("no cells left after filtering");
        return ClusterSet::default();
    }

    let points: Vec<(i64, i64)> = cells.iter().map(|&(r, c)| (r as i64, c as i64)).collect();
    let labels = dbscan(&points, params);

    let mut out = ClusterSet::default();
    for (cell, label) in cells.into_iter().zip(labels) {
        if let Some(l) = label {
            out.coords.push(cell);
            out.labels.push(l);
        }
    }
    log::info!(
        "dbscan(eps={}, min_samples={}): {} clusters, {} of {} cells kept",
        params.eps,
        params.min_samples,
        out.cluster_count(),
        out.len(),
        points.len()
    );
    out
}
