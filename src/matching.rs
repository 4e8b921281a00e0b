//! Matching of detected tree centers with ground truth, and detection metrics.
//!
//! Two association rules are available:
//! - [`MatchStrategy::FirstClaim`] (default): detections are processed in input
//!   order and each queries its nearest ground-truth point. The detection is
//!   matched when that point is strictly closer than `max_distance` and not
//!   yet claimed, otherwise it is a false positive.
//! - [`MatchStrategy::GlobalGreedy`]: pairs below the threshold are associated
//!   in increasing distance order, each side used at most once.
//!
//! Ground-truth points are tracked by index. Identical coordinates share one
//! entry of the spatial index and are claimed one at a time.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use kiddo::{KdTree, SquaredEuclidean};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrunkmapError};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A 2D point: (x, y) in level pixels.
pub type Point2D = [f64; 2];

/// How detections claim ground-truth points.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    #[default]
    FirstClaim,
    GlobalGreedy,
}

impl FromStr for MatchStrategy {
    type Err = TrunkmapError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "first_claim" => Ok(Self::FirstClaim),
            "global_greedy" => Ok(Self::GlobalGreedy),
            other => Err(TrunkmapError::invalid(
                "strategy",
                format!("unknown matching strategy '{other}'"),
            )),
        }
    }
}

impl fmt::Display for MatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::FirstClaim => "first-claim",
            Self::GlobalGreedy => "global-greedy",
        })
    }
}

/// A matched pair of detected and ground-truth centers.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedPair {
    /// 0-based index into the detections.
    pub d_idx: usize,
    /// 0-based index into the ground truth.
    pub r_idx: usize,
    /// Planimetric distance between the pair.
    pub distance: f64,
}

/// Result of [`associate`]. Indices refer to the input slices.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Association {
    pub matches: Vec<MatchedPair>,
    /// Detections with no ground truth within range, in input order.
    pub false_positives: Vec<usize>,
    /// Ground-truth points left unmatched, in input order.
    pub false_negatives: Vec<usize>,
}

/// The association expressed with coordinates, for reports.
#[derive(Debug, Clone, Serialize)]
pub struct AssociationPoints {
    /// `(detection, ground_truth)` pairs.
    pub matches: Vec<(Point2D, Point2D)>,
    pub false_positives: Vec<Point2D>,
    pub false_negatives: Vec<Point2D>,
}

impl Association {
    pub fn to_points(&self, detections: &[Point2D], ground_truth: &[Point2D]) -> AssociationPoints {
        AssociationPoints {
            matches: self
                .matches
                .iter()
                .map(|m| (detections[m.d_idx], ground_truth[m.r_idx]))
                .collect(),
            false_positives: self.false_positives.iter().map(|&i| detections[i]).collect(),
            false_negatives: self.false_negatives.iter().map(|&i| ground_truth[i]).collect(),
        }
    }
}

/// Detection counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DetectionStats {
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
}

/// Precision, recall and positional RMSE of an association.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EvaluationMetrics {
    /// `TP / (TP + FP)`, 0 when there are no detections.
    pub precision: f64,
    /// `TP / (TP + FN)`, 0 when there is no ground truth.
    pub recall: f64,
    /// Root mean square of per-axis differences over matched pairs;
    /// `None` without matches.
    pub rmse: Option<f64>,
    #[serde(flatten)]
    pub stats: DetectionStats,
}

/// kd-tree over the distinct ground-truth coordinates ("sites"). Each site
/// keeps the ground-truth indices found at it, in input order.
struct GroundTruthIndex {
    tree: KdTree<f64, 2>,
    sites: Vec<Vec<usize>>,
}

impl GroundTruthIndex {
    fn new(ground_truth: &[Point2D]) -> Self {
        let mut tree: KdTree<f64, 2> = KdTree::with_capacity(ground_truth.len());
        let mut sites: Vec<Vec<usize>> = Vec::new();
        let mut site_of: HashMap<(u64, u64), usize> = HashMap::new();
        for (i, p) in ground_truth.iter().enumerate() {
            // + 0.0 folds -0.0 into 0.0
            let key = ((p[0] + 0.0).to_bits(), (p[1] + 0.0).to_bits());
            let site = *site_of.entry(key).or_insert_with(|| {
                tree.add(p, sites.len() as u64);
                sites.push(Vec::new());
                sites.len() - 1
            });
            sites[site].push(i);
        }
        Self { tree, sites }
    }

    /// Sites strictly closer than `sqrt(max_d2)` to `p`, closest first
    /// (ties broken by site order).
    fn within(&self, p: &Point2D, max_d2: f64) -> Vec<(f64, usize)> {
        let mut hits: Vec<(f64, usize)> = self
            .tree
            .within_unsorted::<SquaredEuclidean>(p, max_d2)
            .into_iter()
            .filter(|nn| nn.distance < max_d2)
            .map(|nn| (nn.distance, nn.item as usize))
            .collect();
        hits.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        hits
    }
}

// ---------------------------------------------------------------------------
// associate
// ---------------------------------------------------------------------------

/// Associate detected tree centers with ground-truth centers.
///
/// A pair is eligible when its distance is strictly below `max_distance`.
///
/// # Arguments
/// - `detections`: detected centers `[x, y]`
/// - `ground_truth`: reference centers `[x, y]`
/// - `max_distance`: matching radius (pixels)
/// - `strategy`: see [`MatchStrategy`]
pub fn associate(
    detections: &[Point2D],
    ground_truth: &[Point2D],
    max_distance: f64,
    strategy: MatchStrategy,
) -> Association {
    let nd = detections.len();
    let nr = ground_truth.len();
    if nd == 0 || nr == 0 {
        return Association {
            matches: Vec::new(),
            false_positives: (0..nd).collect(),
            false_negatives: (0..nr).collect(),
        };
    }

    let index = GroundTruthIndex::new(ground_truth);
    let max_d2 = max_distance * max_distance;

    let mut used_r = vec![false; nr];
    let mut used_d = vec![false; nd];
    let mut matches = Vec::new();

    match strategy {
        MatchStrategy::FirstClaim => {
            for (j, d) in detections.iter().enumerate() {
                let Some(&(d2, site)) = index.within(d, max_d2).first() else {
                    continue;
                };
                if let Some(&i) = index.sites[site].iter().find(|&&i| !used_r[i]) {
                    used_r[i] = true;
                    used_d[j] = true;
                    matches.push(MatchedPair {
                        d_idx: j,
                        r_idx: i,
                        distance: d2.sqrt(),
                    });
                }
            }
        }
        MatchStrategy::GlobalGreedy => {
            let mut pairs: Vec<(f64, usize, usize)> = Vec::new();
            for (j, d) in detections.iter().enumerate() {
                for (d2, site) in index.within(d, max_d2) {
                    pairs.extend(index.sites[site].iter().map(|&i| (d2, j, i)));
                }
            }
            pairs.sort_by(|a, b| {
                a.0.total_cmp(&b.0)
                    .then(a.1.cmp(&b.1))
                    .then(a.2.cmp(&b.2))
            });
            for (d2, j, i) in pairs {
                if used_d[j] || used_r[i] {
                    continue;
                }
                used_d[j] = true;
                used_r[i] = true;
                matches.push(MatchedPair {
                    d_idx: j,
                    r_idx: i,
                    distance: d2.sqrt(),
                });
            }
        }
    }

    Association {
        matches,
        false_positives: (0..nd).filter(|&j| !used_d[j]).collect(),
        false_negatives: (0..nr).filter(|&i| !used_r[i]).collect(),
    }
}

// ---------------------------------------------------------------------------
// metrics
// ---------------------------------------------------------------------------

pub fn detection_stats(association: &Association) -> DetectionStats {
    DetectionStats {
        true_positives: association.matches.len(),
        false_positives: association.false_positives.len(),
        false_negatives: association.false_negatives.len(),
    }
}

/// Precision, recall and RMSE of an association.
///
/// RMSE is taken over the flattened per-axis differences of matched pairs:
/// `sqrt(Σ(dx² + dy²) / (2·TP))`.
pub fn evaluation_metrics(
    detections: &[Point2D],
    ground_truth: &[Point2D],
    association: &Association,
) -> EvaluationMetrics {
    let stats = detection_stats(association);
    let tp = stats.true_positives as f64;

    let ratio = |den: usize| if den > 0 { tp / den as f64 } else { 0.0 };
    let precision = ratio(stats.true_positives + stats.false_positives);
    let recall = ratio(stats.true_positives + stats.false_negatives);

    let rmse = if association.matches.is_empty() {
        None
    } else {
        let sq: f64 = association
            .matches
            .iter()
            .map(|m| {
                let d = detections[m.d_idx];
                let r = ground_truth[m.r_idx];
                (d[0] - r[0]).powi(2) + (d[1] - r[1]).powi(2)
            })
            .sum();
        Some((sq / (2.0 * tp)).sqrt())
    };

    EvaluationMetrics {
        precision,
        recall,
        rmse,
        stats,
    }
}

pub(crate) fn check_max_distance(max_distance: f64) -> Result<()> {
    if !(max_distance.is_finite() && max_distance > 0.0) {
        return Err(TrunkmapError::invalid(
            "max_distance",
            format!("{max_distance} must be a positive distance"),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_one_match_one_fp_one_fn() {
        let gt: Vec<Point2D> = vec![[100.0, 100.0], [500.0, 500.0]];
        let det: Vec<Point2D> = vec![[102.0, 101.0], [700.0, 700.0]];

        let assoc = associate(&det, &gt, 20.0, MatchStrategy::FirstClaim);
        assert_eq!(assoc.matches.len(), 1);
        assert_eq!((assoc.matches[0].d_idx, assoc.matches[0].r_idx), (0, 0));
        assert_eq!(assoc.false_positives, vec![1]);
        assert_eq!(assoc.false_negatives, vec![1]);

        let m = evaluation_metrics(&det, &gt, &assoc);
        assert_relative_eq!(m.precision, 0.5);
        assert_relative_eq!(m.recall, 0.5);
        assert_relative_eq!(m.rmse.unwrap(), (2.5f64).sqrt());

        let pts = assoc.to_points(&det, &gt);
        assert_eq!(pts.matches, vec![([102.0, 101.0], [100.0, 100.0])]);
        assert_eq!(pts.false_positives, vec![[700.0, 700.0]]);
        assert_eq!(pts.false_negatives, vec![[500.0, 500.0]]);
    }

    #[test]
    fn test_rmse_over_flattened_axes() {
        let det: Vec<Point2D> = vec![[10.0, 10.0]];
        let gt: Vec<Point2D> = vec![[13.0, 14.0]];
        let assoc = associate(&det, &gt, 20.0, MatchStrategy::FirstClaim);
        let m = evaluation_metrics(&det, &gt, &assoc);
        assert_relative_eq!(m.rmse.unwrap(), 12.5f64.sqrt(), epsilon = 1e-12);
        assert_relative_eq!(m.rmse.unwrap(), 3.5355, epsilon = 1e-4);
    }

    #[test]
    fn test_empty_inputs_are_defined() {
        let assoc = associate(&[], &[], 20.0, MatchStrategy::FirstClaim);
        let m = evaluation_metrics(&[], &[], &assoc);
        assert_eq!(m.precision, 0.0);
        assert_eq!(m.recall, 0.0);
        assert!(m.rmse.is_none());

        let gt: Vec<Point2D> = vec![[1.0, 1.0]];
        let assoc = associate(&[], &gt, 20.0, MatchStrategy::GlobalGreedy);
        assert_eq!(assoc.false_negatives, vec![0]);
        let m = evaluation_metrics(&[], &gt, &assoc);
        assert_eq!((m.precision, m.recall), (0.0, 0.0));
    }

    #[test]
    fn test_threshold_is_strict() {
        let det: Vec<Point2D> = vec![[0.0, 20.0]];
        let gt: Vec<Point2D> = vec![[0.0, 0.0]];
        let assoc = associate(&det, &gt, 20.0, MatchStrategy::FirstClaim);
        assert!(assoc.matches.is_empty());
        assert_eq!(assoc.false_positives, vec![0]);
    }

    #[test]
    fn test_ground_truth_claimed_once() {
        // both detections are nearest to the first point; the second one finds
        // it claimed and does not move on to the farther point
        let gt: Vec<Point2D> = vec![[0.0, 0.0], [15.0, 0.0]];
        let det: Vec<Point2D> = vec![[1.0, 0.0], [2.0, 0.0]];
        let assoc = associate(&det, &gt, 20.0, MatchStrategy::FirstClaim);
        let pairs: Vec<(usize, usize)> = assoc.matches.iter().map(|m| (m.d_idx, m.r_idx)).collect();
        assert_eq!(pairs, vec![(0, 0)]);
        assert_eq!(assoc.false_positives, vec![1]);
        assert_eq!(assoc.false_negatives, vec![1]);

        let m = evaluation_metrics(&det, &gt, &assoc);
        assert_relative_eq!(m.precision, 0.5);
        assert_relative_eq!(m.recall, 0.5);
    }

    #[test]
    fn test_many_identical_ground_truth_points() {
        let gt: Vec<Point2D> = vec![[100.0, 100.0]; 100];
        let det: Vec<Point2D> = vec![[101.0, 100.0]];
        for strategy in [MatchStrategy::FirstClaim, MatchStrategy::GlobalGreedy] {
            let assoc = associate(&det, &gt, 20.0, strategy);
            assert_eq!(assoc.matches.len(), 1);
            assert_eq!(assoc.matches[0].r_idx, 0);
            assert_eq!(assoc.false_negatives, (1..100).collect::<Vec<_>>());
        }

        // one detection per copy: every copy is claimed exactly once
        let det: Vec<Point2D> = (0..40).map(|k| [100.0 + k as f64 * 0.1, 100.0]).collect();
        let assoc = associate(&det, &gt[..40], 20.0, MatchStrategy::FirstClaim);
        let mut claimed: Vec<usize> = assoc.matches.iter().map(|m| m.r_idx).collect();
        claimed.sort_unstable();
        assert_eq!(claimed, (0..40).collect::<Vec<_>>());
        assert!(assoc.false_positives.is_empty());
    }

    #[test]
    fn test_first_claim_depends_on_order_global_greedy_does_not() {
        let gt: Vec<Point2D> = vec![[0.0, 0.0]];
        let det: Vec<Point2D> = vec![[5.0, 0.0], [1.0, 0.0]];

        let first = associate(&det, &gt, 10.0, MatchStrategy::FirstClaim);
        assert_eq!(first.matches[0].d_idx, 0);
        assert_eq!(first.false_positives, vec![1]);

        let greedy = associate(&det, &gt, 10.0, MatchStrategy::GlobalGreedy);
        assert_eq!(greedy.matches[0].d_idx, 1);
        assert_relative_eq!(greedy.matches[0].distance, 1.0);
        assert_eq!(greedy.false_positives, vec![0]);
    }

    #[test]
    fn test_duplicate_ground_truth_points_are_distinct() {
        let gt: Vec<Point2D> = vec![[50.0, 50.0], [50.0, 50.0]];
        let det: Vec<Point2D> = vec![[51.0, 50.0], [49.0, 50.0], [50.0, 52.0]];
        let assoc = associate(&det, &gt, 5.0, MatchStrategy::FirstClaim);
        let mut claimed: Vec<usize> = assoc.matches.iter().map(|m| m.r_idx).collect();
        claimed.sort_unstable();
        assert_eq!(claimed, vec![0, 1]);
        assert_eq!(assoc.false_positives, vec![2]);
        assert!(assoc.false_negatives.is_empty());
    }

    #[test]
    fn test_counts_are_consistent() {
        let gt: Vec<Point2D> = (0..10).map(|i| [i as f64 * 30.0, 0.0]).collect();
        let det: Vec<Point2D> = (0..7).map(|i| [i as f64 * 45.0 + 3.0, 2.0]).collect();
        for strategy in [MatchStrategy::FirstClaim, MatchStrategy::GlobalGreedy] {
            let assoc = associate(&det, &gt, 10.0, strategy);
            let s = detection_stats(&assoc);
            assert_eq!(s.true_positives + s.false_positives, det.len());
            assert_eq!(s.true_positives + s.false_negatives, gt.len());
        }
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("first-claim".parse::<MatchStrategy>().unwrap(), MatchStrategy::FirstClaim);
        assert_eq!("global_greedy".parse::<MatchStrategy>().unwrap(), MatchStrategy::GlobalGreedy);
        assert!("hungarian".parse::<MatchStrategy>().is_err());
        assert_eq!(MatchStrategy::GlobalGreedy.to_string(), "global-greedy");
    }

    #[test]
    fn test_check_max_distance() {
        assert!(check_max_distance(20.0).is_ok());
        assert!(check_max_distance(0.0).is_err());
        assert!(check_max_distance(-1.0).is_err());
    }
}
