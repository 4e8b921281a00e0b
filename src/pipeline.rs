//! End-to-end runs: level files → heatmap → tree centers, and evaluation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::centers::{cluster_centers, TreeCenter};
use crate::clustering::{extract_clusters, ClusterSet, DbscanParams};
use crate::error::{Result, TrunkmapError};
use crate::geotiff::GeoTransform;
use crate::heatmap::{check_min_percentage, filter_heatmap, HeatmapBuilder, PixelPoint};
use crate::io::{self, file_name_str, file_stem_str};
use crate::levels::LevelRange;
use crate::matching::{
    associate, check_max_distance, evaluation_metrics, AssociationPoints, EvaluationMetrics,
    MatchStrategy, Point2D,
};
use crate::raster::{CoverageGrid, GridShape};
use crate::remap::out_of_bounds;

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Heatmap → centers parameters.
///
/// Defaults are those of the detection run: `point_size` = 3,
/// `min_percentage` = 0.105, `eps` = 50, `min_samples` = 200.
/// `point_size` only matters for point input (ground truth); detections are
/// rasterized with their own boxes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeatmapParams {
    /// Side of the square marked around each point (pixels).
    pub point_size: usize,
    /// Cells below `max * min_percentage` are dropped before clustering.
    pub min_percentage: f64,
    /// DBSCAN neighborhood radius (pixels).
    pub eps: f64,
    /// DBSCAN core-point threshold, the point itself included.
    pub min_samples: usize,
}

impl Default for HeatmapParams {
    fn default() -> Self {
        Self {
            point_size: 3,
            min_percentage: 0.105,
            eps: 50.0,
            min_samples: 200,
        }
    }
}

impl HeatmapParams {
    /// Defaults of the ground-truth run (`point_size` = 20).
    pub fn ground_truth() -> Self {
        Self {
            point_size: 20,
            ..Self::default()
        }
    }

    pub fn dbscan(&self) -> DbscanParams {
        DbscanParams {
            eps: self.eps,
            min_samples: self.min_samples,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.point_size == 0 {
            return Err(TrunkmapError::invalid("point_size", "must be at least 1"));
        }
        check_min_percentage(self.min_percentage)?;
        self.dbscan().validate()
    }
}

/// Evaluation parameters: `max_distance` = 20 and first-claim matching by default.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalParams {
    pub max_distance: f64,
    pub strategy: MatchStrategy,
}

impl Default for EvalParams {
    fn default() -> Self {
        Self {
            max_distance: 20.0,
            strategy: MatchStrategy::FirstClaim,
        }
    }
}

impl EvalParams {
    pub fn validate(&self) -> Result<()> {
        check_max_distance(self.max_distance)
    }
}

/// Settings file for the command line tool. Every section is optional.
///
/// ```json
/// {
///   "detection": { "min_percentage": 0.105, "eps": 50, "min_samples": 200 },
///   "ground_truth": { "point_size": 20 },
///   "levels": { "min": 100, "max": 250 },
///   "evaluation": { "max_distance": 20, "strategy": "first_claim" }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub detection: HeatmapParams,
    pub ground_truth: HeatmapParams,
    pub levels: LevelRange,
    pub evaluation: EvalParams,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            detection: HeatmapParams::default(),
            ground_truth: HeatmapParams::ground_truth(),
            levels: LevelRange::default(),
            evaluation: EvalParams::default(),
        }
    }
}

impl PipelineConfig {
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = io::read_json(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        io::write_json_pretty(path, self)
    }

    pub fn validate(&self) -> Result<()> {
        self.detection.validate()?;
        self.ground_truth.validate()?;
        self.evaluation.validate()
    }
}

// ---------------------------------------------------------------------------
// Heatmap → centers
// ---------------------------------------------------------------------------

/// Output of [`centers_from_heatmap`].
#[derive(Debug, Clone)]
pub struct CenterExtraction {
    /// Heatmap after the density filter.
    pub filtered: CoverageGrid,
    /// Non-noise cells of `filtered` with their cluster labels.
    pub clusters: ClusterSet,
    /// One center per cluster, sorted by (x, y).
    pub centers: Vec<TreeCenter>,
}

/// Filter, cluster and reduce a heatmap to tree centers.
pub fn centers_from_heatmap(grid: &CoverageGrid, params: &HeatmapParams) -> Result<CenterExtraction> {
    params.validate()?;
    let filtered = filter_heatmap(grid, params.min_percentage);
    log::debug!(
        "filter at {:.3} of max {}: {} of {} cells kept",
        params.min_percentage,
        grid.max(),
        filtered.count_nonzero(),
        grid.count_nonzero()
    );
    let clusters = extract_clusters(&filtered, &params.dbscan());
    let centers = cluster_centers(&filtered, &clusters);
    Ok(CenterExtraction {
        filtered,
        clusters,
        centers,
    })
}

// ---------------------------------------------------------------------------
// Detection heatmap
// ---------------------------------------------------------------------------

/// Accumulate every remapped level JSON in `dir` in bounding-box mode.
///
/// Files outside `levels` are ignored. A file that cannot be read is logged
/// and skipped; a missing directory aborts.
pub fn detection_heatmap(
    dir: impl AsRef<Path>,
    shape: GridShape,
    levels: &LevelRange,
) -> Result<CoverageGrid> {
    let dir = dir.as_ref();
    let mut builder = HeatmapBuilder::new(shape);
    let mut skipped = 0usize;

    for path in io::list_files(dir, &["json"])? {
        if !levels.admits(file_name_str(&path)) {
            continue;
        }
        let detections = match io::read_detections(&path) {
            Ok(d) => d,
            Err(e) => {
                log::warn!("skipping {}: {e}", path.display());
                skipped += 1;
                continue;
            }
        };
        let outside = out_of_bounds(&detections, shape.ncol as u32, shape.nrow as u32);
        if !outside.is_empty() {
            log::debug!(
                "{}: {} detections centered outside the {}x{} grid",
                path.display(),
                outside.len(),
                shape.ncol,
                shape.nrow
            );
        }
        builder.add_boxes(&detections);
    }

    log::info!(
        "detection heatmap: {} levels from {} ({} skipped), max coverage {}",
        builder.levels(),
        dir.display(),
        skipped,
        builder.grid().max()
    );
    Ok(builder.finish())
}

/// Detection heatmap of `dir` reduced to tree centers, optionally written to
/// `output` as `[[x, y], ...]`.
pub fn detect_tree_centers(
    dir: impl AsRef<Path>,
    shape: GridShape,
    params: &HeatmapParams,
    levels: &LevelRange,
    output: Option<&Path>,
) -> Result<CenterExtraction> {
    params.validate()?;
    let grid = detection_heatmap(dir, shape, levels)?;
    let extraction = centers_from_heatmap(&grid, params)?;
    if let Some(path) = output {
        io::write_centers(path, &extraction.centers)?;
        log::info!("{} tree centers written to {}", extraction.centers.len(), path.display());
    }
    Ok(extraction)
}

// ---------------------------------------------------------------------------
// Ground-truth heatmap
// ---------------------------------------------------------------------------

/// Pixel points of one ground-truth level file.
///
/// JSON files hold pixel coordinates. CSV files hold world coordinates and
/// are converted with the GeoTIFF of the same stem, looked up in `raster_dir`.
pub fn read_ground_truth_level(path: &Path, raster_dir: &Path) -> Result<Vec<PixelPoint>> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    let points: Vec<[f64; 2]> = if ext == "csv" {
        let raster = level_raster(raster_dir, file_stem_str(path))?;
        let transform = GeoTransform::from_tiff(&raster)?;
        io::read_world_points_csv(path)?
            .iter()
            .map(|p| {
                let (x, y) = transform.pixel_position(p[0], p[1]);
                [x, y]
            })
            .collect()
    } else {
        io::read_points(path)?
    };
    Ok(finite_pixels(path, &points))
}

/// Pixels of the finite positions; NaN or infinite ones are dropped.
fn finite_pixels(path: &Path, points: &[[f64; 2]]) -> Vec<PixelPoint> {
    let pixels: Vec<PixelPoint> = points
        .iter()
        .filter(|p| p[0].is_finite() && p[1].is_finite())
        .map(|p| PixelPoint::from_f64(p[0], p[1]))
        .collect();
    if pixels.len() < points.len() {
        log::warn!(
            "{}: {} non-finite points dropped",
            path.display(),
            points.len() - pixels.len()
        );
    }
    pixels
}

fn level_raster(raster_dir: &Path, stem: &str) -> Result<PathBuf> {
    ["tif", "tiff"]
        .iter()
        .map(|ext| raster_dir.join(format!("{stem}.{ext}")))
        .find(|p| p.is_file())
        .ok_or_else(|| {
            TrunkmapError::NoReferenceImage(raster_dir.join(format!("{stem}.tif")))
        })
}

/// Accumulate every ground-truth level file (JSON or CSV) in `dir` in
/// binary-rectangle mode with `point_size` windows.
///
/// `raster_dir` holds the GeoTIFFs used for CSV files and defaults to `dir`.
pub fn ground_truth_heatmap(
    dir: impl AsRef<Path>,
    raster_dir: Option<&Path>,
    shape: GridShape,
    point_size: usize,
    levels: &LevelRange,
) -> Result<CoverageGrid> {
    let dir = dir.as_ref();
    let raster_dir = raster_dir.unwrap_or(dir);
    let mut builder = HeatmapBuilder::new(shape);
    let mut skipped = 0usize;

    for path in io::list_files(dir, &["json", "csv"])? {
        if !levels.admits(file_name_str(&path)) {
            continue;
        }
        match read_ground_truth_level(&path, raster_dir) {
            Ok(points) => builder.add_points(&points, point_size),
            Err(e) => {
                log::warn!("skipping {}: {e}", path.display());
                skipped += 1;
            }
        }
    }

    log::info!(
        "ground-truth heatmap: {} levels from {} ({} skipped), max coverage {}",
        builder.levels(),
        dir.display(),
        skipped,
        builder.grid().max()
    );
    Ok(builder.finish())
}

/// Ground-truth heatmap of `dir` reduced to tree centers.
pub fn ground_truth_tree_centers(
    dir: impl AsRef<Path>,
    raster_dir: Option<&Path>,
    shape: GridShape,
    params: &HeatmapParams,
    levels: &LevelRange,
    output: Option<&Path>,
) -> Result<CenterExtraction> {
    params.validate()?;
    let grid = ground_truth_heatmap(dir, raster_dir, shape, params.point_size, levels)?;
    let extraction = centers_from_heatmap(&grid, params)?;
    if let Some(path) = output {
        io::write_centers(path, &extraction.centers)?;
        log::info!(
            "{} ground-truth centers written to {}",
            extraction.centers.len(),
            path.display()
        );
    }
    Ok(extraction)
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluation of one set of detected centers against ground truth.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub strategy: MatchStrategy,
    pub max_distance: f64,
    pub detections: usize,
    pub ground_truth: usize,
    #[serde(flatten)]
    pub metrics: EvaluationMetrics,
    pub association: AssociationPoints,
}

pub fn evaluate_points(
    detections: &[Point2D],
    ground_truth: &[Point2D],
    params: &EvalParams,
) -> Result<EvaluationReport> {
    params.validate()?;
    let association = associate(detections, ground_truth, params.max_distance, params.strategy);
    let metrics = evaluation_metrics(detections, ground_truth, &association);
    log::info!(
        "{}: TP={} FP={} FN={} precision={:.3} recall={:.3}",
        params.strategy,
        metrics.stats.true_positives,
        metrics.stats.false_positives,
        metrics.stats.false_negatives,
        metrics.precision,
        metrics.recall
    );
    Ok(EvaluationReport {
        strategy: params.strategy,
        max_distance: params.max_distance,
        detections: detections.len(),
        ground_truth: ground_truth.len(),
        metrics,
        association: association.to_points(detections, ground_truth),
    })
}

/// Evaluate two tree-center files, optionally writing the report as JSON.
pub fn evaluate_files(
    detections_path: impl AsRef<Path>,
    ground_truth_path: impl AsRef<Path>,
    params: &EvalParams,
    output: Option<&Path>,
) -> Result<EvaluationReport> {
    let detections = io::read_points(detections_path)?;
    let ground_truth = io::read_points(ground_truth_path)?;
    let report = evaluate_points(&detections, &ground_truth, params)?;
    if let Some(path) = output {
        io::write_json_pretty(path, &report)?;
    }
    Ok(report)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::Detection;
    use approx::assert_relative_eq;

    fn det(image: &str, x: f64, y: f64, size: f64) -> Detection {
        Detection {
            image: image.into(),
            original_crop: None,
            x_center: x,
            y_center: y,
            width: size,
            height: size,
            confidence: 0.8,
            class_id: 0,
        }
    }

    fn small_params() -> HeatmapParams {
        HeatmapParams {
            point_size: 5,
            min_percentage: 0.5,
            eps: 2.0,
            min_samples: 5,
        }
    }

    #[test]
    fn test_defaults() {
        let p = HeatmapParams::default();
        assert_eq!(p.min_samples, 200);
        assert_relative_eq!(p.min_percentage, 0.105);
        assert_eq!(HeatmapParams::ground_truth().point_size, 20);
        assert_relative_eq!(EvalParams::default().max_distance, 20.0);
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_params_validation() {
        let mut p = HeatmapParams::default();
        p.point_size = 0;
        assert!(p.validate().is_err());
        let mut p = HeatmapParams::default();
        p.min_percentage = 0.0;
        assert!(p.validate().is_err());
        let e = EvalParams {
            max_distance: -1.0,
            ..EvalParams::default()
        };
        assert!(e.validate().is_err());
    }

    #[test]
    fn test_config_partial_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "detection": { "eps": 30 }, "levels": { "min": 100 },
                 "evaluation": { "strategy": "global_greedy" } }"#,
        )
        .unwrap();
        let config = PipelineConfig::load_json(&path).unwrap();
        assert_relative_eq!(config.detection.eps, 30.0);
        assert_eq!(config.detection.min_samples, 200);
        assert_eq!(config.ground_truth.point_size, 20);
        assert_eq!(config.levels, LevelRange::new(Some(100), None));
        assert_eq!(config.evaluation.strategy, MatchStrategy::GlobalGreedy);

        config.write_json(dir.path().join("out.json")).unwrap();
        let again = PipelineConfig::load_json(dir.path().join("out.json")).unwrap();
        assert_eq!(again, config);
    }

    #[test]
    fn test_config_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "detection": { "min_samples": 0 } }"#).unwrap();
        assert!(matches!(
            PipelineConfig::load_json(&path),
            Err(TrunkmapError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_centers_from_empty_heatmap() {
        let grid = CoverageGrid::zeros(GridShape::new(16, 16));
        let out = centers_from_heatmap(&grid, &small_params()).unwrap();
        assert!(out.centers.is_empty());
        assert!(out.clusters.is_empty());
    }

    #[test]
    fn test_detection_heatmap_respects_levels_and_skips_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        let shape = GridShape::new(40, 40);
        for level in [100, 150, 200] {
            let name = format!("P1_{level}_rgb.json");
            io::write_json_pretty(dir.path().join(&name), &vec![det(&name, 10.0, 10.0, 4.0)])
                .unwrap();
        }
        std::fs::write(dir.path().join("P1_120_rgb.json"), "{ not json").unwrap();

        let all = detection_heatmap(dir.path(), shape, &LevelRange::default()).unwrap();
        assert_eq!(all.max(), 3);
        assert_eq!(all[(8, 8)], 3);
        assert_eq!(all[(12, 12)], 0);

        let some = detection_heatmap(dir.path(), shape, &LevelRange::new(Some(120), Some(200)))
            .unwrap();
        assert_eq!(some.max(), 2);
    }

    #[test]
    fn test_detection_heatmap_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let err = detection_heatmap(
            dir.path().join("nope"),
            GridShape::new(4, 4),
            &LevelRange::default(),
        )
        .unwrap_err();
        assert!(matches!(err, TrunkmapError::MissingDirectory(_)));
    }

    #[test]
    fn test_detect_tree_centers_two_trees() {
        let dir = tempfile::tempdir().unwrap();
        for level in 0..3 {
            let name = format!("P1_{level}_rgb.json");
            let dets = vec![
                det(&name, 10.0 + level as f64 * 0.5, 10.0, 6.0),
                det(&name, 30.0, 25.0, 6.0),
            ];
            io::write_json_pretty(dir.path().join(&name), &dets).unwrap();
        }
        let out_path = dir.path().join("out").join("centers.json");
        let out = detect_tree_centers(
            dir.path(),
            GridShape::new(50, 50),
            &small_params(),
            &LevelRange::default(),
            Some(out_path.as_path()),
        )
        .unwrap();

        assert_eq!(out.centers.len(), 2);
        let written = io::read_points(&out_path).unwrap();
        assert_eq!(written.len(), 2);
        // box cells 27..=32 x 22..=27, centroid truncated
        assert_eq!(written[1], [29.0, 24.0]);
    }

    #[test]
    fn test_ground_truth_heatmap_from_json_points() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("P1_100_gt.json"), "[[5, 5], [20, 20]]").unwrap();
        std::fs::write(dir.path().join("P1_110_gt.json"), r#"[{"x": 5.7, "y": 5.2}]"#).unwrap();
        let grid = ground_truth_heatmap(
            dir.path(),
            None,
            GridShape::new(30, 30),
            3,
            &LevelRange::default(),
        )
        .unwrap();
        assert_eq!(grid[(5, 5)], 2);
        assert_eq!(grid[(20, 20)], 1);
        assert_eq!(grid.max(), 2);
    }

    #[test]
    fn test_csv_without_raster_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("P1_100_gt.csv"), "x,y\n1.0,2.0\n").unwrap();
        let grid = ground_truth_heatmap(
            dir.path(),
            None,
            GridShape::new(10, 10),
            3,
            &LevelRange::default(),
        )
        .unwrap();
        assert_eq!(grid.max(), 0);
    }

    #[test]
    fn test_non_finite_points_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("P1_100_gt.csv");
        let points = [[f64::NAN, 2.0], [3.0, 4.0], [f64::INFINITY, 1.0]];
        assert_eq!(finite_pixels(&path, &points), vec![PixelPoint::new(3, 4)]);
    }

    #[test]
    fn test_evaluate_files_writes_report() {
        let dir = tempfile::tempdir().unwrap();
        let det_path = dir.path().join("det.json");
        let gt_path = dir.path().join("gt.json");
        std::fs::write(&det_path, "[[102, 101], [700, 700]]").unwrap();
        std::fs::write(&gt_path, r#"[{"x": 100, "y": 100}, {"x": 500, "y": 500}]"#).unwrap();
        let report_path = dir.path().join("report.json");

        let report =
            evaluate_files(&det_path, &gt_path, &EvalParams::default(), Some(report_path.as_path()))
                .unwrap();
        assert_relative_eq!(report.metrics.precision, 0.5);
        assert_relative_eq!(report.metrics.recall, 0.5);
        assert_eq!(report.association.false_positives, vec![[700.0, 700.0]]);

        let json: serde_json::Value = io::read_json(&report_path).unwrap();
        assert_eq!(json["true_positives"], 1);
        assert_eq!(json["strategy"], "first_claim");
        assert!(json["rmse"].as_f64().is_some());
    }
}
