//! # trunkmap: tree-trunk centers from tiled detector output
//!
//! Detections made on fixed-size crops of orthomosaic levels are brought back
//! to level coordinates, accumulated into a coverage heatmap (at most +1 per
//! level and cell), density-filtered, clustered with DBSCAN and reduced to one
//! weighted centroid per tree.
//!
//! This crate provides:
//! - **Tiles & remapping**: [`TileOffset`], [`TileRegistry`], `remap_level`,
//!   `split_detections_by_level`, `remap_level_dir`, `tile_offsets`
//! - **Heatmap**: [`HeatmapBuilder`] (binary-rectangle and bounding-box modes),
//!   `filter_heatmap`
//! - **Clusters & centers**: `extract_clusters`, `cluster_centers`
//! - **Evaluation**: `associate`, `evaluation_metrics` (precision, recall, RMSE)
//! - **Pipeline**: `detect_tree_centers`, `ground_truth_tree_centers`,
//!   `evaluate_files`, configured through [`PipelineConfig`]

pub mod centers;
pub mod clustering;
pub mod detection;
pub mod error;
pub mod geotiff;
pub mod heatmap;
pub mod io;
pub mod levels;
pub mod logger;
pub mod matching;
pub mod pipeline;
pub mod raster;
pub mod remap;

pub use centers::{cluster_centers, TreeCenter};
pub use clustering::{dbscan, extract_clusters, ClusterSet, DbscanParams};
pub use detection::{crop_name, level_base, tile_offsets, Detection, TileOffset};
pub use error::{Result, TrunkmapError};
pub use geotiff::{check_same_image_sizes, image_size, reference_shape, GeoTransform};
pub use heatmap::{box_mask, filter_heatmap, point_mask, HeatmapBuilder, PixelPoint};
pub use levels::{level_number, LevelRange};
pub use matching::{
    associate, detection_stats, evaluation_metrics, Association, DetectionStats,
    EvaluationMetrics, MatchStrategy, MatchedPair, Point2D,
};
pub use pipeline::{
    centers_from_heatmap, detect_tree_centers, detection_heatmap, evaluate_files,
    evaluate_points, ground_truth_heatmap, ground_truth_tree_centers, CenterExtraction,
    EvalParams, EvaluationReport, HeatmapParams, PipelineConfig,
};
pub use raster::{CoverageGrid, GridShape, LevelMask};
pub use remap::{
    remap_detection, remap_level, remap_level_dir, split_detections_by_level, RemapSummary,
    TileRegistry,
};
