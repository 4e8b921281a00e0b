//! Tree-trunk centers from tiled detector output.
//!
//! Usage :
//!   trunkmap split detections.json levels/
//!   trunkmap remap levels/ remapped/
//!   trunkmap centers remapped/ --reference-dir rasters/ -o centers.json
//!   trunkmap ground-truth gt/ --size 6000x4000 -o gt_centers.json
//!   trunkmap evaluate centers.json gt_centers.json --max-distance 20
//!
//! Settings can be read from a JSON file (`--config`); command-line flags
//! take precedence over it.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::{Args, Parser, Subcommand};

use trunkmap::{
    check_same_image_sizes, crop_name, detect_tree_centers, evaluate_files,
    ground_truth_tree_centers, logger, reference_shape, remap_level_dir,
    split_detections_by_level, tile_offsets, CenterExtraction, GridShape, HeatmapParams,
    LevelRange, MatchStrategy, PipelineConfig, Result, TrunkmapError,
};

// ==========================================================================
// CLI (clap)
// ==========================================================================

#[derive(Parser, Debug)]
#[command(
    name = "trunkmap",
    version,
    about = "Tree-trunk centers from tiled detections: remap, heatmap, DBSCAN, evaluation"
)]
struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// JSON settings file (detection, ground_truth, levels, evaluation)
    #[arg(long, value_name = "config.json", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Split a global detection JSON into one file per level
    Split {
        #[arg(value_name = "detections.json")]
        input: PathBuf,
        #[arg(value_name = "OUT_DIR")]
        output_dir: PathBuf,
    },
    /// Remap crop-local detections of every level file to level coordinates
    Remap {
        #[arg(value_name = "LEVEL_DIR")]
        level_dir: PathBuf,
        #[arg(value_name = "OUT_DIR")]
        output_dir: PathBuf,
    },
    /// Tree centers from remapped detections (bounding-box heatmap)
    Centers {
        #[arg(value_name = "REMAPPED_DIR")]
        input_dir: PathBuf,
        #[command(flatten)]
        grid: GridArgs,
        #[command(flatten)]
        heatmap: HeatmapArgs,
        /// Output tree-center file
        #[arg(long, short, default_value = "tree_centers.json")]
        output: PathBuf,
    },
    /// Tree centers from ground-truth point files (point heatmap)
    GroundTruth {
        /// Directory of per-level JSON pixel points or CSV world points
        #[arg(value_name = "GT_DIR")]
        input_dir: PathBuf,
        /// GeoTIFFs used to convert CSV world points (default: GT_DIR)
        #[arg(long, value_name = "DIR")]
        raster_dir: Option<PathBuf>,
        #[command(flatten)]
        grid: GridArgs,
        #[command(flatten)]
        heatmap: HeatmapArgs,
        /// Side of the square marked around each point (pixels)
        #[arg(long)]
        point_size: Option<usize>,
        /// Output tree-center file
        #[arg(long, short, default_value = "ground_truth_centers.json")]
        output: PathBuf,
    },
    /// Match tree centers against ground truth: precision, recall, RMSE
    Evaluate {
        #[arg(value_name = "centers.json")]
        detections: PathBuf,
        #[arg(value_name = "ground_truth.json")]
        ground_truth: PathBuf,
        /// Maximum match distance (pixels, exclusive)
        #[arg(long)]
        max_distance: Option<f64>,
        /// first-claim or global-greedy
        #[arg(long, value_parser = parse_strategy)]
        strategy: Option<MatchStrategy>,
        /// Write the evaluation report as JSON
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Check that all images of the given directories share one size
    CheckSizes {
        #[arg(value_name = "DIR", num_args = 1.., required = true)]
        dirs: Vec<PathBuf>,
    },
    /// List the crop names of a level tiled into fixed-size crops
    Tiles {
        /// Level base name
        base: String,
        /// Level size as WIDTHxHEIGHT
        #[arg(long, value_parser = parse_size)]
        size: (u32, u32),
        #[arg(long, default_value_t = 640)]
        crop_size: u32,
        #[arg(long, default_value_t = 100)]
        overlap: u32,
        #[arg(long, default_value = "png")]
        ext: String,
    },
}

/// Where the heatmap shape comes from.
#[derive(Args, Debug)]
struct GridArgs {
    /// Take the level size from the first image of this directory
    #[arg(long, value_name = "DIR", conflicts_with = "size")]
    reference_dir: Option<PathBuf>,
    /// Level size as WIDTHxHEIGHT
    #[arg(long, value_parser = parse_size)]
    size: Option<(u32, u32)>,
    /// Lowest level used (inclusive)
    #[arg(long)]
    min_level: Option<i64>,
    /// Highest level used (inclusive)
    #[arg(long)]
    max_level: Option<i64>,
}

/// Overrides of the heatmap settings.
#[derive(Args, Debug)]
struct HeatmapArgs {
    /// Cells below max * min_percentage are dropped
    #[arg(long)]
    min_percentage: Option<f64>,
    /// DBSCAN radius (pixels)
    #[arg(long)]
    eps: Option<f64>,
    /// DBSCAN core-point threshold
    #[arg(long)]
    min_samples: Option<usize>,
}

impl HeatmapArgs {
    fn apply(&self, params: &mut HeatmapParams) {
        if let Some(p) = self.min_percentage {
            params.min_percentage = p;
        }
        if let Some(e) = self.eps {
            params.eps = e;
        }
        if let Some(m) = self.min_samples {
            params.min_samples = m;
        }
    }
}

impl GridArgs {
    fn shape(&self) -> Result<GridShape> {
        match (&self.reference_dir, self.size) {
            (Some(dir), _) => reference_shape(dir),
            (None, Some((w, h))) => Ok(GridShape::from_image_size(w, h)),
            (None, None) => Err(TrunkmapError::InvalidParameter {
                name: "size",
                reason: "either --reference-dir or --size is required".into(),
            }),
        }
    }

    fn levels(&self, configured: LevelRange) -> LevelRange {
        LevelRange::new(
            self.min_level.or(configured.min),
            self.max_level.or(configured.max),
        )
    }
}

fn parse_size(s: &str) -> std::result::Result<(u32, u32), String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{s}'"))?;
    let w: u32 = w.trim().parse().map_err(|e| format!("width: {e}"))?;
    let h: u32 = h.trim().parse().map_err(|e| format!("height: {e}"))?;
    if w == 0 || h == 0 {
        return Err("size must be non-zero".into());
    }
    Ok((w, h))
}

fn parse_strategy(s: &str) -> std::result::Result<MatchStrategy, String> {
    s.parse().map_err(|e: TrunkmapError| e.to_string())
}

// ==========================================================================
// Commands
// ==========================================================================

fn print_centers(extraction: &CenterExtraction, output: &Path, elapsed: f64) {
    println!(
        "   ✓ {} clusters from {} cells in {:.2}s",
        extraction.centers.len(),
        extraction.clusters.len(),
        elapsed
    );
    for c in extraction.centers.iter().take(10) {
        println!("   {:>8} {:>8}", c.x, c.y);
    }
    if extraction.centers.len() > 10 {
        println!("   ... {} more", extraction.centers.len() - 10);
    }
    println!("   Export → '{}'", output.display());
}

fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => {
            log::info!("settings from {}", path.display());
            PipelineConfig::load_json(path)?
        }
        None => PipelineConfig::default(),
    };

    match cli.command {
        Command::Split { input, output_dir } => {
            let written = split_detections_by_level(&input, &output_dir)?;
            println!("{} level files written to '{}'", written.len(), output_dir.display());
        }
        Command::Remap {
            level_dir,
            output_dir,
        } => {
            let summary = remap_level_dir(&level_dir, &output_dir)?;
            println!(
                "{} detections remapped in {} files ({} skipped)",
                summary.detections,
                summary.written.len(),
                summary.skipped.len()
            );
            for (path, reason) in &summary.skipped {
                println!("   skipped '{}': {}", path.display(), reason);
            }
        }
        Command::Centers {
            input_dir,
            grid,
            heatmap,
            output,
        } => {
            let shape = grid.shape()?;
            let levels = grid.levels(config.levels);
            let mut params = config.detection;
            heatmap.apply(&mut params);
            println!(
                "Heatmap {}x{}  min_percentage={:.3}  eps={:.1}  min_samples={}",
                shape.ncol, shape.nrow, params.min_percentage, params.eps, params.min_samples
            );
            let t0 = Instant::now();
            let extraction =
                detect_tree_centers(&input_dir, shape, &params, &levels, Some(output.as_path()))?;
            print_centers(&extraction, &output, t0.elapsed().as_secs_f64());
        }
        Command::GroundTruth {
            input_dir,
            raster_dir,
            grid,
            heatmap,
            point_size,
            output,
        } => {
            let shape = grid.shape()?;
            let levels = grid.levels(config.levels);
            let mut params = config.ground_truth;
            heatmap.apply(&mut params);
            if let Some(ps) = point_size {
                params.point_size = ps;
            }
            println!(
                "Heatmap {}x{}  point_size={}  min_percentage={:.3}  eps={:.1}  min_samples={}",
                shape.ncol,
                shape.nrow,
                params.point_size,
                params.min_percentage,
                params.eps,
                params.min_samples
            );
            let t0 = Instant::now();
            let extraction = ground_truth_tree_centers(
                &input_dir,
                raster_dir.as_deref(),
                shape,
                &params,
                &levels,
                Some(output.as_path()),
            )?;
            print_centers(&extraction, &output, t0.elapsed().as_secs_f64());
        }
        Command::Evaluate {
            detections,
            ground_truth,
            max_distance,
            strategy,
            output,
        } => {
            let mut params = config.evaluation;
            if let Some(d) = max_distance {
                params.max_distance = d;
            }
            if let Some(s) = strategy {
                params.strategy = s;
            }
            let report = evaluate_files(&detections, &ground_truth, &params, output.as_deref())?;
            let m = &report.metrics;
            println!(
                "Matching ({}, max_distance={}) : {} detections, {} ground truth",
                report.strategy, report.max_distance, report.detections, report.ground_truth
            );
            println!(
                "   TP={}  FP={}  FN={}",
                m.stats.true_positives, m.stats.false_positives, m.stats.false_negatives
            );
            println!("   Precision : {:.4}", m.precision);
            println!("   Recall    : {:.4}", m.recall);
            match m.rmse {
                Some(rmse) => println!("   RMSE      : {rmse:.4}"),
                None => println!("   RMSE      : n/a (no match)"),
            }
            if let Some(path) = output {
                println!("   Export → '{}'", path.display());
            }
        }
        Command::CheckSizes { dirs } => match check_same_image_sizes(dirs.as_slice())? {
            Some((w, h)) => println!("All images are {w}x{h}"),
            None => println!("No image found"),
        },
        Command::Tiles {
            base,
            size: (width, height),
            crop_size,
            overlap,
            ext,
        } => {
            for (x, y) in tile_offsets(width, height, crop_size, overlap)? {
                println!("{}", crop_name(&base, x, y, &ext));
            }
        }
    }
    Ok(())
}

// ==========================================================================
// Main
// ==========================================================================

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = logger::level_from_flags(cli.verbose, cli.quiet);
    if let Err(e) = logger::init_with_level(level) {
        eprintln!("logger: {e}");
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
