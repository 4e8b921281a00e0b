//! Tile registry and coordinate remapping.
//!
//! Detector output is crop-local. The registry groups detections by the level
//! they were cut from and records each crop's offset; remapping then moves
//! every box into level (orthomosaic) pixel coordinates.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::detection::{Detection, TileOffset};
use crate::error::Result;
use crate::io::{self, file_name_str, file_stem_str};

/// Detections of one level together with the offsets of their crops.
#[derive(Debug, Clone, Default)]
pub struct LevelTiles {
    pub detections: Vec<Detection>,
    offsets: BTreeMap<String, TileOffset>,
}

impl LevelTiles {
    pub fn offset(&self, crop: &str) -> Option<&TileOffset> {
        self.offsets.get(crop)
    }

    pub fn crop_count(&self) -> usize {
        self.offsets.len()
    }
}

/// Per-level grouping of crop-local detections.
#[derive(Debug, Clone, Default)]
pub struct TileRegistry {
    levels: BTreeMap<String, LevelTiles>,
}

impl TileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from raw detector output. Fails on the first crop
    /// name that does not carry offsets.
    pub fn from_detections(detections: impl IntoIterator<Item = Detection>) -> Result<Self> {
        let mut registry = Self::new();
        for d in detections {
            registry.insert(d)?;
        }
        Ok(registry)
    }

    pub fn insert(&mut self, detection: Detection) -> Result<()> {
        let tile = TileOffset::parse(&detection.image)?;
        let level = self.levels.entry(tile.base.clone()).or_default();
        level.offsets.entry(tile.crop.clone()).or_insert(tile);
        level.detections.push(detection);
        Ok(())
    }

    /// Levels in name order.
    pub fn levels(&self) -> impl Iterator<Item = (&str, &LevelTiles)> {
        self.levels.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn level(&self, base: &str) -> Option<&LevelTiles> {
        self.levels.get(base)
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

/// Move a crop-local detection into level coordinates. Box size, confidence
/// and class pass through; no clamping is applied.
pub fn remap_detection(detection: &Detection, offset: &TileOffset, level: &str) -> Detection {
    Detection {
        image: level.to_string(),
        original_crop: Some(detection.image.clone()),
        x_center: detection.x_center + offset.x as f64,
        y_center: detection.y_center + offset.y as f64,
        width: detection.width,
        height: detection.height,
        confidence: detection.confidence,
        class_id: detection.class_id,
    }
}

/// Remap a list of crop-local detections belonging to `level`.
pub fn remap_level(level: &str, detections: &[Detection]) -> Result<Vec<Detection>> {
    detections
        .iter()
        .map(|d| TileOffset::parse(&d.image).map(|t| remap_detection(d, &t, level)))
        .collect()
}

/// Split a global detector output into one `<level>.json` per level under
/// `output_dir`. Returns the written paths in level order.
pub fn split_detections_by_level(
    global_json: impl AsRef<Path>,
    output_dir: impl AsRef<Path>,
) -> Result<Vec<PathBuf>> {
    let global_json = global_json.as_ref();
    let output_dir = output_dir.as_ref();
    let detections = io::read_detections(global_json)?;
    log::info!(
        "{}: {} detections to split",
        global_json.display(),
        detections.len()
    );

    let registry = TileRegistry::from_detections(detections)?;
    let mut written = Vec::with_capacity(registry.len());
    for (base, level) in registry.levels() {
        let path = output_dir.join(format!("{base}.json"));
        io::write_json_pretty(&path, &level.detections)?;
        log::debug!(
            "{}: {} detections from {} crops",
            path.display(),
            level.detections.len(),
            level.crop_count()
        );
        written.push(path);
    }
    log::info!("split into {} level files", written.len());
    Ok(written)
}

/// Outcome of a directory remap.
#[derive(Debug, Clone, Default)]
pub struct RemapSummary {
    pub written: Vec<PathBuf>,
    /// Files that could not be read, with the reason.
    pub skipped: Vec<(PathBuf, String)>,
    pub detections: usize,
}

/// Remap every level JSON in `level_dir` into `output_dir` (same file names).
///
/// Unreadable files are logged and skipped; a crop name without offsets
/// aborts the run since no level coordinate can be derived for it.
pub fn remap_level_dir(
    level_dir: impl AsRef<Path>,
    output_dir: impl AsRef<Path>,
) -> Result<RemapSummary> {
    let output_dir = output_dir.as_ref();
    let files = io::list_files(level_dir, &["json"])?;
    let mut summary = RemapSummary::default();

    for path in files {
        let detections = match io::read_detections(&path) {
            Ok(d) => d,
            Err(e) => {
                log::warn!("skipping {}: {e}", path.display());
                summary.skipped.push((path, e.to_string()));
                continue;
            }
        };
        let level = file_stem_str(&path).to_string();
        let remapped = remap_level(&level, &detections)?;

        let out = output_dir.join(file_name_str(&path));
        io::write_json_pretty(&out, &remapped)?;
        log::debug!("{}: {} detections remapped", out.display(), remapped.len());
        summary.detections += remapped.len();
        summary.written.push(out);
    }

    if summary.written.is_empty() && !summary.skipped.is_empty() {
        log::warn!("no level file could be remapped");
    }
    log::info!(
        "remapped {} detections in {} files ({} skipped)",
        summary.detections,
        summary.written.len(),
        summary.skipped.len()
    );
    Ok(summary)
}

/// Check a remapped level against the level size: boxes whose center falls
/// outside `width × height` indicate a tiling problem upstream.
pub fn out_of_bounds(detections: &[Detection], width: u32, height: u32) -> Vec<&Detection> {
    detections
        .iter()
        .filter(|d| {
            d.x_center < 0.0
                || d.y_center < 0.0
                || d.x_center >= width as f64
                || d.y_center >= height as f64
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TrunkmapError;
    use std::fs;

    fn det(image: &str, x: f64, y: f64) -> Detection {
        Detection {
            image: image.into(),
            original_crop: None,
            x_center: x,
            y_center: y,
            width: 12.0,
            height: 8.0,
            confidence: 0.8,
            class_id: 0,
        }
    }

    #[test]
    fn test_remap_adds_crop_offset() {
        let d = det("base_10_20.png", 5.0, 5.0);
        let out = remap_level("base", &[d]).unwrap();
        assert_eq!(out.len(), 1);
        let r = &out[0];
        assert_eq!((r.x_center, r.y_center), (15.0, 25.0));
        assert_eq!((r.width, r.height), (12.0, 8.0));
        assert_eq!(r.confidence, 0.8);
        assert_eq!(r.image, "base");
        assert_eq!(r.original_crop.as_deref(), Some("base_10_20.png"));
    }

    #[test]
    fn test_remap_rejects_malformed_crop_name() {
        let err = remap_level("base", &[det("base_10.png", 1.0, 1.0)]).unwrap_err();
        assert!(matches!(err, TrunkmapError::MalformedCropName { .. }));
    }

    #[test]
    fn test_registry_groups_by_level() {
        let registry = TileRegistry::from_detections(vec![
            det("P1_100_rgb_0_0.png", 1.0, 1.0),
            det("P1_100_rgb_540_0.png", 2.0, 2.0),
            det("P1_101_rgb_0_540.png", 3.0, 3.0),
            det("P1_100_rgb_540_0.png", 4.0, 4.0),
        ])
        .unwrap();

        assert_eq!(registry.len(), 2);
        let names: Vec<&str> = registry.levels().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["P1_100_rgb", "P1_101_rgb"]);

        let level = registry.level("P1_100_rgb").unwrap();
        assert_eq!(level.detections.len(), 3);
        assert_eq!(level.crop_count(), 2);
        let offset = level.offset("P1_100_rgb_540_0.png").unwrap();
        assert_eq!((offset.x, offset.y), (540, 0));
        assert!(registry.level("missing").is_none());
    }

    #[test]
    fn test_out_of_bounds() {
        let dets = vec![det("a", 10.0, 10.0), det("b", 700.0, 10.0), det("c", -1.0, 3.0)];
        let bad = out_of_bounds(&dets, 640, 640);
        assert_eq!(bad.len(), 2);
    }

    #[test]
    fn test_split_then_remap_directory() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("detections.json");
        io::write_json_pretty(
            &global,
            &vec![
                det("P2_5_rgb_0_0.png", 10.0, 10.0),
                det("P2_5_rgb_100_200.png", 1.0, 2.0),
                det("P2_6_rgb_50_50.png", 0.0, 0.0),
            ],
        )
        .unwrap();

        let level_dir = dir.path().join("levels");
        let written = split_detections_by_level(&global, &level_dir).unwrap();
        assert_eq!(written.len(), 2);
        assert!(level_dir.join("P2_5_rgb.json").is_file());

        // a corrupt file is skipped, not fatal
        fs::write(level_dir.join("P2_7_rgb.json"), "{ not json").unwrap();

        let out_dir = dir.path().join("remapped");
        let summary = remap_level_dir(&level_dir, &out_dir).unwrap();
        assert_eq!(summary.written.len(), 2);
        assert_eq!(summary.skipped.len(), 1);
        assert_eq!(summary.detections, 3);

        let level5 = io::read_detections(out_dir.join("P2_5_rgb.json")).unwrap();
        assert_eq!(level5[1].image, "P2_5_rgb");
        assert_eq!((level5[1].x_center, level5[1].y_center), (101.0, 202.0));
        assert_eq!(level5[1].original_crop.as_deref(), Some("P2_5_rgb_100_200.png"));
    }
}
