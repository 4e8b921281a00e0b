//! Coverage heatmap: per-level accumulation and density filtering.
//!
//! Each level contributes at most +1 to any cell. Points or boxes of one level
//! are first marked into a [`LevelMask`] (marking twice is a no-op), then the
//! mask is added to the running [`CoverageGrid`]. Since level contributions
//! are summed, accumulating levels independently and merging the builders
//! gives the same grid as a sequential pass.

use serde::{Deserialize, Serialize};

use crate::detection::Detection;
use crate::error::{Result, TrunkmapError};
use crate::raster::{CoverageGrid, GridShape, LevelMask};

/// Integer pixel position: `x` = column, `y` = row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelPoint {
    pub x: i64,
    pub y: i64,
}

impl PixelPoint {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }

    /// Round a fractional position down to its pixel. Coordinates beyond the
    /// `i64` range saturate.
    pub fn from_f64(x: f64, y: f64) -> Self {
        Self::new(x.floor() as i64, y.floor() as i64)
    }
}

/// Mark a `point_size` neighborhood around every point.
///
/// The window spans `[p - point_size/2, p + point_size/2]` on both axes
/// (integer division), clamped to the grid.
pub fn point_mask(shape: GridShape, points: &[PixelPoint], point_size: usize) -> LevelMask {
    let half = (point_size / 2) as i64;
    let mut mask = LevelMask::new(shape);
    for p in points {
        mask.mark_window(
            p.y.saturating_sub(half),
            p.y.saturating_add(half).saturating_add(1),
            p.x.saturating_sub(half),
            p.x.saturating_add(half).saturating_add(1),
        );
    }
    mask
}

/// Rasterize every detection's box, clamped to the grid.
pub fn box_mask(shape: GridShape, detections: &[Detection]) -> LevelMask {
    let mut mask = LevelMask::new(shape);
    for d in detections {
        let (x0, y0, x1, y1) = d.pixel_box();
        mask.mark_window(y0, y1, x0, x1);
    }
    mask
}

/// Running accumulation over levels.
#[derive(Debug, Clone)]
pub struct HeatmapBuilder {
    grid: CoverageGrid,
    levels: usize,
}

impl HeatmapBuilder {
    pub fn new(shape: GridShape) -> Self {
        Self {
            grid: CoverageGrid::zeros(shape),
            levels: 0,
        }
    }

    pub fn shape(&self) -> GridShape {
        self.grid.shape()
    }

    /// Number of levels accumulated so far.
    pub fn levels(&self) -> usize {
        self.levels
    }

    pub fn grid(&self) -> &CoverageGrid {
        &self.grid
    }

    pub fn add_mask(&mut self, mask: &LevelMask) -> Result<()> {
        if mask.shape() != self.shape() {
            return Err(TrunkmapError::invalid(
                "mask",
                format!(
                    "shape {:?} does not match heatmap shape {:?}",
                    mask.shape(),
                    self.shape()
                ),
            ));
        }
        self.grid.add_mask(mask);
        self.levels += 1;
        Ok(())
    }

    /// Add one level of points (binary-rectangle mode).
    pub fn add_points(&mut self, points: &[PixelPoint], point_size: usize) {
        let mask = point_mask(self.shape(), points, point_size);
        self.grid.add_mask(&mask);
        self.levels += 1;
        log::trace!(
            "level {}: {} points cover {} cells",
            self.levels,
            points.len(),
            mask.count()
        );
    }

    /// Add one level of detector boxes (bounding-box mode).
    pub fn add_boxes(&mut self, detections: &[Detection]) {
        let mask = box_mask(self.shape(), detections);
        self.grid.add_mask(&mask);
        self.levels += 1;
        log::trace!(
            "level {}: {} boxes cover {} cells",
            self.levels,
            detections.len(),
            mask.count()
        );
    }

    /// Sum two partial accumulations of the same shape.
    pub fn merge(mut self, other: HeatmapBuilder) -> Result<Self> {
        if other.shape() != self.shape() {
            return Err(TrunkmapError::invalid(
                "heatmap",
                format!(
                    "cannot merge shape {:?} into {:?}",
                    other.shape(),
                    self.shape()
                ),
            ));
        }
        self.grid.add_grid(&other.grid);
        self.levels += other.levels;
        Ok(self)
    }

    pub fn finish(self) -> CoverageGrid {
        self.grid
    }
}

/// Zero every cell strictly below `max(grid) * min_percentage`.
///
/// An all-zero grid comes back unchanged.
pub fn filter_heatmap(grid: &CoverageGrid, min_percentage: f64) -> CoverageGrid {
    let threshold = grid.max() as f64 * min_percentage;
    grid.map(|v| if (v as f64) >= threshold { v } else { 0 })
}

pub(crate) fn check_min_percentage(min_percentage: f64) -> Result<()> {
    if !(min_percentage > 0.0 && min_percentage <= 1.0) {
        return Err(TrunkmapError::invalid(
            "min_percentage",
            format!("{min_percentage} is outside (0, 1]"),
        ));
    }
    Ok(())
}
