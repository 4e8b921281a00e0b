//! Detection records and the crop naming convention.
//!
//! A crop cut from a level at pixel offset `(x, y)` is named
//! `<base>_<x>_<y>.<ext>`. Every stage downstream of the detector relies on
//! this convention to recover the level and the offset of a crop, so both
//! directions (formatting and parsing) live here.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrunkmapError};

/// One bounding box produced by the detector.
///
/// Coordinates are crop-local as produced by the detector and global once
/// remapped; in the latter case `original_crop` names the crop it came from
/// and `image` is the level base name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_crop: Option<String>,
    pub x_center: f64,
    pub y_center: f64,
    pub width: f64,
    pub height: f64,
    pub confidence: f64,
    #[serde(rename = "class")]
    pub class_id: i64,
}

impl Detection {
    /// Axis-aligned box as `(x_min, y_min, x_max, y_max)`, truncated toward
    /// zero. `x_max`/`y_max` are exclusive.
    pub fn pixel_box(&self) -> (i64, i64, i64, i64) {
        let hw = self.width / 2.0;
        let hh = self.height / 2.0;
        (
            (self.x_center - hw) as i64,
            (self.y_center - hh) as i64,
            (self.x_center + hw) as i64,
            (self.y_center + hh) as i64,
        )
    }
}

/// Pixel offset of a crop inside its level.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileOffset {
    /// Crop file name, as referenced by detections.
    pub crop: String,
    /// Level base name (`<base>` in `<base>_<x>_<y>.<ext>`).
    pub base: String,
    pub x: u32,
    pub y: u32,
}

impl TileOffset {
    /// Parse a crop file name (directories are ignored).
    pub fn parse(crop: &str) -> Result<Self> {
        let malformed = |reason| TrunkmapError::MalformedCropName {
            name: crop.to_string(),
            reason,
        };

        let stem = crop_stem(crop);
        let mut parts = stem.rsplitn(3, '_');
        let y = parts.next().ok_or_else(|| malformed("empty name"))?;
        let x = parts
            .next()
            .ok_or_else(|| malformed("missing x offset token"))?;
        let base = match parts.next() {
            Some(b) if !b.is_empty() => b,
            _ => return Err(malformed("missing base name before offsets")),
        };

        let x = x
            .parse::<u32>()
            .map_err(|_| malformed("x offset is not a non-negative integer"))?;
        let y = y
            .parse::<u32>()
            .map_err(|_| malformed("y offset is not a non-negative integer"))?;

        Ok(Self {
            crop: file_name(crop).to_string(),
            base: base.to_string(),
            x,
            y,
        })
    }
}

/// Level base name of a crop: the stem without its two trailing tokens.
pub fn level_base(crop: &str) -> Result<String> {
    TileOffset::parse(crop).map(|t| t.base)
}

/// Format a crop file name. `ext` is given without the dot.
pub fn crop_name(base: &str, x: u32, y: u32, ext: &str) -> String {
    format!("{base}_{x}_{y}.{ext}")
}

/// Offsets of the crops tiling a `width × height` level.
///
/// Crops are `crop_size` square, stepping by `crop_size - overlap`; the last
/// row and column are pulled back so every crop stays inside the level.
/// Offsets are returned row-major (y outer, x inner) without duplicates.
pub fn tile_offsets(
    width: u32,
    height: u32,
    crop_size: u32,
    overlap: u32,
) -> Result<Vec<(u32, u32)>> {
    if crop_size == 0 {
        return Err(TrunkmapError::invalid("crop_size", "must be positive"));
    }
    if overlap >= crop_size {
        return Err(TrunkmapError::invalid(
            "overlap",
            format!("{overlap} must be smaller than crop_size {crop_size}"),
        ));
    }
    if width < crop_size || height < crop_size {
        return Err(TrunkmapError::invalid(
            "crop_size",
            format!("{crop_size} exceeds level size {width}x{height}"),
        ));
    }

    let stride = (crop_size - overlap) as usize;
    let xs = axis_offsets(width, crop_size, stride);
    let ys = axis_offsets(height, crop_size, stride);

    let mut out = Vec::with_capacity(xs.len() * ys.len());
    for &y in &ys {
        for &x in &xs {
            out.push((x, y));
        }
    }
    Ok(out)
}

fn axis_offsets(dim: u32, crop_size: u32, stride: usize) -> Vec<u32> {
    let last = dim - crop_size;
    let mut out: Vec<u32> = (0..dim).step_by(stride).map(|o| o.min(last)).collect();
    out.dedup();
    out
}

fn file_name(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
}

fn crop_stem(path: &str) -> &str {
    let name = file_name(path);
    match name.rfind('.') {
        Some(i) if i > 0 => &name[..i],
        _ => name,
    }
}
