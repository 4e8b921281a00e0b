//! Reference rasters: level size and GeoTIFF pixel geo-referencing.
//!
//! Only the affine part of geo-referencing is handled (ModelPixelScale +
//! ModelTiepoint tags, north-up). Points must already be expressed in the
//! raster's CRS.

use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::{Path, PathBuf};

use tiff::decoder::Decoder;
use tiff::tags::Tag;

use crate::error::{Result, TrunkmapError};
use crate::io;
use crate::raster::GridShape;

const IMAGE_EXTENSIONS: &[&str] = &["tif", "tiff", "png"];

/// North-up pixel ↔ world mapping of a GeoTIFF.
///
/// Pixel (row, col) covers world `x ∈ [x0 + col·res_x, x0 + (col+1)·res_x)`,
/// `y ∈ (y0 - (row+1)·res_y, y0 - row·res_y]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub origin_y: f64,
    pub res_x: f64,
    pub res_y: f64,
}

impl Default for GeoTransform {
    fn default() -> Self {
        Self {
            origin_x: 0.0,
            origin_y: 0.0,
            res_x: 1.0,
            res_y: 1.0,
        }
    }
}

impl GeoTransform {
    /// Fractional (col, row) of a world (x, y); its floor is the pixel
    /// containing it. Not clamped: points outside the raster map to
    /// out-of-range pixels.
    pub fn pixel_position(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.origin_x) / self.res_x,
            (self.origin_y - y) / self.res_y,
        )
    }

    /// Read ModelPixelScale (33550) and ModelTiepoint (33922) from a TIFF.
    pub fn from_tiff(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut decoder = Decoder::new(BufReader::new(File::open(path)?))?;
        let gt = geotransform_from_decoder(&mut decoder);
        log::debug!(
            "{}: res=({}, {}), origin=({:.2}, {:.2})",
            path.display(),
            gt.res_x,
            gt.res_y,
            gt.origin_x,
            gt.origin_y
        );
        Ok(gt)
    }
}

/// Missing or unreadable tags fall back to unit resolution and a (0, 0)
/// origin, with a warning.
fn geotransform_from_decoder<R: Read + Seek>(decoder: &mut Decoder<R>) -> GeoTransform {
    let mut gt = GeoTransform::default();
    let mut found_scale = false;
    let mut found_tiepoint = false;

    if let Ok(Some(scale_val)) = decoder.find_tag(Tag::ModelPixelScaleTag) {
        if let Ok(scale) = scale_val.into_f64_vec() {
            if scale.len() >= 2 && scale[0] > 0.0 && scale[1] > 0.0 {
                gt.res_x = scale[0];
                gt.res_y = scale[1];
                found_scale = true;
            }
        }
    }
    if let Ok(Some(tie_val)) = decoder.find_tag(Tag::ModelTiepointTag) {
        if let Ok(tie) = tie_val.into_f64_vec() {
            if tie.len() >= 6 {
                // raster (i, j) → world (x, y)
                gt.origin_x = tie[3] - tie[0] * gt.res_x;
                gt.origin_y = tie[4] + tie[1] * gt.res_y;
                found_tiepoint = true;
            }
        }
    }

    if !found_scale {
        log::warn!("ModelPixelScale tag (33550) missing, using resolution 1.0");
    }
    if !found_tiepoint {
        log::warn!("ModelTiepoint tag (33922) missing, using origin (0, 0)");
    }
    gt
}

/// (width, height) of a TIFF or PNG image, read from its header.
pub fn image_size(path: impl AsRef<Path>) -> Result<(u32, u32)> {
    let path = path.as_ref();
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    let reader = BufReader::new(File::open(path)?);
    match ext.as_str() {
        "png" => {
            let png = png::Decoder::new(reader).read_info()?;
            let info = png.info();
            Ok((info.width, info.height))
        }
        _ => {
            let mut decoder = Decoder::new(reader)?;
            Ok(decoder.dimensions()?)
        }
    }
}

/// Images (TIFF or PNG) directly under `dir`, sorted by name.
pub fn list_images(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    io::list_files(dir, IMAGE_EXTENSIONS)
}

/// Grid shape of the levels, taken from the first image in `dir`.
pub fn reference_shape(dir: impl AsRef<Path>) -> Result<GridShape> {
    let dir = dir.as_ref();
    let first = list_images(dir)?
        .into_iter()
        .next()
        .ok_or_else(|| TrunkmapError::NoReferenceImage(dir.to_path_buf()))?;
    let (width, height) = image_size(&first)?;
    log::info!(
        "reference image {}: {} x {} pixels",
        first.display(),
        width,
        height
    );
    Ok(GridShape::from_image_size(width, height))
}

/// Check that every image across `dirs` has the same size. Returns that
/// (width, height), or `None` when no image was found.
pub fn check_same_image_sizes<P: AsRef<Path>>(dirs: &[P]) -> Result<Option<(u32, u32)>> {
    let mut reference: Option<(u32, u32)> = None;
    let mut checked = 0usize;
    for dir in dirs {
        for path in list_images(dir)? {
            let size = image_size(&path)?;
            match reference {
                None => {
                    log::info!("reference size {}x{} from {}", size.0, size.1, path.display());
                    reference = Some(size);
                }
                Some(expected) if expected != size => {
                    return Err(TrunkmapError::DimensionMismatch {
                        path,
                        expected,
                        found: size,
                    });
                }
                Some(_) => {}
            }
            checked += 1;
        }
    }
    log::info!("{checked} images share the same size");
    Ok(reference)
}
