//! File helpers: JSON records, point lists and directory listings.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::centers::TreeCenter;
use crate::detection::Detection;
use crate::error::{Result, TrunkmapError};
use crate::matching::Point2D;

/// A point as found in center / ground-truth files: `[x, y]` or `{"x", "y"}`.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
enum PointRecord {
    Pair([f64; 2]),
    Object { x: f64, y: f64 },
}

impl From<PointRecord> for Point2D {
    fn from(p: PointRecord) -> Self {
        match p {
            PointRecord::Pair(xy) => xy,
            PointRecord::Object { x, y } => [x, y],
        }
    }
}

#[derive(Debug, Deserialize)]
struct WorldPointRow {
    x: f64,
    y: f64,
}

pub fn read_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

/// Write `value` as pretty JSON, creating parent directories.
pub fn write_json_pretty<T: Serialize + ?Sized>(path: impl AsRef<Path>, value: &T) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

pub fn read_detections(path: impl AsRef<Path>) -> Result<Vec<Detection>> {
    read_json(path)
}

/// Read a point list in either `[[x, y], ...]` or `[{"x": .., "y": ..}, ...]` form.
pub fn read_points(path: impl AsRef<Path>) -> Result<Vec<Point2D>> {
    let records: Vec<PointRecord> = read_json(path)?;
    Ok(records.into_iter().map(Point2D::from).collect())
}

/// Tree centers are written as `[[x, y], ...]`.
pub fn write_centers(path: impl AsRef<Path>, centers: &[TreeCenter]) -> Result<()> {
    write_json_pretty(path, centers)
}

/// Read world coordinates from a CSV file with `x` and `y` columns.
pub fn read_world_points_csv(path: impl AsRef<Path>) -> Result<Vec<Point2D>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)?;
    let mut out = Vec::new();
    for row in reader.deserialize() {
        let row: WorldPointRow = row?;
        out.push([row.x, row.y]);
    }
    Ok(out)
}

/// Files directly under `dir` whose extension is one of `extensions`
/// (case-insensitive), sorted by name.
pub fn list_files(dir: impl AsRef<Path>, extensions: &[&str]) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(TrunkmapError::MissingDirectory(dir.to_path_buf()));
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
            .unwrap_or(false);
        if matches {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub(crate) fn file_name_str(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or("")
}

pub(crate) fn file_stem_str(path: &Path) -> &str {
    path.file_stem().and_then(|n| n.to_str()).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_points_accepts_both_layouts() {
        let dir = tempfile::tempdir().unwrap();
        let pairs = dir.path().join("pairs.json");
        let objects = dir.path().join("objects.json");
        fs::write(&pairs, "[[1, 2], [3.5, 4]]").unwrap();
        fs::write(&objects, r#"[{"x": 1, "y": 2}, {"x": 3.5, "y": 4}]"#).unwrap();

        let expected = vec![[1.0, 2.0], [3.5, 4.0]];
        assert_eq!(read_points(&pairs).unwrap(), expected);
        assert_eq!(read_points(&objects).unwrap(), expected);
    }

    #[test]
    fn test_write_centers_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results/nested/centers.json");
        write_centers(&path, &[TreeCenter { x: 3, y: 4 }, TreeCenter { x: 10, y: 1 }]).unwrap();
        assert_eq!(read_points(&path).unwrap(), vec![[3.0, 4.0], [10.0, 1.0]]);
    }

    #[test]
    fn test_read_world_points_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trees.csv");
        fs::write(&path, "id,x,y\n1, 100.5, 200.25\n2,101,201\n").unwrap();
        let pts = read_world_points_csv(&path).unwrap();
        assert_eq!(pts, vec![[100.5, 200.25], [101.0, 201.0]]);
    }

    #[test]
    fn test_list_files_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.json", "a.JSON", "c.txt"] {
            fs::write(dir.path().join(name), "[]").unwrap();
        }
        fs::create_dir(dir.path().join("sub.json")).unwrap();
        let files = list_files(dir.path(), &["json"]).unwrap();
        let names: Vec<&str> = files.iter().map(|p| file_name_str(p)).collect();
        assert_eq!(names, vec!["a.JSON", "b.json"]);
    }

    #[test]
    fn test_list_files_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = list_files(dir.path().join("nope"), &["json"]).unwrap_err();
        assert!(matches!(err, TrunkmapError::MissingDirectory(_)));
    }
}
