//! Level numbering and level-range selection.
//!
//! Level files are named `<site>_<level>_<...>.<ext>` (e.g. `P28_150_rgb.json`):
//! the level number is the second `_`-separated token of the file stem.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Inclusive level bounds. `None` leaves that side open; with both `None`
/// every file is admitted, including names that carry no level number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelRange {
    #[serde(default)]
    pub min: Option<i64>,
    #[serde(default)]
    pub max: Option<i64>,
}

impl LevelRange {
    pub fn new(min: Option<i64>, max: Option<i64>) -> Self {
        Self { min, max }
    }

    pub fn is_active(&self) -> bool {
        self.min.is_some() || self.max.is_some()
    }

    pub fn contains(&self, level: i64) -> bool {
        self.min.map_or(true, |m| level >= m) && self.max.map_or(true, |m| level <= m)
    }

    /// Whether a level file takes part in accumulation. While the range is
    /// active, files whose name has no parseable level are left out.
    pub fn admits(&self, file_name: &str) -> bool {
        if !self.is_active() {
            return true;
        }
        match level_number(file_name) {
            Some(level) => self.contains(level),
            None => {
                log::debug!("{file_name}: no level number, excluded from range filtering");
                false
            }
        }
    }
}

/// Level number carried by a file name, if any.
pub fn level_number(file_name: &str) -> Option<i64> {
    let stem = Path::new(file_name).file_stem()?.to_str()?;
    stem.split('_').nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_number() {
        assert_eq!(level_number("P28_150_rgb.json"), Some(150));
        assert_eq!(level_number("dir/P9_7.shp"), Some(7));
        assert_eq!(level_number("P28_rgb_150.json"), None);
        assert_eq!(level_number("nolevel.json"), None);
    }

    #[test]
    fn test_inactive_range_admits_everything() {
        let r = LevelRange::default();
        assert!(!r.is_active());
        assert!(r.admits("whatever.json"));
        assert!(r.admits("P1_5_rgb.json"));
    }

    #[test]
    fn test_range_bounds_are_inclusive() {
        let r = LevelRange::new(Some(100), Some(250));
        assert!(r.admits("P28_100_rgb.json"));
        assert!(r.admits("P28_250_rgb.json"));
        assert!(!r.admits("P28_99_rgb.json"));
        assert!(!r.admits("P28_251_rgb.json"));
    }

    #[test]
    fn test_half_open_range_and_malformed_names() {
        let r = LevelRange::new(Some(10), None);
        assert!(r.admits("A_10000_x.json"));
        assert!(!r.admits("A_9_x.json"));
        assert!(!r.admits("A_x_10.json"));
    }
}
