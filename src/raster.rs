//! Integer coverage grid and the per-level presence mask.

use std::ops::{Index, IndexMut};

/// Grid size as (rows, cols), i.e. (image height, image width).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridShape {
    pub nrow: usize,
    pub ncol: usize,
}

impl GridShape {
    pub fn new(nrow: usize, ncol: usize) -> Self {
        Self { nrow, ncol }
    }

    pub fn from_image_size(width: u32, height: u32) -> Self {
        Self::new(height as usize, width as usize)
    }

    pub fn len(&self) -> usize {
        self.nrow * self.ncol
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clamp a half-open window `[r0, r1) × [c0, c1)` to the grid. Returns
    /// `None` when nothing of it lies inside.
    pub fn clamp_window(
        &self,
        r0: i64,
        r1: i64,
        c0: i64,
        c1: i64,
    ) -> Option<(usize, usize, usize, usize)> {
        let r0 = r0.max(0);
        let c0 = c0.max(0);
        let r1 = r1.min(self.nrow as i64);
        let c1 = c1.min(self.ncol as i64);
        if r0 >= r1 || c0 >= c1 {
            return None;
        }
        Some((r0 as usize, r1 as usize, c0 as usize, c1 as usize))
    }
}

/// Accumulated level counts (row-major). Origin is the top-left pixel of the
/// orthomosaic; row = y, col = x.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageGrid {
    pub nrow: usize,
    pub ncol: usize,
    pub data: Vec<u32>,
}

impl CoverageGrid {
    pub fn zeros(shape: GridShape) -> Self {
        Self {
            nrow: shape.nrow,
            ncol: shape.ncol,
            data: vec![0; shape.len()],
        }
    }

    /// Build from row-major data. `data.len()` must equal `nrow * ncol`.
    pub fn from_vec(nrow: usize, ncol: usize, data: Vec<u32>) -> Option<Self> {
        (data.len() == nrow * ncol).then_some(Self { nrow, ncol, data })
    }

    pub fn shape(&self) -> GridShape {
        GridShape::new(self.nrow, self.ncol)
    }

    /// Value at (row, col), `0` when out of bounds.
    #[inline]
    pub fn get(&self, row: usize, col: usize) -> u32 {
        if row < self.nrow && col < self.ncol {
            self.data[row * self.ncol + col]
        } else {
            0
        }
    }

    pub fn max(&self) -> u32 {
        self.data.iter().copied().max().unwrap_or(0)
    }

    /// Add a level mask: every covered cell gains exactly one.
    pub fn add_mask(&mut self, mask: &LevelMask) {
        debug_assert_eq!(self.shape(), mask.shape());
        for (v, &m) in self.data.iter_mut().zip(mask.data.iter()) {
            if m {
                *v += 1;
            }
        }
    }

    /// Cell-wise sum of two grids of the same shape.
    pub fn add_grid(&mut self, other: &CoverageGrid) {
        debug_assert_eq!(self.shape(), other.shape());
        for (v, &o) in self.data.iter_mut().zip(other.data.iter()) {
            *v += o;
        }
    }

    /// Cells with a non-zero value, row-major, as (row, col).
    pub fn nonzero_cells(&self) -> Vec<(usize, usize)> {
        self.data
            .iter()
            .enumerate()
            .filter(|&(_, &v)| v > 0)
            .map(|(i, _)| (i / self.ncol, i % self.ncol))
            .collect()
    }

    pub fn count_nonzero(&self) -> usize {
        self.data.iter().filter(|&&v| v > 0).count()
    }

    pub fn map<F: Fn(u32) -> u32>(&self, f: F) -> CoverageGrid {
        let mut out = self.clone();
        for v in out.data.iter_mut() {
            *v = f(*v);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.nrow * self.ncol
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Index<(usize, usize)> for CoverageGrid {
    type Output = u32;
    fn index(&self, (r, c): (usize, usize)) -> &u32 {
        &self.data[r * self.ncol + c]
    }
}

impl IndexMut<(usize, usize)> for CoverageGrid {
    fn index_mut(&mut self, (r, c): (usize, usize)) -> &mut u32 {
        &mut self.data[r * self.ncol + c]
    }
}

/// Cells touched by one level. Marking is idempotent, which is what caps a
/// level's contribution to +1 per cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelMask {
    nrow: usize,
    ncol: usize,
    data: Vec<bool>,
}

impl LevelMask {
    pub fn new(shape: GridShape) -> Self {
        Self {
            nrow: shape.nrow,
            ncol: shape.ncol,
            data: vec![false; shape.len()],
        }
    }

    pub fn shape(&self) -> GridShape {
        GridShape::new(self.nrow, self.ncol)
    }

    /// Mark the half-open window `[r0, r1) × [c0, c1)`, clamped to the grid.
    /// Windows entirely outside are ignored.
    pub fn mark_window(&mut self, r0: i64, r1: i64, c0: i64, c1: i64) {
        let Some((r0, r1, c0, c1)) = self.shape().clamp_window(r0, r1, c0, c1) else {
            return;
        };
        for r in r0..r1 {
            self.data[r * self.ncol + c0..r * self.ncol + c1].fill(true);
        }
    }

    pub fn is_marked(&self, row: usize, col: usize) -> bool {
        row < self.nrow && col < self.ncol && self.data[row * self.ncol + col]
    }

    pub fn count(&self) -> usize {
        self.data.iter().filter(|&&m| m).count()
    }
}
