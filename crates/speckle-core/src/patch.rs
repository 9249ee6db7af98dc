//! Scan geometry and patch bookkeeping.
//!
//! Each measurement illuminates one rectangular window of the object array,
//! exactly the probe's footprint. [`PatchIndexMap`] stores those windows and
//! is built once per problem. The free functions move data between the full
//! object array and a stack of per-measurement patches:
//!
//! - [`extract_patches`] reads every window into an `(N, m, n)` stack.
//! - [`accumulate`] scatter-adds a stack back, together with the per-pixel
//!   weight that was added, so callers can form overlap-normalised averages.

use ndarray::{s, Array2, Array3, ArrayBase, ArrayView2, ArrayViewMut2, Axis, Data, Ix2, Ix3};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::solver::ReconError;

/// Half-open pixel window `[row_start, row_end) x [col_start, col_end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub row_start: usize,
    pub row_end: usize,
    pub col_start: usize,
    pub col_end: usize,
}

impl Window {
    pub fn shape(&self) -> (usize, usize) {
        (self.row_end - self.row_start, self.col_end - self.col_start)
    }

    /// Borrow this window of `image`.
    pub fn view<'a, A>(&self, image: &'a Array2<A>) -> ArrayView2<'a, A> {
        image.slice(s![self.row_start..self.row_end, self.col_start..self.col_end])
    }

    /// Mutably borrow this window of `image`.
    pub fn view_mut<'a, A>(&self, image: &'a mut Array2<A>) -> ArrayViewMut2<'a, A> {
        image.slice_mut(s![self.row_start..self.row_end, self.col_start..self.col_end])
    }
}

/// Mapping from measurement index to the object window it illuminates.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchIndexMap {
    windows: Vec<Window>,
    probe_shape: (usize, usize),
    object_shape: (usize, usize),
}

impl PatchIndexMap {
    /// Build a map from scan locations, sizing the object to the union of all
    /// windows plus `margin` pixels on every side.
    ///
    /// A location is `[x, y]` in pixels, `x` along columns and `y` along rows.
    /// The probe footprint is centred on the rounded location.
    pub fn from_scan_locations(
        locations: &[[f64; 2]],
        probe_shape: (usize, usize),
        margin: usize,
    ) -> Result<Self, ReconError> {
        let corners = centred_corners(locations, probe_shape)?;
        let min_row = corners.iter().map(|c| c[0]).min().unwrap_or(0);
        let min_col = corners.iter().map(|c| c[1]).min().unwrap_or(0);
        let shift_row = margin as i64 - min_row;
        let shift_col = margin as i64 - min_col;

        let coords: Vec<[i64; 4]> = corners
            .iter()
            .map(|c| {
                let r0 = c[0] + shift_row;
                let c0 = c[1] + shift_col;
                [r0, r0 + probe_shape.0 as i64, c0, c0 + probe_shape.1 as i64]
            })
            .collect();
        let rows = coords.iter().map(|c| c[1]).max().unwrap_or(0) + margin as i64;
        let cols = coords.iter().map(|c| c[3]).max().unwrap_or(0) + margin as i64;

        Self::from_coords(&coords, probe_shape, (rows as usize, cols as usize))
    }

    /// Build a map from scan locations for an object of known shape.
    ///
    /// Fails with [`ReconError::Geometry`] if any window leaves the object.
    pub fn from_scan_locations_in(
        locations: &[[f64; 2]],
        probe_shape: (usize, usize),
        object_shape: (usize, usize),
    ) -> Result<Self, ReconError> {
        let coords: Vec<[i64; 4]> = centred_corners(locations, probe_shape)?
            .iter()
            .map(|c| {
                [
                    c[0],
                    c[0] + probe_shape.0 as i64,
                    c[1],
                    c[1] + probe_shape.1 as i64,
                ]
            })
            .collect();
        Self::from_coords(&coords, probe_shape, object_shape)
    }

    /// Build a map from explicit `[row_start, row_end, col_start, col_end]`
    /// windows, validating extent and bounds.
    pub fn from_coords(
        coords: &[[i64; 4]],
        probe_shape: (usize, usize),
        object_shape: (usize, usize),
    ) -> Result<Self, ReconError> {
        if coords.is_empty() {
            return Err(ReconError::Geometry("no scan windows provided".into()));
        }
        if probe_shape.0 == 0 || probe_shape.1 == 0 {
            return Err(ReconError::ShapeMismatch(format!(
                "probe shape {:?} is empty",
                probe_shape
            )));
        }
        let (rows, cols) = (object_shape.0 as i64, object_shape.1 as i64);
        let mut windows = Vec::with_capacity(coords.len());
        for (j, &[r0, r1, c0, c1]) in coords.iter().enumerate() {
            if r1 - r0 != probe_shape.0 as i64 || c1 - c0 != probe_shape.1 as i64 {
                return Err(ReconError::ShapeMismatch(format!(
                    "window {j} is {}x{}, probe is {}x{}",
                    r1 - r0,
                    c1 - c0,
                    probe_shape.0,
                    probe_shape.1
                )));
            }
            if r0 < 0 || c0 < 0 || r1 > rows || c1 > cols {
                return Err(ReconError::Geometry(format!(
                    "window {j} [{r0}:{r1}, {c0}:{c1}] lies outside the {rows}x{cols} object"
                )));
            }
            windows.push(Window {
                row_start: r0 as usize,
                row_end: r1 as usize,
                col_start: c0 as usize,
                col_end: c1 as usize,
            });
        }
        Ok(Self {
            windows,
            probe_shape,
            object_shape,
        })
    }

    /// Number of windows (one per measurement).
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn window(&self, j: usize) -> &Window {
        &self.windows[j]
    }

    pub fn windows(&self) -> &[Window] {
        &self.windows
    }

    pub fn probe_shape(&self) -> (usize, usize) {
        self.probe_shape
    }

    pub fn object_shape(&self) -> (usize, usize) {
        self.object_shape
    }

    /// The windows as an `(N, 4)` integer array.
    pub fn to_coords(&self) -> Array2<usize> {
        Array2::from_shape_fn((self.len(), 4), |(j, k)| {
            let w = &self.windows[j];
            [w.row_start, w.row_end, w.col_start, w.col_end][k]
        })
    }

    /// Number of windows covering each object pixel.
    pub fn coverage(&self) -> Array2<f64> {
        coverage_weight(&Array2::ones(self.probe_shape), self)
    }
}

fn centred_corners(
    locations: &[[f64; 2]],
    probe_shape: (usize, usize),
) -> Result<Vec<[i64; 2]>, ReconError> {
    if locations.is_empty() {
        return Err(ReconError::Geometry("no scan locations provided".into()));
    }
    let half_rows = (probe_shape.0 / 2) as i64;
    let half_cols = (probe_shape.1 / 2) as i64;
    locations
        .iter()
        .enumerate()
        .map(|(j, &[x, y])| {
            if !x.is_finite() || !y.is_finite() {
                return Err(ReconError::Geometry(format!(
                    "scan location {j} ({x}, {y}) is not finite"
                )));
            }
            Ok([y.round() as i64 - half_rows, x.round() as i64 - half_cols])
        })
        .collect()
}

/// Read every window of `object` into an `(N, m, n)` stack.
pub fn extract_patches(object: &Array2<Complex64>, map: &PatchIndexMap) -> Array3<Complex64> {
    let (m, n) = map.probe_shape();
    let mut patches = Array3::<Complex64>::zeros((map.len(), m, n));
    for (window, mut patch) in map.windows().iter().zip(patches.axis_iter_mut(Axis(0))) {
        patch.assign(&window.view(object));
    }
    patches
}

/// Scatter-add each patch into a zero-initialised object-sized array.
pub fn scatter_add<S>(patches: &ArrayBase<S, Ix3>, map: &PatchIndexMap) -> Array2<Complex64>
where
    S: Data<Elem = Complex64>,
{
    let mut sum = Array2::<Complex64>::zeros(map.object_shape());
    for (window, patch) in map.windows().iter().zip(patches.axis_iter(Axis(0))) {
        let mut region = window.view_mut(&mut sum);
        region += &patch;
    }
    sum
}

/// Scatter-add the same per-pixel `weight` once per window.
pub fn coverage_weight<S>(weight: &ArrayBase<S, Ix2>, map: &PatchIndexMap) -> Array2<f64>
where
    S: Data<Elem = f64>,
{
    let mut total = Array2::<f64>::zeros(map.object_shape());
    for window in map.windows() {
        let mut region = window.view_mut(&mut total);
        region += weight;
    }
    total
}

/// Accumulate a patch stack into `(sum, weight)` object arrays.
///
/// With `weight = None` every pixel of every patch counts once, so `weight`
/// is the overlap count. With `Some(w)` each patch is multiplied by `w`
/// before adding and `w` is accumulated instead (e.g. probe intensity).
/// Dividing `sum` by `weight` gives the overlap-normalised average.
pub fn accumulate(
    patches: &Array3<Complex64>,
    map: &PatchIndexMap,
    weight: Option<&Array2<f64>>,
) -> (Array2<Complex64>, Array2<f64>) {
    match weight {
        None => (scatter_add(patches, map), map.coverage()),
        Some(w) => {
            let mut weighted = patches.clone();
            for mut patch in weighted.axis_iter_mut(Axis(0)) {
                patch.zip_mut_with(w, |p, &wt| *p *= wt);
            }
            (scatter_add(&weighted, map), coverage_weight(w, map))
        }
    }
}
