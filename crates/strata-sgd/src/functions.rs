//! Update and regularization strategies.
//!
//! An [`UpdateFn`] receives the latent vectors of exactly one data row and
//! one data column, so it cannot touch anything else. Block workers and the
//! lock runner both drive the same trait, which keeps the two code paths
//! interchangeable.

use std::sync::Arc;

use strata_matrix::{dot, Entry, Factors, NnzCounts};

/// Per-entry SGD step.
pub trait UpdateFn: Send + Sync {
    /// Apply one step for `entry` with step size `eps`.
    ///
    /// `entry.row` / `entry.col` are global indices; `w_row` and `h_col` are
    /// the corresponding latent vectors.
    fn update(&self, w_row: &mut [f64], h_col: &mut [f64], entry: Entry, eps: f64);
}

/// Once-per-epoch regularization pass over the full factors.
pub trait RegularizeFn: Send + Sync {
    /// Shrink `factors`; returns whether the pass rescaled them (used to
    /// trigger balancing).
    fn regularize(&self, factors: &mut Factors, eps: f64) -> bool;
}

impl<U: UpdateFn + ?Sized> UpdateFn for Arc<U> {
    fn update(&self, w_row: &mut [f64], h_col: &mut [f64], entry: Entry, eps: f64) {
        (**self).update(w_row, h_col, entry, eps)
    }
}

impl<R: RegularizeFn + ?Sized> RegularizeFn for Arc<R> {
    fn regularize(&self, factors: &mut Factors, eps: f64) -> bool {
        (**self).regularize(factors, eps)
    }
}

// ---------------------------------------------------------------------------
// Updates
// ---------------------------------------------------------------------------

/// Squared loss over the nonzeros.
#[derive(Clone, Copy, Debug, Default)]
pub struct Nzsl;

impl UpdateFn for Nzsl {
    #[inline]
    fn update(&self, w: &mut [f64], h: &mut [f64], entry: Entry, eps: f64) {
        let f = -2.0 * eps * (entry.value - dot(w, h));
        for (wz, hz) in w.iter_mut().zip(h.iter_mut()) {
            let old = *wz;
            *wz -= f * *hz;
            *hz -= f * old;
        }
    }
}

/// Squared loss with plain L2 shrinkage folded into every step.
#[derive(Clone, Copy, Debug)]
pub struct NzslL2 {
    pub lambda: f64,
}

impl UpdateFn for NzslL2 {
    #[inline]
    fn update(&self, w: &mut [f64], h: &mut [f64], entry: Entry, eps: f64) {
        let f1 = -2.0 * eps * (entry.value - dot(w, h));
        let f2 = 2.0 * eps * self.lambda;
        for (wz, hz) in w.iter_mut().zip(h.iter_mut()) {
            let old = *wz;
            *wz -= f1 * *hz + f2 * old;
            *hz -= f1 * old + f2 * *hz;
        }
    }
}

/// Squared loss with L2 shrinkage spread over a row's (column's) nonzeros.
#[derive(Clone, Debug)]
pub struct NzslNzl2 {
    pub lambda: f64,
    pub counts: Arc<NnzCounts>,
}

impl UpdateFn for NzslNzl2 {
    #[inline]
    fn update(&self, w: &mut [f64], h: &mut [f64], entry: Entry, eps: f64) {
        let f1 = -2.0 * eps * (entry.value - dot(w, h));
        let f2 = 2.0 * eps * self.lambda;
        let f3 = 1.0 / self.counts.rows[entry.row] as f64;
        let f4 = 1.0 / self.counts.cols[entry.col] as f64;
        for (wz, hz) in w.iter_mut().zip(h.iter_mut()) {
            let old = *wz;
            *wz -= f1 * *hz + f2 * old * f3;
            *hz -= f1 * old + f2 * *hz * f4;
        }
    }
}

/// Clamp `v` into (min, max); values on or past a bound are pulled in by `eps`.
#[inline]
fn truncate(v: &mut f64, min: f64, max: f64, eps: f64) {
    if *v <= min {
        *v = min + eps;
    } else if *v >= max {
        *v = max - eps;
    }
}

/// Box constraint on the factors, applied after every inner update.
#[derive(Clone, Debug)]
pub struct UpdateTruncate<U> {
    pub inner: U,
    pub w_min: f64,
    pub w_max: f64,
    pub h_min: f64,
    pub h_max: f64,
}

impl<U> UpdateTruncate<U> {
    /// Same bounds for W and H.
    pub fn new(inner: U, min: f64, max: f64) -> Self {
        Self { inner, w_min: min, w_max: max, h_min: min, h_max: max }
    }
}

impl<U: UpdateFn> UpdateFn for UpdateTruncate<U> {
    #[inline]
    fn update(&self, w: &mut [f64], h: &mut [f64], entry: Entry, eps: f64) {
        self.inner.update(w, h, entry, eps);
        w.iter_mut().for_each(|v| truncate(v, self.w_min, self.w_max, eps));
        h.iter_mut().for_each(|v| truncate(v, self.h_min, self.h_max, eps));
    }
}

// ---------------------------------------------------------------------------
// Regularizers
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default)]
pub struct RegularizeNone;

impl RegularizeFn for RegularizeNone {
    fn regularize(&self, _factors: &mut Factors, _eps: f64) -> bool {
        false
    }
}

/// Uniform multiplicative shrinkage of W and H.
#[derive(Clone, Copy, Debug)]
pub struct RegularizeL2 {
    pub lambda: f64,
}

impl RegularizeFn for RegularizeL2 {
    fn regularize(&self, factors: &mut Factors, eps: f64) -> bool {
        if self.lambda == 0.0 {
            return false;
        }
        let mut factor = 1.0 - 2.0 * eps * self.lambda;
        if factor < 0.5 {
            // shrink at speed 1/x until eps gets small enough
            factor = 0.25 / (1.0 - factor);
        }
        factors.w.scale(factor);
        factors.h.scale(factor);
        true
    }
}

/// Shrinkage of each row (column) proportional to its nonzero count.
#[derive(Clone, Debug)]
pub struct RegularizeNzl2 {
    pub lambda: f64,
    pub counts: Arc<NnzCounts>,
}

impl RegularizeFn for RegularizeNzl2 {
    fn regularize(&self, factors: &mut Factors, eps: f64) -> bool {
        if self.lambda == 0.0 {
            return false;
        }
        let max = self.counts.max() as f64;
        let mut eps2_lambda = 2.0 * eps * self.lambda;
        if 1.0 - eps2_lambda * max < 0.5 {
            // pick the eps that smooths the worst-case row to the same 1/x shrink
            let eps = (1.0 / (2.0 * self.lambda * max)) * (1.0 - 0.25 / (eps2_lambda * max));
            eps2_lambda = 2.0 * eps * self.lambda;
        }
        for (row, &n) in factors.w.rows_mut().zip(&self.counts.rows) {
            let f = 1.0 - eps2_lambda * n as f64;
            row.iter_mut().for_each(|v| *v *= f);
        }
        for (col, &n) in factors.h.cols_mut().zip(&self.counts.cols) {
            let f = 1.0 - eps2_lambda * n as f64;
            col.iter_mut().for_each(|v| *v *= f);
        }
        true
    }
}

/// Box constraint applied after the inner regularizer.
#[derive(Clone, Debug)]
pub struct RegularizeTruncate<R> {
    pub inner: R,
    pub w_min: f64,
    pub w_max: f64,
    pub h_min: f64,
    pub h_max: f64,
}

impl<R> RegularizeTruncate<R> {
    pub fn new(inner: R, min: f64, max: f64) -> Self {
        Self { inner, w_min: min, w_max: max, h_min: min, h_max: max }
    }
}

impl<R: RegularizeFn> RegularizeFn for RegularizeTruncate<R> {
    fn regularize(&self, factors: &mut Factors, eps: f64) -> bool {
        let hint = self.inner.regularize(factors, eps);
        for v in factors.w.as_mut_slice() {
            truncate(v, self.w_min, self.w_max, eps);
        }
        for v in factors.h.as_mut_slice() {
            truncate(v, self.h_min, self.h_max, eps);
        }
        hint
    }
}
