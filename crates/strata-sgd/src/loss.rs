//! Loss functions evaluated between epochs.

use std::sync::Arc;

use strata_matrix::{Factors, NnzCounts, SparseMatrix};

/// Objective value of the current factors, optionally against data.
pub trait LossFn: Send + Sync {
    fn evaluate(&self, factors: &Factors, data: Option<&SparseMatrix>) -> f64;
}

impl<L: LossFn + ?Sized> LossFn for Arc<L> {
    fn evaluate(&self, factors: &Factors, data: Option<&SparseMatrix>) -> f64 {
        (**self).evaluate(factors, data)
    }
}

impl<L: LossFn + ?Sized> LossFn for Box<L> {
    fn evaluate(&self, factors: &Factors, data: Option<&SparseMatrix>) -> f64 {
        (**self).evaluate(factors, data)
    }
}

/// Sum of squared errors over the stored entries. Contributes 0 without data.
#[derive(Clone, Copy, Debug, Default)]
pub struct NzslLoss;

impl LossFn for NzslLoss {
    fn evaluate(&self, factors: &Factors, data: Option<&SparseMatrix>) -> f64 {
        let Some(v) = data else { return 0.0 };
        v.iter()
            .map(|e| {
                let err = e.value - factors.product(e.row, e.col);
                err * err
            })
            .sum()
    }
}

/// `lambda * (|W|^2 + |H|^2)`.
#[derive(Clone, Copy, Debug)]
pub struct L2Loss {
    pub lambda: f64,
}

impl LossFn for L2Loss {
    fn evaluate(&self, factors: &Factors, _data: Option<&SparseMatrix>) -> f64 {
        self.lambda * (factors.w.sq_norm(None) + factors.h.sq_norm(None))
    }
}

/// L2 penalty with each row (column) weighted by its nonzero count.
#[derive(Clone, Debug)]
pub struct Nzl2Loss {
    pub lambda: f64,
    pub counts: Arc<NnzCounts>,
}

impl LossFn for Nzl2Loss {
    fn evaluate(&self, factors: &Factors, _data: Option<&SparseMatrix>) -> f64 {
        self.lambda
            * (factors.w.sq_norm(Some(&self.counts.rows))
                + factors.h.sq_norm(Some(&self.counts.cols)))
    }
}

/// Sum of two losses, e.g. data fit plus penalty.
#[derive(Clone, Debug)]
pub struct SumLoss<A, B>(pub A, pub B);

impl<A: LossFn, B: LossFn> LossFn for SumLoss<A, B> {
    fn evaluate(&self, factors: &Factors, data: Option<&SparseMatrix>) -> f64 {
        self.0.evaluate(factors, data) + self.1.evaluate(factors, data)
    }
}

/// Root mean squared error over the entries of `data`.
pub fn rmse(factors: &Factors, data: &SparseMatrix) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    (NzslLoss.evaluate(factors, Some(data)) / data.nnz() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_matrix::{ColFactors, RowFactors};

    fn setup() -> (Factors, SparseMatrix) {
        let f = Factors {
            w: RowFactors::from_vec(2, 1, vec![1.0, 2.0]).unwrap(),
            h: ColFactors::from_vec(1, 2, vec![1.0, 3.0]).unwrap(),
        };
        let v = SparseMatrix::from_triplets(2, 2, [(0, 0, 2.0), (1, 1, 6.0)]).unwrap();
        (f, v)
    }

    #[test]
    fn nzsl_sums_squared_errors() {
        let (f, v) = setup();
        // errors: 2 - 1 = 1, 6 - 6 = 0
        assert!((NzslLoss.evaluate(&f, Some(&v)) - 1.0).abs() < 1e-12);
        assert_eq!(NzslLoss.evaluate(&f, None), 0.0);
        assert!((rmse(&f, &v) - 0.5f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn penalties() {
        let (f, v) = setup();
        assert!((L2Loss { lambda: 0.5 }.evaluate(&f, None) - 7.5).abs() < 1e-12);
        let counts = Arc::new(v.nnz_counts());
        // rows: 1*1 + 1*4, cols: 1*1 + 1*9
        let nz = Nzl2Loss { lambda: 1.0, counts };
        assert!((nz.evaluate(&f, None) - 15.0).abs() < 1e-12);
        let sum = SumLoss(NzslLoss, L2Loss { lambda: 0.5 });
        assert!((sum.evaluate(&f, Some(&v)) - 8.5).abs() < 1e-12);
    }
}
