//! BalanceController: product-preserving rescaling of W and H.
//!
//! Scaling W by a positive diagonal D and H by D^-1 leaves W·H unchanged but
//! moves the regularization penalty. For a penalty `x·reg(W) + reg(H)/x` the
//! minimizer is `x = sqrt(reg(H)/reg(W))`, so each W column is scaled by the
//! square root of that, `(reg(H)/reg(W))^(1/4)`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strata_matrix::{Factors, NnzCounts};
use tracing::{info, warn};

use crate::error::SgdError;

/// Which penalty to balance and how.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancePolicy {
    #[default]
    None,
    L2Simple,
    L2Optimal,
    Nzl2Simple,
    Nzl2Optimal,
}

impl BalancePolicy {
    fn weighted(self) -> bool {
        matches!(self, Self::Nzl2Simple | Self::Nzl2Optimal)
    }
}

/// When balancing runs, counted in completed epochs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceCadence {
    #[default]
    Never,
    EveryEpoch,
    /// After every n-th epoch.
    Every(usize),
    /// Whenever the regularizer reports that it rescaled the factors.
    OnRegularizeHint,
}

/// One scalar for all of W (inverse for H). Returns the W factor.
///
/// A degenerate ratio (zero or non-finite) zeroes both matrices.
pub fn balance_simple(factors: &mut Factors, counts: Option<&NnzCounts>) -> f64 {
    let reg_w = factors.w.sq_norm(counts.map(|c| c.rows.as_slice()));
    let reg_h = factors.h.sq_norm(counts.map(|c| c.cols.as_slice()));
    let w_factor = (reg_h / reg_w).sqrt().sqrt();
    if !w_factor.is_finite() || w_factor == 0.0 {
        warn!(reg_w, reg_h, "invalid balancing multiplier; zeroing factor matrices");
        factors.w.scale(0.0);
        factors.h.scale(0.0);
        return 0.0;
    }
    factors.w.scale(w_factor);
    factors.h.scale(1.0 / w_factor);
    w_factor
}

/// One scalar per latent dimension. Returns the W factors.
pub fn balance_optimal(factors: &mut Factors, counts: Option<&NnzCounts>) -> Vec<f64> {
    let reg_w = factors.w.latent_sq_sums(counts.map(|c| c.rows.as_slice()));
    let reg_h = factors.h.latent_sq_sums(counts.map(|c| c.cols.as_slice()));
    let mut w_factors = Vec::with_capacity(reg_w.len());
    let mut h_factors = Vec::with_capacity(reg_w.len());
    for (k, (rw, rh)) in reg_w.iter().zip(&reg_h).enumerate() {
        let f = (rh / rw).sqrt().sqrt();
        if !f.is_finite() || f == 0.0 {
            warn!(k, reg_w = rw, reg_h = rh, "invalid balancing multiplier; zeroing latent factor");
            w_factors.push(0.0);
            h_factors.push(0.0);
        } else {
            w_factors.push(f);
            h_factors.push(1.0 / f);
        }
    }
    factors.w.scale_latent(&w_factors);
    factors.h.scale_latent(&h_factors);
    w_factors
}

/// Applies a [`BalancePolicy`] on a [`BalanceCadence`].
#[derive(Clone, Debug, Default)]
pub struct BalanceController {
    policy: BalancePolicy,
    cadence: BalanceCadence,
    counts: Option<Arc<NnzCounts>>,
}

impl BalanceController {
    /// NZL2 policies need the data matrix's nonzero counts.
    pub fn new(
        policy: BalancePolicy,
        cadence: BalanceCadence,
        counts: Option<Arc<NnzCounts>>,
    ) -> Result<Self, SgdError> {
        if policy.weighted() && counts.is_none() {
            return Err(SgdError::InvalidConfig(format!(
                "{policy:?} balancing requires nonzero counts"
            )));
        }
        if cadence == BalanceCadence::Every(0) {
            return Err(SgdError::InvalidConfig("balance cadence of 0 epochs".into()));
        }
        Ok(Self { policy, cadence, counts })
    }

    /// Never balances.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn policy(&self) -> BalancePolicy {
        self.policy
    }

    /// Whether balancing is due after `epoch` (0-based) completed.
    pub fn due(&self, epoch: usize, rescale_hint: bool) -> bool {
        if self.policy == BalancePolicy::None {
            return false;
        }
        match self.cadence {
            BalanceCadence::Never => false,
            BalanceCadence::EveryEpoch => true,
            BalanceCadence::Every(n) => (epoch + 1) % n == 0,
            BalanceCadence::OnRegularizeHint => rescale_hint,
        }
    }

    /// Balance now, regardless of cadence. Returns the W factors applied.
    pub fn apply(&self, factors: &mut Factors) -> Vec<f64> {
        let counts = if self.policy.weighted() { self.counts.as_deref() } else { None };
        let applied = match self.policy {
            BalancePolicy::None => return vec![1.0],
            BalancePolicy::L2Simple | BalancePolicy::Nzl2Simple => {
                vec![balance_simple(factors, counts)]
            }
            BalancePolicy::L2Optimal | BalancePolicy::Nzl2Optimal => {
                balance_optimal(factors, counts)
            }
        };
        info!(policy = ?self.policy, factors = ?applied, "balanced factors");
        applied
    }

    /// Balance if due; returns whether it ran.
    pub fn maybe_apply(&self, epoch: usize, rescale_hint: bool, factors: &mut Factors) -> bool {
        if !self.due(epoch, rescale_hint) {
            return false;
        }
        self.apply(factors);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_matrix::{ColFactors, RowFactors};

    fn unbalanced() -> Factors {
        Factors {
            w: RowFactors::from_fn(3, 2, |i, k| 10.0 * (i + k + 1) as f64),
            h: ColFactors::from_fn(2, 4, |k, j| 0.01 * (k + 2 * j + 1) as f64),
        }
    }

    fn max_diff(a: &[f64], b: &[f64]) -> f64 {
        a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f64::max)
    }

    #[test]
    fn simple_equalizes_norms() {
        let mut f = unbalanced();
        let before = f.reconstruct();
        let wf = balance_simple(&mut f, None);
        assert!(wf < 1.0);
        assert!((f.w.sq_norm(None) - f.h.sq_norm(None)).abs() < 1e-9);
        assert!(max_diff(&before, &f.reconstruct()) < 1e-9);
    }

    #[test]
    fn optimal_equalizes_each_latent_dimension() {
        let mut f = unbalanced();
        let before = f.reconstruct();
        let wf = balance_optimal(&mut f, None);
        assert_eq!(wf.len(), 2);
        let (rw, rh) = (f.w.latent_sq_sums(None), f.h.latent_sq_sums(None));
        for k in 0..2 {
            assert!((rw[k] - rh[k]).abs() < 1e-9);
        }
        assert!(max_diff(&before, &f.reconstruct()) < 1e-9);
    }

    #[test]
    fn zero_factor_matrix_zeroes_both() {
        let mut f = unbalanced();
        f.h.scale(0.0);
        assert_eq!(balance_simple(&mut f, None), 0.0);
        assert_eq!(f.w.sq_norm(None), 0.0);
        assert!(f.reconstruct().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn nzl2_policy_needs_counts() {
        assert!(BalanceController::new(BalancePolicy::Nzl2Simple, BalanceCadence::EveryEpoch, None)
            .is_err());
        assert!(BalanceController::new(BalancePolicy::L2Simple, BalanceCadence::Every(0), None)
            .is_err());
    }

    #[test]
    fn nzl2_balancing_uses_weights() {
        let counts = Arc::new(NnzCounts { rows: vec![1, 2, 3], cols: vec![4, 1, 1, 2] });
        let c = BalanceController::new(
            BalancePolicy::Nzl2Simple,
            BalanceCadence::EveryEpoch,
            Some(counts.clone()),
        )
        .unwrap();
        let mut f = unbalanced();
        let before = f.reconstruct();
        c.apply(&mut f);
        let rw = f.w.sq_norm(Some(&counts.rows));
        let rh = f.h.sq_norm(Some(&counts.cols));
        assert!((rw - rh).abs() < 1e-9 * rw.max(1.0));
        assert!(max_diff(&before, &f.reconstruct()) < 1e-9);
    }

    #[test]
    fn cadence() {
        let every2 =
            BalanceController::new(BalancePolicy::L2Simple, BalanceCadence::Every(2), None).unwrap();
        assert!(!every2.due(0, false));
        assert!(every2.due(1, false));
        let hint = BalanceController::new(
            BalancePolicy::L2Optimal,
            BalanceCadence::OnRegularizeHint,
            None,
        )
        .unwrap();
        assert!(hint.due(0, true));
        assert!(!hint.due(0, false));
        assert!(!BalanceController::disabled().due(3, true));
    }
}
