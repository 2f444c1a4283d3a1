//! DecayController: step size for the next epoch.
//!
//! Static schedules ignore the loss history; the bold driver and auto decay
//! adapt to it. See [`crate::auto`] for the sample-based tuner.

use serde::{Deserialize, Serialize};
use strata_matrix::{Factors, SparseMatrix};
use tracing::info;

use crate::auto::{AutoConfig, AutoDecay};
use crate::block::SgdOrder;
use crate::error::SgdError;
use crate::functions::{RegularizeFn, UpdateFn};
use crate::loss::LossFn;

/// Step-size policy, consulted once before every epoch.
pub trait Decay: Send {
    /// Step size for `epoch` (0-based). `previous_loss` is `None` on the
    /// first call; `factors` are the current model, read-only.
    fn next(
        &mut self,
        epoch: usize,
        previous_loss: Option<f64>,
        current_loss: f64,
        factors: &Factors,
    ) -> f64;
}

impl<D: Decay + ?Sized> Decay for Box<D> {
    fn next(&mut self, epoch: usize, prev: Option<f64>, cur: f64, factors: &Factors) -> f64 {
        (**self).next(epoch, prev, cur, factors)
    }
}

/// Fixed step size.
#[derive(Clone, Copy, Debug)]
pub struct ConstantDecay {
    pub eps: f64,
}

impl Decay for ConstantDecay {
    fn next(&mut self, _: usize, _: Option<f64>, _: f64, _: &Factors) -> f64 {
        self.eps
    }
}

/// `eps(n) = a * (n + 1 + A)^-alpha`, with `a` chosen so that `eps(0) = eps0`.
#[derive(Clone, Copy, Debug)]
pub struct SequentialDecay {
    a: f64,
    big_a: f64,
    alpha: f64,
}

impl SequentialDecay {
    pub fn new(eps0: f64, big_a: f64, alpha: f64) -> Self {
        Self { a: eps0 * (1.0 + big_a).powf(alpha), big_a, alpha }
    }
}

impl Decay for SequentialDecay {
    fn next(&mut self, epoch: usize, _: Option<f64>, _: f64, _: &Factors) -> f64 {
        self.a / (epoch as f64 + 1.0 + self.big_a).powf(self.alpha)
    }
}

/// Grow the step while the loss improves, shrink it as soon as it does not.
#[derive(Clone, Copy, Debug)]
pub struct BoldDriver {
    eps: f64,
    increase: f64,
    decrease: f64,
}

impl BoldDriver {
    pub const DEFAULT_INCREASE: f64 = 1.05;
    pub const DEFAULT_DECREASE: f64 = 0.5;

    pub fn new(eps: f64) -> Self {
        Self::with_factors(eps, Self::DEFAULT_INCREASE, Self::DEFAULT_DECREASE)
    }

    pub fn with_factors(eps: f64, increase: f64, decrease: f64) -> Self {
        Self { eps, increase, decrease }
    }

    pub fn eps(&self) -> f64 {
        self.eps
    }

    /// Adjust from a loss pair without the rest of the [`Decay`] plumbing.
    pub fn adjust(&mut self, previous_loss: Option<f64>, current_loss: f64) -> f64 {
        if let Some(prev) = previous_loss {
            if prev <= current_loss {
                self.eps *= self.decrease;
            } else {
                self.eps *= self.increase;
            }
        }
        self.eps
    }
}

impl Decay for BoldDriver {
    fn next(&mut self, _: usize, prev: Option<f64>, cur: f64, _: &Factors) -> f64 {
        self.adjust(prev, cur)
    }
}

/// Serializable choice of decay policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum DecayConfig {
    Constant { eps: f64 },
    Sequential { eps: f64, big_a: f64, alpha: f64 },
    BoldDriver {
        eps: f64,
        #[serde(default = "default_increase")]
        increase: f64,
        #[serde(default = "default_decrease")]
        decrease: f64,
    },
    Auto(AutoConfig),
}

fn default_increase() -> f64 {
    BoldDriver::DEFAULT_INCREASE
}

fn default_decrease() -> f64 {
    BoldDriver::DEFAULT_DECREASE
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self::BoldDriver {
            eps: 0.01,
            increase: BoldDriver::DEFAULT_INCREASE,
            decrease: BoldDriver::DEFAULT_DECREASE,
        }
    }
}

impl DecayConfig {
    pub fn initial_eps(&self) -> f64 {
        match self {
            Self::Constant { eps } | Self::Sequential { eps, .. } | Self::BoldDriver { eps, .. } => {
                *eps
            }
            Self::Auto(auto) => auto.eps,
        }
    }

    pub fn validate(&self) -> Result<(), SgdError> {
        let eps = self.initial_eps();
        if !(eps.is_finite() && eps > 0.0) {
            return Err(SgdError::InvalidConfig(format!("initial step size {eps} must be positive")));
        }
        match self {
            Self::Sequential { alpha, big_a, .. } if *alpha < 0.0 || *big_a < 0.0 => Err(
                SgdError::InvalidConfig("sequential decay needs A >= 0 and alpha >= 0".into()),
            ),
            Self::BoldDriver { increase, decrease, .. } if *increase < 1.0 || *decrease >= 1.0 => {
                Err(SgdError::InvalidConfig(
                    "bold driver needs increase >= 1 and decrease < 1".into(),
                ))
            }
            Self::Auto(auto) => auto.validate(),
            _ => Ok(()),
        }
    }

    /// Build a policy that needs no data. Auto decay is rejected here; use
    /// [`DecayConfig::build_with_data`].
    pub fn build(&self) -> Result<Box<dyn Decay>, SgdError> {
        self.validate()?;
        Ok(match *self {
            Self::Constant { eps } => Box::new(ConstantDecay { eps }),
            Self::Sequential { eps, big_a, alpha } => Box::new(SequentialDecay::new(eps, big_a, alpha)),
            Self::BoldDriver { eps, increase, decrease } => {
                Box::new(BoldDriver::with_factors(eps, increase, decrease))
            }
            Self::Auto(_) => {
                return Err(SgdError::InvalidConfig(
                    "auto decay needs training data and sample strategies".into(),
                ))
            }
        })
    }

    /// Build any policy. For auto decay a sample of `v` is drawn and `make`
    /// supplies the update, regularizer and loss to run on it (they see the
    /// sample's local indices).
    pub fn build_with_data<U, R, L, F>(
        &self,
        v: &SparseMatrix,
        order: SgdOrder,
        make: F,
    ) -> Result<Box<dyn Decay>, SgdError>
    where
        U: UpdateFn + 'static,
        R: RegularizeFn + 'static,
        L: LossFn + 'static,
        F: FnOnce(&SparseMatrix) -> (U, R, L),
    {
        match self {
            Self::Auto(auto) => {
                let decay = AutoDecay::from_data(v, order, auto, make)?;
                info!(tries = auto.tries, sample = auto.sample_size, "auto decay ready");
                Ok(Box::new(decay))
            }
            _ => self.build(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_matrix::{ColFactors, RowFactors};

    fn dummy() -> Factors {
        Factors { w: RowFactors::zeros(1, 1), h: ColFactors::zeros(1, 1) }
    }

    #[test]
    fn constant_never_changes() {
        let mut d = ConstantDecay { eps: 0.3 };
        assert_eq!(d.next(0, None, 1.0, &dummy()), 0.3);
        assert_eq!(d.next(9, Some(0.1), 5.0, &dummy()), 0.3);
    }

    #[test]
    fn sequential_starts_at_eps0_and_decays() {
        let mut d = SequentialDecay::new(0.1, 10.0, 0.5);
        let f = dummy();
        assert!((d.next(0, None, 0.0, &f) - 0.1).abs() < 1e-12);
        let e1 = d.next(1, None, 0.0, &f);
        let e5 = d.next(5, None, 0.0, &f);
        assert!(e1 < 0.1 && e5 < e1);
        assert!((e5 - 0.1 * (11.0f64 / 16.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn bold_driver_first_call_unchanged() {
        let mut d = BoldDriver::new(0.2);
        assert_eq!(d.next(0, None, 10.0, &dummy()), 0.2);
    }

    #[test]
    fn bold_driver_grows_and_shrinks() {
        let mut d = BoldDriver::new(1.0);
        assert!((d.adjust(Some(10.0), 9.0) - 1.05).abs() < 1e-12);
        assert!((d.adjust(Some(9.0), 9.0) - 0.525).abs() < 1e-12);
    }

    #[test]
    fn validation() {
        assert!(DecayConfig::Constant { eps: 0.0 }.validate().is_err());
        assert!(DecayConfig::BoldDriver { eps: 0.1, increase: 0.9, decrease: 0.5 }
            .validate()
            .is_err());
        assert!(DecayConfig::Sequential { eps: 0.1, big_a: 1.0, alpha: 0.5 }.build().is_ok());
    }
}
