//! Automatic step-size selection on a sample of the data.
//!
//! Before each epoch a handful of candidate step sizes are tried on a small
//! projected sample: every candidate runs one SGD epoch on its own copy of
//! the sampled factors, and the one with the lowest sample loss wins. The
//! live factors are only read. Once the full loss goes up for the first
//! time, the sample optimum has stopped being a good guide and the
//! controller behaves like a bold driver for the rest of the run.

use rand::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use strata_matrix::{Factors, ProjectedSample, SparseMatrix};
use tracing::{debug, info, warn};

use crate::block::SgdOrder;
use crate::decay::{BoldDriver, Decay};
use crate::error::SgdError;
use crate::functions::{RegularizeFn, UpdateFn};
use crate::loss::LossFn;
use crate::runner::sgd_epoch;

/// Rounds of halving before giving up on finding an acceptable candidate.
const MAX_ROUNDS: usize = 32;

/// Accept the best candidate only if its larger neighbour was within this factor.
const NEIGHBOUR_TOLERANCE: f64 = 100.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AutoConfig {
    /// Initial (and, unless `allow_increase`, maximum) step size.
    pub eps: f64,
    #[serde(default = "default_tries")]
    pub tries: usize,
    #[serde(default = "default_decrease")]
    pub decrease: f64,
    #[serde(default = "default_increase")]
    pub increase: f64,
    #[serde(default)]
    pub allow_increase: bool,
    /// Entries drawn from V for the trial runs.
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
    /// Multiply the chosen step by the sample's coverage ratio.
    #[serde(default)]
    pub scale: bool,
    #[serde(default)]
    pub seed: u64,
}

fn default_tries() -> usize {
    10
}

fn default_decrease() -> f64 {
    BoldDriver::DEFAULT_DECREASE
}

fn default_increase() -> f64 {
    BoldDriver::DEFAULT_INCREASE
}

fn default_sample_size() -> usize {
    1000
}

impl AutoConfig {
    pub fn new(eps: f64) -> Self {
        Self {
            eps,
            tries: default_tries(),
            decrease: default_decrease(),
            increase: default_increase(),
            allow_increase: false,
            sample_size: default_sample_size(),
            scale: false,
            seed: 0,
        }
    }

    pub fn validate(&self) -> Result<(), SgdError> {
        if self.tries <= 1 {
            return Err(SgdError::InvalidConfig(format!(
                "auto decay needs more than one try, got {}",
                self.tries
            )));
        }
        if self.sample_size == 0 {
            return Err(SgdError::InvalidConfig("auto decay sample is empty".into()));
        }
        Ok(())
    }
}

/// Sample-based step-size tuner with bold-driver fallback.
pub struct AutoDecay<U, R, L> {
    sample: ProjectedSample,
    update: U,
    regularize: R,
    loss: L,
    order: SgdOrder,
    eps: f64,
    initial_eps: f64,
    tries: usize,
    allow_increase: bool,
    scale_factor: f64,
    fallback: Option<BoldDriver>,
    decrease: f64,
    increase: f64,
    rng: Xoshiro256PlusPlus,
}

impl<U: UpdateFn, R: RegularizeFn, L: LossFn> AutoDecay<U, R, L> {
    /// `update`, `regularize` and `loss` operate on the sample's local indices.
    pub fn new(
        sample: ProjectedSample,
        update: U,
        regularize: R,
        loss: L,
        order: SgdOrder,
        config: &AutoConfig,
    ) -> Result<Self, SgdError> {
        config.validate()?;
        let scale_factor = if config.scale { sample.scale_factor() } else { 1.0 };
        info!(scale_factor, entries = sample.data.nnz(), "initialized automatic decay");
        Ok(Self {
            sample,
            update,
            regularize,
            loss,
            order,
            eps: config.eps,
            initial_eps: config.eps,
            tries: config.tries,
            allow_increase: config.allow_increase,
            scale_factor,
            fallback: None,
            decrease: config.decrease,
            increase: config.increase,
            rng: Xoshiro256PlusPlus::seed_from_u64(config.seed),
        })
    }

    /// Draw the sample from `v` (seeded by the config) and build the
    /// strategies for it with `make`.
    pub fn from_data<F>(
        v: &SparseMatrix,
        order: SgdOrder,
        config: &AutoConfig,
        make: F,
    ) -> Result<Self, SgdError>
    where
        F: FnOnce(&SparseMatrix) -> (U, R, L),
    {
        config.validate()?;
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(config.seed);
        let sample = v.sample(config.sample_size, &mut rng);
        let (update, regularize, loss) = make(&sample.data);
        let mut decay = Self::new(sample, update, regularize, loss, order, config)?;
        decay.rng = rng;
        Ok(decay)
    }

    /// Whether the controller has switched to bold-driver mode.
    pub fn in_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    /// Candidate step sizes, largest first. Leaves `self.eps` at the value
    /// the next retry halves from.
    fn candidates(&mut self, first: bool) -> Vec<f64> {
        let mut max = 2.0 * self.eps;
        if !self.allow_increase && max > self.initial_eps {
            max = self.initial_eps;
        }
        let delta = (max - self.eps / 2.0) / (self.tries - 1) as f64;
        let mut eps = max;
        let mut out = Vec::with_capacity(self.tries);
        for i in 0..self.tries {
            out.push(eps);
            if first {
                eps /= 2.0;
            } else if i != self.tries - 1 {
                eps -= delta;
            }
        }
        self.eps = eps;
        out
    }

    /// Sample loss after one epoch per candidate, evaluated in parallel.
    ///
    /// Every candidate replays the same entry order, drawn from one seed, so
    /// the comparison only varies the step size.
    fn evaluate(&mut self, base: &Factors, candidates: &[f64]) -> Vec<f64> {
        let seed = self.rng.next_u64();
        let data = &self.sample.data;
        let (update, regularize, loss, order) = (&self.update, &self.regularize, &self.loss, self.order);
        candidates
            .par_iter()
            .map(|&eps| {
                let mut trial = base.clone();
                let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
                sgd_epoch(update, regularize, order, data, &mut trial, eps, &mut rng);
                loss.evaluate(&trial, Some(data))
            })
            .collect()
    }

    fn search(&mut self, first: bool, factors: &Factors) -> f64 {
        let base = self.sample.project(factors);
        for _ in 0..MAX_ROUNDS {
            let candidates = self.candidates(first);
            let losses = self.evaluate(&base, &candidates);
            for (eps, loss) in candidates.iter().zip(&losses) {
                debug!(eps, loss, "tried step size");
            }
            if let Some(i) = choose(&losses) {
                return candidates[i];
            }
            warn!(tries = self.tries, "no acceptable step size found; halving and retrying");
            self.eps /= 2.0;
        }
        warn!(eps = self.eps, "giving up on step size search");
        self.eps
    }
}

/// Index of the candidate to accept, if any.
fn choose(losses: &[f64]) -> Option<usize> {
    let (best, best_loss) = losses
        .iter()
        .enumerate()
        .filter(|(_, l)| l.is_finite())
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    if best == 0 {
        return Some(0);
    }
    let larger = losses[best - 1];
    if !larger.is_nan() && larger < best_loss * NEIGHBOUR_TOLERANCE {
        return Some(best);
    }
    // the next-larger step blew up; take the next-smaller one to be safe
    (best + 1 < losses.len()).then_some(best + 1)
}

impl<U: UpdateFn, R: RegularizeFn, L: LossFn> Decay for AutoDecay<U, R, L> {
    fn next(
        &mut self,
        _epoch: usize,
        previous_loss: Option<f64>,
        current_loss: f64,
        factors: &Factors,
    ) -> f64 {
        if self.fallback.is_none() {
            if let Some(prev) = previous_loss {
                if prev < current_loss {
                    info!("falling back to bold driver decay");
                    self.fallback =
                        Some(BoldDriver::with_factors(self.eps, self.increase, self.decrease));
                }
            }
        }
        let eps = match &mut self.fallback {
            Some(bold) => bold.adjust(previous_loss, current_loss),
            None => self.search(previous_loss.is_none(), factors),
        };
        self.eps = eps;
        eps * self.scale_factor
    }
}
