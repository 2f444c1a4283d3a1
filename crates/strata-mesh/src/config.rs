//! Job configuration.
//!
//! Loaded from JSON or built in code with the `with_*` methods. Missing
//! fields take their defaults, so `{}` is a valid single-worker job.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata_sgd::{BalanceCadence, BalancePolicy, DecayConfig, SgdOrder};

use crate::error::MeshError;
use crate::schedule::StratumOrder;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub workers: usize,
    pub tasks_per_worker: usize,
    /// Entry order inside each block.
    pub order: SgdOrder,
    pub stratum_order: StratumOrder,
    pub decay: DecayConfig,
    pub balance: BalancePolicy,
    pub balance_cadence: BalanceCadence,
    pub epochs: usize,
    pub seed: u64,
    /// Extra time granted to every block-moving RPC beyond tarpc's default
    /// deadline.
    pub task_grace_secs: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            tasks_per_worker: 1,
            order: SgdOrder::WithoutReplacement,
            stratum_order: StratumOrder::Fixed,
            decay: DecayConfig::default(),
            balance: BalancePolicy::None,
            balance_cadence: BalanceCadence::Never,
            epochs: 10,
            seed: 0,
            task_grace_secs: 60,
        }
    }
}

impl JobConfig {
    pub fn from_json(text: &str) -> Result<Self, MeshError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, MeshError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Number of row (and column) blocks.
    pub fn d(&self) -> usize {
        self.workers * self.tasks_per_worker
    }

    pub fn task_grace(&self) -> Duration {
        Duration::from_secs(self.task_grace_secs)
    }

    pub fn validate(&self) -> Result<(), MeshError> {
        if self.workers == 0 || self.tasks_per_worker == 0 {
            return Err(MeshError::Config(format!(
                "need at least one worker and one task per worker, got {} x {}",
                self.workers, self.tasks_per_worker
            )));
        }
        if self.balance_cadence == BalanceCadence::Every(0) {
            return Err(MeshError::Config("balance cadence of 0 epochs".into()));
        }
        self.decay.validate()?;
        Ok(())
    }

    pub fn with_workers(mut self, workers: usize, tasks_per_worker: usize) -> Self {
        self.workers = workers;
        self.tasks_per_worker = tasks_per_worker;
        self
    }

    pub fn with_order(mut self, order: SgdOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_stratum_order(mut self, order: StratumOrder) -> Self {
        self.stratum_order = order;
        self
    }

    pub fn with_decay(mut self, decay: DecayConfig) -> Self {
        self.decay = decay;
        self
    }

    pub fn with_balance(mut self, policy: BalancePolicy, cadence: BalanceCadence) -> Self {
        self.balance = policy;
        self.balance_cadence = cadence;
        self
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_task_grace(mut self, grace: Duration) -> Self {
        self.task_grace_secs = grace.as_secs();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_is_default() {
        assert_eq!(JobConfig::from_json("{}").unwrap(), JobConfig::default());
    }

    #[test]
    fn parses_nested_policies() {
        let json = r#"{
            "workers": 4,
            "tasks_per_worker": 2,
            "order": "with_replacement",
            "stratum_order": "random_latin",
            "decay": { "policy": "sequential", "eps": 0.1, "big_a": 10.0, "alpha": 0.6 },
            "balance": "nzl2_optimal",
            "balance_cadence": { "every": 3 },
            "seed": 7
        }"#;
        let c = JobConfig::from_json(json).unwrap();
        assert_eq!(c.d(), 8);
        assert_eq!(c.order, SgdOrder::WithReplacement);
        assert_eq!(c.stratum_order, StratumOrder::RandomLatin);
        assert_eq!(c.decay, DecayConfig::Sequential { eps: 0.1, big_a: 10.0, alpha: 0.6 });
        assert_eq!(c.balance, BalancePolicy::Nzl2Optimal);
        assert_eq!(c.balance_cadence, BalanceCadence::Every(3));
        assert_eq!(c.epochs, 10);
    }

    #[test]
    fn bold_driver_factors_default() {
        let c = JobConfig::from_json(r#"{ "decay": { "policy": "bold_driver", "eps": 0.2 } }"#).unwrap();
        assert_eq!(c.decay, DecayConfig::BoldDriver { eps: 0.2, increase: 1.05, decrease: 0.5 });
    }

    #[test]
    fn auto_decay_from_json() {
        let c = JobConfig::from_json(
            r#"{ "decay": { "policy": "auto", "eps": 0.05, "tries": 4, "sample_size": 200 } }"#,
        )
        .unwrap();
        match c.decay {
            DecayConfig::Auto(auto) => {
                assert_eq!(auto.tries, 4);
                assert_eq!(auto.sample_size, 200);
            }
            other => panic!("unexpected decay {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(JobConfig::from_json(r#"{ "workers": 0 }"#), Err(MeshError::Config(_))));
        assert!(matches!(
            JobConfig::from_json(r#"{ "balance_cadence": { "every": 0 } }"#),
            Err(MeshError::Config(_))
        ));
        assert!(matches!(
            JobConfig::from_json(r#"{ "decay": { "policy": "constant", "eps": -1.0 } }"#),
            Err(MeshError::Sgd(_))
        ));
        assert!(matches!(JobConfig::from_json("{ not json"), Err(MeshError::Serde(_))));
    }

    #[test]
    fn grouped_order_and_grace_from_json() {
        let c = JobConfig::from_json(r#"{ "stratum_order": "co_wor", "task_grace_secs": 5, "epochs": 3 }"#)
            .unwrap();
        assert_eq!(c.stratum_order, StratumOrder::CoWor);
        assert_eq!(c.task_grace(), Duration::from_secs(5));
        assert_eq!(c.epochs, 3);
    }

    #[test]
    fn json_round_trip() {
        let c = JobConfig::default().with_workers(3, 2).with_seed(11);
        assert_eq!(JobConfig::from_json(&c.to_json().unwrap()).unwrap(), c);
    }
}
