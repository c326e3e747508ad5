//! Learning-rate schedules, stepped once per batch.

use crate::error::{Result, TrainError};
use crate::nn::optim::Optimizer;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Learning-rate schedule with serializable progress.
pub trait Scheduler: Send {
    /// Advance one step and write the new rate into `optimizer`.
    fn step(&mut self, optimizer: &mut dyn Optimizer);

    fn state_dict(&self) -> Result<serde_json::Value>;

    fn load_state_dict(&mut self, state: &serde_json::Value) -> Result<()>;
}

/// Shape of the decay curve.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LrPolicy {
    #[default]
    Constant,
    /// Multiply by `gamma` every `step_size` steps.
    Step { step_size: u64, gamma: f64 },
    /// Multiply by `gamma` every step.
    Exponential { gamma: f64 },
    /// Half-cosine from the base rate down to `min_lr` over `total_steps`.
    Cosine { total_steps: u64, min_lr: f64 },
}

/// A schedule computing the rate from the base rate and the step count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LrScheduler {
    policy: LrPolicy,
    base_lr: f64,
    last_step: u64,
}

impl LrScheduler {
    pub fn new(policy: LrPolicy, base_lr: f64) -> Self {
        Self {
            policy,
            base_lr,
            last_step: 0,
        }
    }

    pub fn constant(base_lr: f64) -> Self {
        Self::new(LrPolicy::Constant, base_lr)
    }

    pub fn last_step(&self) -> u64 {
        self.last_step
    }

    /// Rate after `step` steps.
    pub fn rate_at(&self, step: u64) -> f64 {
        match self.policy {
            LrPolicy::Constant => self.base_lr,
            LrPolicy::Step { step_size, gamma } => {
                let decays = step / step_size.max(1);
                self.base_lr * gamma.powf(decays as f64)
            }
            LrPolicy::Exponential { gamma } => self.base_lr * gamma.powf(step as f64),
            LrPolicy::Cosine {
                total_steps,
                min_lr,
            } => {
                let total = total_steps.max(1);
                let progress = step.min(total) as f64 / total as f64;
                min_lr + (self.base_lr - min_lr) * (1.0 + (PI * progress).cos()) / 2.0
            }
        }
    }
}

impl Scheduler for LrScheduler {
    fn step(&mut self, optimizer: &mut dyn Optimizer) {
        self.last_step += 1;
        optimizer.set_learning_rate(self.rate_at(self.last_step));
    }

    fn state_dict(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn load_state_dict(&mut self, state: &serde_json::Value) -> Result<()> {
        *self = LrScheduler::deserialize(state)
            .map_err(|e| TrainError::corrupt(format!("scheduler state: {e}")))?;
        Ok(())
    }
}
