use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Construction parameters shared by a generator/discriminator pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetConfig {
    /// Side length of the square working images.
    pub side: i64,
    pub in_ch: i64,
    pub out_ch: i64,
    /// Base hidden width; every stage width is a multiple of it.
    pub base_ch: i64,
}

impl NetConfig {
    pub fn new(side: i64, in_ch: i64, out_ch: i64, base_ch: i64) -> Self {
        NetConfig { side, in_ch, out_ch, base_ch }
    }

    pub fn validate(&self) -> Result<()> {
        if self.side <= 0 || self.in_ch <= 0 || self.out_ch <= 0 {
            return Err(Error::Config(format!(
                "side and channel counts must be positive, got {self:?}"
            )));
        }
        if self.base_ch < 2 || self.base_ch % 2 != 0 {
            return Err(Error::Config(format!(
                "base_ch must be an even number >= 2, got {}",
                self.base_ch
            )));
        }
        Ok(())
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig::new(64, 4, 4, 64)
    }
}

/// Adam hyperparameters plus the L2 weight decay hook rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    pub alpha: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        AdamConfig {
            alpha: 2e-4,
            beta1: 0.5,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 1e-5,
        }
    }
}

/// Scales of the two generator loss terms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossWeights {
    pub adv_weight: f64,
    pub rec_weight: f64,
}

impl Default for LossWeights {
    fn default() -> Self {
        LossWeights {
            adv_weight: 1.0,
            rec_weight: 100.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UpdaterConfig {
    pub batch_size: i64,
    pub weights: LossWeights,
    pub adam: AdamConfig,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        UpdaterConfig {
            batch_size: 1,
            weights: LossWeights::default(),
            adam: AdamConfig::default(),
        }
    }
}

/// Length of a run and how often its side effects fire, in iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainerConfig {
    pub iterations: u64,
    pub snapshot_interval: u64,
    pub preview_interval: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        TrainerConfig {
            iterations: 10000,
            snapshot_interval: 1000,
            preview_interval: 100,
        }
    }
}
