//! Loss terms of one translation direction.
//!
//! Critic logits are "fakeness" scores: the critic pushes real pairs toward
//! negative logits and fakes toward positive ones, while the generator
//! pushes its own fakes toward negative logits.

use serde::Serialize;
use tch::{Kind, Tensor};

use crate::config::LossWeights;
use crate::error::{Error, Result};
use crate::pix2pix::Pix2PixOutput;

pub fn gen_loss_adv(y_fake_gen: &Tensor, weights: &LossWeights) -> Tensor {
    y_fake_gen.softplus().mean(Kind::Float) * weights.adv_weight
}

/// Mean absolute error between a round trip and the image it started from.
pub fn gen_loss_rec(reconstruction: &Tensor, original: &Tensor, weights: &LossWeights) -> Tensor {
    (reconstruction - original).abs().mean(Kind::Float) * weights.rec_weight
}

pub fn dis_loss_real(y_real_dis: &Tensor) -> Tensor {
    y_real_dis.softplus().mean(Kind::Float)
}

pub fn dis_loss_fake(y_fake_dis: &Tensor) -> Tensor {
    (-y_fake_dis).softplus().mean(Kind::Float)
}

/// The four scalar loss tensors of one direction, still attached to their
/// graphs.
pub struct LossTerms {
    pub adv: Tensor,
    pub rec: Tensor,
    pub real: Tensor,
    pub fake: Tensor,
}

impl LossTerms {
    pub fn compute(output: &Pix2PixOutput, reconstruction: &Tensor, original: &Tensor, weights: &LossWeights) -> Self {
        LossTerms {
            adv: gen_loss_adv(&output.y_fake_gen, weights),
            rec: gen_loss_rec(reconstruction, original, weights),
            real: dis_loss_real(&output.y_real_dis),
            fake: dis_loss_fake(&output.y_fake_dis),
        }
    }

    /// What the generator minimizes.
    pub fn generator(&self) -> Tensor {
        &self.adv + &self.rec
    }

    /// What the discriminator minimizes.
    pub fn discriminator(&self) -> Tensor {
        &self.real + &self.fake
    }

    /// Reads the scalars, failing on the first NaN or infinity. `gen` and
    /// `dis` name the models in the error, e.g. `gen_up` / `dis_up`.
    pub fn values(&self, gen: &str, dis: &str) -> Result<DirectionLosses> {
        let read = |model: &str, key: &str, t: &Tensor| {
            let value = t.double_value(&[]);
            if value.is_finite() {
                Ok(value)
            } else {
                Err(Error::NonFiniteLoss {
                    name: format!("{model}/{key}"),
                    value,
                })
            }
        };
        Ok(DirectionLosses {
            loss_adv: read(gen, "loss_adv", &self.adv)?,
            loss_rec: read(gen, "loss_rec", &self.rec)?,
            loss_real: read(dis, "loss_real", &self.real)?,
            loss_fake: read(dis, "loss_fake", &self.fake)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DirectionLosses {
    pub loss_adv: f64,
    pub loss_rec: f64,
    pub loss_real: f64,
    pub loss_fake: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn scalar(t: Tensor) -> f64 {
        t.double_value(&[])
    }

    #[test]
    fn softplus_terms_at_zero_are_ln2() {
        let zeros = Tensor::zeros([1, 1, 4, 4], (Kind::Float, Device::Cpu));
        let ln2 = std::f64::consts::LN_2;
        let weights = LossWeights { adv_weight: 2.0, rec_weight: 1.0 };
        assert!((scalar(dis_loss_real(&zeros)) - ln2).abs() < 1e-6);
        assert!((scalar(dis_loss_fake(&zeros)) - ln2).abs() < 1e-6);
        assert!((scalar(gen_loss_adv(&zeros, &weights)) - 2.0 * ln2).abs() < 1e-6);
    }

    #[test]
    fn critic_losses_point_in_opposite_directions() {
        let high = Tensor::full([1, 1, 2, 2], 5.0, (Kind::Float, Device::Cpu));
        assert!(scalar(dis_loss_real(&high)) > 4.9);
        assert!(scalar(dis_loss_fake(&high)) < 0.01);
    }

    #[test]
    fn reconstruction_is_weighted_l1() {
        let a = Tensor::zeros([1, 2, 2, 2], (Kind::Float, Device::Cpu));
        let b = Tensor::full([1, 2, 2, 2], 0.5, (Kind::Float, Device::Cpu));
        let loss = scalar(gen_loss_rec(&a, &b, &LossWeights::default()));
        assert!((loss - 50.0).abs() < 1e-4);
    }
}
