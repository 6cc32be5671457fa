use tch::Tensor;
use tracing::debug;

use crate::config::NetConfig;
use crate::context::ExecutionContext;
use crate::discriminator::Discriminator;
use crate::error::{Error, Result};
use crate::generator::Generator;
use crate::model::{Frozen, Trainable};

/// Everything one direction's losses need, from a single forward pass.
pub struct Pix2PixOutput {
    /// Generator output; gradients reach the generator only.
    pub x_fake_gen: Tensor,
    /// Frozen critic's score of `x_fake_gen`.
    pub y_fake_gen: Tensor,
    /// Critic's score of the real pair.
    pub y_real_dis: Tensor,
    /// Critic's score of a frozen-generator fake.
    pub y_fake_dis: Tensor,
}

/// A conditional GAN for one translation direction: a trainable generator
/// and discriminator plus frozen mirrors of both.
pub struct Pix2Pix {
    config: NetConfig,
    gen: Trainable<Generator>,
    dis: Trainable<Discriminator>,
    gen_frozen: Frozen<Generator>,
    dis_frozen: Frozen<Discriminator>,
}

impl Pix2Pix {
    /// `name` is the direction suffix used in model names, e.g. `up` gives
    /// `gen_up` and `dis_up`.
    pub fn new(ctx: &ExecutionContext, name: &str, config: NetConfig) -> Result<Pix2Pix> {
        let gen = Trainable::<Generator>::new(ctx, &format!("gen_{name}"), config)?;
        let dis = Trainable::<Discriminator>::new(ctx, &format!("dis_{name}"), config)?;
        let gen_frozen = gen.mirror()?;
        let dis_frozen = dis.mirror()?;
        debug!(direction = name, ?config, "built pix2pix");
        Ok(Pix2Pix {
            config,
            gen,
            dis,
            gen_frozen,
            dis_frozen,
        })
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn generator(&self) -> &Trainable<Generator> {
        &self.gen
    }

    pub fn discriminator(&self) -> &Trainable<Discriminator> {
        &self.dis
    }

    /// Copies the trainable weights into both mirrors. Called once at the
    /// start of every step.
    pub fn sync_frozen(&mut self) -> Result<()> {
        self.gen_frozen.sync(&self.gen)?;
        self.dis_frozen.sync(&self.dis)?;
        Ok(())
    }

    /// Training-mode forward pass over a `(condition, real)` batch.
    pub fn forward(&self, x_in: &Tensor, x_real: &Tensor) -> Result<Pix2PixOutput> {
        let batch = self.check(x_in, "condition", self.config.in_ch)?;
        if self.check(x_real, "real", self.config.out_ch)? != batch {
            return Err(Error::shape(
                "real",
                format!("batch of {batch} to match the condition"),
                x_real.size(),
            ));
        }

        let x_fake_gen = self.gen.generate(x_in, true);
        let y_fake_gen = self.dis_frozen.discriminate(x_in, &x_fake_gen, true);

        let x_fake = self.gen_frozen.generate(x_in, true);
        let y_real_dis = self.dis.discriminate(x_in, x_real, true);
        let y_fake_dis = self.dis.discriminate(x_in, &x_fake, true);

        Ok(Pix2PixOutput {
            x_fake_gen,
            y_fake_gen,
            y_real_dis,
            y_fake_dis,
        })
    }

    /// Frozen generator output: differentiable with respect to `x_in`, never
    /// with respect to this model's weights.
    pub fn fake(&self, x_in: &Tensor, train: bool) -> Result<Tensor> {
        self.check(x_in, "condition", self.config.in_ch)?;
        Ok(self.gen_frozen.generate(x_in, train))
    }

    /// Checks `[N, channels, side, side]` with `N >= 1`; returns `N`.
    fn check(&self, xs: &Tensor, role: &str, channels: i64) -> Result<i64> {
        let side = self.config.side;
        match xs.size().as_slice() {
            &[n, c, h, w] if n >= 1 && c == channels && h == side && w == side => Ok(n),
            _ => Err(Error::shape(
                role,
                format!("[N, {channels}, {side}, {side}]"),
                xs.size(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AdamConfig, LossWeights};
    use crate::loss::{dis_loss_fake, dis_loss_real, gen_loss_adv};
    use crate::model::Network;
    use crate::optim::Adam;
    use tch::{Device, Kind};

    fn config() -> NetConfig {
        NetConfig::new(64, 4, 4, 2)
    }

    fn batch() -> (Tensor, Tensor) {
        let opts = (Kind::Float, Device::Cpu);
        (Tensor::rand([1, 4, 64, 64], opts) * 2.0 - 1.0, Tensor::rand([1, 4, 64, 64], opts) * 2.0 - 1.0)
    }

    fn snapshot<N: Network>(model: &Trainable<N>) -> Vec<Tensor> {
        model.parameters().iter().map(|(_, p)| p.copy()).collect()
    }

    fn untouched<N: Network>(model: &Trainable<N>, before: &[Tensor]) -> bool {
        model.parameters().iter().zip(before).all(|((_, p), b)| {
            let grad = p.grad();
            p.equal(b) && (!grad.defined() || grad.abs().sum(Kind::Float).double_value(&[]) == 0.0)
        })
    }

    #[test]
    fn adversarial_generator_loss_leaves_discriminator_alone() {
        let model = Pix2Pix::new(&ExecutionContext::cpu(), "up", config()).unwrap();
        let mut dis_opt = Adam::new(model.discriminator(), AdamConfig::default());
        let mut gen_opt = Adam::new(model.generator(), AdamConfig::default());
        let dis_before = snapshot(model.discriminator());
        let gen_before = snapshot(model.generator());

        let (x_in, x_real) = batch();
        let out = model.forward(&x_in, &x_real).unwrap();
        dis_opt.zero_grad();
        gen_opt.zero_grad();
        gen_loss_adv(&out.y_fake_gen, &LossWeights::default()).backward();
        dis_opt.step();
        gen_opt.step();

        assert!(untouched(model.discriminator(), &dis_before));
        assert!(!untouched(model.generator(), &gen_before));
    }

    #[test]
    fn discriminator_losses_leave_generator_alone() {
        let model = Pix2Pix::new(&ExecutionContext::cpu(), "up", config()).unwrap();
        let mut gen_opt = Adam::new(model.generator(), AdamConfig::default());
        let gen_before = snapshot(model.generator());

        let (x_in, x_real) = batch();
        let out = model.forward(&x_in, &x_real).unwrap();
        gen_opt.zero_grad();
        (dis_loss_real(&out.y_real_dis) + dis_loss_fake(&out.y_fake_dis)).backward();
        gen_opt.step();

        assert!(untouched(model.generator(), &gen_before));
        let dis_grads = model
            .discriminator()
            .parameters()
            .iter()
            .any(|(_, p)| p.grad().defined());
        assert!(dis_grads);
    }

    #[test]
    fn frozen_generator_is_idempotent() {
        let model = Pix2Pix::new(&ExecutionContext::cpu(), "down", config()).unwrap();
        let (x_in, _) = batch();
        let a = model.fake(&x_in, false).unwrap();
        let b = model.fake(&x_in, false).unwrap();
        assert!(a.equal(&b));
        assert!(!a.requires_grad());
    }

    #[test]
    fn frozen_discriminator_is_idempotent() {
        let model = Pix2Pix::new(&ExecutionContext::cpu(), "down", config()).unwrap();
        let (x_in, x_real) = batch();
        let a = model.dis_frozen.discriminate(&x_in, &x_real, false);
        let b = model.dis_frozen.discriminate(&x_in, &x_real, false);
        assert!(a.equal(&b));
    }

    #[test]
    fn zero_image_round_trip_is_finite() {
        let ctx = ExecutionContext::cpu();
        let up = Pix2Pix::new(&ctx, "up", config()).unwrap();
        let down = Pix2Pix::new(&ctx, "down", config()).unwrap();
        let zeros = Tensor::zeros([1, 4, 64, 64], (Kind::Float, Device::Cpu));

        let there = up.generator().generate(&zeros, true);
        let back = down.fake(&there, true).unwrap();
        assert_eq!(back.size(), vec![1, 4, 64, 64]);
        assert_eq!(back.isfinite().all().int64_value(&[]), 1);

        let again = down.fake(&up.generator().generate(&zeros, false), false).unwrap();
        let again_2 = down.fake(&up.generator().generate(&zeros, false), false).unwrap();
        assert!(again.equal(&again_2));
    }

    #[test]
    fn rejects_mismatched_batches() {
        let model = Pix2Pix::new(&ExecutionContext::cpu(), "up", config()).unwrap();
        let opts = (Kind::Float, Device::Cpu);
        let x_in = Tensor::zeros([1, 4, 64, 64], opts);
        assert!(matches!(model.forward(&x_in, &Tensor::zeros([1, 3, 64, 64], opts)), Err(Error::Shape { .. })));
        assert!(matches!(model.forward(&x_in, &Tensor::zeros([2, 4, 64, 64], opts)), Err(Error::Shape { .. })));
        assert!(model.fake(&Tensor::zeros([1, 4, 32, 32], opts), true).is_err());
    }

    #[test]
    fn rejects_unsupported_side() {
        assert!(Pix2Pix::new(&ExecutionContext::cpu(), "up", NetConfig::new(32, 4, 4, 4)).is_err());
    }
}
