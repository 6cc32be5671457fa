//! One step of cycle-consistent pix2pix training.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use tch::Tensor;
use tracing::{debug, error};

use crate::config::UpdaterConfig;
use crate::context::ExecutionContext;
use crate::data::{DataSource, PairedBatch};
use crate::error::{Error, Result};
use crate::loss::{DirectionLosses, LossTerms};
use crate::metrics::{MetricsRecord, MetricsSink};
use crate::optim::Adam;
use crate::pix2pix::Pix2Pix;

/// The four trainable sub-models, named the way metrics and checkpoint
/// files refer to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    GenUp,
    DisUp,
    GenDown,
    DisDown,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::GenUp, Role::DisUp, Role::GenDown, Role::DisDown];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::GenUp => "gen_up",
            Role::DisUp => "dis_up",
            Role::GenDown => "gen_down",
            Role::DisDown => "dis_down",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct Optimizers {
    pub gen_up: Adam,
    pub dis_up: Adam,
    pub gen_down: Adam,
    pub dis_down: Adam,
}

impl Optimizers {
    pub fn get(&self, role: Role) -> &Adam {
        match role {
            Role::GenUp => &self.gen_up,
            Role::DisUp => &self.dis_up,
            Role::GenDown => &self.gen_down,
            Role::DisDown => &self.dis_down,
        }
    }

    pub(crate) fn get_mut(&mut self, role: Role) -> &mut Adam {
        match role {
            Role::GenUp => &mut self.gen_up,
            Role::DisUp => &mut self.dis_up,
            Role::GenDown => &mut self.gen_down,
            Role::DisDown => &mut self.dis_down,
        }
    }

    fn all_mut(&mut self) -> [&mut Adam; 4] {
        [&mut self.gen_up, &mut self.dis_up, &mut self.gen_down, &mut self.dis_down]
    }
}

/// Scalar losses of one completed step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StepReport {
    pub iteration: u64,
    pub epoch: u64,
    pub up: DirectionLosses,
    pub down: DirectionLosses,
}

impl StepReport {
    /// `gen_up/loss_adv`, `dis_down/loss_fake`, ... to value.
    pub fn values(&self) -> BTreeMap<String, f64> {
        let mut values = BTreeMap::new();
        for (gen, dis, losses) in [("gen_up", "dis_up", &self.up), ("gen_down", "dis_down", &self.down)] {
            values.insert(format!("{gen}/loss_adv"), losses.loss_adv);
            values.insert(format!("{gen}/loss_rec"), losses.loss_rec);
            values.insert(format!("{dis}/loss_real"), losses.loss_real);
            values.insert(format!("{dis}/loss_fake"), losses.loss_fake);
        }
        values
    }

    /// Reconstruction loss summed over both directions.
    pub fn reconstruction(&self) -> f64 {
        self.up.loss_rec + self.down.loss_rec
    }
}

/// Trains an upscaler and a downscaler against each other's frozen
/// generators.
pub struct CycleUpdater {
    ctx: ExecutionContext,
    config: UpdaterConfig,
    pub(crate) upscaler: Pix2Pix,
    pub(crate) downscaler: Pix2Pix,
    pub(crate) optimizers: Optimizers,
    pub(crate) source_up: Box<dyn DataSource>,
    pub(crate) source_down: Box<dyn DataSource>,
    pub(crate) iteration: u64,
}

impl CycleUpdater {
    pub fn new(
        ctx: ExecutionContext,
        config: UpdaterConfig,
        upscaler: Pix2Pix,
        downscaler: Pix2Pix,
        source_up: Box<dyn DataSource>,
        source_down: Box<dyn DataSource>,
    ) -> Result<Self> {
        let (up, down) = (upscaler.config(), downscaler.config());
        if up.side != down.side || up.out_ch != down.in_ch || down.out_ch != up.in_ch {
            return Err(Error::Config(format!(
                "upscaler {up:?} and downscaler {down:?} cannot be composed into a cycle"
            )));
        }
        if config.batch_size < 1 {
            return Err(Error::Config(format!(
                "batch size must be positive, got {}",
                config.batch_size
            )));
        }
        let optimizers = Optimizers {
            gen_up: Adam::new(upscaler.generator(), config.adam),
            dis_up: Adam::new(upscaler.discriminator(), config.adam),
            gen_down: Adam::new(downscaler.generator(), config.adam),
            dis_down: Adam::new(downscaler.discriminator(), config.adam),
        };
        Ok(CycleUpdater {
            ctx,
            config,
            upscaler,
            downscaler,
            optimizers,
            source_up,
            source_down,
            iteration: 0,
        })
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Epoch of the upscale stream, which drives the run length.
    pub fn epoch(&self) -> u64 {
        self.source_up.epoch()
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    pub fn upscaler(&self) -> &Pix2Pix {
        &self.upscaler
    }

    pub fn downscaler(&self) -> &Pix2Pix {
        &self.downscaler
    }

    pub fn optimizers(&self) -> &Optimizers {
        &self.optimizers
    }

    /// Runs one step and reports its losses to `metrics`.
    ///
    /// The step is all-or-nothing: every loss and every gradient is checked
    /// for NaN/Inf before the first optimizer update, so a failure leaves
    /// parameters and optimizer moments exactly as they were.
    pub fn update(&mut self, metrics: &mut dyn MetricsSink) -> Result<StepReport> {
        let batch_up = next_batch(self.source_up.as_mut(), &self.ctx, self.config.batch_size)?;
        let batch_down = next_batch(self.source_down.as_mut(), &self.ctx, self.config.batch_size)?;

        self.upscaler.sync_frozen()?;
        self.downscaler.sync_frozen()?;

        let out_up = self.upscaler.forward(&batch_up.condition, &batch_up.target)?;
        let out_down = self.downscaler.forward(&batch_down.condition, &batch_down.target)?;

        let rec_up = self.downscaler.fake(&out_up.x_fake_gen, true)?;
        let rec_down = self.upscaler.fake(&out_down.x_fake_gen, true)?;

        let weights = &self.config.weights;
        let terms_up = LossTerms::compute(&out_up, &rec_up, &batch_up.condition, weights);
        let terms_down = LossTerms::compute(&out_down, &rec_down, &batch_down.condition, weights);
        let report = StepReport {
            iteration: self.iteration + 1,
            epoch: self.epoch(),
            up: terms_up.values(Role::GenUp.as_str(), Role::DisUp.as_str())?,
            down: terms_down.values(Role::GenDown.as_str(), Role::DisDown.as_str())?,
        };

        for optimizer in self.optimizers.all_mut() {
            optimizer.zero_grad();
        }
        terms_up.generator().backward();
        terms_up.discriminator().backward();
        terms_down.generator().backward();
        terms_down.discriminator().backward();

        for role in Role::ALL {
            if let Err(err) = self.optimizers.get(role).check_gradients() {
                error!(%role, iteration = report.iteration, "aborting step: {err}");
                return Err(err);
            }
        }
        for optimizer in self.optimizers.all_mut() {
            optimizer.step();
        }
        self.iteration += 1;
        debug!(iteration = self.iteration, rec = report.reconstruction(), "step done");

        metrics.record(&MetricsRecord {
            iteration: report.iteration,
            epoch: report.epoch,
            values: report.values(),
        })?;
        Ok(report)
    }
}

/// Draws a batch, validates its layout and moves it to the context device.
fn next_batch(source: &mut dyn DataSource, ctx: &ExecutionContext, batch_size: i64) -> Result<PairedBatch> {
    let batch = source.next_batch()?;
    for (role, t) in [("condition", &batch.condition), ("target", &batch.target)] {
        let size = t.size();
        if size.len() != 4 || size[0] != batch_size {
            return Err(Error::DataSource {
                name: source.name().to_string(),
                reason: format!("{role} batch has shape {size:?}, expected {batch_size} images"),
            });
        }
    }
    let to_device = |t: &Tensor| t.to_device(ctx.device());
    Ok(PairedBatch {
        condition: to_device(&batch.condition),
        target: to_device(&batch.target),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetConfig;
    use crate::data::FixedSource;
    use crate::metrics::MemorySink;
    use tch::{Device, Kind};

    fn tile() -> Tensor {
        Tensor::rand([4, 32, 32], (Kind::Float, Device::Cpu)) * 2.0 - 1.0
    }

    fn updater(source_up: Box<dyn DataSource>) -> CycleUpdater {
        let ctx = ExecutionContext::cpu();
        let net = NetConfig::new(64, 4, 4, 2);
        CycleUpdater::new(
            ctx,
            UpdaterConfig::default(),
            Pix2Pix::new(&ctx, "up", net).unwrap(),
            Pix2Pix::new(&ctx, "down", net).unwrap(),
            source_up,
            Box::new(FixedSource::from_tile("b", &tile(), 1)),
        )
        .unwrap()
    }

    #[test]
    fn reports_eight_keyed_losses() {
        let mut updater = updater(Box::new(FixedSource::from_tile("a", &tile(), 1)));
        let mut sink = MemorySink::default();
        let report = updater.update(&mut sink).unwrap();

        let keys: Vec<String> = report.values().into_keys().collect();
        assert_eq!(keys.len(), 8);
        assert!(keys.contains(&"gen_up/loss_adv".to_string()));
        assert!(keys.contains(&"dis_down/loss_fake".to_string()));
        assert_eq!(sink.records.len(), 1);
        assert_eq!(sink.records[0].iteration, 1);
        assert_eq!(updater.iteration(), 1);
    }

    #[test]
    fn eval_output_stays_finite_after_single_image_steps() {
        let mut updater = updater(Box::new(FixedSource::from_tile("a", &tile(), 1)));
        let mut sink = MemorySink::default();
        updater.update(&mut sink).unwrap();
        updater.update(&mut sink).unwrap();

        let xs = upscale_tile();
        for model in [updater.upscaler(), updater.downscaler()] {
            let ys = model.generator().generate(&xs, false);
            assert_eq!(ys.isfinite().all().int64_value(&[]), 1);
            for (name, t) in model.generator().variables() {
                assert_eq!(t.isfinite().all().int64_value(&[]), 1, "{name}");
            }
        }
    }

    #[test]
    fn synced_mirrors_match_trained_generators() {
        let mut updater = updater(Box::new(FixedSource::from_tile("a", &tile(), 1)));
        updater.update(&mut MemorySink::default()).unwrap();
        updater.upscaler.sync_frozen().unwrap();
        updater.downscaler.sync_frozen().unwrap();

        let xs = upscale_tile();
        for model in [updater.upscaler(), updater.downscaler()] {
            let trained = model.generator().generate(&xs, false);
            let mirrored = model.fake(&xs, false).unwrap();
            assert!(mirrored.equal(&trained));
        }
    }

    fn upscale_tile() -> Tensor {
        crate::data::upscale_nearest(&tile()).unsqueeze(0)
    }

    #[test]
    fn wrong_batch_size_is_fatal() {
        let source = FixedSource::from_tile("a", &tile(), 2);
        let mut updater = updater(Box::new(source));
        let before: Vec<Tensor> = updater
            .upscaler()
            .generator()
            .parameters()
            .iter()
            .map(|(_, p)| p.copy())
            .collect();
        assert!(matches!(updater.update(&mut MemorySink::default()), Err(Error::DataSource { .. })));
        assert_eq!(updater.iteration(), 0);
        for ((_, p), b) in updater.upscaler().generator().parameters().iter().zip(&before) {
            assert!(p.equal(b));
        }
    }

    #[test]
    fn nan_input_fails_without_touching_state() {
        let nan = Tensor::full([4, 32, 32], f64::NAN, (Kind::Float, Device::Cpu));
        let mut updater = updater(Box::new(FixedSource::from_tile("a", &nan, 1)));
        let err = updater.update(&mut MemorySink::default()).unwrap_err();
        assert!(matches!(err, Error::NonFiniteLoss { .. }));
        for role in Role::ALL {
            assert_eq!(updater.optimizers().get(role).iteration(), 0);
        }
    }

    #[test]
    fn rejects_incompatible_directions() {
        let ctx = ExecutionContext::cpu();
        let result = CycleUpdater::new(
            ctx,
            UpdaterConfig::default(),
            Pix2Pix::new(&ctx, "up", NetConfig::new(64, 4, 3, 2)).unwrap(),
            Pix2Pix::new(&ctx, "down", NetConfig::new(64, 4, 4, 2)).unwrap(),
            Box::new(FixedSource::from_tile("a", &tile(), 1)),
            Box::new(FixedSource::from_tile("b", &tile(), 1)),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
