use pix2pix_cycle::{
    CycleUpdater, ExecutionContext, FixedSource, MemorySink, NetConfig, Pix2Pix, Role, StepReport, UpdaterConfig,
};
use tch::{Device, Kind, Tensor};

/// A deterministic 32x32 RGBA tile with values in [-1, 1].
fn tile() -> Tensor {
    let xs = Tensor::arange(4 * 32 * 32, (Kind::Float, Device::Cpu)).view([4, 32, 32]);
    xs.remainder(7.0) / 3.0 - 1.0
}

fn updater() -> CycleUpdater {
    let ctx = ExecutionContext::cpu().seeded(42);
    let net = NetConfig::new(64, 4, 4, 4);
    let upscaler = Pix2Pix::new(&ctx, "up", net).unwrap();
    let downscaler = Pix2Pix::new(&ctx, "down", net).unwrap();
    CycleUpdater::new(
        ctx,
        UpdaterConfig::default(),
        upscaler,
        downscaler,
        Box::new(FixedSource::from_tile("trainA", &tile(), 1)),
        Box::new(FixedSource::from_tile("trainB", &tile(), 1)),
    )
    .unwrap()
}

fn assert_finite(report: &StepReport) {
    for (key, value) in report.values() {
        assert!(value.is_finite(), "{key} = {value}");
    }
}

#[test]
fn one_step_advances_every_optimizer_once() {
    let mut updater = updater();
    let mut sink = MemorySink::default();
    let report = updater.update(&mut sink).unwrap();

    assert_finite(&report);
    assert_eq!(report.values().len(), 8);
    for role in Role::ALL {
        assert_eq!(updater.optimizers().get(role).iteration(), 1, "{role}");
    }
    assert_eq!(updater.iteration(), 1);
    assert_eq!(sink.records.len(), 1);
    assert_eq!(sink.records[0].values, report.values());
}

#[test]
fn overfitting_one_tile_reduces_reconstruction_loss() {
    let mut updater = updater();
    let mut sink = MemorySink::default();

    let first = updater.update(&mut sink).unwrap();
    assert_finite(&first);
    let mut last = Vec::new();
    for step in 1..200 {
        let report = updater.update(&mut sink).unwrap();
        assert_finite(&report);
        if step >= 190 {
            last.push(report.reconstruction());
        }
    }

    let tail = last.iter().sum::<f64>() / last.len() as f64;
    assert!(
        tail < first.reconstruction(),
        "reconstruction went from {} to {tail}",
        first.reconstruction()
    );
    for role in Role::ALL {
        assert_eq!(updater.optimizers().get(role).iteration(), 200);
    }
}
