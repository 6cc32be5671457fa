use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tch::{nn, Tensor};
use tracing::info;

use crate::error::{Error, Result};
use crate::model::{Network, Trainable};
use crate::optim::{check_entry, Adam};
use crate::updater::{CycleUpdater, Role};

const ITERATION: &str = "iteration";
const EPOCH_UP: &str = "epoch.up";
const EPOCH_DOWN: &str = "epoch.down";

fn counter(value: u64) -> Tensor {
    Tensor::from_slice(&[value as i64])
}

pub trait CheckpointSink {
    /// One blob per trainable sub-model: weights and optimizer state.
    fn save_models(&mut self, updater: &CycleUpdater) -> Result<()>;

    fn save_snapshot(&mut self, updater: &CycleUpdater) -> Result<()>;
}

/// Writes `{role}_iter_{n}.ot` and `snapshot_iter_{n}.ot` under a directory.
pub struct FileCheckpointer {
    out_dir: PathBuf,
}

impl FileCheckpointer {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        FileCheckpointer { out_dir: out_dir.into() }
    }
}

impl CheckpointSink for FileCheckpointer {
    fn save_models(&mut self, updater: &CycleUpdater) -> Result<()> {
        fs::create_dir_all(&self.out_dir)?;
        for role in Role::ALL {
            let path = self.out_dir.join(format!("{role}_iter_{}.ot", updater.iteration()));
            save_model(updater, role, &path)?;
        }
        Ok(())
    }

    fn save_snapshot(&mut self, updater: &CycleUpdater) -> Result<()> {
        fs::create_dir_all(&self.out_dir)?;
        let path = self.out_dir.join(format!("snapshot_iter_{}.ot", updater.iteration()));
        updater.save_state(&path)?;
        info!(path = %path.display(), "saved snapshot");
        Ok(())
    }
}

fn variables_of(updater: &CycleUpdater, role: Role) -> Vec<(String, Tensor)> {
    match role {
        Role::GenUp => updater.upscaler.generator().variables(),
        Role::DisUp => updater.upscaler.discriminator().variables(),
        Role::GenDown => updater.downscaler.generator().variables(),
        Role::DisDown => updater.downscaler.discriminator().variables(),
    }
}

fn var_store_of(updater: &CycleUpdater, role: Role) -> &nn::VarStore {
    match role {
        Role::GenUp => updater.upscaler.generator().var_store(),
        Role::DisUp => updater.upscaler.discriminator().var_store(),
        Role::GenDown => updater.downscaler.generator().var_store(),
        Role::DisDown => updater.downscaler.discriminator().var_store(),
    }
}

fn model_tensors(updater: &CycleUpdater, role: Role, prefix: &str) -> Vec<(String, Tensor)> {
    let mut named: Vec<(String, Tensor)> = variables_of(updater, role)
        .into_iter()
        .map(|(name, t)| (format!("{prefix}param.{name}"), t))
        .collect();
    named.extend(updater.optimizers.get(role).state_tensors(&format!("{prefix}adam.")));
    named
}

fn save_model(updater: &CycleUpdater, role: Role, path: &Path) -> Result<()> {
    Tensor::save_multi(&model_tensors(updater, role, ""), path)?;
    Ok(())
}

fn load_named(path: &Path, vs: &nn::VarStore) -> Result<HashMap<String, Tensor>> {
    Ok(Tensor::load_multi_with_device(path, vs.device())?.into_iter().collect())
}

fn check_variables(prefix: &str, vs: &nn::VarStore, saved: &HashMap<String, Tensor>, problems: &mut Vec<String>) {
    for (name, tensor) in vs.variables() {
        check_entry(&format!("{prefix}param.{name}"), &tensor, saved, problems);
    }
}

fn copy_variables(prefix: &str, vs: &nn::VarStore, saved: &HashMap<String, Tensor>) {
    tch::no_grad(|| {
        for (name, mut tensor) in vs.variables() {
            if let Some(src) = saved.get(&format!("{prefix}param.{name}")) {
                tensor.copy_(src);
            }
        }
    });
}

impl CycleUpdater {
    pub fn state_tensors(&self) -> Vec<(String, Tensor)> {
        let mut named = vec![
            (ITERATION.to_string(), counter(self.iteration)),
            (EPOCH_UP.to_string(), counter(self.source_up.epoch())),
            (EPOCH_DOWN.to_string(), counter(self.source_down.epoch())),
        ];
        for role in Role::ALL {
            named.extend(model_tensors(self, role, &format!("{role}.")));
        }
        named
    }

    pub fn save_state(&self, path: impl AsRef<Path>) -> Result<()> {
        Tensor::save_multi(&self.state_tensors(), path.as_ref())?;
        Ok(())
    }

    /// Restores a snapshot written by [`CycleUpdater::save_state`].
    ///
    /// Fails with [`Error::CheckpointMismatch`] listing every missing,
    /// unexpected or misshapen entry; nothing is modified in that case.
    pub fn restore_state(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let saved = load_named(path, var_store_of(self, Role::GenUp))?;

        let mut problems = Vec::new();
        let expected = self.state_tensors();
        for (name, tensor) in &expected {
            check_entry(name, tensor, &saved, &mut problems);
        }
        let known: Vec<&str> = expected.iter().map(|(name, _)| name.as_str()).collect();
        let mut unexpected: Vec<&String> = saved.keys().filter(|k| !known.contains(&k.as_str())).collect();
        unexpected.sort();
        problems.extend(unexpected.into_iter().map(|k| format!("unexpected `{k}`")));
        if !problems.is_empty() {
            return Err(Error::CheckpointMismatch(problems));
        }

        for role in Role::ALL {
            let prefix = format!("{role}.");
            copy_variables(&prefix, var_store_of(self, role), &saved);
            self.optimizers.get_mut(role).load_state(&format!("{prefix}adam."), &saved);
        }
        self.iteration = saved[ITERATION].int64_value(&[0]) as u64;
        self.source_up.set_epoch(saved[EPOCH_UP].int64_value(&[0]) as u64);
        self.source_down.set_epoch(saved[EPOCH_DOWN].int64_value(&[0]) as u64);
        self.upscaler.sync_frozen()?;
        self.downscaler.sync_frozen()?;
        info!(path = %path.display(), iteration = self.iteration, epoch = self.epoch(), "restored snapshot");
        Ok(())
    }
}

/// Loads the weights (and, when `optimizer` is given, the optimizer state)
/// of one per-model blob written by [`FileCheckpointer::save_models`].
pub fn load_model<N: Network>(model: &Trainable<N>, optimizer: Option<&mut Adam>, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let vs = model.var_store();
    let saved = load_named(path, vs)?;
    let mut problems = Vec::new();
    check_variables("", vs, &saved, &mut problems);
    if let Some(optimizer) = optimizer.as_deref() {
        optimizer.check_state("adam.", &saved, &mut problems);
    }
    if !problems.is_empty() {
        return Err(Error::CheckpointMismatch(problems));
    }
    copy_variables("", vs, &saved);
    if let Some(optimizer) = optimizer {
        optimizer.load_state("adam.", &saved);
    }
    info!(model = model.name(), path = %path.display(), "loaded weights");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AdamConfig, NetConfig, UpdaterConfig};
    use crate::context::ExecutionContext;
    use crate::data::FixedSource;
    use crate::generator::Generator;
    use crate::metrics::MemorySink;
    use crate::pix2pix::Pix2Pix;
    use tch::{Device, Kind};

    fn updater(base_ch: i64) -> CycleUpdater {
        let ctx = ExecutionContext::cpu();
        let net = NetConfig::new(64, 4, 4, base_ch);
        let tile = Tensor::rand([4, 32, 32], (Kind::Float, Device::Cpu));
        CycleUpdater::new(
            ctx,
            UpdaterConfig::default(),
            Pix2Pix::new(&ctx, "up", net).unwrap(),
            Pix2Pix::new(&ctx, "down", net).unwrap(),
            Box::new(FixedSource::from_tile("a", &tile, 1)),
            Box::new(FixedSource::from_tile("b", &tile, 1)),
        )
        .unwrap()
    }

    #[test]
    fn restore_into_other_architecture_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.ot");
        updater(2).save_state(&path).unwrap();

        let mut other = updater(4);
        let before: Vec<Tensor> = other.state_tensors().iter().map(|(_, t)| t.copy()).collect();
        match other.restore_state(&path) {
            Err(Error::CheckpointMismatch(problems)) => {
                assert!(problems.iter().any(|p| p.contains("gen_up.param.enc0.conv.weight")));
            }
            _ => panic!("expected a checkpoint mismatch"),
        }
        for ((_, after), before) in other.state_tensors().iter().zip(&before) {
            assert!(after.equal(before));
        }
    }

    #[test]
    fn restore_carries_source_epochs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.ot");
        let mut trained = updater(2);
        trained.update(&mut MemorySink::default()).unwrap();
        trained.update(&mut MemorySink::default()).unwrap();
        trained.save_state(&path).unwrap();

        let mut resumed = updater(2);
        resumed.restore_state(&path).unwrap();
        assert_eq!(resumed.epoch(), 2);
        assert_eq!(resumed.source_down.epoch(), 2);

        let mut sink = MemorySink::default();
        resumed.update(&mut sink).unwrap();
        assert_eq!(sink.records[0].iteration, 3);
        assert_eq!(sink.records[0].epoch, 3);
    }

    #[test]
    fn file_checkpointer_writes_every_model() {
        let dir = tempfile::tempdir().unwrap();
        let mut updater = updater(2);
        updater.update(&mut MemorySink::default()).unwrap();
        let mut sink = FileCheckpointer::new(dir.path());
        sink.save_models(&updater).unwrap();
        sink.save_snapshot(&updater).unwrap();
        for role in Role::ALL {
            assert!(dir.path().join(format!("{role}_iter_1.ot")).is_file());
        }
        assert!(dir.path().join("snapshot_iter_1.ot").is_file());

        let ctx = ExecutionContext::cpu();
        let fresh = Trainable::<Generator>::new(&ctx, "gen_up", NetConfig::new(64, 4, 4, 2)).unwrap();
        let mut adam = Adam::new(&fresh, AdamConfig::default());
        load_model(&fresh, Some(&mut adam), dir.path().join("gen_up_iter_1.ot")).unwrap();
        assert_eq!(adam.iteration(), 1);
        for ((_, a), (_, b)) in fresh.variables().iter().zip(updater.upscaler().generator().variables().iter()) {
            assert!(a.equal(b));
        }
    }
}
