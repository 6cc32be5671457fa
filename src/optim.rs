use std::collections::HashMap;

use tch::{Kind, Tensor};

use crate::config::AdamConfig;
use crate::error::{Error, Result};
use crate::model::{Network, Trainable};

struct Slot {
    name: String,
    param: Tensor,
    m: Tensor,
    v: Tensor,
}

/// Adam over one trainable model's parameters with an L2 weight decay hook
/// (`grad += weight_decay * param`) applied before the moment update.
///
/// Moments live in plain tensors rather than inside libtorch's optimizer so
/// they can be inspected, checkpointed and restored exactly.
pub struct Adam {
    model: String,
    config: AdamConfig,
    slots: Vec<Slot>,
    t: u64,
}

impl Adam {
    /// Only a [`Trainable`] can hand out its parameters, so frozen mirrors
    /// can never end up in an optimizer.
    pub fn new<N: Network>(model: &Trainable<N>, config: AdamConfig) -> Self {
        let slots = model
            .parameters()
            .into_iter()
            .map(|(name, param)| Slot {
                m: param.zeros_like().detach(),
                v: param.zeros_like().detach(),
                name,
                param,
            })
            .collect();
        Adam {
            model: model.name().to_string(),
            config,
            slots,
            t: 0,
        }
    }

    /// Number of updates applied so far.
    pub fn iteration(&self) -> u64 {
        self.t
    }

    pub fn config(&self) -> &AdamConfig {
        &self.config
    }

    pub fn zero_grad(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.param.zero_grad();
        }
    }

    /// Fails on the first parameter whose gradient holds a NaN or infinity.
    pub fn check_gradients(&self) -> Result<()> {
        for slot in &self.slots {
            let grad = slot.param.grad();
            if grad.defined() && grad.isfinite().all().int64_value(&[]) == 0 {
                return Err(Error::NonFiniteGradient {
                    model: self.model.clone(),
                    param: slot.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// One update. Parameters without a gradient are left untouched.
    pub fn step(&mut self) {
        self.t += 1;
        let AdamConfig { alpha, beta1, beta2, eps, weight_decay } = self.config;
        let t = self.t as i32;
        let lr = alpha * (1.0 - beta2.powi(t)).sqrt() / (1.0 - beta1.powi(t));
        tch::no_grad(|| {
            for slot in self.slots.iter_mut() {
                let grad = slot.param.grad();
                if !grad.defined() {
                    continue;
                }
                let grad = grad + &slot.param * weight_decay;
                let m = &slot.m + (&grad - &slot.m) * (1.0 - beta1);
                let v = &slot.v + (grad.square() - &slot.v) * (1.0 - beta2);
                let param = &slot.param - &m / (v.sqrt() + eps) * lr;
                slot.m.copy_(&m);
                slot.v.copy_(&v);
                slot.param.copy_(&param);
            }
        });
    }

    /// Moments and counter as named tensors, names prefixed with `prefix`.
    pub fn state_tensors(&self, prefix: &str) -> Vec<(String, Tensor)> {
        let mut named = Vec::with_capacity(2 * self.slots.len() + 1);
        named.push((format!("{prefix}t"), Tensor::from_slice(&[self.t as i64])));
        for slot in &self.slots {
            named.push((format!("{prefix}m.{}", slot.name), slot.m.shallow_clone()));
            named.push((format!("{prefix}v.{}", slot.name), slot.v.shallow_clone()));
        }
        named
    }

    /// Appends to `problems` every expected state entry that is missing or
    /// has the wrong shape in `saved`.
    pub(crate) fn check_state(&self, prefix: &str, saved: &HashMap<String, Tensor>, problems: &mut Vec<String>) {
        for (name, tensor) in self.state_tensors(prefix) {
            check_entry(&name, &tensor, saved, problems);
        }
    }

    /// Copies the state written by [`Adam::state_tensors`]. Call
    /// [`Adam::check_state`] first; entries are assumed present.
    pub(crate) fn load_state(&mut self, prefix: &str, saved: &HashMap<String, Tensor>) {
        if let Some(t) = saved.get(&format!("{prefix}t")) {
            self.t = t.int64_value(&[0]) as u64;
        }
        tch::no_grad(|| {
            for slot in self.slots.iter_mut() {
                if let Some(m) = saved.get(&format!("{prefix}m.{}", slot.name)) {
                    slot.m.copy_(m);
                }
                if let Some(v) = saved.get(&format!("{prefix}v.{}", slot.name)) {
                    slot.v.copy_(v);
                }
            }
        });
    }
}

pub(crate) fn check_entry(name: &str, expected: &Tensor, saved: &HashMap<String, Tensor>, problems: &mut Vec<String>) {
    match saved.get(name) {
        None => problems.push(format!("missing `{name}`")),
        Some(found) if found.size() != expected.size() => problems.push(format!(
            "`{name}` has shape {:?}, expected {:?}",
            found.size(),
            expected.size()
        )),
        Some(found) if name.ends_with(".t") || name == "iteration" || name.starts_with("epoch.") => {
            if found.kind() != Kind::Int64 {
                problems.push(format!("`{name}` has kind {:?}, expected Int64", found.kind()));
            }
        }
        Some(_) => {}
    }
}
