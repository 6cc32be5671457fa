use std::ops::Deref;

use tch::{nn, Tensor};
use tracing::debug;

use crate::config::NetConfig;
use crate::context::ExecutionContext;
use crate::error::Result;

pub trait Network: Sized {
    fn build(path: &nn::Path, config: &NetConfig) -> Result<Self>;
}

pub struct Trainable<N: Network> {
    name: String,
    config: NetConfig,
    vs: nn::VarStore,
    net: N,
}

impl<N: Network> Trainable<N> {
    pub fn new(ctx: &ExecutionContext, name: &str, config: NetConfig) -> Result<Self> {
        let vs = nn::VarStore::new(ctx.device());
        let net = N::build(&vs.root(), &config)?;
        debug!(model = name, variables = vs.len(), "built trainable model");
        Ok(Trainable {
            name: name.to_string(),
            config,
            vs,
            net,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    /// Includes batch-norm running statistics.
    pub fn variables(&self) -> Vec<(String, Tensor)> {
        let mut variables: Vec<(String, Tensor)> = self.vs.variables().into_iter().collect();
        variables.sort_by(|a, b| a.0.cmp(&b.0));
        variables
    }

    pub fn parameters(&self) -> Vec<(String, Tensor)> {
        self.variables()
            .into_iter()
            .filter(|(_, t)| t.requires_grad())
            .collect()
    }

    pub(crate) fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    /// A frozen copy holding the current weights.
    pub fn mirror(&self) -> Result<Frozen<N>> {
        let mut vs = nn::VarStore::new(self.vs.device());
        let net = N::build(&vs.root(), &self.config)?;
        vs.freeze();
        vs.copy(&self.vs)?;
        Ok(Frozen { vs, net })
    }
}

impl<N: Network> Deref for Trainable<N> {
    type Target = N;

    fn deref(&self) -> &N {
        &self.net
    }
}

pub struct Frozen<N: Network> {
    vs: nn::VarStore,
    net: N,
}

impl<N: Network> Frozen<N> {
    pub fn sync(&mut self, source: &Trainable<N>) -> Result<()> {
        self.vs.copy(&source.vs)?;
        Ok(())
    }
}

impl<N: Network> Deref for Frozen<N> {
    type Target = N;

    fn deref(&self) -> &N {
        &self.net
    }
}
