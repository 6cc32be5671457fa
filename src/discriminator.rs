use tch::{nn, Tensor};

use crate::config::NetConfig;
use crate::error::Result;
use crate::graph::{Activation, Graph, GraphSpec, NodeRef, StageSpec};
use crate::model::Network;

/// Patch critic over a (condition, candidate) pair. Output is a
/// `[N, 1, side / 8, side / 8]` map of raw logits.
#[derive(Debug)]
pub struct Discriminator {
    net: Graph,
}

pub fn discriminator_spec(config: &NetConfig) -> GraphSpec {
    let b = config.base_ch;
    let s = NodeRef::stage;
    GraphSpec {
        inputs: vec![config.in_ch, config.out_ch],
        stages: vec![
            StageSpec::conv("condition", vec![NodeRef::Input(0)], b / 2, 5)
                .with_batch_norm()
                .with_activation(Activation::LeakyRelu),
            StageSpec::conv("candidate", vec![NodeRef::Input(1)], b / 2, 5)
                .with_batch_norm()
                .with_activation(Activation::LeakyRelu),
            StageSpec::down("down1", vec![s("condition"), s("candidate")], b * 2),
            StageSpec::down("down2", vec![s("down1")], b * 4),
            StageSpec::down("down3", vec![s("down2")], b * 8),
            StageSpec::conv("out", vec![s("down3")], 1, 3),
        ],
    }
}

impl Discriminator {
    pub fn new(path: &nn::Path, config: &NetConfig) -> Result<Discriminator> {
        config.validate()?;
        let net = Graph::new(path, &discriminator_spec(config), config.side)?;
        Ok(Discriminator { net })
    }

    pub fn discriminate(&self, condition: &Tensor, candidate: &Tensor, train: bool) -> Tensor {
        self.net.forward_t(&[condition, candidate], train)
    }
}

impl Network for Discriminator {
    fn build(path: &nn::Path, config: &NetConfig) -> Result<Self> {
        Discriminator::new(path, config)
    }
}
