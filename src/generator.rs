use tch::{nn, Tensor};

use crate::config::NetConfig;
use crate::error::{Error, Result};
use crate::graph::{Activation, Graph, GraphSpec, NodeRef, StageSpec};
use crate::model::Network;

/// Encoder-decoder with skip connections; image in, image of the same side
/// out.
#[derive(Debug)]
pub struct Generator {
    net: Graph,
}

/// U-Net topology: `enc0`, `enc1` at full resolution, six down blocks
/// `enc2..enc7`, six up blocks `dec6..dec1` each concatenated with the
/// matching encoder stage, then `dec0` and the raw `out` convolution.
pub fn generator_spec(config: &NetConfig) -> GraphSpec {
    let b = config.base_ch;
    let s = NodeRef::stage;
    GraphSpec {
        inputs: vec![config.in_ch],
        stages: vec![
            StageSpec::conv("enc0", vec![NodeRef::Input(0)], b, 5).with_activation(Activation::LeakyRelu),
            StageSpec::conv("enc1", vec![s("enc0")], b * 2, 3)
                .with_batch_norm()
                .with_activation(Activation::LeakyRelu),
            StageSpec::down("enc2", vec![s("enc1")], b * 4),
            StageSpec::down("enc3", vec![s("enc2")], b * 8),
            StageSpec::down("enc4", vec![s("enc3")], b * 8),
            StageSpec::down("enc5", vec![s("enc4")], b * 8),
            StageSpec::down("enc6", vec![s("enc5")], b * 8),
            StageSpec::down("enc7", vec![s("enc6")], b * 8),
            StageSpec::up("dec6", vec![s("enc7")], b * 8, true),
            StageSpec::up("dec5", vec![s("dec6"), s("enc6")], b * 8, true),
            StageSpec::up("dec4", vec![s("dec5"), s("enc5")], b * 8, true),
            StageSpec::up("dec3", vec![s("dec4"), s("enc4")], b * 8, false),
            StageSpec::up("dec2", vec![s("dec3"), s("enc3")], b * 4, false),
            StageSpec::up("dec1", vec![s("dec2"), s("enc2")], b * 2, false),
            StageSpec::conv("dec0", vec![s("dec1"), s("enc1")], b, 3)
                .with_batch_norm()
                .with_activation(Activation::Relu),
            StageSpec::conv("out", vec![s("dec0"), s("enc0")], config.out_ch, 5),
        ],
    }
}

impl Generator {
    pub fn new(path: &nn::Path, config: &NetConfig) -> Result<Generator> {
        config.validate()?;
        if config.side % 64 != 0 {
            return Err(Error::Config(format!(
                "generator side must be a multiple of 64 to survive six halvings, got {}",
                config.side
            )));
        }
        let net = Graph::new(path, &generator_spec(config), config.side)?;
        Ok(Generator { net })
    }

    pub fn generate(&self, xs: &Tensor, train: bool) -> Tensor {
        self.net.forward_t(&[xs], train)
    }
}

impl nn::ModuleT for Generator {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.generate(xs, train)
    }
}

impl Network for Generator {
    fn build(path: &nn::Path, config: &NetConfig) -> Result<Self> {
        Generator::new(path, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Shape;
    use tch::{Device, Kind};

    #[test]
    fn output_keeps_side_and_uses_out_channels() {
        let config = NetConfig::new(64, 4, 3, 2);
        let vs = nn::VarStore::new(Device::Cpu);
        let generator = Generator::new(&vs.root(), &config).unwrap();
        let xs = Tensor::rand([2, 4, 64, 64], (Kind::Float, Device::Cpu)) * 2.0 - 1.0;
        let ys = generator.generate(&xs, true);
        assert_eq!(ys.size(), vec![2, 3, 64, 64]);
        let ys = generator.generate(&xs, false);
        assert_eq!(ys.size(), vec![2, 3, 64, 64]);
    }

    #[test]
    fn bottleneck_is_one_sixty_fourth() {
        let config = NetConfig::new(128, 4, 4, 64);
        let shapes = generator_spec(&config).infer_shapes(config.side).unwrap();
        assert_eq!(shapes[7], Shape { channels: 512, height: 2, width: 2 });
        assert_eq!(shapes.last().unwrap().channels, 4);
    }

    #[test]
    fn side_not_divisible_by_64_is_a_config_error() {
        let config = NetConfig::new(32, 4, 4, 4);
        assert!(generator_spec(&config).infer_shapes(32).is_err());
        let vs = nn::VarStore::new(Device::Cpu);
        assert!(matches!(Generator::new(&vs.root(), &config), Err(Error::Config(_))));
    }
}
