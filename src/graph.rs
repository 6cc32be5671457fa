//! Layer topology as data, checked by shape inference before any weight exists.

use std::collections::HashMap;

use tch::{nn, Kind, Tensor};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resample {
    /// Convolution keeps the spatial size (odd kernel, same padding).
    Keep,
    /// Stride-2 4x4 convolution halving each side.
    Down,
    /// Nearest-neighbour 2x upsample before the convolution.
    Up,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Identity,
    Relu,
    LeakyRelu,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeRef {
    Input(usize),
    Stage(String),
}

impl NodeRef {
    pub fn stage(name: &str) -> Self {
        NodeRef::Stage(name.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageSpec {
    pub name: String,
    pub inputs: Vec<NodeRef>,
    pub filters: i64,
    pub kernel: i64,
    pub resample: Resample,
    pub batch_norm: bool,
    pub dropout: bool,
    pub activation: Activation,
}

impl StageSpec {
    /// Same-size convolution, optionally batch-normalized.
    pub fn conv(name: &str, inputs: Vec<NodeRef>, filters: i64, kernel: i64) -> Self {
        StageSpec {
            name: name.to_string(),
            inputs,
            filters,
            kernel,
            resample: Resample::Keep,
            batch_norm: false,
            dropout: false,
            activation: Activation::Identity,
        }
    }

    /// conv 4x4 stride 2 -> batch norm -> leaky ReLU.
    pub fn down(name: &str, inputs: Vec<NodeRef>, filters: i64) -> Self {
        StageSpec {
            resample: Resample::Down,
            batch_norm: true,
            activation: Activation::LeakyRelu,
            ..StageSpec::conv(name, inputs, filters, 4)
        }
    }

    /// upsample 2x -> conv 3x3 -> batch norm -> [dropout] -> ReLU.
    pub fn up(name: &str, inputs: Vec<NodeRef>, filters: i64, dropout: bool) -> Self {
        StageSpec {
            resample: Resample::Up,
            batch_norm: true,
            dropout,
            activation: Activation::Relu,
            ..StageSpec::conv(name, inputs, filters, 3)
        }
    }

    pub fn with_batch_norm(mut self) -> Self {
        self.batch_norm = true;
        self
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
    pub channels: i64,
    pub height: i64,
    pub width: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphSpec {
    /// Channel count of each graph input.
    pub inputs: Vec<i64>,
    pub stages: Vec<StageSpec>,
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Input(usize),
    Stage(usize),
}

impl GraphSpec {
    /// Output shape of every stage for square inputs of side `side`.
    pub fn infer_shapes(&self, side: i64) -> Result<Vec<Shape>> {
        Ok(self.resolve(side)?.into_iter().map(|(_, shape)| shape).collect())
    }

    /// Shape of the final stage, i.e. of the graph output.
    pub fn output_shape(&self, side: i64) -> Result<Shape> {
        let shapes = self.infer_shapes(side)?;
        shapes.last().copied().ok_or_else(|| Error::Graph {
            stage: "<output>".to_string(),
            reason: "graph has no stages".to_string(),
        })
    }

    fn resolve(&self, side: i64) -> Result<Vec<(Vec<Slot>, Shape)>> {
        let fail = |stage: &str, reason: String| Error::Graph {
            stage: stage.to_string(),
            reason,
        };
        if self.stages.is_empty() {
            return Err(fail("<output>", "graph has no stages".to_string()));
        }
        let input_shapes: Vec<Shape> = self
            .inputs
            .iter()
            .map(|&channels| Shape { channels, height: side, width: side })
            .collect();

        let mut index: HashMap<&str, usize> = HashMap::new();
        let mut resolved: Vec<(Vec<Slot>, Shape)> = Vec::with_capacity(self.stages.len());
        for (i, stage) in self.stages.iter().enumerate() {
            if index.contains_key(stage.name.as_str()) {
                return Err(fail(&stage.name, "duplicate stage name".to_string()));
            }
            if stage.inputs.is_empty() {
                return Err(fail(&stage.name, "stage reads no inputs".to_string()));
            }
            if stage.filters <= 0 || stage.kernel <= 0 {
                return Err(fail(&stage.name, "filters and kernel must be positive".to_string()));
            }

            let mut slots = Vec::with_capacity(stage.inputs.len());
            let mut shapes = Vec::with_capacity(stage.inputs.len());
            for node in &stage.inputs {
                let (slot, shape) = match node {
                    NodeRef::Input(k) => match input_shapes.get(*k) {
                        Some(shape) => (Slot::Input(*k), *shape),
                        None => return Err(fail(&stage.name, format!("graph has no input {k}"))),
                    },
                    NodeRef::Stage(name) => match index.get(name.as_str()) {
                        Some(&j) => (Slot::Stage(j), resolved[j].1),
                        None => {
                            return Err(fail(
                                &stage.name,
                                format!("`{name}` is not an earlier stage"),
                            ))
                        }
                    },
                };
                slots.push(slot);
                shapes.push(shape);
            }

            let first = shapes[0];
            if let Some(other) = shapes
                .iter()
                .find(|s| s.height != first.height || s.width != first.width)
            {
                return Err(fail(
                    &stage.name,
                    format!(
                        "cannot concatenate {}x{} with {}x{}",
                        first.height, first.width, other.height, other.width
                    ),
                ));
            }
            let (height, width) = match stage.resample {
                Resample::Keep => {
                    if stage.kernel % 2 == 0 {
                        return Err(fail(&stage.name, "same-size convolution needs an odd kernel".to_string()));
                    }
                    (first.height, first.width)
                }
                Resample::Down => {
                    if first.height < 2 || first.width < 2 || first.height % 2 != 0 || first.width % 2 != 0 {
                        return Err(fail(
                            &stage.name,
                            format!("cannot halve a {}x{} input", first.height, first.width),
                        ));
                    }
                    (first.height / 2, first.width / 2)
                }
                Resample::Up => {
                    if stage.kernel % 2 == 0 {
                        return Err(fail(&stage.name, "upsampling convolution needs an odd kernel".to_string()));
                    }
                    (first.height * 2, first.width * 2)
                }
            };
            index.insert(stage.name.as_str(), i);
            resolved.push((
                slots,
                Shape {
                    channels: stage.filters,
                    height,
                    width,
                },
            ));
        }
        Ok(resolved)
    }
}

/// Default kernel init: N(0, 0.02), zero bias.
fn conv_config(stride: i64, padding: i64) -> nn::ConvConfig {
    nn::ConvConfig {
        stride,
        padding,
        ws_init: nn::Init::Randn { mean: 0., stdev: 0.02 },
        bs_init: nn::Init::Const(0.),
        ..Default::default()
    }
}

const BN_MOMENTUM: f64 = 0.1;
const BN_EPS: f64 = 2e-5;

/// Batch normalization over `[N, C, H, W]`.
///
/// Training normalizes with batch statistics and folds them into the running
/// averages with a `n / max(n - 1, 1)` variance correction, so a batch with a
/// single value per channel (batch size 1 at a 1x1 bottleneck) leaves the
/// running variance finite.
#[derive(Debug)]
struct BatchNorm {
    ws: Tensor,
    bs: Tensor,
    running_mean: Tensor,
    running_var: Tensor,
}

fn batch_norm(path: nn::Path, channels: i64) -> BatchNorm {
    BatchNorm {
        ws: path.var("weight", &[channels], nn::Init::Const(1.)),
        bs: path.var("bias", &[channels], nn::Init::Const(0.)),
        running_mean: path.zeros_no_train("running_mean", &[channels]),
        running_var: path.ones_no_train("running_var", &[channels]),
    }
}

impl nn::ModuleT for BatchNorm {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        if !train {
            return xs.batch_norm(
                Some(&self.ws),
                Some(&self.bs),
                Some(&self.running_mean),
                Some(&self.running_var),
                false,
                BN_MOMENTUM,
                BN_EPS,
                false,
            );
        }
        tch::no_grad(|| {
            let size = xs.size();
            let n = size[0] * size[2] * size[3];
            let dims = [0i64, 2, 3];
            let mean = xs.mean_dim(Some(dims.as_slice()), false, Kind::Float);
            let var = (xs - mean.view([1, -1, 1, 1]))
                .square()
                .mean_dim(Some(dims.as_slice()), false, Kind::Float)
                * (n as f64 / (n - 1).max(1) as f64);
            let mut running_mean = self.running_mean.shallow_clone();
            let mut running_var = self.running_var.shallow_clone();
            running_mean.copy_(&(&self.running_mean * (1. - BN_MOMENTUM) + mean * BN_MOMENTUM));
            running_var.copy_(&(&self.running_var * (1. - BN_MOMENTUM) + var * BN_MOMENTUM));
        });
        xs.batch_norm(
            Some(&self.ws),
            Some(&self.bs),
            None::<&Tensor>,
            None::<&Tensor>,
            true,
            BN_MOMENTUM,
            BN_EPS,
            false,
        )
    }
}

pub fn leaky_relu(xs: &Tensor) -> Tensor {
    xs.maximum(&(xs * 0.2))
}

pub fn upsample2x(xs: &Tensor) -> Tensor {
    let size = xs.size();
    let (h, w) = (size[size.len() - 2], size[size.len() - 1]);
    xs.upsample_nearest2d([h * 2, w * 2], None::<f64>, None::<f64>)
}

fn build_stage(path: nn::Path, spec: &StageSpec, in_channels: i64) -> nn::SequentialT {
    let mut net = nn::seq_t();
    if spec.resample == Resample::Up {
        net = net.add_fn(upsample2x);
    }
    let (stride, padding) = match spec.resample {
        Resample::Down => (2, 1),
        Resample::Keep | Resample::Up => (1, spec.kernel / 2),
    };
    net = net.add(nn::conv2d(&path / "conv", in_channels, spec.filters, spec.kernel, conv_config(stride, padding)));
    if spec.batch_norm {
        net = net.add(batch_norm(&path / "bn", spec.filters));
    }
    if spec.dropout {
        net = net.add_fn_t(|xs, train| xs.dropout(0.5, train));
    }
    match spec.activation {
        Activation::Identity => net,
        Activation::Relu => net.add_fn(|xs| xs.relu()),
        Activation::LeakyRelu => net.add_fn(leaky_relu),
    }
}

#[derive(Debug)]
struct Stage {
    inputs: Vec<Slot>,
    net: nn::SequentialT,
}

/// A validated [`GraphSpec`] with its weights allocated.
#[derive(Debug)]
pub struct Graph {
    num_inputs: usize,
    stages: Vec<Stage>,
    output: Shape,
}

impl Graph {
    pub fn new(path: &nn::Path, spec: &GraphSpec, side: i64) -> Result<Graph> {
        let resolved = spec.resolve(side)?;
        let mut stages = Vec::with_capacity(spec.stages.len());
        let mut shapes: Vec<Shape> = Vec::with_capacity(spec.stages.len());
        for (stage, (slots, shape)) in spec.stages.iter().zip(resolved) {
            let in_channels: i64 = slots
                .iter()
                .map(|slot| match *slot {
                    Slot::Input(k) => spec.inputs[k],
                    Slot::Stage(j) => shapes[j].channels,
                })
                .sum();
            let net = build_stage(path / stage.name.as_str(), stage, in_channels);
            stages.push(Stage { inputs: slots, net });
            shapes.push(shape);
        }
        let output = shapes[shapes.len() - 1];
        Ok(Graph {
            num_inputs: spec.inputs.len(),
            stages,
            output,
        })
    }

    pub fn num_inputs(&self) -> usize {
        self.num_inputs
    }

    pub fn output_shape(&self) -> Shape {
        self.output
    }

    /// Evaluates every stage in order. `inputs.len()` must equal
    /// [`Graph::num_inputs`].
    pub fn forward_t(&self, inputs: &[&Tensor], train: bool) -> Tensor {
        assert_eq!(inputs.len(), self.num_inputs, "wrong number of graph inputs");
        let mut outputs: Vec<Tensor> = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            let mut xs: Vec<Tensor> = stage
                .inputs
                .iter()
                .map(|slot| match *slot {
                    Slot::Input(k) => inputs[k].shallow_clone(),
                    Slot::Stage(j) => outputs[j].shallow_clone(),
                })
                .collect();
            let xs = if xs.len() == 1 {
                xs.swap_remove(0)
            } else {
                Tensor::cat(&xs, 1)
            };
            outputs.push(xs.apply_t(&stage.net, train));
        }
        outputs.swap_remove(outputs.len() - 1)
    }
}
