//! Cycle-consistent pix2pix for pixel art.
//!
//! Two conditional GANs are trained side by side: an upscaler and a
//! downscaler. Each is pushed to fool its own patch critic and, through the
//! other direction's frozen generator, to reproduce its input after a round
//! trip.
//!
//! - `graph`, `generator`, `discriminator`: network topology as data, and
//!   the two networks built from it
//! - `model`: trainable models and their frozen mirrors
//! - `pix2pix`: the per-direction composite with gradient isolation
//! - `updater`: the cycle training step
//! - `data`, `metrics`, `checkpoint`, `preview`, `trainer`: the pieces around
//!   the step

pub mod checkpoint;
pub mod config;
pub mod context;
pub mod data;
pub mod discriminator;
pub mod error;
pub mod generator;
pub mod graph;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod pix2pix;
pub mod preview;
pub mod trainer;
pub mod updater;

pub use checkpoint::{CheckpointSink, FileCheckpointer};
pub use config::{AdamConfig, LossWeights, NetConfig, TrainerConfig, UpdaterConfig};
pub use context::ExecutionContext;
pub use data::{DataSource, FixedSource, ImageFolderSource, PairMode, PairedBatch};
pub use discriminator::Discriminator;
pub use error::{Error, Result};
pub use generator::Generator;
pub use metrics::{LogReport, MemorySink, MetricsRecord, MetricsSink};
pub use model::{Frozen, Trainable};
pub use optim::Adam;
pub use pix2pix::{Pix2Pix, Pix2PixOutput};
pub use preview::{ImagePreview, PreviewSink};
pub use trainer::Trainer;
pub use updater::{CycleUpdater, Role, StepReport};
