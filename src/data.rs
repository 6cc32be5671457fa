//! Paired-image streams feeding the update step.

use std::fs;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tch::{Kind, Tensor};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// One mini-batch: `condition` is what a generator reads, `target` the real
/// image its discriminator compares against. Both `[N, C, side, side]`.
pub struct PairedBatch {
    pub condition: Tensor,
    pub target: Tensor,
}

/// An endless, reshuffling stream of paired batches.
pub trait DataSource {
    fn name(&self) -> &str;

    fn next_batch(&mut self) -> Result<PairedBatch>;

    /// Completed passes over the underlying dataset.
    fn epoch(&self) -> u64;

    /// Resets the epoch counter when resuming. Shuffle order and position
    /// within the epoch start fresh.
    fn set_epoch(&mut self, epoch: u64);
}

/// Nearest-neighbour 2x upscale of a `[C, H, W]` or `[N, C, H, W]` tensor.
pub fn upscale_nearest(xs: &Tensor) -> Tensor {
    if xs.dim() == 3 {
        crate::graph::upsample2x(&xs.unsqueeze(0)).squeeze_dim(0)
    } else {
        crate::graph::upsample2x(xs)
    }
}

/// Nearest-neighbour 2x downscale of a `[C, H, W]` tensor, sampling the
/// pixel at `(dy, dx)` of every 2x2 block.
pub fn downscale_nearest(xs: &Tensor, dy: i64, dx: i64) -> Tensor {
    let size = xs.size();
    let (h, w) = (size[1], size[2]);
    xs.slice(1, dy, h, 2).slice(2, dx, w, 2)
}

/// Repeats one example forever. Every batch counts as one epoch.
pub struct FixedSource {
    name: String,
    condition: Tensor,
    target: Tensor,
    batch_size: i64,
    epoch: u64,
}

impl FixedSource {
    /// `condition` and `target` are single `[C, H, W]` images.
    pub fn new(name: &str, condition: Tensor, target: Tensor, batch_size: i64) -> Self {
        FixedSource {
            name: name.to_string(),
            condition,
            target,
            batch_size,
            epoch: 0,
        }
    }

    /// A low-resolution `[C, H, W]` tile upscaled 2x, used as both condition
    /// and target.
    pub fn from_tile(name: &str, tile: &Tensor, batch_size: i64) -> Self {
        let image = upscale_nearest(&tile.to_kind(Kind::Float));
        FixedSource::new(name, image.shallow_clone(), image, batch_size)
    }
}

impl DataSource for FixedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_batch(&mut self) -> Result<PairedBatch> {
        self.epoch += 1;
        let repeat = |t: &Tensor| t.unsqueeze(0).repeat([self.batch_size, 1, 1, 1]);
        Ok(PairedBatch {
            condition: repeat(&self.condition),
            target: repeat(&self.target),
        })
    }

    fn epoch(&self) -> u64 {
        self.epoch
    }

    fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }
}

/// How an [`ImageFolderSource`] turns a loaded image into a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairMode {
    /// Target is a `side` tile; condition is the same tile downscaled 2x by
    /// nearest neighbour and upscaled back, i.e. a naive upscale.
    AutoUpscale { random_phase: bool },
    /// A `side / 2` tile upscaled 2x serves as both condition and target.
    Single,
}

/// RGBA images from a directory, decoded once and held in memory as
/// `[4, H, W]` tensors in `[-1, 1]`.
pub struct ImageFolderSource {
    name: String,
    images: Vec<Tensor>,
    mode: PairMode,
    side: i64,
    batch_size: i64,
    order: Vec<usize>,
    cursor: usize,
    epoch: u64,
    rng: StdRng,
}

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "gif"];

pub fn load_rgba(path: &Path) -> Result<Tensor> {
    let image = image::open(path)?.to_rgba8();
    let (w, h) = image.dimensions();
    let t = Tensor::from_slice(image.as_raw().as_slice())
        .view([h as i64, w as i64, 4])
        .permute([2, 0, 1])
        .to_kind(Kind::Float);
    Ok(t / 127.5 - 1.0)
}

fn image_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}

impl ImageFolderSource {
    pub fn open(dir: impl AsRef<Path>, mode: PairMode, side: i64, batch_size: i64, seed: u64) -> Result<Self> {
        let dir = dir.as_ref();
        let name = dir.display().to_string();
        let fail = |reason: String| Error::DataSource {
            name: name.clone(),
            reason,
        };
        if batch_size < 1 {
            return Err(fail(format!("batch size must be positive, got {batch_size}")));
        }
        let crop = match mode {
            PairMode::AutoUpscale { .. } => side,
            PairMode::Single => side / 2,
        };
        let mut images = Vec::new();
        for path in image_files(dir)? {
            let image = load_rgba(&path)?;
            let size = image.size();
            if size[1] < crop || size[2] < crop {
                return Err(fail(format!(
                    "{} is {}x{}, smaller than the {crop}x{crop} crop",
                    path.display(),
                    size[2],
                    size[1]
                )));
            }
            images.push(image);
        }
        if images.is_empty() {
            return Err(fail("no images found".to_string()));
        }
        info!(source = %name, images = images.len(), ?mode, "loaded dataset");

        let mut rng = StdRng::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..images.len()).collect();
        order.shuffle(&mut rng);
        Ok(ImageFolderSource {
            name,
            images,
            mode,
            side,
            batch_size,
            order,
            cursor: 0,
            epoch: 0,
            rng,
        })
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    fn random_crop(&mut self, image: &Tensor, crop: i64) -> Tensor {
        let size = image.size();
        let y = self.rng.gen_range(0..=size[1] - crop);
        let x = self.rng.gen_range(0..=size[2] - crop);
        image.narrow(1, y, crop).narrow(2, x, crop)
    }

    fn pair(&mut self, index: usize) -> (Tensor, Tensor) {
        let image = self.images[index].shallow_clone();
        match self.mode {
            PairMode::AutoUpscale { random_phase } => {
                let target = self.random_crop(&image, self.side);
                let (dy, dx) = if random_phase {
                    (self.rng.gen_range(0..2), self.rng.gen_range(0..2))
                } else {
                    (0, 0)
                };
                let condition = upscale_nearest(&downscale_nearest(&target, dy, dx));
                (condition, target)
            }
            PairMode::Single => {
                let tile = self.random_crop(&image, self.side / 2);
                let upscaled = upscale_nearest(&tile);
                (upscaled.shallow_clone(), upscaled)
            }
        }
    }
}

impl DataSource for ImageFolderSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_batch(&mut self) -> Result<PairedBatch> {
        let mut conditions = Vec::with_capacity(self.batch_size as usize);
        let mut targets = Vec::with_capacity(self.batch_size as usize);
        for _ in 0..self.batch_size {
            if self.cursor == self.order.len() {
                self.order.shuffle(&mut self.rng);
                self.cursor = 0;
                self.epoch += 1;
                debug!(source = %self.name, epoch = self.epoch, "reshuffled");
            }
            let index = self.order[self.cursor];
            self.cursor += 1;
            let (condition, target) = self.pair(index);
            conditions.push(condition);
            targets.push(target);
        }
        Ok(PairedBatch {
            condition: Tensor::stack(&conditions, 0),
            target: Tensor::stack(&targets, 0),
        })
    }

    fn epoch(&self) -> u64 {
        self.epoch
    }

    fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }
}
