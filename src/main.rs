use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::Parser;
use serde::Serialize;
use tch::{Device, Kind};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use pix2pix_cycle::checkpoint::load_model;
use pix2pix_cycle::data::{load_rgba, upscale_nearest};
use pix2pix_cycle::{
    AdamConfig, CycleUpdater, DataSource, ExecutionContext, FileCheckpointer, Generator, ImageFolderSource,
    ImagePreview, LogReport, LossWeights, NetConfig, PairMode, Pix2Pix, Trainable, Trainer, TrainerConfig,
    UpdaterConfig,
};

const CHANNELS: i64 = 4;
const PREVIEW_SAMPLES: i64 = 8;

#[derive(Parser, Serialize, Debug)]
#[command(version, about = "Cycle-consistent pix2pix pixel-art upscaler via Rust.", long_about = None)]
struct Args {
    /// Directory holding trainA/ and trainB/
    #[arg(short = 'i', long, default_value = "./image/fsm")]
    dataset: PathBuf,
    /// Output directory for logs, snapshots and previews
    #[arg(short, long, default_value = "result")]
    out: PathBuf,
    #[arg(short, long, default_value_t = 1)]
    batch_size: i64,
    /// Sweeps over trainA
    #[arg(short, long, default_value_t = 200)]
    epoch: u64,
    /// Base channel width of the hidden layers
    #[arg(long, default_value_t = 64)]
    base_ch: i64,
    /// Side of the square working images
    #[arg(long, default_value_t = 64)]
    side: i64,
    #[arg(long, default_value_t = 0.0002)]
    lr: f64,
    #[arg(long, default_value_t = 0.5)]
    beta1: f64,
    #[arg(long, default_value_t = 100.0)]
    rec_weight: f64,
    #[arg(long, default_value_t = 0)]
    seed: i64,
    #[arg(short, long, default_value_t = false)]
    gpu: bool,
    /// Snapshot to resume from
    #[arg(short, long)]
    resume: Option<PathBuf>,
    #[arg(long, default_value_t = 1000)]
    snapshot_interval: u64,
    #[arg(long, default_value_t = 10)]
    display_interval: u64,
    #[arg(long, default_value_t = 100)]
    preview_interval: u64,
    /// Upscale this image with a trained generator instead of training
    #[arg(long)]
    upscale: Option<PathBuf>,
    /// gen_up_iter_N.ot blob used by --upscale
    #[arg(long)]
    weights: Option<PathBuf>,
}

fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();

    print_oss_license();

    let ctx = if args.gpu {
        ExecutionContext::cuda_if_available()
    } else {
        ExecutionContext::cpu()
    }
    .seeded(args.seed);
    info!("Use Device: {:?}", ctx.device());

    let net = NetConfig::new(args.side, CHANNELS, CHANNELS, args.base_ch);

    if let Some(image) = &args.upscale {
        let Some(weights) = &args.weights else {
            bail!("--upscale needs --weights pointing at a gen_up blob");
        };
        let output = upscale(&ctx, net, image, weights, &args.out)?;
        info!("Upscaled: {}", output.display());
        return Ok(());
    }

    fs::create_dir_all(&args.out)?;
    fs::write(args.out.join("args.json"), serde_json::to_string_pretty(&args)?)?;
    info!("Dataset: {}", args.dataset.display());
    info!("Batch Size: {}", args.batch_size);
    info!("Epochs: {}", args.epoch);
    info!("Base Channels: {}", args.base_ch);
    info!("Learning Rate: {}", args.lr);

    let seed = args.seed as u64;
    let source_up = ImageFolderSource::open(
        args.dataset.join("trainA"),
        PairMode::AutoUpscale { random_phase: true },
        args.side,
        args.batch_size,
        seed,
    )?;
    let source_down = ImageFolderSource::open(args.dataset.join("trainB"), PairMode::Single, args.side, args.batch_size, seed + 1)?;
    let mut preview_source = ImageFolderSource::open(
        args.dataset.join("trainA"),
        PairMode::AutoUpscale { random_phase: false },
        args.side,
        PREVIEW_SAMPLES.min(source_up.len() as i64),
        seed + 2,
    )?;
    let preview_samples = preview_source.next_batch()?.condition;

    let batches_per_epoch = (source_up.len() as u64).div_ceil(args.batch_size as u64);
    let config = UpdaterConfig {
        batch_size: args.batch_size,
        weights: LossWeights {
            rec_weight: args.rec_weight,
            ..LossWeights::default()
        },
        adam: AdamConfig {
            alpha: args.lr,
            beta1: args.beta1,
            ..AdamConfig::default()
        },
    };
    let mut updater = CycleUpdater::new(
        ctx,
        config,
        Pix2Pix::new(&ctx, "up", net)?,
        Pix2Pix::new(&ctx, "down", net)?,
        Box::new(source_up),
        Box::new(source_down),
    )?;
    if let Some(snapshot) = &args.resume {
        updater.restore_state(snapshot)?;
        info!("Resumed at iteration {}", updater.iteration());
    }

    let trainer_config = TrainerConfig {
        iterations: args.epoch * batches_per_epoch,
        snapshot_interval: args.snapshot_interval,
        preview_interval: args.preview_interval,
    };
    let mut trainer = Trainer::new(
        updater,
        trainer_config,
        Box::new(LogReport::new(&args.out, args.display_interval)),
        Box::new(FileCheckpointer::new(&args.out)),
    )
    .with_preview(Box::new(ImagePreview::new(&args.out, preview_samples)));
    trainer.run()?;

    Ok(())
}

/// Nearest-neighbour upscales `image` to the working side and runs the
/// trained upscaler over it.
fn upscale(ctx: &ExecutionContext, net: NetConfig, image: &Path, weights: &Path, out: &Path) -> Result<PathBuf> {
    let generator = Trainable::<Generator>::new(ctx, "gen_up", net)?;
    load_model(&generator, None, weights)?;

    let xs = upscale_nearest(&load_rgba(image)?).unsqueeze(0);
    if xs.size() != [1, net.in_ch, net.side, net.side] {
        bail!(
            "{} must be {}x{} pixels to upscale to {}x{}",
            image.display(),
            net.side / 2,
            net.side / 2,
            net.side,
            net.side
        );
    }
    let ys = tch::no_grad(|| generator.generate(&xs.to_device(ctx.device()), false));
    let pixels = ((ys.squeeze_dim(0).clamp(-1.0, 1.0) + 1.0) * 127.5)
        .to_kind(Kind::Uint8)
        .to_device(Device::Cpu);

    fs::create_dir_all(out)?;
    let stem = image.file_stem().and_then(|s| s.to_str()).unwrap_or("image");
    let path = out.join(format!("{stem}_x2.png"));
    tch::vision::image::save(&pixels, &path)?;
    Ok(path)
}

fn print_oss_license() {
    println!("OSS Library: PyTorch");
    println!("URL: https://github.com/pytorch/pytorch");
    println!("License: 3-Clause BSD License");
    println!("");
    println!("OSS Library: tch-rs");
    println!("URL: https://github.com/LaurentMazare/tch-rs");
    println!("License: MIT License");
    println!("");
    println!("OSS Library: anyhow");
    println!("URL: https://github.com/dtolnay/anyhow");
    println!("License: MIT OR Apache-2.0");
    println!("");
    println!("OSS Library: thiserror");
    println!("URL: https://github.com/dtolnay/thiserror");
    println!("License: MIT OR Apache-2.0");
    println!("");
    println!("OSS Library: rand");
    println!("URL: https://github.com/rust-random/rand");
    println!("License: MIT OR Apache-2.0");
    println!("");
    println!("OSS Library: image");
    println!("URL: https://github.com/image-rs/image");
    println!("License: MIT OR Apache-2.0");
    println!("");
    println!("OSS Library: gif");
    println!("URL: https://github.com/image-rs/image-gif");
    println!("License: MIT OR Apache-2.0");
    println!("");
    println!("OSS Library: tqdm");
    println!("URL: https://github.com/mrlazy1708/tqdm");
    println!("License: MIT OR Apache-2.0");
    println!("");
    println!("OSS Library: clap");
    println!("URL: https://github.com/clap-rs/clap");
    println!("License: MIT OR Apache-2.0");
    println!("");
    println!("OSS Library: serde");
    println!("URL: https://github.com/serde-rs/serde");
    println!("License: MIT OR Apache-2.0");
    println!("");
    println!("OSS Library: tracing");
    println!("URL: https://github.com/tokio-rs/tracing");
    println!("License: MIT License");
    println!("--------");
    println!("");
}
