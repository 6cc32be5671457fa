use std::fs::{self, File};
use std::path::PathBuf;

use gif::{Encoder, Frame, Repeat};
use tch::{Device, Kind, Tensor};
use tracing::debug;

use crate::error::{Error, Result};
use crate::pix2pix::Pix2Pix;

/// Periodically shown the current models; not part of training correctness.
pub trait PreviewSink {
    fn render(&mut self, iteration: u64, upscaler: &Pix2Pix, downscaler: &Pix2Pix) -> Result<()>;
}

/// Renders `[condition | upscaled | reconstructed]` rows for a fixed set of
/// validation inputs to `preview/iter_{n}.png`, plus an animated GIF cycling
/// through the three images of the first row.
pub struct ImagePreview {
    out_dir: PathBuf,
    samples: Tensor,
}

/// `[-1, 1]` floats to `[0, 255]` bytes.
fn to_pixels(xs: &Tensor) -> Tensor {
    ((xs.clamp(-1.0, 1.0) + 1.0) * 127.5).to_kind(Kind::Uint8)
}

impl ImagePreview {
    /// `samples` is a `[N, C, side, side]` batch of upscaler conditions.
    pub fn new(out_dir: impl Into<PathBuf>, samples: Tensor) -> Self {
        ImagePreview {
            out_dir: out_dir.into().join("preview"),
            samples,
        }
    }

    fn write_gif(&self, path: &PathBuf, frames: &[Tensor]) -> Result<()> {
        let size = frames[0].size();
        let (channels, h, w) = (size[0], size[1] as u16, size[2] as u16);
        if channels != 4 {
            return Err(Error::shape("preview frame", "[4, H, W]", size));
        }
        let mut file = File::create(path)?;
        let mut encoder = Encoder::new(&mut file, w, h, &[])?;
        encoder.set_repeat(Repeat::Infinite)?;
        let len = (4 * h as usize) * w as usize;
        for image in frames {
            let mut data = vec![0u8; len];
            to_pixels(image).permute([1, 2, 0]).contiguous().copy_data(&mut data, len);
            let mut frame = Frame::from_rgba(w, h, &mut data);
            frame.delay = 50;
            encoder.write_frame(&frame)?;
        }
        Ok(())
    }
}

impl PreviewSink for ImagePreview {
    fn render(&mut self, iteration: u64, upscaler: &Pix2Pix, downscaler: &Pix2Pix) -> Result<()> {
        let device = upscaler.generator().var_store().device();
        let (upscaled, reconstructed) = tch::no_grad(|| {
            let xs = self.samples.to_device(device);
            let upscaled = upscaler.generator().generate(&xs, false);
            let reconstructed = downscaler.generator().generate(&upscaled, false);
            (upscaled.to_device(Device::Cpu), reconstructed.to_device(Device::Cpu))
        });
        let rows: Vec<Tensor> = (0..self.samples.size()[0])
            .map(|i| {
                Tensor::cat(
                    &[self.samples.get(i), upscaled.get(i), reconstructed.get(i)],
                    2,
                )
            })
            .collect();
        let grid = to_pixels(&Tensor::cat(&rows, 1));

        fs::create_dir_all(&self.out_dir)?;
        tch::vision::image::save(&grid, self.out_dir.join(format!("iter_{iteration}.png")))?;
        if self.samples.size()[1] == 4 {
            let frames = [self.samples.get(0), upscaled.get(0), reconstructed.get(0)];
            self.write_gif(&self.out_dir.join(format!("iter_{iteration}.gif")), &frames)?;
        }
        debug!(iteration, dir = %self.out_dir.display(), "wrote preview");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetConfig;
    use crate::context::ExecutionContext;

    #[test]
    fn writes_grid_and_gif() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ExecutionContext::cpu();
        let net = NetConfig::new(64, 4, 4, 2);
        let up = Pix2Pix::new(&ctx, "up", net).unwrap();
        let down = Pix2Pix::new(&ctx, "down", net).unwrap();
        let samples = Tensor::rand([2, 4, 64, 64], (Kind::Float, Device::Cpu)) * 2.0 - 1.0;

        let mut preview = ImagePreview::new(dir.path(), samples);
        preview.render(100, &up, &down).unwrap();
        assert!(dir.path().join("preview/iter_100.png").is_file());
        assert!(dir.path().join("preview/iter_100.gif").is_file());
    }
}
