use tqdm::tqdm;
use tracing::info;

use crate::checkpoint::CheckpointSink;
use crate::config::TrainerConfig;
use crate::error::Result;
use crate::metrics::MetricsSink;
use crate::preview::PreviewSink;
use crate::updater::CycleUpdater;

/// Drives a [`CycleUpdater`] and fires snapshot and preview triggers.
pub struct Trainer {
    updater: CycleUpdater,
    config: TrainerConfig,
    metrics: Box<dyn MetricsSink>,
    checkpoints: Box<dyn CheckpointSink>,
    preview: Option<Box<dyn PreviewSink>>,
}

impl Trainer {
    pub fn new(
        updater: CycleUpdater,
        config: TrainerConfig,
        metrics: Box<dyn MetricsSink>,
        checkpoints: Box<dyn CheckpointSink>,
    ) -> Self {
        Trainer {
            updater,
            config,
            metrics,
            checkpoints,
            preview: None,
        }
    }

    pub fn with_preview(mut self, preview: Box<dyn PreviewSink>) -> Self {
        self.preview = Some(preview);
        self
    }

    pub fn updater(&self) -> &CycleUpdater {
        &self.updater
    }

    /// Steps until `config.iterations`, starting from wherever the updater
    /// is (non-zero after a resume). Any error ends the run.
    pub fn run(&mut self) -> Result<()> {
        let start = self.updater.iteration();
        info!(start, end = self.config.iterations, "training");
        for _ in tqdm(start..self.config.iterations) {
            self.updater.update(self.metrics.as_mut())?;
            let iteration = self.updater.iteration();
            if iteration % self.config.snapshot_interval.max(1) == 0 {
                self.checkpoints.save_snapshot(&self.updater)?;
                self.checkpoints.save_models(&self.updater)?;
            }
            if let Some(preview) = self.preview.as_mut() {
                if iteration % self.config.preview_interval.max(1) == 0 {
                    preview.render(iteration, self.updater.upscaler(), self.updater.downscaler())?;
                }
            }
        }
        Ok(())
    }
}
