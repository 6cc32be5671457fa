use tch::Device;
use tracing::info;

/// Where tensors live and how the global torch RNG is seeded.
///
/// Passed to every model constructor and to the update step instead of
/// relying on an ambient default device.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionContext {
    device: Device,
}

impl ExecutionContext {
    pub fn new(device: Device) -> Self {
        ExecutionContext { device }
    }

    pub fn cpu() -> Self {
        Self::new(Device::Cpu)
    }

    pub fn cuda_if_available() -> Self {
        Self::new(Device::cuda_if_available())
    }

    /// Seeds the torch generator used for weight init and dropout.
    pub fn seeded(self, seed: i64) -> Self {
        tch::manual_seed(seed);
        info!(seed, "seeded torch rng");
        self
    }

    pub fn device(&self) -> Device {
        self.device
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::cpu()
    }
}
