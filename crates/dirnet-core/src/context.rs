use burn::tensor::backend::Backend;

/// Explicit execution context for registration operations.
///
/// Owns the device every tensor of a registration run lives on. Create it
/// before the first operation, hand it to the component that owns the run,
/// and call [`ExecutionContext::dispose`] after the last one.
#[derive(Debug, Clone)]
pub struct ExecutionContext<B: Backend> {
    device: B::Device,
    seed: Option<u64>,
}

impl<B: Backend> ExecutionContext<B> {
    /// Create a context on `device` with backend-default randomness.
    pub fn new(device: B::Device) -> Self {
        Self { device, seed: None }
    }

    /// Seed the backend RNG so parameter initialization is reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        B::seed(seed);
        self.seed = Some(seed);
        self
    }

    /// Device all tensors of this context are allocated on.
    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Seed applied at creation, if any.
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    /// Block until all queued work on the device has completed.
    pub fn synchronize(&self) {
        B::sync(&self.device);
    }

    /// End the context's lifetime, flushing outstanding device work.
    pub fn dispose(self) {
        self.synchronize();
        tracing::debug!("Execution context on {:?} disposed", self.device);
    }
}

impl<B: Backend> Default for ExecutionContext<B> {
    fn default() -> Self {
        Self::new(B::Device::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn test_seed_is_recorded() {
        let context = ExecutionContext::<B>::default();
        assert_eq!(context.seed(), None);

        let context = context.with_seed(42);
        assert_eq!(context.seed(), Some(42));
        context.dispose();
    }
}
