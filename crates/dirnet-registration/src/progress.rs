//! Epoch progress reporting for training sessions.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Summary of one finished epoch.
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// 1-based epoch number.
    pub epoch: usize,
    pub total_epochs: Option<usize>,
    /// Mean objective over the epoch's batches.
    pub loss: f64,
    /// Mean NCC over the epoch's batches.
    pub ncc: f64,
    /// Mean unweighted smoothness penalty.
    pub smoothness: f64,
    pub elapsed: Duration,
    pub estimated_remaining: Option<Duration>,
    pub learning_rate: f64,
    /// Additional named values.
    pub metrics: Vec<(String, f64)>,
}

impl ProgressInfo {
    pub fn new(epoch: usize, total_epochs: Option<usize>, loss: f64, elapsed: Duration, learning_rate: f64) -> Self {
        Self {
            epoch,
            total_epochs,
            loss,
            ncc: 0.0,
            smoothness: 0.0,
            elapsed,
            estimated_remaining: None,
            learning_rate,
            metrics: Vec::new(),
        }
    }

    pub fn with_terms(mut self, ncc: f64, smoothness: f64) -> Self {
        self.ncc = ncc;
        self.smoothness = smoothness;
        self
    }

    pub fn progress_percent(&self) -> Option<f64> {
        self.total_epochs
            .filter(|&total| total > 0)
            .map(|total| (self.epoch as f64 / total as f64) * 100.0)
    }

    /// Extrapolate the remaining time from the mean epoch duration.
    pub fn calculate_remaining(&mut self) {
        if let Some(total) = self.total_epochs {
            if self.epoch > 0 {
                let per_epoch = self.elapsed.as_secs_f64() / self.epoch as f64;
                let remaining = total.saturating_sub(self.epoch);
                self.estimated_remaining = Some(Duration::from_secs_f64(per_epoch * remaining as f64));
            }
        }
    }

    pub fn add_metric(&mut self, name: impl Into<String>, value: f64) {
        self.metrics.push((name.into(), value));
    }
}

/// Observer of a training session.
pub trait ProgressCallback: Send + Sync {
    /// Called after every epoch.
    fn on_progress(&self, info: &ProgressInfo);

    fn on_start(&self) {}

    fn on_complete(&self, _info: &ProgressInfo) {}

    fn on_error(&self, _error: &str) {}

    /// Ask the session to stop after the current epoch.
    fn should_stop(&self) -> bool {
        false
    }
}

/// Logs epoch summaries through `tracing`.
#[derive(Debug, Clone)]
pub struct ConsoleProgressCallback {
    /// Log every `log_interval` epochs, plus the last one.
    pub log_interval: usize,
}

impl Default for ConsoleProgressCallback {
    fn default() -> Self {
        Self { log_interval: 1 }
    }
}

impl ConsoleProgressCallback {
    pub fn new(log_interval: usize) -> Self {
        Self {
            log_interval: log_interval.max(1),
        }
    }
}

impl ProgressCallback for ConsoleProgressCallback {
    fn on_progress(&self, info: &ProgressInfo) {
        if info.epoch % self.log_interval != 0 && info.total_epochs != Some(info.epoch) {
            return;
        }
        let remaining = info
            .estimated_remaining
            .map(|d| format!("{:.1}s", d.as_secs_f64()))
            .unwrap_or_else(|| "N/A".to_string());

        tracing::info!(
            "Epoch {}/{} | Loss: {:.6} | NCC: {:.6} | Smoothness: {:.6} | LR: {:.2e} | ETA: {}",
            info.epoch,
            info.total_epochs.map(|n| n.to_string()).unwrap_or_else(|| "?".to_string()),
            info.loss,
            info.ncc,
            info.smoothness,
            info.learning_rate,
            remaining
        );
        for (name, value) in &info.metrics {
            tracing::info!("  {}: {:.6}", name, value);
        }
    }

    fn on_start(&self) {
        tracing::info!("Training started");
    }

    fn on_complete(&self, info: &ProgressInfo) {
        tracing::info!(
            "Training completed after {} epochs in {:.2}s, final loss {:.6}",
            info.epoch,
            info.elapsed.as_secs_f64(),
            info.loss
        );
    }

    fn on_error(&self, error: &str) {
        tracing::error!("Training failed: {}", error);
    }
}

/// Records every epoch summary.
#[derive(Debug, Clone, Default)]
pub struct HistoryCallback {
    history: Arc<Mutex<Vec<ProgressInfo>>>,
}

impl HistoryCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> Vec<ProgressInfo> {
        lock(&self.history).clone()
    }

    pub fn losses(&self) -> Vec<f64> {
        lock(&self.history).iter().map(|info| info.loss).collect()
    }

    pub fn clear(&self) {
        lock(&self.history).clear();
    }
}

impl ProgressCallback for HistoryCallback {
    fn on_progress(&self, info: &ProgressInfo) {
        lock(&self.history).push(info.clone());
    }
}

#[derive(Debug)]
struct StoppingState {
    best_loss: f64,
    stale_epochs: usize,
    stop: bool,
}

/// Stops training when the epoch loss stops improving.
#[derive(Debug, Clone)]
pub struct EarlyStoppingCallback {
    /// Improvement below this counts as no improvement.
    pub min_improvement: f64,
    /// Epochs without improvement before stopping.
    pub patience: usize,
    /// Stop as soon as the loss reaches this value.
    pub min_loss: Option<f64>,
    state: Arc<Mutex<StoppingState>>,
}

impl EarlyStoppingCallback {
    pub fn new(min_improvement: f64, patience: usize) -> Self {
        Self {
            min_improvement,
            patience,
            min_loss: None,
            state: Arc::new(Mutex::new(StoppingState {
                best_loss: f64::INFINITY,
                stale_epochs: 0,
                stop: false,
            })),
        }
    }

    pub fn with_min_loss(mut self, min_loss: f64) -> Self {
        self.min_loss = Some(min_loss);
        self
    }

    pub fn best_loss(&self) -> f64 {
        lock(&self.state).best_loss
    }

    pub fn reset(&self) {
        let mut state = lock(&self.state);
        state.best_loss = f64::INFINITY;
        state.stale_epochs = 0;
        state.stop = false;
    }
}

impl ProgressCallback for EarlyStoppingCallback {
    fn on_progress(&self, info: &ProgressInfo) {
        let mut state = lock(&self.state);

        if let Some(min_loss) = self.min_loss {
            if info.loss <= min_loss {
                state.stop = true;
                tracing::info!("Early stopping: loss {:.6} reached threshold {:.6}", info.loss, min_loss);
                return;
            }
        }

        if state.best_loss - info.loss > self.min_improvement {
            state.best_loss = info.loss;
            state.stale_epochs = 0;
        } else {
            state.stale_epochs += 1;
        }

        if state.stale_epochs >= self.patience {
            state.stop = true;
            tracing::info!(
                "Early stopping: no improvement for {} epochs (best loss {:.6}, current {:.6})",
                self.patience,
                state.best_loss,
                info.loss
            );
        }
    }

    fn should_stop(&self) -> bool {
        lock(&self.state).stop
    }
}

/// Fans session events out to registered callbacks.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    callbacks: Vec<Arc<dyn ProgressCallback>>,
    start_time: Option<Instant>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_callback(&mut self, callback: Arc<dyn ProgressCallback>) {
        self.callbacks.push(callback);
    }

    pub fn start(&mut self) {
        self.start_time = Some(Instant::now());
        for callback in &self.callbacks {
            callback.on_start();
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.map(|t| t.elapsed()).unwrap_or(Duration::ZERO)
    }

    /// Dispatch an epoch summary; `elapsed` and the estimate are filled in
    /// here.
    pub fn update(&self, mut info: ProgressInfo) {
        info.elapsed = self.elapsed();
        info.calculate_remaining();
        for callback in &self.callbacks {
            callback.on_progress(&info);
        }
    }

    pub fn should_stop(&self) -> bool {
        self.callbacks.iter().any(|callback| callback.should_stop())
    }

    pub fn complete(&self, mut info: ProgressInfo) {
        info.elapsed = self.elapsed();
        info.estimated_remaining = None;
        for callback in &self.callbacks {
            callback.on_complete(&info);
        }
    }

    pub fn error(&self, error: &str) {
        for callback in &self.callbacks {
            callback.on_error(error);
        }
    }
}
