use dirnet_registration::{ProgressCallback, ProgressInfo};
use indicatif::{ProgressBar, ProgressStyle};

/// Terminal progress bar over training epochs.
pub struct EpochProgressBar {
    bar: ProgressBar,
}

impl EpochProgressBar {
    pub fn new(epochs: usize) -> anyhow::Result<Self> {
        let bar = ProgressBar::new(epochs as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] epoch {pos}/{len} ({eta}) {msg}")?
                .progress_chars("#>-"),
        );
        Ok(Self { bar })
    }
}

impl ProgressCallback for EpochProgressBar {
    fn on_progress(&self, info: &ProgressInfo) {
        self.bar.set_position(info.epoch as u64);
        self.bar
            .set_message(format!("loss {:.5} ncc {:.4}", info.loss, info.ncc));
    }

    fn on_complete(&self, info: &ProgressInfo) {
        self.bar
            .finish_with_message(format!("done, loss {:.5} ncc {:.4}", info.loss, info.ncc));
    }

    fn on_error(&self, error: &str) {
        self.bar.abandon_with_message(format!("failed: {}", error));
    }
}
