//! CLI-specific progress handling for tumulus
//!
//! Provides progress bar implementation for the command-line interface.

use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use tumulus::ProgressCallback;

/// Creates a progress bar counting tiles
pub fn create_progress_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} tiles ({percent}%) ETA: {eta}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    pb.set_style(style);
    pb
}

/// Progress manager for tiling and detection runs
pub struct ProgressManager {
    pub pb: ProgressBar,
}

impl ProgressManager {
    /// Create a new progress manager
    pub fn new(total: u64, message: &str) -> Self {
        let pb = create_progress_bar(total);

        // Print initial message to stderr
        eprintln!("{message}");

        Self { pb }
    }

    /// Library callback driving this bar; the length follows the reported total
    pub fn callback(&self, finish_message: &'static str) -> ProgressCallback {
        let pb = self.pb.clone();
        Arc::new(move |done, total| {
            if pb.length().unwrap_or(0) != total {
                pb.set_length(total);
            }
            pb.set_position(done);
            if done >= total {
                pb.finish_with_message(finish_message);
            }
        })
    }
}
