//! CLI-specific progress handling for drivetime-matrix
//!
//! Route calls and table batches are slow (paced to the public services), so
//! the CLI shows a count-based progress bar while they run.

use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};

use drivetime_matrix::ProgressCallback;

/// Creates a progress bar for counting route calls or batches
pub fn create_progress_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({percent}%) ETA: {eta}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    pb.set_style(style);
    pb
}

/// Progress manager for a synchronisation run
pub struct ProgressManager {
    pub pb: ProgressBar,
}

impl ProgressManager {
    /// Create a new progress manager; the length is set by the first callback
    pub fn new(message: &str) -> Self {
        let pb = create_progress_bar(0);

        // Print initial message to stderr
        eprintln!("{message}");

        Self { pb }
    }

    /// Callback to hand to the engine
    pub fn callback(&self) -> ProgressCallback {
        let pb = self.pb.clone();
        Arc::new(move |done: u64, total: u64| {
            if pb.length() != Some(total) {
                pb.set_length(total);
            }
            pb.set_position(done);
        })
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}
