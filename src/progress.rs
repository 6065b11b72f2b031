use indicatif::{ProgressBar, ProgressStyle};
use std::cell::Cell;

/// One tick per task taken off the queue.
pub struct TaskProgress {
    bar: Option<ProgressBar>,
    finished: Cell<bool>,
}

impl TaskProgress {
    pub fn new(tasks: u64, enabled: bool) -> Self {
        let bar = if enabled {
            let pb = ProgressBar::new(tasks);
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} tasks {msg}")
            {
                pb.set_style(style.progress_chars("#>-"));
            }
            Some(pb)
        } else {
            None
        };

        Self {
            bar,
            finished: Cell::new(false),
        }
    }

    pub fn hidden() -> Self {
        Self::new(0, false)
    }

    pub fn inc(&self) {
        if let Some(ref pb) = self.bar {
            pb.inc(1);
        }
    }

    pub fn finish(&self, summary: String) {
        if self.finished.replace(true) {
            return;
        }

        if let Some(ref pb) = self.bar {
            pb.finish_with_message(summary);
        }
    }

    pub fn set_message(&self, msg: String) {
        if let Some(ref pb) = self.bar {
            pb.set_message(msg);
        }
    }
}

impl Drop for TaskProgress {
    fn drop(&mut self) {
        // clear only when the run ended without an explicit finish
        if !self.finished.get() {
            if let Some(ref pb) = self.bar {
                pb.finish_and_clear();
            }
        }
    }
}
