//! Progress reporting for the download engine.
//!
//! The manager only talks to a [`ProgressSink`]; the console renderer, the
//! no-op sink and the test recorder are interchangeable.

use std::io::IsTerminal;
use std::sync::Mutex;

use indicatif::{ProgressBar, ProgressStyle};

pub trait ProgressSink: Send + Sync {
    /// A gallery with `total` files to account for is about to be processed.
    fn start_gallery(&self, name: &str, total: u64);

    /// `n` more files of the current gallery are settled.
    fn advance(&self, n: u64);

    fn finish_gallery(&self, name: &str, downloaded: u64, total: u64, failed: u64);

    /// Run `f` (typically a log statement) without tearing the display.
    fn suspend(&self, f: &dyn Fn()) {
        f()
    }
}

/// Create a progress bar with a consistent template.
///
/// Returns `ProgressBar::hidden()` when disabled or when stdout is not a TTY.
pub fn create_progress_bar(no_progress_bar: bool, total: u64) -> ProgressBar {
    if no_progress_bar || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::with_template(
        "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    )
    .map(|s| s.progress_chars("=> "))
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb
}

/// One indicatif bar per gallery.
#[derive(Debug)]
pub struct ConsoleProgress {
    no_progress_bar: bool,
    bar: Mutex<ProgressBar>,
}

impl ConsoleProgress {
    pub fn new(no_progress_bar: bool) -> Self {
        Self {
            no_progress_bar,
            bar: Mutex::new(ProgressBar::hidden()),
        }
    }

    fn bar(&self) -> ProgressBar {
        self.bar.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ProgressSink for ConsoleProgress {
    fn start_gallery(&self, name: &str, total: u64) {
        let pb = create_progress_bar(self.no_progress_bar, total);
        pb.set_message(name.to_string());
        let old = std::mem::replace(&mut *self.bar.lock().unwrap_or_else(|e| e.into_inner()), pb);
        old.finish_and_clear();
    }

    fn advance(&self, n: u64) {
        self.bar().inc(n);
    }

    fn finish_gallery(&self, name: &str, downloaded: u64, total: u64, failed: u64) {
        let pb = self.bar();
        let msg = if failed > 0 {
            format!("{name}: {downloaded}/{total} downloaded, {failed} failed")
        } else {
            format!("{name}: {downloaded}/{total} downloaded")
        };
        pb.finish_with_message(msg);
    }

    fn suspend(&self, f: &dyn Fn()) {
        self.bar().suspend(f)
    }
}

/// Discards all progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn start_gallery(&self, _name: &str, _total: u64) {}
    fn advance(&self, _n: u64) {}
    fn finish_gallery(&self, _name: &str, _downloaded: u64, _total: u64, _failed: u64) {}
}
