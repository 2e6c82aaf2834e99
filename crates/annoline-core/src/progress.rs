//! Progress reporting for TTY and non-TTY environments.
//!
//! TTY mode: one record bar for the run plus a spinner line for the
//! current batch. Non-TTY mode: hidden bars, progress goes to the log.

use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

fn run_bar_style() -> Option<ProgressStyle> {
    ProgressStyle::default_bar()
        .template("{prefix:<12.cyan.bold} {bar:30.green/dim} {pos:>6}/{len:6} {eta:>4} {wide_msg:.dim}")
        .ok()
        .map(|s| s.progress_chars("--"))
}

fn status_style() -> Option<ProgressStyle> {
    ProgressStyle::with_template("{spinner:.green} {prefix:<10.dim} {wide_msg}").ok()
}

/// First 12 characters of `name`, cut on a character boundary.
fn bar_prefix(name: &str) -> String {
    name.chars().take(12).collect()
}

/// Central progress context for a run.
pub struct ProgressContext {
    multi: MultiProgress,
    is_tty: bool,
}

impl ProgressContext {
    /// Create new context, detecting TTY automatically.
    pub fn new() -> Self {
        Self::with_tty(std::io::stderr().is_terminal())
    }

    /// Context with every bar hidden.
    pub fn hidden() -> Self {
        Self::with_tty(false)
    }

    fn with_tty(is_tty: bool) -> Self {
        Self {
            multi: MultiProgress::new(),
            is_tty,
        }
    }

    /// Bar counting terminal records out of `total`.
    pub fn run_bar(&self, name: &str, total: u64) -> ProgressBar {
        if !self.is_tty {
            return ProgressBar::hidden();
        }
        let pb = self.multi.add(ProgressBar::new(total));
        if let Some(style) = run_bar_style() {
            pb.set_style(style);
        }
        pb.set_prefix(bar_prefix(name));
        pb
    }

    /// Spinner line for the batch currently in flight.
    ///
    /// Update with `set_message`; call `finish_and_clear` when the run ends.
    pub fn status_line(&self, name: &str) -> ProgressBar {
        if !self.is_tty {
            return ProgressBar::hidden();
        }
        let pb = self.multi.add(ProgressBar::new(0));
        if let Some(style) = status_style() {
            pb.set_style(style);
        }
        pb.set_prefix(name.to_string());
        pb.enable_steady_tick(Duration::from_millis(80));
        pb
    }

    pub fn is_tty(&self) -> bool {
        self.is_tty
    }

    /// `MultiProgress` for the log bridge.
    pub fn multi(&self) -> &MultiProgress {
        &self.multi
    }
}

impl Default for ProgressContext {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedProgress = Arc<ProgressContext>;

/// Format number with thousand separators.
pub fn fmt_num(n: usize) -> String {
    let s = n.to_string();
    let mut out = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out.chars().rev().collect()
}

/// `12.5%` style ratio, `-` when `total` is zero.
pub fn fmt_pct(part: usize, total: usize) -> String {
    if total == 0 {
        return "-".to_string();
    }
    format!("{:.1}%", part as f64 * 100.0 / total as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fmt_num_small() {
        assert_eq!(fmt_num(0), "0");
        assert_eq!(fmt_num(12), "12");
        assert_eq!(fmt_num(123), "123");
    }

    #[test]
    fn fmt_num_thousands() {
        assert_eq!(fmt_num(1_000), "1,000");
        assert_eq!(fmt_num(123_456), "123,456");
        assert_eq!(fmt_num(1_234_567), "1,234,567");
    }

    #[test]
    fn fmt_pct_values() {
        assert_eq!(fmt_pct(0, 0), "-");
        assert_eq!(fmt_pct(1, 8), "12.5%");
        assert_eq!(fmt_pct(10, 10), "100.0%");
    }

    #[test]
    fn hidden_context_hands_out_hidden_bars() {
        let ctx = ProgressContext::hidden();
        assert!(!ctx.is_tty());
        assert!(ctx.run_bar("run", 10).is_hidden());
        assert!(ctx.status_line("batch").is_hidden());
    }

    #[test]
    fn bar_prefix_respects_char_boundaries() {
        assert_eq!(bar_prefix("snli"), "snli");
        assert_eq!(bar_prefix("datasets-éé-x"), "datasets-éé-");
        assert_eq!(bar_prefix("語彙語彙語彙語彙語彙語彙語彙"), "語彙語彙語彙語彙語彙語彙");
    }

    #[test]
    fn tty_run_bar_accepts_multibyte_names() {
        let ctx = ProgressContext::with_tty(true);
        let pb = ctx.run_bar("datasets-éé-x", 5);
        assert_eq!(pb.prefix(), "datasets-éé-");
    }
}
