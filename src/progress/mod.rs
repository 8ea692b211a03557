//! Progress/ETA (spec C9): a derived-only view over orchestration counters.
//! Holds no state of its own beyond the `start_time` the caller passes in —
//! mirrors the teacher's `transfer::stats::TransferStats`, a thin
//! accumulator-plus-derived-rate struct rather than anything stateful.

use std::time::{Duration, Instant};

use bytesize::ByteSize;
use indicatif::{ProgressBar, ProgressStyle};

#[derive(Debug, Clone, Copy)]
pub struct ProgressSnapshot {
    pub bytes_total: u64,
    pub bytes_done: u64,
    pub files_total: u64,
    pub files_done: u64,
    pub chunks_total: u64,
    pub chunks_done: u64,
}

pub fn percent_complete(snapshot: &ProgressSnapshot) -> f64 {
    let total = snapshot.bytes_total.max(1) as f64;
    (snapshot.bytes_done as f64 / total).clamp(0.0, 1.0)
}

/// `elapsed * (TotalBytes - BytesComplete) / max(BytesComplete, 1)` when
/// `BytesComplete > 0`; `None` (undefined) otherwise — spec §4.9.
pub fn eta(snapshot: &ProgressSnapshot, start_time: Instant) -> Option<Duration> {
    if snapshot.bytes_done == 0 {
        return None;
    }
    let elapsed = start_time.elapsed();
    let remaining = snapshot.bytes_total.saturating_sub(snapshot.bytes_done);
    let secs = elapsed.as_secs_f64() * remaining as f64 / snapshot.bytes_done.max(1) as f64;
    Some(Duration::from_secs_f64(secs.max(0.0)))
}

/// Same message register as the teacher's `TransferStats::print_summary`:
/// "N files (size) in Ts @ rate/s", reused for the run-level completion
/// banner.
pub fn format_summary(snapshot: &ProgressSnapshot, start_time: Instant) -> String {
    let elapsed = start_time.elapsed();
    let rate = if elapsed.as_secs_f64() > 0.0 {
        snapshot.bytes_done as f64 / elapsed.as_secs_f64()
    } else {
        0.0
    };
    format!(
        "{} files ({}) in {:.1}s @ {}/s",
        snapshot.files_done,
        ByteSize::b(snapshot.bytes_done),
        elapsed.as_secs_f64(),
        ByteSize::b(rate as u64),
    )
}

/// Builds an indicatif progress bar for a live run, matching the template
/// style of the teacher's `progress::bar` factory functions.
pub fn create_run_progress(total_bytes: u64, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(total_bytes);
    bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] \
             {bytes}/{total_bytes} ({bytes_per_sec}, ETA {eta}) {msg}",
        )
        .expect("static progress template is valid")
        .progress_chars("=>-"),
    );
    bar
}

pub fn render_live_line(snapshot: &ProgressSnapshot, start_time: Instant) -> String {
    let pct = percent_complete(snapshot) * 100.0;
    let eta_str = eta(snapshot, start_time)
        .map(|d| format!("{:.0}s", d.as_secs_f64()))
        .unwrap_or_else(|| "unknown".to_string());
    format!(
        "{:.1}% ({}/{} chunks, {}/{}) ETA {}",
        pct,
        snapshot.chunks_done,
        snapshot.chunks_total,
        ByteSize::b(snapshot.bytes_done),
        ByteSize::b(snapshot.bytes_total),
        eta_str,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_complete_clamps() {
        let snapshot = ProgressSnapshot {
            bytes_total: 100,
            bytes_done: 200,
            files_total: 0,
            files_done: 0,
            chunks_total: 0,
            chunks_done: 0,
        };
        assert_eq!(percent_complete(&snapshot), 1.0);
    }

    #[test]
    fn percent_complete_with_zero_total_is_zero() {
        let snapshot = ProgressSnapshot {
            bytes_total: 0,
            bytes_done: 0,
            files_total: 0,
            files_done: 0,
            chunks_total: 0,
            chunks_done: 0,
        };
        assert_eq!(percent_complete(&snapshot), 0.0);
    }

    #[test]
    fn eta_is_none_when_nothing_done() {
        let snapshot = ProgressSnapshot {
            bytes_total: 100,
            bytes_done: 0,
            files_total: 0,
            files_done: 0,
            chunks_total: 0,
            chunks_done: 0,
        };
        assert!(eta(&snapshot, Instant::now()).is_none());
    }

    #[test]
    fn eta_is_some_once_some_bytes_are_done() {
        let snapshot = ProgressSnapshot {
            bytes_total: 100,
            bytes_done: 50,
            files_total: 0,
            files_done: 0,
            chunks_total: 0,
            chunks_done: 0,
        };
        let start = Instant::now() - Duration::from_secs(10);
        assert!(eta(&snapshot, start).is_some());
    }

    #[test]
    fn format_summary_includes_file_count() {
        let snapshot = ProgressSnapshot {
            bytes_total: 1000,
            bytes_done: 1000,
            files_total: 5,
            files_done: 5,
            chunks_total: 2,
            chunks_done: 2,
        };
        let summary = format_summary(&snapshot, Instant::now());
        assert!(summary.contains("5 files"));
    }
}
