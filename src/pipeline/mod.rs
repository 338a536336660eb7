//! Frame pipelines and their shared bookkeeping
//!
//! One producer pipeline on the sender, one consumer pipeline on the
//! receiver. Both run as blocking workers gated by the session state;
//! the pieces here (stop control, error budget, latency telemetry) are
//! private to a single pipeline instance.

pub mod consumer;
pub mod producer;

pub use consumer::{ConsumerOutcome, ConsumerReport, ConsumerSettings, FrameConsumerPipeline};
pub use producer::{FrameProducerPipeline, ProducerReport, ProducerSettings};

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Signals a pipeline posts to the supervisor while running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineEvent {
    /// Consecutive-failure threshold reached; the pipeline has stopped.
    BudgetExhausted { failures: u32 },
}

/// Shared stop flag for one pipeline worker.
///
/// The supervisor registers this with the state machine so that leaving
/// `Connected` halts the worker synchronously; the worker polls it
/// between frames.
#[derive(Clone)]
pub struct PipelineControl {
    running: Arc<AtomicBool>,
}

impl PipelineControl {
    pub fn new() -> Self {
        Self { running: Arc::new(AtomicBool::new(true)) }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Default for PipelineControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Consecutive-failure counter gating the circuit-breaker stop.
///
/// Any success resets the run; the total survives for reporting.
#[derive(Debug)]
pub struct ErrorBudget {
    consecutive: u32,
    threshold: u32,
    total: u64,
}

impl ErrorBudget {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive: 0,
            threshold: threshold.max(1),
            total: 0,
        }
    }

    /// Count one classified failure; returns true when the threshold is
    /// now reached.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive += 1;
        self.total += 1;
        self.consecutive >= self.threshold
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn exhausted(&self) -> bool {
        self.consecutive >= self.threshold
    }
}

/// Rolling + cumulative per-frame latency, reported every N frames.
#[derive(Debug)]
pub struct LatencyStats {
    window: VecDeque<f64>,
    window_size: usize,
    total_ms: f64,
    frames: u64,
    report_every: u64,
}

/// One telemetry sample, produced every `report_every` frames.
#[derive(Debug, Clone, Copy)]
pub struct LatencySummary {
    pub frames: u64,
    pub avg_ms: f64,
    pub recent_ms: f64,
    pub last_ms: f64,
}

impl fmt::Display for LatencySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} frames, avg {:.2}ms, recent {:.2}ms, last {:.2}ms",
            self.frames, self.avg_ms, self.recent_ms, self.last_ms
        )
    }
}

impl LatencyStats {
    pub fn new(report_every: u64, window_size: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
            total_ms: 0.0,
            frames: 0,
            report_every: report_every.max(1),
        }
    }

    /// Record one frame's processing time; returns a summary when a
    /// report is due.
    pub fn record(&mut self, elapsed: Duration) -> Option<LatencySummary> {
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.frames += 1;
        self.total_ms += ms;
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(ms);

        if self.frames % self.report_every != 0 {
            return None;
        }
        let recent_ms = self.window.iter().sum::<f64>() / self.window.len() as f64;
        Some(LatencySummary {
            frames: self.frames,
            avg_ms: self.total_ms / self.frames as f64,
            recent_ms,
            last_ms: ms,
        })
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_reaches_threshold_on_tenth_failure() {
        let mut budget = ErrorBudget::new(10);
        for n in 1..=9 {
            assert!(!budget.record_failure(), "failure {} must not exhaust", n);
        }
        assert!(!budget.exhausted());
        assert!(budget.record_failure());
        assert!(budget.exhausted());
        assert_eq!(budget.total(), 10);
    }

    #[test]
    fn budget_resets_on_success() {
        let mut budget = ErrorBudget::new(3);
        budget.record_failure();
        budget.record_failure();
        budget.record_success();
        assert_eq!(budget.consecutive(), 0);
        assert!(!budget.exhausted());
        // A fresh run of failures still needs the full threshold.
        budget.record_failure();
        budget.record_failure();
        assert!(!budget.exhausted());
        assert!(budget.record_failure());
        assert_eq!(budget.total(), 5);
    }

    #[test]
    fn latency_reports_every_n_frames() {
        let mut stats = LatencyStats::new(30, 30);
        for n in 1..=29 {
            assert!(stats.record(Duration::from_millis(10)).is_none(), "frame {}", n);
        }
        let summary = stats.record(Duration::from_millis(10)).expect("report due");
        assert_eq!(summary.frames, 30);
        assert!((summary.avg_ms - 10.0).abs() < 0.5);
        assert!((summary.recent_ms - 10.0).abs() < 0.5);
    }

    #[test]
    fn latency_recent_window_tracks_last_samples() {
        let mut stats = LatencyStats::new(4, 2);
        stats.record(Duration::from_millis(100));
        stats.record(Duration::from_millis(100));
        stats.record(Duration::from_millis(10));
        let summary = stats.record(Duration::from_millis(10)).expect("report due");
        assert!((summary.recent_ms - 10.0).abs() < 0.5);
        assert!(summary.avg_ms > summary.recent_ms);
    }

    #[test]
    fn control_stops_once() {
        let control = PipelineControl::new();
        assert!(control.is_running());
        let clone = control.clone();
        clone.stop();
        assert!(!control.is_running());
    }
}
