//! Producer pipeline
//!
//! Paces capture at the configured frame rate and keeps the outbound
//! queue fed no matter what the capture source does:
//!
//! - waits a bounded time for a captured frame (short retries)
//! - synthesizes a black filler frame when capture starves or errors
//! - stamps pts and time-base exactly once per emitted frame
//! - applies the optional overlay, tolerating its failures
//!
//! Capture errors are counted against an error budget for visibility but
//! never stop the pipeline; a live stream of fillers beats a dead one.
//! Only the stop control ends the loop.

use super::{ErrorBudget, LatencyStats, PipelineControl};
use crate::capture::FrameSource;
use crate::frame::{FrameQueue, PixelFormat, TimeBase, VideoFrame};
use crate::overlay::FrameAnnotator;
use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Tuning for one producer run.
#[derive(Debug, Clone)]
pub struct ProducerSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    /// Single capture attempt wait.
    pub capture_wait: Duration,
    /// Capture attempts per frame slot before synthesizing a filler.
    pub capture_retries: u32,
    /// Frames between latency log lines.
    pub stats_interval: u64,
    /// Consecutive capture errors before the persistent-failure warning.
    pub error_threshold: u32,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Rgb24,
            capture_wait: Duration::from_millis(10),
            capture_retries: 10,
            stats_interval: 30,
            error_threshold: 10,
        }
    }
}

/// Totals from a finished producer run.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProducerReport {
    /// Frames stamped and offered to the outbound queue.
    pub produced: u64,
    /// Of those, synthesized fillers.
    pub fillers: u64,
    /// Capture attempts that returned an error.
    pub capture_errors: u64,
    /// Frames whose overlay failed and was skipped.
    pub overlay_errors: u64,
    /// Frames evicted from the outbound queue by newer ones.
    pub dropped: u64,
}

impl fmt::Display for ProducerReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} frames ({} fillers), {} capture errors, {} overlay errors, {} dropped",
            self.produced, self.fillers, self.capture_errors, self.overlay_errors, self.dropped
        )
    }
}

/// Captures, stamps and queues frames until stopped.
pub struct FrameProducerPipeline {
    source: Box<dyn FrameSource>,
    annotator: Option<Box<dyn FrameAnnotator>>,
    outbound: Arc<FrameQueue<VideoFrame>>,
    control: PipelineControl,
    settings: ProducerSettings,
    budget: ErrorBudget,
    stats: LatencyStats,
}

impl FrameProducerPipeline {
    pub fn new(
        source: Box<dyn FrameSource>,
        annotator: Option<Box<dyn FrameAnnotator>>,
        outbound: Arc<FrameQueue<VideoFrame>>,
        control: PipelineControl,
        settings: ProducerSettings,
    ) -> Self {
        let budget = ErrorBudget::new(settings.error_threshold);
        let stats = LatencyStats::new(settings.stats_interval, settings.stats_interval as usize);
        Self {
            source,
            annotator,
            outbound,
            control,
            settings,
            budget,
            stats,
        }
    }

    /// Blocking frame loop; returns once the control flag stops it.
    pub fn run(mut self) -> ProducerReport {
        let time_base = TimeBase::per_frame(self.settings.fps);
        let interval = time_base.interval();
        info!(
            "Producer pipeline started: {}x{}@{}fps {} (interval {:?})",
            self.settings.width,
            self.settings.height,
            self.settings.fps,
            self.settings.format.as_str(),
            interval
        );

        let mut report = ProducerReport::default();
        let mut pts: u64 = 0;
        let mut next_tick = Instant::now();

        while self.control.is_running() {
            let now = Instant::now();
            if next_tick > now {
                thread::sleep(next_tick - now);
            }
            next_tick += interval;
            let now = Instant::now();
            if next_tick < now {
                // Fell behind (slow capture); resume cadence from here
                // instead of bursting to catch up.
                next_tick = now + interval;
            }

            let slot_started = Instant::now();
            let mut captured = None;
            for _ in 0..self.settings.capture_retries {
                if !self.control.is_running() {
                    break;
                }
                match self.source.next_frame(self.settings.capture_wait) {
                    Ok(Some(frame)) => {
                        captured = Some(frame);
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        report.capture_errors += 1;
                        let exhausted = self.budget.record_failure();
                        let consecutive = self.budget.consecutive();
                        if exhausted
                            && (consecutive == self.budget.threshold() || consecutive % 100 == 0)
                        {
                            warn!(
                                "Capture failing persistently ({} consecutive errors): {}",
                                consecutive, e
                            );
                        } else {
                            debug!("Capture error: {}", e);
                        }
                    }
                }
            }
            if !self.control.is_running() {
                break;
            }

            let mut frame = match captured {
                Some(frame) => {
                    self.budget.record_success();
                    frame
                }
                None => {
                    report.fillers += 1;
                    if report.fillers <= 5 || report.fillers % 500 == 0 {
                        debug!("Capture starved, synthesizing filler frame {}", report.fillers);
                    }
                    VideoFrame::filler(
                        self.settings.width,
                        self.settings.height,
                        self.settings.format,
                    )
                }
            };

            frame.stamp(pts, time_base);
            pts += 1;

            if let Some(annotator) = self.annotator.as_mut() {
                if let Err(e) = annotator.annotate(&mut frame) {
                    report.overlay_errors += 1;
                    if report.overlay_errors <= 3 {
                        warn!("Overlay skipped: {}", e);
                    }
                }
            }

            self.outbound.offer(frame);
            report.produced += 1;

            if let Some(summary) = self.stats.record(slot_started.elapsed()) {
                info!("Producer latency: {}", summary);
            }
        }

        report.dropped = self.outbound.dropped();
        info!("Producer pipeline stopped: {}", report);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureError;
    use crate::overlay::OverlayError;

    fn fast_settings() -> ProducerSettings {
        ProducerSettings {
            width: 8,
            height: 8,
            fps: 1000,
            format: PixelFormat::Rgb24,
            capture_wait: Duration::from_millis(1),
            capture_retries: 2,
            stats_interval: 1000,
            error_threshold: 10,
        }
    }

    struct ImmediateSource;

    impl FrameSource for ImmediateSource {
        fn next_frame(&mut self, _timeout: Duration) -> Result<Option<VideoFrame>, CaptureError> {
            Ok(Some(VideoFrame::captured(8, 8, PixelFormat::Rgb24, vec![1u8; 192])))
        }
    }

    struct StarvedSource;

    impl FrameSource for StarvedSource {
        fn next_frame(&mut self, _timeout: Duration) -> Result<Option<VideoFrame>, CaptureError> {
            Ok(None)
        }
    }

    struct FailingSource;

    impl FrameSource for FailingSource {
        fn next_frame(&mut self, _timeout: Duration) -> Result<Option<VideoFrame>, CaptureError> {
            Err(CaptureError::Backend("simulated".to_string()))
        }
    }

    struct FailingAnnotator;

    impl FrameAnnotator for FailingAnnotator {
        fn annotate(&mut self, _frame: &mut VideoFrame) -> Result<(), OverlayError> {
            Err(OverlayError::BadPayload)
        }
    }

    fn run_briefly(
        source: Box<dyn FrameSource>,
        annotator: Option<Box<dyn FrameAnnotator>>,
        settings: ProducerSettings,
    ) -> (ProducerReport, Arc<FrameQueue<VideoFrame>>) {
        let queue = Arc::new(FrameQueue::new(64));
        let control = PipelineControl::new();
        let pipeline =
            FrameProducerPipeline::new(source, annotator, queue.clone(), control.clone(), settings);
        let handle = thread::spawn(move || pipeline.run());
        thread::sleep(Duration::from_millis(60));
        control.stop();
        (handle.join().unwrap(), queue)
    }

    #[test]
    fn test_pts_strictly_increase() {
        let (report, queue) = run_briefly(Box::new(ImmediateSource), None, fast_settings());
        assert!(report.produced > 0);
        assert_eq!(report.fillers, 0);

        let mut expected_next = None;
        while let Some(frame) = queue.take(Duration::from_millis(1)) {
            if let Some(expected) = expected_next {
                assert_eq!(frame.pts, expected);
            }
            assert_eq!(frame.time_base, TimeBase::per_frame(1000));
            expected_next = Some(frame.pts + 1);
        }
        assert!(expected_next.is_some());
    }

    #[test]
    fn test_starved_capture_yields_fillers() {
        let (report, queue) = run_briefly(Box::new(StarvedSource), None, fast_settings());
        assert!(report.fillers > 0);
        assert_eq!(report.fillers, report.produced);
        let frame = queue.take(Duration::from_millis(1)).expect("filler queued");
        assert!(frame.filler);
        assert!(frame.data.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_capture_errors_never_stop_the_pipeline() {
        let mut settings = fast_settings();
        settings.error_threshold = 5;
        let (report, _queue) = run_briefly(Box::new(FailingSource), None, settings);
        // Well past the threshold, yet frames kept flowing as fillers.
        assert!(report.capture_errors > 5);
        assert!(report.produced > 0);
        assert_eq!(report.fillers, report.produced);
    }

    #[test]
    fn test_overlay_failure_is_not_fatal() {
        let (report, queue) = run_briefly(
            Box::new(ImmediateSource),
            Some(Box::new(FailingAnnotator)),
            fast_settings(),
        );
        assert!(report.produced > 0);
        assert!(report.overlay_errors > 0);
        assert!(queue.take(Duration::from_millis(1)).is_some());
    }
}
