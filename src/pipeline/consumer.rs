//! Consumer pipeline
//!
//! Drains the inbound queue and renders frames through the configured
//! sink. Failures are classified in two tiers:
//!
//! - per-frame problems (receive timeout, malformed frame, sink refusal)
//!   count against the error budget and the frame is skipped
//! - upstream queue closure and the stop control end the loop directly
//!
//! A successful render resets the budget. Once the budget is exhausted
//! the pipeline stops without attempting another receive and notifies
//! the supervisor.

use super::{ErrorBudget, LatencyStats, PipelineControl, PipelineEvent};
use crate::frame::{wall_clock_micros, FrameQueue, VideoFrame};
use crate::overlay::FrameAnnotator;
use crate::render::FrameSink;
use crate::transport::FramePacket;
use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// Why a consumer run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerOutcome {
    /// The stop control flipped (session teardown).
    Stopped,
    /// Consecutive failures exhausted the error budget.
    BudgetExhausted,
    /// Upstream closed the inbound queue; the stream ended cleanly.
    QueueClosed,
}

impl ConsumerOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerOutcome::Stopped => "stopped",
            ConsumerOutcome::BudgetExhausted => "error budget exhausted",
            ConsumerOutcome::QueueClosed => "stream ended",
        }
    }
}

/// Tuning for one consumer run.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Bound on one inbound queue wait.
    pub receive_timeout: Duration,
    /// Consecutive per-frame failures before the pipeline stops.
    pub error_threshold: u32,
    /// Frames between latency log lines.
    pub stats_interval: u64,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_secs(5),
            error_threshold: 10,
            stats_interval: 30,
        }
    }
}

/// Totals from a finished consumer run.
#[derive(Debug, Clone, Copy)]
pub struct ConsumerReport {
    /// Frames delivered to the sink.
    pub rendered: u64,
    /// Receive attempts made (queue waits).
    pub attempts: u64,
    /// Waits that elapsed without a frame.
    pub timeouts: u64,
    /// Frames discarded as malformed.
    pub malformed: u64,
    /// Frames the sink refused.
    pub sink_errors: u64,
    /// Why the loop ended.
    pub outcome: ConsumerOutcome,
}

impl Default for ConsumerReport {
    fn default() -> Self {
        Self {
            rendered: 0,
            attempts: 0,
            timeouts: 0,
            malformed: 0,
            sink_errors: 0,
            outcome: ConsumerOutcome::Stopped,
        }
    }
}

impl fmt::Display for ConsumerReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} rendered, {} timeouts, {} malformed, {} sink errors ({})",
            self.rendered,
            self.timeouts,
            self.malformed,
            self.sink_errors,
            self.outcome.as_str()
        )
    }
}

/// Renders inbound frames until stopped, exhausted or cut off upstream.
pub struct FrameConsumerPipeline {
    inbound: Arc<FrameQueue<FramePacket>>,
    sink: Box<dyn FrameSink>,
    annotator: Option<Box<dyn FrameAnnotator>>,
    control: PipelineControl,
    events: UnboundedSender<PipelineEvent>,
    settings: ConsumerSettings,
    budget: ErrorBudget,
    stats: LatencyStats,
    overlay_errors: u64,
}

impl FrameConsumerPipeline {
    pub fn new(
        inbound: Arc<FrameQueue<FramePacket>>,
        sink: Box<dyn FrameSink>,
        annotator: Option<Box<dyn FrameAnnotator>>,
        control: PipelineControl,
        events: UnboundedSender<PipelineEvent>,
        settings: ConsumerSettings,
    ) -> Self {
        let budget = ErrorBudget::new(settings.error_threshold);
        let stats = LatencyStats::new(settings.stats_interval, settings.stats_interval as usize);
        Self {
            inbound,
            sink,
            annotator,
            control,
            events,
            settings,
            budget,
            stats,
            overlay_errors: 0,
        }
    }

    /// Blocking render loop.
    pub fn run(mut self) -> ConsumerReport {
        info!(
            "Consumer pipeline started (receive timeout {:?}, error threshold {})",
            self.settings.receive_timeout, self.settings.error_threshold
        );
        let mut report = ConsumerReport::default();

        while self.control.is_running() {
            report.attempts += 1;
            let packet = match self.inbound.take(self.settings.receive_timeout) {
                Some(packet) => packet,
                None if self.inbound.is_closed() => {
                    debug!("Inbound queue closed upstream, consumer finishing");
                    report.outcome = ConsumerOutcome::QueueClosed;
                    break;
                }
                None => {
                    report.timeouts += 1;
                    warn!(
                        "No frame received within {:?} ({} consecutive failures)",
                        self.settings.receive_timeout,
                        self.budget.consecutive() + 1
                    );
                    if self.register_failure(&mut report) {
                        break;
                    }
                    continue;
                }
            };

            let frame = match VideoFrame::try_from(packet) {
                Ok(frame) => frame,
                Err(e) => {
                    report.malformed += 1;
                    if report.malformed <= 5 || report.malformed % 100 == 0 {
                        warn!("Discarding malformed frame: {}", e);
                    }
                    if self.register_failure(&mut report) {
                        break;
                    }
                    continue;
                }
            };

            let capture_ts_us = frame.capture_ts_us;
            let mut frame = frame.into_rgb();
            if let Some(annotator) = self.annotator.as_mut() {
                if let Err(e) = annotator.annotate(&mut frame) {
                    self.overlay_errors += 1;
                    if self.overlay_errors <= 3 {
                        warn!("Receiver overlay skipped: {}", e);
                    }
                }
            }

            match self.sink.accept_frame(&frame) {
                Ok(()) => {
                    self.budget.record_success();
                    report.rendered += 1;
                    if report.rendered <= 5 || report.rendered % 500 == 0 {
                        debug!("Rendered {} frames (pts={})", report.rendered, frame.pts);
                    }
                    let e2e_us = wall_clock_micros().saturating_sub(capture_ts_us);
                    if let Some(summary) = self.stats.record(Duration::from_micros(e2e_us)) {
                        info!("Capture-to-render latency: {}", summary);
                    }
                }
                Err(e) => {
                    report.sink_errors += 1;
                    warn!("Sink rejected frame: {}", e);
                    if self.register_failure(&mut report) {
                        break;
                    }
                }
            }
        }

        info!("Consumer pipeline stopped: {}", report);
        report
    }

    /// Count one per-frame failure; true means the budget is exhausted
    /// and the loop must end now.
    fn register_failure(&mut self, report: &mut ConsumerReport) -> bool {
        if self.budget.record_failure() {
            let failures = self.budget.consecutive();
            warn!(
                "Error budget exhausted after {} consecutive failures, stopping consumer",
                failures
            );
            report.outcome = ConsumerOutcome::BudgetExhausted;
            let _ = self.events.send(PipelineEvent::BudgetExhausted { failures });
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{NullSink, SinkError};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    fn fast_settings(threshold: u32) -> ConsumerSettings {
        ConsumerSettings {
            receive_timeout: Duration::from_millis(10),
            error_threshold: threshold,
            stats_interval: 1000,
        }
    }

    fn valid_packet(pts: u64) -> FramePacket {
        FramePacket {
            pts,
            tb_num: 1,
            tb_den: 30,
            capture_ts_us: wall_clock_micros(),
            width: 2,
            height: 2,
            format: 0,
            flags: 0,
            payload: Bytes::from(vec![9u8; 12]),
        }
    }

    fn malformed_packet(pts: u64) -> FramePacket {
        let mut packet = valid_packet(pts);
        packet.payload = Bytes::from(vec![9u8; 5]);
        packet
    }

    struct RecordingSink {
        pts: Arc<Mutex<Vec<u64>>>,
    }

    impl FrameSink for RecordingSink {
        fn accept_frame(&mut self, frame: &VideoFrame) -> Result<(), SinkError> {
            self.pts.lock().push(frame.pts);
            Ok(())
        }
    }

    struct RefusingSink;

    impl FrameSink for RefusingSink {
        fn accept_frame(&mut self, _frame: &VideoFrame) -> Result<(), SinkError> {
            Err(SinkError::Encode("refused".to_string()))
        }
    }

    fn build(
        queue: &Arc<FrameQueue<FramePacket>>,
        sink: Box<dyn FrameSink>,
        threshold: u32,
    ) -> (
        FrameConsumerPipeline,
        PipelineControl,
        mpsc::UnboundedReceiver<PipelineEvent>,
    ) {
        let control = PipelineControl::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let pipeline = FrameConsumerPipeline::new(
            queue.clone(),
            sink,
            None,
            control.clone(),
            tx,
            fast_settings(threshold),
        );
        (pipeline, control, rx)
    }

    #[test]
    fn test_renders_in_order_then_exhausts_on_timeouts() {
        let queue = Arc::new(FrameQueue::new(8));
        for pts in 0..3 {
            queue.offer(valid_packet(pts));
        }
        let pts_log = Arc::new(Mutex::new(Vec::new()));
        let sink = RecordingSink { pts: pts_log.clone() };
        let (pipeline, _control, mut rx) = build(&queue, Box::new(sink), 3);

        let report = pipeline.run();
        assert_eq!(report.rendered, 3);
        assert_eq!(*pts_log.lock(), vec![0, 1, 2]);
        // Renders reset the budget, so a fresh run of 3 timeouts was needed.
        assert_eq!(report.timeouts, 3);
        assert_eq!(report.attempts, 6);
        assert_eq!(report.outcome, ConsumerOutcome::BudgetExhausted);
        assert!(matches!(
            rx.try_recv(),
            Ok(PipelineEvent::BudgetExhausted { failures: 3 })
        ));
    }

    #[test]
    fn test_no_receive_after_budget_exhaustion() {
        let queue = Arc::new(FrameQueue::new(8));
        let (pipeline, _control, mut rx) = build(&queue, Box::new(NullSink::new()), 4);

        let report = pipeline.run();
        assert_eq!(report.attempts, 4);
        assert_eq!(report.timeouts, 4);
        assert_eq!(report.rendered, 0);
        assert_eq!(report.outcome, ConsumerOutcome::BudgetExhausted);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_success_resets_the_budget() {
        let queue = Arc::new(FrameQueue::new(8));
        queue.offer(malformed_packet(0));
        queue.offer(malformed_packet(1));
        queue.offer(valid_packet(2));
        queue.offer(malformed_packet(3));
        queue.offer(malformed_packet(4));
        let (pipeline, _control, _rx) = build(&queue, Box::new(NullSink::new()), 3);

        let report = pipeline.run();
        // Two malformed, reset by a render, two malformed, one timeout.
        assert_eq!(report.rendered, 1);
        assert_eq!(report.malformed, 4);
        assert_eq!(report.timeouts, 1);
        assert_eq!(report.outcome, ConsumerOutcome::BudgetExhausted);
    }

    #[test]
    fn test_closed_queue_ends_cleanly() {
        let queue = Arc::new(FrameQueue::new(8));
        queue.offer(valid_packet(0));
        queue.close();
        let (pipeline, _control, mut rx) = build(&queue, Box::new(NullSink::new()), 3);

        let report = pipeline.run();
        assert_eq!(report.rendered, 1);
        assert_eq!(report.outcome, ConsumerOutcome::QueueClosed);
        assert_eq!(report.timeouts, 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_stop_control_wins_before_first_receive() {
        let queue = Arc::new(FrameQueue::new(8));
        queue.offer(valid_packet(0));
        let (pipeline, control, _rx) = build(&queue, Box::new(NullSink::new()), 3);
        control.stop();

        let report = pipeline.run();
        assert_eq!(report.attempts, 0);
        assert_eq!(report.outcome, ConsumerOutcome::Stopped);
    }

    #[test]
    fn test_sink_refusals_count_against_budget() {
        let queue = Arc::new(FrameQueue::new(8));
        queue.offer(valid_packet(0));
        queue.offer(valid_packet(1));
        let (pipeline, _control, mut rx) = build(&queue, Box::new(RefusingSink), 2);

        let report = pipeline.run();
        assert_eq!(report.rendered, 0);
        assert_eq!(report.sink_errors, 2);
        assert_eq!(report.outcome, ConsumerOutcome::BudgetExhausted);
        assert!(matches!(
            rx.try_recv(),
            Ok(PipelineEvent::BudgetExhausted { failures: 2 })
        ));
    }
}
