//! Threaded capture worker
//!
//! Runs a capture source on a dedicated thread and hands frames over
//! through a bounded drop-oldest queue. Decouples a slow or bursty backend
//! from the producer pipeline's pacing: the pipeline always pulls the
//! newest frames the backend managed to deliver.

use super::{CaptureError, FrameSource};
use crate::frame::{FrameQueue, VideoFrame};
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Per-iteration wait on the wrapped source.
const INNER_WAIT: Duration = Duration::from_millis(100);
/// Backoff after a source error before retrying.
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Drives a [`FrameSource`] on its own thread.
pub struct CaptureWorker {
    queue: Arc<FrameQueue<VideoFrame>>,
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl CaptureWorker {
    /// Spawn the worker thread. Frames beyond `queue_capacity` evict the
    /// oldest queued frame.
    pub fn spawn(mut source: Box<dyn FrameSource>, queue_capacity: usize) -> Self {
        let queue = Arc::new(FrameQueue::new(queue_capacity));
        let running = Arc::new(AtomicBool::new(true));

        let thread_queue = queue.clone();
        let thread_running = running.clone();
        let handle = thread::spawn(move || {
            debug!("Capture worker thread started");
            while thread_running.load(Ordering::SeqCst) {
                match source.next_frame(INNER_WAIT) {
                    Ok(Some(frame)) => thread_queue.offer(frame),
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Capture worker: {}", e);
                        thread::sleep(ERROR_BACKOFF);
                    }
                }
            }
            debug!("Capture worker thread stopped");
        });

        Self {
            queue,
            running,
            handle: Some(handle),
        }
    }

    /// Frames evicted because the pipeline fell behind.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Stop the worker thread and release the queue.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.queue.close();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl FrameSource for CaptureWorker {
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<VideoFrame>, CaptureError> {
        Ok(self.queue.take(timeout))
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
