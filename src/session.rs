//! Capture session state machine.
//!
//! A session walks the device through request → map → queue → stream-on,
//! hands complete frames to a consumer, and always unwinds through
//! stream-off → unmap → release, whether it ends normally, on error or by
//! being dropped.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::device::CaptureDevice;
use crate::error::{CaptureError, DeviceError};
use crate::format::StreamFormat;
use crate::pool::{FramePool, PoolCounts};
use crate::stats::SessionStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Requested,
    Mapped,
    Streaming,
    Stopping,
    Unmapped,
}

/// Consumer verdict after each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// A dequeued frame, readable for the duration of the consumer call.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub data: &'a [u8],
    pub index: u32,
    pub sequence: u32,
    /// Driver timestamp; zero when the driver does not provide one.
    pub timestamp: Duration,
    pub format: StreamFormat,
}

/// What teardown managed to undo.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub unmapped: usize,
    pub unmap_failures: usize,
    pub stream_off_failed: bool,
    pub release_failed: bool,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.unmap_failures == 0 && !self.stream_off_failed && !self.release_failed
    }
}

pub struct CaptureSession<'d> {
    device: &'d mut dyn CaptureDevice,
    format: StreamFormat,
    pool: FramePool,
    state: SessionState,
    /// A buffer request is outstanding and must be released.
    requested: bool,
    stats: SessionStats,
    label: &'static str,
}

impl<'d> CaptureSession<'d> {
    /// Allocate `count` buffers on `device`, map and queue them, and start
    /// streaming. On failure everything set up so far is undone before the
    /// error is returned.
    pub fn start(
        device: &'d mut dyn CaptureDevice,
        format: StreamFormat,
        count: u32,
        label: &'static str,
    ) -> Result<Self, CaptureError> {
        let mut session = Self {
            device,
            format,
            pool: FramePool::with_capacity(count as usize),
            state: SessionState::Idle,
            requested: false,
            stats: SessionStats::default(),
            label,
        };
        // An error drops `session`, which tears down whatever was set up.
        session.setup(count)?;
        info!(
            session = label,
            format = %format,
            buffers = session.pool.len(),
            "Capture session started"
        );
        Ok(session)
    }

    fn setup(&mut self, count: u32) -> Result<(), CaptureError> {
        let granted = self
            .device
            .request_buffers(count)
            .map_err(|e| CaptureError::resources(format!("request of {count} buffers failed: {e}")))?;
        self.requested = true;
        self.state = SessionState::Requested;
        if granted == 0 {
            return Err(CaptureError::resources("device granted zero buffers"));
        }
        if granted != count {
            debug!(session = self.label, requested = count, granted, "Buffer count adjusted by driver");
        }

        for index in 0..granted {
            let descriptor = self
                .device
                .query_buffer(index)
                .map_err(|e| CaptureError::resources(format!("query of buffer {index} failed: {e}")))?;
            let region = self
                .device
                .map(&descriptor)
                .map_err(|e| CaptureError::resources(format!("map of buffer {index} failed: {e}")))?;
            self.pool.insert(region)?;
            self.device
                .queue(index)
                .map_err(|e| CaptureError::protocol("queue", e))?;
            self.pool.mark_queued(index)?;
        }
        self.state = SessionState::Mapped;
        debug!(session = self.label, buffers = granted, "Buffers mapped and queued");

        self.device
            .stream_on()
            .map_err(|e| CaptureError::protocol("stream-on", e))?;
        self.state = SessionState::Streaming;
        Ok(())
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn pool_counts(&self) -> PoolCounts {
        self.pool.counts()
    }

    fn requeue(&mut self, index: u32) -> Result<(), CaptureError> {
        self.device
            .queue(index)
            .map_err(|e| CaptureError::protocol("requeue", e))?;
        self.pool.mark_queued(index)
    }

    /// Wait for the next complete frame and pass it to `consume`.
    ///
    /// Interrupted dequeues are retried and incomplete buffers are re-queued
    /// unread. The buffer goes back to the hardware after `consume` returns,
    /// whatever it returned.
    pub fn next_frame<R>(&mut self, consume: impl FnOnce(Frame<'_>) -> R) -> Result<R, CaptureError> {
        if self.state != SessionState::Streaming {
            return Err(CaptureError::protocol(
                "dequeue",
                DeviceError::InvalidState {
                    op: "dequeue",
                    reason: "session is not streaming",
                },
            ));
        }

        loop {
            let buffer = match self.device.dequeue() {
                Ok(buffer) => buffer,
                Err(e) if e.is_interrupted() => {
                    self.stats.interrupted += 1;
                    continue;
                }
                Err(e) => return Err(CaptureError::protocol("dequeue", e)),
            };
            self.pool.mark_dequeued(buffer.index)?;

            if !buffer.is_complete() {
                self.stats.incomplete += 1;
                debug!(session = self.label, index = buffer.index, "Incomplete buffer, re-queueing");
                self.requeue(buffer.index)?;
                continue;
            }

            let result = {
                let data = self.pool.frame(buffer.index, buffer.bytes_used)?;
                consume(Frame {
                    data,
                    index: buffer.index,
                    sequence: buffer.sequence,
                    timestamp: buffer.timestamp,
                    format: self.format,
                })
            };
            self.requeue(buffer.index)?;
            self.stats.frames += 1;
            return Ok(result);
        }
    }

    /// Feed frames to `consume` until it returns [`Flow::Stop`] or the device fails.
    pub fn run(&mut self, mut consume: impl FnMut(Frame<'_>) -> Flow) -> Result<SessionStats, CaptureError> {
        while self.next_frame(&mut consume)? == Flow::Continue {}
        Ok(self.stats)
    }

    /// Stop streaming, unmap every buffer and release the request.
    ///
    /// Each step is attempted even if an earlier one failed. Calling this on
    /// a session that is already idle does nothing.
    pub fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.state == SessionState::Idle {
            return report;
        }

        let was_streaming = self.state == SessionState::Streaming;
        self.state = SessionState::Stopping;
        if was_streaming {
            if let Err(e) = self.device.stream_off() {
                warn!(session = self.label, error = %e, "Stream off failed");
                report.stream_off_failed = true;
            }
        }
        self.pool.reclaim_all();

        for region in self.pool.drain() {
            let index = region.index();
            match self.device.unmap(region) {
                Ok(()) => report.unmapped += 1,
                Err(e) => {
                    warn!(session = self.label, index, error = %e, "Unmap failed");
                    report.unmap_failures += 1;
                }
            }
        }
        self.state = SessionState::Unmapped;

        if self.requested {
            if let Err(e) = self.device.request_buffers(0) {
                warn!(session = self.label, error = %e, "Buffer release failed");
                report.release_failed = true;
            }
            self.requested = false;
        }
        self.state = SessionState::Idle;

        info!(
            session = self.label,
            frames = self.stats.frames,
            incomplete = self.stats.incomplete,
            clean = report.is_clean(),
            "Capture session stopped"
        );
        report
    }
}

impl Drop for CaptureSession<'_> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Run a one-buffer session for exactly one frame.
pub fn capture_single<R>(
    device: &mut dyn CaptureDevice,
    format: StreamFormat,
    count: u32,
    consume: impl FnOnce(Frame<'_>) -> R,
) -> Result<R, CaptureError> {
    let mut session = CaptureSession::start(device, format, count.max(1), "capture")?;
    let result = session.next_frame(consume);
    session.teardown();
    result
}
