//! In-memory capture device for running without hardware.
//!
//! Behaves like a V4L2 mmap capture driver: buffers are allocated on request,
//! filled with a test pattern on dequeue and refuse re-allocation while
//! mapped. Faults can be injected per call and every call is counted through
//! a [`SimHandle`] that stays usable after the device has been moved away.

use std::collections::VecDeque;
use std::io;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use super::{BufferDescriptor, CaptureDevice, DequeuedBuffer, MappedRegion};
use crate::error::DeviceError;
use crate::format::{PixelFormat, StreamFormat};

const PAGE_SIZE: u64 = 4096;

/// Frame content generated by the simulated sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    /// Moving vertical color bars.
    Bars,
    Solid([u8; 3]),
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub name: String,
    pub initial_format: StreamFormat,
    /// Formats `set_format` will apply; others are substituted with the current one.
    pub supported: Vec<PixelFormat>,
    pub max_buffers: u32,
    /// Delay before each dequeue returns, to pace frames like a sensor would.
    pub frame_interval: Duration,
    pub pattern: Pattern,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            name: "sim0".to_string(),
            initial_format: StreamFormat::new(640, 480, PixelFormat::Raw10),
            supported: vec![
                PixelFormat::Raw10,
                PixelFormat::Rgb565,
                PixelFormat::Rgb24,
                PixelFormat::Yuv422p,
                PixelFormat::Grey,
            ],
            max_buffers: 8,
            frame_interval: Duration::ZERO,
            pattern: Pattern::Bars,
        }
    }
}

/// Faults to inject into upcoming calls.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    pub fail_get_format: bool,
    /// `set_format` returns EINVAL for these.
    pub rejected_formats: Vec<PixelFormat>,
    /// Grant this many buffers instead of the requested count.
    pub grant_buffers: Option<u32>,
    pub fail_query_at: Option<u32>,
    pub fail_map_at: Option<u32>,
    pub fail_unmap_at: Option<u32>,
    pub fail_stream_on: bool,
    pub fail_stream_off: bool,
    /// Number of upcoming dequeues that report EINTR.
    pub interrupt_dequeues: u32,
    /// Number of upcoming frames delivered without the DONE flag.
    pub incomplete_frames: u32,
    /// Number of upcoming complete frames that report half their bytes used.
    pub short_frames: u32,
    /// Dequeue fails with EIO once this many frames were delivered.
    pub fail_dequeue_after: Option<u64>,
}

/// Call accounting and current state of a simulated device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub set_format_calls: u64,
    pub requests: u64,
    pub releases: u64,
    pub maps: u64,
    pub map_failures: u64,
    pub unmaps: u64,
    pub queued: u64,
    pub dequeued: u64,
    pub stream_ons: u64,
    pub stream_offs: u64,
    pub frames: u64,
    pub allocated_now: u32,
    pub mapped_now: u32,
    pub queued_now: u32,
    pub streaming: bool,
}

#[derive(Default)]
struct Shared {
    faults: Mutex<FaultPlan>,
    counters: Mutex<CounterSnapshot>,
}

/// Remote control for a [`SimulatedDevice`].
#[derive(Clone)]
pub struct SimHandle(Arc<Shared>);

impl SimHandle {
    pub fn inject(&self, update: impl FnOnce(&mut FaultPlan)) {
        update(&mut self.0.faults.lock());
    }

    pub fn counters(&self) -> CounterSnapshot {
        *self.0.counters.lock()
    }
}

struct SimBuffer {
    ptr: NonNull<u8>,
    len: usize,
    mapped: bool,
    queued: bool,
}

impl SimBuffer {
    fn allocate(len: usize) -> Self {
        let raw = Box::into_raw(vec![0u8; len].into_boxed_slice());
        // Box never yields a null pointer
        let ptr = NonNull::new(raw.cast::<u8>()).unwrap_or(NonNull::dangling());
        Self {
            ptr,
            len,
            mapped: false,
            queued: false,
        }
    }

    fn free(self) {
        // SAFETY: ptr/len come from the boxed slice leaked in `allocate`.
        unsafe {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.len,
            )));
        }
    }
}

pub struct SimulatedDevice {
    config: SimConfig,
    format: StreamFormat,
    buffers: Vec<SimBuffer>,
    ready: VecDeque<u32>,
    streaming: bool,
    sequence: u32,
    started: Instant,
    shared: Arc<Shared>,
}

// Buffer memory is owned by the device and only touched by its current holder.
unsafe impl Send for SimulatedDevice {}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

fn os_error(op: &'static str, code: i32) -> DeviceError {
    DeviceError::io(op, io::Error::from_raw_os_error(code))
}

// errno values used by V4L2 drivers
const EINVAL: i32 = 22;
const EBUSY: i32 = 16;
const ENOMEM: i32 = 12;
const EIO: i32 = 5;

impl SimulatedDevice {
    pub fn new(config: SimConfig) -> Self {
        let format = config.initial_format;
        Self {
            config,
            format,
            buffers: Vec::new(),
            ready: VecDeque::new(),
            streaming: false,
            sequence: 0,
            started: Instant::now(),
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn handle(&self) -> SimHandle {
        SimHandle(Arc::clone(&self.shared))
    }

    fn faults(&self) -> parking_lot::MutexGuard<'_, FaultPlan> {
        self.shared.faults.lock()
    }

    fn count(&self, update: impl FnOnce(&mut CounterSnapshot)) {
        let mut counters = self.shared.counters.lock();
        update(&mut counters);
        counters.allocated_now = self.buffers.len() as u32;
        counters.mapped_now = self.buffers.iter().filter(|b| b.mapped).count() as u32;
        counters.queued_now = self.buffers.iter().filter(|b| b.queued).count() as u32;
        counters.streaming = self.streaming;
    }

    fn buffer_len(&self) -> usize {
        self.format
            .frame_len()
            .unwrap_or_else(|| self.format.pixel_count() * 2)
    }

    fn release_all(&mut self) {
        self.ready.clear();
        for buffer in self.buffers.drain(..) {
            buffer.free();
        }
    }

    fn fill(&mut self, index: usize) -> usize {
        let format = self.format;
        let pattern = self.config.pattern;
        let shift = self.sequence as usize * 4;
        let Some(buffer) = self.buffers.get(index) else {
            return 0;
        };
        // SAFETY: the buffer was queued, so no consumer holds a view into it.
        let data = unsafe { std::slice::from_raw_parts_mut(buffer.ptr.as_ptr(), buffer.len) };
        paint(data, &format, pattern, shift)
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        self.release_all();
    }
}

fn bar_color(x: usize, width: usize, shift: usize) -> [u8; 3] {
    const BARS: [[u8; 3]; 8] = [
        [235, 235, 235],
        [235, 235, 16],
        [16, 235, 235],
        [16, 235, 16],
        [235, 16, 235],
        [235, 16, 16],
        [16, 16, 235],
        [16, 16, 16],
    ];
    let bar_width = (width / BARS.len()).max(1);
    BARS[((x + shift) / bar_width) % BARS.len()]
}

fn luma([r, g, b]: [u8; 3]) -> u8 {
    ((77 * r as u32 + 150 * g as u32 + 29 * b as u32) >> 8) as u8
}

fn chroma([r, g, b]: [u8; 3]) -> (u8, u8) {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let u = 128.0 - 0.168_736 * r - 0.331_264 * g + 0.5 * b;
    let v = 128.0 + 0.5 * r - 0.418_688 * g - 0.081_312 * b;
    (u.clamp(0.0, 255.0) as u8, v.clamp(0.0, 255.0) as u8)
}

/// Write one frame of `pattern` in `format` layout; returns bytes used.
fn paint(data: &mut [u8], format: &StreamFormat, pattern: Pattern, shift: usize) -> usize {
    let w = format.width as usize;
    let h = format.height as usize;
    let color = |x: usize| match pattern {
        Pattern::Bars => bar_color(x, w, shift),
        Pattern::Solid(rgb) => rgb,
    };

    match format.pixel_format {
        PixelFormat::Rgb565 => {
            for (i, px) in data.chunks_exact_mut(2).take(w * h).enumerate() {
                let [r, g, b] = color(i % w);
                let value =
                    ((r as u16 >> 3) << 11) | ((g as u16 >> 2) << 5) | (b as u16 >> 3);
                px.copy_from_slice(&value.to_le_bytes());
            }
        }
        PixelFormat::Rgb24 => {
            for (i, px) in data.chunks_exact_mut(3).take(w * h).enumerate() {
                px.copy_from_slice(&color(i % w));
            }
        }
        PixelFormat::Grey => {
            for (i, px) in data.iter_mut().take(w * h).enumerate() {
                *px = luma(color(i % w));
            }
        }
        PixelFormat::Yuv422p => {
            let cw = w.div_ceil(2);
            let (y_plane, rest) = data.split_at_mut((w * h).min(data.len()));
            let (u_plane, v_plane) = rest.split_at_mut((cw * h).min(rest.len()));
            for (i, px) in y_plane.iter_mut().enumerate() {
                *px = luma(color(i % w));
            }
            for (i, (u, v)) in u_plane.iter_mut().zip(v_plane.iter_mut()).enumerate() {
                let (cu, cv) = chroma(color((i % cw) * 2));
                *u = cu;
                *v = cv;
            }
        }
        PixelFormat::Raw10 | PixelFormat::Jpeg | PixelFormat::Other(_) => data.fill(0x80),
    }

    format.frame_len().unwrap_or(data.len()).min(data.len())
}

impl CaptureDevice for SimulatedDevice {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn get_format(&mut self) -> Result<StreamFormat, DeviceError> {
        if self.faults().fail_get_format {
            return Err(os_error("VIDIOC_G_FMT", EIO));
        }
        Ok(self.format)
    }

    fn set_format(&mut self, format: &StreamFormat) -> Result<StreamFormat, DeviceError> {
        self.count(|c| c.set_format_calls += 1);
        if self.faults().rejected_formats.contains(&format.pixel_format) {
            return Err(os_error("VIDIOC_S_FMT", EINVAL));
        }
        if !self.buffers.is_empty() {
            return Err(os_error("VIDIOC_S_FMT", EBUSY));
        }
        if self.config.supported.contains(&format.pixel_format) && format.is_valid() {
            self.format = *format;
        }
        Ok(self.format)
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32, DeviceError> {
        if self.streaming || self.buffers.iter().any(|b| b.mapped) {
            return Err(os_error("VIDIOC_REQBUFS", EBUSY));
        }
        self.release_all();

        if count == 0 {
            self.count(|c| c.releases += 1);
            return Ok(0);
        }

        let granted = self
            .faults()
            .grant_buffers
            .unwrap_or(count)
            .min(self.config.max_buffers);
        let len = self.buffer_len();
        self.buffers = (0..granted).map(|_| SimBuffer::allocate(len)).collect();
        debug!(requested = count, granted, len, "Simulated buffers allocated");
        self.count(|c| c.requests += 1);
        Ok(granted)
    }

    fn query_buffer(&mut self, index: u32) -> Result<BufferDescriptor, DeviceError> {
        if self.faults().fail_query_at == Some(index) {
            return Err(os_error("VIDIOC_QUERYBUF", EIO));
        }
        let buffer = self
            .buffers
            .get(index as usize)
            .ok_or(os_error("VIDIOC_QUERYBUF", EINVAL))?;
        Ok(BufferDescriptor {
            index,
            length: buffer.len,
            offset: index as u64 * PAGE_SIZE,
        })
    }

    fn map(&mut self, descriptor: &BufferDescriptor) -> Result<MappedRegion, DeviceError> {
        let index = (descriptor.offset / PAGE_SIZE) as u32;
        if self.faults().fail_map_at == Some(index) {
            self.count(|c| c.map_failures += 1);
            return Err(os_error("mmap", ENOMEM));
        }
        let buffer = self
            .buffers
            .get_mut(index as usize)
            .ok_or(os_error("mmap", EINVAL))?;
        if buffer.mapped {
            return Err(DeviceError::InvalidState {
                op: "mmap",
                reason: "buffer already mapped",
            });
        }
        buffer.mapped = true;
        // SAFETY: the allocation outlives the mapping; request_buffers refuses
        // to free while any buffer is mapped.
        let region = unsafe { MappedRegion::from_raw(index, buffer.ptr, buffer.len) };
        self.count(|c| c.maps += 1);
        Ok(region)
    }

    fn unmap(&mut self, region: MappedRegion) -> Result<(), DeviceError> {
        let index = region.index();
        let fail = self.faults().fail_unmap_at == Some(index);
        self.count(|c| c.unmaps += 1);
        if fail {
            return Err(os_error("munmap", EINVAL));
        }
        match self.buffers.get_mut(index as usize) {
            Some(buffer) if buffer.mapped && buffer.ptr.as_ptr() == region.as_ptr() => {
                buffer.mapped = false;
                self.count(|_| {});
                Ok(())
            }
            _ => Err(os_error("munmap", EINVAL)),
        }
    }

    fn queue(&mut self, index: u32) -> Result<(), DeviceError> {
        let buffer = self
            .buffers
            .get_mut(index as usize)
            .ok_or(os_error("VIDIOC_QBUF", EINVAL))?;
        if buffer.queued {
            return Err(DeviceError::InvalidState {
                op: "VIDIOC_QBUF",
                reason: "buffer already queued",
            });
        }
        buffer.queued = true;
        self.ready.push_back(index);
        self.count(|c| c.queued += 1);
        Ok(())
    }

    fn dequeue(&mut self) -> Result<DequeuedBuffer, DeviceError> {
        if !self.streaming {
            return Err(DeviceError::InvalidState {
                op: "VIDIOC_DQBUF",
                reason: "not streaming",
            });
        }

        let (incomplete, short) = {
            let mut faults = self.faults();
            if faults.interrupt_dequeues > 0 {
                faults.interrupt_dequeues -= 1;
                return Err(DeviceError::Interrupted);
            }
            let frames = self.shared.counters.lock().frames;
            if faults.fail_dequeue_after.is_some_and(|limit| frames >= limit) {
                return Err(os_error("VIDIOC_DQBUF", EIO));
            }
            if faults.incomplete_frames > 0 {
                faults.incomplete_frames -= 1;
                (true, false)
            } else if faults.short_frames > 0 {
                faults.short_frames -= 1;
                (false, true)
            } else {
                (false, false)
            }
        };

        let Some(index) = self.ready.pop_front() else {
            return Err(DeviceError::Timeout);
        };
        if !self.config.frame_interval.is_zero() {
            thread::sleep(self.config.frame_interval);
        }

        let mut bytes_used = self.fill(index as usize);
        if short {
            bytes_used /= 2;
        }
        if let Some(buffer) = self.buffers.get_mut(index as usize) {
            buffer.queued = false;
        }
        self.sequence = self.sequence.wrapping_add(1);
        self.count(|c| {
            c.dequeued += 1;
            c.frames += 1;
        });

        Ok(DequeuedBuffer {
            index,
            bytes_used,
            sequence: self.sequence,
            timestamp: self.started.elapsed(),
            done: !incomplete,
            error: false,
        })
    }

    fn stream_on(&mut self) -> Result<(), DeviceError> {
        if self.faults().fail_stream_on {
            return Err(os_error("VIDIOC_STREAMON", EIO));
        }
        if self.buffers.is_empty() {
            return Err(DeviceError::InvalidState {
                op: "VIDIOC_STREAMON",
                reason: "no buffers allocated",
            });
        }
        self.streaming = true;
        self.count(|c| c.stream_ons += 1);
        Ok(())
    }

    fn stream_off(&mut self) -> Result<(), DeviceError> {
        if self.faults().fail_stream_off {
            return Err(os_error("VIDIOC_STREAMOFF", EIO));
        }
        // STREAMOFF returns every buffer to the dequeued state
        self.streaming = false;
        self.ready.clear();
        for buffer in &mut self.buffers {
            buffer.queued = false;
        }
        self.count(|c| c.stream_offs += 1);
        Ok(())
    }
}
