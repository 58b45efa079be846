//! Ioctl-style interface to the capture hardware.
//!
//! The trait mirrors the V4L2 streaming I/O sequence one call at a time
//! (REQBUFS, QUERYBUF, mmap, QBUF, STREAMON, DQBUF, STREAMOFF, munmap) so the
//! session layer can own the lifecycle and its failure paths.

mod sim;
#[cfg(feature = "v4l2")]
mod v4l2;

pub use sim::{CounterSnapshot, FaultPlan, Pattern, SimConfig, SimHandle, SimulatedDevice};
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Device;

use std::ptr::NonNull;
use std::time::Duration;

use crate::error::DeviceError;
use crate::format::StreamFormat;

/// Memory descriptor returned by a buffer query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub index: u32,
    pub length: usize,
    /// Offset to pass to the mapping call.
    pub offset: u64,
}

/// A device buffer mapped into the process.
///
/// Not `Clone`: [`CaptureDevice::unmap`] consumes the region, so a region can
/// be unmapped at most once.
#[derive(Debug)]
pub struct MappedRegion {
    index: u32,
    ptr: NonNull<u8>,
    len: usize,
}

// The mapping is plain memory; access is serialized by buffer ownership.
unsafe impl Send for MappedRegion {}

impl MappedRegion {
    /// # Safety
    ///
    /// `ptr` must point to `len` bytes that stay valid until the region is
    /// passed back to the device's `unmap`.
    pub unsafe fn from_raw(index: u32, ptr: NonNull<u8>, len: usize) -> Self {
        Self { index, ptr, len }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// # Safety
    ///
    /// The buffer must not be queued to the hardware for the lifetime of the
    /// returned slice.
    pub(crate) unsafe fn bytes(&self, used: usize) -> &[u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), used.min(self.len))
    }
}

/// Metadata of a buffer handed back by the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub bytes_used: usize,
    pub sequence: u32,
    pub timestamp: Duration,
    /// Hardware finished filling the buffer.
    pub done: bool,
    /// Hardware flagged the contents as corrupt.
    pub error: bool,
}

impl DequeuedBuffer {
    pub fn is_complete(&self) -> bool {
        self.done && !self.error
    }
}

/// One physical capture pipeline.
///
/// Calls are not reentrant; callers serialize access through the camera gate.
pub trait CaptureDevice: Send {
    fn name(&self) -> &str;

    fn get_format(&mut self) -> Result<StreamFormat, DeviceError>;

    /// Ask for `format`; returns what the driver actually applied.
    fn set_format(&mut self, format: &StreamFormat) -> Result<StreamFormat, DeviceError>;

    /// Request `count` mmap buffers and return how many were granted.
    /// A count of zero releases the current allocation.
    fn request_buffers(&mut self, count: u32) -> Result<u32, DeviceError>;

    fn query_buffer(&mut self, index: u32) -> Result<BufferDescriptor, DeviceError>;

    fn map(&mut self, descriptor: &BufferDescriptor) -> Result<MappedRegion, DeviceError>;

    fn unmap(&mut self, region: MappedRegion) -> Result<(), DeviceError>;

    /// Hand buffer `index` to the hardware.
    fn queue(&mut self, index: u32) -> Result<(), DeviceError>;

    /// Block until a filled buffer is available, bounded by the device timeout.
    fn dequeue(&mut self) -> Result<DequeuedBuffer, DeviceError>;

    fn stream_on(&mut self) -> Result<(), DeviceError>;

    fn stream_off(&mut self) -> Result<(), DeviceError>;
}
