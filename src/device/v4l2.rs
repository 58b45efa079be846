//! V4L2 capture node driven through raw streaming ioctls.
//!
//! Format get/set goes through the `v4l` crate; the buffer lifecycle is
//! issued one ioctl at a time so the session layer sees every step.

use std::io;
use std::os::raw::c_void;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};
use v4l::buffer::Type as BufferType;
use v4l::device::Handle;
use v4l::memory::Memory;
use v4l::v4l2::{self, vidioc};
use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};
use v4l::video::Capture;
use v4l::{Device, Format, FourCC};

use super::{BufferDescriptor, CaptureDevice, DequeuedBuffer, MappedRegion};
use crate::error::DeviceError;
use crate::format::{PixelFormat, StreamFormat};

const V4L2_BUF_FLAG_DONE: u32 = 0x0000_0004;
const V4L2_BUF_FLAG_ERROR: u32 = 0x0000_0040;

pub struct V4l2Device {
    name: String,
    device: Device,
    handle: Arc<Handle>,
    dequeue_timeout: Duration,
}

impl V4l2Device {
    pub fn open(path: impl AsRef<Path>, dequeue_timeout: Duration) -> Result<Self, DeviceError> {
        let path = path.as_ref();
        let device = Device::with_path(path).map_err(|e| DeviceError::io("open", e))?;
        let handle = device.handle();
        let name = device
            .query_caps()
            .map(|caps| format!("{} ({})", caps.card, path.display()))
            .unwrap_or_else(|_| path.display().to_string());
        info!(device = %name, "Opened V4L2 capture device");
        Ok(Self {
            name,
            device,
            handle,
            dequeue_timeout,
        })
    }

    fn fd(&self) -> i32 {
        self.handle.fd()
    }

    fn ioctl<T>(&self, op: &'static str, request: vidioc::_IOC_TYPE, arg: &mut T) -> Result<(), DeviceError> {
        // SAFETY: `arg` is the struct type the request expects and lives for the call.
        unsafe { v4l2::ioctl(self.fd(), request, arg as *mut T as *mut c_void) }
            .map_err(|e| DeviceError::io(op, e))
    }

    fn mmap_buffer(&self, index: u32) -> v4l2_buffer {
        // SAFETY: v4l2_buffer is plain data; all-zero is a valid initial state.
        let mut buf: v4l2_buffer = unsafe { std::mem::zeroed() };
        buf.type_ = BufferType::VideoCapture as u32;
        buf.memory = Memory::Mmap as u32;
        buf.index = index;
        buf
    }

    fn wait_readable(&self) -> Result<(), DeviceError> {
        let mut pfd = libc::pollfd {
            fd: self.fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = self.dequeue_timeout.as_millis().min(i32::MAX as u128) as i32;
        // SAFETY: pfd is a valid single-element array for the duration of the call.
        let ready = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        match ready {
            r if r < 0 => Err(DeviceError::io("poll", io::Error::last_os_error())),
            0 => Err(DeviceError::Timeout),
            _ => Ok(()),
        }
    }
}

fn to_stream_format(format: &Format) -> StreamFormat {
    StreamFormat::new(
        format.width,
        format.height,
        PixelFormat::from_fourcc(format.fourcc.repr),
    )
}

impl CaptureDevice for V4l2Device {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_format(&mut self) -> Result<StreamFormat, DeviceError> {
        let format = Capture::format(&self.device).map_err(|e| DeviceError::io("VIDIOC_G_FMT", e))?;
        Ok(to_stream_format(&format))
    }

    fn set_format(&mut self, format: &StreamFormat) -> Result<StreamFormat, DeviceError> {
        let requested = Format::new(
            format.width,
            format.height,
            FourCC::new(&format.pixel_format.fourcc()),
        );
        let applied = Capture::set_format(&self.device, &requested)
            .map_err(|e| DeviceError::io("VIDIOC_S_FMT", e))?;
        Ok(to_stream_format(&applied))
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32, DeviceError> {
        // SAFETY: plain data struct.
        let mut req: v4l2_requestbuffers = unsafe { std::mem::zeroed() };
        req.count = count;
        req.type_ = BufferType::VideoCapture as u32;
        req.memory = Memory::Mmap as u32;
        self.ioctl("VIDIOC_REQBUFS", vidioc::VIDIOC_REQBUFS, &mut req)?;
        debug!(requested = count, granted = req.count, "VIDIOC_REQBUFS");
        Ok(req.count)
    }

    fn query_buffer(&mut self, index: u32) -> Result<BufferDescriptor, DeviceError> {
        let mut buf = self.mmap_buffer(index);
        self.ioctl("VIDIOC_QUERYBUF", vidioc::VIDIOC_QUERYBUF, &mut buf)?;
        Ok(BufferDescriptor {
            index,
            length: buf.length as usize,
            // SAFETY: memory is MMAP, so the offset member of the union is set.
            offset: unsafe { buf.m.offset } as u64,
        })
    }

    fn map(&mut self, descriptor: &BufferDescriptor) -> Result<MappedRegion, DeviceError> {
        // SAFETY: offset and length come from QUERYBUF on this fd.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                descriptor.length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd(),
                descriptor.offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(DeviceError::io("mmap", io::Error::last_os_error()));
        }
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| DeviceError::io("mmap", io::Error::from(io::ErrorKind::Other)))?;
        // SAFETY: the mapping stays valid until `unmap` consumes the region.
        Ok(unsafe { MappedRegion::from_raw(descriptor.index, ptr, descriptor.length) })
    }

    fn unmap(&mut self, region: MappedRegion) -> Result<(), DeviceError> {
        // SAFETY: the region was produced by `map` and is consumed here.
        let rc = unsafe { libc::munmap(region.as_ptr().cast::<c_void>(), region.len()) };
        if rc < 0 {
            return Err(DeviceError::io("munmap", io::Error::last_os_error()));
        }
        Ok(())
    }

    fn queue(&mut self, index: u32) -> Result<(), DeviceError> {
        let mut buf = self.mmap_buffer(index);
        self.ioctl("VIDIOC_QBUF", vidioc::VIDIOC_QBUF, &mut buf)
    }

    fn dequeue(&mut self) -> Result<DequeuedBuffer, DeviceError> {
        self.wait_readable()?;
        let mut buf = self.mmap_buffer(0);
        self.ioctl("VIDIOC_DQBUF", vidioc::VIDIOC_DQBUF, &mut buf)?;
        let timestamp = Duration::from_secs(buf.timestamp.tv_sec.max(0) as u64)
            + Duration::from_micros(buf.timestamp.tv_usec.max(0) as u64);
        Ok(DequeuedBuffer {
            index: buf.index,
            bytes_used: buf.bytesused as usize,
            sequence: buf.sequence,
            timestamp,
            // Drivers clear DONE once the buffer leaves the done queue; a
            // dequeued buffer without ERROR is complete.
            done: buf.flags & V4L2_BUF_FLAG_DONE != 0 || buf.flags & V4L2_BUF_FLAG_ERROR == 0,
            error: buf.flags & V4L2_BUF_FLAG_ERROR != 0,
        })
    }

    fn stream_on(&mut self) -> Result<(), DeviceError> {
        let mut buf_type = BufferType::VideoCapture as u32;
        self.ioctl("VIDIOC_STREAMON", vidioc::VIDIOC_STREAMON, &mut buf_type)
    }

    fn stream_off(&mut self) -> Result<(), DeviceError> {
        let mut buf_type = BufferType::VideoCapture as u32;
        self.ioctl("VIDIOC_STREAMOFF", vidioc::VIDIOC_STREAMOFF, &mut buf_type)
    }
}
