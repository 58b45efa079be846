//! Arena of mapped capture buffers indexed by hardware buffer index.

use tracing::warn;

use crate::device::MappedRegion;
use crate::error::CaptureError;

/// Who may touch a buffer right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Queued to the device, awaiting fill.
    Hardware,
    /// Dequeued (or never queued); readable by the consumer.
    Consumer,
}

#[derive(Debug)]
struct Slot {
    region: MappedRegion,
    owner: Ownership,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCounts {
    pub hardware: usize,
    pub consumer: usize,
}

/// Mapped regions of one capture session.
///
/// A region leaves the pool only through [`FramePool::drain`], which hands it
/// to the device for unmapping, so each mapping is released exactly once.
#[derive(Debug, Default)]
pub struct FramePool {
    slots: Vec<Option<Slot>>,
}

impl FramePool {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
        }
    }

    /// Add a freshly mapped region. It starts consumer-owned until queued.
    pub fn insert(&mut self, region: MappedRegion) -> Result<(), CaptureError> {
        let index = region.index() as usize;
        if self.slots.len() <= index {
            self.slots.resize_with(index + 1, || None);
        }
        if self.slots[index].is_some() {
            return Err(CaptureError::BufferState {
                index: index as u32,
                reason: "already mapped",
            });
        }
        self.slots[index] = Some(Slot {
            region,
            owner: Ownership::Consumer,
        });
        Ok(())
    }

    fn slot_mut(&mut self, index: u32) -> Result<&mut Slot, CaptureError> {
        self.slots
            .get_mut(index as usize)
            .and_then(Option::as_mut)
            .ok_or(CaptureError::BufferState {
                index,
                reason: "not mapped",
            })
    }

    /// Record that `index` was handed to the hardware.
    pub fn mark_queued(&mut self, index: u32) -> Result<(), CaptureError> {
        let slot = self.slot_mut(index)?;
        if slot.owner == Ownership::Hardware {
            return Err(CaptureError::BufferState {
                index,
                reason: "already queued",
            });
        }
        slot.owner = Ownership::Hardware;
        Ok(())
    }

    /// Record that the hardware returned `index`.
    pub fn mark_dequeued(&mut self, index: u32) -> Result<(), CaptureError> {
        let slot = self.slot_mut(index)?;
        if slot.owner == Ownership::Consumer {
            return Err(CaptureError::BufferState {
                index,
                reason: "not queued",
            });
        }
        slot.owner = Ownership::Consumer;
        Ok(())
    }

    /// Release every buffer back to the consumer side; the device drops its
    /// queue on stream-off.
    pub fn reclaim_all(&mut self) {
        for slot in self.slots.iter_mut().flatten() {
            slot.owner = Ownership::Consumer;
        }
    }

    pub fn owner(&self, index: u32) -> Option<Ownership> {
        self.slots
            .get(index as usize)
            .and_then(Option::as_ref)
            .map(|slot| slot.owner)
    }

    /// Read-only view of the first `used` bytes of a consumer-owned buffer.
    pub fn frame(&self, index: u32, used: usize) -> Result<&[u8], CaptureError> {
        let slot = self
            .slots
            .get(index as usize)
            .and_then(Option::as_ref)
            .ok_or(CaptureError::BufferState {
                index,
                reason: "not mapped",
            })?;
        if slot.owner != Ownership::Consumer {
            return Err(CaptureError::BufferState {
                index,
                reason: "owned by hardware",
            });
        }
        // SAFETY: consumer-owned buffers are not queued, so the device does not
        // write them while the returned borrow of `self` is alive.
        Ok(unsafe { slot.region.bytes(used) })
    }

    pub fn counts(&self) -> PoolCounts {
        self.slots
            .iter()
            .flatten()
            .fold(PoolCounts::default(), |mut counts, slot| {
                match slot.owner {
                    Ownership::Hardware => counts.hardware += 1,
                    Ownership::Consumer => counts.consumer += 1,
                }
                counts
            })
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every region out of the pool, lowest index first.
    pub fn drain(&mut self) -> Vec<MappedRegion> {
        self.slots
            .drain(..)
            .flatten()
            .map(|slot| slot.region)
            .collect()
    }
}

impl Drop for FramePool {
    fn drop(&mut self) {
        let leaked = self.len();
        if leaked > 0 {
            warn!(leaked, "Frame pool dropped with mapped buffers");
        }
    }
}
