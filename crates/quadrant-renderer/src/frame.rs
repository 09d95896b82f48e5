//! Frame-in-flight synchronization ring.

use ash::vk;

use crate::error::{GpuError, VkResultExt};
use crate::gpu::GpuDevice;

/// Per-frame synchronization primitives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameSlot {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
}

impl FrameSlot {
    /// The fence starts signalled so the first wait on a fresh slot returns
    /// immediately.
    pub fn create<D: GpuDevice>(device: &mut D) -> Result<Self, GpuError> {
        let image_available = device.create_semaphore().op("create image-available semaphore")?;

        let render_finished = match device.create_semaphore().op("create render-finished semaphore") {
            Ok(s) => s,
            Err(e) => {
                device.destroy_semaphore(image_available);
                return Err(e);
            }
        };

        let in_flight = match device.create_fence(true).op("create in-flight fence") {
            Ok(f) => f,
            Err(e) => {
                device.destroy_semaphore(render_finished);
                device.destroy_semaphore(image_available);
                return Err(e);
            }
        };

        Ok(Self { image_available, render_finished, in_flight })
    }

    pub fn destroy<D: GpuDevice>(&self, device: &mut D) {
        device.destroy_fence(self.in_flight);
        device.destroy_semaphore(self.render_finished);
        device.destroy_semaphore(self.image_available);
    }
}

/// Fixed ring of frame slots; the current slot advances once per frame.
pub struct FrameRing {
    slots: Vec<FrameSlot>,
    current: usize,
}

impl FrameRing {
    pub fn new<D: GpuDevice>(device: &mut D, count: usize) -> Result<Self, GpuError> {
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            match FrameSlot::create(device) {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    for slot in &slots {
                        slot.destroy(device);
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self { slots, current: 0 })
    }

    pub fn current(&self) -> FrameSlot {
        self.slots[self.current]
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
    }

    pub fn slots(&self) -> &[FrameSlot] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn destroy<D: GpuDevice>(self, device: &mut D) {
        for slot in &self.slots {
            slot.destroy(device);
        }
    }
}
