//! Quad primitive pool.
//!
//! A fixed-capacity pool of quads living in one device-local vertex buffer.
//! Inserts and removals are written to a persistently host-visible staging
//! buffer and queued as pending uploads; [`QuadPool::flush`] moves them to
//! the vertex buffer in one transfer submission.
//!
//! Draws always cover slots `0..high_water_mark`. The mark only grows, so
//! removed slots are overwritten with a degenerate quad instead of being
//! compacted.

use std::fmt;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use log::{debug, error, warn};

use crate::buffer::GpuBuffer;
use crate::error::{PoolError, VkResultExt};
use crate::gpu::{GpuDevice, Submission};

/// Two triangles.
pub const VERTICES_PER_QUAD: u32 = 6;

/// Size of one quad slot in the vertex and staging buffers.
pub const BYTES_PER_QUAD: vk::DeviceSize = (std::mem::size_of::<Vertex>() * VERTICES_PER_QUAD as usize) as vk::DeviceSize;

/// Vertex layout consumed by every pipeline: 2D position then RGBA color.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 2],
    pub color: [f32; 4],
}

impl Vertex {
    pub const fn new(position: [f32; 2], color: [f32; 4]) -> Self {
        Self { position, color }
    }

    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Vertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 2] {
        [
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, position) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32B32A32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, color) as u32,
            },
        ]
    }
}

/// Build the six vertices of an axis-aligned rectangle.
///
/// Triangles are wound clockwise in framebuffer space (y down), matching the
/// front face the pipelines cull against.
pub fn rect(min: [f32; 2], max: [f32; 2], color: [f32; 4]) -> [Vertex; 6] {
    let [x0, y0] = min;
    let [x1, y1] = max;
    [
        Vertex::new([x0, y0], color),
        Vertex::new([x1, y0], color),
        Vertex::new([x1, y1], color),
        Vertex::new([x1, y1], color),
        Vertex::new([x0, y1], color),
        Vertex::new([x0, y0], color),
    ]
}

/// Identifies a quad slot in the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PrimitiveId(u32);

impl PrimitiveId {
    /// Never returned by a successful insert.
    pub const INVALID: Self = Self(u32::MAX);

    pub fn index(self) -> u32 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for PrimitiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "#{}", self.0)
        } else {
            f.write_str("#invalid")
        }
    }
}

bitflags::bitflags! {
    /// Which vertex attributes of a slot changed.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DirtyMask: u8 {
        const POSITION = 0x01;
        const COLOR    = 0x02;
        const ALL      = Self::POSITION.bits() | Self::COLOR.bits();
    }
}

/// A staged slot waiting to be copied to the vertex buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingUpload {
    pub offset: vk::DeviceSize,
    pub mask: DirtyMask,
}

/// Fixed-capacity quad storage.
pub struct QuadPool {
    vertex_buffer: GpuBuffer,
    staging_buffer: GpuBuffer,
    transfer_fence: vk::Fence,
    occupied: Vec<bool>,
    live: usize,
    next_id: u32,
    high_water_mark: u32,
    pending: Vec<PendingUpload>,
}

impl QuadPool {
    /// Allocate both buffers and the transfer fence for `capacity` quads.
    pub fn new<D: GpuDevice>(device: &mut D, capacity: usize) -> Result<Self, PoolError> {
        let size = BYTES_PER_QUAD * capacity as vk::DeviceSize;

        let vertex_buffer = GpuBuffer::vertex(device, size, "quad pool vertices").map_err(PoolError::Allocation)?;

        let staging_buffer = match GpuBuffer::staging(device, size, "quad pool staging") {
            Ok(buffer) => buffer,
            Err(e) => {
                vertex_buffer.destroy(device);
                return Err(PoolError::Allocation(e));
            }
        };

        let transfer_fence = match device.create_fence(true).op("create transfer fence") {
            Ok(fence) => fence,
            Err(e) => {
                staging_buffer.destroy(device);
                vertex_buffer.destroy(device);
                return Err(PoolError::Allocation(e));
            }
        };

        debug!("quad pool: {} slots, {} bytes per buffer", capacity, size);

        Ok(Self {
            vertex_buffer,
            staging_buffer,
            transfer_fence,
            occupied: vec![false; capacity],
            live: 0,
            next_id: 0,
            high_water_mark: 0,
            pending: Vec::new(),
        })
    }

    /// Stage a quad and return the slot it was given.
    ///
    /// The quad becomes visible on the GPU after the next flush.
    pub fn insert<D: GpuDevice>(&mut self, device: &mut D, vertices: &[Vertex; 6]) -> Result<PrimitiveId, PoolError> {
        let capacity = self.capacity();
        if self.live == capacity {
            warn!("quad pool full ({} quads), insert rejected", capacity);
            return Err(PoolError::Exhausted { capacity });
        }

        // At least one slot is free, so this terminates within one lap.
        let mut id = self.next_id;
        while self.occupied[id as usize] {
            id = (id + 1) % capacity as u32;
        }

        let offset = id as vk::DeviceSize * BYTES_PER_QUAD;
        self.staging_buffer
            .write(device, offset, bytemuck::cast_slice(vertices))
            .map_err(PoolError::Transfer)?;

        self.occupied[id as usize] = true;
        self.live += 1;
        self.next_id = (id + 1) % capacity as u32;
        self.high_water_mark = self.high_water_mark.max(id + 1);
        self.pending.push(PendingUpload { offset, mask: DirtyMask::ALL });

        Ok(PrimitiveId(id))
    }

    /// Free a slot.
    ///
    /// The slot is overwritten with a zero-area quad so draws up to the
    /// high-water mark never show stale geometry. The mark itself is kept.
    pub fn remove<D: GpuDevice>(&mut self, device: &mut D, id: PrimitiveId) -> Result<(), PoolError> {
        if !self.is_live(id) {
            warn!("remove of primitive {} that is not live", id);
            return Err(PoolError::NotLive(id));
        }

        let offset = id.0 as vk::DeviceSize * BYTES_PER_QUAD;
        let degenerate = [Vertex::zeroed(); VERTICES_PER_QUAD as usize];
        self.staging_buffer
            .write(device, offset, bytemuck::cast_slice(&degenerate))
            .map_err(PoolError::Transfer)?;

        self.occupied[id.0 as usize] = false;
        self.live -= 1;
        self.pending.push(PendingUpload { offset, mask: DirtyMask::ALL });

        Ok(())
    }

    pub fn flush_required(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Copy every pending slot from staging to the vertex buffer and wait
    /// for the transfer to finish.
    ///
    /// On error the pending list is left as it was.
    pub fn flush<D: GpuDevice>(&mut self, device: &mut D) -> Result<(), PoolError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        if let Some(partial) = self.pending.iter().find(|p| p.mask != DirtyMask::ALL) {
            error!(
                "partial upload ({:?}) at offset {} is not implemented",
                partial.mask, partial.offset
            );
            return Err(PoolError::PartialUpload { offset: partial.offset, mask: partial.mask });
        }

        let regions = coalesce(&self.pending);

        let cmd = device
            .allocate_command_buffers(1)
            .op("allocate transfer command buffer")
            .map_err(PoolError::Transfer)?[0];

        let result = self.submit_copy(device, cmd, &regions);
        device.free_command_buffers(&[cmd]);
        result.map_err(PoolError::Transfer)?;

        debug!("flushed {} uploads in {} copy regions", self.pending.len(), regions.len());
        self.pending.clear();
        Ok(())
    }

    fn submit_copy<D: GpuDevice>(
        &self,
        device: &mut D,
        cmd: vk::CommandBuffer,
        regions: &[vk::BufferCopy],
    ) -> Result<(), crate::error::GpuError> {
        device.begin_command_buffer(cmd, true).op("begin transfer commands")?;
        device.cmd_copy_buffer(cmd, self.staging_buffer.handle(), self.vertex_buffer.handle(), regions);
        device.end_command_buffer(cmd).op("end transfer commands")?;

        device.reset_fence(self.transfer_fence).op("reset transfer fence")?;
        device
            .submit(&Submission { command_buffer: cmd, wait: None, signal: None, fence: self.transfer_fence })
            .op("submit transfer")?;
        device.wait_for_fence(self.transfer_fence).op("wait for transfer")
    }

    /// Record the draw for every slot up to the high-water mark.
    ///
    /// The caller binds the pipeline. Records nothing while the pool has
    /// never held a quad.
    pub fn issue_draw_commands<D: GpuDevice>(&self, device: &mut D, cmd: vk::CommandBuffer) {
        if self.high_water_mark == 0 {
            return;
        }
        device.cmd_bind_vertex_buffer(cmd, self.vertex_buffer.handle());
        device.cmd_draw(cmd, self.high_water_mark * VERTICES_PER_QUAD, 1);
    }

    pub fn is_live(&self, id: PrimitiveId) -> bool {
        self.occupied.get(id.0 as usize).copied().unwrap_or(false)
    }

    pub fn capacity(&self) -> usize {
        self.occupied.len()
    }

    /// Number of live quads.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// One past the highest slot ever occupied. Equals the peak number of
    /// live quads as long as nothing was removed.
    pub fn high_water_mark(&self) -> u32 {
        self.high_water_mark
    }

    pub fn pending_uploads(&self) -> &[PendingUpload] {
        &self.pending
    }

    pub fn vertex_buffer(&self) -> vk::Buffer {
        self.vertex_buffer.handle()
    }

    pub fn staging_buffer(&self) -> vk::Buffer {
        self.staging_buffer.handle()
    }

    /// Release both buffers and the transfer fence.
    pub fn destroy<D: GpuDevice>(self, device: &mut D) {
        device.destroy_fence(self.transfer_fence);
        self.staging_buffer.destroy(device);
        self.vertex_buffer.destroy(device);
    }
}

/// Merge pending slots into the fewest copy regions.
///
/// Source and destination offsets are identical. Duplicate offsets collapse
/// and adjacent slots merge into one region.
fn coalesce(pending: &[PendingUpload]) -> Vec<vk::BufferCopy> {
    let mut offsets: Vec<vk::DeviceSize> = pending.iter().map(|p| p.offset).collect();
    offsets.sort_unstable();
    offsets.dedup();

    let mut regions: Vec<vk::BufferCopy> = Vec::with_capacity(offsets.len());
    for offset in offsets {
        match regions.last_mut() {
            Some(last) if last.src_offset + last.size == offset => last.size += BYTES_PER_QUAD,
            _ => regions.push(vk::BufferCopy { src_offset: offset, dst_offset: offset, size: BYTES_PER_QUAD }),
        }
    }
    regions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{FailPoint, HeadlessDevice, RecordedCommand};

    fn quad(seed: f32) -> [Vertex; 6] {
        rect([seed, seed], [seed + 1.0, seed + 1.0], [1.0, 0.5, 0.25, 1.0])
    }

    fn slot_bytes(device: &HeadlessDevice, buffer: vk::Buffer, id: PrimitiveId) -> Vec<u8> {
        let start = (id.index() as u64 * BYTES_PER_QUAD) as usize;
        device.buffer_contents(buffer).unwrap()[start..start + BYTES_PER_QUAD as usize].to_vec()
    }

    // ============================================================
    // Layout
    // ============================================================

    #[test]
    fn test_vertex_layout() {
        assert_eq!(std::mem::size_of::<Vertex>(), 24);
        assert_eq!(BYTES_PER_QUAD, 144);

        let attrs = Vertex::attribute_descriptions();
        assert_eq!(attrs[0].offset, 0);
        assert_eq!(attrs[0].format, vk::Format::R32G32_SFLOAT);
        assert_eq!(attrs[1].offset, 8);
        assert_eq!(attrs[1].format, vk::Format::R32G32B32A32_SFLOAT);
        assert_eq!(Vertex::binding_description().stride, 24);
    }

    // ============================================================
    // Insert / remove
    // ============================================================

    #[test]
    fn test_insert_assigns_unique_ids_up_to_capacity() {
        let mut device = HeadlessDevice::new();
        let mut pool = QuadPool::new(&mut device, 4).unwrap();

        let ids: Vec<PrimitiveId> = (0..4).map(|i| pool.insert(&mut device, &quad(i as f32)).unwrap()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 4);
        assert!(ids.iter().all(|id| id.is_valid()));
        assert_eq!(pool.len(), 4);
        assert_eq!(pool.high_water_mark(), 4);

        pool.destroy(&mut device);
    }

    #[test]
    fn test_insert_when_full_leaves_state_unchanged() {
        let mut device = HeadlessDevice::new();
        let mut pool = QuadPool::new(&mut device, 4).unwrap();
        for i in 0..4 {
            pool.insert(&mut device, &quad(i as f32)).unwrap();
        }

        let err = pool.insert(&mut device, &quad(9.0)).unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { capacity: 4 }));
        assert_eq!(pool.len(), 4);
        assert_eq!(pool.high_water_mark(), 4);
        assert_eq!(pool.pending_uploads().len(), 4);

        pool.destroy(&mut device);
    }

    #[test]
    fn test_insert_writes_staging_bytes() {
        let mut device = HeadlessDevice::new();
        let mut pool = QuadPool::new(&mut device, 2).unwrap();
        let vertices = quad(3.0);
        let id = pool.insert(&mut device, &vertices).unwrap();

        let staged = slot_bytes(&device, pool.staging_buffer(), id);
        assert_eq!(staged.as_slice(), bytemuck::cast_slice::<Vertex, u8>(&vertices));
        assert_eq!(pool.pending_uploads(), &[PendingUpload { offset: id.index() as u64 * BYTES_PER_QUAD, mask: DirtyMask::ALL }]);

        pool.destroy(&mut device);
    }

    #[test]
    fn test_removed_slot_is_reused() {
        let mut device = HeadlessDevice::new();
        let mut pool = QuadPool::new(&mut device, 4).unwrap();
        let ids: Vec<PrimitiveId> = (0..4).map(|i| pool.insert(&mut device, &quad(i as f32)).unwrap()).collect();

        pool.remove(&mut device, ids[1]).unwrap();
        let reused = pool.insert(&mut device, &quad(7.0)).unwrap();
        assert_eq!(reused, ids[1]);
        assert_eq!(pool.len(), 4);

        pool.destroy(&mut device);
    }

    #[test]
    fn test_remove_keeps_high_water_mark_and_tombstones_slot() {
        let mut device = HeadlessDevice::new();
        let mut pool = QuadPool::new(&mut device, 4).unwrap();
        let a = pool.insert(&mut device, &quad(1.0)).unwrap();
        let b = pool.insert(&mut device, &quad(2.0)).unwrap();
        pool.flush(&mut device).unwrap();

        pool.remove(&mut device, b).unwrap();
        assert_eq!(pool.high_water_mark(), 2);
        assert_eq!(pool.len(), 1);
        assert!(pool.is_live(a));
        assert!(!pool.is_live(b));
        assert!(pool.flush_required());
        assert!(slot_bytes(&device, pool.staging_buffer(), b).iter().all(|&byte| byte == 0));

        pool.flush(&mut device).unwrap();
        assert!(slot_bytes(&device, pool.vertex_buffer(), b).iter().all(|&byte| byte == 0));

        pool.destroy(&mut device);
    }

    #[test]
    fn test_remove_of_dead_id_is_rejected() {
        let mut device = HeadlessDevice::new();
        let mut pool = QuadPool::new(&mut device, 2).unwrap();
        let id = pool.insert(&mut device, &quad(0.0)).unwrap();
        pool.remove(&mut device, id).unwrap();

        assert!(matches!(pool.remove(&mut device, id), Err(PoolError::NotLive(_))));
        assert!(matches!(pool.remove(&mut device, PrimitiveId::INVALID), Err(PoolError::NotLive(_))));
        assert_eq!(pool.pending_uploads().len(), 2);

        pool.destroy(&mut device);
    }

    #[test]
    fn test_high_water_mark_follows_highest_slot() {
        let mut device = HeadlessDevice::new();
        let mut pool = QuadPool::new(&mut device, 4).unwrap();
        let first = pool.insert(&mut device, &quad(0.0)).unwrap();
        pool.insert(&mut device, &quad(1.0)).unwrap();
        pool.insert(&mut device, &quad(2.0)).unwrap();
        pool.remove(&mut device, first).unwrap();

        // Two live quads, but the next free slot after the last insert is 3.
        let id = pool.insert(&mut device, &quad(3.0)).unwrap();
        assert_eq!(id.index(), 3);
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.high_water_mark(), 4);

        pool.destroy(&mut device);
    }

    #[test]
    fn test_high_water_mark_exceeds_peak_occupancy_after_removal() {
        let mut device = HeadlessDevice::new();
        let mut pool = QuadPool::new(&mut device, 4).unwrap();
        let a = pool.insert(&mut device, &quad(0.0)).unwrap();
        pool.insert(&mut device, &quad(1.0)).unwrap();
        pool.remove(&mut device, a).unwrap();

        let c = pool.insert(&mut device, &quad(2.0)).unwrap();
        assert_eq!(c.index(), 2);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.high_water_mark(), 3);

        let cmd = device.allocate_command_buffers(1).unwrap()[0];
        pool.issue_draw_commands(&mut device, cmd);
        assert!(device.recorded(cmd).contains(&RecordedCommand::Draw { vertex_count: 18, instance_count: 1 }));

        device.free_command_buffers(&[cmd]);
        pool.destroy(&mut device);
    }

    #[test]
    fn test_high_water_mark_is_monotonic() {
        let mut device = HeadlessDevice::new();
        let mut pool = QuadPool::new(&mut device, 8).unwrap();
        let mut ids = Vec::new();
        let mut last = 0;
        for round in 0..3 {
            for i in 0..3 {
                ids.push(pool.insert(&mut device, &quad((round * 3 + i) as f32)).unwrap());
                assert!(pool.high_water_mark() >= last);
                last = pool.high_water_mark();
            }
            for id in ids.drain(..2) {
                pool.remove(&mut device, id).unwrap();
                assert_eq!(pool.high_water_mark(), last);
            }
        }
        assert!(pool.len() <= pool.capacity());

        pool.destroy(&mut device);
    }

    // ============================================================
    // Flush
    // ============================================================

    #[test]
    fn test_flush_uploads_and_clears_pending() {
        let mut device = HeadlessDevice::new();
        let mut pool = QuadPool::new(&mut device, 4).unwrap();
        let vertices = quad(5.0);
        let id = pool.insert(&mut device, &vertices).unwrap();
        assert!(pool.flush_required());

        pool.flush(&mut device).unwrap();

        assert!(!pool.flush_required());
        assert_eq!(device.stats().submissions, 1);
        let uploaded = slot_bytes(&device, pool.vertex_buffer(), id);
        assert_eq!(uploaded.as_slice(), bytemuck::cast_slice::<Vertex, u8>(&vertices));

        pool.destroy(&mut device);
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn test_flush_without_pending_submits_nothing() {
        let mut device = HeadlessDevice::new();
        let mut pool = QuadPool::new(&mut device, 4).unwrap();
        pool.flush(&mut device).unwrap();
        assert_eq!(device.stats().submissions, 0);
        pool.destroy(&mut device);
    }

    #[test]
    fn test_partial_mask_aborts_flush() {
        let mut device = HeadlessDevice::new();
        let mut pool = QuadPool::new(&mut device, 4).unwrap();
        pool.insert(&mut device, &quad(0.0)).unwrap();
        pool.pending.push(PendingUpload { offset: BYTES_PER_QUAD, mask: DirtyMask::COLOR });

        let err = pool.flush(&mut device).unwrap_err();
        assert!(matches!(err, PoolError::PartialUpload { mask, .. } if mask == DirtyMask::COLOR));
        assert_eq!(pool.pending_uploads().len(), 2);
        assert_eq!(device.stats().submissions, 0);

        pool.destroy(&mut device);
    }

    #[test]
    fn test_failed_submit_keeps_pending() {
        let mut device = HeadlessDevice::new();
        let mut pool = QuadPool::new(&mut device, 4).unwrap();
        pool.insert(&mut device, &quad(0.0)).unwrap();
        device.fail_next(FailPoint::Submit, vk::Result::ERROR_DEVICE_LOST);

        assert!(matches!(pool.flush(&mut device), Err(PoolError::Transfer(_))));
        assert!(pool.flush_required());

        pool.flush(&mut device).unwrap();
        assert!(!pool.flush_required());
        pool.destroy(&mut device);
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn test_coalesce_merges_adjacent_and_duplicates() {
        let pending: Vec<PendingUpload> = [3u64, 0, 1, 1, 5]
            .iter()
            .map(|&slot| PendingUpload { offset: slot * BYTES_PER_QUAD, mask: DirtyMask::ALL })
            .collect();

        let regions = coalesce(&pending);
        let spans: Vec<(u64, u64)> = regions.iter().map(|r| (r.src_offset, r.size)).collect();
        assert_eq!(
            spans,
            vec![(0, 2 * BYTES_PER_QUAD), (3 * BYTES_PER_QUAD, BYTES_PER_QUAD), (5 * BYTES_PER_QUAD, BYTES_PER_QUAD)]
        );
        assert!(regions.iter().all(|r| r.src_offset == r.dst_offset));
    }

    // ============================================================
    // Draw / lifecycle
    // ============================================================

    #[test]
    fn test_draw_covers_high_water_mark() {
        let mut device = HeadlessDevice::new();
        let mut pool = QuadPool::new(&mut device, 8).unwrap();
        let cmd = device.allocate_command_buffers(1).unwrap()[0];

        pool.issue_draw_commands(&mut device, cmd);
        assert!(device.recorded(cmd).is_empty());

        for i in 0..3 {
            pool.insert(&mut device, &quad(i as f32)).unwrap();
        }
        pool.issue_draw_commands(&mut device, cmd);
        assert_eq!(
            device.recorded(cmd),
            &[
                RecordedCommand::BindVertexBuffer(pool.vertex_buffer()),
                RecordedCommand::Draw { vertex_count: 18, instance_count: 1 },
            ]
        );

        device.free_command_buffers(&[cmd]);
        pool.destroy(&mut device);
    }

    #[test]
    fn test_new_releases_partial_resources_on_failure() {
        let mut device = HeadlessDevice::new();
        device.fail_next(FailPoint::CreateFence, vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        assert!(matches!(QuadPool::new(&mut device, 4), Err(PoolError::Allocation(_))));
        assert_eq!(device.live_objects(), 0);
    }
}
