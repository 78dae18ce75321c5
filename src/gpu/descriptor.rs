use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Context;

use crate::error::FrameGraphError;
use crate::gpu::{Format, GpuDevice, TextureHandle};

pub const CBV_SRV_UAV_CAPACITY: u32 = 1024;
pub const RTV_CAPACITY: u32 = 1024;
pub const DSV_CAPACITY: u32 = 32;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum DescriptorHeap {
    CbvSrvUav,
    Rtv,
    Dsv,
}

impl DescriptorHeap {
    pub fn capacity(self) -> u32 {
        match self {
            DescriptorHeap::CbvSrvUav => CBV_SRV_UAV_CAPACITY,
            DescriptorHeap::Rtv => RTV_CAPACITY,
            DescriptorHeap::Dsv => DSV_CAPACITY,
        }
    }

    fn slot(self) -> usize {
        match self {
            DescriptorHeap::CbvSrvUav => 0,
            DescriptorHeap::Rtv => 1,
            DescriptorHeap::Dsv => 2,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct DescriptorHandle {
    pub heap: DescriptorHeap,
    pub index: u32,
}

/// Linear per-frame allocator over three fixed-size descriptor heaps.
///
/// Passes on different workers append concurrently; `reset` runs on the
/// render thread at the top of every frame, before any pass records.
#[derive(Default, Debug)]
pub struct DescriptorCache {
    offsets: [AtomicU32; 3],
}

impl DescriptorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_rtv(
        &self,
        device: &dyn GpuDevice,
        texture: TextureHandle,
        format: Format,
    ) -> anyhow::Result<DescriptorHandle> {
        self.append(device, DescriptorHeap::Rtv, texture, format)
    }

    pub fn append_dsv(
        &self,
        device: &dyn GpuDevice,
        texture: TextureHandle,
        format: Format,
    ) -> anyhow::Result<DescriptorHandle> {
        self.append(device, DescriptorHeap::Dsv, texture, format)
    }

    pub fn append_srv(
        &self,
        device: &dyn GpuDevice,
        texture: TextureHandle,
        format: Format,
    ) -> anyhow::Result<DescriptorHandle> {
        self.append(device, DescriptorHeap::CbvSrvUav, texture, format)
    }

    pub fn used(&self, heap: DescriptorHeap) -> u32 {
        self.offsets[heap.slot()].load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        for offset in &self.offsets {
            offset.store(0, Ordering::Release);
        }
    }

    fn append(
        &self,
        device: &dyn GpuDevice,
        heap: DescriptorHeap,
        texture: TextureHandle,
        format: Format,
    ) -> anyhow::Result<DescriptorHandle> {
        let handle = self.allocate(heap)?;
        device
            .create_view(texture, handle, format)
            .with_context(|| format!("failed to write {:?} view at {}", heap, handle.index))?;
        Ok(handle)
    }

    fn allocate(&self, heap: DescriptorHeap) -> Result<DescriptorHandle, FrameGraphError> {
        let capacity = heap.capacity();
        self.offsets[heap.slot()]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used < capacity).then_some(used + 1)
            })
            .map(|index| DescriptorHandle { heap, index })
            .map_err(|_| FrameGraphError::DescriptorCacheExhausted { heap, capacity })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::gpu::{Extent2D, HeadlessDevice};

    #[test]
    fn appends_are_linear_per_heap() {
        let device = HeadlessDevice::new(2, Extent2D::new(64, 64));
        let texture = device.back_buffer();
        let cache = DescriptorCache::new();

        let rtv0 = cache.append_rtv(&device, texture, Format::Bgra8Unorm).unwrap();
        let rtv1 = cache.append_rtv(&device, texture, Format::Bgra8Unorm).unwrap();
        let srv0 = cache.append_srv(&device, texture, Format::Bgra8Unorm).unwrap();

        assert_eq!((rtv0.heap, rtv0.index), (DescriptorHeap::Rtv, 0));
        assert_eq!(rtv1.index, 1);
        assert_eq!((srv0.heap, srv0.index), (DescriptorHeap::CbvSrvUav, 0));
        assert_eq!(cache.used(DescriptorHeap::Rtv), 2);
        assert_eq!(cache.used(DescriptorHeap::Dsv), 0);
        assert_eq!(device.view_target(srv0), Some(texture));
    }

    #[test]
    fn reset_rewinds_every_heap() {
        let device = HeadlessDevice::new(2, Extent2D::new(64, 64));
        let texture = device.back_buffer();
        let cache = DescriptorCache::new();
        cache.append_rtv(&device, texture, Format::Bgra8Unorm).unwrap();
        cache.append_srv(&device, texture, Format::Bgra8Unorm).unwrap();

        cache.reset();

        assert_eq!(cache.used(DescriptorHeap::Rtv), 0);
        assert_eq!(cache.used(DescriptorHeap::CbvSrvUav), 0);
        let again = cache.append_rtv(&device, texture, Format::Bgra8Unorm).unwrap();
        assert_eq!(again.index, 0);
    }

    #[test]
    fn dsv_heap_runs_out() {
        let device = HeadlessDevice::new(2, Extent2D::new(64, 64));
        let texture = device.back_buffer();
        let cache = DescriptorCache::new();
        for _ in 0..DSV_CAPACITY {
            cache.append_dsv(&device, texture, Format::D32Float).unwrap();
        }

        let err = cache
            .append_dsv(&device, texture, Format::D32Float)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FrameGraphError>(),
            Some(FrameGraphError::DescriptorCacheExhausted {
                heap: DescriptorHeap::Dsv,
                capacity: DSV_CAPACITY
            })
        ));
        assert_eq!(cache.used(DescriptorHeap::Dsv), DSV_CAPACITY);
    }

    #[test]
    fn concurrent_appends_hand_out_unique_slots() {
        let device = Arc::new(HeadlessDevice::new(2, Extent2D::new(64, 64)));
        let cache = Arc::new(DescriptorCache::new());
        let texture = device.back_buffer();

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let device = device.clone();
                let cache = cache.clone();
                thread::spawn(move || {
                    (0..64)
                        .map(|_| {
                            cache
                                .append_srv(device.as_ref(), texture, Format::Rgba8Unorm)
                                .unwrap()
                                .index
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut indices: Vec<u32> = workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect();
        indices.sort_unstable();
        indices.dedup();
        assert_eq!(indices.len(), 256);
    }
}
