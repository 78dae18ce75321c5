use anyhow::Context;
use ash::vk;

/// The fence and acquire semaphore owned by one frame in flight.
pub struct FrameSync {
    pub in_flight: vk::Fence,
    pub acquired: vk::Semaphore,
}

impl FrameSync {
    pub fn new(device: &ash::Device) -> anyhow::Result<Self> {
        // Signaled so the first wait on this slot returns at once.
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        let in_flight = unsafe { device.create_fence(&fence_info, None) }
            .context("failed to create in-flight fence")?;
        let acquired = match unsafe {
            device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
        } {
            Ok(semaphore) => semaphore,
            Err(e) => {
                unsafe { device.destroy_fence(in_flight, None) };
                return Err(e).context("failed to create acquire semaphore");
            }
        };
        Ok(Self {
            in_flight,
            acquired,
        })
    }

    /// Blocks until the GPU is done with the previous use of this slot.
    pub fn wait(&self, device: &ash::Device) -> anyhow::Result<()> {
        unsafe { device.wait_for_fences(&[self.in_flight], true, u64::MAX) }
            .context("failed waiting for in-flight fence")
    }

    /// Only called once a submission that signals the fence is certain.
    pub fn rearm(&self, device: &ash::Device) -> anyhow::Result<()> {
        unsafe { device.reset_fences(&[self.in_flight]) }.context("failed to reset in-flight fence")
    }

    /// # Safety
    /// The slot must be idle.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.acquired, None);
            device.destroy_fence(self.in_flight, None);
        }
    }
}
