use std::collections::HashMap;
use std::mem::ManuallyDrop;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Context;
use ash::vk;
use parking_lot::{Mutex, RwLock};
use slotmap::SlotMap;

use crate::gpu::{
    CommandList, CommandListHandle, DescriptorHandle, Extent2D, Format, GpuDevice, TextureDesc,
    TextureHandle,
};

use super::adapter::{Adapter, LogicalDevice};
use super::command::VulkanCommandList;
use super::context::VulkanContext;
use super::frame::FrameSync;
use super::naming::DebugNamer;
use super::swapchain::Swapchain;
use super::texture::{self, VulkanTexture};

#[derive(Default)]
struct ViewTable {
    /// Descriptor slot -> the view last written into it.
    slots: HashMap<DescriptorHandle, (TextureHandle, vk::ImageView)>,
    /// Views are created once per texture and format, then reused by
    /// whichever slot the frame's descriptor cache hands out.
    cache: HashMap<(TextureHandle, Format), vk::ImageView>,
}

/// Device state shared with every command list. Dropped after the last
/// list, so pools and staging buffers are always freed first.
pub(super) struct Shared {
    pub device: ash::Device,
    pub allocator: ManuallyDrop<vk_mem::Allocator>,
    pub textures: RwLock<SlotMap<TextureHandle, VulkanTexture>>,
    views: Mutex<ViewTable>,
    pub lists: Mutex<SlotMap<CommandListHandle, vk::CommandBuffer>>,
    pub queue_family: u32,
    pub namer: DebugNamer,
    _context: Arc<VulkanContext>,
}

impl Shared {
    pub fn view(&self, descriptor: DescriptorHandle) -> Option<(TextureHandle, vk::ImageView)> {
        self.views.lock().slots.get(&descriptor).copied()
    }

    pub fn texture_extent(&self, texture: TextureHandle) -> Option<Extent2D> {
        self.textures.read().get(texture).map(|t| t.extent)
    }

    fn destroy_texture(&self, texture: TextureHandle) {
        {
            let mut views = self.views.lock();
            views.slots.retain(|_, (owner, _)| *owner != texture);
            views.cache.retain(|(owner, _), view| {
                if *owner == texture {
                    unsafe { self.device.destroy_image_view(*view, None) };
                    false
                } else {
                    true
                }
            });
        }
        if let Some(mut entry) = self.textures.write().remove(texture) {
            unsafe { entry.destroy(&self.allocator) };
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        log::trace!("Destroying Vulkan device");
        let views = std::mem::take(&mut *self.views.lock());
        for view in views.cache.into_values() {
            unsafe { self.device.destroy_image_view(view, None) };
        }
        for (_, mut entry) in self.textures.write().drain() {
            unsafe { entry.destroy(&self.allocator) };
        }
        unsafe {
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
        log::trace!("Vulkan device destroyed");
    }
}

struct Presentation {
    swapchain: Swapchain,
    frames: Vec<FrameSync>,
    back_buffers: Vec<TextureHandle>,
    /// Image acquired by `begin_frame` and not yet presented.
    acquired: Option<u32>,
    /// Whether the acquired image's semaphore still has to be waited on.
    wait_pending: bool,
}

/// [`GpuDevice`] over a Vulkan 1.3 device with dynamic rendering.
pub struct VulkanDevice {
    shared: Arc<Shared>,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    presentation: Mutex<Presentation>,
    frame_index: AtomicU32,
    frame_count: u32,
    extent: Extent2D,
}

impl VulkanDevice {
    pub fn new(
        context: Arc<VulkanContext>,
        frames_in_flight: u32,
        preferred: Extent2D,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(frames_in_flight > 0, "at least one frame in flight is required");

        let adapter = Adapter::select(&context).context("failed to pick physical device")?;
        let physical_device = adapter.physical;

        let LogicalDevice {
            device,
            graphics_queue,
            present_queue,
        } = adapter.open(&context.instance)?;

        let allocator = {
            let create_info =
                vk_mem::AllocatorCreateInfo::new(&context.instance, &device, physical_device);
            unsafe { vk_mem::Allocator::new(create_info) }
        };
        let allocator = match allocator {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e).context("failed to create memory allocator");
            }
        };

        let namer = DebugNamer::new(&context.instance, &device, context.validation_enabled());
        let shared = Arc::new(Shared {
            device,
            allocator: ManuallyDrop::new(allocator),
            textures: RwLock::new(SlotMap::with_key()),
            views: Mutex::new(ViewTable::default()),
            lists: Mutex::new(SlotMap::with_key()),
            queue_family: adapter.families.graphics,
            namer,
            _context: context.clone(),
        });

        let swapchain = Swapchain::new(
            &context,
            physical_device,
            adapter.families,
            &shared.device,
            preferred,
        )?;
        let extent = swapchain.properties.extent;

        let back_buffers = {
            let mut textures = shared.textures.write();
            swapchain
                .images
                .iter()
                .enumerate()
                .map(|(index, image)| {
                    textures.insert(VulkanTexture::swapchain_image(
                        *image,
                        index,
                        swapchain.properties.format.format,
                        extent,
                    ))
                })
                .collect::<Vec<_>>()
        };

        let frames = (0..frames_in_flight)
            .map(|_| FrameSync::new(&shared.device))
            .collect::<anyhow::Result<Vec<_>>>()?;

        log::info!(
            "Vulkan device ready: {} frames in flight, {} swapchain images, {}",
            frames_in_flight,
            back_buffers.len(),
            extent
        );

        Ok(Self {
            shared,
            graphics_queue,
            present_queue,
            presentation: Mutex::new(Presentation {
                swapchain,
                frames,
                back_buffers,
                acquired: None,
                wait_pending: false,
            }),
            frame_index: AtomicU32::new(0),
            frame_count: frames_in_flight,
            extent,
        })
    }

    fn submit(&self, info: &vk::SubmitInfo<'_>, fence: vk::Fence) -> anyhow::Result<()> {
        unsafe {
            self.shared
                .device
                .queue_submit(self.graphics_queue, std::slice::from_ref(info), fence)
                .context("failed to submit command lists")
        }
    }

    fn command_buffers(&self, lists: &[CommandListHandle]) -> anyhow::Result<Vec<vk::CommandBuffer>> {
        let registered = self.shared.lists.lock();
        lists
            .iter()
            .map(|handle| {
                registered
                    .get(*handle)
                    .copied()
                    .with_context(|| format!("unknown command list {handle:?}"))
            })
            .collect()
    }
}

impl GpuDevice for VulkanDevice {
    fn frame_count(&self) -> u32 {
        self.frame_count
    }

    fn frame_index(&self) -> u32 {
        self.frame_index.load(Ordering::Acquire)
    }

    fn extent(&self) -> Extent2D {
        self.extent
    }

    fn begin_frame(&self) -> anyhow::Result<()> {
        crate::profile_scope!("begin_frame");
        let mut presentation = self.presentation.lock();
        let frame = &presentation.frames[self.frame_index() as usize];
        frame.wait(&self.shared.device)?;

        let (index, suboptimal) = unsafe {
            presentation.swapchain.loader.acquire_next_image(
                presentation.swapchain.swapchain,
                u64::MAX,
                frame.acquired,
                vk::Fence::null(),
            )
        }
        .context("failed to acquire swapchain image")?;
        if suboptimal {
            log::warn!("Swapchain is suboptimal for the surface");
        }
        frame.rearm(&self.shared.device)?;

        presentation.acquired = Some(index);
        presentation.wait_pending = true;
        Ok(())
    }

    fn create_texture(&self, desc: &TextureDesc) -> anyhow::Result<TextureHandle> {
        let texture = VulkanTexture::allocate(&self.shared.allocator, desc)?;
        self.shared.namer.name(texture.image, &desc.label);
        Ok(self.shared.textures.write().insert(texture))
    }

    fn destroy_texture(&self, texture: TextureHandle) {
        self.shared.destroy_texture(texture);
    }

    fn create_view(
        &self,
        texture: TextureHandle,
        descriptor: DescriptorHandle,
        format: Format,
    ) -> anyhow::Result<()> {
        let mut views = self.shared.views.lock();
        let view = match views.cache.get(&(texture, format)) {
            Some(view) => *view,
            None => {
                let textures = self.shared.textures.read();
                let entry = textures
                    .get(texture)
                    .with_context(|| format!("view of unknown texture {texture:?}"))?;
                let view = texture::create_view(&self.shared.device, entry, format)?;
                views.cache.insert((texture, format), view);
                view
            }
        };
        views.slots.insert(descriptor, (texture, view));
        Ok(())
    }

    fn back_buffer(&self) -> TextureHandle {
        let presentation = self.presentation.lock();
        let index = presentation.acquired.unwrap_or(0) as usize;
        presentation
            .back_buffers
            .get(index)
            .copied()
            .unwrap_or_default()
    }

    fn create_command_list(&self, label: &str) -> anyhow::Result<Box<dyn CommandList>> {
        Ok(Box::new(VulkanCommandList::new(self.shared.clone(), label)?))
    }

    fn reset_command_allocator(&self) -> anyhow::Result<()> {
        // Every list resets its own pool in `begin`.
        log::trace!("reset_command_allocator: pools are per list");
        Ok(())
    }

    fn execute_command_lists(&self, lists: &[CommandListHandle]) -> anyhow::Result<()> {
        crate::profile_scope!("execute_command_lists");
        let buffers = self.command_buffers(lists)?;
        let mut presentation = self.presentation.lock();

        match presentation.acquired {
            Some(image) if presentation.wait_pending => {
                let frame = &presentation.frames[self.frame_index() as usize];
                let wait = [frame.acquired];
                let stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
                let signal = [presentation.swapchain.render_finished[image as usize]];
                let info = vk::SubmitInfo::default()
                    .wait_semaphores(&wait)
                    .wait_dst_stage_mask(&stages)
                    .command_buffers(&buffers)
                    .signal_semaphores(&signal);
                self.submit(&info, frame.in_flight)?;
                presentation.wait_pending = false;
            }
            _ => {
                let info = vk::SubmitInfo::default().command_buffers(&buffers);
                self.submit(&info, vk::Fence::null())?;
            }
        }
        Ok(())
    }

    fn present(&self) -> anyhow::Result<()> {
        crate::profile_scope!("present");
        let mut presentation = self.presentation.lock();
        let image = presentation
            .acquired
            .take()
            .context("present without an acquired swapchain image")?;
        anyhow::ensure!(
            !presentation.wait_pending,
            "present before the frame's command lists were submitted"
        );

        let wait = [presentation.swapchain.render_finished[image as usize]];
        let swapchains = [presentation.swapchain.swapchain];
        let indices = [image];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait)
            .swapchains(&swapchains)
            .image_indices(&indices);
        let suboptimal = unsafe {
            presentation
                .swapchain
                .loader
                .queue_present(self.present_queue, &info)
        }
        .context("failed to present swapchain image")?;
        if suboptimal {
            log::warn!("Presented to a suboptimal swapchain");
        }

        let next = (self.frame_index() + 1) % self.frame_count;
        self.frame_index.store(next, Ordering::Release);
        Ok(())
    }

    fn wait_for_gpu(&self) -> anyhow::Result<()> {
        unsafe {
            self.shared
                .device
                .device_wait_idle()
                .context("failed to wait for device idle")
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        if let Err(e) = self.wait_for_gpu() {
            log::error!("{e:#}");
        }
        let presentation = self.presentation.get_mut();
        for texture in presentation.back_buffers.drain(..) {
            self.shared.destroy_texture(texture);
        }
        unsafe {
            for frame in &presentation.frames {
                frame.destroy(&self.shared.device);
            }
            presentation.swapchain.destroy(&self.shared.device);
        }
        log::trace!("Swapchain destroyed");
    }
}
