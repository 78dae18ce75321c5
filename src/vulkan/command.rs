use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use ash::vk;
use vk_mem::Alloc;

use crate::gpu::{
    CommandList, CommandListHandle, DescriptorHandle, Extent2D, ResourceState, TextureHandle,
};

use super::backend::Shared;
use super::layouts::{ImageState, transition_image};

struct Staging {
    buffer: vk::Buffer,
    allocation: vk_mem::Allocation,
}

/// One Vulkan command buffer with its own pool, so lists can record on
/// different workers without sharing a pool.
pub struct VulkanCommandList {
    shared: Arc<Shared>,
    handle: CommandListHandle,
    label: String,
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
    recording: bool,
    rendering: bool,
    pending_clears: HashMap<DescriptorHandle, vk::ClearValue>,
    /// State of each texture as of the last command recorded here.
    states: HashMap<TextureHandle, ResourceState>,
    bound: HashMap<u32, DescriptorHandle>,
    pipeline: Option<vk::Pipeline>,
    staging: Vec<Staging>,
}

impl VulkanCommandList {
    pub(super) fn new(shared: Arc<Shared>, label: &str) -> anyhow::Result<Self> {
        let device = &shared.device;
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(shared.queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = unsafe { device.create_command_pool(&pool_info, None) }
            .with_context(|| format!("failed to create command pool for '{label}'"))?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let allocated = unsafe { device.allocate_command_buffers(&alloc_info) };
        let Some(cmd) = allocated.ok().and_then(|buffers| buffers.into_iter().next()) else {
            unsafe { device.destroy_command_pool(pool, None) };
            anyhow::bail!("failed to allocate command buffer for '{label}'");
        };
        shared.namer.name(cmd, label);

        let handle = shared.lists.lock().insert(cmd);
        Ok(Self {
            shared,
            handle,
            label: label.to_string(),
            pool,
            cmd,
            recording: false,
            rendering: false,
            pending_clears: HashMap::new(),
            states: HashMap::new(),
            bound: HashMap::new(),
            pipeline: None,
            staging: Vec::new(),
        })
    }

    pub fn raw(&self) -> vk::CommandBuffer {
        self.cmd
    }

    /// Binds a graphics pipeline built by a draw hook. Draws are skipped
    /// until one is bound.
    pub fn bind_pipeline(&mut self, pipeline: vk::Pipeline) {
        unsafe {
            self.shared
                .device
                .cmd_bind_pipeline(self.cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);
        }
        self.pipeline = Some(pipeline);
    }

    /// View bound to `slot` by the pass, for hooks that build descriptor sets.
    pub fn bound_view(&self, slot: u32) -> Option<vk::ImageView> {
        let view = self.bound.get(&slot)?;
        self.shared.view(*view).map(|(_, view)| view)
    }

    fn end_rendering(&mut self) {
        if self.rendering {
            unsafe { self.shared.device.cmd_end_rendering(self.cmd) };
            self.rendering = false;
        }
    }

    /// Moves a never-used image out of `UNDEFINED` into the state the frame
    /// graph believes it starts in.
    fn touch(&mut self, texture: TextureHandle) {
        let textures = self.shared.textures.read();
        let Some(entry) = textures.get(texture) else {
            log::warn!("{}: unknown texture {:?}", self.label, texture);
            return;
        };
        if entry.take_fresh() {
            transition_image(
                &self.shared.device,
                self.cmd,
                entry.image,
                entry.aspect_mask(),
                ImageState::UNDEFINED,
                ImageState::from_resource_state(entry.initial_state),
            );
            self.states.entry(texture).or_insert(entry.initial_state);
        }
    }

    fn state_of(&self, texture: TextureHandle) -> ResourceState {
        match self.states.get(&texture) {
            Some(state) => *state,
            None => self
                .shared
                .textures
                .read()
                .get(texture)
                .map_or(ResourceState::ShaderRead, |t| t.initial_state),
        }
    }

    fn release_staging(&mut self) {
        for mut staging in self.staging.drain(..) {
            unsafe {
                self.shared
                    .allocator
                    .destroy_buffer(staging.buffer, &mut staging.allocation);
            }
        }
    }

    /// Clears that no `set_render_targets` picked up get a rendering scope
    /// of their own.
    fn flush_clears(&mut self) {
        let pending: Vec<_> = self.pending_clears.drain().collect();
        for (view, value) in pending {
            let Some((texture, image_view)) = self.shared.view(view) else {
                log::warn!("{}: clear of unknown view {:?}", self.label, view);
                continue;
            };
            let Some(extent) = self.shared.texture_extent(texture) else {
                continue;
            };
            let is_depth = matches!(view.heap, crate::gpu::DescriptorHeap::Dsv);
            let layout = if is_depth {
                ImageState::from_resource_state(self.state_of(texture)).layout
            } else {
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
            };
            let attachment = vk::RenderingAttachmentInfo::default()
                .image_view(image_view)
                .image_layout(layout)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(value);
            let attachments = [attachment];
            let mut info = vk::RenderingInfo::default()
                .render_area(render_area(extent))
                .layer_count(1);
            info = if is_depth {
                info.depth_attachment(&attachments[0])
            } else {
                info.color_attachments(&attachments)
            };
            unsafe {
                self.shared.device.cmd_begin_rendering(self.cmd, &info);
                self.shared.device.cmd_end_rendering(self.cmd);
            }
        }
    }
}

fn render_area(extent: Extent2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent: vk::Extent2D {
            width: extent.width,
            height: extent.height,
        },
    }
}

impl CommandList for VulkanCommandList {
    fn handle(&self) -> CommandListHandle {
        self.handle
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn begin(&mut self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.recording, "'{}' is already recording", self.label);
        self.release_staging();
        self.pending_clears.clear();
        self.states.clear();
        self.bound.clear();
        self.pipeline = None;

        let device = &self.shared.device;
        unsafe {
            device
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())
                .with_context(|| format!("failed to reset pool of '{}'", self.label))?;
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .begin_command_buffer(self.cmd, &begin_info)
                .with_context(|| format!("failed to begin '{}'", self.label))?;
        }
        self.recording = true;
        Ok(())
    }

    fn end(&mut self) -> anyhow::Result<()> {
        anyhow::ensure!(self.recording, "'{}' is not recording", self.label);
        self.flush_clears();
        self.end_rendering();
        unsafe {
            self.shared
                .device
                .end_command_buffer(self.cmd)
                .with_context(|| format!("failed to end '{}'", self.label))?;
        }
        self.recording = false;
        Ok(())
    }

    fn barrier(&mut self, texture: TextureHandle, before: ResourceState, after: ResourceState) {
        self.flush_clears();
        self.end_rendering();
        let textures = self.shared.textures.read();
        let Some(entry) = textures.get(texture) else {
            log::warn!("{}: barrier on unknown texture {:?}", self.label, texture);
            return;
        };
        let old = if entry.take_fresh() {
            ImageState::UNDEFINED
        } else {
            ImageState::from_resource_state(before)
        };
        transition_image(
            &self.shared.device,
            self.cmd,
            entry.image,
            entry.aspect_mask(),
            old,
            ImageState::from_resource_state(after),
        );
        drop(textures);
        self.states.insert(texture, after);
    }

    fn assume_state(&mut self, texture: TextureHandle, state: ResourceState) {
        self.states.insert(texture, state);
    }

    fn clear_color(&mut self, view: DescriptorHandle, color: [f32; 4]) {
        self.pending_clears.insert(
            view,
            vk::ClearValue {
                color: vk::ClearColorValue { float32: color },
            },
        );
    }

    fn clear_depth(&mut self, view: DescriptorHandle, depth: f32) {
        self.pending_clears.insert(
            view,
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth, stencil: 0 },
            },
        );
    }

    fn set_render_targets(&mut self, colors: &[DescriptorHandle], depth: Option<DescriptorHandle>) {
        self.end_rendering();

        let mut extent = None;
        let mut color_attachments = Vec::with_capacity(colors.len());
        for view in colors {
            let Some((texture, image_view)) = self.shared.view(*view) else {
                log::warn!("{}: unknown render target {:?}", self.label, view);
                continue;
            };
            self.touch(texture);
            extent = extent.or(self.shared.texture_extent(texture));
            let clear = self.pending_clears.remove(view);
            color_attachments.push(
                vk::RenderingAttachmentInfo::default()
                    .image_view(image_view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(if clear.is_some() {
                        vk::AttachmentLoadOp::CLEAR
                    } else {
                        vk::AttachmentLoadOp::LOAD
                    })
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .clear_value(clear.unwrap_or_default()),
            );
        }

        let depth_attachment = depth.and_then(|view| {
            let (texture, image_view) = self.shared.view(view)?;
            self.touch(texture);
            extent = extent.or(self.shared.texture_extent(texture));
            let state = self.state_of(texture);
            let clear = self.pending_clears.remove(&view);
            // A read-only depth binding can't be cleared or stored.
            let writable = state == ResourceState::DepthWrite;
            Some(
                vk::RenderingAttachmentInfo::default()
                    .image_view(image_view)
                    .image_layout(ImageState::from_resource_state(state).layout)
                    .load_op(match clear {
                        Some(_) if writable => vk::AttachmentLoadOp::CLEAR,
                        _ => vk::AttachmentLoadOp::LOAD,
                    })
                    .store_op(if writable {
                        vk::AttachmentStoreOp::STORE
                    } else {
                        vk::AttachmentStoreOp::NONE
                    })
                    .clear_value(clear.unwrap_or_default()),
            )
        });

        let Some(extent) = extent else {
            log::warn!("{}: no render targets to bind", self.label);
            return;
        };

        let mut info = vk::RenderingInfo::default()
            .render_area(render_area(extent))
            .layer_count(1)
            .color_attachments(&color_attachments);
        if let Some(depth) = depth_attachment.as_ref() {
            info = info.depth_attachment(depth);
        }
        unsafe { self.shared.device.cmd_begin_rendering(self.cmd, &info) };
        self.rendering = true;
    }

    fn bind_shader_resource(&mut self, slot: u32, view: DescriptorHandle) {
        if let Some((texture, _)) = self.shared.view(view) {
            self.touch(texture);
        }
        self.bound.insert(slot, view);
    }

    fn set_viewport(&mut self, extent: Extent2D) {
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let device = &self.shared.device;
        unsafe {
            device.cmd_set_viewport(self.cmd, 0, &[viewport]);
            device.cmd_set_scissor(self.cmd, 0, &[render_area(extent)]);
        }
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32) {
        if self.pipeline.is_none() {
            log::trace!("{}: no pipeline bound, skipping draw", self.label);
            return;
        }
        unsafe {
            self.shared
                .device
                .cmd_draw(self.cmd, vertex_count, instance_count, 0, 0);
        }
    }

    fn copy_texture(&mut self, src: TextureHandle, dst: TextureHandle) {
        self.flush_clears();
        self.end_rendering();
        self.touch(src);
        self.touch(dst);

        let textures = self.shared.textures.read();
        let (Some(src), Some(dst)) = (textures.get(src), textures.get(dst)) else {
            log::warn!("{}: copy between unknown textures", self.label);
            return;
        };
        let layers = |aspect_mask| vk::ImageSubresourceLayers {
            aspect_mask,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let region = vk::ImageCopy::default()
            .src_subresource(layers(src.aspect_mask()))
            .dst_subresource(layers(dst.aspect_mask()))
            .extent(vk::Extent3D {
                width: src.extent.width.min(dst.extent.width),
                height: src.extent.height.min(dst.extent.height),
                depth: 1,
            });
        unsafe {
            self.shared.device.cmd_copy_image(
                self.cmd,
                src.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
    }

    fn upload(&mut self, texture: TextureHandle, data: &[u8]) -> anyhow::Result<()> {
        self.flush_clears();
        self.end_rendering();
        self.touch(texture);

        let (image, aspect_mask, extent) = {
            let textures = self.shared.textures.read();
            let entry = textures
                .get(texture)
                .with_context(|| format!("{}: upload to unknown texture", self.label))?;
            let expected = entry.extent.width as usize
                * entry.extent.height as usize
                * entry.format.bytes_per_texel() as usize;
            anyhow::ensure!(
                data.len() == expected,
                "upload to '{}' is {} bytes, expected {}",
                entry.label,
                data.len(),
                expected
            );
            (entry.image, entry.aspect_mask(), entry.extent)
        };

        let allocator = &self.shared.allocator;
        let bci = vk::BufferCreateInfo::default()
            .size(data.len() as vk::DeviceSize)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let aci = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::Auto,
            flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
            ..Default::default()
        };
        let (buffer, mut allocation) = unsafe { allocator.create_buffer(&bci, &aci) }
            .with_context(|| format!("{}: failed to allocate staging buffer", self.label))?;

        let mapped = unsafe { allocator.map_memory(&mut allocation) };
        match mapped {
            Ok(ptr) => unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
                allocator.unmap_memory(&mut allocation);
            },
            Err(e) => {
                unsafe { allocator.destroy_buffer(buffer, &mut allocation) };
                return Err(e).context("failed to map staging buffer");
            }
        }

        let region = vk::BufferImageCopy::default()
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            });
        unsafe {
            self.shared.device.cmd_copy_buffer_to_image(
                self.cmd,
                buffer,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
        self.staging.push(Staging { buffer, allocation });
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Drop for VulkanCommandList {
    fn drop(&mut self) {
        log::trace!("Destroying command list '{}'", self.label);
        self.release_staging();
        self.shared.lists.lock().remove(self.handle);
        unsafe {
            self.shared.device.destroy_command_pool(self.pool, None);
        }
    }
}
