use std::fmt;

use ash::vk;

use crate::gpu::ResourceState;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ImageState {
    pub layout: vk::ImageLayout,
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

impl fmt::Display for ImageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} [stage: {:?}, access: {:?}]",
            self.layout, self.stage, self.access
        )
    }
}

impl ImageState {
    pub const UNDEFINED: ImageState = ImageState {
        layout: vk::ImageLayout::UNDEFINED,
        stage: vk::PipelineStageFlags2::TOP_OF_PIPE,
        access: vk::AccessFlags2::NONE,
    };

    pub const SHADER_READ: ImageState = ImageState {
        layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        stage: vk::PipelineStageFlags2::FRAGMENT_SHADER,
        access: vk::AccessFlags2::SHADER_SAMPLED_READ,
    };

    pub const COLOR_ATTACHMENT_WRITE: ImageState = ImageState {
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        access: vk::AccessFlags2::from_raw(
            vk::AccessFlags2::COLOR_ATTACHMENT_READ.as_raw()
                | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw(),
        ),
    };

    pub const DEPTH_WRITE: ImageState = ImageState {
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        stage: vk::PipelineStageFlags2::from_raw(
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS.as_raw()
                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS.as_raw(),
        ),
        access: vk::AccessFlags2::from_raw(
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ.as_raw()
                | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw(),
        ),
    };

    /// Depth bound for testing while also sampled.
    pub const DEPTH_READ: ImageState = ImageState {
        layout: vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        stage: vk::PipelineStageFlags2::from_raw(
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS.as_raw()
                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS.as_raw()
                | vk::PipelineStageFlags2::FRAGMENT_SHADER.as_raw(),
        ),
        access: vk::AccessFlags2::from_raw(
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ.as_raw()
                | vk::AccessFlags2::SHADER_SAMPLED_READ.as_raw(),
        ),
    };

    pub const TRANSFER_SRC: ImageState = ImageState {
        layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        stage: vk::PipelineStageFlags2::COPY,
        access: vk::AccessFlags2::TRANSFER_READ,
    };

    pub const TRANSFER_DST: ImageState = ImageState {
        layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        stage: vk::PipelineStageFlags2::COPY,
        access: vk::AccessFlags2::TRANSFER_WRITE,
    };

    pub const PRESENT: ImageState = ImageState {
        layout: vk::ImageLayout::PRESENT_SRC_KHR,
        stage: vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
        access: vk::AccessFlags2::NONE,
    };

    pub fn from_resource_state(state: ResourceState) -> Self {
        match state {
            ResourceState::ShaderRead => Self::SHADER_READ,
            ResourceState::RenderTarget => Self::COLOR_ATTACHMENT_WRITE,
            ResourceState::DepthWrite => Self::DEPTH_WRITE,
            ResourceState::DepthRead => Self::DEPTH_READ,
            ResourceState::CopySource => Self::TRANSFER_SRC,
            ResourceState::CopyDest => Self::TRANSFER_DST,
            ResourceState::Present => Self::PRESENT,
        }
    }
}

pub fn subresource_range(aspect_mask: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

pub fn transition_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    aspect_mask: vk::ImageAspectFlags,
    old: ImageState,
    new: ImageState,
) {
    log::trace!("transition {:?}: {} -> {}", image, old, new);
    let barrier = vk::ImageMemoryBarrier2::default()
        .image(image)
        .subresource_range(subresource_range(aspect_mask))
        .src_stage_mask(old.stage)
        .src_access_mask(old.access)
        .old_layout(old.layout)
        .dst_stage_mask(new.stage)
        .dst_access_mask(new.access)
        .new_layout(new.layout);

    let dep_info =
        vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));

    unsafe {
        device.cmd_pipeline_barrier2(cmd, &dep_info);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_states_use_depth_layouts() {
        assert_eq!(
            ImageState::from_resource_state(ResourceState::DepthWrite).layout,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );
        assert_eq!(
            ImageState::from_resource_state(ResourceState::DepthRead).layout,
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        );
    }

    #[test]
    fn present_has_no_access() {
        let present = ImageState::from_resource_state(ResourceState::Present);
        assert_eq!(present.layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(present.access, vk::AccessFlags2::NONE);
    }

    #[test]
    fn render_target_reads_and_writes_color() {
        let rt = ImageState::from_resource_state(ResourceState::RenderTarget);
        assert!(rt.access.contains(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE));
        assert!(rt.access.contains(vk::AccessFlags2::COLOR_ATTACHMENT_READ));
    }
}
