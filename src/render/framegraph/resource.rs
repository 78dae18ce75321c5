use std::collections::HashMap;
use std::fmt;

use anyhow::Context;
use smallvec::SmallVec;

use crate::error::FrameGraphError;
use crate::gpu::{
    CommandList, DescriptorCache, DescriptorHandle, Extent2D, Format, GpuDevice, ResourceState,
    TextureDesc, TextureHandle, TextureUsage,
};
use crate::render::framegraph::{DependencyGraph, NodeId};

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum ResourceKind {
    RenderTarget,
    Depth,
    Stencil,
}

impl ResourceKind {
    pub fn is_depth_stencil(self) -> bool {
        matches!(self, ResourceKind::Depth | ResourceKind::Stencil)
    }

    fn write_state(self) -> ResourceState {
        if self.is_depth_stencil() {
            ResourceState::DepthWrite
        } else {
            ResourceState::RenderTarget
        }
    }
}

/// Interned identity of a resource, stable for the lifetime of its table.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ResourceHandle(u32);

impl ResourceHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Access bookkeeping for the current frame's recording.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum AccessState {
    Unregistered,
    Idle,
    Written,
    Read,
    /// Depth bound read-only for further Z-tested passes.
    DepthReadOnly,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ResourceSize {
    Viewport,
    Explicit { width: u32, height: u32 },
}

pub struct FrameGraphResource {
    handle: ResourceHandle,
    name: String,
    kind: ResourceKind,
    format: Format,

    producer: Option<NodeId>,
    consumers: SmallVec<[NodeId; 4]>,

    texture: Option<TextureHandle>,
    extent: Extent2D,
    gpu_state: ResourceState,
    access: AccessState,
    write_view: Option<DescriptorHandle>,
    read_view: Option<DescriptorHandle>,
}

impl FrameGraphResource {
    pub fn new(handle: ResourceHandle, name: &str, kind: ResourceKind, format: Format) -> Self {
        Self {
            handle,
            name: name.to_string(),
            kind,
            format,
            producer: None,
            consumers: SmallVec::new(),
            texture: None,
            extent: Extent2D::default(),
            gpu_state: ResourceState::ShaderRead,
            access: AccessState::Unregistered,
            write_view: None,
            read_view: None,
        }
    }

    pub fn handle(&self) -> ResourceHandle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn producer(&self) -> Option<NodeId> {
        self.producer
    }

    pub fn consumers(&self) -> &[NodeId] {
        &self.consumers
    }

    pub fn texture(&self) -> Option<TextureHandle> {
        self.texture
    }

    pub fn extent(&self) -> Extent2D {
        self.extent
    }

    pub fn access(&self) -> AccessState {
        self.access
    }

    pub fn gpu_state(&self) -> ResourceState {
        self.gpu_state
    }

    pub fn is_registered(&self) -> bool {
        self.texture.is_some()
    }

    pub(crate) fn set_producer(&mut self, node: NodeId) {
        self.producer = Some(node);
    }

    /// Forgets the previous frame's declarations and views. The backing
    /// texture and its GPU state carry over.
    pub fn begin_frame(&mut self) {
        self.producer = None;
        self.consumers.clear();
        self.write_view = None;
        self.read_view = None;
        self.access = if self.is_registered() {
            AccessState::Idle
        } else {
            AccessState::Unregistered
        };
    }

    /// Creates the backing texture on first use and appends this frame's
    /// write and read views to `cache`.
    pub fn register(
        &mut self,
        device: &dyn GpuDevice,
        cache: &DescriptorCache,
        size: ResourceSize,
    ) -> anyhow::Result<()> {
        let texture = match self.texture {
            Some(texture) => texture,
            None => {
                let extent = match size {
                    ResourceSize::Viewport => device.extent(),
                    ResourceSize::Explicit { width, height } => Extent2D::new(width, height),
                };
                let desc = TextureDesc {
                    label: self.name.clone(),
                    extent,
                    format: self.format,
                    usage: if self.kind.is_depth_stencil() {
                        TextureUsage::DepthStencil
                    } else {
                        TextureUsage::RenderTarget
                    },
                    initial_state: ResourceState::ShaderRead,
                };
                let texture = device
                    .create_texture(&desc)
                    .with_context(|| format!("failed to create texture for '{}'", self.name))?;

                log::debug!("Allocated '{}' {} {:?}", self.name, extent, self.format);
                self.texture = Some(texture);
                self.extent = extent;
                self.gpu_state = ResourceState::ShaderRead;
                self.access = AccessState::Idle;
                texture
            }
        };

        let write_view = if self.kind.is_depth_stencil() {
            cache.append_dsv(device, texture, self.format)
        } else {
            cache.append_rtv(device, texture, self.format)
        }
        .with_context(|| format!("failed to append write view for '{}'", self.name))?;

        let read_view = cache
            .append_srv(device, texture, self.read_format())
            .with_context(|| format!("failed to append read view for '{}'", self.name))?;

        self.write_view = Some(write_view);
        self.read_view = Some(read_view);
        Ok(())
    }

    /// Render-target or depth view, transitioned for writing.
    pub fn write_view(
        &mut self,
        cmd: &mut dyn CommandList,
    ) -> Result<DescriptorHandle, FrameGraphError> {
        let (texture, view) = self.view(self.write_view)?;
        self.transition_texture(cmd, texture, self.kind.write_state());
        self.access = AccessState::Written;
        Ok(view)
    }

    /// Shader-visible view, transitioned for sampling.
    pub fn read_view(
        &mut self,
        cmd: &mut dyn CommandList,
    ) -> Result<DescriptorHandle, FrameGraphError> {
        let (texture, view) = self.view(self.read_view)?;
        if self.access == AccessState::DepthReadOnly {
            return Err(FrameGraphError::EarlyZRead {
                resource: self.name.clone(),
            });
        }
        self.transition_texture(cmd, texture, ResourceState::ShaderRead);
        self.access = AccessState::Read;
        Ok(view)
    }

    /// Depth view bound read-only for early-Z testing. Sampling the resource
    /// is refused until it is written again.
    pub fn depth_stencil_view(
        &mut self,
        cmd: &mut dyn CommandList,
    ) -> Result<DescriptorHandle, FrameGraphError> {
        if !self.kind.is_depth_stencil() {
            return Err(FrameGraphError::WrongKind {
                resource: self.name.clone(),
                kind: self.kind,
                view: "depth-stencil",
            });
        }
        let (texture, view) = self.view(self.write_view)?;
        self.transition_texture(cmd, texture, ResourceState::DepthRead);
        self.access = AccessState::DepthReadOnly;
        Ok(view)
    }

    /// Moves the texture into `state` for a copy or similar out-of-band use.
    pub fn transition(
        &mut self,
        cmd: &mut dyn CommandList,
        state: ResourceState,
    ) -> Result<(), FrameGraphError> {
        let texture = self.texture.ok_or_else(|| self.unregistered())?;
        self.transition_texture(cmd, texture, state);
        Ok(())
    }

    /// Ends an early-Z hold once the pass that took it has its views. The
    /// texture stays in `DepthRead` until a later view asks for another state.
    pub fn release_early_z(&mut self) {
        if self.access == AccessState::DepthReadOnly {
            self.access = AccessState::Read;
        }
    }

    /// Adds `producer -> consumer` unless `consumer` already reads this resource.
    pub fn connect(
        &mut self,
        graph: &mut DependencyGraph,
        consumer: NodeId,
    ) -> Result<(), FrameGraphError> {
        let producer = self
            .producer
            .ok_or_else(|| FrameGraphError::WriteBeforeRead {
                resource: self.name.clone(),
            })?;

        if self.consumers.contains(&consumer) {
            return Ok(());
        }
        graph.add_edge(producer, consumer)?;
        self.consumers.push(consumer);
        Ok(())
    }

    pub fn destroy(&mut self, device: &dyn GpuDevice) {
        if let Some(texture) = self.texture.take() {
            log::trace!("Destroying '{}'", self.name);
            device.destroy_texture(texture);
        }
        self.begin_frame();
        self.gpu_state = ResourceState::ShaderRead;
    }

    fn read_format(&self) -> Format {
        if self.kind.is_depth_stencil() {
            Format::R32Float
        } else {
            self.format
        }
    }

    fn view(
        &self,
        view: Option<DescriptorHandle>,
    ) -> Result<(TextureHandle, DescriptorHandle), FrameGraphError> {
        match (self.texture, view) {
            (Some(texture), Some(view)) => Ok((texture, view)),
            _ => Err(self.unregistered()),
        }
    }

    fn transition_texture(
        &mut self,
        cmd: &mut dyn CommandList,
        texture: TextureHandle,
        next: ResourceState,
    ) {
        if self.gpu_state == next {
            cmd.assume_state(texture, next);
            return;
        }
        log::trace!(
            "{}: '{}' {:?} -> {:?}",
            cmd.label(),
            self.name,
            self.gpu_state,
            next
        );
        cmd.barrier(texture, self.gpu_state, next);
        self.gpu_state = next;
    }

    fn unregistered(&self) -> FrameGraphError {
        FrameGraphError::Unregistered {
            resource: self.name.clone(),
        }
    }
}

impl fmt::Debug for FrameGraphResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameGraphResource")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("format", &self.format)
            .field("producer", &self.producer)
            .field("consumers", &self.consumers)
            .field("access", &self.access)
            .field("gpu_state", &self.gpu_state)
            .finish()
    }
}

/// Owns every virtual resource of one frame graph. Names are resolved to
/// handles once, by the builder; everything after setup goes by handle.
#[derive(Default, Debug)]
pub struct ResourceTable {
    resources: Vec<FrameGraphResource>,
    names: HashMap<String, ResourceHandle>,
}

impl ResourceTable {
    /// Returns the handle for `name`, declaring the resource if it is new.
    /// The boolean is true when the resource was just created.
    pub fn intern(
        &mut self,
        name: &str,
        kind: ResourceKind,
        format: Format,
    ) -> (ResourceHandle, bool) {
        if let Some(&handle) = self.names.get(name) {
            return (handle, false);
        }

        let handle = ResourceHandle(self.resources.len() as u32);
        self.resources
            .push(FrameGraphResource::new(handle, name, kind, format));
        self.names.insert(name.to_string(), handle);
        log::trace!("Declared '{}' as {} ({:?}, {:?})", name, handle, kind, format);
        (handle, true)
    }

    pub fn lookup(&self, name: &str) -> Option<ResourceHandle> {
        self.names.get(name).copied()
    }

    pub fn get(&self, handle: ResourceHandle) -> Option<&FrameGraphResource> {
        self.resources.get(handle.index())
    }

    pub fn get_mut(&mut self, handle: ResourceHandle) -> Option<&mut FrameGraphResource> {
        self.resources.get_mut(handle.index())
    }

    /// Panics on a handle minted by another table.
    pub(crate) fn resource_mut(&mut self, handle: ResourceHandle) -> &mut FrameGraphResource {
        &mut self.resources[handle.index()]
    }

    pub fn by_name(&self, name: &str) -> Option<&FrameGraphResource> {
        self.lookup(name).and_then(|h| self.get(h))
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FrameGraphResource> + '_ {
        self.resources.iter()
    }

    pub fn begin_frame(&mut self) {
        for resource in &mut self.resources {
            resource.begin_frame();
        }
    }

    /// Closes every early-Z hold taken by the pass that just prepared.
    pub fn end_pass(&mut self) {
        for resource in &mut self.resources {
            resource.release_early_z();
        }
    }

    pub fn destroy(&mut self, device: &dyn GpuDevice) {
        for resource in &mut self.resources {
            resource.destroy(device);
        }
        self.resources.clear();
        self.names.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{DescriptorHeap, Extent2D, HeadlessDevice};

    struct Fixture {
        device: HeadlessDevice,
        cache: DescriptorCache,
        graph: DependencyGraph,
        producer: NodeId,
    }

    fn fixture() -> Fixture {
        let mut graph = DependencyGraph::default();
        let producer = graph.add_node();
        Fixture {
            device: HeadlessDevice::new(2, Extent2D::new(320, 240)),
            cache: DescriptorCache::new(),
            graph,
            producer,
        }
    }

    fn registered(fx: &Fixture, kind: ResourceKind, format: Format) -> FrameGraphResource {
        let mut resource = FrameGraphResource::new(ResourceHandle(0), "GBuffer", kind, format);
        resource.set_producer(fx.producer);
        resource
            .register(&fx.device, &fx.cache, ResourceSize::Viewport)
            .unwrap();
        resource
    }

    #[test]
    fn views_before_registration_are_refused() {
        let fx = fixture();
        let mut cmd = fx.device.create_command_list("test").unwrap();
        let mut resource =
            FrameGraphResource::new(ResourceHandle(0), "Orphan", ResourceKind::Depth, Format::D32Float);

        assert!(matches!(
            resource.write_view(cmd.as_mut()),
            Err(FrameGraphError::Unregistered { .. })
        ));
        assert!(matches!(
            resource.read_view(cmd.as_mut()),
            Err(FrameGraphError::Unregistered { .. })
        ));
        assert!(matches!(
            resource.depth_stencil_view(cmd.as_mut()),
            Err(FrameGraphError::Unregistered { .. })
        ));
    }

    #[test]
    fn registration_is_idempotent() {
        let fx = fixture();
        let mut resource = registered(&fx, ResourceKind::RenderTarget, Format::Rgba8Unorm);
        let first = resource.texture();

        resource
            .register(&fx.device, &fx.cache, ResourceSize::Viewport)
            .unwrap();

        assert_eq!(resource.texture(), first);
        assert_eq!(fx.device.textures_created(), 1);
        assert_eq!(resource.extent(), Extent2D::new(320, 240));
        // Views are appended again on every registration.
        assert_eq!(fx.cache.used(DescriptorHeap::Rtv), 2);
        assert_eq!(fx.cache.used(DescriptorHeap::CbvSrvUav), 2);
    }

    #[test]
    fn explicit_size_overrides_viewport() {
        let fx = fixture();
        let mut resource =
            FrameGraphResource::new(ResourceHandle(0), "ShadowMap", ResourceKind::Depth, Format::D32Float);
        resource
            .register(
                &fx.device,
                &fx.cache,
                ResourceSize::Explicit {
                    width: 2048,
                    height: 2048,
                },
            )
            .unwrap();

        let texture = resource.texture().unwrap();
        assert_eq!(
            fx.device.texture_desc(texture).unwrap().extent,
            Extent2D::new(2048, 2048)
        );
        assert_eq!(fx.cache.used(DescriptorHeap::Dsv), 1);
    }

    #[test]
    fn depth_read_view_is_single_channel_float() {
        let fx = fixture();
        let mut resource = registered(&fx, ResourceKind::Depth, Format::D32Float);
        let mut cmd = fx.device.create_command_list("test").unwrap();
        let view = resource.read_view(cmd.as_mut()).unwrap();
        assert_eq!(fx.device.view_format(view), Some(Format::R32Float));
    }

    #[test]
    fn read_then_write_emits_one_barrier() {
        let fx = fixture();
        let mut resource = registered(&fx, ResourceKind::RenderTarget, Format::Rgba8Unorm);
        let mut cmd = fx.device.create_command_list("test").unwrap();
        cmd.begin().unwrap();
        resource.read_view(cmd.as_mut()).unwrap();
        resource.write_view(cmd.as_mut()).unwrap();
        cmd.end().unwrap();

        let texture = resource.texture().unwrap();
        assert_eq!(
            fx.device.barriers(cmd.handle()),
            vec![(texture, ResourceState::ShaderRead, ResourceState::RenderTarget)]
        );
        assert_eq!(resource.access(), AccessState::Written);
    }

    #[test]
    fn consecutive_reads_emit_nothing_extra() {
        let fx = fixture();
        let mut resource = registered(&fx, ResourceKind::RenderTarget, Format::Rgba8Unorm);
        let mut cmd = fx.device.create_command_list("test").unwrap();
        cmd.begin().unwrap();
        resource.write_view(cmd.as_mut()).unwrap();
        resource.read_view(cmd.as_mut()).unwrap();
        resource.read_view(cmd.as_mut()).unwrap();
        cmd.end().unwrap();

        let barriers = fx.device.barriers(cmd.handle());
        assert_eq!(barriers.len(), 2);
        assert_eq!(
            (barriers[1].1, barriers[1].2),
            (ResourceState::RenderTarget, ResourceState::ShaderRead)
        );
    }

    #[test]
    fn early_z_blocks_sampling_until_written() {
        let fx = fixture();
        let mut resource = registered(&fx, ResourceKind::Depth, Format::D32Float);
        let mut cmd = fx.device.create_command_list("test").unwrap();
        cmd.begin().unwrap();

        resource.write_view(cmd.as_mut()).unwrap();
        resource.depth_stencil_view(cmd.as_mut()).unwrap();
        assert_eq!(resource.access(), AccessState::DepthReadOnly);
        assert!(matches!(
            resource.read_view(cmd.as_mut()),
            Err(FrameGraphError::EarlyZRead { .. })
        ));

        resource.write_view(cmd.as_mut()).unwrap();
        resource.read_view(cmd.as_mut()).unwrap();
        cmd.end().unwrap();

        let states: Vec<_> = fx
            .device
            .barriers(cmd.handle())
            .into_iter()
            .map(|(_, before, after)| (before, after))
            .collect();
        assert_eq!(
            states,
            vec![
                (ResourceState::ShaderRead, ResourceState::DepthWrite),
                (ResourceState::DepthWrite, ResourceState::DepthRead),
                (ResourceState::DepthRead, ResourceState::DepthWrite),
                (ResourceState::DepthWrite, ResourceState::ShaderRead),
            ]
        );
    }

    #[test]
    fn later_pass_samples_depth_after_early_z() {
        let fx = fixture();
        let mut resource = registered(&fx, ResourceKind::Depth, Format::D32Float);
        let mut cmd = fx.device.create_command_list("test").unwrap();
        cmd.begin().unwrap();

        resource.write_view(cmd.as_mut()).unwrap();
        resource.depth_stencil_view(cmd.as_mut()).unwrap();
        resource.release_early_z();
        assert_eq!(resource.access(), AccessState::Read);
        assert_eq!(resource.gpu_state(), ResourceState::DepthRead);

        resource.depth_stencil_view(cmd.as_mut()).unwrap();
        resource.release_early_z();
        resource.read_view(cmd.as_mut()).unwrap();
        cmd.end().unwrap();

        assert_eq!(fx.device.barriers(cmd.handle()).len(), 3);
        assert_eq!(resource.gpu_state(), ResourceState::ShaderRead);
    }

    #[test]
    fn depth_stencil_view_needs_depth() {
        let fx = fixture();
        let mut resource = registered(&fx, ResourceKind::RenderTarget, Format::Rgba8Unorm);
        let mut cmd = fx.device.create_command_list("test").unwrap();
        assert!(matches!(
            resource.depth_stencil_view(cmd.as_mut()),
            Err(FrameGraphError::WrongKind { .. })
        ));
    }

    #[test]
    fn connect_dedups_consumers() {
        let mut fx = fixture();
        let consumer = fx.graph.add_node();
        let mut resource = registered(&fx, ResourceKind::RenderTarget, Format::Rgba8Unorm);

        resource.connect(&mut fx.graph, consumer).unwrap();
        resource.connect(&mut fx.graph, consumer).unwrap();

        assert_eq!(resource.consumers(), &[consumer]);
        assert_eq!(fx.graph.edges().len(), 1);
        assert_eq!(fx.graph.edges()[0].from, fx.producer);
    }

    #[test]
    fn connect_without_producer_is_write_before_read() {
        let mut fx = fixture();
        let consumer = fx.graph.add_node();
        let mut resource =
            FrameGraphResource::new(ResourceHandle(0), "Late", ResourceKind::RenderTarget, Format::Rgba8Unorm);
        assert!(matches!(
            resource.connect(&mut fx.graph, consumer),
            Err(FrameGraphError::WriteBeforeRead { .. })
        ));
    }

    #[test]
    fn begin_frame_keeps_the_texture() {
        let fx = fixture();
        let mut resource = registered(&fx, ResourceKind::RenderTarget, Format::Rgba8Unorm);
        let texture = resource.texture();
        let mut cmd = fx.device.create_command_list("test").unwrap();
        resource.write_view(cmd.as_mut()).unwrap();

        resource.begin_frame();

        assert_eq!(resource.texture(), texture);
        assert_eq!(resource.producer(), None);
        assert_eq!(resource.access(), AccessState::Idle);
        assert_eq!(resource.gpu_state(), ResourceState::RenderTarget);
        // Views belong to the previous frame's descriptor cache.
        assert!(matches!(
            resource.read_view(cmd.as_mut()),
            Err(FrameGraphError::Unregistered { .. })
        ));
    }

    #[test]
    fn table_interns_names_once() {
        let mut table = ResourceTable::default();
        let (a, created_a) = table.intern("SSAO", ResourceKind::RenderTarget, Format::R32Float);
        let (b, created_b) = table.intern("SSAO", ResourceKind::RenderTarget, Format::R32Float);
        let (c, _) = table.intern("SSAOBlur", ResourceKind::RenderTarget, Format::R32Float);

        assert_eq!(a, b);
        assert!(created_a && !created_b);
        assert_ne!(a, c);
        assert_eq!(table.lookup("SSAOBlur"), Some(c));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn destroying_the_table_frees_textures() {
        let fx = fixture();
        let mut table = ResourceTable::default();
        let (handle, _) = table.intern("Sky", ResourceKind::RenderTarget, Format::Rgba8Unorm);
        table
            .get_mut(handle)
            .unwrap()
            .register(&fx.device, &fx.cache, ResourceSize::Viewport)
            .unwrap();
        assert_eq!(fx.device.texture_count(), 2);

        table.destroy(&fx.device);

        assert!(table.is_empty());
        assert_eq!(fx.device.texture_count(), 1);
    }
}
