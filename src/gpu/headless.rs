use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use anyhow::{Context, bail};
use parking_lot::Mutex;
use slotmap::SlotMap;

use crate::gpu::{
    CommandList, CommandListHandle, DescriptorHandle, Extent2D, Format, GpuDevice, ResourceState,
    TextureDesc, TextureHandle, TextureUsage,
};

/// A command recorded by a headless command list.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Barrier {
        texture: TextureHandle,
        before: ResourceState,
        after: ResourceState,
    },
    ClearColor {
        view: DescriptorHandle,
        color: [f32; 4],
    },
    ClearDepth {
        view: DescriptorHandle,
        depth: f32,
    },
    SetRenderTargets {
        colors: Vec<DescriptorHandle>,
        depth: Option<DescriptorHandle>,
    },
    BindShaderResource {
        slot: u32,
        view: DescriptorHandle,
    },
    SetViewport(Extent2D),
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    Copy {
        src: TextureHandle,
        dst: TextureHandle,
    },
    Upload {
        texture: TextureHandle,
        bytes: usize,
    },
}

struct RecordedList {
    label: String,
    commands: Vec<Command>,
    closed: bool,
}

#[derive(Default)]
struct HeadlessState {
    textures: SlotMap<TextureHandle, TextureDesc>,
    textures_created: usize,
    views: HashMap<DescriptorHandle, (TextureHandle, Format)>,
    lists: SlotMap<CommandListHandle, RecordedList>,
    submissions: Vec<CommandListHandle>,
    presents: u32,
    allocator_resets: u32,
    gpu_waits: u32,
}

/// Device without a GPU. Records everything it is asked to do so the frame
/// graph can be inspected from tests and from `--headless` runs.
pub struct HeadlessDevice {
    frame_count: u32,
    extent: Extent2D,
    frame_index: AtomicU32,
    back_buffer: TextureHandle,
    fail_textures: AtomicBool,
    state: Arc<Mutex<HeadlessState>>,
}

impl HeadlessDevice {
    pub fn new(frame_count: u32, extent: Extent2D) -> Self {
        let mut state = HeadlessState::default();
        let back_buffer = state.textures.insert(TextureDesc {
            label: "back buffer".to_string(),
            extent,
            format: Format::Bgra8Unorm,
            usage: TextureUsage::RenderTarget,
            initial_state: ResourceState::Present,
        });

        Self {
            frame_count: frame_count.max(1),
            extent,
            frame_index: AtomicU32::new(0),
            back_buffer,
            fail_textures: AtomicBool::new(false),
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Makes every following `create_texture` call fail.
    pub fn fail_texture_creation(&self, fail: bool) {
        self.fail_textures.store(fail, Ordering::Release);
    }

    /// Live textures, back buffer included.
    pub fn texture_count(&self) -> usize {
        self.state.lock().textures.len()
    }

    /// Total textures ever created through `create_texture`.
    pub fn textures_created(&self) -> usize {
        self.state.lock().textures_created
    }

    pub fn texture_desc(&self, texture: TextureHandle) -> Option<TextureDesc> {
        self.state.lock().textures.get(texture).cloned()
    }

    pub fn view_target(&self, view: DescriptorHandle) -> Option<TextureHandle> {
        self.state.lock().views.get(&view).map(|(texture, _)| *texture)
    }

    pub fn view_format(&self, view: DescriptorHandle) -> Option<Format> {
        self.state.lock().views.get(&view).map(|(_, format)| *format)
    }

    /// Commands of the last closed recording of `list`.
    pub fn commands(&self, list: CommandListHandle) -> Vec<Command> {
        self.state
            .lock()
            .lists
            .get(list)
            .map(|l| l.commands.clone())
            .unwrap_or_default()
    }

    pub fn barriers(&self, list: CommandListHandle) -> Vec<(TextureHandle, ResourceState, ResourceState)> {
        self.commands(list)
            .into_iter()
            .filter_map(|c| match c {
                Command::Barrier {
                    texture,
                    before,
                    after,
                } => Some((texture, before, after)),
                _ => None,
            })
            .collect()
    }

    pub fn list_label(&self, list: CommandListHandle) -> Option<String> {
        self.state.lock().lists.get(list).map(|l| l.label.clone())
    }

    /// Every handle passed to `execute_command_lists`, in submission order.
    pub fn submissions(&self) -> Vec<CommandListHandle> {
        self.state.lock().submissions.clone()
    }

    pub fn submitted_labels(&self) -> Vec<String> {
        let state = self.state.lock();
        state
            .submissions
            .iter()
            .filter_map(|h| state.lists.get(*h).map(|l| l.label.clone()))
            .collect()
    }

    pub fn clear_submissions(&self) {
        self.state.lock().submissions.clear();
    }

    pub fn presents(&self) -> u32 {
        self.state.lock().presents
    }

    pub fn allocator_resets(&self) -> u32 {
        self.state.lock().allocator_resets
    }

    pub fn gpu_waits(&self) -> u32 {
        self.state.lock().gpu_waits
    }
}

impl GpuDevice for HeadlessDevice {
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
        Ok(())
    }

    fn create_texture(&self, desc: &TextureDesc) -> anyhow::Result<TextureHandle> {
        if self.fail_textures.load(Ordering::Acquire) {
            bail!("out of device memory creating '{}'", desc.label);
        }
        if desc.extent.width == 0 || desc.extent.height == 0 {
            bail!("'{}' has an empty extent {}", desc.label, desc.extent);
        }

        let mut state = self.state.lock();
        state.textures_created += 1;
        let handle = state.textures.insert(desc.clone());
        log::trace!("headless: created '{}' {} {:?}", desc.label, desc.extent, desc.format);
        Ok(handle)
    }

    fn destroy_texture(&self, texture: TextureHandle) {
        let mut state = self.state.lock();
        if let Some(desc) = state.textures.remove(texture) {
            log::trace!("headless: destroyed '{}'", desc.label);
        }
        state.views.retain(|_, (target, _)| *target != texture);
    }

    fn create_view(
        &self,
        texture: TextureHandle,
        descriptor: DescriptorHandle,
        format: Format,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if !state.textures.contains_key(texture) {
            bail!("view of a destroyed texture");
        }
        state.views.insert(descriptor, (texture, format));
        Ok(())
    }

    fn back_buffer(&self) -> TextureHandle {
        self.back_buffer
    }

    fn create_command_list(&self, label: &str) -> anyhow::Result<Box<dyn CommandList>> {
        let handle = self.state.lock().lists.insert(RecordedList {
            label: label.to_string(),
            commands: Vec::new(),
            closed: false,
        });

        Ok(Box::new(HeadlessCommandList {
            handle,
            label: label.to_string(),
            commands: Vec::new(),
            recording: false,
            state: self.state.clone(),
        }))
    }

    fn reset_command_allocator(&self) -> anyhow::Result<()> {
        self.state.lock().allocator_resets += 1;
        Ok(())
    }

    fn execute_command_lists(&self, lists: &[CommandListHandle]) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        for &handle in lists {
            let list = state
                .lists
                .get(handle)
                .context("executing an unknown command list")?;
            if !list.closed {
                bail!("command list '{}' executed before it was closed", list.label);
            }
        }
        state.submissions.extend_from_slice(lists);
        Ok(())
    }

    fn present(&self) -> anyhow::Result<()> {
        self.state.lock().presents += 1;
        let next = (self.frame_index() + 1) % self.frame_count;
        self.frame_index.store(next, Ordering::Release);
        Ok(())
    }

    fn wait_for_gpu(&self) -> anyhow::Result<()> {
        self.state.lock().gpu_waits += 1;
        Ok(())
    }
}

struct HeadlessCommandList {
    handle: CommandListHandle,
    label: String,
    commands: Vec<Command>,
    recording: bool,
    state: Arc<Mutex<HeadlessState>>,
}

impl HeadlessCommandList {
    fn record(&mut self, command: Command) {
        if !self.recording {
            log::warn!("headless: '{}' recorded {:?} outside begin/end", self.label, command);
        }
        self.commands.push(command);
    }
}

impl CommandList for HeadlessCommandList {
    fn handle(&self) -> CommandListHandle {
        self.handle
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn begin(&mut self) -> anyhow::Result<()> {
        self.commands.clear();
        self.recording = true;
        if let Some(list) = self.state.lock().lists.get_mut(self.handle) {
            list.closed = false;
        }
        Ok(())
    }

    fn end(&mut self) -> anyhow::Result<()> {
        if !self.recording {
            bail!("command list '{}' ended without begin", self.label);
        }
        self.recording = false;

        let mut state = self.state.lock();
        let list = state
            .lists
            .get_mut(self.handle)
            .context("command list outlived its device")?;
        list.commands = std::mem::take(&mut self.commands);
        list.closed = true;
        Ok(())
    }

    fn barrier(&mut self, texture: TextureHandle, before: ResourceState, after: ResourceState) {
        self.record(Command::Barrier {
            texture,
            before,
            after,
        });
    }

    fn clear_color(&mut self, view: DescriptorHandle, color: [f32; 4]) {
        self.record(Command::ClearColor { view, color });
    }

    fn clear_depth(&mut self, view: DescriptorHandle, depth: f32) {
        self.record(Command::ClearDepth { view, depth });
    }

    fn set_render_targets(&mut self, colors: &[DescriptorHandle], depth: Option<DescriptorHandle>) {
        self.record(Command::SetRenderTargets {
            colors: colors.to_vec(),
            depth,
        });
    }

    fn bind_shader_resource(&mut self, slot: u32, view: DescriptorHandle) {
        self.record(Command::BindShaderResource { slot, view });
    }

    fn set_viewport(&mut self, extent: Extent2D) {
        self.record(Command::SetViewport(extent));
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32) {
        self.record(Command::Draw {
            vertex_count,
            instance_count,
        });
    }

    fn copy_texture(&mut self, src: TextureHandle, dst: TextureHandle) {
        self.record(Command::Copy { src, dst });
    }

    fn upload(&mut self, texture: TextureHandle, data: &[u8]) -> anyhow::Result<()> {
        let expected = {
            let state = self.state.lock();
            let desc = state
                .textures
                .get(texture)
                .context("upload into a destroyed texture")?;
            desc.extent.width as usize
                * desc.extent.height as usize
                * desc.format.bytes_per_texel() as usize
        };
        if data.len() != expected {
            bail!(
                "upload of {} bytes into a texture of {} bytes",
                data.len(),
                expected
            );
        }
        self.record(Command::Upload {
            texture,
            bytes: data.len(),
        });
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_index_cycles_on_present() {
        let device = HeadlessDevice::new(3, Extent2D::new(8, 8));
        let seen: Vec<u32> = (0..5)
            .map(|_| {
                let index = device.frame_index();
                device.present().unwrap();
                index
            })
            .collect();
        assert_eq!(seen, vec![0, 1, 2, 0, 1]);
        assert_eq!(device.presents(), 5);
    }

    #[test]
    fn open_lists_cannot_be_executed() {
        let device = HeadlessDevice::new(2, Extent2D::new(8, 8));
        let mut list = device.create_command_list("open").unwrap();
        list.begin().unwrap();
        assert!(device.execute_command_lists(&[list.handle()]).is_err());

        list.end().unwrap();
        device.execute_command_lists(&[list.handle()]).unwrap();
        assert_eq!(device.submitted_labels(), vec!["open".to_string()]);
    }

    #[test]
    fn recordings_replace_each_other() {
        let device = HeadlessDevice::new(2, Extent2D::new(8, 8));
        let mut list = device.create_command_list("again").unwrap();
        list.begin().unwrap();
        list.draw(3, 1);
        list.draw(3, 1);
        list.end().unwrap();
        list.begin().unwrap();
        list.draw(6, 1);
        list.end().unwrap();

        assert_eq!(
            device.commands(list.handle()),
            vec![Command::Draw {
                vertex_count: 6,
                instance_count: 1
            }]
        );
    }

    #[test]
    fn texture_failure_can_be_injected() {
        let device = HeadlessDevice::new(2, Extent2D::new(8, 8));
        let desc = TextureDesc {
            label: "gbuffer".to_string(),
            extent: Extent2D::new(8, 8),
            format: Format::Rgba8Unorm,
            usage: TextureUsage::RenderTarget,
            initial_state: ResourceState::ShaderRead,
        };
        device.fail_texture_creation(true);
        assert!(device.create_texture(&desc).is_err());
        device.fail_texture_creation(false);
        assert!(device.create_texture(&desc).is_ok());
        assert_eq!(device.textures_created(), 1);
    }

    #[test]
    fn upload_size_check_handles_huge_textures() {
        let device = HeadlessDevice::new(2, Extent2D::new(8, 8));
        let huge = device
            .create_texture(&TextureDesc {
                label: "huge".to_string(),
                extent: Extent2D::new(65536, 65536),
                format: Format::Rgba32Float,
                usage: TextureUsage::Sampled,
                initial_state: ResourceState::ShaderRead,
            })
            .unwrap();

        let mut list = device.create_command_list("upload").unwrap();
        list.begin().unwrap();
        let err = list.upload(huge, &[0; 16]).unwrap_err();
        assert!(err.to_string().contains("68719476736 bytes"), "{err}");
    }
}
