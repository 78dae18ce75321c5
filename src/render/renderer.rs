use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;

use crate::gpu::{CommandListHandle, GpuDevice};

/// Collects recorded command lists and hands them to the queue.
pub struct RenderSystem {
    device: Arc<dyn GpuDevice>,
    pending: Mutex<Vec<CommandListHandle>>,
}

impl RenderSystem {
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        Self {
            device,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn submit(&self, list: CommandListHandle) {
        self.pending.lock().push(list);
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Executes everything submitted this frame, then presents.
    pub fn render(&self) -> anyhow::Result<()> {
        crate::profile_scope!("render");
        self.flush().context("failed to execute frame command lists")?;
        self.device.present().context("failed to present")?;
        Ok(())
    }

    /// Executes everything submitted so far and blocks until the GPU is done.
    pub fn upload(&self) -> anyhow::Result<()> {
        crate::profile_scope!("upload");
        self.flush().context("failed to execute upload command lists")?;
        self.device
            .wait_for_gpu()
            .context("failed waiting for uploads")?;
        Ok(())
    }

    fn flush(&self) -> anyhow::Result<()> {
        let lists = std::mem::take(&mut *self.pending.lock());
        if lists.is_empty() {
            return Ok(());
        }
        log::trace!("Executing {} command lists", lists.len());
        self.device.execute_command_lists(&lists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{Extent2D, HeadlessDevice};

    #[test]
    fn render_flushes_then_presents() {
        let device = Arc::new(HeadlessDevice::new(2, Extent2D::new(4, 4)));
        let renderer = RenderSystem::new(device.clone());

        let mut list = device.create_command_list("one").unwrap();
        list.begin().unwrap();
        list.end().unwrap();
        renderer.submit(list.handle());
        renderer.render().unwrap();

        assert_eq!(renderer.pending(), 0);
        assert_eq!(device.submissions(), vec![list.handle()]);
        assert_eq!(device.presents(), 1);
    }

    #[test]
    fn upload_waits_for_the_gpu() {
        let device = Arc::new(HeadlessDevice::new(2, Extent2D::new(4, 4)));
        let renderer = RenderSystem::new(device.clone());
        renderer.upload().unwrap();

        assert_eq!(device.gpu_waits(), 1);
        assert_eq!(device.presents(), 0);
        assert!(device.submissions().is_empty());
    }
}
