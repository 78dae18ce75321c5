use std::collections::HashMap;

use anyhow::Context;

use crate::gpu::{CommandList, Extent2D};

/// Points in the frame where passes hand over to scene drawing.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum DrawStage {
    Shadow,
    ZPrepass,
    GBuffer,
    Transparent,
    Skybox,
}

pub struct DrawContext<'a> {
    pub stage: DrawStage,
    pub cmd: &'a mut dyn CommandList,
    pub extent: Extent2D,
}

type DrawHook = Box<dyn Fn(&mut DrawContext) -> anyhow::Result<()> + Send + Sync>;

/// Scene-drawing callbacks, built once and shared by every pass.
#[derive(Default)]
pub struct DrawHooks {
    hooks: HashMap<DrawStage, Vec<DrawHook>>,
}

impl DrawHooks {
    pub fn register(
        &mut self,
        stage: DrawStage,
        hook: impl Fn(&mut DrawContext) -> anyhow::Result<()> + Send + Sync + 'static,
    ) {
        self.hooks.entry(stage).or_default().push(Box::new(hook));
    }

    pub fn with(
        mut self,
        stage: DrawStage,
        hook: impl Fn(&mut DrawContext) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.register(stage, hook);
        self
    }

    pub fn hook_count(&self, stage: DrawStage) -> usize {
        self.hooks.get(&stage).map_or(0, Vec::len)
    }

    /// Runs every hook registered for `stage`, in registration order.
    pub fn draw(
        &self,
        stage: DrawStage,
        cmd: &mut dyn CommandList,
        extent: Extent2D,
    ) -> anyhow::Result<()> {
        let Some(hooks) = self.hooks.get(&stage) else {
            return Ok(());
        };

        let mut ctx = DrawContext { stage, cmd, extent };
        for (i, hook) in hooks.iter().enumerate() {
            hook(&mut ctx).with_context(|| format!("{:?} draw hook {} failed", stage, i))?;
        }
        Ok(())
    }
}
