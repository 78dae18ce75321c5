use std::collections::HashMap;
use std::fmt;

use crate::error::FrameGraphError;
use crate::gpu::GpuDevice;
use crate::render::framegraph::pass::{
    FinalPass, GBufferPass, Pass, ShadowPass, SkyboxPass, SsaoBlurPass, SsaoPass, TaaPass,
    TransparentPass, ZPrepass,
};

/// Knobs handed to every pass factory.
#[derive(Clone, Debug, PartialEq)]
pub struct PassSettings {
    pub shadow_map_size: u32,
    pub ssao_seed: u64,
}

impl Default for PassSettings {
    fn default() -> Self {
        Self {
            shadow_map_size: 2048,
            ssao_seed: 0x55a0,
        }
    }
}

type PassFactory =
    Box<dyn Fn(&dyn GpuDevice, &PassSettings) -> anyhow::Result<Box<dyn Pass>> + Send + Sync>;

/// Pass constructors by name, so the pass list can come from configuration.
#[derive(Default)]
pub struct PassRegistry {
    factories: HashMap<String, PassFactory>,
}

impl PassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The renderer's built-in passes.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("Shadow", |device, settings| {
            Ok(Box::new(ShadowPass::new(device, settings.shadow_map_size)?))
        });
        registry.register("ZPrepass", |device, _| Ok(Box::new(ZPrepass::new(device)?)));
        registry.register("SSAO", |device, settings| {
            Ok(Box::new(SsaoPass::new(device, settings.ssao_seed)?))
        });
        registry.register("SSAOBlur", |device, _| Ok(Box::new(SsaoBlurPass::new(device)?)));
        registry.register("GBuffer", |device, _| Ok(Box::new(GBufferPass::new(device)?)));
        registry.register("GBufferTransparent", |device, _| {
            Ok(Box::new(TransparentPass::new(device)?))
        });
        registry.register("Skybox", |device, _| Ok(Box::new(SkyboxPass::new(device)?)));
        registry.register("TAA", |device, _| Ok(Box::new(TaaPass::new(device)?)));
        registry.register("Final", |device, _| Ok(Box::new(FinalPass::new(device)?)));
        registry
    }

    /// Adds or replaces the factory for `name`.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn(&dyn GpuDevice, &PassSettings) -> anyhow::Result<Box<dyn Pass>>
        + Send
        + Sync
        + 'static,
    ) {
        self.factories.insert(name.into(), Box::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn create(
        &self,
        name: &str,
        device: &dyn GpuDevice,
        settings: &PassSettings,
    ) -> anyhow::Result<Box<dyn Pass>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| FrameGraphError::UnknownPass(name.to_string()))?;
        factory(device, settings)
    }
}

impl fmt::Debug for PassRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassRegistry")
            .field("passes", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{Extent2D, HeadlessDevice};

    #[test]
    fn defaults_cover_the_renderer() {
        let registry = PassRegistry::with_defaults();
        assert_eq!(
            registry.names(),
            vec![
                "Final",
                "GBuffer",
                "GBufferTransparent",
                "SSAO",
                "SSAOBlur",
                "Shadow",
                "Skybox",
                "TAA",
                "ZPrepass",
            ]
        );
    }

    #[test]
    fn created_pass_reports_its_name() {
        let device = HeadlessDevice::new(2, Extent2D::new(8, 8));
        let registry = PassRegistry::with_defaults();
        let pass = registry
            .create("GBufferTransparent", &device, &PassSettings::default())
            .unwrap();
        assert_eq!(pass.name(), "GBufferTransparent");
        assert!(!pass.is_target());

        let last = registry
            .create("Final", &device, &PassSettings::default())
            .unwrap();
        assert!(last.is_target());
    }

    #[test]
    fn unknown_name_is_an_error() {
        let device = HeadlessDevice::new(2, Extent2D::new(8, 8));
        let err = PassRegistry::with_defaults()
            .create("Bloom", &device, &PassSettings::default())
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<FrameGraphError>(),
            Some(FrameGraphError::UnknownPass(name)) if name == "Bloom"
        ));
    }
}
