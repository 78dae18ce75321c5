use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::concurrency::default_worker_count;
use crate::gpu::Extent2D;
use crate::render::framegraph::PassSettings;

pub const DEFAULT_PASSES: [&str; 9] = [
    "Shadow",
    "ZPrepass",
    "SSAO",
    "SSAOBlur",
    "GBuffer",
    "GBufferTransparent",
    "Skybox",
    "TAA",
    "Final",
];

/// Renderer settings, read from `weft.toml`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RendererConfig {
    pub frames_in_flight: u32,
    pub width: u32,
    pub height: u32,
    /// 0 picks one thread per core, leaving one for the render thread.
    pub worker_threads: usize,
    pub parallel_execute: bool,
    pub parallel_pre_compute: bool,
    pub passes: Vec<String>,
    pub shadow_map_size: u32,
    pub ssao_seed: u64,
    pub max_frames: Option<u64>,
    pub validation: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        let passes = PassSettings::default();
        Self {
            frames_in_flight: 3,
            width: 1280,
            height: 720,
            worker_threads: 0,
            parallel_execute: true,
            parallel_pre_compute: true,
            passes: DEFAULT_PASSES.iter().map(|p| p.to_string()).collect(),
            shadow_map_size: passes.shadow_map_size,
            ssao_seed: passes.ssao_seed,
            max_frames: None,
            validation: cfg!(debug_assertions),
        }
    }
}

impl RendererConfig {
    /// Reads `path`, or falls back to the defaults when it does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            log::info!("{} not found, using default renderer config", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        log::debug!("Loaded {}: {:?}", path.display(), config);
        Ok(config)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn worker_count(&self) -> usize {
        match self.worker_threads {
            0 => default_worker_count(),
            n => n,
        }
    }

    pub fn extent(&self) -> Extent2D {
        Extent2D::new(self.width, self.height)
    }

    pub fn pass_settings(&self) -> PassSettings {
        PassSettings {
            shadow_map_size: self.shadow_map_size,
            ssao_seed: self.ssao_seed,
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.frames_in_flight > 0, "frames_in_flight must be at least 1");
        anyhow::ensure!(
            self.width > 0 && self.height > 0,
            "window size {}x{} is empty",
            self.width,
            self.height
        );
        anyhow::ensure!(self.shadow_map_size > 0, "shadow_map_size must be positive");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = RendererConfig::parse("").unwrap();
        assert_eq!(config, RendererConfig::default());
        assert_eq!(config.passes.len(), 9);
        assert_eq!(config.passes.last().map(String::as_str), Some("Final"));
    }

    #[test]
    fn fields_override_defaults() {
        let config = RendererConfig::parse(
            r#"
            frames_in_flight = 2
            worker_threads = 3
            parallel_execute = false
            passes = ["ZPrepass", "Final"]
            max_frames = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.worker_count(), 3);
        assert!(!config.parallel_execute);
        assert!(config.parallel_pre_compute);
        assert_eq!(config.passes, vec!["ZPrepass", "Final"]);
        assert_eq!(config.max_frames, Some(10));
        assert_eq!(config.extent(), Extent2D::new(1280, 720));
    }

    #[test]
    fn zero_workers_means_auto() {
        let config = RendererConfig::default();
        assert!(config.worker_count() >= 1);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(RendererConfig::parse("frames_in_flight = 0").is_err());
        assert!(RendererConfig::parse("width = 0").is_err());
        assert!(RendererConfig::parse("unknown_key = 1").is_err());
    }

    #[test]
    fn missing_file_falls_back() {
        let config = RendererConfig::load(Path::new("does-not-exist/weft.toml")).unwrap();
        assert_eq!(config, RendererConfig::default());
    }

    #[test]
    fn pass_settings_follow_config() {
        let config = RendererConfig::parse("shadow_map_size = 1024\nssao_seed = 9").unwrap();
        assert_eq!(
            config.pass_settings(),
            PassSettings {
                shadow_map_size: 1024,
                ssao_seed: 9,
            }
        );
    }
}
