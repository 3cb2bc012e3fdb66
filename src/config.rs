use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// How long buffered writes may sit before the flush monitor sends them.
pub const FLUSH_TIMEOUT_MS: u64 = 10;

/// Coordinator configuration, loaded from the config file.
/// Keeps the render-farm knobs small and explicit.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Worker endpoints as `host` or `host:port` (port defaults to 19400).
    pub workers: Vec<String>,

    /// Runaway margin in percent of absolute progress: a worker more than
    /// `runaway / 100` ahead of the slowest is paused.
    pub runaway: f32,

    /// Base name of the output images (`{name}.exr` and per-worker files).
    pub name: String,

    /// Image width in pixels. At most 65535; the slab payload packs the
    /// offset and chunk size into 16 bits each.
    pub width: u32,

    /// Image height in pixels.
    pub height: u32,

    /// Buffers every image carries (e.g. `r`, `g`, `b`).
    pub buffers: Vec<String>,

    /// Scene bounding box, used for spatial routing codes.
    pub min: [f32; 3],
    pub max: [f32; 3],

    /// Samples per pixel, forwarded to workers.
    #[serde(default = "default_samples")]
    pub samples: u32,

    /// Path-depth limit, forwarded to workers.
    #[serde(default = "default_bounces")]
    pub max_bounces: u32,

    /// Period of the worker statistics window in milliseconds. The
    /// interesting monitor fires every `stats_timeout_ms * max_intervals`.
    #[serde(default = "default_stats_timeout")]
    pub stats_timeout_ms: u64,

    /// Logical CPU core to pin the reactor thread to (`None` = no pinning).
    #[serde(default)]
    pub core_id: Option<usize>,
}

fn default_samples() -> u32 {
    16
}

fn default_bounces() -> u32 {
    4
}

fn default_stats_timeout() -> u64 {
    1000
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers.is_empty() {
            bail!("config lists no workers");
        }
        if self.width == 0 || self.height == 0 {
            bail!("image dimensions must be nonzero");
        }
        if self.width > u16::MAX as u32 {
            bail!(
                "image width {} exceeds {}, the slab payload limit",
                self.width,
                u16::MAX
            );
        }
        if self.width < self.workers.len() as u32 {
            bail!(
                "image width {} is narrower than the {} workers it must be split across",
                self.width,
                self.workers.len()
            );
        }
        if self.runaway < 0.0 {
            bail!("runaway margin must not be negative");
        }
        if self.stats_timeout_ms == 0 {
            bail!("stats_timeout_ms must be nonzero");
        }
        for axis in 0..3 {
            if self.min[axis] >= self.max[axis] {
                bail!(
                    "scene bounds are inverted on axis {}: {} >= {}",
                    axis,
                    self.min[axis],
                    self.max[axis]
                );
            }
        }
        Ok(())
    }

    /// Runaway margin as a fraction of progress.
    pub fn runaway_margin(&self) -> f32 {
        self.runaway / 100.0
    }
}

/// The settings shipped to every worker in SYNC_CONFIG. The asset counts
/// tell the worker how many SYNC_SHADER/TEXTURE/MATERIAL frames follow
/// before it should acknowledge the configuration batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderSettings {
    pub width: u32,
    pub height: u32,
    pub buffers: Vec<String>,
    pub min: [f32; 3],
    pub max: [f32; 3],
    pub samples: u32,
    pub max_bounces: u32,
    pub n_shaders: u32,
    pub n_textures: u32,
    pub n_materials: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> EngineConfig {
        EngineConfig {
            workers: vec!["10.0.0.1".into(), "10.0.0.2:19500".into()],
            runaway: 5.0,
            name: "out".into(),
            width: 640,
            height: 480,
            buffers: vec!["r".into(), "g".into(), "b".into()],
            min: [-10.0, -10.0, -10.0],
            max: [10.0, 10.0, 10.0],
            samples: 16,
            max_bounces: 4,
            stats_timeout_ms: 1000,
            core_id: None,
        }
    }

    #[test]
    fn valid_config_passes() {
        base().validate().unwrap();
    }

    #[test]
    fn rejects_bad_shapes() {
        let mut c = base();
        c.workers.clear();
        assert!(c.validate().is_err());

        let mut c = base();
        c.width = 70_000;
        assert!(c.validate().is_err());

        let mut c = base();
        c.min[1] = 10.0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn runaway_is_percent_of_progress() {
        assert!((base().runaway_margin() - 0.05).abs() < f32::EPSILON);
    }
}
