use std::path::Path;

use anyhow::Context;
use config::Config;
use serde::de::DeserializeOwned;

/// Load a serde-deserializable value from a config file (format inferred
/// from the extension).
pub fn load_cfg<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let cfg = Config::builder()
        .add_source(config::File::from(path.to_path_buf()))
        .build()
        .with_context(|| format!("failed to read config from {}", path.display()))?;

    cfg.try_deserialize()
        .with_context(|| format!("failed to deserialize config from {}", path.display()))
}
