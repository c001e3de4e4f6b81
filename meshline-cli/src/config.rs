//! Loads the session [`meshline_core::Config`] from a TOML file.
//!
//! The shape on disk is exactly [`meshline_core::Config`]'s `Serialize`/
//! `Deserialize` impl — there is no separate CLI-only DTO, since every field
//! the engine needs has no sensible CLI flag (JWKS secrets, STUN servers,
//! retry tuning). The CLI only ever overlays the bearer token, which is kept
//! out of the file and supplied per-invocation.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use meshline_core::Config;

pub fn default_config_path() -> PathBuf {
    dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("meshline").join("config.toml")
}

pub fn load(path: Option<&Path>) -> Result<Config> {
    let path = path.map(PathBuf::from).unwrap_or_else(default_config_path);
    let raw = std::fs::read_to_string(&path).with_context(|| format!("reading config file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
}
