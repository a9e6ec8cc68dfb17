//! CLI Configuration
//!
//! Optional config file (TOML, or JSON by extension) overlaid by flags.

use anyhow::{Context, Result};
use flowmeter::RawConfig;
use std::fs;
use std::path::Path;

/// Read a config file; the format follows the extension
pub fn load(path: &Path) -> Result<RawConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("cannot read config file {}", path.display()))?;

    let raw = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => {
            let value: serde_json::Value = serde_json::from_str(&content)
                .with_context(|| format!("invalid JSON in {}", path.display()))?;
            RawConfig::from_json_value(value)?
        }
        _ => RawConfig::from_toml_str(&content)?,
    };
    Ok(raw)
}

/// File values first, flags on top
pub fn resolve(file: Option<&Path>, flags: RawConfig) -> Result<RawConfig> {
    let base = match file {
        Some(path) => load(path)?,
        None => RawConfig::default(),
    };
    Ok(base.merge(flags))
}
