//! Dispatch tuning knobs.
//!
//! Defaults match the historical four-entry call-site cache. Values can be loaded
//! from a TOML/YAML/JSON file and overridden by `DYNSITE_*` environment variables.

use std::{fs, path::Path, str::FromStr};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::error::DispatchError;

pub const ENV_CACHE_SIZE: &str = "DYNSITE_CALLSITE_CACHE_SIZE";
pub const ENV_OPTIMIZE_THRESHOLD: &str = "DYNSITE_OPTIMIZE_THRESHOLD";
pub const ENV_FALLBACK_THRESHOLD: &str = "DYNSITE_FALLBACK_THRESHOLD";
pub const ENV_MEGAMORPHIC_MULTIPLIER: &str = "DYNSITE_MEGAMORPHIC_MULTIPLIER";
pub const ENV_STABLE_WINDOW: &str = "DYNSITE_STABLE_WINDOW";
pub const ENV_MEMOIZE: &str = "DYNSITE_MEMOIZE";

pub const MAX_CACHE_CAPACITY: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    /// Inline cache entries per call site (K). Read once when a site is created.
    pub cache_capacity: usize,
    /// Calls after which a stable site may freeze.
    pub optimize_threshold: u64,
    /// Distinct shapes without a single hit after which a site goes megamorphic
    /// right away. Never fires while the shapes still fit in `cache_capacity`.
    /// `0` disables.
    pub fallback_threshold: u64,
    /// A polymorphic site that has seen more than `cache_capacity * megamorphic_multiplier`
    /// shapes goes megamorphic.
    pub megamorphic_multiplier: u64,
    /// Calls without a new shape required before freezing (capped at
    /// `optimize_threshold`).
    pub stable_window: u64,
    pub memoize_resolutions: bool,
    pub memo_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 4,
            optimize_threshold: 10_000,
            fallback_threshold: 8,
            megamorphic_multiplier: 4,
            stable_window: 1_000,
            memoize_resolutions: true,
            memo_capacity: 4_096,
        }
    }
}

impl DispatchConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    /// Load from a file, picking the format from its extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).with_context(|| format!("failed to read config {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();
        let config: DispatchConfig = match ext.as_str() {
            "toml" => toml::from_str(&raw).with_context(|| format!("invalid TOML in {}", path.display()))?,
            "yaml" | "yml" => {
                serde_yaml::from_str(&raw).with_context(|| format!("invalid YAML in {}", path.display()))?
            }
            "json" => serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {}", path.display()))?,
            other => bail!("unsupported config format '{}' for {}", other, path.display()),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply `DYNSITE_*` overrides read through `lookup`, then validate.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = parse_var(&lookup, ENV_CACHE_SIZE)? {
            self.cache_capacity = value;
        }
        if let Some(value) = parse_var(&lookup, ENV_OPTIMIZE_THRESHOLD)? {
            self.optimize_threshold = value;
        }
        if let Some(value) = parse_var(&lookup, ENV_FALLBACK_THRESHOLD)? {
            self.fallback_threshold = value;
        }
        if let Some(value) = parse_var(&lookup, ENV_MEGAMORPHIC_MULTIPLIER)? {
            self.megamorphic_multiplier = value;
        }
        if let Some(value) = parse_var(&lookup, ENV_STABLE_WINDOW)? {
            self.stable_window = value;
        }
        if let Some(raw) = lookup(ENV_MEMOIZE) {
            self.memoize_resolutions = parse_flag(&raw).with_context(|| format!("{ENV_MEMOIZE}={raw}"))?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        if !(1..=MAX_CACHE_CAPACITY).contains(&self.cache_capacity) {
            return Err(DispatchError::InvalidConfig(format!(
                "cache_capacity must be within 1..={MAX_CACHE_CAPACITY}, got {}",
                self.cache_capacity
            )));
        }
        if self.megamorphic_multiplier == 0 {
            return Err(DispatchError::InvalidConfig(
                "megamorphic_multiplier must be at least 1".to_string(),
            ));
        }
        if self.memoize_resolutions && self.memo_capacity == 0 {
            return Err(DispatchError::InvalidConfig(
                "memo_capacity must be positive when memoization is on".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    let value = raw
        .trim()
        .replace('_', "")
        .parse::<T>()
        .with_context(|| format!("{name}={raw} is not a valid number"))?;
    Ok(Some(value))
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => bail!("expected a boolean flag, got '{other}'"),
    }
}

#[cfg(test)]
mod config_test;
