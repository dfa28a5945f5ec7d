//! Engine configuration with TOML and environment sources

use crate::locking::Timeout;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Environment variable overriding [`EngineConfig::label`]
pub const LABEL_ENV: &str = "MUXLOCK_LABEL";

/// Environment variable overriding [`EngineConfig::default_timeout_ms`]
///
/// Accepts a number of milliseconds or `infinite`.
pub const DEFAULT_TIMEOUT_ENV: &str = "MUXLOCK_DEFAULT_TIMEOUT_MS";

/// Configuration for a multiplexed lock engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Label attached to the engine's log events
    pub label: String,

    /// Timeout callers should use when they have none of their own
    /// (absent = wait indefinitely)
    pub default_timeout_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            label: "muxlock".to_string(),
            default_timeout_ms: None,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        toml::from_str(contents).context("Failed to parse engine configuration")
    }

    /// Load a configuration file, then apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&contents)?.apply_env_overrides()
    }

    /// Apply `MUXLOCK_*` environment overrides
    pub fn apply_env_overrides(self) -> anyhow::Result<Self> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn apply_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        if let Some(label) = lookup(LABEL_ENV) {
            self.label = label;
        }

        if let Some(raw) = lookup(DEFAULT_TIMEOUT_ENV) {
            let raw = raw.trim();
            self.default_timeout_ms = if raw.eq_ignore_ascii_case("infinite") {
                None
            } else {
                Some(
                    raw.parse()
                        .with_context(|| format!("Invalid {}: '{}'", DEFAULT_TIMEOUT_ENV, raw))?,
                )
            };
        }

        Ok(self)
    }

    /// Set the label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Set the default timeout
    pub fn with_default_timeout(mut self, timeout: Timeout) -> Self {
        self.default_timeout_ms = timeout
            .as_duration()
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Get the default timeout
    pub fn default_timeout(&self) -> Timeout {
        self.default_timeout_ms.map(Duration::from_millis).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.label, "muxlock");
        assert_eq!(config.default_timeout(), Timeout::Infinite);
    }

    #[test]
    fn test_from_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
            label = "billing"
            default_timeout_ms = 1500
            "#,
        )
        .unwrap();

        assert_eq!(config.label, "billing");
        assert_eq!(
            config.default_timeout(),
            Timeout::After(Duration::from_millis(1500))
        );
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = EngineConfig::from_toml_str("label = \"jobs\"").unwrap();
        assert_eq!(config.label, "jobs");
        assert_eq!(config.default_timeout_ms, None);
    }

    #[test]
    fn test_invalid_toml() {
        assert!(EngineConfig::from_toml_str("default_timeout_ms = \"soon\"").is_err());
    }

    #[test]
    fn test_overrides() {
        let config = EngineConfig::default()
            .apply_overrides(lookup_from(&[
                (LABEL_ENV, "override"),
                (DEFAULT_TIMEOUT_ENV, "250"),
            ]))
            .unwrap();
        assert_eq!(config.label, "override");
        assert_eq!(config.default_timeout_ms, Some(250));

        let config = config
            .apply_overrides(lookup_from(&[(DEFAULT_TIMEOUT_ENV, "Infinite")]))
            .unwrap();
        assert_eq!(config.default_timeout(), Timeout::Infinite);
    }

    #[test]
    fn test_invalid_override() {
        let result = EngineConfig::default()
            .apply_overrides(lookup_from(&[(DEFAULT_TIMEOUT_ENV, "later")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "label = \"from-file\"\ndefault_timeout_ms = 0").unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.label, "from-file");
        assert!(config.default_timeout().is_zero());

        assert!(EngineConfig::load(file.path().with_extension("missing")).is_err());
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::default()
            .with_label("inventory")
            .with_default_timeout(Timeout::from(Duration::from_secs(2)));
        assert_eq!(config.label, "inventory");
        assert_eq!(config.default_timeout_ms, Some(2000));

        let config = config.with_default_timeout(Timeout::Infinite);
        assert_eq!(config.default_timeout_ms, None);
    }
}
