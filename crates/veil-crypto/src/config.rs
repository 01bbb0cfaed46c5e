use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::CryptoError;
use crate::prekey::INITIAL_ONE_TIME_KEYS;

pub const ENV_FORCE_FALLBACK: &str = "VEIL_FORCE_FALLBACK";
pub const ENV_STORE_DIR: &str = "VEIL_STORE_DIR";
pub const ENV_STORE_SECRET: &str = "VEIL_STORE_SECRET";
pub const ENV_PBKDF2_ITERATIONS: &str = "VEIL_PBKDF2_ITERATIONS";

/// Crypto layer configuration, loaded from a TOML file and/or the environment.
#[derive(Clone, Deserialize)]
pub struct CryptoConfig {
    /// Skip the native engine and run on the software fallback.
    #[serde(default)]
    pub force_fallback: bool,

    /// Directory for persisted identity records. In-memory when unset.
    #[serde(default)]
    pub store_dir: Option<PathBuf>,

    /// Passphrase identity records are sealed under, used when the caller
    /// does not supply one.
    #[serde(default)]
    pub store_secret: Option<String>,

    /// PBKDF2-HMAC-SHA256 iterations for passphrase-derived keys.
    #[serde(default = "default_pbkdf2_iterations")]
    pub pbkdf2_iterations: u32,

    /// One-time keys generated for a fresh identity.
    #[serde(default = "default_initial_one_time_keys")]
    pub initial_one_time_keys: usize,
}

fn default_pbkdf2_iterations() -> u32 {
    600_000
}

fn default_initial_one_time_keys() -> usize {
    INITIAL_ONE_TIME_KEYS
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            force_fallback: false,
            store_dir: None,
            store_secret: None,
            pbkdf2_iterations: default_pbkdf2_iterations(),
            initial_one_time_keys: default_initial_one_time_keys(),
        }
    }
}

impl fmt::Debug for CryptoConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoConfig")
            .field("force_fallback", &self.force_fallback)
            .field("store_dir", &self.store_dir)
            .field("store_secret", &self.store_secret.as_ref().map(|_| "<redacted>"))
            .field("pbkdf2_iterations", &self.pbkdf2_iterations)
            .field("initial_one_time_keys", &self.initial_one_time_keys)
            .finish()
    }
}

impl CryptoConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, CryptoError> {
        let config: CryptoConfig =
            toml::from_str(content).map_err(|e| CryptoError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, CryptoError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Defaults overridden by `VEIL_*` environment variables.
    pub fn from_env() -> Result<Self, CryptoError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), CryptoError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), CryptoError> {
        if let Some(value) = lookup(ENV_FORCE_FALLBACK) {
            self.force_fallback = parse_bool(ENV_FORCE_FALLBACK, &value)?;
        }
        if let Some(value) = lookup(ENV_STORE_DIR) {
            self.store_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup(ENV_STORE_SECRET) {
            self.store_secret = Some(value);
        }
        if let Some(value) = lookup(ENV_PBKDF2_ITERATIONS) {
            self.pbkdf2_iterations = value.trim().parse().map_err(|_| {
                CryptoError::Config(format!("{ENV_PBKDF2_ITERATIONS} must be an integer, got {value:?}"))
            })?;
        }
        self.validate()
    }

    fn validate(&self) -> Result<(), CryptoError> {
        if self.pbkdf2_iterations == 0 {
            return Err(CryptoError::Config("pbkdf2_iterations must be non-zero".into()));
        }
        Ok(())
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, CryptoError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(CryptoError::Config(format!(
            "{name} must be a boolean, got {value:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn default_config_values() {
        let config = CryptoConfig::default();
        assert!(!config.force_fallback);
        assert_eq!(config.pbkdf2_iterations, 600_000);
        assert_eq!(config.initial_one_time_keys, 50);
        assert!(config.store_dir.is_none());
    }

    #[test]
    fn config_toml_deserialization() {
        let toml = r#"
            force_fallback = true
            store_dir = "/var/lib/veil"
            pbkdf2_iterations = 1000
        "#;
        let config = CryptoConfig::from_toml_str(toml).unwrap();
        assert!(config.force_fallback);
        assert_eq!(config.store_dir, Some(PathBuf::from("/var/lib/veil")));
        assert_eq!(config.pbkdf2_iterations, 1000);
        assert_eq!(config.initial_one_time_keys, 50);
    }

    #[test]
    fn zero_iterations_rejected() {
        assert!(matches!(
            CryptoConfig::from_toml_str("pbkdf2_iterations = 0"),
            Err(CryptoError::Config(_))
        ));
    }

    #[test]
    fn overrides_apply() {
        let vars: HashMap<&str, &str> = [
            (ENV_FORCE_FALLBACK, "yes"),
            (ENV_STORE_SECRET, "hunter2"),
            (ENV_PBKDF2_ITERATIONS, "2000"),
        ]
        .into_iter()
        .collect();
        let mut config = CryptoConfig::default();
        config
            .apply_overrides(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert!(config.force_fallback);
        assert_eq!(config.store_secret.as_deref(), Some("hunter2"));
        assert_eq!(config.pbkdf2_iterations, 2000);
    }

    #[test]
    fn bad_override_rejected() {
        let mut config = CryptoConfig::default();
        assert!(config
            .apply_overrides(|name| (name == ENV_FORCE_FALLBACK).then(|| "maybe".to_string()))
            .is_err());
    }

    #[test]
    fn debug_redacts_secret() {
        let config = CryptoConfig {
            store_secret: Some("hunter2".into()),
            ..CryptoConfig::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
