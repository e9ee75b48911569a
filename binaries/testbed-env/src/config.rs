//! Configuration for testbed-env.
//!
//! The file holds the environment sections of the orchestrator library at
//! top level, plus a `[logging]` section for this binary.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use testbed_orchestrator::{EnvironmentConfig, ImageRef};

/// Complete configuration for testbed-env.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TestbedConfig {
    /// Logging configuration.
    pub logging: LoggingConfig,

    /// Environment sections (`[runtime]`, `[network]`, `[database]`, ...).
    #[serde(flatten)]
    pub environment: EnvironmentConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,

    /// Log format (pretty, json, compact).
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl TestbedConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Merges CLI arguments into the configuration.
    pub fn merge_cli_args(&mut self, args: &super::CliArgs) {
        if let Some(ref schema) = args.schema {
            self.environment.schema.path = schema.clone();
        }

        // Keep the configured pull policy for the replacement image
        if let Some(ref image) = args.service_image {
            let policy = self.environment.service.image.pull_policy;
            self.environment.service.image = ImageRef::new(image.as_str()).with_pull_policy(policy);
        }

        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!("Invalid log level: {}", self.logging.level);
        }

        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.to_lowercase().as_str()) {
            anyhow::bail!("Invalid log format: {}", self.logging.format);
        }

        self.environment.validate()?;

        if !self.environment.schema.path.exists() {
            anyhow::bail!(
                "Schema file not found: {:?}",
                self.environment.schema.path
            );
        }

        Ok(())
    }
}
