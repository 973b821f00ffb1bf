/// `load_config` module: builds the process-wide [`AppConfig`] from an optional
/// YAML file plus environment overrides.
///
/// This is the only place the binary reads configuration from the outside
/// world. The result is passed down explicitly: the pipeline receives its
/// [`PipelineConfig`] section and never looks at the environment itself.
///
/// # Sources, in order of precedence (last wins)
/// 1. Built-in defaults for every field.
/// 2. The YAML file given with `--config`, if any (`server:` and `pipeline:` sections).
/// 3. Environment variables (a `.env` file is loaded by `main` via `dotenvy`):
///    `PORT`, `GITSCAPE_HOST`, `GITSCAPE_WORKSPACE_ROOT`,
///    `GITSCAPE_CORS_ORIGINS` (comma-separated) and `GITHUB_TOKEN`.
///
/// # Errors
/// All errors use `anyhow::Error` and are surfaced at the CLI boundary.
use anyhow::{Context, Result};
use gitscape_core::PipelineConfig;
use secrecy::SecretString;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info};

use crate::server::ServerConfig;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub pipeline: PipelineConfig,
    /// Applied to requests that carry no token of their own. Only ever set from the environment.
    #[serde(skip)]
    pub default_token: Option<SecretString>,
}

impl AppConfig {
    pub fn trace_loaded(&self) {
        info!(
            host = %self.server.host,
            port = self.server.port,
            cors_origins = ?self.server.cors_origins,
            max_concurrent_digests = self.server.max_concurrent_digests,
            request_timeout_secs = self.server.request_timeout_secs,
            default_token = self.default_token.is_some(),
            "Loaded AppConfig"
        );
        self.pipeline.trace_loaded();
    }
}

/// Load the YAML file (when given) and apply environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let mut config = match path {
        Some(path) => read_yaml(path)?,
        None => {
            info!("No config file given, using defaults");
            AppConfig::default()
        }
    };
    apply_env_overrides(&mut config)?;
    Ok(config)
}

fn read_yaml(path: &Path) -> Result<AppConfig> {
    info!(config_path = ?path, "Loading configuration from file");
    let content = fs::read_to_string(path).map_err(|e| {
        error!(error = ?e, config_path = ?path, "Failed to read config file");
        anyhow::anyhow!("Failed to read config file {:?}: {}", path, e)
    })?;
    // An empty file is a valid, all-defaults config.
    if content.trim().is_empty() {
        return Ok(AppConfig::default());
    }
    serde_yaml::from_str(&content).map_err(|e| {
        error!(error = ?e, config_path = ?path, "Failed to parse config YAML");
        anyhow::anyhow!("Failed to parse config YAML: {e}")
    })
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Overlay `PORT`, `GITSCAPE_*` and `GITHUB_TOKEN` onto `config`.
pub fn apply_env_overrides(config: &mut AppConfig) -> Result<()> {
    if let Some(port) = var("PORT") {
        config.server.port = port
            .trim()
            .parse()
            .with_context(|| format!("PORT must be a port number, got {port:?}"))?;
    }
    if let Some(host) = var("GITSCAPE_HOST") {
        config.server.host = host;
    }
    if let Some(root) = var("GITSCAPE_WORKSPACE_ROOT") {
        config.pipeline.workspace_root = PathBuf::from(root);
    }
    if let Some(origins) = var("GITSCAPE_CORS_ORIGINS") {
        config.server.cors_origins = origins
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(String::from)
            .collect();
    }
    if let Some(token) = var("GITHUB_TOKEN") {
        config.default_token = Some(SecretString::from(token));
    }
    Ok(())
}
