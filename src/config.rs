//! Configuration structures and loading logic

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Main serving configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServingConfig {
    pub http_host: String,
    pub http_port: u16,
    /// Capacity of each worker's task queue
    pub queue_size: usize,
    /// Capacity of the shared worker→router result intake
    pub result_buffer: usize,
    pub shutdown_grace_secs: u64,
    pub transport: TransportKind,

    /// Binary launched for worker processes (defaults to the running executable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_program: Option<PathBuf>,

    pub models: BTreeMap<String, ModelConfig>,
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            http_host: default_http_host(),
            http_port: default_http_port(),
            queue_size: default_queue_size(),
            result_buffer: default_result_buffer(),
            shutdown_grace_secs: default_shutdown_grace(),
            transport: TransportKind::default(),
            worker_program: None,
            models: BTreeMap::new(),
        }
    }
}

impl ServingConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<&PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(port) = std::env::var("INFER_MUX_HTTP_PORT") {
            config.http_port = port.parse().context("Invalid INFER_MUX_HTTP_PORT value")?;
        }
        if let Ok(size) = std::env::var("INFER_MUX_QUEUE_SIZE") {
            config.queue_size = size
                .parse()
                .context("Invalid INFER_MUX_QUEUE_SIZE value")?;
        }
        if let Ok(transport) = std::env::var("INFER_MUX_TRANSPORT") {
            config.transport = transport.parse()?;
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.http_port < 1024 {
            anyhow::bail!("HTTP port must be >= 1024 (got {})", self.http_port);
        }
        if self.queue_size == 0 {
            anyhow::bail!("queue_size must be greater than zero");
        }
        if self.result_buffer == 0 {
            anyhow::bail!("result_buffer must be greater than zero");
        }

        for (name, model) in &self.models {
            if name.is_empty() {
                anyhow::bail!("Model name cannot be empty");
            }
            if name.contains('/') || name.contains('\\') {
                anyhow::bail!("Model name '{}' cannot contain path separators", name);
            }
            if model.enable && model.workers.is_empty() {
                anyhow::bail!("Enabled model '{}' must declare at least one worker", name);
            }
        }

        if self.enabled_models().next().is_none() {
            tracing::warn!("No enabled models in configuration, every request will be rejected");
        }

        Ok(())
    }

    /// Models with `enable = true`, in name order
    pub fn enabled_models(&self) -> impl Iterator<Item = (&String, &ModelConfig)> {
        self.models.iter().filter(|(_, model)| model.enable)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// How workers are hosted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// One OS process per worker, framed messages over stdin/stdout
    #[default]
    Process,
    /// Workers run as tasks inside the serving process
    InProcess,
}

impl FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "process" => Ok(Self::Process),
            "in_process" => Ok(Self::InProcess),
            other => anyhow::bail!(
                "Invalid transport '{}', expected 'process' or 'in_process'",
                other
            ),
        }
    }
}

/// Configuration for one served model
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ModelConfig {
    #[serde(default)]
    pub enable: bool,

    /// One entry per worker; the pool size of the model's group
    #[serde(default = "default_workers")]
    pub workers: Vec<WorkerPlacement>,

    #[serde(default)]
    pub backend: BackendConfig,
}

/// Devices a single worker is pinned to
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct WorkerPlacement {
    #[serde(default)]
    pub device_id: Vec<u32>,
}

/// Backend selection and its settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    Echo(EchoConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Echo(EchoConfig::default())
    }
}

/// Settings of the echo backend
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct EchoConfig {
    /// Prepended to every reply
    pub prefix: String,
    /// Pause between streamed fragments
    pub fragment_delay_ms: u64,
    /// Requests containing this text fail inside the backend
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail_marker: Option<String>,
}

// Default functions
fn default_http_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8081
}
fn default_queue_size() -> usize {
    20
}
fn default_result_buffer() -> usize {
    1024
}
fn default_shutdown_grace() -> u64 {
    10
}
fn default_workers() -> Vec<WorkerPlacement> {
    vec![WorkerPlacement { device_id: vec![0] }]
}
