//! PDP configuration (`pdp.json`).
//!
//! ```json
//! {
//!   "algorithm": "DENY_UNLESS_PERMIT",
//!   "variables": { "tenant": "acme" },
//!   "attributeTimeoutMs": 500
//! }
//! ```
//!
//! Every field is optional. A missing file in a policy directory means
//! the defaults.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use sieve_interchange::CombiningAlgorithmId;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info};

use crate::stream::once_then_pending;

/// File name looked up when a directory is given.
pub const CONFIG_FILE_NAME: &str = "pdp.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse PDP configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("combining algorithm {0} cannot be used at the top level")]
    UnsupportedTopLevelAlgorithm(CombiningAlgorithmId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PdpConfiguration {
    /// Combines the documents retrieved for a subscription.
    #[serde(default = "default_algorithm")]
    pub algorithm: CombiningAlgorithmId,
    /// Visible to every policy as identifiers; subscription elements shadow them.
    #[serde(default)]
    pub variables: serde_json::Map<String, serde_json::Value>,
    /// Deadline for an attribute finder's first value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute_timeout_ms: Option<u64>,
}

fn default_algorithm() -> CombiningAlgorithmId {
    CombiningAlgorithmId::DenyOverrides
}

impl Default for PdpConfiguration {
    fn default() -> Self {
        PdpConfiguration {
            algorithm: default_algorithm(),
            variables: serde_json::Map::new(),
            attribute_timeout_ms: None,
        }
    }
}

impl PdpConfiguration {
    pub fn with_algorithm(mut self, algorithm: CombiningAlgorithmId) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: PdpConfiguration = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `pdp.json` file, or from the `pdp.json` inside a
    /// directory. A directory without one yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = if path.is_dir() {
            let candidate = path.join(CONFIG_FILE_NAME);
            if !candidate.exists() {
                info!(dir = %path.display(), "no {} found, using default configuration", CONFIG_FILE_NAME);
                return Ok(Self::default());
            }
            candidate
        } else {
            path.to_path_buf()
        };
        let text = std::fs::read_to_string(&file).map_err(|source| ConfigError::Io {
            path: file.clone(),
            source,
        })?;
        let config = Self::from_json_str(&text)?;
        debug!(file = %file.display(), algorithm = %config.algorithm, "loaded PDP configuration");
        Ok(config)
    }

    /// Retrieval order is unspecified, so first-applicable has no meaning
    /// at the top level.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.algorithm == CombiningAlgorithmId::FirstApplicable {
            return Err(ConfigError::UnsupportedTopLevelAlgorithm(self.algorithm));
        }
        Ok(())
    }

    pub fn attribute_timeout(&self) -> Option<Duration> {
        self.attribute_timeout_ms.map(Duration::from_millis)
    }
}

/// Streams the configuration in force. A new item rebuilds every open
/// decision stream.
pub trait PdpConfigurationProvider: Send + Sync {
    fn configurations(&self) -> BoxStream<'static, PdpConfiguration>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticConfigurationProvider {
    config: PdpConfiguration,
}

impl StaticConfigurationProvider {
    pub fn new(config: PdpConfiguration) -> Self {
        StaticConfigurationProvider { config }
    }
}

impl PdpConfigurationProvider for StaticConfigurationProvider {
    fn configurations(&self) -> BoxStream<'static, PdpConfiguration> {
        once_then_pending(self.config.clone())
    }
}

/// A configuration the host can replace at runtime.
#[derive(Debug)]
pub struct WatchConfigurationProvider {
    sender: Mutex<watch::Sender<PdpConfiguration>>,
}

impl WatchConfigurationProvider {
    pub fn new(initial: PdpConfiguration) -> Self {
        let (sender, _) = watch::channel(initial);
        WatchConfigurationProvider {
            sender: Mutex::new(sender),
        }
    }

    /// Publish `config` after validating it; an invalid one is rejected
    /// and the current configuration stays in force.
    pub fn update(&self, config: PdpConfiguration) -> Result<(), ConfigError> {
        config.validate()?;
        let sender = match self.sender.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        debug!(algorithm = %config.algorithm, "PDP configuration updated");
        sender.send_replace(config);
        Ok(())
    }
}

impl PdpConfigurationProvider for WatchConfigurationProvider {
    fn configurations(&self) -> BoxStream<'static, PdpConfiguration> {
        let sender = match self.sender.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        WatchStream::new(sender.subscribe()).boxed()
    }
}
