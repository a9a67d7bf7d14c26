//! Configuration model loaded from external sources.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::codec::CodecError;
use crate::domain::request::{DType, TensorPayload};

/// Environment prefix for overrides, e.g. `INFERQ_QUEUE__BATCH_SIZE=16`.
pub const ENV_PREFIX: &str = "INFERQ";

/// File consulted when `CONFIG_PATH` is not set.
pub const DEFAULT_CONFIG_PATH: &str = "config/settings.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid broker address: {0}")]
    BrokerUrl(#[from] url::ParseError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
/// Top-level settings handed to every component constructor.
pub struct Settings {
    pub broker: BrokerSettings,
    pub payload: PayloadSettings,
    pub queue: QueueSettings,
    pub worker: WorkerSettings,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
    pub pool_size: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            db: 0,
            pool_size: 8,
        }
    }
}

impl BrokerSettings {
    /// Builds a `redis://` connection URL with the password percent-encoded.
    pub fn url(&self) -> Result<Url, ConfigError> {
        let mut url = Url::parse(&format!("redis://{}:{}", self.host, self.port))?;
        if let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) {
            url.set_password(Some(password))
                .map_err(|_| ConfigError::Invalid("broker url cannot carry a password".into()))?;
        }
        url.set_path(&format!("/{}", self.db));
        Ok(url)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
/// Shape and dtype of the single item a worker batches.
pub struct PayloadSettings {
    pub shape: Vec<usize>,
    pub dtype: DType,
}

impl Default for PayloadSettings {
    fn default() -> Self {
        Self {
            shape: vec![224, 224, 3],
            dtype: DType::Float32,
        }
    }
}

impl PayloadSettings {
    /// Checks that `payload` is what workers for this descriptor accept.
    ///
    /// Numeric payloads must match the shape exactly. For `utf8` the single
    /// dimension is the maximum byte length.
    pub fn check(&self, payload: &TensorPayload) -> Result<(), CodecError> {
        if payload.dtype() != self.dtype {
            return Err(CodecError::DTypeMismatch {
                expected: self.dtype,
                actual: payload.dtype(),
            });
        }
        let fits = match self.dtype {
            DType::Utf8 => match (payload.shape(), self.shape.first()) {
                ([len], Some(max)) => len <= max,
                _ => false,
            },
            _ => payload.shape() == self.shape.as_slice(),
        };
        if !fits {
            return Err(CodecError::ShapeMismatch {
                expected: self.shape.clone(),
                actual: payload.shape().to_vec(),
            });
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub name: String,
    pub result_prefix: String,
    pub batch_size: usize,
    pub server_sleep_ms: u64,
    pub client_sleep_ms: u64,
    pub client_timeout_ms: u64,
    pub result_ttl_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            name: "image_queue".to_string(),
            result_prefix: "inference_result".to_string(),
            batch_size: 32,
            server_sleep_ms: 250,
            client_sleep_ms: 250,
            client_timeout_ms: 5_000,
            result_ttl_secs: 30,
        }
    }
}

impl QueueSettings {
    pub fn server_sleep(&self) -> Duration {
        Duration::from_millis(self.server_sleep_ms)
    }

    pub fn client_sleep(&self) -> Duration {
        Duration::from_millis(self.client_sleep_ms)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Name of the inference backend, see [`crate::processing::backend::build_backend`].
    pub backend: String,
    pub startup_retries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub write_retries: u32,
    pub heartbeat_ttl_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            backend: "normalize".to_string(),
            startup_retries: 5,
            retry_base_ms: 100,
            retry_max_ms: 5_000,
            write_retries: 3,
            heartbeat_ttl_secs: 30,
        }
    }
}

impl WorkerSettings {
    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_secs)
    }
}

impl Settings {
    /// Loads settings from an optional YAML file and `INFERQ_*` environment
    /// variables, the latter taking precedence.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let settings: Settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("payload.shape")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Rejects settings the worker cannot run with and warns about risky ones.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.batch_size == 0 {
            return Err(ConfigError::Invalid("queue.batch_size must be positive".into()));
        }
        if self.queue.name.is_empty() || self.queue.result_prefix.is_empty() {
            return Err(ConfigError::Invalid(
                "queue.name and queue.result_prefix must not be empty".into(),
            ));
        }
        if self.queue.name == self.queue.result_prefix {
            return Err(ConfigError::Invalid(
                "queue.name and queue.result_prefix must differ".into(),
            ));
        }
        if self.payload.shape.is_empty() || self.payload.shape.contains(&0) {
            return Err(ConfigError::Invalid(format!(
                "payload.shape must be non-empty with positive dimensions, got {:?}",
                self.payload.shape
            )));
        }
        if self.payload.dtype == DType::Utf8 && self.payload.shape.len() != 1 {
            return Err(ConfigError::Invalid(
                "utf8 payloads must have a one-dimensional shape".into(),
            ));
        }
        if self.queue.result_ttl() < self.queue.client_timeout() * 2 {
            log::warn!(
                "Result TTL {:?} is shorter than twice the client timeout {:?}; slow clients may miss results",
                self.queue.result_ttl(),
                self.queue.client_timeout()
            );
        }
        Ok(())
    }
}
