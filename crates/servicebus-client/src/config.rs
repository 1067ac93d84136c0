//! Client configuration and connection string parsing.
//!
//! [`ClientConfig`] deserializes from the camelCase keys used by scripts
//! (`connectionString`, `timeout`, `insecureSkipVerify`) as well as snake_case
//! keys. [`ClientConfig::load`] layers an optional file and `SERVICEBUS__`
//! prefixed environment variables (snake_case, `__` as the nesting separator),
//! e.g. `SERVICEBUS__RETRY__MAX_ATTEMPTS=5`.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Timeout applied when the configuration leaves it absent or zero
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Environment variable prefix read by [`ClientConfig::load`]
pub const ENV_PREFIX: &str = "SERVICEBUS";

/// Configuration for a client connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Opaque credential and endpoint descriptor
    #[serde(alias = "connectionString")]
    pub connection_string: String,

    /// Operation timeout in milliseconds; zero means [`DEFAULT_TIMEOUT`]
    #[serde(default, alias = "timeout", alias = "timeoutMs")]
    pub timeout_ms: u64,

    /// Disable certificate validation. Only for non-production endpoints.
    #[serde(default, alias = "insecureSkipVerify")]
    pub insecure_skip_verify: bool,

    /// Retry behaviour for transient transport failures
    #[serde(default)]
    pub retry: RetryConfig,
}

impl ClientConfig {
    /// Create configuration with defaults for everything but the connection string
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            timeout_ms: 0,
            insecure_skip_verify: false,
            retry: RetryConfig::default(),
        }
    }

    /// Set the operation timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    /// Disable certificate validation
    pub fn with_insecure_skip_verify(mut self, skip: bool) -> Self {
        self.insecure_skip_verify = skip;
        self
    }

    /// Replace the retry configuration
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Effective operation timeout
    pub fn timeout(&self) -> Duration {
        if self.timeout_ms == 0 {
            DEFAULT_TIMEOUT
        } else {
            Duration::from_millis(self.timeout_ms)
        }
    }

    /// Load configuration from an optional file and the environment.
    ///
    /// Environment variables override file values.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let client_config: ClientConfig = config.try_deserialize()?;
        client_config.validate()?;
        Ok(client_config)
    }

    /// Check the configuration without touching the network
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.connection_string.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "connection_string".to_string(),
            });
        }

        self.connection_string.parse::<ConnectionString>()?;
        self.retry.validate()
    }
}

/// Retry settings for transient transport failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt
    #[serde(default = "RetryConfig::default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "RetryConfig::default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "RetryConfig::default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "RetryConfig::default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "RetryConfig::default_use_jitter")]
    pub use_jitter: bool,
}

impl RetryConfig {
    fn default_max_attempts() -> u32 {
        3
    }

    fn default_initial_delay_ms() -> u64 {
        100
    }

    fn default_max_delay_ms() -> u64 {
        5_000
    }

    fn default_backoff_multiplier() -> f64 {
        2.0
    }

    fn default_use_jitter() -> bool {
        true
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigurationError> {
        if self.backoff_multiplier < 1.0 {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "retry.backoff_multiplier must be at least 1.0, got {}",
                    self.backoff_multiplier
                ),
            });
        }

        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ConfigurationError::Invalid {
                message: "retry.initial_delay_ms exceeds retry.max_delay_ms".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            initial_delay_ms: Self::default_initial_delay_ms(),
            max_delay_ms: Self::default_max_delay_ms(),
            backoff_multiplier: Self::default_backoff_multiplier(),
            use_jitter: Self::default_use_jitter(),
        }
    }
}

// ============================================================================
// Connection String
// ============================================================================

/// Parsed `Endpoint=sb://...;SharedAccessKeyName=...;SharedAccessKey=...` string
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    endpoint: Url,
    shared_access_key_name: Option<String>,
    shared_access_key: Option<String>,
    shared_access_signature: Option<String>,
    entity_path: Option<String>,
    use_development_emulator: bool,
}

impl ConnectionString {
    /// Broker endpoint
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Host name of the endpoint
    pub fn host(&self) -> &str {
        self.endpoint.host_str().unwrap_or_default()
    }

    /// Name of the shared access policy, if key based
    pub fn shared_access_key_name(&self) -> Option<&str> {
        self.shared_access_key_name.as_deref()
    }

    /// Shared access key, if key based
    pub fn shared_access_key(&self) -> Option<&str> {
        self.shared_access_key.as_deref()
    }

    /// Pre-issued shared access signature, if signature based
    pub fn shared_access_signature(&self) -> Option<&str> {
        self.shared_access_signature.as_deref()
    }

    /// Entity the credentials are scoped to
    pub fn entity_path(&self) -> Option<&str> {
        self.entity_path.as_deref()
    }

    /// Whether the string targets the local development emulator
    pub fn use_development_emulator(&self) -> bool {
        self.use_development_emulator
    }
}

impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionString")
            .field("endpoint", &self.endpoint.as_str())
            .field("shared_access_key_name", &self.shared_access_key_name)
            .field(
                "shared_access_key",
                &self.shared_access_key.as_ref().map(|_| "<REDACTED>"),
            )
            .field(
                "shared_access_signature",
                &self.shared_access_signature.as_ref().map(|_| "<REDACTED>"),
            )
            .field("entity_path", &self.entity_path)
            .field("use_development_emulator", &self.use_development_emulator)
            .finish()
    }
}

impl FromStr for ConnectionString {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut endpoint = None;
        let mut shared_access_key_name = None;
        let mut shared_access_key = None;
        let mut shared_access_signature = None;
        let mut entity_path = None;
        let mut use_development_emulator = false;

        for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            // Keys may be base64 and contain '='; split on the first one only
            let (key, value) = part.split_once('=').ok_or_else(|| ConfigurationError::Parsing {
                message: "connection string contains a segment that is not key=value".to_string(),
            })?;
            let value = value.trim();

            match key.trim().to_ascii_lowercase().as_str() {
                "endpoint" => {
                    let url = Url::parse(value).map_err(|e| ConfigurationError::Parsing {
                        message: format!("invalid Endpoint: {}", e),
                    })?;
                    if url.host_str().map_or(true, str::is_empty) {
                        return Err(ConfigurationError::Invalid {
                            message: "Endpoint has no host".to_string(),
                        });
                    }
                    endpoint = Some(url);
                }
                "sharedaccesskeyname" => shared_access_key_name = Some(value.to_string()),
                "sharedaccesskey" => shared_access_key = Some(value.to_string()),
                "sharedaccesssignature" => shared_access_signature = Some(value.to_string()),
                "entitypath" => entity_path = Some(value.to_string()),
                "usedevelopmentemulator" => {
                    use_development_emulator = value.eq_ignore_ascii_case("true")
                }
                // Unknown keys are tolerated for forward compatibility
                _ => {}
            }
        }

        let endpoint = endpoint.ok_or_else(|| ConfigurationError::Missing {
            key: "Endpoint".to_string(),
        })?;

        let has_key = shared_access_key_name.is_some() && shared_access_key.is_some();
        if !has_key && shared_access_signature.is_none() {
            return Err(ConfigurationError::Missing {
                key: "SharedAccessKeyName/SharedAccessKey or SharedAccessSignature".to_string(),
            });
        }

        Ok(Self {
            endpoint,
            shared_access_key_name,
            shared_access_key,
            shared_access_signature,
            entity_path,
            use_development_emulator,
        })
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
