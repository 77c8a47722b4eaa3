//! Worker configuration loading via `ortho-config`.

use std::ffi::OsString;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Worker-level configuration merged from defaults, configuration files,
/// and `KILN_*` environment variables. Provider-specific keys live in
/// their own flat map (see `ProviderConfig`).
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "KILN")]
pub struct WorkerConfig {
    /// AMQP broker URI.
    #[ortho_config(default = "amqp://127.0.0.1:5672/%2f".to_owned())]
    pub amqp_uri: String,
    /// Build queue consumed by the pool.
    #[ortho_config(default = "builds.test".to_owned())]
    pub queue_name: String,
    /// Number of processors run against the queue.
    #[ortho_config(default = 2)]
    pub pool_size: u16,
    /// Registry name of the VM provider backend.
    #[ortho_config(default = "boxcar".to_owned())]
    pub provider: String,
    /// Endpoint of the build-script generator service. Required.
    pub script_endpoint: String,
    /// Hostname advertised in job log banners; the banner is omitted when
    /// unset.
    pub hostname: Option<String>,
    /// Flush cadence for log writers, in milliseconds.
    #[ortho_config(default = 1_000)]
    pub log_flush_timeout_ms: u64,
    /// Byte cap for one job's log.
    #[ortho_config(default = 4_000_000)]
    pub max_log_length: u64,
    /// Default hard time limit per job, in seconds.
    #[ortho_config(default = 3_000)]
    pub hard_timeout_secs: u64,
    /// Default log-silence window per job, in seconds.
    #[ortho_config(default = 600)]
    pub log_silence_timeout_secs: u64,
}

impl WorkerConfig {
    /// Loads configuration from defaults, configuration files, and
    /// environment variables, ignoring CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the loader fails to merge
    /// sources.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("kiln")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is
    /// empty and [`ConfigError::Invalid`] for out-of-range values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.amqp_uri.trim().is_empty() {
            return Err(ConfigError::MissingField(String::from("KILN_AMQP_URI")));
        }
        if self.queue_name.trim().is_empty() {
            return Err(ConfigError::MissingField(String::from("KILN_QUEUE_NAME")));
        }
        if self.provider.trim().is_empty() {
            return Err(ConfigError::MissingField(String::from("KILN_PROVIDER")));
        }
        if self.script_endpoint.trim().is_empty() {
            return Err(ConfigError::MissingField(String::from(
                "KILN_SCRIPT_ENDPOINT",
            )));
        }
        if self.pool_size == 0 {
            return Err(ConfigError::Invalid {
                field: String::from("KILN_POOL_SIZE"),
                message: String::from("must be at least 1"),
            });
        }
        Ok(())
    }

    /// Flush cadence for log writers.
    #[must_use]
    pub const fn log_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.log_flush_timeout_ms)
    }

    /// Default hard time limit per job.
    #[must_use]
    pub const fn hard_timeout(&self) -> Duration {
        Duration::from_secs(self.hard_timeout_secs)
    }

    /// Default log-silence window per job.
    #[must_use]
    pub const fn log_silence_timeout(&self) -> Duration {
        Duration::from_secs(self.log_silence_timeout_secs)
    }

    /// Environment prefix for the configured provider's flat key map, for
    /// example `KILN_BOXCAR_` for the `boxcar` backend.
    #[must_use]
    pub fn provider_env_prefix(&self) -> String {
        let name: String = self
            .provider
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() {
                    ch.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("KILN_{name}_")
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a field value is outside its allowed range.
    #[error("invalid value for {field}: {message}")]
    Invalid {
        /// Field that failed validation.
        field: String,
        /// Why the value was rejected.
        message: String,
    },
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> WorkerConfig {
        WorkerConfig {
            amqp_uri: String::from("amqp://127.0.0.1:5672/%2f"),
            queue_name: String::from("builds.test"),
            pool_size: 2,
            provider: String::from("boxcar"),
            script_endpoint: String::from("http://build-scripts.test/script"),
            hostname: None,
            log_flush_timeout_ms: 1_000,
            max_log_length: 4_000_000,
            hard_timeout_secs: 3_000,
            log_silence_timeout_secs: 600,
        }
    }

    #[test]
    fn a_complete_config_validates() {
        valid_config()
            .validate()
            .unwrap_or_else(|err| panic!("config should validate: {err}"));
    }

    #[test]
    fn blank_script_endpoint_is_rejected() {
        let mut config = valid_config();
        config.script_endpoint = String::from("  ");
        let err = config.validate().expect_err("blank endpoint");
        assert!(
            matches!(err, ConfigError::MissingField(ref field) if field == "KILN_SCRIPT_ENDPOINT")
        );
    }

    #[test]
    fn zero_pool_size_is_rejected() {
        let mut config = valid_config();
        config.pool_size = 0;
        let err = config.validate().expect_err("zero pool");
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "KILN_POOL_SIZE"));
    }

    #[test]
    fn timeouts_convert_to_durations() {
        let config = valid_config();
        assert_eq!(config.log_flush_timeout(), Duration::from_secs(1));
        assert_eq!(config.hard_timeout(), Duration::from_secs(3_000));
        assert_eq!(config.log_silence_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn provider_env_prefix_uppercases_the_backend_name() {
        let mut config = valid_config();
        assert_eq!(config.provider_env_prefix(), "KILN_BOXCAR_");
        config.provider = String::from("fake");
        assert_eq!(config.provider_env_prefix(), "KILN_FAKE_");
    }
}
