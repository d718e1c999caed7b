//! Runtime configuration, built and validated before a core or dispatcher is spawned.

use thiserror::Error;

/// Errors returned by [`ConfigBuilder::validate`].
#[derive(Clone, Eq, PartialEq, Debug, Error)]
pub enum ConfigError {
    #[error("request_timeout_ms must be > 0")]
    ZeroRequestTimeout,
    #[error("keep_alive_interval_ms must be > 0")]
    ZeroKeepAliveInterval,
    #[error("compact_interval_ms must be > 0")]
    ZeroCompactInterval,
    #[error("register_backoff_max_ms ({max}) must be >= register_backoff_initial_ms ({initial})")]
    BackoffMaxBelowInitial { initial: u64, max: u64 },
}

/// Tunables shared by the Apply Engine, Compactor, and Client Dispatcher.
///
/// Built via [`Config::build`], which returns a [`ConfigBuilder`] pre-filled
/// with sensible defaults; call `.validate()` to obtain an immutable,
/// checked `Config`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub cluster_name: String,
    pub request_timeout_ms: u64,
    pub keep_alive_interval_ms: u64,
    pub register_backoff_initial_ms: u64,
    pub register_backoff_max_ms: u64,
    pub compact_interval_ms: u64,
}

impl Config {
    pub fn build(cluster_name: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name: cluster_name.into(),
            request_timeout_ms: 10_000,
            keep_alive_interval_ms: 1_000,
            register_backoff_initial_ms: 100,
            register_backoff_max_ms: 5_000,
            compact_interval_ms: 10_000,
        }
    }
}

/// A builder pre-populated with default tunables.
#[derive(Clone, Debug)]
pub struct ConfigBuilder {
    cluster_name: String,
    request_timeout_ms: u64,
    keep_alive_interval_ms: u64,
    register_backoff_initial_ms: u64,
    register_backoff_max_ms: u64,
    compact_interval_ms: u64,
}

impl ConfigBuilder {
    pub fn request_timeout_ms(mut self, v: u64) -> Self {
        self.request_timeout_ms = v;
        self
    }

    pub fn keep_alive_interval_ms(mut self, v: u64) -> Self {
        self.keep_alive_interval_ms = v;
        self
    }

    pub fn register_backoff_initial_ms(mut self, v: u64) -> Self {
        self.register_backoff_initial_ms = v;
        self
    }

    pub fn register_backoff_max_ms(mut self, v: u64) -> Self {
        self.register_backoff_max_ms = v;
        self
    }

    pub fn compact_interval_ms(mut self, v: u64) -> Self {
        self.compact_interval_ms = v;
        self
    }

    pub fn validate(self) -> Result<Config, ConfigError> {
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::ZeroRequestTimeout);
        }
        if self.keep_alive_interval_ms == 0 {
            return Err(ConfigError::ZeroKeepAliveInterval);
        }
        if self.compact_interval_ms == 0 {
            return Err(ConfigError::ZeroCompactInterval);
        }
        if self.register_backoff_max_ms < self.register_backoff_initial_ms {
            return Err(ConfigError::BackoffMaxBelowInitial {
                initial: self.register_backoff_initial_ms,
                max: self.register_backoff_max_ms,
            });
        }
        Ok(Config {
            cluster_name: self.cluster_name,
            request_timeout_ms: self.request_timeout_ms,
            keep_alive_interval_ms: self.keep_alive_interval_ms,
            register_backoff_initial_ms: self.register_backoff_initial_ms,
            register_backoff_max_ms: self.register_backoff_max_ms,
            compact_interval_ms: self.compact_interval_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = Config::build("test").validate().expect("defaults must validate");
        assert_eq!(cfg.request_timeout_ms, 10_000);
        assert_eq!(cfg.keep_alive_interval_ms, 1_000);
        assert_eq!(cfg.register_backoff_initial_ms, 100);
        assert_eq!(cfg.register_backoff_max_ms, 5_000);
        assert_eq!(cfg.compact_interval_ms, 10_000);
    }

    #[test]
    fn rejects_backoff_max_below_initial() {
        let err = Config::build("test")
            .register_backoff_initial_ms(1_000)
            .register_backoff_max_ms(500)
            .validate()
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::BackoffMaxBelowInitial {
                initial: 1_000,
                max: 500
            }
        );
    }

    #[test]
    fn rejects_zero_timeout() {
        let err = Config::build("test").request_timeout_ms(0).validate().unwrap_err();
        assert_eq!(err, ConfigError::ZeroRequestTimeout);
    }
}
