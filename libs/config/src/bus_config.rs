//! Bus configuration
//!
//! Loaded from an optional TOML file with `BUS_`-prefixed environment
//! overrides layered on top:
//!
//! ```toml
//! answer_timeout_ms = 15000
//! stream_capacity = 1000
//! socket_dir = "$XDG_RUNTIME_DIR/bus"
//! ```
//!
//! `BUS_ANSWER_TIMEOUT_MS=5000` overrides the file. Missing keys take the
//! values in [`crate::defaults`].

use crate::defaults::{correlation, queues, supervision, workers, ENV_PREFIX, LOG_LEVEL};
use crate::error::{ConfigError, Result};
use config_crate::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Room left in a frame for envelope fields around an unchunked result
const ENVELOPE_HEADROOM: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub answer_timeout_ms: u64,
    pub poll_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub poll_put_timeout_ms: u64,
    pub lock_timeout_ms: u64,
    pub shared_state_lock_timeout_ms: u64,
    pub chunk_threshold: usize,
    pub stream_capacity: usize,
    pub worker_recv_timeout_ms: u64,
    pub max_consecutive_errors: u32,
    pub error_backoff_ms: u64,
    pub sweep_every: u64,
    pub sweep_batch: usize,
    pub thread_join_timeout_ms: u64,
    pub process_join_timeout_ms: u64,
    pub terminate_join_timeout_ms: u64,
    pub kill_join_timeout_ms: u64,
    pub cooperative_exit_wait_ms: u64,
    pub child_connect_timeout_ms: u64,
    pub max_frame_size: usize,
    /// Directory for worker sockets; system temp dir when unset
    pub socket_dir: Option<PathBuf>,
    /// Program spawned for process components; current executable when unset
    pub worker_program: Option<PathBuf>,
    pub log_level: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            answer_timeout_ms: correlation::ANSWER_TIMEOUT_MS,
            poll_timeout_ms: correlation::POLL_TIMEOUT_MS,
            poll_interval_ms: correlation::POLL_INTERVAL_MS,
            poll_put_timeout_ms: correlation::POLL_PUT_TIMEOUT_MS,
            lock_timeout_ms: correlation::LOCK_TIMEOUT_MS,
            shared_state_lock_timeout_ms: correlation::SHARED_STATE_LOCK_TIMEOUT_MS,
            chunk_threshold: queues::CHUNK_THRESHOLD,
            stream_capacity: queues::STREAM_CAPACITY,
            worker_recv_timeout_ms: workers::RECV_TIMEOUT_MS,
            max_consecutive_errors: workers::MAX_CONSECUTIVE_ERRORS,
            error_backoff_ms: workers::ERROR_BACKOFF_MS,
            sweep_every: correlation::SWEEP_EVERY,
            sweep_batch: correlation::SWEEP_BATCH,
            thread_join_timeout_ms: supervision::THREAD_JOIN_TIMEOUT_MS,
            process_join_timeout_ms: supervision::PROCESS_JOIN_TIMEOUT_MS,
            terminate_join_timeout_ms: supervision::TERMINATE_JOIN_TIMEOUT_MS,
            kill_join_timeout_ms: supervision::KILL_JOIN_TIMEOUT_MS,
            cooperative_exit_wait_ms: supervision::COOPERATIVE_EXIT_WAIT_MS,
            child_connect_timeout_ms: supervision::CHILD_CONNECT_TIMEOUT_MS,
            max_frame_size: queues::MAX_FRAME_SIZE,
            socket_dir: None,
            worker_program: None,
            log_level: LOG_LEVEL.to_string(),
        }
    }
}

impl BusConfig {
    /// Load from an optional TOML file plus `BUS_*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            info!("Loading bus config: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }
        Self::finish(builder)
    }

    /// Load from TOML text plus `BUS_*` environment overrides
    pub fn load_from_str(toml_text: &str) -> Result<Self> {
        let builder = Config::builder().add_source(File::from_str(toml_text, FileFormat::Toml));
        Self::finish(builder)
    }

    fn finish(
        builder: config_crate::ConfigBuilder<config_crate::builder::DefaultState>,
    ) -> Result<Self> {
        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .try_parsing(true),
            )
            .build()?;

        let mut bus_config: BusConfig = config.try_deserialize()?;
        bus_config.expand_paths()?;
        bus_config.validate()?;
        debug!(?bus_config, "Bus configuration loaded");
        Ok(bus_config)
    }

    /// Expand `~` and environment variables in path settings
    pub fn expand_paths(&mut self) -> Result<()> {
        if let Some(dir) = &self.socket_dir {
            self.socket_dir = Some(expand("socket_dir", dir)?);
        }
        if let Some(program) = &self.worker_program {
            self.worker_program = Some(expand("worker_program", program)?);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let timeouts = [
            ("answer_timeout_ms", self.answer_timeout_ms),
            ("poll_timeout_ms", self.poll_timeout_ms),
            ("poll_interval_ms", self.poll_interval_ms),
            ("poll_put_timeout_ms", self.poll_put_timeout_ms),
            ("lock_timeout_ms", self.lock_timeout_ms),
            ("shared_state_lock_timeout_ms", self.shared_state_lock_timeout_ms),
            ("worker_recv_timeout_ms", self.worker_recv_timeout_ms),
            ("thread_join_timeout_ms", self.thread_join_timeout_ms),
            ("process_join_timeout_ms", self.process_join_timeout_ms),
            ("terminate_join_timeout_ms", self.terminate_join_timeout_ms),
            ("kill_join_timeout_ms", self.kill_join_timeout_ms),
            ("child_connect_timeout_ms", self.child_connect_timeout_ms),
        ];
        for (key, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::invalid(key, "must be greater than zero"));
            }
        }

        let sizes = [
            ("chunk_threshold", self.chunk_threshold),
            ("stream_capacity", self.stream_capacity),
            ("max_frame_size", self.max_frame_size),
            ("sweep_batch", self.sweep_batch),
        ];
        for (key, value) in sizes {
            if value == 0 {
                return Err(ConfigError::invalid(key, "must be greater than zero"));
            }
        }
        if self.sweep_every == 0 {
            return Err(ConfigError::invalid("sweep_every", "must be greater than zero"));
        }
        if self.max_consecutive_errors == 0 {
            return Err(ConfigError::invalid(
                "max_consecutive_errors",
                "must be greater than zero",
            ));
        }

        if self.chunk_threshold.saturating_add(ENVELOPE_HEADROOM) > self.max_frame_size {
            return Err(ConfigError::invalid(
                "chunk_threshold",
                format!(
                    "{} does not fit in max_frame_size {}",
                    self.chunk_threshold, self.max_frame_size
                ),
            ));
        }

        if self.poll_interval_ms > self.poll_timeout_ms
            || self.poll_interval_ms > self.answer_timeout_ms
        {
            return Err(ConfigError::invalid(
                "poll_interval_ms",
                "must not exceed poll_timeout_ms or answer_timeout_ms",
            ));
        }

        if self.log_level.trim().is_empty() {
            return Err(ConfigError::invalid("log_level", "must not be empty"));
        }
        Ok(())
    }

    /// Render as TOML, for printing the effective configuration
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn answer_timeout(&self) -> Duration {
        Duration::from_millis(self.answer_timeout_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_put_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_put_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn shared_state_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.shared_state_lock_timeout_ms)
    }

    pub fn worker_recv_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_recv_timeout_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn thread_join_timeout(&self) -> Duration {
        Duration::from_millis(self.thread_join_timeout_ms)
    }

    pub fn process_join_timeout(&self) -> Duration {
        Duration::from_millis(self.process_join_timeout_ms)
    }

    pub fn terminate_join_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_join_timeout_ms)
    }

    pub fn kill_join_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_join_timeout_ms)
    }

    pub fn cooperative_exit_wait(&self) -> Duration {
        Duration::from_millis(self.cooperative_exit_wait_ms)
    }

    pub fn child_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.child_connect_timeout_ms)
    }

    /// Age after which an unclaimed partial result is abandoned
    pub fn result_max_age(&self) -> Duration {
        self.answer_timeout() * 2
    }

    /// Socket directory, falling back to the system temp dir
    pub fn socket_dir(&self) -> PathBuf {
        self.socket_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

fn expand(key: &'static str, path: &Path) -> Result<PathBuf> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(&raw).map_err(|e| ConfigError::Expand {
        key,
        message: e.to_string(),
    })?;
    Ok(PathBuf::from(expanded.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = BusConfig::default();
        config.validate().unwrap();
        assert_eq!(config.answer_timeout(), Duration::from_secs(15));
        assert_eq!(config.poll_timeout(), Duration::from_secs(1));
        assert_eq!(config.lock_timeout(), Duration::from_secs(2));
        assert_eq!(config.chunk_threshold, 1024 * 1024);
        assert_eq!(config.stream_capacity, 1000);
        assert_eq!(config.result_max_age(), Duration::from_secs(30));
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("bus.toml");
        fs::write(
            &config_path,
            r#"
answer_timeout_ms = 5000
stream_capacity = 64
socket_dir = "/tmp/bus-test"
log_level = "debug"
"#,
        )
        .unwrap();

        let config = BusConfig::load(Some(&config_path)).unwrap();
        assert_eq!(config.answer_timeout_ms, 5000);
        assert_eq!(config.stream_capacity, 64);
        assert_eq!(config.socket_dir(), PathBuf::from("/tmp/bus-test"));
        assert_eq!(config.log_level, "debug");
        // untouched keys keep their defaults
        assert_eq!(config.poll_timeout_ms, correlation::POLL_TIMEOUT_MS);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        let err = BusConfig::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let zero_capacity = BusConfig {
            stream_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(
            zero_capacity.validate(),
            Err(ConfigError::Invalid { key: "stream_capacity", .. })
        ));

        let oversized_chunks = BusConfig {
            chunk_threshold: 8 * 1024 * 1024,
            max_frame_size: 4 * 1024 * 1024,
            ..Default::default()
        };
        assert!(matches!(
            oversized_chunks.validate(),
            Err(ConfigError::Invalid { key: "chunk_threshold", .. })
        ));

        let slow_tick = BusConfig {
            poll_interval_ms: 5000,
            ..Default::default()
        };
        assert!(matches!(
            slow_tick.validate(),
            Err(ConfigError::Invalid { key: "poll_interval_ms", .. })
        ));

        let no_timeout = BusConfig {
            kill_join_timeout_ms: 0,
            ..Default::default()
        };
        assert!(no_timeout.validate().is_err());
    }

    #[test]
    fn test_load_from_str_rejects_invalid() {
        let err = BusConfig::load_from_str("sweep_batch = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "sweep_batch", .. }));
    }

    #[test]
    fn test_toml_render_reloads() {
        let config = BusConfig {
            poll_timeout_ms: 250,
            ..Default::default()
        };
        let text = config.to_toml().unwrap();
        assert_eq!(BusConfig::load_from_str(&text).unwrap(), config);
    }
}
