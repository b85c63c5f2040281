//! Gateway configuration.
//!
//! Everything here is a deployment tunable. Values load from TOML with every
//! field optional:
//!
//! ```toml
//! [link]
//! command_timeout_ms = 1000
//! liveness_interval_ms = 30000
//!
//! [security]
//! replay_window = 128
//! store_dir = "/var/lib/esp3/secure"
//!
//! [learn]
//! min_learn_dbm = -50
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{
    DEFAULT_COMMAND_TIMEOUT, DEFAULT_LIVENESS_INTERVAL, DEFAULT_LIVENESS_RETRIES,
    DEFAULT_MAX_RESETS, DEFAULT_MIN_LEARN_DBM, DEFAULT_REPLAY_WINDOW, DEFAULT_RESET_SETTLE,
    DEFAULT_RLC_LOOKAHEAD, DEFAULT_RLC_SAVE_DISTANCE, DEFAULT_TEACH_IN_RESPONSE_DEADLINE,
    GatewayError,
};
use crate::crypto::ReplayWindow;

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Command channel and link supervision settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkConfig {
    /// Time to wait for a RESPONSE before failing the command.
    pub command_timeout_ms: u64,
    /// Interval between version probes.
    pub liveness_interval_ms: u64,
    /// Consecutive unanswered probes before a hard reset.
    pub liveness_retries: u32,
    /// Consecutive hard resets before the link is declared dead.
    pub max_resets: u32,
    /// Delay between a hard reset and reopening the transport.
    pub reset_settle_ms: u64,
    /// Also switch the module's smart-ack learn mode when learning starts/stops.
    pub smart_ack_learn: bool,
    /// Capacity of the request and event queues.
    pub queue_depth: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: millis(DEFAULT_COMMAND_TIMEOUT),
            liveness_interval_ms: millis(DEFAULT_LIVENESS_INTERVAL),
            liveness_retries: DEFAULT_LIVENESS_RETRIES,
            max_resets: DEFAULT_MAX_RESETS,
            reset_settle_ms: millis(DEFAULT_RESET_SETTLE),
            smart_ack_learn: false,
            queue_depth: 64,
        }
    }
}

impl LinkConfig {
    /// Command response timeout.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Liveness probe interval.
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    /// Settle time after a hard reset.
    pub fn reset_settle(&self) -> Duration {
        Duration::from_millis(self.reset_settle_ms)
    }
}

/// Secure telegram settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecurityConfig {
    /// Forward distance a rolling counter may jump and still be accepted.
    pub replay_window: u32,
    /// Counter values tried when the counter is not transmitted.
    pub rlc_lookahead: u32,
    /// Counter advance between two saves of a secure context.
    pub rlc_save_distance: u32,
    /// Directory for secure context records. In-memory only when unset.
    pub store_dir: Option<PathBuf>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            replay_window: DEFAULT_REPLAY_WINDOW,
            rlc_lookahead: DEFAULT_RLC_LOOKAHEAD,
            rlc_save_distance: DEFAULT_RLC_SAVE_DISTANCE,
            store_dir: None,
        }
    }
}

impl SecurityConfig {
    /// Replay window built from these settings.
    pub fn window(&self) -> ReplayWindow {
        ReplayWindow::new(self.replay_window, self.rlc_lookahead)
    }
}

/// Learn mode settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LearnConfig {
    /// Weakest signal accepted for implicit teach-in, in dBm.
    pub min_learn_dbm: i16,
    /// Ask the device registry to keep higher-level settings on learn-out.
    pub keep_settings_on_learn_out: bool,
    /// Deadline for sending a bidirectional teach-in response.
    pub teach_in_response_deadline_ms: u64,
}

impl Default for LearnConfig {
    fn default() -> Self {
        Self {
            min_learn_dbm: DEFAULT_MIN_LEARN_DBM,
            keep_settings_on_learn_out: false,
            teach_in_response_deadline_ms: millis(DEFAULT_TEACH_IN_RESPONSE_DEADLINE),
        }
    }
}

impl LearnConfig {
    /// Teach-in response deadline.
    pub fn teach_in_response_deadline(&self) -> Duration {
        Duration::from_millis(self.teach_in_response_deadline_ms)
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    /// Link settings.
    pub link: LinkConfig,
    /// Security settings.
    pub security: SecurityConfig,
    /// Learn settings.
    pub learn: LearnConfig,
}

impl GatewayConfig {
    /// Parse from TOML text and validate.
    pub fn from_toml_str(text: &str) -> Result<Self, GatewayError> {
        let config: Self =
            toml::from_str(text).map_err(|e| GatewayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Start a builder from the defaults.
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::new()
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), GatewayError> {
        let invalid = |msg: &str| Err(GatewayError::Config(msg.to_string()));
        if self.link.command_timeout_ms == 0 {
            return invalid("link.command_timeout_ms must be positive");
        }
        if self.link.liveness_interval_ms == 0 {
            return invalid("link.liveness_interval_ms must be positive");
        }
        if self.link.liveness_retries == 0 {
            return invalid("link.liveness_retries must be at least 1");
        }
        if self.link.queue_depth == 0 {
            return invalid("link.queue_depth must be at least 1");
        }
        if self.security.replay_window == 0 {
            return invalid("security.replay_window must be at least 1");
        }
        if self.security.rlc_lookahead == 0 {
            return invalid("security.rlc_lookahead must be at least 1");
        }
        if self.security.rlc_save_distance >= self.security.window().lookahead() {
            return invalid("security.rlc_save_distance must be below the RLC look-ahead");
        }
        if self.learn.min_learn_dbm > 0 {
            return invalid("learn.min_learn_dbm must not be positive");
        }
        Ok(())
    }
}

/// Builder for [`GatewayConfig`].
#[derive(Debug, Clone, Default)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the command response timeout.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.config.link.command_timeout_ms = millis(timeout);
        self
    }

    /// Set the liveness probe interval.
    pub fn liveness_interval(mut self, interval: Duration) -> Self {
        self.config.link.liveness_interval_ms = millis(interval);
        self
    }

    /// Set the probe misses tolerated before a hard reset.
    pub fn liveness_retries(mut self, retries: u32) -> Self {
        self.config.link.liveness_retries = retries;
        self
    }

    /// Set the hard resets tolerated before giving up.
    pub fn max_resets(mut self, resets: u32) -> Self {
        self.config.link.max_resets = resets;
        self
    }

    /// Set the settle time after a hard reset.
    pub fn reset_settle(mut self, settle: Duration) -> Self {
        self.config.link.reset_settle_ms = millis(settle);
        self
    }

    /// Toggle smart-ack learn mode together with learning.
    pub fn smart_ack_learn(mut self, enabled: bool) -> Self {
        self.config.link.smart_ack_learn = enabled;
        self
    }

    /// Set the replay window size.
    pub fn replay_window(mut self, size: u32) -> Self {
        self.config.security.replay_window = size;
        self
    }

    /// Set the counter look-ahead.
    pub fn rlc_lookahead(mut self, lookahead: u32) -> Self {
        self.config.security.rlc_lookahead = lookahead;
        self
    }

    /// Set the counter advance between saves.
    pub fn rlc_save_distance(mut self, distance: u32) -> Self {
        self.config.security.rlc_save_distance = distance;
        self
    }

    /// Persist secure contexts below `dir`.
    pub fn store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.security.store_dir = Some(dir.into());
        self
    }

    /// Set the minimum implicit teach-in signal strength.
    pub fn min_learn_dbm(mut self, dbm: i16) -> Self {
        self.config.learn.min_learn_dbm = dbm;
        self
    }

    /// Keep higher-level settings on learn-out.
    pub fn keep_settings_on_learn_out(mut self, keep: bool) -> Self {
        self.config.learn.keep_settings_on_learn_out = keep;
        self
    }

    /// Set the bidirectional teach-in response deadline.
    pub fn teach_in_response_deadline(mut self, deadline: Duration) -> Self {
        self.config.learn.teach_in_response_deadline_ms = millis(deadline);
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<GatewayConfig, GatewayError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
