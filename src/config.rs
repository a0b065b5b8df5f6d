use serde::Deserialize;
use tokio::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub actions: ActionConfig,
    #[serde(default)]
    pub console: ConsoleConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    /// Inventory poll cadence.
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
    /// Reconciliation / display-uptime refresh cadence, independent of polling.
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
    /// Max number of engine views kept in the broadcast channel (slow subscribers may lag).
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionConfig {
    /// A running observation's uptime this far below the reboot-time baseline
    /// proves the counter reset.
    #[serde(default = "default_reboot_uptime_regress_secs")]
    pub reboot_uptime_regress_secs: u64,
    /// Wall-clock bound after which a pending reboot clears regardless of
    /// observed state.
    #[serde(default = "default_reboot_fallback_timeout_secs")]
    pub reboot_fallback_timeout_secs: u64,
    #[serde(default = "default_force_off_cooldown_ms")]
    pub force_off_cooldown_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsoleConfig {
    /// Delay between failed automatic reconnect attempts.
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    3000
}

fn default_refresh_interval_ms() -> u64 {
    1000
}

fn default_broadcast_capacity() -> usize {
    32
}

fn default_reboot_uptime_regress_secs() -> u64 {
    10
}

fn default_reboot_fallback_timeout_secs() -> u64 {
    25
}

fn default_force_off_cooldown_ms() -> u64 {
    3000
}

fn default_reconnect_backoff_ms() -> u64 {
    1500
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            refresh_interval_ms: default_refresh_interval_ms(),
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            reboot_uptime_regress_secs: default_reboot_uptime_regress_secs(),
            reboot_fallback_timeout_secs: default_reboot_fallback_timeout_secs(),
            force_off_cooldown_ms: default_force_off_cooldown_ms(),
        }
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
        }
    }
}

impl EngineConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".into());
        let s = std::fs::read_to_string(&path)?;
        Self::load_from_str(&s)
    }

    /// Parse and validate config from a string (e.g. for tests).
    pub fn load_from_str(s: &str) -> anyhow::Result<Self> {
        let config: EngineConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.polling.interval_ms > 0,
            "polling.interval_ms must be > 0, got {}",
            self.polling.interval_ms
        );
        anyhow::ensure!(
            self.polling.refresh_interval_ms > 0,
            "polling.refresh_interval_ms must be > 0, got {}",
            self.polling.refresh_interval_ms
        );
        anyhow::ensure!(
            self.polling.broadcast_capacity > 0,
            "polling.broadcast_capacity must be > 0, got {}",
            self.polling.broadcast_capacity
        );
        anyhow::ensure!(
            self.actions.reboot_uptime_regress_secs > 0,
            "actions.reboot_uptime_regress_secs must be > 0, got {}",
            self.actions.reboot_uptime_regress_secs
        );
        anyhow::ensure!(
            self.actions.reboot_fallback_timeout_secs > 0,
            "actions.reboot_fallback_timeout_secs must be > 0, got {}",
            self.actions.reboot_fallback_timeout_secs
        );
        anyhow::ensure!(
            self.actions.force_off_cooldown_ms > 0,
            "actions.force_off_cooldown_ms must be > 0, got {}",
            self.actions.force_off_cooldown_ms
        );
        anyhow::ensure!(
            self.console.reconnect_backoff_ms > 0,
            "console.reconnect_backoff_ms must be > 0, got {}",
            self.console.reconnect_backoff_ms
        );
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.polling.interval_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.polling.refresh_interval_ms)
    }

    pub fn reboot_uptime_regress(&self) -> Duration {
        Duration::from_secs(self.actions.reboot_uptime_regress_secs)
    }

    pub fn reboot_fallback_timeout(&self) -> Duration {
        Duration::from_secs(self.actions.reboot_fallback_timeout_secs)
    }

    pub fn force_off_cooldown(&self) -> Duration {
        Duration::from_millis(self.actions.force_off_cooldown_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.console.reconnect_backoff_ms)
    }
}
