use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `ENGAGE__`. Each component receives its own section
/// through its constructor.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub computed_properties: ComputedPropertiesConfig,
    #[serde(default)]
    pub journey: JourneyConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
}

// ─── Computed Properties Config ─────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ComputedPropertiesConfig {
    /// Base period between two evaluation cycles of one workspace.
    #[serde(default = "default_base_polling_period_ms")]
    pub base_polling_period_ms: u64,
    /// Upper bound of the random delay added to every polling period.
    #[serde(default = "default_polling_jitter_ms")]
    pub polling_jitter_ms: u64,
    /// Window end is held back by `coefficient * base_polling_period_ms`.
    #[serde(default = "default_jitter_guard_coefficient")]
    pub jitter_guard_coefficient: f64,
    #[serde(default = "default_period_retention_ms")]
    pub period_retention_ms: u64,
    #[serde(default = "default_max_lookback_ms")]
    pub max_lookback_ms: u64,
}

fn default_node_id() -> String {
    "engage-01".to_string()
}
fn default_base_polling_period_ms() -> u64 {
    10_000
}
fn default_polling_jitter_ms() -> u64 {
    1_000
}
fn default_jitter_guard_coefficient() -> f64 {
    0.1
}
fn default_period_retention_ms() -> u64 {
    5 * 60 * 1000
}
fn default_max_lookback_ms() -> u64 {
    90 * 24 * 60 * 60 * 1000
}

impl ComputedPropertiesConfig {
    /// How far behind `now` a window is allowed to end.
    pub fn jitter_guard(&self) -> chrono::Duration {
        let millis = (self.base_polling_period_ms as f64 * self.jitter_guard_coefficient).max(0.0);
        chrono::Duration::milliseconds(millis as i64)
    }
}

impl Default for ComputedPropertiesConfig {
    fn default() -> Self {
        Self {
            base_polling_period_ms: default_base_polling_period_ms(),
            polling_jitter_ms: default_polling_jitter_ms(),
            jitter_guard_coefficient: default_jitter_guard_coefficient(),
            period_retention_ms: default_period_retention_ms(),
            max_lookback_ms: default_max_lookback_ms(),
        }
    }
}

// ─── Journey Config ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct JourneyConfig {
    /// Maximum number of message sends in flight at once.
    #[serde(default = "default_max_concurrent_sends")]
    pub max_concurrent_sends: usize,
    #[serde(default = "default_send_max_attempts")]
    pub send_max_attempts: u32,
    #[serde(default = "default_send_initial_backoff_ms")]
    pub send_initial_backoff_ms: u64,
    #[serde(default = "default_send_max_backoff_ms")]
    pub send_max_backoff_ms: u64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// How often entry-segment members without an instance are looked for.
    #[serde(default = "default_entry_reconcile_interval_ms")]
    pub entry_reconcile_interval_ms: u64,
}

fn default_max_concurrent_sends() -> usize { 10 }
fn default_send_max_attempts() -> u32 { 5 }
fn default_send_initial_backoff_ms() -> u64 { 1_000 }
fn default_send_max_backoff_ms() -> u64 { 60_000 }
fn default_tick_interval_ms() -> u64 { 1_000 }
fn default_entry_reconcile_interval_ms() -> u64 { 60_000 }

impl JourneyConfig {
    /// Exponential backoff before retry number `attempt` (1-based), capped.
    pub fn backoff(&self, attempt: u32) -> std::time::Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let millis = self
            .send_initial_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.send_max_backoff_ms);
        std::time::Duration::from_millis(millis)
    }
}

impl Default for JourneyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sends: default_max_concurrent_sends(),
            send_max_attempts: default_send_max_attempts(),
            send_initial_backoff_ms: default_send_initial_backoff_ms(),
            send_max_backoff_ms: default_send_max_backoff_ms(),
            tick_interval_ms: default_tick_interval_ms(),
            entry_reconcile_interval_ms: default_entry_reconcile_interval_ms(),
        }
    }
}

// ─── Broadcast Config ───────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastConfig {
    #[serde(default = "default_broadcast_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_broadcast_max_concurrent_users")]
    pub max_concurrent_users: usize,
}

fn default_broadcast_batch_size() -> usize { 100 }
fn default_broadcast_max_concurrent_users() -> usize { 10 }

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            batch_size: default_broadcast_batch_size(),
            max_concurrent_users: default_broadcast_max_concurrent_users(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            computed_properties: ComputedPropertiesConfig::default(),
            journey: JourneyConfig::default(),
            broadcast: BroadcastConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("ENGAGE")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
