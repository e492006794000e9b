use anyhow::Context;

#[derive(Clone, Debug)]
pub struct Config {
    pub primary_url: String,
    pub secondary_url: String,
    pub primary_timeout_ms: u64,
    pub secondary_timeout_ms: u64,
    pub reconnect_backoff_ms: u64,
    pub resubscribe_concurrency: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            primary_url: "ws://127.0.0.1:3210/sync".into(),
            secondary_url: "http://127.0.0.1:3210".into(),
            primary_timeout_ms: 5_000,
            secondary_timeout_ms: 20_000,
            reconnect_backoff_ms: 3_000,
            resubscribe_concurrency: 8,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`Config::from_env`] with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let primary_url = lookup("LIVE_PRIMARY_URL").unwrap_or(defaults.primary_url);
        let secondary_url = lookup("LIVE_SECONDARY_URL").unwrap_or(defaults.secondary_url);
        let primary_timeout_ms = lookup("LIVE_PRIMARY_TIMEOUT_MS")
            .map(|v| v.parse::<u64>())
            .transpose()
            .context("LIVE_PRIMARY_TIMEOUT_MS must be a number")?
            .unwrap_or(defaults.primary_timeout_ms);
        let secondary_timeout_ms = lookup("LIVE_SECONDARY_TIMEOUT_MS")
            .map(|v| v.parse::<u64>())
            .transpose()
            .context("LIVE_SECONDARY_TIMEOUT_MS must be a number")?
            .unwrap_or(defaults.secondary_timeout_ms);
        let reconnect_backoff_ms = lookup("LIVE_RECONNECT_BACKOFF_MS")
            .map(|v| v.parse::<u64>())
            .transpose()
            .context("LIVE_RECONNECT_BACKOFF_MS must be a number")?
            .unwrap_or(defaults.reconnect_backoff_ms);
        let resubscribe_concurrency = lookup("LIVE_RESUBSCRIBE_CONCURRENCY")
            .map(|v| v.parse::<usize>())
            .transpose()
            .context("LIVE_RESUBSCRIBE_CONCURRENCY must be a number")?
            .unwrap_or(defaults.resubscribe_concurrency);

        anyhow::ensure!(
            resubscribe_concurrency > 0,
            "LIVE_RESUBSCRIBE_CONCURRENCY must be at least 1"
        );
        anyhow::ensure!(
            primary_timeout_ms > 0 && secondary_timeout_ms > 0,
            "timeouts must be non-zero"
        );

        Ok(Self {
            primary_url,
            secondary_url,
            primary_timeout_ms,
            secondary_timeout_ms,
            reconnect_backoff_ms,
            resubscribe_concurrency,
        })
    }
}
