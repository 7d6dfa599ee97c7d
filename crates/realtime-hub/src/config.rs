use std::env;
use std::time::Duration;

/// How the recreation delay grows after a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPolicy {
    /// `base * 2^consumers`, using the consumer count at the moment of failure.
    ConsumerWeighted,
    /// `base * 2^(failures - 1)`, counting consecutive failures for the key.
    /// The count resets once the channel reports `Established`.
    Attempts,
}

impl BackoffPolicy {
    fn from_env() -> Self {
        match env::var("REALTIME_HUB_BACKOFF_POLICY")
            .unwrap_or_else(|_| "consumers".into())
            .as_str()
        {
            "attempts" => BackoffPolicy::Attempts,
            _ => BackoffPolicy::ConsumerWeighted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub policy: BackoffPolicy,
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    /// Delay before recreating a connection that had `consumers` live consumers
    /// and has now failed `failures` times in a row. Never exceeds `max`.
    pub fn delay(&self, consumers: usize, failures: u32) -> Duration {
        let exponent = match self.policy {
            BackoffPolicy::ConsumerWeighted => u32::try_from(consumers).unwrap_or(u32::MAX),
            BackoffPolicy::Attempts => failures.saturating_sub(1),
        };
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            policy: BackoffPolicy::ConsumerWeighted,
            base: Duration::from_millis(2_000),
            max: Duration::from_millis(10_000),
        }
    }
}

/// What the periodic health check does with a connection that has gone quiet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StalePolicy {
    Flag,
    Reconnect,
}

impl StalePolicy {
    fn from_env() -> Self {
        match env::var("REALTIME_HUB_STALE_POLICY")
            .unwrap_or_else(|_| "flag".into())
            .as_str()
        {
            "reconnect" => StalePolicy::Reconnect,
            _ => StalePolicy::Flag,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Wait before re-checking an idle connection that was unsafe to close.
    pub deferred_teardown: Duration,
    pub backoff: Backoff,
    pub health_check_interval: Duration,
    pub stale_after: Duration,
    pub stale_policy: StalePolicy,
}

impl HubConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            deferred_teardown: env_millis("REALTIME_HUB_DEFERRED_TEARDOWN_MS")
                .unwrap_or(defaults.deferred_teardown),
            backoff: Backoff {
                policy: BackoffPolicy::from_env(),
                base: env_millis("REALTIME_HUB_RETRY_BASE_MS").unwrap_or(defaults.backoff.base),
                max: env_millis("REALTIME_HUB_RETRY_MAX_MS").unwrap_or(defaults.backoff.max),
            },
            health_check_interval: env_millis("REALTIME_HUB_HEALTH_INTERVAL_MS")
                .unwrap_or(defaults.health_check_interval),
            stale_after: env_millis("REALTIME_HUB_STALE_AFTER_MS").unwrap_or(defaults.stale_after),
            stale_policy: StalePolicy::from_env(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            deferred_teardown: Duration::from_secs(5),
            backoff: Backoff::default(),
            health_check_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(5 * 60),
            stale_policy: StalePolicy::Flag,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How long the host must stay hidden before idle resources are released.
    pub hidden_grace: Duration,
}

impl CoordinatorConfig {
    pub fn from_env() -> Self {
        Self {
            hidden_grace: env_millis("REALTIME_HUB_HIDDEN_GRACE_MS")
                .unwrap_or(Self::default().hidden_grace),
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            hidden_grace: Duration::from_secs(5),
        }
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::sync::Mutex;

    // env vars are process-global
    static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    const VARS: [&str; 7] = [
        "REALTIME_HUB_DEFERRED_TEARDOWN_MS",
        "REALTIME_HUB_RETRY_BASE_MS",
        "REALTIME_HUB_RETRY_MAX_MS",
        "REALTIME_HUB_BACKOFF_POLICY",
        "REALTIME_HUB_HEALTH_INTERVAL_MS",
        "REALTIME_HUB_STALE_AFTER_MS",
        "REALTIME_HUB_STALE_POLICY",
    ];

    fn clear_vars() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn defaults_match_documented_timings() {
        let config = HubConfig::default();
        assert_eq!(config.deferred_teardown, Duration::from_secs(5));
        assert_eq!(config.backoff.base, Duration::from_millis(2_000));
        assert_eq!(config.backoff.max, Duration::from_millis(10_000));
        assert_eq!(config.health_check_interval, Duration::from_secs(30));
        assert_eq!(config.stale_after, Duration::from_secs(300));
        assert_eq!(config.stale_policy, StalePolicy::Flag);
        assert_eq!(CoordinatorConfig::default().hidden_grace, Duration::from_secs(5));
    }

    #[test]
    fn from_env_overrides_and_ignores_garbage() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_vars();
        env::set_var("REALTIME_HUB_DEFERRED_TEARDOWN_MS", "750");
        env::set_var("REALTIME_HUB_RETRY_MAX_MS", "not-a-number");
        env::set_var("REALTIME_HUB_BACKOFF_POLICY", "attempts");
        env::set_var("REALTIME_HUB_STALE_POLICY", "reconnect");

        let config = HubConfig::from_env();
        assert_eq!(config.deferred_teardown, Duration::from_millis(750));
        assert_eq!(config.backoff.max, Duration::from_millis(10_000));
        assert_eq!(config.backoff.policy, BackoffPolicy::Attempts);
        assert_eq!(config.stale_policy, StalePolicy::Reconnect);
        clear_vars();
    }

    #[test]
    fn consumer_weighted_delay_uses_consumer_count() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(0, 1), Duration::from_millis(2_000));
        assert_eq!(backoff.delay(1, 1), Duration::from_millis(4_000));
        assert_eq!(backoff.delay(2, 9), Duration::from_millis(8_000));
        assert_eq!(backoff.delay(3, 1), Duration::from_millis(10_000));
        assert_eq!(backoff.delay(usize::MAX, 1), Duration::from_millis(10_000));
    }

    #[test]
    fn attempt_delays_are_monotonic_and_capped() {
        let backoff = Backoff {
            policy: BackoffPolicy::Attempts,
            ..Backoff::default()
        };
        let delays: Vec<Duration> = (1..=40).map(|failures| backoff.delay(5, failures)).collect();
        assert_eq!(delays[0], Duration::from_millis(2_000));
        assert_eq!(delays[1], Duration::from_millis(4_000));
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(delays.iter().all(|delay| *delay <= backoff.max));
        assert_eq!(*delays.last().unwrap(), backoff.max);
    }
}
