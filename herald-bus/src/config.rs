use std::time::Duration;

use herald_core::HeraldConfigSnapshot;

/// Runtime settings for hosts, dispatchers and the in-memory transport.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Pool size for bindings that do not declare `max_concurrent_calls`
    pub default_max_concurrent_calls: usize,
    /// Longest single wait on the transport for the next message
    pub receive_wait: Duration,
    /// Peek-lock duration (in-memory transport)
    pub lock_duration: Duration,
    /// Deliveries before the broker dead-letters on its own (in-memory transport)
    pub max_delivery_count: u32,
    /// How long shutdown waits for in-flight handlers
    pub shutdown_grace: Duration,
    /// How far ahead the health check schedules its test message
    pub health_check_horizon: Duration,
    /// Lock reaper tick
    pub reaper_interval: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            default_max_concurrent_calls: 16,
            receive_wait: Duration::from_secs(1),
            lock_duration: Duration::from_secs(60),
            max_delivery_count: 10,
            shutdown_grace: Duration::from_secs(30),
            health_check_horizon: Duration::from_secs(3650 * 24 * 60 * 60),
            reaper_interval: Duration::from_secs(5),
        }
    }
}

impl BusConfig {
    /// Read `bus.*` keys, keeping the default for anything missing or
    /// unparsable.
    ///
    /// | key | unit |
    /// |---|---|
    /// | `bus.default_max_concurrent_calls` | count |
    /// | `bus.receive_wait_ms` | ms |
    /// | `bus.lock_duration_ms` | ms |
    /// | `bus.max_delivery_count` | count |
    /// | `bus.shutdown_grace_ms` | ms |
    /// | `bus.health_check_horizon_days` | days |
    /// | `bus.reaper_interval_ms` | ms |
    pub fn from_snapshot(snapshot: &HeraldConfigSnapshot) -> Self {
        let defaults = Self::default();

        Self {
            default_max_concurrent_calls: snapshot
                .get_usize("bus.default_max_concurrent_calls")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.default_max_concurrent_calls),
            receive_wait: snapshot
                .get_duration_ms("bus.receive_wait_ms")
                .unwrap_or(defaults.receive_wait),
            lock_duration: snapshot
                .get_duration_ms("bus.lock_duration_ms")
                .unwrap_or(defaults.lock_duration),
            max_delivery_count: snapshot
                .get_u64("bus.max_delivery_count")
                .and_then(|n| u32::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_delivery_count),
            shutdown_grace: snapshot
                .get_duration_ms("bus.shutdown_grace_ms")
                .unwrap_or(defaults.shutdown_grace),
            health_check_horizon: snapshot
                .get_u64("bus.health_check_horizon_days")
                .map(|days| Duration::from_secs(days.saturating_mul(24 * 60 * 60)))
                .unwrap_or(defaults.health_check_horizon),
            reaper_interval: snapshot
                .get_duration_ms("bus.reaper_interval_ms")
                .filter(|d| !d.is_zero())
                .unwrap_or(defaults.reaper_interval),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::HeraldConfig;

    #[test]
    fn test_default_config() {
        let config = BusConfig::default();

        assert_eq!(config.default_max_concurrent_calls, 16);
        assert_eq!(config.max_delivery_count, 10);
        assert_eq!(config.lock_duration, Duration::from_secs(60));
    }

    #[test]
    fn snapshot_overrides_and_falls_back() {
        let mut cfg = HeraldConfig::new();
        cfg.set("bus.lock_duration_ms", "1500");
        cfg.set("bus.default_max_concurrent_calls", "0");
        cfg.set("bus.health_check_horizon_days", "1");
        cfg.set("bus.max_delivery_count", "banana");

        let config = BusConfig::from_snapshot(&cfg.snapshot());

        assert_eq!(config.lock_duration, Duration::from_millis(1500));
        assert_eq!(config.default_max_concurrent_calls, 16);
        assert_eq!(config.health_check_horizon, Duration::from_secs(86_400));
        assert_eq!(config.max_delivery_count, 10);
    }
}
