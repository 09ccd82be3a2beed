use std::time::Duration;

use herald_core::HeraldConfigSnapshot;

/// Where the scheduling protocol lives on the bus.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Queue the central scheduler reads Register/Abort/Acknowledge/NotFound from
    pub command_queue: String,
    /// Topic fire and abort events go out on, labeled with the subscriber id
    pub dispatch_topic: String,
    pub connection_key: String,
    /// How long a fire waits for Acknowledge/NotFound
    pub reply_timeout: Duration,
    pub max_concurrent_calls: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            command_queue: "herald-scheduler-commands".to_string(),
            dispatch_topic: "herald-scheduler-dispatch".to_string(),
            connection_key: "default".to_string(),
            reply_timeout: Duration::from_secs(60),
            max_concurrent_calls: 8,
        }
    }
}

impl SchedulerConfig {
    /// Read `scheduler.command_queue`, `scheduler.dispatch_topic`,
    /// `scheduler.connection_key`, `scheduler.reply_timeout_ms` and
    /// `scheduler.max_concurrent_calls`.
    pub fn from_snapshot(snapshot: &HeraldConfigSnapshot) -> Self {
        let defaults = Self::default();

        Self {
            command_queue: snapshot
                .get_string("scheduler.command_queue")
                .unwrap_or(defaults.command_queue),
            dispatch_topic: snapshot
                .get_string("scheduler.dispatch_topic")
                .unwrap_or(defaults.dispatch_topic),
            connection_key: snapshot
                .get_string("scheduler.connection_key")
                .unwrap_or(defaults.connection_key),
            reply_timeout: snapshot
                .get_duration_ms("scheduler.reply_timeout_ms")
                .filter(|d| !d.is_zero())
                .unwrap_or(defaults.reply_timeout),
            max_concurrent_calls: snapshot
                .get_usize("scheduler.max_concurrent_calls")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_concurrent_calls),
        }
    }
}
