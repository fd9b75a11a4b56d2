use std::time::Duration;

use serde::Deserialize;

const MIN_EXTENSION_STEP_MS: u64 = 1_000;
const MIN_POLICY_INTERVAL_MS: u64 = 1_000;
const MIN_HEARTBEAT_REPEAT_MS: u64 = 1_000;
const MIN_BUFFER_RETENTION_BYTES: usize = 4 * 1024;

/// Timing parameters for operations. Supplied by the hosting process once;
/// the engine treats them as constants for the lifetime of each operation.
///
/// Every field has a serde default so a partial config (or `{}`) works.
/// Out-of-range values are clamped at the accessor, not rejected.
#[derive(Debug, Clone, Deserialize)]
pub struct TimingConfig {
    /// Budget granted when an operation starts.
    #[serde(default = "default_initial_duration_ms")]
    pub initial_duration_ms: u64,

    /// Amount one extension adds, automatic or manual.
    #[serde(default = "default_extension_step_ms")]
    pub extension_step_ms: u64,

    /// Absolute ceiling on running time; no extension may push past it.
    #[serde(default = "default_max_total_duration_ms")]
    pub max_total_duration_ms: u64,

    /// How recent the last event must be for an automatic extension.
    #[serde(default = "default_activity_window_ms")]
    pub activity_window_ms: u64,

    /// Cadence of automatic extension checks while an operation runs.
    #[serde(default = "default_policy_interval_ms")]
    pub policy_interval_ms: u64,

    /// Silence before the progress message warns that the task is still
    /// running.
    #[serde(default = "default_heartbeat_warn_after_ms")]
    pub heartbeat_warn_after_ms: u64,

    /// Interval between repeated still-running warnings once the first has
    /// been shown.
    #[serde(default = "default_heartbeat_repeat_ms")]
    pub heartbeat_repeat_ms: u64,

    /// Compactions longer than this get one extra user-visible notice.
    #[serde(default = "default_compaction_notice_threshold_ms")]
    pub compaction_notice_threshold_ms: u64,

    /// Minimum gap between rolling progress-message edits.
    #[serde(default = "default_progress_min_interval_ms")]
    pub progress_min_interval_ms: u64,

    /// Output kept in memory per operation; older output is trimmed from
    /// the front and flagged as truncated.
    #[serde(default = "default_buffer_retention_bytes")]
    pub buffer_retention_bytes: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            initial_duration_ms: default_initial_duration_ms(),
            extension_step_ms: default_extension_step_ms(),
            max_total_duration_ms: default_max_total_duration_ms(),
            activity_window_ms: default_activity_window_ms(),
            policy_interval_ms: default_policy_interval_ms(),
            heartbeat_warn_after_ms: default_heartbeat_warn_after_ms(),
            heartbeat_repeat_ms: default_heartbeat_repeat_ms(),
            compaction_notice_threshold_ms: default_compaction_notice_threshold_ms(),
            progress_min_interval_ms: default_progress_min_interval_ms(),
            buffer_retention_bytes: default_buffer_retention_bytes(),
        }
    }
}

impl TimingConfig {
    pub fn initial_duration(&self) -> Duration {
        Duration::from_millis(self.initial_duration_ms)
    }

    pub fn extension_step(&self) -> Duration {
        Duration::from_millis(self.extension_step_ms.max(MIN_EXTENSION_STEP_MS))
    }

    pub fn max_total_duration(&self) -> Duration {
        Duration::from_millis(self.max_total_duration_ms)
    }

    pub fn activity_window(&self) -> Duration {
        Duration::from_millis(self.activity_window_ms)
    }

    pub fn policy_interval(&self) -> Duration {
        Duration::from_millis(self.policy_interval_ms.max(MIN_POLICY_INTERVAL_MS))
    }

    pub fn heartbeat_warn_after(&self) -> Duration {
        Duration::from_millis(self.heartbeat_warn_after_ms)
    }

    pub fn heartbeat_repeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_repeat_ms.max(MIN_HEARTBEAT_REPEAT_MS))
    }

    pub fn compaction_notice_threshold(&self) -> Duration {
        Duration::from_millis(self.compaction_notice_threshold_ms)
    }

    pub fn progress_min_interval(&self) -> Duration {
        Duration::from_millis(self.progress_min_interval_ms)
    }

    pub fn buffer_retention(&self) -> usize {
        self.buffer_retention_bytes.max(MIN_BUFFER_RETENTION_BYTES)
    }
}

fn default_initial_duration_ms() -> u64 {
    1_800_000 // 30 minutes
}

fn default_extension_step_ms() -> u64 {
    1_200_000 // 20 minutes
}

fn default_max_total_duration_ms() -> u64 {
    7_200_000 // 2 hours
}

fn default_activity_window_ms() -> u64 {
    180_000 // 3 minutes
}

fn default_policy_interval_ms() -> u64 {
    30_000
}

fn default_heartbeat_warn_after_ms() -> u64 {
    60_000
}

fn default_heartbeat_repeat_ms() -> u64 {
    30_000
}

fn default_compaction_notice_threshold_ms() -> u64 {
    30_000
}

fn default_progress_min_interval_ms() -> u64 {
    3_000
}

fn default_buffer_retention_bytes() -> usize {
    128 * 1024
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let config: TimingConfig = serde_json::from_value(json!({})).expect("deserialize config");
        assert_eq!(config.initial_duration_ms, 1_800_000);
        assert_eq!(config.extension_step_ms, 1_200_000);
        assert_eq!(config.max_total_duration_ms, 7_200_000);
        assert_eq!(config.activity_window_ms, 180_000);
    }

    #[test]
    fn partial_config_overrides_only_named_fields() {
        let config: TimingConfig = serde_json::from_value(json!({
            "initial_duration_ms": 300_000,
            "extension_step_ms": 60_000,
        }))
        .expect("deserialize config");
        assert_eq!(config.initial_duration(), Duration::from_secs(300));
        assert_eq!(config.extension_step(), Duration::from_secs(60));
        assert_eq!(config.max_total_duration_ms, 7_200_000);
    }

    #[test]
    fn out_of_range_values_are_clamped_at_use() {
        let config = TimingConfig {
            extension_step_ms: 0,
            policy_interval_ms: 1,
            heartbeat_repeat_ms: 0,
            buffer_retention_bytes: 16,
            ..TimingConfig::default()
        };
        assert_eq!(config.extension_step(), Duration::from_millis(1_000));
        assert_eq!(config.policy_interval(), Duration::from_millis(1_000));
        assert_eq!(config.heartbeat_repeat(), Duration::from_millis(1_000));
        assert_eq!(config.buffer_retention(), 4 * 1024);
    }
}
