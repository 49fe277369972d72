// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Runtime configuration for the dispatch core.
//!
//! Loaded from the deployment's YAML config (`aegis-config.yaml`, section
//! `dispatch:`). Durations accept humantime strings ("30s", "5m").

use chrono::Duration as ChronoDuration;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    /// Debounce window applied to lanes created without an explicit one.
    pub default_debounce_ms: i64,
    /// Coalescing cap applied to lanes created without an explicit one.
    pub default_max_queued: i64,
    /// Lease TTL stamped on claimed dispatches.
    #[serde(with = "humantime_serde")]
    pub dispatch_lease_ttl: Duration,
    /// Lease TTL stamped on claimed outbox entries.
    #[serde(with = "humantime_serde")]
    pub effect_lease_ttl: Duration,
    /// Worker heartbeat / control-directive poll cadence.
    #[serde(with = "humantime_serde")]
    pub supervision_interval: Duration,
    /// Sleep between empty claim polls.
    #[serde(with = "humantime_serde")]
    pub idle_poll_interval: Duration,
    /// Lease-reaper sweep cadence.
    #[serde(with = "humantime_serde")]
    pub reaper_interval: Duration,
    /// Outbox retry backoff base; doubles per attempt.
    #[serde(with = "humantime_serde")]
    pub retry_backoff_base: Duration,
    /// Outbox retry backoff cap.
    #[serde(with = "humantime_serde")]
    pub retry_backoff_cap: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_debounce_ms: 2000,
            default_max_queued: 20,
            dispatch_lease_ttl: Duration::from_secs(120),
            effect_lease_ttl: Duration::from_secs(60),
            supervision_interval: Duration::from_secs(5),
            idle_poll_interval: Duration::from_secs(1),
            reaper_interval: Duration::from_secs(30),
            retry_backoff_base: Duration::from_secs(5),
            retry_backoff_cap: Duration::from_secs(300),
        }
    }
}

impl DispatchConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    pub fn dispatch_lease_ttl_chrono(&self) -> ChronoDuration {
        ChronoDuration::from_std(self.dispatch_lease_ttl).unwrap_or(ChronoDuration::seconds(120))
    }

    pub fn effect_lease_ttl_chrono(&self) -> ChronoDuration {
        ChronoDuration::from_std(self.effect_lease_ttl).unwrap_or(ChronoDuration::seconds(60))
    }

    pub fn retry_backoff_base_chrono(&self) -> ChronoDuration {
        ChronoDuration::from_std(self.retry_backoff_base).unwrap_or(ChronoDuration::seconds(5))
    }

    pub fn retry_backoff_cap_chrono(&self) -> ChronoDuration {
        ChronoDuration::from_std(self.retry_backoff_cap).unwrap_or(ChronoDuration::seconds(300))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = DispatchConfig::default();
        assert!(cfg.dispatch_lease_ttl > cfg.supervision_interval);
        assert!(cfg.retry_backoff_cap >= cfg.retry_backoff_base);
    }

    #[test]
    fn loads_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.yaml");
        std::fs::write(&path, "reaper_interval: 45s\ndefault_max_queued: 3\n").unwrap();

        let cfg = DispatchConfig::from_yaml_file(&path).unwrap();
        assert_eq!(cfg.reaper_interval, Duration::from_secs(45));
        assert_eq!(cfg.default_max_queued, 3);
    }

    #[test]
    fn rejects_unknown_fields() {
        assert!(serde_yaml::from_str::<DispatchConfig>("debouce_ms: 100\n").is_err());
    }

    #[test]
    fn parses_yaml_with_humantime_durations() {
        let cfg: DispatchConfig = serde_yaml::from_str(
            "default_debounce_ms: 500\ndispatch_lease_ttl: 3m\nretry_backoff_base: 10s\n",
        )
        .unwrap();
        assert_eq!(cfg.default_debounce_ms, 500);
        assert_eq!(cfg.dispatch_lease_ttl, Duration::from_secs(180));
        assert_eq!(cfg.retry_backoff_base, Duration::from_secs(10));
        // Unspecified fields keep defaults.
        assert_eq!(cfg.default_max_queued, 20);
    }
}
