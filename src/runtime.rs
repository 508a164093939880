// Copyright 2020 Joyent, Inc.

//! Runtime feature flags and wall-clock access. Both are collaborator
//! contracts: production deployments back them with a real runtime loader
//! and the system clock, tests back them with fixed maps and a mock clock.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rand::Rng;

/// Runtime feature flag loader.
pub trait Runtime: Send + Sync {
    /// Integer lookup with a default for unset keys.
    fn get_integer(&self, key: &str, default: u64) -> u64;

    /// Percentage roll. A value of 100 (or more) is always on, 0 is always
    /// off, anything between is rolled per call.
    fn feature_enabled(&self, key: &str, default_percent: u64) -> bool {
        let percent = self.get_integer(key, default_percent);
        if percent >= 100 {
            true
        } else if percent == 0 {
            false
        } else {
            rand::thread_rng().gen_range(0..100) < percent
        }
    }
}

/// A fixed key/value runtime. Keys may be replaced at any time, which is
/// enough to model runtime reloads in tests.
#[derive(Debug, Default)]
pub struct StaticRuntime {
    values: Mutex<HashMap<String, u64>>,
}

impl StaticRuntime {
    pub fn new() -> Self {
        StaticRuntime::default()
    }

    pub fn with_values(values: HashMap<String, u64>) -> Self {
        StaticRuntime {
            values: Mutex::new(values),
        }
    }

    pub fn set(&self, key: &str, value: u64) {
        self.values.lock().unwrap().insert(key.to_string(), value);
    }
}

impl Runtime for StaticRuntime {
    fn get_integer(&self, key: &str, default: u64) -> u64 {
        *self.values.lock().unwrap().get(key).unwrap_or(&default)
    }
}

/// Wall-clock access.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_runtime_defaults_and_overrides() {
        let runtime = StaticRuntime::new();
        assert_eq!(runtime.get_integer("outlier_detection.consecutive_5xx", 5), 5);
        runtime.set("outlier_detection.consecutive_5xx", 2);
        assert_eq!(runtime.get_integer("outlier_detection.consecutive_5xx", 2), 2);
    }

    #[test]
    fn feature_enabled_boundaries() {
        let runtime = StaticRuntime::new();
        runtime.set("upstream.use_http2", 100);
        assert!(runtime.feature_enabled("upstream.use_http2", 0));
        runtime.set("upstream.use_http2", 0);
        assert!(!runtime.feature_enabled("upstream.use_http2", 100));
    }
}
