// Copyright 2020 Joyent, Inc.

//! Counter and gauge primitives plus the named stat bundles allocated per
//! cluster. The store is the integration point for an external metrics
//! sink; internally everything is a shared atomic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A monotonically increasing counter.
#[derive(Clone, Debug, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn new() -> Self {
        Counter(Arc::new(AtomicU64::new(0)))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A gauge that can move in both directions.
#[derive(Clone, Debug, Default)]
pub struct Gauge(Arc<AtomicU64>);

impl Gauge {
    pub fn new() -> Self {
        Gauge(Arc::new(AtomicU64::new(0)))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        // Gauges never go negative; a decrement on zero is a bookkeeping bug
        // elsewhere, not something worth panicking over.
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Name-keyed registry of counters and gauges. Handles returned from the
/// store share the underlying atomic, so any clone may be read or written.
#[derive(Clone, Debug, Default)]
pub struct StatsStore {
    counters: Arc<Mutex<HashMap<String, Counter>>>,
    gauges: Arc<Mutex<HashMap<String, Gauge>>>,
}

impl StatsStore {
    pub fn new() -> Self {
        StatsStore::default()
    }

    pub fn counter(&self, name: &str) -> Counter {
        let mut counters = self.counters.lock().unwrap();
        counters
            .entry(name.to_string())
            .or_insert_with(Counter::new)
            .clone()
    }

    pub fn gauge(&self, name: &str) -> Gauge {
        let mut gauges = self.gauges.lock().unwrap();
        gauges
            .entry(name.to_string())
            .or_insert_with(Gauge::new)
            .clone()
    }
}

/// Stats tracked for every cluster.
#[derive(Clone, Debug)]
pub struct ClusterStats {
    pub upstream_cx_total: Counter,
    pub upstream_cx_none_healthy: Counter,
    pub lb_healthy_panic: Counter,
}

impl ClusterStats {
    pub fn new(cluster_name: &str, store: &StatsStore) -> Self {
        let prefix = format!("cluster.{}", cluster_name);
        ClusterStats {
            upstream_cx_total: store.counter(&format!("{}.upstream_cx_total", prefix)),
            upstream_cx_none_healthy: store
                .counter(&format!("{}.upstream_cx_none_healthy", prefix)),
            lb_healthy_panic: store.counter(&format!("{}.lb_healthy_panic", prefix)),
        }
    }
}

/// Stats tracked by an active health checker.
#[derive(Clone, Debug)]
pub struct HealthCheckStats {
    pub attempt: Counter,
    pub success: Counter,
    pub failure: Counter,
}

impl HealthCheckStats {
    pub fn new(cluster_name: &str, store: &StatsStore) -> Self {
        let prefix = format!("cluster.{}.health_check", cluster_name);
        HealthCheckStats {
            attempt: store.counter(&format!("{}.attempt", prefix)),
            success: store.counter(&format!("{}.success", prefix)),
            failure: store.counter(&format!("{}.failure", prefix)),
        }
    }
}

/// Stats tracked by the outlier detector.
#[derive(Clone, Debug)]
pub struct OutlierStats {
    pub ejections_total: Counter,
    pub ejections_active: Gauge,
    pub ejections_overflow: Counter,
    pub ejections_consecutive_5xx: Counter,
}

impl OutlierStats {
    pub fn new(cluster_name: &str, store: &StatsStore) -> Self {
        let prefix = format!("cluster.{}.outlier_detection", cluster_name);
        OutlierStats {
            ejections_total: store.counter(&format!("{}.ejections_total", prefix)),
            ejections_active: store.gauge(&format!("{}.ejections_active", prefix)),
            ejections_overflow: store.counter(&format!("{}.ejections_overflow", prefix)),
            ejections_consecutive_5xx: store
                .counter(&format!("{}.ejections_consecutive_5xx", prefix)),
        }
    }
}

/// Per-host stats. These are owned by the host rather than the store since
/// host lifetimes are dynamic and their names would otherwise accumulate.
#[derive(Clone, Debug, Default)]
pub struct HostStats {
    pub rq_total: Counter,
    pub rq_active: Gauge,
    pub cx_total: Counter,
}
