// Copyright 2020 Joyent, Inc.

//! Passive outlier detection.
//!
//! Workers report the HTTP response code of every upstream request through
//! the host's sink. A run of consecutive 5xx responses ejects the host:
//! its outlier flag is set, the cluster recomputes its healthy vectors, and
//! an interval sweep un-ejects it after a backoff proportional to how often
//! it has been ejected before. The sink holds only a weak reference to its
//! detector and the detector holds weak references to hosts, so neither
//! keeps the other alive across cluster teardown.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use slog::{info, o, warn, Logger};

use crate::host::{health_flags, Host};
use crate::runtime::{Runtime, TimeSource};
use crate::stats::{OutlierStats, StatsStore};

/// Why a host was ejected.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EjectionType {
    Consecutive5xx,
}

impl EjectionType {
    fn as_str(self) -> &'static str {
        match self {
            EjectionType::Consecutive5xx => "consecutive_5xx",
        }
    }
}

/// Per-host observation sink. Response codes arrive from every worker, so
/// the counters are atomic. Hosts of clusters without outlier detection
/// carry a sink whose detector reference never upgrades, making every
/// operation a no-op.
#[derive(Debug)]
pub struct DetectorHostSink {
    detector: Weak<Detector>,
    host: Weak<Host>,
    consecutive_5xx: AtomicU32,
    num_ejections: AtomicU32,
    ejection_time: Mutex<Option<DateTime<Utc>>>,
}

impl DetectorHostSink {
    pub fn new(detector: Weak<Detector>, host: Weak<Host>) -> Arc<Self> {
        Arc::new(DetectorHostSink {
            detector,
            host,
            consecutive_5xx: AtomicU32::new(0),
            num_ejections: AtomicU32::new(0),
            ejection_time: Mutex::new(None),
        })
    }

    /// Reports the response code of one completed upstream request.
    pub fn put_http_response_code(&self, code: u64) {
        let Some(detector) = self.detector.upgrade() else {
            return;
        };
        if !(500..600).contains(&code) {
            self.consecutive_5xx.store(0, Ordering::Relaxed);
            return;
        }
        let streak = self.consecutive_5xx.fetch_add(1, Ordering::Relaxed) + 1;
        if streak == detector.consecutive_5xx_threshold() {
            if let Some(host) = self.host.upgrade() {
                detector.on_consecutive_5xx(host);
            }
        }
    }

    /// Reports the latency of one completed upstream request. Latency is
    /// collected for future ejection policies; the consecutive-5xx policy
    /// ignores it.
    pub fn put_response_time(&self, _millis: u64) {}

    pub fn num_ejections(&self) -> u32 {
        self.num_ejections.load(Ordering::Relaxed)
    }

    pub fn ejection_time(&self) -> Option<DateTime<Utc>> {
        *self.ejection_time.lock().unwrap()
    }

    fn mark_ejected(&self, now: DateTime<Utc>) {
        *self.ejection_time.lock().unwrap() = Some(now);
        self.num_ejections.fetch_add(1, Ordering::Relaxed);
    }

    fn mark_unejected(&self) {
        *self.ejection_time.lock().unwrap() = None;
    }
}

type ChangeStateCb = Box<dyn Fn(Arc<Host>) + Send + Sync>;

/// Consecutive-5xx outlier detector for one cluster.
pub struct Detector {
    cluster_name: String,
    runtime: Arc<dyn Runtime>,
    time_source: Arc<dyn TimeSource>,
    stats: OutlierStats,
    hosts: Mutex<Vec<(Weak<Host>, Arc<DetectorHostSink>)>>,
    callbacks: Mutex<Vec<ChangeStateCb>>,
    event_logger: Option<Arc<EventLogger>>,
    timer: Mutex<timer::Timer>,
    timer_guard: Mutex<Option<timer::Guard>>,
    log: Logger,
}

impl Detector {
    pub fn new(
        cluster_name: &str,
        runtime: Arc<dyn Runtime>,
        time_source: Arc<dyn TimeSource>,
        stats_store: &StatsStore,
        event_logger: Option<Arc<EventLogger>>,
        log: Logger,
    ) -> Arc<Self> {
        Arc::new(Detector {
            cluster_name: cluster_name.to_string(),
            runtime,
            time_source,
            stats: OutlierStats::new(cluster_name, stats_store),
            hosts: Mutex::new(Vec::new()),
            callbacks: Mutex::new(Vec::new()),
            event_logger,
            timer: Mutex::new(timer::Timer::new()),
            timer_guard: Mutex::new(None),
            log: log.new(o!("cluster" => cluster_name.to_string())),
        })
    }

    pub fn stats(&self) -> &OutlierStats {
        &self.stats
    }

    /// Arms the un-ejection sweep timer. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.timer_guard.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let interval_ms = self
            .runtime
            .get_integer("outlier_detection.interval_ms", 10_000);
        let weak: Weak<Detector> = Arc::downgrade(self);
        let timer = self.timer.lock().unwrap();
        *guard = Some(timer.schedule_repeating(
            chrono::Duration::milliseconds(interval_ms as i64),
            move || {
                if let Some(detector) = weak.upgrade() {
                    detector.interval_sweep();
                }
            },
        ));
    }

    pub fn stop(&self) {
        let _ = self.timer_guard.lock().unwrap().take();
    }

    /// Registers a callback run after every ejection state change.
    pub fn add_changed_state_cb(&self, cb: ChangeStateCb) {
        self.callbacks.lock().unwrap().push(cb);
    }

    /// Tracks membership so the sweep visits exactly the current members.
    pub fn on_membership_change(&self, hosts_added: &[Arc<Host>], hosts_removed: &[Arc<Host>]) {
        let mut hosts = self.hosts.lock().unwrap();
        for host in hosts_added {
            hosts.push((Arc::downgrade(host), host.outlier_sink().clone()));
        }
        for removed in hosts_removed {
            hosts.retain(|(weak, _)| {
                weak.upgrade()
                    .map(|h| !Arc::ptr_eq(&h, removed))
                    .unwrap_or(false)
            });
        }
    }

    pub(crate) fn consecutive_5xx_threshold(&self) -> u32 {
        self.runtime
            .get_integer("outlier_detection.consecutive_5xx", 5) as u32
    }

    /// A host just completed its Nth consecutive 5xx response.
    pub(crate) fn on_consecutive_5xx(&self, host: Arc<Host>) {
        self.stats.ejections_consecutive_5xx.inc();
        self.eject_host(host, EjectionType::Consecutive5xx);
    }

    fn eject_host(&self, host: Arc<Host>, ejection_type: EjectionType) {
        let total_hosts = {
            let mut hosts = self.hosts.lock().unwrap();
            hosts.retain(|(weak, _)| weak.upgrade().is_some());
            hosts.len()
        };

        let max_ejection_percent = std::cmp::min(
            100,
            self.runtime
                .get_integer("outlier_detection.max_ejection_percent", 10),
        );
        let ejected_percent = if total_hosts == 0 {
            0
        } else {
            100 * self.stats.ejections_active.value() / total_hosts as u64
        };
        if ejected_percent >= max_ejection_percent {
            self.stats.ejections_overflow.inc();
            return;
        }

        if !host.set_health_flag(health_flags::FAILED_OUTLIER_CHECK) {
            // Already ejected; another worker's report raced this one.
            return;
        }
        let now = self.time_source.now();
        host.outlier_sink().mark_ejected(now);
        self.stats.ejections_total.inc();
        self.stats.ejections_active.inc();
        info!(self.log, "ejecting host";
              "host" => host.url(), "type" => ejection_type.as_str());
        if let Some(event_logger) = &self.event_logger {
            event_logger.log_ejection_event(&self.cluster_name, &host, "eject", ejection_type);
        }
        self.run_callbacks(host);
    }

    /// Un-ejects every host whose backoff has elapsed. Driven by the
    /// interval timer; public so tests can sweep with a mock clock.
    pub fn interval_sweep(&self) {
        let now = self.time_source.now();
        let base_ms = self
            .runtime
            .get_integer("outlier_detection.base_ejection_time_ms", 30_000);

        let due: Vec<Arc<Host>> = {
            let mut hosts = self.hosts.lock().unwrap();
            hosts.retain(|(weak, _)| weak.upgrade().is_some());
            hosts
                .iter()
                .filter_map(|(weak, sink)| {
                    let host = weak.upgrade()?;
                    if !host.has_health_flag(health_flags::FAILED_OUTLIER_CHECK) {
                        return None;
                    }
                    let ejected_at = sink.ejection_time()?;
                    let backoff = chrono::Duration::milliseconds(
                        base_ms.saturating_mul(sink.num_ejections() as u64) as i64,
                    );
                    if now - ejected_at >= backoff {
                        Some(host)
                    } else {
                        None
                    }
                })
                .collect()
        };

        for host in due {
            if !host.clear_health_flag(health_flags::FAILED_OUTLIER_CHECK) {
                continue;
            }
            host.outlier_sink().mark_unejected();
            self.stats.ejections_active.dec();
            info!(self.log, "unejecting host"; "host" => host.url());
            if let Some(event_logger) = &self.event_logger {
                event_logger.log_ejection_event(
                    &self.cluster_name,
                    &host,
                    "uneject",
                    EjectionType::Consecutive5xx,
                );
            }
            self.run_callbacks(host);
        }
    }

    fn run_callbacks(&self, host: Arc<Host>) {
        let callbacks = self.callbacks.lock().unwrap();
        for cb in callbacks.iter() {
            cb(host.clone());
        }
    }
}

impl std::fmt::Debug for Detector {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Detector")
            .field("cluster", &self.cluster_name)
            .finish()
    }
}

/// Writes newline-delimited JSON ejection events to a log file.
pub struct EventLogger {
    file: Mutex<std::fs::File>,
    time_source: Arc<dyn TimeSource>,
    log: Logger,
}

impl EventLogger {
    pub fn new(
        path: &str,
        time_source: Arc<dyn TimeSource>,
        log: Logger,
    ) -> Result<Arc<Self>, crate::error::Error> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Arc::new(EventLogger {
            file: Mutex::new(file),
            time_source,
            log,
        }))
    }

    fn log_ejection_event(
        &self,
        cluster: &str,
        host: &Arc<Host>,
        action: &str,
        ejection_type: EjectionType,
    ) {
        use std::io::Write;

        let record = serde_json::json!({
            "time": self.time_source.now().to_rfc3339(),
            "cluster": cluster,
            "upstream_url": host.url(),
            "action": action,
            "type": ejection_type.as_str(),
            "num_ejections": host.outlier_sink().num_ejections(),
        });
        let mut file = self.file.lock().unwrap();
        if let Err(e) = writeln!(file, "{}", record) {
            warn!(self.log, "failed to write ejection event"; "error" => e.to_string());
        }
    }
}
