// Copyright 2020 Joyent, Inc.

//! Active health checking.
//!
//! Each cluster with a `health_check` config owns one `HealthChecker` that
//! probes every member on an interval. Probe outcomes drive a per-host
//! state machine; crossing a threshold mutates the host's health flag and
//! notifies the cluster so its healthy vectors can be recomputed and
//! republished to workers.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use slog::{debug, o, warn, Logger};

use crate::config::HealthCheckConfig;
use crate::error::Error;
use crate::host::{health_flags, Host, HostHandle};
use crate::stats::{HealthCheckStats, StatsStore};

/// Performs one probe against one host. Implementations must not block
/// past the supplied timeout.
pub trait HealthCheckProbe: Send + Sync {
    fn probe(&self, host: &Arc<Host>, timeout: Duration) -> bool;
}

/// HTTP probe: HEAD request, any 2xx status passes.
pub struct HttpHealthCheckProbe {
    path: String,
}

impl HttpHealthCheckProbe {
    pub fn new(path: String) -> Self {
        HttpHealthCheckProbe { path }
    }
}

impl HealthCheckProbe for HttpHealthCheckProbe {
    fn probe(&self, host: &Arc<Host>, timeout: Duration) -> bool {
        let addr = host.address();
        let Ok(mut stream) = TcpStream::connect_timeout(&addr, timeout) else {
            return false;
        };
        let _ = stream.set_read_timeout(Some(timeout));
        let _ = stream.set_write_timeout(Some(timeout));
        let request = format!(
            "HEAD {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            self.path, addr
        );
        if stream.write_all(request.as_bytes()).is_err() {
            return false;
        }
        let mut status_line = String::new();
        if BufReader::new(stream).read_line(&mut status_line).is_err() {
            return false;
        }
        match status_line.split_whitespace().nth(1).map(str::parse::<u16>) {
            Some(Ok(code)) => (200..300).contains(&code),
            _ => false,
        }
    }
}

/// TCP probe: a successful connect passes, optionally after writing a
/// payload and matching a reply prefix.
pub struct TcpHealthCheckProbe {
    send: Option<Vec<u8>>,
    expect: Option<Vec<u8>>,
}

impl TcpHealthCheckProbe {
    pub fn new(send: Option<Vec<u8>>, expect: Option<Vec<u8>>) -> Self {
        TcpHealthCheckProbe { send, expect }
    }
}

impl HealthCheckProbe for TcpHealthCheckProbe {
    fn probe(&self, host: &Arc<Host>, timeout: Duration) -> bool {
        let addr = host.address();
        let Ok(mut stream) = TcpStream::connect_timeout(&addr, timeout) else {
            return false;
        };
        let _ = stream.set_read_timeout(Some(timeout));
        let _ = stream.set_write_timeout(Some(timeout));
        if let Some(send) = &self.send {
            if stream.write_all(send).is_err() {
                return false;
            }
        }
        if let Some(expect) = &self.expect {
            let mut reply = vec![0u8; expect.len()];
            if stream.read_exact(&mut reply).is_err() {
                return false;
            }
            return reply == *expect;
        }
        true
    }
}

/// Per-host probe state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HealthState {
    Unknown,
    Healthy,
    Failing,
    Unhealthy,
}

struct HostCheckEntry {
    state: HealthState,
    success_streak: u32,
    failure_streak: u32,
}

impl HostCheckEntry {
    fn new() -> Self {
        HostCheckEntry {
            state: HealthState::Unknown,
            success_streak: 0,
            failure_streak: 0,
        }
    }
}

struct CheckerState {
    hosts: HashMap<HostHandle, HostCheckEntry>,
    first_round_done: bool,
}

type StateChangeCb = Box<dyn Fn(Arc<Host>) + Send + Sync>;

pub struct HealthChecker {
    interval: chrono::Duration,
    timeout: Duration,
    unhealthy_threshold: u32,
    healthy_threshold: u32,
    probe: Arc<dyn HealthCheckProbe>,
    stats: HealthCheckStats,
    state: Mutex<CheckerState>,
    state_change_cb: Mutex<Option<StateChangeCb>>,
    first_round_cb: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    timer: Mutex<timer::Timer>,
    timer_guard: Mutex<Option<timer::Guard>>,
    log: Logger,
}

impl HealthChecker {
    /// Builds a checker from config. `probe_override` substitutes the real
    /// network probe, primarily for tests.
    pub fn new(
        cluster_name: &str,
        config: &HealthCheckConfig,
        probe_override: Option<Arc<dyn HealthCheckProbe>>,
        stats_store: &StatsStore,
        log: Logger,
    ) -> Result<Self, Error> {
        let probe: Arc<dyn HealthCheckProbe> = match probe_override {
            Some(probe) => probe,
            None => match config.check_type.as_str() {
                "http" => Arc::new(HttpHealthCheckProbe::new(
                    config.path.clone().unwrap_or_else(|| "/".to_string()),
                )),
                "tcp" => Arc::new(TcpHealthCheckProbe::new(
                    config.send.clone().map(String::into_bytes),
                    config.expect.clone().map(String::into_bytes),
                )),
                other => return Err(Error::UnknownHealthCheckType(other.to_string())),
            },
        };
        Ok(HealthChecker {
            interval: chrono::Duration::milliseconds(config.interval_ms as i64),
            timeout: Duration::from_millis(config.timeout_ms),
            unhealthy_threshold: config.unhealthy_threshold,
            healthy_threshold: config.healthy_threshold,
            probe,
            stats: HealthCheckStats::new(cluster_name, stats_store),
            state: Mutex::new(CheckerState {
                hosts: HashMap::new(),
                first_round_done: false,
            }),
            state_change_cb: Mutex::new(None),
            first_round_cb: Mutex::new(None),
            timer: Mutex::new(timer::Timer::new()),
            timer_guard: Mutex::new(None),
            log: log.new(o!("cluster" => cluster_name.to_string())),
        })
    }

    pub fn stats(&self) -> &HealthCheckStats {
        &self.stats
    }

    /// Registers the callback run when a host's active-check flag changes.
    pub fn set_state_change_cb(&self, cb: StateChangeCb) {
        *self.state_change_cb.lock().unwrap() = Some(cb);
    }

    /// Registers the callback run once, after the first full probe round.
    pub fn set_first_round_cb(&self, cb: Box<dyn FnOnce() + Send>) {
        *self.first_round_cb.lock().unwrap() = Some(cb);
    }

    /// Starts periodic probing. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.timer_guard.lock().unwrap();
        if guard.is_some() {
            return;
        }
        debug!(self.log, "starting health check task";
               "interval_ms" => self.interval.num_milliseconds());
        let weak: Weak<HealthChecker> = Arc::downgrade(self);
        let timer = self.timer.lock().unwrap();
        *guard = Some(timer.schedule_repeating(self.interval, move || {
            if let Some(checker) = weak.upgrade() {
                checker.run_round();
            }
        }));
    }

    pub fn stop(&self) {
        let _ = self.timer_guard.lock().unwrap().take();
    }

    /// Tracks membership changes so every current member is probed and no
    /// state is retained for departed hosts.
    pub fn on_membership_change(&self, hosts_added: &[Arc<Host>], hosts_removed: &[Arc<Host>]) {
        let mut state = self.state.lock().unwrap();
        for host in hosts_added {
            state
                .hosts
                .entry(HostHandle(host.clone()))
                .or_insert_with(HostCheckEntry::new);
        }
        for host in hosts_removed {
            state.hosts.remove(&HostHandle(host.clone()));
        }
    }

    /// Probes every tracked host once and applies threshold transitions.
    /// Called by the interval timer; exposed so tests can drive rounds
    /// deterministically.
    pub fn run_round(&self) {
        let hosts: Vec<Arc<Host>> = {
            let state = self.state.lock().unwrap();
            state.hosts.keys().map(|h| h.0.clone()).collect()
        };

        // Probing happens without any lock held; results are applied in a
        // second pass.
        let mut outcomes = Vec::with_capacity(hosts.len());
        for host in hosts {
            self.stats.attempt.inc();
            let passed = self.probe.probe(&host, self.timeout);
            if passed {
                self.stats.success.inc();
            } else {
                self.stats.failure.inc();
            }
            outcomes.push((host, passed));
        }

        let mut changed_hosts = Vec::new();
        let first_round_cb = {
            let mut state = self.state.lock().unwrap();
            for (host, passed) in outcomes {
                // The host may have been removed while we probed it.
                let Some(entry) = state.hosts.get_mut(&HostHandle(host.clone())) else {
                    continue;
                };
                if self.apply_outcome(&host, entry, passed) {
                    changed_hosts.push(host);
                }
            }
            if !state.first_round_done {
                state.first_round_done = true;
                self.first_round_cb.lock().unwrap().take()
            } else {
                None
            }
        };

        if !changed_hosts.is_empty() {
            let cb = self.state_change_cb.lock().unwrap();
            if let Some(cb) = cb.as_ref() {
                for host in changed_hosts {
                    cb(host);
                }
            }
        }
        if let Some(cb) = first_round_cb {
            cb();
        }
    }

    /// Returns the probe state for a host, if tracked.
    pub fn host_state(&self, host: &Arc<Host>) -> Option<HealthState> {
        let state = self.state.lock().unwrap();
        state.hosts.get(&HostHandle(host.clone())).map(|e| e.state)
    }

    // Applies one probe outcome; returns true when the host's flag changed.
    fn apply_outcome(&self, host: &Arc<Host>, entry: &mut HostCheckEntry, passed: bool) -> bool {
        if passed {
            entry.failure_streak = 0;
            entry.success_streak += 1;
        } else {
            entry.success_streak = 0;
            entry.failure_streak += 1;
        }

        let previous = entry.state;
        match entry.state {
            HealthState::Unknown => {
                if passed && entry.success_streak >= self.healthy_threshold {
                    entry.state = HealthState::Healthy;
                } else if !passed && entry.failure_streak >= self.unhealthy_threshold {
                    entry.state = HealthState::Unhealthy;
                }
            }
            HealthState::Healthy => {
                if !passed {
                    entry.state = if entry.failure_streak >= self.unhealthy_threshold {
                        HealthState::Unhealthy
                    } else {
                        HealthState::Failing
                    };
                }
            }
            HealthState::Failing => {
                if passed {
                    entry.state = HealthState::Healthy;
                } else if entry.failure_streak >= self.unhealthy_threshold {
                    entry.state = HealthState::Unhealthy;
                }
            }
            HealthState::Unhealthy => {
                if passed && entry.success_streak >= self.healthy_threshold {
                    entry.state = HealthState::Healthy;
                }
            }
        }

        if entry.state == previous {
            return false;
        }
        debug!(self.log, "health check state change";
               "host" => host.url(), "state" => format!("{:?}", entry.state));
        match entry.state {
            HealthState::Unhealthy => {
                if !host.set_health_flag(health_flags::FAILED_ACTIVE_HC) {
                    warn!(self.log, "host already marked failed"; "host" => host.url());
                    false
                } else {
                    true
                }
            }
            HealthState::Healthy => host.clear_health_flag(health_flags::FAILED_ACTIVE_HC),
            _ => false,
        }
    }
}
