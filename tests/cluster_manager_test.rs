// Copyright 2020 Joyent, Inc.

//! End-to-end exercises of the cluster manager: discovery, health flow,
//! outlier ejection, pool drain, initialization ordering, and protocol
//! selection, all against mock collaborators.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use slog::{o, Drain, Logger};

use cuemaster::cluster::{SdsFetcher, SdsHost, SdsHostTags};
use cuemaster::config::ClusterManagerConfig;
use cuemaster::conn_pool::{Priority, Protocol};
use cuemaster::error::Error;
use cuemaster::health_check::HealthCheckProbe;
use cuemaster::host::Host;
use cuemaster::manager::{ClusterManager, ClusterManagerOptions};
use cuemaster::resolver::DnsResolver;
use cuemaster::runtime::{StaticRuntime, TimeSource};

fn test_logger() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    )
}

type EventLog = Arc<Mutex<Vec<String>>>;

struct MockResolver {
    answers: Mutex<HashMap<String, Vec<IpAddr>>>,
    events: EventLog,
}

impl MockResolver {
    fn new(events: EventLog) -> Arc<Self> {
        Arc::new(MockResolver {
            answers: Mutex::new(HashMap::new()),
            events,
        })
    }

    fn set(&self, name: &str, addrs: &[&str]) {
        self.answers.lock().unwrap().insert(
            name.to_string(),
            addrs.iter().map(|a| a.parse().unwrap()).collect(),
        );
    }
}

impl DnsResolver for MockResolver {
    fn resolve(&self, name: &str) -> Result<Vec<IpAddr>, Error> {
        self.events.lock().unwrap().push(format!("resolve:{}", name));
        Ok(self
            .answers
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default())
    }
}

struct MockSdsFetcher {
    responses: Mutex<Vec<Vec<(String, u16)>>>,
    events: EventLog,
}

impl MockSdsFetcher {
    fn new(events: EventLog) -> Arc<Self> {
        Arc::new(MockSdsFetcher {
            responses: Mutex::new(Vec::new()),
            events,
        })
    }

    fn push(&self, addrs: &[(&str, u16)]) {
        self.responses.lock().unwrap().push(
            addrs
                .iter()
                .map(|(ip, port)| (ip.to_string(), *port))
                .collect(),
        );
    }
}

impl SdsFetcher for MockSdsFetcher {
    fn fetch(&self, service_name: &str) -> Result<Vec<SdsHost>, Error> {
        self.events
            .lock()
            .unwrap()
            .push(format!("fetch:{}", service_name));
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Err(Error::SdsFetch("no scripted response".to_string()));
        }
        Ok(responses
            .remove(0)
            .into_iter()
            .map(|(ip, port)| SdsHost {
                ip_address: ip,
                port,
                tags: SdsHostTags::default(),
            })
            .collect())
    }
}

struct ScriptedProbe {
    failing: Mutex<Vec<std::net::SocketAddr>>,
}

impl ScriptedProbe {
    fn new() -> Arc<Self> {
        Arc::new(ScriptedProbe {
            failing: Mutex::new(Vec::new()),
        })
    }

    fn fail(&self, addr: &str) {
        self.failing.lock().unwrap().push(addr.parse().unwrap());
    }
}

impl HealthCheckProbe for ScriptedProbe {
    fn probe(&self, host: &Arc<Host>, _timeout: Duration) -> bool {
        !self.failing.lock().unwrap().contains(&host.address())
    }
}

struct MockTime {
    now: Mutex<DateTime<Utc>>,
}

impl MockTime {
    fn new() -> Arc<Self> {
        Arc::new(MockTime {
            now: Mutex::new(Utc::now()),
        })
    }

    fn advance_ms(&self, millis: i64) {
        let mut now = self.now.lock().unwrap();
        *now = *now + chrono::Duration::milliseconds(millis);
    }
}

impl TimeSource for MockTime {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

fn single_worker_options() -> ClusterManagerOptions {
    ClusterManagerOptions {
        num_workers: 1,
        log: Some(test_logger()),
        ..Default::default()
    }
}

#[test]
fn static_round_robin_reuses_pools() {
    let config = ClusterManagerConfig::from_json(
        r#"{"clusters": [{
            "name": "c",
            "type": "static",
            "lb_type": "round_robin",
            "hosts": [{"url": "tcp://10.0.0.1:80"}, {"url": "tcp://10.0.0.2:80"}]
        }]}"#,
    )
    .unwrap();
    let mut manager = ClusterManager::new(&config, single_worker_options()).unwrap();

    let mut picks = Vec::new();
    for _ in 0..3 {
        let pool = manager
            .run_on_worker(0, |worker| worker.http_conn_pool("c", Priority::Default))
            .unwrap()
            .unwrap()
            .expect("a healthy host");
        picks.push(pool.host().address().to_string());
    }
    // A fixed cyclic permutation over both hosts.
    assert_ne!(picks[0], picks[1]);
    assert_eq!(picks[0], picks[2]);

    // Three lookups created exactly one pool per host.
    let containers = manager
        .run_on_worker(0, |worker| worker.num_conn_pool_containers())
        .unwrap();
    assert_eq!(containers, 2);
    manager.shutdown();
}

#[test]
fn failed_health_checks_remove_host_from_selection() {
    let probe = ScriptedProbe::new();
    probe.fail("10.0.0.2:80");
    let config = ClusterManagerConfig::from_json(
        r#"{"clusters": [{
            "name": "c",
            "type": "static",
            "hosts": [{"url": "tcp://10.0.0.1:80"}, {"url": "tcp://10.0.0.2:80"}],
            "health_check": {
                "type": "http",
                "interval_ms": 60000,
                "timeout_ms": 1000,
                "unhealthy_threshold": 3,
                "healthy_threshold": 2,
                "path": "/healthcheck"
            }
        }]}"#,
    )
    .unwrap();
    let options = ClusterManagerOptions {
        health_probe: Some(probe.clone()),
        ..single_worker_options()
    };
    let mut manager = ClusterManager::new(&config, options).unwrap();

    let checker = manager
        .cluster("c")
        .unwrap()
        .health_checker()
        .cloned()
        .unwrap();
    for _ in 0..3 {
        checker.run_round();
    }

    for _ in 0..1000 {
        let (_, host) = manager
            .run_on_worker(0, |worker| worker.tcp_conn("c"))
            .unwrap()
            .unwrap();
        assert_eq!(
            host.expect("a healthy host").address(),
            "10.0.0.1:80".parse().unwrap()
        );
    }
    manager.shutdown();
}

#[test]
fn consecutive_5xx_ejects_and_backoff_restores() {
    let time = MockTime::new();
    let event_log_path = std::env::temp_dir().join(format!(
        "cuemaster-outlier-{}.log",
        std::process::id()
    ));
    let config = ClusterManagerConfig::from_json(&format!(
        r#"{{"clusters": [{{
            "name": "c",
            "type": "static",
            "hosts": [
                {{"url": "tcp://10.0.0.1:80"}},
                {{"url": "tcp://10.0.0.2:80"}},
                {{"url": "tcp://10.0.0.3:80"}}
            ],
            "outlier_detection": {{}}
        }}],
        "outlier_detection": {{"event_log_path": {:?}}}}}"#,
        event_log_path.to_str().unwrap()
    ))
    .unwrap();
    let options = ClusterManagerOptions {
        time_source: Some(time.clone()),
        ..single_worker_options()
    };
    let mut manager = ClusterManager::new(&config, options).unwrap();

    let cluster = manager.cluster("c").unwrap().clone();
    let host_a = cluster
        .hosts()
        .iter()
        .find(|h| h.address() == "10.0.0.1:80".parse().unwrap())
        .cloned()
        .unwrap();

    for _ in 0..5 {
        host_a.outlier_sink().put_http_response_code(500);
    }
    let detector = cluster.outlier_detector().cloned().unwrap();
    assert_eq!(detector.stats().ejections_total.value(), 1);
    assert_eq!(detector.stats().ejections_active.value(), 1);
    assert!(!host_a.healthy());

    // Selection excludes the ejected host.
    for _ in 0..100 {
        let (_, host) = manager
            .run_on_worker(0, |worker| worker.tcp_conn("c"))
            .unwrap()
            .unwrap();
        assert_ne!(host.unwrap().address(), host_a.address());
    }

    // After the base ejection time, the sweep restores the host.
    time.advance_ms(30_001);
    detector.interval_sweep();
    assert!(host_a.healthy());
    assert_eq!(detector.stats().ejections_active.value(), 0);

    let mut seen_a = false;
    for _ in 0..100 {
        let (_, host) = manager
            .run_on_worker(0, |worker| worker.tcp_conn("c"))
            .unwrap()
            .unwrap();
        if host.unwrap().address() == host_a.address() {
            seen_a = true;
            break;
        }
    }
    assert!(seen_a);
    manager.shutdown();

    // The event log carries one eject and one uneject record.
    let log_contents = std::fs::read_to_string(&event_log_path).unwrap();
    let records: Vec<serde_json::Value> = log_contents
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["action"], "eject");
    assert_eq!(records[0]["cluster"], "c");
    assert_eq!(records[0]["upstream_url"], "tcp://10.0.0.1:80");
    assert_eq!(records[0]["type"], "consecutive_5xx");
    assert_eq!(records[0]["num_ejections"], 1);
    assert_eq!(records[1]["action"], "uneject");
    let _ = std::fs::remove_file(&event_log_path);
}

#[test]
fn removed_host_drains_pools_and_returns_as_new_identity() {
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let fetcher = MockSdsFetcher::new(events);
    fetcher.push(&[("10.0.0.1", 80)]);
    let config = ClusterManagerConfig::from_json(
        r#"{
            "clusters": [{"name": "q", "type": "sds"}],
            "sds": {
                "cluster": {
                    "name": "sds_backing",
                    "type": "static",
                    "hosts": [{"url": "tcp://127.0.0.1:8500"}]
                },
                "refresh_delay_ms": 3600000
            }
        }"#,
    )
    .unwrap();
    let options = ClusterManagerOptions {
        sds_fetcher: Some(fetcher.clone()),
        ..single_worker_options()
    };
    let mut manager = ClusterManager::new(&config, options).unwrap();

    let cluster = manager.cluster("q").unwrap().clone();
    assert!(cluster.is_initialized());
    let first_host = cluster.hosts().first().cloned().unwrap();

    // A pool with one in-flight stream.
    let pool = manager
        .run_on_worker(0, |worker| worker.http_conn_pool("q", Priority::Default))
        .unwrap()
        .unwrap()
        .unwrap();
    let stream = pool.new_stream();

    // Membership update removes the host; the container must survive
    // until the stream terminates.
    fetcher.push(&[]);
    cluster.refresh();
    assert_eq!(cluster.hosts().len(), 0);
    let host_probe = first_host.clone();
    let still_there = manager
        .run_on_worker(0, move |worker| worker.has_conn_pools_for(&host_probe))
        .unwrap();
    assert!(still_there);

    // Stream completion lets the drain finish and the container go.
    stream.complete();
    let host_probe = first_host.clone();
    let still_there = manager
        .run_on_worker(0, move |worker| worker.has_conn_pools_for(&host_probe))
        .unwrap();
    assert!(!still_there);

    // The address comes back as a brand new host with a fresh container.
    fetcher.push(&[("10.0.0.1", 80)]);
    cluster.refresh();
    let second_host = cluster.hosts().first().cloned().unwrap();
    assert_eq!(first_host.address(), second_host.address());
    assert!(!Arc::ptr_eq(&first_host, &second_host));

    let pool = manager
        .run_on_worker(0, |worker| worker.http_conn_pool("q", Priority::Default))
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(Arc::ptr_eq(pool.host(), &second_host));
    manager.shutdown();
}

#[test]
fn sds_clusters_initialize_only_after_all_others() {
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let resolver = MockResolver::new(events.clone());
    resolver.set("discovery.test", &["127.0.0.1"]);
    let fetcher = MockSdsFetcher::new(events.clone());
    fetcher.push(&[("10.0.0.1", 80)]);

    let config = ClusterManagerConfig::from_json(
        r#"{
            "clusters": [
                {"name": "s", "type": "static", "hosts": [{"url": "tcp://10.1.0.1:80"}]},
                {"name": "q", "type": "sds"}
            ],
            "sds": {
                "cluster": {
                    "name": "d",
                    "type": "strict_dns",
                    "hosts": [{"url": "tcp://discovery.test:8500"}],
                    "dns_refresh_rate_ms": 3600000
                },
                "refresh_delay_ms": 3600000
            }
        }"#,
    )
    .unwrap();
    let options = ClusterManagerOptions {
        dns_resolver: Some(resolver),
        sds_fetcher: Some(fetcher),
        ..single_worker_options()
    };
    let mut manager = ClusterManager::new(&config, options).unwrap();

    let initialized = Arc::new(AtomicUsize::new(0));
    let initialized_clone = initialized.clone();
    let events_clone = events.clone();
    manager.set_initialized_callback(move || {
        initialized_clone.fetch_add(1, Ordering::SeqCst);
        events_clone.lock().unwrap().push("initialized".to_string());
    });

    assert_eq!(initialized.load(Ordering::SeqCst), 1);
    assert!(manager.cluster("q").unwrap().is_initialized());
    assert_eq!(manager.cluster("q").unwrap().hosts().len(), 1);

    // The discovery cluster resolves before the SDS fetch, and the
    // overall initialized callback comes last.
    let log = events.lock().unwrap().clone();
    let resolve_at = log.iter().position(|e| e == "resolve:discovery.test").unwrap();
    let fetch_at = log.iter().position(|e| e == "fetch:q").unwrap();
    let init_at = log.iter().position(|e| e == "initialized").unwrap();
    assert!(resolve_at < fetch_at);
    assert!(fetch_at < init_at);
    assert_eq!(log.iter().filter(|e| *e == "fetch:q").count(), 1);
    manager.shutdown();
}

#[test]
fn http2_feature_selects_pool_protocol_by_runtime_roll() {
    let config = ClusterManagerConfig::from_json(
        r#"{"clusters": [{
            "name": "c",
            "type": "static",
            "features": ["http2"],
            "hosts": [{"url": "tcp://10.0.0.1:80"}]
        }]}"#,
    )
    .unwrap();

    let runtime = Arc::new(StaticRuntime::new());
    runtime.set("upstream.use_http2", 100);
    let options = ClusterManagerOptions {
        runtime: Some(runtime),
        ..single_worker_options()
    };
    let mut manager = ClusterManager::new(&config, options).unwrap();
    let pool = manager
        .run_on_worker(0, |worker| worker.http_conn_pool("c", Priority::Default))
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(pool.protocol(), Protocol::Http2);
    manager.shutdown();

    let runtime = Arc::new(StaticRuntime::new());
    runtime.set("upstream.use_http2", 0);
    let options = ClusterManagerOptions {
        runtime: Some(runtime),
        ..single_worker_options()
    };
    let mut manager = ClusterManager::new(&config, options).unwrap();
    let pool = manager
        .run_on_worker(0, |worker| worker.http_conn_pool("c", Priority::Default))
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(pool.protocol(), Protocol::Http1);
    manager.shutdown();
}

#[test]
fn empty_cluster_counts_each_failed_selection_once() {
    let config = ClusterManagerConfig::from_json(
        r#"{"clusters": [{"name": "c", "type": "static", "hosts": []}]}"#,
    )
    .unwrap();
    let mut manager = ClusterManager::new(&config, single_worker_options()).unwrap();
    for expected in 1..=3u64 {
        let pool = manager
            .run_on_worker(0, |worker| worker.http_conn_pool("c", Priority::Default))
            .unwrap()
            .unwrap();
        assert!(pool.is_none());
        assert_eq!(
            manager.get("c").unwrap().stats().upstream_cx_none_healthy.value(),
            expected
        );
    }
    manager.shutdown();
}

#[test]
fn unknown_cluster_fails_the_single_request() {
    let config = ClusterManagerConfig::from_json(
        r#"{"clusters": [{"name": "c", "type": "static", "hosts": [{"url": "tcp://10.0.0.1:80"}]}]}"#,
    )
    .unwrap();
    let mut manager = ClusterManager::new(&config, single_worker_options()).unwrap();
    let result = manager
        .run_on_worker(0, |worker| worker.http_conn_pool("ghost", Priority::Default))
        .unwrap();
    assert!(matches!(result, Err(Error::UnknownCluster(_))));
    let result = manager
        .run_on_worker(0, |worker| {
            worker.http_async_client("ghost").map(|_| ())
        })
        .unwrap();
    assert!(matches!(result, Err(Error::UnknownCluster(_))));
    manager.shutdown();
}

#[test]
fn worker_replicas_track_primary_snapshots_exactly() {
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let fetcher = MockSdsFetcher::new(events);
    fetcher.push(&[("10.0.0.1", 80), ("10.0.0.2", 80)]);
    let config = ClusterManagerConfig::from_json(
        r#"{
            "clusters": [{"name": "q", "type": "sds"}],
            "sds": {
                "cluster": {
                    "name": "sds_backing",
                    "type": "static",
                    "hosts": [{"url": "tcp://127.0.0.1:8500"}]
                },
                "refresh_delay_ms": 3600000
            }
        }"#,
    )
    .unwrap();
    let options = ClusterManagerOptions {
        num_workers: 2,
        sds_fetcher: Some(fetcher.clone()),
        log: Some(test_logger()),
        ..Default::default()
    };
    let mut manager = ClusterManager::new(&config, options).unwrap();

    fetcher.push(&[("10.0.0.2", 80), ("10.0.0.3", 80)]);
    manager.cluster("q").unwrap().refresh();

    let primary_hosts = manager.cluster("q").unwrap().hosts();
    for worker_id in 0..manager.num_workers() {
        let primary = primary_hosts.clone();
        let matches = manager
            .run_on_worker(worker_id, move |worker| {
                worker
                    .with_cluster_hosts("q", |hs| {
                        // The replica holds the very snapshot the primary
                        // published, and its projections are consistent.
                        Arc::ptr_eq(hs.hosts(), &primary)
                            && hs.healthy_hosts().iter().all(|h| {
                                hs.hosts().iter().any(|full| Arc::ptr_eq(full, h))
                            })
                            && hs.hosts_per_zone().iter().map(|z| z.len()).sum::<usize>()
                                == hs.hosts().len()
                    })
                    .unwrap()
            })
            .unwrap();
        assert!(matches, "worker {} replica out of sync", worker_id);
    }
    manager.shutdown();
}
