// Copyright 2020 Joyent, Inc.

//! Clusters: named pools of upstream hosts with a discovery policy.
//!
//! The primary owns one `Cluster` per configured pool. A cluster's
//! discovery driver (static, strict DNS, logical DNS, or SDS) produces
//! candidate membership; `ClusterCore::apply_membership` diffs it against
//! the current view by host identity, rebuilds the healthy and per-zone
//! projections, and notifies subscribers. The health checker, the outlier
//! detector, and the manager's worker fan-out all hang off the same
//! member-update callback list.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration as StdDuration;

use backoff::{ExponentialBackoff, Operation};
use serde::Deserialize;
use slog::{debug, info, o, warn, Logger};

use crate::config::{address_from_url, dns_target_from_url, ClusterConfig};
use crate::error::Error;
use crate::health_check::{HealthCheckProbe, HealthChecker};
use crate::host::{partition_by_zone, Host, HostHandle, HostSet, HostVec, MemberUpdateCb};
use crate::load_balancer::LoadBalancerType;
use crate::outlier::{Detector, EventLogger};
use crate::resolver::DnsResolver;
use crate::runtime::{Runtime, TimeSource};
use crate::ssl::{ClientSslContext, SslContextManager};
use crate::stats::{ClusterStats, StatsStore};

/// Cluster feature bits.
pub mod features {
    /// Upstream members speak HTTP/2.
    pub const HTTP2: u64 = 0x1;
}

// Bound on per-tick retries against a failing DNS server; the refresh
// timer provides the long-term retry loop.
const DNS_RETRY_MAX_ELAPSED: StdDuration = StdDuration::from_secs(5);

/// Immutable description of a cluster, shared by the primary, every
/// worker, and every host the cluster creates.
#[derive(Debug)]
pub struct ClusterInfo {
    name: String,
    lb_type: LoadBalancerType,
    features: u64,
    stats: ClusterStats,
    ssl_context: Option<Arc<ClientSslContext>>,
}

impl ClusterInfo {
    pub fn new(
        name: String,
        lb_type: LoadBalancerType,
        features: u64,
        ssl_context: Option<Arc<ClientSslContext>>,
        stats_store: &StatsStore,
    ) -> Arc<Self> {
        let stats = ClusterStats::new(&name, stats_store);
        Arc::new(ClusterInfo {
            name,
            lb_type,
            features,
            stats,
            ssl_context,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lb_type(&self) -> LoadBalancerType {
        self.lb_type
    }

    pub fn features(&self) -> u64 {
        self.features
    }

    pub fn has_http2_feature(&self) -> bool {
        self.features & features::HTTP2 != 0
    }

    pub fn stats(&self) -> &ClusterStats {
        &self.stats
    }

    pub fn ssl_context(&self) -> Option<&Arc<ClientSslContext>> {
        self.ssl_context.as_ref()
    }
}

/// One membership entry from a discovery service response.
#[derive(Clone, Debug, Deserialize)]
pub struct SdsHost {
    pub ip_address: String,
    pub port: u16,
    #[serde(default)]
    pub tags: SdsHostTags,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SdsHostTags {
    pub az: Option<String>,
}

#[derive(Deserialize)]
struct SdsResponse {
    hosts: Vec<SdsHost>,
}

/// Fetches the membership of a service from a discovery service.
pub trait SdsFetcher: Send + Sync {
    fn fetch(&self, service_name: &str) -> Result<Vec<SdsHost>, Error>;
}

/// Fetcher speaking the REST registration protocol through the configured
/// discovery cluster. The discovery cluster must have resolved before the
/// first fetch, which is exactly what the manager's initialization
/// ordering guarantees.
pub struct RestSdsFetcher {
    discovery: Mutex<Weak<Cluster>>,
    timeout: StdDuration,
}

impl RestSdsFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(RestSdsFetcher {
            discovery: Mutex::new(Weak::new()),
            timeout: StdDuration::from_secs(5),
        })
    }

    /// Points the fetcher at the discovery cluster it should query.
    pub fn set_discovery_cluster(&self, cluster: &Arc<Cluster>) {
        *self.discovery.lock().unwrap() = Arc::downgrade(cluster);
    }
}

impl SdsFetcher for RestSdsFetcher {
    fn fetch(&self, service_name: &str) -> Result<Vec<SdsHost>, Error> {
        let cluster = self
            .discovery
            .lock()
            .unwrap()
            .upgrade()
            .ok_or_else(|| Error::SdsFetch("discovery cluster unavailable".to_string()))?;
        let healthy = cluster.healthy_hosts();
        let all = cluster.hosts();
        let host = healthy
            .first()
            .or_else(|| all.first())
            .ok_or_else(|| Error::SdsFetch("discovery cluster has no hosts".to_string()))?;
        let address = host.address();

        let mut stream = TcpStream::connect_timeout(&address, self.timeout)
            .map_err(|e| Error::SdsFetch(e.to_string()))?;
        let _ = stream.set_read_timeout(Some(self.timeout));
        let _ = stream.set_write_timeout(Some(self.timeout));
        let request = format!(
            "GET /v1/registration/{} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            service_name, address
        );
        stream
            .write_all(request.as_bytes())
            .map_err(|e| Error::SdsFetch(e.to_string()))?;
        let mut response = String::new();
        stream
            .read_to_string(&mut response)
            .map_err(|e| Error::SdsFetch(e.to_string()))?;
        let (status_line, _) = response
            .split_once("\r\n")
            .ok_or_else(|| Error::SdsFetch("short response".to_string()))?;
        if status_line.split_whitespace().nth(1) != Some("200") {
            return Err(Error::SdsFetch(format!("bad status: {}", status_line)));
        }
        let body = response
            .split_once("\r\n\r\n")
            .map(|(_, body)| body)
            .unwrap_or("");
        let parsed: SdsResponse =
            serde_json::from_str(body).map_err(|e| Error::SdsFetch(e.to_string()))?;
        Ok(parsed.hosts)
    }
}

/// State shared between a cluster's discovery driver, its health checker
/// and outlier detector, and the manager.
pub struct ClusterCore {
    info: Arc<ClusterInfo>,
    local_zone: String,
    hosts: Mutex<HostSet>,
    initialized: AtomicBool,
    initialized_cb: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    log: Logger,
}

impl ClusterCore {
    fn new(info: Arc<ClusterInfo>, local_zone: String, log: Logger) -> Arc<Self> {
        Arc::new(ClusterCore {
            info,
            local_zone,
            hosts: Mutex::new(HostSet::new()),
            initialized: AtomicBool::new(false),
            initialized_cb: Mutex::new(None),
            log,
        })
    }

    pub fn info(&self) -> &Arc<ClusterInfo> {
        &self.info
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub(crate) fn set_initialized_cb(&self, cb: Box<dyn FnOnce() + Send>) {
        *self.initialized_cb.lock().unwrap() = Some(cb);
    }

    pub(crate) fn mark_initialized(&self) {
        if !self.initialized.swap(true, Ordering::SeqCst) {
            debug!(self.log, "cluster initialized");
            let cb = self.initialized_cb.lock().unwrap().take();
            if let Some(cb) = cb {
                cb();
            }
        }
    }

    pub fn add_member_update_cb(&self, cb: MemberUpdateCb) {
        self.hosts.lock().unwrap().add_member_update_cb(cb);
    }

    /// Runs a closure against the current host set under its lock.
    pub fn with_host_set<T>(&self, f: impl FnOnce(&HostSet) -> T) -> T {
        f(&self.hosts.lock().unwrap())
    }

    fn current_hosts_by_addr(&self) -> HashMap<SocketAddr, Arc<Host>> {
        self.hosts
            .lock()
            .unwrap()
            .hosts()
            .iter()
            .map(|h| (h.address(), h.clone()))
            .collect()
    }

    /// Replaces membership with the given host list. Hosts are diffed by
    /// identity; when nothing was added or removed the update is dropped
    /// entirely, so re-applying identical discovery output never
    /// republishes.
    pub(crate) fn apply_membership(&self, new_hosts: HostVec) {
        let mut host_set = self.hosts.lock().unwrap();
        let current: HashSet<HostHandle> =
            host_set.hosts().iter().cloned().map(HostHandle).collect();
        let next: HashSet<HostHandle> = new_hosts.iter().cloned().map(HostHandle).collect();
        let added: HostVec = new_hosts
            .iter()
            .filter(|h| !current.contains(&HostHandle((*h).clone())))
            .cloned()
            .collect();
        let removed: HostVec = host_set
            .hosts()
            .iter()
            .filter(|h| !next.contains(&HostHandle((*h).clone())))
            .cloned()
            .collect();
        if added.is_empty() && removed.is_empty() {
            return;
        }
        info!(self.log, "cluster membership update";
              "total" => new_hosts.len(),
              "added" => added.len(),
              "removed" => removed.len());
        let healthy: HostVec = new_hosts.iter().filter(|h| h.healthy()).cloned().collect();
        let hosts_per_zone = partition_by_zone(&new_hosts, &self.local_zone);
        let healthy_per_zone = partition_by_zone(&healthy, &self.local_zone);
        host_set.update_hosts(
            Arc::new(new_hosts),
            Arc::new(healthy),
            Arc::new(hosts_per_zone),
            Arc::new(healthy_per_zone),
            added,
            removed,
        );
    }

    /// Rebuilds the healthy projections after a health flag changed and
    /// republishes with an empty membership delta.
    pub(crate) fn recompute_healthy(&self) {
        let mut host_set = self.hosts.lock().unwrap();
        let full = host_set.hosts().clone();
        let healthy: HostVec = full.iter().filter(|h| h.healthy()).cloned().collect();
        let healthy_per_zone = partition_by_zone(&healthy, &self.local_zone);
        let hosts_per_zone = host_set.hosts_per_zone().clone();
        host_set.update_hosts(
            full,
            Arc::new(healthy),
            hosts_per_zone,
            Arc::new(healthy_per_zone),
            Vec::new(),
            Vec::new(),
        );
    }
}

// Discovery policy and its driver-local state.
enum Driver {
    Static {
        entries: Vec<(SocketAddr, String)>,
    },
    StrictDns {
        targets: Vec<(String, u16)>,
        resolver: Arc<dyn DnsResolver>,
        last_resolved: Mutex<HashMap<String, Vec<SocketAddr>>>,
    },
    LogicalDns {
        name: String,
        port: u16,
        resolver: Arc<dyn DnsResolver>,
        logical_host: Mutex<Option<Arc<Host>>>,
        resolving: AtomicBool,
    },
    Sds {
        service_name: String,
        fetcher: Arc<dyn SdsFetcher>,
        started: AtomicBool,
    },
}

/// Dependencies shared by all clusters, assembled by the manager.
pub(crate) struct ClusterDeps {
    pub stats: StatsStore,
    pub runtime: Arc<dyn Runtime>,
    pub time_source: Arc<dyn TimeSource>,
    pub dns_resolver: Arc<dyn DnsResolver>,
    pub sds_fetcher: Option<Arc<dyn SdsFetcher>>,
    pub ssl_context_manager: Arc<dyn SslContextManager>,
    pub health_probe: Option<Arc<dyn HealthCheckProbe>>,
    pub outlier_event_logger: Option<Arc<EventLogger>>,
    pub local_zone: String,
    pub log: Logger,
}

/// One configured upstream cluster, owned by the primary.
pub struct Cluster {
    core: Arc<ClusterCore>,
    health_checker: Option<Arc<HealthChecker>>,
    outlier_detector: Option<Arc<Detector>>,
    driver: Driver,
    refresh_interval: chrono::Duration,
    timer: Mutex<timer::Timer>,
    timer_guard: Mutex<Option<timer::Guard>>,
    log: Logger,
}

impl Cluster {
    /// Builds a cluster from its configuration. `sds_refresh_ms` carries
    /// the manager-wide SDS settings and must be present for sds clusters.
    pub(crate) fn from_config(
        config: &ClusterConfig,
        sds_refresh_ms: Option<u64>,
        deps: &ClusterDeps,
    ) -> Result<Arc<Cluster>, Error> {
        let lb_type = LoadBalancerType::from_config(&config.lb_type)?;
        let mut feature_bits = 0u64;
        if config.features.iter().any(|f| f == "http2") {
            feature_bits |= features::HTTP2;
        }
        let ssl_context = config
            .ssl_context
            .as_ref()
            .map(|c| deps.ssl_context_manager.create_client_context(c));
        let info = ClusterInfo::new(
            config.name.clone(),
            lb_type,
            feature_bits,
            ssl_context,
            &deps.stats,
        );
        let log = deps.log.new(o!("cluster" => config.name.clone()));
        let core = ClusterCore::new(info.clone(), deps.local_zone.clone(), log.clone());

        let outlier_detector = if config.outlier_detection.is_some() {
            let detector = Detector::new(
                &config.name,
                deps.runtime.clone(),
                deps.time_source.clone(),
                &deps.stats,
                deps.outlier_event_logger.clone(),
                deps.log.clone(),
            );
            let sync = detector.clone();
            core.add_member_update_cb(Box::new(move |_, added, removed| {
                sync.on_membership_change(added, removed);
            }));
            let weak_core = Arc::downgrade(&core);
            detector.add_changed_state_cb(Box::new(move |_| {
                if let Some(core) = weak_core.upgrade() {
                    core.recompute_healthy();
                }
            }));
            Some(detector)
        } else {
            None
        };

        let health_checker = match &config.health_check {
            Some(hc_config) => {
                let checker = Arc::new(HealthChecker::new(
                    &config.name,
                    hc_config,
                    deps.health_probe.clone(),
                    &deps.stats,
                    deps.log.clone(),
                )?);
                let sync = checker.clone();
                core.add_member_update_cb(Box::new(move |_, added, removed| {
                    sync.on_membership_change(added, removed);
                }));
                let weak_core = Arc::downgrade(&core);
                checker.set_state_change_cb(Box::new(move |_| {
                    if let Some(core) = weak_core.upgrade() {
                        core.recompute_healthy();
                    }
                }));
                let weak_core = Arc::downgrade(&core);
                checker.set_first_round_cb(Box::new(move || {
                    if let Some(core) = weak_core.upgrade() {
                        core.mark_initialized();
                    }
                }));
                Some(checker)
            }
            None => None,
        };

        let (driver, refresh_interval) = match config.cluster_type.as_str() {
            "static" => {
                let mut entries = Vec::with_capacity(config.hosts.len());
                for host in &config.hosts {
                    entries.push((
                        address_from_url(&host.url)?,
                        host.zone.clone().unwrap_or_default(),
                    ));
                }
                (Driver::Static { entries }, chrono::Duration::zero())
            }
            "strict_dns" => {
                let mut targets = Vec::with_capacity(config.hosts.len());
                for host in &config.hosts {
                    targets.push(dns_target_from_url(&host.url)?);
                }
                (
                    Driver::StrictDns {
                        targets,
                        resolver: deps.dns_resolver.clone(),
                        last_resolved: Mutex::new(HashMap::new()),
                    },
                    chrono::Duration::milliseconds(config.dns_refresh_rate_ms as i64),
                )
            }
            "logical_dns" => {
                if config.hosts.len() != 1 {
                    return Err(Error::InvalidConfig(format!(
                        "logical dns cluster '{}' must have exactly one host",
                        config.name
                    )));
                }
                let (name, port) = dns_target_from_url(&config.hosts[0].url)?;
                (
                    Driver::LogicalDns {
                        name,
                        port,
                        resolver: deps.dns_resolver.clone(),
                        logical_host: Mutex::new(None),
                        resolving: AtomicBool::new(false),
                    },
                    chrono::Duration::milliseconds(config.dns_refresh_rate_ms as i64),
                )
            }
            "sds" => {
                let refresh_ms = sds_refresh_ms.ok_or(Error::NoSdsConfig)?;
                let fetcher = deps.sds_fetcher.clone().ok_or_else(|| {
                    Error::InvalidConfig("no sds fetcher available".to_string())
                })?;
                (
                    Driver::Sds {
                        service_name: config
                            .service_name
                            .clone()
                            .unwrap_or_else(|| config.name.clone()),
                        fetcher,
                        started: AtomicBool::new(false),
                    },
                    chrono::Duration::milliseconds(refresh_ms as i64),
                )
            }
            other => return Err(Error::UnknownClusterType(other.to_string())),
        };

        Ok(Arc::new(Cluster {
            core,
            health_checker,
            outlier_detector,
            driver,
            refresh_interval,
            timer: Mutex::new(timer::Timer::new()),
            timer_guard: Mutex::new(None),
            log,
        }))
    }

    pub fn info(&self) -> &Arc<ClusterInfo> {
        self.core.info()
    }

    pub fn name(&self) -> &str {
        self.core.info().name()
    }

    pub fn is_initialized(&self) -> bool {
        self.core.is_initialized()
    }

    pub fn health_checker(&self) -> Option<&Arc<HealthChecker>> {
        self.health_checker.as_ref()
    }

    pub fn outlier_detector(&self) -> Option<&Arc<Detector>> {
        self.outlier_detector.as_ref()
    }

    pub fn hosts(&self) -> Arc<HostVec> {
        self.core.with_host_set(|hs| hs.hosts().clone())
    }

    pub fn healthy_hosts(&self) -> Arc<HostVec> {
        self.core.with_host_set(|hs| hs.healthy_hosts().clone())
    }

    /// Subscribes to membership updates of the primary host set.
    pub fn add_member_update_cb(&self, cb: MemberUpdateCb) {
        self.core.add_member_update_cb(cb);
    }

    pub(crate) fn set_initialized_cb(&self, cb: Box<dyn FnOnce() + Send>) {
        self.core.set_initialized_cb(cb);
    }

    pub(crate) fn is_sds(&self) -> bool {
        matches!(self.driver, Driver::Sds { .. })
    }

    /// Starts discovery for non-SDS clusters. SDS clusters wait for
    /// [`Cluster::initialize`], which the manager calls once every other
    /// cluster has finished its first resolution.
    pub(crate) fn start(self: &Arc<Self>) {
        if self.is_sds() {
            return;
        }
        if let Some(detector) = &self.outlier_detector {
            detector.start();
        }
        self.refresh();
        if !matches!(self.driver, Driver::Static { .. }) {
            self.arm_refresh_timer();
        }
    }

    /// Begins SDS discovery. No-op for other cluster types and on repeat
    /// calls.
    pub(crate) fn initialize(self: &Arc<Self>) {
        let Driver::Sds { started, .. } = &self.driver else {
            return;
        };
        if started.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(detector) = &self.outlier_detector {
            detector.start();
        }
        self.refresh();
        self.arm_refresh_timer();
    }

    pub(crate) fn stop(&self) {
        let _ = self.timer_guard.lock().unwrap().take();
        if let Some(checker) = &self.health_checker {
            checker.stop();
        }
        if let Some(detector) = &self.outlier_detector {
            detector.stop();
        }
    }

    fn arm_refresh_timer(self: &Arc<Self>) {
        let weak: Weak<Cluster> = Arc::downgrade(self);
        let timer = self.timer.lock().unwrap();
        *self.timer_guard.lock().unwrap() =
            Some(timer.schedule_repeating(self.refresh_interval, move || {
                if let Some(cluster) = weak.upgrade() {
                    cluster.refresh();
                }
            }));
    }

    /// Runs one discovery iteration. Called by the refresh timer; public
    /// so callers with out-of-band knowledge (and tests) can force one.
    pub fn refresh(&self) {
        match &self.driver {
            Driver::Static { entries } => {
                let current = self.core.current_hosts_by_addr();
                let hosts: HostVec = entries
                    .iter()
                    .map(|(addr, zone)| self.member_for(&current, *addr, zone))
                    .collect();
                self.core.apply_membership(hosts);
            }
            Driver::StrictDns {
                targets,
                resolver,
                last_resolved,
            } => {
                let current = self.core.current_hosts_by_addr();
                let mut seen: HashSet<SocketAddr> = HashSet::new();
                let mut hosts: HostVec = Vec::new();
                for (name, port) in targets {
                    let addrs = match self.resolve_with_retry(resolver.as_ref(), name) {
                        Ok(addrs) => {
                            let addrs: Vec<SocketAddr> = addrs
                                .into_iter()
                                .map(|ip| SocketAddr::new(ip, *port))
                                .collect();
                            last_resolved
                                .lock()
                                .unwrap()
                                .insert(name.clone(), addrs.clone());
                            addrs
                        }
                        Err(e) => {
                            // Transient failure: hold the previous answer
                            // for this name until the next refresh.
                            warn!(self.log, "dns refresh failed";
                                  "name" => name.as_str(), "error" => e.to_string());
                            last_resolved
                                .lock()
                                .unwrap()
                                .get(name)
                                .cloned()
                                .unwrap_or_default()
                        }
                    };
                    for addr in addrs {
                        if seen.insert(addr) {
                            hosts.push(self.member_for(&current, addr, ""));
                        }
                    }
                }
                self.core.apply_membership(hosts);
            }
            Driver::LogicalDns {
                name,
                port,
                resolver,
                logical_host,
                resolving,
            } => {
                // At most one resolution in flight.
                if resolving.swap(true, Ordering::SeqCst) {
                    return;
                }
                match self.resolve_with_retry(resolver.as_ref(), name) {
                    Ok(addrs) if !addrs.is_empty() => {
                        let address = SocketAddr::new(addrs[0], *port);
                        let mut slot = logical_host.lock().unwrap();
                        match slot.take() {
                            Some(host) => {
                                host.set_address(address);
                                *slot = Some(host);
                            }
                            None => {
                                let host = Host::new(
                                    self.core.info().clone(),
                                    format!("tcp://{}:{}", name, port),
                                    address,
                                    String::new(),
                                    HashMap::new(),
                                    self.outlier_detector.as_ref(),
                                );
                                *slot = Some(host.clone());
                                drop(slot);
                                self.core.apply_membership(vec![host]);
                            }
                        }
                    }
                    Ok(_) => {
                        warn!(self.log, "dns refresh returned no addresses"; "name" => name.as_str());
                    }
                    Err(e) => {
                        warn!(self.log, "dns refresh failed";
                              "name" => name.as_str(), "error" => e.to_string());
                    }
                }
                resolving.store(false, Ordering::SeqCst);
            }
            Driver::Sds {
                service_name,
                fetcher,
                started,
            } => {
                if !started.load(Ordering::SeqCst) {
                    return;
                }
                match fetcher.fetch(service_name) {
                    Ok(sds_hosts) => {
                        let current = self.core.current_hosts_by_addr();
                        let mut seen: HashSet<SocketAddr> = HashSet::new();
                        let mut hosts: HostVec = Vec::new();
                        for sds_host in &sds_hosts {
                            let Ok(ip) = sds_host.ip_address.parse() else {
                                warn!(self.log, "sds returned unparseable address";
                                      "address" => sds_host.ip_address.as_str());
                                continue;
                            };
                            let addr = SocketAddr::new(ip, sds_host.port);
                            if seen.insert(addr) {
                                hosts.push(self.member_for(
                                    &current,
                                    addr,
                                    sds_host.tags.az.as_deref().unwrap_or(""),
                                ));
                            }
                        }
                        self.core.apply_membership(hosts);
                    }
                    Err(e) => {
                        // Keep previous membership; the refresh timer will
                        // try again.
                        warn!(self.log, "sds refresh failed"; "error" => e.to_string());
                    }
                }
            }
        }
        self.on_discovery_complete();
    }

    // A host for the given address: the existing member when the address
    // is already present, a brand new identity otherwise.
    fn member_for(
        &self,
        current: &HashMap<SocketAddr, Arc<Host>>,
        addr: SocketAddr,
        zone: &str,
    ) -> Arc<Host> {
        if let Some(existing) = current.get(&addr) {
            return existing.clone();
        }
        Host::new(
            self.core.info().clone(),
            format!("tcp://{}", addr),
            addr,
            zone.to_string(),
            HashMap::new(),
            self.outlier_detector.as_ref(),
        )
    }

    fn resolve_with_retry(
        &self,
        resolver: &dyn DnsResolver,
        name: &str,
    ) -> Result<Vec<std::net::IpAddr>, Error> {
        let mut backoff = ExponentialBackoff {
            max_elapsed_time: Some(DNS_RETRY_MAX_ELAPSED),
            ..Default::default()
        };
        let log = &self.log;
        let mut op = || {
            resolver.resolve(name).map_err(|e| {
                debug!(log, "retrying dns resolution"; "name" => name, "error" => e.to_string());
                backoff::Error::Transient(e)
            })
        };
        op.retry(&mut backoff).map_err(|e| match e {
            backoff::Error::Transient(e) | backoff::Error::Permanent(e) => e,
        })
    }

    fn on_discovery_complete(&self) {
        if self.core.is_initialized() {
            return;
        }
        match &self.health_checker {
            // With an active checker, first-round completion finishes
            // initialization so the manager never reports ready while
            // every member is still unprobed.
            Some(checker) => checker.start(),
            None => self.core.mark_initialized(),
        }
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("name", &self.core.info().name())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
