// Copyright 2020 Joyent, Inc.

//! Host identity and cluster membership views.
//!
//! A `Host` is one backend endpoint. Hosts are identity objects: when an
//! address disappears from a cluster and later reappears, a brand new
//! `Host` is allocated, so any map keyed by [`HostHandle`] can never alias
//! a stale entry onto a fresh member. A `HostSet` is the membership of one
//! cluster as seen by one observer (the primary or a single worker), with
//! healthy-only and per-zone projections maintained alongside the full
//! vector.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::cluster::ClusterInfo;
use crate::outlier::DetectorHostSink;
use crate::stats::HostStats;

/// Health flag bits. A host is selectable when no flag is set.
pub mod health_flags {
    /// The active health checker has marked the host down.
    pub const FAILED_ACTIVE_HC: u32 = 0x1;
    /// The outlier detector has ejected the host.
    pub const FAILED_OUTLIER_CHECK: u32 = 0x2;
}

/// One backend endpoint.
#[derive(Debug)]
pub struct Host {
    cluster: Arc<ClusterInfo>,
    url: String,
    // Interior mutability is for the logical DNS variant, where one
    // long-lived host tracks whatever address the name currently resolves
    // to. Every other variant sets the address once.
    address: Mutex<SocketAddr>,
    zone: String,
    metadata: HashMap<String, String>,
    health_flags: AtomicU32,
    stats: HostStats,
    outlier_sink: Arc<DetectorHostSink>,
}

impl Host {
    pub fn new(
        cluster: Arc<ClusterInfo>,
        url: String,
        address: SocketAddr,
        zone: String,
        metadata: HashMap<String, String>,
        detector: Option<&Arc<crate::outlier::Detector>>,
    ) -> Arc<Host> {
        Arc::new_cyclic(|weak_host| Host {
            cluster,
            url,
            address: Mutex::new(address),
            zone,
            metadata,
            health_flags: AtomicU32::new(0),
            stats: HostStats::default(),
            outlier_sink: DetectorHostSink::new(
                detector.map(Arc::downgrade).unwrap_or_default(),
                weak_host.clone(),
            ),
        })
    }

    pub fn cluster(&self) -> &Arc<ClusterInfo> {
        &self.cluster
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn address(&self) -> SocketAddr {
        *self.address.lock().unwrap()
    }

    pub fn set_address(&self, address: SocketAddr) {
        *self.address.lock().unwrap() = address;
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn stats(&self) -> &HostStats {
        &self.stats
    }

    pub fn outlier_sink(&self) -> &Arc<DetectorHostSink> {
        &self.outlier_sink
    }

    pub fn healthy(&self) -> bool {
        self.health_flags.load(Ordering::Acquire) == 0
    }

    pub fn has_health_flag(&self, flag: u32) -> bool {
        self.health_flags.load(Ordering::Acquire) & flag != 0
    }

    /// Sets a health flag, returning true when the flag was newly set.
    pub fn set_health_flag(&self, flag: u32) -> bool {
        self.health_flags.fetch_or(flag, Ordering::AcqRel) & flag == 0
    }

    /// Clears a health flag, returning true when the flag was previously set.
    pub fn clear_health_flag(&self, flag: u32) -> bool {
        self.health_flags.fetch_and(!flag, Ordering::AcqRel) & flag != 0
    }
}

/// Identity key for per-host maps. Hashing and equality follow the host
/// *object*, not its address, so a removed-and-readded address can never
/// collide with the entry of its predecessor.
#[derive(Clone, Debug)]
pub struct HostHandle(pub Arc<Host>);

impl PartialEq for HostHandle {
    fn eq(&self, other: &HostHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for HostHandle {}

impl std::hash::Hash for HostHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

pub type HostVec = Vec<Arc<Host>>;

/// Subscriber invoked after a host set applies an update. Receives the
/// updated set plus the membership delta.
pub type MemberUpdateCb = Box<dyn Fn(&HostSet, &[Arc<Host>], &[Arc<Host>]) + Send>;

/// The membership of one cluster at one observer. All vectors are shared
/// snapshots: an update replaces the `Arc`s wholesale, so holders of a
/// previous snapshot keep a consistent view for as long as they need it.
pub struct HostSet {
    hosts: Arc<HostVec>,
    healthy_hosts: Arc<HostVec>,
    hosts_per_zone: Arc<Vec<HostVec>>,
    healthy_hosts_per_zone: Arc<Vec<HostVec>>,
    callbacks: Vec<MemberUpdateCb>,
}

impl std::fmt::Debug for HostSet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("HostSet")
            .field("hosts", &self.hosts.len())
            .field("healthy_hosts", &self.healthy_hosts.len())
            .field("zones", &self.hosts_per_zone.len())
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

impl Default for HostSet {
    fn default() -> Self {
        HostSet::new()
    }
}

impl HostSet {
    pub fn new() -> Self {
        HostSet {
            hosts: Arc::new(Vec::new()),
            healthy_hosts: Arc::new(Vec::new()),
            hosts_per_zone: Arc::new(Vec::new()),
            healthy_hosts_per_zone: Arc::new(Vec::new()),
            callbacks: Vec::new(),
        }
    }

    pub fn hosts(&self) -> &Arc<HostVec> {
        &self.hosts
    }

    pub fn healthy_hosts(&self) -> &Arc<HostVec> {
        &self.healthy_hosts
    }

    pub fn hosts_per_zone(&self) -> &Arc<Vec<HostVec>> {
        &self.hosts_per_zone
    }

    pub fn healthy_hosts_per_zone(&self) -> &Arc<Vec<HostVec>> {
        &self.healthy_hosts_per_zone
    }

    pub fn add_member_update_cb(&mut self, cb: MemberUpdateCb) {
        self.callbacks.push(cb);
    }

    /// Applies a membership update atomically from this observer's
    /// perspective and notifies subscribers. All four vectors always come
    /// from the same update; subscribers never see them mixed across
    /// updates.
    pub fn update_hosts(
        &mut self,
        hosts: Arc<HostVec>,
        healthy_hosts: Arc<HostVec>,
        hosts_per_zone: Arc<Vec<HostVec>>,
        healthy_hosts_per_zone: Arc<Vec<HostVec>>,
        hosts_added: Vec<Arc<Host>>,
        hosts_removed: Vec<Arc<Host>>,
    ) {
        self.hosts = hosts;
        self.healthy_hosts = healthy_hosts;
        self.hosts_per_zone = hosts_per_zone;
        self.healthy_hosts_per_zone = healthy_hosts_per_zone;
        for cb in &self.callbacks {
            cb(self, &hosts_added, &hosts_removed);
        }
    }
}

/// Groups hosts into zone partitions. The local zone always occupies index
/// zero (possibly empty); the remaining zones follow in name order so that
/// two observers of the same membership agree on partition indexes.
pub fn partition_by_zone(hosts: &[Arc<Host>], local_zone: &str) -> Vec<HostVec> {
    let other_zones: BTreeSet<&str> = hosts
        .iter()
        .map(|h| h.zone())
        .filter(|z| *z != local_zone)
        .collect();
    let mut partitions: Vec<HostVec> = Vec::with_capacity(other_zones.len() + 1);
    partitions.push(
        hosts
            .iter()
            .filter(|h| h.zone() == local_zone)
            .cloned()
            .collect(),
    );
    for zone in other_zones {
        partitions.push(hosts.iter().filter(|h| h.zone() == zone).cloned().collect());
    }
    partitions
}
