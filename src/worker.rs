// Copyright 2020 Joyent, Inc.

//! Worker-side cluster replicas and the worker event loop.
//!
//! Each worker is a single thread draining one task queue. The primary
//! posts membership snapshots onto the queue; request-processing code runs
//! on the queue via closures. Because everything a worker owns is touched
//! only from its own loop, the hot path (cluster lookup, host selection,
//! pool lookup) takes no locks shared with the primary.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream};
use std::rc::Rc;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use slog::{debug, o, warn, Logger};

use crate::cluster::ClusterInfo;
use crate::conn_pool::{ConnPoolFactory, ConnPoolsContainer, ConnectionPool, PoolHandle, Priority};
use crate::error::Error;
use crate::host::{Host, HostHandle, HostSet, HostVec};
use crate::load_balancer::LoadBalancer;
use crate::runtime::Runtime;

/// A membership snapshot posted from the primary to one worker. The four
/// vectors are shared immutable snapshots from a single primary update;
/// the deltas carry exactly the hosts that entered or left.
#[derive(Clone)]
pub struct MembershipUpdate {
    pub cluster: String,
    pub hosts: Arc<HostVec>,
    pub healthy_hosts: Arc<HostVec>,
    pub hosts_per_zone: Arc<Vec<HostVec>>,
    pub healthy_hosts_per_zone: Arc<Vec<HostVec>>,
    pub hosts_added: HostVec,
    pub hosts_removed: HostVec,
}

impl MembershipUpdate {
    /// Captures the current state of a host set as an update message.
    pub fn from_host_set(
        cluster: &str,
        host_set: &HostSet,
        hosts_added: &[Arc<Host>],
        hosts_removed: &[Arc<Host>],
    ) -> Self {
        MembershipUpdate {
            cluster: cluster.to_string(),
            hosts: host_set.hosts().clone(),
            healthy_hosts: host_set.healthy_hosts().clone(),
            hosts_per_zone: host_set.hosts_per_zone().clone(),
            healthy_hosts_per_zone: host_set.healthy_hosts_per_zone().clone(),
            hosts_added: hosts_added.to_vec(),
            hosts_removed: hosts_removed.to_vec(),
        }
    }
}

/// Work items a worker processes, in order of arrival.
pub enum WorkerTask {
    UpdateHosts(MembershipUpdate),
    PoolDrained { host: HostHandle },
    Run(Box<dyn FnOnce(&mut WorkerContext) + Send>),
    Shutdown,
}

/// Handle to the asynchronous HTTP client a worker owns for one cluster.
/// Request dispatch lives in the HTTP layer; the cluster manager only
/// guarantees one client per cluster per worker.
pub struct AsyncHttpClient {
    info: Arc<ClusterInfo>,
    worker_id: usize,
}

impl AsyncHttpClient {
    pub fn cluster_info(&self) -> &Arc<ClusterInfo> {
        &self.info
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }
}

/// An upstream TCP connection bound to the address its host resolved to at
/// selection time. Returned unconnected; the caller decides when to dial.
#[derive(Debug)]
pub struct UpstreamConnection {
    addr: SocketAddr,
    stream: Option<TcpStream>,
    connected: bool,
}

impl UpstreamConnection {
    pub(crate) fn new(addr: SocketAddr) -> Self {
        UpstreamConnection {
            addr,
            stream: None,
            connected: false,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn connect(&mut self) -> Result<(), std::io::Error> {
        let stream = TcpStream::connect(self.addr)?;
        self.stream = Some(stream);
        self.connected = true;
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), std::io::Error> {
        self.stream = None;
        self.connected = false;
        Ok(())
    }
}

// Everything a worker needs to build its context on its own thread.
pub(crate) struct WorkerInit {
    pub id: usize,
    /// Cluster descriptions with the local cluster (if any) first.
    pub clusters: Vec<Arc<ClusterInfo>>,
    pub local_cluster_name: Option<String>,
    pub runtime: Arc<dyn Runtime>,
    pub pool_factory: Arc<dyn ConnPoolFactory>,
    pub self_tx: Sender<WorkerTask>,
    pub log: Logger,
}

// One cluster as seen by one worker.
struct WorkerCluster {
    info: Arc<ClusterInfo>,
    host_set: Rc<RefCell<HostSet>>,
    lb: LoadBalancer,
    http_async_client: AsyncHttpClient,
}

/// Worker-local view of every cluster plus the host-to-pools map.
pub struct WorkerContext {
    id: usize,
    clusters: HashMap<String, WorkerCluster>,
    conn_pools: HashMap<HostHandle, ConnPoolsContainer>,
    deferred_delete: Vec<Box<dyn ConnectionPool>>,
    self_tx: Sender<WorkerTask>,
    pool_factory: Arc<dyn ConnPoolFactory>,
    rng: StdRng,
    log: Logger,
}

impl WorkerContext {
    pub(crate) fn new(init: WorkerInit) -> Self {
        let mut context = WorkerContext {
            id: init.id,
            clusters: HashMap::new(),
            conn_pools: HashMap::new(),
            deferred_delete: Vec::new(),
            self_tx: init.self_tx,
            pool_factory: init.pool_factory,
            rng: StdRng::from_entropy(),
            log: init.log,
        };

        // The local cluster is bootstrapped first so every other cluster's
        // load balancer can observe its replica for zone-aware decisions.
        let mut local_host_set: Option<Rc<RefCell<HostSet>>> = None;
        if let Some(local_name) = &init.local_cluster_name {
            if let Some(info) = init.clusters.iter().find(|i| i.name() == local_name.as_str()) {
                let host_set = context.insert_cluster(info.clone(), None, init.runtime.clone());
                local_host_set = Some(host_set);
            }
        }
        for info in &init.clusters {
            if Some(info.name()) == init.local_cluster_name.as_deref() {
                continue;
            }
            context.insert_cluster(info.clone(), local_host_set.clone(), init.runtime.clone());
        }
        context
    }

    fn insert_cluster(
        &mut self,
        info: Arc<ClusterInfo>,
        local_host_set: Option<Rc<RefCell<HostSet>>>,
        runtime: Arc<dyn Runtime>,
    ) -> Rc<RefCell<HostSet>> {
        let host_set = Rc::new(RefCell::new(HostSet::new()));
        let lb = LoadBalancer::new(
            info.lb_type(),
            host_set.clone(),
            local_host_set,
            info.clone(),
            runtime,
        );
        let http_async_client = AsyncHttpClient {
            info: info.clone(),
            worker_id: self.id,
        };
        self.clusters.insert(
            info.name().to_string(),
            WorkerCluster {
                info,
                host_set: host_set.clone(),
                lb,
                http_async_client,
            },
        );
        host_set
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Cluster info lookup from this worker's replica.
    pub fn get(&self, cluster: &str) -> Option<Arc<ClusterInfo>> {
        self.clusters.get(cluster).map(|c| c.info.clone())
    }

    /// Selects a host and returns its pool for the given priority,
    /// allocating the pool on first use. `Ok(None)` means the cluster has
    /// no usable host.
    pub fn http_conn_pool(
        &mut self,
        cluster: &str,
        priority: Priority,
    ) -> Result<Option<PoolHandle>, Error> {
        let entry = self
            .clusters
            .get_mut(cluster)
            .ok_or_else(|| Error::UnknownCluster(cluster.to_string()))?;
        let host = match entry.lb.choose_host(&mut self.rng) {
            Some(host) => host,
            None => {
                entry.info.stats().upstream_cx_none_healthy.inc();
                return Ok(None);
            }
        };
        let container = self.conn_pools.entry(HostHandle(host.clone())).or_default();
        let index = priority.index();
        if container.pools[index].is_none() {
            container.pools[index] = Some(self.pool_factory.allocate(&host, priority));
        }
        Ok(container.pools[index].as_ref().map(|pool| pool.handle()))
    }

    /// Selects a host and returns an unconnected upstream connection for
    /// it. `(None, None)` means the cluster has no usable host.
    pub fn tcp_conn(
        &mut self,
        cluster: &str,
    ) -> Result<(Option<UpstreamConnection>, Option<Arc<Host>>), Error> {
        let entry = self
            .clusters
            .get_mut(cluster)
            .ok_or_else(|| Error::UnknownCluster(cluster.to_string()))?;
        match entry.lb.choose_host(&mut self.rng) {
            Some(host) => {
                entry.info.stats().upstream_cx_total.inc();
                host.stats().cx_total.inc();
                let conn = UpstreamConnection::new(host.address());
                Ok((Some(conn), Some(host)))
            }
            None => {
                entry.info.stats().upstream_cx_none_healthy.inc();
                Ok((None, None))
            }
        }
    }

    /// The worker's async HTTP client for a cluster.
    pub fn http_async_client(&self, cluster: &str) -> Result<&AsyncHttpClient, Error> {
        self.clusters
            .get(cluster)
            .map(|c| &c.http_async_client)
            .ok_or_else(|| Error::UnknownCluster(cluster.to_string()))
    }

    /// Runs a closure against this worker's replica host set for a cluster.
    pub fn with_cluster_hosts<T>(
        &self,
        cluster: &str,
        f: impl FnOnce(&HostSet) -> T,
    ) -> Option<T> {
        self.clusters
            .get(cluster)
            .map(|c| f(&c.host_set.borrow()))
    }

    /// Number of hosts currently holding pool containers on this worker.
    pub fn num_conn_pool_containers(&self) -> usize {
        self.conn_pools.len()
    }

    /// Whether this worker still holds a pool container for the host.
    pub fn has_conn_pools_for(&self, host: &Arc<Host>) -> bool {
        self.conn_pools.contains_key(&HostHandle(host.clone()))
    }

    pub(crate) fn update_cluster_membership(&mut self, update: MembershipUpdate) {
        let Some(entry) = self.clusters.get(&update.cluster) else {
            warn!(self.log, "membership update for unknown cluster";
                  "cluster" => update.cluster.as_str());
            return;
        };
        entry.host_set.borrow_mut().update_hosts(
            update.hosts,
            update.healthy_hosts,
            update.hosts_per_zone,
            update.healthy_hosts_per_zone,
            update.hosts_added,
            update.hosts_removed.clone(),
        );
        // Pools bound to departed hosts drain now. A returning address is
        // a different host object and will get a fresh container, so this
        // can never tear down a live member's pools.
        for host in update.hosts_removed {
            self.drain_conn_pools(host);
        }
    }

    fn drain_conn_pools(&mut self, host: Arc<Host>) {
        let handle = HostHandle(host);
        let Some(container) = self.conn_pools.get_mut(&handle) else {
            return;
        };
        let pool_count = container.pools.iter().filter(|p| p.is_some()).count() as u32;
        if pool_count == 0 {
            self.conn_pools.remove(&handle);
            return;
        }
        debug!(self.log, "draining connection pools";
               "host" => handle.0.url(), "pools" => pool_count);
        container.drains_remaining = pool_count;
        for pool in container.pools.iter_mut().flatten() {
            let tx = self.self_tx.clone();
            let drained = handle.clone();
            pool.add_drained_callback(Box::new(move || {
                // Completion can run inside a pool callback; route it
                // through the queue so teardown happens on a clean stack.
                let _ = tx.send(WorkerTask::PoolDrained { host: drained });
            }));
        }
    }

    pub(crate) fn on_pool_drained(&mut self, host: HostHandle) {
        let all_drained = match self.conn_pools.get_mut(&host) {
            Some(container) => {
                container.drains_remaining = container.drains_remaining.saturating_sub(1);
                container.drains_remaining == 0
            }
            None => false,
        };
        if !all_drained {
            return;
        }
        if let Some(container) = self.conn_pools.remove(&host) {
            debug!(self.log, "connection pools drained"; "host" => host.0.url());
            for pool in container.pools.into_iter().flatten() {
                self.deferred_delete.push(pool);
            }
        }
    }

    pub(crate) fn clear_deferred(&mut self) {
        self.deferred_delete.clear();
    }

    pub(crate) fn shutdown(&mut self) {
        for (_, container) in self.conn_pools.drain() {
            for pool in container.pools.into_iter().flatten() {
                self.deferred_delete.push(pool);
            }
        }
    }
}

// The worker thread body: build the context, then apply tasks serially in
// arrival order. Deferred deletions run at the top of the next iteration
// so no pool is destroyed inside one of its own callbacks.
pub(crate) fn worker_loop(rx: Receiver<WorkerTask>, init: WorkerInit) {
    let log = init.log.new(o!("worker" => init.id));
    let mut context = WorkerContext::new(init);
    debug!(log, "worker started");
    loop {
        let task = match rx.recv() {
            Ok(task) => task,
            Err(_) => break,
        };
        context.clear_deferred();
        match task {
            WorkerTask::UpdateHosts(update) => context.update_cluster_membership(update),
            WorkerTask::PoolDrained { host } => context.on_pool_drained(host),
            WorkerTask::Run(f) => f(&mut context),
            WorkerTask::Shutdown => break,
        }
    }
    context.shutdown();
    context.clear_deferred();
    debug!(log, "worker stopped");
}
