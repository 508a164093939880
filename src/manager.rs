// Copyright 2020 Joyent, Inc.

//! The primary cluster manager.
//!
//! Owns the cluster registry, spawns the worker threads, and fans
//! membership updates out to every worker as immutable snapshots. Requests
//! originate on workers: `run_on_worker` posts a closure onto a worker's
//! queue where it runs against that worker's private replica, serialized
//! with membership updates.

use std::collections::HashMap;
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use slog::{info, o, Drain, Logger};

use crate::cluster::{
    Cluster, ClusterDeps, ClusterInfo, RestSdsFetcher, SdsFetcher,
};
use crate::config::ClusterManagerConfig;
use crate::conn_pool::{ConnPoolFactory, ProdConnPoolFactory};
use crate::error::Error;
use crate::health_check::HealthCheckProbe;
use crate::outlier::EventLogger;
use crate::resolver::{DnsResolver, SystemDnsResolver};
use crate::runtime::{Runtime, StaticRuntime, SystemTimeSource, TimeSource};
use crate::ssl::{SslContextManager, StaticSslContextManager};
use crate::stats::StatsStore;
use crate::worker::{worker_loop, MembershipUpdate, WorkerContext, WorkerInit, WorkerTask};

/// Options and collaborator overrides for [`ClusterManager::new`]. Any
/// collaborator left unset falls back to its production default.
pub struct ClusterManagerOptions {
    pub num_workers: usize,
    pub local_zone_name: Option<String>,
    pub log: Option<Logger>,
    pub dns_resolver: Option<Arc<dyn DnsResolver>>,
    pub sds_fetcher: Option<Arc<dyn SdsFetcher>>,
    pub runtime: Option<Arc<dyn Runtime>>,
    pub stats: Option<StatsStore>,
    pub time_source: Option<Arc<dyn TimeSource>>,
    pub pool_factory: Option<Arc<dyn ConnPoolFactory>>,
    pub health_probe: Option<Arc<dyn HealthCheckProbe>>,
    pub ssl_context_manager: Option<Arc<dyn SslContextManager>>,
}

impl Default for ClusterManagerOptions {
    fn default() -> Self {
        ClusterManagerOptions {
            num_workers: 4,
            local_zone_name: None,
            log: None,
            dns_resolver: None,
            sds_fetcher: None,
            runtime: None,
            stats: None,
            time_source: None,
            pool_factory: None,
            health_probe: None,
            ssl_context_manager: None,
        }
    }
}

// Counts clusters still waiting on their first discovery. SDS clusters
// are held back until the counter reaches exactly their number, because
// their fetches route through an already-registered discovery cluster.
struct InitTracker {
    state: Mutex<InitState>,
}

struct InitState {
    pending: usize,
    sds_gate: usize,
    sds_started: bool,
    initialized_cb: Option<Box<dyn FnOnce() + Send>>,
    start_sds: Option<Box<dyn FnOnce() + Send>>,
}

impl InitTracker {
    fn new(pending: usize, sds_gate: usize) -> Arc<Self> {
        Arc::new(InitTracker {
            state: Mutex::new(InitState {
                pending,
                sds_gate,
                sds_started: false,
                initialized_cb: None,
                start_sds: None,
            }),
        })
    }

    fn set_start_sds(&self, f: Box<dyn FnOnce() + Send>) {
        self.state.lock().unwrap().start_sds = Some(f);
    }

    fn set_initialized_cb(&self, cb: Box<dyn FnOnce() + Send>) {
        let mut state = self.state.lock().unwrap();
        if state.pending == 0 {
            drop(state);
            cb();
        } else {
            state.initialized_cb = Some(cb);
        }
    }

    fn cluster_initialized(&self) {
        let (start_sds, initialized_cb) = {
            let mut state = self.state.lock().unwrap();
            state.pending = state.pending.saturating_sub(1);
            let start_sds = if state.pending == state.sds_gate && !state.sds_started {
                state.sds_started = true;
                state.start_sds.take()
            } else {
                None
            };
            let initialized_cb = if state.pending == 0 {
                state.initialized_cb.take()
            } else {
                None
            };
            (start_sds, initialized_cb)
        };
        if let Some(f) = start_sds {
            f();
        }
        if let Some(cb) = initialized_cb {
            cb();
        }
    }
}

struct WorkerHandle {
    tx: Sender<WorkerTask>,
    join: Option<thread::JoinHandle<()>>,
}

/// The primary-side cluster manager.
pub struct ClusterManager {
    clusters: HashMap<String, Arc<Cluster>>,
    workers: Vec<WorkerHandle>,
    init_tracker: Arc<InitTracker>,
    stats: StatsStore,
    log: Logger,
    stopped: bool,
}

impl ClusterManager {
    /// Loads the configuration, spawns workers, and starts discovery for
    /// every non-SDS cluster. Configuration errors abort the load.
    pub fn new(
        config: &ClusterManagerConfig,
        options: ClusterManagerOptions,
    ) -> Result<ClusterManager, Error> {
        let log = options
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let stats = options.stats.unwrap_or_default();
        let runtime: Arc<dyn Runtime> = options
            .runtime
            .unwrap_or_else(|| Arc::new(StaticRuntime::new()));
        let time_source: Arc<dyn TimeSource> = options
            .time_source
            .unwrap_or_else(|| Arc::new(SystemTimeSource));
        let dns_resolver: Arc<dyn DnsResolver> = options
            .dns_resolver
            .unwrap_or_else(|| Arc::new(SystemDnsResolver));
        let ssl_context_manager: Arc<dyn SslContextManager> = options
            .ssl_context_manager
            .unwrap_or_else(|| Arc::new(StaticSslContextManager));
        let pool_factory: Arc<dyn ConnPoolFactory> = options
            .pool_factory
            .unwrap_or_else(|| Arc::new(ProdConnPoolFactory::new(runtime.clone(), log.clone())));

        let outlier_event_logger = match config
            .outlier_detection
            .as_ref()
            .and_then(|o| o.event_log_path.as_ref())
        {
            Some(path) => Some(EventLogger::new(path, time_source.clone(), log.clone())?),
            None => None,
        };

        // Without an injected fetcher, SDS queries go through the
        // configured discovery cluster once it is registered below.
        let rest_fetcher = match (&options.sds_fetcher, &config.sds) {
            (None, Some(_)) => Some(RestSdsFetcher::new()),
            _ => None,
        };
        let sds_fetcher: Option<Arc<dyn SdsFetcher>> = options.sds_fetcher.clone().or_else(|| {
            rest_fetcher
                .clone()
                .map(|f| f as Arc<dyn SdsFetcher>)
        });

        let deps = ClusterDeps {
            stats: stats.clone(),
            runtime: runtime.clone(),
            time_source,
            dns_resolver,
            sds_fetcher,
            ssl_context_manager,
            health_probe: options.health_probe.clone(),
            outlier_event_logger,
            local_zone: options.local_zone_name.clone().unwrap_or_default(),
            log: log.clone(),
        };

        let mut clusters: HashMap<String, Arc<Cluster>> = HashMap::new();
        let mut sds_clusters: Vec<Arc<Cluster>> = Vec::new();
        let sds_refresh_ms = config.sds.as_ref().map(|s| s.refresh_delay_ms);

        // The SDS discovery cluster registers first, outside the main
        // list. Passing no SDS settings here rejects a discovery cluster
        // that is itself of type sds.
        if let Some(sds_config) = &config.sds {
            let cluster = Cluster::from_config(&sds_config.cluster, None, &deps)?;
            if let Some(fetcher) = &rest_fetcher {
                fetcher.set_discovery_cluster(&cluster);
            }
            clusters.insert(cluster.name().to_string(), cluster);
        }

        for cluster_config in &config.clusters {
            let cluster = Cluster::from_config(cluster_config, sds_refresh_ms, &deps)?;
            if clusters.contains_key(cluster.name()) {
                return Err(Error::DuplicateCluster(cluster.name().to_string()));
            }
            if cluster.is_sds() {
                sds_clusters.push(cluster.clone());
            }
            clusters.insert(cluster.name().to_string(), cluster);
        }

        if let Some(local_name) = &config.local_cluster_name {
            if !clusters.contains_key(local_name) {
                return Err(Error::NoLocalCluster(local_name.clone()));
            }
        }

        // Initialization ordering: every configured cluster plus the SDS
        // discovery cluster must report in; SDS clusters start last.
        let pending = config.clusters.len() + usize::from(config.sds.is_some());
        let init_tracker = InitTracker::new(pending, sds_clusters.len());
        {
            let sds_list = sds_clusters.clone();
            init_tracker.set_start_sds(Box::new(move || {
                for cluster in &sds_list {
                    cluster.initialize();
                }
            }));
        }
        for cluster in clusters.values() {
            let tracker = init_tracker.clone();
            cluster.set_initialized_cb(Box::new(move || tracker.cluster_initialized()));
        }

        // Workers replicate every cluster, local cluster first.
        let infos: Vec<Arc<ClusterInfo>> = clusters.values().map(|c| c.info().clone()).collect();
        let mut workers = Vec::with_capacity(options.num_workers.max(1));
        for id in 0..options.num_workers.max(1) {
            let (tx, rx) = channel();
            let init = WorkerInit {
                id,
                clusters: infos.clone(),
                local_cluster_name: config.local_cluster_name.clone(),
                runtime: runtime.clone(),
                pool_factory: pool_factory.clone(),
                self_tx: tx.clone(),
                log: log.clone(),
            };
            let join = thread::Builder::new()
                .name(format!("cuemaster-worker-{}", id))
                .spawn(move || worker_loop(rx, init))?;
            workers.push(WorkerHandle {
                tx,
                join: Some(join),
            });
        }

        // Every membership update a cluster publishes is captured as one
        // snapshot bundle and posted to each worker, in publish order.
        let senders: Vec<Sender<WorkerTask>> = workers.iter().map(|w| w.tx.clone()).collect();
        for (name, cluster) in &clusters {
            let senders = senders.clone();
            let cluster_name = name.clone();
            cluster.add_member_update_cb(Box::new(move |host_set, added, removed| {
                let update =
                    MembershipUpdate::from_host_set(&cluster_name, host_set, added, removed);
                for tx in &senders {
                    let _ = tx.send(WorkerTask::UpdateHosts(update.clone()));
                }
            }));
        }

        info!(log, "starting cluster manager";
              "clusters" => clusters.len(), "workers" => workers.len());
        for cluster in clusters.values() {
            cluster.start();
        }

        Ok(ClusterManager {
            clusters,
            workers,
            init_tracker,
            stats,
            log,
            stopped: false,
        })
    }

    /// Registers a callback invoked once every cluster has completed its
    /// first discovery. Runs immediately if that already happened.
    pub fn set_initialized_callback<F>(&self, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.init_tracker.set_initialized_cb(Box::new(cb));
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// The primary's view of a cluster.
    pub fn cluster(&self, name: &str) -> Option<&Arc<Cluster>> {
        self.clusters.get(name)
    }

    /// Cluster info lookup by name.
    pub fn get(&self, name: &str) -> Option<Arc<ClusterInfo>> {
        self.clusters.get(name).map(|c| c.info().clone())
    }

    pub fn stats_store(&self) -> &StatsStore {
        &self.stats
    }

    /// Runs a closure on a worker's event loop against that worker's
    /// replica, blocking until it returns. The closure is serialized with
    /// membership updates already queued to that worker.
    pub fn run_on_worker<T, F>(&self, worker: usize, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut WorkerContext) -> T + Send + 'static,
        T: Send + 'static,
    {
        let handle = self
            .workers
            .get(worker)
            .ok_or(Error::WorkerStopped(worker))?;
        let (tx, rx) = channel();
        handle
            .tx
            .send(WorkerTask::Run(Box::new(move |context| {
                let _ = tx.send(f(context));
            })))
            .map_err(|_| Error::WorkerStopped(worker))?;
        rx.recv().map_err(|_| Error::WorkerStopped(worker))
    }

    /// Stops discovery, drains the worker queues, and joins the worker
    /// threads. Idempotent; also runs on drop.
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        info!(self.log, "stopping cluster manager");
        for cluster in self.clusters.values() {
            cluster.stop();
        }
        for worker in &self.workers {
            let _ = worker.tx.send(WorkerTask::Shutdown);
        }
        for worker in &mut self.workers {
            if let Some(join) = worker.join.take() {
                let _ = join.join();
            }
        }
    }
}

impl Drop for ClusterManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
