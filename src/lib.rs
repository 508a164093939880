//
// Copyright 2020 Joyent, Inc.
//

//! A multi-cluster upstream manager
//!
//! Cuemaster manages the whole rack: a set of named *clusters*, each a
//! pool of backend hosts discovered statically, through DNS, or from a
//! remote discovery service. The manager keeps every cluster's membership
//! and health continuously updated on a primary thread, replicates that
//! view to request-processing worker threads as immutable snapshots, and
//! hands out load-balanced host selections and per-host connection pools
//! on the workers without any cross-thread locking on the request path.
//!
//! The pieces fit together like this:
//!
//! * [`manager::ClusterManager`] loads the JSON configuration, owns the
//!   cluster registry, and fans membership updates out to workers.
//! * [`cluster::Cluster`] owns one pool's discovery policy and its
//!   primary-side [`host::HostSet`].
//! * [`health_check::HealthChecker`] actively probes members;
//!   [`outlier::Detector`] passively ejects misbehaving ones.
//! * [`worker::WorkerContext`] serves the hot path: cluster lookup,
//!   [`load_balancer::LoadBalancer`] host choice, and
//!   [`conn_pool`] pool lookup, all on worker-private state.
//!
//! # Example
//!
//! ```rust,no_run
//! use cuemaster::config::ClusterManagerConfig;
//! use cuemaster::conn_pool::Priority;
//! use cuemaster::manager::{ClusterManager, ClusterManagerOptions};
//!
//! let config = ClusterManagerConfig::from_json(
//!     r#"{
//!         "clusters": [{
//!             "name": "backend",
//!             "type": "static",
//!             "lb_type": "round_robin",
//!             "hosts": [
//!                 {"url": "tcp://10.0.0.1:80"},
//!                 {"url": "tcp://10.0.0.2:80"}
//!             ]
//!         }]
//!     }"#,
//! )
//! .unwrap();
//!
//! let manager = ClusterManager::new(&config, ClusterManagerOptions::default()).unwrap();
//! let pool = manager
//!     .run_on_worker(0, |worker| worker.http_conn_pool("backend", Priority::Default))
//!     .unwrap()
//!     .unwrap();
//! ```

#![allow(missing_docs)]

pub mod cluster;
pub mod config;
pub mod conn_pool;
pub mod error;
pub mod health_check;
pub mod host;
pub mod load_balancer;
pub mod manager;
pub mod outlier;
pub mod resolver;
pub mod runtime;
pub mod ssl;
pub mod stats;
pub mod worker;
