// Copyright 2020 Joyent, Inc.

use thiserror::Error;

/// Errors surfaced by the cluster manager. Configuration errors are fatal to
/// `ClusterManager::new`; everything else is local to one request or one
/// discovery cycle.
#[derive(Error, Debug)]
pub enum Error {
    #[error("cluster: unknown cluster type '{0}'")]
    UnknownClusterType(String),
    #[error("cluster: duplicate cluster '{0}'")]
    DuplicateCluster(String),
    #[error("cannot create an sds cluster without an sds config")]
    NoSdsConfig,
    #[error("local cluster '{0}' must be defined")]
    NoLocalCluster(String),
    #[error("cluster: unknown health check type '{0}'")]
    UnknownHealthCheckType(String),
    #[error("cluster: unknown lb type '{0}'")]
    UnknownLbType(String),
    #[error("unknown cluster '{0}'")]
    UnknownCluster(String),
    #[error("malformed host url '{0}'")]
    InvalidUrl(String),
    #[error("invalid cluster configuration: {0}")]
    InvalidConfig(String),
    #[error("dns resolution failure for '{name}': {reason}")]
    DnsResolution { name: String, reason: String },
    #[error("sds fetch failure: {0}")]
    SdsFetch(String),
    #[error("worker {0} is no longer running")]
    WorkerStopped(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
