// Copyright 2020 Joyent, Inc.

//! JSON configuration model, consumed once at load time.
//!
//! Host addresses are given as `tcp://ip:port` URLs; DNS-discovered
//! clusters use the same URL shape with a name in the host position.

use std::net::SocketAddr;

use serde::Deserialize;

use crate::error::Error;
use crate::ssl::SslContextConfig;

/// Top level configuration for the cluster manager.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ClusterManagerConfig {
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
    pub sds: Option<SdsConfig>,
    pub local_cluster_name: Option<String>,
    pub outlier_detection: Option<OutlierLogConfig>,
}

impl ClusterManagerConfig {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Manager-wide outlier detection settings.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct OutlierLogConfig {
    pub event_log_path: Option<String>,
}

/// Service discovery service settings. The inner cluster describes how to
/// reach the discovery service itself and is registered alongside the
/// configured clusters.
#[derive(Clone, Debug, Deserialize)]
pub struct SdsConfig {
    pub cluster: ClusterConfig,
    #[serde(default = "default_sds_refresh_delay_ms")]
    pub refresh_delay_ms: u64,
}

fn default_sds_refresh_delay_ms() -> u64 {
    30_000
}

/// One upstream cluster.
#[derive(Clone, Debug, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    /// One of `static`, `strict_dns`, `logical_dns`, `sds`. Validated at
    /// load rather than parse so an unknown type reports the manager's
    /// error, not a serde error.
    #[serde(rename = "type")]
    pub cluster_type: String,
    /// One of `round_robin`, `least_request`, `random`.
    #[serde(default = "default_lb_type")]
    pub lb_type: String,
    /// Feature tags; currently only `http2` is meaningful.
    #[serde(default)]
    pub features: Vec<String>,
    /// Static members, or the DNS names for the dns variants.
    #[serde(default)]
    pub hosts: Vec<HostEntry>,
    /// Service name announced to the discovery service; defaults to the
    /// cluster name.
    pub service_name: Option<String>,
    #[serde(default = "default_dns_refresh_rate_ms")]
    pub dns_refresh_rate_ms: u64,
    pub health_check: Option<HealthCheckConfig>,
    pub outlier_detection: Option<ClusterOutlierConfig>,
    pub ssl_context: Option<SslContextConfig>,
}

fn default_lb_type() -> String {
    "round_robin".to_string()
}

fn default_dns_refresh_rate_ms() -> u64 {
    5000
}

#[derive(Clone, Debug, Deserialize)]
pub struct HostEntry {
    pub url: String,
    /// Optional availability zone for statically configured members.
    pub zone: Option<String>,
}

/// Active health check settings.
#[derive(Clone, Debug, Deserialize)]
pub struct HealthCheckConfig {
    /// One of `http`, `tcp`.
    #[serde(rename = "type")]
    pub check_type: String,
    #[serde(default = "default_hc_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_hc_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,
    /// Request path for http checks.
    pub path: Option<String>,
    /// Payload written after connect for tcp checks.
    pub send: Option<String>,
    /// Expected reply prefix for tcp checks.
    pub expect: Option<String>,
}

fn default_hc_interval_ms() -> u64 {
    5000
}

fn default_hc_timeout_ms() -> u64 {
    2000
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_healthy_threshold() -> u32 {
    2
}

/// Presence of this object opts the cluster into passive outlier
/// detection; thresholds and intervals come from the runtime.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ClusterOutlierConfig {}

/// Parses a `tcp://ip:port` URL into a socket address.
pub fn address_from_url(url: &str) -> Result<SocketAddr, Error> {
    let hostport = url
        .strip_prefix("tcp://")
        .ok_or_else(|| Error::InvalidUrl(url.to_string()))?;
    hostport
        .parse()
        .map_err(|_| Error::InvalidUrl(url.to_string()))
}

/// Parses a `tcp://name:port` URL into a DNS name and port.
pub fn dns_target_from_url(url: &str) -> Result<(String, u16), Error> {
    let hostport = url
        .strip_prefix("tcp://")
        .ok_or_else(|| Error::InvalidUrl(url.to_string()))?;
    let (name, port) = hostport
        .rsplit_once(':')
        .ok_or_else(|| Error::InvalidUrl(url.to_string()))?;
    if name.is_empty() {
        return Err(Error::InvalidUrl(url.to_string()));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| Error::InvalidUrl(url.to_string()))?;
    Ok((name.to_string(), port))
}
