// Copyright 2020 Joyent, Inc.

//! DNS resolution contract used by the strict and logical DNS cluster
//! variants. Resolution runs on the refresh timer's thread, so the contract
//! is a plain synchronous call; implementations that need their own event
//! loop can block here.

use std::net::{IpAddr, ToSocketAddrs};

use crate::error::Error;

pub trait DnsResolver: Send + Sync {
    /// Resolve a DNS name to its current address list. An empty list is a
    /// valid answer; a failed query is an error and the caller keeps its
    /// previous view.
    fn resolve(&self, name: &str) -> Result<Vec<IpAddr>, Error>;
}

/// Resolver backed by the system's stub resolver.
#[derive(Debug, Default)]
pub struct SystemDnsResolver;

impl DnsResolver for SystemDnsResolver {
    fn resolve(&self, name: &str) -> Result<Vec<IpAddr>, Error> {
        let mut addrs: Vec<IpAddr> = (name, 0u16)
            .to_socket_addrs()
            .map_err(|e| Error::DnsResolution {
                name: name.to_string(),
                reason: e.to_string(),
            })?
            .map(|sa| sa.ip())
            .collect();
        addrs.sort();
        addrs.dedup();
        Ok(addrs)
    }
}
