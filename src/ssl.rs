// Copyright 2020 Joyent, Inc.

//! SSL client context plumbing. The handshake machinery lives elsewhere;
//! clusters only need an opaque context created at load time that the pool
//! allocator can hand to new upstream connections.

use std::sync::Arc;

use serde::Deserialize;

/// Per-cluster client TLS configuration.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SslContextConfig {
    pub ca_cert_file: Option<String>,
    pub cert_chain_file: Option<String>,
    pub private_key_file: Option<String>,
    pub sni: Option<String>,
}

/// Opaque client context handed to connection pools.
#[derive(Clone, Debug)]
pub struct ClientSslContext {
    config: SslContextConfig,
}

impl ClientSslContext {
    pub fn config(&self) -> &SslContextConfig {
        &self.config
    }
}

pub trait SslContextManager: Send + Sync {
    fn create_client_context(&self, config: &SslContextConfig) -> Arc<ClientSslContext>;
}

/// Context manager that captures the configuration without loading any key
/// material. Deployments wanting real TLS supply their own manager.
#[derive(Debug, Default)]
pub struct StaticSslContextManager;

impl SslContextManager for StaticSslContextManager {
    fn create_client_context(&self, config: &SslContextConfig) -> Arc<ClientSslContext> {
        Arc::new(ClientSslContext {
            config: config.clone(),
        })
    }
}
