// Copyright 2020 Joyent, Inc.

//! Upstream connection pools and their per-host containers.
//!
//! The pool implementations here carry the lifecycle contract the cluster
//! manager depends on (stream accounting and drained callbacks); the wire
//! protocol machinery behind `new_stream` belongs to the codec layer. Each
//! worker holds at most one pool per host per priority, bundled in a
//! [`ConnPoolsContainer`] that also coordinates draining when the host is
//! removed from its cluster.

use std::sync::{Arc, Mutex, Weak};

use derive_more::{Add, AddAssign, Display, From, Into, Sub, SubAssign};
use slog::{debug, Logger};

use crate::host::Host;
use crate::runtime::Runtime;

/// Request priority classes. Each maps to a dedicated pool slot per host.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Priority {
    Default = 0,
    High = 1,
}

pub const NUM_PRIORITIES: usize = 2;

impl Priority {
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Upstream protocol spoken by a pool.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Protocol {
    Http1,
    Http2,
}

/// Newtype for counts of in-flight streams.
#[derive(
    Add,
    AddAssign,
    Clone,
    Copy,
    Debug,
    Display,
    Eq,
    From,
    Into,
    Ord,
    PartialOrd,
    PartialEq,
    Sub,
    SubAssign,
)]
pub struct StreamCount(u32);

impl Default for StreamCount {
    fn default() -> Self {
        StreamCount(0)
    }
}

// Stream accounting shared between a pool, its handles, and the streams it
// has issued. Kept behind one mutex so a stream completing on any thread
// observes a consistent callback list.
#[derive(Default)]
struct PoolCore {
    active_streams: StreamCount,
    drained_cbs: Vec<Box<dyn FnOnce() + Send>>,
}

fn core_new_stream(core: &Arc<Mutex<PoolCore>>) -> ActiveStream {
    core.lock().unwrap().active_streams += 1.into();
    ActiveStream {
        core: Arc::downgrade(core),
        completed: false,
    }
}

fn core_add_drained_cb(core: &Arc<Mutex<PoolCore>>, cb: Box<dyn FnOnce() + Send>) {
    let mut guard = core.lock().unwrap();
    if guard.active_streams == 0.into() {
        drop(guard);
        cb();
    } else {
        guard.drained_cbs.push(cb);
    }
}

/// A stream issued by a pool. Completion (explicit or on drop) releases the
/// stream's slot and, once the pool is idle, fires any pending drained
/// callbacks.
pub struct ActiveStream {
    core: Weak<Mutex<PoolCore>>,
    completed: bool,
}

impl ActiveStream {
    pub fn complete(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;
        let Some(core) = self.core.upgrade() else {
            return;
        };
        let cbs = {
            let mut core = core.lock().unwrap();
            core.active_streams -= 1.into();
            if core.active_streams == 0.into() {
                std::mem::take(&mut core.drained_cbs)
            } else {
                Vec::new()
            }
        };
        for cb in cbs {
            cb();
        }
    }
}

impl Drop for ActiveStream {
    fn drop(&mut self) {
        self.finish();
    }
}

/// A cheap reference to a pool, returned to request code. The pool itself
/// stays owned by the worker's container.
#[derive(Clone)]
pub struct PoolHandle {
    host: Arc<Host>,
    protocol: Protocol,
    priority: Priority,
    core: Arc<Mutex<PoolCore>>,
}

impl PoolHandle {
    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn new_stream(&self) -> ActiveStream {
        core_new_stream(&self.core)
    }
}

/// Contract between the cluster manager and a pool implementation.
pub trait ConnectionPool {
    fn protocol(&self) -> Protocol;
    fn host(&self) -> &Arc<Host>;
    fn handle(&self) -> PoolHandle;
    fn active_streams(&self) -> u32;
    /// Registers a callback invoked once every stream has terminated. A
    /// pool with no in-flight streams invokes the callback immediately.
    fn add_drained_callback(&mut self, cb: Box<dyn FnOnce() + Send>);
}

struct PoolState {
    host: Arc<Host>,
    priority: Priority,
    core: Arc<Mutex<PoolCore>>,
}

impl PoolState {
    fn new(host: Arc<Host>, priority: Priority) -> Self {
        PoolState {
            host,
            priority,
            core: Arc::new(Mutex::new(PoolCore::default())),
        }
    }
}

/// HTTP/1.1 connection pool.
pub struct Http1ConnPool {
    state: PoolState,
}

impl Http1ConnPool {
    pub fn new(host: Arc<Host>, priority: Priority) -> Self {
        Http1ConnPool {
            state: PoolState::new(host, priority),
        }
    }
}

impl ConnectionPool for Http1ConnPool {
    fn protocol(&self) -> Protocol {
        Protocol::Http1
    }

    fn host(&self) -> &Arc<Host> {
        &self.state.host
    }

    fn handle(&self) -> PoolHandle {
        PoolHandle {
            host: self.state.host.clone(),
            protocol: Protocol::Http1,
            priority: self.state.priority,
            core: self.state.core.clone(),
        }
    }

    fn active_streams(&self) -> u32 {
        self.state.core.lock().unwrap().active_streams.into()
    }

    fn add_drained_callback(&mut self, cb: Box<dyn FnOnce() + Send>) {
        core_add_drained_cb(&self.state.core, cb);
    }
}

/// HTTP/2 connection pool. One multiplexed connection per host; the
/// lifecycle contract is identical to HTTP/1.1.
pub struct Http2ConnPool {
    state: PoolState,
}

impl Http2ConnPool {
    pub fn new(host: Arc<Host>, priority: Priority) -> Self {
        Http2ConnPool {
            state: PoolState::new(host, priority),
        }
    }
}

impl ConnectionPool for Http2ConnPool {
    fn protocol(&self) -> Protocol {
        Protocol::Http2
    }

    fn host(&self) -> &Arc<Host> {
        &self.state.host
    }

    fn handle(&self) -> PoolHandle {
        PoolHandle {
            host: self.state.host.clone(),
            protocol: Protocol::Http2,
            priority: self.state.priority,
            core: self.state.core.clone(),
        }
    }

    fn active_streams(&self) -> u32 {
        self.state.core.lock().unwrap().active_streams.into()
    }

    fn add_drained_callback(&mut self, cb: Box<dyn FnOnce() + Send>) {
        core_add_drained_cb(&self.state.core, cb);
    }
}

/// Per-host bundle of priority-indexed pools, owned by one worker. The
/// `drains_remaining` counter coordinates teardown after the host leaves
/// its cluster.
pub struct ConnPoolsContainer {
    pub pools: [Option<Box<dyn ConnectionPool>>; NUM_PRIORITIES],
    pub drains_remaining: u32,
}

impl Default for ConnPoolsContainer {
    fn default() -> Self {
        ConnPoolsContainer {
            pools: [None, None],
            drains_remaining: 0,
        }
    }
}

/// Allocates a pool for a chosen host at a given priority.
pub trait ConnPoolFactory: Send + Sync {
    fn allocate(&self, host: &Arc<Host>, priority: Priority) -> Box<dyn ConnectionPool>;
}

/// Production factory: HTTP/2 when the cluster advertises it and the
/// runtime roll allows, HTTP/1.1 otherwise.
pub struct ProdConnPoolFactory {
    runtime: Arc<dyn Runtime>,
    log: Logger,
}

impl ProdConnPoolFactory {
    pub fn new(runtime: Arc<dyn Runtime>, log: Logger) -> Self {
        ProdConnPoolFactory { runtime, log }
    }
}

impl ConnPoolFactory for ProdConnPoolFactory {
    fn allocate(&self, host: &Arc<Host>, priority: Priority) -> Box<dyn ConnectionPool> {
        let use_http2 = host.cluster().has_http2_feature()
            && self.runtime.feature_enabled("upstream.use_http2", 100);
        debug!(
            self.log,
            "allocating connection pool";
            "cluster" => host.cluster().name(),
            "host" => host.url(),
            "protocol" => if use_http2 { "http2" } else { "http1" }
        );
        if use_http2 {
            Box::new(Http2ConnPool::new(host.clone(), priority))
        } else {
            Box::new(Http1ConnPool::new(host.clone(), priority))
        }
    }
}
