//! Per-server, per-worker pool of idle authenticated backend connections.
//!
//! A connection may enter the pool only in the Complete state with clean
//! queues and no swallowed replies outstanding. Adoption stamps the DCB so
//! the next write synthesises a COM_CHANGE_USER, and a pooled socket with
//! stray readable bytes is treated as hung up and discarded.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::backend::machine::BackendProtocol;
use crate::backend::BackendStream;
use crate::dcb::Dcb;
use crate::metrics::metrics;
use crate::server::Server;
use crate::worker::WorkerId;

/// An idle authenticated backend connection detached from any session.
pub struct PooledBackend {
    pub stream: BackendStream,
    pub dcb: Dcb,
    pub machine: BackendProtocol,
    pub server: Arc<Server>,
}

type PoolKey = (String, WorkerId);

#[derive(Default)]
pub struct ConnectionPool {
    entries: Mutex<HashMap<PoolKey, VecDeque<PooledBackend>>>,
}

impl ConnectionPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Accept a connection into the pool. Rejects entries that violate the
    /// cleanliness contract or would exceed the server's pool size, handing
    /// them back for a regular close.
    pub fn put(&self, entry: PooledBackend) -> Result<(), PooledBackend> {
        if !entry.dcb.is_pooled()
            || !entry.machine.can_pool(&entry.dcb)
            || !entry.server.persistent_conns_enabled()
        {
            warn!(
                server = %entry.server.name,
                "Connection does not qualify for pooling"
            );
            return Err(entry);
        }

        let key = (entry.server.name.clone(), entry.dcb.owner);
        let mut entries = self.entries.lock();
        let queue = entries.entry(key).or_default();
        if queue.len() >= entry.server.persistent_pool.size {
            debug!(server = %entry.server.name, "Pool full, closing connection instead");
            return Err(entry);
        }
        queue.push_back(entry);
        Ok(())
    }

    /// Take an idle connection for `session`. Entries that aged out or have
    /// stray readable bytes are dropped on the way.
    pub fn adopt(&self, server: &str, worker: WorkerId, session: u64) -> Option<PooledBackend> {
        let key = (server.to_string(), worker);
        let mut entries = self.entries.lock();
        let queue = entries.get_mut(&key)?;

        while let Some(mut entry) = queue.pop_front() {
            let max_age = entry.server.persistent_pool.max_age;
            if entry.dcb.pooled_for().is_some_and(|age| age > max_age) {
                debug!(server = %entry.server.name, "Pooled connection aged out, discarding");
                metrics().record_pool_eviction();
                continue;
            }

            let mut probe = [0u8; 1];
            match entry.stream.try_read(&mut probe) {
                // Data or EOF on a pooled socket: the server gave up on it.
                Ok(_) => {
                    debug!(
                        server = %entry.server.name,
                        "Pooled connection became readable, discarding"
                    );
                    metrics().record_pool_eviction();
                    continue;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => {
                    metrics().record_pool_eviction();
                    continue;
                }
            }

            entry.dcb.adopt(session, worker);
            return Some(entry);
        }
        None
    }

    /// Drop aged entries across all servers; runs from the main worker.
    pub fn sweep(&self) -> usize {
        let mut dropped = 0;
        let mut entries = self.entries.lock();
        for queue in entries.values_mut() {
            queue.retain(|entry| {
                let keep = entry
                    .dcb
                    .pooled_for()
                    .is_some_and(|age| age <= entry.server.persistent_pool.max_age);
                if !keep {
                    dropped += 1;
                }
                keep
            });
        }
        if dropped > 0 {
            debug!(dropped, "Swept aged connections out of the pool");
            for _ in 0..dropped {
                metrics().record_pool_eviction();
            }
        }
        dropped
    }

    pub fn idle_count(&self) -> usize {
        self.entries.lock().values().map(|q| q.len()).sum()
    }
}
