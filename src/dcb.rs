//! Descriptor/connection blocks.
//!
//! One `Dcb` exists per socket the proxy owns, client or backend. It holds
//! the byte queues the protocol state machines operate on and the pooling
//! and error-funnel bookkeeping. A DCB is reachable from at most one of
//! {owning session task, connection pool, close path} at any time, and is
//! only mutated under its owning worker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde_json::json;

use crate::buffer::BufferChain;
use crate::worker::{WorkerId, Workers};

static NEXT_DCB_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DcbRole {
    Client,
    Backend,
    Internal,
}

impl DcbRole {
    fn as_str(&self) -> &'static str {
        match self {
            DcbRole::Client => "client",
            DcbRole::Backend => "backend",
            DcbRole::Internal => "internal",
        }
    }
}

#[derive(Debug)]
pub struct Dcb {
    pub id: u64,
    pub role: DcbRole,
    pub owner: WorkerId,
    /// Owning session, None while pooled.
    pub session: Option<u64>,
    /// Name of the backend server, for backend DCBs.
    pub server: Option<String>,
    /// Bytes pulled from the socket but not yet framed.
    pub read_queue: BufferChain,
    /// Framed bytes not yet drained to the socket.
    pub write_queue: BufferChain,
    /// Requests accepted while authentication was still in progress.
    pub delay_queue: BufferChain,
    /// Backend connection id reported in the server handshake.
    pub thread_id: u32,
    /// Suppress error logging for writes on a DCB being torn down.
    pub silence_write_errors: bool,
    pub closing: bool,
    pool_start: Option<Instant>,
    was_persistent: bool,
    errhandle_called: bool,
}

impl Dcb {
    pub fn new(role: DcbRole, owner: WorkerId) -> Self {
        Self {
            id: NEXT_DCB_ID.fetch_add(1, Ordering::Relaxed),
            role,
            owner,
            session: None,
            server: None,
            read_queue: BufferChain::new(),
            write_queue: BufferChain::new(),
            delay_queue: BufferChain::new(),
            thread_id: 0,
            silence_write_errors: false,
            closing: false,
            pool_start: None,
            was_persistent: false,
            errhandle_called: false,
        }
    }

    pub fn new_client(owner: WorkerId, session: u64) -> Self {
        let mut dcb = Self::new(DcbRole::Client, owner);
        dcb.session = Some(session);
        dcb
    }

    pub fn new_backend(owner: WorkerId, session: u64, server: &str) -> Self {
        let mut dcb = Self::new(DcbRole::Backend, owner);
        dcb.session = Some(session);
        dcb.server = Some(server.to_string());
        dcb
    }

    /// Assert the caller runs under this DCB's owning worker. Mutation from
    /// any other worker is a bug.
    pub fn assert_owner(&self) {
        if let Some(current) = Workers::current() {
            debug_assert_eq!(
                current, self.owner,
                "DCB {} owned by {} mutated from {}",
                self.id, self.owner, current
            );
        }
    }

    pub fn is_pooled(&self) -> bool {
        self.pool_start.is_some()
    }

    pub fn pooled_for(&self) -> Option<Duration> {
        self.pool_start.map(|t| t.elapsed())
    }

    /// Detach from the session and stamp the pool entry time.
    pub fn enter_pool(&mut self) {
        self.session = None;
        self.pool_start = Some(Instant::now());
    }

    /// Adopt out of the pool into `session` on `worker`. Sets the
    /// was-persistent flag, which the next write consumes exactly once.
    pub fn adopt(&mut self, session: u64, worker: WorkerId) {
        self.pool_start = None;
        self.session = Some(session);
        self.owner = worker;
        self.was_persistent = true;
        self.errhandle_called = false;
    }

    pub fn was_persistent(&self) -> bool {
        self.was_persistent
    }

    /// Read and clear the was-persistent flag.
    pub fn take_persistent(&mut self) -> bool {
        std::mem::take(&mut self.was_persistent)
    }

    /// First call returns true; later calls are no-ops. This is what makes
    /// the error funnel re-entrancy safe per DCB.
    pub fn mark_error_handled(&mut self) -> bool {
        !std::mem::replace(&mut self.errhandle_called, true)
    }

    pub fn error_handled(&self) -> bool {
        self.errhandle_called
    }

    /// All queues empty, nothing buffered in either direction.
    pub fn queues_clean(&self) -> bool {
        self.read_queue.is_empty() && self.write_queue.is_empty() && self.delay_queue.is_empty()
    }

    /// Per-DCB diagnostics for the admin surface.
    pub fn diagnostics(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "role": self.role.as_str(),
            "worker": self.owner.0,
            "session": self.session,
            "server": self.server,
            "connection_id": self.thread_id,
            "read_queue_bytes": self.read_queue.len(),
            "write_queue_bytes": self.write_queue.len(),
            "delay_queue_bytes": self.delay_queue.len(),
            "pooled": self.is_pooled(),
        })
    }
}
