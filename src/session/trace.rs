//! Per-session statement trace.
//!
//! Keeps the last N statements in a ring so a session's tail can be dumped
//! to the log on close or on error, per the configured policy.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::info;

use crate::config::DumpPolicy;

pub struct SessionTrace {
    enabled: bool,
    capacity: usize,
    policy: DumpPolicy,
    ring: Mutex<VecDeque<String>>,
}

impl SessionTrace {
    pub fn new(enabled: bool, capacity: usize, policy: DumpPolicy) -> Self {
        Self {
            enabled,
            capacity: capacity.max(1),
            policy,
            ring: Mutex::new(VecDeque::new()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, 1, DumpPolicy::Never)
    }

    pub fn record(&self, statement: &str) {
        if !self.enabled {
            return;
        }
        let mut ring = self.ring.lock();
        if ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(statement.to_string());
    }

    pub fn dump_on_close(&self, session_id: u64) {
        if self.policy == DumpPolicy::OnClose {
            self.dump(session_id, "close");
        }
    }

    pub fn dump_on_error(&self, session_id: u64) {
        if matches!(self.policy, DumpPolicy::OnError | DumpPolicy::OnClose) {
            self.dump(session_id, "error");
        }
    }

    fn dump(&self, session_id: u64, why: &str) {
        if !self.enabled {
            return;
        }
        let ring = self.ring.lock();
        if ring.is_empty() {
            return;
        }
        for (i, stmt) in ring.iter().enumerate() {
            info!(
                session_id,
                reason = why,
                n = i + 1,
                statement = %stmt,
                "Session statement trace"
            );
        }
    }

    pub fn statements(&self) -> Vec<String> {
        self.ring.lock().iter().cloned().collect()
    }
}
