//! The routing contract the core drives, plus the pass-through reference
//! router the binary wires up.
//!
//! Routing policy lives behind this trait; the core only asks three
//! questions: which backend, what to do with a reply, and whether a failed
//! backend ends the session.

use std::sync::Arc;

use tracing::warn;

use crate::buffer::BufferChain;
use crate::server::{Server, ServerRegistry};
use crate::session::SessionShared;

/// Capabilities a router declares; they select the response assembly mode
/// of the backend protocol.
pub mod rcap {
    /// Emit each packet separately.
    pub const PACKET_OUTPUT: u64 = 1;
    /// Assemble per-statement boundaries.
    pub const STMT_OUTPUT: u64 = 1 << 1;
    /// Buffer whole result sets before emitting.
    pub const RESULTSET_OUTPUT: u64 = 1 << 2;
    /// Make assembled messages contiguous before emitting.
    pub const CONTIGUOUS_OUTPUT: u64 = 1 << 3;
    /// Parse session-state changes from OK packets.
    pub const SESSION_STATE_TRACKING: u64 = 1 << 4;
    /// Requests arrive one statement at a time; track the command byte.
    pub const STMT_INPUT: u64 = 1 << 5;
}

pub fn rcap_required(capabilities: u64, required: u64) -> bool {
    capabilities & required == required
}

/// What the error funnel does with a failed backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Send a synthetic error packet to the client and keep the session.
    ReplyClient,
    /// Abandon this backend and try another.
    NewConnection,
}

pub trait Router: Send + Sync {
    /// Bitset of `rcap` constants.
    fn capabilities(&self) -> u64;

    /// Choose a backend server for a session.
    fn select_backend(&self, registry: &ServerRegistry) -> Option<Arc<Server>>;

    /// Observe/transform a reply on its way to the client.
    fn client_reply(&self, _session: &SessionShared, reply: BufferChain) -> BufferChain {
        reply
    }

    /// Decide whether the session survives a backend failure. Returning
    /// false marks the session close-reason as handle-error-failed and
    /// tears it down.
    fn handle_error(
        &self,
        session: &SessionShared,
        errbuf: &BufferChain,
        failed_server: Option<&str>,
        action: ErrorAction,
    ) -> bool;
}

/// Forwards every statement to the first server that is not in
/// maintenance. Statement-at-a-time in, statement-at-a-time out.
pub struct PassthroughRouter;

impl Router for PassthroughRouter {
    fn capabilities(&self) -> u64 {
        rcap::STMT_INPUT | rcap::STMT_OUTPUT
    }

    fn select_backend(&self, registry: &ServerRegistry) -> Option<Arc<Server>> {
        registry
            .all()
            .iter()
            .find(|s| !s.is_in_maintenance())
            .cloned()
    }

    fn handle_error(
        &self,
        session: &SessionShared,
        errbuf: &BufferChain,
        failed_server: Option<&str>,
        action: ErrorAction,
    ) -> bool {
        let message = crate::protocol::error_message(errbuf).unwrap_or_default();
        warn!(
            session_id = session.id,
            server = failed_server.unwrap_or("-"),
            action = ?action,
            error = %message,
            "Backend failed"
        );
        match action {
            // The synthetic error already went to the client; without a
            // spare backend there is nothing to keep the session for.
            ErrorAction::ReplyClient => false,
            ErrorAction::NewConnection => true,
        }
    }
}
