//! Pluggable authentication.
//!
//! The backend state machine drives authentication through the
//! `Authenticator` trait: `extract` parses a server message and stashes
//! whatever the plugin needs, `authenticate` produces the next client-side
//! message or declares the exchange finished. The proxy handles
//! `mysql_native_password` itself; anything else fails the exchange.

pub mod native;

pub use native::{ClientVerifier, NativeBackendAuth};

use crate::buffer::BufferChain;
use crate::dcb::Dcb;
use crate::protocol::packet::SCRAMBLE_LEN;

/// Outcome of one `authenticate` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResult {
    /// More round trips are needed.
    Incomplete,
    /// Waiting on the TLS handshake to finish.
    SslIncomplete,
    Succeeded,
    Failed,
}

/// Authenticated identity a session carries, used to personalise pooled
/// backends via COM_CHANGE_USER.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    /// SHA1(password); None when the account has no password.
    pub password_sha1: Option<[u8; SCRAMBLE_LEN]>,
    /// Default schema, empty when none was selected.
    pub db: String,
    pub charset: u16,
}

impl Credentials {
    pub fn new(user: &str, password: &str, db: &str, charset: u16) -> Self {
        let password_sha1 = if password.is_empty() {
            None
        } else {
            Some(crate::protocol::handshake::sha1_digest(password.as_bytes()))
        };
        Self {
            user: user.to_string(),
            password_sha1,
            db: db.to_string(),
            charset,
        }
    }
}

/// State the machine lends an authenticator for one exchange step.
pub struct AuthExchange<'a> {
    pub dcb: &'a mut Dcb,
    /// The backend's current scramble; auth-switch replaces it.
    pub scramble: &'a mut [u8; SCRAMBLE_LEN],
    pub credentials: &'a Credentials,
}

pub trait Authenticator: Send {
    /// Parse a server message (auth-switch request, extra plugin data) and
    /// stash what the plugin needs. Returns false when the message cannot
    /// be understood.
    fn extract(&mut self, exchange: &mut AuthExchange<'_>, buf: &BufferChain) -> bool;

    /// Produce and queue the next client-side message, or declare the
    /// exchange finished.
    fn authenticate(&mut self, exchange: &mut AuthExchange<'_>) -> AuthResult;
}
