//! mysql_native_password, on both sides of the proxy.

use bytes::BytesMut;
use tracing::{debug, warn};

use crate::buffer::BufferChain;
use crate::protocol::handshake::{compute_token, AuthSwitchRequest};
use crate::protocol::packet::{put_header, DEFAULT_AUTH_PLUGIN, SCRAMBLE_LEN};

use super::{AuthExchange, AuthResult, Authenticator};

#[derive(Debug, Default)]
enum Phase {
    #[default]
    Waiting,
    SwitchParsed {
        sequence: u8,
    },
    Unsupported {
        plugin: String,
    },
}

/// Backend-side native-password exchange, entered after the initial auth
/// response was sent. The only message it expects is an auth-switch
/// request carrying a fresh scramble for the same plugin.
#[derive(Debug, Default)]
pub struct NativeBackendAuth {
    phase: Phase,
}

impl NativeBackendAuth {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Authenticator for NativeBackendAuth {
    fn extract(&mut self, exchange: &mut AuthExchange<'_>, buf: &BufferChain) -> bool {
        let Some(switch) = AuthSwitchRequest::parse(buf) else {
            return false;
        };
        if switch.plugin != DEFAULT_AUTH_PLUGIN {
            self.phase = Phase::Unsupported {
                plugin: switch.plugin,
            };
            return true;
        }
        if switch.scramble.len() < SCRAMBLE_LEN {
            return false;
        }
        exchange.scramble.copy_from_slice(&switch.scramble[..SCRAMBLE_LEN]);
        self.phase = Phase::SwitchParsed {
            sequence: switch.sequence,
        };
        true
    }

    fn authenticate(&mut self, exchange: &mut AuthExchange<'_>) -> AuthResult {
        match std::mem::take(&mut self.phase) {
            Phase::SwitchParsed { sequence } => {
                debug!("Answering auth method switch with a fresh scramble response");
                let reply = scramble_response(
                    exchange.credentials.password_sha1.as_ref(),
                    exchange.scramble,
                    sequence.wrapping_add(1),
                );
                exchange.dcb.write_queue.append(reply);
                AuthResult::Incomplete
            }
            Phase::Unsupported { plugin } => {
                warn!(plugin = %plugin, "Backend requested an unsupported authentication plugin");
                AuthResult::Failed
            }
            Phase::Waiting => AuthResult::Incomplete,
        }
    }
}

/// Build the bare scramble-token packet sent in response to an auth-switch
/// request.
pub fn scramble_response(
    password_sha1: Option<&[u8; SCRAMBLE_LEN]>,
    scramble: &[u8; SCRAMBLE_LEN],
    sequence: u8,
) -> BufferChain {
    let token: Vec<u8> = match password_sha1 {
        Some(sha1) => compute_token(sha1, scramble).to_vec(),
        None => Vec::new(),
    };
    let mut buf = BytesMut::with_capacity(4 + token.len());
    put_header(&mut buf, token.len(), sequence);
    buf.extend_from_slice(&token);
    BufferChain::from_bytes(buf.freeze())
}

/// Verifies clients against the configured service account and recovers
/// SHA1(password) for COM_CHANGE_USER re-personalisation.
#[derive(Debug, Clone)]
pub struct ClientVerifier {
    user: String,
    password_sha1: Option<[u8; SCRAMBLE_LEN]>,
    enable_root: bool,
}

impl ClientVerifier {
    pub fn new(user: &str, password: &str, enable_root: bool) -> Self {
        let password_sha1 = if password.is_empty() {
            None
        } else {
            Some(crate::protocol::handshake::sha1_digest(password.as_bytes()))
        };
        Self {
            user: user.to_string(),
            password_sha1,
            enable_root,
        }
    }

    /// Check a login attempt: the account must match the service account
    /// and the token must prove knowledge of its password.
    pub fn verify(&self, user: &str, token: &[u8], scramble: &[u8; SCRAMBLE_LEN]) -> bool {
        if user == "root" && !self.enable_root {
            warn!("Rejected login as root: enable_root is off");
            return false;
        }
        if user != self.user {
            return false;
        }
        match self.password_sha1.as_ref() {
            None => token.is_empty(),
            Some(sha1) => {
                let expected = compute_token(sha1, scramble);
                // Length mismatch fails before the comparison.
                token.len() == SCRAMBLE_LEN && constant_time_eq(token, &expected)
            }
        }
    }

    /// Re-verify for COM_CHANGE_USER; on success returns SHA1(password)
    /// for the backend-facing token.
    pub fn reauthenticate(
        &self,
        user: &str,
        token: &[u8],
        scramble: &[u8; SCRAMBLE_LEN],
    ) -> Option<Option<[u8; SCRAMBLE_LEN]>> {
        if self.verify(user, token, scramble) {
            Some(self.password_sha1)
        } else {
            None
        }
    }

    pub fn password_sha1(&self) -> Option<[u8; SCRAMBLE_LEN]> {
        self.password_sha1
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
