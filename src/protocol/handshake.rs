use bytes::{Buf, BufMut, BytesMut};
use sha1::{Digest, Sha1};

use crate::buffer::{tags, BufferChain};

use super::packet::{capabilities::*, put_header, Packet, DEFAULT_AUTH_PLUGIN, SCRAMBLE_LEN};

/// MySQL initial handshake packet (server -> client)
#[derive(Debug, Clone)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub auth_plugin_data_part1: [u8; 8],
    pub capability_flags: u32,
    pub character_set: u8,
    pub status_flags: u16,
    pub auth_plugin_data_part2: Vec<u8>,
    pub auth_plugin_name: String,
}

impl InitialHandshake {
    /// Create the handshake the proxy presents to its own clients.
    pub fn new(connection_id: u32) -> Self {
        let mut auth_data1 = [0u8; 8];
        let mut auth_data2 = vec![0u8; 12];

        use rand::RngCore;
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut auth_data1);
        rng.fill_bytes(&mut auth_data2);

        Self {
            protocol_version: 10,
            server_version: "5.5.5-10.6.14-viaduct".to_string(),
            connection_id,
            auth_plugin_data_part1: auth_data1,
            capability_flags: DEFAULT_CAPABILITIES,
            character_set: 0x21, // utf8_general_ci
            status_flags: 0x0002,
            auth_plugin_data_part2: auth_data2,
            auth_plugin_name: DEFAULT_AUTH_PLUGIN.to_string(),
        }
    }

    /// Get full auth plugin data (20 bytes)
    pub fn scramble(&self) -> [u8; SCRAMBLE_LEN] {
        let mut data = [0u8; SCRAMBLE_LEN];
        data[..8].copy_from_slice(&self.auth_plugin_data_part1);
        let part2 = &self.auth_plugin_data_part2;
        let take = part2.len().min(SCRAMBLE_LEN - 8);
        data[8..8 + take].copy_from_slice(&part2[..take]);
        data
    }

    /// Encode to packet
    pub fn encode(&self) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u8(self.protocol_version);

        buf.extend_from_slice(self.server_version.as_bytes());
        buf.put_u8(0);

        buf.put_u32_le(self.connection_id);

        buf.extend_from_slice(&self.auth_plugin_data_part1);

        // Filler
        buf.put_u8(0);

        buf.put_u16_le((self.capability_flags & 0xFFFF) as u16);
        buf.put_u8(self.character_set);
        buf.put_u16_le(self.status_flags);
        buf.put_u16_le(((self.capability_flags >> 16) & 0xFFFF) as u16);

        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.put_u8(
                (self.auth_plugin_data_part1.len() + self.auth_plugin_data_part2.len() + 1) as u8,
            );
        } else {
            buf.put_u8(0);
        }

        // Reserved
        buf.extend_from_slice(&[0u8; 10]);

        if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            buf.extend_from_slice(&self.auth_plugin_data_part2);
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.extend_from_slice(self.auth_plugin_name.as_bytes());
            buf.put_u8(0);
        }

        Packet::new(0, buf.freeze())
    }

    /// Parse from packet payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 32 {
            return None;
        }

        let mut buf = payload;

        let protocol_version = buf.get_u8();

        let null_pos = buf.iter().position(|&b| b == 0)?;
        let server_version = String::from_utf8_lossy(&buf[..null_pos]).to_string();
        buf.advance(null_pos + 1);

        if buf.len() < 27 {
            return None;
        }

        let connection_id = buf.get_u32_le();

        let mut auth_plugin_data_part1 = [0u8; 8];
        auth_plugin_data_part1.copy_from_slice(&buf[..8]);
        buf.advance(8);

        // Filler
        buf.advance(1);

        let capability_flags_lower = buf.get_u16_le() as u32;
        let character_set = buf.get_u8();
        let status_flags = buf.get_u16_le();
        let capability_flags_upper = buf.get_u16_le() as u32;
        let capability_flags = capability_flags_lower | (capability_flags_upper << 16);

        let auth_plugin_data_len = buf.get_u8();

        if buf.len() < 10 {
            return None;
        }
        buf.advance(10);

        let mut auth_plugin_data_part2 = Vec::new();
        if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            let len = std::cmp::max(13, auth_plugin_data_len.saturating_sub(8) as usize);
            if buf.len() < len {
                return None;
            }
            let data_len = buf.iter().take(len).position(|&b| b == 0).unwrap_or(len);
            auth_plugin_data_part2.extend_from_slice(&buf[..data_len]);
            buf.advance(len);
        }

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            String::from_utf8_lossy(&buf[..null_pos]).to_string()
        } else {
            DEFAULT_AUTH_PLUGIN.to_string()
        };

        Some(Self {
            protocol_version,
            server_version,
            connection_id,
            auth_plugin_data_part1,
            capability_flags,
            character_set,
            status_flags,
            auth_plugin_data_part2,
            auth_plugin_name,
        })
    }
}

/// MySQL handshake response packet (client -> server)
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub capability_flags: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin_name: String,
}

impl HandshakeResponse {
    /// Parse from packet payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 32 {
            return None;
        }

        let mut buf = payload;

        let capability_flags = buf.get_u32_le();
        let max_packet_size = buf.get_u32_le();
        let character_set = buf.get_u8();

        buf.advance(23);

        let null_pos = buf.iter().position(|&b| b == 0)?;
        let username = String::from_utf8_lossy(&buf[..null_pos]).to_string();
        buf.advance(null_pos + 1);

        let auth_response = if capability_flags
            & (CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA | CLIENT_SECURE_CONNECTION)
            != 0
        {
            if buf.is_empty() {
                return None;
            }
            let len = buf.get_u8() as usize;
            if buf.len() < len {
                return None;
            }
            let data = buf[..len].to_vec();
            buf.advance(len);
            data
        } else {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            let data = buf[..null_pos].to_vec();
            buf.advance((null_pos + 1).min(buf.len()));
            data
        };

        let database = if capability_flags & CLIENT_CONNECT_WITH_DB != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            let db = String::from_utf8_lossy(&buf[..null_pos]).to_string();
            buf.advance((null_pos + 1).min(buf.len()));
            if db.is_empty() {
                None
            } else {
                Some(db)
            }
        } else {
            None
        };

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            String::from_utf8_lossy(&buf[..null_pos]).to_string()
        } else {
            DEFAULT_AUTH_PLUGIN.to_string()
        };

        Some(Self {
            capability_flags,
            max_packet_size,
            character_set,
            username,
            auth_response,
            database,
            auth_plugin_name,
        })
    }

    /// Encode to packet
    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u32_le(self.capability_flags);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.character_set);

        buf.extend_from_slice(&[0u8; 23]);

        buf.extend_from_slice(self.username.as_bytes());
        buf.put_u8(0);

        if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            buf.put_u8(self.auth_response.len() as u8);
            buf.extend_from_slice(&self.auth_response);
        } else {
            buf.extend_from_slice(&self.auth_response);
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_CONNECT_WITH_DB != 0 {
            if let Some(ref db) = self.database {
                buf.extend_from_slice(db.as_bytes());
            }
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.extend_from_slice(self.auth_plugin_name.as_bytes());
            buf.put_u8(0);
        }

        Packet::new(sequence_id, buf.freeze())
    }
}

/// SHA1 of a byte slice, as a fixed array.
pub fn sha1_digest(data: &[u8]) -> [u8; SCRAMBLE_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute the mysql_native_password token from the plaintext password.
pub fn compute_auth_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    compute_token(&sha1_digest(password.as_bytes()), scramble).to_vec()
}

/// Compute the mysql_native_password token from SHA1(password):
/// `xor(sha1(password), sha1(scramble ∥ sha1(sha1(password))))`.
pub fn compute_token(password_sha1: &[u8; SCRAMBLE_LEN], scramble: &[u8]) -> [u8; SCRAMBLE_LEN] {
    let hash2 = sha1_digest(password_sha1);

    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(hash2);
    let salted: [u8; SCRAMBLE_LEN] = hasher.finalize().into();

    let mut token = [0u8; SCRAMBLE_LEN];
    for (i, b) in token.iter_mut().enumerate() {
        *b = password_sha1[i] ^ salted[i];
    }
    token
}

/// Server request to redo authentication with a different plugin.
#[derive(Debug, Clone)]
pub struct AuthSwitchRequest {
    pub plugin: String,
    pub scramble: Vec<u8>,
    pub sequence: u8,
}

impl AuthSwitchRequest {
    /// Parse the first packet of `chain` as an AuthSwitchRequest.
    pub fn parse(chain: &BufferChain) -> Option<Self> {
        use crate::protocol::framing;
        if !framing::is_auth_switch(chain) {
            return None;
        }
        let plen = framing::first_payload_len(chain)?;
        let sequence = framing::first_sequence(chain)?;
        let payload = chain.copy_bytes(super::packet::HEADER_LEN, plen)?;
        let body = &payload[1..];
        let null_pos = body.iter().position(|&b| b == 0)?;
        let plugin = String::from_utf8_lossy(&body[..null_pos]).to_string();
        let mut scramble = body[null_pos + 1..].to_vec();
        // The scramble is NUL-terminated on the wire.
        if scramble.last() == Some(&0) {
            scramble.pop();
        }
        Some(Self {
            plugin,
            scramble,
            sequence,
        })
    }
}

/// OK packet
#[derive(Debug, Clone)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
}

impl OkPacket {
    pub fn new() -> Self {
        Self {
            affected_rows: 0,
            last_insert_id: 0,
            status_flags: 0x0002, // SERVER_STATUS_AUTOCOMMIT
            warnings: 0,
        }
    }

    pub fn encode(&self, sequence_id: u8, capabilities: u32) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u8(0x00);
        super::packet::put_lenenc_int(&mut buf, self.affected_rows);
        super::packet::put_lenenc_int(&mut buf, self.last_insert_id);

        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u16_le(self.status_flags);
            buf.put_u16_le(self.warnings);
        }

        Packet::new(sequence_id, buf.freeze())
    }
}

impl Default for OkPacket {
    fn default() -> Self {
        Self::new()
    }
}

/// ERR packet
#[derive(Debug, Clone)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: String,
    pub error_message: String,
}

impl ErrPacket {
    pub fn new(error_code: u16, sql_state: &str, error_message: &str) -> Self {
        Self {
            error_code,
            sql_state: sql_state.to_string(),
            error_message: error_message.to_string(),
        }
    }

    pub fn encode(&self, sequence_id: u8, capabilities: u32) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u8(0xFF);
        buf.put_u16_le(self.error_code);

        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u8(b'#');
            buf.extend_from_slice(self.sql_state.as_bytes());
        }

        buf.extend_from_slice(self.error_message.as_bytes());

        Packet::new(sequence_id, buf.freeze())
    }
}

/// Build the synthetic error the error funnel shows to clients.
pub fn custom_error(sequence: u8, message: &str) -> BufferChain {
    let pkt = ErrPacket::new(2003, "HY000", message).encode(sequence, CLIENT_PROTOCOL_41);
    BufferChain::from_bytes(pkt.to_vec())
}

/// Build a COM_QUIT packet.
pub fn build_com_quit() -> BufferChain {
    BufferChain::from_bytes(vec![1, 0, 0, 0, 0x01])
}

/// Build a COM_CHANGE_USER packet from a credential snapshot and the
/// backend's scramble.
///
/// Payload layout: command 0x11, username NUL, 1-byte token length, the
/// 20-byte token when a password is set, default schema NUL, 2-byte
/// charset, authentication plugin name NUL. The buffer is tagged for
/// result collection: the full reply must be in hand before the next
/// command is allowed out.
pub fn build_change_user(
    user: &str,
    password_sha1: Option<&[u8; SCRAMBLE_LEN]>,
    db: &str,
    charset: u16,
    scramble: &[u8; SCRAMBLE_LEN],
) -> BufferChain {
    let mut payload = BytesMut::new();
    payload.put_u8(0x11);
    payload.extend_from_slice(user.as_bytes());
    payload.put_u8(0);

    match password_sha1 {
        Some(sha1) => {
            let token = compute_token(sha1, scramble);
            payload.put_u8(SCRAMBLE_LEN as u8);
            payload.extend_from_slice(&token);
        }
        None => payload.put_u8(0),
    }

    payload.extend_from_slice(db.as_bytes());
    payload.put_u8(0);
    payload.put_u16_le(charset);
    payload.extend_from_slice(DEFAULT_AUTH_PLUGIN.as_bytes());
    payload.put_u8(0);

    let mut buf = BytesMut::with_capacity(payload.len() + 4);
    put_header(&mut buf, payload.len(), 0);
    buf.extend_from_slice(&payload);

    let mut chain = BufferChain::from_bytes(buf.freeze());
    chain.set_tag(tags::COLLECT_RESULT);
    chain
}

/// Parse a COM_CHANGE_USER packet from a client.
#[derive(Debug, Clone)]
pub struct ChangeUserRequest {
    pub user: String,
    pub token: Vec<u8>,
    pub database: String,
    pub charset: u16,
}

impl ChangeUserRequest {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.first() != Some(&0x11) {
            return None;
        }
        let mut buf = &payload[1..];

        let null_pos = buf.iter().position(|&b| b == 0)?;
        let user = String::from_utf8_lossy(&buf[..null_pos]).to_string();
        buf = &buf[null_pos + 1..];

        let token_len = *buf.first()? as usize;
        buf = &buf[1..];
        if buf.len() < token_len {
            return None;
        }
        let token = buf[..token_len].to_vec();
        buf = &buf[token_len..];

        let null_pos = buf.iter().position(|&b| b == 0)?;
        let database = String::from_utf8_lossy(&buf[..null_pos]).to_string();
        buf = &buf[null_pos + 1..];

        let charset = if buf.len() >= 2 {
            u16::from_le_bytes([buf[0], buf[1]])
        } else {
            0x21
        };

        Some(Self {
            user,
            token,
            database,
            charset,
        })
    }
}
