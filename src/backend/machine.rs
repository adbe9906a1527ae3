//! The backend protocol state machine.
//!
//! Drives one backend DCB through connect → handshake → authentication →
//! steady-state query/response → COM_CHANGE_USER reuse. The machine is
//! event-driven and does no I/O itself: outbound bytes land in the DCB's
//! write queue, inbound bytes arrive through `on_readable`, and everything
//! the driver must act on comes back as `Effect`s. This is what makes the
//! whole protocol exercisable in unit tests without sockets.

use tracing::{debug, error, info, warn};

use crate::auth::{AuthExchange, AuthResult, Authenticator, NativeBackendAuth};
use crate::buffer::{tags, BufferChain};
use crate::dcb::Dcb;
use crate::protocol::framing::{self, TrackEntry};
use crate::protocol::handshake::{build_change_user, HandshakeResponse, InitialHandshake};
use crate::protocol::packet::{
    capabilities, er, Command, HEADER_LEN, MAX_PAYLOAD_LEN, SCRAMBLE_LEN,
};
use crate::router::{rcap, rcap_required, ErrorAction};
use crate::server::Server;
use crate::session::SessionShared;

/// Authentication state of one backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Init,
    /// Non-blocking connect in flight.
    PendingConnect,
    /// TCP is up, waiting for the server handshake.
    Connected,
    /// Auth response sent, awaiting the server verdict.
    ResponseSent,
    /// Ready for queries.
    Complete,
    HandshakeFailed,
    Failed,
}

impl AuthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthState::Init => "init",
            AuthState::PendingConnect => "pending_connect",
            AuthState::Connected => "connected",
            AuthState::ResponseSent => "response_sent",
            AuthState::Complete => "complete",
            AuthState::HandshakeFailed => "handshake_failed",
            AuthState::Failed => "failed",
        }
    }
}

/// What the driver must do after feeding the machine an event.
#[derive(Debug)]
pub enum Effect {
    /// Deliver an assembled message to the router's reply path.
    Reply(BufferChain),
    /// Funnel a failure to the session-level error handler.
    Error {
        action: ErrorAction,
        message: String,
    },
    /// Post a task to the main worker marking the server under maintenance.
    MarkServerMaintenance,
    /// Post a task to the main worker refreshing the service's user data.
    RefreshUsers,
    /// Force this DCB through its error path.
    FakeHangup,
}

/// Per-backend-DCB protocol state.
pub struct BackendProtocol {
    state: AuthState,
    auth: Box<dyn Authenticator>,
    router_caps: u64,
    pub(crate) current_command: Command,
    /// The previous outbound packet filled a max-size frame; the next one
    /// continues it and carries no command byte.
    pub(crate) large_query: bool,
    pub(crate) collect_result: bool,
    track_state: bool,
    pub(crate) changing_user: bool,
    pub(crate) ignore_replies: u32,
    pub(crate) stored_query: Option<BufferChain>,
    delay_flushed: bool,
    pending_change_user: bool,
    client_capabilities: u32,
    server_capabilities: u32,
    charset: u16,
    scramble: [u8; SCRAMBLE_LEN],
    thread_id: u32,
    /// Sequence byte of the last reply an ignorable drain kept.
    pub(crate) last_drain_sequence: Option<u8>,
}

impl BackendProtocol {
    pub fn new(router_caps: u64, client_capabilities: u32, charset: u16) -> Self {
        Self::with_authenticator(
            Box::new(NativeBackendAuth::new()),
            router_caps,
            client_capabilities,
            charset,
        )
    }

    pub fn with_authenticator(
        auth: Box<dyn Authenticator>,
        router_caps: u64,
        client_capabilities: u32,
        charset: u16,
    ) -> Self {
        Self {
            state: AuthState::Init,
            auth,
            router_caps,
            current_command: Command::Sleep,
            large_query: false,
            collect_result: false,
            track_state: false,
            changing_user: false,
            ignore_replies: 0,
            stored_query: None,
            delay_flushed: false,
            pending_change_user: false,
            client_capabilities,
            server_capabilities: 0,
            charset,
            scramble: [0; SCRAMBLE_LEN],
            thread_id: 0,
            last_drain_sequence: None,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == AuthState::Complete
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub fn scramble(&self) -> &[u8; SCRAMBLE_LEN] {
        &self.scramble
    }

    /// Connection attempt went non-blocking.
    pub fn connect_started(&mut self) {
        self.state = AuthState::PendingConnect;
    }

    /// TCP is established. The proxy-protocol header, when configured,
    /// must precede all protocol traffic.
    pub fn connect_established(&mut self, dcb: &mut Dcb, proxy_header: Option<String>) {
        self.state = AuthState::Connected;
        if let Some(header) = proxy_header {
            debug!(header = %header.trim_end(), "Sending proxy protocol header");
            dcb.write_queue.append_bytes(header.into_bytes());
        }
    }

    pub fn connect_failed(&mut self) {
        self.state = AuthState::Failed;
    }

    /// Whether this connection is clean enough to enter the pool.
    pub fn can_pool(&self, dcb: &Dcb) -> bool {
        self.state == AuthState::Complete
            && self.ignore_replies == 0
            && self.stored_query.is_none()
            && !self.changing_user
            && dcb.queues_clean()
    }

    /// The outbound write path.
    pub fn write(
        &mut self,
        dcb: &mut Dcb,
        session: &SessionShared,
        server: &Server,
        buf: BufferChain,
    ) -> (bool, Vec<Effect>) {
        let mut effects = Vec::new();
        let ok = self.write_inner(dcb, session, server, buf, &mut effects);
        (ok, effects)
    }

    fn write_inner(
        &mut self,
        dcb: &mut Dcb,
        session: &SessionShared,
        server: &Server,
        buf: BufferChain,
        effects: &mut Vec<Effect>,
    ) -> bool {
        dcb.assert_owner();

        if dcb.take_persistent() {
            // Adopted from the pool: discard any stale state and
            // re-personalise with a synthesised COM_CHANGE_USER before the
            // caller's request goes out.
            self.ignore_replies = 0;
            self.stored_query = None;

            if self.state != AuthState::Complete {
                warn!(
                    session_id = session.id,
                    state = self.state.as_str(),
                    "Adopted connection is not ready for use"
                );
                return false;
            }

            if command_of(&buf) == Some(Command::Quit) {
                // The session is closing before its first statement; the
                // connection goes back to the pool untouched.
                debug!(
                    session_id = session.id,
                    "COM_QUIT as the first write on an adopted connection, ignoring"
                );
                return true;
            }

            let creds = session.credentials();
            let mut change_user = build_change_user(
                &creds.user,
                creds.password_sha1.as_ref(),
                &creds.db,
                creds.charset,
                &self.scramble,
            );
            change_user.set_tag(tags::IGNORABLE);
            self.charset = creds.charset;
            dcb.write_queue.append(change_user);
            self.ignore_replies = 1;
            self.changing_user = true;
            // A synthesised change-user already carries the current
            // credentials; a second one from the caller would be redundant.
            if command_of(&buf) != Some(Command::ChangeUser) {
                self.stored_query = Some(buf);
            }
            info!(
                session_id = session.id,
                user = %creds.user,
                server = %server.name,
                "Sent COM_CHANGE_USER to adopted connection"
            );
            return true;
        }

        if self.ignore_replies > 0 {
            if command_of(&buf) == Some(Command::Quit) {
                // COM_QUIT cannot be mixed with an in-flight reply that
                // must be swallowed.
                debug!(
                    session_id = session.id,
                    "COM_QUIT while COM_CHANGE_USER is in progress, closing connection"
                );
                effects.push(Effect::FakeHangup);
                return false;
            }
            match self.stored_query.as_mut() {
                Some(stored) => stored.append(buf),
                None => self.stored_query = Some(buf),
            }
            debug!(
                session_id = session.id,
                "COM_CHANGE_USER in progress, appending request to stored query"
            );
            return true;
        }

        match self.state {
            AuthState::HandshakeFailed | AuthState::Failed => {
                if !dcb.silence_write_errors {
                    error!(
                        session_id = session.id,
                        server = %server.name,
                        "Unable to write to backend due to {} failure",
                        if self.state == AuthState::HandshakeFailed {
                            "handshake"
                        } else {
                            "authentication"
                        }
                    );
                }
                false
            }
            AuthState::Complete => {
                self.prepare_for_write(session, &buf);

                if session.load_data_active() && framing::first_payload_len(&buf) == Some(0) {
                    // The empty packet terminates a LOAD DATA LOCAL stream.
                    session.set_load_data_active(false);
                }

                if command_of(&buf) == Some(Command::Quit) && server.persistent_conns_enabled() {
                    // Pooled connections stay alive; the COM_QUIT is dropped
                    // and the DCB is returned to the pool on close instead.
                    return true;
                }

                if buf.has_tag(tags::IGNORABLE) {
                    self.ignore_replies += 1;
                }

                dcb.write_queue.append(buf);
                true
            }
            _ => {
                // Authentication still in flight: park the request.
                self.prepare_for_write(session, &buf);
                dcb.delay_queue.append(buf);
                debug!(
                    session_id = session.id,
                    state = self.state.as_str(),
                    "Delaying write until authentication completes"
                );
                true
            }
        }
    }

    /// Synthesise a COM_CHANGE_USER for the session's current credentials
    /// and send it through the write path. Used when a client re-issues
    /// COM_CHANGE_USER; the packet must carry this backend's scramble, not
    /// the client-facing one.
    pub fn write_change_user(
        &mut self,
        dcb: &mut Dcb,
        session: &SessionShared,
        server: &Server,
    ) -> (bool, Vec<Effect>) {
        if self.state != AuthState::Complete {
            // Recreated with the backend scramble once auth finishes.
            self.pending_change_user = true;
            return (true, Vec::new());
        }
        if dcb.was_persistent() {
            // The adoption change-user and the client's are one and the
            // same exchange here, and the client is owed the reply.
            dcb.take_persistent();
            self.ignore_replies = 0;
            self.stored_query = None;
        }
        let creds = session.credentials();
        let change_user = build_change_user(
            &creds.user,
            creds.password_sha1.as_ref(),
            &creds.db,
            creds.charset,
            &self.scramble,
        );
        self.charset = creds.charset;
        let (ok, effects) = {
            let mut effects = Vec::new();
            let ok = self.write_inner(dcb, session, server, change_user, &mut effects);
            (ok, effects)
        };
        if ok {
            self.changing_user = true;
        }
        (ok, effects)
    }

    fn prepare_for_write(&mut self, session: &SessionShared, buf: &BufferChain) {
        if rcap_required(self.router_caps, rcap::STMT_INPUT) {
            if !self.large_query && !session.load_data_active() {
                if let Some(cmd) = command_of(buf) {
                    self.current_command = cmd;
                }
            }
            // current_command must keep naming the latest command even when
            // a statement spans several max-size frames.
            self.large_query = framing::first_payload_len(buf) == Some(MAX_PAYLOAD_LEN);
        }

        if buf.has_tag(tags::COLLECT_RESULT) {
            self.collect_result = true;
        }
        self.track_state = buf.has_tag(tags::TRACK_STATE);
    }

    /// The inbound read path. `data` is whatever the driver pulled off the
    /// socket; zero or more effects come back.
    pub fn on_readable(
        &mut self,
        dcb: &mut Dcb,
        session: &SessionShared,
        server: &Server,
        data: &[u8],
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        dcb.assert_owner();

        if dcb.is_pooled() {
            // A read event on a pooled connection means the server sent
            // something unsolicited or hung up; either way the connection
            // is unusable. The read queue is left untouched.
            effects.push(Effect::FakeHangup);
            return effects;
        }

        if !data.is_empty() {
            dcb.read_queue.append_bytes(data.to_vec());
        }

        match self.state {
            AuthState::Complete => self.read_and_write(dcb, session, server, &mut effects),
            AuthState::Connected | AuthState::ResponseSent => {
                // The exchange may deliver several packets in one read
                // (e.g. an auth-switch request followed by the verdict).
                while matches!(self.state, AuthState::Connected | AuthState::ResponseSent)
                    && framing::packet_count(&dcb.read_queue) > 0
                {
                    self.read_auth(dcb, session, server, &mut effects);
                }
                if self.state == AuthState::Complete && !dcb.read_queue.is_empty() {
                    self.read_and_write(dcb, session, server, &mut effects);
                }
            }
            _ => {
                self.fail(
                    dcb,
                    ErrorAction::NewConnection,
                    "Backend sent data in an unexpected state",
                    &mut effects,
                );
            }
        }
        effects
    }

    fn read_auth(
        &mut self,
        dcb: &mut Dcb,
        session: &SessionShared,
        server: &Server,
        effects: &mut Vec<Effect>,
    ) {
        let Some(packet) = framing::next_packet(&mut dcb.read_queue) else {
            return;
        };
        let packet = packet.into_contiguous();

        if framing::is_err_packet(&packet) {
            self.state = if self.state == AuthState::Connected {
                AuthState::HandshakeFailed
            } else {
                AuthState::Failed
            };
            self.handle_error_response(server, &packet, effects);
            self.reply_on_error(dcb, server, effects);
            return;
        }

        match self.state {
            AuthState::Connected => {
                let plen = framing::first_payload_len(&packet).unwrap_or(0);
                let payload = packet.copy_bytes(HEADER_LEN, plen).unwrap_or_default();
                match InitialHandshake::parse(&payload) {
                    Some(handshake) => {
                        self.server_capabilities = handshake.capability_flags;
                        self.thread_id = handshake.connection_id;
                        self.scramble = handshake.scramble();
                        dcb.thread_id = handshake.connection_id;
                        debug!(
                            session_id = session.id,
                            server = %server.name,
                            version = %handshake.server_version,
                            thread_id = handshake.connection_id,
                            "Received backend handshake"
                        );
                        let sequence = framing::first_sequence(&packet).unwrap_or(0);
                        self.send_auth_response(dcb, session, sequence.wrapping_add(1));
                        self.state = AuthState::ResponseSent;
                    }
                    None => {
                        self.state = AuthState::HandshakeFailed;
                        self.reply_on_error(dcb, server, effects);
                    }
                }
            }
            AuthState::ResponseSent => {
                if framing::is_ok_packet(&packet) {
                    self.complete_authentication(dcb, session);
                } else {
                    let creds = session.credentials();
                    let result = {
                        let mut exchange = AuthExchange {
                            dcb: &mut *dcb,
                            scramble: &mut self.scramble,
                            credentials: &creds,
                        };
                        if self.auth.extract(&mut exchange, &packet) {
                            Some(self.auth.authenticate(&mut exchange))
                        } else {
                            None
                        }
                    };
                    match result {
                        Some(AuthResult::Incomplete) | Some(AuthResult::SslIncomplete) => {}
                        Some(AuthResult::Succeeded) => self.complete_authentication(dcb, session),
                        Some(AuthResult::Failed) | None => {
                            self.state = AuthState::Failed;
                            self.reply_on_error(dcb, server, effects);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn complete_authentication(&mut self, dcb: &mut Dcb, session: &SessionShared) {
        self.state = AuthState::Complete;
        debug!(
            session_id = session.id,
            thread_id = self.thread_id,
            "Backend authentication complete"
        );
        self.flush_delay_queue(dcb, session);
    }

    /// Drained at most once per DCB lifetime, on the transition into
    /// Complete.
    fn flush_delay_queue(&mut self, dcb: &mut Dcb, session: &SessionShared) {
        if self.delay_flushed {
            return;
        }
        self.delay_flushed = true;

        if self.pending_change_user {
            self.pending_change_user = false;
            let creds = session.credentials();
            let change_user = build_change_user(
                &creds.user,
                creds.password_sha1.as_ref(),
                &creds.db,
                creds.charset,
                &self.scramble,
            );
            self.current_command = Command::ChangeUser;
            self.collect_result = true;
            self.changing_user = true;
            dcb.write_queue.append(change_user);
        }

        let queued = dcb.delay_queue.take();
        if !queued.is_empty() {
            debug!(
                session_id = session.id,
                bytes = queued.len(),
                "Flushing delayed writes after authentication"
            );
            dcb.write_queue.append(queued);
        }
    }

    fn send_auth_response(&mut self, dcb: &mut Dcb, session: &SessionShared, sequence: u8) {
        let creds = session.credentials();

        let mut caps = (self.client_capabilities | capabilities::DEFAULT_CAPABILITIES)
            & self.server_capabilities;
        caps |= capabilities::CLIENT_PROTOCOL_41 | capabilities::CLIENT_SECURE_CONNECTION;
        let database = if creds.db.is_empty() {
            None
        } else {
            caps |= capabilities::CLIENT_CONNECT_WITH_DB;
            Some(creds.db.clone())
        };

        let auth_response = match creds.password_sha1.as_ref() {
            Some(sha1) => crate::protocol::compute_token(sha1, &self.scramble).to_vec(),
            None => Vec::new(),
        };

        let response = HandshakeResponse {
            capability_flags: caps,
            max_packet_size: 16 * 1024 * 1024,
            character_set: (creds.charset & 0xff) as u8,
            username: creds.user.clone(),
            auth_response,
            database,
            auth_plugin_name: crate::protocol::packet::DEFAULT_AUTH_PLUGIN.to_string(),
        };

        dcb.write_queue
            .append_bytes(response.encode(sequence).to_vec());
    }

    /// Steady-state read: frame packets, assemble per the router's declared
    /// capabilities, drain ignorable replies, emit upward.
    fn read_and_write(
        &mut self,
        dcb: &mut Dcb,
        session: &SessionShared,
        server: &Server,
        effects: &mut Vec<Effect>,
    ) {
        let caps = self.router_caps;
        let mut result_collected = false;

        let framed = rcap_required(caps, rcap::PACKET_OUTPUT)
            || rcap_required(caps, rcap::STMT_OUTPUT)
            || rcap_required(caps, rcap::CONTIGUOUS_OUTPUT)
            || self.collect_result
            || self.ignore_replies > 0;

        let mut read_buffer = if framed {
            match framing::extract_complete(&mut dcb.read_queue) {
                Some(complete) => complete,
                None => return,
            }
        } else {
            let everything = dcb.read_queue.take();
            if everything.is_empty() {
                return;
            }
            everything
        };

        // Session-state is read from real OK packets only; the OK replying
        // to COM_STMT_PREPARE has a different layout.
        if framed
            && rcap_required(caps, rcap::SESSION_STATE_TRACKING)
            && !self.expecting_ps_response()
            && self.track_state
        {
            self.update_session_track(session, &read_buffer);
        }

        if framed
            && (rcap_required(caps, rcap::CONTIGUOUS_OUTPUT)
                || self.collect_result
                || self.ignore_replies > 0)
        {
            read_buffer = read_buffer.into_contiguous();

            if self.collecting_resultset() {
                if self.expecting_text_result() {
                    if framing::is_result_set(&read_buffer) {
                        let sig = framing::count_signal_packets(&read_buffer);
                        // An ERR terminates the result regardless of how
                        // many EOFs preceded it.
                        if !sig.err && (sig.more_results || sig.signals % 2 != 0) {
                            // The result is still streaming in.
                            dcb.read_queue.prepend(read_buffer);
                            return;
                        }
                    }
                    self.collect_result = false;
                    result_collected = true;
                } else if self.expecting_ps_response() && framing::is_prep_stmt_ok(&read_buffer) {
                    if !framing::ps_response_complete(&read_buffer) {
                        dcb.read_queue.prepend(read_buffer);
                        return;
                    }
                    self.collect_result = false;
                    result_collected = true;
                } else {
                    self.collect_result = false;
                    result_collected = true;
                }
            }
        }

        if self.changing_user {
            if framing::is_auth_switch(&read_buffer)
                && self.answer_auth_switch(dcb, session, &read_buffer)
            {
                // Same plugin, fresh scramble; the real verdict follows.
                return;
            }
            // Connectors expect the auth-switch round trip, so the final
            // reply to a COM_CHANGE_USER always has sequence 3.
            read_buffer.set_u8(3, 0x03);
            self.changing_user = false;
        }

        if self.ignore_replies > 0 {
            self.drain_ignorable(dcb, session, server, read_buffer, effects);
            return;
        }

        loop {
            let stmt = if result_collected {
                let mut stmt = read_buffer.take();
                stmt.set_tag(tags::RESULT);
                stmt
            } else if rcap_required(caps, rcap::STMT_OUTPUT)
                && !rcap_required(caps, rcap::RESULTSET_OUTPUT)
            {
                match framing::next_packet(&mut read_buffer) {
                    Some(packet) => packet.into_contiguous(),
                    None => break,
                }
            } else {
                read_buffer.take()
            };

            if stmt.is_empty() {
                break;
            }
            if framing::is_local_infile(&stmt) {
                session.set_load_data_active(true);
            }
            effects.push(Effect::Reply(stmt));
            if read_buffer.is_empty() {
                break;
            }
        }
    }

    /// Keep only the last packet of the read, consume one ignore credit and
    /// decide what happens to the stored query.
    fn drain_ignorable(
        &mut self,
        dcb: &mut Dcb,
        session: &SessionShared,
        server: &Server,
        mut read_buffer: BufferChain,
        effects: &mut Vec<Effect>,
    ) {
        let query = self.stored_query.take();
        self.ignore_replies -= 1;

        let mut reply = match framing::next_packet(&mut read_buffer) {
            Some(packet) => packet,
            None => {
                effects.push(Effect::FakeHangup);
                return;
            }
        };
        while let Some(next) = framing::next_packet(&mut read_buffer) {
            reply = next;
        }
        self.last_drain_sequence = framing::first_sequence(&reply);

        if framing::is_ok_packet(&reply) {
            debug!(
                session_id = session.id,
                "Response to COM_CHANGE_USER is OK, writing stored query"
            );
            if let Some(query) = query {
                if !self.write_inner(dcb, session, server, query, effects) {
                    effects.push(Effect::FakeHangup);
                }
            }
        } else if framing::is_auth_switch(&reply) {
            if self.answer_auth_switch(dcb, session, &reply) {
                // Hold the query until the new exchange resolves.
                self.stored_query = query;
                self.ignore_replies += 1;
            } else {
                effects.push(Effect::FakeHangup);
            }
        } else if framing::is_err_packet(&reply) {
            self.handle_error_response(server, &reply, effects);
            effects.push(Effect::FakeHangup);
        } else {
            error!(
                session_id = session.id,
                reply = ?framing::reply_byte(&reply),
                "Unknown response to COM_CHANGE_USER, closing connection"
            );
            effects.push(Effect::FakeHangup);
        }
    }

    /// Answer an auth-switch request when it targets the default plugin:
    /// adopt the fresh scramble and send the recomputed token.
    fn answer_auth_switch(
        &mut self,
        dcb: &mut Dcb,
        session: &SessionShared,
        buf: &BufferChain,
    ) -> bool {
        let Some(switch) = crate::protocol::AuthSwitchRequest::parse(buf) else {
            return false;
        };
        if switch.plugin != crate::protocol::packet::DEFAULT_AUTH_PLUGIN
            || switch.scramble.len() < SCRAMBLE_LEN
        {
            warn!(
                session_id = session.id,
                plugin = %switch.plugin,
                "Received AuthSwitchRequest to an unsupported plugin"
            );
            return false;
        }
        self.scramble.copy_from_slice(&switch.scramble[..SCRAMBLE_LEN]);
        let creds = session.credentials();
        let response = crate::auth::native::scramble_response(
            creds.password_sha1.as_ref(),
            &self.scramble,
            switch.sequence.wrapping_add(1),
        );
        dcb.write_queue.append(response);
        true
    }

    fn update_session_track(&self, session: &SessionShared, chain: &BufferChain) {
        let Some(ok) = framing::parse_ok_response(chain) else {
            return;
        };
        for entry in ok.track {
            match entry {
                TrackEntry::Schema(schema) => {
                    debug!(session_id = session.id, schema = %schema, "Tracked schema change");
                    session.set_default_db(&schema);
                }
                TrackEntry::SystemVariable(name, value) => {
                    debug!(session_id = session.id, var = %name, value = %value, "Tracked variable change");
                }
                TrackEntry::Other(_) => {}
            }
        }
    }

    /// Auth-phase server errors: log, apply ER_* side effects, funnel.
    fn handle_error_response(
        &mut self,
        server: &Server,
        packet: &BufferChain,
        effects: &mut Vec<Effect>,
    ) {
        let code = framing::error_code(packet).unwrap_or(0);
        let message = framing::error_message(packet).unwrap_or_default();
        error!(
            server = %server.name,
            code,
            error = %message,
            "Invalid authentication message from backend"
        );

        match code {
            er::HOST_IS_BLOCKED => {
                error!(
                    server = %server.name,
                    "Server is blocking connections from the proxy and will be put into \
                     maintenance mode; run flush-hosts on it before clearing the state"
                );
                effects.push(Effect::MarkServerMaintenance);
            }
            er::ACCESS_DENIED | er::DBACCESS_DENIED | er::ACCESS_DENIED_NO_PASSWORD => {
                effects.push(Effect::RefreshUsers);
            }
            _ => {}
        }
    }

    fn reply_on_error(&mut self, dcb: &mut Dcb, server: &Server, effects: &mut Vec<Effect>) {
        if !dcb.mark_error_handled() {
            return;
        }
        let what = if self.state == AuthState::HandshakeFailed {
            "handshake"
        } else {
            "authentication"
        };
        effects.push(Effect::Error {
            action: ErrorAction::ReplyClient,
            message: format!(
                "Authentication with backend '{}' failed: {} failure. Session will be closed.",
                server.name, what
            ),
        });
    }

    fn fail(
        &mut self,
        dcb: &mut Dcb,
        action: ErrorAction,
        message: &str,
        effects: &mut Vec<Effect>,
    ) {
        if dcb.mark_error_handled() {
            effects.push(Effect::Error {
                action,
                message: message.to_string(),
            });
        }
    }

    /// Peer closed the connection, or a higher layer injected a hangup.
    pub fn on_hangup(&mut self, dcb: &mut Dcb) -> Vec<Effect> {
        let mut effects = Vec::new();
        if dcb.is_pooled() {
            dcb.closing = true;
            return effects;
        }
        self.fail(
            dcb,
            ErrorAction::NewConnection,
            "Lost connection to backend server: connection closed by peer",
            &mut effects,
        );
        effects
    }

    /// Socket-level error with a known errno.
    pub fn on_socket_error(&mut self, dcb: &mut Dcb, errno: i32) -> Vec<Effect> {
        let mut effects = Vec::new();
        if dcb.is_pooled() {
            dcb.closing = true;
            return effects;
        }
        let detail = std::io::Error::from_raw_os_error(errno);
        self.fail(
            dcb,
            ErrorAction::NewConnection,
            &format!(
                "Lost connection to backend server: network error ({}, {})",
                errno, detail
            ),
            &mut effects,
        );
        effects
    }

    fn collecting_resultset(&self) -> bool {
        rcap_required(self.router_caps, rcap::RESULTSET_OUTPUT) || self.collect_result
    }

    fn expecting_text_result(&self) -> bool {
        matches!(
            self.current_command,
            Command::Query | Command::StmtExecute | Command::StmtFetch
        )
    }

    fn expecting_ps_response(&self) -> bool {
        self.current_command == Command::StmtPrepare
    }

    /// Per-connection diagnostics merged into the DCB's.
    pub fn diagnostics(&self) -> serde_json::Value {
        serde_json::json!({
            "state": self.state.as_str(),
            "connection_id": self.thread_id,
            "current_command": format!("{:?}", self.current_command),
            "ignore_replies": self.ignore_replies,
            "changing_user": self.changing_user,
            "collect_result": self.collect_result,
        })
    }
}

fn command_of(buf: &BufferChain) -> Option<Command> {
    buf.peek_u8(HEADER_LEN).map(Command::from)
}

#[cfg(test)]
impl BackendProtocol {
    /// A machine already in the Complete state, for tests that exercise
    /// lifecycle around the state machine rather than through it.
    pub(crate) fn completed_for_tests(router_caps: u64) -> Self {
        let mut machine = Self::new(router_caps, capabilities::DEFAULT_CAPABILITIES, 0x21);
        machine.state = AuthState::Complete;
        machine.scramble = *b"abcdefghijklmnopqrst";
        machine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::ServerConfig;
    use crate::protocol::handshake::compute_auth_response;
    use crate::protocol::packet::{Packet, DEFAULT_AUTH_PLUGIN};
    use crate::protocol::{ChangeUserRequest, HandshakeResponse};
    use crate::session::{SessionShared, SessionTrace};
    use crate::worker::WorkerId;

    const TEST_SCRAMBLE: [u8; SCRAMBLE_LEN] = *b"abcdefghijklmnopqrst";

    fn test_server(persistent: bool) -> Server {
        let mut cfg = ServerConfig {
            name: "db1".to_string(),
            ..Default::default()
        };
        cfg.persistent_pool.enabled = persistent;
        Server::from_config(&cfg)
    }

    fn test_session(caps: u64) -> Arc<SessionShared> {
        let session = SessionShared::new(1, WorkerId(0), caps, None, SessionTrace::disabled());
        session.set_credentials(crate::auth::Credentials::new("u", "P", "", 0x21));
        session
    }

    fn test_dcb() -> Dcb {
        Dcb::new_backend(WorkerId(0), 1, "db1")
    }

    fn handshake_bytes(scramble: &[u8; SCRAMBLE_LEN]) -> Vec<u8> {
        let mut part1 = [0u8; 8];
        part1.copy_from_slice(&scramble[..8]);
        let handshake = InitialHandshake {
            protocol_version: 10,
            server_version: "10.6.14-MariaDB".to_string(),
            connection_id: 99,
            auth_plugin_data_part1: part1,
            capability_flags: capabilities::DEFAULT_CAPABILITIES,
            character_set: 0x21,
            status_flags: 0x0002,
            auth_plugin_data_part2: scramble[8..].to_vec(),
            auth_plugin_name: DEFAULT_AUTH_PLUGIN.to_string(),
        };
        handshake.encode().to_vec()
    }

    fn ok_bytes(seq: u8) -> Vec<u8> {
        Packet::new(seq, vec![0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]).to_vec()
    }

    fn err_bytes(seq: u8, code: u16, msg: &str) -> Vec<u8> {
        let mut payload = vec![0xff];
        payload.extend_from_slice(&code.to_le_bytes());
        payload.extend_from_slice(b"#HY000");
        payload.extend_from_slice(msg.as_bytes());
        Packet::new(seq, payload).to_vec()
    }

    fn eof_bytes(seq: u8, status: u16) -> Vec<u8> {
        let mut payload = vec![0xfe, 0, 0];
        payload.extend_from_slice(&status.to_le_bytes());
        Packet::new(seq, payload).to_vec()
    }

    fn auth_switch_bytes(seq: u8, plugin: &str, scramble: &[u8]) -> Vec<u8> {
        let mut payload = vec![0xfe];
        payload.extend_from_slice(plugin.as_bytes());
        payload.push(0);
        payload.extend_from_slice(scramble);
        payload.push(0);
        Packet::new(seq, payload).to_vec()
    }

    fn query(sql: &str) -> BufferChain {
        let mut payload = vec![0x03];
        payload.extend_from_slice(sql.as_bytes());
        BufferChain::from_bytes(Packet::new(0, payload).to_vec())
    }

    fn quit() -> BufferChain {
        BufferChain::from_bytes(vec![1, 0, 0, 0, 0x01])
    }

    /// Drive a fresh machine to the Complete state over a scripted
    /// handshake, returning the write queue's contents after each step.
    fn authenticate(
        machine: &mut BackendProtocol,
        dcb: &mut Dcb,
        session: &SessionShared,
        server: &Server,
    ) {
        machine.connect_started();
        assert_eq!(machine.state(), AuthState::PendingConnect);
        machine.connect_established(dcb, None);
        assert_eq!(machine.state(), AuthState::Connected);

        let effects = machine.on_readable(dcb, session, server, &handshake_bytes(&TEST_SCRAMBLE));
        assert!(effects.is_empty());
        assert_eq!(machine.state(), AuthState::ResponseSent);
        dcb.write_queue.take();

        let effects = machine.on_readable(dcb, session, server, &ok_bytes(2));
        assert!(effects.is_empty());
        assert_eq!(machine.state(), AuthState::Complete);
    }

    const STMT_CAPS: u64 = rcap::STMT_INPUT | rcap::STMT_OUTPUT;
    const RESULT_CAPS: u64 = rcap::STMT_INPUT
        | rcap::STMT_OUTPUT
        | rcap::CONTIGUOUS_OUTPUT
        | rcap::RESULTSET_OUTPUT;

    #[test]
    fn test_handshake_sends_native_password_response() {
        let session = test_session(STMT_CAPS);
        let server = test_server(false);
        let mut dcb = test_dcb();
        let mut machine = BackendProtocol::new(STMT_CAPS, capabilities::DEFAULT_CAPABILITIES, 0x21);

        machine.connect_started();
        machine.connect_established(&mut dcb, None);
        machine.on_readable(&mut dcb, &session, &server, &handshake_bytes(&TEST_SCRAMBLE));

        assert_eq!(machine.state(), AuthState::ResponseSent);
        assert_eq!(machine.thread_id(), 99);
        assert_eq!(dcb.thread_id, 99);
        assert_eq!(machine.scramble(), &TEST_SCRAMBLE);

        let response = dcb.write_queue.to_vec();
        assert_eq!(response[3], 1); // sequence follows the handshake
        let parsed = HandshakeResponse::parse(&response[4..]).unwrap();
        assert_eq!(parsed.username, "u");
        assert_eq!(
            parsed.auth_response,
            compute_auth_response("P", &TEST_SCRAMBLE)
        );
    }

    #[test]
    fn test_happy_handshake_and_collected_select() {
        let session = test_session(RESULT_CAPS);
        let server = test_server(false);
        let mut dcb = test_dcb();
        let mut machine =
            BackendProtocol::new(RESULT_CAPS, capabilities::DEFAULT_CAPABILITIES, 0x21);
        authenticate(&mut machine, &mut dcb, &session, &server);

        let (ok, effects) = machine.write(&mut dcb, &session, &server, query("SELECT 1"));
        assert!(ok);
        assert!(effects.is_empty());
        assert_eq!(machine.current_command, Command::Query);
        dcb.write_queue.take();

        // column-count, column-def, EOF, row, EOF
        let mut reply = Vec::new();
        reply.extend_from_slice(&Packet::new(1, vec![0x01]).to_vec());
        reply.extend_from_slice(&Packet::new(2, b"def".to_vec()).to_vec());
        reply.extend_from_slice(&eof_bytes(3, 0));
        reply.extend_from_slice(&Packet::new(4, vec![0x01, b'1']).to_vec());
        let total_so_far = reply.clone();

        // A partial result must be held back, not emitted.
        let effects = machine.on_readable(&mut dcb, &session, &server, &total_so_far);
        assert!(effects.is_empty());

        let effects = machine.on_readable(&mut dcb, &session, &server, &eof_bytes(5, 0));
        assert_eq!(effects.len(), 1);
        match &effects[0] {
            Effect::Reply(chain) => {
                assert!(chain.has_tag(tags::RESULT));
                assert_eq!(crate::protocol::packet_count(chain), 5);
            }
            other => panic!("expected Reply, got {:?}", other),
        }
        assert!(dcb.read_queue.is_empty());
    }

    #[test]
    fn test_delay_queue_flushes_once_on_completion() {
        let session = test_session(STMT_CAPS);
        let server = test_server(false);
        let mut dcb = test_dcb();
        let mut machine = BackendProtocol::new(STMT_CAPS, capabilities::DEFAULT_CAPABILITIES, 0x21);

        machine.connect_started();
        machine.connect_established(&mut dcb, None);
        machine.on_readable(&mut dcb, &session, &server, &handshake_bytes(&TEST_SCRAMBLE));
        dcb.write_queue.take();

        // Writes while authentication is in flight are parked.
        let (ok, _) = machine.write(&mut dcb, &session, &server, query("SELECT 1"));
        assert!(ok);
        let (ok, _) = machine.write(&mut dcb, &session, &server, query("SELECT 2"));
        assert!(ok);
        assert!(dcb.write_queue.is_empty());
        assert!(!dcb.delay_queue.is_empty());

        machine.on_readable(&mut dcb, &session, &server, &ok_bytes(2));
        assert_eq!(machine.state(), AuthState::Complete);
        assert!(dcb.delay_queue.is_empty());

        let flushed = dcb.write_queue.take().to_vec();
        let expected: Vec<u8> = [query("SELECT 1").to_vec(), query("SELECT 2").to_vec()]
            .concat();
        assert_eq!(flushed, expected);
    }

    #[test]
    fn test_pool_adoption_synthesises_change_user() {
        let session = test_session(STMT_CAPS);
        let server = test_server(true);
        let mut dcb = test_dcb();
        let mut machine = BackendProtocol::new(STMT_CAPS, capabilities::DEFAULT_CAPABILITIES, 0x21);
        authenticate(&mut machine, &mut dcb, &session, &server);

        dcb.enter_pool();
        dcb.adopt(2, WorkerId(0));
        session.set_credentials(crate::auth::Credentials::new("u2", "pw2", "d2", 0x21));

        let (ok, effects) = machine.write(&mut dcb, &session, &server, query("SHOW DATABASES"));
        assert!(ok);
        assert!(effects.is_empty());
        assert_eq!(machine.ignore_replies, 1);
        assert!(machine.stored_query.is_some());

        // The first bytes on the wire are a COM_CHANGE_USER matching the
        // adopting session's credentials.
        let wire = dcb.write_queue.take().to_vec();
        assert_eq!(wire[4], 0x11);
        let change_user = ChangeUserRequest::parse(&wire[4..]).unwrap();
        assert_eq!(change_user.user, "u2");
        assert_eq!(change_user.database, "d2");
        let sha1 = crate::protocol::handshake::sha1_digest(b"pw2");
        assert_eq!(
            change_user.token,
            crate::protocol::compute_token(&sha1, &TEST_SCRAMBLE).to_vec()
        );

        // OK drains the ignorable reply and releases the stored query.
        let effects = machine.on_readable(&mut dcb, &session, &server, &ok_bytes(1));
        assert!(effects.is_empty());
        assert_eq!(machine.ignore_replies, 0);
        assert!(machine.stored_query.is_none());
        assert_eq!(machine.last_drain_sequence, Some(3));
        assert_eq!(dcb.write_queue.take().to_vec(), query("SHOW DATABASES").to_vec());
    }

    #[test]
    fn test_adoption_handles_auth_switch_back_to_native() {
        let session = test_session(STMT_CAPS);
        let server = test_server(true);
        let mut dcb = test_dcb();
        let mut machine = BackendProtocol::new(STMT_CAPS, capabilities::DEFAULT_CAPABILITIES, 0x21);
        authenticate(&mut machine, &mut dcb, &session, &server);

        dcb.enter_pool();
        dcb.adopt(2, WorkerId(0));
        let (ok, _) = machine.write(&mut dcb, &session, &server, query("SHOW DATABASES"));
        assert!(ok);
        dcb.write_queue.take();

        // The server generates a fresh scramble for re-authentication.
        let new_scramble = *b"ZZZZZZZZZZZZZZZZZZZZ";
        let effects = machine.on_readable(
            &mut dcb,
            &session,
            &server,
            &auth_switch_bytes(1, DEFAULT_AUTH_PLUGIN, &new_scramble),
        );
        assert!(effects.is_empty());
        assert_eq!(machine.ignore_replies, 1);
        assert!(machine.stored_query.is_some());
        assert_eq!(machine.scramble(), &new_scramble);

        let answer = dcb.write_queue.take().to_vec();
        assert_eq!(answer[3], 2);
        let creds = session.credentials();
        let expected =
            crate::protocol::compute_token(&creds.password_sha1.unwrap(), &new_scramble);
        assert_eq!(&answer[4..], &expected[..]);

        // Now the OK finishes the exchange; the stored query goes out.
        let effects = machine.on_readable(&mut dcb, &session, &server, &ok_bytes(3));
        assert!(effects.is_empty());
        assert_eq!(machine.ignore_replies, 0);
        assert_eq!(machine.last_drain_sequence, Some(3));
        assert_eq!(dcb.write_queue.take().to_vec(), query("SHOW DATABASES").to_vec());
    }

    #[test]
    fn test_adoption_auth_switch_to_unknown_plugin_is_fatal() {
        let session = test_session(STMT_CAPS);
        let server = test_server(true);
        let mut dcb = test_dcb();
        let mut machine = BackendProtocol::new(STMT_CAPS, capabilities::DEFAULT_CAPABILITIES, 0x21);
        authenticate(&mut machine, &mut dcb, &session, &server);

        dcb.enter_pool();
        dcb.adopt(2, WorkerId(0));
        machine.write(&mut dcb, &session, &server, query("SELECT 1"));
        dcb.write_queue.take();

        let effects = machine.on_readable(
            &mut dcb,
            &session,
            &server,
            &auth_switch_bytes(1, "caching_sha2_password", &[b'x'; 20]),
        );
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::FakeHangup)));
    }

    #[test]
    fn test_host_blocked_at_handshake_marks_maintenance() {
        let session = test_session(STMT_CAPS);
        let server = test_server(false);
        let mut dcb = test_dcb();
        let mut machine = BackendProtocol::new(STMT_CAPS, capabilities::DEFAULT_CAPABILITIES, 0x21);
        machine.connect_started();
        machine.connect_established(&mut dcb, None);

        let effects = machine.on_readable(
            &mut dcb,
            &session,
            &server,
            &err_bytes(0, er::HOST_IS_BLOCKED, "Host is blocked"),
        );
        assert_eq!(machine.state(), AuthState::HandshakeFailed);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::MarkServerMaintenance)));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Error {
                action: ErrorAction::ReplyClient,
                ..
            }
        )));
    }

    #[test]
    fn test_access_denied_triggers_user_refresh() {
        let session = test_session(STMT_CAPS);
        let server = test_server(false);
        let mut dcb = test_dcb();
        let mut machine = BackendProtocol::new(STMT_CAPS, capabilities::DEFAULT_CAPABILITIES, 0x21);
        machine.connect_started();
        machine.connect_established(&mut dcb, None);
        machine.on_readable(&mut dcb, &session, &server, &handshake_bytes(&TEST_SCRAMBLE));
        dcb.write_queue.take();

        let effects = machine.on_readable(
            &mut dcb,
            &session,
            &server,
            &err_bytes(2, er::ACCESS_DENIED, "Access denied"),
        );
        assert_eq!(machine.state(), AuthState::Failed);
        assert!(effects.iter().any(|e| matches!(e, Effect::RefreshUsers)));
    }

    #[test]
    fn test_large_query_continuation_keeps_command() {
        let session = test_session(STMT_CAPS);
        let server = test_server(false);
        let mut dcb = test_dcb();
        let mut machine = BackendProtocol::new(STMT_CAPS, capabilities::DEFAULT_CAPABILITIES, 0x21);
        authenticate(&mut machine, &mut dcb, &session, &server);

        // First frame fills the 24-bit maximum; only the header matters to
        // command tracking.
        let mut first = vec![0xff, 0xff, 0xff, 0x00, 0x03];
        first.extend_from_slice(b"INSERT INTO t VALUES (");
        let (ok, _) = machine.write(&mut dcb, &session, &server, BufferChain::from_bytes(first));
        assert!(ok);
        assert_eq!(machine.current_command, Command::Query);
        assert!(machine.large_query);

        // The continuation starts with payload data, not a command byte.
        let continuation = Packet::new(1, vec![0xff; 100]).to_vec();
        let (ok, _) = machine.write(
            &mut dcb,
            &session,
            &server,
            BufferChain::from_bytes(continuation),
        );
        assert!(ok);
        assert_eq!(machine.current_command, Command::Query);
        assert!(!machine.large_query);
    }

    #[test]
    fn test_read_on_pooled_dcb_is_a_fake_hangup() {
        let session = test_session(STMT_CAPS);
        let server = test_server(true);
        let mut dcb = test_dcb();
        let mut machine = BackendProtocol::new(STMT_CAPS, capabilities::DEFAULT_CAPABILITIES, 0x21);
        authenticate(&mut machine, &mut dcb, &session, &server);

        dcb.enter_pool();
        let effects = machine.on_readable(&mut dcb, &session, &server, &ok_bytes(0));
        assert_eq!(effects.len(), 1);
        assert!(matches!(effects[0], Effect::FakeHangup));
        assert!(dcb.read_queue.is_empty());
    }

    #[test]
    fn test_error_funnel_is_reentrancy_safe() {
        let session = test_session(STMT_CAPS);
        let server = test_server(false);
        let mut dcb = test_dcb();
        let mut machine = BackendProtocol::new(STMT_CAPS, capabilities::DEFAULT_CAPABILITIES, 0x21);
        authenticate(&mut machine, &mut dcb, &session, &server);

        let first = machine.on_socket_error(&mut dcb, 104);
        assert_eq!(
            first
                .iter()
                .filter(|e| matches!(e, Effect::Error { .. }))
                .count(),
            1
        );
        match &first[0] {
            Effect::Error { action, message } => {
                assert_eq!(*action, ErrorAction::NewConnection);
                assert!(message.contains("(104,"));
            }
            other => panic!("expected Error, got {:?}", other),
        }

        let second = machine.on_socket_error(&mut dcb, 104);
        assert!(second.is_empty());
        let third = machine.on_hangup(&mut dcb);
        assert!(third.is_empty());
    }

    #[test]
    fn test_quit_is_dropped_for_poolable_server() {
        let session = test_session(STMT_CAPS);
        let server = test_server(true);
        let mut dcb = test_dcb();
        let mut machine = BackendProtocol::new(STMT_CAPS, capabilities::DEFAULT_CAPABILITIES, 0x21);
        authenticate(&mut machine, &mut dcb, &session, &server);

        let (ok, effects) = machine.write(&mut dcb, &session, &server, quit());
        assert!(ok);
        assert!(effects.is_empty());
        assert!(dcb.write_queue.is_empty());
        assert!(machine.can_pool(&dcb));
    }

    #[test]
    fn test_quit_reaches_wire_without_pooling() {
        let session = test_session(STMT_CAPS);
        let server = test_server(false);
        let mut dcb = test_dcb();
        let mut machine = BackendProtocol::new(STMT_CAPS, capabilities::DEFAULT_CAPABILITIES, 0x21);
        authenticate(&mut machine, &mut dcb, &session, &server);

        let (ok, _) = machine.write(&mut dcb, &session, &server, quit());
        assert!(ok);
        assert_eq!(dcb.write_queue.take().to_vec(), quit().to_vec());
    }

    #[test]
    fn test_quit_during_ignorable_reply_closes_connection() {
        let session = test_session(STMT_CAPS);
        let server = test_server(true);
        let mut dcb = test_dcb();
        let mut machine = BackendProtocol::new(STMT_CAPS, capabilities::DEFAULT_CAPABILITIES, 0x21);
        authenticate(&mut machine, &mut dcb, &session, &server);

        dcb.enter_pool();
        dcb.adopt(2, WorkerId(0));
        machine.write(&mut dcb, &session, &server, query("SELECT 1"));

        let (ok, effects) = machine.write(&mut dcb, &session, &server, quit());
        assert!(!ok);
        assert!(effects.iter().any(|e| matches!(e, Effect::FakeHangup)));
    }

    #[test]
    fn test_requests_pile_onto_stored_query_during_change_user() {
        let session = test_session(STMT_CAPS);
        let server = test_server(true);
        let mut dcb = test_dcb();
        let mut machine = BackendProtocol::new(STMT_CAPS, capabilities::DEFAULT_CAPABILITIES, 0x21);
        authenticate(&mut machine, &mut dcb, &session, &server);

        dcb.enter_pool();
        dcb.adopt(2, WorkerId(0));
        machine.write(&mut dcb, &session, &server, query("SELECT 1"));
        dcb.write_queue.take();

        let (ok, _) = machine.write(&mut dcb, &session, &server, query("SELECT 2"));
        assert!(ok);
        assert_eq!(machine.ignore_replies, 1);

        machine.on_readable(&mut dcb, &session, &server, &ok_bytes(1));
        let flushed = dcb.write_queue.take().to_vec();
        let expected: Vec<u8> =
            [query("SELECT 1").to_vec(), query("SELECT 2").to_vec()].concat();
        assert_eq!(flushed, expected);
    }

    #[test]
    fn test_change_user_error_drops_query_and_hangs_up() {
        let session = test_session(STMT_CAPS);
        let server = test_server(true);
        let mut dcb = test_dcb();
        let mut machine = BackendProtocol::new(STMT_CAPS, capabilities::DEFAULT_CAPABILITIES, 0x21);
        authenticate(&mut machine, &mut dcb, &session, &server);

        dcb.enter_pool();
        dcb.adopt(2, WorkerId(0));
        machine.write(&mut dcb, &session, &server, query("SELECT 1"));
        dcb.write_queue.take();

        let effects = machine.on_readable(
            &mut dcb,
            &session,
            &server,
            &err_bytes(1, er::ACCESS_DENIED, "Access denied"),
        );
        assert!(effects.iter().any(|e| matches!(e, Effect::FakeHangup)));
        assert!(effects.iter().any(|e| matches!(e, Effect::RefreshUsers)));
        assert!(machine.stored_query.is_none());
        assert!(dcb.write_queue.is_empty());
    }

    #[test]
    fn test_session_state_tracking_updates_default_schema() {
        let caps = STMT_CAPS | rcap::SESSION_STATE_TRACKING;
        let session = test_session(caps);
        let server = test_server(false);
        let mut dcb = test_dcb();
        let mut machine = BackendProtocol::new(caps, capabilities::DEFAULT_CAPABILITIES, 0x21);
        authenticate(&mut machine, &mut dcb, &session, &server);

        let mut request = query("USE d9");
        request.set_tag(tags::TRACK_STATE);
        machine.write(&mut dcb, &session, &server, request);
        dcb.write_queue.take();

        // OK with a SESSION_TRACK_SCHEMA entry for "d9".
        let mut payload = vec![0x00, 0x00, 0x00];
        payload.extend_from_slice(
            &crate::protocol::packet::SERVER_SESSION_STATE_CHANGED.to_le_bytes(),
        );
        payload.extend_from_slice(&0u16.to_le_bytes());
        payload.push(0);
        payload.extend_from_slice(&[5, 1, 3, 2, b'd', b'9']);
        let effects = machine.on_readable(
            &mut dcb,
            &session,
            &server,
            &Packet::new(1, payload).to_vec(),
        );

        assert_eq!(session.credentials().db, "d9");
        assert_eq!(effects.len(), 1);
        assert!(matches!(effects[0], Effect::Reply(_)));
    }

    #[test]
    fn test_write_after_auth_failure_is_rejected() {
        let session = test_session(STMT_CAPS);
        let server = test_server(false);
        let mut dcb = test_dcb();
        let mut machine = BackendProtocol::new(STMT_CAPS, capabilities::DEFAULT_CAPABILITIES, 0x21);
        machine.connect_started();
        machine.connect_established(&mut dcb, None);
        machine.on_readable(&mut dcb, &session, &server, &handshake_bytes(&TEST_SCRAMBLE));
        dcb.write_queue.take();
        machine.on_readable(
            &mut dcb,
            &session,
            &server,
            &err_bytes(2, er::ACCESS_DENIED, "no"),
        );
        assert_eq!(machine.state(), AuthState::Failed);

        let (ok, effects) = machine.write(&mut dcb, &session, &server, query("SELECT 1"));
        assert!(!ok);
        assert!(effects.is_empty());
    }

    #[test]
    fn test_client_change_user_reply_gets_sequence_three() {
        let session = test_session(STMT_CAPS);
        let server = test_server(false);
        let mut dcb = test_dcb();
        let mut machine = BackendProtocol::new(STMT_CAPS, capabilities::DEFAULT_CAPABILITIES, 0x21);
        authenticate(&mut machine, &mut dcb, &session, &server);

        session.set_credentials(crate::auth::Credentials::new("u2", "pw2", "d2", 0x21));
        let (ok, _) = machine.write_change_user(&mut dcb, &session, &server);
        assert!(ok);
        assert!(machine.changing_user);
        let wire = dcb.write_queue.take().to_vec();
        assert_eq!(wire[4], 0x11);

        // The server acknowledges with sequence 1; the client-facing reply
        // must carry sequence 3.
        let effects = machine.on_readable(&mut dcb, &session, &server, &ok_bytes(1));
        assert_eq!(effects.len(), 1);
        match &effects[0] {
            Effect::Reply(chain) => {
                assert_eq!(crate::protocol::framing::first_sequence(chain), Some(3));
                assert!(crate::protocol::is_ok_packet(chain));
            }
            other => panic!("expected Reply, got {:?}", other),
        }
        assert!(!machine.changing_user);
    }

    #[test]
    fn test_prepared_statement_response_collected_whole() {
        let session = test_session(RESULT_CAPS);
        let server = test_server(false);
        let mut dcb = test_dcb();
        let mut machine =
            BackendProtocol::new(RESULT_CAPS, capabilities::DEFAULT_CAPABILITIES, 0x21);
        authenticate(&mut machine, &mut dcb, &session, &server);

        let mut prepare = vec![0x16];
        prepare.extend_from_slice(b"SELECT ?");
        machine.write(
            &mut dcb,
            &session,
            &server,
            BufferChain::from_bytes(Packet::new(0, prepare).to_vec()),
        );
        assert_eq!(machine.current_command, Command::StmtPrepare);
        dcb.write_queue.take();

        // PS OK header: one column, one parameter.
        let mut header = vec![0x00];
        header.extend_from_slice(&7u32.to_le_bytes());
        header.extend_from_slice(&1u16.to_le_bytes());
        header.extend_from_slice(&1u16.to_le_bytes());
        header.push(0);
        header.extend_from_slice(&0u16.to_le_bytes());

        let mut partial = Packet::new(1, header).to_vec();
        partial.extend_from_slice(&Packet::new(2, b"param".to_vec()).to_vec());
        partial.extend_from_slice(&eof_bytes(3, 0));
        let effects = machine.on_readable(&mut dcb, &session, &server, &partial);
        assert!(effects.is_empty());

        let mut rest = Packet::new(4, b"col".to_vec()).to_vec();
        rest.extend_from_slice(&eof_bytes(5, 0));
        let effects = machine.on_readable(&mut dcb, &session, &server, &rest);
        assert_eq!(effects.len(), 1);
        match &effects[0] {
            Effect::Reply(chain) => {
                assert!(chain.has_tag(tags::RESULT));
                assert_eq!(crate::protocol::packet_count(chain), 5);
            }
            other => panic!("expected Reply, got {:?}", other),
        }
    }

    #[test]
    fn test_more_results_keeps_collecting() {
        let session = test_session(RESULT_CAPS);
        let server = test_server(false);
        let mut dcb = test_dcb();
        let mut machine =
            BackendProtocol::new(RESULT_CAPS, capabilities::DEFAULT_CAPABILITIES, 0x21);
        authenticate(&mut machine, &mut dcb, &session, &server);

        machine.write(&mut dcb, &session, &server, query("CALL p()"));
        dcb.write_queue.take();

        // First result set ends with the more-results flag set.
        let mut first = Vec::new();
        first.extend_from_slice(&Packet::new(1, vec![0x01]).to_vec());
        first.extend_from_slice(&Packet::new(2, b"def".to_vec()).to_vec());
        first.extend_from_slice(&eof_bytes(3, 0));
        first.extend_from_slice(&Packet::new(4, vec![0x01, b'1']).to_vec());
        first.extend_from_slice(&eof_bytes(
            5,
            crate::protocol::packet::SERVER_MORE_RESULTS_EXIST,
        ));
        let effects = machine.on_readable(&mut dcb, &session, &server, &first);
        assert!(effects.is_empty());

        // The trailing result set completes the reply.
        let mut second = Vec::new();
        second.extend_from_slice(&Packet::new(6, vec![0x01]).to_vec());
        second.extend_from_slice(&Packet::new(7, b"def".to_vec()).to_vec());
        second.extend_from_slice(&eof_bytes(8, 0));
        second.extend_from_slice(&Packet::new(9, vec![0x01, b'2']).to_vec());
        second.extend_from_slice(&eof_bytes(10, 0));
        let effects = machine.on_readable(&mut dcb, &session, &server, &second);
        assert_eq!(effects.len(), 1);
        match &effects[0] {
            Effect::Reply(chain) => {
                assert_eq!(crate::protocol::packet_count(chain), 10);
            }
            other => panic!("expected Reply, got {:?}", other),
        }
    }

    #[test]
    fn test_error_terminated_result_is_emitted() {
        let session = test_session(RESULT_CAPS);
        let server = test_server(false);
        let mut dcb = test_dcb();
        let mut machine =
            BackendProtocol::new(RESULT_CAPS, capabilities::DEFAULT_CAPABILITIES, 0x21);
        authenticate(&mut machine, &mut dcb, &session, &server);

        machine.write(&mut dcb, &session, &server, query("SELECT * FROM gone"));
        dcb.write_queue.take();

        // The server fails the statement after the column metadata: the
        // ERR ends the result even though only one signal packet arrived.
        let mut reply = Vec::new();
        reply.extend_from_slice(&Packet::new(1, vec![0x01]).to_vec());
        reply.extend_from_slice(&Packet::new(2, b"def".to_vec()).to_vec());
        reply.extend_from_slice(&err_bytes(3, 1146, "Table doesn't exist"));

        let effects = machine.on_readable(&mut dcb, &session, &server, &reply);
        assert_eq!(effects.len(), 1);
        match &effects[0] {
            Effect::Reply(chain) => {
                assert!(chain.has_tag(tags::RESULT));
                assert_eq!(crate::protocol::packet_count(chain), 3);
            }
            other => panic!("expected Reply, got {:?}", other),
        }
        assert!(dcb.read_queue.is_empty());
        assert!(!machine.collect_result);
    }

    #[test]
    fn test_local_infile_reply_marks_load_active() {
        let session = test_session(STMT_CAPS);
        let server = test_server(false);
        let mut dcb = test_dcb();
        let mut machine = BackendProtocol::new(STMT_CAPS, capabilities::DEFAULT_CAPABILITIES, 0x21);
        authenticate(&mut machine, &mut dcb, &session, &server);

        machine.write(&mut dcb, &session, &server, query("LOAD DATA LOCAL INFILE"));
        dcb.write_queue.take();

        let infile = Packet::new(1, vec![0xfb, b'f']).to_vec();
        let effects = machine.on_readable(&mut dcb, &session, &server, &infile);
        assert_eq!(effects.len(), 1);
        assert!(session.load_data_active());

        // Raw file data must not be mistaken for commands.
        let chunk = Packet::new(2, vec![0x01, 0x02, 0x03]).to_vec();
        machine.write(&mut dcb, &session, &server, BufferChain::from_bytes(chunk));
        assert_eq!(machine.current_command, Command::Query);

        // The empty packet terminates the stream.
        let terminator = BufferChain::from_bytes(vec![0, 0, 0, 3]);
        machine.write(&mut dcb, &session, &server, terminator);
        assert!(!session.load_data_active());
    }
}
