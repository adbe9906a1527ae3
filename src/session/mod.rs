//! Client sessions.
//!
//! A session groups one client connection with a router instance and the
//! backend connections it acquires. It owns the client half of the
//! protocol: the handshake the proxy presents, verification against the
//! service account, the command loop, and the tail end of the error
//! funnel.

mod trace;

pub use trace::SessionTrace;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::auth::{ClientVerifier, Credentials};
use crate::backend::{BackendConnection, BackendHandle, BackendReply};
use crate::buffer::BufferChain;
use crate::config::{GlobalConfig, ServiceConfig};
use crate::dcb::Dcb;
use crate::metrics::metrics;
use crate::pool::ConnectionPool;
use crate::protocol::packet::SCRAMBLE_LEN;
use crate::protocol::{
    custom_error, ChangeUserRequest, Command, ErrPacket, HandshakeResponse, InitialHandshake,
    OkPacket, Packet, PacketCodec,
};
use crate::router::{ErrorAction, Router};
use crate::server::ServerRegistry;
use crate::worker::{WorkerId, Workers};

/// Why a session ended, for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent COM_QUIT.
    ClientQuit,
    /// The client socket closed without a COM_QUIT.
    PeerClosed,
    /// The router's error handler declined to keep the session.
    HandleErrorFailed,
    /// Some other failure tore the session down.
    Error,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientQuit => "client_quit",
            CloseReason::PeerClosed => "peer_closed",
            CloseReason::HandleErrorFailed => "handle_error_failed",
            CloseReason::Error => "error",
        }
    }
}

/// State shared between the session task and its backend connection tasks.
pub struct SessionShared {
    pub id: u64,
    pub worker: WorkerId,
    /// Capabilities the session's router declared.
    pub router_caps: u64,
    pub client_addr: Option<SocketAddr>,
    pub trace: SessionTrace,
    credentials: RwLock<Credentials>,
    load_active: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
}

impl SessionShared {
    pub fn new(
        id: u64,
        worker: WorkerId,
        router_caps: u64,
        client_addr: Option<SocketAddr>,
        trace: SessionTrace,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            worker,
            router_caps,
            client_addr,
            trace,
            credentials: RwLock::new(Credentials::new("", "", "", 0x21)),
            load_active: AtomicBool::new(false),
            close_reason: Mutex::new(None),
        })
    }

    /// Snapshot of the authenticated credentials.
    pub fn credentials(&self) -> Credentials {
        self.credentials.read().clone()
    }

    pub fn set_credentials(&self, credentials: Credentials) {
        *self.credentials.write() = credentials;
    }

    /// Adopt a schema change reported through session-state tracking.
    pub fn set_default_db(&self, db: &str) {
        self.credentials.write().db = db.to_string();
    }

    /// A LOAD DATA LOCAL INFILE stream is active; outbound packets are raw
    /// file data, not commands.
    pub fn load_data_active(&self) -> bool {
        self.load_active.load(Ordering::Acquire)
    }

    pub fn set_load_data_active(&self, active: bool) {
        self.load_active.store(active, Ordering::Release);
    }

    /// First close reason wins.
    pub fn set_close_reason(&self, reason: CloseReason) {
        let mut slot = self.close_reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }
}

/// The listening service: the account clients authenticate against and the
/// debounced user-data refresh hook.
pub struct Service {
    pub config: ServiceConfig,
    pub verifier: ClientVerifier,
    users_refreshing: AtomicBool,
}

impl Service {
    pub fn new(config: ServiceConfig) -> Arc<Self> {
        let verifier = ClientVerifier::new(&config.user, &config.password, config.enable_root);
        Arc::new(Self {
            config,
            verifier,
            users_refreshing: AtomicBool::new(false),
        })
    }

    /// Refresh the service's user account data. Debounced to at most one
    /// refresh in flight; runs on the main worker.
    pub fn refresh_users(&self) {
        if self
            .users_refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        info!(user = %self.config.user, "Refreshing service user account data");
        self.users_refreshing.store(false, Ordering::Release);
    }
}

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Client disconnected")]
    ClientDisconnected,

    #[error("Client authentication failed")]
    AuthFailed,

    #[error("No backend server available")]
    NoBackendAvailable,

    #[error("Backend failed and the router declined to continue")]
    BackendFailed,
}

/// One client session.
pub struct Session {
    shared: Arc<SessionShared>,
    service: Arc<Service>,
    router: Arc<dyn Router>,
    registry: Arc<ServerRegistry>,
    pool: Arc<ConnectionPool>,
    workers: Arc<Workers>,
    backend: Option<BackendHandle>,
    reply_tx: mpsc::UnboundedSender<BackendReply>,
    reply_rx: mpsc::UnboundedReceiver<BackendReply>,
    client_dcb: Dcb,
    client_scramble: [u8; SCRAMBLE_LEN],
    client_capabilities: u32,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        worker: WorkerId,
        client_addr: Option<SocketAddr>,
        service: Arc<Service>,
        router: Arc<dyn Router>,
        registry: Arc<ServerRegistry>,
        pool: Arc<ConnectionPool>,
        workers: Arc<Workers>,
        global: &GlobalConfig,
    ) -> Self {
        let trace = SessionTrace::new(
            global.session_trace,
            global.retain_last_statements,
            global.dump_last_statements,
        );
        let shared = SessionShared::new(id, worker, router.capabilities(), client_addr, trace);
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        Self {
            shared,
            service,
            router,
            registry,
            pool,
            workers,
            backend: None,
            reply_tx,
            reply_rx,
            client_dcb: Dcb::new_client(worker, id),
            client_scramble: [0; SCRAMBLE_LEN],
            client_capabilities: 0,
        }
    }

    /// Session diagnostics for the admin surface: the client descriptor
    /// plus the backend it is currently attached to.
    pub fn diagnostics(&self) -> serde_json::Value {
        serde_json::json!({
            "session_id": self.shared.id,
            "close_reason": self.shared.close_reason().map(|r| r.as_str()),
            "client": self.client_dcb.diagnostics(),
            "backend_server": self.backend.as_ref().map(|b| b.server_name().to_string()),
        })
    }

    pub fn shared(&self) -> Arc<SessionShared> {
        self.shared.clone()
    }

    /// Run the session over the client connection.
    pub async fn run<S>(mut self, client_stream: S) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut client = Framed::new(client_stream, PacketCodec);

        let result = match self.authenticate_client(&mut client).await {
            Ok(()) => self.command_loop(&mut client).await,
            Err(e) => Err(e),
        };

        if result.is_err() {
            self.shared.set_close_reason(CloseReason::Error);
            self.shared.trace.dump_on_error(self.shared.id);
        }
        self.shared.trace.dump_on_close(self.shared.id);

        // Tear down backends; the handle drop closes or pools them.
        if let Some(backend) = self.backend.take() {
            backend.close();
        }

        info!(
            session_id = self.shared.id,
            reason = self
                .shared
                .close_reason()
                .map(|r| r.as_str())
                .unwrap_or("unknown"),
            "Session ended"
        );
        result
    }

    /// Handshake with the client and verify it against the service account.
    async fn authenticate_client<S>(
        &mut self,
        client: &mut Framed<S, PacketCodec>,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let handshake = InitialHandshake::new(self.shared.id as u32);
        self.client_scramble = handshake.scramble();
        client.send(handshake.encode()).await?;

        let response_packet = client
            .next()
            .await
            .ok_or(SessionError::ClientDisconnected)??;

        let response = HandshakeResponse::parse(&response_packet.payload)
            .ok_or_else(|| SessionError::Protocol("Invalid handshake response".into()))?;
        self.client_capabilities = response.capability_flags;

        debug!(
            session_id = self.shared.id,
            username = %response.username,
            database = ?response.database,
            "Received handshake response"
        );

        if !self.service.verifier.verify(
            &response.username,
            &response.auth_response,
            &self.client_scramble,
        ) {
            warn!(
                session_id = self.shared.id,
                username = %response.username,
                "Client authentication failed"
            );
            let err = ErrPacket::new(
                1045,
                "28000",
                &format!("Access denied for user '{}'", response.username),
            );
            client
                .send(err.encode(response_packet.sequence_id.wrapping_add(1), response.capability_flags))
                .await?;
            return Err(SessionError::AuthFailed);
        }

        self.shared.set_credentials(Credentials {
            user: response.username.clone(),
            password_sha1: self.service.verifier.password_sha1(),
            db: response.database.clone().unwrap_or_default(),
            charset: response.character_set as u16,
        });

        client
            .send(OkPacket::new().encode(2, response.capability_flags))
            .await?;

        metrics().record_session_started();
        info!(
            session_id = self.shared.id,
            username = %response.username,
            "Client authenticated"
        );
        Ok(())
    }

    /// Main command loop: client requests one way, backend replies the
    /// other, the funnel in between.
    async fn command_loop<S>(
        &mut self,
        client: &mut Framed<S, PacketCodec>,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            tokio::select! {
                packet = client.next() => {
                    match packet {
                        None => {
                            self.shared.set_close_reason(CloseReason::PeerClosed);
                            return Ok(());
                        }
                        Some(Err(e)) => {
                            self.shared.set_close_reason(CloseReason::PeerClosed);
                            return Err(e.into());
                        }
                        Some(Ok(packet)) => {
                            if !self.handle_client_packet(client, packet).await? {
                                return Ok(());
                            }
                        }
                    }
                }
                reply = self.reply_rx.recv() => {
                    match reply {
                        Some(BackendReply::Data(chain)) => {
                            let chain = self.router.client_reply(&self.shared, chain);
                            self.send_chain(client, chain).await?;
                        }
                        Some(BackendReply::Error { action, errbuf, server, dcb_id }) => {
                            // A failure on a connection this session already
                            // walked away from is old news.
                            if self.backend.as_ref().is_some_and(|b| b.dcb_id == dcb_id) {
                                self.handle_backend_error(client, action, errbuf, &server).await?;
                            }
                        }
                        Some(BackendReply::Closed { dcb_id }) => {
                            if self.backend.as_ref().is_some_and(|b| b.dcb_id == dcb_id) {
                                self.backend = None;
                            }
                        }
                        None => {}
                    }
                }
            }
        }
    }

    /// Returns Ok(false) when the session should end.
    async fn handle_client_packet<S>(
        &mut self,
        client: &mut Framed<S, PacketCodec>,
        packet: Packet,
    ) -> Result<bool, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.client_dcb.assert_owner();
        let command = packet.payload.first().map(|b| Command::from(*b));

        if !self.shared.load_data_active() {
            match command {
                Some(Command::Quit) => {
                    self.shared.set_close_reason(CloseReason::ClientQuit);
                    if let Some(backend) = self.backend.take() {
                        // The machine decides whether the COM_QUIT reaches
                        // the wire or the connection goes back to the pool.
                        backend.write(BufferChain::from_bytes(packet.to_vec()));
                        backend.close();
                    }
                    return Ok(false);
                }
                Some(Command::ChangeUser) => {
                    self.handle_change_user(client, &packet).await?;
                    return Ok(true);
                }
                Some(Command::Query) => {
                    let sql = String::from_utf8_lossy(&packet.payload[1..]);
                    self.shared.trace.record(&sql);
                }
                _ => {}
            }
        }

        self.ensure_backend(client).await?;
        if let Some(backend) = &self.backend {
            backend.write(BufferChain::from_bytes(packet.to_vec()));
        }
        Ok(true)
    }

    /// Re-verify a client COM_CHANGE_USER locally, update the credential
    /// snapshot and re-synthesise the packet toward the backend with the
    /// backend's own scramble.
    async fn handle_change_user<S>(
        &mut self,
        client: &mut Framed<S, PacketCodec>,
        packet: &Packet,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(request) = ChangeUserRequest::parse(&packet.payload) else {
            let err = ErrPacket::new(1047, "08S01", "Malformed COM_CHANGE_USER");
            client.send(err.encode(1, self.client_capabilities)).await?;
            return Ok(());
        };

        match self.service.verifier.reauthenticate(
            &request.user,
            &request.token,
            &self.client_scramble,
        ) {
            Some(password_sha1) => {
                metrics().record_change_user();
                self.shared.set_credentials(Credentials {
                    user: request.user.clone(),
                    password_sha1,
                    db: request.database.clone(),
                    charset: request.charset,
                });
                info!(
                    session_id = self.shared.id,
                    user = %request.user,
                    database = %request.database,
                    "Client changed user"
                );
                self.ensure_backend(client).await?;
                if let Some(backend) = &self.backend {
                    backend.change_user();
                }
                Ok(())
            }
            None => {
                // A stale user cache is the usual cause; schedule a refresh
                // before rejecting.
                let service = self.service.clone();
                self.workers.post_to_main(move || service.refresh_users());
                warn!(
                    session_id = self.shared.id,
                    user = %request.user,
                    "COM_CHANGE_USER authentication failed"
                );
                let err = ErrPacket::new(
                    1045,
                    "28000",
                    &format!("Access denied for user '{}'", request.user),
                );
                client.send(err.encode(1, self.client_capabilities)).await?;
                Ok(())
            }
        }
    }

    /// Make sure a backend connection exists, adopting from the pool when
    /// possible. When no server is selectable the client gets a synthetic
    /// error and the session ends.
    async fn ensure_backend<S>(
        &mut self,
        client: &mut Framed<S, PacketCodec>,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.backend.is_some() {
            return Ok(());
        }

        let Some(server) = self.router.select_backend(&self.registry) else {
            warn!(session_id = self.shared.id, "No backend server available");
            let errbuf = custom_error(1, "Unable to find a backend server to connect to");
            self.send_chain(client, errbuf).await?;
            self.shared.set_close_reason(CloseReason::HandleErrorFailed);
            return Err(SessionError::NoBackendAvailable);
        };

        let handle = match self.pool.adopt(&server.name, self.shared.worker, self.shared.id) {
            Some(entry) => {
                metrics().record_pool_hit();
                debug!(
                    session_id = self.shared.id,
                    server = %server.name,
                    "Adopted pooled backend connection"
                );
                BackendConnection::spawn_adopted(
                    entry,
                    self.shared.clone(),
                    self.service.clone(),
                    self.workers.clone(),
                    self.pool.clone(),
                    self.reply_tx.clone(),
                )
            }
            None => {
                metrics().record_pool_miss();
                BackendConnection::spawn(
                    server.clone(),
                    self.shared.clone(),
                    self.service.clone(),
                    self.workers.clone(),
                    self.pool.clone(),
                    self.reply_tx.clone(),
                )
            }
        };
        self.backend = Some(handle);
        Ok(())
    }

    /// Tail end of the error funnel: consult the router, forward the
    /// synthetic error when asked, and decide whether the session lives.
    async fn handle_backend_error<S>(
        &mut self,
        client: &mut Framed<S, PacketCodec>,
        action: ErrorAction,
        errbuf: BufferChain,
        server: &str,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let keep_going = self
            .router
            .handle_error(&self.shared, &errbuf, Some(server), action);

        if action == ErrorAction::ReplyClient {
            self.send_chain(client, errbuf).await?;
        }

        // Either way this backend is done.
        if let Some(backend) = self.backend.take() {
            backend.close();
        }

        if keep_going {
            Ok(())
        } else {
            self.shared.set_close_reason(CloseReason::HandleErrorFailed);
            Err(SessionError::BackendFailed)
        }
    }

    async fn send_chain<S>(
        &self,
        client: &mut Framed<S, PacketCodec>,
        chain: BufferChain,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        client.send(chain).await?;
        Ok(())
    }
}
