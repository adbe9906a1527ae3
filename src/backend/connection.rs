//! Tokio driver for one backend connection.
//!
//! Owns the socket and the DCB, feeds socket events to the protocol state
//! machine, drains the DCB write queue, and executes the machine's
//! effects. Requests arrive from the session over a channel, so a request
//! written before authentication finishes simply lands in the delay queue
//! exactly as the machine dictates.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::buffer::BufferChain;
use crate::dcb::Dcb;
use crate::metrics::metrics;
use crate::pool::{ConnectionPool, PooledBackend};
use crate::protocol::packet::capabilities;
use crate::protocol::{build_com_quit, custom_error};
use crate::router::ErrorAction;
use crate::server::Server;
use crate::session::{Service, SessionShared};
use crate::worker::Workers;

use super::machine::{BackendProtocol, Effect};

/// Requests a session sends its backend connection.
#[derive(Debug)]
pub enum BackendRequest {
    Write(BufferChain),
    /// Synthesise a COM_CHANGE_USER for the session's current credentials.
    ChangeUser,
    /// Force the connection through its error path.
    FakeHangup,
    /// Graceful close; the connection may return to the pool.
    Close,
}

/// What a backend connection reports back to its session. Replies carry
/// the DCB id so the session can ignore stragglers from a connection it
/// already abandoned.
#[derive(Debug)]
pub enum BackendReply {
    /// An assembled reply for the router's client-reply path.
    Data(BufferChain),
    /// The error funnel fired: a synthetic error packet plus the action the
    /// router should consider.
    Error {
        action: ErrorAction,
        errbuf: BufferChain,
        server: String,
        dcb_id: u64,
    },
    /// The connection is gone (closed or pooled).
    Closed { dcb_id: u64 },
}

/// Session-side handle to a backend connection task.
pub struct BackendHandle {
    tx: mpsc::UnboundedSender<BackendRequest>,
    server: Arc<Server>,
    pub dcb_id: u64,
}

impl BackendHandle {
    pub fn write(&self, chain: BufferChain) -> bool {
        self.tx.send(BackendRequest::Write(chain)).is_ok()
    }

    pub fn change_user(&self) -> bool {
        self.tx.send(BackendRequest::ChangeUser).is_ok()
    }

    pub fn fake_hangup(&self) {
        let _ = self.tx.send(BackendRequest::FakeHangup);
    }

    pub fn close(&self) {
        let _ = self.tx.send(BackendRequest::Close);
    }

    pub fn server_name(&self) -> &str {
        &self.server.name
    }
}

/// TCP or Unix-socket transport to a backend server.
#[derive(Debug)]
pub enum BackendStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl BackendStream {
    pub async fn connect(server: &Server) -> io::Result<Self> {
        if server.is_unix_socket() {
            Ok(Self::Unix(UnixStream::connect(&server.address).await?))
        } else {
            Ok(Self::Tcp(
                TcpStream::connect((server.address.as_str(), server.port)).await?,
            ))
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(s) => s.peer_addr().ok(),
            Self::Unix(_) => None,
        }
    }

    /// Non-blocking read used to detect stray bytes on pooled sockets.
    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.try_read(buf),
            Self::Unix(s) => s.try_read(buf),
        }
    }

    pub async fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf).await,
            Self::Unix(s) => s.read(buf).await,
        }
    }

    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.write_all(data).await,
            Self::Unix(s) => s.write_all(data).await,
        }
    }
}

/// Proxy-protocol v1 text line carrying the real client address to the
/// backend. Mixed address families are promoted to TCP6 with an IPv4-mapped
/// form; anything without two IP endpoints degrades to UNKNOWN.
pub fn proxy_protocol_header(client: Option<SocketAddr>, backend: Option<SocketAddr>) -> String {
    use SocketAddr::{V4, V6};
    match (client, backend) {
        (Some(V4(c)), Some(V4(b))) => {
            format!("PROXY TCP4 {} {} {} {}\r\n", c.ip(), b.ip(), c.port(), b.port())
        }
        (Some(V6(c)), Some(V6(b))) => {
            format!("PROXY TCP6 {} {} {} {}\r\n", c.ip(), b.ip(), c.port(), b.port())
        }
        (Some(V4(c)), Some(V6(b))) => format!(
            "PROXY TCP6 ::ffff:{} {} {} {}\r\n",
            c.ip(),
            b.ip(),
            c.port(),
            b.port()
        ),
        (Some(V6(c)), Some(V4(b))) => format!(
            "PROXY TCP6 {} ::ffff:{} {} {}\r\n",
            c.ip(),
            b.ip(),
            c.port(),
            b.port()
        ),
        _ => "PROXY UNKNOWN\r\n".to_string(),
    }
}

/// Everything the driver loop needs besides the socket and the request
/// channel.
struct Driver {
    server: Arc<Server>,
    session: Arc<SessionShared>,
    service: Arc<Service>,
    workers: Arc<Workers>,
    pool: Arc<ConnectionPool>,
    reply_tx: mpsc::UnboundedSender<BackendReply>,
    dcb: Dcb,
    machine: BackendProtocol,
}

impl Driver {
    /// Execute machine effects. A FakeHangup feeds back into the machine,
    /// so this runs off a worklist instead of recursing.
    fn apply(&mut self, effects: Vec<Effect>) {
        let mut queue: VecDeque<Effect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::Reply(chain) => {
                    let _ = self.reply_tx.send(BackendReply::Data(chain));
                }
                Effect::Error { action, message } => {
                    metrics().record_backend_error(match action {
                        ErrorAction::ReplyClient => "auth",
                        ErrorAction::NewConnection => "transport",
                    });
                    let errbuf = custom_error(1, &message);
                    let _ = self.reply_tx.send(BackendReply::Error {
                        action,
                        errbuf,
                        server: self.server.name.clone(),
                        dcb_id: self.dcb.id,
                    });
                    self.dcb.closing = true;
                }
                Effect::MarkServerMaintenance => {
                    let server = self.server.clone();
                    self.workers.post_to_main(move || {
                        if server.set_maintenance() {
                            error!(
                                server = %server.name,
                                "Server put into maintenance mode because it is blocking \
                                 connections from the proxy"
                            );
                            metrics().record_server_maintenance();
                        }
                    });
                }
                Effect::RefreshUsers => {
                    let service = self.service.clone();
                    self.workers.post_to_main(move || service.refresh_users());
                }
                Effect::FakeHangup => {
                    let more = self.machine.on_hangup(&mut self.dcb);
                    queue.extend(more);
                    self.dcb.closing = true;
                }
            }
        }
    }

    /// Drain the DCB write queue to the socket. Handshake-phase writes get
    /// the server's write timeout.
    async fn flush_writes(&mut self, stream: &mut BackendStream) -> bool {
        while !self.dcb.write_queue.is_empty() {
            let data = self.dcb.write_queue.take().to_vec();
            let result = if self.machine.is_complete() {
                stream.write_all(&data).await
            } else {
                match timeout(self.server.write_timeout, stream.write_all(&data)).await {
                    Ok(result) => result,
                    Err(_) => Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "write to backend timed out",
                    )),
                }
            };
            if let Err(e) = result {
                if !self.dcb.silence_write_errors {
                    warn!(server = %self.server.name, error = %e, "Write to backend failed");
                }
                let errno = e.raw_os_error().unwrap_or(0);
                let effects = self.machine.on_socket_error(&mut self.dcb, errno);
                self.apply(effects);
                self.dcb.closing = true;
                return false;
            }
        }
        true
    }

    fn fail_transport(&mut self, message: &str) {
        if self.dcb.mark_error_handled() {
            metrics().record_backend_error("transport");
            let errbuf = custom_error(1, message);
            let _ = self.reply_tx.send(BackendReply::Error {
                action: ErrorAction::NewConnection,
                errbuf,
                server: self.server.name.clone(),
                dcb_id: self.dcb.id,
            });
        }
        self.dcb.closing = true;
    }
}

/// One backend connection: a driver plus its socket and request channel.
pub struct BackendConnection;

impl BackendConnection {
    /// Open a fresh connection to `server`. Returns immediately; the
    /// connect and handshake proceed in the connection task and requests
    /// sent before completion wait in the delay queue.
    pub fn spawn(
        server: Arc<Server>,
        session: Arc<SessionShared>,
        service: Arc<Service>,
        workers: Arc<Workers>,
        pool: Arc<ConnectionPool>,
        reply_tx: mpsc::UnboundedSender<BackendReply>,
    ) -> BackendHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = session.worker;
        let dcb = Dcb::new_backend(worker, session.id, &server.name);
        let dcb_id = dcb.id;
        let machine = BackendProtocol::new(
            session.router_caps,
            capabilities::DEFAULT_CAPABILITIES,
            session.credentials().charset,
        );
        let driver = Driver {
            server: server.clone(),
            session,
            service,
            workers,
            pool,
            reply_tx,
            dcb,
            machine,
        };
        tokio::spawn(Workers::scope(worker, run(driver, rx, None)));
        BackendHandle {
            tx,
            server,
            dcb_id,
        }
    }

    /// Resume a pooled connection for a new session. The pool has already
    /// stamped the DCB as adopted; the first write will synthesise the
    /// COM_CHANGE_USER.
    pub fn spawn_adopted(
        entry: PooledBackend,
        session: Arc<SessionShared>,
        service: Arc<Service>,
        workers: Arc<Workers>,
        pool: Arc<ConnectionPool>,
        reply_tx: mpsc::UnboundedSender<BackendReply>,
    ) -> BackendHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = session.worker;
        let PooledBackend {
            stream,
            dcb,
            machine,
            server,
        } = entry;
        let dcb_id = dcb.id;
        let driver = Driver {
            server: server.clone(),
            session,
            service,
            workers,
            pool,
            reply_tx,
            dcb,
            machine,
        };
        tokio::spawn(Workers::scope(worker, run(driver, rx, Some(stream))));
        BackendHandle {
            tx,
            server,
            dcb_id,
        }
    }
}

async fn run(
    mut core: Driver,
    mut rx: mpsc::UnboundedReceiver<BackendRequest>,
    stream: Option<BackendStream>,
) {
    let mut stream = match stream {
        Some(stream) => stream,
        None => {
            core.machine.connect_started();
            let connected = timeout(
                core.server.connect_timeout,
                BackendStream::connect(&core.server),
            )
            .await;
            let stream = match connected {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    core.machine.connect_failed();
                    core.fail_transport(&format!(
                        "Failed to connect to backend server '{}': {}",
                        core.server.name, e
                    ));
                    let _ = core.reply_tx.send(BackendReply::Closed {
                        dcb_id: core.dcb.id,
                    });
                    return;
                }
                Err(_) => {
                    core.machine.connect_failed();
                    core.fail_transport(&format!(
                        "Connection to backend server '{}' timed out",
                        core.server.name
                    ));
                    let _ = core.reply_tx.send(BackendReply::Closed {
                        dcb_id: core.dcb.id,
                    });
                    return;
                }
            };
            metrics().record_backend_connect();
            debug!(
                session_id = core.session.id,
                server = %core.server.name,
                endpoint = %core.server.endpoint(),
                "Connected to backend"
            );
            let header = if core.server.proxy_protocol {
                Some(proxy_protocol_header(
                    core.session.client_addr,
                    stream.peer_addr(),
                ))
            } else {
                None
            };
            core.machine.connect_established(&mut core.dcb, header);
            stream
        }
    };

    let mut buf = vec![0u8; 16 * 1024];
    loop {
        if !core.flush_writes(&mut stream).await {
            break;
        }
        if core.dcb.closing {
            break;
        }

        let auth_phase = !core.machine.is_complete();
        let read_timeout = core.server.read_timeout;

        tokio::select! {
            request = rx.recv() => {
                match request {
                    Some(BackendRequest::Write(chain)) => {
                        let (ok, effects) =
                            core.machine.write(&mut core.dcb, &core.session, &core.server, chain);
                        core.apply(effects);
                        if !ok {
                            core.dcb.closing = true;
                        }
                    }
                    Some(BackendRequest::ChangeUser) => {
                        let (ok, effects) = core
                            .machine
                            .write_change_user(&mut core.dcb, &core.session, &core.server);
                        core.apply(effects);
                        if !ok {
                            core.dcb.closing = true;
                        }
                    }
                    Some(BackendRequest::FakeHangup) => {
                        let effects = core.machine.on_hangup(&mut core.dcb);
                        core.apply(effects);
                        core.dcb.closing = true;
                    }
                    Some(BackendRequest::Close) | None => {
                        break;
                    }
                }
            }
            read = async {
                if auth_phase {
                    timeout(read_timeout, stream.read_some(&mut buf)).await
                } else {
                    Ok(stream.read_some(&mut buf).await)
                }
            } => {
                match read {
                    Err(_) => {
                        core.machine.connect_failed();
                        core.fail_transport(&format!(
                            "Timed out waiting for the handshake from backend server '{}'",
                            core.server.name
                        ));
                    }
                    Ok(Ok(0)) => {
                        let effects = core.machine.on_hangup(&mut core.dcb);
                        core.apply(effects);
                        core.dcb.closing = true;
                    }
                    Ok(Ok(n)) => {
                        let data = buf[..n].to_vec();
                        let effects =
                            core.machine.on_readable(&mut core.dcb, &core.session, &core.server, &data);
                        core.apply(effects);
                    }
                    Ok(Err(e)) => {
                        let errno = e.raw_os_error().unwrap_or(0);
                        let effects = core.machine.on_socket_error(&mut core.dcb, errno);
                        core.apply(effects);
                        core.dcb.closing = true;
                    }
                }
            }
        }
    }

    // Flush anything the last event queued (e.g. a suppressed COM_QUIT left
    // nothing, but an ignorable drain may have).
    if !core.dcb.closing {
        let _ = core.flush_writes(&mut stream).await;
    }

    shutdown(core, stream).await;
}

/// Close path: clean connections to a poolable server go back to the pool,
/// everything else gets a best-effort COM_QUIT.
async fn shutdown(core: Driver, stream: BackendStream) {
    let Driver {
        server,
        pool,
        reply_tx,
        mut dcb,
        machine,
        ..
    } = core;
    let dcb_id = dcb.id;

    let mut stream = stream;
    if !dcb.closing && machine.can_pool(&dcb) && server.persistent_conns_enabled() {
        dcb.enter_pool();
        match pool.put(PooledBackend {
            stream,
            dcb,
            machine,
            server: server.clone(),
        }) {
            Ok(()) => {
                metrics().record_pool_return();
                debug!(server = %server.name, "Returned backend connection to the pool");
                let _ = reply_tx.send(BackendReply::Closed { dcb_id });
                return;
            }
            Err(entry) => {
                stream = entry.stream;
            }
        }
    }

    let _ = stream.write_all(&build_com_quit().to_vec()).await;
    info!(server = %server.name, "Closed backend connection");
    let _ = reply_tx.send(BackendReply::Closed { dcb_id });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

    fn v4(ip: [u8; 4], port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(ip), port))
    }

    fn v6(port: u16) -> SocketAddr {
        SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::LOCALHOST, port, 0, 0))
    }

    #[test]
    fn test_proxy_header_tcp4() {
        let header = proxy_protocol_header(
            Some(v4([192, 168, 0, 1], 51234)),
            Some(v4([10, 0, 0, 2], 3306)),
        );
        assert_eq!(header, "PROXY TCP4 192.168.0.1 10.0.0.2 51234 3306\r\n");
    }

    #[test]
    fn test_proxy_header_tcp6() {
        let header = proxy_protocol_header(Some(v6(100)), Some(v6(3306)));
        assert_eq!(header, "PROXY TCP6 ::1 ::1 100 3306\r\n");
    }

    #[test]
    fn test_proxy_header_mixed_families() {
        let header = proxy_protocol_header(Some(v4([192, 168, 0, 1], 100)), Some(v6(3306)));
        assert_eq!(header, "PROXY TCP6 ::ffff:192.168.0.1 ::1 100 3306\r\n");

        let header = proxy_protocol_header(Some(v6(100)), Some(v4([10, 0, 0, 2], 3306)));
        assert_eq!(header, "PROXY TCP6 ::1 ::ffff:10.0.0.2 100 3306\r\n");
    }

    #[test]
    fn test_proxy_header_unknown_for_unix() {
        assert_eq!(
            proxy_protocol_header(None, None),
            "PROXY UNKNOWN\r\n"
        );
        assert_eq!(
            proxy_protocol_header(Some(v4([1, 2, 3, 4], 5)), None),
            "PROXY UNKNOWN\r\n"
        );
    }
}
