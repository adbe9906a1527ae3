//! End-to-end tests against an in-process mock MariaDB backend.
//!
//! The mock speaks just enough of the wire protocol to handshake,
//! acknowledge COM_CHANGE_USER and answer COM_QUERY with a canned result
//! set, which is all the proxy core needs to be driven through its
//! interesting paths without a real server.

mod mock;
mod proxy;

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use viaduct::config::{GlobalConfig, ServerConfig, ServiceConfig};
use viaduct::pool::ConnectionPool;
use viaduct::protocol::{
    compute_auth_response, capabilities, HandshakeResponse, InitialHandshake, Packet, PacketCodec,
};
use viaduct::router::{PassthroughRouter, Router};
use viaduct::server::ServerRegistry;
use viaduct::session::{Service, Session};
use viaduct::worker::Workers;

pub const TEST_USER: &str = "app";
pub const TEST_PASSWORD: &str = "secret";

/// A proxy wired up to one backend, listening on an ephemeral port.
pub struct TestProxy {
    pub addr: std::net::SocketAddr,
    pub pool: Arc<ConnectionPool>,
}

impl TestProxy {
    /// Spawn the accept loop the binary would run, pointed at `backend`.
    pub async fn start(backend: std::net::SocketAddr, persistent_pool: bool) -> Self {
        let mut server_cfg = ServerConfig {
            name: "mock1".to_string(),
            address: backend.ip().to_string(),
            port: backend.port(),
            ..Default::default()
        };
        server_cfg.persistent_pool.enabled = persistent_pool;

        let service = Service::new(ServiceConfig {
            listen_addr: "127.0.0.1".to_string(),
            listen_port: 0,
            user: TEST_USER.to_string(),
            password: TEST_PASSWORD.to_string(),
            enable_root: false,
        });
        let global = GlobalConfig::default();
        // One worker keeps every session on the same per-worker pool.
        let workers = Workers::start(1);
        let registry = Arc::new(ServerRegistry::from_configs(&[server_cfg]));
        let pool = ConnectionPool::new();
        let router: Arc<dyn Router> = Arc::new(PassthroughRouter);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept_pool = pool.clone();
        tokio::spawn(async move {
            let mut next_id = 1u64;
            while let Ok((stream, peer)) = listener.accept().await {
                let worker = workers.assign();
                let session = Session::new(
                    next_id,
                    worker,
                    Some(peer),
                    service.clone(),
                    router.clone(),
                    registry.clone(),
                    accept_pool.clone(),
                    workers.clone(),
                    &global,
                );
                next_id += 1;
                tokio::spawn(Workers::scope(worker, async move {
                    let _ = session.run(stream).await;
                }));
            }
        });

        Self { addr, pool }
    }
}

/// A raw protocol client talking to the proxy.
#[derive(Debug)]
pub struct TestClient {
    framed: Framed<TcpStream, PacketCodec>,
}

impl TestClient {
    /// Connect and authenticate; returns Err with the ERR payload when the
    /// proxy rejects the login.
    pub async fn connect(
        addr: std::net::SocketAddr,
        user: &str,
        password: &str,
    ) -> Result<Self, Vec<u8>> {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, PacketCodec);

        let greeting = framed.next().await.unwrap().unwrap();
        let handshake = InitialHandshake::parse(&greeting.payload).unwrap();
        let scramble = handshake.scramble();

        let response = HandshakeResponse {
            capability_flags: capabilities::DEFAULT_CAPABILITIES,
            max_packet_size: 16 * 1024 * 1024,
            character_set: 0x21,
            username: user.to_string(),
            auth_response: compute_auth_response(password, &scramble),
            database: None,
            auth_plugin_name: "mysql_native_password".to_string(),
        };
        framed.send(response.encode(1)).await.unwrap();

        let verdict = framed.next().await.unwrap().unwrap();
        if verdict.payload.first() == Some(&0x00) {
            Ok(Self { framed })
        } else {
            Err(verdict.payload.to_vec())
        }
    }

    /// Send a COM_QUERY and collect the reply packets: a single OK/ERR, or
    /// a result set up to its second EOF.
    pub async fn query(&mut self, sql: &str) -> Vec<Packet> {
        let mut payload = vec![0x03];
        payload.extend_from_slice(sql.as_bytes());
        self.framed.send(Packet::new(0, payload)).await.unwrap();

        let mut packets = Vec::new();
        let mut eof_count = 0;
        loop {
            let packet = self.framed.next().await.unwrap().unwrap();
            let first = packet.payload.first().copied();
            let is_eof = first == Some(0xfe) && packet.payload.len() <= 5;
            let terminal = match first {
                Some(0x00) | Some(0xff) if packets.is_empty() => true,
                _ => {
                    if is_eof {
                        eof_count += 1;
                    }
                    eof_count == 2
                }
            };
            packets.push(packet);
            if terminal {
                return packets;
            }
        }
    }

    pub async fn quit(mut self) {
        let _ = self.framed.send(Packet::new(0, vec![0x01])).await;
    }
}
