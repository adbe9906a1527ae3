//! Minimal MariaDB backend for driving the proxy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use viaduct::protocol::{InitialHandshake, Packet, PacketCodec};

pub const MOCK_SCRAMBLE: [u8; 20] = *b"abcdefghijklmnopqrst";

/// One accepted connection's view of the world.
async fn serve(stream: TcpStream, connection_id: u32, requests: Arc<Mutex<Vec<Vec<u8>>>>) {
    let mut framed = Framed::new(stream, PacketCodec);

    let handshake = InitialHandshake {
        protocol_version: 10,
        server_version: "10.6.14-MariaDB-mock".to_string(),
        connection_id,
        auth_plugin_data_part1: {
            let mut part1 = [0u8; 8];
            part1.copy_from_slice(&MOCK_SCRAMBLE[..8]);
            part1
        },
        capability_flags: viaduct::protocol::capabilities::DEFAULT_CAPABILITIES,
        character_set: 0x21,
        status_flags: 0x0002,
        auth_plugin_data_part2: MOCK_SCRAMBLE[8..].to_vec(),
        auth_plugin_name: "mysql_native_password".to_string(),
    };
    if framed.send(handshake.encode()).await.is_err() {
        return;
    }

    // Auth response from the proxy; accept anything.
    let Some(Ok(_auth)) = framed.next().await else {
        return;
    };
    if framed.send(ok_packet(2)).await.is_err() {
        return;
    }

    while let Some(Ok(packet)) = framed.next().await {
        requests.lock().push(packet.payload.to_vec());
        match packet.payload.first() {
            // COM_QUIT
            Some(0x01) => return,
            // COM_QUERY: canned one-column, one-row result set
            Some(0x03) => {
                for reply in result_set() {
                    if framed.send(reply).await.is_err() {
                        return;
                    }
                }
            }
            // COM_CHANGE_USER
            Some(0x11) => {
                if framed.send(ok_packet(1)).await.is_err() {
                    return;
                }
            }
            _ => {
                if framed.send(ok_packet(1)).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn ok_packet(seq: u8) -> Packet {
    Packet::new(seq, vec![0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00])
}

fn eof_packet(seq: u8) -> Packet {
    Packet::new(seq, vec![0xfe, 0x00, 0x00, 0x02, 0x00])
}

fn result_set() -> Vec<Packet> {
    vec![
        Packet::new(1, vec![0x01]),
        Packet::new(2, b"coldef".to_vec()),
        eof_packet(3),
        Packet::new(4, vec![0x01, b'1']),
        eof_packet(5),
    ]
}

/// The mock server: accepts connections, records every request payload.
pub struct MockBackend {
    pub addr: std::net::SocketAddr,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
    connections: Arc<AtomicUsize>,
}

impl MockBackend {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let accept_requests = requests.clone();
        let accept_connections = connections.clone();
        tokio::spawn(async move {
            let mut next_id = 100u32;
            while let Ok((stream, _)) = listener.accept().await {
                accept_connections.fetch_add(1, Ordering::SeqCst);
                next_id += 1;
                tokio::spawn(serve(stream, next_id, accept_requests.clone()));
            }
        });

        Self {
            addr,
            requests,
            connections,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().clone()
    }
}
