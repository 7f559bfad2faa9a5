// Shared fixture for integration tests: a raw-frame TCP client and a
// server launcher.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use weft::{FrameFlags, Handler, Server, ServerBinding};

/// Raw-frame client: writes and reads wire frames byte by byte, so the
/// tests exercise the wire format itself.
pub struct TestClient {
    pub stream: TcpStream,
}

#[derive(Debug, PartialEq)]
pub struct WireFrame {
    pub request_id: u64,
    pub flags: FrameFlags,
    pub cmd: u32,
    pub payload: Vec<u8>,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        stream.set_nodelay(true).expect("nodelay");
        Self { stream }
    }

    pub async fn send(&mut self, request_id: u64, cmd: u32, flags: FrameFlags, payload: &[u8]) {
        let mut buf = Vec::with_capacity(16 + payload.len());
        buf.extend_from_slice(&((12 + payload.len()) as u32).to_be_bytes());
        buf.extend_from_slice(&request_id.to_be_bytes());
        buf.push(flags.bits());
        buf.extend_from_slice(&cmd.to_be_bytes()[1..]);
        buf.extend_from_slice(payload);
        self.stream.write_all(&buf).await.expect("send frame");
    }

    /// Read one frame; `None` when the server closed the connection.
    pub async fn recv(&mut self) -> Option<WireFrame> {
        let mut len_buf = [0u8; 4];
        match self.stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return None,
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => return None,
            Err(e) => panic!("recv length: {e}"),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        assert!(len >= 12, "frame body shorter than the fixed header");
        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).await.expect("recv body");
        Some(WireFrame {
            request_id: u64::from_be_bytes(body[0..8].try_into().unwrap()),
            flags: FrameFlags::from_bits_truncate(body[8]),
            cmd: u32::from_be_bytes([0, body[9], body[10], body[11]]),
            payload: body[12..].to_vec(),
        })
    }

    pub async fn recv_expect(&mut self) -> WireFrame {
        tokio::time::timeout(Duration::from_secs(5), self.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed while waiting for frame")
    }
}

pub async fn start_server(handler: Arc<dyn Handler>) -> (Arc<Server>, SocketAddr) {
    start_server_with(handler, |_| {}).await
}

pub async fn start_server_with(
    handler: Arc<dyn Handler>,
    configure: impl FnOnce(&mut ServerBinding),
) -> (Arc<Server>, SocketAddr) {
    let mut binding = ServerBinding::new("127.0.0.1:0", handler);
    configure(&mut binding);
    let server = Arc::new(Server::new(vec![binding]));
    let addrs = server.listen().await.expect("listen");
    let bg = server.clone();
    tokio::spawn(async move {
        let _ = bg.serve().await;
    });
    (server, addrs[0])
}
