// multi-client connection manager: the accept loop and the id->Connection
// table every accepted socket is dispatched through.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{info, instrument, warn};

use super::connection::Connection;
use crate::codec::{self, Frame, FrameKind, Line};
use crate::config::ServerConfig;
use crate::error::Result;

// how often client_conn/wait_all re-check for a not-yet-present id
const EXISTENCE_POLL: Duration = Duration::from_millis(500);

pub struct Server {
    config: ServerConfig,
    connections: Mutex<HashMap<Vec<u8>, Arc<Connection>>>,
    expected: Mutex<HashSet<Vec<u8>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Server {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let expected = config.expected_ids.iter().cloned().collect();
        Arc::new(Self {
            config,
            connections: Mutex::new(HashMap::new()),
            expected: Mutex::new(expected),
            accept_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    // binds the listening socket and begins accepting clients in the
    // background; returns the bound address once listening. port: 0 binds
    // an ephemeral port, which this return value makes discoverable
    pub async fn run(self: &Arc<Self>) -> Result<std::net::SocketAddr> {
        let addr = (self.config.bind_address.as_str(), self.config.port);
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(port = local_addr.port(), "listening for clients");
        let server = self.clone();
        let handle = tokio::spawn(async move {
            server.accept_loop(listener).await;
        });
        *self.accept_task.lock().await = Some(handle);
        Ok(local_addr)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_new_socket(stream, addr).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    #[instrument(skip(self, stream))]
    async fn handle_new_socket(self: Arc<Self>, mut stream: TcpStream, addr: std::net::SocketAddr) {
        let handshake = match timeout(self.config.timeout, codec::read_line(&mut stream)).await {
            Ok(Ok(Line::Frame(frame))) if matches!(frame.kind, FrameKind::Handshake) => frame,
            Ok(Ok(_)) => {
                warn!(%addr, "first line from new socket was not a handshake; closing");
                return;
            }
            Ok(Err(e)) => {
                warn!(%addr, error = %e, "failed to read handshake; closing");
                return;
            }
            Err(_elapsed) => {
                warn!(%addr, "handshake timed out; closing");
                return;
            }
        };

        let id = client_id_from_body(&handshake.body);
        info!(%addr, client = %String::from_utf8_lossy(&id), "handshake received");

        if let Ok(ack) = Frame::ack(handshake.mid).encode() {
            if stream.write_all(&ack).await.is_err() {
                return;
            }
        }

        let (read_half, write_half) = stream.into_split();

        let mut conns = self.connections.lock().await;
        match conns.get(&id) {
            Some(existing) if existing.status() => {
                warn!(client = %String::from_utf8_lossy(&id), "duplicate client rejected");
                // Dropping `write_half`/`read_half` closes the new socket.
            }
            Some(existing) => {
                existing.rebind(write_half, read_half).await;
            }
            None => {
                let was_expected = self.expected.lock().await.remove(&id);
                if !was_expected {
                    warn!(client = %String::from_utf8_lossy(&id), "unknown client has connected");
                }
                let conn = Connection::new(id.clone(), &self.config, write_half, read_half).await;
                conns.insert(id, conn);
            }
        }
    }

    // pauses until a Connection for id exists and has settled into Active
    pub async fn client_conn(&self, id: &[u8]) -> Arc<Connection> {
        loop {
            if let Some(conn) = self.connections.lock().await.get(id).cloned() {
                conn.await_active().await;
                return conn;
            }
            sleep(EXISTENCE_POLL).await;
        }
    }

    // pauses until a Connection exists for every id in ids (existence only,
    // not necessarily Active)
    pub async fn wait_all(&self, ids: &[Vec<u8>]) {
        loop {
            let conns = self.connections.lock().await;
            if ids.iter().all(|id| conns.contains_key(id.as_slice())) {
                return;
            }
            drop(conns);
            sleep(EXISTENCE_POLL).await;
        }
    }

    // idempotent
    pub async fn close_all(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.accept_task.lock().await.take() {
            handle.abort();
        }
        let conns: Vec<_> = self.connections.lock().await.values().cloned().collect();
        for conn in conns {
            conn.close().await;
        }
    }
}

// strips the trailing \n the handshake body is guaranteed to carry
fn client_id_from_body(body: &[u8]) -> Vec<u8> {
    let mut id = body.to_vec();
    if id.last() == Some(&b'\n') {
        id.pop();
    }
    id
}
