// server-side mirror of the client engine, one per known client id. persists
// across client outages (only its socket is replaced on reconnect), spawning
// its own reader/keepalive tasks per live socket and gating outbound
// application data behind a short settling delay so the reconnecting client
// has time to start its own reader.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, instrument, warn};

use crate::codec::{self, Frame, FrameKind, Line, MAX_BODY_LEN, MAX_HEADER_LEN};
use crate::config::{ConnectedCallback, ServerConfig};
use crate::error::{LinkError, Result};
use crate::line_queue::{self, InboundLine, LineReceiver, LineSender};
use crate::mid::{DedupWindow, Mid, MidGenerator};
use crate::pending_acks::PendingAcks;
use crate::state::ConnectionState;

// delay after a handshake before the connection is considered settled enough
// to carry application data; keepalives and acks are not subject to this gate
const SETTLE_DELAY: Duration = Duration::from_millis(200);

struct WriterSlot {
    half: Option<OwnedWriteHalf>,
    last_tx: Instant,
}

struct Shared {
    id: Vec<u8>,
    timeout: Duration,
    connected_callback: Option<ConnectedCallback>,
    state: watch::Sender<ConnectionState>,
    writer: Mutex<WriterSlot>,
    // Serializes check-empty/claim-mid/send for qos+wait writes; see
    // client::engine's identical field for why pending_acks alone isn't enough.
    write_order: Mutex<()>,
    pending_acks: PendingAcks,
    mid_gen: Mutex<MidGenerator>,
    dedup: Mutex<DedupWindow>,
    inbox_tx: LineSender,
    inbox_rx: Mutex<LineReceiver>,
    connects: AtomicU64,
    ever_active: AtomicBool,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

// one client's persistent server-side connection state, created on the
// client's first successful handshake and kept alive (modulo socket swaps)
// for the lifetime of the server process
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    pub(crate) async fn new(
        id: Vec<u8>,
        config: &ServerConfig,
        write_half: OwnedWriteHalf,
        read_half: OwnedReadHalf,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::HandshakeSent);
        let (inbox_tx, inbox_rx) = line_queue::channel();
        let shared = Arc::new(Shared {
            id,
            timeout: config.timeout,
            connected_callback: config.connected_callback.clone(),
            state: state_tx,
            writer: Mutex::new(WriterSlot {
                half: Some(write_half),
                last_tx: Instant::now(),
            }),
            write_order: Mutex::new(()),
            pending_acks: PendingAcks::new(),
            mid_gen: Mutex::new(MidGenerator::new()),
            dedup: Mutex::new(DedupWindow::new()),
            inbox_tx,
            inbox_rx: Mutex::new(inbox_rx),
            connects: AtomicU64::new(0),
            ever_active: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });
        spawn_session_tasks(shared.clone(), read_half).await;
        Arc::new(Self { shared })
    }

    // rebinds a fresh socket into this Connection after the client
    // reconnects; the Arc<Connection> identity never changes
    pub(crate) async fn rebind(self: &Arc<Self>, write_half: OwnedWriteHalf, read_half: OwnedReadHalf) {
        cancel_tasks(&self.shared).await;
        {
            let mut w = self.shared.writer.lock().await;
            w.half = Some(write_half);
            w.last_tx = Instant::now();
        }
        let _ = self.shared.state.send_replace(ConnectionState::HandshakeSent);
        spawn_session_tasks(self.shared.clone(), read_half).await;
    }

    pub fn id(&self) -> &[u8] {
        &self.shared.id
    }

    // true once the post-handshake settling delay has elapsed and no
    // failure has been observed since
    pub fn status(&self) -> bool {
        *self.shared.state.borrow() == ConnectionState::Active
    }

    pub fn connects(&self) -> u64 {
        self.shared.connects.load(Ordering::Relaxed)
    }

    pub(crate) async fn await_active(&self) {
        let mut rx = self.shared.state.subscribe();
        loop {
            if *rx.borrow() == ConnectionState::Active {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    // pauses until a non-keepalive, non-duplicate Data frame arrives from
    // this client; None only once the server has closed it for good
    pub async fn read_line(&self) -> Option<InboundLine> {
        self.shared.inbox_rx.lock().await.recv().await
    }

    #[instrument(skip(self, body, header), fields(client_id = %String::from_utf8_lossy(&self.shared.id)))]
    pub async fn write(&self, body: Vec<u8>, header: Option<Vec<u8>>, qos: bool, wait: bool) -> Result<()> {
        if body.len() > MAX_BODY_LEN {
            return Err(LinkError::ValueTooLarge);
        }
        if header.as_ref().is_some_and(|h| h.len() > MAX_HEADER_LEN) {
            return Err(LinkError::ValueTooLarge);
        }

        let order_guard = if qos && wait {
            Some(self.shared.write_order.lock().await)
        } else {
            None
        };

        if qos && wait {
            self.shared.pending_acks.await_empty().await;
        }

        let mid_byte = {
            let mut gen = self.shared.mid_gen.lock().await;
            gen.next().to_byte()
        };
        if qos {
            self.shared.pending_acks.add(mid_byte);
        }
        let frame = Frame::data(mid_byte, qos, header, body)?;
        send_frame_when_ready(&self.shared, &frame).await?;
        drop(order_guard);

        if qos {
            loop {
                if self.shared.closed.load(Ordering::Acquire) {
                    return Err(LinkError::PeerDisconnect);
                }
                match timeout(
                    self.shared.timeout,
                    self.shared.pending_acks.await_not_contains(mid_byte),
                )
                .await
                {
                    Ok(()) => return Ok(()),
                    Err(_elapsed) => {
                        debug!(mid = mid_byte, "qos retry: re-sending unacked frame");
                        send_frame_when_ready(&self.shared, &frame).await?;
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) async fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        cancel_tasks(&self.shared).await;
        let _ = self.shared.state.send_replace(ConnectionState::Disconnected);
        self.shared.writer.lock().await.half = None;
    }
}

async fn cancel_tasks(shared: &Arc<Shared>) {
    let handles: Vec<_> = shared.tasks.lock().await.drain(..).collect();
    for h in handles {
        h.abort();
    }
}

async fn spawn_session_tasks(shared: Arc<Shared>, read_half: OwnedReadHalf) {
    let reader = tokio::spawn(reader_task(shared.clone(), read_half));
    let ka = tokio::spawn(keepalive_task(shared.clone()));
    let settle = tokio::spawn(settle_task(shared.clone()));
    *shared.tasks.lock().await = vec![reader, ka, settle];
}

// waits out the settling delay, then flips the connection Active unless a
// failure beat it there
async fn settle_task(shared: Arc<Shared>) {
    sleep(SETTLE_DELAY).await;
    let became_active = shared.state.send_if_modified(|s| {
        if *s == ConnectionState::HandshakeSent {
            *s = ConnectionState::Active;
            true
        } else {
            false
        }
    });
    if became_active {
        shared.ever_active.store(true, Ordering::Release);
        shared.connects.fetch_add(1, Ordering::Relaxed);
        debug!(connects = shared.connects.load(Ordering::Relaxed), "client settled into Active");
        if let Some(cb) = &shared.connected_callback {
            cb(true);
        }
    }
}

async fn reader_task(shared: Arc<Shared>, mut read_half: OwnedReadHalf) {
    let first_session = !shared.ever_active.load(Ordering::Acquire);
    let inactivity = if first_session { shared.timeout * 2 } else { shared.timeout };
    loop {
        match timeout(inactivity, codec::read_line(&mut read_half)).await {
            Ok(Ok(Line::Keepalive)) => {}
            Ok(Ok(Line::Frame(frame))) => {
                if let Err(e) = handle_frame(&shared, frame).await {
                    warn!(error = %e, "fatal error handling inbound frame");
                    mark_failing(&shared, true).await;
                    return;
                }
            }
            Ok(Err(LinkError::MalformedFrame(reason))) => {
                warn!(reason, "dropped malformed frame, continuing");
            }
            Ok(Err(e)) => {
                warn!(error = %e, "reader failed");
                mark_failing(&shared, true).await;
                return;
            }
            Err(_elapsed) => {
                warn!("read inactivity deadline exceeded");
                mark_failing(&shared, true).await;
                return;
            }
        }
    }
}

async fn handle_frame(shared: &Arc<Shared>, frame: Frame) -> Result<()> {
    match frame.kind {
        FrameKind::Ack => {
            shared.pending_acks.discard(frame.mid);
        }
        FrameKind::Handshake => {
            // A client only re-sends its handshake by opening a new TCP
            // connection, which the manager routes through `rebind`, not
            // through this reader. Tolerate a stray one defensively.
        }
        FrameKind::Data { ack_requested } => {
            let mid = Mid::from_byte(frame.mid);
            let is_new = {
                let mut dedup = shared.dedup.lock().await;
                dedup.is_new(mid)
            };
            if ack_requested {
                let shared = shared.clone();
                let mid_byte = frame.mid;
                tokio::spawn(async move {
                    if let Ok(bytes) = Frame::ack(mid_byte).encode() {
                        let _ = send_raw(&shared, &bytes).await;
                    }
                });
            }
            if is_new {
                shared.inbox_tx.push(InboundLine {
                    header: frame.header,
                    body: frame.body,
                })?;
            }
        }
    }
    Ok(())
}

async fn keepalive_task(shared: Arc<Shared>) {
    let interval = shared.timeout / 4;
    loop {
        let due_in = {
            let w = shared.writer.lock().await;
            interval.saturating_sub(w.last_tx.elapsed())
        };
        if due_in.is_zero() {
            if let Err(e) = send_raw(&shared, b"\n").await {
                warn!(error = %e, "keepalive send failed");
                mark_failing(&shared, true).await;
                return;
            }
        } else {
            sleep(due_in).await;
        }
    }
}

async fn send_raw(shared: &Shared, bytes: &[u8]) -> Result<()> {
    let mut guard = shared.writer.lock().await;
    let half = guard.half.as_mut().ok_or(LinkError::PeerDisconnect)?;
    let start = Instant::now();
    let mut remaining = bytes;
    while !remaining.is_empty() {
        let n = half.write(remaining).await?;
        if n == 0 {
            return Err(LinkError::PeerDisconnect);
        }
        remaining = &remaining[n..];
        if !remaining.is_empty() {
            if start.elapsed() > shared.timeout {
                return Err(LinkError::Timeout("partial write budget"));
            }
            sleep(Duration::from_millis(20)).await;
        }
    }
    guard.last_tx = Instant::now();
    Ok(())
}

// sends application data only once the connection has settled into Active;
// a reconnecting client isn't ready to receive before its settle delay
async fn send_frame_when_ready(shared: &Arc<Shared>, frame: &Frame) -> Result<()> {
    let bytes = frame.encode()?;
    loop {
        wait_active(shared).await?;
        match send_raw(shared, &bytes).await {
            Ok(()) => return Ok(()),
            Err(_) => {
                mark_failing(shared, false).await;
                if shared.closed.load(Ordering::Acquire) {
                    return Err(LinkError::PeerDisconnect);
                }
            }
        }
    }
}

async fn wait_active(shared: &Shared) -> Result<()> {
    let mut rx = shared.state.subscribe();
    loop {
        if shared.closed.load(Ordering::Acquire) {
            return Err(LinkError::PeerDisconnect);
        }
        if *rx.borrow() == ConnectionState::Active {
            return Ok(());
        }
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    return Err(LinkError::PeerDisconnect);
                }
            }
            _ = sleep(Duration::from_millis(100)) => {}
        }
    }
}

async fn mark_failing(shared: &Arc<Shared>, invoke_callback: bool) {
    let transitioned = shared.state.send_if_modified(|s| {
        if *s != ConnectionState::Failing {
            *s = ConnectionState::Failing;
            true
        } else {
            false
        }
    });
    cancel_tasks(shared).await;
    shared.writer.lock().await.half = None;
    if transitioned && invoke_callback {
        if let Some(cb) = &shared.connected_callback {
            cb(false);
        }
    }
}
