// long-lived engine that repeatedly cycles Disconnected -> Connecting ->
// HandshakeSent -> Active -> Failing -> Disconnected until close()d.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument, warn};

use crate::codec::{self, Frame, FrameKind, Line, MAX_BODY_LEN, MAX_HEADER_LEN};
use crate::config::ClientConfig;
use crate::error::{LinkError, Result};
use crate::line_queue::{self, InboundLine, LineReceiver, LineSender};
use crate::mid::{DedupWindow, Mid, MidGenerator};
use crate::pending_acks::PendingAcks;
use crate::state::ConnectionState;

struct WriterSlot {
    half: Option<OwnedWriteHalf>,
    last_tx: Instant,
}

struct Shared {
    config: ClientConfig,
    state: watch::Sender<ConnectionState>,
    writer: Mutex<WriterSlot>,
    // Serializes the whole check-empty/claim-mid/send sequence of a
    // qos+wait write so two concurrent callers can't interleave and land
    // on the wire out of order. pending_acks stays lock-free on its own.
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

// one client node's connection to the server; owns the socket while
// connected and outlives any number of reconnects
pub struct ClientEngine {
    shared: Arc<Shared>,
    run_task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientEngine {
    pub fn new(config: ClientConfig) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (inbox_tx, inbox_rx) = line_queue::channel();
        let shared = Arc::new(Shared {
            config,
            state: state_tx,
            writer: Mutex::new(WriterSlot {
                half: None,
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
        let run_handle = tokio::spawn(run(shared.clone()));
        Arc::new(Self {
            shared,
            run_task: Mutex::new(Some(run_handle)),
        })
    }

    // waits for the next Active transition; safe to call again after an
    // outage, it just pauses until the next reconnect lands
    pub async fn await_connected(&self) {
        let _ = wait_active(&self.shared).await;
    }

    pub fn status(&self) -> bool {
        *self.shared.state.borrow() == ConnectionState::Active
    }

    pub fn connects(&self) -> u64 {
        self.shared.connects.load(Ordering::Relaxed)
    }

    // pauses until a non-keepalive, non-duplicate Data frame arrives; None
    // only once the engine is closed for good
    pub async fn read_line(&self) -> Option<InboundLine> {
        self.shared.inbox_rx.lock().await.recv().await
    }

    #[instrument(skip(self, body, header), fields(qos, wait))]
    pub async fn write(
        &self,
        body: Vec<u8>,
        header: Option<Vec<u8>>,
        qos: bool,
        wait: bool,
    ) -> Result<()> {
        if body.len() > MAX_BODY_LEN {
            return Err(LinkError::ValueTooLarge);
        }
        if header.as_ref().is_some_and(|h| h.len() > MAX_HEADER_LEN) {
            return Err(LinkError::ValueTooLarge);
        }

        // Held from before the empty-check through the initial send so two
        // concurrent qos+wait writers can't both see pending_acks empty and
        // then race the mid claim / send: whoever takes the lock first is
        // fully on the wire before the next one even checks.
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
        send_frame(&self.shared, &frame).await?;
        drop(order_guard);

        if qos {
            loop {
                if self.shared.closed.load(Ordering::Acquire) {
                    return Err(LinkError::PeerDisconnect);
                }
                match timeout(
                    self.shared.config.timeout,
                    self.shared.pending_acks.await_not_contains(mid_byte),
                )
                .await
                {
                    Ok(()) => return Ok(()),
                    Err(_elapsed) => {
                        debug!(mid = mid_byte, "qos retry: re-sending unacked frame");
                        send_frame(&self.shared, &frame).await?;
                    }
                }
            }
        }
        Ok(())
    }

    // idempotent
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        mark_failing(&self.shared);
        if let Some(handle) = self.run_task.lock().await.take() {
            handle.abort();
        }
        let handles: Vec<_> = self.shared.tasks.lock().await.drain(..).collect();
        for h in handles {
            h.abort();
        }
        self.shared.writer.lock().await.half = None;
    }
}

async fn run(shared: Arc<Shared>) {
    if let Err(e) = check_wifi(&shared).await {
        warn!(error = %e, "no initial wifi link; engine gives up");
        return;
    }

    let mut first_attempt = true;
    loop {
        if shared.closed.load(Ordering::Acquire) {
            return;
        }
        let _ = shared.state.send_replace(ConnectionState::Connecting);
        let addr = (shared.config.server_address.as_str(), shared.config.server_port);
        let this_attempt_was_first = first_attempt;
        first_attempt = false;
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                run_session(&shared, stream).await;
            }
            Err(e) => {
                warn!(error = %e, "tcp connect failed");
                if this_attempt_was_first {
                    if let Err(e) = check_bad_server(&shared).await {
                        warn!(error = %e, "no initial server connection; engine gives up");
                        return;
                    }
                }
            }
        }
        if shared.closed.load(Ordering::Acquire) {
            return;
        }
        sleep(Duration::from_millis(200)).await;
    }
}

#[instrument(skip(shared, stream))]
async fn run_session(shared: &Arc<Shared>, stream: TcpStream) {
    let (read_half, write_half) = stream.into_split();
    {
        let mut w = shared.writer.lock().await;
        w.half = Some(write_half);
        w.last_tx = Instant::now();
    }
    let _ = shared.state.send_replace(ConnectionState::HandshakeSent);

    let first_session = !shared.ever_active.load(Ordering::Acquire);
    let reader_handle = tokio::spawn(reader_task(shared.clone(), read_half, first_session));
    // Give the peer a moment to be listening before the handshake lands.
    sleep(Duration::from_millis(50)).await;

    match Frame::handshake(&shared.config.client_id).encode() {
        Ok(bytes) => {
            if let Err(e) = send_raw(shared, &bytes).await {
                warn!(error = %e, "failed to send handshake");
                mark_failing(shared);
            }
        }
        Err(e) => {
            warn!(error = %e, "failed to encode handshake");
            mark_failing(shared);
        }
    }

    let ka_handle = tokio::spawn(keepalive_task(shared.clone()));
    {
        let mut tasks = shared.tasks.lock().await;
        *tasks = vec![reader_handle, ka_handle];
    }

    let mut state_rx = shared.state.subscribe();
    loop {
        if *state_rx.borrow() == ConnectionState::Failing || shared.closed.load(Ordering::Acquire) {
            break;
        }
        if state_rx.changed().await.is_err() {
            break;
        }
    }

    let handles: Vec<_> = shared.tasks.lock().await.drain(..).collect();
    for h in handles {
        h.abort();
    }
    shared.writer.lock().await.half = None;

    if let Some(cb) = &shared.config.connected_callback {
        cb(false);
    }
    info!("session ended, entering outage-detection pause");

    if !shared.closed.load(Ordering::Acquire) {
        // Let the peer's own inactivity deadline notice we're gone before we
        // try to come back.
        sleep(shared.config.timeout * 2).await;
    }
    let _ = shared.state.send_replace(ConnectionState::Disconnected);
}

async fn reader_task(shared: Arc<Shared>, mut read_half: OwnedReadHalf, first_session: bool) {
    let inactivity = if first_session {
        shared.config.timeout * 2
    } else {
        shared.config.timeout
    };
    loop {
        match timeout(inactivity, codec::read_line(&mut read_half)).await {
            Ok(Ok(Line::Keepalive)) => {
                mark_active(&shared);
            }
            Ok(Ok(Line::Frame(frame))) => {
                mark_active(&shared);
                if let Err(e) = handle_frame(&shared, frame).await {
                    warn!(error = %e, "fatal error handling inbound frame");
                    mark_failing(&shared);
                    return;
                }
            }
            Ok(Err(LinkError::MalformedFrame(reason))) => {
                warn!(reason, "dropped malformed frame, continuing");
            }
            Ok(Err(e)) => {
                warn!(error = %e, "reader failed");
                mark_failing(&shared);
                return;
            }
            Err(_elapsed) => {
                warn!("read inactivity deadline exceeded");
                mark_failing(&shared);
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
            // The server never re-sends a handshake at us; tolerate it.
        }
        FrameKind::Data { ack_requested } => {
            let mid = Mid::from_byte(frame.mid);
            let is_new = shared.dedup.lock().await.is_new(mid);
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
    let interval = shared.config.keepalive_interval();
    loop {
        let due_in = {
            let w = shared.writer.lock().await;
            interval.saturating_sub(w.last_tx.elapsed())
        };
        if due_in.is_zero() {
            if let Err(e) = send_raw(&shared, b"\n").await {
                warn!(error = %e, "keepalive send failed");
                mark_failing(&shared);
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
            if start.elapsed() > shared.config.timeout {
                return Err(LinkError::Timeout("partial write budget"));
            }
            sleep(Duration::from_millis(20)).await;
        }
    }
    guard.last_tx = Instant::now();
    Ok(())
}

// waits for (and retries across) reconnects until frame gets onto the wire
// once; only returns Err once the engine has been closed
async fn send_frame(shared: &Arc<Shared>, frame: &Frame) -> Result<()> {
    let bytes = frame.encode()?;
    loop {
        wait_active(shared).await?;
        match send_raw(shared, &bytes).await {
            Ok(()) => return Ok(()),
            Err(_) => {
                mark_failing(shared);
                if shared.closed.load(Ordering::Acquire) {
                    return Err(LinkError::PeerDisconnect);
                }
            }
        }
    }
}

// waits for either Active or a close(), re-checking at least every 100ms
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

fn mark_active(shared: &Shared) {
    let became_active = shared
        .state
        .send_if_modified(|s| {
            if *s != ConnectionState::Active {
                *s = ConnectionState::Active;
                true
            } else {
                false
            }
        });
    if became_active {
        shared.ever_active.store(true, Ordering::Release);
        shared.connects.fetch_add(1, Ordering::Relaxed);
        debug!(connects = shared.connects.load(Ordering::Relaxed), "entered Active");
        if let Some(cb) = &shared.config.connected_callback {
            cb(true);
        }
    }
}

fn mark_failing(shared: &Shared) {
    shared.state.send_if_modified(|s| {
        if *s != ConnectionState::Failing {
            *s = ConnectionState::Failing;
            true
        } else {
            false
        }
    });
}

async fn check_wifi(shared: &Shared) -> Result<()> {
    if let Some(hook) = &shared.config.bad_wifi {
        return hook().await;
    }
    if shared.config.ssid.is_none() {
        return Err(LinkError::NoInitialWifi);
    }
    Ok(())
}

async fn check_bad_server(shared: &Shared) -> Result<()> {
    match &shared.config.bad_server {
        Some(hook) => hook().await,
        None => Err(LinkError::NoInitialServer),
    }
}
