// a full queue means the application isn't consuming fast enough; this
// fails the connection instead of silently dropping the line.

use crate::error::{LinkError, Result};
use tokio::sync::mpsc;

pub const CAPACITY: usize = 20;

#[derive(Debug, Clone)]
pub struct InboundLine {
    pub header: Option<Vec<u8>>,
    pub body: Vec<u8>,
}

pub fn channel() -> (LineSender, LineReceiver) {
    let (tx, rx) = mpsc::channel(CAPACITY);
    (LineSender { tx }, LineReceiver { rx })
}

#[derive(Debug, Clone)]
pub struct LineSender {
    tx: mpsc::Sender<InboundLine>,
}

impl LineSender {
    // caller (the reader task) must treat QueueOverflow as fatal to the session
    pub fn push(&self, line: InboundLine) -> Result<()> {
        self.tx
            .try_send(line)
            .map_err(|_| LinkError::QueueOverflow)
    }
}

#[derive(Debug)]
pub struct LineReceiver {
    rx: mpsc::Receiver<InboundLine>,
}

impl LineReceiver {
    // returns None once every LineSender has been dropped for good
    pub async fn recv(&mut self) -> Option<InboundLine> {
        self.rx.recv().await
    }
}
