// set of mids awaiting an ack. writer side adds, reader task discards, so
// the bitmap uses atomics instead of a lock.

use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::Notify;

#[derive(Debug)]
pub struct PendingAcks {
    bits: [AtomicU8; 32],
    became_empty: Notify,
    discarded: Notify,
}

impl Default for PendingAcks {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingAcks {
    pub fn new() -> Self {
        Self {
            bits: std::array::from_fn(|_| AtomicU8::new(0)),
            became_empty: Notify::new(),
            discarded: Notify::new(),
        }
    }

    pub fn contains(&self, mid: u8) -> bool {
        self.bits[(mid >> 3) as usize].load(Ordering::Acquire) & (1 << (mid & 7)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|b| b.load(Ordering::Acquire) == 0)
    }

    pub fn add(&self, mid: u8) {
        self.bits[(mid >> 3) as usize].fetch_or(1 << (mid & 7), Ordering::AcqRel);
    }

    pub fn discard(&self, mid: u8) {
        self.bits[(mid >> 3) as usize].fetch_and(!(1 << (mid & 7)), Ordering::AcqRel);
        self.discarded.notify_waiters();
        if self.is_empty() {
            self.became_empty.notify_waiters();
        }
    }

    // re-checks after registering interest so a racing discard isn't missed
    pub async fn await_empty(&self) {
        loop {
            if self.is_empty() {
                return;
            }
            let notified = self.became_empty.notified();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    pub async fn await_not_contains(&self, mid: u8) {
        loop {
            if !self.contains(mid) {
                return;
            }
            let notified = self.discarded.notified();
            if !self.contains(mid) {
                return;
            }
            notified.await;
        }
    }
}
