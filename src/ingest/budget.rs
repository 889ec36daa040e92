use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::error::{IngestError, Result};
use crate::utils::format_size;

/// Scratch-space admission control shared by the archiver workers.
///
/// `available + reserved == capacity` holds at all times; `available`
/// never goes below zero.
#[derive(Debug)]
pub struct DiskBudget {
    capacity: u64,
    available: Mutex<u64>,
    released: Notify,
}

impl DiskBudget {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            available: Mutex::new(capacity),
            released: Notify::new(),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn available(&self) -> u64 {
        *self.available.lock()
    }

    pub fn reserved(&self) -> u64 {
        self.capacity - self.available()
    }

    /// Takes `bytes` if they are free. Never blocks.
    pub fn reserve(&self, bytes: u64) -> bool {
        let mut available = self.available.lock();
        if *available >= bytes {
            *available -= bytes;
            true
        } else {
            false
        }
    }

    /// Takes up to `bytes` for an archive that already exists on disk,
    /// returning how much was actually reserved.
    pub fn adopt(&self, bytes: u64) -> u64 {
        let mut available = self.available.lock();
        let taken = bytes.min(*available);
        *available -= taken;
        taken
    }

    pub fn release(&self, bytes: u64) {
        {
            let mut available = self.available.lock();
            debug_assert!(*available + bytes <= self.capacity, "released more than reserved");
            *available = (*available + bytes).min(self.capacity);
        }
        self.released.notify_waiters();
    }

    /// Wakes every waiter so it can notice cancellation.
    pub fn wake_all(&self) {
        self.released.notify_waiters();
    }

    /// Reserves `bytes`, waiting for releases (or the poll interval) while
    /// there is not enough room.
    pub async fn reserve_waiting(
        &self,
        label: &str,
        bytes: u64,
        poll: Duration,
        worker: usize,
        cancel: &AtomicBool,
    ) -> Result<()> {
        if bytes > self.capacity {
            return Err(IngestError::Capacity {
                label: label.to_string(),
                size: bytes,
                limit: self.capacity,
                limit_name: "scratch capacity",
            });
        }

        let mut attempts = 0u32;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.reserve(bytes) {
                debug!(worker, label, bytes, "Reserved scratch space");
                return Ok(());
            }
            if cancel.load(Ordering::SeqCst) {
                return Err(IngestError::Cancelled);
            }

            attempts += 1;
            info!(
                worker,
                label,
                attempt = attempts,
                "Waiting for {} of scratch space ({} free)",
                format_size(bytes),
                format_size(self.available())
            );
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }
}
