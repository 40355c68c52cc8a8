//! Hand-off from the MQTT delivery thread to the storage workers.
//!
//! [`Dispatcher::submit`] never blocks and never drops a message: each shard is
//! an unbounded channel, and the shard is picked by hashing the device id so a
//! single worker stores one device's messages in delivery order.

use crate::db::store_telemetry;
use crate::errors::{Error, Result};
use crate::metrics::{
    DISPATCHED_TOTAL, DISPATCH_PENDING, STORED_TOTAL, STORE_FAILURES_TOTAL, STORE_LATENCY_SECONDS,
};
use crate::model::TelemetryRecord;
use sqlx::PgPool;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    /// `None` once shutdown has begun.
    shards: Mutex<Option<Vec<mpsc::UnboundedSender<TelemetryRecord>>>>,
    pending: AtomicUsize,
    high_watermark: usize,
}

impl Dispatcher {
    /// Creates a dispatcher with `shards` queues and returns their receivers.
    pub fn new(
        shards: usize,
        high_watermark: usize,
    ) -> (Self, Vec<mpsc::UnboundedReceiver<TelemetryRecord>>) {
        let (senders, receivers) = (0..shards.max(1)).map(|_| mpsc::unbounded_channel()).unzip();
        let dispatcher = Self {
            inner: Arc::new(Inner {
                shards: Mutex::new(Some(senders)),
                pending: AtomicUsize::new(0),
                high_watermark,
            }),
        };
        (dispatcher, receivers)
    }

    /// Queues a record for storage. Safe to call from any thread.
    pub fn submit(&self, record: TelemetryRecord) -> Result<()> {
        let guard = self
            .inner
            .shards
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let shards = guard.as_ref().ok_or(Error::ShuttingDown)?;

        let shard = &shards[shard_for(&record.device_id, shards.len())];
        // Count first so a fast worker never decrements below zero
        let pending = self.inner.pending.fetch_add(1, Ordering::SeqCst) + 1;
        if shard.send(record).is_err() {
            self.inner.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::ShuttingDown);
        }

        DISPATCHED_TOTAL.inc();
        DISPATCH_PENDING.set(pending as i64);
        if pending == self.inner.high_watermark {
            warn!(
                "Dispatch backlog reached {} pending messages; storage is falling behind",
                pending
            );
        }
        Ok(())
    }

    /// Stops accepting new records. Queued records are still drained.
    pub fn close(&self) {
        let closed = self
            .inner
            .shards
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if closed.is_some() {
            info!("Dispatcher closed, {} messages pending", self.pending());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .shards
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    fn complete(&self) {
        let pending = self.inner.pending.fetch_sub(1, Ordering::SeqCst) - 1;
        DISPATCH_PENDING.set(pending as i64);
    }
}

fn shard_for(device_id: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    device_id.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

/// Storage workers draining the dispatcher's shards.
pub struct Workers {
    handles: Vec<JoinHandle<()>>,
}

impl Workers {
    pub fn spawn(
        dispatcher: &Dispatcher,
        receivers: Vec<mpsc::UnboundedReceiver<TelemetryRecord>>,
        pool: PgPool,
    ) -> Self {
        info!("Starting {} storage workers", receivers.len());
        let handles = receivers
            .into_iter()
            .enumerate()
            .map(|(id, rx)| tokio::spawn(run_worker(id, rx, pool.clone(), dispatcher.clone())))
            .collect();
        Self { handles }
    }

    /// Waits for every worker to finish its queue. The dispatcher must be
    /// closed first. With no `timeout` this waits for the whole backlog;
    /// otherwise returns `false` if the bound elapsed first.
    pub async fn drain(self, timeout: Option<Duration>) -> bool {
        let all = async {
            for handle in self.handles {
                if let Err(e) = handle.await {
                    error!("Storage worker panicked: {}", e);
                }
            }
        };
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, all).await.is_ok(),
            None => {
                all.await;
                true
            }
        }
    }
}

async fn run_worker(
    id: usize,
    mut rx: mpsc::UnboundedReceiver<TelemetryRecord>,
    pool: PgPool,
    dispatcher: Dispatcher,
) {
    debug!("Storage worker {} started", id);

    while let Some(record) = rx.recv().await {
        let start = Instant::now();
        match store_telemetry(&pool, &record).await {
            Ok(row_id) => {
                STORE_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
                STORED_TOTAL.inc();
                debug!(
                    "Stored telemetry for device {} (row {}, ts {})",
                    record.device_id, row_id, record.timestamp
                );
            }
            Err(e) => {
                STORE_FAILURES_TOTAL.inc();
                error!(
                    "Failed to store telemetry for device {} (ts {}): {}",
                    record.device_id, record.timestamp, e
                );
            }
        }
        dispatcher.complete();
    }

    info!("Storage worker {} drained", id);
}
