//! Background announcement of freshly published records.
//!
//! Puts run on tasks owned by the [`Propagator`], never on the task that handled the
//! publish request, so a finished or cancelled request does not abort the announcement.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::{dht::Dht, metrics::Metrics, record::NetworkPutItem};

/// Default number of concurrent DHT puts.
pub const DEFAULT_PROPAGATE_CONCURRENCY: usize = 16;
/// Default upper bound for a single background put.
pub const DEFAULT_PROPAGATE_TIMEOUT: Duration = Duration::from_secs(60);
/// Default number of items waiting for a worker.
pub const DEFAULT_PROPAGATE_QUEUE: usize = 1024;

/// Sizing of the [`Propagator`].
#[derive(Debug, Clone, Copy)]
pub struct PropagateOptions {
    /// Number of puts in flight at once.
    pub concurrency: usize,
    /// Number of items waiting for a worker. Items beyond this are dropped.
    pub capacity: usize,
    /// Upper bound for a single put.
    pub timeout: Duration,
}

impl Default for PropagateOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_PROPAGATE_CONCURRENCY,
            capacity: DEFAULT_PROPAGATE_QUEUE,
            timeout: DEFAULT_PROPAGATE_TIMEOUT,
        }
    }
}

/// A bounded pool of workers announcing records to the DHT.
///
/// When the queue is full new items are dropped and counted. The republish job puts
/// them later.
#[derive(Debug)]
pub struct Propagator {
    tx: mpsc::Sender<NetworkPutItem>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Propagator {
    /// Spawn the dispatcher task.
    pub fn spawn(dht: Arc<dyn Dht>, metrics: Arc<Metrics>, options: PropagateOptions) -> Self {
        let (tx, rx) = mpsc::channel(options.capacity.max(1));
        let cancel = CancellationToken::new();
        let task = tokio::task::spawn(
            dispatch(
                rx,
                dht,
                metrics.clone(),
                options.concurrency.max(1),
                options.timeout,
                cancel.clone(),
            )
            .instrument(info_span!("propagate")),
        );
        Self {
            tx,
            metrics,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Queue an item for announcement. Returns immediately.
    ///
    /// Returns `false` if the item was dropped.
    pub fn submit(&self, item: NetworkPutItem) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(item)) => {
                self.metrics.propagate_dropped.inc();
                warn!(key = %item.key, "propagation queue is full, record left for republish");
                false
            }
            Err(TrySendError::Closed(item)) => {
                self.metrics.propagate_dropped.inc();
                warn!(key = %item.key, "propagation is shut down, record left for republish");
                false
            }
        }
    }

    /// Stop accepting items, finish the queued ones and wait for all workers.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(?err, "propagation task failed");
            }
        }
    }
}

async fn dispatch(
    mut rx: mpsc::Receiver<NetworkPutItem>,
    dht: Arc<dyn Dht>,
    metrics: Arc<Metrics>,
    concurrency: usize,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let mut tasks = JoinSet::new();
    let mut closed = false;
    loop {
        let item = tokio::select! {
            item = rx.recv() => item,
            _ = cancel.cancelled(), if !closed => {
                debug!("draining propagation queue");
                rx.close();
                closed = true;
                continue;
            }
            Some(res) = tasks.join_next(), if !tasks.is_empty() => {
                log_join(res);
                continue;
            }
        };
        let Some(item) = item else {
            break;
        };
        while tasks.len() >= concurrency {
            if let Some(res) = tasks.join_next().await {
                log_join(res);
            }
        }
        tasks.spawn(put(dht.clone(), metrics.clone(), item, timeout));
    }
    while let Some(res) = tasks.join_next().await {
        log_join(res);
    }
    debug!("propagation stopped");
}

async fn put(dht: Arc<dyn Dht>, metrics: Arc<Metrics>, item: NetworkPutItem, timeout: Duration) {
    let key = item.key;
    match tokio::time::timeout(timeout, dht.put(item)).await {
        Ok(Ok(receipt)) => {
            metrics.propagate_success.inc();
            debug!(id = %receipt.id, "record propagated");
        }
        Ok(Err(err)) => {
            metrics.propagate_error.inc();
            warn!(%key, "failed to propagate record: {err:#}");
        }
        Err(_) => {
            metrics.propagate_error.inc();
            warn!(%key, ?timeout, "propagating record timed out");
        }
    }
}

fn log_join(res: Result<(), tokio::task::JoinError>) {
    if let Err(err) = res {
        warn!(?err, "propagation worker panicked");
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        dht::MemoryDht,
        record::{Record, tests::signing_key},
    };

    fn options(concurrency: usize, capacity: usize) -> PropagateOptions {
        PropagateOptions {
            concurrency,
            capacity,
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn shutdown_drains_queue() {
        let dht = Arc::new(MemoryDht::default());
        let metrics = Arc::new(Metrics::default());
        let propagator = Propagator::spawn(dht.clone(), metrics.clone(), options(2, 64));
        for _ in 0..20 {
            let record = Record::new_signed(&signing_key(), "value", 1);
            assert!(propagator.submit(record.to_network_item()));
        }
        propagator.shutdown().await;
        assert_eq!(dht.len(), 20);
        assert_eq!(metrics.propagate_success.get(), 20);

        // submitting after shutdown is refused
        let record = Record::new_signed(&signing_key(), "late", 1);
        assert!(!propagator.submit(record.to_network_item()));
        assert_eq!(dht.put_count(), 20);
        assert_eq!(metrics.propagate_dropped.get(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn failures_are_counted() {
        let dht = Arc::new(MemoryDht::default());
        dht.set_fail_puts(true);
        let metrics = Arc::new(Metrics::default());
        let propagator = Propagator::spawn(dht.clone(), metrics.clone(), options(4, 64));
        for _ in 0..3 {
            let record = Record::new_signed(&signing_key(), "value", 1);
            propagator.submit(record.to_network_item());
        }
        propagator.shutdown().await;
        assert_eq!(metrics.propagate_error.get(), 3);
        assert!(dht.is_empty());
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn full_queue_drops_items() {
        let dht = Arc::new(MemoryDht::default());
        dht.set_put_delay(Duration::from_secs(3));
        let metrics = Arc::new(Metrics::default());
        let propagator = Propagator::spawn(dht.clone(), metrics.clone(), options(1, 2));

        // the dispatcher does not run between these submits, so only the queue absorbs items
        let accepted = (0..10)
            .filter(|_| {
                let record = Record::new_signed(&signing_key(), "value", 1);
                propagator.submit(record.to_network_item())
            })
            .count();
        assert_eq!(accepted, 2);
        assert_eq!(metrics.propagate_dropped.get(), 8);

        propagator.shutdown().await;
        assert_eq!(dht.len(), 2);
        assert_eq!(metrics.propagate_success.get(), 2);
    }
}
