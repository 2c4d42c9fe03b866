//! Periodic re-announcement of every stored record.
//!
//! Items on the mainline DHT expire after a few hours, so each stored record is put
//! again on a schedule to keep it resolvable through the network.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use snafu::{ResultExt, Snafu};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    dht::Dht,
    metrics::Metrics,
    propagate::{DEFAULT_PROPAGATE_CONCURRENCY, DEFAULT_PROPAGATE_TIMEOUT},
    record::NetworkPutItem,
    scheduler::PeriodicTask,
    store::{DEFAULT_PAGE_SIZE, RecordStore, StoreError},
};

/// Default schedule for republishing, every three hours on the hour.
pub const DEFAULT_REPUBLISH_SCHEDULE: &str = "0 */3 * * *";

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[non_exhaustive]
pub enum RepublishError {
    #[snafu(display("failed to list stored records"))]
    List { source: StoreError },
}

/// Outcome of one republish pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepublishReport {
    /// Records put successfully.
    pub success: usize,
    /// Records whose put failed.
    pub errors: usize,
    /// Pages read from the store.
    pub pages: usize,
    /// Whether the pass stopped before reaching the end of the store.
    pub cancelled: bool,
}

/// Puts every stored record back onto the DHT.
#[derive(Debug)]
pub struct Republisher {
    store: Arc<dyn RecordStore>,
    dht: Arc<dyn Dht>,
    metrics: Arc<Metrics>,
    page_size: usize,
    concurrency: usize,
    timeout: Duration,
}

impl Republisher {
    pub fn new(store: Arc<dyn RecordStore>, dht: Arc<dyn Dht>, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            dht,
            metrics,
            page_size: DEFAULT_PAGE_SIZE,
            concurrency: DEFAULT_PROPAGATE_CONCURRENCY,
            timeout: DEFAULT_PROPAGATE_TIMEOUT,
        }
    }

    /// Set the number of records read from the store at once.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Set how many puts run at once and how long a single put may take.
    pub fn with_puts(mut self, concurrency: usize, timeout: Duration) -> Self {
        self.concurrency = concurrency.max(1);
        self.timeout = timeout;
        self
    }

    /// Run one full pass over the store.
    ///
    /// Failed puts are counted and skipped. A failure to list records aborts the pass.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<RepublishReport, RepublishError> {
        let mut report = RepublishReport::default();
        let mut cursor = None;
        loop {
            if cancel.is_cancelled() {
                debug!("republish cancelled");
                report.cancelled = true;
                break;
            }
            let page = self
                .store
                .list_records(cursor, self.page_size)
                .await
                .context(ListSnafu)?;
            report.pages += 1;
            if page.records.is_empty() {
                break;
            }
            let items = page.records.iter().map(|r| r.to_network_item());
            self.put_all(items, &mut report, cancel).await;
            if cancel.is_cancelled() {
                debug!("republish cancelled");
                report.cancelled = true;
                break;
            }
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(report)
    }

    async fn put_all(
        &self,
        items: impl Iterator<Item = NetworkPutItem>,
        report: &mut RepublishReport,
        cancel: &CancellationToken,
    ) {
        let mut tasks = JoinSet::new();
        for item in items {
            if cancel.is_cancelled() {
                break;
            }
            while tasks.len() >= self.concurrency {
                if let Some(res) = tasks.join_next().await {
                    self.tally(res, report);
                }
            }
            let dht = self.dht.clone();
            let timeout = self.timeout;
            tasks.spawn(async move {
                let key = item.key;
                match tokio::time::timeout(timeout, dht.put(item)).await {
                    Ok(Ok(_)) => true,
                    Ok(Err(err)) => {
                        warn!(%key, "failed to republish record: {err:#}");
                        false
                    }
                    Err(_) => {
                        warn!(%key, "republishing record timed out");
                        false
                    }
                }
            });
        }
        while let Some(res) = tasks.join_next().await {
            self.tally(res, report);
        }
    }

    fn tally(&self, res: Result<bool, tokio::task::JoinError>, report: &mut RepublishReport) {
        match res {
            Ok(true) => {
                report.success += 1;
                self.metrics.republish_success.inc();
            }
            Ok(false) => {
                report.errors += 1;
                self.metrics.republish_error.inc();
            }
            Err(err) => {
                report.errors += 1;
                self.metrics.republish_error.inc();
                warn!(?err, "republish worker panicked");
            }
        }
    }
}

#[async_trait]
impl PeriodicTask for Republisher {
    fn name(&self) -> &str {
        "republish"
    }

    async fn run(&self, cancel: CancellationToken) {
        info!("republishing stored records");
        match self.run_once(&cancel).await {
            Ok(report) if report.cancelled => info!(
                success = report.success,
                errors = report.errors,
                "republish cancelled"
            ),
            Ok(report) => {
                self.metrics.republish_runs.inc();
                info!(
                    success = report.success,
                    errors = report.errors,
                    "republished stored records"
                );
            }
            Err(err) => warn!("republish aborted: {err:#}"),
        }
    }
}
