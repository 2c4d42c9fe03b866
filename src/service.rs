//! Publishing and tiered resolution of records.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tracing::{debug, warn};

use crate::{
    cache::ResolutionCache,
    dht::Dht,
    metrics::Metrics,
    propagate::{
        DEFAULT_PROPAGATE_CONCURRENCY, DEFAULT_PROPAGATE_QUEUE, DEFAULT_PROPAGATE_TIMEOUT,
        PropagateOptions, Propagator,
    },
    record::{DEFAULT_RECORD_SIZE_LIMIT, Record, Response, ValidationError},
    store::{RecordStore, StoreError},
    util::{Identifier, IdentifierDecodeError},
};

/// Default upper bound for a DHT lookup before falling back to the store.
pub const DEFAULT_DHT_TIMEOUT: Duration = Duration::from_secs(10);

/// Options for the [`RecordService`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordsConfig {
    /// Maximum size of a record value, in bytes.
    pub max_size: usize,
    /// How long to wait for a DHT lookup.
    #[serde(with = "humantime_serde")]
    pub dht_timeout: Duration,
    /// Maximum number of concurrent background DHT puts.
    pub propagate_concurrency: usize,
    /// How long a single background DHT put may take.
    #[serde(with = "humantime_serde")]
    pub propagate_timeout: Duration,
    /// Number of records waiting for a DHT put before new ones are dropped.
    pub propagate_queue: usize,
}

impl Default for RecordsConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_RECORD_SIZE_LIMIT,
            dht_timeout: DEFAULT_DHT_TIMEOUT,
            propagate_concurrency: DEFAULT_PROPAGATE_CONCURRENCY,
            propagate_timeout: DEFAULT_PROPAGATE_TIMEOUT,
            propagate_queue: DEFAULT_PROPAGATE_QUEUE,
        }
    }
}

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[non_exhaustive]
pub enum PublishError {
    #[snafu(display("invalid identifier"))]
    IdentifierDecode { source: IdentifierDecodeError },
    #[snafu(display("invalid record"))]
    Validation { source: ValidationError },
    #[snafu(display("failed to store record"))]
    Storage { source: StoreError },
}

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[non_exhaustive]
pub enum ResolveError {
    #[snafu(display("invalid identifier"))]
    InvalidIdentifier { source: IdentifierDecodeError },
    #[snafu(display("record {id} not found"))]
    NotFound { id: Identifier },
}

/// The record relay: validates and stores published records, announces them to the
/// DHT and resolves them from the cache, the DHT or the store.
///
/// Cloning is cheap, all clones share state.
#[derive(Debug, Clone)]
pub struct RecordService(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    store: Arc<dyn RecordStore>,
    dht: Arc<dyn Dht>,
    cache: ResolutionCache,
    propagator: Propagator,
    metrics: Arc<Metrics>,
    max_size: usize,
    dht_timeout: Duration,
}

impl RecordService {
    /// Create the service and spawn its background propagation workers.
    pub fn new(
        store: Arc<dyn RecordStore>,
        dht: Arc<dyn Dht>,
        cache: ResolutionCache,
        config: &RecordsConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let options = PropagateOptions {
            concurrency: config.propagate_concurrency,
            capacity: config.propagate_queue,
            timeout: config.propagate_timeout,
        };
        let propagator = Propagator::spawn(dht.clone(), metrics.clone(), options);
        Self(Arc::new(Inner {
            store,
            dht,
            cache,
            propagator,
            metrics,
            max_size: config.max_size,
            dht_timeout: config.dht_timeout,
        }))
    }

    /// The cache used by this service.
    pub fn cache(&self) -> &ResolutionCache {
        &self.0.cache
    }

    /// Publish a request body in wire layout for `id`.
    pub async fn publish(&self, id: &Identifier, body: &[u8]) -> Result<(), PublishError> {
        let key = id.decode().context(IdentifierDecodeSnafu)?;
        let record = Record::from_request(&key, body)
            .context(ValidationSnafu)
            .inspect_err(|_| {
                self.0.metrics.publish_invalid.inc();
            })?;
        self.publish_record(id, record).await
    }

    /// Validate, store and cache `record`, then queue it for announcement on the DHT.
    ///
    /// Returns once the record is durable. The DHT put happens in the background and
    /// its outcome is only visible in logs and metrics.
    pub async fn publish_record(&self, id: &Identifier, record: Record) -> Result<(), PublishError> {
        let inner = &self.0;
        if let Err(err) = record.validate(inner.max_size) {
            inner.metrics.publish_invalid.inc();
            debug!(%id, "refusing record: {err:#}");
            return Err(err).context(ValidationSnafu);
        }

        inner
            .store
            .write_record(record.clone())
            .await
            .context(StorageSnafu)
            .inspect_err(|_| {
                inner.metrics.publish_error.inc();
            })?;

        self.cache_response(id, &record.to_response());
        inner.propagator.submit(record.to_network_item());
        inner.metrics.publish_success.inc();
        debug!(%id, seq = record.seq, "published record");
        Ok(())
    }

    /// Resolve the latest record for `id`.
    ///
    /// Tries the cache, then the DHT, then the store. A hit in the DHT or the store is
    /// written back to the cache.
    pub async fn get(&self, id: &Identifier) -> Result<Response, ResolveError> {
        let inner = &self.0;
        if let Some(response) = self.get_cached(id) {
            inner.metrics.resolve_cache_hit.inc();
            debug!(%id, "resolved record from cache");
            return Ok(response);
        }

        match tokio::time::timeout(inner.dht_timeout, inner.dht.get_full(id)).await {
            Ok(Ok(item)) => match item.to_response() {
                Ok(response) => {
                    inner.metrics.resolve_dht_hit.inc();
                    debug!(%id, "resolved record from dht");
                    self.cache_response(id, &response);
                    return Ok(response);
                }
                Err(err) => {
                    warn!(%id, "undecodable value from dht, attempting to resolve from store: {err:#}")
                }
            },
            Ok(Err(err)) => {
                warn!(%id, "failed to get record from dht, attempting to resolve from store: {err:#}")
            }
            Err(_) => {
                warn!(%id, timeout = ?inner.dht_timeout, "dht lookup timed out, attempting to resolve from store")
            }
        }

        let key = match id.to_public_key() {
            Ok(Ok(key)) => key,
            Ok(Err(err)) => {
                debug!(%id, "identifier is not a public key: {err:#}");
                return Err(self.not_found(id));
            }
            Err(err) => {
                inner.metrics.resolve_invalid_identifier.inc();
                return Err(err).context(InvalidIdentifierSnafu);
            }
        };

        match inner.store.read_record(&key).await {
            Ok(Some(record)) => {
                inner.metrics.resolve_store_hit.inc();
                debug!(%id, "resolved record from store");
                let response = record.to_response();
                self.cache_response(id, &response);
                Ok(response)
            }
            Ok(None) => Err(self.not_found(id)),
            Err(err) => {
                warn!(%id, "failed to resolve record from store: {err:#}");
                Err(self.not_found(id))
            }
        }
    }

    /// Stop accepting background work and wait for queued DHT puts to finish.
    pub async fn shutdown(&self) {
        self.0.propagator.shutdown().await;
    }

    fn get_cached(&self, id: &Identifier) -> Option<Response> {
        let bytes = self.0.cache.get(id.as_str())?;
        match Response::from_bytes(&bytes) {
            Ok(response) => Some(response),
            Err(err) => {
                debug!(%id, "ignoring undecodable cache entry: {err:#}");
                None
            }
        }
    }

    fn cache_response(&self, id: &Identifier, response: &Response) {
        if let Err(err) = self.0.cache.set(id.as_str(), response.to_bytes()) {
            self.0.metrics.cache_set_error.inc();
            warn!(%id, "failed to cache record: {err:#}");
        }
    }

    fn not_found(&self, id: &Identifier) -> ResolveError {
        self.0.metrics.resolve_not_found.inc();
        NotFoundSnafu { id: id.clone() }.build()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;
    use testresult::TestResult;
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        cache::CacheConfig,
        dht::MemoryDht,
        record::tests::signing_key,
        store::{PageToken, RecordPage, RedbRecordStore},
        util::PublicKeyBytes,
    };

    /// A store whose every operation fails.
    #[derive(Debug)]
    pub(crate) struct BrokenStore;

    fn broken() -> StoreError {
        StoreError::from(redb::StorageError::Io(std::io::Error::other("disk on fire")))
    }

    #[async_trait]
    impl RecordStore for BrokenStore {
        async fn write_record(&self, _record: Record) -> Result<(), StoreError> {
            Err(broken())
        }

        async fn read_record(&self, _key: &PublicKeyBytes) -> Result<Option<Record>, StoreError> {
            Err(broken())
        }

        async fn list_records(
            &self,
            _cursor: Option<PageToken>,
            _page_size: usize,
        ) -> Result<RecordPage, StoreError> {
            Err(broken())
        }
    }

    struct Fixture {
        store: Arc<RedbRecordStore>,
        dht: Arc<MemoryDht>,
        metrics: Arc<Metrics>,
        service: RecordService,
    }

    impl Fixture {
        fn new() -> TestResult<Self> {
            let store = Arc::new(RedbRecordStore::in_memory()?);
            let dht = Arc::new(MemoryDht::default());
            Ok(Self::with(store, dht))
        }

        fn with(store: Arc<RedbRecordStore>, dht: Arc<MemoryDht>) -> Self {
            let metrics = Arc::new(Metrics::default());
            let service = RecordService::new(
                store.clone(),
                dht.clone(),
                ResolutionCache::new(&CacheConfig::default()),
                &RecordsConfig::default(),
                metrics.clone(),
            );
            Self {
                store,
                dht,
                metrics,
                service,
            }
        }

        /// A second service over the same store and DHT, with an empty cache.
        async fn restart(self) -> Self {
            self.service.shutdown().await;
            Self::with(self.store, self.dht)
        }
    }

    fn body(record: &Record) -> Bytes {
        record.to_response().to_bytes()
    }

    #[tokio::test]
    #[traced_test]
    async fn publish_then_get_from_cache() -> TestResult {
        let fx = Fixture::new()?;
        let record = Record::new_signed(&signing_key(), "hello-record", 1);
        let id = record.identifier();
        fx.service.publish(&id, &body(&record)).await?;

        let response = fx.service.get(&id).await?;
        assert_eq!(response, record.to_response());
        assert_eq!(response.to_bytes(), body(&record));
        assert_eq!(fx.metrics.resolve_cache_hit.get(), 1);
        assert_eq!(fx.metrics.resolve_dht_hit.get(), 0);

        fx.service.shutdown().await;
        assert_eq!(fx.dht.put_count(), 1);
        assert_eq!(fx.metrics.propagate_success.get(), 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn get_falls_back_to_dht() -> TestResult {
        let fx = Fixture::new()?;
        let record = Record::new_signed(&signing_key(), "hello-record", 1);
        let id = record.identifier();
        fx.service.publish(&id, &body(&record)).await?;

        let fx = fx.restart().await;
        assert!(fx.service.cache().is_empty());
        let response = fx.service.get(&id).await?;
        assert_eq!(response, record.to_response());
        assert_eq!(fx.metrics.resolve_dht_hit.get(), 1);

        // served from the repopulated cache
        let response = fx.service.get(&id).await?;
        assert_eq!(response, record.to_response());
        assert_eq!(fx.metrics.resolve_cache_hit.get(), 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn get_falls_back_to_store() -> TestResult {
        let fx = Fixture::new()?;
        let record = Record::new_signed(&signing_key(), "hello-record", 1);
        let id = record.identifier();
        fx.service.publish(&id, &body(&record)).await?;

        let fx = fx.restart().await;
        fx.dht.set_fail_gets(true);
        let response = fx.service.get(&id).await?;
        assert_eq!(response, record.to_response());
        assert_eq!(fx.metrics.resolve_store_hit.get(), 1);
        assert!(fx.service.cache().get(id.as_str()).is_some());

        let response = fx.service.get(&id).await?;
        assert_eq!(response, record.to_response());
        assert_eq!(fx.metrics.resolve_cache_hit.get(), 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn undecodable_cache_entry_is_a_miss() -> TestResult {
        let fx = Fixture::new()?;
        let record = Record::new_signed(&signing_key(), "hello-record", 1);
        let id = record.identifier();
        fx.service.publish(&id, &body(&record)).await?;
        fx.service.cache().set(id.as_str(), Bytes::from_static(b"garbage"))?;

        let response = fx.service.get(&id).await?;
        assert_eq!(response, record.to_response());
        assert_eq!(fx.metrics.resolve_cache_hit.get(), 0);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn tampered_record_is_not_written() -> TestResult {
        let fx = Fixture::new()?;
        let record = Record::new_signed(&signing_key(), "hello-record", 1);
        let id = record.identifier();
        let mut tampered = body(&record).to_vec();
        tampered.extend_from_slice(&[1, 2, 3, 4, 5]);

        let err = fx.service.publish(&id, &tampered).await.unwrap_err();
        assert!(matches!(err, PublishError::Validation { .. }));
        assert!(fx.store.read_record(&record.key).await?.is_none());
        assert!(fx.service.cache().is_empty());
        fx.service.shutdown().await;
        assert_eq!(fx.dht.put_count(), 0);
        assert_eq!(fx.metrics.publish_invalid.get(), 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn oversized_record_is_not_written() -> TestResult {
        let fx = Fixture::new()?;
        let record = Record::new_signed(&signing_key(), vec![1u8; DEFAULT_RECORD_SIZE_LIMIT + 1], 1);
        let id = record.identifier();
        let err = fx.service.publish(&id, &body(&record)).await.unwrap_err();
        assert!(matches!(
            err,
            PublishError::Validation {
                source: ValidationError::TooLarge { .. }
            }
        ));
        assert!(fx.store.read_record(&record.key).await?.is_none());
        assert!(fx.service.cache().is_empty());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn identifiers() -> TestResult {
        let fx = Fixture::new()?;
        let record = Record::new_signed(&signing_key(), "hello-record", 1);

        // undecodable
        let bad = Identifier::new("----");
        let err = fx.service.publish(&bad, &body(&record)).await.unwrap_err();
        assert!(matches!(err, PublishError::IdentifierDecode { .. }));
        let err = fx.service.get(&bad).await.unwrap_err();
        assert!(matches!(err, ResolveError::InvalidIdentifier { .. }));

        // decodable, but not a key
        let short = Identifier::new("aaaa");
        let err = fx.service.publish(&short, &body(&record)).await.unwrap_err();
        assert!(matches!(err, PublishError::Validation { .. }));
        let err = fx.service.get(&short).await.unwrap_err();
        assert!(matches!(err, ResolveError::NotFound { .. }));

        // well formed, never published
        let unknown = PublicKeyBytes::from(signing_key().verifying_key().to_bytes()).to_identifier();
        let err = fx.service.get(&unknown).await.unwrap_err();
        assert!(matches!(err, ResolveError::NotFound { .. }));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn storage_failure_stops_publish() -> TestResult {
        let dht = Arc::new(MemoryDht::default());
        let metrics = Arc::new(Metrics::default());
        let service = RecordService::new(
            Arc::new(BrokenStore),
            dht.clone(),
            ResolutionCache::new(&CacheConfig::default()),
            &RecordsConfig::default(),
            metrics.clone(),
        );
        let record = Record::new_signed(&signing_key(), "hello-record", 1);
        let id = record.identifier();
        let err = service.publish(&id, &body(&record)).await.unwrap_err();
        assert!(matches!(err, PublishError::Storage { .. }));
        assert!(service.cache().is_empty());

        // nothing in the cache or the DHT and a broken store: not found
        let err = service.get(&id).await.unwrap_err();
        assert!(matches!(err, ResolveError::NotFound { .. }));

        service.shutdown().await;
        assert_eq!(dht.put_count(), 0);
        assert_eq!(metrics.publish_error.get(), 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn cache_failure_does_not_fail_publish() -> TestResult {
        let store = Arc::new(RedbRecordStore::in_memory()?);
        let dht = Arc::new(MemoryDht::default());
        let metrics = Arc::new(Metrics::default());
        let tiny = CacheConfig {
            max_entry_size: 8,
            ..Default::default()
        };
        let service = RecordService::new(
            store.clone(),
            dht.clone(),
            ResolutionCache::new(&tiny),
            &RecordsConfig::default(),
            metrics.clone(),
        );
        let record = Record::new_signed(&signing_key(), "hello-record", 1);
        let id = record.identifier();
        service.publish(&id, &body(&record)).await?;
        assert_eq!(metrics.cache_set_error.get(), 1);
        assert_eq!(store.read_record(&record.key).await?, Some(record));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn republish_overwrites_without_seq_check() -> TestResult {
        let fx = Fixture::new()?;
        let key = signing_key();
        let first = Record::new_signed(&key, "first", 5);
        let second = Record::new_signed(&key, "second", 3);
        let id = first.identifier();
        fx.service.publish(&id, &body(&first)).await?;
        fx.service.publish(&id, &body(&second)).await?;
        assert_eq!(fx.service.get(&id).await?, second.to_response());
        assert_eq!(fx.store.read_record(&first.key).await?, Some(second));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[traced_test]
    async fn concurrent_publishes() -> TestResult {
        let fx = Fixture::new()?;
        let a = Record::new_signed(&signing_key(), "record a", 1);
        let b = Record::new_signed(&signing_key(), "record b", 1);
        let (ida, idb) = (a.identifier(), b.identifier());
        let (body_a, body_b) = (body(&a), body(&b));
        let (ra, rb) = tokio::join!(
            fx.service.publish(&ida, &body_a),
            fx.service.publish(&idb, &body_b),
        );
        ra?;
        rb?;
        let fx = fx.restart().await;
        fx.dht.set_fail_gets(true);
        assert_eq!(fx.service.get(&ida).await?, a.to_response());
        assert_eq!(fx.service.get(&idb).await?, b.to_response());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn propagation_outlives_the_caller() -> TestResult {
        let fx = Fixture::new()?;
        fx.dht.set_put_delay(Duration::from_secs(30));
        let record = Record::new_signed(&signing_key(), "detached", 1);
        let (tx, rx) = tokio::sync::oneshot::channel();
        let caller = tokio::spawn({
            let service = fx.service.clone();
            let id = record.identifier();
            let body = body(&record);
            async move {
                let res = service.publish(&id, &body).await;
                tx.send(res).ok();
                std::future::pending::<()>().await;
            }
        });
        rx.await??;
        caller.abort();
        assert!(caller.await.is_err_and(|err| err.is_cancelled()));

        fx.service.shutdown().await;
        assert_eq!(fx.dht.len(), 1);
        assert_eq!(fx.metrics.propagate_success.get(), 1);
        Ok(())
    }
}
