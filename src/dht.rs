//! Access to the mainline DHT for mutable items.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use pkarr::mainline::{Dht as MainlineClient, MutableItem, async_dht::AsyncDht};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tracing::{debug, info};

use crate::{
    record::{
        NetworkPutItem, Response,
        bencode::{self, BencodeError},
    },
    util::{Identifier, IdentifierDecodeError, InvalidKeyLength, PublicKeyBytes},
};

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum DhtError {
    #[snafu(display("failed to start the DHT client"))]
    Start { source: std::io::Error },
    #[snafu(display("identifier is not a valid DHT target"))]
    InvalidTarget { source: IdentifierDecodeError },
    #[snafu(display("identifier is not a valid DHT target"))]
    TargetLength { source: InvalidKeyLength },
    #[snafu(display("no item found for {id}"))]
    NotFound { id: Identifier },
    #[snafu(display("failed to put item: {reason}"))]
    PutFailed { reason: String },
    #[snafu(display("simulated failure"))]
    Simulated,
}

/// Acknowledgement for a successful put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutReceipt {
    /// The identifier the item was announced under.
    pub id: Identifier,
}

/// A mutable item as returned by a DHT lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkItem {
    /// The value, still bencoded.
    pub value: Bytes,
    /// Sequence number.
    pub seq: i64,
    /// Signature over the value and sequence number.
    pub signature: [u8; 64],
}

impl NetworkItem {
    /// Build an item from a raw value.
    pub fn from_raw(value: &[u8], seq: i64, signature: [u8; 64]) -> Self {
        Self {
            value: bencode::encode_bytes(value).into(),
            seq,
            signature,
        }
    }

    /// Decode the bencoded value into a [`Response`].
    pub fn to_response(&self) -> Result<Response, BencodeError> {
        let value = bencode::decode_bytes(&self.value)?;
        Ok(Response {
            value: Bytes::copy_from_slice(value),
            seq: self.seq,
            signature: self.signature,
        })
    }
}

/// The subset of a DHT client used by the relay.
///
/// Implementations must be safe to use from many tasks at once.
#[async_trait]
pub trait Dht: std::fmt::Debug + Send + Sync + 'static {
    /// Announce a mutable item to the network.
    async fn put(&self, item: NetworkPutItem) -> Result<PutReceipt, DhtError>;

    /// Look up the item with the highest sequence number any reachable peer holds.
    async fn get_full(&self, id: &Identifier) -> Result<NetworkItem, DhtError>;
}

#[async_trait]
impl<T: Dht + ?Sized> Dht for Arc<T> {
    async fn put(&self, item: NetworkPutItem) -> Result<PutReceipt, DhtError> {
        self.as_ref().put(item).await
    }

    async fn get_full(&self, id: &Identifier) -> Result<NetworkItem, DhtError> {
        self.as_ref().get_full(id).await
    }
}

/// Which DHT backend to use.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DhtMode {
    /// Join the mainline DHT.
    #[default]
    Mainline,
    /// Keep items in process only, nothing leaves this node.
    Memory,
}

/// Config for the DHT client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DhtConfig {
    /// Which backend to use.
    #[serde(default)]
    pub mode: DhtMode,
    /// Custom bootstrap nodes as `host:port`, defaults to the public mainline bootstrap
    /// nodes when unset.
    pub bootstrap: Option<Vec<String>>,
}

impl DhtConfig {
    /// Build the configured DHT client.
    pub fn build(&self) -> Result<Arc<dyn Dht>, DhtError> {
        Ok(match self.mode {
            DhtMode::Mainline => Arc::new(MainlineDht::new(self.bootstrap.as_deref())?),
            DhtMode::Memory => Arc::new(MemoryDht::default()),
        })
    }
}

/// A [`Dht`] backed by a mainline DHT client.
///
/// Lookups and puts are awaited on the client's actor, so dropping the future stops
/// waiting without holding a thread.
#[derive(derive_more::Debug, Clone)]
pub struct MainlineDht {
    #[debug("mainline::AsyncDht")]
    client: AsyncDht,
}

impl MainlineDht {
    /// Start a client-mode DHT node.
    pub fn new(bootstrap: Option<&[String]>) -> Result<Self, DhtError> {
        let client = match bootstrap {
            Some(nodes) => {
                info!(?nodes, "starting mainline DHT client with custom bootstrap");
                MainlineClient::builder().bootstrap(nodes).build()
            }
            None => {
                info!("starting mainline DHT client");
                MainlineClient::client()
            }
        }
        .context(StartSnafu)?;
        Ok(Self {
            client: client.as_async(),
        })
    }
}

#[async_trait]
impl Dht for MainlineDht {
    async fn put(&self, item: NetworkPutItem) -> Result<PutReceipt, DhtError> {
        let id = item.key.to_identifier();
        let mutable = MutableItem::new_signed_unchecked(
            item.key.to_bytes(),
            item.signature,
            &item.value,
            item.seq,
            None,
        );
        self.client
            .put_mutable(mutable, None)
            .await
            .map_err(|err| {
                PutFailedSnafu {
                    reason: err.to_string(),
                }
                .build()
            })?;
        debug!(%id, "put mutable item");
        Ok(PutReceipt { id })
    }

    async fn get_full(&self, id: &Identifier) -> Result<NetworkItem, DhtError> {
        let key = id
            .to_public_key()
            .context(InvalidTargetSnafu)?
            .context(TargetLengthSnafu)?;
        let Some(item) = self
            .client
            .get_mutable_most_recent(key.as_bytes(), None)
            .await
        else {
            return Err(NotFoundSnafu { id: id.clone() }.build());
        };
        let seq: i64 = item.seq().to_owned();
        let signature: [u8; 64] = item.signature().to_owned();
        Ok(NetworkItem::from_raw(item.value(), seq, signature))
    }
}

/// A [`Dht`] that keeps items in process.
///
/// Like the mainline DHT it only replaces an item with one of equal or higher sequence
/// number. Tests can inject failures and delays.
#[derive(Debug, Default)]
pub struct MemoryDht {
    items: Mutex<HashMap<PublicKeyBytes, NetworkPutItem>>,
    failing_keys: Mutex<HashSet<PublicKeyBytes>>,
    fail_puts: AtomicBool,
    fail_gets: AtomicBool,
    put_delay: Mutex<Option<Duration>>,
    puts: AtomicUsize,
}

impl MemoryDht {
    /// Make every subsequent put fail.
    #[cfg(test)]
    pub(crate) fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent lookup fail.
    #[cfg(test)]
    pub(crate) fn set_fail_gets(&self, fail: bool) {
        self.fail_gets.store(fail, Ordering::SeqCst);
    }

    /// Make puts for a single key fail.
    #[cfg(test)]
    pub(crate) fn fail_puts_for(&self, key: PublicKeyBytes) {
        self.failing_keys.lock().insert(key);
    }

    /// Make every subsequent put take `delay` before it lands.
    #[cfg(test)]
    pub(crate) fn set_put_delay(&self, delay: Duration) {
        *self.put_delay.lock() = Some(delay);
    }

    /// Number of put attempts, including failed ones.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Number of items held.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Dht for MemoryDht {
    async fn put(&self, item: NetworkPutItem) -> Result<PutReceipt, DhtError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.put_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_puts.load(Ordering::SeqCst) || self.failing_keys.lock().contains(&item.key)
        {
            return Err(SimulatedSnafu.build());
        }
        let id = item.key.to_identifier();
        let mut items = self.items.lock();
        let replace = items
            .get(&item.key)
            .is_none_or(|existing| existing.seq <= item.seq);
        if replace {
            items.insert(item.key, item);
        }
        Ok(PutReceipt { id })
    }

    async fn get_full(&self, id: &Identifier) -> Result<NetworkItem, DhtError> {
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(SimulatedSnafu.build());
        }
        let key = id
            .to_public_key()
            .context(InvalidTargetSnafu)?
            .context(TargetLengthSnafu)?;
        let items = self.items.lock();
        let item = items
            .get(&key)
            .ok_or_else(|| NotFoundSnafu { id: id.clone() }.build())?;
        Ok(NetworkItem::from_raw(&item.value, item.seq, item.signature))
    }
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use super::*;
    use crate::record::{Record, tests::signing_key};

    #[tokio::test]
    async fn memory_keeps_highest_seq() -> TestResult {
        let dht = MemoryDht::default();
        let key = signing_key();
        let newer = Record::new_signed(&key, "newer", 5);
        let older = Record::new_signed(&key, "older", 4);
        dht.put(newer.to_network_item()).await?;
        dht.put(older.to_network_item()).await?;
        let item = dht.get_full(&newer.identifier()).await?;
        assert_eq!(item.to_response()?, newer.to_response());
        assert_eq!(dht.put_count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn memory_failures() -> TestResult {
        let dht = MemoryDht::default();
        let record = Record::new_signed(&signing_key(), "value", 1);
        dht.fail_puts_for(record.key);
        assert!(dht.put(record.to_network_item()).await.is_err());
        assert!(matches!(
            dht.get_full(&record.identifier()).await,
            Err(DhtError::NotFound { .. })
        ));
        assert!(matches!(
            dht.get_full(&Identifier::new("----")).await,
            Err(DhtError::InvalidTarget { .. })
        ));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn memory_put_delay() -> TestResult {
        let dht = MemoryDht::default();
        dht.set_put_delay(Duration::from_secs(5));
        let record = Record::new_signed(&signing_key(), "value", 1);
        let start = tokio::time::Instant::now();
        dht.put(record.to_network_item()).await?;
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert_eq!(dht.len(), 1);
        Ok(())
    }

    #[test]
    fn network_item_value_is_bencoded() {
        let item = NetworkItem::from_raw(b"hello-record", 1, [1u8; 64]);
        assert_eq!(&item.value[..], b"12:hello-record");
        let response = item.to_response().unwrap();
        assert_eq!(&response.value[..], b"hello-record");
    }
}
