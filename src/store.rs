//! Durable record storage.

use std::sync::Arc;

use async_trait::async_trait;
use snafu::Snafu;

use crate::{record::Record, util::PublicKeyBytes};

pub use self::records::RedbRecordStore;

mod records;

/// Page size used when scanning all records.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum StoreError {
    #[snafu(display("failed to create database directory"))]
    CreateDir { source: std::io::Error },
    #[snafu(display("database error"))]
    Database { source: redb::Error },
    #[snafu(display("stored record for {key} is corrupt"))]
    Corrupt {
        key: PublicKeyBytes,
        source: crate::record::WireError,
    },
}

macro_rules! impl_from_redb {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for StoreError {
                fn from(value: $ty) -> Self {
                    Self::Database {
                        source: value.into(),
                    }
                }
            }
        )*
    };
}

impl_from_redb!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError
);

/// Opaque continuation token for [`RecordStore::list_records`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageToken(pub(crate) PublicKeyBytes);

/// One page of a full scan.
#[derive(Debug, Clone, Default)]
pub struct RecordPage {
    /// The records of this page, ordered by key.
    pub records: Vec<Record>,
    /// Token for the next page, or `None` if this is the last page.
    pub next: Option<PageToken>,
}

/// Durable storage for records.
///
/// Implementations must be safe to use from many tasks at once.
#[async_trait]
pub trait RecordStore: std::fmt::Debug + Send + Sync + 'static {
    /// Insert or replace the record stored under the record's key.
    async fn write_record(&self, record: Record) -> Result<(), StoreError>;

    /// Read the record stored under `key`.
    async fn read_record(&self, key: &PublicKeyBytes) -> Result<Option<Record>, StoreError>;

    /// List up to `page_size` records, starting after `cursor`.
    async fn list_records(
        &self,
        cursor: Option<PageToken>,
        page_size: usize,
    ) -> Result<RecordPage, StoreError>;
}

#[async_trait]
impl<T: RecordStore + ?Sized> RecordStore for Arc<T> {
    async fn write_record(&self, record: Record) -> Result<(), StoreError> {
        self.as_ref().write_record(record).await
    }

    async fn read_record(&self, key: &PublicKeyBytes) -> Result<Option<Record>, StoreError> {
        self.as_ref().read_record(key).await
    }

    async fn list_records(
        &self,
        cursor: Option<PageToken>,
        page_size: usize,
    ) -> Result<RecordPage, StoreError> {
        self.as_ref().list_records(cursor, page_size).await
    }
}
