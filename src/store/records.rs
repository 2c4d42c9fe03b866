use std::{ops::Bound, path::Path};

use async_trait::async_trait;
use redb::{Database, TableDefinition, backends::InMemoryBackend};
use snafu::ResultExt;
use tracing::{debug, info};

use super::{CorruptSnafu, CreateDirSnafu, PageToken, RecordPage, RecordStore, StoreError};
use crate::{
    record::{Record, Response},
    util::PublicKeyBytes,
};

pub type RecordKey = [u8; 32];
const RECORDS_TABLE: TableDefinition<&RecordKey, &[u8]> = TableDefinition::new("records-1");

/// A [`RecordStore`] backed by a [`redb`] database.
///
/// Values are stored in the same layout as response bodies.
#[derive(derive_more::Debug)]
pub struct RedbRecordStore {
    #[debug("redb::Database")]
    db: Database,
}

impl RedbRecordStore {
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        info!("loading record database from {}", path.to_string_lossy());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu)?;
        }
        let db = Database::builder().create(path)?;
        Self::open(db)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        info!("using in-memory record database");
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        Self::open(db)
    }

    pub fn open(db: Database) -> Result<Self, StoreError> {
        let write_tx = db.begin_write()?;
        {
            let _table = write_tx.open_table(RECORDS_TABLE)?;
        }
        write_tx.commit()?;
        Ok(Self { db })
    }

    fn upsert(&self, record: &Record) -> Result<bool, StoreError> {
        let value = record.to_response().to_bytes();
        let tx = self.db.begin_write()?;
        let replaced = {
            let mut table = tx.open_table(RECORDS_TABLE)?;
            let previous = table.insert(record.key.as_bytes(), &value[..])?;
            previous.is_some()
        };
        tx.commit()?;
        Ok(replaced)
    }

    fn get(&self, key: &PublicKeyBytes) -> Result<Option<Record>, StoreError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(RECORDS_TABLE)?;
        let Some(row) = table.get(key.as_bytes())? else {
            return Ok(None);
        };
        decode_record(*key, row.value()).map(Some)
    }

    fn page(&self, cursor: Option<PageToken>, page_size: usize) -> Result<RecordPage, StoreError> {
        if page_size == 0 {
            return Ok(RecordPage::default());
        }
        let tx = self.db.begin_read()?;
        let table = tx.open_table(RECORDS_TABLE)?;
        let after = cursor.map(|token| token.0.to_bytes());
        let range = match after.as_ref() {
            Some(key) => table.range::<&RecordKey>((Bound::Excluded(key), Bound::Unbounded))?,
            None => table.range::<&RecordKey>(..)?,
        };
        let mut records = Vec::with_capacity(page_size);
        let mut has_more = false;
        for row in range {
            let (key, value) = row?;
            if records.len() == page_size {
                has_more = true;
                break;
            }
            let key = PublicKeyBytes::from(*key.value());
            records.push(decode_record(key, value.value())?);
        }
        let next = match (has_more, records.last()) {
            (true, Some(last)) => Some(PageToken(last.key)),
            _ => None,
        };
        Ok(RecordPage { records, next })
    }
}

fn decode_record(key: PublicKeyBytes, value: &[u8]) -> Result<Record, StoreError> {
    let response = Response::from_bytes(value).context(CorruptSnafu { key })?;
    Ok(Record::from_parts(key, response))
}

#[async_trait]
impl RecordStore for RedbRecordStore {
    async fn write_record(&self, record: Record) -> Result<(), StoreError> {
        let replaced = self.upsert(&record)?;
        debug!(key = %record.key, seq = record.seq, replaced, "stored record");
        Ok(())
    }

    async fn read_record(&self, key: &PublicKeyBytes) -> Result<Option<Record>, StoreError> {
        self.get(key)
    }

    async fn list_records(
        &self,
        cursor: Option<PageToken>,
        page_size: usize,
    ) -> Result<RecordPage, StoreError> {
        self.page(cursor, page_size)
    }
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use super::*;
    use crate::record::tests::signing_key;

    #[tokio::test]
    async fn write_read_overwrite() -> TestResult {
        let store = RedbRecordStore::in_memory()?;
        let key = signing_key();
        let first = Record::new_signed(&key, "first", 2);
        store.write_record(first.clone()).await?;
        assert_eq!(store.read_record(&first.key).await?, Some(first.clone()));

        // a lower sequence number still replaces the stored record
        let second = Record::new_signed(&key, "second", 1);
        store.write_record(second.clone()).await?;
        assert_eq!(store.read_record(&first.key).await?, Some(second));

        let missing = PublicKeyBytes::from([3u8; 32]);
        assert_eq!(store.read_record(&missing).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn paginate() -> TestResult {
        let store = RedbRecordStore::in_memory()?;
        for i in 0..25 {
            let record = Record::new_signed(&signing_key(), format!("record {i}"), 1);
            store.write_record(record).await?;
        }

        let mut cursor = None;
        let mut pages = Vec::new();
        loop {
            let page = store.list_records(cursor, 10).await?;
            pages.push(page.records.len());
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(pages, vec![10, 10, 5]);

        // an exact multiple of the page size ends without an empty trailing page
        let page = store.list_records(None, 25).await?;
        assert_eq!(page.records.len(), 25);
        assert!(page.next.is_none());

        let keys: Vec<_> = page.records.iter().map(|r| r.key).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        Ok(())
    }

    #[tokio::test]
    async fn persistent_reopen() -> TestResult {
        let dir = std::env::temp_dir().join(format!("records-test-{}", rand::random::<u64>()));
        let path = dir.join("records.db");
        let record = Record::new_signed(&signing_key(), "durable", 7);
        {
            let store = RedbRecordStore::persistent(&path)?;
            store.write_record(record.clone()).await?;
        }
        let store = RedbRecordStore::persistent(&path)?;
        assert_eq!(store.read_record(&record.key).await?, Some(record));
        drop(store);
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }
}
