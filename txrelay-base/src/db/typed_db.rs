use derive_new::new;
use rocksdb::WriteBatch;

use txrelay_core::{Decode, Encode};

use crate::db::{DbResult, DB};

/// DB handle for storing data tied to a specific type/entity.
///
/// Key structure: ```<entity>_<prefix><key>```
#[derive(Debug, Clone, new)]
pub struct TypedDB {
    entity: String,
    db: DB,
}

impl AsRef<DB> for TypedDB {
    fn as_ref(&self) -> &DB {
        &self.db
    }
}

impl TypedDB {
    fn full_prefix(&self, prefix: impl AsRef<[u8]>) -> Vec<u8> {
        let mut full_prefix = vec![];
        full_prefix.extend(self.entity.as_bytes());
        full_prefix.extend("_".as_bytes());
        full_prefix.extend(prefix.as_ref());
        full_prefix
    }

    fn full_key<K: Encode>(&self, prefix: impl AsRef<[u8]>, key: &K) -> Vec<u8> {
        let mut full_key = self.full_prefix(prefix);
        full_key.extend(key.to_vec());
        full_key
    }

    /// Store encodable kv pair
    pub fn store_value_by_key<K: Encode, V: Encode>(
        &self,
        prefix: impl AsRef<[u8]>,
        key: &K,
        value: &V,
    ) -> DbResult<()> {
        self.db.store(&self.full_key(prefix, key), &value.to_vec())
    }

    /// Retrieve decodable value given encodable key
    pub fn retrieve_value_by_key<K: Encode, V: Decode>(
        &self,
        prefix: impl AsRef<[u8]>,
        key: &K,
    ) -> DbResult<Option<V>> {
        self.db
            .retrieve(&self.full_key(prefix, key))?
            .map(|bytes| V::read_from(&bytes))
            .transpose()
            .map_err(Into::into)
    }

    /// Queue a put of an encodable kv pair into `batch`
    pub fn put_in_batch<K: Encode, V: Encode>(
        &self,
        batch: &mut WriteBatch,
        prefix: impl AsRef<[u8]>,
        key: &K,
        value: &V,
    ) {
        batch.put(self.full_key(prefix, key), value.to_vec());
    }

    /// Queue a delete of an encodable key into `batch`
    pub fn delete_in_batch<K: Encode>(
        &self,
        batch: &mut WriteBatch,
        prefix: impl AsRef<[u8]>,
        key: &K,
    ) {
        batch.delete(self.full_key(prefix, key));
    }

    /// Atomically apply `batch`
    pub fn write(&self, batch: WriteBatch) -> DbResult<()> {
        self.db.write(batch)
    }

    /// Every entry under `prefix` whose key starts with `key_prefix`, in key
    /// order. Returned keys have the prefixes stripped.
    pub fn scan_values<V: Decode>(
        &self,
        prefix: impl AsRef<[u8]>,
        key_prefix: &[u8],
    ) -> DbResult<Vec<(Vec<u8>, V)>> {
        let full_prefix = self.full_prefix(prefix);
        let mut scan_prefix = full_prefix.clone();
        scan_prefix.extend(key_prefix);
        self.db
            .scan_prefix(&scan_prefix)?
            .into_iter()
            .map(|(key, value)| -> DbResult<(Vec<u8>, V)> {
                let value = V::read_from(&value)?;
                Ok((key[full_prefix.len()..].to_vec(), value))
            })
            .collect()
    }

    /// Number of entries under `prefix` whose key starts with `key_prefix`
    pub fn count_keys(&self, prefix: impl AsRef<[u8]>, key_prefix: &[u8]) -> DbResult<usize> {
        let mut scan_prefix = self.full_prefix(prefix);
        scan_prefix.extend(key_prefix);
        Ok(self.db.scan_prefix(&scan_prefix)?.len())
    }
}
