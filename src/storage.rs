//! The storage collaborator.
//!
//! The engine never touches bytes directly. Everything it needs from dataset
//! and item persistence goes through [`Storage`], and [`MemoryStorage`] is a
//! complete in-process implementation of that contract.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::core::{CopyMode, DataType, Dataset, DatasetId, Item, ItemSpec, Provider};
use crate::data::Data;
use crate::error::StorageError;

pub trait Storage: Send + Sync {
    fn create_dataset(&self, name: &str, data_type: DataType) -> Result<Dataset, StorageError>;

    fn dataset(&self, id: DatasetId) -> Result<Dataset, StorageError>;

    fn delete_dataset(&self, id: DatasetId) -> Result<(), StorageError>;

    fn set_done(&self, id: DatasetId, done: bool) -> Result<(), StorageError>;

    /// Items of a dataset, ordered by key.
    fn list_items(&self, id: DatasetId) -> Result<Vec<Item>, StorageError>;

    /// Drops every item of a dataset.
    fn clear(&self, id: DatasetId) -> Result<(), StorageError>;

    /// Registers an item whose bytes are produced outside the engine.
    fn add_item(&self, id: DatasetId, spec: ItemSpec) -> Result<Item, StorageError>;

    fn write_item(&self, id: DatasetId, key: &str, data: &Data) -> Result<Item, StorageError>;

    fn load_data(&self, item: &Item) -> Result<Data, StorageError>;

    /// Copies an item into `dest` under `key`, converting to `format` when it
    /// differs from the source format.
    fn copy_item(
        &self,
        item: &Item,
        dest: DatasetId,
        key: &str,
        format: Option<&str>,
        mode: CopyMode,
    ) -> Result<Item, StorageError>;
}

/// Maps a storage format to the file extension used for it.
pub fn format_ext(format: &str) -> &str {
    match format {
        "jpeg" => "jpg",
        other => other,
    }
}

const NATIVE_FORMAT: &str = "cbor";

struct Stored {
    item: Item,
    data: Option<Data>,
}

struct Entry {
    dataset: Dataset,
    items: BTreeMap<String, Stored>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    datasets: BTreeMap<DatasetId, Entry>,
}

impl Inner {
    fn entry(&self, id: DatasetId) -> Result<&Entry, StorageError> {
        self.datasets
            .get(&id)
            .ok_or(StorageError::DatasetNotFound(id))
    }

    fn entry_mut(&mut self, id: DatasetId) -> Result<&mut Entry, StorageError> {
        self.datasets
            .get_mut(&id)
            .ok_or(StorageError::DatasetNotFound(id))
    }

    fn stored(&self, id: DatasetId, key: &str) -> Result<&Stored, StorageError> {
        self.entry(id)?
            .items
            .get(key)
            .ok_or_else(|| StorageError::ItemNotFound(id, key.to_string()))
    }

    /// Follows reference items to the item that owns the bytes.
    fn owner(&self, id: DatasetId, key: &str) -> Result<&Stored, StorageError> {
        let stored = self.stored(id, key)?;
        match &stored.item.provider {
            Provider::Owned => Ok(stored),
            Provider::Reference { dataset, key } => self.stored(*dataset, key),
        }
    }

    fn insert(&mut self, id: DatasetId, item: Item, data: Option<Data>) -> Result<Item, StorageError> {
        let entry = self.entry_mut(id)?;
        if entry.items.contains_key(&item.key) {
            return Err(StorageError::DuplicateKey(id, item.key));
        }
        entry.items.insert(
            item.key.clone(),
            Stored {
                item: item.clone(),
                data,
            },
        );
        Ok(item)
    }
}

/// Thread-safe in-memory [`Storage`].
#[derive(Default)]
pub struct MemoryStorage {
    inner: RwLock<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a standalone dataset filled with one item per `(key, data)`.
    pub fn seed<K>(
        &self,
        name: &str,
        data_type: DataType,
        items: impl IntoIterator<Item = (K, Data)>,
    ) -> Result<Dataset, StorageError>
    where
        K: AsRef<str>,
    {
        let dataset = self.create_dataset(name, data_type)?;
        for (key, data) in items {
            self.write_item(dataset.id, key.as_ref(), &data)?;
        }
        self.set_done(dataset.id, true)?;
        self.dataset(dataset.id)
    }
}

impl Storage for MemoryStorage {
    fn create_dataset(&self, name: &str, data_type: DataType) -> Result<Dataset, StorageError> {
        let mut inner = self.inner.write();
        inner.next_id += 1;

        let dataset = Dataset {
            id: DatasetId(inner.next_id),
            name: name.to_string(),
            data_type,
            done: false,
        };

        inner.datasets.insert(
            dataset.id,
            Entry {
                dataset: dataset.clone(),
                items: BTreeMap::new(),
            },
        );

        Ok(dataset)
    }

    fn dataset(&self, id: DatasetId) -> Result<Dataset, StorageError> {
        Ok(self.inner.read().entry(id)?.dataset.clone())
    }

    fn delete_dataset(&self, id: DatasetId) -> Result<(), StorageError> {
        self.inner
            .write()
            .datasets
            .remove(&id)
            .map(|_| ())
            .ok_or(StorageError::DatasetNotFound(id))
    }

    fn set_done(&self, id: DatasetId, done: bool) -> Result<(), StorageError> {
        self.inner.write().entry_mut(id)?.dataset.done = done;
        Ok(())
    }

    fn list_items(&self, id: DatasetId) -> Result<Vec<Item>, StorageError> {
        let inner = self.inner.read();
        let entry = inner.entry(id)?;
        Ok(entry.items.values().map(|s| s.item.clone()).collect())
    }

    fn clear(&self, id: DatasetId) -> Result<(), StorageError> {
        self.inner.write().entry_mut(id)?.items.clear();
        Ok(())
    }

    fn add_item(&self, id: DatasetId, spec: ItemSpec) -> Result<Item, StorageError> {
        let item = Item {
            dataset: id,
            key: spec.key,
            ext: spec.ext,
            format: spec.format,
            metadata: spec.metadata,
            provider: Provider::Owned,
            hash: None,
        };
        self.inner.write().insert(id, item, None)
    }

    fn write_item(&self, id: DatasetId, key: &str, data: &Data) -> Result<Item, StorageError> {
        let item = Item {
            dataset: id,
            key: key.to_string(),
            ext: NATIVE_FORMAT.to_string(),
            format: NATIVE_FORMAT.to_string(),
            metadata: String::new(),
            provider: Provider::Owned,
            hash: Some(data.fingerprint()?),
        };
        self.inner.write().insert(id, item, Some(data.clone()))
    }

    fn load_data(&self, item: &Item) -> Result<Data, StorageError> {
        let inner = self.inner.read();
        let owner = inner.owner(item.dataset, &item.key)?;

        owner.data.clone().ok_or_else(|| {
            let msg = format!("item '{}' has no stored payload", item.key);
            StorageError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, msg))
        })
    }

    fn copy_item(
        &self,
        item: &Item,
        dest: DatasetId,
        key: &str,
        format: Option<&str>,
        mode: CopyMode,
    ) -> Result<Item, StorageError> {
        let mut inner = self.inner.write();
        let owner = inner.owner(item.dataset, &item.key)?;
        let converting = format.is_some_and(|f| f != owner.item.format);

        let mut copy = Item {
            dataset: dest,
            key: key.to_string(),
            ..owner.item.clone()
        };

        if mode == CopyMode::ByReference && !converting {
            copy.provider = Provider::Reference {
                dataset: owner.item.dataset,
                key: owner.item.key.clone(),
            };
            return inner.insert(dest, copy, None);
        }

        let data = owner.data.clone();
        if let Some(format) = format {
            copy.format = format.to_string();
            copy.ext = format_ext(format).to_string();
        }
        inner.insert(dest, copy, data)
    }
}
