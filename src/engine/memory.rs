use crate::engine::{CollectionSpec, StorageEngine, Transaction, TxMode};
use crate::error::{LatticeError, Result};
use crate::value::{Key, Record, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

/// In-memory storage engine for tests and ephemeral data.
///
/// A transaction holds the engine lock for its whole lifetime, which
/// serializes conflicting access; writes stage into an overlay that is
/// applied on commit and discarded on drop.
#[derive(Clone, Default)]
pub struct MemoryEngine {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    version: u32,
    specs: HashMap<String, CollectionSpec>,
    data: HashMap<String, BTreeMap<Key, Record>>,
    counters: HashMap<String, i64>,
}

impl MemoryEngine {
    pub fn new() -> MemoryEngine {
        MemoryEngine::default()
    }
}

impl StorageEngine for MemoryEngine {
    type Txn<'a>
        = MemoryTxn<'a>
    where
        Self: 'a;

    fn create_collections(&self, version: u32, specs: &[CollectionSpec]) -> Result<()> {
        let mut inner = lock(&self.inner)?;
        inner.version = version;
        for spec in specs {
            inner.data.entry(spec.name.clone()).or_default();
            if spec.auto_increment {
                inner.counters.entry(spec.name.clone()).or_insert(0);
            }
            inner.specs.insert(spec.name.clone(), spec.clone());
        }
        Ok(())
    }

    fn begin(&self, mode: TxMode) -> Result<MemoryTxn<'_>> {
        Ok(MemoryTxn {
            inner: lock(&self.inner)?,
            mode,
            staged: HashMap::new(),
            counters: HashMap::new(),
        })
    }
}

fn lock(inner: &Mutex<Inner>) -> Result<MutexGuard<'_, Inner>> {
    inner
        .lock()
        .map_err(|_| LatticeError::TransactionAborted("engine lock poisoned".into()))
}

/// A staged transaction over [`MemoryEngine`].
pub struct MemoryTxn<'a> {
    inner: MutexGuard<'a, Inner>,
    mode: TxMode,
    /// Overlay per collection; `None` marks a staged delete.
    staged: HashMap<String, BTreeMap<Key, Option<Record>>>,
    counters: HashMap<String, i64>,
}

impl MemoryTxn<'_> {
    fn committed(&self, collection: &str) -> Result<&BTreeMap<Key, Record>> {
        self.inner.data.get(collection).ok_or_else(|| {
            LatticeError::Other(format!("Unknown collection '{collection}'"))
        })
    }

    fn writable(&self, collection: &str) -> Result<()> {
        self.committed(collection)?;
        if self.mode == TxMode::ReadOnly {
            return Err(LatticeError::TransactionAborted(
                "write in read-only transaction".into(),
            ));
        }
        Ok(())
    }

    fn read(&self, collection: &str, key: &Key) -> Result<Option<Record>> {
        if let Some(overlay) = self.staged.get(collection) {
            if let Some(staged) = overlay.get(key) {
                return Ok(staged.clone());
            }
        }
        Ok(self.committed(collection)?.get(key).cloned())
    }

    /// Unique-index check against the merged view, ignoring `key` itself.
    fn check_unique(&self, collection: &str, key: &Key, record: &Record) -> Result<()> {
        let Some(spec) = self.inner.specs.get(collection) else {
            return Ok(());
        };
        for field in &spec.unique_fields {
            let value = record.get(field).unwrap_or(&Value::Null);
            if value.is_null() {
                continue;
            }
            for (other_key, other) in self.merged(collection)? {
                if &other_key != key && other.get(field) == Some(value) {
                    return Err(LatticeError::DuplicateKey(format!(
                        "{collection}.{field} = {value}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn merged(&self, collection: &str) -> Result<Vec<(Key, Record)>> {
        let mut view: BTreeMap<Key, Record> = self.committed(collection)?.clone();
        if let Some(overlay) = self.staged.get(collection) {
            for (key, staged) in overlay {
                match staged {
                    Some(record) => {
                        view.insert(key.clone(), record.clone());
                    }
                    None => {
                        view.remove(key);
                    }
                }
            }
        }
        Ok(view.into_iter().collect())
    }

    fn stage(&mut self, collection: &str, key: Key, staged: Option<Record>) {
        self.staged
            .entry(collection.to_string())
            .or_default()
            .insert(key, staged);
    }
}

impl Transaction for MemoryTxn<'_> {
    fn get(&self, collection: &str, key: &Key) -> Result<Option<Record>> {
        self.read(collection, key)
    }

    fn scan(&self, collection: &str) -> Result<Vec<(Key, Record)>> {
        self.merged(collection)
    }

    fn insert(&mut self, collection: &str, key: &Key, record: Record) -> Result<()> {
        self.writable(collection)?;
        if self.read(collection, key)?.is_some() {
            return Err(LatticeError::DuplicateKey(format!("{collection}/{key}")));
        }
        self.check_unique(collection, key, &record)?;
        self.stage(collection, key.clone(), Some(record));
        Ok(())
    }

    fn put(&mut self, collection: &str, key: &Key, record: Record) -> Result<()> {
        self.writable(collection)?;
        self.check_unique(collection, key, &record)?;
        self.stage(collection, key.clone(), Some(record));
        Ok(())
    }

    fn delete(&mut self, collection: &str, key: &Key) -> Result<()> {
        self.writable(collection)?;
        self.stage(collection, key.clone(), None);
        Ok(())
    }

    fn allocate_key(&mut self, collection: &str) -> Result<Key> {
        self.writable(collection)?;
        let current = self
            .counters
            .get(collection)
            .copied()
            .or_else(|| self.inner.counters.get(collection).copied())
            .ok_or_else(|| {
                LatticeError::Other(format!(
                    "Collection '{collection}' is not auto-increment"
                ))
            })?;
        let next = current + 1;
        self.counters.insert(collection.to_string(), next);
        Ok(Key::Int(next))
    }

    fn commit(mut self) -> Result<()> {
        for (collection, overlay) in std::mem::take(&mut self.staged) {
            for (key, staged) in overlay {
                // Explicit integer keys keep the allocator ahead of them.
                if staged.is_some() {
                    if let (Key::Int(n), Some(counter)) =
                        (&key, self.inner.counters.get_mut(&collection))
                    {
                        *counter = (*counter).max(*n);
                    }
                }
                let data = self.inner.data.entry(collection.clone()).or_default();
                match staged {
                    Some(record) => {
                        data.insert(key, record);
                    }
                    None => {
                        data.remove(&key);
                    }
                }
            }
        }
        for (collection, next) in std::mem::take(&mut self.counters) {
            let counter = self.inner.counters.entry(collection).or_insert(0);
            *counter = (*counter).max(next);
        }
        Ok(())
    }
}
