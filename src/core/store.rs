//! Document storage.
//!
//! Handlers talk to a [`DocumentStore`]: a flat key space of JSON documents.
//! The native server keeps documents in a [`MemoryStore`]; the Spin component
//! uses the Spin key-value store through `SpinStore`.
//!
//! Multi-document updates (mirrored follow/like sets, notifications created
//! as side effects) go through [`DocumentStore::transaction`] so they either
//! land together or not at all.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context};
use serde::de::DeserializeOwned;
use serde::Serialize;

type ReadFn<'a> = dyn Fn(&str) -> anyhow::Result<Option<Vec<u8>>> + 'a;

pub trait DocumentStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;

    fn set(&self, key: &str, value: &[u8]) -> anyhow::Result<()>;

    fn delete(&self, key: &str) -> anyhow::Result<()>;

    /// Runs `f` against a staged view of the store. Staged writes are applied
    /// only when `f` returns `Ok`.
    fn transaction<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<R, E>,
        E: From<anyhow::Error>;

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        decode(key, self.get(key)?)
    }

    fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(value).with_context(|| format!("encoding {}", key))?;
        self.set(key, &bytes)
    }
}

fn decode<T: DeserializeOwned>(key: &str, bytes: Option<Vec<u8>>) -> anyhow::Result<Option<T>> {
    bytes
        .map(|b| serde_json::from_slice(&b).with_context(|| format!("decoding {}", key)))
        .transpose()
}

/// Reads see the transaction's own staged writes first, then the store.
pub struct Transaction<'a> {
    read: &'a ReadFn<'a>,
    staged: BTreeMap<String, Option<Vec<u8>>>,
}

impl<'a> Transaction<'a> {
    fn new(read: &'a ReadFn<'a>) -> Self {
        Transaction {
            read,
            staged: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        match self.staged.get(key) {
            Some(staged) => Ok(staged.clone()),
            None => (self.read)(key),
        }
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        decode(key, self.get(key)?)
    }

    pub fn set_json<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(value).with_context(|| format!("encoding {}", key))?;
        self.staged.insert(key.to_string(), Some(bytes));
        Ok(())
    }

    pub fn delete(&mut self, key: &str) {
        self.staged.insert(key.to_string(), None);
    }

    fn into_writes(self) -> BTreeMap<String, Option<Vec<u8>>> {
        self.staged
    }
}

/// In-process store. Transactions hold the lock for their whole duration.
#[derive(Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.docs.lock().map_err(|_| anyhow!("memory store lock poisoned"))
    }

    pub fn len(&self) -> anyhow::Result<usize> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> anyhow::Result<bool> {
        Ok(self.lock()?.is_empty())
    }
}

impl DocumentStore for MemoryStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        self.lock()?.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn transaction<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<R, E>,
        E: From<anyhow::Error>,
    {
        let mut docs = self.lock()?;
        let (result, writes) = {
            let snapshot: &HashMap<String, Vec<u8>> = &docs;
            let read = |key: &str| -> anyhow::Result<Option<Vec<u8>>> {
                Ok(snapshot.get(key).cloned())
            };
            let mut txn = Transaction::new(&read);
            let result = f(&mut txn)?;
            (result, txn.into_writes())
        };
        for (key, value) in writes {
            match value {
                Some(bytes) => {
                    docs.insert(key, bytes);
                }
                None => {
                    docs.remove(&key);
                }
            }
        }
        Ok(result)
    }
}

/// Spin key-value backend. The key-value interface has no multi-key
/// transactions, so staged writes are applied in key order once `f` succeeds.
#[cfg(target_arch = "wasm32")]
pub struct SpinStore(spin_sdk::key_value::Store);

#[cfg(target_arch = "wasm32")]
impl SpinStore {
    pub fn open_default() -> anyhow::Result<Self> {
        spin_sdk::key_value::Store::open_default()
            .map(SpinStore)
            .map_err(|e| anyhow!("opening default key-value store: {:?}", e))
    }
}

#[cfg(target_arch = "wasm32")]
impl DocumentStore for SpinStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        self.0
            .get(key)
            .map_err(|e| anyhow!("key-value get {}: {:?}", key, e))
    }

    fn set(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        self.0
            .set(key, value)
            .map_err(|e| anyhow!("key-value set {}: {:?}", key, e))
    }

    fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.0
            .delete(key)
            .map_err(|e| anyhow!("key-value delete {}: {:?}", key, e))
    }

    fn transaction<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<R, E>,
        E: From<anyhow::Error>,
    {
        let read = |key: &str| self.get(key);
        let mut txn = Transaction::new(&read);
        let result = f(&mut txn)?;
        for (key, value) in txn.into_writes() {
            match value {
                Some(bytes) => self.set(&key, &bytes)?,
                None => self.delete(&key)?,
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_documents_round_trip() {
        let store = MemoryStore::new();
        store.set_json("ids", &vec!["a", "b"]).unwrap();
        let ids: Vec<String> = store.get_json("ids").unwrap().unwrap();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(store.get_json::<Vec<String>>("missing").unwrap().is_none());
    }

    #[test]
    fn committed_transaction_applies_all_writes() {
        let store = MemoryStore::new();
        store.set_json("stale", &1).unwrap();

        let out: Result<u32, anyhow::Error> = store.transaction(|txn| {
            txn.set_json("a", &1)?;
            txn.set_json("b", &2)?;
            txn.delete("stale");
            Ok(7)
        });

        assert_eq!(out.unwrap(), 7);
        assert_eq!(store.get_json::<i32>("a").unwrap(), Some(1));
        assert_eq!(store.get_json::<i32>("b").unwrap(), Some(2));
        assert!(store.get("stale").unwrap().is_none());
    }

    #[test]
    fn failed_transaction_writes_nothing() {
        let store = MemoryStore::new();
        let out: Result<(), anyhow::Error> = store.transaction(|txn| {
            txn.set_json("a", &1)?;
            Err(anyhow!("abort"))
        });
        assert!(out.is_err());
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn transaction_reads_its_own_writes() {
        let store = MemoryStore::new();
        store.set_json("counter", &1).unwrap();
        let out: Result<i32, anyhow::Error> = store.transaction(|txn| {
            let n: i32 = txn.get_json("counter")?.unwrap_or_default();
            txn.set_json("counter", &(n + 1))?;
            let again: i32 = txn.get_json("counter")?.unwrap_or_default();
            txn.delete("counter");
            assert!(txn.get("counter")?.is_none());
            Ok(again)
        });
        assert_eq!(out.unwrap(), 2);
        assert!(store.get("counter").unwrap().is_none());
    }

    #[test]
    fn concurrent_transactions_do_not_lose_updates() {
        let store = std::sync::Arc::new(MemoryStore::new());
        store.set_json("counter", &0).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let out: Result<(), anyhow::Error> = store.transaction(|txn| {
                            let n: i32 = txn.get_json("counter")?.unwrap_or_default();
                            txn.set_json("counter", &(n + 1))
                        });
                        out.unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.get_json::<i32>("counter").unwrap(), Some(400));
    }
}
