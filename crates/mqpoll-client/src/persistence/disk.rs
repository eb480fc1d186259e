//! On-disk store backed by fjall.
//!
//! All clients share one keyspace; each client's keys are prefixed with
//! `<client_id>@<server_uri>/` so two clients can use the same directory.

use std::path::{Path, PathBuf};

use fjall::{Database, Keyspace, KeyspaceCreateOptions, PersistMode};

use super::{PersistKey, Persistence, PersistenceError};

const KEYSPACE: &str = "inflight";

struct OpenStore {
    db: Database,
    inflight: Keyspace,
    prefix: String,
}

/// Durable store in a directory on disk.
pub struct FjallPersistence {
    path: PathBuf,
    store: Option<OpenStore>,
}

impl FjallPersistence {
    /// Store rooted at `path`. Nothing is touched until `open`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            store: None,
        }
    }

    fn store(&self) -> Result<&OpenStore, PersistenceError> {
        self.store.as_ref().ok_or(PersistenceError::NotOpen)
    }

    fn full_key(store: &OpenStore, key: PersistKey) -> String {
        format!("{}{}", store.prefix, key)
    }

    /// Flush all pending writes to disk.
    pub fn sync(&self) -> Result<(), PersistenceError> {
        self.store()?
            .db
            .persist(PersistMode::SyncAll)
            .map_err(|e| PersistenceError::Sync(e.to_string()))
    }
}

impl Persistence for FjallPersistence {
    fn open(&mut self, client_id: &str, server_uri: &str) -> Result<(), PersistenceError> {
        let db = Database::builder(&self.path)
            .open()
            .map_err(|e| PersistenceError::Open(e.to_string()))?;

        let inflight = db
            .keyspace(KEYSPACE, KeyspaceCreateOptions::default)
            .map_err(|e| PersistenceError::Open(e.to_string()))?;

        log::info!("Opened persistence store at {}", self.path.display());
        self.store = Some(OpenStore {
            db,
            inflight,
            prefix: format!("{}@{}/", client_id, server_uri),
        });
        Ok(())
    }

    fn close(&mut self) -> Result<(), PersistenceError> {
        if self.store.is_some() {
            self.sync()?;
        }
        self.store = None;
        Ok(())
    }

    fn put(&mut self, key: PersistKey, buffers: &[&[u8]]) -> Result<(), PersistenceError> {
        let store = self.store()?;
        store
            .inflight
            .insert(Self::full_key(store, key), buffers.concat())
            .map_err(|e| PersistenceError::Write(e.to_string()))
    }

    fn get(&self, key: PersistKey) -> Result<Option<Vec<u8>>, PersistenceError> {
        let store = self.store()?;
        let value = store
            .inflight
            .get(Self::full_key(store, key))
            .map_err(|e| PersistenceError::Read(e.to_string()))?;
        Ok(value.map(|v| v.to_vec()))
    }

    fn remove(&mut self, key: PersistKey) -> Result<(), PersistenceError> {
        let store = self.store()?;
        store
            .inflight
            .remove(Self::full_key(store, key))
            .map_err(|e| PersistenceError::Write(e.to_string()))
    }

    fn keys(&self) -> Result<Vec<PersistKey>, PersistenceError> {
        let store = self.store()?;
        let mut keys = Vec::new();
        for kv in store.inflight.iter() {
            let raw = kv.key().map_err(|e| PersistenceError::Read(e.to_string()))?;
            let raw = String::from_utf8_lossy(&raw);
            let Some(rest) = raw.strip_prefix(store.prefix.as_str()) else {
                continue;
            };
            match rest.parse() {
                Ok(key) => keys.push(key),
                Err(_) => log::warn!("Ignoring unknown persisted key {:?}", raw),
            }
        }
        Ok(keys)
    }

    fn clear(&mut self) -> Result<(), PersistenceError> {
        for key in self.keys()? {
            self.remove(key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_roundtrip_on_disk() {
        let dir = tempdir().unwrap();

        {
            let mut store = FjallPersistence::new(dir.path());
            store.open("client", "tcp://h:1883").unwrap();
            store.put(PersistKey::sent(3), &[b"head", b"body"]).unwrap();
            store.put(PersistKey::received(4), &[b"r"]).unwrap();
            store.close().unwrap();
        }

        let mut store = FjallPersistence::new(dir.path());
        store.open("client", "tcp://h:1883").unwrap();
        assert_eq!(
            store.get(PersistKey::sent(3)).unwrap(),
            Some(b"headbody".to_vec())
        );
        let mut keys = store.keys().unwrap();
        keys.sort();
        assert_eq!(keys, vec![PersistKey::sent(3), PersistKey::received(4)]);
    }

    #[test]
    fn test_clients_are_isolated() {
        let dir = tempdir().unwrap();
        let mut a = FjallPersistence::new(dir.path());
        a.open("a", "tcp://h:1883").unwrap();
        a.put(PersistKey::sent(1), &[b"x"]).unwrap();
        a.close().unwrap();

        let mut b = FjallPersistence::new(dir.path());
        b.open("b", "tcp://h:1883").unwrap();
        assert!(b.keys().unwrap().is_empty());
        b.put(PersistKey::sent(1), &[b"y"]).unwrap();
        b.clear().unwrap();
        b.close().unwrap();

        let mut a = FjallPersistence::new(dir.path());
        a.open("a", "tcp://h:1883").unwrap();
        assert_eq!(a.get(PersistKey::sent(1)).unwrap(), Some(b"x".to_vec()));
    }

    #[test]
    fn test_not_open() {
        let store = FjallPersistence::new("/nonexistent");
        assert!(matches!(store.keys(), Err(PersistenceError::NotOpen)));
    }
}
