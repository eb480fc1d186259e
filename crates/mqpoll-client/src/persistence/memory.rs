//! In-memory store, for tests and for hosts that only need the protocol
//! bookkeeping to survive a reconnect, not a restart.

use std::collections::BTreeMap;

use super::{PersistKey, Persistence, PersistenceError};

#[derive(Debug, Default)]
pub struct MemoryPersistence {
    open: bool,
    entries: BTreeMap<PersistKey, Vec<u8>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self) -> Result<(), PersistenceError> {
        if self.open {
            Ok(())
        } else {
            Err(PersistenceError::NotOpen)
        }
    }
}

impl Persistence for MemoryPersistence {
    fn open(&mut self, _client_id: &str, _server_uri: &str) -> Result<(), PersistenceError> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), PersistenceError> {
        self.open = false;
        Ok(())
    }

    fn put(&mut self, key: PersistKey, buffers: &[&[u8]]) -> Result<(), PersistenceError> {
        self.check_open()?;
        self.entries.insert(key, buffers.concat());
        Ok(())
    }

    fn get(&self, key: PersistKey) -> Result<Option<Vec<u8>>, PersistenceError> {
        self.check_open()?;
        Ok(self.entries.get(&key).cloned())
    }

    fn remove(&mut self, key: PersistKey) -> Result<(), PersistenceError> {
        self.check_open()?;
        self.entries.remove(&key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<PersistKey>, PersistenceError> {
        self.check_open()?;
        Ok(self.entries.keys().copied().collect())
    }

    fn clear(&mut self) -> Result<(), PersistenceError> {
        self.check_open()?;
        self.entries.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_concatenates() {
        let mut store = MemoryPersistence::new();
        store.open("c", "tcp://h:1883").unwrap();
        store.put(PersistKey::sent(1), &[b"ab", b"cd"]).unwrap();
        assert_eq!(store.get(PersistKey::sent(1)).unwrap(), Some(b"abcd".to_vec()));
        assert!(store.contains_key(PersistKey::sent(1)).unwrap());
        assert!(!store.contains_key(PersistKey::pubrel(1)).unwrap());
    }

    #[test]
    fn test_requires_open() {
        let mut store = MemoryPersistence::new();
        assert!(matches!(
            store.put(PersistKey::sent(1), &[b"x"]),
            Err(PersistenceError::NotOpen)
        ));
    }

    #[test]
    fn test_remove_and_clear() {
        let mut store = MemoryPersistence::new();
        store.open("c", "tcp://h:1883").unwrap();
        store.put(PersistKey::sent(1), &[b"x"]).unwrap();
        store.put(PersistKey::received(2), &[b"y"]).unwrap();
        store.remove(PersistKey::sent(1)).unwrap();
        assert_eq!(store.keys().unwrap(), vec![PersistKey::received(2)]);
        store.clear().unwrap();
        assert!(store.keys().unwrap().is_empty());
    }
}
