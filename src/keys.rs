//! Key generation for definitions, instances and activities.
//!
//! Keys are unique and strictly increasing per generator. The engine owns
//! exactly one generator; pass a [`SequenceKeys`] for deterministic tests.

use crate::error::BpmnError;
use crate::Key;
use sha2::{Digest, Sha256};
use sonyflake::Sonyflake;

pub trait KeyGenerator: Send {
    fn next_key(&mut self) -> Result<Key, BpmnError>;

    /// Make sure keys generated from now on are greater than `key`.
    /// Called for every key found in a restored snapshot.
    fn advance_past(&mut self, _key: Key) {}
}

/// Time-based keys from a snowflake generator.
pub struct SnowflakeKeys {
    inner: Sonyflake,
    last: Key,
}

impl SnowflakeKeys {
    pub fn new(machine_id: u16) -> Result<Self, BpmnError> {
        let inner = Sonyflake::builder()
            .machine_id(&|| Ok(machine_id))
            .finalize()
            .map_err(|e| BpmnError::KeyGeneration(e.to_string()))?;
        Ok(Self { inner, last: 0 })
    }

    /// Seed the machine id from a hash of the process environment.
    pub fn from_environment() -> Result<Self, BpmnError> {
        Self::new(machine_id_from_environment())
    }
}

impl KeyGenerator for SnowflakeKeys {
    fn next_key(&mut self) -> Result<Key, BpmnError> {
        let id = self
            .inner
            .next_id()
            .map_err(|e| BpmnError::KeyGeneration(e.to_string()))?;
        let key = Key::try_from(id).map_err(|e| BpmnError::KeyGeneration(e.to_string()))?;
        // Restored keys can be ahead of this generator's clock.
        self.last = key.max(self.last + 1);
        Ok(self.last)
    }

    fn advance_past(&mut self, key: Key) {
        self.last = self.last.max(key);
    }
}

impl std::fmt::Debug for SnowflakeKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnowflakeKeys")
            .field("last", &self.last)
            .finish()
    }
}

/// Plain counter starting at a fixed value.
#[derive(Clone, Debug)]
pub struct SequenceKeys {
    next: Key,
}

impl SequenceKeys {
    pub fn starting_at(first: Key) -> Self {
        Self { next: first }
    }
}

impl Default for SequenceKeys {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl KeyGenerator for SequenceKeys {
    fn next_key(&mut self) -> Result<Key, BpmnError> {
        let key = self.next;
        self.next = key
            .checked_add(1)
            .ok_or_else(|| BpmnError::KeyGeneration("key space exhausted".into()))?;
        Ok(key)
    }

    fn advance_past(&mut self, key: Key) {
        if key >= self.next {
            self.next = key.saturating_add(1);
        }
    }
}

/// 16-bit machine id derived from `HOSTNAME` and `USER`.
pub fn machine_id_from_environment() -> u16 {
    let mut hasher = Sha256::new();
    for name in ["HOSTNAME", "USER"] {
        let value = std::env::var(name).unwrap_or_default();
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\0");
    }
    let digest = hasher.finalize();
    u16::from_be_bytes([digest[0], digest[1]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_keys_increase() {
        let mut keys = SequenceKeys::starting_at(10);
        assert_eq!(keys.next_key().unwrap(), 10);
        assert_eq!(keys.next_key().unwrap(), 11);
        keys.advance_past(100);
        assert_eq!(keys.next_key().unwrap(), 101);
        keys.advance_past(5);
        assert_eq!(keys.next_key().unwrap(), 102);
    }

    #[test]
    fn test_snowflake_keys_are_strictly_increasing() {
        let mut keys = SnowflakeKeys::new(7).unwrap();
        let mut last = 0;
        for _ in 0..1000 {
            let key = keys.next_key().unwrap();
            assert!(key > last, "{key} should be greater than {last}");
            last = key;
        }
    }

    #[test]
    fn test_snowflake_advance_past_restored_keys() {
        let mut keys = SnowflakeKeys::new(7).unwrap();
        let first = keys.next_key().unwrap();
        keys.advance_past(first + 1_000_000_000_000);
        assert!(keys.next_key().unwrap() > first + 1_000_000_000_000);
    }

    #[test]
    fn test_machine_id_is_stable() {
        assert_eq!(machine_id_from_environment(), machine_id_from_environment());
    }
}
