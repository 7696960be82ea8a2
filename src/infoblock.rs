//! # Encrypted Records
//!
//! An [`InfoBlock`] is a fixed number of optional ciphertext slots. A
//! [`SecretInfoBlock`] binds one to a [`KeyHandler`] so every field goes
//! through all encryption layers on the way in and out.
//!
//! ## Serialized Form
//!
//! ```text
//! bincode { capacity: u32, entries: BTreeMap<u32, Vec<u8>> } || tag[64]
//! ```
//!
//! The tag covers a canonical encoding of the sorted entries and the
//! capacity, so it does not depend on the order fields were written in. The
//! key handler is never part of the blob.

use std::collections::BTreeMap;

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};
use crate::keyhandler::KeyHandler;
use crate::{INTEGRITY_TAG_SIZE, MAX_CAPACITY};

/// On-disk body, tag excluded
#[derive(Serialize, Deserialize)]
struct StoredBlock {
    capacity: u32,
    entries: BTreeMap<u32, Vec<u8>>,
}

/// Fixed-capacity sequence of optional ciphertext slots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoBlock {
    slots: Vec<Option<Vec<u8>>>,
}

impl InfoBlock {
    /// Create an empty block with `capacity` slots
    pub fn new(capacity: usize) -> ProtocolResult<Self> {
        if capacity == 0 || capacity > MAX_CAPACITY {
            return Err(ProtocolError::InvalidConfiguration(format!(
                "Block capacity must be within 1..={}, got {}",
                MAX_CAPACITY, capacity
            )));
        }
        Ok(Self {
            slots: vec![None; capacity],
        })
    }

    /// Declared number of slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn check(&self, index: usize) -> ProtocolResult<()> {
        if index >= self.slots.len() {
            return Err(ProtocolError::OutOfRangeAccess {
                index,
                capacity: self.slots.len(),
            });
        }
        Ok(())
    }

    /// Raw ciphertext at `index`
    pub fn get(&self, index: usize) -> ProtocolResult<Option<&[u8]>> {
        self.check(index)?;
        Ok(self.slots[index].as_deref())
    }

    /// Overwrite the ciphertext at `index`
    pub fn set(&mut self, index: usize, ciphertext: Vec<u8>) -> ProtocolResult<()> {
        self.check(index)?;
        self.slots[index] = Some(ciphertext);
        Ok(())
    }

    /// Number of filled slots
    pub fn filled(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn stored(&self) -> StoredBlock {
        StoredBlock {
            capacity: self.slots.len() as u32,
            entries: self
                .slots
                .iter()
                .enumerate()
                .filter_map(|(i, slot)| slot.as_ref().map(|ct| (i as u32, ct.clone())))
                .collect(),
        }
    }

    /// Canonical bytes covered by the integrity tag
    ///
    /// `u32_be(index) || u32_be(len) || ciphertext` per filled slot in
    /// ascending order, then `u32_be(capacity)`.
    pub fn canonical(&self) -> Vec<u8> {
        self.stored().canonical()
    }

    /// Integrity tag under `keys`
    pub fn tag(&self, keys: &KeyHandler) -> [u8; INTEGRITY_TAG_SIZE] {
        keys.integrity_tag(&self.canonical())
    }

    /// Tagged blob
    pub fn serialize(&self, keys: &KeyHandler) -> ProtocolResult<Vec<u8>> {
        let stored = self.stored();
        let mut out = codec().serialize(&stored)?;
        out.extend_from_slice(&keys.integrity_tag(&stored.canonical()));
        Ok(out)
    }

    /// Verify and rebuild a block from a tagged blob
    ///
    /// The body must decode exactly, trailing bytes before the tag included.
    pub fn deserialize(bytes: &[u8], keys: &KeyHandler) -> ProtocolResult<Self> {
        if bytes.len() < INTEGRITY_TAG_SIZE {
            return Err(integrity_violation("record shorter than its tag"));
        }
        let (body, tag) = bytes.split_at(bytes.len() - INTEGRITY_TAG_SIZE);

        let stored: StoredBlock = codec()
            .deserialize(body)
            .map_err(|e| integrity_violation(&format!("undecodable record: {}", e)))?;

        let capacity = stored.capacity as usize;
        if capacity == 0 || capacity > MAX_CAPACITY {
            return Err(integrity_violation(&format!(
                "declared capacity {} out of bounds",
                capacity
            )));
        }
        if let Some((&index, _)) = stored.entries.iter().next_back() {
            if index as usize >= capacity {
                return Err(integrity_violation(&format!(
                    "entry {} beyond capacity {}",
                    index, capacity
                )));
            }
        }

        if !keys.verify_tag(&stored.canonical(), tag) {
            return Err(integrity_violation("tag mismatch"));
        }

        let mut slots = vec![None; capacity];
        for (index, ct) in stored.entries {
            slots[index as usize] = Some(ct);
        }
        Ok(Self { slots })
    }
}

impl StoredBlock {
    fn canonical(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (index, ct) in &self.entries {
            out.extend_from_slice(&index.to_be_bytes());
            out.extend_from_slice(&(ct.len() as u32).to_be_bytes());
            out.extend_from_slice(ct);
        }
        out.extend_from_slice(&self.capacity.to_be_bytes());
        out
    }
}

/// Fixed-width bincode that refuses bytes left over after the value
pub(crate) fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

fn integrity_violation(detail: &str) -> ProtocolError {
    tracing::error!("Record integrity check failed: {}", detail);
    ProtocolError::IntegrityViolation(detail.to_string())
}

/// InfoBlock whose fields are layer-encrypted with a borrowed key handler
pub struct SecretInfoBlock<'a> {
    block: InfoBlock,
    keys: &'a KeyHandler,
}

impl<'a> SecretInfoBlock<'a> {
    /// Empty block with `capacity` fields
    pub fn new(capacity: usize, keys: &'a KeyHandler) -> ProtocolResult<Self> {
        Ok(Self {
            block: InfoBlock::new(capacity)?,
            keys,
        })
    }

    /// Block holding `fields` in order, capacity equal to their count
    pub fn from_fields<T: AsRef<[u8]>>(fields: &[T], keys: &'a KeyHandler) -> ProtocolResult<Self> {
        let mut block = Self::new(fields.len(), keys)?;
        for (index, field) in fields.iter().enumerate() {
            block.set(index, field.as_ref())?;
        }
        Ok(block)
    }

    /// Declared number of fields
    pub fn capacity(&self) -> usize {
        self.block.capacity()
    }

    /// Decrypt the field at `index`
    pub fn get(&self, index: usize) -> ProtocolResult<Option<Vec<u8>>> {
        match self.block.get(index)? {
            Some(ct) => self.keys.decrypt_layered(ct).map(Some),
            None => Ok(None),
        }
    }

    /// Encrypt and store the field at `index`
    pub fn set(&mut self, index: usize, value: &[u8]) -> ProtocolResult<()> {
        // bound check before paying for the encryption
        self.block.get(index)?;
        let ct = self.keys.encrypt_layered(value)?;
        self.block.set(index, ct)
    }

    /// Every field decrypted, empty slots as `None`
    pub fn fields(&self) -> ProtocolResult<Vec<Option<Vec<u8>>>> {
        (0..self.capacity()).map(|i| self.get(i)).collect()
    }

    /// Underlying ciphertext block
    pub fn block(&self) -> &InfoBlock {
        &self.block
    }

    /// Tagged blob; the key handler is not included
    pub fn serialize(&self) -> ProtocolResult<Vec<u8>> {
        self.block.serialize(self.keys)
    }

    /// Verify a blob against `keys` and bind it to them
    pub fn deserialize(bytes: &[u8], keys: &'a KeyHandler) -> ProtocolResult<Self> {
        Ok(Self {
            block: InfoBlock::deserialize(bytes, keys)?,
            keys,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MasterSecret;
    use crate::keyhandler::LayerSuite;
    use crate::MASTER_SECRET_SIZE;

    fn keys() -> KeyHandler {
        let ms = MasterSecret::from_slice(&[3u8; MASTER_SECRET_SIZE]).unwrap();
        KeyHandler::new(&ms, &LayerSuite::default()).unwrap()
    }

    #[test]
    fn test_set_get_roundtrip() {
        let keys = keys();
        let mut block = SecretInfoBlock::new(3, &keys).unwrap();
        block.set(0, b"website").unwrap();
        block.set(2, b"p4ss;w0rd").unwrap();

        assert_eq!(block.get(0).unwrap().as_deref(), Some(&b"website"[..]));
        assert_eq!(block.get(1).unwrap(), None);
        assert_eq!(block.get(2).unwrap().as_deref(), Some(&b"p4ss;w0rd"[..]));
    }

    #[test]
    fn test_stored_fields_are_not_plaintext() {
        let keys = keys();
        let block = SecretInfoBlock::from_fields(&["hunter2hunter2"], &keys).unwrap();
        let blob = block.serialize().unwrap();
        assert!(!blob.windows(14).any(|w| w == b"hunter2hunter2"));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let keys = keys();
        let block = SecretInfoBlock::from_fields(&["login", "alice", "s3cret"], &keys).unwrap();
        let blob = block.serialize().unwrap();

        let restored = SecretInfoBlock::deserialize(&blob, &keys).unwrap();
        assert_eq!(restored.capacity(), 3);
        assert_eq!(restored.fields().unwrap(), block.fields().unwrap());
    }

    #[test]
    fn test_any_flipped_body_byte_is_detected() {
        let keys = keys();
        let mut block = SecretInfoBlock::new(4, &keys).unwrap();
        block.set(1, b"a").unwrap();
        block.set(3, b"bc").unwrap();
        let blob = block.serialize().unwrap();

        for i in 0..blob.len() - INTEGRITY_TAG_SIZE {
            let mut tampered = blob.clone();
            tampered[i] ^= 0x01;
            let result = SecretInfoBlock::deserialize(&tampered, &keys);
            assert!(
                matches!(result, Err(ProtocolError::IntegrityViolation(_))),
                "flip at byte {} went unnoticed",
                i
            );
        }
    }

    #[test]
    fn test_bytes_spliced_before_tag_are_detected() {
        let keys = keys();
        let blob = SecretInfoBlock::from_fields(&["x"], &keys)
            .unwrap()
            .serialize()
            .unwrap();

        let split = blob.len() - INTEGRITY_TAG_SIZE;
        let mut tampered = blob[..split].to_vec();
        tampered.extend_from_slice(b"INJECTED");
        tampered.extend_from_slice(&blob[split..]);

        assert!(matches!(
            SecretInfoBlock::deserialize(&tampered, &keys),
            Err(ProtocolError::IntegrityViolation(_))
        ));
    }

    #[test]
    fn test_canonical_matches_serialized_tag() {
        let keys = keys();
        let mut block = InfoBlock::new(3).unwrap();
        block.set(2, b"ct".to_vec()).unwrap();
        let blob = block.serialize(&keys).unwrap();

        let tag = &blob[blob.len() - INTEGRITY_TAG_SIZE..];
        assert!(keys.verify_tag(&block.canonical(), tag));
    }

    #[test]
    fn test_tampered_tag_is_detected() {
        let keys = keys();
        let block = SecretInfoBlock::from_fields(&["x"], &keys).unwrap();
        let mut blob = block.serialize().unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x80;

        assert!(matches!(
            SecretInfoBlock::deserialize(&blob, &keys),
            Err(ProtocolError::IntegrityViolation(_))
        ));
    }

    #[test]
    fn test_wrong_keys_fail_integrity() {
        let keys = keys();
        let other_ms = MasterSecret::from_slice(&[4u8; MASTER_SECRET_SIZE]).unwrap();
        let other = KeyHandler::new(&other_ms, &LayerSuite::default()).unwrap();

        let blob = SecretInfoBlock::from_fields(&["x"], &keys).unwrap().serialize().unwrap();
        assert!(matches!(
            SecretInfoBlock::deserialize(&blob, &other),
            Err(ProtocolError::IntegrityViolation(_))
        ));
    }

    #[test]
    fn test_short_and_garbage_blobs() {
        let keys = keys();
        assert!(matches!(
            InfoBlock::deserialize(&[0u8; 10], &keys),
            Err(ProtocolError::IntegrityViolation(_))
        ));
        assert!(matches!(
            InfoBlock::deserialize(&[0xFFu8; 100], &keys),
            Err(ProtocolError::IntegrityViolation(_))
        ));
    }

    #[test]
    fn test_tag_independent_of_insertion_order() {
        let keys = keys();
        let values: Vec<(usize, Vec<u8>)> = vec![
            (0, b"zero".to_vec()),
            (4, b"four".to_vec()),
            (2, b"two".to_vec()),
            (5, b"five".to_vec()),
        ];

        let mut forward = InfoBlock::new(6).unwrap();
        for (i, v) in &values {
            forward.set(*i, v.clone()).unwrap();
        }
        let mut backward = InfoBlock::new(6).unwrap();
        for (i, v) in values.iter().rev() {
            backward.set(*i, v.clone()).unwrap();
        }

        assert_eq!(forward.tag(&keys), backward.tag(&keys));
        assert_eq!(
            forward.serialize(&keys).unwrap(),
            backward.serialize(&keys).unwrap()
        );
    }

    #[test]
    fn test_capacity_is_part_of_tag() {
        let keys = keys();
        let small = InfoBlock::new(2).unwrap();
        let large = InfoBlock::new(3).unwrap();
        assert_ne!(small.tag(&keys), large.tag(&keys));
    }

    #[test]
    fn test_bounds_for_every_capacity() {
        let keys = keys();
        for capacity in [1usize, 2, 3, 7, 32] {
            let mut block = SecretInfoBlock::new(capacity, &keys).unwrap();
            for index in [capacity, capacity + 1, usize::MAX] {
                assert!(matches!(
                    block.get(index),
                    Err(ProtocolError::OutOfRangeAccess { .. })
                ));
                assert!(matches!(
                    block.set(index, b"x"),
                    Err(ProtocolError::OutOfRangeAccess { .. })
                ));
            }
            block.set(capacity - 1, b"last").unwrap();
        }
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            InfoBlock::new(0),
            Err(ProtocolError::InvalidConfiguration(_))
        ));
        assert!(InfoBlock::new(MAX_CAPACITY + 1).is_err());
    }
}
