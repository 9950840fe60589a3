//! The commit cache: staged operations for one transaction, ordered by
//! `(table_id, key_hash)`.
//!
//! The cache is a multimap in disguise. Two distinct user keys may share a
//! `CacheKey` (hash collision), and direct insertion never replaces an
//! existing entry, so each entry is keyed by `(CacheKey, seq)` where `seq`
//! is a per-cache insertion counter. Iteration order is therefore
//! `CacheKey` order with insertion order inside a collision chain, which
//! gives the participant list a canonical layout.
//!
//! From the moment the transaction starts committing the cache is frozen:
//! no insert or structural change happens, which is what makes the flat
//! positional cursor used by the phase batchers valid.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use strata_wire::{key_hash, OpKind, RejectRules};

use crate::error::{Result, TxError};

/// Routing identity of a staged operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
    pub table_id: u64,
    pub key_hash: u64,
}

impl CacheKey {
    pub fn new(table_id: u64, key: &[u8]) -> Self {
        CacheKey {
            table_id,
            key_hash: key_hash(key),
        }
    }
}

/// Full map key: routing identity plus insertion sequence for duplicate
/// tolerance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct EntryKey {
    cache: CacheKey,
    seq: u64,
}

/// Per-entry phase progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryState {
    Pending,
    Prepare,
    Decide,
}

/// Owned buffer holding the full user key and, for writes, the value.
///
/// The layout is exactly the write-op wire payload (`key_len:u16 ++ key ++
/// value`), so a write op can hand the whole buffer to the transport as one
/// zero-copy segment.
#[derive(Clone, Debug)]
pub struct ObjectBuf {
    key_len: u16,
    data: Bytes,
}

impl ObjectBuf {
    pub fn new(key: &[u8], value: &[u8]) -> Result<Self> {
        if key.len() > u16::MAX as usize {
            return Err(TxError::KeyTooLong(key.len()));
        }
        let mut buf = BytesMut::with_capacity(2 + key.len() + value.len());
        buf.put_u16_le(key.len() as u16);
        buf.put_slice(key);
        buf.put_slice(value);
        Ok(ObjectBuf {
            key_len: key.len() as u16,
            data: buf.freeze(),
        })
    }

    pub fn key_len(&self) -> u16 {
        self.key_len
    }

    pub fn key(&self) -> &[u8] {
        &self.data[2..2 + self.key_len as usize]
    }

    /// Shared view of the key bytes, for read/remove op payloads.
    pub fn key_bytes(&self) -> Bytes {
        self.data.slice(2..2 + self.key_len as usize)
    }

    pub fn value(&self) -> &[u8] {
        &self.data[2 + self.key_len as usize..]
    }

    /// Shared view of the value bytes.
    pub fn value_bytes(&self) -> Bytes {
        self.data.slice(2 + self.key_len as usize..)
    }

    /// The full `key_len ++ key ++ value` layout, for write op payloads.
    pub fn wire_bytes(&self) -> Bytes {
        self.data.clone()
    }

    pub fn wire_len(&self) -> u32 {
        self.data.len() as u32
    }
}

/// One staged operation.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub op: OpKind,
    pub object: ObjectBuf,
    pub reject_rules: Option<RejectRules>,
    /// Unique participant identifier, assigned when the commit protocol
    /// starts. Zero until then.
    pub rpc_id: u64,
    pub state: EntryState,
}

impl CacheEntry {
    pub fn new(op: OpKind, object: ObjectBuf) -> Self {
        CacheEntry {
            op,
            object,
            reject_rules: None,
            rpc_id: 0,
            state: EntryState::Pending,
        }
    }
}

/// Ordered map of staged operations for one transaction.
#[derive(Default)]
pub struct CommitCache {
    entries: BTreeMap<EntryKey, CacheEntry>,
    next_seq: u64,
}

impl CommitCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Locate the entry whose stored user key equals `key`.
    ///
    /// Starts at the lower bound for the `CacheKey` and scans forward while
    /// the `CacheKey` is unchanged, comparing stored keys; the first
    /// equality wins. Linear in the collision chain, which is fine because
    /// collisions are rare.
    pub fn find(&self, table_id: u64, key: &[u8]) -> Option<&CacheEntry> {
        let cache_key = CacheKey::new(table_id, key);
        self.entries
            .range(EntryKey { cache: cache_key, seq: 0 }..)
            .take_while(|(k, _)| k.cache == cache_key)
            .map(|(_, entry)| entry)
            .find(|entry| entry.object.key() == key)
    }

    pub fn find_mut(&mut self, table_id: u64, key: &[u8]) -> Option<&mut CacheEntry> {
        let cache_key = CacheKey::new(table_id, key);
        self.entries
            .range_mut(EntryKey { cache: cache_key, seq: 0 }..)
            .take_while(|(k, _)| k.cache == cache_key)
            .map(|(_, entry)| entry)
            .find(|entry| entry.object.key() == key)
    }

    /// Unconditionally insert a new entry. Never replaces an entry with an
    /// equal user key; dedup policy belongs to the staging layer.
    pub fn insert(
        &mut self,
        table_id: u64,
        key: &[u8],
        op: OpKind,
        value: &[u8],
    ) -> Result<&mut CacheEntry> {
        let cache_key = CacheKey::new(table_id, key);
        let entry = CacheEntry::new(op, ObjectBuf::new(key, value)?);
        Ok(self.push(cache_key, entry))
    }

    fn push(&mut self, cache_key: CacheKey, entry: CacheEntry) -> &mut CacheEntry {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries
            .entry(EntryKey {
                cache: cache_key,
                seq,
            })
            .or_insert(entry)
    }

    pub fn iter(&self) -> impl Iterator<Item = (CacheKey, &CacheEntry)> {
        self.entries.iter().map(|(k, entry)| (k.cache, entry))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (CacheKey, &mut CacheEntry)> {
        self.entries.iter_mut().map(|(k, entry)| (k.cache, entry))
    }

    /// Positional access in cache order. Positions are stable only while
    /// the cache is frozen, which holds for the whole commit protocol.
    pub fn entry_at(&self, pos: usize) -> Option<(CacheKey, &CacheEntry)> {
        self.iter().nth(pos)
    }

    pub fn entry_at_mut(&mut self, pos: usize) -> Option<(CacheKey, &mut CacheEntry)> {
        self.iter_mut().nth(pos)
    }
}
