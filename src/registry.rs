//! Key -> reference registry.
//!
//! The embedding side of the log: a fingerprint-sharded hash table mapping
//! a [`Key`] to the reference of the key's current object. It implements
//! [`EntryHandlers`], which is all the cleaner needs: objects are live
//! while the registry still points at them, tombstones are live while the
//! segment they reference still exists, and relocation retargets the
//! mapping under the shard lock so lookups never observe a dangling
//! reference.
//!
//! Liveness is monotonic per reference. `relocated` only rewrites a mapping
//! that still points at the old reference, and overwrites always install
//! fresh references, so a reference that has gone dead can never be judged
//! live again even against a concurrent re-append of the same key.

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::entry::{EntryType, Object, Tombstone};
use crate::key::Key;
use crate::log::{EntryHandlers, Log};
use crate::segment::Reference;
use crate::segment_manager::SegmentManager;

const DEFAULT_SHARDS: usize = 16;

#[derive(Debug)]
struct Slot {
    key: Key,
    reference: Reference,
}

/// Fingerprint-sharded map from [`Key`] to [`Reference`].
pub struct HashRegistry {
    /// Each shard is a locked vector, not a lock-free map: `relocated` must
    /// retarget a slot only while it still holds the old reference, and
    /// that conditional update has to be atomic with lookups and
    /// overwrites. The shard lock is that atomicity.
    shards: Vec<Mutex<Vec<Slot>>>,
    manager: OnceLock<Arc<SegmentManager>>,
}

impl Default for HashRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HashRegistry {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    pub fn with_shards(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::new(Vec::new())).collect(),
            manager: OnceLock::new(),
        }
    }

    /// Bind the registry to the log's segment manager so tombstone liveness
    /// can consult segment existence. Until bound, tombstones are presumed
    /// live (the conservative answer).
    pub fn bind(&self, manager: Arc<SegmentManager>) {
        let _ = self.manager.set(manager);
    }

    fn shard(&self, fingerprint: u64) -> &Mutex<Vec<Slot>> {
        &self.shards[(fingerprint as usize) % self.shards.len()]
    }

    /// Install `reference` as the current object for the key, returning the
    /// displaced reference, if any. The caller owns freeing the old entry.
    pub fn insert(&self, key: &Key, reference: Reference) -> Option<Reference> {
        let mut shard = self.shard(key.hash()).lock();
        for slot in shard.iter_mut() {
            if slot.key == *key {
                return Some(std::mem::replace(&mut slot.reference, reference));
            }
        }
        shard.push(Slot {
            key: key.clone(),
            reference,
        });
        None
    }

    pub fn lookup(&self, key: &Key) -> Option<Reference> {
        let shard = self.shard(key.hash()).lock();
        shard
            .iter()
            .find(|slot| slot.key == *key)
            .map(|slot| slot.reference)
    }

    pub fn remove(&self, key: &Key) -> Option<Reference> {
        let mut shard = self.shard(key.hash()).lock();
        let index = shard.iter().position(|slot| slot.key == *key)?;
        Some(shard.swap_remove(index).reference)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve a key to its current object, validating the entry against
    /// the key and retrying while a cleaner pass races the lookup.
    pub fn lookup_object(&self, log: &Log, key: &Key) -> Option<Object> {
        for _ in 0..8 {
            let reference = self.lookup(key)?;
            if let Ok((EntryType::Object, bytes)) = log.get_entry(reference) {
                if let Ok(object) = Object::decode(&bytes) {
                    if object.table_id == key.table_id() && object.key == key.key() {
                        return Some(object);
                    }
                }
            }
        }
        panic!(
            "registry and log disagree about a key in table {}",
            key.table_id()
        );
    }

    fn tombstone_segment_exists(&self, segment_id: u64) -> bool {
        match self.manager.get() {
            Some(manager) => manager.segment_exists(segment_id),
            None => true,
        }
    }
}

impl EntryHandlers for HashRegistry {
    fn is_live(&self, ty: EntryType, reference: Reference, entry: &[u8]) -> bool {
        match ty {
            EntryType::Object => match Object::decode(entry) {
                Ok(object) => {
                    let key = Key::new(object.table_id, object.key);
                    self.lookup(&key) == Some(reference)
                }
                Err(_) => false,
            },
            EntryType::Tombstone => match Tombstone::decode(entry) {
                Ok(tombstone) => self.tombstone_segment_exists(tombstone.segment_id),
                Err(_) => false,
            },
            EntryType::SegmentHeader | EntryType::SegmentFooter => false,
        }
    }

    fn relocated(&self, ty: EntryType, old: Reference, new: Reference, entry: &[u8]) {
        if ty != EntryType::Object {
            // Tombstones are not registered; their relocation needs no
            // external bookkeeping.
            return;
        }
        let object = match Object::decode(entry) {
            Ok(object) => object,
            Err(_) => return,
        };
        let key = Key::new(object.table_id, object.key);
        let mut shard = self.shard(key.hash()).lock();
        for slot in shard.iter_mut() {
            if slot.key == key && slot.reference == old {
                slot.reference = new;
                return;
            }
        }
        // The key was overwritten or deleted after the liveness check; the
        // relocated copy is dead on arrival, which the next pass reclaims.
    }

    fn timestamp(&self, ty: EntryType, entry: &[u8]) -> u32 {
        match ty {
            EntryType::Object => Object::decode(entry).map(|o| o.timestamp).unwrap_or(0),
            EntryType::Tombstone => Tombstone::decode(entry).map(|t| t.timestamp).unwrap_or(0),
            EntryType::SegmentHeader | EntryType::SegmentFooter => 0,
        }
    }
}
