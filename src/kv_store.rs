use std::convert::TryInto;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;

use log::{debug, info};
use md5::{Digest, Md5};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::blob_store::BlobStore;
use crate::error::{KvError, KvResult};

const SLOT_LEN: u64 = 16;
const INITIAL_SLOTS: u64 = 8;
/// Sentinel `vptr` marking a deleted slot. Distinct from the `(0, 0)`
/// empty sentinel so a probe chain broken by a delete still terminates
/// correctly at later lookups (see crate-level docs for the rationale).
const TOMBSTONE_VPTR: u64 = u64::MAX;

/// First 8 bytes (little-endian) of the MD5 digest of `bytes`, used as the
/// 64-bit hash driving the probe sequence. MD5 is chosen for its
/// availability and stable output, not for any security property.
fn hash_bytes(bytes: &[u8]) -> u64 {
    let digest = Md5::digest(bytes);
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[0..8]);
    u64::from_le_bytes(buf)
}

/// Advances one step of the shared probe sequence: `i' = (5i + perturb +
/// 1) mod m`, `perturb' = perturb >> 5`.
fn probe_step(i: u64, perturb: u64, m: u64) -> (u64, u64) {
    let next_i = 5u64
        .wrapping_mul(i)
        .wrapping_add(perturb)
        .wrapping_add(1)
        % m;
    (next_i, perturb >> 5)
}

enum SlotState {
    Empty,
    Tombstone,
    Live(u64, u64),
}

fn slot_state(kptr: u64, vptr: u64) -> SlotState {
    if kptr == 0 && vptr == 0 {
        SlotState::Empty
    } else if kptr == 0 && vptr == TOMBSTONE_VPTR {
        SlotState::Tombstone
    } else {
        SlotState::Live(kptr, vptr)
    }
}

enum Probe {
    Hit(u64),
    Miss(u64),
}

/// A disk-backed associative array. Keys and values are serialized with
/// `bincode` into opaque bytes, which are then stored by a [`BlobStore`];
/// a second file holds an open-addressed hash index of `(key-blob-offset,
/// value-blob-offset)` slot pairs that doubles in place when it saturates.
///
/// `K` and `V` must serialize deterministically: equal logical keys must
/// produce byte-identical encodings, since the index hashes and compares
/// the encoded bytes, not the original values.
pub struct KvStore<K, V> {
    idx_file: File,
    blob_store: BlobStore,
    m: u64,
    empty_slots: u64,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> KvStore<K, V>
where
    K: Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
{
    /// Opens a store over an index file and a blob file. If the index file
    /// is empty it is extended to 8 slots (128 bytes); `empty_slots` is
    /// then recomputed by scanning every slot.
    pub fn open(mut idx_file: File, blob_file: File) -> KvResult<Self> {
        let idx_len = idx_file.seek(SeekFrom::End(0))?;
        if idx_len == 0 {
            idx_file.seek(SeekFrom::Start(0))?;
            idx_file.write_all(&vec![0u8; (INITIAL_SLOTS * SLOT_LEN) as usize])?;
            idx_file.flush()?;
        }
        let idx_len = idx_file.seek(SeekFrom::End(0))?;
        let m = idx_len / SLOT_LEN;

        let blob_store = BlobStore::open(blob_file)?;
        let mut store = KvStore {
            idx_file,
            blob_store,
            m,
            empty_slots: 0,
            _marker: PhantomData,
        };
        store.empty_slots = store.count_empty_slots()?;
        debug!(
            "kv_store: opened with {} slots, {} empty",
            store.m, store.empty_slots
        );
        Ok(store)
    }

    fn count_empty_slots(&mut self) -> KvResult<u64> {
        let mut count = 0;
        for i in 0..self.m {
            let (kptr, vptr) = self.read_slot(i)?;
            if kptr == 0 && vptr == 0 {
                count += 1;
            }
        }
        Ok(count)
    }

    fn read_slot(&mut self, i: u64) -> KvResult<(u64, u64)> {
        self.idx_file.seek(SeekFrom::Start(i * SLOT_LEN))?;
        let mut buf = [0u8; SLOT_LEN as usize];
        self.idx_file.read_exact(&mut buf)?;
        let kptr = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let vptr = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        Ok((kptr, vptr))
    }

    fn write_slot(&mut self, i: u64, kptr: u64, vptr: u64) -> KvResult<()> {
        self.idx_file.seek(SeekFrom::Start(i * SLOT_LEN))?;
        let mut buf = [0u8; SLOT_LEN as usize];
        buf[0..8].copy_from_slice(&kptr.to_le_bytes());
        buf[8..16].copy_from_slice(&vptr.to_le_bytes());
        self.idx_file.write_all(&buf)?;
        self.idx_file.flush()?;
        Ok(())
    }

    /// Probes the table for `key_bytes`, stopping at the first empty slot
    /// (absence) or the first slot whose stored key bytes match (presence).
    /// Tombstoned slots are passed through silently.
    fn find_slot(&mut self, key_bytes: &[u8]) -> KvResult<Probe> {
        let hash = hash_bytes(key_bytes);
        let mut i = hash % self.m;
        let mut perturb = hash;
        loop {
            let (kptr, vptr) = self.read_slot(i)?;
            match slot_state(kptr, vptr) {
                SlotState::Empty => return Ok(Probe::Miss(i)),
                SlotState::Tombstone => {}
                SlotState::Live(kptr, _) => {
                    let stored_key = self.blob_store.get(kptr)?;
                    if stored_key == key_bytes {
                        return Ok(Probe::Hit(i));
                    }
                }
            }
            let (next_i, next_perturb) = probe_step(i, perturb, self.m);
            i = next_i;
            perturb = next_perturb;
        }
    }

    /// Stores or replaces the value for `key`. On overwrite, the previous
    /// value blob is deleted once the slot points at the new one; the key
    /// blob is kept.
    pub fn set(&mut self, key: K, value: V) -> KvResult<()> {
        let key_bytes = bincode::serialize(&key)?;
        let value_bytes = bincode::serialize(&value)?;

        match self.find_slot(&key_bytes)? {
            Probe::Hit(i) => {
                let (kptr, old_vptr) = self.read_slot(i)?;
                let new_vptr = self.blob_store.add(&value_bytes)?;
                self.write_slot(i, kptr, new_vptr)?;
                self.blob_store.delete(old_vptr)?;
            }
            Probe::Miss(i) => {
                let kptr = self.blob_store.add(&key_bytes)?;
                let vptr = self.blob_store.add(&value_bytes)?;
                self.write_slot(i, kptr, vptr)?;
                self.decrement_empty_slots()?;
            }
        }
        Ok(())
    }

    /// Returns the value for `key`, or [`KvError::NotFound`] if absent.
    pub fn get(&mut self, key: &K) -> KvResult<V> {
        let key_bytes = bincode::serialize(key)?;
        match self.find_slot(&key_bytes)? {
            Probe::Hit(i) => {
                let (_, vptr) = self.read_slot(i)?;
                let value_bytes = self.blob_store.get(vptr)?;
                Ok(bincode::deserialize(&value_bytes)?)
            }
            Probe::Miss(_) => Err(KvError::NotFound),
        }
    }

    /// Returns whether `key` has a live slot.
    pub fn contains(&mut self, key: &K) -> KvResult<bool> {
        let key_bytes = bincode::serialize(key)?;
        Ok(matches!(self.find_slot(&key_bytes)?, Probe::Hit(_)))
    }

    /// Removes `key`, or fails with [`KvError::NotFound`] if absent. The
    /// slot is marked with a tombstone sentinel rather than zeroed, so
    /// probe chains through it stay intact for other keys.
    pub fn delete(&mut self, key: &K) -> KvResult<()> {
        let key_bytes = bincode::serialize(key)?;
        match self.find_slot(&key_bytes)? {
            Probe::Hit(i) => {
                let (kptr, vptr) = self.read_slot(i)?;
                self.write_slot(i, 0, TOMBSTONE_VPTR)?;
                self.blob_store.delete(kptr)?;
                self.blob_store.delete(vptr)?;
                Ok(())
            }
            Probe::Miss(_) => Err(KvError::NotFound),
        }
    }

    fn decrement_empty_slots(&mut self) -> KvResult<()> {
        self.empty_slots -= 1;
        if self.empty_slots == 0 {
            self.grow()?;
        }
        Ok(())
    }

    /// Doubles the table in place. The file temporarily grows to `3 *
    /// m_old` slots: the existing `m_old` slots stay untouched at the
    /// start, and a fresh `m_new` (`= 2 * m_old`)-sized scratch region is
    /// appended after them, at physical offset `m_old`. Every live slot
    /// in the untouched lower region is rehashed into that scratch region
    /// (addressed as an independent `m_new`-sized table based at `m_old`),
    /// after which the scratch region is slid down to the start of the
    /// file and the file is truncated to `m_new` slots.
    fn grow(&mut self) -> KvResult<()> {
        let m_old = self.m;
        let m_new = m_old * 2;
        info!("kv_store: growing index from {} to {} slots", m_old, m_new);

        self.idx_file.seek(SeekFrom::End(0))?;
        self.idx_file
            .write_all(&vec![0u8; (m_new * SLOT_LEN) as usize])?;
        self.idx_file.flush()?;

        let mut live_count = 0u64;
        for i in 0..m_old {
            let (kptr, vptr) = self.read_slot(i)?;
            let (kptr, vptr) = match slot_state(kptr, vptr) {
                SlotState::Empty | SlotState::Tombstone => continue,
                SlotState::Live(kptr, vptr) => (kptr, vptr),
            };
            live_count += 1;

            let key_bytes = self.blob_store.get(kptr)?;
            let hash = hash_bytes(&key_bytes);
            let mut j = hash % m_new;
            let mut perturb = hash;
            loop {
                let (existing_k, existing_v) = self.read_slot(j + m_old)?;
                if existing_k == 0 && existing_v == 0 {
                    self.write_slot(j + m_old, kptr, vptr)?;
                    break;
                }
                let (next_j, next_perturb) = probe_step(j, perturb, m_new);
                j = next_j;
                perturb = next_perturb;
            }
        }

        // Compact: the scratch region [m_old, m_old + m_new) now holds the
        // whole new table; slide it down to the start of the file.
        self.idx_file.seek(SeekFrom::Start(m_old * SLOT_LEN))?;
        let mut scratch = vec![0u8; (m_new * SLOT_LEN) as usize];
        self.idx_file.read_exact(&mut scratch)?;
        self.idx_file.seek(SeekFrom::Start(0))?;
        self.idx_file.write_all(&scratch)?;
        self.idx_file.set_len(m_new * SLOT_LEN)?;
        self.idx_file.flush()?;

        self.m = m_new;
        // Tombstoned slots in the old lower half are dropped by the
        // rehash loop above (they migrate nothing), so empty_slots is
        // m_new minus however many entries were actually live -- not
        // simply m_old, which only holds when there were no tombstones.
        self.empty_slots = m_new - live_count;
        Ok(())
    }

    /// Collects every live key.
    pub fn keys(&mut self) -> KvResult<Vec<K>> {
        let mut out = Vec::new();
        for i in 0..self.m {
            let (kptr, vptr) = self.read_slot(i)?;
            if let SlotState::Live(kptr, _) = slot_state(kptr, vptr) {
                let key_bytes = self.blob_store.get(kptr)?;
                out.push(bincode::deserialize(&key_bytes)?);
            }
        }
        Ok(out)
    }

    /// Collects every live `(key, value)` pair.
    pub fn iter(&mut self) -> KvResult<Vec<(K, V)>> {
        let mut out = Vec::new();
        for i in 0..self.m {
            let (kptr, vptr) = self.read_slot(i)?;
            if let SlotState::Live(kptr, vptr) = slot_state(kptr, vptr) {
                let key_bytes = self.blob_store.get(kptr)?;
                let value_bytes = self.blob_store.get(vptr)?;
                out.push((bincode::deserialize(&key_bytes)?, bincode::deserialize(&value_bytes)?));
            }
        }
        Ok(out)
    }

    /// The current number of index slots. Always a power of two, `>= 8`.
    pub fn capacity(&self) -> u64 {
        self.m
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempfile;

    fn store() -> KvStore<String, String> {
        let _ = env_logger::builder().is_test(true).try_init();
        KvStore::open(tempfile().unwrap(), tempfile().unwrap()).unwrap()
    }

    #[test]
    fn scenario_s3_round_trip_and_delete() {
        let mut kv = store();
        kv.set("test".to_owned(), "string".to_owned()).unwrap();
        kv.set("test2".to_owned(), "the other string".to_owned())
            .unwrap();

        assert_eq!(kv.get(&"test".to_owned()).unwrap(), "string");
        kv.delete(&"test".to_owned()).unwrap();
        assert!(!kv.contains(&"test".to_owned()).unwrap());
        assert!(matches!(kv.get(&"test".to_owned()), Err(KvError::NotFound)));
    }

    #[test]
    fn overwrite_keeps_latest_value() {
        let mut kv = store();
        kv.set("k".to_owned(), "v1".to_owned()).unwrap();
        kv.set("k".to_owned(), "v2".to_owned()).unwrap();
        assert_eq!(kv.get(&"k".to_owned()).unwrap(), "v2");
    }

    #[test]
    fn delete_missing_key_is_not_found() {
        let mut kv = store();
        assert!(matches!(kv.delete(&"nope".to_owned()), Err(KvError::NotFound)));
    }

    #[test]
    fn growth_accounts_for_tombstones_in_old_table() {
        let mut kv = store();
        for i in 0..7 {
            kv.set(format!("key{}", i), format!("value{}", i)).unwrap();
        }
        assert_eq!(kv.capacity(), 8);
        assert_eq!(kv.empty_slots, 1);

        kv.delete(&"key0".to_owned()).unwrap();
        assert_eq!(kv.empty_slots, 1); // tombstone, not a true empty slot

        // Consumes the last true-empty slot and triggers grow(): the old
        // table now has 6 live keys (key1..key6) and one tombstone
        // (key0's former slot), not 7 live keys.
        kv.set("key7".to_owned(), "value7".to_owned()).unwrap();
        assert_eq!(kv.capacity(), 16);

        let expected = kv.count_empty_slots().unwrap();
        assert_eq!(kv.empty_slots, expected);
        assert_eq!(kv.empty_slots, 9); // 16 - 7 live (key1..key7)

        for i in 1..8 {
            assert_eq!(kv.get(&format!("key{}", i)).unwrap(), format!("value{}", i));
        }
        assert!(!kv.contains(&"key0".to_owned()).unwrap());
    }

    #[test]
    fn scenario_s4_growth_doubles_table() {
        let mut kv = store();
        assert_eq!(kv.capacity(), 8);
        for i in 0..9 {
            kv.set(format!("key{}", i), format!("value{}", i)).unwrap();
        }
        assert_eq!(kv.capacity(), 16);
        assert_eq!(kv.empty_slots, 7);
        for i in 0..9 {
            assert_eq!(kv.get(&format!("key{}", i)).unwrap(), format!("value{}", i));
        }
    }

    #[test]
    fn scenario_s5_reopen_preserves_state() {
        let idx = tempfile().unwrap();
        let blob = tempfile().unwrap();
        let idx2 = idx.try_clone().unwrap();
        let blob2 = blob.try_clone().unwrap();

        {
            let mut kv: KvStore<String, String> = KvStore::open(idx, blob).unwrap();
            for i in 0..9 {
                kv.set(format!("key{}", i), format!("value{}", i)).unwrap();
            }
        }

        let mut reopened: KvStore<String, String> = KvStore::open(idx2, blob2).unwrap();
        let mut pairs = reopened.iter().unwrap();
        pairs.sort();
        let mut expected: Vec<(String, String)> =
            (0..9).map(|i| (format!("key{}", i), format!("value{}", i))).collect();
        expected.sort();
        assert_eq!(pairs, expected);
    }

    #[test]
    fn scenario_s6_probe_collision_resolution() {
        // Find two distinct small integers whose bincode-serialized,
        // hashed keys collide on i0 for an 8-slot table.
        let mut buckets: std::collections::HashMap<u64, String> = std::collections::HashMap::new();
        let (key_a, key_b) = 'search: loop {
            for n in 0u32..100_000 {
                let key = format!("collide{}", n);
                let bytes = bincode::serialize(&key).unwrap();
                let bucket = hash_bytes(&bytes) % 8;
                if let Some(other) = buckets.get(&bucket) {
                    if other != &key {
                        break 'search (other.clone(), key);
                    }
                } else {
                    buckets.insert(bucket, key);
                }
            }
            panic!("failed to find a colliding pair");
        };

        let mut kv = store();
        kv.set(key_a.clone(), "a".to_owned()).unwrap();
        kv.set(key_b.clone(), "b".to_owned()).unwrap();
        assert_eq!(kv.get(&key_a).unwrap(), "a");
        assert_eq!(kv.get(&key_b).unwrap(), "b");
    }

    #[test]
    fn delete_preserves_probe_chain_for_other_keys() {
        // Construct a, b that collide on i0, delete a, then confirm b is
        // still reachable -- this is exactly the chain-breaking hazard
        // that the tombstone sentinel is meant to fix.
        let mut buckets: std::collections::HashMap<u64, String> = std::collections::HashMap::new();
        let (key_a, key_b) = 'search: loop {
            for n in 0u32..100_000 {
                let key = format!("chain{}", n);
                let bytes = bincode::serialize(&key).unwrap();
                let bucket = hash_bytes(&bytes) % 8;
                if let Some(other) = buckets.get(&bucket) {
                    if other != &key {
                        break 'search (other.clone(), key);
                    }
                } else {
                    buckets.insert(bucket, key);
                }
            }
            panic!("failed to find a colliding pair");
        };

        let mut kv = store();
        kv.set(key_a.clone(), "a".to_owned()).unwrap();
        kv.set(key_b.clone(), "b".to_owned()).unwrap();
        kv.delete(&key_a).unwrap();
        assert_eq!(kv.get(&key_b).unwrap(), "b");
        assert!(!kv.contains(&key_a).unwrap());
    }
}
