use std::any::Any;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::config::Config;
use crate::errdata;
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::mfile::MFile;
use crate::refs::{BlockRef, INodeRef, BLOCK_REF_BYTES};
use crate::store::{BlockIter, BlockStore, Store};
use crate::trie::Trie;

/// The reserved all-zero map entry marking a free slot.
const FREE_SLOT: [u8; BLOCK_REF_BYTES] = [0u8; BLOCK_REF_BYTES];

fn is_free(slot: &[u8]) -> bool {
    slot.iter().all(|&b| b == 0)
}

/// A block store backed by two memory-mapped slot files: a data file of
/// block payloads and a map file recording which reference occupies each
/// slot. The map file alone is enough to rebuild the in-memory index on
/// open.
///
/// All mutation goes through a single writer lock; readers share a
/// copy-on-write index root, so lookups and iterators never block behind
/// a writer's critical section.
pub struct MfileBlockStore {
    inner: RwLock<Inner>,
    num_blocks: u64,
    block_size: u64,
    used: AtomicU64,
}

struct Inner {
    // None only after close or replacement has moved the files out.
    data: Option<MFile>,
    map: Option<MFile>,
    trie: Trie,
    last_free: u64,
    closed: bool,
    data_path: PathBuf,
    map_path: PathBuf,
    lock: Option<FileLock>,
    // NB: still room for improvement here. A persistent free list would
    // make allocation on a nearly full store cheaper than the linear probe.
}

impl Inner {
    fn data(&self) -> &MFile {
        self.data.as_ref().expect("open store holds its mfiles")
    }

    fn data_mut(&mut self) -> &mut MFile {
        self.data.as_mut().expect("open store holds its mfiles")
    }

    fn map(&self) -> &MFile {
        self.map.as_ref().expect("open store holds its mfiles")
    }

    fn map_mut(&mut self) -> &mut MFile {
        self.map.as_mut().expect("open store holds its mfiles")
    }

    /// Rotating linear probe for a free map slot, starting one past the
    /// last hit and wrapping once around. The hint is a best-effort
    /// cursor; losing it across restarts costs nothing but probe time.
    fn find_empty(&self) -> Option<u64> {
        let map = self.map();
        let n = map.num_slots();
        for i in 0..n {
            let slot = (i + self.last_free + 1) % n;
            if is_free(map.slot(slot)) {
                return Some(slot);
            }
        }
        None
    }
}

/// Rebuilds the block index by scanning the map file. Every nonzero
/// entry maps its reference bytes to its slot; a reference appearing
/// twice means the map file is corrupt.
fn load_trie(map: &MFile) -> Result<(Trie, u64)> {
    let mut txn = Trie::new().txn();
    let mut used = 0u64;
    for i in 0..map.num_slots() {
        let slot = map.slot(i);
        if is_free(slot) {
            continue;
        }
        if txn.insert(slot, i).is_some() {
            return errdata!(
                "duplicate reference ({}) in map file at slot {i}",
                BlockRef::from_bytes(slot)
            );
        }
        used += 1;
    }
    tracing::debug!(entries = used, slots = map.num_slots(), "block index loaded");
    Ok((txn.commit(), used))
}

impl MfileBlockStore {
    /// Opens the store named `name` under the configured data directory,
    /// creating its file pair if absent, and rebuilds the index from the
    /// map file.
    pub fn open(name: &str, cfg: &Config) -> Result<Self> {
        let num_blocks = cfg.storage_size.checked_div(cfg.block_size).unwrap_or(0);
        let dir = cfg.block_dir();
        fs::create_dir_all(&dir)?;

        let lock = FileLock::lock(cfg.lock_path(name))?;
        let data_path = cfg.data_path(name);
        let map_path = cfg.map_path(name);

        let data = MFile::open(&data_path, cfg.storage_size, cfg.block_size)?;
        let map = MFile::open(
            &map_path,
            num_blocks * BLOCK_REF_BYTES as u64,
            BLOCK_REF_BYTES as u64,
        )?;
        if data.num_slots() != map.num_slots() {
            panic!(
                "data and map files disagree on slot count: {} vs {}",
                data.num_slots(),
                map.num_slots()
            );
        }

        let (trie, used) = load_trie(&map)?;
        tracing::info!(
            name,
            kind = "mfile",
            used,
            total = num_blocks,
            "opened block store"
        );

        Ok(Self {
            inner: RwLock::new(Inner {
                data: Some(data),
                map: Some(map),
                trie,
                last_free: 0,
                closed: false,
                data_path,
                map_path,
                lock: Some(lock),
            }),
            num_blocks,
            block_size: cfg.block_size,
            used: AtomicU64::new(used),
        })
    }
}

impl Store for MfileBlockStore {
    fn kind(&self) -> &'static str {
        "mfile"
    }

    fn flush(&self) -> Result<()> {
        let inner = self.inner.read()?;
        if inner.closed {
            return Err(Error::Closed);
        }
        inner.data().flush()?;
        inner.map().flush()
    }

    fn close(&self) -> Result<()> {
        let mut inner = self.inner.write()?;
        if inner.closed {
            return Err(Error::Closed);
        }
        let mut data = inner.data.take().expect("open store holds its mfiles");
        let mut map = inner.map.take().expect("open store holds its mfiles");
        data.close()?;
        map.close()?;
        inner.closed = true;
        inner.lock = None;
        Ok(())
    }
}

impl BlockStore for MfileBlockStore {
    fn get_block(&self, bref: BlockRef) -> Result<Vec<u8>> {
        let inner = self.inner.read()?;
        if inner.closed {
            return Err(Error::Closed);
        }
        let key = bref.to_bytes();
        let Some(slot) = inner.trie.get(&key) else {
            return Err(Error::NotFound);
        };
        tracing::trace!(slot, block = %bref, "reading block");
        Ok(inner.data().slot(slot).to_vec())
    }

    fn write_block(&self, bref: BlockRef, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.write()?;
        if inner.closed {
            return Err(Error::Closed);
        }
        let Some(slot) = inner.find_empty() else {
            tracing::error!(block = %bref, "block store out of space");
            return Err(Error::OutOfSpace);
        };
        tracing::trace!(slot, block = %bref, "writing block");

        // Effect order matters for recoverability: payload first, then the
        // map entry, and the index root is published only at the end. A
        // crash before the map write leaves garbage in a still-free slot;
        // a crash after it is picked up by the scan on reopen.
        inner.data_mut().write_slot(slot, data)?;
        let key = bref.to_bytes();
        inner.map_mut().write_slot(slot, &key)?;
        inner.last_free = slot;

        let mut txn = inner.trie.txn();
        if txn.insert(&key, slot).is_some() {
            // Two live map slots now claim the same reference; continuing
            // would let them diverge silently.
            panic!("block {bref} already existed in the index");
        }
        self.used.fetch_add(1, Ordering::SeqCst);
        inner.trie = txn.commit();
        Ok(())
    }

    fn delete_block(&self, bref: BlockRef) -> Result<()> {
        let mut inner = self.inner.write()?;
        if inner.closed {
            return Err(Error::Closed);
        }
        let key = bref.to_bytes();
        let Some(slot) = inner.trie.get(&key) else {
            return Err(Error::NotFound);
        };
        tracing::trace!(slot, block = %bref, "deleting block");

        // Zero the map entry before touching the index: a crash in
        // between cannot resurrect the block on reopen.
        inner.map_mut().write_slot(slot, &FREE_SLOT)?;
        let mut txn = inner.trie.txn();
        if txn.delete(&key).is_none() {
            return errdata!("block {bref} present in index but not deletable");
        }
        self.used.fetch_sub(1, Ordering::SeqCst);
        inner.trie = txn.commit();
        Ok(())
    }

    fn delete_inode_blocks(&self, iref: INodeRef) -> Result<()> {
        let mut inner = self.inner.write()?;
        if inner.closed {
            return Err(Error::Closed);
        }

        // The inode encoding is a strict prefix of its blocks' encodings,
        // so a prefix scan finds exactly the inode's blocks.
        let victims: Vec<(Vec<u8>, u64)> = inner.trie.iter_prefix(&iref.to_bytes()).collect();
        for (_, slot) in &victims {
            inner.map_mut().write_slot(*slot, &FREE_SLOT)?;
        }
        let mut txn = inner.trie.txn();
        for (key, _) in &victims {
            txn.delete(key);
        }
        self.used.fetch_sub(victims.len() as u64, Ordering::SeqCst);
        inner.trie = txn.commit();
        tracing::debug!(inode = %iref, removed = victims.len(), "deleted inode blocks");
        Ok(())
    }

    fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    fn used_blocks(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    fn block_iterator(&self) -> Result<BlockIter> {
        let inner = self.inner.read()?;
        if inner.closed {
            return Err(Error::Closed);
        }
        let snapshot = inner.trie.clone();
        Ok(Box::new(
            snapshot
                .iter()
                .map(|(key, _)| Ok(BlockRef::from_bytes(&key))),
        ))
    }

    fn replace_store(&self, other: Box<dyn BlockStore>) -> Result<Box<dyn BlockStore>> {
        let other = other
            .into_any()
            .downcast::<MfileBlockStore>()
            .map_err(|_| Error::WrongBackend("replacement store is not mfile-backed".into()))?;

        let mut inner = self.inner.write()?;
        let mut new_inner = other.inner.write()?;
        if inner.closed || new_inner.closed {
            return Err(Error::Closed);
        }

        fs::remove_file(&inner.data_path)?;
        fs::remove_file(&inner.map_path)?;
        fs::rename(&new_inner.map_path, &inner.map_path)?;
        fs::rename(&new_inner.data_path, &inner.data_path)?;
        tracing::info!(
            kind = "mfile",
            data = %inner.data_path.display(),
            "replaced block store files"
        );

        // The returned store takes the replacement's mapped files and
        // index, but lives at this store's paths and keeps its lock.
        let out = MfileBlockStore {
            inner: RwLock::new(Inner {
                data: new_inner.data.take(),
                map: new_inner.map.take(),
                trie: new_inner.trie.clone(),
                last_free: new_inner.last_free,
                closed: false,
                data_path: inner.data_path.clone(),
                map_path: inner.map_path.clone(),
                lock: inner.lock.take(),
            }),
            num_blocks: other.num_blocks,
            block_size: other.block_size,
            used: AtomicU64::new(other.used.load(Ordering::SeqCst)),
        };

        // Both originals are dead: the replacement's handles moved into
        // the returned store, and this store's reference unlinked files.
        // The replacement's lock file is removed along with its lock; the
        // returned store keeps this store's.
        new_inner.closed = true;
        if let Some(lock) = new_inner.lock.take() {
            let _ = fs::remove_file(lock.path());
        }
        if let Some(mut data) = inner.data.take() {
            data.close()?;
        }
        if let Some(mut map) = inner.map.take() {
            map.close()?;
        }
        inner.closed = true;

        Ok(Box::new(out))
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::path::Path;

    const BLOCK_SIZE: u64 = 4096;

    fn test_config(dir: &Path) -> Config {
        // Four slots: enough to exercise allocation, wrap and overflow.
        Config::new(dir)
            .storage_size(4 * BLOCK_SIZE)
            .block_size(BLOCK_SIZE)
    }

    fn open_store(dir: &Path, name: &str) -> MfileBlockStore {
        MfileBlockStore::open(name, &test_config(dir)).expect("open store")
    }

    fn payload(byte: u8) -> Vec<u8> {
        vec![byte; BLOCK_SIZE as usize]
    }

    fn bref(volume: u64, inode: u64, index: u64) -> BlockRef {
        BlockRef::new(volume, inode, index)
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = open_store(dir.path(), "default");

        assert_eq!(store.num_blocks(), 4);
        assert_eq!(store.used_blocks(), 0);

        store
            .write_block(bref(1, 1, 0), &payload(0x41))
            .expect("write block");
        assert_eq!(store.used_blocks(), 1);
        assert_eq!(store.get_block(bref(1, 1, 0)).expect("get block"), payload(0x41));
    }

    #[test]
    fn test_fill_and_overflow() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = open_store(dir.path(), "default");

        for index in 0..4 {
            store
                .write_block(bref(1, 1, index), &payload(index as u8))
                .expect("write block");
        }
        assert_eq!(store.used_blocks(), 4);

        let result = store.write_block(bref(1, 1, 4), &payload(9));
        assert_eq!(result, Err(Error::OutOfSpace));
        assert_eq!(store.used_blocks(), 4);

        for index in 0..4 {
            assert_eq!(
                store.get_block(bref(1, 1, index)).expect("get block"),
                payload(index as u8)
            );
        }
    }

    #[test]
    fn test_slot_reuse_after_delete() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = open_store(dir.path(), "default");

        for index in 0..4 {
            store
                .write_block(bref(1, 1, index), &payload(index as u8))
                .expect("write block");
        }
        store.delete_block(bref(1, 1, 2)).expect("delete block");
        assert_eq!(store.used_blocks(), 3);

        // The freed slot is found again even though the probe cursor has
        // moved past it.
        store
            .write_block(bref(1, 1, 9), &payload(0x99))
            .expect("write into freed slot");
        assert_eq!(store.used_blocks(), 4);
        assert_eq!(store.get_block(bref(1, 1, 9)).expect("get block"), payload(0x99));
    }

    #[test]
    fn test_delete_inode_blocks_removes_exactly_the_inode() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = open_store(dir.path(), "default");

        store.write_block(bref(1, 1, 0), &payload(1)).expect("write");
        store.write_block(bref(1, 1, 1), &payload(2)).expect("write");
        store.write_block(bref(1, 2, 0), &payload(3)).expect("write");
        store.write_block(bref(2, 1, 0), &payload(4)).expect("write");

        store
            .delete_inode_blocks(INodeRef::new(1, 1))
            .expect("delete inode blocks");

        assert_eq!(store.used_blocks(), 2);
        assert_eq!(store.get_block(bref(1, 1, 0)), Err(Error::NotFound));
        assert_eq!(store.get_block(bref(1, 1, 1)), Err(Error::NotFound));
        assert_eq!(store.get_block(bref(1, 2, 0)).expect("get"), payload(3));
        assert_eq!(store.get_block(bref(2, 1, 0)).expect("get"), payload(4));

        // An inode with no blocks left deletes to no effect.
        store
            .delete_inode_blocks(INodeRef::new(1, 1))
            .expect("idempotent inode delete");
        assert_eq!(store.used_blocks(), 2);
    }

    #[test]
    fn test_reopen_preserves_blocks() {
        let dir = tempfile::tempdir().expect("temp dir");

        {
            let store = open_store(dir.path(), "persist");
            store
                .write_block(bref(5, 7, 3), &payload(0x5a))
                .expect("write block");
            store.flush().expect("flush");
            store.close().expect("close");
        }

        let store = open_store(dir.path(), "persist");
        assert_eq!(store.used_blocks(), 1);
        assert_eq!(store.get_block(bref(5, 7, 3)).expect("get block"), payload(0x5a));
    }

    #[test]
    fn test_iterator_is_a_snapshot() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = open_store(dir.path(), "default");

        store.write_block(bref(1, 1, 0), &payload(1)).expect("write");
        store.write_block(bref(1, 1, 1), &payload(2)).expect("write");

        let iter = store.block_iterator().expect("iterator");
        store.write_block(bref(1, 1, 2), &payload(3)).expect("write");

        let seen: Result<HashSet<BlockRef>> = iter.collect();
        let seen = seen.expect("collect refs");
        assert_eq!(
            seen,
            HashSet::from([bref(1, 1, 0), bref(1, 1, 1)])
        );
    }

    #[test]
    fn test_iterator_yields_all_blocks() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = open_store(dir.path(), "default");

        let refs = [bref(1, 1, 0), bref(1, 2, 9), bref(3, 1, 2)];
        for (i, r) in refs.iter().enumerate() {
            store.write_block(*r, &payload(i as u8)).expect("write");
        }

        let seen: Result<HashSet<BlockRef>> =
            store.block_iterator().expect("iterator").collect();
        assert_eq!(seen.expect("collect refs"), HashSet::from(refs));
    }

    #[test]
    fn test_replace_store() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cfg = test_config(dir.path());

        let a = open_store(dir.path(), "a");
        a.write_block(bref(1, 1, 0), &payload(0xaa)).expect("write");

        let b = open_store(dir.path(), "b");
        b.write_block(bref(2, 2, 0), &payload(0xbb)).expect("write");

        let replaced = a.replace_store(Box::new(b)).expect("replace store");

        assert_eq!(replaced.kind(), "mfile");
        assert_eq!(replaced.used_blocks(), 1);
        assert_eq!(
            replaced.get_block(bref(2, 2, 0)).expect("get block"),
            payload(0xbb)
        );
        assert_eq!(replaced.get_block(bref(1, 1, 0)), Err(Error::NotFound));

        // The replacement now lives at a's paths; b's originals are gone.
        assert!(cfg.data_path("a").exists());
        assert!(cfg.map_path("a").exists());
        assert!(!cfg.data_path("b").exists());
        assert!(!cfg.map_path("b").exists());
        assert!(!cfg.lock_path("b").exists());

        // The replaced-out store is dead.
        assert_eq!(a.get_block(bref(1, 1, 0)), Err(Error::Closed));

        // The swapped files survive a reopen at a's name.
        replaced.close().expect("close replaced");
        drop(replaced);
        drop(a);
        let reopened = open_store(dir.path(), "a");
        assert_eq!(reopened.used_blocks(), 1);
        assert_eq!(
            reopened.get_block(bref(2, 2, 0)).expect("get block"),
            payload(0xbb)
        );
    }

    #[test]
    fn test_replace_rejects_other_backends() {
        struct OtherStore;

        impl Store for OtherStore {
            fn kind(&self) -> &'static str {
                "other"
            }
            fn flush(&self) -> Result<()> {
                Ok(())
            }
            fn close(&self) -> Result<()> {
                Ok(())
            }
        }

        impl BlockStore for OtherStore {
            fn get_block(&self, _: BlockRef) -> Result<Vec<u8>> {
                Err(Error::NotFound)
            }
            fn write_block(&self, _: BlockRef, _: &[u8]) -> Result<()> {
                Err(Error::OutOfSpace)
            }
            fn delete_block(&self, _: BlockRef) -> Result<()> {
                Err(Error::NotFound)
            }
            fn delete_inode_blocks(&self, _: INodeRef) -> Result<()> {
                Ok(())
            }
            fn num_blocks(&self) -> u64 {
                0
            }
            fn used_blocks(&self) -> u64 {
                0
            }
            fn block_iterator(&self) -> Result<BlockIter> {
                Ok(Box::new(std::iter::empty()))
            }
            fn replace_store(&self, _: Box<dyn BlockStore>) -> Result<Box<dyn BlockStore>> {
                Err(Error::WrongBackend("other".into()))
            }
            fn into_any(self: Box<Self>) -> Box<dyn Any> {
                self
            }
        }

        let dir = tempfile::tempdir().expect("temp dir");
        let store = open_store(dir.path(), "default");
        let result = store.replace_store(Box::new(OtherStore));
        assert!(matches!(result, Err(Error::WrongBackend(_))));

        // The refused replacement leaves the store untouched.
        store.write_block(bref(1, 1, 0), &payload(1)).expect("write");
        assert_eq!(store.used_blocks(), 1);
    }

    #[test]
    fn test_delete_unknown_block_is_not_found() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = open_store(dir.path(), "default");

        store.write_block(bref(1, 1, 0), &payload(1)).expect("write");
        assert_eq!(store.delete_block(bref(1, 1, 1)), Err(Error::NotFound));
        assert_eq!(store.used_blocks(), 1);
        assert_eq!(store.get_block(bref(1, 1, 0)).expect("get"), payload(1));
    }

    #[test]
    fn test_wrong_payload_length_rejected() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = open_store(dir.path(), "default");

        let result = store.write_block(bref(1, 1, 0), &[1u8; 100]);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert_eq!(store.used_blocks(), 0);
        assert_eq!(store.get_block(bref(1, 1, 0)), Err(Error::NotFound));
    }

    #[test]
    fn test_misaligned_storage_size_rejected() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cfg = Config::new(dir.path())
            .storage_size(BLOCK_SIZE * 2 + 1)
            .block_size(BLOCK_SIZE);
        let result = MfileBlockStore::open("default", &cfg);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_closed_store_fails_everything() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = open_store(dir.path(), "default");
        store.write_block(bref(1, 1, 0), &payload(1)).expect("write");
        store.close().expect("close");

        assert_eq!(store.get_block(bref(1, 1, 0)), Err(Error::Closed));
        assert_eq!(store.write_block(bref(1, 1, 1), &payload(2)), Err(Error::Closed));
        assert_eq!(store.delete_block(bref(1, 1, 0)), Err(Error::Closed));
        assert_eq!(
            store.delete_inode_blocks(INodeRef::new(1, 1)),
            Err(Error::Closed)
        );
        assert_eq!(store.flush(), Err(Error::Closed));
        assert!(matches!(store.block_iterator(), Err(Error::Closed)));
        assert_eq!(store.close(), Err(Error::Closed));
    }

    #[test]
    #[should_panic(expected = "already existed")]
    fn test_duplicate_write_panics() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = open_store(dir.path(), "default");
        store.write_block(bref(1, 1, 0), &payload(1)).expect("write");
        let _ = store.write_block(bref(1, 1, 0), &payload(2));
    }

    #[test]
    fn test_double_open_same_store_fails() {
        let dir = tempfile::tempdir().expect("temp dir");
        let _store = open_store(dir.path(), "default");

        let result = MfileBlockStore::open("default", &test_config(dir.path()));
        assert!(matches!(result, Err(Error::IO(_))));
    }

    #[test]
    fn test_used_blocks_matches_map_file_after_reopen() {
        let dir = tempfile::tempdir().expect("temp dir");

        {
            let store = open_store(dir.path(), "default");
            store.write_block(bref(1, 1, 0), &payload(1)).expect("write");
            store.write_block(bref(1, 1, 1), &payload(2)).expect("write");
            store.write_block(bref(1, 1, 2), &payload(3)).expect("write");
            store.delete_block(bref(1, 1, 1)).expect("delete");
            store.close().expect("close");
        }

        let store = open_store(dir.path(), "default");
        assert_eq!(store.used_blocks(), 2);
        assert!(store.used_blocks() <= store.num_blocks());

        let seen: Result<HashSet<BlockRef>> =
            store.block_iterator().expect("iterator").collect();
        assert_eq!(
            seen.expect("collect refs"),
            HashSet::from([bref(1, 1, 0), bref(1, 1, 2)])
        );
    }
}
