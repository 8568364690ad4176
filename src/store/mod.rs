pub mod mfile;
pub mod registry;

use std::any::Any;

use crate::error::Result;
use crate::refs::{BlockRef, INodeRef};

/// Methods common to every storage provider.
pub trait Store: Send + Sync {
    /// The backend kind this store was created from.
    fn kind(&self) -> &'static str;

    /// Forces all buffered state to disk.
    fn flush(&self) -> Result<()>;

    /// Flushes and releases the store's files. Every later operation,
    /// including another close, fails with [`Error::Closed`](crate::Error::Closed).
    fn close(&self) -> Result<()>;
}

/// Iterator over a point-in-time snapshot of a block store's references.
/// Dropping it releases the snapshot.
pub type BlockIter = Box<dyn Iterator<Item = Result<BlockRef>> + Send>;

/// Iterator over a point-in-time snapshot of an inode store's references.
pub type INodeIter = Box<dyn Iterator<Item = Result<INodeRef>> + Send>;

/// A store of fixed-size blocks addressed by [`BlockRef`].
pub trait BlockStore: Store {
    /// Returns a copy of the block's payload, or `NotFound`.
    fn get_block(&self, bref: BlockRef) -> Result<Vec<u8>>;

    /// Stores a payload of exactly the store's block size under a
    /// reference that must not already be present.
    fn write_block(&self, bref: BlockRef, data: &[u8]) -> Result<()>;

    /// Removes a block, or fails with `NotFound`.
    fn delete_block(&self, bref: BlockRef) -> Result<()>;

    /// Removes every block belonging to the given inode. Removing an
    /// inode with no blocks succeeds without effect.
    fn delete_inode_blocks(&self, iref: INodeRef) -> Result<()>;

    /// Total slot capacity.
    fn num_blocks(&self) -> u64;

    /// Number of slots currently holding a block.
    fn used_blocks(&self) -> u64;

    /// Snapshot iterator over all stored references; mutations after
    /// creation are invisible to it.
    fn block_iterator(&self) -> Result<BlockIter>;

    /// Atomically substitutes `other` for this store: this store's files
    /// are unlinked, `other`'s are renamed into their place, and the
    /// returned store owns `other`'s state at this store's paths. Both
    /// originals are closed. Fails with `WrongBackend` unless `other` is
    /// the same backend kind.
    fn replace_store(&self, other: Box<dyn BlockStore>) -> Result<Box<dyn BlockStore>>;

    /// Downcast support for [`replace_store`](BlockStore::replace_store).
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// A store of opaque, caller-serialized inode payloads addressed by
/// [`INodeRef`]. Implementations are pluggable through
/// [`registry::register_inode_store`].
pub trait INodeStore: Store {
    /// Returns a copy of the inode's serialized payload, or `NotFound`.
    fn get_inode(&self, iref: INodeRef) -> Result<Vec<u8>>;

    /// Stores or replaces the inode's serialized payload.
    fn write_inode(&self, iref: INodeRef, data: &[u8]) -> Result<()>;

    /// Removes an inode, or fails with `NotFound`.
    fn delete_inode(&self, iref: INodeRef) -> Result<()>;

    /// Snapshot iterator over all stored inode references.
    fn inode_iterator(&self) -> Result<INodeIter>;

    /// Same contract as [`BlockStore::replace_store`], for inode stores.
    fn replace_store(&self, other: Box<dyn INodeStore>) -> Result<Box<dyn INodeStore>>;

    /// Downcast support for [`replace_store`](INodeStore::replace_store).
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}
