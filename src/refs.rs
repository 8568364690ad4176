use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Unique identifier for a volume.
pub type VolumeId = u64;

/// Unique identifier for an inode within a volume.
pub type INodeId = u64;

/// Position of a block within an inode.
pub type IndexId = u64;

/// Encoded width of an [`INodeRef`] in bytes.
pub const INODE_REF_BYTES: usize = 16;

/// Encoded width of a [`BlockRef`] in bytes.
pub const BLOCK_REF_BYTES: usize = 24;

/// A reference to a unique inode in the filesystem.
///
/// Its encoding is a strict prefix of the encoding of every [`BlockRef`]
/// belonging to it, which is what makes prefix scans over the block index
/// find exactly an inode's blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct INodeRef {
    pub volume: VolumeId,
    pub inode: INodeId,
}

impl INodeRef {
    pub fn new(volume: VolumeId, inode: INodeId) -> Self {
        Self { volume, inode }
    }

    /// Encodes the reference as fixed-width little-endian bytes.
    pub fn to_bytes(&self) -> [u8; INODE_REF_BYTES] {
        let mut buf = [0u8; INODE_REF_BYTES];
        LittleEndian::write_u64(&mut buf[0..8], self.volume);
        LittleEndian::write_u64(&mut buf[8..16], self.inode);
        buf
    }

    /// Decodes a reference from its fixed-width encoding. The input must be
    /// exactly [`INODE_REF_BYTES`] long; anything else is a caller bug that
    /// would silently corrupt the on-disk map, so it aborts.
    pub fn from_bytes(buf: &[u8]) -> Self {
        assert_eq!(
            buf.len(),
            INODE_REF_BYTES,
            "inode ref must be {INODE_REF_BYTES} bytes"
        );
        Self {
            volume: LittleEndian::read_u64(&buf[0..8]),
            inode: LittleEndian::read_u64(&buf[8..16]),
        }
    }
}

impl fmt::Display for INodeRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "vol: {}, inode: {}", self.volume, self.inode)
    }
}

/// The globally unique logical address of a block: the owning inode
/// reference plus the block's position within the inode.
///
/// The all-zero encoding is reserved as the free-slot sentinel in map
/// files; upper layers never allocate volume 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    pub volume: VolumeId,
    pub inode: INodeId,
    pub index: IndexId,
}

impl BlockRef {
    pub fn new(volume: VolumeId, inode: INodeId, index: IndexId) -> Self {
        Self {
            volume,
            inode,
            index,
        }
    }

    /// The inode this block belongs to.
    pub fn inode_ref(&self) -> INodeRef {
        INodeRef::new(self.volume, self.inode)
    }

    /// Whether this block belongs to the given inode.
    pub fn belongs_to(&self, iref: INodeRef) -> bool {
        self.volume == iref.volume && self.inode == iref.inode
    }

    /// Encodes the reference as fixed-width little-endian bytes. The first
    /// [`INODE_REF_BYTES`] bytes equal the owning inode ref's encoding.
    pub fn to_bytes(&self) -> [u8; BLOCK_REF_BYTES] {
        let mut buf = [0u8; BLOCK_REF_BYTES];
        LittleEndian::write_u64(&mut buf[0..8], self.volume);
        LittleEndian::write_u64(&mut buf[8..16], self.inode);
        LittleEndian::write_u64(&mut buf[16..24], self.index);
        buf
    }

    /// Decodes a reference from its fixed-width encoding. Aborts on any
    /// other input length, like [`INodeRef::from_bytes`].
    pub fn from_bytes(buf: &[u8]) -> Self {
        assert_eq!(
            buf.len(),
            BLOCK_REF_BYTES,
            "block ref must be {BLOCK_REF_BYTES} bytes"
        );
        Self {
            volume: LittleEndian::read_u64(&buf[0..8]),
            inode: LittleEndian::read_u64(&buf[8..16]),
            index: LittleEndian::read_u64(&buf[16..24]),
        }
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "vol: {}, inode: {}, block: {}",
            self.volume, self.inode, self.index
        )
    }
}
