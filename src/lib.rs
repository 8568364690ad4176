pub mod config;
pub mod error;
pub mod flock;
pub mod mfile;
pub mod refs;
pub mod store;
pub mod trie;

pub use config::Config;
pub use error::{Error, Result};
pub use refs::{BlockRef, INodeRef, BLOCK_REF_BYTES, INODE_REF_BYTES};
pub use store::registry::{
    create_block_store, create_inode_store, register_block_store, register_default_stores,
    register_inode_store,
};
pub use store::{BlockStore, INodeStore, Store};
