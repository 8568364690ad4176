//! Process-wide backend registries.
//!
//! A single binary can host several storage backends and select one by
//! configuration. Registration is an explicit call, never a load-time
//! side effect; registering the same kind twice is a program error.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::store::mfile::MfileBlockStore;
use crate::store::{BlockStore, INodeStore};

/// Constructor for a block store backend: (store name, config).
pub type NewBlockStoreFn = fn(&str, &Config) -> Result<Box<dyn BlockStore>>;

/// Constructor for an inode store backend: (store name, config).
pub type NewINodeStoreFn = fn(&str, &Config) -> Result<Box<dyn INodeStore>>;

static BLOCK_STORES: OnceLock<RwLock<HashMap<&'static str, NewBlockStoreFn>>> = OnceLock::new();
static INODE_STORES: OnceLock<RwLock<HashMap<&'static str, NewINodeStoreFn>>> = OnceLock::new();

fn block_stores() -> &'static RwLock<HashMap<&'static str, NewBlockStoreFn>> {
    BLOCK_STORES.get_or_init(Default::default)
}

fn inode_stores() -> &'static RwLock<HashMap<&'static str, NewINodeStoreFn>> {
    INODE_STORES.get_or_init(Default::default)
}

/// Registers the backends shipped with this crate.
pub fn register_default_stores() {
    register_block_store("mfile", |name, cfg| {
        Ok(Box::new(MfileBlockStore::open(name, cfg)?))
    });
}

/// Registers a block store backend under `kind`. Panics if the kind is
/// already taken.
pub fn register_block_store(kind: &'static str, ctor: NewBlockStoreFn) {
    let mut table = block_stores().write().expect("registry lock poisoned");
    if table.insert(kind, ctor).is_some() {
        panic!("attempted to register block store {kind} twice");
    }
}

/// Registers an inode store backend under `kind`. Panics if the kind is
/// already taken.
pub fn register_inode_store(kind: &'static str, ctor: NewINodeStoreFn) {
    let mut table = inode_stores().write().expect("registry lock poisoned");
    if table.insert(kind, ctor).is_some() {
        panic!("attempted to register inode store {kind} twice");
    }
}

/// Creates a block store of the given registered kind.
pub fn create_block_store(kind: &str, name: &str, cfg: &Config) -> Result<Box<dyn BlockStore>> {
    let ctor = block_stores()
        .read()?
        .get(kind)
        .copied()
        .ok_or_else(|| Error::UnknownBackend(kind.to_string()))?;
    tracing::info!(kind, name, "creating block store");
    ctor(name, cfg)
}

/// Creates an inode store of the given registered kind.
pub fn create_inode_store(kind: &str, name: &str, cfg: &Config) -> Result<Box<dyn INodeStore>> {
    let ctor = inode_stores()
        .read()?
        .get(kind)
        .copied()
        .ok_or_else(|| Error::UnknownBackend(kind.to_string()))?;
    tracing::info!(kind, name, "creating inode store");
    ctor(name, cfg)
}
