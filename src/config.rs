use std::path::PathBuf;

/// Configuration for a block store
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding all store files (default: ./cinder)
    pub data_dir: PathBuf,

    /// Total storage size in bytes; must be a multiple of the block size
    /// (default: 1GiB)
    pub storage_size: u64,

    /// Uniform block size in bytes (default: 512KiB)
    pub block_size: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./cinder"),
            storage_size: 1024 * 1024 * 1024, // 1GiB
            block_size: 512 * 1024,           // 512KiB
        }
    }
}

impl Config {
    /// Create a new config with the given data directory
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Set total storage size in bytes
    pub fn storage_size(mut self, size: u64) -> Self {
        self.storage_size = size;
        self
    }

    /// Set uniform block size in bytes
    pub fn block_size(mut self, size: u64) -> Self {
        self.block_size = size;
        self
    }

    /// Directory holding the block files of every store under this config.
    pub(crate) fn block_dir(&self) -> PathBuf {
        self.data_dir.join("block")
    }

    pub(crate) fn data_path(&self, name: &str) -> PathBuf {
        self.block_dir().join(format!("data-{name}.blk"))
    }

    pub(crate) fn map_path(&self, name: &str) -> PathBuf {
        self.block_dir().join(format!("map-{name}.blk"))
    }

    pub(crate) fn lock_path(&self, name: &str) -> PathBuf {
        self.block_dir().join(format!("{name}.lock"))
    }
}
