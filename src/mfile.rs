use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::Result;
use crate::errinput;

/// A file exposed as a fixed number of equally sized, randomly accessible
/// slots, backed by a shared-writable memory mapping.
///
/// Writes become visible to concurrent readers of the same mapping
/// immediately; they reach disk only on [`flush`](MFile::flush). Slot
/// bounds and use-after-close are programming errors and panic.
pub struct MFile {
    mmap: Option<MmapMut>,
    slot_size: usize,
    num_slots: u64,
    path: PathBuf,
}

impl MFile {
    /// Opens the file at `path`, creating it zero-filled at `total_size`
    /// bytes if absent and extending it if shorter, then maps it
    /// read-write. `total_size` must be a nonzero multiple of `slot_size`.
    pub fn open(path: impl AsRef<Path>, total_size: u64, slot_size: u64) -> Result<Self> {
        if slot_size == 0 || total_size == 0 || total_size % slot_size != 0 {
            return errinput!("file size {total_size} is not a nonzero multiple of slot size {slot_size}");
        }
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if file.metadata()?.len() < total_size {
            // set_len zero-fills the extension
            file.set_len(total_size)?;
        }

        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self {
            mmap: Some(mmap),
            slot_size: slot_size as usize,
            num_slots: total_size / slot_size,
            path,
        })
    }

    pub fn num_slots(&self) -> u64 {
        self.num_slots
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A borrowed view of slot `i`, valid until the next mutation or close.
    pub fn slot(&self, i: u64) -> &[u8] {
        let mmap = self.mmap.as_ref().expect("mfile is closed");
        assert!(i < self.num_slots, "slot {i} out of range");
        let off = i as usize * self.slot_size;
        &mmap[off..off + self.slot_size]
    }

    /// Overwrites slot `i`. `bytes` must be exactly one slot long.
    pub fn write_slot(&mut self, i: u64, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.slot_size {
            return errinput!(
                "slot write of {} bytes, slot size is {}",
                bytes.len(),
                self.slot_size
            );
        }
        let mmap = self.mmap.as_mut().expect("mfile is closed");
        assert!(i < self.num_slots, "slot {i} out of range");
        let off = i as usize * self.slot_size;
        mmap[off..off + self.slot_size].copy_from_slice(bytes);
        Ok(())
    }

    /// Forces mapped pages to disk.
    pub fn flush(&self) -> Result<()> {
        self.mmap.as_ref().expect("mfile is closed").flush()?;
        Ok(())
    }

    /// Flushes and unmaps. Any later call on this mfile panics.
    pub fn close(&mut self) -> Result<()> {
        let mmap = self.mmap.take().expect("mfile closed twice");
        mmap.flush()?;
        Ok(())
    }
}
