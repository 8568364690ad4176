use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// An advisory lock on a store's file pair. Held for the lifetime of the
/// owning store; released when dropped. The lock file itself is left in
/// place to avoid unlink races.
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Creates the lock file (or reuses an existing one) and acquires an
    /// exclusive lock on it, failing immediately if another process holds
    /// it. The file records the holder's process ID for debugging.
    pub fn lock<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Self::try_lock(&file)?;

        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let fd = file.as_raw_fd();
        let result = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> io::Result<()> {
        // No advisory locking on this platform; single-process use only.
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
