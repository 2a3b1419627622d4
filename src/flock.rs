use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

const LOCK_FILE: &str = "LOCK";

/// Exclusive hold on a db directory for its single writer. Released when
/// dropped; the lock file stays behind.
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Locks `<dir>/LOCK` without blocking and records the holder's pid.
    pub fn acquire(dir: &Path) -> io::Result<Self> {
        let path = dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        try_lock(&file)?;

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_data()?;
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn try_lock(file: &File) -> io::Result<()> {
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn try_lock(_file: &File) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_holder_pid_recorded() {
        let dir = TempDir::new().unwrap();
        let lock = FileLock::acquire(dir.path()).unwrap();
        assert_eq!(lock.path(), dir.path().join("LOCK"));
        let content = fs::read_to_string(lock.path()).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
    }

    #[cfg(unix)]
    #[test]
    fn test_second_writer_refused() {
        let dir = TempDir::new().unwrap();
        let _held = FileLock::acquire(dir.path()).unwrap();
        assert!(FileLock::acquire(dir.path()).is_err());
    }

    #[test]
    fn test_released_on_drop() {
        let dir = TempDir::new().unwrap();
        drop(FileLock::acquire(dir.path()).unwrap());
        assert!(FileLock::acquire(dir.path()).is_ok());
    }
}
