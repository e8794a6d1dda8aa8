//! Single-writer guard for the face index.
//!
//! Both `faceidx daemon` and `faceidx ingest` append to `faces.bin`, so each
//! takes an exclusive flock() on `faceidx.lock` in the base directory for as
//! long as it runs. The holder writes its role and pid into the file so a
//! refused process can say who is in the way. Read-only commands never lock.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

const LOCK_FILE_NAME: &str = "faceidx.lock";

/// Exclusive ownership of the index directory, released on drop.
pub struct IndexLock {
    file: File,
}

impl IndexLock {
    /// Take the lock without waiting. `holder` names the running mode
    /// (`daemon`, `ingest`) and is recorded for whoever is refused next.
    pub fn try_acquire(base_path: &Path, holder: &str) -> io::Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(base_path.join(LOCK_FILE_NAME))?;

        if let Err(err) = flock_exclusive(&file) {
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
            let owner = read_owner(&mut file).unwrap_or_default();
            let owner = if owner.is_empty() {
                "another process".to_string()
            } else {
                owner
            };
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("face index is in use by {owner}"),
            ));
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{holder} (pid {})", std::process::id())?;
        file.flush()?;

        log::debug!("acquired index lock as {holder}");
        Ok(IndexLock { file })
    }
}

fn read_owner(file: &mut File) -> io::Result<String> {
    let mut owner = String::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_string(&mut owner)?;
    Ok(owner.trim().to_string())
}

#[cfg(unix)]
fn flock_exclusive(file: &File) -> io::Result<()> {
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(());
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == libc::EWOULDBLOCK || code == libc::EAGAIN => {
            Err(io::Error::from(io::ErrorKind::WouldBlock))
        }
        _ => Err(err),
    }
}

#[cfg(not(unix))]
fn flock_exclusive(_file: &File) -> io::Result<()> {
    Ok(())
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        // a stale owner line would mislead the next refused process
        let _ = self.file.set_len(0);
        #[cfg(unix)]
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}
