//! Serialized, atomic rewrites of a file.
//!
//! Writers take an exclusive advisory lock on a sidecar lock file, copy the target into a
//! private temporary file, let the caller edit that copy and then rename it over the target.
//! Readers that never touch the lock still only ever see the complete old file or the
//! complete new one. The lock only orders writers against each other.

use crate::error::AuthKeysError as Error;
use fs2::FileExt;
use rand::Rng;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;

/// Suffix appended to the target path to get the default lock file
pub const LOCK_FILE_SUFFIX: &str = ".lockfile";

/// Default sidecar lock path for a file, `<path>.lockfile`
pub fn default_lock_path(path: &Path) -> PathBuf {
    let mut lock = path.as_os_str().to_owned();
    lock.push(LOCK_FILE_SUFFIX);
    PathBuf::from(lock)
}

/// Holds the exclusive lock, released when dropped no matter how the holder exits
struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    fn acquire(path: &Path) -> Result<LockGuard, Error> {
        let lock_error = |error| Error::LockError {
            path: path.to_path_buf(),
            error,
        };
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(lock_error)?;
        trace!("waiting for lock on {}", path.display());
        // blocks until every other writer has let go
        file.lock_exclusive().map_err(lock_error)?;
        trace!("locked {}", path.display());

        let mut guard = LockGuard {
            file,
            path: path.to_path_buf(),
        };
        guard.write_holder().map_err(lock_error)?;
        Ok(guard)
    }

    /// Records who holds the lock, only ever read by humans
    fn write_holder(&mut self) -> std::io::Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let nonce: u64 = rand::thread_rng().gen();
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        writeln!(
            self.file,
            "auth_keys pid {} thread {:?} locked at {} nonce {:016x}",
            process::id(),
            thread::current().id(),
            now,
            nonce
        )?;
        self.file.flush()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            // closing the descriptor releases the lock anyway
            warn!("failed to unlock {}: {:?}", self.path.display(), e);
        } else {
            trace!("unlocked {}", self.path.display());
        }
    }
}

/// Owner, group and mode to give the published file
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct FileOwnership {
    uid: u32,
    gid: u32,
    mode: u32,
}

#[cfg(unix)]
impl FileOwnership {
    fn of(meta: &fs::Metadata) -> FileOwnership {
        use std::os::unix::fs::MetadataExt;
        FileOwnership {
            uid: meta.uid(),
            gid: meta.gid(),
            mode: meta.mode(),
        }
    }

    /// What a new file in `path` looks like, or what `path` itself looks like if it exists
    fn capture(path: &Path) -> Result<FileOwnership, Error> {
        match fs::metadata(path) {
            Ok(meta) => Ok(FileOwnership::of(&meta)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                FileOwnership::probe(&parent_dir(path))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Touches a throwaway file to learn the defaults the directory hands out
    fn probe(dir: &Path) -> Result<FileOwnership, Error> {
        let probe = dir.join(format!(
            ".permissions_check.{:?}.{}.{}",
            thread::current().id(),
            process::id(),
            rand::thread_rng().gen_range(0..1_000_000)
        ));
        let result = File::create(&probe)
            .and_then(|file| file.metadata())
            .map(|meta| FileOwnership::of(&meta));
        let _ = fs::remove_file(&probe);
        Ok(result?)
    }

    /// Best effort, the data is already in place so failures here are only logged
    fn restore(&self, path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::os::unix::fs::chown(path, Some(self.uid), Some(self.gid)) {
            warn!("could not restore owner of {}: {:?}", path.display(), e);
        }
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(self.mode & 0o7777)) {
            warn!("could not restore mode of {}: {:?}", path.display(), e);
        }
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Atomically rewrites `path` while holding the lock on `lock_path`.
///
/// The closure receives a temporary file positioned at the start and holding a copy of the
/// current contents (empty if `path` does not exist yet). Whatever the temporary file holds
/// when the closure returns `Ok` replaces `path`. If the closure fails nothing is published.
/// `temp_dir` must be on the same filesystem as `path`, it defaults to the directory of `path`.
pub fn atomic_lock<T, F>(
    path: &Path,
    lock_path: &Path,
    temp_dir: Option<&Path>,
    edit: F,
) -> Result<T, Error>
where
    F: FnOnce(&mut File) -> Result<T, Error>,
{
    atomic_lock_if(path, lock_path, temp_dir, |file| {
        edit(file).map(|result| (result, true))
    })
}

/// Like [`atomic_lock`] but the closure also decides whether its edit is published. When it
/// returns false the temporary copy is thrown away and `path` is left exactly as it was
pub fn atomic_lock_if<T, F>(
    path: &Path,
    lock_path: &Path,
    temp_dir: Option<&Path>,
    edit: F,
) -> Result<T, Error>
where
    F: FnOnce(&mut File) -> Result<(T, bool), Error>,
{
    let _lock = LockGuard::acquire(lock_path)?;

    let dir = temp_dir
        .map(|d| d.to_path_buf())
        .unwrap_or_else(|| parent_dir(path));
    let mut temp = NamedTempFile::new_in(&dir)?;
    match File::open(path) {
        Ok(mut current) => {
            std::io::copy(&mut current, temp.as_file_mut())?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            trace!("{} does not exist yet, starting empty", path.display());
        }
        Err(e) => return Err(e.into()),
    }
    temp.as_file_mut().seek(SeekFrom::Start(0))?;

    let (result, publish) = edit(temp.as_file_mut())?;
    if !publish {
        trace!("nothing to publish for {}", path.display());
        return Ok(result);
    }

    temp.as_file_mut().flush()?;
    temp.as_file().sync_all()?;

    #[cfg(unix)]
    let ownership = FileOwnership::capture(path)?;

    temp.persist(path)?;
    info!("published new version of {}", path.display());

    #[cfg(unix)]
    ownership.restore(path);

    Ok(result)
}
