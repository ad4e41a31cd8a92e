use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::CredentialFile;
use crate::error::{Error, Result};

/// Exclusive advisory lock on `<dest>.lock`, held until dropped.
///
/// The sidecar is never removed: it persists after release, empty, and later
/// runs lock the same file.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    pub fn acquire(dest: &Path) -> Result<Self> {
        let path = lock_path(dest);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(Error::io(&path))?;

        let fd = file.as_raw_fd();
        if unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) } != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EWOULDBLOCK) {
                return Err(Error::io(&path)(err));
            }
            info!(lock = %path.display(), "waiting for lock");
            if unsafe { libc::flock(fd, libc::LOCK_EX) } != 0 {
                return Err(Error::io(&path)(io::Error::last_os_error()));
            }
        }
        debug!(lock = %path.display(), "lock acquired");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
    }
}

fn lock_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    dest.with_file_name(name)
}

/// Current content of `dest`, empty when it does not exist.
pub fn load(dest: &Path) -> Result<CredentialFile> {
    match fs::read_to_string(dest) {
        Ok(text) => Ok(CredentialFile::parse(&text)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(CredentialFile::new()),
        Err(e) => Err(Error::io(dest)(e)),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CommitOptions {
    pub mode: u32,
    pub owner: Option<(u32, u32)>,
}

impl CommitOptions {
    /// Files in a user's own home.
    pub const USER: Self = Self {
        mode: 0o600,
        owner: None,
    };

    /// Files read by sshd from the system data directory.
    pub const SYSTEM: Self = Self {
        mode: 0o644,
        owner: None,
    };
}

/// Replace `dest` with `file`.
///
/// Content goes to a private temporary file in the same directory, is
/// synced, gets its final mode and owner, and is renamed over `dest`. An
/// empty file removes `dest` instead.
pub fn commit(dest: &Path, file: &CredentialFile, opts: CommitOptions) -> Result<()> {
    if file.is_empty() {
        match fs::remove_file(dest) {
            Ok(()) => info!(path = %dest.display(), "removed empty file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io(dest)(e)),
        }
        return Ok(());
    }

    let dir = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::Builder::new()
        .prefix(".msph-")
        .tempfile_in(dir)
        .map_err(Error::io(dir))?;
    tmp.write_all(file.render().as_bytes())
        .map_err(Error::io(tmp.path()))?;
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(opts.mode))
        .map_err(Error::io(tmp.path()))?;
    if let Some((uid, gid)) = opts.owner {
        std::os::unix::fs::fchown(tmp.as_file(), Some(uid), Some(gid))
            .map_err(Error::io(tmp.path()))?;
    }
    tmp.as_file().sync_all().map_err(Error::io(tmp.path()))?;
    tmp.persist(dest).map_err(|e| Error::io(dest)(e.error))?;
    debug!(path = %dest.display(), lines = file.lines().len(), "committed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::MetadataExt;

    use super::*;

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("known_hosts")).unwrap().is_empty());
    }

    #[test]
    fn commit_writes_with_mode_and_no_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("authorized_keys");
        let file = CredentialFile::parse("line one\nline two");
        commit(&dest, &file, CommitOptions::SYSTEM).unwrap();

        assert_eq!(fs::read_to_string(&dest).unwrap(), "line one\nline two\n");
        assert_eq!(fs::metadata(&dest).unwrap().mode() & 0o777, 0o644);
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn empty_commit_removes_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("known_hosts");
        fs::write(&dest, "stale\n").unwrap();
        commit(&dest, &CredentialFile::new(), CommitOptions::USER).unwrap();
        assert!(!dest.exists());
        // and again, when already absent
        commit(&dest, &CredentialFile::new(), CommitOptions::USER).unwrap();
    }

    #[test]
    fn lock_is_a_sidecar_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("known_hosts");
        let lock = FileLock::acquire(&dest).unwrap();
        assert_eq!(lock.path(), dir.path().join("known_hosts.lock"));
        assert!(lock.path().exists());

        let other = File::open(lock.path()).unwrap();
        assert_ne!(unsafe { libc::flock(other.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) }, 0);
        drop(lock);

        // left in place, empty, and reused
        let sidecar = dir.path().join("known_hosts.lock");
        assert_eq!(fs::metadata(&sidecar).unwrap().len(), 0);
        let again = FileLock::acquire(&dest).unwrap();
        assert_eq!(again.path(), sidecar);
    }
}
