//! Ownership and permission checks on files that feed trust decisions.
//!
//! A user's `authorized_user_ids` must not be writable by anyone but that
//! user or root, and the same holds for every directory above it.

use std::ffi::{CStr, OsStr};
use std::io;
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tracing::debug;

const S_ISVTX: u32 = 0o1000;
const MAX_PWBUF: usize = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("no such user '{0}'")]
    UnknownUser(String),

    #[error("cannot look up user '{user}': {source}")]
    Lookup {
        user: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot stat {}: {source}", path.display())]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} is writable by group or others (mode {mode:o})", path.display())]
    Writable { path: PathBuf, mode: u32 },

    #[error("{} is owned by uid {owner}, expected root or {user}", path.display())]
    Owner {
        path: PathBuf,
        owner: u32,
        user: String,
    },
}

/// A resolved passwd entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

pub fn lookup_user(name: &str) -> Result<UserInfo, GuardError> {
    let cname = std::ffi::CString::new(name).map_err(|_| GuardError::UnknownUser(name.into()))?;
    let found = passwd_lookup(|pwd, buf, len, result| unsafe {
        libc::getpwnam_r(cname.as_ptr(), pwd, buf, len, result)
    })
    .map_err(|source| GuardError::Lookup {
        user: name.into(),
        source,
    })?;
    found.ok_or_else(|| GuardError::UnknownUser(name.into()))
}

/// The user this process runs as (effective uid).
pub fn current_user() -> Result<UserInfo, GuardError> {
    let uid = unsafe { libc::geteuid() };
    let found = passwd_lookup(|pwd, buf, len, result| unsafe {
        libc::getpwuid_r(uid, pwd, buf, len, result)
    })
    .map_err(|source| GuardError::Lookup {
        user: uid.to_string(),
        source,
    })?;
    found.ok_or_else(|| GuardError::UnknownUser(uid.to_string()))
}

fn passwd_lookup(
    call: impl Fn(*mut libc::passwd, *mut libc::c_char, usize, *mut *mut libc::passwd) -> libc::c_int,
) -> io::Result<Option<UserInfo>> {
    let mut len = 1024;
    loop {
        let mut buf = vec![0 as libc::c_char; len];
        let mut pwd = MaybeUninit::<libc::passwd>::zeroed();
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        let rc = call(pwd.as_mut_ptr(), buf.as_mut_ptr(), buf.len(), &raw mut result);
        if rc == libc::ERANGE && len < MAX_PWBUF {
            len *= 2;
            continue;
        }
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        if result.is_null() {
            return Ok(None);
        }
        // SAFETY: getpw*_r returned success with a non-null result, so `pwd`
        // is initialised and its strings point into `buf`, still alive here.
        let pwd = unsafe { pwd.assume_init() };
        return Ok(Some(unsafe { user_from_passwd(&pwd) }));
    }
}

/// # Safety
/// `pwd.pw_name` and `pwd.pw_dir` must be valid C strings.
unsafe fn user_from_passwd(pwd: &libc::passwd) -> UserInfo {
    let name = unsafe { CStr::from_ptr(pwd.pw_name) }
        .to_string_lossy()
        .into_owned();
    let home = PathBuf::from(OsStr::from_bytes(
        unsafe { CStr::from_ptr(pwd.pw_dir) }.to_bytes(),
    ));
    UserInfo {
        name,
        uid: pwd.pw_uid,
        gid: pwd.pw_gid,
        home,
    }
}

/// Every entry in the passwd database, in enumeration order.
///
/// Uses the non-reentrant `getpwent`; call it from one thread at a time.
pub fn all_users() -> Vec<UserInfo> {
    let mut users = Vec::new();
    unsafe {
        libc::setpwent();
        loop {
            let entry = libc::getpwent();
            if entry.is_null() {
                break;
            }
            users.push(user_from_passwd(&*entry));
        }
        libc::endpwent();
    }
    debug!(count = users.len(), "enumerated passwd entries");
    users
}

/// Check `path` and its parents for `user`.
///
/// The walk stops below the user's home directory when `path` is inside
/// it, otherwise at `/`. Every visited component must be owned by root or
/// the user and must not be group or other writable; directories with the
/// sticky bit set (such as `/tmp`) are exempt from the writability rule.
pub fn check_permissions(user: &UserInfo, path: &Path) -> Result<(), GuardError> {
    let resolved = std::fs::canonicalize(path).map_err(|source| GuardError::Stat {
        path: path.to_path_buf(),
        source,
    })?;
    let home = std::fs::canonicalize(&user.home).unwrap_or_else(|_| user.home.clone());
    let inside_home = resolved.starts_with(&home) && resolved != home;

    for component in resolved.ancestors() {
        if inside_home && component == home {
            break;
        }
        check_component(user, component)?;
    }
    debug!(path = %path.display(), user = %user.name, "permissions ok");
    Ok(())
}

/// [`check_permissions`] when `strict_modes` is on; a no-op otherwise.
pub fn check_if_strict(strict_modes: bool, user: &UserInfo, path: &Path) -> Result<(), GuardError> {
    if strict_modes {
        check_permissions(user, path)
    } else {
        Ok(())
    }
}

fn check_component(user: &UserInfo, path: &Path) -> Result<(), GuardError> {
    let meta = std::fs::metadata(path).map_err(|source| GuardError::Stat {
        path: path.to_path_buf(),
        source,
    })?;
    let owner = meta.uid();
    if owner != 0 && owner != user.uid {
        return Err(GuardError::Owner {
            path: path.to_path_buf(),
            owner,
            user: user.name.clone(),
        });
    }
    let mode = meta.mode();
    let sticky_dir = meta.is_dir() && mode & S_ISVTX != 0;
    if mode & 0o022 != 0 && !sticky_dir {
        return Err(GuardError::Writable {
            path: path.to_path_buf(),
            mode: mode & 0o7777,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn me() -> UserInfo {
        current_user().unwrap()
    }

    fn private_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o700)).unwrap();
        dir
    }

    fn write(path: &Path, mode: u32) {
        fs::write(path, "ssh://host.example.org\n").unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
    }

    #[test]
    fn root_resolves() {
        let root = lookup_user("root").unwrap();
        assert_eq!(root.uid, 0);
        assert!(matches!(
            lookup_user("msph-no-such-user"),
            Err(GuardError::UnknownUser(_))
        ));
    }

    #[test]
    fn enumeration_includes_root() {
        assert!(all_users().iter().any(|u| u.uid == 0 && u.name == "root"));
    }

    #[test]
    fn private_file_passes() {
        let dir = private_dir();
        let file = dir.path().join("authorized_user_ids");
        write(&file, 0o600);
        check_permissions(&me(), &file).unwrap();
    }

    #[test]
    fn group_writable_file_fails() {
        let dir = private_dir();
        let file = dir.path().join("authorized_user_ids");
        write(&file, 0o620);
        let err = check_permissions(&me(), &file).unwrap_err();
        assert!(matches!(err, GuardError::Writable { mode: 0o620, .. }));
    }

    #[test]
    fn writable_parent_fails() {
        let dir = private_dir();
        let sub = dir.path().join(".monkeysphere");
        fs::create_dir(&sub).unwrap();
        fs::set_permissions(&sub, fs::Permissions::from_mode(0o777)).unwrap();
        let file = sub.join("authorized_user_ids");
        write(&file, 0o600);
        let err = check_permissions(&me(), &file).unwrap_err();
        assert!(matches!(err, GuardError::Writable { path, .. } if path.ends_with(".monkeysphere")));
    }

    #[test]
    fn sticky_parent_passes() {
        let dir = private_dir();
        let sub = dir.path().join("shared");
        fs::create_dir(&sub).unwrap();
        fs::set_permissions(&sub, fs::Permissions::from_mode(0o1777)).unwrap();
        let file = sub.join("authorized_user_ids");
        write(&file, 0o644);
        check_permissions(&me(), &file).unwrap();
    }

    #[test]
    fn walk_stops_below_home() {
        let dir = private_dir();
        let home = dir.path().join("home");
        fs::create_dir(&home).unwrap();
        let ssh = home.join(".ssh");
        fs::create_dir(&ssh).unwrap();
        let file = ssh.join("authorized_keys");
        write(&file, 0o600);
        fs::set_permissions(&home, fs::Permissions::from_mode(0o777)).unwrap();

        let mut user = me();
        user.home = home.clone();
        check_permissions(&user, &file).unwrap();

        // the same tree for a user whose home is elsewhere walks through it
        user.home = PathBuf::from("/nonexistent-home");
        assert!(check_permissions(&user, &file).is_err());
    }

    #[test]
    fn foreign_owner_fails() {
        let me = me();
        if me.uid == 0 {
            // everything we create is root-owned, which is always allowed
            return;
        }
        let dir = private_dir();
        let file = dir.path().join("authorized_user_ids");
        write(&file, 0o600);
        let other = UserInfo {
            name: "other".into(),
            uid: me.uid + 1,
            gid: me.gid,
            home: PathBuf::from("/nonexistent"),
        };
        assert!(matches!(
            check_permissions(&other, &file),
            Err(GuardError::Owner { .. })
        ));
    }

    #[test]
    fn missing_path_is_stat_error() {
        let dir = private_dir();
        let err = check_permissions(&me(), &dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, GuardError::Stat { .. }));
        check_if_strict(false, &me(), &dir.path().join("absent")).unwrap();
    }
}
