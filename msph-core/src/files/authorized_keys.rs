//! `authorized_keys` generation, for a user's own file and for the
//! system-wide per-user files sshd reads.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::commit::{self, CommitOptions, FileLock};
use super::{CredentialFile, CredentialFormat, GenerationStamp, UpdateSummary, line_key};
use crate::Context;
use crate::config::{AuthenticationConfig, expand_path};
use crate::error::{Error, Result};
use crate::guard::{UserInfo, check_if_strict};
use crate::identity::Identity;
use crate::keyring::Keyring;
use crate::policy::{Evaluator, KeyVerdict, TranslatedKey};

/// `[options ]<type> <base64> <stamp> <identity>` lines.
#[derive(Debug, Clone, Default)]
pub struct AuthorizedKeys {
    pub options: Option<String>,
}

impl CredentialFormat for AuthorizedKeys {
    fn matches(&self, line: &str, key: &TranslatedKey) -> bool {
        line_key(line).is_some_and(|k| k == key.key)
    }

    fn format(&self, key: &TranslatedKey, stamp: &GenerationStamp) -> String {
        match self.options.as_deref().filter(|o| !o.is_empty()) {
            Some(options) => format!("{options} {} {stamp} {}", key.key, key.identity),
            None => format!("{} {stamp} {}", key.key, key.identity),
        }
    }
}

/// User IDs listed one per line; blank lines and `#` comments skipped.
pub fn read_user_ids(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path).map_err(Error::io(path))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Evaluate each user ID and apply the verdicts to `file`.
async fn apply_user_ids<K: Keyring + ?Sized>(
    keyring: &K,
    ctx: &Context,
    file: &mut CredentialFile,
    user_ids: &[String],
    format: &AuthorizedKeys,
    summary: &mut UpdateSummary,
) {
    let stamp = ctx.stamp();
    let evaluator = Evaluator::new(keyring, ctx);
    for user_id in user_ids {
        let identity = match Identity::parse(user_id) {
            Ok(id) => id,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "skipping user ID");
                summary.failed.push((user_id.clone(), e.to_string()));
                continue;
            }
        };
        match evaluator.evaluate(&identity).await {
            Ok(verdicts) => {
                let applied = file.apply(&verdicts, format, &stamp);
                summary.record(&verdicts, applied);
            }
            Err(Error::NoPrimaryKeys(uid)) => {
                info!(user_id = %uid, "no certificate for user ID");
                summary.processed += 1;
                summary.unknown.push(uid);
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "cannot evaluate user ID");
                summary.failed.push((user_id.clone(), e.to_string()));
            }
        }
    }
}

/// Regenerate a user's own `authorized_keys`: every managed line is swept,
/// then `user_ids` are evaluated afresh. Foreign lines stay.
pub async fn update_authorized_keys<K: Keyring + ?Sized>(
    keyring: &K,
    ctx: &Context,
    path: &Path,
    user_ids: &[String],
    format: &AuthorizedKeys,
) -> Result<UpdateSummary> {
    let _lock = FileLock::acquire(path)?;
    let mut file = commit::load(path)?;
    let mut summary = UpdateSummary::new(path);
    summary.removed += file.remove_managed();

    apply_user_ids(keyring, ctx, &mut file, user_ids, format, &mut summary).await;

    commit::commit(path, &file, CommitOptions::USER)?;
    info!(
        path = %path.display(),
        user_ids = summary.processed,
        accepted = summary.accepted,
        "authorized_keys updated"
    );
    Ok(summary)
}

/// Accepted keys for one user ID, formatted as `authorized_keys` lines.
pub async fn keys_for_user_id<K: Keyring + ?Sized>(
    keyring: &K,
    ctx: &Context,
    user_id: &str,
    format: &AuthorizedKeys,
) -> Result<Vec<String>> {
    let identity = Identity::parse(user_id)?;
    let verdicts = Evaluator::new(keyring, ctx).evaluate(&identity).await?;
    let stamp = ctx.stamp();
    Ok(verdicts
        .iter()
        .filter_map(|v| match v {
            KeyVerdict::Accepted(k) => Some(format.format(k, &stamp)),
            KeyVerdict::Rejected(..) => None,
        })
        .collect())
}

/// Build a user's system `authorized_keys` from scratch: keys for every
/// user ID in their `authorized_user_ids`, then their raw
/// `authorized_keys` verbatim. Inputs failing the permission check are
/// skipped.
pub async fn generate_for_user<K: Keyring + ?Sized>(
    keyring: &K,
    ctx: &Context,
    user: &UserInfo,
    auth: &AuthenticationConfig,
    format: &AuthorizedKeys,
) -> Result<(CredentialFile, UpdateSummary)> {
    let mut file = CredentialFile::new();
    let mut summary = UpdateSummary::new(output_path(auth, user));

    let ids_path = expand_path(&auth.authorized_user_ids, &user.home, &user.name);
    if ids_path.exists() {
        match check_if_strict(ctx.strict_modes, user, &ids_path) {
            Ok(()) => {
                let user_ids = read_user_ids(&ids_path)?;
                apply_user_ids(keyring, ctx, &mut file, &user_ids, format, &mut summary).await;
            }
            Err(e) => {
                warn!(user = %user.name, error = %e, "ignoring authorized_user_ids");
                summary.failed.push((ids_path.display().to_string(), e.to_string()));
            }
        }
    } else {
        debug!(user = %user.name, path = %ids_path.display(), "no authorized_user_ids");
    }

    if let Some(raw) = auth.raw_authorized_keys() {
        let raw_path = expand_path(raw, &user.home, &user.name);
        if raw_path.exists() {
            match check_if_strict(ctx.strict_modes, user, &raw_path) {
                Ok(()) => {
                    let text = std::fs::read_to_string(&raw_path).map_err(Error::io(&raw_path))?;
                    for line in text.lines() {
                        file.push_line(line);
                    }
                }
                Err(e) => {
                    warn!(user = %user.name, error = %e, "ignoring raw authorized_keys");
                    summary.failed.push((raw_path.display().to_string(), e.to_string()));
                }
            }
        }
    }
    Ok((file, summary))
}

pub fn output_path(auth: &AuthenticationConfig, user: &UserInfo) -> PathBuf {
    auth.output_dir().join(&user.name)
}

/// [`generate_for_user`] and write the result to the system data directory.
pub async fn update_user<K: Keyring + ?Sized>(
    keyring: &K,
    ctx: &Context,
    user: &UserInfo,
    auth: &AuthenticationConfig,
    format: &AuthorizedKeys,
) -> Result<UpdateSummary> {
    let dir = auth.output_dir();
    std::fs::create_dir_all(&dir).map_err(Error::io(&dir))?;
    let dest = output_path(auth, user);
    let _lock = FileLock::acquire(&dest)?;
    let (file, summary) = generate_for_user(keyring, ctx, user, auth, format).await?;
    commit::commit(&dest, &file, CommitOptions::SYSTEM)?;
    info!(
        user = %user.name,
        accepted = summary.accepted,
        lines = file.lines().len(),
        "authorized_keys generated"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    use super::*;
    use crate::guard::current_user;
    use crate::policy::tests::{ED_COLONS, FakeKeyring, SIMPLE_COLONS, ctx};

    const FOREIGN: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAFA4Anj0bOb13TOFalmJto6TXYfa0zXUMwXr+rSVVMk laptop";
    const STALE: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIC0hexX4Ag0YxTRdE2wYjwBlVKMH4a/shRHberwKzHMJ MonkeySphere2020-01-01T00:00:00 gone@example.org";

    fn keyring() -> FakeKeyring {
        FakeKeyring::new()
            .with_local("ssh://simple.example.org", SIMPLE_COLONS)
            .with_local("ssh://ed.example.org", ED_COLONS)
    }

    #[test]
    fn line_format() {
        let key = TranslatedKey {
            key: FOREIGN.parse().unwrap(),
            identity: Identity::parse("Alice <alice@example.org>").unwrap(),
            fingerprint: "F881BFF6097CAEB26D5C4A6EBC0E2C08A063F115".parse().unwrap(),
        };
        let stamp = ctx().stamp();
        let plain = AuthorizedKeys::default().format(&key, &stamp);
        assert_eq!(
            plain,
            "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAFA4Anj0bOb13TOFalmJto6TXYfa0zXUMwXr+rSVVMk \
             MonkeySphere2027-01-15T08:00:00 Alice <alice@example.org>"
        );
        let restricted = AuthorizedKeys {
            options: Some("no-X11-forwarding".into()),
        }
        .format(&key, &stamp);
        assert!(restricted.starts_with("no-X11-forwarding ssh-ed25519 "));
        assert!(AuthorizedKeys::default().matches(FOREIGN, &key));
    }

    #[tokio::test]
    async fn user_file_sweeps_managed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");
        fs::write(&path, format!("{FOREIGN}\n{STALE}\n")).unwrap();

        let ids = vec!["ssh://simple.example.org".to_string()];
        let summary = update_authorized_keys(&keyring(), &ctx(), &path, &ids, &AuthorizedKeys::default())
            .await
            .unwrap();
        assert_eq!(summary.accepted, 1);
        assert_eq!(summary.removed, 1);

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], FOREIGN);
        assert!(lines[1].starts_with("ssh-rsa "));
        assert!(lines[1].ends_with("MonkeySphere2027-01-15T08:00:00 ssh://simple.example.org"));
    }

    #[tokio::test]
    async fn bad_user_ids_are_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");
        let ids = vec![" padded".to_string(), "ssh://ed.example.org".to_string()];
        let summary = update_authorized_keys(&keyring(), &ctx(), &path, &ids, &AuthorizedKeys::default())
            .await
            .unwrap();
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.accepted, 1);
        assert!(fs::read_to_string(&path).unwrap().starts_with("ssh-ed25519 "));
    }

    #[tokio::test]
    async fn keys_for_user_id_lists_accepted_only() {
        let listing = SIMPLE_COLONS.replace("uid:u:", "uid:m:");
        let keyring = FakeKeyring::new()
            .with_local("ssh://simple.example.org", &listing)
            .with_local("ssh://ed.example.org", ED_COLONS);
        let fmt = AuthorizedKeys::default();
        assert!(keys_for_user_id(&keyring, &ctx(), "ssh://simple.example.org", &fmt)
            .await
            .unwrap()
            .is_empty());
        let lines = keys_for_user_id(&keyring, &ctx(), "ssh://ed.example.org", &fmt)
            .await
            .unwrap();
        assert_eq!(lines.len(), 1);
    }

    fn user_with_home(home: &Path) -> UserInfo {
        let mut user = current_user().unwrap();
        user.home = home.to_path_buf();
        user
    }

    fn auth_config(sysdata: &Path) -> AuthenticationConfig {
        AuthenticationConfig {
            sysdata_dir: sysdata.display().to_string(),
            ..AuthenticationConfig::default()
        }
    }

    #[tokio::test]
    async fn system_file_combines_user_ids_and_raw_keys() {
        let dir = tempfile::tempdir().unwrap();
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o700)).unwrap();
        let home = dir.path().join("home");
        fs::create_dir_all(home.join(".monkeysphere")).unwrap();
        fs::create_dir_all(home.join(".ssh")).unwrap();
        fs::write(
            home.join(".monkeysphere/authorized_user_ids"),
            "# who may log in\nssh://ed.example.org\n\n",
        )
        .unwrap();
        fs::write(home.join(".ssh/authorized_keys"), format!("{FOREIGN}\n")).unwrap();
        for private in [
            ".monkeysphere",
            ".ssh",
            ".monkeysphere/authorized_user_ids",
            ".ssh/authorized_keys",
        ] {
            fs::set_permissions(home.join(private), fs::Permissions::from_mode(0o700)).unwrap();
        }

        let user = user_with_home(&home);
        let auth = auth_config(&dir.path().join("sysdata"));
        let mut ctx = ctx();
        ctx.strict_modes = true;
        let summary = update_user(&keyring(), &ctx, &user, &auth, &AuthorizedKeys::default())
            .await
            .unwrap();
        assert!(summary.is_success());

        let out = output_path(&auth, &user);
        let text = fs::read_to_string(&out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIC0hexX4"));
        assert!(lines[0].ends_with(" ssh://ed.example.org"));
        assert_eq!(lines[1], FOREIGN);
    }

    #[tokio::test]
    async fn insecure_inputs_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o700)).unwrap();
        let home = dir.path().join("home");
        fs::create_dir_all(home.join(".monkeysphere")).unwrap();
        let ids = home.join(".monkeysphere/authorized_user_ids");
        fs::write(&ids, "ssh://ed.example.org\n").unwrap();
        fs::set_permissions(&ids, fs::Permissions::from_mode(0o666)).unwrap();

        let user = user_with_home(&home);
        let auth = auth_config(&dir.path().join("sysdata"));
        let mut ctx = ctx();
        ctx.strict_modes = true;
        let summary = update_user(&keyring(), &ctx, &user, &auth, &AuthorizedKeys::default())
            .await
            .unwrap();
        assert_eq!(summary.failed.len(), 1);
        // nothing generated, so no file
        assert!(!output_path(&auth, &user).exists());

        ctx.strict_modes = false;
        let summary = update_user(&keyring(), &ctx, &user, &auth, &AuthorizedKeys::default())
            .await
            .unwrap();
        assert!(summary.is_success());
        assert!(output_path(&auth, &user).exists());
    }
}
