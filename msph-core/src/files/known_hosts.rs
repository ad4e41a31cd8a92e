//! `known_hosts` generation.

use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use tracing::{info, warn};

use super::commit::{self, CommitOptions, FileLock};
use super::{CredentialFile, CredentialFormat, GenerationStamp, UpdateSummary, line_key};
use crate::Context;
use crate::error::{Error, Result};
use crate::identity::{Identity, ServiceId};
use crate::keyring::Keyring;
use crate::policy::{Evaluator, TranslatedKey};

const HASH_MAGIC: &str = "|1|";
const SALT_LEN: usize = 20;

type HmacSha1 = Hmac<Sha1>;

/// `<host> <type> <base64> <stamp>` lines, optionally with hashed hosts.
#[derive(Debug, Clone, Copy)]
pub struct KnownHosts {
    pub hash: bool,
}

impl CredentialFormat for KnownHosts {
    fn matches(&self, line: &str, key: &TranslatedKey) -> bool {
        let Identity::Service(service) = &key.identity else {
            return false;
        };
        let Some(hosts) = host_field(line) else {
            return false;
        };
        host_field_matches(hosts, &service.known_hosts_name())
            && line_key(line).is_some_and(|k| k == key.key)
    }

    fn format(&self, key: &TranslatedKey, stamp: &GenerationStamp) -> String {
        let name = match &key.identity {
            Identity::Service(s) => s.known_hosts_name(),
            Identity::User(u) => u.clone(),
        };
        let host = if self.hash { hash_host(&name) } else { name };
        format!("{host} {} {stamp}", key.key)
    }
}

/// `|1|base64(salt)|base64(HMAC-SHA1(salt, host))` with a fresh salt.
pub fn hash_host(host: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::rng().fill_bytes(&mut salt);
    hash_host_with_salt(host, &salt)
}

fn hash_host_with_salt(host: &str, salt: &[u8]) -> String {
    format!("{HASH_MAGIC}{}|{}", B64.encode(salt), B64.encode(host_hmac(host, salt)))
}

fn host_hmac(host: &str, salt: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha1::new_from_slice(salt).expect("HMAC key size is valid");
    mac.update(host.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// The host-pattern field, skipping a leading `@marker`.
fn host_field(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let mut fields = trimmed.split_whitespace();
    let first = fields.next()?;
    if first.starts_with('@') {
        fields.next()
    } else {
        Some(first)
    }
}

/// Whether a host field names `name`, in clear or hashed form.
pub fn host_field_matches(field: &str, name: &str) -> bool {
    if let Some(hashed) = field.strip_prefix(HASH_MAGIC) {
        let Some((salt, digest)) = hashed.split_once('|') else {
            return false;
        };
        let (Ok(salt), Ok(digest)) = (B64.decode(salt), B64.decode(digest)) else {
            return false;
        };
        return host_hmac(name, &salt) == digest;
    }
    field.split(',').any(|p| p.eq_ignore_ascii_case(name))
}

/// Every plain host named in `file`. Hashed entries and `@`-marker lines
/// cannot be recovered and are skipped.
pub fn hosts_in(file: &CredentialFile) -> Vec<ServiceId> {
    let mut hosts: Vec<ServiceId> = Vec::new();
    for line in file.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with('@') {
            continue;
        }
        let Some(field) = host_field(trimmed) else {
            continue;
        };
        if field.starts_with(HASH_MAGIC) {
            continue;
        }
        for pattern in field.split(',') {
            if let Some(id) = ServiceId::from_known_hosts_name(pattern)
                && !hosts.contains(&id)
            {
                hosts.push(id);
            }
        }
    }
    hosts
}

/// Whether `file` already holds a key for `host` (revoked entries excluded).
pub fn has_host_key(file: &CredentialFile, host: &ServiceId) -> bool {
    let name = host.known_hosts_name();
    file.lines().iter().any(|line| {
        !line.trim_start().starts_with("@revoked")
            && host_field(line).is_some_and(|f| host_field_matches(f, &name))
            && line_key(line).is_some()
    })
}

/// Regenerate the monkeysphere entries of `path` for `hosts`; with no
/// hosts, for every host already named in the file.
pub async fn update_known_hosts<K: Keyring + ?Sized>(
    keyring: &K,
    ctx: &Context,
    path: &Path,
    hosts: &[ServiceId],
    hash: bool,
) -> Result<UpdateSummary> {
    update(keyring, ctx, path, hosts, hash, false).await
}

/// Update `path` for the one host ssh is about to connect to.
///
/// Under [`KeyserverPolicy::Auto`](crate::KeyserverPolicy::Auto) the
/// keyserver is only consulted when `path` holds no key for `host` yet.
pub async fn check_host<K: Keyring + ?Sized>(
    keyring: &K,
    ctx: &Context,
    path: &Path,
    host: &ServiceId,
    hash: bool,
) -> Result<UpdateSummary> {
    update(keyring, ctx, path, std::slice::from_ref(host), hash, true).await
}

async fn update<K: Keyring + ?Sized>(
    keyring: &K,
    ctx: &Context,
    path: &Path,
    hosts: &[ServiceId],
    hash: bool,
    hint_from_file: bool,
) -> Result<UpdateSummary> {
    let _lock = FileLock::acquire(path)?;
    let mut file = commit::load(path)?;
    let hosts = if hosts.is_empty() {
        hosts_in(&file)
    } else {
        hosts.to_vec()
    };
    let format = KnownHosts { hash };
    let stamp = ctx.stamp();
    let evaluator = Evaluator::new(keyring, ctx);
    let mut summary = UpdateSummary::new(path);

    for host in hosts {
        let identity = Identity::Service(host.clone());
        let hint = hint_from_file.then(|| has_host_key(&file, &host));
        match evaluator.evaluate_with_hint(&identity, hint).await {
            Ok(verdicts) => {
                let applied = file.apply(&verdicts, &format, &stamp);
                summary.record(&verdicts, applied);
            }
            Err(Error::NoPrimaryKeys(uid)) => {
                info!(host = %host, "no OpenPGP certificate for host");
                summary.processed += 1;
                summary.unknown.push(uid);
            }
            Err(e) => {
                warn!(host = %host, error = %e, "cannot evaluate host");
                summary.failed.push((host.to_string(), e.to_string()));
            }
        }
    }

    commit::commit(path, &file, CommitOptions::USER)?;
    info!(
        path = %path.display(),
        hosts = summary.processed,
        accepted = summary.accepted,
        removed = summary.removed,
        "known_hosts updated"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering as AtomicOrdering;

    use super::*;
    use crate::KeyserverPolicy;
    use crate::policy::KeyVerdict;
    use crate::policy::tests::{FakeKeyring, HOST_COLONS, SIMPLE_COLONS, ctx};

    const ED_LINE: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAFA4Anj0bOb13TOFalmJto6TXYfa0zXUMwXr+rSVVMk";

    #[test]
    fn hashed_hosts_match_only_their_name() {
        let hashed = hash_host("host.example.org");
        assert!(hashed.starts_with("|1|"));
        assert!(host_field_matches(&hashed, "host.example.org"));
        assert!(!host_field_matches(&hashed, "other.example.org"));
        // salts differ between calls
        assert_ne!(hashed, hash_host("host.example.org"));
        assert!(!host_field_matches("|1|garbage", "host.example.org"));
    }

    #[test]
    fn hash_vector() {
        let salt: Vec<u8> = (0..20).collect();
        assert_eq!(
            hash_host_with_salt("host.example.org", &salt),
            "|1|AAECAwQFBgcICQoLDA0ODxAREhM=|ruxWbvXAOX2yXIbyTaK8JZ50uWk="
        );
    }

    #[test]
    fn clear_host_lists() {
        assert!(host_field_matches("a.example.org,host.example.org", "host.example.org"));
        assert!(host_field_matches("[Host.example.org]:2222", "[host.example.org]:2222"));
        assert!(!host_field_matches("host.example.org", "[host.example.org]:2222"));
    }

    #[test]
    fn hosts_from_existing_file() {
        let file = CredentialFile::parse(&format!(
            "# comment\n\
             host.example.org,10.1.1.1 {ED_LINE}\n\
             [alt.example.org]:2222 {ED_LINE}\n\
             |1|abc|def {ED_LINE}\n\
             @cert-authority *.example.org {ED_LINE}\n\
             host.example.org {ED_LINE} MonkeySphere2027-01-15T08:00:00\n"
        ));
        let hosts: Vec<String> = hosts_in(&file).iter().map(ToString::to_string).collect();
        assert_eq!(
            hosts,
            ["ssh://host.example.org", "ssh://10.1.1.1", "ssh://alt.example.org:2222"]
        );
    }

    #[test]
    fn host_key_presence() {
        let host = ServiceId::parse("ssh://host.example.org").unwrap();
        let hashed = CredentialFile::parse(&format!("{} {ED_LINE}", hash_host("host.example.org")));
        assert!(has_host_key(&hashed, &host));
        let revoked = CredentialFile::parse(&format!("@revoked host.example.org {ED_LINE}"));
        assert!(!has_host_key(&revoked, &host));
        assert!(!has_host_key(&CredentialFile::new(), &host));
    }

    async fn run(path: &Path, keyring: &FakeKeyring, hash: bool) -> UpdateSummary {
        let host = ServiceId::parse("ssh://host.example.org").unwrap();
        update_known_hosts(keyring, &ctx(), path, &[host], hash)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn writes_host_lines_and_keeps_foreign_ones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        std::fs::write(&path, format!("other.example.org {ED_LINE}\n")).unwrap();
        let keyring = FakeKeyring::new().with_local("ssh://host.example.org", HOST_COLONS);

        let summary = run(&path, &keyring, false).await;
        assert_eq!(summary.accepted, 2);
        assert!(summary.is_success());

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], format!("other.example.org {ED_LINE}"));
        assert!(lines[1..].iter().all(|l| l.starts_with("host.example.org ssh-")));
        assert!(lines[1..].iter().all(|l| l.ends_with("MonkeySphere2027-01-15T08:00:00")));
    }

    #[tokio::test]
    async fn regeneration_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let keyring = FakeKeyring::new().with_local("ssh://host.example.org", HOST_COLONS);

        run(&path, &keyring, false).await;
        let first = std::fs::read_to_string(&path).unwrap();
        let summary = run(&path, &keyring, false).await;
        let second = std::fs::read_to_string(&path).unwrap();
        assert_eq!(first, second);
        assert_eq!(summary.removed, 2);
    }

    #[tokio::test]
    async fn downgraded_user_id_removes_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let good = FakeKeyring::new().with_local("ssh://host.example.org", HOST_COLONS);
        run(&path, &good, true).await;
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);

        let listing = HOST_COLONS.replace("uid:u:", "uid:m:");
        let downgraded = FakeKeyring::new().with_local("ssh://host.example.org", &listing);
        let summary = run(&path, &downgraded, true).await;
        assert_eq!(summary.rejected, 2);
        assert_eq!(summary.removed, 2);
        // nothing left, so the file is removed
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn no_hosts_means_hosts_in_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        std::fs::write(&path, format!("simple.example.org {ED_LINE}\n")).unwrap();
        let keyring = FakeKeyring::new().with_local("ssh://simple.example.org", SIMPLE_COLONS);
        let summary = update_known_hosts(&keyring, &ctx(), &path, &[], false)
            .await
            .unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.accepted, 1);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("simple.example.org ssh-rsa "));
    }

    #[tokio::test]
    async fn unknown_hosts_are_not_failures() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let summary = run(&path, &FakeKeyring::new(), false).await;
        assert!(summary.is_success());
        assert_eq!(summary.unknown, ["ssh://host.example.org"]);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn only_the_proxy_path_trusts_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let host = ServiceId::parse("ssh://host.example.org").unwrap();
        let mut ctx = ctx();
        ctx.keyserver = KeyserverPolicy::Auto;

        // on file, but not in the local keyring
        std::fs::write(&path, format!("host.example.org {ED_LINE}\n")).unwrap();
        let keyring = FakeKeyring::new().with_remote("ssh://host.example.org", HOST_COLONS);
        let summary = check_host(&keyring, &ctx, &path, &host, false).await.unwrap();
        assert_eq!(keyring.refreshes.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(summary.unknown, ["ssh://host.example.org"]);

        let summary = update_known_hosts(&keyring, &ctx, &path, &[host.clone()], false)
            .await
            .unwrap();
        assert_eq!(keyring.refreshes.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(summary.accepted, 2);

        // not on file: the proxy path refreshes too
        std::fs::remove_file(&path).unwrap();
        let keyring = FakeKeyring::new().with_remote("ssh://host.example.org", HOST_COLONS);
        let summary = check_host(&keyring, &ctx, &path, &host, false).await.unwrap();
        assert_eq!(keyring.refreshes.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(summary.accepted, 2);
    }

    #[test]
    fn format_uses_port_brackets() {
        let keyring_key = TranslatedKey {
            key: ED_LINE.parse().unwrap(),
            identity: Identity::parse("ssh://host.example.org:2222").unwrap(),
            fingerprint: "CD9C4FDC2714433CD3D3D71920769B0F7CC2E3DB".parse().unwrap(),
        };
        let stamp = GenerationStamp("MonkeySphere2027-01-15T08:00:00".into());
        let line = KnownHosts { hash: false }.format(&keyring_key, &stamp);
        assert_eq!(line, format!("[host.example.org]:2222 {ED_LINE} {stamp}"));
        assert!(KnownHosts { hash: true }.matches(&line, &keyring_key));

        let mut file = CredentialFile::parse(&line);
        let applied = file.apply(&[KeyVerdict::Accepted(keyring_key)], &KnownHosts { hash: true }, &stamp);
        assert_eq!(applied.removed, 1);
        assert_eq!(applied.added, 1);
        assert!(file.lines()[0].starts_with("|1|"));
    }
}
