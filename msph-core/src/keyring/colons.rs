//! GnuPG `--with-colons` listings.
//!
//! Parsing is split in two: [`parse_records`] turns lines into typed
//! [`ColonRecord`]s, and [`Certificate::from_records`] folds a record stream
//! into certificates. Neither touches a process.

use chrono::{DateTime, NaiveDateTime, Utc};
use msph_openpgp::Fingerprint;
use tracing::debug;

use crate::{Capability, Validity};

/// Record type (field 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Public,
    Secret,
    Subkey,
    SecretSubkey,
    UserId,
    UserAttribute,
    Fingerprint,
    Keygrip,
    Signature,
    Revocation,
    Trust,
    Other,
}

impl RecordType {
    fn from_field(field: &str) -> Self {
        match field {
            "pub" => Self::Public,
            "sec" => Self::Secret,
            "sub" => Self::Subkey,
            "ssb" => Self::SecretSubkey,
            "uid" => Self::UserId,
            "uat" => Self::UserAttribute,
            "fpr" => Self::Fingerprint,
            "grp" => Self::Keygrip,
            "sig" => Self::Signature,
            "rev" => Self::Revocation,
            "tru" => Self::Trust,
            _ => Self::Other,
        }
    }
}

/// One colon-separated line, fields named by their role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColonRecord {
    pub kind: RecordType,
    pub validity: Validity,
    pub algorithm: Option<u8>,
    pub key_id: String,
    pub created: Option<DateTime<Utc>>,
    pub expires: Option<DateTime<Utc>>,
    /// Field 8: per-UID hash on `uid` records.
    pub hash: String,
    /// Field 10, unescaped: user ID text or fingerprint.
    pub user_id: String,
    pub capabilities: String,
}

impl ColonRecord {
    pub fn parse(line: &str) -> Self {
        let fields: Vec<&str> = line.split(':').collect();
        let field = |n: usize| fields.get(n - 1).copied().unwrap_or("");
        Self {
            kind: RecordType::from_field(field(1)),
            validity: Validity::from_code(field(2)),
            algorithm: field(4).parse().ok(),
            key_id: field(5).to_string(),
            created: parse_time(field(6)),
            expires: parse_time(field(7)),
            hash: field(8).to_string(),
            user_id: unescape(field(10)),
            capabilities: field(12).to_string(),
        }
    }
}

pub fn parse_records(text: &str) -> Vec<ColonRecord> {
    text.lines()
        .filter(|l| !l.is_empty())
        .map(ColonRecord::parse)
        .collect()
}

/// Decode GnuPG's `\xHH` escapes. Invalid UTF-8 is replaced, which can only
/// make a user ID fail to match.
pub fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && bytes.get(i + 1) == Some(&b'x')
            && let Some(hex) = field.get(i + 2..i + 4)
            && let Ok(b) = u8::from_str_radix(hex, 16)
        {
            out.push(b);
            i += 4;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Seconds since the epoch, or `YYYYMMDDThhmmss` in newer listings.
fn parse_time(field: &str) -> Option<DateTime<Utc>> {
    if field.is_empty() {
        return None;
    }
    if let Ok(secs) = field.parse::<i64>() {
        return DateTime::from_timestamp(secs, 0);
    }
    NaiveDateTime::parse_from_str(field, "%Y%m%dT%H%M%S")
        .ok()
        .map(|t| t.and_utc())
}

// ---------------------------------------------------------------------------
// Certificates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub fingerprint: Fingerprint,
    pub key_id: String,
    pub validity: Validity,
    pub algorithm: Option<u8>,
    pub created: Option<DateTime<Utc>>,
    pub expires: Option<DateTime<Utc>>,
    pub capabilities: String,
    /// gpg-agent keygrip, present in `--with-keygrip` listings.
    pub keygrip: Option<String>,
}

impl KeyInfo {
    /// The key itself carries `cap`.
    pub fn can(&self, cap: Capability) -> bool {
        self.capabilities.contains(cap.letter())
    }

    /// The certificate as a whole (primary or any usable subkey) carries `cap`.
    pub fn can_aggregate(&self, cap: Capability) -> bool {
        self.capabilities.contains(cap.aggregate_letter())
    }

    pub fn disabled(&self) -> bool {
        self.capabilities.contains('D') || self.validity == Validity::Disabled
    }

    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        self.validity == Validity::Expired || self.expires.is_some_and(|e| e <= now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdBinding {
    pub text: String,
    pub validity: Validity,
    pub created: Option<DateTime<Utc>>,
    pub expires: Option<DateTime<Utc>>,
    pub hash: String,
}

impl UserIdBinding {
    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        self.validity == Validity::Expired || self.expires.is_some_and(|e| e <= now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    pub primary: KeyInfo,
    pub user_ids: Vec<UserIdBinding>,
    pub subkeys: Vec<KeyInfo>,
    /// Listed from the secret keyring.
    pub secret: bool,
}

impl Certificate {
    pub fn parse_listing(text: &str) -> Vec<Self> {
        Self::from_records(parse_records(text))
    }

    /// Fold records into certificates.
    ///
    /// A key record only becomes a [`KeyInfo`] once its `fpr` record
    /// arrives; keys listed without one are dropped.
    pub fn from_records(records: impl IntoIterator<Item = ColonRecord>) -> Vec<Self> {
        let mut certs = Vec::new();
        let mut current: Option<Certificate> = None;
        let mut pending: Option<(RecordType, ColonRecord)> = None;

        for record in records {
            match record.kind {
                RecordType::Public | RecordType::Secret => {
                    drop_unfingerprinted(pending.take());
                    certs.extend(current.take());
                    pending = Some((record.kind, record));
                }
                RecordType::Subkey | RecordType::SecretSubkey => {
                    drop_unfingerprinted(pending.take());
                    if current.is_some() {
                        pending = Some((record.kind, record));
                    }
                }
                RecordType::Fingerprint => {
                    let Some((kind, key)) = pending.take() else {
                        continue;
                    };
                    let Ok(fingerprint) = record.user_id.parse::<Fingerprint>() else {
                        debug!(key_id = %key.key_id, "unparseable fpr record, dropping key");
                        continue;
                    };
                    let info = KeyInfo {
                        fingerprint,
                        key_id: key.key_id,
                        validity: key.validity,
                        algorithm: key.algorithm,
                        created: key.created,
                        expires: key.expires,
                        capabilities: key.capabilities,
                        keygrip: None,
                    };
                    match kind {
                        RecordType::Public | RecordType::Secret => {
                            current = Some(Certificate {
                                primary: info,
                                user_ids: Vec::new(),
                                subkeys: Vec::new(),
                                secret: kind == RecordType::Secret,
                            });
                        }
                        _ => {
                            if let Some(cert) = current.as_mut() {
                                cert.subkeys.push(info);
                            }
                        }
                    }
                }
                RecordType::UserId => {
                    drop_unfingerprinted(pending.take());
                    if let Some(cert) = current.as_mut() {
                        cert.user_ids.push(UserIdBinding {
                            text: record.user_id,
                            validity: record.validity,
                            created: record.created,
                            expires: record.expires,
                            hash: record.hash,
                        });
                    }
                }
                RecordType::Keygrip => {
                    // follows the fpr of the key it belongs to
                    if pending.is_none()
                        && let Some(cert) = current.as_mut()
                    {
                        let key = cert.subkeys.last_mut().unwrap_or(&mut cert.primary);
                        key.keygrip = Some(record.user_id);
                    }
                }
                RecordType::UserAttribute
                | RecordType::Signature
                | RecordType::Revocation
                | RecordType::Trust
                | RecordType::Other => {}
            }
        }
        drop_unfingerprinted(pending);
        certs.extend(current);
        certs
    }

    pub fn user_id(&self, text: &str) -> Option<&UserIdBinding> {
        self.user_ids.iter().find(|u| u.text == text)
    }

    /// Primary and subkeys, primary first.
    pub fn keys(&self) -> impl Iterator<Item = &KeyInfo> {
        std::iter::once(&self.primary).chain(self.subkeys.iter())
    }
}

fn drop_unfingerprinted(pending: Option<(RecordType, ColonRecord)>) {
    if let Some((_, key)) = pending {
        debug!(key_id = %key.key_id, "key listed without fingerprint, dropping");
    }
}
