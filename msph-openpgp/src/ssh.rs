//! OpenSSH public key lines (`ssh-rsa AAAA…`, `ssh-ed25519 AAAA…`).

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use ssh_key::public::{Ed25519PublicKey, KeyData, RsaPublicKey};
use ssh_key::{HashAlg, Mpint, PublicKey};

use crate::error::CodecError;
use crate::key::{KeyMaterial, PublicParams};

pub const SSH_RSA: &str = "ssh-rsa";
pub const SSH_ED25519: &str = "ssh-ed25519";

/// An RSA or Ed25519 SSH public key without a comment.
///
/// Equality, ordering and hashing use the key type and wire blob only, so
/// the same key found in two files with different comments compares equal.
#[derive(Clone)]
pub struct SshPublicKey {
    key: PublicKey,
    key_type: &'static str,
    blob: Vec<u8>,
    line: String,
}

impl SshPublicKey {
    fn from_key_data(data: KeyData) -> Result<Self, CodecError> {
        let key_type = match &data {
            KeyData::Rsa(_) => SSH_RSA,
            KeyData::Ed25519(_) => SSH_ED25519,
            other => {
                return Err(CodecError::SshFormat(format!(
                    "unsupported key type '{}'",
                    other.algorithm()
                )));
            }
        };
        let key = PublicKey::new(data, "");
        let blob = key.to_bytes()?;
        let line = key.to_openssh()?;
        Ok(Self {
            key,
            key_type,
            blob,
            line,
        })
    }

    pub fn from_public_params(public: &PublicParams) -> Result<Self, CodecError> {
        let data = match public {
            PublicParams::Rsa { n, e } => KeyData::Rsa(RsaPublicKey {
                e: Mpint::from_positive_bytes(e)?,
                n: Mpint::from_positive_bytes(n)?,
            }),
            PublicParams::Ed25519 { point } => KeyData::Ed25519(Ed25519PublicKey(*point)),
            PublicParams::Unsupported { algorithm } => {
                return Err(CodecError::Unsupported(format!(
                    "no SSH encoding for public key algorithm {algorithm}"
                )));
            }
        };
        Self::from_key_data(data)
    }

    pub fn from_material(material: &KeyMaterial) -> Result<Self, CodecError> {
        Self::from_public_params(&material.public)
    }

    pub fn key_type(&self) -> &'static str {
        self.key_type
    }

    /// The wire-format blob.
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.key
    }

    /// OpenSSH-style `SHA256:…` fingerprint.
    pub fn sha256_fingerprint(&self) -> String {
        self.key.fingerprint(HashAlg::Sha256).to_string()
    }
}

impl PartialEq for SshPublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.blob == other.blob
    }
}

impl Eq for SshPublicKey {}

impl Hash for SshPublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.blob.hash(state);
    }
}

impl PartialOrd for SshPublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SshPublicKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key_type
            .cmp(other.key_type)
            .then_with(|| self.blob.cmp(&other.blob))
    }
}

impl fmt::Display for SshPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line)
    }
}

impl fmt::Debug for SshPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SshPublicKey({})", self.sha256_fingerprint())
    }
}

impl FromStr for SshPublicKey {
    type Err = CodecError;

    /// Parse `<type> <base64> [comment]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split_whitespace();
        let (Some(kind), Some(data)) = (fields.next(), fields.next()) else {
            return Err(CodecError::SshFormat("expected '<type> <base64>'".into()));
        };
        let key = PublicKey::from_openssh(&format!("{kind} {data}"))
            .map_err(|e| CodecError::SshFormat(format!("'{kind}' key: {e}")))?;
        Self::from_key_data(key.key_data().clone())
    }
}
