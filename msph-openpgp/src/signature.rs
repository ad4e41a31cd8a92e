//! Version-4 self-certification signatures (RFC 4880 §5.2.3).
//!
//! Only what is needed to bind a freshly imported RSA key to one user ID:
//! a positive certification made with SHA-256 and PKCS#1 v1.5 padding.

use std::fmt;
use std::ops::BitOr;

use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use sha2::{Digest, Sha256};

use crate::error::CodecError;
use crate::key::{ALGO_RSA, Fingerprint};
use crate::mpi::mpi_pack;

pub const SIG_POSITIVE_CERTIFICATION: u8 = 0x13;
pub const HASH_SHA256: u8 = 8;

pub mod subpacket {
    pub const CREATION_TIME: u8 = 2;
    pub const KEY_EXPIRATION: u8 = 9;
    pub const PREFERRED_SYMMETRIC: u8 = 11;
    pub const ISSUER: u8 = 16;
    pub const PREFERRED_HASH: u8 = 21;
    pub const PREFERRED_COMPRESSION: u8 = 22;
    pub const KEYSERVER_PREFERENCES: u8 = 23;
    pub const KEY_FLAGS: u8 = 27;
    pub const FEATURES: u8 = 30;
    pub const ISSUER_FINGERPRINT: u8 = 33;
}

/// AES256, AES192, AES128, CAST5, 3DES.
const PREFERRED_SYMMETRIC: &[u8] = &[9, 8, 7, 3, 2];
/// SHA512, SHA384, SHA256, SHA224, RIPEMD160, SHA1.
const PREFERRED_HASH: &[u8] = &[10, 9, 8, 11, 3, 2];
/// ZLIB, BZip2, ZIP.
const PREFERRED_COMPRESSION: &[u8] = &[2, 3, 1];
/// Modification detection.
const FEATURES_MDC: &[u8] = &[0x01];
/// No-modify.
const KEYSERVER_NO_MODIFY: &[u8] = &[0x80];

/// Key usage flags carried in the key-flags subpacket.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct KeyUsage(u8);

impl KeyUsage {
    pub const NONE: Self = Self(0x00);
    pub const CERTIFY: Self = Self(0x01);
    pub const SIGN: Self = Self(0x02);
    pub const ENCRYPT_COMMS: Self = Self(0x04);
    pub const ENCRYPT_STORAGE: Self = Self(0x08);
    pub const AUTHENTICATE: Self = Self(0x20);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Parse a comma-separated list such as `sign,auth`.
    ///
    /// Certification is always included since the flags describe a primary
    /// key.
    pub fn from_names(list: &str) -> Result<Self, CodecError> {
        let mut usage = Self::CERTIFY;
        for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            usage = usage
                | match name {
                    "certify" => Self::CERTIFY,
                    "sign" => Self::SIGN,
                    "auth" | "authenticate" | "authentication" => Self::AUTHENTICATE,
                    "encrypt_comms" | "encrypt-comms" => Self::ENCRYPT_COMMS,
                    "encrypt_storage" | "encrypt-storage" => Self::ENCRYPT_STORAGE,
                    "encrypt" => Self::ENCRYPT_COMMS | Self::ENCRYPT_STORAGE,
                    other => {
                        return Err(CodecError::Unsupported(format!(
                            "unknown key usage '{other}'"
                        )));
                    }
                };
        }
        Ok(usage)
    }
}

impl BitOr for KeyUsage {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for KeyUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyUsage(0x{:02x})", self.0)
    }
}

/// Parameters of a self-certification.
#[derive(Debug, Clone, Copy)]
pub struct CertificationParams {
    pub created: u32,
    pub usage: KeyUsage,
    /// Key lifetime in seconds after key creation.
    pub key_expires_after: Option<u32>,
}

fn subpacket(kind: u8, data: &[u8]) -> Vec<u8> {
    let len = data.len() + 1;
    let mut out = Vec::with_capacity(len + 2);
    if len < 192 {
        out.push(len as u8);
    } else {
        let adj = len - 192;
        out.push(((adj >> 8) + 192) as u8);
        out.push((adj & 0xff) as u8);
    }
    out.push(kind);
    out.extend_from_slice(data);
    out
}

fn hashed_subpackets(issuer: &Fingerprint, params: &CertificationParams) -> Vec<u8> {
    let mut issuer_fpr = vec![4u8];
    issuer_fpr.extend_from_slice(issuer.as_bytes());

    let mut out = subpacket(subpacket::ISSUER_FINGERPRINT, &issuer_fpr);
    out.extend(subpacket(
        subpacket::CREATION_TIME,
        &params.created.to_be_bytes(),
    ));
    out.extend(subpacket(subpacket::KEY_FLAGS, &[params.usage.bits()]));
    if let Some(expires) = params.key_expires_after {
        out.extend(subpacket(subpacket::KEY_EXPIRATION, &expires.to_be_bytes()));
    }
    out.extend(subpacket(subpacket::PREFERRED_SYMMETRIC, PREFERRED_SYMMETRIC));
    out.extend(subpacket(subpacket::PREFERRED_HASH, PREFERRED_HASH));
    out.extend(subpacket(
        subpacket::PREFERRED_COMPRESSION,
        PREFERRED_COMPRESSION,
    ));
    out.extend(subpacket(subpacket::FEATURES, FEATURES_MDC));
    out.extend(subpacket(
        subpacket::KEYSERVER_PREFERENCES,
        KEYSERVER_NO_MODIFY,
    ));
    out
}

/// Build the body of a positive certification of `user_id` by `key`.
///
/// `public_body` is the key's public key packet body; `fingerprint` must be
/// computed from it.
pub fn certify_user_id(
    key: &RsaPrivateKey,
    public_body: &[u8],
    fingerprint: &Fingerprint,
    user_id: &[u8],
    params: &CertificationParams,
) -> Result<Vec<u8>, CodecError> {
    let hashed = hashed_subpackets(fingerprint, params);
    let unhashed = subpacket(subpacket::ISSUER, &fingerprint.key_id());

    let mut prefix = vec![
        4,
        SIG_POSITIVE_CERTIFICATION,
        ALGO_RSA,
        HASH_SHA256,
    ];
    prefix.extend_from_slice(&(hashed.len() as u16).to_be_bytes());
    prefix.extend_from_slice(&hashed);

    let mut hasher = Sha256::new();
    hasher.update([0x99]);
    hasher.update((public_body.len() as u16).to_be_bytes());
    hasher.update(public_body);
    hasher.update([0xb4]);
    hasher.update((user_id.len() as u32).to_be_bytes());
    hasher.update(user_id);
    hasher.update(&prefix);
    hasher.update([0x04, 0xff]);
    hasher.update((prefix.len() as u32).to_be_bytes());
    let digest = hasher.finalize();

    let signature = key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest)?;

    let mut body = prefix;
    body.extend_from_slice(&(unhashed.len() as u16).to_be_bytes());
    body.extend_from_slice(&unhashed);
    body.extend_from_slice(&digest[..2]);
    body.extend_from_slice(&mpi_pack(&signature)?);
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_names() {
        let usage = KeyUsage::from_names("sign, auth").unwrap();
        assert_eq!(usage.bits(), 0x23);
        assert!(usage.contains(KeyUsage::AUTHENTICATE));
        assert!(!usage.contains(KeyUsage::ENCRYPT_COMMS));
        assert_eq!(KeyUsage::from_names("").unwrap(), KeyUsage::CERTIFY);
        assert_eq!(KeyUsage::from_names("encrypt").unwrap().bits(), 0x0d);
        assert!(KeyUsage::from_names("teleport").is_err());
    }

    #[test]
    fn subpacket_lengths() {
        assert_eq!(subpacket(27, &[0x21]), vec![2, 27, 0x21]);
        let long = subpacket(20, &[0u8; 200]);
        // 201 = 192 + 9  ->  0xc0 0x09
        assert_eq!(&long[..3], &[0xc0, 0x09, 20]);
    }

    #[test]
    fn hashed_area_order() {
        let fpr = Fingerprint::from_bytes([0xab; 20]);
        let params = CertificationParams {
            created: 1,
            usage: KeyUsage::CERTIFY | KeyUsage::AUTHENTICATE,
            key_expires_after: Some(86400),
        };
        let area = hashed_subpackets(&fpr, &params);
        let mut kinds = Vec::new();
        let mut rest = area.as_slice();
        while let Some((&len, tail)) = rest.split_first() {
            kinds.push(tail[0]);
            rest = &tail[len as usize..];
        }
        assert_eq!(kinds, vec![33, 2, 27, 9, 11, 21, 22, 30, 23]);
    }
}
