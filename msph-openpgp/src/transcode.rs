//! Conversions between OpenPGP packet streams, PEM and OpenSSH private keys.

use std::time::{SystemTime, UNIX_EPOCH};

use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, EncodeRsaPublicKey, LineEnding};
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use ssh_key::private::{Ed25519Keypair, Ed25519PrivateKey, KeypairData, RsaKeypair};
use ssh_key::public::Ed25519PublicKey;
use ssh_key::{Mpint, PrivateKey};
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::CodecError;
use crate::key::{
    Fingerprint, KeyMaterial, KeyPacket, PublicParams, SecretParams, checksum16, public_key_body,
};
use crate::mpi::mod_inverse;
use crate::packet::{Packets, Tag, write_packet};
use crate::signature::{CertificationParams, KeyUsage, certify_user_id};

/// Options for [`pem_to_openpgp`].
#[derive(Debug, Clone, Copy)]
pub struct PemImportOptions {
    /// Key creation time; defaults to now.
    pub key_created: Option<u32>,
    /// Self-signature creation time; defaults to now.
    pub signature_created: Option<u32>,
    pub usage: KeyUsage,
    /// Key lifetime in seconds after creation.
    pub expires_after: Option<u32>,
}

impl Default for PemImportOptions {
    fn default() -> Self {
        Self {
            key_created: None,
            signature_created: None,
            usage: KeyUsage::CERTIFY,
            expires_after: None,
        }
    }
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Parse an RSA private key from PKCS#1 (`RSA PRIVATE KEY`) or PKCS#8 PEM.
pub fn parse_rsa_pem(pem: &str) -> Result<RsaPrivateKey, CodecError> {
    RsaPrivateKey::from_pkcs1_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
        .map_err(|e| CodecError::Pem(e.to_string()))
}

/// Wrap an RSA private key in PEM form as an unprotected OpenPGP secret key
/// (secret key packet, user ID packet, positive self-certification).
///
/// The primes are stored smaller first, as OpenPGP requires, whatever their
/// order in the PEM. Converting back therefore yields `p < q`.
pub fn pem_to_openpgp(
    user_id: &str,
    pem: &str,
    options: &PemImportOptions,
) -> Result<Zeroizing<Vec<u8>>, CodecError> {
    let key = parse_rsa_pem(pem)?;
    rsa_to_openpgp(user_id, &key, options)
}

/// As [`pem_to_openpgp`], starting from a parsed key.
pub fn rsa_to_openpgp(
    user_id: &str,
    key: &RsaPrivateKey,
    options: &PemImportOptions,
) -> Result<Zeroizing<Vec<u8>>, CodecError> {
    let now = unix_now();
    let key_created = options.key_created.unwrap_or(now);
    let sig_created = options.signature_created.unwrap_or(now);
    if key_created > sig_created {
        return Err(CodecError::Timestamp {
            key: key_created,
            signature: sig_created,
        });
    }

    let public = PublicParams::Rsa {
        n: key.n().to_bytes_be(),
        e: key.e().to_bytes_be(),
    };
    let public_body = public_key_body(key_created, &public)?;
    let fingerprint = Fingerprint::of_public_body(&public_body);

    let secret = openpgp_secret_params(key)?;
    let secret_mpis = secret.encode()?;

    let mut secret_body = Zeroizing::new(public_body.clone());
    secret_body.push(0); // S2K usage: unprotected
    secret_body.extend_from_slice(&secret_mpis);
    secret_body.extend_from_slice(&checksum16(&secret_mpis).to_be_bytes());

    let certification = certify_user_id(
        key,
        &public_body,
        &fingerprint,
        user_id.as_bytes(),
        &CertificationParams {
            created: sig_created,
            usage: options.usage,
            key_expires_after: options.expires_after,
        },
    )?;

    debug!(
        fingerprint = %fingerprint,
        user_id,
        key_created,
        sig_created,
        "pem2openpgp: built secret key"
    );

    let mut out = Zeroizing::new(write_packet(Tag::SecretKey, &secret_body));
    out.extend_from_slice(&write_packet(Tag::UserId, user_id.as_bytes()));
    out.extend_from_slice(&write_packet(Tag::Signature, &certification));
    Ok(out)
}

/// Secret parameters in OpenPGP order: `p < q`, `u = p⁻¹ mod q`.
fn openpgp_secret_params(key: &RsaPrivateKey) -> Result<SecretParams, CodecError> {
    let primes = key.primes();
    if primes.len() != 2 {
        return Err(CodecError::Unsupported(format!(
            "RSA key with {} primes",
            primes.len()
        )));
    }
    let (p, q) = if primes[0] < primes[1] {
        (&primes[0], &primes[1])
    } else {
        (&primes[1], &primes[0])
    };
    let u = mod_inverse(p, q)
        .ok_or_else(|| CodecError::Pem("RSA primes are not coprime".into()))?;
    Ok(SecretParams::Rsa {
        d: Zeroizing::new(key.d().to_bytes_be()),
        p: Zeroizing::new(p.to_bytes_be()),
        q: Zeroizing::new(q.to_bytes_be()),
        u: Zeroizing::new(u.to_bytes_be()),
    })
}

/// Extract one RSA or Ed25519 key from a packet stream.
///
/// With no filter the first key packet wins.  With a filter, the key whose
/// fingerprint ends in `filter` wins; two different keys matching is an
/// error.  Secret key packets must be unprotected.
pub fn extract_key(packets: Packets<'_>, filter: Option<&str>) -> Result<KeyMaterial, CodecError> {
    let mut selected: Option<KeyPacket> = None;

    for packet in packets {
        let packet = packet?;
        if !packet.tag.is_key() {
            continue;
        }
        let key = KeyPacket::parse(packet.tag, &packet.body)?;
        match filter {
            None => {
                selected = Some(key);
                break;
            }
            Some(filter) if key.fingerprint.matches_suffix(filter) => match &selected {
                Some(prev) if prev.fingerprint != key.fingerprint => {
                    return Err(CodecError::AmbiguousKey(filter.to_string()));
                }
                Some(_) => {}
                None => selected = Some(key),
            },
            Some(_) => {}
        }
    }

    let key = selected.ok_or_else(|| {
        CodecError::NoMatchingKey(filter.unwrap_or("any key").to_string())
    })?;

    if let PublicParams::Unsupported { algorithm } = key.public {
        return Err(CodecError::Unsupported(format!(
            "key {} uses public key algorithm {algorithm}",
            key.fingerprint
        )));
    }

    let secret = if key.has_secret() {
        Some(key.secret_params()?)
    } else {
        None
    };

    debug!(
        fingerprint = %key.fingerprint,
        secret = secret.is_some(),
        subkey = key.tag.is_subkey(),
        "extracted key"
    );

    Ok(KeyMaterial {
        fingerprint: key.fingerprint,
        created: key.created,
        public: key.public.clone(),
        secret,
    })
}

/// Convenience wrapper over [`extract_key`] for a byte slice.
pub fn extract_key_from_bytes(input: &[u8], filter: Option<&str>) -> Result<KeyMaterial, CodecError> {
    extract_key(Packets::new(input), filter)
}

fn big(bytes: &[u8]) -> BigUint {
    BigUint::from_bytes_be(bytes)
}

/// Rebuild an `rsa` private key from extracted material.
pub fn rsa_private_key(material: &KeyMaterial) -> Result<RsaPrivateKey, CodecError> {
    match (&material.public, &material.secret) {
        (PublicParams::Rsa { n, e }, Some(SecretParams::Rsa { d, p, q, .. })) => {
            Ok(RsaPrivateKey::from_components(
                big(n),
                big(e),
                big(d),
                vec![big(p), big(q)],
            )?)
        }
        (PublicParams::Rsa { .. }, None) => Err(CodecError::PublicOnly),
        _ => Err(CodecError::Unsupported(
            "an RSA key is required for this conversion".into(),
        )),
    }
}

/// Encode extracted material as PKCS#1 PEM: a private key if secret material
/// is present, otherwise a public key.
pub fn to_pkcs1_pem(material: &KeyMaterial) -> Result<Zeroizing<String>, CodecError> {
    if material.is_secret() {
        let key = rsa_private_key(material)?;
        return key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| CodecError::Pem(e.to_string()));
    }
    match &material.public {
        PublicParams::Rsa { n, e } => {
            let key = RsaPublicKey::new(big(n), big(e))?;
            key.to_pkcs1_pem(LineEnding::LF)
                .map(Zeroizing::new)
                .map_err(|e| CodecError::Pem(e.to_string()))
        }
        _ => Err(CodecError::Unsupported(
            "PEM output requires an RSA key".into(),
        )),
    }
}

/// Encode extracted secret material as an OpenSSH private key file.
pub fn to_openssh_private(
    material: &KeyMaterial,
    comment: &str,
) -> Result<Zeroizing<String>, CodecError> {
    let keypair = match (&material.public, &material.secret) {
        (PublicParams::Rsa { n, e }, Some(SecretParams::Rsa { d, p, q, u })) => {
            // OpenSSH stores iqmp = q⁻¹ mod p with its own (p, q) order, which
            // is the OpenPGP order reversed; u = p⁻¹ mod q already is that.
            KeypairData::Rsa(RsaKeypair {
                public: ssh_key::public::RsaPublicKey {
                    e: Mpint::from_positive_bytes(e)?,
                    n: Mpint::from_positive_bytes(n)?,
                },
                private: ssh_key::private::RsaPrivateKey {
                    d: Mpint::from_positive_bytes(d)?,
                    iqmp: Mpint::from_positive_bytes(u)?,
                    p: Mpint::from_positive_bytes(q)?,
                    q: Mpint::from_positive_bytes(p)?,
                },
            })
        }
        (PublicParams::Ed25519 { point }, Some(SecretParams::Ed25519 { seed })) => {
            KeypairData::Ed25519(Ed25519Keypair {
                public: Ed25519PublicKey(*point),
                private: Ed25519PrivateKey::from_bytes(seed),
            })
        }
        (_, None) => return Err(CodecError::PublicOnly),
        _ => {
            return Err(CodecError::Unsupported(
                "mismatched public and secret parameters".into(),
            ));
        }
    };
    let key = PrivateKey::new(keypair, comment)?;
    Ok(key.to_openssh(ssh_key::LineEnding::LF)?)
}
