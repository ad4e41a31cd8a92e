//! Version-4 key packets: public parameters, secret parameters, fingerprints.

use std::fmt;
use std::str::FromStr;

use sha1::{Digest, Sha1};
use zeroize::Zeroizing;

use crate::error::CodecError;
use crate::mpi::{mpi_pack, read_mpi, trim_leading_zeros};
use crate::packet::Tag;

pub const ALGO_RSA: u8 = 1;
pub const ALGO_RSA_ENCRYPT_ONLY: u8 = 2;
pub const ALGO_RSA_SIGN_ONLY: u8 = 3;
pub const ALGO_ELGAMAL: u8 = 16;
pub const ALGO_DSA: u8 = 17;
pub const ALGO_ECDH: u8 = 18;
pub const ALGO_ECDSA: u8 = 19;
pub const ALGO_ELGAMAL_LEGACY: u8 = 20;
pub const ALGO_EDDSA: u8 = 22;

/// DER body of OID 1.3.6.1.4.1.11591.15.1 (Ed25519 for EdDSA).
pub const ED25519_OID: &[u8] = &[0x2b, 0x06, 0x01, 0x04, 0x01, 0xda, 0x47, 0x0f, 0x01];

/// Prefix octet of a native (compressed) EdDSA point.
const NATIVE_POINT: u8 = 0x40;

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

/// A v4 key fingerprint: SHA-1 over `0x99 ‖ u16 length ‖ public key body`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 20]);

impl Fingerprint {
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Compute the fingerprint of a public key packet body.
    pub fn of_public_body(body: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update([0x99]);
        hasher.update((body.len() as u16).to_be_bytes());
        hasher.update(body);
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// The 64-bit key ID (low eight bytes of the fingerprint).
    pub fn key_id(&self) -> [u8; 8] {
        let mut id = [0u8; 8];
        id.copy_from_slice(&self.0[12..]);
        id
    }

    pub fn key_id_hex(&self) -> String {
        hex_upper(&self.key_id())
    }

    /// True if `filter` is a hex suffix of this fingerprint.
    ///
    /// Case, embedded spaces, a leading `0x` and a trailing `!` are ignored.
    /// An empty or non-hex filter never matches.
    pub fn matches_suffix(&self, filter: &str) -> bool {
        match normalise_filter(filter) {
            Some(wanted) => self.to_string().ends_with(&wanted),
            None => false,
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex_upper(&self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

impl FromStr for Fingerprint {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = normalise_filter(s)
            .filter(|h| h.len() == 40)
            .ok_or_else(|| CodecError::Malformed(format!("not a v4 fingerprint: {s}")))?;
        let mut out = [0u8; 20];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16)
                .map_err(|_| CodecError::Malformed(format!("not a v4 fingerprint: {s}")))?;
        }
        Ok(Self(out))
    }
}

fn normalise_filter(filter: &str) -> Option<String> {
    let trimmed = filter.trim();
    let trimmed = trimmed.strip_suffix('!').unwrap_or(trimmed);
    let trimmed = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let hex: String = trimmed
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(hex)
}

pub(crate) fn hex_upper(bytes: &[u8]) -> String {
    use fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02X}");
    }
    out
}

// ---------------------------------------------------------------------------
// Key parameters
// ---------------------------------------------------------------------------

/// Public key parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicParams {
    /// RSA modulus and public exponent as big-endian magnitudes.
    Rsa { n: Vec<u8>, e: Vec<u8> },
    /// Ed25519 public point (without the `0x40` prefix).
    Ed25519 { point: [u8; 32] },
    /// Any other algorithm; parsed only far enough to fingerprint it.
    Unsupported { algorithm: u8 },
}

impl PublicParams {
    /// The public key packet body fields following the algorithm octet.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        match self {
            Self::Rsa { n, e } => {
                let mut out = mpi_pack(n)?;
                out.extend_from_slice(&mpi_pack(e)?);
                Ok(out)
            }
            Self::Ed25519 { point } => {
                let mut out = vec![ED25519_OID.len() as u8];
                out.extend_from_slice(ED25519_OID);
                let mut native = Vec::with_capacity(33);
                native.push(NATIVE_POINT);
                native.extend_from_slice(point);
                out.extend_from_slice(&mpi_pack(&native)?);
                Ok(out)
            }
            Self::Unsupported { algorithm } => Err(CodecError::Unsupported(format!(
                "public key algorithm {algorithm}"
            ))),
        }
    }

    pub fn algorithm(&self) -> u8 {
        match self {
            Self::Rsa { .. } => ALGO_RSA,
            Self::Ed25519 { .. } => ALGO_EDDSA,
            Self::Unsupported { algorithm } => *algorithm,
        }
    }
}

/// Unencrypted secret key parameters.  Wiped on drop.
#[derive(Clone)]
pub enum SecretParams {
    /// RSA private exponent and primes in OpenPGP order (`p < q`,
    /// `u = p⁻¹ mod q`).
    Rsa {
        d: Zeroizing<Vec<u8>>,
        p: Zeroizing<Vec<u8>>,
        q: Zeroizing<Vec<u8>>,
        u: Zeroizing<Vec<u8>>,
    },
    /// Ed25519 32-byte secret seed.
    Ed25519 { seed: Zeroizing<[u8; 32]> },
}

impl fmt::Debug for SecretParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rsa { .. } => f.write_str("SecretParams::Rsa([redacted])"),
            Self::Ed25519 { .. } => f.write_str("SecretParams::Ed25519([redacted])"),
        }
    }
}

impl SecretParams {
    /// Encoded secret MPIs (without S2K usage octet or checksum).
    pub fn encode(&self) -> Result<Zeroizing<Vec<u8>>, CodecError> {
        let mut out = Zeroizing::new(Vec::new());
        match self {
            Self::Rsa { d, p, q, u } => {
                for value in [d, p, q, u] {
                    out.extend_from_slice(&Zeroizing::new(mpi_pack(value)?));
                }
            }
            Self::Ed25519 { seed } => {
                out.extend_from_slice(&Zeroizing::new(mpi_pack(seed.as_slice())?));
            }
        }
        Ok(out)
    }
}

/// Sum of all octets modulo 65536 (RFC 4880 §5.5.3).
pub fn checksum16(bytes: &[u8]) -> u16 {
    bytes.iter().fold(0u16, |acc, &b| acc.wrapping_add(b as u16))
}

// ---------------------------------------------------------------------------
// Key packets
// ---------------------------------------------------------------------------

/// A parsed v4 key packet.
///
/// Secret parameters are decoded on demand by [`KeyPacket::secret_params`] so
/// that walking past an unrelated protected key is not an error.
pub struct KeyPacket {
    pub tag: Tag,
    pub created: u32,
    pub public: PublicParams,
    pub fingerprint: Fingerprint,
    secret_region: Option<Zeroizing<Vec<u8>>>,
}

impl fmt::Debug for KeyPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPacket")
            .field("tag", &self.tag)
            .field("created", &self.created)
            .field("public", &self.public)
            .field("fingerprint", &self.fingerprint)
            .field("has_secret", &self.secret_region.is_some())
            .finish()
    }
}

impl KeyPacket {
    pub fn parse(tag: Tag, body: &[u8]) -> Result<Self, CodecError> {
        let version = *body
            .first()
            .ok_or_else(|| CodecError::Unsupported("empty key packet".into()))?;
        if version != 4 {
            return Err(CodecError::Unsupported(format!("key version {version}")));
        }
        if body.len() < 6 {
            return Err(CodecError::Unsupported(
                "key packet ends before the public key algorithm octet".into(),
            ));
        }
        let created = u32::from_be_bytes([body[1], body[2], body[3], body[4]]);
        let algorithm = body[5];
        let (public, rest) = parse_public_params(algorithm, &body[6..])?;
        let public_len = body.len() - rest.len();
        let fingerprint = Fingerprint::of_public_body(&body[..public_len]);

        let secret_region = if tag.is_secret() {
            Some(Zeroizing::new(rest.to_vec()))
        } else {
            None
        };

        Ok(Self {
            tag,
            created,
            public,
            fingerprint,
            secret_region,
        })
    }

    pub fn has_secret(&self) -> bool {
        self.secret_region.is_some()
    }

    /// Decode the unencrypted secret parameters.
    pub fn secret_params(&self) -> Result<SecretParams, CodecError> {
        let region = self.secret_region.as_ref().ok_or(CodecError::PublicOnly)?;
        let (&usage, rest) = region
            .split_first()
            .ok_or_else(|| CodecError::Malformed("secret key packet truncated".into()))?;
        if usage != 0 {
            return Err(CodecError::EncryptedSecretKey(usage));
        }

        let (params, tail) = match &self.public {
            PublicParams::Rsa { .. } => {
                let (d, r) = read_mpi(rest)?;
                let (p, r) = read_mpi(r)?;
                let (q, r) = read_mpi(r)?;
                let (u, r) = read_mpi(r)?;
                let params = SecretParams::Rsa {
                    d: Zeroizing::new(d.to_vec()),
                    p: Zeroizing::new(p.to_vec()),
                    q: Zeroizing::new(q.to_vec()),
                    u: Zeroizing::new(u.to_vec()),
                };
                (params, r)
            }
            PublicParams::Ed25519 { .. } => {
                let (d, r) = read_mpi(rest)?;
                let d = trim_leading_zeros(d);
                if d.len() > 32 {
                    return Err(CodecError::Malformed(format!(
                        "Ed25519 secret is {} bytes",
                        d.len()
                    )));
                }
                let mut seed = Zeroizing::new([0u8; 32]);
                seed[32 - d.len()..].copy_from_slice(d);
                (SecretParams::Ed25519 { seed }, r)
            }
            PublicParams::Unsupported { algorithm } => {
                return Err(CodecError::Unsupported(format!(
                    "public key algorithm {algorithm}"
                )));
            }
        };

        let mpi_len = rest.len() - tail.len();
        if tail.len() < 2 {
            return Err(CodecError::Malformed("secret key checksum missing".into()));
        }
        let stored = u16::from_be_bytes([tail[0], tail[1]]);
        let computed = checksum16(&rest[..mpi_len]);
        if stored != computed {
            return Err(CodecError::Checksum { stored, computed });
        }
        Ok(params)
    }
}

/// Encode a v4 public key packet body.
pub fn public_key_body(created: u32, public: &PublicParams) -> Result<Vec<u8>, CodecError> {
    let mut body = vec![4];
    body.extend_from_slice(&created.to_be_bytes());
    body.push(public.algorithm());
    body.extend_from_slice(&public.encode()?);
    Ok(body)
}

fn parse_public_params(algorithm: u8, input: &[u8]) -> Result<(PublicParams, &[u8]), CodecError> {
    match algorithm {
        ALGO_RSA | ALGO_RSA_ENCRYPT_ONLY | ALGO_RSA_SIGN_ONLY => {
            let (n, rest) = read_mpi(input)?;
            let (e, rest) = read_mpi(rest)?;
            Ok((
                PublicParams::Rsa {
                    n: n.to_vec(),
                    e: e.to_vec(),
                },
                rest,
            ))
        }
        ALGO_DSA => {
            let rest = skip_mpis(input, 4)?;
            Ok((PublicParams::Unsupported { algorithm }, rest))
        }
        ALGO_ELGAMAL | ALGO_ELGAMAL_LEGACY => {
            let rest = skip_mpis(input, 3)?;
            Ok((PublicParams::Unsupported { algorithm }, rest))
        }
        ALGO_ECDSA => {
            let (_, rest) = read_oid(input)?;
            let rest = skip_mpis(rest, 1)?;
            Ok((PublicParams::Unsupported { algorithm }, rest))
        }
        ALGO_ECDH => {
            let (_, rest) = read_oid(input)?;
            let rest = skip_mpis(rest, 1)?;
            let (&kdf_len, rest) = rest
                .split_first()
                .ok_or_else(|| CodecError::Malformed("ECDH KDF parameters truncated".into()))?;
            if rest.len() < kdf_len as usize {
                return Err(CodecError::Malformed("ECDH KDF parameters truncated".into()));
            }
            Ok((PublicParams::Unsupported { algorithm }, &rest[kdf_len as usize..]))
        }
        ALGO_EDDSA => {
            let (oid, rest) = read_oid(input)?;
            let (point, rest) = read_mpi(rest)?;
            let native = point.len() == 33 && point[0] == NATIVE_POINT;
            if oid == ED25519_OID && native {
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(&point[1..]);
                Ok((PublicParams::Ed25519 { point: bytes }, rest))
            } else {
                Ok((PublicParams::Unsupported { algorithm }, rest))
            }
        }
        other => Err(CodecError::Unsupported(format!("public key algorithm {other}"))),
    }
}

fn read_oid(input: &[u8]) -> Result<(&[u8], &[u8]), CodecError> {
    let (&len, rest) = input
        .split_first()
        .ok_or_else(|| CodecError::Malformed("curve OID truncated".into()))?;
    let len = len as usize;
    if len == 0 || len == 0xff || rest.len() < len {
        return Err(CodecError::Malformed("invalid curve OID".into()));
    }
    Ok(rest.split_at(len))
}

fn skip_mpis(mut input: &[u8], count: usize) -> Result<&[u8], CodecError> {
    for _ in 0..count {
        input = read_mpi(input)?.1;
    }
    Ok(input)
}

// ---------------------------------------------------------------------------
// Extracted key material
// ---------------------------------------------------------------------------

/// An RSA or Ed25519 key extracted from a packet stream.
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    pub fingerprint: Fingerprint,
    pub created: u32,
    pub public: PublicParams,
    pub secret: Option<SecretParams>,
}

impl KeyMaterial {
    pub fn is_secret(&self) -> bool {
        self.secret.is_some()
    }
}
