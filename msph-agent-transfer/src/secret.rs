//! Secret keys as exported by gpg-agent.

use std::fmt;

use msph_openpgp::mpi::{mod_inverse, trim_leading_zeros};
use rsa::BigUint;
use zeroize::Zeroizing;

use crate::error::{AgentTransferError, Result};
use crate::sexp::Sexp;

const ED25519_CURVE: &[u8] = b"Ed25519";
const EDDSA_FLAG: &[u8] = b"eddsa";
const ED25519_PREFIX: u8 = 0x40;

/// RSA components as big-endian magnitudes.
pub struct RsaSecret {
    pub n: Vec<u8>,
    pub e: Vec<u8>,
    pub d: Zeroizing<Vec<u8>>,
    pub p: Zeroizing<Vec<u8>>,
    pub q: Zeroizing<Vec<u8>>,
    /// `q^-1 mod p`
    pub iqmp: Zeroizing<Vec<u8>>,
}

pub struct Ed25519Secret {
    pub public: [u8; 32],
    pub seed: Zeroizing<[u8; 32]>,
}

pub enum SecretKey {
    Rsa(RsaSecret),
    Ed25519(Ed25519Secret),
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey({})", self.ssh_key_type())
    }
}

impl SecretKey {
    /// Interpret an unprotected `(private-key ...)` expression.
    pub fn from_sexp(sexp: &Sexp) -> Result<Self> {
        match sexp.head() {
            Some(b"private-key") => {}
            Some(b"protected-private-key") => {
                return Err(AgentTransferError::Unsupported("key is still passphrase-protected".into()));
            }
            _ => return Err(AgentTransferError::Sexp("not a private-key expression".into())),
        }
        if let Some(rsa) = sexp.find(b"rsa") {
            return rsa_from_sexp(rsa).map(Self::Rsa);
        }
        if let Some(ecc) = sexp.find(b"ecc") {
            return ed25519_from_sexp(ecc).map(Self::Ed25519);
        }
        let algo = sexp
            .list()
            .and_then(|items| items.get(1))
            .and_then(Sexp::head)
            .map(|h| String::from_utf8_lossy(h).into_owned())
            .unwrap_or_default();
        Err(AgentTransferError::Unsupported(format!(
            "algorithm '{algo}' is neither RSA nor Ed25519"
        )))
    }

    pub fn ssh_key_type(&self) -> &'static str {
        match self {
            Self::Rsa(_) => "ssh-rsa",
            Self::Ed25519(_) => "ssh-ed25519",
        }
    }
}

fn param<'a>(list: &'a Sexp, name: &str) -> Result<&'a [u8]> {
    list.value(name.as_bytes())
        .ok_or_else(|| AgentTransferError::Sexp(format!("missing parameter '{name}'")))
}

fn rsa_from_sexp(rsa: &Sexp) -> Result<RsaSecret> {
    let magnitude = |name: &str| param(rsa, name).map(|v| trim_leading_zeros(v).to_vec());
    let n = magnitude("n")?;
    let e = magnitude("e")?;
    let d = Zeroizing::new(magnitude("d")?);
    let p = Zeroizing::new(magnitude("p")?);
    let q = Zeroizing::new(magnitude("q")?);

    let iqmp = mod_inverse(&BigUint::from_bytes_be(&q), &BigUint::from_bytes_be(&p))
        .ok_or_else(|| AgentTransferError::Unsupported("q has no inverse modulo p".into()))?;
    Ok(RsaSecret {
        n,
        e,
        d,
        p,
        q,
        iqmp: Zeroizing::new(iqmp.to_bytes_be()),
    })
}

fn ed25519_from_sexp(ecc: &Sexp) -> Result<Ed25519Secret> {
    let curve = param(ecc, "curve")?;
    if curve != ED25519_CURVE {
        return Err(AgentTransferError::Unsupported(format!(
            "curve '{}' is not Ed25519",
            String::from_utf8_lossy(curve)
        )));
    }
    if param(ecc, "flags")? != EDDSA_FLAG {
        return Err(AgentTransferError::Unsupported("Ed25519 key without the eddsa flag".into()));
    }

    let q = param(ecc, "q")?;
    if q.len() != 33 || q[0] != ED25519_PREFIX {
        return Err(AgentTransferError::Unsupported(format!(
            "Ed25519 public point has {} bytes, expected 0x40 prefix and 33",
            q.len()
        )));
    }
    let d = param(ecc, "d")?;
    let seed: [u8; 32] = d.try_into().map_err(|_| {
        AgentTransferError::Unsupported(format!("Ed25519 secret has {} bytes, expected 32", d.len()))
    })?;
    let mut public = [0u8; 32];
    public.copy_from_slice(&q[1..]);
    Ok(Ed25519Secret {
        public,
        seed: Zeroizing::new(seed),
    })
}
