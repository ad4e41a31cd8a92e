//! AES-128 key unwrap (RFC 3394), as gpg-agent uses for `EXPORT_KEY`.

use aes::cipher::generic_array::GenericArray;
use aes_kw::KekAes128;
use zeroize::Zeroizing;

use crate::error::{AgentTransferError, Result};

pub const KEK_LEN: usize = 16;

/// Unwrap `wrapped` under `kek`, checking the integrity value.
pub fn unwrap(kek: &[u8], wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if kek.len() != KEK_LEN {
        return Err(AgentTransferError::KeyLength(kek.len()));
    }
    if wrapped.len() < 24 || wrapped.len() % 8 != 0 {
        return Err(AgentTransferError::Unwrap("input is not a whole number of 64-bit blocks"));
    }
    let kek = KekAes128::new(GenericArray::from_slice(kek));
    let mut plain = Zeroizing::new(vec![0u8; wrapped.len() - 8]);
    kek.unwrap(wrapped, &mut plain).map_err(|e| match e {
        aes_kw::Error::IntegrityCheckFailed => AgentTransferError::Unwrap("integrity check failed"),
        _ => AgentTransferError::Unwrap("malformed wrapped key"),
    })?;
    Ok(plain)
}

/// Inverse of [`unwrap`]; only the tests need to produce wrapped keys.
#[cfg(test)]
pub(crate) fn wrap(kek: &[u8], plain: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; plain.len() + 8];
    KekAes128::new(GenericArray::from_slice(kek))
        .wrap(plain, &mut out)
        .unwrap();
    out
}
