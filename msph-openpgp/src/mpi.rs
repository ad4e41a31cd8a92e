//! Multi-precision integer encodings.
//!
//! OpenPGP and SSH both serialise big integers as big-endian magnitudes but
//! disagree on the prefix: OpenPGP counts *bits* in a 16-bit header (RFC 4880
//! §3.2), SSH counts *bytes* in a 32-bit header and prepends a zero byte when
//! the top bit would otherwise read as a sign (RFC 4251 §5).

use rsa::BigUint;

use crate::error::CodecError;

/// Strip leading zero bytes from a big-endian magnitude.
pub fn trim_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

/// Number of significant bits in a big-endian magnitude.
pub fn bit_length(bytes: &[u8]) -> usize {
    let trimmed = trim_leading_zeros(bytes);
    match trimmed.first() {
        None => 0,
        Some(&lead) => (8 - lead.leading_zeros() as usize) + 8 * (trimmed.len() - 1),
    }
}

/// Encode `bytes` as an OpenPGP MPI.
///
/// The bit count is a 16-bit field, so magnitudes over 65535 bits are refused.
pub fn mpi_pack(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    let trimmed = trim_leading_zeros(bytes);
    let bits = u16::try_from(bit_length(trimmed)).map_err(|_| {
        CodecError::Unsupported(format!("{}-byte integer exceeds the MPI limit", trimmed.len()))
    })?;
    let mut out = Vec::with_capacity(2 + trimmed.len());
    out.extend_from_slice(&bits.to_be_bytes());
    out.extend_from_slice(trimmed);
    Ok(out)
}

/// Read one OpenPGP MPI from the front of `input`.
///
/// Returns the magnitude and the remaining input.
pub fn read_mpi(input: &[u8]) -> Result<(&[u8], &[u8]), CodecError> {
    if input.len() < 2 {
        return Err(CodecError::Malformed("MPI header truncated".into()));
    }
    let bits = u16::from_be_bytes([input[0], input[1]]) as usize;
    let len = bits.div_ceil(8);
    let rest = &input[2..];
    if rest.len() < len {
        return Err(CodecError::Malformed(format!(
            "MPI claims {bits} bits but only {} bytes remain",
            rest.len()
        )));
    }
    Ok(rest.split_at(len))
}

/// Encode `bytes` as an SSH `mpint`, including the 32-bit length prefix.
pub fn openssh_mpi_pack(bytes: &[u8]) -> Vec<u8> {
    let trimmed = trim_leading_zeros(bytes);
    let pad = trimmed.first().is_some_and(|&b| b & 0x80 != 0);
    let len = trimmed.len() + usize::from(pad);
    let mut out = Vec::with_capacity(4 + len);
    out.extend_from_slice(&(len as u32).to_be_bytes());
    if pad {
        out.push(0);
    }
    out.extend_from_slice(trimmed);
    out
}

/// Multiplicative inverse of `a` modulo `m`, as a residue in `[0, m)`.
///
/// Extended Euclid over unsigned integers: the Bézout coefficient is tracked
/// modulo `m` so it never goes negative.  Returns `None` when `gcd(a, m) != 1`.
pub fn mod_inverse(a: &BigUint, m: &BigUint) -> Option<BigUint> {
    let zero = BigUint::from(0u32);
    let one = BigUint::from(1u32);
    if *m == zero {
        return None;
    }
    if *m == one {
        return Some(zero);
    }

    let (mut old_r, mut r) = (a % m, m.clone());
    let (mut old_s, mut s) = (one.clone(), zero.clone());

    while r != zero {
        let quotient = &old_r / &r;
        let next_r = &old_r - &quotient * &r;
        old_r = std::mem::replace(&mut r, next_r);

        // next_s = old_s - quotient * s  (mod m)
        let step = (&quotient * &s) % m;
        let next_s = if old_s >= step {
            &old_s - &step
        } else {
            m - (&step - &old_s)
        };
        old_s = std::mem::replace(&mut s, next_s);
    }

    if old_r != one {
        return None;
    }
    Some(old_s % m)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mpi_counts_bits_of_leading_byte() {
        assert_eq!(mpi_pack(&[0x01]).unwrap(), vec![0x00, 0x01, 0x01]);
        assert_eq!(mpi_pack(&[0x00, 0x01, 0xff]).unwrap(), vec![0x00, 0x09, 0x01, 0xff]);
        assert_eq!(mpi_pack(&[0x80, 0x00]).unwrap(), vec![0x00, 0x10, 0x80, 0x00]);
        assert_eq!(mpi_pack(&[0x7f, 0x00, 0x00]).unwrap(), vec![0x00, 0x17, 0x7f, 0x00, 0x00]);
    }

    #[test]
    fn oversized_mpi_is_refused() {
        let max = vec![0xff; 8191];
        assert_eq!(&mpi_pack(&max).unwrap()[..2], &[0xff, 0xf8]);
        let mut edge = vec![0xff; 8192];
        assert!(mpi_pack(&edge).is_err());
        // leading zeros do not count
        edge[0] = 0;
        edge.insert(0, 0);
        assert_eq!(mpi_pack(&edge).unwrap().len(), 2 + 8191);
    }

    #[test]
    fn mpi_of_zero_is_empty_magnitude() {
        assert_eq!(mpi_pack(&[]).unwrap(), vec![0x00, 0x00]);
        assert_eq!(mpi_pack(&[0x00, 0x00]).unwrap(), vec![0x00, 0x00]);
    }

    #[test]
    fn read_mpi_splits_value_and_rest() {
        let input = [0x00, 0x09, 0x01, 0xff, 0xaa];
        let (value, rest) = read_mpi(&input).unwrap();
        assert_eq!(value, &[0x01, 0xff]);
        assert_eq!(rest, &[0xaa]);
    }

    #[test]
    fn read_mpi_rejects_truncation() {
        assert!(read_mpi(&[0x00]).is_err());
        assert!(read_mpi(&[0x00, 0x10, 0x01]).is_err());
    }

    #[test]
    fn openssh_mpint_sign_pads_high_bit() {
        assert_eq!(openssh_mpi_pack(&[0x80]), vec![0, 0, 0, 2, 0x00, 0x80]);
        assert_eq!(openssh_mpi_pack(&[0x00, 0x7f]), vec![0, 0, 0, 1, 0x7f]);
        assert_eq!(openssh_mpi_pack(&[]), vec![0, 0, 0, 0]);
        assert_eq!(
            openssh_mpi_pack(&[0x01, 0x00, 0x01]),
            vec![0, 0, 0, 3, 0x01, 0x00, 0x01]
        );
    }

    #[test]
    fn inverse_is_normalised() {
        let a = BigUint::from(3u32);
        let m = BigUint::from(11u32);
        assert_eq!(mod_inverse(&a, &m), Some(BigUint::from(4u32)));

        // 10 * 10 = 100 = 9*11 + 1
        let a = BigUint::from(10u32);
        assert_eq!(mod_inverse(&a, &m), Some(BigUint::from(10u32)));

        let a = BigUint::from(17u32);
        let m = BigUint::from(3120u32);
        assert_eq!(mod_inverse(&a, &m), Some(BigUint::from(2753u32)));
    }

    #[test]
    fn inverse_requires_coprime() {
        let a = BigUint::from(6u32);
        let m = BigUint::from(9u32);
        assert_eq!(mod_inverse(&a, &m), None);
    }
}
