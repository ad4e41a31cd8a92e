//! OpenPGP packet framing (RFC 4880 §4.2).
//!
//! [`Packets`] is a lazy, restartable iterator over the packets in a byte
//! slice.  It only splits framing; interpreting packet bodies is left to the
//! callers in [`crate::key`] and [`crate::transcode`].

use std::borrow::Cow;

use crate::error::CodecError;

/// Packet tags this crate distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Signature,
    SecretKey,
    PublicKey,
    SecretSubkey,
    Trust,
    UserId,
    PublicSubkey,
    UserAttribute,
    Other(u8),
}

impl Tag {
    pub fn from_u8(value: u8) -> Self {
        match value {
            2 => Self::Signature,
            5 => Self::SecretKey,
            6 => Self::PublicKey,
            7 => Self::SecretSubkey,
            12 => Self::Trust,
            13 => Self::UserId,
            14 => Self::PublicSubkey,
            17 => Self::UserAttribute,
            other => Self::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Signature => 2,
            Self::SecretKey => 5,
            Self::PublicKey => 6,
            Self::SecretSubkey => 7,
            Self::Trust => 12,
            Self::UserId => 13,
            Self::PublicSubkey => 14,
            Self::UserAttribute => 17,
            Self::Other(v) => v,
        }
    }

    /// True for the four key-carrying packet types.
    pub fn is_key(self) -> bool {
        matches!(
            self,
            Self::SecretKey | Self::PublicKey | Self::SecretSubkey | Self::PublicSubkey
        )
    }

    pub fn is_secret(self) -> bool {
        matches!(self, Self::SecretKey | Self::SecretSubkey)
    }

    pub fn is_subkey(self) -> bool {
        matches!(self, Self::SecretSubkey | Self::PublicSubkey)
    }
}

/// One framed packet.  The body borrows from the input unless it was split
/// into partial-length chunks, in which case the chunks are joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet<'a> {
    pub tag: Tag,
    pub body: Cow<'a, [u8]>,
}

/// Iterator over the packets of an OpenPGP byte stream.
///
/// Cloning the iterator restarts from the clone point.  After the first
/// framing error the iterator yields that error once and then ends.
#[derive(Debug, Clone)]
pub struct Packets<'a> {
    input: &'a [u8],
    failed: bool,
}

impl<'a> Packets<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            failed: false,
        }
    }

    fn next_packet(&mut self) -> Result<Packet<'a>, CodecError> {
        let input = self.input;
        let ctb = input[0];
        if ctb & 0x80 == 0 {
            return Err(CodecError::Malformed(format!(
                "invalid packet header byte 0x{ctb:02x}"
            )));
        }

        if ctb & 0x40 != 0 {
            let tag = Tag::from_u8(ctb & 0x3f);
            let mut rest = &input[1..];
            let mut joined: Option<Vec<u8>> = None;
            loop {
                let (length, consumed) = new_format_length(rest)?;
                rest = &rest[consumed..];
                match length {
                    BodyLength::Full(len) => {
                        let (chunk, tail) = take(rest, len)?;
                        self.input = tail;
                        let body = match joined {
                            Some(mut buf) => {
                                buf.extend_from_slice(chunk);
                                Cow::Owned(buf)
                            }
                            None => Cow::Borrowed(chunk),
                        };
                        return Ok(Packet { tag, body });
                    }
                    BodyLength::Partial(len) => {
                        let (chunk, tail) = take(rest, len)?;
                        joined.get_or_insert_with(Vec::new).extend_from_slice(chunk);
                        rest = tail;
                    }
                }
            }
        }

        let tag = Tag::from_u8((ctb >> 2) & 0x0f);
        let rest = &input[1..];
        let (len, rest) = match ctb & 0x03 {
            0 => {
                let (hdr, rest) = take(rest, 1)?;
                (hdr[0] as usize, rest)
            }
            1 => {
                let (hdr, rest) = take(rest, 2)?;
                (u16::from_be_bytes([hdr[0], hdr[1]]) as usize, rest)
            }
            2 => {
                let (hdr, rest) = take(rest, 4)?;
                (
                    u32::from_be_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]) as usize,
                    rest,
                )
            }
            // Indeterminate length: the packet runs to the end of the input.
            _ => (rest.len(), rest),
        };
        let (body, tail) = take(rest, len)?;
        self.input = tail;
        Ok(Packet {
            tag,
            body: Cow::Borrowed(body),
        })
    }
}

impl<'a> Iterator for Packets<'a> {
    type Item = Result<Packet<'a>, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.input.is_empty() {
            return None;
        }
        let result = self.next_packet();
        if result.is_err() {
            self.failed = true;
        }
        Some(result)
    }
}

enum BodyLength {
    Full(usize),
    Partial(usize),
}

fn new_format_length(input: &[u8]) -> Result<(BodyLength, usize), CodecError> {
    let first = *input
        .first()
        .ok_or_else(|| CodecError::Malformed("packet length truncated".into()))?;
    match first {
        0..=191 => Ok((BodyLength::Full(first as usize), 1)),
        192..=223 => {
            let second = *input
                .get(1)
                .ok_or_else(|| CodecError::Malformed("two-octet length truncated".into()))?;
            let len = ((first as usize - 192) << 8) + second as usize + 192;
            Ok((BodyLength::Full(len), 2))
        }
        255 => {
            let (hdr, _) = take(&input[1..], 4)?;
            let len = u32::from_be_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]) as usize;
            Ok((BodyLength::Full(len), 5))
        }
        _ => Ok((BodyLength::Partial(1usize << (first & 0x1f)), 1)),
    }
}

fn take(input: &[u8], len: usize) -> Result<(&[u8], &[u8]), CodecError> {
    if input.len() < len {
        return Err(CodecError::Malformed(format!(
            "packet body needs {len} bytes but only {} remain",
            input.len()
        )));
    }
    Ok(input.split_at(len))
}

/// Frame `body` as an old-format packet using the shortest length type.
pub fn write_packet(tag: Tag, body: &[u8]) -> Vec<u8> {
    let tag_bits = (tag.as_u8() & 0x0f) << 2;
    let mut out = Vec::with_capacity(body.len() + 5);
    let len = body.len();
    if len < 0x100 {
        out.push(0x80 | tag_bits);
        out.push(len as u8);
    } else if len < 0x10000 {
        out.push(0x80 | tag_bits | 0x01);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(0x80 | tag_bits | 0x02);
        out.extend_from_slice(&(len as u32).to_be_bytes());
    }
    out.extend_from_slice(body);
    out
}
