//! Canonical S-expressions, the form gpg-agent exports secret keys in.

use std::fmt;

use zeroize::Zeroizing;

use crate::error::{AgentTransferError, Result};

const MAX_DEPTH: usize = 16;

#[derive(Clone, PartialEq, Eq)]
pub enum Sexp {
    Atom(Zeroizing<Vec<u8>>),
    List(Vec<Sexp>),
}

impl fmt::Debug for Sexp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Atom(bytes) => write!(f, "Atom(<{} bytes>)", bytes.len()),
            Self::List(items) => f.debug_tuple("List").field(items).finish(),
        }
    }
}

impl Sexp {
    /// Parse one expression from the front of `input`.
    ///
    /// Bytes after the closing parenthesis (key-wrap padding) are ignored.
    pub fn parse(input: &[u8]) -> Result<Self> {
        let mut parser = Parser { input, pos: 0 };
        parser.expr(0)
    }

    pub fn atom(&self) -> Option<&[u8]> {
        match self {
            Self::Atom(bytes) => Some(bytes),
            Self::List(_) => None,
        }
    }

    pub fn list(&self) -> Option<&[Sexp]> {
        match self {
            Self::List(items) => Some(items),
            Self::Atom(_) => None,
        }
    }

    /// The leading atom of a list, its "name".
    pub fn head(&self) -> Option<&[u8]> {
        self.list()?.first()?.atom()
    }

    /// The first child list named `name`.
    pub fn find(&self, name: &[u8]) -> Option<&Sexp> {
        self.list()?
            .iter()
            .skip(1)
            .find(|child| child.head() == Some(name))
    }

    /// The atom after `name` in the child list `(name value)`.
    pub fn value(&self, name: &[u8]) -> Option<&[u8]> {
        self.find(name)?.list()?.get(1)?.atom()
    }
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn error(&self, what: &str) -> AgentTransferError {
        AgentTransferError::Sexp(format!("{what} at offset {}", self.pos))
    }

    fn expr(&mut self, depth: usize) -> Result<Sexp> {
        match self.peek() {
            Some(b'(') => {
                if depth >= MAX_DEPTH {
                    return Err(self.error("nesting too deep"));
                }
                self.pos += 1;
                let mut items = Vec::new();
                loop {
                    match self.peek() {
                        Some(b')') => {
                            self.pos += 1;
                            return Ok(Sexp::List(items));
                        }
                        Some(_) => items.push(self.expr(depth + 1)?),
                        None => return Err(self.error("unterminated list")),
                    }
                }
            }
            Some(b'[') => {
                // display hint: skipped
                self.pos += 1;
                self.atom()?;
                if self.peek() != Some(b']') {
                    return Err(self.error("unterminated display hint"));
                }
                self.pos += 1;
                Ok(Sexp::Atom(self.atom()?))
            }
            Some(b'0'..=b'9') => Ok(Sexp::Atom(self.atom()?)),
            Some(_) => Err(self.error("unexpected byte")),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn atom(&mut self) -> Result<Zeroizing<Vec<u8>>> {
        let mut len: usize = 0;
        let mut digits = 0;
        while let Some(b @ b'0'..=b'9') = self.peek() {
            len = len
                .checked_mul(10)
                .and_then(|l| l.checked_add(usize::from(b - b'0')))
                .ok_or_else(|| self.error("length overflow"))?;
            digits += 1;
            self.pos += 1;
        }
        if digits == 0 || self.peek() != Some(b':') {
            return Err(self.error("expected '<length>:'"));
        }
        self.pos += 1;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.input.len())
            .ok_or_else(|| self.error("atom runs past end of input"))?;
        let bytes = Zeroizing::new(self.input[self.pos..end].to_vec());
        self.pos = end;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_lookup() {
        let text = b"(11:private-key(3:ecc(5:curve7:Ed25519)(5:flags5:eddsa)(1:q3:abc)))\0\0\0";
        let sexp = Sexp::parse(text).unwrap();
        assert_eq!(sexp.head(), Some(&b"private-key"[..]));
        let ecc = sexp.find(b"ecc").unwrap();
        assert_eq!(ecc.value(b"curve"), Some(&b"Ed25519"[..]));
        assert_eq!(ecc.value(b"flags"), Some(&b"eddsa"[..]));
        assert_eq!(ecc.value(b"q"), Some(&b"abc"[..]));
        assert!(ecc.value(b"d").is_none());
        assert!(sexp.find(b"rsa").is_none());
    }

    #[test]
    fn binary_atoms_and_hints() {
        let sexp = Sexp::parse(b"(1:n2:\x00\x29[10:text/plain]2:hi0:)").unwrap();
        let items = sexp.list().unwrap();
        assert_eq!(items[1].atom(), Some(&[0x00, 0x29][..]));
        assert_eq!(items[2].atom(), Some(&b"hi"[..]));
        assert_eq!(items[3].atom(), Some(&b""[..]));
    }

    #[test]
    fn malformed_input() {
        for bad in [
            &b"(3:abc"[..],
            b"(5:abc)",
            b"(abc)",
            b"(:abc)",
            b"",
            b"99999999999999999999999:x",
        ] {
            assert!(Sexp::parse(bad).is_err(), "{bad:?}");
        }
        let deep = "(".repeat(40);
        assert!(Sexp::parse(deep.as_bytes()).is_err());
    }

    #[test]
    fn debug_hides_atom_contents() {
        let sexp = Sexp::parse(b"(1:d6:secret)").unwrap();
        let shown = format!("{sexp:?}");
        assert!(!shown.contains("secret"));
        assert!(shown.contains("<6 bytes>"));
    }
}
