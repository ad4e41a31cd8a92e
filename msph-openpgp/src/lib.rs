//! OpenPGP key codec for monkeysphere.
//!
//! Converts RSA and Ed25519 keys between three encodings:
//!
//! - OpenPGP version-4 packet streams (public and unprotected secret keys),
//! - PEM (PKCS#1 / PKCS#8 RSA) and OpenSSH private key files,
//! - OpenSSH public key lines and wire blobs.
//!
//! Everything here is pure byte manipulation; no files, processes or
//! sockets.
//!
//! ```text
//!   PEM ──pem_to_openpgp──► packets ──Packets──► extract_key ──► KeyMaterial
//!                                                                  │
//!                               SshPublicKey / to_openssh_private ◄┘
//! ```

pub mod error;
pub mod key;
pub mod mpi;
pub mod packet;
pub mod signature;
pub mod ssh;
pub mod transcode;

pub use error::CodecError;
pub use key::{Fingerprint, KeyMaterial, PublicParams, SecretParams};
pub use packet::{Packet, Packets, Tag};
pub use signature::KeyUsage;
pub use ssh::SshPublicKey;
pub use transcode::{
    PemImportOptions, extract_key, extract_key_from_bytes, pem_to_openpgp, rsa_private_key,
    to_openssh_private, to_pkcs1_pem,
};
