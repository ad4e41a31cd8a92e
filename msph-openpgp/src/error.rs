//! Error types for the key codec.

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed packet stream: {0}")]
    Malformed(String),

    #[error("unsupported key version/algorithm: {0}")]
    Unsupported(String),

    #[error("secret key material is passphrase-protected (S2K usage {0}); remove the passphrase first")]
    EncryptedSecretKey(u8),

    #[error("secret key checksum mismatch (stored {stored:04x}, computed {computed:04x})")]
    Checksum { stored: u16, computed: u16 },

    #[error("key has no secret material")]
    PublicOnly,

    #[error("more than one key matches '{0}'")]
    AmbiguousKey(String),

    #[error("no matching key for '{0}'")]
    NoMatchingKey(String),

    #[error("invalid timestamps: key created at {key} but signed at {signature}")]
    Timestamp { key: u32, signature: u32 },

    #[error("invalid PEM key: {0}")]
    Pem(String),

    #[error("invalid OpenSSH public key: {0}")]
    SshFormat(String),

    #[error("RSA error: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("OpenSSH key encoding error: {0}")]
    SshKey(#[from] ssh_key::Error),
}
