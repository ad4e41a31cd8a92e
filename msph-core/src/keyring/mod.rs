//! Keyring query service.
//!
//! The OpenPGP keyring engine owns certificate storage and the web-of-trust
//! computation; this module only asks it questions. [`Keyring`] is the seam
//! the evaluator talks through, [`gpg::GpgKeyring`] the production
//! implementation and [`colons`] the parser for its answers.

pub mod colons;
pub mod gpg;

use async_trait::async_trait;
use msph_openpgp::Fingerprint;

pub use colons::{Certificate, KeyInfo, UserIdBinding};
pub use gpg::GpgKeyring;

#[derive(Debug, thiserror::Error)]
pub enum KeyringError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("{program} did not finish within {secs}s")]
    Timeout { program: String, secs: u64 },

    #[error("unexpected keyring output: {0}")]
    Parse(String),
}

/// Read side of a keyring: what the evaluator needs.
#[async_trait]
pub trait Keyring: Send + Sync {
    /// Certificates carrying a user ID exactly equal to `user_id`.
    ///
    /// No match is an empty list, not an error.
    async fn list_certificates(&self, user_id: &str) -> Result<Vec<Certificate>, KeyringError>;

    /// Binary (unarmored) export of the certificate holding `fingerprint`.
    async fn export(&self, fingerprint: &Fingerprint) -> Result<Vec<u8>, KeyringError>;

    /// Fetch certificates for `user_id` from the configured keyserver.
    async fn refresh(&self, user_id: &str) -> Result<(), KeyringError>;
}

/// Keyrings holding our own secret keys: the host keyring, or a user's
/// when loading keys into an agent.
#[async_trait]
pub trait SecretKeyring: Keyring {
    async fn list_secret_keys(&self) -> Result<Vec<Certificate>, KeyringError>;

    async fn import(&self, data: &[u8]) -> Result<(), KeyringError>;

    async fn add_user_id(&self, key: &Fingerprint, user_id: &str) -> Result<(), KeyringError>;

    /// Revoke the user ID whose text equals `user_id` exactly.
    async fn revoke_user_id(&self, key: &Fingerprint, user_id: &str)
    -> Result<(), KeyringError>;

    /// `expire` uses gpg's syntax: `0`/`never`, `2y`, `90d`, an ISO date.
    async fn set_expire(&self, key: &Fingerprint, expire: &str) -> Result<(), KeyringError>;

    async fn publish(&self, key: &Fingerprint) -> Result<(), KeyringError>;
}
