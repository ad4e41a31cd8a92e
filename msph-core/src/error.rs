use std::path::{Path, PathBuf};

use msph_openpgp::CodecError;

use crate::guard::GuardError;
use crate::keyring::KeyringError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid identity '{input}': {reason}")]
    Identity { input: String, reason: String },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Keyring(#[from] KeyringError),

    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error("config error: {0}")]
    Config(String),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no primary keys found for '{0}'")]
    NoPrimaryKeys(String),

    #[error("{} keys match ({}); specify one by key ID", candidates.len(), candidates.join(", "))]
    AmbiguousKey { candidates: Vec<String> },

    #[error("no key found: {0}")]
    NoKey(String),

    #[error("no user ID '{user_id}' on key {fingerprint}")]
    NoSuchUserId { fingerprint: String, user_id: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn identity(input: &str, reason: impl Into<String>) -> Self {
        Self::Identity {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}
