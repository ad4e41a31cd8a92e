//! Move a secret key held by gpg-agent into a running ssh-agent.
//!
//! ```text
//! gpg-agent ──KEYWRAP_KEY / EXPORT_KEY──▶ RFC 3394 unwrap ──▶ S-expression
//!                                                               │
//!                         ssh-agent ◀──ADD_IDENTITY── SecretKey ◀┘
//! ```
//!
//! The passphrase prompt is gpg-agent's own pinentry; this crate never sees
//! it. Unwrapped key material lives in `Zeroizing` buffers only.

pub mod assuan;
pub mod bootstrap;
pub mod error;
pub mod gpg_agent;
pub mod keywrap;
pub mod secret;
pub mod sexp;
pub mod ssh_agent;

use std::fmt;
use std::str::FromStr;

use tracing::info;

pub use error::{AgentTransferError, Result};
pub use secret::SecretKey;
pub use ssh_agent::Constraints;

pub const DEFAULT_GPGCONF: &str = "gpgconf";

/// A gpg-agent keygrip: 40 hex digits naming a key in its store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Keygrip(String);

impl Keygrip {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Keygrip {
    type Err = AgentTransferError;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() == 40 && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(Self(s.to_string()))
        } else {
            Err(AgentTransferError::InvalidKeygrip)
        }
    }
}

impl fmt::Display for Keygrip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One key to move, and how ssh-agent should hold it.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub keygrip: Keygrip,
    pub comment: Option<String>,
    pub constraints: Constraints,
}

impl TransferRequest {
    pub fn new(keygrip: Keygrip) -> Self {
        Self {
            keygrip,
            comment: None,
            constraints: Constraints::default(),
        }
    }

    /// Comment ssh-agent lists the key under.
    pub fn comment(&self) -> String {
        self.comment
            .clone()
            .unwrap_or_else(|| format!("GnuPG keygrip {}", self.keygrip))
    }

    pub fn description(&self) -> String {
        gpg_agent::key_description(&self.keygrip, self.comment.as_deref())
    }
}

/// Run the whole transfer against the agents of the calling user.
///
/// `env` supplies `SSH_AUTH_SOCK` and the display variables forwarded to
/// gpg-agent.
pub async fn transfer(
    request: &TransferRequest,
    gpgconf: &str,
    env: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    let ssh_sock = ssh_agent::auth_sock(&env)?;
    let ssh = ssh_agent::connect(&ssh_sock).await?;

    let mut agent = gpg_agent::connect(gpgconf).await?;
    agent
        .forward_environment(&env, gpg_agent::stdin_tty())
        .await;
    let key = agent
        .export_secret_key(&request.keygrip, &request.description())
        .await?;

    ssh_agent::add_identity(ssh, &key, &request.comment(), request.constraints).await?;
    info!(
        keygrip = %request.keygrip,
        key_type = key.ssh_key_type(),
        "key added to ssh-agent"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keygrip_validation() {
        let grip: Keygrip = "0123456789abcdef0123456789ABCDEF01234567".parse().unwrap();
        assert_eq!(grip.as_str().len(), 40);
        for bad in ["", "0123", "g".repeat(40).as_str(), "0".repeat(41).as_str()] {
            assert!(matches!(bad.parse::<Keygrip>(), Err(AgentTransferError::InvalidKeygrip)), "{bad}");
        }
    }

    #[test]
    fn default_comment_names_the_keygrip() {
        let grip: Keygrip = "0".repeat(40).parse().unwrap();
        let mut request = TransferRequest::new(grip);
        assert_eq!(request.comment(), format!("GnuPG keygrip {}", "0".repeat(40)));
        request.comment = Some("laptop".into());
        assert_eq!(request.comment(), "laptop");
        assert!(request.description().contains("'laptop'"));
    }

    #[tokio::test]
    async fn needs_ssh_auth_sock() {
        let request = TransferRequest::new("0".repeat(40).parse().unwrap());
        let err = transfer(&request, DEFAULT_GPGCONF, |_| None).await.unwrap_err();
        assert!(matches!(err, AgentTransferError::NoAuthSock));
    }
}
