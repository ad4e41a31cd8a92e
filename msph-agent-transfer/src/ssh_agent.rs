//! Adding a key to ssh-agent through `ssh-agent-lib`'s client.

use std::path::{Path, PathBuf};

use ssh_agent_lib::agent::Session;
use ssh_agent_lib::client::Client;
use ssh_agent_lib::proto::{AddIdentity, AddIdentityConstrained, KeyConstraint, Credential};
use ssh_key::Mpint;
use ssh_key::private::{Ed25519Keypair, Ed25519PrivateKey, KeypairData, RsaKeypair, RsaPrivateKey};
use ssh_key::public::{Ed25519PublicKey, RsaPublicKey};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tracing::debug;

use crate::error::{AgentTransferError, Result};
use crate::secret::SecretKey;

/// Restrictions the agent enforces on the added key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Constraints {
    /// Seconds before the agent forgets the key.
    pub lifetime: Option<u32>,
    /// Ask the user before each use.
    pub confirm: bool,
}

impl Constraints {
    pub fn is_empty(&self) -> bool {
        self.lifetime.is_none() && !self.confirm
    }

    /// Confirm first, then lifetime.
    pub fn to_key_constraints(self) -> Vec<KeyConstraint> {
        let mut out = Vec::with_capacity(2);
        if self.confirm {
            out.push(KeyConstraint::Confirm);
        }
        if let Some(seconds) = self.lifetime {
            out.push(KeyConstraint::Lifetime(seconds));
        }
        out
    }
}

/// `SSH_AUTH_SOCK` from `env`.
pub fn auth_sock(env: impl Fn(&str) -> Option<String>) -> Result<PathBuf> {
    env("SSH_AUTH_SOCK")
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .ok_or(AgentTransferError::NoAuthSock)
}

pub async fn connect(path: &Path) -> Result<UnixStream> {
    UnixStream::connect(path)
        .await
        .map_err(AgentTransferError::io(format!("connect to ssh-agent at {}", path.display())))
}

fn mpint(bytes: &[u8]) -> Result<Mpint> {
    Mpint::from_positive_bytes(bytes).map_err(|e| AgentTransferError::Unsupported(e.to_string()))
}

/// The key in the form ssh-agent stores it: RSA as `n e d iqmp p q`,
/// Ed25519 as the public point and `seed ‖ point`.
pub fn keypair_data(key: &SecretKey) -> Result<KeypairData> {
    Ok(match key {
        SecretKey::Rsa(rsa) => KeypairData::Rsa(RsaKeypair {
            public: RsaPublicKey {
                e: mpint(&rsa.e)?,
                n: mpint(&rsa.n)?,
            },
            private: RsaPrivateKey {
                d: mpint(&rsa.d)?,
                iqmp: mpint(&rsa.iqmp)?,
                p: mpint(&rsa.p)?,
                q: mpint(&rsa.q)?,
            },
        }),
        SecretKey::Ed25519(ed) => KeypairData::Ed25519(Ed25519Keypair {
            public: Ed25519PublicKey(ed.public),
            private: Ed25519PrivateKey::from_bytes(&ed.seed),
        }),
    })
}

/// Send the key; the client only returns `Ok` on `SSH_AGENT_SUCCESS`.
pub async fn add_identity<S>(
    stream: S,
    key: &SecretKey,
    comment: &str,
    constraints: Constraints,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + std::fmt::Debug + Send + Sync + Unpin + 'static,
{
    let identity = AddIdentity {
        credential: Credential::Key {
            privkey: keypair_data(key)?,
            comment: comment.to_string(),
        },
    };
    let mut client = Client::new(stream);
    let sent = if constraints.is_empty() {
        client.add_identity(identity).await
    } else {
        client
            .add_identity_constrained(AddIdentityConstrained {
                identity,
                constraints: constraints.to_key_constraints(),
            })
            .await
    };
    sent.map_err(|e| AgentTransferError::SshAgent(e.to_string()))?;
    debug!(key_type = key.ssh_key_type(), comment, "ssh-agent accepted key");
    Ok(())
}
