use std::io;

#[derive(Debug, thiserror::Error)]
pub enum AgentTransferError {
    #[error("keygrip must be 40 hexadecimal digits")]
    InvalidKeygrip,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("gpgconf {args}: {reason}")]
    Gpgconf { args: String, reason: String },

    #[error("gpg-agent returned ERR {code}: {message}")]
    Agent { code: u32, message: String },

    #[error("assuan protocol error: {0}")]
    Protocol(String),

    #[error("keywrap key has {0} bytes, expected 16")]
    KeyLength(usize),

    #[error("key unwrap failed: {0}")]
    Unwrap(&'static str),

    #[error("malformed S-expression: {0}")]
    Sexp(String),

    #[error("unsupported key: {0}")]
    Unsupported(String),

    #[error("SSH_AUTH_SOCK is not set, cannot talk to ssh-agent")]
    NoAuthSock,

    #[error("ssh-agent: {0}")]
    SshAgent(String),
}

pub type Result<T> = std::result::Result<T, AgentTransferError>;

impl AgentTransferError {
    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> Self {
        let context = context.into();
        move |source| Self::Io { context, source }
    }
}
