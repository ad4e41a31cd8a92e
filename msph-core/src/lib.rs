//! Monkeysphere core.
//!
//! Turns OpenPGP certificate validity into OpenSSH trust:
//!
//! ```text
//!  identity ──► Evaluator ──► Keyring (gpg) ──► colon records ──► Certificate
//!                  │                                                  │
//!                  │◄─────── evaluate_certificate (pure policy) ◄─────┘
//!                  │
//!                  ▼  Vec<KeyVerdict>
//!             CredentialFile (known_hosts / authorized_keys)
//!                  │  remove stale, append accepted
//!                  ▼
//!             commit (flock + temp file + rename)
//! ```
//!
//! All run-time settings travel in an explicit [`Context`]; nothing here
//! reads process-global state except where a caller asks for it
//! (`Config::load`, [`guard::current_user`]).

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod config;
pub mod error;
pub mod files;
pub mod guard;
pub mod host;
pub mod identity;
pub mod keyring;
pub mod logging;
pub mod policy;

pub use error::{Error, Result};
pub use files::GenerationStamp;
pub use identity::{Identity, ServiceId};
pub use keyring::{Certificate, Keyring};
pub use policy::{Evaluator, KeyVerdict, RejectReason, TranslatedKey, TrustPolicy};

/// Keyring-computed validity of a key or user ID (colon field 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Validity {
    /// `o`: not yet calculated.
    New,
    /// `i`
    Invalid,
    /// `d`
    Disabled,
    /// `r`
    Revoked,
    /// `e`
    Expired,
    /// `-` or empty.
    Unknown,
    /// `q`
    Undefined,
    /// `n`
    Never,
    /// `m`
    Marginal,
    /// `f`
    Full,
    /// `u`
    Ultimate,
    /// `w`, `s` or anything unrecognised.
    Other(char),
}

impl Validity {
    pub fn from_code(code: &str) -> Self {
        match code.chars().next() {
            None | Some('-') => Self::Unknown,
            Some('o') => Self::New,
            Some('i') => Self::Invalid,
            Some('d') => Self::Disabled,
            Some('r') => Self::Revoked,
            Some('e') => Self::Expired,
            Some('q') => Self::Undefined,
            Some('n') => Self::Never,
            Some('m') => Self::Marginal,
            Some('f') => Self::Full,
            Some('u') => Self::Ultimate,
            Some(other) => Self::Other(other),
        }
    }

    pub fn code(self) -> char {
        match self {
            Self::New => 'o',
            Self::Invalid => 'i',
            Self::Disabled => 'd',
            Self::Revoked => 'r',
            Self::Expired => 'e',
            Self::Unknown => '-',
            Self::Undefined => 'q',
            Self::Never => 'n',
            Self::Marginal => 'm',
            Self::Full => 'f',
            Self::Ultimate => 'u',
            Self::Other(c) => c,
        }
    }

    pub fn meets(self, threshold: TrustThreshold) -> bool {
        let rank = match self {
            Self::Marginal => 1,
            Self::Full => 2,
            Self::Ultimate => 3,
            _ => 0,
        };
        rank >= threshold as u8
    }
}

impl fmt::Display for Validity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Minimum validity a key or user ID needs to be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TrustThreshold {
    Marginal = 1,
    #[default]
    Full = 2,
    Ultimate = 3,
}

/// Key capability letters (colon field 12).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    #[default]
    #[serde(alias = "auth", alias = "a")]
    Authenticate,
    #[serde(alias = "s")]
    Sign,
    #[serde(alias = "e")]
    Encrypt,
    #[serde(alias = "c")]
    Certify,
}

impl Capability {
    /// Letter a key carries when it has this capability itself.
    pub fn letter(self) -> char {
        match self {
            Self::Authenticate => 'a',
            Self::Sign => 's',
            Self::Encrypt => 'e',
            Self::Certify => 'c',
        }
    }

    /// Letter a primary key carries when it or any usable subkey has it.
    pub fn aggregate_letter(self) -> char {
        self.letter().to_ascii_uppercase()
    }
}

/// When to consult the keyserver before evaluating an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KeyserverPolicy {
    Always,
    Never,
    /// Refresh identities not yet known locally (or, for host lookups, hosts
    /// with no trusted key on file yet).
    #[default]
    Auto,
}

impl FromStr for KeyserverPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "always" | "true" | "yes" => Ok(Self::Always),
            "never" | "false" | "no" => Ok(Self::Never),
            "auto" => Ok(Self::Auto),
            other => Err(Error::Config(format!(
                "check_keyserver must be always, never or auto (got '{other}')"
            ))),
        }
    }
}

/// Verbosity, from quietest to loudest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[serde(alias = "SILENT")]
    Silent,
    #[serde(alias = "ERROR")]
    Error,
    #[default]
    #[serde(alias = "INFO")]
    Info,
    #[serde(alias = "VERBOSE")]
    Verbose,
    #[serde(alias = "DEBUG")]
    Debug,
}

impl LogLevel {
    /// `tracing` filter directive for this level.
    pub fn filter_directive(self) -> &'static str {
        match self {
            Self::Silent => "off",
            Self::Error => "error",
            Self::Info => "info",
            Self::Verbose => "debug",
            Self::Debug => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "silent" | "quiet" => Ok(Self::Silent),
            "error" => Ok(Self::Error),
            "info" => Ok(Self::Info),
            "verbose" => Ok(Self::Verbose),
            "debug" => Ok(Self::Debug),
            other => Err(Error::Config(format!("unknown log level '{other}'"))),
        }
    }
}

/// Settings threaded through every evaluation and file update.
#[derive(Debug, Clone)]
pub struct Context {
    pub policy: TrustPolicy,
    pub keyserver: KeyserverPolicy,
    /// Treat a failed keyserver refresh as an error instead of a warning.
    pub require_fresh: bool,
    /// Enforce the ownership/permission walk on input files.
    pub strict_modes: bool,
    pub log_level: LogLevel,
    pub keyserver_timeout: Duration,
    /// Reference time for expiry checks and generation markers.
    pub now: DateTime<Utc>,
}

impl Context {
    pub fn from_config(config: &config::Config) -> Self {
        Self {
            policy: TrustPolicy {
                min_validity: config.policy.min_validity,
                capability: config.policy.required_capability,
            },
            keyserver: config.keyring.check_keyserver,
            require_fresh: config.keyring.require_fresh,
            strict_modes: config.policy.strict_modes,
            log_level: config.log_level,
            keyserver_timeout: Duration::from_secs(config.keyring.keyserver_timeout_secs),
            now: Utc::now(),
        }
    }

    pub fn stamp(&self) -> GenerationStamp {
        GenerationStamp::at(self.now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validity_threshold() {
        assert!(Validity::from_code("u").meets(TrustThreshold::Full));
        assert!(Validity::from_code("f").meets(TrustThreshold::Full));
        assert!(!Validity::from_code("m").meets(TrustThreshold::Full));
        assert!(Validity::from_code("m").meets(TrustThreshold::Marginal));
        assert!(!Validity::from_code("f").meets(TrustThreshold::Ultimate));
        assert!(!Validity::from_code("r").meets(TrustThreshold::Marginal));
        assert!(!Validity::from_code("").meets(TrustThreshold::Marginal));
        assert_eq!(Validity::from_code("w"), Validity::Other('w'));
    }

    #[test]
    fn log_level_parsing() {
        assert_eq!("VERBOSE".parse::<LogLevel>().unwrap(), LogLevel::Verbose);
        assert_eq!(LogLevel::Verbose.filter_directive(), "debug");
        assert!("loud".parse::<LogLevel>().is_err());
        assert!(LogLevel::Silent < LogLevel::Debug);
    }

    #[test]
    fn keyserver_policy_parsing() {
        assert_eq!("true".parse::<KeyserverPolicy>().unwrap(), KeyserverPolicy::Always);
        assert_eq!("Never".parse::<KeyserverPolicy>().unwrap(), KeyserverPolicy::Never);
        assert!("sometimes".parse::<KeyserverPolicy>().is_err());
    }
}
