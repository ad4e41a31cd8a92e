//! Identities looked up in the keyring.
//!
//! A service identity is `scheme://host[:port]` and maps onto a
//! `known_hosts` host field; anything else is a plain user ID matched
//! byte-for-byte against certificate user IDs.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

const MAX_HOST_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Service(ServiceId),
    User(String),
}

impl Identity {
    /// Parse a user ID, recognising `scheme://` service identities.
    pub fn parse(input: &str) -> Result<Self> {
        if input.contains("://") {
            return ServiceId::parse(input).map(Self::Service);
        }
        validate_user_id(input)?;
        Ok(Self::User(input.to_string()))
    }

    /// Exact user-ID text to match in the keyring.
    pub fn user_id(&self) -> String {
        match self {
            Self::Service(s) => s.to_string(),
            Self::User(u) => u.clone(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Service(s) => s.fmt(f),
            Self::User(u) => f.write_str(u),
        }
    }
}

impl FromStr for Identity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Canonical `scheme://host[:port]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceId {
    scheme: String,
    host: String,
    port: Option<u16>,
}

impl ServiceId {
    pub fn parse(input: &str) -> Result<Self> {
        let (scheme, rest) = input
            .split_once("://")
            .ok_or_else(|| Error::identity(input, "expected scheme://host"))?;

        let scheme = scheme.to_ascii_lowercase();
        let mut chars = scheme.chars();
        let scheme_ok = chars.next().is_some_and(|c| c.is_ascii_lowercase())
            && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+.-".contains(c));
        if !scheme_ok {
            return Err(Error::identity(input, "bad scheme"));
        }

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => (host, Some(parse_port(input, port)?)),
            None => (rest, None),
        };
        let host = validate_host(input, host)?;

        let port = match (scheme.as_str(), port) {
            ("ssh", Some(22)) => None,
            (_, port) => port,
        };
        Ok(Self { scheme, host, port })
    }

    /// Convenience for `ssh://host[:port]`.
    pub fn ssh(host: &str, port: Option<u16>) -> Result<Self> {
        match port {
            Some(port) => Self::parse(&format!("ssh://{host}:{port}")),
            None => Self::parse(&format!("ssh://{host}")),
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Host field as OpenSSH writes it: `host` or `[host]:port`.
    pub fn known_hosts_name(&self) -> String {
        match self.port {
            Some(port) => format!("[{}]:{port}", self.host),
            None => self.host.clone(),
        }
    }

    /// Inverse of [`known_hosts_name`](Self::known_hosts_name) for the `ssh`
    /// scheme. Wildcards, negations and hashed names yield `None`.
    pub fn from_known_hosts_name(name: &str) -> Option<Self> {
        if name.starts_with('|') || name.contains(['*', '?', '!']) {
            return None;
        }
        if let Some(rest) = name.strip_prefix('[') {
            let (host, port) = rest.split_once("]:")?;
            return Self::ssh(host, Some(port.parse().ok()?)).ok();
        }
        Self::ssh(name, None).ok()
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

impl FromStr for ServiceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn parse_port(input: &str, port: &str) -> Result<u16> {
    if port.is_empty() || port.starts_with('0') || !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::identity(input, format!("bad port '{port}'")));
    }
    port.parse::<u16>()
        .map_err(|_| Error::identity(input, format!("port '{port}' out of range")))
}

fn validate_host(input: &str, host: &str) -> Result<String> {
    let host = host.to_ascii_lowercase();
    let host = host.strip_suffix('.').unwrap_or(&host);
    if host.is_empty() {
        return Err(Error::identity(input, "empty host"));
    }
    if host.len() > MAX_HOST_LEN {
        return Err(Error::identity(input, "host name too long"));
    }
    for label in host.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(Error::identity(input, format!("bad host label '{label}'")));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(Error::identity(input, format!("bad host label '{label}'")));
        }
        if !label.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-') {
            return Err(Error::identity(input, format!("bad host label '{label}'")));
        }
    }
    Ok(host.to_string())
}

fn validate_user_id(input: &str) -> Result<()> {
    if input.is_empty() {
        return Err(Error::identity(input, "empty user ID"));
    }
    if input.chars().any(char::is_control) {
        return Err(Error::identity(input, "control character in user ID"));
    }
    if input.trim() != input {
        return Err(Error::identity(input, "leading or trailing whitespace"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_canonical_form() {
        let id = ServiceId::parse("SSH://Host.Example.ORG.").unwrap();
        assert_eq!(id.to_string(), "ssh://host.example.org");
        assert_eq!(id.known_hosts_name(), "host.example.org");

        let id = ServiceId::parse("ssh://host.example.org:22").unwrap();
        assert_eq!(id.to_string(), "ssh://host.example.org");

        let id = ServiceId::parse("ssh://host.example.org:2222").unwrap();
        assert_eq!(id.port(), Some(2222));
        assert_eq!(id.known_hosts_name(), "[host.example.org]:2222");

        let id = ServiceId::parse("https://www.example.org:22").unwrap();
        assert_eq!(id.to_string(), "https://www.example.org:22");
    }

    #[test]
    fn service_rejections() {
        for bad in [
            "ssh://",
            "ssh://-bad.example.org",
            "ssh://bad-.example.org",
            "ssh://a..b",
            "ssh://under_score.org",
            "ssh://host:0",
            "ssh://host:022",
            "ssh://host:65536",
            "ssh://host:",
            "ssh://ho st",
            "1ssh://host",
            "s_h://host",
        ] {
            assert!(ServiceId::parse(bad).is_err(), "{bad} accepted");
        }
        let long = format!("ssh://{}", vec!["a".repeat(63); 4].join("."));
        assert!(ServiceId::parse(&long).is_err());
        let label = format!("ssh://{}.org", "a".repeat(64));
        assert!(ServiceId::parse(&label).is_err());
    }

    #[test]
    fn user_ids() {
        assert_eq!(
            Identity::parse("Alice <alice@example.org>").unwrap(),
            Identity::User("Alice <alice@example.org>".into())
        );
        assert!(Identity::parse("").is_err());
        assert!(Identity::parse(" alice").is_err());
        assert!(Identity::parse("alice\n").is_err());
        assert!(matches!(
            Identity::parse("ssh://host.example.org").unwrap(),
            Identity::Service(_)
        ));
    }

    #[test]
    fn known_hosts_names() {
        let id = ServiceId::from_known_hosts_name("[Host.example.org]:2222").unwrap();
        assert_eq!(id.to_string(), "ssh://host.example.org:2222");
        let id = ServiceId::from_known_hosts_name("host.example.org").unwrap();
        assert_eq!(id.to_string(), "ssh://host.example.org");
        assert!(ServiceId::from_known_hosts_name("|1|abc|def").is_none());
        assert!(ServiceId::from_known_hosts_name("*.example.org").is_none());
        assert!(ServiceId::from_known_hosts_name("[host]:x").is_none());
    }
}
