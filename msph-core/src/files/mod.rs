//! Generated credential files.
//!
//! A file is loaded into a [`CredentialFile`], evaluator verdicts are
//! applied to it in two passes (every line carrying a decided key is
//! removed, then one line per accepted key is appended) and the result is
//! committed atomically. Lines written here carry a [`GenerationStamp`]
//! token; everything else is foreign and kept verbatim.

pub mod authorized_keys;
pub mod commit;
pub mod known_hosts;

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDateTime, Utc};
use msph_openpgp::SshPublicKey;

use crate::policy::{KeyVerdict, TranslatedKey};

const STAMP_PREFIX: &str = "MonkeySphere";
const STAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// `MonkeySphere<YYYY-MM-DDTHH:MM:SS>` marker on managed lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationStamp(String);

impl GenerationStamp {
    pub fn at(time: DateTime<Utc>) -> Self {
        Self(format!("{STAMP_PREFIX}{}", time.format(STAMP_FORMAT)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_stamp(token: &str) -> bool {
        token
            .strip_prefix(STAMP_PREFIX)
            .is_some_and(|t| NaiveDateTime::parse_from_str(t, STAMP_FORMAT).is_ok())
    }
}

impl fmt::Display for GenerationStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How one kind of credential file writes and recognises key lines.
pub trait CredentialFormat {
    /// Whether `line` holds the key of `key` for its identity.
    fn matches(&self, line: &str, key: &TranslatedKey) -> bool;

    fn format(&self, key: &TranslatedKey, stamp: &GenerationStamp) -> String;
}

/// Counts from one [`CredentialFile::apply`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub removed: usize,
    pub added: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialFile {
    lines: Vec<String>,
}

impl CredentialFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Self {
        Self {
            lines: text.lines().map(str::to_string).collect(),
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Nothing but blank lines.
    pub fn is_empty(&self) -> bool {
        self.lines.iter().all(|l| l.trim().is_empty())
    }

    pub fn push_line(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    /// Drop every line this tool generated. Returns how many went.
    pub fn remove_managed(&mut self) -> usize {
        let before = self.lines.len();
        self.lines.retain(|l| !is_managed(l));
        before - self.lines.len()
    }

    /// Remove lines for every decided key, then append accepted ones.
    pub fn apply(
        &mut self,
        verdicts: &[KeyVerdict],
        format: &impl CredentialFormat,
        stamp: &GenerationStamp,
    ) -> ApplySummary {
        let before = self.lines.len();
        self.lines
            .retain(|line| !verdicts.iter().any(|v| format.matches(line, v.key())));
        let removed = before - self.lines.len();

        let mut added = 0;
        for verdict in verdicts {
            if let KeyVerdict::Accepted(key) = verdict {
                self.lines.push(format.format(key, stamp));
                added += 1;
            }
        }
        ApplySummary { removed, added }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

pub fn is_managed(line: &str) -> bool {
    !line.trim_start().starts_with('#') && line.split_whitespace().any(GenerationStamp::is_stamp)
}

/// The first `<type> <base64>` pair on a line, wherever it sits.
pub fn line_key(line: &str) -> Option<SshPublicKey> {
    if line.trim_start().starts_with('#') {
        return None;
    }
    let tokens: Vec<&str> = line.split_whitespace().collect();
    tokens.windows(2).find_map(|pair| {
        if !pair[0].starts_with("ssh-") {
            return None;
        }
        format!("{} {}", pair[0], pair[1]).parse().ok()
    })
}

/// Outcome of regenerating one file.
#[derive(Debug, Clone, Default)]
pub struct UpdateSummary {
    pub target: PathBuf,
    pub processed: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub removed: usize,
    /// Identities with no certificate in the keyring.
    pub unknown: Vec<String>,
    /// Identities whose evaluation failed, with the error.
    pub failed: Vec<(String, String)>,
}

impl UpdateSummary {
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub(crate) fn record(&mut self, verdicts: &[KeyVerdict], applied: ApplySummary) {
        self.processed += 1;
        self.accepted += applied.added;
        self.rejected += verdicts.iter().filter(|v| !v.is_accepted()).count();
        self.removed += applied.removed;
    }
}
