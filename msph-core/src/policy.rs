//! Certificate policy evaluation.
//!
//! [`evaluate_certificate`] decides, without I/O, which keys of a listed
//! certificate may stand for an identity. [`Evaluator`] wraps it with the
//! keyring round trips: optional keyserver refresh, listing, export and
//! translation of each decided key into SSH form.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use msph_openpgp::{Fingerprint, SshPublicKey, extract_key_from_bytes};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::keyring::{Certificate, KeyInfo, Keyring, KeyringError};
use crate::{Capability, Context, KeyserverPolicy, TrustThreshold, Validity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustPolicy {
    pub min_validity: TrustThreshold,
    pub capability: Capability,
}

impl Default for TrustPolicy {
    fn default() -> Self {
        Self {
            min_validity: TrustThreshold::Full,
            capability: Capability::Authenticate,
        }
    }
}

/// Why a key was not accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    PrimaryValidity(Validity),
    PrimaryDisabled,
    PrimaryExpired,
    /// Neither the primary nor any usable subkey has the capability.
    PrimaryCapability(Capability),
    /// No user ID with the exact text is valid enough and unexpired.
    UserId,
    KeyValidity(Validity),
    KeyExpired,
    KeyCapability(Capability),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PrimaryValidity(v) => write!(f, "primary key validity '{v}' below threshold"),
            Self::PrimaryDisabled => f.write_str("primary key disabled"),
            Self::PrimaryExpired => f.write_str("primary key expired"),
            Self::PrimaryCapability(c) => {
                write!(f, "certificate lacks '{}' capability", c.aggregate_letter())
            }
            Self::UserId => f.write_str("no sufficiently valid matching user ID"),
            Self::KeyValidity(v) => write!(f, "key validity '{v}' below threshold"),
            Self::KeyExpired => f.write_str("key expired"),
            Self::KeyCapability(c) => write!(f, "key lacks '{}' capability", c.letter()),
        }
    }
}

/// Outcome for one key of a certificate, before translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDecision {
    pub fingerprint: Fingerprint,
    pub primary: bool,
    pub verdict: std::result::Result<(), RejectReason>,
}

/// Decide every key of `cert` against the user ID `target`.
///
/// The primary gets a decision only when it carries the capability itself;
/// every subkey gets one. A key is accepted only when the primary gate, the
/// user-ID gate and the key's own checks all pass.
pub fn evaluate_certificate(
    cert: &Certificate,
    target: &str,
    policy: &TrustPolicy,
    now: DateTime<Utc>,
) -> Vec<KeyDecision> {
    let cap = policy.capability;
    let primary = &cert.primary;

    let primary_gate = if primary.disabled() {
        Err(RejectReason::PrimaryDisabled)
    } else if !primary.validity.meets(policy.min_validity) {
        Err(RejectReason::PrimaryValidity(primary.validity))
    } else if primary.expired_at(now) {
        Err(RejectReason::PrimaryExpired)
    } else if !primary.can_aggregate(cap) {
        Err(RejectReason::PrimaryCapability(cap))
    } else {
        Ok(())
    };

    let uid_ok = cert
        .user_ids
        .iter()
        .filter(|u| u.text == target)
        .any(|u| u.validity.meets(policy.min_validity) && !u.expired_at(now));

    let gate = primary_gate.and_then(|()| {
        if uid_ok {
            Ok(())
        } else {
            Err(RejectReason::UserId)
        }
    });

    let own_checks = |key: &KeyInfo| -> std::result::Result<(), RejectReason> {
        if !key.validity.meets(policy.min_validity) {
            return Err(RejectReason::KeyValidity(key.validity));
        }
        if key.expired_at(now) {
            return Err(RejectReason::KeyExpired);
        }
        if !key.can(cap) {
            return Err(RejectReason::KeyCapability(cap));
        }
        Ok(())
    };

    let mut decisions = Vec::with_capacity(cert.subkeys.len() + 1);
    if primary.can(cap) {
        decisions.push(KeyDecision {
            fingerprint: primary.fingerprint,
            primary: true,
            verdict: gate.clone().and_then(|()| own_checks(primary)),
        });
    }
    for sub in &cert.subkeys {
        decisions.push(KeyDecision {
            fingerprint: sub.fingerprint,
            primary: false,
            verdict: gate.clone().and_then(|()| own_checks(sub)),
        });
    }
    decisions
}

// ---------------------------------------------------------------------------
// Translated verdicts
// ---------------------------------------------------------------------------

/// A key in SSH form together with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatedKey {
    pub key: SshPublicKey,
    pub identity: Identity,
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyVerdict {
    Accepted(TranslatedKey),
    Rejected(TranslatedKey, RejectReason),
}

impl KeyVerdict {
    pub fn key(&self) -> &TranslatedKey {
        match self {
            Self::Accepted(k) | Self::Rejected(k, _) => k,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }

    /// Rejected before accepted, then by key and fingerprint.
    pub fn rejected_first(a: &Self, b: &Self) -> Ordering {
        a.is_accepted()
            .cmp(&b.is_accepted())
            .then_with(|| a.key().key.cmp(&b.key().key))
            .then_with(|| a.key().fingerprint.cmp(&b.key().fingerprint))
    }
}

/// Whether to consult the keyserver before listing.
///
/// `trusted_key_present` is set by callers that already know whether a key
/// for the identity is on file (the proxy command); it replaces the
/// "known locally" test under [`KeyserverPolicy::Auto`].
pub fn should_refresh(
    policy: KeyserverPolicy,
    locally_known: bool,
    trusted_key_present: Option<bool>,
) -> bool {
    match policy {
        KeyserverPolicy::Always => true,
        KeyserverPolicy::Never => false,
        KeyserverPolicy::Auto => !trusted_key_present.unwrap_or(locally_known),
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

pub struct Evaluator<'a, K: Keyring + ?Sized> {
    keyring: &'a K,
    ctx: &'a Context,
}

impl<'a, K: Keyring + ?Sized> Evaluator<'a, K> {
    pub fn new(keyring: &'a K, ctx: &'a Context) -> Self {
        Self { keyring, ctx }
    }

    pub async fn evaluate(&self, identity: &Identity) -> Result<Vec<KeyVerdict>> {
        self.evaluate_with_hint(identity, None).await
    }

    /// Evaluate `identity`, with an optional hint for the refresh decision.
    pub async fn evaluate_with_hint(
        &self,
        identity: &Identity,
        trusted_key_present: Option<bool>,
    ) -> Result<Vec<KeyVerdict>> {
        let user_id = identity.user_id();
        let mut certs = self.keyring.list_certificates(&user_id).await?;

        if should_refresh(self.ctx.keyserver, !certs.is_empty(), trusted_key_present) {
            match self.refresh(&user_id).await {
                Ok(()) => certs = self.keyring.list_certificates(&user_id).await?,
                Err(e) if self.ctx.require_fresh => return Err(e.into()),
                Err(e) => warn!(user_id = %user_id, error = %e, "keyserver refresh failed, using local keyring"),
            }
        }

        if certs.is_empty() {
            return Err(Error::NoPrimaryKeys(user_id));
        }

        let mut verdicts = Vec::new();
        for cert in &certs {
            let decisions = evaluate_certificate(cert, &user_id, &self.ctx.policy, self.ctx.now);
            if decisions.is_empty() {
                debug!(fingerprint = %cert.primary.fingerprint, "certificate has no usable keys");
                continue;
            }
            let exported = match self.keyring.export(&cert.primary.fingerprint).await {
                Ok(data) => data,
                Err(e) => {
                    warn!(fingerprint = %cert.primary.fingerprint, error = %e, "export failed, skipping certificate");
                    continue;
                }
            };
            for decision in decisions {
                let Some(translated) = translate(&exported, &decision.fingerprint, identity) else {
                    continue;
                };
                match decision.verdict {
                    Ok(()) => {
                        debug!(fingerprint = %decision.fingerprint, user_id = %user_id, "key accepted");
                        verdicts.push(KeyVerdict::Accepted(translated));
                    }
                    Err(reason) => {
                        debug!(fingerprint = %decision.fingerprint, user_id = %user_id, %reason, "key rejected");
                        verdicts.push(KeyVerdict::Rejected(translated, reason));
                    }
                }
            }
        }
        verdicts.sort_by(KeyVerdict::rejected_first);
        info!(
            user_id = %user_id,
            accepted = verdicts.iter().filter(|v| v.is_accepted()).count(),
            rejected = verdicts.iter().filter(|v| !v.is_accepted()).count(),
            "evaluated identity"
        );
        Ok(verdicts)
    }

    async fn refresh(&self, user_id: &str) -> std::result::Result<(), KeyringError> {
        let timeout = self.ctx.keyserver_timeout;
        info!(user_id = %user_id, "refreshing from keyserver");
        match tokio::time::timeout(timeout, self.keyring.refresh(user_id)).await {
            Ok(result) => result,
            Err(_) => Err(KeyringError::Timeout {
                program: "keyserver refresh".into(),
                secs: timeout.as_secs(),
            }),
        }
    }
}

fn translate(exported: &[u8], fingerprint: &Fingerprint, identity: &Identity) -> Option<TranslatedKey> {
    let filter = fingerprint.to_string();
    let key = extract_key_from_bytes(exported, Some(&filter))
        .and_then(|material| SshPublicKey::from_material(&material));
    match key {
        Ok(key) => Some(TranslatedKey {
            key,
            identity: identity.clone(),
            fingerprint: *fingerprint,
        }),
        Err(e) => {
            warn!(fingerprint = %fingerprint, error = %e, "cannot translate key to SSH, skipping");
            None
        }
    }
}
