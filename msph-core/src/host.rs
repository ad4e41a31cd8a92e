//! Host key administration: the host's own certificate in its keyring.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use msph_openpgp::{Fingerprint, KeyUsage, PemImportOptions, SshPublicKey, extract_key_from_bytes, pem_to_openpgp};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::identity::ServiceId;
use crate::keyring::{Certificate, KeyringError, SecretKeyring};
use crate::{Capability, Validity};

/// The secret certificate to operate on: the only one, or the one whose
/// fingerprint ends in `key_id`.
pub fn select_host_key<'a>(certs: &'a [Certificate], key_id: Option<&str>) -> Result<&'a Certificate> {
    let candidates: Vec<&Certificate> = certs
        .iter()
        .filter(|c| c.secret)
        .filter(|c| key_id.is_none_or(|id| c.primary.fingerprint.matches_suffix(id)))
        .collect();
    match candidates.as_slice() {
        [one] => Ok(one),
        [] => Err(Error::NoKey(match key_id {
            Some(id) => format!("no host key matches '{id}'"),
            None => "no host key in keyring".into(),
        })),
        many => Err(Error::AmbiguousKey {
            candidates: many.iter().map(|c| c.primary.fingerprint.to_string()).collect(),
        }),
    }
}

/// What `show-keys` prints for one host key.
#[derive(Debug, Clone)]
pub struct HostKeyReport {
    pub fingerprint: Fingerprint,
    pub created: Option<DateTime<Utc>>,
    pub expires: Option<DateTime<Utc>>,
    pub user_ids: Vec<(String, Validity)>,
    /// SSH forms of the primary and authentication subkeys.
    pub ssh_keys: Vec<SshPublicKey>,
}

impl fmt::Display for HostKeyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "OpenPGP fingerprint: {}", self.fingerprint)?;
        if let Some(created) = self.created {
            writeln!(f, "created: {}", created.format("%Y-%m-%d"))?;
        }
        match self.expires {
            Some(expires) => writeln!(f, "expires: {}", expires.format("%Y-%m-%d"))?,
            None => writeln!(f, "expires: never")?,
        }
        for (uid, validity) in &self.user_ids {
            writeln!(f, "uid [{validity}] {uid}")?;
        }
        for key in &self.ssh_keys {
            writeln!(f, "ssh fingerprint: {}", key.sha256_fingerprint())?;
            writeln!(f, "{key}")?;
        }
        Ok(())
    }
}

/// Host key administration against a [`SecretKeyring`].
pub struct HostKeys<'a, K: SecretKeyring + ?Sized> {
    keyring: &'a K,
    keyserver_timeout: Duration,
}

impl<'a, K: SecretKeyring + ?Sized> HostKeys<'a, K> {
    pub fn new(keyring: &'a K, keyserver_timeout: Duration) -> Self {
        Self {
            keyring,
            keyserver_timeout,
        }
    }

    async fn select(&self, key_id: Option<&str>) -> Result<Certificate> {
        let certs = self.keyring.list_secret_keys().await?;
        select_host_key(&certs, key_id).cloned()
    }

    /// Import an RSA host key from PEM under `service` (e.g. `ssh://host`).
    pub async fn import_pem(
        &self,
        pem: &str,
        service: &ServiceId,
        created: Option<u32>,
    ) -> Result<Fingerprint> {
        let options = PemImportOptions {
            key_created: created,
            signature_created: None,
            usage: KeyUsage::CERTIFY | KeyUsage::AUTHENTICATE,
            expires_after: None,
        };
        let packets = pem_to_openpgp(&service.to_string(), pem, &options)?;
        let fingerprint = extract_key_from_bytes(&packets, None)?.fingerprint;
        self.keyring.import(&packets).await?;
        info!(fingerprint = %fingerprint, service = %service, "imported host key");
        Ok(fingerprint)
    }

    /// Reports for every secret key, or the one matching `key_id`.
    pub async fn show(&self, key_id: Option<&str>) -> Result<Vec<HostKeyReport>> {
        let certs = self.keyring.list_secret_keys().await?;
        let selected: Vec<&Certificate> = match key_id {
            Some(_) => vec![select_host_key(&certs, key_id)?],
            None => certs.iter().filter(|c| c.secret).collect(),
        };
        let mut reports = Vec::with_capacity(selected.len());
        for cert in selected {
            reports.push(self.report(cert).await?);
        }
        Ok(reports)
    }

    async fn report(&self, cert: &Certificate) -> Result<HostKeyReport> {
        let exported = self.keyring.export(&cert.primary.fingerprint).await?;
        let mut ssh_keys = Vec::new();
        for key in cert.keys().filter(|k| k.can(Capability::Authenticate)) {
            let filter = key.fingerprint.to_string();
            match extract_key_from_bytes(&exported, Some(&filter))
                .and_then(|m| SshPublicKey::from_material(&m))
            {
                Ok(ssh) => ssh_keys.push(ssh),
                Err(e) => warn!(fingerprint = %key.fingerprint, error = %e, "no SSH form for key"),
            }
        }
        Ok(HostKeyReport {
            fingerprint: cert.primary.fingerprint,
            created: cert.primary.created,
            expires: cert.primary.expires,
            user_ids: cert
                .user_ids
                .iter()
                .map(|u| (u.text.clone(), u.validity))
                .collect(),
            ssh_keys,
        })
    }

    pub async fn publish(&self, key_id: Option<&str>) -> Result<Fingerprint> {
        let cert = self.select(key_id).await?;
        let fpr = cert.primary.fingerprint;
        match tokio::time::timeout(self.keyserver_timeout, self.keyring.publish(&fpr)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(KeyringError::Timeout {
                    program: "keyserver publish".into(),
                    secs: self.keyserver_timeout.as_secs(),
                }
                .into());
            }
        }
        info!(fingerprint = %fpr, "published host key");
        Ok(fpr)
    }

    pub async fn set_expire(&self, key_id: Option<&str>, expire: &str) -> Result<Fingerprint> {
        let cert = self.select(key_id).await?;
        let fpr = cert.primary.fingerprint;
        self.keyring.set_expire(&fpr, expire).await?;
        info!(fingerprint = %fpr, expire, "set host key expiration");
        Ok(fpr)
    }

    pub async fn add_service_name(&self, key_id: Option<&str>, service: &ServiceId) -> Result<Fingerprint> {
        let cert = self.select(key_id).await?;
        let fpr = cert.primary.fingerprint;
        let uid = service.to_string();
        if cert
            .user_id(&uid)
            .is_some_and(|u| u.validity != Validity::Revoked)
        {
            return Err(Error::Config(format!("host key already carries '{uid}'")));
        }
        self.keyring.add_user_id(&fpr, &uid).await?;
        info!(fingerprint = %fpr, user_id = %uid, "added service name");
        Ok(fpr)
    }

    /// Revoke the user ID whose text is exactly `service`.
    pub async fn revoke_service_name(&self, key_id: Option<&str>, service: &ServiceId) -> Result<Fingerprint> {
        let cert = self.select(key_id).await?;
        let fpr = cert.primary.fingerprint;
        let uid = service.to_string();
        if cert.user_id(&uid).is_none() {
            return Err(Error::NoSuchUserId {
                fingerprint: fpr.to_string(),
                user_id: uid,
            });
        }
        self.keyring.revoke_user_id(&fpr, &uid).await?;
        info!(fingerprint = %fpr, user_id = %uid, "revoked service name");
        Ok(fpr)
    }
}
