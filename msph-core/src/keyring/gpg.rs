use std::path::PathBuf;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use msph_openpgp::Fingerprint;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

use super::colons::Certificate;
use super::{Keyring, KeyringError, SecretKeyring};
use crate::config::KeyringConfig;

const LIST_ARGS: &[&str] = &[
    "--fixed-list-mode",
    "--with-colons",
    "--with-fingerprint",
    "--with-fingerprint",
];

/// [`Keyring`] backed by the `gpg` binary.
///
/// Every call spawns one `gpg` process. Children are killed when the future
/// driving them is dropped, so wrapping a call in `tokio::time::timeout`
/// bounds it.
#[derive(Debug, Clone)]
pub struct GpgKeyring {
    program: String,
    homedir: Option<PathBuf>,
    keyserver: Option<String>,
}

impl GpgKeyring {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            homedir: None,
            keyserver: None,
        }
    }

    /// Program, home directory and keyserver as configured.
    pub fn from_config(config: &KeyringConfig) -> Self {
        let keyring = Self::new(&config.gpg_program).with_keyserver(&config.keyserver);
        match &config.gnupghome {
            Some(home) => keyring.with_homedir(home),
            None => keyring,
        }
    }

    pub fn with_homedir(mut self, homedir: impl Into<PathBuf>) -> Self {
        self.homedir = Some(homedir.into());
        self
    }

    pub fn with_keyserver(mut self, keyserver: impl Into<String>) -> Self {
        self.keyserver = Some(keyserver.into());
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        if let Some(home) = &self.homedir {
            cmd.arg("--homedir").arg(home);
        }
        cmd.arg("--no-tty")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn keyserver_args(&self) -> Vec<&str> {
        match &self.keyserver {
            Some(ks) => vec!["--keyserver", ks.as_str()],
            None => Vec::new(),
        }
    }

    async fn run(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Output, KeyringError> {
        debug!(program = %self.program, ?args, "running keyring command");
        let mut cmd = self.command();
        cmd.args(args);
        if stdin.is_some() {
            cmd.stdin(Stdio::piped());
        }
        let mut child = cmd.spawn().map_err(|source| KeyringError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        if let Some(input) = stdin
            && let Some(mut pipe) = child.stdin.take()
        {
            pipe.write_all(input)
                .await
                .map_err(|source| KeyringError::Spawn {
                    program: self.program.clone(),
                    source,
                })?;
        }
        child
            .wait_with_output()
            .await
            .map_err(|source| KeyringError::Spawn {
                program: self.program.clone(),
                source,
            })
    }

    /// Run and require a zero exit status.
    async fn run_ok(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Output, KeyringError> {
        let output = self.run(args, stdin).await?;
        if !output.status.success() {
            return Err(KeyringError::Failed {
                program: self.program.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    async fn list(
        &self,
        command: &str,
        extra: &[&str],
        pattern: Option<&str>,
    ) -> Result<Vec<Certificate>, KeyringError> {
        let mut args = vec![command];
        args.extend_from_slice(LIST_ARGS);
        args.extend_from_slice(extra);
        if let Some(pattern) = pattern {
            args.push(pattern);
        }
        let output = self.run(&args, None).await?;
        // gpg exits non-zero when nothing matches
        if !output.status.success() {
            trace!(
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "listing returned no keys"
            );
            return Ok(Vec::new());
        }
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(Certificate::parse_listing(&text))
    }
}

/// Selects the whole certificate holding `fingerprint`, subkeys included.
fn export_selector(fingerprint: &Fingerprint) -> String {
    format!("0x{fingerprint}")
}

#[async_trait]
impl Keyring for GpgKeyring {
    async fn list_certificates(&self, user_id: &str) -> Result<Vec<Certificate>, KeyringError> {
        let pattern = format!("={user_id}");
        let certs = self.list("--list-keys", &[], Some(&pattern)).await?;
        // `=` matching is exact on the full user ID, but keep only the
        // certificates that really carry it
        Ok(certs
            .into_iter()
            .filter(|c| c.user_id(user_id).is_some())
            .collect())
    }

    async fn export(&self, fingerprint: &Fingerprint) -> Result<Vec<u8>, KeyringError> {
        let selector = export_selector(fingerprint);
        let output = self.run_ok(&["--export", "--no-armor", &selector], None).await?;
        if output.stdout.is_empty() {
            return Err(KeyringError::Parse(format!("export of {fingerprint} was empty")));
        }
        Ok(output.stdout)
    }

    async fn refresh(&self, user_id: &str) -> Result<(), KeyringError> {
        let pattern = format!("={user_id}");
        let mut args = vec!["--quiet", "--batch", "--with-colons", "--command-fd", "0"];
        args.extend(self.keyserver_args());
        args.extend(["--search", pattern.as_str()]);
        // select every search result for import
        self.run_ok(&args, Some(b"1,2,3,4,5\n")).await?;
        Ok(())
    }
}

#[async_trait]
impl SecretKeyring for GpgKeyring {
    async fn list_secret_keys(&self) -> Result<Vec<Certificate>, KeyringError> {
        self.list("--list-secret-keys", &["--with-keygrip"], None)
            .await
    }

    async fn import(&self, data: &[u8]) -> Result<(), KeyringError> {
        self.run_ok(&["--batch", "--import"], Some(data)).await?;
        Ok(())
    }

    async fn add_user_id(&self, key: &Fingerprint, user_id: &str) -> Result<(), KeyringError> {
        let fpr = key.to_string();
        self.run_ok(&["--batch", "--quick-add-uid", &fpr, user_id], None)
            .await?;
        Ok(())
    }

    async fn revoke_user_id(
        &self,
        key: &Fingerprint,
        user_id: &str,
    ) -> Result<(), KeyringError> {
        let fpr = key.to_string();
        self.run_ok(&["--batch", "--quick-revoke-uid", &fpr, user_id], None)
            .await?;
        Ok(())
    }

    async fn set_expire(&self, key: &Fingerprint, expire: &str) -> Result<(), KeyringError> {
        let fpr = key.to_string();
        self.run_ok(&["--batch", "--quick-set-expire", &fpr, expire], None)
            .await?;
        Ok(())
    }

    async fn publish(&self, key: &Fingerprint) -> Result<(), KeyringError> {
        let fpr = key.to_string();
        let mut args = vec!["--batch"];
        args.extend(self.keyserver_args());
        args.extend(["--send-keys", fpr.as_str()]);
        self.run_ok(&args, None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use msph_openpgp::transcode::extract_key_from_bytes;

    use super::*;
    use crate::identity::Identity;
    use crate::policy::Evaluator;
    use crate::policy::tests::{HOST_FPR, HOST_PUB, ctx};

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let keyring = GpgKeyring::new("/nonexistent/msph-gpg");
        let err = keyring.list_certificates("ssh://host.example.org").await.unwrap_err();
        assert!(matches!(err, KeyringError::Spawn { .. }));
    }

    #[tokio::test]
    async fn listing_failure_is_empty() {
        // `false` exits 1 without output, as gpg does on no match
        let keyring = GpgKeyring::new("false");
        assert!(keyring.list_certificates("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn export_failure_reports_status() {
        let keyring = GpgKeyring::new("false");
        let fpr: Fingerprint = "91EE6DF0531F07B00790883F908822ADF43D70C7".parse().unwrap();
        let err = keyring.export(&fpr).await.unwrap_err();
        assert!(matches!(err, KeyringError::Failed { .. }));
    }

    #[test]
    fn configured_homedir_is_passed_first() {
        let config = KeyringConfig {
            gnupghome: Some("/var/lib/monkeysphere/host".into()),
            ..KeyringConfig::default()
        };
        let cmd = GpgKeyring::from_config(&config).command();
        let args: Vec<_> = cmd.as_std().get_args().collect();
        assert_eq!(args[0], "--homedir");
        assert_eq!(args[1], "/var/lib/monkeysphere/host");
        assert_eq!(cmd.as_std().get_program(), "gpg");

        let bare = GpgKeyring::from_config(&KeyringConfig::default()).command();
        assert_eq!(bare.as_std().get_args().next().unwrap(), "--no-tty");
    }

    #[test]
    fn export_selects_whole_certificate() {
        let fpr: Fingerprint = HOST_FPR.parse().unwrap();
        assert_eq!(export_selector(&fpr), format!("0x{HOST_FPR}"));
    }

    fn have_gpg() -> bool {
        std::process::Command::new("gpg")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|s| s.success())
    }

    #[tokio::test]
    async fn gnupg_export_carries_subkeys() {
        if !have_gpg() {
            eprintln!("gpg not installed, skipping");
            return;
        }
        let home = tempfile::tempdir().unwrap();
        std::fs::write(
            home.path().join("gpg.conf"),
            "ignore-time-conflict\nignore-valid-from\n",
        )
        .unwrap();
        let keyring = GpgKeyring::new("gpg").with_homedir(home.path());
        keyring.import(HOST_PUB).await.unwrap();

        let fpr: Fingerprint = HOST_FPR.parse().unwrap();
        let exported = keyring.export(&fpr).await.unwrap();
        for subkey in ["091B3BAAC332A4F6C6A4DF1F6430C60CAF12B701", "20769B0F7CC2E3DB"] {
            extract_key_from_bytes(&exported, Some(subkey)).unwrap();
        }

        // nothing is trusted in a fresh home, so both subkeys come back rejected
        let ctx = ctx();
        let identity = Identity::parse("ssh://host.example.org").unwrap();
        let verdicts = Evaluator::new(&keyring, &ctx).evaluate(&identity).await.unwrap();
        let mut types: Vec<&str> = verdicts.iter().map(|v| v.key().key.key_type()).collect();
        types.sort_unstable();
        assert_eq!(types, ["ssh-ed25519", "ssh-rsa"]);
        assert!(!verdicts.iter().any(|v| v.is_accepted()));
    }
}
