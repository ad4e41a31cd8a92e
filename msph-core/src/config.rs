use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::{Capability, KeyserverPolicy, LogLevel, TrustThreshold};

pub const SYSTEM_CONFIG_PATH: &str = "/etc/monkeysphere/config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub keyring: KeyringConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub known_hosts: KnownHostsConfig,
    #[serde(default)]
    pub authorized_keys: AuthorizedKeysConfig,
    #[serde(default)]
    pub authentication: AuthenticationConfig,
    #[serde(default)]
    pub host: HostConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyringConfig {
    /// GnuPG home directory; gpg's own default when unset.
    #[serde(default)]
    pub gnupghome: Option<String>,
    #[serde(default = "default_keyserver")]
    pub keyserver: String,
    #[serde(default)]
    pub check_keyserver: KeyserverPolicy,
    #[serde(default = "default_keyserver_timeout_secs")]
    pub keyserver_timeout_secs: u64,
    /// Fail instead of falling back to local data when a refresh fails.
    #[serde(default)]
    pub require_fresh: bool,
    #[serde(default = "default_gpg_program")]
    pub gpg_program: String,
}

impl Default for KeyringConfig {
    fn default() -> Self {
        Self {
            gnupghome: None,
            keyserver: default_keyserver(),
            check_keyserver: KeyserverPolicy::default(),
            keyserver_timeout_secs: default_keyserver_timeout_secs(),
            require_fresh: false,
            gpg_program: default_gpg_program(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub min_validity: TrustThreshold,
    #[serde(default)]
    pub required_capability: Capability,
    #[serde(default = "default_true")]
    pub strict_modes: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            min_validity: TrustThreshold::default(),
            required_capability: Capability::default(),
            strict_modes: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownHostsConfig {
    #[serde(default = "default_known_hosts")]
    pub path: String,
    /// Write `|1|salt|hmac` host fields instead of clear host names.
    #[serde(default = "default_true")]
    pub hash: bool,
}

impl Default for KnownHostsConfig {
    fn default() -> Self {
        Self {
            path: default_known_hosts(),
            hash: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizedKeysConfig {
    #[serde(default = "default_authorized_keys")]
    pub path: String,
    #[serde(default = "default_user_ids")]
    pub user_ids: String,
    /// Option string prefixed to every generated line, e.g. `no-X11-forwarding`.
    #[serde(default)]
    pub options: Option<String>,
}

impl Default for AuthorizedKeysConfig {
    fn default() -> Self {
        Self {
            path: default_authorized_keys(),
            user_ids: default_user_ids(),
            options: None,
        }
    }
}

/// Settings for the system-wide `authorized_keys` generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticationConfig {
    #[serde(default = "default_sysdata_dir")]
    pub sysdata_dir: String,
    #[serde(default = "default_authentication_user_ids")]
    pub authorized_user_ids: String,
    /// Per-user file appended verbatim; `"none"` disables.
    #[serde(default = "default_raw_authorized_keys")]
    pub raw_authorized_keys: String,
    /// Keyring used to validate users' certificates.
    #[serde(default)]
    pub gnupghome: Option<String>,
}

impl Default for AuthenticationConfig {
    fn default() -> Self {
        Self {
            sysdata_dir: default_sysdata_dir(),
            authorized_user_ids: default_authentication_user_ids(),
            raw_authorized_keys: default_raw_authorized_keys(),
            gnupghome: None,
        }
    }
}

impl AuthenticationConfig {
    pub fn raw_authorized_keys(&self) -> Option<&str> {
        (!self.raw_authorized_keys.eq_ignore_ascii_case("none"))
            .then_some(self.raw_authorized_keys.as_str())
    }

    pub fn output_dir(&self) -> PathBuf {
        Path::new(&self.sysdata_dir).join("authorized_keys")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default = "default_host_gnupghome")]
    pub gnupghome: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            gnupghome: default_host_gnupghome(),
        }
    }
}

impl Config {
    /// Read and parse `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(Error::io(path)(e)),
        };
        toml::from_str(&text).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Apply `MONKEYSPHERE_*` overrides read through `env`.
    pub fn apply_env_overrides(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = env("MONKEYSPHERE_LOG_LEVEL") {
            self.log_level = v.parse()?;
        }
        if let Some(v) = env("MONKEYSPHERE_KEYSERVER") {
            self.keyring.keyserver = v;
        }
        if let Some(v) = env("MONKEYSPHERE_CHECK_KEYSERVER") {
            self.keyring.check_keyserver = v.parse()?;
        }
        if let Some(v) = env("MONKEYSPHERE_GNUPGHOME") {
            self.keyring.gnupghome = Some(v);
        }
        if let Some(v) = env("MONKEYSPHERE_KNOWN_HOSTS") {
            self.known_hosts.path = v;
        }
        if let Some(v) = env("MONKEYSPHERE_HASH_KNOWN_HOSTS") {
            self.known_hosts.hash = parse_bool("MONKEYSPHERE_HASH_KNOWN_HOSTS", &v)?;
        }
        if let Some(v) = env("MONKEYSPHERE_AUTHORIZED_KEYS") {
            self.authorized_keys.path = v;
        }
        if let Some(v) = env("MONKEYSPHERE_STRICT_MODES") {
            self.policy.strict_modes = parse_bool("MONKEYSPHERE_STRICT_MODES", &v)?;
        }
        Ok(())
    }
}

/// Config file location: an explicit path, else `$MONKEYSPHERE_CONFIG`, else
/// the per-user XDG location or the system-wide one.
pub fn resolve_path(explicit: Option<PathBuf>, system: bool) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    if let Some(path) = std::env::var_os("MONKEYSPHERE_CONFIG") {
        return PathBuf::from(path);
    }
    if system {
        return PathBuf::from(SYSTEM_CONFIG_PATH);
    }
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| {
            warn!("neither XDG_CONFIG_HOME nor HOME are set; using current directory for config");
            PathBuf::from(".")
        });
    base.join("monkeysphere").join("config.toml")
}

/// Expand `~` (leading only), `%h` and `%u` in a configured path.
pub fn expand_path(template: &str, home: &Path, user: &str) -> PathBuf {
    let home_str = home.to_string_lossy();
    let mut out = String::with_capacity(template.len());
    let rest = if template == "~" {
        out.push_str(&home_str);
        ""
    } else if let Some(rest) = template.strip_prefix("~/") {
        out.push_str(&home_str);
        out.push('/');
        rest
    } else {
        template
    };

    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('h') => {
                out.push_str(&home_str);
                chars.next();
            }
            Some('u') => {
                out.push_str(user);
                chars.next();
            }
            Some('%') => {
                out.push('%');
                chars.next();
            }
            _ => out.push('%'),
        }
    }
    PathBuf::from(out)
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Ok(true),
        "false" | "no" | "0" | "off" => Ok(false),
        other => Err(Error::Config(format!("{name} must be true or false (got '{other}')"))),
    }
}

fn default_true() -> bool {
    true
}

fn default_keyserver() -> String {
    "hkps://keys.openpgp.org".to_string()
}

fn default_keyserver_timeout_secs() -> u64 {
    30
}

fn default_gpg_program() -> String {
    "gpg".to_string()
}

fn default_known_hosts() -> String {
    "~/.ssh/known_hosts".to_string()
}

fn default_authorized_keys() -> String {
    "~/.ssh/authorized_keys".to_string()
}

fn default_user_ids() -> String {
    "~/.monkeysphere/authorized_user_ids".to_string()
}

fn default_sysdata_dir() -> String {
    "/var/lib/monkeysphere".to_string()
}

fn default_authentication_user_ids() -> String {
    "%h/.monkeysphere/authorized_user_ids".to_string()
}

fn default_raw_authorized_keys() -> String {
    "%h/.ssh/authorized_keys".to_string()
}

fn default_host_gnupghome() -> String {
    "/var/lib/monkeysphere/host".to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.log_level, LogLevel::Info);
        assert_eq!(cfg.keyring.keyserver, "hkps://keys.openpgp.org");
        assert_eq!(cfg.keyring.check_keyserver, KeyserverPolicy::Auto);
        assert_eq!(cfg.keyring.keyserver_timeout_secs, 30);
        assert_eq!(cfg.keyring.gpg_program, "gpg");
        assert!(cfg.keyring.gnupghome.is_none());
        assert_eq!(cfg.policy.min_validity, TrustThreshold::Full);
        assert_eq!(cfg.policy.required_capability, Capability::Authenticate);
        assert!(cfg.policy.strict_modes);
        assert!(cfg.known_hosts.hash);
        assert_eq!(cfg.authentication.sysdata_dir, "/var/lib/monkeysphere");
        assert_eq!(cfg.host.gnupghome, "/var/lib/monkeysphere/host");
    }

    #[test]
    fn parse_sections() {
        let toml_str = r#"
            log_level = "verbose"

            [keyring]
            keyserver = "hkp://pool.example.net"
            check_keyserver = "never"
            keyserver_timeout_secs = 5

            [policy]
            min_validity = "marginal"
            strict_modes = false

            [known_hosts]
            hash = false

            [authorized_keys]
            options = "no-X11-forwarding"

            [authentication]
            raw_authorized_keys = "none"
        "#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.log_level, LogLevel::Verbose);
        assert_eq!(cfg.keyring.keyserver, "hkp://pool.example.net");
        assert_eq!(cfg.keyring.check_keyserver, KeyserverPolicy::Never);
        assert_eq!(cfg.keyring.keyserver_timeout_secs, 5);
        assert_eq!(cfg.policy.min_validity, TrustThreshold::Marginal);
        assert!(!cfg.policy.strict_modes);
        assert!(!cfg.known_hosts.hash);
        // Untouched fields keep defaults
        assert_eq!(cfg.known_hosts.path, "~/.ssh/known_hosts");
        assert_eq!(cfg.authorized_keys.options.as_deref(), Some("no-X11-forwarding"));
        assert!(cfg.authentication.raw_authorized_keys().is_none());
    }

    #[test]
    fn capability_aliases() {
        let cfg: Config = toml::from_str("[policy]\nrequired_capability = \"auth\"").unwrap();
        assert_eq!(cfg.policy.required_capability, Capability::Authenticate);
        let cfg: Config = toml::from_str("[policy]\nrequired_capability = \"sign\"").unwrap();
        assert_eq!(cfg.policy.required_capability, Capability::Sign);
    }

    #[test]
    fn rejects_unknown_enum_values() {
        assert!(toml::from_str::<Config>("[policy]\nmin_validity = \"total\"").is_err());
    }

    #[test]
    fn env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("MONKEYSPHERE_LOG_LEVEL", "DEBUG"),
            ("MONKEYSPHERE_CHECK_KEYSERVER", "false"),
            ("MONKEYSPHERE_HASH_KNOWN_HOSTS", "no"),
            ("MONKEYSPHERE_STRICT_MODES", "0"),
            ("MONKEYSPHERE_GNUPGHOME", "/tmp/gnupg"),
        ]
        .into_iter()
        .collect();
        let mut cfg = Config::default();
        cfg.apply_env_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.log_level, LogLevel::Debug);
        assert_eq!(cfg.keyring.check_keyserver, KeyserverPolicy::Never);
        assert!(!cfg.known_hosts.hash);
        assert!(!cfg.policy.strict_modes);
        assert_eq!(cfg.keyring.gnupghome.as_deref(), Some("/tmp/gnupg"));

        let mut cfg = Config::default();
        let err = cfg
            .apply_env_overrides(|k| (k == "MONKEYSPHERE_STRICT_MODES").then(|| "maybe".into()))
            .unwrap_err();
        assert!(err.to_string().contains("MONKEYSPHERE_STRICT_MODES"));
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.keyring.keyserver, "hkps://keys.openpgp.org");
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[keyring\n").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn path_expansion() {
        let home = Path::new("/home/alice");
        assert_eq!(
            expand_path("~/.ssh/known_hosts", home, "alice"),
            PathBuf::from("/home/alice/.ssh/known_hosts")
        );
        assert_eq!(
            expand_path("%h/.monkeysphere/authorized_user_ids", home, "alice"),
            PathBuf::from("/home/alice/.monkeysphere/authorized_user_ids")
        );
        assert_eq!(
            expand_path("/var/lib/monkeysphere/authorized_keys/%u", home, "alice"),
            PathBuf::from("/var/lib/monkeysphere/authorized_keys/alice")
        );
        assert_eq!(expand_path("/srv/100%%", home, "alice"), PathBuf::from("/srv/100%"));
        assert_eq!(expand_path("/srv/~x", home, "alice"), PathBuf::from("/srv/~x"));
    }

    #[test]
    fn roundtrip_serialize() {
        let cfg = Config::default();
        let serialized = toml::to_string(&cfg).unwrap();
        let back: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(back.keyring.keyserver, cfg.keyring.keyserver);
        assert_eq!(back.policy.min_validity, cfg.policy.min_validity);
    }
}
