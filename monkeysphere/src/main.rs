use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, bail};
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use msph_agent_transfer::{Constraints, DEFAULT_GPGCONF, Keygrip, TransferRequest};
use msph_core::config::{self, Config, expand_path};
use msph_core::files::UpdateSummary;
use msph_core::files::authorized_keys::{self, AuthorizedKeys};
use msph_core::files::known_hosts;
use msph_core::guard::{self, UserInfo};
use msph_core::keyring::{GpgKeyring, SecretKeyring};
use msph_core::{Capability, Certificate, Context, ServiceId, Validity, logging};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Reset SIGPIPE so `keys-for-userid | head` exits quietly.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    let (config_flag, args) = split_config_flag(std::env::args().skip(1).collect());
    let cmd = args.first().map(String::as_str).unwrap_or("help");
    let rest = args.get(1..).unwrap_or_default();

    let result = match cmd {
        "update-known_hosts" | "update-known-hosts" | "k" => {
            cmd_update_known_hosts(config_flag, rest).await
        }
        "update-authorized_keys" | "update-authorized-keys" | "a" => {
            cmd_update_authorized_keys(config_flag, rest).await
        }
        "keys-for-userid" | "u" => cmd_keys_for_userid(config_flag, rest).await,
        "ssh-proxycommand" => cmd_ssh_proxycommand(config_flag, rest).await,
        "subkey-to-ssh-agent" | "s" => cmd_subkey_to_ssh_agent(config_flag, rest).await,
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        other => {
            eprintln!("unknown command: {other}");
            print_help();
            std::process::exit(1);
        }
    };

    // Exit explicitly: a pending stdin read would otherwise hold the runtime.
    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("monkeysphere: {e:#}");
            std::process::exit(1);
        }
    }
}

const HELP: &str = "\
monkeysphere - OpenPGP web of trust for OpenSSH

USAGE:
    monkeysphere [--config <path>] <command> [args...]

COMMANDS:
    update-known_hosts (k) [HOST]...    Refresh known_hosts entries for HOSTs
                                        (no args = every host already listed)
    update-authorized_keys (a)          Regenerate authorized_keys from the
                                        authorized_user_ids file
    keys-for-userid (u) USERID          Print authorized_keys lines for USERID
    ssh-proxycommand HOST [PORT]        Check HOST's key, then connect stdin/stdout
                                        to HOST:PORT (for ssh's ProxyCommand)
    subkey-to-ssh-agent (s) [-t SECONDS] [-c]
                                        Load authentication subkeys into ssh-agent
    help                                Show this help

HOSTS:
    host, host:port, [host]:port or ssh://host:port

ENVIRONMENT:
    MONKEYSPHERE_CONFIG                 Config file (default:
                                        $XDG_CONFIG_HOME/monkeysphere/config.toml)
    MONKEYSPHERE_LOG_LEVEL              silent, error, info, verbose or debug
    MONKEYSPHERE_CHECK_KEYSERVER        always, never or auto
    MONKEYSPHERE_KNOWN_HOSTS, MONKEYSPHERE_AUTHORIZED_KEYS, MONKEYSPHERE_GNUPGHOME

EXAMPLES:
    monkeysphere update-known_hosts server.example.org
    monkeysphere keys-for-userid 'Alice <alice@example.org>'
    ssh -o ProxyCommand='monkeysphere ssh-proxycommand %h %p' server.example.org";

fn print_help() {
    println!("{HELP}");
}

// ---------------------------------------------------------------------------
// Session setup
// ---------------------------------------------------------------------------

/// Pull `--config <path>`, `-c <path>` or `--config=<path>` out of `args`.
fn split_config_flag(args: Vec<String>) -> (Option<PathBuf>, Vec<String>) {
    let mut config = None;
    let mut rest = Vec::with_capacity(args.len());
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        if config.is_none() && rest.is_empty() {
            if arg == "--config" || arg == "-c" {
                config = iter.next().map(PathBuf::from);
                continue;
            }
            if let Some(p) = arg.strip_prefix("--config=") {
                config = Some(PathBuf::from(p));
                continue;
            }
        }
        rest.push(arg);
    }
    (config, rest)
}

struct Session {
    config: Config,
    ctx: Context,
    user: UserInfo,
    keyring: GpgKeyring,
}

impl Session {
    fn open(config_flag: Option<PathBuf>) -> Result<Self> {
        let path = config::resolve_path(config_flag, false);
        let mut config =
            Config::load(&path).with_context(|| format!("loading {}", path.display()))?;
        config.apply_env_overrides(|k| std::env::var(k).ok())?;
        let ctx = Context::from_config(&config);
        logging::init(ctx.log_level);
        debug!(config = %path.display(), "configuration loaded");

        let user = guard::current_user().context("looking up the current user")?;
        let keyring = GpgKeyring::from_config(&config.keyring);
        Ok(Self {
            config,
            ctx,
            user,
            keyring,
        })
    }

    fn path(&self, template: &str) -> PathBuf {
        expand_path(template, &self.user.home, &self.user.name)
    }
}

/// Create the directory holding `path` (usually `~/.ssh`) if missing.
fn ensure_parent(path: &Path) -> Result<()> {
    let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) else {
        return Ok(());
    };
    if !dir.exists() {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
            .with_context(|| format!("creating {}", dir.display()))?;
        info!(path = %dir.display(), "created directory");
    }
    Ok(())
}

fn report(summary: &UpdateSummary) -> Result<()> {
    for id in &summary.unknown {
        debug!(identity = %id, "no certificate in keyring");
    }
    if summary.is_success() {
        return Ok(());
    }
    for (target, error) in &summary.failed {
        eprintln!("monkeysphere: {target}: {error}");
    }
    bail!(
        "{} of {} identities failed for {}",
        summary.failed.len(),
        summary.processed + summary.failed.len(),
        summary.target.display()
    )
}

/// `host`, `host:port`, `[host]:port` or a full `ssh://` service name.
fn parse_host(arg: &str) -> Result<ServiceId> {
    if arg.contains("://") {
        return Ok(ServiceId::parse(arg)?);
    }
    if arg.starts_with('[') {
        return ServiceId::from_known_hosts_name(arg)
            .with_context(|| format!("invalid host '{arg}'"));
    }
    Ok(ServiceId::parse(&format!("ssh://{arg}"))?)
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_update_known_hosts(config_flag: Option<PathBuf>, args: &[String]) -> Result<()> {
    let hosts = args
        .iter()
        .map(|a| parse_host(a))
        .collect::<Result<Vec<_>>>()?;
    let session = Session::open(config_flag)?;
    let path = session.path(&session.config.known_hosts.path);
    ensure_parent(&path)?;

    let summary = known_hosts::update_known_hosts(
        &session.keyring,
        &session.ctx,
        &path,
        &hosts,
        session.config.known_hosts.hash,
    )
    .await?;
    report(&summary)
}

async fn cmd_update_authorized_keys(config_flag: Option<PathBuf>, args: &[String]) -> Result<()> {
    if !args.is_empty() {
        bail!("update-authorized_keys takes no arguments");
    }
    let session = Session::open(config_flag)?;
    let ids_path = session.path(&session.config.authorized_keys.user_ids);
    let user_ids = if ids_path.exists() {
        guard::check_if_strict(session.ctx.strict_modes, &session.user, &ids_path)?;
        authorized_keys::read_user_ids(&ids_path)?
    } else {
        info!(path = %ids_path.display(), "no authorized user IDs; removing managed keys only");
        Vec::new()
    };

    let path = session.path(&session.config.authorized_keys.path);
    ensure_parent(&path)?;
    let format = AuthorizedKeys {
        options: session.config.authorized_keys.options.clone(),
    };
    let summary = authorized_keys::update_authorized_keys(
        &session.keyring,
        &session.ctx,
        &path,
        &user_ids,
        &format,
    )
    .await?;
    report(&summary)
}

async fn cmd_keys_for_userid(config_flag: Option<PathBuf>, args: &[String]) -> Result<()> {
    let [user_id] = args else {
        bail!("usage: monkeysphere keys-for-userid USERID");
    };
    let session = Session::open(config_flag)?;
    let format = AuthorizedKeys {
        options: session.config.authorized_keys.options.clone(),
    };
    let lines =
        authorized_keys::keys_for_user_id(&session.keyring, &session.ctx, user_id, &format).await?;
    for line in lines {
        println!("{line}");
    }
    Ok(())
}

async fn cmd_ssh_proxycommand(config_flag: Option<PathBuf>, args: &[String]) -> Result<()> {
    let (host, port) = match args {
        [host] => (host, None),
        [host, port] => {
            let port: u16 = port
                .parse()
                .with_context(|| format!("invalid port '{port}'"))?;
            (host, Some(port))
        }
        _ => bail!("usage: monkeysphere ssh-proxycommand HOST [PORT]"),
    };
    let service = ServiceId::ssh(host, port)?;
    let session = Session::open(config_flag)?;
    let path = session.path(&session.config.known_hosts.path);

    // A failed check must not keep ssh from connecting; ssh does its own
    // verification against whatever known_hosts holds.
    let updated = match ensure_parent(&path) {
        Ok(()) => known_hosts::check_host(
            &session.keyring,
            &session.ctx,
            &path,
            &service,
            session.config.known_hosts.hash,
        )
        .await
        .map_err(anyhow::Error::from),
        Err(e) => Err(e),
    };
    match updated {
        Ok(summary) if summary.unknown.is_empty() && summary.is_success() => {
            debug!(host = %service, accepted = summary.accepted, "host checked");
        }
        Ok(summary) => {
            for (_, error) in &summary.failed {
                warn!(host = %service, error = %error, "host key check failed");
            }
            if !summary.unknown.is_empty() {
                info!(host = %service, "host has no OpenPGP certificate");
            }
        }
        Err(e) => {
            let error = format!("{e:#}");
            warn!(host = %service, error = %error, "known_hosts not updated");
        }
    }

    proxy(host, port.unwrap_or(22)).await
}

/// Copy stdin to the server and the server to stdout until the server
/// closes its side.
async fn proxy(host: &str, port: u16) -> Result<()> {
    let stream = TcpStream::connect((host, port))
        .await
        .with_context(|| format!("connecting to {host}:{port}"))?;
    debug!(host, port, "connected");
    let (mut from_server, mut to_server) = stream.into_split();

    let mut downstream = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        tokio::io::copy(&mut from_server, &mut stdout).await?;
        stdout.flush().await
    });
    let upstream = async move {
        tokio::io::copy(&mut tokio::io::stdin(), &mut to_server).await?;
        to_server.shutdown().await
    };

    tokio::select! {
        done = &mut downstream => done??,
        sent = upstream => {
            sent?;
            downstream.await??;
        }
    }
    Ok(())
}

async fn cmd_subkey_to_ssh_agent(config_flag: Option<PathBuf>, args: &[String]) -> Result<()> {
    let constraints = parse_agent_flags(args)?;
    let session = Session::open(config_flag)?;
    let certs = session
        .keyring
        .list_secret_keys()
        .await
        .context("listing secret keys")?;
    let keys = authentication_subkeys(&certs, session.ctx.now);
    if keys.is_empty() {
        bail!("no usable authentication subkeys in the secret keyring");
    }

    let mut failed = 0;
    for key in &keys {
        let request = TransferRequest {
            keygrip: key.keygrip.clone(),
            comment: key.comment.clone(),
            constraints,
        };
        match msph_agent_transfer::transfer(&request, DEFAULT_GPGCONF, |k| std::env::var(k).ok())
            .await
        {
            Ok(()) => println!("added {} ({})", key.key_id, request.comment()),
            Err(e) => {
                eprintln!("monkeysphere: subkey {}: {e}", key.key_id);
                failed += 1;
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} subkeys could not be added", keys.len());
    }
    Ok(())
}

/// `-t SECONDS` and `-c`, as `agent-transfer` takes them.
fn parse_agent_flags(args: &[String]) -> Result<Constraints> {
    let mut constraints = Constraints::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-c" => constraints.confirm = true,
            "-t" => {
                let Some(value) = iter.next() else {
                    bail!("-t needs a number of seconds");
                };
                match value.parse::<u32>() {
                    Ok(seconds) if seconds > 0 => constraints.lifetime = Some(seconds),
                    _ => bail!("lifetime (seconds) must be > 0"),
                }
            }
            other => bail!("unrecognized argument {other}"),
        }
    }
    Ok(constraints)
}

#[derive(Debug)]
struct AgentKey {
    key_id: String,
    keygrip: Keygrip,
    comment: Option<String>,
}

/// Unexpired, unrevoked subkeys with the authentication capability and a
/// keygrip gpg-agent can export them by.
fn authentication_subkeys(certs: &[Certificate], now: DateTime<Utc>) -> Vec<AgentKey> {
    let mut keys = Vec::new();
    for cert in certs.iter().filter(|c| c.secret) {
        let comment = cert
            .user_ids
            .iter()
            .find(|u| u.validity != Validity::Revoked)
            .map(|u| u.text.clone());
        for subkey in &cert.subkeys {
            if !subkey.can(Capability::Authenticate)
                || subkey.disabled()
                || subkey.expired_at(now)
                || matches!(subkey.validity, Validity::Revoked | Validity::Expired)
            {
                continue;
            }
            let Some(keygrip) = subkey.keygrip.as_deref().and_then(|g| g.parse::<Keygrip>().ok()) else {
                warn!(key_id = %subkey.key_id, "authentication subkey without keygrip, skipping");
                continue;
            };
            keys.push(AgentKey {
                key_id: subkey.key_id.clone(),
                keygrip,
                comment: comment.clone(),
            });
        }
    }
    keys
}
