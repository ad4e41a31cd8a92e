use std::path::PathBuf;

use anyhow::{Context as _, Result, bail};
use tokio::io::AsyncReadExt;
use tracing::debug;

use msph_core::config::{self, Config};
use msph_core::host::HostKeys;
use msph_core::keyring::GpgKeyring;
use msph_core::{Context, ServiceId, logging};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    let (config_flag, args) = split_config_flag(std::env::args().skip(1).collect());
    let cmd = args.first().map(String::as_str).unwrap_or("help");
    let rest = args.get(1..).unwrap_or_default();

    let result = match cmd {
        "import-key" | "i" => cmd_import_key(config_flag, rest).await,
        "show-keys" | "show-key" | "s" => cmd_show_keys(config_flag, rest).await,
        "publish-keys" | "publish-key" | "p" => cmd_publish_keys(config_flag, rest).await,
        "set-expire" | "e" => cmd_set_expire(config_flag, rest).await,
        "add-servicename" | "n+" => cmd_add_servicename(config_flag, rest).await,
        "revoke-servicename" | "n-" => cmd_revoke_servicename(config_flag, rest).await,
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
    if let Err(e) = result {
        eprintln!("monkeysphere-host: {e:#}");
        std::process::exit(1);
    }
}

fn print_help() {
    println!(
        "\
monkeysphere-host - administer this host's OpenPGP key

USAGE:
    monkeysphere-host [--config <path>] <command> [args...]

COMMANDS:
    import-key (i) FILE SERVICENAME     Import a PEM RSA host key (FILE '-' = stdin),
                                        e.g. /etc/ssh/ssh_host_rsa_key ssh://host.example.org
    show-keys (s) [KEYID]               Show host keys with their SSH forms
    publish-keys (p) [KEYID]            Send the host key to the keyserver
    set-expire (e) EXPIRE [KEYID]       Set expiration: 0/never, 2y, 90d or a date
    add-servicename (n+) NAME [KEYID]   Add a service name user ID
    revoke-servicename (n-) NAME [KEYID]
                                        Revoke a service name user ID
    help                                Show this help

KEYID selects among several host keys by fingerprint suffix; with a single
host key it may be omitted. NAME is host, host:port or scheme://host[:port].

The host keyring lives in host.gnupghome (default /var/lib/monkeysphere/host)."
    );
}

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

struct HostSession {
    keyring: GpgKeyring,
    ctx: Context,
}

impl HostSession {
    fn open(config_flag: Option<PathBuf>) -> Result<Self> {
        let path = config::resolve_path(config_flag, true);
        let mut config =
            Config::load(&path).with_context(|| format!("loading {}", path.display()))?;
        config.apply_env_overrides(|k| std::env::var(k).ok())?;
        let ctx = Context::from_config(&config);
        logging::init(ctx.log_level);
        debug!(config = %path.display(), gnupghome = %config.host.gnupghome, "configuration loaded");
        Ok(Self {
            keyring: host_keyring(&config),
            ctx,
        })
    }

    fn keys(&self) -> HostKeys<'_, GpgKeyring> {
        HostKeys::new(&self.keyring, self.ctx.keyserver_timeout)
    }
}

fn host_keyring(config: &Config) -> GpgKeyring {
    let mut keyring = config.keyring.clone();
    keyring.gnupghome = Some(config.host.gnupghome.clone());
    GpgKeyring::from_config(&keyring)
}

/// `host`, `host:port` (taken as `ssh://`), or any `scheme://host[:port]`.
fn parse_service_name(name: &str) -> Result<ServiceId> {
    let service = if name.contains("://") {
        ServiceId::parse(name)
    } else {
        ServiceId::parse(&format!("ssh://{name}"))
    };
    service.with_context(|| format!("invalid service name '{name}'"))
}

/// At most one trailing KEYID after `required` positional arguments.
fn split_key_id<'a>(args: &'a [String], required: usize, usage: &str) -> Result<(&'a [String], Option<&'a str>)> {
    match args.len().checked_sub(required) {
        Some(0) => Ok((args, None)),
        Some(1) => Ok((&args[..required], Some(args[required].as_str()))),
        _ => bail!("usage: monkeysphere-host {usage}"),
    }
}

async fn read_input(path: &str) -> Result<String> {
    if path == "-" {
        let mut text = String::new();
        tokio::io::stdin()
            .read_to_string(&mut text)
            .await
            .context("reading standard input")?;
        return Ok(text);
    }
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {path}"))
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_import_key(config_flag: Option<PathBuf>, args: &[String]) -> Result<()> {
    let [file, name] = args else {
        bail!("usage: monkeysphere-host import-key FILE SERVICENAME");
    };
    let service = parse_service_name(name)?;
    let pem = read_input(file).await?;
    let session = HostSession::open(config_flag)?;
    let fpr = session
        .keys()
        .import_pem(&pem, &service, None)
        .await
        .with_context(|| format!("importing {file}"))?;
    println!("imported host key {fpr} as {service}");
    Ok(())
}

async fn cmd_show_keys(config_flag: Option<PathBuf>, args: &[String]) -> Result<()> {
    let (_, key_id) = split_key_id(args, 0, "show-keys [KEYID]")?;
    let session = HostSession::open(config_flag)?;
    let reports = session.keys().show(key_id).await?;
    if reports.is_empty() {
        bail!("no host keys found");
    }
    for (i, report) in reports.iter().enumerate() {
        if i > 0 {
            println!();
        }
        print!("{report}");
    }
    Ok(())
}

async fn cmd_publish_keys(config_flag: Option<PathBuf>, args: &[String]) -> Result<()> {
    let (_, key_id) = split_key_id(args, 0, "publish-keys [KEYID]")?;
    let session = HostSession::open(config_flag)?;
    let fpr = session.keys().publish(key_id).await?;
    println!("published {fpr}");
    Ok(())
}

async fn cmd_set_expire(config_flag: Option<PathBuf>, args: &[String]) -> Result<()> {
    let (positional, key_id) = split_key_id(args, 1, "set-expire EXPIRE [KEYID]")?;
    let expire = positional[0].as_str();
    let session = HostSession::open(config_flag)?;
    let fpr = session.keys().set_expire(key_id, expire).await?;
    println!("expiration of {fpr} set to {expire}");
    Ok(())
}

async fn cmd_add_servicename(config_flag: Option<PathBuf>, args: &[String]) -> Result<()> {
    let (positional, key_id) = split_key_id(args, 1, "add-servicename NAME [KEYID]")?;
    let service = parse_service_name(&positional[0])?;
    let session = HostSession::open(config_flag)?;
    let fpr = session.keys().add_service_name(key_id, &service).await?;
    println!("added {service} to {fpr}");
    Ok(())
}

async fn cmd_revoke_servicename(config_flag: Option<PathBuf>, args: &[String]) -> Result<()> {
    let (positional, key_id) = split_key_id(args, 1, "revoke-servicename NAME [KEYID]")?;
    let service = parse_service_name(&positional[0])?;
    let session = HostSession::open(config_flag)?;
    let fpr = session.keys().revoke_service_name(key_id, &service).await?;
    println!("revoked {service} on {fpr}");
    Ok(())
}
