use std::path::PathBuf;

use anyhow::{Context as _, Result, bail};
use tracing::{debug, info, warn};

use msph_core::config::{self, Config};
use msph_core::files::authorized_keys::{self, AuthorizedKeys};
use msph_core::guard::{self, UserInfo};
use msph_core::keyring::{GpgKeyring, Keyring};
use msph_core::{Context, logging};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    let (config_flag, args) = split_config_flag(std::env::args().skip(1).collect());
    let cmd = args.first().map(String::as_str).unwrap_or("help");
    let rest = args.get(1..).unwrap_or_default();

    let result = match cmd {
        "update-users" | "u" => cmd_update_users(config_flag, rest).await,
        "keys-for-user" | "k" => cmd_keys_for_user(config_flag, rest).await,
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
        eprintln!("monkeysphere-authentication: {e:#}");
        std::process::exit(1);
    }
}

fn print_help() {
    println!(
        "\
monkeysphere-authentication - system authorized_keys from the OpenPGP web of trust

USAGE:
    monkeysphere-authentication [--config <path>] <command> [args...]

COMMANDS:
    update-users (u) [USER]...          Regenerate the authorized_keys file sshd reads
                                        for each USER (no args = every passwd entry)
    keys-for-user (k) USER              Print the authorized_keys USER would get,
                                        without writing anything
    help                                Show this help

FILES:
    /etc/monkeysphere/config.toml       Default configuration
    <sysdata_dir>/authorized_keys/USER  Generated files; point sshd at them with
                                        AuthorizedKeysFile /var/lib/monkeysphere/authorized_keys/%u

Each user lists trusted OpenPGP user IDs in authorized_user_ids (default
%h/.monkeysphere/authorized_user_ids). Their raw authorized_keys file is
appended unless raw_authorized_keys = \"none\"."
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

fn load_config(config_flag: Option<PathBuf>) -> Result<(Config, Context)> {
    let path = config::resolve_path(config_flag, true);
    let mut config = Config::load(&path).with_context(|| format!("loading {}", path.display()))?;
    config.apply_env_overrides(|k| std::env::var(k).ok())?;
    let ctx = Context::from_config(&config);
    logging::init(ctx.log_level);
    debug!(config = %path.display(), "configuration loaded");
    Ok((config, ctx))
}

/// The keyring validating users' certificates: the authentication one
/// when configured, else the general one.
fn keyring(config: &Config) -> GpgKeyring {
    let mut keyring = config.keyring.clone();
    if let Some(home) = &config.authentication.gnupghome {
        keyring.gnupghome = Some(home.clone());
    }
    GpgKeyring::from_config(&keyring)
}

fn line_format(config: &Config) -> AuthorizedKeys {
    AuthorizedKeys {
        options: config.authorized_keys.options.clone(),
    }
}

/// Named users, or every passwd entry when none are named.
fn select_users(names: &[String]) -> Result<Vec<UserInfo>> {
    if names.is_empty() {
        return Ok(guard::all_users());
    }
    names
        .iter()
        .map(|name| guard::lookup_user(name).map_err(anyhow::Error::from))
        .collect()
}

async fn cmd_update_users(config_flag: Option<PathBuf>, args: &[String]) -> Result<()> {
    let (config, ctx) = load_config(config_flag)?;
    let users = select_users(args)?;
    let keyring = keyring(&config);
    let format = line_format(&config);

    let mut failed = Vec::new();
    for user in &users {
        match authorized_keys::update_user(&keyring, &ctx, user, &config.authentication, &format)
            .await
        {
            Ok(summary) if summary.is_success() => {}
            Ok(summary) => {
                for (target, error) in &summary.failed {
                    warn!(user = %user.name, target = %target, error = %error, "partially processed");
                }
                failed.push(user.name.clone());
            }
            Err(e) => {
                eprintln!("monkeysphere-authentication: {}: {e}", user.name);
                failed.push(user.name.clone());
            }
        }
    }
    info!(users = users.len(), failed = failed.len(), "update-users finished");
    if !failed.is_empty() {
        bail!("{} of {} users failed: {}", failed.len(), users.len(), failed.join(", "));
    }
    Ok(())
}

async fn cmd_keys_for_user(config_flag: Option<PathBuf>, args: &[String]) -> Result<()> {
    let [name] = args else {
        bail!("usage: monkeysphere-authentication keys-for-user USER");
    };
    let (config, ctx) = load_config(config_flag)?;
    let user = guard::lookup_user(name)?;
    let rendered = render_user(&keyring(&config), &ctx, &user, &config).await?;
    print!("{rendered}");
    Ok(())
}

async fn render_user<K: Keyring + ?Sized>(
    keyring: &K,
    ctx: &Context,
    user: &UserInfo,
    config: &Config,
) -> Result<String> {
    let (file, summary) = authorized_keys::generate_for_user(
        keyring,
        ctx,
        user,
        &config.authentication,
        &line_format(config),
    )
    .await
    .with_context(|| format!("generating keys for {}", user.name))?;
    for (target, error) in &summary.failed {
        warn!(user = %user.name, target = %target, error = %error, "skipped");
    }
    Ok(file.render())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    const RAW_KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAFA4Anj0bOb13TOFalmJto6TXYfa0zXUMwXr+rSVVMk laptop";

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn config_flag_before_command_only() {
        let (config, rest) = split_config_flag(argv(&["--config", "/etc/msph.toml", "u", "alice"]));
        assert_eq!(config, Some(PathBuf::from("/etc/msph.toml")));
        assert_eq!(rest, argv(&["u", "alice"]));
        let (config, rest) = split_config_flag(argv(&["k", "-c"]));
        assert!(config.is_none());
        assert_eq!(rest.len(), 2);
    }

    #[test]
    fn authentication_keyring_overrides_home() {
        let mut config = Config::default();
        assert!(format!("{:?}", keyring(&config)).contains("homedir: None"));
        config.keyring.gnupghome = Some("/home/u/.gnupg".into());
        assert!(format!("{:?}", keyring(&config)).contains("/home/u/.gnupg"));
        config.authentication.gnupghome = Some("/var/lib/monkeysphere/authentication".into());
        let shown = format!("{:?}", keyring(&config));
        assert!(shown.contains("/var/lib/monkeysphere/authentication"));
        assert!(!shown.contains("/home/u/.gnupg"));
    }

    #[test]
    fn named_users_are_looked_up() {
        let users = select_users(&argv(&["root"])).unwrap();
        assert_eq!(users[0].uid, 0);
        assert!(select_users(&argv(&["no-such-user-msph"])).is_err());
        assert!(select_users(&[]).unwrap().iter().any(|u| u.uid == 0));
    }

    #[tokio::test]
    async fn raw_keys_are_carried_over() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw_keys");
        fs::write(&raw, format!("{RAW_KEY}\n")).unwrap();

        let mut config = Config::default();
        config.policy.strict_modes = false;
        config.authentication.authorized_user_ids = dir.path().join("missing").display().to_string();
        config.authentication.raw_authorized_keys = raw.display().to_string();
        let ctx = Context::from_config(&config);
        let user = guard::current_user().unwrap();

        // `false` lists nothing; only the raw file contributes
        let rendered = render_user(&GpgKeyring::new("false"), &ctx, &user, &config)
            .await
            .unwrap();
        assert_eq!(rendered, format!("{RAW_KEY}\n"));

        config.authentication.raw_authorized_keys = "none".into();
        let rendered = render_user(&GpgKeyring::new("false"), &ctx, &user, &config)
            .await
            .unwrap();
        assert!(rendered.is_empty());
    }
}
