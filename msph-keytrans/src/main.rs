//! `pem2openpgp`, `openpgp2ssh` and `openpgp2pem` in one binary.
//!
//! Installed under each tool's name (symlinks), the name picks the tool;
//! otherwise the first argument does. All three are filters: key material
//! in on stdin, out on stdout.

use std::path::Path;

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;
use zeroize::Zeroizing;

use msph_core::{LogLevel, logging};
use msph_openpgp::{
    KeyUsage, PemImportOptions, SshPublicKey, extract_key_from_bytes, pem_to_openpgp,
    to_openssh_private, to_pkcs1_pem,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tool {
    Pem2OpenPgp,
    OpenPgp2Ssh,
    OpenPgp2Pem,
}

impl Tool {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "pem2openpgp" => Some(Self::Pem2OpenPgp),
            "openpgp2ssh" => Some(Self::OpenPgp2Ssh),
            "openpgp2pem" => Some(Self::OpenPgp2Pem),
            _ => None,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    let level = std::env::var("MONKEYSPHERE_LOG_LEVEL")
        .ok()
        .and_then(|v| v.parse::<LogLevel>().ok())
        .unwrap_or_default();
    logging::init(level);

    let argv: Vec<String> = std::env::args().collect();
    let (tool, args) = match select_tool(&argv) {
        Some(selected) => selected,
        None => {
            let cmd = argv.get(1).map(String::as_str).unwrap_or("help");
            if matches!(cmd, "help" | "--help" | "-h") {
                print_help();
                return;
            }
            eprintln!("unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    };
    if args.iter().any(|a| a == "-h" || a == "--help") {
        print_help();
        return;
    }

    if let Err(e) = run(tool, args).await {
        eprintln!("{}: {e:#}", tool_name(tool));
        std::process::exit(1);
    }
}

fn print_help() {
    println!(
        "\
msph-keytrans - translate keys between PEM, OpenPGP and OpenSSH

USAGE:
    msph-keytrans <tool> [args...]      or invoke through a link named after the tool

TOOLS:
    pem2openpgp USERID                  PEM RSA private key on stdin -> OpenPGP
                                        secret key certified for USERID on stdout
    openpgp2ssh [KEYID]                 OpenPGP key on stdin -> OpenSSH public key
                                        line, or OpenSSH private key for a secret key
    openpgp2pem [KEYID]                 OpenPGP RSA key on stdin -> PKCS#1 PEM

KEYID is a fingerprint suffix (key ID or full fingerprint); without it the
first key in the stream is used. Secret keys must not be passphrase-protected.

ENVIRONMENT (pem2openpgp):
    PEM2OPENPGP_TIMESTAMP               Key creation time, seconds since the epoch
    PEM2OPENPGP_USAGE_FLAGS             e.g. authenticate,sign (certify is implied)
    PEM2OPENPGP_EXPIRATION              Key lifetime in seconds"
    );
}

fn tool_name(tool: Tool) -> &'static str {
    match tool {
        Tool::Pem2OpenPgp => "pem2openpgp",
        Tool::OpenPgp2Ssh => "openpgp2ssh",
        Tool::OpenPgp2Pem => "openpgp2pem",
    }
}

/// The tool named by `argv[0]`, else by `argv[1]`, with its arguments.
fn select_tool(argv: &[String]) -> Option<(Tool, &[String])> {
    let invoked = argv
        .first()
        .and_then(|a| Path::new(a).file_name())
        .and_then(|n| n.to_str())
        .and_then(Tool::from_name);
    if let Some(tool) = invoked {
        return Some((tool, argv.get(1..).unwrap_or_default()));
    }
    let tool = Tool::from_name(argv.get(1)?)?;
    Some((tool, argv.get(2..).unwrap_or_default()))
}

async fn run(tool: Tool, args: &[String]) -> Result<()> {
    let mut input = Zeroizing::new(Vec::new());
    tokio::io::stdin()
        .read_to_end(&mut input)
        .await
        .context("reading standard input")?;
    debug!(tool = tool_name(tool), bytes = input.len(), "read input");

    let output = match tool {
        Tool::Pem2OpenPgp => {
            let [user_id] = args else {
                bail!("usage: pem2openpgp USERID");
            };
            let options = import_options(|k| std::env::var(k).ok())?;
            let pem = std::str::from_utf8(&input).context("PEM input is not text")?;
            pem2openpgp(user_id, pem, &options)?
        }
        Tool::OpenPgp2Ssh => openpgp2ssh(&input, key_filter(args, "openpgp2ssh")?)?,
        Tool::OpenPgp2Pem => openpgp2pem(&input, key_filter(args, "openpgp2pem")?)?,
    };

    let mut stdout = tokio::io::stdout();
    stdout.write_all(&output).await.context("writing output")?;
    stdout.flush().await.context("writing output")?;
    Ok(())
}

fn key_filter<'a>(args: &'a [String], tool: &str) -> Result<Option<&'a str>> {
    match args {
        [] => Ok(None),
        [filter] => Ok(Some(filter.as_str())),
        _ => bail!("usage: {tool} [KEYID]"),
    }
}

/// Options from the `PEM2OPENPGP_*` variables read through `env`.
fn import_options(env: impl Fn(&str) -> Option<String>) -> Result<PemImportOptions> {
    let mut options = PemImportOptions::default();
    if let Some(v) = env("PEM2OPENPGP_TIMESTAMP") {
        options.key_created = Some(
            v.trim()
                .parse()
                .with_context(|| format!("PEM2OPENPGP_TIMESTAMP: invalid timestamp '{v}'"))?,
        );
    }
    if let Some(v) = env("PEM2OPENPGP_USAGE_FLAGS") {
        options.usage = KeyUsage::from_names(&v).context("PEM2OPENPGP_USAGE_FLAGS")?;
    }
    if let Some(v) = env("PEM2OPENPGP_EXPIRATION") {
        let secs: u32 = v
            .trim()
            .parse()
            .with_context(|| format!("PEM2OPENPGP_EXPIRATION: invalid lifetime '{v}'"))?;
        options.expires_after = (secs > 0).then_some(secs);
    }
    Ok(options)
}

fn pem2openpgp(user_id: &str, pem: &str, options: &PemImportOptions) -> Result<Zeroizing<Vec<u8>>> {
    Ok(pem_to_openpgp(user_id, pem, options)?)
}

fn openpgp2ssh(input: &[u8], filter: Option<&str>) -> Result<Zeroizing<Vec<u8>>> {
    let material = extract_key_from_bytes(input, filter)?;
    if material.is_secret() {
        let text = to_openssh_private(&material, "")?;
        return Ok(Zeroizing::new(text.as_bytes().to_vec()));
    }
    let line = format!("{}\n", SshPublicKey::from_material(&material)?);
    Ok(Zeroizing::new(line.into_bytes()))
}

fn openpgp2pem(input: &[u8], filter: Option<&str>) -> Result<Zeroizing<Vec<u8>>> {
    let material = extract_key_from_bytes(input, filter)?;
    let pem = to_pkcs1_pem(&material)?;
    Ok(Zeroizing::new(pem.as_bytes().to_vec()))
}
