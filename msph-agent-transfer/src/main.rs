use anyhow::{Context, Result, bail};
use tracing_subscriber::EnvFilter;

use msph_agent_transfer::{Constraints, DEFAULT_GPGCONF, Keygrip, TransferRequest, bootstrap};

#[derive(Debug, Default, PartialEq, Eq)]
struct Args {
    lifetime: Option<u32>,
    confirm: bool,
    help: bool,
    keygrip: Option<String>,
    comment: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    // Before any key material exists in this process.
    bootstrap::secure_bootstrap();

    let argv: Vec<String> = std::env::args().skip(1).collect();
    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("agent-transfer: {e}");
            eprint!("{}", usage());
            std::process::exit(1);
        }
    };
    if args.help {
        print!("{}", usage());
        return;
    }
    if let Err(e) = run(args).await {
        eprintln!("agent-transfer: {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let Some(keygrip) = args.keygrip else {
        bail!("missing KEYGRIP");
    };
    let keygrip: Keygrip = keygrip.parse()?;
    let request = TransferRequest {
        keygrip,
        comment: args.comment,
        constraints: Constraints {
            lifetime: args.lifetime,
            confirm: args.confirm,
        },
    };
    msph_agent_transfer::transfer(&request, DEFAULT_GPGCONF, |k| std::env::var(k).ok())
        .await
        .with_context(|| format!("transferring key {}", request.keygrip))
}

/// Flags may be bundled (`-ct 60`); `t` consumes the next argument.
fn parse_args(argv: &[String]) -> Result<Args> {
    let mut args = Args::default();
    let mut i = 0;
    while i < argv.len() {
        let arg = &argv[i];
        if let Some(flags) = arg.strip_prefix('-') {
            let mut wants_seconds = false;
            for flag in flags.chars() {
                match flag {
                    'c' => args.confirm = true,
                    't' => wants_seconds = true,
                    'h' => args.help = true,
                    other => bail!("flag not recognized: {other}"),
                }
            }
            if wants_seconds {
                i += 1;
                let Some(value) = argv.get(i) else {
                    bail!("lifetime (-t) needs an argument (number of seconds)");
                };
                match value.parse::<u32>() {
                    Ok(seconds) if seconds > 0 => args.lifetime = Some(seconds),
                    _ => bail!("lifetime (seconds) must be > 0"),
                }
            }
        } else if args.keygrip.is_none() {
            arg.parse::<Keygrip>()?;
            args.keygrip = Some(arg.clone());
        } else if args.comment.is_none() {
            args.comment = Some(arg.clone());
        } else {
            bail!("unrecognized argument {arg}");
        }
        i += 1;
    }
    Ok(args)
}

fn usage() -> &'static str {
    "\
Usage: agent-transfer [options] KEYGRIP [COMMENT]

Extracts a secret key from the GnuPG agent (by keygrip),
and sends it to the running SSH agent.

  KEYGRIP should be a GnuPG keygrip
    (e.g. try \"gpg --with-keygrip --list-secret-keys\")
  COMMENT (optional) can be any string
    (must not start with a \"-\")

Options:
 -t SECONDS  lifetime (in seconds) for the key to live in ssh-agent
 -c          require confirmation when using the key in ssh-agent
 -h          print this help
"
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRIP: &str = "0123456789ABCDEF0123456789ABCDEF01234567";

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn bundled_flags_and_positionals() {
        let args = parse_args(&argv(&["-ct", "60", GRIP, "laptop key"])).unwrap();
        assert_eq!(
            args,
            Args {
                lifetime: Some(60),
                confirm: true,
                help: false,
                keygrip: Some(GRIP.into()),
                comment: Some("laptop key".into()),
            }
        );
        assert!(parse_args(&argv(&["-h"])).unwrap().help);
    }

    #[test]
    fn invalid_arguments() {
        for bad in [
            &["-x"][..],
            &["-t"],
            &["-t", "0", GRIP],
            &["-t", "soon", GRIP],
            &["abc"],
            &[GRIP, "one", "two"],
        ] {
            assert!(parse_args(&argv(bad)).is_err(), "{bad:?}");
        }
    }
}
