//! Talking to the local gpg-agent.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::Keygrip;
use crate::assuan::{AssuanClient, percent_unescape};
use crate::error::{AgentTransferError, Result};
use crate::keywrap::{self, KEK_LEN};
use crate::secret::SecretKey;
use crate::sexp::Sexp;

/// Environment forwarded to the agent so its pinentry shows up in the
/// right place: `(variable, agent option)`. `None` means `putenv`.
const FORWARDED_ENV: &[(&str, Option<&str>)] = &[
    ("GPG_TTY", Some("ttyname")),
    ("TERM", Some("ttytype")),
    ("DISPLAY", Some("display")),
    ("XAUTHORITY", Some("xauthority")),
    ("GTK_IM_MODULE", None),
    ("DBUS_SESSION_BUS_ADDRESS", None),
    ("LANG", Some("lc-ctype")),
    ("LANG", Some("lc-messages")),
];

async fn gpgconf(program: &str, args: &[&str]) -> Result<Vec<u8>> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::inherit())
        .output()
        .await
        .map_err(|e| AgentTransferError::Gpgconf {
            args: args.join(" "),
            reason: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(AgentTransferError::Gpgconf {
            args: args.join(" "),
            reason: format!("exited with {}", output.status),
        });
    }
    Ok(output.stdout)
}

/// Path of the agent's socket as reported by `gpgconf --list-dirs`.
pub async fn socket_path(program: &str) -> Result<PathBuf> {
    let out = gpgconf(program, &["--list-dirs", "agent-socket"]).await?;
    Ok(parse_socket_path(&out))
}

fn parse_socket_path(out: &[u8]) -> PathBuf {
    use std::os::unix::ffi::OsStringExt;

    let end = out
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    PathBuf::from(std::ffi::OsString::from_vec(percent_unescape(&out[..end])))
}

/// Connect to gpg-agent, starting it through gpgconf if nothing listens.
pub async fn connect(program: &str) -> Result<AgentSession<UnixStream>> {
    let socket = socket_path(program).await?;
    let stream = match UnixStream::connect(&socket).await {
        Ok(stream) => stream,
        Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused) => {
            info!(socket = %socket.display(), "gpg-agent not running, launching it");
            gpgconf(program, &["--launch", "gpg-agent"]).await?;
            UnixStream::connect(&socket)
                .await
                .map_err(AgentTransferError::io(format!("connect to {}", socket.display())))?
        }
        Err(e) => return Err(AgentTransferError::io(format!("connect to {}", socket.display()))(e)),
    };
    debug!(socket = %socket.display(), "connected to gpg-agent");
    AgentSession::new(stream).await
}

/// The terminal on standard input, if any.
pub fn stdin_tty() -> Option<String> {
    let mut buf = [0 as libc::c_char; 256];
    // SAFETY: the buffer is valid for its full length and ttyname_r
    // NUL-terminates on success.
    let rc = unsafe { libc::ttyname_r(0, buf.as_mut_ptr(), buf.len()) };
    if rc != 0 {
        return None;
    }
    let name = unsafe { std::ffi::CStr::from_ptr(buf.as_ptr()) };
    Some(name.to_string_lossy().into_owned())
}

/// The `SETKEYDESC` prompt gpg-agent shows while asking for the passphrase.
pub fn key_description(keygrip: &Keygrip, comment: Option<&str>) -> String {
    match comment {
        Some(comment) => format!(
            "Sending+key+for+'{}'+from+gpg-agent+to+ssh-agent...%0a(keygrip:+{keygrip})",
            crate::assuan::percent_plus_escape(comment)
        ),
        None => format!("Sending+key+from+gpg-agent+to+ssh-agent...%0a(keygrip:+{keygrip})"),
    }
}

pub struct AgentSession<S> {
    client: AssuanClient<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> AgentSession<S> {
    pub async fn new(stream: S) -> Result<Self> {
        Ok(Self {
            client: AssuanClient::handshake(stream).await?,
        })
    }

    /// Pass display and locale settings on; unset variables are skipped and
    /// refused options only warn. `tty` overrides `GPG_TTY`.
    pub async fn forward_environment(
        &mut self,
        env: impl Fn(&str) -> Option<String>,
        tty: Option<String>,
    ) {
        for &(var, option) in FORWARDED_ENV {
            let value = match (var, &tty) {
                ("GPG_TTY", Some(tty)) => Some(tty.clone()),
                _ => env(var),
            };
            let Some(value) = value else {
                continue;
            };
            let command = match option {
                Some(option) => format!("OPTION {option}={value}"),
                None => format!("OPTION putenv={var}={value}"),
            };
            if let Err(e) = self.client.transact(&command).await {
                warn!(option = option.unwrap_or(var), error = %e, "gpg-agent refused option");
            }
        }
    }

    /// Export, unwrap and parse the secret key with `keygrip`.
    ///
    /// gpg-agent asks for the passphrase itself, showing `description`.
    pub async fn export_secret_key(&mut self, keygrip: &Keygrip, description: &str) -> Result<SecretKey> {
        let kek = self.client.transact("KEYWRAP_KEY --export").await?;
        if kek.len() != KEK_LEN {
            return Err(AgentTransferError::KeyLength(kek.len()));
        }
        self.client.transact(&format!("SETKEYDESC {description}")).await?;
        let wrapped = self.client.transact(&format!("EXPORT_KEY {keygrip}")).await?;
        debug!(keygrip = %keygrip, bytes = wrapped.len(), "exported wrapped key");

        let plain = keywrap::unwrap(&kek, &wrapped)?;
        let sexp = Sexp::parse(&plain)?;
        SecretKey::from_sexp(&sexp)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::assuan::tests::scripted_server;
    use crate::keywrap::wrap;
    use crate::secret::tests::toy_rsa_sexp;

    const KEK: [u8; 16] = *b"0123456789abcdef";

    fn grip() -> Keygrip {
        "0123456789ABCDEF0123456789ABCDEF01234567".parse().unwrap()
    }

    /// Escape bytes the way gpg-agent does on `D` lines.
    fn d_line(data: &[u8]) -> Vec<u8> {
        let mut out = b"D ".to_vec();
        for &b in data {
            if matches!(b, b'%' | b'\n' | b'\r') {
                out.extend_from_slice(format!("%{b:02X}").as_bytes());
            } else {
                out.push(b);
            }
        }
        out.extend_from_slice(b"\nOK\n");
        out
    }

    #[test]
    fn socket_path_is_trimmed_and_unescaped() {
        assert_eq!(
            parse_socket_path(b"/run/user/1000/gnupg/S.gpg-agent\n"),
            PathBuf::from("/run/user/1000/gnupg/S.gpg-agent")
        );
        assert_eq!(
            parse_socket_path(b"/home/a%3ab/.gnupg/S.gpg-agent  \n"),
            PathBuf::from("/home/a:b/.gnupg/S.gpg-agent")
        );
    }

    #[test]
    fn descriptions() {
        assert_eq!(
            key_description(&grip(), None),
            "Sending+key+from+gpg-agent+to+ssh-agent...%0a(keygrip:+0123456789ABCDEF0123456789ABCDEF01234567)"
        );
        assert!(key_description(&grip(), Some("my key")).starts_with("Sending+key+for+'my+key'+from"));
    }

    #[tokio::test]
    async fn missing_gpgconf_is_reported() {
        let err = socket_path("/nonexistent/gpgconf").await.unwrap_err();
        assert!(matches!(err, AgentTransferError::Gpgconf { .. }));
        assert!(socket_path("false").await.is_err());
    }

    #[tokio::test]
    async fn forwards_only_set_variables() {
        let (client, server) = UnixStream::pair().unwrap();
        let server = scripted_server(
            server,
            vec![
                ("OPTION ttyname=/dev/pts/3", b"OK\n".to_vec()),
                ("OPTION display=:0", b"ERR 1 nope\n".to_vec()),
                ("OPTION lc-ctype=C.UTF-8", b"OK\n".to_vec()),
                ("OPTION lc-messages=C.UTF-8", b"OK\n".to_vec()),
            ],
        );
        let env: HashMap<&str, &str> = [("DISPLAY", ":0"), ("LANG", "C.UTF-8"), ("GPG_TTY", "/dev/tty9")]
            .into_iter()
            .collect();
        let mut session = AgentSession::new(client).await.unwrap();
        session
            .forward_environment(|k| env.get(k).map(|v| v.to_string()), Some("/dev/pts/3".into()))
            .await;
        drop(session);
        assert_eq!(server.await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn exports_and_unwraps() {
        let mut plain = toy_rsa_sexp();
        plain.resize(plain.len().next_multiple_of(8), 0);
        let wrapped = wrap(&KEK, &plain);

        let (client, server) = UnixStream::pair().unwrap();
        let server = scripted_server(
            server,
            vec![
                ("KEYWRAP_KEY --export", d_line(&KEK)),
                ("SETKEYDESC Sending+key", b"OK\n".to_vec()),
                ("EXPORT_KEY 0123456789ABCDEF", d_line(&wrapped)),
            ],
        );
        let mut session = AgentSession::new(client).await.unwrap();
        let key = session
            .export_secret_key(&grip(), &key_description(&grip(), None))
            .await
            .unwrap();
        assert_eq!(key.ssh_key_type(), "ssh-rsa");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn short_kek_is_refused() {
        let (client, server) = UnixStream::pair().unwrap();
        let _server = scripted_server(server, vec![("KEYWRAP_KEY", d_line(b"short"))]);
        let mut session = AgentSession::new(client).await.unwrap();
        let err = session.export_secret_key(&grip(), "x").await.unwrap_err();
        assert!(matches!(err, AgentTransferError::KeyLength(5)));
    }
}
