//! Minimal Assuan client: enough of the protocol to drive gpg-agent.
//!
//! Each command is one line; the server answers with any number of `D`
//! (data), `S` (status), `INQUIRE` and `#` comment lines, terminated by
//! `OK` or `ERR <code> <description>`.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{AgentTransferError, Result};

/// Longest line either side may send, newline included.
pub const LINE_MAX: usize = 1000;

#[derive(Debug, PartialEq, Eq)]
enum Response<'a> {
    Ok,
    Err { code: u32, message: String },
    Data(&'a [u8]),
    Status(&'a [u8]),
    Inquire(&'a [u8]),
    Comment,
}

impl<'a> Response<'a> {
    fn parse(line: &'a [u8]) -> Result<Self> {
        let (word, rest) = match line.iter().position(|&b| b == b' ') {
            Some(i) => (&line[..i], &line[i + 1..]),
            None => (line, &b""[..]),
        };
        match word {
            b"OK" => Ok(Self::Ok),
            b"D" => Ok(Self::Data(rest)),
            b"S" => Ok(Self::Status(rest)),
            b"INQUIRE" => Ok(Self::Inquire(rest)),
            b"ERR" => {
                let rest = String::from_utf8_lossy(rest).into_owned();
                let (code, message) = rest.split_once(' ').unwrap_or((rest.as_str(), ""));
                Ok(Self::Err {
                    code: code.parse().unwrap_or(0),
                    message: message.to_string(),
                })
            }
            _ if line.first() == Some(&b'#') => Ok(Self::Comment),
            _ => Err(AgentTransferError::Protocol(format!(
                "unexpected line '{}'",
                String::from_utf8_lossy(line)
            ))),
        }
    }
}

pub struct AssuanClient<S> {
    stream: BufReader<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> AssuanClient<S> {
    /// Wrap a connected stream and consume the server greeting.
    pub async fn handshake(stream: S) -> Result<Self> {
        let mut client = Self {
            stream: BufReader::new(stream),
        };
        client.finish().await?;
        Ok(client)
    }

    /// Send `command` and collect the percent-unescaped data it returns.
    ///
    /// Inquiries are answered with an empty `END`.
    pub async fn transact(&mut self, command: &str) -> Result<Zeroizing<Vec<u8>>> {
        if command.len() + 1 > LINE_MAX || command.contains('\n') {
            return Err(AgentTransferError::Protocol("command does not fit on one line".into()));
        }
        let verb = command.split(' ').next().unwrap_or_default();
        debug!(command = verb, "assuan request");
        self.send_line(command.as_bytes()).await?;
        self.finish().await
    }

    async fn send_line(&mut self, line: &[u8]) -> Result<()> {
        let stream = self.stream.get_mut();
        stream
            .write_all(line)
            .await
            .map_err(AgentTransferError::io("write to gpg-agent"))?;
        stream
            .write_all(b"\n")
            .await
            .map_err(AgentTransferError::io("write to gpg-agent"))?;
        stream.flush().await.map_err(AgentTransferError::io("write to gpg-agent"))
    }

    async fn finish(&mut self) -> Result<Zeroizing<Vec<u8>>> {
        let mut data = Zeroizing::new(Vec::new());
        let mut line = Zeroizing::new(Vec::with_capacity(LINE_MAX));
        loop {
            line.clear();
            let n = self
                .stream
                .read_until(b'\n', &mut line)
                .await
                .map_err(AgentTransferError::io("read from gpg-agent"))?;
            if n == 0 {
                return Err(AgentTransferError::Protocol("connection closed mid-response".into()));
            }
            if line.last() == Some(&b'\n') {
                line.pop();
            }
            match Response::parse(&line)? {
                Response::Ok => return Ok(data),
                Response::Err { code, message } => {
                    return Err(AgentTransferError::Agent { code, message });
                }
                Response::Data(chunk) => percent_unescape_into(chunk, &mut data),
                Response::Status(status) => {
                    debug!(status = %String::from_utf8_lossy(status), "assuan status");
                }
                Response::Inquire(keyword) => {
                    debug!(keyword = %String::from_utf8_lossy(keyword), "assuan inquire, declining");
                    self.send_line(b"END").await?;
                }
                Response::Comment => {}
            }
        }
    }
}

/// Decode `%XX` escapes; malformed escapes pass through literally.
pub fn percent_unescape(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    percent_unescape_into(input, &mut out);
    out
}

fn percent_unescape_into(input: &[u8], out: &mut Vec<u8>) {
    let mut i = 0;
    while i < input.len() {
        if input[i] == b'%'
            && let Some(hex) = input.get(i + 1..i + 3)
            && let Some(byte) = std::str::from_utf8(hex)
                .ok()
                .and_then(|h| u8::from_str_radix(h, 16).ok())
        {
            out.push(byte);
            i += 3;
        } else {
            out.push(input[i]);
            i += 1;
        }
    }
}

/// gnupg's "percent-plus" escaping for command arguments: spaces become
/// `+`; `+`, `"`, `%` and control characters become `%XX`.
pub fn percent_plus_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for &b in input.as_bytes() {
        match b {
            b'+' | b'"' | b'%' | 0..0x20 => out.push_str(&format!("%{b:02X}")),
            b' ' => out.push('+'),
            _ => out.push(b as char),
        }
    }
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;

    use super::*;

    /// Serve a scripted conversation: greeting, then for each expected
    /// command the canned reply. Returns the commands actually received.
    pub(crate) fn scripted_server(
        stream: UnixStream,
        script: Vec<(&'static str, Vec<u8>)>,
    ) -> tokio::task::JoinHandle<Vec<String>> {
        tokio::spawn(async move {
            let mut stream = BufReader::new(stream);
            let mut seen = Vec::new();
            stream.get_mut().write_all(b"OK Pleased to meet you\n").await.unwrap();
            for (expect, reply) in script {
                let mut line = String::new();
                if stream.read_line(&mut line).await.unwrap() == 0 {
                    break;
                }
                let line = line.trim_end().to_string();
                assert!(line.starts_with(expect), "got '{line}', expected '{expect}'");
                seen.push(line);
                stream.get_mut().write_all(&reply).await.unwrap();
            }
            seen
        })
    }

    #[test]
    fn unescaping() {
        assert_eq!(percent_unescape(b"/run/user/1000/gnupg/S.gpg%2Dagent"), b"/run/user/1000/gnupg/S.gpg-agent");
        assert_eq!(percent_unescape(b"a%0Ab%25"), b"a\nb%");
        assert_eq!(percent_unescape(b"100%"), b"100%");
        assert_eq!(percent_unescape(b"%zz%4"), b"%zz%4");
    }

    #[test]
    fn plus_escaping() {
        assert_eq!(percent_plus_escape("my laptop"), "my+laptop");
        assert_eq!(percent_plus_escape("a+b \"c\" 50%\n"), "a%2Bb+%22c%22+50%25%0A");
    }

    #[test]
    fn response_lines() {
        assert_eq!(Response::parse(b"OK").unwrap(), Response::Ok);
        assert_eq!(Response::parse(b"OK closing").unwrap(), Response::Ok);
        assert_eq!(Response::parse(b"D abc").unwrap(), Response::Data(b"abc"));
        assert_eq!(Response::parse(b"# note").unwrap(), Response::Comment);
        assert_eq!(
            Response::parse(b"ERR 67108881 No secret key <GPG Agent>").unwrap(),
            Response::Err {
                code: 67108881,
                message: "No secret key <GPG Agent>".into()
            }
        );
        assert!(Response::parse(b"BOGUS").is_err());
    }

    #[tokio::test]
    async fn data_status_and_inquire() {
        let (client, server) = UnixStream::pair().unwrap();
        let server = scripted_server(
            server,
            vec![
                (
                    "GETINFO",
                    b"S PROGRESS x\n# comment\nD hello%20\nD world%0A\nOK\n".to_vec(),
                ),
                ("EXPORT_KEY", b"INQUIRE PASSPHRASE\n".to_vec()),
                ("END", b"ERR 83886179 Operation cancelled\n".to_vec()),
            ],
        );
        let mut assuan = AssuanClient::handshake(client).await.unwrap();
        let data = assuan.transact("GETINFO version").await.unwrap();
        assert_eq!(data.as_slice(), b"hello world\n");

        let err = assuan.transact("EXPORT_KEY 00").await.unwrap_err();
        assert!(matches!(err, AgentTransferError::Agent { code: 83886179, .. }));
        assert_eq!(server.await.unwrap(), ["GETINFO version", "EXPORT_KEY 00", "END"]);
    }

    #[tokio::test]
    async fn closed_connection_is_an_error() {
        let (client, server) = UnixStream::pair().unwrap();
        drop(server);
        assert!(AssuanClient::handshake(client).await.is_err());
    }

    #[tokio::test]
    async fn refuses_multiline_commands() {
        let (client, server) = UnixStream::pair().unwrap();
        let _server = scripted_server(server, vec![]);
        let mut assuan = AssuanClient::handshake(client).await.unwrap();
        assert!(assuan.transact("OPTION a\nOPTION b").await.is_err());
        assert!(assuan.transact(&"x".repeat(LINE_MAX)).await.is_err());
    }
}
