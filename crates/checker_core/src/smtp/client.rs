//! Minimal async SMTP client used by the prober.
//!
//! Supports plain TCP, implicit TLS and a STARTTLS upgrade over an
//! existing connection. Replies are parsed into code, optional enhanced
//! status code and message text, including multi-line responses.

use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::warn;

/// Timeout for establishing connections.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Timeout for a TLS handshake.
pub const TLS_TIMEOUT: Duration = Duration::from_secs(3);

/// Timeout for executing a single SMTP command.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(8);

const BUFFER_SIZE: usize = 4096;

/// Maximum accumulated reply size to bound a misbehaving server.
const MAX_REPLY_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("operation timed out")]
    Timeout,
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("connection closed by server")]
    ConnectionClosed,
    #[error("malformed reply: {0}")]
    BadReply(String),
}

impl ClientError {
    /// Transport conditions worth a local retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// A parsed SMTP reply.
#[derive(Debug, Clone)]
pub struct Reply {
    pub code: u16,
    /// RFC 3463 enhanced status code, e.g. `5.7.1`, when present.
    pub enhanced: Option<String>,
    pub message: String,
    /// Per-line text, used for EHLO capability checks.
    pub lines: Vec<String>,
}

impl Reply {
    pub fn is_positive(&self) -> bool {
        (200..400).contains(&self.code)
    }

    pub fn has_capability(&self, cap: &str) -> bool {
        self.lines.iter().any(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|word| word.eq_ignore_ascii_case(cap))
        })
    }

    /// Render the way an SMTP error reads on the wire: `550 5.1.1 ...`.
    pub fn to_error_string(&self) -> String {
        format!("{} {}", self.code, self.message)
    }
}

pub(crate) fn parse_reply(raw: &str) -> ClientResult<Reply> {
    let lines: Vec<&str> = raw
        .split("\r\n")
        .filter(|line| !line.is_empty())
        .collect();
    let last = lines
        .last()
        .ok_or_else(|| ClientError::BadReply("empty reply".into()))?;

    let code: u16 = last
        .get(..3)
        .and_then(|digits| digits.parse().ok())
        .ok_or_else(|| ClientError::BadReply(raw.into()))?;

    let texts: Vec<String> = lines
        .iter()
        .map(|line| line.get(4..).unwrap_or_default().to_string())
        .collect();
    let message = texts.join(" ").trim().to_string();
    let enhanced = texts
        .last()
        .and_then(|text| text.split_whitespace().next())
        .filter(|token| is_enhanced_code(token))
        .map(str::to_string);

    Ok(Reply {
        code,
        enhanced,
        message,
        lines: texts,
    })
}

fn is_enhanced_code(token: &str) -> bool {
    let mut parts = token.split('.');
    let ok = (0..3).all(|_| {
        parts
            .next()
            .is_some_and(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
    });
    ok && parts.next().is_none()
}

static CRYPTO_PROVIDER: OnceLock<()> = OnceLock::new();

/// Build a TLS connector trusting the platform certificate store.
pub fn tls_connector() -> ClientResult<TlsConnector> {
    CRYPTO_PROVIDER.get_or_init(|| {
        let _ = tokio_rustls::rustls::crypto::ring::default_provider().install_default();
    });

    let mut roots = RootCertStore::empty();
    let certs = rustls_native_certs::load_native_certs();
    for cert in certs.certs {
        roots
            .add(cert)
            .map_err(|e| ClientError::Tls(e.to_string()))?;
    }
    if !certs.errors.is_empty() {
        warn!(errors = certs.errors.len(), "some platform certificates could not be loaded");
    }

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

enum Connection {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Connection {
    async fn send(&mut self, data: &[u8]) -> ClientResult<()> {
        match self {
            Self::Plain(stream) => stream.write_all(data).await?,
            Self::Tls(stream) => stream.write_all(data).await?,
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> ClientResult<usize> {
        let n = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(n)
    }
}

pub struct SmtpClient {
    connection: Option<Connection>,
    pending: Vec<u8>,
}

impl SmtpClient {
    /// Open a plain TCP connection.
    pub async fn connect(host: &str, port: u16) -> ClientResult<Self> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ClientError::Timeout)??;
        Ok(Self {
            connection: Some(Connection::Plain(stream)),
            pending: Vec::with_capacity(BUFFER_SIZE),
        })
    }

    /// Open a connection with implicit TLS (port 465 semantics).
    pub async fn connect_tls(
        host: &str,
        port: u16,
        connector: &TlsConnector,
    ) -> ClientResult<Self> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ClientError::Timeout)??;
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| ClientError::Tls(e.to_string()))?;
        let tls = tokio::time::timeout(TLS_TIMEOUT, connector.connect(server_name, stream))
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(|e| ClientError::Tls(e.to_string()))?;
        Ok(Self {
            connection: Some(Connection::Tls(Box::new(tls))),
            pending: Vec::with_capacity(BUFFER_SIZE),
        })
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.connection, Some(Connection::Tls(_)))
    }

    /// Upgrade the plain connection after an accepted STARTTLS command.
    pub async fn upgrade_tls(&mut self, host: &str, connector: &TlsConnector) -> ClientResult<()> {
        match self.connection.take() {
            Some(Connection::Plain(stream)) => {
                let server_name = ServerName::try_from(host.to_string())
                    .map_err(|e| ClientError::Tls(e.to_string()))?;
                let tls =
                    tokio::time::timeout(TLS_TIMEOUT, connector.connect(server_name, stream))
                        .await
                        .map_err(|_| ClientError::Timeout)?
                        .map_err(|e| ClientError::Tls(e.to_string()))?;
                self.connection = Some(Connection::Tls(Box::new(tls)));
                self.pending.clear();
                Ok(())
            }
            other => {
                self.connection = other;
                Err(ClientError::Tls("connection is already TLS".into()))
            }
        }
    }

    /// Read one complete (possibly multi-line) reply.
    pub async fn read_reply(&mut self) -> ClientResult<Reply> {
        tokio::time::timeout(COMMAND_TIMEOUT, self.read_reply_inner())
            .await
            .map_err(|_| ClientError::Timeout)?
    }

    async fn read_reply_inner(&mut self) -> ClientResult<Reply> {
        let mut buf = [0u8; BUFFER_SIZE];
        loop {
            if let Some(reply) = self.try_parse_pending()? {
                return Ok(reply);
            }
            if self.pending.len() > MAX_REPLY_SIZE {
                return Err(ClientError::BadReply("reply too large".into()));
            }
            let conn = self
                .connection
                .as_mut()
                .ok_or(ClientError::ConnectionClosed)?;
            let n = conn.read(&mut buf).await?;
            self.pending.extend_from_slice(&buf[..n]);
        }
    }

    fn try_parse_pending(&mut self) -> ClientResult<Option<Reply>> {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        if !text.ends_with("\r\n") {
            return Ok(None);
        }
        let Some(last) = text.split("\r\n").filter(|l| !l.is_empty()).last() else {
            return Ok(None);
        };
        // The final line of a reply separates code and text with a space
        // (or is a bare code); continuation lines use a dash.
        let complete = last.len() >= 3
            && last.as_bytes()[..3].iter().all(u8::is_ascii_digit)
            && (last.len() == 3 || last.as_bytes()[3] == b' ');
        if !complete {
            return Ok(None);
        }
        let reply = parse_reply(&text)?;
        self.pending.clear();
        Ok(Some(reply))
    }

    /// Send a command and read its reply, under the command timeout.
    pub async fn command(&mut self, command: &str) -> ClientResult<Reply> {
        let data = format!("{command}\r\n");
        let conn = self
            .connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?;
        tokio::time::timeout(COMMAND_TIMEOUT, conn.send(data.as_bytes()))
            .await
            .map_err(|_| ClientError::Timeout)??;
        self.read_reply().await
    }

    /// Best-effort QUIT; the connection drops either way.
    pub async fn quit(&mut self) {
        if let Some(conn) = self.connection.as_mut() {
            let _ = tokio::time::timeout(Duration::from_secs(1), conn.send(b"QUIT\r\n")).await;
        }
        self.connection = None;
    }
}
