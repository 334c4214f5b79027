//! A single SMTP session to a remote exchanger.

use carrier_common::{incoming, outgoing};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpStream, ToSocketAddrs},
};
use tokio_rustls::{TlsConnector, client::TlsStream, rustls::pki_types::ServerName};

use super::{
    error::{ClientError, Result},
    response::Response,
    tls,
};

const BUFFER_SIZE: usize = 8192;

/// Replies larger than this are treated as a protocol violation.
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// The transport under a session, swapped in place by STARTTLS.
#[derive(Debug)]
enum ClientConnection {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl ClientConnection {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.write_all(data).await?,
            Self::Tls(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(n)
    }

    async fn upgrade(self, domain: &str, accept_invalid_certs: bool) -> Result<Self> {
        let Self::Plain(stream) = self else {
            return Err(ClientError::TlsError(
                "Connection is already TLS".to_string(),
            ));
        };

        let connector = TlsConnector::from(tls::client_config(accept_invalid_certs));
        let server_name = ServerName::try_from(domain.to_string())
            .map_err(|e| ClientError::TlsError(format!("Invalid server name {domain}: {e}")))?;

        let stream = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| ClientError::TlsError(e.to_string()))?;

        Ok(Self::Tls(Box::new(stream)))
    }
}

/// An SMTP client session.
///
/// Every method sends one command and returns the server's reply as-is;
/// use [`Response::into_result`] to turn negative replies into errors.
#[derive(Debug)]
pub struct SmtpClient {
    /// `None` only while STARTTLS is replacing the stream.
    connection: Option<ClientConnection>,
    /// Bytes read from the server but not yet parsed into a reply.
    buffer: Vec<u8>,
    buffer_pos: usize,
    server_domain: String,
    accept_invalid_certs: bool,
}

impl SmtpClient {
    /// Dials `addr` and wraps the resulting stream.
    pub async fn connect(addr: impl ToSocketAddrs, server_domain: impl Into<String>) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_stream(stream, server_domain))
    }

    /// Wraps an already connected stream. `server_domain` is the name used
    /// for certificate verification after STARTTLS.
    #[must_use]
    pub fn from_stream(stream: TcpStream, server_domain: impl Into<String>) -> Self {
        Self {
            connection: Some(ClientConnection::Plain(stream)),
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            server_domain: server_domain.into(),
            accept_invalid_certs: false,
        }
    }

    /// Skips certificate verification after STARTTLS. Only for testing
    /// against self-signed servers.
    #[must_use]
    pub const fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// The name this session verifies certificates against.
    #[must_use]
    pub fn server_domain(&self) -> &str {
        &self.server_domain
    }

    /// Whether STARTTLS has completed on this session.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self.connection, Some(ClientConnection::Tls(_)))
    }

    /// Reads the 220 banner the server sends on connect. Call this once,
    /// before any command.
    pub async fn read_greeting(&mut self) -> Result<Response> {
        self.read_response().await
    }

    /// Sends a raw command line and reads the reply.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        outgoing!("{} <- {command}", self.server_domain);
        let line = format!("{command}\r\n");
        self.connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?
            .send(line.as_bytes())
            .await?;
        self.read_response().await
    }

    /// `EHLO`. The reply's extension lines list what the server supports.
    pub async fn ehlo(&mut self, domain: &str) -> Result<Response> {
        self.command(&format!("EHLO {domain}")).await
    }

    /// `HELO`, for servers that refuse EHLO.
    pub async fn helo(&mut self, domain: &str) -> Result<Response> {
        self.command(&format!("HELO {domain}")).await
    }

    /// `MAIL FROM:<from>`. An empty `from` sends the null reverse path.
    pub async fn mail_from(&mut self, from: &str) -> Result<Response> {
        self.command(&format!("MAIL FROM:<{from}>")).await
    }

    /// `RCPT TO:<to>`, once per recipient.
    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        self.command(&format!("RCPT TO:<{to}>")).await
    }

    /// `DATA`. A 354 reply means the body may follow through
    /// [`send_body`](Self::send_body).
    pub async fn data(&mut self) -> Result<Response> {
        self.command("DATA").await
    }

    /// Streams a message body after a 354 reply, terminating it with the
    /// `<CRLF>.<CRLF>` marker.
    ///
    /// Bare LF line endings are rewritten to CRLF and lines starting with a
    /// dot are stuffed with an extra one.
    pub async fn send_body<R>(&mut self, body: R) -> Result<Response>
    where
        R: AsyncRead + Unpin,
    {
        let connection = self
            .connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?;

        let mut reader = BufReader::new(body);
        let mut line = Vec::with_capacity(1024);
        let mut pending = Vec::with_capacity(BUFFER_SIZE);
        let mut total = 0usize;

        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line).await? == 0 {
                break;
            }

            total += line.len();
            stuff_line(&line, &mut pending);

            if pending.len() >= BUFFER_SIZE {
                connection.send(&pending).await?;
                pending.clear();
            }
        }

        pending.extend_from_slice(b".\r\n");
        connection.send(&pending).await?;
        outgoing!("{} <- <{total} bytes of message data>", self.server_domain);

        self.read_response().await
    }

    /// Aborts the current transaction, keeping the session open.
    pub async fn rset(&mut self) -> Result<Response> {
        self.command("RSET").await
    }

    pub async fn quit(&mut self) -> Result<Response> {
        self.command("QUIT").await
    }

    /// Sends STARTTLS and, if the server agrees, upgrades the connection.
    pub async fn starttls(&mut self) -> Result<Response> {
        let response = self.command("STARTTLS").await?;

        if response.is_success() {
            let connection = self
                .connection
                .take()
                .ok_or(ClientError::ConnectionClosed)?;
            self.connection = Some(
                connection
                    .upgrade(&self.server_domain, self.accept_invalid_certs)
                    .await?,
            );
            // Anything buffered before the handshake must not be trusted.
            self.buffer_pos = 0;
        }

        Ok(response)
    }

    /// Reads one complete reply, multiline or not, growing the buffer up to
    /// [`MAX_BUFFER_SIZE`]. Bytes after the reply stay buffered for the next.
    async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) =
                Response::parse_response(&self.buffer[..self.buffer_pos])?
            {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;

                incoming!("{} -> {} {}", self.server_domain, response.code, response.message());
                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(ClientError::ParseError(format!(
                        "Response too large (exceeds {MAX_BUFFER_SIZE} bytes)"
                    )));
                }
                self.buffer.resize(new_size, 0);
            }

            let connection = self
                .connection
                .as_mut()
                .ok_or(ClientError::ConnectionClosed)?;
            let n = connection.read(&mut self.buffer[self.buffer_pos..]).await?;
            self.buffer_pos += n;
        }
    }
}

/// Appends `line` to `out` with a CRLF ending, doubling a leading dot.
fn stuff_line(line: &[u8], out: &mut Vec<u8>) {
    let content = line
        .strip_suffix(b"\n")
        .map_or(line, |l| l.strip_suffix(b"\r").unwrap_or(l));

    if content.first() == Some(&b'.') {
        out.push(b'.');
    }
    out.extend_from_slice(content);
    out.extend_from_slice(b"\r\n");
}
