//! ClamAV daemon client using the PING and INSTREAM protocol.

use crate::config::ClamdConfig;
use crate::protocol::{
    as_ascii_string, classify_reply, display_reply, encode_chunk_len, is_size_limit_reply,
    ScanVerdict, CHUNK_HEADER_LEN, INSTREAM_COMMAND, PING_COMMAND, PONG_REPLY, PONG_REPLY_LEN,
    REPLY_READ_SIZE, STREAM_TERMINATOR, VERSION_COMMAND,
};
use std::future::Future;
use std::io;
#[cfg(unix)]
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Where clamd listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// TCP socket (`TCPSocket`/`TCPAddr` in clamd.conf).
    Tcp { host: String, port: u16 },
    /// Local socket (`LocalSocket` in clamd.conf).
    #[cfg(unix)]
    Unix(PathBuf),
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "{}:{}", host, port),
            #[cfg(unix)]
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Error from ClamAV operations.
#[derive(Debug, Error)]
pub enum ClamdError {
    /// Connection to clamd failed.
    #[error("Connection to clamd failed: {0}")]
    ConnectionFailed(io::Error),

    /// Configured timeout elapsed.
    #[error("Timed out waiting for clamd")]
    Timeout,

    /// I/O error on the clamd connection.
    #[error("I/O error: {0}")]
    Io(io::Error),

    /// Reading the data to scan failed.
    #[error("Failed to read scan input: {0}")]
    Input(io::Error),

    /// clamd replied before the stream was terminated.
    #[error("Scan aborted. Reply from server: {0}")]
    ScanAborted(String),

    /// clamd refused the stream because it exceeds `StreamMaxLength`.
    #[error("Clamd size limit exceeded. Full reply from server: {0}")]
    SizeLimitExceeded(String),

    /// Connection parameters are unusable.
    #[error("Invalid clamd configuration: {0}")]
    InvalidConfig(String),
}

impl ClamdError {
    /// Whether the error needs operator action rather than a retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClamdError::SizeLimitExceeded(_) | ClamdError::InvalidConfig(_)
        )
    }
}

impl From<io::Error> for ClamdError {
    fn from(e: io::Error) -> Self {
        ClamdError::Io(e)
    }
}

/// A single clamd connection.
enum Connection {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Connection {
    async fn open(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::Tcp { host, port } => TcpStream::connect((host.as_str(), *port))
                .await
                .map(Connection::Tcp),
            #[cfg(unix)]
            Endpoint::Unix(path) => UnixStream::connect(path).await.map(Connection::Unix),
        }
    }

    /// Read whatever the daemon has already sent, without waiting.
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Connection::Tcp(s) => s.try_read(buf),
            #[cfg(unix)]
            Connection::Unix(s) => s.try_read(buf),
        }
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Connection::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Connection::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Connection::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Connection::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Connection::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Run an I/O future under an optional timeout.
async fn with_timeout<T, F>(limit: Option<Duration>, fut: F) -> Result<T, ClamdError>
where
    F: Future<Output = io::Result<T>>,
{
    match limit {
        Some(limit) => match timeout(limit, fut).await {
            Ok(result) => result.map_err(ClamdError::Io),
            Err(_) => Err(ClamdError::Timeout),
        },
        None => fut.await.map_err(ClamdError::Io),
    }
}

/// ClamAV daemon client.
///
/// Holds connection parameters only. Every call opens its own connection and
/// drops it before returning, so one client can be shared across tasks.
#[derive(Debug, Clone)]
pub struct ClamdClient {
    endpoint: Endpoint,
    timeout: Option<Duration>,
    chunk_size: usize,
}

impl ClamdClient {
    /// Create a new ClamAV client.
    ///
    /// Fails with [`ClamdError::InvalidConfig`] for a negative timeout or a
    /// chunk size that is zero or does not fit the 32-bit length prefix.
    pub fn new(config: &ClamdConfig) -> Result<Self, ClamdError> {
        config.validate().map_err(ClamdError::InvalidConfig)?;
        Ok(Self {
            endpoint: config.endpoint(),
            timeout: config.timeout(),
            chunk_size: config.chunk_size,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Timeout applied to connect, reads and writes. `None` waits forever.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Check if clamd is available by sending PING.
    ///
    /// Returns `true` only if the daemon answers with exactly `PONG`. Any
    /// connection or I/O failure yields `false`.
    pub async fn ping(&self) -> bool {
        match self.read_pong().await {
            Ok(reply) => {
                info!(reply = %as_ascii_string(&reply), "Check scanner status");
                reply.as_slice() == PONG_REPLY.as_slice()
            }
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "clamd ping failed");
                false
            }
        }
    }

    /// Scan an in-memory buffer.
    ///
    /// See [`ClamdClient::scan_stream`]. The buffer is only read.
    pub async fn scan(&self, data: &[u8]) -> Result<ScanVerdict, ClamdError> {
        let mut source = data;
        self.scan_stream(&mut source).await
    }

    /// Stream data to clamd in chunks of at most `chunk_size` bytes.
    ///
    /// The whole input is never held in memory. The source is left at EOF
    /// (or wherever the scan stopped) and is not closed.
    ///
    /// Connection failures, timeouts and early replies from the daemon give
    /// `Ok(ScanVerdict::Failed)`. The only error returned is
    /// [`ClamdError::SizeLimitExceeded`]: the chunked stream exceeded the
    /// daemon's `StreamMaxLength` and retrying cannot help.
    pub async fn scan_stream<R>(&self, source: &mut R) -> Result<ScanVerdict, ClamdError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        debug!(
            endpoint = %self.endpoint,
            chunk_size = self.chunk_size,
            "Starting ClamAV scan"
        );

        match self.instream(source).await {
            Ok(reply) => {
                info!(response = %display_reply(&reply), "File scan response");
                Ok(classify_reply(&reply))
            }
            Err(e @ ClamdError::SizeLimitExceeded(_)) => {
                error!(endpoint = %self.endpoint, error = %e, "clamd rejected stream size");
                Err(e)
            }
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "ClamAV scan failed");
                Ok(ScanVerdict::Failed)
            }
        }
    }

    /// Get clamd version.
    pub async fn version(&self) -> Result<String, ClamdError> {
        let mut conn = self.connect().await?;
        self.send_command(&mut conn, VERSION_COMMAND).await?;
        let reply = self.read_reply(&mut conn).await?;
        Ok(display_reply(&reply))
    }

    async fn connect(&self) -> Result<Connection, ClamdError> {
        match with_timeout(self.timeout, Connection::open(&self.endpoint)).await {
            Err(ClamdError::Io(e)) => Err(ClamdError::ConnectionFailed(e)),
            other => other,
        }
    }

    async fn send_command(
        &self,
        conn: &mut Connection,
        command: &[u8],
    ) -> Result<(), ClamdError> {
        with_timeout(self.timeout, conn.write_all(command)).await?;
        with_timeout(self.timeout, conn.flush()).await
    }

    /// Send PING and collect up to four reply bytes.
    async fn read_pong(&self) -> Result<Vec<u8>, ClamdError> {
        let mut conn = self.connect().await?;
        self.send_command(&mut conn, PING_COMMAND).await?;

        let mut reply = [0u8; PONG_REPLY_LEN];
        let mut filled = 0;
        while filled < reply.len() {
            let n = with_timeout(self.timeout, conn.read(&mut reply[filled..])).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        Ok(reply[..filled].to_vec())
    }

    /// Run an INSTREAM session and return the raw reply.
    ///
    /// The INSTREAM protocol:
    /// 1. Send "zINSTREAM\0"
    /// 2. Send chunks as [4-byte big-endian length][data]
    /// 3. Send [0x00 0x00 0x00 0x00] to end stream
    /// 4. Read response: "stream: OK\0" or "stream: <virus> FOUND\0"
    async fn instream<R>(&self, source: &mut R) -> Result<Vec<u8>, ClamdError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut conn = self.connect().await?;
        self.send_command(&mut conn, INSTREAM_COMMAND).await?;

        // Length prefix and data share one buffer so each chunk is one write.
        let mut frame = vec![0u8; CHUNK_HEADER_LEN + self.chunk_size];
        let mut chunks: u64 = 0;
        let mut bytes: u64 = 0;

        loop {
            let read = source
                .read(&mut frame[CHUNK_HEADER_LEN..])
                .await
                .map_err(ClamdError::Input)?;
            if read == 0 {
                break;
            }

            let header = encode_chunk_len(read).ok_or_else(|| {
                ClamdError::InvalidConfig(format!("chunk of {} bytes exceeds 32 bits", read))
            })?;
            frame[..CHUNK_HEADER_LEN].copy_from_slice(&header);
            with_timeout(
                self.timeout,
                conn.write_all(&frame[..CHUNK_HEADER_LEN + read]),
            )
            .await?;

            chunks += 1;
            bytes += read as u64;

            if let Some(reply) = self.early_reply(&mut conn).await? {
                let text = display_reply(&reply);
                debug!(chunks, bytes, reply = %text, "clamd replied before end of stream");
                if is_size_limit_reply(&reply) {
                    return Err(ClamdError::SizeLimitExceeded(text));
                }
                return Err(ClamdError::ScanAborted(text));
            }
        }

        with_timeout(self.timeout, conn.write_all(&STREAM_TERMINATOR)).await?;
        with_timeout(self.timeout, conn.flush()).await?;
        debug!(chunks, bytes, "Stream terminated, waiting for verdict");

        self.read_reply(&mut conn).await
    }

    /// Check, without blocking, whether clamd has already started replying.
    ///
    /// Only bytes that are already pending are collected.
    async fn early_reply(&self, conn: &mut Connection) -> Result<Option<Vec<u8>>, ClamdError> {
        let mut buf = [0u8; REPLY_READ_SIZE];
        // try_read only sees readiness the I/O driver has already recorded.
        tokio::task::yield_now().await;
        match conn.try_read(&mut buf) {
            Ok(0) => Err(ClamdError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "clamd closed the connection before the stream was terminated",
            ))),
            Ok(n) => {
                let mut reply = buf[..n].to_vec();
                drain_pending(conn, &mut reply).await?;
                Ok(Some(reply))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(ClamdError::Io(e)),
        }
    }

    /// Wait for the first reply bytes, then keep reading while more are
    /// immediately available.
    ///
    /// Stops early on the NUL that ends every z-command reply, and on EOF.
    async fn read_reply(&self, conn: &mut Connection) -> Result<Vec<u8>, ClamdError> {
        let mut buf = [0u8; REPLY_READ_SIZE];
        let n = with_timeout(self.timeout, conn.read(&mut buf)).await?;
        let mut reply = buf[..n].to_vec();
        if n > 0 {
            drain_pending(conn, &mut reply).await?;
        }
        Ok(reply)
    }
}

/// Append bytes the daemon has already sent until the reply is delimited,
/// the connection reaches EOF, or nothing more is pending.
async fn drain_pending(conn: &Connection, reply: &mut Vec<u8>) -> Result<(), ClamdError> {
    let mut buf = [0u8; REPLY_READ_SIZE];
    while !reply.ends_with(b"\0") {
        tokio::task::yield_now().await;
        match conn.try_read(&mut buf) {
            Ok(0) => break,
            Ok(n) => reply.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(ClamdError::Io(e)),
        }
    }
    Ok(())
}
