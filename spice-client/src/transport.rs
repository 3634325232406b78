use crate::error::{Result, SpiceError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

pub mod tcp;
pub mod tls;

pub use tcp::TcpConnector;

/// Where a session connects to. Immutable per connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: false,
        }
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Parse `spice://host:port` or `spice+tls://host:port`.
    pub fn parse(uri: &str) -> Result<Self> {
        let (tls, rest) = if let Some(rest) = uri.strip_prefix("spice+tls://") {
            (true, rest)
        } else if let Some(rest) = uri.strip_prefix("spice://") {
            (false, rest)
        } else {
            return Err(SpiceError::ConnectFailed(format!(
                "invalid URI '{uri}': expected spice:// or spice+tls://"
            )));
        };

        let rest = rest.trim_end_matches('/');
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| SpiceError::ConnectFailed(format!("missing port in '{uri}'")))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| SpiceError::ConnectFailed(format!("invalid port in '{uri}'")))?;
        if host.is_empty() {
            return Err(SpiceError::ConnectFailed(format!("missing host in '{uri}'")));
        }

        Ok(Self::new(host, port).with_tls(tls))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.tls { "spice+tls" } else { "spice" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// How the server certificate is verified when TLS is used.
#[derive(Debug, Clone, Default)]
pub enum TrustAnchor {
    /// No anchor; TLS connections are refused.
    #[default]
    None,
    /// DER encoded CA certificates.
    Der(Vec<Vec<u8>>),
    /// PEM bundle of CA certificates.
    Pem(Vec<u8>),
    /// Accept any certificate. Only for test rigs and trusted networks.
    AcceptAny,
}

/// Per-connection transport settings.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub trust: TrustAnchor,
    pub force_tls: bool,
    pub connect_timeout: Duration,
    pub read_timeout: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            trust: TrustAnchor::None,
            force_tls: false,
            connect_timeout: Duration::from_secs(15),
            read_timeout: None,
        }
    }
}

/// A reliable, ordered byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens the byte stream for one channel.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint, config: &TransportConfig) -> Result<BoxedStream>;
}

/// One transport per channel. Used whole during the link phase and split
/// into a reader and a writer once the channel is ready.
pub struct Transport {
    stream: BoxedStream,
    peer: String,
    read_timeout: Option<Duration>,
    closed: bool,
}

impl Transport {
    pub async fn open(
        connector: &dyn Connector,
        endpoint: &Endpoint,
        config: &TransportConfig,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(config.connect_timeout, connector.connect(endpoint, config))
            .await
            .map_err(|_| SpiceError::Timeout(config.connect_timeout))??;
        let mut transport = Self::from_stream(stream, endpoint.to_string());
        transport.read_timeout = config.read_timeout;
        Ok(transport)
    }

    pub fn from_stream(stream: BoxedStream, peer: impl Into<String>) -> Self {
        Self {
            stream,
            peer: peer.into(),
            read_timeout: None,
            closed: false,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    pub fn is_connected(&self) -> bool {
        !self.closed
    }

    /// Read exactly `n` bytes.
    pub async fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.read_exact(&mut buf).await?;
        Ok(buf)
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.closed {
            return Err(SpiceError::TransportEof);
        }
        read_exact_within(&mut self.stream, buf, self.read_timeout).await
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.closed {
            return Err(SpiceError::TransportEof);
        }
        self.stream.write_all(bytes).await.map_err(map_io)?;
        self.stream.flush().await.map_err(map_io)
    }

    /// Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.stream.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn into_split(self) -> (TransportReader, TransportWriter) {
        let (read, write) = tokio::io::split(self.stream);
        (
            TransportReader {
                inner: read,
                read_timeout: self.read_timeout,
            },
            TransportWriter {
                inner: write,
                closed: self.closed,
            },
        )
    }
}

pub struct TransportReader {
    inner: ReadHalf<BoxedStream>,
    read_timeout: Option<Duration>,
}

impl TransportReader {
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        read_exact_within(&mut self.inner, buf, self.read_timeout).await
    }
}

pub struct TransportWriter {
    inner: WriteHalf<BoxedStream>,
    closed: bool,
}

impl TransportWriter {
    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.closed {
            return Err(SpiceError::TransportEof);
        }
        self.inner.write_all(bytes).await.map_err(map_io)?;
        self.inner.flush().await.map_err(map_io)
    }

    /// Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.inner.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn read_exact_within<R>(reader: &mut R, buf: &mut [u8], timeout: Option<Duration>) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let read = reader.read_exact(buf);
    let result = match timeout {
        Some(limit) => tokio::time::timeout(limit, read)
            .await
            .map_err(|_| SpiceError::Timeout(limit))?,
        None => read.await,
    };
    result.map(|_| ()).map_err(map_io)
}

fn map_io(e: io::Error) -> SpiceError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => SpiceError::TransportEof,
        _ => SpiceError::Io(e),
    }
}
