use super::{tls, BoxedStream, Connector, Endpoint, TransportConfig};
use crate::error::{Result, SpiceError};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Plain TCP connector, wrapping the socket in TLS when the endpoint or
/// configuration asks for it.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint, config: &TransportConfig) -> Result<BoxedStream> {
        debug!("Connecting to SPICE server at {}:{}", endpoint.host, endpoint.port);

        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| SpiceError::ConnectFailed(format!("{}: {}", endpoint, e)))?;

        // Input latency matters more than throughput
        stream
            .set_nodelay(true)
            .map_err(|e| SpiceError::ConnectFailed(format!("failed to set TCP_NODELAY: {e}")))?;

        if endpoint.tls || config.force_tls {
            let stream = tls::wrap(stream, &endpoint.host, &config.trust).await?;
            info!("TLS connection established to {}", endpoint);
            return Ok(stream);
        }

        info!("TCP connection established to {}", endpoint);
        Ok(Box::new(stream))
    }
}
