use super::{BoxedStream, TrustAnchor};
use crate::error::{Result, SpiceError};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// Wrap an established TCP stream in a TLS session.
pub async fn wrap(stream: TcpStream, host: &str, trust: &TrustAnchor) -> Result<BoxedStream> {
    let config = client_config(trust)?;
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| SpiceError::Tls(format!("invalid server name '{host}': {e}")))?;

    let stream = TlsConnector::from(config)
        .connect(server_name, stream)
        .await
        .map_err(|e| SpiceError::Tls(format!("handshake with {host} failed: {e}")))?;

    Ok(Box::new(stream))
}

/// Build the rustls client configuration for a trust anchor.
pub fn client_config(trust: &TrustAnchor) -> Result<Arc<ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| SpiceError::Tls(e.to_string()))?;

    let config = match trust {
        TrustAnchor::None => {
            return Err(SpiceError::Tls(
                "TLS requested but no trust anchor was supplied".into(),
            ))
        }
        TrustAnchor::AcceptAny => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
            .with_no_client_auth(),
        TrustAnchor::Der(certs) => {
            let mut roots = RootCertStore::empty();
            for der in certs {
                roots
                    .add(CertificateDer::from(der.clone()))
                    .map_err(|e| SpiceError::Tls(format!("bad trust anchor: {e}")))?;
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        TrustAnchor::Pem(pem) => {
            let mut roots = RootCertStore::empty();
            let mut reader = pem.as_slice();
            for cert in rustls_pemfile::certs(&mut reader) {
                let cert = cert.map_err(|e| SpiceError::Tls(format!("bad PEM bundle: {e}")))?;
                roots
                    .add(cert)
                    .map_err(|e| SpiceError::Tls(format!("bad trust anchor: {e}")))?;
            }
            if roots.is_empty() {
                return Err(SpiceError::Tls("PEM bundle contains no certificates".into()));
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        }
    };

    Ok(Arc::new(config))
}

/// Skips chain validation but still checks handshake signatures.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_anchor_is_refused() {
        let err = client_config(&TrustAnchor::None).unwrap_err();
        assert!(matches!(err, SpiceError::Tls(_)));
    }

    #[test]
    fn test_accept_any_builds() {
        assert!(client_config(&TrustAnchor::AcceptAny).is_ok());
    }

    #[test]
    fn test_empty_pem_is_refused() {
        let err = client_config(&TrustAnchor::Pem(b"not a certificate".to_vec())).unwrap_err();
        assert!(matches!(err, SpiceError::Tls(_)));
    }
}
