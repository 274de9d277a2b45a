//! TLS client setup for the collector connection.
//!
//! The handshake is pinned to TLS 1.3 and negotiates `h2`. A client certificate and
//! key enable mutual TLS; otherwise the collector is only verified against the
//! trusted CA bundle.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use hyper_util::rt::TokioIo;
use log::{debug, warn};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{self, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tonic::codegen::http::Uri;

use super::SkyWalkingConfig;
use crate::error::ExportError;

/// Connects TCP and runs the TLS handshake for one collector address.
#[derive(Clone)]
pub struct TlsConnect {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl TlsConnect {
    pub fn new(config: ClientConfig, host: &str) -> Result<Self, ExportError> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| ExportError::Tls(format!("invalid server name {:?}: {}", host, e)))?;
        Ok(TlsConnect {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }

    pub async fn connect(self, uri: Uri) -> std::io::Result<TokioIo<TlsStream<TcpStream>>> {
        let authority = uri.authority().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "collector uri has no authority")
        })?;
        let tcp = TcpStream::connect(authority.as_str()).await?;
        let tls = self.connector.connect(self.server_name, tcp).await?;
        Ok(TokioIo::new(tls))
    }
}

/// Builds the rustls client config described by `config`.
pub fn client_config(config: &SkyWalkingConfig) -> Result<ClientConfig, ExportError> {
    let provider = Arc::new(crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| ExportError::Tls(e.to_string()))?;

    let builder = if config.insecure_skip_verify {
        warn!("collector certificate verification is disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
    } else {
        builder.with_root_certificates(trusted_roots(&config.trusted_cert_path)?)
    };

    let mut tls = match (
        non_empty(&config.client_cert_path),
        non_empty(&config.client_key_path),
    ) {
        (Some(cert_path), Some(key_path)) => {
            debug!("using client certificate {} for mutual TLS", cert_path);
            let certs = load_certs(Path::new(cert_path))?;
            let key = load_key(Path::new(key_path))?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| ExportError::Tls(format!("invalid client certificate: {}", e)))?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(ExportError::Tls(
                "clientCertPath and clientKeyPath must be set together".to_string(),
            ))
        }
    };

    tls.alpn_protocols = vec![b"h2".to_vec()];
    Ok(tls)
}

fn non_empty(path: &str) -> Option<&str> {
    let path = path.trim();
    (!path.is_empty()).then_some(path)
}

fn trusted_roots(path: &str) -> Result<RootCertStore, ExportError> {
    let Some(path) = non_empty(path) else {
        return Err(ExportError::Tls(
            "trustedCertPath is required unless insecureSkipVerify is set".to_string(),
        ));
    };

    let mut roots = RootCertStore::empty();
    for cert in load_certs(Path::new(path))? {
        roots
            .add(cert)
            .map_err(|e| ExportError::Tls(format!("invalid trusted certificate in {}: {}", path, e)))?;
    }
    Ok(roots)
}

fn open(path: &Path) -> Result<BufReader<File>, ExportError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| ExportError::ReadFile {
            path: path.to_path_buf(),
            source,
        })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ExportError> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| ExportError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(ExportError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ExportError> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|source| ExportError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| ExportError::Tls(format!("no private key found in {}", path.display())))
}

// ================================================================================================
// INSECURE VERIFIER
// ================================================================================================

/// Accepts any server certificate. Handshake signatures are still checked.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::client::ResolvesClientCert;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn fixture(name: &str) -> String {
        format!("{}/tests/data/tls/{}", env!("CARGO_MANIFEST_DIR"), name)
    }

    fn tls_config() -> SkyWalkingConfig {
        SkyWalkingConfig {
            address: "collector:11800".into(),
            enable_tls: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_insecure_without_roots_builds() {
        let config = SkyWalkingConfig {
            insecure_skip_verify: true,
            ..tls_config()
        };
        let tls = client_config(&config).unwrap();
        assert_eq!(tls.alpn_protocols, vec![b"h2".to_vec()]);
    }

    #[test]
    fn test_trusted_ca_without_client_identity_builds() {
        let config = SkyWalkingConfig {
            trusted_cert_path: fixture("ca.pem"),
            ..tls_config()
        };
        let tls = client_config(&config).unwrap();
        assert_eq!(tls.alpn_protocols, vec![b"h2".to_vec()]);
        assert!(!tls.client_auth_cert_resolver.has_certs());
    }

    #[test]
    fn test_mutual_tls_presents_client_certificate() {
        let config = SkyWalkingConfig {
            trusted_cert_path: fixture("ca.pem"),
            client_cert_path: fixture("client.pem"),
            client_key_path: fixture("client-key.pem"),
            ..tls_config()
        };
        let tls = client_config(&config).unwrap();
        assert!(tls.client_auth_cert_resolver.has_certs());
        assert!(TlsConnect::new(tls, "collector").is_ok());
    }

    #[test]
    fn test_client_key_mismatch_is_error() {
        // The CA bundle holds a certificate but no key.
        let config = SkyWalkingConfig {
            trusted_cert_path: fixture("ca.pem"),
            client_cert_path: fixture("client.pem"),
            client_key_path: fixture("ca.pem"),
            ..tls_config()
        };
        let err = client_config(&config).unwrap_err();
        assert!(err.to_string().contains("no private key found"));
    }

    #[test]
    fn test_missing_trust_roots_is_error() {
        assert!(matches!(
            client_config(&tls_config()),
            Err(ExportError::Tls(_))
        ));
    }

    #[test]
    fn test_unreadable_trusted_cert_is_error() {
        let config = SkyWalkingConfig {
            trusted_cert_path: "/nonexistent/ca.pem".into(),
            ..tls_config()
        };
        assert!(matches!(
            client_config(&config),
            Err(ExportError::ReadFile { .. })
        ));
    }

    #[test]
    fn test_pem_without_certificates_is_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();
        let config = SkyWalkingConfig {
            trusted_cert_path: file.path().display().to_string(),
            ..tls_config()
        };
        let err = client_config(&config).unwrap_err();
        assert!(err.to_string().contains("no certificates found"));
    }

    #[test]
    fn test_half_client_identity_is_error() {
        let config = SkyWalkingConfig {
            insecure_skip_verify: true,
            client_cert_path: "/etc/client.pem".into(),
            ..tls_config()
        };
        assert!(matches!(
            client_config(&config),
            Err(ExportError::Tls(_))
        ));
    }

    #[test]
    fn test_server_name_accepts_hosts_and_ips() {
        let config = client_config(&SkyWalkingConfig {
            insecure_skip_verify: true,
            ..tls_config()
        })
        .unwrap();
        assert!(TlsConnect::new(config.clone(), "oap.skywalking").is_ok());
        assert!(TlsConnect::new(config.clone(), "127.0.0.1").is_ok());
        assert!(TlsConnect::new(config, "[::1]").is_ok());
    }
}
