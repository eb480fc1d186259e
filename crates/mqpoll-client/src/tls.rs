//! TLS session setup using rustls.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore};

use crate::config::TlsOptions;
use crate::error::{ClientError, Result};

/// Create the client side of a TLS session for `host`.
///
/// `TlsOptions::server_name` overrides the name checked against the
/// broker's certificate.
pub fn client_connection(options: &TlsOptions, host: &str) -> Result<ClientConnection> {
    let config = build_client_config(options)?;
    let name = options.server_name.as_deref().unwrap_or(host);
    let server_name = ServerName::try_from(name.to_string())
        .map_err(|_| ClientError::Tls(format!("Invalid server name: {}", name)))?;
    ClientConnection::new(Arc::new(config), server_name).map_err(|e| ClientError::Tls(e.to_string()))
}

/// Build a rustls ClientConfig from our TlsOptions.
pub fn build_client_config(options: &TlsOptions) -> Result<ClientConfig> {
    if options.accept_invalid_certs {
        log::warn!("TLS certificate verification disabled");
        return Ok(build_insecure_config());
    }

    let mut root_store = RootCertStore::empty();
    if let Some(ca_path) = &options.ca_cert {
        for cert in load_certs(ca_path, "CA cert")? {
            root_store
                .add(cert)
                .map_err(|e| ClientError::Tls(format!("Failed to add CA cert: {}", e)))?;
        }
    } else {
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    let builder = ClientConfig::builder().with_root_certificates(root_store);

    let config = match (&options.client_cert, &options.client_key) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certs(cert_path, "client cert")?;
            let key_file = File::open(key_path)
                .map_err(|e| ClientError::Tls(format!("Failed to open client key: {}", e)))?;
            let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
                .map_err(|e| ClientError::Tls(format!("Failed to parse client key: {}", e)))?
                .ok_or_else(|| ClientError::Tls("No private key found in file".to_string()))?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| ClientError::Tls(format!("Failed to configure client auth: {}", e)))?
        }
        _ => builder.with_no_client_auth(),
    };
    Ok(config)
}

fn load_certs(path: &str, what: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| ClientError::Tls(format!("Failed to open {}: {}", what, e)))?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ClientError::Tls(format!("Failed to parse {}: {}", what, e)))
}

/// Danger: A certificate verifier that accepts any certificate.
/// Only use for testing with self-signed certificates.
mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    #[derive(Debug)]
    pub struct NoCertificateVerification;

    impl ServerCertVerifier for NoCertificateVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }
}

fn build_insecure_config() -> ClientConfig {
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(danger::NoCertificateVerification))
        .with_no_client_auth()
}
