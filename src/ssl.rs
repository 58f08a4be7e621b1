/*!
 * @file ssl.rs
 * @brief TLS configuration loading for the listener and the proxy
 */

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig};

use crate::error::{DoppelError, Result};

fn load_certs(path: &str) -> Result<Vec<Certificate>> {
    let file = File::open(path)
        .map_err(|e| DoppelError::Tls(format!("cannot open certificate file: {}", e)))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .map_err(|e| DoppelError::Tls(format!("cannot parse certificate file: {}", e)))?;
    if certs.is_empty() {
        return Err(DoppelError::Tls("certificate file contains no certificates".into()));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_private_key(path: &str) -> Result<PrivateKey> {
    let file = File::open(path)
        .map_err(|e| DoppelError::Tls(format!("cannot open key file: {}", e)))?;
    let mut reader = BufReader::new(file);
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut reader)
        .map_err(|e| DoppelError::Tls(format!("cannot parse key file: {}", e)))?;
    if keys.is_empty() {
        let file = File::open(path)
            .map_err(|e| DoppelError::Tls(format!("cannot open key file: {}", e)))?;
        keys = rustls_pemfile::rsa_private_keys(&mut BufReader::new(file))
            .map_err(|e| DoppelError::Tls(format!("cannot parse key file: {}", e)))?;
    }
    keys.pop()
        .map(PrivateKey)
        .ok_or_else(|| DoppelError::Tls("key file contains no private keys".into()))
}

fn load_roots(path: &str) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(&cert)
            .map_err(|e| DoppelError::Tls(format!("invalid CA certificate: {}", e)))?;
    }
    Ok(roots)
}

/// Server-side TLS for the wire listener. A CA file turns on client
/// certificate verification.
pub fn load_server_config(
    cert_file: &str,
    key_file: &str,
    ca_file: Option<&str>,
) -> Result<ServerConfig> {
    let certs = load_certs(cert_file)?;
    let key = load_private_key(key_file)?;
    let builder = ServerConfig::builder().with_safe_defaults();

    let config = match ca_file {
        Some(ca) => {
            let roots = load_roots(ca)?;
            let verifier = rustls::server::AllowAnyAuthenticatedClient::new(roots);
            builder
                .with_client_cert_verifier(Arc::new(verifier))
                .with_single_cert(certs, key)
        }
        None => builder.with_no_client_auth().with_single_cert(certs, key),
    }
    .map_err(|e| DoppelError::Tls(format!("invalid certificate/key pair: {}", e)))?;
    Ok(config)
}

/// Client-side TLS for the differential proxy. Without a CA file the chain
/// is not verified; the proxy target is a test fixture, not a trust anchor.
pub fn load_client_config(ca_file: Option<&str>) -> Result<ClientConfig> {
    let builder = ClientConfig::builder().with_safe_defaults();
    let config = match ca_file {
        Some(ca) => builder
            .with_root_certificates(load_roots(ca)?)
            .with_no_client_auth(),
        None => builder
            .with_custom_certificate_verifier(Arc::new(NoVerification))
            .with_no_client_auth(),
    };
    Ok(config)
}

struct NoVerification;

impl rustls::client::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}
