//! TLS helpers for the local listener and the remote engine connection.

use crate::error::{ProxyError, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

fn open(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| ProxyError::Tls(format!("cannot open {}: {e}", path.display())))
}

/// Load certificate chain from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or holds no certificate.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Tls(format!("failed to parse certificate: {e}")))?;

    if certs.is_empty() {
        return Err(ProxyError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }

    Ok(certs)
}

/// Load the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or holds no key.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ProxyError::Tls(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| ProxyError::Tls(format!("no private key found in {}", path.display())))
}

/// Client configuration for mutually authenticated engine connections.
///
/// # Errors
///
/// Returns an error if any PEM file is invalid.
pub fn client_config(ca: &Path, cert: &Path, key: &Path) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    for ca_cert in load_certs(ca)? {
        roots
            .add(ca_cert)
            .map_err(|e| ProxyError::Tls(format!("invalid CA certificate: {e}")))?;
    }

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)
        .map_err(|e| ProxyError::Tls(format!("invalid client certificate: {e}")))?;

    Ok(Arc::new(config))
}

/// Server configuration for the local listener.
///
/// # Errors
///
/// Returns an error if the certificate or key is invalid.
pub fn server_config(cert: &Path, key: &Path) -> Result<Arc<ServerConfig>> {
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(load_certs(cert)?, load_private_key(key)?)
        .map_err(|e| ProxyError::Tls(format!("invalid server certificate: {e}")))?;

    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn write_identity(dir: &TempDir) -> (PathBuf, PathBuf) {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();
        (cert_path, key_path)
    }

    #[test]
    fn builds_server_and_client_configs() {
        let dir = TempDir::new().unwrap();
        let (cert, key) = write_identity(&dir);

        assert_eq!(load_certs(&cert).unwrap().len(), 1);
        assert!(server_config(&cert, &key).is_ok());
        assert!(client_config(&cert, &cert, &key).is_ok());
    }

    #[test]
    fn missing_file_is_a_tls_error() {
        let err = load_certs(Path::new("/nonexistent/cert.pem")).unwrap_err();
        assert!(matches!(err, ProxyError::Tls(_)));
    }

    #[test]
    fn empty_pem_has_no_certificates_or_keys() {
        let dir = TempDir::new().unwrap();
        let empty = dir.path().join("empty.pem");
        std::fs::write(&empty, "").unwrap();

        assert!(load_certs(&empty)
            .unwrap_err()
            .to_string()
            .contains("no certificates"));
        assert!(load_private_key(&empty)
            .unwrap_err()
            .to_string()
            .contains("no private key"));
    }
}
