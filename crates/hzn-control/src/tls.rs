//! rustls configuration shared by hubs and the control plane

use crate::error::{ControlError, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::path::Path;
use std::sync::Once;

static CRYPTO_PROVIDER_INIT: Once = Once::new();

/// Install the ring crypto provider once per process
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path).map_err(|e| {
        ControlError::Tls(format!("Failed to open cert file {}: {}", path.display(), e))
    })?;
    parse_certs(&pem)
}

pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path).map_err(|e| {
        ControlError::Tls(format!("Failed to open key file {}: {}", path.display(), e))
    })?;
    parse_private_key(&pem)
}

pub fn parse_certs(mut pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ControlError::Tls(format!("Failed to parse certs: {}", e)))?;

    if certs.is_empty() {
        return Err(ControlError::Tls("No certificates found".to_string()));
    }
    Ok(certs)
}

pub fn parse_private_key(mut pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem)
        .map_err(|e| ControlError::Tls(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| ControlError::Tls("No private key found".to_string()))
}

/// Server config presenting `certs` and offering `alpn` protocols
pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    alpn: &[&[u8]],
) -> Result<rustls::ServerConfig> {
    ensure_crypto_provider();

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ControlError::Tls(format!("Invalid cert/key: {}", e)))?;
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

    Ok(config)
}

/// Client config trusting only `pinned_cert_pem` when given, the webpki
/// roots otherwise
pub fn client_config(pinned_cert_pem: Option<&[u8]>, alpn: &[&[u8]]) -> Result<rustls::ClientConfig> {
    ensure_crypto_provider();

    let mut roots = rustls::RootCertStore::empty();
    match pinned_cert_pem {
        Some(pem) => {
            for cert in parse_certs(pem)? {
                roots
                    .add(cert)
                    .map_err(|e| ControlError::Tls(format!("Invalid root cert: {}", e)))?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

    Ok(config)
}

/// TLS server name for a `host:port` target
pub fn server_name(target: &str) -> Result<ServerName<'static>> {
    let host = match target.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => host,
        _ => target,
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');

    ServerName::try_from(host.to_string())
        .map_err(|e| ControlError::Tls(format!("Invalid server name {}: {}", host, e)))
}
