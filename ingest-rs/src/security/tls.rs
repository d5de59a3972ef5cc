//! Inbound STARTTLS support
//!
//! Loads a PEM certificate chain and private key into a rustls server
//! configuration. Sessions use [`TlsConfig::acceptor`] to upgrade a plain
//! connection after `STARTTLS`.

use crate::error::{GatewayError, Result};
use rustls::ServerConfig;
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone)]
pub struct TlsConfig {
    server_config: Arc<ServerConfig>,
}

impl TlsConfig {
    pub fn from_pem_files<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Self> {
        info!("Loading TLS certificate from {:?}", cert_path.as_ref());

        let cert_file = File::open(cert_path.as_ref()).map_err(|e| {
            GatewayError::Tls(format!("Failed to open certificate file: {}", e))
        })?;
        let certs = certs(&mut BufReader::new(cert_file))
            .map_err(|e| GatewayError::Tls(format!("Failed to read certificates: {}", e)))?;

        if certs.is_empty() {
            return Err(GatewayError::Tls("No certificates found in file".to_string()));
        }
        debug!("Loaded {} certificate(s)", certs.len());

        let private_key = Self::load_private_key(key_path.as_ref())?;

        // rustls 0.21 API
        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(
                certs.into_iter().map(rustls::Certificate).collect(),
                rustls::PrivateKey(private_key),
            )
            .map_err(|e| GatewayError::Tls(format!("Failed to create TLS config: {}", e)))?;

        Ok(Self {
            server_config: Arc::new(config),
        })
    }

    /// PKCS#8 first, then PKCS#1 (RSA) keys
    fn load_private_key(path: &Path) -> Result<Vec<u8>> {
        let open = || {
            File::open(path)
                .map(BufReader::new)
                .map_err(|e| GatewayError::Tls(format!("Failed to open key file: {}", e)))
        };

        let mut keys = pkcs8_private_keys(&mut open()?)
            .map_err(|e| GatewayError::Tls(format!("Failed to read private keys: {}", e)))?;
        if keys.is_empty() {
            keys = rsa_private_keys(&mut open()?)
                .map_err(|e| GatewayError::Tls(format!("Failed to read private keys: {}", e)))?;
        }

        if keys.is_empty() {
            return Err(GatewayError::Tls("No private key found in file".to_string()));
        }
        Ok(keys.remove(0))
    }

    pub fn acceptor(&self) -> tokio_rustls::TlsAcceptor {
        tokio_rustls::TlsAcceptor::from(self.server_config.clone())
    }
}
