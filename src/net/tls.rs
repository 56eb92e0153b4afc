use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ring::digest::{digest, SHA256};
use std::path::Path;
use tracing::info;
use wtransport::Identity;

// Dev certificate paths
pub const DEV_CERT_FILE: &str = "certs/cert.pem";
pub const DEV_KEY_FILE: &str = "certs/key.pem";

/// TLS identity for the WebTransport endpoint
pub struct TlsConfig {
    pub identity: Identity,
    /// Base64-encoded SHA-256 of the leaf certificate
    pub cert_hash: String,
}

impl TlsConfig {
    /// Load the identity from explicit paths, falling back to `certs/`
    pub async fn load(cert_path: Option<&str>, key_path: Option<&str>) -> Result<Self> {
        if let (Some(cert_path), Some(key_path)) = (cert_path, key_path) {
            info!("Loading TLS certificate from {}", cert_path);
            return Self::load_from_paths(cert_path, key_path).await;
        }

        if Path::new(DEV_CERT_FILE).exists() && Path::new(DEV_KEY_FILE).exists() {
            info!("Loading dev certificate from certs/");
            Self::load_from_paths(DEV_CERT_FILE, DEV_KEY_FILE).await
        } else {
            Err(anyhow!(
                "TLS certificate not found.\n\n\
                For development: place cert.pem and key.pem under certs/.\n\
                For production: set TLS_CERT_PATH and TLS_KEY_PATH."
            ))
        }
    }

    async fn load_from_paths(cert_path: &str, key_path: &str) -> Result<Self> {
        let identity = Identity::load_pemfiles(cert_path, key_path)
            .await
            .context("Failed to load certificate from PEM files")?;

        let cert_hash = identity
            .certificate_chain()
            .as_slice()
            .first()
            .map(|cert| cert_hash(cert.der()))
            .unwrap_or_default();
        info!("Certificate hash: {}", cert_hash);

        Ok(Self {
            identity,
            cert_hash,
        })
    }
}

/// Hash in the form browsers take for `serverCertificateHashes`
pub fn cert_hash(der: &[u8]) -> String {
    STANDARD.encode(digest(&SHA256, der).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cert_hash_format() {
        let hash = cert_hash(b"not really a certificate");
        let decoded = STANDARD.decode(&hash).unwrap();
        assert_eq!(decoded.len(), 32);
        assert_eq!(hash, cert_hash(b"not really a certificate"));
    }

    #[tokio::test]
    async fn test_missing_files_error() {
        let result = TlsConfig::load(Some("/nonexistent/cert.pem"), Some("/nonexistent/key.pem")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    #[ignore] // Requires certs/ to be populated
    async fn test_load_dev_cert() {
        let config = TlsConfig::load(None, None).await.unwrap();
        assert!(!config.cert_hash.is_empty());
    }
}
