use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use tokio_rustls::TlsAcceptor;

/// Builds a TLS acceptor from PEM encoded certificate chain and private key files.
///
/// PKCS#8 keys are tried first, then PKCS#1 RSA keys.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let cert_file = File::open(cert_path)
        .with_context(|| format!("Failed to open certificate: {:?}", cert_path))?;
    let cert_chain: Vec<Certificate> = certs(&mut BufReader::new(cert_file))
        .map_err(|_| anyhow!("Failed to parse certificate {:?}", cert_path))?
        .into_iter()
        .map(Certificate)
        .collect();
    if cert_chain.is_empty() {
        return Err(anyhow!("No certificate found in {:?}", cert_path));
    }

    let private_key = load_private_key(key_path)?;

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .map_err(|e| anyhow!("Failed to build TLS config: {}", e))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_private_key(key_path: &Path) -> Result<PrivateKey> {
    let open = || {
        File::open(key_path)
            .map(BufReader::new)
            .with_context(|| format!("Failed to open private key: {:?}", key_path))
    };

    let mut keys = pkcs8_private_keys(&mut open()?)
        .map_err(|_| anyhow!("Failed to parse private key {:?}", key_path))?;
    if keys.is_empty() {
        keys = rsa_private_keys(&mut open()?)
            .map_err(|_| anyhow!("Failed to parse private key {:?}", key_path))?;
    }
    if keys.is_empty() {
        return Err(anyhow!("No private key found in {:?}", key_path));
    }

    Ok(PrivateKey(keys.remove(0)))
}
