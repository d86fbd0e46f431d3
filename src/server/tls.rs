//! TLS termination for inbound bridge connections.
//!
//! The teacher terminates TLS with `s2n-tls`, its own QUIC/record-layer
//! oriented library (`dc/s2n-quic-dc/src/stream/server/tokio/tcp/tls.rs`).
//! This is a plain TCP+TLS terminator with no QUIC-specific requirement, so
//! it uses the more broadly idiomatic `tokio-rustls`/`rustls` instead -
//! still the teacher's "build once, hand an `Arc<ServerConfig>` to every
//! accepted connection" shape, just with a different TLS crate underneath.

use crate::error::{Error, Kind};
use rcgen::{CertifiedKey, generate_simple_self_signed};
use rustls_pemfile as pemfile;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::warn;

/// Load a cert/key pair from disk, or fall back to a freshly generated
/// self-signed certificate when neither is configured - good enough for a
/// LAN terminator whose bridges don't validate a CA chain, and for local
/// development.
pub fn build_acceptor(cert_path: Option<&Path>, key_path: Option<&Path>) -> Result<TlsAcceptor, Error> {
    let (certs, key) = match (cert_path, key_path) {
        (Some(cert_path), Some(key_path)) => load_from_disk(cert_path, key_path)?,
        _ => {
            warn!("no tls_cert_path/tls_key_path configured, generating an ephemeral self-signed certificate");
            generate_self_signed()?
        }
    };

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Kind::Tls(e.to_string()).err())?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_from_disk(cert_path: &Path, key_path: &Path) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), Error> {
    let cert_file = File::open(cert_path)?;
    let certs = pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(Kind::Tls(format!("no certificates found in {}", cert_path.display())).err());
    }

    let key_file = File::open(key_path)?;
    let key = pemfile::private_key(&mut BufReader::new(key_file))?
        .ok_or_else(|| Kind::Tls(format!("no private key found in {}", key_path.display())).err())?;

    Ok((certs, key))
}

fn generate_self_signed() -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), Error> {
    let CertifiedKey { cert, signing_key } = generate_simple_self_signed(["cync-gateway.local".to_string()])
        .map_err(|e| Kind::Tls(e.to_string()).err())?;
    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(signing_key.serialize_der()).map_err(|e| Kind::Tls(e.to_string()).err())?;
    Ok((vec![cert_der], key_der))
}
