// Copyright (c) 2026 Lattice Mesh contributors
// SPDX-License-Identifier: Apache-2.0

//! TLS configuration for the framed transport.
//!
//! The server presents a PEM certificate chain and PKCS#8 key at bind
//! time; clients verify against an explicit root certificate. The TLS
//! handshake completes before any framing bytes are exchanged, and a
//! plaintext peer talking to a TLS endpoint fails the handshake rather
//! than falling back.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::domain::error::MeshError;

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, MeshError> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|e| MeshError::Tls(format!("unreadable certificate {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(MeshError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, MeshError> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| MeshError::Tls(format!("unreadable key {}: {e}", path.display())))?
        .ok_or_else(|| MeshError::Tls(format!("no private key found in {}", path.display())))
}

/// Acceptor for the server side, built from PEM cert/key files.
pub fn acceptor(cert: &Path, key: &Path) -> Result<TlsAcceptor, MeshError> {
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(load_certs(cert)?, load_key(key)?)
        .map_err(|e| MeshError::Tls(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Connector for the client side, trusting only the given root
/// certificate (typically the cluster's self-signed CA).
pub fn connector(ca: &Path) -> Result<TlsConnector, MeshError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca)? {
        roots
            .add(cert)
            .map_err(|e| MeshError::Tls(format!("rejected root certificate: {e}")))?;
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Parse the server name clients present during the handshake.
pub fn server_name(domain: &str) -> Result<ServerName<'static>, MeshError> {
    ServerName::try_from(domain.to_string())
        .map_err(|_| MeshError::Tls(format!("invalid tls server name: {domain}")))
}
