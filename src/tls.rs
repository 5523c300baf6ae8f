//! TLS material for the server listener.
//!
//! Certificates come from the configured PEM files or, when neither path is
//! set, are generated on the spot for `server.host`. Requiring TLS never
//! falls back to plaintext.

use std::{fs::File, io::BufReader, path::Path, sync::Arc};

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::{
    config::ServerConfig,
    server::error::{LockboxError, Result},
};

/// Certificate chain and key the listener will present.
#[derive(Debug)]
pub struct TlsMaterial {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub generated: bool,
}

impl TlsMaterial {
    /// `Ok(None)` when TLS is not required.
    pub fn for_server(config: &ServerConfig) -> Result<Option<Self>> {
        if !config.require_tls {
            if !config.tls_cert.is_empty() || !config.tls_key.is_empty() {
                warn!("tls_cert/tls_key are ignored because require_tls is false");
            }
            return Ok(None);
        }

        let cert = config.tls_cert.trim();
        let key = config.tls_key.trim();
        let material = match (cert.is_empty(), key.is_empty()) {
            (false, false) => Self::load_pem(Path::new(cert), Path::new(key))?,
            (true, true) => Self::self_signed(config.host.trim())?,
            _ => {
                return Err(LockboxError::TlsMaterial(
                    "tls_cert and tls_key must be provided together".into(),
                ))
            }
        };
        Ok(Some(material))
    }

    pub fn load_pem(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let open = |path: &Path| {
            File::open(path).map(BufReader::new).map_err(|err| {
                LockboxError::TlsMaterial(format!("cannot read {}: {err}", path.display()))
            })
        };

        let certs = rustls_pemfile::certs(&mut open(cert_path)?)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|err| {
                let path = cert_path.display();
                LockboxError::TlsMaterial(format!("invalid certificate {path}: {err}"))
            })?;
        if certs.is_empty() {
            return Err(LockboxError::TlsMaterial(format!(
                "no certificate found in {}",
                cert_path.display()
            )));
        }

        let key = rustls_pemfile::private_key(&mut open(key_path)?)
            .map_err(|err| {
                let path = key_path.display();
                LockboxError::TlsMaterial(format!("invalid private key {path}: {err}"))
            })?
            .ok_or_else(|| {
                LockboxError::TlsMaterial(format!("no private key found in {}", key_path.display()))
            })?;

        Ok(Self {
            certs,
            key,
            generated: false,
        })
    }

    pub fn self_signed(host: &str) -> Result<Self> {
        let host = if host.is_empty() { "localhost" } else { host };
        let certified = rcgen::generate_simple_self_signed(vec![host.to_string()])
            .map_err(|err| {
                LockboxError::TlsMaterial(format!("cannot generate certificate: {err}"))
            })?;

        info!(host, "generated self-signed certificate");
        Ok(Self {
            certs: vec![certified.cert.der().clone()],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
                certified.key_pair.serialize_der(),
            )),
            generated: true,
        })
    }

    pub fn into_acceptor(self) -> Result<TlsAcceptor> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|err| LockboxError::TlsMaterial(err.to_string()))?
            .with_no_client_auth()
            .with_single_cert(self.certs, self.key)
            .map_err(|err| LockboxError::TlsMaterial(err.to_string()))?;

        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}
