use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

pub const CERT_ENV: &str = "SLOTBOOK_TLS_CERT";
pub const KEY_ENV: &str = "SLOTBOOK_TLS_KEY";

/// PEM certificate chain and private key for the Postgres listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl TlsPaths {
    /// Both paths or neither; one without the other is a configuration error.
    pub fn resolve(cert: Option<String>, key: Option<String>) -> io::Result<Option<Self>> {
        match (cert, key) {
            (None, None) => Ok(None),
            (Some(cert), Some(key)) => Ok(Some(Self {
                cert: cert.into(),
                key: key.into(),
            })),
            _ => Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("both {CERT_ENV} and {KEY_ENV} must be set, or neither"),
            )),
        }
    }

    pub fn from_env() -> io::Result<Option<Self>> {
        Self::resolve(std::env::var(CERT_ENV).ok(), std::env::var(KEY_ENV).ok())
    }

    fn read_certs(&self) -> io::Result<Vec<CertificateDer<'static>>> {
        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(&self.cert)?))
            .collect::<Result<_, _>>()?;
        if certs.is_empty() {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("no certificates found in {}", self.cert.display()),
            ));
        }
        Ok(certs)
    }

    fn read_key(&self) -> io::Result<PrivateKeyDer<'static>> {
        rustls_pemfile::private_key(&mut BufReader::new(File::open(&self.key)?))?.ok_or_else(
            || {
                io::Error::new(
                    ErrorKind::InvalidInput,
                    format!("no private key found in {}", self.key.display()),
                )
            },
        )
    }
}

pub fn load_tls_acceptor(paths: Option<&TlsPaths>) -> io::Result<Option<TlsAcceptor>> {
    let Some(paths) = paths else { return Ok(None) };

    let certs = paths.read_certs()?;
    let key = paths.read_key()?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;

    config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}
