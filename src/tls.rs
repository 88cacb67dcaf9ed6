use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::Path;
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;

use crate::config::TlsFiles;

/// Build the server-side acceptor from a PEM certificate chain and private key.
pub fn load_tls_acceptor(files: &TlsFiles) -> io::Result<TlsAcceptor> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut open_pem(&files.cert)?)
        .collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(invalid(&files.cert, "no certificates found"));
    }
    let key = rustls_pemfile::private_key(&mut open_pem(&files.key)?)?
        .ok_or_else(|| invalid(&files.key, "no private key found"))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn open_pem(path: &Path) -> io::Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| io::Error::new(e.kind(), format!("{}: {e}", path.display())))
}

fn invalid(path: &Path, what: &str) -> io::Error {
    io::Error::new(ErrorKind::InvalidInput, format!("{}: {what}", path.display()))
}
