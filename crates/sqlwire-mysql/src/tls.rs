//! TLS upgrade for MySQL connections, using rustls.
//!
//! # Upgrade flow
//!
//! 1. Server greeting advertises `CLIENT_SSL`
//! 2. Client sends the 32-byte SSL request (sequence 1)
//! 3. Client runs the TLS handshake over the same socket
//! 4. The handshake response (sequence 2) and everything after travel over TLS
//!
//! The handshake is driven by asupersync's `TlsConnector` on the
//! non-blocking TCP stream, so it yields to the executor like any other I/O.
//!
//! Requires the `tls` feature. Without it, [`upgrade`] fails with an `Ssl`
//! connection error.

use asupersync::Cx;
use sqlwire_core::{CloseHandle, Error};

use crate::config::{SslMode, TlsConfig};
use crate::error::ssl_error;
use crate::protocol::capabilities;
use crate::transport::Stream;

#[cfg(feature = "tls")]
use sqlwire_core::error::ConnectionErrorKind;
#[cfg(feature = "tls")]
use std::sync::Arc;

/// Whether the server greeting advertises TLS.
pub const fn server_supports_ssl(server_caps: u32) -> bool {
    server_caps & capabilities::CLIENT_SSL != 0
}

/// Decide whether to upgrade.
///
/// - `Ok(true)` upgrade
/// - `Ok(false)` stay in plain text
/// - `Err(_)` TLS is required but the server does not offer it
pub fn validate_ssl_mode(ssl_mode: SslMode, server_caps: u32) -> Result<bool, Error> {
    let server_supports = server_supports_ssl(server_caps);

    match ssl_mode {
        SslMode::Disable => Ok(false),
        SslMode::Preferred => Ok(server_supports),
        SslMode::Required | SslMode::VerifyCa | SslMode::VerifyIdentity => {
            if server_supports {
                Ok(true)
            } else {
                Err(ssl_error("SSL required but server does not support it"))
            }
        }
    }
}

/// Check the TLS options are consistent with the mode before connecting.
pub fn validate_tls_config(ssl_mode: SslMode, tls_config: &TlsConfig) -> Result<(), Error> {
    if tls_config.client_cert_path.is_some() != tls_config.client_key_path.is_some() {
        return Err(ssl_error(
            "Client certificate and key must be set together for mutual TLS",
        ));
    }
    match ssl_mode {
        SslMode::Disable | SslMode::Preferred | SslMode::Required => Ok(()),
        SslMode::VerifyCa | SslMode::VerifyIdentity => {
            if tls_config.ca_cert_path.is_none() && !tls_config.danger_skip_verify {
                return Err(ssl_error(
                    "CA certificate required for VerifyCa/VerifyIdentity mode. \
                     Set ca_cert_path or danger_skip_verify.",
                ));
            }
            Ok(())
        }
    }
}

/// Plain `Preferred`/`Required` encrypt without checking the certificate
/// unless a CA is configured; the verify modes always check it.
#[cfg(feature = "tls")]
fn build_client_config(
    tls_config: &TlsConfig,
    ssl_mode: SslMode,
) -> Result<rustls::ClientConfig, Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    match ssl_mode {
        SslMode::Disable => Err(ssl_error("TLS requested with SslMode::Disable")),
        _ if tls_config.danger_skip_verify => build_no_verify_config(&provider),
        SslMode::Preferred | SslMode::Required => match &tls_config.ca_cert_path {
            Some(ca_path) => build_custom_ca_config(&provider, tls_config, ca_path),
            None => build_no_verify_config(&provider),
        },
        SslMode::VerifyCa | SslMode::VerifyIdentity => match &tls_config.ca_cert_path {
            Some(ca_path) => build_custom_ca_config(&provider, tls_config, ca_path),
            None => build_webpki_config(&provider, tls_config),
        },
    }
}

#[cfg(feature = "tls")]
fn build_no_verify_config(
    provider: &Arc<rustls::crypto::CryptoProvider>,
) -> Result<rustls::ClientConfig, Error> {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error as RustlsError, SignatureScheme};

    #[derive(Debug)]
    struct NoVerifier(Arc<rustls::crypto::CryptoProvider>);

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, RustlsError> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, RustlsError> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, RustlsError> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0
                .signature_verification_algorithms
                .supported_schemes()
        }
    }

    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| ssl_error(format!("Failed to set TLS versions: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier(provider.clone())))
        .with_no_client_auth();

    Ok(config)
}

#[cfg(feature = "tls")]
fn build_webpki_config(
    provider: &Arc<rustls::crypto::CryptoProvider>,
    tls_config: &TlsConfig,
) -> Result<rustls::ClientConfig, Error> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| ssl_error(format!("Failed to set TLS versions: {e}")))?
        .with_root_certificates(root_store);

    add_client_auth(builder, tls_config)
}

#[cfg(feature = "tls")]
fn build_custom_ca_config(
    provider: &Arc<rustls::crypto::CryptoProvider>,
    tls_config: &TlsConfig,
    ca_path: &std::path::Path,
) -> Result<rustls::ClientConfig, Error> {
    let certs = load_certs(ca_path, "CA certificate")?;

    let mut root_store = rustls::RootCertStore::empty();
    for cert in certs {
        root_store
            .add(cert)
            .map_err(|e| ssl_error(format!("Failed to add CA certificate: {e}")))?;
    }

    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| ssl_error(format!("Failed to set TLS versions: {e}")))?
        .with_root_certificates(root_store);

    add_client_auth(builder, tls_config)
}

#[cfg(feature = "tls")]
fn load_certs(
    path: &std::path::Path,
    what: &str,
) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, Error> {
    let file = std::fs::File::open(path)
        .map_err(|e| ssl_error(format!("Failed to open {what} '{}': {e}", path.display())))?;
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ssl_error(format!("Failed to parse {what}: {e}")))?;
    if certs.is_empty() {
        return Err(ssl_error(format!(
            "No certificates found in {what} file '{}'",
            path.display()
        )));
    }
    Ok(certs)
}

#[cfg(feature = "tls")]
fn add_client_auth(
    builder: rustls::ConfigBuilder<rustls::ClientConfig, rustls::client::WantsClientCert>,
    tls_config: &TlsConfig,
) -> Result<rustls::ClientConfig, Error> {
    let (Some(cert_path), Some(key_path)) =
        (&tls_config.client_cert_path, &tls_config.client_key_path)
    else {
        return Ok(builder.with_no_client_auth());
    };

    let certs = load_certs(cert_path, "client certificate")?;

    let key_file = std::fs::File::open(key_path).map_err(|e| {
        ssl_error(format!(
            "Failed to open client key '{}': {e}",
            key_path.display()
        ))
    })?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))
        .map_err(|e| ssl_error(format!("Failed to parse client key: {e}")))?
        .ok_or_else(|| ssl_error(format!("No private key found in '{}'", key_path.display())))?;

    builder
        .with_client_auth_cert(certs, key)
        .map_err(|e| ssl_error(format!("Failed to configure client auth: {e}")))
}

/// Wrap a plain TCP transport in TLS after the SSL request was sent.
///
/// `server_name` is used for SNI and identity checks unless
/// `tls_config.server_name` overrides it. Cancellation and the close handle
/// are checked on every poll of the handshake.
#[cfg(feature = "tls")]
pub(crate) async fn upgrade(
    cx: &Cx,
    close: &CloseHandle,
    stream: Stream,
    tls_config: &TlsConfig,
    server_name: &str,
    ssl_mode: SslMode,
) -> Result<Stream, Error> {
    use std::future::{Future, poll_fn};
    use std::task::Poll;

    let tcp = match stream {
        Stream::Tcp(tcp) => tcp,
        other => return Err(ssl_error(format!("Cannot upgrade {other:?} to TLS"))),
    };
    let config = build_client_config(tls_config, ssl_mode)?;
    let sni_name = tls_config.server_name.as_deref().unwrap_or(server_name);
    let connector = asupersync::tls::TlsConnector::new(config);

    let mut handshake = std::pin::pin!(connector.connect(sni_name, tcp));
    let tls = poll_fn(|task| {
        if cx.is_cancel_requested() {
            return Poll::Ready(Err(Error::Cancelled));
        }
        close.register(task.waker());
        if close.is_aborted() {
            return Poll::Ready(Err(crate::error::connection_lost(
                ConnectionErrorKind::Disconnected,
                "Lost connection to MySQL server during TLS handshake",
            )));
        }
        handshake
            .as_mut()
            .poll(task)
            .map(|r| r.map_err(|e| ssl_error(format!("TLS handshake failed: {e}"))))
    })
    .await?;

    tracing::debug!(
        version = ?tls.protocol_version(),
        sni = sni_name,
        "TLS established"
    );
    Ok(Stream::Tls(Box::new(tls)))
}

#[cfg(not(feature = "tls"))]
pub(crate) async fn upgrade(
    _cx: &Cx,
    _close: &CloseHandle,
    _stream: Stream,
    _tls_config: &TlsConfig,
    _server_name: &str,
    _ssl_mode: SslMode,
) -> Result<Stream, Error> {
    Err(ssl_error("TLS support requires the 'tls' feature of sqlwire-mysql"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_supports_ssl() {
        assert!(server_supports_ssl(capabilities::CLIENT_SSL));
        assert!(server_supports_ssl(
            capabilities::CLIENT_SSL | capabilities::CLIENT_PROTOCOL_41
        ));
        assert!(!server_supports_ssl(0));
        assert!(!server_supports_ssl(capabilities::CLIENT_PROTOCOL_41));
    }

    #[test]
    fn test_validate_ssl_mode() {
        assert!(!validate_ssl_mode(SslMode::Disable, capabilities::CLIENT_SSL).unwrap());
        assert!(!validate_ssl_mode(SslMode::Preferred, 0).unwrap());
        assert!(validate_ssl_mode(SslMode::Preferred, capabilities::CLIENT_SSL).unwrap());
        assert!(validate_ssl_mode(SslMode::Required, 0).is_err());
        assert!(validate_ssl_mode(SslMode::VerifyCa, 0).is_err());
        assert!(validate_ssl_mode(SslMode::VerifyIdentity, capabilities::CLIENT_SSL).unwrap());
    }

    #[test]
    fn test_required_mode_error_is_ssl_kind() {
        let err = validate_ssl_mode(SslMode::Required, 0).unwrap_err();
        match err {
            Error::Connection(c) => {
                assert_eq!(c.kind, sqlwire_core::error::ConnectionErrorKind::Ssl);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_validate_tls_config() {
        let bare = TlsConfig::new();
        assert!(validate_tls_config(SslMode::Required, &bare).is_ok());
        assert!(validate_tls_config(SslMode::VerifyCa, &bare).is_err());

        let with_ca = TlsConfig::new().ca_cert("/path/to/ca.pem");
        assert!(validate_tls_config(SslMode::VerifyIdentity, &with_ca).is_ok());

        let skip = TlsConfig::new().skip_verify(true);
        assert!(validate_tls_config(SslMode::VerifyCa, &skip).is_ok());

        let half_mtls = TlsConfig::new()
            .ca_cert("/path/to/ca.pem")
            .client_cert("/path/to/client.pem");
        assert!(validate_tls_config(SslMode::Required, &half_mtls).is_err());

        let mtls = half_mtls.client_key("/path/to/client-key.pem");
        assert!(validate_tls_config(SslMode::VerifyCa, &mtls).is_ok());
    }

    #[test]
    fn test_upgrade_rejects_non_tcp_stream() {
        let cx = Cx::for_testing();
        let scripted = Stream::Scripted(crate::transport::scripted::ScriptedTransport::new());
        let err = crate::session::tests::run(upgrade(
            &cx,
            &CloseHandle::new(),
            scripted,
            &TlsConfig::new(),
            "localhost",
            SslMode::Required,
        ))
        .unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }
}
