//! # TLS Transport Security
//!
//! Purpose: Build the rustls client configuration from a `TlsPolicy`, run the
//! handshake eagerly, and verify the server's identity by certificate Common
//! Name.
//!
//! ## Design Principles
//! 1. **Fail Closed**: A missing expected name, a missing Common Name, or a
//!    mismatch all reject the connection.
//! 2. **Portable Comparison**: Certificate parsing sits behind `PeerIdentity`;
//!    `verify_peer_name` is plain string logic and unit-testable alone.
//! 3. **Build Once**: `TlsConnector` is built from the policy once and shared
//!    by every connection to every node.

use std::fmt;
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore,
    SignatureScheme, StreamOwned, SupportedCipherSuite, SupportedProtocolVersion,
};
use rustls_pki_types::pem::PemObject;
use serde::{Deserialize, Serialize};
use tkv_common::{ClientError, ClientResult};

/// Encrypted stream type produced by a completed handshake.
pub type TlsStream = StreamOwned<ClientConnection, TcpStream>;

/// Transport security policy for node connections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsPolicy {
    /// Allowed protocol versions, e.g. `["TLSv1.2", "TLSv1.3"]`. `None` allows all.
    pub protocols: Option<Vec<String>>,
    /// Allowed cipher suites by IANA name. `None` allows all.
    pub ciphers: Option<Vec<String>>,
    /// Encrypt without verifying the server's name.
    pub encrypt_only: bool,
    /// PEM bundle of trusted root certificates.
    pub ca_file: Option<PathBuf>,
    /// Trusted roots supplied in memory (DER).
    #[serde(skip)]
    pub root_certificates: Vec<CertificateDer<'static>>,
}

/// Extracts the identity a server presents in its leaf certificate.
pub trait PeerIdentity: Send + Sync {
    /// Returns the subject Common Name of a DER certificate, if any.
    fn common_name(&self, end_entity: &[u8]) -> ClientResult<Option<String>>;
}

/// `PeerIdentity` backed by an X.509 parser.
#[derive(Debug, Clone, Copy, Default)]
pub struct X509Identity;

impl PeerIdentity for X509Identity {
    fn common_name(&self, end_entity: &[u8]) -> ClientResult<Option<String>> {
        let (_, cert) = x509_parser::parse_x509_certificate(end_entity).map_err(|err| {
            ClientError::SecurityValidation(format!("unparseable certificate: {:?}", err))
        })?;
        let attr = match cert.subject().iter_common_name().next() {
            Some(attr) => attr,
            None => return Ok(None),
        };
        let value = attr.attr_value();
        let name = match value.tag().0 {
            TAG_BMP_STRING | TAG_UNIVERSAL_STRING => decode_wide_string(value.tag().0, value.data),
            _ => attr.as_str().ok().map(str::to_string),
        };
        name.map(Some).ok_or_else(|| {
            ClientError::SecurityValidation("common name is not a string".to_string())
        })
    }
}

const TAG_UNIVERSAL_STRING: u32 = 28;
const TAG_BMP_STRING: u32 = 30;

// BMPString is UCS-2 big endian, UniversalString is UCS-4 big endian.
fn decode_wide_string(tag: u32, bytes: &[u8]) -> Option<String> {
    match tag {
        TAG_BMP_STRING => {
            if bytes.len() % 2 != 0 {
                return None;
            }
            let units = bytes.chunks_exact(2).map(|pair| u16::from_be_bytes([pair[0], pair[1]]));
            char::decode_utf16(units).collect::<Result<String, _>>().ok()
        }
        TAG_UNIVERSAL_STRING => {
            if bytes.len() % 4 != 0 {
                return None;
            }
            bytes
                .chunks_exact(4)
                .map(|quad| char::from_u32(u32::from_be_bytes([quad[0], quad[1], quad[2], quad[3]])))
                .collect()
        }
        _ => None,
    }
}

/// Compares the presented Common Name with the expected name.
///
/// The comparison is exact and case sensitive. Either side being absent is
/// a failure.
pub fn verify_peer_name(common_name: Option<&str>, expected: Option<&str>) -> ClientResult<()> {
    match (common_name, expected) {
        (Some(presented), Some(expected)) if presented == expected => Ok(()),
        (Some(presented), _) => Err(ClientError::SecurityValidation(presented.to_string())),
        (None, _) => Err(ClientError::SecurityValidation("null".to_string())),
    }
}

/// Reusable TLS client side: rustls config plus identity policy.
#[derive(Clone)]
pub struct TlsConnector {
    config: Arc<ClientConfig>,
    encrypt_only: bool,
    identity: Arc<dyn PeerIdentity>,
}

impl fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnector")
            .field("encrypt_only", &self.encrypt_only)
            .finish()
    }
}

impl TlsConnector {
    /// Builds a connector from the policy.
    pub fn new(policy: &TlsPolicy) -> ClientResult<Self> {
        let base = ring::default_provider();
        let cipher_suites = match &policy.ciphers {
            Some(names) => select_cipher_suites(&base.cipher_suites, names)?,
            None => base.cipher_suites.clone(),
        };
        let provider = Arc::new(CryptoProvider {
            cipher_suites,
            ..base
        });
        let versions = select_protocol_versions(policy.protocols.as_deref())?;
        let roots = Arc::new(load_roots(policy)?);

        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&versions)
            .map_err(|err| ClientError::ConnectionSetup(format!("TLS policy rejected: {}", err)))?;

        // Names are checked against the certificate Common Name after the
        // handshake, not by the verifier.
        let inner = WebPkiServerVerifier::builder_with_provider(roots, provider)
            .build()
            .map_err(|err| ClientError::ConnectionSetup(format!("TLS verifier: {}", err)))?;
        let config = builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(ChainOnlyVerifier { inner }))
            .with_no_client_auth();

        Ok(TlsConnector {
            config: Arc::new(config),
            encrypt_only: policy.encrypt_only,
            identity: Arc::new(X509Identity),
        })
    }

    /// Replaces the certificate identity extractor.
    pub fn with_identity(mut self, identity: Arc<dyn PeerIdentity>) -> Self {
        self.identity = identity;
        self
    }

    /// Runs the handshake over `stream` and validates the server identity.
    ///
    /// On error the stream is dropped, which closes the socket.
    pub fn handshake(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        tls_name: Option<&str>,
    ) -> ClientResult<TlsStream> {
        if !self.encrypt_only && tls_name.is_none() {
            return Err(ClientError::SecurityValidation("null".to_string()));
        }

        // The name only feeds SNI; identity is decided by the Common Name
        // check below, so names that are not valid DNS names fall back to
        // the peer address.
        let server_name = tls_name
            .and_then(|name| ServerName::try_from(name).ok())
            .map(|name| name.to_owned())
            .unwrap_or_else(|| ServerName::from(addr.ip()));

        let conn = ClientConnection::new(self.config.clone(), server_name)
            .map_err(|err| ClientError::ConnectionSetup(format!("TLS session: {}", err)))?;
        let mut tls = StreamOwned::new(conn, stream);
        while tls.conn.is_handshaking() {
            tls.conn
                .complete_io(&mut tls.sock)
                .map_err(|err| ClientError::ConnectionSetup(format!("TLS handshake: {}", err)))?;
        }

        if !self.encrypt_only {
            let cert = tls
                .conn
                .peer_certificates()
                .and_then(|chain| chain.first())
                .ok_or_else(|| ClientError::SecurityValidation("null".to_string()))?;
            let common_name = self.identity.common_name(cert.as_ref())?;
            verify_peer_name(common_name.as_deref(), tls_name)?;
        }

        Ok(tls)
    }
}

fn select_protocol_versions(
    names: Option<&[String]>,
) -> ClientResult<Vec<&'static SupportedProtocolVersion>> {
    let names = match names {
        Some(names) => names,
        None => return Ok(rustls::ALL_VERSIONS.to_vec()),
    };

    let mut versions = Vec::with_capacity(names.len());
    for name in names {
        let version = match name.as_str() {
            "TLSv1.2" => &rustls::version::TLS12,
            "TLSv1.3" => &rustls::version::TLS13,
            other => {
                return Err(ClientError::ConnectionSetup(format!(
                    "unsupported TLS protocol {}",
                    other
                )))
            }
        };
        versions.push(version);
    }
    if versions.is_empty() {
        return Err(ClientError::ConnectionSetup("empty TLS protocol list".to_string()));
    }
    Ok(versions)
}

fn select_cipher_suites(
    available: &[SupportedCipherSuite],
    names: &[String],
) -> ClientResult<Vec<SupportedCipherSuite>> {
    let mut selected = Vec::with_capacity(names.len());
    for name in names {
        let suite = available
            .iter()
            .find(|suite| cipher_suite_name(suite) == normalize_cipher_name(name))
            .ok_or_else(|| {
                ClientError::ConnectionSetup(format!("unsupported TLS cipher suite {}", name))
            })?;
        selected.push(*suite);
    }
    if selected.is_empty() {
        return Err(ClientError::ConnectionSetup("empty TLS cipher list".to_string()));
    }
    Ok(selected)
}

// rustls spells TLS 1.3 suites "TLS13_*"; IANA spells them "TLS_*".
fn cipher_suite_name(suite: &SupportedCipherSuite) -> String {
    normalize_cipher_name(&format!("{:?}", suite.suite()))
}

fn normalize_cipher_name(name: &str) -> String {
    match name.strip_prefix("TLS13_") {
        Some(rest) => format!("TLS_{}", rest),
        None => name.to_string(),
    }
}

fn load_roots(policy: &TlsPolicy) -> ClientResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in &policy.root_certificates {
        roots
            .add(cert.clone())
            .map_err(|err| ClientError::ConnectionSetup(format!("invalid root certificate: {}", err)))?;
    }

    if let Some(path) = &policy.ca_file {
        let certs = CertificateDer::pem_file_iter(path).map_err(|err| {
            ClientError::ConnectionSetup(format!("failed to read {}: {:?}", path.display(), err))
        })?;
        for cert in certs {
            let cert = cert.map_err(|err| {
                ClientError::ConnectionSetup(format!("invalid PEM in {}: {:?}", path.display(), err))
            })?;
            roots.add(cert).map_err(|err| {
                ClientError::ConnectionSetup(format!("invalid root certificate: {}", err))
            })?;
        }
    }

    if roots.is_empty() {
        return Err(ClientError::ConnectionSetup(
            "no trusted root certificates configured".to_string(),
        ));
    }
    Ok(roots)
}

/// Verifies the certificate chain but accepts any server name.
#[derive(Debug)]
struct ChainOnlyVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

fn is_name_mismatch(err: &CertificateError) -> bool {
    matches!(
        err,
        CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. }
    )
}

impl ServerCertVerifier for ChainOnlyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(rustls::Error::InvalidCertificate(err)) if is_name_mismatch(&err) => {
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_peer_name_matches_exactly() {
        assert!(verify_peer_name(Some("node-A"), Some("node-A")).is_ok());
    }

    #[test]
    fn test_verify_peer_name_rejects_mismatch() {
        let err = verify_peer_name(Some("node-A"), Some("node-B")).unwrap_err();
        assert!(matches!(err, ClientError::SecurityValidation(ref name) if name == "node-A"));
    }

    #[test]
    fn test_verify_peer_name_is_case_sensitive() {
        assert!(verify_peer_name(Some("Node-A"), Some("node-A")).is_err());
    }

    #[test]
    fn test_verify_peer_name_fails_closed() {
        assert!(verify_peer_name(None, Some("node-A")).is_err());
        assert!(verify_peer_name(Some("node-A"), None).is_err());
        assert!(verify_peer_name(None, None).is_err());
    }

    #[test]
    fn test_protocol_selection() {
        let all = select_protocol_versions(None).unwrap();
        assert_eq!(all.len(), rustls::ALL_VERSIONS.len());

        let only13 = select_protocol_versions(Some(&["TLSv1.3".to_string()])).unwrap();
        assert_eq!(only13.len(), 1);

        assert!(select_protocol_versions(Some(&["SSLv3".to_string()])).is_err());
        assert!(select_protocol_versions(Some(&[])).is_err());
    }

    #[test]
    fn test_cipher_selection_accepts_iana_names() {
        let available = ring::default_provider().cipher_suites;
        let selected =
            select_cipher_suites(&available, &["TLS_AES_128_GCM_SHA256".to_string()]).unwrap();
        assert_eq!(selected.len(), 1);

        assert!(select_cipher_suites(&available, &["TLS_NULL_WITH_NULL_NULL".to_string()]).is_err());
    }

    #[test]
    fn test_connector_requires_roots() {
        let err = TlsConnector::new(&TlsPolicy::default()).unwrap_err();
        assert!(matches!(err, ClientError::ConnectionSetup(_)));
    }

    #[test]
    fn test_decode_wide_strings() {
        let bmp: Vec<u8> = "node A".encode_utf16().flat_map(u16::to_be_bytes).collect();
        assert_eq!(decode_wide_string(TAG_BMP_STRING, &bmp).as_deref(), Some("node A"));
        assert_eq!(decode_wide_string(TAG_BMP_STRING, &bmp[..3]), None);

        let universal: Vec<u8> = "nöde".chars().flat_map(|c| (c as u32).to_be_bytes()).collect();
        assert_eq!(decode_wide_string(TAG_UNIVERSAL_STRING, &universal).as_deref(), Some("nöde"));
        assert_eq!(decode_wide_string(TAG_UNIVERSAL_STRING, &[0, 0x11, 0, 0]), None);
    }

    #[test]
    fn test_x509_identity_reads_bmp_common_name() {
        use rcgen::{BmpString, CertificateParams, DistinguishedName, DnType, DnValue, KeyPair};

        let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        let mut name = DistinguishedName::new();
        name.push(
            DnType::CommonName,
            DnValue::BmpString(BmpString::try_from("TideKV Node").unwrap()),
        );
        params.distinguished_name = name;
        let key_pair = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();

        let common_name = X509Identity.common_name(cert.der().as_ref()).unwrap();
        assert_eq!(common_name.as_deref(), Some("TideKV Node"));
    }

    #[test]
    fn test_x509_identity_rejects_garbage() {
        assert!(X509Identity.common_name(b"not a certificate").is_err());
    }
}
