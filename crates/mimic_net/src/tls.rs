//! Client-side TLS: replays a [`ClientHelloSpec`] through BoringSSL.
//!
//! BoringSSL exposes most of what shapes a fingerprint (cipher order, groups, signature
//! algorithms, ALPN, versions, GREASE, stapling, SCT, tickets, extension permutation) but not
//! an arbitrary extension order, nor the TLS 1.3 suite order. Those two follow BoringSSL's own
//! layout; everything else is taken from the spec.

use crate::transport::{boxed, MimicStream};
use async_trait::async_trait;
use boring::error::ErrorStack;
use boring::ssl::{
    SslConnector, SslConnectorBuilder, SslMethod, SslOptions, SslSignatureAlgorithm, SslVerifyMode,
    SslVersion,
};
use boring::x509::X509;
use dashmap::DashMap;
use mimic_traits::{MimicError, Result};
use mod_fingerprint::hello::{
    ext, is_grease, ClientHelloSpec, HelloLayout, TLS1_0, TLS1_1, TLS1_2, TLS1_3,
};
use std::time::Duration;
use tracing::{debug, trace};

/// An established TLS session plus what ALPN settled on.
pub struct TlsSession {
    pub stream: MimicStream,
    pub alpn: Option<Vec<u8>>,
}

impl TlsSession {
    pub fn is_h2(&self) -> bool {
        self.alpn.as_deref() == Some(b"h2")
    }
}

#[async_trait]
pub trait TlsImpersonator: Send + Sync {
    /// Checks that `spec` can be expressed, so that a bad layout fails before any I/O.
    fn prepare(&self, spec: &ClientHelloSpec) -> Result<()>;

    /// Handshakes `stream` presenting `spec`, bounded by `timeout`.
    async fn handshake(
        &self,
        server_name: &str,
        stream: MimicStream,
        spec: &ClientHelloSpec,
        timeout: Duration,
    ) -> Result<TlsSession>;
}

fn spec_build(e: ErrorStack) -> MimicError {
    MimicError::SpecBuild(e.to_string())
}

fn cipher_name(suite: u16) -> Option<&'static str> {
    Some(match suite {
        0x000a => "DES-CBC3-SHA",
        0x002f => "AES128-SHA",
        0x0035 => "AES256-SHA",
        0x009c => "AES128-GCM-SHA256",
        0x009d => "AES256-GCM-SHA384",
        0xc009 => "ECDHE-ECDSA-AES128-SHA",
        0xc00a => "ECDHE-ECDSA-AES256-SHA",
        0xc013 => "ECDHE-RSA-AES128-SHA",
        0xc014 => "ECDHE-RSA-AES256-SHA",
        0xc027 => "ECDHE-RSA-AES128-SHA256",
        0xc02b => "ECDHE-ECDSA-AES128-GCM-SHA256",
        0xc02c => "ECDHE-ECDSA-AES256-GCM-SHA384",
        0xc02f => "ECDHE-RSA-AES128-GCM-SHA256",
        0xc030 => "ECDHE-RSA-AES256-GCM-SHA384",
        0xcca8 => "ECDHE-RSA-CHACHA20-POLY1305",
        0xcca9 => "ECDHE-ECDSA-CHACHA20-POLY1305",
        _ => return None,
    })
}

fn is_tls13_suite(suite: u16) -> bool {
    matches!(suite, 0x1301..=0x1303)
}

fn curve_name(group: u16) -> Option<&'static str> {
    Some(match group {
        0x001d => "X25519",
        0x0017 => "P-256",
        0x0018 => "P-384",
        0x0019 => "P-521",
        _ => return None,
    })
}

fn signature_algorithm(alg: u16) -> Option<SslSignatureAlgorithm> {
    Some(match alg {
        0x0201 => SslSignatureAlgorithm::RSA_PKCS1_SHA1,
        0x0203 => SslSignatureAlgorithm::ECDSA_SHA1,
        0x0401 => SslSignatureAlgorithm::RSA_PKCS1_SHA256,
        0x0501 => SslSignatureAlgorithm::RSA_PKCS1_SHA384,
        0x0601 => SslSignatureAlgorithm::RSA_PKCS1_SHA512,
        0x0403 => SslSignatureAlgorithm::ECDSA_SECP256R1_SHA256,
        0x0503 => SslSignatureAlgorithm::ECDSA_SECP384R1_SHA384,
        0x0603 => SslSignatureAlgorithm::ECDSA_SECP521R1_SHA512,
        0x0804 => SslSignatureAlgorithm::RSA_PSS_RSAE_SHA256,
        0x0805 => SslSignatureAlgorithm::RSA_PSS_RSAE_SHA384,
        0x0806 => SslSignatureAlgorithm::RSA_PSS_RSAE_SHA512,
        0x0807 => SslSignatureAlgorithm::ED25519,
        _ => return None,
    })
}

fn ssl_version(version: u16) -> Option<SslVersion> {
    Some(match version {
        TLS1_0 => SslVersion::TLS1,
        TLS1_1 => SslVersion::TLS1_1,
        TLS1_2 => SslVersion::TLS1_2,
        TLS1_3 => SslVersion::TLS1_3,
        _ => return None,
    })
}

/// ALPN protocol list in wire format (length-prefixed).
pub fn alpn_wire<S: AsRef<str>>(protocols: &[S]) -> Vec<u8> {
    let mut wire = Vec::new();
    for proto in protocols {
        let bytes = proto.as_ref().as_bytes();
        if bytes.is_empty() || bytes.len() > 255 {
            continue;
        }
        wire.push(bytes.len() as u8);
        wire.extend_from_slice(bytes);
    }
    wire
}

/// OpenSSL-style cipher string for the TLS 1.2 suites of `spec`.
/// Unknown ids and GREASE are skipped.
pub fn cipher_list(spec: &ClientHelloSpec) -> String {
    spec.cipher_suites
        .iter()
        .filter(|&&c| !is_grease(c))
        .filter_map(|&c| cipher_name(c))
        .collect::<Vec<_>>()
        .join(":")
}

/// Applies `spec` to a connector builder.
pub fn apply_spec(builder: &mut SslConnectorBuilder, spec: &ClientHelloSpec) -> Result<()> {
    let ciphers = cipher_list(spec);
    let offers_tls13 =
        spec.max_version() >= TLS1_3 && spec.cipher_suites.iter().any(|&c| is_tls13_suite(c));
    if ciphers.is_empty() && !offers_tls13 {
        return Err(MimicError::SpecBuild("no supported cipher suites".into()));
    }
    if !ciphers.is_empty() {
        builder.set_cipher_list(&ciphers).map_err(spec_build)?;
    }

    let curves: Vec<&str> = spec
        .supported_groups
        .iter()
        .filter_map(|&g| curve_name(g))
        .collect();
    if !curves.is_empty() {
        builder.set_curves_list(&curves.join(":")).map_err(spec_build)?;
    }

    let sigalgs: Vec<SslSignatureAlgorithm> = spec
        .signature_algorithms
        .iter()
        .filter_map(|&a| signature_algorithm(a))
        .collect();
    if !sigalgs.is_empty() {
        builder.set_verify_algorithm_prefs(&sigalgs).map_err(spec_build)?;
    }

    let alpn = alpn_wire(&spec.alpn_protocols);
    if !alpn.is_empty() {
        builder.set_alpn_protos(&alpn).map_err(spec_build)?;
    }

    builder
        .set_min_proto_version(ssl_version(spec.min_version()))
        .map_err(spec_build)?;
    builder
        .set_max_proto_version(ssl_version(spec.max_version()))
        .map_err(spec_build)?;

    builder.set_grease_enabled(spec.uses_grease());
    builder.set_permute_extensions(spec.permute_extensions);
    if spec.has_extension(ext::STATUS_REQUEST) {
        builder.enable_ocsp_stapling();
    }
    if spec.has_extension(ext::SIGNED_CERT_TIMESTAMP) {
        builder.enable_signed_cert_timestamps();
    }
    if !spec.has_extension(ext::SESSION_TICKET) {
        builder.set_options(SslOptions::NO_TICKET);
    }
    Ok(())
}

/// Distinct client stacks seen in practice are few; past this the cache starts over.
const MAX_CACHED_CONNECTORS: usize = 256;

/// BoringSSL implementation with one connector cached per hello layout.
pub struct BoringImpersonator {
    extra_roots: Vec<X509>,
    verify: bool,
    connectors: DashMap<HelloLayout, SslConnector>,
}

impl Default for BoringImpersonator {
    fn default() -> Self {
        Self::new()
    }
}

impl BoringImpersonator {
    /// Verifies origins against the system trust store.
    pub fn new() -> Self {
        Self {
            extra_roots: Vec::new(),
            verify: true,
            connectors: DashMap::new(),
        }
    }

    /// Additionally trusts `roots`, e.g. a private CA in front of test origins.
    pub fn with_roots(roots: Vec<X509>) -> Self {
        Self {
            extra_roots: roots,
            ..Self::new()
        }
    }

    /// Skips certificate verification entirely.
    pub fn insecure() -> Self {
        Self {
            verify: false,
            ..Self::new()
        }
    }

    fn connector(&self, spec: &ClientHelloSpec) -> Result<SslConnector> {
        let layout = spec.layout();
        if let Some(connector) = self.connectors.get(&layout) {
            return Ok(connector.value().clone());
        }

        let mut builder = SslConnector::builder(SslMethod::tls()).map_err(spec_build)?;
        for root in &self.extra_roots {
            builder.cert_store_mut().add_cert(root.clone()).map_err(spec_build)?;
        }
        if !self.verify {
            builder.set_verify(SslVerifyMode::NONE);
        }
        apply_spec(&mut builder, spec)?;
        let connector = builder.build();

        trace!(ja3 = %spec.ja3_string(), "built connector");
        if self.connectors.len() >= MAX_CACHED_CONNECTORS {
            debug!(cached = self.connectors.len(), "connector cache full, clearing");
            self.connectors.clear();
        }
        self.connectors.insert(layout, connector.clone());
        Ok(connector)
    }

    pub fn cached_connectors(&self) -> usize {
        self.connectors.len()
    }
}

#[async_trait]
impl TlsImpersonator for BoringImpersonator {
    fn prepare(&self, spec: &ClientHelloSpec) -> Result<()> {
        self.connector(spec).map(|_| ())
    }

    async fn handshake(
        &self,
        server_name: &str,
        stream: MimicStream,
        spec: &ClientHelloSpec,
        timeout: Duration,
    ) -> Result<TlsSession> {
        let config = self.connector(spec)?.configure().map_err(spec_build)?;
        let tls = tokio::time::timeout(timeout, tokio_boring::connect(config, server_name, stream))
            .await
            .map_err(|_| MimicError::Timeout("tls handshake"))?
            .map_err(|e| MimicError::Handshake {
                peer: server_name.to_string(),
                reason: e.to_string(),
            })?;

        let alpn = tls.ssl().selected_alpn_protocol().map(|p| p.to_vec());
        debug!(
            server_name,
            alpn = alpn.as_deref().map(String::from_utf8_lossy).as_deref().unwrap_or("-"),
            "tls established"
        );
        Ok(TlsSession {
            stream: boxed(tls),
            alpn,
        })
    }
}

/// TLS towards the inspector: its certificate belongs to the operator and is not verified.
pub async fn connect_inspector(
    server_name: &str,
    stream: MimicStream,
    timeout: Duration,
) -> Result<MimicStream> {
    let mut builder = SslConnector::builder(SslMethod::tls())
        .map_err(|e| MimicError::Certificate(e.to_string()))?;
    builder.set_verify(SslVerifyMode::NONE);
    builder
        .set_alpn_protos(&alpn_wire(&["http/1.1"]))
        .map_err(|e| MimicError::Certificate(e.to_string()))?;
    let mut config = builder
        .build()
        .configure()
        .map_err(|e| MimicError::Certificate(e.to_string()))?;
    config.set_verify_hostname(false);

    let tls = tokio::time::timeout(timeout, tokio_boring::connect(config, server_name, stream))
        .await
        .map_err(|_| MimicError::Timeout("inspector tls handshake"))?
        .map_err(|e| MimicError::Handshake {
            peer: format!("inspector ({server_name})"),
            reason: e.to_string(),
        })?;
    Ok(boxed(tls))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mod_fingerprint::NamedProfile;
    use std::collections::HashSet;

    #[test]
    fn cipher_list_skips_grease_and_tls13() {
        let spec = ClientHelloSpec {
            cipher_suites: vec![0x0a0a, 0x1301, 0xc02b, 0xc02f, 0xffff],
            ..Default::default()
        };
        assert_eq!(cipher_list(&spec), "ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-GCM-SHA256");
    }

    #[test]
    fn alpn_wire_format() {
        assert_eq!(alpn_wire(&["h2", "http/1.1"]), b"\x02h2\x08http/1.1".to_vec());
        assert!(alpn_wire::<&str>(&[]).is_empty());
    }

    #[test]
    fn every_named_profile_builds() {
        let impersonator = BoringImpersonator::new();
        for profile in NamedProfile::ALL {
            impersonator
                .prepare(&profile.spec())
                .unwrap_or_else(|e| panic!("{}: {e}", profile.label()));
        }
        let layouts: HashSet<HelloLayout> =
            NamedProfile::ALL.iter().map(|p| p.spec().layout()).collect();
        assert_eq!(impersonator.cached_connectors(), layouts.len());

        impersonator.prepare(&NamedProfile::Chrome120.spec()).unwrap();
        assert_eq!(impersonator.cached_connectors(), layouts.len());
    }

    fn with_bodies(mut spec: ClientHelloSpec, key_byte: u8, host: &str) -> ClientHelloSpec {
        for extension in spec.extensions.iter_mut() {
            match extension.kind {
                ext::KEY_SHARE => {
                    let mut body = vec![0, 36, 0, 29, 0, 32];
                    body.extend_from_slice(&[key_byte; 32]);
                    extension.data = body.into();
                }
                ext::SERVER_NAME => extension.data = host.as_bytes().to_vec().into(),
                _ => {}
            }
        }
        spec
    }

    #[test]
    fn captures_from_one_client_share_a_connector() {
        let impersonator = BoringImpersonator::new();
        let base = NamedProfile::Chrome120.spec();
        for (i, host) in ["a.test", "b.test", "c.test"].iter().enumerate() {
            impersonator.prepare(&with_bodies(base.clone(), i as u8, host)).unwrap();
        }
        assert_eq!(impersonator.cached_connectors(), 1);

        impersonator.prepare(&NamedProfile::Firefox120.spec()).unwrap();
        assert_eq!(impersonator.cached_connectors(), 2);
    }

    #[test]
    fn spec_without_usable_ciphers_is_rejected() {
        let spec = ClientHelloSpec {
            cipher_suites: vec![0x0a0a, 0xffff],
            ..Default::default()
        };
        let err = BoringImpersonator::new().prepare(&spec).unwrap_err();
        assert!(matches!(err, MimicError::SpecBuild(_)));
    }
}
