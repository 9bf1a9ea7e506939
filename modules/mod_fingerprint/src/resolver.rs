use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mimic_traits::{FingerprintLookup, HandshakeDescription, MimicError, TransportConfig};
use tracing::{debug, warn};

use crate::hello::{self, ClientHelloSpec};
use crate::profiles::NamedProfile;

/// Identity of the handshake being replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientHelloId {
    Named(NamedProfile),
    /// Literal layout supplied by the operator or captured from a client.
    Custom,
}

impl ClientHelloId {
    pub fn label(&self) -> &'static str {
        match self {
            ClientHelloId::Named(profile) => profile.label(),
            ClientHelloId::Custom => "Custom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloSource {
    Named,
    Literal,
    Captured,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedHello {
    pub id: ClientHelloId,
    pub spec: Arc<ClientHelloSpec>,
    pub source: HelloSource,
}

/// Resolves the configured profile, ignoring any captured fingerprint.
///
/// A non-empty `HexClientHello` wins over `Fingerprint`.
pub fn resolve_static(config: &TransportConfig) -> Result<ResolvedHello, MimicError> {
    if config.has_literal_hello() {
        let description = HandshakeDescription::from_hex(&config.hex_client_hello)?;
        let spec = hello::parse(&description)?;
        return Ok(ResolvedHello {
            id: ClientHelloId::Custom,
            spec: Arc::new(spec),
            source: HelloSource::Literal,
        });
    }

    let profile = NamedProfile::from_name(&config.fingerprint)
        .ok_or_else(|| MimicError::UnknownProfile(config.fingerprint.clone()))?;
    Ok(ResolvedHello {
        id: ClientHelloId::Named(profile),
        spec: Arc::new(profile.spec()),
        source: HelloSource::Named,
    })
}

/// Per-connection resolver: the static profile, optionally overridden by the
/// fingerprint captured for the server name being dialed.
pub struct ProfileResolver {
    configured: ResolvedHello,
    use_intercepted: bool,
    lookup: FingerprintLookup,
    fallbacks: AtomicU64,
}

impl ProfileResolver {
    pub fn new(config: &TransportConfig, lookup: FingerprintLookup) -> Result<Self, MimicError> {
        Ok(Self {
            configured: resolve_static(config)?,
            use_intercepted: config.use_intercepted_fingerprint,
            lookup,
            fallbacks: AtomicU64::new(0),
        })
    }

    pub fn configured(&self) -> &ResolvedHello {
        &self.configured
    }

    /// Called when a TLS connection to `server_name` is about to be established.
    ///
    /// Never fails: an unusable capture falls back to the configured profile.
    pub fn resolve(&self, server_name: &str) -> ResolvedHello {
        if !self.use_intercepted {
            return self.configured.clone();
        }

        let captured = match (self.lookup)(server_name) {
            Some(captured) if !captured.is_empty() => captured,
            _ => return self.configured.clone(),
        };

        match hello::parse(&captured) {
            Ok(spec) => {
                debug!(server_name, ja3 = %spec.ja3_string(), "using intercepted fingerprint");
                ResolvedHello {
                    id: ClientHelloId::Custom,
                    spec: Arc::new(spec),
                    source: HelloSource::Captured,
                }
            }
            Err(e) => {
                let total = self.record_fallback();
                warn!(
                    server_name,
                    error = %e,
                    fallbacks = total,
                    "intercepted fingerprint unusable, falling back to {}",
                    self.configured.id.label()
                );
                self.configured.clone()
            }
        }
    }

    /// Counts a captured spec that parsed but could not be used by the TLS stack.
    pub fn record_fallback(&self) -> u64 {
        self.fallbacks.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Number of times an intercepted fingerprint was rejected in favour of the configured one.
    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }
}
