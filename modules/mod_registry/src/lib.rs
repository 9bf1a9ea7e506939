use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mimic_traits::{FingerprintLookup, HandshakeDescription};
use std::sync::Arc;
use tracing::debug;

/// A ClientHello as read off the wire, with the moment it was seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFingerprint {
    pub description: HandshakeDescription,
    pub captured_at: DateTime<Utc>,
}

/// Sharded map of destination server name -> most recent ClientHello seen for it.
///
/// Entries are value copies and live until [`FingerprintRegistry::clear`]. Different clients
/// talking to the same host overwrite each other; the last writer wins.
#[derive(Default)]
pub struct FingerprintRegistry {
    captures: DashMap<String, CapturedFingerprint>,
}

/// SNI comparison is case-insensitive and ignores a trailing root dot.
pub fn normalize_key(server_name: &str) -> String {
    server_name.trim_end_matches('.').to_ascii_lowercase()
}

impl FingerprintRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, server_name: &str, description: HandshakeDescription) {
        let key = normalize_key(server_name);
        debug!(server_name = %key, bytes = description.len(), "recorded client hello");
        self.captures.insert(
            key,
            CapturedFingerprint {
                description,
                captured_at: Utc::now(),
            },
        );
    }

    pub fn lookup(&self, server_name: &str) -> Option<HandshakeDescription> {
        self.entry(server_name).map(|captured| captured.description)
    }

    pub fn entry(&self, server_name: &str) -> Option<CapturedFingerprint> {
        self.captures
            .get(&normalize_key(server_name))
            .map(|val| val.value().clone())
    }

    pub fn len(&self) -> usize {
        self.captures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.captures.is_empty()
    }

    pub fn clear(&self) {
        self.captures.clear();
    }

    /// The lookup handed to egress clients.
    pub fn lookup_fn(self: &Arc<Self>) -> FingerprintLookup {
        let registry = Arc::clone(self);
        Arc::new(move |server_name: &str| registry.lookup(server_name))
    }
}
