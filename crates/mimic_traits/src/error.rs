use thiserror::Error;

/// Position and cause of a failure while decoding a literal handshake description.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed client hello at byte {offset}: {reason}")]
pub struct ParseError {
    pub offset: usize,
    pub reason: String,
}

impl ParseError {
    pub fn new(offset: usize, reason: impl Into<String>) -> Self {
        Self {
            offset,
            reason: reason.into(),
        }
    }
}

/// Error taxonomy shared by every proxy component.
///
/// Configuration and build errors are returned to whoever triggered the
/// operation. Handshake and relay errors belong to a single connection and are
/// only ever logged by the listeners.
#[derive(Debug, Error)]
pub enum MimicError {
    /// Missing or malformed transport configuration document.
    #[error("{0}")]
    Configuration(String),

    #[error("unknown fingerprint profile: {0}")]
    UnknownProfile(String),

    #[error(transparent)]
    Parse(#[from] ParseError),

    /// A literal handshake description could not be turned into a TLS client configuration.
    #[error("create spec from client hello: {0}")]
    SpecBuild(String),

    #[error("listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tls handshake with {peer} failed: {reason}")]
    Handshake { peer: String, reason: String },

    #[error("relay i/o: {0}")]
    RelayIo(#[from] std::io::Error),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("certificate: {0}")]
    Certificate(String),
}

pub type Result<T> = std::result::Result<T, MimicError>;
