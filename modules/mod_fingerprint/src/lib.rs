//! ClientHello fingerprints: the wire parser, the canned browser profiles and
//! the per-connection resolver that decides which one is replayed.

pub mod hello;
pub mod profiles;
pub mod resolver;
pub mod tuning;

pub use hello::{complete_hello_len, parse, ClientHelloSpec, Extension, HelloLayout};
pub use profiles::NamedProfile;
pub use resolver::{resolve_static, ClientHelloId, HelloSource, ProfileResolver, ResolvedHello};
pub use tuning::Http2Tuning;
