//! Network layer: TLS impersonation, the local certificate authority, and the two
//! listeners (intercept and egress) sitting either side of the inspector.

pub mod certs;
pub mod client;
pub mod egress;
pub mod intercept;
pub mod listener;
pub mod proxy;
pub mod tls;
pub mod transport;

pub use certs::CertificateAuthority;
pub use client::{EgressClient, Target};
pub use egress::{
    start_egress, ClientCache, EgressServer, SettingsSource, LEGACY_TRANSPORT_HEADER,
    TRANSPORT_HEADER,
};
pub use intercept::InterceptProxy;
pub use listener::{ListenerHandle, DRAIN_GRACE};
pub use tls::{BoringImpersonator, TlsImpersonator};
