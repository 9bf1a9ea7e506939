//! Intercept listener: the client-facing proxy.
//!
//! Per connection: read the proxy request, answer `CONNECT`, capture the ClientHello bytes
//! verbatim into the registry, terminate TLS with a leaf from the local CA, then relay the
//! decrypted stream to the inspector through its own `CONNECT` + TLS.

use crate::certs::CertificateAuthority;
use crate::listener::{bind, spawn_accept_loop, ListenerHandle};
use crate::proxy::{connect_tunnel, read_head};
use crate::tls::connect_inspector;
use crate::transport::{boxed, dial, relay, split_authority, PrefixedStream};
use bytes::BytesMut;
use mimic_traits::{HandshakeDescription, MimicError, Result, Timeouts};
use mod_fingerprint::hello::{self, RECORD_TYPE_HANDSHAKE};
use mod_registry::FingerprintRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Upper bound on buffered ClientHello bytes (a hello fits in a few records).
const MAX_HELLO_BYTES: usize = 64 * 1024;

pub struct InterceptProxy {
    inspector_host: String,
    inspector_port: u16,
    timeouts: Timeouts,
    registry: Arc<FingerprintRegistry>,
    ca: Arc<CertificateAuthority>,
}

/// Validates an inspector address (`[host]:port`, host defaults to loopback).
pub fn parse_inspector_addr(addr: &str) -> Result<(String, u16)> {
    let addr = addr.trim();
    let invalid = || MimicError::Configuration(format!("invalid inspector address {addr:?}"));
    if !addr.contains(':') {
        return Err(invalid());
    }
    let (host, port) = split_authority(addr, 0).ok_or_else(invalid)?;
    if port == 0 {
        return Err(invalid());
    }
    let host = if host.is_empty() { "127.0.0.1".to_string() } else { host };
    Ok((host, port))
}

impl InterceptProxy {
    pub fn new(
        inspector_addr: &str,
        timeouts: Timeouts,
        registry: Arc<FingerprintRegistry>,
        ca: Arc<CertificateAuthority>,
    ) -> Result<Self> {
        let (inspector_host, inspector_port) = parse_inspector_addr(inspector_addr)?;
        Ok(Self {
            inspector_host,
            inspector_port,
            timeouts,
            registry,
            ca,
        })
    }

    /// Binds `listen_addr` before returning, then serves in the background.
    pub async fn start(self, listen_addr: &str) -> Result<ListenerHandle> {
        let listener = bind(listen_addr).await?;
        let proxy = Arc::new(self);
        info!(
            inspector = %format!("{}:{}", proxy.inspector_host, proxy.inspector_port),
            "intercept proxy starting"
        );
        spawn_accept_loop("intercept", listener, move |stream, peer| {
            let proxy = Arc::clone(&proxy);
            async move {
                if let Err(e) = proxy.handle(stream, peer).await {
                    warn!(%peer, error = %e, "intercepted connection failed");
                }
            }
        })
    }

    async fn handle(&self, mut client: TcpStream, peer: SocketAddr) -> Result<()> {
        let head = tokio::time::timeout(self.timeouts.handshake, read_head(&mut client))
            .await
            .map_err(|_| MimicError::Timeout("proxy request"))??;
        let mut request_line = head.lines().next().unwrap_or_default().split_whitespace();
        let method = request_line.next().unwrap_or_default();
        let target = request_line.next().unwrap_or_default();

        if !method.eq_ignore_ascii_case("CONNECT") {
            debug!(%peer, method, target, "plain proxy request, forwarding");
            let mut inspector = self.dial_inspector().await?;
            inspector.write_all(head.as_bytes()).await?;
            relay(client, inspector, self.timeouts.idle).await?;
            return Ok(());
        }

        let (host, port) = split_authority(target, 443).ok_or_else(|| MimicError::Handshake {
            peer: peer.to_string(),
            reason: format!("invalid CONNECT target {target:?}"),
        })?;
        client
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;
        self.intercept_tunnel(client, peer, host, port).await
    }

    async fn intercept_tunnel(
        &self,
        mut client: TcpStream,
        peer: SocketAddr,
        host: String,
        port: u16,
    ) -> Result<()> {
        let (buffered, hello_len) =
            tokio::time::timeout(self.timeouts.handshake, read_client_hello(&mut client))
                .await
                .map_err(|_| MimicError::Timeout("client hello"))??;

        let Some(hello_len) = hello_len else {
            debug!(%peer, %host, port, "tunnel is not TLS, relaying untouched");
            let mut inspector = self.dial_inspector().await?;
            connect_tunnel(&mut inspector, &host, port).await?;
            inspector.write_all(&buffered).await?;
            relay(client, inspector, self.timeouts.idle).await?;
            return Ok(());
        };

        let description = HandshakeDescription::new(buffered[..hello_len].to_vec());
        let spec = hello::parse(&description);
        let server_name = spec
            .as_ref()
            .ok()
            .and_then(|s| s.server_name())
            .unwrap_or_else(|| host.clone());
        match &spec {
            Ok(spec) => {
                info!(%peer, %server_name, ja3 = %spec.ja3_string(), "captured client hello")
            }
            Err(e) => {
                warn!(%peer, %server_name, error = %e, "captured client hello does not parse")
            }
        }
        self.registry.record(&server_name, description);

        let acceptor = self.ca.acceptor_for(&server_name)?;
        let rewound = PrefixedStream::new(buffered.freeze(), client);
        let accept = tokio_boring::accept(&acceptor, rewound);
        let client_tls = tokio::time::timeout(self.timeouts.handshake, accept)
            .await
            .map_err(|_| MimicError::Timeout("client tls handshake"))?
            .map_err(|e| MimicError::Handshake {
                peer: peer.to_string(),
                reason: e.to_string(),
            })?;

        let mut inspector = self.dial_inspector().await?;
        connect_tunnel(&mut inspector, &host, port).await?;
        let inspector_tls =
            connect_inspector(&server_name, boxed(inspector), self.timeouts.handshake).await?;

        let (up, down) = relay(client_tls, inspector_tls, self.timeouts.idle).await?;
        debug!(%peer, %server_name, up, down, "tunnel closed");
        Ok(())
    }

    async fn dial_inspector(&self) -> Result<TcpStream> {
        dial(
            &self.inspector_host,
            self.inspector_port,
            self.timeouts.connect,
            self.timeouts.keep_alive,
        )
        .await
    }
}

/// Reads until a complete ClientHello is buffered.
///
/// Returns everything read plus the hello length, or `None` when the stream is not TLS
/// (the bytes are then passed through as they are).
async fn read_client_hello<R>(stream: &mut R) -> Result<(BytesMut, Option<usize>)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(MimicError::Handshake {
                peer: "client".into(),
                reason: "closed before sending a ClientHello".into(),
            });
        }
        if buf[0] != RECORD_TYPE_HANDSHAKE {
            return Ok((buf, None));
        }
        match hello::complete_hello_len(&buf) {
            Ok(Some(len)) => return Ok((buf, Some(len))),
            Ok(None) if buf.len() < MAX_HELLO_BYTES => continue,
            Ok(None) => {
                return Err(MimicError::Handshake {
                    peer: "client".into(),
                    reason: "ClientHello exceeds buffer limit".into(),
                })
            }
            Err(e) => {
                debug!(error = %e, "handshake prefix is not a ClientHello");
                return Ok((buf, None));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inspector_addresses() {
        assert_eq!(parse_inspector_addr("127.0.0.1:8080").unwrap(), ("127.0.0.1".into(), 8080));
        assert_eq!(parse_inspector_addr(":8080").unwrap(), ("127.0.0.1".into(), 8080));
        assert!(matches!(parse_inspector_addr("burp"), Err(MimicError::Configuration(_))));
        assert!(matches!(parse_inspector_addr("host:0"), Err(MimicError::Configuration(_))));
        assert!(matches!(parse_inspector_addr("host:port"), Err(MimicError::Configuration(_))));
    }

    #[tokio::test]
    async fn hello_split_across_reads_is_reassembled() {
        let record = mod_fingerprint::NamedProfile::Chrome120.spec().encode();
        let bytes = record.as_bytes().to_vec();
        let (mut writer, mut reader) = tokio::io::duplex(16);
        let expected = bytes.clone();
        tokio::spawn(async move {
            for chunk in bytes.chunks(7) {
                writer.write_all(chunk).await.unwrap();
            }
            writer.write_all(b"tail").await.unwrap();
        });

        let (buf, len) = read_client_hello(&mut reader).await.unwrap();
        assert_eq!(len, Some(expected.len()));
        assert_eq!(&buf[..expected.len()], &expected[..]);
    }

    #[tokio::test]
    async fn non_tls_tunnel_is_detected() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        writer.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let (buf, len) = read_client_hello(&mut reader).await.unwrap();
        assert_eq!(len, None);
        assert!(buf.starts_with(b"GET"));
    }
}
