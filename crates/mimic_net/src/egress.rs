//! Egress listener: receives requests forwarded by the inspector and replays them to the
//! origin with the configured (or captured) fingerprint.
//!
//! The transport configuration comes from the `X-Mimic-Transport` header (or its older
//! `Awesometlsconfig` name) when present, otherwise from the saved settings. The listener
//! speaks plain HTTP, HTTP over TLS (leaf from the local CA), and `CONNECT` with TLS
//! termination so it can sit behind the inspector as its upstream proxy.

use crate::certs::CertificateAuthority;
use crate::client::{strip_hop_by_hop, EgressClient};
use crate::listener::{bind, spawn_accept_loop, ListenerHandle};
use crate::tls::TlsImpersonator;
use crate::transport::split_authority;
use dashmap::DashMap;
use hyper::header::{HeaderValue, HOST};
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Method, Request, Response, StatusCode};
use mimic_traits::{FingerprintLookup, MimicError, Result, TransportConfig};
use mod_fingerprint::hello::RECORD_TYPE_HANDSHAKE;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

pub const TRANSPORT_HEADER: &str = "x-mimic-transport";
/// Header name used by the existing inspector extension; same JSON document.
pub const LEGACY_TRANSPORT_HEADER: &str = "awesometlsconfig";

const MAX_CACHED_CLIENTS: usize = 64;

/// Where the egress listener reads the saved transport settings from.
pub trait SettingsSource: Send + Sync {
    fn transport(&self) -> TransportConfig;
}

impl SettingsSource for parking_lot::RwLock<TransportConfig> {
    fn transport(&self) -> TransportConfig {
        self.read().clone()
    }
}

struct CachedClient {
    client: EgressClient,
    last_used: Instant,
}

/// One [`EgressClient`] per distinct transport configuration.
///
/// Clients unused for their own idle timeout are dropped on the next insert, and the cache
/// never holds more than [`MAX_CACHED_CLIENTS`]; the least recently used goes first.
pub struct ClientCache {
    clients: DashMap<TransportConfig, CachedClient>,
    lookup: FingerprintLookup,
    tls: Arc<dyn TlsImpersonator>,
}

impl ClientCache {
    pub fn new(lookup: FingerprintLookup, tls: Arc<dyn TlsImpersonator>) -> Self {
        Self {
            clients: DashMap::new(),
            lookup,
            tls,
        }
    }

    pub fn get_or_build(&self, config: &TransportConfig) -> Result<EgressClient> {
        if let Some(mut cached) = self.clients.get_mut(config) {
            cached.last_used = Instant::now();
            return Ok(cached.client.clone());
        }
        let client =
            EgressClient::with_impersonator(config, self.lookup.clone(), Arc::clone(&self.tls))?;
        self.evict();
        self.clients.insert(
            config.clone(),
            CachedClient {
                client: client.clone(),
                last_used: Instant::now(),
            },
        );
        Ok(client)
    }

    fn evict(&self) {
        self.clients
            .retain(|_, cached| cached.last_used.elapsed() < cached.client.timeouts().idle);
        while self.clients.len() >= MAX_CACHED_CLIENTS {
            let oldest = self
                .clients
                .iter()
                .min_by_key(|entry| entry.last_used)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(key) => {
                    debug!(host = %key.host, "evicting least recently used egress client");
                    self.clients.remove(&key);
                }
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn clear(&self) {
        self.clients.clear();
    }
}

/// Origin reached through a `CONNECT` tunnel on this listener.
#[derive(Debug, Clone)]
struct Tunnel {
    host: String,
    port: u16,
}

impl Tunnel {
    fn authority(&self) -> String {
        if self.port == 443 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

pub struct EgressServer {
    settings: Arc<dyn SettingsSource>,
    clients: Arc<ClientCache>,
    ca: Arc<CertificateAuthority>,
}

type ServeFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn text_response(status: StatusCode, message: String) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;
    response
}

impl EgressServer {
    pub fn new(
        settings: Arc<dyn SettingsSource>,
        clients: Arc<ClientCache>,
        ca: Arc<CertificateAuthority>,
    ) -> Self {
        Self { settings, clients, ca }
    }

    /// Binds `listen_addr` before returning, then serves in the background.
    pub async fn start(self, listen_addr: &str) -> Result<ListenerHandle> {
        let listener = bind(listen_addr).await?;
        let server = Arc::new(self);
        spawn_accept_loop("egress", listener, move |stream, peer| {
            let server = Arc::clone(&server);
            async move { server.accept(stream, peer).await }
        })
    }

    fn handshake_timeout(&self) -> Duration {
        self.settings.transport().timeouts().handshake
    }

    /// Peers that stay silent, or stall mid-handshake, are dropped after the handshake timeout.
    async fn accept(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let handshake = self.handshake_timeout();
        let mut first = [0u8; 1];
        let is_tls = match timeout(handshake, stream.peek(&mut first)).await {
            Ok(peeked) => matches!(peeked, Ok(1) if first[0] == RECORD_TYPE_HANDSHAKE),
            Err(_) => {
                debug!(%peer, "no request before handshake timeout");
                return;
            }
        };
        if !is_tls {
            return self.serve(stream, None).await;
        }

        let name = stream
            .local_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|_| "localhost".to_string());
        let acceptor = match self.ca.acceptor_for(&name) {
            Ok(acceptor) => acceptor,
            Err(e) => {
                warn!(%peer, error = %e, "no certificate for egress listener");
                return;
            }
        };
        match timeout(handshake, tokio_boring::accept(&acceptor, stream)).await {
            Ok(Ok(tls)) => self.serve(tls, None).await,
            Ok(Err(e)) => debug!(%peer, error = %e, "egress tls handshake failed"),
            Err(_) => debug!(%peer, "egress tls handshake timed out"),
        }
    }

    fn serve<S>(self: Arc<Self>, io: S, tunnel: Option<Tunnel>) -> ServeFuture
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Box::pin(async move {
            let server = Arc::clone(&self);
            let service = service_fn(move |req| {
                let server = Arc::clone(&server);
                let tunnel = tunnel.clone();
                async move { Ok::<_, Infallible>(server.dispatch(req, tunnel).await) }
            });
            if let Err(e) = Http::new()
                .http1_only(true)
                .http1_header_read_timeout(self.handshake_timeout())
                .serve_connection(io, service)
                .with_upgrades()
                .await
            {
                debug!(error = %e, "egress connection closed");
            }
        })
    }

    async fn dispatch(
        self: Arc<Self>,
        req: Request<Body>,
        tunnel: Option<Tunnel>,
    ) -> Response<Body> {
        if req.method() == Method::CONNECT {
            return self.open_tunnel(req);
        }

        let method = req.method().clone();
        let uri = req.uri().clone();
        match self.forward(req, tunnel.as_ref()).await {
            Ok(response) => {
                debug!(%method, %uri, status = %response.status(), "forwarded");
                response
            }
            Err(
                e @ (MimicError::Configuration(_)
                | MimicError::UnknownProfile(_)
                | MimicError::SpecBuild(_)),
            ) => {
                warn!(%method, %uri, error = %e, "rejected request");
                text_response(StatusCode::BAD_REQUEST, e.to_string())
            }
            Err(e) => {
                warn!(%method, %uri, error = %e, "upstream request failed");
                text_response(StatusCode::BAD_GATEWAY, e.to_string())
            }
        }
    }

    fn open_tunnel(self: Arc<Self>, mut req: Request<Body>) -> Response<Body> {
        let Some((host, port)) = req
            .uri()
            .authority()
            .and_then(|a| split_authority(a.as_str(), 443))
        else {
            return text_response(StatusCode::BAD_REQUEST, "CONNECT needs host:port".to_string());
        };

        tokio::spawn(async move {
            let upgraded = match hyper::upgrade::on(&mut req).await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    debug!(%host, error = %e, "CONNECT upgrade failed");
                    return;
                }
            };
            let acceptor = match self.ca.acceptor_for(&host) {
                Ok(acceptor) => acceptor,
                Err(e) => {
                    warn!(%host, error = %e, "cannot issue tunnel certificate");
                    return;
                }
            };
            let accept = tokio_boring::accept(&acceptor, upgraded);
            match timeout(self.handshake_timeout(), accept).await {
                Ok(Ok(tls)) => self.serve(tls, Some(Tunnel { host, port })).await,
                Ok(Err(e)) => debug!(%host, error = %e, "tunnel tls handshake failed"),
                Err(_) => debug!(%host, "tunnel tls handshake timed out"),
            }
        });
        Response::new(Body::empty())
    }

    /// Transport configuration for `req`.
    fn transport_for(
        &self,
        req: &Request<Body>,
        tunnel: Option<&Tunnel>,
    ) -> Result<TransportConfig> {
        let header = req
            .headers()
            .get(TRANSPORT_HEADER)
            .or_else(|| req.headers().get(LEGACY_TRANSPORT_HEADER));
        let from_header = match header {
            Some(value) => {
                let doc = value
                    .to_str()
                    .map_err(|_| MimicError::Configuration("transport header is not text".into()))?;
                Some(TransportConfig::parse(doc)?)
            }
            None => None,
        };

        let derived = match tunnel {
            Some(t) => Some(("https".to_string(), t.authority())),
            None => req.uri().authority().map(|a| {
                let scheme = req.uri().scheme_str().unwrap_or("http").to_string();
                (scheme, a.as_str().to_string())
            }),
        };

        let config = match from_header {
            Some(config) if !config.host.is_empty() => config,
            Some(config) => match derived {
                Some((scheme, host)) => config.with_target(&scheme, &host),
                None => with_host_header(config, req),
            },
            None => {
                let saved = self.settings.transport();
                match derived {
                    Some((scheme, host)) => saved.with_target(&scheme, &host),
                    None if !saved.host.is_empty() => saved,
                    None => with_host_header(saved, req),
                }
            }
        };

        if config.host.is_empty() {
            return Err(MimicError::Configuration("request has no target host".into()));
        }
        Ok(config)
    }

    async fn forward(
        &self,
        mut req: Request<Body>,
        tunnel: Option<&Tunnel>,
    ) -> Result<Response<Body>> {
        let config = self.transport_for(&req, tunnel)?;
        let client = self.clients.get_or_build(&config)?;

        let scheme = if config.scheme.is_empty() { "https" } else { config.scheme.as_str() };
        let path = req
            .uri()
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        *req.uri_mut() = format!("{scheme}://{}{path}", config.host)
            .parse()
            .map_err(|e| MimicError::Configuration(format!("invalid target: {e}")))?;

        let headers = req.headers_mut();
        headers.remove(TRANSPORT_HEADER);
        headers.remove(LEGACY_TRANSPORT_HEADER);
        strip_hop_by_hop(headers);
        let host = HeaderValue::from_str(&config.host)
            .map_err(|e| MimicError::Configuration(format!("invalid host: {e}")))?;
        headers.insert(HOST, host);

        let mut response = client.request(req).await?;
        strip_hop_by_hop(response.headers_mut());
        Ok(response)
    }
}

fn with_host_header(config: TransportConfig, req: &Request<Body>) -> TransportConfig {
    match req.headers().get(HOST).and_then(|h| h.to_str().ok()) {
        Some(host) => {
            let scheme = if config.scheme.is_empty() {
                "https".to_string()
            } else {
                config.scheme.clone()
            };
            config.with_target(&scheme, host)
        }
        None => config,
    }
}

/// Starts the egress listener on `listen_addr`.
pub async fn start_egress(
    listen_addr: &str,
    settings: Arc<dyn SettingsSource>,
    clients: Arc<ClientCache>,
    ca: Arc<CertificateAuthority>,
) -> Result<ListenerHandle> {
    let handle = EgressServer::new(settings, clients, ca).start(listen_addr).await?;
    info!(addr = %handle.local_addr(), "egress listener started");
    Ok(handle)
}
