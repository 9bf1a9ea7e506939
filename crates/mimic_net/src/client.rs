//! Egress transport factory: outbound HTTP(S) client that replays a chosen ClientHello.

use crate::proxy::{connect_tunnel, UpstreamProxy};
use crate::tls::{BoringImpersonator, TlsImpersonator};
use crate::transport::{boxed, dial, split_authority, MimicStream};
use bytes::Bytes;
use dashmap::DashMap;
use hyper::body::HttpBody;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST};
use hyper::http::uri::{PathAndQuery, Uri};
use hyper::{Body, Request, Response, Version};
use mimic_traits::{FingerprintLookup, MimicError, Result, Timeouts, TransportConfig};
use mod_fingerprint::{ClientHelloId, HelloSource, Http2Tuning, NamedProfile, ProfileResolver};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::poll_fn;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const MAX_IDLE_PER_HOST: usize = 32;

/// Headers that only describe a single hop and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Removes hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

fn upstream<E: std::fmt::Display>(e: E) -> MimicError {
    MimicError::Upstream(e.to_string())
}

/// Where a request goes. Also the pooling key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub https: bool,
    pub host: String,
    pub port: u16,
}

impl Target {
    /// Taken from the request URI, else the `Host` header, else the configured host.
    pub fn for_request<B>(req: &Request<B>, config: &TransportConfig) -> Result<Self> {
        let scheme = req
            .uri()
            .scheme_str()
            .map(str::to_string)
            .or_else(|| (!config.scheme.is_empty()).then(|| config.scheme.clone()))
            .unwrap_or_else(|| "https".to_string());
        let https = match scheme.to_ascii_lowercase().as_str() {
            "https" => true,
            "http" => false,
            other => return Err(MimicError::Configuration(format!("unsupported scheme {other:?}"))),
        };
        let default_port = if https { 443 } else { 80 };

        let authority = req
            .uri()
            .authority()
            .map(|a| a.as_str().to_string())
            .or_else(|| {
                req.headers()
                    .get(HOST)
                    .and_then(|h| h.to_str().ok())
                    .map(str::to_string)
            })
            .or_else(|| (!config.host.is_empty()).then(|| config.host.clone()))
            .ok_or_else(|| MimicError::Configuration("request has no target host".into()))?;

        let (host, port) = split_authority(&authority, default_port)
            .ok_or_else(|| {
                MimicError::Configuration(format!("invalid target host {authority:?}"))
            })?;
        Ok(Self { https, host, port })
    }

    fn default_port(&self) -> u16 {
        if self.https {
            443
        } else {
            80
        }
    }

    pub fn authority(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == self.default_port() {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }

    fn scheme(&self) -> &'static str {
        if self.https {
            "https"
        } else {
            "http"
        }
    }
}

struct IdleSender {
    sender: hyper::client::conn::SendRequest<Body>,
    since: Instant,
}

/// Open streams on an h2 connection and when the last one finished.
struct Usage {
    open_streams: usize,
    last_active: Instant,
}

impl Usage {
    fn idle_for(&self, idle: Duration) -> bool {
        self.open_streams == 0 && self.last_active.elapsed() >= idle
    }

    fn deadline(&self, idle: Duration) -> Instant {
        if self.open_streams == 0 {
            self.last_active + idle
        } else {
            Instant::now() + idle
        }
    }
}

type Activity = Arc<Mutex<Usage>>;

/// Counts as an open stream on its connection until dropped.
struct OpenStream(Activity);

impl OpenStream {
    fn new(activity: &Activity) -> Self {
        activity.lock().open_streams += 1;
        Self(Arc::clone(activity))
    }

    /// Fails once the connection has sat idle long enough for its task to close it.
    fn unless_idle(activity: &Activity, idle: Duration) -> Option<Self> {
        let mut usage = activity.lock();
        if usage.idle_for(idle) {
            return None;
        }
        usage.open_streams += 1;
        Some(Self(Arc::clone(activity)))
    }
}

impl Drop for OpenStream {
    fn drop(&mut self) {
        let mut usage = self.0.lock();
        usage.open_streams -= 1;
        usage.last_active = Instant::now();
    }
}

struct PooledH2 {
    sender: h2::client::SendRequest<Bytes>,
    activity: Activity,
}

enum Conn {
    H1(hyper::client::conn::SendRequest<Body>),
    H2(h2::client::SendRequest<Bytes>, Activity),
}

struct Inner {
    config: TransportConfig,
    timeouts: Timeouts,
    resolver: ProfileResolver,
    tuning: Option<Http2Tuning>,
    tls: Arc<dyn TlsImpersonator>,
    proxy: Option<UpstreamProxy>,
    h2_pool: DashMap<Target, PooledH2>,
    h1_idle: Mutex<HashMap<Target, Vec<IdleSender>>>,
}

/// Long-lived, pooled client bound to one [`TransportConfig`]. Cheap to clone.
#[derive(Clone)]
pub struct EgressClient {
    inner: Arc<Inner>,
}

impl EgressClient {
    /// Builds a client verifying origins against the system roots. Performs no I/O.
    pub fn build(config: &TransportConfig, lookup: FingerprintLookup) -> Result<Self> {
        Self::with_impersonator(config, lookup, Arc::new(BoringImpersonator::new()))
    }

    pub fn with_impersonator(
        config: &TransportConfig,
        lookup: FingerprintLookup,
        tls: Arc<dyn TlsImpersonator>,
    ) -> Result<Self> {
        let resolver = ProfileResolver::new(config, lookup).map_err(|e| match e {
            MimicError::Parse(e) => MimicError::SpecBuild(e.to_string()),
            other => other,
        })?;
        let configured = resolver.configured();
        tls.prepare(&configured.spec)?;

        // Keyed on the profile name, so literal and captured hellos keep the family's SETTINGS.
        let tuning = NamedProfile::from_name(&config.fingerprint)
            .and_then(|profile| Http2Tuning::for_identity(&ClientHelloId::Named(profile)));
        info!(
            identity = configured.id.label(),
            ja3 = %configured.spec.ja3_string(),
            http2_tuning = tuning.is_some(),
            intercepted = config.use_intercepted_fingerprint,
            "egress client ready"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config: config.clone(),
                timeouts: config.timeouts(),
                resolver,
                tuning,
                tls,
                proxy: UpstreamProxy::from_env(&config.scheme),
                h2_pool: DashMap::new(),
                h1_idle: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn timeouts(&self) -> Timeouts {
        self.inner.timeouts
    }

    pub fn identity(&self) -> ClientHelloId {
        self.inner.resolver.configured().id
    }

    pub fn http2_tuning(&self) -> Option<Http2Tuning> {
        self.inner.tuning
    }

    pub fn fallback_count(&self) -> u64 {
        self.inner.resolver.fallback_count()
    }

    /// Open pooled connections: live h2 connections plus idle h1 ones.
    pub fn pooled_connections(&self) -> usize {
        let idle_h1: usize = self.inner.h1_idle.lock().values().map(Vec::len).sum();
        self.inner.h2_pool.len() + idle_h1
    }

    /// Sends `req` to its origin, reusing a pooled connection when one is available.
    pub async fn request(&self, req: Request<Body>) -> Result<Response<Body>> {
        let target = Target::for_request(&req, &self.inner.config)?;

        if let Some((sender, open)) = self.pooled_h2(&target).await {
            return self.send_h2(sender, open, &target, req).await;
        }
        if let Some(sender) = self.pooled_h1(&target) {
            return self.send_h1(sender, &target, req).await;
        }

        match self.connect(&target).await? {
            Conn::H2(sender, activity) => {
                let pooled = PooledH2 {
                    sender: sender.clone(),
                    activity: Arc::clone(&activity),
                };
                self.inner.h2_pool.insert(target.clone(), pooled);
                self.send_h2(sender, OpenStream::new(&activity), &target, req).await
            }
            Conn::H1(sender) => self.send_h1(sender, &target, req).await,
        }
    }

    async fn pooled_h2(
        &self,
        target: &Target,
    ) -> Option<(h2::client::SendRequest<Bytes>, OpenStream)> {
        let (sender, activity) = self
            .inner
            .h2_pool
            .get(target)
            .map(|p| (p.sender.clone(), Arc::clone(&p.activity)))?;
        let Some(open) = OpenStream::unless_idle(&activity, self.inner.timeouts.idle) else {
            self.inner.h2_pool.remove(target);
            return None;
        };
        match sender.ready().await {
            Ok(sender) => Some((sender, open)),
            Err(e) => {
                debug!(host = %target.host, error = %e, "dropping dead h2 connection");
                self.inner.h2_pool.remove(target);
                None
            }
        }
    }

    fn pooled_h1(&self, target: &Target) -> Option<hyper::client::conn::SendRequest<Body>> {
        let idle_timeout = self.inner.timeouts.idle;
        let mut idle = self.inner.h1_idle.lock();
        let list = idle.get_mut(target)?;
        while let Some(entry) = list.pop() {
            if entry.since.elapsed() < idle_timeout && entry.sender.is_ready() {
                return Some(entry.sender);
            }
        }
        None
    }

    /// Drops idle h1 senders for `target` that have outlived the idle timeout, closing them.
    fn sweep_h1(inner: &Inner, target: &Target) {
        let idle_timeout = inner.timeouts.idle;
        let mut idle = inner.h1_idle.lock();
        if let Some(list) = idle.get_mut(target) {
            list.retain(|e| e.since.elapsed() < idle_timeout && !e.sender.is_closed());
            if list.is_empty() {
                idle.remove(target);
            }
        }
    }

    fn checkin(inner: &Inner, target: Target, sender: hyper::client::conn::SendRequest<Body>) {
        let idle_timeout = inner.timeouts.idle;
        let mut idle = inner.h1_idle.lock();
        let list = idle.entry(target).or_default();
        list.retain(|e| e.since.elapsed() < idle_timeout && !e.sender.is_closed());
        if list.len() < MAX_IDLE_PER_HOST {
            list.push(IdleSender {
                sender,
                since: Instant::now(),
            });
        }
    }

    async fn dial_target(&self, target: &Target) -> Result<MimicStream> {
        let t = &self.inner.timeouts;
        let stream = match &self.inner.proxy {
            Some(proxy) if !proxy.bypasses(&target.host) => {
                let mut tcp = dial(&proxy.host, proxy.port, t.connect, t.keep_alive).await?;
                connect_tunnel(&mut tcp, &target.host, target.port).await?;
                tcp
            }
            _ => dial(&target.host, target.port, t.connect, t.keep_alive).await?,
        };
        Ok(boxed(stream))
    }

    async fn connect(&self, target: &Target) -> Result<Conn> {
        let stream = self.dial_target(target).await?;
        if !target.https {
            return self.handshake_h1(stream).await;
        }

        let mut hello = self.inner.resolver.resolve(&target.host);
        if hello.source == HelloSource::Captured {
            if let Err(e) = self.inner.tls.prepare(&hello.spec) {
                let fallbacks = self.inner.resolver.record_fallback();
                warn!(
                    host = %target.host,
                    error = %e,
                    fallbacks,
                    "intercepted fingerprint not expressible, using configured profile"
                );
                hello = self.inner.resolver.configured().clone();
            }
        }

        let session = self
            .inner
            .tls
            .handshake(&target.host, stream, &hello.spec, self.inner.timeouts.handshake)
            .await?;
        debug!(
            host = %target.host,
            identity = hello.id.label(),
            h2 = session.is_h2(),
            "origin connected"
        );

        if session.is_h2() {
            self.handshake_h2(session.stream, target).await
        } else {
            self.handshake_h1(session.stream).await
        }
    }

    async fn handshake_h1(&self, stream: MimicStream) -> Result<Conn> {
        let (sender, connection) = hyper::client::conn::Builder::new()
            .handshake::<_, Body>(stream)
            .await
            .map_err(upstream)?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "http/1.1 connection closed");
            }
        });
        Ok(Conn::H1(sender))
    }

    /// The connection task ends, closing the socket, once no stream has been open for the idle
    /// timeout.
    async fn handshake_h2(&self, stream: MimicStream, target: &Target) -> Result<Conn> {
        let mut builder = h2::client::Builder::new();
        if let Some(tuning) = &self.inner.tuning {
            apply_tuning(&mut builder, tuning);
        }
        let (sender, connection) = builder.handshake::<_, Bytes>(stream).await.map_err(upstream)?;

        let activity: Activity = Arc::new(Mutex::new(Usage {
            open_streams: 0,
            last_active: Instant::now(),
        }));
        let watched = Arc::clone(&activity);
        let idle = self.inner.timeouts.idle;
        let pool: Weak<Inner> = Arc::downgrade(&self.inner);
        let target = target.clone();
        tokio::spawn(async move {
            tokio::pin!(connection);
            loop {
                let deadline = watched.lock().deadline(idle);
                tokio::select! {
                    result = &mut connection => {
                        if let Err(e) = result {
                            debug!(error = %e, "h2 connection closed");
                        }
                        break;
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        if watched.lock().idle_for(idle) {
                            debug!(host = %target.host, "closing idle h2 connection");
                            break;
                        }
                    }
                }
            }
            if let Some(inner) = pool.upgrade() {
                inner
                    .h2_pool
                    .remove_if(&target, |_, pooled| Arc::ptr_eq(&pooled.activity, &watched));
            }
        });
        Ok(Conn::H2(sender, activity))
    }

    async fn send_h1(
        &self,
        mut sender: hyper::client::conn::SendRequest<Body>,
        target: &Target,
        mut req: Request<Body>,
    ) -> Result<Response<Body>> {
        let path = req
            .uri()
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        *req.uri_mut() = Uri::from(path);
        *req.version_mut() = Version::HTTP_11;
        strip_hop_by_hop(req.headers_mut());
        if !req.headers().contains_key(HOST) {
            let host = HeaderValue::from_str(&target.authority()).map_err(upstream)?;
            req.headers_mut().insert(HOST, host);
        }

        let response = sender.send_request(req).await.map_err(upstream)?;

        // The connection becomes ready again once the response body has been drained.
        let inner = Arc::clone(&self.inner);
        let target = target.clone();
        tokio::spawn(async move {
            if poll_fn(|cx| sender.poll_ready(cx)).await.is_err() {
                return;
            }
            let idle = inner.timeouts.idle;
            Self::checkin(&inner, target.clone(), sender);
            let pool = Arc::downgrade(&inner);
            drop(inner);

            tokio::time::sleep(idle).await;
            if let Some(inner) = pool.upgrade() {
                Self::sweep_h1(&inner, &target);
            }
        });
        Ok(response)
    }

    async fn send_h2(
        &self,
        mut sender: h2::client::SendRequest<Bytes>,
        open: OpenStream,
        target: &Target,
        req: Request<Body>,
    ) -> Result<Response<Body>> {
        let (parts, body) = req.into_parts();
        let mut head = Request::from_parts(parts, ());
        let path = head
            .uri()
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        *head.uri_mut() = format!("{}://{}{}", target.scheme(), target.authority(), path)
            .parse()
            .map_err(upstream)?;
        *head.version_mut() = Version::HTTP_2;
        strip_hop_by_hop(head.headers_mut());
        head.headers_mut().remove(HOST);

        let end_of_stream = body.is_end_stream();
        let (response, stream) = sender.send_request(head, end_of_stream).map_err(upstream)?;
        if !end_of_stream {
            let upload = OpenStream::new(&open.0);
            tokio::spawn(async move {
                let _upload = upload;
                if let Err(e) = pump_body(body, stream).await {
                    debug!(error = %e, "request body upload failed");
                }
            });
        }

        let response = response.await.map_err(upstream)?;
        let (mut parts, mut recv) = response.into_parts();
        parts.version = Version::HTTP_11;

        let (mut tx, body) = Body::channel();
        tokio::spawn(async move {
            let _open = open;
            while let Some(chunk) = recv.data().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        debug!(error = %e, "h2 response body aborted");
                        tx.abort();
                        return;
                    }
                };
                let _ = recv.flow_control().release_capacity(chunk.len());
                if tx.send_data(chunk).await.is_err() {
                    return;
                }
            }
            if let Ok(Some(trailers)) = recv.trailers().await {
                let _ = tx.send_trailers(trailers).await;
            }
        });
        Ok(Response::from_parts(parts, body))
    }
}

fn apply_tuning(builder: &mut h2::client::Builder, tuning: &Http2Tuning) {
    if let Some(v) = tuning.header_table_size {
        builder.header_table_size(v);
    }
    builder.enable_push(tuning.enable_push);
    if let Some(v) = tuning.max_concurrent_streams {
        builder.max_concurrent_streams(v);
    }
    if let Some(v) = tuning.initial_window_size {
        builder.initial_window_size(v);
    }
    if let Some(v) = tuning.max_frame_size {
        builder.max_frame_size(v);
    }
    if let Some(v) = tuning.max_header_list_size {
        builder.max_header_list_size(v);
    }
    if let Some(v) = tuning.initial_connection_window_size {
        builder.initial_connection_window_size(v);
    }
}

/// Streams a hyper body into an h2 send stream, respecting flow control.
async fn pump_body(mut body: Body, mut stream: h2::SendStream<Bytes>) -> Result<()> {
    while let Some(chunk) = body.data().await {
        let mut chunk = chunk.map_err(upstream)?;
        while !chunk.is_empty() {
            stream.reserve_capacity(chunk.len());
            let granted = match poll_fn(|cx| stream.poll_capacity(cx)).await {
                Some(granted) => granted.map_err(upstream)?,
                None => return Err(MimicError::Upstream("h2 stream closed during upload".into())),
            };
            if granted == 0 {
                continue;
            }
            let part = chunk.split_to(granted.min(chunk.len()));
            stream.send_data(part, false).map_err(upstream)?;
        }
    }
    match body.trailers().await.map_err(upstream)? {
        Some(trailers) => stream.send_trailers(trailers).map_err(upstream)?,
        None => stream.send_data(Bytes::new(), true).map_err(upstream)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mimic_traits::no_fingerprints;

    fn config(fingerprint: &str) -> TransportConfig {
        TransportConfig {
            host: "example.com".into(),
            scheme: "https".into(),
            fingerprint: fingerprint.into(),
            ..Default::default()
        }
    }

    #[test]
    fn default_timeouts() {
        let client = EgressClient::build(&config("Chrome120"), no_fingerprints()).unwrap();
        let t = client.timeouts();
        assert_eq!(t.connect, Duration::from_secs(30));
        assert_eq!(t.keep_alive, Duration::from_secs(30));
        assert_eq!(t.idle, Duration::from_secs(90));
        assert_eq!(t.handshake, Duration::from_secs(10));
    }

    #[test]
    fn chrome_identity_gets_chrome_tuning() {
        let client = EgressClient::build(&config("Chrome120"), no_fingerprints()).unwrap();
        assert_eq!(client.identity(), ClientHelloId::Named(NamedProfile::Chrome120));
        let tuning = client.http2_tuning().unwrap();
        assert_eq!(tuning.header_table_size, Some(4096));
        assert!(!tuning.enable_push);
        assert_eq!(tuning.max_concurrent_streams, Some(1000));
        assert_eq!(tuning.initial_window_size, Some(6_291_456));
        assert_eq!(tuning.max_frame_size, Some(16_384));
        assert_eq!(tuning.max_header_list_size, Some(262_144));
    }

    #[test]
    fn tuning_follows_profile_name_with_literal_hello() {
        let mut cfg = config("Chrome120");
        cfg.hex_client_hello = NamedProfile::Firefox120.spec().encode().to_hex();
        let client = EgressClient::build(&cfg, no_fingerprints()).unwrap();
        assert_eq!(client.identity(), ClientHelloId::Custom);
        assert_eq!(client.http2_tuning().unwrap().initial_window_size, Some(6_291_456));
    }

    #[test]
    fn safari_identity_keeps_defaults() {
        let client = EgressClient::build(&config("Safari16_0"), no_fingerprints()).unwrap();
        assert!(client.http2_tuning().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn open_streams_hold_off_idle_close() {
        let idle = Duration::from_secs(1);
        let activity: Activity = Arc::new(Mutex::new(Usage {
            open_streams: 0,
            last_active: Instant::now(),
        }));
        let open = OpenStream::unless_idle(&activity, idle).unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!activity.lock().idle_for(idle));
        drop(open);
        assert!(!activity.lock().idle_for(idle));

        tokio::time::advance(idle).await;
        assert!(activity.lock().idle_for(idle));
        assert!(OpenStream::unless_idle(&activity, idle).is_none());
        assert_eq!(activity.lock().open_streams, 0);
    }

    #[test]
    fn malformed_literal_hello_is_a_spec_build_error() {
        let mut cfg = config("Chrome120");
        cfg.hex_client_hello = "160301zz".into();
        let err = EgressClient::build(&cfg, no_fingerprints()).err().unwrap();
        assert!(matches!(err, MimicError::SpecBuild(_)), "{err:?}");
    }

    #[test]
    fn unknown_profile_fails_build() {
        let err = EgressClient::build(&config("Netscape4"), no_fingerprints()).err().unwrap();
        assert!(matches!(err, MimicError::UnknownProfile(_)));
    }

    #[test]
    fn target_from_uri_header_or_config() {
        let cfg = config("Chrome120");

        let req = Request::get("http://origin.test:8080/a").body(()).unwrap();
        let target = Target::for_request(&req, &cfg).unwrap();
        assert_eq!(target, Target { https: false, host: "origin.test".into(), port: 8080 });

        let req = Request::get("/a").header(HOST, "api.test").body(()).unwrap();
        let target = Target::for_request(&req, &cfg).unwrap();
        assert_eq!(target, Target { https: true, host: "api.test".into(), port: 443 });
        assert_eq!(target.authority(), "api.test");

        let req = Request::get("/a").body(()).unwrap();
        assert_eq!(Target::for_request(&req, &cfg).unwrap().host, "example.com");

        let empty = TransportConfig::default();
        assert!(matches!(
            Target::for_request(&req, &empty),
            Err(MimicError::Configuration(_))
        ));
    }

    #[test]
    fn hop_by_hop_headers_are_removed() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("close, x-trace"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        headers.insert("accept", HeaderValue::from_static("*/*"));
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("accept"));
    }
}
