use crate::transport::split_authority;
use mimic_traits::{MimicError, Result};
use std::net::IpAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Upstream HTTP proxy taken from the usual environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamProxy {
    pub host: String,
    pub port: u16,
    no_proxy: Vec<String>,
}

fn env_var(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

impl UpstreamProxy {
    /// `HTTPS_PROXY` for https targets, `HTTP_PROXY` for plain ones, `ALL_PROXY` for both.
    pub fn from_env(scheme: &str) -> Option<Self> {
        let url = if scheme.eq_ignore_ascii_case("https") {
            env_var(&["HTTPS_PROXY", "https_proxy", "ALL_PROXY", "all_proxy"])
        } else {
            env_var(&["HTTP_PROXY", "http_proxy", "ALL_PROXY", "all_proxy"])
        }?;
        let no_proxy = env_var(&["NO_PROXY", "no_proxy"]).unwrap_or_default();
        let proxy = Self::parse(&url, &no_proxy);
        if let Some(proxy) = &proxy {
            info!(host = %proxy.host, port = proxy.port, "using upstream proxy from environment");
        }
        proxy
    }

    pub fn parse(url: &str, no_proxy: &str) -> Option<Self> {
        let rest = match url.split_once("://") {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("http") => rest,
            Some((scheme, _)) => {
                debug!(scheme, "unsupported upstream proxy scheme");
                return None;
            }
            None => url,
        };
        let authority = rest.split('/').next()?;
        let authority = authority.rsplit_once('@').map_or(authority, |(_, a)| a);
        let (host, port) = split_authority(authority, 80)?;
        Some(Self {
            host,
            port,
            no_proxy: no_proxy
                .split(',')
                .map(|s| s.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        })
    }

    /// `NO_PROXY` entries match the host itself or any subdomain; `*` matches everything.
    /// Loopback destinations never go through the proxy.
    pub fn bypasses(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let loopback = host.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false);
        if host == "localhost" || loopback {
            return true;
        }
        self.no_proxy.iter().any(|entry| {
            let entry = entry.split(':').next().unwrap_or(entry);
            entry == "*" || host == entry || host.ends_with(&format!(".{entry}"))
        })
    }
}

/// Issues `CONNECT host:port` on `stream` and waits for a 2xx answer.
pub async fn connect_tunnel<S>(stream: &mut S, host: &str, port: u16) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target = if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    let request = format!(
        "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nProxy-Connection: keep-alive\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let head = read_head(stream).await?;
    let status_line = head.lines().next().unwrap_or_default();
    let status = status_line.split_whitespace().nth(1).unwrap_or_default();
    if !status.starts_with('2') {
        return Err(MimicError::Upstream(format!(
            "proxy refused CONNECT {target}: {status_line}"
        )));
    }
    debug!(%target, "tunnel established");
    Ok(())
}

/// Reads an HTTP message head (up to and including the blank line) without over-reading.
pub async fn read_head<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(512);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(MimicError::Upstream("message head too large".into()));
        }
        if stream.read(&mut byte).await? == 0 {
            return Err(MimicError::Upstream("connection closed before end of message head".into()));
        }
        head.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_proxy_urls() {
        let proxy = UpstreamProxy::parse("http://user:pw@proxy.local:3128/", "").unwrap();
        assert_eq!(proxy.host, "proxy.local");
        assert_eq!(proxy.port, 3128);

        let proxy = UpstreamProxy::parse("10.0.0.1:8080", "").unwrap();
        assert_eq!(proxy.host, "10.0.0.1");

        assert!(UpstreamProxy::parse("socks5://127.0.0.1:1080", "").is_none());
    }

    #[test]
    fn no_proxy_matching() {
        let no_proxy = "localhost, .internal.test,example.com:443";
        let proxy = UpstreamProxy::parse("http://proxy:8080", no_proxy).unwrap();
        assert!(proxy.bypasses("localhost"));
        assert!(proxy.bypasses("api.internal.test"));
        assert!(proxy.bypasses("Example.com."));
        assert!(!proxy.bypasses("example.org"));

        let none = UpstreamProxy::parse("http://proxy:8080", "").unwrap();
        assert!(none.bypasses("127.0.0.1"));
        assert!(none.bypasses("::1"));
        assert!(!none.bypasses("10.1.2.3"));

        let all = UpstreamProxy::parse("http://proxy:8080", "*").unwrap();
        assert!(all.bypasses("anything.test"));
    }

    #[tokio::test]
    async fn tunnel_handshake() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let proxy = tokio::spawn(async move {
            let head = read_head(&mut server).await.unwrap();
            assert!(head.starts_with("CONNECT origin.test:443 HTTP/1.1\r\n"));
            server.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await.unwrap();
        });

        connect_tunnel(&mut client, "origin.test", 443).await.unwrap();
        proxy.await.unwrap();
    }

    #[tokio::test]
    async fn tunnel_refused() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let _ = read_head(&mut server).await;
            server.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n").await.unwrap();
        });

        let err = connect_tunnel(&mut client, "origin.test", 443).await.unwrap_err();
        assert!(matches!(err, MimicError::Upstream(_)));
    }
}
