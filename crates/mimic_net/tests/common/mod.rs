#![allow(dead_code)]

use boring::ssl::{select_next_proto, AlpnError, SslAcceptor, SslMethod};
use bytes::{Bytes, BytesMut};
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Request, Response};
use mimic_net::transport::PrefixedStream;
use mimic_net::CertificateAuthority;
use mimic_traits::HandshakeDescription;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const H2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
const FRAME_SETTINGS: u8 = 0x4;

/// What an h2 origin saw from one client connection.
#[derive(Debug)]
pub enum OriginEvent {
    Connected {
        cipher_suites: Vec<u16>,
        settings: HashMap<u16, u32>,
    },
    Closed,
}

/// HTTPS origin answering `origin says <path>`, with a leaf for `localhost` from `ca`.
pub async fn spawn_origin(ca: Arc<CertificateAuthority>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = ca.acceptor_for("localhost").unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { return };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(tls) = tokio_boring::accept(&acceptor, stream).await else { return };
                let service = service_fn(|req: Request<Body>| async move {
                    let body = format!("origin says {}", req.uri().path());
                    Ok::<_, Infallible>(Response::new(Body::from(body)))
                });
                let _ = Http::new().serve_connection(tls, service).await;
            });
        }
    });
    addr
}

/// A stand-in inspector: accepts `CONNECT`, terminates TLS and echoes whatever it reads.
pub async fn spawn_echo_inspector() -> SocketAddr {
    let ca = Arc::new(CertificateAuthority::generate().unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { return };
            let ca = Arc::clone(&ca);
            tokio::spawn(async move {
                let head = mimic_net::proxy::read_head(&mut stream).await.unwrap();
                let target = head.split_whitespace().nth(1).unwrap().to_string();
                let host = target.rsplit_once(':').unwrap().0.to_string();
                stream
                    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                    .await
                    .unwrap();
                let acceptor = ca.acceptor_for(&host).unwrap();
                let Ok(mut tls) = tokio_boring::accept(&acceptor, stream).await else { return };
                let mut buf = [0u8; 1024];
                loop {
                    match tls.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if tls.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// HTTPS origin that negotiates h2 and reports each connection's ClientHello cipher
/// suites and initial SETTINGS, then `Closed` once the client goes away.
pub async fn spawn_h2_origin(
    ca: Arc<CertificateAuthority>,
) -> (SocketAddr, mpsc::UnboundedReceiver<OriginEvent>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (leaf, key) = ca.issue("localhost").unwrap();
    let mut builder = SslAcceptor::mozilla_intermediate(SslMethod::tls()).unwrap();
    builder.set_private_key(&key).unwrap();
    builder.set_certificate(&leaf).unwrap();
    builder.set_alpn_select_callback(|_, client| {
        select_next_proto(b"\x02h2", client).ok_or(AlpnError::NOACK)
    });
    let acceptor = builder.build();
    let (events, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { return };
            let acceptor = acceptor.clone();
            let events = events.clone();
            tokio::spawn(async move {
                let (buffered, hello_len) = read_hello(&mut stream).await;
                let hello = HandshakeDescription::new(buffered.slice(..hello_len));
                let spec = mod_fingerprint::parse(&hello).unwrap();
                let rewound = PrefixedStream::new(buffered, stream);
                let Ok(mut tls) = tokio_boring::accept(&acceptor, rewound).await else { return };

                let (consumed, settings) = read_client_settings(&mut tls).await;
                let _ = events.send(OriginEvent::Connected {
                    cipher_suites: spec.cipher_suites,
                    settings,
                });

                let service = service_fn(|req: Request<Body>| async move {
                    let body = format!("origin says {}", req.uri().path());
                    Ok::<_, Infallible>(Response::new(Body::from(body)))
                });
                let replayed = PrefixedStream::new(consumed, tls);
                let _ = Http::new().http2_only(true).serve_connection(replayed, service).await;
                let _ = events.send(OriginEvent::Closed);
            });
        }
    });
    (addr, rx)
}

/// Everything read so far plus the length of the ClientHello at its front.
async fn read_hello<R: AsyncRead + Unpin>(stream: &mut R) -> (Bytes, usize) {
    let mut buf = BytesMut::new();
    loop {
        assert!(stream.read_buf(&mut buf).await.unwrap() > 0, "closed before hello");
        if let Some(len) = mod_fingerprint::complete_hello_len(&buf).unwrap() {
            return (buf.freeze(), len);
        }
    }
}

/// Reads the connection preface and the first SETTINGS frame. Returns the bytes read so the
/// server can replay them.
async fn read_client_settings<R>(stream: &mut R) -> (Bytes, HashMap<u16, u32>)
where
    R: AsyncRead + Unpin,
{
    let mut head = vec![0u8; H2_PREFACE.len() + 9];
    stream.read_exact(&mut head).await.unwrap();
    assert_eq!(&head[..H2_PREFACE.len()], H2_PREFACE);

    let frame = &head[H2_PREFACE.len()..];
    assert_eq!(frame[3], FRAME_SETTINGS, "first frame is not SETTINGS");
    let len = u32::from_be_bytes([0, frame[0], frame[1], frame[2]]) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();

    let settings = payload
        .chunks_exact(6)
        .map(|entry| {
            let id = u16::from_be_bytes([entry[0], entry[1]]);
            let value = u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]);
            (id, value)
        })
        .collect();
    head.extend_from_slice(&payload);
    (Bytes::from(head), settings)
}
