use mimic_traits::{MimicError, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// In-flight connections get this long to finish once a listener is stopped.
pub const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// `[host]:port`; an omitted host means all interfaces.
pub fn normalize_listen_addr(addr: &str) -> Result<String> {
    let addr = addr.trim();
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| MimicError::Configuration(format!("address {addr:?} has no port")))?;
    port.parse::<u16>()
        .map_err(|_| MimicError::Configuration(format!("address {addr:?} has an invalid port")))?;
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    Ok(format!("{host}:{port}"))
}

pub async fn bind(addr: &str) -> Result<TcpListener> {
    let addr = normalize_listen_addr(addr)?;
    TcpListener::bind(&addr)
        .await
        .map_err(|source| MimicError::Bind { addr, source })
}

/// A running accept loop.
pub struct ListenerHandle {
    name: &'static str,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Closes the listening socket, waits out the drain grace and aborts what is left.
    /// Calling it again is a no-op.
    pub async fn stop(&self) {
        let Some(task) = self.task.lock().take() else {
            return;
        };
        let _ = self.shutdown.send(true);
        if let Err(e) = task.await {
            warn!(listener = self.name, error = %e, "accept loop ended abnormally");
        }
        info!(listener = self.name, addr = %self.local_addr, "stopped");
    }
}

/// Spawns the accept loop; each connection is handled on its own task.
pub fn spawn_accept_loop<F, Fut>(
    name: &'static str,
    listener: TcpListener,
    handler: F,
) -> Result<ListenerHandle>
where
    F: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let local_addr = listener.local_addr()?;
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    info!(listener = name, addr = %local_addr, "listening");

    let task = tokio::spawn(async move {
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(listener = name, %peer, "accepted");
                        connections.spawn(handler(stream, peer));
                    }
                    Err(e) => {
                        warn!(listener = name, error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
        drop(listener);

        let remaining = connections.len();
        if remaining == 0 {
            return;
        }
        debug!(listener = name, remaining, "draining connections");
        let drained = tokio::time::timeout(DRAIN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            let remaining = connections.len();
            warn!(listener = name, remaining, "drain grace expired, aborting connections");
            connections.shutdown().await;
        }
    });

    Ok(ListenerHandle {
        name,
        local_addr,
        shutdown,
        task: Mutex::new(Some(task)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn listen_addresses() {
        assert_eq!(normalize_listen_addr(":8887").unwrap(), "0.0.0.0:8887");
        assert_eq!(normalize_listen_addr("127.0.0.1:8080").unwrap(), "127.0.0.1:8080");
        assert_eq!(normalize_listen_addr("[::1]:8080").unwrap(), "[::1]:8080");
        assert!(matches!(normalize_listen_addr("8080"), Err(MimicError::Configuration(_))));
        assert!(matches!(normalize_listen_addr("host:http"), Err(MimicError::Configuration(_))));
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let first = bind("127.0.0.1:0").await.unwrap();
        let taken = first.local_addr().unwrap().to_string();
        assert!(matches!(bind(&taken).await, Err(MimicError::Bind { .. })));
    }

    #[tokio::test]
    async fn serves_then_stops_idempotently() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let handle = spawn_accept_loop("echo", listener, |mut stream, _| async move {
            let mut buf = [0u8; 4];
            if stream.read_exact(&mut buf).await.is_ok() {
                let _ = stream.write_all(&buf).await;
            }
        })
        .unwrap();

        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        handle.stop().await;
        handle.stop().await;
        assert!(TcpStream::connect(handle.local_addr()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_connections_are_aborted_after_grace() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let (started_tx, mut started_rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = spawn_accept_loop("stuck", listener, move |_stream, _| {
            let started_tx = started_tx.clone();
            async move {
                let _ = started_tx.send(());
                std::future::pending::<()>().await;
            }
        })
        .unwrap();

        let _client = TcpStream::connect(handle.local_addr()).await.unwrap();
        started_rx.recv().await.unwrap();

        let started = tokio::time::Instant::now();
        handle.stop().await;
        assert!(started.elapsed() >= DRAIN_GRACE);
    }
}
