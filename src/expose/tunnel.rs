//! # Tunnel
//!
//! A local TCP listener relaying each accepted connection to a remote port of
//! one tracked resource over its own forwarded stream.
//!
//! When the remote end closes or fails while the local client is still
//! connected, the connection is recorded as broken and the local socket is
//! closed. Reads on a [`TunnelStream`] for that connection then fail with
//! [`std::io::ErrorKind::ConnectionAborted`] carrying a [`TunnelBroken`],
//! so a test can tell a dead backend from an orderly end of stream.

use crate::cluster::{BoxPortStream, ClusterApi, ResourceRef};
use crate::observability::metrics;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, info, warn};

const RELAY_BUFFER: usize = 16 * 1024;

/// Current state of a tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelStatus {
    Open,
    /// The remote side of at least one connection went away
    Broken(String),
    Closed,
}

/// A tunnel connection lost its remote side
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("tunnel to {resource} port {port} broken: {reason}")]
pub struct TunnelBroken {
    pub resource: String,
    pub port: u16,
    pub reason: String,
}

struct Shared {
    resource: ResourceRef,
    logical_name: String,
    remote_port: u16,
    local_addr: SocketAddr,
    status: watch::Sender<TunnelStatus>,
    shutdown: watch::Sender<bool>,
    broken: Mutex<HashMap<SocketAddr, String>>,
    accept_task: Mutex<Option<AbortHandle>>,
    closed: AtomicBool,
}

impl Shared {
    fn record_broken(&self, peer: SocketAddr, reason: String) {
        warn!(
            "💔 Tunnel {}:{} connection {} broken: {}",
            self.resource, self.remote_port, peer, reason
        );
        self.broken
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(peer, reason.clone());
        self.status.send_if_modified(|status| {
            if *status == TunnelStatus::Open {
                *status = TunnelStatus::Broken(reason);
                true
            } else {
                false
            }
        });
    }

    fn broken_reason(&self, peer: &SocketAddr) -> Option<String> {
        self.broken
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(peer)
            .cloned()
    }

    fn breakage(&self, reason: String) -> TunnelBroken {
        TunnelBroken {
            resource: self.resource.to_string(),
            port: self.remote_port,
            reason,
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);
        if let Some(task) = self
            .accept_task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        self.status.send_replace(TunnelStatus::Closed);
        metrics::decrement_tunnels_open();
        debug!("closed tunnel {} -> {}:{}", self.local_addr, self.resource, self.remote_port);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.close();
    }
}

/// Handle to a running tunnel
///
/// Clones share the same listener. The tunnel closes on [`Tunnel::close`] or
/// when the last clone is dropped.
#[derive(Clone)]
pub struct Tunnel {
    shared: Arc<Shared>,
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("resource", &self.shared.resource)
            .field("remote_port", &self.shared.remote_port)
            .field("local_addr", &self.shared.local_addr)
            .field("status", &self.status())
            .finish()
    }
}

impl Tunnel {
    /// Bind `127.0.0.1:0` and start relaying to `resource:remote_port`
    pub(crate) async fn open(
        cluster: Arc<dyn ClusterApi>,
        resource: ResourceRef,
        logical_name: String,
        remote_port: u16,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let local_addr = listener.local_addr()?;
        let (status, _) = watch::channel(TunnelStatus::Open);
        let (shutdown, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            resource,
            logical_name,
            remote_port,
            local_addr,
            status,
            shutdown,
            broken: Mutex::new(HashMap::new()),
            accept_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        // Weak so that dropping the last handle closes the tunnel
        let task = tokio::spawn(accept_loop(listener, cluster, Arc::downgrade(&shared)));
        *shared
            .accept_task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(task.abort_handle());
        metrics::increment_tunnels_open();
        info!(
            "🔀 Tunnel {} -> {}:{} open",
            local_addr, shared.resource, remote_port
        );
        Ok(Self { shared })
    }

    /// Local address to connect to
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Same as [`Tunnel::local_addr`]
    #[must_use]
    pub fn endpoint(&self) -> SocketAddr {
        self.shared.local_addr
    }

    #[must_use]
    pub fn resource(&self) -> &ResourceRef {
        &self.shared.resource
    }

    #[must_use]
    pub fn logical_name(&self) -> &str {
        &self.shared.logical_name
    }

    #[must_use]
    pub fn remote_port(&self) -> u16 {
        self.shared.remote_port
    }

    #[must_use]
    pub fn status(&self) -> TunnelStatus {
        self.shared.status.borrow().clone()
    }

    /// Connect to the tunnel's local listener
    pub async fn connect(&self) -> io::Result<TunnelStream> {
        match self.status() {
            TunnelStatus::Closed => {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "tunnel is closed"))
            }
            TunnelStatus::Open | TunnelStatus::Broken(_) => {}
        }
        let stream = TcpStream::connect(self.shared.local_addr).await?;
        let local = stream.local_addr()?;
        Ok(TunnelStream {
            stream,
            local,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Resolve when a connection first breaks; `None` if the tunnel is closed first
    pub async fn wait_broken(&self) -> Option<TunnelBroken> {
        let mut rx = self.shared.status.subscribe();
        let status = rx
            .wait_for(|s| !matches!(s, TunnelStatus::Open))
            .await
            .ok()?
            .clone();
        match status {
            TunnelStatus::Broken(reason) => Some(self.shared.breakage(reason)),
            TunnelStatus::Open | TunnelStatus::Closed => None,
        }
    }

    /// Stop accepting and drop every relayed connection
    pub fn close(&self) {
        self.shared.close();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

/// Client side of one tunnel connection
pub struct TunnelStream {
    stream: TcpStream,
    local: SocketAddr,
    shared: Arc<Shared>,
}

impl fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelStream")
            .field("local", &self.local)
            .field("tunnel", &self.shared.local_addr)
            .finish()
    }
}

impl TunnelStream {
    /// Breakage recorded for this connection, if any
    #[must_use]
    pub fn broken(&self) -> Option<TunnelBroken> {
        self.shared
            .broken_reason(&self.local)
            .map(|reason| self.shared.breakage(reason))
    }

    fn aborted(&self) -> Option<io::Error> {
        self.broken()
            .map(|broken| io::Error::new(io::ErrorKind::ConnectionAborted, broken))
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.stream).poll_read(cx, buf) {
            Poll::Ready(Ok(())) if buf.filled().len() == before && buf.remaining() > 0 => {
                match this.aborted() {
                    Some(e) => Poll::Ready(Err(e)),
                    None => Poll::Ready(Ok(())),
                }
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(this.aborted().unwrap_or(e))),
            other => other,
        }
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.stream).poll_write(cx, buf) {
            Poll::Ready(Err(e)) => Poll::Ready(Err(this.aborted().unwrap_or(e))),
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

async fn accept_loop(
    listener: TcpListener,
    cluster: Arc<dyn ClusterApi>,
    shared: std::sync::Weak<Shared>,
) {
    let mut relays = JoinSet::new();
    loop {
        let accepted = listener.accept().await;
        let Some(tunnel) = shared.upgrade() else {
            break;
        };
        match accepted {
            Ok((local, peer)) => {
                let shutdown = tunnel.shutdown.subscribe();
                let resource = tunnel.resource.clone();
                let port = tunnel.remote_port;
                let cluster = Arc::clone(&cluster);
                let shared = shared.clone();
                let on_break = move |reason: String| {
                    if let Some(tunnel) = shared.upgrade() {
                        tunnel.record_broken(peer, reason);
                    }
                };
                relays.spawn(async move {
                    match cluster.open_port(&resource, port).await {
                        Ok(remote) => relay(local, remote, shutdown, on_break).await,
                        Err(e) => {
                            on_break(format!("cannot open remote port: {e}"));
                            drop(local);
                        }
                    }
                });
            }
            Err(e) => {
                warn!("Tunnel {} accept failed: {}", tunnel.local_addr, e);
            }
        }
        drop(tunnel);
        while relays.try_join_next().is_some() {}
    }
}

/// Copy bytes both ways until one side finishes
async fn relay(
    local: TcpStream,
    remote: BoxPortStream,
    mut shutdown: watch::Receiver<bool>,
    on_break: impl FnOnce(String),
) {
    let (mut local_read, mut local_write) = local.into_split();
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    let upstream = async {
        let mut buf = vec![0u8; RELAY_BUFFER];
        loop {
            match local_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if remote_write.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = remote_write.shutdown().await;
    };

    // Ok(()) when the local client went away, Err(reason) when the remote did
    let downstream = async {
        let mut buf = vec![0u8; RELAY_BUFFER];
        loop {
            match remote_read.read(&mut buf).await {
                Ok(0) => return Err("remote closed the connection".to_string()),
                Err(e) => return Err(format!("remote stream failed: {e}")),
                Ok(n) => {
                    if local_write.write_all(&buf[..n]).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    };

    // Both relay halves must be dropped before local_write is touched again
    let outcome = {
        tokio::pin!(upstream);
        tokio::pin!(downstream);

        tokio::select! {
            result = &mut downstream => result,
            () = &mut upstream => {
                // Client finished sending; let the response drain.
                tokio::select! {
                    _ = &mut downstream => Ok(()),
                    _ = shutdown.changed() => Ok(()),
                }
            }
            _ = shutdown.changed() => Ok(()),
        }
    };

    if let Err(reason) = outcome {
        on_break(reason);
    }
    let _ = local_write.shutdown().await;
}
