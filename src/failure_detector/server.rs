//! Monitoring Listener
//!
//! The server side of ring monitoring. The ring predecessor connects here
//! and blocks reading; as long as this process is alive the connection stays
//! quiet. A clean local shutdown writes `NORMAL_TERMINATION` to every client
//! before closing, so predecessors do not mistake it for a crash.
//!
//! Only one client is expected at a time, but several may overlap while the
//! ring is being re-targeted; each gets its own handler task and is tracked
//! in a shared registry.

use super::types::NORMAL_TERMINATION;
use crate::error::StackError;

use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct ClientHandle {
    peer: SocketAddr,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct ServerSocketHandler {
    local_addr: SocketAddr,
    /// Bound at construction, moved into the acceptor task on `start`.
    listener: Mutex<Option<std::net::TcpListener>>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    clients: Arc<Mutex<HashMap<u64, ClientHandle>>>,
    next_client_id: AtomicU64,
}

/// Resolves the configured bind host to an interface address.
pub fn resolve_bind_addr(host: &str) -> Result<IpAddr, StackError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    (host, 0)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .map(|addr| addr.ip())
        .ok_or_else(|| StackError::UnresolvableBindAddress(host.to_string()))
}

/// Binds to `start_port` or, if taken, to the first free port above it.
/// A `start_port` of 0 lets the OS pick.
pub fn bind_listener(ip: IpAddr, start_port: u16) -> Result<std::net::TcpListener, StackError> {
    if start_port == 0 {
        let addr = SocketAddr::new(ip, 0);
        return std::net::TcpListener::bind(addr).map_err(|source| StackError::Bind {
            addr: addr.to_string(),
            source,
        });
    }

    let mut last_error = None;
    for port in start_port..=u16::MAX {
        let addr = SocketAddr::new(ip, port);
        match std::net::TcpListener::bind(addr) {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                last_error = Some(e);
                continue;
            }
            Err(source) => {
                return Err(StackError::Bind {
                    addr: addr.to_string(),
                    source,
                });
            }
        }
    }

    Err(StackError::Bind {
        addr: format!("{}:{}..", ip, start_port),
        source: last_error
            .unwrap_or_else(|| std::io::Error::from(std::io::ErrorKind::AddrInUse)),
    })
}

impl ServerSocketHandler {
    pub fn bind(bind_host: &str, start_port: u16) -> Result<Arc<Self>, StackError> {
        let ip = resolve_bind_addr(bind_host)?;
        let listener = bind_listener(ip, start_port)?;
        let local_addr = listener.local_addr().map_err(|source| StackError::Bind {
            addr: ip.to_string(),
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| StackError::Bind {
                addr: local_addr.to_string(),
                source,
            })?;

        tracing::info!("Monitoring listener bound to {}", local_addr);

        Ok(Arc::new(Self {
            local_addr,
            listener: Mutex::new(Some(listener)),
            acceptor: Mutex::new(None),
            clients: Arc::new(Mutex::new(HashMap::new())),
            next_client_id: AtomicU64::new(0),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts accepting connections. Does nothing if already running.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut acceptor = self.acceptor.lock();
        if acceptor.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }

        let Some(std_listener) = self.listener.lock().take() else {
            tracing::warn!("Monitoring listener on {} is closed", self.local_addr);
            return Ok(());
        };
        let listener = TcpListener::from_std(std_listener)?;

        let handler = self.clone();
        *acceptor = Some(tokio::spawn(async move {
            handler.accept_loop(listener).await;
        }));

        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        tracing::trace!("Waiting for client connections on {}", self.local_addr);

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    tracing::trace!("Accepted connection from {}", peer);
                    self.spawn_client_handler(stream, peer);
                }
                Err(e) => {
                    tracing::warn!("Failed to accept on {}: {}", self.local_addr, e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    fn spawn_client_handler(&self, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (stop_tx, stop_rx) = oneshot::channel();

        // Registered under the lock the handler needs to deregister itself,
        // so a handler that ends right away cannot leave a stale entry.
        let mut clients = self.clients.lock();
        let registry = self.clients.clone();
        let task = tokio::spawn(async move {
            handle_client(stream, stop_rx).await;
            registry.lock().remove(&id);
            tracing::trace!("Client handler for {} finished", peer);
        });
        clients.insert(
            id,
            ClientHandle {
                peer,
                stop: stop_tx,
                task,
            },
        );
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn client_peers(&self) -> Vec<SocketAddr> {
        self.clients.lock().values().map(|client| client.peer).collect()
    }

    /// Closes the listener and tells every connected client that this
    /// member is leaving on purpose.
    pub fn stop(&self) {
        if let Some(handle) = self.acceptor.lock().take() {
            handle.abort();
        }
        self.listener.lock().take();

        let clients: Vec<ClientHandle> = self.clients.lock().drain().map(|(_, c)| c).collect();
        for client in clients {
            tracing::debug!("Closing monitoring connection from {}", client.peer);
            if client.stop.send(()).is_err() {
                client.task.abort();
            }
        }
    }

    /// Drops the listener and every connection without the termination
    /// byte, the way a crashed process would.
    #[cfg(test)]
    pub(crate) fn kill(&self) {
        if let Some(handle) = self.acceptor.lock().take() {
            handle.abort();
        }
        self.listener.lock().take();

        for (_, client) in self.clients.lock().drain() {
            client.task.abort();
        }
    }
}

/// Blocks on the client until it goes away or a local stop is requested.
async fn handle_client(stream: TcpStream, mut stop: oneshot::Receiver<()>) {
    let (mut reader, mut writer) = stream.into_split();
    let mut buf = [0u8; 64];

    loop {
        tokio::select! {
            _ = &mut stop => {
                if let Err(e) = writer.write_all(&[NORMAL_TERMINATION]).await {
                    tracing::trace!("Could not send normal termination: {}", e);
                }
                let _ = writer.shutdown().await;
                return;
            }
            read = reader.read(&mut buf) => match read {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            },
        }
    }
}
