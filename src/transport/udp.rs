//! UDP transport.
//!
//! Member addresses are the textual socket addresses of the members' UDP
//! endpoints, so a unicast destination resolves directly to a socket
//! address. A broadcast is sent to every known peer: the configured initial
//! hosts, the members of the last view and everybody heard from since. Each
//! view prunes senders that did not make it into the view. Messages are
//! bincode-encoded, one per datagram.

use crate::config::TransportConfig;
use crate::error::StackError;
use crate::stack::{Address, Event, Links, Message, Protocol};

use anyhow::Result;
use dashmap::DashSet;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

pub const NAME: &str = "UDP";

const MAX_DATAGRAM: usize = 65536;

pub struct UdpTransport {
    links: Arc<Links>,
    /// Configured bind address until `start`, the bound one afterwards.
    bind_addr: Mutex<SocketAddr>,
    std_socket: Mutex<Option<std::net::UdpSocket>>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    local_addr: Mutex<Option<Address>>,
    initial_hosts: Vec<SocketAddr>,
    peers: Arc<DashSet<SocketAddr>>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    pub fn new(config: &TransportConfig) -> Arc<Self> {
        let peers = Arc::new(DashSet::new());
        for host in &config.initial_hosts {
            peers.insert(*host);
        }

        Arc::new(Self {
            links: Links::new(NAME),
            bind_addr: Mutex::new(config.bind),
            std_socket: Mutex::new(None),
            socket: Mutex::new(None),
            local_addr: Mutex::new(None),
            initial_hosts: config.initial_hosts.clone(),
            peers,
            receiver: Mutex::new(None),
        })
    }

    /// The address other members know this endpoint by.
    pub fn address(&self) -> Address {
        Address::new(self.endpoint().to_string())
    }

    pub fn endpoint(&self) -> SocketAddr {
        *self.bind_addr.lock()
    }

    pub fn known_peers(&self) -> Vec<SocketAddr> {
        let mut peers: Vec<SocketAddr> = self.peers.iter().map(|peer| *peer).collect();
        peers.sort();
        peers
    }

    fn open(&self) -> Result<()> {
        let mut socket = self.socket.lock();
        if socket.is_some() {
            return Ok(());
        }

        let Some(std_socket) = self.std_socket.lock().take() else {
            anyhow::bail!("UDP socket on {} is closed", self.endpoint());
        };
        let udp = Arc::new(UdpSocket::from_std(std_socket)?);

        let links = self.links.clone();
        let peers = self.peers.clone();
        let receive_socket = udp.clone();
        *self.receiver.lock() = Some(tokio::spawn(async move {
            receive_loop(receive_socket, links, peers).await;
        }));

        *socket = Some(udp);
        tracing::info!("UDP transport listening on {}", self.endpoint());
        Ok(())
    }

    fn send(&self, msg: &Message) {
        let Some(socket) = self.socket.lock().clone() else {
            tracing::warn!("UDP transport not connected, dropping {:?}", msg.dest);
            return;
        };

        let encoded = match bincode::serialize(msg) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!("Failed to serialize message: {}", e);
                return;
            }
        };

        let targets: Vec<SocketAddr> = match &msg.dest {
            Some(dest) => match dest.0.parse() {
                Ok(addr) => vec![addr],
                Err(_) => {
                    tracing::warn!("Destination {} is not a socket address", dest);
                    return;
                }
            },
            None => {
                let mut targets = self.known_peers();
                let endpoint = self.endpoint();
                if !targets.contains(&endpoint) {
                    targets.push(endpoint);
                }
                targets
            }
        };

        for target in targets {
            if let Err(e) = socket.try_send_to(&encoded, target) {
                tracing::warn!("Failed to send to {}: {}", target, e);
            }
        }
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, links: Arc<Links>, peers: Arc<DashSet<SocketAddr>>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, src)) => match bincode::deserialize::<Message>(&buf[..len]) {
                Ok(msg) => {
                    if peers.insert(src) {
                        tracing::debug!("Discovered peer {}", src);
                    }
                    links.pass_up(Event::Msg(msg));
                }
                Err(e) => {
                    tracing::warn!("Failed to deserialize message from {}: {}", src, e);
                }
            },
            Err(e) => {
                tracing::error!("Failed to receive UDP packet: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

impl Protocol for UdpTransport {
    fn name(&self) -> &'static str {
        NAME
    }

    fn links(&self) -> &Links {
        &self.links
    }

    fn down(&self, evt: Event) {
        match evt {
            Event::SetLocalAddress(addr) => {
                *self.local_addr.lock() = Some(addr);
            }

            Event::Connect(group) => {
                tracing::info!("Joining group {}", group);
                if let Err(e) = self.open() {
                    tracing::error!("Failed to open UDP transport: {:#}", e);
                }
            }

            Event::ViewChange(view) => {
                let members: Vec<SocketAddr> = view
                    .members()
                    .iter()
                    .filter_map(|member| member.0.parse().ok())
                    .collect();

                self.peers.retain(|peer| {
                    members.contains(peer) || self.initial_hosts.contains(peer)
                });
                for addr in members {
                    self.peers.insert(addr);
                }
                tracing::debug!("Broadcast targets: {} peers", self.peers.len());
            }

            Event::Msg(mut msg) => {
                msg.src = self.local_addr.lock().clone();
                self.send(&msg);
            }

            other => tracing::trace!("{} consumed at the bottom of the stack", other.kind()),
        }
    }

    fn start(&self) -> Result<()> {
        let bind_addr = self.endpoint();
        let socket = std::net::UdpSocket::bind(bind_addr).map_err(|source| StackError::Bind {
            addr: bind_addr.to_string(),
            source,
        })?;
        socket.set_nonblocking(true)?;
        *self.bind_addr.lock() = socket.local_addr()?;
        *self.std_socket.lock() = Some(socket);
        Ok(())
    }

    fn stop(&self) {
        if let Some(handle) = self.receiver.lock().take() {
            handle.abort();
        }
        self.socket.lock().take();
        self.std_socket.lock().take();
    }
}
