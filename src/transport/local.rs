//! In-process transport.
//!
//! Every stack attached to the same `LocalNetwork` can reach every other one
//! through unbounded channels. Broadcasts are looped back to the sender, like
//! a multicast socket would. Used to run several members inside one process.

use crate::stack::{Address, Event, Links, Message, Protocol};

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const NAME: &str = "LOCAL_TRANSPORT";

/// Shared hub that routes messages between attached members.
#[derive(Default)]
pub struct LocalNetwork {
    nodes: DashMap<Address, mpsc::UnboundedSender<Message>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn attach(&self, addr: Address) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.nodes.insert(addr, tx);
        rx
    }

    /// Removes `addr` from the network; messages to it are silently lost
    /// from now on.
    pub fn detach(&self, addr: &Address) {
        self.nodes.remove(addr);
    }

    pub fn members(&self) -> Vec<Address> {
        let mut members: Vec<Address> = self.nodes.iter().map(|e| e.key().clone()).collect();
        members.sort();
        members
    }

    fn deliver(&self, msg: Message) {
        match msg.dest.clone() {
            Some(dest) => {
                let sender = self.nodes.get(&dest).map(|entry| entry.value().clone());
                match sender {
                    Some(sender) => {
                        let _ = sender.send(msg);
                    }
                    None => tracing::trace!("No route to {}, dropping message", dest),
                }
            }
            None => {
                let senders: Vec<_> = self.nodes.iter().map(|e| e.value().clone()).collect();
                for sender in senders {
                    let _ = sender.send(msg.clone());
                }
            }
        }
    }
}

/// Bottom layer that sends through a `LocalNetwork`.
pub struct LocalTransport {
    links: Arc<Links>,
    network: Arc<LocalNetwork>,
    local_addr: Mutex<Option<Address>>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl LocalTransport {
    pub fn new(network: Arc<LocalNetwork>) -> Arc<Self> {
        Arc::new(Self {
            links: Links::new(NAME),
            network,
            local_addr: Mutex::new(None),
            receiver: Mutex::new(None),
        })
    }

    fn register(&self, addr: Address) {
        let mut rx = self.network.attach(addr.clone());
        *self.local_addr.lock() = Some(addr);

        let links = self.links.clone();
        let handle = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                links.pass_up(Event::Msg(msg));
            }
        });

        if let Some(previous) = self.receiver.lock().replace(handle) {
            previous.abort();
        }
    }
}

impl Protocol for LocalTransport {
    fn name(&self) -> &'static str {
        NAME
    }

    fn links(&self) -> &Links {
        &self.links
    }

    fn down(&self, evt: Event) {
        match evt {
            Event::SetLocalAddress(addr) => self.register(addr),

            Event::Msg(mut msg) => {
                let local = self.local_addr.lock().clone();
                if local.is_none() {
                    tracing::warn!("Local address not set, dropping outgoing message");
                    return;
                }
                msg.src = local;
                self.network.deliver(msg);
            }

            other => tracing::trace!("{} consumed at the bottom of the stack", other.kind()),
        }
    }

    fn stop(&self) {
        if let Some(addr) = self.local_addr.lock().as_ref() {
            self.network.detach(addr);
        }
        if let Some(handle) = self.receiver.lock().take() {
            handle.abort();
        }
    }
}
