use super::ring::{BroadcastTask, ring_successor};
use super::server::ServerSocketHandler;
use super::types::{FdHeader, NAME, NORMAL_TERMINATION, SessionEnd};
use crate::config::FailureDetectorConfig;
use crate::stack::{Address, Event, Links, Message, Promise, Protocol, TimeScheduler, View};

use anyhow::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::oneshot;

struct FdState {
    local_addr: Option<Address>,
    members: Vec<Address>,
    /// Members a successor may be picked from. Starts as a copy of the view
    /// and shrinks as successors are suspected.
    pingable_mbrs: Vec<Address>,
    ping_dest: Option<Address>,
    srv_sock_addr: Option<SocketAddr>,
    srv_sock_sent: bool,
    got_cache_from_coord: bool,
    pinger_running: bool,
    /// Bumped whenever monitoring is stopped, so a superseded monitor loop
    /// notices and exits.
    pinger_epoch: u64,
    num_suspect_events: usize,
    suspect_history: VecDeque<Address>,
}

/// Ring-based failure detector.
///
/// Every member opens a listener and monitors its ring successor over a
/// long-lived TCP connection. No pings are exchanged: as long as both ends
/// are alive the connection stays idle. A connection that breaks without the
/// peer sending `NORMAL_TERMINATION` makes the successor suspected.
///
/// Socket addresses of the listeners are spread through a lazily replicated
/// cache, and SUSPECT broadcasts are repeated until a view excludes the
/// suspected members.
pub struct FailureDetector {
    config: FailureDetectorConfig,
    links: Arc<Links>,
    me: Weak<FailureDetector>,
    timer: Arc<TimeScheduler>,
    state: Mutex<FdState>,
    cache: DashMap<Address, SocketAddr>,
    get_cache_promise: Promise<HashMap<Address, SocketAddr>>,
    ping_addr_promise: Promise<SocketAddr>,
    bcast_task: Arc<BroadcastTask>,
    server: Mutex<Option<Arc<ServerSocketHandler>>>,
    /// Shutdown signal of the current monitoring connection, tagged with the
    /// epoch of the monitor loop that owns it.
    ping_session: Mutex<Option<(u64, oneshot::Sender<()>)>>,
    /// Set before the monitor is re-targeted, so the resulting close is not
    /// taken for a failure. Stopped monitors are recognised by their epoch.
    regular_sock_close: AtomicBool,
}

impl FailureDetector {
    pub fn new(config: FailureDetectorConfig, timer: Arc<TimeScheduler>) -> Arc<Self> {
        let links = Links::new(NAME);
        let bcast_task = BroadcastTask::new(links.clone(), config.suspect_msg_interval());
        let history_size = config.suspect_history_size;

        Arc::new_cyclic(|me| Self {
            config,
            links,
            me: me.clone(),
            timer,
            state: Mutex::new(FdState {
                local_addr: None,
                members: Vec::new(),
                pingable_mbrs: Vec::new(),
                ping_dest: None,
                srv_sock_addr: None,
                srv_sock_sent: false,
                got_cache_from_coord: false,
                pinger_running: false,
                pinger_epoch: 0,
                num_suspect_events: 0,
                suspect_history: VecDeque::with_capacity(history_size),
            }),
            cache: DashMap::new(),
            get_cache_promise: Promise::new(),
            ping_addr_promise: Promise::new(),
            bcast_task,
            server: Mutex::new(None),
            ping_session: Mutex::new(None),
            regular_sock_close: AtomicBool::new(false),
        })
    }

    // ------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------

    pub fn local_address(&self) -> Option<Address> {
        self.state.lock().local_addr.clone()
    }

    pub fn members(&self) -> Vec<Address> {
        self.state.lock().members.clone()
    }

    pub fn pingable_members(&self) -> Vec<Address> {
        self.state.lock().pingable_mbrs.clone()
    }

    pub fn ping_dest(&self) -> Option<Address> {
        self.state.lock().ping_dest.clone()
    }

    pub fn is_monitoring(&self) -> bool {
        self.state.lock().pinger_running
    }

    pub fn srv_sock_addr(&self) -> Option<SocketAddr> {
        self.state.lock().srv_sock_addr
    }

    pub fn num_suspect_events(&self) -> usize {
        self.state.lock().num_suspect_events
    }

    /// Most recent suspicions raised by this member, oldest first.
    pub fn suspect_history(&self) -> Vec<Address> {
        self.state.lock().suspect_history.iter().cloned().collect()
    }

    pub fn cache_snapshot(&self) -> HashMap<Address, SocketAddr> {
        self.cache
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    pub fn suspected_members(&self) -> Vec<Address> {
        self.bcast_task.suspected_members()
    }

    pub fn reset_stats(&self) {
        let mut state = self.state.lock();
        state.num_suspect_events = 0;
        state.suspect_history.clear();
    }

    /// Number of predecessors currently connected to our listener.
    pub fn monitoring_clients(&self) -> usize {
        self.server
            .lock()
            .as_ref()
            .map(|server| server.client_count())
            .unwrap_or(0)
    }

    /// Remote ends of the connections currently open on our listener.
    pub fn monitoring_peers(&self) -> Vec<SocketAddr> {
        let mut peers = self
            .server
            .lock()
            .as_ref()
            .map(|server| server.client_peers())
            .unwrap_or_default();
        peers.sort();
        peers
    }

    /// Kills the listener as a crash would: connections drop without the
    /// termination byte.
    #[cfg(test)]
    pub(crate) fn crash_listener(&self) {
        if let Some(server) = self.server.lock().take() {
            server.kill();
        }
    }

    // ------------------------------------------------------------
    // Message handling
    // ------------------------------------------------------------

    fn send(&self, msg: Message, header: FdHeader) {
        match msg.with_header(NAME, &header) {
            Ok(msg) => self.links.pass_down(Event::Msg(msg)),
            Err(e) => tracing::error!("Failed to encode {} header: {}", NAME, e),
        }
    }

    fn handle_header(&self, hdr: FdHeader, src: Option<Address>) {
        match hdr {
            FdHeader::Suspect { mbrs } => {
                tracing::debug!("[SUSPECT] mbrs={:?}", mbrs);
                for mbr in mbrs {
                    self.links.pass_up(Event::Suspect(mbr.clone()));
                    self.links.pass_down(Event::Suspect(mbr));
                }
            }

            FdHeader::WhoHasSock { mbr } => self.handle_who_has_sock(mbr, src),

            FdHeader::IHaveSock { mbr, sock_addr } => {
                self.cache.insert(mbr.clone(), sock_addr);
                tracing::trace!(
                    "i-have-sock: {} --> {} (cache has {} entries)",
                    mbr,
                    sock_addr,
                    self.cache.len()
                );

                if self.state.lock().ping_dest.as_ref() == Some(&mbr) {
                    self.ping_addr_promise.set_result(sock_addr);
                }
            }

            FdHeader::GetCache { mbr } => {
                let cache = self.cache_snapshot();
                tracing::trace!("Returning cache of {} entries to {}", cache.len(), mbr);
                self.send(Message::unicast(mbr), FdHeader::GetCacheRsp { cache });
            }

            FdHeader::GetCacheRsp { cache } => {
                self.get_cache_promise.set_result(cache);
            }
        }
    }

    fn handle_who_has_sock(&self, mbr: Address, src: Option<Address>) {
        let (local_addr, srv_sock_addr) = {
            let state = self.state.lock();
            (state.local_addr.clone(), state.srv_sock_addr)
        };

        // Our own broadcasts come back to us.
        if local_addr.is_some() && local_addr == src {
            return;
        }

        tracing::trace!("who-has-sock {}", mbr);

        if let (Some(local), Some(sock_addr)) = (&local_addr, srv_sock_addr)
            && *local == mbr
        {
            self.send_i_have_sock(src, mbr, sock_addr);
            return;
        }

        let cached = self.cache.get(&mbr).map(|entry| *entry.value());
        if let Some(sock_addr) = cached {
            self.send_i_have_sock(src, mbr, sock_addr);
        }
    }

    /// Unicasts the answer to `dest`, or broadcasts it when `dest` is `None`.
    fn send_i_have_sock(&self, dest: Option<Address>, mbr: Address, sock_addr: SocketAddr) {
        let msg = match dest {
            Some(dest) => Message::unicast(dest),
            None => Message::broadcast(),
        };
        self.send(msg, FdHeader::IHaveSock { mbr, sock_addr });
    }

    fn send_who_has_sock(&self, msg: Message, mbr: &Address) {
        if let Some(local) = self.local_address() {
            tracing::debug!("[{}]: who-has {}", local, mbr);
        }
        self.send(msg, FdHeader::WhoHasSock { mbr: mbr.clone() });
    }

    /// Broadcasts SUSPECT right away and hands the member to the
    /// re-broadcast task, which repeats it until a view excludes the member.
    fn broadcast_suspect_message(&self, suspected: &Address) {
        let (local, members) = {
            let mut state = self.state.lock();
            state.num_suspect_events += 1;
            if state.suspect_history.len() >= self.config.suspect_history_size {
                state.suspect_history.pop_front();
            }
            if self.config.suspect_history_size > 0 {
                state.suspect_history.push_back(suspected.clone());
            }
            (state.local_addr.clone(), state.members.clone())
        };

        tracing::info!(
            "Suspecting {} (own address is {})",
            suspected,
            local.map(|addr| addr.to_string()).unwrap_or_default()
        );

        self.send(
            Message::broadcast(),
            FdHeader::Suspect {
                mbrs: vec![suspected.clone()],
            },
        );

        if self.bcast_task.add_suspected_member(suspected, &members) {
            self.timer.add(self.bcast_task.clone());
        }
    }

    // ------------------------------------------------------------
    // View handling
    // ------------------------------------------------------------

    fn handle_view_change(&self, view: View) {
        let members = view.members().to_vec();

        let (fetch_cache, announce, retarget, start, stop) = {
            let mut state = self.state.lock();
            state.members = members.clone();
            state.pingable_mbrs = members.clone();
            self.bcast_task.adjust_suspected_members(&members);

            let fetch_cache = !state.got_cache_from_coord;
            state.got_cache_from_coord = true;

            let announce = if state.srv_sock_sent {
                None
            } else {
                match (state.local_addr.clone(), state.srv_sock_addr) {
                    (Some(local), Some(sock_addr)) => {
                        state.srv_sock_sent = true;
                        Some((local, sock_addr))
                    }
                    _ => {
                        tracing::warn!("(VIEW_CHANGE): srv_sock_addr == null");
                        None
                    }
                }
            };

            let (mut retarget, mut start, mut stop) = (false, false, false);
            if members.len() > 1 {
                if state.pinger_running {
                    let next = ring_successor(&state.pingable_mbrs, state.local_addr.as_ref());
                    retarget = state.ping_dest.is_some() && next.is_some() && state.ping_dest != next;
                } else {
                    start = true;
                }
            } else {
                state.ping_dest = None;
                stop = true;
            }

            (fetch_cache, announce, retarget, start, stop)
        };

        tracing::debug!("VIEW_CHANGE received: {:?}", members);

        self.cache.retain(|mbr, _| members.contains(mbr));

        self.links.pass_down(Event::ViewChange(view));

        if fetch_cache && let Some(detector) = self.me.upgrade() {
            tokio::spawn(async move {
                detector.get_cache_from_coordinator().await;
            });
        }

        if let Some((local, sock_addr)) = announce {
            self.send_i_have_sock(None, local, sock_addr);
        }

        if retarget {
            self.interrupt_pinger();
        }
        if start {
            self.start_pinger();
        }
        if stop {
            self.stop_pinger();
        }
    }

    /// Seeds the cache from the coordinator. A bounded number of requests
    /// is sent; if none is answered the cache simply fills up on demand.
    async fn get_cache_from_coordinator(&self) {
        self.get_cache_promise.reset();

        for _ in 0..self.config.num_tries {
            let (coord, local) = {
                let state = self.state.lock();
                (state.members.first().cloned(), state.local_addr.clone())
            };

            if let (Some(coord), Some(local)) = (coord, local) {
                if coord == local {
                    tracing::debug!("First member; cache is empty");
                    return;
                }

                self.send(Message::unicast(coord.clone()), FdHeader::GetCache { mbr: local });

                match self
                    .get_cache_promise
                    .get_result(self.config.get_cache_timeout())
                    .await
                {
                    Some(result) => {
                        for (mbr, sock_addr) in result {
                            self.cache.insert(mbr, sock_addr);
                        }
                        tracing::trace!(
                            "Got cache from {}: cache has {} entries",
                            coord,
                            self.cache.len()
                        );
                        return;
                    }
                    None => tracing::error!("Received null cache from {}; retrying", coord),
                }
            }

            tokio::time::sleep(self.config.get_cache_retry_timeout()).await;
        }

        tracing::warn!("Giving up on fetching the address cache from the coordinator");
    }

    // ------------------------------------------------------------
    // Monitoring
    // ------------------------------------------------------------

    fn start_pinger(&self) {
        let epoch = {
            let mut state = self.state.lock();
            if state.pinger_running {
                return;
            }
            state.pinger_running = true;
            self.regular_sock_close.store(false, Ordering::SeqCst);
            state.pinger_epoch
        };

        let Some(detector) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            detector.run_pinger(epoch).await;
        });
    }

    fn stop_pinger(&self) {
        let was_running = {
            let mut state = self.state.lock();
            state.pinger_epoch += 1;
            std::mem::replace(&mut state.pinger_running, false)
        };

        if was_running {
            self.teardown_ping_socket();
        }
    }

    /// Closes the current monitoring connection so the monitor picks a new
    /// successor. The close is flagged as regular.
    fn interrupt_pinger(&self) {
        if self.is_monitoring() {
            self.regular_sock_close.store(true, Ordering::SeqCst);
            self.teardown_ping_socket();
        }
    }

    fn teardown_ping_socket(&self) {
        if let Some((_, shutdown)) = self.ping_session.lock().take() {
            let _ = shutdown.send(());
        }
    }

    /// Drops the session slot only if it still belongs to `epoch`.
    fn release_ping_session(&self, epoch: u64) {
        let mut session = self.ping_session.lock();
        if session.as_ref().is_some_and(|(owner, _)| *owner == epoch) {
            session.take();
        }
    }

    fn is_current_epoch(&self, epoch: u64) -> bool {
        self.state.lock().pinger_epoch == epoch
    }

    /// Picks the successor under the state lock. Clears the running flag
    /// in the same critical section when there is nobody left to monitor,
    /// so a concurrent view change either sees the new successor here or
    /// starts a fresh monitor.
    fn next_ping_dest(&self, epoch: u64) -> Option<Address> {
        let mut state = self.state.lock();
        if state.pinger_epoch != epoch {
            return None;
        }

        let dest = ring_successor(&state.pingable_mbrs, state.local_addr.as_ref());
        tracing::debug!(
            "determinePingDest()={:?}, pingable_mbrs={:?}",
            dest,
            state.pingable_mbrs
        );

        state.ping_dest = dest.clone();
        if dest.is_none() {
            state.pinger_running = false;
        }
        dest
    }

    fn finish_pinger(&self, epoch: u64) {
        let mut state = self.state.lock();
        if state.pinger_epoch == epoch {
            state.pinger_running = false;
        }
    }

    async fn run_pinger(self: Arc<Self>, epoch: u64) {
        tracing::trace!("Monitor started");
        let mut fetch_tries = self.config.max_fetch_tries;

        while let Some(dest) = self.next_ping_dest(epoch) {
            let Some(ping_addr) = self.fetch_ping_address(&dest).await else {
                tracing::error!(
                    "Socket address for {} could not be fetched, retrying",
                    dest
                );
                fetch_tries = fetch_tries.saturating_sub(1);
                if fetch_tries == 0 {
                    break;
                }
                tokio::time::sleep(self.config.fetch_retry_delay()).await;
                continue;
            };

            let stream = match self.setup_ping_socket(ping_addr).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::debug!(
                        "Could not create socket to {} ({}); suspecting {}",
                        dest,
                        e,
                        dest
                    );
                    self.suspect_ping_dest(&dest, epoch);
                    continue;
                }
            };

            tracing::debug!("ping_dest={}, ping_addr={}", dest, ping_addr);

            match self.monitor(stream, epoch).await {
                SessionEnd::Graceful => {
                    tracing::debug!("Peer {} closed socket normally", dest);
                    break;
                }
                end => self.handle_socket_close(&dest, end, epoch),
            }
        }

        self.finish_pinger(epoch);
        tracing::debug!("Monitor terminated");
    }

    async fn setup_ping_socket(&self, addr: SocketAddr) -> Result<TcpStream> {
        let stream =
            tokio::time::timeout(self.config.ping_addr_timeout(), TcpStream::connect(addr))
                .await??;
        Ok(stream)
    }

    /// Blocks on the monitoring connection until it ends one way or another.
    async fn monitor(&self, mut stream: TcpStream, epoch: u64) -> SessionEnd {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        {
            // Registered under the state lock so `stop_pinger` either bumps
            // the epoch first or finds this session to tear down.
            let state = self.state.lock();
            if state.pinger_epoch != epoch {
                return SessionEnd::Reset;
            }
            *self.ping_session.lock() = Some((epoch, shutdown_tx));
        }

        // A retarget requested before the session was registered.
        if self.regular_sock_close.load(Ordering::SeqCst) {
            self.release_ping_session(epoch);
            return SessionEnd::Reset;
        }

        let mut buf = [0u8; 1];
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => return SessionEnd::Reset,
                read = stream.read(&mut buf) => match read {
                    Ok(0) => return SessionEnd::Broken("eof".to_string()),
                    Ok(_) if buf[0] == NORMAL_TERMINATION => return SessionEnd::Graceful,
                    Ok(_) => continue,
                    Err(e) => return SessionEnd::Broken(e.to_string()),
                },
            }
        }
    }

    fn handle_socket_close(&self, dest: &Address, end: SessionEnd, epoch: u64) {
        self.release_ping_session(epoch);

        // The retarget flag belongs to the loop that replaced this one.
        if !self.is_current_epoch(epoch) {
            tracing::debug!("Socket to {} closed by a stopped monitor", dest);
            return;
        }

        match end {
            SessionEnd::Reset => {
                self.regular_sock_close.store(false, Ordering::SeqCst);
                tracing::debug!("Socket to {} was reset", dest);
            }
            SessionEnd::Broken(_) if self.regular_sock_close.swap(false, Ordering::SeqCst) => {
                tracing::debug!("Socket to {} was reset", dest);
            }
            SessionEnd::Broken(reason) => {
                tracing::debug!("Peer {} closed socket ({})", dest, reason);
                self.suspect_ping_dest(dest, epoch);
            }
            SessionEnd::Graceful => {
                tracing::debug!("Peer {} closed socket normally", dest);
            }
        }
    }

    fn suspect_ping_dest(&self, dest: &Address, epoch: u64) {
        {
            let mut state = self.state.lock();
            if state.pinger_epoch != epoch {
                return;
            }
            state.pingable_mbrs.retain(|mbr| mbr != dest);
        }
        self.broadcast_suspect_message(dest);
    }

    /// Looks up `mbr`'s listener address: cache first (twice, with a short
    /// pause for a freshly joined member's own announcement), then a unicast
    /// query to `mbr`, then a query to the whole group.
    async fn fetch_ping_address(&self, mbr: &Address) -> Option<SocketAddr> {
        if let Some(addr) = self.cache.get(mbr) {
            return Some(*addr);
        }

        tokio::time::sleep(self.config.cache_settle_delay()).await;
        if let Some(addr) = self.cache.get(mbr) {
            return Some(*addr);
        }

        self.ping_addr_promise.reset();
        self.send_who_has_sock(Message::unicast(mbr.clone()), mbr);
        if let Some(addr) = self
            .ping_addr_promise
            .get_result(self.config.ping_addr_timeout())
            .await
        {
            return Some(addr);
        }

        self.send_who_has_sock(Message::broadcast(), mbr);
        self.ping_addr_promise
            .get_result(self.config.ping_addr_timeout())
            .await
    }
}

impl Protocol for FailureDetector {
    fn name(&self) -> &'static str {
        NAME
    }

    fn links(&self) -> &Links {
        &self.links
    }

    fn up(&self, evt: Event) {
        match evt {
            Event::SetLocalAddress(addr) => {
                self.state.lock().local_addr = Some(addr.clone());
                self.links.pass_up(Event::SetLocalAddress(addr));
            }

            Event::Msg(mut msg) => match msg.remove_header::<FdHeader>(NAME) {
                None => self.links.pass_up(Event::Msg(msg)),
                Some(Err(e)) => {
                    tracing::error!("Dropping message with malformed {} header: {}", NAME, e)
                }
                Some(Ok(hdr)) => self.handle_header(hdr, msg.src.take()),
            },

            other => self.links.pass_up(other),
        }
    }

    fn down(&self, evt: Event) {
        match evt {
            Event::Unsuspect(mbr) => {
                self.bcast_task.remove_suspected_member(&mbr);
            }

            Event::Connect(group) => {
                self.links.pass_down(Event::Connect(group));

                let server = self.server.lock().clone();
                match server {
                    Some(server) => {
                        if let Err(e) = server.start() {
                            tracing::error!("Failed to start monitoring listener: {}", e);
                        }
                    }
                    None => tracing::error!("CONNECT received before the listener was bound"),
                }
            }

            Event::ViewChange(view) => self.handle_view_change(view),

            Event::SetLocalAddress(addr) => {
                self.state.lock().local_addr = Some(addr.clone());
                self.links.pass_down(Event::SetLocalAddress(addr));
            }

            other => self.links.pass_down(other),
        }
    }

    /// Binds the monitoring listener. Failing to resolve the bind address or
    /// to bind a port aborts construction of the stack.
    fn start(&self) -> Result<()> {
        let server = ServerSocketHandler::bind(&self.config.bind_addr, self.config.start_port)?;
        self.state.lock().srv_sock_addr = Some(server.local_addr());
        *self.server.lock() = Some(server);
        Ok(())
    }

    fn stop(&self) {
        self.bcast_task.remove_all();
        self.stop_pinger();
        if let Some(server) = self.server.lock().take() {
            server.stop();
        }
    }
}
