use super::types::{CoordAnnouncement, NAME};
use crate::config::MergeConfig;
use crate::stack::{Address, Event, Links, Message, Protocol, Task, TimeScheduler, View};

use parking_lot::Mutex;
use rand::Rng;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Broadcasts the local coordinator's address at random intervals.
pub struct CoordinatorAnnouncer {
    links: Arc<Links>,
    coord: Address,
    min_interval_ms: u64,
    max_interval_ms: u64,
    cancelled: AtomicBool,
}

impl CoordinatorAnnouncer {
    fn new(links: Arc<Links>, coord: Address, config: &MergeConfig) -> Arc<Self> {
        Arc::new(Self {
            links,
            coord,
            min_interval_ms: config.min_interval_ms,
            max_interval_ms: config.max_interval_ms.max(config.min_interval_ms),
            cancelled: AtomicBool::new(false),
        })
    }

    pub fn stop(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl Task for CoordinatorAnnouncer {
    fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn next_interval(&self) -> Duration {
        let ms = rand::thread_rng().gen_range(self.min_interval_ms..=self.max_interval_ms);
        Duration::from_millis(ms)
    }

    fn run(&self) {
        let header = CoordAnnouncement {
            coord_addr: self.coord.clone(),
        };
        match Message::broadcast().with_header(NAME, &header) {
            Ok(msg) => self.links.pass_down(Event::Msg(msg)),
            Err(e) => tracing::error!("Failed to encode coordinator announcement: {}", e),
        }
    }
}

struct MergeState {
    local_addr: Option<Address>,
    is_coord: bool,
    /// Distinct coordinators heard from since the last evaluation.
    announcements: BTreeSet<Address>,
    announcer: Option<Arc<CoordinatorAnnouncer>>,
}

/// Detects healed partitions.
///
/// Only coordinators take part: each one announces itself to the whole group
/// and collects the announcements of others. Hearing from a second
/// coordinator means two partitions can reach each other again, which is
/// reported upward as MERGE with every coordinator seen.
pub struct MergeDetector {
    config: MergeConfig,
    links: Arc<Links>,
    timer: Arc<TimeScheduler>,
    state: Mutex<MergeState>,
}

impl MergeDetector {
    pub fn new(config: MergeConfig, timer: Arc<TimeScheduler>) -> Arc<Self> {
        Arc::new(Self {
            config,
            links: Links::new(NAME),
            timer,
            state: Mutex::new(MergeState {
                local_addr: None,
                is_coord: false,
                announcements: BTreeSet::new(),
                announcer: None,
            }),
        })
    }

    pub fn is_coordinator(&self) -> bool {
        self.state.lock().is_coord
    }

    pub fn announcements(&self) -> Vec<Address> {
        self.state.lock().announcements.iter().cloned().collect()
    }

    fn handle_announcement(&self, coord: Address) {
        let coords = {
            let mut state = self.state.lock();
            if !state.is_coord {
                tracing::trace!("Not coordinator, ignoring announcement from {}", coord);
                return;
            }

            if state.announcements.insert(coord.clone()) {
                tracing::debug!(
                    "received announcement: {}, announcements={:?}",
                    coord,
                    state.announcements
                );
            } else {
                tracing::debug!(
                    "discarded duplicate announcement: {}, announcements={:?}",
                    coord,
                    state.announcements
                );
            }

            if state.announcements.len() < 2 {
                return;
            }

            let coords: Vec<Address> = state.announcements.iter().cloned().collect();
            state.announcements.clear();
            if let Some(local) = state.local_addr.clone() {
                state.announcements.insert(local);
            }
            coords
        };

        tracing::debug!("passing up MERGE event, coords={:?}", coords);

        if self.config.use_separate_thread {
            let links = self.links.clone();
            tokio::spawn(async move {
                links.pass_up(Event::Merge(coords));
            });
        } else {
            self.links.pass_up(Event::Merge(coords));
        }
    }

    fn handle_view_change(&self, view: &View) {
        let mut stopped = None;
        let started = {
            let mut state = self.state.lock();
            let local_is_coord =
                state.local_addr.is_some() && view.coordinator() == state.local_addr.as_ref();

            match (local_is_coord, state.is_coord) {
                (true, false) => {
                    state.is_coord = true;
                    self.start_announcer(&mut state)
                }
                (false, true) => {
                    state.is_coord = false;
                    stopped = state.announcer.take();
                    state.announcements.clear();
                    None
                }
                _ => None,
            }
        };

        if let Some(task) = started {
            self.timer.add(task);
            tracing::debug!(
                "coordinator announcement task started, announcements={:?}",
                self.announcements()
            );
        }
        if let Some(task) = stopped {
            task.stop();
            tracing::debug!("coordinator announcement task stopped");
        }
    }

    fn start_announcer(&self, state: &mut MergeState) -> Option<Arc<CoordinatorAnnouncer>> {
        if state.announcer.is_some() {
            return None;
        }
        let local = state.local_addr.clone()?;

        state.announcements.insert(local.clone());
        let task = CoordinatorAnnouncer::new(self.links.clone(), local, &self.config);
        state.announcer = Some(task.clone());
        Some(task)
    }
}

impl Protocol for MergeDetector {
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

            Event::Msg(mut msg) => match msg.remove_header::<CoordAnnouncement>(NAME) {
                None => self.links.pass_up(Event::Msg(msg)),
                Some(Err(e)) => {
                    tracing::error!("Dropping message with malformed {} header: {}", NAME, e)
                }
                Some(Ok(hdr)) => self.handle_announcement(hdr.coord_addr),
            },

            other => self.links.pass_up(other),
        }
    }

    fn down(&self, evt: Event) {
        match evt {
            Event::ViewChange(view) => {
                self.links.pass_down(Event::ViewChange(view.clone()));
                self.handle_view_change(&view);
            }

            Event::SetLocalAddress(addr) => {
                self.state.lock().local_addr = Some(addr.clone());
                self.links.pass_down(Event::SetLocalAddress(addr));
            }

            other => self.links.pass_down(other),
        }
    }

    fn stop(&self) {
        let announcer = {
            let mut state = self.state.lock();
            state.is_coord = false;
            state.announcements.clear();
            state.announcer.take()
        };
        if let Some(task) = announcer {
            task.stop();
        }
    }
}
