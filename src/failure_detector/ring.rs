//! Ring topology and SUSPECT retransmission.

use super::types::{FdHeader, NAME};
use crate::stack::{Address, Event, Links, Message, Task};

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// The member `local` monitors: the next entry after it in `members`,
/// wrapping to the first. `None` if there are fewer than two members or
/// `local` is not among them.
pub fn ring_successor(members: &[Address], local: Option<&Address>) -> Option<Address> {
    let local = local?;
    if members.len() < 2 {
        return None;
    }

    let pos = members.iter().position(|mbr| mbr == local)?;
    Some(members[(pos + 1) % members.len()].clone())
}

struct BroadcastState {
    suspected: Vec<Address>,
    stopped: bool,
}

/// Periodically re-broadcasts SUSPECT for every member still in the set.
///
/// SUSPECT is sent unreliably, so it is repeated until a view arrives that no
/// longer contains the suspected members. The task cancels itself once the
/// set is empty; adding a member to an empty set re-arms it.
pub struct BroadcastTask {
    links: Arc<Links>,
    interval: Duration,
    state: Mutex<BroadcastState>,
}

impl BroadcastTask {
    pub fn new(links: Arc<Links>, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            links,
            interval,
            state: Mutex::new(BroadcastState {
                suspected: Vec::new(),
                stopped: true,
            }),
        })
    }

    /// Adds `mbr` if it is one of `members`.
    ///
    /// Returns `true` when the task was idle and has to be handed to the
    /// scheduler again.
    pub fn add_suspected_member(&self, mbr: &Address, members: &[Address]) -> bool {
        if !members.contains(mbr) {
            return false;
        }

        let mut state = self.state.lock();
        if !state.suspected.contains(mbr) {
            state.suspected.push(mbr.clone());
            tracing::debug!("mbr={} (size={})", mbr, state.suspected.len());
        }

        if state.stopped && !state.suspected.is_empty() {
            state.stopped = false;
            return true;
        }
        false
    }

    pub fn remove_suspected_member(&self, mbr: &Address) {
        tracing::debug!("member is {}", mbr);

        let mut state = self.state.lock();
        state.suspected.retain(|suspected| suspected != mbr);
        if state.suspected.is_empty() {
            state.stopped = true;
        }
    }

    pub fn remove_all(&self) {
        let mut state = self.state.lock();
        state.suspected.clear();
        state.stopped = true;
    }

    /// Drops every suspected member that is not part of `new_members`.
    pub fn adjust_suspected_members(&self, new_members: &[Address]) {
        if new_members.is_empty() {
            return;
        }

        let mut state = self.state.lock();
        state.suspected.retain(|suspected| {
            let keep = new_members.contains(suspected);
            if !keep {
                tracing::debug!("removed {} from suspect rebroadcast", suspected);
            }
            keep
        });
        if state.suspected.is_empty() {
            state.stopped = true;
        }
    }

    pub fn suspected_members(&self) -> Vec<Address> {
        self.state.lock().suspected.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }
}

impl Task for BroadcastTask {
    fn cancelled(&self) -> bool {
        self.state.lock().stopped
    }

    fn next_interval(&self) -> Duration {
        self.interval
    }

    fn run(&self) {
        let mbrs = {
            let mut state = self.state.lock();
            if state.suspected.is_empty() {
                state.stopped = true;
                tracing::debug!("task done (no suspected members)");
                return;
            }
            state.suspected.clone()
        };

        tracing::debug!(
            "broadcasting SUSPECT message (suspected_mbrs={:?}) to group",
            mbrs
        );

        match Message::broadcast().with_header(NAME, &FdHeader::Suspect { mbrs }) {
            Ok(msg) => self.links.pass_down(Event::Msg(msg)),
            Err(e) => tracing::error!("Failed to encode SUSPECT header: {}", e),
        }
    }
}
