use super::types::{NAME, VerifyHeader};
use crate::config::VerifierConfig;
use crate::stack::{Address, Event, Links, Message, Protocol};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct VerifierState {
    local_addr: Option<Address>,
    /// Pending suspects and when they were first suspected.
    suspects: HashMap<Address, Instant>,
    timer_running: bool,
}

/// Double-checks suspicions before they reach the membership protocol.
///
/// A SUSPECT coming up is held back and the suspected member is asked
/// directly whether it is dead. An answer within the timeout clears the
/// suspicion (UNSUSPECT is sent both ways); silence confirms it and the
/// SUSPECT continues upward.
pub struct SuspectVerifier {
    config: VerifierConfig,
    links: Arc<Links>,
    me: Weak<SuspectVerifier>,
    state: Mutex<VerifierState>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl SuspectVerifier {
    pub fn new(config: VerifierConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            config,
            links: Links::new(NAME),
            me: me.clone(),
            state: Mutex::new(VerifierState {
                local_addr: None,
                suspects: HashMap::new(),
                timer_running: false,
            }),
            timer: Mutex::new(None),
        })
    }

    /// Members currently awaiting verification, sorted.
    pub fn pending_suspects(&self) -> Vec<Address> {
        let mut pending: Vec<Address> = self.state.lock().suspects.keys().cloned().collect();
        pending.sort();
        pending
    }

    pub fn is_timer_running(&self) -> bool {
        self.state.lock().timer_running
    }

    fn send(&self, dest: &Address, header: VerifyHeader) {
        for _ in 0..self.config.probe_count() {
            match Message::unicast(dest.clone()).with_header(NAME, &header) {
                Ok(msg) => self.links.pass_down(Event::Msg(msg)),
                Err(e) => {
                    tracing::error!("Failed to encode {} header: {}", NAME, e);
                    return;
                }
            }
        }
    }

    fn suspect(&self, mbr: Address) {
        let (local, start_timer) = {
            let mut state = self.state.lock();
            if state.suspects.contains_key(&mbr) {
                return;
            }
            state.suspects.insert(mbr.clone(), Instant::now());
            let start_timer = !state.timer_running;
            state.timer_running = true;
            (state.local_addr.clone(), start_timer)
        };

        tracing::trace!("verifying that {} is dead", mbr);

        match local {
            Some(from) => self.send(&mbr, VerifyHeader::AreYouDead { from }),
            None => tracing::error!("Local address not set, cannot probe {}", mbr),
        }

        if start_timer {
            self.start_timer();
        }
    }

    fn unsuspect(&self, mbr: Address) {
        if self.state.lock().suspects.remove(&mbr).is_none() {
            return;
        }

        tracing::trace!("member {} is not dead!", mbr);
        self.links.pass_down(Event::Unsuspect(mbr.clone()));
        self.links.pass_up(Event::Unsuspect(mbr));
    }

    fn start_timer(&self) {
        let Some(verifier) = self.me.upgrade() else {
            return;
        };

        let handle = tokio::spawn(async move {
            verifier.run_timer().await;
        });
        if let Some(previous) = self.timer.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Escalates every suspect whose verification window has passed, then
    /// sleeps until the next one is due. Exits once nobody is pending.
    async fn run_timer(self: Arc<Self>) {
        let timeout = self.config.timeout();

        loop {
            let (expired, next_wait) = {
                let mut state = self.state.lock();
                let now = Instant::now();
                let mut expired = Vec::new();
                let mut next_wait: Option<Duration> = None;

                for (mbr, since) in &state.suspects {
                    let elapsed = now.saturating_duration_since(*since);
                    if elapsed >= timeout {
                        expired.push(mbr.clone());
                    } else {
                        let remaining = timeout - elapsed;
                        next_wait = Some(next_wait.map_or(remaining, |wait| wait.min(remaining)));
                    }
                }

                for mbr in &expired {
                    state.suspects.remove(mbr);
                }
                if state.suspects.is_empty() {
                    state.timer_running = false;
                }

                (expired, next_wait)
            };

            for mbr in expired {
                tracing::trace!("{} is dead (passing up SUSPECT event)", mbr);
                self.links.pass_up(Event::Suspect(mbr));
            }

            match next_wait {
                Some(wait) => tokio::time::sleep(wait).await,
                None => break,
            }
        }
    }
}

impl Protocol for SuspectVerifier {
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

            // Held back until verified.
            Event::Suspect(mbr) => self.suspect(mbr),

            Event::Msg(mut msg) => match msg.remove_header::<VerifyHeader>(NAME) {
                None => self.links.pass_up(Event::Msg(msg)),
                Some(Err(e)) => {
                    tracing::error!("Dropping message with malformed {} header: {}", NAME, e)
                }
                Some(Ok(VerifyHeader::AreYouDead { from })) => {
                    let local = self.state.lock().local_addr.clone();
                    match local {
                        Some(local) => self.send(&from, VerifyHeader::IAmNotDead { from: local }),
                        None => tracing::error!("ARE_YOU_DEAD from {}: local address not set", from),
                    }
                }
                Some(Ok(VerifyHeader::IAmNotDead { from })) => self.unsuspect(from),
            },

            other => self.links.pass_up(other),
        }
    }

    fn down(&self, evt: Event) {
        match &evt {
            Event::SetLocalAddress(addr) => {
                self.state.lock().local_addr = Some(addr.clone());
            }
            // Members already excluded need no verdict.
            Event::ViewChange(view) => {
                self.state
                    .lock()
                    .suspects
                    .retain(|mbr, _| view.contains(mbr));
            }
            _ => {}
        }
        self.links.pass_down(evt);
    }

    fn stop(&self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
        let mut state = self.state.lock();
        state.suspects.clear();
        state.timer_running = false;
    }
}
