//! Helpers shared by the module tests.

use super::protocol::{Links, Protocol};
use super::types::{Event, Message};

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Pass-through layer that remembers every event crossing it.
///
/// Placed under a layer it captures what that layer sends towards the
/// network; `inject_up` feeds events into the layer from below.
pub struct Recorder {
    name: &'static str,
    links: Arc<Links>,
    ups: Mutex<Vec<Event>>,
    downs: Mutex<Vec<Event>>,
}

impl Recorder {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            links: Links::new(name),
            ups: Mutex::new(Vec::new()),
            downs: Mutex::new(Vec::new()),
        })
    }

    pub fn up_events(&self) -> Vec<Event> {
        self.ups.lock().clone()
    }

    pub fn down_events(&self) -> Vec<Event> {
        self.downs.lock().clone()
    }

    pub fn down_messages(&self) -> Vec<Message> {
        self.downs
            .lock()
            .iter()
            .filter_map(|evt| match evt {
                Event::Msg(msg) => Some(msg.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn inject_up(&self, evt: Event) {
        self.links.pass_up(evt);
    }

    pub fn clear(&self) {
        self.ups.lock().clear();
        self.downs.lock().clear();
    }
}

impl Protocol for Recorder {
    fn name(&self) -> &'static str {
        self.name
    }

    fn links(&self) -> &Links {
        &self.links
    }

    fn up(&self, evt: Event) {
        self.ups.lock().push(evt.clone());
        self.links.pass_up(evt);
    }

    fn down(&self, evt: Event) {
        self.downs.lock().push(evt.clone());
        self.links.pass_down(evt);
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Next application event matching `pred`, skipping the others.
pub async fn wait_for_event(
    rx: &mut mpsc::UnboundedReceiver<Event>,
    timeout: Duration,
    pred: impl Fn(&Event) -> bool,
) -> Option<Event> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(evt)) if pred(&evt) => return Some(evt),
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return None,
        }
    }
}

/// Everything already queued on the application channel.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(evt) = rx.try_recv() {
        events.push(evt);
    }
    events
}
