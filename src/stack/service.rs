//! Protocol Stack
//!
//! Owns an ordered chain of layers, wires each layer to its neighbours and
//! hands everything that leaves the top of the chain to the application over
//! an unbounded channel.

use super::protocol::{Links, Protocol};
use super::scheduler::TimeScheduler;
use super::types::{Address, Event, View};
use crate::error::StackError;

use std::sync::Arc;
use tokio::sync::mpsc;

/// The synthetic top layer. Up-events end here and are forwarded to the
/// application channel.
struct Application {
    links: Arc<Links>,
    events: mpsc::UnboundedSender<Event>,
}

impl Protocol for Application {
    fn name(&self) -> &'static str {
        "APPLICATION"
    }

    fn links(&self) -> &Links {
        &self.links
    }

    fn up(&self, evt: Event) {
        if self.events.send(evt).is_err() {
            tracing::trace!("Application receiver dropped, discarding event");
        }
    }
}

pub struct ProtocolStack {
    /// Index 0 is the top of the stack, the last entry talks to the network.
    layers: Vec<Arc<dyn Protocol>>,
    application: Arc<dyn Protocol>,
    timer: Arc<TimeScheduler>,
}

impl ProtocolStack {
    /// Wires `layers` (top first) into a stack and starts every layer,
    /// bottom-up. If any layer fails to start, the layers already started
    /// are stopped again and the error is returned.
    pub fn new(
        layers: Vec<Arc<dyn Protocol>>,
        timer: Arc<TimeScheduler>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Event>), StackError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let application: Arc<dyn Protocol> = Arc::new(Application {
            links: Links::new("APPLICATION"),
            events: tx,
        });

        if let Some(top) = layers.first() {
            application.links().set_below(top);
            top.links().set_above(&application);
        }

        for pair in layers.windows(2) {
            let (upper, lower) = (&pair[0], &pair[1]);
            upper.links().set_below(lower);
            lower.links().set_above(upper);
        }

        let names: Vec<&str> = layers.iter().map(|layer| layer.name()).collect();
        tracing::info!("Building protocol stack: {}", names.join(" / "));

        for (started, layer) in layers.iter().rev().enumerate() {
            if let Err(source) = layer.start() {
                tracing::error!("Layer {} failed to start: {:#}", layer.name(), source);

                for running in layers.iter().rev().take(started) {
                    running.stop();
                }
                timer.stop();

                return Err(StackError::LayerStart {
                    layer: layer.name(),
                    source,
                });
            }
        }

        Ok((
            Self {
                layers,
                application,
                timer,
            },
            rx,
        ))
    }

    /// Sends an event into the top of the stack.
    pub fn down(&self, evt: Event) {
        self.application.links().pass_down(evt);
    }

    pub fn set_local_address(&self, addr: Address) {
        self.down(Event::SetLocalAddress(addr));
    }

    pub fn connect(&self, group: &str) {
        self.down(Event::Connect(group.to_string()));
    }

    pub fn install_view(&self, view: View) {
        self.down(Event::ViewChange(view));
    }

    pub fn layers(&self) -> &[Arc<dyn Protocol>] {
        &self.layers
    }

    pub fn find(&self, name: &str) -> Option<&Arc<dyn Protocol>> {
        self.layers.iter().find(|layer| layer.name() == name)
    }

    pub fn timer(&self) -> &Arc<TimeScheduler> {
        &self.timer
    }

    /// Stops every layer, top-down, then the scheduler.
    pub fn stop(&self) {
        for layer in &self.layers {
            layer.stop();
        }
        self.timer.stop();
        tracing::info!("Protocol stack stopped");
    }
}
