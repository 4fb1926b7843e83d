//! Protocol Layer Abstraction
//!
//! A layer is a bidirectional pipeline stage. Events travelling towards the
//! application enter through `up`, events travelling towards the network
//! enter through `down`. Anything a layer does not handle is forwarded
//! unchanged, in the same direction, to its neighbour.

use super::types::Event;

use anyhow::Result;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};

/// A single stage of a `ProtocolStack`.
pub trait Protocol: Send + Sync {
    fn name(&self) -> &'static str;

    /// Neighbour wiring, filled in by the stack.
    fn links(&self) -> &Links;

    fn up(&self, evt: Event) {
        self.links().pass_up(evt);
    }

    fn down(&self, evt: Event) {
        self.links().pass_down(evt);
    }

    /// Called once while the stack is being built. An error aborts
    /// construction of the whole stack.
    fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Stops all background activity. Must be idempotent.
    fn stop(&self) {}
}

/// Weak references to the layers directly above and below.
///
/// Cheap to clone behind an `Arc`, so background tasks can keep injecting
/// events without holding the layer itself alive.
pub struct Links {
    owner: &'static str,
    above: RwLock<Option<Weak<dyn Protocol>>>,
    below: RwLock<Option<Weak<dyn Protocol>>>,
}

impl Links {
    pub fn new(owner: &'static str) -> Arc<Self> {
        Arc::new(Self {
            owner,
            above: RwLock::new(None),
            below: RwLock::new(None),
        })
    }

    pub fn set_above(&self, layer: &Arc<dyn Protocol>) {
        *self.above.write() = Some(Arc::downgrade(layer));
    }

    pub fn set_below(&self, layer: &Arc<dyn Protocol>) {
        *self.below.write() = Some(Arc::downgrade(layer));
    }

    pub fn pass_up(&self, evt: Event) {
        let above = self.above.read().as_ref().and_then(Weak::upgrade);
        match above {
            Some(layer) => layer.up(evt),
            None => tracing::trace!(
                "{}: no layer above, dropping {}",
                self.owner,
                evt.kind()
            ),
        }
    }

    pub fn pass_down(&self, evt: Event) {
        let below = self.below.read().as_ref().and_then(Weak::upgrade);
        match below {
            Some(layer) => layer.down(evt),
            None => tracing::trace!(
                "{}: no layer below, dropping {}",
                self.owner,
                evt.kind()
            ),
        }
    }
}
