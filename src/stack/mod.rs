//! Protocol Stack Module
//!
//! The building blocks every membership layer is written against.
//!
//! ## Core Concepts
//! - **Layers**: `Protocol` implementations chained into a `ProtocolStack`. Events flow
//!   `down` from the application towards the network and `up` from the network towards
//!   the application; a layer consumes, transforms or forwards each one.
//! - **Events & Messages**: `Event` is the vocabulary shared by all layers. `Message`
//!   carries one opaque header per protocol, decoded only by the layer that owns it.
//! - **Timers**: `TimeScheduler` runs recurring tasks that report their own next
//!   interval and cancellation.
//! - **Rendezvous**: `Promise` turns an asynchronous request/response exchange into a
//!   bounded wait inside a background task.

pub mod promise;
pub mod protocol;
pub mod scheduler;
pub mod service;
pub mod types;

#[cfg(test)]
pub mod testing;

pub use promise::Promise;
pub use protocol::{Links, Protocol};
pub use scheduler::{Task, TimeScheduler};
pub use service::ProtocolStack;
pub use types::{Address, Event, Message, View};
