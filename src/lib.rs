//! Group Membership Core Library
//!
//! The protocol layers that keep a group of nodes informed of who is alive.
//! They are stacked on top of a transport and exchange events with an
//! external membership protocol, which decides on new views.
//!
//! ## Architecture Modules
//! - **`stack`**: The layer abstraction, the stack that wires layers together, the
//!   recurring-task scheduler and the request/response `Promise`.
//! - **`failure_detector`**: Ring-based failure detection over idle TCP connections. Raises
//!   SUSPECT when a monitored member's connection breaks.
//! - **`verifier`**: Double-checks every suspicion with a direct probe before letting it
//!   through as a confirmed failure.
//! - **`merge`**: Lets coordinators announce themselves and raises MERGE when coordinators of
//!   different partitions hear each other.
//! - **`transport`**: Bottom layers: an in-process network and a UDP transport.
//! - **`config`** / **`error`**: TOML configuration and fatal setup errors.
//!
//! A typical stack, top to bottom: `MergeDetector`, `SuspectVerifier`,
//! `FailureDetector`, `UdpTransport`.

pub mod config;
pub mod error;
pub mod failure_detector;
pub mod merge;
pub mod stack;
pub mod transport;
pub mod verifier;
