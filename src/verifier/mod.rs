//! Suspicion Verifier Module
//!
//! Sits above the failure detector and filters out false suspicions.
//!
//! ## Core Concepts
//! - **Probe**: On a raw SUSPECT the suspected member receives `ARE_YOU_DEAD`, repeated
//!   `num_msgs` times for redundancy.
//! - **Verification Window**: A member that answers `I_AM_NOT_DEAD` within the timeout is
//!   cleared; one that stays silent is reported upward as a confirmed failure, exactly once.
//! - **Timer**: A single background task runs only while suspicions are pending and sleeps
//!   until the earliest one is due.

pub mod service;
pub mod types;

pub use service::SuspectVerifier;
