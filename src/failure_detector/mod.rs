//! Ring Failure Detector Module
//!
//! Detects crashed members by having every member hold an idle TCP connection
//! to its successor in the view's ring order.
//!
//! ## Core Concepts
//! - **Ring Monitoring**: Each member monitors exactly one other member, so a crash is
//!   noticed by one predecessor instead of the whole group polling everyone.
//! - **Graceful Termination**: A member that stops on purpose writes a single
//!   `NORMAL_TERMINATION` byte before closing. Any other close means failure.
//! - **Address Cache**: Listener addresses are spread via `I_HAVE_SOCK` announcements,
//!   fetched from the coordinator on join and resolved on demand with `WHO_HAS_SOCK`.
//! - **Suspect Re-broadcast**: SUSPECT messages are best effort, so they are repeated
//!   until a new view no longer contains the suspected member.

pub mod ring;
pub mod server;
pub mod service;
pub mod types;

pub use service::FailureDetector;
