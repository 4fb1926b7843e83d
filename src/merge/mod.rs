//! Partition-Merge Detector Module
//!
//! After a network split each side elects its own coordinator. Once the split
//! heals, those coordinators can hear each other again and the partitions
//! have to be merged by the membership protocol above.
//!
//! ## Core Concepts
//! - **Coordinator Announcements**: While coordinator, a member broadcasts its address at
//!   an interval drawn uniformly from `[min_interval, max_interval]`, so coordinators
//!   elected at the same moment do not announce in lockstep.
//! - **Announcement Set**: The distinct coordinators heard since the last evaluation. As
//!   soon as it holds two addresses a single MERGE carrying all of them goes up and the set
//!   shrinks back to the local address.

pub mod service;
pub mod types;

pub use service::{CoordinatorAnnouncer, MergeDetector};

#[cfg(test)]
mod tests;
