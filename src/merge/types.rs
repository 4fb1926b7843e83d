use crate::stack::Address;
use serde::{Deserialize, Serialize};

pub const NAME: &str = "MERGE3";

/// Periodic "I am a coordinator" broadcast.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoordAnnouncement {
    pub coord_addr: Address,
}
