use crate::stack::Address;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const NAME: &str = "VERIFY_SUSPECT";

/// Verifier header. `from` is always the sender: the member asking in
/// `AreYouDead`, the suspected member itself in `IAmNotDead`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum VerifyHeader {
    AreYouDead { from: Address },
    IAmNotDead { from: Address },
}

impl fmt::Display for VerifyHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyHeader::AreYouDead { from } => write!(f, "[{}: ARE_YOU_DEAD from {}]", NAME, from),
            VerifyHeader::IAmNotDead { from } => write!(f, "[{}: I_AM_NOT_DEAD from {}]", NAME, from),
        }
    }
}
