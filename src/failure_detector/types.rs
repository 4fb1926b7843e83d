use crate::stack::Address;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

/// Header slot used by the failure detector.
pub const NAME: &str = "FD_SOCK";

/// Byte written by a member that closes a monitoring connection on purpose.
/// Anything else that ends the connection counts as a failure of that member.
pub const NORMAL_TERMINATION: u8 = 9;

/// Failure detector header.
///
/// - `Suspect`: best-effort broadcast of suspected members.
/// - `WhoHasSock` / `IHaveSock`: query and answer for a member's monitoring
///   socket address. Every receiver of an answer updates its cache.
/// - `GetCache` / `GetCacheRsp`: a joining member seeding its cache from the
///   coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum FdHeader {
    Suspect {
        mbrs: Vec<Address>,
    },

    WhoHasSock {
        mbr: Address,
    },

    IHaveSock {
        mbr: Address,
        sock_addr: SocketAddr,
    },

    GetCache {
        mbr: Address,
    },

    GetCacheRsp {
        cache: HashMap<Address, SocketAddr>,
    },
}

impl fmt::Display for FdHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FdHeader::Suspect { mbrs } => write!(f, "SUSPECT, mbrs={:?}", mbrs),
            FdHeader::WhoHasSock { mbr } => write!(f, "WHO_HAS_SOCK, mbr={}", mbr),
            FdHeader::IHaveSock { mbr, sock_addr } => {
                write!(f, "I_HAVE_SOCK, mbr={}, sock_addr={}", mbr, sock_addr)
            }
            FdHeader::GetCache { mbr } => write!(f, "GET_CACHE, mbr={}", mbr),
            FdHeader::GetCacheRsp { cache } => write!(f, "GET_CACHE_RSP, cache={:?}", cache),
        }
    }
}

/// How a monitoring session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEnd {
    /// The peer sent `NORMAL_TERMINATION`.
    Graceful,
    /// The local side tore the socket down to retarget or stop monitoring.
    Reset,
    /// The connection broke: EOF or an I/O error.
    Broken(String),
}
