use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identity of a group member.
///
/// Totally ordered so that views can be sorted and the coordinator chosen
/// lexicographically; used as a map key by every layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub String);

impl Address {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// An agreed membership snapshot. Position 0 is the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct View {
    members: Vec<Address>,
}

impl View {
    /// Builds a view, dropping duplicates while keeping first-seen order.
    pub fn new(members: impl IntoIterator<Item = Address>) -> Self {
        let mut unique: Vec<Address> = Vec::new();
        for member in members {
            if !unique.contains(&member) {
                unique.push(member);
            }
        }
        Self { members: unique }
    }

    pub fn members(&self) -> &[Address] {
        &self.members
    }

    pub fn coordinator(&self) -> Option<&Address> {
        self.members.first()
    }

    pub fn contains(&self, addr: &Address) -> bool {
        self.members.contains(addr)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// A message travelling through the stack.
///
/// Each protocol stores its own header under its name. Headers are opaque
/// bytes to every layer except the owner, so a layer never needs to know
/// about headers it does not handle.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Message {
    /// `None` means "send to every member of the group".
    pub dest: Option<Address>,
    /// Filled in by the transport on the way down.
    pub src: Option<Address>,
    headers: BTreeMap<String, Vec<u8>>,
    pub payload: Vec<u8>,
}

impl Message {
    /// A message addressed to the whole group.
    pub fn broadcast() -> Self {
        Self::default()
    }

    pub fn unicast(dest: Address) -> Self {
        Self {
            dest: Some(dest),
            ..Self::default()
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.dest.is_none()
    }

    pub fn with_header<H: Serialize>(mut self, name: &str, header: &H) -> Result<Self> {
        self.put_header(name, header)?;
        Ok(self)
    }

    pub fn put_header<H: Serialize>(&mut self, name: &str, header: &H) -> Result<()> {
        let encoded = bincode::serialize(header)?;
        self.headers.insert(name.to_string(), encoded);
        Ok(())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains_key(name)
    }

    /// Removes and decodes the header stored under `name`.
    ///
    /// Returns `None` when no such header is present, `Some(Err(_))` when the
    /// bytes do not decode as `H`.
    pub fn remove_header<H: DeserializeOwned>(&mut self, name: &str) -> Option<Result<H>> {
        let raw = self.headers.remove(name)?;
        Some(bincode::deserialize(&raw).map_err(anyhow::Error::from))
    }

    pub fn header_names(&self) -> impl Iterator<Item = &str> {
        self.headers.keys().map(String::as_str)
    }
}

/// Events exchanged between neighbouring layers.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Join the named group. Starts the monitoring listener.
    Connect(String),
    SetLocalAddress(Address),
    ViewChange(View),
    Suspect(Address),
    Unsuspect(Address),
    /// Candidate coordinators of partitions that can see each other again.
    Merge(Vec<Address>),
    Msg(Message),
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Connect(_) => "CONNECT",
            Event::SetLocalAddress(_) => "SET_LOCAL_ADDRESS",
            Event::ViewChange(_) => "VIEW_CHANGE",
            Event::Suspect(_) => "SUSPECT",
            Event::Unsuspect(_) => "UNSUSPECT",
            Event::Merge(_) => "MERGE",
            Event::Msg(_) => "MSG",
        }
    }
}
