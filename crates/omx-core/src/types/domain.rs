//! Protocol message domains and reserved identities.
//!
//! A domain type distinguishes the kind of stream a message belongs to
//! (login, directory, dictionary, market price, ...). The discriminant
//! values are preserved for wire-format compatibility.

use serde::{Deserialize, Serialize};

/// Protocol-level message domain of an item stream.
///
/// Values above [`DomainType::MarketPrice`] are user-defined domains; the
/// engine treats every unknown value as a market-data domain routed like
/// `MarketPrice`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DomainType {
    Login = 1,
    Directory = 4,
    Dictionary = 5,
    MarketPrice = 6,
    MarketByOrder = 7,
    MarketByPrice = 8,
    SymbolList = 10,
    /// Private tunnel container domain.
    System = 127,
}

impl DomainType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for DomainType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Login => write!(f, "login"),
            Self::Directory => write!(f, "directory"),
            Self::Dictionary => write!(f, "dictionary"),
            Self::MarketPrice => write!(f, "market_price"),
            Self::MarketByOrder => write!(f, "market_by_order"),
            Self::MarketByPrice => write!(f, "market_by_price"),
            Self::SymbolList => write!(f, "symbol_list"),
            Self::System => write!(f, "system"),
        }
    }
}

/// Reserved protocol stream id of the login stream on every channel.
pub const LOGIN_STREAM_ID: i32 = 1;

/// Identifier of one transport channel. Assigned by the transport layer when
/// the channel connects; stable for the channel's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u32);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// A directory entry: a named service resolved to a routable channel.
///
/// Produced by the directory collaborator's lookup contract; the engine
/// never constructs these from wire data itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub name: String,
    pub service_id: u32,
    pub channel: ChannelId,
}
