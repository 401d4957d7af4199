//! Newtype wrapper for mesh node numbers.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::BROADCAST_NUM;

/// A Meshtastic node number.
///
/// Displays in the canonical `!xxxxxxxx` form (8 lowercase hex digits) that
/// the firmware and apps use, and serializes as that string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[must_use]
pub struct NodeId(u32);

/// Error returned when a string is not a valid node identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid node id: {0:?}")]
pub struct InvalidNodeId(pub String);

impl NodeId {
    pub const fn new(num: u32) -> Self {
        Self(num)
    }

    /// The raw 32-bit node number.
    pub const fn num(self) -> u32 {
        self.0
    }

    /// Whether this is the broadcast address rather than a real node.
    pub const fn is_broadcast(self) -> bool {
        self.0 == BROADCAST_NUM
    }

    /// Short fallback label for nodes whose names are not known yet,
    /// e.g. `Node-1234` for `!abcd1234`.
    pub fn friendly_label(self) -> String {
        format!("Node-{:04X}", self.0 & 0xFFFF)
    }
}

impl From<u32> for NodeId {
    fn from(num: u32) -> Self {
        Self(num)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "!{:08x}", self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId(!{:08x})", self.0)
    }
}

impl FromStr for NodeId {
    type Err = InvalidNodeId;

    /// Accepts `!abcd1234`, `0xabcd1234`, or a decimal node number.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parsed = if let Some(hex) = trimmed.strip_prefix('!') {
            u32::from_str_radix(hex, 16)
        } else if let Some(hex) = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        {
            u32::from_str_radix(hex, 16)
        } else {
            trimmed.parse::<u32>()
        };
        parsed
            .map(NodeId)
            .map_err(|_| InvalidNodeId(s.to_string()))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_bang_hex() {
        assert_eq!(NodeId::new(0xabcd1234).to_string(), "!abcd1234");
        assert_eq!(NodeId::new(0x1).to_string(), "!00000001");
    }

    #[test]
    fn parse_accepts_all_forms() {
        assert_eq!("!abcd1234".parse::<NodeId>().unwrap().num(), 0xabcd1234);
        assert_eq!("0xABCD1234".parse::<NodeId>().unwrap().num(), 0xabcd1234);
        assert_eq!("42".parse::<NodeId>().unwrap().num(), 42);
        assert_eq!(" !0000002a ".parse::<NodeId>().unwrap().num(), 42);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("".parse::<NodeId>().is_err());
        assert!("!".parse::<NodeId>().is_err());
        assert!("!xyz".parse::<NodeId>().is_err());
        assert!("!123456789".parse::<NodeId>().is_err());
        assert!("-5".parse::<NodeId>().is_err());
    }

    #[test]
    fn friendly_label_uses_low_hex_digits() {
        assert_eq!(NodeId::new(0xabcd1234).friendly_label(), "Node-1234");
        assert_eq!(NodeId::new(0x0000beef).friendly_label(), "Node-BEEF");
    }

    #[test]
    fn broadcast_detection() {
        assert!(NodeId::new(BROADCAST_NUM).is_broadcast());
        assert!(!NodeId::new(7).is_broadcast());
    }

    #[test]
    fn serde_as_string() {
        let id = NodeId::new(0xabcd1234);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"!abcd1234\"");
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
