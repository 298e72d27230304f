//! Device addresses and address-matching policy.
//!
//! An [`Address`] identifies one interface endpoint: the host the server
//! runs on, the robot port, the interface code, and the index among
//! devices of that interface. Addresses are plain values with a total
//! order so they can key ordered maps and travel on the wire.
//!
//! Whether two addresses "match" depends on the server's [`MatchPolicy`]:
//! single-robot servers historically compared only `(interface, index)`,
//! while multi-robot servers need the full tuple.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::interface;

/// Errors produced when parsing an address string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    /// Wrong number of `:`-separated fields.
    #[error("malformed address '{0}': expected [[host:]robot:]interface:index")]
    Malformed(String),

    /// The interface field is neither a known name nor a number.
    #[error("unknown interface '{0}'")]
    UnknownInterface(String),

    /// A numeric field did not parse.
    #[error("invalid number '{field}' in address '{address}'")]
    InvalidNumber {
        /// The offending field.
        field: String,
        /// The full address string.
        address: String,
    },
}

/// Identity of an interface endpoint.
///
/// Field order is significant: the derived `Ord` sorts by host, then
/// robot, then interface, then index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address {
    /// Host identifier (0 = local server).
    pub host: u32,
    /// Robot port.
    pub robot: u16,
    /// Interface code (see [`crate::interface`]).
    pub interf: u16,
    /// Index among devices of the same interface.
    pub index: u16,
}

impl Address {
    /// Create a fully specified address.
    pub const fn new(host: u32, robot: u16, interf: u16, index: u16) -> Self {
        Self {
            host,
            robot,
            interf,
            index,
        }
    }

    /// Create a local address (host 0, robot 0).
    pub const fn local(interf: u16, index: u16) -> Self {
        Self::new(0, 0, interf, index)
    }

    /// Parse an address, filling omitted host/robot fields from the defaults.
    ///
    /// Accepted forms:
    /// - `interface:index` (e.g. `laser:0`)
    /// - `robot:interface:index`
    /// - `host:robot:interface:index`
    ///
    /// The interface may be given by name or by numeric code.
    pub fn parse_with(s: &str, host: u32, robot: u16) -> Result<Self, AddressError> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        let (host, robot, interf, index) = match parts.as_slice() {
            [i, n] => (host, robot, *i, *n),
            [r, i, n] => (host, parse_num(r, s)?, *i, *n),
            [h, r, i, n] => (parse_num(h, s)?, parse_num(r, s)?, *i, *n),
            _ => return Err(AddressError::Malformed(s.to_string())),
        };

        let interf = match interface::code_of(interf) {
            Some(code) => code,
            None => interf
                .parse::<u16>()
                .map_err(|_| AddressError::UnknownInterface(interf.to_string()))?,
        };

        Ok(Self::new(host, robot, interf, parse_num(index, s)?))
    }

    /// Name of this address's interface, if it is a known one.
    pub fn interface_name(&self) -> Option<&'static str> {
        interface::name_of(self.interf)
    }
}

fn parse_num<T: FromStr>(field: &str, address: &str) -> Result<T, AddressError> {
    field.parse::<T>().map_err(|_| AddressError::InvalidNumber {
        field: field.to_string(),
        address: address.to_string(),
    })
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_with(s, 0, 0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.interface_name() {
            Some(name) => write!(f, "{}:{}:{}:{}", self.host, self.robot, name, self.index),
            None => write!(f, "{}:{}:{}:{}", self.host, self.robot, self.interf, self.index),
        }
    }
}

/// Which address fields take part in a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    /// Compare host, robot, interface and index.
    #[default]
    Full,
    /// Compare interface and index only.
    InterfaceIndex,
}

impl MatchPolicy {
    /// True if `a` and `b` denote the same endpoint under this policy.
    #[inline]
    pub fn matches(self, a: &Address, b: &Address) -> bool {
        self.key(a) == self.key(b)
    }

    /// Canonical key for `addr`: fields ignored by the policy are zeroed.
    ///
    /// Two addresses match iff their keys are equal, so the key can be
    /// used directly as a map key.
    #[inline]
    pub fn key(self, addr: &Address) -> Address {
        match self {
            Self::Full => *addr,
            Self::InterfaceIndex => Address::new(0, 0, addr.interf, addr.index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{LASER, POSITION};

    #[test]
    fn parse_short_form_uses_defaults() {
        let addr = Address::parse_with("laser:1", 7, 6665).unwrap();
        assert_eq!(addr, Address::new(7, 6665, LASER, 1));
    }

    #[test]
    fn parse_robot_and_full_forms() {
        assert_eq!(
            "6666:position:0".parse::<Address>().unwrap(),
            Address::new(0, 6666, POSITION, 0)
        );
        assert_eq!(
            "3:6666:4:2".parse::<Address>().unwrap(),
            Address::new(3, 6666, POSITION, 2)
        );
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(
            "laser".parse::<Address>(),
            Err(AddressError::Malformed(_))
        ));
        assert!(matches!(
            "flux:0".parse::<Address>(),
            Err(AddressError::UnknownInterface(_))
        ));
        assert!(matches!(
            "laser:x".parse::<Address>(),
            Err(AddressError::InvalidNumber { .. })
        ));
    }

    #[test]
    fn display_round_trips() {
        let addr = Address::new(1, 6665, LASER, 3);
        assert_eq!(addr.to_string(), "1:6665:laser:3");
        assert_eq!(addr.to_string().parse::<Address>().unwrap(), addr);

        let unknown = Address::new(0, 0, 999, 0);
        assert_eq!(unknown.to_string(), "0:0:999:0");
    }

    #[test]
    fn ordering_is_field_lexicographic() {
        let a = Address::new(0, 1, 9, 9);
        let b = Address::new(0, 2, 0, 0);
        let c = Address::new(1, 0, 0, 0);
        assert!(a < b && b < c);
    }

    #[test]
    fn full_policy_distinguishes_robots() {
        let a = Address::new(0, 6665, LASER, 0);
        let b = Address::new(0, 6666, LASER, 0);
        assert!(!MatchPolicy::Full.matches(&a, &b));
        assert!(MatchPolicy::InterfaceIndex.matches(&a, &b));
    }

    #[test]
    fn interface_index_policy_still_checks_index() {
        let a = Address::local(LASER, 0);
        let b = Address::local(LASER, 1);
        assert!(!MatchPolicy::InterfaceIndex.matches(&a, &b));
    }
}
