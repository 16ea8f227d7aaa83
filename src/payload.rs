//! The data being transmitted via RTR.
//!
//! The types in here provide a more compact representation of validated
//! payloads than the PDUs. They also implement all the traits necessary to
//! use them as keys in collections so cache state can be kept and compared.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use bytes::Bytes;
use serde::{Deserialize, Serialize};


//------------ RouteOrigin ---------------------------------------------------

/// A route origin authorisation.
///
/// Values of this type authorise the autonomous system given in the `asn`
/// field to originate routes for the IP address prefix given by `addr` and
/// `prefix_len` as well as any more specific prefix up to `max_len`.
///
/// The type covers both IPv4 and IPv6 prefixes which are separate payload
/// PDUs in RTR.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RouteOrigin {
    /// The address of the prefix to authorise.
    pub addr: IpAddr,

    /// The length of the prefix.
    pub prefix_len: u8,

    /// The maximum authorised prefix length.
    pub max_len: u8,

    /// The autonomous system allowed to announce the prefix.
    pub asn: u32,
}

impl RouteOrigin {
    /// Creates a new value from its components.
    pub fn new(addr: IpAddr, prefix_len: u8, max_len: u8, asn: u32) -> Self {
        RouteOrigin { addr, prefix_len, max_len, asn }
    }

    /// Returns whether this is an IPv4 origin.
    pub fn is_v4(self) -> bool {
        self.addr.is_ipv4()
    }
}

impl fmt::Display for RouteOrigin {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f, "{}/{}-{} => AS{}",
            self.addr, self.prefix_len, self.max_len, self.asn
        )
    }
}


//------------ RouterKey -----------------------------------------------------

/// A BGPsec router key.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RouterKey {
    /// The subject key identifier of the router key.
    pub key_identifier: [u8; 20],

    /// The autonomous system authorised to use the key.
    pub asn: u32,

    /// The actual key.
    pub key_info: Bytes,
}

impl RouterKey {
    /// Creates a new value from the various components.
    pub fn new(
        key_identifier: [u8; 20], asn: u32, key_info: Bytes
    ) -> Self {
        RouterKey { key_identifier, asn, key_info }
    }
}


//------------ Aspa ----------------------------------------------------------

/// An ASPA unit.
///
/// The unit authorises the customer ASN to be routed through the provider
/// ASNs. The whole unit is the atom of the protocol: an announcement
/// replaces any previously held provider list for the customer.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Aspa {
    /// The customer ASN.
    pub customer: u32,

    /// The provider ASNs.
    pub providers: Vec<u32>,
}

impl Aspa {
    /// Creates a new ASPA unit from its components.
    pub fn new(customer: u32, providers: Vec<u32>) -> Self {
        Aspa { customer, providers }
    }
}


//------------ Payload -------------------------------------------------------

/// All payload types supported by RTR and this crate.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Payload {
    /// A route origin authorisation.
    Origin(RouteOrigin),

    /// A BGPsec router key.
    RouterKey(RouterKey),

    /// An ASPA unit.
    Aspa(Aspa),
}

impl Payload {
    /// Creates a new prefix origin payload.
    pub fn origin(
        addr: IpAddr, prefix_len: u8, max_len: u8, asn: u32
    ) -> Self {
        Payload::Origin(RouteOrigin::new(addr, prefix_len, max_len, asn))
    }

    /// Creates a new router key payload.
    pub fn router_key(
        key_identifier: [u8; 20], asn: u32, key_info: Bytes
    ) -> Self {
        Payload::RouterKey(RouterKey::new(key_identifier, asn, key_info))
    }

    /// Creates a new ASPA unit.
    pub fn aspa(customer: u32, providers: Vec<u32>) -> Self {
        Payload::Aspa(Aspa::new(customer, providers))
    }

    /// Returns whether the payload can be expressed in the given version.
    ///
    /// Router keys only exist from version 1 onwards and ASPA units only
    /// in version 2.
    pub fn supported_in(&self, version: u8) -> bool {
        match *self {
            Payload::Origin(_) => true,
            Payload::RouterKey(_) => version >= 1,
            Payload::Aspa(_) => version >= 2,
        }
    }

    /// Returns the origin if the value is of the origin variant.
    pub fn to_origin(&self) -> Option<RouteOrigin> {
        match *self {
            Payload::Origin(origin) => Some(origin),
            _ => None
        }
    }

    /// Returns the router key if the value is of the router key variant.
    pub fn as_router_key(&self) -> Option<&RouterKey> {
        match *self {
            Payload::RouterKey(ref key) => Some(key),
            _ => None
        }
    }

    /// Returns the ASPA unit if the value is of the ASPA variant.
    pub fn as_aspa(&self) -> Option<&Aspa> {
        match *self {
            Payload::Aspa(ref aspa) => Some(aspa),
            _ => None
        }
    }
}


//--- From

impl From<RouteOrigin> for Payload {
    fn from(src: RouteOrigin) -> Self {
        Payload::Origin(src)
    }
}

impl From<RouterKey> for Payload {
    fn from(src: RouterKey) -> Self {
        Payload::RouterKey(src)
    }
}

impl From<Aspa> for Payload {
    fn from(src: Aspa) -> Self {
        Payload::Aspa(src)
    }
}


//------------ Action --------------------------------------------------------

/// What to do with a given payload.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Action {
    /// Announce the payload.
    ///
    /// In other words, add the payload to your set of data.
    Announce,

    /// Withdraw the payload.
    ///
    /// In other words, remove the payload from your set of data.
    Withdraw,
}

impl Action {
    /// Returns whether the action is to announce.
    pub fn is_announce(self) -> bool {
        matches!(self, Action::Announce)
    }

    /// Returns whether the action is to withdraw.
    pub fn is_withdraw(self) -> bool {
        matches!(self, Action::Withdraw)
    }

    /// Creates the action from the flags field of an RTR PDU.
    pub fn from_flags(flags: u8) -> Self {
        if flags & 1 == 1 {
            Action::Announce
        }
        else {
            Action::Withdraw
        }
    }

    /// Converts the action into the flags field of an RTR PDU.
    pub fn into_flags(self) -> u8 {
        match self {
            Action::Announce => 1,
            Action::Withdraw => 0
        }
    }
}


//------------ Timing --------------------------------------------------------

/// The timing parameters of a data exchange.
///
/// These three values are included in the end-of-data PDU of version 1
/// onwards.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Timing {
    /// The number of seconds until a client should refresh its data.
    pub refresh: u32,

    /// The number of seconds a client should wait before retrying after a
    /// failure.
    pub retry: u32,

    /// The number of seconds before data expires if not refreshed.
    pub expire: u32
}

impl Timing {
    /// The timing applied to version 0 sessions.
    ///
    /// Version 0 has no way to transmit timing values. Data from such
    /// sessions expires after a fixed hour.
    pub fn version_zero() -> Self {
        Timing {
            refresh: 3600,
            retry: 600,
            expire: 3600,
        }
    }

    pub fn refresh_duration(self) -> Duration {
        Duration::from_secs(u64::from(self.refresh))
    }
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            refresh: 3600,
            retry: 600,
            expire: 7200
        }
    }
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn action_flags() {
        assert_eq!(Action::from_flags(1), Action::Announce);
        assert_eq!(Action::from_flags(0), Action::Withdraw);
        assert_eq!(Action::from_flags(3), Action::Announce);
        assert_eq!(Action::Announce.into_flags(), 1);
        assert_eq!(Action::Withdraw.into_flags(), 0);
    }

    #[test]
    fn version_support() {
        let origin = Payload::origin(
            IpAddr::from([192, 0, 2, 0]), 24, 24, 64496
        );
        let key = Payload::router_key([0; 20], 64496, Bytes::new());
        let aspa = Payload::aspa(64496, vec![64497]);
        assert!(origin.supported_in(0));
        assert!(origin.supported_in(2));
        assert!(!key.supported_in(0));
        assert!(key.supported_in(1));
        assert!(!aspa.supported_in(1));
        assert!(aspa.supported_in(2));
    }
}
