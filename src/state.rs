//! Cache state.
//!
//! This module defines the types that remember what a cache has told us.
//! The complete per-cache data set is kept in [`Cache`]: the three payload
//! maps plus the session ID and serial number cursor that tie the set to a
//! particular point in the cache’s changeset log. Since serial numbers
//! follow special comparison rules, they have their own type [`Serial`].

use std::{cmp, fmt, hash};
use std::collections::{BTreeMap, BTreeSet};
use std::collections::btree_map::Entry;
use std::net::IpAddr;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use crate::changeset::Changeset;
use crate::error::Error;
use crate::payload::{Action, Payload, RouteOrigin};
use crate::util::{base64, hex};


//------------ Serial --------------------------------------------------------

/// A serial number.
///
/// Serial numbers are regular integers with a special notion for comparison
/// in order to be able to deal with roll-over.
///
/// Specifically, addition and comparison are defined in [RFC 1982].
/// Addition, however, is only defined for values up to `2^31 - 1`, so we
/// decided to not implement the `Add` trait but rather have a dedicated
/// method `add` so as to not cause surprise panics.
///
/// Serial numbers only implement a partial ordering. That is, there are
/// pairs of values that are not equal but there still isn’t one value larger
/// than the other. Since this is neatly implemented by the `PartialOrd`
/// trait, the type implements that.
///
/// [RFC 1982]: https://tools.ietf.org/html/rfc1982
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Serial(pub u32);

impl Serial {
    /// Add `other` to `self`.
    ///
    /// Serial numbers only allow values of up to `2^31 - 1` to be added to
    /// them. Therefore, this method requires `other` to be a `u32` instead
    /// of a `Serial` to indicate that you cannot simply add two serials
    /// together. This is also why we don’t implement the `Add` trait.
    ///
    /// # Panics
    ///
    /// This method panics if `other` is greater than `2^31 - 1`.
    #[allow(clippy::should_implement_trait)]
    pub fn add(self, other: u32) -> Self {
        assert!(other <= 0x7FFF_FFFF);
        Serial(self.0.wrapping_add(other))
    }
}


//--- Default

impl Default for Serial {
    fn default() -> Self {
        Self::from(0)
    }
}


//--- From

impl From<u32> for Serial {
    fn from(value: u32) -> Serial {
        Serial(value)
    }
}

impl From<Serial> for u32 {
    fn from(serial: Serial) -> u32 {
        serial.0
    }
}


//--- Display

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}


//--- PartialEq and Eq

impl PartialEq for Serial {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl PartialEq<u32> for Serial {
    fn eq(&self, other: &u32) -> bool {
        self.0.eq(other)
    }
}

impl Eq for Serial { }


//--- PartialOrd

impl cmp::PartialOrd for Serial {
    fn partial_cmp(&self, other: &Serial) -> Option<cmp::Ordering> {
        match self.0.cmp(&other.0) {
            cmp::Ordering::Equal => Some(cmp::Ordering::Equal),
            cmp::Ordering::Less => {
                let sub = other.0 - self.0;
                match sub.cmp(&0x8000_0000) {
                    cmp::Ordering::Less => Some(cmp::Ordering::Less),
                    cmp::Ordering::Greater => Some(cmp::Ordering::Greater),
                    _ => None
                }
            },
            cmp::Ordering::Greater => {
                let sub = self.0 - other.0;
                match sub.cmp(&0x8000_0000) {
                    cmp::Ordering::Less => Some(cmp::Ordering::Greater),
                    cmp::Ordering::Greater => Some(cmp::Ordering::Less),
                    _ => None
                }
            }
        }
    }
}


//--- Hash

impl hash::Hash for Serial {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state)
    }
}


//------------ Cache ---------------------------------------------------------

/// The nested map holding route origins.
///
/// The nesting goes ASN, then prefix address, then prefix length, then max
/// length, with the innermost value counting how often the entry was
/// announced. The count is only ever above one when states from multiple
/// caches are merged.
pub type OriginMap = BTreeMap<
    u32, BTreeMap<IpAddr, BTreeMap<u8, BTreeMap<u8, u32>>>
>;

/// The key of a router key entry: ASN and subject key identifier.
pub type RouterKeyId = (u32, [u8; 20]);

/// The payload set received from a cache.
///
/// A value of this type is created empty at the start of a reset episode
/// and from then on is only ever changed by applying changesets to it. The
/// session ID stays fixed for the lifetime of the value while the serial
/// number moves along the cache’s changeset log.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(into = "CacheRepr", try_from = "CacheRepr")]
pub struct Cache {
    /// The session ID of the cache session this data belongs to.
    session: u16,

    /// The serial number of the last changeset applied.
    serial: Serial,

    /// The route origins.
    origins: OriginMap,

    /// The BGPsec router keys.
    router_keys: BTreeMap<RouterKeyId, Bytes>,

    /// The ASPA units, keyed by customer ASN.
    ///
    /// The provider lists keep the order in which they were announced.
    aspas: BTreeMap<u32, Vec<u32>>,
}

impl Cache {
    /// Creates a new, empty cache state.
    pub fn new(session: u16, serial: Serial) -> Self {
        Cache {
            session, serial,
            origins: BTreeMap::new(),
            router_keys: BTreeMap::new(),
            aspas: BTreeMap::new(),
        }
    }

    /// Returns the session ID.
    pub fn session(&self) -> u16 {
        self.session
    }

    /// Returns the serial number of the last update.
    pub fn serial(&self) -> Serial {
        self.serial
    }

    /// Sets the serial number.
    pub fn set_serial(&mut self, serial: Serial) {
        self.serial = serial
    }

    /// Returns whether the state contains no payload at all.
    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
        && self.router_keys.is_empty()
        && self.aspas.is_empty()
    }

    /// Returns the route origins.
    pub fn origins(&self) -> &OriginMap {
        &self.origins
    }

    /// Returns the router keys.
    pub fn router_keys(&self) -> &BTreeMap<RouterKeyId, Bytes> {
        &self.router_keys
    }

    /// Returns the ASPA units.
    pub fn aspas(&self) -> &BTreeMap<u32, Vec<u32>> {
        &self.aspas
    }

    /// Applies a changeset to the state.
    ///
    /// The records are applied in order. Announcements of route origins
    /// increase the entry’s count, announcements of router keys and ASPA
    /// units replace whatever was stored for their key. Withdrawals remove
    /// entries and fail with [`Error::WithdrawNotFound`] if there is
    /// nothing to remove.
    ///
    /// If the method fails, some of the changeset may already have been
    /// applied. Callers that need the update to be atomic apply it to a
    /// clone and only keep the clone on success.
    pub fn apply(&mut self, changeset: &Changeset) -> Result<(), Error> {
        for (action, payload) in changeset.iter() {
            match (*action, payload) {
                (Action::Announce, Payload::Origin(origin)) => {
                    self.announce_origin(origin)
                }
                (Action::Withdraw, Payload::Origin(origin)) => {
                    self.withdraw_origin(origin)?
                }
                (Action::Announce, Payload::RouterKey(key)) => {
                    self.router_keys.insert(
                        (key.asn, key.key_identifier), key.key_info.clone()
                    );
                }
                (Action::Withdraw, Payload::RouterKey(key)) => {
                    if self.router_keys.remove(
                        &(key.asn, key.key_identifier)
                    ).is_none() {
                        return Err(Error::WithdrawNotFound)
                    }
                }
                (Action::Announce, Payload::Aspa(aspa)) => {
                    self.aspas.insert(
                        aspa.customer, aspa.providers.clone()
                    );
                }
                (Action::Withdraw, Payload::Aspa(aspa)) => {
                    if self.aspas.remove(&aspa.customer).is_none() {
                        return Err(Error::WithdrawNotFound)
                    }
                }
            }
        }
        Ok(())
    }

    /// Adds a route origin announcement to the state.
    fn announce_origin(&mut self, origin: &RouteOrigin) {
        let count = self.origins
            .entry(origin.asn).or_default()
            .entry(origin.addr).or_default()
            .entry(origin.prefix_len).or_default()
            .entry(origin.max_len).or_insert(0);
        *count = count.saturating_add(1);
    }

    /// Removes a route origin from the state.
    ///
    /// Empty inner maps are pruned so that two states holding the same
    /// entries always compare equal.
    fn withdraw_origin(&mut self, origin: &RouteOrigin) -> Result<(), Error> {
        let by_addr = self.origins.get_mut(&origin.asn)
            .ok_or(Error::WithdrawNotFound)?;
        let by_len = by_addr.get_mut(&origin.addr)
            .ok_or(Error::WithdrawNotFound)?;
        let by_max = by_len.get_mut(&origin.prefix_len)
            .ok_or(Error::WithdrawNotFound)?;
        let count = by_max.get_mut(&origin.max_len)
            .ok_or(Error::WithdrawNotFound)?;
        *count -= 1;
        if *count == 0 {
            by_max.remove(&origin.max_len);
            if by_max.is_empty() {
                by_len.remove(&origin.prefix_len);
            }
            if by_len.is_empty() {
                by_addr.remove(&origin.addr);
            }
            if by_addr.is_empty() {
                self.origins.remove(&origin.asn);
            }
        }
        Ok(())
    }

    /// Merges two states into a new one.
    ///
    /// Route origin counts are summed up, router keys are unioned, and the
    /// provider lists of ASPA units for the same customer become the sorted
    /// set-union of both inputs. Fails with [`Error::MergeConflict`] if the
    /// two states carry different key info for the same router key.
    ///
    /// The merged state is a downstream view without a cursor of its own,
    /// so its session ID and serial number are zero.
    pub fn merge(&self, other: &Cache) -> Result<Cache, Error> {
        let mut res = self.clone();
        res.session = 0;
        res.serial = Serial::default();

        for (asn, by_addr) in &other.origins {
            for (addr, by_len) in by_addr {
                for (prefix_len, by_max) in by_len {
                    for (max_len, count) in by_max {
                        let slot = res.origins
                            .entry(*asn).or_default()
                            .entry(*addr).or_default()
                            .entry(*prefix_len).or_default()
                            .entry(*max_len).or_insert(0);
                        *slot = slot.saturating_add(*count);
                    }
                }
            }
        }

        for (key, info) in &other.router_keys {
            match res.router_keys.entry(*key) {
                Entry::Occupied(entry) => {
                    if entry.get() != info {
                        return Err(Error::MergeConflict)
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(info.clone());
                }
            }
        }

        let mut aspas: BTreeMap<u32, BTreeSet<u32>> = BTreeMap::new();
        for (customer, providers) in
            self.aspas.iter().chain(other.aspas.iter())
        {
            aspas.entry(*customer).or_default()
                .extend(providers.iter().copied());
        }
        res.aspas = aspas.into_iter().map(|(customer, providers)| {
            (customer, providers.into_iter().collect())
        }).collect();

        Ok(res)
    }

    /// Returns one payload value per distinct entry in the state.
    ///
    /// Counts above one are collapsed: an entry appears once no matter how
    /// often it was announced.
    pub fn payloads(&self) -> Vec<Payload> {
        let mut res = Vec::new();
        for (asn, by_addr) in &self.origins {
            for (addr, by_len) in by_addr {
                for (prefix_len, by_max) in by_len {
                    for max_len in by_max.keys() {
                        res.push(Payload::origin(
                            *addr, *prefix_len, *max_len, *asn
                        ));
                    }
                }
            }
        }
        for ((asn, key_identifier), key_info) in &self.router_keys {
            res.push(Payload::router_key(
                *key_identifier, *asn, key_info.clone()
            ));
        }
        for (customer, providers) in &self.aspas {
            res.push(Payload::aspa(*customer, providers.clone()));
        }
        res
    }
}


//------------ CacheRepr -----------------------------------------------------

/// The serialised form of a cache state.
///
/// The payload maps serialise directly except for the router keys whose
/// key is a pair: they become a sequence of entries with the subject key
/// identifier as a hex string and the key info in Base 64.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct CacheRepr {
    session_id: u16,
    serial_number: u32,
    vrps: OriginMap,
    router_keys: Vec<RouterKeyRepr>,
    aspas: BTreeMap<u32, Vec<u32>>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct RouterKeyRepr {
    asn: u32,
    ski: String,
    spki: String,
}

impl From<Cache> for CacheRepr {
    fn from(cache: Cache) -> Self {
        let Cache { session, serial, origins, router_keys, aspas } = cache;
        CacheRepr {
            session_id: session,
            serial_number: serial.into(),
            vrps: origins,
            router_keys: router_keys.iter().map(|((asn, ski), spki)| {
                let mut buf = [0u8; 40];
                RouterKeyRepr {
                    asn: *asn,
                    ski: hex::encode(ski, &mut buf).into(),
                    spki: base64::Json.encode(spki),
                }
            }).collect(),
            aspas,
        }
    }
}

impl TryFrom<CacheRepr> for Cache {
    type Error = String;

    fn try_from(repr: CacheRepr) -> Result<Self, Self::Error> {
        for by_addr in repr.vrps.values() {
            for by_len in by_addr.values() {
                for by_max in by_len.values() {
                    if by_max.values().any(|count| *count == 0) {
                        return Err("VRP entry with zero count".into())
                    }
                }
            }
        }
        let mut router_keys = BTreeMap::new();
        for key in repr.router_keys {
            let mut ski = [0u8; 20];
            hex::decode(&key.ski, &mut ski).map_err(|_| {
                format!("invalid subject key identifier '{}'", key.ski)
            })?;
            let spki = base64::Json.decode(&key.spki).map_err(|_| {
                format!("invalid key info for AS{}", key.asn)
            })?;
            if router_keys.insert(
                (key.asn, ski), Bytes::from(spki)
            ).is_some() {
                return Err("duplicate router key".into())
            }
        }
        Ok(Cache {
            session: repr.session_id,
            serial: repr.serial_number.into(),
            origins: repr.vrps,
            router_keys,
            aspas: repr.aspas,
        })
    }
}


//============ Testing =======================================================
