//! Changesets.
//!
//! A changeset collects the payload records of one synchronisation episode
//! in arrival order so they can be applied to a [`Cache`] in one go once
//! the end-of-data PDU arrives. The cache relies on the order: the
//! protocol allows a withdrawal to be followed by an announcement that
//! re-instates the same entry.
//!
//! [`Cache`]: crate::state::Cache

use std::slice;
use crate::error::Error;
use crate::payload::{Action, Payload};
use crate::pdu::Pdu;


//------------ Changeset -----------------------------------------------------

/// An ordered batch of payload records to be applied atomically.
#[derive(Clone, Debug, Default)]
pub struct Changeset {
    /// The protocol version of the PDUs collected so far.
    ///
    /// This is `None` as long as no PDU was added. All PDUs of a changeset
    /// have to agree on their version.
    version: Option<u8>,

    /// The records in arrival order.
    entries: Vec<(Action, Payload)>,
}

impl Changeset {
    /// Creates a new, empty changeset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the given PDU can be added to the changeset.
    ///
    /// Only the four payload-bearing PDU types qualify, and only if their
    /// version agrees with everything already collected. All other PDU
    /// types need to be dealt with by the session engine.
    pub fn can_add(&self, pdu: &Pdu) -> bool {
        pdu.is_payload()
        && self.version.map_or(true, |version| pdu.version() == version)
    }

    /// Adds a payload PDU to the changeset.
    ///
    /// Fails with a protocol violation for PDUs [`can_add`][Self::can_add]
    /// would reject.
    pub fn add(&mut self, pdu: &Pdu) -> Result<(), Error> {
        let (action, payload) = match pdu.to_payload() {
            Some(some) => some,
            None => {
                return Err(Error::ProtocolViolation(
                    "PDU cannot be part of a changeset".into()
                ))
            }
        };
        match self.version {
            Some(version) => {
                if pdu.version() != version {
                    return Err(Error::ProtocolViolation(
                        "changeset with mixed protocol versions".into()
                    ))
                }
            }
            None => self.version = Some(pdu.version()),
        }
        self.entries.push((action, payload));
        Ok(())
    }

    /// Adds a record that didn’t arrive over the wire.
    ///
    /// This is used when curating changesets locally and doesn’t pin the
    /// changeset to a protocol version.
    pub fn push(&mut self, action: Action, payload: Payload) {
        self.entries.push((action, payload))
    }

    /// Returns an iterator over the records in arrival order.
    pub fn iter(&self) -> slice::Iter<'_, (Action, Payload)> {
        self.entries.iter()
    }

    /// Returns the version of the collected PDUs if any were added.
    pub fn version(&self) -> Option<u8> {
        self.version
    }

    /// Returns the number of records in the changeset.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the changeset contains no records.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<'a> IntoIterator for &'a Changeset {
    type Item = &'a (Action, Payload);
    type IntoIter = slice::Iter<'a, (Action, Payload)>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}


//============ Testing =======================================================
