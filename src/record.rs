//! Per-cache client records.
//!
//! A [`ClientRecord`] keeps everything the client remembers about one
//! cache between invocations: where to find it, which protocol versions
//! are acceptable, the payload state from the last successful episode, the
//! last end-of-data PDU, and the timestamps the timer gates operate on.
//! Records serialise to JSON losslessly; unknown and duplicate fields are
//! rejected when reading them back.

use serde::{Deserialize, Serialize};
use crate::payload::Timing;
use crate::pdu;
use crate::state::Cache;


//------------ ClientRecord --------------------------------------------------

/// Everything the client remembers about one cache.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ClientRecord {
    /// The host name or address of the cache.
    server: String,

    /// The TCP port of the cache.
    port: u16,

    /// The protocol versions the client will accept, in ascending order.
    supported_versions: Vec<u8>,

    /// The version to propose on the next query.
    ///
    /// Starts out as the highest supported version and drops when the
    /// cache negotiates us down.
    current_version: u8,

    /// The payload state from the last successful episode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    state: Option<Cache>,

    /// The last end-of-data PDU received.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    eod: Option<EndOfDataInfo>,

    /// When the last successful episode finished, in Unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_run: Option<u64>,

    /// When the last episode failed, in Unix seconds.
    ///
    /// Cleared by a successful episode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_failure: Option<u64>,
}

impl ClientRecord {
    /// Creates a new record for a cache.
    ///
    /// The version list is sorted and de-duplicated; the highest entry
    /// becomes the version to propose first.
    pub fn new(
        server: String, port: u16, mut supported_versions: Vec<u8>
    ) -> Self {
        supported_versions.sort_unstable();
        supported_versions.dedup();
        let current_version = supported_versions.last().copied().unwrap_or(0);
        ClientRecord {
            server, port, supported_versions, current_version,
            state: None,
            eod: None,
            last_run: None,
            last_failure: None,
        }
    }

    /// Returns the host name or address of the cache.
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Returns the TCP port of the cache.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the version to propose on the next query.
    pub fn current_version(&self) -> u8 {
        self.current_version
    }

    /// Returns whether the client accepts the given protocol version.
    pub fn supports(&self, version: u8) -> bool {
        self.supported_versions.contains(&version)
    }

    /// Sets the version to propose on the next query.
    pub fn set_current_version(&mut self, version: u8) {
        self.current_version = version
    }

    /// Returns the payload state if there is any.
    pub fn state(&self) -> Option<&Cache> {
        self.state.as_ref()
    }

    /// Returns the stored end-of-data summary if there is any.
    pub fn eod(&self) -> Option<&EndOfDataInfo> {
        self.eod.as_ref()
    }

    /// Returns when the last successful episode finished.
    pub fn last_run(&self) -> Option<u64> {
        self.last_run
    }

    /// Returns when the last episode failed.
    pub fn last_failure(&self) -> Option<u64> {
        self.last_failure
    }

    /// Returns the timing values in effect for the record.
    ///
    /// These are the values from the last end-of-data for version 1 and
    /// later. Version 0 can’t transmit them, so such sessions get the
    /// fixed fallback values.
    pub fn timing(&self) -> Timing {
        self.eod.as_ref()
            .and_then(|eod| eod.timing)
            .unwrap_or_else(Timing::version_zero)
    }

    /// Commits the outcome of a successful episode.
    pub fn commit(&mut self, state: Cache, eod: EndOfDataInfo, now: u64) {
        self.state = Some(state);
        self.eod = Some(eod);
        self.last_run = Some(now);
        self.last_failure = None;
    }

    /// Notes that an episode failed.
    pub fn note_failure(&mut self, now: u64) {
        self.last_failure = Some(now);
    }

    /// Drops everything tied to the cache session.
    ///
    /// After this, the next episode has to be a reset.
    pub fn clear_session(&mut self) {
        self.state = None;
        self.eod = None;
        self.last_run = None;
    }

    /// Discards the stored data if it has expired.
    ///
    /// Data expires when the last episode failed after the last success
    /// and the expire interval has passed since the failure. Returns
    /// whether anything was discarded.
    pub fn expire_stale(&mut self, now: u64) -> bool {
        let failure = match self.last_failure {
            Some(failure) => failure,
            None => return false,
        };
        if let Some(run) = self.last_run {
            if failure <= run {
                return false
            }
        }
        if now <= failure.saturating_add(u64::from(self.timing().expire)) {
            return false
        }
        self.clear_session();
        true
    }

    /// Returns whether a non-forced refresh should run now.
    ///
    /// After a failure, attempts are suppressed until the retry interval
    /// has passed. After a success, the refresh interval spaces
    /// consecutive runs. A gated call must not perform any I/O.
    pub fn refresh_due(&self, now: u64) -> bool {
        let timing = self.timing();
        if let Some(failure) = self.last_failure {
            if now < failure.saturating_add(u64::from(timing.retry)) {
                return false
            }
        }
        if let Some(run) = self.last_run {
            if now < run.saturating_add(u64::from(timing.refresh)) {
                return false
            }
        }
        true
    }
}


//------------ EndOfDataInfo -------------------------------------------------

/// The parts of an end-of-data PDU worth remembering.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EndOfDataInfo {
    /// The session ID the PDU was received under.
    pub session_id: u16,

    /// The serial number the episode ended on.
    pub serial_number: u32,

    /// The timing values, absent for version 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing: Option<Timing>,
}

impl From<&pdu::EndOfData> for EndOfDataInfo {
    fn from(pdu: &pdu::EndOfData) -> Self {
        EndOfDataInfo {
            session_id: pdu.session(),
            serial_number: pdu.serial().into(),
            timing: pdu.timing(),
        }
    }
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::changeset::Changeset;
    use crate::payload::{Action, Payload};

    fn synced_record(timing: Option<Timing>) -> ClientRecord {
        let mut record = ClientRecord::new(
            "cache.example.net".into(), 3323, vec![0, 1, 2]
        );
        let mut state = Cache::new(12, 5.into());
        let mut changeset = Changeset::new();
        changeset.push(
            Action::Announce,
            Payload::origin("1.0.0.0".parse().unwrap(), 24, 32, 4608),
        );
        state.apply(&changeset).unwrap();
        record.commit(
            state,
            EndOfDataInfo { session_id: 12, serial_number: 5, timing },
            1_000,
        );
        record
    }

    #[test]
    fn new_record() {
        let record = ClientRecord::new(
            "cache.example.net".into(), 3323, vec![1, 0, 2, 1]
        );
        assert_eq!(record.current_version(), 2);
        assert!(record.supports(0));
        assert!(!record.supports(3));
        assert!(record.state().is_none());
    }

    #[test]
    fn json_round_trip() {
        let record = synced_record(Some(Timing::default()));
        let json = serde_json::to_string_pretty(&record).unwrap();
        let back: ClientRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record, back);
    }

    #[test]
    fn json_rejects_unknown_fields() {
        let mut value = serde_json::to_value(
            synced_record(Some(Timing::default()))
        ).unwrap();
        value.as_object_mut().unwrap().insert(
            "surprise".into(), serde_json::Value::Bool(true)
        );
        assert!(
            serde_json::from_value::<ClientRecord>(value).is_err()
        );
    }

    #[test]
    fn json_rejects_duplicate_keys() {
        // Each key must be emitted exactly once and parsing must refuse
        // repeats rather than quietly taking either value.
        let json = concat!(
            r#"{"server": "cache.example.net", "port": 3323,"#,
            r#" "supported_versions": [0, 1, 2], "current_version": 2,"#,
            r#" "last_run": 1, "last_run": 2}"#
        );
        assert!(serde_json::from_str::<ClientRecord>(json).is_err());
    }

    #[test]
    fn refresh_gate() {
        let timing = Timing { refresh: 300, retry: 60, expire: 900 };
        let record = synced_record(Some(timing));
        assert!(!record.refresh_due(1_000));
        assert!(!record.refresh_due(1_299));
        assert!(record.refresh_due(1_300));
    }

    #[test]
    fn retry_gate() {
        let timing = Timing { refresh: 300, retry: 60, expire: 900 };
        let mut record = synced_record(Some(timing));
        record.note_failure(1_400);
        assert!(!record.refresh_due(1_401));
        assert!(!record.refresh_due(1_459));
        assert!(record.refresh_due(1_460));
    }

    #[test]
    fn expiry() {
        let timing = Timing { refresh: 300, retry: 60, expire: 900 };
        let mut record = synced_record(Some(timing));
        record.note_failure(1_400);
        assert!(!record.expire_stale(2_300));
        assert!(record.state().is_some());
        assert!(record.expire_stale(2_301));
        assert!(record.state().is_none());
        assert!(record.eod().is_none());
        assert!(record.last_run().is_none());
    }

    #[test]
    fn no_expiry_after_success() {
        let timing = Timing { refresh: 300, retry: 60, expire: 900 };
        let mut record = synced_record(Some(timing));
        record.note_failure(900);
        // The failure predates the last success, so nothing expires.
        assert!(!record.expire_stale(10_000));
        assert!(record.state().is_some());
    }

    #[test]
    fn version_zero_timing() {
        let record = synced_record(None);
        assert_eq!(record.timing(), Timing::version_zero());
        assert_eq!(record.timing().expire, 3600);
    }
}
