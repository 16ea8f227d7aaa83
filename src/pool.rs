//! Managing a set of cache sessions.
//!
//! The [`Pool`] owns the client records of any number of caches, keyed by
//! small integer IDs. Each record lives in its own JSON file inside the
//! pool’s directory, is loaded for one operation, and written back when
//! the operation is done. Records are independent of each other: a
//! failing cache never keeps its siblings from refreshing.

use std::{fs, io};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use log::{debug, warn};
use tokio::net::TcpStream;
use crate::client::Session;
use crate::clock::{Clock, SystemClock};
use crate::error::Error;
use crate::record::ClientRecord;
use crate::state::{Cache, Serial};


//------------ Outcome -------------------------------------------------------

/// What a reset or refresh call did.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// An episode ran and the record was updated.
    Updated,

    /// A timer gate suppressed the call. No connection was made.
    Skipped,
}


//------------ Pool ----------------------------------------------------------

/// A set of cache client records kept in a directory.
pub struct Pool {
    /// The directory holding the `client<N>.json` files.
    dir: PathBuf,

    /// Where the pool takes the current time from.
    clock: Arc<dyn Clock + Send + Sync>,
}

impl Pool {
    /// Creates a pool over the given directory using the system clock.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_clock(dir, Arc::new(SystemClock))
    }

    /// Creates a pool with an explicit clock.
    pub fn with_clock(
        dir: impl Into<PathBuf>,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> Self {
        Pool { dir: dir.into(), clock }
    }

    /// Creates and persists one record per cache server.
    ///
    /// The records get the IDs 0 to `servers.len() - 1` in order. Each
    /// accepts all protocol versions up to and including `max_version`.
    pub fn init(
        &self, servers: &[(String, u16)], max_version: u8
    ) -> Result<(), Error> {
        for (id, (server, port)) in servers.iter().enumerate() {
            let record = ClientRecord::new(
                server.clone(), *port, (0..=max_version).collect()
            );
            self.store(id, &record)?;
        }
        Ok(())
    }

    /// Returns the IDs of all records in the pool, in ascending order.
    pub fn record_ids(&self) -> Result<Vec<usize>, Error> {
        let mut res = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(num) = name
                    .strip_prefix("client")
                    .and_then(|rest| rest.strip_suffix(".json"))
                {
                    if let Ok(id) = num.parse() {
                        res.push(id)
                    }
                }
            }
        }
        res.sort_unstable();
        Ok(res)
    }

    /// Loads the record with the given ID.
    pub fn load(&self, id: usize) -> Result<ClientRecord, Error> {
        let data = fs::read(self.path(id))?;
        serde_json::from_slice(&data).map_err(|err| {
            Error::Io(io::Error::new(io::ErrorKind::InvalidData, err))
        })
    }

    /// Writes the record with the given ID back to its file.
    pub fn store(
        &self, id: usize, record: &ClientRecord
    ) -> Result<(), Error> {
        let data = serde_json::to_vec_pretty(record).map_err(|err| {
            Error::Io(io::Error::new(io::ErrorKind::InvalidData, err))
        })?;
        fs::write(self.path(id), data)?;
        Ok(())
    }

    /// Returns the path of the record file for the given ID.
    fn path(&self, id: usize) -> PathBuf {
        self.dir.join(format!("client{id}.json"))
    }

    /// Returns the pool’s directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Runs a reset episode for one record.
    pub async fn reset(
        &self, id: usize, force: bool
    ) -> Result<Outcome, Error> {
        self.run(id, force, true).await
    }

    /// Runs a refresh for one record.
    pub async fn refresh(
        &self, id: usize, force: bool
    ) -> Result<Outcome, Error> {
        self.run(id, force, false).await
    }

    /// Runs a refresh for every record.
    ///
    /// Failures are per-record: a failing cache is reported in the result
    /// and logged but doesn’t keep the remaining records from refreshing.
    pub async fn refresh_all(
        &self, force: bool
    ) -> Result<Vec<(usize, Result<Outcome, Error>)>, Error> {
        let mut res = Vec::new();
        for id in self.record_ids()? {
            let outcome = self.refresh(id, force).await;
            if let Err(ref err) = outcome {
                warn!("client {id}: refresh failed: {err}");
            }
            res.push((id, outcome));
        }
        Ok(res)
    }

    /// Folds the states of all records into one.
    ///
    /// Records whose data has expired contribute nothing until they have
    /// been reset.
    pub fn merged_state(&self) -> Result<Cache, Error> {
        let now = self.clock.now();
        let mut res = Cache::new(0, Serial::default());
        for id in self.record_ids()? {
            let mut record = self.load(id)?;
            if record.expire_stale(now) {
                warn!("client {id}: stored data has expired");
                continue
            }
            if let Some(state) = record.state() {
                res = res.merge(state)?;
            }
        }
        Ok(res)
    }

    /// Runs one episode for one record.
    ///
    /// The timer gates are evaluated before any connection is made; a
    /// gated call returns [`Outcome::Skipped`] without performing I/O.
    /// `force` bypasses the gates.
    async fn run(
        &self, id: usize, force: bool, reset: bool
    ) -> Result<Outcome, Error> {
        let mut record = self.load(id)?;
        let now = self.clock.now();
        if record.expire_stale(now) {
            debug!("client {id}: stored data expired, reset required");
            self.store(id, &record)?;
        }
        if !force && !record.refresh_due(now) {
            debug!("client {id}: timer gate closed, skipping");
            return Ok(Outcome::Skipped)
        }
        let sock = TcpStream::connect(
            (record.server(), record.port())
        ).await;
        let res = match sock {
            Ok(sock) => {
                sock.set_nodelay(true)?;
                let session = Session::new(sock, &mut record, now);
                if reset {
                    session.reset().await
                }
                else {
                    session.refresh().await
                }
            }
            Err(err) => {
                record.note_failure(now);
                Err(err.into())
            }
        };
        self.store(id, &record)?;
        res.map(|()| Outcome::Updated)
    }
}
