//! The client session engine.
//!
//! A [`Session`] runs one synchronisation episode against one cache: it
//! borrows the cache’s [`ClientRecord`], owns the socket for the duration
//! of the episode, and either commits a new payload state to the record or
//! marks the failure. The protocol state machine lives here: version
//! negotiation, session ID continuity, collecting payload PDUs into a
//! changeset, and the automatic fall-back from serial to reset
//! synchronisation.
//!
//! The session performs no timer checks itself. Callers are expected to
//! consult [`ClientRecord::refresh_due`] before opening a connection.

use std::io;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};
use crate::changeset::Changeset;
use crate::error::Error;
use crate::pdu::{self, ErrorCode, Pdu};
use crate::record::ClientRecord;
use crate::state::Cache;


//------------ Configuration Constants ---------------------------------------

/// How long we are willing to wait for a single PDU from the cache.
const IO_TIMEOUT: Duration = Duration::from_secs(10);


//------------ Session -------------------------------------------------------

/// One synchronisation episode against one cache.
///
/// The session wraps a socket – represented by the type argument `Sock`
/// which needs to support Tokio’s asynchronous reading and writing – and
/// exclusively owns it until the episode ends. Whatever the outcome, the
/// socket is dropped and thereby closed when the session is done.
pub struct Session<'a, Sock> {
    /// The socket to talk to the cache over.
    sock: Sock,

    /// The record of the cache we are talking to.
    record: &'a mut ClientRecord,

    /// The wall-clock time of this episode in Unix seconds.
    now: u64,

    /// The protocol version in use.
    version: u8,

    /// Whether the cache has already negotiated us down once.
    ///
    /// A second version error ends the episode.
    downgraded: bool,
}

impl<'a, Sock> Session<'a, Sock> {
    /// Creates a new session from a connected socket and a record.
    ///
    /// The `now` value is used for all the timestamps the episode may
    /// write into the record.
    pub fn new(sock: Sock, record: &'a mut ClientRecord, now: u64) -> Self {
        let version = record.current_version();
        Session { sock, record, now, version, downgraded: false }
    }
}

impl<Sock: AsyncRead + AsyncWrite + Unpin> Session<'_, Sock> {
    /// Runs a reset episode.
    ///
    /// On success the record holds a fresh payload state; on error the
    /// record’s failure timestamp is set and the old state is untouched.
    pub async fn reset(mut self) -> Result<(), Error> {
        let res = self.run_reset().await;
        self.finish(res)
    }

    /// Runs a refresh.
    ///
    /// This is a serial episode if the record has state, a reset episode
    /// otherwise. A cache reset reply escalates to one automatic reset
    /// episode on the same connection.
    pub async fn refresh(mut self) -> Result<(), Error> {
        let res = self.run_refresh().await;
        self.finish(res)
    }

    /// Records the outcome and releases the socket.
    fn finish(self, res: Result<(), Error>) -> Result<(), Error> {
        if res.is_err() {
            self.record.note_failure(self.now);
        }
        res
    }

    /// Runs a serial episode if possible, falling back to reset.
    async fn run_refresh(&mut self) -> Result<(), Error> {
        match self.run_serial().await? {
            SerialOutcome::Committed => Ok(()),
            SerialOutcome::Restart => {
                self.record.clear_session();
                self.run_reset().await
            }
        }
    }

    /// Performs a serial query and processes the response.
    ///
    /// Returns `Restart` whenever the episode has to start over from
    /// scratch: there is no state to begin with, the cache answered with a
    /// cache reset, or it withdrew an entry we don’t have.
    async fn run_serial(&mut self) -> Result<SerialOutcome, Error> {
        let (session, serial) = match self.record.state() {
            Some(state) => (state.session(), state.serial()),
            None => return Ok(SerialOutcome::Restart),
        };
        let response = loop {
            Pdu::SerialQuery(
                pdu::SerialQuery::new(self.version, session, serial)
            ).write(&mut self.sock).await?;
            self.sock.flush().await?;
            match self.first_reply(true).await? {
                FirstReply::Response(response) => break response,
                FirstReply::Restart => {
                    debug!("RTR: cache reset in response to serial query");
                    return Ok(SerialOutcome::Restart)
                }
                FirstReply::Downgrade => { }
            }
        };
        if response.session() != session {
            self.report(
                ErrorCode::CORRUPT_DATA, response.encode(),
                "session ID mismatch"
            ).await?;
            return Err(Error::ProtocolViolation(
                format!(
                    "cache response with session {} instead of {}",
                    response.session(), session
                )
            ))
        }
        match self.read_deltas(session, true).await? {
            Deltas::Restart => {
                debug!("RTR: cache reset during serial response");
                Ok(SerialOutcome::Restart)
            }
            Deltas::Done(changeset, end) => {
                let mut next = match self.record.state() {
                    Some(state) => state.clone(),
                    None => Cache::new(session, serial),
                };
                match next.apply(&changeset) {
                    Ok(()) => { }
                    Err(Error::WithdrawNotFound) => {
                        warn!(
                            "RTR: cache withdrew an unknown entry, \
                             falling back to reset"
                        );
                        return Ok(SerialOutcome::Restart)
                    }
                    Err(err) => return Err(err),
                }
                next.set_serial(end.serial());
                self.record.commit(next, (&end).into(), self.now);
                Ok(SerialOutcome::Committed)
            }
        }
    }

    /// Performs a reset query and builds a fresh state from the response.
    async fn run_reset(&mut self) -> Result<(), Error> {
        let response = loop {
            Pdu::ResetQuery(
                pdu::ResetQuery::new(self.version)
            ).write(&mut self.sock).await?;
            self.sock.flush().await?;
            match self.first_reply(false).await? {
                FirstReply::Response(response) => break response,
                FirstReply::Restart => {
                    return Err(Error::ProtocolViolation(
                        "cache reset in response to reset query".into()
                    ))
                }
                FirstReply::Downgrade => { }
            }
        };
        let session = response.session();
        match self.read_deltas(session, false).await? {
            Deltas::Restart => {
                Err(Error::ProtocolViolation(
                    "cache reset in response to reset query".into()
                ))
            }
            Deltas::Done(changeset, end) => {
                let mut state = Cache::new(session, end.serial());
                state.apply(&changeset)?;
                self.record.commit(state, (&end).into(), self.now);
                Ok(())
            }
        }
    }

    /// Reads the first meaningful reply to a query.
    ///
    /// Serial notifies are noted and skipped. A cache reset is only
    /// acceptable in response to a serial query, i.e., when
    /// `allow_restart` is `true`.
    async fn first_reply(
        &mut self, allow_restart: bool
    ) -> Result<FirstReply, Error> {
        loop {
            let pdu = self.read_pdu().await?;
            if let Pdu::ErrorReport(ref err) = pdu {
                return self.handle_error_report(err)
            }
            self.check_version(&pdu).await?;
            match pdu {
                Pdu::CacheResponse(response) => {
                    return Ok(FirstReply::Response(response))
                }
                Pdu::CacheReset(_) if allow_restart => {
                    return Ok(FirstReply::Restart)
                }
                Pdu::SerialNotify(notify) => {
                    debug!(
                        "RTR: cache notifies of serial {}", notify.serial()
                    );
                }
                other => {
                    self.report(
                        ErrorCode::CORRUPT_DATA, other.encode(),
                        "expected cache response"
                    ).await?;
                    return Err(Error::ProtocolViolation(
                        "unexpected PDU while awaiting cache response".into()
                    ))
                }
            }
        }
    }

    /// Collects the payload PDUs of a response into a changeset.
    ///
    /// Every PDU has to carry the negotiated version and the end-of-data
    /// PDU has to repeat the session ID of the cache response that opened
    /// the episode.
    async fn read_deltas(
        &mut self, session: u16, allow_restart: bool
    ) -> Result<Deltas, Error> {
        let mut changeset = Changeset::new();
        loop {
            let pdu = self.read_pdu().await?;
            if let Pdu::ErrorReport(ref err) = pdu {
                if err.code() == ErrorCode::NO_DATA_AVAILABLE {
                    return Err(Error::NoData)
                }
                return Err(Error::ProtocolViolation(
                    format!("cache reported error {}", err.code())
                ))
            }
            self.check_version(&pdu).await?;
            match pdu {
                Pdu::Ipv4Prefix(_) | Pdu::Ipv6Prefix(_)
                | Pdu::RouterKey(_) | Pdu::Aspa(_) => {
                    changeset.add(&pdu)?;
                }
                Pdu::SerialNotify(notify) => {
                    debug!(
                        "RTR: cache notifies of serial {}", notify.serial()
                    );
                }
                Pdu::CacheReset(_) if allow_restart => {
                    return Ok(Deltas::Restart)
                }
                Pdu::EndOfData(end) => {
                    if end.session() != session {
                        self.report(
                            ErrorCode::CORRUPT_DATA, end.encode(),
                            "session ID changed within episode"
                        ).await?;
                        return Err(Error::ProtocolViolation(
                            "session ID changed within episode".into()
                        ))
                    }
                    return Ok(Deltas::Done(changeset, end))
                }
                other => {
                    self.report(
                        ErrorCode::CORRUPT_DATA, other.encode(),
                        "unexpected PDU"
                    ).await?;
                    return Err(Error::ProtocolViolation(
                        "unexpected PDU in payload sequence".into()
                    ))
                }
            }
        }
    }

    /// Deals with an error report from the cache.
    ///
    /// An unsupported-version error triggers at most one downgrade to the
    /// version the cache carries in the error PDU’s version field. Error
    /// reports are never answered with error reports.
    fn handle_error_report(
        &mut self, err: &pdu::ErrorReport
    ) -> Result<FirstReply, Error> {
        match err.code() {
            ErrorCode::UNSUPPORTED_PROTOCOL_VERSION => {
                let offered = err.version();
                if !self.downgraded
                    && offered < self.version
                    && self.record.supports(offered)
                {
                    debug!(
                        "RTR: downgrading from version {} to {}",
                        self.version, offered
                    );
                    self.downgraded = true;
                    self.version = offered;
                    self.record.set_current_version(offered);
                    Ok(FirstReply::Downgrade)
                }
                else {
                    Err(Error::UnsupportedVersion(offered))
                }
            }
            ErrorCode::NO_DATA_AVAILABLE => Err(Error::NoData),
            code => {
                Err(Error::ProtocolViolation(
                    format!("cache reported error {code}")
                ))
            }
        }
    }

    /// Reads one PDU, reporting codec failures to the cache.
    async fn read_pdu(&mut self) -> Result<Pdu, Error> {
        let res = match timeout(
            IO_TIMEOUT, Pdu::read(&mut self.sock)
        ).await {
            Ok(res) => res,
            Err(_) => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut, "cache response timed out"
                )))
            }
        };
        match res {
            Ok(pdu) => Ok(pdu),
            Err(Error::Malformed(err)) => {
                self.report(
                    err.code(), err.octets().to_vec(), err.reason()
                ).await?;
                Err(Error::Malformed(err))
            }
            Err(err) => Err(err),
        }
    }

    /// Checks that a received PDU carries the negotiated version.
    ///
    /// A mismatch draws an error report with code 8 and ends the episode.
    async fn check_version(&mut self, pdu: &Pdu) -> Result<(), Error> {
        if pdu.version() == self.version {
            return Ok(())
        }
        self.report(
            ErrorCode::UNEXPECTED_PROTOCOL_VERSION, pdu.encode(),
            "unexpected protocol version"
        ).await?;
        Err(Error::ProtocolViolation(
            format!(
                "cache switched from version {} to {}",
                self.version, pdu.version()
            )
        ))
    }

    /// Sends an error report to the cache.
    async fn report(
        &mut self, code: u16, pdu: Vec<u8>, text: &str
    ) -> Result<(), Error> {
        Pdu::ErrorReport(
            pdu::ErrorReport::new(self.version, code, pdu, text)
        ).write(&mut self.sock).await?;
        self.sock.flush().await?;
        Ok(())
    }
}


//------------ SerialOutcome -------------------------------------------------

/// How a serial episode ended.
enum SerialOutcome {
    /// The changeset was applied and the record updated.
    Committed,

    /// The episode has to start over with a reset.
    Restart,
}


//------------ FirstReply ----------------------------------------------------

/// The first meaningful reply from a cache in response to a query.
enum FirstReply {
    /// A cache response. Payload PDUs are to follow.
    Response(pdu::CacheResponse),

    /// A cache reset. We need to retry with a reset query.
    Restart,

    /// The cache wants a lower version. The query is to be repeated.
    Downgrade,
}


//------------ Deltas --------------------------------------------------------

/// The collected payload of a response.
enum Deltas {
    /// The episode completed with this changeset and end-of-data.
    Done(Changeset, pdu::EndOfData),

    /// The cache aborted the response with a cache reset.
    Restart,
}
