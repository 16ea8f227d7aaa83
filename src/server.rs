//! The reference cache server.
//!
//! This module implements the cache side of the protocol. The data lives
//! in a [`Maintainer`]: the authoritative payload set plus an append-only
//! log of the changesets that led up to it, bound to a session ID assigned
//! when the maintainer is created. The [`Server`] accepts connections from
//! a stream of sockets and spawns one handler per connection; handlers
//! take snapshots of the maintainer’s data, so updates never block a
//! running response.
//!
//! In order to push serial notifies whenever new data arrives, the server
//! uses a notification dispatch system via [`NotifySender`].

use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;
use futures_util::future;
use futures_util::pin_mut;
use futures_util::future::Either;
use log::debug;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::task::spawn;
use tokio_stream::{Stream, StreamExt};
use crate::changeset::Changeset;
use crate::error::Error;
use crate::payload::{Action, Payload, Timing};
use crate::pdu::{self, ErrorCode, Pdu};
use crate::state::{Cache, Serial};


//------------ Configuration Constants ---------------------------------------

/// The highest protocol version the server implements.
pub const MAX_VERSION: u8 = 2;


//------------ Maintainer ----------------------------------------------------

/// The authoritative data of a cache.
///
/// The maintainer keeps the current payload set, the log of all changesets
/// applied since startup, and the timing values served to clients. All
/// handles created by cloning share the same data.
#[derive(Clone)]
pub struct Maintainer {
    inner: Arc<Mutex<MaintainerInner>>,
}

struct MaintainerInner {
    /// The current payload set including session ID and serial number.
    cache: Cache,

    /// The changesets applied so far, tagged with the serial number they
    /// took the data to.
    log: Vec<(Serial, Changeset)>,

    /// The timing values to serve.
    timing: Timing,

    /// Whether the data may be served yet.
    ready: bool,
}

impl Maintainer {
    /// Creates a new maintainer with an empty payload set.
    ///
    /// The session ID is derived from the lower sixteen bits of the
    /// current Unix time; the serial number starts at zero.
    pub fn new() -> Self {
        Self::with_session(
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|duration| duration.as_secs())
                .unwrap_or(0) as u16
        )
    }

    /// Creates a new maintainer with the given session ID.
    pub fn with_session(session: u16) -> Self {
        Maintainer {
            inner: Arc::new(Mutex::new(MaintainerInner {
                cache: Cache::new(session, Serial::default()),
                log: Vec::new(),
                timing: Timing::default(),
                ready: true,
            }))
        }
    }

    fn inner(&self) -> MutexGuard<'_, MaintainerInner> {
        self.inner.lock().expect("poisoned lock")
    }

    /// Returns the session ID and current serial number.
    pub fn state(&self) -> (u16, Serial) {
        let inner = self.inner();
        (inner.cache.session(), inner.cache.serial())
    }

    /// Returns the timing values served to clients.
    pub fn timing(&self) -> Timing {
        self.inner().timing
    }

    /// Sets the timing values served to clients.
    pub fn set_timing(&self, timing: Timing) {
        self.inner().timing = timing
    }

    /// Returns whether the data may be served.
    pub fn ready(&self) -> bool {
        self.inner().ready
    }

    /// Sets whether the data may be served.
    ///
    /// While not ready, the server answers all queries with the No Data
    /// Available error.
    pub fn set_ready(&self, ready: bool) {
        self.inner().ready = ready
    }

    /// Applies a changeset to the data.
    ///
    /// On success, the serial number is increased by one and the changeset
    /// is appended to the log under the new serial.
    pub fn update(&self, changeset: Changeset) -> Result<Serial, Error> {
        let mut inner = self.inner();
        let mut next = inner.cache.clone();
        next.apply(&changeset)?;
        let serial = inner.cache.serial().add(1);
        next.set_serial(serial);
        inner.cache = next;
        inner.log.push((serial, changeset));
        Ok(serial)
    }

    /// Returns a snapshot of the full data set.
    pub fn full(&self) -> (u16, Serial, Vec<Payload>) {
        let inner = self.inner();
        (
            inner.cache.session(),
            inner.cache.serial(),
            inner.cache.payloads(),
        )
    }

    /// Returns the changes a client at the given state is missing.
    ///
    /// Returns `None` if the client has to fall back to a reset query:
    /// its session ID doesn’t match ours or its serial number is outside
    /// what the log can reconstruct. An up-to-date client receives the
    /// current serial and no changes.
    pub fn diff(
        &self, session: u16, serial: Serial
    ) -> Option<(Serial, Vec<(Action, Payload)>)> {
        let inner = self.inner();
        if session != inner.cache.session() {
            return None
        }
        let current = inner.cache.serial();
        if serial == current {
            return Some((current, Vec::new()))
        }
        let start = inner.log.iter().position(|(tag, _)| {
            *tag == serial.add(1)
        })?;
        let mut entries = Vec::new();
        for (_, changeset) in &inner.log[start..] {
            entries.extend(changeset.iter().cloned());
        }
        Some((current, entries))
    }
}

impl Default for Maintainer {
    fn default() -> Self {
        Self::new()
    }
}


//------------ Server --------------------------------------------------------

/// An RTR cache server.
///
/// The server takes a stream socket listener – a stream of new sockets –
/// and a maintainer and serves the maintainer’s data. Whenever the
/// maintainer is updated, a nudge through the associated [`NotifySender`]
/// makes all connections send serial notifies.
pub struct Server<Listener> {
    /// The listener socket.
    listener: Listener,

    /// The sender for notifications.
    ///
    /// We keep this here because we can use it to fabricate new receivers.
    notify: NotifySender,

    /// The data we are serving.
    maintainer: Maintainer,

    /// The highest protocol version we admit.
    max_version: u8,
}

impl<Listener> Server<Listener> {
    /// Creates a new server from its components.
    pub fn new(
        listener: Listener, notify: NotifySender, maintainer: Maintainer
    ) -> Self {
        Server { listener, notify, maintainer, max_version: MAX_VERSION }
    }

    /// Caps the protocol version the server admits.
    pub fn with_max_version(mut self, max_version: u8) -> Self {
        self.max_version = max_version;
        self
    }

    /// Runs the server.
    ///
    /// The asynchronous function will return successfully when the
    /// listener socket – which is a stream over new connections – finishes.
    /// It will return with an error if the listener socket errors out.
    pub async fn run<Sock>(mut self) -> Result<(), io::Error>
    where
        Listener: Stream<Item = Result<Sock, io::Error>> + Unpin,
        Sock: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        while let Some(sock) = self.listener.next().await {
            let _ = spawn(
                Connection::new(
                    sock?, self.notify.subscribe(),
                    self.maintainer.clone(), self.max_version,
                ).run()
            );
        }
        Ok(())
    }
}


//------------ Connection ----------------------------------------------------

/// A single server connection.
struct Connection<Sock> {
    /// The socket to run the connection on.
    sock: Sock,

    /// The receiver for update notifications.
    notify: NotifyReceiver,

    /// The data we are serving.
    maintainer: Maintainer,

    /// The protocol version this connection is using.
    ///
    /// This starts out as `None` and is set by the first query the client
    /// sends with an admissible version.
    version: Option<u8>,

    /// The highest protocol version we admit.
    max_version: u8,
}

impl<Sock> Connection<Sock> {
    /// Wraps a socket into a connection value.
    fn new(
        sock: Sock, notify: NotifyReceiver,
        maintainer: Maintainer, max_version: u8,
    ) -> Self {
        Connection { sock, notify, maintainer, max_version, version: None }
    }

    /// Returns the protocol version the connection runs on.
    ///
    /// If there hasn’t been a negotiation yet, returns 0.
    fn version(&self) -> u8 {
        self.version.unwrap_or(0)
    }
}

/// # High-level operation
///
impl<Sock> Connection<Sock>
where Sock: AsyncRead + AsyncWrite + Unpin {
    /// Runs the connection until it is done.
    ///
    /// Returns successfully if the connection was closed cleanly. Returns
    /// an error if there was an error. However, those errors are basically
    /// ignored – this is only here for easy question mark use.
    async fn run(mut self) -> Result<(), Error> {
        while let Some(query) = self.recv().await? {
            match query {
                Query::Serial { session, serial } => {
                    self.serial(session, serial).await?
                }
                Query::Reset => {
                    self.reset().await?
                }
                Query::Error(err) => {
                    self.error(err).await?
                }
                Query::Notify => {
                    self.notify().await?
                }
            }
        }
        Ok(())
    }

    /// Receives the next query.
    ///
    /// This can either be a notification that new data is available or an
    /// actual query received from the client. Returns `None` when the
    /// connection should be closed: the client went away, sent garbage we
    /// already answered, or reported an error.
    async fn recv(&mut self) -> Result<Option<Query>, Error> {
        let outcome = {
            let notify = self.notify.recv();
            let read = Pdu::read(&mut self.sock);
            pin_mut!(notify);
            pin_mut!(read);
            match future::select(notify, read).await {
                Either::Left(_) => ReadOutcome::Notify,
                Either::Right((Ok(pdu), _)) => ReadOutcome::Pdu(pdu),
                Either::Right((Err(err), _)) => ReadOutcome::Fail(err),
            }
        };
        match outcome {
            ReadOutcome::Notify => Ok(Some(Query::Notify)),
            ReadOutcome::Pdu(pdu) => Ok(self.classify(pdu)),
            ReadOutcome::Fail(Error::Io(err))
                if err.kind() == io::ErrorKind::UnexpectedEof
            => {
                Ok(None)
            }
            ReadOutcome::Fail(Error::Malformed(err)) => {
                debug!("RTR: received malformed PDU: {err}");
                Pdu::ErrorReport(pdu::ErrorReport::new(
                    self.version(), err.code(),
                    err.octets().to_vec(), err.reason()
                )).write(&mut self.sock).await?;
                self.sock.flush().await?;
                Ok(None)
            }
            ReadOutcome::Fail(err) => Err(err),
        }
    }

    /// Sorts a received PDU into a query.
    ///
    /// Returns `None` if the connection should be closed instead.
    fn classify(&mut self, pdu: Pdu) -> Option<Query> {
        if let Pdu::ErrorReport(ref err) = pdu {
            debug!("RTR: client reported error {}", err.code());
            return None
        }
        if let Err(report) = self.check_version(&pdu) {
            return Some(Query::Error(report))
        }
        match pdu {
            Pdu::SerialQuery(query) => {
                debug!("RTR: got serial query for {}", query.serial());
                Some(Query::Serial {
                    session: query.session(),
                    serial: query.serial(),
                })
            }
            Pdu::ResetQuery(_) => {
                debug!("RTR: got reset query");
                Some(Query::Reset)
            }
            other => {
                debug!("RTR: got unexpected PDU");
                Some(Query::Error(pdu::ErrorReport::new(
                    other.version(),
                    ErrorCode::UNSUPPORTED_PDU_TYPE,
                    other.encode(),
                    "expected serial query or reset query"
                )))
            }
        }
    }

    /// Checks the version of a query.
    ///
    /// The first admissible query fixes the connection’s version. A query
    /// above our maximum draws the unsupported-version error whose version
    /// field carries the highest version we do speak; a version switch
    /// after negotiation draws the unexpected-version error.
    fn check_version(
        &mut self, pdu: &Pdu
    ) -> Result<(), pdu::ErrorReport> {
        let version = pdu.version();
        if let Some(current) = self.version {
            if version != current {
                Err(pdu::ErrorReport::new(
                    version,
                    ErrorCode::UNEXPECTED_PROTOCOL_VERSION,
                    pdu.encode(),
                    "version switched during connection"
                ))
            }
            else {
                Ok(())
            }
        }
        else if version > self.max_version {
            Err(pdu::ErrorReport::new(
                self.max_version,
                ErrorCode::UNSUPPORTED_PROTOCOL_VERSION,
                pdu.encode(),
                "protocol version not supported"
            ))
        }
        else {
            self.version = Some(version);
            Ok(())
        }
    }

    /// Sends out a response to a serial query.
    async fn serial(
        &mut self, session: u16, serial: Serial
    ) -> Result<(), Error> {
        if !self.maintainer.ready() {
            return self.not_ready().await
        }
        let version = self.version();
        match self.maintainer.diff(session, serial) {
            Some((current, entries)) => {
                debug!("RTR: replaying {} changes", entries.len());
                Pdu::CacheResponse(
                    pdu::CacheResponse::new(version, session)
                ).write(&mut self.sock).await?;
                for (action, payload) in entries {
                    if !payload.supported_in(version) {
                        continue
                    }
                    Pdu::payload(version, action, &payload)
                        .write(&mut self.sock).await?;
                }
                Pdu::EndOfData(pdu::EndOfData::new(
                    version, session, current, self.maintainer.timing()
                )).write(&mut self.sock).await?;
            }
            None => {
                debug!("RTR: no diff available, sending cache reset");
                Pdu::CacheReset(
                    pdu::CacheReset::new(version)
                ).write(&mut self.sock).await?;
            }
        }
        self.sock.flush().await?;
        Ok(())
    }

    /// Sends out a response to a reset query.
    async fn reset(&mut self) -> Result<(), Error> {
        if !self.maintainer.ready() {
            return self.not_ready().await
        }
        let version = self.version();
        let (session, serial, payloads) = self.maintainer.full();
        Pdu::CacheResponse(
            pdu::CacheResponse::new(version, session)
        ).write(&mut self.sock).await?;
        for payload in payloads {
            if !payload.supported_in(version) {
                continue
            }
            Pdu::payload(version, Action::Announce, &payload)
                .write(&mut self.sock).await?;
        }
        Pdu::EndOfData(pdu::EndOfData::new(
            version, session, serial, self.maintainer.timing()
        )).write(&mut self.sock).await?;
        self.sock.flush().await?;
        Ok(())
    }

    /// Answers a query with the No Data Available error.
    async fn not_ready(&mut self) -> Result<(), Error> {
        Pdu::ErrorReport(pdu::ErrorReport::new(
            self.version(), ErrorCode::NO_DATA_AVAILABLE,
            Vec::new(), "running initial validation"
        )).write(&mut self.sock).await?;
        self.sock.flush().await?;
        Ok(())
    }

    /// Sends an error response.
    async fn error(&mut self, err: pdu::ErrorReport) -> Result<(), Error> {
        Pdu::ErrorReport(err).write(&mut self.sock).await?;
        self.sock.flush().await?;
        Ok(())
    }

    /// Sends a serial notify.
    ///
    /// The state for the notify is taken from the maintainer.
    async fn notify(&mut self) -> Result<(), Error> {
        let (session, serial) = self.maintainer.state();
        Pdu::SerialNotify(
            pdu::SerialNotify::new(self.version(), session, serial)
        ).write(&mut self.sock).await?;
        self.sock.flush().await?;
        Ok(())
    }
}


//------------ ReadOutcome ---------------------------------------------------

/// What came out of waiting for the next PDU.
enum ReadOutcome {
    /// The maintainer has new data.
    Notify,

    /// The client sent a PDU.
    Pdu(Pdu),

    /// Reading failed.
    Fail(Error),
}


//------------ Query ---------------------------------------------------------

/// What a server connection was asked to do next.
enum Query {
    /// A serial query with the given state was received from the client.
    Serial {
        session: u16,
        serial: Serial,
    },

    /// A reset query was received from the client.
    Reset,

    /// The client misbehaved resulting in this error to be sent to it.
    Error(pdu::ErrorReport),

    /// The maintainer has new data available.
    Notify,
}


//------------ NotifySender --------------------------------------------------

/// A sender to notify a server that there are updates available.
#[derive(Clone, Debug)]
pub struct NotifySender(broadcast::Sender<()>);

impl NotifySender {
    /// Creates a new notify sender.
    pub fn new() -> NotifySender {
        NotifySender(broadcast::channel(1).0)
    }

    /// Notifies the server that there are updates available.
    pub fn notify(&mut self) {
        // Sending only fails if all receivers have been dropped. We can
        // ignore that case.
        let _ = self.0.send(());
    }

    fn subscribe(&self) -> NotifyReceiver {
        NotifyReceiver(Some(self.0.subscribe()))
    }
}

impl Default for NotifySender {
    fn default() -> Self {
        Self::new()
    }
}


//------------ NotifyReceiver ------------------------------------------------

/// The receiver for notifications.
///
/// This type is used by connections.
#[derive(Debug)]
struct NotifyReceiver(Option<broadcast::Receiver<()>>);

impl NotifyReceiver {
    pub async fn recv(&mut self) {
        use tokio::sync::broadcast::error::RecvError;

        if let Some(ref mut rx) = self.0 {
            match rx.recv().await {
                // Missing a few messages is fine. Each just means “there
                // is new data”, which lagging doesn’t make less true.
                Ok(()) | Err(RecvError::Lagged(_)) => return,
                Err(RecvError::Closed) => { }
            }
        }
        self.0 = None;
        future::pending().await
    }
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    fn changeset(entries: &[(Action, Payload)]) -> Changeset {
        let mut res = Changeset::new();
        for (action, payload) in entries {
            res.push(*action, payload.clone());
        }
        res
    }

    fn origin(addr: &str, asn: u32) -> Payload {
        Payload::origin(addr.parse().unwrap(), 24, 32, asn)
    }

    #[test]
    fn update_moves_serial() {
        let maintainer = Maintainer::with_session(42);
        assert_eq!(maintainer.state(), (42, Serial(0)));
        maintainer.update(changeset(&[
            (Action::Announce, origin("1.0.0.0", 4608))
        ])).unwrap();
        assert_eq!(maintainer.state(), (42, Serial(1)));
        let (_, serial, payloads) = maintainer.full();
        assert_eq!(serial, Serial(1));
        assert_eq!(payloads, [origin("1.0.0.0", 4608)]);
    }

    #[test]
    fn diff_replays_the_log() {
        let maintainer = Maintainer::with_session(42);
        maintainer.update(changeset(&[
            (Action::Announce, origin("1.0.0.0", 4608))
        ])).unwrap();
        maintainer.update(changeset(&[
            (Action::Withdraw, origin("1.0.0.0", 4608)),
            (Action::Announce, origin("10.0.0.0", 2000)),
        ])).unwrap();

        // Session mismatch.
        assert!(maintainer.diff(41, Serial(1)).is_none());

        // Up to date.
        let (serial, entries) = maintainer.diff(42, Serial(2)).unwrap();
        assert_eq!(serial, Serial(2));
        assert!(entries.is_empty());

        // One changeset behind.
        let (serial, entries) = maintainer.diff(42, Serial(1)).unwrap();
        assert_eq!(serial, Serial(2));
        assert_eq!(entries.len(), 2);

        // From the very beginning.
        let (_, entries) = maintainer.diff(42, Serial(0)).unwrap();
        assert_eq!(entries.len(), 3);

        // Unknown serial.
        assert!(maintainer.diff(42, Serial(7)).is_none());
    }

    #[test]
    fn update_failure_leaves_data_alone() {
        let maintainer = Maintainer::with_session(42);
        assert!(maintainer.update(changeset(&[
            (Action::Withdraw, origin("1.0.0.0", 4608))
        ])).is_err());
        assert_eq!(maintainer.state(), (42, Serial(0)));
        assert!(maintainer.full().2.is_empty());
    }
}
