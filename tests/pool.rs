//! The pool end to end: real TCP, persisted records, merged state.

use std::net::IpAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use rtrsync::changeset::Changeset;
use rtrsync::clock::ManualClock;
use rtrsync::error::Error;
use rtrsync::payload::{Action, Payload};
use rtrsync::pool::{Outcome, Pool};
use rtrsync::server::{Maintainer, NotifySender, Server};

const NOW: u64 = 1_700_000_000;

fn addr(addr: &str) -> IpAddr {
    addr.parse().unwrap()
}

fn origin(addr_str: &str, asn: u32) -> Payload {
    Payload::origin(addr(addr_str), 24, 32, asn)
}

fn announce(entries: &[Payload]) -> Changeset {
    let mut res = Changeset::new();
    for payload in entries {
        res.push(Action::Announce, payload.clone());
    }
    res
}

/// Starts a server for the maintainer and returns its port.
async fn spawn_server(maintainer: Maintainer) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Server::new(
        TcpListenerStream::new(listener),
        NotifySender::new(),
        maintainer,
    );
    tokio::spawn(server.run());
    port
}

#[tokio::test]
async fn init_creates_records() {
    let dir = tempfile::tempdir().unwrap();
    let pool = Pool::new(dir.path());
    pool.init(
        &[
            ("cache-a.example.net".into(), 3323),
            ("cache-b.example.net".into(), 8282),
        ],
        2
    ).unwrap();

    assert_eq!(pool.record_ids().unwrap(), [0, 1]);
    assert!(dir.path().join("client0.json").exists());
    assert!(dir.path().join("client1.json").exists());

    let record = pool.load(1).unwrap();
    assert_eq!(record.server(), "cache-b.example.net");
    assert_eq!(record.port(), 8282);
    assert_eq!(record.current_version(), 2);
    assert!(record.state().is_none());
}

#[tokio::test]
async fn refresh_over_tcp() {
    let maintainer = Maintainer::with_session(7);
    maintainer.update(announce(&[origin("1.0.0.0", 4608)])).unwrap();
    let port = spawn_server(maintainer.clone()).await;

    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(NOW));
    let pool = Pool::with_clock(dir.path(), clock.clone());
    pool.init(&[("127.0.0.1".into(), port)], 2).unwrap();

    // First refresh is a reset episode.
    assert_eq!(pool.refresh(0, false).await.unwrap(), Outcome::Updated);
    let record = pool.load(0).unwrap();
    let state = record.state().unwrap();
    assert_eq!(state.serial(), 1);
    assert_eq!(state.origins()[&4608][&addr("1.0.0.0")][&24][&32], 1);
    assert_eq!(record.last_run(), Some(NOW));

    // Within the refresh interval nothing happens, not even I/O.
    assert_eq!(pool.refresh(0, false).await.unwrap(), Outcome::Skipped);

    // Once the interval passed, the update is picked up serially.
    let mut update = Changeset::new();
    update.push(Action::Announce, origin("10.0.0.0", 2000));
    maintainer.update(update).unwrap();
    clock.advance(3_700);
    assert_eq!(pool.refresh(0, false).await.unwrap(), Outcome::Updated);
    let record = pool.load(0).unwrap();
    let state = record.state().unwrap();
    assert_eq!(state.serial(), 2);
    assert_eq!(state.origins()[&2000][&addr("10.0.0.0")][&24][&32], 1);
}

#[tokio::test]
async fn merged_state_of_two_caches() {
    let maintainer_a = Maintainer::with_session(1);
    maintainer_a.update(announce(&[
        origin("1.0.0.0", 4608),
        Payload::aspa(4708, vec![10, 20, 30]),
    ])).unwrap();
    let maintainer_b = Maintainer::with_session(2);
    maintainer_b.update(announce(&[
        origin("10.0.0.0", 2000),
        Payload::aspa(4708, vec![30, 40, 50, 60]),
    ])).unwrap();

    let port_a = spawn_server(maintainer_a).await;
    let port_b = spawn_server(maintainer_b).await;

    let dir = tempfile::tempdir().unwrap();
    let pool = Pool::with_clock(
        dir.path(), Arc::new(ManualClock::new(NOW))
    );
    pool.init(
        &[("127.0.0.1".into(), port_a), ("127.0.0.1".into(), port_b)], 2
    ).unwrap();

    for (id, res) in pool.refresh_all(false).await.unwrap() {
        assert_eq!(res.unwrap(), Outcome::Updated, "client {id}");
    }

    let merged = pool.merged_state().unwrap();
    assert_eq!(merged.origins()[&4608][&addr("1.0.0.0")][&24][&32], 1);
    assert_eq!(merged.origins()[&2000][&addr("10.0.0.0")][&24][&32], 1);
    assert_eq!(merged.aspas()[&4708], vec![10, 20, 30, 40, 50, 60]);
}

#[tokio::test]
async fn one_failing_cache_leaves_siblings_alone() {
    let maintainer = Maintainer::with_session(1);
    maintainer.update(announce(&[origin("1.0.0.0", 4608)])).unwrap();
    let port = spawn_server(maintainer).await;

    let dir = tempfile::tempdir().unwrap();
    let pool = Pool::with_clock(
        dir.path(), Arc::new(ManualClock::new(NOW))
    );
    // Record 0 points into the void.
    pool.init(
        &[("127.0.0.1".into(), 9), ("127.0.0.1".into(), port)], 2
    ).unwrap();

    let results = pool.refresh_all(false).await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(results[0].1.is_err());
    assert_eq!(*results[1].1.as_ref().unwrap(), Outcome::Updated);

    assert_eq!(pool.load(0).unwrap().last_failure(), Some(NOW));
    assert!(pool.load(1).unwrap().state().is_some());
}

#[tokio::test]
async fn retry_gate_prevents_io() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(NOW));
    let pool = Pool::with_clock(dir.path(), clock.clone());
    // Nothing listens on this port; any connection attempt would fail
    // loudly rather than skip.
    pool.init(&[("127.0.0.1".into(), 9)], 2).unwrap();

    let mut record = pool.load(0).unwrap();
    record.note_failure(NOW);
    pool.store(0, &record).unwrap();

    assert_eq!(pool.refresh(0, false).await.unwrap(), Outcome::Skipped);

    // Force bypasses the gate and actually hits the closed port.
    assert!(pool.refresh(0, true).await.is_err());

    // After the retry interval the gate opens by itself.
    clock.advance(700);
    assert!(pool.refresh(0, false).await.is_err());
}

#[tokio::test]
async fn expired_data_is_discarded() {
    let maintainer = Maintainer::with_session(7);
    maintainer.update(announce(&[origin("1.0.0.0", 4608)])).unwrap();
    let port = spawn_server(maintainer).await;

    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(NOW));
    let pool = Pool::with_clock(dir.path(), clock.clone());
    pool.init(&[("127.0.0.1".into(), port)], 2).unwrap();
    assert_eq!(pool.refresh(0, false).await.unwrap(), Outcome::Updated);

    // A failure, then silence past the expire interval.
    let mut record = pool.load(0).unwrap();
    record.note_failure(NOW + 100);
    pool.store(0, &record).unwrap();
    clock.advance(7_500);

    // The gate is open again; the stored data is gone before the
    // episode starts, so this runs as a reset.
    assert_eq!(pool.refresh(0, false).await.unwrap(), Outcome::Updated);
    let record = pool.load(0).unwrap();
    let state = record.state().unwrap();
    assert_eq!(state.serial(), 1);
    assert_eq!(state.origins()[&4608][&addr("1.0.0.0")][&24][&32], 1);
}

#[tokio::test]
async fn broken_record_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let pool = Pool::new(dir.path());
    std::fs::write(
        dir.path().join("client0.json"), b"{\"server\": true}"
    ).unwrap();
    assert!(matches!(pool.load(0), Err(Error::Io(_))));
}
