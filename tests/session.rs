//! Client sessions against a real server and against scripted caches.

use std::io;
use std::net::IpAddr;
use tokio::io::duplex;
use rtrsync::changeset::Changeset;
use rtrsync::client::Session;
use rtrsync::error::Error;
use rtrsync::payload::{Action, Payload, Timing};
use rtrsync::pdu::{self, ErrorCode, Pdu};
use rtrsync::record::{ClientRecord, EndOfDataInfo};
use rtrsync::server::{Maintainer, NotifySender, Server};
use rtrsync::state::Cache;

const NOW: u64 = 1_700_000_000;

fn addr(addr: &str) -> IpAddr {
    addr.parse().unwrap()
}

fn origin(addr_str: &str, prefix_len: u8, max_len: u8, asn: u32) -> Payload {
    Payload::origin(addr(addr_str), prefix_len, max_len, asn)
}

fn announce(entries: &[Payload]) -> Changeset {
    let mut res = Changeset::new();
    for payload in entries {
        res.push(Action::Announce, payload.clone());
    }
    res
}

fn record() -> ClientRecord {
    ClientRecord::new("cache.example.net".into(), 3323, vec![0, 1, 2])
}

/// A record that already holds state from an earlier episode.
fn synced_record(session: u16, serial: u32, entries: &[Payload]) -> ClientRecord {
    let mut record = record();
    let mut state = Cache::new(session, serial.into());
    state.apply(&announce(entries)).unwrap();
    record.commit(
        state,
        EndOfDataInfo {
            session_id: session,
            serial_number: serial,
            timing: Some(Timing::default()),
        },
        NOW - 4_000,
    );
    record
}

/// Runs one episode against a server over an in-memory socket pair.
async fn exchange(
    maintainer: &Maintainer,
    record: &mut ClientRecord,
    reset: bool,
    max_version: u8,
) -> Result<(), Error> {
    let (client_sock, server_sock) = duplex(65536);
    let listener = tokio_stream::iter(
        vec![Ok::<_, io::Error>(server_sock)]
    );
    let server = Server::new(
        listener, NotifySender::new(), maintainer.clone()
    ).with_max_version(max_version);
    tokio::spawn(server.run());
    let session = Session::new(client_sock, record, NOW);
    if reset {
        session.reset().await
    }
    else {
        session.refresh().await
    }
}


//------------ Against the real server ---------------------------------------

#[tokio::test]
async fn reset_one_prefix() {
    let maintainer = Maintainer::with_session(4711);
    maintainer.update(announce(&[origin("1.0.0.0", 24, 32, 4608)])).unwrap();

    let mut record = record();
    exchange(&maintainer, &mut record, true, 2).await.unwrap();

    let state = record.state().unwrap();
    assert_eq!(state.session(), 4711);
    assert_eq!(state.serial(), 1);
    assert_eq!(
        state.origins()[&4608][&addr("1.0.0.0")][&24][&32], 1
    );
    assert_eq!(state.origins().len(), 1);
    assert_eq!(record.current_version(), 2);
    assert_eq!(record.last_run(), Some(NOW));
    assert_eq!(record.last_failure(), None);
    let eod = record.eod().unwrap();
    assert_eq!(eod.session_id, 4711);
    assert_eq!(eod.serial_number, 1);
    assert!(eod.timing.is_some());
}

#[tokio::test]
async fn reset_aspas() {
    let maintainer = Maintainer::with_session(4711);
    maintainer.update(announce(&[
        Payload::aspa(4708, vec![10, 20, 30]),
        Payload::aspa(5000, vec![11, 22, 33]),
    ])).unwrap();

    let mut record = record();
    exchange(&maintainer, &mut record, true, 2).await.unwrap();

    let aspas = record.state().unwrap().aspas();
    assert_eq!(aspas.len(), 2);
    assert_eq!(aspas[&4708], vec![10, 20, 30]);
    assert_eq!(aspas[&5000], vec![11, 22, 33]);
}

#[tokio::test]
async fn merge_two_caches() {
    let maintainer_a = Maintainer::with_session(1);
    maintainer_a.update(announce(&[
        origin("1.0.0.0", 24, 32, 4608),
        Payload::aspa(4708, vec![10, 20, 30]),
    ])).unwrap();
    let maintainer_b = Maintainer::with_session(2);
    maintainer_b.update(announce(&[
        origin("10.0.0.0", 24, 32, 2000),
        Payload::aspa(4708, vec![30, 40, 50, 60]),
    ])).unwrap();

    let mut record_a = record();
    let mut record_b = record();
    exchange(&maintainer_a, &mut record_a, true, 2).await.unwrap();
    exchange(&maintainer_b, &mut record_b, true, 2).await.unwrap();

    let merged = record_a.state().unwrap()
        .merge(record_b.state().unwrap()).unwrap();
    assert_eq!(merged.origins()[&4608][&addr("1.0.0.0")][&24][&32], 1);
    assert_eq!(merged.origins()[&2000][&addr("10.0.0.0")][&24][&32], 1);
    assert_eq!(merged.aspas()[&4708], vec![10, 20, 30, 40, 50, 60]);
}

#[tokio::test]
async fn version_downgrade() {
    let maintainer = Maintainer::with_session(4711);
    maintainer.update(announce(&[
        origin("1.0.0.0", 24, 32, 4608),
        Payload::aspa(4708, vec![10, 20, 30]),
    ])).unwrap();

    // The server only speaks up to version 1.
    let mut record = record();
    exchange(&maintainer, &mut record, true, 1).await.unwrap();

    assert_eq!(record.current_version(), 1);
    let state = record.state().unwrap();
    assert_eq!(
        state.origins()[&4608][&addr("1.0.0.0")][&24][&32], 1
    );
    // The ASPA unit can’t be expressed in version 1.
    assert!(state.aspas().is_empty());
}

#[tokio::test]
async fn version_negotiation_exhausted() {
    let maintainer = Maintainer::with_session(4711);
    let mut record = ClientRecord::new(
        "cache.example.net".into(), 3323, vec![2]
    );
    let res = exchange(&maintainer, &mut record, true, 1).await;
    assert!(matches!(res, Err(Error::UnsupportedVersion(1))));
    assert_eq!(record.last_failure(), Some(NOW));
    assert!(record.state().is_none());
}

#[tokio::test]
async fn serial_refresh() {
    let maintainer = Maintainer::with_session(4711);
    maintainer.update(announce(&[origin("1.0.0.0", 24, 32, 4608)])).unwrap();

    let mut record = record();
    exchange(&maintainer, &mut record, true, 2).await.unwrap();
    assert_eq!(record.state().unwrap().serial(), 1);

    let mut update = Changeset::new();
    update.push(Action::Withdraw, origin("1.0.0.0", 24, 32, 4608));
    update.push(Action::Announce, origin("10.0.0.0", 24, 32, 2000));
    maintainer.update(update).unwrap();

    exchange(&maintainer, &mut record, false, 2).await.unwrap();
    let state = record.state().unwrap();
    assert_eq!(state.serial(), 2);
    assert!(!state.origins().contains_key(&4608));
    assert_eq!(state.origins()[&2000][&addr("10.0.0.0")][&24][&32], 1);
}

#[tokio::test]
async fn refresh_while_up_to_date() {
    let maintainer = Maintainer::with_session(4711);
    maintainer.update(announce(&[origin("1.0.0.0", 24, 32, 4608)])).unwrap();

    let mut record = record();
    exchange(&maintainer, &mut record, true, 2).await.unwrap();
    let before = record.state().unwrap().clone();

    exchange(&maintainer, &mut record, false, 2).await.unwrap();
    assert_eq!(record.state().unwrap(), &before);
}

#[tokio::test]
async fn not_ready_cache() {
    let maintainer = Maintainer::with_session(4711);
    maintainer.set_ready(false);

    let mut record = record();
    let res = exchange(&maintainer, &mut record, true, 2).await;
    assert!(matches!(res, Err(Error::NoData)));
    assert_eq!(record.last_failure(), Some(NOW));
}

#[tokio::test]
async fn stale_serial_draws_cache_reset() {
    let maintainer = Maintainer::with_session(4711);
    maintainer.update(announce(&[origin("1.0.0.0", 24, 32, 4608)])).unwrap();

    // The record claims a serial the log doesn’t know, so the server
    // answers with a cache reset and the client runs a reset episode.
    let mut record = synced_record(4711, 99, &[origin("2.0.0.0", 24, 24, 1)]);
    exchange(&maintainer, &mut record, false, 2).await.unwrap();

    let state = record.state().unwrap();
    assert_eq!(state.serial(), 1);
    assert!(!state.origins().contains_key(&1));
    assert_eq!(
        state.origins()[&4608][&addr("1.0.0.0")][&24][&32], 1
    );
}


//------------ Against scripted caches ---------------------------------------

#[tokio::test]
async fn midstream_cache_reset() {
    let (client_sock, mut peer) = duplex(65536);
    let mut record = synced_record(
        999, 5, &[origin("2.0.0.0", 24, 24, 1)]
    );

    let script = tokio::spawn(async move {
        // A serial episode starts.
        match Pdu::read(&mut peer).await.unwrap() {
            Pdu::SerialQuery(query) => {
                assert_eq!(query.version(), 2);
                assert_eq!(query.session(), 999);
                assert_eq!(query.serial(), 5u32);
            }
            _ => panic!("expected serial query"),
        }
        Pdu::CacheResponse(pdu::CacheResponse::new(2, 999))
            .write(&mut peer).await.unwrap();
        Pdu::Ipv4Prefix(pdu::Ipv4Prefix::new(
            2, 1, 24, 32, "3.0.0.0".parse().unwrap(), 3000
        )).write(&mut peer).await.unwrap();
        // Change of plan: the session is dead.
        Pdu::CacheReset(pdu::CacheReset::new(2))
            .write(&mut peer).await.unwrap();

        // The client must come back with a reset query right away.
        match Pdu::read(&mut peer).await.unwrap() {
            Pdu::ResetQuery(query) => assert_eq!(query.version(), 2),
            _ => panic!("expected reset query"),
        }
        Pdu::CacheResponse(pdu::CacheResponse::new(2, 1234))
            .write(&mut peer).await.unwrap();
        Pdu::Ipv4Prefix(pdu::Ipv4Prefix::new(
            2, 1, 24, 32, "1.0.0.0".parse().unwrap(), 4608
        )).write(&mut peer).await.unwrap();
        Pdu::EndOfData(pdu::EndOfData::new(
            2, 1234, 7.into(), Timing::default()
        )).write(&mut peer).await.unwrap();
        peer
    });

    Session::new(client_sock, &mut record, NOW)
        .refresh().await.unwrap();
    script.await.unwrap();

    // Only the reset result survives.
    let state = record.state().unwrap();
    assert_eq!(state.session(), 1234);
    assert_eq!(state.serial(), 7);
    assert_eq!(state.origins().len(), 1);
    assert_eq!(
        state.origins()[&4608][&addr("1.0.0.0")][&24][&32], 1
    );
    assert!(!state.origins().contains_key(&3000));
    assert_eq!(record.last_run(), Some(NOW));
}

#[tokio::test]
async fn session_id_mismatch() {
    let (client_sock, mut peer) = duplex(65536);
    let mut record = synced_record(
        999, 5, &[origin("2.0.0.0", 24, 24, 1)]
    );
    let before = record.state().unwrap().clone();

    let script = tokio::spawn(async move {
        let _ = Pdu::read(&mut peer).await.unwrap();
        // Answer with somebody else’s session.
        Pdu::CacheResponse(pdu::CacheResponse::new(2, 1000))
            .write(&mut peer).await.unwrap();
        // The client must report corrupt data before hanging up.
        match Pdu::read(&mut peer).await.unwrap() {
            Pdu::ErrorReport(report) => {
                assert_eq!(report.code(), ErrorCode::CORRUPT_DATA);
            }
            _ => panic!("expected error report"),
        }
    });

    let res = Session::new(client_sock, &mut record, NOW)
        .refresh().await;
    assert!(matches!(res, Err(Error::ProtocolViolation(_))));
    script.await.unwrap();

    assert_eq!(record.state().unwrap(), &before);
    assert_eq!(record.last_failure(), Some(NOW));
}

#[tokio::test]
async fn version_change_mid_episode() {
    let (client_sock, mut peer) = duplex(65536);
    let mut record = record();

    let script = tokio::spawn(async move {
        let _ = Pdu::read(&mut peer).await.unwrap();
        Pdu::CacheResponse(pdu::CacheResponse::new(2, 12))
            .write(&mut peer).await.unwrap();
        // Suddenly version 1.
        Pdu::Ipv4Prefix(pdu::Ipv4Prefix::new(
            1, 1, 24, 32, "1.0.0.0".parse().unwrap(), 4608
        )).write(&mut peer).await.unwrap();
        match Pdu::read(&mut peer).await.unwrap() {
            Pdu::ErrorReport(report) => {
                assert_eq!(
                    report.code(),
                    ErrorCode::UNEXPECTED_PROTOCOL_VERSION
                );
            }
            _ => panic!("expected error report"),
        }
    });

    let res = Session::new(client_sock, &mut record, NOW)
        .reset().await;
    assert!(matches!(res, Err(Error::ProtocolViolation(_))));
    script.await.unwrap();
    assert!(record.state().is_none());
}

#[tokio::test]
async fn serial_notify_is_informational() {
    let (client_sock, mut peer) = duplex(65536);
    let mut record = synced_record(
        999, 5, &[origin("2.0.0.0", 24, 24, 1)]
    );

    let script = tokio::spawn(async move {
        let _ = Pdu::read(&mut peer).await.unwrap();
        // A notify before the response and another among the deltas.
        Pdu::SerialNotify(pdu::SerialNotify::new(2, 999, 6.into()))
            .write(&mut peer).await.unwrap();
        Pdu::CacheResponse(pdu::CacheResponse::new(2, 999))
            .write(&mut peer).await.unwrap();
        Pdu::Ipv4Prefix(pdu::Ipv4Prefix::new(
            2, 1, 24, 32, "1.0.0.0".parse().unwrap(), 4608
        )).write(&mut peer).await.unwrap();
        Pdu::SerialNotify(pdu::SerialNotify::new(2, 999, 7.into()))
            .write(&mut peer).await.unwrap();
        Pdu::EndOfData(pdu::EndOfData::new(
            2, 999, 6.into(), Timing::default()
        )).write(&mut peer).await.unwrap();
    });

    Session::new(client_sock, &mut record, NOW)
        .refresh().await.unwrap();
    script.await.unwrap();

    let state = record.state().unwrap();
    assert_eq!(state.serial(), 6);
    assert_eq!(
        state.origins()[&4608][&addr("1.0.0.0")][&24][&32], 1
    );
}

#[tokio::test]
async fn payload_before_cache_response() {
    let (client_sock, mut peer) = duplex(65536);
    let mut record = record();

    let script = tokio::spawn(async move {
        let _ = Pdu::read(&mut peer).await.unwrap();
        // Payload without a cache response framing it.
        Pdu::Ipv4Prefix(pdu::Ipv4Prefix::new(
            2, 1, 24, 32, "1.0.0.0".parse().unwrap(), 4608
        )).write(&mut peer).await.unwrap();
        match Pdu::read(&mut peer).await.unwrap() {
            Pdu::ErrorReport(report) => {
                assert_eq!(report.code(), ErrorCode::CORRUPT_DATA);
            }
            _ => panic!("expected error report"),
        }
    });

    let res = Session::new(client_sock, &mut record, NOW)
        .reset().await;
    assert!(matches!(res, Err(Error::ProtocolViolation(_))));
    script.await.unwrap();
}

#[tokio::test]
async fn withdraw_of_unknown_entry_escalates() {
    let (client_sock, mut peer) = duplex(65536);
    let mut record = synced_record(
        999, 5, &[origin("2.0.0.0", 24, 24, 1)]
    );

    let script = tokio::spawn(async move {
        let _ = Pdu::read(&mut peer).await.unwrap();
        Pdu::CacheResponse(pdu::CacheResponse::new(2, 999))
            .write(&mut peer).await.unwrap();
        // Withdraw something the client never saw.
        Pdu::Ipv4Prefix(pdu::Ipv4Prefix::new(
            2, 0, 24, 32, "9.0.0.0".parse().unwrap(), 9000
        )).write(&mut peer).await.unwrap();
        Pdu::EndOfData(pdu::EndOfData::new(
            2, 999, 6.into(), Timing::default()
        )).write(&mut peer).await.unwrap();

        // The client falls back to a reset episode.
        match Pdu::read(&mut peer).await.unwrap() {
            Pdu::ResetQuery(_) => { }
            _ => panic!("expected reset query"),
        }
        Pdu::CacheResponse(pdu::CacheResponse::new(2, 999))
            .write(&mut peer).await.unwrap();
        Pdu::Ipv4Prefix(pdu::Ipv4Prefix::new(
            2, 1, 24, 32, "1.0.0.0".parse().unwrap(), 4608
        )).write(&mut peer).await.unwrap();
        Pdu::EndOfData(pdu::EndOfData::new(
            2, 999, 6.into(), Timing::default()
        )).write(&mut peer).await.unwrap();
    });

    Session::new(client_sock, &mut record, NOW)
        .refresh().await.unwrap();
    script.await.unwrap();

    let state = record.state().unwrap();
    assert_eq!(state.origins().len(), 1);
    assert_eq!(
        state.origins()[&4608][&addr("1.0.0.0")][&24][&32], 1
    );
}
