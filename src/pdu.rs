//! Raw protocol data.
//!
//! This module contains the types that represent the protocol data units of
//! RTR. Each PDU type has its own struct; the [`Pdu`] enum tags the closed
//! set of all eleven of them. Encoding and decoding are total functions per
//! variant: `encode` produces the exact wire representation, `decode`
//! rejects everything that is not one. See section 5 of RFC 6810 and
//! RFC 8210. Annoyingly, the format of the end-of-data PDU changes between
//! the two versions.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use crate::error::{Error, Malformed};
use crate::payload::{Action, Payload, Timing};
use crate::state::Serial;


//------------ Limits --------------------------------------------------------

/// The largest PDU length we are willing to accept.
///
/// The length field is 32 bits wide but nothing legitimate comes anywhere
/// near that, so everything larger than this is treated as corrupt.
pub const MAX_PDU_SIZE: u32 = 65535;


//------------ ErrorCode -----------------------------------------------------

/// The registry of RTR error codes used by this implementation.
pub struct ErrorCode;

impl ErrorCode {
    pub const CORRUPT_DATA: u16 = 0;
    pub const NO_DATA_AVAILABLE: u16 = 2;
    pub const UNSUPPORTED_PDU_TYPE: u16 = 3;
    pub const UNSUPPORTED_PROTOCOL_VERSION: u16 = 4;
    pub const UNEXPECTED_PROTOCOL_VERSION: u16 = 8;
}


//------------ Header --------------------------------------------------------

/// The header portion of an RTR PDU.
///
/// Every PDU starts with the same eight octets: the protocol version, the
/// PDU type, a sixteen bit field that carries the session ID, an error
/// code, or must be zero, depending on the type, and the length of the
/// whole PDU including the header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Header {
    version: u8,
    pdu: u8,
    session: u16,
    length: u32,
}

impl Header {
    /// The size of the header on the wire.
    pub const LEN: usize = 8;

    /// Creates a new header.
    pub fn new(version: u8, pdu: u8, session: u16, length: u32) -> Self {
        Header { version, pdu, session, length }
    }

    /// Parses the header from its wire representation.
    ///
    /// This checks that the length field is at least the header size and
    /// at most [`MAX_PDU_SIZE`].
    pub fn parse(buf: &[u8; Self::LEN]) -> Result<Self, Error> {
        let res = Header {
            version: buf[0],
            pdu: buf[1],
            session: u16::from_be_bytes([buf[2], buf[3]]),
            length: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        };
        if res.length < Self::LEN as u32 {
            return Err(Malformed::with_octets(
                ErrorCode::CORRUPT_DATA,
                "PDU length below header size",
                buf.to_vec()
            ).into())
        }
        if res.length > MAX_PDU_SIZE {
            return Err(Malformed::with_octets(
                ErrorCode::CORRUPT_DATA,
                "excessive PDU length",
                buf.to_vec()
            ).into())
        }
        Ok(res)
    }

    /// Returns the wire representation of the header.
    pub fn encode(self) -> [u8; Self::LEN] {
        let session = self.session.to_be_bytes();
        let length = self.length.to_be_bytes();
        [
            self.version, self.pdu, session[0], session[1],
            length[0], length[1], length[2], length[3],
        ]
    }

    /// Reads the header from a reader.
    pub async fn read<Sock: AsyncRead + Unpin>(
        sock: &mut Sock
    ) -> Result<Self, Error> {
        let mut buf = [0u8; Self::LEN];
        sock.read_exact(&mut buf).await?;
        Self::parse(&buf)
    }

    /// Returns the version of this PDU.
    pub fn version(self) -> u8 {
        self.version
    }

    /// Returns the PDU type.
    pub fn pdu(self) -> u8 {
        self.pdu
    }

    /// Returns the session ID of this PDU.
    ///
    /// Note that this field is used for other purposes in some PDU types.
    pub fn session(self) -> u16 {
        self.session
    }

    /// Returns the length of the PDU.
    ///
    /// This is the length of the full PDU including the header.
    pub fn length(self) -> u32 {
        self.length
    }
}


//------------ SerialNotify --------------------------------------------------

/// A serial notify informs a client that a cache has new data.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SerialNotify {
    version: u8,
    session: u16,
    serial: Serial,
}

impl SerialNotify {
    /// The PDU type of a serial notify.
    pub const PDU: u8 = 0;

    /// The size of a serial notify on the wire.
    const SIZE: u32 = 12;

    /// Creates a new serial notify PDU.
    pub fn new(version: u8, session: u16, serial: Serial) -> Self {
        SerialNotify { version, session, serial }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn session(&self) -> u16 {
        self.session
    }

    pub fn serial(&self) -> Serial {
        self.serial
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut res = Header::new(
            self.version, Self::PDU, self.session, Self::SIZE
        ).encode().to_vec();
        res.extend_from_slice(&u32::from(self.serial).to_be_bytes());
        res
    }

    fn parse(header: Header, body: &[u8]) -> Result<Self, Error> {
        if body.len() != 4 {
            return Err(invalid_length(header, body))
        }
        Ok(SerialNotify {
            version: header.version(),
            session: header.session(),
            serial: u32_at(body, 0).into(),
        })
    }
}


//------------ SerialQuery ---------------------------------------------------

/// A serial query requests all updates since a client’s last update.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SerialQuery {
    version: u8,
    session: u16,
    serial: Serial,
}

impl SerialQuery {
    /// The PDU type of a serial query.
    pub const PDU: u8 = 1;

    const SIZE: u32 = 12;

    /// Creates a new serial query for the given session state.
    pub fn new(version: u8, session: u16, serial: Serial) -> Self {
        SerialQuery { version, session, serial }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn session(&self) -> u16 {
        self.session
    }

    pub fn serial(&self) -> Serial {
        self.serial
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut res = Header::new(
            self.version, Self::PDU, self.session, Self::SIZE
        ).encode().to_vec();
        res.extend_from_slice(&u32::from(self.serial).to_be_bytes());
        res
    }

    fn parse(header: Header, body: &[u8]) -> Result<Self, Error> {
        if body.len() != 4 {
            return Err(invalid_length(header, body))
        }
        Ok(SerialQuery {
            version: header.version(),
            session: header.session(),
            serial: u32_at(body, 0).into(),
        })
    }
}


//------------ ResetQuery ----------------------------------------------------

/// A reset query requests the complete current set of data.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResetQuery {
    version: u8,
}

impl ResetQuery {
    /// The PDU type of a reset query.
    pub const PDU: u8 = 2;

    const SIZE: u32 = 8;

    /// Creates a new reset query.
    pub fn new(version: u8) -> Self {
        ResetQuery { version }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn encode(&self) -> Vec<u8> {
        Header::new(self.version, Self::PDU, 0, Self::SIZE)
            .encode().to_vec()
    }

    fn parse(header: Header, body: &[u8]) -> Result<Self, Error> {
        if !body.is_empty() {
            return Err(invalid_length(header, body))
        }
        if header.session() != 0 {
            return Err(nonzero_reserved(header, body))
        }
        Ok(ResetQuery { version: header.version() })
    }
}


//------------ CacheResponse -------------------------------------------------

/// The cache response starts a sequence of payload PDUs with data.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CacheResponse {
    version: u8,
    session: u16,
}

impl CacheResponse {
    /// The PDU type of a cache response.
    pub const PDU: u8 = 3;

    const SIZE: u32 = 8;

    /// Creates a new cache response for the given session.
    pub fn new(version: u8, session: u16) -> Self {
        CacheResponse { version, session }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn session(&self) -> u16 {
        self.session
    }

    pub fn encode(&self) -> Vec<u8> {
        Header::new(self.version, Self::PDU, self.session, Self::SIZE)
            .encode().to_vec()
    }

    fn parse(header: Header, body: &[u8]) -> Result<Self, Error> {
        if !body.is_empty() {
            return Err(invalid_length(header, body))
        }
        Ok(CacheResponse {
            version: header.version(),
            session: header.session(),
        })
    }
}


//------------ Ipv4Prefix ----------------------------------------------------

/// The payload PDU for route origin authorisation in IPv4.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Ipv4Prefix {
    version: u8,
    flags: u8,
    prefix_len: u8,
    max_len: u8,
    prefix: Ipv4Addr,
    asn: u32,
}

impl Ipv4Prefix {
    /// The PDU type of an IPv4 prefix.
    pub const PDU: u8 = 4;

    const SIZE: u32 = 20;

    /// Creates a new IPv4 prefix from all the various fields.
    pub fn new(
        version: u8,
        flags: u8,
        prefix_len: u8,
        max_len: u8,
        prefix: Ipv4Addr,
        asn: u32
    ) -> Self {
        Ipv4Prefix { version, flags, prefix_len, max_len, prefix, asn }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the flags field of the prefix.
    ///
    /// The only flag currently used is the least significant bit which is
    /// 1 for an announcement and 0 for a withdrawal.
    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn max_len(&self) -> u8 {
        self.max_len
    }

    pub fn prefix(&self) -> Ipv4Addr {
        self.prefix
    }

    pub fn asn(&self) -> u32 {
        self.asn
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut res = Header::new(
            self.version, Self::PDU, 0, Self::SIZE
        ).encode().to_vec();
        res.push(self.flags);
        res.push(0);
        res.push(self.prefix_len);
        res.push(self.max_len);
        res.extend_from_slice(&u32::from(self.prefix).to_be_bytes());
        res.extend_from_slice(&self.asn.to_be_bytes());
        res
    }

    fn parse(header: Header, body: &[u8]) -> Result<Self, Error> {
        if body.len() != 12 {
            return Err(invalid_length(header, body))
        }
        if header.session() != 0 || body[1] != 0 {
            return Err(nonzero_reserved(header, body))
        }
        let prefix_len = body[2];
        let max_len = body[3];
        if prefix_len > max_len || max_len > 32 {
            return Err(Malformed::with_octets(
                ErrorCode::CORRUPT_DATA,
                "invalid prefix lengths in IPv4 prefix",
                full_octets(header, body)
            ).into())
        }
        Ok(Ipv4Prefix {
            version: header.version(),
            flags: body[0],
            prefix_len,
            max_len,
            prefix: u32_at(body, 4).into(),
            asn: u32_at(body, 8),
        })
    }
}


//------------ Ipv6Prefix ----------------------------------------------------

/// The payload PDU for route origin authorisation in IPv6.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Ipv6Prefix {
    version: u8,
    flags: u8,
    prefix_len: u8,
    max_len: u8,
    prefix: Ipv6Addr,
    asn: u32,
}

impl Ipv6Prefix {
    /// The PDU type of an IPv6 prefix.
    pub const PDU: u8 = 6;

    const SIZE: u32 = 32;

    /// Creates a new IPv6 prefix from all the various fields.
    pub fn new(
        version: u8,
        flags: u8,
        prefix_len: u8,
        max_len: u8,
        prefix: Ipv6Addr,
        asn: u32
    ) -> Self {
        Ipv6Prefix { version, flags, prefix_len, max_len, prefix, asn }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the flags field of the prefix.
    ///
    /// The only flag currently used is the least significant bit which is
    /// 1 for an announcement and 0 for a withdrawal.
    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn max_len(&self) -> u8 {
        self.max_len
    }

    pub fn prefix(&self) -> Ipv6Addr {
        self.prefix
    }

    pub fn asn(&self) -> u32 {
        self.asn
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut res = Header::new(
            self.version, Self::PDU, 0, Self::SIZE
        ).encode().to_vec();
        res.push(self.flags);
        res.push(0);
        res.push(self.prefix_len);
        res.push(self.max_len);
        res.extend_from_slice(&u128::from(self.prefix).to_be_bytes());
        res.extend_from_slice(&self.asn.to_be_bytes());
        res
    }

    fn parse(header: Header, body: &[u8]) -> Result<Self, Error> {
        if body.len() != 24 {
            return Err(invalid_length(header, body))
        }
        if header.session() != 0 || body[1] != 0 {
            return Err(nonzero_reserved(header, body))
        }
        let prefix_len = body[2];
        let max_len = body[3];
        if prefix_len > max_len || max_len > 128 {
            return Err(Malformed::with_octets(
                ErrorCode::CORRUPT_DATA,
                "invalid prefix lengths in IPv6 prefix",
                full_octets(header, body)
            ).into())
        }
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&body[4..20]);
        Ok(Ipv6Prefix {
            version: header.version(),
            flags: body[0],
            prefix_len,
            max_len,
            prefix: u128::from_be_bytes(octets).into(),
            asn: u32_at(body, 20),
        })
    }
}


//------------ EndOfData -----------------------------------------------------

/// End-of-data marks the end of a sequence of payload PDUs.
///
/// The PDU differs between version 0 and the later versions: only the
/// latter carry the three timing values. Consequently, the `timing` field
/// is `None` exactly for version 0 values.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EndOfData {
    version: u8,
    session: u16,
    serial: Serial,
    timing: Option<Timing>,
}

impl EndOfData {
    /// The PDU type of end-of-data.
    pub const PDU: u8 = 7;

    /// Creates a new end-of-data PDU.
    ///
    /// If `version` is 0, the timing values are quietly dropped since the
    /// old PDU format cannot carry them.
    pub fn new(
        version: u8, session: u16, serial: Serial, timing: Timing
    ) -> Self {
        EndOfData {
            version, session, serial,
            timing: if version == 0 { None } else { Some(timing) },
        }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn session(&self) -> u16 {
        self.session
    }

    pub fn serial(&self) -> Serial {
        self.serial
    }

    /// Returns the three timing values if they are available.
    ///
    /// They are available from version 1 onwards.
    pub fn timing(&self) -> Option<Timing> {
        self.timing
    }

    pub fn encode(&self) -> Vec<u8> {
        let size = match self.timing {
            Some(_) => 24,
            None => 12,
        };
        let mut res = Header::new(
            self.version, Self::PDU, self.session, size
        ).encode().to_vec();
        res.extend_from_slice(&u32::from(self.serial).to_be_bytes());
        if let Some(timing) = self.timing {
            res.extend_from_slice(&timing.refresh.to_be_bytes());
            res.extend_from_slice(&timing.retry.to_be_bytes());
            res.extend_from_slice(&timing.expire.to_be_bytes());
        }
        res
    }

    fn parse(header: Header, body: &[u8]) -> Result<Self, Error> {
        let timing = match (header.version(), body.len()) {
            (0, 4) => None,
            (0, _) => {
                return Err(invalid_length(header, body))
            }
            (_, 16) => {
                Some(Timing {
                    refresh: u32_at(body, 4),
                    retry: u32_at(body, 8),
                    expire: u32_at(body, 12),
                })
            }
            _ => return Err(invalid_length(header, body))
        };
        Ok(EndOfData {
            version: header.version(),
            session: header.session(),
            serial: u32_at(body, 0).into(),
            timing,
        })
    }
}


//------------ CacheReset ----------------------------------------------------

/// Cache reset is a response to a serial query indicating unavailability.
///
/// If a cache can’t provide the difference to the serial number indicated
/// in a serial query, it responds with a cache reset and the client has to
/// fall back to a reset query.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CacheReset {
    version: u8,
}

impl CacheReset {
    /// The PDU type of a cache reset.
    pub const PDU: u8 = 8;

    const SIZE: u32 = 8;

    /// Creates a new cache reset.
    pub fn new(version: u8) -> Self {
        CacheReset { version }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn encode(&self) -> Vec<u8> {
        Header::new(self.version, Self::PDU, 0, Self::SIZE)
            .encode().to_vec()
    }

    fn parse(header: Header, body: &[u8]) -> Result<Self, Error> {
        if !body.is_empty() {
            return Err(invalid_length(header, body))
        }
        if header.session() != 0 {
            return Err(nonzero_reserved(header, body))
        }
        Ok(CacheReset { version: header.version() })
    }
}


//------------ RouterKey -----------------------------------------------------

/// A BGPsec router key.
///
/// Router keys only exist from protocol version 1 onwards.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RouterKey {
    version: u8,
    flags: u8,
    key_identifier: [u8; 20],
    asn: u32,
    key_info: Bytes,
}

impl RouterKey {
    /// The PDU type of a router key PDU.
    pub const PDU: u8 = 9;

    /// The size of the fixed portion including the header.
    const FIXED_SIZE: usize = 34;

    /// Creates a new router key PDU.
    pub fn new(
        version: u8,
        flags: u8,
        key_identifier: [u8; 20],
        asn: u32,
        key_info: Bytes,
    ) -> Self {
        RouterKey { version, flags, key_identifier, asn, key_info }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the flags field for the router key.
    ///
    /// The only flag currently used is the least significant bit which is
    /// 1 for an announcement and 0 for a withdrawal.
    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn key_identifier(&self) -> [u8; 20] {
        self.key_identifier
    }

    pub fn asn(&self) -> u32 {
        self.asn
    }

    pub fn key_info(&self) -> &Bytes {
        &self.key_info
    }

    pub fn encode(&self) -> Vec<u8> {
        let size = (Self::FIXED_SIZE + self.key_info.len()) as u32;
        let mut res = Header::new(
            self.version, Self::PDU, 0, size
        ).encode().to_vec();
        res.push(self.flags);
        res.push(0);
        res.extend_from_slice(&self.key_identifier);
        res.extend_from_slice(&self.asn.to_be_bytes());
        res.extend_from_slice(self.key_info.as_ref());
        res
    }

    fn parse(header: Header, body: &[u8]) -> Result<Self, Error> {
        if header.version() < 1 {
            return Err(Malformed::with_octets(
                ErrorCode::UNSUPPORTED_PDU_TYPE,
                "router key PDU in version 0",
                full_octets(header, body)
            ).into())
        }
        if body.len() < Self::FIXED_SIZE - Header::LEN {
            return Err(invalid_length(header, body))
        }
        if header.session() != 0 || body[1] != 0 {
            return Err(nonzero_reserved(header, body))
        }
        let mut key_identifier = [0u8; 20];
        key_identifier.copy_from_slice(&body[2..22]);
        Ok(RouterKey {
            version: header.version(),
            flags: body[0],
            key_identifier,
            asn: u32_at(body, 22),
            key_info: Bytes::copy_from_slice(&body[26..]),
        })
    }
}


//------------ Aspa ----------------------------------------------------------

/// An ASPA PDU, only available in protocol version 2.
///
/// An announcement replaces the whole provider list for the customer ASN
/// and must carry at least one provider; a withdrawal must carry none.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Aspa {
    version: u8,
    flags: u8,
    afi_flags: u8,
    customer: u32,
    providers: Vec<u32>,
}

impl Aspa {
    /// The PDU type of an ASPA PDU.
    pub const PDU: u8 = 11;

    /// The size of the fixed portion including the header.
    const FIXED_SIZE: usize = 16;

    /// Creates a new ASPA PDU.
    pub fn new(
        version: u8,
        flags: u8,
        afi_flags: u8,
        customer: u32,
        providers: Vec<u32>,
    ) -> Self {
        Aspa { version, flags, afi_flags, customer, providers }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the flags field of the PDU.
    ///
    /// The only flag currently used is the least significant bit which is
    /// 1 for an announcement and 0 for a withdrawal.
    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn afi_flags(&self) -> u8 {
        self.afi_flags
    }

    pub fn customer(&self) -> u32 {
        self.customer
    }

    pub fn providers(&self) -> &[u32] {
        &self.providers
    }

    pub fn encode(&self) -> Vec<u8> {
        let size = (Self::FIXED_SIZE + self.providers.len() * 4) as u32;
        let mut res = Header::new(
            self.version, Self::PDU, 0, size
        ).encode().to_vec();
        res.push(self.flags);
        res.push(self.afi_flags);
        res.extend_from_slice(&0u16.to_be_bytes());
        res.extend_from_slice(&self.customer.to_be_bytes());
        for provider in &self.providers {
            res.extend_from_slice(&provider.to_be_bytes());
        }
        res
    }

    fn parse(header: Header, body: &[u8]) -> Result<Self, Error> {
        if header.version() != 2 {
            return Err(Malformed::with_octets(
                ErrorCode::UNSUPPORTED_PDU_TYPE,
                "ASPA PDU outside version 2",
                full_octets(header, body)
            ).into())
        }
        let fixed = Self::FIXED_SIZE - Header::LEN;
        if body.len() < fixed || (body.len() - fixed) % 4 != 0 {
            return Err(invalid_length(header, body))
        }
        if header.session() != 0 || u16_at(body, 2) != 0 {
            return Err(nonzero_reserved(header, body))
        }
        let flags = body[0];
        let providers: Vec<u32> = body[fixed..].chunks(4).map(|chunk| {
            u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])
        }).collect();
        if flags & 1 == 1 && providers.is_empty() {
            return Err(Malformed::with_octets(
                ErrorCode::CORRUPT_DATA,
                "ASPA announcement without providers",
                full_octets(header, body)
            ).into())
        }
        if flags & 1 == 0 && !providers.is_empty() {
            return Err(Malformed::with_octets(
                ErrorCode::CORRUPT_DATA,
                "ASPA withdrawal with providers",
                full_octets(header, body)
            ).into())
        }
        Ok(Aspa {
            version: header.version(),
            flags,
            afi_flags: body[1],
            customer: u32_at(body, 4),
            providers,
        })
    }
}


//------------ ErrorReport ---------------------------------------------------

/// An error report signals that something went wrong.
///
/// Error reports carry an error code in the header’s session field and can
/// encapsulate both the erroneous PDU and some diagnostic text.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ErrorReport {
    version: u8,
    code: u16,
    pdu: Option<Vec<u8>>,
    text: Option<String>,
}

impl ErrorReport {
    /// The PDU type of an error report.
    pub const PDU: u8 = 10;

    /// Creates a new error report from its components.
    ///
    /// An empty `pdu` or `text` is treated as absent.
    pub fn new(
        version: u8,
        code: u16,
        pdu: impl Into<Vec<u8>>,
        text: impl Into<String>,
    ) -> Self {
        let pdu = pdu.into();
        let text = text.into();
        ErrorReport {
            version, code,
            pdu: if pdu.is_empty() { None } else { Some(pdu) },
            text: if text.is_empty() { None } else { Some(text) },
        }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the error code of the report.
    pub fn code(&self) -> u16 {
        self.code
    }

    /// Returns the encapsulated erroneous PDU if there is one.
    pub fn pdu(&self) -> Option<&[u8]> {
        self.pdu.as_deref()
    }

    /// Returns the diagnostic text if there is one.
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    pub fn encode(&self) -> Vec<u8> {
        let pdu_len = self.pdu.as_ref().map_or(0, Vec::len);
        let text_len = self.text.as_ref().map_or(0, String::len);
        let size = (Header::LEN + 8 + pdu_len + text_len) as u32;
        let mut res = Header::new(
            self.version, Self::PDU, self.code, size
        ).encode().to_vec();
        res.extend_from_slice(&(pdu_len as u32).to_be_bytes());
        if let Some(pdu) = self.pdu.as_ref() {
            res.extend_from_slice(pdu);
        }
        res.extend_from_slice(&(text_len as u32).to_be_bytes());
        if let Some(text) = self.text.as_ref() {
            res.extend_from_slice(text.as_bytes());
        }
        res
    }

    fn parse(header: Header, body: &[u8]) -> Result<Self, Error> {
        if body.len() < 8 {
            return Err(invalid_length(header, body))
        }
        let pdu_len = u32_at(body, 0) as usize;
        let Some(text_start) = 4usize.checked_add(pdu_len)
            .filter(|start| start + 4 <= body.len())
        else {
            return Err(invalid_length(header, body))
        };
        let pdu = &body[4..text_start];
        let text_len = u32_at(body, text_start) as usize;
        if text_start + 4 + text_len != body.len() {
            return Err(invalid_length(header, body))
        }
        let text = match std::str::from_utf8(&body[text_start + 4..]) {
            Ok(text) => text,
            Err(_) => {
                return Err(Malformed::with_octets(
                    ErrorCode::CORRUPT_DATA,
                    "error text is not UTF-8",
                    full_octets(header, body)
                ).into())
            }
        };
        Ok(ErrorReport::new(
            header.version(), header.session(), pdu, text
        ))
    }
}


//------------ Pdu -----------------------------------------------------------

/// Any of the eleven PDU types known to the protocol.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Pdu {
    SerialNotify(SerialNotify),
    SerialQuery(SerialQuery),
    ResetQuery(ResetQuery),
    CacheResponse(CacheResponse),
    Ipv4Prefix(Ipv4Prefix),
    Ipv6Prefix(Ipv6Prefix),
    EndOfData(EndOfData),
    CacheReset(CacheReset),
    RouterKey(RouterKey),
    Aspa(Aspa),
    ErrorReport(ErrorReport),
}

impl Pdu {
    /// Creates the payload PDU for the given payload.
    ///
    /// For ASPA units, a withdrawal drops the provider list since the wire
    /// format requires withdrawals to be empty.
    pub fn payload(version: u8, action: Action, payload: &Payload) -> Self {
        let flags = action.into_flags();
        match *payload {
            Payload::Origin(ref origin) => {
                match origin.addr {
                    IpAddr::V4(addr) => {
                        Pdu::Ipv4Prefix(Ipv4Prefix::new(
                            version, flags,
                            origin.prefix_len, origin.max_len,
                            addr, origin.asn
                        ))
                    }
                    IpAddr::V6(addr) => {
                        Pdu::Ipv6Prefix(Ipv6Prefix::new(
                            version, flags,
                            origin.prefix_len, origin.max_len,
                            addr, origin.asn
                        ))
                    }
                }
            }
            Payload::RouterKey(ref key) => {
                Pdu::RouterKey(RouterKey::new(
                    version, flags,
                    key.key_identifier, key.asn, key.key_info.clone()
                ))
            }
            Payload::Aspa(ref aspa) => {
                Pdu::Aspa(Aspa::new(
                    version, flags, 0, aspa.customer,
                    if action.is_withdraw() { Vec::new() }
                    else { aspa.providers.clone() }
                ))
            }
        }
    }

    /// Returns the RTR version of the PDU.
    pub fn version(&self) -> u8 {
        match *self {
            Pdu::SerialNotify(ref pdu) => pdu.version(),
            Pdu::SerialQuery(ref pdu) => pdu.version(),
            Pdu::ResetQuery(ref pdu) => pdu.version(),
            Pdu::CacheResponse(ref pdu) => pdu.version(),
            Pdu::Ipv4Prefix(ref pdu) => pdu.version(),
            Pdu::Ipv6Prefix(ref pdu) => pdu.version(),
            Pdu::EndOfData(ref pdu) => pdu.version(),
            Pdu::CacheReset(ref pdu) => pdu.version(),
            Pdu::RouterKey(ref pdu) => pdu.version(),
            Pdu::Aspa(ref pdu) => pdu.version(),
            Pdu::ErrorReport(ref pdu) => pdu.version(),
        }
    }

    /// Returns whether this is one of the four payload-bearing PDU types.
    pub fn is_payload(&self) -> bool {
        matches!(
            *self,
            Pdu::Ipv4Prefix(_) | Pdu::Ipv6Prefix(_)
            | Pdu::RouterKey(_) | Pdu::Aspa(_)
        )
    }

    /// Converts a payload PDU into action and payload.
    ///
    /// Returns `None` for PDU types that don’t carry payload.
    pub fn to_payload(&self) -> Option<(Action, Payload)> {
        match *self {
            Pdu::Ipv4Prefix(ref pdu) => {
                Some((
                    Action::from_flags(pdu.flags()),
                    Payload::origin(
                        pdu.prefix().into(), pdu.prefix_len(),
                        pdu.max_len(), pdu.asn()
                    )
                ))
            }
            Pdu::Ipv6Prefix(ref pdu) => {
                Some((
                    Action::from_flags(pdu.flags()),
                    Payload::origin(
                        pdu.prefix().into(), pdu.prefix_len(),
                        pdu.max_len(), pdu.asn()
                    )
                ))
            }
            Pdu::RouterKey(ref pdu) => {
                Some((
                    Action::from_flags(pdu.flags()),
                    Payload::router_key(
                        pdu.key_identifier(), pdu.asn(),
                        pdu.key_info().clone()
                    )
                ))
            }
            Pdu::Aspa(ref pdu) => {
                Some((
                    Action::from_flags(pdu.flags()),
                    Payload::aspa(pdu.customer(), pdu.providers().to_vec())
                ))
            }
            _ => None
        }
    }

    /// Returns the wire representation of the PDU.
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            Pdu::SerialNotify(ref pdu) => pdu.encode(),
            Pdu::SerialQuery(ref pdu) => pdu.encode(),
            Pdu::ResetQuery(ref pdu) => pdu.encode(),
            Pdu::CacheResponse(ref pdu) => pdu.encode(),
            Pdu::Ipv4Prefix(ref pdu) => pdu.encode(),
            Pdu::Ipv6Prefix(ref pdu) => pdu.encode(),
            Pdu::EndOfData(ref pdu) => pdu.encode(),
            Pdu::CacheReset(ref pdu) => pdu.encode(),
            Pdu::RouterKey(ref pdu) => pdu.encode(),
            Pdu::Aspa(ref pdu) => pdu.encode(),
            Pdu::ErrorReport(ref pdu) => pdu.encode(),
        }
    }

    /// Decodes a PDU from its complete wire representation.
    pub fn decode(slice: &[u8]) -> Result<Self, Error> {
        if slice.len() < Header::LEN {
            return Err(Malformed::with_octets(
                ErrorCode::CORRUPT_DATA,
                "short PDU",
                slice.to_vec()
            ).into())
        }
        let mut buf = [0u8; Header::LEN];
        buf.copy_from_slice(&slice[..Header::LEN]);
        let header = Header::parse(&buf)?;
        if header.length() as usize != slice.len() {
            return Err(Malformed::with_octets(
                ErrorCode::CORRUPT_DATA,
                "PDU length mismatch",
                slice.to_vec()
            ).into())
        }
        Self::parse_body(header, &slice[Header::LEN..])
    }

    /// Parses the body of a PDU whose header was already read.
    fn parse_body(header: Header, body: &[u8]) -> Result<Self, Error> {
        match header.pdu() {
            SerialNotify::PDU => {
                SerialNotify::parse(header, body).map(Pdu::SerialNotify)
            }
            SerialQuery::PDU => {
                SerialQuery::parse(header, body).map(Pdu::SerialQuery)
            }
            ResetQuery::PDU => {
                ResetQuery::parse(header, body).map(Pdu::ResetQuery)
            }
            CacheResponse::PDU => {
                CacheResponse::parse(header, body).map(Pdu::CacheResponse)
            }
            Ipv4Prefix::PDU => {
                Ipv4Prefix::parse(header, body).map(Pdu::Ipv4Prefix)
            }
            Ipv6Prefix::PDU => {
                Ipv6Prefix::parse(header, body).map(Pdu::Ipv6Prefix)
            }
            EndOfData::PDU => {
                EndOfData::parse(header, body).map(Pdu::EndOfData)
            }
            CacheReset::PDU => {
                CacheReset::parse(header, body).map(Pdu::CacheReset)
            }
            RouterKey::PDU => {
                RouterKey::parse(header, body).map(Pdu::RouterKey)
            }
            Aspa::PDU => {
                Aspa::parse(header, body).map(Pdu::Aspa)
            }
            ErrorReport::PDU => {
                ErrorReport::parse(header, body).map(Pdu::ErrorReport)
            }
            _ => {
                Err(Malformed::with_octets(
                    ErrorCode::UNSUPPORTED_PDU_TYPE,
                    "unsupported PDU type",
                    full_octets(header, body)
                ).into())
            }
        }
    }

    /// Reads a PDU from a reader.
    ///
    /// A connection closed before the header is complete is an I/O error;
    /// a body cut short against the header’s promise is a codec error.
    pub async fn read<Sock: AsyncRead + Unpin>(
        sock: &mut Sock
    ) -> Result<Self, Error> {
        let header = Header::read(sock).await?;
        let mut body = vec![0u8; header.length() as usize - Header::LEN];
        if let Err(err) = sock.read_exact(&mut body).await {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                return Err(Malformed::with_octets(
                    ErrorCode::CORRUPT_DATA,
                    "truncated PDU",
                    header.encode().to_vec()
                ).into())
            }
            return Err(err.into())
        }
        Self::parse_body(header, &body)
    }

    /// Writes the PDU to a writer.
    pub async fn write<Sock: AsyncWrite + Unpin>(
        &self, sock: &mut Sock
    ) -> Result<(), Error> {
        sock.write_all(&self.encode()).await?;
        Ok(())
    }
}


//------------ Helpers -------------------------------------------------------

fn u16_at(body: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([body[at], body[at + 1]])
}

fn u32_at(body: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([body[at], body[at + 1], body[at + 2], body[at + 3]])
}

fn full_octets(header: Header, body: &[u8]) -> Vec<u8> {
    let mut res = header.encode().to_vec();
    res.extend_from_slice(body);
    res
}

fn invalid_length(header: Header, body: &[u8]) -> Error {
    Malformed::with_octets(
        ErrorCode::CORRUPT_DATA,
        "invalid PDU length",
        full_octets(header, body)
    ).into()
}

fn nonzero_reserved(header: Header, body: &[u8]) -> Error {
    Malformed::with_octets(
        ErrorCode::CORRUPT_DATA,
        "reserved field not zero",
        full_octets(header, body)
    ).into()
}


//============ Testing =======================================================
