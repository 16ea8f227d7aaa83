//! Synchronising validated RPKI payloads from RTR caches.
//!
//! RPKI, the Resource Public Key Infrastructure, is a distributed database
//! of signed statements by entities that participate in Internet routing.
//! A typical setup collects and validates all statements into a _cache_
//! and distributes the validated and normalized payloads to routers via
//! the RPKI to Router Protocol, RTR for short.
//!
//! This crate implements the router side of RTR: it talks to one or more
//! caches, keeps the data received from each of them across invocations,
//! and can merge everything into one view for downstream consumption. A
//! reference implementation of the cache side is included since it shares
//! the codec and the session rules and makes the client testable against a
//! real peer.
//!
//! Both ends are built atop [Tokio] and are generic over the concrete
//! socket type, so they can be used with different transports. The crate
//! implements versions 0, 1, and 2 of the protocol, the last of which
//! adds ASPA units.
//!
//! You can read more about RPKI in [RFC 6480]. RTR is specified in
//! [RFC 6810] and [RFC 8210].
//!
//! [Tokio]: https://crates.io/crates/tokio
//! [RFC 6480]: https://tools.ietf.org/html/rfc6480
//! [RFC 6810]: https://tools.ietf.org/html/rfc6810
//! [RFC 8210]: https://tools.ietf.org/html/rfc8210

pub use self::client::Session;
pub use self::error::Error;
pub use self::payload::{Action, Payload, Timing};
pub use self::pool::{Outcome, Pool};
pub use self::record::ClientRecord;
pub use self::server::{Maintainer, NotifySender, Server};
pub use self::state::{Cache, Serial};

pub mod changeset;
pub mod client;
pub mod clock;
pub mod error;
pub mod payload;
pub mod pdu;
pub mod pool;
pub mod record;
pub mod server;
pub mod state;

mod util;
