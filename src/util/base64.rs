//! Handling of Base 64-encoded data.
//!
//! This module wraps the flavor of Base 64 used by the JSON files the
//! crate reads and writes into a little struct so call sites don’t have to
//! remember which alphabet and padding rules apply.

use base64::engine::Engine;
use base64::engine::general_purpose::{GeneralPurpose, STANDARD};

pub use base64::DecodeError;


//------------ Json ----------------------------------------------------------

/// The flavor used within the crate’s JSON files.
///
/// This is the standard alphabet with padding.
pub struct Json;

impl Json {
    const ENGINE: GeneralPurpose = STANDARD;

    pub fn encode(self, data: &[u8]) -> String {
        Self::ENGINE.encode(data)
    }

    pub fn decode(self, input: &str) -> Result<Vec<u8>, DecodeError> {
        Self::ENGINE.decode(input)
    }
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip() {
        assert_eq!(Json.encode(b"foobar"), "Zm9vYmFy");
        assert_eq!(Json.decode("Zm9vYmFy").unwrap(), b"foobar");
        assert!(Json.decode("not base64!").is_err());
    }
}
