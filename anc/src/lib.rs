#![warn(rust_2018_idioms)]
#![allow(dead_code)]

//! Bit-exact SMPTE ST 291 ancillary-data codec.
//!
//! Ancillary packets travel as 10-bit words packed into big-endian 32-bit
//! groups. DID, SDID and the data count carry the two ST 291 parity bits;
//! every packet ends with the 9-bit running checksum word. Parity and
//! checksum damage is counted, not fatal, so one bad packet cannot take
//! down a whole field's worth of captions.

mod bits;
mod error;
pub mod packet;

pub use error::{Error, Result};
pub use packet::{
    packed_words, strip_parity, with_parity, AncPacket, AncParseStatus, AncPayload, FieldKind,
    MAX_USER_DATA_WORDS, PAYLOAD_HEADER_SIZE,
};
