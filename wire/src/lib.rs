#![warn(rust_2018_idioms)]
#![allow(dead_code)]

//! Byte-packed wire formats shared by medialink senders and receivers.
//!
//! Nothing here relies on native struct layout; every header is walked
//! field by field in network byte order so peers built by different
//! compilers stay compatible.

mod error;
pub mod packet_header;
pub mod probe;
pub mod version;

pub use error::{Error, Result};
pub use packet_header::{
    CommonHeader, PacketHeader, PayloadType, PtpTimestamp, COMMON_HEADER_SIZE,
    DATA_OFFSET_HEADER_SIZE, NUM0_FIXED_HEADER_SIZE,
};
pub use probe::{ProbeCommand, ProbeHeader, ProbeTail};
pub use version::{ProtocolVersion, PROTOCOL_VERSION};
