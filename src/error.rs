use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum Error {
    #[error("endpoint is not connected")]
    ErrNotConnected,
    #[error("payload queue is full")]
    ErrQueueFull,
    #[error("resource pool allocation failed")]
    ErrAllocationFailed,
    #[error("not enough memory to satisfy the request")]
    ErrNotEnoughMemory,
    #[error("handle does not name a live object")]
    ErrInvalidHandle,
    #[error("invalid parameter")]
    ErrInvalidParameter,
    #[error("payload failed to send")]
    ErrSendFailed,
    #[error("array bound exceeded")]
    ErrArraySizeExceeded,
    #[error("scatter-gather list entry sizes do not sum to total_data_size")]
    ErrSglSizeMismatch,
    #[error("endpoint already exists for this remote and stream")]
    ErrAdapterDuplicateEntry,
    #[error("adapter kind is not available in this build")]
    ErrAdapterUnsupported,
    #[error("connection already holds the maximum number of endpoints")]
    ErrEndpointLimit,
    #[error("objects are still alive; destroy them first")]
    ErrShutdownWhileBusy,
    #[error("unrecoverable adapter failure")]
    ErrFatal,

    #[error("{0}")]
    ErrWire(#[from] wire::Error),

    /// Socket-level failure. The io error text is carried because
    /// `std::io::Error` itself is neither `Clone` nor `PartialEq`.
    #[error("io error: {0}")]
    ErrIo(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::ErrIo(e.to_string())
    }
}

/// Public status vocabulary surfaced at the API boundary and in payload
/// completion callbacks.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    Ok,
    Fatal,
    NotEnoughMemory,
    AllocationFailed,
    InvalidHandle,
    InvalidParameter,
    NotConnected,
    QueueFull,
    SendFailed,
    ArraySizeExceeded,
    ProbePacketCrcError,
    ProbePacketInvalidSize,
    AdapterDuplicateEntry,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Status::Ok => "Ok",
            Status::Fatal => "Fatal",
            Status::NotEnoughMemory => "NotEnoughMemory",
            Status::AllocationFailed => "AllocationFailed",
            Status::InvalidHandle => "InvalidHandle",
            Status::InvalidParameter => "InvalidParameter",
            Status::NotConnected => "NotConnected",
            Status::QueueFull => "QueueFull",
            Status::SendFailed => "SendFailed",
            Status::ArraySizeExceeded => "ArraySizeExceeded",
            Status::ProbePacketCrcError => "ProbePacketCrcError",
            Status::ProbePacketInvalidSize => "ProbePacketInvalidSize",
            Status::AdapterDuplicateEntry => "AdapterDuplicateEntry",
        };
        write!(f, "{s}")
    }
}

impl From<&Error> for Status {
    fn from(e: &Error) -> Status {
        match e {
            Error::ErrNotConnected => Status::NotConnected,
            Error::ErrQueueFull => Status::QueueFull,
            Error::ErrAllocationFailed | Error::ErrSglSizeMismatch => Status::AllocationFailed,
            Error::ErrNotEnoughMemory => Status::NotEnoughMemory,
            Error::ErrInvalidHandle => Status::InvalidHandle,
            Error::ErrInvalidParameter => Status::InvalidParameter,
            Error::ErrSendFailed => Status::SendFailed,
            Error::ErrArraySizeExceeded | Error::ErrEndpointLimit => Status::ArraySizeExceeded,
            Error::ErrAdapterDuplicateEntry => Status::AdapterDuplicateEntry,
            Error::ErrWire(wire::Error::ErrProbePacketCrc) => Status::ProbePacketCrcError,
            Error::ErrWire(wire::Error::ErrProbePacketSize) => Status::ProbePacketInvalidSize,
            _ => Status::Fatal,
        }
    }
}

impl From<Error> for Status {
    fn from(e: Error) -> Status {
        Status::from(&e)
    }
}
