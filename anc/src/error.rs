use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum Error {
    #[error("raw is too small for an ancillary data payload header")]
    ErrPayloadHeaderTooSmall,
    #[error("raw ends before the announced ancillary packet count")]
    ErrPayloadTruncated,
    #[error("ancillary packet carries more than 255 user data words")]
    ErrUserDataTooLong,
    #[error("line number does not fit in 11 bits")]
    ErrLineNumberRange,
    #[error("horizontal offset does not fit in 12 bits")]
    ErrHorizontalOffsetRange,
    #[error("source stream number does not fit in 7 bits")]
    ErrStreamNumberRange,
}
