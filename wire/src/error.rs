use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum Error {
    #[error("raw is too small for a packet header")]
    ErrPacketHeaderTooSmall,
    #[error("unknown payload type")]
    ErrPayloadTypeUnknown,
    #[error("number-0 header carries a non-zero packet sequence number")]
    ErrNum0SequenceNonZero,
    #[error("extra data length exceeds the encoded extra_data_size")]
    ErrExtraDataTruncated,
    #[error("extra data is larger than the wire field can carry")]
    ErrExtraDataTooLarge,

    #[error("probe packet has an invalid size")]
    ErrProbePacketSize,
    #[error("probe packet checksum mismatch")]
    ErrProbePacketCrc,
    #[error("probe packet carries an unknown command")]
    ErrProbeCommandInvalid,
    #[error("sender identity field is longer than its fixed wire width")]
    ErrProbeFieldTooLong,
}
