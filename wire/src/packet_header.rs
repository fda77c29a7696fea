#[cfg(test)]
mod packet_header_test;

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Every payload packet starts with the 4-byte common prefix.
pub const COMMON_HEADER_SIZE: usize = 4;
/// Common prefix plus the 32-bit payload data offset.
pub const DATA_OFFSET_HEADER_SIZE: usize = 8;
/// Fixed part of the number-0 header; `extra_data` follows immediately after.
pub const NUM0_FIXED_HEADER_SIZE: usize = 34;

/// PayloadType discriminates the header variant carried by a packet.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadType {
    #[default]
    Data = 0,
    DataOffset = 1,
    Probe = 2,
    KeepAlive = 3,
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            PayloadType::Data => "Data",
            PayloadType::DataOffset => "DataOffset",
            PayloadType::Probe => "Probe",
            PayloadType::KeepAlive => "KeepAlive",
        };
        write!(f, "{s}")
    }
}

impl TryFrom<u8> for PayloadType {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(PayloadType::Data),
            1 => Ok(PayloadType::DataOffset),
            2 => Ok(PayloadType::Probe),
            3 => Ok(PayloadType::KeepAlive),
            _ => Err(Error::ErrPayloadTypeUnknown),
        }
    }
}

/// Origination wall-clock timestamp carried in the number-0 header.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct PtpTimestamp {
    pub seconds: u32,
    pub nanoseconds: u32,
}

/// The 4-byte prefix shared by every payload packet header variant.
///
/// The receiver reassembles on the tuple `(payload_num, packet_sequence_num)`
/// and uses it to detect duplicates and gaps.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct CommonHeader {
    pub payload_type: PayloadType,
    pub packet_sequence_num: u16,
    pub payload_num: u8,
}

impl CommonHeader {
    fn marshal_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.payload_type as u8);
        buf.put_u16(self.packet_sequence_num);
        buf.put_u8(self.payload_num);
    }

    fn unmarshal<B: Buf>(reader: &mut B) -> Result<Self> {
        let payload_type = PayloadType::try_from(reader.get_u8())?;
        let packet_sequence_num = reader.get_u16();
        let payload_num = reader.get_u8();
        Ok(CommonHeader {
            payload_type,
            packet_sequence_num,
            payload_num,
        })
    }
}

/// On-wire payload packet header.
///
/// Packet 0 of every payload is the `Num0` variant regardless of payload
/// size. Any later packet is `Data` while the payload bytes are still being
/// consumed in order, and `DataOffset` once segmentation forced the receiver
/// to place fragments by explicit offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketHeader {
    Data(CommonHeader),
    DataOffset {
        common: CommonHeader,
        payload_data_offset: u32,
    },
    Num0 {
        common: CommonHeader,
        total_payload_size: u32,
        max_latency_microsecs: u64,
        origination_ptp_timestamp: PtpTimestamp,
        payload_user_data: u64,
        extra_data: Bytes,
    },
}

impl fmt::Display for PacketHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let common = self.common();
        write!(
            f,
            "{} payload={} seq={}",
            common.payload_type, common.payload_num, common.packet_sequence_num
        )
    }
}

impl PacketHeader {
    pub fn common(&self) -> &CommonHeader {
        match self {
            PacketHeader::Data(common) => common,
            PacketHeader::DataOffset { common, .. } => common,
            PacketHeader::Num0 { common, .. } => common,
        }
    }

    pub fn marshal_size(&self) -> usize {
        match self {
            PacketHeader::Data(_) => COMMON_HEADER_SIZE,
            PacketHeader::DataOffset { .. } => DATA_OFFSET_HEADER_SIZE,
            PacketHeader::Num0 { extra_data, .. } => NUM0_FIXED_HEADER_SIZE + extra_data.len(),
        }
    }

    pub fn marshal_to(&self, buf: &mut BytesMut) -> Result<usize> {
        match self {
            PacketHeader::Data(common) => {
                common.marshal_to(buf);
            }
            PacketHeader::DataOffset {
                common,
                payload_data_offset,
            } => {
                common.marshal_to(buf);
                buf.put_u32(*payload_data_offset);
            }
            PacketHeader::Num0 {
                common,
                total_payload_size,
                max_latency_microsecs,
                origination_ptp_timestamp,
                payload_user_data,
                extra_data,
            } => {
                if common.packet_sequence_num != 0 {
                    return Err(Error::ErrNum0SequenceNonZero);
                }
                if extra_data.len() > u16::MAX as usize {
                    return Err(Error::ErrExtraDataTooLarge);
                }
                common.marshal_to(buf);
                buf.put_u32(*total_payload_size);
                buf.put_u64(*max_latency_microsecs);
                buf.put_u32(origination_ptp_timestamp.seconds);
                buf.put_u32(origination_ptp_timestamp.nanoseconds);
                buf.put_u64(*payload_user_data);
                buf.put_u16(extra_data.len() as u16);
                buf.put_slice(extra_data);
            }
        }
        Ok(self.marshal_size())
    }

    pub fn marshal(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.marshal_size());
        self.marshal_to(&mut buf)?;
        Ok(buf.freeze())
    }

    pub fn unmarshal(raw: &Bytes) -> Result<Self> {
        if raw.len() < COMMON_HEADER_SIZE {
            return Err(Error::ErrPacketHeaderTooSmall);
        }

        let reader = &mut raw.clone();
        let common = CommonHeader::unmarshal(reader)?;

        match common.payload_type {
            PayloadType::DataOffset => {
                if raw.len() < DATA_OFFSET_HEADER_SIZE {
                    return Err(Error::ErrPacketHeaderTooSmall);
                }
                let payload_data_offset = reader.get_u32();
                Ok(PacketHeader::DataOffset {
                    common,
                    payload_data_offset,
                })
            }
            PayloadType::Data | PayloadType::KeepAlive if common.packet_sequence_num == 0 => {
                if raw.len() < NUM0_FIXED_HEADER_SIZE {
                    return Err(Error::ErrPacketHeaderTooSmall);
                }
                let total_payload_size = reader.get_u32();
                let max_latency_microsecs = reader.get_u64();
                let origination_ptp_timestamp = PtpTimestamp {
                    seconds: reader.get_u32(),
                    nanoseconds: reader.get_u32(),
                };
                let payload_user_data = reader.get_u64();
                let extra_data_size = reader.get_u16() as usize;
                if reader.remaining() < extra_data_size {
                    return Err(Error::ErrExtraDataTruncated);
                }
                let extra_data = reader.copy_to_bytes(extra_data_size);
                Ok(PacketHeader::Num0 {
                    common,
                    total_payload_size,
                    max_latency_microsecs,
                    origination_ptp_timestamp,
                    payload_user_data,
                    extra_data,
                })
            }
            _ => Ok(PacketHeader::Data(common)),
        }
    }
}
