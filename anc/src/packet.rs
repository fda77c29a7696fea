#[cfg(test)]
mod packet_test;

use std::fmt;

use bytes::{Buf, Bytes, BytesMut};

use crate::bits::{BitReader, BitWriter};
use crate::error::{Error, Result};

/// Bits of an ancillary packet ahead of the first user data word: c, line
/// number, horizontal offset, s, stream number, DID, SDID and data count.
pub const PACKET_HEADER_BITS: usize = 62;
/// Encoded size of the payload-level header.
pub const PAYLOAD_HEADER_SIZE: usize = 4;

pub const MAX_LINE_NUMBER: u16 = (1 << 11) - 1;
pub const MAX_HORIZONTAL_OFFSET: u16 = (1 << 12) - 1;
pub const MAX_SOURCE_STREAM_NUMBER: u8 = (1 << 7) - 1;
pub const MAX_USER_DATA_WORDS: usize = 255;

/// Interlace field the payload's packets belong to.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldKind {
    #[default]
    Unspecified = 0,
    Field1 = 1,
    Field2 = 2,
    Progressive = 3,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            FieldKind::Unspecified => "Unspecified",
            FieldKind::Field1 => "Field1",
            FieldKind::Field2 => "Field2",
            FieldKind::Progressive => "Progressive",
        };
        write!(f, "{s}")
    }
}

impl From<u8> for FieldKind {
    fn from(v: u8) -> FieldKind {
        match v {
            1 => FieldKind::Field1,
            2 => FieldKind::Field2,
            3 => FieldKind::Progressive,
            _ => FieldKind::Unspecified,
        }
    }
}

/// One SMPTE ST 291 ancillary data packet.
///
/// `user_data` words are 10-bit values; whether they carry parity in bits
/// 8 and 9 is up to the DID/SDID-specific payload, so the codec passes
/// them through untouched.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct AncPacket {
    pub c_not_y_channel: bool,
    pub line_number: u16,
    pub horizontal_offset: u16,
    pub source_stream_valid: bool,
    pub source_stream_number: u8,
    pub did: u8,
    pub sdid: u8,
    pub user_data: Vec<u16>,
}

impl fmt::Display for AncPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DID {:#04x} SDID {:#04x} line {} words {}",
            self.did,
            self.sdid,
            self.line_number,
            self.user_data.len()
        )
    }
}

/// A full ancillary payload: the 32-bit payload header plus its packets.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct AncPayload {
    pub field_kind: FieldKind,
    pub packets: Vec<AncPacket>,
}

/// Soft-error counters accumulated while parsing.
///
/// Parity and checksum damage never aborts the parse; the counters feed
/// the receive statistics instead.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct AncParseStatus {
    pub parity_err_count: u32,
    pub checksum_err_count: u32,
}

/// Adds the two ST 291 parity bits: b8 = parity of the byte, b9 = !b8.
pub fn with_parity(v: u8) -> u16 {
    let p = u16::from((v.count_ones() & 1) as u8);
    ((p ^ 1) << 9) | (p << 8) | u16::from(v)
}

/// Splits a 10-bit word into its byte and whether both parity bits held.
pub fn strip_parity(w: u16) -> (u8, bool) {
    let v = (w & 0xFF) as u8;
    (v, w & 0x3FF == with_parity(v))
}

/// Finishes the 9-bit running checksum into the on-wire 10-bit word: bit 9
/// is the inverse of bit 8.
fn finish_checksum(sum9: u16) -> u16 {
    let sum9 = sum9 & 0x1FF;
    sum9 | ((!sum9 & 0x100) << 1)
}

/// Words of 32 bits one encoded ancillary packet occupies, checksum
/// included.
pub fn packed_words(data_count: usize) -> usize {
    (PACKET_HEADER_BITS + 10 * (data_count + 1) + 31) / 32
}

impl AncPacket {
    fn check(&self) -> Result<()> {
        if self.user_data.len() > MAX_USER_DATA_WORDS {
            return Err(Error::ErrUserDataTooLong);
        }
        if self.line_number > MAX_LINE_NUMBER {
            return Err(Error::ErrLineNumberRange);
        }
        if self.horizontal_offset > MAX_HORIZONTAL_OFFSET {
            return Err(Error::ErrHorizontalOffsetRange);
        }
        if self.source_stream_number > MAX_SOURCE_STREAM_NUMBER {
            return Err(Error::ErrStreamNumberRange);
        }
        Ok(())
    }

    fn marshal_to(&self, writer: &mut BitWriter) -> Result<()> {
        self.check()?;

        writer.put_bits(u32::from(self.c_not_y_channel), 1);
        writer.put_bits(u32::from(self.line_number), 11);
        writer.put_bits(u32::from(self.horizontal_offset), 12);
        writer.put_bits(u32::from(self.source_stream_valid), 1);
        writer.put_bits(u32::from(self.source_stream_number), 7);

        let did10 = with_parity(self.did);
        let sdid10 = with_parity(self.sdid);
        let count10 = with_parity(self.user_data.len() as u8);
        writer.put_bits(u32::from(did10), 10);
        writer.put_bits(u32::from(sdid10), 10);
        writer.put_bits(u32::from(count10), 10);

        let mut sum9 = did10.wrapping_add(sdid10).wrapping_add(count10);
        for &udw in &self.user_data {
            let udw = udw & 0x3FF;
            sum9 = sum9.wrapping_add(udw);
            writer.put_bits(u32::from(udw), 10);
        }
        writer.put_bits(u32::from(finish_checksum(sum9)), 10);
        writer.align_word();
        Ok(())
    }

    fn unmarshal(reader: &mut BitReader<'_>, status: &mut AncParseStatus) -> Result<Self> {
        let mut bits = |width: usize| -> Result<u32> {
            reader.get_bits(width).ok_or(Error::ErrPayloadTruncated)
        };

        let c_not_y_channel = bits(1)? != 0;
        let line_number = bits(11)? as u16;
        let horizontal_offset = bits(12)? as u16;
        let source_stream_valid = bits(1)? != 0;
        let source_stream_number = bits(7)? as u8;

        let did10 = bits(10)? as u16;
        let sdid10 = bits(10)? as u16;
        let count10 = bits(10)? as u16;
        for word in [did10, sdid10, count10] {
            let (_, parity_ok) = strip_parity(word);
            if !parity_ok {
                status.parity_err_count += 1;
            }
        }
        let (did, _) = strip_parity(did10);
        let (sdid, _) = strip_parity(sdid10);
        let (data_count, _) = strip_parity(count10);

        let mut sum9 = did10.wrapping_add(sdid10).wrapping_add(count10);
        let mut user_data = Vec::with_capacity(data_count as usize);
        for _ in 0..data_count {
            let udw = reader.get_bits(10).ok_or(Error::ErrPayloadTruncated)? as u16;
            sum9 = sum9.wrapping_add(udw);
            user_data.push(udw);
        }

        let wire_checksum = reader.get_bits(10).ok_or(Error::ErrPayloadTruncated)? as u16;
        if wire_checksum != finish_checksum(sum9) {
            status.checksum_err_count += 1;
        }
        reader.align_word();

        Ok(AncPacket {
            c_not_y_channel,
            line_number,
            horizontal_offset,
            source_stream_valid,
            source_stream_number,
            did,
            sdid,
            user_data,
        })
    }
}

impl AncPayload {
    pub fn marshal_size(&self) -> usize {
        PAYLOAD_HEADER_SIZE
            + self
                .packets
                .iter()
                .map(|p| packed_words(p.user_data.len()) * 4)
                .sum::<usize>()
    }

    pub fn marshal(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.marshal_size());

        let header = (u32::from(self.packets.len() as u16) << 16)
            | (u32::from(self.field_kind as u8) << 14);
        buf.extend_from_slice(&header.to_be_bytes());

        for packet in &self.packets {
            let mut writer = BitWriter::new();
            packet.marshal_to(&mut writer)?;
            writer.write_to(&mut buf);
        }
        Ok(buf.freeze())
    }

    pub fn unmarshal(raw: &Bytes) -> Result<(Self, AncParseStatus)> {
        if raw.len() < PAYLOAD_HEADER_SIZE {
            return Err(Error::ErrPayloadHeaderTooSmall);
        }

        let mut header_reader = raw.clone();
        let header = header_reader.get_u32();
        let anc_count = (header >> 16) as u16;
        let field_kind = FieldKind::from(((header >> 14) & 0x3) as u8);

        let mut status = AncParseStatus::default();
        let body = &raw[PAYLOAD_HEADER_SIZE..];
        let mut reader = BitReader::new(body);
        let mut packets = Vec::with_capacity(anc_count as usize);
        for _ in 0..anc_count {
            packets.push(AncPacket::unmarshal(&mut reader, &mut status)?);
        }

        Ok((
            AncPayload {
                field_kind,
                packets,
            },
            status,
        ))
    }
}
