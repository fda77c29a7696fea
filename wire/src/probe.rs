
use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::version::ProtocolVersion;

pub const SENDER_IP_SIZE: usize = 64;
pub const SENDER_GID_SIZE: usize = 32;
pub const SENDER_STREAM_NAME_SIZE: usize = 138;

/// Byte offset of the checksum field within an encoded probe packet.
pub const PROBE_CHECKSUM_OFFSET: usize = 249;
/// Encoded size of a probe packet carrying a command tail.
pub const PROBE_COMMAND_PACKET_SIZE: usize = 252;
/// Encoded size of a probe packet carrying an ack tail.
pub const PROBE_ACK_PACKET_SIZE: usize = 254;

/// Control-channel command set.
///
/// Every command except `Ack` may request an ack; the peer answers with an
/// `Ack` naming the command and control packet number it acknowledges.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ProbeCommand {
    Reset = 0,
    Ping = 1,
    Connected = 2,
    Ack = 3,
    ProtocolVersion = 4,
}

impl fmt::Display for ProbeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            ProbeCommand::Reset => "Reset",
            ProbeCommand::Ping => "Ping",
            ProbeCommand::Connected => "Connected",
            ProbeCommand::Ack => "Ack",
            ProbeCommand::ProtocolVersion => "ProtocolVersion",
        };
        write!(f, "{s}")
    }
}

impl TryFrom<u8> for ProbeCommand {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(ProbeCommand::Reset),
            1 => Ok(ProbeCommand::Ping),
            2 => Ok(ProbeCommand::Connected),
            3 => Ok(ProbeCommand::Ack),
            4 => Ok(ProbeCommand::ProtocolVersion),
            _ => Err(Error::ErrProbeCommandInvalid),
        }
    }
}

/// Trailing bytes after the fixed header; which form is present follows
/// from `command` (`Ack` carries the ack tail, everything else the command
/// tail).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeTail {
    Command {
        requires_ack: bool,
    },
    Ack {
        ack_command: ProbeCommand,
        ack_control_packet_num: u16,
    },
}

/// One probe packet as it travels on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeHeader {
    pub protocol_version: ProtocolVersion,
    pub command: ProbeCommand,
    pub sender_ip: String,
    pub sender_gid: [u8; SENDER_GID_SIZE],
    pub sender_stream_name: String,
    pub sender_stream_id: i32,
    pub sender_control_dest_port: u16,
    pub control_packet_num: u16,
    pub tail: ProbeTail,
}

impl Default for ProbeHeader {
    fn default() -> Self {
        ProbeHeader {
            protocol_version: ProtocolVersion::default(),
            command: ProbeCommand::Ping,
            sender_ip: String::new(),
            sender_gid: [0u8; SENDER_GID_SIZE],
            sender_stream_name: String::new(),
            sender_stream_id: -1,
            sender_control_dest_port: 0,
            control_packet_num: 0,
            tail: ProbeTail::Command {
                requires_ack: false,
            },
        }
    }
}

impl fmt::Display for ProbeHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} #{} from {}",
            self.command, self.control_packet_num, self.sender_ip
        )
    }
}

/// One's-complement sum of big-endian 16-bit words with the trailing odd
/// byte zero-padded and the carry folded back in.
pub fn probe_checksum(raw: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = raw.chunks_exact(2);
    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

fn put_fixed_str(buf: &mut BytesMut, s: &str, width: usize) -> Result<()> {
    let raw = s.as_bytes();
    // Keep one byte for the NUL terminator, matching the peer's C layout.
    if raw.len() >= width {
        return Err(Error::ErrProbeFieldTooLong);
    }
    buf.put_slice(raw);
    buf.put_bytes(0, width - raw.len());
    Ok(())
}

fn get_fixed_str<B: Buf>(reader: &mut B, width: usize) -> String {
    let raw = reader.copy_to_bytes(width);
    let end = raw.iter().position(|&b| b == 0).unwrap_or(width);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

impl ProbeHeader {
    pub fn marshal_size(&self) -> usize {
        match self.tail {
            ProbeTail::Command { .. } => PROBE_COMMAND_PACKET_SIZE,
            ProbeTail::Ack { .. } => PROBE_ACK_PACKET_SIZE,
        }
    }

    /// Encodes the packet and stamps the checksum over the full encoding.
    pub fn marshal(&self) -> Result<Bytes> {
        match (&self.tail, self.command) {
            (ProbeTail::Ack { .. }, ProbeCommand::Ack) => {}
            (ProbeTail::Command { .. }, ProbeCommand::Ack) => {
                return Err(Error::ErrProbeCommandInvalid)
            }
            (ProbeTail::Ack { .. }, _) => return Err(Error::ErrProbeCommandInvalid),
            (ProbeTail::Command { .. }, _) => {}
        }

        let mut buf = BytesMut::with_capacity(self.marshal_size());
        buf.put_u16(self.protocol_version.major);
        buf.put_u16(self.protocol_version.minor);
        buf.put_u16(self.protocol_version.probe);
        buf.put_u8(self.command as u8);
        put_fixed_str(&mut buf, &self.sender_ip, SENDER_IP_SIZE)?;
        buf.put_slice(&self.sender_gid);
        put_fixed_str(&mut buf, &self.sender_stream_name, SENDER_STREAM_NAME_SIZE)?;
        buf.put_i32(self.sender_stream_id);
        buf.put_u16(self.sender_control_dest_port);
        buf.put_u16(self.control_packet_num);
        buf.put_u16(0); // checksum, stamped below
        match &self.tail {
            ProbeTail::Command { requires_ack } => {
                buf.put_u8(u8::from(*requires_ack));
            }
            ProbeTail::Ack {
                ack_command,
                ack_control_packet_num,
            } => {
                buf.put_u8(*ack_command as u8);
                buf.put_u16(*ack_control_packet_num);
            }
        }

        let checksum = probe_checksum(&buf);
        buf[PROBE_CHECKSUM_OFFSET..PROBE_CHECKSUM_OFFSET + 2]
            .copy_from_slice(&checksum.to_be_bytes());
        Ok(buf.freeze())
    }

    /// Decodes a control-channel packet.
    ///
    /// Size is checked first, then the checksum, then the command byte, so
    /// a caller can drop-and-count without ever looking inside a damaged
    /// packet.
    pub fn unmarshal(raw: &Bytes) -> Result<Self> {
        if raw.len() != PROBE_COMMAND_PACKET_SIZE && raw.len() != PROBE_ACK_PACKET_SIZE {
            return Err(Error::ErrProbePacketSize);
        }

        let mut scratch = raw.to_vec();
        let wire_checksum = u16::from_be_bytes([
            scratch[PROBE_CHECKSUM_OFFSET],
            scratch[PROBE_CHECKSUM_OFFSET + 1],
        ]);
        scratch[PROBE_CHECKSUM_OFFSET] = 0;
        scratch[PROBE_CHECKSUM_OFFSET + 1] = 0;
        if probe_checksum(&scratch) != wire_checksum {
            return Err(Error::ErrProbePacketCrc);
        }

        let reader = &mut raw.clone();
        let protocol_version = ProtocolVersion {
            major: reader.get_u16(),
            minor: reader.get_u16(),
            probe: reader.get_u16(),
        };
        let command = ProbeCommand::try_from(reader.get_u8())?;

        let expected = match command {
            ProbeCommand::Ack => PROBE_ACK_PACKET_SIZE,
            _ => PROBE_COMMAND_PACKET_SIZE,
        };
        if raw.len() != expected {
            return Err(Error::ErrProbePacketSize);
        }

        let sender_ip = get_fixed_str(reader, SENDER_IP_SIZE);
        let mut sender_gid = [0u8; SENDER_GID_SIZE];
        reader.copy_to_slice(&mut sender_gid);
        let sender_stream_name = get_fixed_str(reader, SENDER_STREAM_NAME_SIZE);
        let sender_stream_id = reader.get_i32();
        let sender_control_dest_port = reader.get_u16();
        let control_packet_num = reader.get_u16();
        let _checksum = reader.get_u16();

        let tail = match command {
            ProbeCommand::Ack => ProbeTail::Ack {
                ack_command: ProbeCommand::try_from(reader.get_u8())?,
                ack_control_packet_num: reader.get_u16(),
            },
            _ => ProbeTail::Command {
                requires_ack: reader.get_u8() != 0,
            },
        };

        Ok(ProbeHeader {
            protocol_version,
            command,
            sender_ip,
            sender_gid,
            sender_stream_name,
            sender_stream_id,
            sender_control_dest_port,
            control_packet_num,
            tail,
        })
    }
}
