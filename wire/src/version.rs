
use std::cmp::Ordering;
use std::fmt;

/// Version triple negotiated over the probe control channel.
///
/// `major` gates interoperability; `minor` and `probe` only select the
/// newest mutually understood behaviour.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
    pub probe: u16,
}

/// The protocol version this build speaks.
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion {
    major: 2,
    minor: 1,
    probe: 4,
};

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.probe)
    }
}

impl ProtocolVersion {
    /// Two endpoints can interoperate when their major versions match.
    pub fn compatible(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major
    }

    /// The version both sides agree to run: the smaller of the two
    /// `(minor, probe)` pairs under a shared major.
    pub fn negotiate(&self, other: &ProtocolVersion) -> Option<ProtocolVersion> {
        if !self.compatible(other) {
            return None;
        }
        let min = match (self.minor, self.probe).cmp(&(other.minor, other.probe)) {
            Ordering::Less | Ordering::Equal => *self,
            Ordering::Greater => *other,
        };
        Some(min)
    }
}
