use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

#[derive(PartialEq, Eq, Debug, Copy, Clone, Hash)]
pub struct SimpleVersion {
    /// Backwards compatibility breaking
    pub major: u16,
    /// Backwards and Future compatible changes
    pub minor: u16,
}

impl SimpleVersion {
    pub const fn new(major: u16, minor: u16) -> SimpleVersion {
        SimpleVersion { major, minor }
    }

    /// Layout of archived journal records. Bump major when old records can no longer be read.
    pub const fn record_format() -> SimpleVersion {
        SimpleVersion { major: 1, minor: 0 }
    }

    /// Data written with `self` can be read by code that understands `reader`.
    pub fn is_readable_by(&self, reader: &SimpleVersion) -> bool {
        self.major == reader.major
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        let mut bytes = [0u8; 4];
        bytes[..2].copy_from_slice(&self.major.to_be_bytes());
        bytes[2..].copy_from_slice(&self.minor.to_be_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<SimpleVersion> {
        if bytes.len() != 4 {
            return None;
        }
        Some(SimpleVersion {
            major: u16::from_be_bytes([bytes[0], bytes[1]]),
            minor: u16::from_be_bytes([bytes[2], bytes[3]]),
        })
    }
}

impl Display for SimpleVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl PartialOrd for SimpleVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SimpleVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.major > other.major {
            Ordering::Greater
        } else if self.major < other.major {
            Ordering::Less
        } else {
            self.minor.cmp(&other.minor)
        }
    }
}
