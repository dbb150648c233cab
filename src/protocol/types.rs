//! Value types with first-class wire support: [`Uuid`] and [`Timestamp`].
// (c) 2025 Ross Younger

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;

use crate::protocol::{BitRead, BitWrite, Codec};
use crate::{Error, Result};

/// An RFC 4122 UUID, carried on the wire as 16 raw octets. Decoding rejects
/// values whose version or variant nibbles are out of contract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uuid([u8; 16]);

impl Uuid {
    /// The all-zero UUID.
    pub const NIL: Self = Self([0; 16]);

    /// A fresh random (version 4, variant 1) UUID.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes[6] = (bytes[6] & 0x0F) | 0x40;
        bytes[8] = (bytes[8] & 0x3F) | 0x80;
        Self(bytes)
    }

    /// Construct from raw octets.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// The raw octets.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Whether this is the all-zero UUID.
    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0 == [0; 16]
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            write!(f, "{b:02x}")?;
            if matches!(i, 3 | 5 | 7 | 9) {
                write!(f, "-")?;
            }
        }
        Ok(())
    }
}

impl FromStr for Uuid {
    type Err = Error;

    /// Parse the canonical hyphenated form, accepting only version 4,
    /// variant 1 values.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidEncoding(format!("invalid UUID string `{s}`"));

        let bytes = s.as_bytes();
        if bytes.len() != 36
            || bytes[8] != b'-'
            || bytes[13] != b'-'
            || bytes[18] != b'-'
            || bytes[23] != b'-'
        {
            return Err(invalid());
        }
        if bytes[14] != b'4' || !matches!(bytes[19], b'8' | b'9' | b'a' | b'b' | b'A' | b'B') {
            return Err(invalid());
        }

        let hex: Vec<u8> = bytes
            .iter()
            .copied()
            .filter(|b| *b != b'-')
            .collect();
        let mut out = [0u8; 16];
        for (i, pair) in hex.chunks(2).enumerate() {
            let s = std::str::from_utf8(pair).map_err(|_| invalid())?;
            out[i] = u8::from_str_radix(s, 16).map_err(|_| invalid())?;
        }
        Ok(Self(out))
    }
}

impl Codec for Uuid {
    fn bit_size(&self) -> u32 {
        self.0.bit_size()
    }

    fn serialize<W: BitWrite + ?Sized>(&self, writer: &mut W) {
        writer.write_bytes(&self.0);
    }

    fn deserialize<R: BitRead + ?Sized>(reader: &mut R) -> Result<Self> {
        let mut bytes = [0u8; 16];
        reader.read_bytes(&mut bytes)?;
        if (bytes[6] & 0xF0) != 0x40 {
            return Err(Error::InvalidEncoding("Invalid UUID version".into()));
        }
        if (bytes[8] & 0xC0) != 0x80 {
            return Err(Error::InvalidEncoding("Invalid UUID variant".into()));
        }
        Ok(Self(bytes))
    }
}

/// A wall-clock instant, carried as seconds then nanoseconds since the Unix
/// epoch (both u64 varuints). The default value is the epoch itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timestamp {
    seconds: u64,
    nanos: u32,
}

impl Timestamp {
    /// The current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        SystemTime::now().into()
    }

    /// Construct from a split epoch offset. `nanos` is the sub-second part.
    #[must_use]
    pub const fn new(seconds: u64, nanos: u32) -> Self {
        Self { seconds, nanos }
    }

    /// Whole seconds since the epoch.
    #[must_use]
    pub const fn seconds(&self) -> u64 {
        self.seconds
    }

    /// Sub-second nanoseconds.
    #[must_use]
    pub const fn subsec_nanos(&self) -> u32 {
        self.nanos
    }
}

impl From<SystemTime> for Timestamp {
    fn from(t: SystemTime) -> Self {
        let since_epoch = t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        Self {
            seconds: since_epoch.as_secs(),
            nanos: since_epoch.subsec_nanos(),
        }
    }
}

impl From<Timestamp> for SystemTime {
    fn from(t: Timestamp) -> Self {
        UNIX_EPOCH + Duration::new(t.seconds, t.nanos)
    }
}

impl Codec for Timestamp {
    fn bit_size(&self) -> u32 {
        self.seconds.bit_size() + u64::from(self.nanos).bit_size()
    }

    fn serialize<W: BitWrite + ?Sized>(&self, writer: &mut W) {
        self.seconds.serialize(writer);
        u64::from(self.nanos).serialize(writer);
    }

    fn deserialize<R: BitRead + ?Sized>(reader: &mut R) -> Result<Self> {
        let seconds = u64::deserialize(reader)?;
        let nanos = u64::deserialize(reader)?;
        let nanos = u32::try_from(nanos)
            .map_err(|_| Error::InvalidEncoding(format!("nanoseconds out of range: {nanos}")))?;
        Ok(Self { seconds, nanos })
    }
}
