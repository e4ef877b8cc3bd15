//! DHT key: peer Id, item key or lookup target.
use rand::Rng;
use sha2::{Digest, Sha256};
use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use crate::{Error, Result};

/// The size of keys in bytes.
pub const ID_SIZE: usize = 32;
/// The size of keys in bits.
pub const ID_BITS: u16 = ID_SIZE as u16 * 8;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
/// A 256-bit DHT key, identifying peers (by the hash of their address) and stored items.
///
/// Ids compare as big-endian unsigned integers, so comparing two XOR distances
/// with `Ord` orders them by closeness.
pub struct Id([u8; ID_SIZE]);

impl Id {
    /// The all-zero key.
    pub const ZERO: Id = Id([0; ID_SIZE]);

    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let bytes: [u8; ID_SIZE] = rng.gen();

        Id(bytes)
    }

    /// SHA-256 of `bytes`.
    pub fn hash<T: AsRef<[u8]>>(bytes: T) -> Id {
        Id(Sha256::digest(bytes.as_ref()).into())
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp.copy_from_slice(bytes);

        Ok(Id(tmp))
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// XOR metric between this Id and `other`.
    pub fn xor(&self, other: &Id) -> Id {
        let mut result = [0_u8; ID_SIZE];

        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Id(result)
    }

    /// Returns the bit at `index`, counting from the most significant bit.
    pub fn bit(&self, index: u16) -> bool {
        let byte = self.0[index as usize / 8];
        byte & (0x80 >> (index % 8)) != 0
    }

    /// Returns a copy of this Id with the bit at `index` (from the most significant bit) set.
    fn with_bit_set(mut self, index: u16) -> Id {
        self.0[index as usize / 8] |= 0x80 >> (index % 8);
        self
    }

    /// The most significant 128 bits as an integer.
    pub(crate) fn high_u128(&self) -> u128 {
        let mut high = [0_u8; 16];
        high.copy_from_slice(&self.0[..16]);
        u128::from_be_bytes(high)
    }

    /// Build an Id from its most significant 128 bits, filling the rest with random bits.
    pub(crate) fn from_high_u128(high: u128) -> Id {
        let mut bytes = Id::random().0;
        bytes[..16].copy_from_slice(&high.to_be_bytes());
        Id(bytes)
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Id> {
        if s.len() != ID_SIZE * 2 || !s.is_ascii() {
            return Err(Error::InvalidIdEncoding(s.to_string()));
        }

        let mut bytes = [0_u8; ID_SIZE];

        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::InvalidIdEncoding(s.to_string()))?;
        }

        Ok(Id(bytes))
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Self {
        Id(bytes)
    }
}

/// A contiguous sub-range `[start, end)` of the key space: all keys sharing the
/// first `depth` bits of `start`.
///
/// Splitting a range at its midpoint yields the two ranges one bit deeper, so a
/// set of ranges obtained only by splitting always partitions the key space.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyRange {
    start: Id,
    depth: u16,
}

impl KeyRange {
    /// The whole key space `[0, 2^256)`.
    pub fn full() -> Self {
        KeyRange {
            start: Id::ZERO,
            depth: 0,
        }
    }

    // === Getters ===

    /// Number of leading bits shared by every key in this range.
    pub fn depth(&self) -> u16 {
        self.depth
    }

    /// Inclusive lower bound.
    pub fn start(&self) -> Id {
        self.start
    }

    /// Exclusive upper bound, `None` if the range reaches the end of the key space.
    pub fn end(&self) -> Option<Id> {
        if self.depth == 0 {
            return None;
        }

        let mut bytes = *self.start.as_bytes();
        let index = self.depth - 1;
        let mut carry = 0x80_u16 >> (index % 8);
        let mut i = index as usize / 8;

        loop {
            let sum = bytes[i] as u16 + carry;
            bytes[i] = sum as u8;
            carry = sum >> 8;

            if carry == 0 {
                return Some(Id(bytes));
            }
            if i == 0 {
                return None;
            }
            i -= 1;
        }
    }

    // === Public Methods ===

    pub fn contains(&self, id: &Id) -> bool {
        let full_bytes = self.depth as usize / 8;
        let remaining_bits = self.depth % 8;

        if self.start.0[..full_bytes] != id.0[..full_bytes] {
            return false;
        }

        if remaining_bits == 0 {
            return true;
        }

        let mask = 0xff_u8 << (8 - remaining_bits);
        self.start.0[full_bytes] & mask == id.0[full_bytes] & mask
    }

    /// Split this range around its midpoint, returns `None` if it can't get any narrower.
    pub fn split(&self) -> Option<(KeyRange, KeyRange)> {
        if self.depth >= ID_BITS {
            return None;
        }

        let lower = KeyRange {
            start: self.start,
            depth: self.depth + 1,
        };
        let upper = KeyRange {
            start: self.start.with_bit_set(self.depth),
            depth: self.depth + 1,
        };

        Some((lower, upper))
    }

    /// A uniformly random key inside this range.
    pub fn random_id(&self) -> Id {
        let mut bytes = Id::random().0;
        let full_bytes = self.depth as usize / 8;
        let remaining_bits = self.depth % 8;

        bytes[..full_bytes].copy_from_slice(&self.start.0[..full_bytes]);

        if remaining_bits > 0 {
            let mask = 0xff_u8 << (8 - remaining_bits);
            bytes[full_bytes] = (self.start.0[full_bytes] & mask) | (bytes[full_bytes] & !mask);
        }

        Id(bytes)
    }
}

impl Debug for KeyRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.end() {
            Some(end) => write!(f, "KeyRange[{}, {})", self.start, end),
            None => write!(f, "KeyRange[{}, 2^256)", self.start),
        }
    }
}
