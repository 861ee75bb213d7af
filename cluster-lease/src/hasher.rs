use siphasher::sip::SipHasher24;
use std::fmt;
use std::hash::Hasher;
use std::str::FromStr;

use crate::Error;

/// 64-bit hash used to place members and resources.
///
/// Every process in a fleet must use the same hasher (and seed) or they will
/// disagree about ownership.
pub trait KeyHasher: Send + Sync + fmt::Debug {
    fn hash(&self, bytes: &[u8]) -> u64;
}

/// Built-in hash functions selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashFunction {
    /// SipHash-2-4 keyed with `(k0, k1)`.
    SipHash24 { k0: u64, k1: u64 },
    /// 64-bit FNV-1a. Unkeyed.
    Fnv1a,
}

impl HashFunction {
    pub fn siphash_with_seed(seed: u64) -> Self {
        Self::SipHash24 { k0: seed, k1: seed }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SipHash24 { .. } => "siphash",
            Self::Fnv1a => "fnv1a",
        }
    }
}

impl Default for HashFunction {
    fn default() -> Self {
        Self::SipHash24 { k0: 0, k1: 0 }
    }
}

impl KeyHasher for HashFunction {
    #[inline]
    fn hash(&self, bytes: &[u8]) -> u64 {
        match *self {
            Self::SipHash24 { k0, k1 } => {
                let mut hasher = SipHasher24::new_with_keys(k0, k1);
                hasher.write(bytes);
                hasher.finish()
            }
            Self::Fnv1a => fnv1a(bytes),
        }
    }
}

impl FromStr for HashFunction {
    type Err = Error;

    /// Parses the hash name only; the SipHash seed is configured separately.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "siphash" | "siphash24" => Ok(Self::default()),
            "fnv" | "fnv1a" => Ok(Self::Fnv1a),
            other => Err(Error::Config(format!("unknown hash function: {}", other))),
        }
    }
}

impl fmt::Display for HashFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[inline]
fn fnv1a(bytes: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_known_vectors() {
        assert_eq!(HashFunction::Fnv1a.hash(b""), 0xcbf29ce484222325);
        assert_eq!(HashFunction::Fnv1a.hash(b"a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn test_siphash_seed_changes_output() {
        let unseeded = HashFunction::default();
        let seeded = HashFunction::siphash_with_seed(42);
        assert_ne!(unseeded.hash(b"foo"), seeded.hash(b"foo"));
        assert_eq!(seeded.hash(b"foo"), seeded.hash(b"foo"));
    }

    #[test]
    fn test_parse_hash_function() {
        assert_eq!("siphash".parse::<HashFunction>().unwrap(), HashFunction::default());
        assert_eq!("fnv1a".parse::<HashFunction>().unwrap(), HashFunction::Fnv1a);
        assert!(matches!(
            "md5".parse::<HashFunction>(),
            Err(Error::Config(_))
        ));
    }
}
