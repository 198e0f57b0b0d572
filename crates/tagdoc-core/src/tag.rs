use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// Four-character block identifier, stored left-aligned and zero-padded
/// ("ACT" is `b"ACT\0"`).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag([u8; 4]);

/// How a tag is laid out on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagOrder {
    /// Bytes exactly as the name reads.
    #[default]
    Forward,
    /// Name characters reversed, then zero-padded ("Emit" -> "timE", "ACT" -> "TCA\0").
    Reversed,
}

impl Tag {
    pub const fn new(bytes: [u8; 4]) -> Self {
        Tag(bytes)
    }

    /// Tag from a literal, truncated to four bytes. Not validated; descriptor
    /// validation rejects malformed tags.
    pub const fn lit(s: &str) -> Self {
        let b = s.as_bytes();
        let mut out = [0u8; 4];
        let mut i = 0;
        while i < b.len() && i < 4 {
            out[i] = b[i];
            i += 1;
        }
        Tag(out)
    }

    /// 1-4 printable ASCII characters followed only by zeros.
    pub fn is_valid(&self) -> bool {
        let n = self.len();
        n > 0 && self.0[..n].iter().all(u8::is_ascii_graphic) && self.0[n..].iter().all(|&b| b == 0)
    }

    pub fn bytes(&self) -> [u8; 4] {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.iter().position(|&b| b == 0).unwrap_or(4)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0[..self.len()]).unwrap_or("????")
    }

    pub fn to_disk(self, order: TagOrder) -> [u8; 4] {
        match order {
            TagOrder::Forward => self.0,
            TagOrder::Reversed => {
                let n = self.len();
                let mut out = [0u8; 4];
                for i in 0..n {
                    out[i] = self.0[n - 1 - i];
                }
                out
            }
        }
    }

    pub fn from_disk(raw: [u8; 4], order: TagOrder) -> Self {
        match order {
            TagOrder::Forward => Tag(raw),
            // reversing is its own inverse on the non-zero prefix
            TagOrder::Reversed => Tag(Tag(raw).to_disk(TagOrder::Reversed)),
        }
    }
}

impl FromStr for Tag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > 4 || !s.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(Error::Descriptor(format!(
                "tag must be 1-4 printable ASCII characters, got {s:?}"
            )));
        }
        let mut out = [0u8; 4];
        out[..s.len()].copy_from_slice(s.as_bytes());
        Ok(Tag(out))
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({:?})", self.as_str())
    }
}

impl Serialize for Tag {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Tag {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Shorthand for descriptor tables: panics on an invalid literal.
#[cfg(test)]
pub(crate) fn tag(s: &str) -> Tag {
    s.parse().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reversed_order_matches_particle_files() {
        assert_eq!(&tag("Emit").to_disk(TagOrder::Reversed), b"timE");
        assert_eq!(&tag("ACT").to_disk(TagOrder::Reversed), b"TCA\0");
        assert_eq!(Tag::from_disk(*b"TCA\0", TagOrder::Reversed), tag("ACT"));
        assert_eq!(Tag::from_disk(*b"XFVA", TagOrder::Reversed), tag("AVFX"));
    }

    #[test]
    fn rejects_bad_literals() {
        assert!("".parse::<Tag>().is_err());
        assert!("TOOLONG".parse::<Tag>().is_err());
        assert!("a b".parse::<Tag>().is_err());
    }
}
