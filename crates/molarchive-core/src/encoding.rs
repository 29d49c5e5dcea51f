//! Wire encodings and the stream helpers that apply them.
//!
//! An archive picks one [`Encoding`] at creation (or detects it on open) and
//! threads it through every read and write; there is no global factory.

use std::fmt;
use std::io::{BufRead, BufReader, Cursor, Read, Write};
use std::str::FromStr;

use serde::de::DeserializeSeed;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ArchiveError, ArchiveResult};

/// Magic bytes opening every Smile stream. The fourth header byte carries
/// the format version and flags.
pub const SMILE_MAGIC: [u8; 3] = *b":)\n";

/// Serialization format of records, properties and indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Smile, recognized by [`SMILE_MAGIC`].
    #[default]
    Binary,
    /// JSON.
    Text,
}

impl Encoding {
    /// Every encoding, in probe order.
    pub const ALL: [Encoding; 2] = [Encoding::Binary, Encoding::Text];

    /// File extension (without the dot) used by virtual stores.
    pub fn extension(self) -> &'static str {
        match self {
            Encoding::Binary => "sml",
            Encoding::Text => "json",
        }
    }

    /// Maps a file extension back to its encoding.
    pub fn from_extension(ext: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.extension() == ext)
    }

    /// Classifies the first bytes of a stream.
    pub fn detect(prefix: &[u8]) -> Option<Self> {
        if prefix.starts_with(&SMILE_MAGIC) {
            return Some(Encoding::Binary);
        }
        match prefix.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(b'{') | Some(b'[') => Some(Encoding::Text),
            _ => None,
        }
    }

    /// Peeks at a buffered stream without consuming it.
    pub fn sniff<R: BufRead + ?Sized>(reader: &mut R) -> ArchiveResult<Option<Self>> {
        Ok(Self::detect(reader.fill_buf()?))
    }

    /// Returns true for encodings whose serializer is human readable.
    pub fn is_text(self) -> bool {
        self == Encoding::Text
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Binary => write!(f, "binary"),
            Encoding::Text => write!(f, "text"),
        }
    }
}

impl FromStr for Encoding {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binary" | "sml" | "smile" => Ok(Encoding::Binary),
            "text" | "json" => Ok(Encoding::Text),
            other => Err(ArchiveError::Config(format!("unknown encoding: {other}"))),
        }
    }
}

/// Writes `value` to `writer` in `encoding`. Smile output starts with its
/// own header.
pub fn write_value<T, W>(value: &T, encoding: Encoding, mut writer: W) -> ArchiveResult<()>
where
    T: Serialize + ?Sized,
    W: Write,
{
    match encoding {
        Encoding::Text => serde_json::to_writer(&mut writer, value)?,
        Encoding::Binary => serde_smile::to_writer(&mut writer, value)?,
    }
    writer.flush()?;
    Ok(())
}

/// Serializes `value` into a fresh buffer.
pub fn to_bytes<T: Serialize + ?Sized>(value: &T, encoding: Encoding) -> ArchiveResult<Vec<u8>> {
    let mut bytes = Vec::new();
    write_value(value, encoding, &mut bytes)?;
    Ok(bytes)
}

/// Drives `seed` over a stream in `encoding`.
///
/// A stream that ends early is logged and treated as complete: whatever the
/// seed consumed before the end is kept. Every other failure is returned.
pub fn read_seed<S, R>(seed: S, encoding: Encoding, origin: &str, mut reader: R) -> ArchiveResult<()>
where
    S: for<'de> DeserializeSeed<'de, Value = ()>,
    R: Read,
{
    let result = match encoding {
        Encoding::Text => {
            let mut de = serde_json::Deserializer::from_reader(reader);
            seed.deserialize(&mut de).map_err(ArchiveError::from)
        }
        Encoding::Binary => {
            let mut magic = [0u8; 3];
            reader.read_exact(&mut magic)?;
            if magic != SMILE_MAGIC {
                return Err(ArchiveError::UnknownEncoding {
                    origin: origin.to_string(),
                });
            }
            // The deserializer parses the full header itself.
            let stream = BufReader::new(Cursor::new(magic).chain(reader));
            let mut de = serde_smile::de::Deserializer::new(serde_smile::de::IoRead::new(stream));
            seed.deserialize(&mut de).map_err(ArchiveError::from)
        }
    };
    match result {
        Err(e) if e.is_unexpected_eof() => {
            warn!(origin = %origin, %encoding, error = %e, "stream ended early, keeping fields read so far");
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_extensions() {
        assert_eq!(Encoding::Binary.extension(), "sml");
        assert_eq!(Encoding::Text.extension(), "json");
        assert_eq!(Encoding::from_extension("json"), Some(Encoding::Text));
        assert_eq!(Encoding::from_extension("yaml"), None);
    }

    #[test]
    fn test_detect() {
        assert_eq!(Encoding::detect(b":)\n\x00\xfa"), Some(Encoding::Binary));
        assert_eq!(Encoding::detect(b"  \n {\"a\":1}"), Some(Encoding::Text));
        assert_eq!(Encoding::detect(b"[1]"), Some(Encoding::Text));
        assert_eq!(Encoding::detect(b":)"), None);
        assert_eq!(Encoding::detect(b"hello"), None);
        assert_eq!(Encoding::detect(b""), None);
    }

    #[test]
    fn test_sniff_does_not_consume() {
        let mut reader = BufReader::new(&b"{\"x\": 1}"[..]);
        assert_eq!(Encoding::sniff(&mut reader).unwrap(), Some(Encoding::Text));
        let mut rest = String::new();
        reader.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "{\"x\": 1}");
    }

    #[test]
    fn test_from_str() {
        assert_eq!("JSON".parse::<Encoding>().unwrap(), Encoding::Text);
        assert_eq!("smile".parse::<Encoding>().unwrap(), Encoding::Binary);
        assert!("xml".parse::<Encoding>().is_err());
    }

    #[test]
    fn test_binary_bytes_are_smile() {
        let mut map = BTreeMap::new();
        map.insert("a", 1);
        let bytes = to_bytes(&map, Encoding::Binary).unwrap();
        assert_eq!(&bytes[..3], b":)\n");
        assert_eq!(Encoding::detect(&bytes), Some(Encoding::Binary));
        let back: BTreeMap<String, i32> = serde_smile::from_slice(&bytes).unwrap();
        assert_eq!(back.get("a"), Some(&1));
    }

    #[test]
    fn test_reads_smile_from_other_writers() {
        struct Collect<'a>(&'a mut Vec<String>);
        impl<'de, 'a> DeserializeSeed<'de> for Collect<'a> {
            type Value = ();
            fn deserialize<D: serde::Deserializer<'de>>(self, d: D) -> Result<(), D::Error> {
                self.0.extend(Vec::<String>::deserialize(d)?);
                Ok(())
            }
        }
        let bytes = serde_smile::to_vec(&vec!["m1", "m2"]).unwrap();
        let mut out = Vec::new();
        read_seed(Collect(&mut out), Encoding::Binary, "test", &bytes[..]).unwrap();
        assert_eq!(out, vec!["m1", "m2"]);
    }

    #[test]
    fn test_text_bytes_are_json() {
        let mut map = BTreeMap::new();
        map.insert("a", 1);
        let bytes = to_bytes(&map, Encoding::Text).unwrap();
        assert_eq!(bytes, b"{\"a\":1}");
    }

    #[test]
    fn test_binary_without_header_rejected() {
        struct Ignore;
        impl<'de> DeserializeSeed<'de> for Ignore {
            type Value = ();
            fn deserialize<D: serde::Deserializer<'de>>(self, d: D) -> Result<(), D::Error> {
                serde::de::IgnoredAny::deserialize(d).map(|_| ())
            }
        }
        let err = read_seed(Ignore, Encoding::Binary, "test", &b"{\"a\":1}"[..]).unwrap_err();
        assert!(matches!(err, ArchiveError::UnknownEncoding { .. }));
    }
}
