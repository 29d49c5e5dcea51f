//! Streaming serialization of registered types.

use std::fmt;
use std::marker::PhantomData;

use serde::de::{self, DeserializeSeed, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, Serializer};
use tracing::{debug, warn};

use crate::protocol::registry::Protocol;
use crate::protocol::value::Value;

/// Serializes `R` as an object: one entry per writer that emits a value.
pub struct Fields<'a, R>(pub &'a R);

impl<R: Protocol> Serialize for Fields<'_, R> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let emitted: Vec<_> = R::registry()
            .writers()
            .iter()
            .filter_map(|(name, write)| write(self.0).map(|value| (*name, value)))
            .collect();
        let mut map = serializer.serialize_map(Some(emitted.len()))?;
        for (name, value) in &emitted {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Reads an object into an existing `R`, field by field.
///
/// Unregistered fields are skipped whole. A reader that rejects its value
/// leaves the field at its current value.
pub struct FieldsSeed<'a, R>(pub &'a mut R);

impl<'de, R: Protocol> DeserializeSeed<'de> for FieldsSeed<'_, R> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_map(FieldsVisitor(self.0))
    }
}

struct FieldsVisitor<'a, R>(&'a mut R);

impl<'de, R: Protocol> Visitor<'de> for FieldsVisitor<'_, R> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a {} object", R::NAME)
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        let registry = R::registry();
        while let Some(name) = map.next_key::<String>()? {
            match registry.reader(&name) {
                Some(read) => {
                    let value: Value = map.next_value()?;
                    if let Err(e) = read(self.0, value) {
                        warn!(kind = R::NAME, field = %name, error = %e, "rejected field value");
                    }
                }
                None => skip_unknown(&mut map, R::NAME, &name)?,
            }
        }
        Ok(())
    }
}

/// Consumes the value of an unrecognized field.
pub(crate) fn skip_unknown<'de, A: MapAccess<'de>>(
    map: &mut A,
    kind: &str,
    name: &str,
) -> Result<(), A::Error> {
    match map.next_value::<Skipped>()? {
        Skipped::Nested => warn!(kind, field = %name, "skipped unknown nested field"),
        Skipped::Scalar => debug!(kind, field = %name, "skipped unknown field"),
    }
    Ok(())
}

/// Shape of a value that was consumed without being kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Skipped {
    Scalar,
    Nested,
}

impl<'de> de::Deserialize<'de> for Skipped {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(SkipVisitor)
    }
}

struct SkipVisitor;

macro_rules! skip_scalar {
    ($($method:ident: $ty:ty),* $(,)?) => {
        $(
            fn $method<E: de::Error>(self, _v: $ty) -> Result<Skipped, E> {
                Ok(Skipped::Scalar)
            }
        )*
    };
}

impl<'de> Visitor<'de> for SkipVisitor {
    type Value = Skipped;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("any value")
    }

    skip_scalar! {
        visit_bool: bool,
        visit_i64: i64,
        visit_u64: u64,
        visit_f64: f64,
        visit_str: &str,
        visit_bytes: &[u8],
    }

    fn visit_unit<E: de::Error>(self) -> Result<Skipped, E> {
        Ok(Skipped::Scalar)
    }

    fn visit_none<E: de::Error>(self) -> Result<Skipped, E> {
        Ok(Skipped::Scalar)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Skipped, D::Error> {
        de::Deserialize::deserialize(d)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Skipped, A::Error> {
        while seq.next_element::<IgnoredAny>()?.is_some() {}
        Ok(Skipped::Nested)
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Skipped, A::Error> {
        while map.next_entry::<IgnoredAny, IgnoredAny>()?.is_some() {}
        Ok(Skipped::Nested)
    }
}

/// Reads a sequence of objects, handing each decoded `R` to a sink.
///
/// Used for the record arrays of a single-file archive so records never
/// accumulate in an intermediate vector.
pub struct RecordSeqSeed<'s, R, F> {
    sink: &'s mut F,
    _record: PhantomData<fn() -> R>,
}

impl<'s, R, F> RecordSeqSeed<'s, R, F>
where
    R: Protocol + Default,
    F: FnMut(R),
{
    /// Wraps a sink.
    pub fn new(sink: &'s mut F) -> Self {
        Self {
            sink,
            _record: PhantomData,
        }
    }
}

impl<'de, R, F> DeserializeSeed<'de> for RecordSeqSeed<'_, R, F>
where
    R: Protocol + Default,
    F: FnMut(R),
{
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de, R, F> Visitor<'de> for RecordSeqSeed<'_, R, F>
where
    R: Protocol + Default,
    F: FnMut(R),
{
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "an array of {} objects", R::NAME)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        loop {
            let mut record = R::default();
            match seq.next_element_seed(FieldsSeed(&mut record))? {
                Some(()) => (self.sink)(record),
                None => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{read_seed, to_bytes, Encoding};
    use crate::error::ArchiveResult;
    use crate::protocol::registry::FieldRegistry;
    use crate::protocol::value::FieldValue;
    use std::sync::LazyLock;

    #[derive(Debug, Default, PartialEq)]
    struct Sample {
        label: String,
        weight: f64,
        codes: Vec<String>,
    }

    fn write_label(s: &Sample) -> Option<FieldValue<'_>> {
        Some(FieldValue::Str(&s.label))
    }

    fn read_label(s: &mut Sample, v: Value) -> ArchiveResult<()> {
        s.label = v.into_string("label")?;
        Ok(())
    }

    fn write_weight(s: &Sample) -> Option<FieldValue<'_>> {
        Some(FieldValue::Float(s.weight))
    }

    fn read_weight(s: &mut Sample, v: Value) -> ArchiveResult<()> {
        s.weight = v.to_f64("weight")?;
        Ok(())
    }

    fn write_codes(s: &Sample) -> Option<FieldValue<'_>> {
        (!s.codes.is_empty()).then_some(FieldValue::Strings(&s.codes))
    }

    fn read_codes(s: &mut Sample, v: Value) -> ArchiveResult<()> {
        s.codes = v.into_strings("codes")?;
        Ok(())
    }

    static SAMPLE_FIELDS: LazyLock<FieldRegistry<Sample>> = LazyLock::new(|| {
        FieldRegistry::new()
            .field("label", write_label, read_label)
            .field("weight", write_weight, read_weight)
            .field("codes", write_codes, read_codes)
            .alias("Label", "label")
    });

    impl Protocol for Sample {
        const NAME: &'static str = "sample";

        fn registry() -> &'static FieldRegistry<Self> {
            &SAMPLE_FIELDS
        }
    }

    fn decode(bytes: &[u8], encoding: Encoding) -> ArchiveResult<Sample> {
        let mut sample = Sample::default();
        read_seed(FieldsSeed(&mut sample), encoding, "test", bytes)?;
        Ok(sample)
    }

    #[test]
    fn test_writer_order_and_empty_fields() {
        let s = Sample {
            label: "a".into(),
            weight: 2.0,
            codes: vec![],
        };
        let json = serde_json::to_string(&Fields(&s)).unwrap();
        assert_eq!(json, r#"{"label":"a","weight":2.0}"#);
    }

    #[test]
    fn test_round_trip_both_encodings() {
        let s = Sample {
            label: "x".into(),
            weight: f64::INFINITY,
            codes: vec!["c1".into(), "c2".into()],
        };
        for encoding in Encoding::ALL {
            let bytes = to_bytes(&Fields(&s), encoding).unwrap();
            assert_eq!(decode(&bytes, encoding).unwrap(), s);
        }
    }

    #[test]
    fn test_unknown_fields_skipped() {
        let json = br#"{"extra": {"deep": [1, {"x": 2}]}, "Label": "L", "n": 3, "weight": "NaN"}"#;
        let s = decode(json, Encoding::Text).unwrap();
        assert_eq!(s.label, "L");
        assert!(s.weight.is_nan());
    }

    #[test]
    fn test_rejected_value_keeps_default() {
        let json = br#"{"label": 5, "weight": 1.5}"#;
        let s = decode(json, Encoding::Text).unwrap();
        assert_eq!(s.label, "");
        assert_eq!(s.weight, 1.5);
    }

    #[test]
    fn test_truncated_stream_keeps_prefix() {
        let json = br#"{"label": "kept", "weight": 4.0, "codes": ["a", "#;
        let s = decode(json, Encoding::Text).unwrap();
        assert_eq!(s.label, "kept");
        assert_eq!(s.weight, 4.0);
        assert!(s.codes.is_empty());
    }

    #[test]
    fn test_truncated_binary_keeps_prefix() {
        let s = Sample {
            label: "kept".into(),
            weight: 1.0,
            codes: vec!["abcdefgh".into(); 4],
        };
        let bytes = to_bytes(&Fields(&s), Encoding::Binary).unwrap();
        let cut = &bytes[..bytes.len() - 9];
        let back = decode(cut, Encoding::Binary).unwrap();
        assert_eq!(back.label, "kept");
        assert!(back.codes.is_empty());
    }

    #[test]
    fn test_record_seq_feeds_sink() {
        let json = br#"[{"label": "a"}, {"label": "b", "junk": [1]}]"#;
        let mut seen = Vec::new();
        let mut sink = |s: Sample| seen.push(s.label);
        read_seed(RecordSeqSeed::new(&mut sink), Encoding::Text, "test", &json[..]).unwrap();
        assert_eq!(seen, vec!["a", "b"]);
    }
}
