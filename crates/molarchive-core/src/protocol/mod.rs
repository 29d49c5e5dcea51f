//! Field-level serialization protocol shared by records, properties and
//! indexes.
//!
//! Every participating type registers an ordered list of writers and a table
//! of readers (legacy aliases included). Serialization walks the writers in
//! order; deserialization streams field names and dispatches each to its
//! reader, skipping anything it does not recognize.

pub mod registry;
pub mod stream;
pub mod value;

pub use registry::{FieldReader, FieldRegistry, FieldWriter, Protocol};
pub use stream::{Fields, FieldsSeed, RecordSeqSeed};
pub use value::{non_finite_token, parse_non_finite, Double, FieldValue, Value};

use std::io::Read;

use crate::encoding::{self, Encoding};
use crate::error::ArchiveResult;

/// Encodes a registered type.
pub fn encode<R: Protocol>(item: &R, encoding: Encoding) -> ArchiveResult<Vec<u8>> {
    encoding::to_bytes(&Fields(item), encoding)
}

/// Decodes a registered type from a stream, starting from its default.
pub fn decode<R, I>(input: I, encoding: Encoding, origin: &str) -> ArchiveResult<R>
where
    R: Protocol + Default,
    I: Read,
{
    let mut item = R::default();
    encoding::read_seed(FieldsSeed(&mut item), encoding, origin, input)?;
    Ok(item)
}
