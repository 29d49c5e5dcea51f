//! Per-type field tables.

use std::collections::HashMap;

use crate::error::ArchiveResult;
use crate::protocol::value::{FieldValue, Value};

/// Emits one field of `R`, or nothing when the field is empty.
pub type FieldWriter<R> = for<'a> fn(&'a R) -> Option<FieldValue<'a>>;

/// Consumes one field value into `R`.
pub type FieldReader<R> = fn(&mut R, Value) -> ArchiveResult<()>;

/// Ordered writers plus a name-keyed reader table (aliases included).
pub struct FieldRegistry<R> {
    writers: Vec<(&'static str, FieldWriter<R>)>,
    readers: HashMap<&'static str, FieldReader<R>>,
}

impl<R> FieldRegistry<R> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            writers: Vec::new(),
            readers: HashMap::new(),
        }
    }

    /// Registers a field: written under `name` in registration order and
    /// read back under the same name.
    pub fn field(mut self, name: &'static str, writer: FieldWriter<R>, reader: FieldReader<R>) -> Self {
        self.writers.push((name, writer));
        self.readers.insert(name, reader);
        self
    }

    /// Registers a read-only legacy name that feeds the reader of `target`.
    ///
    /// `target` must already be registered; unknown targets are ignored.
    pub fn alias(mut self, alias: &'static str, target: &'static str) -> Self {
        if let Some(reader) = self.readers.get(target).copied() {
            self.readers.insert(alias, reader);
        }
        self
    }

    /// Registers a reader with no writer, for fields only old streams carry.
    pub fn read_only(mut self, name: &'static str, reader: FieldReader<R>) -> Self {
        self.readers.insert(name, reader);
        self
    }

    /// Writers in emission order.
    pub fn writers(&self) -> &[(&'static str, FieldWriter<R>)] {
        &self.writers
    }

    /// Reader for a field name, if registered.
    pub fn reader(&self, name: &str) -> Option<FieldReader<R>> {
        self.readers.get(name).copied()
    }

    /// Number of names (fields and aliases) the registry can read.
    pub fn readable_names(&self) -> usize {
        self.readers.len()
    }
}

impl<R> Default for FieldRegistry<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// A type that serializes through a [`FieldRegistry`].
///
/// Implementations keep the registry in a process-wide `LazyLock` so it is
/// built once on first use.
pub trait Protocol: Sized + 'static {
    /// Name used in log messages.
    const NAME: &'static str;

    /// The type's field table.
    fn registry() -> &'static FieldRegistry<Self>;
}
