//! Schema and type update records.
//!
//! Schema keys carry a [`SchemaUpdate`] value describing one predicate; type
//! keys carry a [`TypeUpdate`] naming the type and its field predicates.
//! Both embed predicate names, so namespace-format migrations rewrite the
//! values as well as the keys.
//!
//! Wire layout (little-endian): strings are u16-length-prefixed UTF-8.

use crate::error::{Error, Result};
use crate::wire::{read_string16, read_u16, read_u8, write_len_bytes16};

/// Predicate directive: maintain a term index.
pub const SCHEMA_FLAG_INDEX: u8 = 0x01;
/// Predicate directive: maintain reverse edges.
pub const SCHEMA_FLAG_REVERSE: u8 = 0x02;
/// Predicate directive: maintain count indexes.
pub const SCHEMA_FLAG_COUNT: u8 = 0x04;
/// Predicate directive: upsert on mutation.
pub const SCHEMA_FLAG_UPSERT: u8 = 0x08;
/// Predicate directive: language-tagged strings.
pub const SCHEMA_FLAG_LANG: u8 = 0x10;

/// Schema record for one predicate.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SchemaUpdate {
    /// Namespaced predicate name.
    pub predicate: String,
    pub value_type: u8,
    pub flags: u8,
    pub tokenizers: Vec<String>,
}

impl SchemaUpdate {
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.marshal_into(&mut buf);
        buf
    }

    fn marshal_into(&self, buf: &mut Vec<u8>) {
        write_len_bytes16(buf, self.predicate.as_bytes());
        buf.push(self.value_type);
        buf.push(self.flags);
        buf.extend_from_slice(&(self.tokenizers.len() as u16).to_le_bytes());
        for t in &self.tokenizers {
            write_len_bytes16(buf, t.as_bytes());
        }
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let mut pos = 0;
        let update = Self::read_from(data, &mut pos)?;
        if pos != data.len() {
            return Err(Error::decode("trailing bytes after schema update"));
        }
        Ok(update)
    }

    fn read_from(data: &[u8], pos: &mut usize) -> Result<Self> {
        let predicate = read_string16(data, pos)?;
        let value_type = read_u8(data, pos)?;
        let flags = read_u8(data, pos)?;
        let tok_count = read_u16(data, pos)? as usize;
        let mut tokenizers = Vec::with_capacity(tok_count);
        for _ in 0..tok_count {
            tokenizers.push(read_string16(data, pos)?);
        }
        Ok(SchemaUpdate {
            predicate,
            value_type,
            flags,
            tokenizers,
        })
    }
}

/// Type record: a type name and its field predicates.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TypeUpdate {
    /// Namespaced type name.
    pub type_name: String,
    pub fields: Vec<SchemaUpdate>,
}

impl TypeUpdate {
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_len_bytes16(&mut buf, self.type_name.as_bytes());
        buf.extend_from_slice(&(self.fields.len() as u16).to_le_bytes());
        for f in &self.fields {
            f.marshal_into(&mut buf);
        }
        buf
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let mut pos = 0;
        let type_name = read_string16(data, &mut pos)?;
        let field_count = read_u16(data, &mut pos)? as usize;
        let mut fields = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            fields.push(SchemaUpdate::read_from(data, &mut pos)?);
        }
        if pos != data.len() {
            return Err(Error::decode("trailing bytes after type update"));
        }
        Ok(TypeUpdate { type_name, fields })
    }
}

// ============================================================================
// Tests
// ============================================================================
