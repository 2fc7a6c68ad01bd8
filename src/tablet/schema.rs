//! Table schema carried by write and alter-schema operations.

use bytes::{BufMut, BytesMut};

use crate::util::coding::{decode_length_prefixed, decode_varint64, encode_length_prefixed,
    encode_varint64};
use crate::{Error, Result};

/// Column value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ColumnType {
    /// Raw bytes.
    Binary = 1,
    /// UTF-8 string.
    String = 2,
    /// 64-bit signed integer.
    Int64 = 3,
}

impl ColumnType {
    /// Create from byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(ColumnType::Binary),
            2 => Some(ColumnType::String),
            3 => Some(ColumnType::Int64),
            _ => None,
        }
    }
}

/// A single column definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    /// Column name.
    pub name: String,
    /// Column type.
    pub col_type: ColumnType,
}

impl ColumnSchema {
    /// Create a column definition.
    pub fn new(name: impl Into<String>, col_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            col_type,
        }
    }
}

/// A versioned table schema.
///
/// The first column is the row key. Alter-schema operations replace the
/// whole schema and bump the version; versions are compared to decide
/// whether a replayed alter is newer than the tablet's current schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    /// Monotonically increasing schema version.
    pub version: u64,
    /// Column definitions, key column first.
    pub columns: Vec<ColumnSchema>,
}

impl Schema {
    /// Create a schema.
    pub fn new(version: u64, columns: Vec<ColumnSchema>) -> Self {
        Self { version, columns }
    }

    /// A minimal key/value schema, handy as a starting point.
    pub fn key_value(version: u64) -> Self {
        Self::new(
            version,
            vec![
                ColumnSchema::new("key", ColumnType::Binary),
                ColumnSchema::new("value", ColumnType::Binary),
            ],
        )
    }

    /// Encode to a buffer.
    pub fn encode_to(&self, buf: &mut BytesMut) {
        encode_varint64(buf, self.version);
        encode_varint64(buf, self.columns.len() as u64);
        for col in &self.columns {
            encode_length_prefixed(buf, col.name.as_bytes());
            buf.put_u8(col.col_type as u8);
        }
    }

    /// Decode from a buffer.
    pub fn decode_from(buf: &mut &[u8]) -> Result<Self> {
        let version = decode_varint64(buf)
            .ok_or_else(|| Error::corruption("schema version truncated"))?;
        let ncols = decode_varint64(buf)
            .ok_or_else(|| Error::corruption("schema column count truncated"))?;

        let mut columns = Vec::with_capacity(ncols as usize);
        for _ in 0..ncols {
            let name = decode_length_prefixed(buf)
                .ok_or_else(|| Error::corruption("schema column name truncated"))?;
            let name = String::from_utf8(name.to_vec())
                .map_err(|_| Error::corruption("schema column name is not utf-8"))?;
            if buf.is_empty() {
                return Err(Error::corruption("schema column type truncated"));
            }
            let type_byte = buf[0];
            *buf = &buf[1..];
            let col_type = ColumnType::from_byte(type_byte)
                .ok_or_else(|| Error::corruption(format!("unknown column type: {}", type_byte)))?;
            columns.push(ColumnSchema { name, col_type });
        }

        Ok(Self { version, columns })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_roundtrip() {
        let schema = Schema::new(
            4,
            vec![
                ColumnSchema::new("key", ColumnType::Binary),
                ColumnSchema::new("name", ColumnType::String),
                ColumnSchema::new("count", ColumnType::Int64),
            ],
        );

        let mut buf = BytesMut::new();
        schema.encode_to(&mut buf);

        let mut slice: &[u8] = &buf;
        let decoded = Schema::decode_from(&mut slice).unwrap();
        assert_eq!(decoded, schema);
        assert!(slice.is_empty());
    }

    #[test]
    fn test_schema_decode_rejects_bad_type() {
        let schema = Schema::key_value(1);
        let mut buf = BytesMut::new();
        schema.encode_to(&mut buf);

        // Corrupt the first column's type byte (last byte of its record).
        let type_pos = buf.len() - "value".len() - 3;
        buf[type_pos] = 0x7f;

        let mut slice: &[u8] = &buf;
        assert!(Schema::decode_from(&mut slice).unwrap_err().is_corruption());
    }
}
