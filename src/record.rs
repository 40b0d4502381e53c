//! Rows, columns and schemas, plus their bit-exact on-disk forms.
//!
//! A serialized row is `RowId(8) | null-bitmap | fields`, with ints and
//! floats as 4-byte little-endian values and chars as raw bytes of the
//! declared length. Column and schema images carry magic numbers and are
//! consumed by the catalog layer.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::errors::{DbError, DbResult};
use crate::RowId;

pub const COLUMN_MAGIC_NUM: u32 = 210928;
pub const SCHEMA_MAGIC_NUM: u32 = 200715;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TypeId {
    Invalid = 0,
    Int = 1,
    Float = 2,
    Char = 3,
}

impl TypeId {
    fn from_u32(v: u32) -> TypeId {
        match v {
            1 => TypeId::Int,
            2 => TypeId::Float,
            3 => TypeId::Char,
            _ => TypeId::Invalid,
        }
    }
}

/// A single typed value, possibly null.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Int(i32),
    Float(f32),
    Char(String),
    Null(TypeId),
}

impl Field {
    pub fn type_id(&self) -> TypeId {
        match self {
            Field::Int(_) => TypeId::Int,
            Field::Float(_) => TypeId::Float,
            Field::Char(_) => TypeId::Char,
            Field::Null(t) => *t,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Field::Null(_))
    }

    /// Nulls sort below every value; floats use their partial order and
    /// treat incomparable pairs as equal.
    pub fn compare(&self, other: &Field) -> Ordering {
        match (self, other) {
            (Field::Null(_), Field::Null(_)) => Ordering::Equal,
            (Field::Null(_), _) => Ordering::Less,
            (_, Field::Null(_)) => Ordering::Greater,
            (Field::Int(a), Field::Int(b)) => a.cmp(b),
            (Field::Float(a), Field::Float(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Field::Char(a), Field::Char(b)) => a.cmp(b),
            _ => panic!("comparing fields of different types"),
        }
    }

    fn serialize_to(&self, buf: &mut [u8], column: &Column) -> u32 {
        let len = column.len() as usize;
        match self {
            Field::Int(v) => buf[..4].copy_from_slice(&v.to_le_bytes()),
            Field::Float(v) => buf[..4].copy_from_slice(&v.to_le_bytes()),
            Field::Char(s) => {
                let bytes = s.as_bytes();
                assert!(bytes.len() <= len, "char value longer than declared length");
                buf[..bytes.len()].copy_from_slice(bytes);
                buf[bytes.len()..len].fill(0);
            }
            Field::Null(_) => buf[..len].fill(0),
        }
        len as u32
    }

    fn deserialize_from(buf: &[u8], column: &Column, is_null: bool) -> (Field, u32) {
        let len = column.len() as usize;
        if is_null {
            return (Field::Null(column.type_id()), len as u32);
        }
        let field = match column.type_id() {
            TypeId::Int => Field::Int(i32::from_le_bytes(buf[..4].try_into().unwrap())),
            TypeId::Float => Field::Float(f32::from_le_bytes(buf[..4].try_into().unwrap())),
            TypeId::Char => {
                let end = buf[..len].iter().position(|&b| b == 0).unwrap_or(len);
                Field::Char(String::from_utf8_lossy(&buf[..end]).into_owned())
            }
            TypeId::Invalid => panic!("deserializing a field of invalid type"),
        };
        (field, len as u32)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    name: String,
    type_id: TypeId,
    len: u32,
    table_ind: u32,
    nullable: bool,
    unique: bool,
}

impl Column {
    /// Fixed-width column (int or float); the length follows from the
    /// type.
    pub fn new(name: &str, type_id: TypeId, table_ind: u32, nullable: bool, unique: bool) -> Self {
        let len = match type_id {
            TypeId::Int => 4,
            TypeId::Float => 4,
            _ => panic!("wrong constructor for char column"),
        };
        Self {
            name: name.to_string(),
            type_id,
            len,
            table_ind,
            nullable,
            unique,
        }
    }

    /// Char column of an explicit declared length.
    pub fn with_length(name: &str, len: u32, table_ind: u32, nullable: bool, unique: bool) -> Self {
        Self {
            name: name.to_string(),
            type_id: TypeId::Char,
            len,
            table_ind,
            nullable,
            unique,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn table_ind(&self) -> u32 {
        self.table_ind
    }

    pub fn nullable(&self) -> bool {
        self.nullable
    }

    pub fn unique(&self) -> bool {
        self.unique
    }

    pub fn serialize_to(&self, buf: &mut [u8]) -> u32 {
        let mut offset = 0usize;
        buf[offset..offset + 4].copy_from_slice(&COLUMN_MAGIC_NUM.to_le_bytes());
        offset += 4;
        let name_len = self.name.len() as u32;
        buf[offset..offset + 4].copy_from_slice(&name_len.to_le_bytes());
        offset += 4;
        buf[offset..offset + self.name.len()].copy_from_slice(self.name.as_bytes());
        offset += self.name.len();
        buf[offset..offset + 4].copy_from_slice(&(self.type_id as u32).to_le_bytes());
        offset += 4;
        buf[offset..offset + 4].copy_from_slice(&self.len.to_le_bytes());
        offset += 4;
        buf[offset..offset + 4].copy_from_slice(&self.table_ind.to_le_bytes());
        offset += 4;
        buf[offset] = self.nullable as u8;
        offset += 1;
        buf[offset] = self.unique as u8;
        offset += 1;
        offset as u32
    }

    pub fn serialized_size(&self) -> u32 {
        (4 + 4 + self.name.len() + 4 + 4 + 4 + 1 + 1) as u32
    }

    pub fn deserialize_from(buf: &[u8]) -> (Column, u32) {
        let mut offset = 0usize;
        let magic = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap());
        assert_eq!(magic, COLUMN_MAGIC_NUM, "invalid column magic number");
        offset += 4;
        let name_len = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
        offset += 4;
        let name = String::from_utf8_lossy(&buf[offset..offset + name_len]).into_owned();
        offset += name_len;
        let type_id = TypeId::from_u32(u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap()));
        offset += 4;
        let len = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap());
        offset += 4;
        let table_ind = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap());
        offset += 4;
        let nullable = buf[offset] != 0;
        offset += 1;
        let unique = buf[offset] != 0;
        offset += 1;
        let column = if type_id == TypeId::Char {
            Column::with_length(&name, len, table_ind, nullable, unique)
        } else {
            Column::new(&name, type_id, table_ind, nullable, unique)
        };
        (column, offset as u32)
    }
}

/// A schema owns its columns; callers share one through `Arc<Schema>`
/// where the original design passed a borrowed view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, index: usize) -> &Column {
        &self.columns[index]
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_index(&self, name: &str) -> DbResult<usize> {
        self.columns
            .iter()
            .position(|c| c.name() == name)
            .ok_or(DbError::ColumnNameNotExist)
    }

    /// Width of the serialized null bitmap plus all field bytes.
    pub fn fixed_row_size(&self) -> usize {
        self.columns.len().div_ceil(8) + self.columns.iter().map(|c| c.len() as usize).sum::<usize>()
    }

    pub fn serialize_to(&self, buf: &mut [u8]) -> u32 {
        let mut offset = 0usize;
        buf[offset..offset + 4].copy_from_slice(&SCHEMA_MAGIC_NUM.to_le_bytes());
        offset += 4;
        buf[offset..offset + 4].copy_from_slice(&(self.columns.len() as u32).to_le_bytes());
        offset += 4;
        for column in &self.columns {
            offset += column.serialize_to(&mut buf[offset..]) as usize;
        }
        // The on-disk form keeps the legacy ownership byte; a serialized
        // schema always owns its columns.
        buf[offset] = 1;
        offset += 1;
        offset as u32
    }

    pub fn serialized_size(&self) -> u32 {
        4 + 4 + self.columns.iter().map(|c| c.serialized_size()).sum::<u32>() + 1
    }

    pub fn deserialize_from(buf: &[u8]) -> (Schema, u32) {
        let mut offset = 0usize;
        let magic = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap());
        assert_eq!(magic, SCHEMA_MAGIC_NUM, "invalid schema magic number");
        offset += 4;
        let column_count = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap());
        offset += 4;
        let mut columns = Vec::with_capacity(column_count as usize);
        for _ in 0..column_count {
            let (column, n) = Column::deserialize_from(&buf[offset..]);
            offset += n as usize;
            columns.push(column);
        }
        offset += 1; // ownership byte
        (Schema::new(columns), offset as u32)
    }
}

/// A row of fields addressed by a [`RowId`].
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    rid: RowId,
    fields: Vec<Field>,
}

impl Row {
    pub fn new(fields: Vec<Field>) -> Self {
        Self {
            rid: RowId::INVALID,
            fields,
        }
    }

    pub fn with_rid(rid: RowId) -> Self {
        Self {
            rid,
            fields: Vec::new(),
        }
    }

    pub fn rid(&self) -> RowId {
        self.rid
    }

    pub fn set_rid(&mut self, rid: RowId) {
        self.rid = rid;
    }

    pub fn field(&self, index: usize) -> &Field {
        &self.fields[index]
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn serialize_to(&self, buf: &mut [u8], schema: &Schema) -> u32 {
        assert_eq!(
            schema.column_count(),
            self.fields.len(),
            "fields do not match the schema"
        );
        let mut offset = 0usize;
        buf[offset..offset + 8].copy_from_slice(&self.rid.to_le_bytes());
        offset += 8;
        let null_size = self.fields.len().div_ceil(8);
        buf[offset..offset + null_size].fill(0);
        for (i, field) in self.fields.iter().enumerate() {
            if field.is_null() {
                buf[offset + i / 8] |= 1 << (i % 8);
            }
        }
        offset += null_size;
        for (i, field) in self.fields.iter().enumerate() {
            offset += field.serialize_to(&mut buf[offset..], schema.column(i)) as usize;
        }
        offset as u32
    }

    /// Fills `self.fields` from a serialized image. The stored `RowId`
    /// bytes are skipped; the authoritative rid is the slot the tuple
    /// was read from.
    pub fn deserialize_from(&mut self, buf: &[u8], schema: &Schema) -> u32 {
        let mut offset = 8usize;
        let null_size = schema.column_count().div_ceil(8);
        let bitmap = &buf[offset..offset + null_size];
        offset += null_size;
        self.fields.clear();
        for i in 0..schema.column_count() {
            let is_null = bitmap[i / 8] & (1 << (i % 8)) != 0;
            let (field, n) = Field::deserialize_from(&buf[offset..], schema.column(i), is_null);
            offset += n as usize;
            self.fields.push(field);
        }
        offset as u32
    }

    pub fn serialized_size(&self, schema: &Schema) -> u32 {
        assert_eq!(
            schema.column_count(),
            self.fields.len(),
            "fields do not match the schema"
        );
        (8 + schema.fixed_row_size()) as u32
    }

    /// Projects the key columns of `key_schema` out of a row laid out by
    /// `schema`.
    pub fn key_from_row(&self, schema: &Schema, key_schema: &Schema) -> DbResult<Row> {
        let mut fields = Vec::with_capacity(key_schema.column_count());
        for column in key_schema.columns() {
            let idx = schema.column_index(column.name())?;
            fields.push(self.fields[idx].clone());
        }
        Ok(Row::new(fields))
    }

    /// Serializes a key row as `null-bitmap | fields` (no rid); this is
    /// the byte form B+tree nodes store and compare.
    pub fn serialize_key(&self, key_schema: &Schema) -> Vec<u8> {
        let mut buf = vec![0u8; key_schema.fixed_row_size()];
        let null_size = self.fields.len().div_ceil(8);
        for (i, field) in self.fields.iter().enumerate() {
            if field.is_null() {
                buf[i / 8] |= 1 << (i % 8);
            }
        }
        let mut offset = null_size;
        for (i, field) in self.fields.iter().enumerate() {
            offset += field.serialize_to(&mut buf[offset..], key_schema.column(i)) as usize;
        }
        buf
    }
}

/// Shared handle used where a component borrows a schema it does not
/// own.
pub type SchemaRef = Arc<Schema>;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schema() -> Schema {
        Schema::new(vec![
            Column::new("id", TypeId::Int, 0, false, true),
            Column::with_length("name", 16, 1, true, false),
            Column::new("account", TypeId::Float, 2, true, false),
        ])
    }

    #[test]
    fn row_serialization_round_trip() {
        let schema = sample_schema();
        let row = Row::new(vec![
            Field::Int(42),
            Field::Char("alice".to_string()),
            Field::Float(3.5),
        ]);
        let mut buf = vec![0u8; row.serialized_size(&schema) as usize];
        let written = row.serialize_to(&mut buf, &schema);
        assert_eq!(written as usize, buf.len());

        let mut out = Row::with_rid(RowId::new(2, 0));
        let read = out.deserialize_from(&buf, &schema);
        assert_eq!(read, written);
        assert_eq!(out.fields(), row.fields());
        assert_eq!(out.rid(), RowId::new(2, 0));
    }

    #[test]
    fn null_fields_round_trip() {
        let schema = sample_schema();
        let row = Row::new(vec![
            Field::Int(7),
            Field::Null(TypeId::Char),
            Field::Null(TypeId::Float),
        ]);
        let mut buf = vec![0u8; row.serialized_size(&schema) as usize];
        row.serialize_to(&mut buf, &schema);

        let mut out = Row::with_rid(RowId::new(2, 1));
        out.deserialize_from(&buf, &schema);
        assert!(out.field(1).is_null());
        assert!(out.field(2).is_null());
        assert_eq!(out.field(0), &Field::Int(7));
    }

    #[test]
    fn schema_serialization_round_trip() {
        let schema = sample_schema();
        let mut buf = vec![0u8; schema.serialized_size() as usize];
        let written = schema.serialize_to(&mut buf);
        assert_eq!(written, schema.serialized_size());

        let (out, read) = Schema::deserialize_from(&buf);
        assert_eq!(read, written);
        assert_eq!(out, schema);
    }

    #[test]
    fn column_index_reports_missing_names() {
        let schema = sample_schema();
        assert_eq!(schema.column_index("name").unwrap(), 1);
        assert!(matches!(
            schema.column_index("age"),
            Err(DbError::ColumnNameNotExist)
        ));
    }

    #[test]
    fn key_projection_and_comparison() {
        let schema = sample_schema();
        let key_schema = Schema::new(vec![
            Column::new("id", TypeId::Int, 0, false, true),
            Column::with_length("name", 16, 1, true, false),
        ]);
        let row = Row::new(vec![
            Field::Int(5),
            Field::Char("bob".to_string()),
            Field::Float(1.0),
        ]);
        let key_row = row.key_from_row(&schema, &key_schema).unwrap();
        assert_eq!(key_row.fields().len(), 2);

        let key = key_row.serialize_key(&key_schema);
        assert_eq!(key.len(), key_schema.fixed_row_size());
    }

    #[test]
    fn field_ordering_places_null_first() {
        assert_eq!(
            Field::Null(TypeId::Int).compare(&Field::Int(-100)),
            Ordering::Less
        );
        assert_eq!(Field::Int(3).compare(&Field::Int(3)), Ordering::Equal);
        assert_eq!(
            Field::Char("b".into()).compare(&Field::Char("a".into())),
            Ordering::Greater
        );
    }
}
