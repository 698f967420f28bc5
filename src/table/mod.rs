//! Relational row layer.
//!
//! Maps typed rows onto the key-value substrate: a [`Table`] binds a
//! [`Schema`] to a [`Db`], serialises each row under its primary-key
//! bytes, and keeps a [`BPlusTree`] index for point and range lookups.
//!
//! ## Contract with the engine
//!
//! - The primary key is encoded **order-preservingly** (big-endian with
//!   a flipped sign bit for integers, raw bytes for text/bytes), so the
//!   LSM's lexicographic key order equals the column's natural order and
//!   B+ tree range scans line up with engine scans.
//! - Rows travel as [`crate::encoding`]-serialised column maps.
//! - On open, the table replays `db.scan(None, None)` to repopulate its
//!   index from the LSM.
//!
//! ## Constraints
//!
//! The layer enforces, **before** touching the LSM: known columns only,
//! type agreement with the schema, no `Null` in non-nullable columns, a
//! present primary key, and primary-key uniqueness.

#[cfg(test)]
mod tests;

use std::sync::RwLock;

use thiserror::Error;
use tracing::{debug, info};

use crate::btree::{BPlusTree, BTreeError, DEFAULT_ORDER};
use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::engine::{Db, EngineError};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by the relational layer.
#[derive(Debug, Error)]
pub enum TableError {
    /// Row references a column the schema does not define.
    #[error("unknown column: {0}")]
    UnknownColumn(String),

    /// `Null` (or absence) in a non-nullable column.
    #[error("null value in non-nullable column: {0}")]
    NullViolation(String),

    /// The row does not provide its primary key.
    #[error("missing primary key column: {0}")]
    MissingPrimaryKey(String),

    /// A row with the same primary key already exists.
    #[error("duplicate primary key")]
    DuplicatePrimaryKey,

    /// Value type disagrees with the column type.
    #[error("type mismatch in column {column}: expected {expected:?}")]
    TypeMismatch {
        column: String,
        expected: ColumnType,
    },

    /// The schema itself is malformed.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    /// Underlying storage engine failure.
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Row (de)serialisation failure.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Index construction failure.
    #[error("Index error: {0}")]
    Index(#[from] BTreeError),

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Schema
// ------------------------------------------------------------------------------------------------

/// Column data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// 64-bit signed integer.
    Integer,
    /// UTF-8 text.
    Text,
    /// Boolean.
    Boolean,
    /// Raw bytes.
    Bytes,
}

/// One column definition.
#[derive(Debug, Clone)]
pub struct Column {
    /// Column name; unique within a schema.
    pub name: String,

    /// Declared type.
    pub ty: ColumnType,

    /// Whether `Null` is allowed. The primary key is never nullable.
    pub nullable: bool,

    /// Whether this column is the primary key.
    pub primary_key: bool,
}

impl Column {
    /// A regular (nullable) column.
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: true,
            primary_key: false,
        }
    }

    /// A non-nullable column.
    pub fn required(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: false,
            primary_key: false,
        }
    }

    /// The primary-key column (implies non-nullable).
    pub fn primary_key(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: false,
            primary_key: true,
        }
    }
}

/// A validated table schema.
#[derive(Debug, Clone)]
pub struct Schema {
    name: String,
    columns: Vec<Column>,
    pk_index: usize,
}

impl Schema {
    /// Builds and validates a schema.
    ///
    /// Requires exactly one primary-key column, a non-nullable primary
    /// key, and unique column names.
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Result<Self, TableError> {
        let name = name.into();

        let pk_columns: Vec<usize> = columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.primary_key)
            .map(|(i, _)| i)
            .collect();
        let pk_index = match pk_columns.as_slice() {
            [single] => *single,
            [] => {
                return Err(TableError::InvalidSchema(
                    "schema needs a primary key column".into(),
                ));
            }
            _ => {
                return Err(TableError::InvalidSchema(
                    "schema must have exactly one primary key column".into(),
                ));
            }
        };

        if columns[pk_index].nullable {
            return Err(TableError::InvalidSchema(
                "primary key column cannot be nullable".into(),
            ));
        }

        for (i, col) in columns.iter().enumerate() {
            if columns[..i].iter().any(|c| c.name == col.name) {
                return Err(TableError::InvalidSchema(format!(
                    "duplicate column name: {}",
                    col.name
                )));
            }
        }

        Ok(Self {
            name,
            columns,
            pk_index,
        })
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Column definitions in declaration order.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// The primary-key column.
    pub fn primary_key_column(&self) -> &Column {
        &self.columns[self.pk_index]
    }

    fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

// ------------------------------------------------------------------------------------------------
// Values and rows
// ------------------------------------------------------------------------------------------------

/// A typed cell value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Explicit SQL-style null.
    Null,
    /// 64-bit signed integer.
    Integer(i64),
    /// UTF-8 text.
    Text(String),
    /// Boolean.
    Boolean(bool),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl Value {
    /// Whether this value matches a declared column type.
    fn matches(&self, ty: ColumnType) -> bool {
        matches!(
            (self, ty),
            (Value::Integer(_), ColumnType::Integer)
                | (Value::Text(_), ColumnType::Text)
                | (Value::Boolean(_), ColumnType::Boolean)
                | (Value::Bytes(_), ColumnType::Bytes)
        )
    }

    /// Order-preserving key encoding.
    ///
    /// Integers flip the sign bit of their big-endian image so that the
    /// byte order equals the numeric order; text and bytes are already
    /// ordered lexicographically.
    fn encode_key(&self) -> Option<Vec<u8>> {
        match self {
            Value::Integer(i) => {
                let mut bytes = i.to_be_bytes();
                bytes[0] ^= 0x80;
                Some(bytes.to_vec())
            }
            Value::Text(s) => Some(s.as_bytes().to_vec()),
            Value::Bytes(b) => Some(b.clone()),
            Value::Boolean(b) => Some(vec![u8::from(*b)]),
            Value::Null => None,
        }
    }
}

impl Encode for Value {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            Value::Null => 0u32.encode_to(buf)?,
            Value::Integer(i) => {
                1u32.encode_to(buf)?;
                i.encode_to(buf)?;
            }
            Value::Text(s) => {
                2u32.encode_to(buf)?;
                s.encode_to(buf)?;
            }
            Value::Boolean(b) => {
                3u32.encode_to(buf)?;
                b.encode_to(buf)?;
            }
            Value::Bytes(b) => {
                4u32.encode_to(buf)?;
                b.encode_to(buf)?;
            }
        }
        Ok(())
    }
}

impl Decode for Value {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (tag, n) = u32::decode_from(buf)?;
        offset += n;
        match tag {
            0 => Ok((Value::Null, offset)),
            1 => {
                let (i, n) = i64::decode_from(&buf[offset..])?;
                Ok((Value::Integer(i), offset + n))
            }
            2 => {
                let (s, n) = String::decode_from(&buf[offset..])?;
                Ok((Value::Text(s), offset + n))
            }
            3 => {
                let (b, n) = bool::decode_from(&buf[offset..])?;
                Ok((Value::Boolean(b), offset + n))
            }
            4 => {
                let (b, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
                Ok((Value::Bytes(b), offset + n))
            }
            _ => Err(EncodingError::InvalidTag {
                tag,
                type_name: "Value",
            }),
        }
    }
}

/// One row: a mapping from column name to value.
///
/// Columns absent from the row are treated as `Null` during validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    cells: Vec<(String, Value)>,
}

impl Row {
    /// An empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style cell assignment.
    pub fn with(mut self, column: impl Into<String>, value: Value) -> Self {
        self.set(column, value);
        self
    }

    /// Sets a cell, replacing any previous value for the column.
    pub fn set(&mut self, column: impl Into<String>, value: Value) {
        let column = column.into();
        if let Some(cell) = self.cells.iter_mut().find(|(name, _)| *name == column) {
            cell.1 = value;
        } else {
            self.cells.push((column, value));
        }
    }

    /// Reads a cell; absent columns read as `None`.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, v)| v)
    }

    /// Column names present in this row.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(name, _)| name.as_str())
    }
}

impl Encode for Row {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        u32::try_from(self.cells.len())
            .map_err(|_| EncodingError::LengthOverflow("row cell count".into()))?
            .encode_to(buf)?;
        for (name, value) in &self.cells {
            name.encode_to(buf)?;
            value.encode_to(buf)?;
        }
        Ok(())
    }
}

impl Decode for Row {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (count, n) = u32::decode_from(buf)?;
        offset += n;
        let mut cells = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (name, n) = String::decode_from(&buf[offset..])?;
            offset += n;
            let (value, n) = Value::decode_from(&buf[offset..])?;
            offset += n;
            cells.push((name, value));
        }
        Ok((Self { cells }, offset))
    }
}

// ------------------------------------------------------------------------------------------------
// Table
// ------------------------------------------------------------------------------------------------

/// A typed table over a [`Db`].
///
/// Owns a B+ tree index mapping primary-key bytes to the serialised row;
/// the index is rebuilt from the LSM at open.
pub struct Table {
    schema: Schema,
    db: Db,
    index: RwLock<BPlusTree>,
}

impl Table {
    /// Binds `schema` to `db`, rebuilding the index from a full scan.
    pub fn open(db: Db, schema: Schema) -> Result<Self, TableError> {
        let mut index = BPlusTree::new(DEFAULT_ORDER)?;

        let mut loaded = 0usize;
        for (key, value) in db.scan(None, None)? {
            index.insert(key, value);
            loaded += 1;
        }

        info!(table = schema.name(), rows = loaded, "table opened");

        Ok(Self {
            schema,
            db,
            index: RwLock::new(index),
        })
    }

    /// The table's schema.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Number of rows.
    pub fn len(&self) -> Result<usize, TableError> {
        Ok(self.read_index()?.len())
    }

    /// Whether the table holds no rows.
    pub fn is_empty(&self) -> Result<bool, TableError> {
        Ok(self.read_index()?.is_empty())
    }

    /// Inserts a row.
    ///
    /// All constraint checks run before the LSM is touched; a rejected
    /// row leaves no trace in the store.
    pub fn insert(&self, row: Row) -> Result<(), TableError> {
        let key = self.validate(&row)?;

        let mut index = self.write_index()?;
        if index.search(&key).is_some() {
            return Err(TableError::DuplicatePrimaryKey);
        }

        let bytes = encoding::encode_to_vec(&row)?;
        self.db.put(key.clone(), bytes.clone())?;
        index.insert(key, bytes);

        debug!(table = self.schema.name(), "row inserted");
        Ok(())
    }

    /// Point lookup by primary-key value.
    pub fn get(&self, pk: &Value) -> Result<Option<Row>, TableError> {
        let key = pk
            .encode_key()
            .ok_or_else(|| TableError::MissingPrimaryKey(self.pk_name().to_string()))?;

        let index = self.read_index()?;
        match index.search(&key) {
            Some(bytes) => {
                let (row, _) = encoding::decode_from_slice::<Row>(bytes)?;
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }

    /// Range lookup by primary-key value, inclusive bounds, `None` open.
    ///
    /// Rows come back in primary-key order.
    pub fn range(&self, lo: Option<&Value>, hi: Option<&Value>) -> Result<Vec<Row>, TableError> {
        let lo_key = match lo {
            Some(v) => Some(
                v.encode_key()
                    .ok_or_else(|| TableError::MissingPrimaryKey(self.pk_name().to_string()))?,
            ),
            None => None,
        };
        let hi_key = match hi {
            Some(v) => Some(
                v.encode_key()
                    .ok_or_else(|| TableError::MissingPrimaryKey(self.pk_name().to_string()))?,
            ),
            None => None,
        };

        let index = self.read_index()?;
        let mut rows = Vec::new();
        for (_, bytes) in index.range_search(lo_key.as_deref(), hi_key.as_deref()) {
            let (row, _) = encoding::decode_from_slice::<Row>(bytes)?;
            rows.push(row);
        }
        Ok(rows)
    }

    /// Deletes a row by primary-key value.
    ///
    /// Returns `true` when a row existed.
    pub fn delete(&self, pk: &Value) -> Result<bool, TableError> {
        let key = pk
            .encode_key()
            .ok_or_else(|| TableError::MissingPrimaryKey(self.pk_name().to_string()))?;

        let mut index = self.write_index()?;
        if !index.mark_deleted(&key) {
            return Ok(false);
        }
        self.db.delete(key)?;

        debug!(table = self.schema.name(), "row deleted");
        Ok(true)
    }

    // --------------------------------------------------------------------------------------------
    // Validation
    // --------------------------------------------------------------------------------------------

    /// Runs all constraint checks and returns the encoded primary key.
    fn validate(&self, row: &Row) -> Result<Vec<u8>, TableError> {
        // Unknown columns and type agreement.
        for (name, value) in &row.cells {
            let Some(column) = self.schema.column(name) else {
                return Err(TableError::UnknownColumn(name.clone()));
            };
            if !matches!(value, Value::Null) && !value.matches(column.ty) {
                return Err(TableError::TypeMismatch {
                    column: name.clone(),
                    expected: column.ty,
                });
            }
        }

        // Null constraints; a missing column counts as null.
        for column in self.schema.columns() {
            let value = row.get(&column.name);
            let is_null = matches!(value, None | Some(Value::Null));
            if is_null && !column.nullable {
                if column.primary_key {
                    return Err(TableError::MissingPrimaryKey(column.name.clone()));
                }
                return Err(TableError::NullViolation(column.name.clone()));
            }
        }

        // Primary key encoding.
        let pk_column = self.schema.primary_key_column();
        let pk_value = row
            .get(&pk_column.name)
            .ok_or_else(|| TableError::MissingPrimaryKey(pk_column.name.clone()))?;
        pk_value
            .encode_key()
            .ok_or_else(|| TableError::MissingPrimaryKey(pk_column.name.clone()))
    }

    fn pk_name(&self) -> &str {
        &self.schema.primary_key_column().name
    }

    fn read_index(&self) -> Result<std::sync::RwLockReadGuard<'_, BPlusTree>, TableError> {
        self.index
            .read()
            .map_err(|_| TableError::Internal("RwLock poisoned".into()))
    }

    fn write_index(&self) -> Result<std::sync::RwLockWriteGuard<'_, BPlusTree>, TableError> {
        self.index
            .write()
            .map_err(|_| TableError::Internal("RwLock poisoned".into()))
    }
}
