//! Typed column containers
//!
//! One container per attribute. Every column owns a fill bitmap (one bit
//! per row indicating value presence) and a dense value store addressed by
//! row id. Mutations never touch the store directly: they arrive as a
//! commit queue which `apply` replays under the collection's writer lock.
//!
//! The set of containers is sealed: scalars for every fixed-width numeric
//! type, strings, enums (with a value→rows equality index), a single key
//! column per collection (with a key→row map), and computed index columns
//! derived from a predicate over another column.

use std::sync::Arc;

use ahash::AHashMap;

use crate::bitmap::Bitmap;
use crate::commit::{OpCode, Queue};
use crate::data::Value;
use crate::{Error, Result};

/// Predicate of a computed index column, evaluated against one cell
pub type IndexPredicate = Arc<dyn for<'a> Fn(CellReader<'a>) -> bool + Send + Sync>;

// ============================================================================
// Type tags
// ============================================================================

/// Type tag of a column container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Str,
    Enum,
    Key,
    Index,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Bool => "bool",
            Kind::I8 => "int8",
            Kind::I16 => "int16",
            Kind::I32 => "int32",
            Kind::I64 => "int64",
            Kind::U8 => "uint8",
            Kind::U16 => "uint16",
            Kind::U32 => "uint32",
            Kind::U64 => "uint64",
            Kind::F32 => "float32",
            Kind::F64 => "float64",
            Kind::Str => "string",
            Kind::Enum => "enum",
            Kind::Key => "key",
            Kind::Index => "index",
        }
    }
}

// ============================================================================
// Scalar element types
// ============================================================================

/// A fixed-width element storable in a scalar column
pub trait Scalar: Copy + Default + PartialEq + Send + Sync + 'static {
    const KIND: Kind;

    /// Append this value to a commit queue
    fn put(q: &mut Queue, op: OpCode, row: u32, value: Self);
    /// Recover the value from its queue bit pattern
    fn from_bits(bits: u64) -> Self;
    /// Numeric accumulation (wrapping for integers)
    fn accumulate(self, other: Self) -> Self;
    /// Coerce from a dynamic value
    fn from_value(v: &Value) -> Option<Self>;
    /// Convert into a dynamic value
    fn into_value(self) -> Value;

    fn to_f64(self) -> f64;
    fn to_i64(self) -> i64;
    fn to_u64(self) -> u64;
}

macro_rules! impl_scalar_int {
    ($t:ty, $kind:expr, $put:ident, $bits:ty, $value:ident, $from:ident) => {
        impl Scalar for $t {
            const KIND: Kind = $kind;

            #[inline]
            fn put(q: &mut Queue, op: OpCode, row: u32, value: Self) {
                q.$put(op, row, value);
            }

            #[inline]
            fn from_bits(bits: u64) -> Self {
                bits as $bits as $t
            }

            #[inline]
            fn accumulate(self, other: Self) -> Self {
                self.wrapping_add(other)
            }

            #[inline]
            fn from_value(v: &Value) -> Option<Self> {
                v.$from().map(|n| n as $t)
            }

            #[inline]
            fn into_value(self) -> Value {
                Value::$value(self as _)
            }

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }

            #[inline]
            fn to_i64(self) -> i64 {
                self as i64
            }

            #[inline]
            fn to_u64(self) -> u64 {
                self as u64
            }
        }
    };
}

impl_scalar_int!(i8, Kind::I8, put_i8, u8, Int, as_i64);
impl_scalar_int!(i16, Kind::I16, put_i16, u16, Int, as_i64);
impl_scalar_int!(i32, Kind::I32, put_i32, u32, Int, as_i64);
impl_scalar_int!(i64, Kind::I64, put_i64, u64, Int, as_i64);
impl_scalar_int!(u8, Kind::U8, put_u8, u8, Uint, as_u64);
impl_scalar_int!(u16, Kind::U16, put_u16, u16, Uint, as_u64);
impl_scalar_int!(u32, Kind::U32, put_u32, u32, Uint, as_u64);
impl_scalar_int!(u64, Kind::U64, put_u64, u64, Uint, as_u64);

macro_rules! impl_scalar_float {
    ($t:ty, $kind:expr, $put:ident, $bits:ty) => {
        impl Scalar for $t {
            const KIND: Kind = $kind;

            #[inline]
            fn put(q: &mut Queue, op: OpCode, row: u32, value: Self) {
                q.$put(op, row, value);
            }

            #[inline]
            fn from_bits(bits: u64) -> Self {
                <$t>::from_bits(bits as $bits)
            }

            #[inline]
            fn accumulate(self, other: Self) -> Self {
                self + other
            }

            #[inline]
            fn from_value(v: &Value) -> Option<Self> {
                v.as_f64().map(|n| n as $t)
            }

            #[inline]
            fn into_value(self) -> Value {
                Value::Float(self as f64)
            }

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }

            #[inline]
            fn to_i64(self) -> i64 {
                self as i64
            }

            #[inline]
            fn to_u64(self) -> u64 {
                self as u64
            }
        }
    };
}

impl_scalar_float!(f32, Kind::F32, put_f32, u32);
impl_scalar_float!(f64, Kind::F64, put_f64, u64);

// ============================================================================
// Containers
// ============================================================================

/// Dense store of one fixed-width attribute plus its fill bitmap
#[derive(Debug, Clone, Default)]
pub struct ScalarColumn<T> {
    fill: Bitmap,
    data: Vec<T>,
}

impl<T: Scalar> ScalarColumn<T> {
    fn new() -> Self {
        Self {
            fill: Bitmap::new(),
            data: Vec::new(),
        }
    }

    /// Ensure the dense store covers `row`, growing by doubling
    fn grow(&mut self, row: u32) {
        let row = row as usize;
        if row >= self.data.len() {
            let cap = (row + 1).max(self.data.len() * 2);
            self.data.resize(cap, T::default());
        }
    }

    fn set(&mut self, row: u32, value: T) {
        self.grow(row);
        self.data[row as usize] = value;
        self.fill.set(row);
    }

    fn add(&mut self, row: u32, value: T) {
        self.grow(row);
        let base = if self.fill.contains(row) {
            self.data[row as usize]
        } else {
            T::default()
        };
        self.data[row as usize] = base.accumulate(value);
        self.fill.set(row);
    }

    fn value(&self, row: u32) -> Option<T> {
        if self.fill.contains(row) {
            Some(self.data[row as usize])
        } else {
            None
        }
    }

    /// Coerce a dynamic value and stage it; `None` on a type mismatch
    fn stage_value(&self, queue: &mut Queue, op: OpCode, row: u32, value: &Value) -> Option<()> {
        let v = T::from_value(value)?;
        T::put(queue, op, row, v);
        Some(())
    }

    fn apply(&mut self, queue: &Queue) {
        for e in queue.reader() {
            match e.op {
                OpCode::Set | OpCode::Insert => self.set(e.row, T::from_bits(e.bits())),
                OpCode::Add => self.add(e.row, T::from_bits(e.bits())),
                // the slot is not zeroed, only the fill bit is cleared
                OpCode::Delete => self.fill.remove(e.row),
            }
        }
    }
}

/// Boolean column: the value store is itself a bitmap
#[derive(Debug, Clone, Default)]
pub struct BoolColumn {
    fill: Bitmap,
    data: Bitmap,
}

impl BoolColumn {
    fn set(&mut self, row: u32, value: bool) {
        if value {
            self.data.set(row);
        } else {
            self.data.remove(row);
        }
        self.fill.set(row);
    }

    fn value(&self, row: u32) -> Option<bool> {
        if self.fill.contains(row) {
            Some(self.data.contains(row))
        } else {
            None
        }
    }

    fn apply(&mut self, queue: &Queue) {
        for e in queue.reader() {
            match e.op {
                OpCode::Set | OpCode::Insert => self.set(e.row, e.as_bool()),
                OpCode::Add => {} // booleans only support Set
                OpCode::Delete => self.fill.remove(e.row),
            }
        }
    }
}

/// Dense store of one string attribute plus its fill bitmap
#[derive(Debug, Clone, Default)]
pub struct StringColumn {
    fill: Bitmap,
    data: Vec<String>,
}

impl StringColumn {
    fn grow(&mut self, row: u32) {
        let row = row as usize;
        if row >= self.data.len() {
            let cap = (row + 1).max(self.data.len() * 2);
            self.data.resize_with(cap, String::new);
        }
    }

    fn set(&mut self, row: u32, value: &str) {
        self.grow(row);
        let slot = &mut self.data[row as usize];
        slot.clear();
        slot.push_str(value);
        self.fill.set(row);
    }

    fn value(&self, row: u32) -> Option<&str> {
        if self.fill.contains(row) {
            Some(self.data[row as usize].as_str())
        } else {
            None
        }
    }

    fn apply(&mut self, queue: &Queue) {
        for e in queue.reader() {
            match e.op {
                OpCode::Set | OpCode::Insert => self.set(e.row, e.as_str()),
                OpCode::Add => {} // strings only support Set
                OpCode::Delete => self.fill.remove(e.row),
            }
        }
    }
}

/// String column with a value→rows index for equality predicates
#[derive(Debug, Clone, Default)]
pub struct EnumColumn {
    fill: Bitmap,
    data: Vec<String>,
    index: AHashMap<String, Bitmap>,
}

impl EnumColumn {
    fn grow(&mut self, row: u32) {
        let row = row as usize;
        if row >= self.data.len() {
            let cap = (row + 1).max(self.data.len() * 2);
            self.data.resize_with(cap, String::new);
        }
    }

    /// Drop `row` from the bucket of its current value
    fn unindex(&mut self, row: u32) {
        if self.fill.contains(row) {
            let old = &self.data[row as usize];
            let emptied = match self.index.get_mut(old) {
                Some(rows) => {
                    rows.remove(row);
                    rows.is_empty()
                }
                None => false,
            };
            if emptied {
                self.index.remove(old);
            }
        }
    }

    fn set(&mut self, row: u32, value: &str) {
        self.grow(row);
        self.unindex(row);
        let slot = &mut self.data[row as usize];
        slot.clear();
        slot.push_str(value);
        self.index.entry(value.to_string()).or_default().set(row);
        self.fill.set(row);
    }

    fn delete(&mut self, row: u32) {
        self.unindex(row);
        self.fill.remove(row);
    }

    fn value(&self, row: u32) -> Option<&str> {
        if self.fill.contains(row) {
            Some(self.data[row as usize].as_str())
        } else {
            None
        }
    }

    /// Rows whose value equals `value`
    pub fn rows_with(&self, value: &str) -> Option<&Bitmap> {
        self.index.get(value)
    }

    fn apply(&mut self, queue: &Queue) {
        for e in queue.reader() {
            match e.op {
                OpCode::Set | OpCode::Insert => self.set(e.row, e.as_str()),
                OpCode::Add => {}
                OpCode::Delete => self.delete(e.row),
            }
        }
    }
}

/// Unique string column with a key→row map, enabling upsert by key
#[derive(Debug, Clone, Default)]
pub struct KeyColumn {
    fill: Bitmap,
    data: Vec<String>,
    index: AHashMap<String, u32>,
}

impl KeyColumn {
    fn grow(&mut self, row: u32) {
        let row = row as usize;
        if row >= self.data.len() {
            let cap = (row + 1).max(self.data.len() * 2);
            self.data.resize_with(cap, String::new);
        }
    }

    fn set(&mut self, row: u32, value: &str) {
        self.grow(row);
        if self.fill.contains(row) {
            let old = &self.data[row as usize];
            if self.index.get(old) == Some(&row) {
                let old = old.clone();
                self.index.remove(&old);
            }
        }
        let slot = &mut self.data[row as usize];
        slot.clear();
        slot.push_str(value);
        self.index.insert(value.to_string(), row);
        self.fill.set(row);
    }

    fn delete(&mut self, row: u32) {
        if self.fill.contains(row) {
            let key = &self.data[row as usize];
            if self.index.get(key) == Some(&row) {
                let key = key.clone();
                self.index.remove(&key);
            }
        }
        self.fill.remove(row);
    }

    fn value(&self, row: u32) -> Option<&str> {
        if self.fill.contains(row) {
            Some(self.data[row as usize].as_str())
        } else {
            None
        }
    }

    /// Row currently holding `key`
    pub fn row_of(&self, key: &str) -> Option<u32> {
        self.index.get(key).copied()
    }

    fn apply(&mut self, queue: &Queue) {
        for e in queue.reader() {
            match e.op {
                OpCode::Set | OpCode::Insert => self.set(e.row, e.as_str()),
                OpCode::Add => {}
                OpCode::Delete => self.delete(e.row),
            }
        }
    }
}

/// Derived boolean column: membership is defined by a predicate over a
/// source column and recomputed over the rows a transaction touched
pub struct IndexColumn {
    fill: Bitmap,
    source: String,
    predicate: IndexPredicate,
}

impl std::fmt::Debug for IndexColumn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexColumn")
            .field("source", &self.source)
            .field("count", &self.fill.count())
            .finish()
    }
}

impl IndexColumn {
    /// Name of the source column the predicate reads
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Re-evaluate the predicate over `rows` against the source column
    pub(crate) fn refresh(&mut self, source: &Column, rows: &Bitmap) {
        rows.range(|row| {
            if source.contains(row) && (self.predicate)(CellReader { col: source, row }) {
                self.fill.set(row);
            } else {
                self.fill.remove(row);
            }
        });
    }

    fn apply(&mut self, queue: &Queue) {
        for e in queue.reader() {
            // membership is derived; only deletions reach an index directly
            if e.op == OpCode::Delete {
                self.fill.remove(e.row);
            }
        }
    }
}

// ============================================================================
// Column
// ============================================================================

/// A named, typed column container
#[derive(Debug)]
pub enum Column {
    Bool(BoolColumn),
    I8(ScalarColumn<i8>),
    I16(ScalarColumn<i16>),
    I32(ScalarColumn<i32>),
    I64(ScalarColumn<i64>),
    U8(ScalarColumn<u8>),
    U16(ScalarColumn<u16>),
    U32(ScalarColumn<u32>),
    U64(ScalarColumn<u64>),
    F32(ScalarColumn<f32>),
    F64(ScalarColumn<f64>),
    Str(StringColumn),
    Enum(EnumColumn),
    Key(KeyColumn),
    Index(IndexColumn),
}

/// Dispatch over every container variant
macro_rules! dispatch {
    ($self:expr, $c:ident => $body:expr) => {
        match $self {
            Column::Bool($c) => $body,
            Column::I8($c) => $body,
            Column::I16($c) => $body,
            Column::I32($c) => $body,
            Column::I64($c) => $body,
            Column::U8($c) => $body,
            Column::U16($c) => $body,
            Column::U32($c) => $body,
            Column::U64($c) => $body,
            Column::F32($c) => $body,
            Column::F64($c) => $body,
            Column::Str($c) => $body,
            Column::Enum($c) => $body,
            Column::Key($c) => $body,
            Column::Index($c) => $body,
        }
    };
}

/// Dispatch over the numeric container variants only
macro_rules! dispatch_numeric {
    ($self:expr, $c:ident => $body:expr, _ => $else:expr) => {
        match $self {
            Column::I8($c) => $body,
            Column::I16($c) => $body,
            Column::I32($c) => $body,
            Column::I64($c) => $body,
            Column::U8($c) => $body,
            Column::U16($c) => $body,
            Column::U32($c) => $body,
            Column::U64($c) => $body,
            Column::F32($c) => $body,
            Column::F64($c) => $body,
            _ => $else,
        }
    };
}

impl Column {
    // ========================================================================
    // Constructors
    // ========================================================================

    pub fn for_bool() -> Self {
        Column::Bool(BoolColumn::default())
    }

    pub fn for_i8() -> Self {
        Column::I8(ScalarColumn::new())
    }

    pub fn for_i16() -> Self {
        Column::I16(ScalarColumn::new())
    }

    pub fn for_i32() -> Self {
        Column::I32(ScalarColumn::new())
    }

    pub fn for_i64() -> Self {
        Column::I64(ScalarColumn::new())
    }

    pub fn for_u8() -> Self {
        Column::U8(ScalarColumn::new())
    }

    pub fn for_u16() -> Self {
        Column::U16(ScalarColumn::new())
    }

    pub fn for_u32() -> Self {
        Column::U32(ScalarColumn::new())
    }

    pub fn for_u64() -> Self {
        Column::U64(ScalarColumn::new())
    }

    pub fn for_f32() -> Self {
        Column::F32(ScalarColumn::new())
    }

    pub fn for_f64() -> Self {
        Column::F64(ScalarColumn::new())
    }

    pub fn for_string() -> Self {
        Column::Str(StringColumn::default())
    }

    pub fn for_enum() -> Self {
        Column::Enum(EnumColumn::default())
    }

    pub fn for_key() -> Self {
        Column::Key(KeyColumn::default())
    }

    pub fn for_index(source: &str, predicate: IndexPredicate) -> Self {
        Column::Index(IndexColumn {
            fill: Bitmap::new(),
            source: source.to_string(),
            predicate,
        })
    }

    // ========================================================================
    // Capabilities
    // ========================================================================

    /// Type tag of this container
    pub fn kind(&self) -> Kind {
        match self {
            Column::Bool(_) => Kind::Bool,
            Column::I8(_) => Kind::I8,
            Column::I16(_) => Kind::I16,
            Column::I32(_) => Kind::I32,
            Column::I64(_) => Kind::I64,
            Column::U8(_) => Kind::U8,
            Column::U16(_) => Kind::U16,
            Column::U32(_) => Kind::U32,
            Column::U64(_) => Kind::U64,
            Column::F32(_) => Kind::F32,
            Column::F64(_) => Kind::F64,
            Column::Str(_) => Kind::Str,
            Column::Enum(_) => Kind::Enum,
            Column::Key(_) => Kind::Key,
            Column::Index(_) => Kind::Index,
        }
    }

    /// Fill bitmap: which rows currently hold a value
    pub fn fill(&self) -> &Bitmap {
        dispatch!(self, c => &c.fill)
    }

    /// Ensure the dense store covers rows `0..cap`
    pub fn grow(&mut self, cap: u32) {
        if cap == 0 {
            return;
        }
        match self {
            Column::Bool(_) | Column::Index(_) => {} // bitmaps grow on demand
            Column::I8(c) => c.grow(cap - 1),
            Column::I16(c) => c.grow(cap - 1),
            Column::I32(c) => c.grow(cap - 1),
            Column::I64(c) => c.grow(cap - 1),
            Column::U8(c) => c.grow(cap - 1),
            Column::U16(c) => c.grow(cap - 1),
            Column::U32(c) => c.grow(cap - 1),
            Column::U64(c) => c.grow(cap - 1),
            Column::F32(c) => c.grow(cap - 1),
            Column::F64(c) => c.grow(cap - 1),
            Column::Str(c) => c.grow(cap - 1),
            Column::Enum(c) => c.grow(cap - 1),
            Column::Key(c) => c.grow(cap - 1),
        }
    }

    /// Whether `row` holds a value (for index columns: is a member)
    #[inline]
    pub fn contains(&self, row: u32) -> bool {
        self.fill().contains(row)
    }

    /// Replay a commit queue onto this container
    pub fn apply(&mut self, queue: &Queue) {
        dispatch!(self, c => c.apply(queue))
    }

    /// Dynamic read of one cell
    pub fn value(&self, row: u32) -> Option<Value> {
        match self {
            Column::Bool(c) => c.value(row).map(Value::Bool),
            Column::Str(c) => c.value(row).map(Value::from),
            Column::Enum(c) => c.value(row).map(Value::from),
            Column::Key(c) => c.value(row).map(Value::from),
            // a computed index always answers with its membership
            Column::Index(c) => Some(Value::Bool(c.fill.contains(row))),
            other => {
                dispatch_numeric!(other, c => c.value(row).map(Scalar::into_value), _ => None)
            }
        }
    }

    // ========================================================================
    // Typed reads
    // ========================================================================

    /// Numeric read as f64, for any fixed-width numeric container
    pub fn float_at(&self, row: u32) -> Option<f64> {
        dispatch_numeric!(self, c => c.value(row).map(Scalar::to_f64), _ => None)
    }

    /// Numeric read as i64
    pub fn int_at(&self, row: u32) -> Option<i64> {
        dispatch_numeric!(self, c => c.value(row).map(Scalar::to_i64), _ => None)
    }

    /// Numeric read as u64
    pub fn uint_at(&self, row: u32) -> Option<u64> {
        dispatch_numeric!(self, c => c.value(row).map(Scalar::to_u64), _ => None)
    }

    /// String read, for string-backed containers
    pub fn str_at(&self, row: u32) -> Option<&str> {
        match self {
            Column::Str(c) => c.value(row),
            Column::Enum(c) => c.value(row),
            Column::Key(c) => c.value(row),
            _ => None,
        }
    }

    /// Boolean read, for bool and index containers
    pub fn bool_at(&self, row: u32) -> Option<bool> {
        match self {
            Column::Bool(c) => c.value(row),
            Column::Index(c) => Some(c.fill.contains(row)),
            _ => None,
        }
    }

    /// Whether this container supports numeric reads
    pub fn is_numeric(&self) -> bool {
        dispatch_numeric!(self, _c => true, _ => false)
    }

    /// Stage a dynamic value into a queue, coercing to this column's type
    pub(crate) fn put_value(
        &self,
        queue: &mut Queue,
        op: OpCode,
        row: u32,
        value: &Value,
    ) -> Result<()> {
        fn mismatch(col: &Column, value: &Value) -> Error {
            Error::InvalidDataType(format!(
                "cannot store {:?} in a {} column",
                value,
                col.kind().as_str()
            ))
        }

        match self {
            Column::Bool(_) => {
                let v = value.as_bool().ok_or_else(|| mismatch(self, value))?;
                queue.put_bool(op, row, v);
            }
            Column::Str(_) | Column::Enum(_) | Column::Key(_) => {
                let v = value.as_str().ok_or_else(|| mismatch(self, value))?;
                queue.put_string(op, row, v);
            }
            Column::Index(_) => return Err(mismatch(self, value)),
            other => {
                return dispatch_numeric!(
                    other,
                    c => c
                        .stage_value(queue, op, row, value)
                        .ok_or_else(|| mismatch(other, value)),
                    _ => Err(mismatch(other, value))
                );
            }
        }
        Ok(())
    }

    // ========================================================================
    // Variant access
    // ========================================================================

    pub fn as_enum(&self) -> Option<&EnumColumn> {
        match self {
            Column::Enum(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_key(&self) -> Option<&KeyColumn> {
        match self {
            Column::Key(c) => Some(c),
            _ => None,
        }
    }

    pub(crate) fn as_index_mut(&mut self) -> Option<&mut IndexColumn> {
        match self {
            Column::Index(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_index(&self) -> Option<&IndexColumn> {
        match self {
            Column::Index(c) => Some(c),
            _ => None,
        }
    }
}

// ============================================================================
// Cell reader
// ============================================================================

/// Read-only view of one cell, handed to index predicates
#[derive(Clone, Copy)]
pub struct CellReader<'a> {
    col: &'a Column,
    row: u32,
}

impl<'a> CellReader<'a> {
    pub(crate) fn new(col: &'a Column, row: u32) -> Self {
        Self { col, row }
    }

    /// Row id of this cell
    pub fn row(&self) -> u32 {
        self.row
    }

    /// Numeric read as f64; zero when absent or non-numeric
    pub fn float(&self) -> f64 {
        self.col.float_at(self.row).unwrap_or(0.0)
    }

    /// Numeric read as i64; zero when absent or non-numeric
    pub fn int(&self) -> i64 {
        self.col.int_at(self.row).unwrap_or(0)
    }

    /// Numeric read as u64; zero when absent or non-numeric
    pub fn uint(&self) -> u64 {
        self.col.uint_at(self.row).unwrap_or(0)
    }

    /// String read; empty when absent or non-string
    pub fn string(&self) -> &'a str {
        self.col.str_at(self.row).unwrap_or("")
    }

    /// Boolean read; false when absent or non-boolean
    pub fn bool(&self) -> bool {
        self.col.bool_at(self.row).unwrap_or(false)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_for(col: &str) -> Queue {
        let mut q = Queue::with_capacity(256);
        q.reset(col);
        q
    }

    #[test]
    fn test_scalar_apply_matches_direct_sets() {
        // replaying an encoded queue equals applying the same sets directly
        let mut staged = Column::for_f64();
        let mut direct = ScalarColumn::<f64>::new();

        let mut q = queue_for("balance");
        for row in 0..10u32 {
            q.put_f64(OpCode::Set, row, row as f64 * 1.5);
            direct.set(row, row as f64 * 1.5);
        }
        staged.apply(&q);

        for row in 0..10u32 {
            assert_eq!(staged.float_at(row), direct.value(row));
        }
        assert_eq!(staged.fill().count(), 10);
    }

    #[test]
    fn test_scalar_add_accumulates() {
        let mut col = Column::for_i64();
        let mut q = queue_for("count");
        q.put_i64(OpCode::Set, 3, 10);
        q.put_i64(OpCode::Add, 3, 5);
        q.put_i64(OpCode::Add, 3, -2);
        col.apply(&q);
        assert_eq!(col.int_at(3), Some(13));
    }

    #[test]
    fn test_add_on_vacant_slot_starts_from_zero() {
        let mut col = Column::for_u32();

        let mut q = queue_for("n");
        q.put_u32(OpCode::Set, 0, 100);
        col.apply(&q);

        // delete leaves the slot value in place but clears the fill bit
        let mut q = queue_for("n");
        q.put_delete(0);
        col.apply(&q);
        assert_eq!(col.uint_at(0), None);

        // a later add must not observe the stale slot value
        let mut q = queue_for("n");
        q.put_u32(OpCode::Add, 0, 7);
        col.apply(&q);
        assert_eq!(col.uint_at(0), Some(7));
    }

    #[test]
    fn test_string_column() {
        let mut col = Column::for_string();
        let mut q = queue_for("name");
        q.put_string(OpCode::Set, 0, "merlin");
        q.put_string(OpCode::Set, 5, "arthur");
        q.put_delete(0);
        col.apply(&q);

        assert_eq!(col.str_at(0), None);
        assert_eq!(col.str_at(5), Some("arthur"));
        assert_eq!(col.fill().count(), 1);
    }

    #[test]
    fn test_bool_column() {
        let mut col = Column::for_bool();
        let mut q = queue_for("active");
        q.put_bool(OpCode::Set, 1, true);
        q.put_bool(OpCode::Set, 2, false);
        col.apply(&q);

        assert_eq!(col.bool_at(1), Some(true));
        assert_eq!(col.bool_at(2), Some(false));
        assert_eq!(col.bool_at(3), None);
        assert_eq!(col.value(2), Some(Value::Bool(false)));
    }

    #[test]
    fn test_enum_index_maintenance() {
        let mut col = Column::for_enum();

        let mut q = queue_for("race");
        q.put_string(OpCode::Set, 0, "elf");
        q.put_string(OpCode::Set, 1, "dwarf");
        q.put_string(OpCode::Set, 2, "elf");
        col.apply(&q);

        let e = col.as_enum().unwrap();
        assert_eq!(e.rows_with("elf").unwrap().count(), 2);
        assert_eq!(e.rows_with("dwarf").unwrap().count(), 1);

        // update moves the row between buckets
        let mut q = queue_for("race");
        q.put_string(OpCode::Set, 0, "dwarf");
        col.apply(&q);
        let e = col.as_enum().unwrap();
        assert_eq!(e.rows_with("elf").unwrap().count(), 1);
        assert_eq!(e.rows_with("dwarf").unwrap().count(), 2);

        // delete drops the row; empty buckets disappear
        let mut q = queue_for("race");
        q.put_delete(2);
        col.apply(&q);
        let e = col.as_enum().unwrap();
        assert!(e.rows_with("elf").is_none());
    }

    #[test]
    fn test_key_map_maintenance() {
        let mut col = Column::for_key();

        let mut q = queue_for("key");
        q.put_string(OpCode::Set, 0, "alpha");
        q.put_string(OpCode::Set, 1, "beta");
        col.apply(&q);

        let k = col.as_key().unwrap();
        assert_eq!(k.row_of("alpha"), Some(0));
        assert_eq!(k.row_of("beta"), Some(1));

        // rekeying a row removes the old mapping
        let mut q = queue_for("key");
        q.put_string(OpCode::Set, 0, "gamma");
        col.apply(&q);
        let k = col.as_key().unwrap();
        assert_eq!(k.row_of("alpha"), None);
        assert_eq!(k.row_of("gamma"), Some(0));

        let mut q = queue_for("key");
        q.put_delete(1);
        col.apply(&q);
        assert_eq!(col.as_key().unwrap().row_of("beta"), None);
    }

    #[test]
    fn test_index_refresh() {
        let mut source = Column::for_f64();
        let mut q = queue_for("balance");
        for row in 0..6u32 {
            q.put_f64(OpCode::Set, row, row as f64 * 1000.0);
        }
        source.apply(&q);

        let mut index = Column::for_index("balance", Arc::new(|r: CellReader| r.float() >= 3000.0));
        let mut rows = Bitmap::new();
        for row in 0..6u32 {
            rows.set(row);
        }
        index.as_index_mut().unwrap().refresh(&source, &rows);
        assert_eq!(index.fill().count(), 3); // 3000, 4000, 5000

        // vacating a source row drops it from the index on the next refresh
        let mut q = queue_for("balance");
        q.put_delete(5);
        source.apply(&q);
        index.as_index_mut().unwrap().refresh(&source, &rows);
        assert_eq!(index.fill().count(), 2);
        assert!(index.contains(3));
        assert!(!index.contains(5));
    }

    #[test]
    fn test_put_value_coercions() {
        let col = Column::for_i16();
        let mut q = queue_for("age");
        col.put_value(&mut q, OpCode::Set, 0, &Value::Int(42)).unwrap();
        assert!(col
            .put_value(&mut q, OpCode::Set, 1, &Value::String("x".into()))
            .is_err());

        let mut col = Column::for_i16();
        col.apply(&q);
        assert_eq!(col.int_at(0), Some(42));

        let scol = Column::for_string();
        let mut q = queue_for("name");
        scol.put_value(&mut q, OpCode::Set, 0, &Value::from("bob")).unwrap();
        assert!(scol.put_value(&mut q, OpCode::Set, 1, &Value::Int(3)).is_err());
    }

    #[test]
    fn test_kind_tags() {
        assert_eq!(Column::for_bool().kind(), Kind::Bool);
        assert_eq!(Column::for_u8().kind().as_str(), "uint8");
        assert!(Column::for_f32().is_numeric());
        assert!(!Column::for_string().is_numeric());
    }
}
