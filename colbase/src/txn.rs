//! Transaction runtime
//!
//! A transaction is a cursor over one collection, valid only inside the
//! user callback that received it. It owns a working bitmap (the current
//! row-set, cloned from the collection's master fill bitmap at start) and
//! one commit queue per touched column. Predicate operators narrow the
//! working bitmap; typed accessors read the live column store and stage
//! mutations onto the queues; the collection applies or drops the queues
//! when the callback returns.
//!
//! All state lives behind `RefCell` so predicate chaining, iteration and
//! accessors compose on a shared `&Txn`. The transaction handle must not
//! be shared across threads; `RefCell` makes the type `!Sync`, so the
//! compiler enforces the contract.

use std::cell::RefCell;
use std::marker::PhantomData;

use ahash::AHashMap;

use crate::bitmap::Bitmap;
use crate::collection::Collection;
use crate::column::{Kind, Scalar};
use crate::commit::{OpCode, Queue};
use crate::data::Value;
use crate::{Error, Result};

// ============================================================================
// Pooled buffers
// ============================================================================

/// Reusable per-transaction state, recycled through the collection's pool
#[derive(Default)]
pub(crate) struct TxnBuffers {
    pub(crate) working: Bitmap,
    pub(crate) aux: Bitmap,
    pub(crate) deletes: Bitmap,
    pub(crate) queues: Vec<Queue>,
    pub(crate) lookup: AHashMap<String, usize>,
    pub(crate) inserts: Vec<u32>,
}

impl TxnBuffers {
    /// Truncate everything, keeping allocations for the next transaction
    pub(crate) fn reset(&mut self) {
        self.working.clear();
        self.aux.clear();
        self.deletes.clear();
        self.lookup.clear();
        self.inserts.clear();
        // queue buffers are kept and rebound lazily by queue_for
    }
}

// ============================================================================
// Transaction
// ============================================================================

/// A transaction over one collection, scoped to a user callback
pub struct Txn<'a> {
    pub(crate) owner: &'a Collection,
    pub(crate) working: RefCell<Bitmap>,
    pub(crate) aux: RefCell<Bitmap>,
    pub(crate) deletes: RefCell<Bitmap>,
    pub(crate) queues: RefCell<Vec<Queue>>,
    pub(crate) lookup: RefCell<AHashMap<String, usize>>,
    pub(crate) inserts: RefCell<Vec<u32>>,
}

impl<'a> Txn<'a> {
    pub(crate) fn new(owner: &'a Collection, buffers: TxnBuffers) -> Self {
        Self {
            owner,
            working: RefCell::new(buffers.working),
            aux: RefCell::new(buffers.aux),
            deletes: RefCell::new(buffers.deletes),
            queues: RefCell::new(buffers.queues),
            lookup: RefCell::new(buffers.lookup),
            inserts: RefCell::new(buffers.inserts),
        }
    }

    pub(crate) fn into_buffers(self) -> TxnBuffers {
        TxnBuffers {
            working: self.working.into_inner(),
            aux: self.aux.into_inner(),
            deletes: self.deletes.into_inner(),
            queues: self.queues.into_inner(),
            lookup: self.lookup.into_inner(),
            inserts: self.inserts.into_inner(),
        }
    }

    /// Queue slot for `name`, binding a fresh queue on first touch
    pub(crate) fn queue_for(&self, name: &str) -> usize {
        if let Some(&slot) = self.lookup.borrow().get(name) {
            return slot;
        }
        let mut lookup = self.lookup.borrow_mut();
        let mut queues = self.queues.borrow_mut();
        let slot = lookup.len();
        if slot == queues.len() {
            queues.push(Queue::with_capacity(256));
        }
        queues[slot].reset(name);
        lookup.insert(name.to_string(), slot);
        slot
    }

    // ========================================================================
    // Row-set predicates
    // ========================================================================

    /// Number of rows in the current selection
    pub fn count(&self) -> usize {
        self.working.borrow().count()
    }

    /// Intersect the selection with each named column's fill bitmap.
    /// A missing column contributes an empty match, clearing the selection.
    pub fn with(&self, names: &[&str]) -> &Self {
        let cols = self.owner.cols.read();
        let mut working = self.working.borrow_mut();
        for name in names {
            match cols.get(*name) {
                Some(col) => working.and(col.fill()),
                None => working.clear(),
            }
        }
        self
    }

    /// Subtract each named column's fill bitmap from the selection.
    /// A missing column contributes an empty match, leaving the selection.
    pub fn without(&self, names: &[&str]) -> &Self {
        let cols = self.owner.cols.read();
        let mut working = self.working.borrow_mut();
        for name in names {
            if let Some(col) = cols.get(*name) {
                working.and_not(col.fill());
            }
        }
        self
    }

    /// Widen the selection by the union of the named columns' fill
    /// bitmaps. A missing column contributes an empty match.
    pub fn union(&self, names: &[&str]) -> &Self {
        let cols = self.owner.cols.read();
        let mut aux = self.aux.borrow_mut();
        aux.clear();
        for name in names {
            if let Some(col) = cols.get(*name) {
                aux.or(col.fill());
            }
        }
        self.working.borrow_mut().or(&aux);
        self
    }

    /// Keep rows whose dynamic value satisfies the predicate
    pub fn with_value<F: FnMut(&Value) -> bool>(&self, name: &str, mut pred: F) -> &Self {
        let cols = self.owner.cols.read();
        let mut working = self.working.borrow_mut();
        match cols.get(name) {
            Some(col) => working.retain(|row| col.value(row).is_some_and(|v| pred(&v))),
            None => working.clear(),
        }
        self
    }

    /// Keep rows whose string value satisfies the predicate
    pub fn with_string<F: FnMut(&str) -> bool>(&self, name: &str, mut pred: F) -> &Self {
        let cols = self.owner.cols.read();
        let mut working = self.working.borrow_mut();
        match cols.get(name) {
            Some(col) => working.retain(|row| col.str_at(row).is_some_and(|v| pred(v))),
            None => working.clear(),
        }
        self
    }

    /// Keep rows whose numeric value, read as f64, satisfies the predicate
    pub fn with_float<F: FnMut(f64) -> bool>(&self, name: &str, mut pred: F) -> &Self {
        let cols = self.owner.cols.read();
        let mut working = self.working.borrow_mut();
        match cols.get(name) {
            Some(col) if col.is_numeric() => {
                working.retain(|row| col.float_at(row).is_some_and(&mut pred))
            }
            _ => working.clear(),
        }
        self
    }

    /// Keep rows whose numeric value, read as i64, satisfies the predicate
    pub fn with_int<F: FnMut(i64) -> bool>(&self, name: &str, mut pred: F) -> &Self {
        let cols = self.owner.cols.read();
        let mut working = self.working.borrow_mut();
        match cols.get(name) {
            Some(col) if col.is_numeric() => {
                working.retain(|row| col.int_at(row).is_some_and(&mut pred))
            }
            _ => working.clear(),
        }
        self
    }

    /// Keep rows whose numeric value, read as u64, satisfies the predicate
    pub fn with_uint<F: FnMut(u64) -> bool>(&self, name: &str, mut pred: F) -> &Self {
        let cols = self.owner.cols.read();
        let mut working = self.working.borrow_mut();
        match cols.get(name) {
            Some(col) if col.is_numeric() => {
                working.retain(|row| col.uint_at(row).is_some_and(&mut pred))
            }
            _ => working.clear(),
        }
        self
    }

    /// Keep rows whose enum value equals `value`, answered from the enum
    /// column's value→rows index without scanning
    pub fn with_enum(&self, name: &str, value: &str) -> &Self {
        let cols = self.owner.cols.read();
        let mut working = self.working.borrow_mut();
        match cols.get(name).and_then(|c| c.as_enum()) {
            Some(col) => match col.rows_with(value) {
                Some(rows) => working.and(rows),
                None => working.clear(),
            },
            None => working.clear(),
        }
        self
    }

    // ========================================================================
    // Iteration
    // ========================================================================

    /// Invoke `f` with every selected row id, in ascending order
    pub fn range<F: FnMut(u32)>(&self, f: F) {
        self.working.borrow().range(f);
    }

    /// Invoke `f` with a row reader for every selected row
    pub fn select<F: FnMut(Selector<'_>)>(&self, mut f: F) {
        self.working.borrow().range(|row| f(Selector { txn: self, row }));
    }

    /// Invoke `f` with a reader over `row` iff the row is occupied
    pub fn select_at<F: FnOnce(Selector<'_>)>(&self, row: u32, f: F) -> bool {
        if !self.owner.fill.read().contains(row) {
            return false;
        }
        f(Selector { txn: self, row });
        true
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Allocate a row (lowest free id first) and invoke `f` to fill it.
    /// The row becomes occupied immediately; a rollback returns its id to
    /// the free pool.
    pub fn insert<F: FnOnce(&Self, u32) -> Result<()>>(&self, f: F) -> Result<u32> {
        let row = self.owner.allocate();
        self.inserts.borrow_mut().push(row);
        f(self, row)?;
        Ok(row)
    }

    /// Insert a row from a column-name → value mapping.
    /// Unknown column names are an error.
    pub fn insert_object<'v, I>(&self, object: I) -> Result<u32>
    where
        I: IntoIterator<Item = (&'v str, Value)>,
    {
        self.insert(|txn, row| {
            let cols = txn.owner.cols.read();
            for (name, value) in object {
                let col = cols
                    .get(name)
                    .ok_or_else(|| Error::ColumnNotFound(name.to_string()))?;
                let slot = txn.queue_for(name);
                col.put_value(&mut txn.queues.borrow_mut()[slot], OpCode::Insert, row, &value)?;
            }
            Ok(())
        })
    }

    /// Stage deletion of `row`; false when the row is not occupied.
    /// The deletion is applied at commit, so reads within this transaction
    /// still observe the row.
    pub fn delete_at(&self, row: u32) -> bool {
        if !self.owner.fill.read().contains(row) {
            return false;
        }
        self.deletes.borrow_mut().set(row);
        let cols = self.owner.cols.read();
        for name in cols.keys() {
            let slot = self.queue_for(name);
            self.queues.borrow_mut()[slot].put_delete(row);
        }
        true
    }

    /// Stage deletion of every selected row
    pub fn delete_all(&self) {
        let working = self.working.borrow();
        working.range(|row| {
            self.delete_at(row);
        });
    }

    /// Stage deletion of every selected row the predicate accepts
    pub fn delete_if<F: FnMut(Selector<'_>) -> bool>(&self, mut pred: F) {
        let working = self.working.borrow();
        working.range(|row| {
            if pred(Selector { txn: self, row }) {
                self.delete_at(row);
            }
        });
    }

    // ========================================================================
    // Typed accessors
    // ========================================================================

    /// Resolve and type-check a numeric accessor. Panics on a missing
    /// column or a kind mismatch: accessor misuse is a programming error
    /// and fails at construction, not first use.
    fn accessor<T: Scalar>(&self, name: &str) -> NumAccessor<'_, T> {
        let cols = self.owner.cols.read();
        let col = cols
            .get(name)
            .unwrap_or_else(|| panic!("column '{}' does not exist", name));
        assert!(
            col.kind() == T::KIND,
            "column '{}' is {}, not {}",
            name,
            col.kind().as_str(),
            T::KIND.as_str()
        );
        drop(cols);
        NumAccessor {
            txn: self,
            name: name.to_string(),
            slot: self.queue_for(name),
            _marker: PhantomData,
        }
    }

    pub fn int8(&self, name: &str) -> NumAccessor<'_, i8> {
        self.accessor(name)
    }

    pub fn int16(&self, name: &str) -> NumAccessor<'_, i16> {
        self.accessor(name)
    }

    pub fn int32(&self, name: &str) -> NumAccessor<'_, i32> {
        self.accessor(name)
    }

    pub fn int64(&self, name: &str) -> NumAccessor<'_, i64> {
        self.accessor(name)
    }

    pub fn uint8(&self, name: &str) -> NumAccessor<'_, u8> {
        self.accessor(name)
    }

    pub fn uint16(&self, name: &str) -> NumAccessor<'_, u16> {
        self.accessor(name)
    }

    pub fn uint32(&self, name: &str) -> NumAccessor<'_, u32> {
        self.accessor(name)
    }

    pub fn uint64(&self, name: &str) -> NumAccessor<'_, u64> {
        self.accessor(name)
    }

    pub fn float32(&self, name: &str) -> NumAccessor<'_, f32> {
        self.accessor(name)
    }

    pub fn float64(&self, name: &str) -> NumAccessor<'_, f64> {
        self.accessor(name)
    }

    /// String accessor over a plain string column
    pub fn string(&self, name: &str) -> StrAccessor<'_> {
        self.str_accessor(name, Kind::Str)
    }

    /// String accessor over an enum column
    pub fn enums(&self, name: &str) -> StrAccessor<'_> {
        self.str_accessor(name, Kind::Enum)
    }

    /// Accessor over the collection's key column. Panics when the
    /// collection has no key column.
    pub fn key(&self) -> StrAccessor<'_> {
        let name = self
            .owner
            .key_col
            .read()
            .clone()
            .unwrap_or_else(|| panic!("collection has no key column"));
        self.str_accessor(&name, Kind::Key)
    }

    fn str_accessor(&self, name: &str, kind: Kind) -> StrAccessor<'_> {
        let cols = self.owner.cols.read();
        let col = cols
            .get(name)
            .unwrap_or_else(|| panic!("column '{}' does not exist", name));
        assert!(
            col.kind() == kind,
            "column '{}' is {}, not {}",
            name,
            col.kind().as_str(),
            kind.as_str()
        );
        drop(cols);
        StrAccessor {
            txn: self,
            name: name.to_string(),
            slot: self.queue_for(name),
        }
    }

    /// Boolean accessor
    pub fn bools(&self, name: &str) -> BoolAccessor<'_> {
        let cols = self.owner.cols.read();
        let col = cols
            .get(name)
            .unwrap_or_else(|| panic!("column '{}' does not exist", name));
        assert!(
            col.kind() == Kind::Bool,
            "column '{}' is {}, not bool",
            name,
            col.kind().as_str()
        );
        drop(cols);
        BoolAccessor {
            txn: self,
            name: name.to_string(),
            slot: self.queue_for(name),
        }
    }
}

// ============================================================================
// Accessors
// ============================================================================

/// Typed handle over one numeric column: reads hit the live store,
/// writes append to the transaction's commit queue
pub struct NumAccessor<'a, T: Scalar> {
    txn: &'a Txn<'a>,
    name: String,
    slot: usize,
    _marker: PhantomData<T>,
}

impl<'a, T: Scalar> NumAccessor<'a, T> {
    /// Read the committed value of `row`
    pub fn get(&self, row: u32) -> Option<T> {
        let cols = self.txn.owner.cols.read();
        let col = cols.get(&self.name)?;
        col.value(row).and_then(|v| T::from_value(&v))
    }

    /// Stage a replacement of `row`'s value
    pub fn set(&self, row: u32, value: T) {
        T::put(
            &mut self.txn.queues.borrow_mut()[self.slot],
            OpCode::Set,
            row,
            value,
        );
    }

    /// Stage a numeric accumulation into `row`'s value
    pub fn add(&self, row: u32, value: T) {
        T::put(
            &mut self.txn.queues.borrow_mut()[self.slot],
            OpCode::Add,
            row,
            value,
        );
    }
}

/// Typed handle over a string-backed column (string, enum or key)
pub struct StrAccessor<'a> {
    txn: &'a Txn<'a>,
    name: String,
    slot: usize,
}

impl<'a> StrAccessor<'a> {
    /// Read the committed value of `row`
    pub fn get(&self, row: u32) -> Option<String> {
        let cols = self.txn.owner.cols.read();
        cols.get(&self.name)?.str_at(row).map(str::to_string)
    }

    /// Stage a replacement of `row`'s value
    pub fn set(&self, row: u32, value: &str) {
        self.txn.queues.borrow_mut()[self.slot].put_string(OpCode::Set, row, value);
    }
}

/// Typed handle over a boolean column
pub struct BoolAccessor<'a> {
    txn: &'a Txn<'a>,
    name: String,
    slot: usize,
}

impl<'a> BoolAccessor<'a> {
    /// Read the committed value of `row`
    pub fn get(&self, row: u32) -> Option<bool> {
        let cols = self.txn.owner.cols.read();
        cols.get(&self.name)?.bool_at(row)
    }

    /// Stage a replacement of `row`'s value
    pub fn set(&self, row: u32, value: bool) {
        self.txn.queues.borrow_mut()[self.slot].put_bool(OpCode::Set, row, value);
    }
}

// ============================================================================
// Selector
// ============================================================================

/// Read-only view over one row, exposing typed reads by column name.
/// Reads on a missing column yield zero values rather than errors.
#[derive(Clone, Copy)]
pub struct Selector<'a> {
    txn: &'a Txn<'a>,
    row: u32,
}

impl<'a> Selector<'a> {
    /// Row id under the cursor
    pub fn row(&self) -> u32 {
        self.row
    }

    /// Dynamic read; `Value::Null` when the column or value is absent
    pub fn value_at(&self, name: &str) -> Value {
        let cols = self.txn.owner.cols.read();
        cols.get(name)
            .and_then(|c| c.value(self.row))
            .unwrap_or(Value::Null)
    }

    /// String read; empty when absent
    pub fn string_at(&self, name: &str) -> String {
        let cols = self.txn.owner.cols.read();
        cols.get(name)
            .and_then(|c| c.str_at(self.row))
            .unwrap_or("")
            .to_string()
    }

    /// Numeric read as f64; zero when absent
    pub fn float_at(&self, name: &str) -> f64 {
        let cols = self.txn.owner.cols.read();
        cols.get(name)
            .and_then(|c| c.float_at(self.row))
            .unwrap_or(0.0)
    }

    /// Numeric read as i64; zero when absent
    pub fn int_at(&self, name: &str) -> i64 {
        let cols = self.txn.owner.cols.read();
        cols.get(name).and_then(|c| c.int_at(self.row)).unwrap_or(0)
    }

    /// Numeric read as u64; zero when absent
    pub fn uint_at(&self, name: &str) -> u64 {
        let cols = self.txn.owner.cols.read();
        cols.get(name).and_then(|c| c.uint_at(self.row)).unwrap_or(0)
    }

    /// Boolean read; false when absent
    pub fn bool_at(&self, name: &str) -> bool {
        let cols = self.txn.owner.cols.read();
        cols.get(name)
            .and_then(|c| c.bool_at(self.row))
            .unwrap_or(false)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::Column;

    fn fixture() -> Collection {
        let c = Collection::new();
        c.create_column("i", Column::for_i32()).unwrap();
        c.create_column("u", Column::for_u8()).unwrap();
        c.create_column("f", Column::for_f32()).unwrap();
        c
    }

    #[test]
    fn test_narrow_scalar_accessors() {
        let c = fixture();
        c.query(|txn| {
            for n in 0..10 {
                txn.insert(|txn, row| {
                    txn.int32("i").set(row, -(n as i32));
                    txn.uint8("u").set(row, n as u8);
                    txn.float32("f").set(row, n as f32 / 2.0);
                    Ok(())
                })?;
            }
            Ok(())
        })
        .unwrap();

        c.query(|txn| {
            assert_eq!(txn.int32("i").get(9), Some(-9));
            assert_eq!(txn.uint8("u").get(9), Some(9));
            assert_eq!(txn.float32("f").get(1), Some(0.5));
            assert_eq!(txn.with_int("i", |v| v <= -5).count(), 5);
            Ok(())
        })
        .unwrap();
        c.query(|txn| {
            assert_eq!(txn.with_uint("u", |v| v < 3).count(), 3);
            Ok(())
        })
        .unwrap();
        c.query(|txn| {
            assert_eq!(txn.with_float("f", |v| v >= 2.0).count(), 6);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_add_accumulates_across_commits() {
        let c = fixture();
        c.query(|txn| {
            for n in 0..4 {
                txn.insert(|txn, row| {
                    txn.uint8("u").set(row, n as u8);
                    Ok(())
                })?;
            }
            Ok(())
        })
        .unwrap();

        c.query(|txn| {
            let u = txn.uint8("u");
            txn.range(|row| u.add(row, 10));
            Ok(())
        })
        .unwrap();
        c.query(|txn| {
            assert_eq!(txn.uint8("u").get(0), Some(10));
            assert_eq!(txn.uint8("u").get(3), Some(13));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_queue_slots_bind_per_column() {
        let c = fixture();
        c.query(|txn| {
            let a = txn.queue_for("i");
            let b = txn.queue_for("u");
            assert_ne!(a, b);
            assert_eq!(txn.queue_for("i"), a);
            Ok(())
        })
        .unwrap();
    }
}
