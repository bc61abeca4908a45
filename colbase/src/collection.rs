//! Collection - top-level row container
//!
//! Owns the named columns, the master fill bitmap of occupied rows, the
//! free-slot pool for id reuse and the transaction pool. Queries run as
//! callback-scoped transactions: the callback's `Ok` commits every staged
//! queue atomically under the collection's writer lock, its `Err` drops
//! them unapplied.
//!
//! Many read-only transactions may run concurrently; commits serialise on
//! the column-map writer lock, which also excludes readers for the
//! duration of apply plus computed-index re-evaluation.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};

use crate::bitmap::Bitmap;
use crate::column::{CellReader, Column, Kind};
use crate::data::Value;
use crate::txn::{Selector, Txn, TxnBuffers};
use crate::{Error, Result};

// ============================================================================
// Free-slot pool
// ============================================================================

/// Reclaimable row ids, lowest first, plus the capacity watermark
#[derive(Default)]
struct FreeSlots {
    heap: BinaryHeap<Reverse<u32>>,
    next: u32,
}

// ============================================================================
// Collection
// ============================================================================

/// A collection of rows with named, typed columns
#[derive(Default)]
pub struct Collection {
    /// Named column containers
    pub(crate) cols: RwLock<AHashMap<String, Column>>,
    /// Master fill bitmap: which row ids are occupied
    pub(crate) fill: RwLock<Bitmap>,
    /// Name of the key column, when one exists
    pub(crate) key_col: RwLock<Option<String>>,
    /// Free-slot pool
    free: Mutex<FreeSlots>,
    /// Recycled transaction buffers
    pool: Mutex<Vec<TxnBuffers>>,
    /// Serialises upserts so one key never allocates two rows
    upsert: Mutex<()>,
}

impl Collection {
    /// Create an empty collection
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of occupied rows
    pub fn count(&self) -> usize {
        self.fill.read().count()
    }

    // ========================================================================
    // Schema
    // ========================================================================

    /// Add a column. Fails when the name is taken, or when a second key
    /// column is declared.
    pub fn create_column(&self, name: &str, mut column: Column) -> Result<()> {
        let mut cols = self.cols.write();
        if cols.contains_key(name) {
            return Err(Error::ColumnExists(name.to_string()));
        }
        if column.kind() == Kind::Key {
            let mut key_col = self.key_col.write();
            if key_col.is_some() {
                return Err(Error::DuplicateKeyColumn);
            }
            *key_col = Some(name.to_string());
        }
        column.grow(self.free.lock().next);
        log::debug!("creating column '{}' ({})", name, column.kind().as_str());
        cols.insert(name.to_string(), column);
        Ok(())
    }

    /// Declare columns from a sample object: strings become string
    /// columns, booleans bool, signed integers int64, unsigned uint64 and
    /// floats float64.
    pub fn create_columns_of<'v, I>(&self, object: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'v str, Value)>,
    {
        for (name, value) in object {
            let column = match value {
                Value::String(_) => Column::for_string(),
                Value::Bool(_) => Column::for_bool(),
                Value::Int(_) => Column::for_i64(),
                Value::Uint(_) => Column::for_u64(),
                Value::Float(_) => Column::for_f64(),
                Value::Null => {
                    return Err(Error::InvalidDataType(format!(
                        "cannot infer a column type for '{}' from null",
                        name
                    )))
                }
            };
            self.create_column(name, column)?;
        }
        Ok(())
    }

    /// Create a computed index column over `source`, evaluating the
    /// predicate immediately against every occupied row of the source.
    pub fn create_index<F>(&self, name: &str, source: &str, predicate: F) -> Result<()>
    where
        F: for<'x> Fn(CellReader<'x>) -> bool + Send + Sync + 'static,
    {
        let mut cols = self.cols.write();
        if cols.contains_key(name) {
            return Err(Error::ColumnExists(name.to_string()));
        }
        if !cols.contains_key(source) {
            return Err(Error::ColumnNotFound(source.to_string()));
        }

        let mut column = Column::for_index(source, std::sync::Arc::new(predicate));
        let src = &cols[source];
        let rows = src.fill().clone();
        column
            .as_index_mut()
            .expect("freshly built index column")
            .refresh(src, &rows);

        log::debug!("creating index '{}' over '{}'", name, source);
        cols.insert(name.to_string(), column);
        Ok(())
    }

    /// Remove a column and its storage. Unknown names are ignored.
    pub fn drop_column(&self, name: &str) {
        let mut cols = self.cols.write();
        if cols.remove(name).is_some() {
            log::debug!("dropping column '{}'", name);
            let mut key_col = self.key_col.write();
            if key_col.as_deref() == Some(name) {
                *key_col = None;
            }
        }
    }

    /// Remove a computed index column
    pub fn drop_index(&self, name: &str) {
        self.drop_column(name);
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Run `f` inside a transaction whose selection starts as every
    /// occupied row. `Ok` commits the staged mutations atomically, `Err`
    /// drops them and is handed back unchanged.
    pub fn query<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&Txn) -> Result<()>,
    {
        let txn = self.begin();
        txn.working.borrow_mut().copy_from(&self.fill.read());
        let result = f(&txn);
        self.end(txn, result)
    }

    /// Run `f` against a single occupied row. Panics when `row` is vacant:
    /// updating a non-existent row is a programming error.
    pub fn update_at<F>(&self, row: u32, f: F) -> Result<()>
    where
        F: FnOnce(&Txn, u32) -> Result<()>,
    {
        assert!(
            self.fill.read().contains(row),
            "row {} is not occupied",
            row
        );
        let txn = self.begin();
        txn.working.borrow_mut().set(row);
        let result = f(&txn, row);
        self.end(txn, result)
    }

    /// Read one row; false when `row` is vacant
    pub fn select_at<F>(&self, row: u32, f: F) -> bool
    where
        F: FnOnce(Selector<'_>),
    {
        let mut found = false;
        let _ = self.query(|txn| {
            found = txn.select_at(row, f);
            Ok(())
        });
        found
    }

    /// Upsert by key: run `f` against the row holding `key`, allocating it
    /// (and setting its key cell) first when absent. Requires a key
    /// column. Concurrent upserts of one key are serialised so the key
    /// never maps to two rows.
    pub fn update_at_key<F>(&self, key: &str, f: F) -> Result<()>
    where
        F: FnOnce(&Txn, u32) -> Result<()>,
    {
        let _guard = self.upsert.lock();
        let existing = self.row_of_key(key);
        match existing {
            Some(row) => self.update_at(row, f),
            None => self.query(|txn| {
                txn.insert(|txn, row| {
                    txn.key().set(row, key);
                    f(txn, row)
                })?;
                Ok(())
            }),
        }
    }

    /// Read the row holding `key`; false when absent
    pub fn select_at_key<F>(&self, key: &str, f: F) -> bool
    where
        F: FnOnce(Selector<'_>),
    {
        match self.row_of_key(key) {
            Some(row) => self.select_at(row, f),
            None => false,
        }
    }

    /// Insert a single row from a column-name → value mapping
    pub fn insert_object<'v, I>(&self, object: I) -> Result<u32>
    where
        I: IntoIterator<Item = (&'v str, Value)>,
    {
        let mut row = 0;
        self.query(|txn| {
            row = txn.insert_object(object)?;
            Ok(())
        })?;
        Ok(row)
    }

    fn row_of_key(&self, key: &str) -> Option<u32> {
        let name = self.key_col.read().clone()?;
        let cols = self.cols.read();
        cols.get(&name).and_then(|c| c.as_key()).and_then(|k| k.row_of(key))
    }

    // ========================================================================
    // Transaction lifecycle
    // ========================================================================

    fn begin(&self) -> Txn<'_> {
        let buffers = self.pool.lock().pop().unwrap_or_default();
        Txn::new(self, buffers)
    }

    fn end(&self, txn: Txn<'_>, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => self.commit(&txn),
            Err(_) => self.rollback(&txn),
        }
        let mut buffers = txn.into_buffers();
        buffers.reset();
        self.pool.lock().push(buffers);
        result
    }

    /// Allocate a row id (lowest free first, capacity next) and mark it
    /// occupied immediately so later inserts in the same transaction see
    /// it taken. A rollback undoes both.
    pub(crate) fn allocate(&self) -> u32 {
        let row = {
            let mut free = self.free.lock();
            match free.heap.pop() {
                Some(Reverse(row)) => row,
                None => {
                    let row = free.next;
                    free.next += 1;
                    row
                }
            }
        };
        self.fill.write().set(row);
        row
    }

    /// Apply every staged queue, reconcile deletions and re-evaluate
    /// computed indexes whose source was touched, all under the writer lock
    fn commit(&self, txn: &Txn<'_>) {
        let mut cols = self.cols.write();
        let queues = txn.queues.borrow();
        let lookup = txn.lookup.borrow();

        // apply per-column queues and record the rows each one touched
        let mut touched: AHashMap<String, Bitmap> = AHashMap::new();
        for queue in queues.iter().take(lookup.len()) {
            if queue.is_empty() {
                continue;
            }
            if let Some(col) = cols.get_mut(queue.column()) {
                let mut rows = Bitmap::new();
                queue.touched(&mut rows);
                col.apply(queue);
                touched.insert(queue.column().to_string(), rows);
            }
        }

        // deleted rows leave the master fill bitmap and return to the pool
        let mut freed = Vec::new();
        {
            let deletes = txn.deletes.borrow();
            let mut fill = self.fill.write();
            deletes.range(|row| {
                if fill.contains(row) {
                    fill.remove(row);
                    freed.push(row);
                }
            });
        }

        // re-evaluate computed indexes over exactly the touched rows
        let indexes: Vec<(String, String)> = cols
            .iter()
            .filter_map(|(name, col)| {
                col.as_index().map(|i| (name.clone(), i.source().to_string()))
            })
            .collect();
        for (name, source) in indexes {
            let Some(rows) = touched.get(&source) else {
                continue;
            };
            let mut index = cols.remove(&name).expect("index column present");
            if let Some(src) = cols.get(&source) {
                index
                    .as_index_mut()
                    .expect("index column variant")
                    .refresh(src, rows);
            }
            cols.insert(name, index);
        }
        drop(cols);

        if !freed.is_empty() {
            let mut free = self.free.lock();
            for row in freed {
                free.heap.push(Reverse(row));
            }
        }
        log::trace!(
            "commit: {} queue(s), {} tentative insert(s)",
            touched.len(),
            txn.inserts.borrow().len()
        );
    }

    /// Drop every staged queue and return tentatively allocated ids
    fn rollback(&self, txn: &Txn<'_>) {
        let inserts = txn.inserts.borrow();
        if inserts.is_empty() {
            return;
        }
        {
            let mut fill = self.fill.write();
            for &row in inserts.iter() {
                fill.remove(row);
            }
        }
        let mut free = self.free.lock();
        for &row in inserts.iter() {
            free.heap.push(Reverse(row));
        }
        log::trace!("rollback: released {} tentative insert(s)", inserts.len());
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Collection {
        let c = Collection::new();
        c.create_column("name", Column::for_string()).unwrap();
        c.create_column("balance", Column::for_f64()).unwrap();
        c.create_column("age", Column::for_u16()).unwrap();
        c
    }

    /// The master fill bitmap must equal the union of column fills over
    /// occupied rows.
    fn assert_fill_invariant(c: &Collection) {
        let fill = c.fill.read();
        let cols = c.cols.read();
        let mut union = Bitmap::new();
        for col in cols.values() {
            union.or(col.fill());
        }
        fill.range(|row| {
            assert!(union.contains(row), "occupied row {} has no value", row)
        });
        union.range(|row| {
            assert!(fill.contains(row), "row {} has values but is vacant", row)
        });
    }

    fn seed(c: &Collection, n: u32) {
        c.query(|txn| {
            for i in 0..n {
                txn.insert(|txn, row| {
                    txn.string("name").set(row, &format!("p{}", i));
                    txn.float64("balance").set(row, i as f64 * 100.0);
                    txn.uint16("age").set(row, (20 + i % 40) as u16);
                    Ok(())
                })?;
            }
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_create_and_drop_column() {
        let c = sample();
        assert!(matches!(
            c.create_column("name", Column::for_string()),
            Err(Error::ColumnExists(_))
        ));
        c.drop_column("name");
        assert!(c.create_column("name", Column::for_string()).is_ok());
    }

    #[test]
    fn test_single_key_column() {
        let c = Collection::new();
        assert!(c.create_column("key1", Column::for_key()).is_ok());
        assert!(matches!(
            c.create_column("key2", Column::for_key()),
            Err(Error::DuplicateKeyColumn)
        ));

        // dropping the key column makes room for a new one
        c.drop_column("key1");
        assert!(c.create_column("key2", Column::for_key()).is_ok());
    }

    #[test]
    fn test_insert_and_count() {
        let c = sample();
        seed(&c, 10);
        assert_eq!(c.count(), 10);
        assert_fill_invariant(&c);
    }

    #[test]
    fn test_free_slot_reuse_lowest_first() {
        let c = sample();
        seed(&c, 5);

        c.query(|txn| {
            txn.delete_at(1);
            txn.delete_at(3);
            Ok(())
        })
        .unwrap();
        assert_eq!(c.count(), 3);

        // lowest reclaimed id first, then the next one, then fresh capacity
        let mut rows = Vec::new();
        c.query(|txn| {
            for _ in 0..3 {
                rows.push(txn.insert(|_, _| Ok(()))?);
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(rows, vec![1, 3, 5]);
    }

    #[test]
    fn test_insert_delete_insert_same_row() {
        let c = sample();
        let first = c.insert_object(vec![("name", Value::from("a"))]).unwrap();
        c.query(|txn| {
            assert!(txn.delete_at(first));
            Ok(())
        })
        .unwrap();
        let second = c.insert_object(vec![("name", Value::from("b"))]).unwrap();
        assert_eq!(first, second);
        assert_fill_invariant(&c);
    }

    #[test]
    fn test_rollback_preserves_state() {
        let c = sample();
        seed(&c, 4);

        let before: Vec<Option<f64>> = {
            let cols = c.cols.read();
            (0..4).map(|i| cols["balance"].float_at(i)).collect()
        };

        let err = c.query(|txn| {
            let balance = txn.float64("balance");
            txn.range(|row| balance.set(row, 0.0));
            txn.insert(|_, _| Ok(()))?;
            Err(Error::Aborted("nope".into()))
        });
        assert!(matches!(err, Err(Error::Aborted(_))));

        let after: Vec<Option<f64>> = {
            let cols = c.cols.read();
            (0..4).map(|i| cols["balance"].float_at(i)).collect()
        };
        assert_eq!(before, after);
        assert_eq!(c.count(), 4);

        // the tentative insert went back to the pool: next insert reuses it
        let row = c.insert_object(vec![("name", Value::from("x"))]).unwrap();
        assert_eq!(row, 4);
    }

    #[test]
    #[should_panic(expected = "not occupied")]
    fn test_update_at_vacant_row_panics() {
        let c = sample();
        let _ = c.update_at(99, |_, _| Ok(()));
    }

    #[test]
    fn test_update_at() {
        let c = sample();
        let row = c
            .insert_object(vec![("name", Value::from("hello"))])
            .unwrap();
        c.update_at(row, |txn, row| {
            txn.string("name").set(row, "hi");
            Ok(())
        })
        .unwrap();

        assert!(c.select_at(row, |s| assert_eq!(s.string_at("name"), "hi")));
        assert!(!c.select_at(9999, |_| panic!("must not be called")));
    }

    #[test]
    fn test_upsert_by_key() {
        let c = Collection::new();
        c.create_column("key", Column::for_key()).unwrap();
        c.create_column("val", Column::for_string()).unwrap();

        c.update_at_key("1", |txn, row| {
            txn.string("val").set(row, "first");
            Ok(())
        })
        .unwrap();
        assert_eq!(c.count(), 1);

        // second upsert of the same key updates in place
        c.update_at_key("1", |txn, row| {
            txn.string("val").set(row, "second");
            Ok(())
        })
        .unwrap();
        assert_eq!(c.count(), 1);

        let mut seen = 0;
        assert!(c.select_at_key("1", |s| {
            assert_eq!(s.string_at("val"), "second");
            assert_eq!(s.string_at("key"), "1");
            seen += 1;
        }));
        assert_eq!(seen, 1);
        assert!(!c.select_at_key("2", |_| panic!("must not be called")));
    }

    #[test]
    fn test_insert_object_unknown_column() {
        let c = sample();
        let err = c.insert_object(vec![("bogus", Value::from(1i64))]);
        assert!(matches!(err, Err(Error::ColumnNotFound(_))));
        // the failed insert rolled back entirely
        assert_eq!(c.count(), 0);
    }

    #[test]
    fn test_create_columns_of() {
        let c = Collection::new();
        c.create_columns_of(vec![
            ("title", Value::from("x")),
            ("done", Value::from(false)),
            ("score", Value::from(1.5f64)),
        ])
        .unwrap();

        let row = c
            .insert_object(vec![
                ("title", Value::from("write tests")),
                ("done", Value::from(true)),
                ("score", Value::from(9.5f64)),
            ])
            .unwrap();
        assert!(c.select_at(row, |s| {
            assert_eq!(s.string_at("title"), "write tests");
            assert!(s.bool_at("done"));
            assert_eq!(s.float_at("score"), 9.5);
        }));
    }

    #[test]
    fn test_index_lifecycle() {
        let c = sample();
        seed(&c, 10); // balances 0, 100, .., 900

        c.create_index("rich", "balance", |r| r.float() >= 500.0)
            .unwrap();
        c.query(|txn| {
            assert_eq!(txn.with(&["rich"]).count(), 5);
            Ok(())
        })
        .unwrap();

        // duplicate names and unknown sources are DDL errors
        assert!(matches!(
            c.create_index("rich", "balance", |_| true),
            Err(Error::ColumnExists(_))
        ));
        assert!(matches!(
            c.create_index("tall", "height", |_| true),
            Err(Error::ColumnNotFound(_))
        ));

        c.drop_index("rich");
        c.query(|txn| {
            assert_eq!(txn.with(&["rich"]).count(), 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_index_follows_mutations() {
        let c = sample();
        seed(&c, 6);
        c.create_index("rich", "balance", |r| r.float() >= 300.0)
            .unwrap();

        c.query(|txn| {
            let balance = txn.float64("balance");
            balance.set(0, 1000.0); // 0 joins
            balance.set(5, 0.0); // 5 leaves
            Ok(())
        })
        .unwrap();

        c.query(|txn| {
            let mut rows = Vec::new();
            txn.with(&["rich"]).range(|row| rows.push(row));
            assert_eq!(rows, vec![0, 3, 4]);
            Ok(())
        })
        .unwrap();

        // deleting a row drops it from the index too
        c.query(|txn| {
            txn.delete_at(3);
            Ok(())
        })
        .unwrap();
        c.query(|txn| {
            assert_eq!(txn.with(&["rich"]).count(), 2);
            Ok(())
        })
        .unwrap();
        assert_fill_invariant(&c);
    }

    #[test]
    fn test_concurrent_queries() {
        use std::sync::Arc;

        let c = Arc::new(Collection::new());
        c.create_column("name", Column::for_key()).unwrap();

        let writer = {
            let c = Arc::clone(&c);
            std::thread::spawn(move || {
                for i in 0..100 {
                    c.update_at_key(&format!("k{}", i), |txn, row| {
                        txn.key().set(row, &format!("k{}", i));
                        Ok(())
                    })
                    .unwrap();
                }
            })
        };
        let reader = {
            let c = Arc::clone(&c);
            std::thread::spawn(move || {
                for _ in 0..100 {
                    c.query(|txn| {
                        let _ = txn.with(&["name"]).count();
                        Ok(())
                    })
                    .unwrap();
                }
            })
        };

        writer.join().unwrap();
        reader.join().unwrap();
        assert_eq!(c.count(), 100);
    }
}
