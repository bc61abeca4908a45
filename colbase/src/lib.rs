//! ColBase - In-memory columnar storage with transactional queries
//!
//! A collection holds logical rows addressed by dense 32-bit identifiers;
//! each named column stores one attribute contiguously. Queries run inside
//! a callback-scoped transaction and compose row-set bitmaps (intersection,
//! union, difference) before any per-row work:
//!
//! ```
//! use colbase::{Collection, Column};
//!
//! let c = Collection::new();
//! c.create_column("name", Column::for_string()).unwrap();
//! c.create_column("balance", Column::for_f64()).unwrap();
//!
//! c.query(|txn| {
//!     txn.insert(|txn, row| {
//!         txn.string("name").set(row, "Merlin");
//!         txn.float64("balance").set(row, 500.0);
//!         Ok(())
//!     })?;
//!     Ok(())
//! })
//! .unwrap();
//!
//! c.query(|txn| {
//!     assert_eq!(1, txn.with_float("balance", |v| v > 100.0).count());
//!     Ok(())
//! })
//! .unwrap();
//! ```
//!
//! Mutations are staged in per-column delta queues and applied atomically
//! when the callback returns `Ok`; returning `Err` drops every staged
//! mutation (rollback) and hands the error back to the caller.

pub mod bitmap;
pub mod collection;
pub mod column;
pub mod commit;
pub mod data;
pub mod txn;

pub use bitmap::Bitmap;
pub use collection::Collection;
pub use column::{CellReader, Column};
pub use data::Value;
pub use txn::{Selector, Txn};

/// Storage engine error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    #[error("Column already exists: {0}")]
    ColumnExists(String),

    #[error("A key column already exists in this collection")]
    DuplicateKeyColumn,

    #[error("Invalid data type: {0}")]
    InvalidDataType(String),

    #[error("Transaction aborted: {0}")]
    Aborted(String),
}

pub type Result<T> = std::result::Result<T, Error>;
