//! Catalog for the VeldDB query engine
//!
//! A `Database` is an ordered map of table names to tables; a `Table` is an
//! ordered map of column names to columns carrying type, nullability, and
//! the paths of the on-disk data, null, and index files.

pub mod catalog;
pub mod types;

pub use catalog::{Column, Database, Table};
pub use types::SqlType;
