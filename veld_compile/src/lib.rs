//! Query compilation for VeldDB
//!
//! The proxy value layer, the produce/consume operator translators, the
//! pipeline DAG and its scheduler, and the adaptive Skinner translators.
//! `compile_query` turns a logical plan into executable native code.

pub mod buffer;
pub mod control_flow;
pub mod expr_translator;
pub mod hashing;
pub mod pipeline;
pub mod query;
pub mod row_layout;
pub mod runtime_fns;
pub mod translators;
pub mod values;

pub use query::{compile_query, CompiledQuery};
