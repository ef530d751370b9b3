//! Typed SSA intermediate representation
//!
//! Instructions are 64-bit words in an append-only arena; values are 24-bit
//! indices (instruction or constant-pool entry); basic blocks are segment
//! lists with explicit edges. The `ProgramBuilder` enforces the structural
//! invariants (single terminator, phi/member pairing, lazy-GEP discipline)
//! while translators emit code through it.

pub mod builder;
pub mod cfg_simplify;
pub mod instruction;
pub mod materialize_gep;
pub mod opcode;
pub mod printer;
pub mod program;
pub mod types;
pub mod value;
pub mod verify;

pub use builder::ProgramBuilder;
pub use cfg_simplify::cfg_simplify;
pub use materialize_gep::compute_gep_materialize;
pub use opcode::{ConstantOpcode, Opcode};
pub use program::{BasicBlockData, Function, Program};
pub use types::{Type, TypeKind, TypeManager};
pub use value::{BlockRef, CompType, FunctionRef, Value};
