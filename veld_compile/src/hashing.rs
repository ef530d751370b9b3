//! Key fingerprinting
//!
//! Joins and group-bys key their hash tables on a 64-bit fingerprint of the
//! key columns; collisions are resolved by re-verifying the keys on probe,
//! so the fingerprint only has to be deterministic.

use veld_common::VeldResult;
use veld_ir::{ProgramBuilder, Value};

use crate::runtime_fns::RuntimeFunctions;
use crate::values::{IrVal, SqlValue};

pub fn fingerprint(
    p: &mut ProgramBuilder,
    rt: &RuntimeFunctions,
    values: &[SqlValue],
) -> VeldResult<Value> {
    let i64_ty = p.i64_type();
    let slot = p.alloca(i64_ty, 1)?;
    let zero = p.const_i64(0);
    p.store_i64(slot, zero)?;

    for value in values {
        let h = match value.val {
            IrVal::Bool(v) => p.i64_zext_i1(v)?,
            IrVal::I16(v) => p.i64_sext_i16(v)?,
            IrVal::I32(v) | IrVal::Date(v) => p.i64_sext_i32(v)?,
            IrVal::I64(v) => v,
            // Truncation loses fractional bits; acceptable, keys are
            // re-verified on probe.
            IrVal::F64(v) => p.i64_conv_f64(v)?,
            IrVal::Str(view) => p.call(rt.string_hash, &[view])?,
        };
        p.call(rt.hash_combine, &[slot, h])?;
        let null_bit = p.i64_zext_i1(value.null)?;
        p.call(rt.hash_combine, &[slot, null_bit])?;
    }
    p.load_i64(slot)
}
