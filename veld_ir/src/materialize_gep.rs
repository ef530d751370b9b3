//! GEP materialisation analysis
//!
//! GEPs are lazy: the backend folds a GEP into the addressing mode of its
//! sole pointer-consuming successor when it can. This pass marks the GEPs
//! that must instead be computed into a register at their definition (their
//! value escapes into a position with no addressing mode), and verifies the
//! builder's "at most one lazy pointer operand" contract.

use veld_common::{VeldError, VeldResult};

use crate::instruction::{opcode_of, Type2, Type3};
use crate::opcode::Opcode;
use crate::program::Function;
use crate::value::Value;

/// Returns, per instruction index, whether a GEP defined there must be
/// materialized into a register.
pub fn compute_gep_materialize(func: &Function) -> VeldResult<Vec<bool>> {
    let instrs = &func.instrs;
    let mut should_materialize = vec![false; instrs.len()];

    let is_gep = |v: Value| -> bool {
        !v.is_constant_global()
            && !v.is_none()
            && matches!(
                Opcode::from_u8(opcode_of(instrs[v.idx()])),
                Opcode::GepStatic | Opcode::GepDynamic
            )
    };

    for block in &func.blocks {
        for i in block.instr_indices() {
            let instr = instrs[i];
            let opcode = Opcode::from_u8(opcode_of(instr));
            match opcode {
                // The value position of these has no addressing mode.
                Opcode::PtrCast | Opcode::CallArg | Opcode::CallIndirect => {
                    let v = Value::from_serialized(Type3(instr).arg());
                    if is_gep(v) {
                        should_materialize[v.idx()] = true;
                    }
                }

                Opcode::PtrStore | Opcode::PhiMember => {
                    let v = Value::from_serialized(Type2(instr).arg1());
                    if is_gep(v) {
                        should_materialize[v.idx()] = true;
                    }
                }

                Opcode::PtrCmpNullptr => {
                    let v = Value::from_serialized(Type2(instr).arg0());
                    if is_gep(v) {
                        should_materialize[v.idx()] = true;
                    }
                }

                _ => {}
            }

            // The builder forces extra lazy pointer inputs through
            // PTR_MATERIALIZE; more than one reaching an instruction means
            // that pass was skipped.
            if !matches!(opcode, Opcode::GepStatic | Opcode::GepDynamic | Opcode::PtrMaterialize) {
                let mut lazy = 0;
                let (a, b) = operand_pair(instr, opcode);
                if a.map(&is_gep).unwrap_or(false) && !should_materialize[a.unwrap().idx()] {
                    lazy += 1;
                }
                if b.map(&is_gep).unwrap_or(false) && !should_materialize[b.unwrap().idx()] {
                    lazy += 1;
                }
                if lazy > 1 {
                    return Err(VeldError::ir_error(format!(
                        "instruction {i} has more than one lazy GEP operand"
                    )));
                }
            }
        }
    }

    Ok(should_materialize)
}

/// The (up to two) value operands of an instruction, by format.
fn operand_pair(instr: u64, opcode: Opcode) -> (Option<Value>, Option<Value>) {
    use Opcode::*;
    match opcode {
        I8Store | I16Store | I32Store | I64Store | F64Store | PtrStore | I32Vec8Store
        | PhiMember | GepStaticOffset | GepDynamicOffset => {
            let t2 = Type2(instr);
            (
                Some(Value::from_serialized(t2.arg0())),
                Some(Value::from_serialized(t2.arg1())),
            )
        }
        I1Load | I8Load | I16Load | I32Load | I64Load | F64Load | I32Vec8Load
        | PtrCmpNullptr => (Some(Value::from_serialized(Type2(instr).arg0())), None),
        PtrLoad | PtrCast | CallArg | CallIndirect | PtrMaterialize | ReturnValue => {
            (Some(Value::from_serialized(Type3(instr).arg())), None)
        }
        _ => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ProgramBuilder;

    #[test]
    fn test_load_address_gep_stays_lazy() {
        let mut b = ProgramBuilder::new();
        let i32_ty = b.i32_type();
        let row = b.struct_type(&[i32_ty, i32_ty], None).unwrap();
        b.create_public_function(b.void_type(), &[], "f").unwrap();

        let slot = b.alloca(row, 1).unwrap();
        let field = b.const_gep(slot, &[0, 1]).unwrap();
        let _ = b.load_i32(field).unwrap();
        b.ret().unwrap();

        let program = b.build();
        let func = program.function("f").unwrap();
        let marks = compute_gep_materialize(func).unwrap();
        assert!(marks.iter().all(|&m| !m));
    }

    #[test]
    fn test_call_arg_gep_is_materialized() {
        let mut b = ProgramBuilder::new();
        let i32_ty = b.i32_type();
        let i32_ptr = b.pointer_type(i32_ty);
        let row = b.struct_type(&[i32_ty, i32_ty], None).unwrap();
        let callee = b.declare_external_function("sink", b.void_type(), &[i32_ptr], 0x1000);
        b.create_public_function(b.void_type(), &[], "f").unwrap();

        let slot = b.alloca(row, 1).unwrap();
        let field = b.const_gep(slot, &[0, 1]).unwrap();
        let gep_idx = field.idx();
        b.call(callee, &[field]).unwrap();
        b.ret().unwrap();

        let program = b.build();
        let func = program.function("f").unwrap();
        let marks = compute_gep_materialize(func).unwrap();
        assert!(marks[gep_idx]);
    }
}
