//! Program builder tests

use veld_ir::instruction::{opcode_of, Type3};
use veld_ir::{CompType, Opcode, ProgramBuilder};

#[test]
fn test_constant_folding_integer() {
    let mut b = ProgramBuilder::new();
    b.create_public_function(b.void_type(), &[], "f").unwrap();

    let two = b.const_i32(2);
    let three = b.const_i32(3);
    let sum = b.add_i32(two, three).unwrap();
    assert!(sum.is_constant_global());
    assert_eq!(b.get_int_constant(sum), Some(5));

    let cmp = b.cmp_i32(CompType::Lt, two, three).unwrap();
    assert_eq!(b.get_i1_constant(cmp), Some(true));
}

#[test]
fn test_scalar_constants_interned() {
    let mut b = ProgramBuilder::new();
    b.create_public_function(b.void_type(), &[], "f").unwrap();
    assert_eq!(b.const_i32(42), b.const_i32(42));
    assert_eq!(b.const_i64(-1), b.const_i64(-1));
    assert_eq!(b.const_f64(1.5), b.const_f64(1.5));
    assert_ne!(b.const_i32(42), b.const_i32(43));
}

#[test]
fn test_comparison_canonicalizes_constant_first() {
    let mut b = ProgramBuilder::new();
    let i32_ty = b.i32_type();
    b.create_public_function(b.void_type(), &[i32_ty], "f").unwrap();
    let arg = b.get_function_arguments(b.current_function())[0];
    let ten = b.const_i32(10);

    // 10 < arg must become arg > 10.
    let v = b.cmp_i32(CompType::Lt, ten, arg).unwrap();
    let program = b.build();
    let func = program.function("f").unwrap();
    let instr = func.instrs[v.idx()];
    assert_eq!(Opcode::from_u8(opcode_of(instr)), Opcode::I32CmpGt);
}

#[test]
fn test_type_of_is_stable() {
    let mut b = ProgramBuilder::new();
    let i32_ty = b.i32_type();
    b.create_public_function(b.void_type(), &[i32_ty, i32_ty], "f").unwrap();
    let args = b.get_function_arguments(b.current_function());
    let sum = b.add_i32(args[0], args[1]).unwrap();
    let before = b.type_of(sum);

    let wide = b.i64_zext_i32(sum).unwrap();
    let _ = b.f64_conv_i64(wide).unwrap();
    assert_eq!(b.type_of(sum), before);
    assert_eq!(b.type_of(sum), b.i32_type());
    assert_eq!(b.type_of(wide), b.i64_type());
}

#[test]
fn test_append_to_terminated_block_errors() {
    let mut b = ProgramBuilder::new();
    b.create_public_function(b.void_type(), &[], "f").unwrap();
    b.ret().unwrap();
    assert!(b.ret().is_err());
}

#[test]
fn test_switch_from_non_terminated_block_errors() {
    let mut b = ProgramBuilder::new();
    b.create_public_function(b.void_type(), &[], "f").unwrap();
    let other = b.create_block();
    assert!(b.set_current_block(other).is_err());
}

#[test]
fn test_branch_updates_edges() {
    let mut b = ProgramBuilder::new();
    let i1_ty = b.i1_type();
    b.create_public_function(b.void_type(), &[i1_ty], "f").unwrap();
    let cond = b.get_function_arguments(b.current_function())[0];

    let then_block = b.create_block();
    let else_block = b.create_block();
    b.cond_branch(cond, then_block, else_block).unwrap();

    b.set_current_block(then_block).unwrap();
    b.ret().unwrap();
    b.set_current_block(else_block).unwrap();
    b.ret().unwrap();

    let program = b.build();
    let func = program.function("f").unwrap();
    assert_eq!(func.blocks[0].succ.as_slice(), &[then_block, else_block]);
    assert_eq!(func.blocks[then_block].pred.as_slice(), &[0]);
    assert_eq!(func.blocks[else_block].pred.as_slice(), &[0]);
}

#[test]
fn test_phi_member_backpatch() {
    let mut b = ProgramBuilder::new();
    let i1_ty = b.i1_type();
    b.create_public_function(b.void_type(), &[i1_ty], "f").unwrap();
    let cond = b.get_function_arguments(b.current_function())[0];

    let then_block = b.create_block();
    let else_block = b.create_block();
    let join = b.create_block();
    b.cond_branch(cond, then_block, else_block).unwrap();

    b.set_current_block(then_block).unwrap();
    let one = b.const_i32(1);
    let m1 = b.phi_member(one).unwrap();
    b.branch(join).unwrap();

    b.set_current_block(else_block).unwrap();
    let two = b.const_i32(2);
    let m2 = b.phi_member(two).unwrap();
    b.branch(join).unwrap();

    b.set_current_block(join).unwrap();
    let phi = b.phi(b.i32_type()).unwrap();
    b.update_phi_member(phi, m1);
    b.update_phi_member(phi, m2);
    b.ret().unwrap();

    assert_eq!(b.type_of(phi), b.i32_type());
    let program = b.build();
    let func = program.function("f").unwrap();
    veld_ir::verify::verify_terminators(func).unwrap();
    veld_ir::verify::verify_phis(func).unwrap();
}

#[test]
fn test_call_emits_arg_run() {
    let mut b = ProgramBuilder::new();
    let i32_ty = b.i32_type();
    let callee = b.declare_external_function("ext", b.i32_type(), &[i32_ty, i32_ty], 0xdead);
    b.create_public_function(b.void_type(), &[i32_ty, i32_ty], "f").unwrap();
    let args = b.get_function_arguments(b.current_function());

    let result = b.call(callee, &[args[0], args[1]]).unwrap();
    b.ret().unwrap();

    assert_eq!(b.type_of(result), b.i32_type());
    let program = b.build();
    let func = program.function("f").unwrap();
    let call_idx = result.idx();
    // The two CALL_ARG words immediately precede the CALL.
    for (offset, pos) in [(2usize, 0u8), (1, 1)] {
        let instr = func.instrs[call_idx - offset];
        assert_eq!(Opcode::from_u8(opcode_of(instr)), Opcode::CallArg);
        assert_eq!(Type3(instr).sarg(), pos);
    }
}

#[test]
fn test_named_struct_redefinition_is_error() {
    let mut b = ProgramBuilder::new();
    let i32_ty = b.i32_type();
    b.struct_type(&[i32_ty], Some("row")).unwrap();
    assert!(b.struct_type(&[i32_ty, i32_ty], Some("row")).is_err());
}

#[test]
fn test_gep_pairs_and_materialize() {
    let mut b = ProgramBuilder::new();
    let i32_ty = b.i32_type();
    let i64_ty = b.i64_type();
    let row = b.struct_type(&[i64_ty, i32_ty], None).unwrap();
    b.create_public_function(b.void_type(), &[], "f").unwrap();

    let slot = b.alloca(row, 1).unwrap();
    let field = b.const_gep(slot, &[0, 1]).unwrap();
    b.ret().unwrap();

    let program = b.build();
    let func = program.function("f").unwrap();
    let gep = func.instrs[field.idx()];
    assert_eq!(Opcode::from_u8(opcode_of(gep)), Opcode::GepStatic);
    let offset_word = func.instrs[field.idx() - 1];
    assert_eq!(Opcode::from_u8(opcode_of(offset_word)), Opcode::GepStaticOffset);
}
