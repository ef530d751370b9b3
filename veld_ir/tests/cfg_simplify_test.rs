//! CFG simplification tests

use veld_ir::{cfg_simplify, verify, CompType, ProgramBuilder};

/// entry -> a -> b, all trivially mergeable.
#[test]
fn test_straight_line_merges_to_one_block() {
    let mut b = ProgramBuilder::new();
    let i32_ty = b.i32_type();
    b.create_public_function(b.void_type(), &[i32_ty], "f").unwrap();
    let arg = b.get_function_arguments(b.current_function())[0];

    let block_a = b.create_block();
    let block_b = b.create_block();
    b.branch(block_a).unwrap();
    b.set_current_block(block_a).unwrap();
    let one = b.const_i32(1);
    let _ = b.add_i32(arg, one).unwrap();
    b.branch(block_b).unwrap();
    b.set_current_block(block_b).unwrap();
    b.ret().unwrap();

    let mut program = b.build();
    let func = &mut program.functions[0];
    cfg_simplify(func);

    assert_eq!(func.blocks.len(), 1);
    verify::verify_terminators(func).unwrap();
    verify::verify_no_trivial_edges(func).unwrap();
}

#[test]
fn test_diamond_preserved_phi_survives() {
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

    let mut program = b.build();
    let func = &mut program.functions[0];
    cfg_simplify(func);

    // The diamond cannot merge: entry has two successors and join two
    // predecessors.
    assert_eq!(func.blocks.len(), 4);
    verify::verify_terminators(func).unwrap();
    verify::verify_phis(func).unwrap();
    verify::verify_no_trivial_edges(func).unwrap();
}

#[test]
fn test_unreachable_block_deleted() {
    let mut b = ProgramBuilder::new();
    b.create_public_function(b.void_type(), &[], "f").unwrap();

    let reachable = b.create_block();
    let unreachable = b.create_block();
    b.branch(reachable).unwrap();
    b.set_current_block(reachable).unwrap();
    b.ret().unwrap();
    b.set_current_block(unreachable).unwrap();
    b.ret().unwrap();

    let mut program = b.build();
    let func = &mut program.functions[0];
    cfg_simplify(func);

    // entry+reachable merge; unreachable is gone.
    assert_eq!(func.blocks.len(), 1);
}

#[test]
fn test_simplify_is_idempotent() {
    let mut b = ProgramBuilder::new();
    let i1_ty = b.i1_type();
    let i32_ty = b.i32_type();
    b.create_public_function(b.void_type(), &[i1_ty, i32_ty], "f").unwrap();
    let args = b.get_function_arguments(b.current_function());

    // A loop-shaped CFG with a straight-line tail.
    let header = b.create_block();
    let body = b.create_block();
    let tail_a = b.create_block();
    let tail_b = b.create_block();
    b.branch(header).unwrap();

    b.set_current_block(header).unwrap();
    b.cond_branch(args[0], body, tail_a).unwrap();

    b.set_current_block(body).unwrap();
    let ten = b.const_i32(10);
    let cmp = b.cmp_i32(CompType::Lt, args[1], ten).unwrap();
    b.cond_branch(cmp, header, tail_a).unwrap();

    b.set_current_block(tail_a).unwrap();
    b.branch(tail_b).unwrap();
    b.set_current_block(tail_b).unwrap();
    b.ret().unwrap();

    let mut program = b.build();
    let func = &mut program.functions[0];
    cfg_simplify(func);

    let instrs_once = func.instrs.clone();
    let blocks_once: Vec<_> = func
        .blocks
        .iter()
        .map(|bb| (bb.segments.clone(), bb.succ.clone(), bb.pred.clone()))
        .collect();

    cfg_simplify(func);
    let blocks_twice: Vec<_> = func
        .blocks
        .iter()
        .map(|bb| (bb.segments.clone(), bb.succ.clone(), bb.pred.clone()))
        .collect();

    assert_eq!(func.instrs, instrs_once);
    assert_eq!(blocks_once, blocks_twice);
    verify::verify_no_trivial_edges(func).unwrap();
}
