//! CFG simplification
//!
//! A single pre-allocation pass that deletes blocks unreachable from the
//! entry, merges every `(A -> B)` edge where `A` has exactly one successor
//! and `B` exactly one predecessor (phis in `B` become aliases of their
//! unique incoming member), rewrites all instructions through the alias
//! chains, and renumbers blocks contiguously.

use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::instruction::{opcode_of, Type2, Type3, Type5};
use crate::opcode::Opcode;
use crate::program::{BasicBlockData, Function};

pub fn cfg_simplify(func: &mut Function) {
    let deleted = unreachable_blocks(&func.blocks);
    let dead = merge_blocks(func, &deleted);
    renumber(func, &dead);
}

/// Marks blocks unreachable from the entry: any non-entry block with no
/// predecessors seeds a worklist; a successor dies once every predecessor is
/// dead.
fn unreachable_blocks(blocks: &[BasicBlockData]) -> Vec<bool> {
    let mut deleted = vec![false; blocks.len()];
    let mut worklist: Vec<usize> = Vec::new();
    for (i, block) in blocks.iter().enumerate().skip(1) {
        if block.pred.is_empty() {
            deleted[i] = true;
            worklist.push(i);
        }
    }

    while let Some(current) = worklist.pop() {
        for &succ in &blocks[current].succ {
            if deleted[succ] {
                continue;
            }
            if blocks[succ].pred.iter().all(|&p| deleted[p]) {
                deleted[succ] = true;
                worklist.push(succ);
            }
        }
    }
    deleted
}

/// Merges single-successor/single-predecessor pairs. Returns the final
/// per-block deadness (unreachable plus merged-away).
fn merge_blocks(func: &mut Function, deleted: &[bool]) -> Vec<bool> {
    let n = func.blocks.len();
    let mut succ: Vec<Vec<usize>> = Vec::with_capacity(n);
    let mut pred: Vec<Vec<usize>> = Vec::with_capacity(n);
    for block in &func.blocks {
        succ.push(block.succ.iter().copied().filter(|&b| !deleted[b]).collect());
        pred.push(block.pred.iter().copied().filter(|&b| !deleted[b]).collect());
    }

    let mut value_map: HashMap<u32, u32> = HashMap::new();
    let mut dead = deleted.to_vec();

    for i in 0..n {
        if dead[i] {
            continue;
        }
        while succ[i].len() == 1 && pred[succ[i][0]].len() == 1 && succ[i][0] != i {
            let j = succ[i][0];
            // Only merge across a plain branch; a cond-branch whose arms
            // collapsed to one block keeps its shape.
            match func.blocks[i].last_instr() {
                Some(last)
                    if Opcode::from_u8(opcode_of(func.instrs[last])) == Opcode::Br => {}
                _ => break,
            }

            // Alias each phi at the head of j to the member feeding it from
            // the tail of i, then drop both plus the branch.
            let mut head_phis = 0usize;
            {
                let start_seg = func.blocks[j].segments[0];
                for idx in (start_seg.0 as usize)..=(start_seg.1 as usize) {
                    if Opcode::from_u8(opcode_of(func.instrs[idx])) != Opcode::Phi {
                        break;
                    }
                    head_phis += 1;
                }
            }
            let end_seg = *func.blocks[i].segments.last().unwrap();
            // end_seg.1 is the branch; the members precede it.
            let mut members = 0usize;
            {
                let mut idx = end_seg.1 as i64 - 1;
                while idx >= end_seg.0 as i64 {
                    let instr = func.instrs[idx as usize];
                    if Opcode::from_u8(opcode_of(instr)) != Opcode::PhiMember {
                        break;
                    }
                    let t2 = Type2(instr);
                    let phi = t2.arg0();
                    let member_value = t2.arg1();
                    value_map.insert(phi, member_value);
                    members += 1;
                    idx -= 1;
                }
            }
            debug_assert_eq!(head_phis, members, "phi members must match head phis");

            // Trim i's tail (members + branch) and j's head (phis).
            {
                let seg = func.blocks[i].segments.last_mut().unwrap();
                let new_end = seg.1 as i64 - members as i64 - 1;
                if new_end < seg.0 as i64 {
                    func.blocks[i].segments.pop();
                } else {
                    seg.1 = new_end as u32;
                }
            }
            let mut j_segments: SmallVec<[(u32, u32); 1]> = func.blocks[j].segments.clone();
            {
                let first = &mut j_segments[0];
                first.0 += head_phis as u32;
                if first.0 > first.1 {
                    j_segments.remove(0);
                }
            }
            func.blocks[i].segments.extend(j_segments);

            dead[j] = true;
            succ[i] = std::mem::take(&mut succ[j]);
            for &next in &succ[i] {
                for p in pred[next].iter_mut() {
                    if *p == j {
                        *p = i;
                    }
                }
            }
        }
    }

    // Rewrite every live instruction through the alias chains.
    for i in 0..n {
        if dead[i] {
            continue;
        }
        let indices: Vec<usize> = func.blocks[i].instr_indices().collect();
        for idx in indices {
            rewrite_instr(&mut func.instrs[idx], &value_map);
        }
    }

    for i in 0..n {
        if !dead[i] {
            func.blocks[i].succ = succ[i].iter().copied().collect();
            func.blocks[i].pred = pred[i].iter().copied().collect();
        }
    }
    // Clear out merged and unreachable blocks.
    for (i, d) in dead.iter().enumerate() {
        if *d {
            func.blocks[i].segments.clear();
            func.blocks[i].succ.clear();
            func.blocks[i].pred.clear();
            func.blocks[i].terminated = true;
        }
    }

    dead
}

/// Follows the alias chain for one serialized operand.
fn resolve(mut v: u32, value_map: &HashMap<u32, u32>) -> u32 {
    while let Some(&next) = value_map.get(&v) {
        v = next;
    }
    v
}

/// Rewrites an instruction's value operands through the alias map.
pub(crate) fn rewrite_instr(instr: &mut u64, value_map: &HashMap<u32, u32>) {
    use Opcode::*;
    if value_map.is_empty() {
        return;
    }
    let opcode = Opcode::from_u8(opcode_of(*instr));
    match opcode {
        // Two value operands.
        I1CmpEq | I1CmpNe | I1And | I1Or | I8Add | I8Sub | I8Mul | I8CmpEq | I8CmpNe | I8CmpLt
        | I8CmpLe | I8CmpGt | I8CmpGe | I16Add | I16Sub | I16Mul | I16CmpEq | I16CmpNe
        | I16CmpLt | I16CmpLe | I16CmpGt | I16CmpGe | I32Add | I32Sub | I32Mul | I32CmpEq
        | I32CmpNe | I32CmpLt | I32CmpLe | I32CmpGt | I32CmpGe | I64Add | I64Sub | I64Mul
        | I64LShift | I64RShift | I64And | I64Or | I64Xor | I64CmpEq | I64CmpNe | I64CmpLt
        | I64CmpLe | I64CmpGt | I64CmpGe | F64Add | F64Sub | F64Mul | F64Div | F64CmpEq
        | F64CmpNe | F64CmpLt | F64CmpLe | F64CmpGt | F64CmpGe | PhiMember | I8Store
        | I16Store | I32Store | I64Store | F64Store | PtrStore | GepStaticOffset
        | GepDynamicOffset | I32Vec8Add | I32Vec8CmpEq | I32Vec8CmpNe | I32Vec8CmpLt
        | I32Vec8CmpLe | I32Vec8CmpGt | I32Vec8CmpGe | I1Vec8And | I1Vec8Or | I32Vec8Compress
        | I32Vec8Store | I32CmpEqAnyConstVec4 | I32CmpEqAnyConstVec8 => {
            let t2 = Type2(*instr);
            let v0 = resolve(t2.arg0(), value_map);
            let v1 = resolve(t2.arg1(), value_map);
            *instr = Type2(Type2(*instr).with_arg0(v0)).with_arg1(v1);
        }

        // One value operand in the Type-2 arg0 slot.
        I1LNot | I1ZextI8 | I1ZextI64 | I8ZextI64 | I8SextI64 | I8ConvF64 | I16ZextI64
        | I16SextI64 | I16ConvF64 | I32ZextI64 | I32SextI64 | I32ConvF64 | I64ConvF64
        | I64TruncI16 | I64TruncI32 | F64ConvI64 | I64Popcount | PtrCmpNullptr | I1Load
        | I8Load | I16Load | I32Load | I64Load | F64Load | I32Vec8Load | I32Vec8Broadcast
        | I1Vec8Mask => {
            let t2 = Type2(*instr);
            let v0 = resolve(t2.arg0(), value_map);
            *instr = Type2(*instr).with_arg0(v0);
        }

        // One value operand in the Type-3 arg slot.
        PtrCast | PtrLoad | ReturnValue | CallArg | GepDynamic | PtrMaterialize
        | CallIndirect | Alloca => {
            let t3 = Type3(*instr);
            let v = resolve(t3.arg(), value_map);
            *instr = Type3(*instr).with_arg(v);
        }

        CondBr => {
            let t5 = Type5(*instr);
            let v = resolve(t5.arg(), value_map);
            *instr = Type5(*instr).with_arg(v);
        }

        Call | Return | Br | FuncArg | GepStatic | Phi => {}
    }
}

/// Deletes dead blocks and renumbers the survivors contiguously, rewriting
/// branch labels and edge lists.
fn renumber(func: &mut Function, dead: &[bool]) {
    let n = func.blocks.len();
    let mut new_idx: HashMap<usize, usize> = HashMap::new();
    let mut next = 0usize;
    for i in 0..n {
        if !dead[i] {
            new_idx.insert(i, next);
            next += 1;
        }
    }

    let mut blocks: Vec<BasicBlockData> = Vec::with_capacity(next);
    for i in 0..n {
        if dead[i] {
            continue;
        }
        let mut block = std::mem::take(&mut func.blocks[i]);
        block.succ = block.succ.iter().filter_map(|s| new_idx.get(s).copied()).collect();
        block.pred = block.pred.iter().filter_map(|p| new_idx.get(p).copied()).collect();

        // Rewrite the terminator's labels.
        if let Some(last) = block.last_instr() {
            let instr = func.instrs[last];
            match Opcode::from_u8(opcode_of(instr)) {
                Opcode::Br => {
                    let target = new_idx[&Type5(instr).marg0()];
                    func.instrs[last] = Type5(instr).with_margs(target, 0);
                }
                Opcode::CondBr => {
                    let t5 = Type5(instr);
                    let t1 = new_idx[&t5.marg0()];
                    let t2 = new_idx[&t5.marg1()];
                    func.instrs[last] = Type5(instr).with_margs(t1, t2);
                }
                _ => {}
            }
        }
        blocks.push(block);
    }
    func.blocks = blocks;
}
