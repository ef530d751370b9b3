//! Live-interval computation
//!
//! Blocks are linearized in reverse post-order; positions are
//! `(block order index, instruction index)` pairs. Liveness is computed by
//! iterative backward dataflow so values live across loop back-edges cover
//! the whole loop in the linear order; phis are live from their block's
//! entry and each phi member extends the phi's interval into its
//! predecessor.

use hashbrown::{HashMap, HashSet};

use veld_ir::instruction::{opcode_of, value_operands, Type2};
use veld_ir::program::Function;
use veld_ir::types::Type;
use veld_ir::value::Value;
use veld_ir::{Opcode, Program};

/// Position in the linearized order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pos {
    pub bb: u32,
    pub idx: u32,
}

#[derive(Debug, Clone)]
pub struct LiveInterval {
    pub value: Value,
    pub ty: Type,
    pub start: Pos,
    pub end: Pos,
}

impl LiveInterval {
    fn extend(&mut self, pos: Pos) {
        if pos < self.start {
            self.start = pos;
        }
        if pos > self.end {
            self.end = pos;
        }
    }
}

pub struct LiveIntervalResult {
    /// Sorted by ascending start.
    pub intervals: Vec<LiveInterval>,
    /// Block execution order (reverse post-order); `order[i]` is a block id.
    pub order: Vec<usize>,
}

pub fn compute_live_intervals(program: &Program, func: &Function) -> LiveIntervalResult {
    let order = func.reverse_post_order();
    let mut order_pos: HashMap<usize, u32> = HashMap::new();
    for (i, &bb) in order.iter().enumerate() {
        order_pos.insert(bb, i as u32);
    }

    // Per-block upward-exposed uses and defs, on instruction values.
    let n = order.len();
    let mut uses: Vec<HashSet<u32>> = vec![HashSet::new(); n];
    let mut defs: Vec<HashSet<u32>> = vec![HashSet::new(); n];

    for (i, &bb) in order.iter().enumerate() {
        for instr_idx in func.blocks[bb].instr_indices() {
            let instr = func.instrs[instr_idx];
            for raw in value_operands(instr) {
                let v = Value::from_serialized(raw);
                if !v.is_constant_global() && !v.is_none() && !defs[i].contains(&raw) {
                    uses[i].insert(raw);
                }
            }
            // A phi member also uses (writes into) its phi.
            if Opcode::from_u8(opcode_of(instr)) == Opcode::PhiMember {
                let phi = Type2(instr).arg0();
                if !Value::from_serialized(phi).is_constant_global() && !defs[i].contains(&phi) {
                    uses[i].insert(phi);
                }
            }
            defs[i].insert(Value::instr(instr_idx as u32).serialize());
        }
    }

    // Backward dataflow to fixpoint.
    let mut live_in: Vec<HashSet<u32>> = vec![HashSet::new(); n];
    let mut live_out: Vec<HashSet<u32>> = vec![HashSet::new(); n];
    let mut changed = true;
    while changed {
        changed = false;
        for i in (0..n).rev() {
            let bb = order[i];
            let mut out: HashSet<u32> = HashSet::new();
            for &succ in &func.blocks[bb].succ {
                if let Some(&sp) = order_pos.get(&succ) {
                    out.extend(live_in[sp as usize].iter().copied());
                }
            }
            let mut inn = uses[i].clone();
            for &v in &out {
                if !defs[i].contains(&v) {
                    inn.insert(v);
                }
            }
            if out != live_out[i] || inn != live_in[i] {
                live_out[i] = out;
                live_in[i] = inn;
                changed = true;
            }
        }
    }

    // Build intervals over the linear order.
    let mut intervals: HashMap<u32, LiveInterval> = HashMap::new();
    let mut touch = |raw: u32, pos: Pos, program: &Program, func: &Function| {
        let v = Value::from_serialized(raw);
        intervals
            .entry(raw)
            .or_insert_with(|| LiveInterval {
                value: v,
                ty: program.type_of(func, v),
                start: pos,
                end: pos,
            })
            .extend(pos);
    };

    for (i, &bb) in order.iter().enumerate() {
        let block = &func.blocks[bb];
        let first = block.instr_indices().next();
        let last = block.last_instr();

        // Values live into the block cover its start; values live out cover
        // its end.
        if let (Some(first), Some(last)) = (first, last) {
            for &v in &live_in[i] {
                touch(v, Pos { bb: i as u32, idx: first as u32 }, program, func);
            }
            for &v in &live_out[i] {
                touch(v, Pos { bb: i as u32, idx: last as u32 }, program, func);
            }
        }

        let mut pending_call_args: Vec<u32> = Vec::new();
        for instr_idx in block.instr_indices() {
            let pos = Pos { bb: i as u32, idx: instr_idx as u32 };
            let instr = func.instrs[instr_idx];
            touch(Value::instr(instr_idx as u32).serialize(), pos, program, func);
            for raw in value_operands(instr) {
                let v = Value::from_serialized(raw);
                if !v.is_constant_global() && !v.is_none() {
                    touch(raw, pos, program, func);
                }
            }
            match Opcode::from_u8(opcode_of(instr)) {
                Opcode::PhiMember => {
                    let phi = Type2(instr).arg0();
                    if !Value::from_serialized(phi).is_constant_global() {
                        touch(phi, pos, program, func);
                    }
                }
                // A call consumes its whole CALL_ARG run, so each argument
                // stays live (in its position register) up to the call.
                Opcode::CallArg => {
                    pending_call_args.push(instr_idx as u32);
                }
                Opcode::Call | Opcode::CallIndirect => {
                    for arg in pending_call_args.drain(..) {
                        touch(Value::instr(arg).serialize(), pos, program, func);
                    }
                }
                _ => {}
            }
        }
    }

    // Void-typed results (stores, branches, offsets) never occupy a
    // register. Void calls stay: the allocator keys its argument-register
    // clobbering off the call's interval.
    let tm = &program.type_manager;
    let mut intervals: Vec<LiveInterval> = intervals
        .into_values()
        .filter(|iv| {
            if !tm.is_void(iv.ty) {
                return true;
            }
            let opcode = Opcode::from_u8(opcode_of(func.instrs[iv.value.idx()]));
            matches!(opcode, Opcode::Call | Opcode::CallIndirect)
        })
        .collect();
    intervals.sort_by_key(|iv| (iv.start, iv.end));

    LiveIntervalResult { intervals, order }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veld_ir::{CompType, ProgramBuilder};

    #[test]
    fn test_straight_line_intervals() {
        let mut b = ProgramBuilder::new();
        let i32_ty = b.i32_type();
        b.create_public_function(b.i32_type(), &[i32_ty, i32_ty], "f").unwrap();
        let args = b.get_function_arguments(b.current_function());
        let sum = b.add_i32(args[0], args[1]).unwrap();
        let doubled = b.add_i32(sum, sum).unwrap();
        b.ret_value(doubled).unwrap();

        let program = b.build();
        let func = program.function("f").unwrap();
        let result = compute_live_intervals(&program, func);

        let sum_iv = result
            .intervals
            .iter()
            .find(|iv| iv.value == sum)
            .expect("sum has an interval");
        assert_eq!(sum_iv.start.idx as usize, sum.idx());
        assert_eq!(sum_iv.end.idx as usize, doubled.idx());
    }

    #[test]
    fn test_loop_carried_value_covers_backedge() {
        let mut b = ProgramBuilder::new();
        let i32_ty = b.i32_type();
        b.create_public_function(b.void_type(), &[i32_ty], "f").unwrap();
        let bound = b.get_function_arguments(b.current_function())[0];

        let header = b.create_block();
        let body = b.create_block();
        let exit = b.create_block();

        let zero = b.const_i32(0);
        let m0 = b.phi_member(zero).unwrap();
        b.branch(header).unwrap();

        b.set_current_block(header).unwrap();
        let i = b.phi(i32_ty).unwrap();
        b.update_phi_member(i, m0);
        // `bound` is used in the header on every iteration.
        let cond = b.cmp_i32(CompType::Lt, i, bound).unwrap();
        b.cond_branch(cond, body, exit).unwrap();

        b.set_current_block(body).unwrap();
        let one = b.const_i32(1);
        let next = b.add_i32(i, one).unwrap();
        let m1 = b.phi_member(next).unwrap();
        b.update_phi_member(i, m1);
        b.branch(header).unwrap();

        b.set_current_block(exit).unwrap();
        b.ret().unwrap();

        let program = b.build();
        let func = program.function("f").unwrap();
        let result = compute_live_intervals(&program, func);

        // `bound` must stay live through the body block (the back-edge
        // returns to the header which reads it).
        let body_order_pos = result.order.iter().position(|&bb| bb == body).unwrap() as u32;
        let bound_iv = result.intervals.iter().find(|iv| iv.value == bound).unwrap();
        assert!(bound_iv.end.bb >= body_order_pos);

        // The phi's interval reaches its member in the body.
        let phi_iv = result.intervals.iter().find(|iv| iv.value == i).unwrap();
        assert!(phi_iv.end >= Pos { bb: body_order_pos, idx: m1.idx() as u32 });
    }
}
